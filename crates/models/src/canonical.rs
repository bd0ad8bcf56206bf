use super::{OutputFormat, RecordId};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Serializes a JSON tree in canonical form: object keys in lexical byte
/// order, arrays in iteration order, no whitespace, numbers in their
/// shortest round-trip form. The canonical form is a fixed point:
/// `canonical_json(parse(canonical_json(x))) == canonical_json(x)`.
///
/// Key ordering is explicit here; it must never lean on the serializer's
/// map iteration order.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders numbers via ryu/itoa, which is already the
        // shortest representation that round-trips.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("strings always serialize"))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i != 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("strings always serialize"));
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Idempotency hash of a single-template request:
/// `sha256( templateId | outputFormat | sha256(canonicalJson(data)) )`.
pub fn single_request_hash(
    template_id: &RecordId,
    output_format: OutputFormat,
    data: &serde_json::Value,
) -> String {
    let data_hash = sha256_hex(canonical_json(data).as_bytes());
    sha256_hex(format!("{template_id}|{}|{data_hash}", output_format.as_str()).as_bytes())
}

/// Idempotency hash of a composite request:
/// `sha256( compositeDocumentId | outputFormat | canonicalJson(recordIds) | sha256(canonicalJson(data)) )`.
/// `record_ids` is the caller-supplied seed map of driving record ids.
pub fn composite_request_hash(
    composite_id: &RecordId,
    output_format: OutputFormat,
    record_ids: &BTreeMap<String, Option<RecordId>>,
    data: &serde_json::Value,
) -> String {
    let ids_json = canonical_json(
        &serde_json::to_value(record_ids).expect("record-id maps always serialize"),
    );
    let data_hash = sha256_hex(canonical_json(data).as_bytes());
    sha256_hex(
        format!(
            "{composite_id}|{}|{ids_json}|{data_hash}",
            output_format.as_str()
        )
        .as_bytes(),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use serde_json::json;

    #[test]
    fn test_key_ordering_and_whitespace() {
        let value = json!({
            "zeta": [1, 2.5, -3],
            "alpha": {"b": null, "a": "x\"y"},
            "mid": true,
        });
        insta::assert_snapshot!(
            canonical_json(&value),
            @r#"{"alpha":{"a":"x\"y","b":null},"mid":true,"zeta":[1,2.5,-3]}"#
        );
    }

    #[test]
    fn test_hash_ignores_input_key_order() {
        let template_id: RecordId = "068A1234567890AQAA".parse().unwrap();
        let one = json!({"Account": {"Name": "Acme", "AnnualRevenue": 5}});
        let two = json!({"Account": {"AnnualRevenue": 5, "Name": "Acme"}});

        assert_eq!(
            single_request_hash(&template_id, OutputFormat::Pdf, &one),
            single_request_hash(&template_id, OutputFormat::Pdf, &two),
        );
        assert_ne!(
            single_request_hash(&template_id, OutputFormat::Pdf, &one),
            single_request_hash(&template_id, OutputFormat::Docx, &one),
            "output format participates in the hash",
        );
    }

    #[test]
    fn test_composite_hash_uses_seed_not_data_embedded_ids() {
        // A caller-supplied seed and an id that merely appears inside the
        // data tree are different requests: the record-id map participates
        // in the hash independently of the data hash.
        let composite_id: RecordId = "a0BA1234567890AQAA".parse().unwrap();
        let data = json!({"Account": {"AccountId": "001A1234567890AQAA", "Name": "Acme"}});

        let mut seeded = std::collections::BTreeMap::new();
        seeded.insert(
            "AccountId".to_string(),
            Some("001A1234567890AQAA".parse().unwrap()),
        );
        let unseeded = std::collections::BTreeMap::new();

        assert_ne!(
            composite_request_hash(&composite_id, OutputFormat::Pdf, &seeded, &data),
            composite_request_hash(&composite_id, OutputFormat::Pdf, &unseeded, &data),
        );
    }

    #[test]
    fn test_composite_hash_includes_record_ids() {
        let composite_id: RecordId = "a0BA1234567890AQAA".parse().unwrap();
        let data = json!({"Account": {"Name": "Acme"}});

        let mut ids = std::collections::BTreeMap::new();
        ids.insert(
            "AccountId".to_string(),
            Some("001A1234567890AQAA".parse().unwrap()),
        );
        let one = composite_request_hash(&composite_id, OutputFormat::Pdf, &ids, &data);

        ids.insert(
            "ContactId".to_string(),
            Some("003A1234567890AQAA".parse().unwrap()),
        );
        let two = composite_request_hash(&composite_id, OutputFormat::Pdf, &ids, &data);

        assert_ne!(one, two);
    }

    // Wrapper for generating arbitrary JSON trees of bounded depth.
    #[derive(Debug, Clone)]
    struct ArbJson(serde_json::Value);

    fn arbitrary_value(g: &mut Gen, depth: usize) -> serde_json::Value {
        let choice = if depth == 0 {
            u8::arbitrary(g) % 4
        } else {
            u8::arbitrary(g) % 6
        };
        match choice {
            0 => serde_json::Value::Null,
            1 => json!(bool::arbitrary(g)),
            2 => {
                if bool::arbitrary(g) {
                    json!(i64::arbitrary(g))
                } else {
                    // Finite floats only: NaN and infinities are not JSON.
                    let f = f64::arbitrary(g);
                    json!(if f.is_finite() { f } else { 0.0 })
                }
            }
            3 => json!(String::arbitrary(g)),
            4 => serde_json::Value::Array(
                (0..usize::arbitrary(g) % 4)
                    .map(|_| arbitrary_value(g, depth - 1))
                    .collect(),
            ),
            _ => serde_json::Value::Object(
                (0..usize::arbitrary(g) % 4)
                    .map(|_| (String::arbitrary(g), arbitrary_value(g, depth - 1)))
                    .collect(),
            ),
        }
    }

    impl Arbitrary for ArbJson {
        fn arbitrary(g: &mut Gen) -> Self {
            ArbJson(arbitrary_value(g, 3))
        }
    }

    #[quickcheck_macros::quickcheck]
    fn test_canonical_fixed_point(value: ArbJson) -> bool {
        let once = canonical_json(&value.0);
        let reparsed: serde_json::Value = serde_json::from_str(&once).unwrap();
        canonical_json(&reparsed) == once
    }
}
