use super::RecordId;
use serde::{Deserialize, Serialize};

/// Where a template's data tree comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSourceKind {
    #[serde(rename = "SOQL")]
    Soql,
    Custom,
}

/// An admin-authored template record. The binary itself is immutable and
/// content-addressed by `template_binary_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    #[serde(rename = "Id")]
    pub id: RecordId,
    #[serde(rename = "DataSource__c")]
    pub data_source: DataSourceKind,
    #[serde(rename = "Query__c", default)]
    pub query: Option<String>,
    #[serde(rename = "ProviderClass__c", default)]
    pub provider_class: Option<String>,
    #[serde(rename = "PrimaryParentType__c", default)]
    pub primary_parent_type: Option<String>,
    #[serde(rename = "TemplateBinary__c")]
    pub template_binary_id: RecordId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompositeStrategy {
    OwnTemplate,
    ConcatenateTemplates,
}

/// An admin-configured multi-source assembly of templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeDocument {
    #[serde(rename = "Id")]
    pub id: RecordId,
    #[serde(rename = "Strategy__c")]
    pub strategy: CompositeStrategy,
    /// Required iff `strategy` is OWN_TEMPLATE.
    #[serde(rename = "TemplateBinary__c", default)]
    pub template_binary_id: Option<RecordId>,
    #[serde(rename = "IsActive__c", default)]
    pub is_active: bool,
    #[serde(rename = "PrimaryParentType__c", default)]
    pub primary_parent_type: Option<String>,
    #[serde(rename = "StoreMergedDocx__c", default)]
    pub store_merged_docx: bool,
    #[serde(rename = "ReturnDocxToClient__c", default)]
    pub return_docx_to_client: bool,
}

fn double_as_i64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let raw = f64::deserialize(d)?;
    Ok(raw as i64)
}

/// One (template, namespace, sequence) entry of a composite document.
/// Inactive slots are excluded from materialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeSlot {
    #[serde(rename = "Id")]
    pub id: RecordId,
    #[serde(rename = "Namespace__c")]
    pub namespace: String,
    #[serde(rename = "Sequence__c", deserialize_with = "double_as_i64")]
    pub sequence: i64,
    #[serde(rename = "Template__c")]
    pub template_id: RecordId,
    #[serde(rename = "IsActive__c", default)]
    pub is_active: bool,
}

/// Admin mapping of a parent object type to the tracking object's lookup
/// column for it. Artifacts are only linked to parents whose type appears
/// (active) in this set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedObject {
    #[serde(rename = "ObjectType__c")]
    pub object_type: String,
    #[serde(rename = "LookupField__c")]
    pub lookup_field: String,
    #[serde(rename = "IsActive__c", default)]
    pub is_active: bool,
    #[serde(rename = "DisplayOrder__c", default, deserialize_with = "double_as_opt_i64")]
    pub display_order: Option<i64>,
}

fn double_as_opt_i64<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let raw = Option::<f64>::deserialize(d)?;
    Ok(raw.map(|v| v as i64))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_template_record_from_store_shape() {
        let raw = serde_json::json!({
            "Id": "a01A1234567890AQAA",
            "DataSource__c": "SOQL",
            "Query__c": "SELECT Name FROM Account WHERE Id = :recordId",
            "PrimaryParentType__c": "Account",
            "TemplateBinary__c": "068A1234567890AQAA",
        });
        let template: TemplateRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(template.data_source, DataSourceKind::Soql);
        assert!(template.provider_class.is_none());
    }

    #[test]
    fn test_slot_sequence_is_a_double() {
        let raw = serde_json::json!({
            "Id": "a02A1234567890AQAA",
            "Namespace__c": "Terms",
            "Sequence__c": 20.0,
            "Template__c": "a01A1234567890AQAA",
            "IsActive__c": true,
        });
        let slot: CompositeSlot = serde_json::from_value(raw).unwrap();
        assert_eq!(slot.sequence, 20);
    }
}
