/// Escapes a string for inclusion as a single-quoted SOQL literal.
pub fn quote_literal(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('\'');
    for c in raw.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Substitutes a named `:parameter` in a templated query with a quoted
/// literal. Parameters are word-delimited; `:recordId` does not match
/// `:recordIdTwo`. Identifiers are never substituted, only values.
pub fn bind(query: &str, parameter: &str, value: &str) -> String {
    let needle = format!(":{parameter}");
    let quoted = quote_literal(value);

    let mut out = String::with_capacity(query.len() + quoted.len());
    let mut rest = query;
    while let Some(at) = rest.find(&needle) {
        let after = rest[at + needle.len()..].chars().next();
        let is_boundary = !matches!(after, Some(c) if c.is_ascii_alphanumeric() || c == '_');

        out.push_str(&rest[..at]);
        if is_boundary {
            out.push_str(&quoted);
        } else {
            out.push_str(&needle);
        }
        rest = &rest[at + needle.len()..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_quoting_escapes() {
        assert_eq!(quote_literal("001X"), "'001X'");
        assert_eq!(quote_literal("O'Brien"), r"'O\'Brien'");
        assert_eq!(quote_literal(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn test_bind_is_word_delimited() {
        let query = "SELECT Name FROM Account WHERE Id = :recordId AND Owner = :recordIdTwo";
        let bound = bind(query, "recordId", "001X");
        assert_eq!(
            bound,
            "SELECT Name FROM Account WHERE Id = '001X' AND Owner = :recordIdTwo"
        );
    }

    #[test]
    fn test_bind_replaces_every_occurrence() {
        let query = "WHERE AccountId = :recordId OR Id = :recordId";
        assert_eq!(
            bind(query, "recordId", "001X"),
            "WHERE AccountId = '001X' OR Id = '001X'"
        );
    }

    #[test]
    fn test_bind_defuses_injection() {
        let bound = bind(
            "WHERE Id = :recordId",
            "recordId",
            "x' OR Name != 'never",
        );
        assert_eq!(bound, r"WHERE Id = 'x\' OR Name != \'never'");
    }
}
