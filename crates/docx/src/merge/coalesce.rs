//! Word freely splits literal text across runs, so a placeholder typed as
//! `{{Account.Name}}` frequently arrives as several `<w:r>` fragments, with
//! tags between any two characters. This pass rejoins placeholder spans by
//! dropping every tag found strictly inside `{{ ... }}` (including tags
//! between the two brace characters themselves), leaving all other markup
//! untouched.

/// Returns the next non-tag character at or after `at`, with the position
/// just past it, skipping over complete `<...>` tags.
fn next_char_skipping_tags(bytes: &[u8], mut at: usize) -> Option<(u8, usize)> {
    while at < bytes.len() {
        if bytes[at] == b'<' {
            let close = bytes[at..].iter().position(|&b| b == b'>')?;
            at += close + 1;
        } else {
            return Some((bytes[at], at + 1));
        }
    }
    None
}

pub fn coalesce_placeholders(xml: &str) -> String {
    let bytes = xml.as_bytes();
    let mut out = String::with_capacity(xml.len());
    let mut at = 0;

    while at < bytes.len() {
        if bytes[at] != b'{' {
            // Copy through the next tag or literal chunk unchanged.
            let next = bytes[at..]
                .iter()
                .position(|&b| b == b'{')
                .map(|p| at + p)
                .unwrap_or(bytes.len());
            out.push_str(&xml[at..next]);
            at = next;
            continue;
        }

        // A '{': does a second one follow, possibly across tags?
        match next_char_skipping_tags(bytes, at + 1) {
            Some((b'{', after_open)) => {
                // Inside a placeholder: gather bytes, dropping tags, until
                // the matching "}}". Multi-byte characters pass through as
                // their raw bytes.
                let mut directive = Vec::new();
                let mut cursor = after_open;
                let mut closed = false;
                while let Some((c, next)) = next_char_skipping_tags(bytes, cursor) {
                    if c == b'}' {
                        if let Some((b'}', after_close)) = next_char_skipping_tags(bytes, next) {
                            out.push_str("{{");
                            out.push_str(&String::from_utf8_lossy(&directive));
                            out.push_str("}}");
                            at = after_close;
                            closed = true;
                            break;
                        }
                    }
                    directive.push(c);
                    cursor = next;
                }
                if closed {
                    continue;
                }
                // No closing braces; emit the rest verbatim.
                out.push_str(&xml[at..]);
                at = bytes.len();
            }
            _ => {
                out.push('{');
                at += 1;
            }
        }
    }
    out
}
