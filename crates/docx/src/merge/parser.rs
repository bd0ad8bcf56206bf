use super::MergeError;

/// A parsed template part: literal XML interleaved with directives.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Raw XML emitted verbatim.
    Literal(String),
    /// `{{path}}` substitution.
    Field(String),
    /// `{{= expr}}` inline expression.
    Expr(String),
    /// `{{image path}}`.
    Image(String),
    /// `{{#each path}} body {{/each}}`.
    Each { path: String, body: Vec<Node> },
    /// `{{#if expr}} then {{else}} otherwise {{/if}}`.
    If {
        cond: String,
        then_body: Vec<Node>,
        else_body: Vec<Node>,
    },
}

enum Frame {
    Each {
        path: String,
        body: Vec<Node>,
    },
    If {
        cond: String,
        then_body: Vec<Node>,
        in_else: bool,
        else_body: Vec<Node>,
    },
}

/// Parses coalesced XML into a node list. Block directives must nest
/// properly; violations are template-invalid.
pub fn parse(xml: &str) -> Result<Vec<Node>, MergeError> {
    let mut root = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut rest = xml;

    fn sink<'a>(root: &'a mut Vec<Node>, stack: &'a mut Vec<Frame>) -> &'a mut Vec<Node> {
        match stack.last_mut() {
            None => root,
            Some(Frame::Each { body, .. }) => body,
            Some(Frame::If {
                then_body,
                in_else: false,
                ..
            }) => then_body,
            Some(Frame::If { else_body, .. }) => else_body,
        }
    }

    while let Some(open) = rest.find("{{") {
        let close = rest[open..]
            .find("}}")
            .map(|p| open + p)
            .ok_or_else(|| MergeError::Template("unterminated {{ placeholder".to_string()))?;

        if open > 0 {
            sink(&mut root, &mut stack).push(Node::Literal(rest[..open].to_string()));
        }
        let directive = rest[open + 2..close].trim().to_string();
        rest = &rest[close + 2..];

        // Keyword directives are whitespace-delimited: a field which merely
        // starts with a keyword ({{imageUrl}}) stays a field.
        if let Some(path) = directive.strip_prefix("#each ") {
            let path = path.trim();
            if path.is_empty() {
                return Err(MergeError::Template("#each requires a path".to_string()));
            }
            stack.push(Frame::Each {
                path: path.to_string(),
                body: Vec::new(),
            });
        } else if let Some(cond) = directive.strip_prefix("#if ") {
            let cond = cond.trim();
            if cond.is_empty() {
                return Err(MergeError::Template("#if requires a condition".to_string()));
            }
            stack.push(Frame::If {
                cond: cond.to_string(),
                then_body: Vec::new(),
                in_else: false,
                else_body: Vec::new(),
            });
        } else if directive == "else" {
            match stack.last_mut() {
                Some(Frame::If { in_else, .. }) if !*in_else => *in_else = true,
                _ => {
                    return Err(MergeError::Template(
                        "{{else}} outside of an {{#if}} block".to_string(),
                    ))
                }
            }
        } else if directive == "/each" {
            match stack.pop() {
                Some(Frame::Each { path, body }) => {
                    sink(&mut root, &mut stack).push(Node::Each { path, body });
                }
                _ => {
                    return Err(MergeError::Template(
                        "{{/each}} without a matching {{#each}}".to_string(),
                    ))
                }
            }
        } else if directive == "/if" {
            match stack.pop() {
                Some(Frame::If {
                    cond,
                    then_body,
                    else_body,
                    ..
                }) => {
                    sink(&mut root, &mut stack).push(Node::If {
                        cond,
                        then_body,
                        else_body,
                    });
                }
                _ => {
                    return Err(MergeError::Template(
                        "{{/if}} without a matching {{#if}}".to_string(),
                    ))
                }
            }
        } else if let Some(expr) = directive.strip_prefix('=') {
            sink(&mut root, &mut stack).push(Node::Expr(expr.trim().to_string()));
        } else if let Some(path) = directive.strip_prefix("image ") {
            let path = path.trim();
            if path.is_empty() {
                return Err(MergeError::Template("image requires a path".to_string()));
            }
            sink(&mut root, &mut stack).push(Node::Image(path.to_string()));
        } else if directive.is_empty() {
            return Err(MergeError::Template("empty {{}} placeholder".to_string()));
        } else {
            sink(&mut root, &mut stack).push(Node::Field(directive));
        }
    }

    if let Some(frame) = stack.last() {
        let name = match frame {
            Frame::Each { .. } => "{{#each}}",
            Frame::If { .. } => "{{#if}}",
        };
        return Err(MergeError::Template(format!("unclosed {name} block")));
    }
    if !rest.is_empty() {
        root.push(Node::Literal(rest.to_string()));
    }
    Ok(root)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flat_fields_and_literals() {
        let nodes = parse("a {{X.Y}} b {{= 1 + 2}} c").unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::Literal("a ".to_string()),
                Node::Field("X.Y".to_string()),
                Node::Literal(" b ".to_string()),
                Node::Expr("1 + 2".to_string()),
                Node::Literal(" c".to_string()),
            ],
        );
    }

    #[test]
    fn test_nested_blocks() {
        let nodes =
            parse("{{#each Items}}{{#if this.Active}}{{this.Name}}{{else}}-{{/if}}{{/each}}")
                .unwrap();
        let Node::Each { path, body } = &nodes[0] else {
            panic!("expected each: {nodes:?}");
        };
        assert_eq!(path, "Items");
        assert!(matches!(&body[0], Node::If { .. }));
    }

    #[test]
    fn test_mismatched_close_fails() {
        assert!(parse("{{#each Items}}{{/if}}").is_err());
        assert!(parse("{{/each}}").is_err());
        assert!(parse("{{else}}").is_err());
        assert!(parse("{{#if x}}").is_err());
        assert!(parse("{{").is_err());
    }
}
