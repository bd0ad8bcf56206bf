use super::expr::{self, PathResolver};
use super::images::MediaSink;
use super::parser::Node;
use super::{MergeError, MergeOptions};
use serde_json::Value;
use std::time::Instant;

struct Frame<'a> {
    element: &'a Value,
    index: usize,
}

/// Resolution scope: the data tree plus a stack of loop frames. Bare paths
/// resolve innermost-frame first, then outward, then against the root;
/// `this` pins resolution to the current loop element.
struct Scope<'a> {
    root: &'a Value,
    options: &'a MergeOptions,
    frames: Vec<Frame<'a>>,
}

fn walk<'v>(node: &'v Value, segments: &[&str]) -> Option<&'v Value> {
    segments.iter().try_fold(node, |node, key| node.get(key))
}

impl<'a> Scope<'a> {
    fn lookup_ref(&self, path: &str) -> Option<&'a Value> {
        let segments: Vec<&str> = path.split('.').collect();

        if segments[0] == "this" {
            let frame = self.frames.last()?;
            return walk(frame.element, &segments[1..]);
        }
        for frame in self.frames.iter().rev() {
            if let Some(found) = walk(frame.element, &segments) {
                return Some(found);
            }
        }
        walk(self.root, &segments)
    }
}

impl PathResolver for Scope<'_> {
    fn resolve(&self, path: &str) -> Value {
        match path {
            "@index" => self
                .frames
                .last()
                .map(|f| Value::Number(f.index.into()))
                .unwrap_or(Value::Null),
            "@locale" => Value::String(self.options.locale.clone()),
            "@timezone" => Value::String(self.options.timezone.clone()),
            _ => self.lookup_ref(path).cloned().unwrap_or(Value::Null),
        }
    }
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn render(
    nodes: &[Node],
    data: &Value,
    options: &MergeOptions,
    media: &mut MediaSink<'_>,
) -> Result<String, MergeError> {
    let mut scope = Scope {
        root: data,
        options,
        frames: Vec::new(),
    };
    let mut out = String::new();
    render_nodes(nodes, &mut scope, options, media, &mut out)?;
    Ok(out)
}

fn render_nodes(
    nodes: &[Node],
    scope: &mut Scope<'_>,
    options: &MergeOptions,
    media: &mut MediaSink<'_>,
    out: &mut String,
) -> Result<(), MergeError> {
    for node in nodes {
        match node {
            Node::Literal(xml) => out.push_str(xml),
            Node::Field(path) => {
                let value = scope.resolve(path);
                out.push_str(&xml_escape(&expr::value_to_text(&value)));
            }
            Node::Expr(source) => {
                let deadline = Instant::now() + options.expression_timeout;
                let value = expr::evaluate(source, scope, deadline)
                    .map_err(|err| MergeError::Expression(format!("{source:?}: {err}")))?;
                out.push_str(&xml_escape(&expr::value_to_text(&value)));
            }
            Node::Image(path) => {
                let reference = expr::value_to_text(&scope.resolve(path));
                if reference.is_empty() {
                    continue; // Missing image data renders nothing.
                }
                let drawing = media.embed(&reference)?;
                out.push_str(&drawing);
            }
            Node::If {
                cond,
                then_body,
                else_body,
            } => {
                let deadline = Instant::now() + options.expression_timeout;
                let value = expr::evaluate(cond, scope, deadline)
                    .map_err(|err| MergeError::Expression(format!("{cond:?}: {err}")))?;
                let body = if expr::truthy(&value) {
                    then_body
                } else {
                    else_body
                };
                render_nodes(body, scope, options, media, out)?;
            }
            Node::Each { path, body } => match scope.lookup_ref(path) {
                None | Some(Value::Null) => (),
                Some(Value::Array(items)) => {
                    for (index, element) in items.iter().enumerate() {
                        scope.frames.push(Frame { element, index });
                        let result = render_nodes(body, scope, options, media, out);
                        scope.frames.pop();
                        result?;
                    }
                }
                Some(_) => {
                    return Err(MergeError::Template(format!(
                        "#each target {path:?} is not a list"
                    )));
                }
            },
        }
    }
    Ok(())
}
