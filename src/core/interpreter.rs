//! Extracts tool invocation directives from free-text model replies.
//!
//! A directive is a fenced block whose info string is `json` or
//! `tool_call` (optionally followed by the grammar version `v1`) and whose
//! body is a JSON array holding exactly one object:
//!
//! ````text
//! ```json
//! [{"name": "weather_tool", "arguments": {"city": "Austin"}}]
//! ```
//! ````
//!
//! The legacy form carries only the arguments (`[{"city": "Austin"}]`) and
//! targets the interpreter's default tool. Fences with any other info string
//! are prose. Interpretation never fails: anything that looks like a
//! directive but does not parse is reported as [`Interpretation::Malformed`].

use crate::core::message::InvocationRequest;
use memchr::memmem;
use serde_json::Value;
use tracing::{debug, warn};

const FENCE: &str = "```";
pub const DIRECTIVE_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq)]
pub enum Interpretation {
    /// Ordinary prose; returned to the user unchanged.
    Text(String),
    Invocation(InvocationRequest),
    /// Something directive-shaped that failed to parse. Treated as text downstream.
    Malformed { text: String, reason: String },
}

impl Interpretation {
    pub fn invocation(&self) -> Option<&InvocationRequest> {
        match self {
            Interpretation::Invocation(request) => Some(request),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseInterpreter {
    default_tool: Option<String>,
}

struct FencedBlock<'a> {
    info: &'a str,
    /// `None` when the info string is not followed by a newline.
    body: Option<&'a str>,
    terminated: bool,
}

enum DirectiveKind {
    Directive,
    Prose,
    Unsupported(String),
}

impl ResponseInterpreter {
    pub fn new(default_tool: Option<String>) -> Self {
        Self { default_tool }
    }

    pub fn interpret(&self, reply: &str) -> Interpretation {
        let mut directives = Vec::new();
        for block in fenced_blocks(reply) {
            match classify(block.info) {
                DirectiveKind::Prose => {}
                DirectiveKind::Unsupported(reason) => {
                    return self.malformed(reply, reason);
                }
                DirectiveKind::Directive => directives.push(block),
            }
        }

        let block = match directives.as_slice() {
            [] => return Interpretation::Text(reply.to_string()),
            [block] => block,
            many => {
                return self.malformed(
                    reply,
                    format!("expected one directive block, found {}", many.len()),
                )
            }
        };

        if !block.terminated {
            return self.malformed(reply, "unterminated directive block".to_string());
        }
        let Some(body) = block.body else {
            return self.malformed(
                reply,
                "directive body must start on the line after the fence".to_string(),
            );
        };

        match self.parse_body(body) {
            Ok(request) => {
                debug!(tool = %request.name, "Model reply carries a tool directive");
                Interpretation::Invocation(request)
            }
            Err(reason) => self.malformed(reply, reason),
        }
    }

    fn malformed(&self, reply: &str, reason: String) -> Interpretation {
        warn!(reason = %reason, "Ignoring malformed tool directive in model reply");
        Interpretation::Malformed {
            text: reply.to_string(),
            reason,
        }
    }

    fn parse_body(&self, body: &str) -> Result<InvocationRequest, String> {
        let value: Value = serde_json::from_str(body.trim())
            .map_err(|err| format!("directive body is not valid JSON: {err}"))?;
        let Value::Array(mut items) = value else {
            return Err("directive body must be a JSON array".to_string());
        };
        if items.len() != 1 {
            return Err(format!(
                "directive array must hold exactly one object, found {}",
                items.len()
            ));
        }
        let Some(Value::Object(mut object)) = items.pop() else {
            return Err("directive array element must be an object".to_string());
        };

        let explicit = object.len() == 2
            && matches!(object.get("name"), Some(Value::String(_)))
            && matches!(object.get("arguments"), Some(Value::Object(_)));
        if explicit {
            let (Some(Value::String(name)), Some(Value::Object(arguments))) =
                (object.remove("name"), object.remove("arguments"))
            else {
                return Err("directive object is missing name or arguments".to_string());
            };
            if name.trim().is_empty() {
                return Err("directive names an empty tool".to_string());
            }
            return Ok(InvocationRequest::new(name, arguments));
        }

        match self.default_tool.as_deref() {
            Some(tool) => Ok(InvocationRequest::new(tool, object)),
            None => Err("directive names no tool and no default tool is available".to_string()),
        }
    }
}

fn classify(info: &str) -> DirectiveKind {
    let mut tokens = info.split_whitespace();
    let Some(first) = tokens.next() else {
        return DirectiveKind::Prose;
    };
    match first.to_ascii_lowercase().as_str() {
        // Anything after `json` is a same-line body, still directive-shaped.
        "json" => DirectiveKind::Directive,
        "tool_call" => match tokens.next() {
            None => DirectiveKind::Directive,
            Some(version) if version.eq_ignore_ascii_case(DIRECTIVE_VERSION) => {
                DirectiveKind::Directive
            }
            Some(version) => {
                DirectiveKind::Unsupported(format!("unsupported directive version '{version}'"))
            }
        },
        _ => DirectiveKind::Prose,
    }
}

/// Splits `text` into fenced blocks by pairing successive fence markers.
fn fenced_blocks(text: &str) -> Vec<FencedBlock<'_>> {
    let finder = memmem::Finder::new(FENCE);
    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = finder.find(&text.as_bytes()[cursor..]) {
        let open = cursor + offset + FENCE.len();
        let rest = &text[open..];
        let close = finder.find(rest.as_bytes());
        let inner = match close {
            Some(end) => &rest[..end],
            None => rest,
        };

        let (info, body) = match inner.find('\n') {
            Some(newline) => (
                inner[..newline].trim_end_matches('\r'),
                Some(&inner[newline + 1..]),
            ),
            None => (inner, None),
        };

        blocks.push(FencedBlock {
            info,
            body,
            terminated: close.is_some(),
        });

        match close {
            Some(end) => cursor = open + end + FENCE.len(),
            None => break,
        }
    }
    blocks
}
