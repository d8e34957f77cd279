use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TurnRole {
    User,
    Assistant,
    ToolResult,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::ToolResult => "tool",
        }
    }
}

impl TryFrom<&str> for TurnRole {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(TurnRole::User),
            "assistant" => Ok(TurnRole::Assistant),
            "tool" => Ok(TurnRole::ToolResult),
            _ => Err(format!("invalid turn role: {value}")),
        }
    }
}

impl TryFrom<String> for TurnRole {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<TurnRole> for String {
    fn from(value: TurnRole) -> Self {
        value.as_str().to_string()
    }
}

/// A tool name plus its argument mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl InvocationRequest {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }

    /// Argument value rendered as prompt text: strings verbatim, everything else as JSON.
    pub fn argument_text(&self, key: &str) -> Option<String> {
        self.arguments.get(key).map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationErrorKind {
    /// The tool is not in the catalog.
    NotFound,
    /// Arguments were rejected before dispatch.
    Argument,
    /// The server ran the tool and reported a failure.
    Tool,
    /// The server answered the call with a JSON-RPC error.
    Rpc,
}

impl fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InvocationErrorKind::NotFound => "not found",
            InvocationErrorKind::Argument => "invalid arguments",
            InvocationErrorKind::Tool => "tool error",
            InvocationErrorKind::Rpc => "rpc error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationResult {
    Ok(String),
    Err {
        kind: InvocationErrorKind,
        message: String,
    },
}

impl InvocationResult {
    pub fn error(kind: InvocationErrorKind, message: impl Into<String>) -> Self {
        InvocationResult::Err {
            kind,
            message: message.into(),
        }
    }

    /// Text handed back to the model for the follow-up turn.
    pub fn model_text(&self) -> String {
        match self {
            InvocationResult::Ok(content) => content.clone(),
            InvocationResult::Err { kind, message } => format!("Error ({kind}): {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnContent {
    Text(String),
    FunctionCall(InvocationRequest),
    FunctionResult { name: String, result: String },
}

/// One entry of the per-exchange conversation state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: TurnContent,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn function_call(request: InvocationRequest) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: TurnContent::FunctionCall(request),
        }
    }

    pub fn function_result(name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            role: TurnRole::ToolResult,
            content: TurnContent::FunctionResult {
                name: name.into(),
                result: result.into(),
            },
        }
    }

    /// Flattens the turn for backends without structured function messages.
    pub fn plain_text(&self) -> String {
        match &self.content {
            TurnContent::Text(text) => text.clone(),
            TurnContent::FunctionCall(request) => serde_json::to_string(&[request])
                .map(|body| format!("```json\n{body}\n```"))
                .unwrap_or_else(|_| request.name.clone()),
            TurnContent::FunctionResult { name, result } => {
                format!("Result of {name}: {result}")
            }
        }
    }
}
