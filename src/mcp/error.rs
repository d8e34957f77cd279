use std::fmt;
use thiserror::Error;

/// Which catalog a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Prompt => "prompt",
            CapabilityKind::Resource => "resource",
        };
        f.write_str(label)
    }
}

/// Errors raised by the MCP session and its transport.
///
/// Only [`McpError::Connection`], [`McpError::Protocol`] and
/// [`McpError::Transport`] are fatal to a session; the rest leave it usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum McpError {
    /// The server process could not be started or reached.
    #[error("Unable to start MCP server: {0}")]
    Connection(String),

    /// Handshake or framing violation.
    #[error("MCP protocol error: {0}")]
    Protocol(String),

    /// Unknown tool, prompt or resource name.
    #[error("Unknown MCP {kind} '{name}'")]
    NotFound { kind: CapabilityKind, name: String },

    /// Arguments do not satisfy the declared schema or parameter list.
    #[error("Invalid arguments: {0}")]
    Argument(String),

    /// I/O failure or timeout while talking to the server.
    #[error("MCP transport error: {0}")]
    Transport(String),

    /// The server answered with a JSON-RPC error object.
    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A call was made while the session was not ready.
    #[error("MCP session is {state}; reconnect to continue")]
    InvalidState { state: &'static str },
}

impl McpError {
    pub fn not_found(kind: CapabilityKind, name: impl Into<String>) -> Self {
        McpError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            McpError::Connection(_) | McpError::Protocol(_) | McpError::Transport(_)
        )
    }

    /// Errors the tool path folds into the conversation instead of aborting.
    pub fn is_recoverable_tool_failure(&self) -> bool {
        matches!(
            self,
            McpError::NotFound { .. } | McpError::Argument(_) | McpError::Rpc { .. }
        )
    }
}
