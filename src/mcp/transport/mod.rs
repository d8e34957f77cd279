//! Transport layer for MCP sessions.
//!
//! A transport moves newline-delimited JSON-RPC frames between the session
//! client and a capability server. It owns the server process (if any) and
//! must release it on [`McpTransport::close`], which is idempotent.

use crate::mcp::error::McpError;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use std::time::Duration;

pub mod stdio;

pub use stdio::StdioTransport;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

#[async_trait]
/// Byte-stream contract required by [`crate::mcp::client::McpSession`].
pub trait McpTransport: Send + Sync {
    /// Sends a request and waits up to `timeout` for the matching response.
    async fn send_request(
        &self,
        request: RequestFromClient,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError>;

    async fn send_notification(&self, notification: NotificationFromClient)
        -> Result<(), McpError>;

    /// Terminates the peer and releases all handles. Safe to call repeatedly.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}
