//! Scripted MCP servers for session and orchestrator tests.

use crate::mcp::error::McpError;
use crate::mcp::transport::{McpTransport, StdioTransport};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient, ServerMessage,
};
use rust_mcp_schema::{RequestId, LATEST_PROTOCOL_VERSION};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// How a scripted server answers one request.
pub enum FakeReply {
    Result(Value),
    Error { code: i64, message: String },
    /// Never answers; the caller's timeout fires.
    Silent,
    /// Drops the connection without answering.
    Hangup,
}

pub type Handler = Arc<dyn Fn(&str, &Value) -> FakeReply + Send + Sync>;

/// In-process transport that records every method it is asked to send.
pub struct ScriptedTransport {
    handler: Handler,
    log: Arc<Mutex<Vec<String>>>,
    closed: AtomicBool,
    close_calls: Arc<AtomicUsize>,
}

/// Shared view of what a [`ScriptedTransport`] has seen.
#[derive(Clone)]
pub struct TransportProbe {
    log: Arc<Mutex<Vec<String>>>,
    close_calls: Arc<AtomicUsize>,
}

impl TransportProbe {
    pub fn methods(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn count(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| m.as_str() == method).count()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl ScriptedTransport {
    pub fn new(handler: Handler) -> (Self, TransportProbe) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let close_calls = Arc::new(AtomicUsize::new(0));
        let probe = TransportProbe {
            log: log.clone(),
            close_calls: close_calls.clone(),
        };
        (
            Self {
                handler,
                log,
                closed: AtomicBool::new(false),
                close_calls,
            },
            probe,
        )
    }

    fn record(&self, method: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.push(method.to_string());
        }
    }
}

fn request_parts(request: RequestFromClient) -> (String, Value) {
    let message = ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(RequestId::Integer(0)),
    )
    .expect("client message");
    let value = serde_json::to_value(&message).expect("serialize request");
    let method = value["method"].as_str().unwrap_or_default().to_string();
    (method, value.get("params").cloned().unwrap_or(Value::Null))
}

fn reply_frame(id: &Value, reply: &FakeReply) -> Option<Value> {
    match reply {
        FakeReply::Result(result) => Some(json!({"jsonrpc": "2.0", "id": id, "result": result})),
        FakeReply::Error { code, message } => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        })),
        FakeReply::Silent | FakeReply::Hangup => None,
    }
}

#[async_trait]
impl McpTransport for ScriptedTransport {
    async fn send_request(
        &self,
        request: RequestFromClient,
        _timeout: Duration,
    ) -> Result<ServerMessage, McpError> {
        if self.is_closed() {
            return Err(McpError::Transport("closed".into()));
        }
        let (method, params) = request_parts(request);
        self.record(&method);
        let reply = (self.handler)(&method, &params);
        match reply_frame(&json!(1), &reply) {
            Some(frame) => Ok(serde_json::from_value(frame).expect("server message")),
            None => {
                if matches!(reply, FakeReply::Hangup) {
                    self.closed.store(true, Ordering::SeqCst);
                    Err(McpError::Transport(
                        "MCP server closed the connection.".into(),
                    ))
                } else {
                    Err(McpError::Transport("MCP request timed out.".into()))
                }
            }
        }
    }

    async fn send_notification(
        &self,
        _notification: NotificationFromClient,
    ) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::Transport("closed".into()));
        }
        self.record("notifications/initialized");
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Runs `handler` behind a real [`StdioTransport`] over an in-memory pipe.
pub fn spawn_duplex_server(handler: Handler) -> StdioTransport {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let transport = StdioTransport::from_streams("fake", client_read, client_write);

    tokio::spawn(async move {
        let (server_read, mut server_write) = tokio::io::split(server_io);
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let Some(id) = message.get("id").cloned() else {
                continue;
            };
            // Replies to our own server-side requests carry no method.
            let Some(method) = message.get("method").and_then(Value::as_str) else {
                continue;
            };
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let reply = handler(method, &params);
            if matches!(reply, FakeReply::Hangup) {
                break;
            }
            if let Some(frame) = reply_frame(&id, &reply) {
                if server_write
                    .write_all(format!("{frame}\n").as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });

    transport
}

pub fn weather_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"city": {"type": "string"}},
        "required": ["city"]
    })
}

/// Weather demo server: one tool, a system prompt, a follow-up prompt and an echo resource.
pub fn weather_server() -> Handler {
    weather_server_with(|_, _| None)
}

/// Weather server whose answers can be overridden per method.
pub fn weather_server_with<F>(overrides: F) -> Handler
where
    F: Fn(&str, &Value) -> Option<FakeReply> + Send + Sync + 'static,
{
    Arc::new(move |method, params| {
        if let Some(reply) = overrides(method, params) {
            return reply;
        }
        weather_reply(method, params)
    })
}

fn text_result(text: &str) -> FakeReply {
    FakeReply::Result(json!({"content": [{"type": "text", "text": text}], "isError": false}))
}

fn weather_reply(method: &str, params: &Value) -> FakeReply {
    match method {
        "initialize" => FakeReply::Result(json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {"tools": {}, "prompts": {}, "resources": {}},
            "serverInfo": {"name": "weather", "version": "0.1.0"}
        })),
        "tools/list" => FakeReply::Result(json!({
            "tools": [{
                "name": "weather_tool",
                "description": "Look up the current weather for a city",
                "inputSchema": weather_tool_schema()
            }]
        })),
        "prompts/list" => FakeReply::Result(json!({
            "prompts": [
                {"name": "weather_prompt", "description": "System prompt", "arguments": []},
                {
                    "name": "weather_response_prompt",
                    "arguments": [
                        {"name": "city", "required": true},
                        {"name": "weather", "required": true}
                    ]
                }
            ]
        })),
        "resources/list" => FakeReply::Result(json!({
            "resources": [{"uri": "echo://hello", "name": "hello", "mimeType": "text/plain"}]
        })),
        "resources/templates/list" => FakeReply::Result(json!({
            "resourceTemplates": [{"uriTemplate": "echo://{message}", "name": "echo"}]
        })),
        "prompts/get" => {
            let name = params["name"].as_str().unwrap_or_default();
            let text = match name {
                "weather_prompt" => "You can call weather_tool. To use it reply only with ```json [{\"name\": \"weather_tool\", \"arguments\": {\"city\": \"<city>\"}}] ```".to_string(),
                "weather_response_prompt" => format!(
                    "The weather in {} is {}. Answer the user in one sentence.",
                    params["arguments"]["city"].as_str().unwrap_or("?"),
                    params["arguments"]["weather"].as_str().unwrap_or("?")
                ),
                _ => {
                    return FakeReply::Error {
                        code: -32602,
                        message: format!("Unknown prompt: {name}"),
                    }
                }
            };
            FakeReply::Result(json!({
                "messages": [{"role": "user", "content": {"type": "text", "text": text}}]
            }))
        }
        "tools/call" => {
            let city = params["arguments"]["city"].as_str().unwrap_or_default();
            if city.eq_ignore_ascii_case("austin") {
                text_result("sunny")
            } else {
                text_result("cloudy")
            }
        }
        "resources/read" => {
            let uri = params["uri"].as_str().unwrap_or_default();
            let message = uri.strip_prefix("echo://").unwrap_or(uri);
            FakeReply::Result(json!({
                "contents": [{"uri": uri, "mimeType": "text/plain", "text": format!("Resource echo: {message}")}]
            }))
        }
        _ => FakeReply::Error {
            code: -32601,
            message: format!("Method not found: {method}"),
        },
    }
}
