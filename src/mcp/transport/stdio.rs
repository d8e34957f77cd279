use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;
use crate::mcp::transport::{McpTransport, MCP_METHOD_NOT_FOUND};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient, ServerMessage,
};
use rust_mcp_schema::{RequestId, RpcError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE_DEPTH: usize = 64;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub fn require_stdio_command(config: &McpServerConfig) -> Result<String, McpError> {
    config
        .command
        .clone()
        .filter(|command| !command.trim().is_empty())
        .ok_or_else(|| McpError::Connection("MCP command is required for stdio transport.".into()))
}

pub fn stdio_args(config: &McpServerConfig) -> Vec<String> {
    config.args.clone().unwrap_or_default()
}

pub fn stdio_env(config: &McpServerConfig) -> Option<HashMap<String, String>> {
    config.env.clone()
}

/// Newline-delimited JSON-RPC over a child process (or any byte stream pair).
///
/// Frames are written by a single writer task so a cancelled caller can never
/// leave a half-written line on the wire.
pub struct StdioTransport {
    server_id: String,
    outbound: mpsc::Sender<String>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    closed: Arc<AtomicBool>,
    activity_notify: Arc<Notify>,
    shutdown: CancellationToken,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    /// Launches the configured server command with piped stdio.
    pub fn spawn(config: &McpServerConfig) -> Result<Self, McpError> {
        let command = require_stdio_command(config)?;
        let args = stdio_args(config);
        debug!(server_id = %config.id, command = %command, args = ?args, "Starting MCP stdio server");
        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(env) = stdio_env(config) {
            cmd.envs(env);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| McpError::Connection(format!("{command}: {err}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Connection("Unable to retrieve stdin.".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Connection("Unable to retrieve stdout.".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::Connection("Unable to retrieve stderr.".into()))?;

        Self::spawn_stderr_drain(config.id.clone(), stderr);
        Ok(Self::build(config.id.clone(), stdout, stdin, Some(child)))
    }

    /// Wraps an existing reader/writer pair, e.g. one end of `tokio::io::duplex`.
    pub fn from_streams<R, W>(server_id: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::build(server_id.into(), reader, writer, None)
    }

    fn build<R, W>(server_id: String, reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let activity_notify = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        Self::spawn_writer(
            server_id.clone(),
            writer,
            outbound_rx,
            pending.clone(),
            closed.clone(),
            shutdown.clone(),
        );
        Self::spawn_reader(
            server_id.clone(),
            reader,
            outbound.clone(),
            pending.clone(),
            closed.clone(),
            activity_notify.clone(),
            shutdown.clone(),
        );

        Self {
            server_id,
            outbound,
            pending,
            next_request_id: AtomicI64::new(0),
            closed,
            activity_notify,
            shutdown,
            child: Mutex::new(child),
        }
    }

    fn spawn_writer<W>(
        server_id: String,
        mut writer: W,
        mut outbound_rx: mpsc::Receiver<String>,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = outbound_rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                let written = tokio::time::timeout(WRITE_TIMEOUT, write_frame(&mut writer, &frame))
                    .await
                    .map_err(|_| "timed out writing frame".to_string())
                    .and_then(|result| result.map_err(|err| err.to_string()));
                if let Err(err) = written {
                    warn!(server_id = %server_id, error = %err, "MCP stdio write failed");
                    mark_closed(&closed, &pending).await;
                    break;
                }
                debug!(server_id = %server_id, bytes = frame.len(), "MCP stdio frame written");
            }
            let _ = writer.shutdown().await;
        });
    }

    fn spawn_reader<R>(
        server_id: String,
        reader: R,
        outbound: mpsc::Sender<String>,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
        activity_notify: Arc<Notify>,
        shutdown: CancellationToken,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        let value = match serde_json::from_str::<Value>(&line) {
                            Ok(value) => value,
                            Err(err) => {
                                debug!(server_id = %server_id, error = %err, "Skipping non-JSON line from MCP server");
                                continue;
                            }
                        };
                        let items = match value {
                            Value::Array(items) => items,
                            other => vec![other],
                        };
                        for item in items {
                            match serde_json::from_value::<ServerMessage>(item) {
                                Ok(message) => {
                                    Self::dispatch_message(
                                        &server_id,
                                        message,
                                        &pending,
                                        &outbound,
                                        &activity_notify,
                                    )
                                    .await
                                }
                                Err(err) => {
                                    debug!(server_id = %server_id, error = %err, "Unrecognized MCP message")
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(server_id = %server_id, "MCP server closed stdout");
                        break;
                    }
                    Err(err) => {
                        warn!(server_id = %server_id, error = %err, "MCP stdio read failed");
                        break;
                    }
                }
            }
            mark_closed(&closed, &pending).await;
        });
    }

    fn spawn_stderr_drain(server_id: String, stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(server_id = %server_id, "mcp stderr: {line}");
            }
        });
    }

    async fn dispatch_message(
        server_id: &str,
        message: ServerMessage,
        pending: &PendingMap,
        outbound: &mpsc::Sender<String>,
        activity_notify: &Notify,
    ) {
        match &message {
            ServerMessage::Response(response) => {
                debug!(
                    server_id = %server_id,
                    response_id = ?response.id,
                    "Received MCP stdio response"
                );
                let waiter = pending.lock().await.remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => debug!(server_id = %server_id, "Dropping response with unknown id"),
                }
            }
            ServerMessage::Error(error) => {
                debug!(
                    server_id = %server_id,
                    error_id = ?error.id,
                    error_code = error.error.code,
                    "Received MCP stdio error"
                );
                match error.id.as_ref() {
                    Some(id) => {
                        if let Some(tx) = pending.lock().await.remove(id) {
                            let _ = tx.send(message);
                        }
                    }
                    None => warn!(
                        server_id = %server_id,
                        message = %error.error.message,
                        "MCP server reported an error without a request id"
                    ),
                }
            }
            ServerMessage::Request(request) => {
                let method = request.method().to_string();
                let request_id = request.request_id().clone();
                debug!(
                    server_id = %server_id,
                    method = %method,
                    request_id = ?request_id,
                    "Received MCP stdio request"
                );
                activity_notify.notify_waiters();
                let reply = if method == "ping" {
                    ping_reply(&request_id)
                } else {
                    unsupported_request_reply(request_id, &method)
                };
                match reply {
                    Ok(frame) => {
                        let _ = outbound.send(frame).await;
                    }
                    Err(err) => {
                        warn!(server_id = %server_id, error = %err, "Unable to answer MCP server request")
                    }
                }
            }
            ServerMessage::Notification(_) => {
                debug!(server_id = %server_id, "Received MCP stdio notification");
                activity_notify.notify_waiters();
            }
        }
    }

    fn next_request_id(&self) -> RequestId {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        RequestId::Integer(id)
    }

    fn closed_error() -> McpError {
        McpError::Transport("MCP server connection is closed.".into())
    }

    async fn enqueue(&self, payload: String) -> Result<(), McpError> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| McpError::Transport("MCP stdio writer stopped.".into()))
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(
        &self,
        request: RequestFromClient,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| McpError::Protocol(err.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        let _entry = PendingEntry {
            pending: self.pending.clone(),
            id: request_id.clone(),
        };
        // The reader flips `closed` before it drains the pending map.
        if self.is_closed() {
            return Err(Self::closed_error());
        }

        debug!(server_id = %self.server_id, request_id = ?request_id, bytes = payload.len(), "Sending MCP stdio request");
        self.enqueue(payload).await?;

        let mut deadline = tokio::time::Instant::now() + timeout;
        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                result = &mut rx => {
                    return match result {
                        Ok(message) => {
                            debug!(request_id = ?request_id, "MCP stdio response received");
                            Ok(message)
                        }
                        Err(_) => {
                            debug!(request_id = ?request_id, "MCP stdio response channel closed");
                            Err(McpError::Transport("MCP server closed the connection.".into()))
                        }
                    };
                }
                _ = tokio::time::sleep(deadline - now) => break,
                _ = self.activity_notify.notified() => {
                    debug!(request_id = ?request_id, "MCP stdio timeout reset after server activity");
                    deadline = tokio::time::Instant::now() + timeout;
                }
            }
        }

        debug!(request_id = ?request_id, timeout_ms = timeout.as_millis(), "MCP stdio request timed out");
        Err(McpError::Transport(format!(
            "MCP request timed out after {} ms.",
            timeout.as_millis()
        )))
    }

    async fn send_notification(
        &self,
        notification: NotificationFromClient,
    ) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;
        let payload =
            serde_json::to_string(&message).map_err(|err| McpError::Protocol(err.to_string()))?;
        debug!(server_id = %self.server_id, bytes = payload.len(), "Sending MCP stdio notification");
        self.enqueue(payload).await
    }

    async fn close(&self) {
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.pending.lock().await.clear();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(err) = child.start_kill() {
                debug!(server_id = %self.server_id, error = %err, "MCP server already exited");
            }
            match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server_id = %self.server_id, status = %status, "MCP server exited")
                }
                Ok(Err(err)) => {
                    warn!(server_id = %self.server_id, error = %err, "Failed to reap MCP server")
                }
                Err(_) => warn!(server_id = %self.server_id, "MCP server did not exit in time"),
            }
        }
        if !was_closed {
            debug!(server_id = %self.server_id, "MCP stdio transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn write_frame<W>(writer: &mut W, frame: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Removes a request's waiter when its caller finishes or is dropped.
struct PendingEntry {
    pending: PendingMap,
    id: RequestId,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.remove(&self.id);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pending = self.pending.clone();
            let id = self.id.clone();
            handle.spawn(async move {
                pending.lock().await.remove(&id);
            });
        }
    }
}

async fn mark_closed(closed: &AtomicBool, pending: &PendingMap) {
    closed.store(true, Ordering::SeqCst);
    pending.lock().await.clear();
}

fn ping_reply(request_id: &RequestId) -> Result<String, String> {
    let id = serde_json::to_value(request_id).map_err(|err| err.to_string())?;
    serde_json::to_string(&json!({ "jsonrpc": "2.0", "id": id, "result": {} }))
        .map_err(|err| err.to_string())
}

fn unsupported_request_reply(request_id: RequestId, method: &str) -> Result<String, String> {
    let error = RpcError {
        code: MCP_METHOD_NOT_FOUND,
        message: format!("Client does not support '{method}' requests."),
        data: None,
    };
    let message = ClientMessage::from_message(MessageFromClient::Error(error), Some(request_id))
        .map_err(|err| err.to_string())?;
    serde_json::to_string(&message).map_err(|err| err.to_string())
}
