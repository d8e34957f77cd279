//! Line-oriented interactive chat.

use std::error::Error;
use std::future::Future;
use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::config::Config;
use crate::core::gateway::build_gateway;
use crate::core::message::InvocationResult;
use crate::core::orchestrator::{Orchestrator, ToolCallRecord};
use crate::mcp::{McpError, McpSession};

/// What the loop does with one line of input.
#[derive(Debug, PartialEq, Eq)]
pub enum LineAction {
    Skip,
    Quit,
    Send(String),
}

pub fn classify_line(line: &str) -> LineAction {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        LineAction::Skip
    } else if trimmed.eq_ignore_ascii_case("quit") || trimmed.eq_ignore_ascii_case("exit") {
        LineAction::Quit
    } else {
        LineAction::Send(trimmed.to_string())
    }
}

pub fn format_tool_call(record: &ToolCallRecord) -> String {
    let outcome = match &record.result {
        InvocationResult::Ok(text) => text.clone(),
        failed => failed.model_text(),
    };
    format!(
        "[tool] {}({}) -> {}",
        record.request.name,
        record.request.arguments_json(),
        outcome
    )
}

pub fn print_tool_call(record: &ToolCallRecord) {
    eprintln!("{}", format_tool_call(record));
}

fn prompt() -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()
}

/// Waits for a reconnect unless `cancel` fires first.
async fn connect_until_cancelled<F>(connecting: F, cancel: &CancellationToken) -> Option<McpSession>
where
    F: Future<Output = Result<McpSession, McpError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            eprintln!("Reconnect cancelled.");
            None
        }
        result = connecting => match result {
            Ok(session) => Some(session),
            Err(err) => {
                eprintln!("Error: {err}");
                None
            }
        },
    }
}

pub async fn run_chat(config: &Config, show_tool_calls: bool) -> Result<(), Box<dyn Error>> {
    let gateway = build_gateway(&config.model)?;
    let orchestrator = Orchestrator::new(gateway, config.prompts.clone());

    // The first connection must succeed; later ones are retried per input line.
    let first = McpSession::connect(&config.server).await?;
    eprintln!(
        "Connected to {} with {} via {}. Type 'quit' to leave.",
        first.server_id(),
        orchestrator.gateway().model_name(),
        config.model.base_url()
    );
    let mut session = Some(first);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let input = match classify_line(&line) {
            LineAction::Skip => continue,
            LineAction::Quit => break,
            LineAction::Send(input) => input,
        };

        // Ctrl+C cancels the reconnect or the exchange, not the chat.
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        if session.as_ref().map_or(true, |s| !s.is_ready()) {
            eprintln!("Reconnecting to MCP server {}...", config.server.id);
            session =
                connect_until_cancelled(McpSession::connect(&config.server), &cancel).await;
        }
        let Some(active) = session.as_mut() else {
            watcher.abort();
            continue;
        };

        let result = orchestrator.run_exchange(active, &input, &cancel).await;
        watcher.abort();

        match result {
            Ok(outcome) => {
                if show_tool_calls {
                    if let Some(record) = &outcome.tool_call {
                        print_tool_call(record);
                    }
                }
                println!("{}", outcome.answer);
            }
            Err(err) => {
                eprintln!("Error: {err}");
                if err.is_session_fatal() {
                    debug!("Dropping MCP session; the next input reconnects");
                    if let Some(mut closed) = session.take() {
                        closed.shutdown().await;
                    }
                }
            }
        }
    }

    if let Some(mut active) = session {
        active.shutdown().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{InvocationErrorKind, InvocationRequest};
    use serde_json::{json, Map};

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(classify_line(""), LineAction::Skip);
        assert_eq!(classify_line("   \t"), LineAction::Skip);
    }

    #[test]
    fn quit_and_exit_end_the_loop_in_any_case() {
        for line in ["quit", "QUIT", " exit ", "Exit"] {
            assert_eq!(classify_line(line), LineAction::Quit, "line {line:?}");
        }
        assert_eq!(
            classify_line("quit smoking tips"),
            LineAction::Send("quit smoking tips".to_string())
        );
    }

    #[test]
    fn tool_calls_render_on_one_line() {
        let mut arguments = Map::new();
        arguments.insert("city".to_string(), json!("Austin"));
        let record = ToolCallRecord {
            request: InvocationRequest::new("weather_tool", arguments),
            result: InvocationResult::Ok("sunny".to_string()),
        };
        assert_eq!(
            format_tool_call(&record),
            "[tool] weather_tool({\"city\":\"Austin\"}) -> sunny"
        );

        let record = ToolCallRecord {
            request: InvocationRequest::new("stock_tool", Map::new()),
            result: InvocationResult::error(InvocationErrorKind::NotFound, "Unknown MCP tool 'stock_tool'"),
        };
        assert_eq!(
            format_tool_call(&record),
            "[tool] stock_tool({}) -> Error (not found): Unknown MCP tool 'stock_tool'"
        );
    }

    #[tokio::test]
    async fn cancelling_a_stuck_reconnect_gives_up() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let stuck = std::future::pending::<Result<McpSession, McpError>>();
        assert!(connect_until_cancelled(stuck, &cancel).await.is_none());
    }

    #[tokio::test]
    async fn failed_reconnect_leaves_no_session() {
        let failing = async { Err(McpError::Connection("server exited".to_string())) };
        assert!(connect_until_cancelled(failing, &CancellationToken::new())
            .await
            .is_none());
    }
}
