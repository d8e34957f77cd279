//! Single-shot "ask" command

use std::error::Error;

use tokio_util::sync::CancellationToken;

use crate::cli::chat::print_tool_call;
use crate::core::config::Config;
use crate::core::gateway::build_gateway;
use crate::core::orchestrator::Orchestrator;
use crate::mcp::McpSession;

pub async fn run_ask(
    config: &Config,
    prompt: &str,
    show_tool_calls: bool,
) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err("Usage: toolchat ask <prompt>".into());
    }

    let gateway = build_gateway(&config.model)?;
    let orchestrator = Orchestrator::new(gateway, config.prompts.clone());
    let mut session = McpSession::connect(&config.server).await?;

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = orchestrator.run_exchange(&mut session, prompt, &cancel).await;
    watcher.abort();
    session.shutdown().await;

    let outcome = outcome?;
    if show_tool_calls {
        if let Some(record) = &outcome.tool_call {
            print_tool_call(record);
        }
    }
    println!("{}", outcome.answer);
    Ok(())
}
