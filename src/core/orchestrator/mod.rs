//! One user exchange: model turn, optional tool call, follow-up turn.
//!
//! ```text
//! AwaitingUserInput -> ModelTurn1 -> Interpreting -> Done
//!                                         |
//!                                         v
//!                              AwaitingToolResult -> ModelTurn2 -> Done
//! ```
//!
//! Tool use is single hop: the reply to the follow-up turn is returned as is.

use crate::core::config::PromptConfig;
use crate::core::gateway::{GatewayError, GatewayReply, ModelGateway, ToolMode};
use crate::core::interpreter::{Interpretation, ResponseInterpreter};
use crate::core::message::{
    ConversationTurn, InvocationErrorKind, InvocationRequest, InvocationResult,
};
use crate::mcp::catalog::CapabilityCatalog;
use crate::mcp::{McpError, McpSession};
use serde_json::Map;
use std::collections::HashMap;
use std::fmt::Write;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Follow-up parameter receiving the tool name.
pub const PARAM_TOOL_NAME: &str = "tool_name";
/// Follow-up parameter receiving the call arguments as JSON.
pub const PARAM_ARGUMENTS: &str = "arguments";
/// Follow-up parameter receiving the tool result text.
pub const PARAM_RESULT: &str = "result";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitingUserInput,
    ModelTurn1,
    Interpreting,
    AwaitingToolResult,
    ModelTurn2,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub request: InvocationRequest,
    pub result: InvocationResult,
}

#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub answer: String,
    pub states: Vec<ExchangeState>,
    pub tool_call: Option<ToolCallRecord>,
    /// The first reply asked for a tool in a form that did not parse.
    pub malformed_directive: bool,
    pub conversation: Vec<ConversationTurn>,
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error(transparent)]
    Session(#[from] McpError),

    #[error("Model request failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Exchange cancelled")]
    Cancelled,
}

impl ExchangeError {
    /// True when the session can no longer be used and must be reconnected.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            ExchangeError::Session(err) => {
                err.is_session_fatal() || matches!(err, McpError::InvalidState { .. })
            }
            _ => false,
        }
    }
}

/// Drives exchanges against one gateway. Sessions are passed in per call so
/// a caller can reconnect without rebuilding the orchestrator.
pub struct Orchestrator {
    gateway: Box<dyn ModelGateway>,
    prompts: PromptConfig,
}

struct Exchange {
    states: Vec<ExchangeState>,
    conversation: Vec<ConversationTurn>,
}

impl Exchange {
    fn new() -> Self {
        Self {
            states: vec![ExchangeState::AwaitingUserInput],
            conversation: Vec::new(),
        }
    }

    fn enter(&mut self, state: ExchangeState) {
        debug!(state = ?state, "Exchange state");
        self.states.push(state);
    }

    fn finish(
        mut self,
        answer: String,
        tool_call: Option<ToolCallRecord>,
        malformed_directive: bool,
    ) -> ExchangeOutcome {
        self.enter(ExchangeState::Done);
        ExchangeOutcome {
            answer,
            states: self.states,
            tool_call,
            malformed_directive,
            conversation: self.conversation,
        }
    }
}

impl Orchestrator {
    pub fn new(gateway: Box<dyn ModelGateway>, prompts: PromptConfig) -> Self {
        Self { gateway, prompts }
    }

    pub fn gateway(&self) -> &dyn ModelGateway {
        self.gateway.as_ref()
    }

    /// Runs one exchange. Cancelling `cancel` abandons it at the next suspension point.
    pub async fn run_exchange(
        &self,
        session: &mut McpSession,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Exchange cancelled");
                Err(ExchangeError::Cancelled)
            }
            outcome = self.exchange(session, input) => outcome,
        }
    }

    fn interpreter_for(&self, catalog: &CapabilityCatalog) -> ResponseInterpreter {
        let default_tool = self
            .prompts
            .default_tool
            .clone()
            .or_else(|| catalog.sole_tool().map(|tool| tool.name.clone()));
        ResponseInterpreter::new(default_tool)
    }

    async fn exchange(
        &self,
        session: &mut McpSession,
        input: &str,
    ) -> Result<ExchangeOutcome, ExchangeError> {
        if !session.is_ready() {
            return Err(McpError::InvalidState {
                state: session.state().label(),
            }
            .into());
        }
        let catalog = session.catalog();
        let mut exchange = Exchange::new();

        exchange.enter(ExchangeState::ModelTurn1);
        let system = match self.system_prompt(session).await? {
            Some(text) => Some(text),
            None if self.gateway.tool_mode() == ToolMode::PlainText => {
                builtin_system_prompt(&catalog)
            }
            None => None,
        };
        let first_text = match system {
            Some(system) => format!("{system}\n{input}"),
            None => input.to_string(),
        };
        exchange.conversation.push(ConversationTurn::user(first_text));

        let tools = match self.gateway.tool_mode() {
            ToolMode::Native if !catalog.tools().is_empty() => Some(catalog.tools()),
            _ => None,
        };
        let reply = self
            .gateway
            .generate(&exchange.conversation, tools)
            .await?;

        exchange.enter(ExchangeState::Interpreting);
        let (request, rejected) = match reply {
            GatewayReply::FunctionCall(request) => {
                exchange
                    .conversation
                    .push(ConversationTurn::function_call(request.clone()));
                (request, None)
            }
            GatewayReply::MalformedCall { name, reason } => {
                warn!(tool = %name, reason = %reason, "Model sent unusable tool arguments");
                let request = InvocationRequest::new(name, Map::new());
                exchange
                    .conversation
                    .push(ConversationTurn::function_call(request.clone()));
                let result = InvocationResult::error(InvocationErrorKind::Argument, reason);
                (request, Some(result))
            }
            GatewayReply::Text(text) => {
                let interpretation = match self.gateway.tool_mode() {
                    ToolMode::PlainText => self.interpreter_for(&catalog).interpret(&text),
                    ToolMode::Native => Interpretation::Text(text.clone()),
                };
                match interpretation {
                    Interpretation::Text(answer) => {
                        exchange.conversation.push(ConversationTurn::assistant(answer.clone()));
                        return Ok(exchange.finish(answer, None, false));
                    }
                    Interpretation::Malformed { text, .. } => {
                        exchange.conversation.push(ConversationTurn::assistant(text.clone()));
                        return Ok(exchange.finish(text, None, true));
                    }
                    Interpretation::Invocation(request) => {
                        exchange.conversation.push(ConversationTurn::assistant(text));
                        (request, None)
                    }
                }
            }
        };

        exchange.enter(ExchangeState::AwaitingToolResult);
        info!(tool = %request.name, "Model requested a tool call");
        let malformed = rejected.is_some();
        let result = match rejected {
            Some(result) => result,
            None => match session.call_tool(&request).await {
                Ok(result) => result,
                Err(err) if err.is_recoverable_tool_failure() => {
                    InvocationResult::error(invocation_error_kind(&err), err.to_string())
                }
                Err(err) => return Err(err.into()),
            },
        };
        if let InvocationResult::Err { kind, message } = &result {
            warn!(tool = %request.name, kind = %kind, error = %message, "Tool call failed");
        }
        exchange.conversation.push(ConversationTurn::function_result(
            request.name.clone(),
            result.model_text(),
        ));

        exchange.enter(ExchangeState::ModelTurn2);
        let followup = self
            .followup_prompt(session, &catalog, input, &request, &result)
            .await?;
        exchange.conversation.push(ConversationTurn::user(followup));

        // Tool use is single hop, so the follow-up turn offers no tools.
        let answer = match self.gateway.generate(&exchange.conversation, None).await? {
            GatewayReply::Text(text) => text,
            GatewayReply::FunctionCall(InvocationRequest { name, .. })
            | GatewayReply::MalformedCall { name, .. } => {
                warn!(tool = %name, "Ignoring a second tool call; answering with the tool result");
                result.model_text()
            }
        };
        exchange.conversation.push(ConversationTurn::assistant(answer.clone()));

        let tool_call = ToolCallRecord { request, result };
        Ok(exchange.finish(answer, Some(tool_call), malformed))
    }

    /// Renders the configured system prompt. Non-fatal failures drop it with a warning.
    async fn system_prompt(&self, session: &mut McpSession) -> Result<Option<String>, McpError> {
        let Some(name) = self.prompts.system.as_deref() else {
            return Ok(None);
        };
        match session.render_prompt_once(name).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.is_recoverable_tool_failure() => {
                warn!(prompt = %name, error = %err, "System prompt unavailable; continuing without it");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn followup_prompt(
        &self,
        session: &mut McpSession,
        catalog: &CapabilityCatalog,
        input: &str,
        request: &InvocationRequest,
        result: &InvocationResult,
    ) -> Result<String, McpError> {
        if let Some(name) = self.prompts.followup.as_deref() {
            let params = self.followup_params(catalog, name, request, result);
            match session.get_prompt(name, &params).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_recoverable_tool_failure() => {
                    warn!(prompt = %name, error = %err, "Follow-up prompt unavailable; using the built-in one");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(builtin_followup(input, request, result))
    }

    /// Binds every parameter the follow-up template declares that can be filled.
    fn followup_params(
        &self,
        catalog: &CapabilityCatalog,
        name: &str,
        request: &InvocationRequest,
        result: &InvocationResult,
    ) -> HashMap<String, String> {
        let mut params = HashMap::new();
        let Some(template) = catalog.prompt(name) else {
            return params;
        };
        let result_alias = self.prompts.result_argument.as_deref();
        for param in &template.arguments {
            let value = match param.name.as_str() {
                PARAM_TOOL_NAME => Some(request.name.clone()),
                PARAM_ARGUMENTS => Some(request.arguments_json()),
                PARAM_RESULT => Some(result.model_text()),
                other if Some(other) == result_alias => Some(result.model_text()),
                other => request.argument_text(other),
            };
            if let Some(value) = value {
                params.insert(param.name.clone(), value);
            }
        }
        params
    }
}

fn invocation_error_kind(err: &McpError) -> InvocationErrorKind {
    match err {
        McpError::NotFound { .. } => InvocationErrorKind::NotFound,
        McpError::Argument(_) => InvocationErrorKind::Argument,
        _ => InvocationErrorKind::Rpc,
    }
}

/// Describes the catalog's tools and the fenced directive format to a plain-text model.
fn builtin_system_prompt(catalog: &CapabilityCatalog) -> Option<String> {
    let tools = catalog.tools();
    if tools.is_empty() {
        return None;
    }
    let mut prompt = String::from("You can call the following tools:\n");
    for tool in tools {
        let description = tool.description.as_deref().unwrap_or("").trim();
        let _ = writeln!(
            prompt,
            "- {name}: {description}\n  input schema: {schema}",
            name = tool.name,
            schema = tool.gateway_parameters(),
        );
    }
    prompt.push_str(
        "To call a tool, reply with only a fenced JSON block such as:\n\
         ```json\n\
         [{\"name\": \"<tool name>\", \"arguments\": {\"<argument>\": \"<value>\"}}]\n\
         ```\n\
         Otherwise answer the user directly.",
    );
    Some(prompt)
}

fn builtin_followup(input: &str, request: &InvocationRequest, result: &InvocationResult) -> String {
    format!(
        "The tool {name} was called with arguments {arguments} and returned:\n{result}\n\
         Use this to answer the original question nicely: {input}",
        name = request.name,
        arguments = request.arguments_json(),
        result = result.model_text(),
    )
}
