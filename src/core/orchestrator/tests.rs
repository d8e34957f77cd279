use super::*;
use crate::core::config::McpServerConfig;
use crate::core::message::TurnContent;
use crate::mcp::catalog::{PromptParameter, PromptTemplate};
use crate::mcp::SessionState;
use crate::mcp::catalog::ToolDescriptor;
use crate::utils::test_utils::{
    weather_server, weather_server_with, FakeReply, Handler, ScriptedTransport, TransportProbe,
};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Calls = Arc<Mutex<Vec<(Vec<ConversationTurn>, usize)>>>;

/// Gateway that replays canned replies and records every conversation it is sent.
struct ScriptedGateway {
    mode: ToolMode,
    replies: Mutex<VecDeque<GatewayReply>>,
    calls: Calls,
}

impl ScriptedGateway {
    fn new(mode: ToolMode, replies: Vec<GatewayReply>) -> (Self, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                mode,
                replies: Mutex::new(replies.into()),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn generate(
        &self,
        messages: &[ConversationTurn],
        tools: Option<&[ToolDescriptor]>,
    ) -> Result<GatewayReply, GatewayError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((messages.to_vec(), tools.map_or(0, <[ToolDescriptor]>::len)));
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .ok_or(GatewayError::EmptyReply)
    }

    fn tool_mode(&self) -> ToolMode {
        self.mode
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Gateway that never answers.
struct StalledGateway;

#[async_trait]
impl ModelGateway for StalledGateway {
    async fn generate(
        &self,
        _messages: &[ConversationTurn],
        _tools: Option<&[ToolDescriptor]>,
    ) -> Result<GatewayReply, GatewayError> {
        std::future::pending().await
    }

    fn tool_mode(&self) -> ToolMode {
        ToolMode::PlainText
    }

    fn model_name(&self) -> &str {
        "stalled"
    }
}

fn weather_prompts() -> PromptConfig {
    PromptConfig {
        system: Some("weather_prompt".to_string()),
        followup: Some("weather_response_prompt".to_string()),
        result_argument: Some("weather".to_string()),
        default_tool: Some("weather_tool".to_string()),
    }
}

fn text(reply: &str) -> GatewayReply {
    GatewayReply::Text(reply.to_string())
}

async fn open_session(handler: Handler) -> (McpSession, TransportProbe) {
    let (transport, probe) = ScriptedTransport::new(handler);
    let config = McpServerConfig {
        id: "weather".to_string(),
        ..McpServerConfig::default()
    };
    let session = McpSession::open(config, Box::new(transport))
        .await
        .expect("session should open");
    (session, probe)
}

fn last_user_text(conversation: &[ConversationTurn]) -> String {
    conversation
        .iter()
        .rev()
        .find_map(|turn| match (&turn.role, &turn.content) {
            (crate::core::message::TurnRole::User, TurnContent::Text(text)) => Some(text.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn weather_directive_runs_the_tool_and_a_followup_turn() {
    let (mut session, probe) = open_session(weather_server()).await;
    let (gateway, calls) = ScriptedGateway::new(
        ToolMode::PlainText,
        vec![
            text("```json\n[{\"city\": \"Austin\"}]\n```"),
            text("It is sunny in Austin today!"),
        ],
    );
    let orchestrator = Orchestrator::new(Box::new(gateway), weather_prompts());

    let outcome = orchestrator
        .run_exchange(
            &mut session,
            "What is the weather in Austin?",
            &CancellationToken::new(),
        )
        .await
        .expect("exchange");

    assert_eq!(outcome.answer, "It is sunny in Austin today!");
    assert_eq!(
        outcome.states,
        vec![
            ExchangeState::AwaitingUserInput,
            ExchangeState::ModelTurn1,
            ExchangeState::Interpreting,
            ExchangeState::AwaitingToolResult,
            ExchangeState::ModelTurn2,
            ExchangeState::Done,
        ]
    );
    let record = outcome.tool_call.expect("tool call");
    assert_eq!(record.request.name, "weather_tool");
    assert_eq!(record.result, InvocationResult::Ok("sunny".to_string()));
    assert!(!outcome.malformed_directive);
    assert_eq!(probe.count("tools/call"), 1);

    let calls = calls.lock().expect("calls lock");
    assert_eq!(calls.len(), 2);
    let first_user = last_user_text(&calls[0].0);
    assert!(first_user.starts_with("You can call weather_tool."));
    assert!(first_user.ends_with("\nWhat is the weather in Austin?"));

    let second = &calls[1].0;
    assert_eq!(second.len(), 4);
    assert_eq!(
        second[2].content,
        TurnContent::FunctionResult {
            name: "weather_tool".to_string(),
            result: "sunny".to_string()
        }
    );
    assert_eq!(
        last_user_text(second),
        "The weather in Austin is sunny. Answer the user in one sentence."
    );
}

#[tokio::test]
async fn plain_prose_finishes_after_one_model_turn() {
    let (mut session, probe) = open_session(weather_server()).await;
    let reply = "Hello! I can tell you about the weather in any city.";
    let (gateway, calls) = ScriptedGateway::new(ToolMode::PlainText, vec![text(reply)]);
    let orchestrator = Orchestrator::new(Box::new(gateway), weather_prompts());

    let outcome = orchestrator
        .run_exchange(&mut session, "Hi there", &CancellationToken::new())
        .await
        .expect("exchange");

    assert_eq!(outcome.answer, reply);
    assert_eq!(
        outcome.states,
        vec![
            ExchangeState::AwaitingUserInput,
            ExchangeState::ModelTurn1,
            ExchangeState::Interpreting,
            ExchangeState::Done,
        ]
    );
    assert!(outcome.tool_call.is_none());
    assert_eq!(probe.count("tools/call"), 0);
    assert_eq!(calls.lock().expect("calls lock").len(), 1);
}

#[tokio::test]
async fn system_prompt_is_rendered_once_per_session() {
    let (mut session, probe) = open_session(weather_server()).await;
    let (gateway, _calls) =
        ScriptedGateway::new(ToolMode::PlainText, vec![text("one"), text("two")]);
    let orchestrator = Orchestrator::new(Box::new(gateway), weather_prompts());
    let cancel = CancellationToken::new();

    orchestrator
        .run_exchange(&mut session, "first", &cancel)
        .await
        .expect("first exchange");
    orchestrator
        .run_exchange(&mut session, "second", &cancel)
        .await
        .expect("second exchange");

    assert_eq!(probe.count("prompts/get"), 1);
}

#[tokio::test]
async fn malformed_directive_is_answered_as_text() {
    let (mut session, probe) = open_session(weather_server()).await;
    let reply = "```json\n[{\"city\": \"Austin\"\n```";
    let (gateway, _calls) = ScriptedGateway::new(ToolMode::PlainText, vec![text(reply)]);
    let orchestrator = Orchestrator::new(Box::new(gateway), weather_prompts());

    let outcome = orchestrator
        .run_exchange(&mut session, "Weather?", &CancellationToken::new())
        .await
        .expect("exchange");

    assert_eq!(outcome.answer, reply);
    assert!(outcome.malformed_directive);
    assert!(outcome.tool_call.is_none());
    assert_eq!(probe.count("tools/call"), 0);
}

#[tokio::test]
async fn unknown_tool_still_reaches_the_second_turn() {
    let (mut session, probe) = open_session(weather_server()).await;
    let (gateway, calls) = ScriptedGateway::new(
        ToolMode::PlainText,
        vec![
            text("```json\n[{\"name\": \"stock_tool\", \"arguments\": {\"ticker\": \"ACME\"}}]\n```"),
            text("Sorry, I cannot look up stocks."),
        ],
    );
    let orchestrator = Orchestrator::new(Box::new(gateway), weather_prompts());

    let outcome = orchestrator
        .run_exchange(&mut session, "Price of ACME?", &CancellationToken::new())
        .await
        .expect("exchange");

    assert_eq!(outcome.answer, "Sorry, I cannot look up stocks.");
    assert_eq!(outcome.states.last(), Some(&ExchangeState::Done));
    assert!(outcome.states.contains(&ExchangeState::ModelTurn2));
    let record = outcome.tool_call.expect("tool call");
    assert!(matches!(
        record.result,
        InvocationResult::Err {
            kind: InvocationErrorKind::NotFound,
            ..
        }
    ));
    assert_eq!(probe.count("tools/call"), 0);
    assert_eq!(session.state(), SessionState::Ready);

    // The follow-up template needs `city`, so the built-in one is used.
    let calls = calls.lock().expect("calls lock");
    let followup = last_user_text(&calls[1].0);
    assert!(followup.contains("stock_tool"));
    assert!(followup.contains("Price of ACME?"));
}

#[tokio::test]
async fn missing_arguments_fail_without_transport_io() {
    let (mut session, probe) = open_session(weather_server()).await;
    let (gateway, _calls) = ScriptedGateway::new(
        ToolMode::PlainText,
        vec![text("```json\n[{}]\n```"), text("Which city?")],
    );
    let orchestrator = Orchestrator::new(Box::new(gateway), weather_prompts());
    let sent_before = probe.methods().len();

    let outcome = orchestrator
        .run_exchange(&mut session, "Weather?", &CancellationToken::new())
        .await
        .expect("exchange");

    let record = outcome.tool_call.expect("tool call");
    assert!(matches!(
        record.result,
        InvocationResult::Err {
            kind: InvocationErrorKind::Argument,
            ..
        }
    ));
    assert_eq!(probe.count("tools/call"), 0);
    // Only the system prompt render touched the transport.
    assert_eq!(probe.methods().len(), sent_before + 1);
    assert_eq!(outcome.answer, "Which city?");
}

#[tokio::test]
async fn tool_reported_failure_drives_the_followup() {
    let handler = weather_server_with(|method, _| {
        (method == "tools/call").then(|| {
            FakeReply::Result(json!({
                "content": [{"type": "text", "text": "weather service offline"}],
                "isError": true
            }))
        })
    });
    let (mut session, _probe) = open_session(handler).await;
    let (gateway, _calls) = ScriptedGateway::new(
        ToolMode::PlainText,
        vec![
            text("```json\n[{\"city\": \"Austin\"}]\n```"),
            text("The weather service is down."),
        ],
    );
    let orchestrator = Orchestrator::new(Box::new(gateway), weather_prompts());

    let outcome = orchestrator
        .run_exchange(&mut session, "Weather in Austin?", &CancellationToken::new())
        .await
        .expect("exchange");

    let record = outcome.tool_call.expect("tool call");
    assert_eq!(
        record.result,
        InvocationResult::error(InvocationErrorKind::Tool, "weather service offline")
    );
    assert_eq!(outcome.answer, "The weather service is down.");
}

#[tokio::test]
async fn peer_hangup_mid_call_closes_the_session() {
    let handler = weather_server_with(|method, _| (method == "tools/call").then_some(FakeReply::Hangup));
    let (mut session, probe) = open_session(handler).await;
    let (gateway, calls) = ScriptedGateway::new(
        ToolMode::PlainText,
        vec![text("```json\n[{\"city\": \"Austin\"}]\n```")],
    );
    let orchestrator = Orchestrator::new(Box::new(gateway), weather_prompts());
    let cancel = CancellationToken::new();

    let err = orchestrator
        .run_exchange(&mut session, "Weather in Austin?", &cancel)
        .await
        .expect_err("exchange should fail");
    assert!(err.is_session_fatal());
    assert!(matches!(err, ExchangeError::Session(McpError::Transport(_))));
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(probe.close_calls(), 1);

    let sent = probe.methods().len();
    let gateway_calls = calls.lock().expect("calls lock").len();
    let err = orchestrator
        .run_exchange(&mut session, "And in Paris?", &cancel)
        .await
        .expect_err("closed session");
    assert!(matches!(
        err,
        ExchangeError::Session(McpError::InvalidState { state: "closed" })
    ));
    assert!(err.is_session_fatal());
    assert_eq!(probe.methods().len(), sent);
    assert_eq!(calls.lock().expect("calls lock").len(), gateway_calls);
}

#[tokio::test]
async fn native_function_call_bypasses_the_interpreter() {
    let (mut session, probe) = open_session(weather_server()).await;
    let mut arguments = Map::new();
    arguments.insert("city".to_string(), json!("Paris"));
    let (gateway, calls) = ScriptedGateway::new(
        ToolMode::Native,
        vec![
            GatewayReply::FunctionCall(InvocationRequest::new("weather_tool", arguments)),
            text("Paris is cloudy."),
        ],
    );
    let prompts = PromptConfig {
        followup: Some("weather_response_prompt".to_string()),
        result_argument: Some("weather".to_string()),
        ..PromptConfig::default()
    };
    let orchestrator = Orchestrator::new(Box::new(gateway), prompts);

    let outcome = orchestrator
        .run_exchange(&mut session, "Weather in Paris?", &CancellationToken::new())
        .await
        .expect("exchange");

    assert_eq!(outcome.answer, "Paris is cloudy.");
    assert_eq!(
        outcome.tool_call.map(|record| record.result),
        Some(InvocationResult::Ok("cloudy".to_string()))
    );
    assert_eq!(probe.count("tools/call"), 1);
    assert_eq!(probe.count("prompts/get"), 1);

    let calls = calls.lock().expect("calls lock");
    assert_eq!(calls[0].1, 1, "catalog tools are offered natively");
    assert_eq!(calls[1].1, 0, "the follow-up turn offers no tools");
    assert_eq!(last_user_text(&calls[0].0), "Weather in Paris?");
    assert!(matches!(calls[1].0[1].content, TurnContent::FunctionCall(_)));
}

#[tokio::test]
async fn native_call_with_bad_arguments_reaches_the_second_turn() {
    let (mut session, probe) = open_session(weather_server()).await;
    let (gateway, calls) = ScriptedGateway::new(
        ToolMode::Native,
        vec![
            GatewayReply::MalformedCall {
                name: "weather_tool".to_string(),
                reason: "arguments are not valid JSON".to_string(),
            },
            text("Which city did you mean?"),
        ],
    );
    let orchestrator = Orchestrator::new(Box::new(gateway), PromptConfig::default());

    let outcome = orchestrator
        .run_exchange(&mut session, "Weather?", &CancellationToken::new())
        .await
        .expect("exchange");

    assert_eq!(outcome.answer, "Which city did you mean?");
    assert!(outcome.malformed_directive);
    assert!(outcome.states.contains(&ExchangeState::ModelTurn2));
    let record = outcome.tool_call.expect("tool call");
    assert_eq!(record.request.name, "weather_tool");
    assert_eq!(
        record.result,
        InvocationResult::error(InvocationErrorKind::Argument, "arguments are not valid JSON")
    );
    assert_eq!(probe.count("tools/call"), 0);
    assert_eq!(session.state(), SessionState::Ready);

    let calls = calls.lock().expect("calls lock");
    assert_eq!(
        calls[1].0[2].content,
        TurnContent::FunctionResult {
            name: "weather_tool".to_string(),
            result: "Error (invalid arguments): arguments are not valid JSON".to_string()
        }
    );
}

#[tokio::test]
async fn plain_text_model_is_told_the_tools_without_a_system_prompt() {
    let (mut session, probe) = open_session(weather_server()).await;
    let (gateway, calls) = ScriptedGateway::new(ToolMode::PlainText, vec![text("Hello!")]);
    let orchestrator = Orchestrator::new(Box::new(gateway), PromptConfig::default());

    orchestrator
        .run_exchange(&mut session, "Weather in Oslo?", &CancellationToken::new())
        .await
        .expect("exchange");

    assert_eq!(probe.count("prompts/get"), 0);
    let calls = calls.lock().expect("calls lock");
    let first_user = last_user_text(&calls[0].0);
    assert!(first_user.contains("- weather_tool:"));
    assert!(first_user.contains("\"city\""));
    assert!(first_user.contains("```json"));
    assert!(first_user.ends_with("\nWeather in Oslo?"));
}

#[tokio::test]
async fn missing_system_prompt_falls_back_to_the_tool_listing() {
    let (mut session, _probe) = open_session(weather_server()).await;
    let (gateway, calls) = ScriptedGateway::new(ToolMode::PlainText, vec![text("Hello!")]);
    let prompts = PromptConfig {
        system: Some("no_such_prompt".to_string()),
        ..PromptConfig::default()
    };
    let orchestrator = Orchestrator::new(Box::new(gateway), prompts);

    orchestrator
        .run_exchange(&mut session, "Hi", &CancellationToken::new())
        .await
        .expect("exchange");

    let calls = calls.lock().expect("calls lock");
    assert!(last_user_text(&calls[0].0).contains("- weather_tool:"));
}

#[tokio::test]
async fn native_text_reply_is_not_interpreted() {
    let (mut session, probe) = open_session(weather_server()).await;
    let reply = "```json\n[{\"city\": \"Austin\"}]\n```";
    let (gateway, _calls) = ScriptedGateway::new(ToolMode::Native, vec![text(reply)]);
    let orchestrator = Orchestrator::new(Box::new(gateway), PromptConfig::default());

    let outcome = orchestrator
        .run_exchange(&mut session, "Show me a directive", &CancellationToken::new())
        .await
        .expect("exchange");

    assert_eq!(outcome.answer, reply);
    assert!(outcome.tool_call.is_none());
    assert_eq!(probe.count("tools/call"), 0);
}

#[tokio::test]
async fn cancellation_abandons_the_exchange() {
    let (mut session, _probe) = open_session(weather_server()).await;
    let orchestrator = Orchestrator::new(Box::new(StalledGateway), PromptConfig::default());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = orchestrator
        .run_exchange(&mut session, "Weather?", &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, ExchangeError::Cancelled));
    assert!(!err.is_session_fatal());
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn followup_binds_declared_parameters() {
    let parameter = |name: &str| PromptParameter {
        name: name.to_string(),
        description: None,
        required: false,
    };
    let template = PromptTemplate {
        name: "summary".to_string(),
        description: None,
        arguments: vec![
            parameter("tool_name"),
            parameter("arguments"),
            parameter("result"),
            parameter("forecast"),
            parameter("city"),
            parameter("units"),
        ],
    };
    let catalog = CapabilityCatalog::new(Vec::new(), vec![template], Vec::new());
    let (gateway, _calls) = ScriptedGateway::new(ToolMode::PlainText, Vec::new());
    let orchestrator = Orchestrator::new(
        Box::new(gateway),
        PromptConfig {
            result_argument: Some("forecast".to_string()),
            ..PromptConfig::default()
        },
    );
    let mut arguments = Map::new();
    arguments.insert("city".to_string(), Value::String("Austin".to_string()));
    let request = InvocationRequest::new("weather_tool", arguments);
    let result = InvocationResult::Ok("sunny".to_string());

    let params = orchestrator.followup_params(&catalog, "summary", &request, &result);

    assert_eq!(params.get("tool_name").map(String::as_str), Some("weather_tool"));
    assert_eq!(
        params.get("arguments").map(String::as_str),
        Some("{\"city\":\"Austin\"}")
    );
    assert_eq!(params.get("result").map(String::as_str), Some("sunny"));
    assert_eq!(params.get("forecast").map(String::as_str), Some("sunny"));
    assert_eq!(params.get("city").map(String::as_str), Some("Austin"));
    assert!(!params.contains_key("units"));
}
