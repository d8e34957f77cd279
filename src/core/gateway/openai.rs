use super::{http_client, status_error, GatewayError, GatewayReply, ModelGateway, ToolMode};
use crate::api::{
    ChatMessage, ChatRequest, ChatResponse, ChatToolCall, ChatToolCallFunction,
    ChatToolDefinition, ChatToolFunction,
};
use crate::core::message::{ConversationTurn, InvocationRequest, TurnContent};
use crate::mcp::catalog::ToolDescriptor;
use crate::utils::url::construct_api_url;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible chat completions with native function calling.
pub struct OpenAiGateway {
    model: String,
    base_url: String,
    api_key: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiGateway {
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            model: model.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            temperature,
            client: http_client(timeout)?,
        })
    }

    fn build_request(
        &self,
        messages: &[ConversationTurn],
        tools: Option<&[ToolDescriptor]>,
    ) -> ChatRequest {
        let tools = tools
            .filter(|tools| !tools.is_empty())
            .map(|tools| tools.iter().map(tool_definition).collect());
        ChatRequest {
            model: self.model.clone(),
            messages: chat_messages(messages),
            stream: false,
            temperature: self.temperature,
            tools,
        }
    }
}

fn tool_definition(tool: &ToolDescriptor) -> ChatToolDefinition {
    ChatToolDefinition {
        kind: "function".to_string(),
        function: ChatToolFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.gateway_parameters(),
        },
    }
}

/// Converts conversation turns, pairing each function result with the call before it.
fn chat_messages(turns: &[ConversationTurn]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(turns.len());
    let mut pending_call: Option<String> = None;

    for (index, turn) in turns.iter().enumerate() {
        let message = match &turn.content {
            TurnContent::Text(text) => ChatMessage::text(turn.role.as_str(), text.clone()),
            TurnContent::FunctionCall(request) => {
                let id = format!("call_{index}");
                pending_call = Some(id.clone());
                ChatMessage {
                    role: "assistant".to_string(),
                    content: None,
                    name: None,
                    tool_call_id: None,
                    tool_calls: Some(vec![ChatToolCall {
                        id,
                        kind: "function".to_string(),
                        function: ChatToolCallFunction {
                            name: request.name.clone(),
                            arguments: request.arguments_json(),
                        },
                    }]),
                }
            }
            TurnContent::FunctionResult { result, .. } => match pending_call.take() {
                Some(id) => ChatMessage {
                    role: "tool".to_string(),
                    content: Some(result.clone()),
                    name: None,
                    tool_call_id: Some(id),
                    tool_calls: None,
                },
                // The call arrived as text, so there is no id to answer.
                None => ChatMessage::text("user", turn.plain_text()),
            },
        };
        messages.push(message);
    }
    messages
}

/// Unusable arguments become [`GatewayReply::MalformedCall`] so the exchange can report them.
fn reply_from_call(call: ChatToolCall) -> GatewayReply {
    let ChatToolCallFunction { name, arguments } = call.function;
    if arguments.trim().is_empty() {
        return GatewayReply::FunctionCall(InvocationRequest::new(name, Map::new()));
    }
    match serde_json::from_str::<Value>(&arguments) {
        Ok(Value::Object(map)) => GatewayReply::FunctionCall(InvocationRequest::new(name, map)),
        Ok(_) => GatewayReply::MalformedCall {
            name,
            reason: "arguments are not a JSON object".to_string(),
        },
        Err(err) => GatewayReply::MalformedCall {
            name,
            reason: format!("arguments are not valid JSON: {err}"),
        },
    }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
    async fn generate(
        &self,
        messages: &[ConversationTurn],
        tools: Option<&[ToolDescriptor]>,
    ) -> Result<GatewayReply, GatewayError> {
        let url = construct_api_url(&self.base_url, "chat/completions");
        let request = self.build_request(messages, tools);
        debug!(
            model = %self.model,
            turns = request.messages.len(),
            tools = request.tools.as_ref().map_or(0, Vec::len),
            "Sending chat completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::decode(err.to_string()))?;
        let Some(choice) = body.choices.into_iter().next() else {
            return Err(GatewayError::EmptyReply);
        };
        debug!(finish_reason = ?choice.finish_reason, "Chat completion received");

        let message = choice.message;
        let mut calls = message.tool_calls.unwrap_or_default();
        if !calls.is_empty() {
            if calls.len() > 1 {
                debug!(
                    count = calls.len(),
                    "Model requested several tool calls; only the first is used"
                );
            }
            return Ok(reply_from_call(calls.swap_remove(0)));
        }

        match message.content {
            Some(text) if !text.trim().is_empty() => Ok(GatewayReply::Text(text)),
            _ => Err(GatewayError::EmptyReply),
        }
    }

    fn tool_mode(&self) -> ToolMode {
        ToolMode::Native
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
