use super::{http_client, status_error, GatewayError, GatewayReply, ModelGateway, ToolMode};
use crate::api::ollama::{
    OllamaChatRequest, OllamaChatResponse, OllamaMessage, OllamaOptions, OllamaRole,
};
use crate::core::message::{ConversationTurn, TurnRole};
use crate::mcp::catalog::ToolDescriptor;
use crate::utils::url::construct_api_url;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Local Ollama runtime. Tools reach the model only through the system prompt,
/// so replies are always plain text.
pub struct OllamaGateway {
    model: String,
    base_url: String,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OllamaGateway {
    pub fn new(
        model: impl Into<String>,
        base_url: impl Into<String>,
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            model: model.into(),
            base_url: base_url.into(),
            temperature,
            client: http_client(timeout)?,
        })
    }

    fn build_request(&self, messages: &[ConversationTurn]) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.model.clone(),
            messages: messages.iter().map(to_ollama_message).collect(),
            options: self.temperature.map(|temperature| OllamaOptions {
                temperature: Some(temperature),
            }),
            stream: false,
        }
    }
}

fn to_ollama_message(turn: &ConversationTurn) -> OllamaMessage {
    let role = match turn.role {
        TurnRole::User => OllamaRole::User,
        TurnRole::Assistant => OllamaRole::Assistant,
        TurnRole::ToolResult => OllamaRole::Tool,
    };
    OllamaMessage::new(role, turn.plain_text())
}

#[async_trait]
impl ModelGateway for OllamaGateway {
    async fn generate(
        &self,
        messages: &[ConversationTurn],
        _tools: Option<&[ToolDescriptor]>,
    ) -> Result<GatewayReply, GatewayError> {
        let url = construct_api_url(&self.base_url, "api/chat");
        let request = self.build_request(messages);
        debug!(model = %self.model, turns = messages.len(), "Sending Ollama chat request");

        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: OllamaChatResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::decode(err.to_string()))?;
        debug!(
            model = %body.model,
            done = body.done,
            done_reason = ?body.done_reason,
            "Ollama chat reply received"
        );

        let content = body.message.content;
        if content.trim().is_empty() {
            return Err(GatewayError::EmptyReply);
        }
        Ok(GatewayReply::Text(content))
    }

    fn tool_mode(&self) -> ToolMode {
        ToolMode::PlainText
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
