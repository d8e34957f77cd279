//! Model backends behind a single `generate` call.

use crate::core::config::{BackendKind, ModelConfig};
use crate::core::message::{ConversationTurn, InvocationRequest};
use crate::mcp::catalog::ToolDescriptor;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod ollama;
pub mod openai;

pub use ollama::OllamaGateway;
pub use openai::OpenAiGateway;

/// How a backend expresses tool intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolMode {
    /// Tool directives are embedded in the reply text and must be interpreted.
    PlainText,
    /// The backend returns structured function calls.
    Native,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayReply {
    Text(String),
    FunctionCall(InvocationRequest),
    /// A native function call whose arguments could not be used.
    MalformedCall { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("API request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode model reply: {message}")]
    Decode { message: String },

    #[error("Environment variable {env} is not set; it must hold the API key")]
    MissingApiKey { env: String },

    #[error("Model returned an empty reply")]
    EmptyReply,
}

impl GatewayError {
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Sends the conversation and returns the model's reply.
    ///
    /// `tools` is forwarded only by backends with [`ToolMode::Native`].
    async fn generate(
        &self,
        messages: &[ConversationTurn],
        tools: Option<&[ToolDescriptor]>,
    ) -> Result<GatewayReply, GatewayError>;

    fn tool_mode(&self) -> ToolMode;

    fn model_name(&self) -> &str;
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, GatewayError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// Maps a failed HTTP response onto [`GatewayError::Status`].
pub(crate) async fn status_error(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    GatewayError::Status { status, message }
}

/// Builds the gateway selected by `model.backend`.
pub fn build_gateway(config: &ModelConfig) -> Result<Box<dyn ModelGateway>, GatewayError> {
    match config.backend {
        BackendKind::Ollama => Ok(Box::new(OllamaGateway::new(
            config.model_name(),
            config.base_url(),
            config.temperature,
            config.request_timeout(),
        )?)),
        BackendKind::OpenAi => {
            let env = config.api_key_env();
            let api_key = std::env::var(env)
                .ok()
                .filter(|key| !key.trim().is_empty())
                .ok_or_else(|| GatewayError::MissingApiKey {
                    env: env.to_string(),
                })?;
            Ok(Box::new(OpenAiGateway::new(
                config.model_name(),
                config.base_url(),
                api_key,
                config.temperature,
                config.request_timeout(),
            )?))
        }
    }
}
