use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gemma3:4b";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

const DEFAULT_MODEL_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_HANDSHAKE_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_SERVER_REQUEST_TIMEOUT_SECONDS: u64 = 60;

/// Backend family behind the model gateway.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local Ollama runtime; tool intent is embedded in reply text.
    #[default]
    Ollama,
    /// OpenAI-compatible chat completions with native function calling.
    #[serde(alias = "openai-compatible")]
    OpenAi,
}

impl BackendKind {
    pub fn parse(input: &str) -> Result<Self, String> {
        match input.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(BackendKind::Ollama),
            "openai" | "openai-compatible" => Ok(BackendKind::OpenAi),
            other => Err(format!("Unsupported model backend: {other}")),
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            BackendKind::Ollama => DEFAULT_OLLAMA_BASE_URL,
            BackendKind::OpenAi => DEFAULT_OPENAI_BASE_URL,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ModelConfig {
    #[serde(default)]
    pub backend: BackendKind,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Environment variable holding the bearer token for OpenAI-compatible backends
    pub api_key_env: Option<String>,
    pub temperature: Option<f32>,
    pub request_timeout_secs: Option<u64>,
}

impl ModelConfig {
    pub fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.backend.default_base_url())
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env.as_deref().unwrap_or(DEFAULT_API_KEY_ENV)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_MODEL_TIMEOUT_SECONDS),
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct McpServerConfig {
    #[serde(default = "default_server_id")]
    pub id: String,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub protocol_version: Option<String>,
    pub handshake_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

fn default_server_id() -> String {
    "default".to_string()
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            id: default_server_id(),
            command: None,
            args: None,
            env: None,
            protocol_version: None,
            handshake_timeout_secs: None,
            request_timeout_secs: None,
        }
    }
}

impl McpServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(
            self.handshake_timeout_secs
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECONDS),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_SERVER_REQUEST_TIMEOUT_SECONDS),
        )
    }
}

/// Prompt templates and tool defaults used by the orchestrator.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PromptConfig {
    /// Server prompt prepended to every user message
    pub system: Option<String>,
    /// Server prompt rendered after a tool call; a built-in template is used when unset
    pub followup: Option<String>,
    /// Extra follow-up parameter name that receives the tool result (e.g. "weather")
    pub result_argument: Option<String>,
    /// Tool assumed by directives that carry only arguments
    pub default_tool: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub server: McpServerConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
