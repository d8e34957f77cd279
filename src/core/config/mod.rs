pub mod data;
pub mod io;

pub use data::{BackendKind, Config, McpServerConfig, ModelConfig, PromptConfig};
pub use io::ConfigError;
