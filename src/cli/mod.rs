//! Command-line interface parsing and handling
//!
//! This module parses command-line arguments, merges them over the config
//! file and dispatches to the command handlers.

pub mod ask;
pub mod catalog;
pub mod chat;
pub mod read;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::cli::ask::run_ask;
use crate::cli::catalog::run_catalog;
use crate::cli::chat::run_chat;
use crate::cli::read::run_read;
use crate::core::config::data::path_display;
use crate::core::config::{BackendKind, Config};
use crate::utils::logging;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_DESCRIBE"),
    ", built ",
    env!("VERGEN_BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "toolchat")]
#[command(version = VERSION)]
#[command(about = "Chat with a model that can call tools exposed by an MCP server")]
#[command(
    long_about = "toolchat connects a chat model (a local Ollama runtime or an OpenAI-compatible \
endpoint) to an MCP server spoken to over stdio. The model sees the server's tools; when it \
asks for one, toolchat runs the call and hands the result back for a final answer.\n\n\
The server is taken from the [server] section of the config file, or from the command given \
after `--`:\n\
  toolchat -- python weather_server.py\n\
  toolchat ask What is the weather in Austin? -- python weather_server.py\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    API key for the openai backend (name configurable via model.api_key_env)\n\
  RUST_LOG          Log filter; overrides -v\n\n\
Interactive chat:\n\
  Enter             Send the line\n\
  quit / exit       Leave the chat\n\
  Ctrl+C            Cancel the running exchange, or leave at the prompt"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file to use instead of the platform default
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Model name, e.g. gemma3:4b or gpt-4o-mini
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Model backend: ollama or openai
    #[arg(short = 'b', long, global = true, value_name = "BACKEND", value_parser = BackendKind::parse)]
    pub backend: Option<BackendKind>,

    /// Base URL of the model backend
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Print each tool call and its result
    #[arg(long, global = true)]
    pub show_tool_calls: bool,

    /// Enable debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// MCP server command and arguments
    #[arg(last = true, value_name = "SERVER_COMMAND")]
    pub server_command: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the interactive chat (default)
    Chat {
        #[arg(last = true, value_name = "SERVER_COMMAND")]
        server_command: Vec<String>,
    },
    /// Run a single exchange and print the answer
    Ask {
        /// Prompt text (can be multiple words)
        #[arg(required = true)]
        prompt: Vec<String>,
        #[arg(last = true, value_name = "SERVER_COMMAND")]
        server_command: Vec<String>,
    },
    /// List the server's tools, prompts and resources
    Catalog {
        #[arg(last = true, value_name = "SERVER_COMMAND")]
        server_command: Vec<String>,
    },
    /// Read one resource from the server
    Read {
        /// Resource URI, e.g. echo://hello
        uri: String,
        #[arg(last = true, value_name = "SERVER_COMMAND")]
        server_command: Vec<String>,
    },
    /// Write the effective configuration to the config file
    Init {
        /// Replace an existing config file
        #[arg(long)]
        force: bool,
        #[arg(last = true, value_name = "SERVER_COMMAND")]
        server_command: Vec<String>,
    },
}

impl Commands {
    fn server_command(&self) -> &[String] {
        match self {
            Commands::Chat { server_command }
            | Commands::Ask { server_command, .. }
            | Commands::Catalog { server_command }
            | Commands::Read { server_command, .. }
            | Commands::Init { server_command, .. } => server_command,
        }
    }
}

impl Args {
    /// Applies flag overrides on top of a loaded config.
    pub fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(backend) = self.backend {
            if backend != config.model.backend && self.base_url.is_none() {
                // A base URL written for the other backend would point at the wrong API.
                config.model.base_url = None;
            }
            config.model.backend = backend;
        }
        if let Some(model) = &self.model {
            config.model.model = Some(model.clone());
        }
        if let Some(base_url) = &self.base_url {
            config.model.base_url = Some(base_url.clone());
        }

        let server_command = match &self.command {
            Some(command) if !command.server_command().is_empty() => command.server_command(),
            _ => self.server_command.as_slice(),
        };
        if let Some((program, rest)) = server_command.split_first() {
            config.server.command = Some(program.clone());
            config.server.args = Some(rest.to_vec());
        }
        config
    }

    fn config_path(&self) -> Result<PathBuf, Box<dyn Error>> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(Config::get_config_path()?),
        }
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config_path = args.config_path()?;
    let config = args.apply_overrides(Config::load_from_path(&config_path)?);

    match &args.command {
        None | Some(Commands::Chat { .. }) => run_chat(&config, args.show_tool_calls).await,
        Some(Commands::Ask { prompt, .. }) => {
            run_ask(&config, &prompt.join(" "), args.show_tool_calls).await
        }
        Some(Commands::Catalog { .. }) => run_catalog(&config).await,
        Some(Commands::Read { uri, .. }) => run_read(&config, uri).await,
        Some(Commands::Init { force, .. }) => write_config(&config, &config_path, *force),
    }
}

fn write_config(config: &Config, path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        return Err(format!(
            "Config file {} already exists; pass --force to replace it",
            path_display(path)
        )
        .into());
    }
    config.save_to_path(path)?;
    println!("Wrote {}", path_display(path));
    Ok(())
}
