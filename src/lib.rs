//! toolchat is a terminal client that lets a chat model call tools exposed by
//! an MCP server.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] speaks the Model Context Protocol over a spawned server's stdio:
//!   transport, session lifecycle, and the discovered capability catalog.
//! - [`core`] holds configuration, the model gateways, the reply interpreter
//!   that spots tool directives, and the orchestrator that runs one exchange.
//! - [`api`] defines the chat payloads sent to the model backends.
//! - [`cli`] parses arguments and runs the chat, ask, catalog and read commands.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;
