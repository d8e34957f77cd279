pub mod config;
pub mod gateway;
pub mod interpreter;
pub mod message;
pub mod orchestrator;
