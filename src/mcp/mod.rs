pub mod catalog;
pub mod client;
pub mod error;
pub mod transport;

pub use catalog::{CapabilityCatalog, PromptTemplate, ResourceDescriptor, ToolDescriptor};
pub use client::{McpSession, SessionState};
pub use error::{CapabilityKind, McpError};
