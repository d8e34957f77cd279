//! MCP session client.
//!
//! [`McpSession`] owns one transport and walks the lifecycle
//! `Unconnected -> Initializing -> Ready -> Closed`. Every discovery or
//! invocation call checks the state first and fails without I/O outside
//! `Ready`. Session-fatal errors close the transport before they are returned.

use crate::core::config::data::McpServerConfig;
use crate::core::message::{InvocationErrorKind, InvocationRequest, InvocationResult};
use crate::mcp::catalog::{CapabilityCatalog, ToolDescriptor};
use crate::mcp::error::{CapabilityKind, McpError};
use crate::mcp::transport::{is_method_not_found, McpTransport, StdioTransport};
use protocol::{
    parse_call_tool, parse_get_prompt, parse_initialize_result, parse_list_prompts,
    parse_list_resource_templates, parse_list_resources, parse_list_tools, parse_response_value,
    prompt_text, resource_text, rpc_error, tool_result_text,
};
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use rust_mcp_schema::{
    CallToolRequestParams, ClientCapabilities, GetPromptRequestParams, Implementation,
    InitializeRequestParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, PaginatedRequestParams, ReadResourceRequestParams,
    ServerCapabilities,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

mod protocol;


const MCP_MAX_TOOL_LIST: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Initializing,
    Ready,
    Closed,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Unconnected => "unconnected",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        }
    }
}

pub struct McpSession {
    config: McpServerConfig,
    transport: Option<Box<dyn McpTransport>>,
    state: SessionState,
    server_details: Option<InitializeResult>,
    catalog: Arc<CapabilityCatalog>,
    prompt_cache: HashMap<String, String>,
}

impl McpSession {
    /// Spawns the configured server, performs the handshake and loads the catalog.
    pub async fn connect(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = StdioTransport::spawn(config)?;
        Self::open(config.clone(), Box::new(transport)).await
    }

    /// Like [`McpSession::connect`] over an already established transport.
    pub async fn open(
        config: McpServerConfig,
        transport: Box<dyn McpTransport>,
    ) -> Result<Self, McpError> {
        let mut session = Self::with_transport(config, transport);
        session.initialize().await?;
        if let Err(err) = session.refresh_catalog().await {
            session.shutdown().await;
            return Err(err);
        }
        Ok(session)
    }

    /// Wraps a transport without talking to it; call [`McpSession::initialize`] next.
    pub fn with_transport(config: McpServerConfig, transport: Box<dyn McpTransport>) -> Self {
        Self {
            config,
            transport: Some(transport),
            state: SessionState::Unconnected,
            server_details: None,
            catalog: Arc::new(CapabilityCatalog::default()),
            prompt_cache: HashMap::new(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn server_details(&self) -> Option<&InitializeResult> {
        self.server_details.as_ref()
    }

    pub fn catalog(&self) -> Arc<CapabilityCatalog> {
        Arc::clone(&self.catalog)
    }

    pub async fn initialize(&mut self) -> Result<InitializeResult, McpError> {
        if self.state != SessionState::Unconnected || self.transport.is_none() {
            return Err(McpError::InvalidState {
                state: self.state.label(),
            });
        }
        self.state = SessionState::Initializing;
        debug!(server_id = %self.config.id, "Starting MCP handshake");

        let outcome = self.handshake().await;
        match outcome {
            Ok(result) => {
                info!(
                    server_id = %self.config.id,
                    server = %result.server_info.name,
                    protocol_version = %result.protocol_version,
                    "MCP session ready"
                );
                self.server_details = Some(result.clone());
                self.state = SessionState::Ready;
                Ok(result)
            }
            Err(err) => {
                let err = match err {
                    McpError::Connection(_) | McpError::Protocol(_) => err,
                    other => McpError::Protocol(format!("handshake failed: {other}")),
                };
                warn!(server_id = %self.config.id, error = %err, "MCP handshake failed");
                self.shutdown().await;
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult, McpError> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(McpError::InvalidState {
                state: self.state.label(),
            });
        };
        let response = transport
            .send_request(
                RequestFromClient::InitializeRequest(client_details_for(&self.config)),
                self.config.handshake_timeout(),
            )
            .await?;
        let result = parse_initialize_result(response)?;
        transport
            .send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(result)
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(McpError::InvalidState {
                state: self.state.label(),
            })
        }
    }

    fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.server_details
            .as_ref()
            .map(|details| &details.capabilities)
    }

    fn supports_tools(&self) -> bool {
        self.server_capabilities()
            .map(|caps| caps.tools.is_some())
            .unwrap_or(true)
    }

    fn supports_resources(&self) -> bool {
        self.server_capabilities()
            .map(|caps| caps.resources.is_some())
            .unwrap_or(true)
    }

    fn supports_prompts(&self) -> bool {
        self.server_capabilities()
            .map(|caps| caps.prompts.is_some())
            .unwrap_or(true)
    }

    /// Sends one request; a fatal transport failure closes the session.
    async fn exchange(&mut self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        self.ensure_ready()?;
        let Some(transport) = self.transport.as_ref() else {
            return Err(McpError::InvalidState {
                state: self.state.label(),
            });
        };
        let result = transport
            .send_request(request, self.config.request_timeout())
            .await;
        self.settle(result).await
    }

    async fn settle<T>(&mut self, result: Result<T, McpError>) -> Result<T, McpError> {
        if let Err(err) = &result {
            if err.is_session_fatal() {
                warn!(server_id = %self.config.id, error = %err, "Closing MCP session after fatal error");
                self.shutdown().await;
            }
        }
        result
    }

    pub async fn list_tools(&mut self) -> Result<ListToolsResult, McpError> {
        self.ensure_ready()?;
        if !self.supports_tools() {
            return Ok(empty_list_tools());
        }

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let response = self
                .exchange(RequestFromClient::ListToolsRequest(paginated_params(
                    cursor.clone(),
                )))
                .await?;
            if is_method_not_found(&response) {
                break;
            }
            let page = self.settle(parse_list_tools(response)).await?;
            tools.extend(page.tools);
            if tools.len() >= MCP_MAX_TOOL_LIST {
                tools.truncate(MCP_MAX_TOOL_LIST);
                break;
            }
            match page.next_cursor {
                Some(next) if cursor.as_ref() != Some(&next) => cursor = Some(next),
                _ => break,
            }
        }

        Ok(ListToolsResult {
            meta: None,
            next_cursor: None,
            tools,
        })
    }

    pub async fn list_prompts(&mut self) -> Result<ListPromptsResult, McpError> {
        self.ensure_ready()?;
        if !self.supports_prompts() {
            return Ok(empty_list_prompts());
        }
        let response = self
            .exchange(RequestFromClient::ListPromptsRequest(None))
            .await?;
        if is_method_not_found(&response) {
            return Ok(empty_list_prompts());
        }
        self.settle(parse_list_prompts(response)).await
    }

    pub async fn list_resources(&mut self) -> Result<ListResourcesResult, McpError> {
        self.ensure_ready()?;
        if !self.supports_resources() {
            return Ok(empty_list_resources());
        }
        let response = self
            .exchange(RequestFromClient::ListResourcesRequest(None))
            .await?;
        if is_method_not_found(&response) {
            return Ok(empty_list_resources());
        }
        self.settle(parse_list_resources(response)).await
    }

    pub async fn list_resource_templates(
        &mut self,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.ensure_ready()?;
        if !self.supports_resources() {
            return Ok(empty_list_resource_templates());
        }
        let response = self
            .exchange(RequestFromClient::ListResourceTemplatesRequest(None))
            .await?;
        if is_method_not_found(&response) {
            return Ok(empty_list_resource_templates());
        }
        self.settle(parse_list_resource_templates(response)).await
    }

    /// Re-runs every listing and swaps in a fresh catalog.
    pub async fn refresh_catalog(&mut self) -> Result<Arc<CapabilityCatalog>, McpError> {
        let tools = self.list_tools().await?;
        let prompts = self.list_prompts().await?;
        let resources = self.list_resources().await?;
        let templates = self.list_resource_templates().await?;

        let catalog = CapabilityCatalog::from_lists(&tools, &prompts, &resources, &templates);
        debug!(
            server_id = %self.config.id,
            tools = catalog.tools().len(),
            prompts = catalog.prompts().len(),
            resources = catalog.resources().count(),
            resource_templates = catalog.resource_templates().count(),
            "MCP catalog refreshed"
        );
        self.catalog = Arc::new(catalog);
        self.prompt_cache.clear();
        Ok(self.catalog())
    }

    /// Renders a prompt template and joins the text of its messages.
    pub async fn get_prompt(
        &mut self,
        name: &str,
        params: &HashMap<String, String>,
    ) -> Result<String, McpError> {
        self.ensure_ready()?;
        let catalog = self.catalog();
        let template = catalog
            .prompt(name)
            .ok_or_else(|| McpError::not_found(CapabilityKind::Prompt, name))?;
        let missing: Vec<&str> = template
            .required_parameters()
            .filter(|param| !params.contains_key(&param.name))
            .map(|param| param.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(McpError::Argument(format!(
                "prompt '{name}' is missing required parameters: {}",
                missing.join(", ")
            )));
        }

        let request = GetPromptRequestParams {
            name: name.to_string(),
            arguments: if params.is_empty() {
                None
            } else {
                Some(params.clone())
            },
            meta: None,
        };
        debug!(server_id = %self.config.id, prompt = %name, "Rendering MCP prompt");
        let response = self
            .exchange(RequestFromClient::GetPromptRequest(request))
            .await?;
        let result = self.settle(parse_get_prompt(response)).await?;
        Ok(prompt_text(&result))
    }

    /// Renders a parameterless prompt at most once for the life of the session.
    pub async fn render_prompt_once(&mut self, name: &str) -> Result<String, McpError> {
        if let Some(text) = self.prompt_cache.get(name) {
            self.ensure_ready()?;
            return Ok(text.clone());
        }
        let text = self.get_prompt(name, &HashMap::new()).await?;
        self.prompt_cache.insert(name.to_string(), text.clone());
        Ok(text)
    }

    /// Invokes a catalog tool.
    ///
    /// Unknown tools and schema violations are returned as errors before any
    /// I/O. Failures reported by the server for a dispatched call come back as
    /// [`InvocationResult::Err`] and leave the session usable.
    pub async fn call_tool(
        &mut self,
        request: &InvocationRequest,
    ) -> Result<InvocationResult, McpError> {
        self.ensure_ready()?;
        let catalog = self.catalog();
        let tool = catalog
            .tool(&request.name)
            .ok_or_else(|| McpError::not_found(CapabilityKind::Tool, &request.name))?;
        validate_arguments(tool, &request.arguments)?;

        let params =
            CallToolRequestParams::new(&request.name).with_arguments(request.arguments.clone());
        debug!(
            server_id = %self.config.id,
            tool = %request.name,
            arguments = %request.arguments_json(),
            "Calling MCP tool"
        );
        let response = self
            .exchange(RequestFromClient::CallToolRequest(params))
            .await?;
        if let ServerMessage::Error(error) = &response {
            let message = match rpc_error(&error.error) {
                McpError::Rpc { message, .. } => message,
                other => other.to_string(),
            };
            debug!(tool = %request.name, error = %message, "MCP tool call rejected");
            return Ok(InvocationResult::error(InvocationErrorKind::Rpc, message));
        }

        let result = self.settle(parse_call_tool(response)).await?;
        let text = tool_result_text(&result);
        if result.is_error.unwrap_or(false) {
            debug!(tool = %request.name, error = %text, "MCP tool reported an error");
            Ok(InvocationResult::error(InvocationErrorKind::Tool, text))
        } else {
            Ok(InvocationResult::Ok(text))
        }
    }

    /// Reads a listed resource, or any URI matching a resource template.
    pub async fn read_resource(&mut self, uri: &str) -> Result<String, McpError> {
        self.ensure_ready()?;
        if self.catalog.resolve_resource(uri).is_none() {
            return Err(McpError::not_found(CapabilityKind::Resource, uri));
        }
        let request = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let response = self
            .exchange(RequestFromClient::ReadResourceRequest(request))
            .await?;
        let value = self.settle(parse_response_value(response)).await?;
        self.settle(resource_text(&value)).await
    }

    /// Closes the transport. Safe to call in any state, any number of times.
    pub async fn shutdown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            debug!(server_id = %self.config.id, "MCP session closed");
        }
        self.state = SessionState::Closed;
    }
}

fn validate_arguments(
    tool: &ToolDescriptor,
    arguments: &Map<String, Value>,
) -> Result<(), McpError> {
    let instance = Value::Object(arguments.clone());
    let problems: Vec<String> = match jsonschema::validator_for(&tool.input_schema) {
        Ok(validator) => validator
            .iter_errors(&instance)
            .map(|err| err.to_string())
            .collect(),
        Err(err) => {
            debug!(tool = %tool.name, error = %err, "Tool schema did not compile; checking required keys only");
            tool.required_arguments()
                .into_iter()
                .filter(|key| !arguments.contains_key(*key))
                .map(|key| format!("\"{key}\" is a required property"))
                .collect()
        }
    };
    if problems.is_empty() {
        Ok(())
    } else {
        Err(McpError::Argument(format!(
            "{}: {}",
            tool.name,
            problems.join("; ")
        )))
    }
}

fn client_details_for(config: &McpServerConfig) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "toolchat".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("toolchat".to_string()),
            description: Some("Terminal tool-calling chat client".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: protocol::requested_protocol_version(config),
    }
}

fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

fn empty_list_tools() -> ListToolsResult {
    ListToolsResult {
        meta: None,
        next_cursor: None,
        tools: Vec::new(),
    }
}

fn empty_list_resources() -> ListResourcesResult {
    ListResourcesResult {
        meta: None,
        next_cursor: None,
        resources: Vec::new(),
    }
}

fn empty_list_resource_templates() -> ListResourceTemplatesResult {
    ListResourceTemplatesResult {
        meta: None,
        next_cursor: None,
        resource_templates: Vec::new(),
    }
}

fn empty_list_prompts() -> ListPromptsResult {
    ListPromptsResult {
        meta: None,
        next_cursor: None,
        prompts: Vec::new(),
    }
}
