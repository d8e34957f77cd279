use crate::core::config::data::McpServerConfig;
use crate::mcp::error::McpError;
use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    CallToolResult, ContentBlock, GetPromptResult, InitializeResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, RpcError,
    LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

pub(crate) fn requested_protocol_version(config: &McpServerConfig) -> String {
    config
        .protocol_version
        .clone()
        .filter(|version| !version.trim().is_empty())
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

pub(crate) fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, McpError> {
    let value = parse_response_value(message)?;
    let result = serde_json::from_value::<InitializeResult>(value)
        .map_err(|err| McpError::Protocol(format!("Malformed initialize response: {err}")))?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::Protocol(
            "Initialize response carried no protocol version.".to_string(),
        ));
    }
    Ok(result)
}

pub(crate) fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, McpError> {
    parse_response(message)
}

pub(crate) fn parse_list_resources(
    message: ServerMessage,
) -> Result<ListResourcesResult, McpError> {
    parse_response(message)
}

pub(crate) fn parse_list_resource_templates(
    message: ServerMessage,
) -> Result<ListResourceTemplatesResult, McpError> {
    parse_response(message)
}

pub(crate) fn parse_list_prompts(message: ServerMessage) -> Result<ListPromptsResult, McpError> {
    parse_response(message)
}

pub(crate) fn parse_get_prompt(message: ServerMessage) -> Result<GetPromptResult, McpError> {
    parse_response(message)
}

pub(crate) fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, McpError> {
    parse_response(message)
}

fn parse_response<T: serde::de::DeserializeOwned>(message: ServerMessage) -> Result<T, McpError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| McpError::Protocol(err.to_string()))
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, McpError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| McpError::Protocol(err.to_string())),
        ServerMessage::Error(error) => Err(rpc_error(&error.error)),
        other => Err(McpError::Protocol(format_unexpected_server_message(&other))),
    }
}

pub(crate) fn rpc_error(error: &RpcError) -> McpError {
    McpError::Rpc {
        code: error.code,
        message: format_rpc_message(error),
    }
}

fn format_unexpected_server_message(message: &ServerMessage) -> String {
    format!("Unexpected MCP server message: {message:?}")
}

fn format_rpc_message(error: &RpcError) -> String {
    let mut output = error.message.clone();
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push_str(" (");
                output.push_str(&details);
                output.push(')');
            }
        }
    }
    output
}

pub(crate) fn content_to_string(content: &ContentBlock) -> String {
    match content {
        ContentBlock::TextContent(text) => text.text.clone(),
        _ => serde_json::to_string(content)
            .unwrap_or_else(|_| "Unsupported content block.".to_string()),
    }
}

pub(crate) fn prompt_text(result: &GetPromptResult) -> String {
    result
        .messages
        .iter()
        .map(|message| content_to_string(&message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Joins text blocks; falls back to structured content when the server sent no blocks.
pub(crate) fn tool_result_text(result: &CallToolResult) -> String {
    if result.content.is_empty() {
        if let Some(structured) = result
            .structured_content
            .as_ref()
            .and_then(|structured| serde_json::to_value(structured).ok())
        {
            return structured.to_string();
        }
    }
    result
        .content
        .iter()
        .map(content_to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Renders `resources/read` contents; binary payloads are summarized.
pub(crate) fn resource_text(value: &Value) -> Result<String, McpError> {
    let contents = value
        .get("contents")
        .and_then(Value::as_array)
        .ok_or_else(|| McpError::Protocol("Resource response has no contents.".to_string()))?;
    let parts = contents
        .iter()
        .map(|entry| {
            if let Some(text) = entry.get("text").and_then(Value::as_str) {
                return text.to_string();
            }
            let mime = entry
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream");
            let size = entry
                .get("blob")
                .and_then(Value::as_str)
                .map(str::len)
                .unwrap_or(0);
            format!("[binary resource: {mime}, {size} base64 bytes]")
        })
        .collect::<Vec<_>>();
    Ok(parts.join("\n"))
}
