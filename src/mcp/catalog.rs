//! Discovered server capabilities.
//!
//! A catalog is built once per session from the four listing calls and then
//! shared read-only. Reconnecting replaces it wholesale.

use rust_mcp_schema::{
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, Prompt,
    Resource, ResourceTemplate, Tool,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments, as advertised by the server.
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: Option<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description,
            input_schema,
        }
    }

    /// Schema with `$schema` stripped; several model backends reject it.
    pub fn gateway_parameters(&self) -> Value {
        let mut schema = match &self.input_schema {
            Value::Object(_) => self.input_schema.clone(),
            _ => json!({"type": "object", "properties": {}}),
        };
        if let Some(object) = schema.as_object_mut() {
            object.remove("$schema");
        }
        schema
    }

    pub fn required_arguments(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|required| required.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

impl From<&Tool> for ToolDescriptor {
    fn from(tool: &Tool) -> Self {
        let input_schema = serde_json::to_value(&tool.input_schema)
            .unwrap_or_else(|_| json!({"type": "object", "properties": {}}));
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptParameter {
    pub name: String,
    pub description: Option<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptParameter>,
}

impl PromptTemplate {
    pub fn required_parameters(&self) -> impl Iterator<Item = &PromptParameter> {
        self.arguments.iter().filter(|arg| arg.required)
    }
}

impl From<&Prompt> for PromptTemplate {
    fn from(prompt: &Prompt) -> Self {
        Self {
            name: prompt.name.clone(),
            description: prompt.description.clone(),
            arguments: prompt
                .arguments
                .iter()
                .map(|arg| PromptParameter {
                    name: arg.name.clone(),
                    description: arg.description.clone(),
                    required: arg.required.unwrap_or(false),
                })
                .collect(),
        }
    }
}

/// A concrete resource URI or an RFC 6570 level-1 URI template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub is_template: bool,
}

impl ResourceDescriptor {
    pub fn matches(&self, uri: &str) -> bool {
        if self.is_template {
            template_matches(&self.uri, uri)
        } else {
            self.uri == uri
        }
    }
}

impl From<&Resource> for ResourceDescriptor {
    fn from(resource: &Resource) -> Self {
        Self {
            uri: resource.uri.clone(),
            name: resource.name.clone(),
            description: resource.description.clone(),
            mime_type: resource.mime_type.clone(),
            is_template: false,
        }
    }
}

impl From<&ResourceTemplate> for ResourceDescriptor {
    fn from(template: &ResourceTemplate) -> Self {
        Self {
            uri: template.uri_template.clone(),
            name: template.name.clone(),
            description: template.description.clone(),
            mime_type: template.mime_type.clone(),
            is_template: true,
        }
    }
}

enum TemplatePart<'a> {
    Literal(&'a str),
    Variable,
}

fn template_parts(template: &str) -> Vec<TemplatePart<'_>> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        if open > 0 {
            parts.push(TemplatePart::Literal(&rest[..open]));
        }
        // Adjacent variables cannot be told apart; treat them as one.
        if !matches!(parts.last(), Some(TemplatePart::Variable)) {
            parts.push(TemplatePart::Variable);
        }
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        parts.push(TemplatePart::Literal(rest));
    }
    parts
}

/// Simple string expansion never produces `/`, so a variable spans one segment.
fn template_matches(template: &str, uri: &str) -> bool {
    let parts = template_parts(template);
    let mut remaining = uri;
    for (index, part) in parts.iter().enumerate() {
        match part {
            TemplatePart::Literal(literal) => match remaining.strip_prefix(literal) {
                Some(rest) => remaining = rest,
                None => return false,
            },
            TemplatePart::Variable => {
                let end = match parts.get(index + 1) {
                    Some(TemplatePart::Literal(next)) => match remaining.find(next) {
                        Some(end) => end,
                        None => return false,
                    },
                    _ => remaining.len(),
                };
                let value = &remaining[..end];
                if value.is_empty() || value.contains('/') {
                    return false;
                }
                remaining = &remaining[end..];
            }
        }
    }
    remaining.is_empty()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityCatalog {
    tools: Vec<ToolDescriptor>,
    prompts: Vec<PromptTemplate>,
    resources: Vec<ResourceDescriptor>,
}

impl CapabilityCatalog {
    /// Builds a catalog, keeping the first entry for any repeated name.
    pub fn new(
        tools: Vec<ToolDescriptor>,
        prompts: Vec<PromptTemplate>,
        resources: Vec<ResourceDescriptor>,
    ) -> Self {
        Self {
            tools: dedupe(tools, |tool| tool.name.clone(), "tool"),
            prompts: dedupe(prompts, |prompt| prompt.name.clone(), "prompt"),
            resources: dedupe(resources, |resource| resource.uri.clone(), "resource"),
        }
    }

    pub fn from_lists(
        tools: &ListToolsResult,
        prompts: &ListPromptsResult,
        resources: &ListResourcesResult,
        templates: &ListResourceTemplatesResult,
    ) -> Self {
        let resource_entries = resources
            .resources
            .iter()
            .map(ResourceDescriptor::from)
            .chain(
                templates
                    .resource_templates
                    .iter()
                    .map(ResourceDescriptor::from),
            )
            .collect();
        Self::new(
            tools.tools.iter().map(ToolDescriptor::from).collect(),
            prompts.prompts.iter().map(PromptTemplate::from).collect(),
            resource_entries,
        )
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn prompts(&self) -> &[PromptTemplate] {
        &self.prompts
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.iter().filter(|resource| !resource.is_template)
    }

    pub fn resource_templates(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.iter().filter(|resource| resource.is_template)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn prompt(&self, name: &str) -> Option<&PromptTemplate> {
        self.prompts.iter().find(|prompt| prompt.name == name)
    }

    /// Finds the resource addressed by `uri`; exact URIs win over templates.
    pub fn resolve_resource(&self, uri: &str) -> Option<&ResourceDescriptor> {
        self.resources()
            .find(|resource| resource.uri == uri)
            .or_else(|| self.resource_templates().find(|template| template.matches(uri)))
    }

    /// The only tool, when the server exposes exactly one.
    pub fn sole_tool(&self) -> Option<&ToolDescriptor> {
        match self.tools.as_slice() {
            [tool] => Some(tool),
            _ => None,
        }
    }
}

fn dedupe<T>(items: Vec<T>, key: impl Fn(&T) -> String, label: &str) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let name = key(item);
            let fresh = seen.insert(name.clone());
            if !fresh {
                warn!(kind = label, name = %name, "Ignoring duplicate MCP {label}");
            }
            fresh
        })
        .collect()
}
