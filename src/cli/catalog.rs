use std::error::Error;
use std::fmt::Write;

use crate::core::config::Config;
use crate::mcp::{CapabilityCatalog, McpSession};

fn describe(description: Option<&str>) -> String {
    match description.map(str::trim).filter(|text| !text.is_empty()) {
        Some(text) => format!(" - {text}"),
        None => String::new(),
    }
}

/// Renders the catalog as indented plain text, one entry per line.
pub fn format_catalog(catalog: &CapabilityCatalog) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Tools ({}):", catalog.tools().len());
    for tool in catalog.tools() {
        let required = tool.required_arguments();
        let _ = write!(out, "  {}{}", tool.name, describe(tool.description.as_deref()));
        if !required.is_empty() {
            let _ = write!(out, " [requires: {}]", required.join(", "));
        }
        out.push('\n');
    }

    let _ = writeln!(out, "Prompts ({}):", catalog.prompts().len());
    for prompt in catalog.prompts() {
        let params: Vec<String> = prompt
            .arguments
            .iter()
            .map(|param| {
                if param.required {
                    param.name.clone()
                } else {
                    format!("{}?", param.name)
                }
            })
            .collect();
        let _ = writeln!(
            out,
            "  {}({}){}",
            prompt.name,
            params.join(", "),
            describe(prompt.description.as_deref())
        );
    }

    let resources: Vec<_> = catalog.resources().collect();
    let _ = writeln!(out, "Resources ({}):", resources.len());
    for resource in resources {
        let mime = resource
            .mime_type
            .as_deref()
            .map(|mime| format!(" ({mime})"))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  {}{}{}",
            resource.uri,
            mime,
            describe(resource.description.as_deref())
        );
    }

    let templates: Vec<_> = catalog.resource_templates().collect();
    let _ = writeln!(out, "Resource templates ({}):", templates.len());
    for template in templates {
        let _ = writeln!(
            out,
            "  {} ({}){}",
            template.uri,
            template.name,
            describe(template.description.as_deref())
        );
    }
    out
}

pub async fn run_catalog(config: &Config) -> Result<(), Box<dyn Error>> {
    let mut session = McpSession::connect(&config.server).await?;
    if let Some(details) = session.server_details() {
        println!(
            "Server: {} {} (protocol {})",
            details.server_info.name, details.server_info.version, details.protocol_version
        );
    }
    print!("{}", format_catalog(&session.catalog()));
    session.shutdown().await;
    Ok(())
}
