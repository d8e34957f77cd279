use std::error::Error;

use crate::core::config::Config;
use crate::mcp::McpSession;

pub async fn run_read(config: &Config, uri: &str) -> Result<(), Box<dyn Error>> {
    let mut session = McpSession::connect(&config.server).await?;
    let contents = session.read_resource(uri).await;
    session.shutdown().await;
    println!("{}", contents?);
    Ok(())
}
