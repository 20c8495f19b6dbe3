// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

use anyhow::Result;
use log::info;

use squash_agent::agent::{AgentConfig, run};

#[tokio::main]
async fn main() -> Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let config = AgentConfig::from_env()?;
    info!(
        "squash agent starting for attachment {}/{}",
        config.namespace, config.attachment_name
    );
    run(config).await
}
