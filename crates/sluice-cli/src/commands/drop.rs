//! Drop command implementation.

use super::{channel_options, connect, shutdown_token};
use anyhow::{Context, Result};
use sluice_core::Config;

/// Drop a channel. Its persisted offset token is discarded.
pub async fn run(config: Config, channel: &str) -> Result<()> {
    let options = channel_options(&config, channel)?;
    let ct = shutdown_token();
    let client = connect(&config, &ct).await?;

    let result = client
        .drop_channel(&options, &ct)
        .await
        .with_context(|| format!("Failed to drop channel {}", channel));

    client.close().await.context("Failed to close client")?;
    result?;

    println!("Dropped channel {}", options.name);
    Ok(())
}
