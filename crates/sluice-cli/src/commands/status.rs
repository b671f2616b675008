//! Status command implementation.

use super::{channel_options, connect, shutdown_token};
use anyhow::{Context, Result};
use sluice_core::Config;

/// Print the persisted offset token of a channel.
pub async fn run(config: Config, channel: &str) -> Result<()> {
    let options = channel_options(&config, channel)?;
    let ct = shutdown_token();
    let client = connect(&config, &ct).await?;

    let result = client
        .channel_status(&options, &ct)
        .await
        .with_context(|| format!("Failed to fetch status of channel {}", channel));

    client.close().await.context("Failed to close client")?;
    let offset_token = result?;

    println!(
        "Channel:      {}.{}.{}.{}",
        options.database, options.schema, options.table, options.name
    );
    println!("Client:       {}", client.client_prefix());
    println!(
        "Offset token: {}",
        offset_token.as_deref().unwrap_or("(none)")
    );
    Ok(())
}
