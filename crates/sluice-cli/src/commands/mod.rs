//! CLI subcommands.

pub mod drop;
pub mod ingest;
pub mod status;

use anyhow::{Context, Result};
use sluice_core::{CancellationToken, ChannelOptions, ClientOptions, Config, ServiceClient};
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Look up a channel definition by name.
pub fn channel_options(config: &Config, name: &str) -> Result<ChannelOptions> {
    config
        .channel(name)
        .map(ChannelOptions::from)
        .with_context(|| format!("Channel {} is not defined in the configuration", name))
}

/// Open a service client for the configured account.
pub async fn connect(config: &Config, ct: &CancellationToken) -> Result<ServiceClient> {
    ServiceClient::open(ClientOptions::from_config(config), ct)
        .await
        .with_context(|| format!("Failed to open client for account {}", config.account.account))
}

/// Token cancelled on SIGINT or SIGTERM.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received SIGINT (Ctrl+C), cancelling");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, cancelling");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT (Ctrl+C), cancelling");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, cancelling");
        }

        cancel.cancel();
    });

    token
}
