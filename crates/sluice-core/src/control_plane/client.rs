//! Control-plane operations with status checking and request identifiers.

use super::protocol::{
    ChannelStatus, ChannelStatusEntry, ChannelStatusRequest, ConfigureRequest,
    ConfigureResponse, DropChannelRequest, OpenChannelRequest, OpenChannelResponse,
    RegisterBlobRequest, RegisterBlobResponse, BlobMetadata, RESPONSE_SUCCESS,
    WRITE_MODE_CLOUD_STORAGE,
};
use super::transport::ControlPlaneTransport;
use crate::error::{ChannelError, Error};
use crate::Result;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identifies a channel on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef<'a> {
    pub name: &'a str,
    pub database: &'a str,
    pub schema: &'a str,
    pub table: &'a str,
}

/// Produces `{prefix}_{n}` request identifiers from a counter shared by
/// every channel of one client.
#[derive(Debug)]
pub struct RequestIdGenerator {
    prefix: String,
    counter: AtomicI64,
}

impl RequestIdGenerator {
    /// `prefix` is the session prefix joined with the deployment id.
    pub fn new(prefix: &str, deployment_id: i64) -> Self {
        Self {
            prefix: format!("{}_{}", prefix, deployment_id),
            counter: AtomicI64::new(0),
        }
    }

    /// Draw the next counter value.
    pub fn next_value(&self) -> i64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Draw the next counter value as a request identifier.
    pub fn next(&self) -> String {
        format!("{}_{}", self.prefix, self.next_value())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Run a control-plane call unless `ct` fires first.
pub(crate) async fn cancellable<T>(
    ct: &CancellationToken,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = ct.cancelled() => Err(Error::Cancelled),
        result = call => result,
    }
}

/// Session-scoped control-plane client.
pub struct ControlPlaneClient {
    transport: Arc<dyn ControlPlaneTransport>,
    role: String,
    request_ids: Arc<RequestIdGenerator>,
}

impl ControlPlaneClient {
    pub fn new(
        transport: Arc<dyn ControlPlaneTransport>,
        role: impl Into<String>,
        request_ids: Arc<RequestIdGenerator>,
    ) -> Self {
        Self {
            transport,
            role: role.into(),
            request_ids,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn request_ids(&self) -> &Arc<RequestIdGenerator> {
        &self.request_ids
    }

    /// Configure the session. Rejections are initialization errors.
    pub async fn configure(
        transport: &dyn ControlPlaneTransport,
        role: &str,
        ct: &CancellationToken,
    ) -> Result<ConfigureResponse> {
        let request = ConfigureRequest {
            role: role.to_string(),
        };
        let response = cancellable(ct, transport.configure(&request)).await?;
        if response.status_code != RESPONSE_SUCCESS {
            return Err(Error::Initialization(format!(
                "configure rejected - status: {}, message: {}",
                response.status_code, response.message
            )));
        }
        if response.stage_location.is_none() {
            return Err(Error::Initialization(
                "configure response has no stage location".into(),
            ));
        }
        Ok(response)
    }

    /// Open a channel, optionally seeding its offset token.
    pub async fn open_channel(
        &self,
        channel: &ChannelRef<'_>,
        offset_token: Option<String>,
        ct: &CancellationToken,
    ) -> Result<OpenChannelResponse> {
        let request = OpenChannelRequest {
            request_id: self.request_ids.next(),
            role: self.role.clone(),
            channel: channel.name.to_string(),
            database: channel.database.to_string(),
            schema: channel.schema.to_string(),
            table: channel.table.to_string(),
            write_mode: WRITE_MODE_CLOUD_STORAGE.to_string(),
            offset_token,
        };
        debug!(channel = channel.name, request_id = %request.request_id, "Opening channel");

        let response = cancellable(ct, self.transport.open_channel(&request)).await?;
        if response.status_code != RESPONSE_SUCCESS {
            return Err(ChannelError::Open {
                channel: channel.name.to_string(),
                status: response.status_code,
                message: response.message,
            }
            .into());
        }
        Ok(response)
    }

    /// Query the persisted state of exactly one channel.
    ///
    /// `client_sequencer` is sent along so the service can reject a stale
    /// caller.
    pub async fn channel_status(
        &self,
        channel: &ChannelRef<'_>,
        client_sequencer: Option<i64>,
        ct: &CancellationToken,
    ) -> Result<ChannelStatus> {
        let request = ChannelStatusRequest {
            role: self.role.clone(),
            channels: vec![ChannelStatusEntry {
                database: channel.database.to_string(),
                schema: channel.schema.to_string(),
                table: channel.table.to_string(),
                channel: channel.name.to_string(),
                client_sequencer,
            }],
        };

        let response = cancellable(ct, self.transport.channel_status(&request)).await?;
        if response.status_code != RESPONSE_SUCCESS {
            return Err(ChannelError::Status {
                channel: channel.name.to_string(),
                status: response.status_code,
                message: response.message,
            }
            .into());
        }

        let mut channels = response.channels;
        if channels.len() != 1 {
            return Err(Error::ProtocolInvariant(format!(
                "failed to retrieve channel status, got {} channels",
                channels.len()
            )));
        }
        let status = channels.remove(0);
        if status.status_code != RESPONSE_SUCCESS {
            return Err(ChannelError::Status {
                channel: channel.name.to_string(),
                status: status.status_code,
                message: response.message,
            }
            .into());
        }
        Ok(status)
    }

    /// Drop a channel.
    pub async fn drop_channel(&self, channel: &ChannelRef<'_>, ct: &CancellationToken) -> Result<()> {
        let request = DropChannelRequest {
            request_id: self.request_ids.next(),
            role: self.role.clone(),
            channel: channel.name.to_string(),
            database: channel.database.to_string(),
            schema: channel.schema.to_string(),
            table: channel.table.to_string(),
        };

        let response = cancellable(ct, self.transport.drop_channel(&request)).await?;
        if response.status_code != RESPONSE_SUCCESS {
            return Err(ChannelError::Drop {
                channel: channel.name.to_string(),
                status: response.status_code,
                message: response.message,
            }
            .into());
        }
        Ok(())
    }

    /// Register one uploaded blob. Per-channel statuses are left to the caller.
    pub async fn register_blob(
        &self,
        blob: BlobMetadata,
        ct: &CancellationToken,
    ) -> Result<RegisterBlobResponse> {
        let request = RegisterBlobRequest {
            request_id: self.request_ids.next(),
            role: self.role.clone(),
            blobs: vec![blob],
        };
        debug!(request_id = %request.request_id, path = %request.blobs[0].path, "Registering blob");

        let response = cancellable(ct, self.transport.register_blob(&request)).await?;
        if response.status_code != RESPONSE_SUCCESS {
            return Err(Error::Channel(ChannelError::Ingest {
                channel: request.blobs[0]
                    .chunks
                    .first()
                    .and_then(|c| c.channels.first())
                    .map(|c| c.channel.clone())
                    .unwrap_or_default(),
                status: response.status_code,
                message: response.message,
            }));
        }
        Ok(response)
    }

    /// Release the transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}
