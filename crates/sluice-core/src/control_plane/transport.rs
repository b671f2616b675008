//! Transport seam between the control-plane client and the wire.

use super::protocol::{
    ChannelStatusRequest, ChannelStatusResponse, ConfigureRequest, ConfigureResponse,
    DropChannelRequest, DropChannelResponse, OpenChannelRequest, OpenChannelResponse,
    RegisterBlobRequest, RegisterBlobResponse,
};
use crate::Result;
use async_trait::async_trait;

/// Request/response calls against the control plane.
///
/// Implementations return the decoded response body as-is. Checking the
/// embedded status codes is left to [`super::ControlPlaneClient`].
#[async_trait]
pub trait ControlPlaneTransport: Send + Sync {
    /// Configure the session and fetch the stage location.
    async fn configure(&self, request: &ConfigureRequest) -> Result<ConfigureResponse>;

    /// Open (or reopen) a channel.
    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<OpenChannelResponse>;

    /// Query persisted state for a batch of channels.
    async fn channel_status(&self, request: &ChannelStatusRequest)
        -> Result<ChannelStatusResponse>;

    /// Drop a channel.
    async fn drop_channel(&self, request: &DropChannelRequest) -> Result<DropChannelResponse>;

    /// Register uploaded blobs.
    async fn register_blob(&self, request: &RegisterBlobRequest) -> Result<RegisterBlobResponse>;

    /// Release connections. Calls made after close may fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
