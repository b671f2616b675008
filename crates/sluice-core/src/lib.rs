//! Sluice Core - streaming row ingestion client
//!
//! This library ingests rows into a warehouse table through long-lived
//! channels. Each insert is:
//!
//! - Encoded as a columnar (Parquet) blob with per-column statistics
//! - Encrypted with a per-channel key and uploaded to a cloud stage
//! - Registered with the control plane, which makes the rows visible
//!
//! Commit confirmation is a separate poll ([`IngestionChannel::wait_until_committed`]),
//! and stage credentials are refreshed in the background.

pub mod blob_path;
pub mod channel;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod control_plane;
pub mod crypto;
pub mod encoder;
pub mod error;
pub mod metrics;
pub mod refresh;
pub mod retry;
pub mod stage;

// Re-export commonly used types
pub use channel::{ChannelOptions, EncryptionInfo, IngestionChannel, InsertStats};
pub use client::{ClientOptions, OffsetToken, ServiceClient, ServiceClientBuilder};
pub use config::Config;
pub use error::{ChannelError, CommitError, EncodingError, ErrorKind, TransportError, UploadError};
pub use error::{Error, Result};
pub use metrics::ClientMetrics;
pub use tokio_util::sync::CancellationToken;
