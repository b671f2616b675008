//! Blob upload to the staging location.
//!
//! The stage is reached through short-lived credentials returned by the
//! configure call. An uploader is therefore always built from a
//! [`StageLocation`] and replaced wholesale when credentials are refreshed
//! (see [`SharedUploader`]).

pub mod cloud;
pub mod shared;

pub use self::cloud::{ObjectStoreUploader, ObjectStoreUploaderFactory, StageKind};
pub use self::shared::{SharedUploader, UploaderSnapshot};
pub use crate::control_plane::protocol::StageLocation;

use crate::crypto::ContentDigest;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Writes one blob to the stage.
#[async_trait]
pub trait StageUploader: Send + Sync {
    /// Upload `data` to `path`, verifying it against `digest`.
    async fn upload(&self, path: &str, data: Bytes, digest: &ContentDigest) -> Result<()>;

    /// Human readable stage description for logs.
    fn describe(&self) -> String;
}

/// Builds uploaders from stage locations.
pub trait UploaderFactory: Send + Sync {
    fn create(&self, location: &StageLocation) -> Result<Arc<dyn StageUploader>>;
}
