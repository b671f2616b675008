//! `object_store` backed stage uploader.

use super::{StageLocation, StageUploader, UploaderFactory};
use crate::crypto::ContentDigest;
use crate::error::{Error, UploadError};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::debug;

/// Cloud provider of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    S3,
    Gcs,
    Azure,
    LocalFs,
}

impl StageKind {
    /// Parse the `locationType` of a stage descriptor.
    pub fn parse(location_type: &str) -> Result<Self> {
        match location_type.to_ascii_uppercase().as_str() {
            "S3" => Ok(StageKind::S3),
            "GCS" => Ok(StageKind::Gcs),
            "AZURE" => Ok(StageKind::Azure),
            "LOCAL_FS" => Ok(StageKind::LocalFs),
            other => Err(invalid(format!("unsupported location type {}", other))),
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Upload(UploadError::InvalidLocation(message.into()))
}

fn cred<'a>(location: &'a StageLocation, key: &str) -> Result<&'a str> {
    location
        .creds
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| invalid(format!("missing credential {}", key)))
}

/// Split `bucket/some/prefix/` into bucket and prefix.
fn split_location(location: &str) -> (&str, &str) {
    let trimmed = location.trim_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
        None => (trimmed, ""),
    }
}

/// Uploads blobs through an [`ObjectStore`].
#[derive(Debug)]
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    kind: StageKind,
    description: String,
}

impl ObjectStoreUploader {
    /// Wrap an existing store.
    pub fn new(store: Arc<dyn ObjectStore>, kind: StageKind, description: impl Into<String>) -> Self {
        Self {
            store,
            kind,
            description: description.into(),
        }
    }

    /// Build an uploader from a stage descriptor.
    pub fn from_location(location: &StageLocation) -> Result<Self> {
        let kind = StageKind::parse(&location.location_type)?;
        let store = match kind {
            StageKind::S3 => Self::create_s3_store(location)?,
            StageKind::Gcs => Self::create_gcs_store(location)?,
            StageKind::Azure => Self::create_azure_store(location)?,
            StageKind::LocalFs => Self::create_local_store(location)?,
        };
        let description = format!("{:?}:{}", kind, location.location);
        Ok(Self::new(store, kind, description))
    }

    fn with_prefix<T: ObjectStore>(store: T, prefix: &str) -> Arc<dyn ObjectStore> {
        if prefix.is_empty() {
            Arc::new(store)
        } else {
            Arc::new(PrefixStore::new(store, prefix))
        }
    }

    fn create_s3_store(location: &StageLocation) -> Result<Arc<dyn ObjectStore>> {
        use object_store::aws::AmazonS3Builder;

        let (bucket, prefix) = split_location(&location.location);
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_access_key_id(cred(location, "AWS_KEY_ID")?)
            .with_secret_access_key(cred(location, "AWS_SECRET_KEY")?);

        if let Ok(token) = cred(location, "AWS_TOKEN") {
            builder = builder.with_token(token);
        }
        if let Some(region) = &location.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &location.end_point {
            let endpoint = if endpoint.starts_with("http") {
                endpoint.clone()
            } else {
                format!("https://{}", endpoint)
            };
            builder = builder.with_endpoint(endpoint);
        }

        let store = builder
            .build()
            .map_err(|e| invalid(format!("Failed to create S3 client: {}", e)))?;
        Ok(Self::with_prefix(store, prefix))
    }

    fn create_gcs_store(location: &StageLocation) -> Result<Arc<dyn ObjectStore>> {
        use object_store::gcp::{GcpCredential, GoogleCloudStorageBuilder};
        use object_store::StaticCredentialProvider;

        let (bucket, prefix) = split_location(&location.location);
        let credential = GcpCredential {
            bearer: cred(location, "GCS_ACCESS_TOKEN")?.to_string(),
        };
        let store = GoogleCloudStorageBuilder::new()
            .with_bucket_name(bucket)
            .with_credentials(Arc::new(StaticCredentialProvider::new(credential)))
            .build()
            .map_err(|e| invalid(format!("Failed to create GCS client: {}", e)))?;
        Ok(Self::with_prefix(store, prefix))
    }

    fn create_azure_store(location: &StageLocation) -> Result<Arc<dyn ObjectStore>> {
        use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};

        let (container, prefix) = split_location(&location.location);
        let account = location
            .storage_account
            .as_deref()
            .ok_or_else(|| invalid("missing storage account"))?;
        let sas = cred(location, "AZURE_SAS_TOKEN")?.trim_start_matches('?');

        let store = MicrosoftAzureBuilder::new()
            .with_account(account)
            .with_container_name(container)
            .with_config(AzureConfigKey::SasKey, sas)
            .build()
            .map_err(|e| invalid(format!("Failed to create Azure client: {}", e)))?;
        Ok(Self::with_prefix(store, prefix))
    }

    fn create_local_store(location: &StageLocation) -> Result<Arc<dyn ObjectStore>> {
        use object_store::local::LocalFileSystem;

        let path = std::path::Path::new(&location.location);

        if !path.exists() {
            std::fs::create_dir_all(path).map_err(|e| {
                invalid(format!("Failed to create local stage directory: {}", e))
            })?;
        }

        let store = LocalFileSystem::new_with_prefix(path)
            .map_err(|e| invalid(format!("Failed to create local file system store: {}", e)))?;
        Ok(Arc::new(store))
    }

    fn store_error(path: &str, err: impl std::fmt::Display) -> Error {
        Error::Upload(UploadError::Store {
            path: path.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl StageUploader for ObjectStoreUploader {
    async fn upload(&self, path: &str, data: Bytes, digest: &ContentDigest) -> Result<()> {
        let actual = ContentDigest::of(&data);
        if actual != *digest {
            return Err(Error::Upload(UploadError::DigestMismatch {
                path: path.to_string(),
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            }));
        }

        let size = data.len();
        let result = self
            .store
            .put(&ObjectPath::from(path), PutPayload::from_bytes(data))
            .await
            .map_err(|e| Self::store_error(path, e))?;

        // Single-part S3 uploads report the content MD5 as their ETag.
        if self.kind == StageKind::S3 {
            if let Some(etag) = result.e_tag.as_deref().map(|t| t.trim_matches('"')) {
                if etag.len() == 32 && etag != digest.to_hex() {
                    return Err(Error::Upload(UploadError::DigestMismatch {
                        path: path.to_string(),
                        expected: digest.to_hex(),
                        actual: etag.to_string(),
                    }));
                }
            }
        }

        debug!(path = %path, size, stage = %self.description, "Uploaded blob");
        Ok(())
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

/// Default factory building [`ObjectStoreUploader`]s.
#[derive(Debug, Default, Clone)]
pub struct ObjectStoreUploaderFactory;

impl UploaderFactory for ObjectStoreUploaderFactory {
    fn create(&self, location: &StageLocation) -> Result<Arc<dyn StageUploader>> {
        Ok(Arc::new(ObjectStoreUploader::from_location(location)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::collections::HashMap;

    fn local_location(dir: &std::path::Path) -> StageLocation {
        StageLocation {
            location_type: "LOCAL_FS".into(),
            location: dir.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_location() {
        assert_eq!(split_location("bucket/a/b/"), ("bucket", "a/b"));
        assert_eq!(split_location("bucket"), ("bucket", ""));
        assert_eq!(split_location("/bucket/"), ("bucket", ""));
    }

    #[test]
    fn test_stage_kind_parse() {
        assert_eq!(StageKind::parse("s3").unwrap(), StageKind::S3);
        assert_eq!(StageKind::parse("LOCAL_FS").unwrap(), StageKind::LocalFs);
        assert!(StageKind::parse("FTP").is_err());
    }

    #[test]
    fn test_s3_requires_credentials() {
        let location = StageLocation {
            location_type: "S3".into(),
            location: "bucket/prefix/".into(),
            region: Some("us-west-2".into()),
            ..Default::default()
        };
        let err = ObjectStoreUploader::from_location(&location).unwrap_err();
        assert!(err.to_string().contains("AWS_KEY_ID"));
    }

    #[test]
    fn test_s3_from_location() {
        let location = StageLocation {
            location_type: "S3".into(),
            location: "bucket/prefix/".into(),
            region: Some("us-west-2".into()),
            creds: HashMap::from([
                ("AWS_KEY_ID".to_string(), "key".to_string()),
                ("AWS_SECRET_KEY".to_string(), "secret".to_string()),
                ("AWS_TOKEN".to_string(), "token".to_string()),
            ]),
            ..Default::default()
        };
        let uploader = ObjectStoreUploader::from_location(&location).unwrap();
        assert!(uploader.describe().contains("bucket/prefix/"));
    }

    #[tokio::test]
    async fn test_local_upload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let uploader = ObjectStoreUploaderFactory
            .create(&local_location(temp_dir.path()))
            .unwrap();

        let data = Bytes::from_static(b"encrypted blob");
        let digest = ContentDigest::of(&data);
        uploader
            .upload("2024/5/1/10/30/abc_prefix_1_1.bdec", data.clone(), &digest)
            .await
            .unwrap();

        let written =
            std::fs::read(temp_dir.path().join("2024/5/1/10/30/abc_prefix_1_1.bdec")).unwrap();
        assert_eq!(written, data.as_ref());
    }

    #[tokio::test]
    async fn test_digest_mismatch_rejected_before_write() {
        let store = Arc::new(InMemory::new());
        let uploader = ObjectStoreUploader::new(store.clone(), StageKind::LocalFs, "memory");

        let err = uploader
            .upload("a.bdec", Bytes::from_static(b"data"), &ContentDigest::of(b"other"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Upload(UploadError::DigestMismatch { .. })
        ));
        assert!(store.head(&ObjectPath::from("a.bdec")).await.is_err());
    }
}
