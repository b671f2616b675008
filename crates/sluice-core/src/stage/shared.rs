//! Atomically replaceable uploader state.
//!
//! The refresh loop publishes a new [`UploaderSnapshot`] on every tick;
//! inserts load whichever snapshot is current when they reach the upload
//! step. Snapshots are never mutated after publication.

use super::StageUploader;
use crate::error::Error;
use crate::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Outcome of building an uploader from the latest stage location.
pub struct UploaderSnapshot {
    result: std::result::Result<Arc<dyn StageUploader>, String>,
    generation: u64,
    published_at: DateTime<Utc>,
}

impl UploaderSnapshot {
    /// The uploader, or the refresh error that replaced it.
    pub fn uploader(&self) -> std::result::Result<&Arc<dyn StageUploader>, &str> {
        self.result.as_ref().map_err(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Number of snapshots published before this one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }
}

impl std::fmt::Debug for UploaderSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploaderSnapshot")
            .field(
                "result",
                &self.result.as_ref().map(|u| u.describe()),
            )
            .field("generation", &self.generation)
            .field("published_at", &self.published_at)
            .finish()
    }
}

/// Shared cell holding the current [`UploaderSnapshot`].
pub struct SharedUploader {
    current: ArcSwap<UploaderSnapshot>,
}

impl SharedUploader {
    /// Start with a working uploader.
    pub fn new(uploader: Arc<dyn StageUploader>) -> Self {
        Self {
            current: ArcSwap::from_pointee(UploaderSnapshot {
                result: Ok(uploader),
                generation: 0,
                published_at: Utc::now(),
            }),
        }
    }

    fn publish(&self, result: std::result::Result<Arc<dyn StageUploader>, String>) {
        // Scheduled and on-demand refreshes may publish concurrently.
        self.current.rcu(|current| UploaderSnapshot {
            result: result.clone(),
            generation: current.generation + 1,
            published_at: Utc::now(),
        });
    }

    /// Publish a freshly built uploader.
    pub fn publish_uploader(&self, uploader: Arc<dyn StageUploader>) {
        self.publish(Ok(uploader));
    }

    /// Publish a refresh failure; subsequent acquires fail until the next
    /// successful publication.
    pub fn publish_error(&self, error: &Error) {
        self.publish(Err(error.to_string()));
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<UploaderSnapshot> {
        self.current.load_full()
    }

    /// Current uploader, or [`Error::StaleCredential`] if the last refresh failed.
    pub fn acquire(&self) -> Result<Arc<dyn StageUploader>> {
        let snapshot = self.snapshot();
        match &snapshot.result {
            Ok(uploader) => Ok(uploader.clone()),
            Err(message) => Err(Error::StaleCredential(format!(
                "failed to acquire stage uploader: {}",
                message
            ))),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.current.load().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ContentDigest;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct NamedUploader(&'static str);

    #[async_trait]
    impl StageUploader for NamedUploader {
        async fn upload(&self, _path: &str, _data: Bytes, _digest: &ContentDigest) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn test_publish_and_acquire() {
        let shared = SharedUploader::new(Arc::new(NamedUploader("first")));
        assert_eq!(shared.acquire().unwrap().describe(), "first");
        assert_eq!(shared.snapshot().generation(), 0);

        shared.publish_error(&Error::Initialization("configure failed".into()));
        let err = shared.acquire().err().unwrap();
        assert!(matches!(err, Error::StaleCredential(ref m) if m.contains("configure failed")));
        assert!(!shared.is_healthy());

        shared.publish_uploader(Arc::new(NamedUploader("second")));
        assert_eq!(shared.acquire().unwrap().describe(), "second");
        assert_eq!(shared.snapshot().generation(), 2);
    }

    #[test]
    fn test_snapshot_is_stable_across_publish() {
        let shared = SharedUploader::new(Arc::new(NamedUploader("first")));
        let held = shared.snapshot();
        shared.publish_error(&Error::Initialization("boom".into()));

        assert!(held.is_ok());
        assert_eq!(held.uploader().unwrap().describe(), "first");
        assert!(!shared.snapshot().is_ok());
    }

    #[test]
    fn test_concurrent_publishes_count_every_generation() {
        let shared = Arc::new(SharedUploader::new(Arc::new(NamedUploader("first"))));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if i % 2 == 0 {
                            shared.publish_uploader(Arc::new(NamedUploader("next")));
                        } else {
                            shared.publish_error(&Error::Initialization("expired".into()));
                        }
                        let _ = shared.acquire();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.snapshot().generation(), 800);
    }
}
