//! Background refresh of stage credentials.
//!
//! Stage credentials returned by the configure call expire. On every tick
//! the refresher re-runs configure, builds a new uploader from the returned
//! stage location, and publishes the outcome (uploader or error) to the
//! shared cell. A failed tick is not retried; the next tick is.

use crate::control_plane::{ControlPlaneClient, ControlPlaneTransport};
use crate::error::Error;
use crate::metrics::ClientMetrics;
use crate::stage::{SharedUploader, UploaderFactory};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest refresh period accepted.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic configure-and-swap task.
pub struct CredentialRefresher {
    transport: Arc<dyn ControlPlaneTransport>,
    role: String,
    deployment_id: i64,
    factory: Arc<dyn UploaderFactory>,
    uploader: Arc<SharedUploader>,
    metrics: Arc<ClientMetrics>,
    interval: Duration,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CredentialRefresher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn ControlPlaneTransport>,
        role: impl Into<String>,
        deployment_id: i64,
        factory: Arc<dyn UploaderFactory>,
        uploader: Arc<SharedUploader>,
        metrics: Arc<ClientMetrics>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            role: role.into(),
            deployment_id,
            factory,
            uploader,
            metrics,
            interval: interval.max(MIN_REFRESH_INTERVAL),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the refresh loop. The first refresh happens one interval from now.
    pub fn start(self: &Arc<Self>) {
        // The task holds a weak reference so dropping the client ends it.
        let refresher = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            // Skip the first immediate tick
            interval_timer.tick().await;

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {
                        let Some(refresher) = refresher.upgrade() else {
                            break;
                        };
                        let _ = refresher.refresh_once(&shutdown).await;
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Credential refresh task received shutdown signal");
                        break;
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
        info!(
            interval_seconds = interval.as_secs(),
            "Credential refresh loop started"
        );
    }

    /// Run one refresh cycle and publish its outcome.
    ///
    /// The error is returned as well as published. A cancelled cycle
    /// publishes nothing.
    pub async fn refresh_once(&self, ct: &CancellationToken) -> Result<()> {
        match self.build_uploader(ct).await {
            Ok(uploader) => {
                debug!(stage = %uploader.describe(), "Stage credentials refreshed");
                self.uploader.publish_uploader(uploader);
                self.metrics.record_refresh(true);
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, "Stage credential refresh failed");
                self.uploader.publish_error(&e);
                self.metrics.record_refresh(false);
                Err(e)
            }
        }
    }

    async fn build_uploader(
        &self,
        ct: &CancellationToken,
    ) -> Result<Arc<dyn crate::stage::StageUploader>> {
        let response = ControlPlaneClient::configure(self.transport.as_ref(), &self.role, ct).await?;
        if response.deployment_id != self.deployment_id {
            return Err(Error::Initialization(format!(
                "deployment id changed from {} to {}",
                self.deployment_id, response.deployment_id
            )));
        }
        let location = response
            .stage_location
            .ok_or_else(|| Error::Initialization("configure response has no stage location".into()))?;
        self.factory.create(&location)
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
            info!("Credential refresh loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CredentialRefresher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::protocol::*;
    use crate::crypto::ContentDigest;
    use crate::stage::{StageLocation, StageUploader};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ConfigureOnly {
        calls: AtomicU32,
        fail: AtomicBool,
        deployment_id: i64,
    }

    impl ConfigureOnly {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
                deployment_id: 7,
            })
        }
    }

    #[async_trait]
    impl ControlPlaneTransport for ConfigureOnly {
        async fn configure(&self, _request: &ConfigureRequest) -> Result<ConfigureResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                return Ok(ConfigureResponse {
                    status_code: 10,
                    message: "session expired".into(),
                    ..Default::default()
                });
            }
            Ok(ConfigureResponse {
                status_code: RESPONSE_SUCCESS,
                prefix: "pfx".into(),
                deployment_id: self.deployment_id,
                stage_location: Some(StageLocation {
                    location_type: "LOCAL_FS".into(),
                    location: format!("stage-{}", n),
                    ..Default::default()
                }),
                ..Default::default()
            })
        }

        async fn open_channel(&self, _: &OpenChannelRequest) -> Result<OpenChannelResponse> {
            unimplemented!()
        }

        async fn channel_status(&self, _: &ChannelStatusRequest) -> Result<ChannelStatusResponse> {
            unimplemented!()
        }

        async fn drop_channel(&self, _: &DropChannelRequest) -> Result<DropChannelResponse> {
            unimplemented!()
        }

        async fn register_blob(&self, _: &RegisterBlobRequest) -> Result<RegisterBlobResponse> {
            unimplemented!()
        }
    }

    struct Named(String);

    #[async_trait]
    impl StageUploader for Named {
        async fn upload(&self, _: &str, _: Bytes, _: &ContentDigest) -> Result<()> {
            Ok(())
        }

        fn describe(&self) -> String {
            self.0.clone()
        }
    }

    struct NamedFactory;

    impl UploaderFactory for NamedFactory {
        fn create(&self, location: &StageLocation) -> Result<Arc<dyn StageUploader>> {
            Ok(Arc::new(Named(location.location.clone())))
        }
    }

    fn refresher(
        transport: Arc<ConfigureOnly>,
        interval: Duration,
    ) -> (Arc<CredentialRefresher>, Arc<SharedUploader>, Arc<ClientMetrics>) {
        let shared = Arc::new(SharedUploader::new(Arc::new(Named("initial".into()))));
        let metrics = Arc::new(ClientMetrics::new());
        let refresher = CredentialRefresher::new(
            transport,
            "LOADER",
            7,
            Arc::new(NamedFactory),
            shared.clone(),
            metrics.clone(),
            interval,
        );
        (refresher, shared, metrics)
    }

    #[tokio::test]
    async fn test_refresh_once_publishes_uploader() {
        let transport = ConfigureOnly::new();
        let (refresher, shared, metrics) = refresher(transport, Duration::from_secs(60));

        refresher.refresh_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(shared.acquire().unwrap().describe(), "stage-1");
        assert_eq!(metrics.refreshes_succeeded_total(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_publishes_error() {
        let transport = ConfigureOnly::new();
        transport.fail.store(true, Ordering::SeqCst);
        let (refresher, shared, metrics) = refresher(transport, Duration::from_secs(60));

        let err = refresher
            .refresh_once(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
        assert!(matches!(shared.acquire(), Err(Error::StaleCredential(_))));
        assert_eq!(metrics.refreshes_failed_total(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_refresh_publishes_nothing() {
        let transport = ConfigureOnly::new();
        let (refresher, shared, _) = refresher(transport, Duration::from_secs(60));
        let ct = CancellationToken::new();
        ct.cancel();

        assert!(matches!(refresher.refresh_once(&ct).await, Err(Error::Cancelled)));
        assert_eq!(shared.snapshot().generation(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_and_stops() {
        let transport = ConfigureOnly::new();
        let (refresher, shared, _) = refresher(transport.clone(), Duration::from_secs(60));
        refresher.start();
        assert!(refresher.is_running());

        // No refresh before the first full interval.
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(shared.acquire().unwrap().describe(), "stage-2");

        refresher.stop().await;
        assert!(!refresher.is_running());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let transport = ConfigureOnly::new();
        let (refresher, _, _) = refresher(transport.clone(), Duration::ZERO);
        assert_eq!(refresher.interval, MIN_REFRESH_INTERVAL);

        refresher.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        refresher.stop().await;
    }
}
