//! Service client: session setup, channel lifecycle and credential refresh.

use crate::channel::{ChannelOptions, IngestionChannel};
use crate::config::{
    CommitConfig, Config, ControlPlaneConfig, EncoderConfig, RefreshConfig, UploadConfig,
};
use crate::control_plane::{
    token_provider_from_config, ControlPlaneClient, ControlPlaneTransport, RequestIdGenerator,
    RestTransport,
};
use crate::error::Error;
use crate::metrics::ClientMetrics;
use crate::refresh::CredentialRefresher;
use crate::retry::{ExponentialBackoff, FixedDelay};
use crate::stage::{ObjectStoreUploaderFactory, SharedUploader, UploaderFactory};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Opaque resume marker persisted per channel.
pub type OffsetToken = String;

/// Options for opening a [`ServiceClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub account: String,
    pub user: String,
    pub role: String,
    pub control_plane: ControlPlaneConfig,
    pub upload: UploadConfig,
    pub commit: CommitConfig,
    pub refresh_interval: Duration,
    pub encoder: EncoderConfig,
}

impl ClientOptions {
    /// Options with default retry, refresh and encoder settings.
    pub fn new(
        account: impl Into<String>,
        user: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            user: user.into(),
            role: role.into(),
            control_plane: ControlPlaneConfig::default(),
            upload: UploadConfig::default(),
            commit: CommitConfig::default(),
            refresh_interval: Duration::from_secs(RefreshConfig::default().interval_seconds),
            encoder: EncoderConfig::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            account: config.account.account.clone(),
            user: config.account.user.clone(),
            role: config.account.role.clone(),
            control_plane: config.control_plane.clone(),
            upload: config.upload.clone(),
            commit: config.commit.clone(),
            refresh_interval: Duration::from_secs(config.refresh.interval_seconds),
            encoder: config.encoder.clone(),
        }
    }
}

/// State shared by a client and every channel it opened.
pub(crate) struct Session {
    pub(crate) control: ControlPlaneClient,
    pub(crate) uploader: Arc<SharedUploader>,
    pub(crate) metrics: Arc<ClientMetrics>,
    pub(crate) upload_policy: FixedDelay,
    pub(crate) commit_policy: ExponentialBackoff,
    pub(crate) encoder: EncoderConfig,
}

impl Session {
    /// Count a failed public operation.
    pub(crate) fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
        }
        result
    }
}

/// Builder for [`ServiceClient`] with pluggable collaborators.
pub struct ServiceClientBuilder {
    options: ClientOptions,
    transport: Option<Arc<dyn ControlPlaneTransport>>,
    uploader_factory: Option<Arc<dyn UploaderFactory>>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ServiceClientBuilder {
    /// Use this transport instead of the HTTP one.
    pub fn transport(mut self, transport: Arc<dyn ControlPlaneTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build stage uploaders with this factory instead of object_store.
    pub fn uploader_factory(mut self, factory: Arc<dyn UploaderFactory>) -> Self {
        self.uploader_factory = Some(factory);
        self
    }

    /// Record into existing metrics.
    pub fn metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Configure the session, build the initial uploader and start the
    /// refresh loop.
    pub async fn open(self, ct: &CancellationToken) -> Result<ServiceClient> {
        let options = self.options;
        let transport: Arc<dyn ControlPlaneTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(RestTransport::new(
                &options.control_plane,
                &options.account,
                token_provider_from_config(&options.control_plane)?,
            )?),
        };
        let factory = self
            .uploader_factory
            .unwrap_or_else(|| Arc::new(ObjectStoreUploaderFactory));
        let metrics = self.metrics.unwrap_or_default();

        let response = ControlPlaneClient::configure(transport.as_ref(), &options.role, ct).await?;
        let location = response.stage_location.as_ref().ok_or_else(|| {
            Error::Initialization("configure response has no stage location".into())
        })?;
        let uploader = factory.create(location).map_err(|e| {
            Error::Initialization(format!("unable to initialize stage uploader: {}", e))
        })?;
        let shared_uploader = Arc::new(SharedUploader::new(uploader));

        let request_ids = Arc::new(RequestIdGenerator::new(
            &response.prefix,
            response.deployment_id,
        ));
        let control = ControlPlaneClient::new(transport.clone(), options.role.clone(), request_ids);

        let refresher = CredentialRefresher::new(
            transport,
            options.role.clone(),
            response.deployment_id,
            factory,
            shared_uploader.clone(),
            metrics.clone(),
            options.refresh_interval,
        );
        refresher.start();

        info!(
            account = %options.account,
            user = %options.user,
            role = %options.role,
            prefix = %control.request_ids().prefix(),
            "Service client opened"
        );

        Ok(ServiceClient {
            session: Arc::new(Session {
                control,
                uploader: shared_uploader,
                metrics,
                upload_policy: FixedDelay::from_config(&options.upload),
                commit_policy: ExponentialBackoff::from_config(&options.commit),
                encoder: options.encoder.clone(),
            }),
            refresher,
            deployment_id: response.deployment_id,
            closed: AtomicBool::new(false),
        })
    }
}

/// One ingestion session.
///
/// Channels opened through a client share its request counter, uploader
/// and metrics. After [`ServiceClient::close`] the client and its channels
/// must not be used.
pub struct ServiceClient {
    session: Arc<Session>,
    refresher: Arc<CredentialRefresher>,
    deployment_id: i64,
    closed: AtomicBool,
}

impl ServiceClient {
    pub fn builder(options: ClientOptions) -> ServiceClientBuilder {
        ServiceClientBuilder {
            options,
            transport: None,
            uploader_factory: None,
            metrics: None,
        }
    }

    /// Open a client with the HTTP transport and object store uploaders.
    pub async fn open(options: ClientOptions, ct: &CancellationToken) -> Result<Self> {
        Self::builder(options).open(ct).await
    }

    /// Open a channel, or reuse an existing one with its current sequencers.
    pub async fn open_channel(
        &self,
        options: ChannelOptions,
        ct: &CancellationToken,
    ) -> Result<IngestionChannel> {
        let result = async {
            let response = self
                .session
                .control
                .open_channel(&options.channel_ref(), None, ct)
                .await?;
            IngestionChannel::from_open_response(options, self.session.clone(), response)
        }
        .await;

        let channel = self.session.observe(result)?;
        self.session.metrics.channel_opened();
        info!(
            channel = %channel.name(),
            table = %channel.options().table,
            client_sequencer = channel.client_sequencer(),
            row_sequencer = channel.row_sequencer(),
            "Channel opened"
        );
        Ok(channel)
    }

    /// Persisted offset token of one channel.
    pub async fn channel_status(
        &self,
        options: &ChannelOptions,
        ct: &CancellationToken,
    ) -> Result<Option<OffsetToken>> {
        let result = self
            .session
            .control
            .channel_status(&options.channel_ref(), None, ct)
            .await
            .map(|status| status.persisted_offset_token);
        self.session.observe(result)
    }

    /// Drop a channel. Open handles to it become stale.
    pub async fn drop_channel(&self, options: &ChannelOptions, ct: &CancellationToken) -> Result<()> {
        let result = self
            .session
            .control
            .drop_channel(&options.channel_ref(), ct)
            .await;
        self.session.observe(result)?;
        self.session.metrics.channel_dropped();
        info!(channel = %options.name, "Channel dropped");
        Ok(())
    }

    /// Run a credential refresh now instead of waiting for the next tick.
    pub async fn refresh_now(&self, ct: &CancellationToken) -> Result<()> {
        self.refresher.refresh_once(ct).await
    }

    /// Whether the last refresh published a usable uploader.
    pub fn uploader_healthy(&self) -> bool {
        self.session.uploader.is_healthy()
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.session.metrics
    }

    /// `{prefix}_{deployment_id}` assigned by the configure call.
    pub fn client_prefix(&self) -> &str {
        self.session.control.request_ids().prefix()
    }

    pub fn deployment_id(&self) -> i64 {
        self.deployment_id
    }

    /// Stop the refresh loop, then release the transport. Calling it again
    /// does nothing.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.refresher.stop().await;
        self.session.control.close().await?;
        info!(prefix = %self.client_prefix(), "Service client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let config: Config = toml::from_str(
            r#"
            [account]
            account = "myorg-acct"
            user = "LOADER"
            role = "INGEST"

            [control_plane]
            token = "jwt"

            [upload]
            max_attempts = 5

            [refresh]
            interval_seconds = 600
            "#,
        )
        .unwrap();

        let options = ClientOptions::from_config(&config);
        assert_eq!(options.account, "myorg-acct");
        assert_eq!(options.role, "INGEST");
        assert_eq!(options.upload.max_attempts, 5);
        assert_eq!(options.refresh_interval, Duration::from_secs(600));
        assert_eq!(options.commit.max_elapsed_seconds, 600);
    }

    #[test]
    fn test_default_refresh_margin() {
        let options = ClientOptions::new("a", "u", "r");
        assert_eq!(
            options.refresh_interval,
            Duration::from_secs(3600) - Duration::from_secs(120)
        );
    }
}
