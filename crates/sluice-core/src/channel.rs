//! Ingestion channel: one destination table's write path.
//!
//! An insert builds a columnar file from the batch, encrypts it, uploads it
//! to the stage and registers it with the control plane. The channel's
//! sequencers advance only after a well-formed, successful registration
//! response, so any failed or cancelled insert leaves them untouched and the
//! same batch can be retried as a fresh call.
//!
//! A channel has a single writer. [`IngestionChannel::insert_rows`] takes
//! `&mut self` and the channel is not `Clone`, so concurrent inserts on one
//! channel do not compile; different channels run fully in parallel.

use crate::blob_path::{self, file_name, generate_blob_path};
use crate::client::Session;
use crate::config::ChannelDefinition;
use crate::control_plane::client::{cancellable, ChannelRef};
use crate::control_plane::protocol::{
    BlobMetadata, BlobStats, ChannelMetadata, ChunkMetadata, OpenChannelResponse,
    RegisterBlobResponse, BDEC_VERSION, RESPONSE_SUCCESS,
};
use crate::crypto::{self, ContentDigest, BLOCK_SIZE};
use crate::encoder::{
    build_schema, ep_info, read_file_statistics, transform_rows, write_file, EncodingPlan,
    PRIMARY_FILE_ID_KEY,
};
use crate::error::{ChannelError, CommitError, EncodingError, Error, TransportError, UploadError};
use crate::stage::StageUploader;
use crate::Result;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-file IV diversifier.
const DIVERSIFIER: u64 = 0;

/// Destination of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Unique among channels open on the same client; packed into blob paths
    pub id: i16,
    pub name: String,
    pub database: String,
    pub schema: String,
    pub table: String,
}

impl ChannelOptions {
    pub fn new(
        id: i16,
        name: impl Into<String>,
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub(crate) fn channel_ref(&self) -> ChannelRef<'_> {
        ChannelRef {
            name: &self.name,
            database: &self.database,
            schema: &self.schema,
            table: &self.table,
        }
    }
}

impl From<&ChannelDefinition> for ChannelOptions {
    fn from(def: &ChannelDefinition) -> Self {
        Self::new(
            def.id,
            def.name.clone(),
            def.database.clone(),
            def.schema.clone(),
            def.table.clone(),
        )
    }
}

/// Key material issued when the channel was opened.
#[derive(Clone)]
pub struct EncryptionInfo {
    key_id: i64,
    key: String,
}

impl EncryptionInfo {
    pub fn new(key_id: i64, key: impl Into<String>) -> Self {
        Self {
            key_id,
            key: key.into(),
        }
    }

    pub fn key_id(&self) -> i64 {
        self.key_id
    }
}

impl std::fmt::Debug for EncryptionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionInfo")
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Observability figures for one insert. They have no effect on control flow.
#[derive(Debug, Clone, Default)]
pub struct InsertStats {
    /// Transform, encode and encrypt time
    pub build_time: Duration,
    /// Duration of the successful upload attempt only
    pub upload_time: Duration,
    /// Encoded file size before padding and encryption
    pub compressed_output_size: usize,
    pub row_count: usize,
    pub blob_path: String,
    pub upload_attempts: u32,
}

struct OffsetRange {
    start: String,
    end: String,
}

/// A write connection to one table.
pub struct IngestionChannel {
    options: ChannelOptions,
    session: Arc<Session>,
    plan: EncodingPlan,
    encryption: EncryptionInfo,
    client_sequencer: i64,
    row_sequencer: i64,
    offset_token: Option<String>,
    /// Scratch buffer for the encoded file, reused across inserts
    buffer: Vec<u8>,
}

impl std::fmt::Debug for IngestionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionChannel")
            .field("options", &self.options)
            .field("client_sequencer", &self.client_sequencer)
            .field("row_sequencer", &self.row_sequencer)
            .field("offset_token", &self.offset_token)
            .finish_non_exhaustive()
    }
}

impl IngestionChannel {
    /// Build a channel from a successful open response.
    pub(crate) fn from_open_response(
        options: ChannelOptions,
        session: Arc<Session>,
        response: OpenChannelResponse,
    ) -> Result<Self> {
        let plan = build_schema(&response.table_columns)?;
        Ok(Self {
            options,
            session,
            plan,
            encryption: EncryptionInfo::new(response.encryption_key_id, response.encryption_key),
            client_sequencer: response.client_sequencer,
            row_sequencer: response.row_sequencer,
            offset_token: response.offset_token,
            buffer: Vec::new(),
        })
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn client_sequencer(&self) -> i64 {
        self.client_sequencer
    }

    pub fn row_sequencer(&self) -> i64 {
        self.row_sequencer
    }

    /// Offset token from open time or the last successful insert.
    pub fn latest_offset_token(&self) -> Option<&str> {
        self.offset_token.as_deref()
    }

    pub fn encryption_info(&self) -> &EncryptionInfo {
        &self.encryption
    }

    /// Arrow schema derived from the table columns.
    pub fn schema(&self) -> &arrow::datatypes::SchemaRef {
        &self.plan.schema
    }

    /// Write a batch of JSON object rows to the table.
    pub async fn insert_rows(
        &mut self,
        rows: &[Value],
        ct: &CancellationToken,
    ) -> Result<InsertStats> {
        let result = self.insert(rows, None, ct).await;
        self.session.observe(result)
    }

    /// Write a batch and persist `end_offset_token` as the channel's offset
    /// token once it is committed.
    pub async fn insert_rows_with_offsets(
        &mut self,
        rows: &[Value],
        start_offset_token: &str,
        end_offset_token: &str,
        ct: &CancellationToken,
    ) -> Result<InsertStats> {
        let offsets = OffsetRange {
            start: start_offset_token.to_string(),
            end: end_offset_token.to_string(),
        };
        let result = self.insert(rows, Some(offsets), ct).await;
        self.session.observe(result)
    }

    async fn insert(
        &mut self,
        rows: &[Value],
        offsets: Option<OffsetRange>,
        ct: &CancellationToken,
    ) -> Result<InsertStats> {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let start_time = Instant::now();
        let flush_start = Utc::now();

        let transformed = transform_rows(rows, &self.plan)?;

        let thread_id = blob_path::thread_id(self.options.id);
        let counter = self.session.control.request_ids().next_value();
        let path = generate_blob_path(
            flush_start,
            self.session.control.request_ids().prefix(),
            thread_id,
            counter,
        );
        self.plan
            .metadata
            .insert(PRIMARY_FILE_ID_KEY.to_string(), file_name(&path).to_string());

        write_file(
            &self.plan.schema,
            &transformed.batch,
            &self.plan.metadata,
            &self.session.encoder,
            &mut self.buffer,
        )?;
        let unencrypted_len = self.buffer.len();
        let file_stats = read_file_statistics(Bytes::copy_from_slice(&self.buffer))?;
        let chunk_length = i32::try_from(unencrypted_len).map_err(|_| {
            EncodingError::InvalidValue {
                column: String::new(),
                message: format!("encoded file of {} bytes is too large", unencrypted_len),
            }
        })?;

        let mut payload = Vec::with_capacity(crypto::padded_len(unencrypted_len, BLOCK_SIZE));
        payload.extend_from_slice(&self.buffer);
        crypto::pad_buffer(&mut payload, BLOCK_SIZE);
        crypto::encrypt(&mut payload, &self.encryption.key, &path, DIVERSIFIER)?;
        let file_digest = ContentDigest::of(&payload);
        let chunk_digest = ContentDigest::of(&payload[..unencrypted_len]);
        let payload = Bytes::from(payload);

        let upload_start = Instant::now();
        let build_time = upload_start - start_time;
        debug!(
            channel = %self.options.name,
            path = %path,
            rows = transformed.num_rows(),
            bytes = unencrypted_len,
            "Blob built"
        );

        let uploader = self.session.uploader.acquire()?;
        let (upload_time, upload_attempts) = self
            .upload_with_retry(uploader.as_ref(), &path, payload.clone(), &file_digest, ct)
            .await?;
        let upload_finish = Instant::now();

        let (start_offset_token, end_offset_token, offset_token) = match offsets {
            Some(range) => (Some(range.start), Some(range.end.clone()), Some(range.end)),
            None => (None, None, None),
        };
        let flush_start_ms = flush_start.timestamp_millis();

        let blob = BlobMetadata {
            path: path.clone(),
            md5: file_digest.to_hex(),
            bdec_version: BDEC_VERSION,
            blob_stats: BlobStats {
                flush_start_ms,
                build_duration_ms: build_time.as_millis() as i64,
                upload_duration_ms: (upload_finish - upload_start).as_millis() as i64,
            },
            chunks: vec![ChunkMetadata {
                database: self.options.database.clone(),
                schema: self.options.schema.clone(),
                table: self.options.table.clone(),
                chunk_start_offset: 0,
                chunk_length,
                chunk_length_uncompressed: file_stats.total_uncompressed_size,
                channels: vec![ChannelMetadata {
                    channel: self.options.name.clone(),
                    client_sequencer: self.client_sequencer,
                    row_sequencer: self.row_sequencer + 1,
                    start_offset_token,
                    end_offset_token,
                    offset_token: offset_token.clone(),
                }],
                chunk_md5: chunk_digest.to_hex(),
                eps: ep_info(
                    file_stats.row_count,
                    &self.plan.transformers,
                    &transformed.stats,
                ),
                encryption_key_id: self.encryption.key_id,
                first_insert_time_in_millis: flush_start_ms,
                last_insert_time_in_millis: flush_start_ms,
            }],
        };

        let response = self.session.control.register_blob(blob, ct).await?;
        let client_sequencer = self.check_registration(response)?;

        // Only point where local sequencing changes.
        self.row_sequencer += 1;
        self.client_sequencer = client_sequencer;
        if offset_token.is_some() {
            self.offset_token = offset_token;
        }

        let stats = InsertStats {
            build_time,
            upload_time,
            compressed_output_size: unencrypted_len,
            row_count: transformed.num_rows(),
            blob_path: path,
            upload_attempts,
        };
        self.session.metrics.record_insert(
            stats.row_count,
            payload.len(),
            start_time.elapsed(),
        );
        info!(
            channel = %self.options.name,
            path = %stats.blob_path,
            rows = stats.row_count,
            row_sequencer = self.row_sequencer,
            client_sequencer = self.client_sequencer,
            "Blob registered"
        );
        Ok(stats)
    }

    /// Upload with the fixed-delay policy. Returns the duration of the
    /// successful attempt and the number of attempts made.
    async fn upload_with_retry(
        &self,
        uploader: &dyn StageUploader,
        path: &str,
        data: Bytes,
        digest: &ContentDigest,
        ct: &CancellationToken,
    ) -> Result<(Duration, u32)> {
        let policy = self.session.upload_policy;
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            if let Some(delay) = policy.delay_before(attempt).filter(|d| !d.is_zero()) {
                self.session.metrics.record_upload_retry();
                tokio::select! {
                    biased;
                    _ = ct.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let started = Instant::now();
            match cancellable(ct, uploader.upload(path, data.clone(), digest)).await {
                Ok(()) => return Ok((started.elapsed(), attempt)),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        channel = %self.options.name,
                        path,
                        attempt,
                        error = %e,
                        "Stage upload failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(UploadError::RetriesExhausted {
            path: path.to_string(),
            attempts: policy.max_attempts,
            last_error,
        }
        .into())
    }

    /// Validate a registration response and return the echoed client
    /// sequencer.
    fn check_registration(&self, response: RegisterBlobResponse) -> Result<i64> {
        let mut blobs = response.blobs;
        if blobs.len() != 1 {
            return Err(Error::ProtocolInvariant(format!(
                "unexpected number of response blobs: {}",
                blobs.len()
            )));
        }
        let mut chunks = blobs.remove(0).chunks;
        if chunks.len() != 1 {
            return Err(Error::ProtocolInvariant(format!(
                "unexpected number of response blob chunks: {}",
                chunks.len()
            )));
        }
        let mut channels = chunks.remove(0).channels;
        if channels.len() != 1 {
            return Err(Error::ProtocolInvariant(format!(
                "unexpected number of channels for blob chunk: {}",
                channels.len()
            )));
        }
        let channel = channels.remove(0);
        if channel.status_code != RESPONSE_SUCCESS {
            let message = if channel.message.is_empty() {
                "(no message)".to_string()
            } else {
                channel.message
            };
            return Err(ChannelError::Ingest {
                channel: self.options.name.clone(),
                status: channel.status_code,
                message,
            }
            .into());
        }
        Ok(channel.client_sequencer)
    }

    /// Poll channel status until the remote side has persisted this
    /// channel's row sequencer. Returns the number of polls made.
    ///
    /// A diverged client sequencer means the channel was reopened elsewhere;
    /// that error is returned at once without further polling.
    pub async fn wait_until_committed(&self, ct: &CancellationToken) -> Result<u32> {
        let result = self.wait(ct).await;
        self.session.observe(result)
    }

    async fn wait(&self, ct: &CancellationToken) -> Result<u32> {
        let mut backoff = self.session.commit_policy.start();
        let mut polls = 0u32;

        loop {
            polls += 1;
            let error = match self.poll_commit(ct).await {
                Ok(()) => {
                    self.session.metrics.record_commit_polls(polls, true);
                    debug!(channel = %self.options.name, polls, "Commit confirmed");
                    return Ok(polls);
                }
                Err(e) if is_permanent_commit_error(&e) => {
                    self.session.metrics.record_commit_polls(polls, false);
                    return Err(e);
                }
                Err(e) => e,
            };

            let Some(delay) = backoff.next_delay() else {
                self.session.metrics.record_commit_polls(polls, false);
                return Err(CommitError::Timeout {
                    polls,
                    last_error: error.to_string(),
                }
                .into());
            };
            debug!(
                channel = %self.options.name,
                polls,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Commit not yet confirmed"
            );
            tokio::select! {
                biased;
                _ = ct.cancelled() => {
                    self.session.metrics.record_commit_polls(polls, false);
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn poll_commit(&self, ct: &CancellationToken) -> Result<()> {
        let status = self
            .session
            .control
            .channel_status(&self.options.channel_ref(), Some(self.client_sequencer), ct)
            .await?;

        if status.persisted_client_sequencer != self.client_sequencer {
            return Err(CommitError::Invalidated {
                channel: self.options.name.clone(),
                persisted: status.persisted_client_sequencer,
                local: self.client_sequencer,
            }
            .into());
        }
        if status.persisted_row_sequencer < self.row_sequencer {
            return Err(CommitError::NotCommitted {
                persisted: status.persisted_row_sequencer,
                local: self.row_sequencer,
            }
            .into());
        }
        Ok(())
    }
}

fn is_permanent_commit_error(error: &Error) -> bool {
    matches!(
        error,
        Error::Cancelled
            | Error::ProtocolInvariant(_)
            | Error::Commit(CommitError::Invalidated { .. })
            | Error::Transport(TransportError::Auth(_))
    )
}
