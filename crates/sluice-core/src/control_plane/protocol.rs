//! Streaming ingest control-plane request and response types.
//!
//! Every response carries a numeric `status_code`; only
//! [`RESPONSE_SUCCESS`] means success.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The only status code treated as success.
pub const RESPONSE_SUCCESS: i64 = 0;

/// Blob format version sent with every registered blob.
pub const BDEC_VERSION: i32 = 3;

/// Write mode for channels that upload through the stage.
pub const WRITE_MODE_CLOUD_STORAGE: &str = "CLOUD_STORAGE";

/// Configure client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureRequest {
    /// Role for the session
    pub role: String,
}

/// Configure client response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureResponse {
    pub status_code: i64,
    #[serde(default)]
    pub message: String,
    /// Client prefix used in request ids and blob names
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub deployment_id: i64,
    /// Where blobs are uploaded
    pub stage_location: Option<StageLocation>,
}

/// Staging location descriptor returned by the configure call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageLocation {
    /// `S3`, `GCS`, `AZURE` or `LOCAL_FS`
    pub location_type: String,
    /// Bucket (or container, or directory) followed by an optional prefix
    pub location: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub end_point: Option<String>,
    #[serde(default)]
    pub storage_account: Option<String>,
    #[serde(default)]
    pub presigned_url: Option<String>,
    #[serde(default)]
    pub is_client_side_encrypted: bool,
    #[serde(default)]
    pub use_s3_regional_url: bool,
    /// Short-lived credentials keyed by provider-specific names
    #[serde(default)]
    pub creds: HashMap<String, String>,
}

/// Open channel request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub request_id: String,
    pub role: String,
    pub channel: String,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub write_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_token: Option<String>,
}

/// Open channel response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    pub status_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub client_sequencer: i64,
    #[serde(default)]
    pub row_sequencer: i64,
    #[serde(default)]
    pub offset_token: Option<String>,
    #[serde(default)]
    pub table_columns: Vec<TableColumn>,
    #[serde(default)]
    pub encryption_key: String,
    #[serde(default)]
    pub encryption_key_id: i64,
}

/// Column description of the destination table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TableColumn {
    pub name: String,
    /// SQL type as declared, e.g. `NUMBER(38,0)`
    #[serde(rename = "type")]
    pub column_type: String,
    pub logical_type: String,
    #[serde(default)]
    pub physical_type: String,
    #[serde(default)]
    pub precision: Option<i32>,
    #[serde(default)]
    pub scale: Option<i32>,
    #[serde(default)]
    pub byte_length: Option<i64>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub collation: Option<String>,
    /// 1-based column position; derived from list order when absent
    #[serde(default)]
    pub ordinal: Option<i32>,
}

fn default_nullable() -> bool {
    true
}

/// Batch channel status request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatusRequest {
    pub role: String,
    pub channels: Vec<ChannelStatusEntry>,
}

/// One channel in a status request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatusEntry {
    pub database: String,
    pub schema: String,
    pub table: String,
    #[serde(rename = "channel_name")]
    pub channel: String,
    /// Sequencer the caller believes is current
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_sequencer: Option<i64>,
}

/// Batch channel status response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStatusResponse {
    pub status_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub channels: Vec<ChannelStatus>,
}

/// Persisted state of one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub status_code: i64,
    #[serde(default)]
    pub persisted_row_sequencer: i64,
    #[serde(default)]
    pub persisted_client_sequencer: i64,
    #[serde(default)]
    pub persisted_offset_token: Option<String>,
}

/// Drop channel request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropChannelRequest {
    pub request_id: String,
    pub role: String,
    pub channel: String,
    pub database: String,
    pub schema: String,
    pub table: String,
}

/// Drop channel response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropChannelResponse {
    pub status_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub channel: String,
}

/// Register blob request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBlobRequest {
    pub request_id: String,
    pub role: String,
    pub blobs: Vec<BlobMetadata>,
}

/// One uploaded blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub path: String,
    /// Hex MD5 of the uploaded ciphertext
    pub md5: String,
    pub chunks: Vec<ChunkMetadata>,
    pub bdec_version: i32,
    pub blob_stats: BlobStats,
}

/// Timing of the blob build and upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobStats {
    pub flush_start_ms: i64,
    pub build_duration_ms: i64,
    pub upload_duration_ms: i64,
}

/// One chunk (table slice) inside a blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub database: String,
    pub schema: String,
    pub table: String,
    pub chunk_start_offset: i64,
    /// Length of the chunk before padding
    pub chunk_length: i32,
    pub chunk_length_uncompressed: i64,
    pub channels: Vec<ChannelMetadata>,
    pub chunk_md5: String,
    pub eps: EpInfo,
    pub encryption_key_id: i64,
    #[serde(rename = "first_insert_time_in_ms")]
    pub first_insert_time_in_millis: i64,
    #[serde(rename = "last_insert_time_in_ms")]
    pub last_insert_time_in_millis: i64,
}

/// Per-channel sequencing inside a chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetadata {
    #[serde(rename = "channel_name")]
    pub channel: String,
    pub client_sequencer: i64,
    pub row_sequencer: i64,
    pub start_offset_token: Option<String>,
    pub end_offset_token: Option<String>,
    pub offset_token: Option<String>,
}

/// Chunk-level row count and per-column statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpInfo {
    pub rows: i64,
    pub columns: BTreeMap<String, FileColumnProperties>,
}

/// Statistics of one column in a chunk.
///
/// String values are hex-encoded and truncated to 32 bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileColumnProperties {
    pub column_id: i32,
    pub min_str_value: Option<String>,
    pub max_str_value: Option<String>,
    pub collation: Option<String>,
    pub min_str_non_collated: Option<String>,
    pub max_str_non_collated: Option<String>,
    pub min_int_value: i128,
    pub max_int_value: i128,
    pub min_real_value: f64,
    pub max_real_value: f64,
    pub distinct_values: i64,
    pub null_count: i64,
    pub max_length: i64,
}

/// Register blob response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterBlobResponse {
    pub status_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub blobs: Vec<BlobRegisterStatus>,
}

/// Status of one registered blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobRegisterStatus {
    #[serde(default)]
    pub chunks: Vec<ChunkRegisterStatus>,
}

/// Status of one registered chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkRegisterStatus {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub channels: Vec<ChannelRegisterStatus>,
}

/// Status of one channel in a registered chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelRegisterStatus {
    pub status_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "channel_name", default)]
    pub channel: String,
    #[serde(default)]
    pub client_sequencer: i64,
}
