//! Error types for sluice core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.

use thiserror::Error;

/// Result type alias for sluice operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for sluice.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session could not be established
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Remote side rejected a channel operation
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Response shape violates the one-request/one-result contract
    #[error("Protocol invariant violated: {0}")]
    ProtocolInvariant(String),

    /// Upload to the stage failed
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    /// Commit confirmation failed
    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    /// The last credential refresh failed and no usable uploader exists
    #[error("Stale stage credentials: {0}")]
    StaleCredential(String),

    /// Batch could not be transformed or encoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Encryption error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Control-plane transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Operation cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel operations rejected by the control plane.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Open channel rejected
    #[error("Unable to open channel {channel} - status: {status}, message: {message}")]
    Open {
        channel: String,
        status: i64,
        message: String,
    },

    /// Drop channel rejected
    #[error("Unable to drop channel {channel} - status: {status}, message: {message}")]
    Drop {
        channel: String,
        status: i64,
        message: String,
    },

    /// Channel status rejected
    #[error("Unable to status channel {channel} - status: {status}, message: {message}")]
    Status {
        channel: String,
        status: i64,
        message: String,
    },

    /// Blob registration rejected for this channel
    #[error("Error ingesting data into channel {channel} ({status}): {message}")]
    Ingest {
        channel: String,
        status: i64,
        message: String,
    },
}

/// Stage upload errors.
#[derive(Error, Debug)]
pub enum UploadError {
    /// Object store rejected the write
    #[error("Object store error for {path}: {message}")]
    Store { path: String, message: String },

    /// Supplied digest does not match the payload or the stored object
    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Stage location cannot be turned into an uploader
    #[error("Invalid stage location: {0}")]
    InvalidLocation(String),

    /// All attempts failed
    #[error("Upload of {path} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        path: String,
        attempts: u32,
        last_error: String,
    },
}

/// Commit confirmation errors.
#[derive(Error, Debug)]
pub enum CommitError {
    /// Persisted row sequencer is behind the local one
    #[error("Row sequencer not yet committed: {persisted} < {local}")]
    NotCommitted { persisted: i64, local: i64 },

    /// Persisted client sequencer diverged; the channel was reopened elsewhere
    #[error("Channel {channel} invalidated: persisted client sequencer {persisted} != local {local}")]
    Invalidated {
        channel: String,
        persisted: i64,
        local: i64,
    },

    /// Polling budget exhausted
    #[error("Commit not confirmed after {polls} polls: {last_error}")]
    Timeout { polls: u32, last_error: String },
}

/// Columnar encoding errors.
#[derive(Error, Debug)]
pub enum EncodingError {
    /// Column type is not supported
    #[error("Unsupported column type {column_type} for column {column}")]
    UnsupportedType { column: String, column_type: String },

    /// Value could not be converted to the column type
    #[error("Invalid value for column {column}: {message}")]
    InvalidValue { column: String, message: String },

    /// Null value in a non-nullable column
    #[error("Null value for non-nullable column {0}")]
    NullValue(String),

    /// Row is not a JSON object
    #[error("Row {0} is not an object")]
    NotAnObject(usize),

    /// Arrow conversion error
    #[error("Arrow conversion error: {0}")]
    Arrow(String),

    /// Parquet write or read error
    #[error("Parquet error: {0}")]
    Parquet(String),
}

/// Crypto codec errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Channel key is not valid base64
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    /// Ciphertext has an unexpected length
    #[error("Invalid ciphertext length {0}")]
    InvalidLength(usize),
}

/// Control-plane transport errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// HTTP request failed before a response arrived
    #[error("Request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },

    /// Non-2xx HTTP status
    #[error("HTTP {status} from {endpoint}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Response body could not be decoded
    #[error("Invalid response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    /// Circuit breaker is open
    #[error("Circuit breaker open for control plane")]
    CircuitOpen,

    /// Bearer token could not be produced
    #[error("Authentication error: {0}")]
    Auth(String),
}

/// Stable error classification used for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Initialization,
    Channel,
    ProtocolInvariant,
    Upload,
    Commit,
    StaleCredential,
    Encoding,
    Crypto,
    Transport,
    Cancelled,
    Other,
}

impl ErrorKind {
    /// Label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Initialization => "initialization",
            ErrorKind::Channel => "channel",
            ErrorKind::ProtocolInvariant => "protocol_invariant",
            ErrorKind::Upload => "upload",
            ErrorKind::Commit => "commit",
            ErrorKind::StaleCredential => "stale_credential",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Transport => "transport",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "other",
        }
    }

    /// All kinds, in export order.
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::Config,
        ErrorKind::Initialization,
        ErrorKind::Channel,
        ErrorKind::ProtocolInvariant,
        ErrorKind::Upload,
        ErrorKind::Commit,
        ErrorKind::StaleCredential,
        ErrorKind::Encoding,
        ErrorKind::Crypto,
        ErrorKind::Transport,
        ErrorKind::Cancelled,
        ErrorKind::Other,
    ];
}

impl Error {
    /// Classify this error for metrics.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Initialization(_) => ErrorKind::Initialization,
            Error::Channel(_) => ErrorKind::Channel,
            Error::ProtocolInvariant(_) => ErrorKind::ProtocolInvariant,
            Error::Upload(_) => ErrorKind::Upload,
            Error::Commit(_) => ErrorKind::Commit,
            Error::StaleCredential(_) => ErrorKind::StaleCredential,
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::Crypto(_) => ErrorKind::Crypto,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) | Error::Serialization(_) => ErrorKind::Other,
        }
    }

    /// Whether a fresh attempt of the same call may succeed.
    ///
    /// Protocol invariant violations, invalidated channels and encoding
    /// failures are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Upload(UploadError::InvalidLocation(_)) => false,
            Error::Upload(_) => true,
            Error::Commit(CommitError::Invalidated { .. }) => false,
            Error::Commit(_) => true,
            Error::Transport(TransportError::Auth(_)) => false,
            Error::Transport(_) => true,
            Error::StaleCredential(_) => true,
            Error::Io(_) => true,
            _ => false,
        }
    }
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for EncodingError {
    fn from(err: arrow::error::ArrowError) -> Self {
        EncodingError::Arrow(err.to_string())
    }
}

impl From<parquet::errors::ParquetError> for EncodingError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        EncodingError::Parquet(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(err: arrow::error::ArrowError) -> Self {
        Error::Encoding(err.into())
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Error::Encoding(err.into())
    }
}
