//! Configuration structures for sluice.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Account and session identity
    pub account: AccountConfig,

    /// Control-plane endpoint configuration
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Stage upload retry configuration
    #[serde(default)]
    pub upload: UploadConfig,

    /// Commit confirmation polling configuration
    #[serde(default)]
    pub commit: CommitConfig,

    /// Credential refresh configuration
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Columnar encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Channel definitions addressable by name
    #[serde(default)]
    pub channels: Vec<ChannelDefinition>,
}

/// Account and session identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Account identifier (e.g. `myorg-myaccount`)
    pub account: String,

    /// User name the bearer token was issued for
    pub user: String,

    /// Role used for every control-plane request
    pub role: String,
}

/// Control-plane endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlPlaneConfig {
    /// Base URL; derived from the account when absent
    pub url: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Bearer token (signed externally)
    pub token: Option<String>,

    /// Environment variable holding the bearer token
    pub token_env: Option<String>,

    /// Value of the token-type header
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// User agent sent with each request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Circuit breaker for the control-plane transport
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_seconds: default_request_timeout_seconds(),
            token: None,
            token_env: None,
            token_type: default_token_type(),
            user_agent: default_user_agent(),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Resolve the base URL for an account.
    pub fn base_url(&self, account: &str) -> String {
        match &self.url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.snowflakecomputing.com", account),
        }
    }

    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds before an open circuit allows a probe
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: u64,

    /// Probe successes needed to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_seconds: default_reset_timeout_seconds(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Stage upload retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Total attempts per upload
    #[serde(default = "default_upload_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_upload_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_upload_max_attempts(),
            retry_delay_ms: default_upload_retry_delay_ms(),
        }
    }
}

/// Commit confirmation polling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommitConfig {
    /// First poll delay in milliseconds
    #[serde(default = "default_commit_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Growth factor between polls
    #[serde(default = "default_commit_multiplier")]
    pub multiplier: f64,

    /// Cap on a single delay in milliseconds
    #[serde(default = "default_commit_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Total polling budget in seconds
    #[serde(default = "default_commit_max_elapsed_seconds")]
    pub max_elapsed_seconds: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_commit_initial_interval_ms(),
            multiplier: default_commit_multiplier(),
            max_interval_ms: default_commit_max_interval_ms(),
            max_elapsed_seconds: default_commit_max_elapsed_seconds(),
        }
    }
}

/// Credential refresh configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshConfig {
    /// Seconds between configure calls. Stage credentials expire after one
    /// hour, so the default leaves two minutes of margin.
    #[serde(default = "default_refresh_interval_seconds")]
    pub interval_seconds: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_refresh_interval_seconds(),
        }
    }
}

/// Columnar encoder configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderConfig {
    /// Parquet compression
    #[serde(default)]
    pub compression: ParquetCompression,

    /// Maximum rows per row group
    #[serde(default = "default_max_row_group_size")]
    pub max_row_group_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            compression: ParquetCompression::default(),
            max_row_group_size: default_max_row_group_size(),
        }
    }
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    /// Zstd compression (default)
    #[default]
    Zstd,
    /// Snappy compression
    Snappy,
    /// Gzip compression
    Gzip,
    /// No compression
    None,
}

/// A named channel destination.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChannelDefinition {
    /// Channel ID, unique among channels open on one client
    pub id: i16,

    /// Channel name
    pub name: String,

    /// Database name
    pub database: String,

    /// Schema name
    pub schema: String,

    /// Table name
    pub table: String,
}

/// Monitoring configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Plain text format (default)
    #[default]
    Text,
}

// Default value functions
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_token_type() -> String {
    "KEYPAIR_JWT".into()
}
fn default_user_agent() -> String {
    format!("sluice/{}", env!("CARGO_PKG_VERSION"))
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_seconds() -> u64 {
    30
}
fn default_success_threshold() -> u32 {
    2
}
fn default_upload_max_attempts() -> u32 {
    3
}
fn default_upload_retry_delay_ms() -> u64 {
    1000
}
fn default_commit_initial_interval_ms() -> u64 {
    1
}
fn default_commit_multiplier() -> f64 {
    10.0
}
fn default_commit_max_interval_ms() -> u64 {
    1000
}
fn default_commit_max_elapsed_seconds() -> u64 {
    600
}
fn default_refresh_interval_seconds() -> u64 {
    3600 - 120
}
fn default_max_row_group_size() -> usize {
    1024 * 1024
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.account.account.is_empty() {
            return Err(crate::Error::Config("Account is required".into()));
        }

        if self.account.user.is_empty() {
            return Err(crate::Error::Config("User is required".into()));
        }

        if self.account.role.is_empty() {
            return Err(crate::Error::Config("Role is required".into()));
        }

        if self.control_plane.token.is_none() && self.control_plane.token_env.is_none() {
            return Err(crate::Error::Config(
                "Either control_plane.token or control_plane.token_env is required".into(),
            ));
        }

        if self.upload.max_attempts == 0 {
            return Err(crate::Error::Config(
                "upload.max_attempts must be at least 1".into(),
            ));
        }

        if !self.commit.multiplier.is_finite() || self.commit.multiplier < 1.0 {
            return Err(crate::Error::Config(
                "commit.multiplier must be a finite number >= 1.0".into(),
            ));
        }

        if self.encoder.max_row_group_size == 0 {
            return Err(crate::Error::Config(
                "encoder.max_row_group_size must be at least 1".into(),
            ));
        }

        if self.refresh.interval_seconds == 0 {
            return Err(crate::Error::Config(
                "refresh.interval_seconds must be positive".into(),
            ));
        }

        if self.refresh.interval_seconds >= 3600 {
            tracing::warn!(
                interval_seconds = self.refresh.interval_seconds,
                "Refresh interval is not shorter than the one hour credential lifetime"
            );
        }

        let mut ids = std::collections::HashSet::new();
        let mut names = std::collections::HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id) {
                return Err(crate::Error::Config(format!(
                    "Duplicate channel id {}",
                    channel.id
                )));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Duplicate channel name {}",
                    channel.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a channel definition by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelDefinition> {
        self.channels.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            account: AccountConfig {
                account: "myorg-test".into(),
                user: "INGEST".into(),
                role: "INGEST_ROLE".into(),
            },
            control_plane: ControlPlaneConfig {
                token: Some("token".into()),
                ..Default::default()
            },
            upload: UploadConfig::default(),
            commit: CommitConfig::default(),
            refresh: RefreshConfig::default(),
            encoder: EncoderConfig::default(),
            monitoring: MonitoringConfig::default(),
            channels: vec![],
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_missing_token() {
        let mut config = test_config();
        config.control_plane.token = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn test_config_validation_empty_role() {
        let mut config = test_config();
        config.account.role = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_multiplier() {
        for multiplier in [f64::INFINITY, f64::NAN, 0.5] {
            let mut config = test_config();
            config.commit.multiplier = multiplier;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("commit.multiplier"));
        }
    }

    #[test]
    fn test_config_validation_infinite_multiplier_from_toml() {
        let toml = r#"
            [account]
            account = "myorg-test"
            user = "INGEST"
            role = "INGEST_ROLE"

            [control_plane]
            token = "token"

            [commit]
            multiplier = inf
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.commit.multiplier.is_infinite());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_zero_row_group_size() {
        let mut config = test_config();
        config.encoder.max_row_group_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_row_group_size"));
    }

    #[test]
    fn test_config_validation_duplicate_channel_id() {
        let mut config = test_config();
        let def = ChannelDefinition {
            id: 1,
            name: "a".into(),
            database: "DB".into(),
            schema: "PUBLIC".into(),
            table: "T".into(),
        };
        config.channels = vec![
            def.clone(),
            ChannelDefinition {
                name: "b".into(),
                ..def
            },
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate channel id 1"));
    }

    #[test]
    fn test_default_timings() {
        let upload = UploadConfig::default();
        assert_eq!(upload.max_attempts, 3);
        assert_eq!(upload.retry_delay_ms, 1000);

        let commit = CommitConfig::default();
        assert_eq!(commit.initial_interval_ms, 1);
        assert_eq!(commit.multiplier, 10.0);
        assert_eq!(commit.max_interval_ms, 1000);
        assert_eq!(commit.max_elapsed_seconds, 600);

        assert_eq!(RefreshConfig::default().interval_seconds, 3480);
    }

    #[test]
    fn test_base_url() {
        let config = ControlPlaneConfig::default();
        assert_eq!(
            config.base_url("myorg-test"),
            "https://myorg-test.snowflakecomputing.com"
        );

        let config = ControlPlaneConfig {
            url: Some("http://localhost:8080/".into()),
            ..Default::default()
        };
        assert_eq!(config.base_url("ignored"), "http://localhost:8080");
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [account]
            account = "myorg-test"
            user = "INGEST"
            role = "INGEST_ROLE"

            [control_plane]
            token_env = "SLUICE_TOKEN"

            [encoder]
            compression = "snappy"

            [[channels]]
            id = 7
            name = "orders"
            database = "DB"
            schema = "PUBLIC"
            table = "ORDERS"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.encoder.compression, ParquetCompression::Snappy);
        assert_eq!(config.monitoring.log_format, LogFormat::Text);
        assert_eq!(config.channel("orders").map(|c| c.id), Some(7));
        assert!(config.channel("missing").is_none());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.toml");
        std::fs::write(
            &path,
            "[account]\naccount = \"a\"\nuser = \"u\"\nrole = \"r\"\n[control_plane]\ntoken = \"t\"\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.account.role, "r");
    }

    #[test]
    fn test_parquet_compression_variants() {
        assert_eq!(ParquetCompression::default(), ParquetCompression::Zstd);
        assert_ne!(ParquetCompression::Snappy, ParquetCompression::Gzip);
    }
}
