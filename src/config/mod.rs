//! Configuration module for Focalpoint Ingest
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and comprehensive validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
fn expand_env_vars(s: &str) -> String {
    // Regex to capture ${VAR} or ${VAR:-default}
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let full_match = cap.get(0).unwrap();
        let var_name = cap.get(1).unwrap().as_str();

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => {
                if let Some(default) = cap.get(2) {
                    default.as_str().to_string()
                } else {
                    // No env var and no default. Keep the original placeholder.
                    full_match.as_str().to_string()
                }
            }
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

/// Custom deserializer for strings with environment variable expansion.
fn deserialize_with_env<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(expand_env_vars(&s))
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.storage.sidecar_endpoint) {
            return Err(ConfigError::ValidationError(
                "Invalid storage sidecar endpoint: must start with http:// or https://".into(),
            ));
        }

        if self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Storage bucket must not be empty".into(),
            ));
        }

        if !is_valid_http_url(&self.remote.base_url) {
            return Err(ConfigError::ValidationError(
                "Invalid remote base URL: must start with http:// or https://".into(),
            ));
        }

        if self.remote.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "Remote chunk size must be greater than zero".into(),
            ));
        }

        if self.limits.max_size_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "Maximum upload size must be greater than zero".into(),
            ));
        }

        if self.polling.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "Polling attempt ceiling must be greater than zero".into(),
            ));
        }

        if self.compression.target_height == 0 || self.compression.target_fps == 0 {
            return Err(ConfigError::ValidationError(
                "Compression targets must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
}

/// Object storage configuration
///
/// Access goes through a local signing sidecar which issues short-lived
/// signed URLs scoped to one object and one HTTP method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Signing sidecar endpoint. Supports ${VAR} expansion.
    #[serde(deserialize_with = "deserialize_with_env")]
    pub sidecar_endpoint: String,

    /// Bucket holding uploaded assets
    pub bucket: String,

    /// Private directory prefix inside the bucket
    #[serde(default = "default_private_dir")]
    pub private_dir: String,
}

fn default_private_dir() -> String {
    ".private".to_string()
}

/// Remote inference backend file API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the file-ingestion API. Supports ${VAR} expansion.
    #[serde(
        default = "default_remote_base_url",
        deserialize_with = "deserialize_with_env"
    )]
    pub base_url: String,

    /// API key. Supports ${VAR} expansion. May be empty; the pipeline fails
    /// the session at run time if no key is configured.
    #[serde(default, deserialize_with = "deserialize_with_env")]
    pub api_key: String,

    /// Chunk size for the resumable transfer protocol. Default: 16 MiB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Attempts per chunk before the transfer is declared failed. Default: 3
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_remote_base_url(),
            api_key: String::new(),
            chunk_size: default_chunk_size(),
            chunk_retries: default_chunk_retries(),
        }
    }
}

fn default_remote_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_chunk_size() -> usize {
    16 * 1024 * 1024 // 16 MiB
}

fn default_chunk_retries() -> u32 {
    3
}

/// Upload validation limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hard cap on declared upload size. Default: 2 GiB
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// Signed URL lifetime in seconds. Default: 900 (15 minutes)
    #[serde(default = "default_presign_ttl_sec")]
    pub presign_ttl_sec: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            presign_ttl_sec: default_presign_ttl_sec(),
        }
    }
}

fn default_max_size_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_presign_ttl_sec() -> u64 {
    900
}

/// Compression thresholds and transcode targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// File size threshold in MB. Default: 60
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: f64,

    /// Shorter-side resolution threshold in pixels. Default: 720
    #[serde(default = "default_max_height")]
    pub max_height: u32,

    /// Frame rate threshold. Default: 10
    #[serde(default = "default_max_fps")]
    pub max_fps: f64,

    /// Transcode target for the shorter side. Default: 720
    #[serde(default = "default_max_height")]
    pub target_height: u32,

    /// Transcode target frame rate. Default: 10
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size_mb(),
            max_height: default_max_height(),
            max_fps: default_max_fps(),
            target_height: default_max_height(),
            target_fps: default_target_fps(),
        }
    }
}

fn default_max_file_size_mb() -> f64 {
    60.0
}

fn default_max_height() -> u32 {
    720
}

fn default_max_fps() -> f64 {
    10.0
}

fn default_target_fps() -> u32 {
    10
}

/// Activation polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between status checks. Default: 5
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,

    /// Attempt ceiling before the session times out. Default: 60 (5 minutes)
    #[serde(default = "default_poll_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval_secs(),
            max_attempts: default_poll_max_attempts(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_max_attempts() -> u32 {
    60
}
