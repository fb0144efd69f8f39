//! Configuration loading and types for the storage gateway.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every field has a default, so an empty file (or no
//! file at all) yields a working local setup.  The channel table lives in
//! its own YAML file, see [`load_channel_map`].

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::SigningScheme;
use crate::channel::ChannelConfigMap;
use crate::storage::gcp::{GcsEndpoints, GCS_API_BASE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Where the channel table is read from.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Cloud Storage client settings shared by every channel.
    #[serde(default)]
    pub gcs: GcsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Channel table location.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Path to the channel YAML file.
    #[serde(default = "default_channels_path")]
    pub path: String,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            path: default_channels_path(),
        }
    }
}

/// Cloud Storage client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GcsConfig {
    /// JSON API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Media upload base URL.  Derived from `api_base` when unset.
    #[serde(default)]
    pub upload_base: Option<String>,

    /// Base of the download and signed URLs handed to callers.  Derived
    /// from `api_base` when unset.
    #[serde(default)]
    pub public_base: Option<String>,

    /// Directory for downloaded credential files.  Defaults to the
    /// system temp directory.
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Per-request timeout for backend HTTP calls, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Signed URL scheme: `v2` or `v4`.
    #[serde(default)]
    pub signing_scheme: SigningScheme,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            upload_base: None,
            public_base: None,
            cache_dir: None,
            request_timeout_secs: default_request_timeout(),
            signing_scheme: SigningScheme::default(),
        }
    }
}

impl GcsConfig {
    pub fn endpoints(&self) -> GcsEndpoints {
        let mut endpoints = GcsEndpoints::with_base(&self.api_base);
        if let Some(upload) = self.upload_base.as_deref().filter(|s| !s.is_empty()) {
            endpoints.upload_base = upload.trim_end_matches('/').to_string();
        }
        if let Some(public) = self.public_base.as_deref().filter(|s| !s.is_empty()) {
            endpoints.public_base = public.trim_end_matches('/').to_string();
        }
        endpoints
    }

    pub fn cache_dir(&self) -> PathBuf {
        match self.cache_dir.as_deref().filter(|s| !s.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::temp_dir(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9012
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_channels_path() -> String {
    "./channels.yaml".to_string()
}

fn default_api_base() -> String {
    GCS_API_BASE.to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// Load and validate the channel table at `path`.
pub fn load_channel_map<P: AsRef<Path>>(path: P) -> anyhow::Result<ChannelConfigMap> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read channel config {}: {e}", path.display()))?;
    ChannelConfigMap::from_yaml_str(&contents)
}
