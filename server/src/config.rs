//! Server configuration.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use derivative::Derivative;
use serde::{de, Deserialize};
use xdg::BaseDirectories;

use crate::secret::EncryptionKey;
use crate::storage::LocalStorageConfig;

/// Application prefix in XDG base directories.
///
/// This will be concatenated into `$XDG_CONFIG_HOME/ferry`.
const XDG_PREFIX: &str = "ferry";

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// This is useful for deploying to certain application platforms.
const ENV_CONFIG_BASE64: &str = "FERRY_SERVER_CONFIG_BASE64";

/// Configuration for the Ferry Server.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Database connection.
    pub database: DatabaseConfig,

    /// Storage for export artifacts.
    pub storage: LocalStorageConfig,

    /// Destination-side pipeline.
    #[serde(default = "Default::default")]
    pub pipeline: PipelineConfig,

    /// Stale work reaper.
    #[serde(default = "Default::default")]
    pub reaper: ReaperConfig,

    /// Source-side relation exports.
    #[serde(default = "Default::default")]
    pub export: ExportConfig,

    /// Key used to encrypt source credentials at rest.
    ///
    /// Set this to the base64 encoding of 32 randomly generated bytes.
    #[serde(rename = "encryption-key-base64")]
    #[serde(deserialize_with = "deserialize_base64_encryption_key")]
    #[derivative(Debug = "ignore")]
    pub encryption_key: EncryptionKey,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection URL.
    pub url: String,

    /// Whether to enable sending of periodic heartbeat queries.
    ///
    /// If enabled, a heartbeat query will be sent every minute.
    #[serde(default = "default_db_heartbeat")]
    pub heartbeat: bool,
}

/// Destination-side pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// The number of trackers processed concurrently by a worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// The interval between two passes over the work queue.
    #[serde(rename = "poll-interval")]
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// How long a claimed tracker belongs to a worker.
    ///
    /// A started tracker whose lease expired is considered abandoned
    /// and can be reclaimed by any worker.
    #[serde(with = "humantime_serde", default = "default_lease")]
    pub lease: Duration,

    /// How long a batch may stay in progress without an update.
    #[serde(rename = "stale-window")]
    #[serde(with = "humantime_serde", default = "default_stale_window")]
    pub stale_window: Duration,

    /// How long to wait for the source to produce an export.
    ///
    /// A tracker whose source export has not become available
    /// within this duration after the tracker started is failed.
    #[serde(rename = "export-wait-timeout")]
    #[serde(with = "humantime_serde", default = "default_export_wait_timeout")]
    pub export_wait_timeout: Duration,

    /// Retry policy for requests to the source.
    #[serde(default = "Default::default")]
    pub retry: RetryConfig,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// The maximum number of attempts, including the first one.
    #[serde(rename = "max-attempts")]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// The delay before the first retry.
    #[serde(rename = "initial-backoff")]
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// The maximum delay between two attempts.
    #[serde(rename = "max-backoff")]
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    pub max_backoff: Duration,
}

/// Stale work reaper configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReaperConfig {
    /// The frequency to run the reaper at.
    ///
    /// If zero, the periodic reaper is disabled, but it can still
    /// be run manually with `ferryd --mode reaper-once`.
    #[serde(with = "humantime_serde", default = "default_reaper_interval")]
    pub interval: Duration,

    /// How many times a stale batch is re-dispatched before giving up.
    ///
    /// Zero means stale batches are timed out right away.
    #[serde(rename = "max-batch-retries")]
    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: i32,
}

/// Source-side export configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    /// The number of objects per export batch.
    #[serde(rename = "batch-size")]
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// How long an export batch may stay started without an update.
    #[serde(rename = "stale-window")]
    #[serde(with = "humantime_serde", default = "default_stale_window")]
    pub stale_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            lease: default_lease(),
            stale_window: default_stale_window(),
            export_wait_timeout: default_export_wait_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: default_reaper_interval(),
            max_batch_retries: default_max_batch_retries(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            stale_window: default_stale_window(),
        }
    }
}

fn deserialize_base64_encryption_key<'de, D>(deserializer: D) -> Result<EncryptionKey, D::Error>
where
    D: de::Deserializer<'de>,
{
    use de::Error;

    let s = String::deserialize(deserializer)?;
    EncryptionKey::from_base64(&s).map_err(Error::custom)
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 8080))
}

fn default_db_heartbeat() -> bool {
    false
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_lease() -> Duration {
    Duration::from_secs(3600)
}

fn default_stale_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_export_wait_timeout() -> Duration {
    Duration::from_secs(8 * 3600)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_max_batch_retries() -> i32 {
    0
}

fn default_batch_size() -> i64 {
    1000
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configurations: {:?}", path);

    let config = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Failed to read configuration file {:?}: {}", path, e))?;
    load_config_from_str(&config)
}

pub fn load_config_from_str(s: &str) -> Result<Config> {
    toml::from_str(s).map_err(|e| anyhow!("Invalid configuration file: {}", e))
}

/// Loads the configuration in the standard order.
///
/// An explicit path takes precedence over the environment variable,
/// which takes precedence over the XDG configuration file.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    if let Some(config_path) = config_path {
        load_config_from_path(config_path)
    } else if let Ok(config_env) = env::var(ENV_CONFIG_BASE64) {
        tracing::info!("Using configurations from environment variable");

        let decoded = String::from_utf8(BASE64_STANDARD.decode(config_env.as_bytes())?)?;
        load_config_from_str(&decoded)
    } else {
        let config_path = get_xdg_config_path()?;
        load_config_from_path(&config_path)
    }
}

pub fn get_xdg_config_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    let config_path = xdg_dirs.place_config_file("server.toml")?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    #[test]
    fn test_minimal_config() {
        let config = load_config_from_str(&format!(
            r#"
            encryption-key-base64 = "{KEY}"

            [database]
            url = "sqlite::memory:"

            [storage]
            path = "/tmp/ferry"
            "#
        ))
        .unwrap();

        assert_eq!(Duration::from_secs(3600), config.pipeline.stale_window);
        assert_eq!(Duration::from_secs(3600), config.pipeline.lease);
        assert_eq!(4, config.pipeline.concurrency);
        assert_eq!(3, config.pipeline.retry.max_attempts);
        assert_eq!(1000, config.export.batch_size);
        assert_eq!(0, config.reaper.max_batch_retries);
        assert_eq!(Duration::from_secs(300), config.reaper.interval);

        // The key never shows up in debug output
        assert!(!format!("{:?}", config).contains(KEY));
    }

    #[test]
    fn test_full_config() {
        let config = load_config_from_str(&format!(
            r#"
            listen = "127.0.0.1:3000"
            encryption-key-base64 = "{KEY}"

            [database]
            url = "postgres://localhost/ferry"
            heartbeat = true

            [storage]
            path = "/var/lib/ferry"

            [pipeline]
            concurrency = 16
            poll-interval = "1s"
            stale-window = "30m"

            [pipeline.retry]
            max-attempts = 5
            max-backoff = "1m"

            [reaper]
            interval = "0s"
            max-batch-retries = 2

            [export]
            batch-size = 250
            "#
        ))
        .unwrap();

        assert_eq!(16, config.pipeline.concurrency);
        assert_eq!(Duration::from_secs(1800), config.pipeline.stale_window);
        assert_eq!(Duration::from_secs(60), config.pipeline.retry.max_backoff);
        assert_eq!(Duration::from_secs(1), config.pipeline.retry.initial_backoff);
        assert_eq!(Duration::ZERO, config.reaper.interval);
        assert_eq!(2, config.reaper.max_batch_retries);
        assert_eq!(250, config.export.batch_size);
    }

    #[test]
    fn test_invalid_config() {
        // Unknown key
        load_config_from_str(&format!(
            r#"
            encryption-key-base64 = "{KEY}"
            token-hs256-secret-base64 = "abc"

            [database]
            url = "sqlite::memory:"

            [storage]
            path = "/tmp/ferry"
            "#
        ))
        .unwrap_err();

        // Short key
        load_config_from_str(
            r#"
            encryption-key-base64 = "c2hvcnQ="

            [database]
            url = "sqlite::memory:"

            [storage]
            path = "/tmp/ferry"
            "#,
        )
        .unwrap_err();
    }
}
