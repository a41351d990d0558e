//! Configuration management for hashsync
//!
//! Settings are layered: built-in defaults, then an optional YAML/TOML/JSON
//! file, then environment variables (`HASHSYNC__SECTION__KEY`). The merged
//! result is validated before use.
//!
//! # Examples
//!
//! ```rust
//! use hashsync_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("hashsync.yaml")
//!     .add_env_prefix("HASHSYNC")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Parallel transfers: {}", config.transfer.max_parallelism.get());
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use hashsync_types::{BufferSize, RetryConfig, ThreadCount, TimeoutConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Environment variable prefix used by the default loaders
pub const ENV_PREFIX: &str = "HASHSYNC";

/// Main configuration structure for hashsync
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Download settings
    pub transfer: TransferConfig,
    /// Staging area settings
    pub staging: StagingConfig,
    /// Progress sampling settings
    pub progress: ProgressConfig,
    /// Commit stage settings
    pub commit: CommitConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent blob downloads
    pub max_parallelism: ThreadCount,
    /// Per-item retry policy
    pub retry: RetryConfig,
    /// HTTP timeouts
    pub timeouts: TimeoutConfig,
    /// Buffer used when hashing and copying
    pub buffer_size: BufferSize,
    /// Base URL joined with `remote_name` when an entry has no URL
    pub url_prefix: Option<String>,
    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_parallelism: ThreadCount::for_transfers(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            buffer_size: BufferSize::default(),
            url_prefix: None,
            user_agent: format!("hashsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// What happens to staged blobs after a successful run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheRetention {
    /// Keep blobs as a content-addressed cache for future jobs
    Keep,
    /// Remove the blobs a run consumed once it finishes
    #[default]
    PurgeOnSuccess,
}

/// Staging area settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Directory holding blobs named by their hex hash
    pub directory: PathBuf,
    /// Retention policy for consumed blobs
    pub retention: CacheRetention,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            directory: dirs::cache_dir()
                .map(|dir| dir.join("hashsync").join("staging"))
                .unwrap_or_else(|| PathBuf::from(".hashsync").join("staging")),
            retention: CacheRetention::default(),
        }
    }
}

/// Progress sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Interval between throughput recomputations
    pub sample_interval_ms: u64,
    /// Interval between UI refreshes
    pub refresh_interval_ms: u64,
}

impl ProgressConfig {
    /// Sampling interval as a duration
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Refresh interval as a duration
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            refresh_interval_ms: 100,
        }
    }
}

/// Out-of-process helper used for privileged filesystem batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevationHelperConfig {
    /// Program to launch, e.g. `sudo`
    pub program: String,
    /// Arguments placed before the batch file path
    #[serde(default)]
    pub args: Vec<String>,
}

/// Commit stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Re-hash every placed file
    pub verify_after_place: bool,
    /// Run filesystem batches through this helper instead of in process
    pub elevation_helper: Option<ElevationHelperConfig>,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            verify_after_place: true,
            elevation_helper: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when neither flags nor `RUST_LOG` decide
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::default(),
        }
    }
}

pub(crate) mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            home().map(|home| home.join("Library").join("Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| home().map(|home| home.join(".config")))
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }

    pub fn cache_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            home().map(|home| home.join("Library").join("Caches"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CACHE_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| home().map(|home| home.join(".cache")))
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }

    #[cfg(any(target_os = "macos", target_os = "linux"))]
    fn home() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.transfer.retry.max_attempts, 3);
        assert!(config.transfer.max_parallelism.get() >= 2);
        assert_eq!(config.staging.retention, CacheRetention::PurgeOnSuccess);
        assert!(config.staging.directory.ends_with("staging"));
        assert_eq!(config.progress.sample_interval(), Duration::from_secs(1));
        assert!(config.commit.verify_after_place);
        assert!(config.commit.elevation_helper.is_none());
    }

    #[test]
    fn test_retention_names() {
        let yaml = serde_yaml::to_string(&CacheRetention::PurgeOnSuccess).unwrap();
        assert_eq!(yaml.trim(), "purge_on_success");
        let parsed: CacheRetention = serde_yaml::from_str("keep").unwrap();
        assert_eq!(parsed, CacheRetention::Keep);
    }
}
