//! Core data types for hashsync
//!
//! This module provides the data model shared across the pipeline: content
//! hashes, manifest entries, scanned local files, pipeline states, sampled
//! progress and run statistics.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Unique identifier for pipeline runs
pub type OperationId = uuid::Uuid;

/// File size in bytes
pub type FileSize = u64;

/// Transfer rate in bytes per second
pub type TransferRate = f64;

/// SHA-256 digest identifying a file by its full byte content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Digest length in bytes
    pub const LEN: usize = 32;

    /// Wrap raw digest bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64 character hex digest (either case)
    pub fn from_hex(text: &str) -> Result<Self> {
        let text = text.trim();
        let bytes = hex::decode(text)
            .map_err(|e| Error::manifest(format!("Invalid content hash '{}': {}", text, e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::manifest(format!(
                "Invalid content hash '{}': expected {} bytes, got {}",
                text,
                Self::LEN,
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw digest bytes
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, used as the staged blob file name
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

#[cfg(feature = "serde")]
impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// One file of the desired target state
///
/// `remote_name` is only the suggested final relative path; reconciliation
/// keys on `hash`, so two entries may legally share one hash.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ManifestEntry {
    /// Relative path, `/` separated
    pub remote_name: String,
    /// SHA-256 of the full content
    pub hash: ContentHash,
    /// Size in bytes
    pub size: FileSize,
    /// Explicit download URL; derived from a base prefix when absent
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub url: Option<String>,
}

impl ManifestEntry {
    /// Create an entry without an explicit URL
    pub fn new(remote_name: impl Into<String>, hash: ContentHash, size: FileSize) -> Self {
        Self {
            remote_name: remote_name.into(),
            hash,
            size,
            url: None,
        }
    }

    /// Set an explicit download URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Relative path built from the `/` (or `\`) separated remote name
    pub fn relative_path(&self) -> PathBuf {
        self.remote_name
            .split(['/', '\\'])
            .filter(|part| !part.is_empty())
            .collect()
    }

    /// Final destination under an install root
    pub fn destination(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path())
    }
}

/// A regular file discovered by the tree scanner
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocalFileRecord {
    /// Absolute path of the file
    pub path: PathBuf,
    /// Size in bytes at scan time
    pub size: FileSize,
    /// SHA-256 of the content at scan time
    pub hash: ContentHash,
}

/// Observable state of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PipelineState {
    /// Nothing prepared
    #[default]
    Idle,
    /// Scanning and reconciling
    Preparing,
    /// Plan ready, awaiting confirmation
    Pending,
    /// Fetching missing content
    Downloading,
    /// Applying the plan to the install tree
    Committing,
    /// Run completed successfully
    Finished,
    /// Run cancelled by the caller
    Stopped,
    /// Run failed
    Error,
    /// Job cannot run in this environment
    Unsupported,
}

impl PipelineState {
    /// States from which no further progress happens without a new prepare
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Stopped | Self::Error | Self::Unsupported
        )
    }

    /// States in which a run holds resources and can be cancelled
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Pending | Self::Downloading | Self::Committing
        )
    }

    /// Lowercase name used in logs and JSON output
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Committing => "committing",
            Self::Finished => "finished",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampled progress published to observers
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProgressSnapshot {
    /// Bytes downloaded so far, including bytes already staged by earlier runs
    pub bytes_downloaded: u64,
    /// Total bytes to download
    pub bytes_total: u64,
    /// Blobs downloaded and verified
    pub files_downloaded: u64,
    /// Blobs to download
    pub files_total: u64,
    /// Throughput over the last sampling interval, never negative
    pub speed: TransferRate,
    /// Estimated time remaining, `None` when indeterminate
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    /// Overall byte progress as a percentage
    pub fn overall_progress(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_downloaded as f64 / self.bytes_total as f64 * 100.0).min(100.0)
        } else {
            0.0
        }
    }

    /// File progress as a percentage
    pub fn file_progress(&self) -> f64 {
        if self.files_total > 0 {
            (self.files_downloaded as f64 / self.files_total as f64) * 100.0
        } else {
            0.0
        }
    }
}

/// Statistics of one pipeline run
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunStats {
    /// Unique blobs fetched over the network
    pub files_fetched: u64,
    /// Blobs found already staged and only re-verified
    pub files_already_staged: u64,
    /// Manifest entries satisfied by existing local content
    pub files_reused: u64,
    /// Destination files written by the commit stage
    pub files_placed: u64,
    /// Local files deleted by the commit stage
    pub files_removed: u64,
    /// Directories renamed by the commit stage
    pub directories_renamed: u64,
    /// Bytes received over the network in this run
    pub bytes_downloaded: u64,
    /// Total duration of the run
    pub duration: Duration,
}

impl RunStats {
    /// Create a new empty statistics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculate the overall download rate
    pub fn transfer_rate(&self) -> TransferRate {
        if self.duration.as_secs_f64() > 0.0 {
            self.bytes_downloaded as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }
}
