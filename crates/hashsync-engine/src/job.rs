//! Job descriptions

use hashsync_sync::{DirectoryRename, Manifest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// What a pipeline run does with its plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    /// Bring the tree to the target, reusing local content
    #[default]
    Install,
    /// Re-hash every file and replace missing or damaged ones
    Repair,
    /// Ignore local content; place every entry from staged blobs
    Reinstall,
    /// Stage blobs without touching the install tree
    Predownload,
    /// Switch from a source manifest to a target one, with deletions and
    /// directory renames
    Migrate,
    /// Update the directory of the running executable
    SelfUpdate,
}

impl JobMode {
    /// Whether the commit stage runs
    pub fn commits(self) -> bool {
        self != Self::Predownload
    }

    /// Whether local content may satisfy target entries
    pub fn reuses_local(self) -> bool {
        self != Self::Reinstall
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Repair => "repair",
            Self::Reinstall => "reinstall",
            Self::Predownload => "predownload",
            Self::Migrate => "migrate",
            Self::SelfUpdate => "self_update",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "install" | "update" => Ok(Self::Install),
            "repair" => Ok(Self::Repair),
            "reinstall" => Ok(Self::Reinstall),
            "predownload" => Ok(Self::Predownload),
            "migrate" => Ok(Self::Migrate),
            "self_update" => Ok(Self::SelfUpdate),
            other => Err(format!("Unknown job mode: {}", other)),
        }
    }
}

/// File written after everything else to mark the new state as complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerFile {
    /// Path relative to the install root
    pub relative_path: String,
    /// Full file content
    pub contents: Vec<u8>,
}

impl MarkerFile {
    /// Marker at `relative_path` with `contents`
    pub fn new(relative_path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            relative_path: relative_path.into(),
            contents: contents.into(),
        }
    }

    /// Absolute location under `root`
    pub fn path(&self, root: &Path) -> PathBuf {
        self.relative_path
            .split(['/', '\\'])
            .filter(|part| !part.is_empty())
            .fold(root.to_path_buf(), |path, part| path.join(part))
    }
}

/// Everything a pipeline needs to prepare a run
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Run mode
    pub mode: JobMode,
    /// Install root; resolved from the running executable for self-update
    pub install_root: Option<PathBuf>,
    /// Desired state
    pub target: Manifest,
    /// Currently applied state, for migrations
    pub source: Option<Manifest>,
    /// Directory renames, for migrations
    pub renames: Vec<DirectoryRename>,
    /// Completion marker
    pub marker: Option<MarkerFile>,
}

impl JobRequest {
    /// Request for `target` in `mode`
    pub fn new(mode: JobMode, target: Manifest) -> Self {
        Self {
            mode,
            install_root: None,
            target,
            source: None,
            renames: Vec::new(),
            marker: None,
        }
    }

    /// Install or update `root` to `target`
    pub fn install(root: impl Into<PathBuf>, target: Manifest) -> Self {
        Self::new(JobMode::Install, target).with_install_root(root)
    }

    /// Migrate `root` from `source` to `target`
    pub fn migrate(root: impl Into<PathBuf>, source: Manifest, target: Manifest) -> Self {
        Self::new(JobMode::Migrate, target)
            .with_install_root(root)
            .with_source(source)
    }

    /// Set the install root
    pub fn with_install_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.install_root = Some(root.into());
        self
    }

    /// Set the source manifest
    pub fn with_source(mut self, source: Manifest) -> Self {
        self.source = Some(source);
        self
    }

    /// Set directory renames
    pub fn with_renames(mut self, renames: Vec<DirectoryRename>) -> Self {
        self.renames = renames;
        self
    }

    /// Set the completion marker
    pub fn with_marker(mut self, marker: MarkerFile) -> Self {
        self.marker = Some(marker);
        self
    }
}

/// What a prepared run is about to do, shown while pending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Run mode
    pub mode: JobMode,
    /// Resolved install root
    pub install_root: PathBuf,
    /// Entries in the target manifest
    pub target_entries: usize,
    /// Distinct blobs to download
    pub blobs_to_fetch: usize,
    /// Bytes of those blobs
    pub bytes_to_fetch: u64,
    /// Bytes already present in staging from earlier runs
    pub bytes_already_staged: u64,
    /// Destination files to write
    pub files_to_place: usize,
    /// Entries satisfied by local content
    pub files_reused: usize,
    /// Entries already correct in place
    pub files_in_place: usize,
    /// Local files to delete
    pub files_to_remove: usize,
    /// Local files to copy into staging first
    pub files_to_harvest: usize,
    /// Directory renames that will run
    pub renames: usize,
}

impl PlanSummary {
    /// Bytes still to come over the network
    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_to_fetch.saturating_sub(self.bytes_already_staged)
    }

    /// Whether the run will change nothing
    pub fn is_noop(&self) -> bool {
        self.blobs_to_fetch == 0
            && self.files_to_place == 0
            && self.files_to_remove == 0
            && self.renames == 0
    }
}
