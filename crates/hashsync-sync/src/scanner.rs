//! Local tree scanner
//!
//! Walks an install tree and hashes every regular file. Files that vanish or
//! become unreadable mid-scan are skipped with a warning; the scan itself only
//! fails when the root cannot be walked at all.

use crate::hasher::digest_file;
use hashsync_types::{BufferSize, Error, LocalFileRecord, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Options for a tree scan
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Follow symbolic links while walking
    pub follow_symlinks: bool,
    /// Subtrees to leave out, e.g. a staging directory inside the install root
    pub exclude: Vec<PathBuf>,
    /// Read buffer for hashing
    pub buffer_size: BufferSize,
}

/// Produces a [`LocalFileRecord`] for every regular file under a root
#[derive(Debug, Clone, Default)]
pub struct TreeScanner {
    options: ScanOptions,
}

impl TreeScanner {
    /// Create a scanner with the given options
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Scan `root` recursively
    ///
    /// A missing root yields an empty list (fresh install).
    pub async fn scan(&self, root: &Path, cancel: &CancellationToken) -> Result<Vec<LocalFileRecord>> {
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::io(format!(
                    "Install root '{}' is not a directory",
                    root.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Install root '{}' does not exist yet", root.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(Error::io_at(root, "inspect", &e)),
        }

        let candidates = self.list_files(root).await?;
        debug!("Hashing {} files under '{}'", candidates.len(), root.display());

        let mut records = Vec::with_capacity(candidates.len());
        for path in candidates {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let digest = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                digest = digest_file(&path, self.options.buffer_size) => digest,
            };

            match digest {
                Ok((hash, size)) => records.push(LocalFileRecord { path, size, hash }),
                Err(e) => warn!("Skipping '{}': {}", path.display(), e),
            }
        }

        info!("Scanned {} files in '{}'", records.len(), root.display());
        Ok(records)
    }

    async fn list_files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let root = root.to_path_buf();
        let follow_symlinks = self.options.follow_symlinks;
        let exclude = self.options.exclude.clone();

        tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .follow_links(follow_symlinks)
                .into_iter()
                .filter_entry(|entry| !exclude.iter().any(|ex| entry.path().starts_with(ex)))
                .filter_map(|entry| match entry {
                    Ok(entry) if entry.file_type().is_file() => Some(entry.into_path()),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("Skipping unreadable entry under '{}': {}", root.display(), e);
                        None
                    }
                })
                .collect()
        })
        .await
        .map_err(|e| Error::other(format!("Tree walk task failed: {}", e)))
    }
}
