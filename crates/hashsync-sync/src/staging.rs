//! Content-addressed staging area
//!
//! Blobs live at `<root>/<hex hash>`. The directory is pure cache: deleting
//! it at any time only costs re-downloads. Clones of one [`StagingArea`]
//! share a per-hash lock table so that two jobs never append to the same blob
//! at once.

use crate::hasher::digest_file;
use hashsync_types::{BufferSize, ChecksumMismatch, ContentHash, Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

type LockTable = HashMap<ContentHash, Arc<tokio::sync::Mutex<()>>>;

/// Directory of blobs keyed by content hash
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    locks: Arc<Mutex<LockTable>>,
}

impl StagingArea {
    /// Create a staging area rooted at `root`; nothing is touched on disk yet
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if needed
    pub async fn ensure(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::io_at(&self.root, "create staging directory", &e))
    }

    /// Path of the blob for `hash`
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.to_hex())
    }

    /// Current length of the (possibly partial) blob, 0 when absent
    pub async fn staged_len(&self, hash: &ContentHash) -> Result<u64> {
        let path = self.blob_path(hash);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::io_at(&path, "inspect staged blob", &e)),
        }
    }

    /// Remove a blob; missing blobs are fine
    pub async fn discard(&self, hash: &ContentHash) -> Result<()> {
        let path = self.blob_path(hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Discarded staged blob {}", hash);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_at(&path, "discard staged blob", &e)),
        }
    }

    /// Hash the staged blob; `None` when it does not exist
    pub async fn digest(&self, hash: &ContentHash, buffer_size: BufferSize) -> Result<Option<ContentHash>> {
        match digest_file(&self.blob_path(hash), buffer_size).await {
            Ok((actual, _)) => Ok(Some(actual)),
            Err(Error::FileNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Exclusive access to one blob slot
    pub async fn lock(&self, hash: &ContentHash) -> OwnedMutexGuard<()> {
        let slot = {
            let mut table = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(table.entry(*hash).or_default())
        };
        slot.lock_owned().await
    }

    /// Copy an existing local file into the blob slot for `hash`
    ///
    /// A staged blob of the expected size is kept only if it hashes to
    /// `hash`; otherwise it is replaced. The copy is verified before it takes
    /// the slot, so a source that changed since it was scanned fails here.
    /// Returns whether a copy happened.
    pub async fn harvest(
        &self,
        source: &Path,
        hash: &ContentHash,
        size: u64,
        buffer_size: BufferSize,
    ) -> Result<bool> {
        let _guard = self.lock(hash).await;

        if self.staged_len(hash).await? == size && size > 0 {
            if self.digest(hash, buffer_size).await? == Some(*hash) {
                debug!("Blob {} already staged, not harvesting '{}'", hash, source.display());
                return Ok(false);
            }
            warn!("Staged blob {} is corrupt, harvesting '{}' over it", hash, source.display());
            self.discard(hash).await?;
        }

        self.ensure().await?;
        let target = self.blob_path(hash);
        let partial = self.root.join(format!("{}.harvest", hash.to_hex()));
        tokio::fs::copy(source, &partial)
            .await
            .map_err(|e| Error::io_at(source, "harvest", &e))?;

        let actual = digest_file(&partial, buffer_size).await.map(|(actual, _)| actual);
        if !matches!(actual, Ok(ref actual) if actual == hash) {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(Error::ChecksumFailed {
                files: vec![ChecksumMismatch {
                    name: source.display().to_string(),
                    expected: *hash,
                    actual: actual.ok(),
                }],
            });
        }

        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| Error::io_at(&target, "finalize harvested blob", &e))?;

        debug!("Harvested '{}' into {}", source.display(), target.display());
        Ok(true)
    }

    /// Remove the given blobs, returning how many existed
    pub async fn purge<'a, I>(&self, hashes: I) -> usize
    where
        I: IntoIterator<Item = &'a ContentHash>,
    {
        let mut removed = 0;
        for hash in hashes {
            let path = self.blob_path(hash);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to purge staged blob '{}': {}", path.display(), e),
            }
        }
        removed
    }
}
