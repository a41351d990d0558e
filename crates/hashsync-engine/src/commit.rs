//! Commit stage: applies a fully staged plan to the install tree
//!
//! Order of work:
//!
//! 1. Local files at risk are harvested into staging.
//! 2. An existing completion marker is backed up.
//! 3. One batch runs through the executor: deletions, directory renames,
//!    directory creation, then placements.
//! 4. Every placed file is re-hashed.
//! 5. The completion marker is written last.
//!
//! A failure or cancellation after step 2 restores the old marker, so the
//! tree keeps describing itself as not updated and a rerun repairs it.

use crate::executor::{FsOperation, OperationExecutor};
use crate::job::MarkerFile;
use hashsync_sync::{digest_file, renamed_path, DirectoryRename, ReconciliationPlan, ReuseSource, StagingArea};
use hashsync_types::{BufferSize, ChecksumMismatch, ContentHash, Error, ManifestEntry, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Commit settings
#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// Re-hash every placed file
    pub verify_after_place: bool,
    /// Buffer used for re-hashing
    pub buffer_size: BufferSize,
    /// Move staged blobs on their last use instead of copying them
    pub consume_staged: bool,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            verify_after_place: true,
            buffer_size: BufferSize::default(),
            consume_staged: false,
        }
    }
}

/// What a commit changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Local files copied into staging first
    pub harvested: usize,
    /// Destination files written
    pub placed: usize,
    /// Local files deleted
    pub removed: usize,
    /// Directories renamed
    pub renamed: usize,
    /// Placed files re-hashed
    pub verified: usize,
    /// Whether a completion marker was written
    pub marker_written: bool,
}

struct Placement<'a> {
    entry: &'a ManifestEntry,
    destination: PathBuf,
    operation: FsOperation,
}

/// Applies [`ReconciliationPlan`]s under one install root
pub struct CommitStage {
    install_root: PathBuf,
    staging: StagingArea,
    executor: Arc<dyn OperationExecutor>,
    options: CommitOptions,
}

impl std::fmt::Debug for CommitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitStage")
            .field("install_root", &self.install_root)
            .field("executor", &self.executor.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl CommitStage {
    /// Commit stage for `install_root`
    pub fn new(
        install_root: impl Into<PathBuf>,
        staging: StagingArea,
        executor: Arc<dyn OperationExecutor>,
        options: CommitOptions,
    ) -> Self {
        Self {
            install_root: install_root.into(),
            staging,
            executor,
            options,
        }
    }

    /// Apply `plan`; every blob it fetches must already be staged
    pub async fn apply(
        &self,
        plan: &ReconciliationPlan,
        renames: &[DirectoryRename],
        marker: Option<&MarkerFile>,
        cancel: &CancellationToken,
    ) -> Result<CommitReport> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut report = CommitReport::default();
        for item in &plan.to_harvest {
            if self
                .staging
                .harvest(&item.source, &item.hash, item.size, self.options.buffer_size)
                .await?
            {
                report.harvested += 1;
            }
        }

        let backup = match marker {
            Some(marker) => self.backup_marker(marker).await?,
            None => None,
        };

        let result = self
            .apply_changes(plan, renames, marker, cancel, &mut report)
            .await;

        if let (Some(marker), Some(backup)) = (marker, &backup) {
            if result.is_err() {
                self.restore_marker(marker, backup).await;
            }
            if let Err(e) = tokio::fs::remove_file(backup).await {
                warn!("Failed to remove marker backup '{}': {}", backup.display(), e);
            }
        }

        result.map(|()| report)
    }

    async fn apply_changes(
        &self,
        plan: &ReconciliationPlan,
        renames: &[DirectoryRename],
        marker: Option<&MarkerFile>,
        cancel: &CancellationToken,
        report: &mut CommitReport,
    ) -> Result<()> {
        let root = &self.install_root;
        let mut batch: Vec<FsOperation> = plan
            .to_remove
            .iter()
            .map(|record| FsOperation::Delete {
                path: record.path.clone(),
            })
            .collect();
        report.removed = batch.len();

        for rename in renames {
            let from = rename.from_path(root);
            let to = rename.to_path(root);
            match (path_exists(&from).await, path_exists(&to).await) {
                // Appeared after Preparing accepted the plan.
                (true, true) => {
                    return Err(Error::invalid_state(format!(
                        "Both '{}' and '{}' exist",
                        from.display(),
                        to.display()
                    )))
                }
                (true, false) => {
                    batch.push(FsOperation::Rename { from, to });
                    report.renamed += 1;
                }
                (false, _) => debug!("Nothing to rename at '{}'", from.display()),
            }
        }

        let placements = self.placements(plan, renames);
        let directories: BTreeSet<PathBuf> = placements
            .iter()
            .filter_map(|p| p.destination.parent().map(Path::to_path_buf))
            .collect();
        batch.extend(
            directories
                .into_iter()
                .map(|path| FsOperation::CreateDir { path }),
        );
        batch.extend(placements.iter().map(|p| p.operation.clone()));
        report.placed = placements.len();

        info!(
            "Committing to '{}' via {} executor: {} removal(s), {} rename(s), {} placement(s)",
            root.display(),
            self.executor.name(),
            report.removed,
            report.renamed,
            report.placed
        );
        self.executor.execute(&batch, cancel).await?;

        if self.options.verify_after_place {
            report.verified = self.verify(&placements, cancel).await?;
        }

        if let Some(marker) = marker {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.write_marker(marker, cancel).await?;
            report.marker_written = true;
        }

        info!("Commit to '{}' complete", root.display());
        Ok(())
    }

    fn placements<'a>(
        &self,
        plan: &'a ReconciliationPlan,
        renames: &[DirectoryRename],
    ) -> Vec<Placement<'a>> {
        let root = &self.install_root;

        let mut remaining_uses: HashMap<ContentHash, usize> = HashMap::new();
        for entry in &plan.to_fetch {
            *remaining_uses.entry(entry.hash).or_default() += 1;
        }
        for item in &plan.to_reuse {
            if matches!(item.source, ReuseSource::Harvested(_)) {
                *remaining_uses.entry(item.entry.hash).or_default() += 1;
            }
        }

        let mut from_staging = |entry: &ManifestEntry, to: PathBuf| {
            let from = self.staging.blob_path(&entry.hash);
            let left = remaining_uses.entry(entry.hash).or_insert(1);
            *left = left.saturating_sub(1);
            if self.options.consume_staged && *left == 0 {
                FsOperation::Move { from, to }
            } else {
                FsOperation::Copy { from, to }
            }
        };

        let mut placements = Vec::with_capacity(plan.placements());
        for entry in &plan.to_fetch {
            let destination = entry.destination(root);
            let operation = from_staging(entry, destination.clone());
            placements.push(Placement {
                entry,
                destination,
                operation,
            });
        }
        for item in &plan.to_reuse {
            let destination = item.entry.destination(root);
            let operation = match &item.source {
                ReuseSource::InPlace => continue,
                ReuseSource::Local(path) => FsOperation::Copy {
                    from: renamed_path(root, renames, path),
                    to: destination.clone(),
                },
                ReuseSource::Harvested(_) => from_staging(&item.entry, destination.clone()),
            };
            placements.push(Placement {
                entry: &item.entry,
                destination,
                operation,
            });
        }
        placements
    }

    async fn verify(&self, placements: &[Placement<'_>], cancel: &CancellationToken) -> Result<usize> {
        let mut mismatches = Vec::new();
        for placement in placements {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let actual = match digest_file(&placement.destination, self.options.buffer_size).await {
                Ok((hash, _)) => Some(hash),
                Err(e) => {
                    warn!("Cannot re-hash '{}': {}", placement.destination.display(), e);
                    None
                }
            };
            if actual != Some(placement.entry.hash) {
                mismatches.push(ChecksumMismatch {
                    name: placement.entry.remote_name.clone(),
                    expected: placement.entry.hash,
                    actual,
                });
            }
        }

        if mismatches.is_empty() {
            debug!("Verified {} placed file(s)", placements.len());
            Ok(placements.len())
        } else {
            Err(Error::ChecksumFailed { files: mismatches })
        }
    }

    async fn backup_marker(&self, marker: &MarkerFile) -> Result<Option<PathBuf>> {
        let current = marker.path(&self.install_root);
        if !path_exists(&current).await {
            return Ok(None);
        }

        self.staging.ensure().await?;
        let backup = self
            .staging
            .root()
            .join(format!("marker-{}.bak", uuid::Uuid::new_v4()));
        tokio::fs::copy(&current, &backup)
            .await
            .map_err(|e| Error::io_at(&current, "back up marker", &e))?;
        debug!("Backed up '{}' to '{}'", current.display(), backup.display());
        Ok(Some(backup))
    }

    async fn restore_marker(&self, marker: &MarkerFile, backup: &Path) {
        let target = marker.path(&self.install_root);
        let restore = [FsOperation::Copy {
            from: backup.to_path_buf(),
            to: target.clone(),
        }];
        match self.executor.execute(&restore, &CancellationToken::new()).await {
            Ok(()) => info!("Restored '{}' after failed commit", target.display()),
            Err(e) => warn!("Failed to restore '{}': {}", target.display(), e),
        }
    }

    async fn write_marker(&self, marker: &MarkerFile, cancel: &CancellationToken) -> Result<()> {
        self.staging.ensure().await?;
        let pending = self
            .staging
            .root()
            .join(format!("marker-{}.new", uuid::Uuid::new_v4()));
        tokio::fs::write(&pending, &marker.contents)
            .await
            .map_err(|e| Error::io_at(&pending, "stage marker", &e))?;

        let target = marker.path(&self.install_root);
        let result = self
            .executor
            .execute(
                &[FsOperation::Copy {
                    from: pending.clone(),
                    to: target.clone(),
                }],
                cancel,
            )
            .await;
        let _ = tokio::fs::remove_file(&pending).await;
        result?;

        debug!("Wrote marker '{}'", target.display());
        Ok(())
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path).await.is_ok()
}
