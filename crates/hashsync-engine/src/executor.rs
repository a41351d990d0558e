//! Filesystem operation batches and the executors that run them
//!
//! The commit stage never touches the install tree directly. It describes
//! its work as a batch of [`FsOperation`]s and hands the batch to an
//! [`OperationExecutor`]: in process ([`LocalExecutor`]) or through an
//! out-of-process helper with elevated rights ([`ElevatedExecutor`]).

use async_trait::async_trait;
use hashsync_types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One filesystem change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FsOperation {
    /// Create a directory and its parents
    CreateDir {
        /// Directory to create
        path: PathBuf,
    },
    /// Delete a file or directory tree; absent paths are fine
    Delete {
        /// Path to delete
        path: PathBuf,
    },
    /// Rename a file or directory
    Rename {
        /// Current path
        from: PathBuf,
        /// New path
        to: PathBuf,
    },
    /// Copy a file, replacing the destination
    Copy {
        /// Source file
        from: PathBuf,
        /// Destination file
        to: PathBuf,
    },
    /// Move a file, replacing the destination
    Move {
        /// Source file
        from: PathBuf,
        /// Destination file
        to: PathBuf,
    },
}

impl fmt::Display for FsOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateDir { path } => write!(f, "mkdir {}", path.display()),
            Self::Delete { path } => write!(f, "delete {}", path.display()),
            Self::Rename { from, to } => {
                write!(f, "rename {} -> {}", from.display(), to.display())
            }
            Self::Copy { from, to } => write!(f, "copy {} -> {}", from.display(), to.display()),
            Self::Move { from, to } => write!(f, "move {} -> {}", from.display(), to.display()),
        }
    }
}

/// Serialized form of a batch handed to the elevated helper
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBatch {
    /// Operations, applied in order
    pub operations: Vec<FsOperation>,
}

impl OperationBatch {
    /// Wrap a list of operations
    pub fn new(operations: Vec<FsOperation>) -> Self {
        Self { operations }
    }

    /// Read a batch file
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::io_at(path, "read operation batch", &e))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::other(format!("Invalid operation batch '{}': {}", path.display(), e)))
    }

    /// Write a batch file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::other(format!("Failed to serialize operation batch: {}", e)))?;
        tokio::fs::write(path, text)
            .await
            .map_err(|e| Error::io_at(path, "write operation batch", &e))
    }
}

/// Runs batches of filesystem operations
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Apply `batch` in order
    ///
    /// An error means the batch did not fully succeed; no assumption is made
    /// about which operations completed.
    async fn execute(&self, batch: &[FsOperation], cancel: &CancellationToken) -> Result<()>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Executes operations in the current process
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a local executor
    pub fn new() -> Self {
        Self
    }

    /// Apply one operation
    pub async fn apply(&self, operation: &FsOperation) -> Result<()> {
        debug!("{}", operation);
        match operation {
            FsOperation::CreateDir { path } => tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| Error::io_at(path, "create directory", &e)),
            FsOperation::Delete { path } => delete(path).await,
            FsOperation::Rename { from, to } => {
                ensure_parent(to).await?;
                tokio::fs::rename(from, to)
                    .await
                    .map_err(|e| Error::io_at(from, "rename", &e))
            }
            FsOperation::Copy { from, to } => copy_replacing(from, to).await,
            FsOperation::Move { from, to } => {
                ensure_parent(to).await?;
                if tokio::fs::rename(from, to).await.is_ok() {
                    return Ok(());
                }
                // Different filesystems: fall back to copy and delete
                copy_replacing(from, to).await?;
                tokio::fs::remove_file(from)
                    .await
                    .map_err(|e| Error::io_at(from, "remove moved file", &e))
            }
        }
    }
}

#[async_trait]
impl OperationExecutor for LocalExecutor {
    async fn execute(&self, batch: &[FsOperation], cancel: &CancellationToken) -> Result<()> {
        for operation in batch {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.apply(operation).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io_at(parent, "create directory", &e)),
        None => Ok(()),
    }
}

async fn delete(path: &Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io_at(path, "inspect", &e)),
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_at(path, "delete", &e)),
    }
}

/// Copy through a sibling temporary file so the destination is replaced in
/// one rename
async fn copy_replacing(from: &Path, to: &Path) -> Result<()> {
    ensure_parent(to).await?;
    let mut partial = to.as_os_str().to_owned();
    partial.push(".hashsync-partial");
    let partial = PathBuf::from(partial);

    if let Err(e) = tokio::fs::copy(from, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(Error::io_at(from, "copy", &e));
    }
    tokio::fs::rename(&partial, to)
        .await
        .map_err(|e| Error::io_at(to, "replace", &e))
}

/// Runs batches through an external program with elevated rights
///
/// The batch is written as JSON to `scratch_dir` and the program is invoked
/// as `<program> <args...> <batch file>`. Any exit status other than zero is
/// a failure of the whole batch. Cancelling kills the helper, which leaves the
/// batch partly applied at worst; that is reported as an elevation failure.
#[derive(Debug, Clone)]
pub struct ElevatedExecutor {
    program: String,
    args: Vec<String>,
    scratch_dir: PathBuf,
}

impl ElevatedExecutor {
    /// Helper invoked as `program args... <batch>`
    pub fn new(program: impl Into<String>, args: Vec<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Wait for the helper, killing it if `cancel` fires first
    async fn run_helper(&self, batch_path: &Path, cancel: &CancellationToken) -> Result<ExitStatus> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(batch_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::elevation(None, format!("Failed to launch '{}': {}", self.program, e)))?;

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to stop elevated helper '{}': {}", self.program, e);
                }
                warn!(
                    "Elevated helper '{}' stopped mid-batch; some operations may already be applied",
                    self.program
                );
                Err(Error::elevation(
                    None,
                    format!("'{}' was stopped before reporting; batch outcome unknown", self.program),
                ))
            }
            status = child.wait() => status.map_err(|e| {
                Error::elevation(None, format!("Failed to wait for '{}': {}", self.program, e))
            }),
        }
    }
}

#[async_trait]
impl OperationExecutor for ElevatedExecutor {
    async fn execute(&self, batch: &[FsOperation], cancel: &CancellationToken) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| Error::io_at(&self.scratch_dir, "create scratch directory", &e))?;
        let batch_path = self
            .scratch_dir
            .join(format!("batch-{}.json", uuid::Uuid::new_v4()));
        OperationBatch::new(batch.to_vec()).save(&batch_path).await?;

        info!(
            "Running {} operation(s) through elevated helper '{}'",
            batch.len(),
            self.program
        );
        let status = self.run_helper(&batch_path, cancel).await;

        if let Err(e) = tokio::fs::remove_file(&batch_path).await {
            warn!("Failed to remove batch file '{}': {}", batch_path.display(), e);
        }

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::elevation(
                status.code(),
                format!("'{}' did not complete the batch", self.program),
            ))
        }
    }

    fn name(&self) -> &'static str {
        "elevated"
    }
}
