//! Content hashing, tree scanning, reconciliation and staging for hashsync
//!
//! This crate holds the local side of a synchronization run:
//!
//! - **Hasher**: streaming SHA-256 of file content
//! - **Tree scanner**: `(path, size, hash)` for every file under an install root
//! - **Manifest**: the target state, parsed from JSON or JSON-lines listings
//! - **Reconciler**: what to fetch, reuse (by hash, wherever it lives) and remove
//! - **Staging area**: blobs keyed by content hash, shared across jobs
//!
//! # Examples
//!
//! ```rust,no_run
//! use hashsync_sync::{Manifest, Reconciler, TreeScanner};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> hashsync_types::Result<()> {
//! let target = Manifest::load(Path::new("manifest.json")).await?;
//! let local = TreeScanner::default()
//!     .scan(Path::new("/opt/game"), &CancellationToken::new())
//!     .await?;
//! let plan = Reconciler::new("/opt/game").reconcile(&target, &local, None);
//! println!("{} bytes to download", plan.fetch_bytes());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod hasher;
pub mod manifest;
pub mod reconcile;
pub mod scanner;
pub mod staging;

pub use hasher::{digest_file, hash_bytes, hash_file, hash_reader};
pub use manifest::Manifest;
pub use reconcile::{
    renamed_path, DirectoryRename, HarvestItem, ReconciliationPlan, Reconciler, ReuseItem,
    ReuseSource,
};
pub use scanner::{ScanOptions, TreeScanner};
pub use staging::StagingArea;
