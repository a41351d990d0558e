//! Blob transfer for hashsync
//!
//! This crate moves content from a remote source into the staging area:
//!
//! - **Fetcher seam**: [`BlobFetcher`], a ranged request returning a byte
//!   stream, so tests and alternative transports plug in without HTTP
//! - **HTTP fetcher**: [`HttpFetcher`] on `reqwest`, with `Range` resume and
//!   transient/permanent status classification
//! - **Resume**: decisions for partially staged blobs
//! - **Transfer orchestrator**: bounded-parallel downloads with per-item
//!   retry, checksum verification and progress counting
//!
//! # Examples
//!
//! ```rust,no_run
//! use hashsync_network::{HttpFetcher, TransferOptions, TransferOrchestrator};
//! use hashsync_sync::{Manifest, StagingArea};
//! use hashsync_types::TimeoutConfig;
//! use std::path::Path;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> hashsync_types::Result<()> {
//! let manifest = Manifest::load(Path::new("manifest.json")).await?;
//! let fetcher = Arc::new(HttpFetcher::new(&TimeoutConfig::default(), "hashsync")?);
//! let orchestrator = TransferOrchestrator::new(
//!     fetcher,
//!     StagingArea::new("/var/cache/hashsync"),
//!     TransferOptions::default(),
//! );
//! let report = orchestrator
//!     .download(&manifest, &manifest.entries, &CancellationToken::new())
//!     .await?;
//! println!("Fetched {} blobs", report.fetched);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod fetcher;
pub mod http;
pub mod resume;
pub mod transfer;

pub use fetcher::{BlobFetcher, ByteStream, FetchResponse};
pub use http::HttpFetcher;
pub use resume::ResumePoint;
pub use transfer::{TransferOptions, TransferOrchestrator, TransferReport};
