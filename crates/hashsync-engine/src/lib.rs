//! Pipeline engine for hashsync
//!
//! This crate ties the scanner, reconciler and transfer orchestrator together
//! into one [`Pipeline`] per job and applies the result to the install tree:
//!
//! - **Pipeline**: the `Idle -> Preparing -> Pending -> Downloading ->
//!   Committing -> Finished` state machine, with cancellation at every step
//! - **Commit stage**: harvesting, deletions, directory renames, placements,
//!   verification and the completion marker
//! - **Executors**: filesystem batches run in-process or through an elevated
//!   helper program
//! - **Progress**: sampled throughput and ETA published over `watch` channels
//!
//! # Examples
//!
//! ```rust,no_run
//! use hashsync_config::Config;
//! use hashsync_engine::{JobRequest, Pipeline};
//! use hashsync_sync::Manifest;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manifest = Manifest::load(Path::new("manifest.json")).await?;
//! let pipeline = Pipeline::builder(Config::default()).build()?;
//!
//! let summary = pipeline
//!     .prepare(JobRequest::install("/opt/app", manifest))
//!     .await?;
//! println!("{} bytes to download", summary.bytes_remaining());
//!
//! let stats = pipeline.start().await?;
//! println!("Placed {} files", stats.files_placed);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod commit;
pub mod executor;
pub mod job;
pub mod monitor;
pub mod pipeline;

pub use commit::{CommitOptions, CommitReport, CommitStage};
pub use executor::{ElevatedExecutor, FsOperation, LocalExecutor, OperationBatch, OperationExecutor};
pub use job::{JobMode, JobRequest, MarkerFile, PlanSummary};
pub use monitor::{estimate_eta, throughput, ProgressSampler, ThroughputSampler};
pub use pipeline::{Pipeline, PipelineBuilder};
