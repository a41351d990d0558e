//! Core type system and error handling for hashsync
//!
//! This crate provides the foundational types shared by every hashsync crate:
//!
//! - **Error handling**: one error enum covering transient transfer failures,
//!   checksum failures, structural (unsupported) failures, elevation failures
//!   and cancellation
//! - **Content identity**: [`ContentHash`], a SHA-256 digest with hex encoding
//! - **Data model**: manifest entries, local file records, pipeline states
//! - **Progress**: lock-free [`ProgressCounters`] shared between transfer workers
//!   and the sampler
//! - **Configuration**: validated retry, timeout, buffer and parallelism settings
//!
//! # Features
//!
//! - `std` (default): Enable standard library features
//! - `serde`: Enable serialization support
//!
//! # Examples
//!
//! ```rust
//! use hashsync_types::{ContentHash, ManifestEntry, Result};
//!
//! fn entry() -> Result<ManifestEntry> {
//!     let hash = ContentHash::from_hex(
//!         "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
//!     )?;
//!     Ok(ManifestEntry::new("data/empty.bin", hash, 0))
//! }
//! # assert_eq!(entry().unwrap().size, 0);
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod progress;
pub mod result;
pub mod types;

// Re-export commonly used types
pub use config::{BufferSize, RetryConfig, ThreadCount, TimeoutConfig};
pub use error::{ChecksumMismatch, Error, ErrorKind, ErrorSeverity};
pub use progress::{CounterSnapshot, ProgressCounters};
pub use result::Result;
pub use types::*;
