//! hashsync integration test support
//!
//! Test doubles and fixtures shared by the cross-crate suites under `tests/`:
//! an in-memory blob fetcher that records every request, an executor that
//! records operation batches, and temp-dir install environments.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Unified test utilities
pub mod test_utils;

pub use test_utils::{
    generate_test_data, list_files, manifest_of, url_of, FetchCall, MemoryFetcher,
    RecordingExecutor, TestDataPattern, TestEnv, CDN,
};
