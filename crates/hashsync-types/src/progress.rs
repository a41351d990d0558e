//! Lock-free progress counters
//!
//! Transfer workers bump these concurrently; the sampler reads them without
//! taking any lock. A snapshot may mix values from slightly different moments.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters for one pipeline run
#[derive(Debug, Default)]
pub struct ProgressCounters {
    bytes_downloaded: AtomicU64,
    bytes_total: AtomicU64,
    files_downloaded: AtomicU64,
    files_total: AtomicU64,
}

/// Plain copy of [`ProgressCounters`] at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Bytes downloaded so far
    pub bytes_downloaded: u64,
    /// Total bytes to download
    pub bytes_total: u64,
    /// Blobs completed
    pub files_downloaded: u64,
    /// Blobs to download
    pub files_total: u64,
}

impl ProgressCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new run with known totals and bytes already present in staging
    pub fn reset(&self, bytes_total: u64, files_total: u64, bytes_already_staged: u64) {
        self.bytes_total.store(bytes_total, Ordering::Relaxed);
        self.files_total.store(files_total, Ordering::Relaxed);
        self.bytes_downloaded
            .store(bytes_already_staged.min(bytes_total), Ordering::Relaxed);
        self.files_downloaded.store(0, Ordering::Relaxed);
    }

    /// Record freshly received bytes
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Take back bytes of a discarded blob; saturates at zero
    pub fn rollback_bytes(&self, bytes: u64) {
        let _ = self
            .bytes_downloaded
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Record one verified blob
    pub fn file_completed(&self) {
        self.files_downloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            files_downloaded: self.files_downloaded.load(Ordering::Relaxed),
            files_total: self.files_total.load(Ordering::Relaxed),
        }
    }
}
