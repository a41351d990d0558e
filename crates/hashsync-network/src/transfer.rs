//! Parallel, resumable, checksum-verified blob downloads
//!
//! The orchestrator downloads the fetch set of a reconciliation plan into
//! the staging area. Each distinct hash is one work item, however many
//! manifest entries share it. Items run under a semaphore bound; each one
//! holds the staging lock for its hash while it works, resumes from the
//! partial length already on disk, and verifies the finished blob.
//!
//! Transient failures keep the partial bytes and retry with backoff. A
//! checksum mismatch discards the blob, takes its bytes back out of the
//! progress counters and retries from zero. The first item to fail for
//! good stops the remaining workers; whatever they had staged stays on disk.

use crate::fetcher::BlobFetcher;
use crate::resume::{self, ResumePoint};
use futures::StreamExt;
use hashsync_config::TransferConfig;
use hashsync_sync::{Manifest, StagingArea};
use hashsync_types::{
    BufferSize, ChecksumMismatch, Error, ErrorKind, ManifestEntry, ProgressCounters, Result,
    RetryConfig, ThreadCount,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Concurrent items
    pub max_parallelism: usize,
    /// Per-item retry policy
    pub retry: RetryConfig,
    /// Buffer used when verifying blobs
    pub buffer_size: BufferSize,
    /// Fallback base URL for entries without one
    pub url_prefix: Option<String>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_parallelism: ThreadCount::for_transfers().get(),
            retry: RetryConfig::default(),
            buffer_size: BufferSize::default(),
            url_prefix: None,
        }
    }
}

impl From<&TransferConfig> for TransferOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            max_parallelism: config.max_parallelism.get(),
            retry: config.retry.clone(),
            buffer_size: config.buffer_size,
            url_prefix: config.url_prefix.clone(),
        }
    }
}

/// Summary of one [`TransferOrchestrator::download`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Blobs that needed network traffic
    pub fetched: usize,
    /// Blobs that were already complete in staging and only verified
    pub already_staged: usize,
    /// Bytes received over the network that ended up in a verified blob
    pub bytes_downloaded: u64,
    /// Attempts beyond the first, summed over all items
    pub retries: u32,
    /// Wall-clock time of the call
    pub duration: Duration,
}

impl TransferReport {
    fn absorb(&mut self, item: &ItemReport) {
        if item.used_network {
            self.fetched += 1;
        } else {
            self.already_staged += 1;
        }
        self.bytes_downloaded += item.bytes;
        self.retries += item.retries;
    }
}

#[derive(Debug)]
struct ItemReport {
    used_network: bool,
    bytes: u64,
    retries: u32,
}

#[derive(Debug)]
struct Job {
    entry: ManifestEntry,
    url: String,
}

enum AttemptError {
    Cancelled,
    Mismatch {
        mismatch: ChecksumMismatch,
        counted: u64,
    },
    Failed(Error),
}

impl From<Error> for AttemptError {
    fn from(error: Error) -> Self {
        Self::Failed(error)
    }
}

/// Downloads blobs into a [`StagingArea`]
#[derive(Clone)]
pub struct TransferOrchestrator {
    fetcher: Arc<dyn BlobFetcher>,
    staging: StagingArea,
    options: TransferOptions,
    counters: Arc<ProgressCounters>,
}

impl std::fmt::Debug for TransferOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOrchestrator")
            .field("staging", &self.staging.root())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TransferOrchestrator {
    /// Create an orchestrator with its own progress counters
    pub fn new(fetcher: Arc<dyn BlobFetcher>, staging: StagingArea, options: TransferOptions) -> Self {
        Self {
            fetcher,
            staging,
            options,
            counters: Arc::new(ProgressCounters::new()),
        }
    }

    /// Share externally owned progress counters
    pub fn with_counters(mut self, counters: Arc<ProgressCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Counters updated while downloading
    pub fn counters(&self) -> &Arc<ProgressCounters> {
        &self.counters
    }

    /// Staging area blobs are written to
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Reset the counters for `items`, crediting bytes already staged
    ///
    /// Returns `(bytes_total, bytes_already_staged)` over distinct hashes.
    pub async fn reset_counters(&self, items: &[ManifestEntry]) -> Result<(u64, u64)> {
        let mut seen = HashSet::new();
        let mut bytes_total = 0;
        let mut files_total = 0;
        let mut staged = 0;

        for entry in items.iter().filter(|entry| seen.insert(entry.hash)) {
            bytes_total += entry.size;
            files_total += 1;
            let len = self.staging.staged_len(&entry.hash).await?;
            staged += resume::counted_len(len, entry.size);
        }

        self.counters.reset(bytes_total, files_total, staged);
        Ok((bytes_total, staged))
    }

    /// Download every distinct blob of `items` into staging
    ///
    /// URLs are resolved against `manifest` (and the configured fallback
    /// prefix) before any request is made.
    pub async fn download(
        &self,
        manifest: &Manifest,
        items: &[ManifestEntry],
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let jobs = self.jobs(manifest, items)?;
        let started = Instant::now();
        let mut report = TransferReport::default();
        if jobs.is_empty() {
            return Ok(report);
        }

        self.staging.ensure().await?;
        let parallelism = self.options.max_parallelism.max(1);
        info!(
            "Downloading {} blob(s) with up to {} parallel transfers",
            jobs.len(),
            parallelism
        );

        let abort = cancel.child_token();
        let permits = Arc::new(Semaphore::new(parallelism));
        let mut workers = JoinSet::new();
        for job in jobs {
            let this = self.clone();
            let permits = Arc::clone(&permits);
            let cancel = abort.clone();
            workers.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) => this.fetch_item(&job, &cancel).await,
                    None => Err(Error::Cancelled),
                };
                (job.entry.remote_name, result)
            });
        }

        let mut mismatches = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(item))) => report.absorb(&item),
                Ok((_, Err(Error::Cancelled))) => {}
                Ok((name, Err(Error::ChecksumFailed { files }))) => {
                    error!("'{}' failed verification on every attempt", name);
                    mismatches.extend(files);
                    abort.cancel();
                }
                Ok((name, Err(e))) => {
                    error!("Download of '{}' failed: {}", name, e);
                    failures.push(e);
                    abort.cancel();
                }
                Err(e) => {
                    failures.push(Error::other(format!("Transfer worker failed: {}", e)));
                    abort.cancel();
                }
            }
        }
        report.duration = started.elapsed();

        if cancel.is_cancelled() {
            info!("Download cancelled; partial blobs stay staged for resume");
            return Err(Error::Cancelled);
        }
        if !mismatches.is_empty() {
            return Err(Error::ChecksumFailed { files: mismatches });
        }
        if let Some(error) = aggregate(failures) {
            return Err(error);
        }

        info!(
            "Staged {} blob(s) ({} fetched, {} already present, {} bytes) in {:.2?}",
            report.fetched + report.already_staged,
            report.fetched,
            report.already_staged,
            report.bytes_downloaded,
            report.duration
        );
        Ok(report)
    }

    fn jobs(&self, manifest: &Manifest, items: &[ManifestEntry]) -> Result<Vec<Job>> {
        let mut seen = HashSet::new();
        items
            .iter()
            .filter(|entry| seen.insert(entry.hash))
            .map(|entry| {
                Ok(Job {
                    url: manifest.resolve_url(entry, self.options.url_prefix.as_deref())?,
                    entry: entry.clone(),
                })
            })
            .collect()
    }

    async fn fetch_item(&self, job: &Job, cancel: &CancellationToken) -> Result<ItemReport> {
        let entry = &job.entry;
        let _guard = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.staging.lock(&entry.hash) => guard,
        };

        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut received = 0;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.attempt(job, cancel, &mut received).await {
                Ok(used_network) => {
                    self.counters.file_completed();
                    return Ok(ItemReport {
                        used_network,
                        bytes: received,
                        retries: attempt - 1,
                    });
                }
                Err(AttemptError::Cancelled) => return Err(Error::Cancelled),
                Err(AttemptError::Mismatch { mismatch, counted }) => {
                    warn!(
                        "Attempt {}/{}: {}; discarding staged blob",
                        attempt, max_attempts, mismatch
                    );
                    self.staging.discard(&entry.hash).await?;
                    self.counters.rollback_bytes(counted);
                    // Everything received so far went into the discarded blob.
                    received = 0;
                    Error::ChecksumFailed {
                        files: vec![mismatch],
                    }
                }
                Err(AttemptError::Failed(e)) if e.should_retry() => {
                    warn!(
                        "Attempt {}/{} for '{}' failed: {}",
                        attempt, max_attempts, entry.remote_name, e
                    );
                    e
                }
                Err(AttemptError::Failed(e)) => return Err(e),
            };

            if attempt >= max_attempts {
                return Err(failure);
            }

            let delay = self.options.retry.delay_for_attempt(attempt);
            debug!("Retrying '{}' in {:?}", entry.remote_name, delay);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One try at getting a verified blob into staging; returns whether the
    /// network was used
    async fn attempt(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        received: &mut u64,
    ) -> std::result::Result<bool, AttemptError> {
        let entry = &job.entry;
        let path = self.staging.blob_path(&entry.hash);
        let staged = self.staging.staged_len(&entry.hash).await?;
        let exists = staged > 0 || tokio::fs::try_exists(&path).await.unwrap_or(false);

        let offset = match ResumePoint::decide(staged, entry.size, exists) {
            ResumePoint::Verify => {
                debug!("Blob {} already staged, verifying only", entry.hash);
                self.verify(entry, staged).await?;
                return Ok(false);
            }
            ResumePoint::Discard => {
                debug!("Staged blob {} is oversized, discarding", entry.hash);
                self.staging.discard(&entry.hash).await?;
                0
            }
            ResumePoint::Resume(offset) => offset,
        };
        if offset > 0 {
            debug!("Resuming '{}' at byte {}", entry.remote_name, offset);
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AttemptError::Cancelled),
            response = self.fetcher.fetch(&job.url, offset) => response?,
        };

        let start = response.start;
        if start > offset {
            return Err(Error::network(format!(
                "{} answered from byte {} but {} was requested",
                job.url, start, offset
            ))
            .into());
        }
        if start < offset {
            self.counters.rollback_bytes(offset - start);
            *received = received.saturating_sub(offset - start);
        }

        let mut file = resume::open_at(&path, start).await?;
        let mut written = start;
        let mut body = response.body;
        let streamed: std::result::Result<(), AttemptError> = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(AttemptError::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        break Err(Error::io_at(&path, "write staged blob", &e).into());
                    }
                    let len = chunk.len() as u64;
                    written += len;
                    *received += len;
                    self.counters.add_bytes(len);
                }
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            }
        };

        // Whatever arrived stays on disk for the next attempt or run.
        let flushed = file.flush().await;
        drop(file);
        streamed?;
        flushed.map_err(|e| Error::io_at(&path, "flush staged blob", &e))?;

        if written < entry.size {
            return Err(Error::network(format!(
                "Connection closed after {} of {} bytes of '{}'",
                written, entry.size, entry.remote_name
            ))
            .into());
        }

        self.verify(entry, written).await?;
        debug!("Staged '{}' ({} bytes)", entry.remote_name, written);
        Ok(true)
    }

    async fn verify(&self, entry: &ManifestEntry, counted: u64) -> std::result::Result<(), AttemptError> {
        let actual = self
            .staging
            .digest(&entry.hash, self.options.buffer_size)
            .await?;
        if actual == Some(entry.hash) {
            return Ok(());
        }

        Err(AttemptError::Mismatch {
            mismatch: ChecksumMismatch {
                name: entry.remote_name.clone(),
                expected: entry.hash,
                actual,
            },
            counted,
        })
    }
}

fn aggregate(mut failures: Vec<Error>) -> Option<Error> {
    match failures.len() {
        0 => None,
        1 => failures.pop(),
        count => {
            if failures.iter().all(|e| e.kind() == ErrorKind::Network) {
                Some(Error::network(format!(
                    "{} downloads failed, first: {}",
                    count, failures[0]
                )))
            } else {
                Some(failures.swap_remove(0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchResponse;
    use async_trait::async_trait;
    use bytes::Bytes;
    use hashsync_sync::hash_bytes;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct ScriptedFetcher {
        blobs: HashMap<String, Vec<u8>>,
        calls: Mutex<Vec<(String, u64)>>,
        corrupt: bool,
        corruptions_left: AtomicU32,
        ignore_range: bool,
        failures_left: AtomicU32,
        chunk_delay: Option<Duration>,
    }

    impl ScriptedFetcher {
        fn serve(mut self, url: &str, content: &[u8]) -> Self {
            self.blobs.insert(url.to_string(), content.to_vec());
            self
        }

        fn calls(&self) -> Vec<(String, u64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BlobFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse> {
            self.calls.lock().unwrap().push((url.to_string(), offset));
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::network("connection reset"));
            }

            let mut content = self
                .blobs
                .get(url)
                .cloned()
                .ok_or(Error::RemoteRejected {
                    url: url.to_string(),
                    status: 404,
                })?;
            let corrupt_once = self
                .corruptions_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if self.corrupt || corrupt_once {
                content.reverse();
            }
            let start = if self.ignore_range { 0 } else { offset };
            let chunks: Vec<Result<Bytes>> = content[start as usize..]
                .chunks(7)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            let body = futures::stream::iter(chunks);
            match self.chunk_delay {
                Some(delay) => Ok(FetchResponse::new(
                    start,
                    body.then(move |chunk| async move {
                        tokio::time::sleep(delay).await;
                        chunk
                    })
                    .boxed(),
                )),
                None => Ok(FetchResponse::new(start, body.boxed())),
            }
        }
    }

    fn fast_options() -> TransferOptions {
        TransferOptions {
            max_parallelism: 4,
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            ..TransferOptions::default()
        }
    }

    fn entry(name: &str, content: &[u8]) -> ManifestEntry {
        ManifestEntry::new(name, hash_bytes(content), content.len() as u64)
    }

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn orchestrator(fetcher: Arc<ScriptedFetcher>, dir: &TempDir) -> TransferOrchestrator {
        TransferOrchestrator::new(
            fetcher,
            StagingArea::new(dir.path().join("staging")),
            fast_options(),
        )
    }

    #[tokio::test]
    async fn test_shared_hash_fetched_once() {
        let temp_dir = TempDir::new().unwrap();
        let one = content(100, 1);
        let two = content(50, 2);
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .serve("https://cdn.test/A", &one)
                .serve("https://cdn.test/B", &one)
                .serve("https://cdn.test/C", &two),
        );
        let items = vec![entry("A", &one), entry("B", &one), entry("C", &two)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        orchestrator.reset_counters(&items).await.unwrap();
        let report = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.bytes_downloaded, 150);
        let snap = orchestrator.counters().snapshot();
        assert_eq!(snap.bytes_downloaded, 150);
        assert_eq!(snap.bytes_total, 150);
        assert_eq!(snap.files_downloaded, 2);

        let staged = tokio::fs::read(orchestrator.staging().blob_path(&hash_bytes(&one)))
            .await
            .unwrap();
        assert_eq!(staged, one);
    }

    #[tokio::test]
    async fn test_partial_blob_resumes_from_its_length() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(100, 3);
        let fetcher = Arc::new(ScriptedFetcher::default().serve("https://cdn.test/f", &data));
        let items = vec![entry("f", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test/");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        orchestrator.staging().ensure().await.unwrap();
        let blob = orchestrator.staging().blob_path(&items[0].hash);
        tokio::fs::write(&blob, &data[..40]).await.unwrap();

        let (_, staged) = orchestrator.reset_counters(&items).await.unwrap();
        assert_eq!(staged, 40);
        let report = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), vec![("https://cdn.test/f".to_string(), 40)]);
        assert_eq!(report.bytes_downloaded, 60);
        assert_eq!(orchestrator.counters().snapshot().bytes_downloaded, 100);
        assert_eq!(tokio::fs::read(&blob).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_complete_blob_is_only_verified() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(64, 4);
        let fetcher = Arc::new(ScriptedFetcher::default());
        let items = vec![entry("f", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        orchestrator.staging().ensure().await.unwrap();
        tokio::fs::write(orchestrator.staging().blob_path(&items[0].hash), &data)
            .await
            .unwrap();

        let report = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await
            .unwrap();

        assert!(fetcher.calls().is_empty());
        assert_eq!(report.already_staged, 1);
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(30, 5);
        let fetcher = Arc::new(ScriptedFetcher {
            failures_left: AtomicU32::new(2),
            ..ScriptedFetcher::default()
        }
        .serve("https://cdn.test/f", &data));
        let items = vec![entry("f", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        let report = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 3);
        assert_eq!(report.retries, 2);
    }

    #[tokio::test]
    async fn test_persistent_corruption_reports_checksum_failure() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(80, 6);
        let fetcher = Arc::new(ScriptedFetcher {
            corrupt: true,
            ..ScriptedFetcher::default()
        }
        .serve("https://cdn.test/bad.bin", &data));
        let items = vec![entry("bad.bin", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        orchestrator.reset_counters(&items).await.unwrap();
        let result = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await;

        match result {
            Err(Error::ChecksumFailed { files }) => {
                assert_eq!(files.len(), 1);
                assert_eq!(files[0].name, "bad.bin");
                assert!(files[0].actual.is_some());
            }
            other => panic!("expected checksum failure, got {:?}", other),
        }
        // Every retry restarts from zero.
        assert!(fetcher.calls().iter().all(|(_, offset)| *offset == 0));
        assert_eq!(fetcher.calls().len(), 3);
        assert!(!orchestrator.staging().blob_path(&items[0].hash).exists());
        assert_eq!(orchestrator.counters().snapshot().bytes_downloaded, 0);
    }

    #[tokio::test]
    async fn test_discarded_attempt_is_not_counted_as_downloaded() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(90, 12);
        let fetcher = Arc::new(ScriptedFetcher {
            corruptions_left: AtomicU32::new(1),
            ..ScriptedFetcher::default()
        }
        .serve("https://cdn.test/f", &data));
        let items = vec![entry("f", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        orchestrator.reset_counters(&items).await.unwrap();
        let report = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(report.retries, 1);
        assert_eq!(report.bytes_downloaded, 90);
        assert_eq!(orchestrator.counters().snapshot().bytes_downloaded, 90);
    }

    #[tokio::test]
    async fn test_failed_item_stops_the_other_transfers() {
        let temp_dir = TempDir::new().unwrap();
        let large = content(4000, 13);
        let fetcher = Arc::new(ScriptedFetcher {
            chunk_delay: Some(Duration::from_millis(10)),
            ..ScriptedFetcher::default()
        }
        .serve("https://cdn.test/large.bin", &large));
        let missing = content(10, 14);
        let items = vec![entry("large.bin", &large), entry("missing.bin", &missing)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        orchestrator.reset_counters(&items).await.unwrap();
        let started = Instant::now();
        let result = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await;

        // The large blob alone takes several seconds at this pace.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(result, Err(Error::RemoteRejected { status: 404, .. })));
        let staged = orchestrator.staging().staged_len(&items[0].hash).await.unwrap();
        assert!(staged < 4000);
        assert_eq!(
            &large[..staged as usize],
            tokio::fs::read(orchestrator.staging().blob_path(&items[0].hash))
                .await
                .unwrap_or_default()
                .as_slice()
        );
    }

    #[tokio::test]
    async fn test_corrupt_staged_blob_is_refetched() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(48, 7);
        let fetcher = Arc::new(ScriptedFetcher::default().serve("https://cdn.test/f", &data));
        let items = vec![entry("f", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        orchestrator.staging().ensure().await.unwrap();
        let blob = orchestrator.staging().blob_path(&items[0].hash);
        tokio::fs::write(&blob, vec![0u8; 48]).await.unwrap();

        orchestrator.reset_counters(&items).await.unwrap();
        orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), vec![("https://cdn.test/f".to_string(), 0)]);
        assert_eq!(tokio::fs::read(&blob).await.unwrap(), data);
        assert_eq!(orchestrator.counters().snapshot().bytes_downloaded, 48);
    }

    #[tokio::test]
    async fn test_server_ignoring_range_restarts_blob() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(100, 8);
        let fetcher = Arc::new(ScriptedFetcher {
            ignore_range: true,
            ..ScriptedFetcher::default()
        }
        .serve("https://cdn.test/f", &data));
        let items = vec![entry("f", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        orchestrator.staging().ensure().await.unwrap();
        let blob = orchestrator.staging().blob_path(&items[0].hash);
        tokio::fs::write(&blob, &data[..40]).await.unwrap();

        orchestrator.reset_counters(&items).await.unwrap();
        orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&blob).await.unwrap(), data);
        assert_eq!(orchestrator.counters().snapshot().bytes_downloaded, 100);
    }

    #[tokio::test]
    async fn test_rejected_request_is_not_retried() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(10, 9);
        let fetcher = Arc::new(ScriptedFetcher::default());
        let items = vec![entry("missing", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        let result = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::RemoteRejected { status: 404, .. })));
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(10, 10);
        let fetcher = Arc::new(ScriptedFetcher::default().serve("https://cdn.test/f", &data));
        let items = vec![entry("f", &data)];
        let manifest = Manifest::new(items.clone()).with_url_prefix("https://cdn.test");
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = orchestrator.download(&manifest, &items, &cancel).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_url_fails_before_any_request() {
        let temp_dir = TempDir::new().unwrap();
        let data = content(10, 11);
        let fetcher = Arc::new(ScriptedFetcher::default());
        let items = vec![entry("f", &data)];
        let manifest = Manifest::new(items.clone());
        let orchestrator = orchestrator(Arc::clone(&fetcher), &temp_dir);

        let result = orchestrator
            .download(&manifest, &items, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::Manifest { .. })));
        assert!(fetcher.calls().is_empty());
    }

    #[test]
    fn test_aggregate_network_failures() {
        let error = aggregate(vec![Error::io("disk full"), Error::network("a")]).unwrap();
        assert_eq!(error.kind(), ErrorKind::Io);

        let error = aggregate(vec![Error::network("a"), Error::network("b")]).unwrap();
        assert_eq!(error.kind(), ErrorKind::Network);
        assert!(error.to_string().contains("2 downloads failed"));

        assert!(aggregate(Vec::new()).is_none());
    }
}
