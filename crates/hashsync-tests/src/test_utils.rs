//! Shared fixtures and test doubles for hashsync integration tests

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hashsync_config::{CacheRetention, Config};
use hashsync_engine::{FsOperation, LocalExecutor, OperationExecutor, Pipeline};
use hashsync_network::{BlobFetcher, FetchResponse};
use hashsync_sync::{hash_bytes, Manifest};
use hashsync_types::{Error, ManifestEntry, Result, RetryConfig};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Base URL every fixture manifest points at
pub const CDN: &str = "https://cdn.test";

/// Test data generation patterns
#[derive(Debug, Clone, Copy)]
pub enum TestDataPattern {
    /// All zeros
    Zeros,
    /// Deterministic pseudo-random bytes
    Random,
    /// Repeating structured bytes
    Realistic,
}

/// Generate `size` bytes with `pattern`; `seed` makes equal-sized blobs differ
pub fn generate_test_data(size: usize, pattern: TestDataPattern, seed: u64) -> Vec<u8> {
    match pattern {
        TestDataPattern::Zeros => vec![0u8; size],
        TestDataPattern::Random => {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};

            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            (0..size)
                .map(|i| {
                    i.hash(&mut hasher);
                    (hasher.finish() % 256) as u8
                })
                .collect()
        }
        TestDataPattern::Realistic => (0..size)
            .map(|i| ((i as u64 * 7 + 13 + seed) % 256) as u8)
            .collect(),
    }
}

/// Manifest listing `files` under [`CDN`]
pub fn manifest_of(files: &[(&str, &[u8])]) -> Manifest {
    Manifest::new(
        files
            .iter()
            .map(|(name, content)| ManifestEntry::new(*name, hash_bytes(content), content.len() as u64))
            .collect(),
    )
    .with_url_prefix(CDN)
}

/// URL a manifest entry named `name` resolves to
pub fn url_of(name: &str) -> String {
    format!("{}/{}", CDN, name)
}

/// One request seen by a [`MemoryFetcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    /// Requested URL
    pub url: String,
    /// Requested start offset
    pub offset: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    blobs: HashMap<String, Vec<u8>>,
    corrupt: HashSet<String>,
    calls: Vec<FetchCall>,
}

/// In-memory [`BlobFetcher`] recording every request
///
/// Honors range offsets. Bodies can be served corrupted (every byte
/// flipped) or slowly, in small delayed chunks.
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    state: Arc<Mutex<MemoryState>>,
    slow: Option<(usize, Duration)>,
}

impl MemoryFetcher {
    /// Empty fetcher; every URL is a 404
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetcher serving each file at [`url_of`] its name
    pub fn serving(files: &[(&str, &[u8])]) -> Self {
        let fetcher = Self::new();
        for (name, content) in files {
            fetcher.insert(url_of(name), content.to_vec());
        }
        fetcher
    }

    /// Serve `content` at `url`
    pub fn insert(&self, url: impl Into<String>, content: Vec<u8>) {
        self.lock().blobs.insert(url.into(), content);
    }

    /// Serve garbage instead of the real content at `url`
    pub fn corrupt(&self, url: impl Into<String>) {
        self.lock().corrupt.insert(url.into());
    }

    /// Stream bodies in `chunk` sized pieces with `delay` before each
    pub fn slow(mut self, chunk: usize, delay: Duration) -> Self {
        self.slow = Some((chunk.max(1), delay));
        self
    }

    /// Every request so far
    pub fn calls(&self) -> Vec<FetchCall> {
        self.lock().calls.clone()
    }

    /// Offsets requested for `url`, in order
    pub fn offsets(&self, url: &str) -> Vec<u64> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.url == url)
            .map(|call| call.offset)
            .collect()
    }

    /// Number of requests so far
    pub fn fetch_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobFetcher for MemoryFetcher {
    async fn fetch(&self, url: &str, offset: u64) -> Result<FetchResponse> {
        let mut body = {
            let mut state = self.lock();
            state.calls.push(FetchCall {
                url: url.to_string(),
                offset,
            });
            let content = state.blobs.get(url).cloned().ok_or_else(|| Error::RemoteRejected {
                url: url.to_string(),
                status: 404,
            })?;
            if state.corrupt.contains(url) {
                content.iter().map(|b| !b).collect::<Vec<u8>>()
            } else {
                content
            }
        };

        let start = offset.min(body.len() as u64);
        let body = body.split_off(start as usize);

        let stream = match self.slow {
            None => futures::stream::iter(vec![Ok(Bytes::from(body))]).boxed(),
            Some((chunk, delay)) => {
                let chunks: Vec<Bytes> = body.chunks(chunk).map(Bytes::copy_from_slice).collect();
                futures::stream::iter(chunks)
                    .then(move |chunk| async move {
                        tokio::time::sleep(delay).await;
                        Ok(chunk)
                    })
                    .boxed()
            }
        };
        Ok(FetchResponse::new(start, stream))
    }
}

/// Executor that records batches and can simulate a failing elevated helper
#[derive(Debug, Clone, Default)]
pub struct RecordingExecutor {
    batches: Arc<Mutex<Vec<Vec<FsOperation>>>>,
    fail_with_exit: Option<i32>,
}

impl RecordingExecutor {
    /// Records and applies batches in process
    pub fn new() -> Self {
        Self::default()
    }

    /// Records batches, applies nothing and fails with `exit_code`
    pub fn failing(exit_code: i32) -> Self {
        Self {
            fail_with_exit: Some(exit_code),
            ..Self::default()
        }
    }

    /// Batches executed so far
    pub fn batches(&self) -> Vec<Vec<FsOperation>> {
        self.batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// All operations executed so far, flattened
    pub fn operations(&self) -> Vec<FsOperation> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl OperationExecutor for RecordingExecutor {
    async fn execute(&self, batch: &[FsOperation], cancel: &CancellationToken) -> Result<()> {
        self.batches
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(batch.to_vec());
        match self.fail_with_exit {
            Some(code) => Err(Error::elevation(Some(code), "helper refused the batch")),
            None => LocalExecutor::new().execute(batch, cancel).await,
        }
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Install root and staging directory inside one temp dir
pub struct TestEnv {
    /// Owns the directories
    pub temp: TempDir,
    /// Install root
    pub root: PathBuf,
    /// Staging directory
    pub staging: PathBuf,
}

impl TestEnv {
    /// Fresh environment with an existing, empty install root
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let root = temp.path().join("install");
        let staging = temp.path().join("staging");
        fs::create_dir_all(&root).expect("create install root");
        Self {
            temp,
            root,
            staging,
        }
    }

    /// Write `content` at `relative` under the install root
    pub fn write(&self, relative: &str, content: &[u8]) -> PathBuf {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, content).expect("write file");
        path
    }

    /// Read `relative` under the install root
    pub fn read(&self, relative: &str) -> Vec<u8> {
        fs::read(self.root.join(relative)).expect("read file")
    }

    /// Whether `relative` exists under the install root
    pub fn exists(&self, relative: &str) -> bool {
        self.root.join(relative).exists()
    }

    /// Staged blob path for `content`
    pub fn staged_blob(&self, content: &[u8]) -> PathBuf {
        self.staging.join(hash_bytes(content).to_hex())
    }

    /// Configuration pointing at this environment with fast retries
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.staging.directory = self.staging.clone();
        config.staging.retention = CacheRetention::Keep;
        config.transfer.retry = RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        };
        config.progress.sample_interval_ms = 20;
        config.progress.refresh_interval_ms = 5;
        config
    }

    /// Pipeline over this environment
    pub fn pipeline(&self, fetcher: &MemoryFetcher, executor: &RecordingExecutor) -> Pipeline {
        self.pipeline_with(self.config(), fetcher, executor)
    }

    /// Pipeline over this environment with a custom configuration
    pub fn pipeline_with(
        &self,
        config: Config,
        fetcher: &MemoryFetcher,
        executor: &RecordingExecutor,
    ) -> Pipeline {
        Pipeline::builder(config)
            .fetcher(Arc::new(fetcher.clone()))
            .executor(Arc::new(executor.clone()))
            .build()
            .expect("build pipeline")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Paths of all regular files under `dir`, relative and `/` separated
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}
