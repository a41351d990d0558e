//! Pipeline state machine
//!
//! ```text
//! Idle -> Preparing -> Pending -> Downloading -> Committing -> Finished
//!            |                        |              |
//!            +--> Unsupported         +--> Stopped / Error
//! ```
//!
//! [`Pipeline::prepare`] scans and reconciles, then parks the plan in
//! `Pending` so callers can show the exact download size. [`Pipeline::start`]
//! downloads and commits it. At most one run is active per pipeline: a new
//! `prepare` cancels whatever ran before and waits for it to wind down.

use crate::commit::{CommitOptions, CommitStage};
use crate::executor::{ElevatedExecutor, LocalExecutor, OperationExecutor};
use crate::job::{JobMode, JobRequest, PlanSummary};
use crate::monitor::ProgressSampler;
use hashsync_config::{CacheRetention, Config};
use hashsync_network::{BlobFetcher, HttpFetcher, TransferOptions, TransferOrchestrator};
use hashsync_sync::{ReconciliationPlan, Reconciler, ScanOptions, StagingArea, TreeScanner};
use hashsync_types::{
    ContentHash, Error, OperationId, PipelineState, ProgressCounters, ProgressSnapshot, Result,
    RunStats,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct PreparedRun {
    id: OperationId,
    request: JobRequest,
    install_root: PathBuf,
    plan: ReconciliationPlan,
    summary: PlanSummary,
    cancel: CancellationToken,
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    config: Config,
    fetcher: Option<Arc<dyn BlobFetcher>>,
    executor: Option<Arc<dyn OperationExecutor>>,
    staging: Option<StagingArea>,
    executable: Option<PathBuf>,
}

impl PipelineBuilder {
    /// Start from a configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            fetcher: None,
            executor: None,
            staging: None,
            executable: None,
        }
    }

    /// Use a custom blob fetcher instead of HTTP
    pub fn fetcher(mut self, fetcher: Arc<dyn BlobFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Use a custom operation executor
    pub fn executor(mut self, executor: Arc<dyn OperationExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Share a staging area (and its lock table) with other pipelines
    pub fn staging(mut self, staging: StagingArea) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Path treated as the running executable for self-update
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    /// Build the pipeline
    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        let staging = self
            .staging
            .unwrap_or_else(|| StagingArea::new(&config.staging.directory));

        let fetcher: Arc<dyn BlobFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(
                &config.transfer.timeouts,
                &config.transfer.user_agent,
            )?),
        };

        let executor: Arc<dyn OperationExecutor> = match (self.executor, &config.commit.elevation_helper) {
            (Some(executor), _) => executor,
            (None, Some(helper)) => Arc::new(ElevatedExecutor::new(
                helper.program.clone(),
                helper.args.clone(),
                staging.root().join("batches"),
            )),
            (None, None) => Arc::new(LocalExecutor::new()),
        };

        let (state, _) = watch::channel(PipelineState::Idle);
        let (progress, _) = watch::channel(ProgressSnapshot::default());

        Ok(Pipeline {
            config,
            staging,
            fetcher,
            executor,
            executable: self.executable,
            counters: Arc::new(ProgressCounters::new()),
            state: Arc::new(state),
            progress: Arc::new(progress),
            current: Mutex::new(None),
            prepared: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
        })
    }
}

/// One logical job's synchronization pipeline
pub struct Pipeline {
    config: Config,
    staging: StagingArea,
    fetcher: Arc<dyn BlobFetcher>,
    executor: Arc<dyn OperationExecutor>,
    executable: Option<PathBuf>,
    counters: Arc<ProgressCounters>,
    state: Arc<watch::Sender<PipelineState>>,
    progress: Arc<watch::Sender<ProgressSnapshot>>,
    current: Mutex<Option<CancellationToken>>,
    prepared: Mutex<Option<PreparedRun>>,
    run_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("staging", &self.staging.root())
            .field("executor", &self.executor.name())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Pipeline {
    /// Builder starting from `config`
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Current state
    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Receive every state change
    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Receive sampled progress
    pub fn subscribe_progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    /// Raw counters, for callers that poll on their own schedule
    pub fn counters(&self) -> &Arc<ProgressCounters> {
        &self.counters
    }

    /// Staging area used by this pipeline
    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    /// Summary of the run waiting in `Pending`, if any
    pub fn pending_summary(&self) -> Option<PlanSummary> {
        lock(&self.prepared).as_ref().map(|run| run.summary.clone())
    }

    /// Scan, reconcile and park the plan in `Pending`
    ///
    /// Any earlier run of this pipeline is cancelled first.
    pub async fn prepare(&self, request: JobRequest) -> Result<PlanSummary> {
        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.current).replace(cancel.clone()) {
            previous.cancel();
        }

        let _run = self.run_lock.lock().await;
        lock(&self.prepared).take();
        if cancel.is_cancelled() {
            return Err(self.fail(Error::Cancelled));
        }

        self.set_state(PipelineState::Preparing);
        match self.plan(request, cancel).await {
            Ok(run) => {
                let summary = run.summary.clone();
                info!(
                    "Run {} pending: {} blob(s), {} bytes to download ({} already staged)",
                    run.id, summary.blobs_to_fetch, summary.bytes_to_fetch, summary.bytes_already_staged
                );
                *lock(&self.prepared) = Some(run);
                self.set_state(PipelineState::Pending);
                Ok(summary)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Download and commit the pending plan
    pub async fn start(&self) -> Result<RunStats> {
        let _run = self.run_lock.lock().await;
        let run = lock(&self.prepared)
            .take()
            .ok_or_else(|| Error::invalid_state("No pending run; prepare one first"))?;

        if run.cancel.is_cancelled() {
            return Err(self.fail(Error::Cancelled));
        }

        let started = Instant::now();
        self.set_state(PipelineState::Downloading);
        let sampler = ProgressSampler::spawn(
            Arc::clone(&self.counters),
            Arc::clone(&self.progress),
            self.config.progress.sample_interval(),
            self.config.progress.refresh_interval(),
        );
        let result = self.execute(&run).await;
        sampler.stop().await;

        match result {
            Ok(mut stats) => {
                stats.duration = started.elapsed();
                self.set_state(PipelineState::Finished);
                info!(
                    "Run {} finished in {:.2?}: {} fetched, {} placed, {} removed",
                    run.id, stats.duration, stats.files_fetched, stats.files_placed, stats.files_removed
                );
                Ok(stats)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Prepare and start without waiting for confirmation
    pub async fn run(&self, request: JobRequest) -> Result<RunStats> {
        self.prepare(request).await?;
        self.start().await
    }

    /// Cancel the active run, or discard the pending one
    pub fn cancel(&self) {
        if let Some(token) = lock(&self.current).as_ref() {
            token.cancel();
        }
        if lock(&self.prepared).take().is_some() {
            info!("Pending run discarded");
            self.set_state(PipelineState::Stopped);
        }
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Pipeline state {} -> {}", previous, state);
        }
    }

    fn fail(&self, error: Error) -> Error {
        match &error {
            Error::Cancelled => {
                info!("Run stopped");
                self.set_state(PipelineState::Stopped);
            }
            Error::Unsupported { message } if self.state() == PipelineState::Preparing => {
                warn!("Run unsupported: {}", message);
                self.set_state(PipelineState::Unsupported);
            }
            other => {
                error!("Run failed: {}", other);
                self.set_state(PipelineState::Error);
            }
        }
        error
    }

    fn orchestrator(&self) -> TransferOrchestrator {
        TransferOrchestrator::new(
            Arc::clone(&self.fetcher),
            self.staging.clone(),
            TransferOptions::from(&self.config.transfer),
        )
        .with_counters(Arc::clone(&self.counters))
    }

    fn resolve_root(&self, request: &JobRequest) -> Result<PathBuf> {
        if request.mode != JobMode::SelfUpdate {
            return request
                .install_root
                .clone()
                .ok_or_else(|| Error::unsupported("No install root given"));
        }

        let executable = match &self.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| {
                Error::unsupported(format!("Cannot locate the running executable: {}", e))
            })?,
        };
        executable
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                Error::unsupported(format!(
                    "Executable '{}' has no parent directory",
                    executable.display()
                ))
            })
    }

    async fn plan(&self, request: JobRequest, cancel: CancellationToken) -> Result<PreparedRun> {
        let install_root = self.resolve_root(&request)?;
        debug!("Preparing {} of '{}'", request.mode, install_root.display());

        request.target.validate()?;
        if let Some(source) = &request.source {
            source.validate()?;
        }
        if request.mode == JobMode::Migrate && request.source.is_none() {
            return Err(Error::manifest("A migration needs a source manifest"));
        }

        let mut renames = 0;
        for rename in &request.renames {
            let from = rename.from_path(&install_root).exists();
            let to = rename.to_path(&install_root).exists();
            if from && to {
                return Err(Error::unsupported(format!(
                    "Cannot rename '{}' to '{}': both exist",
                    rename.from, rename.to
                )));
            }
            renames += usize::from(from);
        }

        let scanner = TreeScanner::new(ScanOptions {
            exclude: vec![self.staging.root().to_path_buf()],
            buffer_size: self.config.transfer.buffer_size,
            ..ScanOptions::default()
        });
        let local = scanner.scan(&install_root, &cancel).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let plan = Reconciler::new(&install_root)
            .with_renames(request.renames.clone())
            .reuse_local(request.mode.reuses_local())
            .reconcile(&request.target, &local, request.source.as_ref());

        // Every blob must have a URL before anything is downloaded
        for entry in plan.fetch_blobs() {
            request
                .target
                .resolve_url(entry, self.config.transfer.url_prefix.as_deref())?;
        }

        let (bytes_to_fetch, bytes_already_staged) =
            self.orchestrator().reset_counters(&plan.to_fetch).await?;
        let files_in_place = plan
            .to_reuse
            .iter()
            .filter(|item| item.source_path().is_none())
            .count();

        let summary = PlanSummary {
            mode: request.mode,
            install_root: install_root.clone(),
            target_entries: request.target.len(),
            blobs_to_fetch: plan.fetch_blobs().len(),
            bytes_to_fetch,
            bytes_already_staged,
            files_to_place: if request.mode.commits() { plan.placements() } else { 0 },
            files_reused: plan.to_reuse.len() - files_in_place,
            files_in_place,
            files_to_remove: if request.mode.commits() { plan.to_remove.len() } else { 0 },
            files_to_harvest: plan.to_harvest.len(),
            renames: if request.mode.commits() { renames } else { 0 },
        };

        Ok(PreparedRun {
            id: OperationId::new_v4(),
            request,
            install_root,
            plan,
            summary,
            cancel,
        })
    }

    async fn execute(&self, run: &PreparedRun) -> Result<RunStats> {
        let plan = &run.plan;
        let request = &run.request;
        let cancel = &run.cancel;
        let orchestrator = self.orchestrator();

        orchestrator.reset_counters(&plan.to_fetch).await?;
        let transfer = orchestrator
            .download(&request.target, &plan.to_fetch, cancel)
            .await?;

        let mut stats = RunStats {
            files_fetched: transfer.fetched as u64,
            files_already_staged: transfer.already_staged as u64,
            bytes_downloaded: transfer.bytes_downloaded,
            ..RunStats::default()
        };

        if !request.mode.commits() {
            info!(
                "Predownload complete: {} blob(s) staged in '{}'",
                transfer.fetched + transfer.already_staged,
                self.staging.root().display()
            );
            return Ok(stats);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.set_state(PipelineState::Committing);
        let purge = self.config.staging.retention == CacheRetention::PurgeOnSuccess;
        let commit = CommitStage::new(
            &run.install_root,
            self.staging.clone(),
            Arc::clone(&self.executor),
            CommitOptions {
                verify_after_place: self.config.commit.verify_after_place,
                buffer_size: self.config.transfer.buffer_size,
                consume_staged: purge,
            },
        );
        let report = commit
            .apply(plan, &request.renames, request.marker.as_ref(), cancel)
            .await?;

        stats.files_reused = plan
            .to_reuse
            .iter()
            .filter(|item| item.source_path().is_some())
            .count() as u64;
        stats.files_placed = report.placed as u64;
        stats.files_removed = report.removed as u64;
        stats.directories_renamed = report.renamed as u64;

        if purge {
            let consumed: Vec<ContentHash> = plan
                .to_fetch
                .iter()
                .map(|entry| entry.hash)
                .chain(plan.to_harvest.iter().map(|item| item.hash))
                .collect();
            let purged = self.staging.purge(&consumed).await;
            debug!("Purged {} leftover staged blob(s)", purged);
        }

        Ok(stats)
    }
}
