//! hashsync - content-addressed install and update tool
//!
//! Brings an install directory to the state described by a manifest,
//! downloading only content that is not already present locally.

mod display;
mod json_output;
mod progress;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::{style, Term};
use display::{
    display_error, display_info, display_mismatches, display_plan, display_run_stats,
    display_success, display_warning, format_bytes,
};
use hashsync_config::{CacheRetention, Config, ConfigLoader, LogFormat};
use hashsync_engine::{
    JobMode, JobRequest, LocalExecutor, MarkerFile, OperationBatch, OperationExecutor, Pipeline,
    PlanSummary,
};
use hashsync_network::HttpFetcher;
use hashsync_sync::{digest_file, DirectoryRename, Manifest};
use hashsync_types::{ChecksumMismatch, Error, PipelineState, RunStats, ThreadCount};
use json_output::RunResultJson;
use progress::TransferProgress;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// hashsync - content-addressed install and update tool
#[derive(Parser)]
#[command(
    name = "hashsync",
    version = env!("CARGO_PKG_VERSION"),
    about = "Content-addressed install, repair and update tool",
    long_about = "hashsync brings an install directory to the state described by a manifest.\n\
                  Files are identified by SHA-256, so renamed or duplicated content is reused\n\
                  locally and only missing blobs are downloaded, resumably and in parallel."
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Verbose mode - detailed output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    /// Print a machine-readable JSON summary on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install, update or repair a directory from a manifest
    Sync {
        /// Manifest file path or http(s) URL
        manifest: String,
        /// Directory to bring to the manifest state
        #[arg(long)]
        install_path: PathBuf,
        /// Run mode
        #[arg(short, long, value_enum, default_value = "install")]
        mode: SyncModeArg,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Switch an install from one manifest to another
    Migrate {
        /// Manifest currently applied
        #[arg(long)]
        from: String,
        /// Manifest to switch to
        #[arg(long)]
        to: String,
        /// Install directory
        #[arg(long)]
        install_path: PathBuf,
        /// Directory rename applied before placement (FROM=TO, repeatable)
        #[arg(long = "rename", value_parser = parse_rename)]
        renames: Vec<DirectoryRename>,
        /// Completion marker written last, relative to the install path
        #[arg(long, requires = "marker_contents")]
        marker: Option<String>,
        /// File holding the marker contents
        #[arg(long, requires = "marker")]
        marker_contents: Option<PathBuf>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Update the directory of this executable
    SelfUpdate {
        /// Manifest file path or http(s) URL
        manifest: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show what a sync would do without changing anything
    Plan {
        /// Manifest file path or http(s) URL
        manifest: String,
        /// Install directory
        #[arg(long)]
        install_path: PathBuf,
        /// Run mode
        #[arg(short, long, value_enum, default_value = "install")]
        mode: SyncModeArg,
        #[command(flatten)]
        staging: StagingArgs,
    },
    /// Re-hash an install directory against a manifest
    Verify {
        /// Manifest file path or http(s) URL
        manifest: String,
        /// Install directory
        #[arg(long)]
        install_path: PathBuf,
    },
    /// Apply a JSON operation batch (elevated helper entry point)
    #[command(hide = true)]
    ApplyBatch {
        /// Batch file
        file: PathBuf,
    },
    /// Show or generate configuration
    Config {
        /// Write a default configuration file here instead
        #[arg(long)]
        generate: Option<PathBuf>,
        /// Output format for the effective configuration
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormatArg,
    },
}

#[derive(Args)]
struct StagingArgs {
    /// Base URL for manifest entries without their own URL
    #[arg(long)]
    url_prefix: Option<String>,
    /// Staging directory for downloaded blobs
    #[arg(long)]
    staging_dir: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    staging: StagingArgs,
    /// Number of concurrent downloads
    #[arg(short, long)]
    parallel: Option<usize>,
    /// Keep staged blobs after a successful run
    #[arg(long)]
    keep_cache: bool,
    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,
}

#[derive(ValueEnum, Clone, Copy)]
enum SyncModeArg {
    Install,
    Repair,
    Reinstall,
    Predownload,
}

impl From<SyncModeArg> for JobMode {
    fn from(mode: SyncModeArg) -> Self {
        match mode {
            SyncModeArg::Install => JobMode::Install,
            SyncModeArg::Repair => JobMode::Repair,
            SyncModeArg::Reinstall => JobMode::Reinstall,
            SyncModeArg::Predownload => JobMode::Predownload,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum ConfigFormatArg {
    Yaml,
    Toml,
    Json,
}

/// Output switches shared by every command
#[derive(Clone, Copy)]
struct Output {
    quiet: bool,
    json: bool,
}

impl Output {
    fn human(self) -> bool {
        !self.quiet && !self.json
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            display_error(&format!("{:#}", e));
            return ExitCode::from(1);
        }
    };

    if let Err(e) = init_logging(&cli, &config) {
        display_error(&format!("Failed to initialize logging: {:#}", e));
        return ExitCode::from(1);
    }

    info!("hashsync v{} starting", env!("CARGO_PKG_VERSION"));

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.downcast_ref::<Error>().map_or(1, exit_code);
            if code == 130 {
                display_warning("Stopped");
            } else {
                display_error(&format!("{:#}", e));
            }
            ExitCode::from(code)
        }
    }
}

/// Process exit code for an engine error
fn exit_code(error: &Error) -> u8 {
    match error {
        Error::Cancelled => 130,
        Error::ChecksumFailed { .. } => 2,
        Error::Unsupported { .. } => 3,
        Error::Elevation { .. } => 4,
        _ => 1,
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("Failed to load configuration '{}'", path.display())),
        None => ConfigLoader::load_default().context("Failed to load configuration"),
    }
}

fn init_logging(cli: &Cli, config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        config.logging.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let format = cli.log_format.map_or(config.logging.format, LogFormat::from);

    match format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .init(),
    }

    Ok(())
}

async fn run(cli: Cli, mut config: Config) -> Result<()> {
    let output = Output {
        quiet: cli.quiet,
        json: cli.json,
    };

    match cli.command {
        Commands::Sync {
            manifest,
            install_path,
            mode,
            run,
        } => {
            apply_run_args(&mut config, &run)?;
            let target = load_manifest(&manifest, &config).await?;
            let request = JobRequest::new(mode.into(), target).with_install_root(install_path);
            execute_job(config, request, &run, output, "sync").await
        }
        Commands::Migrate {
            from,
            to,
            install_path,
            renames,
            marker,
            marker_contents,
            run,
        } => {
            apply_run_args(&mut config, &run)?;
            let source = load_manifest(&from, &config).await?;
            let target = load_manifest(&to, &config).await?;
            let mut request =
                JobRequest::migrate(install_path, source, target).with_renames(renames);
            if let (Some(marker), Some(contents)) = (marker, marker_contents) {
                let contents = tokio::fs::read(&contents).await.with_context(|| {
                    format!("Failed to read marker contents '{}'", contents.display())
                })?;
                request = request.with_marker(MarkerFile::new(marker, contents));
            }
            execute_job(config, request, &run, output, "migrate").await
        }
        Commands::SelfUpdate { manifest, run } => {
            apply_run_args(&mut config, &run)?;
            let target = load_manifest(&manifest, &config).await?;
            let request = JobRequest::new(JobMode::SelfUpdate, target);
            execute_job(config, request, &run, output, "self_update").await
        }
        Commands::Plan {
            manifest,
            install_path,
            mode,
            staging,
        } => {
            apply_staging_args(&mut config, &staging);
            let target = load_manifest(&manifest, &config).await?;
            let request = JobRequest::new(mode.into(), target).with_install_root(install_path);
            plan_command(config, request, output).await
        }
        Commands::Verify {
            manifest,
            install_path,
        } => verify_command(&config, &manifest, &install_path, output).await,
        Commands::ApplyBatch { file } => apply_batch_command(&file).await,
        Commands::Config { generate, format } => config_command(&config, generate, format),
    }
}

fn apply_staging_args(config: &mut Config, args: &StagingArgs) {
    if let Some(prefix) = &args.url_prefix {
        config.transfer.url_prefix = Some(prefix.clone());
    }
    if let Some(dir) = &args.staging_dir {
        config.staging.directory = dir.clone();
    }
}

fn apply_run_args(config: &mut Config, args: &RunArgs) -> Result<()> {
    apply_staging_args(config, &args.staging);
    if let Some(parallel) = args.parallel {
        config.transfer.max_parallelism = ThreadCount::new(parallel).map_err(anyhow::Error::msg)?;
    }
    if args.keep_cache {
        config.staging.retention = CacheRetention::Keep;
    }
    Ok(())
}

fn parse_rename(text: &str) -> std::result::Result<DirectoryRename, String> {
    match text.split_once('=') {
        Some((from, to)) if !from.trim().is_empty() && !to.trim().is_empty() => {
            Ok(DirectoryRename::new(from.trim(), to.trim()))
        }
        _ => Err(format!("Expected FROM=TO, got '{}'", text)),
    }
}

fn is_remote(reference: &str) -> bool {
    let lower = reference.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

async fn load_manifest(reference: &str, config: &Config) -> Result<Manifest> {
    let manifest = if is_remote(reference) {
        let fetcher = HttpFetcher::new(&config.transfer.timeouts, &config.transfer.user_agent)?;
        let text = fetcher.fetch_text(reference).await?;
        Manifest::parse(&text)
    } else {
        Manifest::load(Path::new(reference)).await
    };
    let manifest = manifest.with_context(|| format!("Failed to load manifest '{}'", reference))?;
    debug!("Loaded {} manifest entries from '{}'", manifest.len(), reference);
    Ok(manifest)
}

fn build_pipeline(config: Config) -> Result<Arc<Pipeline>> {
    let pipeline = Arc::new(Pipeline::builder(config).build()?);

    let handle = Arc::clone(&pipeline);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            handle.cancel();
        }
    });

    Ok(pipeline)
}

async fn confirm(summary: &PlanSummary) -> Result<bool> {
    let prompt = format!(
        "Download {} and apply to {}?",
        format_bytes(summary.bytes_remaining()),
        summary.install_root.display()
    );
    let answer = tokio::task::spawn_blocking(move || {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
    })
    .await??;
    Ok(answer)
}

async fn execute_job(
    config: Config,
    request: JobRequest,
    args: &RunArgs,
    output: Output,
    operation: &str,
) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    let install_path = request
        .install_root
        .as_ref()
        .map(|path| path.display().to_string());

    let summary = match pipeline.prepare(request).await {
        Ok(summary) => summary,
        Err(e) => {
            let outcome = Err(e);
            report(operation, install_path, None, pipeline.state(), &outcome, output)?;
            return outcome
                .map(|_| ())
                .map_err(|e| anyhow::Error::from(e).context("Preparation failed"));
        }
    };
    let install_path = Some(summary.install_root.display().to_string());

    if output.human() {
        display_plan(&summary);
    }

    let interactive = !args.yes && !output.json && Term::stderr().is_term();
    if interactive && summary.bytes_remaining() > 0 && !confirm(&summary).await? {
        pipeline.cancel();
        let outcome = Err(Error::Cancelled);
        report(operation, install_path, Some(summary), pipeline.state(), &outcome, output)?;
        return outcome.map(|_| ()).map_err(Into::into);
    }

    let progress = TransferProgress::spawn(
        pipeline.subscribe_progress(),
        pipeline.subscribe_state(),
        !output.human(),
    );
    let outcome = pipeline.start().await.map(Some);
    progress.finish().await;

    report(operation, install_path, Some(summary), pipeline.state(), &outcome, output)?;
    outcome.map(|_| ()).map_err(Into::into)
}

/// Print the outcome; errors are returned to `main` for the exit code
fn report(
    operation: &str,
    install_path: Option<String>,
    plan: Option<PlanSummary>,
    state: PipelineState,
    outcome: &std::result::Result<Option<RunStats>, Error>,
    output: Output,
) -> Result<()> {
    if output.json {
        return RunResultJson::new(operation, install_path)
            .with_plan(plan)
            .with_outcome(state, outcome)
            .print();
    }
    if output.quiet {
        return Ok(());
    }

    match outcome {
        Ok(Some(stats)) => {
            display_run_stats(stats);
            display_success(&format!("{} finished", operation));
        }
        Ok(None) => {}
        Err(Error::ChecksumFailed { files }) => display_mismatches(files),
        Err(_) => {}
    }
    Ok(())
}

async fn plan_command(config: Config, request: JobRequest, output: Output) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    let install_path = request
        .install_root
        .as_ref()
        .map(|path| path.display().to_string());

    let outcome = pipeline.prepare(request).await;
    let state = pipeline.state();
    pipeline.cancel();

    match outcome {
        Ok(summary) => {
            if output.json {
                RunResultJson::new("plan", install_path)
                    .with_plan(Some(summary))
                    .with_outcome(state, &Ok(None))
                    .print()?;
            } else if !output.quiet {
                display_plan(&summary);
                if summary.is_noop() {
                    display_success("Install is up to date");
                }
            }
            Ok(())
        }
        Err(e) => {
            let outcome = Err(e);
            report("plan", install_path, None, state, &outcome, output)?;
            outcome.map(|_| ()).map_err(Into::into)
        }
    }
}

async fn verify_command(
    config: &Config,
    reference: &str,
    install_path: &Path,
    output: Output,
) -> Result<()> {
    let manifest = load_manifest(reference, config).await?;
    manifest.validate()?;

    if output.human() {
        display_info(&format!(
            "Verifying {} files in {}",
            manifest.len(),
            install_path.display()
        ));
    }

    let mut files = Vec::new();
    for entry in &manifest.entries {
        let path = entry.destination(install_path);
        let actual = match digest_file(&path, config.transfer.buffer_size).await {
            Ok((hash, _)) if hash == entry.hash => continue,
            Ok((hash, _)) => Some(hash),
            Err(e) => {
                debug!("Cannot hash '{}': {}", path.display(), e);
                None
            }
        };
        files.push(ChecksumMismatch {
            name: entry.remote_name.clone(),
            expected: entry.hash,
            actual,
        });
    }

    let (state, outcome) = if files.is_empty() {
        (PipelineState::Finished, Ok(None))
    } else {
        (PipelineState::Error, Err(Error::ChecksumFailed { files }))
    };
    let install_path = Some(install_path.display().to_string());

    if output.json {
        RunResultJson::new("verify", install_path)
            .with_outcome(state, &outcome)
            .print()?;
    } else if !output.quiet {
        match &outcome {
            Ok(_) => display_success(&format!("All {} files verified", manifest.len())),
            Err(Error::ChecksumFailed { files }) => display_mismatches(files),
            Err(_) => {}
        }
    }

    outcome.map(|_| ()).map_err(Into::into)
}

async fn apply_batch_command(file: &Path) -> Result<()> {
    let batch = OperationBatch::load(file)
        .await
        .with_context(|| format!("Failed to read batch '{}'", file.display()))?;
    info!(
        "Applying {} operation(s) from '{}'",
        batch.operations.len(),
        file.display()
    );
    LocalExecutor::new()
        .execute(&batch.operations, &CancellationToken::new())
        .await?;
    Ok(())
}

fn config_command(config: &Config, generate: Option<PathBuf>, format: ConfigFormatArg) -> Result<()> {
    if let Some(path) = generate {
        ConfigLoader::generate_default_config(&path)?;
        display_success(&format!("Default configuration written to {}", path.display()));
        return Ok(());
    }

    let text = match format {
        ConfigFormatArg::Yaml => serde_yaml::to_string(config)?,
        ConfigFormatArg::Toml => toml::to_string_pretty(config)?,
        ConfigFormatArg::Json => serde_json::to_string_pretty(config)?,
    };

    match ConfigLoader::config_exists() {
        Some(path) => println!(
            "{} Effective configuration ({}):",
            style("⚙").blue().bold(),
            path.display()
        ),
        None => println!("{} Effective configuration (defaults):", style("⚙").blue().bold()),
    }
    println!("{}", text.trim_end());
    Ok(())
}
