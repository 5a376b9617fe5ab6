mod checkpoint;
mod config;
mod index;
mod monitor;
mod orchestrator;
mod pipeline;
mod processor;
mod retry;
mod shutdown;
mod source;
mod state;

use checkpoint::Checkpoint;
use clap::{Args, Parser, Subcommand};
use config::{CheckpointMode, Config};
use eyre::{eyre, Result};
use fs2::FileExt;
use orchestrator::{Orchestrator, OrchestratorOptions, RunSummary};
use pipeline::{PipelineOptions, PipelineRunner};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "videx-orchestrator",
    version,
    about = "Resumable batch extraction orchestrator for video embeddings"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Max items per dispatched batch.
    #[arg(long, env = "VIDEX_BATCH_SIZE", default_value_t = 10)]
    batch_size: usize,

    /// Concurrent job pollers.
    #[arg(long, env = "VIDEX_MAX_WORKERS", default_value_t = 4)]
    max_workers: usize,

    /// Enumeration page size (capped at 1000 by the sources).
    #[arg(long, env = "VIDEX_PAGE_SIZE", default_value_t = 500)]
    page_size: usize,

    /// Seconds between polls of the same job.
    #[arg(long, env = "VIDEX_STATUS_INTERVAL", default_value_t = 10)]
    status_interval: u64,

    /// Per-job deadline in seconds; also the worker wall-clock budget.
    #[arg(long, env = "VIDEX_JOB_TIMEOUT", default_value_t = 300)]
    job_timeout: u64,

    /// Per-HTTP-request deadline in seconds.
    #[arg(long, env = "VIDEX_HTTP_TIMEOUT", default_value_t = 30)]
    http_timeout: u64,

    /// Per-item retry budget.
    #[arg(long, env = "VIDEX_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Where the resume checkpoint lives.
    #[arg(long, env = "VIDEX_CHECKPOINT_MODE", value_enum, default_value = "json")]
    checkpoint_mode: CheckpointMode,

    /// Fail closed when the vector index is unreachable.
    #[arg(long, env = "VIDEX_STRICT_INDEX")]
    strict_index: bool,

    /// Ignore the persisted checkpoint and enumerate from the beginning.
    #[arg(long)]
    no_resume: bool,

    /// Stop after enumerating this many candidates.
    #[arg(long)]
    limit: Option<usize>,

    /// Enumerate and filter only; dispatch nothing, mutate nothing.
    #[arg(long)]
    dry_run: bool,

    /// Reset the checkpoint to zero and exit.
    #[arg(long)]
    reset: bool,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Where to store the processing ledger.
    #[arg(long, default_value = "state/state.json")]
    state_file: PathBuf,

    /// Where to store the JSON checkpoint.
    #[arg(long, default_value = "state/checkpoint.json")]
    checkpoint_file: PathBuf,

    /// Where to store request/response artifacts.
    #[arg(long, default_value = "artifacts")]
    artifact_dir: PathBuf,

    /// Checkpoint row key when --checkpoint-mode database.
    #[arg(long, default_value = "extraction")]
    pipeline_name: String,

    /// Relational store URL; required by `pipeline` and the database
    /// checkpoint backend.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate codes under an object-store prefix and dispatch extraction
    /// batches to the processor API.
    Extract(ExtractArgs),
    /// Stream rows from the relational store and run the extraction worker
    /// per row.
    Pipeline(PipelineArgs),
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// Object-store bucket holding `<platform>/<code>/<asset>` keys.
    #[arg(long, env = "VIDEX_BUCKET")]
    bucket: String,

    /// Key prefix to enumerate under.
    #[arg(long, env = "VIDEX_PREFIX", default_value = "")]
    prefix: String,

    /// Base URL of the extraction processor API.
    #[arg(long, env = "VIDEX_PROCESSOR_URL")]
    processor_url: String,

    /// Base URL of the vector index.
    #[arg(long, env = "VIDEX_INDEX_URL")]
    index_url: String,

    /// Vector index collection to check for existing embeddings.
    #[arg(long, env = "VIDEX_INDEX_COLLECTION", default_value = "videos")]
    index_collection: String,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Worker command; the row's platform and code are appended as arguments.
    #[arg(long, env = "VIDEX_WORKER_CMD")]
    worker: String,

    /// Extra argument passed to the worker before platform and code
    /// (repeatable).
    #[arg(long = "worker-arg")]
    worker_args: Vec<String>,
}

fn exit_code(summary: &RunSummary) -> u8 {
    if summary.interrupted {
        130
    } else if summary.failed > 0 {
        1
    } else {
        0
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.common.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(summary) => {
            tracing::info!(
                enumerated = summary.enumerated,
                skipped = summary.skipped,
                dispatched = summary.dispatched,
                succeeded = summary.succeeded,
                failed = summary.failed,
                cancelled = summary.cancelled,
                interrupted = summary.interrupted,
                "run summary"
            );
            ExitCode::from(exit_code(&summary))
        }
        Err(err) => {
            tracing::error!(error = ?err, "run failed");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let common = cli.common;
    let cfg = Config::from_parts(
        common.batch_size,
        common.max_workers,
        common.page_size,
        common.status_interval,
        common.job_timeout,
        common.http_timeout,
        common.max_retries,
        common.checkpoint_mode,
        common.strict_index,
        !common.no_resume,
        common.limit,
        common.dry_run,
        common.state_file,
        common.checkpoint_file,
        common.artifact_dir,
        common.pipeline_name,
    )?;

    // Ensure the state directory exists before we create/lock the lockfile.
    if let Some(parent) = cfg.state_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create state directory {}: {e}", parent.display()))?;
        }
    }

    // Single-instance guard: lock alongside the state file. This is what
    // keeps the ledger and checkpoint single-writer across processes.
    let lock_path = cfg.state_file.with_extension("lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "orchestrator already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    let pool = connect_pool_if_needed(&cfg, &common.database_url, cli.command.as_ref()).await?;

    let mut checkpoint: Box<dyn Checkpoint> = match cfg.checkpoint_mode {
        CheckpointMode::Json => Box::new(checkpoint::JsonCheckpoint::load(
            &cfg.checkpoint_file,
            cfg.resume,
        )?),
        CheckpointMode::Database => {
            let pool = pool
                .clone()
                .ok_or_else(|| eyre!("database checkpoint requested but no DATABASE_URL given"))?;
            Box::new(checkpoint::DbCheckpoint::load(pool, &cfg.pipeline_name, cfg.resume).await?)
        }
    };

    if common.reset {
        checkpoint.reset().await?;
        tracing::info!("checkpoint reset; exiting");
        return Ok(RunSummary::default());
    }

    let Some(command) = cli.command else {
        return Err(eyre!("no subcommand given; run `extract` or `pipeline` (see --help)"));
    };

    let state = state::StateStore::load(&cfg.state_file)?;
    let (handle, cancel) = shutdown::channel();
    shutdown::spawn_signal_handler(handle);

    tracing::info!(
        batch_size = cfg.batch_limit,
        max_workers = cfg.max_workers,
        max_retries = cfg.max_retries,
        checkpoint_mode = ?cfg.checkpoint_mode,
        checkpoint = checkpoint.current(),
        resume = cfg.resume,
        dry_run = cfg.dry_run,
        state_file = %cfg.state_file.display(),
        "starting"
    );

    let retry = retry::RetryPolicy::default();

    match command {
        Command::Extract(args) => {
            let aws_cfg = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .load()
                .await;
            let s3 = aws_sdk_s3::Client::new(&aws_cfg);
            let http = reqwest::Client::builder()
                .timeout(cfg.http_timeout)
                .build()
                .map_err(|e| eyre!("failed to build http client: {e}"))?;

            let source = source::ObjectStoreSource::new(s3, args.bucket, args.prefix, retry);
            let vector_index = index::VectorIndexClient::new(
                args.index_url,
                args.index_collection,
                http.clone(),
                retry,
                cfg.strict_index,
            );
            let processor = processor::HttpProcessor::new(args.processor_url, http);
            let monitor = monitor::JobMonitor::new(
                cfg.max_workers,
                cfg.status_interval,
                cfg.job_timeout,
                retry,
            );

            let orchestrator = Orchestrator::new(
                Box::new(source),
                Box::new(vector_index),
                Box::new(processor),
                state,
                checkpoint,
                monitor,
                processor::ArtifactStore::new(&cfg.artifact_dir),
                retry,
                OrchestratorOptions {
                    batch_limit: cfg.batch_limit,
                    page_size: cfg.page_size,
                    max_retries: cfg.max_retries,
                    limit: cfg.limit,
                    dry_run: cfg.dry_run,
                },
                cancel,
            );
            orchestrator.run().await
        }
        Command::Pipeline(args) => {
            let pool = pool
                .ok_or_else(|| eyre!("the pipeline variant requires DATABASE_URL"))?;
            let source = source::DbItemSource::new(pool, checkpoint.current());
            let worker =
                processor::SubprocessRunner::new(args.worker, args.worker_args, cfg.job_timeout);

            let runner = PipelineRunner::new(
                Box::new(source),
                worker,
                state,
                checkpoint,
                retry,
                PipelineOptions {
                    page_size: cfg.page_size,
                    max_retries: cfg.max_retries,
                    limit: cfg.limit,
                    dry_run: cfg.dry_run,
                },
                cancel,
            );
            runner.run().await
        }
    }
}

async fn connect_pool_if_needed(
    cfg: &Config,
    database_url: &Option<String>,
    command: Option<&Command>,
) -> Result<Option<PgPool>> {
    let needs_db = cfg.checkpoint_mode == CheckpointMode::Database
        || matches!(command, Some(Command::Pipeline(_)));
    if !needs_db {
        return Ok(None);
    }
    let url = database_url
        .as_deref()
        .ok_or_else(|| eyre!("DATABASE_URL is required for the database checkpoint or the pipeline variant"))?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .map_err(|e| eyre!("failed to connect to the relational store: {e}"))?;
    Ok(Some(pool))
}
