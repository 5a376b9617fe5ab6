use eyre::{eyre, Result};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CheckpointMode {
    /// File next to the state ledger.
    Json,
    /// Row in the `pipeline_checkpoints` table.
    Database,
}

/// Validated runtime configuration shared by both pipeline variants.
#[derive(Debug, Clone)]
pub struct Config {
    /// Max items per dispatched batch.
    pub batch_limit: usize,

    /// Concurrent job pollers.
    pub max_workers: usize,

    /// Enumeration page size (hard-capped by the sources at 1000).
    pub page_size: usize,

    /// Seconds between polls of the same job.
    pub status_interval: Duration,

    /// Per-job deadline; also the wall-clock budget of one worker invocation.
    pub job_timeout: Duration,

    /// Per-HTTP-request deadline.
    pub http_timeout: Duration,

    /// Per-item retry budget.
    pub max_retries: u32,

    pub checkpoint_mode: CheckpointMode,

    /// Fail closed when the vector index is unreachable.
    pub strict_index: bool,

    /// Honor the persisted checkpoint on startup.
    pub resume: bool,

    /// Stop enumerating after this many candidates.
    pub limit: Option<usize>,

    pub dry_run: bool,

    pub state_file: PathBuf,
    pub checkpoint_file: PathBuf,
    pub artifact_dir: PathBuf,

    /// Checkpoint row key for the database backend.
    pub pipeline_name: String,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        batch_limit: usize,
        max_workers: usize,
        page_size: usize,
        status_interval_seconds: u64,
        job_timeout_seconds: u64,
        http_timeout_seconds: u64,
        max_retries: u32,
        checkpoint_mode: CheckpointMode,
        strict_index: bool,
        resume: bool,
        limit: Option<usize>,
        dry_run: bool,
        state_file: PathBuf,
        checkpoint_file: PathBuf,
        artifact_dir: PathBuf,
        pipeline_name: String,
    ) -> Result<Self> {
        if batch_limit == 0 {
            return Err(eyre!("batch size must be > 0"));
        }
        if max_workers == 0 {
            return Err(eyre!("max workers must be > 0"));
        }
        if page_size == 0 {
            return Err(eyre!("page size must be > 0"));
        }
        if pipeline_name.trim().is_empty() {
            return Err(eyre!("pipeline name must not be empty"));
        }

        let status_interval = Duration::from_secs(status_interval_seconds.max(1));
        let job_timeout = Duration::from_secs(job_timeout_seconds.max(5));
        let http_timeout = Duration::from_secs(http_timeout_seconds.max(1));

        if status_interval >= job_timeout {
            tracing::warn!(
                status_interval_s = status_interval.as_secs(),
                job_timeout_s = job_timeout.as_secs(),
                "status interval is not below the job timeout; jobs may time out after a single poll"
            );
        }

        Ok(Self {
            batch_limit,
            max_workers,
            page_size,
            status_interval,
            job_timeout,
            http_timeout,
            max_retries,
            checkpoint_mode,
            strict_index,
            resume,
            limit,
            dry_run,
            state_file,
            checkpoint_file,
            artifact_dir,
            pipeline_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CheckpointMode, Config};
    use std::path::PathBuf;

    fn build(batch_limit: usize, max_workers: usize, page_size: usize) -> eyre::Result<Config> {
        Config::from_parts(
            batch_limit,
            max_workers,
            page_size,
            10,
            300,
            30,
            3,
            CheckpointMode::Json,
            false,
            true,
            None,
            false,
            PathBuf::from("state/state.json"),
            PathBuf::from("state/checkpoint.json"),
            PathBuf::from("state/artifacts"),
            "extraction".to_string(),
        )
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(build(0, 4, 500).is_err());
        assert!(build(10, 0, 500).is_err());
        assert!(build(10, 4, 0).is_err());
    }

    #[test]
    fn short_durations_are_clamped() {
        let cfg = Config::from_parts(
            10,
            4,
            500,
            0,
            0,
            0,
            3,
            CheckpointMode::Json,
            false,
            true,
            None,
            false,
            PathBuf::from("s.json"),
            PathBuf::from("c.json"),
            PathBuf::from("artifacts"),
            "extraction".to_string(),
        )
        .unwrap();
        assert_eq!(cfg.status_interval.as_secs(), 1);
        assert_eq!(cfg.job_timeout.as_secs(), 5);
        assert_eq!(cfg.http_timeout.as_secs(), 1);
    }

    #[test]
    fn valid_config_passes() {
        let cfg = build(10, 4, 500).unwrap();
        assert_eq!(cfg.batch_limit, 10);
        assert_eq!(cfg.checkpoint_mode, CheckpointMode::Json);
    }
}
