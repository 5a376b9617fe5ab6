use eyre::Result;
use std::collections::HashSet;

use crate::checkpoint::Checkpoint;
use crate::orchestrator::RunSummary;
use crate::processor::SubprocessRunner;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownFlag;
use crate::source::ItemSource;
use crate::state::StateStore;

const WORKER_JOB_ID: &str = "worker";

pub struct PipelineOptions {
    pub page_size: usize,
    pub max_retries: u32,
    pub limit: Option<usize>,
    pub dry_run: bool,
}

/// The sequential variant: rows stream in ID order, each one runs through
/// the out-of-process worker, and the checkpoint advances row by row once a
/// row is terminal either way.
pub struct PipelineRunner {
    source: Box<dyn ItemSource>,
    worker: SubprocessRunner,
    state: StateStore,
    checkpoint: Box<dyn Checkpoint>,
    retry: RetryPolicy,
    opts: PipelineOptions,
    cancel: ShutdownFlag,
}

impl PipelineRunner {
    pub fn new(
        source: Box<dyn ItemSource>,
        worker: SubprocessRunner,
        state: StateStore,
        checkpoint: Box<dyn Checkpoint>,
        retry: RetryPolicy,
        opts: PipelineOptions,
        cancel: ShutdownFlag,
    ) -> Self {
        Self {
            source,
            worker,
            state,
            checkpoint,
            retry,
            opts,
            cancel,
        }
    }

    pub async fn run(mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let result = self.run_inner(&mut summary).await;

        if !self.opts.dry_run {
            if let Err(err) = self.state.save() {
                tracing::error!(error = %err, "final state save failed");
            }
        }
        summary.interrupted = self.cancel.is_cancelled();

        result.map(|()| summary)
    }

    async fn run_inner(&mut self, summary: &mut RunSummary) -> Result<()> {
        let state = self.state.state();
        let mut skip: HashSet<String> = state.processed.keys().cloned().collect();
        skip.extend(
            state
                .failed
                .iter()
                .filter(|(_, entry)| entry.retry_count > self.opts.max_retries)
                .map(|(code, _)| code.clone()),
        );
        tracing::info!(
            checkpoint = self.checkpoint.current(),
            skip = skip.len(),
            dry_run = self.opts.dry_run,
            "pipeline starting"
        );

        let mut cursor: Option<String> = None;
        'pages: loop {
            if self.cancel.is_cancelled() {
                tracing::info!("shutdown requested; stopping enumeration");
                break;
            }
            let page = self.source.next_page(self.opts.page_size, cursor).await?;

            for cand in page.items {
                if self.cancel.is_cancelled() {
                    break 'pages;
                }
                if let Some(limit) = self.opts.limit {
                    if summary.enumerated >= limit {
                        tracing::info!(limit, "row limit reached");
                        break 'pages;
                    }
                }
                summary.enumerated += 1;

                if skip.contains(&cand.code) {
                    summary.skipped += 1;
                    continue;
                }
                if self.opts.dry_run {
                    tracing::info!(code = %cand.code, id = ?cand.id, "DRY RUN: would run worker");
                    continue;
                }

                self.process_row(&cand.platform, &cand.code, summary).await?;
                if self.cancel.is_cancelled() {
                    // The row may still have retries left; do not advance
                    // past it.
                    break 'pages;
                }

                // The row is terminal either way; resume after it.
                if let Some(id) = cand.id {
                    if id > self.checkpoint.current() {
                        self.checkpoint.set(id).await?;
                    }
                }
            }

            if page.done || page.next_cursor.is_none() {
                break;
            }
            cursor = page.next_cursor;
        }

        Ok(())
    }

    /// Runs the worker for one row, retrying failures in place until the
    /// budget is spent.
    async fn process_row(
        &mut self,
        platform: &str,
        code: &str,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            summary.dispatched += 1;

            let outcome = self.worker.run(platform, code).await?;
            if outcome.success {
                tracing::info!(code, attempt, "worker finished");
                let result = (!outcome.stdout.is_empty())
                    .then(|| serde_json::Value::String(outcome.stdout.clone()));
                self.state.mark_processed(code, WORKER_JOB_ID, result)?;
                summary.succeeded += 1;
                return Ok(());
            }

            let error = outcome.describe_failure();
            tracing::warn!(code, attempt, error = %error, "worker failed");
            self.state.mark_failed(code, WORKER_JOB_ID, &error)?;

            if attempt > self.opts.max_retries {
                tracing::warn!(code, attempts = attempt, "retries exhausted");
                summary.failed += 1;
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
        }
    }
}
