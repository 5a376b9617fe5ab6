use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::processor::{JobState, Processor};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownFlag;

/// A submitted job being tracked to a terminal state.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub batch_id: u64,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub batch_id: u64,
    pub state: JobState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Concurrently polls submitted jobs until every one is terminal or the
/// shutdown flag fires.
///
/// At most `max_workers` jobs are polled at any moment; polls of a single
/// job are strictly serialized, and no ordering is assumed across jobs.
#[derive(Debug, Clone)]
pub struct JobMonitor {
    max_workers: usize,
    status_interval: Duration,
    job_timeout: Duration,
    poll_retry: RetryPolicy,
    poll_error_budget: u32,
}

impl JobMonitor {
    pub fn new(
        max_workers: usize,
        status_interval: Duration,
        job_timeout: Duration,
        poll_retry: RetryPolicy,
    ) -> Self {
        Self {
            max_workers: max_workers.max(1),
            status_interval,
            job_timeout,
            poll_retry,
            poll_error_budget: 3,
        }
    }

    /// Stamps a freshly submitted job with its polling deadline.
    pub fn handle(&self, job_id: String, batch_id: u64) -> JobHandle {
        let now = Instant::now();
        JobHandle {
            job_id,
            batch_id,
            submitted_at: now,
            deadline: now + self.job_timeout,
        }
    }

    /// Returns only once every registered job reached a terminal state or
    /// cancellation fired.
    pub async fn run_all(
        &self,
        processor: &dyn Processor,
        jobs: Vec<JobHandle>,
        cancel: &ShutdownFlag,
    ) -> HashMap<String, JobOutcome> {
        if jobs.is_empty() {
            return HashMap::new();
        }

        let outcomes = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        futures::stream::iter(jobs)
            .for_each_concurrent(self.max_workers, |job| {
                let outcomes = outcomes.clone();
                let mut cancel = cancel.clone();
                async move {
                    let outcome = self.watch_job(processor, &job, &mut cancel).await;
                    tracing::info!(
                        job_id = %outcome.job_id,
                        batch_id = outcome.batch_id,
                        state = ?outcome.state,
                        "job reached terminal state"
                    );
                    outcomes.lock().await.insert(outcome.job_id.clone(), outcome);
                }
            })
            .await;

        let map = outcomes.lock().await.clone();
        map
    }

    async fn watch_job(
        &self,
        processor: &dyn Processor,
        job: &JobHandle,
        cancel: &mut ShutdownFlag,
    ) -> JobOutcome {
        let terminal = |state: JobState, result, error| JobOutcome {
            job_id: job.job_id.clone(),
            batch_id: job.batch_id,
            state,
            result,
            error,
        };

        let mut consecutive_errors = 0u32;
        loop {
            if cancel.is_cancelled() {
                return terminal(JobState::Cancelled, None, None);
            }
            if Instant::now() >= job.deadline {
                tracing::warn!(
                    job_id = %job.job_id,
                    elapsed_s = job.submitted_at.elapsed().as_secs(),
                    timeout_s = self.job_timeout.as_secs(),
                    "job deadline exceeded"
                );
                processor.cancel(&job.job_id).await;
                return terminal(
                    JobState::TimedOut,
                    None,
                    Some(format!(
                        "no terminal state within {}s",
                        self.job_timeout.as_secs()
                    )),
                );
            }

            match self
                .poll_retry
                .call("status poll", || processor.poll(&job.job_id))
                .await
            {
                Ok(status) => {
                    consecutive_errors = 0;
                    match status.state {
                        JobState::Succeeded => {
                            return terminal(JobState::Succeeded, status.result, None);
                        }
                        JobState::Failed => {
                            let error = status
                                .error
                                .unwrap_or_else(|| "processor reported failure".to_string());
                            return terminal(JobState::Failed, status.result, Some(error));
                        }
                        JobState::Pending | JobState::Running => {}
                        // The wire never produces these; terminal just in case.
                        other => return terminal(other, status.result, status.error),
                    }
                }
                Err(err) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        job_id = %job.job_id,
                        consecutive_errors,
                        error = %err,
                        "status poll failed"
                    );
                    if consecutive_errors >= self.poll_error_budget {
                        return terminal(
                            JobState::Failed,
                            None,
                            Some(format!(
                                "status polling failed {consecutive_errors} times: {err}"
                            )),
                        );
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.status_interval) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}
