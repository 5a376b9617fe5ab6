use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::checkpoint::Checkpoint;
use crate::index::ExtractionIndex;
use crate::monitor::{JobHandle, JobMonitor, JobOutcome};
use crate::processor::{ArtifactStore, JobState, Processor};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownFlag;
use crate::source::{Candidate, ItemSource};
use crate::state::StateStore;

/// A candidate that passed both filters, waiting to be batched.
/// `attempt` counts failed dispatches so far.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub code: String,
    pub platform: String,
    pub id: Option<i64>,
    pub attempt: u32,
}

/// A bounded group of items submitted as one processor request.
/// Immutable once dispatched.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: u64,
    pub items: Vec<WorkItem>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// The exact payload submitted to the processor; also persisted as the
    /// request artifact.
    pub fn request_payload(&self) -> Value {
        serde_json::json!({
            "items": self
                .items
                .iter()
                .map(|item| serde_json::json!({
                    "platform": item.platform,
                    "code": item.code,
                }))
                .collect::<Vec<_>>(),
        })
    }

    fn max_item_id(&self) -> Option<i64> {
        self.items.iter().filter_map(|i| i.id).max()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub enumerated: usize,
    pub skipped: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub interrupted: bool,
}

pub struct OrchestratorOptions {
    pub batch_limit: usize,
    pub page_size: usize,
    pub max_retries: u32,
    pub limit: Option<usize>,
    pub dry_run: bool,
}

/// The top-level loop: enumerate → filter → batch → dispatch → monitor →
/// commit → checkpoint, then drain the retry queue one item at a time.
pub struct Orchestrator {
    source: Box<dyn ItemSource>,
    index: Box<dyn ExtractionIndex>,
    processor: Box<dyn Processor>,
    state: StateStore,
    checkpoint: Box<dyn Checkpoint>,
    monitor: JobMonitor,
    artifacts: ArtifactStore,
    submit_retry: RetryPolicy,
    opts: OrchestratorOptions,
    cancel: ShutdownFlag,
    next_batch_id: u64,
    consecutive_save_failures: u32,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Box<dyn ItemSource>,
        index: Box<dyn ExtractionIndex>,
        processor: Box<dyn Processor>,
        state: StateStore,
        checkpoint: Box<dyn Checkpoint>,
        monitor: JobMonitor,
        artifacts: ArtifactStore,
        submit_retry: RetryPolicy,
        opts: OrchestratorOptions,
        cancel: ShutdownFlag,
    ) -> Self {
        Self {
            source,
            index,
            processor,
            state,
            checkpoint,
            monitor,
            artifacts,
            submit_retry,
            opts,
            cancel,
            next_batch_id: 0,
            consecutive_save_failures: 0,
        }
    }

    pub async fn run(mut self) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let result = self.run_inner(&mut summary).await;

        // Flush once more whatever happened above; mutations already saved
        // themselves, this covers the empty-run case and belt-and-braces.
        if !self.opts.dry_run {
            if let Err(err) = self.state.save() {
                tracing::error!(error = %err, "final state save failed");
            }
        }
        summary.interrupted = self.cancel.is_cancelled();

        result.map(|()| summary)
    }

    async fn run_inner(&mut self, summary: &mut RunSummary) -> Result<()> {
        let skip = self.initial_skip_set();
        tracing::info!(
            processed = self.state.state().processed.len(),
            failed = self.state.state().failed.len(),
            skip = skip.len(),
            batch_limit = self.opts.batch_limit,
            dry_run = self.opts.dry_run,
            "orchestrator starting"
        );

        let mut enqueued: HashSet<String> = HashSet::new();
        let mut current: Vec<WorkItem> = Vec::new();
        let mut active: Vec<JobHandle> = Vec::new();
        let mut batches: HashMap<u64, Batch> = HashMap::new();
        let mut retry_queue: VecDeque<WorkItem> = VecDeque::new();

        // Enumeration phase.
        let mut cursor: Option<String> = None;
        'enumerate: loop {
            if self.cancel.is_cancelled() {
                tracing::info!("shutdown requested; stopping enumeration");
                break;
            }
            let page = self.source.next_page(self.opts.page_size, cursor).await?;

            // Local skip set first; only the leftovers cost an index query.
            let mut fresh: Vec<Candidate> = Vec::new();
            let mut limit_reached = false;
            for cand in page.items {
                if self.cancel.is_cancelled() {
                    break 'enumerate;
                }
                if let Some(limit) = self.opts.limit {
                    if summary.enumerated >= limit {
                        tracing::info!(limit, "enumeration limit reached");
                        limit_reached = true;
                        break;
                    }
                }
                summary.enumerated += 1;

                if skip.contains(&cand.code) || enqueued.contains(&cand.code) {
                    summary.skipped += 1;
                    continue;
                }
                enqueued.insert(cand.code.clone());
                fresh.push(cand);
            }

            if !fresh.is_empty() {
                let codes: Vec<String> = fresh.iter().map(|c| c.code.clone()).collect();
                let verdicts = self.index.verify_batch(&codes).await?;

                for cand in fresh {
                    if self.cancel.is_cancelled() {
                        break 'enumerate;
                    }
                    if verdicts.get(&cand.code).copied().unwrap_or(false) {
                        // The index already has it; record that so the next
                        // run skips it without a network round-trip.
                        tracing::debug!(code = %cand.code, "already embedded; marking processed");
                        summary.skipped += 1;
                        self.mark_processed_checked(&cand.code, "already-indexed", None)?;
                        continue;
                    }

                    current.push(WorkItem {
                        code: cand.code,
                        platform: cand.platform,
                        id: cand.id,
                        attempt: 0,
                    });

                    if current.len() >= self.opts.batch_limit {
                        let items = std::mem::take(&mut current);
                        self.dispatch(items, &mut active, &mut batches, &mut retry_queue, summary)
                            .await?;
                    }
                }
            }

            if limit_reached || page.done || page.next_cursor.is_none() {
                break;
            }
            cursor = page.next_cursor;
        }

        // Dispatch the remainder, even when smaller than the batch limit.
        if !current.is_empty() && !self.cancel.is_cancelled() {
            self.dispatch(current, &mut active, &mut batches, &mut retry_queue, summary)
                .await?;
        }

        // Monitor phase: wait for everything dispatched so far.
        let outcomes = self
            .monitor
            .run_all(self.processor.as_ref(), std::mem::take(&mut active), &self.cancel)
            .await;
        self.commit_outcomes(outcomes, &mut batches, &mut retry_queue, summary)
            .await?;

        // Retry phase: one item per batch until the queue drains.
        while let Some(item) = retry_queue.pop_front() {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    remaining = retry_queue.len() + 1,
                    "shutdown requested; abandoning retry queue"
                );
                break;
            }
            tracing::info!(code = %item.code, attempt = item.attempt, "retrying item");
            self.dispatch(vec![item], &mut active, &mut batches, &mut retry_queue, summary)
                .await?;
            let outcomes = self
                .monitor
                .run_all(self.processor.as_ref(), std::mem::take(&mut active), &self.cancel)
                .await;
            self.commit_outcomes(outcomes, &mut batches, &mut retry_queue, summary)
                .await?;
        }

        Ok(())
    }

    /// Codes that must not be dispatched again: already processed, or failed
    /// with the retry budget spent.
    fn initial_skip_set(&self) -> HashSet<String> {
        let state = self.state.state();
        let mut skip: HashSet<String> = state.processed.keys().cloned().collect();
        skip.extend(
            state
                .failed
                .iter()
                .filter(|(_, entry)| entry.retry_count > self.opts.max_retries)
                .map(|(code, _)| code.clone()),
        );
        skip
    }

    async fn dispatch(
        &mut self,
        items: Vec<WorkItem>,
        active: &mut Vec<JobHandle>,
        batches: &mut HashMap<u64, Batch>,
        retry_queue: &mut VecDeque<WorkItem>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        debug_assert!(!items.is_empty() && items.len() <= self.opts.batch_limit);

        self.next_batch_id += 1;
        let batch = Batch {
            batch_id: self.next_batch_id,
            items,
            created_at: Utc::now(),
        };

        if self.opts.dry_run {
            let codes: Vec<&str> = batch.items.iter().map(|i| i.code.as_str()).collect();
            tracing::info!(
                batch_id = batch.batch_id,
                size = batch.items.len(),
                ?codes,
                "DRY RUN: would dispatch batch"
            );
            return Ok(());
        }

        // Persist the request before the network call so an orphaned job can
        // be reconstructed from disk.
        self.artifacts
            .write_request(batch.batch_id, &batch.request_payload())?;

        let processor = self.processor.as_ref();
        match self
            .submit_retry
            .call("submit batch", || processor.submit(&batch))
            .await
        {
            Ok(job_id) => {
                tracing::info!(
                    batch_id = batch.batch_id,
                    job_id = %job_id,
                    size = batch.items.len(),
                    "batch dispatched"
                );
                summary.dispatched += 1;
                active.push(self.monitor.handle(job_id, batch.batch_id));
                batches.insert(batch.batch_id, batch);
            }
            Err(err) => {
                tracing::warn!(
                    batch_id = batch.batch_id,
                    error = %err,
                    "batch submission failed; queueing items for retry"
                );
                let message = format!("submission failed: {err}");
                self.requeue_or_fail(batch.items, "unsubmitted", &message, retry_queue, summary)?;
            }
        }
        Ok(())
    }

    async fn commit_outcomes(
        &mut self,
        outcomes: HashMap<String, JobOutcome>,
        batches: &mut HashMap<u64, Batch>,
        retry_queue: &mut VecDeque<WorkItem>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for outcome in outcomes.into_values() {
            let Some(batch) = batches.remove(&outcome.batch_id) else {
                tracing::warn!(
                    job_id = %outcome.job_id,
                    batch_id = outcome.batch_id,
                    "terminal job without a tracked batch; ignoring"
                );
                continue;
            };

            match outcome.state {
                JobState::Succeeded => {
                    tracing::info!(
                        batch_id = batch.batch_id,
                        size = batch.items.len(),
                        elapsed_s = (Utc::now() - batch.created_at).num_seconds(),
                        "batch succeeded"
                    );
                    let response = outcome
                        .result
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({ "state": "succeeded" }));
                    if let Err(err) = self.artifacts.write_response(batch.batch_id, &response) {
                        tracing::error!(batch_id = batch.batch_id, error = %err, "failed to write response artifact");
                    }
                    for item in &batch.items {
                        self.mark_processed_checked(
                            &item.code,
                            &outcome.job_id,
                            outcome.result.clone(),
                        )?;
                        summary.succeeded += 1;
                    }
                    if let Some(max_id) = batch.max_item_id() {
                        // Outcomes arrive unordered; only ever move forward.
                        if max_id > self.checkpoint.current() {
                            self.checkpoint.set(max_id).await?;
                        }
                    }
                }
                JobState::Failed | JobState::TimedOut => {
                    let error = outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "job failed".to_string());
                    let response = serde_json::json!({
                        "state": if outcome.state == JobState::TimedOut { "timed_out" } else { "failed" },
                        "error": error,
                    });
                    if let Err(err) = self.artifacts.write_response(batch.batch_id, &response) {
                        tracing::error!(batch_id = batch.batch_id, error = %err, "failed to write response artifact");
                    }
                    self.requeue_or_fail(
                        batch.items,
                        &outcome.job_id,
                        &error,
                        retry_queue,
                        summary,
                    )?;
                }
                JobState::Cancelled => {
                    // Neither processed nor failed; a rerun picks these up.
                    summary.cancelled += batch.items.len();
                }
                JobState::Pending | JobState::Running => {
                    // The monitor only returns terminal outcomes.
                    debug_assert!(false, "non-terminal outcome from monitor");
                }
            }
        }
        Ok(())
    }

    /// Records the failed attempt for every item, then either requeues it or
    /// retires it for good once the budget is spent.
    fn requeue_or_fail(
        &mut self,
        items: Vec<WorkItem>,
        job_id: &str,
        error: &str,
        retry_queue: &mut VecDeque<WorkItem>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        for mut item in items {
            self.mark_failed_checked(&item.code, job_id, error)?;
            item.attempt += 1;
            if item.attempt > self.opts.max_retries {
                tracing::warn!(code = %item.code, attempts = item.attempt, "retries exhausted");
                summary.failed += 1;
            } else {
                retry_queue.push_back(item);
            }
        }
        Ok(())
    }

    fn mark_processed_checked(
        &mut self,
        code: &str,
        job_id: &str,
        result: Option<Value>,
    ) -> Result<()> {
        if self.opts.dry_run {
            return Ok(());
        }
        let res = self.state.mark_processed(code, job_id, result);
        self.track_save(code, res)
    }

    fn mark_failed_checked(&mut self, code: &str, job_id: &str, error: &str) -> Result<()> {
        if self.opts.dry_run {
            return Ok(());
        }
        let res = self.state.mark_failed(code, job_id, error);
        self.track_save(code, res)
    }

    /// State-write failures are tolerated twice (the next mutation re-saves
    /// the whole ledger); the third in a row aborts the run.
    fn track_save(&mut self, code: &str, res: Result<()>) -> Result<()> {
        match res {
            Ok(()) => {
                self.consecutive_save_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.consecutive_save_failures += 1;
                tracing::error!(
                    code,
                    failures = self.consecutive_save_failures,
                    error = %err,
                    "state write failed"
                );
                if self.consecutive_save_failures >= 3 {
                    // One last attempt so at least a backup generation exists.
                    let _ = self.state.save();
                    return Err(eyre!(
                        "aborting after {} consecutive state write failures: {err}",
                        self.consecutive_save_failures
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Orchestrator, OrchestratorOptions, RunSummary};
    use crate::checkpoint::{Checkpoint, JsonCheckpoint};
    use crate::index::ExtractionIndex;
    use crate::monitor::JobMonitor;
    use crate::processor::{ArtifactStore, JobState, PollStatus, Processor};
    use crate::retry::{RetryPolicy, TransportError};
    use crate::shutdown::{self, ShutdownFlag, ShutdownHandle};
    use crate::source::{Candidate, ItemSource, Page};
    use crate::state::StateStore;
    use async_trait::async_trait;
    use eyre::Result;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeSource {
        pages: Vec<Vec<Candidate>>,
        next: usize,
    }

    impl FakeSource {
        fn new(pages: Vec<Vec<Candidate>>) -> Self {
            Self { pages, next: 0 }
        }

        fn of_codes(codes: &[&str]) -> Self {
            let items = codes
                .iter()
                .enumerate()
                .map(|(i, code)| Candidate {
                    code: code.to_string(),
                    platform: "instagram".to_string(),
                    id: Some(i as i64 + 1),
                })
                .collect();
            Self::new(vec![items])
        }
    }

    #[async_trait]
    impl ItemSource for FakeSource {
        async fn next_page(&mut self, _page_size: usize, _cursor: Option<String>) -> Result<Page> {
            let idx = self.next;
            self.next += 1;
            let items = self.pages.get(idx).cloned().unwrap_or_default();
            let done = self.next >= self.pages.len();
            Ok(Page {
                items,
                next_cursor: if done { None } else { Some(self.next.to_string()) },
                done,
            })
        }
    }

    struct FakeIndex {
        extracted: HashSet<String>,
    }

    #[async_trait]
    impl ExtractionIndex for FakeIndex {
        async fn is_extracted(&self, code: &str) -> Result<bool> {
            Ok(self.extracted.contains(code))
        }
    }

    /// Configurable processor double: can fail the first N submits and
    /// reports a fixed poll verdict per code set.
    #[derive(Default)]
    struct FakeProcessor {
        next_job: AtomicU64,
        submit_failures: AtomicU32,
        fail_codes: HashSet<String>,
        jobs: Mutex<HashMap<String, bool>>,
        cancel_on_poll: Option<ShutdownHandle>,
        hang: bool,
    }

    #[async_trait]
    impl Processor for FakeProcessor {
        async fn submit(&self, batch: &super::Batch) -> Result<String, TransportError> {
            if self
                .submit_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::transient("503 service unavailable"));
            }
            let ok = !batch.items.iter().any(|i| self.fail_codes.contains(&i.code));
            let job_id = format!("job-{}", self.next_job.fetch_add(1, Ordering::SeqCst) + 1);
            self.jobs.lock().unwrap().insert(job_id.clone(), ok);
            Ok(job_id)
        }

        async fn poll(&self, job_id: &str) -> Result<PollStatus, TransportError> {
            if let Some(handle) = &self.cancel_on_poll {
                handle.trigger();
            }
            if self.hang {
                return Ok(PollStatus {
                    state: JobState::Running,
                    result: None,
                    error: None,
                });
            }
            let ok = *self.jobs.lock().unwrap().get(job_id).expect("job exists");
            Ok(if ok {
                PollStatus {
                    state: JobState::Succeeded,
                    result: Some(serde_json::json!({"frames": 4})),
                    error: None,
                }
            } else {
                PollStatus {
                    state: JobState::Failed,
                    result: None,
                    error: Some("extraction crashed".to_string()),
                }
            })
        }

        async fn cancel(&self, _job_id: &str) {}
    }

    struct Fixture {
        dir: tempfile::TempDir,
        flag: ShutdownFlag,
        _handle: Option<ShutdownHandle>,
    }

    impl Fixture {
        fn new() -> Self {
            let (handle, flag) = shutdown::channel();
            Self {
                dir: tempfile::tempdir().unwrap(),
                flag,
                _handle: Some(handle),
            }
        }

        fn state_path(&self) -> std::path::PathBuf {
            self.dir.path().join("state.json")
        }

        fn orchestrator(
            &self,
            source: FakeSource,
            index: FakeIndex,
            processor: FakeProcessor,
            batch_limit: usize,
            max_retries: u32,
        ) -> Orchestrator {
            let state = StateStore::load(self.state_path()).unwrap();
            let checkpoint =
                JsonCheckpoint::load(self.dir.path().join("checkpoint.json"), true).unwrap();
            let monitor = JobMonitor::new(
                2,
                Duration::from_millis(20),
                Duration::from_secs(60),
                fast_retry(),
            );
            Orchestrator::new(
                Box::new(source),
                Box::new(index),
                Box::new(processor),
                state,
                Box::new(checkpoint),
                monitor,
                ArtifactStore::new(self.dir.path().join("artifacts")),
                fast_retry(),
                OrchestratorOptions {
                    batch_limit,
                    page_size: 100,
                    max_retries,
                    limit: None,
                    dry_run: false,
                },
                self.flag.clone(),
            )
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    fn no_index() -> FakeIndex {
        FakeIndex {
            extracted: HashSet::new(),
        }
    }

    fn checkpoint_value(path: &Path) -> i64 {
        JsonCheckpoint::load(path, true).unwrap().current()
    }

    #[tokio::test(start_paused = true)]
    async fn empty_source_dispatches_nothing() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(
            FakeSource::of_codes(&[]),
            no_index(),
            FakeProcessor::default(),
            2,
            3,
        );
        let summary = orch.run().await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                enumerated: 0,
                ..RunSummary::default()
            }
        );
        // The final flush writes the (empty) ledger.
        assert!(fx.state_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn already_extracted_codes_are_recorded_not_dispatched() {
        let fx = Fixture::new();
        let index = FakeIndex {
            extracted: ["a", "b", "c"].iter().map(|s| s.to_string()).collect(),
        };
        let processor = FakeProcessor::default();
        let orch = fx.orchestrator(FakeSource::of_codes(&["a", "b", "c"]), index, processor, 2, 3);
        let summary = orch.run().await.unwrap();

        assert_eq!(summary.enumerated, 3);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.dispatched, 0);
        let state = StateStore::load(fx.state_path()).unwrap();
        for code in ["a", "b", "c"] {
            assert!(state.state().is_processed(code));
            assert_eq!(state.state().processed[code].job_id, "already-indexed");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_plus_remainder() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(
            FakeSource::of_codes(&["a", "b", "c"]),
            no_index(),
            FakeProcessor::default(),
            2,
            3,
        );
        let summary = orch.run().await.unwrap();

        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);

        let state = StateStore::load(fx.state_path()).unwrap();
        for code in ["a", "b", "c"] {
            assert!(state.state().is_processed(code));
        }
        // Only the final batch may be short.
        assert_eq!(
            checkpoint_value(&fx.dir.path().join("checkpoint.json")),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_sizes_respect_the_limit() {
        let fx = Fixture::new();
        let processor = FakeProcessor::default();
        let orch = fx.orchestrator(
            FakeSource::of_codes(&["a", "b", "c", "d", "e"]),
            no_index(),
            processor,
            2,
            3,
        );
        let requests_dir = fx.dir.path().join("artifacts/requests");
        let summary = orch.run().await.unwrap();
        assert_eq!(summary.dispatched, 3);

        // Request artifacts exist for every dispatched batch.
        let mut sizes: Vec<usize> = std::fs::read_dir(requests_dir)
            .unwrap()
            .map(|entry| {
                let raw = std::fs::read_to_string(entry.unwrap().path()).unwrap();
                let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
                v["items"].as_array().unwrap().len()
            })
            .collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_submit_failure_recovers() {
        let fx = Fixture::new();
        let processor = FakeProcessor {
            submit_failures: AtomicU32::new(1),
            ..FakeProcessor::default()
        };
        let orch = fx.orchestrator(FakeSource::of_codes(&["a"]), no_index(), processor, 2, 3);
        let summary = orch.run().await.unwrap();

        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 0);
        let state = StateStore::load(fx.state_path()).unwrap();
        assert!(state.state().is_processed("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_the_code_failed() {
        let fx = Fixture::new();
        let max_retries = 2;
        let processor = FakeProcessor {
            fail_codes: ["x".to_string()].into(),
            ..FakeProcessor::default()
        };
        let orch = fx.orchestrator(FakeSource::of_codes(&["x"]), no_index(), processor, 2, max_retries);
        let summary = orch.run().await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 0);
        // Initial dispatch plus max_retries redispatches.
        assert_eq!(summary.dispatched as u32, max_retries + 1);

        let state = StateStore::load(fx.state_path()).unwrap();
        let entry = &state.state().failed["x"];
        assert_eq!(entry.retry_count, max_retries + 1);
        assert_eq!(entry.last_error.as_deref(), Some("extraction crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_codes_are_dispatched_once() {
        let fx = Fixture::new();
        let pages = vec![
            vec![
                Candidate {
                    code: "a".into(),
                    platform: "instagram".into(),
                    id: Some(1),
                },
                Candidate {
                    code: "b".into(),
                    platform: "instagram".into(),
                    id: Some(2),
                },
            ],
            vec![Candidate {
                code: "a".into(),
                platform: "instagram".into(),
                id: Some(3),
            }],
        ];
        let processor = FakeProcessor::default();
        let orch = fx.orchestrator(FakeSource::new(pages), no_index(), processor, 10, 3);
        let summary = orch.run().await.unwrap();

        assert_eq!(summary.enumerated, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_idempotent() {
        let fx = Fixture::new();
        let orch = fx.orchestrator(
            FakeSource::of_codes(&["a", "b", "c"]),
            no_index(),
            FakeProcessor::default(),
            2,
            3,
        );
        let first = orch.run().await.unwrap();
        assert_eq!(first.succeeded, 3);

        let processor = FakeProcessor::default();
        let orch = fx.orchestrator(FakeSource::of_codes(&["a", "b", "c"]), no_index(), processor, 2, 3);
        let second = orch.run().await.unwrap();

        assert_eq!(second.enumerated, 3);
        assert_eq!(second.skipped, 3);
        assert_eq!(second.dispatched, 0);
        assert_eq!(second.succeeded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_inflight_codes_untouched() {
        let fx = Fixture::new();
        let (handle, flag) = shutdown::channel();
        let processor = FakeProcessor {
            cancel_on_poll: Some(handle),
            hang: true,
            ..FakeProcessor::default()
        };

        let state = StateStore::load(fx.state_path()).unwrap();
        let checkpoint =
            JsonCheckpoint::load(fx.dir.path().join("checkpoint.json"), true).unwrap();
        let monitor = JobMonitor::new(
            2,
            Duration::from_millis(20),
            Duration::from_secs(60),
            fast_retry(),
        );
        let orch = Orchestrator::new(
            Box::new(FakeSource::of_codes(&["a", "b"])),
            Box::new(no_index()),
            Box::new(processor),
            state,
            Box::new(checkpoint),
            monitor,
            ArtifactStore::new(fx.dir.path().join("artifacts")),
            fast_retry(),
            OrchestratorOptions {
                batch_limit: 2,
                page_size: 100,
                max_retries: 3,
                limit: None,
                dry_run: false,
            },
            flag,
        );

        let summary = orch.run().await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.cancelled, 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 0);

        // Neither processed nor failed: a rerun starts from scratch for them.
        let state = StateStore::load(fx.state_path()).unwrap();
        assert!(state.state().processed.is_empty());
        assert!(state.state().failed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_dispatches_and_mutates_nothing() {
        let fx = Fixture::new();
        let index = FakeIndex {
            extracted: ["a".to_string()].into(),
        };
        let processor = FakeProcessor::default();

        let state = StateStore::load(fx.state_path()).unwrap();
        let checkpoint =
            JsonCheckpoint::load(fx.dir.path().join("checkpoint.json"), true).unwrap();
        let monitor = JobMonitor::new(
            2,
            Duration::from_millis(20),
            Duration::from_secs(60),
            fast_retry(),
        );
        let orch = Orchestrator::new(
            Box::new(FakeSource::of_codes(&["a", "b", "c"])),
            Box::new(index),
            Box::new(processor),
            state,
            Box::new(checkpoint),
            monitor,
            ArtifactStore::new(fx.dir.path().join("artifacts")),
            fast_retry(),
            OrchestratorOptions {
                batch_limit: 2,
                page_size: 100,
                max_retries: 3,
                limit: None,
                dry_run: true,
            },
            fx.flag.clone(),
        );

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.enumerated, 3);
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.succeeded, 0);
        // No state mutations, not even for the already-indexed code.
        assert!(!fx.state_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn limit_stops_enumeration_early() {
        let fx = Fixture::new();
        let processor = FakeProcessor::default();

        let state = StateStore::load(fx.state_path()).unwrap();
        let checkpoint =
            JsonCheckpoint::load(fx.dir.path().join("checkpoint.json"), true).unwrap();
        let monitor = JobMonitor::new(
            2,
            Duration::from_millis(20),
            Duration::from_secs(60),
            fast_retry(),
        );
        let orch = Orchestrator::new(
            Box::new(FakeSource::of_codes(&["a", "b", "c", "d"])),
            Box::new(no_index()),
            Box::new(processor),
            state,
            Box::new(checkpoint),
            monitor,
            ArtifactStore::new(fx.dir.path().join("artifacts")),
            fast_retry(),
            OrchestratorOptions {
                batch_limit: 10,
                page_size: 100,
                max_retries: 3,
                limit: Some(2),
                dry_run: false,
            },
            fx.flag.clone(),
        );

        let summary = orch.run().await.unwrap();
        assert_eq!(summary.enumerated, 2);
        assert_eq!(summary.succeeded, 2);
    }
}
