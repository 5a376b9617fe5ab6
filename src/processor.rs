use async_trait::async_trait;
use eyre::{eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use crate::orchestrator::Batch;
use crate::retry::{retry_after_hint, TransportError};
use crate::state::truncate_reason;

/// Job lifecycle as tracked by the monitor. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Maps the processor's wire `state` string onto [`JobState`].
/// Unknown values are treated as still running so polling continues.
pub(crate) fn parse_wire_state(raw: &str) -> JobState {
    match raw.to_ascii_lowercase().as_str() {
        "pending" | "queued" => JobState::Pending,
        "running" | "in_progress" | "processing" => JobState::Running,
        "succeeded" | "success" | "completed" | "done" => JobState::Succeeded,
        "failed" | "error" => JobState::Failed,
        other => {
            tracing::warn!(state = other, "unknown job state from processor; still polling");
            JobState::Running
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollStatus {
    pub state: JobState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// The remote processing service: submit a batch, poll it, best-effort cancel.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn submit(&self, batch: &Batch) -> Result<String, TransportError>;
    async fn poll(&self, job_id: &str) -> Result<PollStatus, TransportError>;
    async fn cancel(&self, job_id: &str);
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

/// HTTP client for the extraction processor API.
#[derive(Debug, Clone)]
pub struct HttpProcessor {
    base_url: String,
    http: reqwest::Client,
}

impl HttpProcessor {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    async fn submit(&self, batch: &Batch) -> Result<String, TransportError> {
        let url = format!("{}/process", self.base_url);
        let res = self
            .http
            .post(&url)
            .json(&batch.request_payload())
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;

        let status = res.status();
        if !status.is_success() {
            let hint = retry_after_hint(res.headers());
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, hint, body));
        }

        let resp: SubmitResponse = res
            .json()
            .await
            .map_err(|e| TransportError::permanent(format!("invalid submit response: {e}")))?;
        Ok(resp.job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<PollStatus, TransportError> {
        let url = format!("{}/status/{}", self.base_url, job_id);
        let res = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;

        let status = res.status();
        if !status.is_success() {
            let hint = retry_after_hint(res.headers());
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status, hint, body));
        }

        // Tolerant decode: only `state` is required, extra fields are fine.
        let payload: Value = res
            .json()
            .await
            .map_err(|e| TransportError::permanent(format!("invalid status response: {e}")))?;
        let state = payload
            .get("state")
            .and_then(|s| s.as_str())
            .map(parse_wire_state)
            .ok_or_else(|| {
                TransportError::permanent(format!("status response missing state: {payload}"))
            })?;

        Ok(PollStatus {
            state,
            result: payload.get("result").cloned().filter(|v| !v.is_null()),
            error: payload
                .get("error")
                .and_then(|e| e.as_str())
                .map(str::to_string),
        })
    }

    async fn cancel(&self, job_id: &str) {
        let url = format!("{}/cancel/{}", self.base_url, job_id);
        match self.http.post(&url).send().await {
            Ok(res) if res.status().is_success() => {
                tracing::info!(job_id, "remote job cancelled");
            }
            Ok(res) => {
                tracing::debug!(job_id, status = %res.status(), "cancel endpoint declined");
            }
            Err(err) => {
                tracing::debug!(job_id, error = %err, "cancel request failed");
            }
        }
    }
}

/// Append-only audit trail of submitted payloads and terminal responses,
/// keyed by batch id.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write(&self, kind: &str, batch_id: u64, payload: &Value) -> Result<PathBuf> {
        let dir = self.dir.join(kind);
        std::fs::create_dir_all(&dir)
            .map_err(|e| eyre!("failed to create artifact directory {}: {e}", dir.display()))?;
        let path = dir.join(format!("{batch_id}.json"));
        let json = serde_json::to_string_pretty(payload)
            .map_err(|e| eyre!("failed to serialize {kind} artifact: {e}"))?;
        std::fs::write(&path, json)
            .map_err(|e| eyre!("failed to write artifact {}: {e}", path.display()))?;
        Ok(path)
    }

    /// Must be called before the submit network call, so an orphaned job can
    /// be reconstructed from disk.
    pub fn write_request(&self, batch_id: u64, payload: &Value) -> Result<PathBuf> {
        self.write("requests", batch_id, payload)
    }

    pub fn write_response(&self, batch_id: u64, payload: &Value) -> Result<PathBuf> {
        self.write("responses", batch_id, payload)
    }
}

#[derive(Debug, Clone)]
pub struct SubprocessOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl SubprocessOutcome {
    pub fn describe_failure(&self) -> String {
        if self.timed_out {
            return "worker timed out".to_string();
        }
        match self.exit_code {
            Some(code) => format!("worker exited with status {code}: {}", self.stderr),
            None => format!("worker killed by signal: {}", self.stderr),
        }
    }
}

/// Out-of-process worker used by the sequential pipeline: one invocation per
/// row, the row's platform and code appended to the configured argv.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub async fn run(&self, platform: &str, code: &str) -> Result<SubprocessOutcome> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .arg(platform)
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| eyre!("failed to spawn worker {}: {e}", self.program))?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(SubprocessOutcome {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: truncate_reason(String::from_utf8_lossy(&output.stdout).trim()),
                stderr: truncate_reason(String::from_utf8_lossy(&output.stderr).trim()),
                timed_out: false,
            }),
            Ok(Err(err)) => Err(eyre!("failed to wait for worker {}: {err}", self.program)),
            Err(_) => {
                // Dropping the wait future reaps the child via kill_on_drop.
                tracing::warn!(
                    program = %self.program,
                    code,
                    timeout_s = self.timeout.as_secs(),
                    "worker exceeded its deadline; killed"
                );
                Ok(SubprocessOutcome {
                    success: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_wire_state, ArtifactStore, JobState, SubprocessRunner};
    use std::time::Duration;

    #[test]
    fn wire_states_map_onto_job_states() {
        assert_eq!(parse_wire_state("pending"), JobState::Pending);
        assert_eq!(parse_wire_state("RUNNING"), JobState::Running);
        assert_eq!(parse_wire_state("succeeded"), JobState::Succeeded);
        assert_eq!(parse_wire_state("completed"), JobState::Succeeded);
        assert_eq!(parse_wire_state("failed"), JobState::Failed);
        // Unknown states keep the job alive rather than failing it.
        assert_eq!(parse_wire_state("reticulating"), JobState::Running);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::TimedOut.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn artifacts_land_under_requests_and_responses() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let req = store
            .write_request(7, &serde_json::json!({"items": []}))
            .unwrap();
        let res = store
            .write_response(7, &serde_json::json!({"state": "succeeded"}))
            .unwrap();
        assert!(req.ends_with("requests/7.json"));
        assert!(res.ends_with("responses/7.json"));
        let raw = std::fs::read_to_string(req).unwrap();
        assert!(raw.contains("items"));
    }

    #[tokio::test]
    async fn subprocess_success_captures_stdout() {
        let runner = SubprocessRunner::new(
            "sh",
            vec!["-c".to_string(), "echo ok".to_string()],
            Duration::from_secs(5),
        );
        let out = runner.run("instagram", "abc123").await.unwrap();
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "ok");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn subprocess_failure_reports_exit_code_and_stderr() {
        let runner = SubprocessRunner::new(
            "sh",
            vec!["-c".to_string(), "echo broken >&2; exit 3".to_string()],
            Duration::from_secs(5),
        );
        let out = runner.run("instagram", "abc123").await.unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr, "broken");
        assert!(out.describe_failure().contains("status 3"));
    }

    #[tokio::test]
    async fn subprocess_deadline_kills_the_worker() {
        let runner = SubprocessRunner::new(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );
        let out = runner.run("instagram", "abc123").await.unwrap();
        assert!(!out.success);
        assert!(out.timed_out);
        assert_eq!(out.describe_failure(), "worker timed out");
    }

    #[tokio::test]
    async fn missing_worker_binary_is_an_error() {
        let runner = SubprocessRunner::new(
            "definitely-not-a-real-binary",
            vec![],
            Duration::from_secs(1),
        );
        assert!(runner.run("instagram", "abc123").await.is_err());
    }
}
