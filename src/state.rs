use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEntry {
    pub job_id: String,
    pub processed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub job_id: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// The durable per-code processing ledger.
///
/// A code lives in exactly one of the two maps: a successful run moves it
/// from `failed` to `processed`, and `processed` is terminal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    #[serde(default)]
    pub processed: BTreeMap<String, ProcessedEntry>,
    #[serde(default)]
    pub failed: BTreeMap<String, FailedEntry>,
}

impl ProcessState {
    pub fn is_processed(&self, code: &str) -> bool {
        self.processed.contains_key(code)
    }

    /// True once the code has failed more times than the retry budget allows.
    pub fn retry_exhausted(&self, code: &str, max_retries: u32) -> bool {
        self.failed
            .get(code)
            .map(|f| f.retry_count > max_retries)
            .unwrap_or(false)
    }
}

/// Single-writer store for [`ProcessState`] with atomic persistence.
///
/// Every mutation saves before returning, so a crash at any point leaves the
/// on-disk file reflecting the last completed call.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: ProcessState,
}

impl StateStore {
    /// Loads the state file, starting empty if it does not exist yet.
    ///
    /// A corrupt file falls back to the rolling backup; if that is also
    /// unreadable the store refuses to start rather than silently
    /// re-processing everything.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Self {
                path,
                state: ProcessState::default(),
            });
        }

        let raw = fs::read_to_string(&path)
            .map_err(|e| eyre!("failed to read state file {}: {e}", path.display()))?;
        match serde_json::from_str::<ProcessState>(&raw) {
            Ok(state) => Ok(Self { path, state }),
            Err(err) => {
                let backup = backup_path(&path);
                tracing::error!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %err,
                    "state file corrupt; attempting recovery from backup"
                );
                let raw = fs::read_to_string(&backup).map_err(|_| {
                    eyre!(
                        "state file {} is corrupt and no backup exists at {}",
                        path.display(),
                        backup.display()
                    )
                })?;
                let state: ProcessState = serde_json::from_str(&raw).map_err(|e| {
                    eyre!("state backup {} is also corrupt: {e}", backup.display())
                })?;
                tracing::warn!(backup = %backup.display(), "recovered state from backup");
                Ok(Self { path, state })
            }
        }
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Records a successful extraction and persists immediately.
    /// Clears any earlier failure record for the code.
    pub fn mark_processed(
        &mut self,
        code: &str,
        job_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        self.state.failed.remove(code);
        self.state.processed.insert(
            code.to_string(),
            ProcessedEntry {
                job_id: job_id.to_string(),
                processed_at: Utc::now(),
                result,
            },
        );
        self.save()
    }

    /// Records a failed attempt and persists immediately.
    ///
    /// A code that already reached `processed` stays there: that status is
    /// terminal and a late failure only gets logged.
    pub fn mark_failed(&mut self, code: &str, job_id: &str, error: &str) -> Result<()> {
        if self.state.processed.contains_key(code) {
            tracing::warn!(code, "late failure for an already-processed code; keeping processed status");
            return Ok(());
        }
        let now = Utc::now();
        let entry = self
            .state
            .failed
            .entry(code.to_string())
            .or_insert_with(|| FailedEntry {
                job_id: job_id.to_string(),
                failed_at: now,
                retry_count: 0,
                last_error: None,
            });
        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.job_id = job_id.to_string();
        entry.failed_at = now;
        entry.last_error = Some(truncate_reason(error));
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, &self.state)
    }
}

/// Keep stored error strings small to avoid bloating the ledger.
pub(crate) fn truncate_reason(s: &str) -> String {
    const MAX: usize = 240;
    // Avoid slicing by bytes (can panic on non-UTF8-boundary indices).
    let mut out: String = s.chars().take(MAX).collect();
    if out.len() < s.len() {
        out.push_str("...");
    }
    out
}

pub(crate) fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("json.bak")
}

/// Atomic write: temp file in the same directory, fsync, then rename over
/// the target. The previous good generation is kept as a rolling `.bak`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create directory {}: {e}", parent.display()))?;
        }
    }

    let json = serde_json::to_string_pretty(value).map_err(|e| eyre!("failed to serialize: {e}"))?;

    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = fs::File::create(&tmp_path)
        .map_err(|e| eyre!("failed to create temp file {}: {e}", tmp_path.display()))?;
    tmp.write_all(json.as_bytes())
        .map_err(|e| eyre!("failed to write temp file {}: {e}", tmp_path.display()))?;
    tmp.sync_all()
        .map_err(|e| eyre!("failed to sync temp file {}: {e}", tmp_path.display()))?;
    drop(tmp);

    if path.exists() {
        let backup = backup_path(path);
        fs::copy(path, &backup)
            .map_err(|e| eyre!("failed to write backup {}: {e}", backup.display()))?;
    }

    // Atomic-ish replace:
    // - On Unix, rename replaces the destination if it exists.
    // - On Windows, rename fails if the destination exists; in that case we remove then rename.
    if let Err(err) = fs::rename(&tmp_path, path) {
        if cfg!(windows) {
            let _ = fs::remove_file(path);
            fs::rename(&tmp_path, path)
                .map_err(|e| eyre!("failed to replace {}: {e}", path.display()))?;
        } else {
            return Err(eyre!("failed to replace {}: {err}", path.display()));
        }
    }
    Ok(())
}
