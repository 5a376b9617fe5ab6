use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use std::path::{Path, PathBuf};

use crate::state::write_json_atomic;

/// The monotonic resume cursor shared by both pipeline variants.
///
/// `set` refuses to move backwards; the only way down is an explicit
/// [`Checkpoint::reset`] from the administrative path.
#[async_trait]
pub trait Checkpoint: Send {
    fn current(&self) -> i64;
    async fn set(&mut self, id: i64) -> Result<()>;
    async fn reset(&mut self) -> Result<()>;
}

fn guard_monotonic(current: i64, requested: i64) -> Result<()> {
    if requested < current {
        debug_assert!(
            false,
            "checkpoint would decrease: {current} -> {requested}"
        );
        tracing::error!(current, requested, "refusing to move the checkpoint backwards");
        return Err(eyre!(
            "checkpoint would decrease from {current} to {requested}"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointRecord {
    last_processed_id: i64,
    updated_at: DateTime<Utc>,
}

/// File-backed checkpoint, persisted with the same atomic-rename discipline
/// as the state ledger.
#[derive(Debug)]
pub struct JsonCheckpoint {
    path: PathBuf,
    current: i64,
}

impl JsonCheckpoint {
    /// With `resume` off the stored value is ignored and the run starts from
    /// zero; the file is overwritten on the first commit.
    pub fn load(path: impl AsRef<Path>, resume: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut current = 0i64;
        if resume && path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| eyre!("failed to read checkpoint {}: {e}", path.display()))?;
            let record: CheckpointRecord = serde_json::from_str(&raw)
                .map_err(|e| eyre!("failed to parse checkpoint {}: {e}", path.display()))?;
            current = record.last_processed_id;
        }
        Ok(Self { path, current })
    }

    fn persist(&self) -> Result<()> {
        write_json_atomic(
            &self.path,
            &CheckpointRecord {
                last_processed_id: self.current,
                updated_at: Utc::now(),
            },
        )
    }
}

#[async_trait]
impl Checkpoint for JsonCheckpoint {
    fn current(&self) -> i64 {
        self.current
    }

    async fn set(&mut self, id: i64) -> Result<()> {
        guard_monotonic(self.current, id)?;
        if id == self.current {
            return Ok(());
        }
        self.current = id;
        self.persist()
    }

    async fn reset(&mut self) -> Result<()> {
        tracing::warn!(previous = self.current, "checkpoint reset to 0");
        self.current = 0;
        self.persist()
    }
}

const GET_CHECKPOINT_QUERY: &str = r#"
    SELECT last_processed_id
    FROM pipeline_checkpoints
    WHERE pipeline = $1
"#;

const UPSERT_CHECKPOINT_QUERY: &str = r#"
    INSERT INTO pipeline_checkpoints (pipeline, last_processed_id, updated_at)
    VALUES ($1, $2, NOW())
    ON CONFLICT (pipeline)
    DO UPDATE SET last_processed_id = EXCLUDED.last_processed_id, updated_at = NOW()
"#;

/// Row-backed checkpoint: one row per pipeline name.
#[derive(Debug)]
pub struct DbCheckpoint {
    pool: PgPool,
    pipeline: String,
    current: i64,
}

impl DbCheckpoint {
    pub async fn load(pool: PgPool, pipeline: &str, resume: bool) -> Result<Self> {
        let current = if resume {
            sqlx::query_scalar::<_, i64>(GET_CHECKPOINT_QUERY)
                .bind(pipeline)
                .fetch_optional(&pool)
                .await
                .map_err(|e| eyre!("failed to read checkpoint row for {pipeline}: {e}"))?
                .unwrap_or(0)
        } else {
            0
        };
        Ok(Self {
            pool,
            pipeline: pipeline.to_string(),
            current,
        })
    }

    async fn persist(&self) -> Result<()> {
        sqlx::query(UPSERT_CHECKPOINT_QUERY)
            .bind(&self.pipeline)
            .bind(self.current)
            .execute(&self.pool)
            .await
            .map_err(|e| eyre!("failed to upsert checkpoint row for {}: {e}", self.pipeline))?;
        Ok(())
    }
}

#[async_trait]
impl Checkpoint for DbCheckpoint {
    fn current(&self) -> i64 {
        self.current
    }

    async fn set(&mut self, id: i64) -> Result<()> {
        guard_monotonic(self.current, id)?;
        if id == self.current {
            return Ok(());
        }
        self.current = id;
        self.persist().await
    }

    async fn reset(&mut self) -> Result<()> {
        tracing::warn!(pipeline = %self.pipeline, previous = self.current, "checkpoint reset to 0");
        self.current = 0;
        self.persist().await
    }
}
