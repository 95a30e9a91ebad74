use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::continuation::{ContinuationRecord, ContinuationStore, ContinuationToken};
use crate::error::ContinuationError;
use crate::execution::ExecutionId;
use crate::job::{JobSpec, TaskId, TerminalStatus};

const STATE_PENDING: &str = "pending";
const STATE_REDEEMED: &str = "redeemed";

/// PostgreSQL-backed continuation store.
///
/// Continuations survive a restart, so a new process can
/// [`resume`](crate::runtime::Orchestrator::resume) an execution whose
/// quantum items were suspended by an earlier one. Redemption is a single
/// conditional `UPDATE`, which makes it at-most-once across processes.
#[derive(Clone, Debug)]
pub struct PostgresContinuationStore {
    pool: PgPool,
}

impl PostgresContinuationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from `config`.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the continuation table and its index if missing.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quorch_continuations (
                token UUID PRIMARY KEY,
                task_id TEXT NOT NULL UNIQUE,
                execution_id TEXT NOT NULL,
                spec JSONB NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                status JSONB,
                registered_at TIMESTAMPTZ NOT NULL,
                redeemed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS quorch_continuations_execution_idx
                ON quorch_continuations (execution_id)
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!("quorch_continuations schema ready");
        Ok(())
    }

    fn record_from_row(row: &PgRow) -> anyhow::Result<ContinuationRecord> {
        let spec: JobSpec = serde_json::from_value(row.try_get("spec")?)?;
        Ok(ContinuationRecord {
            token: ContinuationToken(row.try_get::<Uuid, _>("token")?),
            task_id: TaskId::new(row.try_get::<String, _>("task_id")?),
            execution_id: ExecutionId::new(row.try_get::<String, _>("execution_id")?),
            spec,
            registered_at: row.try_get::<DateTime<Utc>, _>("registered_at")?,
        })
    }
}

fn store_err(err: impl Into<anyhow::Error>) -> ContinuationError {
    ContinuationError::Store(err.into())
}

#[async_trait]
impl ContinuationStore for PostgresContinuationStore {
    async fn register(&self, record: ContinuationRecord) -> Result<(), ContinuationError> {
        let spec = serde_json::to_value(&record.spec).map_err(store_err)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO quorch_continuations (
                token, task_id, execution_id, spec, state, status, registered_at, redeemed_at
            )
            VALUES ($1, $2, $3, $4, 'pending', NULL, $5, NULL)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.token.0)
        .bind(record.task_id.as_str())
        .bind(record.execution_id.as_str())
        .bind(spec)
        .bind(record.registered_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if inserted.rows_affected() == 0 {
            return Err(ContinuationError::DuplicateRegistration(record.task_id));
        }
        debug!(task_id = %record.task_id, token = %record.token, "continuation registered");
        Ok(())
    }

    async fn redeem(
        &self,
        task_id: &TaskId,
        status: TerminalStatus,
    ) -> Result<ContinuationRecord, ContinuationError> {
        let status_json = serde_json::to_value(&status).map_err(store_err)?;
        let updated = sqlx::query(
            r#"
            UPDATE quorch_continuations
            SET state = 'redeemed',
                status = $2,
                redeemed_at = NOW()
            WHERE task_id = $1
              AND state = 'pending'
            RETURNING token, task_id, execution_id, spec, registered_at
            "#,
        )
        .bind(task_id.as_str())
        .bind(status_json)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        if let Some(row) = updated {
            return Self::record_from_row(&row).map_err(ContinuationError::Store);
        }

        let existing = sqlx::query("SELECT state FROM quorch_continuations WHERE task_id = $1")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match existing {
            Some(row) => {
                let state: String = row.try_get("state").map_err(store_err)?;
                if state == STATE_REDEEMED {
                    Err(ContinuationError::AlreadyRedeemed(task_id.clone()))
                } else {
                    Err(ContinuationError::Store(anyhow::anyhow!(
                        "continuation for task {task_id} in unexpected state {state}"
                    )))
                }
            }
            None => Err(ContinuationError::UnknownTask(task_id.clone())),
        }
    }

    async fn take_redeemed(
        &self,
        token: &ContinuationToken,
    ) -> Result<Option<TerminalStatus>, ContinuationError> {
        let row = sqlx::query(
            r#"
            DELETE FROM quorch_continuations
            WHERE token = $1
              AND state = 'redeemed'
            RETURNING status
            "#,
        )
        .bind(token.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => {
                let status: serde_json::Value = row.try_get("status").map_err(store_err)?;
                let status = serde_json::from_value(status).map_err(store_err)?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    async fn cancel(&self, token: &ContinuationToken) -> Result<(), ContinuationError> {
        sqlx::query("DELETE FROM quorch_continuations WHERE token = $1")
            .bind(token.0)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn outstanding(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<ContinuationRecord>, ContinuationError> {
        let rows = sqlx::query(
            r#"
            SELECT token, task_id, execution_id, spec, registered_at
            FROM quorch_continuations
            WHERE execution_id = $1
            ORDER BY registered_at ASC
            "#,
        )
        .bind(execution_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter()
            .map(|row| Self::record_from_row(row).map_err(ContinuationError::Store))
            .collect()
    }

    async fn pending_count(&self) -> Result<usize, ContinuationError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS pending FROM quorch_continuations WHERE state = $1",
        )
        .bind(STATE_PENDING)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        let pending: i64 = row.try_get("pending").map_err(store_err)?;
        Ok(pending.max(0) as usize)
    }
}
