//! Postgres-backed task store.
//!
//! Tasks live in one `tasks` table. Workers claim with
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers (in this process or
//! others) never claim the same task and never block on each other.
//! A claim is a lease: an active task whose worker died is handed out
//! again once the lease expires.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};
use uuid::Uuid;

use super::store::{QueueStats, TaskStore, TaskStoreError};
use super::types::{LEASE_EXPIRED, Task, TaskId, TaskState};

const TASK_COLUMNS: &str = "id, task_type, payload, queue, state, retried, max_retry, \
     last_error, process_at, created_at, updated_at";

/// Create the `tasks` table if it does not exist yet. Idempotent.
pub async fn ensure_task_schema(pool: &PgPool) -> Result<(), TaskStoreError> {
    for sql in [
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id         UUID PRIMARY KEY,
            task_type  TEXT NOT NULL,
            payload    JSONB NOT NULL,
            queue      TEXT NOT NULL,
            state      TEXT NOT NULL,
            retried    INTEGER NOT NULL DEFAULT 0,
            max_retry  INTEGER NOT NULL,
            last_error TEXT NULL,
            process_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS tasks_claim_idx ON tasks (queue, state, process_at)",
    ] {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_task_schema", e))?;
    }
    Ok(())
}

/// Durable task store.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type), err)]
    async fn enqueue(&self, task: Task) -> Result<TaskId, TaskStoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, payload, queue, state, retried, max_retry,
                last_error, process_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.id.0)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(&task.queue)
        .bind(task.state.as_str())
        .bind(to_i32(task.retried))
        .bind(to_i32(task.max_retry))
        .bind(task.last_error.as_deref())
        .bind(task.process_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TaskStoreError::AlreadyExists(task.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;
        Ok(task.id)
    }

    async fn dequeue(&self, queues: &[String], lease: Duration) -> Result<Option<Task>, TaskStoreError> {
        if queues.is_empty() {
            return Ok(None);
        }

        // Reclaim tasks whose worker let the lease run out.
        let reclaimed = sqlx::query(
            r#"
            UPDATE tasks
            SET state = CASE WHEN retried < max_retry THEN 'retry' ELSE 'dead' END,
                retried = CASE WHEN retried < max_retry THEN retried + 1 ELSE retried END,
                last_error = $2,
                process_at = now(),
                updated_at = now()
            WHERE queue = ANY($1)
              AND state = 'active'
              AND process_at <= now()
            "#,
        )
        .bind(queues)
        .bind(LEASE_EXPIRED)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("dequeue", e))?;
        if reclaimed.rows_affected() > 0 {
            warn!(count = reclaimed.rows_affected(), "reclaimed tasks with expired lease");
        }

        // Queue priority is the position in `queues`; within a queue the
        // earliest due task wins. While active, `process_at` is the lease
        // deadline.
        let sql = format!(
            r#"
            UPDATE tasks
            SET state = 'active',
                process_at = now() + make_interval(secs => $2),
                updated_at = now()
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = ANY($1)
                  AND state IN ('pending', 'retry')
                  AND process_at <= now()
                ORDER BY array_position($1, queue), process_at, created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(queues)
            .bind(lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("dequeue", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn update(&self, task: &Task) -> Result<(), TaskStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = $2, retried = $3, last_error = $4, process_at = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(task.id.0)
        .bind(task.state.as_str())
        .bind(to_i32(task.retried))
        .bind(task.last_error.as_deref())
        .bind(task.process_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(task.id));
        }
        Ok(())
    }

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>, TaskStoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE ($1::TEXT IS NULL OR state = $1) \
             ORDER BY created_at, id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(state.map(TaskState::as_str))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(task_from_row).collect()
    }

    async fn stats(&self) -> Result<Vec<QueueStats>, TaskStoreError> {
        let rows = sqlx::query(
            "SELECT queue, state, COUNT(*) AS n FROM tasks GROUP BY queue, state ORDER BY queue",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut out: Vec<QueueStats> = Vec::new();
        for row in rows {
            let queue: String = row.try_get("queue").map_err(|e| decode("queue", e))?;
            let state: String = row.try_get("state").map_err(|e| decode("state", e))?;
            let n: i64 = row.try_get("n").map_err(|e| decode("n", e))?;
            let state = state.parse::<TaskState>().map_err(|e| decode("state", e))?;

            if out.last().is_none_or(|s| s.queue != queue) {
                out.push(QueueStats::new(queue));
            }
            if let Some(stats) = out.last_mut() {
                stats.add(state, usize::try_from(n).unwrap_or(0));
            }
        }
        Ok(out)
    }
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn decode(column: &str, err: impl std::fmt::Display) -> TaskStoreError {
    TaskStoreError::Storage(format!("failed to read {column}: {err}"))
}

fn task_from_row(row: &PgRow) -> Result<Task, TaskStoreError> {
    let id: Uuid = row.try_get("id").map_err(|e| decode("id", e))?;
    let state: String = row.try_get("state").map_err(|e| decode("state", e))?;
    let retried: i32 = row.try_get("retried").map_err(|e| decode("retried", e))?;
    let max_retry: i32 = row.try_get("max_retry").map_err(|e| decode("max_retry", e))?;
    let process_at: DateTime<Utc> = row.try_get("process_at").map_err(|e| decode("process_at", e))?;

    Ok(Task {
        id: TaskId::from_uuid(id),
        task_type: row.try_get("task_type").map_err(|e| decode("task_type", e))?,
        payload: row.try_get("payload").map_err(|e| decode("payload", e))?,
        queue: row.try_get("queue").map_err(|e| decode("queue", e))?,
        state: state.parse().map_err(|e| decode("state", e))?,
        retried: u32::try_from(retried).unwrap_or(0),
        max_retry: u32::try_from(max_retry).unwrap_or(0),
        last_error: row.try_get("last_error").map_err(|e| decode("last_error", e))?,
        process_at,
        created_at: row.try_get("created_at").map_err(|e| decode("created_at", e))?,
        updated_at: row.try_get("updated_at").map_err(|e| decode("updated_at", e))?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => TaskStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            TaskStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => TaskStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
