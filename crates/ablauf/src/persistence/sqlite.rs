//! SQLite implementation of InstanceStore
//!
//! Durable persistence in the shape the actor host provides: SQLite-like
//! local storage per actor. One connection pool backs all actors of an
//! engine; each store is scoped by its `actor` column. Actors are
//! single-writer, so statements never race within one actor's rows.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, error};

use super::migrations::MIGRATIONS;
use super::store::*;

/// SQLite storage backend: one database, one store per actor.
///
/// # Example
///
/// ```ignore
/// let backend = SqliteBackend::connect("sqlite://ablauf.db").await?;
/// let store = backend.open("order-42").await?;
/// ```
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connect and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect(url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Wrap an existing pool; migrations are run to idempotence.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("migration failed: {e}");
                    StoreError::Database(e.to_string())
                })?;
        }
        debug!(statements = MIGRATIONS.len(), "migrations applied");
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn open(&self, actor: &str) -> Result<Arc<dyn InstanceStore>, StoreError> {
        Ok(Arc::new(SqliteStore {
            pool: self.pool.clone(),
            actor: actor.to_string(),
        }))
    }
}

/// One actor's view of the shared SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    actor: String,
}

fn encode_json(value: &Value) -> String {
    value.to_string()
}

fn decode_json(text: &str) -> Result<Value, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn workflow_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRow, StoreError> {
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    let result: Option<String> = row.get("result");

    Ok(WorkflowRow {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        status: WorkflowStatus::parse(&status)?,
        payload: decode_json(&payload)?,
        result: result.as_deref().map(decode_json).transpose()?,
        error: row.get("error"),
        paused: row.get::<i64, _>("paused") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn step_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StepRow, StoreError> {
    let step_type: String = row.get("step_type");
    let status: String = row.get("status");
    let result: Option<String> = row.get("result");
    let retry_history: String = row.get("retry_history");

    Ok(StepRow {
        name: row.get("name"),
        step_type: StepType::parse(&step_type)?,
        status: StepStatus::parse(&status)?,
        result: result.as_deref().map(decode_json).transpose()?,
        error: row.get("error"),
        error_stack: row.get("error_stack"),
        attempts: row.get::<i64, _>("attempts") as u32,
        wake_at: row.get("wake_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        duration_ms: row.get("duration_ms"),
        retry_history: serde_json::from_str(&retry_history)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
    })
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        // The backend migrates at connect time; re-running is a no-op.
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn get_workflow(&self) -> Result<Option<WorkflowRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow WHERE actor = ?")
            .bind(&self.actor)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn insert_workflow(&self, row: &WorkflowRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow
                (actor, id, workflow_type, status, payload, result, error, paused, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(actor) DO NOTHING
            "#,
        )
        .bind(&self.actor)
        .bind(&row.id)
        .bind(&row.workflow_type)
        .bind(row.status.as_str())
        .bind(encode_json(&row.payload))
        .bind(row.result.as_ref().map(encode_json))
        .bind(&row.error)
        .bind(row.paused as i64)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_status(
        &self,
        status: WorkflowStatus,
        paused: Option<bool>,
        updated_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow
            SET status = ?,
                paused = COALESCE(?, paused),
                updated_at = MAX(updated_at, ?)
            WHERE actor = ?
            "#,
        )
        .bind(status.as_str())
        .bind(paused.map(|p| p as i64))
        .bind(updated_at)
        .bind(&self.actor)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn finish_workflow(
        &self,
        status: WorkflowStatus,
        result: Option<&Value>,
        error: Option<&str>,
        updated_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow
            SET status = ?, result = ?, error = ?, updated_at = MAX(updated_at, ?)
            WHERE actor = ?
            "#,
        )
        .bind(status.as_str())
        .bind(result.map(encode_json))
        .bind(error)
        .bind(updated_at)
        .bind(&self.actor)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_step(&self, name: &str) -> Result<Option<StepRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM steps WHERE actor = ? AND name = ?")
            .bind(&self.actor)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(step_from_row).transpose()
    }

    async fn list_steps(&self) -> Result<Vec<StepRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE actor = ? ORDER BY name")
            .bind(&self.actor)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(step_from_row).collect()
    }

    async fn upsert_step(&self, row: &StepRow) -> Result<(), StoreError> {
        let retry_history = serde_json::to_string(&row.retry_history)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO steps
                (actor, name, step_type, status, result, error, error_stack,
                 attempts, wake_at, started_at, completed_at, duration_ms, retry_history)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(actor, name) DO UPDATE SET
                status = excluded.status,
                result = excluded.result,
                error = excluded.error,
                error_stack = excluded.error_stack,
                attempts = excluded.attempts,
                wake_at = excluded.wake_at,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                duration_ms = excluded.duration_ms,
                retry_history = excluded.retry_history
            "#,
        )
        .bind(&self.actor)
        .bind(&row.name)
        .bind(row.step_type.as_str())
        .bind(row.status.as_str())
        .bind(row.result.as_ref().map(encode_json))
        .bind(&row.error)
        .bind(&row.error_stack)
        .bind(row.attempts as i64)
        .bind(row.wake_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.duration_ms)
        .bind(retry_history)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn buffer_event(
        &self,
        event: &str,
        payload: &Value,
        received_at: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_buffer (actor, event, payload, received_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(actor, event) DO UPDATE SET
                payload = excluded.payload,
                received_at = excluded.received_at
            "#,
        )
        .bind(&self.actor)
        .bind(event)
        .bind(encode_json(payload))
        .bind(received_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn take_event(&self, event: &str) -> Result<Option<EventBufferRow>, StoreError> {
        let row = sqlx::query("SELECT * FROM event_buffer WHERE actor = ? AND event = ?")
            .bind(&self.actor)
            .bind(event)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.get("payload");
        let entry = EventBufferRow {
            event: row.get("event"),
            payload: decode_json(&payload)?,
            received_at: row.get("received_at"),
        };

        sqlx::query("DELETE FROM event_buffer WHERE actor = ? AND event = ?")
            .bind(&self.actor)
            .bind(event)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(Some(entry))
    }

    async fn clear_event_buffer(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM event_buffer WHERE actor = ?")
            .bind(&self.actor)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn append_live_message(
        &self,
        event: &str,
        data: &Value,
        created_at: i64,
    ) -> Result<i64, StoreError> {
        // Single-writer per actor: the seq subquery cannot race with itself.
        sqlx::query(
            r#"
            INSERT INTO sse_messages (actor, seq, event, data, created_at)
            VALUES (
                ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM sse_messages WHERE actor = ?),
                ?, ?, ?
            )
            "#,
        )
        .bind(&self.actor)
        .bind(&self.actor)
        .bind(event)
        .bind(encode_json(data))
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT MAX(seq) AS seq FROM sse_messages WHERE actor = ?")
            .bind(&self.actor)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.get::<i64, _>("seq"))
    }

    async fn list_live_messages(&self) -> Result<Vec<LiveMessageRow>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sse_messages WHERE actor = ? ORDER BY seq")
            .bind(&self.actor)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let data: String = row.get("data");
                Ok(LiveMessageRow {
                    seq: row.get("seq"),
                    event: row.get("event"),
                    data: decode_json(&data)?,
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    async fn index_upsert(&self, entry: &IndexEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO instances (actor, id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(actor, id) DO UPDATE SET
                status = excluded.status,
                updated_at = MAX(instances.updated_at, excluded.updated_at)
            "#,
        )
        .bind(&self.actor)
        .bind(&entry.id)
        .bind(entry.status.as_str())
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn index_list(
        &self,
        status: Option<WorkflowStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry>, StoreError> {
        let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT * FROM instances
                    WHERE actor = ? AND status = ?
                    ORDER BY updated_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(&self.actor)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM instances
                    WHERE actor = ?
                    ORDER BY updated_at DESC
                    LIMIT ?
                    "#,
                )
                .bind(&self.actor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(IndexEntry {
                    id: row.get("id"),
                    status: WorkflowStatus::parse(&status)?,
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                })
            })
            .collect()
    }
}
