//! SQLite implementation of WorkflowEventStore
//!
//! Single-file persistence next to the application's data directory:
//! - Optimistic concurrency via a version-guarded instance update
//! - History, instance status and task queue written in one transaction
//! - Task claiming with a single `UPDATE ... RETURNING`

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::clock::{add_duration, SharedClock, SystemClock};
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_instances (
    id            TEXT PRIMARY KEY,
    workflow_type TEXT NOT NULL,
    status        TEXT NOT NULL,
    input         TEXT NOT NULL,
    result        TEXT,
    error         TEXT,
    version       INTEGER NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflow_instances_status
    ON workflow_instances (status, created_at);

CREATE TABLE IF NOT EXISTS workflow_events (
    workflow_id TEXT NOT NULL REFERENCES workflow_instances (id),
    sequence    INTEGER NOT NULL,
    event_type  TEXT NOT NULL,
    payload     TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (workflow_id, sequence)
);

CREATE TABLE IF NOT EXISTS workflow_tasks (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    id               TEXT NOT NULL UNIQUE,
    workflow_id      TEXT NOT NULL REFERENCES workflow_instances (id),
    kind             TEXT NOT NULL,
    ref_id           TEXT,
    payload          TEXT NOT NULL,
    status           TEXT NOT NULL,
    attempt          INTEGER NOT NULL,
    visible_at       INTEGER NOT NULL,
    lease_owner      TEXT,
    lease_expires_at INTEGER,
    last_error       TEXT,
    created_at       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workflow_tasks_due
    ON workflow_tasks (status, visible_at);

CREATE INDEX IF NOT EXISTS idx_workflow_tasks_workflow
    ON workflow_tasks (workflow_id, status);
"#;

/// SQLite implementation of WorkflowEventStore
///
/// # Example
///
/// ```ignore
/// use photoflow_durable::SqliteWorkflowEventStore;
///
/// let store = SqliteWorkflowEventStore::connect("sqlite://pb_data/workflow.db").await?;
/// ```
#[derive(Clone)]
pub struct SqliteWorkflowEventStore {
    pool: SqlitePool,
    clock: SharedClock,
}

impl SqliteWorkflowEventStore {
    /// Connect to `url` and create the schema if needed
    ///
    /// `sqlite::memory:` gives a private in-memory database held by a
    /// single connection.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_error("parse database url"))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(db_error("connect to database"))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create a store over an existing pool (schema must already exist)
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for event timestamps and leases
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_error("create schema"))?;
        Ok(())
    }

    async fn insert_events(
        tx: &mut Transaction<'_, Sqlite>,
        workflow_id: Uuid,
        history: &[HistoryEvent],
    ) -> Result<(), StoreError> {
        for entry in history {
            sqlx::query(
                r#"
                INSERT INTO workflow_events (workflow_id, sequence, event_type, payload, recorded_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(workflow_id.to_string())
            .bind(entry.sequence as i64)
            .bind(entry.event.event_type())
            .bind(serde_json::to_string(&entry.event)?)
            .bind(entry.recorded_at.timestamp_millis())
            .execute(&mut **tx)
            .await
            .map_err(db_error("insert event"))?;
        }
        Ok(())
    }

    async fn insert_task(
        tx: &mut Transaction<'_, Sqlite>,
        workflow_id: Uuid,
        payload: &TaskPayload,
        visible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let ref_id = match payload {
            TaskPayload::Activity { activity_id, .. } => Some(activity_id.as_str()),
            TaskPayload::Timer { timer_id } => Some(timer_id.as_str()),
            TaskPayload::Resume => None,
        };

        sqlx::query(
            r#"
            INSERT INTO workflow_tasks
                (id, workflow_id, kind, ref_id, payload, status, attempt, visible_at, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', 1, ?, ?)
            "#,
        )
        .bind(Uuid::now_v7().to_string())
        .bind(workflow_id.to_string())
        .bind(payload.kind())
        .bind(ref_id)
        .bind(serde_json::to_string(payload)?)
        .bind(visible_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&mut **tx)
        .await
        .map_err(db_error("enqueue task"))?;
        Ok(())
    }

    async fn apply_effects(
        tx: &mut Transaction<'_, Sqlite>,
        workflow_id: Uuid,
        effects: Vec<TaskEffect>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for effect in effects {
            match effect {
                TaskEffect::Enqueue {
                    payload,
                    visible_at,
                } => Self::insert_task(tx, workflow_id, &payload, visible_at, now).await?,
                TaskEffect::CancelTimer(timer_id) => {
                    sqlx::query(
                        r#"
                        UPDATE workflow_tasks SET status = 'canceled'
                        WHERE workflow_id = ? AND kind = 'timer' AND ref_id = ?
                          AND status IN ('pending', 'leased')
                        "#,
                    )
                    .bind(workflow_id.to_string())
                    .bind(&timer_id)
                    .execute(&mut **tx)
                    .await
                    .map_err(db_error("cancel timer task"))?;
                }
                TaskEffect::EnsureResume => {
                    let pending: i64 = sqlx::query_scalar(
                        r#"
                        SELECT COUNT(*) FROM workflow_tasks
                        WHERE workflow_id = ? AND kind = 'resume' AND status = 'pending'
                        "#,
                    )
                    .bind(workflow_id.to_string())
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(db_error("check resume task"))?;

                    if pending == 0 {
                        Self::insert_task(tx, workflow_id, &TaskPayload::Resume, now, now).await?;
                    }
                }
                TaskEffect::CancelAll => {
                    sqlx::query(
                        r#"
                        UPDATE workflow_tasks SET status = 'canceled'
                        WHERE workflow_id = ? AND status IN ('pending', 'leased')
                        "#,
                    )
                    .bind(workflow_id.to_string())
                    .execute(&mut **tx)
                    .await
                    .map_err(db_error("cancel workflow tasks"))?;
                }
            }
        }
        Ok(())
    }

    /// Why a guarded settle touched no row: the task is gone or someone
    /// else holds it
    async fn not_settled(&self, task_id: Uuid) -> StoreError {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM workflow_tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_one(&self.pool)
            .await;

        match exists {
            Ok(0) => StoreError::TaskNotFound(task_id),
            Ok(_) => StoreError::LeaseLost(task_id),
            Err(e) => db_error("check task")(e),
        }
    }
}

#[async_trait]
impl WorkflowEventStore for SqliteWorkflowEventStore {
    #[instrument(skip(self, input))]
    async fn create_workflow(
        &self,
        workflow_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let started = HistoryEvent {
            sequence: 1,
            recorded_at: now,
            event: WorkflowEvent::WorkflowStarted {
                workflow_type: workflow_type.to_string(),
                input: input.clone(),
            },
        };

        let mut tx = self.pool.begin().await.map_err(db_error("begin"))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, workflow_type, status, input, version, created_at, updated_at)
            VALUES (?, ?, 'running', ?, 1, ?, ?)
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(workflow_type)
        .bind(serde_json::to_string(&input)?)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::WorkflowAlreadyExists(workflow_id)
            }
            other => db_error("create workflow")(other),
        })?;

        Self::insert_events(&mut tx, workflow_id, std::slice::from_ref(&started)).await?;
        Self::insert_task(&mut tx, workflow_id, &TaskPayload::Resume, now, now).await?;

        tx.commit().await.map_err(db_error("commit"))?;

        debug!(%workflow_id, %workflow_type, "created workflow");
        Ok(1)
    }

    #[instrument(skip(self))]
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, status, input, result, error, version, created_at, updated_at
            FROM workflow_instances
            WHERE id = ?
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get workflow info"))?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow_info_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_type, status, input, result, error, version, created_at, updated_at
            FROM workflow_instances
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at, id
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list workflows"))?;

        rows.iter().map(workflow_info_from_row).collect()
    }

    #[instrument(skip(self, events), fields(event_count = events.len()))]
    async fn append_events(
        &self,
        workflow_id: Uuid,
        expected_version: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        // Planned against the expected state; the guarded update below enforces it
        let plan = plan_append(
            workflow_id,
            expected_version,
            WorkflowStatus::Running,
            expected_version,
            events,
            now,
        )?;

        let mut tx = self.pool.begin().await.map_err(db_error("begin"))?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET version = ?, status = ?,
                result = COALESCE(?, result), error = COALESCE(?, error),
                updated_at = ?
            WHERE id = ? AND version = ? AND status = 'running'
            "#,
        )
        .bind(plan.version as i64)
        .bind(plan.status.as_str())
        .bind(plan.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(plan.error.as_ref().map(serde_json::to_string).transpose()?)
        .bind(now.timestamp_millis())
        .bind(workflow_id.to_string())
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_error("update workflow version"))?
        .rows_affected();

        if updated == 0 {
            let row = sqlx::query("SELECT version, status FROM workflow_instances WHERE id = ?")
                .bind(workflow_id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("read workflow version"))?
                .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

            let version: i64 = row.try_get("version").map_err(db_error("decode row"))?;
            let status: String = row.try_get("status").map_err(db_error("decode row"))?;
            let status = status.parse::<WorkflowStatus>()?;
            if status.is_terminal() {
                return Err(StoreError::WorkflowTerminated(workflow_id));
            }
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_version,
                actual: version as u64,
            });
        }

        Self::insert_events(&mut tx, workflow_id, &plan.history).await?;
        Self::apply_effects(&mut tx, workflow_id, plan.effects, now).await?;

        tx.commit().await.map_err(db_error("commit"))?;

        debug!(%workflow_id, version = plan.version, status = %plan.status, "appended events");
        Ok(plan.version)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, payload, recorded_at
            FROM workflow_events
            WHERE workflow_id = ?
            ORDER BY sequence
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load events"))?;

        if rows.is_empty() {
            // Instances always hold at least WorkflowStarted
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }

        rows.iter()
            .map(|row| {
                let sequence: i64 = row.try_get("sequence").map_err(db_error("decode row"))?;
                let payload: String = row.try_get("payload").map_err(db_error("decode row"))?;
                let recorded_at: i64 =
                    row.try_get("recorded_at").map_err(db_error("decode row"))?;
                Ok(HistoryEvent {
                    sequence: sequence as u64,
                    recorded_at: from_millis(recorded_at)?,
                    event: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn claim_tasks(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let now = self.clock.now().timestamp_millis();
        let lease_expires_at = add_duration(self.clock.now(), lease);

        let rows = sqlx::query(
            r#"
            UPDATE workflow_tasks
            SET status = 'leased', lease_owner = ?1, lease_expires_at = ?2
            WHERE seq IN (
                SELECT seq FROM workflow_tasks
                WHERE (status = 'pending' AND visible_at <= ?3)
                   OR (status = 'leased' AND lease_expires_at <= ?3)
                ORDER BY visible_at, seq
                LIMIT ?4
            )
            RETURNING seq, id, workflow_id, payload, attempt, visible_at
            "#,
        )
        .bind(worker_id)
        .bind(lease_expires_at.timestamp_millis())
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("claim tasks"))?;

        let mut claimed = rows
            .iter()
            .map(|row| {
                let seq: i64 = row.try_get("seq").map_err(db_error("decode row"))?;
                let visible_at: i64 = row.try_get("visible_at").map_err(db_error("decode row"))?;
                let id: String = row.try_get("id").map_err(db_error("decode row"))?;
                let workflow_id: String =
                    row.try_get("workflow_id").map_err(db_error("decode row"))?;
                let payload: String = row.try_get("payload").map_err(db_error("decode row"))?;
                let attempt: i64 = row.try_get("attempt").map_err(db_error("decode row"))?;
                let task = ClaimedTask {
                    id: parse_uuid(&id)?,
                    workflow_id: parse_uuid(&workflow_id)?,
                    payload: serde_json::from_str(&payload)?,
                    attempt: attempt as u32,
                    lease_expires_at,
                };
                Ok(((visible_at, seq), task))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        claimed.sort_by_key(|(order, _)| *order);

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }
        Ok(claimed.into_iter().map(|(_, task)| task).collect())
    }

    #[instrument(skip(self))]
    async fn complete_task(&self, task_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_tasks
            SET status = CASE WHEN status = 'canceled' THEN 'canceled' ELSE 'completed' END,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE id = ?1
              AND (status = 'canceled' OR (status = 'leased' AND lease_owner = ?2))
            "#,
        )
        .bind(task_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("complete task"))?;

        if result.rows_affected() == 0 {
            return Err(self.not_settled(task_id).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_tasks
            SET last_error = ?1,
                status = CASE WHEN status = 'canceled' THEN 'canceled' ELSE 'pending' END,
                attempt = CASE WHEN status = 'canceled' THEN attempt ELSE attempt + 1 END,
                visible_at = CASE WHEN status = 'canceled' THEN visible_at ELSE ?2 END,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE id = ?3
              AND (status = 'canceled' OR (status = 'leased' AND lease_owner = ?4))
            "#,
        )
        .bind(error)
        .bind(visible_at.timestamp_millis())
        .bind(task_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("retry task"))?;

        if result.rows_affected() == 0 {
            return Err(self.not_settled(task_id).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn extend_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let expires_at = add_duration(self.clock.now(), lease);
        let result = sqlx::query(
            r#"
            UPDATE workflow_tasks SET lease_expires_at = ?
            WHERE id = ? AND status = 'leased' AND lease_owner = ?
            "#,
        )
        .bind(expires_at.timestamp_millis())
        .bind(task_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("extend lease"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(task_id));
        }
        Ok(expires_at)
    }

    #[instrument(skip(self))]
    async fn release_expired_leases(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_tasks
            SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL
            WHERE status = 'leased' AND lease_expires_at <= ?
            "#,
        )
        .bind(self.clock.now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error("release expired leases"))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self))]
    async fn list_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, payload, status, attempt, visible_at, last_error
            FROM workflow_tasks
            WHERE workflow_id = ?
            ORDER BY seq
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list tasks"))?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(db_error("decode row"))?;
                let workflow_id: String =
                    row.try_get("workflow_id").map_err(db_error("decode row"))?;
                let payload: String = row.try_get("payload").map_err(db_error("decode row"))?;
                let status: String = row.try_get("status").map_err(db_error("decode row"))?;
                let attempt: i64 = row.try_get("attempt").map_err(db_error("decode row"))?;
                let visible_at: i64 = row.try_get("visible_at").map_err(db_error("decode row"))?;
                Ok(TaskInfo {
                    id: parse_uuid(&id)?,
                    workflow_id: parse_uuid(&workflow_id)?,
                    payload: serde_json::from_str(&payload)?,
                    status: status.parse()?,
                    attempt: attempt as u32,
                    visible_at: from_millis(visible_at)?,
                    last_error: row.try_get("last_error").map_err(db_error("decode row"))?,
                })
            })
            .collect()
    }
}

// Helper functions

fn db_error(action: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", action, e);
        StoreError::Database(e.to_string())
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {millis}")))
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Serialization(format!("bad uuid {value}: {e}")))
}

fn workflow_info_from_row(row: &SqliteRow) -> Result<WorkflowInfo, StoreError> {
    let id: String = row.try_get("id").map_err(db_error("decode row"))?;
    let status: String = row.try_get("status").map_err(db_error("decode row"))?;
    let input: String = row.try_get("input").map_err(db_error("decode row"))?;
    let result: Option<String> = row.try_get("result").map_err(db_error("decode row"))?;
    let error: Option<String> = row.try_get("error").map_err(db_error("decode row"))?;
    let version: i64 = row.try_get("version").map_err(db_error("decode row"))?;
    let created_at: i64 = row.try_get("created_at").map_err(db_error("decode row"))?;
    let updated_at: i64 = row.try_get("updated_at").map_err(db_error("decode row"))?;

    Ok(WorkflowInfo {
        id: parse_uuid(&id)?,
        workflow_type: row.try_get("workflow_type").map_err(db_error("decode row"))?,
        status: status.parse()?,
        input: serde_json::from_str(&input)?,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        error: error
            .as_deref()
            .map(serde_json::from_str::<WorkflowError>)
            .transpose()?,
        version: version as u64,
        created_at: from_millis(created_at)?,
        updated_at: from_millis(updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::workflow::{ActivityOptions, WorkflowSignal};
    use serde_json::json;

    async fn store() -> (Arc<ManualClock>, SqliteWorkflowEventStore) {
        let clock = Arc::new(ManualClock::default());
        let store = SqliteWorkflowEventStore::connect("sqlite::memory:")
            .await
            .unwrap()
            .with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let (_, store) = store().await;
        let workflow_id = Uuid::now_v7();

        store
            .create_workflow(workflow_id, "gallery", json!({"gallery_id": "g1"}))
            .await
            .unwrap();

        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Running);
        assert_eq!(info.version, 1);
        assert_eq!(info.input, json!({"gallery_id": "g1"}));

        let events = store.load_events(workflow_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.event_type(), "workflow_started");

        let duplicate = store.create_workflow(workflow_id, "gallery", json!({})).await;
        assert!(matches!(duplicate, Err(StoreError::WorkflowAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_append_conflict_and_terminal() {
        let (_, store) = store().await;
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "t", json!({})).await.unwrap();

        let version = store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::ActivityScheduled {
                    activity_id: "activity-1".into(),
                    activity_type: "process".into(),
                    input: json!({}),
                    options: ActivityOptions::default(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(version, 2);

        let stale = store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::SignalReceived {
                    signal: WorkflowSignal::new("x", json!(1)),
                }],
            )
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2
            })
        ));

        store
            .append_events(
                workflow_id,
                2,
                vec![WorkflowEvent::WorkflowFailed {
                    error: WorkflowError::new("boom").with_code("activity_failed"),
                }],
            )
            .await
            .unwrap();

        let late = store
            .append_events(
                workflow_id,
                3,
                vec![WorkflowEvent::WorkflowCompleted { result: json!(1) }],
            )
            .await;
        assert!(matches!(late, Err(StoreError::WorkflowTerminated(_))));

        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Failed);
        assert_eq!(info.error.unwrap().message, "boom");

        let open = store
            .list_tasks(workflow_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Leased))
            .count();
        assert_eq!(open, 0);
    }

    #[tokio::test]
    async fn test_claim_respects_visibility_and_leases() {
        let (clock, store) = store().await;
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "t", json!({})).await.unwrap();
        store
            .append_events(
                workflow_id,
                1,
                vec![WorkflowEvent::TimerScheduled {
                    timer_id: "timer-1".into(),
                    duration_ms: 60_000,
                    fire_at: clock.now() + chrono::Duration::seconds(60),
                }],
            )
            .await
            .unwrap();

        let claimed = store.claim_tasks("w1", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, TaskPayload::Resume);
        store.complete_task(claimed[0].id, "w1").await.unwrap();

        clock.advance(Duration::from_secs(60));
        let claimed = store.claim_tasks("w1", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(
            claimed[0].payload,
            TaskPayload::Timer {
                timer_id: "timer-1".into()
            }
        );

        clock.advance(Duration::from_secs(31));
        assert_eq!(store.release_expired_leases().await.unwrap(), 1);
        let reclaimed = store.claim_tasks("w2", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(reclaimed[0].id, claimed[0].id);
        assert!(matches!(
            store.extend_lease(claimed[0].id, "w1", Duration::from_secs(30)).await,
            Err(StoreError::LeaseLost(_))
        ));
        store
            .extend_lease(claimed[0].id, "w2", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_only_lease_holder_settles_task() {
        let (clock, store) = store().await;
        let workflow_id = Uuid::now_v7();
        store.create_workflow(workflow_id, "t", json!({})).await.unwrap();

        let stale = store.claim_tasks("w1", 1, Duration::from_secs(30)).await.unwrap();
        clock.advance(Duration::from_secs(31));
        let current = store.claim_tasks("w2", 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(current[0].id, stale[0].id);

        assert!(matches!(
            store.retry_task(stale[0].id, "w1", clock.now(), "late").await,
            Err(StoreError::LeaseLost(_))
        ));
        assert!(matches!(
            store.complete_task(stale[0].id, "w1").await,
            Err(StoreError::LeaseLost(_))
        ));
        assert!(store
            .claim_tasks("w3", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());

        let task = &store.list_tasks(workflow_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Leased);
        assert_eq!(task.attempt, 1);

        store
            .retry_task(current[0].id, "w2", clock.now(), "boom")
            .await
            .unwrap();
        let task = &store.list_tasks(workflow_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 2);

        assert!(matches!(
            store.complete_task(Uuid::now_v7(), "w2").await,
            Err(StoreError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_workflows_by_status() {
        let (_, store) = store().await;
        let running = Uuid::now_v7();
        let done = Uuid::now_v7();
        store.create_workflow(running, "t", json!({})).await.unwrap();
        store.create_workflow(done, "t", json!({})).await.unwrap();
        store
            .append_events(
                done,
                1,
                vec![WorkflowEvent::WorkflowCompleted { result: json!(null) }],
            )
            .await
            .unwrap();

        let all = store.list_workflows(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let completed = store
            .list_workflows(Some(WorkflowStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done);
    }
}
