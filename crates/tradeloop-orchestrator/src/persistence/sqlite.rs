//! SQLite implementation of TaskStore
//!
//! Durable persistence over sqlx. Each row keeps the full serialized task
//! alongside the columns the scheduler filters and orders on, so reads
//! deserialize one blob and writes keep the indexes in step.
//!
//! Locking discipline: one async mutex per logical table (tasks, workflows,
//! events) serializes writers; SQLite itself serializes the file. Locks are
//! held only for the span of the statement batch and never across external
//! calls.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::debug;

use tradeloop_contracts::{
    CorrelationId, Event, QueueName, Task, TaskId, TaskState, WorkflowId, WorkflowState,
};

use super::store::{StoreError, TaskStore, TransitionPatch, WorkflowRecord};
use crate::config::RetentionConfig;

/// SQLite-backed TaskStore
///
/// # Example
///
/// ```ignore
/// use tradeloop_orchestrator::SqliteTaskStore;
///
/// let store = SqliteTaskStore::connect("sqlite://tradeloop.db").await?;
/// ```
pub struct SqliteTaskStore {
    pool: SqlitePool,
    tasks_lock: Mutex<()>,
    workflows_lock: Mutex<()>,
    events_lock: Mutex<()>,
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl SqliteTaskStore {
    /// Connect and initialize the schema
    ///
    /// The pool is pinned to a single connection: SQLite allows one writer
    /// at a time and a `sqlite::memory:` URL would otherwise hand every
    /// connection its own database.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(db_err)?;

        let store = Self {
            pool,
            tasks_lock: Mutex::new(()),
            workflows_lock: Mutex::new(()),
            events_lock: Mutex::new(()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Fresh in-memory database (tests)
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let _guard = self.tasks_lock.lock().await;

        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                task_type TEXT NOT NULL,
                state TEXT NOT NULL,
                priority INTEGER NOT NULL,
                created_at_ms INTEGER NOT NULL,
                next_retry_at_ms INTEGER,
                completed_at_ms INTEGER,
                correlation_id TEXT NOT NULL,
                parent_workflow_id TEXT,
                scheduled_by TEXT,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_ready
                ON tasks (queue, state, priority DESC, created_at_ms ASC);
            CREATE INDEX IF NOT EXISTS idx_tasks_workflow
                ON tasks (parent_workflow_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_retry
                ON tasks (next_retry_at_ms);
            CREATE INDEX IF NOT EXISTS idx_tasks_scheduled
                ON tasks (scheduled_by);

            CREATE TABLE IF NOT EXISTS task_deps (
                task_id TEXT NOT NULL,
                dep_id TEXT NOT NULL,
                PRIMARY KEY (task_id, dep_id)
            );
            CREATE INDEX IF NOT EXISTS idx_task_deps_dep ON task_deps (dep_id);

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                completed_at_ms INTEGER,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                ts_ms INTEGER NOT NULL,
                correlation_id TEXT,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_correlation
                ON events (correlation_id, ts_ms);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!("sqlite schema initialized");
        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
        let data: String = row.get("data");
        serde_json::from_str(&data).map_err(ser_err)
    }

    async fn update_task_row(&self, task: &Task) -> Result<u64, StoreError> {
        let data = serde_json::to_string(task).map_err(ser_err)?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?1, next_retry_at_ms = ?2, completed_at_ms = ?3, data = ?4
            WHERE id = ?5
            "#,
        )
        .bind(task.state.as_str())
        .bind(task.next_retry_at.map(millis))
        .bind(task.completed_at.map(millis))
        .bind(data)
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn admit(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.tasks_lock.lock().await;

        let data = serde_json::to_string(task).map_err(ser_err)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO tasks
                (id, queue, task_type, state, priority, created_at_ms,
                 next_retry_at_ms, completed_at_ms, correlation_id,
                 parent_workflow_id, scheduled_by, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.queue().as_str())
        .bind(task.task_type())
        .bind(task.state.as_str())
        .bind(task.priority.get() as i64)
        .bind(millis(task.created_at))
        .bind(task.next_retry_at.map(millis))
        .bind(task.completed_at.map(millis))
        .bind(task.correlation_id.to_string())
        .bind(task.parent_workflow_id.map(|w| w.to_string()))
        .bind(task.scheduled_by.clone())
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(task.id));
        }

        for dep in &task.dependencies {
            sqlx::query(
                "INSERT OR IGNORE INTO task_deps (task_id, dep_id) VALUES (?1, ?2)",
            )
            .bind(task.id.to_string())
            .bind(dep.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }

        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT data FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::TaskNotFound(id))?;
        Self::row_to_task(&row)
    }

    async fn contains(&self, id: TaskId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn transition(
        &self,
        id: TaskId,
        from: TaskState,
        to: TaskState,
        patch: TransitionPatch,
    ) -> Result<Task, StoreError> {
        let _guard = self.tasks_lock.lock().await;

        let row = sqlx::query("SELECT data FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::TaskNotFound(id))?;
        let mut task = Self::row_to_task(&row)?;

        if task.state != from {
            return Err(StoreError::StaleState {
                id,
                expected: from,
                actual: task.state,
            });
        }

        task.state = to;
        patch.apply(&mut task);
        self.update_task_row(&task).await?;
        Ok(task)
    }

    async fn load_ready(
        &self,
        queue: QueueName,
        limit: usize,
        now: DateTime<Utc>,
        starvation_threshold: Duration,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM tasks
            WHERE queue = ?1 AND state = 'ready'
            ORDER BY
                MIN(10, priority + MAX(0, (?2 - created_at_ms - ?3) / 60000)) DESC,
                created_at_ms ASC,
                id ASC
            LIMIT ?4
            "#,
        )
        .bind(queue.as_str())
        .bind(millis(now))
        .bind(starvation_threshold.as_millis() as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn due_retries(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM tasks
            WHERE queue = ?1 AND state = 'pending'
              AND next_retry_at_ms IS NOT NULL AND next_retry_at_ms <= ?2
            "#,
        )
        .bind(queue.as_str())
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| Self::row_to_task(row).map(|t| t.id))
            .collect()
    }

    async fn next_retry_at(&self, queue: QueueName) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(next_retry_at_ms) AS next_ms FROM tasks
            WHERE queue = ?1 AND state = 'pending' AND next_retry_at_ms IS NOT NULL
            "#,
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let next_ms: Option<i64> = row.get("next_ms");
        Ok(next_ms.map(from_millis))
    }

    async fn load_dependents(&self, id: TaskId) -> Result<Vec<TaskId>, StoreError> {
        let rows = sqlx::query("SELECT data FROM tasks WHERE id IN (SELECT task_id FROM task_deps WHERE dep_id = ?1)")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| Self::row_to_task(row).map(|t| t.id))
            .collect()
    }

    async fn record_result(
        &self,
        id: TaskId,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        self.transition(
            id,
            TaskState::Running,
            TaskState::Completed,
            TransitionPatch::new()
                .with_completed_at(now)
                .with_result(result)
                .with_next_retry_at(None),
        )
        .await
    }

    async fn list_by_workflow(&self, workflow_id: WorkflowId) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM tasks WHERE parent_workflow_id = ?1 ORDER BY id ASC",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list_non_terminal(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM tasks WHERE state IN ('pending', 'ready', 'running') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn counts_by_state(
        &self,
        queue: QueueName,
    ) -> Result<HashMap<TaskState, u64>, StoreError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM tasks WHERE queue = ?1 GROUP BY state",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut counts = HashMap::new();
        for row in rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            let state = state
                .parse::<TaskState>()
                .map_err(StoreError::Serialization)?;
            counts.insert(state, n as u64);
        }
        Ok(counts)
    }

    async fn oldest_pending_age(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(created_at_ms) AS oldest_ms FROM tasks
            WHERE queue = ?1 AND state IN ('pending', 'ready')
            "#,
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let oldest_ms: Option<i64> = row.get("oldest_ms");
        Ok(oldest_ms.map(|ms| {
            now.signed_duration_since(from_millis(ms))
                .to_std()
                .unwrap_or(Duration::ZERO)
        }))
    }

    async fn retain(
        &self,
        retention: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let _guard = self.tasks_lock.lock().await;

        let completed_cutoff = millis(now) - retention.completed.as_millis() as i64;
        let failed_cutoff = millis(now) - retention.failed.as_millis() as i64;

        let condition = r#"
            (state = 'completed'
                AND COALESCE(completed_at_ms, created_at_ms) < ?1)
            OR (state IN ('failed', 'cancelled', 'expired')
                AND COALESCE(completed_at_ms, created_at_ms) < ?2)
        "#;

        sqlx::query(&format!(
            "DELETE FROM task_deps WHERE task_id IN (SELECT id FROM tasks WHERE {condition})"
        ))
        .bind(completed_cutoff)
        .bind(failed_cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let result = sqlx::query(&format!("DELETE FROM tasks WHERE {condition}"))
            .bind(completed_cutoff)
            .bind(failed_cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let _guard = self.events_lock.lock().await;

        let data = serde_json::to_string(event).map_err(ser_err)?;
        sqlx::query(
            r#"
            INSERT INTO events (id, kind, source, ts_ms, correlation_id, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.kind.as_str())
        .bind(&event.source)
        .bind(millis(event.timestamp))
        .bind(event.correlation_id.map(|c| c.to_string()))
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_events(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM events WHERE correlation_id = ?1 ORDER BY id ASC",
        )
        .bind(correlation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let data: String = row.get("data");
                serde_json::from_str(&data).map_err(ser_err)
            })
            .collect()
    }

    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        let _guard = self.workflows_lock.lock().await;

        let data = serde_json::to_string(record).map_err(ser_err)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflows
                (id, state, correlation_id, created_at_ms, completed_at_ms, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.state.as_str())
        .bind(record.correlation_id.to_string())
        .bind(millis(record.created_at))
        .bind(record.completed_at.map(millis))
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query("SELECT data FROM workflows WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkflowNotFound(id))?;

        let data: String = row.get("data");
        serde_json::from_str(&data).map_err(ser_err)
    }

    async fn update_workflow_state(
        &self,
        id: WorkflowId,
        state: WorkflowState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut record = self.get_workflow(id).await?;
        record.state = state;
        if completed_at.is_some() {
            record.completed_at = completed_at;
        }
        self.put_workflow(&record).await
    }

    async fn list_active_workflows(&self) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT data FROM workflows WHERE state IN ('pending', 'running') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let data: String = row.get("data");
                serde_json::from_str(&data).map_err(ser_err)
            })
            .collect()
    }

    async fn last_scheduled(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            "SELECT MAX(created_at_ms) AS last_ms FROM tasks WHERE scheduled_by = ?1",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let last_ms: Option<i64> = row.get("last_ms");
        Ok(last_ms.map(from_millis))
    }

    async fn has_active_scheduled(&self, name: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM tasks
            WHERE scheduled_by = ?1 AND state IN ('pending', 'ready', 'running')
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tradeloop_contracts::{Priority, TaskPayload};

    async fn store() -> SqliteTaskStore {
        SqliteTaskStore::in_memory().await.expect("in-memory store")
    }

    fn ready_task(symbol: &str, priority: u8) -> Task {
        let mut t = Task::new(TaskPayload::FetchEarnings {
            symbol: symbol.into(),
        })
        .with_priority(Priority::new(priority));
        t.state = TaskState::Ready;
        t
    }

    #[tokio::test]
    async fn test_admit_get_roundtrip() {
        let store = store().await;
        let t = Task::new(TaskPayload::SyncBalances {
            account_id: "acct-1".into(),
        });
        store.admit(&t).await.unwrap();

        let loaded = store.get(t.id).await.unwrap();
        assert_eq!(loaded.id, t.id);
        assert_eq!(loaded.payload, t.payload);
        assert_eq!(loaded.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_admit_duplicate_rejected() {
        let store = store().await;
        let t = Task::new(TaskPayload::SyncBalances {
            account_id: "acct-1".into(),
        });
        store.admit(&t).await.unwrap();
        assert!(matches!(
            store.admit(&t).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_cas_and_patch() {
        let store = store().await;
        let t = ready_task("ACME", 5);
        store.admit(&t).await.unwrap();

        let now = Utc::now();
        let updated = store
            .transition(
                t.id,
                TaskState::Ready,
                TaskState::Running,
                TransitionPatch::new().with_started_at(now),
            )
            .await
            .unwrap();
        assert_eq!(updated.state, TaskState::Running);

        let err = store
            .transition(
                t.id,
                TaskState::Ready,
                TaskState::Running,
                TransitionPatch::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleState { .. }));
    }

    #[tokio::test]
    async fn test_load_ready_priority_and_starvation() {
        let store = store().await;
        let now = Utc::now();

        let mut starved = ready_task("OLD", 2);
        starved.created_at = now - chrono::Duration::minutes(30);
        let fresh = ready_task("NEW", 9);

        store.admit(&starved).await.unwrap();
        store.admit(&fresh).await.unwrap();

        // Without aging the fresh high-priority task wins
        let ready = store
            .load_ready(QueueName::DataFetcher, 10, now, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(ready[0].id, fresh.id);

        // With a 10-minute threshold the starved task has aged to the cap
        let ready = store
            .load_ready(QueueName::DataFetcher, 10, now, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(ready[0].id, starved.id);
    }

    #[tokio::test]
    async fn test_dependents_index() {
        let store = store().await;
        let a = Task::new(TaskPayload::FetchEarnings {
            symbol: "A".into(),
        });
        let b = Task::new(TaskPayload::AnalyzeEarnings {
            symbol: "A".into(),
        })
        .with_dependencies(vec![a.id]);

        store.admit(&a).await.unwrap();
        store.admit(&b).await.unwrap();

        assert_eq!(store.load_dependents(a.id).await.unwrap(), vec![b.id]);
    }

    #[tokio::test]
    async fn test_due_retries() {
        let store = store().await;
        let now = Utc::now();
        let mut t = Task::new(TaskPayload::FetchEarnings {
            symbol: "ACME".into(),
        });
        t.next_retry_at = Some(now - chrono::Duration::seconds(5));
        store.admit(&t).await.unwrap();

        assert_eq!(
            store.due_retries(QueueName::DataFetcher, now).await.unwrap(),
            vec![t.id]
        );
        assert!(store
            .next_retry_at(QueueName::DataFetcher)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_counts_and_oldest_age() {
        let store = store().await;
        let now = Utc::now();
        let mut a = ready_task("A", 5);
        a.created_at = now - chrono::Duration::seconds(90);
        store.admit(&a).await.unwrap();

        let counts = store.counts_by_state(QueueName::DataFetcher).await.unwrap();
        assert_eq!(counts.get(&TaskState::Ready), Some(&1));

        let age = store
            .oldest_pending_age(QueueName::DataFetcher, now)
            .await
            .unwrap()
            .unwrap();
        assert!(age >= Duration::from_secs(89));
    }

    #[tokio::test]
    async fn test_retain() {
        let store = store().await;
        let now = Utc::now();

        let mut old_done = ready_task("A", 5);
        old_done.state = TaskState::Completed;
        old_done.completed_at = Some(now - chrono::Duration::hours(48));
        store.admit(&old_done).await.unwrap();

        let removed = store
            .retain(&RetentionConfig::default(), now)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(old_done.id).await.is_err());
    }

    #[tokio::test]
    async fn test_event_journal() {
        let store = store().await;
        let corr = CorrelationId::generate();
        for _ in 0..3 {
            store
                .append_event(
                    &Event::new(
                        tradeloop_contracts::EventKind::TaskCreated,
                        "test",
                        serde_json::json!({}),
                    )
                    .with_correlation(corr),
                )
                .await
                .unwrap();
        }

        let events = store.load_events(corr).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_workflow_rows() {
        let store = store().await;
        let record = WorkflowRecord::new(
            tradeloop_contracts::WorkflowSpec::sequential(vec![]),
            CorrelationId::generate(),
        );
        store.put_workflow(&record).await.unwrap();

        assert_eq!(store.list_active_workflows().await.unwrap().len(), 1);
        store
            .update_workflow_state(record.id, WorkflowState::Completed, Some(Utc::now()))
            .await
            .unwrap();
        assert!(store.list_active_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_queries() {
        let store = store().await;
        let t = Task::new(TaskPayload::FetchNews {
            symbols: vec!["ACME".into()],
            lookback_hours: 24,
        })
        .with_scheduled_by("news_poll");
        store.admit(&t).await.unwrap();

        assert!(store.has_active_scheduled("news_poll").await.unwrap());
        assert!(store.last_scheduled("news_poll").await.unwrap().is_some());
        assert!(store.last_scheduled("other").await.unwrap().is_none());
    }
}
