//! Durable task queue backed by SQLite
//!
//! `add` returns once the task row is committed. Delivery happens out of
//! band in the [`Deliverer`](super::Deliverer), which leases due tasks,
//! posts them and then completes, reschedules or buries each one.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use super::{Queue, QueueError, QueueInfo};
use crate::error::Cause;
use crate::pipeline::RequestRecord;

/// Lifecycle of a task row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Ready,
    Buried,
}

impl TaskState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Buried => "buried",
        }
    }
}

/// A task handed to the deliverer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedTask {
    pub name: String,
    pub queue: String,
    pub handler_url: String,
    pub body: String,
    pub attempts: u32,
}

/// Per-queue task counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub target_service: String,
    pub ready: u64,
    pub buried: u64,
}

/// Synchronous task table. Times are unix milliseconds.
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open queue database: {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS queues (
                name TEXT PRIMARY KEY,
                target_service TEXT NOT NULL,
                handler_url TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL REFERENCES queues(name),
                handler_url TEXT NOT NULL,
                body TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'ready',
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                leased_until INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON tasks(state, next_attempt_at);
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Register or refresh a queue
    pub fn upsert_queue(&self, info: &QueueInfo, now: i64) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO queues (name, target_service, handler_url, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                target_service = excluded.target_service,
                handler_url = excluded.handler_url
            "#,
            params![info.name, info.target_service, info.handler_url, now],
        )?;
        Ok(())
    }

    pub fn queue_exists(&self, name: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM queues WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a task. Returns false when a task with this name already exists.
    pub fn insert_task(
        &self,
        name: &str,
        info: &QueueInfo,
        body: &str,
        now: i64,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            r#"
            INSERT INTO tasks (name, queue, handler_url, body, next_attempt_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(name) DO NOTHING
            "#,
            params![name, info.name, info.handler_url, body, now],
        )?;
        Ok(inserted == 1)
    }

    /// Lease up to `limit` due tasks in FIFO order
    pub fn lease_due(&mut self, now: i64, limit: usize, lease: Duration) -> Result<Vec<LeasedTask>> {
        let lease_until = now + lease.as_millis() as i64;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let tasks = {
            let mut stmt = tx.prepare(
                r#"
                SELECT name, queue, handler_url, body, attempts FROM tasks
                WHERE state = 'ready'
                  AND next_attempt_at <= ?1
                  AND (leased_until IS NULL OR leased_until <= ?1)
                ORDER BY next_attempt_at, seq
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![now, limit as i64], |row| {
                Ok(LeasedTask {
                    name: row.get(0)?,
                    queue: row.get(1)?,
                    handler_url: row.get(2)?,
                    body: row.get(3)?,
                    attempts: row.get(4)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for task in &tasks {
            tx.execute(
                "UPDATE tasks SET leased_until = ?1 WHERE name = ?2",
                params![lease_until, task.name],
            )?;
        }
        tx.commit()?;

        Ok(tasks)
    }

    /// Delivered; drop the task
    pub fn complete(&self, name: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM tasks WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// Failed with a retryable outcome
    pub fn reschedule(&self, name: &str, attempts: u32, next_at: i64, error: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE tasks
            SET attempts = ?2, next_attempt_at = ?3, leased_until = NULL, last_error = ?4
            WHERE name = ?1
            "#,
            params![name, attempts, next_at, error],
        )?;
        Ok(())
    }

    /// Failed permanently; keep the row for inspection
    pub fn bury(&self, name: &str, attempts: u32, error: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE tasks
            SET state = ?2, attempts = ?3, leased_until = NULL, last_error = ?4
            WHERE name = ?1
            "#,
            params![name, TaskState::Buried.as_str(), attempts, error],
        )?;
        Ok(())
    }

    pub fn task_state(&self, name: &str) -> Result<Option<(TaskState, u32)>> {
        let row: Option<(String, u32)> = self
            .conn
            .query_row(
                "SELECT state, attempts FROM tasks WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(state, attempts)| {
            let state = if state == TaskState::Buried.as_str() {
                TaskState::Buried
            } else {
                TaskState::Ready
            };
            (state, attempts)
        }))
    }

    pub fn stats(&self) -> Result<Vec<QueueStats>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT q.name, q.target_service,
                   COALESCE(SUM(CASE WHEN t.state = 'ready' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN t.state = 'buried' THEN 1 ELSE 0 END), 0)
            FROM queues q
            LEFT JOIN tasks t ON t.queue = q.name
            GROUP BY q.name, q.target_service
            ORDER BY q.name
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(QueueStats {
                queue: row.get(0)?,
                target_service: row.get(1)?,
                ready: row.get::<_, i64>(2)? as u64,
                buried: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Shareable handle to the task table
#[derive(Clone)]
pub struct DurableQueue {
    store: Arc<Mutex<TaskStore>>,
}

impl DurableQueue {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_store(TaskStore::open(path)?))
    }

    pub fn open_memory() -> Result<Self> {
        Ok(Self::from_store(TaskStore::open_memory()?))
    }

    fn from_store(store: TaskStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Run a blocking operation against the task table
    pub(crate) async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TaskStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|_| anyhow::anyhow!("queue database lock poisoned"))?;
            op(&mut *guard)
        })
        .await
        .context("queue database task panicked")?
    }

    pub async fn stats(&self) -> Result<Vec<QueueStats>> {
        self.with_store(|store| store.stats()).await
    }

    pub async fn task_state(&self, name: &str) -> Result<Option<(TaskState, u32)>> {
        let name = name.to_string();
        self.with_store(move |store| store.task_state(&name)).await
    }
}

fn cause(err: anyhow::Error) -> Cause {
    err.into()
}

#[async_trait]
impl Queue for DurableQueue {
    fn backend_name(&self) -> &'static str {
        "durable"
    }

    async fn create(&self, info: &QueueInfo) -> Result<(), QueueError> {
        let queue = info.clone();
        self.with_store(move |store| store.upsert_queue(&queue, now_millis()))
            .await
            .map_err(|e| QueueError::Create {
                queue: info.name.clone(),
                cause: cause(e),
            })
    }

    async fn connect(&self, info: &QueueInfo) -> Result<(), QueueError> {
        let name = info.name.clone();
        let exists = self
            .with_store(move |store| store.queue_exists(&name))
            .await
            .map_err(|e| QueueError::Connect {
                queue: info.name.clone(),
                cause: cause(e),
            })?;

        if exists {
            Ok(())
        } else {
            Err(QueueError::Connect {
                queue: info.name.clone(),
                cause: "queue has not been created".into(),
            })
        }
    }

    async fn add(&self, info: &QueueInfo, record: &RequestRecord) -> Result<String, QueueError> {
        let task = info.task_name(record);
        let add_error = |cause: Cause| QueueError::Add {
            queue: info.name.clone(),
            task: task.clone(),
            cause,
        };

        let body = serde_json::to_string(record).map_err(|e| add_error(Box::new(e)))?;

        let queue = info.clone();
        let name = task.clone();
        let inserted = self
            .with_store(move |store| {
                store.upsert_queue(&queue, now_millis())?;
                store.insert_task(&name, &queue, &body, now_millis())
            })
            .await
            .map_err(|e| add_error(cause(e)))?;

        if inserted {
            tracing::debug!(queue = %info.name, task = %task, "Task enqueued");
        } else {
            tracing::debug!(queue = %info.name, task = %task, "Task already queued");
        }
        Ok(task)
    }
}
