//! SQLite persistence for tasks and their logs.
//!
//! The store is the audit/UI record of the pipeline: the webhook handler
//! creates a `pending` row, the executor drives it through `running` to a
//! terminal status, and every observable step appends a log line. The
//! queue itself is memory-only; this store is what survives restarts.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema
//! versions. When the schema changes, increment `SCHEMA_VERSION` and add a
//! migration function in `run_migrations`.
//!
//! # Concurrency
//!
//! A single `Mutex<Connection>` serializes all access; the embedded
//! store has one writer anyway, and a single connection avoids SQLITE_BUSY
//! contention. `TaskStore` wraps the blocking core in
//! `tokio::task::spawn_blocking` for async callers.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => anyhow::bail!("unknown task status {:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
    Success,
    Hint,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
            LogLevel::Hint => "hint",
        }
    }

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(LogLevel::Info),
            "error" => Ok(LogLevel::Error),
            "success" => Ok(LogLevel::Success),
            "hint" => Ok(LogLevel::Hint),
            other => anyhow::bail!("unknown log level {:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A task row as stored, mirroring the in-flight `Task` for audit/UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredTask {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub repo_owner: String,
    pub repo_name: String,
    pub issue_number: u64,
    pub actor: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Time-ordered, append-only. Empty in `list()` results.
    pub logs: Vec<LogEntry>,
}

impl StoredTask {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        repo_owner: impl Into<String>,
        repo_name: impl Into<String>,
        issue_number: u64,
        actor: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Pending,
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            issue_number,
            actor: actor.into(),
            created_at: now,
            updated_at: now,
            logs: Vec::new(),
        }
    }
}

/// Blocking SQLite core. See module docs for the locking model.
pub struct TaskDb {
    conn: Mutex<Connection>,
}

impl TaskDb {
    /// Open or create the database file at the given path.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {:?}", path))?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            anyhow::bail!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                current_version,
                SCHEMA_VERSION
            );
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(&conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
        if from_version < 1 {
            Self::migrate_v0_to_v1(conn)?;
        }
        Ok(())
    }

    fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id           TEXT PRIMARY KEY,
                title        TEXT NOT NULL,
                status       TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed')),
                repo_owner   TEXT NOT NULL,
                repo_name    TEXT NOT NULL,
                issue_number INTEGER NOT NULL,
                actor        TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS logs (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id   TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                level     TEXT NOT NULL CHECK(level IN ('info','error','success','hint')),
                message   TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_logs_task_id ON logs(task_id);
            "#,
        )
        .context("Failed to create initial schema (v0 -> v1)")?;

        Ok(())
    }

    /// Insert a task row and any pre-seeded logs in one transaction.
    pub fn create(&self, task: &StoredTask) -> Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin transaction")?;

        tx.execute(
            r#"
            INSERT INTO tasks (id, title, status, repo_owner, repo_name, issue_number, actor, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                task.id,
                task.title,
                task.status.as_str(),
                task.repo_owner,
                task.repo_name,
                task.issue_number as i64,
                task.actor,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to insert task {}", task.id))?;

        for entry in &task.logs {
            tx.execute(
                "INSERT INTO logs (task_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
                params![
                    task.id,
                    entry.timestamp.to_rfc3339(),
                    entry.level.as_str(),
                    entry.message,
                ],
            )
            .with_context(|| format!("Failed to insert log for task {}", task.id))?;
        }

        tx.commit().context("Failed to commit task creation")
    }

    /// Fetch a task with its logs hydrated, oldest first.
    pub fn get(&self, id: &str) -> Result<Option<StoredTask>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let row = conn
            .query_row(
                r#"
                SELECT id, title, status, repo_owner, repo_name, issue_number, actor, created_at, updated_at
                FROM tasks WHERE id = ?1
                "#,
                params![id],
                Self::task_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to query task {}", id))?;

        let Some(mut task) = row.transpose()? else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT timestamp, level, message FROM logs WHERE task_id = ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let logs = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to load logs for task {}", id))?;

        for (timestamp, level, message) in logs {
            task.logs.push(LogEntry {
                timestamp: parse_timestamp(&timestamp)?,
                level: LogLevel::from_str(&level)?,
                message,
            });
        }

        Ok(Some(task))
    }

    /// All tasks, newest first. Logs are NOT hydrated; call `get` for
    /// details (N+1 avoidance for the dashboard list).
    pub fn list(&self) -> Result<Vec<StoredTask>> {
        let conn = self.conn.lock().expect("mutex poisoned");

        let mut stmt = conn.prepare(
            r#"
            SELECT id, title, status, repo_owner, repo_name, issue_number, actor, created_at, updated_at
            FROM tasks ORDER BY created_at DESC
            "#,
        )?;

        let tasks = stmt
            .query_map([], Self::task_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list tasks")?
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        Ok(tasks)
    }

    /// Move the task to `status`, bumping `updated_at`.
    pub fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");

        conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )
        .with_context(|| format!("Failed to update status for task {}", id))?;

        Ok(())
    }

    /// Append a log line and bump `updated_at`, atomically.
    pub fn add_log(&self, id: &str, level: LogLevel, message: &str) -> Result<()> {
        let mut conn = self.conn.lock().expect("mutex poisoned");
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO logs (task_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![id, now, level.as_str(), message],
        )
        .with_context(|| format!("Failed to insert log for task {}", id))?;

        tx.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )
        .with_context(|| format!("Failed to bump updated_at for task {}", id))?;

        tx.commit().context("Failed to commit log append")
    }

    fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<StoredTask>> {
        let status: String = row.get(2)?;
        let created_at: String = row.get(7)?;
        let updated_at: String = row.get(8)?;
        let issue_number: i64 = row.get(5)?;

        let id: String = row.get(0)?;
        let title: String = row.get(1)?;
        let repo_owner: String = row.get(3)?;
        let repo_name: String = row.get(4)?;
        let actor: String = row.get(6)?;

        Ok((|| {
            Ok(StoredTask {
                id,
                title,
                status: TaskStatus::from_str(&status)?,
                repo_owner,
                repo_name,
                issue_number: issue_number as u64,
                actor,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
                logs: Vec::new(),
            })
        })())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse stored timestamp {:?}", raw))
}

/// Async wrapper routing every call through `spawn_blocking`, so the
/// webhook handler and workers never block the runtime on SQLite I/O.
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<TaskDb>,
}

impl TaskStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
        }

        let path = path.to_path_buf();
        let db = tokio::task::spawn_blocking(move || TaskDb::new(&path))
            .await
            .context("spawn_blocking panicked")??;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(TaskDb::new_in_memory()?),
        })
    }

    pub async fn create(&self, task: StoredTask) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.create(&task))
            .await
            .context("spawn_blocking panicked")?
    }

    pub async fn get(&self, id: &str) -> Result<Option<StoredTask>> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || db.get(&id))
            .await
            .context("spawn_blocking panicked")?
    }

    pub async fn list(&self) -> Result<Vec<StoredTask>> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.list())
            .await
            .context("spawn_blocking panicked")?
    }

    pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let db = self.db.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || db.update_status(&id, status))
            .await
            .context("spawn_blocking panicked")?
    }

    pub async fn add_log(&self, id: &str, level: LogLevel, message: &str) -> Result<()> {
        let db = self.db.clone();
        let id = id.to_string();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || db.add_log(&id, level, &message))
            .await
            .context("spawn_blocking panicked")?
    }
}
