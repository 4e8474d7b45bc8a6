#![forbid(unsafe_code)]

//! Durable task queue backed by a single SQLite file.
//!
//! Every participant on the host opens the same store; all mutations run in
//! short transactions so the claim primitive stays atomic across processes.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod context;
mod jobs;
mod logs;
mod tasks;
mod workers;

#[cfg(test)]
mod tests;

pub use jobs::{JobRow, JobStats};
pub use logs::{ActiveWorkerRow, LogFilter, LogLevel, LogRow};
pub use tasks::{NewTask, QueueStats, TaskRow};
pub use workers::WorkerRow;

const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(2);
const RETRY_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    Json(serde_json::Error),
    InvalidInput(&'static str),
    UnknownTask(i64),
    UnknownJob(String),
    UnknownWorker(String),
    DependencyCycle { task_id: i64, depends_on: i64 },
    NotOwned { task_id: i64, worker_id: String },
    InvalidTransition { task_id: i64, from: String, to: &'static str },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::Json(err) => write!(f, "json: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::UnknownTask(id) => write!(f, "unknown task {id}"),
            Self::UnknownJob(id) => write!(f, "unknown job {id}"),
            Self::UnknownWorker(id) => write!(f, "unknown worker {id}"),
            Self::DependencyCycle {
                task_id,
                depends_on,
            } => write!(
                f,
                "dependency cycle: task {task_id} -> {depends_on} closes a loop"
            ),
            Self::NotOwned { task_id, worker_id } => {
                write!(f, "task {task_id} is not owned by worker {worker_id}")
            }
            Self::InvalidTransition { task_id, from, to } => {
                write!(f, "task {task_id}: invalid transition {from} -> {to}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
    conn: Connection,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        let store = Self { db_path, conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS tasks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              prompt TEXT NOT NULL,
              working_dir TEXT,
              context_files TEXT NOT NULL DEFAULT '[]',
              expected_outputs TEXT NOT NULL DEFAULT '[]',
              verification_hooks TEXT NOT NULL DEFAULT '[]',
              auto_verify INTEGER NOT NULL DEFAULT 1,
              metadata TEXT,
              status TEXT NOT NULL DEFAULT 'pending',
              worker_id TEXT,
              job_id TEXT,
              parent_task_id INTEGER,
              priority INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL,
              claimed_at_ms INTEGER,
              started_at_ms INTEGER,
              completed_at_ms INTEGER,
              result TEXT,
              error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_ready
              ON tasks(status, priority DESC, id);
            CREATE INDEX IF NOT EXISTS idx_tasks_job
              ON tasks(job_id, status);

            CREATE TABLE IF NOT EXISTS task_dependencies (
              task_id INTEGER NOT NULL,
              depends_on_task_id INTEGER NOT NULL,
              PRIMARY KEY (task_id, depends_on_task_id)
            );
            CREATE INDEX IF NOT EXISTS idx_task_dependencies_on
              ON task_dependencies(depends_on_task_id);

            CREATE TABLE IF NOT EXISTS jobs (
              job_id TEXT PRIMARY KEY,
              description TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'running',
              created_at_ms INTEGER NOT NULL,
              completed_at_ms INTEGER
            );

            CREATE TABLE IF NOT EXISTS workers (
              worker_id TEXT PRIMARY KEY,
              pid INTEGER NOT NULL,
              status TEXT NOT NULL,
              current_task_id INTEGER,
              started_at_ms INTEGER NOT NULL,
              last_heartbeat_ms INTEGER NOT NULL
            );

            -- Global scope uses job_id='' so the uniqueness constraint and
            -- upsert conflict target behave the same for both scopes.
            CREATE TABLE IF NOT EXISTS shared_context (
              job_id TEXT NOT NULL DEFAULT '',
              key TEXT NOT NULL,
              value TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              PRIMARY KEY (job_id, key)
            );

            CREATE TABLE IF NOT EXISTS worker_logs (
              log_id INTEGER PRIMARY KEY AUTOINCREMENT,
              worker_id TEXT NOT NULL,
              task_id INTEGER,
              ts_ms INTEGER NOT NULL,
              level TEXT NOT NULL DEFAULT 'info',
              message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_worker_logs_worker
              ON worker_logs(worker_id, ts_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_worker_logs_task
              ON worker_logs(task_id, ts_ms);

            CREATE TABLE IF NOT EXISTS counters (
              name TEXT PRIMARY KEY,
              value INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Runs `op`, retrying on SQLITE_BUSY / SQLITE_LOCKED with exponential
    /// backoff (base 50 ms, cap 2 s, 5 attempts). Contention between
    /// processes is expected; everything else surfaces immediately.
    fn retrying<T>(
        &mut self,
        mut op: impl FnMut(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut delay = RETRY_BASE;
        let mut attempt: u32 = 1;
        loop {
            match op(&mut self.conn) {
                Err(StoreError::Sql(err)) if is_busy(&err) && attempt < RETRY_MAX_ATTEMPTS => {
                    attempt += 1;
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(RETRY_CAP);
                }
                other => return other,
            }
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(i64::MAX as u128) as i64
}

pub(crate) fn next_counter_tx(
    tx: &rusqlite::Transaction<'_>,
    name: &str,
) -> Result<i64, StoreError> {
    tx.execute(
        r#"
        INSERT INTO counters(name, value) VALUES (?1, 1)
        ON CONFLICT(name) DO UPDATE SET value = value + 1
        "#,
        rusqlite::params![name],
    )?;
    let value: i64 = tx.query_row(
        "SELECT value FROM counters WHERE name=?1",
        rusqlite::params![name],
        |row| row.get(0),
    )?;
    Ok(value)
}
