#![forbid(unsafe_code)]

use super::*;
use rusqlite::params;

const DEFAULT_LOG_LIMIT: usize = 100;
const MAX_LOG_LIMIT: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogRow {
    pub log_id: i64,
    pub worker_id: String,
    pub task_id: Option<i64>,
    pub ts_ms: i64,
    pub level: LogLevel,
    pub message: String,
}

/// Filter for `worker_logs`; unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub worker_id: Option<String>,
    pub task_id: Option<i64>,
    pub limit: Option<usize>,
}

/// One row per registered worker with its current task and latest progress
/// message, for live views.
#[derive(Clone, Debug)]
pub struct ActiveWorkerRow {
    pub worker_id: String,
    pub worker_status: String,
    pub current_task_id: Option<i64>,
    pub task_prompt: Option<String>,
    pub task_status: Option<String>,
    pub recent_log: Option<String>,
}

fn read_log_row(row: &rusqlite::Row<'_>) -> Result<LogRow, rusqlite::Error> {
    Ok(LogRow {
        log_id: row.get(0)?,
        worker_id: row.get(1)?,
        task_id: row.get(2)?,
        ts_ms: row.get(3)?,
        level: LogLevel::parse(&row.get::<_, String>(4)?).unwrap_or(LogLevel::Info),
        message: row.get(5)?,
    })
}

impl SqliteStore {
    /// Appends a progress row so read-only clients can follow activity
    /// without tailing log files.
    pub fn log_progress(
        &mut self,
        worker_id: &str,
        task_id: Option<i64>,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StoreError> {
        let worker_id = worker_id.trim();
        if worker_id.is_empty() {
            return Err(StoreError::InvalidInput("worker_id must not be empty"));
        }
        let message = message.to_string();
        let now = now_ms();
        self.retrying(|conn| {
            conn.execute(
                r#"
                INSERT INTO worker_logs (worker_id, task_id, ts_ms, level, message)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![worker_id, task_id, now, level.as_str(), message],
            )?;
            Ok(())
        })
    }

    /// Progress rows, newest first, bounded by the filter limit.
    pub fn worker_logs(&mut self, filter: &LogFilter) -> Result<Vec<LogRow>, StoreError> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LOG_LIMIT)
            .clamp(1, MAX_LOG_LIMIT) as i64;
        let worker = filter.worker_id.clone();
        let task = filter.task_id;
        self.retrying(|conn| {
            const COLUMNS: &str = "log_id, worker_id, task_id, ts_ms, level, message";
            let mut logs = Vec::new();
            let rows: Vec<Result<LogRow, rusqlite::Error>> = match (worker.as_deref(), task) {
                (Some(w), Some(t)) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM worker_logs WHERE worker_id=?1 AND task_id=?2 ORDER BY ts_ms DESC, log_id DESC LIMIT ?3"
                    ))?;
                    let collected = stmt.query_map(params![w, t, limit], read_log_row)?.collect();
                    collected
                }
                (Some(w), None) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM worker_logs WHERE worker_id=?1 ORDER BY ts_ms DESC, log_id DESC LIMIT ?2"
                    ))?;
                    let collected = stmt.query_map(params![w, limit], read_log_row)?.collect();
                    collected
                }
                (None, Some(t)) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM worker_logs WHERE task_id=?1 ORDER BY ts_ms DESC, log_id DESC LIMIT ?2"
                    ))?;
                    let collected = stmt.query_map(params![t, limit], read_log_row)?.collect();
                    collected
                }
                (None, None) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {COLUMNS} FROM worker_logs ORDER BY ts_ms DESC, log_id DESC LIMIT ?1"
                    ))?;
                    let collected = stmt.query_map(params![limit], read_log_row)?.collect();
                    collected
                }
            };
            for row in rows {
                logs.push(row?);
            }
            Ok(logs)
        })
    }

    pub fn active_progress(&mut self) -> Result<Vec<ActiveWorkerRow>, StoreError> {
        self.retrying(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT
                  w.worker_id,
                  w.status,
                  w.current_task_id,
                  t.prompt,
                  t.status,
                  (
                    SELECT message FROM worker_logs
                    WHERE worker_id = w.worker_id
                    ORDER BY ts_ms DESC, log_id DESC
                    LIMIT 1
                  )
                FROM workers w
                LEFT JOIN tasks t ON t.id = w.current_task_id
                ORDER BY w.worker_id
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ActiveWorkerRow {
                    worker_id: row.get(0)?,
                    worker_status: row.get(1)?,
                    current_task_id: row.get(2)?,
                    task_prompt: row.get(3)?,
                    task_status: row.get(4)?,
                    recent_log: row.get(5)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}
