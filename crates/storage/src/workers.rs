#![forbid(unsafe_code)]

use super::*;
use kl_core::model::WorkerStatus;
use rusqlite::params;

#[derive(Clone, Debug)]
pub struct WorkerRow {
    pub worker_id: String,
    pub pid: u32,
    pub status: WorkerStatus,
    pub current_task_id: Option<i64>,
    pub started_at_ms: i64,
    pub last_heartbeat_ms: i64,
}

fn read_worker_row(row: &rusqlite::Row<'_>) -> Result<WorkerRow, rusqlite::Error> {
    Ok(WorkerRow {
        worker_id: row.get(0)?,
        pid: row.get::<_, i64>(1)?.max(0) as u32,
        status: WorkerStatus::parse(&row.get::<_, String>(2)?).unwrap_or(WorkerStatus::Stopped),
        current_task_id: row.get(3)?,
        started_at_ms: row.get(4)?,
        last_heartbeat_ms: row.get(5)?,
    })
}

impl SqliteStore {
    /// Registers a worker (or a new incarnation of an existing id). The row
    /// starts `idle` with a fresh heartbeat.
    pub fn register_worker(&mut self, worker_id: &str, pid: u32) -> Result<(), StoreError> {
        let worker_id = worker_id.trim();
        if worker_id.is_empty() {
            return Err(StoreError::InvalidInput("worker_id must not be empty"));
        }
        let now = now_ms();
        self.retrying(|conn| {
            conn.execute(
                r#"
                INSERT INTO workers (worker_id, pid, status, current_task_id, started_at_ms, last_heartbeat_ms)
                VALUES (?1, ?2, 'idle', NULL, ?3, ?3)
                ON CONFLICT(worker_id) DO UPDATE SET
                  pid=excluded.pid,
                  status='idle',
                  current_task_id=NULL,
                  started_at_ms=excluded.started_at_ms,
                  last_heartbeat_ms=excluded.last_heartbeat_ms
                "#,
                params![worker_id, pid as i64, now],
            )?;
            Ok(())
        })
    }

    pub fn heartbeat(
        &mut self,
        worker_id: &str,
        status: WorkerStatus,
        current_task_id: Option<i64>,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        self.retrying(|conn| {
            let changed = conn.execute(
                r#"
                UPDATE workers
                SET last_heartbeat_ms=?2, status=?3, current_task_id=?4
                WHERE worker_id=?1
                "#,
                params![worker_id, now, status.as_str(), current_task_id],
            )?;
            if changed != 1 {
                return Err(StoreError::UnknownWorker(worker_id.to_string()));
            }
            Ok(())
        })
    }

    pub fn mark_worker_stopped(&mut self, worker_id: &str) -> Result<(), StoreError> {
        self.retrying(|conn| {
            conn.execute(
                "UPDATE workers SET status='stopped', current_task_id=NULL WHERE worker_id=?1",
                params![worker_id],
            )?;
            Ok(())
        })
    }

    pub fn list_workers(&mut self) -> Result<Vec<WorkerRow>, StoreError> {
        self.retrying(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT worker_id, pid, status, current_task_id, started_at_ms, last_heartbeat_ms
                FROM workers
                ORDER BY worker_id
                "#,
            )?;
            let rows = stmt.query_map([], read_worker_row)?;
            let mut workers = Vec::new();
            for row in rows {
                workers.push(row?);
            }
            Ok(workers)
        })
    }

    /// Workers considered alive: not stopped and heartbeat within
    /// `threshold_ms` of now.
    pub fn live_worker_count(&mut self, threshold_ms: i64) -> Result<i64, StoreError> {
        let cutoff = now_ms().saturating_sub(threshold_ms);
        self.retrying(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM workers WHERE status <> 'stopped' AND last_heartbeat_ms >= ?1",
                params![cutoff],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }
}
