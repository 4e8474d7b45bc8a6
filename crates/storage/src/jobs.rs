#![forbid(unsafe_code)]

use super::*;
use kl_core::model::JobStatus;
use rusqlite::{OptionalExtension, params};

const MAX_JOB_DESCRIPTION_LEN: usize = 4096;

#[derive(Clone, Debug)]
pub struct JobRow {
    pub job_id: String,
    pub description: String,
    pub status: JobStatus,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobStats {
    pub total: i64,
    pub pending: i64,
    pub claimed: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
}

impl JobStats {
    pub fn active(&self) -> i64 {
        self.pending + self.claimed + self.in_progress
    }

    /// Job status as defined by the data model: completed once every task is
    /// terminal with no failures, failed when terminal with failures,
    /// running otherwise (including the empty job).
    pub fn derived_status(&self) -> JobStatus {
        if self.total == 0 || self.active() > 0 {
            JobStatus::Running
        } else if self.failed > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow, rusqlite::Error> {
    Ok(JobRow {
        job_id: row.get(0)?,
        description: row.get(1)?,
        status: JobStatus::parse(&row.get::<_, String>(2)?).unwrap_or(JobStatus::Running),
        created_at_ms: row.get(3)?,
        completed_at_ms: row.get(4)?,
    })
}

fn job_exists(conn: &rusqlite::Connection, job_id: &str) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM jobs WHERE job_id=?1",
            params![job_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

impl SqliteStore {
    /// Creates a `running` job with a store-assigned id (`job_000001`, ...).
    pub fn create_job(&mut self, description: &str) -> Result<JobRow, StoreError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(StoreError::InvalidInput("job description must not be empty"));
        }
        if description.len() > MAX_JOB_DESCRIPTION_LEN {
            return Err(StoreError::InvalidInput("job description is too long"));
        }
        let now = now_ms();
        self.retrying(|conn| {
            let tx = conn.transaction()?;
            let seq = next_counter_tx(&tx, "job_seq")?;
            let job_id = format!("job_{seq:06}");
            tx.execute(
                "INSERT INTO jobs (job_id, description, status, created_at_ms) VALUES (?1, ?2, 'running', ?3)",
                params![job_id, description, now],
            )?;
            tx.commit()?;
            Ok(JobRow {
                job_id,
                description: description.to_string(),
                status: JobStatus::Running,
                created_at_ms: now,
                completed_at_ms: None,
            })
        })
    }

    pub fn get_job(&mut self, job_id: &str) -> Result<JobRow, StoreError> {
        self.retrying(|conn| {
            conn.query_row(
                "SELECT job_id, description, status, created_at_ms, completed_at_ms FROM jobs WHERE job_id=?1",
                params![job_id],
                read_job_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))
        })
    }

    pub fn job_stats(&mut self, job_id: &str) -> Result<JobStats, StoreError> {
        self.retrying(|conn| {
            if !job_exists(conn, job_id)? {
                return Err(StoreError::UnknownJob(job_id.to_string()));
            }
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM tasks WHERE job_id=?1 GROUP BY status")?;
            let rows = stmt.query_map(params![job_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut stats = JobStats::default();
            for row in rows {
                let (status, count) = row?;
                stats.total += count;
                match status.as_str() {
                    "pending" => stats.pending = count,
                    "claimed" => stats.claimed = count,
                    "in_progress" => stats.in_progress = count,
                    "completed" => stats.completed = count,
                    "failed" => stats.failed = count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }

    /// Recomputes the job status from its tasks and persists it when the job
    /// has reached a terminal state. Safe to call repeatedly.
    pub fn finalize_job(&mut self, job_id: &str) -> Result<JobStatus, StoreError> {
        let stats = self.job_stats(job_id)?;
        let status = stats.derived_status();
        if status == JobStatus::Running {
            return Ok(status);
        }
        let now = now_ms();
        self.retrying(|conn| {
            conn.execute(
                r#"
                UPDATE jobs
                SET status=?2, completed_at_ms=COALESCE(completed_at_ms, ?3)
                WHERE job_id=?1
                "#,
                params![job_id, status.as_str(), now],
            )?;
            Ok(status)
        })
    }
}
