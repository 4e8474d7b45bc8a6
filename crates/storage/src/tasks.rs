#![forbid(unsafe_code)]

use super::*;
use kl_core::model::{TaskOutcome, TaskStatus, VerificationHook};
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params};
use std::collections::{BTreeSet, HashSet};

const MAX_WORKER_ID_LEN: usize = 128;

/// Input surface of `add_task`. Fields beyond the prompt take documented
/// defaults, matching the submission file format.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub prompt: String,
    pub working_dir: Option<String>,
    pub context_files: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub verification_hooks: Vec<VerificationHook>,
    pub auto_verify: bool,
    pub metadata: Option<serde_json::Value>,
    pub priority: i64,
    pub job_id: Option<String>,
    pub parent_task_id: Option<i64>,
    pub depends_on: Vec<i64>,
}

impl NewTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: None,
            context_files: Vec::new(),
            expected_outputs: Vec::new(),
            verification_hooks: Vec::new(),
            auto_verify: true,
            metadata: None,
            priority: 0,
            job_id: None,
            parent_task_id: None,
            depends_on: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskRow {
    pub id: i64,
    pub prompt: String,
    pub working_dir: Option<String>,
    pub context_files: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub verification_hooks: Vec<VerificationHook>,
    pub auto_verify: bool,
    pub metadata: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub job_id: Option<String>,
    pub parent_task_id: Option<i64>,
    pub priority: i64,
    pub depends_on: Vec<i64>,
    pub created_at_ms: i64,
    pub claimed_at_ms: Option<i64>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub result: Option<TaskOutcome>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub claimed: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn active(&self) -> i64 {
        self.pending + self.claimed + self.in_progress
    }

    pub fn terminal(&self) -> i64 {
        self.completed + self.failed
    }
}

fn normalize_worker_id(raw: &str) -> Result<String, StoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StoreError::InvalidInput("worker_id must not be empty"));
    }
    if raw.len() > MAX_WORKER_ID_LEN {
        return Err(StoreError::InvalidInput("worker_id is too long"));
    }
    Ok(raw.to_string())
}

const TASK_COLUMNS: &str = "id, prompt, working_dir, context_files, expected_outputs, \
     verification_hooks, auto_verify, metadata, status, worker_id, job_id, \
     parent_task_id, priority, created_at_ms, claimed_at_ms, started_at_ms, \
     completed_at_ms, result, error";

fn read_task_columns(row: &rusqlite::Row<'_>) -> Result<TaskRow, rusqlite::Error> {
    Ok(TaskRow {
        id: row.get(0)?,
        prompt: row.get(1)?,
        working_dir: row.get(2)?,
        context_files: parse_json_list(row.get::<_, String>(3)?),
        expected_outputs: parse_json_list(row.get::<_, String>(4)?),
        verification_hooks: parse_hooks(row.get::<_, String>(5)?),
        auto_verify: row.get::<_, i64>(6)? != 0,
        metadata: row
            .get::<_, Option<String>>(7)?
            .and_then(|text| serde_json::from_str(&text).ok()),
        status: TaskStatus::parse(&row.get::<_, String>(8)?).unwrap_or(TaskStatus::Pending),
        worker_id: row.get(9)?,
        job_id: row.get(10)?,
        parent_task_id: row.get(11)?,
        priority: row.get(12)?,
        depends_on: Vec::new(),
        created_at_ms: row.get(13)?,
        claimed_at_ms: row.get(14)?,
        started_at_ms: row.get(15)?,
        completed_at_ms: row.get(16)?,
        result: row
            .get::<_, Option<String>>(17)?
            .and_then(|text| serde_json::from_str(&text).ok()),
        error: row.get(18)?,
    })
}

fn parse_json_list(text: String) -> Vec<String> {
    serde_json::from_str(&text).unwrap_or_default()
}

fn parse_hooks(text: String) -> Vec<VerificationHook> {
    serde_json::from_str(&text).unwrap_or_default()
}

fn load_depends_on(conn: &rusqlite::Connection, task_id: i64) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_task_id FROM task_dependencies WHERE task_id=?1 ORDER BY depends_on_task_id",
    )?;
    let rows = stmt.query_map(params![task_id], |row| row.get(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn get_task_inner(conn: &rusqlite::Connection, task_id: i64) -> Result<Option<TaskRow>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id=?1"),
            params![task_id],
            read_task_columns,
        )
        .optional()?;
    let Some(mut task) = row else {
        return Ok(None);
    };
    task.depends_on = load_depends_on(conn, task_id)?;
    Ok(Some(task))
}

fn task_exists(conn: &rusqlite::Connection, task_id: i64) -> Result<bool, StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM tasks WHERE id=?1", params![task_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

/// DFS over the dependency edges starting from `from`; true when `target` is
/// reachable, i.e. adding `target -> from` would close a cycle.
fn reaches(
    conn: &rusqlite::Connection,
    from: i64,
    target: i64,
) -> Result<bool, StoreError> {
    let mut visited = HashSet::new();
    let mut stack = vec![from];
    let mut stmt =
        conn.prepare("SELECT depends_on_task_id FROM task_dependencies WHERE task_id=?1")?;
    while let Some(current) = stack.pop() {
        if current == target {
            return Ok(true);
        }
        if !visited.insert(current) {
            continue;
        }
        let rows = stmt.query_map(params![current], |row| row.get::<_, i64>(0))?;
        for row in rows {
            stack.push(row?);
        }
    }
    Ok(false)
}

/// Resolves why a guarded transition updated zero rows into the precise
/// error. Must run inside the same transaction as the failed update.
fn diagnose_transition(
    tx: &Transaction<'_>,
    task_id: i64,
    worker_id: &str,
    expected: TaskStatus,
    to: &'static str,
) -> StoreError {
    let current: Option<(String, Option<String>)> = tx
        .query_row(
            "SELECT status, worker_id FROM tasks WHERE id=?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .ok()
        .flatten();
    match current {
        None => StoreError::UnknownTask(task_id),
        Some((status, owner)) => {
            if status == expected.as_str() && owner.as_deref() != Some(worker_id) {
                StoreError::NotOwned {
                    task_id,
                    worker_id: worker_id.to_string(),
                }
            } else {
                StoreError::InvalidTransition {
                    task_id,
                    from: status,
                    to,
                }
            }
        }
    }
}

impl SqliteStore {
    /// Validates references, rejects cycles, and inserts the task as
    /// `pending`. Returns the new task id.
    pub fn add_task(&mut self, new: NewTask) -> Result<i64, StoreError> {
        if new.prompt.trim().is_empty() {
            return Err(StoreError::InvalidInput("prompt must not be empty"));
        }
        if new.priority < 0 {
            return Err(StoreError::InvalidInput("priority must be >= 0"));
        }
        let depends_on: BTreeSet<i64> = new.depends_on.iter().copied().collect();
        let now = now_ms();
        self.retrying(|conn| {
            let tx = conn.transaction()?;

            if let Some(job_id) = new.job_id.as_deref() {
                let found: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM jobs WHERE job_id=?1",
                        params![job_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if found.is_none() {
                    return Err(StoreError::UnknownJob(job_id.to_string()));
                }
            }
            if let Some(parent) = new.parent_task_id
                && !task_exists(&tx, parent)?
            {
                return Err(StoreError::UnknownTask(parent));
            }
            for dep in &depends_on {
                if !task_exists(&tx, *dep)? {
                    return Err(StoreError::UnknownTask(*dep));
                }
            }

            tx.execute(
                r#"
                INSERT INTO tasks (
                  prompt, working_dir, context_files, expected_outputs,
                  verification_hooks, auto_verify, metadata, status, job_id,
                  parent_task_id, priority, created_at_ms
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?9, ?10, ?11)
                "#,
                params![
                    new.prompt,
                    new.working_dir,
                    serde_json::to_string(&new.context_files)?,
                    serde_json::to_string(&new.expected_outputs)?,
                    serde_json::to_string(&new.verification_hooks)?,
                    new.auto_verify as i64,
                    new.metadata
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    new.job_id,
                    new.parent_task_id,
                    new.priority,
                    now,
                ],
            )?;
            let task_id = tx.last_insert_rowid();

            for dep in &depends_on {
                // New ids cannot be depended on yet, so the DFS is a no-op
                // here; it guards against future edges added via
                // add_dependency racing this insert.
                if reaches(&tx, *dep, task_id)? {
                    return Err(StoreError::DependencyCycle {
                        task_id,
                        depends_on: *dep,
                    });
                }
                tx.execute(
                    "INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?1, ?2)",
                    params![task_id, dep],
                )?;
            }

            tx.commit()?;
            Ok(task_id)
        })
    }

    /// Adds an execution-order edge after the fact. Rejects edges that close
    /// a cycle; duplicate edges are a no-op.
    pub fn add_dependency(&mut self, task_id: i64, depends_on: i64) -> Result<(), StoreError> {
        if task_id == depends_on {
            return Err(StoreError::DependencyCycle {
                task_id,
                depends_on,
            });
        }
        self.retrying(|conn| {
            let tx = conn.transaction()?;
            if !task_exists(&tx, task_id)? {
                return Err(StoreError::UnknownTask(task_id));
            }
            if !task_exists(&tx, depends_on)? {
                return Err(StoreError::UnknownTask(depends_on));
            }
            if reaches(&tx, depends_on, task_id)? {
                return Err(StoreError::DependencyCycle {
                    task_id,
                    depends_on,
                });
            }
            tx.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id) VALUES (?1, ?2)",
                params![task_id, depends_on],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Atomically claims the best ready task: `pending`, all dependencies
    /// `completed`, highest priority, lowest id within a priority. Returns
    /// `None` when nothing is ready.
    pub fn claim_task(&mut self, worker_id: &str) -> Result<Option<TaskRow>, StoreError> {
        let worker_id = normalize_worker_id(worker_id)?;
        let now = now_ms();
        self.retrying(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let candidate: Option<i64> = tx
                .query_row(
                    r#"
                    SELECT t.id FROM tasks t
                    WHERE t.status = 'pending'
                      AND NOT EXISTS (
                        SELECT 1
                        FROM task_dependencies d
                        JOIN tasks dep ON dep.id = d.depends_on_task_id
                        WHERE d.task_id = t.id AND dep.status <> 'completed'
                      )
                    ORDER BY t.priority DESC, t.id ASC
                    LIMIT 1
                    "#,
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(task_id) = candidate else {
                return Ok(None);
            };

            let changed = tx.execute(
                r#"
                UPDATE tasks
                SET status='claimed', worker_id=?2, claimed_at_ms=?3
                WHERE id=?1 AND status='pending'
                "#,
                params![task_id, worker_id, now],
            )?;
            if changed != 1 {
                // The immediate transaction should make this unreachable;
                // treat it as "queue moved under us" rather than an error.
                return Ok(None);
            }

            tx.execute(
                "UPDATE workers SET current_task_id=?1, status='busy', last_heartbeat_ms=?3 WHERE worker_id=?2",
                params![task_id, worker_id, now],
            )?;

            let Some(task) = get_task_inner(&tx, task_id)? else {
                return Err(StoreError::UnknownTask(task_id));
            };
            tx.commit()?;
            Ok(Some(task))
        })
    }

    /// `claimed` -> `in_progress`; only the owning worker may start a task.
    pub fn start_task(&mut self, task_id: i64, worker_id: &str) -> Result<(), StoreError> {
        let worker_id = normalize_worker_id(worker_id)?;
        let now = now_ms();
        self.retrying(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                r#"
                UPDATE tasks SET status='in_progress', started_at_ms=?3
                WHERE id=?1 AND worker_id=?2 AND status='claimed'
                "#,
                params![task_id, worker_id, now],
            )?;
            if changed != 1 {
                return Err(diagnose_transition(
                    &tx,
                    task_id,
                    &worker_id,
                    TaskStatus::Claimed,
                    "in_progress",
                ));
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// `in_progress` -> `completed`. Clears the worker binding (terminal
    /// tasks are unowned) and stores the structured result.
    pub fn complete_task(
        &mut self,
        task_id: i64,
        worker_id: &str,
        outcome: &TaskOutcome,
    ) -> Result<(), StoreError> {
        let worker_id = normalize_worker_id(worker_id)?;
        let result_json = serde_json::to_string(outcome)?;
        let now = now_ms();
        self.retrying(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                r#"
                UPDATE tasks
                SET status='completed', completed_at_ms=?3, result=?4, error=NULL, worker_id=NULL
                WHERE id=?1 AND worker_id=?2 AND status='in_progress'
                "#,
                params![task_id, worker_id, now, result_json],
            )?;
            if changed != 1 {
                return Err(diagnose_transition(
                    &tx,
                    task_id,
                    &worker_id,
                    TaskStatus::InProgress,
                    "completed",
                ));
            }
            tx.execute(
                "UPDATE workers SET current_task_id=NULL, status='idle' WHERE worker_id=?1",
                params![worker_id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// `in_progress` -> `failed` with a human-readable error.
    pub fn fail_task(
        &mut self,
        task_id: i64,
        worker_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let worker_id = normalize_worker_id(worker_id)?;
        let now = now_ms();
        self.retrying(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                r#"
                UPDATE tasks
                SET status='failed', completed_at_ms=?3, error=?4, result=NULL, worker_id=NULL
                WHERE id=?1 AND worker_id=?2 AND status='in_progress'
                "#,
                params![task_id, worker_id, now, error],
            )?;
            if changed != 1 {
                return Err(diagnose_transition(
                    &tx,
                    task_id,
                    &worker_id,
                    TaskStatus::InProgress,
                    "failed",
                ));
            }
            tx.execute(
                "UPDATE workers SET current_task_id=NULL, status='idle' WHERE worker_id=?1",
                params![worker_id],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// `failed` -> `pending` for a retry. Clears worker binding, timestamps,
    /// result and error so the state machine invariants hold again.
    pub fn reset_task(&mut self, task_id: i64) -> Result<(), StoreError> {
        self.retrying(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                r#"
                UPDATE tasks
                SET status='pending', worker_id=NULL, claimed_at_ms=NULL,
                    started_at_ms=NULL, completed_at_ms=NULL, result=NULL, error=NULL
                WHERE id=?1 AND status='failed'
                "#,
                params![task_id],
            )?;
            if changed != 1 {
                let status: Option<String> = tx
                    .query_row(
                        "SELECT status FROM tasks WHERE id=?1",
                        params![task_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match status {
                    None => StoreError::UnknownTask(task_id),
                    Some(from) => StoreError::InvalidTransition {
                        task_id,
                        from,
                        to: "pending",
                    },
                });
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Returns every task owned by a worker whose heartbeat is older than
    /// `threshold_ms` to `pending` and marks those workers stopped. Returns
    /// the reset task ids.
    pub fn sweep_stale(&mut self, threshold_ms: i64) -> Result<Vec<i64>, StoreError> {
        let cutoff = now_ms().saturating_sub(threshold_ms);
        self.retrying(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut reset = Vec::new();
            {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT t.id
                    FROM tasks t
                    JOIN workers w ON w.worker_id = t.worker_id
                    WHERE t.status IN ('claimed', 'in_progress')
                      AND w.last_heartbeat_ms < ?1
                    ORDER BY t.id
                    "#,
                )?;
                let rows = stmt.query_map(params![cutoff], |row| row.get::<_, i64>(0))?;
                for row in rows {
                    reset.push(row?);
                }
            }

            for task_id in &reset {
                tx.execute(
                    r#"
                    UPDATE tasks
                    SET status='pending', worker_id=NULL, claimed_at_ms=NULL, started_at_ms=NULL
                    WHERE id=?1
                    "#,
                    params![task_id],
                )?;
            }
            tx.execute(
                r#"
                UPDATE workers SET status='stopped', current_task_id=NULL
                WHERE last_heartbeat_ms < ?1 AND status <> 'stopped'
                "#,
                params![cutoff],
            )?;

            tx.commit()?;
            Ok(reset)
        })
    }

    pub fn get_task(&mut self, task_id: i64) -> Result<TaskRow, StoreError> {
        self.retrying(|conn| {
            get_task_inner(conn, task_id)?.ok_or(StoreError::UnknownTask(task_id))
        })
    }

    /// Tasks filtered by status and/or job, in insertion order.
    pub fn list_tasks(
        &mut self,
        status: Option<TaskStatus>,
        job_id: Option<&str>,
    ) -> Result<Vec<TaskRow>, StoreError> {
        self.retrying(|conn| {
            let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
            if status.is_some() {
                sql.push_str(" AND status=?1");
            }
            if job_id.is_some() {
                sql.push_str(if status.is_some() {
                    " AND job_id=?2"
                } else {
                    " AND job_id=?1"
                });
            }
            sql.push_str(" ORDER BY id ASC");

            let mut tasks = Vec::new();
            {
                let mut stmt = conn.prepare(&sql)?;
                let rows: Vec<Result<TaskRow, rusqlite::Error>> = match (status, job_id) {
                    (Some(s), Some(j)) => stmt
                        .query_map(params![s.as_str(), j], read_task_columns)?
                        .collect(),
                    (Some(s), None) => stmt
                        .query_map(params![s.as_str()], read_task_columns)?
                        .collect(),
                    (None, Some(j)) => stmt.query_map(params![j], read_task_columns)?.collect(),
                    (None, None) => stmt.query_map([], read_task_columns)?.collect(),
                };
                for row in rows {
                    tasks.push(row?);
                }
            }
            for task in &mut tasks {
                task.depends_on = load_depends_on(conn, task.id)?;
            }
            Ok(tasks)
        })
    }

    /// Ready tasks in claim order (priority, then FIFO). Observability only;
    /// `claim_task` re-evaluates readiness inside its own transaction.
    pub fn list_ready(&mut self) -> Result<Vec<TaskRow>, StoreError> {
        self.retrying(|conn| {
            let mut stmt = conn.prepare(&format!(
                r#"
                SELECT {TASK_COLUMNS} FROM tasks t
                WHERE t.status = 'pending'
                  AND NOT EXISTS (
                    SELECT 1
                    FROM task_dependencies d
                    JOIN tasks dep ON dep.id = d.depends_on_task_id
                    WHERE d.task_id = t.id AND dep.status <> 'completed'
                  )
                ORDER BY t.priority DESC, t.id ASC
                "#
            ))?;
            let rows = stmt.query_map([], read_task_columns)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row?);
            }
            for task in &mut tasks {
                task.depends_on = load_depends_on(conn, task.id)?;
            }
            Ok(tasks)
        })
    }

    pub fn stats(&mut self) -> Result<QueueStats, StoreError> {
        self.retrying(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut stats = QueueStats::default();
            for row in rows {
                let (status, count) = row?;
                match TaskStatus::parse(&status) {
                    Some(TaskStatus::Pending) => stats.pending = count,
                    Some(TaskStatus::Claimed) => stats.claimed = count,
                    Some(TaskStatus::InProgress) => stats.in_progress = count,
                    Some(TaskStatus::Completed) => stats.completed = count,
                    Some(TaskStatus::Failed) => stats.failed = count,
                    None => {}
                }
            }
            Ok(stats)
        })
    }
}
