#![forbid(unsafe_code)]

//! Client face of the queue: the controlling process uses this API to
//! create jobs, fan out subtasks, wait for completion and collect results.

use kl_core::config::{Config, ConfigError};
use kl_core::model::{JobStatus, TaskOutcome, TaskStatus, VerificationHook};
use kl_storage::{NewTask, SqliteStore, StoreError};
use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum OrchestratorError {
    Store(StoreError),
    Config(ConfigError),
    Io(std::io::Error),
    BoundaryViolation {
        working_dir: String,
        project_root: PathBuf,
    },
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "store: {err}"),
            Self::Config(err) => write!(f, "config: {err}"),
            Self::Io(err) => write!(f, "io: {err}"),
            Self::BoundaryViolation {
                working_dir,
                project_root,
            } => write!(
                f,
                "working_dir '{working_dir}' is outside project root '{}'; \
                 set safety.allow_external_dirs=true to permit it",
                project_root.display()
            ),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<StoreError> for OrchestratorError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ConfigError> for OrchestratorError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Per-subtask options; everything except the prompt has a default.
#[derive(Clone, Debug)]
pub struct SubtaskSpec {
    pub prompt: String,
    pub working_dir: Option<String>,
    pub context_files: Vec<String>,
    pub expected_outputs: Vec<String>,
    pub verification_hooks: Vec<VerificationHook>,
    pub auto_verify: bool,
    pub metadata: Option<serde_json::Value>,
    pub priority: i64,
    pub parent_task_id: Option<i64>,
    pub depends_on: Vec<i64>,
}

impl SubtaskSpec {
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
            parent_task_id: None,
            depends_on: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.depends_on = ids.into_iter().collect();
        self
    }

    pub fn expected_outputs(mut self, outputs: impl IntoIterator<Item = String>) -> Self {
        self.expected_outputs = outputs.into_iter().collect();
        self
    }
}

#[derive(Clone, Debug)]
pub struct JobProgress {
    pub job_id: String,
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub progress_pct: f64,
}

#[derive(Clone, Debug)]
pub struct WaitOptions {
    pub poll: Duration,
    pub timeout: Option<Duration>,
    pub show_progress: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            poll: Duration::from_secs(2),
            timeout: None,
            show_progress: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CollectedTask {
    pub task_id: i64,
    pub prompt: String,
    pub status: TaskStatus,
    pub working_dir: Option<String>,
    pub expected_outputs: Vec<String>,
    pub result: Option<TaskOutcome>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerAvailability {
    /// Live workers were found; count attached.
    Available(i64),
    /// None were live and a coordinator was started.
    Started,
    /// None were live and nothing was started (declined or non-interactive
    /// without the auto-start toggle).
    Skipped,
}

pub struct Orchestrator {
    store: SqliteStore,
    config: Config,
}

impl Orchestrator {
    pub fn open(config: Config) -> Result<Self, OrchestratorError> {
        let store = SqliteStore::open(&config.db_path)?;
        println!("[orchestrator] store: {}", config.db_path.display());
        Ok(Self { store, config })
    }

    /// Resolves configuration from the current directory and opens the
    /// shared store.
    pub fn connect() -> Result<Self, OrchestratorError> {
        Ok(Self::open(Config::load()?)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn create_job(&mut self, description: &str) -> Result<String, OrchestratorError> {
        Ok(self.store.create_job(description)?.job_id)
    }

    /// Adds a subtask, enforcing the project boundary on `working_dir`.
    pub fn add_subtask(
        &mut self,
        job_id: &str,
        spec: SubtaskSpec,
    ) -> Result<i64, OrchestratorError> {
        if let Some(dir) = spec.working_dir.as_deref()
            && self.config.check_working_dir(Path::new(dir)).is_err()
        {
            return Err(OrchestratorError::BoundaryViolation {
                working_dir: dir.to_string(),
                project_root: self.config.project_root.clone(),
            });
        }
        let task = NewTask {
            prompt: spec.prompt,
            working_dir: spec.working_dir,
            context_files: spec.context_files,
            expected_outputs: spec.expected_outputs,
            verification_hooks: spec.verification_hooks,
            auto_verify: spec.auto_verify,
            metadata: spec.metadata,
            priority: spec.priority,
            job_id: Some(job_id.to_string()),
            parent_task_id: spec.parent_task_id,
            depends_on: spec.depends_on,
        };
        Ok(self.store.add_task(task)?)
    }

    /// Creates a batch of children grouped under one parent task. Grouping
    /// is logical only; it never affects scheduling.
    pub fn add_subtasks_under(
        &mut self,
        job_id: &str,
        parent_task_id: i64,
        specs: Vec<SubtaskSpec>,
    ) -> Result<Vec<i64>, OrchestratorError> {
        let mut ids = Vec::with_capacity(specs.len());
        for mut spec in specs {
            spec.parent_task_id = Some(parent_task_id);
            ids.push(self.add_subtask(job_id, spec)?);
        }
        Ok(ids)
    }

    pub fn set_shared_context(
        &mut self,
        key: &str,
        value: &str,
        job_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        Ok(self.store.set_shared_context(key, value, job_id)?)
    }

    pub fn job_status(&mut self, job_id: &str) -> Result<JobProgress, OrchestratorError> {
        let stats = self.store.job_stats(job_id)?;
        let progress_pct = if stats.total > 0 {
            stats.completed as f64 / stats.total as f64 * 100.0
        } else {
            0.0
        };
        Ok(JobProgress {
            job_id: job_id.to_string(),
            total: stats.total,
            pending: stats.pending,
            in_progress: stats.claimed + stats.in_progress,
            completed: stats.completed,
            failed: stats.failed,
            progress_pct,
        })
    }

    /// Polls until every task of the job is terminal (or the wait times
    /// out), then returns results keyed by task id and finalizes the job
    /// row.
    pub fn wait_and_collect(
        &mut self,
        job_id: &str,
        options: &WaitOptions,
    ) -> Result<BTreeMap<i64, CollectedTask>, OrchestratorError> {
        let started = Instant::now();
        loop {
            let progress = self.job_status(job_id)?;
            if options.show_progress {
                println!(
                    "[{}s] {}: {}/{} done ({:.1}%) | in progress: {} | pending: {} | failed: {}",
                    started.elapsed().as_secs(),
                    job_id,
                    progress.completed,
                    progress.total,
                    progress.progress_pct,
                    progress.in_progress,
                    progress.pending,
                    progress.failed
                );
            }
            if progress.pending + progress.in_progress == 0 {
                break;
            }
            if let Some(timeout) = options.timeout
                && started.elapsed() >= timeout
            {
                break;
            }
            std::thread::sleep(options.poll);
        }

        let tasks = self.store.list_tasks(None, Some(job_id))?;
        let _ = self.store.finalize_job(job_id)?;

        let mut results = BTreeMap::new();
        for task in tasks {
            results.insert(
                task.id,
                CollectedTask {
                    task_id: task.id,
                    prompt: task.prompt,
                    status: task.status,
                    working_dir: task.working_dir,
                    expected_outputs: task.expected_outputs,
                    result: task.result,
                    error: task.error,
                },
            );
        }
        Ok(results)
    }

    pub fn completed_tasks(
        &mut self,
        job_id: &str,
    ) -> Result<Vec<kl_storage::TaskRow>, OrchestratorError> {
        Ok(self
            .store
            .list_tasks(Some(TaskStatus::Completed), Some(job_id))?)
    }

    pub fn failed_tasks(
        &mut self,
        job_id: &str,
    ) -> Result<Vec<kl_storage::TaskRow>, OrchestratorError> {
        Ok(self
            .store
            .list_tasks(Some(TaskStatus::Failed), Some(job_id))?)
    }

    /// Resets every failed task of the job back to `pending`. The same task
    /// ids return to the queue; nothing is cloned.
    pub fn retry_failed_tasks(&mut self, job_id: &str) -> Result<Vec<i64>, OrchestratorError> {
        let failed = self.failed_tasks(job_id)?;
        let mut retried = Vec::with_capacity(failed.len());
        for task in failed {
            self.store.reset_task(task.id)?;
            retried.push(task.id);
        }
        Ok(retried)
    }

    pub fn job_final_status(&mut self, job_id: &str) -> Result<JobStatus, OrchestratorError> {
        Ok(self.store.finalize_job(job_id)?)
    }

    /// Checks for live workers before a wait. Interactive sessions get a
    /// prompt; background runs consult `KLAUSS_AUTO_START_WORKERS` and
    /// never block on stdin.
    pub fn ensure_workers_available(&mut self) -> Result<WorkerAvailability, OrchestratorError> {
        let threshold = self
            .config
            .stale_threshold()
            .as_millis()
            .min(i64::MAX as u128) as i64;
        let live = self.store.live_worker_count(threshold)?;
        if live > 0 {
            return Ok(WorkerAvailability::Available(live));
        }

        let interactive = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
        if interactive {
            print!(
                "No live workers found. Start {} workers now? [y/N] ",
                self.config.worker_count
            );
            std::io::stdout().flush()?;
            let mut answer = String::new();
            std::io::stdin().read_line(&mut answer)?;
            if matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
                self.spawn_coordinator()?;
                return Ok(WorkerAvailability::Started);
            }
            return Ok(WorkerAvailability::Skipped);
        }

        match self.config.auto_start_workers {
            Some(true) => {
                self.spawn_coordinator()?;
                Ok(WorkerAvailability::Started)
            }
            _ => {
                eprintln!(
                    "warning: no live workers and {}, tasks will sit pending until a pool starts",
                    "KLAUSS_AUTO_START_WORKERS is not set"
                );
                Ok(WorkerAvailability::Skipped)
            }
        }
    }

    fn spawn_coordinator(&self) -> Result<(), OrchestratorError> {
        let bin = sibling_binary("kl_coordinator");
        std::process::Command::new(bin)
            .arg("--db")
            .arg(&self.config.db_path)
            .arg("--workers")
            .arg(self.config.worker_count.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        Ok(())
    }
}

fn sibling_binary(name: &str) -> String {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join(name);
        if sibling.exists() {
            return sibling.to_string_lossy().to_string();
        }
    }
    name.to_string()
}

/// Pure formatter: turns collected results into a text blob suitable for a
/// synthesis pass through the executor CLI. No state is touched.
pub fn synthesize_results(
    results: &BTreeMap<i64, CollectedTask>,
    synthesis_prompt: Option<&str>,
) -> String {
    let mut out = Vec::new();
    out.push("TASK EXECUTION RESULTS".to_string());
    out.push("======================".to_string());
    out.push(String::new());

    let completed: Vec<&CollectedTask> = results
        .values()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();
    let failed: Vec<&CollectedTask> = results
        .values()
        .filter(|t| t.status == TaskStatus::Failed)
        .collect();

    out.push(format!(
        "Summary: {} completed, {} failed",
        completed.len(),
        failed.len()
    ));
    out.push(String::new());

    if !completed.is_empty() {
        out.push("COMPLETED TASKS".to_string());
        out.push("---------------".to_string());
        for task in &completed {
            out.push(format!("Task {}: {}", task.task_id, task.prompt));
            if let Some(dir) = &task.working_dir {
                out.push(format!("Working dir: {dir}"));
            }
            if let Some(TaskOutcome::Success {
                stdout,
                verification,
                ..
            }) = &task.result
            {
                if !stdout.trim().is_empty() {
                    let preview: String = stdout.chars().take(500).collect();
                    out.push(format!("Output:\n{preview}"));
                }
                if !verification.hooks.is_empty() {
                    out.push(format!(
                        "Verification: {} hooks passed",
                        verification.hooks.len()
                    ));
                }
            }
            out.push(String::new());
        }
    }

    if !failed.is_empty() {
        out.push("FAILED TASKS".to_string());
        out.push("------------".to_string());
        for task in &failed {
            out.push(format!("Task {}: {}", task.task_id, task.prompt));
            out.push(format!(
                "Error: {}",
                task.error.as_deref().unwrap_or("unknown")
            ));
            out.push(String::new());
        }
    }

    if let Some(prompt) = synthesis_prompt {
        out.push("SYNTHESIS REQUEST".to_string());
        out.push("-----------------".to_string());
        out.push(prompt.to_string());
    }

    out.join("\n")
}

#[cfg(test)]
mod tests;
