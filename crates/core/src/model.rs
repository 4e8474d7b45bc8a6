#![forbid(unsafe_code)]

//! Domain model shared across the queue, workers, coordinator and clients.

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOOK_TIMEOUT_S: u64 = 120;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command run after the executor succeeds; its exit code gates task
/// success unless `fail_on_error` is false (advisory hooks such as linters).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationHook {
    pub command: String,
    pub description: String,
    #[serde(default = "default_hook_timeout")]
    pub timeout_s: u64,
    #[serde(default = "default_true")]
    pub fail_on_error: bool,
}

impl VerificationHook {
    pub fn new(command: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: description.into(),
            timeout_s: DEFAULT_HOOK_TIMEOUT_S,
            fail_on_error: true,
        }
    }

    pub fn advisory(mut self) -> Self {
        self.fail_on_error = false;
        self
    }

    pub fn with_timeout_s(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }
}

fn default_hook_timeout() -> u64 {
    DEFAULT_HOOK_TIMEOUT_S
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookOutcome {
    pub hook_description: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub missing_outputs: Vec<String>,
    pub hooks: Vec<HookOutcome>,
}

impl VerificationReport {
    pub fn passed_empty() -> Self {
        Self {
            passed: true,
            missing_outputs: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// One-line summary suitable for a task's `error` column.
    pub fn summary(&self) -> String {
        if self.passed {
            return "verification passed".to_string();
        }
        let mut parts = Vec::new();
        if !self.missing_outputs.is_empty() {
            parts.push(format!(
                "missing outputs: {}",
                self.missing_outputs.join(", ")
            ));
        }
        for hook in self.hooks.iter().filter(|h| !h.passed) {
            match hook.exit_code {
                Some(code) => parts.push(format!("{} (exit {code})", hook.hook_description)),
                None => parts.push(format!(
                    "{} ({})",
                    hook.hook_description,
                    hook.error.as_deref().unwrap_or("no exit status")
                )),
            }
        }
        format!("verification failed: {}", parts.join("; "))
    }
}

/// Terminal result of a task, stored as JSON in the `result` column for
/// completed tasks. Failures go to the `error` column as text; the `Failure`
/// variant exists so collected results round-trip through one type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success {
        stdout: String,
        stderr: String,
        exit_code: i32,
        verification: VerificationReport,
    },
    Failure {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}
