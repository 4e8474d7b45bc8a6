#![forbid(unsafe_code)]

//! Invocation of the external executor CLI. The contract is minimal: the
//! prompt arrives on stdin, the process runs in the task's working
//! directory, and the exit code decides success.

use crate::proc::{WaitOutcome, read_capture, spawn_captured, wait_with_deadline};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

const CAPTURE_MAX_CHARS: usize = 200_000;

pub(crate) struct ExecRequest<'a> {
    pub bin: &'a str,
    pub args: &'a [String],
    pub prompt: &'a str,
    pub working_dir: Option<&'a Path>,
    pub timeout: Duration,
    pub grace: Duration,
    pub capture_dir: &'a Path,
    pub capture_tag: String,
    pub shutdown: &'a AtomicBool,
}

#[derive(Debug)]
pub(crate) struct ExecOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub aborted: bool,
    pub duration: Duration,
}

impl ExecOutcome {
    pub(crate) fn succeeded(&self) -> bool {
        !self.timed_out && !self.aborted && self.exit_code == Some(0)
    }
}

#[derive(Debug)]
pub(crate) enum ExecError {
    /// The executor binary could not be spawned at all. `missing` marks the
    /// not-found case, which is a fatal configuration problem for the
    /// worker process rather than a per-task failure.
    Spawn {
        bin: String,
        missing: bool,
        source: std::io::Error,
    },
    Io(std::io::Error),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { bin, source, .. } => {
                write!(f, "failed to spawn executor `{bin}`: {source}")
            }
            Self::Io(err) => write!(f, "executor io: {err}"),
        }
    }
}

impl std::error::Error for ExecError {}

pub(crate) fn run_executor(req: &ExecRequest<'_>) -> Result<ExecOutcome, ExecError> {
    let stdout_path: PathBuf = req.capture_dir.join(format!("{}.out", req.capture_tag));
    let stderr_path: PathBuf = req.capture_dir.join(format!("{}.err", req.capture_tag));

    let mut cmd = Command::new(req.bin);
    cmd.args(req.args);
    if let Some(dir) = req.working_dir {
        cmd.current_dir(dir);
    }

    let started = Instant::now();
    let mut child = spawn_captured(cmd, &stdout_path, &stderr_path, Some(req.prompt)).map_err(
        |source| ExecError::Spawn {
            bin: req.bin.to_string(),
            missing: source.kind() == std::io::ErrorKind::NotFound,
            source,
        },
    )?;

    let outcome = wait_with_deadline(&mut child, req.timeout, req.grace, Some(req.shutdown));
    let duration = started.elapsed();
    let stdout = read_capture(&stdout_path, CAPTURE_MAX_CHARS);
    let stderr = read_capture(&stderr_path, CAPTURE_MAX_CHARS);

    Ok(match outcome {
        WaitOutcome::Exited(status) => ExecOutcome {
            exit_code: status.code(),
            stdout,
            stderr,
            timed_out: false,
            aborted: false,
            duration,
        },
        WaitOutcome::TimedOut => ExecOutcome {
            exit_code: None,
            stdout,
            stderr,
            timed_out: true,
            aborted: false,
            duration,
        },
        WaitOutcome::Aborted => ExecOutcome {
            exit_code: None,
            stdout,
            stderr,
            timed_out: false,
            aborted: true,
            duration,
        },
    })
}

/// Tail of the stderr capture for failure messages, flattened to one line.
pub(crate) fn stderr_snippet(stderr: &str, max_chars: usize) -> String {
    let flat: String = stderr
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    let flat = flat.trim();
    if flat.is_empty() {
        return "-".to_string();
    }
    let total = flat.chars().count();
    if total <= max_chars {
        return flat.to_string();
    }
    flat.chars().skip(total - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp(prefix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "{prefix}_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[cfg(unix)]
    fn write_shim(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write shim");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[test]
    fn prompt_reaches_the_executor_via_stdin() {
        let dir = tmp("kl_exec_stdin");
        let seen = dir.join("seen_prompt.txt");
        let shim = write_shim(&dir, "executor.sh", &format!("cat - > \"{}\"", seen.display()));

        let shutdown = AtomicBool::new(false);
        let req = ExecRequest {
            bin: shim.to_str().expect("utf8 path"),
            args: &[],
            prompt: "hello from stdin",
            working_dir: Some(&dir),
            timeout: Duration::from_secs(10),
            grace: Duration::from_secs(1),
            capture_dir: &dir,
            capture_tag: "t1".to_string(),
            shutdown: &shutdown,
        };
        let outcome = run_executor(&req).expect("run");
        assert!(outcome.succeeded());
        assert_eq!(
            std::fs::read_to_string(&seen).expect("read seen"),
            "hello from stdin"
        );
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_reported_with_captures() {
        let dir = tmp("kl_exec_fail");
        let shim = write_shim(&dir, "executor.sh", "echo broken 1>&2; exit 7");

        let shutdown = AtomicBool::new(false);
        let req = ExecRequest {
            bin: shim.to_str().expect("utf8 path"),
            args: &[],
            prompt: "",
            working_dir: Some(&dir),
            timeout: Duration::from_secs(10),
            grace: Duration::from_secs(1),
            capture_dir: &dir,
            capture_tag: "t2".to_string(),
            shutdown: &shutdown,
        };
        let outcome = run_executor(&req).expect("run");
        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code, Some(7));
        assert_eq!(outcome.stderr.trim(), "broken");
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let dir = tmp("kl_exec_missing");
        let shutdown = AtomicBool::new(false);
        let req = ExecRequest {
            bin: "kl-definitely-not-a-real-binary",
            args: &[],
            prompt: "",
            working_dir: None,
            timeout: Duration::from_secs(1),
            grace: Duration::from_secs(1),
            capture_dir: &dir,
            capture_tag: "t3".to_string(),
            shutdown: &shutdown,
        };
        match run_executor(&req) {
            Err(ExecError::Spawn { missing, .. }) => assert!(missing),
            other => panic!("expected spawn error, got {other:?}"),
        }
    }

    #[test]
    fn stderr_snippet_flattens_and_bounds() {
        assert_eq!(stderr_snippet("", 10), "-");
        assert_eq!(stderr_snippet("a\nb\r\nc", 10), "a b  c");
        let long = "x".repeat(50) + "TAIL";
        assert_eq!(stderr_snippet(&long, 4), "TAIL");
    }
}
