#![forbid(unsafe_code)]

//! Child process plumbing shared by the executor and the verification
//! hooks: capture-to-file spawning and deadline-bounded waits.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const WAIT_POLL: Duration = Duration::from_millis(100);

/// Output is redirected to files rather than pipes so a chatty child can
/// never fill a pipe buffer and deadlock the wait loop.
pub(crate) fn spawn_captured(
    mut cmd: Command,
    stdout_path: &Path,
    stderr_path: &Path,
    stdin_text: Option<&str>,
) -> Result<Child, std::io::Error> {
    let stdout_file = File::create(stdout_path)?;
    let stderr_file = File::create(stderr_path)?;
    cmd.stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file));
    cmd.stdin(if stdin_text.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn()?;
    if let Some(text) = stdin_text
        && let Some(mut stdin) = child.stdin.take()
    {
        // A child that exits without reading stdin produces EPIPE here;
        // its exit status is what matters, so the write is best-effort.
        let _ = stdin.write_all(text.as_bytes());
    }
    Ok(child)
}

#[derive(Debug)]
pub(crate) enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Aborted,
}

/// Polls the child until it exits, the deadline passes, or the shutdown
/// flag is raised. On timeout/abort the child gets TERM, then KILL once the
/// grace period runs out.
pub(crate) fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
    grace: Duration,
    shutdown: Option<&AtomicBool>,
) -> WaitOutcome {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return WaitOutcome::Exited(status),
            Ok(None) => {}
            Err(_) => {}
        }
        if let Some(flag) = shutdown
            && flag.load(Ordering::Relaxed)
        {
            stop_child(child, grace);
            return WaitOutcome::Aborted;
        }
        if started.elapsed() >= timeout {
            stop_child(child, grace);
            return WaitOutcome::TimedOut;
        }
        std::thread::sleep(WAIT_POLL);
    }
}

fn stop_child(child: &mut Child, grace: Duration) {
    terminate(child.id(), false);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(WAIT_POLL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
pub(crate) fn terminate(pid: u32, force: bool) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    let _ = kill(Pid::from_raw(pid as i32), signal);
}

#[cfg(not(unix))]
pub(crate) fn terminate(_pid: u32, _force: bool) {}

/// Per-worker scratch directory for capture files.
pub(crate) fn capture_dir(worker_id: &str) -> std::io::Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("kl_worker_{worker_id}_{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Reads a capture file, keeping at most `max_chars` of the tail.
pub(crate) fn read_capture(path: &Path, max_chars: usize) -> String {
    let raw = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => return String::new(),
    };
    let total = raw.chars().count();
    if total <= max_chars {
        return raw;
    }
    let tail: String = raw
        .chars()
        .skip(total.saturating_sub(max_chars))
        .collect();
    format!("… (truncated) {tail}")
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
    #[test]
    fn captures_output_and_reports_exit() {
        let dir = tmp("kl_proc_capture");
        let out = dir.join("out.txt");
        let err = dir.join("err.txt");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; echo oops 1>&2; exit 3");
        let mut child = spawn_captured(cmd, &out, &err, None).expect("spawn");
        let outcome = wait_with_deadline(&mut child, Duration::from_secs(5), Duration::from_secs(1), None);

        match outcome {
            WaitOutcome::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected exit, got {other:?}"),
        }
        assert_eq!(read_capture(&out, 1000).trim(), "hello");
        assert_eq!(read_capture(&err, 1000).trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_a_hung_child() {
        let dir = tmp("kl_proc_timeout");
        let out = dir.join("out.txt");
        let err = dir.join("err.txt");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let mut child = spawn_captured(cmd, &out, &err, None).expect("spawn");
        let started = Instant::now();
        let outcome = wait_with_deadline(
            &mut child,
            Duration::from_millis(200),
            Duration::from_millis(200),
            None,
        );
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_flag_aborts_the_wait() {
        let dir = tmp("kl_proc_abort");
        let out = dir.join("out.txt");
        let err = dir.join("err.txt");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let mut child = spawn_captured(cmd, &out, &err, None).expect("spawn");
        let flag = AtomicBool::new(true);
        let outcome = wait_with_deadline(
            &mut child,
            Duration::from_secs(30),
            Duration::from_millis(200),
            Some(&flag),
        );
        assert!(matches!(outcome, WaitOutcome::Aborted));
    }

    #[test]
    fn read_capture_keeps_the_tail() {
        let dir = tmp("kl_proc_tail");
        let path = dir.join("big.txt");
        std::fs::write(&path, "a".repeat(100) + "END").expect("write");
        let got = read_capture(&path, 10);
        assert!(got.ends_with("END"));
        assert!(got.starts_with("… (truncated)"));
    }
}
