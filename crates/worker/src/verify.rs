#![forbid(unsafe_code)]

//! Post-execution verification: expected outputs must exist, then the
//! task's hooks (or auto-detected project checks) must pass.

use crate::proc::{WaitOutcome, read_capture, spawn_captured, wait_with_deadline};
use crate::prompt::resolve;
use kl_core::model::{HookOutcome, VerificationHook, VerificationReport};
use kl_storage::TaskRow;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

const HOOK_GRACE: Duration = Duration::from_secs(5);
const HOOK_CAPTURE_MAX_CHARS: usize = 20_000;

/// Runs the full pipeline for a finished task. A missing expected output
/// short-circuits: remaining hooks are skipped because the project state is
/// already known bad.
pub(crate) fn verify_task(
    task: &TaskRow,
    working_dir: &Path,
    capture_dir: &Path,
    shutdown: &AtomicBool,
) -> VerificationReport {
    let mut report = VerificationReport {
        passed: true,
        missing_outputs: Vec::new(),
        hooks: Vec::new(),
    };

    for raw in &task.expected_outputs {
        if !resolve(working_dir, raw).exists() {
            report.missing_outputs.push(raw.clone());
        }
    }
    if !report.missing_outputs.is_empty() {
        report.passed = false;
        return report;
    }

    let hooks = if !task.verification_hooks.is_empty() {
        task.verification_hooks.clone()
    } else if task.auto_verify {
        detect_hooks(working_dir)
    } else {
        Vec::new()
    };

    for (index, hook) in hooks.iter().enumerate() {
        let outcome = run_hook(hook, working_dir, capture_dir, index, shutdown);
        if !outcome.passed && hook.fail_on_error {
            report.passed = false;
        }
        report.hooks.push(outcome);
    }
    report
}

/// Best-effort project detection by marker files. No markers means no hooks
/// and the task passes on the existence check alone.
pub(crate) fn detect_hooks(working_dir: &Path) -> Vec<VerificationHook> {
    let mut hooks = Vec::new();

    if working_dir.join("tsconfig.json").exists() {
        hooks.push(VerificationHook::new(
            "npx tsc --noEmit",
            "TypeScript compilation check",
        ));
    }

    if working_dir.join("package.json").exists() {
        let has_eslint_config = ["eslint.config.js", ".eslintrc.js", ".eslintrc.json", ".eslintrc"]
            .iter()
            .any(|name| working_dir.join(name).exists());
        if has_eslint_config {
            hooks.push(
                VerificationHook::new("npx eslint .", "ESLint check").advisory(),
            );
        }
        if package_json_has_test_script(working_dir) {
            hooks.push(VerificationHook::new("npm test", "Run test suite").with_timeout_s(600));
        }
    }

    let is_python = ["pyproject.toml", "setup.py", "requirements.txt"]
        .iter()
        .any(|name| working_dir.join(name).exists());
    if is_python {
        if working_dir.join("mypy.ini").exists() || working_dir.join("setup.cfg").exists() {
            hooks.push(
                VerificationHook::new("python3 -m mypy .", "Python type checking (mypy)")
                    .advisory(),
            );
        }
        if working_dir.join("pytest.ini").exists() || working_dir.join("tox.ini").exists() {
            hooks.push(
                VerificationHook::new("python3 -m pytest", "Run Python tests (pytest)")
                    .with_timeout_s(600),
            );
        }
    }

    if working_dir.join("go.mod").exists() {
        hooks.push(VerificationHook::new("go build ./...", "Go build check"));
        hooks.push(VerificationHook::new("go test ./...", "Run Go tests").with_timeout_s(600));
    }

    if working_dir.join("Cargo.toml").exists() {
        hooks.push(VerificationHook::new("cargo check", "Rust check"));
        hooks.push(VerificationHook::new("cargo test", "Run Rust tests").with_timeout_s(600));
    }

    hooks
}

fn package_json_has_test_script(working_dir: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(working_dir.join("package.json")) else {
        return false;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) else {
        return false;
    };
    parsed
        .get("scripts")
        .and_then(|s| s.get("test"))
        .and_then(|t| t.as_str())
        .is_some_and(|t| !t.trim().is_empty())
}

fn run_hook(
    hook: &VerificationHook,
    working_dir: &Path,
    capture_dir: &Path,
    index: usize,
    shutdown: &AtomicBool,
) -> HookOutcome {
    let stdout_path = capture_dir.join(format!("hook_{index}.out"));
    let stderr_path = capture_dir.join(format!("hook_{index}.err"));

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&hook.command).current_dir(working_dir);

    let mut child = match spawn_captured(cmd, &stdout_path, &stderr_path, None) {
        Ok(child) => child,
        Err(err) => {
            return HookOutcome {
                hook_description: hook.description.clone(),
                passed: false,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("failed to spawn hook: {err}")),
            };
        }
    };

    let outcome = wait_with_deadline(
        &mut child,
        Duration::from_secs(hook.timeout_s),
        HOOK_GRACE,
        Some(shutdown),
    );
    let stdout = read_capture(&stdout_path, HOOK_CAPTURE_MAX_CHARS);
    let stderr = read_capture(&stderr_path, HOOK_CAPTURE_MAX_CHARS);

    match outcome {
        WaitOutcome::Exited(status) => HookOutcome {
            hook_description: hook.description.clone(),
            passed: status.success(),
            exit_code: status.code(),
            stdout,
            stderr,
            error: None,
        },
        WaitOutcome::TimedOut => HookOutcome {
            hook_description: hook.description.clone(),
            passed: false,
            exit_code: None,
            stdout,
            stderr,
            error: Some(format!("hook timed out after {}s", hook.timeout_s)),
        },
        WaitOutcome::Aborted => HookOutcome {
            hook_description: hook.description.clone(),
            passed: false,
            exit_code: None,
            stdout,
            stderr,
            error: Some("hook aborted by worker shutdown".to_string()),
        },
    }
}
