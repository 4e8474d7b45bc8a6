#![forbid(unsafe_code)]

mod executor;
mod heartbeat;
mod proc;
mod prompt;
mod verify;

use executor::{ExecError, ExecRequest, run_executor, stderr_snippet};
use kl_core::config::{Config, ConfigOverrides};
use kl_core::env;
use kl_core::model::TaskOutcome;
use kl_storage::{LogLevel, SqliteStore, TaskRow};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_POLL_MS: u64 = 2_000;
const DEFAULT_TASK_TIMEOUT_S: u64 = 1_800;
const DEFAULT_GRACE_S: u64 = 10;
const DEFAULT_EXECUTOR_BIN: &str = "claude";
const STDERR_SNIPPET_CHARS: usize = 400;

fn usage() -> &'static str {
    "kl_worker — claim and execute tasks from the shared queue\n\n\
USAGE:\n\
  kl_worker [--worker-id ID] [--db PATH] [--poll-ms MS]\n\
            [--task-timeout-s S] [--grace-s S]\n\
            [--executor-bin PATH] [--executor-arg ARG]... [--once]\n\n\
NOTES:\n\
  - The executor CLI receives the effective prompt on stdin and runs in\n\
    the task's working directory; its exit code decides success.\n\
  - `--once` processes at most one task and exits (smoke test).\n\
  - KLAUSS_DB_PATH overrides the store path; KLAUSS_EXECUTOR_BIN the\n\
    executor binary.\n"
}

struct WorkerArgs {
    worker_id: String,
    db_path: Option<PathBuf>,
    poll_ms: u64,
    task_timeout_s: u64,
    grace_s: u64,
    executor_bin: String,
    executor_args: Vec<String>,
    once: bool,
}

fn parse_args() -> Result<WorkerArgs, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(0);
    }

    let mut worker_id: Option<String> = None;
    let mut db_path: Option<PathBuf> = None;
    let mut poll_ms: u64 = DEFAULT_POLL_MS;
    let mut task_timeout_s: u64 = DEFAULT_TASK_TIMEOUT_S;
    let mut grace_s: u64 = DEFAULT_GRACE_S;
    let mut executor_bin: Option<String> = env::var("KLAUSS_EXECUTOR_BIN");
    let mut executor_args: Vec<String> = Vec::new();
    let mut once = false;

    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--worker-id" => {
                i += 1;
                let v = args.get(i).ok_or("--worker-id requires ID")?;
                worker_id = Some(v.to_string());
            }
            "--db" => {
                i += 1;
                let v = args.get(i).ok_or("--db requires PATH")?;
                db_path = Some(PathBuf::from(v));
            }
            "--poll-ms" => {
                i += 1;
                let v = args.get(i).ok_or("--poll-ms requires MS")?;
                poll_ms = v
                    .parse::<u64>()
                    .map_err(|_| "--poll-ms must be an integer (milliseconds)")?;
            }
            "--task-timeout-s" => {
                i += 1;
                let v = args.get(i).ok_or("--task-timeout-s requires S")?;
                task_timeout_s = v
                    .parse::<u64>()
                    .map_err(|_| "--task-timeout-s must be an integer (seconds)")?;
            }
            "--grace-s" => {
                i += 1;
                let v = args.get(i).ok_or("--grace-s requires S")?;
                grace_s = v
                    .parse::<u64>()
                    .map_err(|_| "--grace-s must be an integer (seconds)")?;
            }
            "--executor-bin" => {
                i += 1;
                let v = args.get(i).ok_or("--executor-bin requires PATH")?;
                executor_bin = Some(v.to_string());
            }
            "--executor-arg" => {
                i += 1;
                let v = args.get(i).ok_or("--executor-arg requires ARG")?;
                executor_args.push(v.to_string());
            }
            "--once" => once = true,
            other => return Err(format!("Unknown arg: {other}\n\n{}", usage())),
        }
        i += 1;
    }

    let executor_bin = executor_bin.unwrap_or_else(|| DEFAULT_EXECUTOR_BIN.to_string());
    if executor_args.is_empty() && executor_bin == DEFAULT_EXECUTOR_BIN {
        // Headless print mode; interactive sessions would hang the worker.
        executor_args.push("-p".to_string());
    }

    Ok(WorkerArgs {
        worker_id: worker_id.unwrap_or_else(|| format!("worker_{}", std::process::id())),
        db_path,
        poll_ms,
        task_timeout_s,
        grace_s,
        executor_bin,
        executor_args,
        once,
    })
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(i64::MAX as u128) as i64
}

fn log_phase(worker_id: &str, phase: &str, message: &str) {
    println!("[{worker_id}] [{phase}] {message}");
}

fn prompt_preview(prompt: &str) -> String {
    let flat: String = prompt
        .chars()
        .take(60)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();
    if prompt.chars().count() > 60 {
        format!("{flat}…")
    } else {
        flat
    }
}

fn task_timeout(task: &TaskRow, default_s: u64) -> Duration {
    let from_meta = task
        .metadata
        .as_ref()
        .and_then(|m| m.get("timeout_seconds"))
        .and_then(|v| v.as_u64());
    Duration::from_secs(from_meta.unwrap_or(default_s).max(1))
}

fn record_progress(
    store: &mut SqliteStore,
    worker_id: &str,
    task_id: Option<i64>,
    level: LogLevel,
    message: &str,
) {
    if let Err(err) = store.log_progress(worker_id, task_id, level, message) {
        eprintln!("[{worker_id}] progress log failed: {err}");
    }
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let config = match Config::load_with(ConfigOverrides {
        db_path: args.db_path.clone(),
        ..ConfigOverrides::default()
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(2);
        }
    };

    std::process::exit(run_worker(args, config));
}

fn run_worker(args: WorkerArgs, config: Config) -> i32 {
    let worker_id = args.worker_id.clone();

    let mut store = match SqliteStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            eprintln!(
                "[{worker_id}] cannot open store at {}: {err}\n\
                 Check that the directory is writable, or point KLAUSS_DB_PATH / --db at the store every other participant uses.",
                config.db_path.display()
            );
            return 2;
        }
    };

    log_phase(&worker_id, "STARTUP", &format!("store: {}", config.db_path.display()));
    match store.stats() {
        Ok(stats) => {
            log_phase(
                &worker_id,
                "STARTUP",
                &format!(
                    "queue: {} pending, {} in progress, {} completed, {} failed",
                    stats.pending, stats.in_progress, stats.completed, stats.failed
                ),
            );
            if stats.pending == 0 && stats.active() == 0 {
                log_phase(
                    &worker_id,
                    "STARTUP",
                    "warning: no tasks visible; check the store path if work was submitted",
                );
            }
        }
        Err(err) => eprintln!("[{worker_id}] stats unavailable: {err}"),
    }

    let pid = std::process::id();
    if let Err(err) = store.register_worker(&worker_id, pid) {
        eprintln!("[{worker_id}] worker registration failed: {err}");
        return 2;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            eprintln!("[{worker_id}] signal handler registration failed: {err}");
        }
    }

    let current_task = Arc::new(AtomicI64::new(0));
    let heartbeat_handle = heartbeat::spawn_heartbeat(
        config.db_path.clone(),
        worker_id.clone(),
        pid,
        config.heartbeat_interval,
        Arc::clone(&shutdown),
        Arc::clone(&current_task),
    );

    let capture_dir = match proc::capture_dir(&worker_id) {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("[{worker_id}] cannot create capture dir: {err}");
            return 2;
        }
    };

    let grace = Duration::from_secs(args.grace_s);
    let mut exit_code = 0;

    while !shutdown.load(Ordering::Relaxed) {
        let task = match store.claim_task(&worker_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                if args.once {
                    break;
                }
                let jitter = (now_ms() % 500) as u64;
                std::thread::sleep(Duration::from_millis(args.poll_ms + jitter));
                continue;
            }
            Err(err) => {
                eprintln!("[{worker_id}] claim failed: {err}");
                std::thread::sleep(Duration::from_millis(args.poll_ms));
                continue;
            }
        };

        let task_id = task.id;
        current_task.store(task_id, Ordering::Relaxed);
        log_phase(
            &worker_id,
            "CLAIM",
            &format!("task {task_id}: {}", prompt_preview(&task.prompt)),
        );
        record_progress(&mut store, &worker_id, Some(task_id), LogLevel::Info, "claimed task");

        let done = run_one_task(&mut store, &worker_id, &args, &task, &capture_dir, grace, &shutdown);
        current_task.store(0, Ordering::Relaxed);

        match done {
            TaskDisposition::Continue => {}
            TaskDisposition::Shutdown => break,
            TaskDisposition::Fatal(code) => {
                exit_code = code;
                break;
            }
        }
        if args.once {
            break;
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    if let Err(err) = store.mark_worker_stopped(&worker_id) {
        eprintln!("[{worker_id}] failed to mark stopped: {err}");
    }
    log_phase(&worker_id, "SHUTDOWN", "worker stopped");
    let _ = heartbeat_handle.join();
    exit_code
}

enum TaskDisposition {
    Continue,
    Shutdown,
    Fatal(i32),
}

fn run_one_task(
    store: &mut SqliteStore,
    worker_id: &str,
    args: &WorkerArgs,
    task: &TaskRow,
    capture_dir: &std::path::Path,
    grace: Duration,
    shutdown: &AtomicBool,
) -> TaskDisposition {
    let task_id = task.id;

    let working_dir = task
        .working_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if let Err(err) = store.start_task(task_id, worker_id) {
        eprintln!("[{worker_id}] start failed for task {task_id}: {err}");
        return TaskDisposition::Continue;
    }

    if !working_dir.is_dir() {
        let message = format!("working directory does not exist: {}", working_dir.display());
        log_phase(worker_id, "FAIL", &format!("task {task_id}: {message}"));
        record_progress(store, worker_id, Some(task_id), LogLevel::Error, &message);
        if let Err(err) = store.fail_task(task_id, worker_id, &message) {
            eprintln!("[{worker_id}] fail transition failed: {err}");
        }
        return TaskDisposition::Continue;
    }

    let shared = match store.shared_context(task.job_id.as_deref()) {
        Ok(shared) => shared,
        Err(err) => {
            eprintln!("[{worker_id}] shared context unavailable: {err}");
            Default::default()
        }
    };
    let (effective_prompt, warnings) = prompt::build_prompt(task, &shared, &working_dir);
    for warning in &warnings {
        log_phase(worker_id, "EXEC", &format!("task {task_id}: {warning}"));
        record_progress(store, worker_id, Some(task_id), LogLevel::Warning, warning);
    }

    let timeout = task_timeout(task, args.task_timeout_s);
    log_phase(
        worker_id,
        "EXEC",
        &format!(
            "task {task_id}: running {} (timeout {}s)",
            args.executor_bin,
            timeout.as_secs()
        ),
    );
    record_progress(store, worker_id, Some(task_id), LogLevel::Info, "running executor");

    let request = ExecRequest {
        bin: &args.executor_bin,
        args: &args.executor_args,
        prompt: &effective_prompt,
        working_dir: Some(&working_dir),
        timeout,
        grace,
        capture_dir,
        capture_tag: format!("task_{task_id}"),
        shutdown,
    };
    let outcome = match run_executor(&request) {
        Ok(outcome) => outcome,
        Err(ExecError::Spawn { bin, missing: true, source }) => {
            let message = format!("executor `{bin}` not found: {source}");
            let _ = store.fail_task(task_id, worker_id, &message);
            record_progress(store, worker_id, Some(task_id), LogLevel::Error, &message);
            eprintln!(
                "[{worker_id}] {message}\n\
                 Install the executor CLI or point --executor-bin / KLAUSS_EXECUTOR_BIN at it."
            );
            return TaskDisposition::Fatal(2);
        }
        Err(err) => {
            let message = format!("executor spawn failed: {err}");
            log_phase(worker_id, "FAIL", &format!("task {task_id}: {message}"));
            record_progress(store, worker_id, Some(task_id), LogLevel::Error, &message);
            if let Err(err) = store.fail_task(task_id, worker_id, &message) {
                eprintln!("[{worker_id}] fail transition failed: {err}");
            }
            return TaskDisposition::Continue;
        }
    };

    if outcome.aborted {
        let message = "worker shutdown during execution".to_string();
        log_phase(worker_id, "FAIL", &format!("task {task_id}: {message}"));
        if let Err(err) = store.fail_task(task_id, worker_id, &message) {
            eprintln!("[{worker_id}] fail transition failed: {err}");
        }
        return TaskDisposition::Shutdown;
    }

    if outcome.timed_out {
        let message = format!(
            "executor timed out after {}s; stderr: {}",
            timeout.as_secs(),
            stderr_snippet(&outcome.stderr, STDERR_SNIPPET_CHARS)
        );
        log_phase(worker_id, "FAIL", &format!("task {task_id}: {message}"));
        record_progress(store, worker_id, Some(task_id), LogLevel::Error, &message);
        if let Err(err) = store.fail_task(task_id, worker_id, &message) {
            eprintln!("[{worker_id}] fail transition failed: {err}");
        }
        return TaskDisposition::Continue;
    }

    if !outcome.succeeded() {
        let exit = outcome
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let message = format!(
            "executor exited {exit}; stderr: {}",
            stderr_snippet(&outcome.stderr, STDERR_SNIPPET_CHARS)
        );
        log_phase(worker_id, "FAIL", &format!("task {task_id}: {message}"));
        record_progress(store, worker_id, Some(task_id), LogLevel::Error, &message);
        if let Err(err) = store.fail_task(task_id, worker_id, &message) {
            eprintln!("[{worker_id}] fail transition failed: {err}");
        }
        return TaskDisposition::Continue;
    }

    log_phase(worker_id, "VERIFY", &format!("task {task_id}: checking outputs and hooks"));
    record_progress(store, worker_id, Some(task_id), LogLevel::Info, "verifying outputs");
    let report = verify::verify_task(task, &working_dir, capture_dir, shutdown);

    if !report.passed {
        let message = report.summary();
        log_phase(worker_id, "FAIL", &format!("task {task_id}: {message}"));
        record_progress(store, worker_id, Some(task_id), LogLevel::Error, &message);
        if let Err(err) = store.fail_task(task_id, worker_id, &message) {
            eprintln!("[{worker_id}] fail transition failed: {err}");
        }
        return TaskDisposition::Continue;
    }

    let result = TaskOutcome::Success {
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: 0,
        verification: report,
    };
    match store.complete_task(task_id, worker_id, &result) {
        Ok(()) => {
            log_phase(
                worker_id,
                "COMPLETE",
                &format!("task {task_id} done in {}s", outcome.duration.as_secs()),
            );
            record_progress(store, worker_id, Some(task_id), LogLevel::Info, "task completed");
        }
        Err(err) => eprintln!("[{worker_id}] complete transition failed: {err}"),
    }
    TaskDisposition::Continue
}
