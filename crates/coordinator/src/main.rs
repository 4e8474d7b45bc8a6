#![forbid(unsafe_code)]

mod supervise;

use kl_core::config::{Config, ConfigOverrides};
use kl_storage::SqliteStore;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use supervise::{IdleTracker, RestartBudget};

const TICK: Duration = Duration::from_secs(1);
const SWEEP_EVERY_TICKS: u64 = 10;
const DEFAULT_SHUTDOWN_GRACE_S: u64 = 10;

fn usage() -> &'static str {
    "kl_coordinator — supervise a pool of kl_worker processes\n\n\
USAGE:\n\
  kl_coordinator [--workers N] [--db PATH] [--idle-timeout-s S]\n\
                 [--grace-s S] [--worker-bin PATH]\n\n\
NOTES:\n\
  - Worker stdout/stderr is captured into logs/{worker_id}.log next to\n\
    the store; supervision events go to logs/coordinator.log.\n\
  - The pool shuts itself down once the queue is empty and idle for the\n\
    idle timeout.\n"
}

struct CoordinatorArgs {
    workers: Option<usize>,
    db_path: Option<PathBuf>,
    idle_timeout_s: Option<u64>,
    grace_s: u64,
    worker_bin: Option<String>,
}

fn parse_args() -> Result<CoordinatorArgs, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(0);
    }

    let mut workers: Option<usize> = None;
    let mut db_path: Option<PathBuf> = None;
    let mut idle_timeout_s: Option<u64> = None;
    let mut grace_s: u64 = DEFAULT_SHUTDOWN_GRACE_S;
    let mut worker_bin: Option<String> = None;

    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        match a {
            "--workers" => {
                i += 1;
                let v = args.get(i).ok_or("--workers requires N")?;
                workers = Some(
                    v.parse::<usize>()
                        .map_err(|_| "--workers must be an integer")?,
                );
            }
            "--db" => {
                i += 1;
                let v = args.get(i).ok_or("--db requires PATH")?;
                db_path = Some(PathBuf::from(v));
            }
            "--idle-timeout-s" => {
                i += 1;
                let v = args.get(i).ok_or("--idle-timeout-s requires S")?;
                idle_timeout_s = Some(
                    v.parse::<u64>()
                        .map_err(|_| "--idle-timeout-s must be an integer (seconds)")?,
                );
            }
            "--grace-s" => {
                i += 1;
                let v = args.get(i).ok_or("--grace-s requires S")?;
                grace_s = v
                    .parse::<u64>()
                    .map_err(|_| "--grace-s must be an integer (seconds)")?;
            }
            "--worker-bin" => {
                i += 1;
                let v = args.get(i).ok_or("--worker-bin requires PATH")?;
                worker_bin = Some(v.to_string());
            }
            other => return Err(format!("Unknown arg: {other}\n\n{}", usage())),
        }
        i += 1;
    }

    Ok(CoordinatorArgs {
        workers,
        db_path,
        idle_timeout_s,
        grace_s,
        worker_bin,
    })
}

/// Prefer a sibling `kl_worker` next to this binary so `./target/debug/kl_coordinator`
/// works without PATH setup.
fn default_worker_bin() -> String {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join("kl_worker");
        if sibling.exists() {
            return sibling.to_string_lossy().to_string();
        }
    }
    "kl_worker".to_string()
}

struct CoordinatorLog {
    file: Option<File>,
}

impl CoordinatorLog {
    fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = OpenOptions::new().create(true).append(true).open(path).ok();
        Self { file }
    }

    fn log(&mut self, message: &str) {
        let ts = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "-".to_string());
        println!("[coordinator] {message}");
        if let Some(file) = self.file.as_mut() {
            let _ = writeln!(file, "{ts} {message}");
        }
    }
}

struct Slot {
    worker_id: String,
    child: Option<Child>,
    budget: RestartBudget,
    disabled: bool,
}

fn spawn_worker(
    worker_bin: &str,
    worker_id: &str,
    db_path: &Path,
    log_dir: &Path,
) -> Result<Child, String> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("create log dir failed: {e}"))?;
    let log_path = log_dir.join(format!("{worker_id}.log"));
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("open {} failed: {e}", log_path.display()))?;
    let log_file_err = log_file
        .try_clone()
        .map_err(|e| format!("clone log handle failed: {e}"))?;

    Command::new(worker_bin)
        .arg("--worker-id")
        .arg(worker_id)
        .arg("--db")
        .arg(db_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .spawn()
        .map_err(|e| format!("failed to spawn worker ({worker_bin}): {e}"))
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
        worker_count: args.workers,
        idle_timeout_s: args.idle_timeout_s,
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(2);
        }
    };

    std::process::exit(run_coordinator(args, config));
}

fn run_coordinator(args: CoordinatorArgs, config: Config) -> i32 {
    let mut log = CoordinatorLog::open(&config.log_dir().join("coordinator.log"));

    let mut store = match SqliteStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            eprintln!(
                "cannot open store at {}: {err}\n\
                 Check permissions, or point KLAUSS_DB_PATH / --db at a writable location.",
                config.db_path.display()
            );
            return 2;
        }
    };

    log.log(&format!(
        "starting: store={}, workers={}, idle_timeout={}s, heartbeat={}s",
        config.db_path.display(),
        config.worker_count,
        config.idle_timeout.as_secs(),
        config.heartbeat_interval.as_secs()
    ));

    let pid_file = config.pid_file();
    if let Err(err) = std::fs::write(&pid_file, std::process::id().to_string()) {
        log.log(&format!("warning: cannot write pid file: {err}"));
    }

    let stale_ms = config.stale_threshold().as_millis().min(i64::MAX as u128) as i64;
    match store.sweep_stale(stale_ms) {
        Ok(reset) if !reset.is_empty() => {
            log.log(&format!("startup sweep reset tasks: {reset:?}"));
        }
        Ok(_) => {}
        Err(err) => log.log(&format!("startup sweep failed: {err}")),
    }

    let worker_bin = args.worker_bin.clone().unwrap_or_else(default_worker_bin);
    let log_dir = config.log_dir();

    let mut slots: Vec<Slot> = (0..config.worker_count)
        .map(|i| Slot {
            worker_id: format!("worker_{}", i + 1),
            child: None,
            budget: RestartBudget::default(),
            disabled: false,
        })
        .collect();

    for slot in &mut slots {
        match spawn_worker(&worker_bin, &slot.worker_id, &config.db_path, &log_dir) {
            Ok(child) => {
                log.log(&format!("spawned {} (pid {})", slot.worker_id, child.id()));
                slot.child = Some(child);
            }
            Err(err) => log.log(&format!("spawn {} failed: {err}", slot.worker_id)),
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            log.log(&format!("signal handler registration failed: {err}"));
        }
    }

    let mut idle = IdleTracker::new(Instant::now());
    let mut tick: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(TICK);
        tick += 1;
        let now = Instant::now();

        match store.stats() {
            Ok(stats) => {
                idle.observe(&stats, now);
                if stats.active() == 0 && idle.idle_for(now) >= config.idle_timeout {
                    log.log(&format!(
                        "queue idle for {}s with nothing pending; shutting the pool down",
                        idle.idle_for(now).as_secs()
                    ));
                    break;
                }
            }
            Err(err) => log.log(&format!("stats poll failed: {err}")),
        }

        for slot in &mut slots {
            let exited = match slot.child.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        log.log(&format!(
                            "{} exited ({})",
                            slot.worker_id,
                            status
                                .code()
                                .map(|c| format!("code {c}"))
                                .unwrap_or_else(|| "signal".to_string())
                        ));
                        true
                    }
                    Ok(None) => false,
                    Err(err) => {
                        log.log(&format!("{} wait failed: {err}", slot.worker_id));
                        false
                    }
                },
                None => !slot.disabled,
            };

            if exited && !shutdown.load(Ordering::Relaxed) {
                slot.child = None;
                slot.budget.record(now);
                if slot.budget.exhausted(now) {
                    if !slot.disabled {
                        slot.disabled = true;
                        log.log(&format!(
                            "alert: {} restarted {} times within {}s; slot disabled",
                            slot.worker_id,
                            supervise::RESTART_LIMIT,
                            supervise::RESTART_WINDOW.as_secs()
                        ));
                    }
                    continue;
                }
                match spawn_worker(&worker_bin, &slot.worker_id, &config.db_path, &log_dir) {
                    Ok(child) => {
                        log.log(&format!(
                            "restarted {} (pid {})",
                            slot.worker_id,
                            child.id()
                        ));
                        slot.child = Some(child);
                    }
                    Err(err) => log.log(&format!("respawn {} failed: {err}", slot.worker_id)),
                }
            }
        }

        if tick % SWEEP_EVERY_TICKS == 0 {
            match store.sweep_stale(stale_ms) {
                Ok(reset) if !reset.is_empty() => {
                    log.log(&format!("sweep reset tasks: {reset:?}"));
                }
                Ok(_) => {}
                Err(err) => log.log(&format!("sweep failed: {err}")),
            }
        }
    }

    shutdown_pool(&mut slots, Duration::from_secs(args.grace_s), &mut log);
    if let Err(err) = std::fs::remove_file(&pid_file) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log.log(&format!("warning: cannot remove pid file: {err}"));
        }
    }
    log.log("stopped");
    0
}

/// TERM every live worker, wait up to `grace`, then KILL the rest.
fn shutdown_pool(slots: &mut [Slot], grace: Duration, log: &mut CoordinatorLog) {
    for slot in slots.iter_mut() {
        if let Some(child) = slot.child.as_ref() {
            log.log(&format!("stopping {} (pid {})", slot.worker_id, child.id()));
            terminate(child.id(), false);
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        let mut alive = 0;
        for slot in slots.iter_mut() {
            if let Some(child) = slot.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(_)) => slot.child = None,
                    Ok(None) => alive += 1,
                    Err(_) => slot.child = None,
                }
            }
        }
        if alive == 0 || Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    for slot in slots.iter_mut() {
        if let Some(child) = slot.child.as_mut() {
            log.log(&format!(
                "{} did not stop within grace; killing",
                slot.worker_id
            ));
            let _ = child.kill();
            let _ = child.wait();
            slot.child = None;
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32, force: bool) {
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
fn terminate(_pid: u32, _force: bool) {}
