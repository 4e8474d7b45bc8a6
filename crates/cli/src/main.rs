#![forbid(unsafe_code)]

mod submission;

use kl_core::config::{CONFIG_FILE_NAME, CONFIG_TEMPLATE, Config, ConfigOverrides};
use kl_core::model::TaskStatus;
use kl_orchestrator::Orchestrator;
use kl_storage::{NewTask, SqliteStore};
use std::io::{IsTerminal, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Duration;

fn usage() -> &'static str {
    "klauss — manage the shared task queue and its worker pool\n\n\
USAGE:\n\
  klauss [--db PATH] <command> [args]\n\n\
COMMANDS:\n\
  init-config              Copy the config template into the current directory\n\
  start [N]                Launch the coordinator with N workers (default 4)\n\
  stop                     Send TERM to the coordinator and all workers\n\
  kill                     Send KILL to the coordinator and all workers\n\
  workers                  Show live workers and queue statistics\n\
  dashboard                Launch the read-only dashboard (separate binary)\n\
  submit <prompt> [opts]   Queue one task\n\
  submit-file <file>       Queue tasks from a JSON file\n\
  list [status]            List tasks, optionally filtered by status\n\
  stats                    Show queue statistics\n\
  show <id>                Show the full record of one task\n\
  job <job_id>             Show job progress\n\
  retry <job_id>           Reset the job's failed tasks to pending\n\
  logs [worker] [-f]       List log files, or tail one (follow with -f)\n\
  clean [--yes]            Delete the store file and logs\n\n\
SUBMIT OPTIONS:\n\
  --dir DIR  --context FILE  --output FILE  --priority N\n\
  --metadata JSON  --depends-on ID  --job JOB_ID\n\n\
Exit codes: 0 success, 1 usage error, 2 operational failure.\n"
}

enum CliError {
    User(String),
    Op(String),
}

impl CliError {
    fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    fn op(message: impl Into<String>) -> Self {
        Self::Op(message.into())
    }
}

fn main() {
    let mut args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") || args.is_empty() {
        print!("{}", usage());
        std::process::exit(if args.is_empty() { 1 } else { 0 });
    }

    // --db applies to every command; pull it out before dispatch.
    let mut db_override: Option<PathBuf> = None;
    if let Some(pos) = args.iter().position(|a| a == "--db") {
        if pos + 1 >= args.len() {
            eprintln!("--db requires PATH");
            std::process::exit(1);
        }
        db_override = Some(PathBuf::from(&args[pos + 1]));
        args.drain(pos..=pos + 1);
    }
    if args.is_empty() {
        eprintln!("{}", usage());
        std::process::exit(1);
    }

    let config = match Config::load_with(ConfigOverrides {
        db_path: db_override,
        ..ConfigOverrides::default()
    }) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(2);
        }
    };

    let command = args[0].clone();
    let rest = &args[1..];
    let outcome = match command.as_str() {
        "init-config" => cmd_init_config(),
        "start" => cmd_start(&config, rest),
        "stop" => cmd_stop(&config, false),
        "kill" => cmd_stop(&config, true),
        "workers" => cmd_workers(&config),
        "dashboard" => cmd_dashboard(&config),
        "submit" => cmd_submit(&config, rest),
        "submit-file" => cmd_submit_file(&config, rest),
        "list" => cmd_list(&config, rest),
        "stats" => cmd_stats(&config),
        "show" => cmd_show(&config, rest),
        "job" => cmd_job(&config, rest),
        "retry" => cmd_retry(&config, rest),
        "logs" => cmd_logs(&config, rest),
        "clean" => cmd_clean(&config, rest),
        other => Err(CliError::user(format!(
            "unknown command: {other}\n\n{}",
            usage()
        ))),
    };

    match outcome {
        Ok(()) => {}
        Err(CliError::User(message)) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
        Err(CliError::Op(message)) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    }
}

fn open_store(config: &Config) -> Result<SqliteStore, CliError> {
    SqliteStore::open(&config.db_path).map_err(|err| {
        CliError::op(format!(
            "cannot open store at {}: {err}",
            config.db_path.display()
        ))
    })
}

fn interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

fn confirm(question: &str) -> Result<bool, CliError> {
    print!("{question} [y/N] ");
    std::io::stdout()
        .flush()
        .map_err(|e| CliError::op(e.to_string()))?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .map_err(|e| CliError::op(e.to_string()))?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn cmd_init_config() -> Result<(), CliError> {
    let target = std::env::current_dir()
        .map_err(|e| CliError::op(e.to_string()))?
        .join(CONFIG_FILE_NAME);
    if target.exists() {
        if !interactive() {
            return Err(CliError::user(format!(
                "{} already exists; remove it first or run interactively to confirm overwrite",
                target.display()
            )));
        }
        if !confirm(&format!("{} exists. Overwrite?", target.display()))? {
            println!("left existing config untouched");
            return Ok(());
        }
    }
    std::fs::write(&target, CONFIG_TEMPLATE)
        .map_err(|e| CliError::op(format!("cannot write {}: {e}", target.display())))?;
    println!("wrote {}", target.display());
    Ok(())
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

fn cmd_start(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let workers = match rest.first() {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| CliError::user("start takes an optional worker count (integer)"))?,
        None => config.worker_count,
    };

    let bin = sibling_binary("kl_coordinator");
    let child = std::process::Command::new(&bin)
        .arg("--db")
        .arg(&config.db_path)
        .arg("--workers")
        .arg(workers.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| CliError::op(format!("failed to launch coordinator ({bin}): {e}")))?;

    println!(
        "coordinator started (pid {}) with {workers} workers\nstore: {}\nlogs:  {}",
        child.id(),
        config.db_path.display(),
        config.log_dir().display()
    );
    Ok(())
}

/// Pids we may signal: the coordinator from its pid file plus every
/// non-stopped worker row.
fn managed_pids(config: &Config, store: &mut SqliteStore) -> Vec<(String, u32)> {
    let mut pids = Vec::new();
    if let Ok(text) = std::fs::read_to_string(config.pid_file())
        && let Ok(pid) = text.trim().parse::<u32>()
    {
        pids.push(("coordinator".to_string(), pid));
    }
    if let Ok(workers) = store.list_workers() {
        for worker in workers {
            if worker.status != kl_core::model::WorkerStatus::Stopped {
                pids.push((worker.worker_id, worker.pid));
            }
        }
    }
    pids
}

fn cmd_stop(config: &Config, force: bool) -> Result<(), CliError> {
    let mut store = open_store(config)?;
    let targets = managed_pids(config, &mut store);
    if targets.is_empty() {
        println!("nothing to stop");
        return Ok(());
    }

    let verb = if force { "KILL" } else { "TERM" };
    for (name, pid) in &targets {
        println!("sending {verb} to {name} (pid {pid})");
        signal_pid(*pid, force);
    }

    std::thread::sleep(Duration::from_secs(2));
    let residual: Vec<&(String, u32)> = targets
        .iter()
        .filter(|(_, pid)| process_alive(*pid))
        .collect();
    if residual.is_empty() {
        println!("all processes stopped");
    } else {
        for (name, pid) in residual {
            println!("still running: {name} (pid {pid})");
        }
        if !force {
            println!("use `klauss kill` to force");
        }
    }
    Ok(())
}

fn cmd_workers(config: &Config) -> Result<(), CliError> {
    let mut store = open_store(config)?;
    let progress = store
        .active_progress()
        .map_err(|e| CliError::op(e.to_string()))?;
    let workers = store
        .list_workers()
        .map_err(|e| CliError::op(e.to_string()))?;

    if workers.is_empty() {
        println!("no workers registered");
    } else {
        println!(
            "{:<12} {:<8} {:<8} {:<10} {:<10} {:<10} {:<6} RECENT",
            "WORKER", "PID", "STATUS", "CPU", "MEM", "RUNTIME", "TASK"
        );
        let now = now_ms();
        for worker in &workers {
            let recent = progress
                .iter()
                .find(|p| p.worker_id == worker.worker_id)
                .and_then(|p| p.recent_log.clone())
                .unwrap_or_else(|| "-".to_string());
            let runtime = fmt_age(now.saturating_sub(worker.started_at_ms) / 1000);
            let task = worker
                .current_task_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<12} {:<8} {:<8} {:<10} {:<10} {:<10} {:<6} {}",
                worker.worker_id,
                worker.pid,
                worker.status,
                cpu_seconds(worker.pid),
                rss_kb(worker.pid),
                runtime,
                task,
                truncate(&recent, 40)
            );
        }
    }

    let stats = store.stats().map_err(|e| CliError::op(e.to_string()))?;
    println!(
        "\nqueue: {} pending, {} claimed, {} in progress, {} completed, {} failed",
        stats.pending, stats.claimed, stats.in_progress, stats.completed, stats.failed
    );
    Ok(())
}

fn cmd_dashboard(config: &Config) -> Result<(), CliError> {
    let bin = sibling_binary("kl_dashboard");
    std::process::Command::new(&bin)
        .arg("--db")
        .arg(&config.db_path)
        .spawn()
        .map(|child| println!("dashboard started (pid {})", child.id()))
        .map_err(|e| {
            CliError::op(format!(
                "dashboard binary unavailable ({bin}): {e}\n\
                 The dashboard ships separately; `klauss workers` and `klauss stats` cover the basics."
            ))
        })
}

fn cmd_submit(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let Some(prompt) = rest.first() else {
        return Err(CliError::user("submit requires a prompt"));
    };

    let mut task = NewTask::new(prompt.clone());
    let mut i = 1usize;
    while i < rest.len() {
        match rest[i].as_str() {
            "--dir" => {
                i += 1;
                task.working_dir =
                    Some(arg_value(rest, i, "--dir requires DIR")?.to_string());
            }
            "--context" => {
                i += 1;
                task.context_files
                    .push(arg_value(rest, i, "--context requires FILE")?.to_string());
            }
            "--output" => {
                i += 1;
                task.expected_outputs
                    .push(arg_value(rest, i, "--output requires FILE")?.to_string());
            }
            "--priority" => {
                i += 1;
                task.priority = arg_value(rest, i, "--priority requires N")?
                    .parse::<i64>()
                    .map_err(|_| CliError::user("--priority must be an integer"))?;
            }
            "--metadata" => {
                i += 1;
                let raw = arg_value(rest, i, "--metadata requires JSON")?;
                task.metadata = Some(
                    serde_json::from_str(raw)
                        .map_err(|e| CliError::user(format!("--metadata is not valid JSON: {e}")))?,
                );
            }
            "--depends-on" => {
                i += 1;
                task.depends_on.push(
                    arg_value(rest, i, "--depends-on requires ID")?
                        .parse::<i64>()
                        .map_err(|_| CliError::user("--depends-on must be a task id"))?,
                );
            }
            "--job" => {
                i += 1;
                task.job_id = Some(arg_value(rest, i, "--job requires JOB_ID")?.to_string());
            }
            other => return Err(CliError::user(format!("unknown submit option: {other}"))),
        }
        i += 1;
    }

    let mut store = open_store(config)?;
    let id = store
        .add_task(task)
        .map_err(|e| CliError::op(format!("submit failed: {e}")))?;
    println!("task {id} submitted");
    Ok(())
}

fn cmd_submit_file(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let Some(path) = rest.first() else {
        return Err(CliError::user("submit-file requires a file path"));
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| CliError::user(format!("cannot read {path}: {e}")))?;
    let tasks = submission::parse_submission(&text).map_err(CliError::user)?;

    let mut store = open_store(config)?;
    let mut ids = Vec::new();
    for task in tasks {
        let preview = truncate(&task.prompt, 50);
        let id = store
            .add_task(task.into())
            .map_err(|e| CliError::op(format!("submit failed: {e}")))?;
        println!("task {id} submitted: {preview}");
        ids.push(id);
    }
    println!("\n{} tasks submitted", ids.len());
    Ok(())
}

fn cmd_list(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let status = match rest.first() {
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            CliError::user(format!(
                "unknown status: {raw} (expected pending|claimed|in_progress|completed|failed)"
            ))
        })?),
        None => None,
    };

    let mut store = open_store(config)?;
    let tasks = store
        .list_tasks(status, None)
        .map_err(|e| CliError::op(e.to_string()))?;
    if tasks.is_empty() {
        println!("no tasks found");
        return Ok(());
    }

    println!(
        "{:<6} {:<12} {:<9} {:<52} WORKER",
        "ID", "STATUS", "PRIORITY", "PROMPT"
    );
    for task in &tasks {
        println!(
            "{:<6} {:<12} {:<9} {:<52} {}",
            task.id,
            task.status,
            task.priority,
            truncate(&task.prompt, 50),
            task.worker_id.as_deref().unwrap_or("-")
        );
    }
    println!("\ntotal: {} tasks", tasks.len());
    Ok(())
}

fn cmd_stats(config: &Config) -> Result<(), CliError> {
    let mut store = open_store(config)?;
    let stats = store.stats().map_err(|e| CliError::op(e.to_string()))?;
    let live = store
        .live_worker_count(config.stale_threshold().as_millis().min(i64::MAX as u128) as i64)
        .map_err(|e| CliError::op(e.to_string()))?;
    let total_workers = store
        .list_workers()
        .map_err(|e| CliError::op(e.to_string()))?
        .len();

    println!("queue statistics");
    println!("  pending:      {}", stats.pending);
    println!("  claimed:      {}", stats.claimed);
    println!("  in progress:  {}", stats.in_progress);
    println!("  completed:    {}", stats.completed);
    println!("  failed:       {}", stats.failed);
    println!("  total:        {}", stats.active() + stats.terminal());
    println!("workers: {live} live / {total_workers} registered");
    Ok(())
}

fn cmd_show(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let id = rest
        .first()
        .ok_or_else(|| CliError::user("show requires a task id"))?
        .parse::<i64>()
        .map_err(|_| CliError::user("show requires a numeric task id"))?;

    let mut store = open_store(config)?;
    let task = store
        .get_task(id)
        .map_err(|e| CliError::op(e.to_string()))?;

    println!("task {id}");
    println!("  status:     {}", task.status);
    println!("  priority:   {}", task.priority);
    println!("  worker:     {}", task.worker_id.as_deref().unwrap_or("-"));
    println!("  job:        {}", task.job_id.as_deref().unwrap_or("-"));
    println!(
        "  parent:     {}",
        task.parent_task_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if !task.depends_on.is_empty() {
        println!("  depends on: {:?}", task.depends_on);
    }
    println!("  created:    {}", fmt_ts(Some(task.created_at_ms)));
    println!("  claimed:    {}", fmt_ts(task.claimed_at_ms));
    println!("  started:    {}", fmt_ts(task.started_at_ms));
    println!("  completed:  {}", fmt_ts(task.completed_at_ms));
    println!(
        "  workdir:    {}",
        task.working_dir.as_deref().unwrap_or("-")
    );
    println!("\nprompt:\n{}", task.prompt);

    if !task.context_files.is_empty() {
        println!("\ncontext files:");
        for file in &task.context_files {
            println!("  - {file}");
        }
    }
    if !task.expected_outputs.is_empty() {
        println!("\nexpected outputs:");
        for file in &task.expected_outputs {
            println!("  - {file}");
        }
    }
    if !task.verification_hooks.is_empty() {
        println!("\nverification hooks:");
        for hook in &task.verification_hooks {
            println!("  - {} ({})", hook.description, hook.command);
        }
    }
    if let Some(result) = &task.result {
        println!(
            "\nresult:\n{}",
            serde_json::to_string_pretty(result).unwrap_or_else(|_| "<unprintable>".to_string())
        );
    }
    if let Some(error) = &task.error {
        println!("\nerror:\n{error}");
    }
    Ok(())
}

fn cmd_job(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let Some(job_id) = rest.first() else {
        return Err(CliError::user("job requires a job id"));
    };
    let mut orch =
        Orchestrator::open(config.clone()).map_err(|e| CliError::op(e.to_string()))?;
    let progress = orch
        .job_status(job_id)
        .map_err(|e| CliError::op(e.to_string()))?;
    println!(
        "{}: {}/{} done ({:.1}%) | in progress: {} | pending: {} | failed: {}",
        progress.job_id,
        progress.completed,
        progress.total,
        progress.progress_pct,
        progress.in_progress,
        progress.pending,
        progress.failed
    );
    Ok(())
}

fn cmd_retry(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let Some(job_id) = rest.first() else {
        return Err(CliError::user("retry requires a job id"));
    };
    let mut orch =
        Orchestrator::open(config.clone()).map_err(|e| CliError::op(e.to_string()))?;
    let retried = orch
        .retry_failed_tasks(job_id)
        .map_err(|e| CliError::op(e.to_string()))?;
    if retried.is_empty() {
        println!("no failed tasks in {job_id}");
    } else {
        println!("reset {} tasks to pending: {retried:?}", retried.len());
    }
    Ok(())
}

fn cmd_logs(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let follow = rest.iter().any(|a| a == "-f");
    let worker: Option<&String> = rest.iter().find(|a| a.as_str() != "-f");

    let log_dir = config.log_dir();
    let Some(worker) = worker else {
        let entries = std::fs::read_dir(&log_dir)
            .map_err(|e| CliError::op(format!("no logs at {}: {e}", log_dir.display())))?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                name.ends_with(".log").then(|| format!("{name} ({size} bytes)"))
            })
            .collect();
        names.sort();
        if names.is_empty() {
            println!("no log files in {}", log_dir.display());
        }
        for name in names {
            println!("{name}");
        }
        return Ok(());
    };

    let path = log_dir.join(format!("{worker}.log"));
    let mut file = std::fs::File::open(&path)
        .map_err(|e| CliError::user(format!("no log file {}: {e}", path.display())))?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| CliError::op(e.to_string()))?;
    let tail_start = content
        .lines()
        .count()
        .saturating_sub(50);
    for line in content.lines().skip(tail_start) {
        println!("{line}");
    }

    if follow {
        let mut offset = file
            .seek(SeekFrom::End(0))
            .map_err(|e| CliError::op(e.to_string()))?;
        loop {
            std::thread::sleep(Duration::from_millis(500));
            let len = std::fs::metadata(&path)
                .map(|m| m.len())
                .unwrap_or(offset);
            if len > offset {
                file.seek(SeekFrom::Start(offset))
                    .map_err(|e| CliError::op(e.to_string()))?;
                let mut chunk = String::new();
                file.read_to_string(&mut chunk)
                    .map_err(|e| CliError::op(e.to_string()))?;
                print!("{chunk}");
                std::io::stdout()
                    .flush()
                    .map_err(|e| CliError::op(e.to_string()))?;
                offset = len;
            }
        }
    }
    Ok(())
}

fn cmd_clean(config: &Config, rest: &[String]) -> Result<(), CliError> {
    let assume_yes = rest.iter().any(|a| a == "--yes");
    if !assume_yes {
        if !interactive() {
            return Err(CliError::user(
                "clean deletes the store and logs; pass --yes to confirm in non-interactive mode",
            ));
        }
        if !confirm(&format!(
            "Delete {} and {}?",
            config.db_path.display(),
            config.log_dir().display()
        ))? {
            println!("nothing deleted");
            return Ok(());
        }
    }

    for suffix in ["", "-wal", "-shm"] {
        let path = PathBuf::from(format!("{}{suffix}", config.db_path.display()));
        match std::fs::remove_file(&path) {
            Ok(()) => println!("removed {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(CliError::op(format!(
                    "cannot remove {}: {err}",
                    path.display()
                )));
            }
        }
    }
    let log_dir = config.log_dir();
    match std::fs::remove_dir_all(&log_dir) {
        Ok(()) => println!("removed {}", log_dir.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(CliError::op(format!(
                "cannot remove {}: {err}",
                log_dir.display()
            )));
        }
    }
    Ok(())
}

fn arg_value<'a>(rest: &'a [String], index: usize, message: &str) -> Result<&'a str, CliError> {
    rest.get(index)
        .map(|s| s.as_str())
        .ok_or_else(|| CliError::user(message))
}

fn truncate(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(i64::MAX as u128) as i64
}

fn fmt_ts(ts_ms: Option<i64>) -> String {
    let Some(ts_ms) = ts_ms else {
        return "-".to_string();
    };
    time::OffsetDateTime::from_unix_timestamp(ts_ms / 1000)
        .ok()
        .and_then(|t| {
            t.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| ts_ms.to_string())
}

fn fmt_age(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn signal_pid(pid: u32, force: bool) {
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
fn signal_pid(_pid: u32, _force: bool) {}

/// Cumulative CPU seconds from /proc; "-" when unavailable.
#[cfg(unix)]
fn cpu_seconds(pid: u32) -> String {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return "-".to_string();
    };
    // Fields after the parenthesised comm; utime and stime are the 14th and
    // 15th overall.
    let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
        return "-".to_string();
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let (Some(utime), Some(stime)) = (
        fields.get(11).and_then(|v| v.parse::<u64>().ok()),
        fields.get(12).and_then(|v| v.parse::<u64>().ok()),
    ) else {
        return "-".to_string();
    };
    format!("{}s", (utime + stime) / 100)
}

#[cfg(not(unix))]
fn cpu_seconds(_pid: u32) -> String {
    "-".to_string()
}

/// Resident set size from /proc/{pid}/statm; "-" when unavailable.
#[cfg(unix)]
fn rss_kb(pid: u32) -> String {
    let Ok(statm) = std::fs::read_to_string(format!("/proc/{pid}/statm")) else {
        return "-".to_string();
    };
    let Some(resident) = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return "-".to_string();
    };
    format!("{}K", resident * 4)
}

#[cfg(not(unix))]
fn rss_kb(_pid: u32) -> String {
    "-".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_bounds_and_flattens() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("line\nbreak", 20), "line break");
        let long = "abcdefghij".repeat(10);
        let cut = truncate(&long, 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn fmt_age_picks_sensible_units() {
        assert_eq!(fmt_age(-5), "0s");
        assert_eq!(fmt_age(42), "42s");
        assert_eq!(fmt_age(125), "2m05s");
        assert_eq!(fmt_age(7380), "2h03m");
    }

    #[test]
    fn fmt_ts_handles_missing_values() {
        assert_eq!(fmt_ts(None), "-");
        let formatted = fmt_ts(Some(1_700_000_000_000));
        assert!(formatted.starts_with("2023-"));
    }
}
