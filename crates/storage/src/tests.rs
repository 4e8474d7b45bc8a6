#![forbid(unsafe_code)]

use crate::{LogFilter, LogLevel, NewTask, SqliteStore, StoreError};
use kl_core::model::{JobStatus, TaskOutcome, TaskStatus, VerificationHook, VerificationReport, WorkerStatus};
use std::path::PathBuf;

fn temp_db(prefix: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("{prefix}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir.join("tasks.db")
}

fn open_store(prefix: &str) -> SqliteStore {
    SqliteStore::open(temp_db(prefix)).expect("open store")
}

fn success_outcome() -> TaskOutcome {
    TaskOutcome::Success {
        stdout: "done".to_string(),
        stderr: String::new(),
        exit_code: 0,
        verification: VerificationReport::passed_empty(),
    }
}

fn set_heartbeat(store: &mut SqliteStore, worker_id: &str, ts_ms: i64) {
    store
        .conn
        .execute(
            "UPDATE workers SET last_heartbeat_ms=?2 WHERE worker_id=?1",
            rusqlite::params![worker_id, ts_ms],
        )
        .expect("backdate heartbeat");
}

#[test]
fn add_then_get_round_trips_input_fields() {
    let mut store = open_store("kl_store_roundtrip");
    let dep = store.add_task(NewTask::new("dep")).expect("add dep");
    let job = store.create_job("round trip").expect("create job");

    let mut new = NewTask::new("build the parser");
    new.working_dir = Some("/tmp/project".to_string());
    new.context_files = vec!["src/lib.rs".to_string(), "README.md".to_string()];
    new.expected_outputs = vec!["src/parser.rs".to_string()];
    new.verification_hooks = vec![VerificationHook::new("cargo check", "Rust check")];
    new.auto_verify = false;
    new.metadata = Some(serde_json::json!({"timeout_seconds": 60}));
    new.priority = 7;
    new.job_id = Some(job.job_id.clone());
    new.parent_task_id = Some(dep);
    new.depends_on = vec![dep];

    let id = store.add_task(new.clone()).expect("add task");
    let task = store.get_task(id).expect("get task");

    assert_eq!(task.prompt, new.prompt);
    assert_eq!(task.working_dir, new.working_dir);
    assert_eq!(task.context_files, new.context_files);
    assert_eq!(task.expected_outputs, new.expected_outputs);
    assert_eq!(task.verification_hooks, new.verification_hooks);
    assert!(!task.auto_verify);
    assert_eq!(task.metadata, new.metadata);
    assert_eq!(task.priority, 7);
    assert_eq!(task.job_id.as_deref(), Some(job.job_id.as_str()));
    assert_eq!(task.parent_task_id, Some(dep));
    assert_eq!(task.depends_on, vec![dep]);
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.worker_id.is_none());
    assert!(task.result.is_none());
    assert!(task.error.is_none());
}

#[test]
fn add_task_validates_references_and_priority() {
    let mut store = open_store("kl_store_validate");

    let missing = store.add_task({
        let mut t = NewTask::new("depends on nothing yet");
        t.depends_on = vec![999];
        t
    });
    assert!(matches!(missing, Err(StoreError::UnknownTask(999))));

    let negative = store.add_task({
        let mut t = NewTask::new("negative");
        t.priority = -1;
        t
    });
    assert!(matches!(negative, Err(StoreError::InvalidInput(_))));

    let empty = store.add_task(NewTask::new("   "));
    assert!(matches!(empty, Err(StoreError::InvalidInput(_))));

    let unknown_job = store.add_task({
        let mut t = NewTask::new("orphan");
        t.job_id = Some("job_does_not_exist".to_string());
        t
    });
    assert!(matches!(unknown_job, Err(StoreError::UnknownJob(_))));

    // Rejecting unknown ids also covers "depends_on = [predicted next id]":
    // the id does not exist at validation time.
    let next_id_guess = store.add_task({
        let mut t = NewTask::new("self-referential");
        t.depends_on = vec![100];
        t
    });
    assert!(matches!(next_id_guess, Err(StoreError::UnknownTask(100))));
}

#[test]
fn add_dependency_rejects_cycles() {
    let mut store = open_store("kl_store_cycles");
    let a = store.add_task(NewTask::new("a")).expect("a");
    let b = store.add_task(NewTask::new("b")).expect("b");
    let c = store.add_task(NewTask::new("c")).expect("c");

    store.add_dependency(b, a).expect("b depends on a");
    store.add_dependency(c, b).expect("c depends on b");

    // Closing the loop a -> c must be rejected and leave the queue unchanged.
    let cycle = store.add_dependency(a, c);
    assert!(matches!(cycle, Err(StoreError::DependencyCycle { .. })));
    assert!(store.get_task(a).expect("a").depends_on.is_empty());

    let self_cycle = store.add_dependency(a, a);
    assert!(matches!(self_cycle, Err(StoreError::DependencyCycle { .. })));

    // Duplicate edges are a no-op.
    store.add_dependency(b, a).expect("duplicate edge");
    assert_eq!(store.get_task(b).expect("b").depends_on, vec![a]);
}

#[test]
fn claim_respects_priority_then_fifo() {
    let mut store = open_store("kl_store_priority");
    let a = store
        .add_task({
            let mut t = NewTask::new("a");
            t.priority = 1;
            t
        })
        .expect("a");
    let b = store
        .add_task({
            let mut t = NewTask::new("b");
            t.priority = 10;
            t
        })
        .expect("b");
    let c = store
        .add_task({
            let mut t = NewTask::new("c");
            t.priority = 5;
            t
        })
        .expect("c");

    let mut order = Vec::new();
    for _ in 0..3 {
        let task = store
            .claim_task("worker_1")
            .expect("claim")
            .expect("task available");
        order.push(task.id);
    }
    assert_eq!(order, vec![b, c, a]);
}

#[test]
fn equal_priority_claims_in_insertion_order() {
    let mut store = open_store("kl_store_fifo");
    let first = store.add_task(NewTask::new("first")).expect("first");
    let second = store.add_task(NewTask::new("second")).expect("second");

    let got = store
        .claim_task("worker_1")
        .expect("claim")
        .expect("task available");
    assert_eq!(got.id, first);
    let got = store
        .claim_task("worker_1")
        .expect("claim")
        .expect("task available");
    assert_eq!(got.id, second);
}

#[test]
fn claim_gates_on_dependencies() {
    let mut store = open_store("kl_store_deps");
    let a = store
        .add_task({
            let mut t = NewTask::new("a");
            t.priority = 5;
            t
        })
        .expect("a");
    let b = store
        .add_task({
            let mut t = NewTask::new("b");
            t.priority = 10;
            t.depends_on = vec![a];
            t
        })
        .expect("b");
    let c = store
        .add_task({
            let mut t = NewTask::new("c");
            t.priority = 10;
            t.depends_on = vec![a];
            t
        })
        .expect("c");

    // B and C have higher priority but are not ready; A is claimed first.
    let claimed = store
        .claim_task("worker_1")
        .expect("claim")
        .expect("task available");
    assert_eq!(claimed.id, a);
    assert!(store.claim_task("worker_2").expect("claim").is_none());

    store.start_task(a, "worker_1").expect("start a");
    store
        .complete_task(a, "worker_1", &success_outcome())
        .expect("complete a");

    let next = store
        .claim_task("worker_1")
        .expect("claim")
        .expect("b ready");
    assert_eq!(next.id, b);
    let next = store
        .claim_task("worker_2")
        .expect("claim")
        .expect("c ready");
    assert_eq!(next.id, c);
}

#[test]
fn failed_dependency_does_not_unlock_dependents() {
    let mut store = open_store("kl_store_failed_dep");
    let a = store.add_task(NewTask::new("a")).expect("a");
    let b = store
        .add_task({
            let mut t = NewTask::new("b");
            t.depends_on = vec![a];
            t
        })
        .expect("b");

    let claimed = store
        .claim_task("worker_1")
        .expect("claim")
        .expect("a available");
    assert_eq!(claimed.id, a);
    store.start_task(a, "worker_1").expect("start");
    store.fail_task(a, "worker_1", "boom").expect("fail");

    assert!(store.claim_task("worker_1").expect("claim").is_none());
    let _ = b;
}

#[test]
fn claim_from_empty_queue_returns_none() {
    let mut store = open_store("kl_store_empty");
    assert!(store.claim_task("worker_1").expect("claim").is_none());
}

#[test]
fn claim_records_ownership() {
    let mut store = open_store("kl_store_ownership");
    store.register_worker("worker_1", 42).expect("register");
    let id = store.add_task(NewTask::new("task")).expect("add");

    let task = store
        .claim_task("worker_1")
        .expect("claim")
        .expect("task available");
    assert_eq!(task.id, id);
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.worker_id.as_deref(), Some("worker_1"));
    assert!(task.claimed_at_ms.is_some());

    let workers = store.list_workers().expect("list workers");
    assert_eq!(workers[0].current_task_id, Some(id));
    assert_eq!(workers[0].status, WorkerStatus::Busy);
}

#[test]
fn concurrent_claims_never_share_a_task() {
    let db = temp_db("kl_store_concurrent");
    let mut first = SqliteStore::open(&db).expect("open first");
    let mut second = SqliteStore::open(&db).expect("open second");

    first.add_task(NewTask::new("one")).expect("one");
    first.add_task(NewTask::new("two")).expect("two");

    let a = first
        .claim_task("worker_1")
        .expect("claim")
        .expect("task available");
    let b = second
        .claim_task("worker_2")
        .expect("claim")
        .expect("task available");
    assert_ne!(a.id, b.id);
    assert!(second.claim_task("worker_2").expect("claim").is_none());
}

#[test]
fn start_requires_the_claiming_worker() {
    let mut store = open_store("kl_store_start_owner");
    let id = store.add_task(NewTask::new("task")).expect("add");
    let claimed = store
        .claim_task("worker_1")
        .expect("claim")
        .expect("task available");
    assert_eq!(claimed.id, id);

    let stolen = store.start_task(id, "worker_2");
    assert!(matches!(stolen, Err(StoreError::NotOwned { .. })));

    store.start_task(id, "worker_1").expect("start");
    let task = store.get_task(id).expect("get");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.started_at_ms.is_some());
}

#[test]
fn complete_sets_result_and_clears_worker_binding() {
    let mut store = open_store("kl_store_complete");
    let id = store.add_task(NewTask::new("task")).expect("add");
    store.claim_task("worker_1").expect("claim").expect("task");
    store.start_task(id, "worker_1").expect("start");
    store
        .complete_task(id, "worker_1", &success_outcome())
        .expect("complete");

    let task = store.get_task(id).expect("get");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.worker_id.is_none());
    assert!(task.result.is_some());
    assert!(task.error.is_none());
    assert!(task.completed_at_ms.is_some());

    // Terminal stability: no further transitions without an explicit reset.
    let again = store.start_task(id, "worker_1");
    assert!(matches!(again, Err(StoreError::InvalidTransition { .. })));
}

#[test]
fn fail_then_reset_restores_a_clean_pending_task() {
    let mut store = open_store("kl_store_reset");
    let id = store.add_task(NewTask::new("task")).expect("add");
    store.claim_task("worker_1").expect("claim").expect("task");
    store.start_task(id, "worker_1").expect("start");
    store
        .fail_task(id, "worker_1", "executor exited 1")
        .expect("fail");

    let failed = store.get_task(id).expect("get");
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("executor exited 1"));
    assert!(failed.result.is_none());
    assert!(failed.worker_id.is_none());

    store.reset_task(id).expect("reset");
    let reset = store.get_task(id).expect("get");
    assert_eq!(reset.id, id);
    assert_eq!(reset.status, TaskStatus::Pending);
    assert!(reset.worker_id.is_none());
    assert!(reset.claimed_at_ms.is_none());
    assert!(reset.started_at_ms.is_none());
    assert!(reset.completed_at_ms.is_none());
    assert!(reset.error.is_none());
    assert!(reset.result.is_none());
}

#[test]
fn reset_only_applies_to_failed_tasks() {
    let mut store = open_store("kl_store_reset_guard");
    let id = store.add_task(NewTask::new("task")).expect("add");
    let pending = store.reset_task(id);
    assert!(matches!(
        pending,
        Err(StoreError::InvalidTransition { .. })
    ));
    assert!(matches!(
        store.reset_task(999),
        Err(StoreError::UnknownTask(999))
    ));
}

#[test]
fn sweep_reclaims_tasks_from_stale_workers() {
    let mut store = open_store("kl_store_sweep");
    store.register_worker("worker_1", 100).expect("register");
    let id = store.add_task(NewTask::new("task")).expect("add");
    store.claim_task("worker_1").expect("claim").expect("task");
    store.start_task(id, "worker_1").expect("start");

    // Heartbeat far in the past; threshold 15s.
    set_heartbeat(&mut store, "worker_1", 1_000);
    let reset = store.sweep_stale(15_000).expect("sweep");
    assert_eq!(reset, vec![id]);

    let task = store.get_task(id).expect("get");
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.worker_id.is_none());
    assert!(task.claimed_at_ms.is_none());
    assert!(task.started_at_ms.is_none());

    let workers = store.list_workers().expect("list");
    assert_eq!(workers[0].status, WorkerStatus::Stopped);

    // The reclaimed task is claimable by a fresh worker.
    let reclaimed = store
        .claim_task("worker_2")
        .expect("claim")
        .expect("task available");
    assert_eq!(reclaimed.id, id);
}

#[test]
fn sweep_leaves_live_workers_alone() {
    let mut store = open_store("kl_store_sweep_live");
    store.register_worker("worker_1", 100).expect("register");
    let id = store.add_task(NewTask::new("task")).expect("add");
    store.claim_task("worker_1").expect("claim").expect("task");
    store
        .heartbeat("worker_1", WorkerStatus::Busy, Some(id))
        .expect("heartbeat");

    let reset = store.sweep_stale(15_000).expect("sweep");
    assert!(reset.is_empty());
    assert_eq!(store.get_task(id).expect("get").status, TaskStatus::Claimed);
}

#[test]
fn stats_count_by_status() {
    let mut store = open_store("kl_store_stats");
    let a = store.add_task(NewTask::new("a")).expect("a");
    let b = store.add_task(NewTask::new("b")).expect("b");
    store.add_task(NewTask::new("c")).expect("c");

    store.claim_task("worker_1").expect("claim").expect("a");
    store.start_task(a, "worker_1").expect("start");
    store
        .complete_task(a, "worker_1", &success_outcome())
        .expect("complete");

    store.claim_task("worker_1").expect("claim").expect("b");
    store.start_task(b, "worker_1").expect("start");
    store.fail_task(b, "worker_1", "nope").expect("fail");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.claimed, 0);
    assert_eq!(stats.in_progress, 0);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.active(), 1);
    assert_eq!(stats.terminal(), 2);
}

#[test]
fn list_ready_orders_like_the_claimer() {
    let mut store = open_store("kl_store_ready");
    let low = store
        .add_task({
            let mut t = NewTask::new("low");
            t.priority = 1;
            t
        })
        .expect("low");
    let high = store
        .add_task({
            let mut t = NewTask::new("high");
            t.priority = 9;
            t
        })
        .expect("high");
    let blocked = store
        .add_task({
            let mut t = NewTask::new("blocked");
            t.priority = 20;
            t.depends_on = vec![low];
            t
        })
        .expect("blocked");

    let ready: Vec<i64> = store
        .list_ready()
        .expect("list ready")
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![high, low]);
    let _ = blocked;
}

#[test]
fn shared_context_overlays_job_scope_over_global() {
    let mut store = open_store("kl_store_context");
    let job = store.create_job("context job").expect("job");

    store
        .set_shared_context("css_imports", "use modules", None)
        .expect("global");
    store
        .set_shared_context("api_style", "rest", None)
        .expect("global 2");
    store
        .set_shared_context("api_style", "grpc", Some(job.job_id.as_str()))
        .expect("job scoped");

    let global = store.shared_context(None).expect("global read");
    assert_eq!(global.get("api_style").map(String::as_str), Some("rest"));

    let merged = store
        .shared_context(Some(job.job_id.as_str()))
        .expect("merged read");
    assert_eq!(merged.get("api_style").map(String::as_str), Some("grpc"));
    assert_eq!(
        merged.get("css_imports").map(String::as_str),
        Some("use modules")
    );

    // Last write wins in place.
    store
        .set_shared_context("css_imports", "plain css", None)
        .expect("update");
    let global = store.shared_context(None).expect("global read");
    assert_eq!(
        global.get("css_imports").map(String::as_str),
        Some("plain css")
    );

    assert!(
        store
            .delete_shared_context("api_style", Some(job.job_id.as_str()))
            .expect("delete")
    );
    let merged = store
        .shared_context(Some(job.job_id.as_str()))
        .expect("merged read");
    assert_eq!(merged.get("api_style").map(String::as_str), Some("rest"));
}

#[test]
fn worker_registry_tracks_heartbeats() {
    let mut store = open_store("kl_store_workers");
    store.register_worker("worker_1", 4242).expect("register");

    let unknown = store.heartbeat("ghost", WorkerStatus::Idle, None);
    assert!(matches!(unknown, Err(StoreError::UnknownWorker(_))));

    store
        .heartbeat("worker_1", WorkerStatus::Busy, Some(7))
        .expect("heartbeat");
    let workers = store.list_workers().expect("list");
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].pid, 4242);
    assert_eq!(workers[0].status, WorkerStatus::Busy);
    assert_eq!(workers[0].current_task_id, Some(7));

    assert_eq!(store.live_worker_count(15_000).expect("live"), 1);
    set_heartbeat(&mut store, "worker_1", 1_000);
    assert_eq!(store.live_worker_count(15_000).expect("live"), 0);

    store.mark_worker_stopped("worker_1").expect("stop");
    let workers = store.list_workers().expect("list");
    assert_eq!(workers[0].status, WorkerStatus::Stopped);
}

#[test]
fn job_status_derives_from_task_states() {
    let mut store = open_store("kl_store_jobs");
    let job = store.create_job("derive status").expect("job");
    assert!(job.job_id.starts_with("job_"));

    assert!(matches!(
        store.job_stats("job_unknown"),
        Err(StoreError::UnknownJob(_))
    ));

    let a = store
        .add_task({
            let mut t = NewTask::new("a");
            t.job_id = Some(job.job_id.clone());
            t
        })
        .expect("a");
    let b = store
        .add_task({
            let mut t = NewTask::new("b");
            t.job_id = Some(job.job_id.clone());
            t
        })
        .expect("b");

    assert_eq!(store.finalize_job(&job.job_id).expect("finalize"), JobStatus::Running);

    store.claim_task("worker_1").expect("claim").expect("a");
    store.start_task(a, "worker_1").expect("start");
    store
        .complete_task(a, "worker_1", &success_outcome())
        .expect("complete");

    store.claim_task("worker_1").expect("claim").expect("b");
    store.start_task(b, "worker_1").expect("start");
    store.fail_task(b, "worker_1", "broken").expect("fail");

    let stats = store.job_stats(&job.job_id).expect("stats");
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(store.finalize_job(&job.job_id).expect("finalize"), JobStatus::Failed);

    // A retry brings the job back to running; after success it completes.
    store.reset_task(b).expect("reset");
    assert_eq!(store.finalize_job(&job.job_id).expect("finalize"), JobStatus::Running);
    store.claim_task("worker_1").expect("claim").expect("b");
    store.start_task(b, "worker_1").expect("start");
    store
        .complete_task(b, "worker_1", &success_outcome())
        .expect("complete");
    assert_eq!(
        store.finalize_job(&job.job_id).expect("finalize"),
        JobStatus::Completed
    );
    let row = store.get_job(&job.job_id).expect("get job");
    assert!(row.completed_at_ms.is_some());
}

#[test]
fn worker_logs_filter_and_surface_recent_activity() {
    let mut store = open_store("kl_store_logs");
    store.register_worker("worker_1", 1).expect("register");
    let id = store.add_task(NewTask::new("task")).expect("add");
    store.claim_task("worker_1").expect("claim").expect("task");

    store
        .log_progress("worker_1", Some(id), LogLevel::Info, "claimed task")
        .expect("log");
    store
        .log_progress("worker_1", Some(id), LogLevel::Info, "running executor")
        .expect("log");
    store
        .log_progress("worker_2", None, LogLevel::Warning, "no tasks visible")
        .expect("log");

    let all = store.worker_logs(&LogFilter::default()).expect("all logs");
    assert_eq!(all.len(), 3);

    let scoped = store
        .worker_logs(&LogFilter {
            worker_id: Some("worker_1".to_string()),
            task_id: Some(id),
            limit: Some(10),
        })
        .expect("scoped");
    assert_eq!(scoped.len(), 2);
    assert_eq!(scoped[0].message, "running executor");

    let progress = store.active_progress().expect("progress");
    let row = progress
        .iter()
        .find(|r| r.worker_id == "worker_1")
        .expect("worker_1 row");
    assert_eq!(row.current_task_id, Some(id));
    assert_eq!(row.task_prompt.as_deref(), Some("task"));
    assert_eq!(row.recent_log.as_deref(), Some("running executor"));
}
