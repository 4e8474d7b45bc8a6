#![forbid(unsafe_code)]

use super::*;
use kl_core::model::VerificationReport;
use kl_storage::SqliteStore;
use std::path::PathBuf;

fn temp_root(prefix: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("{prefix}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn test_config(root: &Path) -> Config {
    Config {
        project_name: "test".to_string(),
        project_root: root.to_path_buf(),
        db_path: root.join(".klauss").join("test_tasks.db"),
        allow_external_dirs: false,
        worker_count: 2,
        idle_timeout: Duration::from_secs(300),
        heartbeat_interval: Duration::from_secs(5),
        auto_start_workers: None,
    }
}

fn success_outcome() -> TaskOutcome {
    TaskOutcome::Success {
        stdout: "made the thing".to_string(),
        stderr: String::new(),
        exit_code: 0,
        verification: VerificationReport::passed_empty(),
    }
}

/// Plays the worker side against the same store file.
fn complete_all_pending(db_path: &Path, worker_id: &str) {
    let mut store = SqliteStore::open(db_path).expect("open worker store");
    while let Some(task) = store.claim_task(worker_id).expect("claim") {
        store.start_task(task.id, worker_id).expect("start");
        store
            .complete_task(task.id, worker_id, &success_outcome())
            .expect("complete");
    }
}

#[test]
fn boundary_violations_are_rejected_synchronously() {
    let root = temp_root("kl_orch_boundary");
    let mut orch = Orchestrator::open(test_config(&root)).expect("open");
    let job = orch.create_job("boundary test").expect("job");

    let inside = orch.add_subtask(
        &job,
        SubtaskSpec::new("inside").working_dir(root.join("src").display().to_string()),
    );
    assert!(inside.is_ok());

    let outside = orch.add_subtask(
        &job,
        SubtaskSpec::new("outside").working_dir("/definitely/elsewhere"),
    );
    assert!(matches!(
        outside,
        Err(OrchestratorError::BoundaryViolation { .. })
    ));

    // Walking out of the root with `..` is just as outside.
    let escape = orch.add_subtask(
        &job,
        SubtaskSpec::new("escape").working_dir(
            root.join("src")
                .join("..")
                .join("..")
                .join("etc")
                .display()
                .to_string(),
        ),
    );
    assert!(matches!(
        escape,
        Err(OrchestratorError::BoundaryViolation { .. })
    ));

    // Nothing was queued for the rejected task.
    let progress = orch.job_status(&job).expect("status");
    assert_eq!(progress.total, 1);

    let mut permissive_config = test_config(&root);
    permissive_config.allow_external_dirs = true;
    let mut permissive = Orchestrator::open(permissive_config).expect("open permissive");
    assert!(
        permissive
            .add_subtask(
                &job,
                SubtaskSpec::new("outside ok").working_dir("/definitely/elsewhere"),
            )
            .is_ok()
    );
}

#[test]
fn wait_and_collect_returns_results_once_terminal() {
    let root = temp_root("kl_orch_collect");
    let config = test_config(&root);
    let db_path = config.db_path.clone();
    let mut orch = Orchestrator::open(config).expect("open");

    let job = orch.create_job("collect results").expect("job");
    let first = orch
        .add_subtask(&job, SubtaskSpec::new("first").priority(5))
        .expect("first");
    let second = orch
        .add_subtask(
            &job,
            SubtaskSpec::new("second").priority(9).depends_on([first]),
        )
        .expect("second");

    complete_all_pending(&db_path, "sim_worker");

    let results = orch
        .wait_and_collect(
            &job,
            &WaitOptions {
                poll: Duration::from_millis(10),
                timeout: Some(Duration::from_secs(5)),
                show_progress: false,
            },
        )
        .expect("collect");

    assert_eq!(results.len(), 2);
    assert_eq!(results[&first].status, TaskStatus::Completed);
    assert_eq!(results[&second].status, TaskStatus::Completed);
    assert!(matches!(
        results[&first].result,
        Some(TaskOutcome::Success { .. })
    ));

    assert_eq!(orch.job_final_status(&job).expect("final"), JobStatus::Completed);
}

#[test]
fn retry_resets_failed_tasks_in_place() {
    let root = temp_root("kl_orch_retry");
    let config = test_config(&root);
    let db_path = config.db_path.clone();
    let mut orch = Orchestrator::open(config).expect("open");

    let job = orch.create_job("retry job").expect("job");
    let id = orch
        .add_subtask(&job, SubtaskSpec::new("fragile"))
        .expect("add");

    {
        let mut worker = SqliteStore::open(&db_path).expect("open worker store");
        let task = worker.claim_task("sim_worker").expect("claim").expect("task");
        assert_eq!(task.id, id);
        worker.start_task(id, "sim_worker").expect("start");
        worker
            .fail_task(id, "sim_worker", "flaky network")
            .expect("fail");
    }

    let failed = orch.failed_tasks(&job).expect("failed");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("flaky network"));

    let retried = orch.retry_failed_tasks(&job).expect("retry");
    assert_eq!(retried, vec![id]);

    let progress = orch.job_status(&job).expect("status");
    assert_eq!(progress.pending, 1);
    assert_eq!(progress.failed, 0);
}

#[test]
fn hierarchical_subtasks_share_a_parent() {
    let root = temp_root("kl_orch_parent");
    let config = test_config(&root);
    let db_path = config.db_path.clone();
    let mut orch = Orchestrator::open(config).expect("open");

    let job = orch.create_job("hierarchy").expect("job");
    let parent = orch
        .add_subtask(&job, SubtaskSpec::new("plan the work"))
        .expect("parent");
    let children = orch
        .add_subtasks_under(
            &job,
            parent,
            vec![SubtaskSpec::new("part one"), SubtaskSpec::new("part two")],
        )
        .expect("children");
    assert_eq!(children.len(), 2);

    let mut store = SqliteStore::open(&db_path).expect("open check store");
    for id in children {
        let task = store.get_task(id).expect("get");
        assert_eq!(task.parent_task_id, Some(parent));
        // Grouping does not gate scheduling.
        assert!(task.depends_on.is_empty());
    }
}

#[test]
fn synthesize_results_is_a_pure_formatter() {
    let mut results = BTreeMap::new();
    results.insert(
        1,
        CollectedTask {
            task_id: 1,
            prompt: "build the api".to_string(),
            status: TaskStatus::Completed,
            working_dir: Some("/tmp/project".to_string()),
            expected_outputs: vec!["api.rs".to_string()],
            result: Some(success_outcome()),
            error: None,
        },
    );
    results.insert(
        2,
        CollectedTask {
            task_id: 2,
            prompt: "break the api".to_string(),
            status: TaskStatus::Failed,
            working_dir: None,
            expected_outputs: Vec::new(),
            result: None,
            error: Some("verification failed".to_string()),
        },
    );

    let first = synthesize_results(&results, Some("summarize the outcome"));
    let second = synthesize_results(&results, Some("summarize the outcome"));
    assert_eq!(first, second);

    assert!(first.contains("Summary: 1 completed, 1 failed"));
    assert!(first.contains("COMPLETED TASKS"));
    assert!(first.contains("Task 1: build the api"));
    assert!(first.contains("FAILED TASKS"));
    assert!(first.contains("Error: verification failed"));
    assert!(first.contains("SYNTHESIS REQUEST"));
    assert!(first.contains("summarize the outcome"));

    let empty = synthesize_results(&BTreeMap::new(), None);
    assert!(empty.contains("Summary: 0 completed, 0 failed"));
    assert!(!empty.contains("SYNTHESIS REQUEST"));
}
