#![forbid(unsafe_code)]

//! Background heartbeat thread. Shares nothing with the main loop except
//! two atomics and its own store connection.

use kl_core::model::WorkerStatus;
use kl_storage::{SqliteStore, StoreError};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// `current_task` of 0 means idle.
pub(crate) fn spawn_heartbeat(
    db_path: PathBuf,
    worker_id: String,
    pid: u32,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    current_task: Arc<AtomicI64>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut store = match SqliteStore::open(&db_path) {
            Ok(store) => store,
            Err(err) => {
                eprintln!("[{worker_id}] heartbeat store unavailable: {err}");
                return;
            }
        };

        let mut next_beat = Instant::now();
        while !shutdown.load(Ordering::Relaxed) {
            if Instant::now() >= next_beat {
                next_beat = Instant::now() + interval;
                let task_id = current_task.load(Ordering::Relaxed);
                let (status, task) = if task_id > 0 {
                    (WorkerStatus::Busy, Some(task_id))
                } else {
                    (WorkerStatus::Idle, None)
                };
                match store.heartbeat(&worker_id, status, task) {
                    Ok(()) => {}
                    Err(StoreError::UnknownWorker(_)) => {
                        // A sweep may have retired this id; re-register so
                        // liveness keeps flowing.
                        if let Err(err) = store.register_worker(&worker_id, pid) {
                            eprintln!("[{worker_id}] heartbeat re-register failed: {err}");
                        }
                    }
                    Err(err) => eprintln!("[{worker_id}] heartbeat failed: {err}"),
                }
            }
            std::thread::sleep(SLEEP_SLICE);
        }
    })
}
