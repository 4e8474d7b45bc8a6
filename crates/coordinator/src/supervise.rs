#![forbid(unsafe_code)]

//! Supervision bookkeeping: per-slot restart budgets and cluster idleness.

use kl_storage::QueueStats;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub(crate) const RESTART_LIMIT: usize = 5;
pub(crate) const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// A slot that restarts `RESTART_LIMIT` times within `RESTART_WINDOW` is
/// disabled; a crash-looping worker must not hammer the queue forever.
#[derive(Debug, Default)]
pub(crate) struct RestartBudget {
    events: VecDeque<Instant>,
}

impl RestartBudget {
    pub(crate) fn record(&mut self, now: Instant) {
        self.events.push_back(now);
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > RESTART_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn exhausted(&self, now: Instant) -> bool {
        self.events
            .iter()
            .filter(|t| now.duration_since(**t) <= RESTART_WINDOW)
            .count()
            >= RESTART_LIMIT
    }
}

/// Tracks the last observed change in queue activity. Activity means the
/// in-progress count moved or the terminal count grew.
#[derive(Debug)]
pub(crate) struct IdleTracker {
    last_activity: Instant,
    last_in_progress: i64,
    last_terminal: i64,
}

impl IdleTracker {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            last_in_progress: 0,
            last_terminal: 0,
        }
    }

    pub(crate) fn observe(&mut self, stats: &QueueStats, now: Instant) {
        let in_progress = stats.claimed + stats.in_progress;
        let terminal = stats.terminal();
        if in_progress != self.last_in_progress || terminal != self.last_terminal {
            self.last_in_progress = in_progress;
            self.last_terminal = terminal;
            self.last_activity = now;
        }
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }
}
