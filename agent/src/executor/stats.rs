use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// Counters for dispatched jobs.
///
/// Durations include admission wait.
#[derive(Debug, Default)]
pub struct JobStats {
    completed: AtomicU64,
    failed: AtomicU64,
    /// Jobs that took longer than the slow-job threshold
    slow: AtomicU64,
    total_time_ms: AtomicU64,
    active: AtomicU64,
}

/// Point-in-time copy of [`JobStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct JobStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub slow: u64,
    pub active: u64,
    pub avg_time_ms: f64,
}

impl JobStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a job as active until the returned guard is dropped.
    pub fn start_job(&self) -> ActiveJob<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveJob { stats: self }
    }

    pub fn record_slow(&self) {
        self.slow.fetch_add(1, Ordering::Relaxed);
    }

    fn add_time(&self, elapsed: Duration) {
        self.total_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn active_jobs(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total_jobs(&self) -> u64 {
        self.completed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> JobStatsSnapshot {
        let total = self.total_jobs();
        let avg_time_ms = if total == 0 {
            0.0
        } else {
            self.total_time_ms.load(Ordering::Relaxed) as f64 / total as f64
        };

        JobStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
            active: self.active_jobs(),
            avg_time_ms,
        }
    }

    /// Log a one-line summary.
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            completed = snapshot.completed,
            failed = snapshot.failed,
            slow = snapshot.slow,
            active = snapshot.active,
            avg_time_ms = format!("{:.2}", snapshot.avg_time_ms),
            "Job statistics"
        );
    }
}

/// A running job. Dropping it without an outcome, as an aborted task does,
/// still takes it off the active count.
#[must_use = "the job stops counting as active when this is dropped"]
pub struct ActiveJob<'a> {
    stats: &'a JobStats,
}

impl ActiveJob<'_> {
    pub fn succeeded(self, elapsed: Duration) {
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.stats.add_time(elapsed);
    }

    pub fn failed(self, elapsed: Duration) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.stats.add_time(elapsed);
    }
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}
