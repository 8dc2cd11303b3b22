//! Executor counters.
//!
//! Plain atomics bumped on the hot path; [`ExecutorMetrics::snapshot`] gives a
//! consistent-enough copy for admin listings and tests.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    submitted: AtomicU64,
    deduplicated: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    rolled_back: AtomicU64,
    failed_permanently: AtomicU64,
    aborted: AtomicU64,
    steps_executed: AtomicU64,
    step_retries: AtomicU64,
    rollback_steps: AtomicU64,
    lock_waits: AtomicU64,
    total_step_time_ms: AtomicU64,
    evicted: AtomicU64,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// A nonce hit returned an existing procedure
    pub fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    /// An invalid request never became a procedure
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step(&self, elapsed: Duration) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        self.total_step_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback_step(&self) {
        self.rollback_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rolled_back(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_permanently(&self) {
        self.failed_permanently.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let steps_executed = self.steps_executed.load(Ordering::Relaxed);
        let total_step_time_ms = self.total_step_time_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            failed_permanently: self.failed_permanently.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            steps_executed,
            step_retries: self.step_retries.load(Ordering::Relaxed),
            rollback_steps: self.rollback_steps.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            avg_step_time_ms: if steps_executed > 0 {
                total_step_time_ms / steps_executed
            } else {
                0
            },
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub deduplicated: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub rolled_back: u64,
    pub failed_permanently: u64,
    pub aborted: u64,
    pub steps_executed: u64,
    pub step_retries: u64,
    pub rollback_steps: u64,
    pub lock_waits: u64,
    pub avg_step_time_ms: u64,
    pub evicted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_averages_step_time() {
        let metrics = ExecutorMetrics::new();
        metrics.record_step(Duration::from_millis(10));
        metrics.record_step(Duration::from_millis(30));
        metrics.record_retry();
        metrics.record_evicted(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.steps_executed, 2);
        assert_eq!(snapshot.avg_step_time_ms, 20);
        assert_eq!(snapshot.step_retries, 1);
        assert_eq!(snapshot.evicted, 3);
        assert_eq!(snapshot.succeeded, 0);
    }
}
