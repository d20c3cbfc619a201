//! Atomic per-pool task counters and their consistent snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Hot-path counters maintained by one executor pool. Writers increment with
/// relaxed atomics; the sampler and `counters()` read through [`snapshot`].
///
/// [`snapshot`]: TaskCounters::snapshot
#[derive(Debug, Default)]
pub struct TaskCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    queue_nanos: AtomicU64,
    service_nanos: AtomicU64,
}

impl TaskCounters {
    /// Counts one admitted task.
    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Accumulates the time one task spent between admission and execution
    /// start.
    pub fn record_queue_wait(&self, waited: Duration) {
        self.queue_nanos
            .fetch_add(clamped_nanos(waited), Ordering::Relaxed);
    }

    /// Counts one successful completion with its execution time.
    pub fn record_success(&self, service: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.service_nanos
            .fetch_add(clamped_nanos(service), Ordering::Relaxed);
    }

    /// Counts one failed or cancelled task.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters into one snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queue_nanos: self.queue_nanos.load(Ordering::Relaxed),
            service_nanos: self.service_nanos.load(Ordering::Relaxed),
        }
    }
}

fn clamped_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Point-in-time copy of one pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Tasks admitted to the pool.
    pub submitted: u64,
    /// Tasks completed successfully.
    pub completed: u64,
    /// Tasks that failed or were cancelled.
    pub failed: u64,
    /// Total time tasks spent queued between admission and execution start.
    pub queue_nanos: u64,
    /// Total execution time of completed tasks.
    pub service_nanos: u64,
}

impl CounterSnapshot {
    /// Mean service time over completed tasks, when any completed.
    #[must_use]
    pub fn mean_service(&self) -> Option<Duration> {
        if self.completed == 0 {
            return None;
        }
        Some(Duration::from_nanos(self.service_nanos / self.completed))
    }
}
