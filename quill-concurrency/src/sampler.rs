//! Once-per-second queue statistics: exponentially weighted moving averages
//! of queue depth, arrival rate, and service time per pool.

use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use quill_core::counters::{CounterSnapshot, TaskCounters};

use crate::pool::WorkerPool;

/// Smoothing weight applied to each new sample.
pub const QUEUE_SAMPLE_WEIGHT: f64 = 0.2;

/// Cadence of the sampler thread.
pub const QUEUE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Moving averages for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QueueEwma {
    /// Smoothed queue depth.
    pub queue_depth: f64,
    /// Smoothed task arrival rate, per second.
    pub arrival_rate_per_sec: f64,
    /// Smoothed mean service time of completed tasks, in milliseconds.
    pub mean_service_millis: f64,
}

/// Moving averages for the three executor pools.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QueueStatistics {
    /// Read pool averages.
    pub read: QueueEwma,
    /// Transaction pool averages.
    pub tx: QueueEwma,
    /// Write pool averages.
    pub write: QueueEwma,
}

struct TrackedPool {
    pool: WorkerPool,
    counters: Arc<TaskCounters>,
    previous: CounterSnapshot,
    ewma: QueueEwma,
}

impl TrackedPool {
    fn new(pool: WorkerPool, counters: Arc<TaskCounters>) -> Self {
        let previous = counters.snapshot();
        Self {
            pool,
            counters,
            previous,
            ewma: QueueEwma::default(),
        }
    }

    fn sample(&mut self, interval: Duration) -> QueueEwma {
        let snapshot = self.counters.snapshot();
        let depth = self.pool.queue_len() as f64;
        let arrivals = snapshot.submitted.saturating_sub(self.previous.submitted) as f64;
        let completions = snapshot.completed.saturating_sub(self.previous.completed);
        let service_nanos = snapshot
            .service_nanos
            .saturating_sub(self.previous.service_nanos);

        self.ewma.queue_depth = fold(self.ewma.queue_depth, depth);
        self.ewma.arrival_rate_per_sec = fold(
            self.ewma.arrival_rate_per_sec,
            arrivals / interval.as_secs_f64(),
        );
        if completions > 0 {
            let mean_millis = service_nanos as f64 / completions as f64 / 1_000_000.0;
            self.ewma.mean_service_millis = fold(self.ewma.mean_service_millis, mean_millis);
        }
        self.previous = snapshot;
        self.ewma
    }
}

fn fold(current: f64, sample: f64) -> f64 {
    QUEUE_SAMPLE_WEIGHT * sample + (1.0 - QUEUE_SAMPLE_WEIGHT) * current
}

/// Single-writer sampler thread. Readers take whole [`QueueStatistics`]
/// snapshots; partially updated averages are never observable.
pub(crate) struct QueueSampler {
    readout: Arc<Mutex<QueueStatistics>>,
    stop: Mutex<mpsc::Sender<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueueSampler {
    pub(crate) fn spawn(
        read: (WorkerPool, Arc<TaskCounters>),
        tx: (WorkerPool, Arc<TaskCounters>),
        write: (WorkerPool, Arc<TaskCounters>),
        interval: Duration,
    ) -> Self {
        let readout = Arc::new(Mutex::new(QueueStatistics::default()));
        let (stop, ticker) = mpsc::channel::<()>();
        let worker_readout = Arc::clone(&readout);
        let worker = thread::Builder::new()
            .name("quill-queue-sampler".to_owned())
            .spawn(move || {
                let mut read = TrackedPool::new(read.0, read.1);
                let mut tx = TrackedPool::new(tx.0, tx.1);
                let mut write = TrackedPool::new(write.0, write.1);
                loop {
                    match ticker.recv_timeout(interval) {
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                    let statistics = QueueStatistics {
                        read: read.sample(interval),
                        tx: tx.sample(interval),
                        write: write.sample(interval),
                    };
                    let mut readout = worker_readout
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    *readout = statistics;
                }
            })
            .ok();
        Self {
            readout,
            stop: Mutex::new(stop),
            worker: Mutex::new(worker),
        }
    }

    pub(crate) fn readout(&self) -> QueueStatistics {
        *self.readout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn stop(&self) {
        let _ = self
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(());
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}
