//! Worker pools: one abstraction covering the handoff (cached), fixed, and
//! bounded-growth shapes the three executors need.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use quill_common::error::{QuillError, QuillResult};

/// Work unit executed by a pool worker.
pub type Job = Box<dyn FnOnce() + Send>;

/// Queue discipline of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// No queueing: every submission needs an idle worker or spawns a new
    /// one. Used by the unbounded read/tx pools.
    Handoff,
    /// Array-backed queue of fixed depth. Overflow spawns workers up to the
    /// pool maximum, then rejects.
    Bounded(usize),
    /// Linked queue without a depth limit. Worker count stays at the core
    /// size.
    Unbounded,
}

/// Shape of one worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread-name prefix of the pool's workers.
    pub name: &'static str,
    /// Minimum resident workers.
    pub core_size: usize,
    /// Upper bound on workers.
    pub max_size: usize,
    /// Idle time after which workers beyond the core size exit.
    pub keep_alive: Duration,
    /// Queue discipline.
    pub queue: QueueKind,
}

impl PoolConfig {
    /// Unbounded handoff pool: workers spawn on demand and are culled after
    /// `keep_alive` idle time.
    #[must_use]
    pub fn handoff(name: &'static str, keep_alive: Duration) -> Self {
        Self {
            name,
            core_size: 0,
            max_size: usize::MAX,
            keep_alive,
            queue: QueueKind::Handoff,
        }
    }

    /// Fixed pool of `size` resident workers over an unbounded queue.
    #[must_use]
    pub fn fixed(name: &'static str, size: usize) -> Self {
        Self {
            name,
            core_size: size,
            max_size: size,
            keep_alive: Duration::from_millis(60_000),
            queue: QueueKind::Unbounded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolPhase {
    Running,
    Draining,
    Halted,
}

struct PoolState {
    queue: VecDeque<Job>,
    workers: usize,
    idle: usize,
    phase: PoolPhase,
    spawned_total: u64,
}

struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    work_changed: Condvar,
    terminated: Condvar,
}

/// Multi-producer worker pool over one shared queue. Clones share the pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.config.name)
            .field("workers", &state.workers)
            .field("idle", &state.idle)
            .field("queued", &state.queue.len())
            .field("phase", &state.phase)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates the pool. Workers spawn lazily unless
    /// [`WorkerPool::prestart_core`] is called.
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    phase: PoolPhase::Running,
                    spawned_total: 0,
                }),
                work_changed: Condvar::new(),
                terminated: Condvar::new(),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits one job.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::Rejected` after shutdown, when a bounded queue
    /// is full and the pool is at its maximum size, or when the OS refuses a
    /// worker thread.
    pub fn submit(&self, job: Job) -> QuillResult<()> {
        let mut state = self.lock_state();
        if state.phase != PoolPhase::Running {
            return Err(QuillError::Rejected("pool is shut down"));
        }
        match self.shared.config.queue {
            QueueKind::Handoff => {
                if state.idle > 0 {
                    state.queue.push_back(job);
                    drop(state);
                    self.shared.work_changed.notify_one();
                } else {
                    Self::spawn_worker(&self.shared, &mut state, Some(job))?;
                }
            }
            QueueKind::Unbounded => {
                if state.workers < self.shared.config.core_size {
                    Self::spawn_worker(&self.shared, &mut state, Some(job))?;
                } else {
                    state.queue.push_back(job);
                    if state.workers == 0 {
                        Self::spawn_worker(&self.shared, &mut state, None)?;
                    }
                    drop(state);
                    self.shared.work_changed.notify_one();
                }
            }
            QueueKind::Bounded(capacity) => {
                if state.workers < self.shared.config.core_size {
                    Self::spawn_worker(&self.shared, &mut state, Some(job))?;
                } else if state.queue.len() < capacity {
                    state.queue.push_back(job);
                    if state.workers == 0 && self.shared.config.max_size > 0 {
                        Self::spawn_worker(&self.shared, &mut state, None)?;
                    }
                    drop(state);
                    self.shared.work_changed.notify_one();
                } else if state.workers < self.shared.config.max_size {
                    Self::spawn_worker(&self.shared, &mut state, Some(job))?;
                } else {
                    return Err(QuillError::Rejected("pool queue overflow"));
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(
        shared: &Arc<PoolShared>,
        state: &mut PoolState,
        initial: Option<Job>,
    ) -> QuillResult<()> {
        state.workers += 1;
        state.spawned_total += 1;
        let ordinal = state.spawned_total;
        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-{ordinal}", shared.config.name))
            .spawn(move || worker_main(&worker_shared, initial));
        if spawned.is_err() {
            state.workers -= 1;
            return Err(QuillError::Rejected("worker thread spawn failed"));
        }
        Ok(())
    }

    /// Eagerly spawns workers up to the core size.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::Rejected` when the OS refuses a worker thread.
    pub fn prestart_core(&self) -> QuillResult<()> {
        let mut state = self.lock_state();
        while state.workers < self.shared.config.core_size {
            Self::spawn_worker(&self.shared, &mut state, None)?;
        }
        Ok(())
    }

    /// Current queue depth.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Depth and capacity of a bounded queue; `None` for other disciplines.
    #[must_use]
    pub fn queue_fill(&self) -> Option<(usize, usize)> {
        match self.shared.config.queue {
            QueueKind::Bounded(capacity) => Some((self.lock_state().queue.len(), capacity)),
            QueueKind::Handoff | QueueKind::Unbounded => None,
        }
    }

    /// Current worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.lock_state().workers
    }

    /// Begins an orderly shutdown: queued jobs still run, new submissions
    /// are rejected, and workers exit once the queue drains.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        if state.phase == PoolPhase::Running {
            state.phase = PoolPhase::Draining;
        }
        drop(state);
        self.shared.work_changed.notify_all();
        self.shared.terminated.notify_all();
    }

    /// Halts the pool immediately. Queued jobs are returned undone; dropping
    /// them resolves their tickets as cancelled.
    pub fn shutdown_now(&self) -> Vec<Job> {
        let mut state = self.lock_state();
        state.phase = PoolPhase::Halted;
        let dropped = state.queue.drain(..).collect::<Vec<_>>();
        drop(state);
        self.shared.work_changed.notify_all();
        self.shared.terminated.notify_all();
        dropped
    }

    /// Waits for every worker to exit after a shutdown. `None` waits
    /// without bound. Returns `false` when the deadline expired with workers
    /// still alive (or shutdown was never requested).
    #[must_use]
    pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock_state();
        loop {
            if state.phase != PoolPhase::Running && state.workers == 0 {
                return true;
            }
            state = match deadline {
                None => self
                    .shared
                    .terminated
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, _) = self
                        .shared
                        .terminated
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    next
                }
            };
        }
    }
}

fn worker_main(shared: &Arc<PoolShared>, initial: Option<Job>) {
    if let Some(job) = initial {
        job();
    }
    while let Some(job) = next_job(shared) {
        job();
    }
    let mut state = shared
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    state.workers -= 1;
    let drained = state.workers == 0;
    drop(state);
    if drained {
        shared.terminated.notify_all();
    }
}

fn next_job(shared: &Arc<PoolShared>) -> Option<Job> {
    let config = &shared.config;
    let mut state = shared
        .state
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    loop {
        if state.phase == PoolPhase::Halted {
            return None;
        }
        if let Some(job) = state.queue.pop_front() {
            return Some(job);
        }
        if state.phase == PoolPhase::Draining {
            return None;
        }
        let beyond_core = state.workers > config.core_size;
        state.idle += 1;
        if beyond_core {
            let (next, wait) = shared
                .work_changed
                .wait_timeout(state, config.keep_alive)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
            state.idle -= 1;
            if wait.timed_out()
                && state.queue.is_empty()
                && state.phase == PoolPhase::Running
                && state.workers > config.core_size
            {
                // Keep-alive expired with nothing to do: cull this worker.
                return None;
            }
        } else {
            state = shared
                .work_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            state.idle -= 1;
        }
    }
}
