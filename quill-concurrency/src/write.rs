//! The unisolated write service: a bounded-growth pool whose workers acquire
//! predeclared locks, execute against live indices, and then hold their
//! thread until their commit group resolves.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quill_common::config::{UNBOUNDED_QUEUE_THRESHOLD, WritePoolConfig};
use quill_common::error::QuillResult;
use quill_common::ids::{ResourceName, TaskId};
use quill_core::counters::TaskCounters;
use quill_core::task::{CommitValidation, TaskBody};
use quill_core::ticket::{TaskTicket, TicketSetter};
use quill_storage::index::IndexStore;
use quill_storage::resources::StoreManager;

use crate::context::UnisolatedContext;
use crate::group::{CommitCoordinator, CommitMessage, CommitStats, FinishedMember, WriteLoad};
use crate::locks::LockManager;
use crate::pool::{Job, PoolConfig, QueueKind, WorkerPool};

/// An unisolated task after admission, ready for the write pool.
pub(crate) struct AdmittedWrite {
    pub task_id: TaskId,
    pub submitted_at: Instant,
    pub resources: BTreeSet<ResourceName>,
    pub validation: Option<CommitValidation>,
    pub body: TaskBody,
    pub setter: TicketSetter,
    /// Clone of the caller's ticket; the worker parks on it after joining
    /// the forming group, absorbing its thread until the group resolves.
    pub parked: TaskTicket,
}

pub(crate) struct WriteService {
    pool: WorkerPool,
    locks: Arc<LockManager>,
    load: Arc<WriteLoad>,
    coordinator: CommitCoordinator,
    store: Arc<IndexStore>,
    counters: Arc<TaskCounters>,
}

impl WriteService {
    pub(crate) fn new(
        config: &WritePoolConfig,
        store_manager: Arc<StoreManager>,
        counters: Arc<TaskCounters>,
    ) -> QuillResult<Self> {
        let queue = match config.queue_capacity {
            0 => QueueKind::Unbounded,
            capacity if capacity > UNBOUNDED_QUEUE_THRESHOLD => {
                tracing::warn!(
                    capacity,
                    limit = UNBOUNDED_QUEUE_THRESHOLD,
                    "write queue capacity exceeds the bounded limit; using an unbounded queue"
                );
                QueueKind::Unbounded
            }
            capacity => QueueKind::Bounded(capacity),
        };
        let pool = WorkerPool::new(PoolConfig {
            name: "quill-write",
            core_size: config.core_pool_size,
            max_size: config.maximum_pool_size,
            keep_alive: config.keep_alive,
            queue,
        });
        if config.prestart_core {
            pool.prestart_core()?;
        }
        let locks = Arc::new(LockManager::new());
        let load = Arc::new(WriteLoad::default());
        let store = Arc::clone(store_manager.store());
        let coordinator = CommitCoordinator::spawn(
            store_manager,
            Arc::clone(&locks),
            Arc::clone(&load),
            Arc::clone(&counters),
            config.group_commit_timeout,
        );
        Ok(Self {
            pool,
            locks,
            load,
            coordinator,
            store,
            counters,
        })
    }

    /// Queues one admitted write task.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::Rejected` when the pool refuses the task (see
    /// [`WorkerPool::submit`]).
    pub(crate) fn execute(&self, task: AdmittedWrite) -> QuillResult<()> {
        let locks = Arc::clone(&self.locks);
        let load = Arc::clone(&self.load);
        let counters = Arc::clone(&self.counters);
        let store = Arc::clone(&self.store);
        let sender = self.coordinator.sender();
        let AdmittedWrite {
            task_id,
            submitted_at,
            resources,
            validation,
            body,
            setter,
            parked,
        } = task;

        let job: Job = Box::new(move || {
            if !setter.begin_execution() {
                counters.record_failure();
                return;
            }
            counters.record_queue_wait(submitted_at.elapsed());
            if let Err(error) = locks.acquire_all(task_id, &resources) {
                counters.record_failure();
                setter.complete(Err(error));
                return;
            }
            load.begin();
            let started = Instant::now();
            let outcome = {
                let mut context = UnisolatedContext::new(store.as_ref(), &resources);
                (body)(&mut context)
            };
            let service = started.elapsed();
            match outcome {
                Ok(value) => {
                    let member = FinishedMember {
                        task_id,
                        resources,
                        validation,
                        value,
                        service,
                        setter,
                    };
                    // Post the join before leaving the executing count, so a
                    // zero count always means every join is already in the
                    // committer's channel.
                    let sent = sender.send(CommitMessage::Finished(member));
                    load.end();
                    if sent.is_err() {
                        // Committer already gone (immediate shutdown): the
                        // returned member drops and its ticket resolves as
                        // cancelled.
                        return;
                    }
                    let _ = parked.join();
                }
                Err(error) => {
                    // The task's staged writes must not leak to the next
                    // holder of these locks.
                    store.discard(resources.iter());
                    locks.release_all(task_id, &resources);
                    load.end();
                    let poisons_group = error.poisons_live_state();
                    let reason = error.to_string();
                    counters.record_failure();
                    setter.complete(Err(error));
                    let _ = sender.send(CommitMessage::ExecutionFailed {
                        poisons_group,
                        reason,
                    });
                }
            }
        });
        self.pool.submit(job)
    }

    pub(crate) fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub(crate) fn commit_stats(&self) -> &Arc<CommitStats> {
        self.coordinator.stats()
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn queue_fill(&self) -> Option<(usize, usize)> {
        self.pool.queue_fill()
    }

    /// Orderly: stop accepting, let queued tasks drain and commit.
    pub(crate) fn shutdown_pool(&self) {
        self.pool.shutdown();
    }

    pub(crate) fn await_termination(&self, timeout: Option<Duration>) -> bool {
        self.pool.await_termination(timeout)
    }

    /// Orderly: stop the committer after the pool has drained. The forming
    /// group (if any) commits before the committer exits.
    pub(crate) fn finish_committer(&self) {
        self.coordinator.shutdown(false);
    }

    /// Immediate: drop queued tasks, interrupt lock waiters, abort the
    /// forming group.
    pub(crate) fn shutdown_now(&self) {
        let dropped = self.pool.shutdown_now();
        drop(dropped);
        self.locks.shutdown();
        self.coordinator.shutdown(true);
    }
}
