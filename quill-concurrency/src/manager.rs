//! The concurrency manager: task admission, routing to the three executor
//! pools, lifecycle, and the counter surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use quill_common::config::ConcurrencyConfig;
use quill_common::error::{QuillError, QuillResult};
use quill_common::ids::TxId;
use quill_core::counters::{CounterSnapshot, TaskCounters};
use quill_core::task::{CommitValidation, TaskBody, TaskKind, TaskSpec, TaskValue};
use quill_core::ticket::{TaskTicket, TicketSetter, ticket};
use quill_storage::resources::StoreManager;
use quill_storage::tempstore::TxRegistry;

use crate::context::{ReadContext, TxContext};
use crate::group::{CommitSnapshot, GroupState};
use crate::locks::LockManager;
use crate::pool::{Job, PoolConfig, WorkerPool};
use crate::sampler::{QUEUE_SAMPLE_INTERVAL, QueueSampler, QueueStatistics};
use crate::write::{AdmittedWrite, WriteService};

const STATE_OPEN: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One consistent reading of the manager's counter surface.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerCounters {
    /// Elapsed time since the manager started.
    pub elapsed: Duration,
    /// Read pool counters.
    pub read: CounterSnapshot,
    /// Transaction pool counters.
    pub tx: CounterSnapshot,
    /// Write pool counters.
    pub write: CounterSnapshot,
    /// Commit-group counters.
    pub commit: CommitSnapshot,
    /// Queue moving averages, when the sampler is enabled.
    pub queues: Option<QueueStatistics>,
}

/// Schedules heterogeneous tasks against a shared journaled store.
///
/// Historical reads run fully concurrently; the active phase of read-write
/// transactions runs concurrently across transactions; unisolated writers
/// predeclare named-resource locks and become durable through group commit.
pub struct ConcurrencyManager {
    config: ConcurrencyConfig,
    state: AtomicU8,
    started_at: Instant,
    store_manager: Arc<StoreManager>,
    registry: Arc<TxRegistry>,
    read_pool: WorkerPool,
    tx_pool: WorkerPool,
    write: WriteService,
    read_counters: Arc<TaskCounters>,
    tx_counters: Arc<TaskCounters>,
    write_counters: Arc<TaskCounters>,
    sampler: Option<QueueSampler>,
    next_task_id: AtomicU64,
}

impl std::fmt::Debug for ConcurrencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyManager")
            .field("open", &self.is_open())
            .field("write_queue", &self.write.pool().queue_len())
            .field("active_transactions", &self.registry.active_count())
            .finish_non_exhaustive()
    }
}

impl ConcurrencyManager {
    /// Builds the manager from configuration and the store manager.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidConfig` for inconsistent configuration
    /// and `QuillError::Rejected` when core write workers cannot be
    /// prestarted.
    pub fn new(config: ConcurrencyConfig, store_manager: Arc<StoreManager>) -> QuillResult<Self> {
        config.validate()?;

        let read_pool = WorkerPool::new(shaped_pool("quill-read", config.read_pool_core_size));
        let tx_pool = WorkerPool::new(shaped_pool("quill-tx", config.tx_pool_core_size));
        let read_counters = Arc::new(TaskCounters::default());
        let tx_counters = Arc::new(TaskCounters::default());
        let write_counters = Arc::new(TaskCounters::default());
        let write = WriteService::new(
            &config.write_pool,
            Arc::clone(&store_manager),
            Arc::clone(&write_counters),
        )?;
        let sampler = config.collect_queue_statistics.then(|| {
            QueueSampler::spawn(
                (read_pool.clone(), Arc::clone(&read_counters)),
                (tx_pool.clone(), Arc::clone(&tx_counters)),
                (write.pool().clone(), Arc::clone(&write_counters)),
                QUEUE_SAMPLE_INTERVAL,
            )
        });
        tracing::info!(
            write_core = config.write_pool.core_pool_size,
            write_max = config.write_pool.maximum_pool_size,
            group_commit_ms = config.write_pool.group_commit_timeout.as_millis() as u64,
            sampler = config.collect_queue_statistics,
            "concurrency manager started"
        );
        Ok(Self {
            config,
            state: AtomicU8::new(STATE_OPEN),
            started_at: Instant::now(),
            store_manager,
            registry: Arc::new(TxRegistry::new()),
            read_pool,
            tx_pool,
            write,
            read_counters,
            tx_counters,
            write_counters,
            sampler,
            next_task_id: AtomicU64::new(0),
        })
    }

    fn assert_open(&self) -> QuillResult<()> {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            Ok(())
        } else {
            Err(QuillError::Rejected("service is shut down"))
        }
    }

    /// Whether the manager accepts new tasks.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OPEN
    }

    /// Submits one task for asynchronous execution.
    ///
    /// Unisolated write tickets resolve only once the task's commit group is
    /// durable; syncing the journal per group rather than per task is the
    /// write-throughput lever of the whole engine.
    ///
    /// # Errors
    ///
    /// Admission failures (`Rejected`, `Fatal`) raise here. Execution-time
    /// failures surface through the returned ticket.
    pub fn submit(&self, spec: TaskSpec) -> QuillResult<TaskTicket> {
        self.assert_open()?;
        if !self.store_manager.await_running(self.config.readiness_timeout) {
            if self.store_manager.is_poisoned() {
                self.shutdown_now();
                return Err(QuillError::Fatal("store manager failed".to_owned()));
            }
            return Err(QuillError::Rejected("store manager is not available"));
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::AcqRel) + 1;
        let submitted_at = Instant::now();
        let (task_ticket, setter) = ticket(task_id);
        let (kind, resources, validation, body) = spec.into_parts();
        match kind {
            TaskKind::ReadOnly { view } => {
                self.read_counters.record_submit();
                let counters = Arc::clone(&self.read_counters);
                let store = Arc::clone(self.store_manager.store());
                let job: Job = Box::new(move || {
                    if !setter.begin_execution() {
                        counters.record_failure();
                        return;
                    }
                    counters.record_queue_wait(submitted_at.elapsed());
                    let started = Instant::now();
                    let outcome = {
                        let mut context = ReadContext::new(store.as_ref(), view);
                        (body)(&mut context)
                    };
                    resolve(outcome, setter, &counters, started);
                });
                self.read_pool.submit(job)?;
            }
            TaskKind::ReadWriteTx { txid } => {
                self.tx_counters.record_submit();
                let counters = Arc::clone(&self.tx_counters);
                let store = Arc::clone(self.store_manager.store());
                let registry = Arc::clone(&self.registry);
                let job: Job = Box::new(move || {
                    if !setter.begin_execution() {
                        counters.record_failure();
                        return;
                    }
                    counters.record_queue_wait(submitted_at.elapsed());
                    let started = Instant::now();
                    let outcome = match TxContext::new(
                        registry.as_ref(),
                        store.as_ref(),
                        txid,
                        task_id,
                        &resources,
                    ) {
                        Ok(mut context) => {
                            let result = (body)(&mut context);
                            context.release();
                            result
                        }
                        Err(error) => Err(error),
                    };
                    resolve(outcome, setter, &counters, started);
                });
                self.tx_pool.submit(job)?;
            }
            TaskKind::UnisolatedWrite => {
                self.write_counters.record_submit();
                self.apply_backpressure()?;
                self.write.execute(AdmittedWrite {
                    task_id,
                    submitted_at,
                    resources,
                    validation,
                    body,
                    setter,
                    parked: task_ticket.clone(),
                })?;
            }
        }
        Ok(task_ticket)
    }

    /// Submits every task and waits for all of them to resolve, ignoring
    /// per-task outcomes.
    ///
    /// # Errors
    ///
    /// Propagates the first admission failure; tasks submitted before the
    /// failure are cancelled if still unresolved.
    pub fn submit_all(&self, specs: Vec<TaskSpec>) -> QuillResult<Vec<TaskTicket>> {
        self.assert_open()?;
        let mut tickets = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.submit(spec) {
                Ok(submitted) => tickets.push(submitted),
                Err(error) => {
                    Self::cancel_unresolved(&tickets);
                    return Err(error);
                }
            }
        }
        for submitted in &tickets {
            let _ = submitted.join();
        }
        Ok(tickets)
    }

    /// Timed variant of [`ConcurrencyManager::submit_all`]: stops submitting
    /// once the deadline passes, waits out the remaining budget, cancels
    /// unresolved tickets, and returns the tickets accumulated so far.
    ///
    /// # Errors
    ///
    /// Propagates the first admission failure, as [`ConcurrencyManager::submit_all`].
    pub fn submit_all_timeout(
        &self,
        specs: Vec<TaskSpec>,
        timeout: Duration,
    ) -> QuillResult<Vec<TaskTicket>> {
        self.assert_open()?;
        let deadline = Instant::now() + timeout;
        let mut tickets = Vec::with_capacity(specs.len());
        for spec in specs {
            if Instant::now() >= deadline {
                Self::cancel_unresolved(&tickets);
                return Ok(tickets);
            }
            match self.submit(spec) {
                Ok(submitted) => tickets.push(submitted),
                Err(error) => {
                    Self::cancel_unresolved(&tickets);
                    return Err(error);
                }
            }
        }
        for submitted in &tickets {
            let now = Instant::now();
            if now >= deadline || submitted.join_timeout(deadline - now).is_none() {
                Self::cancel_unresolved(&tickets);
                return Ok(tickets);
            }
        }
        Ok(tickets)
    }

    fn cancel_unresolved(tickets: &[TaskTicket]) {
        for submitted in tickets {
            if !submitted.is_done() {
                let _ = submitted.cancel();
            }
        }
    }

    fn apply_backpressure(&self) -> QuillResult<()> {
        let policy = &self.config.backpressure;
        if !policy.enabled {
            return Ok(());
        }
        // Handoff and unbounded queues carry no capacity to defend.
        let Some((mut depth, capacity)) = self.write.queue_fill() else {
            return Ok(());
        };
        let mut retries = 0;
        while (depth as f64) >= policy.threshold * (capacity as f64) {
            if retries >= policy.retry_limit {
                return Err(QuillError::Rejected("write queue saturated"));
            }
            retries += 1;
            thread::sleep(policy.delay);
            depth = self.write.queue_fill().map_or(0, |(filled, _)| filled);
        }
        Ok(())
    }

    /// Starts a read-write transaction pinned to the last committed
    /// revision.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::Rejected` after shutdown.
    pub fn begin_transaction(&self) -> QuillResult<TxId> {
        self.assert_open()?;
        Ok(self
            .registry
            .begin(self.store_manager.last_committed_revision()))
    }

    /// Freezes the transaction's write set and submits its unisolated
    /// commit task to the write service. The transaction is concluded either
    /// way; a failed commit means retrying the whole transaction.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` for unknown transactions and
    /// admission errors from the write service. Validation conflicts and
    /// commit failures surface through the returned ticket.
    pub fn commit_transaction(&self, txid: TxId) -> QuillResult<TaskTicket> {
        self.assert_open()?;
        let frozen = self.registry.take_for_commit(txid)?;
        if frozen.buffers.is_empty() {
            // Nothing was written: the commit is trivially durable at the
            // current revision.
            let task_id = self.next_task_id.fetch_add(1, Ordering::AcqRel) + 1;
            let (empty_ticket, setter) = ticket(task_id);
            setter.complete(Ok(TaskValue::Revision(
                self.store_manager.last_committed_revision(),
            )));
            return Ok(empty_ticket);
        }

        let resources = frozen
            .buffers
            .iter()
            .map(|(index, _)| index.clone())
            .collect();
        let validation = CommitValidation {
            txid,
            read_revision: frozen.read_revision,
            keys: frozen
                .buffers
                .iter()
                .flat_map(|(index, entries)| {
                    entries
                        .iter()
                        .map(|(key, _)| (index.clone(), key.clone()))
                })
                .collect(),
        };
        let buffers = frozen.buffers;
        let body: TaskBody = Box::new(move |context| {
            for (index, entries) in &buffers {
                for (key, value) in entries {
                    match value {
                        Some(value) => context.write(index, key, value)?,
                        None => context.delete(index, key)?,
                    }
                }
            }
            Ok(TaskValue::Unit)
        });
        self.submit(TaskSpec::tx_commit(resources, validation, body)?)
    }

    /// Orderly shutdown: rejects further admissions, drains the transaction,
    /// read, and write pools in that order within the configured budget, and
    /// finishes the in-flight commit group.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        tracing::info!("orderly shutdown begun");
        let begin = Instant::now();

        self.tx_pool.shutdown();
        self.read_pool.shutdown();
        self.write.shutdown_pool();

        if !self.tx_pool.await_termination(self.remaining_budget(begin)) {
            tracing::warn!("transaction pool termination timed out");
        }
        if !self.read_pool.await_termination(self.remaining_budget(begin)) {
            tracing::warn!("read pool termination timed out");
        }
        if !self.write.await_termination(self.remaining_budget(begin)) {
            tracing::warn!("write pool termination timed out");
        }
        self.write.finish_committer();
        if let Some(sampler) = &self.sampler {
            sampler.stop();
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
        tracing::info!(
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "orderly shutdown complete"
        );
    }

    fn remaining_budget(&self, begin: Instant) -> Option<Duration> {
        if self.config.shutdown_timeout.is_zero() {
            return None;
        }
        Some(self.config.shutdown_timeout.saturating_sub(begin.elapsed()))
    }

    /// Immediate shutdown: queued tasks are cancelled, lock waiters are
    /// interrupted, and the forming commit group aborts.
    pub fn shutdown_now(&self) {
        let previous = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if previous == STATE_CLOSED {
            return;
        }
        tracing::info!("immediate shutdown begun");
        drop(self.tx_pool.shutdown_now());
        drop(self.read_pool.shutdown_now());
        self.write.shutdown_now();
        if let Some(sampler) = &self.sampler {
            sampler.stop();
        }
    }

    /// State of the current (or most recently resolved) commit group.
    #[must_use]
    pub fn commit_group_state(&self) -> GroupState {
        self.write.commit_stats().group_state()
    }

    /// Reads the whole counter surface.
    #[must_use]
    pub fn counters(&self) -> ManagerCounters {
        ManagerCounters {
            elapsed: self.started_at.elapsed(),
            read: self.read_counters.snapshot(),
            tx: self.tx_counters.snapshot(),
            write: self.write_counters.snapshot(),
            commit: self.write.commit_stats().snapshot(),
            queues: self.sampler.as_ref().map(QueueSampler::readout),
        }
    }

    /// The write service's lock manager.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` after shutdown.
    pub fn lock_manager(&self) -> QuillResult<&Arc<LockManager>> {
        self.assert_accessible()?;
        Ok(self.write.locks())
    }

    /// The store manager this instance schedules against.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` after shutdown.
    pub fn store_manager(&self) -> QuillResult<&Arc<StoreManager>> {
        self.assert_accessible()?;
        Ok(&self.store_manager)
    }

    /// The transaction registry issuing transaction identifiers.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` after shutdown.
    pub fn transaction_registry(&self) -> QuillResult<&Arc<TxRegistry>> {
        self.assert_accessible()?;
        Ok(&self.registry)
    }

    fn assert_accessible(&self) -> QuillResult<()> {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            Ok(())
        } else {
            Err(QuillError::InvalidState("concurrency manager is shut down"))
        }
    }
}

impl Drop for ConcurrencyManager {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) != STATE_CLOSED {
            self.shutdown_now();
        }
    }
}

fn shaped_pool(name: &'static str, core_size: usize) -> PoolConfig {
    if core_size == 0 {
        PoolConfig::handoff(name, Duration::from_millis(60_000))
    } else {
        PoolConfig::fixed(name, core_size)
    }
}

fn resolve(
    outcome: QuillResult<TaskValue>,
    setter: TicketSetter,
    counters: &TaskCounters,
    started: Instant,
) {
    match outcome {
        Ok(value) => {
            counters.record_success(started.elapsed());
            setter.complete(Ok(value));
        }
        Err(error) => {
            counters.record_failure();
            setter.complete(Err(error));
        }
    }
}
