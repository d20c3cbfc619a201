//! Store manager: owns the index store and journal and gates admission on
//! store readiness.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use quill_common::ids::RevisionId;

use crate::index::IndexStore;
use crate::journal::Journal;

/// Owns the on-"disk" state the concurrency core schedules against.
///
/// Startup may involve asynchronous work (store file scans, recovery), so the
/// manager starts either running or pending; admission blocks on
/// [`await_running`] until readiness or the caller's bounded wait expires.
/// A poisoned manager signals an unrecoverable store failure.
///
/// [`await_running`]: StoreManager::await_running
pub struct StoreManager {
    store: Arc<IndexStore>,
    journal: Arc<dyn Journal>,
    ready: Mutex<bool>,
    ready_changed: Condvar,
    poisoned: AtomicBool,
}

impl fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreManager")
            .field("ready", &self.is_running())
            .field("poisoned", &self.is_poisoned())
            .field(
                "last_committed_revision",
                &self.store.last_committed_revision(),
            )
            .finish_non_exhaustive()
    }
}

impl StoreManager {
    /// Creates a manager that is immediately ready.
    #[must_use]
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self::with_readiness(journal, true)
    }

    /// Creates a manager whose startup has not finished yet. Admission
    /// blocks until [`StoreManager::mark_running`] is called.
    #[must_use]
    pub fn new_pending(journal: Arc<dyn Journal>) -> Self {
        Self::with_readiness(journal, false)
    }

    fn with_readiness(journal: Arc<dyn Journal>, ready: bool) -> Self {
        Self {
            store: Arc::new(IndexStore::new()),
            journal,
            ready: Mutex::new(ready),
            ready_changed: Condvar::new(),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Signals that startup processing finished.
    pub fn mark_running(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        *ready = true;
        drop(ready);
        self.ready_changed.notify_all();
    }

    /// Whether startup has finished.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits up to `timeout` for startup to finish. A zero timeout checks
    /// without waiting. Returns `false` on expiry or when the store is
    /// poisoned.
    #[must_use]
    pub fn await_running(&self, timeout: Duration) -> bool {
        if self.is_poisoned() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .ready_changed
                .wait_timeout(ready, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            ready = next;
        }
        !self.is_poisoned()
    }

    /// Marks the store unrecoverable. Subsequent readiness checks fail and
    /// the concurrency manager closes.
    pub fn poison(&self) {
        tracing::warn!("store manager poisoned; rejecting further admissions");
        self.poisoned.store(true, Ordering::Release);
        self.ready_changed.notify_all();
    }

    /// Whether an unrecoverable failure was signalled.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// The named-index store.
    #[must_use]
    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// The durable journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// Revision of the most recent durable commit.
    #[must_use]
    pub fn last_committed_revision(&self) -> RevisionId {
        self.store.last_committed_revision()
    }
}
