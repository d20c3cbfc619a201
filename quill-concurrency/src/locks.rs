//! Deadlock-free lock manager over named resources.
//!
//! Writers predeclare their full lock set and acquire it in the canonical
//! (lexicographic) order of resource names. Every worker uses the same
//! order, so no wait-for cycle can form. Lock sets never grow after
//! acquisition: there is no upgrade and no recursive acquire.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, PoisonError};

use hashbrown::HashMap;
use quill_common::error::{QuillError, QuillResult};
use quill_common::ids::{ResourceName, TaskId};

#[derive(Debug, Default)]
struct LockTableState {
    owners: HashMap<ResourceName, TaskId>,
    shutdown: bool,
}

/// Table mapping each named resource to its single live holder.
#[derive(Debug, Default)]
pub struct LockManager {
    state: Mutex<LockTableState>,
    released: Condvar,
}

impl LockManager {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LockTableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires every resource in `resources` for `task`, waiting on each
    /// held resource until its holder releases. The `BTreeSet` iterates in
    /// ascending name order, which is the canonical acquisition order.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::Interrupted` when the manager shuts down while
    /// the task waits, and `QuillError::InvalidState` on a recursive
    /// acquisition attempt. Partially acquired locks are released on error.
    pub fn acquire_all(&self, task: TaskId, resources: &BTreeSet<ResourceName>) -> QuillResult<()> {
        let mut state = self.lock_state();
        let mut held: Vec<&ResourceName> = Vec::with_capacity(resources.len());
        for resource in resources {
            loop {
                if state.shutdown {
                    Self::release_held(&mut state, task, &held);
                    drop(state);
                    self.released.notify_all();
                    return Err(QuillError::Interrupted("lock manager shut down"));
                }
                match state.owners.get(resource).copied() {
                    None => {
                        let _ = state.owners.insert(resource.clone(), task);
                        held.push(resource);
                        break;
                    }
                    Some(owner) if owner == task => {
                        Self::release_held(&mut state, task, &held);
                        drop(state);
                        self.released.notify_all();
                        return Err(QuillError::InvalidState(
                            "recursive lock acquisition is not supported",
                        ));
                    }
                    Some(_) => {
                        state = self
                            .released
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }
        Ok(())
    }

    fn release_held(state: &mut LockTableState, task: TaskId, held: &[&ResourceName]) {
        for resource in held {
            if state.owners.get(*resource) == Some(&task) {
                let _ = state.owners.remove(*resource);
            }
        }
    }

    /// Releases every resource in `resources` held by `task` and wakes
    /// waiters.
    pub fn release_all(&self, task: TaskId, resources: &BTreeSet<ResourceName>) {
        let mut state = self.lock_state();
        for resource in resources {
            if state.owners.get(resource) == Some(&task) {
                let _ = state.owners.remove(resource);
            }
        }
        drop(state);
        self.released.notify_all();
    }

    /// Current holder of `resource`.
    #[must_use]
    pub fn owner_of(&self, resource: &ResourceName) -> Option<TaskId> {
        self.lock_state().owners.get(resource).copied()
    }

    /// Number of currently held resources.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.lock_state().owners.len()
    }

    /// Wakes every waiter with `Interrupted`. Used by immediate shutdown.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.shutdown = true;
        drop(state);
        self.released.notify_all();
    }
}
