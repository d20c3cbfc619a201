//! Per-transaction temporary store: isolated index buffers for the active
//! phase of read-write transactions, and the registry that issues
//! transaction identifiers.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, PoisonError};

use hashbrown::HashMap;
use quill_common::error::{QuillError, QuillResult};
use quill_common::ids::{ResourceName, RevisionId, TaskId, TxId};

#[derive(Debug, Default)]
struct TransactionState {
    read_revision: RevisionId,
    buffers: HashMap<ResourceName, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    isolated_owners: HashMap<ResourceName, TaskId>,
}

#[derive(Debug, Default)]
struct RegistryState {
    next_txid: TxId,
    active: HashMap<TxId, TransactionState>,
}

/// A transaction's write set, frozen at commit request. The registry entry
/// is gone once this exists; retrying a failed commit means a new
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenTransaction {
    /// Committing transaction.
    pub txid: TxId,
    /// Revision its active phase read from.
    pub read_revision: RevisionId,
    /// Buffered mutations grouped per isolated index, in index order.
    pub buffers: Vec<(ResourceName, Vec<(Vec<u8>, Option<Vec<u8>>)>)>,
}

/// Issues transaction identifiers and holds each transaction's temporary
/// store while it is active.
///
/// Distinct transactions never contend here. Concurrent tasks of the *same*
/// transaction serialize per isolated index through the per-(tx, index)
/// exclusive locks.
#[derive(Debug, Default)]
pub struct TxRegistry {
    state: Mutex<RegistryState>,
    isolated_released: Condvar,
}

impl TxRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a transaction pinned to `read_revision`.
    pub fn begin(&self, read_revision: RevisionId) -> TxId {
        let mut state = self.lock_state();
        state.next_txid += 1;
        let txid = state.next_txid;
        let _ = state.active.insert(
            txid,
            TransactionState {
                read_revision,
                ..TransactionState::default()
            },
        );
        txid
    }

    /// Revision the transaction's active phase reads from.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` for unknown transactions.
    pub fn read_revision(&self, txid: TxId) -> QuillResult<RevisionId> {
        let state = self.lock_state();
        state
            .active
            .get(&txid)
            .map(|tx| tx.read_revision)
            .ok_or(QuillError::InvalidState("unknown transaction"))
    }

    /// Acquires the exclusive per-(tx, index) lock for `task`, waiting while
    /// another task of the same transaction holds it. Reentrant for the
    /// holding task.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` when the transaction is unknown
    /// (also when it concludes while this task is waiting).
    pub fn lock_isolated(
        &self,
        txid: TxId,
        index: &ResourceName,
        task: TaskId,
    ) -> QuillResult<()> {
        let mut state = self.lock_state();
        loop {
            let owner = {
                let Some(tx) = state.active.get_mut(&txid) else {
                    return Err(QuillError::InvalidState("unknown transaction"));
                };
                match tx.isolated_owners.get(index).copied() {
                    None => {
                        let _ = tx.isolated_owners.insert(index.clone(), task);
                        return Ok(());
                    }
                    Some(owner) => owner,
                }
            };
            if owner == task {
                return Ok(());
            }
            state = self
                .isolated_released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Releases every isolated-index lock `task` holds inside `txid`.
    pub fn unlock_isolated(&self, txid: TxId, task: TaskId) {
        let mut state = self.lock_state();
        if let Some(tx) = state.active.get_mut(&txid) {
            tx.isolated_owners.retain(|_, owner| *owner != task);
        }
        drop(state);
        self.isolated_released.notify_all();
    }

    /// Buffers one mutation (`None` deletes) into the transaction's isolated
    /// index.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` for unknown transactions.
    pub fn buffer_write(
        &self,
        txid: TxId,
        index: &ResourceName,
        key: &[u8],
        value: Option<Vec<u8>>,
    ) -> QuillResult<()> {
        let mut state = self.lock_state();
        let Some(tx) = state.active.get_mut(&txid) else {
            return Err(QuillError::InvalidState("unknown transaction"));
        };
        let _ = tx
            .buffers
            .entry(index.clone())
            .or_default()
            .insert(key.to_vec(), value);
        Ok(())
    }

    /// Looks up a buffered mutation. `Some(None)` is a buffered delete;
    /// outer `None` means the transaction never touched the key.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` for unknown transactions.
    pub fn buffered_entry(
        &self,
        txid: TxId,
        index: &ResourceName,
        key: &[u8],
    ) -> QuillResult<Option<Option<Vec<u8>>>> {
        let state = self.lock_state();
        let Some(tx) = state.active.get(&txid) else {
            return Err(QuillError::InvalidState("unknown transaction"));
        };
        Ok(tx
            .buffers
            .get(index)
            .and_then(|buffer| buffer.get(key).cloned()))
    }

    /// Names of every isolated index the transaction buffered writes into.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` for unknown transactions.
    pub fn write_set(&self, txid: TxId) -> QuillResult<Vec<ResourceName>> {
        let state = self.lock_state();
        let Some(tx) = state.active.get(&txid) else {
            return Err(QuillError::InvalidState("unknown transaction"));
        };
        let mut names = tx.buffers.keys().cloned().collect::<Vec<_>>();
        names.sort_unstable();
        Ok(names)
    }

    /// Freezes the transaction for commit and removes it from the registry.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` for unknown transactions.
    pub fn take_for_commit(&self, txid: TxId) -> QuillResult<FrozenTransaction> {
        let mut state = self.lock_state();
        let Some(tx) = state.active.remove(&txid) else {
            return Err(QuillError::InvalidState("unknown transaction"));
        };
        drop(state);
        self.isolated_released.notify_all();

        let mut buffers = tx
            .buffers
            .into_iter()
            .map(|(index, buffer)| (index, buffer.into_iter().collect::<Vec<_>>()))
            .collect::<Vec<_>>();
        buffers.sort_unstable_by(|(left, _), (right, _)| left.cmp(right));
        Ok(FrozenTransaction {
            txid,
            read_revision: tx.read_revision,
            buffers,
        })
    }

    /// Drops an active transaction without committing.
    pub fn abort(&self, txid: TxId) {
        let mut state = self.lock_state();
        let _ = state.active.remove(&txid);
        drop(state);
        self.isolated_released.notify_all();
    }

    /// Number of transactions currently in their active phase.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock_state().active.len()
    }
}
