//! Named live indices: committed state, the uncommitted overlay written by
//! the current lock holder, and published snapshots addressable by revision.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use quill_common::ids::{ResourceName, RevisionId};
use quill_core::task::ReadView;

/// Immutable published view of one index at one revision.
///
/// Historical readers hold the `Arc`'d entry map; publishing newer revisions
/// never disturbs a view that has been handed out.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    revision: RevisionId,
    entries: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl IndexSnapshot {
    fn empty(revision: RevisionId) -> Self {
        Self {
            revision,
            entries: Arc::new(BTreeMap::new()),
        }
    }

    /// Revision this view was published at.
    #[must_use]
    pub fn revision(&self) -> RevisionId {
        self.revision
    }

    /// Reads one key from the view.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    /// Number of entries in the view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the view holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct LiveIndexState {
    committed: BTreeMap<Vec<u8>, Vec<u8>>,
    last_write: BTreeMap<Vec<u8>, RevisionId>,
    dirty: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    snapshots: BTreeMap<RevisionId, Arc<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

/// One live mutable index. The lock manager guarantees at most one unisolated
/// writer at a time; the internal mutex only guards against concurrent
/// readers of published metadata.
///
/// Writers stage into the dirty overlay. The overlay becomes visible to
/// everyone else only when the owning commit group publishes it, and is
/// discarded wholesale when the group aborts.
#[derive(Debug)]
pub struct LiveIndex {
    name: ResourceName,
    state: Mutex<LiveIndexState>,
}

impl LiveIndex {
    fn new(name: ResourceName) -> Self {
        Self {
            name,
            state: Mutex::new(LiveIndexState::default()),
        }
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LiveIndexState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stages one write into the uncommitted overlay.
    pub fn stage_write(&self, key: &[u8], value: &[u8]) {
        let mut state = self.lock_state();
        let _ = state.dirty.insert(key.to_vec(), Some(value.to_vec()));
    }

    /// Stages one delete into the uncommitted overlay.
    pub fn stage_delete(&self, key: &[u8]) {
        let mut state = self.lock_state();
        let _ = state.dirty.insert(key.to_vec(), None);
    }

    /// Reads through the overlay onto committed state. Only meaningful for
    /// the current lock holder.
    #[must_use]
    pub fn read_live(&self, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.lock_state();
        if let Some(staged) = state.dirty.get(key) {
            return staged.clone();
        }
        state.committed.get(key).cloned()
    }

    /// Whether the overlay holds staged mutations.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.lock_state().dirty.is_empty()
    }

    /// Copies the staged mutations, in key order, for journaling.
    #[must_use]
    pub fn pending_writes(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.lock_state()
            .dirty
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Folds the overlay into committed state, records per-key last-write
    /// revisions, and publishes a snapshot at `revision`.
    pub fn publish(&self, revision: RevisionId) {
        let mut state = self.lock_state();
        if state.dirty.is_empty() {
            return;
        }
        let staged = std::mem::take(&mut state.dirty);
        for (key, value) in staged {
            let _ = state.last_write.insert(key.clone(), revision);
            match value {
                Some(value) => {
                    let _ = state.committed.insert(key, value);
                }
                None => {
                    let _ = state.committed.remove(&key);
                }
            }
        }
        let view = Arc::new(state.committed.clone());
        let _ = state.snapshots.insert(revision, view);
    }

    /// Drops every staged mutation.
    pub fn discard_pending(&self) {
        self.lock_state().dirty.clear();
    }

    /// Resolves the newest published view with revision `<= revision`.
    /// An index without published history resolves to an empty view.
    #[must_use]
    pub fn snapshot_upto(&self, revision: RevisionId) -> IndexSnapshot {
        let state = self.lock_state();
        state
            .snapshots
            .range(..=revision)
            .next_back()
            .map_or_else(
                || IndexSnapshot::empty(revision),
                |(published, entries)| IndexSnapshot {
                    revision: *published,
                    entries: Arc::clone(entries),
                },
            )
    }

    /// Revision of the last committed write to `key`, when the key was ever
    /// committed.
    #[must_use]
    pub fn last_write_revision(&self, key: &[u8]) -> Option<RevisionId> {
        self.lock_state().last_write.get(key).copied()
    }
}

/// Registry of named live indices plus the global committed revision cursor.
#[derive(Debug, Default)]
pub struct IndexStore {
    indices: Mutex<HashMap<ResourceName, Arc<LiveIndex>>>,
    last_committed: AtomicU64,
}

impl IndexStore {
    /// Creates an empty store at revision zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named index, creating it on first open.
    pub fn open(&self, name: &ResourceName) -> Arc<LiveIndex> {
        let mut indices = self
            .indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            indices
                .entry(name.clone())
                .or_insert_with(|| Arc::new(LiveIndex::new(name.clone()))),
        )
    }

    /// Returns the named index when it exists.
    #[must_use]
    pub fn get(&self, name: &ResourceName) -> Option<Arc<LiveIndex>> {
        let indices = self
            .indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        indices.get(name).map(Arc::clone)
    }

    /// Revision of the most recent durable group commit.
    #[must_use]
    pub fn last_committed_revision(&self) -> RevisionId {
        self.last_committed.load(Ordering::Acquire)
    }

    /// Revision the next commit group will publish at.
    #[must_use]
    pub fn next_revision(&self) -> RevisionId {
        self.last_committed_revision() + 1
    }

    /// Publishes the staged overlays of `names` at `revision` and advances
    /// the committed cursor.
    pub fn publish<'a>(
        &self,
        revision: RevisionId,
        names: impl IntoIterator<Item = &'a ResourceName>,
    ) {
        for name in names {
            if let Some(index) = self.get(name) {
                index.publish(revision);
            }
        }
        self.last_committed.store(revision, Ordering::Release);
    }

    /// Discards the staged overlays of `names` without publishing.
    pub fn discard<'a>(&self, names: impl IntoIterator<Item = &'a ResourceName>) {
        for name in names {
            if let Some(index) = self.get(name) {
                index.discard_pending();
            }
        }
    }

    /// Resolves a read view of the named index. Unknown indices resolve to
    /// an empty view rather than an error: a historical read observes the
    /// absence of an index that did not exist at its revision.
    #[must_use]
    pub fn snapshot(&self, name: &ResourceName, view: ReadView) -> IndexSnapshot {
        let revision = match view {
            ReadView::Historical(revision) => revision,
            ReadView::LastCommitted => self.last_committed_revision(),
        };
        self.get(name).map_or_else(
            || IndexSnapshot::empty(revision),
            |index| index.snapshot_upto(revision),
        )
    }
}
