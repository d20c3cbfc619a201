//! Store access contexts handed to task bodies, one per scheduling regime.

use std::collections::BTreeSet;

use quill_common::error::{QuillError, QuillResult};
use quill_common::ids::{ResourceName, RevisionId, TaskId, TxId};
use quill_core::task::{ReadView, TaskContext};
use quill_storage::index::IndexStore;
use quill_storage::tempstore::TxRegistry;

/// Snapshot-backed context for historical and read-committed tasks.
pub(crate) struct ReadContext<'a> {
    store: &'a IndexStore,
    view: ReadView,
}

impl<'a> ReadContext<'a> {
    pub(crate) fn new(store: &'a IndexStore, view: ReadView) -> Self {
        Self { store, view }
    }
}

impl TaskContext for ReadContext<'_> {
    fn read(&mut self, index: &ResourceName, key: &[u8]) -> QuillResult<Option<Vec<u8>>> {
        Ok(self.store.snapshot(index, self.view).get(key))
    }

    fn write(&mut self, _index: &ResourceName, _key: &[u8], _value: &[u8]) -> QuillResult<()> {
        Err(QuillError::InvalidState("read-only task cannot write"))
    }

    fn delete(&mut self, _index: &ResourceName, _key: &[u8]) -> QuillResult<()> {
        Err(QuillError::InvalidState("read-only task cannot write"))
    }
}

/// Live-overlay context for unisolated writers. Access is restricted to the
/// task's declared lock set.
pub(crate) struct UnisolatedContext<'a> {
    store: &'a IndexStore,
    declared: &'a BTreeSet<ResourceName>,
}

impl<'a> UnisolatedContext<'a> {
    pub(crate) fn new(store: &'a IndexStore, declared: &'a BTreeSet<ResourceName>) -> Self {
        Self { store, declared }
    }

    fn ensure_declared(&self, index: &ResourceName) -> QuillResult<()> {
        if self.declared.contains(index) {
            Ok(())
        } else {
            Err(QuillError::InvalidState(
                "resource was not declared by the task",
            ))
        }
    }
}

impl TaskContext for UnisolatedContext<'_> {
    fn read(&mut self, index: &ResourceName, key: &[u8]) -> QuillResult<Option<Vec<u8>>> {
        self.ensure_declared(index)?;
        Ok(self.store.open(index).read_live(key))
    }

    fn write(&mut self, index: &ResourceName, key: &[u8], value: &[u8]) -> QuillResult<()> {
        self.ensure_declared(index)?;
        self.store.open(index).stage_write(key, value);
        Ok(())
    }

    fn delete(&mut self, index: &ResourceName, key: &[u8]) -> QuillResult<()> {
        self.ensure_declared(index)?;
        self.store.open(index).stage_delete(key);
        Ok(())
    }
}

/// Temp-store context for the active phase of a read-write transaction.
///
/// Reads overlay the transaction's own buffered writes onto the historical
/// snapshot at its read revision. Touching an isolated index first acquires
/// the per-(tx, index) exclusive lock; declared indices are acquired upfront
/// in canonical order, undeclared ones lazily on first touch.
pub(crate) struct TxContext<'a> {
    registry: &'a TxRegistry,
    store: &'a IndexStore,
    txid: TxId,
    task_id: TaskId,
    read_revision: RevisionId,
    locked: BTreeSet<ResourceName>,
}

impl<'a> TxContext<'a> {
    pub(crate) fn new(
        registry: &'a TxRegistry,
        store: &'a IndexStore,
        txid: TxId,
        task_id: TaskId,
        declared: &BTreeSet<ResourceName>,
    ) -> QuillResult<Self> {
        let read_revision = registry.read_revision(txid)?;
        let mut context = Self {
            registry,
            store,
            txid,
            task_id,
            read_revision,
            locked: BTreeSet::new(),
        };
        for index in declared {
            context.ensure_locked(index)?;
        }
        Ok(context)
    }

    fn ensure_locked(&mut self, index: &ResourceName) -> QuillResult<()> {
        if self.locked.contains(index) {
            return Ok(());
        }
        self.registry.lock_isolated(self.txid, index, self.task_id)?;
        let _ = self.locked.insert(index.clone());
        Ok(())
    }

    /// Releases every isolated-index lock this task acquired. Called by the
    /// executor after the body returns, on success and failure alike.
    pub(crate) fn release(&self) {
        self.registry.unlock_isolated(self.txid, self.task_id);
    }
}

impl TaskContext for TxContext<'_> {
    fn read(&mut self, index: &ResourceName, key: &[u8]) -> QuillResult<Option<Vec<u8>>> {
        self.ensure_locked(index)?;
        if let Some(buffered) = self.registry.buffered_entry(self.txid, index, key)? {
            return Ok(buffered);
        }
        Ok(self
            .store
            .snapshot(index, ReadView::Historical(self.read_revision))
            .get(key))
    }

    fn write(&mut self, index: &ResourceName, key: &[u8], value: &[u8]) -> QuillResult<()> {
        self.ensure_locked(index)?;
        self.registry
            .buffer_write(self.txid, index, key, Some(value.to_vec()))
    }

    fn delete(&mut self, index: &ResourceName, key: &[u8]) -> QuillResult<()> {
        self.ensure_locked(index)?;
        self.registry.buffer_write(self.txid, index, key, None)
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadContext, TxContext, UnisolatedContext};
    use googletest::prelude::*;
    use quill_common::error::QuillError;
    use quill_common::ids::ResourceName;
    use quill_core::task::{ReadView, TaskContext};
    use quill_storage::index::IndexStore;
    use quill_storage::tempstore::TxRegistry;
    use rstest::rstest;
    use std::collections::BTreeSet;

    fn name(text: &str) -> ResourceName {
        ResourceName::new(text).expect("test name must be valid")
    }

    fn names(texts: &[&str]) -> BTreeSet<ResourceName> {
        texts.iter().map(|text| name(text)).collect()
    }

    #[rstest]
    fn read_context_rejects_writes() {
        let store = IndexStore::new();
        let mut context = ReadContext::new(&store, ReadView::LastCommitted);
        assert_that!(
            context.write(&name("idx-a"), b"k", b"v"),
            eq(&Err(QuillError::InvalidState("read-only task cannot write")))
        );
        assert_that!(context.read(&name("idx-a"), b"k"), eq(&Ok(None)));
    }

    #[rstest]
    fn unisolated_context_enforces_the_declared_set() {
        let store = IndexStore::new();
        let declared = names(&["idx-a"]);
        let mut context = UnisolatedContext::new(&store, &declared);

        context
            .write(&name("idx-a"), b"k", b"v")
            .expect("declared resource must be writable");
        assert_that!(
            context.read(&name("idx-a"), b"k"),
            eq(&Ok(Some(b"v".to_vec())))
        );
        assert_that!(
            context.write(&name("idx-b"), b"k", b"v"),
            eq(&Err(QuillError::InvalidState(
                "resource was not declared by the task"
            )))
        );
    }

    #[rstest]
    fn tx_context_overlays_buffered_writes_on_the_read_revision() {
        let store = IndexStore::new();
        let registry = TxRegistry::new();
        store.open(&name("idx-a")).stage_write(b"k", b"committed");
        store.publish(1, [&name("idx-a")]);

        let txid = registry.begin(1);
        let mut context = TxContext::new(&registry, &store, txid, 1, &names(&["idx-a"]))
            .expect("context for an active transaction must build");

        assert_that!(
            context.read(&name("idx-a"), b"k"),
            eq(&Ok(Some(b"committed".to_vec())))
        );
        context
            .write(&name("idx-a"), b"k", b"buffered")
            .expect("buffered write must succeed");
        assert_that!(
            context.read(&name("idx-a"), b"k"),
            eq(&Ok(Some(b"buffered".to_vec())))
        );
        context
            .delete(&name("idx-a"), b"k")
            .expect("buffered delete must succeed");
        assert_that!(context.read(&name("idx-a"), b"k"), eq(&Ok(None)));

        // The live index never saw the buffered mutations.
        assert_that!(
            store.snapshot(&name("idx-a"), ReadView::LastCommitted).get(b"k"),
            eq(&Some(b"committed".to_vec()))
        );
        context.release();
    }
}
