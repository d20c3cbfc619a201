//! Task classification, bodies, and the store access seam they run against.

use std::collections::BTreeSet;
use std::fmt;

use quill_common::error::{QuillError, QuillResult};
use quill_common::ids::{ResourceName, RevisionId, TxId};

/// Snapshot selector for read-only tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadView {
    /// Read the published state as of one historical revision.
    Historical(RevisionId),
    /// Read the most recently committed revision.
    LastCommitted,
}

/// Scheduling classification of a task. Final at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Fully concurrent read against an immutable revision. No locking.
    ReadOnly {
        /// Which published state the task observes.
        view: ReadView,
    },
    /// Active phase of a read-write transaction: historical reads plus
    /// buffered writes into per-transaction isolated indices.
    ReadWriteTx {
        /// Owning transaction.
        txid: TxId,
    },
    /// Direct operation on live mutable indices. Must hold locks on every
    /// declared resource and becomes durable with its commit group.
    UnisolatedWrite,
}

/// Result value produced by a task body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskValue {
    /// Task completed without a payload.
    Unit,
    /// Lookup found no entry.
    Absent,
    /// Raw value payload.
    Bytes(Vec<u8>),
    /// Revision observed or produced by the task.
    Revision(RevisionId),
}

/// Store access handed to a running task body.
///
/// Each executor supplies an implementation scoped to the task's
/// classification: snapshot-backed for reads, temp-store-backed for the
/// transaction active phase, and live-overlay-backed (restricted to the
/// declared lock set) for unisolated writers.
pub trait TaskContext {
    /// Reads one key from the named index.
    ///
    /// # Errors
    ///
    /// Returns an error when the index is outside the task's declared scope
    /// or the backing store rejects the access.
    fn read(&mut self, index: &ResourceName, key: &[u8]) -> QuillResult<Option<Vec<u8>>>;

    /// Writes one key into the named index.
    ///
    /// # Errors
    ///
    /// Returns an error for read-only tasks, for undeclared resources, and
    /// for store-level failures.
    fn write(&mut self, index: &ResourceName, key: &[u8], value: &[u8]) -> QuillResult<()>;

    /// Deletes one key from the named index.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`TaskContext::write`].
    fn delete(&mut self, index: &ResourceName, key: &[u8]) -> QuillResult<()>;
}

/// Executable payload of a task.
pub type TaskBody = Box<dyn FnOnce(&mut dyn TaskContext) -> QuillResult<TaskValue> + Send>;

/// Validation input carried by a transaction-commit task.
///
/// The committer checks every written key against the committed last-write
/// revisions before the group's durable sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitValidation {
    /// Transaction being committed.
    pub txid: TxId,
    /// Revision the transaction read from during its active phase.
    pub read_revision: RevisionId,
    /// Every (index, key) the transaction buffered a write for.
    pub keys: Vec<(ResourceName, Vec<u8>)>,
}

/// A unit of work as handed to `submit`: classification, declared resource
/// set, and body. Classification and resources are final once constructed.
pub struct TaskSpec {
    kind: TaskKind,
    resources: BTreeSet<ResourceName>,
    validation: Option<CommitValidation>,
    body: TaskBody,
}

impl TaskSpec {
    /// Builds a historical/read-committed read task. Declares no resources.
    #[must_use]
    pub fn read_only(view: ReadView, body: TaskBody) -> Self {
        Self {
            kind: TaskKind::ReadOnly { view },
            resources: BTreeSet::new(),
            validation: None,
            body,
        }
    }

    /// Builds an active-phase transaction task. The resource set names the
    /// isolated indices the task intends to touch and is advisory.
    #[must_use]
    pub fn read_write_tx(txid: TxId, resources: BTreeSet<ResourceName>, body: TaskBody) -> Self {
        Self {
            kind: TaskKind::ReadWriteTx { txid },
            resources,
            validation: None,
            body,
        }
    }

    /// Builds an unisolated write task.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` when the resource set is empty:
    /// unisolated writers must predeclare every live index they touch.
    pub fn unisolated(resources: BTreeSet<ResourceName>, body: TaskBody) -> QuillResult<Self> {
        if resources.is_empty() {
            return Err(QuillError::InvalidState(
                "unisolated task must declare at least one resource",
            ));
        }
        Ok(Self {
            kind: TaskKind::UnisolatedWrite,
            resources,
            validation: None,
            body,
        })
    }

    /// Builds the unisolated commit task of a read-write transaction.
    ///
    /// # Errors
    ///
    /// Returns `QuillError::InvalidState` when the write set is empty.
    pub fn tx_commit(
        resources: BTreeSet<ResourceName>,
        validation: CommitValidation,
        body: TaskBody,
    ) -> QuillResult<Self> {
        let mut spec = Self::unisolated(resources, body)?;
        spec.validation = Some(validation);
        Ok(spec)
    }

    /// Scheduling classification.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Declared resource set.
    #[must_use]
    pub fn resources(&self) -> &BTreeSet<ResourceName> {
        &self.resources
    }

    /// Decomposes the spec for execution.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        TaskKind,
        BTreeSet<ResourceName>,
        Option<CommitValidation>,
        TaskBody,
    ) {
        (self.kind, self.resources, self.validation, self.body)
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("kind", &self.kind)
            .field("resources", &self.resources)
            .field("is_tx_commit", &self.validation.is_some())
            .finish_non_exhaustive()
    }
}
