//! Canonical identifier types used across scheduling, storage, and journal code.

use std::fmt;

/// Monotonic transaction identifier allocated by the transaction registry.
pub type TxId = u64;

/// Monotonic task identifier assigned at admission.
pub type TaskId = u64;

/// Global commit sequence number. One revision is published per durable
/// group commit; historical reads address published revisions.
pub type RevisionId = u64;

/// String-keyed handle of a live named index (or index partition).
///
/// Names carry the canonical total order used for deadlock-free lock
/// acquisition: declared lock sets are always acquired in ascending
/// `ResourceName` order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceName(String);

impl ResourceName {
    /// Creates a validated resource name.
    ///
    /// Returns `None` for an empty name because the lock table and the index
    /// store both key on non-empty names.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        if name.is_empty() { None } else { Some(Self(name)) }
    }

    /// Returns the inner name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
