//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `quill`.
pub type QuillResult<T> = Result<T, QuillError>;

/// Error surface of the concurrency core and its collaborators.
///
/// Admission-time failures are returned directly from `submit`; execution-time
/// failures travel through the task's completion ticket. Group-wide commit
/// failures reach every member of the affected commit group.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuillError {
    /// Task admission was refused (service closed, store not ready, or the
    /// target queue stayed saturated past the backpressure budget).
    #[error("task rejected: {0}")]
    Rejected(&'static str),

    /// Task was cancelled before it began executing, or dropped by an
    /// immediate shutdown.
    #[error("task cancelled")]
    Cancelled,

    /// A worker was woken out of a blocking wait by shutdown.
    #[error("worker interrupted: {0}")]
    Interrupted(&'static str),

    /// Transaction commit conflict detected at validation.
    #[error("transaction validation failed: {0}")]
    Validation(String),

    /// The durable group commit failed; every member of the group observes
    /// this outcome.
    #[error("group commit failed: {0}")]
    CommitFailed(String),

    /// Unrecoverable store failure. The manager transitions to closed.
    #[error("fatal store failure: {0}")]
    Fatal(String),

    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl QuillError {
    /// Whether this error indicates that live index state can no longer be
    /// trusted. A poisoning failure aborts the forming commit group.
    #[must_use]
    pub fn poisons_live_state(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
