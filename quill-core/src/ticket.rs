//! Completion tickets: the caller-facing future of a submitted task.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use quill_common::error::{QuillError, QuillResult};
use quill_common::ids::TaskId;

use crate::task::TaskValue;

#[derive(Debug)]
enum TicketState {
    Pending { cancel_requested: bool },
    Done(QuillResult<TaskValue>),
}

#[derive(Debug)]
struct TicketCell {
    state: Mutex<TicketState>,
    changed: Condvar,
}

impl TicketCell {
    fn complete_if_pending(&self, outcome: QuillResult<TaskValue>) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, TicketState::Done(_)) {
            return false;
        }
        *state = TicketState::Done(outcome);
        drop(state);
        self.changed.notify_all();
        true
    }
}

/// Creates a linked ticket/setter pair for one task.
#[must_use]
pub fn ticket(task_id: TaskId) -> (TaskTicket, TicketSetter) {
    let cell = Arc::new(TicketCell {
        state: Mutex::new(TicketState::Pending {
            cancel_requested: false,
        }),
        changed: Condvar::new(),
    });
    (
        TaskTicket {
            task_id,
            cell: Arc::clone(&cell),
        },
        TicketSetter { cell },
    )
}

/// Caller-side completion handle. A task is accepted at most once, so the
/// ticket resolves exactly once: with the body's value, with the group-commit
/// outcome for unisolated writers, or with an admission/cancellation error.
#[derive(Debug, Clone)]
pub struct TaskTicket {
    task_id: TaskId,
    cell: Arc<TicketCell>,
}

impl TaskTicket {
    /// Identifier assigned at admission.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Whether the task has resolved.
    #[must_use]
    pub fn is_done(&self) -> bool {
        let state = self
            .cell
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        matches!(*state, TicketState::Done(_))
    }

    /// Blocks until the task resolves and returns its outcome.
    ///
    /// # Errors
    ///
    /// Propagates the task's failure outcome.
    pub fn join(&self) -> QuillResult<TaskValue> {
        let mut state = self
            .cell
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let TicketState::Done(outcome) = &*state {
                return outcome.clone();
            }
            state = self
                .cell
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks up to `timeout` for the task to resolve. Returns `None` when
    /// the deadline expires first.
    pub fn join_timeout(&self, timeout: Duration) -> Option<QuillResult<TaskValue>> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .cell
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let TicketState::Done(outcome) = &*state {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .cell
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
    }

    /// Requests cancellation. Returns `true` when the task had not yet
    /// resolved. A task that has not begun executing will resolve with
    /// `Cancelled`; a task already past its execution start runs to its
    /// natural outcome (and once it has joined a forming commit group the
    /// group decides its result).
    pub fn cancel(&self) -> bool {
        let mut state = self
            .cell
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            TicketState::Pending { cancel_requested } => {
                *cancel_requested = true;
                true
            }
            TicketState::Done(_) => false,
        }
    }
}

/// Executor-side completion handle. Exactly one setter exists per ticket;
/// dropping it unresolved (for example when an immediate shutdown discards a
/// queued task) resolves the ticket with `Cancelled`.
#[derive(Debug)]
pub struct TicketSetter {
    cell: Arc<TicketCell>,
}

impl TicketSetter {
    /// Marks the execution start. Returns `false` when cancellation was
    /// requested first, in which case the ticket resolves with `Cancelled`
    /// and the task must not run.
    pub fn begin_execution(&self) -> bool {
        let cancelled = {
            let state = self
                .cell
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            matches!(
                *state,
                TicketState::Pending {
                    cancel_requested: true
                } | TicketState::Done(_)
            )
        };
        if cancelled {
            let _ = self.cell.complete_if_pending(Err(QuillError::Cancelled));
            return false;
        }
        true
    }

    /// Resolves the ticket. The first resolution wins.
    pub fn complete(self, outcome: QuillResult<TaskValue>) {
        let _ = self.cell.complete_if_pending(outcome);
    }
}

impl Drop for TicketSetter {
    fn drop(&mut self) {
        let _ = self.cell.complete_if_pending(Err(QuillError::Cancelled));
    }
}
