//! Commit-group coordination: a single committer thread coalesces finished
//! unisolated writers into one durable journal sync.
//!
//! Workers post "finished" messages and park; the committer applies the
//! group-formation rule, validates transaction commits, performs the sync,
//! publishes the new revision, and resolves every member.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use quill_common::error::QuillError;
use quill_common::ids::{ResourceName, TaskId};
use quill_core::counters::TaskCounters;
use quill_core::task::{CommitValidation, TaskValue};
use quill_core::ticket::TicketSetter;
use quill_storage::journal::{CommitRecord, JournalWrite};
use quill_storage::resources::StoreManager;

use crate::locks::LockManager;

/// Lifecycle of one commit group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Members are joining; the commit timer may be running.
    Forming,
    /// The committer is validating and performing the durable sync.
    Committing,
    /// The group's writes are durable and every member succeeded.
    Done,
    /// The group was aborted; no member's writes are observable.
    Aborted,
}

const STATE_DONE: u8 = 0;
const STATE_FORMING: u8 = 1;
const STATE_COMMITTING: u8 = 2;
const STATE_ABORTED: u8 = 3;

/// Commit-group telemetry shared with the manager's counter surface.
#[derive(Debug, Default)]
pub struct CommitStats {
    groups_committed: AtomicU64,
    groups_aborted: AtomicU64,
    members_committed: AtomicU64,
    state: AtomicU8,
}

impl CommitStats {
    fn set_state(&self, state: GroupState) {
        let encoded = match state {
            GroupState::Done => STATE_DONE,
            GroupState::Forming => STATE_FORMING,
            GroupState::Committing => STATE_COMMITTING,
            GroupState::Aborted => STATE_ABORTED,
        };
        self.state.store(encoded, Ordering::Release);
    }

    /// State of the current (or most recently resolved) commit group.
    #[must_use]
    pub fn group_state(&self) -> GroupState {
        match self.state.load(Ordering::Acquire) {
            STATE_FORMING => GroupState::Forming,
            STATE_COMMITTING => GroupState::Committing,
            STATE_ABORTED => GroupState::Aborted,
            _ => GroupState::Done,
        }
    }

    fn record_committed(&self, members: u64) {
        let _ = self.groups_committed.fetch_add(1, Ordering::Relaxed);
        let _ = self.members_committed.fetch_add(members, Ordering::Relaxed);
        self.set_state(GroupState::Done);
    }

    fn record_aborted(&self) {
        let _ = self.groups_aborted.fetch_add(1, Ordering::Relaxed);
        self.set_state(GroupState::Aborted);
    }

    /// Reads the group counters into one snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CommitSnapshot {
        CommitSnapshot {
            groups_committed: self.groups_committed.load(Ordering::Relaxed),
            groups_aborted: self.groups_aborted.load(Ordering::Relaxed),
            members_committed: self.members_committed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the commit-group counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitSnapshot {
    /// Groups that reached `Done`.
    pub groups_committed: u64,
    /// Groups that reached `Aborted`.
    pub groups_aborted: u64,
    /// Unisolated tasks made durable across all committed groups.
    pub members_committed: u64,
}

/// Count of write workers currently executing task bodies under held locks.
/// The committer closes a forming group as soon as this reaches zero: no
/// writer remains that could still join.
#[derive(Debug, Default)]
pub(crate) struct WriteLoad {
    executing: AtomicUsize,
}

impl WriteLoad {
    pub(crate) fn begin(&self) {
        let _ = self.executing.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end(&self) {
        let _ = self.executing.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn executing(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }
}

/// A finished unisolated task awaiting its group's durable commit. Locks are
/// still held; the worker thread is parked on the task's ticket.
pub(crate) struct FinishedMember {
    pub task_id: TaskId,
    pub resources: BTreeSet<ResourceName>,
    pub validation: Option<CommitValidation>,
    pub value: TaskValue,
    pub service: Duration,
    pub setter: TicketSetter,
}

pub(crate) enum CommitMessage {
    /// A worker finished executing and joins the forming group.
    Finished(FinishedMember),
    /// A worker's task body failed. Locks were already released; the forming
    /// group aborts only when the failure poisoned live index state.
    ExecutionFailed { poisons_group: bool, reason: String },
    /// Stop the committer. `abort_forming` distinguishes immediate shutdown
    /// from the orderly variant, which still commits the forming group.
    Shutdown { abort_forming: bool },
}

struct CommitterContext {
    store_manager: Arc<StoreManager>,
    locks: Arc<LockManager>,
    load: Arc<WriteLoad>,
    counters: Arc<TaskCounters>,
    stats: Arc<CommitStats>,
    group_timeout: Duration,
}

/// Owns the committer thread and the channel workers post to.
pub(crate) struct CommitCoordinator {
    sender: Mutex<mpsc::Sender<CommitMessage>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<CommitStats>,
}

impl CommitCoordinator {
    pub(crate) fn spawn(
        store_manager: Arc<StoreManager>,
        locks: Arc<LockManager>,
        load: Arc<WriteLoad>,
        counters: Arc<TaskCounters>,
        group_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<CommitMessage>();
        let stats = Arc::new(CommitStats::default());
        let context = CommitterContext {
            store_manager,
            locks,
            load,
            counters,
            stats: Arc::clone(&stats),
            group_timeout,
        };
        let worker = thread::Builder::new()
            .name("quill-write-committer".to_owned())
            .spawn(move || committer_main(&receiver, &context))
            .ok();
        Self {
            sender: Mutex::new(sender),
            worker: Mutex::new(worker),
            stats,
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<CommitMessage> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn stats(&self) -> &Arc<CommitStats> {
        &self.stats
    }

    /// Stops the committer and joins its thread. With `abort_forming` the
    /// forming group fails with `Interrupted`; otherwise it commits first.
    pub(crate) fn shutdown(&self, abort_forming: bool) {
        let _ = self.sender().send(CommitMessage::Shutdown { abort_forming });
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

fn committer_main(receiver: &mpsc::Receiver<CommitMessage>, context: &CommitterContext) {
    loop {
        let message = match receiver.recv() {
            Ok(message) => message,
            Err(_) => break,
        };
        match message {
            CommitMessage::Finished(member) => {
                context.stats.set_state(GroupState::Forming);
                let mut members = vec![member];
                match form_group(receiver, context, &mut members) {
                    GroupClose::Commit { exit } => {
                        commit_group(context, members);
                        if exit {
                            break;
                        }
                    }
                    GroupClose::Abort { error, exit } => {
                        abort_group(context, members, |_| error.clone());
                        if exit {
                            break;
                        }
                    }
                }
            }
            CommitMessage::ExecutionFailed { .. } => {}
            CommitMessage::Shutdown { .. } => break,
        }
    }

    // Resolve stragglers so no worker stays parked past shutdown.
    while let Ok(message) = receiver.try_recv() {
        if let CommitMessage::Finished(member) = message {
            abort_group(context, vec![member], |_| {
                QuillError::Interrupted("service shut down")
            });
        }
    }
}

enum GroupClose {
    Commit { exit: bool },
    Abort { error: QuillError, exit: bool },
}

enum DrainOutcome {
    Joined(usize),
    Close(GroupClose),
}

/// The formation loop re-checks the executing count on this tick rather than
/// sleeping out the whole commit timer; the timer is logical, not precise.
const FORMING_POLL_TICK: Duration = Duration::from_millis(1);

/// Runs the group-formation rule: members join until the commit timer fires
/// or no executing writer remains that could still join, whichever first.
fn form_group(
    receiver: &mpsc::Receiver<CommitMessage>,
    context: &CommitterContext,
    members: &mut Vec<FinishedMember>,
) -> GroupClose {
    if context.group_timeout.is_zero() {
        // Grouping disabled: the first finisher commits alone.
        return GroupClose::Commit { exit: false };
    }
    let deadline = Instant::now() + context.group_timeout;
    loop {
        match drain_joins(receiver, members) {
            DrainOutcome::Close(close) => return close,
            DrainOutcome::Joined(_) => {}
        }
        if context.load.executing() == 0 {
            // Workers post their join before leaving the executing count, so
            // a zero count means every join is already in the channel; one
            // more drain collects any that raced the check above.
            match drain_joins(receiver, members) {
                DrainOutcome::Close(close) => return close,
                DrainOutcome::Joined(0) => return GroupClose::Commit { exit: false },
                DrainOutcome::Joined(_) => continue,
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return GroupClose::Commit { exit: false };
        }
        match receiver.recv_timeout((deadline - now).min(FORMING_POLL_TICK)) {
            Ok(CommitMessage::Finished(member)) => members.push(member),
            Ok(CommitMessage::ExecutionFailed {
                poisons_group,
                reason,
            }) => {
                if poisons_group {
                    return GroupClose::Abort {
                        error: QuillError::CommitFailed(format!("forming group aborted: {reason}")),
                        exit: false,
                    };
                }
            }
            Ok(CommitMessage::Shutdown { abort_forming }) => return shutdown_close(abort_forming),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return GroupClose::Commit { exit: true };
            }
        }
    }
}

fn drain_joins(
    receiver: &mpsc::Receiver<CommitMessage>,
    members: &mut Vec<FinishedMember>,
) -> DrainOutcome {
    let mut joined = 0;
    loop {
        match receiver.try_recv() {
            Ok(CommitMessage::Finished(member)) => {
                members.push(member);
                joined += 1;
            }
            Ok(CommitMessage::ExecutionFailed {
                poisons_group,
                reason,
            }) => {
                if poisons_group {
                    return DrainOutcome::Close(GroupClose::Abort {
                        error: QuillError::CommitFailed(format!("forming group aborted: {reason}")),
                        exit: false,
                    });
                }
            }
            Ok(CommitMessage::Shutdown { abort_forming }) => {
                return DrainOutcome::Close(shutdown_close(abort_forming));
            }
            Err(mpsc::TryRecvError::Empty) => return DrainOutcome::Joined(joined),
            Err(mpsc::TryRecvError::Disconnected) => {
                return DrainOutcome::Close(GroupClose::Commit { exit: true });
            }
        }
    }
}

fn shutdown_close(abort_forming: bool) -> GroupClose {
    if abort_forming {
        GroupClose::Abort {
            error: QuillError::Interrupted("service shut down"),
            exit: true,
        }
    } else {
        GroupClose::Commit { exit: true }
    }
}

fn commit_group(context: &CommitterContext, members: Vec<FinishedMember>) {
    context.stats.set_state(GroupState::Committing);
    let store = context.store_manager.store();

    // Validation of transaction-commit members runs against committed
    // last-write revisions, which cannot move while the members hold their
    // locks.
    let mut conflict: Option<(usize, String)> = None;
    'members: for (position, member) in members.iter().enumerate() {
        let Some(validation) = &member.validation else {
            continue;
        };
        for (index, key) in &validation.keys {
            let written = store
                .get(index)
                .and_then(|index| index.last_write_revision(key));
            if let Some(revision) = written
                && revision > validation.read_revision
            {
                conflict = Some((
                    position,
                    format!(
                        "{index} written at r{revision} after read revision r{}",
                        validation.read_revision
                    ),
                ));
                break 'members;
            }
        }
    }
    if let Some((conflicted, reason)) = conflict {
        tracing::warn!(%reason, "aborting commit group on validation conflict");
        abort_group(context, members, |position| {
            if position == conflicted {
                QuillError::Validation(reason.clone())
            } else {
                QuillError::CommitFailed(
                    "group aborted by a transaction validation conflict".to_owned(),
                )
            }
        });
        return;
    }

    // One durable sync covers every member.
    let revision = store.next_revision();
    let mut writes = Vec::new();
    for member in &members {
        for resource in &member.resources {
            if let Some(index) = store.get(resource) {
                for (key, value) in index.pending_writes() {
                    writes.push(JournalWrite {
                        index: resource.clone(),
                        key,
                        value,
                    });
                }
            }
        }
    }
    let record = CommitRecord { revision, writes };
    if let Err(error) = context.store_manager.journal().sync(&record) {
        tracing::warn!(%error, "journal sync failed; aborting commit group");
        abort_group(context, members, |_| {
            QuillError::CommitFailed(error.to_string())
        });
        return;
    }

    store.publish(revision, members.iter().flat_map(|member| member.resources.iter()));

    let member_count = members.len() as u64;
    for member in members {
        let FinishedMember {
            task_id,
            resources,
            value,
            service,
            setter,
            ..
        } = member;
        context.locks.release_all(task_id, &resources);
        context.counters.record_success(service);
        setter.complete(Ok(value));
    }
    context.stats.record_committed(member_count);
    tracing::debug!(revision, members = member_count, "commit group durable");
}

fn abort_group(
    context: &CommitterContext,
    members: Vec<FinishedMember>,
    error_for: impl Fn(usize) -> QuillError,
) {
    let store = context.store_manager.store();
    for member in &members {
        store.discard(member.resources.iter());
    }
    for (position, member) in members.into_iter().enumerate() {
        let FinishedMember {
            task_id,
            resources,
            setter,
            ..
        } = member;
        context.locks.release_all(task_id, &resources);
        context.counters.record_failure();
        setter.complete(Err(error_for(position)));
    }
    context.stats.record_aborted();
}
