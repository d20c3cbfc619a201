//! End-to-end scenarios for the concurrency manager: serialization,
//! coalescing, validation, backpressure, and lifecycle.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use googletest::prelude::*;
use quill_common::config::ConcurrencyConfig;
use quill_common::error::QuillError;
use quill_common::ids::ResourceName;
use quill_core::task::{ReadView, TaskSpec, TaskValue};
use quill_storage::journal::{Journal, MemoryJournal};
use quill_storage::resources::StoreManager;
use rstest::rstest;

use crate::group::GroupState;
use crate::manager::ConcurrencyManager;

fn name(text: &str) -> ResourceName {
    ResourceName::new(text).expect("test name must be valid")
}

struct Engine {
    manager: ConcurrencyManager,
    journal: Arc<MemoryJournal>,
    store_manager: Arc<StoreManager>,
}

fn engine(config: ConcurrencyConfig) -> Engine {
    let journal = Arc::new(MemoryJournal::new());
    let store_manager = Arc::new(StoreManager::new(
        Arc::clone(&journal) as Arc<dyn Journal>
    ));
    let manager = ConcurrencyManager::new(config, Arc::clone(&store_manager))
        .expect("default-shaped configuration must build");
    Engine {
        manager,
        journal,
        store_manager,
    }
}

fn put_task(index: &str, key: &[u8], value: &[u8]) -> TaskSpec {
    let index = name(index);
    let key = key.to_vec();
    let value = value.to_vec();
    TaskSpec::unisolated(
        BTreeSet::from([index.clone()]),
        Box::new(move |context| {
            context.write(&index, &key, &value)?;
            Ok(TaskValue::Unit)
        }),
    )
    .expect("declared resources must be accepted")
}

fn get_task(index: &str, key: &[u8], view: ReadView) -> TaskSpec {
    let index = name(index);
    let key = key.to_vec();
    TaskSpec::read_only(
        view,
        Box::new(move |context| {
            Ok(context
                .read(&index, &key)?
                .map_or(TaskValue::Absent, TaskValue::Bytes))
        }),
    )
}

#[rstest]
fn writers_on_one_index_serialize_and_all_commit() {
    let engine = engine(ConcurrencyConfig::default());
    let in_body = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut tickets = Vec::new();
    for sequence in 0..100_u32 {
        let in_body = Arc::clone(&in_body);
        let overlaps = Arc::clone(&overlaps);
        let index = name("idx-a");
        let spec = TaskSpec::unisolated(
            BTreeSet::from([index.clone()]),
            Box::new(move |context| {
                if in_body.fetch_add(1, Ordering::SeqCst) != 0 {
                    let _ = overlaps.fetch_add(1, Ordering::SeqCst);
                }
                context.write(&index, b"seq", &sequence.to_be_bytes())?;
                let _ = in_body.fetch_sub(1, Ordering::SeqCst);
                Ok(TaskValue::Unit)
            }),
        )
        .expect("declared resources must be accepted");
        tickets.push(engine.manager.submit(spec).expect("admission must succeed"));
    }

    for ticket in &tickets {
        assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    }
    assert_that!(overlaps.load(Ordering::SeqCst), eq(0_usize));
    assert_that!(engine.journal.sync_count() <= 100, eq(true));
    assert_that!(engine.journal.sync_count() >= 1, eq(true));

    let counters = engine.manager.counters();
    assert_that!(counters.write.submitted, eq(100_u64));
    assert_that!(counters.write.completed, eq(100_u64));
    assert_that!(counters.commit.members_committed, eq(100_u64));
    assert_that!(
        engine
            .manager
            .lock_manager()
            .expect("manager is open")
            .held_count(),
        eq(0_usize)
    );
}

#[rstest]
fn writers_on_disjoint_indices_overlap_in_time() {
    let engine = engine(ConcurrencyConfig::default());
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tickets = Vec::new();
    for stream in ["idx-a", "idx-b"] {
        for _ in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let index = name(stream);
            let spec = TaskSpec::unisolated(
                BTreeSet::from([index.clone()]),
                Box::new(move |context| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    context.write(&index, b"k", b"v")?;
                    let _ = running.fetch_sub(1, Ordering::SeqCst);
                    Ok(TaskValue::Unit)
                }),
            )
            .expect("declared resources must be accepted");
            tickets.push(engine.manager.submit(spec).expect("admission must succeed"));
        }
    }

    for ticket in &tickets {
        assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    }
    assert_that!(peak.load(Ordering::SeqCst) >= 2, eq(true));
}

#[rstest]
fn concurrent_finishers_coalesce_into_one_commit_group() {
    let mut config = ConcurrencyConfig::default();
    config.write_pool.group_commit_timeout = Duration::from_millis(250);
    let engine = engine(config);

    let gate = Arc::new(Barrier::new(8));
    let mut tickets = Vec::new();
    for stream in 0..8_usize {
        let gate = Arc::clone(&gate);
        let index = name(&format!("idx-{stream}"));
        let spec = TaskSpec::unisolated(
            BTreeSet::from([index.clone()]),
            Box::new(move |context| {
                let _ = gate.wait();
                context.write(&index, b"k", b"v")?;
                Ok(TaskValue::Unit)
            }),
        )
        .expect("declared resources must be accepted");
        tickets.push(engine.manager.submit(spec).expect("admission must succeed"));
    }

    for ticket in &tickets {
        assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    }
    // All eight finished within one forming window, so they share one sync.
    assert_that!(engine.journal.sync_count(), eq(1_u64));
    let commit = engine.manager.counters().commit;
    assert_that!(commit.groups_committed, eq(1_u64));
    assert_that!(commit.members_committed, eq(8_u64));
    assert_that!(
        engine.manager.counters().commit.groups_aborted,
        eq(0_u64)
    );

    let stats = engine.manager.counters();
    assert_that!(stats.write.completed, eq(8_u64));
    assert_that!(engine.manager.commit_group_state(), eq(GroupState::Done));
}

#[rstest]
fn zero_group_timeout_commits_every_task_alone() {
    let mut config = ConcurrencyConfig::default();
    config.write_pool.group_commit_timeout = Duration::ZERO;
    let engine = engine(config);

    for stream in 0..10_usize {
        let ticket = engine
            .manager
            .submit(put_task(&format!("idx-{stream}"), b"k", b"v"))
            .expect("admission must succeed");
        assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    }

    assert_that!(engine.journal.sync_count(), eq(10_u64));
    assert_that!(
        engine.manager.counters().commit.groups_committed,
        eq(10_u64)
    );
}

#[rstest]
fn historical_reads_observe_exactly_their_revision() {
    let engine = engine(ConcurrencyConfig::default());
    engine
        .manager
        .submit(put_task("idx-a", b"k", b"v1"))
        .expect("admission must succeed")
        .join()
        .expect("first write must commit");
    engine
        .manager
        .submit(put_task("idx-a", b"k", b"v2"))
        .expect("admission must succeed")
        .join()
        .expect("second write must commit");

    let at_one = engine
        .manager
        .submit(get_task("idx-a", b"k", ReadView::Historical(1)))
        .expect("admission must succeed")
        .join();
    assert_that!(at_one, eq(&Ok(TaskValue::Bytes(b"v1".to_vec()))));

    let latest = engine
        .manager
        .submit(get_task("idx-a", b"k", ReadView::LastCommitted))
        .expect("admission must succeed")
        .join();
    assert_that!(latest, eq(&Ok(TaskValue::Bytes(b"v2".to_vec()))));

    let before_any = engine
        .manager
        .submit(get_task("idx-a", b"k", ReadView::Historical(0)))
        .expect("admission must succeed")
        .join();
    assert_that!(before_any, eq(&Ok(TaskValue::Absent)));
}

#[rstest]
fn transaction_commit_merges_buffered_writes() {
    let engine = engine(ConcurrencyConfig::default());
    let txid = engine
        .manager
        .begin_transaction()
        .expect("open manager must issue transactions");

    let index = name("idx-a");
    let spec = TaskSpec::read_write_tx(
        txid,
        BTreeSet::from([index.clone()]),
        Box::new(move |context| {
            context.write(&index, b"k", b"buffered")?;
            Ok(TaskValue::Unit)
        }),
    );
    engine
        .manager
        .submit(spec)
        .expect("admission must succeed")
        .join()
        .expect("active-phase task must succeed");

    // Nothing is visible before the commit task runs.
    let before = engine
        .manager
        .submit(get_task("idx-a", b"k", ReadView::LastCommitted))
        .expect("admission must succeed")
        .join();
    assert_that!(before, eq(&Ok(TaskValue::Absent)));

    let commit = engine
        .manager
        .commit_transaction(txid)
        .expect("commit task must be admitted");
    assert_that!(commit.join(), eq(&Ok(TaskValue::Unit)));

    let after = engine
        .manager
        .submit(get_task("idx-a", b"k", ReadView::LastCommitted))
        .expect("admission must succeed")
        .join();
    assert_that!(after, eq(&Ok(TaskValue::Bytes(b"buffered".to_vec()))));
    assert_that!(
        engine
            .manager
            .transaction_registry()
            .expect("manager is open")
            .active_count(),
        eq(0_usize)
    );
}

#[rstest]
fn stale_transaction_commit_fails_validation_without_hurting_writers() {
    let engine = engine(ConcurrencyConfig::default());
    let txid = engine
        .manager
        .begin_transaction()
        .expect("open manager must issue transactions");

    let index = name("idx-x");
    let spec = TaskSpec::read_write_tx(
        txid,
        BTreeSet::from([index.clone()]),
        Box::new(move |context| {
            context.write(&index, b"k", b"from-tx")?;
            Ok(TaskValue::Unit)
        }),
    );
    engine
        .manager
        .submit(spec)
        .expect("admission must succeed")
        .join()
        .expect("active-phase task must succeed");

    // An unisolated writer commits the same key after the transaction's read
    // revision.
    let unisolated = engine
        .manager
        .submit(put_task("idx-x", b"k", b"from-unisolated"))
        .expect("admission must succeed");
    assert_that!(unisolated.join(), eq(&Ok(TaskValue::Unit)));

    let commit = engine
        .manager
        .commit_transaction(txid)
        .expect("commit task must be admitted");
    let outcome = commit.join();
    assert_that!(
        matches!(outcome, Err(QuillError::Validation(_))),
        eq(true)
    );

    // The conflicting writer's value survived the aborted merge.
    let latest = engine
        .manager
        .submit(get_task("idx-x", b"k", ReadView::LastCommitted))
        .expect("admission must succeed")
        .join();
    assert_that!(latest, eq(&Ok(TaskValue::Bytes(b"from-unisolated".to_vec()))));
    assert_that!(
        engine.manager.counters().commit.groups_aborted >= 1,
        eq(true)
    );
}

#[rstest]
fn journal_failure_aborts_the_whole_group_and_manager_stays_open() {
    let mut config = ConcurrencyConfig::default();
    config.write_pool.group_commit_timeout = Duration::from_millis(250);
    let engine = engine(config);
    engine.journal.fail_next_syncs(1);

    let gate = Arc::new(Barrier::new(2));
    let mut tickets = Vec::new();
    for stream in ["idx-a", "idx-b"] {
        let gate = Arc::clone(&gate);
        let index = name(stream);
        let spec = TaskSpec::unisolated(
            BTreeSet::from([index.clone()]),
            Box::new(move |context| {
                let _ = gate.wait();
                context.write(&index, b"k", b"doomed")?;
                Ok(TaskValue::Unit)
            }),
        )
        .expect("declared resources must be accepted");
        tickets.push(engine.manager.submit(spec).expect("admission must succeed"));
    }

    for ticket in &tickets {
        let outcome = ticket.join();
        assert_that!(
            matches!(outcome, Err(QuillError::CommitFailed(_))),
            eq(true)
        );
    }
    // Aborted writes are not observable afterwards.
    let read = engine
        .manager
        .submit(get_task("idx-a", b"k", ReadView::LastCommitted))
        .expect("admission must succeed")
        .join();
    assert_that!(read, eq(&Ok(TaskValue::Absent)));

    // The manager stays open and later commits succeed.
    assert_that!(engine.manager.is_open(), eq(true));
    let retry = engine
        .manager
        .submit(put_task("idx-a", b"k", b"recovered"))
        .expect("admission must succeed");
    assert_that!(retry.join(), eq(&Ok(TaskValue::Unit)));
}

#[rstest]
fn execution_failure_fails_alone_without_aborting_the_group() {
    let engine = engine(ConcurrencyConfig::default());

    let index = name("idx-a");
    let failing = TaskSpec::unisolated(
        BTreeSet::from([index.clone()]),
        Box::new(move |context| {
            context.write(&index, b"k", b"partial")?;
            Err(QuillError::Io("task body failed".to_owned()))
        }),
    )
    .expect("declared resources must be accepted");
    let failed = engine
        .manager
        .submit(failing)
        .expect("admission must succeed");
    assert_that!(
        matches!(failed.join(), Err(QuillError::Io(_))),
        eq(true)
    );

    let survivor = engine
        .manager
        .submit(put_task("idx-b", b"k", b"v"))
        .expect("admission must succeed");
    assert_that!(survivor.join(), eq(&Ok(TaskValue::Unit)));
    assert_that!(engine.manager.counters().commit.groups_aborted, eq(0_u64));

    // The failed task's staged writes were discarded with its locks.
    let read = engine
        .manager
        .submit(get_task("idx-a", b"k", ReadView::LastCommitted))
        .expect("admission must succeed")
        .join();
    assert_that!(read, eq(&Ok(TaskValue::Absent)));
}

#[rstest]
fn saturated_bounded_queue_applies_backpressure_without_dropping_tasks() {
    let mut config = ConcurrencyConfig::default();
    config.write_pool.core_pool_size = 2;
    config.write_pool.maximum_pool_size = 2;
    config.write_pool.queue_capacity = 10;
    config.backpressure.delay = Duration::from_millis(5);
    config.backpressure.retry_limit = 1000;
    let engine = engine(config);

    let mut tickets = Vec::new();
    for _ in 0..60_usize {
        let index = name("idx-hot");
        let spec = TaskSpec::unisolated(
            BTreeSet::from([index.clone()]),
            Box::new(move |context| {
                std::thread::sleep(Duration::from_millis(2));
                context.write(&index, b"k", b"v")?;
                Ok(TaskValue::Unit)
            }),
        )
        .expect("declared resources must be accepted");
        tickets.push(
            engine
                .manager
                .submit(spec)
                .expect("backpressure must delay, not reject"),
        );
    }

    for ticket in &tickets {
        assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    }
    assert_that!(engine.manager.counters().write.completed, eq(60_u64));
}

#[rstest]
fn disabled_backpressure_surfaces_queue_overflow() {
    let mut config = ConcurrencyConfig::default();
    config.write_pool.core_pool_size = 1;
    config.write_pool.maximum_pool_size = 1;
    config.write_pool.queue_capacity = 2;
    config.backpressure.enabled = false;
    let engine = engine(config);

    let gate = Arc::new(Barrier::new(2));
    let blocker_gate = Arc::clone(&gate);
    let index = name("idx-a");
    let blocker = TaskSpec::unisolated(
        BTreeSet::from([index.clone()]),
        Box::new(move |context| {
            let _ = blocker_gate.wait();
            std::thread::sleep(Duration::from_millis(50));
            context.write(&index, b"k", b"v")?;
            Ok(TaskValue::Unit)
        }),
    )
    .expect("declared resources must be accepted");
    let running = engine
        .manager
        .submit(blocker)
        .expect("first task occupies the worker");
    let _ = gate.wait();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        outcomes.push(engine.manager.submit(put_task("idx-a", b"k", b"v")));
    }
    let rejected = outcomes
        .iter()
        .filter(|outcome| {
            matches!(outcome, Err(QuillError::Rejected("pool queue overflow")))
        })
        .count();
    assert_that!(rejected, eq(1_usize));

    assert_that!(running.join(), eq(&Ok(TaskValue::Unit)));
    for outcome in outcomes.into_iter().flatten() {
        assert_that!(outcome.join(), eq(&Ok(TaskValue::Unit)));
    }
}

#[rstest]
fn orderly_shutdown_finishes_inflight_writers_and_rejects_new_tasks() {
    let mut config = ConcurrencyConfig::default();
    config.shutdown_timeout = Duration::from_secs(5);
    let engine = engine(config);

    let mut tickets = Vec::new();
    for stream in 0..20_usize {
        let index = name(&format!("idx-{stream}"));
        let spec = TaskSpec::unisolated(
            BTreeSet::from([index.clone()]),
            Box::new(move |context| {
                std::thread::sleep(Duration::from_millis(30));
                context.write(&index, b"k", b"v")?;
                Ok(TaskValue::Unit)
            }),
        )
        .expect("declared resources must be accepted");
        tickets.push(engine.manager.submit(spec).expect("admission must succeed"));
    }

    engine.manager.shutdown();

    for ticket in &tickets {
        assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    }
    assert_that!(engine.manager.is_open(), eq(false));
    assert_that!(
        engine.manager.submit(put_task("idx-a", b"k", b"v")).err(),
        eq(&Some(QuillError::Rejected("service is shut down")))
    );
    assert_that!(
        engine.manager.lock_manager().err(),
        eq(&Some(QuillError::InvalidState(
            "concurrency manager is shut down"
        )))
    );
}

#[rstest]
fn immediate_shutdown_cancels_queued_tasks() {
    let mut config = ConcurrencyConfig::default();
    config.write_pool.core_pool_size = 1;
    config.write_pool.maximum_pool_size = 1;
    config.write_pool.queue_capacity = 100;
    let engine = engine(config);

    let gate = Arc::new(Barrier::new(2));
    let blocker_gate = Arc::clone(&gate);
    let index = name("idx-a");
    let blocker = TaskSpec::unisolated(
        BTreeSet::from([index.clone()]),
        Box::new(move |context| {
            let _ = blocker_gate.wait();
            std::thread::sleep(Duration::from_millis(40));
            context.write(&index, b"k", b"v")?;
            Ok(TaskValue::Unit)
        }),
    )
    .expect("declared resources must be accepted");
    let running = engine
        .manager
        .submit(blocker)
        .expect("first task occupies the worker");

    let mut queued = Vec::new();
    for _ in 0..4 {
        queued.push(
            engine
                .manager
                .submit(put_task("idx-a", b"k", b"v"))
                .expect("queued tasks must be admitted"),
        );
    }
    let _ = gate.wait();
    engine.manager.shutdown_now();

    for ticket in &queued {
        assert_that!(ticket.join(), eq(&Err(QuillError::Cancelled)));
    }
    // The in-flight task never reaches a durable commit once the committer
    // is gone; it resolves as cancelled or interrupted.
    let outcome = running.join();
    assert_that!(
        matches!(
            outcome,
            Err(QuillError::Cancelled | QuillError::Interrupted(_))
        ),
        eq(true)
    );
    assert_that!(engine.manager.is_open(), eq(false));
}

#[rstest]
fn admission_waits_for_store_readiness() {
    let journal = Arc::new(MemoryJournal::new());
    let store_manager = Arc::new(StoreManager::new_pending(
        Arc::clone(&journal) as Arc<dyn Journal>
    ));
    let mut config = ConcurrencyConfig::default();
    config.readiness_timeout = Duration::from_millis(30);
    let manager = ConcurrencyManager::new(config, Arc::clone(&store_manager))
        .expect("configuration must build");

    assert_that!(
        manager.submit(put_task("idx-a", b"k", b"v")).err(),
        eq(&Some(QuillError::Rejected("store manager is not available")))
    );

    store_manager.mark_running();
    let ticket = manager
        .submit(put_task("idx-a", b"k", b"v"))
        .expect("ready store must admit tasks");
    assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    manager.shutdown();
}

#[rstest]
fn poisoned_store_closes_the_manager_with_a_fatal_error() {
    let engine = engine(ConcurrencyConfig::default());
    engine.store_manager.poison();

    let outcome = engine.manager.submit(put_task("idx-a", b"k", b"v"));
    assert_that!(
        matches!(outcome, Err(QuillError::Fatal(_))),
        eq(true)
    );
    assert_that!(engine.manager.is_open(), eq(false));
}

#[rstest]
fn submit_all_returns_only_after_every_ticket_resolves() {
    let engine = engine(ConcurrencyConfig::default());
    let specs = (0..5_usize)
        .map(|stream| put_task(&format!("idx-{stream}"), b"k", b"v"))
        .collect::<Vec<_>>();

    let tickets = engine
        .manager
        .submit_all(specs)
        .expect("admission must succeed");
    assert_that!(tickets.len(), eq(5_usize));
    for ticket in &tickets {
        assert_that!(ticket.is_done(), eq(true));
        assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    }
}

#[rstest]
fn timed_submit_all_returns_early_and_cancels_unfinished_tasks() {
    let mut config = ConcurrencyConfig::default();
    config.write_pool.core_pool_size = 1;
    config.write_pool.maximum_pool_size = 1;
    let engine = engine(config);

    let specs = (0..4_usize)
        .map(|_| {
            let index = name("idx-a");
            TaskSpec::unisolated(
                BTreeSet::from([index.clone()]),
                Box::new(move |context| {
                    std::thread::sleep(Duration::from_millis(100));
                    context.write(&index, b"k", b"v")?;
                    Ok(TaskValue::Unit)
                }),
            )
            .expect("declared resources must be accepted")
        })
        .collect::<Vec<_>>();

    let started = Instant::now();
    let tickets = engine
        .manager
        .submit_all_timeout(specs, Duration::from_millis(50))
        .expect("admission must succeed");
    assert_that!(started.elapsed() < Duration::from_millis(400), eq(true));
    assert_that!(tickets.len(), eq(4_usize));

    let outcomes = tickets
        .iter()
        .map(|ticket| ticket.join())
        .collect::<Vec<_>>();
    let cancelled = outcomes
        .iter()
        .filter(|outcome| **outcome == Err(QuillError::Cancelled))
        .count();
    assert_that!(cancelled >= 1, eq(true));
}

#[rstest]
fn counter_surface_reports_pools_commits_and_sampler() {
    let mut config = ConcurrencyConfig::default();
    config.collect_queue_statistics = true;
    let engine = engine(config);

    engine
        .manager
        .submit(put_task("idx-a", b"k", b"v"))
        .expect("admission must succeed")
        .join()
        .expect("write must commit");
    engine
        .manager
        .submit(get_task("idx-a", b"k", ReadView::LastCommitted))
        .expect("admission must succeed")
        .join()
        .expect("read must succeed");

    let counters = engine.manager.counters();
    assert_that!(counters.write.completed, eq(1_u64));
    assert_that!(counters.read.completed, eq(1_u64));
    assert_that!(counters.commit.groups_committed, eq(1_u64));
    assert_that!(counters.queues.is_some(), eq(true));
    assert_that!(counters.elapsed > Duration::ZERO, eq(true));
    engine.manager.shutdown();
}

#[rstest]
fn historical_reads_run_concurrently_on_the_handoff_pool() {
    let engine = engine(ConcurrencyConfig::default());
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tickets = Vec::new();
    for _ in 0..4_usize {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let spec = TaskSpec::read_only(
            ReadView::LastCommitted,
            Box::new(move |_| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                let _ = running.fetch_sub(1, Ordering::SeqCst);
                Ok(TaskValue::Unit)
            }),
        );
        tickets.push(engine.manager.submit(spec).expect("admission must succeed"));
    }

    for ticket in &tickets {
        assert_that!(ticket.join(), eq(&Ok(TaskValue::Unit)));
    }
    assert_that!(peak.load(Ordering::SeqCst) >= 2, eq(true));
}
