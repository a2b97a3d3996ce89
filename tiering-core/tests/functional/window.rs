// vim: tw=80
//! Window lifecycle: open, walk, move, close, purge
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use tiering_core::{
    engine::{PoolEvent, PurgeReason},
    property::{Placement, TieringConfig},
};

use super::*;

/// Everything published so far
fn drain(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Commit until `txg` is the open txg
fn advance(pool: &SimPool, txg: u64) {
    use tiering_core::storage::Storage;
    while pool.current_txg() < TxgT(txg) {
        pool.commit();
    }
}

/// A block that always fails to read stays in the window until released.
fn sticky() -> TieringConfig {
    TieringConfig {
        fault_limit: u32::MAX,
        ..Default::default()
    }
}

/// Data blocks only; indirect blocks go straight to the normal class
fn data_only(mut config: TieringConfig) -> TieringConfig {
    config.meta_placement.set(MetaKind::Indirect, Placement::Off);
    config
}

/// Every relocated block ends up with exactly one authoritative copy
#[test_log::test(tokio::test(start_paused = true))]
async fn lifecycle() {
    let h = Harness::new(SimLayout::default(), TieringConfig::default()).await;
    let mut events = h.engine.subscribe();
    let mut prev_finish = None;
    for round in 0..3u64 {
        let start = h.status().start_txg;
        if let Some(finish) = prev_finish {
            // Each window begins right after the last one
            assert_eq!(start, finish + 1);
        }
        h.write(round * 4, 4, 3);
        assert!(h.pool.blocks_on(ClassT::Special) > 0);
        let finish = h.snapshot().await;
        h.wait_closed(finish).await;
        h.pool.commit();

        assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
        for object in 0..(round + 1) * 4 {
            for bp in t!(h.pool.leaves(object)) {
                assert_eq!(h.engine.resolve_dva(bp.birth, bp.dva),
                           ClassT::Normal);
                assert!(!h.pool.is_allocated(bp.dva));
                assert!(h.pool.is_allocated(bp.bulk.unwrap()));
            }
        }
        h.verify(0..(round + 1) * 4, 3).await;
        assert!(h.pool.retained().is_empty());
        assert_eq!(h.pool.releases().last(), Some(&(start, finish)));
        let status = h.status();
        assert_eq!(status.planned, 0);
        assert_eq!(status.moved, 0);
        let evs = drain(&mut events);
        assert!(evs.contains(&PoolEvent::WindowOpened {
            start_txg: start,
            finish_txg: finish
        }));
        assert!(evs.contains(&PoolEvent::WindowClosed {
            start_txg: start,
            finish_txg: finish,
            // Three data blocks and one indirect block per object
            blocks: 16
        }));
        prev_finish = Some(finish);
    }
    assert_eq!(h.pool.bad_frees(), 0);
    h.engine.shutdown().await;
}

/// Open a window [100, 150] holding blocks born in 101, 120 and 149.  It
/// can't close until all three have moved, and reads switch to the normal
/// class only when it does.
#[test_log::test(tokio::test(start_paused = true))]
async fn close_after_drain() {
    let pool = Arc::new(SimPool::new(POOLNAME, &SimLayout::default()));
    advance(&pool, 100);
    let h = Harness::attach(pool, data_only(sticky())).await;
    assert_eq!(h.status().start_txg, TxgT(100));
    for (object, txg) in [(1, 101), (2, 120), (3, 149)] {
        advance(&h.pool, txg);
        h.write(object, 1, 1);
    }
    advance(&h.pool, 150);
    let stuck = t!(h.pool.leaves(3))[0].clone();
    h.pool.inject_read_error(stuck.dva);

    let finish = h.snapshot().await;
    assert_eq!(finish, TxgT(150));
    wait_for("two moves", || h.status().counters.blocks_moved == 2).await;
    let status = h.status();
    assert_eq!(status.counters.blocks_in, 3);
    assert_eq!(h.engine.close_window().await, Err(Error::EBUSY));
    let moved = t!(h.pool.leaves(2))[0].clone();
    assert_eq!(moved.birth, TxgT(120));
    assert_eq!(h.engine.resolve_dva(moved.birth, moved.dva), ClassT::Special);
    assert!(h.pool.is_allocated(moved.dva));

    h.pool.clear_read_errors();
    h.wait_closed(finish).await;
    for object in 1..=3 {
        let bp = t!(h.pool.leaves(object))[0].clone();
        assert_eq!(h.engine.resolve_dva(bp.birth, bp.dva), ClassT::Normal);
        // Freed as of the next commit
        assert!(!h.pool.is_allocated(bp.dva));
    }
    assert_eq!(h.pool.blocks_on(ClassT::Special), 3);
    h.pool.commit();
    assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
    h.verify(1..4, 1).await;
    assert_eq!(h.pool.releases(), vec![(TxgT(100), TxgT(150))]);
    assert_eq!(h.engine.close_window().await, Err(Error::ENOENT));
    h.engine.shutdown().await;
}

/// A block freed by its owner is retired without I/O, and not freed twice
#[test_log::test(tokio::test(start_paused = true))]
async fn deleted_during_window() {
    let h = Harness::new(SimLayout::default(), data_only(sticky())).await;
    h.write(0, 3, 1);
    let victim = t!(h.pool.leaves(1))[0].clone();
    h.pool.inject_read_error(victim.dva);
    let finish = h.snapshot().await;
    wait_for("other moves", || h.status().counters.blocks_moved == 2).await;

    t!(h.pool.free_block(victim.dva));
    assert!(h.engine.notify_deleted(victim.dva));
    h.wait_closed(finish).await;
    h.pool.commit();

    assert_eq!(h.pool.bad_frees(), 0);
    // The bulk copy was never written
    assert!(!h.pool.is_allocated(victim.bulk.unwrap()));
    assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
    for object in [0, 2] {
        let data = t!(h.pool.read_object(&h.engine, object).await);
        assert_eq!(data, contents(object, 1));
    }
    // Untracked blocks are not the engine's business
    assert!(!h.engine.notify_deleted(victim.dva));
    h.engine.shutdown().await;
}

/// No window opens while the engine is locked
#[test_log::test(tokio::test(start_paused = true))]
async fn locked() {
    let h = Harness::new(SimLayout::default(), TieringConfig::default()).await;
    h.write(0, 2, 2);
    h.engine.lock();
    assert!(h.status().locked);
    assert_eq!(h.pool.take_snapshot(&h.listener).await, None);
    assert_eq!(h.status().window_state, WindowState::Closed);
    h.engine.unlock().unwrap();
    let finish = h.snapshot().await;
    h.wait_closed(finish).await;
    h.verify(0..2, 2).await;
    h.engine.shutdown().await;
}

/// An aborted window frees nothing, and the next window covers its blocks
#[test_log::test(tokio::test(start_paused = true))]
async fn abort() {
    let h = Harness::new(SimLayout::default(), data_only(sticky())).await;
    let mut events = h.engine.subscribe();
    h.write(0, 4, 1);
    let stuck = t!(h.pool.leaves(3))[0].clone();
    h.pool.inject_read_error(stuck.dva);
    let start = h.status().start_txg;
    let finish = h.snapshot().await;
    wait_for("three moves", || h.status().counters.blocks_moved == 3).await;

    t!(h.engine.abort_window().await);
    let status = h.status();
    assert_eq!(status.window_state, WindowState::Closed);
    assert_eq!(status.start_txg, start);
    assert_eq!(status.counters.blocks_in, 0);
    assert!(h.pool.retained().is_empty());
    assert_eq!(h.pool.releases(), vec![(start, finish)]);
    assert!(drain(&mut events).contains(&PoolEvent::WindowPurged {
        start_txg: start,
        finish_txg: finish,
        reason: PurgeReason::Aborted
    }));
    h.pool.commit();
    h.pool.clear_read_errors();
    for object in 0..4 {
        let bp = t!(h.pool.leaves(object))[0].clone();
        assert!(h.pool.is_allocated(bp.dva));
        assert_eq!(h.engine.resolve_dva(bp.birth, bp.dva), ClassT::Special);
    }
    h.verify(0..4, 1).await;

    let finish = h.snapshot().await;
    h.wait_closed(finish).await;
    h.pool.commit();
    assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
    assert_eq!(h.pool.bad_frees(), 0);
    h.verify(0..4, 1).await;
    h.engine.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn dataset_destroyed() {
    let h = Harness::new(SimLayout::default(), data_only(sticky())).await;
    let mut events = h.engine.subscribe();
    h.write(0, 2, 1);
    let stuck = t!(h.pool.leaves(0))[0].clone();
    h.pool.inject_read_error(stuck.dva);
    let start = h.status().start_txg;
    let finish = h.snapshot().await;
    t!(h.engine.dataset_destroyed().await);
    assert_eq!(h.status().window_state, WindowState::Closed);
    assert!(drain(&mut events).contains(&PoolEvent::WindowPurged {
        start_txg: start,
        finish_txg: finish,
        reason: PurgeReason::DatasetDestroyed
    }));
    // Nothing to purge
    t!(h.engine.dataset_destroyed().await);
    assert!(drain(&mut events).is_empty());
    h.engine.shutdown().await;
}

/// Blocks written while a window is open belong to the next window
#[test_log::test(tokio::test(start_paused = true))]
async fn writes_during_window() {
    let h = Harness::new(SimLayout::default(), data_only(sticky())).await;
    h.write(0, 2, 1);
    let stuck = t!(h.pool.leaves(0))[0].clone();
    h.pool.inject_read_error(stuck.dva);
    let finish = h.snapshot().await;
    wait_for("one move", || h.status().counters.blocks_moved == 1).await;

    h.write(10, 1, 1);
    let late = t!(h.pool.leaves(10))[0].clone();
    assert!(late.birth > finish);
    assert_eq!(h.engine.resolve_dva(late.birth, late.dva), ClassT::Special);
    h.pool.clear_read_errors();
    h.wait_closed(finish).await;
    h.pool.commit();
    // Still on the fast class, and still authoritative there
    assert!(h.pool.is_allocated(late.dva));
    assert_eq!(h.engine.resolve_dva(late.birth, late.dva), ClassT::Special);
    assert_eq!(h.pool.blocks_on(ClassT::Special), 1);
    h.verify(10..11, 1).await;

    let finish = h.snapshot().await;
    h.wait_closed(finish).await;
    h.pool.commit();
    assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
    h.verify(0..2, 1).await;
    h.verify(10..11, 1).await;
    h.engine.shutdown().await;
}

/// A walk that keeps yielding to the commit path still finishes
#[test_log::test(tokio::test(start_paused = true))]
async fn commit_contention() {
    let h = Harness::new(SimLayout::default(), TieringConfig::default()).await;
    h.write(0, 4, 2);
    h.pool.set_commit_waiters(true);
    let finish = h.snapshot().await;
    h.wait_closed(finish).await;
    h.pool.set_commit_waiters(false);
    h.pool.commit();
    assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
    h.verify(0..4, 2).await;
    h.engine.shutdown().await;
}
