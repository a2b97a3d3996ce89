// vim: tw=80
//! Error handling: mover faults, walker faults, degraded devices
use std::num::NonZeroU8;

use pretty_assertions::assert_eq;

use tiering_core::{
    engine::{Fault, FaultSource, PoolEvent, PurgeReason},
    property::Placement,
    router::WriteContext,
    storage::Storage,
    vdev::Health,
};

use super::*;

fn config() -> TieringConfig {
    let mut config = TieringConfig::default();
    config.meta_placement.set(MetaKind::Indirect, Placement::Off);
    config
}

fn reads(pool: &SimPool, vdev: VdevT) -> u64 {
    pool.vdev_samples()[vdev as usize].counters.reads
}

/// A block that can't be read faults the engine after `fault_limit` tries,
/// and nothing moves again until the fault is cleared.
#[test_log::test(tokio::test(start_paused = true))]
async fn mover_fault() {
    let h = Harness::new(SimLayout::default(), config()).await;
    let mut events = h.engine.subscribe();
    h.write(0, 1, 1);
    let bp = t!(h.pool.leaves(0))[0].clone();
    assert_eq!(bp.dva.vdev, 0);
    h.pool.inject_read_error(bp.dva);
    let start = h.status().start_txg;
    h.snapshot().await;

    wait_for("fault", || h.status().fault.is_some()).await;
    let status = h.status();
    assert_eq!(status.fault, Some(Fault {
        source: FaultSource::Mover,
        error: Error::EIO
    }));
    assert_eq!(status.counters.blocks_out, 10);
    assert_eq!(reads(&h.pool, 0), 10);
    time::sleep(Duration::from_secs(1)).await;
    assert_eq!(reads(&h.pool, 0), 10);

    // Faulted engines route nothing to the fast class, and the fast copy
    // stays authoritative.
    let ctx = WriteContext::data(4096);
    assert_eq!(h.engine.select_class(&ctx), ClassT::Normal);
    assert_eq!(h.engine.resolve_dva(bp.birth, bp.dva), ClassT::Special);
    assert_eq!(h.pool.take_snapshot(&h.listener).await, None);
    assert_eq!(h.engine.abort_window().await, Err(Error::ENOTRECOVERABLE));
    h.pool.clear_read_errors();
    h.verify(0..1, 1).await;

    t!(h.engine.clear_fault().await);
    let status = h.status();
    assert_eq!(status.fault, None);
    assert_eq!(status.window_state, WindowState::Closed);
    assert_eq!(status.start_txg, start);
    let mut faults = 0;
    let mut purged = false;
    let mut cleared = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::Fault(_) => faults += 1,
            PoolEvent::WindowPurged { reason, .. } => {
                assert_eq!(reason, PurgeReason::ClearFault);
                purged = true;
            }
            PoolEvent::FaultCleared => cleared = true,
            _ => ()
        }
    }
    assert_eq!(faults, 1);
    assert!(purged);
    assert!(cleared);

    let finish = h.snapshot().await;
    h.wait_closed(finish).await;
    h.pool.commit();
    assert!(!h.pool.is_allocated(bp.dva));
    h.verify(0..1, 1).await;
    h.engine.shutdown().await;
}

/// Each failed walk purges the window.  Enough of them fault the engine.
#[test_log::test(tokio::test(start_paused = true))]
async fn walk_faults() {
    let h = Harness::new(SimLayout::default(), config()).await;
    h.write(0, 2, 1);
    h.pool.set_tree_error(Some(Error::EIO));
    for _ in 0..3 {
        assert_eq!(h.status().fault, None);
        h.snapshot().await;
        wait_for("purge", || {
            h.status().window_state == WindowState::Closed
        }).await;
    }
    assert_eq!(h.status().fault, Some(Fault {
        source: FaultSource::Walker,
        error: Error::EIO
    }));
    assert_eq!(h.pool.releases().len(), 3);
    assert!(h.pool.retained().is_empty());
    assert_eq!(h.pool.take_snapshot(&h.listener).await, None);

    h.pool.set_tree_error(None);
    t!(h.engine.clear_fault().await);
    let finish = h.snapshot().await;
    h.wait_closed(finish).await;
    h.verify(0..2, 1).await;
    h.engine.shutdown().await;
}

/// A failed bounding snapshot faults the engine
#[test_log::test(tokio::test(start_paused = true))]
async fn snapshot_error() {
    let h = Harness::new(SimLayout::default(), config()).await;
    let txg = h.pool.current_txg();
    h.listener.notify_error("TestPool@tier-1", Error::ENOSPC, txg).await;
    wait_for("fault", || h.status().fault.is_some()).await;
    assert_eq!(h.status().fault, Some(Fault {
        source: FaultSource::Snapshot,
        error: Error::ENOSPC
    }));
    h.engine.shutdown().await;
}

/// A window that can't be persisted is never opened
#[test_log::test(tokio::test(start_paused = true))]
async fn meta_store_error() {
    let h = Harness::new(SimLayout::default(), config()).await;
    h.write(0, 1, 1);
    let start = h.status().start_txg;
    h.pool.set_meta_error(Some(Error::EIO));
    assert_eq!(h.pool.take_snapshot(&h.listener).await, None);
    let status = h.status();
    assert_eq!(status.window_state, WindowState::Closed);
    assert_eq!(status.start_txg, start);
    assert_eq!(status.fault, Some(Fault {
        source: FaultSource::MetaStore,
        error: Error::EIO
    }));
    h.engine.shutdown().await;
}

/// A degraded fast device stops fast class writes until errors are cleared
#[test_log::test(tokio::test(start_paused = true))]
async fn degraded_special() {
    let h = Harness::new(SimLayout::default(), config()).await;
    let mut events = h.engine.subscribe();
    let ctx = WriteContext::metadata(MetaKind::Dnode, 512);
    assert_eq!(h.engine.select_class(&ctx), ClassT::Special);

    h.pool.set_health(0, Health::Degraded(NonZeroU8::new(1).unwrap()));
    h.engine.monitor_tick();
    assert!(h.status().special_errored);
    assert_eq!(h.engine.select_class(&ctx), ClassT::Normal);
    assert_eq!(events.try_recv(), Ok(PoolEvent::SpecialDisabled));

    // Errors stay latched after the device recovers
    h.pool.set_health(0, Health::Online);
    h.engine.monitor_tick();
    assert_eq!(h.engine.select_class(&ctx), ClassT::Normal);

    h.engine.clear_errors();
    assert!(!h.status().special_errored);
    assert_eq!(events.try_recv(), Ok(PoolEvent::SpecialEnabled));
    assert_eq!(h.engine.select_class(&ctx), ClassT::Special);
    h.engine.shutdown().await;
}

/// A failed bulk write is retried like a failed read
#[test_log::test(tokio::test(start_paused = true))]
async fn write_error() {
    let h = Harness::new(SimLayout::default(), config()).await;
    h.write(0, 1, 1);
    let bp = t!(h.pool.leaves(0))[0].clone();
    h.pool.inject_write_error(bp.bulk.unwrap().vdev);
    h.snapshot().await;
    wait_for("fault", || h.status().fault.is_some()).await;
    assert_eq!(h.status().fault.unwrap().source, FaultSource::Mover);
    assert_eq!(h.engine.resolve_dva(bp.birth, bp.dva), ClassT::Special);
    h.verify(0..1, 1).await;
    h.engine.shutdown().await;
}

/// A fast copy that can't be freed keeps the window in its delete phase.
/// Clearing the fault retries the close, freeing only what's left.
#[test_log::test(tokio::test(start_paused = true))]
async fn free_error() {
    let h = Harness::new(SimLayout::default(), config()).await;
    let mut events = h.engine.subscribe();
    h.write(0, 2, 1);
    let stuck = t!(h.pool.leaves(0))[0].clone();
    let freed = t!(h.pool.leaves(1))[0].clone();
    h.pool.inject_free_error(stuck.dva);
    let start = h.status().start_txg;
    let finish = h.snapshot().await;

    wait_for("fault", || h.status().fault.is_some()).await;
    let status = h.status();
    assert_eq!(status.fault, Some(Fault {
        source: FaultSource::Free,
        error: Error::EIO
    }));
    assert_eq!(status.window_state, WindowState::Draining);
    assert_eq!(status.start_txg, start);
    assert_eq!(status.finish_txg, finish);
    assert!(h.pool.releases().is_empty());
    // Only the unfreed copy is still authoritative
    assert_eq!(h.engine.resolve_dva(stuck.birth, stuck.dva), ClassT::Special);
    assert_eq!(h.engine.resolve_dva(freed.birth, freed.dva), ClassT::Normal);
    h.pool.commit();
    assert!(h.pool.is_allocated(stuck.dva));
    assert!(!h.pool.is_allocated(freed.dva));

    assert_eq!(h.engine.dataset_destroyed().await, Err(Error::EBUSY));

    h.pool.clear_free_errors();
    t!(h.engine.clear_fault().await);
    h.wait_closed(finish).await;
    h.pool.commit();
    assert!(!h.pool.is_allocated(stuck.dva));
    assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
    assert_eq!(h.pool.bad_frees(), 0);
    assert_eq!(h.pool.releases(), vec![(start, finish)]);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, PoolEvent::WindowPurged { .. }));
    }
    h.verify(0..2, 1).await;
    h.engine.shutdown().await;
}
