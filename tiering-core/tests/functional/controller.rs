// vim: tw=80
//! The control path, with several pools
use pretty_assertions::assert_eq;

use tiering_core::{
    controller::Controller,
    property::{Placement, Property, PropertyName},
    router::WriteContext,
    sim::NoTiering,
};

use super::*;

#[test_log::test(tokio::test(start_paused = true))]
async fn two_pools() {
    let controller = Controller::default();
    let a = Arc::new(SimPool::new("a", &SimLayout::default()));
    let b = Arc::new(SimPool::new("b", &SimLayout::default()));
    t!(controller.enable("a", TieringConfig::default(), a.collaborators())
       .await);
    t!(controller.enable("b", TieringConfig::default(), b.collaborators())
       .await);
    assert_eq!(controller.list_pools().await, vec!["a", "b"]);

    t!(controller.set_prop("a", Property::RoutingOverride(Some(100))).await);
    assert_eq!(t!(controller.get_prop("a", PropertyName::RoutingOverride)
                  .await),
               Property::RoutingOverride(Some(100)));
    assert_eq!(t!(controller.get_prop("b", PropertyName::RoutingOverride)
                  .await),
               Property::RoutingOverride(None));
    let big = WriteContext::data(1 << 20);
    assert_eq!(controller.select_class("a", &big).await, ClassT::Normal);

    // Lock one pool; the other still takes snapshots
    t!(controller.lock("a").await);
    let la = t!(controller.snapshot_listener("a").await);
    let lb = t!(controller.snapshot_listener("b").await);
    for object in 0..2 {
        t!(a.write_object(&NoTiering, object, &contents(object, 1), false));
        t!(b.write_object(&NoTiering, object, &contents(object, 1), false));
    }
    assert_eq!(a.take_snapshot(&la).await, None);
    let finish = b.take_snapshot(&lb).await.unwrap();
    wait_for("b to close", || b.releases().len() == 1).await;
    assert_eq!(b.releases()[0].1, finish);
    let status = t!(controller.status("a").await);
    assert!(status.locked);
    assert_eq!(status.window_state, WindowState::Closed);
    t!(controller.unlock("a").await);
    assert_eq!(controller.unlock("a").await, Err(Error::EINVAL));
    assert!(a.take_snapshot(&la).await.is_some());

    controller.shutdown().await;
    assert!(controller.list_pools().await.is_empty());
}

/// Disabling leaves the window persisted.  Enabling again resumes it.
#[test_log::test(tokio::test(start_paused = true))]
async fn disable_enable() {
    let controller = Controller::default();
    let pool = Arc::new(SimPool::new(POOLNAME, &SimLayout::default()));
    let mut config = TieringConfig {
        fault_limit: u32::MAX,
        ..Default::default()
    };
    config.meta_placement.set(MetaKind::Indirect, Placement::Off);
    t!(controller.enable(POOLNAME, config.clone(), pool.collaborators())
       .await);
    let listener = t!(controller.snapshot_listener(POOLNAME).await);
    let ctx = WriteContext::data(4096);
    assert_eq!(controller.select_class(POOLNAME, &ctx).await, ClassT::Special);
    t!(pool.write_object(&ForceSpecial, 0, &contents(0, 1), false));
    let bp = t!(pool.leaves(0))[0].clone();
    pool.inject_read_error(bp.dva);
    let finish = pool.take_snapshot(&listener).await.unwrap();
    let start = t!(controller.status(POOLNAME).await).start_txg;
    assert_eq!(controller.close_window(POOLNAME).await, Err(Error::EBUSY));

    t!(controller.disable(POOLNAME).await);
    assert_eq!(controller.status(POOLNAME).await.unwrap_err(), Error::ENOENT);
    pool.clear_read_errors();
    t!(controller.enable(POOLNAME, config, pool.collaborators()).await);
    let status = t!(controller.status(POOLNAME).await);
    assert_eq!(status.start_txg, start);
    assert_eq!(status.finish_txg, finish);
    wait_for("close", || pool.releases() == vec![(start, finish)]).await;
    assert_eq!(t!(controller.resolve_dva(POOLNAME, bp.birth, bp.dva).await),
               ClassT::Normal);
    assert!(!t!(controller.notify_deleted(POOLNAME, bp.dva).await));
    assert_eq!(controller.close_window(POOLNAME).await, Err(Error::ENOENT));
    t!(controller.abort_window(POOLNAME).await);
    t!(controller.dataset_destroyed(POOLNAME).await);
    t!(controller.clear_errors(POOLNAME).await);
    t!(controller.clear_fault(POOLNAME).await);
    controller.shutdown().await;
}
