// vim: tw=80
//! Write routing and the watermark monitor, as seen by the pool
use pretty_assertions::assert_eq;

use tiering_core::{
    engine::PoolEvent,
    property::{Placement, Property},
    router::{Watermark, WriteContext},
    storage::Storage,
};

use super::*;

/// Metadata goes to the fast class.  Large data is spread between the classes
/// by a weighted coin flip.
#[test_log::test(tokio::test(start_paused = true))]
async fn classes() {
    let h = Harness::new(SimLayout::default(), TieringConfig::default()).await;
    let dnode = WriteContext::metadata(MetaKind::Dnode, 512);
    assert_eq!(h.engine.select_class(&dnode), ClassT::Special);
    let small = WriteContext::data(4096);
    assert_eq!(h.engine.select_class(&small), ClassT::Special);

    let big = WriteContext::data(4 << 20);
    let classes = (0..3)
        .map(|_| h.engine.select_class(&big))
        .collect::<Vec<_>>();
    assert_eq!(classes, [ClassT::Normal, ClassT::Normal, ClassT::Special]);
    h.engine.shutdown().await;
}

/// Placement properties take effect on the next write
#[test_log::test(tokio::test(start_paused = true))]
async fn properties() {
    let h = Harness::new(SimLayout::default(), TieringConfig::default()).await;
    t!(h.engine.set_property(Property::MetaPlacement(MetaKind::Dnode,
                                                     Placement::Off)));
    let dnode = WriteContext::metadata(MetaKind::Dnode, 512);
    assert_eq!(h.engine.select_class(&dnode), ClassT::Normal);

    t!(h.engine.set_property(Property::RoutingOverride(Some(100))));
    assert_eq!(h.status().to_normal_ratio, 100);
    let big = WriteContext::data(1 << 20);
    for _ in 0..10 {
        assert_eq!(h.engine.select_class(&big), ClassT::Normal);
    }

    t!(h.engine.set_property(Property::Enabled(false)));
    let small = WriteContext::data(512);
    assert_eq!(h.engine.select_class(&small), ClassT::Normal);
    h.write(0, 1, 1);
    assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
    assert_eq!(h.engine.set_property(Property::LowWatermark(101)),
               Err(Error::EINVAL));
    h.engine.shutdown().await;
}

/// Fill the fast class past both watermarks, then drain it.
#[test_log::test(tokio::test(start_paused = true))]
async fn watermarks() {
    const BSIZE: usize = 10_485;
    let layout = SimLayout {
        special_capacity: 1 << 20,
        ..Default::default()
    };
    let config = TieringConfig {
        low_watermark: 30,
        high_watermark: 90,
        // Only manual ticks
        sample_interval_ms: 3_600_000,
        balance_ticks: u32::MAX,
        ..Default::default()
    };
    let h = Harness::new(layout, config).await;
    let mut events = h.engine.subscribe();
    let fill = |upto: u64, from: u64| {
        for object in from..upto {
            t!(h.pool.write_object(&ForceSpecial, object,
                                   &[vec![object as u8; BSIZE]], false));
        }
    };

    fill(20, 0);
    h.engine.monitor_tick();
    let status = h.status();
    assert_eq!(status.special_alloc, 20);
    assert_eq!(status.watermark, Watermark::None);
    assert!(events.try_recv().is_err());

    fill(31, 20);
    h.engine.monitor_tick();
    let status = h.status();
    assert_eq!(status.special_alloc, 31);
    assert_eq!(status.watermark, Watermark::Low);
    assert_eq!(status.correction_rate, 1);
    assert_eq!(events.try_recv(), Ok(PoolEvent::WatermarkChanged {
        from: Watermark::None,
        to: Watermark::Low
    }));

    // At the high watermark, but not above it
    fill(90, 31);
    h.engine.monitor_tick();
    let status = h.status();
    assert_eq!(status.special_alloc, 90);
    assert_eq!(status.watermark, Watermark::Low);
    assert_eq!(status.correction_rate, 100);

    fill(96, 90);
    h.engine.monitor_tick();
    let status = h.status();
    assert_eq!(status.special_alloc, 96);
    assert_eq!(status.watermark, Watermark::High);
    assert_eq!(status.to_normal_ratio, 0);
    assert_eq!(events.try_recv(), Ok(PoolEvent::WatermarkChanged {
        from: Watermark::Low,
        to: Watermark::High
    }));
    let dnode = WriteContext::metadata(MetaKind::Dnode, 512);
    assert_eq!(h.engine.select_class(&dnode), ClassT::Normal);
    assert_eq!(h.engine.select_class(&WriteContext::data(512)),
               ClassT::Normal);

    // HIGH holds until allocation falls to the low watermark
    for object in 50..96 {
        t!(h.pool.delete_object(&ForceSpecial, object));
    }
    h.pool.commit();
    h.engine.monitor_tick();
    let status = h.status();
    assert_eq!(status.special_alloc, 50);
    assert_eq!(status.watermark, Watermark::High);

    for object in 30..50 {
        t!(h.pool.delete_object(&ForceSpecial, object));
    }
    h.pool.commit();
    h.engine.monitor_tick();
    let status = h.status();
    assert_eq!(status.special_alloc, 30);
    assert_eq!(status.watermark, Watermark::None);
    assert_eq!(status.to_normal_ratio, status.base_ratio);
    assert_eq!(events.try_recv(), Ok(PoolEvent::WatermarkChanged {
        from: Watermark::High,
        to: Watermark::None
    }));
    assert_eq!(h.engine.select_class(&dnode), ClassT::Special);
    assert_eq!(h.pool.class_alloc_percentage(ClassT::Special), 30);
    h.engine.shutdown().await;
}

/// The load balancer shifts writes away from whichever class is busy
#[test_log::test(tokio::test(start_paused = true))]
async fn balance() {
    let config = TieringConfig {
        sample_interval_ms: 3_600_000,
        balance_ticks: 1,
        ..Default::default()
    };
    let h = Harness::new(SimLayout::default(), config).await;
    h.engine.monitor_tick();
    assert_eq!(h.status().base_ratio, 50);

    time::advance(Duration::from_secs(1)).await;
    h.pool.add_load(ClassT::Special, 900_000_000);
    h.engine.monitor_tick();
    let status = h.status();
    assert_eq!(status.stats.special.utilization, 90);
    assert_eq!(status.base_ratio, 55);
    assert_eq!(status.to_normal_ratio, 55);

    for _ in 0..2 {
        time::advance(Duration::from_secs(1)).await;
        h.pool.add_load(ClassT::Normal, 900_000_000);
        h.engine.monitor_tick();
    }
    assert_eq!(h.status().base_ratio, 45);

    // A pinned ratio ignores the load
    t!(h.engine.set_property(Property::RoutingOverride(Some(20))));
    time::advance(Duration::from_secs(1)).await;
    h.pool.add_load(ClassT::Special, 900_000_000);
    h.engine.monitor_tick();
    assert_eq!(h.status().to_normal_ratio, 20);
    h.engine.shutdown().await;
}

/// With no sample interval the monitor never runs, but migration does
#[test_log::test(tokio::test(start_paused = true))]
async fn no_monitor() {
    let config = t!(TieringConfig::from_yaml("sample_interval_ms: 0"));
    let h = Harness::new(SimLayout::default(), config).await;
    h.write(0, 2, 2);
    time::sleep(Duration::from_secs(2)).await;
    let finish = h.snapshot().await;
    h.wait_closed(finish).await;
    h.pool.commit();
    assert_eq!(h.pool.blocks_on(ClassT::Special), 0);
    h.verify(0..2, 2).await;
    // Manual ticks still work
    h.engine.monitor_tick();
    assert_eq!(h.status().watermark, Watermark::None);
    h.engine.shutdown().await;
}
