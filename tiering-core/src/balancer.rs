// vim: tw=80
//! Load-Balancing Feedback Controller
//!
//! Nudges the routing ratio toward whichever class has spare capacity.  It
//! runs once every few sampling ticks, on the rolling mean of the samples.
use tracing::trace;

use crate::{
    property::{BalancerStrategy, TieringConfig},
    router::ClassRoutingState,
    stats::PerClassStats,
    util::clamp_pct,
};

/// Largest step the latency strategy will take at once
const MAX_LATENCY_STEP: i32 = 50;

/// Run one pass of the controller, updating both the base and the effective
/// ratio.
pub fn balance(rs: &mut ClassRoutingState,
               config: &TieringConfig,
               stats: &PerClassStats)
{
    if let Some(pinned) = config.routing_override {
        rs.base_ratio = pinned.min(100);
        rs.to_normal_delta = 0;
    } else {
        let delta = match config.balancer {
            BalancerStrategy::Utilization => utilization_step(config, stats),
            BalancerStrategy::Latency => {
                let d = latency_step(rs.to_normal_delta, config, stats);
                rs.to_normal_delta = d;
                d
            }
        };
        rs.base_ratio = clamp_pct(i64::from(rs.base_ratio) + i64::from(delta));
        trace!(delta, base_ratio = rs.base_ratio, "balanced");
    }
    rs.apply_watermark();
}

/// Fixed-step strategy driven by device utilization
fn utilization_step(config: &TieringConfig, stats: &PerClassStats) -> i32 {
    let factor = i32::from(config.lb_factor);
    let busy = config.busy_util;
    let idle = config.idle_util;
    let special = stats.special.utilization;
    let normal = stats.normal.utilization;
    let special_busy = special >= busy;
    let normal_busy = normal >= busy;

    if special_busy && !normal_busy {
        factor
    } else if normal_busy && !special_busy {
        -factor
    } else if special < idle && normal >= idle {
        // The fast class has capacity to spare
        -factor
    } else {
        0
    }
}

/// Halving/doubling strategy driven by service time.
///
/// Keeps stepping in the same direction with doubling steps while the gap
/// persists, and halves the step whenever it overshoots.
fn latency_step(prev: i32, config: &TieringConfig, stats: &PerClassStats)
    -> i32
{
    let special = stats.special.avg_service_us;
    let normal = stats.normal.avg_service_us;
    let slower = special.max(normal);
    if slower == 0 {
        return 0;
    }
    let gap = special.abs_diff(normal);
    if gap * 100 < slower * u64::from(config.latency_min_delta) {
        // Close enough
        return 0;
    }
    // Positive steps send more writes to the normal class
    let direction = if special > normal { 1 } else { -1 };
    let base = i32::from(config.lb_factor).max(1);
    let magnitude = if prev == 0 {
        base
    } else if prev.signum() == direction {
        (prev.abs() * 2).min(MAX_LATENCY_STEP)
    } else {
        (prev.abs() / 2).max(1)
    };
    direction * magnitude
}

// LCOV_EXCL_STOP
