// vim: tw=80
//! Watermark Monitor
//!
//! Tracks fast class space usage against the low and high watermarks, and
//! disables the fast class when its devices report errors.
use tracing::{info, warn};

use crate::{
    engine::PoolEvent,
    property::TieringConfig,
    router::{ClassRoutingState, Watermark},
    util::clamp_pct,
};

#[derive(Debug, Default)]
pub struct WatermarkMonitor {
    /// Have we already complained about the configured watermarks?
    warned_invalid: bool,
}

impl WatermarkMonitor {
    /// Evaluate one monitor tick.
    ///
    /// # Arguments
    ///
    /// - `alloc_pct`:  Fast class allocated space, in percent
    /// - `degraded`:   Does any fast class device report a problem?
    ///
    /// # Returns
    ///
    /// Every transition that took place, for publication as pool events.
    pub fn tick(&mut self,
                rs: &mut ClassRoutingState,
                config: &TieringConfig,
                alloc_pct: u8,
                degraded: bool) -> Vec<PoolEvent>
    {
        let mut events = Vec::new();

        if degraded && !rs.special_errored {
            warn!("special class degraded; disabling fast class writes");
            rs.special_errored = true;
            events.push(PoolEvent::SpecialDisabled);
        }

        let old = rs.watermark;
        if config.watermarks_valid() {
            self.warned_invalid = false;
            let low = config.low_watermark;
            let high = config.high_watermark;
            rs.watermark = match old {
                _ if alloc_pct > high => Watermark::High,
                _ if alloc_pct <= low => Watermark::None,
                // Between the watermarks, HIGH holds until we drop to low
                Watermark::High => Watermark::High,
                Watermark::None | Watermark::Low => Watermark::Low,
            };
            rs.correction_rate = if rs.watermark == Watermark::Low {
                let num = i64::from(alloc_pct) - i64::from(low);
                let den = i64::from(high) - i64::from(low);
                clamp_pct(num * 100 / den)
            } else {
                0
            };
        } else {
            if !self.warned_invalid {
                warn!(low = config.low_watermark,
                      high = config.high_watermark,
                      "invalid watermarks; watermark monitor disabled");
                self.warned_invalid = true;
            }
            rs.watermark = Watermark::None;
            rs.correction_rate = 0;
        }
        if rs.watermark != old {
            info!(from = %old, to = %rs.watermark, alloc_pct,
                  "watermark transition");
            events.push(PoolEvent::WatermarkChanged {
                from: old,
                to: rs.watermark
            });
        }
        rs.apply_watermark();
        events
    }
}

// LCOV_EXCL_STOP
