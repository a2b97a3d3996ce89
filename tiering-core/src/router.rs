// vim: tw=80
//! Class Router: per-write placement decisions
use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};
use serde_derive::{Deserialize, Serialize};

use crate::{
    property::{Placement, SyncPolicy, TieringConfig},
    types::*,
};

/// Fast class space usage state
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Watermark {
    /// At or below the low watermark
    #[default]
    None,
    /// Between the watermarks
    Low,
    /// Above the high watermark.  The fast class takes no writes.
    High,
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::None => "none".fmt(f),
            Watermark::Low => "low".fmt(f),
            Watermark::High => "high".fmt(f),
        }
    }
}

/// Pool-wide inputs to the router.  Written by the watermark monitor and the
/// load balancer, read on every write.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClassRoutingState {
    /// Output of the load balancer, before watermark adjustments
    pub base_ratio: u8,
    /// Percentage of eligible writes routed to the normal class
    pub to_normal_ratio: u8,
    /// Last step taken by the latency strategy
    pub to_normal_delta: i32,
    pub watermark: Watermark,
    /// How strongly the LOW watermark damps the ratio, 0-100
    pub correction_rate: u8,
    /// A fast class device reported an error.  Cleared only by
    /// `Engine::clear_errors`.
    pub special_errored: bool,
    /// Does the pool have any fast class devices at all?
    pub special_present: bool,
}

impl Default for ClassRoutingState {
    fn default() -> Self {
        ClassRoutingState {
            base_ratio: 50,
            to_normal_ratio: 50,
            to_normal_delta: 0,
            watermark: Watermark::None,
            correction_rate: 0,
            special_errored: false,
            special_present: true,
        }
    }
}

impl ClassRoutingState {
    /// Recompute the effective ratio from the base ratio and watermark state.
    pub fn apply_watermark(&mut self) {
        self.to_normal_ratio = match self.watermark {
            Watermark::None => self.base_ratio,
            Watermark::Low => {
                let damp = 100 - u32::from(self.correction_rate.min(100));
                (u32::from(self.base_ratio) * damp / 100) as u8
            }
            Watermark::High => 0,
        }.min(100);
    }

    /// Can the fast class take writes at all?
    pub fn special_usable(&self) -> bool {
        self.special_present && !self.special_errored &&
            self.watermark != Watermark::High
    }
}

/// Description of one pending write
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteContext {
    pub kind: BlockKind,
    /// Physical size in bytes
    pub psize: u64,
    /// Was the write issued synchronously?
    pub sync: bool,
}

impl WriteContext {
    pub fn data(psize: u64) -> Self {
        WriteContext { kind: BlockKind::Data, psize, sync: false }
    }

    pub fn metadata(kind: MetaKind, psize: u64) -> Self {
        WriteContext { kind: BlockKind::Metadata(kind), psize, sync: false }
    }
}

/// Picks a class for every write.  Keeps nothing but the coin-flip rotor.
#[derive(Debug)]
pub struct ClassRouter {
    rotor: AtomicU32,
}

impl ClassRouter {
    /// Step between successive coin flips.  Coprime with 100, so the rotor
    /// visits every residue.
    const ROTOR_STEP: u32 = 37;

    pub fn new(seed: u32) -> Self {
        ClassRouter { rotor: AtomicU32::new(seed) }
    }

    /// Decide where a write should go.
    ///
    /// `enabled` is false when tiering is switched off or the engine is
    /// faulted.
    pub fn select_class(&self,
                        ctx: &WriteContext,
                        rs: &ClassRoutingState,
                        config: &TieringConfig,
                        enabled: bool) -> ClassT
    {
        if !enabled || !rs.special_usable() {
            return ClassT::Normal;
        }
        let sync = match ctx.kind {
            BlockKind::Metadata(kind) => {
                return match config.meta_placement.get(kind) {
                    Placement::Off => ClassT::Normal,
                    Placement::On | Placement::Dual => ClassT::Special
                };
            }
            BlockKind::Data => ctx.sync,
            BlockKind::IntentLog => true
        };
        if ctx.psize < config.small_write_threshold {
            return ClassT::Special;
        }
        if config.medium_write_threshold != 0 &&
            ctx.psize > config.medium_write_threshold
        {
            return ClassT::Normal;
        }
        if sync {
            match config.sync_policy {
                SyncPolicy::Normal => return ClassT::Normal,
                SyncPolicy::Special => return ClassT::Special,
                SyncPolicy::Balanced => ()
            }
        }
        self.flip(rs.to_normal_ratio)
    }

    /// Weighted coin flip.  `ratio` is the probability, in percent, of
    /// choosing the normal class.
    fn flip(&self, ratio: u8) -> ClassT {
        let r = self.rotor.fetch_add(Self::ROTOR_STEP, Ordering::Relaxed) % 100;
        if r < u32::from(ratio.min(100)) {
            ClassT::Normal
        } else {
            ClassT::Special
        }
    }
}

impl Default for ClassRouter {
    fn default() -> Self {
        ClassRouter::new(0)
    }
}

// LCOV_EXCL_STOP
