// vim: tw=80
//! Physical device health and raw I/O counters

use std::{
    fmt,
    num::NonZeroU8,
};
use serde_derive::{Deserialize, Serialize};
use crate::types::*;

/// Represents the health of a vdev
///
/// The ordering reflects which Health is "sicker".  That is, a degraded vdev is
/// sicker than an online one, a doubly-degraded vdev is sicker than a
/// singly-degraded one, etc.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, PartialOrd, Ord, Serialize)]
pub enum Health {
    /// Perfectly healthy
    Online,
    /// Operating with reduced redundancy
    Degraded(NonZeroU8),
    /// Reads have failed and could not be repaired
    Unreadable,
    /// Writes have failed
    Unwritable,
    /// Faulted.  No I/O is possible
    Faulted,
}

impl Health {
    /// Should the tiering engine stop trusting a special-class device in this
    /// state?
    pub fn is_impaired(self) -> bool {
        self != Health::Online
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::Degraded(n) => write!(f, "Degraded({})", n),
            Self::Unreadable => "Unreadable".fmt(f),
            Self::Unwritable => "Unwritable".fmt(f),
            Self::Faulted => "Faulted".fmt(f),
        }
    }
}

/// Cumulative I/O counters of one device, as maintained by its driver.
///
/// All fields only ever increase, except `queue_depth`, which is
/// instantaneous.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VdevCounters {
    /// Driver clock at which these counters were captured, in nanoseconds
    pub timestamp_ns: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub reads: u64,
    pub writes: u64,
    /// Total time with at least one command outstanding
    pub busy_ns: u64,
    /// Integral of time that commands spent queued before issue
    pub wait_ns: u64,
    /// Integral of time that commands spent issued to the device
    pub run_ns: u64,
    /// Commands outstanding right now
    pub queue_depth: u32,
}

impl VdevCounters {
    pub fn ops(&self) -> u64 {
        self.reads + self.writes
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_read + self.bytes_written
    }
}

/// One device's counters, along with what the sampler needs to know about the
/// device itself.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VdevSample {
    pub vdev: VdevT,
    pub class: ClassT,
    pub health: Health,
    pub counters: VdevCounters,
}

// LCOV_EXCL_STOP
