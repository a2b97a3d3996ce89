// vim: tw=80
//! Vdev Stat Sampler
//!
//! Converts the cumulative counters that device drivers maintain into rates,
//! and aggregates them per storage class.
use std::collections::{BTreeMap, VecDeque};
use serde_derive::{Deserialize, Serialize};

use crate::{
    types::*,
    vdev::{VdevCounters, VdevSample},
};

/// Derived performance of one class, averaged across its devices.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClassStats {
    /// Devices that contributed to this sample
    pub devices: u32,
    /// Percent of time busy
    pub utilization: u8,
    /// Bytes per second
    pub throughput: u64,
    pub iops: u64,
    /// Average time commands spent queued, in microseconds
    pub avg_wait_us: u64,
    /// Average time commands spent on the device, in microseconds
    pub avg_run_us: u64,
    /// `avg_wait_us + avg_run_us`
    pub avg_service_us: u64,
    pub queue_depth: u32,
}

/// Latest derived statistics for both classes
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PerClassStats {
    pub special: ClassStats,
    pub normal: ClassStats,
}

impl PerClassStats {
    pub fn get(&self, class: ClassT) -> &ClassStats {
        match class {
            ClassT::Special => &self.special,
            ClassT::Normal => &self.normal,
        }
    }
}

/// One device's rates over one interval, with the interval length as weight.
#[derive(Clone, Copy, Debug, Default)]
struct DeviceRates {
    elapsed_ns: u64,
    utilization: u64,
    throughput: u64,
    iops: u64,
    avg_wait_ns: u64,
    avg_run_ns: u64,
    queue_depth: u32,
}

impl DeviceRates {
    /// Rates between two captures, or `None` if they don't form an interval.
    fn between(prev: &VdevCounters, cur: &VdevCounters) -> Option<Self> {
        let elapsed_ns = cur.timestamp_ns.checked_sub(prev.timestamp_ns)?;
        if elapsed_ns == 0 {
            return None;
        }
        // Counters going backwards means the device was replaced or its
        // driver restarted.
        let ops = cur.ops().checked_sub(prev.ops())?;
        let bytes = cur.bytes().checked_sub(prev.bytes())?;
        let busy = cur.busy_ns.checked_sub(prev.busy_ns)?;
        let wait = cur.wait_ns.checked_sub(prev.wait_ns)?;
        let run = cur.run_ns.checked_sub(prev.run_ns)?;
        let per_sec = |n: u64| {
            (u128::from(n) * 1_000_000_000 / u128::from(elapsed_ns)) as u64
        };
        let (avg_wait_ns, avg_run_ns) = if ops == 0 {
            (0, 0)
        } else {
            (wait / ops, run / ops)
        };
        Some(DeviceRates {
            elapsed_ns,
            utilization: (u128::from(busy) * 100 / u128::from(elapsed_ns))
                .min(100) as u64,
            throughput: per_sec(bytes),
            iops: per_sec(ops),
            avg_wait_ns,
            avg_run_ns,
            queue_depth: cur.queue_depth,
        })
    }
}

/// Mean of a class's device rates, weighted by each device's interval.
fn aggregate(rates: &[DeviceRates]) -> ClassStats {
    let total: u128 = rates.iter().map(|r| u128::from(r.elapsed_ns)).sum();
    if total == 0 {
        return ClassStats::default();
    }
    let mean = |f: fn(&DeviceRates) -> u64| -> u64 {
        let sum: u128 = rates.iter()
            .map(|r| u128::from(f(r)) * u128::from(r.elapsed_ns))
            .sum();
        (sum / total) as u64
    };
    let avg_wait_us = mean(|r| r.avg_wait_ns) / 1000;
    let avg_run_us = mean(|r| r.avg_run_ns) / 1000;
    ClassStats {
        devices: rates.len() as u32,
        utilization: mean(|r| r.utilization).min(100) as u8,
        throughput: mean(|r| r.throughput),
        iops: mean(|r| r.iops),
        avg_wait_us,
        avg_run_us,
        avg_service_us: avg_wait_us + avg_run_us,
        queue_depth: rates.iter().map(|r| r.queue_depth).max().unwrap_or(0),
    }
}

/// Remembers the previous counters of every device.
#[derive(Debug, Default)]
pub struct Sampler {
    prev: BTreeMap<VdevT, VdevCounters>,
}

impl Sampler {
    /// Compute per-class statistics since the previous call.
    ///
    /// Devices seen for the first time contribute nothing until the next call.
    /// Devices that disappeared are forgotten.
    pub fn sample(&mut self, samples: &[VdevSample]) -> PerClassStats {
        let mut special = Vec::new();
        let mut normal = Vec::new();
        let mut next = BTreeMap::new();
        for s in samples {
            if let Some(rates) = self.prev.get(&s.vdev)
                .and_then(|prev| DeviceRates::between(prev, &s.counters))
            {
                match s.class {
                    ClassT::Special => special.push(rates),
                    ClassT::Normal => normal.push(rates),
                }
            }
            next.insert(s.vdev, s.counters);
        }
        self.prev = next;
        PerClassStats {
            special: aggregate(&special),
            normal: aggregate(&normal),
        }
    }
}

/// Rolling mean of the last few samples, which is what the load balancer
/// looks at.
#[derive(Debug)]
pub struct RollingStats {
    depth: usize,
    history: VecDeque<PerClassStats>,
}

impl RollingStats {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        RollingStats { depth, history: VecDeque::with_capacity(depth) }
    }

    pub fn push(&mut self, stats: PerClassStats) {
        if self.history.len() >= self.depth {
            self.history.pop_front();
        }
        self.history.push_back(stats);
    }

    pub fn mean(&self) -> PerClassStats {
        let n = self.history.len() as u64;
        if n == 0 {
            return PerClassStats::default();
        }
        let class_mean = |class: ClassT| {
            let cs = self.history.iter().map(|s| *s.get(class));
            let mut acc = ClassStats::default();
            let mut util = 0u64;
            for c in cs {
                acc.devices = acc.devices.max(c.devices);
                util += u64::from(c.utilization);
                acc.throughput += c.throughput;
                acc.iops += c.iops;
                acc.avg_wait_us += c.avg_wait_us;
                acc.avg_run_us += c.avg_run_us;
                acc.queue_depth = acc.queue_depth.max(c.queue_depth);
            }
            acc.utilization = (util / n) as u8;
            acc.throughput /= n;
            acc.iops /= n;
            acc.avg_wait_us /= n;
            acc.avg_run_us /= n;
            acc.avg_service_us = acc.avg_wait_us + acc.avg_run_us;
            acc
        };
        PerClassStats {
            special: class_mean(ClassT::Special),
            normal: class_mean(ClassT::Normal),
        }
    }
}

// LCOV_EXCL_STOP
