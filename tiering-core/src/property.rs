//vim: tw=80
//! Pool tiering properties
//!
//! Every tunable of the engine lives in [`TieringConfig`].  A whole
//! configuration can be loaded from YAML, and individual tunables can be
//! changed at runtime with [`Property`] values parsed from `name=value`
//! strings, much like dataset properties.
use crate::{Error, MetaKind, Result};
use serde_derive::*;
use std::{
    fmt,
    time::Duration
};

/// Placement policy for one kind of metadata
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Never place on the special class
    Off,
    /// Place on the special class only
    On,
    /// Cacheable in both classes: written to the special class and later
    /// relocated like data
    Dual,
}

impl TryFrom<&str> for Placement {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Placement::Off),
            "on" => Ok(Placement::On),
            "dual" => Ok(Placement::Dual),
            _ => Err(Error::EINVAL)
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Off => "off".fmt(f),
            Placement::On => "on".fmt(f),
            Placement::Dual => "dual".fmt(f),
        }
    }
}

/// Per-metadata-kind placement policies
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct MetaPlacement {
    pub indirect: Placement,
    pub dnode: Placement,
    pub ddt: Placement,
    pub other: Placement,
}

impl MetaPlacement {
    pub fn get(&self, kind: MetaKind) -> Placement {
        match kind {
            MetaKind::Indirect => self.indirect,
            MetaKind::Dnode => self.dnode,
            MetaKind::Ddt => self.ddt,
            MetaKind::Other => self.other,
        }
    }

    pub fn set(&mut self, kind: MetaKind, placement: Placement) {
        match kind {
            MetaKind::Indirect => self.indirect = placement,
            MetaKind::Dnode => self.dnode = placement,
            MetaKind::Ddt => self.ddt = placement,
            MetaKind::Other => self.other = placement,
        }
    }
}

impl Default for MetaPlacement {
    fn default() -> Self {
        MetaPlacement {
            indirect: Placement::Dual,
            dnode: Placement::Dual,
            ddt: Placement::Dual,
            other: Placement::Dual,
        }
    }
}

/// Where synchronous writes go
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Synchronous writes always go to the normal class
    Normal,
    /// Synchronous writes follow the routing ratio, like everything else
    #[default]
    Balanced,
    /// Synchronous writes always go to the special class
    Special,
}

impl TryFrom<&str> for SyncPolicy {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(SyncPolicy::Normal),
            "balanced" => Ok(SyncPolicy::Balanced),
            "special" => Ok(SyncPolicy::Special),
            _ => Err(Error::EINVAL)
        }
    }
}

/// Which feedback strategy the load balancer uses
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BalancerStrategy {
    #[default]
    Utilization,
    Latency,
}

impl TryFrom<&str> for BalancerStrategy {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "utilization" => Ok(BalancerStrategy::Utilization),
            "latency" => Ok(BalancerStrategy::Latency),
            _ => Err(Error::EINVAL)
        }
    }
}

/// All tunables of one pool's tiering engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TieringConfig {
    /// Master switch.  When off, no writes target the special class and no
    /// new migration windows open.
    pub enabled: bool,
    /// Special class allocation percentage at which correction begins
    pub low_watermark: u8,
    /// Special class allocation percentage at which it stops taking writes
    pub high_watermark: u8,
    /// Data writes smaller than this many bytes always go to the special class
    pub small_write_threshold: u64,
    /// Data writes larger than this many bytes always go to the normal class.
    /// 0 disables the limit.
    pub medium_write_threshold: u64,
    pub meta_placement: MetaPlacement,
    pub sync_policy: SyncPolicy,
    /// Pin the routing ratio, bypassing the load balancer
    pub routing_override: Option<u8>,
    pub balancer: BalancerStrategy,
    /// Fixed step of the utilization strategy, in percent
    pub lb_factor: u8,
    /// Utilization above which a class counts as busy
    pub busy_util: u8,
    /// Utilization below which a class counts as idle
    pub idle_util: u8,
    /// Minimum latency gap, in percent of the slower class, that the latency
    /// strategy reacts to
    pub latency_min_delta: u8,
    /// Period of the stat sampler
    pub sample_interval_ms: u64,
    /// Run the load balancer once per this many samples, averaged over the
    /// same number of samples.  Fixed when the engine attaches.
    pub balance_ticks: u32,
    /// Maximum concurrent block moves
    pub move_workers: usize,
    /// Maximum bytes moved per scheduling pass
    pub data_max: u64,
    /// Delay before retrying a failed block move
    pub retry_delay_ms: u64,
    /// Consecutive move failures that fault the engine
    pub fault_limit: u32,
    /// Consecutive traversal failures that fault the engine
    pub walk_fault_limit: u32,
    /// Percentage of a window's blocks that must be relocated before the
    /// next bounding snapshot may be taken early.  0 disables early rolling.
    pub roll_threshold: u8,
    /// Longest time one walk step may run before yielding
    pub sync_interval_ms: u64,
    /// Longest time a purge waits for in-flight moves
    pub purge_timeout_ms: u64,
    /// How long idle background loops sleep between checks
    pub idle_poll_ms: u64,
}

impl Default for TieringConfig {
    fn default() -> Self {
        TieringConfig {
            enabled: true,
            low_watermark: 60,
            high_watermark: 80,
            small_write_threshold: 128 << 10,
            medium_write_threshold: 0,
            meta_placement: MetaPlacement::default(),
            sync_policy: SyncPolicy::default(),
            routing_override: None,
            balancer: BalancerStrategy::default(),
            lb_factor: 5,
            busy_util: 80,
            idle_util: 20,
            latency_min_delta: 10,
            sample_interval_ms: 1000,
            balance_ticks: 5,
            move_workers: 8,
            data_max: 64 << 20,
            retry_delay_ms: 10,
            fault_limit: 10,
            walk_fault_limit: 3,
            roll_threshold: 0,
            sync_interval_ms: 5000,
            purge_timeout_ms: 30_000,
            idle_poll_ms: 100,
        }
    }
}

impl TieringConfig {
    /// Parse a configuration from YAML.  Omitted fields take their defaults.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: TieringConfig = serde_yaml_ng::from_str(s)
            .map_err(|e| {
                tracing::warn!("invalid tiering configuration: {e}");
                Error::EINVAL
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every percentage is in range, and that no limit is zero.
    ///
    /// A zero `sample_interval_ms` is allowed.  It disables the periodic
    /// monitor.
    pub fn validate(&self) -> Result<()> {
        for pct in [self.low_watermark, self.high_watermark,
                    self.lb_factor, self.busy_util, self.idle_util,
                    self.latency_min_delta, self.roll_threshold]
        {
            if pct > 100 {
                return Err(Error::EINVAL);
            }
        }
        if self.routing_override.is_some_and(|r| r > 100) {
            return Err(Error::EINVAL);
        }
        if self.fault_limit == 0 || self.walk_fault_limit == 0 ||
            self.move_workers == 0
        {
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).map_err(|_| Error::EINVAL)
    }

    /// Do the watermarks make sense?  An inconsistent pair disables the
    /// watermark monitor rather than failing.
    pub fn watermarks_valid(&self) -> bool {
        self.low_watermark > 0 && self.high_watermark > 0 &&
            self.low_watermark < self.high_watermark
    }

    pub fn get(&self, name: PropertyName) -> Property {
        match name {
            PropertyName::Enabled => Property::Enabled(self.enabled),
            PropertyName::LowWatermark => Property::LowWatermark(self.low_watermark),
            PropertyName::HighWatermark =>
                Property::HighWatermark(self.high_watermark),
            PropertyName::SmallWriteThreshold =>
                Property::SmallWriteThreshold(self.small_write_threshold),
            PropertyName::MediumWriteThreshold =>
                Property::MediumWriteThreshold(self.medium_write_threshold),
            PropertyName::MetaPlacement(kind) =>
                Property::MetaPlacement(kind, self.meta_placement.get(kind)),
            PropertyName::SyncPolicy => Property::SyncPolicy(self.sync_policy),
            PropertyName::RoutingOverride =>
                Property::RoutingOverride(self.routing_override),
            PropertyName::Balancer => Property::Balancer(self.balancer),
            PropertyName::FaultLimit => Property::FaultLimit(self.fault_limit),
            PropertyName::WalkFaultLimit =>
                Property::WalkFaultLimit(self.walk_fault_limit),
            PropertyName::RollThreshold =>
                Property::RollThreshold(self.roll_threshold),
            PropertyName::DataMax => Property::DataMax(self.data_max),
            PropertyName::MoveWorkers => Property::MoveWorkers(self.move_workers),
        }
    }

    /// Change one tunable.  Out-of-range values are rejected with `EINVAL`,
    /// leaving the configuration unchanged.
    pub fn set(&mut self, prop: Property) -> Result<()> {
        prop.validate()?;
        match prop {
            Property::Enabled(v) => self.enabled = v,
            Property::LowWatermark(v) => self.low_watermark = v,
            Property::HighWatermark(v) => self.high_watermark = v,
            Property::SmallWriteThreshold(v) => self.small_write_threshold = v,
            Property::MediumWriteThreshold(v) => self.medium_write_threshold = v,
            Property::MetaPlacement(kind, p) => self.meta_placement.set(kind, p),
            Property::SyncPolicy(v) => self.sync_policy = v,
            Property::RoutingOverride(v) => self.routing_override = v,
            Property::Balancer(v) => self.balancer = v,
            Property::FaultLimit(v) => self.fault_limit = v,
            Property::WalkFaultLimit(v) => self.walk_fault_limit = v,
            Property::RollThreshold(v) => self.roll_threshold = v,
            Property::DataMax(v) => self.data_max = v,
            Property::MoveWorkers(v) => self.move_workers = v,
        }
        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn purge_timeout(&self) -> Duration {
        Duration::from_millis(self.purge_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// A single runtime-settable tunable
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Property {
    Enabled(bool),
    LowWatermark(u8),
    HighWatermark(u8),
    SmallWriteThreshold(u64),
    MediumWriteThreshold(u64),
    MetaPlacement(MetaKind, Placement),
    SyncPolicy(SyncPolicy),
    /// `None` returns control of the ratio to the load balancer.
    RoutingOverride(Option<u8>),
    Balancer(BalancerStrategy),
    FaultLimit(u32),
    WalkFaultLimit(u32),
    RollThreshold(u8),
    DataMax(u64),
    MoveWorkers(usize),
}

impl Property {
    fn validate(&self) -> Result<()> {
        let ok = match self {
            Property::LowWatermark(v) | Property::HighWatermark(v) |
                Property::RollThreshold(v) => *v <= 100,
            Property::RoutingOverride(Some(v)) => *v <= 100,
            Property::FaultLimit(v) | Property::WalkFaultLimit(v) => *v > 0,
            Property::MoveWorkers(v) => *v > 0,
            _ => true
        };
        if ok {
            Ok(())
        } else {
            Err(Error::EINVAL)
        }
    }

    pub fn name(&self) -> PropertyName {
        match self {
            Property::Enabled(_) => PropertyName::Enabled,
            Property::LowWatermark(_) => PropertyName::LowWatermark,
            Property::HighWatermark(_) => PropertyName::HighWatermark,
            Property::SmallWriteThreshold(_) =>
                PropertyName::SmallWriteThreshold,
            Property::MediumWriteThreshold(_) =>
                PropertyName::MediumWriteThreshold,
            Property::MetaPlacement(kind, _) => PropertyName::MetaPlacement(*kind),
            Property::SyncPolicy(_) => PropertyName::SyncPolicy,
            Property::RoutingOverride(_) => PropertyName::RoutingOverride,
            Property::Balancer(_) => PropertyName::Balancer,
            Property::FaultLimit(_) => PropertyName::FaultLimit,
            Property::WalkFaultLimit(_) => PropertyName::WalkFaultLimit,
            Property::RollThreshold(_) => PropertyName::RollThreshold,
            Property::DataMax(_) => PropertyName::DataMax,
            Property::MoveWorkers(_) => PropertyName::MoveWorkers,
        }
    }
}

fn parse_bool(v: &str) -> Result<bool> {
    match v {
        "true" | "on" => Ok(true),
        "false" | "off" => Ok(false),
        _ => Err(Error::EINVAL)
    }
}

fn parse_pct(v: &str) -> Result<u8> {
    match v.parse::<u8>() {
        Ok(pct) if pct <= 100 => Ok(pct),
        _ => Err(Error::EINVAL)
    }
}

fn parse_num<T: std::str::FromStr>(v: &str) -> Result<T> {
    v.parse::<T>().map_err(|_| Error::EINVAL)
}

impl TryFrom<&str> for Property {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        let mut words = s.splitn(2, '=');
        let propname = words.next().ok_or(Error::EINVAL)?;
        let Some(v) = words.next() else {
            // Value may be omitted only for boolean options
            return match propname {
                "enabled" => Ok(Property::Enabled(true)),
                _ => Err(Error::EINVAL)
            };
        };
        match PropertyName::try_from(propname)? {
            PropertyName::Enabled => parse_bool(v).map(Property::Enabled),
            PropertyName::LowWatermark =>
                parse_pct(v).map(Property::LowWatermark),
            PropertyName::HighWatermark =>
                parse_pct(v).map(Property::HighWatermark),
            PropertyName::SmallWriteThreshold =>
                parse_num(v).map(Property::SmallWriteThreshold),
            PropertyName::MediumWriteThreshold =>
                parse_num(v).map(Property::MediumWriteThreshold),
            PropertyName::MetaPlacement(kind) =>
                Placement::try_from(v).map(|p| Property::MetaPlacement(kind, p)),
            PropertyName::SyncPolicy =>
                SyncPolicy::try_from(v).map(Property::SyncPolicy),
            PropertyName::RoutingOverride => {
                if v == "none" {
                    Ok(Property::RoutingOverride(None))
                } else {
                    parse_pct(v).map(|r| Property::RoutingOverride(Some(r)))
                }
            },
            PropertyName::Balancer =>
                BalancerStrategy::try_from(v).map(Property::Balancer),
            PropertyName::FaultLimit => {
                match parse_num::<u32>(v)? {
                    0 => Err(Error::EINVAL),
                    n => Ok(Property::FaultLimit(n))
                }
            },
            PropertyName::WalkFaultLimit => {
                match parse_num::<u32>(v)? {
                    0 => Err(Error::EINVAL),
                    n => Ok(Property::WalkFaultLimit(n))
                }
            },
            PropertyName::RollThreshold =>
                parse_pct(v).map(Property::RollThreshold),
            PropertyName::DataMax => parse_num(v).map(Property::DataMax),
            PropertyName::MoveWorkers => {
                match parse_num::<usize>(v)? {
                    0 => Err(Error::EINVAL),
                    n => Ok(Property::MoveWorkers(n))
                }
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum PropertyName {
    Enabled,
    LowWatermark,
    HighWatermark,
    SmallWriteThreshold,
    MediumWriteThreshold,
    MetaPlacement(MetaKind),
    SyncPolicy,
    RoutingOverride,
    Balancer,
    FaultLimit,
    WalkFaultLimit,
    RollThreshold,
    DataMax,
    MoveWorkers,
}

impl PropertyName {
    /// Every property, in display order
    pub fn all() -> Vec<PropertyName> {
        let mut v = vec![
            PropertyName::Enabled,
            PropertyName::LowWatermark,
            PropertyName::HighWatermark,
            PropertyName::SmallWriteThreshold,
            PropertyName::MediumWriteThreshold,
        ];
        v.extend(MetaKind::ALL.iter().map(|k| PropertyName::MetaPlacement(*k)));
        v.extend([
            PropertyName::SyncPolicy,
            PropertyName::RoutingOverride,
            PropertyName::Balancer,
            PropertyName::FaultLimit,
            PropertyName::WalkFaultLimit,
            PropertyName::RollThreshold,
            PropertyName::DataMax,
            PropertyName::MoveWorkers,
        ]);
        v
    }
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyName::Enabled => "enabled".fmt(f),
            PropertyName::LowWatermark => "low_watermark".fmt(f),
            PropertyName::HighWatermark => "high_watermark".fmt(f),
            PropertyName::SmallWriteThreshold => "small_write_threshold".fmt(f),
            PropertyName::MediumWriteThreshold =>
                "medium_write_threshold".fmt(f),
            PropertyName::MetaPlacement(kind) =>
                write!(f, "meta_placement.{}", kind.name()),
            PropertyName::SyncPolicy => "sync_policy".fmt(f),
            PropertyName::RoutingOverride => "routing_override".fmt(f),
            PropertyName::Balancer => "balancer".fmt(f),
            PropertyName::FaultLimit => "fault_limit".fmt(f),
            PropertyName::WalkFaultLimit => "walk_fault_limit".fmt(f),
            PropertyName::RollThreshold => "roll_threshold".fmt(f),
            PropertyName::DataMax => "data_max".fmt(f),
            PropertyName::MoveWorkers => "move_workers".fmt(f),
        }
    }
}

impl TryFrom<&str> for PropertyName {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        if let Some(kind) = s.strip_prefix("meta_placement.") {
            return MetaKind::ALL.iter()
                .find(|k| k.name() == kind)
                .map(|k| PropertyName::MetaPlacement(*k))
                .ok_or(Error::EINVAL);
        }
        PropertyName::all().into_iter()
            .find(|name| name.to_string() == s)
            .ok_or(Error::EINVAL)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=", self.name())?;
        match self {
            Property::Enabled(v) => v.fmt(f),
            Property::LowWatermark(v) | Property::HighWatermark(v) |
                Property::RollThreshold(v) => v.fmt(f),
            Property::SmallWriteThreshold(v) |
                Property::MediumWriteThreshold(v) |
                Property::DataMax(v) => v.fmt(f),
            Property::MetaPlacement(_, p) => p.fmt(f),
            Property::SyncPolicy(p) => format!("{p:?}").to_lowercase().fmt(f),
            Property::RoutingOverride(None) => "none".fmt(f),
            Property::RoutingOverride(Some(r)) => r.fmt(f),
            Property::Balancer(b) => format!("{b:?}").to_lowercase().fmt(f),
            Property::FaultLimit(v) | Property::WalkFaultLimit(v) => v.fmt(f),
            Property::MoveWorkers(v) => v.fmt(f),
        }
    }
}

// LCOV_EXCL_STOP
