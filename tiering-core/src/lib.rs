// vim: tw=80
//! Write-cache tiering for pools with a fast "special" allocation class.
//!
//! New blocks land on the special class, and are later migrated in bulk to the
//! normal class, one snapshot-bounded window of transaction groups at a time.

#![cfg_attr(feature = "nightly", feature(plugin))]

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// I suppose I should probably fix this some day, but I just don't like the look
// of e.g. "Dva" as opposed to "DVA".
#![allow(clippy::upper_case_acronyms)]

pub mod balancer;
pub mod controller;
mod coordinator;
pub mod engine;
mod mover;
pub mod property;
pub mod resolver;
pub mod router;
pub mod sim;
pub mod snapshot;
pub mod stats;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod util;
pub mod vdev;
pub mod walker;
pub mod watermark;
pub mod window;

pub use crate::types::*;
pub use crate::util::*;
pub use crate::{
    controller::Controller,
    engine::{Collaborators, Engine, PoolEvent, Status},
    property::{Property, PropertyName, TieringConfig},
    router::WriteContext,
};
