// vim: tw=80
//! Storage primitives consumed by the tiering engine.
//!
//! The engine never touches disks itself.  Everything it knows about devices,
//! and every byte it moves, goes through this interface.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::{
    types::*,
    vdev::VdevSample
};

/// Result of [`Storage::cached_read_bypass`]
#[derive(Debug)]
pub enum Bypass {
    /// The block's contents, streamed out of the in-memory cache in one or
    /// more pieces.  The pieces have not been verified.
    Hit(SGList),
    /// The fast path cannot safely satisfy this read
    NotAvailable,
}

/// The pool's physical layer, as seen by the tiering engine.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Try to satisfy a read of `bp` from memory, bypassing the disks.
    fn cached_read_bypass(&self, bp: &BlockPointer) -> Bypass;

    /// Allocated space on `class`, as a percentage of its capacity.
    fn class_alloc_percentage(&self, class: ClassT) -> u8;

    /// Is any device of `class` degraded, faulted, unreadable or unwritable?
    fn class_is_degraded(&self, class: ClassT) -> bool;

    /// Which class does the given device belong to?  `None` for unknown
    /// devices.
    fn class_of(&self, vdev: VdevT) -> Option<ClassT>;

    /// Is some other party currently waiting on the pool's commit path?
    fn commit_waiters(&self) -> bool;

    /// The transaction group currently open for writing.
    fn current_txg(&self) -> TxgT;

    /// Free one copy of a block.  The free is deferred, taking effect when
    /// `txg` commits.
    fn free_dva(&self, dva: DVA, txg: TxgT) -> Result<()>;

    /// Read `size` bytes at `dva`.
    async fn read_block(&self, dva: DVA, size: u32) -> Result<IoVec>;

    /// Ensure that every write completed so far reaches stable storage.
    async fn sync_all(&self) -> Result<()>;

    /// Capture the current counters of every device.  Must not block.
    fn vdev_samples(&self) -> Vec<VdevSample>;

    /// Write the gathered contents of `sglist` at `dva`.
    async fn write_block(&self, dva: DVA, sglist: SGList) -> Result<()>;
}
