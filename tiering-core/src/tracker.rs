// vim: tw=80
//! Block Tracker
//!
//! Remembers every fast class block of the current window, in two ordered
//! sets keyed by fast class address: *planned* blocks await relocation, and
//! *moved* blocks are being, or have been, relocated.  Both sets share
//! reference-counted descriptors, so a block can change sets while a Mover
//! worker still holds it.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};
use serde_derive::{Deserialize, Serialize};

use crate::types::*;

#[derive(Debug)]
struct DescriptorInner {
    fast: DVA,
    bulk: DVA,
    deleted: bool,
    /// Failed relocation attempts so far
    attempts: u32,
}

/// One relocatable block.
#[derive(Debug)]
pub struct BlockDescriptor {
    pub birth: TxgT,
    pub compression: Compression,
    pub lsize: u32,
    pub psize: u32,
    pub checksum: u64,
    inner: Mutex<DescriptorInner>,
}

impl BlockDescriptor {
    pub fn new(bp: &BlockPointer, bulk: DVA) -> Self {
        let inner = DescriptorInner {
            fast: bp.dva,
            bulk,
            deleted: false,
            attempts: 0
        };
        BlockDescriptor {
            birth: bp.birth,
            compression: bp.compression,
            lsize: bp.lsize,
            psize: bp.psize,
            checksum: bp.checksum,
            inner: Mutex::new(inner),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().unwrap().attempts
    }

    pub fn bulk(&self) -> DVA {
        self.inner.lock().unwrap().bulk
    }

    pub fn fast(&self) -> DVA {
        self.inner.lock().unwrap().fast
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.lock().unwrap().deleted
    }

    /// Both addresses, read atomically
    pub fn locations(&self) -> (DVA, DVA) {
        let inner = self.inner.lock().unwrap();
        (inner.fast, inner.bulk)
    }

    /// Record a failed attempt.  Returns the new attempt count.
    pub fn record_failure(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts += 1;
        inner.attempts
    }

    pub fn set_deleted(&self) {
        self.inner.lock().unwrap().deleted = true;
    }
}

/// Cumulative counters of the current window
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Counters {
    /// Blocks discovered
    pub blocks_in: u64,
    /// Relocation attempts dispatched, including retries
    pub blocks_out: u64,
    /// Blocks relocated, or retired because they were deleted
    pub blocks_moved: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bytes_moved: u64,
}

/// Outcome of [`Tracker::discover`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Discovery {
    /// A new block
    Inserted,
    /// A live copy of this block is already tracked
    Duplicate,
    /// Replaced a deleted descriptor that was still planned
    ReplacedPlanned,
    /// Replaced a deleted descriptor from the moved set
    ReplacedMoved,
}

#[derive(Debug, Default)]
pub struct Tracker {
    planned: BTreeMap<DVA, Arc<BlockDescriptor>>,
    moved: BTreeMap<DVA, Arc<BlockDescriptor>>,
    /// Planned blocks that should be dispatched before any others.  May hold
    /// stale entries, which are skipped.
    priority: VecDeque<DVA>,
    counters: Counters,
}

impl Tracker {
    /// Check out the next block for relocation, moving it into the moved
    /// set.
    pub fn checkout(&mut self) -> Option<Arc<BlockDescriptor>> {
        let mut found = None;
        while let Some(dva) = self.priority.pop_front() {
            if let Some(bd) = self.planned.remove(&dva) {
                found = Some((dva, bd));
                break;
            }
        }
        let (dva, bd) = found.or_else(|| self.planned.pop_first())?;
        self.counters.blocks_out += 1;
        self.counters.bytes_out += u64::from(bd.psize);
        self.moved.insert(dva, bd.clone());
        Some(bd)
    }

    /// Drop every descriptor and reset the counters
    pub fn clear(&mut self) {
        self.planned.clear();
        self.moved.clear();
        self.priority.clear();
        self.counters = Counters::default();
    }

    /// Record a successful relocation, or the retirement of a deleted block.
    pub fn complete(&mut self, bd: &BlockDescriptor) {
        self.counters.blocks_moved += 1;
        self.counters.bytes_moved += u64::from(bd.psize);
    }

    /// Is a live copy of the block at `dva` tracked in either set?
    pub fn contains_live(&self, dva: &DVA) -> bool {
        self.planned.get(dva)
            .or_else(|| self.moved.get(dva))
            .is_some_and(|bd| !bd.is_deleted())
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Register a block found by the Tree Walker.
    pub fn discover(&mut self, bp: &BlockPointer, bulk: DVA) -> Discovery {
        let key = bp.dva;
        let r = if let Some(bd) = self.planned.get(&key) {
            if !bd.is_deleted() {
                return Discovery::Duplicate;
            }
            // The stale descriptor was counted in and will never be counted
            // moved, so its replacement inherits its place.
            self.planned.remove(&key);
            Discovery::ReplacedPlanned
        } else if let Some(bd) = self.moved.get(&key) {
            if !bd.is_deleted() {
                return Discovery::Duplicate;
            }
            self.moved.remove(&key);
            Discovery::ReplacedMoved
        } else {
            Discovery::Inserted
        };
        if r != Discovery::ReplacedPlanned {
            self.counters.blocks_in += 1;
            self.counters.bytes_in += u64::from(bp.psize);
        }
        self.planned.insert(key, Arc::new(BlockDescriptor::new(bp, bulk)));
        r
    }

    /// Remove every moved descriptor, for the window close.
    pub fn drain_moved(&mut self) -> Vec<Arc<BlockDescriptor>> {
        std::mem::take(&mut self.moved).into_values().collect()
    }

    /// Has every discovered block been relocated?
    pub fn is_drained(&self) -> bool {
        self.planned.is_empty() &&
            self.counters.blocks_moved == self.counters.blocks_in
    }

    /// Is `bd` the descriptor currently tracked at its address?
    pub fn is_current(&self, bd: &Arc<BlockDescriptor>) -> bool {
        let dva = bd.fast();
        self.planned.get(&dva)
            .or_else(|| self.moved.get(&dva))
            .is_some_and(|cur| Arc::ptr_eq(cur, bd))
    }

    /// Mark the block at `dva` as deleted by its owner.  Returns whether it
    /// was tracked.
    pub fn notify_deleted(&mut self, dva: &DVA) -> bool {
        match self.planned.get(dva).or_else(|| self.moved.get(dva)) {
            Some(bd) => {
                bd.set_deleted();
                true
            },
            None => false
        }
    }

    pub fn planned_len(&self) -> usize {
        self.planned.len()
    }

    pub fn moved_len(&self) -> usize {
        self.moved.len()
    }

    /// Register a block whose relocation already happened before a crash.
    pub fn register_moved(&mut self, bp: &BlockPointer, bulk: DVA) -> bool {
        if self.planned.contains_key(&bp.dva) ||
            self.moved.contains_key(&bp.dva)
        {
            return false;
        }
        let psize = u64::from(bp.psize);
        self.counters.blocks_in += 1;
        self.counters.bytes_in += psize;
        self.counters.blocks_moved += 1;
        self.counters.bytes_moved += psize;
        self.moved.insert(bp.dva, Arc::new(BlockDescriptor::new(bp, bulk)));
        true
    }

    /// Put back relocated blocks whose fast class copies could not be freed,
    /// so the next close attempt frees them.
    pub fn restore_moved(&mut self, bds: Vec<Arc<BlockDescriptor>>) {
        for bd in bds {
            self.moved.insert(bd.fast(), bd);
        }
    }

    /// Return a checked-out block to the planned set after a failure.
    ///
    /// `priority` blocks are dispatched again before any others.
    pub fn requeue(&mut self, bd: &Arc<BlockDescriptor>, priority: bool) {
        if !self.is_current(bd) {
            return;
        }
        let dva = bd.fast();
        if let Some(bd) = self.moved.remove(&dva) {
            self.planned.insert(dva, bd);
            if priority {
                self.priority.push_front(dva);
            }
        }
    }
}

// LCOV_EXCL_STOP
