// vim: tw=80
//! Mover
//!
//! Relocates planned blocks from the fast class to their predetermined
//! normal class addresses, with bounded concurrency and per-block retry.
use std::sync::Arc;

use futures::{
    stream::FuturesUnordered,
    StreamExt,
};
use tokio::time;
use tracing::{debug, instrument, warn};

use crate::{
    engine::{FaultSource, PoolTieringState, Shared},
    router::Watermark,
    storage::{Bypass, Storage},
    tracker::BlockDescriptor,
    types::*,
    util::block_checksum,
};

/// Result of one relocation attempt
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Outcome {
    Moved,
    /// Deleted by its owner; nothing to move
    Retired,
    /// Gave up before trying, because of a purge, fault, or shutdown
    Abandoned,
    Failed(Error),
}

/// May the Mover dispatch another block right now?
fn may_move(st: &PoolTieringState) -> bool {
    let w = &st.window;
    if st.fault.is_some() || st.locked > 0 || w.purge ||
        w.delete_in_progress || !w.is_active()
    {
        return false;
    }
    // Above the low watermark the fast class needs the space back, so don't
    // yield to foreground load.
    let normal = &st.stats.normal;
    let throttled = st.routing.watermark == Watermark::None &&
        normal.devices > 0 &&
        normal.utilization >= st.config.busy_util;
    !throttled
}

/// Check out the next block, if moving is allowed.
fn checkout(shared: &Shared) -> Option<(Arc<BlockDescriptor>, u64)> {
    let mut st = shared.lock();
    if !may_move(&st) {
        return None;
    }
    let bd = st.tracker.checkout()?;
    st.in_flight += 1;
    Some((bd, st.window.generation))
}

/// Copy one block from the fast class to the normal class.
#[instrument(skip_all, fields(fast = %fast, bulk = %bulk))]
async fn relocate(storage: &dyn Storage,
                  bd: &BlockDescriptor,
                  fast: DVA,
                  bulk: DVA) -> Result<()>
{
    let bp = BlockPointer {
        dva: fast,
        bulk: Some(bulk),
        birth: bd.birth,
        phys_birth: bd.birth,
        kind: BlockKind::Data,
        level: 0,
        compression: bd.compression,
        lsize: bd.lsize,
        psize: bd.psize,
        checksum: bd.checksum,
    };
    let cached = match storage.cached_read_bypass(&bp) {
        Bypass::Hit(sglist) if block_checksum(&sglist) == bd.checksum => {
            Some(sglist)
        },
        Bypass::Hit(_) => {
            debug!("cached copy failed verification; reading from disk");
            None
        },
        Bypass::NotAvailable => None
    };
    let sglist = match cached {
        Some(sglist) => sglist,
        None => {
            let iovec = storage.read_block(fast, bd.psize).await?;
            if block_checksum(&[&iovec[..]]) != bd.checksum {
                return Err(Error::EBADMSG);
            }
            vec![iovec]
        }
    };
    storage.write_block(bulk, sglist).await
}

async fn attempt(shared: &Shared, bd: &BlockDescriptor) -> Outcome {
    if bd.attempts() > 0 {
        let delay = shared.lock().config.retry_delay();
        time::sleep(delay).await;
        let st = shared.lock();
        if st.window.purge || st.fault.is_some() || shared.stopping() {
            return Outcome::Abandoned;
        }
    }
    if bd.is_deleted() {
        return Outcome::Retired;
    }
    let (fast, bulk) = bd.locations();
    match relocate(&*shared.storage, bd, fast, bulk).await {
        Ok(()) => Outcome::Moved,
        Err(e) => Outcome::Failed(e)
    }
}

/// Move one checked-out block and account for the result.
async fn move_block(shared: Arc<Shared>, bd: Arc<BlockDescriptor>,
                    generation: u64)
{
    let outcome = attempt(&shared, &bd).await;
    let mut guard = shared.lock();
    let st = &mut *guard;
    st.in_flight -= 1;
    if st.window.generation == generation {
        match outcome {
            Outcome::Moved => {
                st.mover_errors = 0;
                st.tracker.complete(&bd);
            },
            Outcome::Retired => st.tracker.complete(&bd),
            // Deleted or replaced while we worked on it
            _ if bd.is_deleted() || !st.tracker.is_current(&bd) => {
                st.tracker.complete(&bd);
            },
            Outcome::Abandoned => st.tracker.requeue(&bd, true),
            Outcome::Failed(e) => {
                let attempts = bd.record_failure();
                st.mover_errors += 1;
                warn!(fast = %bd.fast(), attempts, errors = st.mover_errors,
                      "block move failed: {e}");
                if st.mover_errors >= st.config.fault_limit {
                    shared.enter_fault(st, FaultSource::Mover, e);
                    st.tracker.requeue(&bd, false);
                } else {
                    st.tracker.requeue(&bd, true);
                }
            }
        }
    }
    if st.in_flight == 0 {
        shared.idle_cv.notify_one();
    }
    drop(guard);
    // The window may be ready to close, or a retry may be ready to go
    shared.walk_cv.notify_one();
    shared.move_cv.notify_one();
}

/// What one scheduling pass did
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Pass {
    dispatched: u64,
    /// The pass stopped because it used up `data_max`
    exhausted: bool,
}

/// Run one scheduling pass: dispatch blocks until `data_max` bytes have been
/// dispatched or no more may move, and wait for all of them to finish.
async fn pass(shared: &Arc<Shared>) -> Pass {
    let (max_workers, mut budget) = {
        let st = shared.lock();
        (st.config.move_workers.max(1), st.config.data_max)
    };
    let mut workers = FuturesUnordered::new();
    let mut dispatched = 0u64;
    loop {
        while workers.len() < max_workers && budget > 0 &&
            !shared.stopping()
        {
            let Some((bd, generation)) = checkout(shared) else {
                break;
            };
            budget = budget.saturating_sub(u64::from(bd.psize));
            dispatched += 1;
            workers.push(move_block(shared.clone(), bd, generation));
        }
        if workers.next().await.is_none() {
            break;
        }
    }
    Pass { dispatched, exhausted: budget == 0 }
}

/// The Mover's dispatch loop.  Runs until the engine stops.
pub(crate) async fn run(shared: Arc<Shared>) {
    while !shared.stopping() {
        let p = pass(&shared).await;
        let poll = shared.lock().config.idle_poll();
        if p.exhausted {
            debug!(dispatched = p.dispatched, "mover pass used its budget");
            // Every finished move signals move_cv, so only the timer may end
            // this wait.
            time::sleep(poll).await;
        } else if p.dispatched > 0 {
            debug!(dispatched = p.dispatched, "mover pass complete");
        } else {
            tokio::select! {
                _ = shared.move_cv.notified() => (),
                _ = time::sleep(poll) => (),
            }
        }
    }
}

// LCOV_EXCL_STOP
