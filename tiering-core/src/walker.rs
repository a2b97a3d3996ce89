// vim: tw=80
//! Tree Walker
//!
//! Discovers the fast class blocks of a window by a pre-order traversal of
//! the pool's block tree.  A traversal is split into bounded steps; the
//! position between steps is kept in a [`WalkCursor`].
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{
    engine::Shared,
    storage::Storage,
    tracker::Discovery,
    types::*,
};

/// Read access to the pool's tree of block pointers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockTree: Send + Sync + 'static {
    /// Root block pointers of every dataset, as captured by the snapshot at
    /// `txg`.
    async fn roots(&self, txg: TxgT) -> Result<Vec<BlockPointer>>;

    /// Block pointers contained in an indirect block.
    async fn children(&self, bp: &BlockPointer) -> Result<Vec<BlockPointer>>;
}

#[derive(Debug)]
struct WalkFrame {
    children: Vec<BlockPointer>,
    next: usize,
}

/// Resumable position of a traversal
#[derive(Debug, Default)]
pub struct WalkCursor {
    started: bool,
    stack: Vec<WalkFrame>,
    /// Block pointers examined so far
    pub visited: u64,
}

impl WalkCursor {
    fn next_block(&mut self) -> Option<BlockPointer> {
        loop {
            let frame = self.stack.last_mut()?;
            if let Some(bp) = frame.children.get(frame.next) {
                frame.next += 1;
                self.visited += 1;
                return Some(bp.clone());
            }
            self.stack.pop();
        }
    }

    fn push(&mut self, children: Vec<BlockPointer>) {
        if !children.is_empty() {
            self.stack.push(WalkFrame { children, next: 0 });
        }
    }
}

/// How a walk step ended
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkProgress {
    /// Yielded; call again with the same cursor
    Paused,
    /// Every block in the window has been seen
    Complete,
    /// The window changed underneath the walk.  Discard the cursor.
    Stale,
}

/// What to do with one block pointer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Verdict {
    /// Visit the block's children
    descend: bool,
    /// Track the block, which will be relocated to this address
    accept: Option<DVA>,
}

fn classify(bp: &BlockPointer, start: TxgT, finish: TxgT, storage: &dyn Storage)
    -> Verdict
{
    if bp.birth < start || bp.birth > finish {
        // Copy-on-write means that nothing beneath is in range either
        return Verdict { descend: false, accept: None };
    }
    let descend = bp.level > 0;
    let accept = match bp.kind {
        BlockKind::IntentLog => None,
        // Reused by deduplication; physically written in a prior window
        _ if bp.phys_birth < start => None,
        _ if storage.class_of(bp.dva.vdev) != Some(ClassT::Special) => None,
        _ => bp.bulk.filter(|bulk| {
            storage.class_of(bulk.vdev) == Some(ClassT::Normal)
        })
    };
    Verdict { descend, accept }
}

/// Run one bounded invocation of the walk.
///
/// Pauses once the walk has run for a sync interval, when another party
/// waits on the pool's commit path, or when the engine is stopping.
#[instrument(skip_all, fields(visited = cursor.visited))]
pub(crate) async fn walk_step(shared: &Shared, cursor: &mut WalkCursor)
    -> Result<WalkProgress>
{
    let (start, finish, generation, budget, replay) = {
        let st = shared.lock();
        (st.window.start_txg, st.window.finish_txg, st.window.generation,
         st.config.sync_interval(), st.window.replay_delete)
    };
    if !cursor.started {
        let roots = shared.tree.roots(finish).await?;
        debug!(roots = roots.len(), %start, %finish, "walk started");
        cursor.push(roots);
        cursor.started = true;
    }
    let begin = Instant::now();
    loop {
        let Some(bp) = cursor.next_block() else {
            debug!(visited = cursor.visited, "walk complete");
            return Ok(WalkProgress::Complete);
        };
        let verdict = classify(&bp, start, finish, &*shared.storage);
        if let Some(bulk) = verdict.accept {
            let mut st = shared.lock();
            if st.window.generation != generation {
                return Ok(WalkProgress::Stale);
            }
            if replay {
                st.tracker.register_moved(&bp, bulk);
            } else {
                let r = st.tracker.discover(&bp, bulk);
                drop(st);
                if r != Discovery::Duplicate {
                    shared.move_cv.notify_one();
                }
            }
        }
        if verdict.descend {
            let children = shared.tree.children(&bp).await?;
            cursor.push(children);
        }
        if shared.stopping() ||
            begin.elapsed() > budget ||
            shared.storage.commit_waiters()
        {
            return Ok(WalkProgress::Paused);
        }
    }
}

// LCOV_EXCL_STOP
