// vim: tw=80
//! Window Coordinator
//!
//! One background task per pool that serves the Snapshot Coordinator's
//! messages, opens windows, drives the Tree Walker, and closes or purges
//! windows.  Every window transition happens on this task.
use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    engine::{FaultSource, PoolEvent, PurgeReason, Shared},
    snapshot::SnapshotMsg,
    storage::Storage,
    types::*,
    walker::{self, WalkCursor, WalkProgress},
    window::{MetaStore, MigrationWindow, PersistedWindow, WindowState},
};

/// Administrative requests, served in order with snapshot messages
#[derive(Debug)]
pub(crate) enum AdminMsg {
    Purge {
        reason: PurgeReason,
        reply: oneshot::Sender<Result<()>>
    },
    Close {
        reply: oneshot::Sender<Result<()>>
    },
    ClearFault {
        reply: oneshot::Sender<Result<()>>
    },
}

/// Rebuild the window from the pool's metadata.
///
/// An interrupted window is resumed by walking it again.  If it was
/// interrupted while freeing fast class copies, the rediscovered blocks are
/// all treated as relocated and the close is finished.
pub(crate) async fn recover(name: &str,
                            storage: &dyn Storage,
                            meta: &dyn MetaStore) -> Result<MigrationWindow>
{
    let Some(pw) = PersistedWindow::load(meta).await? else {
        let window = MigrationWindow::new(storage.current_txg());
        window.persisted().store(meta).await?;
        info!(pool = name, start_txg = %window.start_txg,
              "initialized tiering state");
        return Ok(window);
    };
    let mut window = MigrationWindow::new(pw.start_txg);
    if !pw.finish_txg.is_none() {
        window.finish_txg = pw.finish_txg;
        window.to_release_txg = pw.to_release_txg;
        window.state = WindowState::Open;
        window.walking = true;
        window.replay_delete = pw.delete;
        info!(pool = name, start_txg = %pw.start_txg,
              finish_txg = %pw.finish_txg, delete = pw.delete,
              "resuming interrupted window");
    }
    Ok(window)
}

/// Why the task woke up
enum Wake {
    Snapshot(Option<SnapshotMsg>),
    Admin(Option<AdminMsg>),
    Timer,
}

pub(crate) struct WindowCoordinator {
    shared: Arc<Shared>,
    cursor: WalkCursor,
}

impl WindowCoordinator {
    pub fn new(shared: Arc<Shared>) -> Self {
        WindowCoordinator { shared, cursor: WalkCursor::default() }
    }

    pub async fn run(mut self,
                     mut snap_rx: mpsc::Receiver<SnapshotMsg>,
                     mut admin_rx: mpsc::Receiver<AdminMsg>)
    {
        while !self.shared.stopping() {
            // Messages first, so callers never wait behind a long walk
            if let Ok(msg) = admin_rx.try_recv() {
                self.handle_admin(msg).await;
                continue;
            }
            if let Ok(msg) = snap_rx.try_recv() {
                self.handle_snapshot(msg).await;
                continue;
            }
            if self.step().await {
                tokio::task::yield_now().await;
                continue;
            }
            let shared = self.shared.clone();
            let poll = shared.lock().config.idle_poll();
            let wake = tokio::select! {
                msg = admin_rx.recv() => Wake::Admin(msg),
                msg = snap_rx.recv() => Wake::Snapshot(msg),
                _ = shared.walk_cv.notified() => Wake::Timer,
                _ = time::sleep(poll) => Wake::Timer,
            };
            match wake {
                Wake::Admin(Some(msg)) => self.handle_admin(msg).await,
                Wake::Snapshot(Some(msg)) => self.handle_snapshot(msg).await,
                // The Engine is gone
                Wake::Admin(None) | Wake::Snapshot(None) => break,
                Wake::Timer => ()
            }
        }
        debug!("window task exiting");
    }

    async fn handle_admin(&mut self, msg: AdminMsg) {
        match msg {
            AdminMsg::Purge { reason, reply } => {
                let r = self.purge(reason).await;
                let _ = reply.send(r);
            },
            AdminMsg::Close { reply } => {
                let r = self.close_window().await;
                let _ = reply.send(r);
            },
            AdminMsg::ClearFault { reply } => {
                let r = self.clear_fault().await;
                let _ = reply.send(r);
            }
        }
    }

    async fn handle_snapshot(&mut self, msg: SnapshotMsg) {
        match msg {
            SnapshotMsg::Confirm { dataset, recursive, txg, reply } => {
                let r = self.confirm();
                debug!(%dataset, recursive, %txg, confirmed = r,
                       "snapshot confirmation");
                let _ = reply.send(r);
            },
            SnapshotMsg::Created { name, recursive, is_autosnap, start_txg,
                                   end_txg, reply } =>
            {
                let r = self.created(is_autosnap, end_txg).await;
                debug!(%name, recursive, is_autosnap, %start_txg, %end_txg,
                       retained = r, "snapshot created");
                let _ = reply.send(r);
            },
            SnapshotMsg::Error { name, error, txg } => {
                warn!(%name, %error, %txg, "bounding snapshot failed");
                let mut st = self.shared.lock();
                self.shared.enter_fault(&mut st, FaultSource::Snapshot, error);
            }
        }
    }

    /// Should a new bounding snapshot be taken now?
    pub fn confirm(&self) -> bool {
        let st = self.shared.lock();
        let w = &st.window;
        if !st.tiering_enabled() || st.locked > 0 || w.purge {
            return false;
        }
        if w.is_closed() && !w.walking && w.pending_txg.is_none() {
            return true;
        }
        w.pending_txg.is_none() && st.roll_ready()
    }

    /// A bounding snapshot was created.  Returns whether it is retained.
    pub async fn created(&mut self, is_autosnap: bool, end_txg: TxgT) -> bool
    {
        if !is_autosnap {
            return false;
        }
        {
            let mut st = self.shared.lock();
            if !st.tiering_enabled() || st.window.purge {
                return false;
            }
            if !st.window.is_closed() {
                if st.window.pending_txg.is_none() && st.roll_ready() &&
                    end_txg > st.window.finish_txg
                {
                    debug!(%end_txg, "queued snapshot for the next window");
                    st.window.pending_txg = Some(end_txg);
                    return true;
                }
                return false;
            }
            if st.locked > 0 || st.window.walking {
                return false;
            }
        }
        self.open_window(end_txg).await.unwrap_or(false)
    }

    /// Open a window ending at `end_txg`, persisting its boundaries before
    /// any block is discovered.
    #[instrument(skip(self))]
    pub async fn open_window(&mut self, end_txg: TxgT) -> Result<bool> {
        let (pw, start_txg) = {
            let mut st = self.shared.lock();
            let w = &mut st.window;
            if !w.is_closed() || end_txg < w.start_txg {
                return Ok(false);
            }
            w.finish_txg = end_txg;
            w.to_release_txg = end_txg;
            w.state = WindowState::Opening;
            (w.persisted(), w.start_txg)
        };
        if let Err(e) = pw.store(&*self.shared.meta).await {
            let mut st = self.shared.lock();
            st.window.finish_txg = TxgT::NONE;
            st.window.to_release_txg = TxgT::NONE;
            st.window.state = WindowState::Closed;
            self.shared.enter_fault(&mut st, FaultSource::MetaStore, e);
            return Err(e);
        }
        {
            let mut st = self.shared.lock();
            st.window.state = WindowState::Open;
            st.window.walking = true;
        }
        self.cursor = WalkCursor::default();
        info!(%start_txg, finish_txg = %end_txg, "window opened");
        self.shared.emit(PoolEvent::WindowOpened {
            start_txg,
            finish_txg: end_txg
        });
        Ok(true)
    }

    /// Do one bounded unit of work.  Returns false if there was nothing to
    /// do.
    pub async fn step(&mut self) -> bool {
        let (state, walking, pending) = {
            let st = self.shared.lock();
            if st.fault.is_some() {
                return false;
            }
            let pending = if st.locked == 0 {
                st.window.pending_txg
            } else {
                None
            };
            (st.window.state, st.window.walking, pending)
        };
        match state {
            WindowState::Open if walking => {
                let r = walker::walk_step(&self.shared, &mut self.cursor).await;
                match r {
                    Ok(WalkProgress::Paused) => true,
                    Ok(WalkProgress::Complete) => {
                        let mut st = self.shared.lock();
                        st.window.state = WindowState::Draining;
                        st.window.walking = false;
                        st.walk_faults = 0;
                        let c = st.tracker.counters();
                        info!(blocks = c.blocks_in, bytes = c.bytes_in,
                              "window walk complete");
                        drop(st);
                        self.cursor = WalkCursor::default();
                        self.shared.move_cv.notify_one();
                        true
                    },
                    Ok(WalkProgress::Stale) => {
                        self.cursor = WalkCursor::default();
                        true
                    },
                    Err(e) => {
                        self.walk_failed(e).await;
                        true
                    }
                }
            },
            WindowState::Draining => {
                let ready = {
                    let st = self.shared.lock();
                    st.tracker.is_drained() && st.in_flight == 0
                };
                if ready {
                    if let Err(e) = self.close_window().await {
                        warn!("window close failed: {e}");
                        return false;
                    }
                    true
                } else {
                    false
                }
            },
            WindowState::Closed => {
                let Some(end_txg) = pending else {
                    return false;
                };
                self.shared.lock().window.pending_txg = None;
                match self.open_window(end_txg).await {
                    Ok(true) => (),
                    Ok(false) => {
                        // Already covered by an earlier window
                        self.release(end_txg, end_txg).await;
                    },
                    Err(_) => ()
                }
                true
            },
            _ => false
        }
    }

    async fn walk_failed(&mut self, e: Error) {
        let faults = {
            let mut st = self.shared.lock();
            st.walk_faults += 1;
            st.walk_faults
        };
        warn!(%e, faults, "window walk failed");
        if let Err(e) = self.purge(PurgeReason::WalkError).await {
            error!("purge after walk failure failed: {e}");
        }
        let mut st = self.shared.lock();
        if faults >= st.config.walk_fault_limit {
            self.shared.enter_fault(&mut st, FaultSource::Walker, e);
        }
    }

    async fn release(&self, from: TxgT, to: TxgT) {
        if to.is_none() {
            return;
        }
        let r = self.shared.snapshots
            .release_by_txg_range(&self.shared.name, from, to)
            .await;
        if let Err(e) = r {
            // The snapshot will linger, but that doesn't hurt consistency
            warn!(%from, %to, "failed to release bounding snapshot: {e}");
        }
    }

    /// Close a fully relocated window, freeing the fast class copies of
    /// every moved block.
    #[instrument(skip(self))]
    pub async fn close_window(&mut self) -> Result<()> {
        {
            let st = self.shared.lock();
            match st.window.state {
                WindowState::Closed => return Err(Error::ENOENT),
                WindowState::Draining => (),
                _ => return Err(Error::EBUSY)
            }
            if !st.tracker.is_drained() || st.in_flight > 0 {
                return Err(Error::EBUSY);
            }
        }
        // Relocated copies must be durable before the originals go away
        self.shared.storage.sync_all().await?;

        let pw = {
            let mut st = self.shared.lock();
            st.window.delete_in_progress = true;
            st.window.generation += 1;
            st.window.persisted()
        };
        if let Err(e) = pw.store(&*self.shared.meta).await {
            let mut st = self.shared.lock();
            st.window.delete_in_progress = false;
            self.shared.enter_fault(&mut st, FaultSource::MetaStore, e);
            return Err(e);
        }

        let txg = self.shared.storage.current_txg();
        let moved = self.shared.lock().tracker.drain_moved();
        let mut freed = 0u64;
        let mut unfreed = Vec::new();
        let mut failure = None;
        for bd in moved.into_iter().filter(|bd| !bd.is_deleted()) {
            match self.shared.storage.free_dva(bd.fast(), txg) {
                Ok(()) => freed += 1,
                Err(e) => {
                    error!(dva = %bd.fast(), "free failed: {e}");
                    failure.get_or_insert(e);
                    unfreed.push(bd);
                }
            }
        }
        if let Some(e) = failure {
            // Stay in the delete phase.  The close is retried once the fault
            // is cleared, and only the unfreed copies are freed then.
            let mut st = self.shared.lock();
            st.tracker.restore_moved(unfreed);
            self.shared.enter_fault(&mut st, FaultSource::Free, e);
            return Err(e);
        }

        let (start_txg, finish_txg, to_release, blocks) = {
            let st = self.shared.lock();
            let w = &st.window;
            (w.start_txg, w.finish_txg, w.to_release_txg,
             st.tracker.counters().blocks_moved)
        };
        let pw = PersistedWindow {
            start_txg: finish_txg + 1,
            finish_txg: TxgT::NONE,
            to_release_txg: TxgT::NONE,
            delete: false
        };
        if let Err(e) = pw.store(&*self.shared.meta).await {
            let mut st = self.shared.lock();
            self.shared.enter_fault(&mut st, FaultSource::MetaStore, e);
            return Err(e);
        }
        {
            let mut st = self.shared.lock();
            let w = &mut st.window;
            w.start_txg = pw.start_txg;
            w.finish_txg = TxgT::NONE;
            w.to_release_txg = TxgT::NONE;
            w.delete_in_progress = false;
            w.replay_delete = false;
            w.state = WindowState::Closed;
            st.tracker.clear();
        }
        self.release(start_txg, to_release).await;
        info!(%start_txg, %finish_txg, freed, %txg, "window closed");
        self.shared.emit(PoolEvent::WindowClosed {
            start_txg,
            finish_txg,
            blocks
        });
        Ok(())
    }

    /// Discard the window without freeing anything.
    ///
    /// The window's start is unchanged, so its blocks will be found again by
    /// the next window.
    #[instrument(skip(self))]
    pub async fn purge(&mut self, reason: PurgeReason) -> Result<()> {
        let timeout = {
            let mut st = self.shared.lock();
            if st.window.is_closed() && st.window.pending_txg.is_none() {
                return Ok(());
            }
            if st.window.delete_in_progress {
                // Some fast copies are already gone; only a close can finish
                return Err(Error::EBUSY);
            }
            st.window.purge = true;
            st.window.generation += 1;
            st.config.purge_timeout()
        };
        self.shared.move_cv.notify_one();

        let deadline = Instant::now() + timeout;
        loop {
            let poll = {
                let st = self.shared.lock();
                if st.in_flight == 0 {
                    break;
                }
                st.config.idle_poll()
            };
            if self.shared.stopping() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("abandoning in-flight moves");
                break;
            }
            tokio::select! {
                _ = self.shared.idle_cv.notified() => (),
                _ = time::sleep(poll.min(deadline - now)) => (),
            }
        }

        let (start_txg, finish_txg, to_release, pending, pw) = {
            let mut st = self.shared.lock();
            st.tracker.clear();
            let w = &mut st.window;
            let old = (w.start_txg, w.finish_txg, w.to_release_txg,
                       w.pending_txg.take());
            w.finish_txg = TxgT::NONE;
            w.to_release_txg = TxgT::NONE;
            w.state = WindowState::Closed;
            w.walking = false;
            w.replay_delete = false;
            w.delete_in_progress = false;
            (old.0, old.1, old.2, old.3, w.persisted())
        };
        self.cursor = WalkCursor::default();
        let r = pw.store(&*self.shared.meta).await;
        if let Err(e) = r {
            let mut st = self.shared.lock();
            self.shared.enter_fault(&mut st, FaultSource::MetaStore, e);
        }
        self.release(start_txg, to_release).await;
        if let Some(p) = pending {
            self.release(p, p).await;
        }
        self.shared.lock().window.purge = false;
        info!(?reason, %start_txg, %finish_txg, "window purged");
        self.shared.emit(PoolEvent::WindowPurged {
            start_txg,
            finish_txg,
            reason
        });
        r
    }

    /// Leave the fault state, discarding any window.
    ///
    /// A window that already began freeing its fast class copies can't be
    /// discarded.  Its close is retried instead.
    pub async fn clear_fault(&mut self) -> Result<()> {
        let deleting = self.shared.lock().window.delete_in_progress;
        if !deleting {
            self.purge(PurgeReason::ClearFault).await?;
        }
        let (fault, errored) = {
            let mut st = self.shared.lock();
            st.mover_errors = 0;
            st.walk_faults = 0;
            let errored = std::mem::replace(&mut st.routing.special_errored,
                                            false);
            (st.fault.take(), errored)
        };
        if errored {
            self.shared.emit(PoolEvent::SpecialEnabled);
        }
        if fault.is_some() {
            info!("tiering fault cleared");
            self.shared.emit(PoolEvent::FaultCleared);
        }
        self.shared.kick();
        Ok(())
    }
}

// LCOV_EXCL_STOP
