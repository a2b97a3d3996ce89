// vim: tw=80
//! Per-pool tiering engine
//!
//! All mutable state of one pool lives in a single [`PoolTieringState`],
//! guarded by one mutex and shared by the foreground paths and the three
//! background tasks.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
    Mutex,
    MutexGuard,
};

use serde_derive::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Notify},
    task::JoinHandle,
    time,
};
use tracing::{error, info, info_span, warn};
use tracing_futures::Instrument;

use crate::{
    balancer,
    coordinator::{self, AdminMsg, WindowCoordinator},
    mover,
    property::{Property, PropertyName, TieringConfig},
    resolver::{self, WindowBounds},
    router::{ClassRouter, ClassRoutingState, Watermark, WriteContext},
    snapshot::{SnapshotCoordinator, SnapshotListener, SnapshotMsg},
    stats::{PerClassStats, RollingStats, Sampler},
    storage::Storage,
    tracker::{Counters, Tracker},
    types::*,
    util::percentage,
    walker::BlockTree,
    watermark::WatermarkMonitor,
    window::{MetaStore, MigrationWindow, WindowState},
};

/// Which part of the engine gave up
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FaultSource {
    Mover,
    Walker,
    Snapshot,
    /// Window boundaries could not be persisted
    MetaStore,
    /// A relocated block's fast class copy could not be freed
    Free,
}

/// Why the engine stopped migrating
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Fault {
    pub source: FaultSource,
    /// The last error seen
    pub error: Error,
}

/// Why a window was discarded
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PurgeReason {
    Aborted,
    DatasetDestroyed,
    WalkError,
    ClearFault,
}

/// Pool event notifications
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PoolEvent {
    WatermarkChanged { from: Watermark, to: Watermark },
    /// A fast class device reported an error
    SpecialDisabled,
    /// The fast class error condition was cleared
    SpecialEnabled,
    WindowOpened { start_txg: TxgT, finish_txg: TxgT },
    WindowClosed { start_txg: TxgT, finish_txg: TxgT, blocks: u64 },
    WindowPurged { start_txg: TxgT, finish_txg: TxgT, reason: PurgeReason },
    Fault(Fault),
    FaultCleared,
}

/// The external services that one engine depends upon
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub tree: Arc<dyn BlockTree>,
    pub meta: Arc<dyn MetaStore>,
    pub snapshots: Arc<dyn SnapshotCoordinator>,
}

/// Everything about one pool that changes at runtime.
#[derive(Debug)]
pub struct PoolTieringState {
    pub config: TieringConfig,
    pub routing: ClassRoutingState,
    /// Most recent sample
    pub stats: PerClassStats,
    /// Fast class allocated space, in percent, as of the last monitor tick
    pub special_alloc: u8,
    pub window: MigrationWindow,
    pub tracker: Tracker,
    pub fault: Option<Fault>,
    /// Nesting depth of the administrative lock
    pub locked: u32,
    /// Block moves dispatched but not yet finished
    pub in_flight: u32,
    /// Consecutive failed block moves, engine-wide
    pub mover_errors: u32,
    /// Consecutive failed walks
    pub walk_faults: u32,
    sampler: Sampler,
    rolling: RollingStats,
    monitor: WatermarkMonitor,
    ticks: u32,
}

impl PoolTieringState {
    pub fn new(config: TieringConfig, window: MigrationWindow) -> Self {
        let rolling = RollingStats::new(config.balance_ticks as usize);
        let mut routing = ClassRoutingState::default();
        if let Some(r) = config.routing_override {
            routing.base_ratio = r;
            routing.apply_watermark();
        }
        PoolTieringState {
            config,
            routing,
            stats: PerClassStats::default(),
            special_alloc: 0,
            window,
            tracker: Tracker::default(),
            fault: None,
            locked: 0,
            in_flight: 0,
            mover_errors: 0,
            walk_faults: 0,
            sampler: Sampler::default(),
            rolling,
            monitor: WatermarkMonitor::default(),
            ticks: 0,
        }
    }

    /// May fast class writes and new windows happen at all?
    pub fn tiering_enabled(&self) -> bool {
        self.config.enabled && self.fault.is_none()
    }

    /// Has the open window relocated enough to roll over to the next one?
    pub fn roll_ready(&self) -> bool {
        let roll = self.config.roll_threshold;
        let c = self.tracker.counters();
        roll > 0 && self.window.is_active() && c.blocks_in > 0 &&
            percentage(c.blocks_moved, c.blocks_in) >= roll
    }
}

/// Pool state and services shared by the engine's tasks
pub(crate) struct Shared {
    pub name: String,
    state: Mutex<PoolTieringState>,
    pub storage: Arc<dyn Storage>,
    pub tree: Arc<dyn BlockTree>,
    pub meta: Arc<dyn MetaStore>,
    pub snapshots: Arc<dyn SnapshotCoordinator>,
    pub router: ClassRouter,
    /// Wakes the window task
    pub walk_cv: Notify,
    /// Wakes the Mover's dispatch loop
    pub move_cv: Notify,
    /// Signalled when the last in-flight move finishes
    pub idle_cv: Notify,
    stop_cv: Notify,
    stop: AtomicBool,
    events: broadcast::Sender<PoolEvent>,
}

impl Shared {
    pub fn new(name: &str,
               config: TieringConfig,
               window: MigrationWindow,
               c: Collaborators) -> Self
    {
        let (events, _) = broadcast::channel(64);
        Shared {
            name: name.to_owned(),
            state: Mutex::new(PoolTieringState::new(config, window)),
            storage: c.storage,
            tree: c.tree,
            meta: c.meta,
            snapshots: c.snapshots,
            router: ClassRouter::default(),
            walk_cv: Notify::new(),
            move_cv: Notify::new(),
            idle_cv: Notify::new(),
            stop_cv: Notify::new(),
            stop: AtomicBool::new(false),
            events,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PoolTieringState> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: PoolEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Enter the sticky fault state.  Returns false if already faulted.
    pub fn enter_fault(&self,
                       st: &mut PoolTieringState,
                       source: FaultSource,
                       error: Error) -> bool
    {
        if st.fault.is_some() {
            return false;
        }
        error!(pool = %self.name, ?source, %error,
               "tiering faulted; migration disabled until cleared");
        let fault = Fault { source, error };
        st.fault = Some(fault);
        self.emit(PoolEvent::Fault(fault));
        true
    }

    /// Wake every background loop
    pub fn kick(&self) {
        self.walk_cv.notify_one();
        self.move_cv.notify_one();
        self.idle_cv.notify_one();
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.stop_cv.notify_waiters();
        self.kick();
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// One tick of the stat sampler and watermark monitor, and every few
    /// ticks the load balancer.
    pub fn monitor_tick(&self) {
        let samples = self.storage.vdev_samples();
        let alloc = self.storage.class_alloc_percentage(ClassT::Special);
        let degraded = self.storage.class_is_degraded(ClassT::Special);
        let events = {
            let mut guard = self.lock();
            let st = &mut *guard;
            st.routing.special_present = samples.iter()
                .any(|s| s.class == ClassT::Special);
            st.stats = st.sampler.sample(&samples);
            st.rolling.push(st.stats);
            st.special_alloc = alloc;
            let events = st.monitor.tick(&mut st.routing, &st.config, alloc,
                                         degraded);
            st.ticks += 1;
            if st.ticks >= st.config.balance_ticks {
                st.ticks = 0;
                let mean = st.rolling.mean();
                balancer::balance(&mut st.routing, &st.config, &mean);
            }
            events
        };
        if !events.is_empty() {
            // The Mover's throttle depends on the watermark
            self.move_cv.notify_one();
        }
        for event in events {
            self.emit(event);
        }
    }
}

/// A point-in-time report of one engine's state
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Status {
    pub name: String,
    pub enabled: bool,
    pub locked: bool,
    pub fault: Option<Fault>,
    pub watermark: Watermark,
    pub special_alloc: u8,
    pub special_errored: bool,
    pub base_ratio: u8,
    pub to_normal_ratio: u8,
    pub correction_rate: u8,
    pub stats: PerClassStats,
    pub window_state: WindowState,
    pub start_txg: TxgT,
    pub finish_txg: TxgT,
    pub to_release_txg: TxgT,
    pub pending_txg: Option<TxgT>,
    pub counters: Counters,
    pub planned: usize,
    pub moved: usize,
    pub in_flight: u32,
}

/// The tiering engine of one pool.
///
/// Dropping an `Engine` stops its background tasks at their next suspension
/// point, but only [`Engine::shutdown`] waits for them.
pub struct Engine {
    shared: Arc<Shared>,
    snap_tx: mpsc::Sender<SnapshotMsg>,
    admin_tx: mpsc::Sender<AdminMsg>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Serialize administrative requests through the window task
    async fn admin<F>(&self, f: F) -> Result<()>
        where F: FnOnce(oneshot::Sender<Result<()>>) -> AdminMsg
    {
        let (tx, rx) = oneshot::channel();
        self.admin_tx.send(f(tx)).await
            .map_err(|_| Error::ESHUTDOWN)?;
        rx.await.map_err(|_| Error::ESHUTDOWN)?
    }

    /// Discard the open window without freeing anything.
    pub async fn abort_window(&self) -> Result<()> {
        if self.shared.lock().fault.is_some() {
            return Err(Error::ENOTRECOVERABLE);
        }
        self.admin(|reply| AdminMsg::Purge {
            reason: PurgeReason::Aborted,
            reply
        }).await
    }

    /// Attach an engine to a pool, resuming any window that was interrupted
    /// by a crash, and start its background tasks.
    pub async fn attach(name: &str, config: TieringConfig, c: Collaborators)
        -> Result<Self>
    {
        config.validate()?;
        let window = coordinator::recover(name, &*c.storage, &*c.meta).await?;
        let sample_interval = config.sample_interval();
        let shared = Arc::new(Shared::new(name, config, window, c));
        // Pick up the devices before the first write arrives
        shared.monitor_tick();

        let (snap_tx, snap_rx) = mpsc::channel(16);
        let (admin_tx, admin_rx) = mpsc::channel(4);
        let span = info_span!("tiering", pool = %name);
        let coordinator = WindowCoordinator::new(shared.clone());
        let coordinator_task = tokio::spawn(
            coordinator.run(snap_rx, admin_rx).instrument(span.clone())
        );
        let mover_task = tokio::spawn(
            mover::run(shared.clone()).instrument(span.clone())
        );
        let monitor_task = tokio::spawn(
            Self::run_monitor(shared.clone(), sample_interval).instrument(span)
        );
        info!(pool = %name, "tiering engine attached");
        Ok(Engine {
            shared,
            snap_tx,
            admin_tx,
            tasks: vec![coordinator_task, mover_task, monitor_task],
        })
    }

    /// Periodic task driving the sampler, watermark monitor and balancer
    async fn run_monitor(shared: Arc<Shared>, period: time::Duration) {
        if period.is_zero() {
            warn!("sample interval is zero; watermark monitor disabled");
            return;
        }
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            let stopped = shared.stop_cv.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();
            if shared.stopping() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => shared.monitor_tick(),
                _ = &mut stopped => break,
            }
        }
    }

    /// Clear the special class error condition, after a scrub or repair.
    pub fn clear_errors(&self) {
        let was = {
            let mut st = self.shared.lock();
            std::mem::replace(&mut st.routing.special_errored, false)
        };
        if was {
            info!(pool = %self.shared.name, "special class errors cleared");
            self.shared.emit(PoolEvent::SpecialEnabled);
        }
    }

    /// Leave the fault state.  Any window is purged, and migration resumes
    /// with the next confirmed snapshot.
    pub async fn clear_fault(&self) -> Result<()> {
        self.admin(|reply| AdminMsg::ClearFault { reply }).await
    }

    /// Close the current window now.  Fails with `EBUSY` if any block still
    /// awaits relocation, or `ENOENT` if no window is open.
    pub async fn close_window(&self) -> Result<()> {
        self.admin(|reply| AdminMsg::Close { reply }).await
    }

    /// A dataset was destroyed.  Its blocks may be in the window, so discard
    /// the window.
    pub async fn dataset_destroyed(&self) -> Result<()> {
        self.admin(|reply| AdminMsg::Purge {
            reason: PurgeReason::DatasetDestroyed,
            reply
        }).await
    }

    pub fn get_property(&self, name: PropertyName) -> Property {
        self.shared.lock().config.get(name)
    }

    /// Suspend window opening and block moves.  Nests.
    pub fn lock(&self) {
        self.shared.lock().locked += 1;
    }

    /// Run one monitor tick right away, without waiting for the timer.
    pub fn monitor_tick(&self) {
        self.shared.monitor_tick();
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The owner of the block at `dva` freed it.
    ///
    /// Returns whether the block was tracked.  A tracked block is retired
    /// by the Mover without any I/O.
    pub fn notify_deleted(&self, dva: DVA) -> bool {
        let tracked = self.shared.lock().tracker.notify_deleted(&dva);
        if tracked {
            self.shared.move_cv.notify_one();
        }
        tracked
    }

    /// Which copy of a block born in `birth`, whose fast class copy is at
    /// `dva`, should a reader use?
    pub fn resolve_dva(&self, birth: TxgT, dva: DVA) -> ClassT {
        let st = self.shared.lock();
        let bounds = WindowBounds::from(&st.window);
        resolver::resolve_dva(birth, &bounds,
                              || st.tracker.contains_live(&dva))
    }

    /// Decide where a new block should be written.
    pub fn select_class(&self, ctx: &WriteContext) -> ClassT {
        let st = self.shared.lock();
        self.shared.router.select_class(ctx, &st.routing, &st.config,
                                        st.tiering_enabled())
    }

    pub fn set_property(&self, prop: Property) -> Result<()> {
        {
            let mut guard = self.shared.lock();
            let st = &mut *guard;
            st.config.set(prop.clone())?;
            match prop {
                Property::RoutingOverride(_) => {
                    if let Some(r) = st.config.routing_override {
                        st.routing.base_ratio = r;
                    }
                    st.routing.apply_watermark();
                },
                _ => ()
            }
        }
        info!(pool = %self.shared.name, %prop, "property set");
        self.shared.kick();
        Ok(())
    }

    /// Stop all background tasks and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.shared.request_stop();
        for jh in self.tasks.drain(..) {
            if let Err(e) = jh.await {
                error!(pool = %self.shared.name, "tiering task failed: {e}");
            }
        }
        info!(pool = %self.shared.name, "tiering engine detached");
    }

    /// The handle through which the Snapshot Coordinator talks to this
    /// engine
    pub fn snapshot_listener(&self) -> SnapshotListener {
        SnapshotListener::new(self.snap_tx.clone())
    }

    pub fn status(&self) -> Status {
        let st = self.shared.lock();
        Status {
            name: self.shared.name.clone(),
            enabled: st.config.enabled,
            locked: st.locked > 0,
            fault: st.fault,
            watermark: st.routing.watermark,
            special_alloc: st.special_alloc,
            special_errored: st.routing.special_errored,
            base_ratio: st.routing.base_ratio,
            to_normal_ratio: st.routing.to_normal_ratio,
            correction_rate: st.routing.correction_rate,
            stats: st.stats,
            window_state: st.window.state,
            start_txg: st.window.start_txg,
            finish_txg: st.window.finish_txg,
            to_release_txg: st.window.to_release_txg,
            pending_txg: st.window.pending_txg,
            counters: st.tracker.counters(),
            planned: st.tracker.planned_len(),
            moved: st.tracker.moved_len(),
            in_flight: st.in_flight,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.subscribe()
    }

    /// Undo one [`Engine::lock`].
    pub fn unlock(&self) -> Result<()> {
        {
            let mut st = self.shared.lock();
            if st.locked == 0 {
                return Err(Error::EINVAL);
            }
            st.locked -= 1;
        }
        self.shared.kick();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

// LCOV_EXCL_STOP
