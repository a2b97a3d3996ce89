// vim: tw=80
//! End-to-end tests of the tiering engine on a simulated pool
use std::{sync::Arc, time::Duration};

use tokio::time::{self, Instant};

use tiering_core::{
    engine::{Engine, Status},
    property::TieringConfig,
    router::WriteContext,
    sim::{PlacementPolicy, SimLayout, SimPool},
    snapshot::SnapshotListener,
    types::*,
    window::WindowState,
};

const POOLNAME: &str = "TestPool";

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

/// One engine attached to one simulated pool
struct Harness {
    pool: Arc<SimPool>,
    engine: Engine,
    listener: SnapshotListener,
}

impl Harness {
    async fn new(layout: SimLayout, config: TieringConfig) -> Self {
        let pool = Arc::new(SimPool::new(POOLNAME, &layout));
        Self::attach(pool, config).await
    }

    /// Attach a fresh engine to an existing pool, as after a reboot
    async fn attach(pool: Arc<SimPool>, config: TieringConfig) -> Self {
        let engine = t!(Engine::attach(POOLNAME, config,
                                       pool.collaborators()).await);
        let listener = engine.snapshot_listener();
        Harness { pool, engine, listener }
    }

    /// Write `n` objects of `blocks` blocks each, starting at `first`.
    fn write(&self, first: u64, n: u64, blocks: usize) {
        for object in first..first + n {
            t!(self.pool.write_object(&self.engine, object,
                                      &contents(object, blocks), false));
        }
    }

    /// Every object reads back what was written
    async fn verify(&self, objects: std::ops::Range<u64>, blocks: usize) {
        for object in objects {
            let data = t!(self.pool.read_object(&self.engine, object).await);
            assert_eq!(data, contents(object, blocks), "object {object}");
        }
    }

    /// Take a bounding snapshot that the engine must accept
    async fn snapshot(&self) -> TxgT {
        self.pool.take_snapshot(&self.listener).await
            .expect("engine refused the snapshot")
    }

    fn status(&self) -> Status {
        self.engine.status()
    }

    /// Wait until the window ending at `finish` has closed
    async fn wait_closed(&self, finish: TxgT) {
        wait_for("window close", || {
            let s = self.status();
            s.window_state == WindowState::Closed && s.start_txg == finish + 1
        }).await;
    }
}

/// Puts everything on the fast class, while it has room
struct ForceSpecial;

impl PlacementPolicy for ForceSpecial {
    fn select_class(&self, _ctx: &WriteContext) -> ClassT {
        ClassT::Special
    }

    fn resolve_dva(&self, _birth: TxgT, _dva: DVA) -> ClassT {
        ClassT::Special
    }

    fn notify_deleted(&self, _dva: DVA) -> bool {
        false
    }
}

/// Deterministic contents for one object's blocks
fn contents(object: u64, blocks: usize) -> Vec<Vec<u8>> {
    (0..blocks).map(|i| {
        let fill = (object as u8).wrapping_mul(31).wrapping_add(i as u8);
        vec![fill; 4096]
    }).collect()
}

/// Poll `f` until it holds.  Panics if it takes longer than a minute of
/// virtual time.
async fn wait_for<F: FnMut() -> bool>(what: &str, mut f: F) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !f() {
        assert!(Instant::now() < deadline, "Timed out waiting for {what}");
        time::sleep(Duration::from_millis(10)).await;
    }
}

mod controller;
mod faults;
mod routing;
mod window;
