// vim: tw=80
//! An in-memory pool
//!
//! Implements every service that the engine consumes, for tests and
//! demonstrations.  Each object is a two-level copy-on-write tree: one
//! indirect block pointing at its data blocks.  Snapshots are modelled only
//! as far as the engine can observe them: a retained snapshot keeps the
//! blocks born at or before it from being freed, and the tree as of each
//! committed txg stays walkable.
//!
//! Frees and metadata updates become durable only when their txg commits, so
//! [`SimPool::crash`] can discard them.  Block writes are durable at once.
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
};

use async_trait::async_trait;
use divbuf::DivBufShared;
use serde_derive::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    engine::{Collaborators, Engine},
    router::WriteContext,
    snapshot::{SnapshotCoordinator, SnapshotListener},
    storage::{Bypass, Storage},
    types::*,
    util::block_checksum,
    vdev::{Health, VdevCounters, VdevSample},
    walker::BlockTree,
    window::MetaStore,
};

/// Shape of a simulated pool
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimLayout {
    pub special_devices: u32,
    pub normal_devices: u32,
    /// Capacity of each special device, in bytes
    pub special_capacity: u64,
    /// Capacity of each normal device, in bytes
    pub normal_capacity: u64,
    /// Service time of one special device operation, in microseconds
    pub special_latency_us: u64,
    /// Service time of one normal device operation, in microseconds
    pub normal_latency_us: u64,
    /// Keep recently written blocks in memory, for the read bypass
    pub cache: bool,
}

impl Default for SimLayout {
    fn default() -> Self {
        SimLayout {
            special_devices: 1,
            normal_devices: 2,
            special_capacity: 64 << 20,
            normal_capacity: 1 << 30,
            special_latency_us: 20,
            normal_latency_us: 400,
            cache: false,
        }
    }
}

/// How the pool's own write, read and free paths consult the tiering engine
pub trait PlacementPolicy {
    fn select_class(&self, ctx: &WriteContext) -> ClassT;
    fn resolve_dva(&self, birth: TxgT, dva: DVA) -> ClassT;
    fn notify_deleted(&self, dva: DVA) -> bool;
}

impl PlacementPolicy for Engine {
    fn select_class(&self, ctx: &WriteContext) -> ClassT {
        Engine::select_class(self, ctx)
    }

    fn resolve_dva(&self, birth: TxgT, dva: DVA) -> ClassT {
        Engine::resolve_dva(self, birth, dva)
    }

    fn notify_deleted(&self, dva: DVA) -> bool {
        Engine::notify_deleted(self, dva)
    }
}

/// A pool without tiering
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTiering;

impl PlacementPolicy for NoTiering {
    fn select_class(&self, _ctx: &WriteContext) -> ClassT {
        ClassT::Normal
    }

    fn resolve_dva(&self, _birth: TxgT, _dva: DVA) -> ClassT {
        ClassT::Normal
    }

    fn notify_deleted(&self, _dva: DVA) -> bool {
        false
    }
}

#[derive(Debug)]
struct SimDevice {
    class: ClassT,
    health: Health,
    counters: VdevCounters,
    capacity: u64,
    allocated: u64,
    next_offset: u64,
    latency_ns: u64,
}

#[derive(Clone, Debug)]
struct SimObject {
    indirect: BlockPointer,
    leaves: Vec<BlockPointer>,
}

#[derive(Debug, Default)]
struct Inner {
    txg: TxgT,
    devices: Vec<SimDevice>,
    blocks: HashMap<DVA, Vec<u8>>,
    /// Frees that take effect when their txg commits
    pending_frees: BTreeMap<DVA, TxgT>,
    objects: BTreeMap<u64, SimObject>,
    /// Contents of every indirect block ever written
    children: HashMap<DVA, Vec<BlockPointer>>,
    /// Root pointers as of each committed txg
    roots: BTreeMap<TxgT, Vec<BlockPointer>>,
    /// Metadata as of the last commit
    meta: BTreeMap<&'static str, u64>,
    /// Metadata updates that the next commit will make durable
    meta_dirty: BTreeMap<&'static str, u64>,
    retained: BTreeSet<TxgT>,
    last_snapshot: TxgT,
    releases: Vec<(TxgT, TxgT)>,
    cache: Option<HashSet<DVA>>,
    corrupt_cache: HashSet<DVA>,
    read_errors: HashSet<DVA>,
    free_errors: HashSet<DVA>,
    write_errors: HashSet<VdevT>,
    tree_error: Option<Error>,
    meta_error: Option<Error>,
    bad_frees: u64,
    syncs: u64,
}

impl Inner {
    fn alloc(&mut self, class: ClassT, size: u64) -> Result<DVA> {
        let (vdev, dev) = self.devices.iter_mut()
            .enumerate()
            .filter(|(_, d)| d.class == class && d.health == Health::Online)
            .filter(|(_, d)| d.allocated + size <= d.capacity)
            .min_by_key(|(_, d)| d.allocated)
            .ok_or(Error::ENOSPC)?;
        let dva = DVA::new(vdev as VdevT, dev.next_offset);
        dev.next_offset += size;
        dev.allocated += size;
        Ok(dva)
    }

    /// Pick an address on the normal class, without allocating it yet
    fn reserve(&mut self, size: u64) -> Option<DVA> {
        let (vdev, dev) = self.devices.iter_mut()
            .enumerate()
            .filter(|(_, d)| d.class == ClassT::Normal)
            .min_by_key(|(_, d)| d.next_offset)?;
        let dva = DVA::new(vdev as VdevT, dev.next_offset);
        dev.next_offset += size;
        Some(dva)
    }

    fn class_of(&self, vdev: VdevT) -> Option<ClassT> {
        self.devices.get(vdev as usize).map(|d| d.class)
    }

    fn account(&mut self, vdev: VdevT, bytes: u64, write: bool) {
        let dev = &mut self.devices[vdev as usize];
        if write {
            dev.counters.writes += 1;
            dev.counters.bytes_written += bytes;
        } else {
            dev.counters.reads += 1;
            dev.counters.bytes_read += bytes;
        }
        dev.counters.busy_ns += dev.latency_ns;
        dev.counters.run_ns += dev.latency_ns;
    }

    fn write_leaf(&mut self,
                  policy: &dyn PlacementPolicy,
                  kind: BlockKind,
                  level: u8,
                  data: Vec<u8>,
                  sync: bool) -> Result<BlockPointer>
    {
        let size = data.len() as u64;
        let ctx = WriteContext { kind, psize: size, sync };
        let (dva, bulk) = match policy.select_class(&ctx) {
            ClassT::Special => match self.alloc(ClassT::Special, size) {
                Ok(dva) => (dva, self.reserve(size)),
                // Fall back, like any allocator would
                Err(_) => (self.alloc(ClassT::Normal, size)?, None)
            },
            ClassT::Normal => (self.alloc(ClassT::Normal, size)?, None)
        };
        self.account(dva.vdev, size, true);
        let checksum = block_checksum(&[&data[..]]);
        if let Some(cache) = self.cache.as_mut() {
            cache.insert(dva);
        }
        self.blocks.insert(dva, data);
        Ok(BlockPointer {
            dva,
            bulk,
            birth: self.txg,
            phys_birth: self.txg,
            kind,
            level,
            compression: Compression::None,
            lsize: size as u32,
            psize: size as u32,
            checksum,
        })
    }

    /// The owner of `bp` frees it, unless a snapshot still references it.
    fn release_block(&mut self, policy: &dyn PlacementPolicy,
                     bp: &BlockPointer)
    {
        if self.retained.last().is_some_and(|snap| bp.birth <= *snap) {
            return;
        }
        let dva = match bp.bulk {
            Some(bulk) if policy.resolve_dva(bp.birth, bp.dva) ==
                ClassT::Normal => bulk,
            _ => bp.dva
        };
        if dva == bp.dva && bp.bulk.is_some() {
            policy.notify_deleted(dva);
        }
        let txg = self.txg;
        if let Err(e) = self.free(dva, txg) {
            warn!(%dva, "owner free failed: {e}");
        }
    }

    fn free(&mut self, dva: DVA, txg: TxgT) -> Result<()> {
        if self.free_errors.contains(&dva) {
            return Err(Error::EIO);
        }
        if !self.blocks.contains_key(&dva) ||
            self.pending_frees.contains_key(&dva)
        {
            self.bad_frees += 1;
            return Err(Error::EINVAL);
        }
        self.pending_frees.insert(dva, txg);
        Ok(())
    }
}

/// An in-memory pool.  See the module documentation.
#[derive(Debug)]
pub struct SimPool {
    name: String,
    base: Instant,
    commit_waiters: AtomicBool,
    inner: Mutex<Inner>,
}

impl SimPool {
    pub fn new(name: &str, layout: &SimLayout) -> Self {
        let special = (0..layout.special_devices).map(|_| SimDevice {
            class: ClassT::Special,
            health: Health::Online,
            counters: VdevCounters::default(),
            capacity: layout.special_capacity,
            allocated: 0,
            next_offset: 0,
            latency_ns: layout.special_latency_us * 1000,
        });
        let normal = (0..layout.normal_devices).map(|_| SimDevice {
            class: ClassT::Normal,
            health: Health::Online,
            counters: VdevCounters::default(),
            capacity: layout.normal_capacity,
            allocated: 0,
            next_offset: 0,
            latency_ns: layout.normal_latency_us * 1000,
        });
        let inner = Inner {
            txg: TxgT(1),
            devices: special.chain(normal).collect(),
            cache: layout.cache.then(HashSet::new),
            ..Default::default()
        };
        SimPool {
            name: name.to_owned(),
            base: Instant::now(),
            commit_waiters: AtomicBool::new(false),
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Every service an engine needs, backed by this pool
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            storage: self.clone(),
            tree: self.clone(),
            meta: self.clone(),
            snapshots: self.clone(),
        }
    }

    /// Add foreground busy time to every device of `class`.
    pub fn add_load(&self, class: ClassT, busy_ns: u64) {
        let mut inner = self.lock();
        for dev in inner.devices.iter_mut().filter(|d| d.class == class) {
            dev.counters.busy_ns += busy_ns;
            dev.counters.run_ns += busy_ns;
            dev.counters.reads += 1;
        }
    }

    /// Bytes allocated on `class`
    pub fn allocated(&self, class: ClassT) -> u64 {
        self.lock().devices.iter()
            .filter(|d| d.class == class)
            .map(|d| d.allocated)
            .sum()
    }

    /// How many allocated blocks live on `class`?
    pub fn blocks_on(&self, class: ClassT) -> usize {
        let inner = self.lock();
        inner.blocks.keys()
            .filter(|dva| inner.class_of(dva.vdev) == Some(class))
            .count()
    }

    /// Commit the open txg, applying its deferred frees.  Returns the txg
    /// that was committed.
    pub fn commit(&self) -> TxgT {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let txg = inner.txg;
        let due = inner.pending_frees.iter()
            .filter(|(_, t)| **t <= txg)
            .map(|(dva, _)| *dva)
            .collect::<Vec<_>>();
        for dva in due {
            inner.pending_frees.remove(&dva);
            if let Some(data) = inner.blocks.remove(&dva) {
                let dev = &mut inner.devices[dva.vdev as usize];
                dev.allocated -= data.len() as u64;
            }
            if let Some(cache) = inner.cache.as_mut() {
                cache.remove(&dva);
            }
        }
        let dirty = std::mem::take(&mut inner.meta_dirty);
        inner.meta.extend(dirty);
        let roots = inner.objects.values()
            .map(|o| o.indirect.clone())
            .collect();
        inner.roots.insert(txg, roots);
        inner.txg += 1;
        debug!(%txg, "committed");
        txg
    }

    /// Lose everything that the open txg did not commit.
    pub fn crash(&self) {
        let mut inner = self.lock();
        inner.pending_frees.clear();
        inner.meta_dirty.clear();
        debug!(txg = %inner.txg, "crashed");
    }

    /// Make the cached copy of `dva` fail verification.
    pub fn corrupt_cache(&self, dva: DVA) {
        self.lock().corrupt_cache.insert(dva);
    }

    /// Remove an object.  Blocks that no snapshot references are freed.
    pub fn delete_object(&self, policy: &dyn PlacementPolicy, object: u64)
        -> Result<()>
    {
        let mut inner = self.lock();
        let obj = inner.objects.remove(&object).ok_or(Error::ENOENT)?;
        for bp in obj.leaves.iter().chain(std::iter::once(&obj.indirect)) {
            inner.release_block(policy, bp);
        }
        Ok(())
    }

    /// The owner frees a single block right away, bypassing the snapshot
    /// check.
    pub fn free_block(&self, dva: DVA) -> Result<()> {
        let mut inner = self.lock();
        let txg = inner.txg;
        inner.free(dva, txg)
    }

    /// Make every read of `dva` fail.
    pub fn inject_read_error(&self, dva: DVA) {
        self.lock().read_errors.insert(dva);
    }

    pub fn clear_read_errors(&self) {
        self.lock().read_errors.clear();
    }

    /// Make every free of `dva` fail.
    pub fn inject_free_error(&self, dva: DVA) {
        self.lock().free_errors.insert(dva);
    }

    pub fn clear_free_errors(&self) {
        self.lock().free_errors.clear();
    }

    /// Make every write to `vdev` fail.
    pub fn inject_write_error(&self, vdev: VdevT) {
        self.lock().write_errors.insert(vdev);
    }

    /// Is the block at `dva` allocated, and not yet freed?
    pub fn is_allocated(&self, dva: DVA) -> bool {
        let inner = self.lock();
        inner.blocks.contains_key(&dva) &&
            !inner.pending_frees.contains_key(&dva)
    }

    /// Block pointers of one object's data
    pub fn leaves(&self, object: u64) -> Result<Vec<BlockPointer>> {
        self.lock().objects.get(&object)
            .map(|o| o.leaves.clone())
            .ok_or(Error::ENOENT)
    }

    /// Frees of blocks that were not allocated, or were already freed
    pub fn bad_frees(&self) -> u64 {
        self.lock().bad_frees
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read back one object, through the Read-Path Resolver.
    pub async fn read_object(&self, policy: &dyn PlacementPolicy, object: u64)
        -> Result<Vec<Vec<u8>>>
    {
        let mut r = Vec::new();
        for bp in self.leaves(object)? {
            let dva = match bp.bulk {
                Some(bulk) if policy.resolve_dva(bp.birth, bp.dva) ==
                    ClassT::Normal => bulk,
                _ => bp.dva
            };
            let iovec = self.read_block(dva, bp.psize).await?;
            if block_checksum(&[&iovec[..]]) != bp.checksum {
                return Err(Error::EBADMSG);
            }
            r.push(iovec[..].to_vec());
        }
        Ok(r)
    }

    /// Every `(from, to)` range released by the engine, in order
    pub fn releases(&self) -> Vec<(TxgT, TxgT)> {
        self.lock().releases.clone()
    }

    /// Snapshots that the engine still retains
    pub fn retained(&self) -> Vec<TxgT> {
        self.lock().retained.iter().copied().collect()
    }

    pub fn set_commit_waiters(&self, waiting: bool) {
        self.commit_waiters.store(waiting, Ordering::Relaxed);
    }

    pub fn set_health(&self, vdev: VdevT, health: Health) {
        self.lock().devices[vdev as usize].health = health;
    }

    /// Make every metadata update fail, or stop failing.
    pub fn set_meta_error(&self, error: Option<Error>) {
        self.lock().meta_error = error;
    }

    /// Make every tree traversal fail, or stop failing.
    pub fn set_tree_error(&self, error: Option<Error>) {
        self.lock().tree_error = error;
    }

    /// How many times the engine called `sync_all`
    pub fn syncs(&self) -> u64 {
        self.lock().syncs
    }

    /// Play the Snapshot Coordinator: ask, commit, and announce a bounding
    /// snapshot.  Returns the snapshot's txg if the engine retained it.
    pub async fn take_snapshot(&self, listener: &SnapshotListener)
        -> Option<TxgT>
    {
        let txg = self.current_txg();
        if !listener.confirm(&self.name, true, txg).await {
            return None;
        }
        let end_txg = self.commit();
        let start_txg = self.lock().last_snapshot + 1;
        let name = format!("{}@tier-{}", self.name, end_txg);
        let retained = listener.notify_created(&name, true, true, start_txg,
                                               end_txg).await;
        let mut inner = self.lock();
        inner.last_snapshot = end_txg;
        if retained {
            inner.retained.insert(end_txg);
            Some(end_txg)
        } else {
            None
        }
    }

    /// Write an object, replacing its previous contents.
    pub fn write_object(&self,
                        policy: &dyn PlacementPolicy,
                        object: u64,
                        blocks: &[Vec<u8>],
                        sync: bool) -> Result<Vec<BlockPointer>>
    {
        let mut inner = self.lock();
        let leaves = blocks.iter()
            .map(|data| inner.write_leaf(policy, BlockKind::Data, 0,
                                         data.clone(), sync))
            .collect::<Result<Vec<_>>>()?;
        let payload = leaves.iter()
            .flat_map(|bp| bp.checksum.to_le_bytes())
            .collect::<Vec<u8>>();
        let kind = BlockKind::Metadata(MetaKind::Indirect);
        let indirect = inner.write_leaf(policy, kind, 1, payload, sync)?;
        inner.children.insert(indirect.dva, leaves.clone());
        let old = inner.objects.insert(object, SimObject {
            indirect,
            leaves: leaves.clone()
        });
        if let Some(old) = old {
            for bp in old.leaves.iter().chain(std::iter::once(&old.indirect)) {
                inner.release_block(policy, bp);
            }
        }
        Ok(leaves)
    }
}

#[async_trait]
impl Storage for SimPool {
    fn cached_read_bypass(&self, bp: &BlockPointer) -> Bypass {
        let inner = self.lock();
        let cached = inner.cache.as_ref()
            .is_some_and(|cache| cache.contains(&bp.dva));
        let Some(data) = inner.blocks.get(&bp.dva).filter(|_| cached) else {
            return Bypass::NotAvailable;
        };
        let mut data = data.clone();
        if inner.corrupt_cache.contains(&bp.dva) {
            data.iter_mut().for_each(|b| *b = !*b);
        }
        // Stream it out in two pieces, like a real cache would
        let tail = data.split_off(data.len() / 2);
        let head = DivBufShared::from(data);
        let tail = DivBufShared::from(tail);
        Bypass::Hit(vec![head.try_const().unwrap(), tail.try_const().unwrap()])
    }

    fn class_alloc_percentage(&self, class: ClassT) -> u8 {
        let inner = self.lock();
        let (alloc, cap) = inner.devices.iter()
            .filter(|d| d.class == class)
            .fold((0, 0), |(a, c), d| (a + d.allocated, c + d.capacity));
        crate::util::percentage(alloc, cap)
    }

    fn class_is_degraded(&self, class: ClassT) -> bool {
        self.lock().devices.iter()
            .any(|d| d.class == class && d.health.is_impaired())
    }

    fn class_of(&self, vdev: VdevT) -> Option<ClassT> {
        self.lock().class_of(vdev)
    }

    fn commit_waiters(&self) -> bool {
        self.commit_waiters.load(Ordering::Relaxed)
    }

    fn current_txg(&self) -> TxgT {
        self.lock().txg
    }

    fn free_dva(&self, dva: DVA, txg: TxgT) -> Result<()> {
        self.lock().free(dva, txg)
    }

    async fn read_block(&self, dva: DVA, size: u32) -> Result<IoVec> {
        let mut inner = self.lock();
        if inner.class_of(dva.vdev).is_none() {
            return Err(Error::ENXIO);
        }
        inner.account(dva.vdev, u64::from(size), false);
        if inner.read_errors.contains(&dva) {
            return Err(Error::EIO);
        }
        let data = inner.blocks.get(&dva).ok_or(Error::ENOENT)?;
        if data.len() != size as usize {
            return Err(Error::EINVAL);
        }
        let dbs = DivBufShared::from(data.clone());
        Ok(dbs.try_const().unwrap())
    }

    async fn sync_all(&self) -> Result<()> {
        self.lock().syncs += 1;
        Ok(())
    }

    fn vdev_samples(&self) -> Vec<VdevSample> {
        let timestamp_ns = self.base.elapsed().as_nanos() as u64;
        self.lock().devices.iter()
            .enumerate()
            .map(|(i, d)| VdevSample {
                vdev: i as VdevT,
                class: d.class,
                health: d.health,
                counters: VdevCounters { timestamp_ns, ..d.counters }
            }).collect()
    }

    async fn write_block(&self, dva: DVA, sglist: SGList) -> Result<()> {
        let mut inner = self.lock();
        if inner.class_of(dva.vdev).is_none() {
            return Err(Error::ENXIO);
        }
        let data = sglist.iter()
            .flat_map(|iovec| iovec[..].iter().copied())
            .collect::<Vec<u8>>();
        let size = data.len() as u64;
        inner.account(dva.vdev, size, true);
        if inner.write_errors.contains(&dva.vdev) {
            return Err(Error::EIO);
        }
        // Rewriting the same block, as after a crash, allocates nothing new
        if inner.blocks.insert(dva, data).is_none() {
            inner.devices[dva.vdev as usize].allocated += size;
        }
        Ok(())
    }
}

#[async_trait]
impl BlockTree for SimPool {
    async fn roots(&self, txg: TxgT) -> Result<Vec<BlockPointer>> {
        let inner = self.lock();
        if let Some(e) = inner.tree_error {
            return Err(e);
        }
        Ok(inner.roots.range(..=txg)
            .next_back()
            .map(|(_, roots)| roots.clone())
            .unwrap_or_default())
    }

    async fn children(&self, bp: &BlockPointer) -> Result<Vec<BlockPointer>> {
        let inner = self.lock();
        if let Some(e) = inner.tree_error {
            return Err(e);
        }
        inner.children.get(&bp.dva).cloned().ok_or(Error::ENOENT)
    }
}

#[async_trait]
impl MetaStore for SimPool {
    async fn lookup(&self, key: &'static str) -> Result<Option<u64>> {
        let inner = self.lock();
        Ok(inner.meta_dirty.get(key).or_else(|| inner.meta.get(key)).copied())
    }

    async fn update(&self, entries: &[(&'static str, u64)]) -> Result<()> {
        let mut inner = self.lock();
        if let Some(e) = inner.meta_error {
            return Err(e);
        }
        inner.meta_dirty.extend(entries.iter().copied());
        Ok(())
    }
}

#[async_trait]
impl SnapshotCoordinator for SimPool {
    async fn release_by_txg_range(&self, handle: &str, from: TxgT, to: TxgT)
        -> Result<()>
    {
        if handle != self.name {
            return Err(Error::ENOENT);
        }
        let mut inner = self.lock();
        inner.releases.push((from, to));
        inner.retained.retain(|txg| *txg < from || *txg > to);
        Ok(())
    }
}

// LCOV_EXCL_STOP
