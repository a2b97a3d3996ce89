// vim: tw=80
//! Entry point for all tiering control-path operations.  There is only one
//! controller for each running daemon, even if it has multiple pools.

use std::collections::BTreeMap;

use tokio::sync::{broadcast, RwLock};
use tracing::info;

use crate::{
    engine::{Collaborators, Engine, PoolEvent, Status},
    property::{Property, PropertyName, TieringConfig},
    router::WriteContext,
    snapshot::SnapshotListener,
    types::*,
};

#[derive(Default)]
pub struct Controller {
    /// One engine for every pool with tiering enabled
    engines: RwLock<BTreeMap<String, Engine>>,
}

impl Controller {
    /// Discard the pool's open window without freeing anything.
    pub async fn abort_window(&self, pool: &str) -> Result<()> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        engine.abort_window().await
    }

    pub async fn clear_errors(&self, pool: &str) -> Result<()> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        engine.clear_errors();
        Ok(())
    }

    pub async fn clear_fault(&self, pool: &str) -> Result<()> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        engine.clear_fault().await
    }

    pub async fn close_window(&self, pool: &str) -> Result<()> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        engine.close_window().await
    }

    /// A dataset of `pool` was destroyed.
    pub async fn dataset_destroyed(&self, pool: &str) -> Result<()> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        engine.dataset_destroyed().await
    }

    /// Stop tiering on a pool.  Any window stays persisted, and resumes
    /// when tiering is enabled again.
    pub async fn disable(&self, pool: &str) -> Result<()> {
        let engine = self.engines.write().await
            .remove(pool)
            .ok_or(Error::ENOENT)?;
        engine.shutdown().await;
        Ok(())
    }

    /// Start tiering on a pool
    pub async fn enable(&self, pool: &str, config: TieringConfig,
                        c: Collaborators) -> Result<()>
    {
        let mut guard = self.engines.write().await;
        if guard.contains_key(pool) {
            return Err(Error::EEXIST);
        }
        let engine = Engine::attach(pool, config, c).await?;
        guard.insert(pool.to_owned(), engine);
        info!(pool, "tiering enabled");
        Ok(())
    }

    pub async fn get_prop(&self, pool: &str, propname: PropertyName)
        -> Result<Property>
    {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        Ok(engine.get_property(propname))
    }

    /// Names of every pool with tiering enabled, in order
    pub async fn list_pools(&self) -> Vec<String> {
        self.engines.read().await.keys().cloned().collect()
    }

    pub async fn lock(&self, pool: &str) -> Result<()> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        engine.lock();
        Ok(())
    }

    pub async fn notify_deleted(&self, pool: &str, dva: DVA) -> Result<bool> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        Ok(engine.notify_deleted(dva))
    }

    pub async fn resolve_dva(&self, pool: &str, birth: TxgT, dva: DVA)
        -> Result<ClassT>
    {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        Ok(engine.resolve_dva(birth, dva))
    }

    /// Pick the class for a new block.  Pools without tiering write
    /// everything to the normal class.
    pub async fn select_class(&self, pool: &str, ctx: &WriteContext)
        -> ClassT
    {
        let guard = self.engines.read().await;
        guard.get(pool)
            .map(|engine| engine.select_class(ctx))
            .unwrap_or(ClassT::Normal)
    }

    pub async fn set_prop(&self, pool: &str, prop: Property) -> Result<()> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        engine.set_property(prop)
    }

    /// Shut down every engine
    pub async fn shutdown(&self) {
        let engines = std::mem::take(&mut *self.engines.write().await);
        for (_, engine) in engines {
            engine.shutdown().await;
        }
    }

    pub async fn snapshot_listener(&self, pool: &str)
        -> Result<SnapshotListener>
    {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        Ok(engine.snapshot_listener())
    }

    pub async fn status(&self, pool: &str) -> Result<Status> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        Ok(engine.status())
    }

    pub async fn subscribe(&self, pool: &str)
        -> Result<broadcast::Receiver<PoolEvent>>
    {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        Ok(engine.subscribe())
    }

    pub async fn unlock(&self, pool: &str) -> Result<()> {
        let guard = self.engines.read().await;
        let engine = guard.get(pool).ok_or(Error::ENOENT)?;
        engine.unlock()
    }
}

// LCOV_EXCL_STOP
