// vim: tw=80
//! Migration windows and their persisted boundaries
use std::fmt;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// The pool's metadata store, where window boundaries survive reboots.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Look up one entry.  Absent entries are `Ok(None)`.
    async fn lookup(&self, key: &'static str) -> Result<Option<u64>>;

    /// Set several entries in one transaction.
    async fn update(&self, entries: &[(&'static str, u64)]) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum WindowState {
    #[default]
    Closed,
    /// Boundaries chosen, but not yet persisted
    Opening,
    /// The Tree Walker is discovering blocks
    Open,
    /// Every block has been discovered; waiting for the Mover
    Draining,
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowState::Closed => "closed".fmt(f),
            WindowState::Opening => "opening".fmt(f),
            WindowState::Open => "open".fmt(f),
            WindowState::Draining => "draining".fmt(f),
        }
    }
}

/// One bounded relocation epoch.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MigrationWindow {
    /// First txg that has not yet been relocated by any window
    pub start_txg: TxgT,
    /// Last txg of the open window, or `TxgT::NONE`
    pub finish_txg: TxgT,
    /// Snapshot txg whose reference is released when this window closes
    pub to_release_txg: TxgT,
    pub state: WindowState,
    /// Fast class copies are being freed
    pub delete_in_progress: bool,
    /// The window is being discarded
    pub purge: bool,
    /// A Tree Walker is running
    pub walking: bool,
    /// Rediscovered blocks were already relocated before a crash
    pub replay_delete: bool,
    /// Bumped whenever the tracked blocks are discarded or freed.  Stale
    /// Mover and Tree Walker work is recognised by its generation.
    pub generation: u64,
    /// A retained snapshot, taken early, that will bound the next window
    pub pending_txg: Option<TxgT>,
}

impl MigrationWindow {
    pub fn new(start_txg: TxgT) -> Self {
        MigrationWindow {
            start_txg,
            .. Default::default()
        }
    }

    /// Is a window past its opening phase, but not yet closed?
    pub fn is_active(&self) -> bool {
        matches!(self.state, WindowState::Open | WindowState::Draining)
    }

    pub fn is_closed(&self) -> bool {
        self.state == WindowState::Closed
    }

    /// The part of the window that survives a crash
    pub fn persisted(&self) -> PersistedWindow {
        PersistedWindow {
            start_txg: self.start_txg,
            finish_txg: self.finish_txg,
            to_release_txg: self.to_release_txg,
            delete: self.delete_in_progress,
        }
    }
}

/// Window boundaries as stored in the pool's metadata.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PersistedWindow {
    pub start_txg: TxgT,
    pub finish_txg: TxgT,
    pub to_release_txg: TxgT,
    pub delete: bool,
}

impl PersistedWindow {
    pub const START_KEY: &'static str = "tiering_start_txg";
    pub const FINISH_KEY: &'static str = "tiering_finish_txg";
    pub const TO_RELEASE_KEY: &'static str = "tiering_to_release_txg";
    pub const DELETE_KEY: &'static str = "tiering_delete";

    /// Load the stored window.  `None` if this pool never had one.
    pub async fn load(meta: &dyn MetaStore) -> Result<Option<Self>> {
        let Some(start) = meta.lookup(Self::START_KEY).await? else {
            return Ok(None);
        };
        let finish = meta.lookup(Self::FINISH_KEY).await?.unwrap_or(0);
        let to_release = meta.lookup(Self::TO_RELEASE_KEY).await?.unwrap_or(0);
        let delete = meta.lookup(Self::DELETE_KEY).await?.unwrap_or(0);
        Ok(Some(PersistedWindow {
            start_txg: TxgT(start),
            finish_txg: TxgT(finish),
            to_release_txg: TxgT(to_release),
            delete: delete != 0,
        }))
    }

    pub async fn store(&self, meta: &dyn MetaStore) -> Result<()> {
        meta.update(&[
            (Self::START_KEY, self.start_txg.0),
            (Self::FINISH_KEY, self.finish_txg.0),
            (Self::TO_RELEASE_KEY, self.to_release_txg.0),
            (Self::DELETE_KEY, u64::from(self.delete)),
        ]).await
    }
}

// LCOV_EXCL_STOP
