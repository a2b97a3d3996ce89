// vim: tw=80
//! Messages exchanged with the Snapshot Coordinator
//!
//! The Snapshot Coordinator calls into the engine from its own context.  Its
//! three callbacks become typed messages on a channel, served by the
//! engine's window task.
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::{mpsc, oneshot};

use crate::types::*;

/// The engine's side of the snapshot protocol
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotCoordinator: Send + Sync + 'static {
    /// Drop a retained snapshot reference.
    async fn release_by_txg_range(&self, handle: &str, from: TxgT, to: TxgT)
        -> Result<()>;
}

#[derive(Debug)]
pub enum SnapshotMsg {
    /// May a bounding snapshot be taken now?
    Confirm {
        dataset: String,
        recursive: bool,
        txg: TxgT,
        reply: oneshot::Sender<bool>
    },
    /// A bounding snapshot was created.  Reply whether the engine retains it.
    Created {
        name: String,
        recursive: bool,
        is_autosnap: bool,
        start_txg: TxgT,
        end_txg: TxgT,
        reply: oneshot::Sender<bool>
    },
    /// The expected snapshot could not be created
    Error {
        name: String,
        error: Error,
        txg: TxgT
    },
}

/// Handle that the Snapshot Coordinator uses to talk to one engine.
///
/// If the engine has shut down, every question is answered "no".
#[derive(Clone, Debug)]
pub struct SnapshotListener {
    tx: mpsc::Sender<SnapshotMsg>,
}

impl SnapshotListener {
    pub(crate) fn new(tx: mpsc::Sender<SnapshotMsg>) -> Self {
        SnapshotListener { tx }
    }

    async fn ask(&self, msg: SnapshotMsg, rx: oneshot::Receiver<bool>) -> bool
    {
        if self.tx.send(msg).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn confirm(&self, dataset: &str, recursive: bool, txg: TxgT)
        -> bool
    {
        let (reply, rx) = oneshot::channel();
        let msg = SnapshotMsg::Confirm {
            dataset: dataset.to_owned(),
            recursive,
            txg,
            reply
        };
        self.ask(msg, rx).await
    }

    pub async fn notify_created(&self,
                                name: &str,
                                recursive: bool,
                                is_autosnap: bool,
                                start_txg: TxgT,
                                end_txg: TxgT) -> bool
    {
        let (reply, rx) = oneshot::channel();
        let msg = SnapshotMsg::Created {
            name: name.to_owned(),
            recursive,
            is_autosnap,
            start_txg,
            end_txg,
            reply
        };
        self.ask(msg, rx).await
    }

    pub async fn notify_error(&self, name: &str, error: Error, txg: TxgT) {
        let msg = SnapshotMsg::Error { name: name.to_owned(), error, txg };
        // Nobody to tell if the engine is gone
        let _ = self.tx.send(msg).await;
    }
}

// LCOV_EXCL_STOP
