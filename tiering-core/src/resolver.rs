// vim: tw=80
//! Read-Path Resolver
//!
//! Decides which copy of a block a reader should trust.
use crate::{
    types::*,
    window::{MigrationWindow, WindowState},
};

/// The window boundaries that matter to a reader
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WindowBounds {
    pub start_txg: TxgT,
    pub finish_txg: TxgT,
    /// Is a window open for discovery or relocation?
    pub open: bool,
    /// Are the fast copies of a closing window being freed?
    pub freeing: bool,
}

impl From<&MigrationWindow> for WindowBounds {
    fn from(w: &MigrationWindow) -> Self {
        WindowBounds {
            start_txg: w.start_txg,
            finish_txg: w.finish_txg,
            open: w.state != WindowState::Closed && !w.delete_in_progress,
            freeing: w.delete_in_progress,
        }
    }
}

/// Pick the authoritative copy of a block born in `birth`.
///
/// `tracked` reports whether the block is still tracked, undeleted, by the
/// Block Tracker.  It is consulted only while a window is being freed.
/// Callers must hold the lock that serializes window changes.
pub fn resolve_dva<F>(birth: TxgT, bounds: &WindowBounds, tracked: F) -> ClassT
    where F: FnOnce() -> bool
{
    if !bounds.finish_txg.is_none() && birth > bounds.finish_txg {
        // Written after the window's discovery phase began
        ClassT::Special
    } else if birth >= bounds.start_txg {
        if !bounds.open && bounds.freeing {
            if tracked() {
                ClassT::Special
            } else {
                ClassT::Normal
            }
        } else {
            ClassT::Special
        }
    } else {
        ClassT::Normal
    }
}

// LCOV_EXCL_STOP
