// Copyright (c) The Diem Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small shared pieces: cancellation, the writer pacing signal, and the
//! catchpoint file-system layout.

use crate::types::Round;
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::{
    io::ErrorKind,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Directory (under both the hot and the cold root) holding catchpoint
/// artifacts.
pub const CATCHPOINT_DIR_NAME: &str = "catchpoints";

/// Relative path of the first-stage data file for an accounts round.
pub fn make_catchpoint_data_file_path(accounts_round: Round) -> String {
    format!("{}.data", accounts_round)
}

/// Relative path of the final catchpoint archive for a block round. Fans
/// out over two directory levels derived from the round so no directory
/// grows unbounded.
pub fn make_catchpoint_file_path(round: Round) -> String {
    format!(
        "{:02x}/{:02x}/{}.catchpoint",
        (round >> 8) & 0xff,
        round & 0xff,
        round
    )
}

/// Removes one catchpoint artifact, treating a missing file as success.
pub fn remove_single_catchpoint_file_from_disk(root: &Path, rel_path: &str) -> Result<()> {
    match std::fs::remove_file(root.join(rel_path)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Cooperative cancellation flag shared between the tracker and its
/// long-running operations (trie rebuild, file writing, repacking).
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Single-slot "hurry up" signal for the stage-1 writer.
///
/// While open, the writer sleeps between chunks and ramps its per-chunk
/// deadline slowly; once closed (a one-way transition) the writer switches
/// to the long deadline and stops sleeping. Closing wakes any sleeper
/// immediately.
pub struct SlowWritingSignal {
    closed: Mutex<bool>,
    cond: Condvar,
}

impl SlowWritingSignal {
    /// A fresh, open signal.
    pub fn new() -> Arc<Self> {
        Arc::new(SlowWritingSignal {
            closed: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// A signal that is already closed, for when no writer should linger.
    pub fn new_closed() -> Arc<Self> {
        let signal = Self::new();
        signal.close();
        signal
    }

    pub fn close(&self) {
        let mut closed = self.closed.lock();
        *closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Sleeps for up to `timeout`, returning early when the signal closes.
    /// Returns whether the signal is closed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return true;
        }
        self.cond.wait_for(&mut closed, timeout);
        *closed
    }
}
