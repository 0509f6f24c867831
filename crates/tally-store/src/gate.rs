//! Access gate: holds ordinary work back while the schema is being patched.
//!
//! The gate owns the database state. Callers that are not operation-critical
//! park on a condition variable while the state is [`DbState::Patching`];
//! any thread may move the state, and every transition wakes all parked
//! callers, which then re-check the state for themselves.

use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::{
    error::{Result, StoreError},
    state::DbState,
};

/// Broadcast gate guarding ordinary queries and transactions.
#[derive(Debug)]
pub struct AccessGate {
    state: Mutex<DbState>,
    changed: Condvar,
    timeout: Duration,
}

impl AccessGate {
    /// Creates a gate in the [`DbState::Closed`] state whose waits give up
    /// after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(DbState::Closed),
            changed: Condvar::new(),
            timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> DbState {
        *self.state.lock()
    }

    /// Moves from `from` to `to` if the state is still `from`.
    ///
    /// Returns `false` when the state had already changed or the edge is not
    /// a legal transition.
    pub fn transition(&self, from: DbState, to: DbState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        debug!("Database state {from} -> {to}");
        self.changed.notify_all();
        true
    }

    /// Moves to [`DbState::Closed`] from whatever state the gate is in.
    ///
    /// Used when a fatal failure leaves no orderly path to `Closed`.
    pub fn force_closed(&self) -> DbState {
        let mut state = self.state.lock();
        let previous = *state;
        *state = DbState::Closed;
        if previous != DbState::Closed {
            debug!("Database state {previous} -> closed (forced)");
        }
        self.changed.notify_all();
        previous
    }

    /// Blocks until ordinary work may proceed.
    ///
    /// Operation-critical work passes immediately in any state. Other work
    /// waits while the state is `Patching` and fails with
    /// [`StoreError::Unavailable`] when the database is closed or closing, or
    /// when the wait outlasts the gate timeout.
    pub fn await_access(&self, operation_critical: bool) -> Result<()> {
        if operation_critical {
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            match *state {
                DbState::Open => return Ok(()),
                DbState::Closed | DbState::Closing => {
                    return Err(StoreError::Unavailable { state: *state })
                }
                DbState::Patching => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && *state == DbState::Patching
                    {
                        return Err(StoreError::Unavailable { state: *state });
                    }
                }
            }
        }
    }
}
