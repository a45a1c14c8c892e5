//! Per-connection stream gate
//!
//! ```text
//! Messages --(read loop sees 0x02)--> Pending --(consumer claims)--> Consuming
//!     ^                                                                  |
//!     +------------------------(consumer releases)-----------------------+
//! ```
//!
//! An unclaimed `Pending` gate expires and closes; bytes on the connection are
//! no longer in sync once a stream was abandoned.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Messages,
    Pending,
    Consuming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateError {
    Timeout,
    Closed,
}

pub(crate) struct StreamGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl StreamGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Messages),
            cond: Condvar::new(),
        }
    }

    /// Called by the read loop after decoding a stream tag. Blocks until the
    /// stream is released, or fails if nobody claims it within `unclaimed`.
    pub(crate) fn hold(&self, unclaimed: Duration) -> Result<(), GateError> {
        let mut state = self.state.lock();
        if *state == GateState::Closed {
            return Err(GateError::Closed);
        }
        *state = GateState::Pending;
        self.cond.notify_all();

        let deadline = Instant::now() + unclaimed;
        while *state == GateState::Pending {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && *state == GateState::Pending
            {
                *state = GateState::Closed;
                self.cond.notify_all();
                return Err(GateError::Timeout);
            }
        }

        // Claimed: the consumer owns the connection until it releases
        while *state == GateState::Consuming {
            self.cond.wait(&mut state);
        }

        match *state {
            GateState::Closed => Err(GateError::Closed),
            _ => Ok(()),
        }
    }

    /// Wait for a pending stream and take it over
    pub(crate) fn claim(&self, timeout: Duration) -> Result<(), GateError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            match *state {
                GateState::Pending => {
                    *state = GateState::Consuming;
                    self.cond.notify_all();
                    return Ok(());
                }
                GateState::Closed => return Err(GateError::Closed),
                GateState::Messages | GateState::Consuming => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        match *state {
                            GateState::Pending => continue,
                            GateState::Closed => return Err(GateError::Closed),
                            _ => return Err(GateError::Timeout),
                        }
                    }
                }
            }
        }
    }

    /// Hand the connection back to the read loop
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        if *state == GateState::Consuming {
            *state = GateState::Messages;
            self.cond.notify_all();
        }
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        *state = GateState::Closed;
        self.cond.notify_all();
    }
}
