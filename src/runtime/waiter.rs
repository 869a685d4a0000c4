//! One-shot synchronization between the main thread and the loop.
//!
//! A [`Waiter`] wraps a one-shot event with a timeout and an abort flag.
//! The loop signals `done` (or a signal handler signals `abort`) while
//! the main thread blocks in `wait`. State resets after every wait so a
//! waiter can gate both the start and a later restart of the same phase.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::HiveError;

#[derive(Default)]
struct WaiterState {
    done: bool,
    aborted: bool,
}

/// One-shot event with a timeout and an abort flag.
pub struct Waiter {
    timeout: Duration,
    state: Mutex<WaiterState>,
    cond: Condvar,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Waiter {
    /// Create a waiter with the given wait timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(WaiterState::default()),
            cond: Condvar::new(),
        }
    }

    /// Signal success. Wakes a blocked `wait`.
    pub fn done(&self) {
        let mut state = self.state.lock().expect("waiter mutex poisoned");
        state.done = true;
        self.cond.notify_all();
    }

    /// Signal cancellation. Wakes a blocked `wait` with [`HiveError::Aborted`].
    pub fn abort(&self) {
        let mut state = self.state.lock().expect("waiter mutex poisoned");
        state.aborted = true;
        self.cond.notify_all();
    }

    /// Block until `done`, `abort`, or the timeout.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` on timeout, and
    /// `Err(Aborted)` on abort. State resets before returning.
    pub fn wait(&self) -> Result<bool, HiveError> {
        let guard = self.state.lock().expect("waiter mutex poisoned");
        let (mut guard, _timed_out) = self
            .cond
            .wait_timeout_while(guard, self.timeout, |s| !s.done && !s.aborted)
            .expect("waiter mutex poisoned");

        let result = if guard.aborted {
            Err(HiveError::Aborted)
        } else {
            Ok(guard.done)
        };

        guard.done = false;
        guard.aborted = false;
        result
    }

    /// Like `wait`, but converts timeout and abort into a fatal error.
    ///
    /// Timeouts log `msg` at error level; aborts log at info level. Both
    /// come back as [`HiveError::SystemTerminate`] for the main thread to
    /// act on.
    pub fn wait_or_terminate(&self, msg: &str) -> Result<(), HiveError> {
        match self.wait() {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::error!("{msg}");
                Err(HiveError::SystemTerminate(msg.to_string()))
            }
            Err(_) => {
                log::info!("waiter aborted");
                Err(HiveError::SystemTerminate(msg.to_string()))
            }
        }
    }
}
