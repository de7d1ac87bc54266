//! Wakeup channel for the background daemons.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Wakeup {
    pub(crate) kicked: bool,
    pub(crate) stir: bool,
    pub(crate) shutdown: bool,
}

/// Flags plus a condition variable; one per daemon.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    state: Mutex<Wakeup>,
    condvar: Condvar,
}

impl Signal {
    pub(crate) fn kick(&self) {
        let mut state = self.state.lock();
        if !state.kicked {
            state.kicked = true;
            self.condvar.notify_all();
        }
    }

    /// Ask the reclaimer for an aggressive pass.
    pub(crate) fn stir(&self) {
        let mut state = self.state.lock();
        state.stir = true;
        state.kicked = true;
        self.condvar.notify_all();
    }

    pub(crate) fn take_stir(&self) -> bool {
        std::mem::take(&mut self.state.lock().stir)
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.condvar.notify_all();
    }

    pub(crate) fn reset(&self) {
        *self.state.lock() = Wakeup::default();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Sleep until kicked, shut down or `timeout` elapses. Consumes the kick;
    /// the stir flag stays for [`take_stir`](Self::take_stir).
    pub(crate) fn wait(&self, timeout: Duration) -> Wakeup {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.kicked && !state.shutdown {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let seen = *state;
        state.kicked = false;
        seen
    }
}
