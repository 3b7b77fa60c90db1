//! Retry trigger and drain coalescing
//!
//! [`RetryTrigger`] holds at most one pending sync registration; any number
//! of `register` calls before it fires collapse into one. [`DrainGate`]
//! keeps drains from overlapping: a drain requested mid-flight becomes a
//! single re-run after the current pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Something a failed delivery can register interest with.
pub trait SyncRegistrar: Send + Sync {
    fn register(&self);
}

/// Named connectivity signal with a single pending registration.
#[derive(Debug)]
pub struct RetryTrigger {
    tag: String,
    pending: AtomicBool,
}

impl RetryTrigger {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            pending: AtomicBool::new(false),
        }
    }

    /// Signal name, e.g. `tracking-sync`
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// True if a signal with this name should fire the trigger
    pub fn matches(&self, tag: &str) -> bool {
        self.tag == tag
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Consume the pending registration, returning whether there was one.
    pub fn take_registration(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

impl SyncRegistrar for RetryTrigger {
    fn register(&self) {
        if !self.pending.swap(true, Ordering::SeqCst) {
            tracing::debug!(tag = %self.tag, "Registered sync");
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    running: bool,
    rerun: bool,
}

/// At-most-one-drain guard.
#[derive(Debug, Default)]
pub(crate) struct DrainGate {
    state: Mutex<GateState>,
}

impl DrainGate {
    fn state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a drain, or record a re-run request if one is already running.
    pub(crate) fn try_begin(&self) -> Option<DrainPermit<'_>> {
        let mut state = self.state();
        if state.running {
            state.rerun = true;
            None
        } else {
            state.running = true;
            Some(DrainPermit {
                gate: self,
                released: false,
            })
        }
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.state().running
    }
}

/// Held for the duration of a drain.
pub(crate) struct DrainPermit<'a> {
    gate: &'a DrainGate,
    released: bool,
}

impl DrainPermit<'_> {
    /// Whether another pass is owed. Releases the gate when it is not,
    /// atomically with the check so no request slips through.
    pub(crate) fn next_pass(&mut self) -> bool {
        let mut state = self.gate.state();
        if state.rerun {
            state.rerun = false;
            true
        } else {
            state.running = false;
            self.released = true;
            false
        }
    }
}

impl Drop for DrainPermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.gate.state().running = false;
        }
    }
}
