//! Offline-resilient event delivery
//!
//! ## Architecture
//!
//! ```text
//! submit ─► Transport ─► 2xx: done
//!               │
//!               └─ error ─► EventQueue::enqueue ─► RetryTrigger::register
//!
//! trigger fires ─► drain ─► list oldest-first ─► resend one at a time
//!                              │                    ├─ ok: remove, next
//!                              │                    └─ error: stop
//!                              └─► aging sweep (always)
//! ```
//!
//! Failures never escape `submit` or `drain`; they are logged and reflected
//! in the returned value.

mod pipeline;
mod transport;
mod trigger;

pub use pipeline::DeliveryPipeline;
pub use transport::{HttpTransport, Transport};
pub use trigger::{RetryTrigger, SyncRegistrar};

use crate::types::RecordId;

/// Outcome of a `drain` call, summed over every pass it ran.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Passes run (0 when the call was coalesced into an in-flight drain)
    pub passes: usize,
    /// Records resent and removed
    pub resent: usize,
    /// Record whose resend failed and stopped the last pass
    pub stopped_at: Option<RecordId>,
    /// Records removed by the aging sweep
    pub aged_out: usize,
    /// Records still queued after the last pass
    pub remaining: usize,
}

impl DrainReport {
    /// True when this call only flagged a re-run of an in-flight drain
    pub fn coalesced(&self) -> bool {
        self.passes == 0
    }

    fn absorb(&mut self, pass: DrainReport) {
        self.passes += pass.passes;
        self.resent += pass.resent;
        self.aged_out += pass.aged_out;
        self.stopped_at = pass.stopped_at;
        self.remaining = pass.remaining;
    }
}

/// Delivery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Events delivered on first attempt
    pub delivered: usize,
    /// Events persisted after a failed first attempt
    pub queued: usize,
    /// Events lost because the queue could not take them
    pub dropped: usize,
    /// Queued events delivered by a drain
    pub resent: usize,
    /// Queued events removed by the aging sweep
    pub aged_out: usize,
    /// Drain passes run
    pub drain_passes: usize,
}
