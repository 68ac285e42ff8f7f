//! Readiness-notification boundary.
//!
//! The orchestrator subscribes streams for readiness one event at a time:
//! a [`Poller::watch`] call is a *one-shot* subscription whose callback
//! fires at most once, after which the stream must be re-watched. This
//! keeps the contract identical across backends — the kernel-backed
//! [`SysPoller`] deregisters a source before delivering its event, and the
//! deterministic [`LabPoller`] consumes the armed watch on delivery.
//!
//! Callbacks are invoked on a thread owned by the poller, never on the
//! caller of `watch`.

pub mod lab;
#[cfg(unix)]
pub mod sys;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::error::PollerError;
use crate::stream::{ByteStream, StreamId};

pub use lab::LabPoller;
#[cfg(unix)]
pub use sys::SysPoller;

/// Bit set of readiness conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventSet(u8);

impl EventSet {
    /// The empty set.
    pub const NONE: EventSet = EventSet(0);
    /// The stream has bytes to read.
    pub const READABLE: EventSet = EventSet(1 << 0);
    /// The stream can accept bytes.
    pub const WRITABLE: EventSet = EventSet(1 << 1);
    /// The peer hung up or the stream failed; no further I/O is useful.
    pub const COMPLETION: EventSet = EventSet(1 << 2);

    /// Returns whether every bit of `other` is set in `self`.
    #[must_use]
    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether any bit of `other` is set in `self`.
    #[must_use]
    pub fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns whether no bits are set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (bit, name) in [
            (EventSet::READABLE, "readable"),
            (EventSet::WRITABLE, "writable"),
            (EventSet::COMPLETION, "completion"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Callback invoked by the poller with the stream's id and the readiness
/// conditions observed. The mask always includes at least one requested bit
/// or [`EventSet::COMPLETION`].
pub type EventCallback = Arc<dyn Fn(StreamId, EventSet) + Send + Sync>;

/// A readiness poller with one-shot subscriptions.
pub trait Poller: Send + Sync {
    /// Starts the poller's event thread, delivering events to `callback`.
    fn start(&self, callback: EventCallback) -> Result<(), PollerError>;

    /// Signals shutdown and joins the event thread. Idempotent; the stop
    /// hooks fire exactly once per run whether the poller stopped on request
    /// or died on its own.
    fn stop(&self);

    /// Arms a one-shot subscription for `events` (plus hangup, which is
    /// always reported) on `stream`.
    fn watch(&self, stream: &dyn ByteStream, events: EventSet) -> Result<(), PollerError>;

    /// Best-effort removal of a subscription; unknown streams are ignored.
    fn unwatch(&self, stream: &dyn ByteStream);

    /// Registers a hook to run when the poller terminates for any reason.
    fn subscribe_stop(&self, hook: Box<dyn FnOnce() + Send>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_set_bit_operations() {
        let set = EventSet::READABLE | EventSet::COMPLETION;
        assert!(set.contains(EventSet::READABLE));
        assert!(set.contains(EventSet::COMPLETION));
        assert!(!set.contains(EventSet::WRITABLE));
        assert!(set.intersects(EventSet::READABLE | EventSet::WRITABLE));
        assert!(!EventSet::NONE.intersects(set));
    }

    #[test]
    fn event_set_displays_named_bits() {
        assert_eq!(EventSet::NONE.to_string(), "none");
        assert_eq!(EventSet::READABLE.to_string(), "readable");
        assert_eq!(
            (EventSet::READABLE | EventSet::WRITABLE | EventSet::COMPLETION).to_string(),
            "readable|writable|completion"
        );
    }
}
