//! Lock-free absolute time points.
//!
//! Channels publish their preferred wakeup deadline as an atomic value so
//! the main loop can read it without taking the exchange lock. Time points
//! are stored as nanoseconds from a process-wide anchor instant; `u64::MAX`
//! is reserved as a "never" sentinel that decodes to a far-future instant,
//! which compares correctly without a separate option type.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const NEVER: u64 = u64::MAX;

/// Roughly a century; used when the sentinel cannot be represented exactly.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// An `Instant` that can be read and written atomically.
#[derive(Debug)]
pub(crate) struct AtomicTime {
    nanos: AtomicU64,
}

impl AtomicTime {
    /// Creates a time point holding the "never" sentinel.
    pub(crate) fn never() -> Self {
        Self {
            nanos: AtomicU64::new(NEVER),
        }
    }

    /// Stores an absolute time point.
    pub(crate) fn store(&self, at: Instant) {
        let nanos = at
            .saturating_duration_since(anchor())
            .as_nanos()
            .min(u128::from(NEVER - 1)) as u64;
        self.nanos.store(nanos, Ordering::Release);
    }

    /// Resets to the "never" sentinel.
    pub(crate) fn store_never(&self) {
        self.nanos.store(NEVER, Ordering::Release);
    }

    /// Loads the time point; the sentinel decodes to a far-future instant.
    pub(crate) fn load(&self) -> Instant {
        let nanos = self.nanos.load(Ordering::Acquire);
        let offset = if nanos == NEVER {
            FAR_FUTURE
        } else {
            Duration::from_nanos(nanos)
        };
        anchor()
            .checked_add(offset)
            .unwrap_or_else(|| anchor() + FAR_FUTURE)
    }

    /// Returns whether the sentinel is currently stored.
    pub(crate) fn is_never(&self) -> bool {
        self.nanos.load(Ordering::Acquire) == NEVER
    }
}
