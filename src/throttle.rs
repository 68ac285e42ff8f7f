//! Leaky-bucket byte-rate throttling.
//!
//! A [`Throttler`] holds a byte quota that refills continuously over time:
//! the quota at time *t* is `min(capacity, base + (t - basis) * rate)`, where
//! the rate is expressed as `capacity` bytes per refill window. Channels
//! consult throttlers before every read and write; when the effective quota
//! is zero they defer themselves with a wakeup at the bucket's fill time
//! instead of blocking a worker.
//!
//! Two throttlers govern each direction of a channel: a *dedicated* bucket
//! owned by the channel, and a *master* bucket shared by every channel of
//! the orchestrator. The effective permitted byte count is the minimum of
//! the two quotas, and both are drained by the bytes actually moved.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A point-in-time snapshot of a throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlerInfo {
    /// Bytes that may be consumed right now.
    pub current_quota: u64,
    /// Maximum quota the bucket can hold.
    pub capacity: u64,
    /// Whether the bucket is full (`current_quota == capacity`).
    pub full: bool,
    /// Absolute instant at which, at the current fill rate, the bucket will
    /// be full again. Equal to the snapshot time when already full.
    pub fill_time: Instant,
}

#[derive(Debug, Clone, Copy)]
struct ThrottlerState {
    capacity: u64,
    /// Refill window: `capacity` bytes accrue per `window`. A zero window
    /// means unthrottled.
    window: Duration,
    /// Quota as of `basis`.
    quota: u64,
    basis: Instant,
}

impl ThrottlerState {
    fn quota_at(&self, now: Instant) -> u64 {
        if self.window.is_zero() {
            return self.capacity;
        }
        let elapsed = now.saturating_duration_since(self.basis).as_nanos();
        let refill = elapsed.saturating_mul(u128::from(self.capacity)) / self.window.as_nanos();
        let total = u128::from(self.quota).saturating_add(refill);
        total.min(u128::from(self.capacity)) as u64
    }

    fn fill_time(&self, now: Instant) -> Instant {
        if self.window.is_zero() {
            return now;
        }
        let current = self.quota_at(now);
        if current >= self.capacity {
            return now;
        }
        let deficit = u128::from(self.capacity - current);
        let nanos = deficit
            .saturating_mul(self.window.as_nanos())
            .div_ceil(u128::from(self.capacity));
        let nanos = u64::try_from(nanos).unwrap_or(u64::MAX);
        now.checked_add(Duration::from_nanos(nanos))
            .unwrap_or_else(|| now + Duration::from_secs(u32::MAX.into()))
    }
}

/// A leaky-bucket byte-rate limiter.
///
/// Internally thread-safe; masters are shared between channels behind an
/// [`Arc`](std::sync::Arc) and replaced in place via [`Throttler::replace`]
/// so every holder observes the new rate.
#[derive(Debug)]
pub struct Throttler {
    state: Mutex<ThrottlerState>,
}

impl Throttler {
    /// Creates a throttler allowing `capacity` bytes per `window`, starting
    /// with a full bucket.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero while `window` is non-zero: such a
    /// bucket could never permit any byte.
    #[must_use]
    pub fn new(capacity: u64, window: Duration) -> Self {
        assert!(
            capacity > 0 || window.is_zero(),
            "throttler capacity must be non-zero"
        );
        Self {
            state: Mutex::new(ThrottlerState {
                capacity,
                window,
                quota: capacity,
                basis: Instant::now(),
            }),
        }
    }

    /// Creates an unthrottled throttler: effectively infinite capacity,
    /// always full.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            state: Mutex::new(ThrottlerState {
                capacity: u64::MAX,
                window: Duration::ZERO,
                quota: u64::MAX,
                basis: Instant::now(),
            }),
        }
    }

    /// Takes a snapshot of the current quota, capacity and fill time.
    #[must_use]
    pub fn info(&self) -> ThrottlerInfo {
        let state = self.state.lock();
        let now = Instant::now();
        let current_quota = state.quota_at(now);
        ThrottlerInfo {
            current_quota,
            capacity: state.capacity,
            full: current_quota == state.capacity,
            fill_time: state.fill_time(now),
        }
    }

    /// Consumes `n` bytes of quota.
    ///
    /// Callers should have observed at least `n` bytes of quota. The debit
    /// saturates at zero: two channels racing on a shared master may
    /// briefly overshoot the rate, never underflow it.
    pub fn consume(&self, n: u64) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let current = state.quota_at(now);
        state.quota = current.saturating_sub(n);
        state.basis = now;
    }

    /// Replaces this throttler's configuration and state with `other`'s.
    ///
    /// Used to swap a master throttler shared by all live and future
    /// channels.
    pub fn replace(&self, other: Throttler) {
        *self.state.lock() = other.state.into_inner();
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn starts_full() {
        let throttler = Throttler::new(1024, Duration::from_secs(1));
        let info = throttler.info();
        assert_eq!(info.current_quota, 1024);
        assert_eq!(info.capacity, 1024);
        assert!(info.full);
    }

    #[test]
    fn unlimited_is_always_full() {
        let throttler = Throttler::unlimited();
        throttler.consume(1 << 40);
        let info = throttler.info();
        assert_eq!(info.current_quota, u64::MAX);
        assert!(info.full);
        assert!(info.fill_time <= Instant::now());
    }

    #[test]
    fn consume_reduces_quota() {
        let throttler = Throttler::new(1000, Duration::from_secs(3600));
        throttler.consume(400);
        let info = throttler.info();
        assert!(info.current_quota >= 600 && info.current_quota < 700);
        assert!(!info.full);
    }

    #[test]
    fn refills_over_time() {
        // 1000 bytes per 100ms; drain fully, then wait half a window.
        let throttler = Throttler::new(1000, Duration::from_millis(100));
        throttler.consume(1000);
        assert_eq!(throttler.info().current_quota, 0);

        thread::sleep(Duration::from_millis(50));
        let quota = throttler.info().current_quota;
        assert!(quota >= 400, "expected ~500 after half a window, got {quota}");
        assert!(quota <= 1000);
    }

    #[test]
    fn quota_is_capped_at_capacity() {
        let throttler = Throttler::new(100, Duration::from_millis(10));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(throttler.info().current_quota, 100);
    }

    #[test]
    fn fill_time_reflects_the_deficit() {
        let throttler = Throttler::new(1000, Duration::from_millis(200));
        throttler.consume(1000);
        let info = throttler.info();
        let eta = info.fill_time - Instant::now();
        assert!(eta > Duration::from_millis(150), "eta {eta:?}");
        assert!(eta <= Duration::from_millis(210), "eta {eta:?}");
    }

    #[test]
    fn fill_time_of_full_bucket_is_now() {
        let throttler = Throttler::new(64, Duration::from_secs(1));
        assert!(throttler.info().fill_time <= Instant::now());
    }

    #[test]
    fn replace_swaps_rate_in_place() {
        let throttler = Throttler::unlimited();
        throttler.replace(Throttler::new(512, Duration::from_secs(1)));
        let info = throttler.info();
        assert_eq!(info.capacity, 512);
        assert_eq!(info.current_quota, 512);
    }

    #[test]
    fn partial_consume_then_refill_converges_to_full() {
        let throttler = Throttler::new(100, Duration::from_millis(50));
        throttler.consume(60);
        thread::sleep(Duration::from_millis(60));
        let info = throttler.info();
        assert!(info.full);
        assert_eq!(info.current_quota, 100);
    }
}
