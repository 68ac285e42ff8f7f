//! Manual-reset wait event.
//!
//! A [`WaitEvent`] is the one thing the orchestrator's main thread ever
//! blocks on: a latched signal that any other thread can set, combined with
//! an absolute-deadline wait. The latch is *manual reset* — once signalled it
//! stays signalled until a consumer resets it, so a signal raised while no
//! one is waiting is never lost.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A manual-reset signal a thread can wait on with a deadline.
///
/// Spurious condition-variable wakeups are absorbed internally; every wait
/// method only reports `true` when the event was actually signalled.
#[derive(Debug, Default)]
pub struct WaitEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl WaitEvent {
    /// Creates a new event in the unsignalled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latches the signal and wakes all current waiters.
    pub fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        drop(signalled);
        self.cond.notify_all();
    }

    /// Clears the latch.
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    /// Returns whether the event is currently signalled, without waiting and
    /// without consuming the latch.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        *self.signalled.lock()
    }

    /// Blocks until the event is signalled. Does not consume the latch.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.cond.wait(&mut signalled);
        }
    }

    /// Blocks until the event is signalled or `deadline` passes.
    ///
    /// Returns `true` iff the event was signalled. Does not consume the
    /// latch.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                return *signalled;
            }
        }
        true
    }

    /// Blocks until the event is signalled or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Blocks until the event is signalled or `deadline` passes, consuming
    /// the latch on success.
    ///
    /// Returns `true` iff the event was signalled before the deadline.
    pub fn wait_until_and_reset(&self, deadline: Instant) -> bool {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                break;
            }
        }
        if *signalled {
            *signalled = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_before_wait_is_not_lost() {
        let event = WaitEvent::new();
        event.signal();
        assert!(event.try_wait());
        assert!(event.wait_until_and_reset(Instant::now()));
    }

    #[test]
    fn wait_until_times_out_when_unsignalled() {
        let event = WaitEvent::new();
        let start = Instant::now();
        let signalled = event.wait_until_and_reset(start + Duration::from_millis(30));
        assert!(!signalled);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_until_and_reset_consumes_the_latch() {
        let event = WaitEvent::new();
        event.signal();
        assert!(event.wait_until_and_reset(Instant::now() + Duration::from_millis(10)));
        // Second wait sees a cleared latch and must time out.
        assert!(!event.wait_until_and_reset(Instant::now() + Duration::from_millis(10)));
    }

    #[test]
    fn reset_clears_a_pending_signal() {
        let event = WaitEvent::new();
        event.signal();
        event.reset();
        assert!(!event.try_wait());
    }

    #[test]
    fn cross_thread_signal_wakes_waiter() {
        let event = Arc::new(WaitEvent::new());
        let signaller = Arc::clone(&event);
        let waiter = thread::spawn(move || {
            event.wait_until_and_reset(Instant::now() + Duration::from_secs(5))
        });
        thread::sleep(Duration::from_millis(20));
        signaller.signal();
        assert!(waiter.join().expect("waiter panicked"));
    }

    #[test]
    fn plain_wait_does_not_consume() {
        let event = WaitEvent::new();
        event.signal();
        event.wait();
        assert!(event.try_wait());
    }
}
