//! One-shot stop signal.
//!
//! The orchestrator and the poller each expose an "on stop" hook point that
//! fires exactly once per run, no matter how many places race to trigger the
//! shutdown. [`Signal`] is that primitive: subscribers registered before the
//! fire run at fire time, subscribers registered after it run immediately,
//! and a finished signal can be re-armed for the next run.

use parking_lot::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SignalState {
    fired: bool,
    hooks: Vec<Hook>,
}

/// A multi-subscriber signal that fires at most once per arming.
#[derive(Default)]
pub struct Signal {
    state: Mutex<SignalState>,
}

impl Signal {
    /// Creates a new, armed signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook to run when the signal fires.
    ///
    /// If the signal has already fired, the hook runs immediately on the
    /// calling thread.
    pub fn subscribe(&self, hook: Hook) {
        let mut state = self.state.lock();
        if state.fired {
            drop(state);
            hook();
        } else {
            state.hooks.push(hook);
        }
    }

    /// Fires the signal, running all registered hooks on the calling thread.
    ///
    /// Only the first call per arming runs hooks; later calls are no-ops.
    pub fn fire(&self) {
        let hooks = {
            let mut state = self.state.lock();
            if state.fired {
                return;
            }
            state.fired = true;
            std::mem::take(&mut state.hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    /// Returns whether the signal has fired since it was last armed.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.state.lock().fired
    }

    /// Re-arms a fired signal so it can fire again; drops any hooks that
    /// were registered but never fired.
    pub fn rearm(&self) {
        let mut state = self.state.lock();
        state.fired = false;
        state.hooks.clear();
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Signal")
            .field("fired", &state.fired)
            .field("hooks", &state.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fire_runs_hooks_exactly_once() {
        let signal = Signal::new();
        let count = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&count);
        signal.subscribe(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));

        signal.fire();
        signal.fire();
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(signal.has_fired());
    }

    #[test]
    fn subscribe_after_fire_runs_immediately() {
        let signal = Signal::new();
        signal.fire();

        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        signal.subscribe(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rearm_allows_a_second_fire() {
        let signal = Signal::new();
        let count = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&count);
        signal.subscribe(Box::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }));
        signal.fire();

        signal.rearm();
        assert!(!signal.has_fired());

        let c = Arc::clone(&count);
        signal.subscribe(Box::new(move || {
            c.fetch_add(10, Ordering::Relaxed);
        }));
        signal.fire();
        assert_eq!(count.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn multiple_subscribers_all_run() {
        let signal = Signal::new();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&count);
            signal.subscribe(Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }));
        }
        signal.fire();
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }
}
