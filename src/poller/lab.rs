//! Deterministic poller for tests.
//!
//! [`LabPoller`] replaces the kernel with a script: tests inject readiness
//! per stream id, and the poller delivers it to whatever one-shot watch is
//! armed, on a dedicated delivery thread — the same threading shape as the
//! kernel-backed poller, without sockets or timing. Readiness injected
//! before a watch is armed is retained and delivered as soon as the watch
//! arrives, mirroring how registration re-evaluates kernel readiness.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::error::PollerError;
use crate::signal::Signal;
use crate::stream::{ByteStream, StreamId};
use crate::sync::WaitEvent;

use super::{EventCallback, EventSet, Poller};

#[derive(Default)]
struct LabState {
    callback: Option<EventCallback>,
    armed: HashMap<StreamId, EventSet>,
    pending: HashMap<StreamId, EventSet>,
}

struct LabInner {
    state: Mutex<LabState>,
    deliveries: SegQueue<(StreamId, EventSet)>,
    wake: WaitEvent,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    on_stop: Signal,
}

/// A poller whose readiness comes from the test, not the kernel.
pub struct LabPoller {
    inner: Arc<LabInner>,
}

impl LabPoller {
    /// Creates a stopped lab poller.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(LabInner {
                state: Mutex::new(LabState::default()),
                deliveries: SegQueue::new(),
                wake: WaitEvent::new(),
                stopping: AtomicBool::new(true),
                thread: Mutex::new(None),
                on_stop: Signal::new(),
            }),
        })
    }

    /// Injects readiness for a stream, as if the kernel had observed it.
    ///
    /// If a matching watch is armed the event is handed to the delivery
    /// thread; otherwise the readiness is retained for the next watch.
    pub fn inject(&self, id: StreamId, events: EventSet) {
        let mut state = self.inner.state.lock();
        let pending = state.pending.entry(id).or_insert(EventSet::NONE);
        *pending |= events;
        self.try_deliver(&mut state, id);
    }

    /// Returns whether a watch is currently armed for `id`.
    #[must_use]
    pub fn is_armed(&self, id: StreamId) -> bool {
        self.inner.state.lock().armed.contains_key(&id)
    }

    /// Moves a satisfiable (armed, pending) pair onto the delivery queue.
    fn try_deliver(&self, state: &mut LabState, id: StreamId) {
        let Some(&armed) = state.armed.get(&id) else {
            return;
        };
        let Some(&pending) = state.pending.get(&id) else {
            return;
        };
        if pending.intersects(armed) || pending.contains(EventSet::COMPLETION) {
            state.armed.remove(&id);
            state.pending.remove(&id);
            self.inner.deliveries.push((id, pending));
            self.inner.wake.signal();
        }
    }
}

impl Poller for LabPoller {
    fn start(&self, callback: EventCallback) -> Result<(), PollerError> {
        {
            let thread = self.inner.thread.lock();
            if thread.is_some() {
                return Err(PollerError::AlreadyRunning);
            }
        }
        {
            let mut state = self.inner.state.lock();
            state.callback = Some(callback);
            state.armed.clear();
            state.pending.clear();
        }
        while self.inner.deliveries.pop().is_some() {}
        self.inner.stopping.store(false, Ordering::Release);
        self.inner.on_stop.rearm();

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("switchyard-lab-poller".into())
            .spawn(move || deliver_loop(&inner))
            .expect("failed to spawn lab poller thread");
        *self.inner.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.wake.signal();
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.inner.on_stop.fire();
    }

    fn watch(&self, stream: &dyn ByteStream, events: EventSet) -> Result<(), PollerError> {
        let mut state = self.inner.state.lock();
        if state.callback.is_none() {
            return Err(PollerError::NotRunning);
        }
        let id = stream.id();
        state.armed.insert(id, events);
        self.try_deliver(&mut state, id);
        Ok(())
    }

    fn unwatch(&self, stream: &dyn ByteStream) {
        let mut state = self.inner.state.lock();
        state.armed.remove(&stream.id());
    }

    fn subscribe_stop(&self, hook: Box<dyn FnOnce() + Send>) {
        self.inner.on_stop.subscribe(hook);
    }
}

fn deliver_loop(inner: &LabInner) {
    loop {
        while let Some((id, events)) = inner.deliveries.pop() {
            let callback = inner.state.lock().callback.clone();
            if let Some(callback) = callback {
                callback(id, events);
            }
        }
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }
        inner
            .wake
            .wait_until_and_reset(Instant::now() + Duration::from_millis(50));
    }
    inner.state.lock().callback = None;
    inner.on_stop.fire();
}
