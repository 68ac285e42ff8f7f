//! Kernel-backed poller (epoll/kqueue via mio).
//!
//! One event thread owns a `mio::Poll`; subscriptions are registered from
//! any thread through a cloned registry, keyed by the stream's raw
//! descriptor and tokenized with its [`StreamId`]. One-shot semantics are
//! implemented directly: a source is deregistered the moment its event is
//! drained, before the callback runs, so a stale edge can never fire twice.
//! Re-watching re-registers the descriptor, and the kernel re-evaluates
//! readiness at registration time, so no edge is lost across the gap.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::PollerError;
use crate::signal::Signal;
use crate::stream::{ByteStream, StreamId};

use super::{EventCallback, EventSet, Poller};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 256;

/// Registration facilities shared with watcher threads while a run is live.
struct Active {
    registry: Registry,
    waker: Arc<Waker>,
}

struct SysInner {
    active: Mutex<Option<Active>>,
    watches: Mutex<HashMap<StreamId, RawFd>>,
    stopping: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    on_stop: Signal,
}

/// A [`Poller`] backed by the operating system's readiness facility.
pub struct SysPoller {
    inner: Arc<SysInner>,
}

impl SysPoller {
    /// Creates a stopped poller; the OS handle is acquired at `start`.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SysInner {
                active: Mutex::new(None),
                watches: Mutex::new(HashMap::new()),
                stopping: AtomicBool::new(true),
                thread: Mutex::new(None),
                on_stop: Signal::new(),
            }),
        })
    }
}

fn interest_for(events: EventSet) -> Interest {
    let readable = events.contains(EventSet::READABLE);
    let writable = events.contains(EventSet::WRITABLE);
    match (readable, writable) {
        (_, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (true, true) => Interest::READABLE | Interest::WRITABLE,
    }
}

impl Poller for SysPoller {
    fn start(&self, callback: EventCallback) -> Result<(), PollerError> {
        let poll = Poll::new().map_err(PollerError::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(PollerError::Io)?);
        let registry = poll.registry().try_clone().map_err(PollerError::Io)?;

        {
            let mut active = self.inner.active.lock();
            if active.is_some() {
                return Err(PollerError::AlreadyRunning);
            }
            *active = Some(Active { registry, waker });
        }
        self.inner.watches.lock().clear();
        self.inner.stopping.store(false, Ordering::Release);
        self.inner.on_stop.rearm();

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("switchyard-poller".into())
            .spawn(move || event_loop(&inner, poll, &callback))
            .expect("failed to spawn poller thread");
        *self.inner.thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        if let Some(active) = &*self.inner.active.lock() {
            let _ = active.waker.wake();
        }
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.inner.on_stop.fire();
    }

    fn watch(&self, stream: &dyn ByteStream, events: EventSet) -> Result<(), PollerError> {
        let Some(fd) = stream.raw_fd() else {
            return Err(PollerError::NotPollable);
        };
        let id = stream.id();
        let token = Token(id.as_u64() as usize);
        let interest = interest_for(events);

        let active = self.inner.active.lock();
        let Some(active) = active.as_ref() else {
            return Err(PollerError::NotRunning);
        };

        let mut watches = self.inner.watches.lock();
        let known = watches.insert(id, fd).is_some();
        let result = if known {
            // A second watch without an intervening event replaces the
            // previous interest.
            active.registry.reregister(&mut SourceFd(&fd), token, interest)
        } else {
            match active.registry.register(&mut SourceFd(&fd), token, interest) {
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => active
                    .registry
                    .reregister(&mut SourceFd(&fd), token, interest),
                other => other,
            }
        };

        if let Err(e) = result {
            watches.remove(&id);
            return Err(PollerError::Io(e));
        }
        trace!(stream = %id, events = %events, "armed poll subscription");
        Ok(())
    }

    fn unwatch(&self, stream: &dyn ByteStream) {
        let active = self.inner.active.lock();
        let removed = self.inner.watches.lock().remove(&stream.id());
        if let (Some(active), Some(fd)) = (active.as_ref(), removed) {
            let _ = active.registry.deregister(&mut SourceFd(&fd));
        }
    }

    fn subscribe_stop(&self, hook: Box<dyn FnOnce() + Send>) {
        self.inner.on_stop.subscribe(hook);
    }
}

fn event_loop(inner: &SysInner, mut poll: Poll, callback: &EventCallback) {
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    loop {
        if inner.stopping.load(Ordering::Acquire) {
            break;
        }
        // The waker interrupts this wait; the timeout is a safety net in
        // case the wake itself fails.
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(500))) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "poller wait failed");
            break;
        }
        for event in &events {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let id = StreamId::from_u64(event.token().0 as u64);

            let mut set = EventSet::NONE;
            if event.is_readable() {
                set |= EventSet::READABLE;
            }
            if event.is_writable() {
                set |= EventSet::WRITABLE;
            }
            if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
                set |= EventSet::COMPLETION;
            }

            // Consume the one-shot subscription before delivery.
            let fd = inner.watches.lock().remove(&id);
            let Some(fd) = fd else {
                // Raced with unwatch; the subscription is gone.
                continue;
            };
            let _ = poll.registry().deregister(&mut SourceFd(&fd));

            if set.is_empty() {
                // The kernel woke us without a recognizable condition;
                // report readability so the channel re-tries and observes
                // the stream state itself.
                set = EventSet::READABLE;
            }
            trace!(stream = %id, events = %set, "delivering poll event");
            callback(id, set);
        }
    }
    *inner.active.lock() = None;
    inner.on_stop.fire();
}
