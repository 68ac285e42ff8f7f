//! Per-connection state machine.
//!
//! A [`Channel`] owns one client connection and walks it through the
//! request/response lifecycle:
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 ▼                                          │
//! WaitReadable ─► Read ─► Process ─► WaitWritable ─► Write ──┤ keep-alive
//!      │           │         │            │            │     │
//!      ▼           ▼         │            ▼            ▼     ▼
//! ReadTimeout   Closed       └─► Read  WriteTimeout  Closed
//! ```
//!
//! [`Channel::advance`] is the sole transition function: it performs one
//! stage's worth of work and atomically publishes the next stage before
//! returning. The wait stages park the channel on the poller; the timeout
//! stages park it on a throttler refill deadline; `Closed` is terminal and
//! can never be left.
//!
//! # Locking
//!
//! All mutable exchange state (buffers, handler, control bits) lives behind
//! one mutex — the same lock that serializes activation, so at most one
//! thread is ever inside `advance`. The stage itself is an atomic: the
//! poller callback performs the two permitted wait→work transitions under
//! the exchange lock, while the orchestrator's filtering reads it lock-free
//! (*tentative* reads — safe because stale values only delay scheduling and
//! `Closed` is sticky).

pub mod handler;
mod request;
mod response;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace};

use crate::stream::ByteStream;
use crate::sync::AtomicTime;
use crate::throttle::Throttler;

pub use handler::{ChannelFactory, Control, Handler};
pub use request::Request;
pub use response::Response;

/// Upper bound on bytes moved per read/write attempt, independent of quota.
const IO_CHUNK: usize = 16 * 1024;

/// The state a channel is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    /// Parked on the poller until the peer sends bytes.
    WaitReadable = 0,
    /// Read deferred until a throttler refills.
    ReadTimeout = 1,
    /// Bytes are (believed) available; read them.
    Read = 2,
    /// The request is complete enough to hand to the handler.
    Process = 3,
    /// Parked on the poller until the socket accepts bytes.
    WaitWritable = 4,
    /// Write deferred until a throttler refills.
    WriteTimeout = 5,
    /// The socket is (believed) writable; flush the response.
    Write = 6,
    /// Terminal. Advancing a closed channel is a no-op.
    Closed = 7,
}

impl Stage {
    fn from_u8(raw: u8) -> Stage {
        match raw {
            0 => Stage::WaitReadable,
            1 => Stage::ReadTimeout,
            2 => Stage::Read,
            3 => Stage::Process,
            4 => Stage::WaitWritable,
            5 => Stage::WriteTimeout,
            6 => Stage::Write,
            _ => Stage::Closed,
        }
    }
}

/// Dedicated-plus-master throttler pair for one direction.
#[derive(Debug)]
struct ThrottlerGroup {
    dedicated: Throttler,
    master: Arc<Throttler>,
}

impl ThrottlerGroup {
    /// Effective permitted byte count and the wakeup deadline to use when
    /// it is zero: `min` of the quotas, `max` of the fill times.
    fn permitted(&self) -> (u64, Instant) {
        let dedicated = self.dedicated.info();
        let master = self.master.info();
        (
            dedicated.current_quota.min(master.current_quota),
            dedicated.fill_time.max(master.fill_time),
        )
    }

    /// Debits both buckets by the bytes actually moved.
    fn consume(&self, n: u64) {
        self.dedicated.consume(n);
        self.master.consume(n);
    }
}

/// Mutable exchange state, serialized by the channel's one lock.
pub(crate) struct Exchange {
    handler: Box<dyn Handler>,
    request: Request,
    response: Response,
    fetching_content: bool,
    auto_fetch_content: bool,
    /// Stage a `ReadTimeout` resumes once quota is back: `Read` when
    /// readiness was already observed, `WaitReadable` when the defer
    /// happened before arming the poller.
    resume_read: Stage,
    /// Symmetric for `WriteTimeout`.
    resume_write: Stage,
}

/// One client connection's state machine.
pub struct Channel {
    id: u64,
    stream: Arc<dyn ByteStream>,
    stage: AtomicU8,
    /// Requested wakeup deadline; "never" outside the timeout stages.
    timeout: AtomicTime,
    force_close: AtomicBool,
    read_throttlers: ThrottlerGroup,
    write_throttlers: ThrottlerGroup,
    exchange: Mutex<Exchange>,
}

fn next_channel_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Channel {
    /// Creates a channel in `WaitReadable`, sharing the given master
    /// throttlers.
    pub(crate) fn new(
        stream: Arc<dyn ByteStream>,
        handler: Box<dyn Handler>,
        master_read: Arc<Throttler>,
        master_write: Arc<Throttler>,
    ) -> Self {
        let auto_fetch_content = handler.auto_fetch_content();
        Self {
            id: next_channel_id(),
            stream,
            stage: AtomicU8::new(Stage::WaitReadable as u8),
            timeout: AtomicTime::never(),
            force_close: AtomicBool::new(false),
            read_throttlers: ThrottlerGroup {
                dedicated: Throttler::unlimited(),
                master: master_read,
            },
            write_throttlers: ThrottlerGroup {
                dedicated: Throttler::unlimited(),
                master: master_write,
            },
            exchange: Mutex::new(Exchange {
                handler,
                request: Request::new(),
                response: Response::new(),
                fetching_content: false,
                auto_fetch_content,
                resume_read: Stage::Read,
                resume_write: Stage::Write,
            }),
        }
    }

    /// This channel's orchestrator-unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying stream.
    pub(crate) fn stream(&self) -> &Arc<dyn ByteStream> {
        &self.stream
    }

    /// Locks the exchange state. Holding the returned guard is what the
    /// scheduling layer calls "holding the task mutex".
    pub(crate) fn lock_exchange(&self) -> MutexGuard<'_, Exchange> {
        self.exchange.lock()
    }

    /// Lock-free stage read. May be stale; only `Closed` is authoritative,
    /// because `Closed` is sticky.
    #[must_use]
    pub fn tentative_stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    /// Authoritative stage read; the `&Exchange` witness proves the caller
    /// holds the exchange lock.
    pub(crate) fn definite_stage(&self, _exchange: &Exchange) -> Stage {
        self.tentative_stage()
    }

    /// Publishes `next`, unless the channel has been closed in the
    /// meantime — `Closed` is never overwritten.
    pub(crate) fn set_stage(&self, next: Stage) {
        let _ = self
            .stage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                if Stage::from_u8(raw) == Stage::Closed {
                    None
                } else {
                    Some(next as u8)
                }
            });
    }

    /// Transition into a non-timeout stage: the wakeup request is cleared.
    fn transition(&self, next: Stage) {
        self.timeout.store_never();
        self.set_stage(next);
    }

    /// Transition into a timeout stage with a wakeup request.
    fn defer(&self, next: Stage, wakeup: Instant) {
        self.timeout.store(wakeup);
        self.set_stage(next);
        trace!(channel = self.id, stage = ?next, "throttled; deferring");
    }

    /// Closes the channel. Idempotent, callable from any thread without the
    /// exchange lock; racing transitions lose because `Closed` wins every
    /// compare-exchange from the other side.
    pub fn close(&self) {
        self.timeout.store_never();
        self.stage.store(Stage::Closed as u8, Ordering::Release);
    }

    /// Requests a close at the next advance, without interrupting work in
    /// flight on another thread.
    pub fn request_close(&self) {
        self.force_close.store(true, Ordering::Release);
    }

    /// Replaces this channel's dedicated read throttler.
    pub fn throttle_read(&self, throttler: Throttler) {
        self.read_throttlers.dedicated.replace(throttler);
    }

    /// Replaces this channel's dedicated write throttler.
    pub fn throttle_write(&self, throttler: Throttler) {
        self.write_throttlers.dedicated.replace(throttler);
    }

    /// Whether `advance` would make forward progress right now. `Closed`
    /// counts as ready so the garbage collector gets a chance to run.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        match self.tentative_stage() {
            Stage::Read | Stage::Process | Stage::Write | Stage::Closed => true,
            Stage::ReadTimeout | Stage::WriteTimeout => Instant::now() >= self.timeout.load(),
            Stage::WaitReadable | Stage::WaitWritable => false,
        }
    }

    /// Whether the channel cannot progress until the client does something.
    /// Only these stages count against the inactivity timeout.
    #[must_use]
    pub fn is_waiting_for_client(&self) -> bool {
        matches!(
            self.tentative_stage(),
            Stage::WaitReadable | Stage::WaitWritable
        )
    }

    /// The channel's preferred wakeup deadline: a throttler refill instant
    /// in the timeout stages, far future ("never") otherwise.
    #[must_use]
    pub fn requested_timeout(&self) -> Instant {
        self.timeout.load()
    }

    pub(crate) fn has_requested_timeout(&self) -> bool {
        !self.timeout.is_never()
    }

    /// Takes the next step in the state machine.
    ///
    /// Must be called with the exchange lock held (the guard is the
    /// argument). One stage's work is performed and the resulting stage is
    /// published before returning.
    pub(crate) fn advance(&self, exchange: &mut Exchange) {
        if self.force_close.load(Ordering::Acquire) {
            debug!(channel = self.id, "closing on request");
            self.close();
            return;
        }
        match self.definite_stage(exchange) {
            Stage::Read => self.on_read(exchange),
            Stage::Process => self.on_process(exchange),
            Stage::Write => self.on_write(exchange),
            Stage::ReadTimeout => self.on_read_timeout(exchange),
            Stage::WriteTimeout => self.on_write_timeout(exchange),
            // The wait stages have nothing to do until the poller reports;
            // a closed channel has nothing to do ever again.
            Stage::WaitReadable | Stage::WaitWritable | Stage::Closed => {}
        }
    }

    /// Enters `WaitReadable`, deferring first if the read quota is dry —
    /// there is no point arming the poller for bytes we may not consume.
    fn enter_wait_readable(&self, exchange: &mut Exchange) {
        let (permitted, fill_time) = self.read_throttlers.permitted();
        if permitted == 0 {
            exchange.resume_read = Stage::WaitReadable;
            self.defer(Stage::ReadTimeout, fill_time);
        } else {
            self.transition(Stage::WaitReadable);
        }
    }

    /// Symmetric to [`Channel::enter_wait_readable`].
    fn enter_wait_writable(&self, exchange: &mut Exchange) {
        let (permitted, fill_time) = self.write_throttlers.permitted();
        if permitted == 0 {
            exchange.resume_write = Stage::WaitWritable;
            self.defer(Stage::WriteTimeout, fill_time);
        } else {
            self.transition(Stage::WaitWritable);
        }
    }

    fn on_read(&self, exchange: &mut Exchange) {
        // Content may already be buffered from the previous read; never
        // wait on the wire for bytes we already hold.
        if exchange
            .handler
            .request_complete(&exchange.request, exchange.fetching_content)
        {
            exchange.fetching_content = false;
            self.transition(Stage::Process);
            return;
        }

        let (permitted, fill_time) = self.read_throttlers.permitted();
        if permitted == 0 {
            exchange.resume_read = Stage::Read;
            self.defer(Stage::ReadTimeout, fill_time);
            return;
        }

        let max = usize::try_from(permitted).unwrap_or(usize::MAX).min(IO_CHUNK);
        match exchange.request.fill_from(self.stream.as_ref(), max) {
            Ok(0) => {
                trace!(channel = self.id, "peer closed while reading");
                self.close();
            }
            Ok(n) => {
                self.read_throttlers.consume(n as u64);
                trace!(channel = self.id, bytes = n, "read");
                if exchange
                    .handler
                    .request_complete(&exchange.request, exchange.fetching_content)
                {
                    exchange.fetching_content = false;
                    self.transition(Stage::Process);
                } else if exchange.fetching_content && !exchange.auto_fetch_content {
                    // Streaming mode: hand each slice of content to the
                    // handler as it arrives.
                    self.transition(Stage::Process);
                }
                // Otherwise stay in Read; the orchestrator reschedules us
                // immediately and the next attempt either reads more or
                // observes would-block.
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.enter_wait_readable(exchange);
            }
            Err(e) => {
                debug!(channel = self.id, error = %e, "read failed; closing");
                self.close();
            }
        }
    }

    fn on_process(&self, exchange: &mut Exchange) {
        let Exchange {
            handler,
            request,
            response,
            ..
        } = exchange;
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.process(request, response)));

        match outcome {
            Ok(Ok(Control::FetchContent)) => {
                exchange.fetching_content = true;
                self.transition(Stage::Read);
            }
            Ok(Ok(Control::RejectContent)) => {
                // Unread body bytes are left on the wire; the connection
                // cannot be reused.
                exchange.fetching_content = false;
                exchange.response.set_keep_alive(false);
                self.enter_wait_writable(exchange);
            }
            Ok(Ok(Control::SendResponse)) => {
                exchange.fetching_content = false;
                self.enter_wait_writable(exchange);
            }
            Ok(Err(e)) => {
                error!(channel = self.id, error = %e, "handler failed");
                self.send_internal_error(exchange);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(channel = self.id, panic = %message, "handler panicked");
                self.send_internal_error(exchange);
            }
        }
    }

    /// Gives the handler a chance to emit an internal-error response, then
    /// ensures the connection dies after it is flushed (or immediately if
    /// the handler has nothing to say).
    fn send_internal_error(&self, exchange: &mut Exchange) {
        exchange.response.reset();
        exchange.handler.internal_error(&mut exchange.response);
        exchange.response.set_keep_alive(false);
        if exchange.response.remaining() == 0 {
            self.close();
        } else {
            self.enter_wait_writable(exchange);
        }
    }

    fn on_write(&self, exchange: &mut Exchange) {
        if exchange.response.remaining() == 0 {
            self.finish_exchange(exchange);
            return;
        }

        let (permitted, fill_time) = self.write_throttlers.permitted();
        if permitted == 0 {
            exchange.resume_write = Stage::Write;
            self.defer(Stage::WriteTimeout, fill_time);
            return;
        }

        let max = usize::try_from(permitted)
            .unwrap_or(usize::MAX)
            .min(IO_CHUNK)
            .min(exchange.response.remaining());
        match self.stream.write(&exchange.response.pending()[..max]) {
            Ok(0) => self.enter_wait_writable(exchange),
            Ok(n) => {
                self.write_throttlers.consume(n as u64);
                exchange.response.advance(n);
                trace!(channel = self.id, bytes = n, "wrote");
                if exchange.response.remaining() == 0 {
                    self.finish_exchange(exchange);
                }
                // Otherwise stay in Write for an immediate retry.
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.enter_wait_writable(exchange);
            }
            Err(e) => {
                debug!(channel = self.id, error = %e, "write failed; closing");
                self.close();
            }
        }
    }

    /// The response is fully flushed: either loop back for the next request
    /// on this connection, or close.
    fn finish_exchange(&self, exchange: &mut Exchange) {
        if self.force_close.load(Ordering::Acquire) || !exchange.response.keep_alive() {
            trace!(channel = self.id, "exchange complete; closing");
            self.close();
            return;
        }
        trace!(channel = self.id, "exchange complete; keeping alive");
        exchange.request.reset();
        exchange.response.reset();
        exchange.fetching_content = false;
        self.enter_wait_readable(exchange);
    }

    fn on_read_timeout(&self, exchange: &mut Exchange) {
        if Instant::now() < self.timeout.load() {
            return;
        }
        let (permitted, fill_time) = self.read_throttlers.permitted();
        if permitted == 0 {
            // Still starved (another channel drained the master bucket
            // first); push the wakeup out.
            self.timeout.store(fill_time);
            return;
        }
        match exchange.resume_read {
            Stage::WaitReadable => self.enter_wait_readable(exchange),
            _ => self.transition(Stage::Read),
        }
    }

    fn on_write_timeout(&self, exchange: &mut Exchange) {
        if Instant::now() < self.timeout.load() {
            return;
        }
        let (permitted, fill_time) = self.write_throttlers.permitted();
        if permitted == 0 {
            self.timeout.store(fill_time);
            return;
        }
        match exchange.resume_write {
            Stage::WaitWritable => self.enter_wait_writable(exchange),
            _ => self.transition(Stage::Write),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("stream", &self.stream.id())
            .field("stage", &self.tentative_stage())
            .finish_non_exhaustive()
    }
}

/// Renders a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
