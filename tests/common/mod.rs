#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use switchyard::poller::LabPoller;
use switchyard::sync::WaitEvent;
use switchyard::{
    ByteStream, ChannelFactory, Control, Handler, HandlerError, Orchestrator, Request, Response,
    StartHandle,
};

static INIT_LOGGING: Once = Once::new();

/// Installs a tracing subscriber once per test binary; controlled by
/// `RUST_LOG`.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Polls `pred` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    pred()
}

/// Builds and starts an orchestrator scheduled against a lab poller.
pub fn start_lab(
    factory: Arc<dyn ChannelFactory>,
    threads: usize,
    inactivity: Duration,
) -> (Arc<Orchestrator>, Arc<LabPoller>, StartHandle) {
    init_logging();
    let poller = LabPoller::new();
    let orchestrator = Orchestrator::builder(factory)
        .threads(threads)
        .inactivity_timeout(inactivity)
        .poller(Arc::clone(&poller) as Arc<dyn switchyard::Poller>)
        .build()
        .expect("build orchestrator");
    let handle = orchestrator.start().expect("start orchestrator");
    (orchestrator, poller, handle)
}

/// Line-oriented echo: a request is complete at the first newline and the
/// response repeats it verbatim.
pub struct EchoFactory {
    pub keep_alive: bool,
}

impl ChannelFactory for EchoFactory {
    fn create_handler(&self, _stream: &dyn ByteStream) -> Box<dyn Handler> {
        Box::new(EchoHandler {
            keep_alive: self.keep_alive,
        })
    }
}

struct EchoHandler {
    keep_alive: bool,
}

impl Handler for EchoHandler {
    fn request_complete(&mut self, request: &Request, _fetching_content: bool) -> bool {
        request.as_slice().contains(&b'\n')
    }

    fn process(
        &mut self,
        request: &mut Request,
        response: &mut Response,
    ) -> Result<Control, HandlerError> {
        response.set_body(request.as_slice().to_vec());
        response.set_keep_alive(self.keep_alive);
        Ok(Control::SendResponse)
    }
}

/// Fixed-size requests: complete once `threshold` bytes have arrived; every
/// completeness check is recorded with its timestamp and buffer size.
pub struct SizedFactory {
    pub threshold: usize,
    pub response: Vec<u8>,
    pub observations: Arc<Mutex<Vec<(Instant, usize)>>>,
}

impl SizedFactory {
    pub fn new(threshold: usize, response: &[u8]) -> Self {
        Self {
            threshold,
            response: response.to_vec(),
            observations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The first instant at which the request buffer was observed at or
    /// past `len` bytes.
    pub fn first_seen_at(&self, len: usize) -> Option<Instant> {
        self.observations
            .lock()
            .iter()
            .find(|(_, observed)| *observed >= len)
            .map(|(at, _)| *at)
    }
}

impl ChannelFactory for SizedFactory {
    fn create_handler(&self, _stream: &dyn ByteStream) -> Box<dyn Handler> {
        Box::new(SizedHandler {
            threshold: self.threshold,
            response: self.response.clone(),
            observations: Arc::clone(&self.observations),
        })
    }
}

struct SizedHandler {
    threshold: usize,
    response: Vec<u8>,
    observations: Arc<Mutex<Vec<(Instant, usize)>>>,
}

impl Handler for SizedHandler {
    fn request_complete(&mut self, request: &Request, _fetching_content: bool) -> bool {
        self.observations
            .lock()
            .push((Instant::now(), request.len()));
        request.len() >= self.threshold
    }

    fn process(
        &mut self,
        _request: &mut Request,
        response: &mut Response,
    ) -> Result<Control, HandlerError> {
        response.set_body(self.response.clone());
        response.set_keep_alive(false);
        Ok(Control::SendResponse)
    }
}

/// Handlers whose `process` blocks until the shared gate is released;
/// `started` counts how many have entered.
pub struct GateFactory {
    pub started: Arc<AtomicUsize>,
    pub release: Arc<WaitEvent>,
}

impl GateFactory {
    pub fn new() -> Self {
        Self {
            started: Arc::new(AtomicUsize::new(0)),
            release: Arc::new(WaitEvent::new()),
        }
    }
}

impl Default for GateFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFactory for GateFactory {
    fn create_handler(&self, _stream: &dyn ByteStream) -> Box<dyn Handler> {
        Box::new(GateHandler {
            started: Arc::clone(&self.started),
            release: Arc::clone(&self.release),
        })
    }
}

struct GateHandler {
    started: Arc<AtomicUsize>,
    release: Arc<WaitEvent>,
}

impl Handler for GateHandler {
    fn request_complete(&mut self, request: &Request, _fetching_content: bool) -> bool {
        !request.is_empty()
    }

    fn process(
        &mut self,
        _request: &mut Request,
        response: &mut Response,
    ) -> Result<Control, HandlerError> {
        self.started
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.release.wait();
        response.set_body(b"done\n".to_vec());
        response.set_keep_alive(false);
        Ok(Control::SendResponse)
    }
}

/// Handlers whose `process` rendezvouses on a barrier — completion proves
/// the activations overlapped in time.
pub struct BarrierFactory {
    pub barrier: Arc<Barrier>,
}

impl BarrierFactory {
    pub fn new(parties: usize) -> Self {
        Self {
            barrier: Arc::new(Barrier::new(parties)),
        }
    }
}

impl ChannelFactory for BarrierFactory {
    fn create_handler(&self, _stream: &dyn ByteStream) -> Box<dyn Handler> {
        Box::new(BarrierHandler {
            barrier: Arc::clone(&self.barrier),
        })
    }
}

struct BarrierHandler {
    barrier: Arc<Barrier>,
}

impl Handler for BarrierHandler {
    fn request_complete(&mut self, request: &Request, _fetching_content: bool) -> bool {
        !request.is_empty()
    }

    fn process(
        &mut self,
        _request: &mut Request,
        response: &mut Response,
    ) -> Result<Control, HandlerError> {
        self.barrier.wait();
        response.set_body(b"ok\n".to_vec());
        response.set_keep_alive(false);
        Ok(Control::SendResponse)
    }
}
