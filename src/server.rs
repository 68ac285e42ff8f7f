//! Polled TCP accept glue.
//!
//! A thin convenience that turns accepted sockets into orchestrator
//! channels: bind, accept on a dedicated thread, switch each connection to
//! non-blocking, hand it to [`Orchestrator::add`]. Everything interesting
//! happens in the orchestrator; this is just the front door.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::orchestrator::Orchestrator;
use crate::stream::TcpByteStream;

/// Accept-loop poll cadence; also bounds how long `stop` can take.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A TCP listener feeding an [`Orchestrator`].
pub struct TcpServer {
    local_addr: SocketAddr,
    stopping: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Binds `addr` and starts accepting connections into `orchestrator`.
    pub fn bind(addr: impl ToSocketAddrs, orchestrator: Arc<Orchestrator>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");

        let stopping = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopping);
        let handle = thread::Builder::new()
            .name("switchyard-accept".into())
            .spawn(move || accept_loop(&listener, &orchestrator, &flag))
            .expect("failed to spawn accept thread");

        Ok(Self {
            local_addr,
            stopping,
            accept_thread: Mutex::new(Some(handle)),
        })
    }

    /// The bound address (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and joins the accept thread. Idempotent. Existing
    /// connections are untouched; close them by stopping the orchestrator.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let handle = self.accept_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, orchestrator: &Arc<Orchestrator>, stopping: &AtomicBool) {
    while !stopping.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((socket, peer)) => {
                debug!(peer = %peer, "accepted connection");
                match TcpByteStream::from_std(socket) {
                    Ok(stream) => {
                        if let Err(e) = orchestrator.add(Arc::new(stream)) {
                            warn!(peer = %peer, error = %e, "failed to register connection");
                        }
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "failed to prepare connection"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(error = %e, "accept failed; closing listener");
                break;
            }
        }
    }
}
