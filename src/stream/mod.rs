//! Non-blocking byte-stream boundary.
//!
//! The orchestrator never touches sockets directly; it schedules against the
//! [`ByteStream`] trait. A stream is identified by a process-unique
//! [`StreamId`] — the key the poller reports events under and the
//! orchestrator resolves tasks by — and optionally exposes a raw descriptor
//! so kernel-backed pollers can subscribe it.
//!
//! `Ok(0)` from [`ByteStream::read`] means end of stream; a would-block
//! condition is reported as [`io::ErrorKind::WouldBlock`], keeping the two
//! distinguishable.

pub mod lab;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

pub use lab::LabStream;

/// Process-unique identifier of a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Returns the raw numeric value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstructs an id from its raw value.
    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates the next process-unique stream id.
///
/// Ids start at 1 and never repeat within a process.
#[must_use]
pub fn next_stream_id() -> StreamId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    StreamId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A non-blocking duplex byte stream.
///
/// Implementations must be safe to share between the orchestrator, the
/// poller and a worker thread; reads and writes take `&self` and are only
/// ever issued by the single thread currently advancing the owning channel.
pub trait ByteStream: Send + Sync {
    /// Returns this stream's process-unique id.
    fn id(&self) -> StreamId;

    /// Attempts one non-blocking read. `Ok(0)` means the peer closed;
    /// `ErrorKind::WouldBlock` means no bytes are available right now.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Attempts one non-blocking write. `ErrorKind::WouldBlock` means the
    /// transmit buffer is full.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Raw descriptor for kernel pollers, when the stream has one.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// [`ByteStream`] adapter over a [`std::net::TcpStream`].
#[derive(Debug)]
pub struct TcpByteStream {
    inner: TcpStream,
    id: StreamId,
    peer: Option<SocketAddr>,
}

impl TcpByteStream {
    /// Wraps a standard TCP stream, switching it to non-blocking mode.
    pub fn from_std(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            inner: stream,
            id: next_stream_id(),
            peer,
        })
    }

    /// The remote endpoint, when known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl ByteStream for TcpByteStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.inner.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_are_unique_and_increasing() {
        let a = next_stream_id();
        let b = next_stream_id();
        assert!(b > a);
        assert_ne!(a.as_u64(), b.as_u64());
    }

    #[test]
    fn tcp_adapter_reports_would_block_when_idle() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let stream = TcpByteStream::from_std(client).expect("wrap");

        let mut buf = [0u8; 16];
        let err = stream.read(&mut buf).expect_err("nothing to read yet");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn tcp_adapter_round_trips_bytes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");

        let client = TcpByteStream::from_std(client).expect("wrap client");
        let server = TcpByteStream::from_std(server).expect("wrap server");

        let n = client.write(b"ping").expect("write");
        assert_eq!(n, 4);

        // Give loopback delivery a moment.
        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..50 {
            match server.read(&mut buf[got..]) {
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }
                Err(e) => panic!("read failed: {e}"),
            }
            if got == 4 {
                break;
            }
        }
        assert_eq!(&buf[..got], b"ping");
    }
}
