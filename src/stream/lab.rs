//! Scripted in-memory stream for deterministic tests.
//!
//! A [`LabStream`] plays the role of one server-side connection: tests push
//! the bytes "the peer sent", flip would-block and EOF conditions at will,
//! and inspect everything the channel wrote back. No sockets, no timing.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{next_stream_id, ByteStream, StreamId};

#[derive(Debug, Default)]
struct LabState {
    /// Bytes available to `read` (what the peer has sent so far).
    incoming: VecDeque<u8>,
    /// Peer closed its write side; `read` returns `Ok(0)` once drained.
    eof: bool,
    /// Everything written through the stream, in order.
    outgoing: Vec<u8>,
    /// Simulates a full transmit buffer.
    write_blocked: bool,
    /// Per-call cap on accepted bytes, to exercise partial writes.
    write_limit: Option<usize>,
}

/// An in-memory [`ByteStream`] with scriptable readiness.
#[derive(Debug)]
pub struct LabStream {
    id: StreamId,
    state: Mutex<LabState>,
}

impl LabStream {
    /// Creates an empty stream: reads would-block, writes are accepted.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_stream_id(),
            state: Mutex::new(LabState::default()),
        })
    }

    /// Appends bytes to the incoming side, as if the peer had sent them.
    pub fn push_incoming(&self, bytes: &[u8]) {
        self.state.lock().incoming.extend(bytes);
    }

    /// Marks the peer's write side closed; once the incoming bytes drain,
    /// `read` reports EOF.
    pub fn set_eof(&self) {
        self.state.lock().eof = true;
    }

    /// Blocks or unblocks writes.
    pub fn set_write_blocked(&self, blocked: bool) {
        self.state.lock().write_blocked = blocked;
    }

    /// Caps the bytes accepted per write call; `None` removes the cap.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.lock().write_limit = limit;
    }

    /// Returns a copy of everything written so far.
    #[must_use]
    pub fn output(&self) -> Vec<u8> {
        self.state.lock().outgoing.clone()
    }

    /// Takes everything written so far, clearing the capture.
    #[must_use]
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().outgoing)
    }

    /// Bytes still pending on the incoming side.
    #[must_use]
    pub fn pending_incoming(&self) -> usize {
        self.state.lock().incoming.len()
    }
}

impl ByteStream for LabStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.incoming.is_empty() {
            if state.eof {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.incoming.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.incoming.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.write_blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = state.write_limit.map_or(buf.len(), |cap| cap.min(buf.len()));
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.outgoing.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}
