//! Outbound response buffer.

/// The bytes of one response, drained to the wire across possibly many
/// write stages.
#[derive(Debug)]
pub struct Response {
    buf: Vec<u8>,
    written: usize,
    keep_alive: bool,
}

impl Response {
    /// Creates an empty, keep-alive response.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            written: 0,
            keep_alive: true,
        }
    }

    /// Replaces the response body.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.buf = body.into();
        self.written = 0;
    }

    /// Appends bytes to the body.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The bytes not yet flushed to the stream.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.written..]
    }

    /// Number of bytes not yet flushed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.written
    }

    /// Marks `n` bytes as flushed.
    pub(crate) fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.buf.len());
    }

    /// Whether the connection should be reused after this response.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Sets whether the connection should be reused after this response.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Clears the response for the next exchange; keep-alive returns to its
    /// default of `true`.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.written = 0;
        self.keep_alive = true;
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}
