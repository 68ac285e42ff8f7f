//! Application boundary of a channel.
//!
//! The core never parses protocol bytes. Everything protocol-shaped lives
//! behind [`Handler`]: deciding when the buffered request is complete,
//! turning a complete request into a response, and (optionally) rendering an
//! internal-error response when processing fails. A [`ChannelFactory`]
//! builds one handler per accepted connection.

use crate::error::HandlerError;
use crate::stream::ByteStream;

use super::request::Request;
use super::response::Response;
use super::Channel;

/// Directive returned by [`Handler::process`], steering the channel's next
/// stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// More request body is expected; return to reading.
    FetchContent,
    /// Skip the remaining body and send the prepared response. Because
    /// unread bytes are left on the wire, the connection is closed after
    /// the response is flushed.
    RejectContent,
    /// The response is ready; flush it.
    SendResponse,
}

/// Per-connection protocol hook.
///
/// A handler lives as long as its connection and sees every exchange on it.
/// All methods are invoked with the channel's exchange lock held, by one
/// worker thread at a time.
pub trait Handler: Send {
    /// Inspects the request buffer after a read and reports whether the
    /// current fetch target is complete: the request head when
    /// `fetching_content` is false, the body when it is true.
    fn request_complete(&mut self, request: &Request, fetching_content: bool) -> bool;

    /// Runs the protocol logic over a complete head (or fetched content)
    /// and prepares the response.
    ///
    /// Errors (and panics) are contained to this channel: the core logs
    /// them, gives the handler a chance to render an internal-error
    /// response, and closes.
    fn process(&mut self, request: &mut Request, response: &mut Response)
        -> Result<Control, HandlerError>;

    /// Renders a response for an internal failure, if the protocol has one
    /// (e.g. a 500-class message). The default leaves the response empty,
    /// which closes the connection silently.
    fn internal_error(&mut self, response: &mut Response) {
        let _ = response;
    }

    /// Controls the request-body phase after a [`Control::FetchContent`]
    /// directive. When `true` (the default) the channel keeps reading until
    /// [`Handler::request_complete`] reports the body complete, then invokes
    /// `process` once; when `false`, `process` is re-invoked after every
    /// partial body read so the handler can consume content as it streams
    /// in.
    fn auto_fetch_content(&self) -> bool {
        true
    }
}

/// Builds a [`Handler`] for each accepted connection.
pub trait ChannelFactory: Send + Sync {
    /// Creates the handler that will drive `stream`'s connection.
    fn create_handler(&self, stream: &dyn ByteStream) -> Box<dyn Handler>;

    /// Invoked once per channel right after construction, before it is
    /// scheduled. The place to install per-connection (dedicated)
    /// throttlers via [`Channel::throttle_read`] /
    /// [`Channel::throttle_write`].
    fn configure_channel(&self, channel: &Channel) {
        let _ = channel;
    }
}
