//! Switchyard: connection orchestration core for non-blocking network servers.
//!
//! # Overview
//!
//! A non-blocking server juggles a population of client connections, each of
//! which is only occasionally able to make progress: bytes have arrived, the
//! socket buffer has drained, a rate limiter has refilled, or the peer has
//! simply gone away. Switchyard owns that juggling act. It keeps one
//! [`Channel`] per connection — a small state machine walking through the
//! read/process/write lifecycle — and a central [`Orchestrator`] that decides
//! which channels can do work *right now*, hands them to a fixed pool of
//! worker threads, and parks everything else on a kernel readiness poller or
//! a throttling deadline.
//!
//! # Core Guarantees
//!
//! - **One activation at a time**: a channel is never advanced by two threads
//!   concurrently; all stage transitions on one channel are totally ordered.
//! - **Workers never sleep**: throttler starvation and idle eviction are
//!   expressed as deadlines owned by the orchestrator's single timed wait,
//!   never as worker-thread sleeps.
//! - **Failure is channel-scoped**: an I/O error, a protocol handler error,
//!   or a handler panic closes that one channel; the orchestrator survives.
//! - **Closed is terminal**: stage reads without the exchange lock are safe
//!   precisely because a closed channel can never be resurrected.
//!
//! # Module Structure
//!
//! - [`orchestrator`]: the central scheduling loop, task records, lifecycle
//! - [`channel`]: the per-connection state machine and the handler boundary
//! - [`throttle`]: leaky-bucket byte-rate limiting
//! - [`poller`]: readiness-notification boundary (kernel-backed and lab)
//! - [`stream`]: non-blocking byte-stream boundary (TCP and lab)
//! - [`pool`]: the activation worker pool
//! - [`sync`]: wait-event primitive the main thread blocks on
//! - [`signal`]: one-shot stop signal
//! - [`server`]: polled TCP accept glue
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchyard::{Orchestrator, TcpServer};
//!
//! let orchestrator = Orchestrator::builder(Arc::new(MyFactory))
//!     .threads(4)
//!     .inactivity_timeout(std::time::Duration::from_secs(10))
//!     .build()?;
//!
//! let handle = orchestrator.start()?;
//! let server = TcpServer::bind("127.0.0.1:8080", Arc::clone(&orchestrator))?;
//!
//! // ... later ...
//! server.stop();
//! orchestrator.stop();
//! handle.wait()?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod channel;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod pool;
pub mod server;
pub mod signal;
pub mod stream;
pub mod sync;
pub mod throttle;

pub use channel::{Channel, ChannelFactory, Control, Handler, Request, Response, Stage};
pub use error::{HandlerError, OrchestratorError, PollerError};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorStats, StartHandle};
pub use poller::{EventSet, Poller};
pub use server::TcpServer;
pub use stream::{ByteStream, StreamId, TcpByteStream};
pub use throttle::{Throttler, ThrottlerInfo};
