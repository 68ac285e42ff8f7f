//! Error types.
//!
//! Errors scoped to a single channel (peer resets, handler failures, EOF
//! mid-request) never surface here: they close that channel and are logged.
//! The types below cover the orchestrator lifecycle and the poller boundary,
//! where the caller can actually react.

use std::io;

use thiserror::Error;

/// Error raised by a protocol handler's `process` hook.
///
/// The core does not interpret the payload; it logs it, attempts an
/// internal-error response if the handler supplies one, and closes the
/// channel.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the readiness poller boundary.
#[derive(Debug, Error)]
pub enum PollerError {
    /// The underlying OS facility failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The stream exposes no pollable descriptor (e.g. a lab stream handed
    /// to a kernel poller).
    #[error("stream exposes no pollable descriptor")]
    NotPollable,

    /// The poller has not been started, or has already stopped.
    #[error("poller is not running")]
    NotRunning,

    /// `start` was called on a poller that is already running.
    #[error("poller is already running")]
    AlreadyRunning,
}

/// Errors surfaced by the orchestrator lifecycle.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// `start` was called while a previous run is still live.
    #[error("orchestrator is already running")]
    AlreadyRunning,

    /// The main scheduling thread died from a panic; the run was force
    /// stopped and the panic message is preserved here.
    #[error("orchestrator main loop panicked: {message}")]
    MainLoopPanicked {
        /// Rendered panic payload.
        message: String,
    },

    /// The poller could not be started or torn down.
    #[error("poller failure: {0}")]
    Poller(#[from] PollerError),
}
