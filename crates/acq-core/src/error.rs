//! Error types shared by every acquisition crate.
//!
//! `AcqError` is the error returned by hardware layers, flows and remote
//! proxies. Each variant maps to an [`ErrorKind`] label. The kind is what
//! crosses the RPC boundary: a server-side `InvalidArgument` comes back to the
//! client as an `AcqError::Remote` whose kind is still `InvalidArgument`, so
//! callers can tell "the device rejected my ROI" from "the pipe broke".
//!
//! ## Error Categories
//!
//! 1. **Caller errors** - `InvalidArgument`, `InvalidState`
//!    - The request was understood but not acceptable right now
//!    - Recovery: fix the request, or stop streaming first
//! 2. **Device errors** - `Hardware`
//!    - Raised by the hardware layer
//! 3. **Transport errors** - `Io`, `Protocol`, `Communication`
//!    - The control or data pipe failed or carried malformed bytes
//!    - Recovery: reconnect; the server accepts a new session
//! 4. **Remote errors** - `Remote`
//!    - The call reached the server and the implementation failed

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of an [`AcqError`], stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// An argument was outside the accepted range.
    InvalidArgument,
    /// The operation is not allowed in the current state.
    InvalidState,
    /// The device reported a failure.
    Hardware,
    /// An OS-level I/O failure.
    Io,
    /// Malformed or unexpected bytes on a pipe.
    Protocol,
    /// The remote side reported a failure.
    Remote,
    /// The remote side could not process the request.
    Communication,
    /// The component was already torn down.
    Disposed,
    /// Configuration was missing or invalid.
    Config,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Hardware => "hardware",
            ErrorKind::Io => "io",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Remote => "remote",
            ErrorKind::Communication => "communication",
            ErrorKind::Disposed => "disposed",
            ErrorKind::Config => "config",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using [`AcqError`].
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Primary error type for acquisition components.
#[derive(Error, Debug)]
pub enum AcqError {
    /// An argument was rejected, e.g. an ROI outside the sensor.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The call is not valid in the component's current state,
    /// e.g. changing static settings while streaming.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Failure reported by the device or its vendor layer.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// OS-level I/O failure on a pipe, socket or file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed bytes, failed handshake or an unresolvable call.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote implementation failed while executing a call.
    ///
    /// `kind` is the classification reported by the server.
    #[error("Remote function failed ({kind}): {message}")]
    Remote {
        /// Classification of the remote failure.
        kind: ErrorKind,
        /// Description produced by the remote side.
        message: String,
    },

    /// The remote side could not process the request at all.
    #[error("Communication error: {0}")]
    Communication(String),

    /// The component was used after disposal.
    #[error("{0} has been disposed")]
    Disposed(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AcqError {
    /// The wire-stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcqError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AcqError::InvalidState(_) => ErrorKind::InvalidState,
            AcqError::Hardware(_) => ErrorKind::Hardware,
            AcqError::Io(_) => ErrorKind::Io,
            AcqError::Protocol(_) => ErrorKind::Protocol,
            AcqError::Remote { kind, .. } => *kind,
            AcqError::Communication(_) => ErrorKind::Communication,
            AcqError::Disposed(_) => ErrorKind::Disposed,
            AcqError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the error was caused by an out-of-range argument, locally or
    /// on the remote side.
    #[must_use]
    pub fn is_invalid_argument(&self) -> bool {
        self.kind() == ErrorKind::InvalidArgument
    }
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Config(err.to_string())
    }
}
