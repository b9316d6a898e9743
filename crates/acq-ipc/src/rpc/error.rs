//! RPC client errors.

use acq_core::{AcqError, ErrorKind};
use thiserror::Error;

use crate::wire::WireError;

/// Failures of a remote call as seen by the caller.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The call ran on the server and the implementation failed.
    #[error("Remote function failed ({kind}): {message}")]
    Remote {
        /// Classification reported by the server.
        kind: ErrorKind,
        /// Description reported by the server.
        message: String,
    },

    /// The server could not resolve or decode the call.
    #[error("Remote side was unable to process the request: {0}")]
    Communication(String),

    /// The control pipe failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// An argument or return value could not be (de)serialized locally.
    #[error("serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    /// The call does not match the interface signature.
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    /// The server closed the session while a reply was expected.
    #[error("control pipe closed by the server")]
    ConnectionClosed,

    /// The client was disposed.
    #[error("RPC client has been disposed")]
    Disposed,
}

impl From<RpcError> for AcqError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote { kind, message } => AcqError::Remote { kind, message },
            RpcError::Communication(message) => AcqError::Communication(message),
            RpcError::Wire(WireError::Io(e)) => AcqError::Io(e),
            RpcError::Disposed => AcqError::Disposed("RPC client".to_string()),
            other => AcqError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_kind_survives_conversion() {
        let err: AcqError = RpcError::Remote {
            kind: ErrorKind::InvalidArgument,
            message: "roi".into(),
        }
        .into();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_protocol_failure_is_communication() {
        let err: AcqError = RpcError::Communication("RPC function name not found".into()).into();
        assert_eq!(err.kind(), ErrorKind::Communication);
    }
}
