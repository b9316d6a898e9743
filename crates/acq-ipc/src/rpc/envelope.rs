//! Messages exchanged on the control pipe during a session.

use acq_core::ErrorKind;
use serde::{Deserialize, Serialize};

/// Declared name and type of one argument.
///
/// Optional on the wire. When present the server checks it against the
/// registered parameter before decoding the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDecl {
    /// Parameter name as registered.
    pub name: String,
    /// Rust type name of the parameter.
    pub type_name: String,
}

/// One serialized argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgValue {
    /// Optional declaration metadata.
    pub decl: Option<ArgDecl>,
    /// bincode bytes of the value.
    pub value: Vec<u8>,
}

/// One method invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Method name.
    pub method: String,
    /// Arguments in declaration order.
    pub args: Vec<ArgValue>,
}

/// Outcome of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReturnStatus {
    /// The server could not classify the failure.
    UnknownError = 0,
    /// The call succeeded; `value` holds the serialized result.
    Ok = 1,
    /// The call could not be resolved or decoded.
    ProtocolError = 2,
    /// The call ran and the implementation failed.
    RemoteException = 3,
}

/// Failure description carried by non-`Ok` returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

/// Result of one call.
///
/// `value` is populated only for [`ReturnStatus::Ok`]; `error` only for the
/// other statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnEnvelope {
    /// Outcome.
    pub status: ReturnStatus,
    /// bincode bytes of the return value; empty for unit.
    pub value: Vec<u8>,
    /// Failure description.
    pub error: Option<RemoteFault>,
}

impl ReturnEnvelope {
    /// Successful return carrying `value`.
    #[must_use]
    pub fn ok(value: Vec<u8>) -> Self {
        Self {
            status: ReturnStatus::Ok,
            value,
            error: None,
        }
    }

    /// The call could not be resolved or decoded.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self {
            status: ReturnStatus::ProtocolError,
            value: Vec::new(),
            error: Some(RemoteFault {
                kind: ErrorKind::Protocol,
                message: message.into(),
            }),
        }
    }

    /// The implementation failed with an error of `kind`.
    pub fn remote_exception(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: ReturnStatus::RemoteException,
            value: Vec::new(),
            error: Some(RemoteFault {
                kind,
                message: message.into(),
            }),
        }
    }
}
