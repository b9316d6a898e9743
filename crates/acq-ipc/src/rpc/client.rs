//! Client half of the control pipe.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

use acq_core::{Dispose, DisposeGuard, ErrorKind};

use super::args::ArgTuple;
use super::envelope::{
    ArgDecl, ArgValue, CallEnvelope, RemoteFault, ReturnEnvelope, ReturnStatus,
};
use super::error::RpcError;
use super::registry::InterfaceSignature;
use crate::wire::{ControlCode, Messenger, Received};

/// Typed calls over one control pipe.
///
/// Calls are strictly request/response; the messenger lock serializes
/// concurrent callers so replies cannot interleave.
pub struct RpcClient<S: Read + Write = UnixStream> {
    messenger: Mutex<Option<Messenger<S>>>,
    signature: &'static InterfaceSignature,
    terminate_on_dispose: AtomicBool,
    guard: DisposeGuard,
}

impl<S: Read + Write> RpcClient<S> {
    /// Wrap a stream that already completed the handshake.
    pub fn new(messenger: Messenger<S>, signature: &'static InterfaceSignature) -> Self {
        Self {
            messenger: Mutex::new(Some(messenger)),
            signature,
            terminate_on_dispose: AtomicBool::new(false),
            guard: DisposeGuard::new(),
        }
    }

    /// Handshake on `stream` and wrap it.
    pub fn connect(stream: S, signature: &'static InterfaceSignature) -> Result<Self, RpcError> {
        let mut messenger = Messenger::new(stream);
        messenger.client_handshake()?;
        Ok(Self::new(messenger, signature))
    }

    /// The interface this client calls into.
    #[must_use]
    pub fn signature(&self) -> &'static InterfaceSignature {
        self.signature
    }

    /// Invoke `method` with `args` and decode the result as `R`.
    pub fn call<A, R>(&self, method: &str, args: A) -> Result<R, RpcError>
    where
        A: ArgTuple,
        R: DeserializeOwned + 'static,
    {
        if cfg!(debug_assertions) {
            self.signature
                .check(method, &A::type_names(), std::any::type_name::<R>())?;
        }
        let params = self
            .signature
            .resolve(method)
            .map(|m| m.params.as_slice())
            .unwrap_or_default();
        let args = args
            .encode()?
            .into_iter()
            .enumerate()
            .map(|(index, value)| ArgValue {
                decl: params.get(index).map(|p| ArgDecl {
                    name: p.name.clone(),
                    type_name: p.type_name.to_string(),
                }),
                value,
            })
            .collect();
        let envelope = CallEnvelope {
            method: method.to_string(),
            args,
        };
        let ret = self.round_trip(&envelope)?;
        match ret.status {
            ReturnStatus::Ok => Ok(bincode::deserialize(&ret.value)?),
            ReturnStatus::RemoteException => {
                let fault = ret.error.unwrap_or_else(|| RemoteFault {
                    kind: ErrorKind::Unknown,
                    message: String::new(),
                });
                Err(RpcError::Remote {
                    kind: fault.kind,
                    message: fault.message,
                })
            }
            ReturnStatus::ProtocolError | ReturnStatus::UnknownError => Err(
                RpcError::Communication(ret.error.map(|f| f.message).unwrap_or_default()),
            ),
        }
    }

    /// Ask the server to exit when this client is disposed, instead of
    /// waiting for the next client.
    pub fn set_terminate_on_dispose(&self, terminate: bool) {
        self.terminate_on_dispose.store(terminate, Ordering::Release);
    }

    /// Whether disposal sends `TerminateServer`.
    #[must_use]
    pub fn terminate_on_dispose(&self) -> bool {
        self.terminate_on_dispose.load(Ordering::Acquire)
    }

    fn round_trip(&self, envelope: &CallEnvelope) -> Result<ReturnEnvelope, RpcError> {
        let mut slot = self.messenger.lock();
        let messenger = slot.as_mut().ok_or(RpcError::Disposed)?;
        trace!(method = %envelope.method, "rpc call");
        messenger.send_message(envelope)?;
        match messenger.receive_message::<ReturnEnvelope>()? {
            Received::Message(ret) => Ok(ret),
            Received::Close | Received::Terminate => Err(RpcError::ConnectionClosed),
        }
    }

    fn close(&self) {
        let Some(mut messenger) = self.messenger.lock().take() else {
            return;
        };
        let code = if self.terminate_on_dispose() {
            ControlCode::TerminateServer
        } else {
            ControlCode::Close
        };
        debug!(?code, "closing control pipe");
        if let Err(e) = messenger.send_control(code) {
            debug!(error = %e, "close notification not delivered");
        }
    }
}

impl<S: Read + Write + Send> Dispose for RpcClient<S> {
    fn dispose(&self) {
        if self.guard.begin() {
            self.close();
        }
    }

    fn is_disposed(&self) -> bool {
        self.guard.is_disposed()
    }
}

impl<S: Read + Write> Drop for RpcClient<S> {
    fn drop(&mut self) {
        if self.guard.begin() {
            self.close();
        }
    }
}

impl<S: Read + Write> std::fmt::Debug for RpcClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("methods", &self.signature.methods().len())
            .field("disposed", &self.guard.is_disposed())
            .finish()
    }
}
