//! Server half of the control pipe.

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::envelope::{CallEnvelope, ReturnEnvelope};
use super::registry::MethodRegistry;
use crate::wire::{ControlCode, Messenger, Received, WireError};

/// What the session loop should do after one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// Keep serving this client.
    Continue,
    /// The client left; accept another one.
    Disconnect,
    /// Stop the server process.
    Terminate,
}

/// Dispatches calls from one connected client onto `I`.
pub struct RpcServer<I: ?Sized> {
    messenger: Messenger<UnixStream>,
    registry: Arc<MethodRegistry<I>>,
    target: Arc<I>,
    poll_interval: Duration,
}

impl<I: ?Sized + 'static> RpcServer<I> {
    /// Serve `target` on a stream that already completed the handshake.
    ///
    /// Idle reads wake every `poll_interval` so the caller can check for
    /// cancellation between messages.
    pub fn new(
        stream: UnixStream,
        registry: Arc<MethodRegistry<I>>,
        target: Arc<I>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            messenger: Messenger::new(stream),
            registry,
            target,
            poll_interval,
        }
    }

    /// Process at most one message.
    ///
    /// Returns [`SessionSignal::Continue`] when the poll interval passes with
    /// nothing to read. A payload that does not decode is answered with a
    /// protocol error and the session continues; a byte that is not a valid
    /// control code ends the session.
    pub fn process_message(&mut self) -> SessionSignal {
        let code = match self.poll_control() {
            Ok(Some(code)) => code,
            Ok(None) => return SessionSignal::Continue,
            Err(signal) => return signal,
        };
        if let Err(e) = self.messenger.get_ref().set_read_timeout(None) {
            warn!(error = %e, "failed to clear control pipe read timeout");
            return SessionSignal::Disconnect;
        }
        match self.messenger.receive_after_control::<CallEnvelope>(code) {
            Ok(Some(Received::Message(call))) => {
                let ret = self.registry.dispatch(&call, &self.target);
                self.reply(&ret)
            }
            Ok(Some(Received::Close)) => {
                info!("client closed the session");
                SessionSignal::Disconnect
            }
            Ok(Some(Received::Terminate)) => {
                info!("client requested server termination");
                SessionSignal::Terminate
            }
            Ok(None) => SessionSignal::Continue,
            Err(WireError::Serialization(e)) => {
                warn!(error = %e, "undecodable call envelope");
                self.reply(&ReturnEnvelope::protocol_error(format!(
                    "Unable to deserialize the call: {e}"
                )))
            }
            Err(WireError::UnexpectedControl(code)) => {
                warn!(?code, "unexpected control code mid-session");
                SessionSignal::Disconnect
            }
            Err(e) => {
                debug!(error = %e, "control pipe failed");
                SessionSignal::Disconnect
            }
        }
    }

    fn poll_control(&mut self) -> Result<Option<ControlCode>, SessionSignal> {
        if let Err(e) = self
            .messenger
            .get_ref()
            .set_read_timeout(Some(self.poll_interval))
        {
            warn!(error = %e, "failed to set control pipe read timeout");
            return Err(SessionSignal::Disconnect);
        }
        match self.messenger.receive_control() {
            Ok(Some(code)) => Ok(Some(code)),
            Ok(None) => {
                debug!("control pipe reached end of stream");
                Err(SessionSignal::Disconnect)
            }
            Err(WireError::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(WireError::InvalidControlByte(byte)) => {
                warn!(byte, "invalid control byte, terminating session");
                Err(SessionSignal::Disconnect)
            }
            Err(e) => {
                debug!(error = %e, "control pipe read failed");
                Err(SessionSignal::Disconnect)
            }
        }
    }

    fn reply(&mut self, ret: &ReturnEnvelope) -> SessionSignal {
        match self.messenger.send_message(ret) {
            Ok(()) => SessionSignal::Continue,
            Err(e) => {
                debug!(error = %e, "reply not delivered");
                SessionSignal::Disconnect
            }
        }
    }
}

impl<I: ?Sized> std::fmt::Debug for RpcServer<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("registry", &self.registry)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
