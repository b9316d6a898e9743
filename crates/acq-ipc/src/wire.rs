//! Byte-level framing on the control and data pipes.
//!
//! # Control pipe
//!
//! ```text
//! [control byte]                                   Close, KeepAlive, ...
//! [MessageFollows][u32 length, LE][bincode payload]
//! ```
//!
//! # Data pipe
//!
//! ```text
//! [u32 length, LE][bincode Frame] [u32 length, LE][bincode Frame] ...
//! ```
//!
//! The data pipe carries no control bytes; the end of the stream ends the
//! session.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::{debug, trace};

/// Largest payload accepted on either pipe: a 4096x4096 frame at four bytes
/// per pixel plus header room.
pub const MAX_MESSAGE_BYTES: usize = 4096 * 4096 * 4 + 4096;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Control bytes on the control pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCode {
    /// A length-prefixed payload follows.
    MessageFollows = 1,
    /// Liveness ping; skipped by readers.
    KeepAliveNoRead = 2,
    /// The peer is ending the session.
    Close = 4,
    /// The peer asks the whole server process to stop.
    TerminateServer = 8,
    /// First byte sent by a connecting client.
    HandshakeFromClient = 16,
    /// Server's reply to the client handshake.
    HandshakeFromServer = 17,
}

impl TryFrom<u8> for ControlCode {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(ControlCode::MessageFollows),
            2 => Ok(ControlCode::KeepAliveNoRead),
            4 => Ok(ControlCode::Close),
            8 => Ok(ControlCode::TerminateServer),
            16 => Ok(ControlCode::HandshakeFromClient),
            17 => Ok(ControlCode::HandshakeFromServer),
            other => Err(WireError::InvalidControlByte(other)),
        }
    }
}

/// Framing failures.
#[derive(Debug, Error)]
pub enum WireError {
    /// The underlying pipe failed.
    #[error("pipe I/O failed: {0}")]
    Io(#[from] io::Error),

    /// A byte that is not a known control code.
    #[error("invalid control byte {0:#04x}")]
    InvalidControlByte(u8),

    /// A known control code where it is not allowed.
    #[error("unexpected control code {0:?}")]
    UnexpectedControl(ControlCode),

    /// A length prefix beyond [`MAX_MESSAGE_BYTES`].
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit")]
    MessageTooLarge(usize),

    /// Payload bytes did not decode, or a value did not encode.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] bincode::Error),

    /// The handshake byte exchange failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Outcome of reading one logical message from the control pipe.
#[derive(Debug, PartialEq)]
pub enum Received<T> {
    /// A decoded payload.
    Message(T),
    /// The peer closed the session, or the pipe ended.
    Close,
    /// The peer asked the server process to terminate.
    Terminate,
}

/// Control-pipe endpoint speaking the framing above.
pub struct Messenger<S> {
    stream: S,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl<S> Messenger<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
        }
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// The underlying stream, mutably.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unwrap the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> Messenger<S> {
    /// Write a single control byte.
    pub fn send_control(&mut self, code: ControlCode) -> Result<(), WireError> {
        self.stream.write_all(&[code as u8])?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read a single control byte. `Ok(None)` at end of stream.
    pub fn receive_control(&mut self) -> Result<Option<ControlCode>, WireError> {
        let mut byte = [0u8; 1];
        loop {
            match self.stream.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return ControlCode::try_from(byte[0]).map(Some),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write `MessageFollows`, the length prefix and the payload in one write.
    pub fn send_message<T: Serialize>(&mut self, message: &T) -> Result<(), WireError> {
        self.write_buf.clear();
        self.write_buf.push(ControlCode::MessageFollows as u8);
        append_framed(message, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read the next logical message, skipping keep-alives.
    ///
    /// End of stream and read errors on the control byte are reported as
    /// [`Received::Close`].
    pub fn receive_message<T: DeserializeOwned>(&mut self) -> Result<Received<T>, WireError> {
        loop {
            let code = match self.receive_control() {
                Ok(Some(code)) => code,
                Ok(None) => return Ok(Received::Close),
                Err(WireError::Io(e)) => {
                    debug!(error = %e, "control pipe read failed, treating as close");
                    return Ok(Received::Close);
                }
                Err(e) => return Err(e),
            };
            if let Some(received) = self.receive_after_control(code)? {
                return Ok(received);
            }
        }
    }

    /// Complete a message whose control byte was already read.
    ///
    /// Returns `None` for keep-alives. A payload that fails to decode is
    /// consumed in full, so the stream stays in sync.
    pub fn receive_after_control<T: DeserializeOwned>(
        &mut self,
        code: ControlCode,
    ) -> Result<Option<Received<T>>, WireError> {
        match code {
            ControlCode::MessageFollows => {
                read_frame_bytes(&mut self.stream, &mut self.read_buf)?
                    .ok_or_else(|| WireError::Io(io::ErrorKind::UnexpectedEof.into()))?;
                let message = bincode::deserialize(&self.read_buf)?;
                Ok(Some(Received::Message(message)))
            }
            ControlCode::KeepAliveNoRead => {
                trace!("keep-alive skipped");
                Ok(None)
            }
            ControlCode::Close => Ok(Some(Received::Close)),
            ControlCode::TerminateServer => Ok(Some(Received::Terminate)),
            ControlCode::HandshakeFromClient | ControlCode::HandshakeFromServer => {
                Err(WireError::UnexpectedControl(code))
            }
        }
    }

    /// Client side of the handshake.
    pub fn client_handshake(&mut self) -> Result<(), WireError> {
        self.send_control(ControlCode::HandshakeFromClient)?;
        match self.receive_control() {
            Ok(Some(ControlCode::HandshakeFromServer)) => Ok(()),
            Ok(Some(other)) => Err(WireError::HandshakeFailed(format!(
                "server replied {other:?}"
            ))),
            Ok(None) => Err(WireError::HandshakeFailed(
                "server closed the pipe".to_string(),
            )),
            Err(e) => Err(WireError::HandshakeFailed(e.to_string())),
        }
    }

    /// Server side of the handshake.
    pub fn server_handshake(&mut self) -> Result<(), WireError> {
        match self.receive_control() {
            Ok(Some(ControlCode::HandshakeFromClient)) => {
                self.send_control(ControlCode::HandshakeFromServer)
            }
            Ok(Some(other)) => Err(WireError::HandshakeFailed(format!(
                "client sent {other:?}"
            ))),
            Ok(None) => Err(WireError::HandshakeFailed(
                "client closed the pipe".to_string(),
            )),
            Err(e) => Err(WireError::HandshakeFailed(e.to_string())),
        }
    }
}

/// Serialize `value` with a length prefix into `out`, replacing its contents.
pub fn encode_framed<T: Serialize + ?Sized>(value: &T, out: &mut Vec<u8>) -> Result<(), WireError> {
    out.clear();
    append_framed(value, out)
}

/// Write `value` with a length prefix, using `scratch` as the encode buffer.
pub fn write_framed<W: Write, T: Serialize + ?Sized>(
    writer: &mut W,
    value: &T,
    scratch: &mut Vec<u8>,
) -> Result<(), WireError> {
    encode_framed(value, scratch)?;
    writer.write_all(scratch)?;
    Ok(())
}

/// Read one length-prefixed value. `Ok(None)` on a clean end of stream.
pub fn read_framed<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    scratch: &mut Vec<u8>,
) -> Result<Option<T>, WireError> {
    match read_frame_bytes(reader, scratch)? {
        Some(()) => Ok(Some(bincode::deserialize(scratch)?)),
        None => Ok(None),
    }
}

fn append_framed<T: Serialize + ?Sized>(value: &T, out: &mut Vec<u8>) -> Result<(), WireError> {
    let start = out.len();
    out.extend_from_slice(&[0u8; LENGTH_PREFIX_BYTES]);
    bincode::serialize_into(&mut *out, value)?;
    let len = out.len() - start - LENGTH_PREFIX_BYTES;
    if len > MAX_MESSAGE_BYTES {
        out.truncate(start);
        return Err(WireError::MessageTooLarge(len));
    }
    let prefix = (len as u32).to_le_bytes();
    out[start..start + LENGTH_PREFIX_BYTES].copy_from_slice(&prefix);
    Ok(())
}

fn read_frame_bytes<R: Read>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<()>, WireError> {
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_BYTES {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(WireError::Io(io::ErrorKind::UnexpectedEof.into())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(WireError::MessageTooLarge(len));
    }
    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(buf)?;
    Ok(Some(()))
}
