//! Process isolation for lab acquisition hardware.
//!
//! A worker process owns the hardware and serves one client at a time over a
//! control pipe; frames stream back over a separate data pipe that is
//! recreated for every session.
//!
//! # Architecture
//!
//! ```text
//! client process                          worker process
//! ─────────────                           ──────────────
//! proxy ── RpcClient ── control pipe ──── RpcServer ── MethodRegistry ── CameraFlow ── HAL
//!                                                                            │
//! StreamingReader ◄──── data pipe ◄──── pipe-out thread ◄── DataFlow ◄── RingBuffer
//! ```
//!
//! - [`wire`]: control bytes and length-prefixed payloads
//! - [`transport`]: named pipes over Unix domain sockets
//! - [`rpc`]: call envelopes, method registry, client and server halves
//! - [`flow`]: retrieval and pipe-out threads behind a flow object
//! - [`server`]: accept/handshake/serve loop
//! - [`client`]: proxies, `PipeReader` and the streaming state machine

#[cfg(not(unix))]
compile_error!("acq-ipc requires Unix domain sockets and POSIX semaphores");

pub mod client;
pub mod flow;
pub mod rpc;
pub mod semaphore;
pub mod server;
pub mod swap;
pub mod transport;
pub mod wire;

pub use client::{
    CameraHandle, CameraRegistry, ClientChannel, ClientOptions, DataPipeSource, PipeReader,
    ReaderState, RemoteCamera, RemoteCameraFlow, RemoteOutput, RemoteProxy, RemoteStartStop,
    StreamingReader,
};
pub use flow::{CameraFlow, DataFlow, FlowItem, FlowStats};
pub use rpc::{
    camera_flow_registry, InterfaceSignature, MethodRegistry, RpcClient, RpcError, RpcServer,
    SessionSignal,
};
pub use semaphore::StartupSemaphore;
pub use server::{
    standalone_server_main, DataServer, ServerExit, ServerHandle, ServerOptions, ServerState,
};
pub use swap::SyncSwapValue;
pub use transport::{connect, session_pipe_name, PipeListener, PipeNamespace};
pub use wire::{ControlCode, Messenger, Received, WireError};
