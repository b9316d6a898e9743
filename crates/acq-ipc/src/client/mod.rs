//! Client side: capability proxies, the streaming reader and camera handles.
//!
//! # Layering
//!
//! ```text
//! CameraRegistry ─→ CameraHandle ─→ PipeReader ─┬→ RemoteCameraFlow (RPC over the control pipe)
//!                                               └→ StreamingReader  (per-session data pipe)
//! ```

mod camera;
mod pipe_reader;
mod proxy;
mod streaming;

pub use camera::{CameraHandle, CameraRegistry};
pub use pipe_reader::{ClientOptions, PipeReader, CONNECT_FAILURE_MESSAGE};
pub use proxy::{
    ClientChannel, DataPipeSource, RemoteCamera, RemoteCameraFlow, RemoteOutput, RemoteProxy,
    RemoteStartStop,
};
pub use streaming::{ReaderState, StreamingReader};
