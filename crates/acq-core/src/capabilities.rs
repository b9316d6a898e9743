//! Capability traits implemented by hardware layers, flows and remote proxies.
//!
//! A device is described by composing small capabilities instead of a single
//! deep interface. The same traits are implemented on both sides of the pipe:
//! by the server-side flow that owns the hardware, and by the client-side
//! proxy that forwards each call over RPC.
//!
//! # Hierarchy
//!
//! ```text
//! StartStop ─┬─ Camera ──────────┐
//!            │                   ├─ CameraControl
//!            └─ FlowControl ─────┤
//! OutputFileAndPipe ─────────────┘
//! ```

use acq_pool::RingBufferWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::dispose::Dispose;
use crate::error::AcqResult;
use crate::frame::Frame;
use crate::settings::{CameraAttributes, VideoSettingsDynamic, VideoSettingsStatic};

/// Devices and flows that can be started and stopped.
pub trait StartStop: Send + Sync {
    /// Begin producing data. Fails if already running.
    fn start(&self) -> AcqResult<()>;

    /// Stop producing data.
    fn stop(&self) -> AcqResult<()>;

    /// Whether data is being produced.
    fn is_running(&self) -> AcqResult<bool>;
}

/// Flows with a file sink and a data-pipe output.
pub trait OutputFileAndPipe: Send + Sync {
    /// Replace the file sink. An empty path closes it.
    fn set_output_file(&self, path: &str) -> AcqResult<()>;

    /// Flush buffered file output.
    fn flush_output_file(&self) -> AcqResult<()>;

    /// Replace the data pipe. An empty name closes it.
    fn set_output_pipe(&self, name: &str) -> AcqResult<()>;
}

/// Cameras: attributes plus static and dynamic settings.
pub trait Camera: StartStop {
    /// Immutable device description.
    fn attributes(&self) -> AcqResult<CameraAttributes>;

    /// Current static settings.
    fn settings_static(&self) -> AcqResult<VideoSettingsStatic>;

    /// Replace static settings. Rejected while streaming, and rejected
    /// without side effects when any value is out of range.
    fn set_settings_static(&self, settings: VideoSettingsStatic) -> AcqResult<()>;

    /// Current dynamic settings.
    fn settings_dynamic(&self) -> AcqResult<VideoSettingsDynamic>;

    /// Replace dynamic settings; may be queued until the next frame.
    fn set_settings_dynamic(&self, settings: VideoSettingsDynamic) -> AcqResult<()>;
}

/// Start/stop plus outputs.
pub trait FlowControl: StartStop + OutputFileAndPipe {}

impl<T: StartStop + OutputFileAndPipe + ?Sized> FlowControl for T {}

/// A camera flow: camera capabilities plus outputs.
pub trait CameraControl: Camera + OutputFileAndPipe {}

impl<T: Camera + OutputFileAndPipe + ?Sized> CameraControl for T {}

/// Hardware layers that publish items into a ring buffer.
pub trait RingBufferOutput<T>: Send + Sync {
    /// Attach or detach the ring buffer receiving captured items.
    fn set_ring_buffer_output(&self, output: Option<Arc<dyn RingBufferWrite<T>>>);
}

/// Contract between a camera flow and the hardware layer it owns.
pub trait CameraHal: Camera + RingBufferOutput<Frame> + Dispose {}

impl<T: Camera + RingBufferOutput<Frame> + Dispose + ?Sized> CameraHal for T {}

/// Handle returned when registering a callback; used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl SubscriptionHandle {
    /// Allocate a process-unique handle.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback receiving each delivered item.
pub type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;
