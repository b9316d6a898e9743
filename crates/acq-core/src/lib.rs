//! Core types for process-isolated lab acquisition.
//!
//! - [`frame`]: captured images
//! - [`settings`], [`geometry`]: camera description, settings and ROI rules
//! - [`capabilities`]: traits shared by hardware layers, flows and proxies
//! - [`dispose`]: run-once teardown
//! - [`error`]: `AcqError` and its wire-stable `ErrorKind`
//! - [`config`], [`logging`]: Figment configuration and tracing setup

pub mod capabilities;
pub mod config;
pub mod counter;
pub mod dispose;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod logging;
pub mod settings;

pub use capabilities::{
    Camera, CameraControl, CameraHal, FlowControl, OutputFileAndPipe, RingBufferOutput, StartStop,
    Subscriber, SubscriptionHandle,
};
pub use dispose::{Dispose, DisposeGuard};
pub use error::{AcqError, AcqResult, ErrorKind};
pub use frame::Frame;
pub use geometry::{NaturalRect, RoiConstraints};
pub use settings::{
    full_frame_settings, BinningMode, CameraAttributes, TriggerMode, VideoSettingsDynamic,
    VideoSettingsStatic,
};
