//! Fake hardware for the acquisition pipeline.
//!
//! Provides a simulated camera so the full client/server path can be driven
//! without physical hardware.
//!
//! # Contents
//!
//! - [`FakeCamera`] - camera hardware layer producing pattern frames at a
//!   fixed interval (default 512x512, 14 bpp, 100 ms)
//! - [`FakeFlow`] - the camera flow the server exposes per session
//! - [`FakeFlowApi`] - camera flow operations plus `fake_*` test hooks
//! - [`FakeFlowClient`] - client proxy for [`FakeFlowApi`]
//! - [`fake_server`] - session server serving [`FakeFlow`]
//!
//! ```rust,no_run
//! use acq_driver_mock::{fake_server, FakeCameraConfig, FakeFlowClient, DEFAULT_COORDINATION_NAME};
//! use acq_ipc::{ClientOptions, PipeReader, ServerOptions};
//! use acq_pool::CancelToken;
//! use std::sync::Arc;
//!
//! # fn main() -> acq_core::AcqResult<()> {
//! let server = Arc::new(fake_server(ServerOptions::default(), FakeCameraConfig::default()));
//! let handle = server.launch(DEFAULT_COORDINATION_NAME, CancelToken::new(), true)?;
//!
//! let reader: PipeReader<FakeFlowClient> =
//!     PipeReader::connect(DEFAULT_COORDINATION_NAME, &ClientOptions::default())?;
//! reader.subscribe(Arc::new(|frame: &acq_core::Frame| println!("frame {}", frame.frame_number)));
//! reader.start()?;
//! # drop(handle);
//! # Ok(())
//! # }
//! ```

mod fake_camera;
mod fake_flow;
mod pattern;

pub use fake_camera::{
    FakeCamera, FakeCameraConfig, HARDWARE_COUNTER_BITS, MIN_ROI_EDGE, MIN_SENSOR_EDGE,
};
pub use fake_flow::{
    fake_flow_registry, fake_methods, fake_server, fake_server_counted, FakeFlow, FakeFlowApi,
    FakeFlowClient, DEFAULT_COORDINATION_NAME, FAKE_FLOW_SIGNATURE,
};
pub use pattern::fill_test_pattern;
