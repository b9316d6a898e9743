//! Remote surface of the fake camera: the camera flow plus test hooks.
//!
//! Server side, [`FakeFlow`] is a [`CameraFlow`] around a [`FakeCamera`];
//! client side, [`FakeFlowClient`] is the matching proxy. Both implement
//! [`FakeFlowApi`], and [`fake_flow_registry`] registers it once for both
//! dispatch and client signature checks.

use once_cell::sync::Lazy;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use acq_core::{
    AcqResult, BinningMode, Camera, CameraAttributes, CameraControl, OutputFileAndPipe, StartStop,
    VideoSettingsDynamic, VideoSettingsStatic,
};
use acq_ipc::rpc::{camera_flow_registry, InterfaceSignature, MethodRegistry};
use acq_ipc::{
    CameraFlow, ClientChannel, DataPipeSource, DataServer, RemoteCameraFlow, RemoteProxy,
    ServerOptions,
};

use crate::fake_camera::{FakeCamera, FakeCameraConfig};

/// Coordination name used when none is given.
pub const DEFAULT_COORDINATION_NAME: &str = "Lab.Acq.Fake";

/// Names of the test-hook methods.
pub mod fake_methods {
    /// `fake_define_camera(width, height, bit_depth, supported_binning)`
    pub const DEFINE_CAMERA: &str = "fake_define_camera";
    /// `fake_inter_frame_interval_ms() -> u64`
    pub const INTER_FRAME_INTERVAL_MS: &str = "fake_inter_frame_interval_ms";
    /// `fake_set_inter_frame_interval_ms(interval_ms)`
    pub const SET_INTER_FRAME_INTERVAL_MS: &str = "fake_set_inter_frame_interval_ms";
    /// `fake_frames_produced() -> u64`
    pub const FRAMES_PRODUCED: &str = "fake_frames_produced";
}

use fake_methods::*;

/// Camera flow operations plus hooks for driving the fake camera in tests.
pub trait FakeFlowApi: CameraControl {
    /// Redefine the sensor; rejected while streaming.
    fn fake_define_camera(
        &self,
        width: i32,
        height: i32,
        bit_depth: i32,
        supported_binning: Vec<BinningMode>,
    ) -> AcqResult<()>;

    /// Current interval between frames.
    fn fake_inter_frame_interval_ms(&self) -> AcqResult<u64>;

    /// Change the interval between frames; negative values are rejected.
    fn fake_set_inter_frame_interval_ms(&self, interval_ms: i64) -> AcqResult<()>;

    /// Frames the camera has produced so far.
    fn fake_frames_produced(&self) -> AcqResult<u64>;
}

/// Server-side flow around a fake camera.
pub type FakeFlow = CameraFlow<FakeCamera>;

impl FakeFlowApi for FakeFlow {
    fn fake_define_camera(
        &self,
        width: i32,
        height: i32,
        bit_depth: i32,
        supported_binning: Vec<BinningMode>,
    ) -> AcqResult<()> {
        self.hal()
            .define_camera(width, height, bit_depth, supported_binning)
    }

    fn fake_inter_frame_interval_ms(&self) -> AcqResult<u64> {
        Ok(self.hal().inter_frame_interval().as_millis() as u64)
    }

    fn fake_set_inter_frame_interval_ms(&self, interval_ms: i64) -> AcqResult<()> {
        self.hal().set_inter_frame_interval_ms(interval_ms)
    }

    fn fake_frames_produced(&self) -> AcqResult<u64> {
        Ok(self.hal().frames_produced())
    }
}

/// Camera flow registry plus the `fake_*` hooks.
#[must_use]
pub fn fake_flow_registry<I: FakeFlowApi + ?Sized + 'static>() -> MethodRegistry<I> {
    let mut registry = camera_flow_registry::<I>();
    let _ = registry
        .capability("FakeFlowApi")
        .method(
            DEFINE_CAMERA,
            &["width", "height", "bit_depth", "supported_binning"],
            |t: &I, (w, h, bpp, binning): (i32, i32, i32, Vec<BinningMode>)| {
                t.fake_define_camera(w, h, bpp, binning)
            },
        )
        .method(INTER_FRAME_INTERVAL_MS, &[], |t: &I, (): ()| {
            t.fake_inter_frame_interval_ms()
        })
        .method(
            SET_INTER_FRAME_INTERVAL_MS,
            &["interval_ms"],
            |t: &I, (ms,): (i64,)| t.fake_set_inter_frame_interval_ms(ms),
        )
        .method(FRAMES_PRODUCED, &[], |t: &I, (): ()| t.fake_frames_produced());
    registry
}

/// Signature of [`fake_flow_registry`].
pub static FAKE_FLOW_SIGNATURE: Lazy<InterfaceSignature> =
    Lazy::new(|| fake_flow_registry::<dyn FakeFlowApi>().into_signature());

/// Session server for the fake camera.
#[must_use]
pub fn fake_server(options: ServerOptions, config: FakeCameraConfig) -> DataServer<FakeFlow> {
    fake_server_counted(options, config, Arc::new(AtomicUsize::new(0)))
}

/// Like [`fake_server`], counting camera teardowns into `teardowns`.
#[must_use]
pub fn fake_server_counted(
    options: ServerOptions,
    config: FakeCameraConfig,
    teardowns: Arc<AtomicUsize>,
) -> DataServer<FakeFlow> {
    DataServer::new(
        fake_flow_registry::<FakeFlow>(),
        move |options: &ServerOptions| {
            let camera =
                FakeCamera::new(&config)?.with_teardown_counter(Arc::clone(&teardowns));
            let flow = CameraFlow::new(
                camera,
                options.ring_buffer_capacity,
                options.namespace.clone(),
            )?;
            Ok(Arc::new(flow))
        },
        options,
    )
}

/// Client proxy for a fake flow server.
#[derive(Debug, Clone)]
pub struct FakeFlowClient {
    flow: RemoteCameraFlow,
    channel: ClientChannel,
}

impl RemoteProxy for FakeFlowClient {
    fn interface() -> &'static InterfaceSignature {
        &FAKE_FLOW_SIGNATURE
    }

    fn from_channel(channel: ClientChannel) -> Self {
        Self {
            flow: RemoteCameraFlow::from_channel(channel.clone()),
            channel,
        }
    }

    fn channel(&self) -> &ClientChannel {
        &self.channel
    }
}

impl FakeFlowApi for FakeFlowClient {
    fn fake_define_camera(
        &self,
        width: i32,
        height: i32,
        bit_depth: i32,
        supported_binning: Vec<BinningMode>,
    ) -> AcqResult<()> {
        self.channel
            .call(DEFINE_CAMERA, (width, height, bit_depth, supported_binning))
    }

    fn fake_inter_frame_interval_ms(&self) -> AcqResult<u64> {
        self.channel.call(INTER_FRAME_INTERVAL_MS, ())
    }

    fn fake_set_inter_frame_interval_ms(&self, interval_ms: i64) -> AcqResult<()> {
        self.channel.call(SET_INTER_FRAME_INTERVAL_MS, (interval_ms,))
    }

    fn fake_frames_produced(&self) -> AcqResult<u64> {
        self.channel.call(FRAMES_PRODUCED, ())
    }
}

impl StartStop for FakeFlowClient {
    fn start(&self) -> AcqResult<()> {
        self.flow.start()
    }

    fn stop(&self) -> AcqResult<()> {
        self.flow.stop()
    }

    fn is_running(&self) -> AcqResult<bool> {
        self.flow.is_running()
    }
}

impl Camera for FakeFlowClient {
    fn attributes(&self) -> AcqResult<CameraAttributes> {
        self.flow.attributes()
    }

    fn settings_static(&self) -> AcqResult<VideoSettingsStatic> {
        self.flow.settings_static()
    }

    fn set_settings_static(&self, settings: VideoSettingsStatic) -> AcqResult<()> {
        self.flow.set_settings_static(settings)
    }

    fn settings_dynamic(&self) -> AcqResult<VideoSettingsDynamic> {
        self.flow.settings_dynamic()
    }

    fn set_settings_dynamic(&self, settings: VideoSettingsDynamic) -> AcqResult<()> {
        self.flow.set_settings_dynamic(settings)
    }
}

impl OutputFileAndPipe for FakeFlowClient {
    fn set_output_file(&self, path: &str) -> AcqResult<()> {
        self.flow.set_output_file(path)
    }

    fn flush_output_file(&self) -> AcqResult<()> {
        self.flow.flush_output_file()
    }

    fn set_output_pipe(&self, name: &str) -> AcqResult<()> {
        self.flow.set_output_pipe(name)
    }
}

impl DataPipeSource for FakeFlowClient {
    fn create_data_pipe(&self, name: &str) -> AcqResult<UnixStream> {
        self.flow.create_data_pipe(name)
    }

    fn close_data_pipe(&self) -> AcqResult<()> {
        self.flow.close_data_pipe()
    }
}
