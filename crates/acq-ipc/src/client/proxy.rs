//! Client-side capability proxies.
//!
//! Proxies hold no state of their own beyond a shared [`ClientChannel`]:
//! every trait method becomes one RPC call. Device-specific clients are built
//! by composing the small proxies below rather than by extending one another.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use acq_core::{
    AcqError, AcqResult, Camera, CameraAttributes, OutputFileAndPipe, StartStop,
    VideoSettingsDynamic, VideoSettingsStatic,
};

use crate::rpc::methods::*;
use crate::rpc::{ArgTuple, InterfaceSignature, RpcClient, CAMERA_FLOW_SIGNATURE};
use crate::transport::{connect, PipeNamespace};

/// The RPC client plus what is needed to open data pipes it names.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    rpc: Arc<RpcClient>,
    namespace: PipeNamespace,
    connect_timeout: Duration,
}

impl ClientChannel {
    /// Channel over `rpc`; data pipes are resolved in `namespace`.
    pub fn new(rpc: Arc<RpcClient>, namespace: PipeNamespace, connect_timeout: Duration) -> Self {
        Self {
            rpc,
            namespace,
            connect_timeout,
        }
    }

    /// The underlying RPC client.
    #[must_use]
    pub fn rpc(&self) -> &Arc<RpcClient> {
        &self.rpc
    }

    /// Call `method`, converting failures to [`AcqError`].
    pub fn call<A, R>(&self, method: &str, args: A) -> AcqResult<R>
    where
        A: ArgTuple,
        R: serde::de::DeserializeOwned + 'static,
    {
        self.rpc.call(method, args).map_err(AcqError::from)
    }

    /// Connect to a data pipe the server is listening on.
    pub fn connect_data_pipe(&self, name: &str) -> AcqResult<UnixStream> {
        Ok(connect(&self.namespace, name, self.connect_timeout)?)
    }
}

/// A proxy for a whole remote interface.
pub trait RemoteProxy: Send + Sync + Sized {
    /// Signature the server dispatches against.
    fn interface() -> &'static InterfaceSignature;

    /// Build the proxy over a connected channel.
    fn from_channel(channel: ClientChannel) -> Self;

    /// The channel in use.
    fn channel(&self) -> &ClientChannel;
}

/// Remote sources of a per-session data pipe.
pub trait DataPipeSource: StartStop {
    /// Ask the server for a new data pipe called `name` and connect to it.
    fn create_data_pipe(&self, name: &str) -> AcqResult<UnixStream>;

    /// Ask the server to stop sending and close its data pipe.
    fn close_data_pipe(&self) -> AcqResult<()>;
}

/// Remote `StartStop`.
#[derive(Debug, Clone)]
pub struct RemoteStartStop {
    channel: ClientChannel,
}

impl RemoteStartStop {
    /// Proxy over `channel`.
    pub fn new(channel: ClientChannel) -> Self {
        Self { channel }
    }
}

impl StartStop for RemoteStartStop {
    fn start(&self) -> AcqResult<()> {
        self.channel.call(START, ())
    }

    fn stop(&self) -> AcqResult<()> {
        self.channel.call(STOP, ())
    }

    fn is_running(&self) -> AcqResult<bool> {
        self.channel.call(IS_RUNNING, ())
    }
}

/// Remote `OutputFileAndPipe`.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    channel: ClientChannel,
}

impl RemoteOutput {
    /// Proxy over `channel`.
    pub fn new(channel: ClientChannel) -> Self {
        Self { channel }
    }

    /// Have the server listen on a data pipe called `name`, then connect.
    pub fn create_data_pipe(&self, name: &str) -> AcqResult<UnixStream> {
        self.set_output_pipe(name)?;
        let stream = self.channel.connect_data_pipe(name)?;
        debug!(name, "data pipe connected");
        Ok(stream)
    }
}

impl OutputFileAndPipe for RemoteOutput {
    fn set_output_file(&self, path: &str) -> AcqResult<()> {
        self.channel.call(SET_OUTPUT_FILE, (path.to_string(),))
    }

    fn flush_output_file(&self) -> AcqResult<()> {
        self.channel.call(FLUSH_OUTPUT_FILE, ())
    }

    fn set_output_pipe(&self, name: &str) -> AcqResult<()> {
        self.channel.call(SET_OUTPUT_PIPE, (name.to_string(),))
    }
}

/// Remote `Camera`.
#[derive(Debug, Clone)]
pub struct RemoteCamera {
    start_stop: RemoteStartStop,
}

impl RemoteCamera {
    /// Proxy over `channel`.
    pub fn new(channel: ClientChannel) -> Self {
        Self {
            start_stop: RemoteStartStop::new(channel),
        }
    }

    fn channel(&self) -> &ClientChannel {
        &self.start_stop.channel
    }
}

impl StartStop for RemoteCamera {
    fn start(&self) -> AcqResult<()> {
        self.start_stop.start()
    }

    fn stop(&self) -> AcqResult<()> {
        self.start_stop.stop()
    }

    fn is_running(&self) -> AcqResult<bool> {
        self.start_stop.is_running()
    }
}

impl Camera for RemoteCamera {
    fn attributes(&self) -> AcqResult<CameraAttributes> {
        self.channel().call(ATTRIBUTES, ())
    }

    fn settings_static(&self) -> AcqResult<VideoSettingsStatic> {
        self.channel().call(SETTINGS_STATIC, ())
    }

    fn set_settings_static(&self, settings: VideoSettingsStatic) -> AcqResult<()> {
        self.channel().call(SET_SETTINGS_STATIC, (settings,))
    }

    fn settings_dynamic(&self) -> AcqResult<VideoSettingsDynamic> {
        self.channel().call(SETTINGS_DYNAMIC, ())
    }

    fn set_settings_dynamic(&self, settings: VideoSettingsDynamic) -> AcqResult<()> {
        self.channel().call(SET_SETTINGS_DYNAMIC, (settings,))
    }
}

/// Remote camera flow: camera plus outputs.
#[derive(Debug, Clone)]
pub struct RemoteCameraFlow {
    camera: RemoteCamera,
    output: RemoteOutput,
}

impl RemoteCameraFlow {
    /// The camera capability.
    #[must_use]
    pub fn camera(&self) -> &RemoteCamera {
        &self.camera
    }

    /// The output capability.
    #[must_use]
    pub fn output(&self) -> &RemoteOutput {
        &self.output
    }
}

impl RemoteProxy for RemoteCameraFlow {
    fn interface() -> &'static InterfaceSignature {
        &CAMERA_FLOW_SIGNATURE
    }

    fn from_channel(channel: ClientChannel) -> Self {
        Self {
            camera: RemoteCamera::new(channel.clone()),
            output: RemoteOutput::new(channel),
        }
    }

    fn channel(&self) -> &ClientChannel {
        &self.output.channel
    }
}

impl StartStop for RemoteCameraFlow {
    fn start(&self) -> AcqResult<()> {
        self.camera.start()
    }

    fn stop(&self) -> AcqResult<()> {
        self.camera.stop()
    }

    fn is_running(&self) -> AcqResult<bool> {
        self.camera.is_running()
    }
}

impl Camera for RemoteCameraFlow {
    fn attributes(&self) -> AcqResult<CameraAttributes> {
        self.camera.attributes()
    }

    fn settings_static(&self) -> AcqResult<VideoSettingsStatic> {
        self.camera.settings_static()
    }

    fn set_settings_static(&self, settings: VideoSettingsStatic) -> AcqResult<()> {
        self.camera.set_settings_static(settings)
    }

    fn settings_dynamic(&self) -> AcqResult<VideoSettingsDynamic> {
        self.camera.settings_dynamic()
    }

    fn set_settings_dynamic(&self, settings: VideoSettingsDynamic) -> AcqResult<()> {
        self.camera.set_settings_dynamic(settings)
    }
}

impl OutputFileAndPipe for RemoteCameraFlow {
    fn set_output_file(&self, path: &str) -> AcqResult<()> {
        self.output.set_output_file(path)
    }

    fn flush_output_file(&self) -> AcqResult<()> {
        self.output.flush_output_file()
    }

    fn set_output_pipe(&self, name: &str) -> AcqResult<()> {
        self.output.set_output_pipe(name)
    }
}

impl DataPipeSource for RemoteCameraFlow {
    fn create_data_pipe(&self, name: &str) -> AcqResult<UnixStream> {
        self.output.create_data_pipe(name)
    }

    fn close_data_pipe(&self) -> AcqResult<()> {
        self.output.set_output_pipe("")
    }
}
