//! Connected remote flow plus its streaming reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use acq_core::config::AcqConfig;
use acq_core::{AcqError, AcqResult, Dispose, DisposeGuard, Frame, Subscriber, SubscriptionHandle};
use serde::de::DeserializeOwned;

use super::proxy::{ClientChannel, DataPipeSource, RemoteProxy};
use super::streaming::{ReaderState, StreamingReader};
use crate::rpc::{RpcClient, RpcError};
use crate::transport::{connect, PipeNamespace};

/// Shown when the control pipe cannot be reached.
pub const CONNECT_FAILURE_MESSAGE: &str = "Error connecting to remote service. Check that the \
     server application is running, and that any hardware it depends on is powered on.";

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// How a client finds and connects to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Where pipes are resolved.
    pub namespace: PipeNamespace,
    /// How long to wait for a pipe to accept.
    pub connect_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            namespace: PipeNamespace::default(),
            connect_timeout: Duration::from_secs(1),
        }
    }
}

impl ClientOptions {
    /// Options from the `pipes` configuration section.
    #[must_use]
    pub fn from_config(config: &AcqConfig) -> Self {
        Self {
            namespace: PipeNamespace::from_config(&config.pipes),
            connect_timeout: Duration::from_millis(config.pipes.connect_timeout_ms),
        }
    }
}

/// A remote flow proxy together with the reader for its data pipe.
///
/// `start` opens a fresh session pipe and starts the remote flow; `stop`
/// closes the pipe and stops the flow. Disposal tears down the reader, then
/// the control pipe, optionally telling the server process to exit.
pub struct PipeReader<P, T = Frame>
where
    P: RemoteProxy + DataPipeSource + 'static,
    T: DeserializeOwned + Send + Sync + 'static,
{
    proxy: Arc<P>,
    reader: StreamingReader<T, P>,
    rpc: Arc<RpcClient>,
    coordination_name: String,
    instance: u64,
    guard: DisposeGuard,
}

impl<P, T> PipeReader<P, T>
where
    P: RemoteProxy + DataPipeSource + 'static,
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Connect to the server published under `coordination_name`.
    pub fn connect(coordination_name: &str, options: &ClientOptions) -> AcqResult<Self> {
        let rpc = open_control_pipe(coordination_name, options, P::interface())
            .map_err(|e| {
                warn!(coordination_name, error = %e, "control pipe connection failed");
                AcqError::Communication(format!("{CONNECT_FAILURE_MESSAGE} ({e})"))
            })?;
        let rpc = Arc::new(rpc);
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let channel = ClientChannel::new(
            Arc::clone(&rpc),
            options.namespace.clone(),
            options.connect_timeout,
        );
        let proxy = Arc::new(P::from_channel(channel));
        let reader = StreamingReader::new(Arc::clone(&proxy), coordination_name, instance)?;
        info!(coordination_name, instance, "connected to remote flow");
        Ok(Self {
            proxy,
            reader,
            rpc,
            coordination_name: coordination_name.to_string(),
            instance,
            guard: DisposeGuard::new(),
        })
    }

    /// The remote flow.
    #[must_use]
    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    /// Coordination name this reader connected to.
    #[must_use]
    pub fn coordination_name(&self) -> &str {
        &self.coordination_name
    }

    /// Process-unique reader number used in session pipe names.
    #[must_use]
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Current streaming state.
    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.reader.state()
    }

    /// Whether a streaming session is open.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.reader.is_running()
    }

    /// Items delivered to subscribers so far.
    #[must_use]
    pub fn items_read(&self) -> u64 {
        self.reader.items_read()
    }

    /// Register `callback` for every item read.
    pub fn subscribe(&self, callback: Subscriber<T>) -> SubscriptionHandle {
        self.reader.subscribe(callback)
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.reader.unsubscribe(handle)
    }

    /// Open a session pipe and start the remote flow.
    pub fn start(&self) -> AcqResult<()> {
        self.guard.ensure_not_disposed("pipe reader")?;
        self.reader.start()
    }

    /// Close the session pipe and stop the remote flow.
    pub fn stop(&self) -> AcqResult<()> {
        self.guard.ensure_not_disposed("pipe reader")?;
        self.reader.stop()
    }

    /// Whether disposing this reader terminates the server process.
    #[must_use]
    pub fn terminate_server_on_stop(&self) -> bool {
        self.rpc.terminate_on_dispose()
    }

    /// Make disposal send `TerminateServer` instead of `Close`.
    pub fn set_terminate_server_on_stop(&self, terminate: bool) {
        self.rpc.set_terminate_on_dispose(terminate);
    }
}

fn open_control_pipe(
    coordination_name: &str,
    options: &ClientOptions,
    signature: &'static crate::rpc::InterfaceSignature,
) -> Result<RpcClient, RpcError> {
    let stream = connect(&options.namespace, coordination_name, options.connect_timeout)
        .map_err(|e| RpcError::Communication(e.to_string()))?;
    RpcClient::connect(stream, signature)
}

impl<P, T> Dispose for PipeReader<P, T>
where
    P: RemoteProxy + DataPipeSource + 'static,
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn dispose(&self) {
        if !self.guard.begin() {
            return;
        }
        self.reader.dispose();
        self.rpc.dispose();
        info!(
            coordination_name = %self.coordination_name,
            instance = self.instance,
            "pipe reader disposed"
        );
    }

    fn is_disposed(&self) -> bool {
        self.guard.is_disposed()
    }
}

impl<P, T> Drop for PipeReader<P, T>
where
    P: RemoteProxy + DataPipeSource + 'static,
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<P, T> std::fmt::Debug for PipeReader<P, T>
where
    P: RemoteProxy + DataPipeSource + 'static,
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeReader")
            .field("coordination_name", &self.coordination_name)
            .field("instance", &self.instance)
            .field("state", &self.reader.state())
            .finish()
    }
}
