//! One-client-at-a-time session server.
//!
//! # State Machine
//!
//! ```text
//! Idle → Listening → Handshaking → Serving ─┬→ Listening   (client closed, restart enabled)
//!            ↑            │                 └→ Terminated  (TerminateServer, cancel, no restart)
//!            └────────────┘ (handshake failed)
//! ```
//!
//! The control pipe is bound for each accept and released once a client is
//! connected, so a second client cannot connect while a session is served.
//! The flow object built for a session is disposed whenever the session ends,
//! whatever the reason.

use parking_lot::{Condvar, Mutex};
use std::io::{self, BufRead};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use acq_core::config::AcqConfig;
use acq_core::{AcqError, AcqResult, Dispose, DisposeGuard};
use acq_pool::CancelToken;

use crate::rpc::{MethodRegistry, RpcServer, SessionSignal};
use crate::semaphore::StartupSemaphore;
use crate::transport::{PipeListener, PipeNamespace};
use crate::wire::Messenger;

/// Server tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Frames in the hardware-facing ring buffer.
    pub ring_buffer_capacity: usize,
    /// Accept a new client after one disconnects.
    pub restart_on_disconnect: bool,
    /// Consecutive failed handshakes before `run` gives up.
    pub max_handshake_failures: u32,
    /// Accept and idle-read poll interval.
    pub poll_interval: Duration,
    /// How long a connected client has to send its handshake byte.
    pub handshake_timeout: Duration,
    /// Where pipes are created.
    pub namespace: PipeNamespace,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ring_buffer_capacity: 4,
            restart_on_disconnect: true,
            max_handshake_failures: 5,
            poll_interval: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(5),
            namespace: PipeNamespace::default(),
        }
    }
}

impl ServerOptions {
    /// Options from the `server` and `pipes` configuration sections.
    #[must_use]
    pub fn from_config(config: &AcqConfig) -> Self {
        Self {
            ring_buffer_capacity: config.server.ring_buffer_capacity,
            restart_on_disconnect: config.server.restart_on_disconnect,
            max_handshake_failures: config.server.max_handshake_failures,
            poll_interval: Duration::from_millis(config.server.poll_interval_ms),
            namespace: PipeNamespace::from_config(&config.pipes),
            ..Self::default()
        }
    }
}

/// Where the accept loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Not started.
    Idle = 0,
    /// Waiting for a client on the control pipe.
    Listening = 1,
    /// A client connected; exchanging handshake bytes.
    Handshaking = 2,
    /// Dispatching calls for one client.
    Serving = 3,
    /// The loop exited.
    Terminated = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Listening,
            2 => ServerState::Handshaking,
            3 => ServerState::Serving,
            4 => ServerState::Terminated,
            _ => ServerState::Idle,
        }
    }
}

/// Why [`DataServer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// A client sent `TerminateServer`.
    Terminated,
    /// The cancellation token fired or the server was disposed.
    Cancelled,
    /// A client left and restart is disabled.
    Disconnected,
}

/// Builds the flow object for one session.
pub type FlowFactory<I> = Box<dyn Fn(&ServerOptions) -> AcqResult<Arc<I>> + Send + Sync>;

/// Serves an interface `I` to one client at a time.
pub struct DataServer<I: ?Sized + Dispose + 'static> {
    registry: Arc<MethodRegistry<I>>,
    factory: FlowFactory<I>,
    options: ServerOptions,
    state: AtomicU8,
    latest_flow: Mutex<Option<Arc<I>>>,
    object_cancel: CancelToken,
    ready: Mutex<bool>,
    ready_changed: Condvar,
    guard: DisposeGuard,
}

impl<I: ?Sized + Dispose + 'static> DataServer<I> {
    /// Server dispatching through `registry` onto flows built by `factory`.
    pub fn new<F>(registry: MethodRegistry<I>, factory: F, options: ServerOptions) -> Self
    where
        F: Fn(&ServerOptions) -> AcqResult<Arc<I>> + Send + Sync + 'static,
    {
        Self {
            registry: Arc::new(registry),
            factory: Box::new(factory),
            options,
            state: AtomicU8::new(ServerState::Idle as u8),
            latest_flow: Mutex::new(None),
            object_cancel: CancelToken::new(),
            ready: Mutex::new(false),
            ready_changed: Condvar::new(),
            guard: DisposeGuard::new(),
        }
    }

    /// Current loop state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Options in use.
    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// The flow of the session being served, if any.
    #[must_use]
    pub fn latest_flow(&self) -> Option<Arc<I>> {
        self.latest_flow.lock().clone()
    }

    /// Wait until the control pipe first listens.
    #[must_use]
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock();
        while !*ready {
            if self.ready_changed.wait_until(&mut ready, deadline).timed_out() {
                return *ready;
            }
        }
        true
    }

    /// Accept and serve clients on `coordination_name` until terminated,
    /// cancelled or, without restart, disconnected.
    ///
    /// Failing to bind the control pipe and repeated handshake failures are
    /// returned as errors. A session whose flow cannot be built is dropped
    /// and the loop keeps accepting.
    pub fn run(&self, coordination_name: &str, cancel: &CancelToken) -> AcqResult<ServerExit> {
        let exit = self.accept_loop(coordination_name, cancel);
        self.set_state(ServerState::Terminated);
        match &exit {
            Ok(reason) => info!(coordination_name, ?reason, "session server stopped"),
            Err(e) => error!(coordination_name, error = %e, "session server failed"),
        }
        exit
    }

    fn accept_loop(&self, coordination_name: &str, cancel: &CancelToken) -> AcqResult<ServerExit> {
        let mut first_iteration = true;
        let mut handshake_failures = 0u32;
        loop {
            if self.cancelled(cancel) {
                return Ok(ServerExit::Cancelled);
            }
            self.set_state(ServerState::Listening);
            let listener = PipeListener::bind(&self.options.namespace, coordination_name)?;
            if first_iteration {
                first_iteration = false;
                match StartupSemaphore::release_existing(coordination_name) {
                    Ok(true) => info!(coordination_name, "startup semaphore released"),
                    Ok(false) => debug!(coordination_name, "no launcher waiting"),
                    Err(e) => warn!(coordination_name, error = %e, "startup semaphore release failed"),
                }
                self.signal_ready();
            }
            info!(coordination_name, "waiting for client");
            let stream = match listener
                .accept_until(&[cancel, &self.object_cancel], self.options.poll_interval)?
            {
                Some(stream) => stream,
                None => return Ok(ServerExit::Cancelled),
            };
            drop(listener);

            self.set_state(ServerState::Handshaking);
            if let Err(e) = self.handshake(&stream) {
                handshake_failures += 1;
                warn!(error = %e, failures = handshake_failures, "client handshake failed");
                if handshake_failures >= self.options.max_handshake_failures {
                    return Err(AcqError::Protocol(format!(
                        "{handshake_failures} consecutive handshake failures, last: {e}"
                    )));
                }
                continue;
            }
            handshake_failures = 0;

            let flow = match (self.factory)(&self.options) {
                Ok(flow) => flow,
                Err(e) => {
                    warn!(
                        coordination_name,
                        error = %e,
                        "could not build session flow, dropping client"
                    );
                    drop(stream);
                    continue;
                }
            };
            *self.latest_flow.lock() = Some(Arc::clone(&flow));
            self.set_state(ServerState::Serving);
            info!(coordination_name, "client connected");
            let signal = {
                let _teardown = SessionTeardown {
                    server: self,
                    flow: &flow,
                };
                self.serve(stream, Arc::clone(&flow), cancel)
            };

            match signal {
                SessionSignal::Terminate => return Ok(ServerExit::Terminated),
                _ if self.cancelled(cancel) => return Ok(ServerExit::Cancelled),
                _ if !self.options.restart_on_disconnect => return Ok(ServerExit::Disconnected),
                _ => info!(coordination_name, "client disconnected, restarting"),
            }
        }
    }

    fn serve(&self, stream: UnixStream, flow: Arc<I>, cancel: &CancelToken) -> SessionSignal {
        let mut server = RpcServer::new(
            stream,
            Arc::clone(&self.registry),
            flow,
            self.options.poll_interval,
        );
        loop {
            if self.cancelled(cancel) {
                return SessionSignal::Disconnect;
            }
            match server.process_message() {
                SessionSignal::Continue => {}
                signal => return signal,
            }
        }
    }

    fn handshake(&self, stream: &UnixStream) -> AcqResult<()> {
        stream.set_read_timeout(Some(self.options.handshake_timeout))?;
        Messenger::new(stream)
            .server_handshake()
            .map_err(|e| AcqError::Protocol(e.to_string()))?;
        stream.set_read_timeout(None)?;
        Ok(())
    }

    fn cancelled(&self, cancel: &CancelToken) -> bool {
        cancel.is_cancelled() || self.object_cancel.is_cancelled()
    }

    fn set_state(&self, state: ServerState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!(from = ?ServerState::from_u8(previous), to = ?state, "server state");
        }
    }

    fn signal_ready(&self) {
        let mut ready = self.ready.lock();
        *ready = true;
        self.ready_changed.notify_all();
    }
}

impl<I: ?Sized + Dispose + 'static> DataServer<I> {
    /// Run the server on a background thread named `data-server`.
    ///
    /// With `block_until_ready`, returns once the control pipe listens or the
    /// loop has already exited.
    pub fn launch(
        self: &Arc<Self>,
        coordination_name: &str,
        cancel: CancelToken,
        block_until_ready: bool,
    ) -> AcqResult<ServerHandle> {
        let server = Arc::clone(self);
        let name = coordination_name.to_string();
        let thread_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("data-server".into())
            .spawn(move || server.run(&name, &thread_cancel))?;
        if block_until_ready {
            while !self.wait_ready(self.options.poll_interval) {
                if thread.is_finished() {
                    break;
                }
            }
        }
        Ok(ServerHandle {
            thread: Some(thread),
            cancel,
        })
    }
}

impl<I: ?Sized + Dispose + 'static> Dispose for DataServer<I> {
    fn dispose(&self) {
        if !self.guard.begin() {
            return;
        }
        self.object_cancel.cancel();
        if let Some(flow) = self.latest_flow.lock().take() {
            flow.dispose();
        }
        debug!("session server disposed");
    }

    fn is_disposed(&self) -> bool {
        self.guard.is_disposed()
    }
}

impl<I: ?Sized + Dispose + 'static> std::fmt::Debug for DataServer<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataServer")
            .field("state", &self.state())
            .field("options", &self.options)
            .finish()
    }
}

/// Disposes the session's flow when the session ends, including by unwind.
struct SessionTeardown<'a, I: ?Sized + Dispose + 'static> {
    server: &'a DataServer<I>,
    flow: &'a Arc<I>,
}

impl<I: ?Sized + Dispose + 'static> Drop for SessionTeardown<'_, I> {
    fn drop(&mut self) {
        self.flow.dispose();
        let mut latest = self.server.latest_flow.lock();
        if latest.as_ref().is_some_and(|f| Arc::ptr_eq(f, self.flow)) {
            *latest = None;
        }
        debug!("session flow disposed");
    }
}

/// A server running on its own thread.
///
/// Dropping the handle cancels the server and waits for it.
#[derive(Debug)]
pub struct ServerHandle {
    thread: Option<JoinHandle<AcqResult<ServerExit>>>,
    cancel: CancelToken,
}

impl ServerHandle {
    /// Ask the accept loop to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the server thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the server thread and return its exit reason.
    pub fn join(mut self) -> AcqResult<ServerExit> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> AcqResult<ServerExit> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| AcqError::InvalidState("session server thread panicked".into()))?,
            None => Ok(ServerExit::Cancelled),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel.cancel();
            if let Err(e) = self.join_inner() {
                warn!(error = %e, "session server ended with an error");
            }
        }
    }
}

/// Run `server` on the calling thread until a line is read from stdin,
/// `cancel` fires, or a client terminates it; then dispose it.
///
/// End of input on stdin does not stop the server, so it can run detached
/// from a terminal.
pub fn standalone_server_main<I: ?Sized + Dispose + 'static>(
    server: &DataServer<I>,
    coordination_name: &str,
    cancel: &CancelToken,
) -> AcqResult<ServerExit> {
    let stdin_cancel = cancel.clone();
    std::thread::Builder::new()
        .name("stdin-watch".into())
        .spawn(move || {
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(0) => debug!("stdin closed; waiting for cancellation or termination"),
                Ok(_) => {
                    info!("key press received, shutting down");
                    stdin_cancel.cancel();
                }
                Err(e) => debug!(error = %e, "stdin unavailable"),
            }
        })?;
    info!(coordination_name, "server running; press Enter to stop");
    let exit = server.run(coordination_name, cancel);
    server.dispose();
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{InterfaceSignature, RpcClient, RpcError};
    use crate::transport::connect;
    use acq_core::StartStop;
    use once_cell::sync::Lazy;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct Toggle {
        running: AtomicBool,
        disposals: Arc<AtomicUsize>,
        guard: DisposeGuard,
    }

    impl StartStop for Toggle {
        fn start(&self) -> AcqResult<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) -> AcqResult<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> AcqResult<bool> {
            Ok(self.running.load(Ordering::SeqCst))
        }
    }

    impl Dispose for Toggle {
        fn dispose(&self) {
            if self.guard.begin() {
                self.disposals.fetch_add(1, Ordering::SeqCst);
            }
        }
        fn is_disposed(&self) -> bool {
            self.guard.is_disposed()
        }
    }

    fn registry() -> MethodRegistry<Toggle> {
        let mut registry = MethodRegistry::new();
        crate::rpc::register_start_stop(&mut registry);
        registry
    }

    static TOGGLE_SIGNATURE: Lazy<InterfaceSignature> = Lazy::new(|| registry().into_signature());

    fn server(dir: &std::path::Path, restart: bool) -> (Arc<DataServer<Toggle>>, Arc<AtomicUsize>) {
        let disposals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposals);
        let options = ServerOptions {
            restart_on_disconnect: restart,
            poll_interval: Duration::from_millis(10),
            namespace: PipeNamespace::new(dir),
            ..ServerOptions::default()
        };
        let server = DataServer::new(
            registry(),
            move |_: &ServerOptions| {
                Ok(Arc::new(Toggle {
                    disposals: Arc::clone(&counter),
                    ..Toggle::default()
                }))
            },
            options,
        );
        (Arc::new(server), disposals)
    }

    fn client(dir: &std::path::Path) -> RpcClient {
        let stream = connect(&PipeNamespace::new(dir), "toggle", Duration::from_secs(2)).unwrap();
        RpcClient::connect(stream, &TOGGLE_SIGNATURE).unwrap()
    }

    #[test]
    fn test_call_round_trip_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (server, disposals) = server(dir.path(), true);
        let handle = server.launch("toggle", CancelToken::new(), true).unwrap();

        let first = client(dir.path());
        first.call::<_, ()>("start", ()).unwrap();
        assert!(first.call::<_, bool>("is_running", ()).unwrap());
        first.dispose();

        let second = client(dir.path());
        assert!(!second.call::<_, bool>("is_running", ()).unwrap());
        second.dispose();

        handle.cancel();
        assert_eq!(handle.join().unwrap(), ServerExit::Cancelled);
        assert_eq!(disposals.load(Ordering::SeqCst), 2);
        assert_eq!(server.state(), ServerState::Terminated);
    }

    #[test]
    fn test_terminate_stops_accept_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (server, disposals) = server(dir.path(), true);
        let handle = server.launch("toggle", CancelToken::new(), true).unwrap();
        let rpc = client(dir.path());
        rpc.set_terminate_on_dispose(true);
        rpc.dispose();
        assert_eq!(handle.join().unwrap(), ServerExit::Terminated);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert!(!PipeNamespace::new(dir.path()).path_for("toggle").exists());
    }

    #[test]
    fn test_no_restart_exits_after_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path(), false);
        let handle = server.launch("toggle", CancelToken::new(), true).unwrap();
        client(dir.path()).dispose();
        assert_eq!(handle.join().unwrap(), ServerExit::Disconnected);
    }

    #[test]
    fn test_repeated_bad_handshakes_fail_the_server() {
        use std::io::{Read, Write};
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path(), true);
        let handle = server.launch("toggle", CancelToken::new(), true).unwrap();
        let ns = PipeNamespace::new(dir.path());
        for _ in 0..5 {
            let mut stream = connect(&ns, "toggle", Duration::from_secs(2)).unwrap();
            stream.write_all(&[0x04]).unwrap();
            let _ = stream.read(&mut [0u8; 1]);
        }
        assert!(matches!(handle.join(), Err(AcqError::Protocol(_))));
    }

    #[test]
    fn test_factory_failure_drops_only_that_client() {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let options = ServerOptions {
            poll_interval: Duration::from_millis(10),
            namespace: PipeNamespace::new(dir.path()),
            ..ServerOptions::default()
        };
        let server = Arc::new(DataServer::new(
            registry(),
            move |_: &ServerOptions| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(AcqError::Hardware("camera not found".into()));
                }
                Ok(Arc::new(Toggle::default()))
            },
            options,
        ));
        let handle = server.launch("toggle", CancelToken::new(), true).unwrap();

        let ns = PipeNamespace::new(dir.path());
        let stream = connect(&ns, "toggle", Duration::from_secs(2)).unwrap();
        let first = RpcClient::connect(stream, &TOGGLE_SIGNATURE).unwrap();
        assert!(first.call::<_, bool>("is_running", ()).is_err());
        first.dispose();

        let second = client(dir.path());
        second.call::<_, ()>("start", ()).unwrap();
        assert!(second.call::<_, bool>("is_running", ()).unwrap());
        second.dispose();

        assert!(!handle.is_finished());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        handle.cancel();
        assert_eq!(handle.join().unwrap(), ServerExit::Cancelled);
    }

    #[test]
    fn test_unknown_method_then_double_dispose() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = server(dir.path(), true);
        let _handle = server.launch("toggle", CancelToken::new(), true).unwrap();
        let rpc = client(dir.path());
        assert!(matches!(
            rpc.call::<_, ()>("explode", ()),
            Err(RpcError::SignatureMismatch(_)) | Err(RpcError::Communication(_))
        ));
        server.dispose();
        server.dispose();
        assert!(server.is_disposed());
    }
}
