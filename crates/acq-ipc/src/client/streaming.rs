//! Background reader for per-session data pipes.
//!
//! # State Machine
//!
//! ```text
//! NotReady → Idle → ReadPending → Reading → InCallback ─┐
//!             ↑         ↑                               │
//!             │         └───────────────────────────────┘
//!             └── RequestStop ← (stop from ReadPending, Reading or InCallback)
//!
//! any → Disposed
//! ```
//!
//! Every transition is a compare-and-swap from an expected state. A failed
//! swap means another thread asked the reader to stop, and the read loop
//! unwinds without delivering further items.
//!
//! `start`, `stop` and `dispose` run one at a time under a lifecycle lock,
//! so a caller that sees `is_running() == false` can always start again.

use parking_lot::{Condvar, Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use acq_core::{AcqError, AcqResult, Dispose, DisposeGuard, Subscriber, SubscriptionHandle};

use super::proxy::DataPipeSource;
use crate::transport::session_pipe_name;
use crate::wire::read_framed;

const SESSION_CHANGE_TIMEOUT: Duration = Duration::from_secs(10);
const DISPOSE_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Where the reader thread is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    /// Thread not started yet.
    NotReady = 0,
    /// Waiting for `start`.
    Idle = 1,
    /// About to read the next item.
    ReadPending = 10,
    /// Blocked reading the data pipe.
    Reading = 11,
    /// Delivering an item to subscribers.
    InCallback = 20,
    /// Stop requested; the session is unwinding.
    RequestStop = 100,
    /// Torn down.
    Disposed = 0xFF,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotReady,
            1 => Self::Idle,
            10 => Self::ReadPending,
            11 => Self::Reading,
            20 => Self::InCallback,
            100 => Self::RequestStop,
            _ => Self::Disposed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Dispose,
}

#[derive(Debug, Default)]
struct SessionStatus {
    generation: u64,
    running: bool,
    error: Option<AcqError>,
}

struct ReaderShared<T, P> {
    source: Arc<P>,
    coordination_name: String,
    instance: u64,
    state: AtomicU8,
    subscribers: RwLock<Vec<(SubscriptionHandle, Subscriber<T>)>>,
    command: Mutex<Option<Command>>,
    command_ready: Condvar,
    session: Mutex<SessionStatus>,
    session_changed: Condvar,
    active: Mutex<Option<UnixStream>>,
    disposing: AtomicBool,
    sessions: AtomicU64,
    items_read: AtomicU64,
}

impl<T, P> ReaderShared<T, P>
where
    T: DeserializeOwned + Send + Sync + 'static,
    P: DataPipeSource + 'static,
{
    fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn try_switch(&self, from: ReaderState, to: ReaderState) -> bool {
        match self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                trace!(?from, ?to, "reader state");
                true
            }
            Err(actual) => {
                let actual = ReaderState::from_u8(actual);
                if !matches!(actual, ReaderState::RequestStop | ReaderState::Disposed) {
                    warn!(?from, ?to, ?actual, "unexpected streaming reader state");
                }
                false
            }
        }
    }

    fn request_stop(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match ReaderState::from_u8(s) {
                    ReaderState::ReadPending | ReaderState::Reading | ReaderState::InCallback => {
                        Some(ReaderState::RequestStop as u8)
                    }
                    _ => None,
                }
            });
    }

    fn post(&self, command: Command) {
        let mut slot = self.command.lock();
        if *slot != Some(Command::Dispose) {
            *slot = Some(command);
        }
        self.command_ready.notify_one();
    }

    /// Drop a start request the reader thread never picked up.
    fn withdraw_start(&self) {
        let mut slot = self.command.lock();
        if *slot == Some(Command::Start) {
            *slot = None;
        }
    }

    fn next_command(&self) -> Command {
        let mut slot = self.command.lock();
        loop {
            if let Some(command) = slot.take() {
                return command;
            }
            self.command_ready.wait(&mut slot);
        }
    }

    fn shutdown_active(&self) {
        if let Some(stream) = self.active.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn publish_session(&self, running: bool, error: Option<AcqError>) {
        let mut session = self.session.lock();
        session.running = running;
        session.error = error;
        session.generation += 1;
        self.session_changed.notify_all();
    }

    /// Wait until the session generation moves past `generation`.
    fn wait_session_change(
        &self,
        generation: u64,
        timeout: Duration,
    ) -> Option<Option<AcqError>> {
        let deadline = Instant::now() + timeout;
        let mut session = self.session.lock();
        while session.generation == generation {
            if self
                .session_changed
                .wait_until(&mut session, deadline)
                .timed_out()
            {
                return None;
            }
        }
        Some(session.error.take())
    }

    fn run(&self) {
        self.try_switch(ReaderState::NotReady, ReaderState::Idle);
        loop {
            match self.next_command() {
                Command::Start => self.run_session(),
                Command::Dispose => break,
            }
        }
        self.state
            .store(ReaderState::Disposed as u8, Ordering::Release);
        self.publish_session(false, None);
        debug!(instance = self.instance, "streaming reader exited");
    }

    fn run_session(&self) {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed);
        let name = session_pipe_name(&self.coordination_name, self.instance, session);
        let mut stream = match self.source.create_data_pipe(&name) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(pipe = %name, error = %e, "could not open data pipe");
                self.publish_session(false, Some(e));
                return;
            }
        };
        {
            let mut active = self.active.lock();
            if self.disposing.load(Ordering::Acquire) {
                drop(active);
                self.publish_session(false, Some(AcqError::Disposed("streaming reader".into())));
                return;
            }
            match stream.try_clone() {
                Ok(clone) => *active = Some(clone),
                Err(e) => {
                    drop(active);
                    let _ = self.source.close_data_pipe();
                    self.publish_session(false, Some(e.into()));
                    return;
                }
            }
        }
        if !self.try_switch(ReaderState::Idle, ReaderState::ReadPending) {
            self.end_session(stream, &name);
            return;
        }
        info!(pipe = %name, "streaming session started");
        self.publish_session(true, None);

        let mut scratch = Vec::new();
        loop {
            if !self.try_switch(ReaderState::ReadPending, ReaderState::Reading) {
                break;
            }
            match read_framed::<_, T>(&mut stream, &mut scratch) {
                Ok(Some(item)) => {
                    if !self.try_switch(ReaderState::Reading, ReaderState::InCallback) {
                        break;
                    }
                    self.deliver(&item);
                    if !self.try_switch(ReaderState::InCallback, ReaderState::ReadPending) {
                        break;
                    }
                }
                Ok(None) => {
                    if self.state() != ReaderState::RequestStop {
                        info!(pipe = %name, "data pipe closed by server");
                    }
                    break;
                }
                Err(e) => {
                    if self.state() == ReaderState::RequestStop {
                        debug!(pipe = %name, error = %e, "read interrupted by stop");
                    } else {
                        warn!(pipe = %name, error = %e, "data pipe read failed");
                    }
                    break;
                }
            }
        }
        self.end_session(stream, &name);
    }

    fn end_session(&self, stream: UnixStream, name: &str) {
        self.shutdown_active();
        drop(stream);
        let disposing = self.disposing.load(Ordering::Acquire);
        if !disposing {
            if let Err(e) = self.source.close_data_pipe() {
                debug!(pipe = %name, error = %e, "closing data pipe failed");
            }
        }
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                match ReaderState::from_u8(s) {
                    ReaderState::Disposed => None,
                    _ if disposing => None,
                    _ => Some(ReaderState::Idle as u8),
                }
            });
        info!(pipe = %name, "streaming session ended");
        self.publish_session(false, None);
    }

    fn deliver(&self, item: &T) {
        self.items_read.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.subscribers.read().clone();
        for (handle, callback) in &subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(item))).is_err() {
                error!(subscription = handle.0, "subscriber panicked");
            }
        }
    }
}

/// Reads items from a remote source's data pipe on a background thread and
/// hands each one to the registered subscribers, in registration order.
///
/// Each `start` opens a fresh data pipe named
/// `<coordination>.data.<instance>.<session>` before the remote source is
/// started; each `stop` tears that pipe down before the source is stopped.
pub struct StreamingReader<T, P> {
    shared: Arc<ReaderShared<T, P>>,
    lifecycle: Mutex<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
    guard: DisposeGuard,
}

impl<T, P> StreamingReader<T, P>
where
    T: DeserializeOwned + Send + Sync + 'static,
    P: DataPipeSource + 'static,
{
    /// Reader for `source`; `instance` distinguishes readers sharing a
    /// coordination name.
    pub fn new(source: Arc<P>, coordination_name: &str, instance: u64) -> AcqResult<Self> {
        let shared = Arc::new(ReaderShared {
            source,
            coordination_name: coordination_name.to_string(),
            instance,
            state: AtomicU8::new(ReaderState::NotReady as u8),
            subscribers: RwLock::new(Vec::new()),
            command: Mutex::new(None),
            command_ready: Condvar::new(),
            session: Mutex::new(SessionStatus::default()),
            session_changed: Condvar::new(),
            active: Mutex::new(None),
            disposing: AtomicBool::new(false),
            sessions: AtomicU64::new(0),
            items_read: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("streaming-reader".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            shared,
            lifecycle: Mutex::new(()),
            thread: Mutex::new(Some(thread)),
            guard: DisposeGuard::new(),
        })
    }

    /// The remote source.
    #[must_use]
    pub fn source(&self) -> &Arc<P> {
        &self.shared.source
    }

    /// Current reader state.
    #[must_use]
    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.session.lock().running
    }

    /// Sessions opened so far, including failed attempts.
    #[must_use]
    pub fn sessions_started(&self) -> u64 {
        self.shared.sessions.load(Ordering::Relaxed)
    }

    /// Items delivered so far.
    #[must_use]
    pub fn items_read(&self) -> u64 {
        self.shared.items_read.load(Ordering::Relaxed)
    }

    /// Register `callback` for every item read.
    pub fn subscribe(&self, callback: Subscriber<T>) -> SubscriptionHandle {
        let handle = SubscriptionHandle::next();
        self.shared.subscribers.write().push((handle, callback));
        handle
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.shared.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(h, _)| *h != handle);
        subscribers.len() != before
    }

    /// Open a new data pipe, then start the remote source.
    pub fn start(&self) -> AcqResult<()> {
        let _lifecycle = self.lifecycle.lock();
        self.guard.ensure_not_disposed("streaming reader")?;
        let generation = {
            let session = self.shared.session.lock();
            if session.running {
                return Err(AcqError::InvalidState(
                    "streaming reader is already running".into(),
                ));
            }
            session.generation
        };
        let state = self.state();
        if !matches!(state, ReaderState::NotReady | ReaderState::Idle) {
            return Err(AcqError::InvalidState(format!(
                "streaming reader cannot start while {state:?}"
            )));
        }
        self.shared.post(Command::Start);
        match self
            .shared
            .wait_session_change(generation, SESSION_CHANGE_TIMEOUT)
        {
            None => {
                self.shared.withdraw_start();
                return Err(AcqError::Communication(
                    "timed out opening the data pipe".into(),
                ))
            }
            Some(Some(e)) => return Err(e),
            Some(None) => {}
        }
        if let Err(e) = self.shared.source.start() {
            warn!(error = %e, "remote start failed, closing session");
            self.end_session();
            return Err(e);
        }
        Ok(())
    }

    /// Close the data pipe, then stop the remote source.
    pub fn stop(&self) -> AcqResult<()> {
        let _lifecycle = self.lifecycle.lock();
        self.guard.ensure_not_disposed("streaming reader")?;
        self.end_session();
        self.shared.source.stop()
    }

    fn end_session(&self) {
        let generation = {
            let session = self.shared.session.lock();
            session.running.then_some(session.generation)
        };
        let Some(generation) = generation else {
            return;
        };
        self.shared.request_stop();
        self.shared.shutdown_active();
        if self
            .shared
            .wait_session_change(generation, SESSION_CHANGE_TIMEOUT)
            .is_none()
        {
            warn!("streaming reader did not leave its session in time");
        }
    }

    fn join_thread(&self, last: ReaderState) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if last != ReaderState::Reading {
            if handle.join().is_err() {
                error!("streaming reader thread panicked");
            }
            return;
        }
        let deadline = Instant::now() + DISPOSE_JOIN_TIMEOUT;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("streaming reader still blocked in a read, detaching it");
                return;
            }
            std::thread::sleep(JOIN_POLL);
        }
        if handle.join().is_err() {
            error!("streaming reader thread panicked");
        }
    }
}

impl<T, P> Dispose for StreamingReader<T, P>
where
    T: DeserializeOwned + Send + Sync + 'static,
    P: DataPipeSource + 'static,
{
    fn dispose(&self) {
        let _lifecycle = self.lifecycle.lock();
        if !self.guard.begin() {
            return;
        }
        let last = self.state();
        self.shared.disposing.store(true, Ordering::Release);
        self.shared.request_stop();
        self.shared.post(Command::Dispose);
        self.shared.shutdown_active();
        self.join_thread(last);
        self.shared
            .state
            .store(ReaderState::Disposed as u8, Ordering::Release);
        self.shared.subscribers.write().clear();
        debug!(instance = self.shared.instance, "streaming reader disposed");
    }

    fn is_disposed(&self) -> bool {
        self.guard.is_disposed()
    }
}

impl<T, P> Drop for StreamingReader<T, P> {
    fn drop(&mut self) {
        if self.guard.begin() {
            self.shared.disposing.store(true, Ordering::Release);
            {
                let mut slot = self.shared.command.lock();
                *slot = Some(Command::Dispose);
                self.shared.command_ready.notify_one();
            }
            if let Some(stream) = self.shared.active.lock().take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl<T, P> std::fmt::Debug for StreamingReader<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingReader")
            .field("coordination_name", &self.shared.coordination_name)
            .field("instance", &self.shared.instance)
            .field(
                "state",
                &ReaderState::from_u8(self.shared.state.load(Ordering::Acquire)),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::write_framed;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct PairSource {
        server_end: Mutex<Option<UnixStream>>,
        names: Mutex<Vec<String>>,
        running: AtomicBool,
        closes: AtomicUsize,
        refuse_pipe: AtomicBool,
    }

    impl PairSource {
        fn send(&self, value: u64) -> bool {
            let mut slot = self.server_end.lock();
            let Some(stream) = slot.as_mut() else {
                return false;
            };
            write_framed(stream, &value, &mut Vec::new()).is_ok()
        }

        fn hang_up(&self) {
            self.server_end.lock().take();
        }
    }

    impl acq_core::StartStop for PairSource {
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

    impl DataPipeSource for PairSource {
        fn create_data_pipe(&self, name: &str) -> AcqResult<UnixStream> {
            if self.refuse_pipe.load(Ordering::SeqCst) {
                return Err(AcqError::Communication("no pipe".into()));
            }
            let (client, server) = UnixStream::pair()?;
            *self.server_end.lock() = Some(server);
            self.names.lock().push(name.to_string());
            Ok(client)
        }

        fn close_data_pipe(&self) -> AcqResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.server_end.lock().take();
            Ok(())
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn reader() -> (StreamingReader<u64, PairSource>, Arc<PairSource>) {
        let source = Arc::new(PairSource::default());
        let reader = StreamingReader::new(Arc::clone(&source), "Test.Reader", 3).unwrap();
        (reader, source)
    }

    #[test]
    fn test_start_delivers_then_stop_closes_session() {
        let (reader, source) = reader();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reader.subscribe(Arc::new(move |v: &u64| sink.lock().push(*v)));

        reader.start().unwrap();
        assert!(reader.is_running());
        assert!(source.running.load(Ordering::SeqCst));
        assert_eq!(source.names.lock()[0], "Test.Reader.data.3.0");

        for v in 0..5 {
            assert!(source.send(v));
        }
        assert!(wait_for(|| seen.lock().len() == 5));
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);

        reader.stop().unwrap();
        assert!(!reader.is_running());
        assert_eq!(reader.state(), ReaderState::Idle);
        assert!(!source.running.load(Ordering::SeqCst));
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);

        reader.start().unwrap();
        assert_eq!(source.names.lock()[1], "Test.Reader.data.3.1");
        reader.dispose();
    }

    #[test]
    fn test_server_hang_up_returns_to_idle() {
        let (reader, source) = reader();
        reader.start().unwrap();
        source.hang_up();
        assert!(wait_for(|| !reader.is_running()));
        assert_eq!(reader.state(), ReaderState::Idle);
        reader.start().unwrap();
        assert!(reader.is_running());
    }

    #[test]
    fn test_failed_pipe_fails_start() {
        let (reader, source) = reader();
        source.refuse_pipe.store(true, Ordering::SeqCst);
        let err = reader.start().unwrap_err();
        assert!(matches!(err, AcqError::Communication(_)));
        assert!(!source.running.load(Ordering::SeqCst));
        assert_eq!(reader.state(), ReaderState::Idle);
    }

    #[test]
    fn test_start_twice_is_invalid_state() {
        let (reader, _source) = reader();
        reader.start().unwrap();
        assert!(matches!(
            reader.start().unwrap_err(),
            AcqError::InvalidState(_)
        ));
    }

    #[test]
    fn test_not_running_means_start_is_accepted() {
        let (reader, _source) = reader();
        reader.start().unwrap();
        for _ in 0..5 {
            reader.stop().unwrap();
            assert!(wait_for(|| !reader.is_running()));

            let barrier = std::sync::Barrier::new(2);
            let outcomes: Vec<AcqResult<()>> = std::thread::scope(|scope| {
                let starts: Vec<_> = (0..2)
                    .map(|_| {
                        scope.spawn(|| {
                            barrier.wait();
                            reader.start()
                        })
                    })
                    .collect();
                starts.into_iter().map(|h| h.join().unwrap()).collect()
            });
            let accepted = outcomes.iter().filter(|r| r.is_ok()).count();
            assert_eq!(accepted, 1, "{outcomes:?}");
            assert!(outcomes
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, AcqError::InvalidState(_))));
            assert!(reader.is_running());
        }
        assert_eq!(reader.sessions_started(), 6);
        reader.dispose();
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_delivery() {
        let (reader, source) = reader();
        let count = Arc::new(AtomicUsize::new(0));
        reader.subscribe(Arc::new(|_: &u64| panic!("subscriber failure")));
        let counter = Arc::clone(&count);
        reader.subscribe(Arc::new(move |_: &u64| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        reader.start().unwrap();
        source.send(1);
        source.send(2);
        assert!(wait_for(|| count.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_dispose_while_reading_is_idempotent() {
        let (reader, _source) = reader();
        reader.start().unwrap();
        assert!(wait_for(|| reader.state() == ReaderState::Reading));
        reader.dispose();
        reader.dispose();
        assert!(reader.is_disposed());
        assert_eq!(reader.state(), ReaderState::Disposed);
        assert!(matches!(reader.start().unwrap_err(), AcqError::Disposed(_)));
    }
}
