//! Server-side frame flows.
//!
//! A [`DataFlow`] drains the hardware-facing ring buffer on a dedicated
//! retrieval thread and fans every item out to:
//!
//! 1. in-process subscribers, called in registration order on a scoped
//!    worker thread that is joined before the slot is released, so a slow
//!    subscriber stalls retrieval instead of seeing a recycled slot;
//! 2. the file sink, if one is set, written under the swap lock;
//! 3. a small keep-fresh ring feeding the pipe-out thread. Copies into it
//!    never block, so a slow pipe reader cannot stall capture or the file.
//!
//! Every pipe chunk is tagged with the generation of the output pipe that was
//! current when the item was encoded. The pipe-out thread writes a chunk only
//! to a connection of the same generation, so items encoded for one session
//! never reach the next.
//!
//! [`CameraFlow`] binds a `DataFlow<Frame>` to a camera hardware layer and
//! exposes the camera and output capabilities by delegation.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use acq_core::{
    AcqError, AcqResult, Camera, CameraAttributes, CameraHal, Dispose, DisposeGuard, Frame,
    OutputFileAndPipe, StartStop, Subscriber, SubscriptionHandle, VideoSettingsDynamic,
    VideoSettingsStatic,
};
use acq_pool::{try_copy_in, CancelToken, RingBuffer, RingBufferWrite};

use crate::swap::SyncSwapValue;
use crate::transport::{PipeListener, PipeNamespace};
use crate::wire::encode_framed;

/// Slots in the pipe-out ring.
pub const PIPE_RING_CAPACITY: usize = 4;

const PIPE_READ_TIMEOUT: Duration = Duration::from_millis(100);
const ACCEPT_POLL: Duration = Duration::from_millis(5);
const IDLE_WAIT: Duration = Duration::from_millis(100);
/// A write to the data pipe blocked this long drops the pipe; the session
/// then ends on the client side with end of stream.
const PIPE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Items a [`DataFlow`] can carry.
pub trait FlowItem: Serialize + Send + Sync + 'static {
    /// Capture sequence number, when the item has one.
    fn sequence_number(&self) -> Option<u64> {
        None
    }
}

impl FlowItem for Frame {
    fn sequence_number(&self) -> Option<u64> {
        Some(u64::from(self.frame_number))
    }
}

/// Counters reported by [`DataFlow::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Items taken from the source ring.
    pub frames_processed: u64,
    /// Gaps observed in sequence numbers.
    pub frames_dropped: u64,
    /// Chunks written to a data pipe.
    pub pipe_writes: u64,
    /// Chunks overwritten in the pipe-out ring before being written.
    pub pipe_chunks_dropped: u64,
}

#[derive(Default)]
struct PipeChunk {
    generation: u64,
    bytes: Vec<u8>,
}

enum OutputPipe {
    Listening {
        listener: PipeListener,
        generation: u64,
    },
    Connected {
        stream: UnixStream,
        generation: u64,
    },
}

/// Tracks sequence numbers and reports gaps.
#[derive(Debug, Default)]
struct SequenceCheck {
    last: Option<u64>,
}

impl SequenceCheck {
    /// Record `current`, returning how many items were skipped since the
    /// previous one.
    fn observe(&mut self, current: u64) -> u64 {
        let dropped = match self.last {
            Some(previous) if current > previous + 1 => {
                let dropped = current - previous - 1;
                warn!(previous, current, dropped, "frames dropped");
                dropped
            }
            _ => 0,
        };
        self.last = Some(current);
        dropped
    }
}

struct FlowShared<T> {
    source: Arc<RingBuffer<T>>,
    pipe_ring: Arc<RingBuffer<PipeChunk>>,
    subscribers: RwLock<Vec<(SubscriptionHandle, Subscriber<T>)>>,
    file: SyncSwapValue<BufWriter<File>>,
    pipe: SyncSwapValue<OutputPipe>,
    cancel: CancelToken,
    frames_processed: AtomicU64,
    frames_dropped: AtomicU64,
    pipe_writes: AtomicU64,
}

impl<T: FlowItem> FlowShared<T> {
    fn retrieval_loop(&self) {
        let mut scratch = Vec::new();
        let mut sequence = SequenceCheck::default();
        while self
            .source
            .blocking_read(|item| self.process(item, &mut scratch, &mut sequence), &self.cancel)
            .is_some()
        {}
        debug!("retrieval thread exiting");
    }

    fn process(&self, item: &mut T, scratch: &mut Vec<u8>, sequence: &mut SequenceCheck) {
        let item: &T = item;
        let subscribers: Vec<Subscriber<T>> = self
            .subscribers
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        std::thread::scope(|scope| {
            let delivery = (!subscribers.is_empty()).then(|| {
                scope.spawn(|| {
                    for callback in &subscribers {
                        if catch_unwind(AssertUnwindSafe(|| callback(item))).is_err() {
                            warn!("subscriber panicked; item skipped for that subscriber");
                        }
                    }
                })
            });
            self.write_outputs(item, scratch);
            if let Some(seq) = item.sequence_number() {
                let dropped = sequence.observe(seq);
                self.frames_dropped.fetch_add(dropped, Ordering::Relaxed);
            }
            if let Some(delivery) = delivery {
                if delivery.join().is_err() {
                    warn!("subscriber delivery thread failed");
                }
            }
        });
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    fn write_outputs(&self, item: &T, scratch: &mut Vec<u8>) {
        let generation = self.pipe.with(|pipe| pipe.generation());
        let has_file = self.file.is_set();
        if generation.is_none() && !has_file {
            return;
        }
        if let Err(e) = encode_framed(item, scratch) {
            warn!(error = %e, "failed to encode item for output");
            return;
        }
        if let Some(generation) = generation {
            let copied = try_copy_in(
                self.pipe_ring.as_ref(),
                |bytes: &[u8], chunk: &mut PipeChunk| {
                    chunk.generation = generation;
                    chunk.bytes.clear();
                    chunk.bytes.extend_from_slice(bytes);
                },
                scratch.as_slice(),
            );
            if !copied {
                trace!("pipe-out ring full, chunk dropped");
            }
        }
        if has_file {
            self.file.with_slot(|slot| {
                let failed = match slot.as_mut().map(|writer| writer.write_all(scratch)) {
                    Some(Err(e)) => {
                        warn!(error = %e, "output file write failed, closing file");
                        true
                    }
                    _ => false,
                };
                if failed {
                    *slot = None;
                }
            });
        }
    }
}

impl<T> FlowShared<T> {
    fn pipe_out_loop(&self) {
        while !self.cancel.is_cancelled() {
            match self.pipe.with(|pipe| matches!(pipe, OutputPipe::Connected { .. })) {
                None => {
                    self.cancel.wait_timeout(IDLE_WAIT);
                }
                Some(false) => {
                    if !self.try_accept_pipe() {
                        self.cancel.wait_timeout(ACCEPT_POLL);
                    }
                }
                Some(true) => {
                    self.pipe_ring
                        .read_timeout(|chunk| self.write_chunk(chunk), PIPE_READ_TIMEOUT);
                }
            }
        }
        debug!("pipe-out thread exiting");
    }

    fn try_accept_pipe(&self) -> bool {
        self.pipe.with_slot(|slot| {
            let (accepted, generation) = match slot {
                Some(OutputPipe::Listening {
                    listener,
                    generation,
                }) => (listener.try_accept(), *generation),
                _ => return false,
            };
            match accepted {
                Ok(Some(stream)) => {
                    if let Err(e) = stream.set_write_timeout(Some(PIPE_WRITE_TIMEOUT)) {
                        warn!(error = %e, "failed to set data pipe write timeout");
                    }
                    info!(generation, "data pipe connected");
                    *slot = Some(OutputPipe::Connected { stream, generation });
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(error = %e, generation, "data pipe accept failed, discarding pipe");
                    *slot = None;
                    false
                }
            }
        })
    }

    fn write_chunk(&self, chunk: &mut PipeChunk) {
        self.pipe.with_slot(|slot| {
            let written = match slot {
                Some(OutputPipe::Connected { stream, generation })
                    if *generation == chunk.generation =>
                {
                    Some((stream.write_all(&chunk.bytes), *generation))
                }
                _ => None,
            };
            match written {
                Some((Ok(()), _)) => {
                    self.pipe_writes.fetch_add(1, Ordering::Relaxed);
                }
                Some((Err(e), generation)) => {
                    warn!(error = %e, generation, "data pipe write failed, discarding pipe");
                    *slot = None;
                }
                None => trace!(chunk_generation = chunk.generation, "stale pipe chunk discarded"),
            }
        });
    }
}

impl OutputPipe {
    fn generation(&self) -> u64 {
        match self {
            OutputPipe::Listening { generation, .. } | OutputPipe::Connected { generation, .. } => {
                *generation
            }
        }
    }
}

/// Retrieval and output threads for one item source.
pub struct DataFlow<T: FlowItem> {
    shared: Arc<FlowShared<T>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    guard: DisposeGuard,
}

impl<T: FlowItem> DataFlow<T> {
    /// Start draining `source`. Data pipes are created in `namespace`.
    pub fn new(source: Arc<RingBuffer<T>>, namespace: PipeNamespace) -> AcqResult<Self> {
        let pipe_ring = RingBuffer::new_keep_fresh(PIPE_RING_CAPACITY, PipeChunk::default)
            .map_err(|e| AcqError::InvalidArgument(e.to_string()))?;
        let generations = AtomicU64::new(0);
        let pipe = SyncSwapValue::new(move |name| {
            let generation = generations.fetch_add(1, Ordering::Relaxed) + 1;
            let listener = PipeListener::bind(&namespace, name)?;
            debug!(name, generation, "data pipe listening");
            Ok(OutputPipe::Listening {
                listener,
                generation,
            })
        });
        let file = SyncSwapValue::new(|path| {
            let file = File::create(path)?;
            debug!(path, "output file opened");
            Ok(BufWriter::new(file))
        });
        let shared = Arc::new(FlowShared {
            source,
            pipe_ring,
            subscribers: RwLock::new(Vec::new()),
            file,
            pipe,
            cancel: CancelToken::new(),
            frames_processed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            pipe_writes: AtomicU64::new(0),
        });

        let retrieval = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("flow-retrieval".into())
                .spawn(move || shared.retrieval_loop())?
        };
        let pipe_out = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("flow-pipe-out".into())
                .spawn(move || shared.pipe_out_loop())
        };
        let pipe_out = match pipe_out {
            Ok(handle) => handle,
            Err(e) => {
                shared.cancel.cancel();
                let _ = retrieval.join();
                return Err(e.into());
            }
        };

        Ok(Self {
            shared,
            threads: Mutex::new(vec![retrieval, pipe_out]),
            guard: DisposeGuard::new(),
        })
    }

    /// The ring buffer this flow drains.
    #[must_use]
    pub fn source(&self) -> &Arc<RingBuffer<T>> {
        &self.shared.source
    }

    /// Register a callback for every item. Callbacks run in registration
    /// order and must not retain the item.
    pub fn subscribe(&self, callback: Subscriber<T>) -> SubscriptionHandle {
        let handle = SubscriptionHandle::next();
        self.shared.subscribers.write().push((handle, callback));
        handle
    }

    /// Remove a callback. Returns whether it was registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.shared.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(h, _)| *h != handle);
        subscribers.len() != before
    }

    /// Replace the file sink; an empty path closes it.
    pub fn set_output_file(&self, path: &str) -> AcqResult<()> {
        self.guard.ensure_not_disposed("data flow")?;
        self.shared.file.with(|writer| writer.flush()).transpose()?;
        self.shared.file.replace_with_new(path)?;
        info!(path, "output file set");
        Ok(())
    }

    /// Flush buffered file output.
    pub fn flush_output_file(&self) -> AcqResult<()> {
        self.shared.file.with(|writer| writer.flush()).transpose()?;
        Ok(())
    }

    /// Replace the data pipe; an empty name closes it.
    ///
    /// The new pipe is listening when this returns, so a client may connect
    /// immediately.
    pub fn set_output_pipe(&self, name: &str) -> AcqResult<()> {
        self.guard.ensure_not_disposed("data flow")?;
        self.shared.pipe.replace_with_new(name)?;
        info!(name, "output pipe set");
        Ok(())
    }

    /// Whether a data pipe is set, connected or not.
    #[must_use]
    pub fn has_output_pipe(&self) -> bool {
        self.shared.pipe.is_set()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> FlowStats {
        FlowStats {
            frames_processed: self.shared.frames_processed.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            pipe_writes: self.shared.pipe_writes.load(Ordering::Relaxed),
            pipe_chunks_dropped: self.shared.pipe_ring.missed_reads(),
        }
    }
}

impl<T: FlowItem> Dispose for DataFlow<T> {
    fn dispose(&self) {
        if !self.guard.begin() {
            return;
        }
        self.shared.cancel.cancel();
        for handle in self.threads.lock().drain(..) {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                warn!(thread = ?name, "flow thread panicked");
            }
        }
        if let Some(Err(e)) = self.shared.file.with(|writer| writer.flush()) {
            warn!(error = %e, "final output file flush failed");
        }
        self.shared.file.clear();
        self.shared.pipe.clear();
        self.shared.subscribers.write().clear();
        debug!("data flow disposed");
    }

    fn is_disposed(&self) -> bool {
        self.guard.is_disposed()
    }
}

impl<T: FlowItem> Drop for DataFlow<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T: FlowItem> std::fmt::Debug for DataFlow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFlow")
            .field("stats", &self.stats())
            .field("disposed", &self.guard.is_disposed())
            .finish()
    }
}

/// A camera hardware layer wired to a frame flow.
pub struct CameraFlow<H: CameraHal> {
    hal: H,
    flow: DataFlow<Frame>,
    guard: DisposeGuard,
}

impl<H: CameraHal> CameraFlow<H> {
    /// Hand `hal` a keep-fresh ring of `ring_capacity` frames and start the
    /// flow draining it.
    pub fn new(hal: H, ring_capacity: usize, namespace: PipeNamespace) -> AcqResult<Self> {
        let ring = RingBuffer::new_keep_fresh(ring_capacity, Frame::default)
            .map_err(|e| AcqError::InvalidArgument(e.to_string()))?;
        let writer: Arc<dyn RingBufferWrite<Frame>> = ring.clone();
        hal.set_ring_buffer_output(Some(writer));
        let flow = DataFlow::new(ring, namespace)?;
        Ok(Self {
            hal,
            flow,
            guard: DisposeGuard::new(),
        })
    }

    /// The hardware layer.
    #[must_use]
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// The frame flow.
    #[must_use]
    pub fn flow(&self) -> &DataFlow<Frame> {
        &self.flow
    }

    fn live(&self) -> AcqResult<()> {
        self.guard.ensure_not_disposed("camera flow")
    }
}

impl<H: CameraHal> StartStop for CameraFlow<H> {
    fn start(&self) -> AcqResult<()> {
        self.live()?;
        self.hal.start()
    }

    fn stop(&self) -> AcqResult<()> {
        self.live()?;
        self.hal.stop()
    }

    fn is_running(&self) -> AcqResult<bool> {
        self.live()?;
        self.hal.is_running()
    }
}

impl<H: CameraHal> Camera for CameraFlow<H> {
    fn attributes(&self) -> AcqResult<CameraAttributes> {
        self.live()?;
        self.hal.attributes()
    }

    fn settings_static(&self) -> AcqResult<VideoSettingsStatic> {
        self.live()?;
        self.hal.settings_static()
    }

    fn set_settings_static(&self, settings: VideoSettingsStatic) -> AcqResult<()> {
        self.live()?;
        self.hal.set_settings_static(settings)
    }

    fn settings_dynamic(&self) -> AcqResult<VideoSettingsDynamic> {
        self.live()?;
        self.hal.settings_dynamic()
    }

    fn set_settings_dynamic(&self, settings: VideoSettingsDynamic) -> AcqResult<()> {
        self.live()?;
        self.hal.set_settings_dynamic(settings)
    }
}

impl<H: CameraHal> OutputFileAndPipe for CameraFlow<H> {
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

impl<H: CameraHal> Dispose for CameraFlow<H> {
    fn dispose(&self) {
        if !self.guard.begin() {
            return;
        }
        self.flow.dispose();
        self.hal.set_ring_buffer_output(None);
        self.hal.dispose();
        info!("camera flow disposed");
    }

    fn is_disposed(&self) -> bool {
        self.guard.is_disposed()
    }
}

impl<H: CameraHal> Drop for CameraFlow<H> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connect;
    use crate::wire::read_framed;
    use std::io::BufReader;
    use std::time::Instant;
    use tracing_test::traced_test;

    fn publish(ring: &RingBuffer<Frame>, number: u32) {
        let mut slot = ring.acquire_for_write().unwrap();
        *slot = Frame::from_u16(2, 2, 12, &[number as u16; 4]);
        slot.frame_number = number;
        slot.publish();
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn flow_in(dir: &std::path::Path) -> (Arc<RingBuffer<Frame>>, DataFlow<Frame>) {
        let ring = RingBuffer::new(8, Frame::default).unwrap();
        let flow = DataFlow::new(Arc::clone(&ring), PipeNamespace::new(dir)).unwrap();
        (ring, flow)
    }

    #[test]
    #[traced_test]
    fn test_sequence_gap_warns() {
        let mut check = SequenceCheck::default();
        assert_eq!(check.observe(0), 0);
        assert_eq!(check.observe(1), 0);
        assert_eq!(check.observe(4), 2);
        assert!(logs_contain("frames dropped"));
    }

    #[test]
    fn test_subscribers_in_registration_order() {
        let dir = tempfile::tempdir().unwrap();
        let (ring, flow) = flow_in(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        flow.subscribe(Arc::new(move |f: &Frame| first.lock().push(("a", f.frame_number))));
        let handle =
            flow.subscribe(Arc::new(move |f: &Frame| second.lock().push(("b", f.frame_number))));
        publish(&ring, 0);
        assert!(wait_until(|| seen.lock().len() == 2));
        assert!(flow.unsubscribe(handle));
        publish(&ring, 1);
        assert!(wait_until(|| flow.stats().frames_processed == 2));
        assert_eq!(*seen.lock(), vec![("a", 0), ("b", 0), ("a", 1)]);
        flow.dispose();
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_flow() {
        let dir = tempfile::tempdir().unwrap();
        let (ring, flow) = flow_in(dir.path());
        flow.subscribe(Arc::new(|_: &Frame| panic!("subscriber bug")));
        publish(&ring, 0);
        publish(&ring, 1);
        assert!(wait_until(|| flow.stats().frames_processed == 2));
        assert!(wait_until(|| ring.usable_len() == 8));
    }

    #[test]
    fn test_file_sink_holds_framed_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.bin");
        let (ring, flow) = flow_in(dir.path());
        flow.set_output_file(path.to_str().unwrap()).unwrap();
        for n in 0..3 {
            publish(&ring, n);
        }
        assert!(wait_until(|| flow.stats().frames_processed == 3));
        flow.set_output_file("").unwrap();

        let mut reader = BufReader::new(File::open(&path).unwrap());
        let mut scratch = Vec::new();
        let mut numbers = Vec::new();
        while let Some(frame) = read_framed::<_, Frame>(&mut reader, &mut scratch).unwrap() {
            assert!(frame.is_valid());
            numbers.push(frame.frame_number);
        }
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_frames_reach_connected_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let ns = PipeNamespace::new(dir.path());
        let (ring, flow) = flow_in(dir.path());
        flow.set_output_pipe("data.1").unwrap();
        let mut stream = connect(&ns, "data.1", Duration::from_secs(1)).unwrap();
        publish(&ring, 10);
        publish(&ring, 11);
        let mut scratch = Vec::new();
        let a: Frame = read_framed(&mut stream, &mut scratch).unwrap().unwrap();
        let b: Frame = read_framed(&mut stream, &mut scratch).unwrap().unwrap();
        assert_eq!((a.frame_number, b.frame_number), (10, 11));
        assert_eq!(a.data, Frame::from_u16(2, 2, 12, &[10; 4]).data);
    }

    #[test]
    fn test_new_pipe_never_sees_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let ns = PipeNamespace::new(dir.path());
        let (ring, flow) = flow_in(dir.path());
        flow.set_output_pipe("data.1").unwrap();
        publish(&ring, 0);
        assert!(wait_until(|| flow.stats().frames_processed == 1));
        flow.set_output_pipe("data.2").unwrap();
        let mut stream = connect(&ns, "data.2", Duration::from_secs(1)).unwrap();
        publish(&ring, 1);
        let first: Frame = read_framed(&mut stream, &mut Vec::new()).unwrap().unwrap();
        assert_eq!(first.frame_number, 1);
    }

    #[test]
    fn test_dispose_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (_ring, flow) = flow_in(dir.path());
        flow.set_output_pipe("data.x").unwrap();
        flow.dispose();
        flow.dispose();
        assert!(flow.is_disposed());
        assert!(!flow.has_output_pipe());
        assert!(flow.set_output_pipe("data.y").is_err());
    }
}
