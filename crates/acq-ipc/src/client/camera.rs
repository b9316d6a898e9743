//! Camera handles for host applications.
//!
//! A [`CameraHandle`] keeps the most recent frames of a remote camera in a
//! bounded queue, and a [`CameraRegistry`] owns any number of handles by id,
//! so callers that cannot hold Rust objects (scripting hosts, FFI shims) can
//! address cameras with plain integers.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use acq_core::{AcqError, AcqResult, Camera, Dispose, Frame, SubscriptionHandle};

use super::pipe_reader::{ClientOptions, PipeReader};
use super::proxy::{DataPipeSource, RemoteCameraFlow, RemoteProxy};

/// A connected remote camera and its latest frames.
pub struct CameraHandle<P = RemoteCameraFlow>
where
    P: RemoteProxy + DataPipeSource + Camera + 'static,
{
    reader: PipeReader<P, Frame>,
    frames: Arc<Mutex<VecDeque<Frame>>>,
    queue_len: usize,
    subscription: SubscriptionHandle,
}

impl<P> CameraHandle<P>
where
    P: RemoteProxy + DataPipeSource + Camera + 'static,
{
    /// Frames kept when no queue length is given.
    pub const DEFAULT_QUEUE_LEN: usize = 8;
    /// Largest accepted queue length.
    pub const MAX_QUEUE_LEN: usize = 128;

    /// Connect to `coordination_name`, keeping at most `queue_len` frames.
    pub fn open(
        coordination_name: &str,
        options: &ClientOptions,
        queue_len: usize,
    ) -> AcqResult<Self> {
        if !(1..=Self::MAX_QUEUE_LEN).contains(&queue_len) {
            return Err(AcqError::InvalidArgument(format!(
                "frame queue length must be 1..={}, got {queue_len}",
                Self::MAX_QUEUE_LEN
            )));
        }
        let reader = PipeReader::<P, Frame>::connect(coordination_name, options)?;
        let frames = Arc::new(Mutex::new(VecDeque::with_capacity(queue_len)));
        let sink = Arc::clone(&frames);
        let subscription = reader.subscribe(Arc::new(move |frame: &Frame| {
            let mut queue = sink.lock();
            if queue.len() == queue_len {
                queue.pop_front();
            }
            queue.push_back(frame.clone());
        }));
        Ok(Self {
            reader,
            frames,
            queue_len,
            subscription,
        })
    }

    /// The remote camera.
    #[must_use]
    pub fn camera(&self) -> &P {
        self.reader.proxy()
    }

    /// The underlying pipe reader.
    #[must_use]
    pub fn reader(&self) -> &PipeReader<P, Frame> {
        &self.reader
    }

    /// Maximum frames kept.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue_len
    }

    /// Frames currently queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.frames.lock().len()
    }

    /// Most recent frame, left in the queue.
    #[must_use]
    pub fn latest_frame(&self) -> Option<Frame> {
        self.frames.lock().back().cloned()
    }

    /// Drain queued frames, oldest first.
    pub fn take_frames(&self) -> Vec<Frame> {
        self.frames.lock().drain(..).collect()
    }

    /// Start streaming.
    pub fn start(&self) -> AcqResult<()> {
        self.reader.start()
    }

    /// Stop streaming. Queued frames are kept.
    pub fn stop(&self) -> AcqResult<()> {
        self.reader.stop()
    }
}

impl<P> Dispose for CameraHandle<P>
where
    P: RemoteProxy + DataPipeSource + Camera + 'static,
{
    fn dispose(&self) {
        self.reader.unsubscribe(self.subscription);
        self.reader.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.reader.is_disposed()
    }
}

impl<P> std::fmt::Debug for CameraHandle<P>
where
    P: RemoteProxy + DataPipeSource + Camera + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraHandle")
            .field("reader", &self.reader)
            .field("queue_len", &self.queue_len)
            .finish()
    }
}

/// Open cameras addressed by integer id.
pub struct CameraRegistry<P = RemoteCameraFlow>
where
    P: RemoteProxy + DataPipeSource + Camera + 'static,
{
    options: ClientOptions,
    next_id: AtomicU32,
    cameras: RwLock<HashMap<u32, Arc<CameraHandle<P>>>>,
}

impl<P> CameraRegistry<P>
where
    P: RemoteProxy + DataPipeSource + Camera + 'static,
{
    /// Empty registry connecting with `options`.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            next_id: AtomicU32::new(1),
            cameras: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to `coordination_name` and return the new camera's id.
    pub fn open(&self, coordination_name: &str, queue_len: usize) -> AcqResult<u32> {
        let handle = CameraHandle::open(coordination_name, &self.options, queue_len)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.cameras.write().insert(id, Arc::new(handle));
        info!(id, coordination_name, "camera opened");
        Ok(id)
    }

    /// The camera with `id`.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<Arc<CameraHandle<P>>> {
        self.cameras.read().get(&id).cloned()
    }

    /// The camera with `id`, or an `InvalidArgument` error.
    pub fn require(&self, id: u32) -> AcqResult<Arc<CameraHandle<P>>> {
        self.get(id)
            .ok_or_else(|| AcqError::InvalidArgument(format!("no open camera with id {id}")))
    }

    /// Dispose and forget the camera with `id`. Returns whether it existed.
    pub fn close(&self, id: u32) -> bool {
        let removed = self.cameras.write().remove(&id);
        match removed {
            Some(handle) => {
                handle.dispose();
                debug!(id, "camera closed");
                true
            }
            None => false,
        }
    }

    /// Dispose every open camera.
    pub fn close_all(&self) {
        let handles: Vec<_> = self.cameras.write().drain().collect();
        for (id, handle) in handles {
            handle.dispose();
            debug!(id, "camera closed");
        }
    }

    /// Number of open cameras.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cameras.read().len()
    }

    /// Whether no camera is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cameras.read().is_empty()
    }
}

impl<P> Drop for CameraRegistry<P>
where
    P: RemoteProxy + DataPipeSource + Camera + 'static,
{
    fn drop(&mut self) {
        self.close_all();
    }
}

impl<P> std::fmt::Debug for CameraRegistry<P>
where
    P: RemoteProxy + DataPipeSource + Camera + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraRegistry")
            .field("open", &self.len())
            .finish()
    }
}
