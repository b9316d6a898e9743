//! Fake camera hardware layer.
//!
//! Produces pattern frames at a fixed interval on its own capture thread and
//! publishes them into the ring buffer handed over by the owning flow. The
//! sensor geometry and frame interval can be redefined at runtime, which the
//! RPC test hooks expose to clients.

use figment::Figment;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use acq_core::counter::unwrap_rolled_counter;
use acq_core::frame::MAX_FRAME_DIMENSION;
use acq_core::{
    full_frame_settings, AcqError, AcqResult, BinningMode, Camera, CameraAttributes, Dispose,
    DisposeGuard, Frame, RingBufferOutput, RoiConstraints, StartStop, VideoSettingsDynamic,
    VideoSettingsStatic,
};
use acq_pool::{CancelToken, RingBufferWrite};

use crate::pattern::fill_test_pattern;

/// Smallest sensor edge the fake camera accepts.
pub const MIN_SENSOR_EDGE: i32 = 16;

/// Smallest ROI edge, in binned pixels.
pub const MIN_ROI_EDGE: i32 = 5;

/// Width of the simulated on-sensor frame counter.
pub const HARDWARE_COUNTER_BITS: u8 = 16;

/// Configuration for [`FakeCamera`], read from the `fake_camera` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeCameraConfig {
    /// Sensor width in pixels (default: 512)
    pub width: i32,
    /// Sensor height in pixels (default: 512)
    pub height: i32,
    /// Bits per pixel (default: 14)
    pub bit_depth: i32,
    /// Milliseconds between frames (default: 100)
    pub inter_frame_interval_ms: u64,
    /// Supported binning modes (default: 1x1 only)
    pub supported_binning: Vec<BinningMode>,
    /// Reported model
    pub model: String,
    /// Reported serial number
    pub serial_number: String,
}

impl Default for FakeCameraConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            bit_depth: 14,
            inter_frame_interval_ms: 100,
            supported_binning: vec![BinningMode::Binning1x1],
            model: "Fake Camera".to_string(),
            serial_number: "0000".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FakeCameraSection {
    fake_camera: FakeCameraConfig,
}

impl FakeCameraConfig {
    /// Extract the `fake_camera` section, using defaults when it is absent.
    pub fn from_figment(figment: &Figment) -> AcqResult<Self> {
        let section: FakeCameraSection = figment.extract()?;
        section.fake_camera.validate()?;
        Ok(section.fake_camera)
    }

    /// Reject geometry the fake camera cannot produce.
    pub fn validate(&self) -> AcqResult<()> {
        validate_geometry(self.width, self.height, self.bit_depth, &self.supported_binning)
    }

    fn attributes(&self) -> CameraAttributes {
        CameraAttributes {
            supported_binning: self.supported_binning.clone(),
            full_width: self.width,
            full_height: self.height,
            bit_depth: self.bit_depth,
            model: self.model.clone(),
            serial_number: self.serial_number.clone(),
        }
    }
}

fn validate_geometry(
    width: i32,
    height: i32,
    bit_depth: i32,
    binning: &[BinningMode],
) -> AcqResult<()> {
    let max = MAX_FRAME_DIMENSION as i32;
    if !(MIN_SENSOR_EDGE..=max).contains(&width) || !(MIN_SENSOR_EDGE..=max).contains(&height) {
        return Err(AcqError::InvalidArgument(format!(
            "sensor must be {MIN_SENSOR_EDGE}..={max} pixels on each edge, got {width}x{height}"
        )));
    }
    if !(1..=16).contains(&bit_depth) {
        return Err(AcqError::InvalidArgument(format!(
            "bit depth must be 1..=16, got {bit_depth}"
        )));
    }
    if !binning.contains(&BinningMode::Binning1x1) {
        return Err(AcqError::InvalidArgument(
            "supported binning must include 1x1".to_string(),
        ));
    }
    Ok(())
}

fn roi_constraints(attributes: &CameraAttributes, binning: BinningMode) -> AcqResult<RoiConstraints> {
    RoiConstraints::unit_grid(attributes.full_width, attributes.full_height)?
        .binned(binning.factor())
}

#[derive(Debug)]
struct CameraState {
    attributes: CameraAttributes,
    settings_static: VideoSettingsStatic,
    settings_dynamic: VideoSettingsDynamic,
    pending_dynamic: Option<VideoSettingsDynamic>,
    interval: Duration,
    /// Last frame number, unwrapped from the hardware counter.
    frame_counter: u64,
}

struct FakeShared {
    state: Mutex<CameraState>,
    output: RwLock<Option<Arc<dyn RingBufferWrite<Frame>>>>,
    running: AtomicBool,
    frames_produced: AtomicU64,
    frames_published: AtomicU64,
    epoch: Instant,
}

impl FakeShared {
    fn capture_loop(&self, cancel: &CancelToken) {
        loop {
            let interval = self.capture_one();
            if cancel.wait_timeout(interval) {
                break;
            }
        }
    }

    /// Produce one frame; returns the interval to wait before the next.
    fn capture_one(&self) -> Duration {
        let (settings, dynamic, bit_depth, interval, number) = {
            let mut state = self.state.lock();
            if let Some(pending) = state.pending_dynamic.take() {
                state.settings_dynamic = pending;
            }
            let produced = self.frames_produced.fetch_add(1, Ordering::AcqRel);
            // The sensor only reports the low bits of its frame counter.
            let raw = (produced % (1u64 << HARDWARE_COUNTER_BITS)) as u32;
            let number = unwrap_rolled_counter(HARDWARE_COUNTER_BITS, state.frame_counter, raw)
                .unwrap_or_else(|e| {
                    warn!(error = %e, produced, "frame counter unwrap failed");
                    produced
                });
            state.frame_counter = number;
            (
                state.settings_static,
                state.settings_dynamic,
                state.attributes.bit_depth,
                state.interval,
                number as u32,
            )
        };
        let timestamp = self.epoch.elapsed().as_millis() as u32;

        let output = self.output.read();
        if let Some(ring) = output.as_ref() {
            match ring.acquire_for_write() {
                Some(mut slot) => {
                    slot.reshape(
                        settings.roi.width as u32,
                        settings.roi.height as u32,
                        bit_depth as u32,
                    );
                    slot.error_code = 0;
                    slot.frame_number = number;
                    slot.timestamp = timestamp;
                    fill_test_pattern(&mut slot, number, &dynamic);
                    slot.publish();
                    self.frames_published.fetch_add(1, Ordering::Relaxed);
                }
                None => debug!(frame = number, "no free slot, frame dropped"),
            }
        }
        interval
    }
}

/// Camera hardware layer that synthesizes frames.
pub struct FakeCamera {
    shared: Arc<FakeShared>,
    capture: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
    teardowns: Arc<AtomicUsize>,
    guard: DisposeGuard,
}

impl FakeCamera {
    /// A stopped camera described by `config`.
    pub fn new(config: &FakeCameraConfig) -> AcqResult<Self> {
        config.validate()?;
        let attributes = config.attributes();
        let state = CameraState {
            settings_static: full_frame_settings(&attributes, BinningMode::Binning1x1),
            attributes,
            settings_dynamic: VideoSettingsDynamic::default(),
            pending_dynamic: None,
            interval: Duration::from_millis(config.inter_frame_interval_ms),
            frame_counter: 0,
        };
        Ok(Self {
            shared: Arc::new(FakeShared {
                state: Mutex::new(state),
                output: RwLock::new(None),
                running: AtomicBool::new(false),
                frames_produced: AtomicU64::new(0),
                frames_published: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
            capture: Mutex::new(None),
            teardowns: Arc::new(AtomicUsize::new(0)),
            guard: DisposeGuard::new(),
        })
    }

    /// Count teardowns into `counter` instead of a private counter.
    #[must_use]
    pub fn with_teardown_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.teardowns = counter;
        self
    }

    /// Times this camera has been torn down: 0 or 1.
    #[must_use]
    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Redefine the sensor. Resets static settings to full frame at 1x1.
    pub fn define_camera(
        &self,
        width: i32,
        height: i32,
        bit_depth: i32,
        supported_binning: Vec<BinningMode>,
    ) -> AcqResult<()> {
        self.guard.ensure_not_disposed("fake camera")?;
        let _capture = self.capture.lock();
        self.ensure_stopped("redefine the camera")?;
        validate_geometry(width, height, bit_depth, &supported_binning)?;
        let mut state = self.shared.state.lock();
        state.attributes.full_width = width;
        state.attributes.full_height = height;
        state.attributes.bit_depth = bit_depth;
        state.attributes.supported_binning = supported_binning;
        state.settings_static = full_frame_settings(&state.attributes, BinningMode::Binning1x1);
        info!(attributes = %state.attributes, "fake camera redefined");
        Ok(())
    }

    /// Interval between frames.
    #[must_use]
    pub fn inter_frame_interval(&self) -> Duration {
        self.shared.state.lock().interval
    }

    /// Set the interval between frames; takes effect after the current frame.
    pub fn set_inter_frame_interval_ms(&self, interval_ms: i64) -> AcqResult<()> {
        let interval_ms = u64::try_from(interval_ms).map_err(|_| {
            AcqError::InvalidArgument(format!(
                "inter-frame interval must be >= 0 ms, got {interval_ms}"
            ))
        })?;
        self.shared.state.lock().interval = Duration::from_millis(interval_ms);
        Ok(())
    }

    /// Frames produced since construction, whether or not a slot was free.
    #[must_use]
    pub fn frames_produced(&self) -> u64 {
        self.shared.frames_produced.load(Ordering::Acquire)
    }

    /// Frames actually published into the ring buffer.
    #[must_use]
    pub fn frames_published(&self) -> u64 {
        self.shared.frames_published.load(Ordering::Relaxed)
    }

    fn ensure_stopped(&self, action: &str) -> AcqResult<()> {
        if self.shared.running.load(Ordering::Acquire) {
            Err(AcqError::InvalidState(format!(
                "cannot {action} while streaming"
            )))
        } else {
            Ok(())
        }
    }

    fn validate_static(
        attributes: &CameraAttributes,
        settings: &VideoSettingsStatic,
    ) -> AcqResult<()> {
        if !attributes.supports(settings.binning) {
            return Err(AcqError::InvalidArgument(format!(
                "binning {} is not supported by {}",
                settings.binning, attributes.model
            )));
        }
        let roi = settings.roi;
        if roi.x < 0 || roi.y < 0 {
            return Err(AcqError::InvalidArgument(format!(
                "ROI origin must be non-negative, got {roi}"
            )));
        }
        if roi.width < MIN_ROI_EDGE || roi.height < MIN_ROI_EDGE {
            return Err(AcqError::InvalidArgument(format!(
                "ROI must be larger than {}x{}, got {roi}",
                MIN_ROI_EDGE - 1,
                MIN_ROI_EDGE - 1
            )));
        }
        let constraints = roi_constraints(attributes, settings.binning)?;
        if !constraints.validate(&roi) {
            return Err(AcqError::InvalidArgument(format!(
                "ROI {roi} is outside the {} sensor ({}x{})",
                settings.binning,
                constraints.h_max(),
                constraints.v_max()
            )));
        }
        Ok(())
    }

    /// ROI grid for the current sensor at `binning`.
    pub fn roi_constraints(&self, binning: BinningMode) -> AcqResult<RoiConstraints> {
        roi_constraints(&self.shared.state.lock().attributes, binning)
    }
}

impl StartStop for FakeCamera {
    fn start(&self) -> AcqResult<()> {
        self.guard.ensure_not_disposed("fake camera")?;
        let mut capture = self.capture.lock();
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AcqError::InvalidState(
                "fake camera is already streaming".to_string(),
            ));
        }
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("fake-capture".into())
            .spawn(move || shared.capture_loop(&token));
        match spawned {
            Ok(handle) => {
                *capture = Some((cancel, handle));
                info!(from_frame = self.frames_produced(), "fake camera started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn stop(&self) -> AcqResult<()> {
        let Some((cancel, handle)) = self.capture.lock().take() else {
            return Ok(());
        };
        cancel.cancel();
        if handle.join().is_err() {
            warn!("fake capture thread panicked");
        }
        self.shared.running.store(false, Ordering::Release);
        info!(frames = self.frames_produced(), "fake camera stopped");
        Ok(())
    }

    fn is_running(&self) -> AcqResult<bool> {
        Ok(self.shared.running.load(Ordering::Acquire))
    }
}

impl Camera for FakeCamera {
    fn attributes(&self) -> AcqResult<CameraAttributes> {
        Ok(self.shared.state.lock().attributes.clone())
    }

    fn settings_static(&self) -> AcqResult<VideoSettingsStatic> {
        Ok(self.shared.state.lock().settings_static)
    }

    fn set_settings_static(&self, settings: VideoSettingsStatic) -> AcqResult<()> {
        self.guard.ensure_not_disposed("fake camera")?;
        // Held so `start` cannot begin between the check and the store.
        let _capture = self.capture.lock();
        self.ensure_stopped("change static settings")?;
        let mut state = self.shared.state.lock();
        Self::validate_static(&state.attributes, &settings)?;
        state.settings_static = settings;
        debug!(%settings, "static settings applied");
        Ok(())
    }

    fn settings_dynamic(&self) -> AcqResult<VideoSettingsDynamic> {
        let state = self.shared.state.lock();
        Ok(state.pending_dynamic.unwrap_or(state.settings_dynamic))
    }

    fn set_settings_dynamic(&self, settings: VideoSettingsDynamic) -> AcqResult<()> {
        self.guard.ensure_not_disposed("fake camera")?;
        let mut state = self.shared.state.lock();
        if self.shared.running.load(Ordering::Acquire) {
            state.pending_dynamic = Some(settings);
        } else {
            state.settings_dynamic = settings;
            state.pending_dynamic = None;
        }
        Ok(())
    }
}

impl RingBufferOutput<Frame> for FakeCamera {
    fn set_ring_buffer_output(&self, output: Option<Arc<dyn RingBufferWrite<Frame>>>) {
        *self.shared.output.write() = output;
    }
}

impl Dispose for FakeCamera {
    fn dispose(&self) {
        if !self.guard.begin() {
            return;
        }
        if let Err(e) = self.stop() {
            warn!(error = %e, "fake camera did not stop cleanly");
        }
        self.shared.output.write().take();
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        debug!("fake camera disposed");
    }

    fn is_disposed(&self) -> bool {
        self.guard.is_disposed()
    }
}

impl Drop for FakeCamera {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for FakeCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeCamera")
            .field("running", &self.shared.running.load(Ordering::Relaxed))
            .field("frames_produced", &self.frames_produced())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acq_core::{NaturalRect, TriggerMode};
    use acq_pool::RingBuffer;
    use tracing_test::traced_test;

    fn camera(interval_ms: u64) -> FakeCamera {
        FakeCamera::new(&FakeCameraConfig {
            inter_frame_interval_ms: interval_ms,
            ..FakeCameraConfig::default()
        })
        .unwrap()
    }

    fn settings(roi: NaturalRect) -> VideoSettingsStatic {
        VideoSettingsStatic {
            binning: BinningMode::Binning1x1,
            roi,
            trigger: TriggerMode::Freerun,
        }
    }

    #[test]
    fn test_defaults() {
        let cam = camera(100);
        let attrs = cam.attributes().unwrap();
        assert_eq!(attrs.to_string(), "Fake Camera 0000 Area=512x512, 14 bpp, supports [1x1]");
        assert_eq!(
            cam.settings_static().unwrap().roi,
            NaturalRect::new(0, 0, 512, 512)
        );
        assert_eq!(cam.inter_frame_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_frames_are_numbered_from_zero() {
        let cam = camera(1);
        let ring = RingBuffer::new(64, Frame::default).unwrap();
        let writer: Arc<dyn RingBufferWrite<Frame>> = ring.clone();
        cam.set_ring_buffer_output(Some(writer));
        cam.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ring.unread_len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        cam.stop().unwrap();
        let mut numbers = Vec::new();
        while let Some(n) = ring.try_read(|f| {
            assert!(f.is_valid());
            f.frame_number
        }) {
            numbers.push(n);
        }
        assert!(numbers.len() >= 3);
        assert!(numbers.iter().enumerate().all(|(i, &n)| n == i as u32));
        assert_eq!(cam.frames_produced(), numbers.len() as u64);
    }

    #[test]
    fn test_start_twice_is_invalid_state() {
        let cam = camera(50);
        cam.start().unwrap();
        assert!(matches!(cam.start(), Err(AcqError::InvalidState(_))));
        cam.stop().unwrap();
        assert!(!cam.is_running().unwrap());
    }

    #[test]
    fn test_roi_outside_sensor_rejected_without_change() {
        let cam = camera(100);
        let before = cam.settings_static().unwrap();
        let err = cam
            .set_settings_static(settings(NaturalRect::new(500, 0, 64, 64)))
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(cam.settings_static().unwrap(), before);
    }

    #[test]
    fn test_static_settings_rules() {
        let cam = camera(100);
        assert!(cam
            .set_settings_static(settings(NaturalRect::new(-1, 0, 64, 64)))
            .is_err());
        assert!(cam
            .set_settings_static(settings(NaturalRect::new(0, 0, 4, 64)))
            .is_err());
        let mut binned = settings(NaturalRect::new(0, 0, 64, 64));
        binned.binning = BinningMode::Binning2x2;
        assert!(cam.set_settings_static(binned).unwrap_err().is_invalid_argument());
        cam.set_settings_static(settings(NaturalRect::new(16, 16, 5, 5)))
            .unwrap();

        cam.start().unwrap();
        let err = cam
            .set_settings_static(settings(NaturalRect::new(0, 0, 64, 64)))
            .unwrap_err();
        assert!(matches!(err, AcqError::InvalidState(_)));
        cam.stop().unwrap();
    }

    #[test]
    fn test_settings_change_racing_start_never_lands_mid_stream() {
        let cam = camera(1);
        let ring = RingBuffer::new(256, Frame::default).unwrap();
        let writer: Arc<dyn RingBufferWrite<Frame>> = ring.clone();
        cam.set_ring_buffer_output(Some(writer));

        for round in 0..20 {
            let width = if round % 2 == 0 { 32 } else { 48 };
            let before = cam.settings_static().unwrap();
            let barrier = std::sync::Barrier::new(2);
            let applied = std::thread::scope(|scope| {
                let starter = scope.spawn(|| {
                    barrier.wait();
                    cam.start()
                });
                barrier.wait();
                let applied = cam.set_settings_static(settings(NaturalRect::new(0, 0, width, 16)));
                starter.join().unwrap().unwrap();
                applied
            });

            let deadline = Instant::now() + Duration::from_secs(5);
            while ring.unread_len() < 3 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            cam.stop().unwrap();
            let mut widths = Vec::new();
            while let Some(w) = ring.try_read(|f| f.width) {
                widths.push(w);
            }

            let expected = match applied {
                Ok(()) => width as u32,
                Err(e) => {
                    assert!(matches!(e, AcqError::InvalidState(_)), "{e}");
                    assert_eq!(cam.settings_static().unwrap(), before);
                    before.roi.width as u32
                }
            };
            assert!(!widths.is_empty());
            assert!(widths.iter().all(|&w| w == expected), "round {round}: {widths:?}");
        }
    }

    #[test]
    fn test_binned_roi_must_fit_binned_sensor() {
        let cam = camera(100);
        cam.define_camera(
            512,
            512,
            12,
            vec![BinningMode::Binning1x1, BinningMode::Binning2x2],
        )
        .unwrap();
        let mut s = settings(NaturalRect::new(0, 0, 256, 256));
        s.binning = BinningMode::Binning2x2;
        cam.set_settings_static(s).unwrap();
        s.roi = NaturalRect::new(1, 0, 256, 256);
        assert!(cam.set_settings_static(s).is_err());

        let grid = cam.roi_constraints(BinningMode::Binning2x2).unwrap();
        assert_eq!((grid.h_max(), grid.v_max()), (256, 256));
        assert_eq!(grid.allowed_width().last(), Some(&256));
    }

    #[test]
    fn test_define_camera_rules() {
        let cam = camera(100);
        assert!(cam.define_camera(15, 64, 12, vec![BinningMode::Binning1x1]).is_err());
        assert!(cam.define_camera(64, 64, 17, vec![BinningMode::Binning1x1]).is_err());
        assert!(cam.define_camera(64, 64, 12, vec![BinningMode::Binning2x2]).is_err());
        cam.define_camera(64, 32, 8, vec![BinningMode::Binning1x1]).unwrap();
        assert_eq!(
            cam.settings_static().unwrap().roi,
            NaturalRect::new(0, 0, 64, 32)
        );
        cam.start().unwrap();
        assert!(matches!(
            cam.define_camera(64, 64, 8, vec![BinningMode::Binning1x1]),
            Err(AcqError::InvalidState(_))
        ));
    }

    #[test]
    fn test_dynamic_settings_queued_while_streaming() {
        let cam = camera(20);
        cam.start().unwrap();
        let update = VideoSettingsDynamic {
            analog_gain_db: 6.0,
            analog_offset: 10,
        };
        cam.set_settings_dynamic(update).unwrap();
        assert_eq!(cam.settings_dynamic().unwrap(), update);
        cam.stop().unwrap();
    }

    #[test]
    fn test_negative_interval_rejected() {
        let cam = camera(100);
        assert!(cam.set_inter_frame_interval_ms(-1).unwrap_err().is_invalid_argument());
        cam.set_inter_frame_interval_ms(0).unwrap();
        assert_eq!(cam.inter_frame_interval(), Duration::ZERO);
    }

    #[test]
    #[traced_test]
    fn test_dispose_counts_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cam = camera(10).with_teardown_counter(Arc::clone(&counter));
        cam.start().unwrap();
        cam.dispose();
        cam.dispose();
        drop(cam);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(logs_contain("fake camera stopped"));
        assert!(logs_contain("fake camera disposed"));
    }
}
