//! Fake camera server and pipe reader talking over real Unix sockets.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use acq_core::{
    BinningMode, Camera, Dispose, ErrorKind, Frame, NaturalRect, StartStop, VideoSettingsDynamic,
    VideoSettingsStatic,
};
use acq_driver_mock::{
    fake_server_counted, FakeCameraConfig, FakeFlow, FakeFlowApi, FakeFlowClient,
};
use acq_ipc::{
    CameraRegistry, ClientOptions, DataServer, PipeNamespace, PipeReader, ReaderState, ServerExit,
    ServerHandle, ServerOptions,
};
use acq_pool::CancelToken;

const INTERVAL_MS: u64 = 40;

struct Rig {
    dir: TempDir,
    name: String,
    server: Arc<DataServer<FakeFlow>>,
    handle: Option<ServerHandle>,
    teardowns: Arc<AtomicUsize>,
}

impl Rig {
    fn launch(tag: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let name = format!("E2E.{tag}.{}", std::process::id());
        let teardowns = Arc::new(AtomicUsize::new(0));
        let options = ServerOptions {
            poll_interval: Duration::from_millis(10),
            namespace: PipeNamespace::new(dir.path()),
            ..ServerOptions::default()
        };
        let config = FakeCameraConfig {
            width: 64,
            height: 48,
            bit_depth: 12,
            inter_frame_interval_ms: INTERVAL_MS,
            ..FakeCameraConfig::default()
        };
        let server = Arc::new(fake_server_counted(options, config, Arc::clone(&teardowns)));
        let handle = server.launch(&name, CancelToken::new(), true).unwrap();
        Self {
            dir,
            name,
            server,
            handle: Some(handle),
            teardowns,
        }
    }

    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            namespace: PipeNamespace::new(self.dir.path()),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn connect(&self) -> PipeReader<FakeFlowClient> {
        PipeReader::connect(&self.name, &self.client_options()).unwrap()
    }

    fn join(&mut self) -> ServerExit {
        self.handle.take().unwrap().join().unwrap()
    }
}

fn collect_frame_numbers(reader: &PipeReader<FakeFlowClient>) -> Arc<Mutex<Vec<u32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    reader.subscribe(Arc::new(move |frame: &Frame| {
        sink.lock().push(frame.frame_number);
    }));
    seen
}

fn wait_for(seen: &Mutex<Vec<u32>>, count: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if seen.lock().len() >= count {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    seen.lock().len() >= count
}

#[test]
fn frames_arrive_in_order_from_zero() {
    let rig = Rig::launch("Order");
    let reader = rig.connect();
    let seen = collect_frame_numbers(&reader);

    reader.start().unwrap();
    assert!(wait_for(&seen, 1, Duration::from_millis(2 * INTERVAL_MS)));
    assert!(wait_for(&seen, 5, Duration::from_secs(5)));
    reader.stop().unwrap();

    let frames = seen.lock().clone();
    assert_eq!(frames[0], 0);
    assert!(frames.windows(2).all(|w| w[1] == w[0] + 1), "{frames:?}");
    assert_eq!(reader.state(), ReaderState::Idle);
}

#[test]
fn frames_carry_configured_geometry() {
    let rig = Rig::launch("Geometry");
    let reader = rig.connect();
    let latest = Arc::new(Mutex::new(None::<Frame>));
    let sink = Arc::clone(&latest);
    reader.subscribe(Arc::new(move |frame: &Frame| {
        *sink.lock() = Some(frame.clone());
    }));

    reader.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while latest.lock().is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    reader.stop().unwrap();

    let frame = latest.lock().clone().unwrap();
    assert!(frame.is_valid());
    assert_eq!((frame.width, frame.height, frame.bits_per_pixel), (64, 48, 12));
    assert_eq!(frame.pixel(0, 0), Some(frame.frame_number & 0xfff));
}

#[test]
fn out_of_bounds_roi_is_an_argument_error() {
    let rig = Rig::launch("Roi");
    let reader = rig.connect();
    let camera = reader.proxy();
    let before = camera.settings_static().unwrap();

    let err = camera
        .set_settings_static(VideoSettingsStatic {
            roi: NaturalRect::new(40, 0, 64, 48),
            ..before
        })
        .unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(camera.settings_static().unwrap(), before);

    let inside = VideoSettingsStatic {
        roi: NaturalRect::new(8, 8, 32, 24),
        ..before
    };
    camera.set_settings_static(inside).unwrap();
    assert_eq!(camera.settings_static().unwrap(), inside);
}

#[test]
fn terminate_on_dispose_stops_server_and_tears_down_once() {
    let mut rig = Rig::launch("Terminate");
    let reader = rig.connect();
    reader.set_terminate_server_on_stop(true);
    assert!(reader.terminate_server_on_stop());

    reader.dispose();
    assert_eq!(rig.join(), ServerExit::Terminated);
    assert_eq!(rig.teardowns.load(Ordering::SeqCst), 1);
    assert!(rig.server.latest_flow().is_none());
}

#[test]
fn plain_dispose_keeps_server_for_next_client() {
    let mut rig = Rig::launch("Reconnect");
    let first = rig.connect();
    first.dispose();

    let second = rig.connect();
    assert!(!second.proxy().is_running().unwrap());
    second.set_terminate_server_on_stop(true);
    second.dispose();

    assert_eq!(rig.join(), ServerExit::Terminated);
    assert_eq!(rig.teardowns.load(Ordering::SeqCst), 2);
}

#[test]
fn sessions_never_see_frames_from_earlier_sessions() {
    let rig = Rig::launch("Sessions");
    let reader = rig.connect();
    let seen = collect_frame_numbers(&reader);

    for _ in 0..4 {
        let produced_before = reader.proxy().fake_frames_produced().unwrap();
        seen.lock().clear();
        reader.start().unwrap();
        assert!(wait_for(&seen, 2, Duration::from_secs(5)));
        reader.stop().unwrap();

        let frames = seen.lock().clone();
        assert!(u64::from(frames[0]) >= produced_before, "{frames:?} vs {produced_before}");
        assert!(frames.windows(2).all(|w| w[1] > w[0]), "{frames:?}");
    }
}

#[test]
fn dispose_twice_and_while_streaming() {
    let rig = Rig::launch("Dispose");
    let reader = rig.connect();
    let seen = collect_frame_numbers(&reader);
    reader.start().unwrap();
    assert!(wait_for(&seen, 1, Duration::from_secs(5)));

    reader.dispose();
    reader.dispose();
    assert!(reader.is_disposed());
    assert_eq!(reader.state(), ReaderState::Disposed);
    assert!(reader.start().is_err());
}

#[test]
fn test_hooks_drive_the_fake_camera() {
    let rig = Rig::launch("Hooks");
    let reader = rig.connect();
    let camera = reader.proxy();

    assert_eq!(camera.fake_inter_frame_interval_ms().unwrap(), INTERVAL_MS);
    camera.fake_set_inter_frame_interval_ms(25).unwrap();
    assert_eq!(camera.fake_inter_frame_interval_ms().unwrap(), 25);
    let err = camera.fake_set_inter_frame_interval_ms(-1).unwrap_err();
    assert!(err.is_invalid_argument());

    camera
        .fake_define_camera(128, 96, 10, vec![BinningMode::Binning1x1, BinningMode::Binning2x2])
        .unwrap();
    let attributes = camera.attributes().unwrap();
    assert_eq!((attributes.full_width, attributes.full_height), (128, 96));
    assert_eq!(attributes.bit_depth, 10);
    assert_eq!(camera.settings_static().unwrap().roi, NaturalRect::new(0, 0, 128, 96));

    camera
        .set_settings_dynamic(VideoSettingsDynamic {
            analog_gain_db: 6.0,
            analog_offset: 10,
        })
        .unwrap();
    assert_eq!(camera.settings_dynamic().unwrap().analog_offset, 10);
}

#[test]
fn registry_opens_and_closes_cameras_by_id() {
    let rig = Rig::launch("Registry");
    let registry = CameraRegistry::<FakeFlowClient>::new(rig.client_options());

    assert!(registry.open(&rig.name, 0).unwrap_err().is_invalid_argument());
    let id = registry.open(&rig.name, 4).unwrap();
    assert_eq!(registry.len(), 1);

    let handle = registry.require(id).unwrap();
    handle.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.queued() < 4 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    handle.stop().unwrap();
    assert!(handle.queued() <= 4);
    let latest = handle.latest_frame().unwrap();
    let frames = handle.take_frames();
    assert_eq!(frames.last().unwrap().frame_number, latest.frame_number);
    assert_eq!(handle.queued(), 0);
    drop(handle);

    assert!(registry.close(id));
    assert!(!registry.close(id));
    assert!(registry.get(id).is_none());
    assert!(registry.require(id).unwrap_err().is_invalid_argument());
}

#[test]
fn connecting_without_server_reports_guidance() {
    let dir = tempfile::tempdir().unwrap();
    let options = ClientOptions {
        namespace: PipeNamespace::new(dir.path()),
        connect_timeout: Duration::from_millis(100),
    };
    let err = PipeReader::<FakeFlowClient>::connect("E2E.Nobody", &options).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Communication);
    assert!(err.to_string().contains("Check that the server application is running"));
}
