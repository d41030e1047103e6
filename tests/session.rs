use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use aperture::pipeline::{HealthStatus, LoadProbe};
use aperture::{
    CaptureConfig, CaptureError, CaptureSession, CaptureSource, Config, Frame, PixelFormat,
    SourceError,
};

#[derive(Default)]
struct Script {
    /// Formats passed to every successful start
    started: Vec<PixelFormat>,
    start_calls: u32,
    stops: u32,
    /// Fail this many starts after the first one
    failing_restarts: u32,
    /// Go silent once this many frames were produced, until the next successful start
    silent_after: Option<u64>,
    produced: u64,
    unavailable: bool,
}

/// In-memory camera driven by a shared script
#[derive(Clone, Default)]
struct ScriptedSource {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSource {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }
}

impl CaptureSource for ScriptedSource {
    fn probe(&mut self, _config: &CaptureConfig) -> Result<(), SourceError> {
        if self.script().unavailable {
            return Err(SourceError::Unavailable("no camera attached".into()));
        }
        Ok(())
    }

    fn start(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
        let mut script = self.script();
        script.start_calls += 1;
        if script.start_calls > 1 && script.failing_restarts > 0 {
            script.failing_restarts -= 1;
            return Err(SourceError::Unavailable("camera busy".into()));
        }
        script.started.push(config.format);
        if script.started.len() > 1 {
            script.silent_after = None;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let silent = {
            let mut script = self.script();
            let silent = script
                .silent_after
                .is_some_and(|after| script.produced >= after);
            if !silent {
                script.produced += 1;
            }
            silent
        };
        thread::sleep(Duration::from_millis(1));
        if silent {
            return Ok(0);
        }
        buf.fill(0x80);
        Ok(buf.len())
    }

    fn stop(&mut self) {
        self.script().stops += 1;
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct AlwaysBusy;

impl LoadProbe for AlwaysBusy {
    fn is_high_load(&mut self) -> bool {
        true
    }
}

fn small_config() -> Config {
    let mut config = Config::default();
    config.capture.width = 4;
    config.capture.height = 4;
    config.adaptive.enabled = false;
    config
}

/// Pop frames until `accept` matches one or `limit` passes
fn wait_for(session: &CaptureSession, limit: Duration, accept: impl Fn(&Frame) -> bool) -> Frame {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Some(frame) = session.capture_frame(Duration::from_millis(50)) {
            if accept(&frame) {
                return frame;
            }
        }
    }
    panic!("no matching frame within {limit:?}");
}

#[test]
fn frames_flow_in_order() {
    let source = ScriptedSource::default();
    let session = CaptureSession::initialize(small_config(), source.clone()).unwrap();
    session.start_capture().unwrap();
    assert!(session.is_capturing());

    let first = session.capture_frame(Duration::from_secs(2)).unwrap();
    let second = session.capture_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(first.len(), 24);
    assert_eq!((first.width, first.height), (4, 4));
    assert_eq!(first.format, PixelFormat::Yuv420);
    assert!(second.sequence > first.sequence);
    assert!(second.timestamp >= first.timestamp);

    session.stop_capture().unwrap();
    assert!(!session.is_capturing());
    assert_eq!(source.script().started, vec![PixelFormat::Yuv420]);
}

#[test]
fn unavailable_source_fails_initialize() {
    let source = ScriptedSource::default();
    source.script().unavailable = true;
    let result = CaptureSession::initialize(small_config(), source);
    assert!(matches!(result, Err(CaptureError::SourceUnavailable(_))));
}

#[test]
fn capture_frame_times_out_without_data() {
    let source = ScriptedSource::default();
    source.script().silent_after = Some(0);
    let session = CaptureSession::initialize(small_config(), source).unwrap();
    session.start_capture().unwrap();

    let started = Instant::now();
    assert!(session.capture_frame(Duration::from_millis(100)).is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(session.stats().frames_captured, 0);
}

#[test]
fn full_queue_evicts_oldest() {
    let source = ScriptedSource::default();
    let session = CaptureSession::initialize(small_config(), source).unwrap();
    session.start_capture().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.stats().frames_captured < 20 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    session.stop_capture().unwrap();

    let stats = session.stats();
    assert!(stats.frames_captured >= 20);
    assert_eq!(session.queued(), 10);
    assert_eq!(stats.frames_evicted, stats.frames_captured - 10);

    // the survivors are the newest frames
    let oldest = session.capture_frame(Duration::ZERO).unwrap();
    assert_eq!(oldest.sequence, stats.frames_captured - 9);
}

#[test]
fn callback_sees_frames_before_queue() {
    let source = ScriptedSource::default();
    let session = CaptureSession::initialize(small_config(), source).unwrap();
    let (tx, rx) = flume::unbounded::<u64>();
    session
        .set_frame_callback(move |frame| {
            let _ = tx.send(frame.sequence);
        })
        .unwrap();
    session.start_capture().unwrap();

    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first, 1);
    let queued = session.capture_frame(Duration::from_secs(2)).unwrap();
    assert_eq!(queued.sequence, 1);
}

#[test]
fn panicking_callback_does_not_stop_capture() {
    let source = ScriptedSource::default();
    let session = CaptureSession::initialize(small_config(), source).unwrap();
    session
        .set_frame_callback(|frame| {
            if frame.sequence == 1 {
                panic!("callback failure");
            }
        })
        .unwrap();
    session.start_capture().unwrap();

    wait_for(&session, Duration::from_secs(2), |frame| frame.sequence > 3);
    assert!(session.is_capturing());
}

#[test]
fn restart_keeps_sequence_increasing() {
    let source = ScriptedSource::default();
    let session = CaptureSession::initialize(small_config(), source.clone()).unwrap();

    session.start_capture().unwrap();
    // a second start while running is a no-op
    session.start_capture().unwrap();
    let before = session.capture_frame(Duration::from_secs(2)).unwrap();
    session.stop_capture().unwrap();
    // stopping twice is harmless
    session.stop_capture().unwrap();

    session.start_capture().unwrap();
    let last_before = session.stats().frames_captured;
    let after = wait_for(&session, Duration::from_secs(2), |frame| {
        frame.sequence > last_before
    });
    assert!(after.sequence > before.sequence);

    drop(session);
    let script = source.script();
    assert_eq!(script.started.len(), 2);
    assert_eq!(script.stops, 2);
}

#[test]
fn set_format_restarts_running_source() {
    let source = ScriptedSource::default();
    let mut config = small_config();
    config.capture.format = PixelFormat::Mjpeg;
    let session = CaptureSession::initialize(config, source.clone()).unwrap();
    session.start_capture().unwrap();

    let change = session.set_format(PixelFormat::Yuv420).unwrap();
    assert!(change.requires_restart);
    assert_eq!(change.to, PixelFormat::Yuv420);
    assert!(session.is_capturing());

    let frame = wait_for(&session, Duration::from_secs(2), |frame| {
        frame.format == PixelFormat::Yuv420
    });
    assert_eq!(frame.len(), 24);
    assert_eq!(
        source.script().started,
        vec![PixelFormat::Mjpeg, PixelFormat::Yuv420]
    );

    let same = session.set_format(PixelFormat::Yuv420).unwrap();
    assert!(!same.requires_restart);
    assert_eq!(source.script().started.len(), 2);
}

#[test]
fn stalled_source_reconnects() {
    let source = ScriptedSource::default();
    {
        let mut script = source.script();
        script.silent_after = Some(5);
        script.failing_restarts = 2;
    }
    let mut config = small_config();
    config.health.stall_threshold = 20;
    config.health.backoff_floor = 10;
    config.health.reconnect_cooldown_ms = 0;
    let session = CaptureSession::initialize(config, source.clone()).unwrap();
    session.start_capture().unwrap();

    let resumed = wait_for(&session, Duration::from_secs(10), |frame| frame.sequence > 5);
    assert_eq!(resumed.sequence, 6);

    let stats = session.stats();
    assert_eq!(stats.reconnects, 1);
    assert!(stats.stalls >= 3);
    assert_eq!(session.health().status, HealthStatus::Healthy);

    session.stop_capture().unwrap();
    let script = source.script();
    // initial start, two refused reconnects, one that succeeded
    assert_eq!(script.start_calls, 4);
    assert_eq!(script.started.len(), 2);
}

#[test]
fn sustained_load_downgrades_format_once() {
    let source = ScriptedSource::default();
    let mut config = small_config();
    config.capture.format = PixelFormat::Mjpeg;
    config.capture.fps = 1;
    config.adaptive.enabled = true;
    config.adaptive.stats_window_secs = 1;
    config.adaptive.low_fps_threshold = 1e9;
    config.adaptive.restart_cooldown_ms = 0;
    let session = CaptureSession::initialize(config, source.clone())
        .unwrap()
        .with_load_probe(AlwaysBusy);
    session.start_capture().unwrap();

    let frame = wait_for(&session, Duration::from_secs(10), |frame| {
        frame.format == PixelFormat::Yuv420
    });
    assert_eq!(frame.len(), 24);
    assert_eq!(session.live_config().format, PixelFormat::Yuv420);

    // already on the cheapest format, load keeps coming but nothing changes
    let later = session.stats().frames_captured + 20;
    wait_for(&session, Duration::from_secs(10), |frame| frame.sequence > later);

    let stats = session.stats();
    assert_eq!(stats.format_restarts, 1);
    assert!(session.health().consecutive_high_load > 10);
    session.stop_capture().unwrap();
    assert_eq!(
        source.script().started,
        vec![PixelFormat::Mjpeg, PixelFormat::Yuv420]
    );
}

#[test]
fn stop_during_restart_cooldown_stays_stopped() {
    let source = ScriptedSource::default();
    let mut config = small_config();
    config.capture.format = PixelFormat::Mjpeg;
    config.capture.fps = 1;
    config.adaptive.enabled = true;
    config.adaptive.stats_window_secs = 1;
    config.adaptive.low_fps_threshold = 1e9;
    config.adaptive.restart_cooldown_ms = 500;
    let session = CaptureSession::initialize(config, source.clone())
        .unwrap()
        .with_load_probe(AlwaysBusy);
    session.start_capture().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while session.stats().format_restarts == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(session.stats().format_restarts, 1);

    // inside the cooldown
    thread::sleep(Duration::from_millis(100));
    session.stop_capture().unwrap();
    assert!(!session.is_capturing());

    thread::sleep(Duration::from_secs(1));
    assert!(!session.is_capturing());
    assert_eq!(source.script().started, vec![PixelFormat::Mjpeg]);

    // the owner can still resume with the downgraded format
    session.start_capture().unwrap();
    wait_for(&session, Duration::from_secs(2), |frame| {
        frame.format == PixelFormat::Yuv420
    });
}
