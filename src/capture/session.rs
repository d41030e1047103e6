//! Capture session: owns the source, the reader thread and the frame queue

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use flume::TrySendError;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::frame::FormatChange;
use crate::capture::reader::{self, ReaderParts};
use crate::capture::CaptureSource;
use crate::codec::{self, EncodeOptions};
use crate::pipeline::{
    BufferPool, FrameQueue, HealthSnapshot, LoadProbe, SchedulingLatencyProbe, SharedHealth,
};
use crate::{utils, CaptureConfig, CaptureError, Config, EncodeError, Frame, PixelFormat};

/// Counters for a session, cumulative across restarts
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    /// Frames evicted from the queue before anyone popped them
    pub frames_evicted: u64,
    /// Frames the callback never saw because it was behind
    pub callback_dropped: u64,
    pub empty_reads: u64,
    pub stalls: u64,
    pub reconnects: u64,
    /// Restarts triggered by a format downgrade
    pub format_restarts: u64,
    /// Frame rate at the last checkpoint
    pub last_fps: f64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) sequence: AtomicU64,
    pub(crate) callback_dropped: AtomicU64,
    pub(crate) empty_reads: AtomicU64,
    pub(crate) stalls: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) format_restarts: AtomicU64,
    pub(crate) last_fps_bits: AtomicU64,
}

/// Parts only touched while holding the control lock
struct Control {
    /// Present whenever no reader is running
    source: Option<Box<dyn CaptureSource>>,
    probe: Option<Box<dyn LoadProbe>>,
    reader: Option<JoinHandle<ReaderParts>>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) live: ArcSwap<CaptureConfig>,
    pub(crate) running: AtomicBool,
    pub(crate) queue: FrameQueue,
    pub(crate) pool: BufferPool,
    pub(crate) health: SharedHealth,
    pub(crate) counters: Counters,
    callback: ArcSwapOption<flume::Sender<Frame>>,
    control: Mutex<Control>,
    restart_pending: AtomicBool,
    /// Bumped by every stop the owner asks for; a pending restart only resumes if unchanged
    stop_epoch: AtomicU64,
    closed: AtomicBool,
}

/// A camera capture session
///
/// Frames are read on a dedicated thread and handed out through [`capture_frame`] or a
/// frame callback. Dropping the session stops capture.
///
/// [`capture_frame`]: CaptureSession::capture_frame
pub struct CaptureSession {
    inner: Arc<Inner>,
}

impl CaptureSession {
    /// Validate `config`, check the source is present and build a stopped session
    #[instrument(skip_all, fields(source = source.name()))]
    pub fn initialize(
        mut config: Config,
        mut source: impl CaptureSource + 'static,
    ) -> Result<Self, CaptureError> {
        if config.capture.auto_format {
            let resources = utils::SystemResources::detect();
            config.capture.format = utils::select_optimal_format(&resources);
            info!(format = %config.capture.format, ?resources, "Auto-selected capture format");
        }
        config.validate()?;

        let capture = &config.capture;
        info!(
            backend = ?capture.backend,
            camera = capture.camera_index,
            width = capture.width,
            height = capture.height,
            format = %capture.format,
            quality = capture.quality,
            "Initializing capture session"
        );
        source
            .probe(capture)
            .map_err(CaptureError::SourceUnavailable)?;

        let probe = SchedulingLatencyProbe::new(Duration::from_millis(
            config.adaptive.latency_threshold_ms,
        ));
        let inner = Inner {
            live: ArcSwap::from_pointee(config.capture.clone()),
            running: AtomicBool::new(false),
            queue: FrameQueue::new(config.pipeline.queue_capacity),
            pool: BufferPool::new(config.pipeline.pool_capacity),
            health: SharedHealth::new(),
            counters: Counters::default(),
            callback: ArcSwapOption::empty(),
            control: Mutex::new(Control {
                source: Some(Box::new(source)),
                probe: Some(Box::new(probe)),
                reader: None,
            }),
            restart_pending: AtomicBool::new(false),
            stop_epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Replace the load probe consulted by the adaptive controller
    ///
    /// Takes effect at the next start.
    pub fn with_load_probe(self, probe: impl LoadProbe + 'static) -> Self {
        self.inner.lock_control().probe = Some(Box::new(probe));
        self
    }

    pub fn start_capture(&self) -> Result<(), CaptureError> {
        self.inner.start()
    }

    /// Stop capture, cancelling a pending format restart
    pub fn stop_capture(&self) -> Result<(), CaptureError> {
        self.inner.stop_epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.stop().map(|_| ())
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for the next frame
    ///
    /// `None` on timeout. While the source reconnects or restarts no frames arrive, so
    /// callers see timeouts.
    pub fn capture_frame(&self, timeout: Duration) -> Option<Frame> {
        self.inner.queue.pop_wait(timeout)
    }

    /// [`capture_frame`](Self::capture_frame) with the configured default timeout
    pub fn next_frame(&self) -> Option<Frame> {
        self.capture_frame(Duration::from_millis(
            self.inner.config.pipeline.capture_timeout_ms,
        ))
    }

    /// Deliver every captured frame to `callback` on a dedicated thread
    ///
    /// Frames are handed over before they are queued. A callback that falls behind by more
    /// than `pipeline.callback_capacity` frames misses frames; the reader never waits for
    /// it. Replaces any previous callback.
    pub fn set_frame_callback<F>(&self, mut callback: F) -> Result<(), CaptureError>
    where
        F: FnMut(Frame) + Send + 'static,
    {
        let (tx, rx) = flume::bounded::<Frame>(self.inner.config.pipeline.callback_capacity.max(1));
        thread::Builder::new()
            .name("frame-callback".into())
            .spawn(move || {
                for frame in rx.iter() {
                    let sequence = frame.sequence;
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(frame))).is_err() {
                        error!(sequence, "Frame callback panicked");
                    }
                }
                debug!("Frame callback dispatcher finished");
            })
            .map_err(CaptureError::Spawn)?;

        // dropping the previous sender lets its dispatcher drain and exit
        self.inner.callback.store(Some(Arc::new(tx)));
        Ok(())
    }

    pub fn clear_frame_callback(&self) {
        self.inner.callback.store(None);
    }

    /// Compress a frame with the session's codec settings at `quality`
    pub fn compress(&self, frame: &Frame, quality: u8) -> Result<Bytes, EncodeError> {
        let options = EncodeOptions {
            quality,
            ..EncodeOptions::from(self.inner.config.codec.clone())
        };
        codec::compress(frame, &options)
    }

    /// Change the capture format, restarting the source if it is streaming
    pub fn set_format(&self, format: PixelFormat) -> Result<FormatChange, CaptureError> {
        let change = FormatChange::new(self.inner.live.load().format, format);
        if !change.requires_restart {
            return Ok(change);
        }
        self.inner.stop_epoch.fetch_add(1, Ordering::AcqRel);
        let was_running = self.inner.stop()?;
        self.inner.set_live_format(format);
        if was_running {
            self.inner.start()?;
        }
        Ok(change)
    }

    pub fn health(&self) -> HealthSnapshot {
        self.inner.health.snapshot()
    }

    pub fn stats(&self) -> CaptureStats {
        let counters = &self.inner.counters;
        let queue = self.inner.queue.stats();
        CaptureStats {
            frames_captured: counters.sequence.load(Ordering::Relaxed),
            frames_evicted: queue.dropped as u64,
            callback_dropped: counters.callback_dropped.load(Ordering::Relaxed),
            empty_reads: counters.empty_reads.load(Ordering::Relaxed),
            stalls: counters.stalls.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
            format_restarts: counters.format_restarts.load(Ordering::Relaxed),
            last_fps: f64::from_bits(counters.last_fps_bits.load(Ordering::Relaxed)),
        }
    }

    /// Capture settings currently in force
    pub fn live_config(&self) -> Arc<CaptureConfig> {
        self.inner.live.load_full()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Frames waiting in the queue
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.pool
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.callback.store(None);
        if let Err(e) = self.inner.stop() {
            warn!(error = %e, "Capture did not stop cleanly");
        }
    }
}

impl Inner {
    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(self: &Arc<Self>) -> Result<(), CaptureError> {
        self.start_unless_stopped_since(None).map(|_| ())
    }

    /// Start capture; with `epoch` set, skip the start if the owner stopped capture after it
    ///
    /// Returns false when skipped. The epoch is checked under the control lock, so a
    /// concurrent `stop_capture` either prevents the start or joins the reader it spawned.
    fn start_unless_stopped_since(
        self: &Arc<Self>,
        epoch: Option<u64>,
    ) -> Result<bool, CaptureError> {
        let mut control = self.lock_control();
        if self.closed.load(Ordering::Acquire) {
            return Err(CaptureError::Closed);
        }
        if epoch.is_some_and(|epoch| epoch != self.stop_epoch.load(Ordering::Acquire)) {
            return Ok(false);
        }
        if control.reader.is_some() {
            info!("Already capturing");
            return Ok(true);
        }
        let Some(mut source) = control.source.take() else {
            return Err(CaptureError::SourceLost);
        };
        let probe = control.probe.take().unwrap_or_else(|| {
            Box::new(SchedulingLatencyProbe::new(Duration::from_millis(
                self.config.adaptive.latency_threshold_ms,
            )))
        });

        let live = self.live.load_full();
        if let Err(e) = source.start(&live) {
            error!(error = %e, "Failed to start capture source");
            control.source = Some(source);
            control.probe = Some(probe);
            return Err(CaptureError::SourceUnavailable(e));
        }

        self.running.store(true, Ordering::Release);
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("frame-reader".into())
            .spawn(move || reader::run(&inner, ReaderParts { source, probe }));
        match spawned {
            Ok(handle) => {
                control.reader = Some(handle);
                info!(format = %live.format, "Camera capture started");
                Ok(true)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(CaptureError::Spawn(e))
            }
        }
    }

    /// Stop and join the reader; true if one was running
    fn stop(&self) -> Result<bool, CaptureError> {
        let mut control = self.lock_control();
        let Some(handle) = control.reader.take() else {
            return Ok(false);
        };
        self.running.store(false, Ordering::Release);

        match handle.join() {
            Ok(mut parts) => {
                parts.source.stop();
                control.source = Some(parts.source);
                control.probe = Some(parts.probe);
                info!("Camera capture stopped");
                Ok(true)
            }
            Err(_) => {
                error!("Frame reader thread panicked, capture source lost");
                Err(CaptureError::ReaderPanicked)
            }
        }
    }

    fn set_live_format(&self, format: PixelFormat) {
        self.live.rcu(|current| {
            let mut next = CaptureConfig::clone(current);
            next.format = format;
            next
        });
    }

    /// Hand a frame to the callback, then to the queue
    pub(crate) fn deliver(&self, frame: Frame) {
        metrics::counter!("aperture_frames_captured_total").increment(1);
        if let Some(tx) = &*self.callback.load() {
            if let Err(TrySendError::Full(_)) = tx.try_send(frame.clone()) {
                self.counters.callback_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("aperture_callback_dropped_total").increment(1);
            }
        }
        if self.queue.push(frame) {
            metrics::counter!("aperture_frames_evicted_total").increment(1);
        }
    }

    /// Apply a downgrade decided on the reader thread
    ///
    /// Stopping joins the reader, so the restart runs on its own short-lived thread.
    pub(crate) fn apply_format_change(self: &Arc<Self>, change: FormatChange) {
        self.set_live_format(change.to);
        if !change.requires_restart || self.restart_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.counters.format_restarts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aperture_format_restarts_total").increment(1);

        let inner = Arc::downgrade(self);
        let cooldown = Duration::from_millis(self.config.adaptive.restart_cooldown_ms);
        let spawned = thread::Builder::new()
            .name("capture-restart".into())
            .spawn(move || restart(inner, cooldown));
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn capture restart");
            self.restart_pending.store(false, Ordering::Release);
        }
    }
}

fn restart(inner: std::sync::Weak<Inner>, cooldown: Duration) {
    let Some(session) = inner.upgrade() else {
        return;
    };
    let epoch = session.stop_epoch.load(Ordering::Acquire);
    match session.stop() {
        Ok(true) => {}
        Ok(false) => {
            // stopped by its owner meanwhile
            session.restart_pending.store(false, Ordering::Release);
            return;
        }
        Err(e) => {
            error!(error = %e, "Restart could not stop capture");
            session.restart_pending.store(false, Ordering::Release);
            return;
        }
    }
    drop(session);

    thread::sleep(cooldown);

    let Some(session) = inner.upgrade() else {
        return;
    };
    match session.start_unless_stopped_since(Some(epoch)) {
        Ok(true) => info!(format = %session.live.load().format, "Capture restarted"),
        Ok(false) => info!("Capture stopped during restart cooldown, staying stopped"),
        Err(CaptureError::Closed) => {}
        Err(e) => error!(error = %e, "Capture restart failed"),
    }
    session.restart_pending.store(false, Ordering::Release);
}
