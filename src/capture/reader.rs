//! Producer loop run on the frame-reader thread

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::capture::session::Inner;
use crate::capture::source::ReadOutcome;
use crate::capture::CaptureSource;
use crate::pipeline::{AdaptiveController, FpsMeter, HealthMonitor, HealthStatus, LoadProbe};
use crate::Frame;

/// Back-off while the health monitor has given up on the source
const FAILED_IDLE: Duration = Duration::from_millis(10);

/// What the reader owns while it runs, handed back when it exits
pub(crate) struct ReaderParts {
    pub(crate) source: Box<dyn CaptureSource>,
    pub(crate) probe: Box<dyn LoadProbe>,
}

/// Read frames until `inner.running` clears
///
/// Only the stop signal ends the loop: empty reads, I/O errors and failed reconnects are
/// all absorbed here.
pub(crate) fn run(inner: &Arc<Inner>, mut parts: ReaderParts) -> ReaderParts {
    let config = inner.live.load_full();
    let settings = &inner.config;
    let frame_size = config.format.frame_size(config.width, config.height);
    let idle = Duration::from_micros(settings.pipeline.idle_sleep_us);

    let mut buffer = inner.pool.acquire(frame_size);
    let mut health = HealthMonitor::new(settings.health.clone(), &inner.health);
    let mut controller = AdaptiveController::new(&settings.adaptive);
    let mut meter = FpsMeter::new(
        u64::from(config.fps) * u64::from(settings.adaptive.stats_window_secs.max(1)),
    );
    let mut frames = 0u64;
    let mut downgraded = false;

    info!(
        source = parts.source.name(),
        frame_size,
        format = %config.format,
        "Frame reader thread started"
    );

    while inner.running.load(Ordering::Acquire) {
        if health.status() == HealthStatus::Failed {
            thread::sleep(FAILED_IDLE);
            continue;
        }

        match ReadOutcome::from(parts.source.read(&mut buffer)) {
            ReadOutcome::Data(n) => {
                health.record_success();
                frames += 1;

                let sequence = inner.counters.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                let frame = Frame::new(
                    Bytes::copy_from_slice(&buffer[..n.min(buffer.len())]),
                    config.width,
                    config.height,
                    config.format,
                    sequence,
                );
                inner.deliver(frame);

                let Some(fps) = meter.tick() else {
                    continue;
                };
                inner
                    .counters
                    .last_fps_bits
                    .store(fps.to_bits(), Ordering::Relaxed);
                metrics::gauge!("aperture_capture_fps").set(fps);
                debug!(fps, frame_size = n, "Frame rate checkpoint");

                if settings.adaptive.enabled
                    && !downgraded
                    && fps < settings.adaptive.low_fps_threshold
                {
                    if let Some(change) = controller.evaluate(parts.probe.as_mut(), config.format)
                    {
                        downgraded = true;
                        inner.apply_format_change(change);
                    }
                    inner.health.set_high_load(controller.consecutive_high_load());
                }
            }
            outcome => {
                if let ReadOutcome::Failed(e) = outcome {
                    trace!(error = %e, "Capture read failed");
                }
                inner.counters.empty_reads.fetch_add(1, Ordering::Relaxed);

                if health.record_failure() {
                    inner.counters.stalls.fetch_add(1, Ordering::Relaxed);
                    let status =
                        health.reconnect(parts.source.as_mut(), &config, &inner.running);
                    if status == HealthStatus::Healthy {
                        inner.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    continue;
                }
                thread::sleep(idle);
            }
        }
    }

    info!(frames, "Frame reader thread stopped");
    inner.pool.release(buffer);
    parts
}
