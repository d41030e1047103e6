//! Load-driven format downgrade

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::capture::frame::FormatChange;
use crate::{AdaptiveConfig, PixelFormat};

/// Tells the controller whether the host is overloaded
pub trait LoadProbe: Send {
    fn is_high_load(&mut self) -> bool;
}

/// Measures how late the scheduler wakes a short sleep
///
/// An oversleep beyond the threshold means the CPU is saturated.
pub struct SchedulingLatencyProbe {
    threshold: Duration,
    nap: Duration,
}

impl SchedulingLatencyProbe {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            nap: Duration::from_millis(1),
        }
    }
}

impl LoadProbe for SchedulingLatencyProbe {
    fn is_high_load(&mut self) -> bool {
        let start = Instant::now();
        thread::sleep(self.nap);
        let latency = start.elapsed().saturating_sub(self.nap);
        debug!(latency_us = latency.as_micros() as u64, "Scheduling latency");
        latency > self.threshold
    }
}

/// Watches the high-load streak and decides when to fall back to the cheapest format
///
/// The policy only ever downgrades; once load subsides the format stays where it is.
pub struct AdaptiveController {
    trigger: u32,
    consecutive_high_load: u32,
}

impl AdaptiveController {
    pub fn new(config: &AdaptiveConfig) -> Self {
        Self {
            trigger: config.high_load_trigger,
            consecutive_high_load: 0,
        }
    }

    pub fn consecutive_high_load(&self) -> u32 {
        self.consecutive_high_load
    }

    /// Feed one load observation; returns the format change to apply, if any
    pub fn observe(&mut self, high_load: bool, current: PixelFormat) -> Option<FormatChange> {
        if !high_load {
            self.consecutive_high_load = self.consecutive_high_load.saturating_sub(1);
            return None;
        }

        self.consecutive_high_load += 1;
        if self.consecutive_high_load > self.trigger && !current.is_cheapest() {
            info!(
                from = %current,
                to = %PixelFormat::CHEAPEST,
                streak = self.consecutive_high_load,
                "High CPU load detected, switching format"
            );
            return Some(FormatChange::new(current, PixelFormat::CHEAPEST));
        }
        None
    }

    /// Probe the load and feed the result to [`observe`](Self::observe)
    pub fn evaluate(
        &mut self,
        probe: &mut dyn LoadProbe,
        current: PixelFormat,
    ) -> Option<FormatChange> {
        let high_load = probe.is_high_load();
        self.observe(high_load, current)
    }
}

/// Frame-rate checkpoint every `interval` frames
pub struct FpsMeter {
    interval: u64,
    frames: u64,
    last_checkpoint: Instant,
}

impl FpsMeter {
    pub fn new(interval: u64) -> Self {
        Self {
            interval: interval.max(1),
            frames: 0,
            last_checkpoint: Instant::now(),
        }
    }

    /// Count a frame; at each checkpoint returns the rate achieved since the previous one
    pub fn tick(&mut self) -> Option<f64> {
        self.frames += 1;
        if self.frames % self.interval != 0 {
            return None;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_checkpoint).as_secs_f64();
        self.last_checkpoint = now;
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.interval as f64 / elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedProbe {
        answers: Vec<bool>,
        calls: usize,
    }

    impl LoadProbe for ScriptedProbe {
        fn is_high_load(&mut self) -> bool {
            let answer = self.answers.get(self.calls).copied().unwrap_or(false);
            self.calls += 1;
            answer
        }
    }

    #[test]
    fn eleven_high_load_checks_downgrade_once() {
        let mut controller = AdaptiveController::new(&AdaptiveConfig::default());
        let mut probe = ScriptedProbe {
            answers: vec![true; 20],
            calls: 0,
        };
        let mut format = PixelFormat::Mjpeg;
        let mut restarts = 0;

        for check in 1..=20 {
            if let Some(change) = controller.evaluate(&mut probe, format) {
                assert_eq!(check, 11);
                assert!(change.requires_restart);
                format = change.to;
                restarts += 1;
            }
        }

        assert_eq!(format, PixelFormat::Yuv420);
        assert_eq!(restarts, 1);
    }

    #[test]
    fn cheapest_format_is_never_changed() {
        let mut controller = AdaptiveController::new(&AdaptiveConfig::default());
        for _ in 0..50 {
            assert!(controller.observe(true, PixelFormat::Yuv420).is_none());
        }
    }

    #[test]
    fn calm_checks_wear_down_the_streak() {
        let mut controller = AdaptiveController::new(&AdaptiveConfig::default());
        for _ in 0..10 {
            controller.observe(true, PixelFormat::Rgb);
        }
        controller.observe(false, PixelFormat::Rgb);
        controller.observe(false, PixelFormat::Rgb);
        assert_eq!(controller.consecutive_high_load(), 8);
        // two more high checks only bring the streak back to 10
        controller.observe(true, PixelFormat::Rgb);
        assert!(controller.observe(true, PixelFormat::Rgb).is_none());

        for _ in 0..20 {
            controller.observe(false, PixelFormat::Rgb);
        }
        assert_eq!(controller.consecutive_high_load(), 0);
    }

    #[test]
    fn fps_meter_reports_each_interval() {
        let mut meter = FpsMeter::new(3);
        assert!(meter.tick().is_none());
        assert!(meter.tick().is_none());
        thread::sleep(Duration::from_millis(5));
        let fps = meter.tick().unwrap();
        assert!(fps > 0.0 && fps < 3.0 / 0.005 + 1.0);
    }
}
