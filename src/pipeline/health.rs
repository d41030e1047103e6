//! Stall detection and source reconnection

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::capture::CaptureSource;
use crate::{CaptureConfig, HealthConfig};

/// Where the reader stands with its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Healthy = 0,
    /// Stall threshold crossed, reconnect pending
    Degraded = 1,
    Reconnecting = 2,
    /// Retry limit reached; the reader idles until stopped
    Failed = 3,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            2 => HealthStatus::Reconnecting,
            _ => HealthStatus::Failed,
        }
    }
}

/// Health counters published by the reader thread
///
/// Written only by the reader; other threads read individual fields atomically.
#[derive(Debug)]
pub struct SharedHealth {
    status: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_high_load: AtomicU32,
    reconnect_attempts: AtomicU32,
}

/// Point-in-time copy of [`SharedHealth`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_high_load: u32,
    pub reconnect_attempts: u32,
}

impl SharedHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(HealthStatus::Healthy as u8),
            consecutive_failures: AtomicU32::new(0),
            consecutive_high_load: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: HealthStatus::from_u8(self.status.load(Ordering::Acquire)),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            consecutive_high_load: self.consecutive_high_load.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_high_load(&self, streak: u32) {
        self.consecutive_high_load.store(streak, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.status
            .store(HealthStatus::Healthy as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.reconnect_attempts.store(0, Ordering::Relaxed);
    }
}

impl Default for SharedHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconnect policy plus the reader's view of source health
///
/// Owned by the reader thread; every transition is mirrored into a [`SharedHealth`].
pub struct HealthMonitor<'a> {
    policy: HealthConfig,
    status: HealthStatus,
    consecutive_failures: u32,
    reconnect_attempts: u32,
    shared: &'a SharedHealth,
}

impl<'a> HealthMonitor<'a> {
    pub fn new(policy: HealthConfig, shared: &'a SharedHealth) -> Self {
        shared.reset();
        Self {
            policy,
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            reconnect_attempts: 0,
            shared,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    fn set_status(&mut self, status: HealthStatus) {
        self.status = status;
        self.shared.status.store(status as u8, Ordering::Release);
    }

    fn set_failures(&mut self, failures: u32) {
        self.consecutive_failures = failures;
        self.shared
            .consecutive_failures
            .store(failures, Ordering::Relaxed);
    }

    /// A read produced data
    pub fn record_success(&mut self) {
        if self.consecutive_failures != 0 {
            self.set_failures(0);
        }
        if self.status == HealthStatus::Degraded {
            info!("Capture source producing frames again");
            self.set_status(HealthStatus::Healthy);
        }
    }

    /// A read produced nothing; true when the stall threshold has been crossed
    pub fn record_failure(&mut self) -> bool {
        if self.status == HealthStatus::Failed {
            return false;
        }
        self.set_failures(self.consecutive_failures.saturating_add(1));
        if self.consecutive_failures > self.policy.stall_threshold {
            if self.status == HealthStatus::Healthy {
                warn!(
                    failures = self.consecutive_failures,
                    "Capture source stalled"
                );
            }
            self.set_status(HealthStatus::Degraded);
            return true;
        }
        false
    }

    /// Stop, cool down and restart the source
    ///
    /// Runs on the reader thread. The cooldown ends early once `running` clears, in which
    /// case the source is left stopped.
    pub fn reconnect<S>(
        &mut self,
        source: &mut S,
        config: &CaptureConfig,
        running: &AtomicBool,
    ) -> HealthStatus
    where
        S: CaptureSource + ?Sized,
    {
        self.set_status(HealthStatus::Reconnecting);
        info!(
            source = source.name(),
            attempt = self.reconnect_attempts + 1,
            "Attempting camera reconnection"
        );

        source.stop();
        if !cooldown(
            Duration::from_millis(self.policy.reconnect_cooldown_ms),
            running,
        ) {
            self.set_status(HealthStatus::Degraded);
            return self.status;
        }

        match source.start(config) {
            Ok(()) => {
                info!(source = source.name(), "Camera reconnection successful");
                metrics::counter!("aperture_reconnects_total").increment(1);
                self.reconnect_attempts = 0;
                self.shared.reconnect_attempts.store(0, Ordering::Relaxed);
                self.set_failures(0);
                self.set_status(HealthStatus::Healthy);
            }
            Err(e) => {
                self.reconnect_attempts += 1;
                self.shared
                    .reconnect_attempts
                    .store(self.reconnect_attempts, Ordering::Relaxed);
                warn!(
                    error = %e,
                    attempt = self.reconnect_attempts,
                    "Camera reconnection failed"
                );
                self.set_failures(self.policy.backoff_floor);

                let exhausted = self
                    .policy
                    .max_reconnect_attempts
                    .is_some_and(|max| self.reconnect_attempts >= max);
                if exhausted {
                    error!(
                        attempts = self.reconnect_attempts,
                        "Giving up on capture source"
                    );
                    self.set_status(HealthStatus::Failed);
                } else {
                    self.set_status(HealthStatus::Degraded);
                }
            }
        }
        self.status
    }
}

/// Sleep for `duration` in short slices; false if `running` cleared meanwhile
fn cooldown(duration: Duration, running: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(10);
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        thread::sleep(remaining.min(SLICE));
    }
}
