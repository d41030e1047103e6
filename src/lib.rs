pub mod capture;
pub mod codec;
pub mod error;
pub mod pipeline;
pub mod storage;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{CaptureSession, CaptureSource, Frame, PixelFormat};
pub use error::{CaptureError, ConfigError, EncodeError, SourceError, StorageError};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub health: HealthConfig,
    pub adaptive: AdaptiveConfig,
    pub codec: CodecConfig,
    pub storage: StorageConfig,
}

/// Which backend produces frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    V4l2,
    Rpicam,
}

/// Per-session capture settings, handed to the source on every start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: Backend,
    /// Device node for the V4L2 backend; empty means auto-detect
    pub device: String,
    /// Camera index for the rpicam backend
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate
    pub fps: u32,
    pub format: PixelFormat,
    /// Pick `format` from system resources at initialize time
    pub auto_format: bool,
    /// Encoder quality passed to sources that compress (mjpeg)
    pub quality: u8,
    /// Source run time in milliseconds, 0 runs until stopped
    pub timeout_ms: u64,
    pub buffer_count: u32,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub pool_capacity: usize,
    /// Reader back-off after an empty read
    pub idle_sleep_us: u64,
    /// Frames that may wait for a slow frame callback before deliveries are dropped
    pub callback_capacity: usize,
    /// Default wait used by `CaptureSession::next_frame`
    pub capture_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive empty reads before the source counts as stalled
    pub stall_threshold: u32,
    /// Failure count restored after a failed reconnect
    pub backoff_floor: u32,
    pub reconnect_cooldown_ms: u64,
    /// Consecutive failed reconnects before giving up; unlimited when unset
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Seconds of nominal frames between frame-rate checkpoints
    pub stats_window_secs: u32,
    pub low_fps_threshold: f64,
    /// High-load checks in a row (exclusive) before downgrading
    pub high_load_trigger: u32,
    pub latency_threshold_ms: u64,
    pub restart_cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub quality: u8,
    pub optimize_huffman: bool,
    pub progressive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_directory: String,
    pub prefix: String,
    pub create_directories: bool,
    pub max_file_size: u64,
    /// Frames the binary saves before exiting; runs until Ctrl-C when unset
    pub frame_limit: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: Backend::V4l2,
            device: "/dev/video0".into(),
            camera_index: 0,
            width: 1920,
            height: 1080,
            fps: 30,
            format: PixelFormat::Yuv420,
            auto_format: false,
            quality: 85,
            timeout_ms: 0,
            buffer_count: 4,
            verbose: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: pipeline::queue::DEFAULT_QUEUE_CAPACITY,
            pool_capacity: pipeline::pool::DEFAULT_POOL_CAPACITY,
            idle_sleep_us: 100,
            callback_capacity: 4,
            capture_timeout_ms: 1000,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stall_threshold: 1000,
            backoff_floor: 500,
            reconnect_cooldown_ms: 1000,
            max_reconnect_attempts: None,
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stats_window_secs: 5,
            low_fps_threshold: 20.0,
            high_load_trigger: 10,
            latency_threshold_ms: 50,
            restart_cooldown_ms: 500,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            quality: 85,
            optimize_huffman: true,
            progressive: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_directory: "./captures".into(),
            prefix: "frame".into(),
            create_directories: true,
            max_file_size: 100 * 1024 * 1024,
            frame_limit: None,
        }
    }
}

impl Config {
    /// Defaults, then an optional TOML file, then `APERTURE__SECTION__KEY` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("APERTURE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "resolution {}x{}",
                capture.width, capture.height
            )));
        }
        if matches!(capture.format, PixelFormat::Yuv420 | PixelFormat::Raw)
            && (capture.width % 2 != 0 || capture.height % 2 != 0)
        {
            return Err(ConfigError::Invalid(
                "yuv420 needs even width and height".into(),
            ));
        }
        if capture.fps == 0 {
            return Err(ConfigError::Invalid("fps must be positive".into()));
        }
        for (name, quality) in [("capture", capture.quality), ("codec", self.codec.quality)] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::Invalid(format!(
                    "{name} quality {quality} outside 1..=100"
                )));
            }
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacity must be positive".into()));
        }
        if self.health.backoff_floor >= self.health.stall_threshold {
            return Err(ConfigError::Invalid(
                "backoff floor must stay below the stall threshold".into(),
            ));
        }
        Ok(())
    }
}
