use std::io;

use thiserror::Error;

/// Errors raised by a capture backend
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("capture device unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported pixel format for this backend: {0}")]
    UnsupportedFormat(crate::PixelFormat),

    #[error("capture source not started")]
    NotStarted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors surfaced by a capture session
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("capture session closed")]
    Closed,

    #[error("capture source lost after a reader failure")]
    SourceLost,

    #[error("source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("capture thread panicked")]
    ReaderPanicked,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Errors from the JPEG codec pipeline
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("quality {0} outside 1..=100")]
    Quality(u8),

    #[error("invalid dimensions {width}x{height}")]
    Dimensions { width: u32, height: u32 },

    #[error("buffer holds {actual} bytes, {width}x{height} needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("frame payload is not a JPEG stream")]
    NotJpeg,

    #[error("jpeg encoder failed: {0}")]
    Encoder(String),
}

/// Errors while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors while writing captured data to disk
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{size} bytes exceeds the {limit} byte file limit")]
    TooLarge { size: u64, limit: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}
