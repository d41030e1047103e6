//! V4L2 capture backend using memory-mapped buffers

use std::io;
use std::time::Duration;

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::CaptureSource;
use crate::{utils, CaptureConfig, PixelFormat, SourceError};

/// Kernel capture device
pub struct V4l2Source {
    /// Device node, resolved at first start when the config leaves it empty
    path: Option<String>,
    device: Option<Box<Device>>,
    stream: Option<MmapStream<'static>>,
    /// How long one read may wait for a dequeued buffer
    poll_timeout: Duration,
}

impl V4l2Source {
    pub fn new() -> Self {
        Self {
            path: None,
            device: None,
            stream: None,
            poll_timeout: Duration::from_millis(5),
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn fourcc(format: PixelFormat) -> FourCC {
        match format {
            PixelFormat::Yuv420 | PixelFormat::Raw => FourCC::new(b"YU12"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Rgb => FourCC::new(b"RGB3"),
        }
    }

    fn resolve_path(&mut self, config: &CaptureConfig) -> Result<String, SourceError> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let path = if config.device.is_empty() {
            utils::auto_detect_device()?
        } else {
            config.device.clone()
        };
        self.path = Some(path.clone());
        Ok(path)
    }

    fn open(path: &str) -> Result<Device, SourceError> {
        let device = Device::with_path(path)
            .map_err(|e| SourceError::Unavailable(format!("{path}: {e}")))?;
        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SourceError::Unavailable(format!(
                "{path} doesn't support video capture"
            )));
        }
        Ok(device)
    }
}

impl Default for V4l2Source {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureSource for V4l2Source {
    fn probe(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
        let path = self.resolve_path(config)?;
        Self::open(&path).map(|_| ())
    }

    #[instrument(skip(self, config), fields(format = %config.format))]
    fn start(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
        self.stop();
        let path = self.resolve_path(config)?;
        let device = Box::new(Self::open(&path)?);

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = Self::fourcc(config.format);
        let actual = device.set_format(&fmt)?;
        if actual.fourcc != fmt.fourcc {
            return Err(SourceError::UnsupportedFormat(config.format));
        }
        if (actual.width, actual.height) != (config.width, config.height) {
            warn!(
                width = actual.width,
                height = actual.height,
                "Driver adjusted the requested resolution"
            );
        }
        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!(error = %e, fps = config.fps, "Could not set frame rate");
        }

        let mut stream =
            MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)?;
        stream.set_timeout(self.poll_timeout);

        info!(
            "Capture stream started with {} buffers",
            config.buffer_count
        );
        self.stream = Some(stream);
        self.device = Some(device);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream not started"))?;

        let (data, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(data.len());
        let n = used.min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn stop(&mut self) {
        // stream first, it holds the device's buffers
        self.stream = None;
        self.device = None;
    }

    fn name(&self) -> &str {
        "v4l2"
    }
}
