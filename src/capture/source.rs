//! Contract between the frame reader and a capture backend

use std::io;

use crate::error::SourceError;
use crate::CaptureConfig;

/// Something that produces raw frame bytes
///
/// A source is driven by exactly one thread at a time: the session while starting and
/// stopping, the reader thread while streaming.
pub trait CaptureSource: Send {
    /// Check the device or tool behind this source exists, without streaming
    fn probe(&mut self, _config: &CaptureConfig) -> Result<(), SourceError> {
        Ok(())
    }

    /// Begin producing a stream framed by `config.format.frame_size(width, height)`
    fn start(&mut self, config: &CaptureConfig) -> Result<(), SourceError>;

    /// Read whatever is available into `buf`
    ///
    /// `Ok(0)` or an error of kind [`io::ErrorKind::WouldBlock`] means no data yet. Calls
    /// must return promptly; a read may block for a few milliseconds at most.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Stop producing; safe to call repeatedly
    fn stop(&mut self);

    /// Short label for logs
    fn name(&self) -> &str {
        "source"
    }
}

impl<S: CaptureSource + ?Sized> CaptureSource for Box<S> {
    fn probe(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
        (**self).probe(config)
    }

    fn start(&mut self, config: &CaptureConfig) -> Result<(), SourceError> {
        (**self).start(config)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// What a single read produced
#[derive(Debug)]
pub enum ReadOutcome {
    Data(usize),
    /// No data yet; transient, retried by the reader
    Empty,
    /// I/O failure; treated like `Empty` by the reader, kept for logging
    Failed(io::Error),
}

impl From<io::Result<usize>> for ReadOutcome {
    fn from(result: io::Result<usize>) -> Self {
        match result {
            Ok(0) => ReadOutcome::Empty,
            Ok(n) => ReadOutcome::Data(n),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                ReadOutcome::Empty
            }
            Err(e) => ReadOutcome::Failed(e),
        }
    }
}
