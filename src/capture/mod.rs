pub mod frame;
pub(crate) mod reader;
#[cfg(feature = "rpicam")]
pub mod rpicam;
pub mod session;
pub mod source;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{FormatChange, Frame, PixelFormat};
#[cfg(feature = "rpicam")]
pub use rpicam::RpiCamSource;
pub use session::{CaptureSession, CaptureStats};
pub use source::{CaptureSource, ReadOutcome};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
