//! Frame compression: YUV420 -> RGB -> JPEG

pub mod convert;
pub mod jpeg;

use bytes::Bytes;

use crate::{EncodeError, Frame, PixelFormat};

pub use convert::{yuv420_len, yuv420_to_rgb, yuv420_to_rgb_into};
pub use jpeg::{compress_to_jpeg, is_jpeg, EncodeOptions};

/// Compress a captured frame to JPEG
///
/// MJPEG frames already hold a JPEG and are passed through after a marker check.
pub fn compress(frame: &Frame, options: &EncodeOptions) -> Result<Bytes, EncodeError> {
    match frame.format {
        PixelFormat::Yuv420 | PixelFormat::Raw => {
            let rgb = yuv420_to_rgb(&frame.data, frame.width, frame.height)?;
            compress_to_jpeg(&rgb, frame.width, frame.height, options).map(Bytes::from)
        }
        PixelFormat::Rgb => {
            compress_to_jpeg(&frame.data, frame.width, frame.height, options).map(Bytes::from)
        }
        PixelFormat::Mjpeg => {
            if !(1..=100).contains(&options.quality) {
                return Err(EncodeError::Quality(options.quality));
            }
            if is_jpeg(&frame.data) {
                Ok(frame.data.clone())
            } else {
                Err(EncodeError::NotJpeg)
            }
        }
    }
}
