use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single captured frame
///
/// Immutable once built. `data` is reference counted, so handing the same frame to the
/// callback channel and the queue does not copy pixels.
#[derive(Clone)]
pub struct Frame {
    pub data: Bytes,

    /// Monotonic capture time, taken when the read completed
    pub timestamp: Instant,

    /// Per-session frame counter, starting at 1
    pub sequence: u64,

    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Frame {
    pub fn new(data: Bytes, width: u32, height: u32, format: PixelFormat, sequence: u64) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
            sequence,
            width,
            height,
            format,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the payload carries a whole frame for its declared format
    pub fn is_complete(&self) -> bool {
        match self.format {
            // compressed frames have no fixed size
            PixelFormat::Mjpeg => !self.data.is_empty(),
            _ => self.data.len() >= self.format.frame_size(self.width, self.height),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("len", &self.data.len())
            .field("head", &HexHead(&self.data))
            .finish()
    }
}

/// First 16 bytes of a payload, hex encoded
struct HexHead<'a>(&'a [u8]);

impl fmt::Debug for HexHead<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().take(16).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Pixel formats a capture source can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar Y, U, V with quarter-resolution chroma
    Yuv420,
    /// Motion JPEG, one complete JPEG per frame
    Mjpeg,
    /// Interleaved 8-bit RGB
    Rgb,
    /// Unprocessed sensor output, laid out as yuv420
    Raw,
}

impl PixelFormat {
    /// Cheapest format to produce and move; the adaptive controller falls back to it
    pub const CHEAPEST: PixelFormat = PixelFormat::Yuv420;

    /// Bytes per pixel as a `(numerator, denominator)` ratio
    pub fn bytes_per_pixel(self) -> (usize, usize) {
        match self {
            PixelFormat::Yuv420 | PixelFormat::Raw => (3, 2),
            // upper bound, the encoder rarely needs more than one byte per pixel
            PixelFormat::Mjpeg => (1, 1),
            PixelFormat::Rgb => (3, 1),
        }
    }

    /// Number of bytes a reader asks the source for per frame
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (num, den) = self.bytes_per_pixel();
        width as usize * height as usize * num / den
    }

    pub fn is_cheapest(self) -> bool {
        self == Self::CHEAPEST
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Yuv420 => "yuv420",
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Rgb => "rgb",
            PixelFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of changing the live capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatChange {
    pub from: PixelFormat,
    pub to: PixelFormat,
    /// Sources negotiate the format at start, so any actual change needs a restart
    pub requires_restart: bool,
}

impl FormatChange {
    pub fn new(from: PixelFormat, to: PixelFormat) -> Self {
        Self {
            from,
            to,
            requires_restart: from != to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes_follow_format() {
        assert_eq!(PixelFormat::Yuv420.frame_size(640, 480), 460_800);
        assert_eq!(PixelFormat::Raw.frame_size(640, 480), 460_800);
        assert_eq!(PixelFormat::Rgb.frame_size(640, 480), 921_600);
        assert_eq!(PixelFormat::Mjpeg.frame_size(640, 480), 307_200);
    }

    #[test]
    fn format_change_flags_restart_only_when_different() {
        let change = FormatChange::new(PixelFormat::Mjpeg, PixelFormat::Yuv420);
        assert!(change.requires_restart);

        let noop = FormatChange::new(PixelFormat::Yuv420, PixelFormat::Yuv420);
        assert!(!noop.requires_restart);
    }

    #[test]
    fn formats_deserialize_from_lowercase_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: PixelFormat,
        }
        let parsed: Wrapper = config::Config::builder()
            .set_override("format", "mjpeg")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(parsed.format, PixelFormat::Mjpeg);
    }

    #[test]
    fn debug_output_shows_payload_head() {
        let frame = Frame::new(
            Bytes::from_static(&[0xFF, 0xD8, 0x00]),
            2,
            2,
            PixelFormat::Mjpeg,
            1,
        );
        let text = format!("{frame:?}");
        assert!(text.contains("FF D8 00"));
        assert!(frame.is_complete());
    }
}
