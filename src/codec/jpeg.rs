//! RGB to JPEG encoding

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::instrument;

use crate::{CodecConfig, EncodeError};

pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Encoder settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// 1..=100
    pub quality: u8,
    pub optimize_huffman: bool,
    pub progressive: bool,
}

impl EncodeOptions {
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality,
            ..Self::default()
        }
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        CodecConfig::default().into()
    }
}

impl From<CodecConfig> for EncodeOptions {
    fn from(config: CodecConfig) -> Self {
        Self {
            quality: config.quality,
            optimize_huffman: config.optimize_huffman,
            progressive: config.progressive,
        }
    }
}

/// Encode interleaved RGB into a JPEG stream
///
/// Plain baseline output goes through `image`; progressive scans or optimized Huffman
/// tables need `jpeg-encoder`.
#[instrument(skip(rgb), fields(len = rgb.len()))]
pub fn compress_to_jpeg(
    rgb: &[u8],
    width: u32,
    height: u32,
    options: &EncodeOptions,
) -> Result<Vec<u8>, EncodeError> {
    if !(1..=100).contains(&options.quality) {
        return Err(EncodeError::Quality(options.quality));
    }
    // JPEG headers store dimensions as u16
    if width == 0 || height == 0 || width > u16::MAX as u32 || height > u16::MAX as u32 {
        return Err(EncodeError::Dimensions { width, height });
    }
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(EncodeError::BufferSize {
            width,
            height,
            expected,
            actual: rgb.len(),
        });
    }

    let mut out = Vec::with_capacity(expected / 8);
    if options.progressive || options.optimize_huffman {
        let mut encoder = jpeg_encoder::Encoder::new(&mut out, options.quality);
        encoder.set_progressive(options.progressive);
        encoder.set_optimized_huffman_tables(options.optimize_huffman);
        encoder
            .encode(rgb, width as u16, height as u16, jpeg_encoder::ColorType::Rgb)
            .map_err(|e| EncodeError::Encoder(e.to_string()))?;
    } else {
        JpegEncoder::new_with_quality(&mut out, options.quality)
            .encode(rgb, width, height, ExtendedColorType::Rgb8)
            .map_err(|e| EncodeError::Encoder(e.to_string()))?;
    }
    Ok(out)
}

/// Start and end markers are where a JPEG stream needs them
pub fn is_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&JPEG_SOI) && data.ends_with(&JPEG_EOI)
}
