use crate::EncodeError;

/// Bytes a planar yuv420 image of the given size occupies
pub fn yuv420_len(width: u32, height: u32) -> usize {
    let luma = width as usize * height as usize;
    let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
    luma + 2 * chroma
}

/// Converts planar YUV 4:2:0 to interleaved RGB.
///
/// The Y plane is followed by quarter-resolution U and V planes; each chroma sample
/// covers a 2x2 block of pixels (nearest neighbour). Uses BT.601 full-range coefficients:
/// - R = Y + 1.370705 * (V - 128)
/// - G = Y - 0.337633 * (U - 128) - 0.698001 * (V - 128)
/// - B = Y + 1.732446 * (U - 128)
///
/// Returns `[R, G, B, R, G, B, ...]`.
///
/// # Errors
///
/// [`EncodeError::Dimensions`] for a zero-sized image, [`EncodeError::BufferSize`] when
/// `data` is shorter than the planes need.
pub fn yuv420_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EncodeError> {
    let mut rgb = vec![0u8; width as usize * height as usize * 3];
    yuv420_to_rgb_into(data, width, height, &mut rgb)?;
    Ok(rgb)
}

/// [`yuv420_to_rgb`] writing into a caller-provided buffer of `width * height * 3` bytes
pub fn yuv420_to_rgb_into(
    data: &[u8],
    width: u32,
    height: u32,
    rgb: &mut [u8],
) -> Result<(), EncodeError> {
    if width == 0 || height == 0 {
        return Err(EncodeError::Dimensions { width, height });
    }
    let expected = yuv420_len(width, height);
    if data.len() < expected {
        return Err(EncodeError::BufferSize {
            width,
            height,
            expected,
            actual: data.len(),
        });
    }
    let out_len = width as usize * height as usize * 3;
    if rgb.len() != out_len {
        return Err(EncodeError::BufferSize {
            width,
            height,
            expected: out_len,
            actual: rgb.len(),
        });
    }

    let w = width as usize;
    let h = height as usize;
    let cw = width.div_ceil(2) as usize;
    let ch = height.div_ceil(2) as usize;
    let (y_plane, rest) = data.split_at(w * h);
    let (u_plane, v_plane) = rest.split_at(cw * ch);

    for (row, (y_row, rgb_row)) in y_plane
        .chunks_exact(w)
        .zip(rgb.chunks_exact_mut(w * 3))
        .enumerate()
    {
        let chroma_row = (row / 2) * cw;
        for (col, (&y, px)) in y_row.iter().zip(rgb_row.chunks_exact_mut(3)).enumerate() {
            let u = u_plane[chroma_row + col / 2] as f32 - 128.0;
            let v = v_plane[chroma_row + col / 2] as f32 - 128.0;
            let y = y as f32;

            px[0] = clamp(y + 1.370705 * v);
            px[1] = clamp(y - 0.337633 * u - 0.698001 * v);
            px[2] = clamp(y + 1.732446 * u);
        }
    }
    Ok(())
}

#[inline]
fn clamp(value: f32) -> u8 {
    // truncate toward zero first, like an integer cast of the product
    (value as i32).clamp(0, 255) as u8
}
