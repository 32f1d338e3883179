//! Frame type and pixel conversion — YUYV/RGB24 to RGB8, luma extraction.

use image::{GrayImage, RgbImage};
use std::time::Instant;

/// A captured colour camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Increases by one per successfully captured frame of a source.
    pub sequence: u64,
    pub captured: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self { image, sequence, captured: Instant::now() }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// BT.601 luma plane, used by optical flow.
    pub fn to_gray(&self) -> GrayImage {
        rgb_to_gray(&self.image)
    }
}

pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let v = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        image::Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

/// Convert packed YUYV (4:2:2) to RGB8.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V], both pixels sharing
/// the chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    if width % 2 != 0 {
        return Err(FrameError::OddWidth(width));
    }
    let expected = (width as usize) * (height as usize) * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }

    let mut out = Vec::with_capacity(expected / 2 * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        out.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        out.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, out).ok_or(FrameError::InvalidLength { expected, actual: yuyv.len() })
}

/// Wrap a packed RGB24 buffer.
pub fn rgb24_to_image(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width as usize) * (height as usize) * 3;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: buf.len() });
    }
    RgbImage::from_raw(width, height, buf[..expected].to_vec())
        .ok_or(FrameError::InvalidLength { expected, actual: buf.len() })
}

/// Copy a packed RGB24 plane whose rows are `stride` bytes apart, as decoders
/// hand them out with row padding.
pub fn rgb24_strided_to_image(buf: &[u8], stride: usize, width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let row = width as usize * 3;
    if stride < row {
        return Err(FrameError::InvalidLength { expected: row, actual: stride });
    }
    let expected = match height as usize {
        0 => 0,
        h => stride * (h - 1) + row,
    };
    if buf.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: buf.len() });
    }
    let mut out = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        out.extend_from_slice(&buf[y * stride..y * stride + row]);
    }
    RgbImage::from_raw(width, height, out).ok_or(FrameError::InvalidLength { expected, actual: buf.len() })
}

/// Decode one MJPG buffer.
pub fn mjpeg_to_rgb(buf: &[u8]) -> Result<RgbImage, FrameError> {
    let img = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(img.to_rgb8())
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let r = 1.164 * c + 1.596 * e;
    let g = 1.164 * c - 0.392 * d - 0.813 * e;
    let b = 1.164 * c + 2.017 * d;
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("YUYV frame width must be even, got {0}")]
    OddWidth(u32),
    #[error("MJPG decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_gray_levels() {
        // 2x1 image, neutral chroma: black (Y=16) and white (Y=235)
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_red_chroma() {
        // Strong Cr pushes red up and green down
        let yuyv = vec![81, 90, 81, 240];
        let px = yuyv_to_rgb(&yuyv, 2, 1).unwrap().get_pixel(0, 0).0;
        assert!(px[0] > 200, "red channel {px:?}");
        assert!(px[1] < 60, "green channel {px:?}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(matches!(
            yuyv_to_rgb(&yuyv, 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_yuyv_odd_width() {
        assert!(matches!(yuyv_to_rgb(&[0; 12], 3, 1), Err(FrameError::OddWidth(3))));
    }

    #[test]
    fn test_rgb24_wraps_buffer() {
        let buf: Vec<u8> = (0..12).collect();
        let img = rgb24_to_image(&buf, 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 1).0, [9, 10, 11]);
        assert!(rgb24_to_image(&buf[..11], 2, 2).is_err());
    }

    #[test]
    fn test_mjpeg_roundtrip_dimensions() {
        let src = RgbImage::from_pixel(16, 8, image::Rgb([120, 60, 200]));
        let mut bytes = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, 90)
            .encode_image(&src)
            .unwrap();
        let decoded = mjpeg_to_rgb(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
        assert!(mjpeg_to_rgb(&[0xff, 0xd8, 0x00]).is_err());
    }

    #[test]
    fn test_frame_gray_uses_luma_weights() {
        let img = RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0]));
        let frame = Frame::new(img, 7);
        assert_eq!(frame.sequence, 7);
        assert_eq!(frame.to_gray().get_pixel(0, 0).0[0], 76);
    }

    #[test]
    fn test_rgb24_strided_drops_row_padding() {
        // 2x2 image, 8-byte rows: 6 bytes of pixels + 2 padding bytes
        let buf = [1, 2, 3, 4, 5, 6, 99, 99, 7, 8, 9, 10, 11, 12];
        let img = rgb24_strided_to_image(&buf, 8, 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [4, 5, 6]);
        assert_eq!(img.get_pixel(0, 1).0, [7, 8, 9]);
        assert_eq!(img.as_raw().len(), 12);
    }

    #[test]
    fn test_rgb24_strided_rejects_short_stride() {
        assert!(matches!(
            rgb24_strided_to_image(&[0; 32], 5, 2, 2),
            Err(FrameError::InvalidLength { .. })
        ));
        assert!(rgb24_strided_to_image(&[0; 10], 8, 2, 2).is_err());
    }
}
