//! StreamEncoder: bandwidth-bounded JPEG for snapshots and MJPEG streams.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest quality the adaptive pass will drop to.
pub const QUALITY_FLOOR: u8 = 40;
/// Quality points removed per started 2 KiB of overshoot.
const QUALITY_STEP: u32 = 5;
const OVERSHOOT_UNIT: usize = 2048;

pub const BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("cannot encode an empty frame")]
    EmptyFrame,
    #[error("jpeg encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeParams {
    pub quality: u8,
    /// Frames wider than this are downscaled; 0 keeps native size.
    pub max_width: u32,
    pub adaptive: bool,
    pub target_kb: u32,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self { quality: 65, max_width: 960, adaptive: true, target_kb: 180 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamEncoder {
    params: EncodeParams,
}

impl StreamEncoder {
    pub fn new(params: EncodeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &EncodeParams {
        &self.params
    }

    /// Encode an annotated frame, shrinking it and lowering quality as
    /// configured. Returns the raw JPEG bytes.
    pub fn encode(&self, frame: &RgbImage) -> Result<Vec<u8>, EncodeError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(EncodeError::EmptyFrame);
        }
        let p = &self.params;
        let resized;
        let image = if p.max_width > 0 && frame.width() > p.max_width {
            let scale = p.max_width as f32 / frame.width() as f32;
            let height = ((frame.height() as f32 * scale) as u32).max(1);
            resized = image::imageops::resize(frame, p.max_width, height, FilterType::Triangle);
            &resized
        } else {
            frame
        };

        let quality = p.quality.clamp(1, 100);
        let base = encode_jpeg(image, quality)?;
        if !p.adaptive {
            return Ok(base);
        }
        let target = p.target_kb as usize * 1024;
        let Some(lower) = adaptive_quality(quality, base.len(), target) else {
            return Ok(base);
        };
        let retry = encode_jpeg(image, lower)?;
        tracing::trace!(quality, lower, base = base.len(), retry = retry.len(), "adaptive re-encode");
        Ok(if retry.len() < base.len() { retry } else { base })
    }
}

/// Quality for the single re-encode, `None` when the frame already fits or
/// the quality is at the floor.
pub fn adaptive_quality(quality: u8, size: usize, target: usize) -> Option<u8> {
    if size <= target || quality <= QUALITY_FLOOR {
        return None;
    }
    let steps = ((size - target) / OVERSHOOT_UNIT).max(1) as u32;
    let lowered = (quality as u32).saturating_sub(steps * QUALITY_STEP);
    Some(lowered.max(QUALITY_FLOOR as u32) as u8)
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(64 * 1024);
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(out)
}

/// Frame one JPEG as a multipart MJPEG part.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// High-frequency noise that compresses poorly.
    fn make_noisy_frame(w: u32, h: u32) -> RgbImage {
        let mut state = 0x1234_5678u32;
        RgbImage::from_fn(w, h, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let [a, b, c, _] = state.to_le_bytes();
            Rgb([a, b, c])
        })
    }

    fn is_jpeg(bytes: &[u8]) -> bool {
        bytes.starts_with(&[0xff, 0xd8]) && bytes.ends_with(&[0xff, 0xd9])
    }

    #[test]
    fn test_downscales_wide_frames() {
        let encoder = StreamEncoder::new(EncodeParams { max_width: 320, adaptive: false, ..Default::default() });
        let jpeg = encoder.encode(&RgbImage::from_pixel(640, 360, Rgb([10, 120, 200]))).unwrap();
        assert!(is_jpeg(&jpeg));
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 180));
    }

    #[test]
    fn test_native_size_when_max_width_zero() {
        let encoder = StreamEncoder::new(EncodeParams { max_width: 0, ..Default::default() });
        let jpeg = encoder.encode(&RgbImage::from_pixel(1200, 20, Rgb([0, 0, 0]))).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 1200);
    }

    #[test]
    fn test_adaptive_encode_not_larger_than_baseline() {
        let frame = make_noisy_frame(320, 240);
        let baseline = StreamEncoder::new(EncodeParams { quality: 90, adaptive: false, ..Default::default() })
            .encode(&frame)
            .unwrap();
        let adaptive = StreamEncoder::new(EncodeParams { quality: 90, adaptive: true, target_kb: 8, ..Default::default() })
            .encode(&frame)
            .unwrap();
        assert!(baseline.len() > 8 * 1024);
        assert!(adaptive.len() < baseline.len());
    }

    #[test]
    fn test_adaptive_quality_steps() {
        // Fits: no retry.
        assert_eq!(adaptive_quality(65, 1000, 2000), None);
        // At the floor: no retry.
        assert_eq!(adaptive_quality(40, 500_000, 1000), None);
        // Small overshoot still lowers by one step.
        assert_eq!(adaptive_quality(65, 1100, 1000), Some(60));
        // 4 KiB over: two steps.
        assert_eq!(adaptive_quality(65, 1000 + 4096, 1000), Some(55));
        // Never below the floor.
        assert_eq!(adaptive_quality(65, 1_000_000, 1000), Some(40));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let err = StreamEncoder::default().encode(&RgbImage::new(0, 0));
        assert!(matches!(err, Err(EncodeError::EmptyFrame)));
    }

    #[test]
    fn test_multipart_chunk_framing() {
        let chunk = multipart_chunk(&[0xff, 0xd8, 0xff, 0xd9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xff, 0xd8, 0xff, 0xd9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(chunk, expected);
    }
}
