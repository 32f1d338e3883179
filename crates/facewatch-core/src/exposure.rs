//! Low-light boost for face crops: luma gain plus CLAHE on the Y channel of
//! YCrCb, chroma untouched.

use crate::imgproc;
use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

const CLAHE_TILES: u32 = 8;
/// Clip limit 2.0 expressed per 256 histogram bins.
const CLAHE_CLIP: f32 = 2.0 / 256.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureParams {
    pub enabled: bool,
    pub gain: f32,
    pub min_luminance: f32,
}

impl Default for ExposureParams {
    fn default() -> Self {
        Self { enabled: true, gain: 1.4, min_luminance: 60.0 }
    }
}

/// Return a brightened copy of `crop` when it is enabled and darker than
/// `min_luminance`, otherwise `None`.
pub fn enhance_if_dark(crop: &RgbImage, params: &ExposureParams) -> Option<RgbImage> {
    if !params.enabled || crop.width() == 0 || crop.height() == 0 {
        return None;
    }
    let luma = imgproc::mean(&imgproc::to_gray(crop));
    if luma >= params.min_luminance {
        return None;
    }
    Some(boost(crop, params.gain))
}

/// Apply `gain` to luma, equalize it with CLAHE and convert back to RGB.
pub fn boost(crop: &RgbImage, gain: f32) -> RgbImage {
    let (w, h) = crop.dimensions();
    let mut y_plane = GrayImage::new(w, h);
    let mut chroma = Vec::with_capacity((w * h) as usize);

    for (px, y_out) in crop.pixels().zip(y_plane.pixels_mut()) {
        let (y, cr, cb) = rgb_to_ycrcb(px.0);
        *y_out = Luma([(y * gain).round().clamp(0.0, 255.0) as u8]);
        chroma.push((cr, cb));
    }

    imgproc::clahe_enhance(&mut y_plane, CLAHE_TILES, CLAHE_CLIP);

    let mut out = RgbImage::new(w, h);
    for ((y_px, (cr, cb)), dst) in y_plane.pixels().zip(chroma).zip(out.pixels_mut()) {
        *dst = Rgb(ycrcb_to_rgb(y_px.0[0] as f32, cr, cb));
    }
    out
}

fn rgb_to_ycrcb([r, g, b]: [u8; 3]) -> (f32, f32, f32) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cr = (r - y) * 0.713 + 128.0;
    let cb = (b - y) * 0.564 + 128.0;
    (y, cr, cb)
}

fn ycrcb_to_rgb(y: f32, cr: f32, cb: f32) -> [u8; 3] {
    let r = y + 1.403 * (cr - 128.0);
    let g = y - 0.714 * (cr - 128.0) - 0.344 * (cb - 128.0);
    let b = y + 1.773 * (cb - 128.0);
    [r, g, b].map(|v| v.round().clamp(0.0, 255.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_dark_crop() -> RgbImage {
        RgbImage::from_fn(80, 80, |x, y| {
            let v = 20 + ((x + y) % 20) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_bright_crop_untouched() {
        let crop = RgbImage::from_pixel(80, 80, Rgb([150, 140, 130]));
        assert!(enhance_if_dark(&crop, &ExposureParams::default()).is_none());
    }

    #[test]
    fn test_disabled_never_boosts() {
        let params = ExposureParams { enabled: false, ..ExposureParams::default() };
        assert!(enhance_if_dark(&make_dark_crop(), &params).is_none());
    }

    #[test]
    fn test_dark_crop_gets_brighter() {
        let crop = make_dark_crop();
        let before = imgproc::mean(&imgproc::to_gray(&crop));
        let boosted = enhance_if_dark(&crop, &ExposureParams::default()).unwrap();
        let after = imgproc::mean(&imgproc::to_gray(&boosted));
        assert_eq!(boosted.dimensions(), crop.dimensions());
        assert!(after > before, "before={before:.1} after={after:.1}");
    }

    #[test]
    fn test_ycrcb_roundtrip_gray() {
        let (y, cr, cb) = rgb_to_ycrcb([100, 100, 100]);
        assert!((cr - 128.0).abs() < 1e-3 && (cb - 128.0).abs() < 1e-3);
        assert_eq!(ycrcb_to_rgb(y, cr, cb), [100, 100, 100]);
    }
}
