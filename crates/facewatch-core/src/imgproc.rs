//! Pixel statistics and small image utilities shared by liveness, anti-photo
//! heuristics and tracking. Grayscale uses BT.601 weights.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};

/// BT.601 luma of an RGB image.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    let (w, h) = image.dimensions();
    let mut gray = GrayImage::new(w, h);
    for (src, dst) in image.pixels().zip(gray.pixels_mut()) {
        let [r, g, b] = src.0;
        let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        *dst = Luma([y.round().clamp(0.0, 255.0) as u8]);
    }
    gray
}

/// Average pixel value (0.0-255.0); 0.0 for an empty image.
pub fn mean(gray: &GrayImage) -> f32 {
    let n = gray.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    gray.as_raw().iter().map(|&b| b as u64).sum::<u64>() as f32 / n as f32
}

/// Variance of the 4-neighbour Laplacian response, a focus/texture measure.
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    if gray.width() < 3 || gray.height() < 3 {
        return 0.0;
    }
    let lap = imageproc::filter::laplacian_filter(gray);
    let n = lap.as_raw().len() as f64;
    let sum: f64 = lap.as_raw().iter().map(|&v| v as f64).sum();
    let mean = sum / n;
    let var = lap.as_raw().iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    var as f32
}

/// Fraction of pixels at or above `threshold`.
pub fn bright_ratio(gray: &GrayImage, threshold: u8) -> f32 {
    let n = gray.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    gray.as_raw().iter().filter(|&&p| p >= threshold).count() as f32 / n as f32
}

/// Mean HSV saturation in [0, 1].
pub fn saturation_mean(image: &RgbImage) -> f32 {
    let n = (image.width() * image.height()) as usize;
    if n == 0 {
        return 0.0;
    }
    let total: f32 = image
        .pixels()
        .map(|p| {
            let max = p.0.iter().copied().max().unwrap_or(0) as f32;
            let min = p.0.iter().copied().min().unwrap_or(0) as f32;
            if max > 0.0 { (max - min) / max } else { 0.0 }
        })
        .sum();
    total / n as f32
}

/// Canny edge map (edges = 255).
pub fn canny(gray: &GrayImage, low: f32, high: f32) -> GrayImage {
    imageproc::edges::canny(gray, low, high)
}

/// Fraction of pixels that are Canny edges after a light blur.
pub fn edge_density(gray: &GrayImage, low: f32, high: f32) -> f32 {
    if gray.width() < 3 || gray.height() < 3 {
        return 0.0;
    }
    bright_ratio(&canny(&blur3(gray), low, high), 1)
}

/// Gaussian blur equivalent to a 3x3 kernel.
pub fn blur3(gray: &GrayImage) -> GrayImage {
    imageproc::filter::gaussian_blur_f32(gray, 0.8)
}

/// Crop `[x1, x2) x [y1, y2)` after clipping to the image; `None` when empty.
pub fn crop_rgb(image: &RgbImage, x1: i32, y1: i32, x2: i32, y2: i32) -> Option<RgbImage> {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let x1 = x1.clamp(0, w);
    let x2 = x2.clamp(0, w);
    let y1 = y1.clamp(0, h);
    let y2 = y2.clamp(0, h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(imageops::crop_imm(image, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32).to_image())
}

pub fn resize_rgb_bilinear(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width.max(1), height.max(1), FilterType::Triangle)
}

/// Scale an RGB image by `factor` (both axes), at least 1x1.
pub fn scale_rgb(image: &RgbImage, factor: f32) -> RgbImage {
    let w = ((image.width() as f32 * factor).round() as u32).max(1);
    let h = ((image.height() as f32 * factor).round() as u32).max(1);
    resize_rgb_bilinear(image, w, h)
}

/// Downscale so the longer side is at most `max_side`; never upscales.
pub fn limit_gray(gray: &GrayImage, max_side: u32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let longest = w.max(h);
    if longest <= max_side || longest == 0 {
        return gray.clone();
    }
    let s = max_side as f32 / longest as f32;
    let nw = ((w as f32 * s).round() as u32).max(1);
    let nh = ((h as f32 * s).round() as u32).max(1);
    imageops::resize(gray, nw, nh, FilterType::Triangle)
}

pub fn limit_rgb(image: &RgbImage, max_side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if longest <= max_side || longest == 0 {
        return image.clone();
    }
    scale_rgb(image, max_side as f32 / longest as f32)
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in place.
///
/// Divides the image into a `tiles` x `tiles` grid, computes a clipped
/// histogram per tile (clip = `clip_limit` x tile pixel count), builds CDFs,
/// and uses bilinear interpolation between tile CDFs for smooth output.
pub fn clahe_enhance(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let w = gray.width() as usize;
    let h = gray.height() as usize;
    let t = tiles as usize;
    if w == 0 || h == 0 || t == 0 {
        return;
    }
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let data: &mut [u8] = gray;

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);

    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[data[y * w + x] as usize] += 1;
                }
            }

            let clip = ((clip_limit * tile_pixels as f32) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            let mut cdf = [0f32; 256];
            cdf[0] = hist[0] as f32;
            for i in 1..256 {
                cdf[i] = cdf[i - 1] + hist[i] as f32;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        for x in 0..w {
            let pixel = data[y * w + x] as usize;

            let fy = ((y as f32 / tile_h as f32) - 0.5).clamp(0.0, (t - 1) as f32);
            let fx = ((x as f32 / tile_w as f32) - 0.5).clamp(0.0, (t - 1) as f32);

            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(t - 1);
            let c1 = (c0 + 1).min(t - 1);

            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let top = cdfs[r0 * t + c0][pixel] * (1.0 - dx) + cdfs[r0 * t + c1][pixel] * dx;
            let bot = cdfs[r1 * t + c0][pixel] * (1.0 - dx) + cdfs[r1 * t + c1][pixel] * dx;
            let val = top * (1.0 - dy) + bot * dy;

            data[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}
