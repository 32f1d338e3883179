//! Photo and screen replay heuristics applied after liveness.
//!
//! Two independent signals:
//! - screen-likeness of the area around a face (bezel rectangle, pixel-grid
//!   periodicity, bright saturated flat content);
//! - coherent motion of a cluster of small faces between frames, the
//!   signature of a poster or calendar being moved.

use crate::imgproc;
use crate::types::FaceBox;
use image::{GrayImage, RgbImage};
use imageproc::hough::{detect_lines, LineDetectionOptions};

/// Patch margin as a fraction of the larger bbox side.
const PATCH_MARGIN: f32 = 0.90;
const BRIGHT_LEVEL: u8 = 235;
const EDGE_LOW: f32 = 70.0;
const EDGE_HIGH: f32 = 140.0;

const RECT_MAX_SIDE: u32 = 256;
const RECT_MIN_LINE_FRACTION: f32 = 0.55;
const RECT_ANGLE_TOLERANCE_DEG: f32 = 12.0;
const RECT_BORDER_FRACTION: f32 = 0.18;
const RECT_MIN_ASPECT: f32 = 1.3;
const RECT_MAX_ASPECT: f32 = 2.6;

const PERIODIC_MAX_SIDE: u32 = 192;
const PERIODIC_MIN_BAND: u32 = 8;
const PERIODIC_LAGS: std::ops::Range<usize> = 2..8;

/// Faces with a smaller minimum side take part in cluster analysis.
pub const SMALL_FACE_SIDE: i32 = 80;
/// Cluster members below this minimum side are rejected.
pub const CLUSTER_REJECT_SIDE: i32 = 90;
pub const CLUSTER_MIN_MATCHES: usize = 4;
pub const CLUSTER_MATCH_DISTANCE: f32 = 50.0;
pub const CLUSTER_MIN_MEDIAN_SHIFT: f32 = 1.2;
pub const CLUSTER_MAX_AXIS_STD: f32 = 2.0;
/// Upper bound on remembered small-face centers per camera.
pub const MAX_REMEMBERED_CENTERS: usize = 50;

/// Pixel statistics of the expanded patch around a face.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScreenFeatures {
    pub bright_ratio: f32,
    pub saturation: f32,
    pub laplacian_var: f32,
    pub edge_density: f32,
    pub has_rectangle: bool,
    pub periodicity: f32,
}

impl ScreenFeatures {
    pub fn measure(patch: &RgbImage) -> Self {
        let gray = imgproc::to_gray(patch);
        let small = imgproc::limit_rgb(patch, RECT_MAX_SIDE);
        Self {
            bright_ratio: imgproc::bright_ratio(&gray, BRIGHT_LEVEL),
            saturation: imgproc::saturation_mean(&small),
            laplacian_var: imgproc::laplacian_variance(&gray),
            edge_density: imgproc::edge_density(&gray, EDGE_LOW, EDGE_HIGH),
            has_rectangle: find_phone_rectangle(&gray),
            periodicity: grid_periodicity(&gray),
        }
    }

    /// Conservative rule set: any one rule flags a screen.
    pub fn looks_like_screen(&self) -> bool {
        // Bezel plus enough glare or structure.
        if self.has_rectangle && (self.bright_ratio >= 0.15 || self.edge_density >= 0.22) {
            return true;
        }
        // Sub-pixel grid with moderate brightness.
        if self.periodicity >= 0.38 && self.bright_ratio >= 0.12 {
            return true;
        }
        // Vivid, glossy, flat.
        if self.bright_ratio >= 0.30 && self.saturation >= 0.30 && self.laplacian_var < 24.0 {
            return true;
        }
        self.edge_density >= 0.28 && self.periodicity >= 0.32
    }
}

/// Crop around `bbox` expanded by 0.9 of its larger side, clipped to the frame.
pub fn expand_patch(frame: &RgbImage, bbox: &FaceBox) -> Option<RgbImage> {
    let m = (bbox.max_side() as f32 * PATCH_MARGIN) as i32;
    let max_x = frame.width() as i32 - 1;
    let max_y = frame.height() as i32 - 1;
    imgproc::crop_rgb(
        frame,
        (bbox.x1 - m).max(0),
        (bbox.y1 - m).max(0),
        (bbox.x2 + m).min(max_x),
        (bbox.y2 + m).min(max_y),
    )
}

/// Whether the surroundings of `bbox` look like a phone or monitor.
pub fn is_screen_like(frame: &RgbImage, bbox: &FaceBox) -> bool {
    let Some(patch) = expand_patch(frame, bbox) else {
        return false;
    };
    let features = ScreenFeatures::measure(&patch);
    let flagged = features.looks_like_screen();
    if flagged {
        tracing::debug!(?bbox, ?features, "screen-like surroundings");
    }
    flagged
}

/// Look for two near-vertical and two near-horizontal lines framing the patch
/// with a phone-like aspect ratio.
pub fn find_phone_rectangle(patch: &GrayImage) -> bool {
    let img = imgproc::limit_gray(patch, RECT_MAX_SIDE);
    let (w, h) = img.dimensions();
    if w < 16 || h < 16 {
        return false;
    }
    let (wf, hf) = (w as f32, h as f32);
    let edges = imgproc::canny(&imgproc::blur3(&img), 65.0, 140.0);
    let min_len = RECT_MIN_LINE_FRACTION * wf.min(hf);

    let lines = detect_lines(
        &edges,
        LineDetectionOptions { vote_threshold: min_len as u32, suppression_radius: 8 },
    );

    // Each line is x*cos(t) + y*sin(t) = r; record its position through the
    // patch center.
    let mut verts = Vec::new();
    let mut hors = Vec::new();
    for line in &lines {
        let deg = line.angle_in_degrees as f32;
        let t = deg.to_radians();
        if deg < RECT_ANGLE_TOLERANCE_DEG || deg > 180.0 - RECT_ANGLE_TOLERANCE_DEG {
            verts.push((line.r - hf * 0.5 * t.sin()) / t.cos());
        } else if (deg - 90.0).abs() < RECT_ANGLE_TOLERANCE_DEG {
            hors.push((line.r - wf * 0.5 * t.cos()) / t.sin());
        }
    }
    if verts.len() < 2 || hors.len() < 2 {
        return false;
    }

    let left = verts.iter().copied().fold(f32::INFINITY, f32::min);
    let right = verts.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let top = hors.iter().copied().fold(f32::INFINITY, f32::min);
    let bottom = hors.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let rw = (right - left).max(1.0);
    let rh = (bottom - top).max(1.0);
    let aspect = rw.max(rh) / (rw.min(rh) + 1e-6);

    let near_border = left < RECT_BORDER_FRACTION * wf
        && right > (1.0 - RECT_BORDER_FRACTION) * wf
        && top < RECT_BORDER_FRACTION * hf
        && bottom > (1.0 - RECT_BORDER_FRACTION) * hf;
    near_border && (RECT_MIN_ASPECT..=RECT_MAX_ASPECT).contains(&aspect)
}

/// Peak normalized autocorrelation at small lags of the central horizontal and
/// vertical bands. Screens photographed up close show a strong sub-pixel grid.
pub fn grid_periodicity(gray: &GrayImage) -> f32 {
    let g = imgproc::blur3(&imgproc::limit_gray(gray, PERIODIC_MAX_SIDE));
    let (w, h) = g.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }

    let th = PERIODIC_MIN_BAND.max(h / 8).min(h);
    let tw = PERIODIC_MIN_BAND.max(w / 8).min(w);
    let y0 = (h / 2).saturating_sub(th / 2);
    let x0 = (w / 2).saturating_sub(tw / 2);
    let y1 = (y0 + th).min(h);
    let x1 = (x0 + tw).min(w);

    // Column profile of the horizontal band, row profile of the vertical band.
    let row: Vec<f32> = (0..w)
        .map(|x| (y0..y1).map(|y| g.get_pixel(x, y).0[0] as f32).sum::<f32>() / (y1 - y0) as f32)
        .collect();
    let col: Vec<f32> = (0..h)
        .map(|y| (x0..x1).map(|x| g.get_pixel(x, y).0[0] as f32).sum::<f32>() / (x1 - x0) as f32)
        .collect();

    peak_autocorrelation(&row).max(peak_autocorrelation(&col))
}

fn peak_autocorrelation(signal: &[f32]) -> f32 {
    if signal.len() <= PERIODIC_LAGS.end {
        return 0.0;
    }
    let mean = signal.iter().sum::<f32>() / signal.len() as f32;
    let centered: Vec<f32> = signal.iter().map(|v| v - mean).collect();
    let ac = |lag: usize| -> f32 {
        centered.iter().zip(&centered[lag..]).map(|(a, b)| a * b).sum()
    };
    let zero = ac(0) + 1e-6;
    PERIODIC_LAGS.map(|lag| ac(lag) / zero).fold(f32::NEG_INFINITY, f32::max)
}

/// Centers of faces small enough for cluster analysis.
pub fn small_face_centers(boxes: &[FaceBox]) -> Vec<(f32, f32)> {
    boxes
        .iter()
        .filter(|b| b.min_side() < SMALL_FACE_SIDE)
        .map(FaceBox::center)
        .take(MAX_REMEMBERED_CENTERS)
        .collect()
}

/// Nearest-neighbour pairing of current to previous centers; each previous
/// center is used at most once.
fn match_previous(current: &[(f32, f32)], previous: &[(f32, f32)]) -> Vec<(f32, f32)> {
    let mut used = vec![false; previous.len()];
    let mut shifts = Vec::new();
    for &(cx, cy) in current {
        let nearest = previous
            .iter()
            .enumerate()
            .map(|(j, &(px, py))| (j, (cx - px).hypot(cy - py)))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((j, dist)) = nearest {
            if dist <= CLUSTER_MATCH_DISTANCE && !used[j] {
                used[j] = true;
                shifts.push((cx - previous[j].0, cy - previous[j].1));
            }
        }
    }
    shifts
}

/// Small faces moving together by a similar non-trivial displacement.
pub fn coherent_small_motion(current: &[(f32, f32)], previous: &[(f32, f32)]) -> bool {
    if current.len() < CLUSTER_MIN_MATCHES || previous.is_empty() {
        return false;
    }
    let shifts = match_previous(current, previous);
    if shifts.len() < CLUSTER_MIN_MATCHES {
        return false;
    }

    let mut mags: Vec<f32> = shifts.iter().map(|(dx, dy)| dx.hypot(*dy)).collect();
    mags.sort_by(f32::total_cmp);
    if median_sorted(&mags) < CLUSTER_MIN_MEDIAN_SHIFT {
        return false;
    }

    let dxs: Vec<f32> = shifts.iter().map(|s| s.0).collect();
    let dys: Vec<f32> = shifts.iter().map(|s| s.1).collect();
    std_dev(&dxs) < CLUSTER_MAX_AXIS_STD && std_dev(&dys) < CLUSTER_MAX_AXIS_STD
}

fn median_sorted(v: &[f32]) -> f32 {
    let n = v.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        v[n / 2]
    } else {
        (v[n / 2 - 1] + v[n / 2]) * 0.5
    }
}

fn std_dev(v: &[f32]) -> f32 {
    let n = v.len() as f32;
    let mean = v.iter().sum::<f32>() / n;
    (v.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n).sqrt()
}
