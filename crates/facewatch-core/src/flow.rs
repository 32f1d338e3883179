//! Sparse optical flow: Shi-Tomasi corner selection and pyramidal
//! Lucas-Kanade point tracking on grayscale frames.

use image::GrayImage;

/// Parameters for `good_features`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureParams {
    pub max_points: usize,
    /// Corners weaker than this fraction of the strongest are dropped.
    pub quality: f32,
    pub min_distance: f32,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self { max_points: 60, quality: 0.01, min_distance: 3.0 }
    }
}

/// Moves points from one frame to the next. `None` marks a lost point.
pub trait FlowEstimator: Send {
    fn track(
        &mut self,
        prev: &GrayImage,
        next: &GrayImage,
        points: &[(f32, f32)],
    ) -> Vec<Option<(f32, f32)>>;
}

/// Strongest Shi-Tomasi corners inside `[x1, x2) x [y1, y2)`, in frame
/// coordinates, strongest first.
pub fn good_features(gray: &GrayImage, roi: [u32; 4], params: &FeatureParams) -> Vec<(f32, f32)> {
    let [x1, y1, x2, y2] = roi;
    let x2 = x2.min(gray.width());
    let y2 = y2.min(gray.height());
    if x2 <= x1 + 2 || y2 <= y1 + 2 {
        return Vec::new();
    }
    let crop = image::imageops::crop_imm(gray, x1, y1, x2 - x1, y2 - y1).to_image();
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let gx = imageproc::gradients::horizontal_sobel(&crop);
    let gy = imageproc::gradients::vertical_sobel(&crop);

    // Per-pixel gradient products, summed over a 3x3 block.
    let mut xx = vec![0f32; w * h];
    let mut xy = vec![0f32; w * h];
    let mut yy = vec![0f32; w * h];
    for (i, (a, b)) in gx.as_raw().iter().zip(gy.as_raw()).enumerate() {
        let (a, b) = (*a as f32, *b as f32);
        xx[i] = a * a;
        xy[i] = a * b;
        yy[i] = b * b;
    }

    let mut response = vec![0f32; w * h];
    let mut max_response = 0f32;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let (mut a, mut b, mut c) = (0f32, 0f32, 0f32);
            for dy in 0..3 {
                for dx in 0..3 {
                    let k = (y + dy - 1) * w + (x + dx - 1);
                    a += xx[k];
                    b += xy[k];
                    c += yy[k];
                }
            }
            let half_trace = (a + c) * 0.5;
            let lambda_min = half_trace - (((a - c) * 0.5).powi(2) + b * b).sqrt();
            response[y * w + x] = lambda_min;
            max_response = max_response.max(lambda_min);
        }
    }
    if max_response <= 0.0 {
        return Vec::new();
    }

    let threshold = params.quality * max_response;
    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let r = response[y * w + x];
            if r < threshold || r <= 0.0 {
                continue;
            }
            let is_peak = (0..3).all(|dy| {
                (0..3).all(|dx| response[(y + dy - 1) * w + (x + dx - 1)] <= r)
            });
            if is_peak {
                candidates.push((r, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.2.cmp(&b.2)).then(a.1.cmp(&b.1)));

    let min_d2 = params.min_distance * params.min_distance;
    let mut picked: Vec<(f32, f32)> = Vec::new();
    for (_, x, y) in candidates {
        let p = ((x as u32 + x1) as f32, (y as u32 + y1) as f32);
        if picked.iter().all(|q| (q.0 - p.0).powi(2) + (q.1 - p.1).powi(2) >= min_d2) {
            picked.push(p);
            if picked.len() >= params.max_points {
                break;
            }
        }
    }
    picked
}

/// Float image with clamped bilinear sampling.
#[derive(Debug, Clone)]
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn at(&self, x: i64, y: i64) -> f32 {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        self.data[y * self.width + x]
    }

    fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let (xi, yi) = (x0 as i64, y0 as i64);
        self.at(xi, yi) * (1.0 - fx) * (1.0 - fy)
            + self.at(xi + 1, yi) * fx * (1.0 - fy)
            + self.at(xi, yi + 1) * (1.0 - fx) * fy
            + self.at(xi + 1, yi + 1) * fx * fy
    }

    /// Half resolution by 2x2 averaging.
    fn downsample(&self) -> Self {
        let width = self.width.div_ceil(2);
        let height = self.height.div_ceil(2);
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let (sx, sy) = (2 * x as i64, 2 * y as i64);
                let sum = self.at(sx, sy) + self.at(sx + 1, sy) + self.at(sx, sy + 1) + self.at(sx + 1, sy + 1);
                data.push(sum * 0.25);
            }
        }
        Self { width, height, data }
    }
}

/// Levels 0..=max_level, stopping early once a level gets too small to
/// hold a tracking window.
fn build_pyramid(gray: &GrayImage, max_level: usize, min_side: usize) -> Vec<Plane> {
    let mut levels = vec![Plane::from_gray(gray)];
    while levels.len() <= max_level {
        let Some(last) = levels.last() else { break };
        if last.width / 2 < min_side || last.height / 2 < min_side {
            break;
        }
        let next = last.downsample();
        levels.push(next);
    }
    levels
}

/// Pyramidal Lucas-Kanade tracker.
#[derive(Debug, Clone)]
pub struct LucasKanade {
    /// Window side in pixels (odd).
    pub window: usize,
    pub max_level: usize,
    pub max_iterations: usize,
    pub epsilon: f32,
    /// Minimum eigenvalue of the normalized gradient matrix.
    pub min_eigen: f32,
}

impl Default for LucasKanade {
    fn default() -> Self {
        Self { window: 17, max_level: 3, max_iterations: 20, epsilon: 0.03, min_eigen: 1e-2 }
    }
}

impl LucasKanade {
    fn track_point(&self, prev: &[Plane], next: &[Plane], p: (f32, f32)) -> Option<(f32, f32)> {
        let half = (self.window / 2) as i32;
        let top = prev.len().min(next.len()).checked_sub(1)?;
        let mut guess = (0f32, 0f32);
        let mut window = Vec::with_capacity(self.window * self.window);

        for level in (0..=top).rev() {
            let scale = (1u32 << level) as f32;
            let (px, py) = (p.0 / scale, p.1 / scale);
            let a = &prev[level];
            let b = &next[level];

            window.clear();
            let (mut gxx, mut gxy, mut gyy) = (0f32, 0f32, 0f32);
            for dy in -half..=half {
                for dx in -half..=half {
                    let x = px + dx as f32;
                    let y = py + dy as f32;
                    let ix = (a.sample(x + 1.0, y) - a.sample(x - 1.0, y)) * 0.5;
                    let iy = (a.sample(x, y + 1.0) - a.sample(x, y - 1.0)) * 0.5;
                    gxx += ix * ix;
                    gxy += ix * iy;
                    gyy += iy * iy;
                    window.push((dx as f32, dy as f32, ix, iy, a.sample(x, y)));
                }
            }

            let n = window.len() as f32;
            let lambda_min =
                ((gxx + gyy) - ((gxx - gyy).powi(2) + 4.0 * gxy * gxy).sqrt()) * 0.5 / n;
            let det = gxx * gyy - gxy * gxy;
            if lambda_min < self.min_eigen || det.abs() < f32::EPSILON {
                return None;
            }

            let mut v = (0f32, 0f32);
            for _ in 0..self.max_iterations {
                let (mut bx, mut by) = (0f32, 0f32);
                for &(dx, dy, ix, iy, i) in &window {
                    let j = b.sample(px + dx + guess.0 + v.0, py + dy + guess.1 + v.1);
                    let diff = i - j;
                    bx += diff * ix;
                    by += diff * iy;
                }
                let ex = (gyy * bx - gxy * by) / det;
                let ey = (gxx * by - gxy * bx) / det;
                v.0 += ex;
                v.1 += ey;
                if ex * ex + ey * ey < self.epsilon * self.epsilon {
                    break;
                }
            }

            guess = if level > 0 {
                (2.0 * (guess.0 + v.0), 2.0 * (guess.1 + v.1))
            } else {
                (guess.0 + v.0, guess.1 + v.1)
            };
        }

        let out = (p.0 + guess.0, p.1 + guess.1);
        let (w, h) = (prev[0].width as f32, prev[0].height as f32);
        let inside = out.0.is_finite() && out.1.is_finite()
            && (0.0..=w - 1.0).contains(&out.0)
            && (0.0..=h - 1.0).contains(&out.1);
        inside.then_some(out)
    }
}

impl FlowEstimator for LucasKanade {
    fn track(
        &mut self,
        prev: &GrayImage,
        next: &GrayImage,
        points: &[(f32, f32)],
    ) -> Vec<Option<(f32, f32)>> {
        if prev.dimensions() != next.dimensions() || prev.width() == 0 || prev.height() == 0 {
            return vec![None; points.len()];
        }
        let min_side = self.window / 2 + 1;
        let prev_pyr = build_pyramid(prev, self.max_level, min_side);
        let next_pyr = build_pyramid(next, self.max_level, min_side);
        points.iter().map(|&p| self.track_point(&prev_pyr, &next_pyr, p)).collect()
    }
}
