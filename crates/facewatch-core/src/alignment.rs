//! Landmark alignment of detected faces for the embedder.
//!
//! Aligns detected faces to a canonical square crop using the five InsightFace
//! reference landmarks and least-squares estimation. The reference set is
//! defined for 112x112 and scaled for other output sizes.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112x112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const REFERENCE_SIZE: f32 = 112.0;

/// Reference landmark positions for an `out_size` x `out_size` crop.
pub fn reference_landmarks(out_size: u32) -> [(f32, f32); 5] {
    let s = out_size as f32 / REFERENCE_SIZE;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * s, y * s))
}

/// Least-squares scale/rotation/translation mapping `src` onto `dst`, as the
/// row-major 2x3 matrix `[a, -b, tx, b, a, ty]`.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Normal equations of A * [a, b, tx, ty]^T = B, two rows per point pair:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for ((sx, sy), (dx, dy)) in src.iter().copied().zip(dst.iter().copied()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting; zeros for a singular system.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            // Degenerate landmarks (all coincident).
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Inverse-map every output pixel through `m` and sample bilinearly; black outside the source.
fn warp_affine(image: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);
    let mut output = RgbImage::new(out_size, out_size);

    // M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return output;
    }
    let ia = a / det;
    let ib = b / det;
    let (w, h) = (image.width() as i32, image.height() as i32);

    let sample = |x: i32, y: i32| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = image.get_pixel(x as u32, y as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    for (ox, oy, px) in output.enumerate_pixels_mut() {
        // src = M_inv * (dst - t)
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut out = [0u8; 3];
        for c in 0..3 {
            let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            out[c] = val.round().clamp(0.0, 255.0) as u8;
        }
        *px = Rgb(out);
    }

    output
}

/// Align a detected face to a canonical `out_size` x `out_size` RGB crop.
///
/// Computes the similarity transform from the five detected landmarks to the
/// scaled reference positions and warps the face region into the output.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], out_size: u32) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &reference_landmarks(out_size));
    warp_affine(image, &matrix, out_size)
}
