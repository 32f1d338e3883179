//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment;
use crate::imgproc;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces an identity embedding for one detected face.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Canonical 112x112 crop: landmark-aligned when landmarks exist, else the
    /// raw box resized.
    fn crop(image: &RgbImage, face: &BoundingBox) -> Result<RgbImage, RecognizerError> {
        let size = ARCFACE_INPUT_SIZE as u32;
        match &face.landmarks {
            Some(lms) => Ok(alignment::align_face(image, lms, size)),
            None => {
                let patch = imgproc::crop_rgb(
                    image,
                    face.x.round() as i32,
                    face.y.round() as i32,
                    (face.x + face.width).round() as i32,
                    (face.y + face.height).round() as i32,
                )
                .ok_or(RecognizerError::EmptyCrop)?;
                Ok(imgproc::resize_rgb_bilinear(&patch, size, size))
            }
        }
    }

    /// Preprocess a 112x112 RGB aligned face crop into a NCHW float tensor.
    fn preprocess(aligned_face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, px) in aligned_face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let aligned = Self::crop(image, face)?;
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw_data),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let aligned = RgbImage::from_pixel(112, 112, Rgb([255, 128, 0]));
        let tensor = ArcFaceEmbedder::preprocess(&aligned);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - (128.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_without_landmarks_uses_box() {
        let image = RgbImage::from_pixel(100, 100, Rgb([10, 20, 30]));
        let face = BoundingBox {
            x: 10.0, y: 10.0, width: 40.0, height: 50.0,
            confidence: 0.9, landmarks: None,
        };
        let crop = ArcFaceEmbedder::crop(&image, &face).unwrap();
        assert_eq!(crop.dimensions(), (112, 112));
        assert_eq!(crop.get_pixel(50, 50).0, [10, 20, 30]);
    }

    #[test]
    fn test_crop_outside_frame_is_error() {
        let image = RgbImage::new(50, 50);
        let face = BoundingBox {
            x: 80.0, y: 80.0, width: 10.0, height: 10.0,
            confidence: 0.9, landmarks: None,
        };
        assert!(matches!(ArcFaceEmbedder::crop(&image, &face), Err(RecognizerError::EmptyCrop)));
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
