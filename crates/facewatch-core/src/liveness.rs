//! Liveness (anti-spoof) backends: cheap gray-level heuristics or a
//! MiniFASNet-style ONNX classifier over a normalized face crop.

use crate::imgproc;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEURISTIC_LOW_MIN_MEAN: f32 = 20.0;
const HEURISTIC_MEDIUM_MIN_MEAN: f32 = 25.0;
const HEURISTIC_MEDIUM_MIN_LAPLACIAN: f32 = 55.0;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("liveness model is not loaded")]
    ModelMissing,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Low,
    Medium,
    #[default]
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrictnessThresholds {
    pub low: f32,
    pub medium: f32,
    pub high: f32,
}

impl Default for StrictnessThresholds {
    fn default() -> Self {
        Self { low: 0.40, medium: 0.55, high: 0.70 }
    }
}

impl StrictnessThresholds {
    pub fn for_strictness(&self, strictness: Strictness) -> f32 {
        match strictness {
            Strictness::Low => self.low,
            Strictness::Medium => self.medium,
            Strictness::High => self.high,
        }
    }
}

/// Pixel normalization expected by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preprocess {
    /// RGB scaled to [0, 1].
    #[default]
    Rgb01,
    /// RGB scaled to [-1, 1].
    RgbNorm,
    Bgr01,
    BgrNorm,
}

impl Preprocess {
    fn is_bgr(self) -> bool {
        matches!(self, Preprocess::Bgr01 | Preprocess::BgrNorm)
    }

    fn normalize(self, v: u8) -> f32 {
        let x = v as f32 / 255.0;
        match self {
            Preprocess::Rgb01 | Preprocess::Bgr01 => x,
            Preprocess::RgbNorm | Preprocess::BgrNorm => (x - 0.5) / 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLivenessConfig {
    pub model_path: PathBuf,
    /// Class index of "live"; autodetected from the class count when absent.
    #[serde(default)]
    pub live_index: Option<usize>,
    #[serde(default)]
    pub strictness: Strictness,
    #[serde(default)]
    pub thresholds: StrictnessThresholds,
    #[serde(default)]
    pub preprocess: Preprocess,
    #[serde(default = "default_smooth_k")]
    pub smooth_k: usize,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
}

fn default_smooth_k() -> usize {
    3
}

fn default_input_size() -> u32 {
    80
}

impl ModelLivenessConfig {
    pub fn threshold(&self) -> f32 {
        self.thresholds.for_strictness(self.strictness)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LivenessBackend {
    #[default]
    Disabled,
    HeuristicLow,
    HeuristicMedium,
    ModelBased(ModelLivenessConfig),
}

impl LivenessBackend {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, LivenessBackend::Disabled)
    }

    /// Window for majority-vote smoothing, `None` when verdicts are used raw.
    fn smoothing_window(&self) -> Option<usize> {
        match self {
            LivenessBackend::HeuristicMedium => Some(default_smooth_k()),
            LivenessBackend::ModelBased(cfg) if cfg.strictness == Strictness::Medium => {
                Some(cfg.smooth_k.max(1))
            }
            _ => None,
        }
    }
}

/// Raw classifier over a face crop. Returns logits (or a single score).
pub trait LivenessModel: Send {
    fn infer(&mut self, crop: &RgbImage) -> Result<Vec<f32>, LivenessError>;
}

/// Rolling per-camera history of live/not-live verdicts.
#[derive(Debug, Clone, Default)]
pub struct VoteHistory {
    votes: VecDeque<bool>,
}

impl VoteHistory {
    /// Record a verdict and return whether at least half (rounded up) of the
    /// last `k` verdicts were live.
    pub fn push(&mut self, live: bool, k: usize) -> bool {
        let k = k.max(1);
        self.votes.push_back(live);
        while self.votes.len() > k {
            self.votes.pop_front();
        }
        let live_count = self.votes.iter().filter(|&&v| v).count();
        live_count >= k.div_ceil(2)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessVerdict {
    pub live: bool,
    pub score: f32,
}

/// Score of the "live" class from raw model output.
///
/// Two or more values are softmaxed; the configured index is used when in
/// range, else 2 for three classes and 1 otherwise, else the max probability.
/// A single value is taken as the score itself.
pub fn live_score(logits: &[f32], live_index: Option<usize>) -> f32 {
    match logits.len() {
        0 => 0.0,
        1 => logits[0],
        n => {
            let probs = softmax(logits);
            let idx = live_index.unwrap_or(if n == 3 { 2 } else { 1 });
            match probs.get(idx) {
                Some(&p) => p,
                None => probs.iter().copied().fold(0.0, f32::max),
            }
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum::<f32>() + 1e-12;
    exps.into_iter().map(|e| e / sum).collect()
}

/// Runs the configured backend on a face crop.
pub struct LivenessChecker {
    backend: LivenessBackend,
    model: Option<Box<dyn LivenessModel>>,
}

impl LivenessChecker {
    pub fn new(backend: LivenessBackend, model: Option<Box<dyn LivenessModel>>) -> Self {
        Self { backend, model }
    }

    pub fn disabled() -> Self {
        Self::new(LivenessBackend::Disabled, None)
    }

    pub fn backend(&self) -> &LivenessBackend {
        &self.backend
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_enabled()
    }

    /// Crop side the backend wants.
    pub fn crop_size(&self) -> u32 {
        match &self.backend {
            LivenessBackend::ModelBased(cfg) => cfg.input_size,
            _ => default_input_size(),
        }
    }

    /// Evaluate one crop. `None` when the backend is disabled.
    pub fn evaluate(
        &mut self,
        crop: &RgbImage,
        history: &mut VoteHistory,
    ) -> Result<Option<LivenessVerdict>, LivenessError> {
        let raw = match &self.backend {
            LivenessBackend::Disabled => return Ok(None),
            LivenessBackend::HeuristicLow => {
                let mean = imgproc::mean(&imgproc::to_gray(crop));
                LivenessVerdict { live: mean >= HEURISTIC_LOW_MIN_MEAN, score: mean / 255.0 }
            }
            LivenessBackend::HeuristicMedium => {
                let gray = imgproc::to_gray(crop);
                let mean = imgproc::mean(&gray);
                let lap = imgproc::laplacian_variance(&gray);
                tracing::debug!(mean, laplacian = lap, "heuristic liveness");
                LivenessVerdict {
                    live: mean >= HEURISTIC_MEDIUM_MIN_MEAN && lap >= HEURISTIC_MEDIUM_MIN_LAPLACIAN,
                    score: mean / 255.0,
                }
            }
            LivenessBackend::ModelBased(cfg) => {
                let model = self.model.as_mut().ok_or(LivenessError::ModelMissing)?;
                let logits = model.infer(crop)?;
                let score = live_score(&logits, cfg.live_index);
                let threshold = cfg.threshold();
                tracing::debug!(classes = logits.len(), score, threshold, "model liveness");
                LivenessVerdict { live: score >= threshold, score }
            }
        };

        let live = match self.backend.smoothing_window() {
            Some(k) => history.push(raw.live, k),
            None => raw.live,
        };
        Ok(Some(LivenessVerdict { live, ..raw }))
    }
}

/// MiniFASNet-style ONNX classifier with NCHW float input.
pub struct MiniFasNet {
    session: Session,
    input_size: u32,
    preprocess: Preprocess,
}

impl MiniFasNet {
    pub fn load(config: &ModelLivenessConfig, intra_threads: usize) -> Result<Self, LivenessError> {
        let path: &Path = &config.model_path;
        if !path.exists() {
            return Err(LivenessError::ModelNotFound(path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(path)?;

        tracing::info!(
            path = %path.display(),
            input_size = config.input_size,
            preprocess = ?config.preprocess,
            "loaded liveness model"
        );

        Ok(Self {
            session,
            input_size: config.input_size.max(1),
            preprocess: config.preprocess,
        })
    }

    fn preprocess(crop: &RgbImage, size: u32, mode: Preprocess) -> Array4<f32> {
        let resized = imgproc::resize_rgb_bilinear(crop, size, size);
        let s = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
        for (x, y, px) in resized.enumerate_pixels() {
            for c in 0..3 {
                let src = if mode.is_bgr() { 2 - c } else { c };
                tensor[[0, c, y as usize, x as usize]] = mode.normalize(px.0[src]);
            }
        }
        tensor
    }
}

impl LivenessModel for MiniFasNet {
    fn infer(&mut self, crop: &RgbImage) -> Result<Vec<f32>, LivenessError> {
        let input = Self::preprocess(crop, self.input_size, self.preprocess);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LivenessError::InferenceFailed(format!("logits: {e}")))?;
        Ok(logits.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct FixedModel(Vec<f32>);

    impl LivenessModel for FixedModel {
        fn infer(&mut self, _crop: &RgbImage) -> Result<Vec<f32>, LivenessError> {
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    impl LivenessModel for FailingModel {
        fn infer(&mut self, _crop: &RgbImage) -> Result<Vec<f32>, LivenessError> {
            Err(LivenessError::InferenceFailed("boom".into()))
        }
    }

    fn model_config(strictness: Strictness) -> ModelLivenessConfig {
        ModelLivenessConfig {
            model_path: PathBuf::from("unused.onnx"),
            live_index: None,
            strictness,
            thresholds: StrictnessThresholds::default(),
            preprocess: Preprocess::Rgb01,
            smooth_k: 3,
            input_size: 80,
        }
    }

    fn textured_crop(base: u8) -> RgbImage {
        RgbImage::from_fn(80, 80, |x, y| {
            let v = if (x / 2 + y / 2) % 2 == 0 { base } else { base.saturating_add(60) };
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_live_score_three_classes_uses_index_two() {
        let score = live_score(&[0.0, 0.0, 2.0], None);
        let expected = 2f32.exp() / (2.0 + 2f32.exp());
        assert!((score - expected).abs() < 1e-5);
    }

    #[test]
    fn test_live_score_two_classes_uses_index_one() {
        let score = live_score(&[0.0, 0.0], None);
        assert!((score - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_live_score_single_value_is_raw() {
        assert_eq!(live_score(&[0.83], None), 0.83);
    }

    #[test]
    fn test_live_score_out_of_range_index_uses_max() {
        let score = live_score(&[3.0, 0.0], Some(7));
        assert!(score > 0.9);
    }

    #[test]
    fn test_vote_history_majority() {
        // k = 3 needs two live votes in the window.
        let mut h = VoteHistory::default();
        assert!(!h.push(false, 3));
        assert!(!h.push(true, 3));
        assert!(h.push(true, 3));
        assert!(h.push(false, 3));
        assert!(!h.push(false, 3));
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn test_heuristic_low_rejects_black_crop() {
        let mut checker = LivenessChecker::new(LivenessBackend::HeuristicLow, None);
        let mut h = VoteHistory::default();
        let black = RgbImage::new(80, 80);
        let v = checker.evaluate(&black, &mut h).unwrap().unwrap();
        assert!(!v.live);
        let v = checker.evaluate(&textured_crop(100), &mut h).unwrap().unwrap();
        assert!(v.live);
    }

    #[test]
    fn test_heuristic_medium_rejects_flat_crop() {
        let mut checker = LivenessChecker::new(LivenessBackend::HeuristicMedium, None);
        let mut h = VoteHistory::default();
        let flat = RgbImage::from_pixel(80, 80, Rgb([120, 120, 120]));
        for _ in 0..3 {
            assert!(!checker.evaluate(&flat, &mut h).unwrap().unwrap().live);
        }
        // Two textured frames restore the majority.
        checker.evaluate(&textured_crop(80), &mut h).unwrap();
        assert!(checker.evaluate(&textured_crop(80), &mut h).unwrap().unwrap().live);
    }

    #[test]
    fn test_model_based_high_uses_raw_verdict() {
        let cfg = model_config(Strictness::High);
        let mut checker = LivenessChecker::new(
            LivenessBackend::ModelBased(cfg),
            Some(Box::new(FixedModel(vec![0.0, 0.0, 0.0]))),
        );
        let mut h = VoteHistory::default();
        let v = checker.evaluate(&textured_crop(90), &mut h).unwrap().unwrap();
        assert!(!v.live);
        assert!((v.score - 1.0 / 3.0).abs() < 1e-4);
        assert!(h.is_empty());
    }

    #[test]
    fn test_model_based_medium_is_smoothed() {
        let cfg = model_config(Strictness::Medium);
        let mut checker = LivenessChecker::new(
            LivenessBackend::ModelBased(cfg),
            Some(Box::new(FixedModel(vec![0.95]))),
        );
        let mut h = VoteHistory::default();
        checker.evaluate(&textured_crop(90), &mut h).unwrap();
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_model_error_propagates() {
        let mut checker = LivenessChecker::new(
            LivenessBackend::ModelBased(model_config(Strictness::High)),
            Some(Box::new(FailingModel)),
        );
        let mut h = VoteHistory::default();
        assert!(checker.evaluate(&textured_crop(90), &mut h).is_err());
    }

    #[test]
    fn test_disabled_returns_none() {
        let mut checker = LivenessChecker::disabled();
        let mut h = VoteHistory::default();
        assert!(checker.evaluate(&textured_crop(90), &mut h).unwrap().is_none());
    }

    #[test]
    fn test_preprocess_bgr_swaps_channels() {
        let crop = RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]));
        let t = MiniFasNet::preprocess(&crop, 4, Preprocess::BgrNorm);
        assert!((t[[0, 0, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((t[[0, 2, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_backend_deserializes_from_tagged_toml_shape() {
        let json = r#"{"kind":"model_based","model_path":"m.onnx","strictness":"medium"}"#;
        let backend: LivenessBackend = serde_json::from_str(json).unwrap();
        match backend {
            LivenessBackend::ModelBased(cfg) => {
                assert_eq!(cfg.strictness, Strictness::Medium);
                assert_eq!(cfg.smooth_k, 3);
                assert!((cfg.threshold() - 0.55).abs() < 1e-6);
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }
}
