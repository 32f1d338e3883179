//! DetectionEngine: one frame in, filtered and identified face observations out.
//!
//! Stages per frame: multi-scale detection, clipping and ordering, then per
//! face crop, exposure boost, sharpness gate, liveness, photo/screen
//! rejection, small-face gating and first-match identity matching.

use crate::alignment;
use crate::antispoof;
use crate::detector::{DetectorError, FaceDetector};
use crate::exposure::{self, ExposureParams};
use crate::imgproc;
use crate::liveness::{LivenessChecker, VoteHistory};
use crate::recognizer::{FaceEmbedder, RecognizerError};
use crate::types::{
    BoundingBox, Embedding, FaceBox, FaceObservation, FirstMatchMatcher, KnownFaceIndex, Matcher, SkipReason,
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upscale factors tried in order when nothing is found at native size.
const FALLBACK_SCALES: [f32; 2] = [1.5, 2.0];
/// With this many faces in frame, tiny ones are treated as crowd noise.
const CROWD_MIN_FACES: usize = 6;
const CROWD_MIN_SIDE: i32 = 70;
/// Small-face gating only applies with at least this many faces.
const GATING_MIN_FACES: usize = 3;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedding failed: {0}")]
    Embedder(#[from] RecognizerError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub match_threshold: f32,
    /// Unmatched faces scoring at least this are shown as candidates.
    pub caution_threshold: f32,
    pub max_faces: usize,
    pub min_live_face_size: i32,
    pub min_interocular_px: f32,
    pub suppress_small_faces: bool,
    /// Faces below this sharpness are skipped as blurry; 0 disables the gate.
    pub min_sharpness_percent: f32,
    /// Laplacian variance that counts as 100% sharp.
    pub sharpness_var_max: f32,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.60,
            caution_threshold: 0.40,
            max_faces: 8,
            min_live_face_size: 90,
            min_interocular_px: 38.0,
            suppress_small_faces: true,
            min_sharpness_percent: 20.0,
            sharpness_var_max: 1000.0,
        }
    }
}

/// Per-camera state carried between detection cycles.
#[derive(Debug, Clone, Default)]
pub struct CameraDetectState {
    prev_small_centers: Vec<(f32, f32)>,
    prev_frame_size: Option<(u32, u32)>,
    votes: VoteHistory,
}

impl CameraDetectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn small_centers(&self) -> &[(f32, f32)] {
        &self.prev_small_centers
    }

    #[cfg(test)]
    fn with_previous(centers: Vec<(f32, f32)>, frame_size: (u32, u32)) -> Self {
        Self {
            prev_small_centers: centers,
            prev_frame_size: Some(frame_size),
            votes: VoteHistory::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Spoof,
    MovingCluster,
    Crowd,
    Screen,
    TooSmall,
}

pub struct DetectionEngine {
    detector: Box<dyn FaceDetector>,
    embedder: Box<dyn FaceEmbedder>,
    liveness: LivenessChecker,
    settings: DetectionSettings,
}

impl DetectionEngine {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        embedder: Box<dyn FaceEmbedder>,
        liveness: LivenessChecker,
        settings: DetectionSettings,
    ) -> Self {
        Self { detector, embedder, liveness, settings }
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    /// Detect, retrying at larger scales for distant faces. Boxes and
    /// landmarks are mapped back to `frame` coordinates.
    pub fn detect_multiscale(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, EngineError> {
        let found = self.detector.detect(frame)?;
        if !found.is_empty() {
            return Ok(found);
        }
        for scale in FALLBACK_SCALES {
            let bigger = imgproc::scale_rgb(frame, scale);
            let found = self.detector.detect(&bigger)?;
            if !found.is_empty() {
                tracing::debug!(scale, faces = found.len(), "faces found on upscaled frame");
                return Ok(found.iter().map(|d| d.downscaled(scale)).collect());
            }
        }
        Ok(Vec::new())
    }

    /// Embed the largest face of a reference image, `None` when no face is found.
    pub fn enroll(&mut self, image: &RgbImage) -> Result<Option<Embedding>, EngineError> {
        let (width, height) = image.dimensions();
        let largest = self
            .detect_multiscale(image)?
            .into_iter()
            .filter_map(|d| FaceBox::from_detection(&d, width, height).map(|b| (d, b.area())))
            .max_by_key(|(_, area)| *area);
        let Some((det, _)) = largest else {
            return Ok(None);
        };
        Ok(Some(self.embedder.embed(image, &det)?))
    }

    /// Analyse one frame against `known`, updating the camera's state.
    pub fn analyze(
        &mut self,
        frame: &RgbImage,
        known: &KnownFaceIndex,
        exposure: &ExposureParams,
        state: &mut CameraDetectState,
    ) -> Result<Vec<FaceObservation>, EngineError> {
        let (width, height) = frame.dimensions();
        if state.prev_frame_size != Some((width, height)) {
            state.prev_small_centers.clear();
        }
        state.prev_frame_size = Some((width, height));

        let mut faces: Vec<(BoundingBox, FaceBox)> = self
            .detect_multiscale(frame)?
            .into_iter()
            .filter_map(|d| FaceBox::from_detection(&d, width, height).map(|b| (d, b)))
            .collect();
        faces.sort_by(|a, b| b.1.area().cmp(&a.1.area()));
        faces.truncate(self.settings.max_faces);

        let boxes: Vec<FaceBox> = faces.iter().map(|(_, b)| *b).collect();
        let current_small = antispoof::small_face_centers(&boxes);
        let moving_cluster =
            antispoof::coherent_small_motion(&current_small, &state.prev_small_centers);

        let mut observations = Vec::with_capacity(faces.len());
        for (det, bbox) in &faces {
            match self.analyze_face(frame, det, bbox, faces.len(), moving_cluster, known, exposure, state) {
                Ok(obs) => observations.push(obs),
                Err(reason) => tracing::debug!(?bbox, ?reason, "face rejected"),
            }
        }

        state.prev_small_centers = current_small;
        tracing::debug!(detected = faces.len(), kept = observations.len(), "frame analysed");
        Ok(observations)
    }

    #[allow(clippy::too_many_arguments)]
    fn analyze_face(
        &mut self,
        frame: &RgbImage,
        det: &BoundingBox,
        bbox: &FaceBox,
        face_count: usize,
        moving_cluster: bool,
        known: &KnownFaceIndex,
        exposure: &ExposureParams,
        state: &mut CameraDetectState,
    ) -> Result<FaceObservation, Rejection> {
        let mut obs = FaceObservation::new(*bbox);
        obs.keypoints = det.landmarks;

        if let Some(sharpness_percent) = self.blurry(frame, bbox, exposure) {
            tracing::debug!(?bbox, sharpness_percent, "face too blurry");
            obs.skipped = Some(SkipReason::Blur { sharpness_percent });
            return Ok(obs);
        }

        if self.liveness.is_enabled() {
            let crop = self.liveness_crop(frame, det, bbox);
            let crop = exposure::enhance_if_dark(&crop, exposure).unwrap_or(crop);
            match self.liveness.evaluate(&crop, &mut state.votes) {
                Ok(Some(verdict)) => {
                    obs.liveness_checked = true;
                    obs.liveness_live = verdict.live;
                    if !verdict.live {
                        return Err(Rejection::Spoof);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "liveness inference failed");
                    obs.skipped = Some(SkipReason::LivenessInference(e.to_string()));
                    return Ok(obs);
                }
            }

            self.photo_filter(frame, det, bbox, face_count, moving_cluster)?;
        }

        if !known.is_empty() {
            match self.embedder.embed(frame, det) {
                Ok(embedding) => {
                    let result = FirstMatchMatcher.compare(&embedding, known, self.settings.match_threshold);
                    obs.match_score = result.similarity.clamp(0.0, 1.0);
                    obs.matched_identity = result.identity;
                    obs.best_candidate_name = result.best_candidate;
                    obs.embedding = Some(embedding);
                }
                Err(e) => {
                    tracing::error!(error = %e, "embedding failed");
                    obs.skipped = Some(SkipReason::Embedding(e.to_string()));
                }
            }
        }

        Ok(obs)
    }

    /// Sharpness percent of the exposure-corrected face crop when it falls
    /// below `min_sharpness_percent`.
    fn blurry(&self, frame: &RgbImage, bbox: &FaceBox, exposure: &ExposureParams) -> Option<u8> {
        if self.settings.min_sharpness_percent <= 0.0 {
            return None;
        }
        let crop = imgproc::crop_rgb(frame, bbox.x1, bbox.y1, bbox.x2, bbox.y2)?;
        let crop = exposure::enhance_if_dark(&crop, exposure).unwrap_or(crop);
        let percent = sharpness_percent(imgproc::laplacian_variance(&imgproc::to_gray(&crop)), self.settings.sharpness_var_max);
        (percent < self.settings.min_sharpness_percent).then(|| percent.round() as u8)
    }

    fn photo_filter(
        &self,
        frame: &RgbImage,
        det: &BoundingBox,
        bbox: &FaceBox,
        face_count: usize,
        moving_cluster: bool,
    ) -> Result<(), Rejection> {
        let min_side = bbox.min_side();
        if moving_cluster && min_side < antispoof::CLUSTER_REJECT_SIDE {
            return Err(Rejection::MovingCluster);
        }
        if face_count >= CROWD_MIN_FACES && min_side < CROWD_MIN_SIDE {
            return Err(Rejection::Crowd);
        }
        if antispoof::is_screen_like(frame, bbox) {
            return Err(Rejection::Screen);
        }
        if self.settings.suppress_small_faces && face_count >= GATING_MIN_FACES {
            let too_small = bbox.width() < self.settings.min_live_face_size
                || bbox.height() < self.settings.min_live_face_size;
            let eyes_close = det.landmarks.is_some() && det.inter_ocular() < self.settings.min_interocular_px;
            if too_small || eyes_close {
                return Err(Rejection::TooSmall);
            }
        }
        Ok(())
    }

    /// Landmark-aligned square crop when landmarks exist, else the raw box.
    fn liveness_crop(&self, frame: &RgbImage, det: &BoundingBox, bbox: &FaceBox) -> RgbImage {
        if let Some(lms) = &det.landmarks {
            return alignment::align_face(frame, lms, self.liveness.crop_size());
        }
        imgproc::crop_rgb(frame, bbox.x1, bbox.y1, bbox.x2, bbox.y2)
            .unwrap_or_else(|| RgbImage::new(1, 1))
    }
}

/// Laplacian variance as a percentage of `var_max`, clamped to [0, 100].
pub fn sharpness_percent(variance: f32, var_max: f32) -> f32 {
    (variance / var_max.max(1.0) * 100.0).clamp(0.0, 100.0)
}
