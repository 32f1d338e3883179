use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw detector output in frame coordinates, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Divide coordinates and landmarks by `factor`, mapping a detection made on
    /// an upscaled image back to the source frame.
    pub fn downscaled(&self, factor: f32) -> Self {
        Self {
            x: self.x / factor,
            y: self.y / factor,
            width: self.width / factor,
            height: self.height / factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx / factor, ly / factor))),
        }
    }

    /// Distance between the two eye landmarks, 0.0 without landmarks.
    pub fn inter_ocular(&self) -> f32 {
        match &self.landmarks {
            Some(lms) => {
                let (lx, ly) = lms[0];
                let (rx, ry) = lms[1];
                (lx - rx).hypot(ly - ry)
            }
            None => 0.0,
        }
    }
}

/// Integer face box `[x1, x2) x [y1, y2)`, always clipped to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl FaceBox {
    /// Round and clip corner coordinates to a `width` x `height` frame.
    ///
    /// Returns `None` when the clipped box is empty.
    pub fn clipped(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 || !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
            return None;
        }
        let max_x = width as i32 - 1;
        let max_y = height as i32 - 1;
        let x1 = (x1.round() as i32).clamp(0, max_x);
        let x2 = (x2.round() as i32).clamp(0, max_x);
        let y1 = (y1.round() as i32).clamp(0, max_y);
        let y2 = (y2.round() as i32).clamp(0, max_y);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Self { x1, y1, x2, y2 })
    }

    pub fn from_detection(det: &BoundingBox, width: u32, height: u32) -> Option<Self> {
        Self::clipped(det.x, det.y, det.x + det.width, det.y + det.height, width, height)
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn min_side(&self) -> i32 {
        self.width().min(self.height())
    }

    pub fn max_side(&self) -> i32 {
        self.width().max(self.height())
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x1 + self.x2) as f32 * 0.5,
            (self.y1 + self.y2) as f32 * 0.5,
        )
    }

    pub fn as_f32(&self) -> [f32; 4] {
        [self.x1 as f32, self.y1 as f32, self.x2 as f32, self.y2 as f32]
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        iou_xyxy(&self.as_f32(), &other.as_f32())
    }
}

/// IoU of two `[x1, y1, x2, y2]` boxes.
pub fn iou_xyxy(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }
    let area_a = ((a[2] - a[0]) * (a[3] - a[1])).max(1.0);
    let area_b = ((b[2] - b[0]) * (b[3] - b[1])).max(1.0);
    inter / (area_a + area_b - inter)
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Zero vectors compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// A named reference embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownFace {
    pub name: String,
    pub embedding: Embedding,
}

/// Ordered gallery of known identities. A name may appear more than once.
///
/// Order matters: matching declares the first entry over threshold.
#[derive(Debug, Clone, Default)]
pub struct KnownFaceIndex {
    faces: Vec<KnownFace>,
}

impl KnownFaceIndex {
    pub fn new(faces: Vec<KnownFace>) -> Self {
        Self { faces }
    }

    pub fn push(&mut self, name: impl Into<String>, embedding: Embedding) {
        self.faces.push(KnownFace { name: name.into(), embedding });
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownFace> {
        self.faces.iter()
    }
}

/// Result of matching a query embedding against the known-face index.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Similarity of the declared match, or of the best candidate when unmatched.
    pub similarity: f32,
    /// Name of the matched identity (if any).
    pub identity: Option<String>,
    /// Best-scoring identity seen during the scan, matched or not.
    pub best_candidate: Option<String>,
}

/// Strategy for comparing a query embedding against the known-face index.
pub trait Matcher {
    fn compare(&self, query: &Embedding, index: &KnownFaceIndex, threshold: f32) -> MatchResult;
}

/// Cosine matcher that declares the first identity (in index order) whose
/// similarity reaches the threshold, not the global best.
///
/// The best candidate is tracked over the scanned prefix, which is the whole
/// index when nothing matches.
pub struct FirstMatchMatcher;

impl Matcher for FirstMatchMatcher {
    fn compare(&self, query: &Embedding, index: &KnownFaceIndex, threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_name: Option<&str> = None;

        for known in index.iter() {
            let sim = query.similarity(&known.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_name = Some(&known.name);
            }
            if sim >= threshold {
                return MatchResult {
                    matched: true,
                    similarity: sim,
                    identity: Some(known.name.clone()),
                    best_candidate: best_name.map(str::to_string),
                };
            }
        }

        MatchResult {
            matched: false,
            // Negative similarities carry no candidate signal.
            similarity: if best_sim >= 0.0 { best_sim } else { 0.0 },
            identity: None,
            best_candidate: best_name.map(str::to_string),
        }
    }
}

/// Why a face was kept in the batch but excluded from drawing, tracking and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The face crop is too blurry to judge; sharpness in percent of the
    /// configured Laplacian-variance ceiling.
    Blur { sharpness_percent: u8 },
    /// The liveness model failed on this face.
    LivenessInference(String),
    /// The embedding model failed on this face.
    Embedding(String),
}

impl SkipReason {
    /// Short tag used in overlay labels.
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::Blur { .. } => "blur",
            SkipReason::LivenessInference(_) => "liveness",
            SkipReason::Embedding(_) => "embedding",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Blur { sharpness_percent } => write!(f, "too blurry ({sharpness_percent}% sharp)"),
            SkipReason::LivenessInference(e) => write!(f, "liveness inference failed: {e}"),
            SkipReason::Embedding(e) => write!(f, "embedding failed: {e}"),
        }
    }
}

/// One analysed face. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bbox: FaceBox,
    pub embedding: Option<Embedding>,
    pub keypoints: Option<[(f32, f32); 5]>,
    pub matched_identity: Option<String>,
    /// Match score in [0, 1]; the best candidate's score when unmatched.
    pub match_score: f32,
    pub liveness_checked: bool,
    pub liveness_live: bool,
    pub best_candidate_name: Option<String>,
    pub skipped: Option<SkipReason>,
}

pub const UNKNOWN_NAME: &str = "unknown";

impl FaceObservation {
    pub fn new(bbox: FaceBox) -> Self {
        Self {
            bbox,
            embedding: None,
            keypoints: None,
            matched_identity: None,
            match_score: 0.0,
            liveness_checked: false,
            liveness_live: true,
            best_candidate_name: None,
            skipped: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.matched_identity.is_some()
    }

    /// Matched identity or "unknown".
    pub fn display_name(&self) -> &str {
        self.matched_identity.as_deref().unwrap_or(UNKNOWN_NAME)
    }

    /// Not skipped and not known to be a spoof.
    pub fn is_presentable(&self) -> bool {
        self.skipped.is_none() && !(self.liveness_checked && !self.liveness_live)
    }

    /// Eligible for the match log.
    pub fn is_live_match(&self) -> bool {
        self.is_presentable() && self.liveness_live && self.is_match()
    }

    pub fn with_bbox(&self, bbox: FaceBox) -> Self {
        Self { bbox, ..self.clone() }
    }
}
