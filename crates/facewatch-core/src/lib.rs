//! facewatch-core — face detection, liveness and matching pipeline.
//!
//! Uses SCRFD for face detection, ArcFace for embeddings and a MiniFASNet
//! style classifier for liveness, all running via ONNX Runtime on the CPU.
//! Between detection cycles faces are carried by a sparse optical flow
//! tracker.

pub mod alignment;
pub mod antispoof;
pub mod detector;
pub mod engine;
pub mod exposure;
pub mod flow;
pub mod imgproc;
pub mod liveness;
pub mod recognizer;
pub mod tracker;
pub mod types;

pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use engine::{CameraDetectState, DetectionEngine, DetectionSettings, EngineError};
pub use exposure::ExposureParams;
pub use liveness::{
    LivenessBackend, LivenessChecker, LivenessError, LivenessModel, MiniFasNet, ModelLivenessConfig, Strictness,
};
pub use recognizer::{ArcFaceEmbedder, FaceEmbedder, RecognizerError};
pub use tracker::{ShortTermTracker, TrackerConfig};
pub use types::{
    BoundingBox, Embedding, FaceBox, FaceObservation, FirstMatchMatcher, KnownFace, KnownFaceIndex, MatchResult,
    Matcher, SkipReason,
};
