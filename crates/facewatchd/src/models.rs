//! Builds DetectionEngines from the configured ONNX models.

use crate::config::{DetectionConfig, ModelsConfig};
use facewatch_core::{
    ArcFaceEmbedder, DetectionEngine, DetectorError, LivenessBackend, LivenessChecker, LivenessError, LivenessModel,
    MiniFasNet, RecognizerError, ScrfdDetector,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("liveness: {0}")]
    Liveness(#[from] LivenessError),
}

/// Produces one engine per inference thread.
pub trait EngineFactory: Send + Sync {
    fn build(&self) -> Result<DetectionEngine, ModelError>;
}

pub struct OnnxEngineFactory {
    models: ModelsConfig,
    detection: DetectionConfig,
}

impl OnnxEngineFactory {
    pub fn new(models: ModelsConfig, detection: DetectionConfig) -> Self {
        Self { models, detection }
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn build(&self) -> Result<DetectionEngine, ModelError> {
        let threads = self.models.intra_threads;
        let detector_path = self.models.detector_path();
        let detector = ScrfdDetector::load(&detector_path, threads)?;
        tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

        let embedder_path = self.models.embedder_path();
        let embedder = ArcFaceEmbedder::load(&embedder_path, threads)?;
        tracing::info!(path = %embedder_path.display(), "ArcFace embedder loaded");

        let backend = self.detection.liveness.clone();
        let model: Option<Box<dyn LivenessModel>> = match &backend {
            LivenessBackend::ModelBased(cfg) => {
                let model = MiniFasNet::load(cfg, threads)?;
                tracing::info!(path = %cfg.model_path.display(), threshold = cfg.threshold(), "liveness model loaded");
                Some(Box::new(model))
            }
            _ => None,
        };

        Ok(DetectionEngine::new(
            Box::new(detector),
            Box::new(embedder),
            LivenessChecker::new(backend, model),
            self.detection.settings.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_model_fails_fast() {
        let models = ModelsConfig { dir: PathBuf::from("/nonexistent/facewatch-models"), ..Default::default() };
        let factory = OnnxEngineFactory::new(models, DetectionConfig::default());
        assert!(matches!(factory.build(), Err(ModelError::Detector(DetectorError::ModelNotFound(_)))));
    }
}
