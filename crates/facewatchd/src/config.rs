use facewatch_core::{DetectionSettings, ExposureParams, LivenessBackend};
use facewatch_hw::SourceConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::encoder::EncodeParams;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Daemon configuration, loaded from TOML with `FACEWATCH_*` overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cameras: Vec<CameraSpec>,
    pub detection: DetectionConfig,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
    pub models: ModelsConfig,
    pub identities: IdentitiesConfig,
}

/// One configured camera. The index is its position in `[[cameras]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSpec {
    #[serde(skip)]
    pub index: usize,
    pub name: String,
    /// Device path, bare device index, or URL.
    pub source: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_display_interval_ms")]
    pub display_interval_ms: u64,
    /// Offer every Nth captured frame for detection.
    #[serde(default = "default_detect_interval")]
    pub detect_interval_frames: u32,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
    #[serde(default = "default_latency_half_life_ms")]
    pub latency_half_life_ms: u64,
    #[serde(default)]
    pub exposure: ExposureParams,
}

fn default_true() -> bool {
    true
}

fn default_display_interval_ms() -> u64 {
    50
}

fn default_detect_interval() -> u32 {
    3
}

fn default_reconnect_delay_secs() -> u64 {
    10
}

fn default_frame_buffer() -> usize {
    1
}

fn default_latency_half_life_ms() -> u64 {
    800
}

impl CameraSpec {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            index: 0,
            name: name.into(),
            source: source.into(),
            enabled: true,
            display_interval_ms: default_display_interval_ms(),
            detect_interval_frames: default_detect_interval(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            frame_buffer: default_frame_buffer(),
            latency_half_life_ms: default_latency_half_life_ms(),
            exposure: ExposureParams::default(),
        }
    }

    pub fn display_interval(&self) -> Duration {
        Duration::from_millis(self.display_interval_ms)
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            name: self.name.clone(),
            source: self.source.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            frame_buffer: self.frame_buffer.max(1),
            latency_half_life: Duration::from_millis(self.latency_half_life_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    #[serde(flatten)]
    pub settings: DetectionSettings,
    pub liveness: LivenessBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    #[serde(flatten)]
    pub encode: EncodeParams,
    pub box_thickness_max: i32,
    /// TTF/OTF font for labels; boxes are drawn without labels when unset.
    pub label_font: Option<PathBuf>,
    /// Also draw faces that were skipped (blurry, inference failure),
    /// labelled `SKIP:<reason>`.
    pub show_skipped: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { encode: EncodeParams::default(), box_thickness_max: 6, label_font: None, show_skipped: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum seconds between match log entries per camera, 0 = unlimited.
    pub match_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { match_interval_secs: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub dir: PathBuf,
    pub detector: String,
    pub embedder: String,
    pub intra_threads: usize,
    /// Inference pool threads, 0 = CPU count minus one.
    pub pool_size: usize,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_data_dir().join("models"),
            detector: "det_10g.onnx".to_string(),
            embedder: "w600k_r50.onnx".to_string(),
            intra_threads: 2,
            pool_size: 0,
        }
    }
}

impl ModelsConfig {
    /// Path to the SCRFD detection model.
    pub fn detector_path(&self) -> PathBuf {
        self.dir.join(&self.detector)
    }

    /// Path to the ArcFace recognition model.
    pub fn embedder_path(&self) -> PathBuf {
        self.dir.join(&self.embedder)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitiesConfig {
    /// JSON gallery file or a directory of face images.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load from `FACEWATCH_CONFIG` (or the XDG default), then apply
    /// environment overrides. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("FACEWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());
        let mut config = Self::load_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read { path: path.to_path_buf(), source }),
        }
    }

    /// Parse TOML and assign camera indices. Does not validate.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.index_cameras();
        Ok(config)
    }

    fn index_cameras(&mut self) {
        for (i, cam) in self.cameras.iter_mut().enumerate() {
            cam.index = i;
            cam.detect_interval_frames = cam.detect_interval_frames.max(1);
            cam.frame_buffer = cam.frame_buffer.max(1);
        }
    }

    /// Override selected scalars from `FACEWATCH_*` variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("FACEWATCH_MODEL_DIR") {
            self.models.dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("FACEWATCH_KNOWN_FACES") {
            self.identities.path = Some(PathBuf::from(path));
        }
        let d = &mut self.detection.settings;
        d.match_threshold = env_f32(&lookup, "FACEWATCH_MATCH_THRESHOLD", d.match_threshold);
        d.min_sharpness_percent = env_f32(&lookup, "FACEWATCH_MIN_SHARPNESS_PERCENT", d.min_sharpness_percent);
        self.logging.match_interval_secs =
            env_u64(&lookup, "FACEWATCH_MATCH_LOG_INTERVAL_SECS", self.logging.match_interval_secs);
        self.models.intra_threads = env_usize(&lookup, "FACEWATCH_INTRA_THREADS", self.models.intra_threads);
        self.models.pool_size = env_usize(&lookup, "FACEWATCH_POOL_SIZE", self.models.pool_size);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detection.settings;
        for (name, v) in [("match_threshold", d.match_threshold), ("caution_threshold", d.caution_threshold)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")));
            }
        }
        let q = self.stream.encode.quality;
        if !(1..=100).contains(&q) {
            return Err(ConfigError::Invalid(format!("stream quality must be within 1..=100, got {q}")));
        }
        if !(0.0..=100.0).contains(&d.min_sharpness_percent) {
            return Err(ConfigError::Invalid(format!(
                "min_sharpness_percent must be within [0, 100], got {}",
                d.min_sharpness_percent
            )));
        }
        if d.sharpness_var_max <= 0.0 {
            return Err(ConfigError::Invalid("sharpness_var_max must be positive".to_string()));
        }
        if self.stream.box_thickness_max < 2 {
            return Err(ConfigError::Invalid("box_thickness_max must be at least 2".to_string()));
        }
        for cam in &self.cameras {
            if cam.source.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("camera {} ({}) has an empty source", cam.index, cam.name)));
            }
        }
        Ok(())
    }

    /// Pool size with the `0 = CPU - 1` rule applied.
    pub fn pool_size(&self) -> usize {
        if self.models.pool_size > 0 {
            return self.models.pool_size;
        }
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        cpus.saturating_sub(1).max(1)
    }

    pub fn match_interval(&self) -> Duration {
        Duration::from_secs(self.logging.match_interval_secs)
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("facewatch/facewatch.toml")
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("facewatch")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::Strictness;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[[cameras]]
name = "lobby"
source = "/dev/video0"

[[cameras]]
name = "gate"
source = "rtsp://10.0.0.7/stream"
enabled = false
detect_interval_frames = 0
frame_buffer = 4

[cameras.exposure]
gain = 1.8

[detection]
match_threshold = 0.55
max_faces = 4
min_sharpness_percent = 8.0

[detection.liveness]
kind = "model_based"
model_path = "/opt/models/minifasnet.onnx"
strictness = "medium"

[stream]
quality = 80
target_kb = 120
show_skipped = true

[logging]
match_interval_secs = 0
"#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.cameras.is_empty());
        assert_eq!(config.detection.settings, DetectionSettings::default());
        assert_eq!(config.detection.liveness, LivenessBackend::Disabled);
        assert_eq!(config.stream.encode.quality, 65);
        assert_eq!(config.stream.encode.max_width, 960);
        assert_eq!(config.logging.match_interval_secs, 3);
        assert_eq!(config.models.detector, "det_10g.onnx");
        assert!(!config.stream.show_skipped);
        assert!((config.detection.settings.min_sharpness_percent - 20.0).abs() < 1e-6);
        config.validate().unwrap();
    }

    #[test]
    fn test_cameras_indexed_and_defaulted() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.cameras.len(), 2);

        let lobby = &config.cameras[0];
        assert_eq!(lobby.index, 0);
        assert!(lobby.enabled);
        assert_eq!(lobby.display_interval_ms, 50);
        assert_eq!(lobby.detect_interval_frames, 3);
        assert_eq!(lobby.reconnect_delay_secs, 10);
        assert!((lobby.exposure.gain - 1.4).abs() < 1e-6);

        let gate = &config.cameras[1];
        assert_eq!(gate.index, 1);
        assert!(!gate.enabled);
        // Clamped to at least one.
        assert_eq!(gate.detect_interval_frames, 1);
        assert_eq!(gate.source_config().frame_buffer, 4);
        assert!((gate.exposure.gain - 1.8).abs() < 1e-6);
        assert!(gate.exposure.enabled);
    }

    #[test]
    fn test_detection_and_liveness_sections() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let d = &config.detection.settings;
        assert!((d.match_threshold - 0.55).abs() < 1e-6);
        assert_eq!(d.max_faces, 4);
        assert!((d.caution_threshold - 0.40).abs() < 1e-6);
        assert!((d.min_sharpness_percent - 8.0).abs() < 1e-6);
        assert!((d.sharpness_var_max - 1000.0).abs() < 1e-6);

        let LivenessBackend::ModelBased(model) = &config.detection.liveness else {
            panic!("expected model based liveness");
        };
        assert_eq!(model.strictness, Strictness::Medium);
        assert_eq!(model.smooth_k, 3);
        assert!((model.threshold() - 0.55).abs() < 1e-6);
        assert_eq!(config.stream.encode.quality, 80);
        assert_eq!(config.stream.encode.target_kb, 120);
        assert_eq!(config.logging.match_interval_secs, 0);
        assert!(config.stream.show_skipped);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FACEWATCH_MODEL_DIR", "/srv/models"),
            ("FACEWATCH_MATCH_THRESHOLD", "0.7"),
            ("FACEWATCH_MATCH_LOG_INTERVAL_SECS", "10"),
            ("FACEWATCH_INTRA_THREADS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.models.detector_path(), PathBuf::from("/srv/models/det_10g.onnx"));
        assert!((config.detection.settings.match_threshold - 0.7).abs() < 1e-6);
        assert_eq!(config.match_interval(), Duration::from_secs(10));
        // Unparseable values keep the default.
        assert_eq!(config.models.intra_threads, 2);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.detection.settings.match_threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.stream.encode.quality = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.detection.settings.min_sharpness_percent = 120.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.detection.settings.sharpness_var_max = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.cameras.push(CameraSpec::new("blank", "  "));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_retired_stream_keys_are_ignored() {
        let config = Config::from_toml_str("[stream]\noptimize = true\nquality = 70\n").unwrap();
        assert_eq!(config.stream.encode.quality, 70);
        assert_eq!(config.stream.encode, EncodeParams { quality: 70, ..EncodeParams::default() });
    }

    #[test]
    fn test_parse_error_is_reported() {
        assert!(matches!(Config::from_toml_str("cameras = 3"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_pool_size_at_least_one() {
        let config = Config::default();
        assert!(config.pool_size() >= 1);
        let mut fixed = Config::default();
        fixed.models.pool_size = 3;
        assert_eq!(fixed.pool_size(), 3);
    }
}
