//! Configuration, built once at startup and passed into each component.
//!
//! Values come from a TOML file (every field has a default) and are then
//! overridden by `FACEFIND_*` environment variables.

use crate::types::{DistanceMetric, OverwritePolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub matching: MatchingConfig,
    pub storage: StorageConfig,
    pub files: FilesConfig,
    pub server: ServerConfig,
    pub person_search: PersonSearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub embedding_model: String,
    pub detector_backend: String,
    pub detector_file: String,
    pub recognizer_file: String,
    /// Photos are shrunk so their longest side is at most this many pixels.
    pub max_image_dimension: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            embedding_model: "w600k_r50".into(),
            detector_backend: "scrfd_10g".into(),
            detector_file: "det_10g.onnx".into(),
            recognizer_file: "w600k_r50.onnx".into(),
            max_image_dimension: 1920,
        }
    }
}

impl ModelConfig {
    pub fn detector_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_file)
    }

    pub fn recognizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub distance_metric: DistanceMetric,
    /// Maximum distance accepted as a match.
    pub threshold: f32,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            distance_metric: DistanceMetric::Cosine,
            threshold: 0.40,
            default_limit: 10,
            max_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Directory registered when no directory is given.
    pub event_photos: PathBuf,
    /// Only paths under these directories may be registered or searched.
    pub allowed_directories: Vec<PathBuf>,
    pub overwrite: OverwritePolicy,
    /// File extensions picked up by registration, without the dot.
    pub image_extensions: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/faces.db"),
            event_photos: PathBuf::from("event_photos"),
            allowed_directories: vec![PathBuf::from("event_photos")],
            overwrite: OverwritePolicy::Reject,
            image_extensions: ["jpg", "jpeg", "png", "heic"].map(String::from).to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub max_upload_size_mb: u64,
    /// Upload formats accepted by magic-number sniffing.
    pub allowed_formats: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_upload_size_mb: 10,
            allowed_formats: ["jpeg", "png", "heic"].map(String::from).to_vec(),
        }
    }
}

impl FilesConfig {
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_size_mb as usize).saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub allowed_origins: Vec<String>,
    /// Upper bound for one search request.
    pub request_timeout_secs: u64,
    /// Upper bound for one `/register` call; a photo takes about a second.
    pub register_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".into(),
            allowed_origins: vec!["http://localhost:3000".into()],
            request_timeout_secs: 30,
            register_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonSearchConfig {
    pub output_root: PathBuf,
    /// Reference photos used per person folder.
    pub max_references: usize,
}

impl Default for PersonSearchConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("output"),
            max_references: 5,
        }
    }
}

impl Config {
    /// Load `path` (defaults if `None`), apply env overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Override fields from `FACEFIND_*` variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("FACEFIND_MODEL_DIR") {
            self.model.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("FACEFIND_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("FACEFIND_EVENT_PHOTOS") {
            self.storage.event_photos = PathBuf::from(v);
        }
        if let Some(v) = var("FACEFIND_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = var("FACEFIND_THRESHOLD") {
            self.matching.threshold = v
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("FACEFIND_THRESHOLD={v}")))?;
        }
        if let Some(v) = var("FACEFIND_DISTANCE_METRIC") {
            self.matching.distance_metric = v.parse().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.matching.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "matching.threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.matching.max_limit == 0 || self.matching.default_limit == 0 {
            return Err(ConfigError::Invalid("matching limits must be positive".into()));
        }
        if self.matching.default_limit > self.matching.max_limit {
            return Err(ConfigError::Invalid(
                "matching.default_limit exceeds matching.max_limit".into(),
            ));
        }
        if self.files.allowed_formats.is_empty() {
            return Err(ConfigError::Invalid("files.allowed_formats is empty".into()));
        }
        if self.storage.image_extensions.is_empty() {
            return Err(ConfigError::Invalid("storage.image_extensions is empty".into()));
        }
        if self.server.request_timeout_secs == 0 || self.server.register_timeout_secs == 0 {
            return Err(ConfigError::Invalid("server timeouts must be positive".into()));
        }
        if self.person_search.max_references == 0 {
            return Err(ConfigError::Invalid(
                "person_search.max_references must be positive".into(),
            ));
        }
        Ok(())
    }
}
