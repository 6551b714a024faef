//! facefind-core: find every event photo showing a given person.
//!
//! Faces are detected with SCRFD and embedded with ArcFace via ONNX
//! Runtime. Photos with exactly one face are indexed; a query photo is
//! matched against the index by embedding distance under a fixed threshold.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod extractor;
pub mod guard;
pub mod matching;
pub mod person_search;
pub mod recognizer;
pub mod registration;
pub mod repository;
pub mod types;
pub mod validator;

pub use config::Config;
pub use extractor::{ExtractionError, FaceExtractor, FaceStream, OnnxExtractor, ScriptedExtractor};
pub use matching::{MatchSettings, MatchingEngine, SearchError, SearchOutcome, SearchTrace};
pub use registration::{RegistrationError, RegistrationPipeline, RegistrationReport};
pub use repository::{FaceRepository, MemoryRepository, RepositoryError, UpsertOutcome};
pub use types::{
    BoundingBox, DetectedFace, DistanceMetric, Embedding, FaceRecord, NewFaceRecord,
    OverwritePolicy, Provenance, QueryResult,
};
pub use validator::{DetectionOutcome, ValidationFailure};
