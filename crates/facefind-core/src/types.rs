use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box for a detected face, with optional facial landmarks.
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

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
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

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Return a unit-length copy. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|x| x / norm).collect())
        } else {
            self.clone()
        }
    }

    /// Dissimilarity under `metric`. Lower = more similar.
    ///
    /// Cosine distance is clamped to [0, 1]: opposite vectors are as far
    /// apart as orthogonal ones for matching purposes.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => (1.0 - self.similarity(other)).clamp(0.0, 1.0),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::EuclideanL2 => self
                .l2_normalized()
                .euclidean_distance(&other.l2_normalized()),
        }
    }
}

/// Distance function used to rank stored embeddings against a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// What to do when a path is registered again with different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Keep the stored record and report `DuplicatePath`.
    #[default]
    Reject,
    /// Re-embed and replace the stored record.
    Replace,
}

impl FromStr for OverwritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverwritePolicy::Reject),
            "replace" => Ok(OverwritePolicy::Replace),
            other => Err(format!("unknown overwrite policy: {other}")),
        }
    }
}

/// One face found by the extractor: its box (carrying the detector
/// confidence) and its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

impl DetectedFace {
    pub fn detector_confidence(&self) -> f32 {
        self.bbox.confidence
    }
}

/// Model identity an index was built with. Queries must carry the same
/// model and detector, and every stored vector has the same dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub embedding_model: String,
    pub detector_backend: String,
    pub dimension: usize,
}

/// A face record as handed to the repository, before an id is assigned.
#[derive(Debug, Clone)]
pub struct NewFaceRecord {
    /// Canonical (absolute, symlink-resolved) source path.
    pub image_path: String,
    pub embedding: Embedding,
    pub embedding_model: String,
    pub detector_backend: String,
    pub distance_metric: DistanceMetric,
    /// SHA-256 of the source image bytes, lowercase hex.
    pub content_hash: String,
}

impl NewFaceRecord {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            embedding_model: self.embedding_model.clone(),
            detector_backend: self.detector_backend.clone(),
            dimension: self.embedding.dimension(),
        }
    }
}

/// A stored face record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: String,
    pub image_path: String,
    pub embedding: Embedding,
    pub embedding_model: String,
    pub detector_backend: String,
    pub distance_metric: DistanceMetric,
    pub content_hash: String,
    pub created_at: String,
}

/// A single ranked match returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub image_path: String,
    pub distance: f32,
    pub confidence: f32,
}

impl QueryResult {
    pub fn from_distance(image_path: String, distance: f32) -> Self {
        Self {
            image_path,
            distance,
            confidence: (1.0 - distance).max(0.0),
        }
    }
}
