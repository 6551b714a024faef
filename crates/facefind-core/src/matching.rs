//! Matching engine: query photo in, ranked indexed photos out.
//!
//! Flow: extract → single-face check → provenance check → nearest
//! neighbors → threshold gate → sort → truncate. The threshold is an
//! accept/reject gate; candidates beyond it are dropped, not ranked low.

use crate::extractor::{ExtractionError, FaceExtractor};
use crate::repository::{FaceRepository, RepositoryError};
use crate::types::{DistanceMetric, Embedding, QueryResult};
use crate::validator::{self, ValidationFailure};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Infrastructure or usage errors. Expected rejections of the query photo
/// are reported through [`SearchOutcome::Rejected`] instead.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("limit must be at least 1")]
    InvalidLimit,
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("query model {query} does not match index model {index}")]
    ModelMismatch { query: String, index: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Result of a search that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    /// Accepted matches, best first. Empty when nothing clears the threshold.
    Matches(Vec<QueryResult>),
    /// The query photo failed the single-face check.
    Rejected(ValidationFailure),
}

impl SearchOutcome {
    pub fn matches(&self) -> Option<&[QueryResult]> {
        match self {
            SearchOutcome::Matches(m) => Some(m),
            SearchOutcome::Rejected(_) => None,
        }
    }
}

/// One nearest-neighbor candidate and whether the threshold let it through.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub image_path: String,
    pub distance: f32,
    pub confidence: f32,
    pub accepted: bool,
}

/// Diagnostic view of one search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchTrace {
    pub faces_detected: usize,
    pub indexed_faces: usize,
    pub threshold: f32,
    pub metric: DistanceMetric,
    pub candidates: Vec<Candidate>,
    pub rejection: Option<ValidationFailure>,
    pub matches: Vec<QueryResult>,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchSettings {
    pub metric: DistanceMetric,
    pub threshold: f32,
}

impl From<&crate::config::MatchingConfig> for MatchSettings {
    fn from(c: &crate::config::MatchingConfig) -> Self {
        Self {
            metric: c.distance_metric,
            threshold: c.threshold,
        }
    }
}

pub struct MatchingEngine {
    repository: Arc<dyn FaceRepository>,
    settings: MatchSettings,
}

impl MatchingEngine {
    pub fn new(repository: Arc<dyn FaceRepository>, settings: MatchSettings) -> Self {
        Self {
            repository,
            settings,
        }
    }

    pub fn settings(&self) -> MatchSettings {
        self.settings
    }

    pub fn repository(&self) -> &Arc<dyn FaceRepository> {
        &self.repository
    }

    /// Find indexed photos showing the single person in `image`.
    pub fn search(
        &self,
        extractor: &mut dyn FaceExtractor,
        image: &[u8],
        limit: usize,
    ) -> Result<SearchOutcome, SearchError> {
        if limit == 0 {
            return Err(SearchError::InvalidLimit);
        }
        let embedding = match self.query_embedding(extractor, image)? {
            Ok(embedding) => embedding,
            Err(failure) => {
                tracing::info!(reason = failure.code(), "query photo rejected");
                return Ok(SearchOutcome::Rejected(failure));
            }
        };
        let matches = self.search_embedding(&embedding, limit)?;
        tracing::info!(limit, matches = matches.len(), "search finished");
        Ok(SearchOutcome::Matches(matches))
    }

    /// Rank indexed photos against an already validated embedding.
    pub fn search_embedding(
        &self,
        embedding: &Embedding,
        limit: usize,
    ) -> Result<Vec<QueryResult>, SearchError> {
        if limit == 0 {
            return Err(SearchError::InvalidLimit);
        }
        let neighbors = self
            .repository
            .nearest(embedding, limit, self.settings.metric)?;
        let considered = neighbors.len();

        let mut results: Vec<QueryResult> = neighbors
            .into_iter()
            .filter(|n| n.distance <= self.settings.threshold)
            .map(|n| QueryResult::from_distance(n.image_path, n.distance))
            .collect();
        results.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.image_path.cmp(&b.image_path))
        });
        results.truncate(limit);

        tracing::debug!(
            considered,
            accepted = results.len(),
            threshold = self.settings.threshold,
            "ranked neighbors"
        );
        Ok(results)
    }

    /// Run a search and report every candidate with its verdict.
    pub fn trace(
        &self,
        extractor: &mut dyn FaceExtractor,
        image: &[u8],
        limit: usize,
    ) -> Result<SearchTrace, SearchError> {
        if limit == 0 {
            return Err(SearchError::InvalidLimit);
        }
        self.check_provenance(extractor)?;
        let outcome = validator::validate(extractor.extract(image)?)?;
        let mut trace = SearchTrace {
            faces_detected: outcome.face_count(),
            indexed_faces: self.repository.count()?,
            threshold: self.settings.threshold,
            metric: self.settings.metric,
            candidates: Vec::new(),
            rejection: None,
            matches: Vec::new(),
        };

        let face = match outcome.into_single() {
            Ok(face) => face,
            Err(failure) => {
                trace.rejection = Some(failure);
                return Ok(trace);
            }
        };

        trace.candidates = self
            .repository
            .nearest(&face.embedding, limit, self.settings.metric)?
            .into_iter()
            .map(|n| Candidate {
                accepted: n.distance <= self.settings.threshold,
                confidence: (1.0 - n.distance).max(0.0),
                distance: n.distance,
                image_path: n.image_path,
            })
            .collect();
        trace.matches = trace
            .candidates
            .iter()
            .filter(|c| c.accepted)
            .map(|c| QueryResult::from_distance(c.image_path.clone(), c.distance))
            .collect();
        Ok(trace)
    }

    /// Extract and validate the query face.
    ///
    /// The outer `Result` carries infrastructure errors, the inner one the
    /// single-face verdict.
    pub fn query_embedding(
        &self,
        extractor: &mut dyn FaceExtractor,
        image: &[u8],
    ) -> Result<Result<Embedding, ValidationFailure>, SearchError> {
        self.check_provenance(extractor)?;
        let outcome = validator::validate(extractor.extract(image)?)?;
        Ok(outcome.into_single().map(|face| face.embedding))
    }

    fn check_provenance(&self, extractor: &dyn FaceExtractor) -> Result<(), SearchError> {
        let Some(index) = self.repository.provenance()? else {
            return Ok(());
        };
        if index.embedding_model != extractor.embedding_model()
            || index.detector_backend != extractor.detector_backend()
        {
            return Err(SearchError::ModelMismatch {
                query: format!("{}/{}", extractor.embedding_model(), extractor.detector_backend()),
                index: format!("{}/{}", index.embedding_model, index.detector_backend),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ScriptedExtractor;
    use crate::repository::MemoryRepository;
    use crate::types::{NewFaceRecord, OverwritePolicy};

    const MODEL: &str = "w600k_r50";
    const DETECTOR: &str = "scrfd_10g";

    /// Unit vector at `angle` radians; cosine distance between two such
    /// vectors is 1 - cos(delta).
    fn at_angle(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    /// Angle whose cosine distance from 0 rad equals `d`.
    fn angle_for_distance(d: f32) -> f32 {
        (1.0 - d).acos()
    }

    fn seed(repo: &MemoryRepository, path: &str, values: Vec<f32>) {
        repo.insert_or_update(
            NewFaceRecord {
                image_path: path.to_string(),
                embedding: Embedding::new(values),
                embedding_model: MODEL.into(),
                detector_backend: DETECTOR.into(),
                distance_metric: DistanceMetric::Cosine,
                content_hash: path.to_string(),
            },
            OverwritePolicy::Reject,
        )
        .unwrap();
    }

    fn engine(repo: Arc<MemoryRepository>, threshold: f32) -> MatchingEngine {
        MatchingEngine::new(
            repo,
            MatchSettings {
                metric: DistanceMetric::Cosine,
                threshold,
            },
        )
    }

    #[test]
    fn test_end_to_end_two_close_faces() {
        let repo = Arc::new(MemoryRepository::new());
        seed(&repo, "a.jpg", at_angle(0.0));
        seed(&repo, "b.jpg", at_angle(angle_for_distance(0.10)));

        let mut extractor =
            ScriptedExtractor::new(MODEL, DETECTOR).with_image(b"query", vec![at_angle(0.0)]);
        let outcome = engine(repo, 0.40).search(&mut extractor, b"query", 2).unwrap();

        let matches = outcome.matches().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].image_path, "a.jpg");
        assert!((matches[0].confidence - 1.0).abs() < 1e-4);
        assert_eq!(matches[1].image_path, "b.jpg");
        assert!((matches[1].confidence - 0.90).abs() < 1e-3);
        assert!((matches[1].distance - 0.10).abs() < 1e-3);
    }

    #[test]
    fn test_threshold_excludes_and_shrinks_monotonically() {
        let repo = Arc::new(MemoryRepository::new());
        for (i, d) in [0.05f32, 0.2, 0.35, 0.5, 0.8].iter().enumerate() {
            seed(&repo, &format!("p{i}.jpg"), at_angle(angle_for_distance(*d)));
        }
        let mut extractor =
            ScriptedExtractor::new(MODEL, DETECTOR).with_image(b"q", vec![at_angle(0.0)]);

        let mut previous = usize::MAX;
        for threshold in [0.9f32, 0.40, 0.3, 0.1, 0.0] {
            let outcome = engine(repo.clone(), threshold)
                .search(&mut extractor, b"q", 10)
                .unwrap();
            let matches = outcome.matches().unwrap().to_vec();
            assert!(matches.iter().all(|m| m.distance <= threshold));
            assert!(matches.len() <= previous);
            previous = matches.len();
        }
        // Default threshold keeps only the three closest.
        let outcome = engine(repo, 0.40).search(&mut extractor, b"q", 10).unwrap();
        assert_eq!(outcome.matches().unwrap().len(), 3);
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let repo = Arc::new(MemoryRepository::new());
        seed(&repo, "far.jpg", at_angle(std::f32::consts::FRAC_PI_2));
        let mut extractor =
            ScriptedExtractor::new(MODEL, DETECTOR).with_image(b"q", vec![at_angle(0.0)]);

        let outcome = engine(repo, 0.40).search(&mut extractor, b"q", 5).unwrap();
        assert_eq!(outcome, SearchOutcome::Matches(vec![]));
    }

    #[test]
    fn test_limit_larger_than_repository() {
        let repo = Arc::new(MemoryRepository::new());
        seed(&repo, "c.jpg", at_angle(0.3));
        seed(&repo, "a.jpg", at_angle(0.1));
        seed(&repo, "b.jpg", at_angle(0.2));
        let mut extractor =
            ScriptedExtractor::new(MODEL, DETECTOR).with_image(b"q", vec![at_angle(0.0)]);

        let outcome = engine(repo, 1.0).search(&mut extractor, b"q", 50).unwrap();
        let paths: Vec<_> = outcome
            .matches()
            .unwrap()
            .iter()
            .map(|m| m.image_path.clone())
            .collect();
        assert_eq!(paths, vec!["a.jpg", "b.jpg", "c.jpg"]);
    }

    #[test]
    fn test_rejections_are_outcomes() {
        let repo = Arc::new(MemoryRepository::new());
        seed(&repo, "a.jpg", at_angle(0.0));
        let mut extractor = ScriptedExtractor::new(MODEL, DETECTOR)
            .with_image(b"nobody", vec![])
            .with_image(b"pair", vec![at_angle(0.0), at_angle(1.0)]);
        let engine = engine(repo, 0.40);

        assert_eq!(
            engine.search(&mut extractor, b"nobody", 5).unwrap(),
            SearchOutcome::Rejected(ValidationFailure::NoFaceDetected)
        );
        assert_eq!(
            engine.search(&mut extractor, b"pair", 5).unwrap(),
            SearchOutcome::Rejected(ValidationFailure::MultipleFacesDetected { count: 2 })
        );
    }

    #[test]
    fn test_unreadable_query_is_error() {
        let repo = Arc::new(MemoryRepository::new());
        let mut extractor = ScriptedExtractor::new(MODEL, DETECTOR);
        let err = engine(repo, 0.40).search(&mut extractor, b"junk", 5).unwrap_err();
        assert!(matches!(err, SearchError::Extraction(ExtractionError::Decode(_))));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let repo = Arc::new(MemoryRepository::new());
        let mut extractor =
            ScriptedExtractor::new(MODEL, DETECTOR).with_image(b"q", vec![at_angle(0.0)]);
        let err = engine(repo, 0.40).search(&mut extractor, b"q", 0).unwrap_err();
        assert!(matches!(err, SearchError::InvalidLimit));
    }

    #[test]
    fn test_model_mismatch_rejected() {
        let repo = Arc::new(MemoryRepository::new());
        seed(&repo, "a.jpg", at_angle(0.0));
        let mut extractor =
            ScriptedExtractor::new("facenet512", DETECTOR).with_image(b"q", vec![at_angle(0.0)]);
        let err = engine(repo, 0.40).search(&mut extractor, b"q", 5).unwrap_err();
        assert!(matches!(err, SearchError::ModelMismatch { .. }));
    }

    #[test]
    fn test_trace_marks_rejected_candidates() {
        let repo = Arc::new(MemoryRepository::new());
        seed(&repo, "near.jpg", at_angle(angle_for_distance(0.1)));
        seed(&repo, "far.jpg", at_angle(angle_for_distance(0.7)));
        let mut extractor =
            ScriptedExtractor::new(MODEL, DETECTOR).with_image(b"q", vec![at_angle(0.0)]);

        let trace = engine(repo, 0.40).trace(&mut extractor, b"q", 10).unwrap();
        assert_eq!(trace.faces_detected, 1);
        assert_eq!(trace.indexed_faces, 2);
        assert_eq!(trace.candidates.len(), 2);
        assert!(trace.candidates[0].accepted);
        assert!(!trace.candidates[1].accepted);
        assert_eq!(trace.matches.len(), 1);
        assert_eq!(trace.matches[0].image_path, "near.jpg");
    }
}
