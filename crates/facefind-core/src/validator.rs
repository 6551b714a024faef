//! Single-face validation.
//!
//! Every image used as a query or stored in the index must contain exactly
//! one detected face. This is the one place that rule is enforced.

use crate::extractor::{ExtractionError, FaceStream};
use crate::types::DetectedFace;
use serde::Serialize;
use thiserror::Error;

/// Face count of one image.
#[derive(Debug, Clone)]
pub enum DetectionOutcome {
    Zero,
    One(DetectedFace),
    Many(usize),
}

/// Why an image was refused by the single-face check.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationFailure {
    #[error("no face detected; use a photo with one clear face")]
    NoFaceDetected,
    #[error("multiple faces ({count}) detected; use a photo with one face")]
    MultipleFacesDetected { count: usize },
}

impl ValidationFailure {
    /// Stable machine-readable code for transports.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationFailure::NoFaceDetected => "no_face",
            ValidationFailure::MultipleFacesDetected { .. } => "multiple_faces",
        }
    }
}

impl DetectionOutcome {
    pub fn face_count(&self) -> usize {
        match self {
            DetectionOutcome::Zero => 0,
            DetectionOutcome::One(_) => 1,
            DetectionOutcome::Many(n) => *n,
        }
    }

    pub fn into_single(self) -> Result<DetectedFace, ValidationFailure> {
        match self {
            DetectionOutcome::One(face) => Ok(face),
            DetectionOutcome::Zero => Err(ValidationFailure::NoFaceDetected),
            DetectionOutcome::Many(count) => Err(ValidationFailure::MultipleFacesDetected { count }),
        }
    }
}

/// Classify a face stream. Only a lone face has its embedding computed.
pub fn validate(mut faces: FaceStream<'_>) -> Result<DetectionOutcome, ExtractionError> {
    match faces.len() {
        0 => Ok(DetectionOutcome::Zero),
        1 => match faces.next() {
            Some(face) => Ok(DetectionOutcome::One(face?)),
            None => Ok(DetectionOutcome::Zero),
        },
        n => Ok(DetectionOutcome::Many(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{FaceExtractor, ScriptedExtractor};

    fn extractor() -> ScriptedExtractor {
        ScriptedExtractor::new("m", "d")
            .with_image(b"empty", vec![])
            .with_image(b"solo", vec![vec![0.6, 0.8]])
            .with_image(b"crowd", vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.6, 0.8]])
    }

    #[test]
    fn test_zero_faces() {
        let mut ex = extractor();
        let outcome = validate(ex.extract(b"empty").unwrap()).unwrap();
        assert_eq!(outcome.face_count(), 0);
        assert_eq!(outcome.into_single().unwrap_err(), ValidationFailure::NoFaceDetected);
    }

    #[test]
    fn test_single_face() {
        let mut ex = extractor();
        let face = validate(ex.extract(b"solo").unwrap())
            .unwrap()
            .into_single()
            .unwrap();
        assert_eq!(face.embedding.values, vec![0.6, 0.8]);
    }

    #[test]
    fn test_many_faces_reports_count() {
        let mut ex = extractor();
        let outcome = validate(ex.extract(b"crowd").unwrap()).unwrap();
        assert_eq!(
            outcome.into_single().unwrap_err(),
            ValidationFailure::MultipleFacesDetected { count: 3 }
        );
    }

    #[test]
    fn test_many_faces_skips_embedding() {
        let failing: FaceStream<'_> = Box::new(
            vec![
                Err(ExtractionError::Inference("boom".into())),
                Err(ExtractionError::Inference("boom".into())),
            ]
            .into_iter(),
        );
        let outcome = validate(failing).unwrap();
        assert_eq!(outcome.face_count(), 2);
    }

    #[test]
    fn test_single_face_embedding_error_propagates() {
        let failing: FaceStream<'_> =
            Box::new(vec![Err(ExtractionError::Inference("boom".into()))].into_iter());
        assert!(validate(failing).is_err());
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(ValidationFailure::NoFaceDetected.code(), "no_face");
        assert_eq!(
            ValidationFailure::MultipleFacesDetected { count: 2 }.code(),
            "multiple_faces"
        );
    }
}
