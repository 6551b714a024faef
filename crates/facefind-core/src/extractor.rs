//! Embedding extractor adapter.
//!
//! [`FaceExtractor`] is the seam between the matching core and whatever
//! produces face embeddings. The ONNX implementation chains SCRFD detection
//! and ArcFace recognition; [`ScriptedExtractor`] replays precomputed faces.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, DetectedFace, Embedding};
use image::imageops::FilterType;
use image::RgbImage;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("cannot decode image: {0}")]
    Decode(String),
    #[error("face model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("embedding inference failed: {0}")]
    Inference(String),
}

impl From<DetectorError> for ExtractionError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::ModelNotFound(path) => ExtractionError::ModelUnavailable(path),
            other => ExtractionError::Inference(other.to_string()),
        }
    }
}

impl From<RecognizerError> for ExtractionError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::ModelNotFound(path) => ExtractionError::ModelUnavailable(path),
            other => ExtractionError::Inference(other.to_string()),
        }
    }
}

/// Faces found in one image, highest detector confidence first.
///
/// The length is known as soon as detection has run; each embedding is
/// computed when its item is pulled. The stream owns the decoded image, so
/// dropping it releases the buffer.
pub type FaceStream<'a> =
    Box<dyn ExactSizeIterator<Item = Result<DetectedFace, ExtractionError>> + 'a>;

/// Source of face detections and embeddings.
pub trait FaceExtractor {
    /// Name of the embedding model, recorded with every stored vector.
    fn embedding_model(&self) -> &str;

    /// Name of the face detector, recorded with every stored vector.
    fn detector_backend(&self) -> &str;

    /// Detect faces in encoded image bytes.
    fn extract<'a>(&'a mut self, image: &[u8]) -> Result<FaceStream<'a>, ExtractionError>;
}

impl<T: FaceExtractor + ?Sized> FaceExtractor for Box<T> {
    fn embedding_model(&self) -> &str {
        (**self).embedding_model()
    }

    fn detector_backend(&self) -> &str {
        (**self).detector_backend()
    }

    fn extract<'a>(&'a mut self, image: &[u8]) -> Result<FaceStream<'a>, ExtractionError> {
        (**self).extract(image)
    }
}

/// Decode image bytes into 8-bit RGB, shrinking so the longest side is at
/// most `max_dimension`.
pub fn decode_image(bytes: &[u8], max_dimension: u32) -> Result<RgbImage, ExtractionError> {
    let mut decoded =
        image::load_from_memory(bytes).map_err(|e| ExtractionError::Decode(e.to_string()))?;
    if max_dimension > 0 && decoded.width().max(decoded.height()) > max_dimension {
        decoded = decoded.resize(max_dimension, max_dimension, FilterType::Triangle);
    }
    Ok(decoded.to_rgb8())
}

/// SCRFD + ArcFace extractor running on ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    embedding_model: String,
    detector_backend: String,
    max_dimension: u32,
}

impl OnnxExtractor {
    pub fn load(
        detector_path: &Path,
        recognizer_path: &Path,
        embedding_model: &str,
        detector_backend: &str,
        max_dimension: u32,
    ) -> Result<Self, ExtractionError> {
        let detector = FaceDetector::load(detector_path, crate::detector::DEFAULT_SCORE_THRESHOLD)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self {
            detector,
            recognizer,
            embedding_model: embedding_model.to_string(),
            detector_backend: detector_backend.to_string(),
            max_dimension,
        })
    }

    /// Load both models as named by the configuration.
    pub fn from_config(config: &crate::config::ModelConfig) -> Result<Self, ExtractionError> {
        Self::load(
            &config.detector_path(),
            &config.recognizer_path(),
            &config.embedding_model,
            &config.detector_backend,
            config.max_image_dimension,
        )
    }
}

impl FaceExtractor for OnnxExtractor {
    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    fn detector_backend(&self) -> &str {
        &self.detector_backend
    }

    fn extract<'a>(&'a mut self, image: &[u8]) -> Result<FaceStream<'a>, ExtractionError> {
        let photo = decode_image(image, self.max_dimension)?;
        let boxes = self.detector.detect(&photo)?;
        tracing::debug!(
            width = photo.width(),
            height = photo.height(),
            faces = boxes.len(),
            "detection finished"
        );

        let recognizer = &mut self.recognizer;
        Ok(Box::new(boxes.into_iter().map(
            move |bbox| -> Result<DetectedFace, ExtractionError> {
                let embedding = recognizer.embed(&photo, &bbox)?;
                Ok(DetectedFace { bbox, embedding })
            },
        )))
    }
}

/// Extractor that replays precomputed faces keyed by exact image bytes.
///
/// Unknown bytes fail with [`ExtractionError::Decode`], like an unreadable
/// file would. Used to drive the engine without ONNX models.
#[derive(Debug, Clone)]
pub struct ScriptedExtractor {
    embedding_model: String,
    detector_backend: String,
    faces: HashMap<Vec<u8>, Vec<DetectedFace>>,
}

impl ScriptedExtractor {
    pub fn new(embedding_model: &str, detector_backend: &str) -> Self {
        Self {
            embedding_model: embedding_model.to_string(),
            detector_backend: detector_backend.to_string(),
            faces: HashMap::new(),
        }
    }

    /// Register the faces an image contains, one embedding per face.
    pub fn with_image(mut self, image: &[u8], embeddings: Vec<Vec<f32>>) -> Self {
        let count = embeddings.len();
        let faces = embeddings
            .into_iter()
            .enumerate()
            .map(|(i, values)| DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    // Decreasing so the stream is in confidence order.
                    confidence: 1.0 - i as f32 / (count as f32 + 1.0),
                    landmarks: None,
                },
                embedding: Embedding::new(values),
            })
            .collect();
        self.faces.insert(image.to_vec(), faces);
        self
    }
}

impl FaceExtractor for ScriptedExtractor {
    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    fn detector_backend(&self) -> &str {
        &self.detector_backend
    }

    fn extract<'a>(&'a mut self, image: &[u8]) -> Result<FaceStream<'a>, ExtractionError> {
        let faces = self
            .faces
            .get(image)
            .cloned()
            .ok_or_else(|| ExtractionError::Decode("unrecognized image bytes".into()))?;
        Ok(Box::new(faces.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma, Rgb};
    use std::io::Cursor;

    #[test]
    fn test_decode_image_rejects_garbage() {
        let err = decode_image(b"definitely not an image", 1920).unwrap_err();
        assert!(matches!(err, ExtractionError::Decode(_)));
    }

    #[test]
    fn test_decode_image_downscales_large_photo() {
        let big = GrayImage::from_pixel(3000, 2000, Luma([90]));
        let mut png = Vec::new();
        big.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();

        let photo = decode_image(&png, 1920).unwrap();
        assert_eq!(photo.width(), 1920);
        assert_eq!(photo.height(), 1280);
    }

    #[test]
    fn test_decode_image_keeps_small_photo() {
        let small = GrayImage::from_pixel(100, 80, Luma([10]));
        let mut png = Vec::new();
        small.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();

        let photo = decode_image(&png, 1920).unwrap();
        assert_eq!(photo.dimensions(), (100, 80));
        assert_eq!(photo.get_pixel(0, 0).0, [10, 10, 10]);
    }

    #[test]
    fn test_decode_image_keeps_colour() {
        let red = RgbImage::from_pixel(40, 30, Rgb([220, 30, 10]));
        let mut png = Vec::new();
        red.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();

        let photo = decode_image(&png, 1920).unwrap();
        assert_eq!(photo.get_pixel(5, 5).0, [220, 30, 10]);
    }

    #[test]
    fn test_scripted_extractor_replays_in_order() {
        let mut extractor = ScriptedExtractor::new("m", "d")
            .with_image(b"two", vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

        let stream = extractor.extract(b"two").unwrap();
        assert_eq!(stream.len(), 2);
        let faces: Vec<_> = stream.map(|f| f.unwrap()).collect();
        assert!(faces[0].detector_confidence() > faces[1].detector_confidence());
        assert_eq!(faces[0].embedding.values, vec![1.0, 0.0]);
    }

    #[test]
    fn test_scripted_extractor_unknown_bytes() {
        let mut extractor = ScriptedExtractor::new("m", "d");
        assert!(matches!(extractor.extract(b"?"), Err(ExtractionError::Decode(_))));
    }

    #[test]
    fn test_model_not_found_maps_to_unavailable() {
        let err: ExtractionError = DetectorError::ModelNotFound("det.onnx".into()).into();
        assert_eq!(err, ExtractionError::ModelUnavailable("det.onnx".into()));
    }
}
