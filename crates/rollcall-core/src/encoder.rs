//! Image → face encodings.
//!
//! [`FaceEncoder`] is the seam between pixel work and matching: the engine
//! only sees located regions and their embeddings, so the detector and
//! recognizer can be swapped or stubbed without touching matching logic.

use crate::detector::{DetectorConfig, DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// One localized face and its feature vector.
#[derive(Debug, Clone)]
pub struct FaceEncoding {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// Strategy that turns a probe image into zero or more face encodings.
///
/// An empty result means no face was found; that is not an error.
pub trait FaceEncoder: Send {
    fn encode(&mut self, image: &GrayImage) -> Result<Vec<FaceEncoding>, EncoderError>;
}

/// SCRFD detection + ArcFace embedding.
pub struct OnnxEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    max_faces: usize,
}

impl OnnxEncoder {
    pub const DETECTOR_FILE: &'static str = "det_10g.onnx";
    pub const RECOGNIZER_FILE: &'static str = "w600k_r50.onnx";

    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, detector: DetectorConfig, max_faces: usize) -> Result<Self, EncoderError> {
        let scrfd = model_dir.join(Self::DETECTOR_FILE);
        let arcface = model_dir.join(Self::RECOGNIZER_FILE);

        let detector = FaceDetector::load(&scrfd.to_string_lossy(), detector)?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;

        Ok(Self { detector, recognizer, max_faces })
    }
}

impl FaceEncoder for OnnxEncoder {
    fn encode(&mut self, image: &GrayImage) -> Result<Vec<FaceEncoding>, EncoderError> {
        let faces = self.detector.detect(image)?;
        if faces.len() > self.max_faces {
            tracing::debug!(found = faces.len(), kept = self.max_faces, "truncating detections");
        }

        let mut encodings = Vec::with_capacity(faces.len().min(self.max_faces));
        for face in faces.into_iter().take(self.max_faces) {
            // SCRFD always emits landmarks; a box without them cannot be aligned.
            if face.landmarks.is_none() {
                tracing::debug!(confidence = face.confidence, "skipping face without landmarks");
                continue;
            }
            let embedding = self.recognizer.extract(image, &face)?;
            encodings.push(FaceEncoding { region: face, embedding });
        }

        Ok(encodings)
    }
}
