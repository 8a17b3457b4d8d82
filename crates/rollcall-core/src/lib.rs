//! rollcall-core — Face encoding and gallery matching.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime, behind the [`FaceEncoder`] and [`Similarity`]
//! strategies consumed by the [`MatchingEngine`].

pub mod alignment;
pub mod detector;
pub mod encoder;
pub mod matcher;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::{DetectorConfig, FaceDetector};
pub use encoder::{EncoderError, FaceEncoder, FaceEncoding, OnnxEncoder};
pub use matcher::{
    CosineSimilarity, EncodingExtractionError, EngineConfig, MatchError, MatchingEngine, Similarity,
};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, FaceTemplate, MatchResult};

/// Where ONNX models are looked up when no directory is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}
