//! Gallery matching: probe encodings against enrolled face templates.
//!
//! Every located face is scored against every template. Candidates at or
//! below the match threshold are dropped, then a greedy pass in descending
//! confidence order keeps a candidate only if neither its user nor its face
//! region (or a region overlapping it) has already been claimed. Ties go to
//! the lexicographically smaller user id so repeated runs agree.

use crate::encoder::{EncoderError, FaceEncoder, FaceEncoding};
use crate::types::{Embedding, FaceTemplate, MatchResult};
use image::GrayImage;
use thiserror::Error;

/// Default acceptance bar for a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.95;
/// Regions overlapping more than this are treated as the same face.
pub const DEFAULT_REGION_IOU_THRESHOLD: f32 = 0.4;

/// Why an enrollment image produced no template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingExtractionError {
    #[error("no face found in enrollment image")]
    NoFace,
    #[error("enrollment image is ambiguous: {0} faces found, expected exactly one")]
    MultipleFaces(usize),
    #[error("extracted encoding is empty or non-finite")]
    InvalidEncoding,
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error(transparent)]
    Extraction(#[from] EncodingExtractionError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
}

/// Scores a probe embedding against an enrolled one.
///
/// Implementations must return a value in [0, 1]; higher is more similar.
pub trait Similarity: Send + Sync {
    fn score(&self, probe: &Embedding, enrolled: &Embedding) -> f32;
}

/// Cosine similarity with negative correlation clamped to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarity;

impl Similarity for CosineSimilarity {
    fn score(&self, probe: &Embedding, enrolled: &Embedding) -> f32 {
        probe.similarity(enrolled).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Minimum confidence (exclusive) for a match to be reported.
    pub match_threshold: f32,
    /// IoU above which two regions count as the same face.
    pub region_iou_threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            region_iou_threshold: DEFAULT_REGION_IOU_THRESHOLD,
        }
    }
}

/// Encodes probes and matches them against a gallery. Holds no state
/// between calls.
pub struct MatchingEngine {
    encoder: Box<dyn FaceEncoder>,
    similarity: Box<dyn Similarity>,
    config: EngineConfig,
}

impl MatchingEngine {
    pub fn new(
        encoder: impl FaceEncoder + 'static,
        similarity: impl Similarity + 'static,
        config: EngineConfig,
    ) -> Self {
        let config = EngineConfig {
            match_threshold: unit_interval(config.match_threshold, DEFAULT_MATCH_THRESHOLD, "match_threshold"),
            region_iou_threshold: unit_interval(
                config.region_iou_threshold,
                DEFAULT_REGION_IOU_THRESHOLD,
                "region_iou_threshold",
            ),
        };
        Self {
            encoder: Box::new(encoder),
            similarity: Box::new(similarity),
            config,
        }
    }

    /// Encode an enrollment image that must contain exactly one face.
    pub fn extract_enrollment(&mut self, image: &GrayImage) -> Result<FaceEncoding, MatchError> {
        let mut encodings = self.encoder.encode(image)?;
        match encodings.len() {
            0 => Err(EncodingExtractionError::NoFace.into()),
            1 => {
                let encoding = encodings.remove(0);
                if !encoding.embedding.is_usable() {
                    return Err(EncodingExtractionError::InvalidEncoding.into());
                }
                tracing::debug!(
                    confidence = encoding.region.confidence,
                    dim = encoding.embedding.dimension(),
                    "enrollment encoding extracted"
                );
                Ok(encoding)
            }
            n => Err(EncodingExtractionError::MultipleFaces(n).into()),
        }
    }

    /// Match every face in `image` against `gallery`.
    ///
    /// Returns an empty list when the gallery is empty or no face is found.
    pub fn detect(&mut self, image: &GrayImage, gallery: &[FaceTemplate]) -> Result<Vec<MatchResult>, MatchError> {
        if gallery.is_empty() {
            return Ok(Vec::new());
        }

        let faces: Vec<FaceEncoding> = self
            .encoder
            .encode(image)?
            .into_iter()
            .filter(|f| f.embedding.is_usable())
            .collect();

        if faces.is_empty() {
            tracing::debug!("no usable face in probe");
            return Ok(Vec::new());
        }

        let results = assign_matches(&faces, gallery, self.similarity.as_ref(), &self.config);
        tracing::debug!(faces = faces.len(), gallery = gallery.len(), matches = results.len(), "probe matched");
        Ok(results)
    }
}

struct Candidate<'a> {
    face: usize,
    template: &'a FaceTemplate,
    confidence: f32,
}

fn sanitize(score: f32) -> f32 {
    if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 }
}

/// Score, threshold and suppress. Output is sorted by descending confidence,
/// then ascending user id.
pub fn assign_matches(
    faces: &[FaceEncoding],
    gallery: &[FaceTemplate],
    similarity: &dyn Similarity,
    config: &EngineConfig,
) -> Vec<MatchResult> {
    let mut candidates = Vec::new();
    for (face_idx, face) in faces.iter().enumerate() {
        for template in gallery {
            if template.encoding.dimension() != face.embedding.dimension() {
                tracing::trace!(
                    user_id = %template.user_id,
                    enrolled = template.encoding.dimension(),
                    probe = face.embedding.dimension(),
                    "skipping template with mismatched dimension"
                );
                continue;
            }
            let confidence = sanitize(similarity.score(&face.embedding, &template.encoding));
            if confidence > config.match_threshold {
                candidates.push(Candidate { face: face_idx, template, confidence });
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.template.user_id.cmp(&b.template.user_id))
            .then_with(|| a.face.cmp(&b.face))
    });

    let mut accepted: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let user_taken = accepted
            .iter()
            .any(|a| a.template.user_id == candidate.template.user_id);
        let region_taken = accepted.iter().any(|a| {
            a.face == candidate.face
                || faces[a.face].region.iou(&faces[candidate.face].region) > config.region_iou_threshold
        });
        if !user_taken && !region_taken {
            accepted.push(candidate);
        }
    }

    accepted
        .into_iter()
        .map(|c| MatchResult {
            user_id: c.template.user_id.clone(),
            user_name: c.template.user_name.clone(),
            confidence: c.confidence,
            bounding_box: Some(faces[c.face].region.clone()),
        })
        .collect()
}

/// Clamp into [0, 1]; NaN or infinite values fall back to `default`.
fn unit_interval(value: f32, default: f32, name: &'static str) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        tracing::warn!(setting = name, value = %value, default = %default, "non-finite threshold; using default");
        default
    }
}
