//! Recognition engine: detection → largest face → encoding → best match.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::store::IdentityStore;
use crate::types::{Encoding, FaceRegion};
use image::GrayImage;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// Default maximum cosine distance for a match (lower = stricter).
///
/// Equivalent to accepting a cosine similarity above 0.4.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected")]
    NoFace,
    #[error("face detected but encoding extraction failed: {0}")]
    Encoding(AnalyzerError),
    #[error("face detected but the extracted encoding is unusable")]
    InvalidEncoding,
    #[error("detection failed: {0}")]
    Detection(AnalyzerError),
    #[error("failed to read image: {0}")]
    Image(#[from] image::ImageError),
}

/// What the engine concluded about the selected face.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Closest identity is within the confidence threshold.
    Matched { name: String, distance: f32 },
    /// Encoding extracted but no identity is close enough.
    Unknown,
    /// A face (or frame) needs a decision but no usable encoding exists.
    Unidentifiable,
}

/// Result of one recognition cycle on a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub region: FaceRegion,
    pub outcome: Outcome,
}

/// Wraps the face analyzer and applies the best-match policy.
///
/// The analyzer is behind a mutex: ONNX sessions need exclusive access, and
/// both the capture loop and the approval workflow run detection.
pub struct RecognitionEngine {
    analyzer: Mutex<Box<dyn FaceAnalyzer>>,
    store: Arc<IdentityStore>,
    threshold: f32,
}

impl RecognitionEngine {
    pub fn new(analyzer: Box<dyn FaceAnalyzer>, store: Arc<IdentityStore>, threshold: f32) -> Self {
        Self {
            analyzer: Mutex::new(analyzer),
            store,
            threshold,
        }
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Run one recognition cycle.
    ///
    /// Returns `None` when no face is found. A detector failure is reported
    /// as an unidentifiable full-frame region so it still reaches a human.
    pub fn process(&self, image: &GrayImage) -> Option<Recognition> {
        let (width, height) = image.dimensions();
        let mut analyzer = self.analyzer();

        let regions = match analyzer.detect(image) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; routing frame for approval");
                return Some(Recognition {
                    region: FaceRegion::full_frame(width, height),
                    outcome: Outcome::Unidentifiable,
                });
            }
        };

        let region = largest_region(&regions)?;
        tracing::debug!(faces = regions.len(), area = region.area(), "largest face selected");

        let encoding = match analyzer.encode(image, &region) {
            Ok(encoding) if encoding.is_valid() => encoding,
            Ok(encoding) => {
                tracing::warn!(dim = encoding.len(), "face detected but encoding is empty or malformed");
                return Some(Recognition {
                    region,
                    outcome: Outcome::Unidentifiable,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "face detected but encoding extraction failed");
                return Some(Recognition {
                    region,
                    outcome: Outcome::Unidentifiable,
                });
            }
        };
        drop(analyzer);

        let outcome = match self.store.best_match(&encoding, self.threshold) {
            Some(m) => Outcome::Matched {
                name: m.name,
                distance: m.distance,
            },
            None => Outcome::Unknown,
        };
        Some(Recognition { region, outcome })
    }

    /// Detect the largest face in `image` and extract its encoding.
    pub fn encode_largest(&self, image: &GrayImage) -> Result<(FaceRegion, Encoding), EngineError> {
        let mut analyzer = self.analyzer();
        let regions = analyzer.detect(image).map_err(EngineError::Detection)?;
        let region = largest_region(&regions).ok_or(EngineError::NoFace)?;
        let encoding = analyzer
            .encode(image, &region)
            .map_err(EngineError::Encoding)?;
        if !encoding.is_valid() {
            return Err(EngineError::InvalidEncoding);
        }
        Ok((region, encoding))
    }

    /// Detect faces without encoding (diagnostics).
    pub fn detect(&self, image: &GrayImage) -> Result<Vec<FaceRegion>, AnalyzerError> {
        self.analyzer().detect(image)
    }

    fn analyzer(&self) -> MutexGuard<'_, Box<dyn FaceAnalyzer>> {
        self.analyzer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Largest region by area; ties keep the detector's earlier region.
pub fn largest_region(regions: &[FaceRegion]) -> Option<FaceRegion> {
    regions.iter().fold(None, |best: Option<FaceRegion>, r| match best {
        Some(b) if b.area() >= r.area() => Some(b),
        _ => Some(*r),
    })
}
