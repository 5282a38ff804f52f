//! Face analysis seam: detection plus encoding extraction.
//!
//! The recognition engine only sees [`FaceAnalyzer`]. The production
//! implementation is [`OnnxAnalyzer`] (SCRFD detector + ArcFace encoder).

use crate::detector::FaceDetector;
use crate::recognizer::FaceRecognizer;
use crate::types::{Encoding, FaceRegion};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region is empty after clamping to the frame")]
    EmptyRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detects faces and extracts encodings from grayscale images.
///
/// Implementations are assumed deterministic for identical pixel input.
pub trait FaceAnalyzer: Send {
    /// Detect all faces in `image`, in detector output order.
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, AnalyzerError>;

    /// Extract an encoding for one detected `region` of `image`.
    fn encode(&mut self, image: &GrayImage, region: &FaceRegion)
        -> Result<Encoding, AnalyzerError>;
}

/// ONNX Runtime analyzer: SCRFD for detection, ArcFace for encodings.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, AnalyzerError> {
        self.detector.detect(image)
    }

    fn encode(
        &mut self,
        image: &GrayImage,
        region: &FaceRegion,
    ) -> Result<Encoding, AnalyzerError> {
        self.recognizer.extract(image, region)
    }
}
