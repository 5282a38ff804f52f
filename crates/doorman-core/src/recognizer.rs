//! ArcFace face recognizer via ONNX Runtime.
//!
//! Crops the detected region, resizes it to the 112x112 model input and
//! extracts an L2-normalized 512-dimensional encoding (w600k_r50).

use crate::analyzer::AnalyzerError;
use crate::types::{Encoding, FaceRegion};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, AnalyzerError> {
        if !model_path.exists() {
            return Err(AnalyzerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Extract the encoding of `region` within `image`.
    pub fn extract(
        &mut self,
        image: &GrayImage,
        region: &FaceRegion,
    ) -> Result<Encoding, AnalyzerError> {
        let input = preprocess(image, region)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AnalyzerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(AnalyzerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Encoding::new(l2_normalize(raw)))
    }
}

/// Crop `region`, resize to the model input and normalize into NCHW.
fn preprocess(image: &GrayImage, region: &FaceRegion) -> Result<Array4<f32>, AnalyzerError> {
    let (width, height) = image.dimensions();
    let region = region.clamp_to(width, height);
    if region.is_empty() {
        return Err(AnalyzerError::EmptyRegion);
    }

    let crop = imageops::crop_imm(image, region.left, region.top, region.width(), region.height())
        .to_image();
    let face = imageops::resize(&crop, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);

    let side = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in face.enumerate_pixels() {
        let value = (pixel[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = value;
        }
    }
    Ok(tensor)
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
