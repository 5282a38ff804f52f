//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the frame into the 640x640 model input, decodes the three
//! stride levels (anchor-free, two anchors per cell) and applies NMS.
//! Landmarks are not used; only bounding boxes are returned.

use crate::analyzer::AnalyzerError;
use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    /// Map a point from model-input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Candidate box in frame coordinates, before NMS.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn to_region(self, width: u32, height: u32) -> FaceRegion {
        let px = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        FaceRegion {
            top: px(self.y1, height),
            right: px(self.x2, width),
            bottom: px(self.y2, height),
            left: px(self.x1, width),
        }
    }
}

/// Output tensor indices for one stride: (score, bbox).
type StrideOutputs = (usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, AnalyzerError> {
        if !model_path.exists() {
            return Err(AnalyzerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(path = %model_path.display(), outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 6 {
            return Err(AnalyzerError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            stride_outputs: map_outputs(&output_names),
        })
    }

    /// Detect faces, returning regions ordered by descending confidence.
    pub fn detect(&mut self, image: &GrayImage) -> Result<Vec<FaceRegion>, AnalyzerError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = letterbox(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                AnalyzerError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                AnalyzerError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;
            candidates.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }

        let kept = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = kept.len(), "SCRFD detection complete");

        Ok(kept
            .into_iter()
            .map(|c| c.to_region(width, height))
            .filter(|r| !r.is_empty())
            .collect())
    }
}

/// Resize `image` into the square model input, padding the short side.
///
/// Padding pixels normalize to 0.0, so the tensor starts zeroed and only
/// the resized area is written.
fn letterbox(image: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let size = SCRFD_INPUT_SIZE;
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let (ty, tx) = ((y + pad_y) as usize, (x + pad_x) as usize);
        // Grayscale replicated into all three channels.
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = value;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Pair score/bbox outputs per stride.
///
/// Named exports (`score_8`, `bbox_8`, ...) are matched by name; otherwise
/// the standard positional layout is assumed: [0-2] scores, [3-5] bboxes.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut mapped = [(0, 3), (1, 4), (2, 5)];
    for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => mapped[pos] = (s, b),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    mapped
}

/// Decode candidates above the confidence threshold for one stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<Candidate> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let grid_h = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let offsets = bboxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * step, cy - offsets[1] * step);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * step, cy + offsets[3] * step);
            Some(Candidate { x1, y1, x2, y2, score })
        })
        .collect()
}

/// Non-maximum suppression, highest score first.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter = Candidate {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    }
    .area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate { x1: x, y1: y, x2: x + w, y2: y + h, score }
    }

    #[test]
    fn test_iou_identical() {
        let a = cand(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = cand(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = cand(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlap() {
        let kept = nms(
            vec![
                cand(5.0, 5.0, 100.0, 100.0, 0.8),
                cand(0.0, 0.0, 100.0, 100.0, 0.9),
                cand(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape_pads_vertically() {
        let image = GrayImage::from_pixel(320, 240, image::Luma([200]));
        let (tensor, lb) = letterbox(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        // Padding normalizes to zero, image area does not.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 1, 320, 320]];
        assert!((inside - (200.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let (x, y) = lb.unmap(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4);
        assert!((y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_single_anchor() {
        let stride = 32;
        let cells = (640 / stride) * (640 / stride) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut bboxes = vec![0.0f32; cells * 4];
        // Anchor 2 -> cell 1 -> centre (32, 0) in input space.
        scores[2] = 0.9;
        bboxes[8..12].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);

        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let found = decode_stride(&scores, &bboxes, stride, &lb);
        assert_eq!(found.len(), 1);
        let c = found[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (16.0, 0.0, 48.0, 32.0));
    }

    #[test]
    fn test_candidate_to_region_clamps() {
        let c = Candidate { x1: -5.0, y1: 10.4, x2: 700.0, y2: 99.6, score: 0.9 };
        assert_eq!(
            c.to_region(640, 480),
            FaceRegion { top: 10, right: 640, bottom: 100, left: 0 }
        );
    }

    #[test]
    fn test_map_outputs_named_and_positional() {
        let named: Vec<String> = [
            "bbox_8", "score_8", "kps_8", "bbox_16", "score_16", "kps_16", "bbox_32",
            "score_32", "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_outputs(&named), [(1, 0), (4, 3), (7, 6)]);

        let generic: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(map_outputs(&generic), [(0, 3), (1, 4), (2, 5)]);
    }
}
