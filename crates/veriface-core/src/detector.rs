//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the InsightFace SCRFD model on RGB frames: the frame is scaled to fit
//! the 640×640 input (anchored at the top-left corner, remainder padded),
//! decoded per stride from distance-to-edge regressions, then reduced with NMS.

use crate::extractor::{Detector, ExtractError};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Default minimum detection score.
pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty frame")]
    EmptyFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    confidence_threshold: f32,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            confidence_threshold,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            confidence_threshold,
            stride_outputs: stride_outputs(&output_names),
        })
    }

    fn run(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(DetectorError::EmptyFrame);
        }

        let (input, scale) = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, distances) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                distances,
                stride,
                scale,
                self.confidence_threshold,
            ));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

impl Detector for ScrfdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, ExtractError> {
        Ok(self.run(frame)?)
    }
}

/// Map each stride to its (score, bbox) outputs.
///
/// Exports named `score_8`, `bbox_8`, ... are matched by name; anything else
/// uses the standard ordering of scores at [0-2] and boxes at [3-5].
fn stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = [(0, 0); 3];
    for (i, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => named[i] = (s, b),
            _ => {
                tracing::info!(?names, "SCRFD: unnamed outputs, using positional mapping");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    named
}

/// Scale the frame into the top-left of a padded 640×640 NCHW tensor.
///
/// Returns the tensor and the frame→input scale factor.
fn preprocess(frame: &RgbImage) -> (Array4<f32>, f32) {
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / frame.width() as f32).min(size / frame.height() as f32);
    let new_w = ((frame.width() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((frame.height() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let side = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, scale)
}

/// Decode one stride's anchors into frame-space boxes above `threshold`.
fn decode_stride(
    scores: &[f32],
    distances: &[f32],
    stride: usize,
    scale: f32,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .take(grid * grid * SCRFD_ANCHORS_PER_CELL)
        .enumerate()
        .filter(|(_, score)| **score > threshold)
        .filter_map(|(idx, &score)| {
            let d = distances.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let x1 = (cx - d[0] * step) / scale;
            let y1 = (cy - d[1] * step) / scale;
            let x2 = (cx + d[2] * step) / scale;
            let y2 = (cy + d[3] * step) / scale;

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; returns survivors by descending confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf }
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        let b = make_bbox(200.0, 200.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let result = nms(
            vec![
                make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
                make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_maps_back_to_frame() {
        let stride = 32;
        let grid = SCRFD_INPUT_SIZE as usize / stride;
        let mut scores = vec![0.0; grid * grid * SCRFD_ANCHORS_PER_CELL];
        let mut distances = vec![0.0; scores.len() * 4];

        // Second anchor of cell (x=2, y=1).
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL + 1;
        scores[idx] = 0.95;
        distances[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let boxes = decode_stride(&scores, &distances, stride, 2.0, 0.5);
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        // Anchor centre (64, 32) in input space, ±32 on each side, halved.
        assert!((b.x - 16.0).abs() < 1e-4);
        assert!((b.y - 0.0).abs() < 1e-4);
        assert!((b.width - 32.0).abs() < 1e-4);
        assert!((b.height - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_pads_right_and_bottom() {
        let frame = RgbImage::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, scale) = preprocess(&frame);
        assert!((scale - 2.0).abs() < 1e-6);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        let white = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 10, 10]] - white).abs() < 1e-3);
        assert_eq!(tensor[[0, 0, 400, 10]], 0.0);
    }

    #[test]
    fn test_stride_outputs_named_and_positional() {
        let named: Vec<String> = [
            "bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(stride_outputs(&named), [(1, 0), (3, 2), (5, 4)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(stride_outputs(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }
}
