//! ArcFace face recognizer via ONNX Runtime.
//!
//! Turns a cropped face into an L2-normalized 512-dimensional embedding
//! using the w600k_r50 ArcFace model.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based embedding extractor for face crops.
pub struct ArcFaceRecognizer {
    session: Session,
}

impl ArcFaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Embed a cropped face. The crop is resized to 112×112 regardless of aspect.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        if raw.iter().any(|v| !v.is_finite()) {
            return Err(RecognizerError::InferenceFailed(
                "embedding contains non-finite values".into(),
            ));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(face, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let face = RgbImage::from_pixel(60, 80, image::Rgb([255, 127, 0]));
        let tensor = preprocess(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-3);
        assert!((tensor[[0, 1, 5, 5]] - (127.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-3);
        assert!((tensor[[0, 2, 5, 5]] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
