//! Capabilities consumed by the pipelines: embedding extraction and detection.
//!
//! Callers construct one implementation up front and pass it in by `&mut`;
//! nothing in this crate holds a model globally.

use crate::detector::{DetectorError, ScrfdDetector};
use crate::recognizer::{ArcFaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding, PixelRect};
use image::imageops;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Turns an image into a face embedding.
pub trait FeatureExtractor {
    /// Returns `Ok(None)` when no face is found in `image`.
    fn extract(&mut self, image: &RgbImage) -> Result<Option<Embedding>, ExtractError>;
}

/// Finds candidate face regions in a frame.
pub trait Detector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, ExtractError>;
}

/// Copy a clipped region out of a frame.
pub fn crop(frame: &RgbImage, rect: PixelRect) -> RgbImage {
    imageops::crop_imm(frame, rect.x, rect.y, rect.width, rect.height).to_image()
}

/// SCRFD + ArcFace extractor: embeds the most confident face in the image.
pub struct OnnxExtractor {
    detector: ScrfdDetector,
    recognizer: ArcFaceRecognizer,
}

impl OnnxExtractor {
    pub fn new(detector: ScrfdDetector, recognizer: ArcFaceRecognizer) -> Self {
        Self {
            detector,
            recognizer,
        }
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Option<Embedding>, ExtractError> {
        let faces = self.detector.detect(image)?;
        // Detections arrive sorted by confidence; take the first that survives clipping.
        let Some(rect) = faces
            .iter()
            .find_map(|face| face.clip(image.width(), image.height()))
        else {
            return Ok(None);
        };

        let face = crop(image, rect);
        Ok(Some(self.recognizer.embed(&face)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_extracts_region() {
        let mut frame = RgbImage::from_pixel(20, 20, image::Rgb([0, 0, 0]));
        frame.put_pixel(5, 6, image::Rgb([200, 10, 10]));
        let rect = PixelRect { x: 5, y: 6, width: 4, height: 3 };
        let face = crop(&frame, rect);
        assert_eq!(face.dimensions(), (4, 3));
        assert_eq!(face.get_pixel(0, 0), &image::Rgb([200, 10, 10]));
    }
}
