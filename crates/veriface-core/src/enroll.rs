//! Enrollment: per-identity image directories → embeddings → store.
//!
//! The new store state is built entirely in memory and handed to
//! [`EmbeddingStore::save`] only when at least one embedding was extracted,
//! so a bad run can never replace a good store.

use crate::extractor::FeatureExtractor;
use crate::store::{EmbeddingStore, StoreError};
use crate::types::StoreState;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Image extensions accepted for enrollment (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no identity directories found in {0}")]
    NoIdentities(PathBuf),
    #[error("no face embeddings were extracted; existing store left untouched")]
    NoEmbeddings { report: Box<EnrollmentReport> },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// The images enrolled under one label.
#[derive(Debug, Clone)]
pub struct IdentityImages {
    pub label: String,
    pub images: Vec<PathBuf>,
}

/// Why an image contributed no embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NoFace,
    Unreadable(String),
    ExtractionFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoFace => write!(f, "no face detected"),
            SkipReason::Unreadable(e) => write!(f, "unreadable image: {e}"),
            SkipReason::ExtractionFailed(e) => write!(f, "extraction failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Per-identity enrollment outcome.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityOutcome {
    pub label: String,
    pub images: usize,
    pub embeddings: usize,
    pub skipped: Vec<SkippedImage>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrollmentReport {
    pub identities: Vec<IdentityOutcome>,
    pub embeddings_written: usize,
    pub backup: Option<PathBuf>,
}

impl EnrollmentReport {
    pub fn identities_processed(&self) -> usize {
        self.identities.len()
    }

    pub fn images_skipped(&self) -> usize {
        self.identities.iter().map(|i| i.skipped.len()).sum()
    }
}

/// True for files with an enrollment image extension.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, EnrollError> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let path = entry.map_err(|e| io_err(dir, e))?.path();
        if path.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Scan `root` for one subdirectory per identity, sorted by label.
pub fn scan_identities(root: &Path) -> Result<Vec<IdentityImages>, EnrollError> {
    let mut identities = Vec::new();
    for entry in fs::read_dir(root).map_err(|e| io_err(root, e))? {
        let path = entry.map_err(|e| io_err(root, e))?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(label) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            tracing::warn!(path = %path.display(), "skipping identity directory with non-UTF-8 name");
            continue;
        };
        let images = list_images(&path)?;
        if images.is_empty() {
            tracing::warn!(%label, "no images found for identity");
        }
        identities.push(IdentityImages { label, images });
    }

    if identities.is_empty() {
        return Err(EnrollError::NoIdentities(root.to_path_buf()));
    }
    identities.sort_by(|a, b| a.label.cmp(&b.label));
    tracing::info!(root = %root.display(), identities = identities.len(), "scanned identities");
    Ok(identities)
}

/// Builds a fresh store state from identity images and commits it.
pub struct EnrollmentPipeline<'a, E: FeatureExtractor + ?Sized> {
    extractor: &'a mut E,
    store: &'a EmbeddingStore,
}

impl<'a, E: FeatureExtractor + ?Sized> EnrollmentPipeline<'a, E> {
    pub fn new(extractor: &'a mut E, store: &'a EmbeddingStore) -> Self {
        Self { extractor, store }
    }

    pub fn enroll(&mut self, identities: &[IdentityImages]) -> Result<EnrollmentReport, EnrollError> {
        let mut state = StoreState::new();
        let mut report = EnrollmentReport::default();

        for identity in identities {
            tracing::info!(label = %identity.label, images = identity.images.len(), "enrolling identity");
            let mut outcome = IdentityOutcome {
                label: identity.label.clone(),
                images: identity.images.len(),
                embeddings: 0,
                skipped: Vec::new(),
            };

            for path in &identity.images {
                match self.embed_image(path, state.dimension()) {
                    Ok(embedding) => {
                        state.push(identity.label.clone(), embedding);
                        outcome.embeddings += 1;
                    }
                    Err(reason) => {
                        tracing::warn!(path = %path.display(), %reason, "skipping image");
                        outcome.skipped.push(SkippedImage {
                            path: path.clone(),
                            reason,
                        });
                    }
                }
            }
            report.identities.push(outcome);
        }

        if state.is_empty() {
            tracing::error!(
                identities = report.identities_processed(),
                skipped = report.images_skipped(),
                "no face embeddings were generated"
            );
            return Err(EnrollError::NoEmbeddings {
                report: Box::new(report),
            });
        }

        let saved = self.store.save(&state)?;
        report.embeddings_written = saved.records;
        report.backup = saved.backup;

        tracing::info!(
            identities = report.identities_processed(),
            embeddings = report.embeddings_written,
            skipped = report.images_skipped(),
            "enrollment complete"
        );
        Ok(report)
    }

    fn embed_image(
        &mut self,
        path: &Path,
        expected_dim: Option<usize>,
    ) -> Result<crate::types::Embedding, SkipReason> {
        let image = image::open(path)
            .map_err(|e| SkipReason::Unreadable(e.to_string()))?
            .to_rgb8();

        let embedding = self
            .extractor
            .extract(&image)
            .map_err(|e| SkipReason::ExtractionFailed(e.to_string()))?
            .ok_or(SkipReason::NoFace)?;

        if embedding.dim() == 0 {
            return Err(SkipReason::ExtractionFailed("empty embedding".into()));
        }
        if !embedding.is_finite() {
            return Err(SkipReason::ExtractionFailed("embedding has non-finite values".into()));
        }
        if let Some(dim) = expected_dim {
            if embedding.dim() != dim {
                return Err(SkipReason::ExtractionFailed(format!(
                    "embedding has dimension {}, expected {dim}",
                    embedding.dim()
                )));
            }
        }
        Ok(embedding)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> EnrollError {
    EnrollError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extractor::ExtractError;
    use crate::types::Embedding;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    /// Embeds the top-left pixel colour; an all-black pixel means "no face".
    pub(crate) struct ColorExtractor;

    impl FeatureExtractor for ColorExtractor {
        fn extract(&mut self, image: &RgbImage) -> Result<Option<Embedding>, ExtractError> {
            let Rgb([r, g, b]) = *image.get_pixel(0, 0);
            if (r, g, b) == (0, 0, 0) {
                return Ok(None);
            }
            Ok(Some(Embedding::new(vec![
                r as f32 / 255.0,
                g as f32 / 255.0,
                b as f32 / 255.0,
            ])))
        }
    }

    pub(crate) fn write_image(dir: &Path, name: &str, color: [u8; 3]) {
        fs::create_dir_all(dir).unwrap();
        RgbImage::from_pixel(4, 4, Rgb(color))
            .save(dir.join(name))
            .unwrap();
    }

    fn temp_store(dir: &TempDir) -> EmbeddingStore {
        EmbeddingStore::new(dir.path().join("known_faces.json"), dir.path().join("backups"))
    }

    #[test]
    fn test_is_image_file_case_insensitive() {
        assert!(is_image_file(Path::new("a.png")));
        assert!(is_image_file(Path::new("a.JPG")));
        assert!(is_image_file(Path::new("a.Jpeg")));
        assert!(!is_image_file(Path::new("a.gif")));
        assert!(!is_image_file(Path::new("README")));
    }

    #[test]
    fn test_scan_identities_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        let faces = dir.path().join("faces");
        write_image(&faces.join("bob"), "2.png", [10, 10, 10]);
        write_image(&faces.join("bob"), "1.png", [10, 10, 10]);
        write_image(&faces.join("alice"), "a.png", [10, 10, 10]);
        fs::write(faces.join("bob").join("notes.txt"), b"x").unwrap();
        fs::write(faces.join("stray.png"), b"x").unwrap();

        let identities = scan_identities(&faces).unwrap();
        let labels: Vec<&str> = identities.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["alice", "bob"]);
        let bob: Vec<_> = identities[1]
            .images
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(bob, vec!["1.png", "2.png"]);
    }

    #[test]
    fn test_scan_identities_requires_subdirectories() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            scan_identities(dir.path()),
            Err(EnrollError::NoIdentities(_))
        ));
        assert!(matches!(
            scan_identities(&dir.path().join("missing")),
            Err(EnrollError::Io { .. })
        ));
    }

    #[test]
    fn test_enroll_skips_faceless_and_unreadable_images() {
        let dir = TempDir::new().unwrap();
        let faces = dir.path().join("faces");
        write_image(&faces.join("alice"), "1.png", [255, 0, 0]);
        write_image(&faces.join("alice"), "2.png", [0, 0, 0]);
        write_image(&faces.join("bob"), "1.png", [0, 0, 255]);
        fs::write(faces.join("bob").join("broken.png"), b"not an image").unwrap();

        let store = temp_store(&dir);
        let identities = scan_identities(&faces).unwrap();
        let report = EnrollmentPipeline::new(&mut ColorExtractor, &store)
            .enroll(&identities)
            .unwrap();

        assert_eq!(report.identities_processed(), 2);
        assert_eq!(report.embeddings_written, 2);
        assert_eq!(report.images_skipped(), 2);
        assert_eq!(report.identities[0].skipped[0].reason, SkipReason::NoFace);
        assert!(matches!(
            report.identities[1].skipped[0].reason,
            SkipReason::Unreadable(_)
        ));
        assert!(report.backup.is_none());

        let state = store.load().unwrap();
        let labels: Vec<&str> = state.records().iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["alice", "bob"]);
    }

    #[test]
    fn test_zero_embeddings_leave_store_untouched() {
        let dir = TempDir::new().unwrap();
        let store = temp_store(&dir);
        let mut previous = StoreState::new();
        previous.push("carol", Embedding::new(vec![0.1, 0.2, 0.3]));
        store.save(&previous).unwrap();
        let before = fs::read(store.path()).unwrap();

        let faces = dir.path().join("faces");
        write_image(&faces.join("alice"), "1.png", [0, 0, 0]);
        write_image(&faces.join("bob"), "1.png", [0, 0, 0]);

        let identities = scan_identities(&faces).unwrap();
        let err = EnrollmentPipeline::new(&mut ColorExtractor, &store)
            .enroll(&identities)
            .unwrap_err();

        match err {
            EnrollError::NoEmbeddings { report } => {
                assert_eq!(report.identities_processed(), 2);
                assert_eq!(report.images_skipped(), 2);
            }
            other => panic!("expected NoEmbeddings, got {other:?}"),
        }
        assert_eq!(fs::read(store.path()).unwrap(), before);
        assert!(store.backups().unwrap().is_empty());
    }

    /// Emits NaN for red images and defers to [`ColorExtractor`] otherwise.
    struct NanExtractor;

    impl FeatureExtractor for NanExtractor {
        fn extract(&mut self, image: &RgbImage) -> Result<Option<Embedding>, ExtractError> {
            if image.get_pixel(0, 0) == &Rgb([255, 0, 0]) {
                return Ok(Some(Embedding::new(vec![f32::NAN, 0.0, 0.0])));
            }
            ColorExtractor.extract(image)
        }
    }

    #[test]
    fn test_non_finite_embeddings_are_skipped() {
        let dir = TempDir::new().unwrap();
        let faces = dir.path().join("faces");
        write_image(&faces.join("alice"), "1.png", [255, 0, 0]);
        write_image(&faces.join("alice"), "2.png", [0, 255, 0]);
        let store = temp_store(&dir);
        let identities = scan_identities(&faces).unwrap();

        let report = EnrollmentPipeline::new(&mut NanExtractor, &store)
            .enroll(&identities)
            .unwrap();

        assert_eq!(report.embeddings_written, 1);
        assert!(matches!(
            report.identities[0].skipped[0].reason,
            SkipReason::ExtractionFailed(_)
        ));
        let state = store.load().unwrap();
        assert_eq!(state.len(), 1);
        assert!(state.records()[0].embedding.is_finite());
    }

    #[test]
    fn test_reenrollment_backs_up_previous_store() {
        let dir = TempDir::new().unwrap();
        let faces = dir.path().join("faces");
        write_image(&faces.join("alice"), "1.png", [200, 100, 50]);
        let store = temp_store(&dir);
        let identities = scan_identities(&faces).unwrap();

        EnrollmentPipeline::new(&mut ColorExtractor, &store)
            .enroll(&identities)
            .unwrap();
        let report = EnrollmentPipeline::new(&mut ColorExtractor, &store)
            .enroll(&identities)
            .unwrap();

        assert!(report.backup.is_some());
        assert_eq!(store.backups().unwrap().len(), 1);
    }
}
