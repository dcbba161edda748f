//! veriface-core — Face embedding verification engine.
//!
//! A persistent labeled embedding store, nearest-neighbor matching under a
//! Euclidean threshold, directory-driven enrollment, a genuine/imposter
//! evaluation harness and a frame-skipping live recognition loop.
//! Detection (SCRFD) and embedding (ArcFace) run via ONNX Runtime.

pub mod detector;
pub mod enroll;
pub mod evaluation;
pub mod extractor;
pub mod live;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;

pub use enroll::{EnrollError, EnrollmentPipeline, EnrollmentReport};
pub use evaluation::{evaluate, Dataset, EvaluationReport, TrialConfig};
pub use extractor::{Detector, ExtractError, FeatureExtractor, OnnxExtractor};
pub use live::{LiveConfig, LiveRecognizer, LiveSummary};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use store::{EmbeddingStore, StoreError};
pub use types::{BoundingBox, Embedding, MatchResult, StoreState, UNKNOWN_LABEL};

/// Default directory for the ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/veriface/models")
}
