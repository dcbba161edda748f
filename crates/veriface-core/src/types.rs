use serde::{Deserialize, Serialize};

/// Label reported when no enrolled identity clears the match threshold.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Clip the box to a `frame_width` × `frame_height` frame.
    ///
    /// Returns `None` for boxes with non-finite coordinates or boxes that
    /// collapse to zero area once clipped.
    pub fn clip(&self, frame_width: u32, frame_height: u32) -> Option<PixelRect> {
        if ![self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
        {
            return None;
        }

        let x1 = self.x.max(0.0).floor() as u32;
        let y1 = self.y.max(0.0).floor() as u32;
        let x2 = (self.x + self.width).min(frame_width as f32).max(0.0).ceil() as u32;
        let y2 = (self.y + self.height).min(frame_height as f32).max(0.0).ceil() as u32;
        let x2 = x2.min(frame_width);
        let y2 = y2.min(frame_height);

        if x2 > x1 && y2 > y1 {
            Some(PixelRect {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            })
        } else {
            None
        }
    }
}

/// Integer pixel rectangle, guaranteed to lie inside the frame it was clipped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// False if any component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimension are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled embedding and the identity it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub label: String,
    pub embedding: Embedding,
}

/// In-memory snapshot of the embedding store.
///
/// Records keep their enrollment order; several records may share a label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    records: Vec<IdentityRecord>,
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, embedding: Embedding) {
        self.records.push(IdentityRecord {
            label: label.into(),
            embedding,
        });
    }

    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Embedding dimension, or `None` for an empty store.
    pub fn dimension(&self) -> Option<usize> {
        self.records.first().map(|r| r.embedding.dim())
    }

    /// Number of enrolled embeddings per label, sorted by label.
    pub fn label_counts(&self) -> std::collections::BTreeMap<String, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.label.clone()).or_insert(0) += 1;
        }
        counts
    }
}

impl FromIterator<IdentityRecord> for StoreState {
    fn from_iter<I: IntoIterator<Item = IdentityRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

/// Result of matching a probe embedding against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Identity label, or [`UNKNOWN_LABEL`] on rejection.
    pub label: String,
    /// Distance to the nearest record; `f32::INFINITY` for an empty store.
    pub distance: f32,
    /// Index of the nearest record (if any).
    pub index: Option<usize>,
}

impl MatchResult {
    pub fn unknown(distance: f32, index: Option<usize>) -> Self {
        Self {
            matched: false,
            label: UNKNOWN_LABEL.to_string(),
            distance,
            index,
        }
    }
}
