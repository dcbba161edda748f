//! Genuine/imposter trial harness with ROC/AUC statistics.
//!
//! Each trial enrolls one randomly chosen embedding per sampled identity,
//! scores the identity's remaining embeddings against it (genuine) and one
//! embedding from each of a bounded number of other identities (imposter).
//! All randomness comes from the caller's RNG, so a seeded RNG reproduces
//! trial composition and AUC exactly.

use crate::enroll::{scan_identities, EnrollError};
use crate::extractor::FeatureExtractor;
use crate::types::{Embedding, StoreState};
use rand::seq::{index, SliceRandom};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_IMPOSTER_CAP: usize = 20;
pub const DEFAULT_HISTOGRAM_BINS: usize = 30;

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("ROC needs both classes: {genuine} genuine and {imposter} imposter scores")]
    DegenerateScores { genuine: usize, imposter: usize },
    #[error("dataset: {0}")]
    Dataset(#[from] EnrollError),
}

/// All usable embeddings of one identity.
#[derive(Debug, Clone)]
pub struct IdentitySamples {
    pub label: String,
    /// Number of source images, including ones that yielded no embedding.
    pub image_count: usize,
    pub embeddings: Vec<Embedding>,
}

/// Evaluation dataset, ordered by label.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub identities: Vec<IdentitySamples>,
}

impl Dataset {
    /// Group store records by label; each record counts as one image.
    pub fn from_state(state: &StoreState) -> Self {
        let mut grouped: BTreeMap<&str, Vec<Embedding>> = BTreeMap::new();
        for record in state.records() {
            grouped
                .entry(record.label.as_str())
                .or_default()
                .push(record.embedding.clone());
        }
        Self {
            identities: grouped
                .into_iter()
                .map(|(label, embeddings)| IdentitySamples {
                    label: label.to_string(),
                    image_count: embeddings.len(),
                    embeddings,
                })
                .collect(),
        }
    }

    /// Extract embeddings for every identity under `root` with at least
    /// `min_images` images. Each image is extracted once.
    ///
    /// The first usable embedding fixes the dataset dimension; later
    /// embeddings of another dimension, or with non-finite values, are skipped.
    pub fn extract_from_dir<E: FeatureExtractor + ?Sized>(
        root: &Path,
        extractor: &mut E,
        min_images: usize,
    ) -> Result<Self, EvaluationError> {
        let mut identities = Vec::new();
        let mut too_small = 0usize;
        let mut dimension: Option<usize> = None;

        for identity in scan_identities(root)? {
            if identity.images.len() < min_images {
                too_small += 1;
                continue;
            }

            let mut embeddings = Vec::with_capacity(identity.images.len());
            for path in &identity.images {
                let image = match image::open(path) {
                    Ok(img) => img.to_rgb8(),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "unreadable image");
                        continue;
                    }
                };
                match extractor.extract(&image) {
                    Ok(Some(embedding)) if !embedding.is_finite() => {
                        tracing::warn!(path = %path.display(), "embedding has non-finite values")
                    }
                    Ok(Some(embedding)) => match dimension {
                        Some(dim) if embedding.dim() != dim => tracing::warn!(
                            path = %path.display(),
                            dim = embedding.dim(),
                            expected = dim,
                            "embedding dimension mismatch"
                        ),
                        _ => {
                            dimension = Some(embedding.dim());
                            embeddings.push(embedding);
                        }
                    },
                    Ok(None) => tracing::warn!(path = %path.display(), "no face detected"),
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "extraction failed"),
                }
            }

            tracing::info!(
                label = %identity.label,
                usable = embeddings.len(),
                images = identity.images.len(),
                "loaded identity embeddings"
            );
            identities.push(IdentitySamples {
                label: identity.label,
                image_count: identity.images.len(),
                embeddings,
            });
        }

        tracing::info!(
            identities = identities.len(),
            excluded = too_small,
            min_images,
            "evaluation dataset ready"
        );
        Ok(Self { identities })
    }
}

/// Trial sampling parameters.
#[derive(Debug, Clone, Serialize)]
pub struct TrialConfig {
    pub min_images_per_identity: usize,
    pub identities_per_trial: usize,
    pub num_trials: usize,
    /// Upper bound on imposter identities scored per enrolled identity.
    pub imposter_cap: usize,
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            min_images_per_identity: 5,
            identities_per_trial: 10,
            num_trials: 50,
            imposter_cap: DEFAULT_IMPOSTER_CAP,
        }
    }
}

/// Scores produced by one trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialResult {
    pub trial: usize,
    pub identities: Vec<String>,
    pub genuine: Vec<f32>,
    pub imposter: Vec<f32>,
    /// Sampled identities with fewer than two usable embeddings.
    pub skipped: Vec<String>,
}

/// Run `config.num_trials` randomized verification trials.
pub fn run_trials<R: Rng + ?Sized>(
    dataset: &Dataset,
    config: &TrialConfig,
    rng: &mut R,
) -> Vec<TrialResult> {
    let eligible: Vec<&IdentitySamples> = dataset
        .identities
        .iter()
        .filter(|i| i.image_count >= config.min_images_per_identity)
        .collect();

    tracing::info!(
        eligible = eligible.len(),
        min_images = config.min_images_per_identity,
        "identities eligible for trials"
    );
    if eligible.len() < config.identities_per_trial {
        tracing::warn!(
            eligible = eligible.len(),
            requested = config.identities_per_trial,
            "fewer eligible identities than requested per trial; sampling all of them"
        );
    }

    let per_trial = config.identities_per_trial.min(eligible.len());
    let mut results = Vec::with_capacity(config.num_trials);

    for trial in 0..config.num_trials {
        let mut result = TrialResult {
            trial,
            identities: Vec::new(),
            genuine: Vec::new(),
            imposter: Vec::new(),
            skipped: Vec::new(),
        };

        for idx in index::sample(rng, eligible.len(), per_trial).into_vec() {
            let identity = eligible[idx];
            result.identities.push(identity.label.clone());

            let mut shuffled: Vec<&Embedding> = identity.embeddings.iter().collect();
            shuffled.shuffle(rng);
            let Some((enrolled, tests)) = shuffled.split_first() else {
                tracing::info!(label = %identity.label, "skipping identity: no usable embeddings");
                result.skipped.push(identity.label.clone());
                continue;
            };
            if tests.is_empty() {
                tracing::info!(label = %identity.label, "skipping identity: not enough test data");
                result.skipped.push(identity.label.clone());
                continue;
            }

            result
                .genuine
                .extend(tests.iter().map(|e| enrolled.euclidean_distance(e)));

            let others: Vec<usize> = (0..eligible.len()).filter(|&j| j != idx).collect();
            let picks: Vec<usize> = others
                .choose_multiple(rng, config.imposter_cap.min(others.len()))
                .copied()
                .collect();
            for j in picks {
                if let Some(imposter) = eligible[j].embeddings.choose(rng) {
                    result.imposter.push(enrolled.euclidean_distance(imposter));
                }
            }
        }

        tracing::info!(
            trial = trial + 1,
            of = config.num_trials,
            genuine = result.genuine.len(),
            imposter = result.imposter.len(),
            mean_genuine = ?mean(&result.genuine),
            mean_imposter = ?mean(&result.imposter),
            "trial complete"
        );
        results.push(result);
    }

    results
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreLabel {
    Genuine,
    Imposter,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LabeledScore {
    pub distance: f32,
    pub label: ScoreLabel,
}

/// Combined genuine and imposter scores across trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabeledScores {
    pub scores: Vec<LabeledScore>,
    /// Non-finite distances left out of `scores`.
    pub dropped: usize,
}

impl LabeledScores {
    pub fn distances(&self, label: ScoreLabel) -> impl Iterator<Item = f32> + '_ {
        self.scores
            .iter()
            .filter(move |s| s.label == label)
            .map(|s| s.distance)
    }

    pub fn count(&self, label: ScoreLabel) -> usize {
        self.distances(label).count()
    }

    /// True/false accept rates of a matcher threshold (accepts `distance < threshold`).
    pub fn operating_point(&self, threshold: f32) -> OperatingPoint {
        let rate = |label| {
            let total = self.count(label);
            let accepted = self.distances(label).filter(|&d| d < threshold).count();
            if total == 0 {
                0.0
            } else {
                accepted as f64 / total as f64
            }
        };
        OperatingPoint {
            threshold,
            tpr: rate(ScoreLabel::Genuine),
            fpr: rate(ScoreLabel::Imposter),
        }
    }
}

/// Concatenate every trial's genuine and imposter scores.
///
/// Non-finite distances are dropped here so every downstream count agrees.
pub fn aggregate(trials: &[TrialResult]) -> LabeledScores {
    let mut scores = Vec::new();
    let mut dropped = 0usize;
    for trial in trials {
        let labeled = trial
            .genuine
            .iter()
            .map(|&d| (d, ScoreLabel::Genuine))
            .chain(trial.imposter.iter().map(|&d| (d, ScoreLabel::Imposter)));
        for (distance, label) in labeled {
            if distance.is_finite() {
                scores.push(LabeledScore { distance, label });
            } else {
                dropped += 1;
            }
        }
    }
    if dropped > 0 {
        tracing::warn!(dropped, "dropped non-finite scores");
    }
    LabeledScores { scores, dropped }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperatingPoint {
    pub threshold: f32,
    pub tpr: f64,
    pub fpr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RocPoint {
    pub fpr: f64,
    pub tpr: f64,
    /// Distances at or below this value are accepted; `-inf` for the origin.
    pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RocCurve {
    pub points: Vec<RocPoint>,
    pub auc: f64,
}

impl RocCurve {
    /// Sweep the acceptance threshold over every distinct distance.
    ///
    /// Lower distance means a more confident match, so points run from the
    /// strictest threshold (origin) to the loosest (1, 1).
    pub fn compute(scores: &LabeledScores) -> Result<Self, EvaluationError> {
        let mut sorted: Vec<LabeledScore> = scores
            .scores
            .iter()
            .filter(|s| s.distance.is_finite())
            .copied()
            .collect();
        sorted.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        let positives = sorted.iter().filter(|s| s.label == ScoreLabel::Genuine).count();
        let negatives = sorted.len() - positives;
        if positives == 0 || negatives == 0 {
            return Err(EvaluationError::DegenerateScores {
                genuine: positives,
                imposter: negatives,
            });
        }

        let mut points = vec![RocPoint {
            fpr: 0.0,
            tpr: 0.0,
            threshold: f32::NEG_INFINITY,
        }];
        let (mut tp, mut fp) = (0usize, 0usize);

        for (i, score) in sorted.iter().enumerate() {
            match score.label {
                ScoreLabel::Genuine => tp += 1,
                ScoreLabel::Imposter => fp += 1,
            }
            // Emit one point per distinct distance.
            let last_of_group = sorted
                .get(i + 1)
                .map_or(true, |next| next.distance != score.distance);
            if last_of_group {
                points.push(RocPoint {
                    fpr: fp as f64 / negatives as f64,
                    tpr: tp as f64 / positives as f64,
                    threshold: score.distance,
                });
            }
        }

        let auc = trapezoid_auc(&points);
        Ok(Self { points, auc })
    }

    /// Operating point where false accept and false reject rates are closest.
    pub fn equal_error_rate(&self) -> Option<EqualErrorRate> {
        self.points
            .iter()
            .filter(|p| p.threshold.is_finite())
            .min_by(|a, b| {
                let gap = |p: &RocPoint| (p.fpr - (1.0 - p.tpr)).abs();
                gap(a).total_cmp(&gap(b))
            })
            .map(|p| EqualErrorRate {
                rate: (p.fpr + (1.0 - p.tpr)) / 2.0,
                threshold: p.threshold,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EqualErrorRate {
    pub rate: f64,
    pub threshold: f32,
}

fn trapezoid_auc(points: &[RocPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| (w[1].fpr - w[0].fpr) * (w[0].tpr + w[1].tpr) / 2.0)
        .sum()
}

/// Genuine vs. imposter histograms over a shared distance range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreDistribution {
    pub min: f32,
    pub max: f32,
    pub bin_width: f32,
    pub genuine_histogram: Vec<usize>,
    pub imposter_histogram: Vec<usize>,
    pub genuine_mean: Option<f32>,
    pub imposter_mean: Option<f32>,
    /// Median of all scores, drawn as the reference decision threshold.
    pub median: Option<f32>,
}

impl ScoreDistribution {
    pub fn from_scores(scores: &LabeledScores, bins: usize) -> Self {
        let bins = bins.max(1);
        let mut all: Vec<f32> = scores
            .scores
            .iter()
            .map(|s| s.distance)
            .filter(|d| d.is_finite())
            .collect();
        all.sort_by(f32::total_cmp);

        let min = all.first().copied().unwrap_or(0.0);
        let max = all.last().copied().unwrap_or(0.0);
        let bin_width = (max - min) / bins as f32;

        let histogram = |label| {
            let mut counts = vec![0usize; bins];
            for d in scores.distances(label).filter(|d| d.is_finite()) {
                let bin = if bin_width > 0.0 {
                    (((d - min) / bin_width) as usize).min(bins - 1)
                } else {
                    0
                };
                counts[bin] += 1;
            }
            counts
        };

        let genuine: Vec<f32> = scores.distances(ScoreLabel::Genuine).collect();
        let imposter: Vec<f32> = scores.distances(ScoreLabel::Imposter).collect();

        Self {
            min,
            max,
            bin_width,
            genuine_histogram: histogram(ScoreLabel::Genuine),
            imposter_histogram: histogram(ScoreLabel::Imposter),
            genuine_mean: mean(&genuine),
            imposter_mean: mean(&imposter),
            median: median_sorted(&all),
        }
    }
}

/// Everything an external renderer needs for one evaluation run.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub config: TrialConfig,
    pub trials: Vec<TrialResult>,
    pub genuine_count: usize,
    pub imposter_count: usize,
    /// Non-finite scores excluded from counts, ROC and histograms.
    pub dropped_scores: usize,
    pub roc: RocCurve,
    pub equal_error_rate: Option<EqualErrorRate>,
    /// Performance of the configured match threshold on these scores.
    pub match_threshold: OperatingPoint,
    pub distribution: ScoreDistribution,
}

/// Run trials, aggregate the scores, and compute ROC and distribution summaries.
pub fn evaluate<R: Rng + ?Sized>(
    dataset: &Dataset,
    config: &TrialConfig,
    match_threshold: f32,
    rng: &mut R,
) -> Result<EvaluationReport, EvaluationError> {
    let trials = run_trials(dataset, config, rng);
    let scores = aggregate(&trials);
    let roc = RocCurve::compute(&scores)?;

    tracing::info!(
        auc = roc.auc,
        genuine = scores.count(ScoreLabel::Genuine),
        imposter = scores.count(ScoreLabel::Imposter),
        "evaluation complete"
    );

    Ok(EvaluationReport {
        config: config.clone(),
        genuine_count: scores.count(ScoreLabel::Genuine),
        imposter_count: scores.count(ScoreLabel::Imposter),
        dropped_scores: scores.dropped,
        equal_error_rate: roc.equal_error_rate(),
        match_threshold: scores.operating_point(match_threshold),
        distribution: ScoreDistribution::from_scores(&scores, DEFAULT_HISTOGRAM_BINS),
        roc,
        trials,
    })
}

fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f32>() / values.len() as f32)
    }
}

fn median_sorted(sorted: &[f32]) -> Option<f32> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}
