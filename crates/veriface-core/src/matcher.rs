//! Nearest-neighbour identity matching over the embedding store.

use crate::types::{Embedding, MatchResult, StoreState};

/// Default acceptance threshold in Euclidean embedding space.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.9;

/// Strategy for comparing a probe embedding against enrolled records.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, state: &StoreState, threshold: f32) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher.
///
/// Scans every record; on equal distances the lowest record index wins.
/// A probe is accepted only when the nearest distance is strictly below
/// `threshold`, so a zero or negative threshold never accepts.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, state: &StoreState, threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, record) in state.records().iter().enumerate() {
            let dist = probe.euclidean_distance(&record.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                matched: true,
                label: state.records()[idx].label.clone(),
                distance: best_dist,
                index: Some(idx),
            },
            _ => MatchResult::unknown(best_dist, best_idx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNKNOWN_LABEL;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn alice_bob() -> StoreState {
        let mut state = StoreState::new();
        state.push("alice", emb(&[1.0, 0.0, 0.0]));
        state.push("bob", emb(&[0.0, 1.0, 0.0]));
        state
    }

    #[test]
    fn test_exact_match_returns_label_at_zero_distance() {
        let result = EuclideanMatcher.compare(&emb(&[1.0, 0.0, 0.0]), &alice_bob(), 0.9);
        assert!(result.matched);
        assert_eq!(result.label, "alice");
        assert_eq!(result.distance, 0.0);
        assert_eq!(result.index, Some(0));
    }

    #[test]
    fn test_empty_store_is_unknown() {
        let result = EuclideanMatcher.compare(&emb(&[1.0, 0.0]), &StoreState::new(), 0.9);
        assert!(!result.matched);
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!(result.distance.is_infinite());
        assert_eq!(result.index, None);
    }

    #[test]
    fn test_rejection_still_reports_distance() {
        let mut state = StoreState::new();
        state.push("alice", emb(&[0.0, 0.0]));
        let result = EuclideanMatcher.compare(&emb(&[1.5, 0.0]), &state, 0.9);
        assert!(!result.matched);
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!((result.distance - 1.5).abs() < 1e-6);
        assert_eq!(result.index, Some(0));
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut state = StoreState::new();
        state.push("alice", emb(&[0.0, 0.0]));
        let result = EuclideanMatcher.compare(&emb(&[0.5, 0.0]), &state, 0.5);
        assert!(!result.matched);
    }

    #[test]
    fn test_tie_resolves_to_lowest_index() {
        let mut state = StoreState::new();
        state.push("first", emb(&[1.0, 0.0]));
        state.push("second", emb(&[-1.0, 0.0]));
        state.push("third", emb(&[1.0, 0.0]));
        let result = EuclideanMatcher.compare(&emb(&[0.0, 0.0]), &state, 2.0);
        assert_eq!(result.label, "first");
        assert_eq!(result.index, Some(0));
    }

    #[test]
    fn test_zero_or_negative_threshold_never_matches() {
        let state = alice_bob();
        for threshold in [0.0, -1.0] {
            let result = EuclideanMatcher.compare(&emb(&[1.0, 0.0, 0.0]), &state, threshold);
            assert!(!result.matched);
            assert_eq!(result.distance, 0.0);
        }
    }

    #[test]
    fn test_every_enrolled_embedding_matches_itself() {
        let mut state = alice_bob();
        state.push("carol", emb(&[0.3, 0.3, 0.9]));
        state.push("alice", emb(&[0.9, 0.1, 0.0]));
        for record in state.records() {
            let result = EuclideanMatcher.compare(&record.embedding, &state, 0.1);
            assert!(result.matched);
            assert_eq!(result.label, record.label);
            assert_eq!(result.distance, 0.0);
        }
    }

    #[test]
    fn test_larger_threshold_accepts_superset() {
        let state = alice_bob();
        let probes: Vec<Embedding> = (0..20)
            .map(|i| {
                let t = i as f32 / 10.0;
                emb(&[1.0 - t * 0.5, t * 0.3, t * 0.2])
            })
            .collect();
        let thresholds = [0.0, 0.2, 0.5, 0.9, 1.5];

        for pair in thresholds.windows(2) {
            let (low, high) = (pair[0], pair[1]);
            for probe in &probes {
                let strict = EuclideanMatcher.compare(probe, &state, low);
                let loose = EuclideanMatcher.compare(probe, &state, high);
                if strict.matched {
                    assert!(loose.matched);
                    assert_eq!(strict.label, loose.label);
                }
            }
        }
    }

    #[test]
    fn test_mismatched_dimension_never_matches() {
        let state = alice_bob();
        let result = EuclideanMatcher.compare(&emb(&[1.0, 0.0]), &state, 10.0);
        assert!(!result.matched);
        assert!(result.distance.is_infinite());
    }
}
