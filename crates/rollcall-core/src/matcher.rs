//! Nearest-neighbour identity matching by Euclidean distance.

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult};
use thiserror::Error;

/// Default match threshold for 128-d face embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("match threshold must lie in (0, 1), got {0}")]
    OutOfRange(f32),
}

/// Distance below which a detection is accepted as an identity. Lower is stricter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold(f32);

impl Threshold {
    pub fn new(value: f32) -> Result<Self, ThresholdError> {
        if value > 0.0 && value < 1.0 {
            Ok(Self(value))
        } else {
            Err(ThresholdError::OutOfRange(value))
        }
    }

    pub fn value(&self) -> f32 {
        self.0
    }

    /// Exclusive boundary: a distance equal to the threshold does not match.
    pub fn accepts(&self, distance: f32) -> bool {
        distance < self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_MATCH_THRESHOLD)
    }
}

/// Strategy for comparing a query embedding against a gallery.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &Gallery) -> MatchResult;
}

/// Euclidean nearest-neighbour matcher bound to a single threshold.
///
/// The returned [`MatchResult`] carries the threshold it was decided with so
/// any overlay drawn from it agrees with the decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher {
    threshold: Threshold,
}

impl EuclideanMatcher {
    pub fn new(threshold: Threshold) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Embedding, gallery: &Gallery) -> MatchResult {
        let threshold = self.threshold.value();
        if !query.is_well_formed() {
            return MatchResult::unmatched(f32::INFINITY, threshold);
        }

        let mut best_distance = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            // Per-identity distance is the closest of its references.
            let distance = entry
                .references
                .iter()
                .map(|reference| query.euclidean_distance(reference))
                .fold(f32::INFINITY, f32::min);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if self.threshold.accepts(best_distance) => MatchResult {
                identity_id: Some(gallery.entries()[idx].identity_id.clone()),
                distance: best_distance,
                is_match: true,
                threshold,
            },
            _ => MatchResult::unmatched(best_distance, threshold),
        }
    }
}
