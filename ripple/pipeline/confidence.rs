//! End-to-end confidence aggregation.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::PipelineError,
    result::{LayerKind, LayerResult},
};

/// Per-layer importance weights used as exponents during aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfidenceWeights(IndexMap<LayerKind, f64>);

impl ConfidenceWeights {
    /// Uniform weight of 1.0 for every layer.
    #[must_use]
    pub fn uniform() -> Self {
        Self(LayerKind::ORDER.iter().map(|kind| (*kind, 1.0)).collect())
    }

    /// Starts from uniform weights and applies `overrides`.
    #[must_use]
    pub fn with_overrides(overrides: &IndexMap<LayerKind, f64>) -> Self {
        let mut weights = Self::uniform();
        for (kind, weight) in overrides {
            weights.0.insert(*kind, *weight);
        }
        weights
    }

    /// Weight for `kind`, 1.0 when unset.
    #[must_use]
    pub fn weight(&self, kind: LayerKind) -> f64 {
        self.0.get(&kind).copied().unwrap_or(1.0)
    }

    /// Rejects non-finite or non-positive weights.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (kind, weight) in &self.0 {
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(PipelineError::Config(format!(
                    "weight for {kind} must be positive and finite, got {weight}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self::uniform()
    }
}

/// Combines per-layer confidences into one score.
///
/// `min(Π cᵢ^wᵢ, min cᵢ)`, where skipped and failed layers contribute zero.
/// The product penalises every weak link multiplicatively; the `min` term keeps
/// the aggregate at or below the weakest layer whatever the weights are.
#[must_use]
pub fn aggregate(results: &[LayerResult], weights: &ConfidenceWeights) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let mut product = 1.0_f64;
    let mut weakest = 1.0_f64;
    for result in results {
        let contribution = result.contribution();
        weakest = weakest.min(contribution);
        product *= contribution.powf(weights.weight(result.layer()));
    }
    let aggregate = product.min(weakest);
    if aggregate.is_finite() {
        aggregate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{Confidence, DataSource, Prediction};

    fn computed(kind: LayerKind, confidence: f64) -> LayerResult {
        LayerResult::computed(Prediction::neutral(kind), Confidence::clamped(confidence))
    }

    fn all_computed(confidence: f64) -> Vec<LayerResult> {
        LayerKind::ORDER
            .iter()
            .map(|kind| computed(*kind, confidence))
            .collect()
    }

    #[test]
    fn identity_case_is_one() {
        let score = aggregate(&all_computed(1.0), &ConfidenceWeights::uniform());
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn all_skipped_or_failed_is_zero() {
        let results: Vec<_> = LayerKind::ORDER
            .iter()
            .enumerate()
            .map(|(idx, kind)| {
                if idx % 2 == 0 {
                    LayerResult::skipped(*kind, "no data")
                } else {
                    LayerResult::failed(*kind, "fault")
                }
            })
            .collect();
        assert!(aggregate(&results, &ConfidenceWeights::uniform()).abs() < f64::EPSILON);
        assert!(aggregate(&[], &ConfidenceWeights::uniform()).abs() < f64::EPSILON);
    }

    #[test]
    fn never_exceeds_weakest_link() {
        let mut results = all_computed(0.9);
        results[2] = computed(LayerKind::IndustryResponse, 0.6);
        let light = ConfidenceWeights::with_overrides(&IndexMap::from([(
            LayerKind::IndustryResponse,
            0.1,
        )]));
        let score = aggregate(&results, &light);
        assert!(score <= 0.6 + f64::EPSILON);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn degrading_a_layer_never_increases_confidence() {
        let weights = ConfidenceWeights::uniform();
        let baseline = all_computed(0.8);
        let before = aggregate(&baseline, &weights);
        for idx in 0..baseline.len() {
            let kind = LayerKind::ORDER[idx];
            let mut degraded = baseline.clone();
            degraded[idx] = LayerResult::degraded(
                Prediction::neutral(kind),
                Confidence::clamped(0.3),
                DataSource::Heuristic,
                "heuristic",
            );
            assert!(aggregate(&degraded, &weights) <= before);
            let mut skipped = baseline.clone();
            skipped[idx] = LayerResult::skipped(kind, "skip");
            assert!(aggregate(&skipped, &weights).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn heavier_weights_penalise_more() {
        let results = all_computed(0.9);
        let heavy =
            ConfidenceWeights::with_overrides(&IndexMap::from([(LayerKind::TradeFlow, 3.0)]));
        assert!(aggregate(&results, &heavy) < aggregate(&results, &ConfidenceWeights::uniform()));
    }

    #[test]
    fn rejects_bad_weights() {
        let bad =
            ConfidenceWeights::with_overrides(&IndexMap::from([(LayerKind::Geopolitical, 0.0)]));
        assert!(bad.validate().is_err());
        assert!(ConfidenceWeights::uniform().validate().is_ok());
    }
}
