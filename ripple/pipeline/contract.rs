//! The uniform layer contract every stage implements.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::LayerError,
    input::{FeatureValue, LayerInput},
    result::{Confidence, LayerKind, LayerResult},
};

/// Capability interface shared by the six stages.
///
/// The orchestrator only ever talks to stages through this trait, so a stage
/// can be unit tested in isolation with hand-built [`LayerInput`]s.
pub trait Layer: Send + Sync {
    /// Layer this stage implements.
    fn kind(&self) -> LayerKind;

    /// Keys `predict` needs to find in its input.
    fn required_inputs(&self) -> &'static [&'static str];

    /// True iff a fitted model or an explicit rule-based fallback exists.
    fn is_ready(&self) -> bool;

    /// Trains the stage, recording the result under `version`.
    ///
    /// On error the previously fitted model (if any) stays in place.
    fn fit(&mut self, data: &TrainingSet, version: u32) -> Result<TrainingResult, LayerError>;

    /// Independent copy of the stage, fitted off to the side and swapped in
    /// once its model record is stored.
    fn fork(&self) -> Box<dyn Layer>;

    /// Lowest confidence a `Computed` result of this stage can carry.
    ///
    /// Fallback results for the layer are capped at this value, so a
    /// substitute never scores above the primary path it replaces.
    fn confidence_floor(&self) -> Confidence;

    /// Produces a result, encoding uncertainty in the confidence score.
    ///
    /// Returns `MissingInput` only when a required key is absent; callers are
    /// expected to validate first.
    fn predict(&self, input: &LayerInput) -> Result<LayerResult, LayerError>;

    /// Metadata of the model currently in use.
    fn metadata(&self) -> Option<&TrainingResult>;

    /// Fails with the first required key absent from `input`.
    fn ensure_inputs(&self, input: &LayerInput) -> Result<(), LayerError> {
        match input.missing(self.required_inputs()).first() {
            Some(key) => Err(LayerError::MissingInput {
                layer: self.kind(),
                key: (*key).to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// One labelled observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    /// Observed features.
    pub features: IndexMap<String, FeatureValue>,
    /// Observed outcome for the layer's headline value.
    pub target: f64,
    /// When the outcome was observed.
    pub observed_at: DateTime<Utc>,
}

impl TrainingSample {
    /// Sample observed now.
    #[must_use]
    pub fn new(features: IndexMap<String, FeatureValue>, target: f64) -> Self {
        Self {
            features,
            target,
            observed_at: Utc::now(),
        }
    }

    /// Overrides the observation time.
    #[must_use]
    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// View the features as a layer input so stages share extraction code.
    #[must_use]
    pub fn as_input(&self, layer: LayerKind) -> LayerInput {
        let mut input = LayerInput::new(layer);
        for (key, value) in &self.features {
            input.insert(key.clone(), value.clone());
        }
        input
    }
}

/// Time span covered by a training set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingWindow {
    /// Earliest observation.
    pub start: DateTime<Utc>,
    /// Latest observation.
    pub end: DateTime<Utc>,
}

/// Labelled data for one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    samples: Vec<TrainingSample>,
}

impl TrainingSet {
    /// Wraps samples.
    #[must_use]
    pub const fn new(samples: Vec<TrainingSample>) -> Self {
        Self { samples }
    }

    /// Loads one JSON sample per line, skipping blanks.
    pub fn from_jsonl(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("opening training data {}", path.display()))?;
        let mut samples = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let sample = serde_json::from_str::<TrainingSample>(&line).with_context(|| {
                format!("parsing training sample {} in {}", idx + 1, path.display())
            })?;
            samples.push(sample);
        }
        Ok(Self { samples })
    }

    /// Appends a sample.
    pub fn push(&mut self, sample: TrainingSample) {
        self.samples.push(sample);
    }

    /// Samples in insertion order.
    #[must_use]
    pub fn samples(&self) -> &[TrainingSample] {
        &self.samples
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Observation span, `None` for an empty set.
    #[must_use]
    pub fn window(&self) -> Option<TrainingWindow> {
        let start = self.samples.iter().map(|s| s.observed_at).min()?;
        let end = self.samples.iter().map(|s| s.observed_at).max()?;
        Some(TrainingWindow { start, end })
    }

    /// Fails with `InsufficientData` below `minimum` samples.
    pub fn ensure_size(&self, layer: LayerKind, minimum: usize) -> Result<(), LayerError> {
        if self.samples.is_empty() || self.samples.len() < minimum {
            return Err(LayerError::InsufficientData {
                layer,
                available: self.samples.len(),
                required: minimum,
            });
        }
        Ok(())
    }

    /// Fails with `Schema` when a sample lacks a required field or has a non-finite target.
    pub fn ensure_schema(&self, layer: LayerKind, required: &[&str]) -> Result<(), LayerError> {
        for (idx, sample) in self.samples.iter().enumerate() {
            if let Some(key) = required.iter().find(|key| !sample.features.contains_key(**key)) {
                return Err(LayerError::Schema {
                    layer,
                    detail: format!("sample {idx} lacks `{key}`"),
                });
            }
            if !sample.target.is_finite() {
                return Err(LayerError::Schema {
                    layer,
                    detail: format!("sample {idx} has a non-finite target"),
                });
            }
        }
        Ok(())
    }
}

impl FromIterator<TrainingSample> for TrainingSet {
    fn from_iter<T: IntoIterator<Item = TrainingSample>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Provenance of a fitted stage model. Superseded, never mutated, on retraining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Layer the model belongs to.
    pub layer: LayerKind,
    /// Monotonic version per layer, starting at 1.
    pub version: u32,
    /// Span of the training observations.
    pub window: TrainingWindow,
    /// Samples used.
    pub samples: usize,
    /// Fit metrics (`mse`, `r2`, ...).
    pub metrics: IndexMap<String, f64>,
    /// When fitting completed.
    pub fitted_at: DateTime<Utc>,
}

/// Alias used where the record describes a deployed model rather than a fit.
pub type ModelMetadata = TrainingResult;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample(rate: f64, target: f64) -> TrainingSample {
        TrainingSample::new(
            IndexMap::from([("tariff_rate".to_string(), FeatureValue::Number(rate))]),
            target,
        )
    }

    #[test]
    fn size_and_schema_checks() {
        let empty = TrainingSet::default();
        assert!(matches!(
            empty.ensure_size(LayerKind::IndustryResponse, 1),
            Err(LayerError::InsufficientData { available: 0, .. })
        ));
        let set: TrainingSet = (0..3).map(|i| sample(f64::from(i) * 0.1, 0.0)).collect();
        assert!(set.ensure_size(LayerKind::TradeFlow, 3).is_ok());
        assert!(set.ensure_size(LayerKind::TradeFlow, 4).is_err());
        assert!(set.ensure_schema(LayerKind::TradeFlow, &["tariff_rate"]).is_ok());
        assert!(matches!(
            set.ensure_schema(LayerKind::TradeFlow, &["import_elasticity"]),
            Err(LayerError::Schema { .. })
        ));
    }

    #[test]
    fn window_spans_observations() {
        let now = Utc::now();
        let set = TrainingSet::new(vec![
            sample(0.1, 0.0).observed_at(now - Duration::days(30)),
            sample(0.2, 0.0).observed_at(now),
        ]);
        let window = set.window().unwrap();
        assert_eq!(window.end - window.start, Duration::days(30));
    }

    #[test]
    fn loads_jsonl() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"features":{{"tariff_rate":0.25}},"target":-0.2,"observed_at":"2024-01-01T00:00:00Z"}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        let set = TrainingSet::from_jsonl(file.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert!((set.samples()[0].target + 0.2).abs() < f64::EPSILON);
    }
}
