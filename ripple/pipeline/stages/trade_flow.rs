use indexmap::IndexMap;

use crate::{
    contract::{Layer, TrainingResult, TrainingSet},
    error::LayerError,
    input::{FeatureValue, LayerInput},
    result::{Confidence, LayerKind, LayerResult, Prediction},
};

use super::StageCore;

const REQUIRED: &[&str] = &[
    "tariff_rate",
    "policy_severity",
    "trade_volume",
    "import_elasticity",
];
const TRAINING_KEYS: &[&str] = &["tariff_rate", "policy_severity", "import_elasticity"];
const MIN_SAMPLES: usize = 8;

/// Below this volume the bilateral base is too thin to trust.
const THIN_VOLUME: f64 = 1.0;
const ASSUMED_SHARES_SCALE: f64 = 0.9;
const THIN_VOLUME_SCALE: f64 = 0.85;

/// Estimates the change in bilateral import volume per partner.
#[derive(Debug, Clone)]
pub struct TradeFlowStage {
    core: StageCore,
}

impl TradeFlowStage {
    /// Stage answering from elasticity rules until fitted.
    #[must_use]
    pub const fn rule_based() -> Self {
        Self {
            core: StageCore::new(LayerKind::TradeFlow, TRAINING_KEYS, MIN_SAMPLES, true),
        }
    }

    /// Stage that is not ready until fitted.
    #[must_use]
    pub const fn untrained() -> Self {
        Self {
            core: StageCore::new(LayerKind::TradeFlow, TRAINING_KEYS, MIN_SAMPLES, false),
        }
    }

    fn row(input: &LayerInput) -> Result<Vec<f64>, LayerError> {
        Ok(vec![
            input.number("tariff_rate")?,
            input.number("policy_severity")?,
            input.number("import_elasticity")?,
        ])
    }
}

/// Normalized share per partner.
///
/// Partners come from `target_countries`, else from the share vector. The flag
/// is false when shares had to be assumed equal.
fn partner_shares(input: &LayerInput) -> (IndexMap<String, f64>, bool) {
    let provided = input.get("partner_shares").and_then(FeatureValue::as_vector);
    let mut partners: Vec<String> = input
        .get("target_countries")
        .and_then(FeatureValue::as_text)
        .map(|text| {
            text.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if partners.is_empty() {
        partners = provided
            .map(|shares| shares.keys().cloned().collect())
            .unwrap_or_default();
    }
    if partners.is_empty() {
        partners.push("all_partners".into());
    }
    let raw: Vec<f64> = partners
        .iter()
        .map(|name| {
            provided
                .and_then(|shares| shares.get(name))
                .copied()
                .filter(|share| share.is_finite() && *share > 0.0)
                .unwrap_or(0.0)
        })
        .collect();
    let total: f64 = raw.iter().sum();
    #[allow(clippy::cast_precision_loss)]
    let equal = 1.0 / partners.len() as f64;
    let known = total > 0.0;
    let shares = partners
        .into_iter()
        .zip(raw)
        .map(|(name, share)| (name, if known { share / total } else { equal }))
        .collect();
    (shares, known)
}

impl Layer for TradeFlowStage {
    fn kind(&self) -> LayerKind {
        LayerKind::TradeFlow
    }

    fn required_inputs(&self) -> &'static [&'static str] {
        REQUIRED
    }

    fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    fn fit(&mut self, data: &TrainingSet, version: u32) -> Result<TrainingResult, LayerError> {
        self.core.fit(data, version, Self::row)
    }

    fn fork(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }

    fn confidence_floor(&self) -> Confidence {
        self.core.floor(ASSUMED_SHARES_SCALE * THIN_VOLUME_SCALE)
    }

    fn predict(&self, input: &LayerInput) -> Result<LayerResult, LayerError> {
        self.ensure_inputs(input)?;
        let row = Self::row(input)?;
        let (rate, severity, elasticity) = (row[0], row[1], row[2]);
        let volume = input.number("trade_volume")?;
        let estimate = self
            .core
            .estimate(&row, || -elasticity.mul_add(rate, 0.05 * severity))?;
        let delta = estimate.value.clamp(-1.0, 1.0);
        let (shares, known) = partner_shares(input);
        #[allow(clippy::cast_precision_loss)]
        let n = shares.len() as f64;
        let partner_deltas: IndexMap<String, f64> = shares
            .iter()
            .map(|(name, share)| (name.clone(), (delta * share * n).clamp(-1.0, 1.0)))
            .collect();
        let aggregate_delta = shares
            .iter()
            .map(|(name, share)| share * partner_deltas[name])
            .sum::<f64>();
        let mut confidence = estimate.confidence;
        let mut result_notes = Vec::new();
        if !known {
            confidence = confidence.scaled(ASSUMED_SHARES_SCALE);
            result_notes.push("partner shares assumed equal".to_string());
        }
        if volume < THIN_VOLUME {
            confidence = confidence.scaled(THIN_VOLUME_SCALE);
            result_notes.push(format!("thin trade base ({volume})"));
        }
        if !estimate.fitted {
            result_notes.push("rule coefficients".into());
        }
        let result = result_notes.into_iter().fold(
            LayerResult::computed(
                Prediction::TradeFlow {
                    partner_deltas,
                    aggregate_delta,
                },
                confidence,
            ),
            |result, note| result.with_note(note),
        );
        Ok(result)
    }

    fn metadata(&self) -> Option<&TrainingResult> {
        self.core.metadata()
    }
}
