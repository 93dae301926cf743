//! Reference stage implementations behind the layer contract.

/// Consumer price-impact stage.
pub mod consumer_impact;
/// Firm-level impact stage.
pub mod firm_impact;
/// Geopolitical and social reaction stage.
pub mod geopolitical;
/// Industry response stage.
pub mod industry_response;
/// Linear regressor shared by the stages.
pub mod linear;
/// Announcement severity stage.
pub mod policy_trigger;
/// Bilateral trade-flow stage.
pub mod trade_flow;

pub use consumer_impact::ConsumerImpactStage;
pub use firm_impact::FirmImpactStage;
pub use geopolitical::GeopoliticalStage;
pub use industry_response::IndustryResponseStage;
pub use linear::{FitMetrics, LinearModel};
pub use policy_trigger::PolicyTriggerStage;
pub use trade_flow::TradeFlowStage;

use indexmap::IndexMap;

use crate::{
    contract::{Layer, TrainingResult, TrainingSet},
    error::LayerError,
    input::LayerInput,
    result::{Confidence, LayerKind},
};

/// Confidence of a stage answering from its rule coefficients.
pub const RULE_CONFIDENCE: f64 = 0.5;
/// Confidence of a fitted model with no explanatory power; `r2` adds up to 0.45.
pub const FITTED_BASE_CONFIDENCE: f64 = 0.55;

/// Every stage running on rule coefficients until fitted.
#[must_use]
pub fn reference_stages() -> Vec<Box<dyn Layer>> {
    vec![
        Box::new(PolicyTriggerStage::rule_based()),
        Box::new(TradeFlowStage::rule_based()),
        Box::new(IndustryResponseStage::rule_based()),
        Box::new(FirmImpactStage::rule_based()),
        Box::new(ConsumerImpactStage::rule_based()),
        Box::new(GeopoliticalStage::rule_based()),
    ]
}

/// Every stage without rules; none is ready until fitted.
#[must_use]
pub fn untrained_stages() -> Vec<Box<dyn Layer>> {
    vec![
        Box::new(PolicyTriggerStage::untrained()),
        Box::new(TradeFlowStage::untrained()),
        Box::new(IndustryResponseStage::untrained()),
        Box::new(FirmImpactStage::untrained()),
        Box::new(ConsumerImpactStage::untrained()),
        Box::new(GeopoliticalStage::untrained()),
    ]
}

/// Headline value and its confidence, before a stage shapes the prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Estimate {
    pub(crate) value: f64,
    pub(crate) confidence: Confidence,
    pub(crate) fitted: bool,
}

/// Model bookkeeping shared by the reference stages.
///
/// A fitted regressor takes precedence over the rule coefficients. Fitting
/// commits the new model and its metadata together, only after success.
#[derive(Debug, Clone)]
pub(crate) struct StageCore {
    kind: LayerKind,
    training_keys: &'static [&'static str],
    min_samples: usize,
    rule_based: bool,
    model: Option<(LinearModel, f64)>,
    metadata: Option<TrainingResult>,
}

impl StageCore {
    pub(crate) const fn new(
        kind: LayerKind,
        training_keys: &'static [&'static str],
        min_samples: usize,
        rule_based: bool,
    ) -> Self {
        Self {
            kind,
            training_keys,
            min_samples,
            rule_based,
            model: None,
            metadata: None,
        }
    }

    pub(crate) const fn is_ready(&self) -> bool {
        self.rule_based || self.model.is_some()
    }

    pub(crate) const fn metadata(&self) -> Option<&TrainingResult> {
        self.metadata.as_ref()
    }

    /// Fits on rows extracted by `row` from every sample.
    pub(crate) fn fit(
        &mut self,
        data: &TrainingSet,
        version: u32,
        row: impl Fn(&LayerInput) -> Result<Vec<f64>, LayerError>,
    ) -> Result<TrainingResult, LayerError> {
        data.ensure_size(self.kind, self.min_samples)?;
        data.ensure_schema(self.kind, self.training_keys)?;
        let mut rows = Vec::with_capacity(data.len());
        let mut targets = Vec::with_capacity(data.len());
        for (idx, sample) in data.samples().iter().enumerate() {
            let features = row(&sample.as_input(self.kind)).map_err(|err| LayerError::Schema {
                layer: self.kind,
                detail: format!("sample {idx}: {err}"),
            })?;
            if features.iter().any(|value| !value.is_finite()) {
                return Err(LayerError::Schema {
                    layer: self.kind,
                    detail: format!("sample {idx} has non-finite features"),
                });
            }
            rows.push(features);
            targets.push(sample.target);
        }
        let (model, metrics) =
            LinearModel::fit(&rows, &targets, linear::LEARNING_RATE, linear::EPOCHS).map_err(
                |detail| LayerError::StageFault {
                    layer: self.kind,
                    detail,
                },
            )?;
        let window = data.window().ok_or(LayerError::InsufficientData {
            layer: self.kind,
            available: 0,
            required: self.min_samples,
        })?;
        let result = TrainingResult {
            layer: self.kind,
            version,
            window,
            samples: data.len(),
            metrics: IndexMap::from([
                ("mse".to_string(), metrics.mse),
                ("r2".to_string(), metrics.r2),
            ]),
            fitted_at: chrono::Utc::now(),
        };
        let confidence = 0.45f64.mul_add(metrics.r2.clamp(0.0, 1.0), FITTED_BASE_CONFIDENCE);
        self.model = Some((model, confidence));
        self.metadata = Some(result.clone());
        tracing::debug!(
            layer = %self.kind,
            version,
            mse = metrics.mse,
            r2 = metrics.r2,
            "stage fitted"
        );
        Ok(result)
    }

    /// Lowest confidence `estimate` can return, times the stage's worst-case
    /// penalty factor.
    pub(crate) fn floor(&self, worst_case_scale: f64) -> Confidence {
        let base = if self.rule_based {
            RULE_CONFIDENCE.min(FITTED_BASE_CONFIDENCE)
        } else {
            FITTED_BASE_CONFIDENCE
        };
        Confidence::clamped(base * worst_case_scale)
    }

    /// Headline from the fitted model, else from `rule`.
    pub(crate) fn estimate(
        &self,
        row: &[f64],
        rule: impl FnOnce() -> f64,
    ) -> Result<Estimate, LayerError> {
        let (value, confidence, fitted) = match &self.model {
            Some((model, confidence)) => {
                let value = model.predict(row).ok_or_else(|| LayerError::StageFault {
                    layer: self.kind,
                    detail: format!("model expects a different width than {}", row.len()),
                })?;
                (value, *confidence, true)
            }
            None if self.rule_based => (rule(), RULE_CONFIDENCE, false),
            None => {
                return Err(LayerError::StageFault {
                    layer: self.kind,
                    detail: "no fitted model or rule set".into(),
                })
            }
        };
        if !value.is_finite() {
            return Err(LayerError::StageFault {
                layer: self.kind,
                detail: "non-finite estimate".into(),
            });
        }
        Ok(Estimate {
            value,
            confidence: Confidence::clamped(confidence),
            fitted,
        })
    }
}
