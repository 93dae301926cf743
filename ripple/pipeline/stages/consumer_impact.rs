use crate::{
    contract::{Layer, TrainingResult, TrainingSet},
    error::LayerError,
    input::LayerInput,
    result::{Confidence, LayerKind, LayerResult, Prediction, PRICE_HORIZON_MONTHS},
};

use super::StageCore;

const REQUIRED: &[&str] = &["tariff_rate", "employment_hazard", "pass_through_rate"];
const MIN_SAMPLES: usize = 8;

/// Months for prices to move about two thirds of the way to their peak.
const PASS_THROUGH_TAU: f64 = 3.0;

/// Cumulative consumer price change over the horizon.
#[derive(Debug, Clone)]
pub struct ConsumerImpactStage {
    core: StageCore,
}

impl ConsumerImpactStage {
    /// Stage answering from pass-through rules until fitted.
    #[must_use]
    pub const fn rule_based() -> Self {
        Self {
            core: StageCore::new(LayerKind::ConsumerImpact, REQUIRED, MIN_SAMPLES, true),
        }
    }

    /// Stage that is not ready until fitted.
    #[must_use]
    pub const fn untrained() -> Self {
        Self {
            core: StageCore::new(LayerKind::ConsumerImpact, REQUIRED, MIN_SAMPLES, false),
        }
    }

    fn row(input: &LayerInput) -> Result<Vec<f64>, LayerError> {
        Ok(vec![
            input.number("tariff_rate")?,
            input.number("employment_hazard")?,
            input.number("pass_through_rate")?,
        ])
    }
}

/// Path that rises exponentially and reaches `peak` in the final month.
#[allow(clippy::cast_precision_loss)]
fn price_path(peak: f64) -> Vec<f64> {
    let horizon = PRICE_HORIZON_MONTHS as f64;
    let norm = 1.0 - (-horizon / PASS_THROUGH_TAU).exp();
    (1..=PRICE_HORIZON_MONTHS)
        .map(|month| peak * (1.0 - (-(month as f64) / PASS_THROUGH_TAU).exp()) / norm)
        .collect()
}

impl Layer for ConsumerImpactStage {
    fn kind(&self) -> LayerKind {
        LayerKind::ConsumerImpact
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
        self.core.floor(1.0)
    }

    fn predict(&self, input: &LayerInput) -> Result<LayerResult, LayerError> {
        self.ensure_inputs(input)?;
        let row = Self::row(input)?;
        let (rate, hazard, pass_through) = (row[0], row[1], row[2]);
        let estimate = self
            .core
            .estimate(&row, || (rate * pass_through).mul_add(0.6, 0.02 * hazard))?;
        let peak = estimate.value.max(-1.0);
        let mut result = LayerResult::computed(
            Prediction::ConsumerImpact {
                price_path: price_path(peak),
                peak_price_change: peak,
            },
            estimate.confidence,
        );
        if !estimate.fitted {
            result = result.with_note("rule coefficients");
        }
        Ok(result)
    }

    fn metadata(&self) -> Option<&TrainingResult> {
        self.core.metadata()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{input::FeatureValue, stages::fixtures::training_set};

    fn input() -> LayerInput {
        LayerInput::new(LayerKind::ConsumerImpact)
            .with("tariff_rate", 0.25)
            .with("employment_hazard", 0.3)
            .with("pass_through_rate", 0.6)
    }

    #[test]
    fn path_rises_to_peak() {
        let stage = ConsumerImpactStage::rule_based();
        let result = stage.predict(&input()).unwrap();
        let Prediction::ConsumerImpact {
            price_path,
            peak_price_change,
        } = result.prediction()
        else {
            panic!("wrong prediction kind");
        };
        assert_eq!(price_path.len(), PRICE_HORIZON_MONTHS);
        assert!(price_path.windows(2).all(|w| w[1] >= w[0]));
        assert!((price_path[PRICE_HORIZON_MONTHS - 1] - peak_price_change).abs() < 1e-12);
        assert!((peak_price_change - 0.096).abs() < 1e-9);
    }

    #[test]
    fn refit_bumps_version_and_keeps_determinism() {
        let mut stage = ConsumerImpactStage::untrained();
        let data = training_set(
            10,
            |x| {
                vec![
                    ("tariff_rate", FeatureValue::Number(x)),
                    ("employment_hazard", FeatureValue::Number(0.2)),
                    ("pass_through_rate", FeatureValue::Number(0.5)),
                ]
            },
            |x| 0.3 * x,
        );
        stage.fit(&data, 1).unwrap();
        stage.fit(&data, 2).unwrap();
        assert_eq!(stage.metadata().unwrap().version, 2);
        let first = stage.predict(&input()).unwrap();
        assert_eq!(first, stage.predict(&input()).unwrap());
    }
}
