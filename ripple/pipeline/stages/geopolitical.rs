use crate::{
    contract::{Layer, TrainingResult, TrainingSet},
    error::LayerError,
    input::LayerInput,
    result::{Confidence, LayerKind, LayerResult, Prediction},
};

use super::StageCore;

const REQUIRED: &[&str] = &["price_pressure", "policy_severity", "sentiment_baseline"];
const MIN_SAMPLES: usize = 8;

/// Social response and diplomatic tension.
#[derive(Debug, Clone)]
pub struct GeopoliticalStage {
    core: StageCore,
}

impl GeopoliticalStage {
    /// Stage answering from sentiment rules until fitted.
    #[must_use]
    pub const fn rule_based() -> Self {
        Self {
            core: StageCore::new(LayerKind::Geopolitical, REQUIRED, MIN_SAMPLES, true),
        }
    }

    /// Stage that is not ready until fitted.
    #[must_use]
    pub const fn untrained() -> Self {
        Self {
            core: StageCore::new(LayerKind::Geopolitical, REQUIRED, MIN_SAMPLES, false),
        }
    }

    fn row(input: &LayerInput) -> Result<Vec<f64>, LayerError> {
        Ok(vec![
            input.number("price_pressure")?,
            input.number("policy_severity")?,
            input.number("sentiment_baseline")?,
        ])
    }
}

impl Layer for GeopoliticalStage {
    fn kind(&self) -> LayerKind {
        LayerKind::Geopolitical
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
        let (pressure, severity, baseline) = (row[0], row[1], row[2]);
        let estimate = self.core.estimate(&row, || {
            0.3f64.mul_add(severity, 2.0f64.mul_add(pressure, 0.3 * baseline))
        })?;
        let social = estimate.value.clamp(0.0, 1.0);
        // upstream retaliation risk sharpens tension when the trigger layer produced one
        let retaliation = input.number_or("retaliation_risk", 0.0).clamp(0.0, 1.0);
        let tension = 0.1f64
            .mul_add(retaliation, 0.6f64.mul_add(social, 0.4 * severity))
            .clamp(0.0, 1.0);
        let mut result = LayerResult::computed(
            Prediction::Geopolitical {
                social_response: social,
                tension_index: tension,
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

    fn input(pressure: f64) -> LayerInput {
        LayerInput::new(LayerKind::Geopolitical)
            .with("price_pressure", pressure)
            .with("policy_severity", 0.6)
            .with("sentiment_baseline", 0.2)
    }

    #[test]
    fn price_pressure_drives_social_response() {
        let stage = GeopoliticalStage::rule_based();
        let mild = stage.predict(&input(0.01)).unwrap();
        let severe = stage.predict(&input(0.1)).unwrap();
        assert!(severe.prediction().headline() > mild.prediction().headline());
        assert!((severe.prediction().headline() - 0.44).abs() < 1e-9);
    }

    #[test]
    fn retaliation_raises_tension() {
        let stage = GeopoliticalStage::rule_based();
        let calm = stage.predict(&input(0.05)).unwrap();
        let heated = stage
            .predict(&input(0.05).with("retaliation_risk", 0.8))
            .unwrap();
        let tension = |result: &LayerResult| match result.prediction() {
            Prediction::Geopolitical { tension_index, .. } => *tension_index,
            other => panic!("unexpected {other:?}"),
        };
        assert!(tension(&heated) > tension(&calm));
    }
}
