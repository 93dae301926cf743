use crate::{
    contract::{Layer, TrainingResult, TrainingSet},
    error::LayerError,
    input::LayerInput,
    result::{Confidence, LayerKind, LayerResult, Prediction},
};

use super::StageCore;

const REQUIRED: &[&str] = &["sector_impact", "firm_leverage", "labor_intensity"];
const MIN_SAMPLES: usize = 8;

/// Employment hazard and margin pressure for firms in the affected sectors.
#[derive(Debug, Clone)]
pub struct FirmImpactStage {
    core: StageCore,
}

impl FirmImpactStage {
    /// Stage answering from hazard rules until fitted.
    #[must_use]
    pub const fn rule_based() -> Self {
        Self {
            core: StageCore::new(LayerKind::FirmImpact, REQUIRED, MIN_SAMPLES, true),
        }
    }

    /// Stage that is not ready until fitted.
    #[must_use]
    pub const fn untrained() -> Self {
        Self {
            core: StageCore::new(LayerKind::FirmImpact, REQUIRED, MIN_SAMPLES, false),
        }
    }

    fn row(input: &LayerInput) -> Result<Vec<f64>, LayerError> {
        Ok(vec![
            input.number("sector_impact")?,
            input.number("firm_leverage")?,
            input.number("labor_intensity")?,
        ])
    }
}

impl Layer for FirmImpactStage {
    fn kind(&self) -> LayerKind {
        LayerKind::FirmImpact
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
        let (impact, leverage, labor) = (row[0], row[1], row[2]);
        let estimate = self.core.estimate(&row, || {
            0.1f64.mul_add(labor, 0.2f64.mul_add(leverage, 0.6f64.mul_add(-impact, 0.05)))
        })?;
        let hazard = estimate.value.clamp(0.0, 1.0);
        let layoff_share = hazard * labor.clamp(0.0, 1.0) * 0.5;
        let margin_compression =
            (-impact * 0.5f64.mul_add(-leverage.clamp(0.0, 1.0), 1.0)).max(0.0);
        let mut result = LayerResult::computed(
            Prediction::FirmImpact {
                employment_hazard: hazard,
                layoff_share,
                margin_compression,
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
