use indexmap::IndexMap;

use crate::{
    contract::{Layer, TrainingResult, TrainingSet},
    error::LayerError,
    input::LayerInput,
    result::{Confidence, LayerKind, LayerResult, Prediction},
};

use super::StageCore;

const REQUIRED: &[&str] = &["trade_flow_delta", "sector_exposure"];
const TRAINING_KEYS: &[&str] = &["trade_flow_delta", "exposure"];
const MIN_SAMPLES: usize = 8;
const EMPTY_EXPOSURE_SCALE: f64 = 0.5;

/// Translates a trade shock into per-sector output changes.
///
/// Training samples describe one sector each (`trade_flow_delta`, `exposure`);
/// prediction applies the fitted response to every sector in the exposure vector.
#[derive(Debug, Clone)]
pub struct IndustryResponseStage {
    core: StageCore,
}

impl IndustryResponseStage {
    /// Stage answering from pass-through rules until fitted.
    #[must_use]
    pub const fn rule_based() -> Self {
        Self {
            core: StageCore::new(LayerKind::IndustryResponse, TRAINING_KEYS, MIN_SAMPLES, true),
        }
    }

    /// Stage that is not ready until fitted.
    #[must_use]
    pub const fn untrained() -> Self {
        Self {
            core: StageCore::new(LayerKind::IndustryResponse, TRAINING_KEYS, MIN_SAMPLES, false),
        }
    }

    fn row(input: &LayerInput) -> Result<Vec<f64>, LayerError> {
        Ok(vec![input.number("trade_flow_delta")?, input.number("exposure")?])
    }
}

impl Layer for IndustryResponseStage {
    fn kind(&self) -> LayerKind {
        LayerKind::IndustryResponse
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
        self.core.floor(EMPTY_EXPOSURE_SCALE)
    }

    fn predict(&self, input: &LayerInput) -> Result<LayerResult, LayerError> {
        self.ensure_inputs(input)?;
        let delta = input.number("trade_flow_delta")?;
        let exposure = input.vector("sector_exposure")?;
        let mut sector_impacts = IndexMap::with_capacity(exposure.len());
        let mut confidence = None;
        let mut fitted = false;
        for (sector, weight) in exposure {
            let estimate = self
                .core
                .estimate(&[delta, *weight], || 1.5 * delta * weight)?;
            confidence = Some(estimate.confidence);
            fitted = estimate.fitted;
            sector_impacts.insert(sector.clone(), estimate.value.clamp(-1.0, 1.0));
        }
        let Some(confidence) = confidence else {
            let baseline = self.core.estimate(&[delta, 0.0], || 0.0)?;
            return Ok(LayerResult::computed(
                Prediction::IndustryResponse {
                    sector_impacts,
                    mean_impact: 0.0,
                },
                baseline.confidence.scaled(EMPTY_EXPOSURE_SCALE),
            )
            .with_note("empty sector exposure"));
        };
        #[allow(clippy::cast_precision_loss)]
        let mean_impact = sector_impacts.values().sum::<f64>() / sector_impacts.len() as f64;
        let mut result = LayerResult::computed(
            Prediction::IndustryResponse {
                sector_impacts,
                mean_impact,
            },
            confidence,
        );
        if !fitted {
            result = result.with_note("rule coefficients");
        }
        Ok(result)
    }

    fn metadata(&self) -> Option<&TrainingResult> {
        self.core.metadata()
    }
}
