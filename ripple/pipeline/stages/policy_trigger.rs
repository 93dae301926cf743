use crate::{
    contract::{Layer, TrainingResult, TrainingSet},
    error::LayerError,
    input::LayerInput,
    result::{Confidence, LayerKind, LayerResult, Prediction},
};

use super::StageCore;

const REQUIRED: &[&str] = &["policy_text", "tariff_rate"];
const MIN_SAMPLES: usize = 10;

/// Word stems signalling an aggressive or broad measure.
const ESCALATION_STEMS: &[&str] = &[
    "tariff",
    "duty",
    "duties",
    "levy",
    "sanction",
    "retaliat",
    "ban",
    "quota",
    "embargo",
    "countermeasure",
    "escalat",
    "immediate",
    "punitive",
    "surcharge",
];

const RETALIATION_STEMS: &[&str] = &["retaliat", "countermeasure", "reciprocal"];

/// Announcements shorter than this many words get a confidence haircut.
const SHORT_TEXT_WORDS: usize = 5;
/// Confidence factor for announcements shorter than that.
const SHORT_TEXT_SCALE: f64 = 0.8;

/// Lexicon summary of an announcement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextSignal {
    /// Share of escalation vocabulary, saturating at four hits.
    pub intensity: f64,
    /// Whether the text talks about retaliation.
    pub mentions_retaliation: bool,
    /// Number of words.
    pub words: usize,
}

impl TextSignal {
    /// Scores `text` against the escalation lexicon.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(text: &str) -> Self {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect();
        let hits = words
            .iter()
            .filter(|word| ESCALATION_STEMS.iter().any(|stem| word.starts_with(stem)))
            .count();
        let mentions_retaliation = words
            .iter()
            .any(|word| RETALIATION_STEMS.iter().any(|stem| word.starts_with(stem)));
        Self {
            intensity: (hits as f64 / 4.0).min(1.0),
            mentions_retaliation,
            words: words.len(),
        }
    }
}

/// Maps announcement text and rate to a policy severity signal.
#[derive(Debug, Clone)]
pub struct PolicyTriggerStage {
    core: StageCore,
}

impl PolicyTriggerStage {
    /// Stage answering from lexicon rules until fitted.
    #[must_use]
    pub const fn rule_based() -> Self {
        Self {
            core: StageCore::new(LayerKind::PolicyTrigger, REQUIRED, MIN_SAMPLES, true),
        }
    }

    /// Stage that is not ready until fitted.
    #[must_use]
    pub const fn untrained() -> Self {
        Self {
            core: StageCore::new(LayerKind::PolicyTrigger, REQUIRED, MIN_SAMPLES, false),
        }
    }

    fn row(input: &LayerInput) -> Result<Vec<f64>, LayerError> {
        let rate = input.number("tariff_rate")?;
        let signal = TextSignal::score(input.text("policy_text")?);
        Ok(vec![rate, signal.intensity])
    }
}

impl Layer for PolicyTriggerStage {
    fn kind(&self) -> LayerKind {
        LayerKind::PolicyTrigger
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
        self.core.floor(SHORT_TEXT_SCALE)
    }

    fn predict(&self, input: &LayerInput) -> Result<LayerResult, LayerError> {
        self.ensure_inputs(input)?;
        let rate = input.number("tariff_rate")?;
        let signal = TextSignal::score(input.text("policy_text")?);
        let estimate = self.core.estimate(&[rate, signal.intensity], || {
            0.4f64.mul_add(signal.intensity, 1.2f64.mul_add(rate, 0.2))
        })?;
        let severity = estimate.value.clamp(0.0, 1.0);
        let escalation = (severity * 0.4f64.mul_add(signal.intensity, 0.6)).clamp(0.0, 1.0);
        let retaliation = 0.5f64
            .mul_add(severity, if signal.mentions_retaliation { 0.3 } else { 0.0 })
            .clamp(0.0, 1.0);
        let mut confidence = estimate.confidence;
        let mut notes = Vec::new();
        if signal.words < SHORT_TEXT_WORDS {
            confidence = confidence.scaled(SHORT_TEXT_SCALE);
            notes.push(format!("short announcement ({} words)", signal.words));
        }
        let mut result = LayerResult::computed(
            Prediction::PolicyTrigger {
                severity,
                escalation_probability: escalation,
                retaliation_risk: retaliation,
            },
            confidence,
        );
        if !estimate.fitted {
            result = result.with_note("rule coefficients");
        }
        for note in notes {
            result = result.with_note(note);
        }
        Ok(result)
    }

    fn metadata(&self) -> Option<&TrainingResult> {
        self.core.metadata()
    }
}
