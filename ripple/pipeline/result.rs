use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    context::{DegradationLedger, StateTransition},
    error::PipelineError,
    event::PolicyEvent,
    input::FeatureValue,
};

/// Months covered by a consumer price-impact path.
pub const PRICE_HORIZON_MONTHS: usize = 12;

/// The six pipeline layers, in traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Announcement text to policy severity.
    PolicyTrigger,
    /// Bilateral trade-flow disruption.
    TradeFlow,
    /// Sectoral response.
    IndustryResponse,
    /// Firm-level employment and margin effects.
    FirmImpact,
    /// Consumer price effects.
    ConsumerImpact,
    /// Geopolitical and social reaction.
    Geopolitical,
}

impl LayerKind {
    /// Fixed traversal order.
    pub const ORDER: [Self; 6] = [
        Self::PolicyTrigger,
        Self::TradeFlow,
        Self::IndustryResponse,
        Self::FirmImpact,
        Self::ConsumerImpact,
        Self::Geopolitical,
    ];

    /// Stable snake-case name used in config files and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PolicyTrigger => "policy_trigger",
            Self::TradeFlow => "trade_flow",
            Self::IndustryResponse => "industry_response",
            Self::FirmImpact => "firm_impact",
            Self::ConsumerImpact => "consumer_impact",
            Self::Geopolitical => "geopolitical",
        }
    }

    /// Zero-based position in [`LayerKind::ORDER`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Layer preceding this one, if any.
    #[must_use]
    pub fn predecessor(self) -> Option<Self> {
        self.index().checked_sub(1).map(|idx| Self::ORDER[idx])
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LayerKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ORDER
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| PipelineError::UnknownLayer(s.to_string()))
    }
}

/// Confidence score guaranteed to be finite and within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Confidence(f64);

impl Confidence {
    /// Full confidence.
    pub const ONE: Self = Self(1.0);
    /// No confidence.
    pub const ZERO: Self = Self(0.0);

    /// Returns `None` unless `value` is finite and within `[0, 1]`.
    #[must_use]
    pub fn new(value: f64) -> Option<Self> {
        (value.is_finite() && (0.0..=1.0).contains(&value)).then_some(Self(value))
    }

    /// Clamps into range; NaN maps to zero.
    #[must_use]
    pub fn clamped(value: f64) -> Self {
        if value.is_nan() {
            Self::ZERO
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    /// Raw score.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    /// Caps the score at `ceiling`.
    #[must_use]
    pub fn capped(self, ceiling: f64) -> Self {
        Self::clamped(self.0.min(ceiling))
    }

    /// Multiplies the score by `factor`, clamped.
    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        Self::clamped(self.0 * factor)
    }
}

impl TryFrom<f64> for Confidence {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("confidence {value} outside [0, 1]"))
    }
}

impl From<Confidence> for f64 {
    fn from(value: Confidence) -> Self {
        value.0
    }
}

/// Outcome classification of a single layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    /// Primary model produced the output.
    Computed,
    /// A fallback produced the output.
    Degraded,
    /// No usable output; neutral placeholder.
    Skipped,
    /// Stage fault with no recovery.
    Failed,
}

impl LayerStatus {
    /// True when the status carries a defined confidence.
    #[must_use]
    pub const fn has_confidence(self) -> bool {
        matches!(self, Self::Computed | Self::Degraded)
    }
}

/// Where a layer's output came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    /// The stage's own model or rule set.
    Primary,
    /// A prior Computed result reused from cache.
    CachedResult {
        /// Age of the cached result in seconds.
        age_secs: i64,
    },
    /// Rule-based extrapolation from the tariff rate.
    Heuristic,
    /// Neutral placeholder for skipped or failed layers.
    Neutral,
}

/// Typed output of a layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum Prediction {
    /// Policy severity signal.
    PolicyTrigger {
        /// Severity in `[0, 1]`.
        severity: f64,
        /// Probability of further escalation.
        escalation_probability: f64,
        /// Risk of retaliatory measures.
        retaliation_risk: f64,
    },
    /// Fractional change in bilateral trade volume.
    TradeFlow {
        /// Per-partner fractional deltas.
        partner_deltas: IndexMap<String, f64>,
        /// Volume-weighted aggregate delta.
        aggregate_delta: f64,
    },
    /// Sectoral impact vector.
    IndustryResponse {
        /// Impact per sector (negative means contraction).
        sector_impacts: IndexMap<String, f64>,
        /// Mean sector impact.
        mean_impact: f64,
    },
    /// Firm-level effects.
    FirmImpact {
        /// Employment hazard in `[0, 1]`.
        employment_hazard: f64,
        /// Expected share of workforce laid off.
        layoff_share: f64,
        /// Operating-margin compression.
        margin_compression: f64,
    },
    /// Consumer price effects.
    ConsumerImpact {
        /// Cumulative price change per month.
        price_path: Vec<f64>,
        /// Largest cumulative price change.
        peak_price_change: f64,
    },
    /// Social and geopolitical reaction.
    Geopolitical {
        /// Social-response score in `[0, 1]`.
        social_response: f64,
        /// Diplomatic tension index in `[0, 1]`.
        tension_index: f64,
    },
}

impl Prediction {
    /// Layer this prediction belongs to.
    #[must_use]
    pub const fn kind(&self) -> LayerKind {
        match self {
            Self::PolicyTrigger { .. } => LayerKind::PolicyTrigger,
            Self::TradeFlow { .. } => LayerKind::TradeFlow,
            Self::IndustryResponse { .. } => LayerKind::IndustryResponse,
            Self::FirmImpact { .. } => LayerKind::FirmImpact,
            Self::ConsumerImpact { .. } => LayerKind::ConsumerImpact,
            Self::Geopolitical { .. } => LayerKind::Geopolitical,
        }
    }

    /// Zero-effect prediction used for skipped or failed layers.
    #[must_use]
    pub fn neutral(kind: LayerKind) -> Self {
        match kind {
            LayerKind::PolicyTrigger => Self::PolicyTrigger {
                severity: 0.0,
                escalation_probability: 0.0,
                retaliation_risk: 0.0,
            },
            LayerKind::TradeFlow => Self::TradeFlow {
                partner_deltas: IndexMap::new(),
                aggregate_delta: 0.0,
            },
            LayerKind::IndustryResponse => Self::IndustryResponse {
                sector_impacts: IndexMap::new(),
                mean_impact: 0.0,
            },
            LayerKind::FirmImpact => Self::FirmImpact {
                employment_hazard: 0.0,
                layoff_share: 0.0,
                margin_compression: 0.0,
            },
            LayerKind::ConsumerImpact => Self::ConsumerImpact {
                price_path: vec![0.0; PRICE_HORIZON_MONTHS],
                peak_price_change: 0.0,
            },
            LayerKind::Geopolitical => Self::Geopolitical {
                social_response: 0.0,
                tension_index: 0.0,
            },
        }
    }

    /// Shapes a single headline value into the layer's prediction.
    ///
    /// Used by heuristic fallbacks, which only estimate one scalar per layer.
    #[must_use]
    pub fn from_headline(kind: LayerKind, value: f64, event: &PolicyEvent) -> Self {
        let value = if value.is_finite() { value } else { 0.0 };
        match kind {
            LayerKind::PolicyTrigger => {
                let severity = value.clamp(0.0, 1.0);
                Self::PolicyTrigger {
                    severity,
                    escalation_probability: severity * 0.5,
                    retaliation_risk: severity * 0.4,
                }
            }
            LayerKind::TradeFlow => Self::TradeFlow {
                partner_deltas: event
                    .target_countries()
                    .iter()
                    .map(|country| (country.clone(), value))
                    .collect(),
                aggregate_delta: value,
            },
            LayerKind::IndustryResponse => {
                let sector = event.sector().unwrap_or("all_sectors").to_string();
                Self::IndustryResponse {
                    sector_impacts: IndexMap::from([(sector, value)]),
                    mean_impact: value,
                }
            }
            LayerKind::FirmImpact => {
                let hazard = value.clamp(0.0, 1.0);
                Self::FirmImpact {
                    employment_hazard: hazard,
                    layoff_share: hazard * 0.35,
                    margin_compression: hazard * 0.5,
                }
            }
            LayerKind::ConsumerImpact => {
                #[allow(clippy::cast_precision_loss)]
                let price_path = (1..=PRICE_HORIZON_MONTHS)
                    .map(|month| value * month as f64 / PRICE_HORIZON_MONTHS as f64)
                    .collect();
                Self::ConsumerImpact {
                    price_path,
                    peak_price_change: value,
                }
            }
            LayerKind::Geopolitical => {
                let social = value.clamp(0.0, 1.0);
                Self::Geopolitical {
                    social_response: social,
                    tension_index: social * 0.8,
                }
            }
        }
    }

    /// Single scalar summarising the prediction.
    #[must_use]
    pub fn headline(&self) -> f64 {
        match self {
            Self::PolicyTrigger { severity, .. } => *severity,
            Self::TradeFlow {
                aggregate_delta, ..
            } => *aggregate_delta,
            Self::IndustryResponse { mean_impact, .. } => *mean_impact,
            Self::FirmImpact {
                employment_hazard, ..
            } => *employment_hazard,
            Self::ConsumerImpact {
                peak_price_change, ..
            } => *peak_price_change,
            Self::Geopolitical {
                social_response, ..
            } => *social_response,
        }
    }

    /// Features handed to downstream layers.
    #[must_use]
    pub fn exports(&self) -> IndexMap<String, FeatureValue> {
        let mut out = IndexMap::new();
        match self {
            Self::PolicyTrigger {
                severity,
                escalation_probability,
                retaliation_risk,
            } => {
                out.insert("policy_severity".into(), FeatureValue::Number(*severity));
                out.insert(
                    "escalation_probability".into(),
                    FeatureValue::Number(*escalation_probability),
                );
                out.insert("retaliation_risk".into(), FeatureValue::Number(*retaliation_risk));
            }
            Self::TradeFlow {
                partner_deltas,
                aggregate_delta,
            } => {
                out.insert("trade_flow_delta".into(), FeatureValue::Number(*aggregate_delta));
                out.insert(
                    "partner_deltas".into(),
                    FeatureValue::Vector(partner_deltas.clone()),
                );
            }
            Self::IndustryResponse {
                sector_impacts,
                mean_impact,
            } => {
                out.insert("sector_impact".into(), FeatureValue::Number(*mean_impact));
                out.insert(
                    "sector_impacts".into(),
                    FeatureValue::Vector(sector_impacts.clone()),
                );
            }
            Self::FirmImpact {
                employment_hazard,
                layoff_share,
                margin_compression,
            } => {
                out.insert("employment_hazard".into(), FeatureValue::Number(*employment_hazard));
                out.insert("layoff_share".into(), FeatureValue::Number(*layoff_share));
                out.insert(
                    "margin_compression".into(),
                    FeatureValue::Number(*margin_compression),
                );
            }
            Self::ConsumerImpact {
                price_path,
                peak_price_change,
            } => {
                out.insert("price_pressure".into(), FeatureValue::Number(*peak_price_change));
                out.insert("price_path".into(), FeatureValue::Series(price_path.clone()));
            }
            Self::Geopolitical {
                social_response,
                tension_index,
            } => {
                out.insert("social_response".into(), FeatureValue::Number(*social_response));
                out.insert("tension_index".into(), FeatureValue::Number(*tension_index));
            }
        }
        out
    }
}

/// Output of one layer.
///
/// Constructors enforce that confidence is present exactly when the status is
/// `Computed` or `Degraded`; deserialization applies the same checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LayerResultDraft")]
pub struct LayerResult {
    layer: LayerKind,
    status: LayerStatus,
    confidence: Option<Confidence>,
    prediction: Prediction,
    source: DataSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    notes: Vec<String>,
}

impl LayerResult {
    /// Result produced by a stage's primary path.
    #[must_use]
    pub fn computed(prediction: Prediction, confidence: Confidence) -> Self {
        Self {
            layer: prediction.kind(),
            status: LayerStatus::Computed,
            confidence: Some(confidence),
            prediction,
            source: DataSource::Primary,
            notes: Vec::new(),
        }
    }

    /// Result produced by a fallback strategy.
    #[must_use]
    pub fn degraded(
        prediction: Prediction,
        confidence: Confidence,
        source: DataSource,
        note: impl Into<String>,
    ) -> Self {
        Self {
            layer: prediction.kind(),
            status: LayerStatus::Degraded,
            confidence: Some(confidence),
            prediction,
            source,
            notes: vec![note.into()],
        }
    }

    /// Neutral placeholder for a layer with no usable output.
    #[must_use]
    pub fn skipped(layer: LayerKind, note: impl Into<String>) -> Self {
        Self::placeholder(layer, LayerStatus::Skipped, note.into())
    }

    /// Neutral placeholder for a layer whose stage faulted.
    #[must_use]
    pub fn failed(layer: LayerKind, note: impl Into<String>) -> Self {
        Self::placeholder(layer, LayerStatus::Failed, note.into())
    }

    fn placeholder(layer: LayerKind, status: LayerStatus, note: String) -> Self {
        Self {
            layer,
            status,
            confidence: None,
            prediction: Prediction::neutral(layer),
            source: DataSource::Neutral,
            notes: vec![note],
        }
    }

    /// Lowers the confidence to `ceiling` when above it, noting the change.
    #[must_use]
    pub fn capped_at(mut self, ceiling: Confidence) -> Self {
        if let Some(confidence) = self.confidence.filter(|current| *current > ceiling) {
            self.confidence = Some(ceiling);
            self.notes.push(format!(
                "confidence capped at {:.3} from {:.3}",
                ceiling.value(),
                confidence.value()
            ));
        }
        self
    }

    /// Appends a diagnostic note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Layer that produced the result.
    #[must_use]
    pub const fn layer(&self) -> LayerKind {
        self.layer
    }

    /// Status tag.
    #[must_use]
    pub const fn status(&self) -> LayerStatus {
        self.status
    }

    /// Confidence, undefined for skipped or failed layers.
    #[must_use]
    pub const fn confidence(&self) -> Option<Confidence> {
        self.confidence
    }

    /// Confidence as it contributes to aggregation (zero when undefined).
    #[must_use]
    pub fn contribution(&self) -> f64 {
        self.confidence.map_or(0.0, Confidence::value)
    }

    /// Predicted values.
    #[must_use]
    pub const fn prediction(&self) -> &Prediction {
        &self.prediction
    }

    /// Provenance of the prediction.
    #[must_use]
    pub const fn source(&self) -> &DataSource {
        &self.source
    }

    /// Diagnostic notes.
    #[must_use]
    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}

#[derive(Deserialize)]
struct LayerResultDraft {
    layer: LayerKind,
    status: LayerStatus,
    confidence: Option<Confidence>,
    prediction: Prediction,
    source: DataSource,
    #[serde(default)]
    notes: Vec<String>,
}

impl TryFrom<LayerResultDraft> for LayerResult {
    type Error = String;

    fn try_from(draft: LayerResultDraft) -> Result<Self, Self::Error> {
        if draft.prediction.kind() != draft.layer {
            return Err(format!(
                "{} result carries a {} prediction",
                draft.layer,
                draft.prediction.kind()
            ));
        }
        if draft.status.has_confidence() != draft.confidence.is_some() {
            return Err(format!(
                "{} result with status {:?} has confidence {:?}",
                draft.layer, draft.status, draft.confidence
            ));
        }
        let source_fits = match draft.status {
            LayerStatus::Computed => draft.source == DataSource::Primary,
            LayerStatus::Degraded => matches!(
                draft.source,
                DataSource::CachedResult { .. } | DataSource::Heuristic
            ),
            LayerStatus::Skipped | LayerStatus::Failed => draft.source == DataSource::Neutral,
        };
        if !source_fits {
            return Err(format!(
                "{} result with status {:?} cannot come from {:?}",
                draft.layer, draft.status, draft.source
            ));
        }
        Ok(Self {
            layer: draft.layer,
            status: draft.status,
            confidence: draft.confidence,
            prediction: draft.prediction,
            source: draft.source,
            notes: draft.notes,
        })
    }
}

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every layer Computed.
    Complete,
    /// Some layer Degraded or Skipped, none Failed.
    Partial,
    /// Some layer Failed.
    Failed,
    /// Cancellation observed at a layer boundary.
    Cancelled,
}

impl PipelineStatus {
    /// Derives the status of a finished, non-cancelled run.
    #[must_use]
    pub fn from_layers(results: &[LayerResult]) -> Self {
        if results.iter().any(|r| r.status() == LayerStatus::Failed) {
            Self::Failed
        } else if results.len() == LayerKind::ORDER.len()
            && results.iter().all(|r| r.status() == LayerStatus::Computed)
        {
            Self::Complete
        } else {
            Self::Partial
        }
    }
}

/// Structured output of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Run identifier.
    pub run_id: Uuid,
    /// Policy event that triggered the run.
    pub event_id: Uuid,
    /// Layer results in traversal order.
    pub layers: Vec<LayerResult>,
    /// Combined end-to-end confidence.
    pub aggregate_confidence: f64,
    /// Terminal status.
    pub status: PipelineStatus,
    /// Fallbacks used and why.
    pub ledger: DegradationLedger,
    /// Every per-layer state transition, in order.
    pub transitions: Vec<StateTransition>,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
}

impl PipelineResult {
    /// Looks up a layer's result.
    #[must_use]
    pub fn layer(&self, kind: LayerKind) -> Option<&LayerResult> {
        self.layers.iter().find(|result| result.layer() == kind)
    }

    /// Layers whose output did not come from the primary path.
    #[must_use]
    pub fn non_primary_layers(&self) -> Vec<LayerKind> {
        self.layers
            .iter()
            .filter(|result| result.status() != LayerStatus::Computed)
            .map(LayerResult::layer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> PolicyEvent {
        PolicyEvent::builder("25% tariff on steel imports from CountryX")
            .source_country("CountryY")
            .target_country("CountryX")
            .tariff_rate(0.25)
            .sector("steel")
            .build()
            .unwrap()
    }

    #[test]
    fn layer_kind_parses_names() {
        assert_eq!("trade_flow".parse::<LayerKind>().unwrap(), LayerKind::TradeFlow);
        assert_eq!("Firm-Impact".parse::<LayerKind>().unwrap(), LayerKind::FirmImpact);
        assert!("weather".parse::<LayerKind>().is_err());
        assert_eq!(LayerKind::TradeFlow.predecessor(), Some(LayerKind::PolicyTrigger));
        assert_eq!(LayerKind::PolicyTrigger.predecessor(), None);
    }

    #[test]
    fn layer_result_json_keeps_status_and_confidence_paired() {
        let computed = LayerResult::computed(
            Prediction::neutral(LayerKind::FirmImpact),
            Confidence::clamped(0.6),
        );
        let json = serde_json::to_value(&computed).unwrap();
        let back: LayerResult = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, computed);

        let mut missing = json.clone();
        missing["confidence"] = serde_json::Value::Null;
        assert!(serde_json::from_value::<LayerResult>(missing).is_err());

        let mut skipped_with_score =
            serde_json::to_value(LayerResult::skipped(LayerKind::FirmImpact, "x")).unwrap();
        skipped_with_score["confidence"] = serde_json::json!(0.4);
        assert!(serde_json::from_value::<LayerResult>(skipped_with_score).is_err());

        let mut wrong_layer = json;
        wrong_layer["layer"] = serde_json::json!("trade_flow");
        assert!(serde_json::from_value::<LayerResult>(wrong_layer).is_err());
    }

    #[test]
    fn capping_only_lowers_confidence() {
        let result = LayerResult::degraded(
            Prediction::neutral(LayerKind::FirmImpact),
            Confidence::clamped(0.9),
            DataSource::Heuristic,
            "heuristic",
        );
        let capped = result.clone().capped_at(Confidence::clamped(0.5));
        assert!((capped.contribution() - 0.5).abs() < f64::EPSILON);
        assert!(capped.notes().iter().any(|n| n.starts_with("confidence capped")));
        let untouched = result.capped_at(Confidence::ONE);
        assert!((untouched.contribution() - 0.9).abs() < f64::EPSILON);
        assert_eq!(untouched.notes().len(), 1);
    }

    #[test]
    fn confidence_rejects_out_of_range() {
        assert!(Confidence::new(1.2).is_none());
        assert!(Confidence::new(f64::NAN).is_none());
        assert_eq!(Confidence::clamped(f64::NAN), Confidence::ZERO);
        assert_eq!(Confidence::clamped(3.0), Confidence::ONE);
        assert!((Confidence::ONE.capped(0.3).value() - 0.3).abs() < f64::EPSILON);
        assert!(serde_json::from_str::<Confidence>("1.5").is_err());
    }

    #[test]
    fn placeholders_have_no_confidence() {
        let skipped = LayerResult::skipped(LayerKind::FirmImpact, "no data");
        assert_eq!(skipped.confidence(), None);
        assert!(skipped.contribution().abs() < f64::EPSILON);
        assert_eq!(skipped.prediction(), &Prediction::neutral(LayerKind::FirmImpact));
        let degraded = LayerResult::degraded(
            Prediction::neutral(LayerKind::FirmImpact),
            Confidence::clamped(0.3),
            DataSource::Heuristic,
            "heuristic",
        );
        assert!(degraded.status().has_confidence());
    }

    #[test]
    fn headline_shapes_follow_event() {
        let event = event();
        let trade = Prediction::from_headline(LayerKind::TradeFlow, -0.2, &event);
        match &trade {
            Prediction::TradeFlow { partner_deltas, .. } => {
                assert_eq!(partner_deltas.get("CountryX"), Some(&-0.2));
            }
            other => panic!("unexpected {other:?}"),
        }
        let consumer = Prediction::from_headline(LayerKind::ConsumerImpact, 0.12, &event);
        match consumer {
            Prediction::ConsumerImpact { price_path, .. } => {
                assert_eq!(price_path.len(), PRICE_HORIZON_MONTHS);
                assert!((price_path[PRICE_HORIZON_MONTHS - 1] - 0.12).abs() < 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!((trade.headline() + 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn exports_feed_successors() {
        let exports = Prediction::neutral(LayerKind::ConsumerImpact).exports();
        assert!(exports.contains_key("price_pressure"));
        assert!(matches!(exports["price_path"], FeatureValue::Series(ref s) if s.len() == 12));
    }

    #[test]
    fn status_derivation() {
        let computed: Vec<_> = LayerKind::ORDER
            .iter()
            .map(|kind| LayerResult::computed(Prediction::neutral(*kind), Confidence::ONE))
            .collect();
        assert_eq!(PipelineStatus::from_layers(&computed), PipelineStatus::Complete);
        let mut partial = computed.clone();
        partial[3] = LayerResult::skipped(LayerKind::FirmImpact, "skip");
        assert_eq!(PipelineStatus::from_layers(&partial), PipelineStatus::Partial);
        partial[4] = LayerResult::failed(LayerKind::ConsumerImpact, "boom");
        assert_eq!(PipelineStatus::from_layers(&partial), PipelineStatus::Failed);
    }
}
