use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::PipelineError, input::FeatureValue};

/// Hard upper bound on an announced tariff rate (500%).
pub const MAX_TARIFF_RATE: f64 = 5.0;

/// Provenance of an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Publisher or feed the announcement came from.
    pub source: String,
    /// When the announcement was observed.
    pub timestamp: DateTime<Utc>,
}

/// Immutable policy announcement that drives one pipeline run.
///
/// Only constructible through [`PolicyEventBuilder`] or deserialization, both of
/// which validate the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicyEventDraft")]
pub struct PolicyEvent {
    id: Uuid,
    text: String,
    source_country: String,
    target_countries: Vec<String>,
    tariff_rate: f64,
    effective_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    sector: Option<String>,
    metadata: EventMetadata,
}

impl PolicyEvent {
    /// Starts a builder from the announcement text.
    #[must_use]
    pub fn builder(text: impl Into<String>) -> PolicyEventBuilder {
        PolicyEventBuilder::new(text)
    }

    /// Event identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Announcement text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Country imposing the tariff.
    #[must_use]
    pub fn source_country(&self) -> &str {
        &self.source_country
    }

    /// Affected countries; never empty.
    #[must_use]
    pub fn target_countries(&self) -> &[String] {
        &self.target_countries
    }

    /// First listed target, used as the primary country pair.
    #[must_use]
    pub fn primary_target(&self) -> &str {
        &self.target_countries[0]
    }

    /// Announced ad-valorem rate (0.25 = 25%).
    #[must_use]
    pub const fn tariff_rate(&self) -> f64 {
        self.tariff_rate
    }

    /// Date the tariff takes effect.
    #[must_use]
    pub const fn effective_date(&self) -> NaiveDate {
        self.effective_date
    }

    /// Sector named by the announcement.
    #[must_use]
    pub fn sector(&self) -> Option<&str> {
        self.sector.as_deref()
    }

    /// Provenance.
    #[must_use]
    pub const fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    /// Features every layer receives regardless of upstream results.
    #[must_use]
    pub fn base_features(&self) -> IndexMap<String, FeatureValue> {
        let mut features = IndexMap::new();
        features.insert("policy_text".into(), FeatureValue::Text(self.text.clone()));
        features.insert("tariff_rate".into(), FeatureValue::Number(self.tariff_rate));
        features.insert(
            "source_country".into(),
            FeatureValue::Text(self.source_country.clone()),
        );
        features.insert(
            "target_countries".into(),
            FeatureValue::Text(self.target_countries.join(",")),
        );
        features.insert(
            "effective_date".into(),
            FeatureValue::Text(self.effective_date.to_string()),
        );
        if let Some(sector) = &self.sector {
            features.insert("sector".into(), FeatureValue::Text(sector.clone()));
        }
        features
    }
}

/// Unvalidated wire form of a [`PolicyEvent`].
#[derive(Debug, Clone, Deserialize)]
struct PolicyEventDraft {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    text: String,
    source_country: String,
    target_countries: Vec<String>,
    tariff_rate: f64,
    effective_date: NaiveDate,
    #[serde(default)]
    sector: Option<String>,
    #[serde(default)]
    metadata: Option<EventMetadata>,
}

impl TryFrom<PolicyEventDraft> for PolicyEvent {
    type Error = PipelineError;

    fn try_from(draft: PolicyEventDraft) -> Result<Self, Self::Error> {
        let event = Self {
            id: draft.id,
            text: draft.text.trim().to_string(),
            source_country: draft.source_country.trim().to_string(),
            target_countries: draft
                .target_countries
                .iter()
                .map(|country| country.trim().to_string())
                .collect(),
            tariff_rate: draft.tariff_rate,
            effective_date: draft.effective_date,
            sector: draft
                .sector
                .map(|sector| sector.trim().to_ascii_lowercase())
                .filter(|sector| !sector.is_empty()),
            metadata: draft.metadata.unwrap_or_else(|| EventMetadata {
                source: "unspecified".into(),
                timestamp: Utc::now(),
            }),
        };
        validate(&event)?;
        Ok(event)
    }
}

fn validate(event: &PolicyEvent) -> Result<(), PipelineError> {
    if event.text.is_empty() {
        return Err(PipelineError::Schema("announcement text is empty".into()));
    }
    if event.source_country.is_empty() {
        return Err(PipelineError::Schema("source country is empty".into()));
    }
    if event.target_countries.is_empty() {
        return Err(PipelineError::Schema("no target countries".into()));
    }
    if event.target_countries.iter().any(String::is_empty) {
        return Err(PipelineError::Schema("blank target country".into()));
    }
    if !event.tariff_rate.is_finite() || !(0.0..=MAX_TARIFF_RATE).contains(&event.tariff_rate) {
        return Err(PipelineError::Schema(format!(
            "tariff rate {} outside [0, {MAX_TARIFF_RATE}]",
            event.tariff_rate
        )));
    }
    Ok(())
}

/// Builder for [`PolicyEvent`].
#[derive(Debug, Clone)]
pub struct PolicyEventBuilder {
    text: String,
    source_country: String,
    target_countries: Vec<String>,
    tariff_rate: f64,
    effective_date: Option<NaiveDate>,
    sector: Option<String>,
    source: String,
    timestamp: Option<DateTime<Utc>>,
}

impl PolicyEventBuilder {
    fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_country: String::new(),
            target_countries: Vec::new(),
            tariff_rate: 0.0,
            effective_date: None,
            sector: None,
            source: "unspecified".into(),
            timestamp: None,
        }
    }

    /// Country imposing the tariff.
    #[must_use]
    pub fn source_country(mut self, country: impl Into<String>) -> Self {
        self.source_country = country.into();
        self
    }

    /// Adds one affected country.
    #[must_use]
    pub fn target_country(mut self, country: impl Into<String>) -> Self {
        self.target_countries.push(country.into());
        self
    }

    /// Adds several affected countries.
    #[must_use]
    pub fn target_countries<I, S>(mut self, countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_countries
            .extend(countries.into_iter().map(Into::into));
        self
    }

    /// Announced rate (0.25 = 25%).
    #[must_use]
    pub fn tariff_rate(mut self, rate: f64) -> Self {
        self.tariff_rate = rate;
        self
    }

    /// Effective date; defaults to today.
    #[must_use]
    pub fn effective_date(mut self, date: NaiveDate) -> Self {
        self.effective_date = Some(date);
        self
    }

    /// Sector named by the announcement.
    #[must_use]
    pub fn sector(mut self, sector: impl Into<String>) -> Self {
        self.sector = Some(sector.into());
        self
    }

    /// Publisher of the announcement.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Observation time; defaults to now.
    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Validates and builds the event.
    pub fn build(self) -> Result<PolicyEvent, PipelineError> {
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        PolicyEvent::try_from(PolicyEventDraft {
            id: Uuid::new_v4(),
            text: self.text,
            source_country: self.source_country,
            target_countries: self.target_countries,
            tariff_rate: self.tariff_rate,
            effective_date: self
                .effective_date
                .unwrap_or_else(|| timestamp.date_naive()),
            sector: self.sector,
            metadata: Some(EventMetadata {
                source: self.source,
                timestamp,
            }),
        })
    }
}
