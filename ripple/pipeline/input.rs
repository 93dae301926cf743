use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{error::LayerError, result::LayerKind};

/// A single named feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Scalar.
    Number(f64),
    /// Free text.
    Text(String),
    /// Ordered series (e.g. monthly values).
    Series(Vec<f64>),
    /// Named components (e.g. per-sector exposure).
    Vector(IndexMap<String, f64>),
}

impl FeatureValue {
    /// Scalar view.
    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Text view.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Series view.
    #[must_use]
    pub fn as_series(&self) -> Option<&[f64]> {
        match self {
            Self::Series(values) => Some(values),
            _ => None,
        }
    }

    /// Vector view.
    #[must_use]
    pub const fn as_vector(&self) -> Option<&IndexMap<String, f64>> {
        match self {
            Self::Vector(values) => Some(values),
            _ => None,
        }
    }

    /// True when every numeric component is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Number(value) => value.is_finite(),
            Self::Text(_) => true,
            Self::Series(values) => values.iter().all(|v| v.is_finite()),
            Self::Vector(values) => values.values().all(|v| v.is_finite()),
        }
    }

    const fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Series(_) => "series",
            Self::Vector(_) => "vector",
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<f64>> for FeatureValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Series(values)
    }
}

impl From<IndexMap<String, f64>> for FeatureValue {
    fn from(values: IndexMap<String, f64>) -> Self {
        Self::Vector(values)
    }
}

/// Named features handed to one layer's `predict`.
///
/// Built fresh by the orchestrator for every layer invocation; layers only
/// ever see it through a shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerInput {
    layer: LayerKind,
    features: IndexMap<String, FeatureValue>,
}

impl LayerInput {
    /// Empty input for `layer`.
    #[must_use]
    pub fn new(layer: LayerKind) -> Self {
        Self {
            layer,
            features: IndexMap::new(),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Inserts or replaces a feature.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FeatureValue>) {
        self.features.insert(key.into(), value.into());
    }

    /// Inserts a feature only when the key is not yet present.
    pub fn fill(&mut self, key: impl Into<String>, value: FeatureValue) {
        self.features.entry(key.into()).or_insert(value);
    }

    /// Removes a feature, returning it.
    pub fn remove(&mut self, key: &str) -> Option<FeatureValue> {
        self.features.shift_remove(key)
    }

    /// Layer the input is addressed to.
    #[must_use]
    pub const fn layer(&self) -> LayerKind {
        self.layer
    }

    /// Raw lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FeatureValue> {
        self.features.get(key)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.features.contains_key(key)
    }

    /// Iterates over features in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FeatureValue)> {
        self.features.iter()
    }

    /// Number of features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// True when the input holds no features.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Keys from `required` that are absent.
    #[must_use]
    pub fn missing<'a>(&self, required: &[&'a str]) -> Vec<&'a str> {
        required
            .iter()
            .copied()
            .filter(|key| !self.contains(key))
            .collect()
    }

    /// Required scalar.
    pub fn number(&self, key: &str) -> Result<f64, LayerError> {
        let value = self.require(key)?;
        value.as_number().ok_or_else(|| self.wrong_type(key, "number", value))
    }

    /// Optional scalar with a default.
    #[must_use]
    pub fn number_or(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(FeatureValue::as_number)
            .unwrap_or(default)
    }

    /// Required text.
    pub fn text(&self, key: &str) -> Result<&str, LayerError> {
        let value = self.require(key)?;
        value.as_text().ok_or_else(|| self.wrong_type(key, "text", value))
    }

    /// Required series.
    pub fn series(&self, key: &str) -> Result<&[f64], LayerError> {
        let value = self.require(key)?;
        value.as_series().ok_or_else(|| self.wrong_type(key, "series", value))
    }

    /// Required vector.
    pub fn vector(&self, key: &str) -> Result<&IndexMap<String, f64>, LayerError> {
        let value = self.require(key)?;
        value.as_vector().ok_or_else(|| self.wrong_type(key, "vector", value))
    }

    fn require(&self, key: &str) -> Result<&FeatureValue, LayerError> {
        self.get(key).ok_or_else(|| LayerError::MissingInput {
            layer: self.layer,
            key: key.to_string(),
        })
    }

    fn wrong_type(&self, key: &str, expected: &str, found: &FeatureValue) -> LayerError {
        LayerError::Schema {
            layer: self.layer,
            detail: format!("`{key}` should be a {expected}, found {}", found.type_name()),
        }
    }
}

/// Request sent to the upstream data collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRequest {
    /// Layer whose inputs are being assembled.
    pub layer: LayerKind,
    /// Country imposing the tariff.
    pub source_country: String,
    /// Primary affected country.
    pub target_country: String,
    /// Sector of interest, when the event names one.
    pub sector: Option<String>,
    /// Effective date of the policy.
    pub date: NaiveDate,
}

/// Timestamped feature bundle returned by the upstream collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBundle {
    /// Observation time of the bundle.
    pub as_of: DateTime<Utc>,
    /// Features; absent keys are tolerated.
    #[serde(default)]
    pub features: IndexMap<String, FeatureValue>,
}

impl FeatureBundle {
    /// Bundle stamped now.
    #[must_use]
    pub fn new(features: IndexMap<String, FeatureValue>) -> Self {
        Self {
            as_of: Utc::now(),
            features,
        }
    }
}
