use crate::input::{FeatureValue, LayerInput};

/// Bounds applied to assembled inputs before a stage is allowed to execute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputBounds {
    /// Largest accepted tariff rate.
    pub max_tariff_rate: f64,
}

/// Problems with an assembled input; empty means the stage may execute.
///
/// Checks presence of every required key, finiteness of numeric features,
/// non-empty text, series and vectors, and the tariff-rate bound.
#[must_use]
pub fn input_issues(input: &LayerInput, required: &[&str], bounds: InputBounds) -> Vec<String> {
    let mut issues = Vec::new();
    for key in required {
        match input.get(key) {
            None => issues.push(format!("missing `{key}`")),
            Some(value) => {
                if let Some(issue) = value_issue(key, value) {
                    issues.push(issue);
                }
            }
        }
    }
    if let Some(rate) = input.get("tariff_rate").and_then(FeatureValue::as_number) {
        if !(0.0..=bounds.max_tariff_rate).contains(&rate) {
            issues.push(format!(
                "tariff_rate {rate} outside [0, {}]",
                bounds.max_tariff_rate
            ));
        }
    }
    issues
}

fn value_issue(key: &str, value: &FeatureValue) -> Option<String> {
    if !value.is_finite() {
        return Some(format!("`{key}` is not finite"));
    }
    match value {
        FeatureValue::Text(text) if text.trim().is_empty() => Some(format!("`{key}` is empty")),
        FeatureValue::Series(values) if values.is_empty() => Some(format!("`{key}` is empty")),
        FeatureValue::Vector(values) if values.is_empty() => Some(format!("`{key}` is empty")),
        _ => None,
    }
}
