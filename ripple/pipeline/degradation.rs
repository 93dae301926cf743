//! Fallback chains, the cross-run result cache and chain resolution.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::PipelineError,
    event::PolicyEvent,
    result::{Confidence, DataSource, LayerKind, LayerResult, LayerStatus, Prediction},
};

/// Default confidence ceiling of heuristic substitutes.
pub const DEFAULT_HEURISTIC_CEILING: f64 = 0.3;
/// Default decay applied to cached confidence.
pub const DEFAULT_CACHE_DECAY: f64 = 0.8;
/// Default maximum age of a reusable cached result (three days).
pub const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 259_200;

const fn default_heuristic_ceiling() -> f64 {
    DEFAULT_HEURISTIC_CEILING
}

/// One step of a layer's fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Reuse the most recent Computed result for the same country pair and sector.
    Cached {
        /// Overrides the cache-wide maximum age.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_age_secs: Option<u64>,
        /// Overrides the cache-wide confidence decay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence_decay: Option<f64>,
    },
    /// Linear rule on the announced tariff rate: `intercept + slope * rate`.
    Heuristic {
        /// Value at a zero rate.
        intercept: f64,
        /// Change per unit of tariff rate.
        slope: f64,
        /// Confidence assigned to the substitute, held to the stage's confidence floor.
        #[serde(default = "default_heuristic_ceiling")]
        ceiling: f64,
    },
    /// Give up and record a neutral placeholder.
    Skip,
}

impl FallbackStrategy {
    /// Short label used in ledgers and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Cached { .. } => "cached",
            Self::Heuristic { .. } => "heuristic",
            Self::Skip => "skip",
        }
    }

    fn validate(&self, layer: LayerKind) -> Result<(), PipelineError> {
        match self {
            Self::Cached {
                confidence_decay: Some(decay),
                ..
            } if !decay.is_finite() || *decay <= 0.0 || *decay > 1.0 => Err(PipelineError::Config(
                format!("{layer}: cached confidence_decay must be in (0, 1], got {decay}"),
            )),
            Self::Heuristic {
                intercept,
                slope,
                ceiling,
            } => {
                if !intercept.is_finite() || !slope.is_finite() {
                    return Err(PipelineError::Config(format!(
                        "{layer}: heuristic coefficients must be finite"
                    )));
                }
                if !(0.0..=1.0).contains(ceiling) {
                    return Err(PipelineError::Config(format!(
                        "{layer}: heuristic ceiling must be in [0, 1], got {ceiling}"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Ordered fallback chains for every layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DegradationPolicy {
    chains: IndexMap<LayerKind, Vec<FallbackStrategy>>,
}

impl DegradationPolicy {
    /// Built-in chain for `layer`: cached, then heuristic, then skip.
    #[must_use]
    pub fn default_chain(layer: LayerKind) -> Vec<FallbackStrategy> {
        let (intercept, slope) = match layer {
            LayerKind::PolicyTrigger => (0.2, 1.2),
            LayerKind::TradeFlow => (0.0, -1.1),
            LayerKind::IndustryResponse => (0.0, -0.8),
            LayerKind::FirmImpact => (0.05, 0.5),
            LayerKind::ConsumerImpact => (0.0, 0.35),
            LayerKind::Geopolitical => (0.15, 0.6),
        };
        vec![
            FallbackStrategy::Cached {
                max_age_secs: None,
                confidence_decay: None,
            },
            FallbackStrategy::Heuristic {
                intercept,
                slope,
                ceiling: DEFAULT_HEURISTIC_CEILING,
            },
            FallbackStrategy::Skip,
        ]
    }

    /// Default chains with `overrides` replacing whole chains.
    #[must_use]
    pub fn with_overrides(overrides: &IndexMap<LayerKind, Vec<FallbackStrategy>>) -> Self {
        let mut policy = Self::default();
        for (layer, chain) in overrides {
            policy.chains.insert(*layer, chain.clone());
        }
        policy
    }

    /// Replaces the chain of one layer.
    #[must_use]
    pub fn with_chain(mut self, layer: LayerKind, chain: Vec<FallbackStrategy>) -> Self {
        self.chains.insert(layer, chain);
        self
    }

    /// Chain for `layer`; an empty chain behaves like `[Skip]`.
    #[must_use]
    pub fn chain(&self, layer: LayerKind) -> &[FallbackStrategy] {
        self.chains.get(&layer).map_or(&[][..], Vec::as_slice)
    }

    /// Rejects out-of-range strategy parameters.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (layer, chain) in &self.chains {
            for strategy in chain {
                strategy.validate(*layer)?;
            }
        }
        Ok(())
    }
}

impl Default for DegradationPolicy {
    fn default() -> Self {
        Self {
            chains: LayerKind::ORDER
                .iter()
                .map(|layer| (*layer, Self::default_chain(*layer)))
                .collect(),
        }
    }
}

/// Cache-wide defaults for the `Cached` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Results older than this are never reused.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Factor applied to the cached confidence.
    #[serde(default = "default_confidence_decay")]
    pub confidence_decay: f64,
    /// Maximum number of cached results; oldest entries are evicted first.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            confidence_decay: default_confidence_decay(),
            capacity: default_capacity(),
        }
    }
}

const fn default_max_age_secs() -> u64 {
    DEFAULT_CACHE_MAX_AGE_SECS
}

const fn default_confidence_decay() -> f64 {
    DEFAULT_CACHE_DECAY
}

const fn default_capacity() -> usize {
    1024
}

/// Identity of a reusable result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Layer that produced the result.
    pub layer: LayerKind,
    /// Country imposing the tariff.
    pub source_country: String,
    /// Primary affected country.
    pub target_country: String,
    /// Sector, when the event names one.
    pub sector: Option<String>,
}

impl CacheKey {
    /// Key of `layer` for the country pair and sector of `event`.
    #[must_use]
    pub fn for_event(layer: LayerKind, event: &PolicyEvent) -> Self {
        Self {
            layer,
            source_country: event.source_country().to_string(),
            target_country: event.primary_target().to_string(),
            sector: event.sector().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    result: LayerResult,
    stored_at: DateTime<Utc>,
}

/// Most recent Computed result per key, shared across runs.
///
/// The only state visible to more than one run; every access goes through the
/// inner lock.
#[derive(Debug)]
pub struct ResultCache {
    entries: RwLock<IndexMap<CacheKey, CachedEntry>>,
    capacity: usize,
}

impl ResultCache {
    /// Empty cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Stores `result` now; see [`ResultCache::store_at`].
    pub fn store(&self, key: CacheKey, result: &LayerResult) -> bool {
        self.store_at(key, result, Utc::now())
    }

    /// Stores a Computed result stamped `at`, replacing any entry for `key`.
    ///
    /// Returns `false` (and stores nothing) for any other status.
    pub fn store_at(&self, key: CacheKey, result: &LayerResult, at: DateTime<Utc>) -> bool {
        if result.status() != LayerStatus::Computed {
            return false;
        }
        let mut entries = self.entries.write();
        entries.shift_remove(&key);
        while entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(
            key,
            CachedEntry {
                result: result.clone(),
                stored_at: at,
            },
        );
        true
    }

    /// Cached result for `key` no older than `max_age_secs`, with its age in seconds.
    #[must_use]
    pub fn lookup(
        &self,
        key: &CacheKey,
        max_age_secs: u64,
        now: DateTime<Utc>,
    ) -> Option<(LayerResult, i64)> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        let age = (now - entry.stored_at).num_seconds().max(0);
        let max_age = i64::try_from(max_age_secs).unwrap_or(i64::MAX);
        (age <= max_age).then(|| (entry.result.clone(), age))
    }

    /// Number of cached results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(default_capacity())
    }
}

/// Everything a fallback strategy may consult.
#[derive(Debug, Clone, Copy)]
pub struct FallbackScope<'a> {
    /// Layer being substituted.
    pub layer: LayerKind,
    /// Event of the current run.
    pub event: &'a PolicyEvent,
    /// Shared result cache.
    pub cache: &'a ResultCache,
    /// Cache-wide defaults.
    pub settings: CacheSettings,
    /// Reference time for cache ages.
    pub now: DateTime<Utc>,
}

/// Outcome of walking a fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Degraded or Skipped result.
    pub result: LayerResult,
    /// One note per strategy attempted, in order.
    pub attempts: Vec<String>,
}

/// Attempts `strategy`, returning `None` when it does not apply.
#[must_use]
pub fn attempt(strategy: &FallbackStrategy, scope: &FallbackScope<'_>) -> Option<LayerResult> {
    match strategy {
        FallbackStrategy::Cached {
            max_age_secs,
            confidence_decay,
        } => {
            let key = CacheKey::for_event(scope.layer, scope.event);
            let max_age = max_age_secs.unwrap_or(scope.settings.max_age_secs);
            let (cached, age_secs) = scope.cache.lookup(&key, max_age, scope.now)?;
            let decay = confidence_decay.unwrap_or(scope.settings.confidence_decay);
            let confidence = cached.confidence()?.scaled(decay);
            Some(LayerResult::degraded(
                cached.prediction().clone(),
                confidence,
                DataSource::CachedResult { age_secs },
                format!("reused cached result aged {age_secs}s"),
            ))
        }
        FallbackStrategy::Heuristic {
            intercept,
            slope,
            ceiling,
        } => {
            let value = slope.mul_add(scope.event.tariff_rate(), *intercept);
            Some(LayerResult::degraded(
                Prediction::from_headline(scope.layer, value, scope.event),
                Confidence::clamped(*ceiling),
                DataSource::Heuristic,
                format!("heuristic {intercept} + {slope} * tariff_rate"),
            ))
        }
        FallbackStrategy::Skip => Some(LayerResult::skipped(scope.layer, "fallback chain skipped")),
    }
}

/// Walks `chain` until a strategy applies; an exhausted chain skips.
#[must_use]
pub fn resolve(chain: &[FallbackStrategy], scope: &FallbackScope<'_>) -> Resolution {
    let mut attempts = Vec::new();
    for strategy in chain {
        match attempt(strategy, scope) {
            Some(result) => {
                attempts.push(format!("{}: applied", strategy.label()));
                return Resolution { result, attempts };
            }
            None => attempts.push(format!("{}: not applicable", strategy.label())),
        }
    }
    attempts.push("chain exhausted".into());
    Resolution {
        result: LayerResult::skipped(scope.layer, "no fallback applied"),
        attempts,
    }
}
