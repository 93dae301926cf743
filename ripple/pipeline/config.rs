use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use shared_logging::LogLevel;

use crate::{
    confidence::ConfidenceWeights,
    degradation::{CacheSettings, DegradationPolicy, FallbackStrategy},
    error::PipelineError,
    event::MAX_TARIFF_RATE,
    result::LayerKind,
    validation::InputBounds,
};

/// Runtime configuration of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Deadline for one external feature fetch, in milliseconds.
    pub fetch_timeout_ms: u64,
    /// Largest tariff rate accepted by input validation.
    pub max_tariff_rate: f64,
    /// Route stage faults through the fallback chain instead of failing the layer.
    pub recover_stage_faults: bool,
    /// Result-cache settings.
    pub cache: CacheSettings,
    /// Aggregation weights.
    pub weights: ConfidenceWeights,
    /// Fallback chains.
    pub degradation: DegradationPolicy,
    /// Structured log output.
    pub logging: LoggingSettings,
    /// JSONL file backing the model registry.
    pub registry_path: Option<PathBuf>,
}

/// Structured log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingSettings {
    /// JSON-lines log file; logging to file is off when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Records below this level are dropped.
    #[serde(default = "default_min_level")]
    pub min_level: LogLevel,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            path: None,
            min_level: default_min_level(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            max_tariff_rate: MAX_TARIFF_RATE,
            recover_stage_faults: false,
            cache: CacheSettings::default(),
            weights: ConfidenceWeights::default(),
            degradation: DegradationPolicy::default(),
            logging: LoggingSettings::default(),
            registry_path: None,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from a TOML file; relative paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config {}", path.display()))?;
        let base = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::parse(&raw, &base).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses configuration from TOML text; relative paths stay as written.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Self::parse(raw, Path::new(""))
    }

    fn parse(raw: &str, base: &Path) -> Result<Self> {
        let document: PipelineConfigSerde = toml::from_str(raw)?;
        let weights = parse_layer_table(document.weights)?;
        let chains = parse_layer_table(document.degradation)?;
        let resolve = |candidate: PathBuf| {
            if candidate.is_relative() {
                base.join(candidate)
            } else {
                candidate
            }
        };
        let mut logging = document.logging;
        logging.path = logging.path.map(resolve);
        let config = Self {
            fetch_timeout_ms: document.fetch_timeout_ms,
            max_tariff_rate: document.max_tariff_rate,
            recover_stage_faults: document.recover_stage_faults,
            cache: document.cache,
            weights: ConfidenceWeights::with_overrides(&weights),
            degradation: DegradationPolicy::with_overrides(&chains),
            logging,
            registry_path: document.registry.path.map(resolve),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the orchestrator cannot honour.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.fetch_timeout_ms == 0 {
            return Err(PipelineError::Config("fetch_timeout_ms must be positive".into()));
        }
        if !self.max_tariff_rate.is_finite()
            || self.max_tariff_rate <= 0.0
            || self.max_tariff_rate > MAX_TARIFF_RATE
        {
            return Err(PipelineError::Config(format!(
                "max_tariff_rate must be in (0, {MAX_TARIFF_RATE}], got {}",
                self.max_tariff_rate
            )));
        }
        let decay = self.cache.confidence_decay;
        if !decay.is_finite() || decay <= 0.0 || decay > 1.0 {
            return Err(PipelineError::Config(format!(
                "cache.confidence_decay must be in (0, 1], got {decay}"
            )));
        }
        if self.cache.capacity == 0 {
            return Err(PipelineError::Config("cache.capacity must be positive".into()));
        }
        self.weights.validate()?;
        self.degradation.validate()
    }

    /// Fetch deadline as a duration.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Bounds applied by input validation.
    #[must_use]
    pub const fn input_bounds(&self) -> InputBounds {
        InputBounds {
            max_tariff_rate: self.max_tariff_rate,
        }
    }
}

fn parse_layer_table<T>(
    table: IndexMap<String, T>,
) -> Result<IndexMap<LayerKind, T>, PipelineError> {
    table
        .into_iter()
        .map(|(name, value)| name.parse::<LayerKind>().map(|kind| (kind, value)))
        .collect()
}

#[derive(Debug, Deserialize)]
struct PipelineConfigSerde {
    #[serde(default = "default_fetch_timeout_ms")]
    fetch_timeout_ms: u64,
    #[serde(default = "default_max_tariff_rate")]
    max_tariff_rate: f64,
    #[serde(default)]
    recover_stage_faults: bool,
    #[serde(default)]
    cache: CacheSettings,
    #[serde(default)]
    weights: IndexMap<String, f64>,
    #[serde(default)]
    degradation: IndexMap<String, Vec<FallbackStrategy>>,
    #[serde(default)]
    logging: LoggingSettings,
    #[serde(default)]
    registry: RegistrySettings,
}

#[derive(Debug, Default, Deserialize)]
struct RegistrySettings {
    #[serde(default)]
    path: Option<PathBuf>,
}

const fn default_fetch_timeout_ms() -> u64 {
    2_000
}

const fn default_max_tariff_rate() -> f64 {
    MAX_TARIFF_RATE
}

const fn default_min_level() -> LogLevel {
    LogLevel::Info
}
