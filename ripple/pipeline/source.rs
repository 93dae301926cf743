//! Upstream feature collaborators.
//!
//! The orchestrator asks a [`FeatureSource`] for external features before each
//! layer and bounds every call with the configured fetch timeout.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::{
    input::{FeatureBundle, FeatureRequest, FeatureValue},
    result::LayerKind,
};

/// Supplies external features for a layer.
///
/// `Ok(None)` means the source has nothing for the request; errors are treated
/// the same way by the orchestrator, only logged differently.
#[async_trait]
pub trait FeatureSource: Send + Sync {
    /// Fetches the bundle for `request`.
    async fn fetch(&self, request: &FeatureRequest) -> Result<Option<FeatureBundle>>;
}

/// Source that never has data.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullFeatureSource;

#[async_trait]
impl FeatureSource for NullFeatureSource {
    async fn fetch(&self, _request: &FeatureRequest) -> Result<Option<FeatureBundle>> {
        Ok(None)
    }
}

/// In-memory bundles per layer.
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureSource {
    bundles: IndexMap<LayerKind, FeatureBundle>,
}

impl StaticFeatureSource {
    /// Empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the bundle returned for `layer`.
    #[must_use]
    pub fn with(mut self, layer: LayerKind, bundle: FeatureBundle) -> Self {
        self.bundles.insert(layer, bundle);
        self
    }
}

#[async_trait]
impl FeatureSource for StaticFeatureSource {
    async fn fetch(&self, request: &FeatureRequest) -> Result<Option<FeatureBundle>> {
        Ok(self.bundles.get(&request.layer).cloned())
    }
}

/// Bundles read from a JSON file on every fetch, so edits are picked up live.
///
/// The document maps `"<layer>"` or `"<layer>:<target country>"` to a bundle;
/// the target-specific entry wins when both exist.
#[derive(Debug, Clone)]
pub struct JsonFeatureSource {
    path: PathBuf,
}

impl JsonFeatureSource {
    /// Source backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<IndexMap<String, FeatureBundle>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading feature file {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing feature file {}", self.path.display()))
    }
}

#[async_trait]
impl FeatureSource for JsonFeatureSource {
    async fn fetch(&self, request: &FeatureRequest) -> Result<Option<FeatureBundle>> {
        let mut document = self.load().await?;
        let specific = format!("{}:{}", request.layer, request.target_country);
        Ok(document
            .shift_remove(&specific)
            .or_else(|| document.shift_remove(request.layer.name())))
    }
}

const DEFAULT_SECTORS: [&str; 4] = ["steel", "autos", "agriculture", "electronics"];

/// Plausible, reproducible features for demos and tests.
///
/// Each request draws from its own generator seeded by the source seed and the
/// request fields, so identical requests always see identical bundles.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticFeatureSource {
    seed: u64,
}

impl SyntheticFeatureSource {
    /// Source with the given seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn rng_for(&self, request: &FeatureRequest) -> SmallRng {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        request.layer.hash(&mut hasher);
        request.source_country.hash(&mut hasher);
        request.target_country.hash(&mut hasher);
        request.sector.hash(&mut hasher);
        request.date.hash(&mut hasher);
        SmallRng::seed_from_u64(hasher.finish())
    }

    /// Features for `request`, without the async wrapper.
    #[must_use]
    pub fn generate(&self, request: &FeatureRequest) -> IndexMap<String, FeatureValue> {
        let mut rng = self.rng_for(request);
        let mut features = IndexMap::new();
        match request.layer {
            LayerKind::PolicyTrigger => {}
            LayerKind::TradeFlow => {
                features.insert(
                    "trade_volume".into(),
                    FeatureValue::Number(rng.gen_range(50.0..500.0)),
                );
                features.insert(
                    "import_elasticity".into(),
                    FeatureValue::Number(rng.gen_range(0.6..1.4)),
                );
                features.insert(
                    "partner_shares".into(),
                    FeatureValue::Vector(IndexMap::from([(request.target_country.clone(), 1.0)])),
                );
            }
            LayerKind::IndustryResponse => {
                let exposure: IndexMap<String, f64> = match &request.sector {
                    Some(sector) => IndexMap::from([
                        (sector.clone(), rng.gen_range(0.5..0.9)),
                        ("downstream_manufacturing".to_string(), rng.gen_range(0.2..0.5)),
                    ]),
                    None => DEFAULT_SECTORS
                        .iter()
                        .map(|sector| ((*sector).to_string(), rng.gen_range(0.1..0.8)))
                        .collect(),
                };
                features.insert("sector_exposure".into(), FeatureValue::Vector(exposure));
            }
            LayerKind::FirmImpact => {
                features.insert(
                    "firm_leverage".into(),
                    FeatureValue::Number(rng.gen_range(0.2..0.7)),
                );
                features.insert(
                    "labor_intensity".into(),
                    FeatureValue::Number(rng.gen_range(0.3..0.8)),
                );
            }
            LayerKind::ConsumerImpact => {
                features.insert(
                    "pass_through_rate".into(),
                    FeatureValue::Number(rng.gen_range(0.4..0.9)),
                );
            }
            LayerKind::Geopolitical => {
                features.insert(
                    "sentiment_baseline".into(),
                    FeatureValue::Number(rng.gen_range(0.1..0.5)),
                );
            }
        }
        features
    }
}

#[async_trait]
impl FeatureSource for SyntheticFeatureSource {
    async fn fetch(&self, request: &FeatureRequest) -> Result<Option<FeatureBundle>> {
        Ok(Some(FeatureBundle::new(self.generate(request))))
    }
}
