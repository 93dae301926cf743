//! Orchestrator runtime: drives a policy event through the six layers and owns
//! the shared stage registry, result cache and model registry.

use std::{
    fmt,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{LogLevel, LogRecord};
use tracing::instrument;

use crate::{
    confidence::aggregate,
    config::PipelineConfig,
    context::{LayerState, RunContext},
    contract::{Layer, TrainingResult, TrainingSet},
    degradation::{resolve, CacheKey, FallbackScope, ResultCache},
    error::{LayerError, PipelineError},
    event::PolicyEvent,
    input::{FeatureBundle, FeatureRequest, LayerInput},
    registry::{ModelRegistry, StageRegistry, StageSlot},
    result::{LayerKind, LayerResult, LayerStatus, PipelineResult, PipelineStatus},
    source::{FeatureSource, NullFeatureSource},
    stages::reference_stages,
    telemetry::PipelineTelemetry,
    validation::input_issues,
};

/// Cooperative cancellation flag checked before each layer.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    /// Signal that has not fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every run holding a clone of this signal.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Deadline for each feature fetch; defaults to the configured timeout.
    pub fetch_timeout: Option<Duration>,
    /// Cancellation flag for the run.
    pub cancel: Option<CancellationSignal>,
}

impl RunOptions {
    /// Sets the fetch deadline.
    #[must_use]
    pub const fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Attaches a cancellation signal.
    #[must_use]
    pub fn cancel_on(mut self, signal: CancellationSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationSignal::is_cancelled)
    }
}

/// Readiness of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerReadiness {
    /// Layer described.
    pub layer: LayerKind,
    /// Whether the stage can predict.
    pub ready: bool,
    /// Version of the fitted model in use, if any.
    pub model_version: Option<u32>,
    /// When that model was fitted.
    pub fitted_at: Option<DateTime<Utc>>,
}

/// Readiness of every layer in traversal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Per-layer entries.
    pub layers: Vec<LayerReadiness>,
    /// Entries in the result cache.
    pub cached_results: usize,
}

impl StatusReport {
    /// Entry for `kind`.
    #[must_use]
    pub fn layer(&self, kind: LayerKind) -> Option<&LayerReadiness> {
        self.layers.iter().find(|entry| entry.layer == kind)
    }

    /// True when every layer can predict.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.layers.iter().all(|entry| entry.ready)
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    stages: Vec<Box<dyn Layer>>,
    source: Option<Arc<dyn FeatureSource>>,
    config: PipelineConfig,
    telemetry: Option<PipelineTelemetry>,
    models: Option<Arc<ModelRegistry>>,
}

impl OrchestratorBuilder {
    /// Creates an empty builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            source: None,
            config: PipelineConfig::default(),
            telemetry: None,
            models: None,
        }
    }

    /// Registers one stage.
    #[must_use]
    pub fn stage(mut self, stage: Box<dyn Layer>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Registers several stages.
    #[must_use]
    pub fn stages(mut self, stages: impl IntoIterator<Item = Box<dyn Layer>>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Registers the rule-based reference stage for every layer.
    #[must_use]
    pub fn with_reference_stages(self) -> Self {
        self.stages(reference_stages())
    }

    /// Sets the upstream feature source.
    #[must_use]
    pub fn feature_source(mut self, source: impl FeatureSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Sets a shared upstream feature source.
    #[must_use]
    pub fn shared_feature_source(mut self, source: Arc<dyn FeatureSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Uses an existing model registry instead of the configured one.
    #[must_use]
    pub fn model_registry(mut self, models: Arc<ModelRegistry>) -> Self {
        self.models = Some(models);
        self
    }

    /// Validates the configuration and the stage set.
    pub fn build(self) -> Result<Orchestrator, PipelineError> {
        self.config.validate()?;
        let stages = StageRegistry::new(self.stages)?;
        let models = match (self.models, &self.config.registry_path) {
            (Some(models), _) => models,
            (None, Some(path)) => Arc::new(
                ModelRegistry::open(path)
                    .map_err(|err| PipelineError::Registry(format!("{err:#}")))?,
            ),
            (None, None) => Arc::new(ModelRegistry::in_memory()),
        };
        Ok(Orchestrator {
            stages,
            source: self
                .source
                .unwrap_or_else(|| Arc::new(NullFeatureSource)),
            cache: ResultCache::new(self.config.cache.capacity),
            config: self.config,
            telemetry: self.telemetry.unwrap_or_default(),
            models,
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives policy events through the layer pipeline.
///
/// `run` takes `&self` and may be called from many tasks at once; the result
/// cache and the stage slots are the only state shared between runs.
pub struct Orchestrator {
    stages: StageRegistry,
    source: Arc<dyn FeatureSource>,
    config: PipelineConfig,
    cache: ResultCache,
    telemetry: PipelineTelemetry,
    models: Arc<ModelRegistry>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.stages)
            .field("config", &self.config)
            .field("cached_results", &self.cache.len())
            .finish_non_exhaustive()
    }
}

/// How a layer left validation or execution without a primary result.
enum Fallback {
    Invalid,
    Fault(LayerError),
}

impl Orchestrator {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Model registry receiving every fit.
    #[must_use]
    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Cross-run result cache.
    #[must_use]
    pub const fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Runs `event` with the configured defaults.
    pub async fn run(&self, event: &PolicyEvent) -> PipelineResult {
        self.run_with(event, RunOptions::default()).await
    }

    /// Runs `event` through every layer. Never fails: faults become layer
    /// statuses and ledger entries.
    #[instrument(skip_all, fields(event_id = %event.id()))]
    pub async fn run_with(&self, event: &PolicyEvent, options: RunOptions) -> PipelineResult {
        let mut ctx = RunContext::new(event);
        let run_id = ctx.run_id().to_string();
        let timeout = options
            .fetch_timeout
            .unwrap_or_else(|| self.config.fetch_timeout());
        self.log(
            self.telemetry
                .record(LogLevel::Info, "pipeline run started")
                .with_run(&run_id)
                .with_field("event_id", event.id().to_string())
                .with_field("tariff_rate", event.tariff_rate()),
        );
        self.emit(
            "pipeline.run.started",
            json!({
                "run_id": run_id,
                "event_id": event.id(),
                "source_country": event.source_country(),
                "target_countries": event.target_countries(),
            }),
        )
        .await;

        let mut cancelled = false;
        for kind in LayerKind::ORDER {
            if !cancelled && options.is_cancelled() {
                cancelled = true;
                self.log(
                    self.telemetry
                        .record(LogLevel::Warn, "run cancelled")
                        .with_run(&run_id)
                        .with_layer(kind.name()),
                );
            }
            if cancelled {
                advance(&mut ctx, kind, LayerState::Skipped);
                let result = LayerResult::skipped(kind, "run cancelled");
                self.finish_layer(&mut ctx, result, vec!["cancelled before start".into()])
                    .await;
                continue;
            }
            self.run_layer(&mut ctx, kind, timeout).await;
        }

        let confidence = aggregate(ctx.results(), &self.config.weights);
        let status = if cancelled {
            PipelineStatus::Cancelled
        } else {
            PipelineStatus::from_layers(ctx.results())
        };
        let result = ctx.finish(status, confidence);
        let level = match status {
            PipelineStatus::Complete => LogLevel::Info,
            PipelineStatus::Partial | PipelineStatus::Cancelled => LogLevel::Warn,
            PipelineStatus::Failed => LogLevel::Error,
        };
        let substituted: Vec<&str> = result
            .non_primary_layers()
            .into_iter()
            .map(LayerKind::name)
            .collect();
        self.log(
            self.telemetry
                .record(level, "pipeline run completed")
                .with_run(&run_id)
                .with_field("status", json!(status))
                .with_field("aggregate_confidence", confidence)
                .with_field("substituted", json!(substituted)),
        );
        self.emit(
            "pipeline.run.completed",
            json!({
                "run_id": run_id,
                "event_id": event.id(),
                "status": status,
                "aggregate_confidence": confidence,
                "substituted": substituted,
            }),
        )
        .await;
        result
    }

    #[instrument(skip(self, ctx, timeout), fields(run_id = %ctx.run_id()))]
    async fn run_layer(&self, ctx: &mut RunContext<'_>, kind: LayerKind, timeout: Duration) {
        let slot = self.stages.slot(kind);
        advance(ctx, kind, LayerState::Validating);
        let mut input = ctx.assemble_input(kind);
        let mut reasons = Vec::new();
        match self.fetch(ctx.event(), kind, timeout).await {
            Ok(Some(bundle)) => {
                for (key, value) in bundle.features {
                    input.fill(key, value);
                }
            }
            Ok(None) => {}
            Err(reason) => reasons.push(reason),
        }

        let fallback = match self.execute(ctx, slot, &input, &mut reasons) {
            Ok(result) => {
                let reasons = if result.status() == LayerStatus::Computed {
                    self.cache
                        .store(CacheKey::for_event(kind, ctx.event()), &result);
                    Vec::new()
                } else {
                    reasons
                };
                self.finish_layer(ctx, result, reasons).await;
                return;
            }
            Err(fallback) => fallback,
        };

        let resolution = resolve(
            self.config.degradation.chain(kind),
            &FallbackScope {
                layer: kind,
                event: ctx.event(),
                cache: &self.cache,
                settings: self.config.cache,
                now: Utc::now(),
            },
        );
        reasons.extend(resolution.attempts);
        let result = match (resolution.result.status(), fallback) {
            (LayerStatus::Degraded, _) => {
                advance(ctx, kind, LayerState::Degrading);
                advance(ctx, kind, LayerState::Degraded);
                resolution.result.capped_at(slot.confidence_floor())
            }
            (_, Fallback::Invalid) => {
                advance(ctx, kind, LayerState::Skipped);
                resolution.result
            }
            (_, Fallback::Fault(err)) => {
                advance(ctx, kind, LayerState::Degrading);
                advance(ctx, kind, LayerState::Failed);
                LayerResult::failed(kind, err.to_string())
            }
        };
        self.finish_layer(ctx, result, reasons).await;
    }

    /// Validates `input` and runs the stage.
    ///
    /// Leaves the layer in `Validating` when the primary path is infeasible,
    /// in `Executing` after a recoverable fault, or `Computed` on success. An
    /// unrecoverable fault moves it to `Failed` and records the result.
    fn execute(
        &self,
        ctx: &mut RunContext<'_>,
        slot: &StageSlot,
        input: &LayerInput,
        reasons: &mut Vec<String>,
    ) -> Result<LayerResult, Fallback> {
        let kind = slot.kind();
        let issues = input_issues(input, slot.required_inputs(), self.config.input_bounds());
        let ready = slot.is_ready();
        if !issues.is_empty() || !ready {
            reasons.extend(issues);
            if !ready {
                reasons.push("stage not ready".into());
            }
            return Err(Fallback::Invalid);
        }
        advance(ctx, kind, LayerState::Executing);
        match slot.predict(input) {
            Ok(result) => {
                advance(ctx, kind, LayerState::Computed);
                Ok(result)
            }
            Err(err) => {
                reasons.push(format!("{}: {err}", err.label()));
                self.log(
                    self.telemetry
                        .record(LogLevel::Error, "stage fault")
                        .with_run(ctx.run_id().to_string())
                        .with_layer(kind.name())
                        .with_field("error", err.to_string()),
                );
                if self.config.recover_stage_faults {
                    Err(Fallback::Fault(err))
                } else {
                    advance(ctx, kind, LayerState::Failed);
                    Ok(LayerResult::failed(kind, err.to_string()))
                }
            }
        }
    }

    async fn fetch(
        &self,
        event: &PolicyEvent,
        kind: LayerKind,
        timeout: Duration,
    ) -> Result<Option<FeatureBundle>, String> {
        let request = FeatureRequest {
            layer: kind,
            source_country: event.source_country().to_string(),
            target_country: event.primary_target().to_string(),
            sector: event.sector().map(str::to_string),
            date: event.effective_date(),
        };
        match tokio::time::timeout(timeout, self.source.fetch(&request)).await {
            Ok(Ok(bundle)) => Ok(bundle),
            Ok(Err(err)) => {
                tracing::warn!(layer = %kind, error = %err, "feature fetch failed");
                Err(format!("fetch_error: {err:#}"))
            }
            Err(_) => {
                let err = LayerError::Timeout {
                    layer: kind,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                };
                tracing::warn!(layer = %kind, "{err}");
                Err(format!("{}: {err}", err.label()))
            }
        }
    }

    /// Records `result` in the run and reports it.
    async fn finish_layer(
        &self,
        ctx: &mut RunContext<'_>,
        result: LayerResult,
        reasons: Vec<String>,
    ) {
        let kind = result.layer();
        let status = result.status();
        let (level, suffix) = match status {
            LayerStatus::Computed => (LogLevel::Debug, "computed"),
            LayerStatus::Degraded => (LogLevel::Warn, "degraded"),
            LayerStatus::Skipped => (LogLevel::Warn, "skipped"),
            LayerStatus::Failed => (LogLevel::Error, "failed"),
        };
        let payload = json!({
            "run_id": ctx.run_id(),
            "layer": kind,
            "status": status,
            "confidence": result.confidence().map(f64::from),
            "source": result.source(),
            "reasons": reasons,
        });
        self.log(
            self.telemetry
                .record(level, &format!("layer {suffix}"))
                .with_run(ctx.run_id().to_string())
                .with_layer(kind.name())
                .with_fields(&payload),
        );
        ctx.record(result, reasons);
        self.emit(&format!("pipeline.layer.{suffix}"), payload).await;
    }

    /// Fits one layer and records the new model version.
    ///
    /// On error the stage keeps its previous model and readiness.
    #[instrument(skip(self, data), fields(samples = data.len()))]
    pub async fn fit_layer(
        &self,
        kind: LayerKind,
        data: &TrainingSet,
    ) -> Result<TrainingResult, PipelineError> {
        let outcome = self.stages.slot(kind).fit(data, &self.models);
        match &outcome {
            Ok(trained) => {
                self.log(
                    self.telemetry
                        .record(LogLevel::Info, "layer fitted")
                        .with_layer(kind.name())
                        .with_field("version", trained.version)
                        .with_field("samples", trained.samples),
                );
                self.emit(
                    "pipeline.layer.fitted",
                    json!({
                        "layer": kind,
                        "version": trained.version,
                        "samples": trained.samples,
                        "metrics": trained.metrics,
                    }),
                )
                .await;
            }
            Err(err) => self.log(
                self.telemetry
                    .record(LogLevel::Warn, "layer fit rejected")
                    .with_layer(kind.name())
                    .with_field("error", err.to_string()),
            ),
        }
        outcome
    }

    /// Fits every layer that has a `<layer>.jsonl` file in `dir`.
    pub async fn fit_from_dir(&self, dir: impl AsRef<Path>) -> Result<Vec<TrainingResult>> {
        let dir = dir.as_ref();
        let mut fitted = Vec::new();
        for kind in LayerKind::ORDER {
            let path = dir.join(format!("{}.jsonl", kind.name()));
            if !path.exists() {
                continue;
            }
            let data = TrainingSet::from_jsonl(&path)?;
            let trained = self
                .fit_layer(kind, &data)
                .await
                .with_context(|| format!("failed to fit {kind} from {}", path.display()))?;
            fitted.push(trained);
        }
        Ok(fitted)
    }

    /// Readiness and model version per layer.
    #[must_use]
    pub fn status(&self) -> StatusReport {
        StatusReport {
            layers: self
                .stages
                .iter()
                .map(|slot| {
                    let metadata = slot.metadata();
                    LayerReadiness {
                        layer: slot.kind(),
                        ready: slot.is_ready(),
                        model_version: metadata.as_ref().map(|m| m.version),
                        fitted_at: metadata.map(|m| m.fitted_at),
                    }
                })
                .collect(),
            cached_results: self.cache.len(),
        }
    }

    /// Flushes the model registry and emits the final lifecycle event.
    pub async fn shutdown(&self) -> Result<()> {
        self.models.flush().context("failed to flush model registry")?;
        self.log(
            self.telemetry
                .record(LogLevel::Info, "pipeline shutdown")
                .with_field("models", self.models.all().len()),
        );
        self.telemetry
            .event(
                "pipeline.shutdown",
                json!({ "models": self.models.all().len(), "cached_results": self.cache.len() }),
            )
            .await
    }

    fn log(&self, record: LogRecord) {
        if let Err(err) = self.telemetry.log(&record) {
            tracing::warn!(error = %err, "failed to write pipeline log record");
        }
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(err) = self.telemetry.event(event_type, payload).await {
            tracing::warn!(event_type, error = %err, "failed to publish pipeline event");
        }
    }
}

/// Applies a state change, flagging edges outside the state machine.
fn advance(ctx: &mut RunContext<'_>, kind: LayerKind, to: LayerState) {
    let outcome = ctx.transition(kind, to);
    debug_assert!(outcome.is_ok(), "{outcome:?}");
    if let Err(err) = outcome {
        tracing::error!(%err, "rejected layer transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        contract::TrainingWindow,
        degradation::{DegradationPolicy, FallbackStrategy},
        input::FeatureValue,
        result::{Confidence, DataSource, Prediction},
        source::{StaticFeatureSource, SyntheticFeatureSource},
        stages::{FirmImpactStage, IndustryResponseStage},
    };
    use async_trait::async_trait;
    use futures::future::join_all;
    use indexmap::IndexMap;
    use shared_event_bus::MemoryEventBus;
    use std::io::Write;
    use tempfile::tempdir;

    const SEED: u64 = 7;

    fn steel_event() -> PolicyEvent {
        PolicyEvent::builder("25% tariff on steel imports from CountryX")
            .source_country("CountryY")
            .target_country("CountryX")
            .tariff_rate(0.25)
            .sector("steel")
            .build()
            .unwrap()
    }

    fn orchestrator(source: impl FeatureSource + 'static) -> Orchestrator {
        Orchestrator::builder()
            .with_reference_stages()
            .feature_source(source)
            .build()
            .unwrap()
    }

    /// Delegates to the synthetic source but never answers for one layer.
    struct StallingSource {
        inner: SyntheticFeatureSource,
        stalled: LayerKind,
    }

    #[async_trait]
    impl FeatureSource for StallingSource {
        async fn fetch(&self, request: &FeatureRequest) -> Result<Option<FeatureBundle>> {
            if request.layer == self.stalled {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.inner.fetch(request).await
        }
    }

    /// Delegates to the synthetic source with one key removed for one layer.
    struct DroppingSource {
        inner: SyntheticFeatureSource,
        layer: LayerKind,
        key: &'static str,
    }

    #[async_trait]
    impl FeatureSource for DroppingSource {
        async fn fetch(&self, request: &FeatureRequest) -> Result<Option<FeatureBundle>> {
            let mut features = self.inner.generate(request);
            if request.layer == self.layer {
                features.shift_remove(self.key);
            }
            Ok(Some(FeatureBundle::new(features)))
        }
    }

    /// Fires the cancellation signal while serving one layer's fetch.
    struct CancellingSource {
        inner: SyntheticFeatureSource,
        at: LayerKind,
        signal: CancellationSignal,
    }

    #[async_trait]
    impl FeatureSource for CancellingSource {
        async fn fetch(&self, request: &FeatureRequest) -> Result<Option<FeatureBundle>> {
            if request.layer == self.at {
                self.signal.cancel();
            }
            self.inner.fetch(request).await
        }
    }

    struct PanickingFirmStage;

    impl Layer for PanickingFirmStage {
        fn kind(&self) -> LayerKind {
            LayerKind::FirmImpact
        }

        fn required_inputs(&self) -> &'static [&'static str] {
            &["sector_impact"]
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn fit(
            &mut self,
            _data: &TrainingSet,
            _version: u32,
        ) -> Result<TrainingResult, LayerError> {
            Err(LayerError::InsufficientData {
                layer: LayerKind::FirmImpact,
                available: 0,
                required: 1,
            })
        }

        fn fork(&self) -> Box<dyn Layer> {
            Box::new(Self)
        }

        fn confidence_floor(&self) -> Confidence {
            Confidence::clamped(0.5)
        }

        fn predict(&self, _input: &LayerInput) -> Result<LayerResult, LayerError> {
            panic!("firm model exploded")
        }

        fn metadata(&self) -> Option<&TrainingResult> {
            None
        }
    }

    /// Firm stage whose hazard and confidence both encode the fitted version.
    #[derive(Clone, Default)]
    struct VersionedFirmStage {
        record: Option<TrainingResult>,
        hazard: f64,
        confidence: f64,
    }

    impl Layer for VersionedFirmStage {
        fn kind(&self) -> LayerKind {
            LayerKind::FirmImpact
        }

        fn required_inputs(&self) -> &'static [&'static str] {
            &["sector_impact"]
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn fit(&mut self, data: &TrainingSet, version: u32) -> Result<TrainingResult, LayerError> {
            let now = Utc::now();
            self.hazard = f64::from(version) / 100.0;
            // widen the window in which a reader could observe half an update
            std::thread::sleep(Duration::from_millis(2));
            self.confidence = f64::from(version) / 100.0;
            let record = TrainingResult {
                layer: LayerKind::FirmImpact,
                version,
                window: TrainingWindow { start: now, end: now },
                samples: data.len(),
                metrics: IndexMap::new(),
                fitted_at: now,
            };
            self.record = Some(record.clone());
            Ok(record)
        }

        fn fork(&self) -> Box<dyn Layer> {
            Box::new(self.clone())
        }

        fn confidence_floor(&self) -> Confidence {
            Confidence::ZERO
        }

        fn predict(&self, _input: &LayerInput) -> Result<LayerResult, LayerError> {
            Ok(LayerResult::computed(
                Prediction::FirmImpact {
                    employment_hazard: self.hazard,
                    layoff_share: 0.0,
                    margin_compression: 0.0,
                },
                Confidence::clamped(self.confidence),
            ))
        }

        fn metadata(&self) -> Option<&TrainingResult> {
            self.record.as_ref()
        }
    }

    fn with_panicking_firm_stage() -> Vec<Box<dyn Layer>> {
        reference_stages()
            .into_iter()
            .map(|stage| -> Box<dyn Layer> {
                if stage.kind() == LayerKind::FirmImpact {
                    Box::new(PanickingFirmStage)
                } else {
                    stage
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn steel_scenario_completes() {
        let orchestrator = orchestrator(SyntheticFeatureSource::new(SEED));
        let result = orchestrator.run(&steel_event()).await;
        assert_eq!(result.status, PipelineStatus::Complete);
        assert_eq!(result.layers.len(), 6);
        assert!(result
            .layers
            .iter()
            .all(|layer| layer.status() == LayerStatus::Computed));
        assert!(result.ledger.substituted().is_empty());
        assert!(result.aggregate_confidence > 0.0 && result.aggregate_confidence <= 0.5);
        let order: Vec<LayerKind> = result.layers.iter().map(LayerResult::layer).collect();
        assert_eq!(order, LayerKind::ORDER.to_vec());
        let Prediction::TradeFlow { aggregate_delta, .. } =
            result.layer(LayerKind::TradeFlow).unwrap().prediction()
        else {
            panic!("wrong prediction kind");
        };
        assert!(*aggregate_delta < 0.0);
    }

    #[tokio::test]
    async fn stalled_fetch_degrades_only_that_layer() {
        let orchestrator = orchestrator(StallingSource {
            inner: SyntheticFeatureSource::new(SEED),
            stalled: LayerKind::FirmImpact,
        });
        let options = RunOptions::default().fetch_timeout(Duration::from_millis(50));
        let result = orchestrator.run_with(&steel_event(), options).await;
        let firm = result.layer(LayerKind::FirmImpact).unwrap();
        assert_eq!(firm.status(), LayerStatus::Degraded);
        assert_eq!(firm.source(), &DataSource::Heuristic);
        assert!(firm.contribution() <= 0.3);
        assert_eq!(result.status, PipelineStatus::Partial);
        for downstream in [LayerKind::ConsumerImpact, LayerKind::Geopolitical] {
            assert_eq!(
                result.layer(downstream).unwrap().status(),
                LayerStatus::Computed
            );
        }
        let entry = result.ledger.entry(LayerKind::FirmImpact).unwrap();
        assert!(entry.reasons.iter().any(|r| r.starts_with("timeout")));
        assert_eq!(result.ledger.substituted(), vec![LayerKind::FirmImpact]);
    }

    #[tokio::test]
    async fn stalled_fetch_without_fallback_skips() {
        let config = PipelineConfig {
            degradation: DegradationPolicy::default()
                .with_chain(LayerKind::FirmImpact, vec![FallbackStrategy::Skip]),
            ..PipelineConfig::default()
        };
        let orchestrator = Orchestrator::builder()
            .with_reference_stages()
            .feature_source(StallingSource {
                inner: SyntheticFeatureSource::new(SEED),
                stalled: LayerKind::FirmImpact,
            })
            .config(config)
            .build()
            .unwrap();
        let options = RunOptions::default().fetch_timeout(Duration::from_millis(50));
        let result = orchestrator.run_with(&steel_event(), options).await;
        let firm = result.layer(LayerKind::FirmImpact).unwrap();
        assert_eq!(firm.status(), LayerStatus::Skipped);
        assert_eq!(result.status, PipelineStatus::Partial);
        assert_eq!(
            result.layer(LayerKind::ConsumerImpact).unwrap().status(),
            LayerStatus::Computed
        );
        assert!(result
            .transitions
            .iter()
            .any(|t| t.layer == LayerKind::FirmImpact
                && t.from == LayerState::Validating
                && t.to == LayerState::Skipped));
    }

    #[tokio::test]
    async fn second_run_reuses_cached_result() {
        let event = steel_event();
        let source = Arc::new(StallingSource {
            inner: SyntheticFeatureSource::new(SEED),
            stalled: LayerKind::FirmImpact,
        });
        let orchestrator = Orchestrator::builder()
            .with_reference_stages()
            .shared_feature_source(source)
            .build()
            .unwrap();

        // prime the cache with a run that sees every feature
        let primed = Orchestrator::builder()
            .with_reference_stages()
            .feature_source(SyntheticFeatureSource::new(SEED))
            .build()
            .unwrap()
            .run(&event)
            .await;
        let firm = primed.layer(LayerKind::FirmImpact).unwrap();
        assert!(orchestrator
            .cache()
            .store(CacheKey::for_event(LayerKind::FirmImpact, &event), firm));

        let options = RunOptions::default().fetch_timeout(Duration::from_millis(50));
        let result = orchestrator.run_with(&event, options).await;
        let degraded = result.layer(LayerKind::FirmImpact).unwrap();
        assert_eq!(degraded.status(), LayerStatus::Degraded);
        assert!(matches!(degraded.source(), DataSource::CachedResult { .. }));
        assert_eq!(degraded.prediction(), firm.prediction());
        assert!((degraded.contribution() - firm.contribution() * 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn removing_any_input_never_errors() {
        let cases = [
            (LayerKind::TradeFlow, "trade_volume"),
            (LayerKind::TradeFlow, "import_elasticity"),
            (LayerKind::IndustryResponse, "sector_exposure"),
            (LayerKind::FirmImpact, "firm_leverage"),
            (LayerKind::FirmImpact, "labor_intensity"),
            (LayerKind::ConsumerImpact, "pass_through_rate"),
            (LayerKind::Geopolitical, "sentiment_baseline"),
        ];
        for (layer, key) in cases {
            let orchestrator = orchestrator(DroppingSource {
                inner: SyntheticFeatureSource::new(SEED),
                layer,
                key,
            });
            let result = orchestrator.run(&steel_event()).await;
            assert_eq!(result.layers.len(), 6, "{layer}/{key}");
            let status = result.layer(layer).unwrap().status();
            assert!(
                matches!(status, LayerStatus::Degraded | LayerStatus::Skipped),
                "{layer}/{key}: {status:?}"
            );
            assert_eq!(result.status, PipelineStatus::Partial);
            let reasons = &result.ledger.entry(layer).unwrap().reasons;
            assert!(reasons.iter().any(|r| r.contains(key)), "{reasons:?}");
            for downstream in LayerKind::ORDER.iter().skip(layer.index() + 1) {
                assert_eq!(
                    result.layer(*downstream).unwrap().status(),
                    LayerStatus::Computed,
                    "{downstream} after {layer}/{key}"
                );
            }
        }
    }

    #[tokio::test]
    async fn unready_stage_degrades_and_downstream_continues() {
        let stages: Vec<Box<dyn Layer>> = reference_stages()
            .into_iter()
            .map(|stage| -> Box<dyn Layer> {
                if stage.kind() == LayerKind::IndustryResponse {
                    Box::new(IndustryResponseStage::untrained())
                } else {
                    stage
                }
            })
            .collect();
        let orchestrator = Orchestrator::builder()
            .stages(stages)
            .feature_source(SyntheticFeatureSource::new(SEED))
            .build()
            .unwrap();
        let result = orchestrator.run(&steel_event()).await;
        let industry = result.layer(LayerKind::IndustryResponse).unwrap();
        assert_eq!(industry.status(), LayerStatus::Degraded);
        assert!(result
            .ledger
            .entry(LayerKind::IndustryResponse)
            .unwrap()
            .reasons
            .contains(&"stage not ready".to_string()));
        assert_eq!(
            result.layer(LayerKind::FirmImpact).unwrap().status(),
            LayerStatus::Computed
        );
    }

    #[tokio::test]
    async fn degrading_a_layer_never_raises_aggregate() {
        let event = steel_event();
        let complete = orchestrator(SyntheticFeatureSource::new(SEED)).run(&event).await;
        let degraded = orchestrator(StallingSource {
            inner: SyntheticFeatureSource::new(SEED),
            stalled: LayerKind::TradeFlow,
        })
        .run_with(
            &event,
            RunOptions::default().fetch_timeout(Duration::from_millis(50)),
        )
        .await;
        assert!(degraded.aggregate_confidence <= complete.aggregate_confidence);
    }

    #[tokio::test]
    async fn generous_heuristic_ceiling_is_held_to_the_stage_floor() {
        let config = PipelineConfig {
            degradation: DegradationPolicy::default().with_chain(
                LayerKind::FirmImpact,
                vec![FallbackStrategy::Heuristic {
                    intercept: 0.05,
                    slope: 0.5,
                    ceiling: 0.9,
                }],
            ),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_ok());
        let event = steel_event();
        let build = |source: Arc<dyn FeatureSource>| {
            Orchestrator::builder()
                .with_reference_stages()
                .shared_feature_source(source)
                .config(config.clone())
                .build()
                .unwrap()
        };
        let healthy: Arc<dyn FeatureSource> = Arc::new(SyntheticFeatureSource::new(SEED));
        let complete = build(healthy).run(&event).await;
        assert_eq!(complete.status, PipelineStatus::Complete);
        let stalled: Arc<dyn FeatureSource> = Arc::new(StallingSource {
            inner: SyntheticFeatureSource::new(SEED),
            stalled: LayerKind::FirmImpact,
        });
        let degraded = build(stalled)
            .run_with(
                &event,
                RunOptions::default().fetch_timeout(Duration::from_millis(50)),
            )
            .await;
        let firm = degraded.layer(LayerKind::FirmImpact).unwrap();
        assert_eq!(firm.status(), LayerStatus::Degraded);
        assert_eq!(firm.source(), &DataSource::Heuristic);
        let primary = complete.layer(LayerKind::FirmImpact).unwrap();
        assert!(firm.contribution() <= primary.contribution());
        assert!(firm.notes().iter().any(|n| n.starts_with("confidence capped")));
        assert!(degraded.aggregate_confidence <= complete.aggregate_confidence);
    }

    #[tokio::test]
    async fn runs_are_idempotent() {
        let orchestrator = orchestrator(SyntheticFeatureSource::new(SEED));
        let event = steel_event();
        let first = orchestrator.run(&event).await;
        let second = orchestrator.run(&event).await;
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(first.layers, second.layers);
        assert!((first.aggregate_confidence - second.aggregate_confidence).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn panicking_stage_fails_the_layer() {
        let orchestrator = Orchestrator::builder()
            .stages(with_panicking_firm_stage())
            .feature_source(SyntheticFeatureSource::new(SEED))
            .build()
            .unwrap();
        let result = orchestrator.run(&steel_event()).await;
        let firm = result.layer(LayerKind::FirmImpact).unwrap();
        assert_eq!(firm.status(), LayerStatus::Failed);
        assert!(firm.notes().iter().any(|n| n.contains("firm model exploded")));
        assert_eq!(result.status, PipelineStatus::Failed);
        assert!(result.aggregate_confidence.abs() < f64::EPSILON);
        assert_eq!(result.layers.len(), 6);
    }

    #[tokio::test]
    async fn recovered_fault_walks_the_fallback_chain() {
        let config = PipelineConfig {
            recover_stage_faults: true,
            ..PipelineConfig::default()
        };
        let orchestrator = Orchestrator::builder()
            .stages(with_panicking_firm_stage())
            .feature_source(SyntheticFeatureSource::new(SEED))
            .config(config)
            .build()
            .unwrap();
        let result = orchestrator.run(&steel_event()).await;
        assert_eq!(
            result.layer(LayerKind::FirmImpact).unwrap().status(),
            LayerStatus::Degraded
        );
        assert_eq!(result.status, PipelineStatus::Partial);
        assert!(result
            .transitions
            .iter()
            .any(|t| t.from == LayerState::Executing && t.to == LayerState::Degrading));
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_layers() {
        let signal = CancellationSignal::new();
        let orchestrator = orchestrator(CancellingSource {
            inner: SyntheticFeatureSource::new(SEED),
            at: LayerKind::IndustryResponse,
            signal: signal.clone(),
        });
        let result = orchestrator
            .run_with(&steel_event(), RunOptions::default().cancel_on(signal))
            .await;
        assert_eq!(result.status, PipelineStatus::Cancelled);
        assert_eq!(result.layers.len(), 6);
        for (idx, layer) in result.layers.iter().enumerate() {
            let expected = if idx <= LayerKind::IndustryResponse.index() {
                LayerStatus::Computed
            } else {
                LayerStatus::Skipped
            };
            assert_eq!(layer.status(), expected, "{}", layer.layer());
        }
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_orchestrator() {
        let orchestrator = Arc::new(orchestrator(SyntheticFeatureSource::new(SEED)));
        let event = steel_event();
        let results = join_all((0..8).map(|_| orchestrator.run(&event))).await;
        assert!(results
            .iter()
            .all(|result| result.status == PipelineStatus::Complete));
        assert!(results.windows(2).all(|w| w[0].layers == w[1].layers));

        let shared = Arc::clone(&orchestrator);
        let spawned = tokio::spawn(async move {
            let event = steel_event();
            shared.run(&event).await
        })
        .await
        .unwrap();
        assert_eq!(spawned.status, PipelineStatus::Complete);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fits_interleave_with_runs_without_torn_models() {
        const FITS: u32 = 12;
        let orchestrator = Arc::new(
            Orchestrator::builder()
                .stage(Box::new(VersionedFirmStage::default()))
                .stages(
                    reference_stages()
                        .into_iter()
                        .filter(|stage| stage.kind() != LayerKind::FirmImpact),
                )
                .feature_source(SyntheticFeatureSource::new(SEED))
                .build()
                .unwrap(),
        );
        let fitter = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                let mut versions = Vec::new();
                for _ in 0..FITS {
                    let trained = orchestrator
                        .fit_layer(LayerKind::FirmImpact, &TrainingSet::default())
                        .await
                        .unwrap();
                    versions.push(trained.version);
                    tokio::task::yield_now().await;
                }
                versions
            })
        };
        let runners: Vec<_> = (0..4)
            .map(|_| {
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    let event = steel_event();
                    let mut seen = Vec::new();
                    for _ in 0..10 {
                        let result = orchestrator.run(&event).await;
                        seen.push(result.layer(LayerKind::FirmImpact).unwrap().clone());
                    }
                    seen
                })
            })
            .collect();

        let versions = fitter.await.unwrap();
        assert_eq!(versions, (1..=FITS).collect::<Vec<_>>());
        for runner in runners {
            let mut latest = 0.0;
            for firm in runner.await.unwrap() {
                assert_eq!(firm.status(), LayerStatus::Computed);
                let Prediction::FirmImpact {
                    employment_hazard, ..
                } = firm.prediction()
                else {
                    panic!("wrong prediction kind");
                };
                assert!((firm.contribution() - employment_hazard).abs() < f64::EPSILON);
                assert!(*employment_hazard >= latest);
                latest = *employment_hazard;
            }
        }
        let firm = orchestrator.status();
        assert_eq!(firm.layer(LayerKind::FirmImpact).unwrap().model_version, Some(FITS));
        let history: Vec<u32> = orchestrator
            .models()
            .history(LayerKind::FirmImpact)
            .iter()
            .map(|record| record.version)
            .collect();
        assert_eq!(history, versions);
    }

    #[tokio::test]
    async fn empty_fit_leaves_readiness_unchanged() {
        let orchestrator = orchestrator(NullFeatureSource);
        let before = orchestrator.status();
        let err = orchestrator
            .fit_layer(LayerKind::IndustryResponse, &TrainingSet::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Layer(LayerError::InsufficientData { available: 0, .. })
        ));
        assert_eq!(orchestrator.status(), before);
        assert!(orchestrator.models().all().is_empty());
    }

    #[tokio::test]
    async fn fit_layer_records_versions_and_events() {
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = PipelineTelemetry::builder("pipeline")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let orchestrator = Orchestrator::builder()
            .stage(Box::new(FirmImpactStage::untrained()))
            .stages(
                reference_stages()
                    .into_iter()
                    .filter(|stage| stage.kind() != LayerKind::FirmImpact),
            )
            .telemetry(telemetry)
            .build()
            .unwrap();
        assert!(!orchestrator.status().all_ready());

        let data: TrainingSet = (0..12)
            .map(|i| {
                let x = f64::from(i) / 12.0;
                crate::contract::TrainingSample::new(
                    IndexMap::from([
                        ("sector_impact".to_string(), FeatureValue::Number(-x)),
                        ("firm_leverage".to_string(), FeatureValue::Number(0.4)),
                        ("labor_intensity".to_string(), FeatureValue::Number(0.5)),
                    ]),
                    0.1 + 0.5 * x,
                )
            })
            .collect();
        let first = orchestrator.fit_layer(LayerKind::FirmImpact, &data).await.unwrap();
        let second = orchestrator.fit_layer(LayerKind::FirmImpact, &data).await.unwrap();
        assert_eq!((first.version, second.version), (1, 2));

        let status = orchestrator.status();
        assert!(status.all_ready());
        let firm = status.layer(LayerKind::FirmImpact).unwrap();
        assert_eq!(firm.model_version, Some(2));
        assert_eq!(orchestrator.models().history(LayerKind::FirmImpact).len(), 2);
        assert_eq!(bus.events_under("pipeline.layer.fitted").len(), 2);
    }

    #[tokio::test]
    async fn run_publishes_lifecycle_events_and_logs() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("pipeline.log");
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = PipelineTelemetry::builder("pipeline")
            .log_path(&log_path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let orchestrator = Orchestrator::builder()
            .with_reference_stages()
            .feature_source(SyntheticFeatureSource::new(SEED))
            .telemetry(telemetry)
            .build()
            .unwrap();
        let result = orchestrator.run(&steel_event()).await;

        assert_eq!(bus.events_under("pipeline.run.started").len(), 1);
        assert_eq!(bus.events_under("pipeline.layer.computed").len(), 6);
        let completed = bus.events_under("pipeline.run.completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].payload["status"], "complete");

        let records = shared_logging::read_records(&log_path).unwrap();
        let run_id = result.run_id.to_string();
        assert!(records
            .iter()
            .filter(|record| record.layer.is_some())
            .all(|record| record.run_id.as_deref() == Some(run_id.as_str())));

        orchestrator.shutdown().await.unwrap();
        assert_eq!(bus.events_under("pipeline.shutdown").len(), 1);
    }

    #[tokio::test]
    async fn static_source_without_features_degrades_downstream() {
        let source = StaticFeatureSource::new().with(
            LayerKind::TradeFlow,
            FeatureBundle::new(IndexMap::from([
                ("trade_volume".to_string(), FeatureValue::Number(120.0)),
                ("import_elasticity".to_string(), FeatureValue::Number(1.0)),
            ])),
        );
        let result = orchestrator(source).run(&steel_event()).await;
        assert_eq!(
            result.layer(LayerKind::PolicyTrigger).unwrap().status(),
            LayerStatus::Computed
        );
        assert_eq!(
            result.layer(LayerKind::TradeFlow).unwrap().status(),
            LayerStatus::Computed
        );
        assert_eq!(
            result.layer(LayerKind::IndustryResponse).unwrap().status(),
            LayerStatus::Degraded
        );
        assert_eq!(result.status, PipelineStatus::Partial);
        assert!(result.aggregate_confidence <= 0.3);
    }

    #[tokio::test]
    async fn registry_file_survives_restart() {
        let dir = tempdir().unwrap();
        let registry_path = dir.path().join("models.jsonl");
        let config = PipelineConfig {
            registry_path: Some(registry_path.clone()),
            ..PipelineConfig::default()
        };
        let train_dir = dir.path().join("train");
        std::fs::create_dir(&train_dir).unwrap();
        let mut file = std::fs::File::create(train_dir.join("industry_response.jsonl")).unwrap();
        for i in 0..10 {
            let x = f64::from(i) / 10.0;
            writeln!(
                file,
                "{}",
                json!({
                    "features": { "trade_flow_delta": -x, "exposure": 0.6 },
                    "target": -0.9 * x,
                    "observed_at": format!("2024-01-{:02}T00:00:00Z", i + 1),
                })
            )
            .unwrap();
        }
        drop(file);

        let first = Orchestrator::builder()
            .with_reference_stages()
            .config(config.clone())
            .build()
            .unwrap();
        let fitted = first.fit_from_dir(&train_dir).await.unwrap();
        assert_eq!(fitted.len(), 1);
        assert_eq!(fitted[0].layer, LayerKind::IndustryResponse);
        first.shutdown().await.unwrap();

        let reopened = Orchestrator::builder()
            .with_reference_stages()
            .config(config)
            .build()
            .unwrap();
        assert_eq!(reopened.models().next_version(LayerKind::IndustryResponse), 2);
    }

    #[test]
    fn duplicate_or_missing_stages_are_rejected() {
        let duplicate = Orchestrator::builder()
            .with_reference_stages()
            .stage(Box::new(FirmImpactStage::rule_based()))
            .build();
        assert!(matches!(
            duplicate,
            Err(PipelineError::DuplicateLayer(LayerKind::FirmImpact))
        ));
        let missing = Orchestrator::builder()
            .stage(Box::new(FirmImpactStage::rule_based()))
            .build();
        assert!(matches!(missing, Err(PipelineError::MissingLayer(_))));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PipelineConfig {
            fetch_timeout_ms: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            Orchestrator::builder().with_reference_stages().config(config).build(),
            Err(PipelineError::Config(_))
        ));
    }
}
