#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Ripple tariff-impact pipeline: six ordered layers turning a policy
//! announcement into trade, industry, firm, consumer and geopolitical
//! forecasts, with confidence propagation and graceful degradation.

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Layer and pipeline error taxonomy.
#[path = "../error.rs"]
pub mod error;

/// Validated policy announcements.
#[path = "../event.rs"]
pub mod event;

/// Feature values, layer inputs and upstream requests.
#[path = "../input.rs"]
pub mod input;

/// Layer identities, predictions and run results.
#[path = "../result.rs"]
pub mod result;

/// The stage contract and training data.
#[path = "../contract.rs"]
pub mod contract;

/// Aggregate confidence across layers.
#[path = "../confidence.rs"]
pub mod confidence;

/// Per-run state machine and degradation ledger.
#[path = "../context.rs"]
pub mod context;

/// Input checks applied before a stage executes.
#[path = "../validation.rs"]
pub mod validation;

/// Fallback chains and the cross-run result cache.
#[path = "../degradation.rs"]
pub mod degradation;

/// TOML configuration.
#[path = "../config.rs"]
pub mod config;

/// Upstream feature collaborators.
#[path = "../source.rs"]
pub mod source;

/// Stage slots and the model registry.
#[path = "../registry.rs"]
pub mod registry;

/// Reference stage implementations.
#[path = "../stages/main.rs"]
pub mod stages;

/// Orchestrator runtime.
#[path = "../main.rs"]
pub mod runtime;

pub use confidence::{aggregate, ConfidenceWeights};
pub use config::{LoggingSettings, PipelineConfig};
pub use context::{DegradationLedger, LayerState, LedgerEntry, RunContext, StateTransition};
pub use contract::{Layer, ModelMetadata, TrainingResult, TrainingSample, TrainingSet};
pub use degradation::{CacheSettings, DegradationPolicy, FallbackStrategy, ResultCache};
pub use error::{LayerError, PipelineError};
pub use event::{PolicyEvent, PolicyEventBuilder};
pub use input::{FeatureBundle, FeatureRequest, FeatureValue, LayerInput};
pub use registry::{read_model_records, ModelRegistry, StageRegistry};
pub use result::{
    Confidence, DataSource, LayerKind, LayerResult, LayerStatus, PipelineResult, PipelineStatus,
    Prediction,
};
pub use runtime::{
    CancellationSignal, LayerReadiness, Orchestrator, OrchestratorBuilder, RunOptions, StatusReport,
};
pub use source::{
    FeatureSource, JsonFeatureSource, NullFeatureSource, StaticFeatureSource,
    SyntheticFeatureSource,
};
pub use stages::{reference_stages, untrained_stages};
pub use telemetry::{PipelineTelemetry, PipelineTelemetryBuilder};
