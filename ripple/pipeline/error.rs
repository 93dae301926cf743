use thiserror::Error;

use crate::result::LayerKind;

/// Errors raised across the layer contract.
///
/// `Schema` and `InsufficientData` belong to training, `MissingInput` is a
/// caller contract violation during prediction, `StageFault` is an internal
/// stage failure and `Timeout` marks an external feature fetch that did not
/// answer in time.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayerError {
    /// Malformed or missing required field.
    #[error("schema error in {layer}: {detail}")]
    Schema {
        /// Layer reporting the error.
        layer: LayerKind,
        /// What was wrong.
        detail: String,
    },
    /// Training set empty or below the stage minimum.
    #[error("insufficient training data for {layer}: {available} samples, need at least {required}")]
    InsufficientData {
        /// Layer reporting the error.
        layer: LayerKind,
        /// Samples supplied.
        available: usize,
        /// Stage-defined minimum.
        required: usize,
    },
    /// A key required by `predict` is absent from the layer input.
    #[error("missing input `{key}` for {layer}")]
    MissingInput {
        /// Layer reporting the error.
        layer: LayerKind,
        /// Absent key.
        key: String,
    },
    /// Unexpected internal failure.
    #[error("stage fault in {layer}: {detail}")]
    StageFault {
        /// Layer reporting the error.
        layer: LayerKind,
        /// Fault description.
        detail: String,
    },
    /// External data fetch exceeded its deadline.
    #[error("feature fetch for {layer} timed out after {timeout_ms} ms")]
    Timeout {
        /// Layer whose inputs were being fetched.
        layer: LayerKind,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },
}

impl LayerError {
    /// Layer the error refers to.
    #[must_use]
    pub const fn layer(&self) -> LayerKind {
        match self {
            Self::Schema { layer, .. }
            | Self::InsufficientData { layer, .. }
            | Self::MissingInput { layer, .. }
            | Self::StageFault { layer, .. }
            | Self::Timeout { layer, .. } => *layer,
        }
    }

    /// Short taxonomy label used in ledgers and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "schema_error",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::MissingInput { .. } => "missing_input",
            Self::StageFault { .. } => "stage_fault",
            Self::Timeout { .. } => "timeout",
        }
    }
}

/// Errors raised while constructing, configuring, or training the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed policy event.
    #[error("invalid policy event: {0}")]
    Schema(String),
    /// Invalid pipeline configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A layer name that does not map to any stage.
    #[error("unknown layer name `{0}`")]
    UnknownLayer(String),
    /// Two stages registered for the same layer.
    #[error("layer {0} registered more than once")]
    DuplicateLayer(LayerKind),
    /// No stage registered for a layer.
    #[error("no stage registered for layer {0}")]
    MissingLayer(LayerKind),
    /// Model registry rejected or failed to persist a record.
    #[error("model registry: {0}")]
    Registry(String),
    /// Training failure surfaced from a stage.
    #[error(transparent)]
    Layer(#[from] LayerError),
}
