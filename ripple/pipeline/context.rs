//! Per-invocation run state: accumulated results, carried features, the
//! degradation ledger and the per-layer state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    event::PolicyEvent,
    input::{FeatureValue, LayerInput},
    result::{DataSource, LayerKind, LayerResult, LayerStatus, PipelineResult, PipelineStatus},
};

/// Lifecycle state of one layer within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerState {
    /// Waiting for its predecessor.
    Pending,
    /// Checking inputs and readiness.
    Validating,
    /// Running the stage's primary path.
    Executing,
    /// Walking the fallback chain.
    Degrading,
    /// Primary output recorded.
    Computed,
    /// Fallback output recorded.
    Degraded,
    /// Neutral placeholder recorded.
    Skipped,
    /// Stage fault recorded.
    Failed,
}

impl LayerState {
    /// Whether `self → next` is an edge of the layer state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Validating | Self::Skipped)
                | (Self::Validating, Self::Executing | Self::Degrading | Self::Skipped)
                | (Self::Executing, Self::Computed | Self::Failed | Self::Degrading)
                | (Self::Degrading, Self::Degraded | Self::Skipped | Self::Failed)
        )
    }

    /// True once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Computed | Self::Degraded | Self::Skipped | Self::Failed
        )
    }
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::Degrading => "degrading",
            Self::Computed => "computed",
            Self::Degraded => "degraded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for {layer}: {from} -> {to}")]
pub struct IllegalTransition {
    /// Layer whose state was being changed.
    pub layer: LayerKind,
    /// Current state.
    pub from: LayerState,
    /// Requested state.
    pub to: LayerState,
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Layer that changed state.
    pub layer: LayerKind,
    /// Previous state.
    pub from: LayerState,
    /// New state.
    pub to: LayerState,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Ledger line for one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Layer described.
    pub layer: LayerKind,
    /// Final status.
    pub status: LayerStatus,
    /// Where the output came from.
    pub source: DataSource,
    /// Why a fallback or placeholder was used; empty on the primary path.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

/// Record of real-versus-substituted data for every layer of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegradationLedger {
    entries: Vec<LedgerEntry>,
}

impl DegradationLedger {
    /// Appends an entry.
    pub fn record(&mut self, entry: LedgerEntry) {
        self.entries.push(entry);
    }

    /// Entries in traversal order.
    #[must_use]
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Entry for `layer`.
    #[must_use]
    pub fn entry(&self, layer: LayerKind) -> Option<&LedgerEntry> {
        self.entries.iter().find(|entry| entry.layer == layer)
    }

    /// Layers that did not use their primary path.
    #[must_use]
    pub fn substituted(&self) -> Vec<LayerKind> {
        self.entries
            .iter()
            .filter(|entry| entry.source != DataSource::Primary)
            .map(|entry| entry.layer)
            .collect()
    }

    /// True when every layer used its primary path.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.source == DataSource::Primary)
    }
}

/// Mutable state scoped to one event's traversal of the pipeline.
#[derive(Debug)]
pub struct RunContext<'a> {
    run_id: Uuid,
    event: &'a PolicyEvent,
    started_at: DateTime<Utc>,
    states: IndexMap<LayerKind, LayerState>,
    results: Vec<LayerResult>,
    carried: IndexMap<String, FeatureValue>,
    ledger: DegradationLedger,
    transitions: Vec<StateTransition>,
}

impl<'a> RunContext<'a> {
    /// Fresh context with every layer `Pending`.
    #[must_use]
    pub fn new(event: &'a PolicyEvent) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            event,
            started_at: Utc::now(),
            states: LayerKind::ORDER
                .iter()
                .map(|kind| (*kind, LayerState::Pending))
                .collect(),
            results: Vec::with_capacity(LayerKind::ORDER.len()),
            carried: event.base_features(),
            ledger: DegradationLedger::default(),
            transitions: Vec::new(),
        }
    }

    /// Run identifier.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Event being processed.
    #[must_use]
    pub const fn event(&self) -> &'a PolicyEvent {
        self.event
    }

    /// Current state of `layer`.
    #[must_use]
    pub fn state(&self, layer: LayerKind) -> LayerState {
        self.states
            .get(&layer)
            .copied()
            .unwrap_or(LayerState::Pending)
    }

    /// Moves `layer` to `to`, rejecting edges outside the state machine.
    pub fn transition(
        &mut self,
        layer: LayerKind,
        to: LayerState,
    ) -> Result<(), IllegalTransition> {
        let from = self.state(layer);
        if !from.can_transition_to(to) {
            return Err(IllegalTransition { layer, from, to });
        }
        self.states.insert(layer, to);
        self.transitions.push(StateTransition {
            layer,
            from,
            to,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Input for `layer`: event features plus everything upstream layers exported.
    ///
    /// Later layers override earlier ones on key collisions, so the immediate
    /// predecessor always wins.
    #[must_use]
    pub fn assemble_input(&self, layer: LayerKind) -> LayerInput {
        let mut input = LayerInput::new(layer);
        for (key, value) in &self.carried {
            input.insert(key.clone(), value.clone());
        }
        input
    }

    /// Stores a finished layer result and carries its exports forward.
    pub fn record(&mut self, result: LayerResult, reasons: Vec<String>) {
        self.carried.extend(result.prediction().exports());
        self.ledger.record(LedgerEntry {
            layer: result.layer(),
            status: result.status(),
            source: result.source().clone(),
            reasons,
        });
        self.results.push(result);
    }

    /// Results recorded so far, in traversal order.
    #[must_use]
    pub fn results(&self) -> &[LayerResult] {
        &self.results
    }

    /// Ledger so far.
    #[must_use]
    pub const fn ledger(&self) -> &DegradationLedger {
        &self.ledger
    }

    /// Consumes the context into the final pipeline result.
    #[must_use]
    pub fn finish(self, status: PipelineStatus, aggregate_confidence: f64) -> PipelineResult {
        PipelineResult {
            run_id: self.run_id,
            event_id: self.event.id(),
            layers: self.results,
            aggregate_confidence,
            status,
            ledger: self.ledger,
            transitions: self.transitions,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}
