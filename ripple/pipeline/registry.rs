//! Stage registration and the append-only model registry.

use std::{
    any::Any,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::{
    contract::{Layer, ModelMetadata, TrainingResult, TrainingSet},
    error::{LayerError, PipelineError},
    input::LayerInput,
    result::{Confidence, LayerKind, LayerResult, LayerStatus},
};

/// One registered stage.
///
/// Predictions share the read lock. Fits serialize on the per-stage fit gate
/// and train a forked copy of the stage; the copy replaces the live stage under
/// the write lock only after its model record is stored, so runs see either the
/// old model or the new one, never a partial update.
pub struct StageSlot {
    kind: LayerKind,
    stage: RwLock<Box<dyn Layer>>,
    fit_gate: Mutex<()>,
}

impl StageSlot {
    /// Layer served by the slot.
    #[must_use]
    pub const fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Keys the stage needs in its input.
    #[must_use]
    pub fn required_inputs(&self) -> &'static [&'static str] {
        self.stage.read().required_inputs()
    }

    /// Whether the stage can predict.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.stage.read().is_ready()
    }

    /// Cap applied to fallback results for the layer.
    #[must_use]
    pub fn confidence_floor(&self) -> Confidence {
        self.stage.read().confidence_floor()
    }

    /// Metadata of the model in use.
    #[must_use]
    pub fn metadata(&self) -> Option<TrainingResult> {
        self.stage.read().metadata().cloned()
    }

    /// Runs `predict`, turning panics and malformed results into stage faults.
    pub fn predict(&self, input: &LayerInput) -> Result<LayerResult, LayerError> {
        let stage = self.stage.read();
        let result = guarded(self.kind, || stage.predict(input))?;
        if result.layer() != self.kind {
            return Err(LayerError::StageFault {
                layer: self.kind,
                detail: format!("stage returned a {} result", result.layer()),
            });
        }
        if result.status() != LayerStatus::Computed {
            return Err(LayerError::StageFault {
                layer: self.kind,
                detail: format!("stage returned status {:?}", result.status()),
            });
        }
        if !result.prediction().headline().is_finite() {
            return Err(LayerError::StageFault {
                layer: self.kind,
                detail: "stage returned a non-finite prediction".into(),
            });
        }
        Ok(result)
    }

    /// Fits the stage under the next registry version and records the result.
    ///
    /// Version assignment, fitting and the registry append all happen under
    /// the fit gate, so versions of one layer never collide. The live stage is
    /// untouched unless the append succeeds.
    pub fn fit(
        &self,
        data: &TrainingSet,
        models: &ModelRegistry,
    ) -> Result<TrainingResult, PipelineError> {
        let _gate = self.fit_gate.lock();
        let version = models.next_version(self.kind);
        let mut staged = self.stage.read().fork();
        let result = guarded(self.kind, || staged.fit(data, version))?;
        if result.layer != self.kind || result.version != version {
            return Err(LayerError::StageFault {
                layer: self.kind,
                detail: format!(
                    "stage recorded {} v{} instead of v{version}",
                    result.layer, result.version
                ),
            }
            .into());
        }
        models.append(result.clone())?;
        *self.stage.write() = staged;
        Ok(result)
    }
}

fn guarded<T>(
    layer: LayerKind,
    call: impl FnOnce() -> Result<T, LayerError>,
) -> Result<T, LayerError> {
    panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(LayerError::StageFault {
            layer,
            detail: format!("stage panicked: {}", panic_message(payload.as_ref())),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

/// Exactly one stage per layer, in traversal order.
pub struct StageRegistry {
    slots: Vec<StageSlot>,
}

impl StageRegistry {
    /// Validates that `stages` covers every layer exactly once.
    pub fn new(stages: Vec<Box<dyn Layer>>) -> Result<Self, PipelineError> {
        let mut by_kind: IndexMap<LayerKind, Box<dyn Layer>> = IndexMap::new();
        for stage in stages {
            let kind = stage.kind();
            if by_kind.insert(kind, stage).is_some() {
                return Err(PipelineError::DuplicateLayer(kind));
            }
        }
        let mut slots = Vec::with_capacity(LayerKind::ORDER.len());
        for kind in LayerKind::ORDER {
            let stage = by_kind
                .shift_remove(&kind)
                .ok_or(PipelineError::MissingLayer(kind))?;
            slots.push(StageSlot {
                kind,
                stage: RwLock::new(stage),
                fit_gate: Mutex::new(()),
            });
        }
        Ok(Self { slots })
    }

    /// Slot for `kind`.
    #[must_use]
    pub fn slot(&self, kind: LayerKind) -> &StageSlot {
        &self.slots[kind.index()]
    }

    /// Slots in traversal order.
    pub fn iter(&self) -> impl Iterator<Item = &StageSlot> {
        self.slots.iter()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().map(|slot| slot.kind))
            .finish()
    }
}

/// Durable recorder writing model records as JSON lines.
#[derive(Debug)]
struct ModelRecorder {
    path: PathBuf,
    writer: Mutex<File>,
}

impl ModelRecorder {
    fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating model registry dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening model registry {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    fn persist(&self, record: &ModelMetadata) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.sync_data()?;
        Ok(())
    }
}

/// Append-only history of fitted models keyed by `(layer, version)`.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    records: RwLock<IndexMap<LayerKind, Vec<ModelMetadata>>>,
    recorder: Option<ModelRecorder>,
}

impl ModelRegistry {
    /// Registry kept in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads the history stored at `path` and appends new records to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let registry = Self::default();
        for record in read_model_records(&path)? {
            registry
                .insert(record)
                .with_context(|| format!("loading model registry {}", path.display()))?;
        }
        Ok(Self {
            records: registry.records,
            recorder: Some(ModelRecorder::new(path)?),
        })
    }

    /// Version the next fit of `layer` will receive.
    #[must_use]
    pub fn next_version(&self, layer: LayerKind) -> u32 {
        self.records
            .read()
            .get(&layer)
            .and_then(|history| history.last())
            .map_or(1, |latest| latest.version.saturating_add(1))
    }

    /// Appends a record, persisting it when the registry is file-backed.
    ///
    /// Records are never overwritten: a version at or below the latest one for
    /// the layer is rejected.
    pub fn append(&self, record: ModelMetadata) -> Result<(), PipelineError> {
        if let Some(recorder) = &self.recorder {
            self.ensure_newer(&record)?;
            recorder
                .persist(&record)
                .map_err(|err| PipelineError::Registry(format!("{err:#}")))?;
        }
        self.insert(record)
    }

    fn ensure_newer(&self, record: &ModelMetadata) -> Result<(), PipelineError> {
        let latest = self
            .records
            .read()
            .get(&record.layer)
            .and_then(|history| history.last().map(|r| r.version));
        match latest {
            Some(latest) if record.version <= latest => Err(PipelineError::Registry(format!(
                "{} v{} already superseded by v{latest}",
                record.layer, record.version
            ))),
            _ if record.version == 0 => {
                Err(PipelineError::Registry("versions start at 1".into()))
            }
            _ => Ok(()),
        }
    }

    fn insert(&self, record: ModelMetadata) -> Result<(), PipelineError> {
        self.ensure_newer(&record)?;
        self.records
            .write()
            .entry(record.layer)
            .or_default()
            .push(record);
        Ok(())
    }

    /// Most recent record for `layer`.
    #[must_use]
    pub fn latest(&self, layer: LayerKind) -> Option<ModelMetadata> {
        self.records
            .read()
            .get(&layer)
            .and_then(|history| history.last().cloned())
    }

    /// Every record for `layer`, oldest first.
    #[must_use]
    pub fn history(&self, layer: LayerKind) -> Vec<ModelMetadata> {
        self.records.read().get(&layer).cloned().unwrap_or_default()
    }

    /// Every record in layer order.
    #[must_use]
    pub fn all(&self) -> Vec<ModelMetadata> {
        let records = self.records.read();
        LayerKind::ORDER
            .iter()
            .filter_map(|layer| records.get(layer))
            .flatten()
            .cloned()
            .collect()
    }

    /// Backing file, when persisted.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.recorder.as_ref().map(|recorder| recorder.path.as_path())
    }

    /// Flushes the backing file to disk.
    pub fn flush(&self) -> Result<()> {
        match &self.recorder {
            Some(recorder) => recorder.flush(),
            None => Ok(()),
        }
    }
}

/// Reads every model record stored at `path`; a missing file is an empty history.
pub fn read_model_records(path: impl AsRef<Path>) -> Result<Vec<ModelMetadata>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file =
        File::open(path).with_context(|| format!("opening model registry {}", path.display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<ModelMetadata>(&line)
            .with_context(|| format!("invalid model record in {}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}
