use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};

/// Builder for pipeline telemetry sinks.
pub struct PipelineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl PipelineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops file records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<PipelineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        Ok(PipelineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the orchestrator and its runs.
///
/// Every record is mirrored to `tracing`; the JSON log file and the event bus
/// are optional.
#[derive(Clone)]
pub struct PipelineTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for PipelineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTelemetry")
            .field("module", &self.inner.module)
            .field("file", &self.inner.logger.as_ref().map(JsonLogger::path))
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

impl Default for PipelineTelemetry {
    fn default() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "pipeline".into(),
                logger: None,
                publisher: None,
            }),
        }
    }
}

impl PipelineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> PipelineTelemetryBuilder {
        PipelineTelemetryBuilder::new(module)
    }

    /// Record pre-filled with this handle's module name.
    #[must_use]
    pub fn record(&self, level: LogLevel, message: &str) -> LogRecord {
        LogRecord::new(&self.inner.module, level, message)
    }

    /// Writes a record to `tracing` and, when configured, to the log file.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let run_id = record.run_id.as_deref().unwrap_or("-");
        let layer = record.layer.as_deref().unwrap_or("-");
        let fields = Value::Object(record.metadata.clone());
        match record.level {
            LogLevel::Debug => tracing::debug!(run_id, layer, %fields, "{}", record.message),
            LogLevel::Info => tracing::info!(run_id, layer, %fields, "{}", record.message),
            LogLevel::Warn => tracing::warn!(run_id, layer, %fields, "{}", record.message),
            LogLevel::Error => tracing::error!(run_id, layer, %fields, "{}", record.message),
        }
        if let Some(logger) = &self.inner.logger {
            logger.log(record)?;
        }
        Ok(())
    }

    /// Publishes an event when a publisher is configured.
    pub async fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            publisher
                .publish(EventRecord::new(&self.inner.module, event_type, payload))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("pipeline.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = PipelineTelemetry::builder("pipeline")
            .log_path(&path)
            .min_level(LogLevel::Info)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(
                &telemetry
                    .record(LogLevel::Warn, "pipeline.layer.degraded")
                    .with_run("run-1")
                    .with_layer("firm_impact")
                    .with_field("reason", "timeout"),
            )
            .unwrap();
        telemetry
            .log(&telemetry.record(LogLevel::Debug, "pipeline.layer.validating"))
            .unwrap();
        telemetry
            .event("pipeline.run.completed", json!({ "status": "partial" }))
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("pipeline.layer.degraded"));
        assert!(!content.contains("pipeline.layer.validating"));
        assert_eq!(bus.events_under("pipeline.run").len(), 1);
    }

    #[tokio::test]
    async fn default_handle_is_silent() {
        let telemetry = PipelineTelemetry::default();
        telemetry
            .log(&telemetry.record(LogLevel::Info, "pipeline.run.started"))
            .unwrap();
        telemetry.event("pipeline.run.started", Value::Null).await.unwrap();
    }
}
