use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ripple_pipeline::{
    read_model_records, FeatureSource, JsonFeatureSource, LayerKind, Orchestrator,
    PipelineConfig, PipelineResult, PipelineTelemetry, PolicyEvent, RunOptions, StatusReport,
    SyntheticFeatureSource, TrainingResult, TrainingSet,
};
use shared_event_bus::FileEventPublisher;
use tokio::runtime::Runtime;

const DEFAULT_REGISTRY: &str = "ripple-models.jsonl";

#[derive(Parser, Debug)]
#[command(name = "ripple", version, about = "Tariff-impact layer pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs one policy event through every layer and prints the result.
    Run(RunArgs),
    /// Prints readiness and model version per layer.
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory of `<layer>.jsonl` training files fitted before reporting.
        #[arg(long)]
        train_dir: Option<PathBuf>,
    },
    /// Fits one layer from a JSON-lines training file.
    Fit {
        /// Layer name, e.g. `firm_impact`.
        #[arg(long)]
        layer: String,
        #[arg(long)]
        data: PathBuf,
        /// Registry file receiving the new model record.
        #[arg(long)]
        registry: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Lists persisted model records.
    Registry {
        #[arg(long, default_value = DEFAULT_REGISTRY)]
        path: PathBuf,
        /// Only records of this layer.
        #[arg(long)]
        layer: Option<String>,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Policy event JSON file.
    #[arg(long)]
    event: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// JSON file of feature bundles; synthetic features are used without it.
    #[arg(long)]
    features: Option<PathBuf>,
    /// Seed for synthetic features.
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Directory of `<layer>.jsonl` training files fitted before the run.
    #[arg(long)]
    train_dir: Option<PathBuf>,
    /// Overrides the configured fetch timeout.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// JSON-lines file receiving pipeline events.
    #[arg(long)]
    event_log: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = Runtime::new()?;
    match cli.command {
        Commands::Run(args) => {
            let result = runtime.block_on(handle_run(&args))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Status { config, train_dir } => {
            let report = runtime.block_on(handle_status(config.as_deref(), train_dir.as_deref()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Fit {
            layer,
            data,
            registry,
            config,
        } => {
            let trained = runtime.block_on(handle_fit(&layer, &data, registry, config.as_deref()))?;
            println!("{}", serde_json::to_string_pretty(&trained)?);
            Ok(())
        }
        Commands::Registry { path, layer } => {
            let layer = layer.as_deref().map(str::parse::<LayerKind>).transpose()?;
            let records: Vec<TrainingResult> = read_model_records(&path)?
                .into_iter()
                .filter(|record| layer.map_or(true, |kind| record.layer == kind))
                .collect();
            if records.is_empty() {
                println!("no model records in {}", path.display());
            }
            for record in records {
                println!(
                    "{} | v{} | {} samples | {} | mse {:.4}",
                    record.layer,
                    record.version,
                    record.samples,
                    record.fitted_at,
                    record.metrics.get("mse").copied().unwrap_or(f64::NAN)
                );
            }
            Ok(())
        }
    }
}

async fn handle_run(args: &RunArgs) -> Result<PipelineResult> {
    let event = read_event(&args.event)?;
    let config = load_config(args.config.as_deref())?;
    let source: Arc<dyn FeatureSource> = match &args.features {
        Some(path) => {
            anyhow::ensure!(path.exists(), "feature file {} not found", path.display());
            Arc::new(JsonFeatureSource::new(path))
        }
        None => Arc::new(SyntheticFeatureSource::new(args.seed)),
    };
    let telemetry = telemetry(&config, args.event_log.as_deref())?;
    let orchestrator = Orchestrator::builder()
        .with_reference_stages()
        .shared_feature_source(source)
        .config(config)
        .telemetry(telemetry)
        .build()?;
    if let Some(dir) = &args.train_dir {
        orchestrator.fit_from_dir(dir).await?;
    }
    let mut options = RunOptions::default();
    if let Some(ms) = args.timeout_ms {
        options = options.fetch_timeout(Duration::from_millis(ms));
    }
    let result = orchestrator.run_with(&event, options).await;
    orchestrator.shutdown().await?;
    Ok(result)
}

async fn handle_status(config: Option<&Path>, train_dir: Option<&Path>) -> Result<StatusReport> {
    let config = load_config(config)?;
    let orchestrator = Orchestrator::builder()
        .with_reference_stages()
        .telemetry(telemetry(&config, None)?)
        .config(config)
        .build()?;
    if let Some(dir) = train_dir {
        orchestrator.fit_from_dir(dir).await?;
    }
    Ok(orchestrator.status())
}

async fn handle_fit(
    layer: &str,
    data: &Path,
    registry: Option<PathBuf>,
    config: Option<&Path>,
) -> Result<TrainingResult> {
    let kind: LayerKind = layer.parse()?;
    let data = TrainingSet::from_jsonl(data)?;
    let mut config = load_config(config)?;
    config.registry_path = registry
        .or(config.registry_path)
        .or_else(|| Some(PathBuf::from(DEFAULT_REGISTRY)));
    let orchestrator = Orchestrator::builder()
        .with_reference_stages()
        .telemetry(telemetry(&config, None)?)
        .config(config)
        .build()?;
    let trained = orchestrator.fit_layer(kind, &data).await?;
    orchestrator.shutdown().await?;
    Ok(trained)
}

fn read_event(path: &Path) -> Result<PolicyEvent> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading policy event {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing policy event {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn telemetry(config: &PipelineConfig, event_log: Option<&Path>) -> Result<PipelineTelemetry> {
    let mut builder = PipelineTelemetry::builder("ripple").min_level(config.logging.min_level);
    if let Some(path) = &config.logging.path {
        builder = builder.log_path(path);
    }
    if let Some(path) = event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use ripple_pipeline::PipelineStatus;
    use std::io::Write;
    use tempfile::tempdir;

    fn shipped(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../pipeline/data")
            .join(name)
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "ripple",
            "run",
            "--event",
            "event.json",
            "--seed",
            "9",
            "--timeout-ms",
            "250",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.seed, 9);
        assert_eq!(args.timeout_ms, Some(250));
        assert!(args.features.is_none());
    }

    #[test]
    fn run_with_shipped_event_completes() {
        let dir = tempdir().unwrap();
        let event_log = dir.path().join("events.jsonl");
        let args = RunArgs {
            event: shipped("steel_event.json"),
            config: Some(shipped("pipeline.toml")),
            features: None,
            seed: 42,
            train_dir: None,
            timeout_ms: None,
            event_log: Some(event_log.clone()),
        };
        let result = Runtime::new().unwrap().block_on(handle_run(&args)).unwrap();
        assert_eq!(result.status, PipelineStatus::Complete);
        let events = fs::read_to_string(event_log).unwrap();
        assert!(events.contains("pipeline.run.completed"));
        assert!(events.contains("pipeline.shutdown"));
    }

    #[test]
    fn run_with_feature_file_completes() {
        let args = RunArgs {
            event: shipped("steel_event.json"),
            config: None,
            features: Some(shipped("features.json")),
            seed: 42,
            train_dir: None,
            timeout_ms: Some(500),
            event_log: None,
        };
        let result = Runtime::new().unwrap().block_on(handle_run(&args)).unwrap();
        assert_eq!(result.status, PipelineStatus::Complete);
        assert!(result.ledger.is_clean());
    }

    #[test]
    fn fit_appends_to_registry() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("trade_flow.jsonl");
        let mut file = fs::File::create(&data).unwrap();
        for i in 0..10 {
            let rate = f64::from(i) / 20.0;
            writeln!(
                file,
                r#"{{"features":{{"tariff_rate":{rate},"policy_severity":0.5,"import_elasticity":1.0}},"target":{},"observed_at":"2024-03-0{}T00:00:00Z"}}"#,
                -0.9 * rate,
                i % 9 + 1
            )
            .unwrap();
        }
        drop(file);
        let registry = dir.path().join("models.jsonl");
        let runtime = Runtime::new().unwrap();
        let first = runtime
            .block_on(handle_fit("trade_flow", &data, Some(registry.clone()), None))
            .unwrap();
        let second = runtime
            .block_on(handle_fit("trade-flow", &data, Some(registry.clone()), None))
            .unwrap();
        assert_eq!((first.version, second.version), (1, 2));
        let records = read_model_records(&registry).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn unknown_layer_is_rejected() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("empty.jsonl");
        fs::write(&data, "").unwrap();
        let err = Runtime::new()
            .unwrap()
            .block_on(handle_fit("weather", &data, Some(dir.path().join("m.jsonl")), None))
            .unwrap_err();
        assert!(err.to_string().contains("weather"));
    }
}
