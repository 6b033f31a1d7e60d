use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use proton::feature::FeatureConfig;
use proton::host::{FeatureToggle, InactiveElementRegistry, StaticExperiments};
use proton::logger::{LogConfig, LogLevel, LogSink, init_tracing};
use proton::message::SYNC_FEATURES;
use proton::schema::write_schema;
use proton::settings::{EnvSettingsManager, ProtonSettings, SettingsManager};
use proton::sync::{DirectoryManifestFetcher, ManifestFetcher};
use proton::{
    ChannelServerLink, Engine, Orchestrator, PropertyValue, ServerMessage, TypeCatalogue, TypeRegistry,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "proton", about = "Config-driven feature orchestration", version)]
struct Cli {
    /// Overrides PROTON_LOG_LEVEL
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    /// Write rolling log files instead of logging to stderr
    #[arg(long, global = true)]
    file_logs: bool,

    /// Log directory, overrides PROTON_LOG_DIR
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// OTLP/HTTP endpoint, overrides PROTON_OTEL_ENDPOINT
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    /// `.env` file to load settings from
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a manifest and print its diagnostics
    Validate(ValidateArgs),

    /// Emit JSON schemas for manifests and cascade reports
    Schema(SchemaArgs),

    /// Run one component of a manifest and print the cascade report
    Run(RunArgs),

    /// Sync features against a loopback server that activates everything
    /// the client reports ready
    Sync(SyncArgs),
}

#[derive(Args, Debug)]
struct ValidateArgs {
    manifest: PathBuf,

    /// Feature name, defaults to the file stem
    #[arg(long)]
    feature: Option<String>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "schemas")]
    out: PathBuf,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    manifest: PathBuf,

    #[arg(long)]
    feature: Option<String>,

    /// Key of the component to start from
    #[arg(long)]
    component: String,

    /// JSON payload handed to the first component
    #[arg(long)]
    payload: Option<String>,
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Enabled features as `name=version`
    #[arg(long = "feature", required = true)]
    features: Vec<FeatureToggle>,

    /// Serve manifests from `{dir}/{feature}/{version}.json` instead of PROTON_BASE_URL
    #[arg(long)]
    manifest_dir: Option<PathBuf>,

    /// Component key to trigger once synced
    #[arg(long)]
    trigger: Option<String>,

    /// Seconds to wait for the server's answer
    #[arg(long, default_value = "10")]
    wait: u64,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let manager = SettingsManager(EnvSettingsManager::new(cli.env_file.clone()));
    let settings = ProtonSettings::from_manager(&manager).await?;
    let _guard = init_tracing(&log_config(&cli, &settings))?;

    match cli.command {
        Commands::Validate(args) => validate(&args),
        Commands::Schema(args) => {
            for path in write_schema(&args.out)? {
                println!("wrote {}", path.display());
            }
            Ok(())
        }
        Commands::Run(args) => run(&args, &settings),
        Commands::Sync(args) => sync(args, settings).await,
    }
}

fn log_config(cli: &Cli, settings: &ProtonSettings) -> LogConfig {
    let level = cli.log_level.unwrap_or_else(|| match settings.log_level.parse() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{}, using info", e);
            LogLevel::Info
        }
    });
    let sink = if cli.file_logs || cli.log_dir.is_some() {
        LogSink::Files {
            dir: cli.log_dir.clone().unwrap_or_else(|| settings.log_dir.clone()),
        }
    } else if let Some(endpoint) = cli.otel_endpoint.clone().or_else(|| settings.otel_endpoint.clone()) {
        LogSink::Otlp { endpoint }
    } else {
        LogSink::Stderr
    };
    LogConfig::new(level, sink)
}

fn load_manifest(path: &Path, feature: Option<&String>) -> anyhow::Result<FeatureConfig> {
    let feature = match feature {
        Some(feature) => feature.clone(),
        None => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive a feature name from {}", path.display()))?,
    };
    let text = fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))?;
    Ok(FeatureConfig::parse(&feature, &text)?)
}

fn validate(args: &ValidateArgs) -> anyhow::Result<()> {
    let config = load_manifest(&args.manifest, args.feature.as_ref())?;
    println!(
        "{}: {} components, {} data objects, {} providers",
        config.feature_name(),
        config.components().count(),
        config.data_objects().count(),
        config.providers().count()
    );
    let diagnostics = config.diagnostics();
    if diagnostics.is_empty() {
        println!("✅ Manifest is valid.");
        return Ok(());
    }
    for diagnostic in &diagnostics {
        println!("⚠️  {}", diagnostic);
    }
    bail!("{} problem(s) found", diagnostics.len())
}

fn run(args: &RunArgs, settings: &ProtonSettings) -> anyhow::Result<()> {
    let config = load_manifest(&args.manifest, args.feature.as_ref())?;
    let feature = config.feature_name().to_string();

    let registry = Arc::new(TypeRegistry::new());
    registry.build_mapping(TypeCatalogue::builtin());
    let (link, mut outbound) = ChannelServerLink::new();
    let orchestrator = Orchestrator::new(registry)
        .with_link(Arc::new(link))
        .with_max_cascade_steps(settings.max_cascade_steps);
    orchestrator.register(config);

    let payload = match &args.payload {
        Some(raw) => PropertyValue::from(serde_json::from_str::<Value>(raw).context("payload is not JSON")?),
        None => PropertyValue::Null,
    };
    let (node, report) = orchestrator.perform_step_with_report(&feature, &payload, &args.component, true);
    if node.is_none() {
        warn!(%feature, component = %args.component, "nothing was constructed");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    while let Ok(msg) = outbound.try_recv() {
        println!("-> {}", serde_json::to_string(&msg)?);
    }
    Ok(())
}

async fn sync(args: SyncArgs, settings: ProtonSettings) -> anyhow::Result<()> {
    let fetcher: Option<Arc<dyn ManifestFetcher>> = match &args.manifest_dir {
        Some(dir) => Some(Arc::new(DirectoryManifestFetcher::new(dir))),
        None => None,
    };
    let (link, mut outbound) = ChannelServerLink::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let engine = Arc::new(Engine::bootstrap(
        settings,
        TypeCatalogue::builtin(),
        Arc::new(link),
        Arc::new(StaticExperiments::new(args.features)),
        Arc::new(InactiveElementRegistry::new()),
        fetcher,
    )?);
    engine.listen(inbound_rx);

    let server = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            match (msg.name(), msg.get("proton_ready_list")) {
                (SYNC_FEATURES, Some(Value::Object(ready))) => {
                    info!(ready = ready.len(), "loopback server activating every ready feature");
                    let reply = ServerMessage::active_features(ready.keys().cloned());
                    if inbound_tx.send(reply).is_err() {
                        break;
                    }
                }
                _ => println!("-> {}", serde_json::to_string(&msg).unwrap_or_default()),
            }
        }
    });

    if engine.start_sync() {
        engine.ready_reported().await?;
    }
    tokio::time::timeout(Duration::from_secs(args.wait), engine.wait_synced())
        .await
        .context("server never answered the ready list")?;

    let active = engine.orchestrator().active_features();
    println!("active features: {}", if active.is_empty() { "none".to_string() } else { active.join(", ") });

    if let Some(trigger) = &args.trigger {
        let started = engine.perform_trigger(trigger);
        println!("trigger `{}` started {} component(s)", trigger, started);
        // let the loopback server print what the cascade sent
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    engine.shutdown();
    server.abort();
    Ok(())
}
