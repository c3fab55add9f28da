use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use podtube_core::{
    load_podtube_config, remove_leftover, ArtifactDir, AppState, CacheItem, CacheJanitor,
    CacheStore, ConversionQueue, ConversionWorker, FailureClassifier, PodtubeConfig,
    UnavailableKind, WorkerSettings, YtDlpConverter, YtDlpOptions,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] podtube_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(#[from] podtube_core::ServerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("config rendering failed: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("logging setup failed: {0}")]
    Logging(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Serves video platform content as podcast audio", long_about = None)]
pub struct Cli {
    /// Path to podtube.toml; built-in defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Overrides paths.audio_dir
    #[arg(long)]
    pub audio_dir: Option<PathBuf>,
    /// Default log filter; RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    pub log_level: String,
    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the HTTP server with the conversion worker
    Serve(ServeArgs),
    /// Deletes expired audio and conversion leftovers
    Prune(PruneArgs),
    /// Shows which verdict a failure message would produce
    Classify(ClassifyArgs),
    /// Prints the effective configuration
    Config,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Overrides server.listen
    #[arg(long)]
    pub listen: Option<String>,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Report without deleting
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct ClassifyArgs {
    /// Failure text as reported by the download tool
    pub message: String,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_level, cli.log_file.as_ref())?;
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Serve(_) => serve(config)?,
        Commands::Prune(args) => {
            let report = prune(&config, args.dry_run)?;
            render(&report, cli.format)?;
        }
        Commands::Classify(args) => {
            let report = classify(&config, &args.message)?;
            render(&report, cli.format)?;
        }
        Commands::Config => {
            let report = ConfigReport(config);
            render(&report, cli.format)?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|err| AppError::Logging(err.to_string()))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|err| AppError::Logging(err.to_string()))
}

/// File (or defaults), then `PODTUBE_*` variables, then command-line flags.
pub fn load_config(cli: &Cli) -> Result<PodtubeConfig> {
    let mut config = match &cli.config {
        Some(path) => load_podtube_config(path)?,
        None => PodtubeConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(dir) = &cli.audio_dir {
        config.paths.audio_dir = dir.clone();
    }
    if let Commands::Serve(ServeArgs {
        listen: Some(listen),
    }) = &cli.command
    {
        config.server.listen = listen.clone();
    }
    config.validate()?;
    Ok(config)
}

fn serve(config: PodtubeConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve_async(config))
}

async fn serve_async(config: PodtubeConfig) -> Result<()> {
    let addr = config.listen_addr()?;
    let classifier = FailureClassifier::from_config(&config.classification.rules)?;

    let queue = Arc::new(ConversionQueue::new());
    let cache = Arc::new(CacheStore::new());
    let artifacts = ArtifactDir::new(&config.paths.audio_dir);
    artifacts.rehydrate(&cache, config.cache.audio_ttl())?;

    let converter = Arc::new(YtDlpConverter::new(YtDlpOptions::from_config(&config)));
    let worker = ConversionWorker::new(
        Arc::clone(&queue),
        Arc::clone(&cache),
        artifacts.clone(),
        converter,
        WorkerSettings::from_config(&config),
    )
    .with_classifier(classifier);
    let janitor = CacheJanitor::new(Arc::clone(&cache), config.cache.sweep_interval());
    let state = AppState::new(queue, cache, artifacts, &config);

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { worker.run(shutdown).await })
    };
    let janitor_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { janitor.run(shutdown).await })
    };

    let token = state.shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                token.cancel();
            }
            Err(err) => tracing::warn!(error = %err, "failed to install Ctrl+C handler"),
        }
    });

    let served = podtube_core::serve(addr, state, &config.server.audio_route_prefix).await;
    let _ = shutdown_tx.send(());
    let _ = worker_task.await;
    let _ = janitor_task.await;
    served?;
    Ok(())
}

fn prune(config: &PodtubeConfig, dry_run: bool) -> Result<PruneReport> {
    let artifacts = ArtifactDir::new(&config.paths.audio_dir);
    let scan = artifacts.scan(config.cache.audio_ttl())?;
    let now = Utc::now();
    let mut report = PruneReport {
        dry_run,
        ..PruneReport::default()
    };
    for (key, item) in scan.artifacts {
        if item.expire() > now {
            report.kept += 1;
            continue;
        }
        if !dry_run {
            item.release();
        }
        report.expired.push(PrunedArtifact {
            key,
            path: item.path().to_path_buf(),
            expired_at: item.expire(),
        });
    }
    for leftover in scan.leftovers {
        if !dry_run {
            remove_leftover(&leftover)?;
        }
        report.leftovers.push(leftover);
    }
    tracing::info!(
        expired = report.expired.len(),
        leftovers = report.leftovers.len(),
        kept = report.kept,
        dry_run,
        "pruned audio directory"
    );
    Ok(report)
}

fn classify(config: &PodtubeConfig, message: &str) -> Result<ClassifyReport> {
    let classifier = FailureClassifier::from_config(&config.classification.rules)?;
    let rule = classifier.classify(message);
    Ok(ClassifyReport {
        input: message.to_string(),
        kind: rule.map(|rule| rule.kind),
        status: rule.map(|rule| rule.kind.http_status()),
        message: rule.map(|rule| rule.message.clone()),
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display()?);
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct PrunedArtifact {
    key: String,
    path: PathBuf,
    expired_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize)]
struct PruneReport {
    dry_run: bool,
    expired: Vec<PrunedArtifact>,
    leftovers: Vec<PathBuf>,
    kept: usize,
}

impl DisplayFallback for PruneReport {
    fn display(&self) -> Result<String> {
        let verb = if self.dry_run { "would remove" } else { "removed" };
        let mut lines = Vec::new();
        for artifact in &self.expired {
            lines.push(format!(
                "{verb} {} (expired {})",
                artifact.path.display(),
                artifact.expired_at.to_rfc3339()
            ));
        }
        for leftover in &self.leftovers {
            lines.push(format!("{verb} leftover {}", leftover.display()));
        }
        lines.push(format!(
            "{} expired, {} leftovers, {} kept",
            self.expired.len(),
            self.leftovers.len(),
            self.kept
        ));
        Ok(lines.join("\n"))
    }
}

#[derive(Debug, Serialize)]
struct ClassifyReport {
    input: String,
    kind: Option<UnavailableKind>,
    status: Option<u16>,
    message: Option<String>,
}

impl DisplayFallback for ClassifyReport {
    fn display(&self) -> Result<String> {
        Ok(match (&self.kind, &self.status, &self.message) {
            (Some(kind), Some(status), Some(message)) => {
                format!("{kind} -> HTTP {status} ({message})")
            }
            _ => "unclassified: the next request retries the conversion".to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct ConfigReport(PodtubeConfig);

impl DisplayFallback for ConfigReport {
    fn display(&self) -> Result<String> {
        Ok(toml::to_string_pretty(&self.0)?)
    }
}
