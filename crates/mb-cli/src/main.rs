//! misp-bridge CLI
//!
//! Wires the synchronization connector against the platform collaborators
//! and drives it: a long-running scheduler (`run`), one-shot
//! synchronization (`sync`), instance health (`status`) and configuration
//! checking (`check-config`).
//!
//! The binary ships with in-memory store implementations; a deployment
//! embeds the pipelines against the platform's real stores instead.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mb_core::{
    AuthContext, EventBus, InMemoryAlertStore, InMemoryArtifactStore, InMemoryAttachmentStore,
    InMemoryCaseStore, TempStore,
};
use mb_misp::{
    AlertBackfillWorker, AlwaysReady, IngestionPipeline, InstanceRegistry, SyncReport,
    SyncScheduler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod config;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "misp-bridge")]
#[command(version)]
#[command(about = "Bidirectional MISP synchronization for the IR platform", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "misp-bridge.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic synchronization scheduler until interrupted
    Run,
    /// Run a single synchronization pass and exit
    Sync {
        /// Ignore watermarks and re-evaluate every event
        #[arg(long)]
        full: bool,
    },
    /// Probe every configured instance
    Status,
    /// Validate the configuration file and print it with secrets redacted
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    let logging = if config.logging.json {
        mb_observability::LoggingConfig::production()
    } else {
        mb_observability::LoggingConfig::default()
    };
    mb_observability::init_logging_with_config(logging);

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Sync { full } => sync_once(config, full).await,
        Commands::Status => status(config).await,
        Commands::CheckConfig => check_config(config),
    }
}

struct Wiring {
    temp: Arc<TempStore>,
    registry: Arc<InstanceRegistry>,
    alerts: Arc<InMemoryAlertStore>,
    ingestion: Arc<IngestionPipeline>,
}

fn wire(config: &AppConfig) -> Result<Wiring> {
    let temp = Arc::new(TempStore::new().context("temp store setup failed")?);
    let registry = Arc::new(
        InstanceRegistry::from_configs(config.instance_configs(), Arc::clone(&temp))
            .context("instance registry setup failed")?,
    );

    let alerts = Arc::new(InMemoryAlertStore::new());
    let cases = Arc::new(InMemoryCaseStore::new());
    let attachments = Arc::new(InMemoryAttachmentStore::new());
    let artifacts = Arc::new(InMemoryArtifactStore::new(attachments));

    let ingestion = Arc::new(IngestionPipeline::new(
        Arc::clone(&registry),
        alerts.clone(),
        cases,
        artifacts,
        Arc::clone(&temp),
    ));

    Ok(Wiring {
        temp,
        registry,
        alerts,
        ingestion,
    })
}

async fn run(config: AppConfig) -> Result<()> {
    let wiring = wire(&config)?;
    info!(
        instances = wiring.registry.len(),
        interval_secs = config.interval().as_secs(),
        "starting misp-bridge"
    );

    let bus = Arc::new(EventBus::default());
    let backfill = Arc::new(AlertBackfillWorker::new(
        Arc::clone(&wiring.registry),
        wiring.alerts.clone(),
    ));
    let backfill_task = backfill.spawn(&bus);

    let scheduler = Arc::new(SyncScheduler::new(
        Arc::clone(&wiring.ingestion),
        Arc::clone(&wiring.temp),
        Arc::new(AlwaysReady),
        config.interval(),
    ));
    let handle = scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    handle.stop().await;
    backfill_task.abort();
    Ok(())
}

async fn sync_once(config: AppConfig, full: bool) -> Result<()> {
    let wiring = wire(&config)?;
    let ctx = AuthContext::service();
    let report = if full {
        wiring.ingestion.full_synchronize(&ctx).await
    } else {
        wiring.ingestion.synchronize(&ctx).await
    };
    wiring.temp.release_all();
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    for instance in &report.instances {
        match &instance.instance_error {
            Some(err) => println!("{}: batch dropped ({err})", instance.instance),
            None => println!(
                "{}: {} created, {} updated, {} unchanged, {} failed",
                instance.instance,
                instance.created,
                instance.updated,
                instance.unchanged,
                instance.failed
            ),
        }
    }
}

async fn status(config: AppConfig) -> Result<()> {
    let wiring = wire(&config)?;
    for instance in wiring.registry.iter() {
        match instance.api.server_version().await {
            Ok(response) if response.is_success() => {
                let version = response.body["version"].as_str().unwrap_or("unknown");
                println!("{}: ok (MISP {version})", instance.config.name);
            }
            Ok(response) => {
                println!("{}: unhealthy (status {})", instance.config.name, response.status);
            }
            Err(err) => println!("{}: unreachable ({err})", instance.config.name),
        }
    }
    Ok(())
}

fn check_config(config: AppConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(&config.redacted())?;
    println!("{yaml}");
    println!(
        "{} instance(s) configured, interval {}s",
        config.misp.instances.len(),
        config.interval().as_secs()
    );
    Ok(())
}
