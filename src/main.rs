use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use opswatch::{MonitorConfig, MonitorScheduler, MonitoringService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "opswatch")]
#[command(about = "In-process observability and alerting engine")]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables override its values
    #[arg(long, global = true, env = "OPSWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring cadences until Ctrl+C or SIGTERM
    Run,
    /// Load and validate the configuration, then print it
    CheckConfig,
    /// Print one health snapshot
    Snapshot {
        #[arg(long, value_enum, default_value_t = SnapshotFormat::Json)]
        format: SnapshotFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SnapshotFormat {
    Json,
    Prometheus,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load_config(path: Option<PathBuf>) -> Result<MonitorConfig> {
    let config = match path {
        Some(path) => {
            // from_env reads the base file from OPSWATCH_CONFIG.
            std::env::set_var("OPSWATCH_CONFIG", &path);
            MonitorConfig::from_env()
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => MonitorConfig::from_env().context("Failed to load configuration")?,
    };
    config.validate()?;
    Ok(config)
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install terminate signal handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

async fn run(config: MonitorConfig) -> Result<()> {
    let service = Arc::new(
        MonitoringService::builder(config.clone())
            .build()
            .context("Failed to build monitoring service")?,
    );

    let scheduler = MonitorScheduler::start(Arc::clone(&service), &config.schedule);
    info!("opswatch running; press Ctrl+C to stop");

    wait_for_shutdown().await;
    scheduler.shutdown().await;

    let stats = service.alert_stats();
    info!(
        alerts = stats.total,
        critical = stats.critical,
        "opswatch stopped"
    );
    Ok(())
}

fn snapshot(config: MonitorConfig, format: SnapshotFormat) -> Result<()> {
    let service = MonitoringService::builder(config).build()?;
    match format {
        SnapshotFormat::Json => {
            let metrics = service.detailed_metrics()?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        SnapshotFormat::Prometheus => print!("{}", service.prometheus_text()?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = load_config(cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            info!("Configuration is valid");
            Ok(())
        }
        Commands::Snapshot { format } => snapshot(config, format),
    }
}
