use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use buildd_lite::config::{FileConfig, ManagerConfig};
use buildd_lite::dashboard::{run_dashboard, DashboardState};
use buildd_lite::manager::Manager;
use buildd_lite::pipeline::DirectoryPipeline;
use buildd_lite::shutdown::install_shutdown_handler;
use buildd_lite::store::{FarmStore, MemoryStore};
use buildd_lite::worker::HttpConnector;

#[derive(Parser, Debug)]
#[command(name = "buildd-lite")]
#[command(version)]
#[command(about = "A build-farm dispatcher with per-worker scan loops")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the dispatcher until SIGTERM or SIGINT
    Serve(ServeArgs),

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to a TOML configuration file
        path: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON file with the initial workers and jobs
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Directory that receives collected build output
    #[arg(long, default_value = "uploads")]
    upload_root: PathBuf,

    /// Port for the operator dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Override the scan interval, in seconds
    #[arg(long)]
    scan_interval: Option<u64>,

    /// Override the cancel timeout, in seconds
    #[arg(long)]
    cancel_timeout: Option<u64>,
}

fn effective_config(args: &ServeArgs) -> Result<ManagerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    };
    if let Some(secs) = args.scan_interval {
        config = config.with_scan_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = args.cancel_timeout {
        config = config.with_cancel_timeout(Duration::from_secs(secs));
    }
    config.validate()?;
    Ok(config)
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = effective_config(&args)?;
    let store = Arc::new(match &args.seed {
        Some(path) => MemoryStore::load_seed(path).await?,
        None => MemoryStore::new(),
    });
    tokio::fs::create_dir_all(&args.upload_root).await?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    tracing::info!(
        scan_interval_s = config.scan_interval.as_secs(),
        cancel_timeout_s = config.cancel_timeout.as_secs(),
        fleet_discovery_interval_s = config.fleet_discovery_interval.as_secs(),
        reset_threshold = config.thresholds.reset_threshold,
        fail_threshold = config.thresholds.fail_threshold(),
        upload_root = %args.upload_root.display(),
        dashboard_addr = ?dashboard_addr,
        "Starting buildd-lite"
    );

    let shutdown = install_shutdown_handler()?;
    let farm: Arc<dyn FarmStore> = store.clone();
    let manager = Arc::new(Manager::new(
        farm,
        Arc::new(HttpConnector::new(config.rpc_timeout)),
        Arc::new(DirectoryPipeline::new(&args.upload_root)),
        config,
    ));
    manager.start().await?;

    if let Some(addr) = dashboard_addr {
        let state = DashboardState {
            store: store.clone(),
            manager: manager.clone(),
        };
        tokio::spawn(async move {
            run_dashboard(addr, state).await;
        });
    }

    shutdown.cancelled().await;
    manager.stop().await;

    if let Err(violation) = store.check_invariants().await {
        tracing::error!(%violation, "Store invariant violated at shutdown");
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = ManagerConfig::load(path)?;
    let effective = FileConfig::from(&config);
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
        Commands::CheckConfig { path } => check_config(&path)?,
    }

    Ok(())
}
