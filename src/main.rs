use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use log::{debug, error, info};
use tokio::sync::watch;

use crate::config::{
    DEFAULT_API_BASE, DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_WAKE_INTERVAL_SECS, DevicesConfig,
    ServiceSettings,
};
use crate::registry::ManagerRegistry;

mod config;
mod env;
mod error;
mod http;
mod manager;
mod policy;
mod registry;
mod release;
mod storage;
mod util;

#[derive(Parser, Debug)]
#[command(
    name = "firmware-hub",
    author,
    version,
    about = "Keeps cached robot firmware images in sync with upstream releases"
)]
struct Cli {
    /// Print the service version and exit.
    #[arg(long)]
    version_only: bool,

    /// Address the HTTP API listens on.
    #[arg(long, default_value = "0.0.0.0:8001")]
    bind: SocketAddr,

    /// Directory holding one cache folder per device type.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// JSON device table; defaults to the built-in one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Minimum seconds between upstream release queries.
    #[arg(long, default_value_t = DEFAULT_CHECK_INTERVAL_SECS)]
    check_interval: u64,

    /// Seconds between background checker wake-ups.
    #[arg(long, default_value_t = DEFAULT_WAKE_INTERVAL_SECS)]
    wake_interval: u64,

    /// Base URL of the release API.
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if cli.version_only {
        println!("firmware-hub {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let devices = DevicesConfig::load(cli.config.as_deref())?;
    let mut settings = ServiceSettings::new(cli.data_dir.unwrap_or_else(env::firmware_dir));
    settings.api_base = cli.api_base;
    settings.check_interval = Duration::from_secs(cli.check_interval);
    settings.wake_interval = Duration::from_secs(cli.wake_interval.max(1));
    info!("cache directory: {}", settings.data_dir.display());

    let registry = Arc::new(ManagerRegistry::build(&devices, &settings).await);
    let (stop_tx, stop_rx) = watch::channel(false);
    let checkers = registry.spawn_checkers(&stop_rx);

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    info!(
        "http: serving {} device type(s) on http://{}",
        registry.len(),
        cli.bind
    );
    axum::serve(listener, http::router(Arc::clone(&registry)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // a checker in the middle of a download finishes it before stopping
    if stop_tx.send(true).is_err() {
        debug!("stop signal not delivered, every checker has already exited");
    }
    for checker in checkers {
        if let Err(err) = checker.await {
            error!("checker task ended abnormally: {err}");
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to install Ctrl-C handler: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
