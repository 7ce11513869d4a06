use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use beaconhost_core::{
    EventLog, HostConfig, DEFAULT_DOWNLOAD_PATH, DEFAULT_LOG_PATH, DEFAULT_PORT, DEFAULT_ROUTE,
};
use beaconhost_server::{lifecycle, router, AppState};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "beaconhost", version, about = "Lab file host and beacon collector")]
struct Cli {
    /// Listen port.
    #[arg(short, long, env = "BEACONHOST_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Listen address.
    #[arg(long, env = "BEACONHOST_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// File served on the download route.
    #[arg(
        long = "download-file-path",
        visible_alias = "apk",
        env = "BEACONHOST_DOWNLOAD",
        default_value = DEFAULT_DOWNLOAD_PATH
    )]
    download_file_path: PathBuf,

    /// Disable the download route entirely.
    #[arg(long, default_value_t = false)]
    no_download: bool,

    /// Path prefix of the download route.
    #[arg(long, env = "BEACONHOST_ROUTE", default_value = DEFAULT_ROUTE)]
    route: String,

    /// JSONL event log.
    #[arg(
        long = "log-file-path",
        visible_alias = "log",
        env = "BEACONHOST_LOG",
        default_value = DEFAULT_LOG_PATH
    )]
    log_file_path: PathBuf,

    /// Seconds to wait for open connections after Ctrl-C or SIGTERM.
    #[arg(
        long,
        env = "BEACONHOST_SHUTDOWN_GRACE_SECS",
        default_value_t = lifecycle::DEFAULT_SHUTDOWN_GRACE.as_secs()
    )]
    shutdown_grace_secs: u64,
}

impl Cli {
    fn host_config(&self) -> Result<HostConfig> {
        let download = (!self.no_download).then_some(self.download_file_path.as_path());
        HostConfig::resolve(
            self.bind,
            self.port,
            &self.route,
            download,
            &self.log_file_path,
        )
        .context("invalid host configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = cli.host_config()?;
    let grace = Duration::from_secs(cli.shutdown_grace_secs);
    let addr = config.socket_addr();
    let events = EventLog::new(config.log_path.clone());
    lifecycle::announce(&config).await;

    let app = router(AppState::new(config, events));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    lifecycle::serve_with_grace(listener, app, lifecycle::shutdown_signal(), grace)
        .await
        .context("server failed unexpectedly")?;

    info!("shutting down");
    Ok(())
}
