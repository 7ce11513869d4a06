mod summary;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use beaconhost_core::{now_unix_ms, read_events, DEFAULT_LOG_PATH, DEFAULT_ROUTE};
use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::header::{HeaderName, CONTENT_LENGTH, CONTENT_TYPE};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::summary::{format_record, format_ts, summarize};

const BEACON_USER_AGENT: &str = "Locker-Beacon/1.0 (SIMULATION)";

#[derive(Debug, Parser)]
#[command(name = "beaconctl", version, about = "Operator client for the beacon host")]
struct Cli {
    #[arg(long, global = true, env = "BEACONHOST_URL", default_value = "http://127.0.0.1:8000")]
    server_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Probe /health.
    Health,
    /// Send simulated device beacons.
    Beacon {
        #[arg(long, default_value_t = 5)]
        bursts: u32,
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
        #[arg(long, default_value = "/beacon")]
        path: String,
        #[arg(long, default_value = "encrypted")]
        status: String,
        #[arg(long, default_value = "beaconctl")]
        model: String,
    },
    /// HEAD the download route and report what it would serve.
    Probe {
        #[arg(long, default_value = DEFAULT_ROUTE)]
        route: String,
    },
    /// Inspect a local event log.
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
}

#[derive(Debug, Subcommand)]
enum LogCommand {
    Summary {
        #[arg(default_value = DEFAULT_LOG_PATH)]
        file: PathBuf,
    },
    Tail {
        #[arg(default_value = DEFAULT_LOG_PATH)]
        file: PathBuf,
        #[arg(long, default_value_t = 20)]
        lines: usize,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BeaconPayload<'a> {
    model: &'a str,
    sdk_int: u32,
    status: &'a str,
    nonce: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let base = cli.server_url.trim_end_matches('/');

    match cli.command {
        Commands::Health => {
            let response = Client::new()
                .get(format!("{base}/health"))
                .send()?
                .error_for_status()?;
            println!("{}", response.text()?);
        }
        Commands::Beacon {
            bursts,
            interval_secs,
            path,
            status,
            model,
        } => {
            let client = Client::builder()
                .timeout(Duration::from_secs(5))
                .user_agent(BEACON_USER_AGENT)
                .build()?;
            let url = format!("{base}/{}", path.trim_start_matches('/'));
            let mut delivered = 0;

            for n in 0..bursts {
                let payload = BeaconPayload {
                    model: &model,
                    sdk_int: 34,
                    status: &status,
                    nonce: now_unix_ms(),
                };
                match client.post(&url).json(&payload).send() {
                    Ok(response) => {
                        println!("beacon {n} -> {}", response.status());
                        delivered += u32::from(response.status().is_success());
                    }
                    Err(err) => warn!(beacon = n, error = %err, "beacon failed"),
                }
                if n + 1 < bursts {
                    thread::sleep(Duration::from_secs(interval_secs));
                }
            }
            println!("beacons: sent={bursts}, delivered={delivered}");
        }
        Commands::Probe { route } => {
            let response = Client::new()
                .head(format!("{base}/{}", route.trim_start_matches('/')))
                .send()?;
            let header = |name: HeaderName| {
                response
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-")
                    .to_string()
            };
            println!(
                "{} length={} type={}",
                response.status(),
                header(CONTENT_LENGTH),
                header(CONTENT_TYPE)
            );
        }
        Commands::Log { command } => match command {
            LogCommand::Summary { file } => {
                let records = read_events(&file)
                    .with_context(|| format!("cannot summarize {}", file.display()))?;
                let summary = summarize(&records);
                println!("records: {}", summary.total);
                for (kind, count) in &summary.by_kind {
                    println!("  {kind}: {count}");
                }
                println!("remotes: {}", summary.remotes.len());
                println!("bytes served: {}", summary.bytes_served);
                if let (Some(first), Some(last)) = (summary.first_ts, summary.last_ts) {
                    println!("span: {} .. {}", format_ts(first), format_ts(last));
                }
            }
            LogCommand::Tail { file, lines } => {
                let records = read_events(&file)
                    .with_context(|| format!("cannot read {}", file.display()))?;
                let start = records.len().saturating_sub(lines);
                for record in &records[start..] {
                    println!("{}", format_record(record));
                }
            }
        },
    }

    Ok(())
}
