use std::path::PathBuf;

use clap::{Parser, Subcommand};

use sip_router::config::loader::load_config;
use sip_router::routing::RouteMatcher;
use sip_router::sip::decoder;

#[derive(Parser)]
#[command(name = "sip-router-cli")]
#[command(about = "Operator CLI for the SIP router", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and list its routes
    Check { config: PathBuf },
    /// Show the cluster a SIP message file would be routed to
    Route { config: PathBuf, message: PathBuf },
    /// Dump the Prometheus metrics endpoint
    Metrics {
        #[arg(short, long, default_value = "http://localhost:9090/metrics")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => {
            let config = load_config(&config)?;
            println!(
                "OK: {} route(s), {} cluster(s), {} worker(s)",
                config.route_config.routes.len(),
                config.clusters.len(),
                config.concurrency
            );
            for route in RouteMatcher::from_config(&config).routes() {
                println!(
                    "  {:<20} domain={:<40} -> {}",
                    route.name(),
                    route.domain(),
                    route.cluster_name()
                );
            }
        }
        Commands::Route { config, message } => {
            let config = load_config(&config)?;
            let raw = std::fs::read(&message)?;
            let metadata = decoder::decode(normalize_line_endings(&raw).into())?;
            match RouteMatcher::from_config(&config).route(&metadata) {
                Some(route) => println!("{} -> {}", route.name(), route.cluster_name()),
                None => println!("no route"),
            }
        }
        Commands::Metrics { url } => {
            let res = reqwest::get(&url).await?;
            let status = res.status();
            if !status.is_success() {
                eprintln!("Error: metrics endpoint returned status {}", status);
                return Ok(());
            }
            print!("{}", res.text().await?);
        }
    }

    Ok(())
}

/// Message files are usually saved with bare LF line endings.
fn normalize_line_endings(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 32);
    for (i, &byte) in raw.iter().enumerate() {
        if byte == b'\n' && (i == 0 || raw[i - 1] != b'\r') {
            out.push(b'\r');
        }
        out.push(byte);
    }
    out
}
