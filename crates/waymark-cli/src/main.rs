//! Waymark Command-Line Client
//!
//! Migrates, inspects and recovers a Waymark data directory.

mod commands;
mod config;
mod error;

use clap::Parser;
use config::Args;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waymark=info,waymark_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Args::parse().into_config();
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        command = ?config.command,
        "configuration loaded"
    );

    if let Err(e) = commands::execute(config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
