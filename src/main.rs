//! Database Backup Retention Tool
//!
//! Produces point-in-time dumps for the configured databases, stores a new
//! backup only when its content actually changed, and prunes stored backups
//! along a tiered retention policy.

// backuptool/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use config::BackupConfig;

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Backup run completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    // The config file path may be passed as the only argument. Defaults to
    // config.json in the working directory, as the tool is deployed next to
    // its configuration.
    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 1 {
        PathBuf::from(args[1].trim())
    } else {
        PathBuf::from("config.json")
    };

    let config = BackupConfig::load(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    backup::run_backup_flow(&config)
        .await
        .context("Backup process failed")?;
    Ok(())
}
