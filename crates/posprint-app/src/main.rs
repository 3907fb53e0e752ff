// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// posprint: POS label printer job engine
//
// Entry point. Initialises logging and configuration, then either runs the
// worker pool until interrupted or performs a one-shot queue operation.

mod services;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use posprint_core::config::EngineConfig;
use posprint_core::error::{PosPrintError, Result};
use posprint_core::request::{GapRequest, PrintJobRequest};
use posprint_core::types::JobId;

use services::app_services::PrintService;

/// posprint - barcode label printing over USB
#[derive(Parser, Debug)]
#[command(name = "posprint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (POS_PRINTER_* variables override it)
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker pool until Ctrl-C
    Serve {
        /// Number of workers (defaults to worker.worker_count)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Validate and queue a label job
    Submit {
        /// Vendor id, decimal or 0x-prefixed hex
        #[arg(long, default_value = "")]
        vid: String,
        /// Product id, decimal or 0x-prefixed hex
        #[arg(long, default_value = "")]
        pid: String,
        /// Label width in mm
        #[arg(long, default_value_t = 0)]
        size_x: i64,
        /// Label height in mm
        #[arg(long, default_value_t = 0)]
        size_y: i64,
        #[arg(long, default_value_t = 0)]
        direction: i64,
        /// Text printed above the barcode
        #[arg(long, default_value = "")]
        top_text: String,
        /// Code 128 content
        #[arg(long)]
        barcode: String,
        #[arg(long, default_value_t = 1)]
        count: i64,
        /// Gap length in mm; 0 auto-detects
        #[arg(long, default_value_t = 0)]
        gap: i64,
        #[arg(long, default_value_t = 0)]
        gap_offset: i64,
    },

    /// Show the state of a queued job
    Status {
        /// Job id returned by `submit`
        id: i64,
    },

    /// Check whether a printer is attached
    Check {
        #[arg(long)]
        vid: String,
        #[arg(long)]
        pid: String,
    },

    /// Print the effective configuration as JSON
    ShowConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        tracing::error!(error = %e, "posprint failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Serve { workers } => {
            let count = workers.unwrap_or(config.worker.worker_count);
            let svc = PrintService::init(config)?;
            serve(svc, count).await
        }
        Commands::Submit {
            vid,
            pid,
            size_x,
            size_y,
            direction,
            top_text,
            barcode,
            count,
            gap,
            gap_offset,
        } => {
            let svc = PrintService::init(config)?;
            let submission = svc.submit(PrintJobRequest {
                vid,
                pid,
                size_x,
                size_y,
                direction,
                top_text,
                barcode_data: barcode,
                print_count: count,
                label_gap: GapRequest {
                    length: gap,
                    offset: gap_offset,
                },
            })?;
            println!("{}", serde_json::to_string_pretty(&submission)?);
            Ok(())
        }
        Commands::Status { id } => {
            let svc = PrintService::init(config)?;
            let job = svc.job(JobId(id))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Commands::Check { vid, pid } => {
            let svc = PrintService::init(config)?;
            let address = svc.check_presence(&vid, &pid)?;
            println!("printer {address} is attached");
            Ok(())
        }
    }
}

async fn serve(svc: PrintService, workers: usize) -> Result<()> {
    tracing::info!(workers, "posprint starting");
    svc.start_workers(workers).await;

    let signal = tokio::signal::ctrl_c().await;

    tracing::info!("shutting down, waiting for in-flight jobs");
    svc.stop_workers().await;
    svc.cleanup();
    signal.map_err(PosPrintError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serve_fails_when_the_store_cannot_be_opened() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A plain file where the database directory should be.
        let blocker = dir.path().join("db");
        std::fs::write(&blocker, b"").expect("write blocker file");

        let mut config = EngineConfig::default();
        config.store.sqlite_path = blocker.join("jobs.sqlite");
        let config_path = dir.path().join("posprint.json");
        config.save(&config_path).expect("save config");

        let cli = Cli {
            config: Some(config_path),
            command: Commands::Serve { workers: Some(1) },
        };
        let err = run(cli).await.expect_err("serve must not start");
        assert!(matches!(err, PosPrintError::Io(_)));
    }
}
