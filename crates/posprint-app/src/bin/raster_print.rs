// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// posprint-raster: print image pages on an ESC/POS receipt printer that
// exposes a HID interface.
//
// Each page is fitted to the paper width, thresholded, encoded as a raster
// image and sent before the next page is loaded.

use std::path::PathBuf;

use clap::Parser;
use posprint_core::config::EngineConfig;
use posprint_core::error::Result;
use posprint_core::types::DeviceAddress;
use posprint_document::{ImagePages, PageSource, RasterPipeline};
use posprint_print::{DeviceManager, escpos};

/// posprint-raster - send images to a HID receipt printer
#[derive(Parser, Debug)]
#[command(name = "posprint-raster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Image files, one page each, printed in order
    #[arg(required = true)]
    pages: Vec<PathBuf>,

    /// Vendor id, decimal or 0x-prefixed hex
    #[arg(long, default_value = "0x0483")]
    vid: String,

    /// Product id, decimal or 0x-prefixed hex
    #[arg(long, default_value = "0x5743")]
    pid: String,

    /// Printable width in dots (576 for 80 mm paper, 384 for 58 mm)
    #[arg(long, default_value_t = 576)]
    width: u32,

    /// Luminance cutoff; darker pixels print black
    #[arg(long, default_value_t = 130)]
    threshold: u8,

    /// Lines fed after each page, before the cut
    #[arg(long, default_value_t = 5)]
    feed: u8,

    /// JSON configuration file for device timing
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()) {
        tracing::error!(error = %e, "raster print failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = EngineConfig::load(cli.config.as_deref())?;
    let address = DeviceAddress::parse(&cli.vid, &cli.pid)?;
    let devices = DeviceManager::system(config.device);

    let pages = ImagePages::new(cli.pages);
    let pipeline = RasterPipeline::new(cli.width, cli.threshold);
    tracing::info!(%address, pages = pages.page_count(), "printing raster pages");

    let printed = pipeline.run(&pages, |index, bitmap| {
        // The pipeline already binarized the page; any cutoff in 1..=255 keeps it intact.
        let stream = escpos::encode_raster(&bitmap, 128, cli.feed)?;
        devices.print_raster(address, &stream)?;
        tracing::info!(page = index + 1, bytes = stream.len(), "page printed");
        Ok(())
    })?;

    println!("printed {printed} of {} page(s)", pages.page_count());
    Ok(())
}
