// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// posprint-document: Page rendering and bitmap preparation for raster
// (receipt) printing.
//
// Provides the image processor (width-fit resize, grayscale, threshold) and a
// page-at-a-time pipeline that feeds the ESC/POS raster encoder.

pub mod image;
pub mod pages;

pub use self::image::ImageProcessor;
pub use pages::{ImagePages, PageSource, RasterPipeline};
