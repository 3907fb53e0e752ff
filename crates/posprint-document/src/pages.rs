// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Page sources and the raster preparation pipeline.
//
// A receipt document is a sequence of pages. Each page is rendered to an
// image, fitted to the printable width, converted to grayscale and
// thresholded into a black/white bitmap. Pages are processed strictly one at
// a time: the bitmap of page N is handed to the sink and dropped before
// page N+1 is rendered.

use std::path::PathBuf;

use image::{DynamicImage, GrayImage};
use posprint_core::error::{PosPrintError, Result};
use tracing::{info, warn};

use crate::image::ImageProcessor;

/// Anything that can render a document page by page.
///
/// Only image files are supported today. Receipt jobs record a PDF path and
/// a zoom factor, but no PDF rasterizer is wired in, so those fields are
/// stored and never read. A PDF source would implement this trait and apply
/// the zoom when rendering.
pub trait PageSource {
    fn page_count(&self) -> usize;

    /// Render page `index` (zero-based) to an image.
    fn render_page(&self, index: usize) -> Result<DynamicImage>;
}

/// One page per image file, decoded only when the page is rendered.
#[derive(Debug, Clone)]
pub struct ImagePages {
    paths: Vec<PathBuf>,
}

impl ImagePages {
    pub fn new(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl PageSource for ImagePages {
    fn page_count(&self) -> usize {
        self.paths.len()
    }

    fn render_page(&self, index: usize) -> Result<DynamicImage> {
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| PosPrintError::Image(format!("page {index} out of range")))?;
        ImageProcessor::open(path).map(ImageProcessor::into_dynamic)
    }
}

/// Turns rendered pages into monochrome bitmaps for the raster encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterPipeline {
    /// Printable width in dots (576 for 80 mm, 384 for 58 mm paper).
    pub target_width: u32,
    /// Luminance cutoff; darker pixels become black.
    pub threshold: u8,
}

impl Default for RasterPipeline {
    fn default() -> Self {
        Self {
            target_width: 576,
            threshold: 128,
        }
    }
}

impl RasterPipeline {
    pub fn new(target_width: u32, threshold: u8) -> Self {
        Self {
            target_width,
            threshold,
        }
    }

    /// Resize, grayscale and threshold a single rendered page.
    pub fn prepare(&self, page: DynamicImage) -> GrayImage {
        ImageProcessor::from_dynamic(page)
            .resize_to_width(self.target_width)
            .grayscale()
            .threshold(self.threshold)
            .into_luma()
    }

    /// Render and prepare every page of `source`, handing each bitmap to
    /// `sink` before the next page is rendered.
    ///
    /// Pages that fail to render are logged and skipped; an error from the
    /// sink aborts the run. Returns the number of pages delivered.
    pub fn run<S, F>(&self, source: &S, mut sink: F) -> Result<usize>
    where
        S: PageSource + ?Sized,
        F: FnMut(usize, GrayImage) -> Result<()>,
    {
        let mut delivered = 0;
        for index in 0..source.page_count() {
            let page = match source.render_page(index) {
                Ok(page) => page,
                Err(e) => {
                    warn!(page = index, error = %e, "failed to render page, skipping");
                    continue;
                }
            };
            sink(index, self.prepare(page))?;
            delivered += 1;
        }
        info!(pages = delivered, "raster pages prepared");
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    /// Pages generated on demand; page 1 fails to render.
    struct Generated;

    impl PageSource for Generated {
        fn page_count(&self) -> usize {
            3
        }

        fn render_page(&self, index: usize) -> Result<DynamicImage> {
            match index {
                1 => Err(PosPrintError::Image("corrupt page".into())),
                _ => Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                    100,
                    50,
                    Rgb([20, 20, 20]),
                ))),
            }
        }
    }

    #[test]
    fn pages_are_prepared_in_order_and_failures_skipped() {
        let pipeline = RasterPipeline::new(200, 128);
        let mut seen = Vec::new();
        let delivered = pipeline
            .run(&Generated, |index, bitmap| {
                assert_eq!(bitmap.width(), 200);
                assert_eq!(bitmap.height(), 100);
                assert!(bitmap.pixels().all(|p| *p == Luma([0])));
                seen.push(index);
                Ok(())
            })
            .expect("run");

        assert_eq!(delivered, 2);
        assert_eq!(seen, vec![0, 2]);
    }

    #[test]
    fn sink_error_stops_the_run() {
        let pipeline = RasterPipeline::default();
        let mut calls = 0;
        let result = pipeline.run(&Generated, |_, _| {
            calls += 1;
            Err(PosPrintError::TransportWrite("unplugged".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn image_files_render_lazily() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.png");
        RgbImage::from_pixel(16, 8, Rgb([255, 255, 255]))
            .save(&path)
            .expect("save png");

        let pages = ImagePages::new([path, dir.path().join("missing.png")]);
        assert_eq!(pages.page_count(), 2);
        assert!(pages.render_page(0).is_ok());
        assert!(pages.render_page(1).is_err());
        assert!(pages.render_page(7).is_err());
    }
}
