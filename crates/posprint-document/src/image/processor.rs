// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Image processor: width-fit resize, grayscale and threshold for thermal
// raster output. Operates on in-memory images using the `image` crate.

use std::io::{BufRead, Cursor, Seek};
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageReader, Luma};
use posprint_core::error::PosPrintError;
use tracing::{debug, info, instrument};

/// Image processing pipeline operating on a single in-memory image.
///
/// Each method consumes `self` and returns a new `ImageProcessor` wrapping
/// the transformed image, enabling method chaining.
///
/// ```ignore
/// let bitmap = ImageProcessor::open("receipt.png")?
///     .resize_to_width(576)
///     .grayscale()
///     .threshold(130)
///     .into_luma();
/// ```
pub struct ImageProcessor {
    /// The current working image.
    image: DynamicImage,
}

impl ImageProcessor {
    // -- Construction ---------------------------------------------------------

    /// Decode a page image from disk. The format is sniffed from the file
    /// content, not the extension.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PosPrintError> {
        let path = path.as_ref();
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        Self::decode(reader, &path.display().to_string())
    }

    /// Decode a page delivered as encoded bytes (PNG, JPEG, ...).
    #[instrument(skip(data), fields(data_len = data.len()))]
    pub fn from_bytes(data: &[u8]) -> Result<Self, PosPrintError> {
        let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
        Self::decode(reader, "in-memory page")
    }

    /// Pages without pixels are rejected; they cannot be rasterized.
    fn decode<R: BufRead + Seek>(reader: ImageReader<R>, source: &str) -> Result<Self, PosPrintError> {
        let image = reader
            .decode()
            .map_err(|err| PosPrintError::Image(format!("{source}: {err}")))?;
        if image.width() == 0 || image.height() == 0 {
            return Err(PosPrintError::Image(format!("{source}: page has no pixels")));
        }
        info!(source, width = image.width(), height = image.height(), "page decoded");
        Ok(Self { image })
    }

    /// Wrap an already-decoded `DynamicImage`.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        Self { image }
    }

    // -- Accessors ------------------------------------------------------------

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn into_dynamic(self) -> DynamicImage {
        self.image
    }

    /// Consume the processor and return the image as 8-bit luma.
    pub fn into_luma(self) -> GrayImage {
        self.image.into_luma8()
    }

    // -- Transformations ------------------------------------------------------

    /// Scale to exactly `target_width` pixels wide, preserving aspect ratio,
    /// with bilinear filtering. Heights round down but never reach zero.
    #[instrument(skip(self), fields(target_width))]
    pub fn resize_to_width(self, target_width: u32) -> Self {
        let (w, h) = (self.image.width(), self.image.height());
        if w == 0 || h == 0 || target_width == 0 || w == target_width {
            return self;
        }
        let scale = f64::from(target_width) / f64::from(w);
        let new_height = ((f64::from(h) * scale) as u32).max(1);
        debug!(from_w = w, from_h = h, new_height, "Resizing image");

        let resized = self
            .image
            .resize_exact(target_width, new_height, FilterType::Triangle);
        Self { image: resized }
    }

    /// Convert the image to grayscale (luma).
    pub fn grayscale(self) -> Self {
        Self {
            image: DynamicImage::ImageLuma8(self.image.into_luma8()),
        }
    }

    /// Binarize: luminance below `cutoff` becomes black (0), everything else
    /// white (255).
    #[instrument(skip(self), fields(cutoff))]
    pub fn threshold(self, cutoff: u8) -> Self {
        let gray = self.image.into_luma8();
        let bw = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            let Luma([l]) = *gray.get_pixel(x, y);
            if l < cutoff { Luma([0]) } else { Luma([255]) }
        });
        Self {
            image: DynamicImage::ImageLuma8(bw),
        }
    }
}
