// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ESC/POS raster encoder.
//
// Emits a monochrome bitmap as a `GS v 0` raster image framed by printer
// initialisation, left alignment, a paper feed and a full cut.

use image::{GrayImage, Luma};
use posprint_core::error::{PosPrintError, Result};
use tracing::debug;

/// `ESC @`: reset the printer.
pub const INIT: [u8; 2] = [0x1B, 0x40];
/// `ESC a 0`: left alignment.
pub const ALIGN_LEFT: [u8; 3] = [0x1B, 0x61, 0x00];
/// `GS v 0` with mode 0 (normal density); followed by xL xH yL yH.
pub const RASTER_HEADER: [u8; 4] = [0x1D, 0x76, 0x30, 0x00];
/// `GS V 0`: full cut.
pub const CUT_FULL: [u8; 3] = [0x1D, 0x56, 0x00];

/// A bitmap packed 8 pixels per byte, most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub width_bytes: u16,
    pub height: u16,
    /// `width_bytes * height` bytes, rows top to bottom.
    pub data: Vec<u8>,
}

/// Pack `bitmap` into raster rows. A pixel darker than `threshold` sets its
/// bit.
///
/// The byte width is `width / 8` rounded down: trailing columns that do not
/// fill a whole byte are dropped, so callers wanting every column must pass
/// a bitmap whose width is a multiple of 8.
pub fn pack_raster(bitmap: &GrayImage, threshold: u8) -> Result<RasterImage> {
    let width_bytes = bitmap.width() / 8;
    let width_bytes = u16::try_from(width_bytes)
        .map_err(|_| PosPrintError::Encoding(format!("bitmap width {} too large", bitmap.width())))?;
    let height = u16::try_from(bitmap.height()).map_err(|_| {
        PosPrintError::Encoding(format!("bitmap height {} too large", bitmap.height()))
    })?;

    let mut data = Vec::with_capacity(usize::from(width_bytes) * usize::from(height));
    for y in 0..u32::from(height) {
        for byte_x in 0..u32::from(width_bytes) {
            let mut byte = 0u8;
            for bit in 0..8 {
                let Luma([l]) = *bitmap.get_pixel(byte_x * 8 + bit, y);
                if l < threshold {
                    byte |= 0x80 >> bit;
                }
            }
            data.push(byte);
        }
    }

    if bitmap.width() % 8 != 0 {
        debug!(
            width = bitmap.width(),
            dropped = bitmap.width() % 8,
            "raster width not a multiple of 8, trailing columns dropped"
        );
    }
    Ok(RasterImage {
        width_bytes,
        height,
        data,
    })
}

/// Encode `bitmap` as a complete ESC/POS print stream.
pub fn encode_raster(bitmap: &GrayImage, threshold: u8, feed_lines: u8) -> Result<Vec<u8>> {
    let raster = pack_raster(bitmap, threshold)?;

    let mut out = Vec::with_capacity(raster.data.len() + 24);
    out.extend_from_slice(&INIT);
    out.extend_from_slice(&ALIGN_LEFT);
    out.extend_from_slice(&RASTER_HEADER);
    out.extend_from_slice(&raster.width_bytes.to_le_bytes());
    out.extend_from_slice(&raster.height.to_le_bytes());
    out.extend_from_slice(&raster.data);
    out.extend_from_slice(&[0x1B, 0x64, feed_lines]);
    out.extend_from_slice(&CUT_FULL);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parse the raster header back out of an encoded stream.
    fn decode_header(stream: &[u8]) -> (u16, u16, usize) {
        let start = INIT.len() + ALIGN_LEFT.len();
        assert_eq!(&stream[start..start + 4], &RASTER_HEADER);
        let x = u16::from_le_bytes([stream[start + 4], stream[start + 5]]);
        let y = u16::from_le_bytes([stream[start + 6], stream[start + 7]]);
        (x, y, start + 8)
    }

    #[test]
    fn black_row_packs_to_ff() {
        let black = GrayImage::from_pixel(8, 1, Luma([0]));
        let packed = pack_raster(&black, 128).expect("pack");
        assert_eq!(packed.data, vec![0xFF]);

        let white = GrayImage::from_pixel(8, 1, Luma([255]));
        let packed = pack_raster(&white, 128).expect("pack");
        assert_eq!(packed.data, vec![0x00]);
    }

    #[test]
    fn bits_are_msb_first() {
        let mut img = GrayImage::from_pixel(8, 1, Luma([255]));
        img.put_pixel(0, 0, Luma([0]));
        img.put_pixel(7, 0, Luma([0]));
        let packed = pack_raster(&img, 128).expect("pack");
        assert_eq!(packed.data, vec![0b1000_0001]);
    }

    #[test]
    fn trailing_columns_are_truncated() {
        let black = GrayImage::from_pixel(12, 2, Luma([0]));
        let packed = pack_raster(&black, 128).expect("pack");
        assert_eq!(packed.width_bytes, 1);
        assert_eq!(packed.data, vec![0xFF, 0xFF]);
    }

    #[test]
    fn header_reproduces_dimensions() {
        let img = GrayImage::from_pixel(576, 300, Luma([200]));
        let stream = encode_raster(&img, 128, 5).expect("encode");

        let (x, y, data_start) = decode_header(&stream);
        assert_eq!(u32::from(x) * 8, img.width());
        assert_eq!(u32::from(y), img.height());

        let data_len = usize::from(x) * usize::from(y);
        assert_eq!(&stream[..2], &INIT);
        assert_eq!(
            &stream[data_start + data_len..],
            &[0x1B, 0x64, 5, 0x1D, 0x56, 0x00]
        );
    }

    #[test]
    fn oversized_height_is_an_encoding_error() {
        let tall = GrayImage::new(8, 70_000);
        let err = pack_raster(&tall, 128).expect_err("too tall");
        assert!(matches!(err, PosPrintError::Encoding(_)));
    }
}
