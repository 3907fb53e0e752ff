// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// TSPL label encoder.
//
// Builds the CRLF-terminated command text for a single barcode label on a
// 203 dpi (8 dots/mm) label printer. Pure: no I/O, no shared state.

use posprint_core::error::{PosPrintError, Result};
use posprint_core::types::{LabelGap, LabelSpec};

/// Asks the printer to measure the label gap itself.
pub const AUTODETECT: &str = "AUTODETECT\r\n";

/// Dots per millimetre at 203 dpi.
pub const DOTS_PER_MM: u32 = 8;

const TEXT_HEIGHT: u32 = 12;
const BARCODE_HEIGHT: u32 = 70;
const SPACING: u32 = 10;

/// Encode `label` as TSPL commands.
///
/// `effective_gap` is the gap after negotiation: a zero length omits the
/// `GAP` line, which is only correct once `AUTODETECT` has already run.
///
/// Text fields are inserted verbatim and double quotes are not escaped, so
/// a `"` in the header or barcode data ends the string early on the
/// printer. Line breaks are rejected because they would start a new command.
pub fn encode_label(label: &LabelSpec, effective_gap: LabelGap) -> Result<String> {
    reject_line_breaks("header text", &label.header_text)?;
    reject_line_breaks("barcode data", &label.barcode_data)?;

    let height_dots = label.size_y_mm.saturating_mul(DOTS_PER_MM);
    let text_y = height_dots.saturating_sub(TEXT_HEIGHT + BARCODE_HEIGHT + SPACING) / 2;
    let barcode_y = text_y + TEXT_HEIGHT + SPACING;

    let mut lines = Vec::with_capacity(9);
    lines.push(format!("SIZE {} mm, {} mm", label.size_x_mm, label.size_y_mm));
    if !effective_gap.is_auto() {
        lines.push(format!(
            "GAP {} mm, {} mm",
            effective_gap.length_mm, effective_gap.offset_mm
        ));
    }
    lines.push(format!("DIRECTION {}", label.direction));
    lines.push("CLS".to_owned());
    lines.push("SET PRINTER DT".to_owned());
    lines.push(format!("TEXT 15,{text_y},\"2\",0,1,1,\"{}\"", label.header_text));
    lines.push(format!(
        "BARCODE 0,{barcode_y},\"128\",{BARCODE_HEIGHT},1,0,2,2,\"{}\"",
        label.barcode_data
    ));
    lines.push(format!("PRINT {},1", label.copies));
    lines.push("CUT".to_owned());

    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    Ok(out)
}

fn reject_line_breaks(field: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        return Err(PosPrintError::Encoding(format!(
            "{field} must not contain line breaks"
        )));
    }
    Ok(())
}
