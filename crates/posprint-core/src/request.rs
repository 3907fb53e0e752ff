// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Inbound label requests: default filling and validation.
//
// Everything that reaches the job store has passed through here, so the
// worker pool and encoders can trust a stored job's bounds.

use serde::{Deserialize, Serialize};

use crate::config::LabelLimits;
use crate::error::{PosPrintError, Result};
use crate::types::{DeviceAddress, LabelGap, LabelSpec, NewJob};

/// Gap as sent by clients; zero length means auto-detect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapRequest {
    pub length: i64,
    pub offset: i64,
}

/// A label print request as received from a client, before defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrintJobRequest {
    pub vid: String,
    pub pid: String,
    pub size_x: i64,
    pub size_y: i64,
    pub direction: i64,
    pub top_text: String,
    pub barcode_data: String,
    pub print_count: i64,
    pub label_gap: GapRequest,
}

impl PrintJobRequest {
    /// Fill in missing fields: default printer ids and label size, copy count
    /// clamped into `[1, max_print_count]`, header text cut to the maximum length.
    pub fn apply_defaults(&mut self, limits: &LabelLimits) {
        if self.vid.trim().is_empty() {
            self.vid = limits.default_vendor_id.clone();
        }
        if self.pid.trim().is_empty() {
            self.pid = limits.default_product_id.clone();
        }
        if self.size_x == 0 {
            self.size_x = i64::from(limits.default_size_x_mm);
        }
        if self.size_y == 0 {
            self.size_y = i64::from(limits.default_size_y_mm);
        }
        self.print_count = self.print_count.clamp(1, i64::from(limits.max_print_count.max(1)));
        if self.top_text.chars().count() > limits.max_header_text_len {
            self.top_text = self.top_text.chars().take(limits.max_header_text_len).collect();
        }
    }

    /// Check every field against `limits` and produce a job ready for the store.
    pub fn validate(&self, limits: &LabelLimits) -> Result<NewJob> {
        if self.barcode_data.trim().is_empty() {
            return Err(invalid("barcodeData is required"));
        }
        if self.barcode_data.chars().count() > limits.max_barcode_data_len {
            return Err(invalid(format!(
                "barcodeData must not exceed {} chars",
                limits.max_barcode_data_len
            )));
        }

        let size_range = i64::from(limits.min_size_mm)..=i64::from(limits.max_size_mm);
        if !size_range.contains(&self.size_x) {
            return Err(invalid(format!(
                "sizeX must be between {} and {} mm",
                limits.min_size_mm, limits.max_size_mm
            )));
        }
        if !size_range.contains(&self.size_y) {
            return Err(invalid(format!(
                "sizeY must be between {} and {} mm",
                limits.min_size_mm, limits.max_size_mm
            )));
        }

        let direction_range = i64::from(limits.min_direction)..=i64::from(limits.max_direction);
        if !direction_range.contains(&self.direction) {
            return Err(invalid(format!(
                "direction must be {} or {}",
                limits.min_direction, limits.max_direction
            )));
        }

        if !(1..=i64::from(limits.max_print_count)).contains(&self.print_count) {
            return Err(invalid(format!(
                "printCount must be between 1 and {}",
                limits.max_print_count
            )));
        }

        if self.top_text.chars().count() > limits.max_header_text_len {
            return Err(invalid(format!(
                "topText must not exceed {} characters",
                limits.max_header_text_len
            )));
        }

        if !(i64::from(limits.min_gap_mm)..=i64::from(limits.max_gap_mm))
            .contains(&self.label_gap.length)
        {
            return Err(invalid(format!(
                "labelGap.length must be between {} and {} mm (0 means auto-detect)",
                limits.min_gap_mm, limits.max_gap_mm
            )));
        }
        if !(i64::from(limits.min_gap_offset_mm)..=i64::from(limits.max_gap_offset_mm))
            .contains(&self.label_gap.offset)
        {
            return Err(invalid(format!(
                "labelGap.offset must be between {} and {} mm",
                limits.min_gap_offset_mm, limits.max_gap_offset_mm
            )));
        }

        let address = DeviceAddress::parse(&self.vid, &self.pid)?;

        // The range checks above guarantee these conversions succeed.
        Ok(NewJob {
            address,
            label: LabelSpec {
                size_x_mm: to_u32(self.size_x)?,
                size_y_mm: to_u32(self.size_y)?,
                direction: u8::try_from(self.direction)
                    .map_err(|_| invalid("direction out of range"))?,
                header_text: self.top_text.clone(),
                barcode_data: self.barcode_data.clone(),
                copies: to_u32(self.print_count)?,
                gap: LabelGap::new(to_u32(self.label_gap.length)?, to_u32(self.label_gap.offset)?),
            },
        })
    }

    /// `apply_defaults` followed by `validate`.
    pub fn into_job(mut self, limits: &LabelLimits) -> Result<NewJob> {
        self.apply_defaults(limits);
        self.validate(limits)
    }
}

fn invalid(msg: impl Into<String>) -> PosPrintError {
    PosPrintError::InvalidRequest(msg.into())
}

fn to_u32(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| invalid(format!("value {value} out of range")))
}
