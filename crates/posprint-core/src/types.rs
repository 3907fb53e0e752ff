// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the posprint job engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PosPrintError, Result};

/// Store-assigned identifier of a print job (monotonically increasing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a print job.
///
/// `Pending` is initial; `Done` and `Failed` are terminal. `InProgress` goes
/// back to `Pending` either on a retryable failure or when the stale-job
/// reclaimer decides the owning worker is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for a worker.
    Pending,
    /// Claimed by a worker and being sent to the printer.
    InProgress,
    /// Printed successfully.
    Done,
    /// Attempts exhausted or a permanent error occurred.
    Failed,
}

impl JobStatus {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// `done` and `failed` are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = PosPrintError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(PosPrintError::Store(format!("unknown job status {other:?}"))),
        }
    }
}

/// USB vendor/product identifier pair selecting one physical printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceAddress {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Parse a vendor/product pair given as decimal (`4070`) or
    /// `0x`-prefixed hexadecimal (`0x0fe6`) strings.
    pub fn parse(vendor_id: &str, product_id: &str) -> Result<Self> {
        Ok(Self {
            vendor_id: parse_usb_id("vendor id", vendor_id)?,
            product_id: parse_usb_id("product id", product_id)?,
        })
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

fn parse_usb_id(field: &str, raw: &str) -> Result<u16> {
    let trimmed = raw.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse::<u16>(),
    };
    parsed.map_err(|e| PosPrintError::InvalidAddress(format!("{field} {raw:?}: {e}")))
}

/// Label gap geometry in millimetres. A zero length asks the printer to
/// measure the gap itself (`AUTODETECT`) before printing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelGap {
    pub length_mm: u32,
    pub offset_mm: u32,
}

impl LabelGap {
    pub fn new(length_mm: u32, offset_mm: u32) -> Self {
        Self {
            length_mm,
            offset_mm,
        }
    }

    pub fn is_auto(&self) -> bool {
        self.length_mm == 0
    }
}

/// Everything the label encoder needs to lay out one barcode label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub size_x_mm: u32,
    pub size_y_mm: u32,
    /// Print direction, 0 or 1.
    pub direction: u8,
    /// Human-readable text printed above the barcode.
    pub header_text: String,
    /// Content encoded in the Code 128 symbol.
    pub barcode_data: String,
    pub copies: u32,
    pub gap: LabelGap,
}

/// A validated label job ready to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub address: DeviceAddress,
    pub label: LabelSpec,
}

/// A persisted label job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub address: DeviceAddress,
    pub label: LabelSpec,
    pub status: JobStatus,
    /// Number of times a worker has claimed this job.
    pub attempts: u32,
    /// Message of the most recent failed execution.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Classification of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Busy device, replug, I/O hiccup: safe to retry automatically.
    Transient,
    /// Someone has to plug the printer in or fix it; retried within the attempt budget.
    UserAction,
    /// Retrying cannot help (malformed data, transport not compiled in).
    Permanent,
}

/// How a receipt printer is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiptConnection {
    Network {
        ip: String,
        port: u16,
    },
    Usb {
        vendor_id: u16,
        product_id: u16,
        interface: u8,
    },
}

impl ReceiptConnection {
    /// Persisted `connection_type` column value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Usb { .. } => "usb",
        }
    }
}

/// A rasterized-document job awaiting insertion.
///
/// Receipt jobs are persisted but not yet executed by the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReceiptJob {
    pub file_path: String,
    pub print_count: u32,
    pub connection: ReceiptConnection,
    /// Printable width in dots (576 for 80 mm paper).
    pub printer_width: u32,
    /// Luminance cutoff: pixels darker than this print black.
    pub threshold: u8,
    pub feed_lines: u8,
    /// Page render scale factor.
    pub zoom: f64,
}

impl NewReceiptJob {
    pub fn new(file_path: impl Into<String>, connection: ReceiptConnection) -> Self {
        Self {
            file_path: file_path.into(),
            print_count: 1,
            connection,
            printer_width: 576,
            threshold: 100,
            feed_lines: 1,
            zoom: 2.0,
        }
    }
}

/// A persisted receipt job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptJob {
    pub id: JobId,
    pub job: NewReceiptJob,
    pub status: JobStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
