// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine configuration.
//
// Settings are read from an optional JSON file and then overridden by
// `POS_PRINTER_*` environment variables, so a deployment can ship one file
// and tweak individual limits per host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PosPrintError, Result};
use crate::types::LabelGap;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "POS_PRINTER_";

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub worker: WorkerConfig,
    pub device: DeviceConfig,
    pub limits: LabelLimits,
}

/// Persisted job store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file. Parent directories are created on open.
    pub sqlite_path: PathBuf,
    /// Jobs `in_progress` for longer than this are handed back to the queue.
    pub stale_threshold_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("./data/db/pos-printer.sqlite.db"),
            stale_threshold_secs: 10 * 60,
        }
    }
}

impl StoreConfig {
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

/// Worker pool and reclaimer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Claims allowed per job before it is marked failed.
    pub max_job_attempts: u32,
    /// Idle sleep when no job is claimable.
    pub poll_interval_ms: u64,
    /// Period of the stale-job reclaimer.
    pub stale_check_interval_secs: u64,
    pub store_backoff_base_ms: u64,
    pub store_backoff_max_ms: u64,
    /// Consecutive failed executions after which a worker resets the device context.
    /// Zero disables the reset.
    pub reset_after_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            max_job_attempts: 3,
            poll_interval_ms: 1000,
            stale_check_interval_secs: 5 * 60,
            store_backoff_base_ms: 1000,
            store_backoff_max_ms: 30_000,
            reset_after_failures: 3,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs)
    }

    pub fn store_backoff_base(&self) -> Duration {
        Duration::from_millis(self.store_backoff_base_ms)
    }

    pub fn store_backoff_max(&self) -> Duration {
        Duration::from_millis(self.store_backoff_max_ms)
    }
}

/// Device session timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Wait after `AUTODETECT` so the printer can finish measuring the gap.
    pub autodetect_settle_ms: u64,
    /// Gap used when the `AUTODETECT` command could not be sent.
    pub fallback_gap_mm: u32,
    pub fallback_gap_offset_mm: u32,
    /// Timeout of a single bulk write.
    pub write_timeout_ms: u64,
    /// Pause between HID reports; some printers drop unpaced data.
    pub hid_packet_delay_ms: u64,
    /// Leading report-ID byte of every HID report.
    pub hid_report_id: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            autodetect_settle_ms: 1500,
            fallback_gap_mm: 2,
            fallback_gap_offset_mm: 0,
            write_timeout_ms: 5000,
            hid_packet_delay_ms: 10,
            hid_report_id: 0x00,
        }
    }
}

impl DeviceConfig {
    pub fn autodetect_settle(&self) -> Duration {
        Duration::from_millis(self.autodetect_settle_ms)
    }

    pub fn fallback_gap(&self) -> LabelGap {
        LabelGap::new(self.fallback_gap_mm, self.fallback_gap_offset_mm)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn hid_packet_delay(&self) -> Duration {
        Duration::from_millis(self.hid_packet_delay_ms)
    }
}

/// Bounds and defaults applied to inbound label requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelLimits {
    pub max_print_count: u32,
    pub max_header_text_len: usize,
    pub max_barcode_data_len: usize,
    pub min_size_mm: u32,
    pub max_size_mm: u32,
    pub min_direction: u8,
    pub max_direction: u8,
    pub min_gap_mm: u32,
    pub max_gap_mm: u32,
    pub min_gap_offset_mm: u32,
    pub max_gap_offset_mm: u32,
    pub default_vendor_id: String,
    pub default_product_id: String,
    pub default_size_x_mm: u32,
    pub default_size_y_mm: u32,
}

impl Default for LabelLimits {
    fn default() -> Self {
        Self {
            max_print_count: 1000,
            max_header_text_len: 50,
            max_barcode_data_len: 100,
            min_size_mm: 10,
            max_size_mm: 120,
            min_direction: 0,
            max_direction: 1,
            min_gap_mm: 0,
            max_gap_mm: 10,
            min_gap_offset_mm: 0,
            max_gap_offset_mm: 5,
            default_vendor_id: "0x0fe6".into(),
            default_product_id: "0x8800".into(),
            default_size_x_mm: 45,
            default_size_y_mm: 35,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path` (if given and present), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            Some(path) => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok());
        Ok(config)
    }

    /// Parse a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            PosPrintError::Config(format!("read {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str(&data)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Apply overrides looked up by un-prefixed key (e.g. `MAX_JOB_ATTEMPTS`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("DB_SQLITE_PATH").filter(|v| !v.is_empty()) {
            self.store.sqlite_path = PathBuf::from(path);
        }
        let stale_minutes: Option<u64> = parse_env(&lookup, "DB_STALE_THRESHOLD");
        if let Some(minutes) = stale_minutes {
            self.store.stale_threshold_secs = minutes.saturating_mul(60);
        }
        if let Some(v) = parse_env(&lookup, "MAX_JOB_ATTEMPTS") {
            self.worker.max_job_attempts = v;
        }
        if let Some(v) = parse_env(&lookup, "MAX_WORKER_COUNT") {
            self.worker.worker_count = v;
        }
        if let Some(v) = parse_env(&lookup, "MAX_PRINT_COUNT") {
            self.limits.max_print_count = v;
        }
        if let Some(v) = parse_env(&lookup, "MAX_TOP_TEXT_LENGTH") {
            self.limits.max_header_text_len = v;
        }
        if let Some(v) = parse_env(&lookup, "MAX_BARCODE_DATA_LENGTH") {
            self.limits.max_barcode_data_len = v;
        }
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = %format!("{ENV_PREFIX}{key}"), value = %raw, "ignoring unparseable override");
            None
        }
    }
}
