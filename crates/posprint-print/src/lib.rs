// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// posprint-print: Printer dialect encoders (TSPL labels, ESC/POS raster),
// USB/HID device sessions, the persistent job store, and the worker pool
// that drains it. This crate turns validated jobs from `posprint-core` into
// bytes on the wire.

pub mod device;
pub mod escpos;
pub mod retry;
pub mod store;
pub mod tspl;
pub mod worker;

pub use device::{DeviceManager, DeviceSession, SessionState};
pub use store::JobStore;
pub use worker::{JobExecutor, WorkerPool};
