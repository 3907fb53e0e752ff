// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for posprint.

use thiserror::Error;

use crate::types::{DeviceAddress, JobId};

/// Top-level error type for all posprint operations.
#[derive(Debug, Error)]
pub enum PosPrintError {
    // -- Request / address errors --
    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("invalid print request: {0}")]
    InvalidRequest(String),

    // -- Device errors --
    #[error("printer {address} not found")]
    DeviceNotFound { address: DeviceAddress },

    #[error("could not open printer: {0}")]
    OpenFailed(String),

    #[error("transport write failed: {0}")]
    TransportWrite(String),

    #[error("transport unavailable: {0}")]
    Unsupported(String),

    // -- Encoding errors --
    #[error("cannot encode print data: {0}")]
    Encoding(String),

    #[error("image processing failed: {0}")]
    Image(String),

    // -- Storage / persistence --
    #[error("job store error: {0}")]
    Store(String),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PosPrintError>;
