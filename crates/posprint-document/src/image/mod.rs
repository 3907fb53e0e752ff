// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Image module: width-fit resize, grayscale, and threshold.

pub mod processor;

pub use processor::ImageProcessor;
