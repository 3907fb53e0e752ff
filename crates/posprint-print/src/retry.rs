// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry policy for job execution and store access.
//
// Classifies errors into Transient, UserAction and Permanent. Execution
// failures requeue the job while attempts remain, except Permanent ones,
// which fail it at once. Store failures in the worker loop are retried after
// an exponential backoff, staggered per worker.

use std::time::Duration;

use posprint_core::error::PosPrintError;
use posprint_core::types::{ErrorClass, JobStatus};
use tracing::{debug, info, warn};

/// Backoff configuration for store access retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure; doubled for each further one.
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back in the queue.
    Requeue,
    /// Retrying cannot help.
    GiveUp(ErrorClass),
    /// Attempt budget used up.
    Exhausted,
}

impl RetryDecision {
    /// Status to persist for this decision.
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Requeue => JobStatus::Pending,
            Self::GiveUp(_) | Self::Exhausted => JobStatus::Failed,
        }
    }
}

/// Classify a `PosPrintError` into an `ErrorClass` for retry decisions.
pub fn classify_error(err: &PosPrintError) -> ErrorClass {
    match err {
        // Transient: busy device, replug, I/O hiccup
        PosPrintError::OpenFailed(_) => ErrorClass::Transient,
        PosPrintError::TransportWrite(_) => ErrorClass::Transient,
        PosPrintError::Store(_) => ErrorClass::Transient,

        // Someone has to plug the printer in
        PosPrintError::DeviceNotFound { .. } => ErrorClass::UserAction,

        // Permanent: the job itself is bad or the transport is missing
        PosPrintError::Encoding(_) => ErrorClass::Permanent,
        PosPrintError::InvalidAddress(_) => ErrorClass::Permanent,
        PosPrintError::InvalidRequest(_) => ErrorClass::Permanent,
        PosPrintError::Unsupported(_) => ErrorClass::Permanent,
        PosPrintError::Image(_) => ErrorClass::Permanent,
        PosPrintError::JobNotFound(_) => ErrorClass::Permanent,
        PosPrintError::Config(_) => ErrorClass::Permanent,
        PosPrintError::Serialization(_) => ErrorClass::Permanent,

        // IO errors depend on the kind
        PosPrintError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ErrorClass::UserAction
            }
            _ => ErrorClass::Transient,
        },
    }
}

/// Decide what happens to a job whose execution failed on its
/// `attempts`-th claim.
pub fn decide(err: &PosPrintError, attempts: u32, max_attempts: u32) -> RetryDecision {
    match classify_error(err) {
        ErrorClass::Permanent => {
            info!("permanent error, not retrying");
            RetryDecision::GiveUp(ErrorClass::Permanent)
        }
        class if attempts >= max_attempts => {
            warn!(attempts, max = max_attempts, ?class, "attempt budget exhausted");
            RetryDecision::Exhausted
        }
        class => {
            debug!(attempts, max = max_attempts, ?class, "requeueing job");
            RetryDecision::Requeue
        }
    }
}

/// Status to write for a failed execution.
pub fn next_status(err: &PosPrintError, attempts: u32, max_attempts: u32) -> JobStatus {
    decide(err, attempts, max_attempts).status()
}

/// Delay before a worker retries a store call that has failed `failures`
/// times in a row.
///
/// The base delay doubles per failure. Every worker shares one SQLite file,
/// so each is shifted by a fixed fraction of the base delay according to its
/// index; a locked database then sees the workers come back one by one
/// instead of all at once. The result never exceeds `max_delay`.
pub fn backoff_delay(failures: u32, worker: usize, config: &BackoffConfig) -> Duration {
    let doubled = config
        .base_delay
        .checked_mul(1 << failures.min(10))
        .unwrap_or(config.max_delay);
    doubled
        .saturating_add(worker_offset(worker, config.base_delay))
        .min(config.max_delay)
}

/// Workers are spread over `WORKER_SLOTS` evenly spaced offsets in `[0, base)`.
const WORKER_SLOTS: u32 = 4;

fn worker_offset(worker: usize, base: Duration) -> Duration {
    let slot = (worker % WORKER_SLOTS as usize) as u32;
    base / WORKER_SLOTS * slot
}

#[cfg(test)]
mod tests {
    use super::*;
    use posprint_core::types::DeviceAddress;

    #[test]
    fn busy_device_is_transient() {
        let err = PosPrintError::OpenFailed("resource busy".into());
        assert_eq!(classify_error(&err), ErrorClass::Transient);
    }

    #[test]
    fn missing_printer_needs_user_action() {
        let err = PosPrintError::DeviceNotFound {
            address: DeviceAddress::new(1, 2),
        };
        assert_eq!(classify_error(&err), ErrorClass::UserAction);
    }

    #[test]
    fn encoding_error_fails_immediately() {
        let err = PosPrintError::Encoding("line break in header".into());
        assert_eq!(next_status(&err, 1, 3), JobStatus::Failed);
        assert_eq!(
            decide(&err, 1, 3),
            RetryDecision::GiveUp(ErrorClass::Permanent)
        );
    }

    #[test]
    fn retry_respects_attempt_budget() {
        let err = PosPrintError::TransportWrite("pipe".into());
        assert_eq!(next_status(&err, 1, 3), JobStatus::Pending);
        assert_eq!(next_status(&err, 2, 3), JobStatus::Pending);
        assert_eq!(decide(&err, 3, 3), RetryDecision::Exhausted);
        assert_eq!(next_status(&err, 3, 3), JobStatus::Failed);
    }

    #[test]
    fn delay_doubles_per_failure() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(backoff_delay(0, 0, &config), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, 0, &config), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, 0, &config), Duration::from_millis(800));
    }

    #[test]
    fn workers_are_staggered_within_one_base_period() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        };
        let delays: Vec<_> = (0..4).map(|w| backoff_delay(2, w, &config)).collect();
        assert_eq!(
            delays,
            [400, 425, 450, 475].map(Duration::from_millis).to_vec()
        );
        // Slots wrap after four workers.
        assert_eq!(backoff_delay(2, 4, &config), delays[0]);
    }

    #[test]
    fn delay_capped_at_max() {
        let config = BackoffConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(backoff_delay(20, 3, &config), Duration::from_secs(10));
        assert_eq!(backoff_delay(u32::MAX, 0, &config), Duration::from_secs(10));
    }
}
