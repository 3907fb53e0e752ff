// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Worker pool and stale-job reclaimer.
//
// Each worker is a tokio task looping claim -> execute -> write status. The
// blocking parts (SQLite, USB) run on the blocking thread pool. A separate
// reclaimer task periodically returns abandoned `in_progress` jobs to the
// queue. All tasks share one cancellation token; cancellation is observed
// between iterations only, so a job that has started executing always gets
// its status written before the worker exits.

use std::sync::Arc;
use std::time::Duration;

use posprint_core::config::WorkerConfig;
use posprint_core::error::{PosPrintError, Result};
use posprint_core::types::{JobId, JobStatus, PrintJob};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::DeviceManager;
use crate::retry::{BackoffConfig, backoff_delay, next_status};
use crate::store::JobStore;

/// Something that can carry out a claimed job.
pub trait JobExecutor: Send + Sync + 'static {
    /// Run the job to completion. Called on a blocking thread.
    fn execute(&self, job: &PrintJob) -> Result<()>;

    /// Called after repeated consecutive failures.
    fn recover(&self) {}
}

impl JobExecutor for DeviceManager {
    fn execute(&self, job: &PrintJob) -> Result<()> {
        self.print_label(job.address, &job.label)
    }

    fn recover(&self) {
        self.reset();
    }
}

/// State shared by every task of a pool.
#[derive(Clone)]
struct Shared {
    store: Arc<JobStore>,
    executor: Arc<dyn JobExecutor>,
    config: WorkerConfig,
    backoff: BackoffConfig,
}

/// Drains the job store with a fixed number of workers.
pub struct WorkerPool {
    shared: Shared,
    stale_threshold: Duration,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<JobStore>,
        executor: Arc<dyn JobExecutor>,
        config: WorkerConfig,
        stale_threshold: Duration,
    ) -> Self {
        let backoff = BackoffConfig {
            base_delay: config.store_backoff_base(),
            max_delay: config.store_backoff_max(),
        };
        Self {
            shared: Shared {
                store,
                executor,
                config,
                backoff,
            },
            stale_threshold,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn `count` workers and the reclaimer. Must be called from within a
    /// tokio runtime. Does nothing if the pool is already running.
    pub fn start(&mut self, count: usize) {
        if self.is_running() {
            warn!("worker pool already running");
            return;
        }

        for worker in 0..count {
            let shared = self.shared.clone();
            let cancel = self.cancel.clone();
            self.tasks
                .push(tokio::spawn(run_worker(worker, shared, cancel)));
        }
        self.tasks.push(tokio::spawn(run_reclaimer(
            Arc::clone(&self.shared.store),
            self.stale_threshold,
            self.shared.config.stale_check_interval(),
            self.cancel.clone(),
        )));
        info!(workers = count, "worker pool started");
    }

    /// Signal every task to stop and wait until all of them have exited.
    pub async fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        // Fresh token so the pool can be started again.
        self.cancel = CancellationToken::new();
        info!("worker pool stopped");
    }
}

/// Sleep for `duration` unless cancelled first. Returns `true` on cancel.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PosPrintError::Store(format!("{what} task failed: {e}")))?
}

async fn run_worker(worker: usize, shared: Shared, cancel: CancellationToken) {
    info!(worker, "worker started");
    let mut store_failures = 0u32;
    let mut exec_failures = 0u32;

    while !cancel.is_cancelled() {
        let store = Arc::clone(&shared.store);
        let job = match blocking("claim", move || store.claim_next()).await {
            Ok(Some(job)) => {
                store_failures = 0;
                job
            }
            Ok(None) => {
                store_failures = 0;
                if sleep_or_cancel(shared.config.poll_interval(), &cancel).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                let delay = backoff_delay(store_failures, worker, &shared.backoff);
                store_failures = store_failures.saturating_add(1);
                warn!(worker, error = %e, delay_ms = delay.as_millis() as u64, "claim failed, backing off");
                if sleep_or_cancel(delay, &cancel).await {
                    break;
                }
                continue;
            }
        };

        if process(worker, job, &shared, &cancel).await {
            exec_failures = 0;
        } else {
            exec_failures += 1;
            let limit = shared.config.reset_after_failures;
            if limit > 0 && exec_failures >= limit {
                warn!(worker, failures = exec_failures, "repeated failures, resetting device");
                let executor = Arc::clone(&shared.executor);
                if let Err(e) = tokio::task::spawn_blocking(move || executor.recover()).await {
                    error!(worker, error = %e, "device recovery panicked");
                }
                exec_failures = 0;
            }
        }
    }
    info!(worker, "worker stopped");
}

/// Execute one claimed job and persist its outcome. Returns whether the
/// execution succeeded.
async fn process(worker: usize, job: PrintJob, shared: &Shared, cancel: &CancellationToken) -> bool {
    let job_id = job.id;
    let attempt = job.attempts;
    debug!(worker, job_id = %job_id, attempt, "executing job");

    let executor = Arc::clone(&shared.executor);
    let outcome = tokio::task::spawn_blocking(move || executor.execute(&job))
        .await
        .unwrap_or_else(|e| Err(PosPrintError::TransportWrite(format!("print task panicked: {e}"))));

    let (status, last_error) = match &outcome {
        Ok(()) => {
            info!(worker, job_id = %job_id, attempt, "job done");
            (JobStatus::Done, None)
        }
        Err(e) => {
            let status = next_status(e, attempt, shared.store.max_attempts());
            if status.is_terminal() {
                warn!(worker, job_id = %job_id, attempt, error = %e, "job failed, giving up");
            } else {
                warn!(worker, job_id = %job_id, attempt, error = %e, "job failed, requeued");
            }
            (status, Some(e.to_string()))
        }
    };

    write_status(worker, job_id, status, last_error, shared, cancel).await;
    outcome.is_ok()
}

/// Persist a job outcome, retrying store failures with backoff. Once
/// shutdown has been requested the write is tried one last time; a job left
/// `in_progress` is picked up again by the reclaimer.
async fn write_status(
    worker: usize,
    job_id: JobId,
    status: JobStatus,
    last_error: Option<String>,
    shared: &Shared,
    cancel: &CancellationToken,
) {
    let mut failures = 0u32;
    loop {
        let store = Arc::clone(&shared.store);
        let message = last_error.clone();
        let written = blocking("update", move || {
            store.update_status(job_id, status, message.as_deref())
        })
        .await;

        match written {
            Ok(()) => return,
            Err(PosPrintError::JobNotFound(_)) => {
                error!(worker, job_id = %job_id, "job vanished before its status was written");
                return;
            }
            Err(e) if cancel.is_cancelled() => {
                error!(worker, job_id = %job_id, error = %e, "status write failed during shutdown, job will be reclaimed");
                return;
            }
            Err(e) => {
                let delay = backoff_delay(failures, worker, &shared.backoff);
                failures = failures.saturating_add(1);
                warn!(worker, job_id = %job_id, error = %e, delay_ms = delay.as_millis() as u64, "status write failed, retrying");
                // A cancel during the wait still gets one more attempt above.
                sleep_or_cancel(delay, cancel).await;
            }
        }
    }
}

async fn run_reclaimer(
    store: Arc<JobStore>,
    threshold: Duration,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(threshold_secs = threshold.as_secs(), "stale-job reclaimer started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let store = Arc::clone(&store);
        match blocking("reclaim", move || store.reclaim_stale(threshold)).await {
            Ok(0) => {}
            Ok(count) => info!(count, "reclaimed stale jobs"),
            Err(e) => warn!(error = %e, "stale-job reclaim failed"),
        }
    }
    debug!("stale-job reclaimer stopped");
}
