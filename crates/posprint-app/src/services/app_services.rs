// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Central service layer: opens the job store, builds the device manager and
// owns the worker pool. Front ends (the CLI today, an HTTP layer later) call
// into this and never touch the print crate directly.
//
// The store and device manager are created once and shared by `Arc`; the
// worker pool receives the same instances.

use std::sync::Arc;

use posprint_core::config::EngineConfig;
use posprint_core::error::Result;
use posprint_core::request::PrintJobRequest;
use posprint_core::types::{DeviceAddress, JobId, JobStatus, PrintJob};
use posprint_print::{DeviceManager, JobStore, WorkerPool};
use serde::Serialize;
use tracing::{info, instrument};

/// Answer to an accepted submission, in the same camelCase form as the
/// request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Shared print services. Cheap to clone.
#[derive(Clone)]
pub struct PrintService {
    store: Arc<JobStore>,
    devices: Arc<DeviceManager>,
    workers: Arc<tokio::sync::Mutex<Option<WorkerPool>>>,
    config: Arc<EngineConfig>,
}

impl PrintService {
    /// Open the configured SQLite store and the system device transports.
    ///
    /// Fails if the store cannot be opened. Jobs are submitted by separate
    /// processes through the same file, so a private store would never see
    /// them.
    pub fn init(config: EngineConfig) -> Result<Self> {
        info!(path = %config.store.sqlite_path.display(), "initialising print services");
        let store = JobStore::open(&config.store.sqlite_path, config.worker.max_job_attempts)?;
        let devices = DeviceManager::system(config.device.clone());
        Ok(Self::new(Arc::new(store), Arc::new(devices), config))
    }

    pub fn new(store: Arc<JobStore>, devices: Arc<DeviceManager>, config: EngineConfig) -> Self {
        Self {
            store,
            devices,
            workers: Arc::new(tokio::sync::Mutex::new(None)),
            config: Arc::new(config),
        }
    }

    /// Validate a request, make sure its printer is attached and queue it.
    #[instrument(skip_all)]
    pub fn submit(&self, request: PrintJobRequest) -> Result<Submission> {
        let job = request.into_job(&self.config.limits)?;
        self.devices.check_presence(job.address)?;
        let job_id = self.store.enqueue(&job)?;
        info!(job_id = %job_id, address = %job.address, "print job accepted");
        Ok(Submission {
            job_id,
            status: JobStatus::Pending,
        })
    }

    /// Current state of a job.
    pub fn job(&self, id: JobId) -> Result<PrintJob> {
        self.store.fetch_by_id(id)
    }

    /// Parse a vendor/product pair and probe for the printer.
    pub fn check_presence(&self, vendor_id: &str, product_id: &str) -> Result<DeviceAddress> {
        let address = DeviceAddress::parse(vendor_id, product_id)?;
        self.devices.check_presence(address)?;
        Ok(address)
    }

    /// Start `count` workers plus the stale-job reclaimer.
    pub async fn start_workers(&self, count: usize) {
        let mut slot = self.workers.lock().await;
        let pool = slot.get_or_insert_with(|| {
            WorkerPool::new(
                Arc::clone(&self.store),
                self.devices.clone(),
                self.config.worker.clone(),
                self.config.store.stale_threshold(),
            )
        });
        pool.start(count);
    }

    /// Stop all workers, waiting for in-flight jobs to be written back.
    pub async fn stop_workers(&self) {
        if let Some(pool) = self.workers.lock().await.as_mut() {
            pool.stop().await;
        }
    }

    /// Release the cached device context. Call after `stop_workers`.
    pub fn cleanup(&self) {
        self.devices.cleanup();
        info!("print services cleaned up");
    }
}
