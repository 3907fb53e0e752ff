// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent job store backed by SQLite.
//
// Label jobs live in `label_jobs`; rasterized receipt jobs in `receipt_jobs`
// (persisted but not yet executed). A single connection sits behind a mutex,
// so every insert, claim and update is mutually exclusive within the process.
// Claiming is one `UPDATE ... RETURNING` statement, which keeps it atomic
// against other processes sharing the database file as well.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, instrument, warn};

use posprint_core::error::{PosPrintError, Result};
use posprint_core::types::{
    DeviceAddress, JobId, JobStatus, LabelGap, LabelSpec, NewJob, NewReceiptJob, PrintJob,
    ReceiptConnection, ReceiptJob,
};

/// Schema of the first release. Later columns are added by migration.
const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS label_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vendor_id INTEGER NOT NULL,
        product_id INTEGER NOT NULL,
        size_x_mm INTEGER NOT NULL,
        size_y_mm INTEGER NOT NULL,
        direction INTEGER NOT NULL DEFAULT 0,
        header_text TEXT NOT NULL DEFAULT '',
        barcode_data TEXT NOT NULL,
        copies INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_label_jobs_status
        ON label_jobs (status, created_at, id);

    CREATE TABLE IF NOT EXISTS receipt_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL,
        print_count INTEGER NOT NULL DEFAULT 1,
        connection_type TEXT NOT NULL CHECK (connection_type IN ('network', 'usb')),
        printer_ip TEXT,
        printer_port INTEGER,
        usb_vendor_id INTEGER,
        usb_product_id INTEGER,
        usb_interface INTEGER,
        printer_width INTEGER NOT NULL DEFAULT 576,
        threshold INTEGER NOT NULL DEFAULT 100,
        feed_lines INTEGER NOT NULL DEFAULT 1,
        zoom REAL NOT NULL DEFAULT 2.0,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
"#;

/// Columns added after the first release.
const MIGRATE_LABEL_COLUMNS_SQL: &str = r#"
    ALTER TABLE label_jobs ADD COLUMN gap_length_mm INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE label_jobs ADD COLUMN gap_offset_mm INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE label_jobs ADD COLUMN last_error TEXT;
"#;

const JOB_COLUMNS: &str = "id, vendor_id, product_id, size_x_mm, size_y_mm, direction, \
     header_text, barcode_data, copies, gap_length_mm, gap_offset_mm, status, attempts, \
     last_error, created_at, updated_at";

const RECEIPT_COLUMNS: &str = "id, file_path, print_count, connection_type, printer_ip, \
     printer_port, usb_vendor_id, usb_product_id, usb_interface, printer_width, threshold, \
     feed_lines, zoom, status, retry_count, last_error, created_at, updated_at";

/// Durable FIFO of print jobs.
///
/// All methods are synchronous; async callers should go through
/// `tokio::task::spawn_blocking` for anything but short statements.
pub struct JobStore {
    conn: Mutex<Connection>,
    /// Claims allowed per job before it stops being eligible.
    max_attempts: u32,
}

impl JobStore {
    /// Open (or create) the store at `path`, creating parent directories.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, max_attempts: u32) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(store_err("open"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err("WAL pragma"))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(store_err("busy timeout"))?;
        init_schema(&conn)?;

        info!(max_attempts, "job store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            max_attempts,
        })
    }

    /// Open a private in-memory store (tests, dry runs).
    pub fn open_in_memory(max_attempts: u32) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err("open in-memory"))?;
        init_schema(&conn)?;
        debug!("in-memory job store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            max_attempts,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PosPrintError::Store("connection lock poisoned".into()))
    }

    /// Insert a label job as `pending` with zero attempts.
    #[instrument(skip(self, job), fields(address = %job.address))]
    pub fn enqueue(&self, job: &NewJob) -> Result<JobId> {
        let now = timestamp(Utc::now());
        let label = &job.label;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO label_jobs (vendor_id, product_id, size_x_mm, size_y_mm, direction,
                 header_text, barcode_data, copies, gap_length_mm, gap_offset_mm,
                 status, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?12)",
            params![
                job.address.vendor_id,
                job.address.product_id,
                label.size_x_mm,
                label.size_y_mm,
                label.direction,
                label.header_text,
                label.barcode_data,
                label.copies,
                label.gap.length_mm,
                label.gap.offset_mm,
                JobStatus::Pending.as_str(),
                now,
            ],
        )
        .map_err(store_err("insert job"))?;

        let id = JobId(conn.last_insert_rowid());
        info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Claim the oldest eligible `pending` job: mark it `in_progress` and
    /// count the attempt in the same statement that returns it.
    ///
    /// `Ok(None)` when nothing is claimable.
    pub fn claim_next(&self) -> Result<Option<PrintJob>> {
        let now = timestamp(Utc::now());
        let sql = format!(
            "UPDATE label_jobs
                SET status = ?1, attempts = attempts + 1, updated_at = ?2
              WHERE id = (SELECT id FROM label_jobs
                           WHERE status = ?3 AND attempts < ?4
                           ORDER BY created_at ASC, id ASC
                           LIMIT 1)
             RETURNING {JOB_COLUMNS}"
        );

        let conn = self.conn()?;
        let job = conn
            .query_row(
                &sql,
                params![
                    JobStatus::InProgress.as_str(),
                    now,
                    JobStatus::Pending.as_str(),
                    self.max_attempts,
                ],
                row_to_job,
            )
            .optional()
            .map_err(store_err("claim job"))?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, attempt = job.attempts, "job claimed");
        }
        Ok(job)
    }

    /// Set a job's status and last error, bumping `updated_at`.
    #[instrument(skip(self, last_error), fields(job_id = %id, status = %status))]
    pub fn update_status(&self, id: JobId, status: JobStatus, last_error: Option<&str>) -> Result<()> {
        let now = timestamp(Utc::now());
        let rows = self
            .conn()?
            .execute(
                "UPDATE label_jobs SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), last_error, now, id.0],
            )
            .map_err(store_err("update status"))?;

        if rows == 0 {
            return Err(PosPrintError::JobNotFound(id));
        }
        debug!("job status updated");
        Ok(())
    }

    /// Return `in_progress` jobs untouched for longer than `threshold` to
    /// `pending`. Attempts are left as they are.
    pub fn reclaim_stale(&self, threshold: Duration) -> Result<usize> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| PosPrintError::Config(format!("stale threshold: {e}")))?;
        self.reclaim_stale_before(Utc::now() - threshold)
    }

    /// Return `in_progress` jobs last updated before `cutoff` to `pending`.
    ///
    /// A job abandoned on its final attempt also goes back to `pending` with
    /// `attempts == max_attempts`. `claim_next` skips such rows, so they stay
    /// `pending` and are never marked `failed`; find them with
    /// `jobs_with_status(Pending)` and compare `attempts`.
    #[instrument(skip(self))]
    pub fn reclaim_stale_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let now = timestamp(Utc::now());
        let count = self
            .conn()?
            .execute(
                "UPDATE label_jobs SET status = ?1, updated_at = ?2
                  WHERE status = ?3 AND updated_at < ?4",
                params![
                    JobStatus::Pending.as_str(),
                    now,
                    JobStatus::InProgress.as_str(),
                    timestamp(cutoff),
                ],
            )
            .map_err(store_err("reclaim stale"))?;

        if count > 0 {
            warn!(count, "stale jobs returned to the queue");
        }
        Ok(count)
    }

    /// Fetch a job by id.
    pub fn fetch_by_id(&self, id: JobId) -> Result<PrintJob> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM label_jobs WHERE id = ?1");
        self.conn()?
            .query_row(&sql, params![id.0], row_to_job)
            .optional()
            .map_err(store_err("fetch job"))?
            .ok_or(PosPrintError::JobNotFound(id))
    }

    /// All jobs in `status`, oldest first.
    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<PrintJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM label_jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(store_err("prepare list"))?;
        let jobs = stmt
            .query_map(params![status.as_str()], row_to_job)
            .map_err(store_err("query list"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err("collect rows"))?;

        debug!(count = jobs.len(), %status, "listed jobs");
        Ok(jobs)
    }

    // -- Receipt jobs ---------------------------------------------------------

    /// Persist a receipt job. Nothing executes these yet.
    #[instrument(skip(self, job), fields(connection = job.connection.kind()))]
    pub fn enqueue_receipt(&self, job: &NewReceiptJob) -> Result<JobId> {
        let (ip, port, vendor_id, product_id, interface) = match &job.connection {
            ReceiptConnection::Network { ip, port } => (Some(ip.as_str()), Some(*port), None, None, None),
            ReceiptConnection::Usb {
                vendor_id,
                product_id,
                interface,
            } => (None, None, Some(*vendor_id), Some(*product_id), Some(*interface)),
        };
        let now = timestamp(Utc::now());

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO receipt_jobs (file_path, print_count, connection_type, printer_ip,
                 printer_port, usb_vendor_id, usb_product_id, usb_interface, printer_width,
                 threshold, feed_lines, zoom, status, retry_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14, ?14)",
            params![
                job.file_path,
                job.print_count,
                job.connection.kind(),
                ip,
                port,
                vendor_id,
                product_id,
                interface,
                job.printer_width,
                job.threshold,
                job.feed_lines,
                job.zoom,
                JobStatus::Pending.as_str(),
                now,
            ],
        )
        .map_err(store_err("insert receipt job"))?;

        let id = JobId(conn.last_insert_rowid());
        info!(job_id = %id, "receipt job stored");
        Ok(id)
    }

    pub fn fetch_receipt(&self, id: JobId) -> Result<ReceiptJob> {
        let sql = format!("SELECT {RECEIPT_COLUMNS} FROM receipt_jobs WHERE id = ?1");
        self.conn()?
            .query_row(&sql, params![id.0], row_to_receipt)
            .optional()
            .map_err(store_err("fetch receipt job"))?
            .ok_or(PosPrintError::JobNotFound(id))
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES_SQL)
        .map_err(store_err("create tables"))?;
    migrate_label_columns(conn);
    Ok(())
}

/// Add post-release columns. Each `ALTER TABLE` runs on its own; on an
/// already migrated database it fails with "duplicate column" and is skipped.
fn migrate_label_columns(conn: &Connection) {
    for stmt in MIGRATE_LABEL_COLUMNS_SQL.split(';') {
        let trimmed = stmt.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Err(e) = conn.execute_batch(trimmed) {
            debug!(error = %e, "migration step skipped");
        }
    }
}

fn store_err(context: &'static str) -> impl Fn(rusqlite::Error) -> PosPrintError {
    move |e| PosPrintError::Store(format!("{context}: {e}"))
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_failure(index: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn parse_status(row: &Row<'_>, index: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(index)?;
    raw.parse().map_err(|e| conversion_failure(index, e))
}

fn parse_timestamp(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(index, e))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<PrintJob> {
    Ok(PrintJob {
        id: JobId(row.get(0)?),
        address: DeviceAddress::new(row.get(1)?, row.get(2)?),
        label: LabelSpec {
            size_x_mm: row.get(3)?,
            size_y_mm: row.get(4)?,
            direction: row.get(5)?,
            header_text: row.get(6)?,
            barcode_data: row.get(7)?,
            copies: row.get(8)?,
            gap: LabelGap::new(row.get(9)?, row.get(10)?),
        },
        status: parse_status(row, 11)?,
        attempts: row.get(12)?,
        last_error: row.get(13)?,
        created_at: parse_timestamp(row, 14)?,
        updated_at: parse_timestamp(row, 15)?,
    })
}

fn row_to_receipt(row: &Row<'_>) -> rusqlite::Result<ReceiptJob> {
    let kind: String = row.get(3)?;
    let connection = match kind.as_str() {
        "network" => ReceiptConnection::Network {
            ip: row.get(4)?,
            port: row.get(5)?,
        },
        "usb" => ReceiptConnection::Usb {
            vendor_id: row.get(6)?,
            product_id: row.get(7)?,
            interface: row.get(8)?,
        },
        other => {
            return Err(conversion_failure(
                3,
                PosPrintError::Store(format!("unknown connection type {other:?}")),
            ));
        }
    };

    Ok(ReceiptJob {
        id: JobId(row.get(0)?),
        job: NewReceiptJob {
            file_path: row.get(1)?,
            print_count: row.get(2)?,
            connection,
            printer_width: row.get(9)?,
            threshold: row.get(10)?,
            feed_lines: row.get(11)?,
            zoom: row.get(12)?,
        },
        status: parse_status(row, 13)?,
        retry_count: row.get(14)?,
        last_error: row.get(15)?,
        created_at: parse_timestamp(row, 16)?,
        updated_at: parse_timestamp(row, 17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn new_job(barcode: &str) -> NewJob {
        NewJob {
            address: DeviceAddress::new(0x0fe6, 0x8800),
            label: LabelSpec {
                size_x_mm: 45,
                size_y_mm: 35,
                direction: 0,
                header_text: "TOP".into(),
                barcode_data: barcode.into(),
                copies: 1,
                gap: LabelGap::new(2, 0),
            },
        }
    }

    #[test]
    fn enqueued_job_is_pending_with_zero_attempts() {
        let store = JobStore::open_in_memory(3).expect("open in-memory db");
        let job = new_job("12345");
        let id = store.enqueue(&job).expect("enqueue");

        let fetched = store.fetch_by_id(id).expect("fetch");
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.attempts, 0);
        assert_eq!(fetched.address, job.address);
        assert_eq!(fetched.label, job.label);
        assert_eq!(fetched.last_error, None);
    }

    #[test]
    fn claims_are_fifo_and_count_attempts() {
        let store = JobStore::open_in_memory(3).expect("open in-memory db");
        let first = store.enqueue(&new_job("1")).expect("enqueue 1");
        let second = store.enqueue(&new_job("2")).expect("enqueue 2");

        let claimed = store.claim_next().expect("claim").expect("job available");
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert_eq!(claimed.attempts, 1);

        let claimed = store.claim_next().expect("claim").expect("job available");
        assert_eq!(claimed.id, second);
        assert!(store.claim_next().expect("claim").is_none());
    }

    #[test]
    fn exhausted_jobs_are_not_claimable() {
        let store = JobStore::open_in_memory(2).expect("open in-memory db");
        let id = store.enqueue(&new_job("1")).expect("enqueue");

        for _ in 0..2 {
            let job = store.claim_next().expect("claim").expect("eligible");
            store
                .update_status(job.id, JobStatus::Pending, Some("busy"))
                .expect("requeue");
        }
        assert!(store.claim_next().expect("claim").is_none());

        let job = store.fetch_by_id(id).expect("fetch");
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("busy"));
    }

    #[test]
    fn concurrent_claims_never_share_a_job() {
        let store = Arc::new(JobStore::open_in_memory(3).expect("open in-memory db"));
        for i in 0..40 {
            store.enqueue(&new_job(&i.to_string())).expect("enqueue");
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Some(job) = store.claim_next().expect("claim") {
                        ids.push(job.id);
                    }
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("join") {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[test]
    fn stale_jobs_return_to_pending_with_attempts_kept() {
        let store = JobStore::open_in_memory(3).expect("open in-memory db");
        let stale = store.enqueue(&new_job("1")).expect("enqueue");
        let done = store.enqueue(&new_job("2")).expect("enqueue");
        store.claim_next().expect("claim").expect("job");
        store.claim_next().expect("claim").expect("job");
        store.update_status(done, JobStatus::Done, None).expect("done");

        // Nothing is older than ten minutes yet.
        assert_eq!(store.reclaim_stale(Duration::from_secs(600)).expect("reclaim"), 0);

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.reclaim_stale_before(future).expect("reclaim"), 1);

        let job = store.fetch_by_id(stale).expect("fetch");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(store.fetch_by_id(done).expect("fetch").status, JobStatus::Done);
    }

    #[test]
    fn job_abandoned_on_last_attempt_stays_pending_and_unclaimable() {
        let store = JobStore::open_in_memory(1).expect("open in-memory db");
        let id = store.enqueue(&new_job("1")).expect("enqueue");
        store.claim_next().expect("claim").expect("job");

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.reclaim_stale_before(future).expect("reclaim"), 1);

        let job = store.fetch_by_id(id).expect("fetch");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, store.max_attempts());
        assert!(store.claim_next().expect("claim").is_none());
    }

    #[test]
    fn missing_jobs_are_reported() {
        let store = JobStore::open_in_memory(3).expect("open in-memory db");
        assert!(matches!(
            store.fetch_by_id(JobId(99)),
            Err(PosPrintError::JobNotFound(JobId(99)))
        ));
        assert!(matches!(
            store.update_status(JobId(99), JobStatus::Done, None),
            Err(PosPrintError::JobNotFound(_))
        ));
    }

    #[test]
    fn jobs_are_listed_by_status() {
        let store = JobStore::open_in_memory(3).expect("open in-memory db");
        let a = store.enqueue(&new_job("a")).expect("enqueue");
        let b = store.enqueue(&new_job("b")).expect("enqueue");
        store.update_status(a, JobStatus::Failed, Some("gone")).expect("fail");

        let pending = store.jobs_with_status(JobStatus::Pending).expect("list");
        assert_eq!(pending.iter().map(|j| j.id).collect::<Vec<_>>(), vec![b]);
        let failed = store.jobs_with_status(JobStatus::Failed).expect("list");
        assert_eq!(failed[0].last_error.as_deref(), Some("gone"));
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db").join("jobs.sqlite.db");

        let id = {
            let store = JobStore::open(&path, 3).expect("open");
            store.enqueue(&new_job("persist")).expect("enqueue")
        };

        let store = JobStore::open(&path, 3).expect("reopen runs migration again");
        let job = store.fetch_by_id(id).expect("fetch");
        assert_eq!(job.label.barcode_data, "persist");
        assert_eq!(job.label.gap, LabelGap::new(2, 0));
    }

    #[test]
    fn receipt_jobs_round_trip() {
        let store = JobStore::open_in_memory(3).expect("open in-memory db");

        let network = NewReceiptJob::new(
            "/tmp/receipt.pdf",
            ReceiptConnection::Network {
                ip: "192.168.1.50".into(),
                port: 9100,
            },
        );
        let id = store.enqueue_receipt(&network).expect("enqueue");
        let stored = store.fetch_receipt(id).expect("fetch");
        assert_eq!(stored.job, network);
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        let usb = NewReceiptJob {
            threshold: 130,
            ..NewReceiptJob::new(
                "/tmp/other.pdf",
                ReceiptConnection::Usb {
                    vendor_id: 0x0483,
                    product_id: 0x5743,
                    interface: 0,
                },
            )
        };
        let id = store.enqueue_receipt(&usb).expect("enqueue");
        assert_eq!(store.fetch_receipt(id).expect("fetch").job, usb);
    }
}
