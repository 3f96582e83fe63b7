//! Durable, crash-recoverable job queue.
//!
//! Backed by SQLite in WAL mode with a single guarded connection; every
//! operation is one statement or one transaction, so mutations are
//! linearized and a concurrent reader can never observe an id without its
//! record. Ids come from `INTEGER PRIMARY KEY AUTOINCREMENT`, which makes
//! them monotonic and never reused. Records are retained after completion
//! for query, search and snapshot.

use chrono::{DateTime, Utc};
use cycler_core::error::{CyclerError, CyclerResult};
use cycler_core::job::{JobRecord, JobStatus};
use cycler_core::payload::Payload;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

pub struct JobQueue {
    conn: Mutex<Connection>,
}

impl JobQueue {
    /// Open (creating if needed) the queue database.
    pub fn open(path: &Path) -> CyclerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(storage)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                jobname TEXT,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                pipeline TEXT,
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                exit_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_status ON queue (status);
            ",
        )
        .map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory queue for tests.
    pub fn open_in_memory() -> CyclerResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                jobname TEXT,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                pipeline TEXT,
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                exit_reason TEXT
            );
            ",
        )
        .map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new queued job and return its id.
    ///
    /// A single INSERT both assigns the id and makes the record durable, so
    /// no reader can ever see the id without the record.
    pub fn submit(&self, payload: &Payload, jobname: Option<&str>) -> CyclerResult<i64> {
        let conn = self.lock();
        let payload_json = serde_json::to_string(payload).map_err(storage)?;
        conn.execute(
            "INSERT INTO queue (jobname, payload, status, submitted_at)
             VALUES (?1, ?2, 'queued', ?3)",
            params![jobname, payload_json, Utc::now().to_rfc3339()],
        )
        .map_err(storage)?;
        let id = conn.last_insert_rowid();
        info!(jobid = id, jobname = jobname.unwrap_or(""), "job submitted");
        Ok(id)
    }

    pub fn get(&self, jobid: i64) -> CyclerResult<JobRecord> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, jobname, payload, status, pipeline,
                    submitted_at, started_at, completed_at, exit_reason
             FROM queue WHERE id = ?1",
            params![jobid],
            record_from_row,
        )
        .optional()
        .map_err(storage)?
        .ok_or_else(|| CyclerError::not_found(format!("job {jobid}")))
    }

    /// Records for the given ids; the empty selector returns the whole
    /// queue in submission order.
    pub fn status(&self, jobids: &[i64]) -> CyclerResult<Vec<JobRecord>> {
        if jobids.is_empty() {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT id, jobname, payload, status, pipeline,
                            submitted_at, started_at, completed_at, exit_reason
                     FROM queue ORDER BY id",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map([], record_from_row)
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?;
            return Ok(rows);
        }
        jobids.iter().map(|&id| self.get(id)).collect()
    }

    /// Jobs in `Queued` state, in submission order; the scheduler's scan
    /// set.
    pub fn queued(&self) -> CyclerResult<Vec<JobRecord>> {
        self.by_status(JobStatus::Queued)
    }

    /// Jobs left `Running` by a previous daemon process. They keep their
    /// records and pipeline references; recovery does not restart them.
    pub fn running(&self) -> CyclerResult<Vec<JobRecord>> {
        self.by_status(JobStatus::Running)
    }

    fn by_status(&self, status: JobStatus) -> CyclerResult<Vec<JobRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, jobname, payload, status, pipeline,
                        submitted_at, started_at, completed_at, exit_reason
                 FROM queue WHERE status = ?1 ORDER BY id",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![status.as_str()], record_from_row)
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        Ok(rows)
    }

    /// Cancel a queued job. Rejected for any other state: a running job
    /// must be stopped through its pipeline instead.
    pub fn cancel(&self, jobid: i64) -> CyclerResult<JobRecord> {
        {
            let conn = self.lock();
            let changed = conn
                .execute(
                    "UPDATE queue
                     SET status = 'cancelled', completed_at = ?2,
                         exit_reason = 'cancelled while queued'
                     WHERE id = ?1 AND status = 'queued'",
                    params![jobid, Utc::now().to_rfc3339()],
                )
                .map_err(storage)?;
            if changed == 0 {
                drop(conn);
                let current = self.get(jobid)?;
                return Err(CyclerError::conflict(format!(
                    "cannot cancel job {jobid} in state '{}'",
                    current.status
                )));
            }
        }
        info!(jobid, "job cancelled");
        self.get(jobid)
    }

    /// Atomically transition a queued job to running on a pipeline.
    ///
    /// The conditional UPDATE is the queue half of the dispatch pairing: it
    /// succeeds at most once per job, so no job can ever be claimed by two
    /// pipelines.
    pub fn mark_running(
        &self,
        jobid: i64,
        pipeline: &str,
        started_at: DateTime<Utc>,
    ) -> CyclerResult<()> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE queue SET status = 'running', pipeline = ?2, started_at = ?3
                 WHERE id = ?1 AND status = 'queued'",
                params![jobid, pipeline, started_at.to_rfc3339()],
            )
            .map_err(storage)?;
        if changed == 0 {
            return Err(CyclerError::conflict(format!(
                "job {jobid} is no longer queued"
            )));
        }
        Ok(())
    }

    /// Write a terminal outcome for a running job.
    pub fn finish(
        &self,
        jobid: i64,
        status: JobStatus,
        exit_reason: &str,
    ) -> CyclerResult<JobRecord> {
        if !status.is_terminal() {
            return Err(CyclerError::Storage(format!(
                "'{status}' is not a terminal status"
            )));
        }
        {
            let conn = self.lock();
            let changed = conn
                .execute(
                    "UPDATE queue SET status = ?2, completed_at = ?3, exit_reason = ?4
                     WHERE id = ?1 AND status = 'running'",
                    params![
                        jobid,
                        status.as_str(),
                        Utc::now().to_rfc3339(),
                        exit_reason
                    ],
                )
                .map_err(storage)?;
            if changed == 0 {
                return Err(CyclerError::conflict(format!(
                    "job {jobid} is not running"
                )));
            }
        }
        info!(jobid, status = %status, exit_reason, "job finished");
        self.get(jobid)
    }

    /// Jobs matching a jobname, most recent first. Completed jobs are
    /// excluded unless asked for.
    pub fn search(&self, jobname: &str, include_complete: bool) -> CyclerResult<Vec<JobRecord>> {
        let conn = self.lock();
        let sql = if include_complete {
            "SELECT id, jobname, payload, status, pipeline,
                    submitted_at, started_at, completed_at, exit_reason
             FROM queue WHERE jobname LIKE ?1 ORDER BY id DESC"
        } else {
            "SELECT id, jobname, payload, status, pipeline,
                    submitted_at, started_at, completed_at, exit_reason
             FROM queue WHERE jobname LIKE ?1 AND status IN ('queued', 'running')
             ORDER BY id DESC"
        };
        let mut stmt = conn.prepare(sql).map_err(storage)?;
        let pattern = format!("%{jobname}%");
        let rows = stmt
            .query_map(params![pattern], record_from_row)
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        Ok(rows)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn storage(err: impl std::fmt::Display) -> CyclerError {
    CyclerError::Storage(err.to_string())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let payload_json: String = row.get(2)?;
    let status_text: String = row.get(3)?;
    Ok(JobRecord {
        id: row.get(0)?,
        jobname: row.get(1)?,
        payload: serde_json::from_str(&payload_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        status: JobStatus::parse(&status_text).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown status '{status_text}'").into(),
            )
        })?,
        pipeline: row.get(4)?,
        submitted_at: parse_ts(row, 5)?,
        started_at: parse_opt_ts(row, 6)?,
        completed_at: parse_opt_ts(row, 7)?,
        exit_reason: row.get(8)?,
    })
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(&text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}
