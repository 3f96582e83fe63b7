//! Job-scoped data storage.
//!
//! The daemon is not a data-analysis system; it only captures measurement
//! rows into per-job storage. `DataSink` is the seam, `JsonlSink` the
//! file-backed implementation writing `jobs/<id>/data.jsonl` under the
//! configured storage root.

use async_trait::async_trait;
use cycler_core::error::{CyclerError, CyclerResult};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Accepts measurement rows for a job and persists them.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Append rows to the job's storage. Must be safe to call repeatedly
    /// with incremental batches.
    async fn append(&self, jobid: i64, rows: &[serde_json::Value]) -> CyclerResult<()>;

    /// Rows persisted so far for a job.
    async fn rows_written(&self, jobid: i64) -> CyclerResult<u64>;

    /// Storage location for a job, for snapshot replies.
    fn job_path(&self, jobid: i64) -> PathBuf;
}

/// One JSON object per line, one directory per job.
pub struct JsonlSink {
    root: PathBuf,
}

impl JsonlSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn data_file(&self, jobid: i64) -> PathBuf {
        self.job_path(jobid).join("data.jsonl")
    }
}

#[async_trait]
impl DataSink for JsonlSink {
    async fn append(&self, jobid: i64, rows: &[serde_json::Value]) -> CyclerResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let dir = self.job_path(jobid);
        tokio::fs::create_dir_all(&dir).await?;

        let mut buf = Vec::with_capacity(rows.len() * 64);
        for row in rows {
            serde_json::to_writer(&mut buf, row)
                .map_err(|e| CyclerError::Storage(e.to_string()))?;
            buf.push(b'\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_file(jobid))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rows_written(&self, jobid: i64) -> CyclerResult<u64> {
        let path = self.data_file(jobid);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text.lines().filter(|l| !l.trim().is_empty()).count() as u64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn job_path(&self, jobid: i64) -> PathBuf {
        self.root.join(jobid.to_string())
    }
}

/// Keep the storage root usable before any job runs.
pub fn ensure_storage_root(root: &Path) -> CyclerResult<()> {
    std::fs::create_dir_all(root)?;
    Ok(())
}
