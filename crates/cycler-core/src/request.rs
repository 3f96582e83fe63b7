//! Request/reply command envelope accepted by the daemon.
//!
//! The transport wire encoding is out of scope; requests and replies are
//! plain serializable values passed over an abstract message channel. One
//! request yields exactly one reply.

use crate::error::{CyclerError, ErrorKind};
use crate::job::JobRecord;
use crate::payload::Payload;
use crate::pipeline::{Device, Pipeline};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pipeline template as written in the device file, before expansion.
///
/// A `*` in the name expands into one concrete pipeline per channel of its
/// single referenced device; a template without a wildcard must bind one
/// explicit existing channel per referenced device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub name: String,
    pub devices: Vec<TemplateBinding>,
}

/// Device reference inside a pipeline template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateBinding {
    pub name: String,
    #[serde(default)]
    pub tag: Option<String>,
    /// Explicit channel; absent only in wildcard templates.
    #[serde(default)]
    pub channel: Option<u32>,
}

/// Mutation applied to one pipeline by the `pipeline` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum PipelineOp {
    /// Load a sample; fails if the pipeline is already occupied.
    Load {
        sampleid: String,
        #[serde(default)]
        capacity_mah: f64,
    },
    /// Remove any sample; clears the ready flag. Idempotent when empty,
    /// rejected while a job occupies the pipeline.
    Eject,
    /// Set or clear the operator-asserted ready flag.
    Ready { ready: bool },
}

/// Commands accepted by the command service, one per round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cmd")]
pub enum Request {
    /// Daemon uptime/info plus the full pipeline map.
    Status,
    /// Begin daemon shutdown.
    Stop,
    /// Swap in a new configuration snapshot (devices + pipeline templates).
    Setup {
        devices: Vec<Device>,
        pipelines: Vec<PipelineTemplate>,
    },
    /// Mutate one pipeline.
    Pipeline { pipeline: String, op: PipelineOp },
    /// Submit a job; replies with the assigned jobid.
    JobSubmit {
        payload: Payload,
        #[serde(default)]
        jobname: Option<String>,
    },
    /// Job records for the given ids, or the whole queue when empty.
    JobStatus {
        #[serde(default)]
        jobids: Vec<i64>,
    },
    /// Cancel a queued job.
    JobCancel { jobid: i64 },
    /// Materialize the current output state of a job without touching it.
    JobSnapshot { jobid: i64 },
    /// Most recent job(s) matching a jobname.
    JobSearch {
        jobname: String,
        #[serde(default)]
        include_complete: bool,
    },
}

/// Daemon identity block returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub uptime_s: i64,
    pub pipelines: Vec<Pipeline>,
}

/// Current materialization of a job's output storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub jobid: i64,
    pub status: crate::job::JobStatus,
    pub rows_written: u64,
    pub storage_path: PathBuf,
}

/// Structured payload attached to successful replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReplyData {
    Daemon(DaemonStatus),
    Pipelines { pipelines: Vec<Pipeline> },
    Pipeline(Pipeline),
    Jobs { jobs: Vec<JobRecord> },
    Job(JobRecord),
    JobId { jobid: i64 },
    Snapshot(SnapshotInfo),
}

/// Every command produces exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    pub msg: String,
    #[serde(default)]
    pub data: Option<ReplyData>,
    /// Error classification, present on failures only.
    #[serde(default)]
    pub error: Option<ErrorKind>,
}

impl Reply {
    pub fn ok(msg: impl Into<String>, data: Option<ReplyData>) -> Self {
        Self {
            success: true,
            msg: msg.into(),
            data,
            error: None,
        }
    }

    pub fn fail(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            msg: msg.into(),
            data: None,
            error: Some(kind),
        }
    }

    pub fn from_error(err: &CyclerError) -> Self {
        Self::fail(err.kind(), err.to_string())
    }
}
