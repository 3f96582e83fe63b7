//! Job records and their lifecycle.

use crate::payload::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// `Queued → Running → {Complete, Errored, Cancelled}`; the three terminal
/// states admit no further transitions. Cancellation is only permitted while
/// `Queued` — a running job is halted through the running-pipeline stop path
/// instead, which is why cancel and stop are distinct operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Errored,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Errored | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Errored => "errored",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "complete" => Some(JobStatus::Complete),
            "errored" => Some(JobStatus::Errored),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted record of one submitted job.
///
/// Ids are assigned atomically by the queue, increase monotonically, and are
/// never reused. Once a job leaves `Queued` only status, timestamps and exit
/// reason may change; the payload is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    /// Human-readable name; may be duplicated across jobs.
    pub jobname: Option<String>,
    pub payload: Payload,
    pub status: JobStatus,
    /// Name of the pipeline the job was dispatched to; `None` until then.
    /// Retained after completion, and after a reload that removed the
    /// pipeline, as the job's last-known placement.
    pub pipeline: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the job ended: completion note or captured error.
    pub exit_reason: Option<String>,
}

impl JobRecord {
    pub fn new(id: i64, jobname: Option<String>, payload: Payload) -> Self {
        Self {
            id,
            jobname,
            payload,
            status: JobStatus::Queued,
            pipeline: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Errored.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_parse_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Errored,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("paused"), None);
    }
}
