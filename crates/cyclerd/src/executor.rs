//! Per-job worker.
//!
//! One executor task per dispatched job, owning the job's hardware targets
//! for its whole lifetime. A hang in one channel can therefore never block
//! the scheduler or other channels. The executor starts the run, then polls
//! data and status at a bounded interval, feeding rows into the data sink,
//! until the hardware reports non-running or an external stop arrives. It
//! never lets an error escape its boundary: every exit path is a terminal
//! outcome message to the scheduler.

use crate::ops::DeviceOps;
use crate::sink::DataSink;
use cycler_core::error::CyclerResult;
use cycler_core::job::{JobRecord, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Why a running job is being halted externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIntent {
    /// Operator asked for the job to stop; terminal state `Cancelled`.
    Cancel,
    /// The daemon is abandoning the job; terminal state `Errored`.
    Abort,
}

/// Terminal report sent back to the scheduler.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub jobid: i64,
    pub pipeline: String,
    pub status: JobStatus,
    pub reason: String,
}

/// One (device, channel) pair the job drives.
#[derive(Clone)]
pub struct Target {
    pub ops: DeviceOps,
    pub channel: u32,
}

/// Control handle held by the scheduler for a running job.
pub struct ExecutorHandle {
    stop_tx: watch::Sender<Option<StopIntent>>,
    pub task: JoinHandle<()>,
}

impl ExecutorHandle {
    /// Request an external stop. The executor stops the hardware through
    /// the same retry discipline as any other operation, so this can take
    /// up to `retries × interval` per target.
    pub fn request_stop(&self, intent: StopIntent) {
        // Send fails only when the executor already exited; outcome is on
        // its way in that case.
        let _ = self.stop_tx.send(Some(intent));
    }
}

/// Spawn the worker task for a dispatched job.
pub fn spawn(
    job: JobRecord,
    pipeline_name: String,
    targets: Vec<Target>,
    capacity_mah: f64,
    sink: Arc<dyn DataSink>,
    poll_interval: Duration,
    outcome_tx: mpsc::Sender<JobOutcome>,
) -> ExecutorHandle {
    let (stop_tx, stop_rx) = watch::channel(None);
    let jobid = job.id;
    let task = tokio::spawn(async move {
        let outcome = run(job, &pipeline_name, &targets, capacity_mah, sink, poll_interval, stop_rx)
            .await;
        if outcome_tx.send(outcome).await.is_err() {
            error!(jobid, "scheduler gone; job outcome dropped");
        }
    });
    ExecutorHandle { stop_tx, task }
}

async fn run(
    job: JobRecord,
    pipeline_name: &str,
    targets: &[Target],
    capacity_mah: f64,
    sink: Arc<dyn DataSink>,
    poll_interval: Duration,
    mut stop_rx: watch::Receiver<Option<StopIntent>>,
) -> JobOutcome {
    let jobid = job.id;
    let errored = |reason: String| JobOutcome {
        jobid,
        pipeline: pipeline_name.to_string(),
        status: JobStatus::Errored,
        reason,
    };

    // Start every target in binding order.
    for target in targets {
        if let Err(err) = target
            .ops
            .start(target.channel, &job.payload, capacity_mah)
            .await
        {
            error!(jobid, device = %target.ops.device().name, error = %err, "start failed");
            return errored(format!(
                "start failed on '{}' channel {}: {err}",
                target.ops.device().name,
                target.channel
            ));
        }
    }
    info!(jobid, pipeline = %pipeline_name, targets = targets.len(), "job running");

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                let intent = match changed {
                    Ok(()) => (*stop_rx.borrow_and_update()).unwrap_or(StopIntent::Abort),
                    // Sender dropped: the daemon is going away.
                    Err(_) => StopIntent::Abort,
                };
                return halt(jobid, pipeline_name, targets, &sink, intent).await;
            }
            () = tokio::time::sleep(poll_interval) => {
                match poll_once(jobid, targets, &sink).await {
                    Ok(true) => {
                        return JobOutcome {
                            jobid,
                            pipeline: pipeline_name.to_string(),
                            status: JobStatus::Complete,
                            reason: "all channels reported completion".to_string(),
                        };
                    }
                    Ok(false) => {}
                    Err(err) => {
                        error!(jobid, error = %err, "poll failed");
                        return errored(format!("poll failed: {err}"));
                    }
                }
            }
        }
    }
}

/// Pull data from every target, then check completion. Returns `true` once
/// every channel reports non-running.
async fn poll_once(
    jobid: i64,
    targets: &[Target],
    sink: &Arc<dyn DataSink>,
) -> CyclerResult<bool> {
    let mut all_done = true;
    for target in targets {
        let report = target.ops.data(target.channel).await?;
        if report.nrows > 0 {
            let rows: Vec<_> = report
                .batch
                .rows
                .into_iter()
                .map(|row| {
                    serde_json::json!({
                        "device": target.ops.device().name,
                        "channel": target.channel,
                        "row": row,
                    })
                })
                .collect();
            sink.append(jobid, &rows).await?;
        }

        let status = target.ops.status(target.channel).await?;
        if !status.ready {
            all_done = false;
        }
    }
    Ok(all_done)
}

async fn halt(
    jobid: i64,
    pipeline_name: &str,
    targets: &[Target],
    sink: &Arc<dyn DataSink>,
    intent: StopIntent,
) -> JobOutcome {
    let mut failures = Vec::new();
    for target in targets {
        if let Err(err) = target.ops.stop(target.channel).await {
            warn!(jobid, device = %target.ops.device().name, error = %err, "stop failed");
            failures.push(err.to_string());
        }
    }
    // Final pull so rows buffered before the stop are not lost.
    if let Err(err) = poll_once(jobid, targets, sink).await {
        warn!(jobid, error = %err, "final data pull failed");
    }

    let (status, reason) = match intent {
        StopIntent::Cancel if failures.is_empty() => {
            (JobStatus::Cancelled, "stopped by request".to_string())
        }
        StopIntent::Cancel => (
            JobStatus::Errored,
            format!("stop requested but failed: {}", failures.join("; ")),
        ),
        StopIntent::Abort => (JobStatus::Errored, "aborted by daemon".to_string()),
    };
    JobOutcome {
        jobid,
        pipeline: pipeline_name.to_string(),
        status,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::JsonlSink;
    use cycler_core::payload::{Payload, Technique};
    use cycler_core::pipeline::Device;
    use cycler_driver_mock::{MockCycler, MockCyclerConfig};
    use std::collections::HashMap;
    use std::path::Path;

    fn device(dir: &Path) -> Device {
        Device {
            name: "cycler-1".into(),
            driver: "mock".into(),
            address: "sim:cycler-1".into(),
            channels: vec![1],
            libpath: None,
            lockpath: Some(dir.join("cycler-1.lock")),
            retries: 1,
            retry_interval_s: 0,
        }
    }

    fn job(id: i64) -> JobRecord {
        JobRecord::new(
            id,
            None,
            Payload {
                techniques: vec![Technique {
                    name: "cc".into(),
                    parameters: HashMap::new(),
                }],
                ..Default::default()
            },
        )
    }

    fn targets(mock: &Arc<MockCycler>, dir: &Path) -> Vec<Target> {
        vec![Target {
            ops: DeviceOps::new(mock.clone(), device(dir)),
            channel: 1,
        }]
    }

    #[tokio::test]
    async fn job_completes_when_hardware_stops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::with_config(MockCyclerConfig {
            polls_until_stop: 2,
            rows_per_poll: 3,
            ..Default::default()
        }));
        let sink = Arc::new(JsonlSink::new(dir.path().join("jobs")));
        let (tx, mut rx) = mpsc::channel(1);

        let _handle = spawn(
            job(1),
            "cell-01".into(),
            targets(&mock, dir.path()),
            0.0,
            sink.clone(),
            Duration::from_millis(5),
            tx,
        );

        let outcome = rx.recv().await.expect("outcome");
        assert_eq!(outcome.status, JobStatus::Complete);
        assert_eq!(outcome.pipeline, "cell-01");
        assert!(sink.rows_written(1).await.expect("rows") > 0);
    }

    #[tokio::test]
    async fn external_stop_yields_cancelled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::with_config(MockCyclerConfig {
            polls_until_stop: 10_000,
            ..Default::default()
        }));
        let sink = Arc::new(JsonlSink::new(dir.path().join("jobs")));
        let (tx, mut rx) = mpsc::channel(1);

        let handle = spawn(
            job(2),
            "cell-01".into(),
            targets(&mock, dir.path()),
            0.0,
            sink,
            Duration::from_millis(5),
            tx,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.request_stop(StopIntent::Cancel);

        let outcome = rx.recv().await.expect("outcome");
        assert_eq!(outcome.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn start_failure_reports_errored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::with_config(MockCyclerConfig {
            connect_failures: u32::MAX,
            ..Default::default()
        }));
        let sink = Arc::new(JsonlSink::new(dir.path().join("jobs")));
        let (tx, mut rx) = mpsc::channel(1);

        spawn(
            job(3),
            "cell-01".into(),
            targets(&mock, dir.path()),
            0.0,
            sink,
            Duration::from_millis(5),
            tx,
        );

        let outcome = rx.recv().await.expect("outcome");
        assert_eq!(outcome.status, JobStatus::Errored);
        assert!(outcome.reason.contains("start failed"));
    }
}
