//! The daemon loop.
//!
//! One task owns the registry, the queue handle and the scheduler, and is
//! the only writer to any of them. Commands, scheduler ticks and executor
//! outcomes are interleaved through a single `select!`, so every command
//! observes and mutates a consistent snapshot without further locking.

use crate::config::{self, Settings};
use crate::executor::StopIntent;
use crate::queue::JobQueue;
use crate::scheduler::Scheduler;
use crate::service::Envelope;
use crate::sink::{self, DataSink, JsonlSink};
use chrono::{DateTime, Utc};
use cycler_core::driver::DriverRegistry;
use cycler_core::error::{CyclerError, CyclerResult, ErrorKind};
use cycler_core::request::{
    DaemonStatus, PipelineOp, Reply, ReplyData, Request, SnapshotInfo,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct Daemon {
    scheduler: Scheduler,
    queue: Arc<JobQueue>,
    drivers: Arc<DriverRegistry>,
    sink: Arc<JsonlSink>,
    started_at: DateTime<Utc>,
    tick_interval: std::time::Duration,
    outcome_rx: mpsc::Receiver<crate::executor::JobOutcome>,
    shutting_down: bool,
}

impl Daemon {
    pub fn new(settings: &Settings, drivers: Arc<DriverRegistry>) -> CyclerResult<Self> {
        sink::ensure_storage_root(&settings.storage_dir)?;
        let queue = Arc::new(JobQueue::open(&settings.queue_path)?);
        let sink = Arc::new(JsonlSink::new(settings.storage_dir.clone()));
        let (outcome_tx, outcome_rx) = mpsc::channel(64);
        let scheduler = Scheduler::new(
            queue.clone(),
            drivers.clone(),
            sink.clone() as Arc<dyn DataSink>,
            settings.poll_interval(),
            outcome_tx,
        );

        // Jobs left running by an earlier daemon process stay queryable
        // but are never restarted.
        for record in queue.running()? {
            warn!(
                jobid = record.id,
                pipeline = record.pipeline.as_deref().unwrap_or(""),
                "found job still marked running from a previous run"
            );
        }

        Ok(Self {
            scheduler,
            queue,
            drivers,
            sink,
            started_at: Utc::now(),
            tick_interval: settings.tick_interval(),
            outcome_rx,
            shutting_down: false,
        })
    }

    /// Run until a `stop` command arrives (or every client hangs up) and
    /// all running jobs have reported their outcome.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Envelope>) -> CyclerResult<()> {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(version = env!("CARGO_PKG_VERSION"), "daemon running");

        loop {
            tokio::select! {
                maybe = requests.recv(), if !self.shutting_down => {
                    match maybe {
                        Some(envelope) => {
                            let stop = matches!(envelope.request, Request::Stop);
                            let reply = self.handle_request(envelope.request).await;
                            // A client that gave up on the reply is fine.
                            let _ = envelope.reply_tx.send(reply);
                            if stop {
                                self.begin_shutdown();
                            }
                        }
                        None => {
                            info!("all command clients gone, shutting down");
                            self.begin_shutdown();
                        }
                    }
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    self.scheduler.handle_outcome(outcome);
                }
                _ = tick.tick(), if !self.shutting_down => {
                    self.scheduler.tick();
                }
            }

            if self.shutting_down && !self.scheduler.has_running_jobs() {
                break;
            }
        }
        info!("daemon stopped");
        Ok(())
    }

    fn begin_shutdown(&mut self) {
        if !self.shutting_down {
            self.shutting_down = true;
            self.scheduler.stop_all();
        }
    }

    /// Dispatch one command. Every outcome, success or failure, becomes a
    /// reply; errors never escape the loop.
    pub async fn handle_request(&mut self, request: Request) -> Reply {
        match request {
            Request::Status => self.status(),
            Request::Stop => Reply::ok("shutdown initiated", None),
            Request::Setup { devices, pipelines } => self.setup(devices, pipelines),
            Request::Pipeline { pipeline, op } => self.pipeline_op(&pipeline, op),
            Request::JobSubmit { payload, jobname } => {
                match self.queue.submit(&payload, jobname.as_deref()) {
                    Ok(jobid) => Reply::ok(
                        format!("job {jobid} queued"),
                        Some(ReplyData::JobId { jobid }),
                    ),
                    Err(err) => Reply::from_error(&err),
                }
            }
            Request::JobStatus { jobids } => match self.queue.status(&jobids) {
                Ok(jobs) => Reply::ok(
                    format!("{} job(s)", jobs.len()),
                    Some(ReplyData::Jobs { jobs }),
                ),
                Err(err) => Reply::from_error(&err),
            },
            Request::JobCancel { jobid } => match self.queue.cancel(jobid) {
                Ok(record) => Reply::ok(
                    format!("job {jobid} cancelled"),
                    Some(ReplyData::Job(record)),
                ),
                Err(err) => Reply::from_error(&err),
            },
            Request::JobSnapshot { jobid } => self.snapshot(jobid).await,
            Request::JobSearch {
                jobname,
                include_complete,
            } => match self.queue.search(&jobname, include_complete) {
                Ok(jobs) if jobs.is_empty() => Reply::fail(
                    ErrorKind::NotFound,
                    format!("no job matching '{jobname}' found"),
                ),
                Ok(jobs) => Reply::ok(
                    format!("{} job(s) matching '{jobname}'", jobs.len()),
                    Some(ReplyData::Jobs { jobs }),
                ),
                Err(err) => Reply::from_error(&err),
            },
        }
    }

    fn status(&self) -> Reply {
        let now = Utc::now();
        let status = DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: self.started_at,
            uptime_s: (now - self.started_at).num_seconds(),
            pipelines: self.scheduler.registry.list(),
        };
        Reply::ok("cyclerd running", Some(ReplyData::Daemon(status)))
    }

    fn setup(
        &mut self,
        devices: Vec<cycler_core::pipeline::Device>,
        templates: Vec<cycler_core::request::PipelineTemplate>,
    ) -> Reply {
        let result = (|| {
            for device in &devices {
                // Fail the whole setup before touching live state.
                self.drivers.get(&device.driver).map_err(|_| {
                    CyclerError::Config(format!(
                        "device '{}' wants unknown driver '{}'",
                        device.name, device.driver
                    ))
                })?;
            }
            let map = config::device_map(&devices)?;
            let pipelines = config::expand_pipelines(&map, &templates)?;
            Ok::<_, CyclerError>(self.scheduler.apply_config(map, pipelines))
        })();
        match result {
            Ok(pipelines) => Reply::ok(
                format!("configuration applied: {} pipeline(s)", pipelines.len()),
                Some(ReplyData::Pipelines { pipelines }),
            ),
            Err(err) => Reply::from_error(&err),
        }
    }

    fn pipeline_op(&mut self, name: &str, op: PipelineOp) -> Reply {
        let result = match op {
            PipelineOp::Load {
                sampleid,
                capacity_mah,
            } => self
                .scheduler
                .registry
                .load(name, &sampleid, capacity_mah)
                .map(|pip| (format!("sample loaded into '{name}'"), pip)),
            PipelineOp::Eject => self
                .scheduler
                .registry
                .eject(name)
                .map(|pip| (format!("pipeline '{name}' ejected"), pip)),
            PipelineOp::Ready { ready } => self
                .scheduler
                .registry
                .mark_ready(name, ready)
                .map(|pip| (format!("pipeline '{name}' ready={ready}"), pip)),
        };
        match result {
            Ok((msg, pipeline)) => Reply::ok(msg, Some(ReplyData::Pipeline(pipeline))),
            Err(err) => Reply::from_error(&err),
        }
    }

    /// Report a job's output state without disturbing the run.
    async fn snapshot(&self, jobid: i64) -> Reply {
        let record = match self.queue.get(jobid) {
            Ok(record) => record,
            Err(err) => return Reply::from_error(&err),
        };
        match self.sink.rows_written(jobid).await {
            Ok(rows_written) => Reply::ok(
                format!("job {jobid}: {rows_written} row(s) on disk"),
                Some(ReplyData::Snapshot(SnapshotInfo {
                    jobid,
                    status: record.status,
                    rows_written,
                    storage_path: self.sink.job_path(jobid),
                })),
            ),
            Err(err) => Reply::from_error(&err),
        }
    }

    /// Stop a running job's executor; used by shutdown and tests.
    pub fn stop_job(&self, jobid: i64, intent: StopIntent) -> CyclerResult<()> {
        self.scheduler.stop_job(jobid, intent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycler_core::payload::Payload;
    use cycler_core::pipeline::Device;
    use cycler_core::request::PipelineTemplate;
    use cycler_driver_mock::MockCycler;

    fn daemon(dir: &std::path::Path) -> Daemon {
        let settings = Settings::defaults_in(dir);
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(MockCycler::new()));
        Daemon::new(&settings, Arc::new(drivers)).expect("daemon")
    }

    fn setup_request() -> Request {
        Request::Setup {
            devices: vec![Device {
                name: "cycler-1".into(),
                driver: "mock".into(),
                address: "sim:cycler-1".into(),
                channels: vec![1, 2],
                libpath: None,
                lockpath: None,
                retries: 1,
                retry_interval_s: 0,
            }],
            pipelines: vec![PipelineTemplate {
                name: "cell-*".into(),
                devices: vec![cycler_core::request::TemplateBinding {
                    name: "cycler-1".into(),
                    tag: None,
                    channel: None,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn setup_expands_and_reports_pipelines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut daemon = daemon(dir.path());
        let reply = daemon.handle_request(setup_request()).await;
        assert!(reply.success, "{}", reply.msg);
        match reply.data {
            Some(ReplyData::Pipelines { pipelines }) => {
                let names: Vec<_> = pipelines.iter().map(|p| p.name.as_str()).collect();
                assert_eq!(names, ["cell-1", "cell-2"]);
            }
            other => panic!("unexpected reply data: {other:?}"),
        }
    }

    #[tokio::test]
    async fn setup_rejects_unknown_driver() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut daemon = daemon(dir.path());
        let reply = daemon
            .handle_request(Request::Setup {
                devices: vec![Device {
                    name: "x".into(),
                    driver: "biologic".into(),
                    address: "usb:0".into(),
                    channels: vec![1],
                    libpath: None,
                    lockpath: None,
                    retries: 1,
                    retry_interval_s: 0,
                }],
                pipelines: vec![],
            })
            .await;
        assert!(!reply.success);
        assert_eq!(reply.error, Some(ErrorKind::Config));
    }

    #[tokio::test]
    async fn unknown_pipeline_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut daemon = daemon(dir.path());
        let reply = daemon
            .handle_request(Request::Pipeline {
                pipeline: "ghost".into(),
                op: PipelineOp::Eject,
            })
            .await;
        assert!(!reply.success);
        assert_eq!(reply.error, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn submit_then_cancel_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut daemon = daemon(dir.path());

        let reply = daemon
            .handle_request(Request::JobSubmit {
                payload: Payload::default(),
                jobname: Some("trial".into()),
            })
            .await;
        let Some(ReplyData::JobId { jobid }) = reply.data else {
            panic!("expected a jobid");
        };

        let reply = daemon.handle_request(Request::JobCancel { jobid }).await;
        assert!(reply.success);

        // Cancel is not idempotent: the job is no longer queued.
        let reply = daemon.handle_request(Request::JobCancel { jobid }).await;
        assert!(!reply.success);
        assert_eq!(reply.error, Some(ErrorKind::Conflict));
    }

    #[tokio::test]
    async fn snapshot_of_unstarted_job_shows_zero_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut daemon = daemon(dir.path());
        let reply = daemon
            .handle_request(Request::JobSubmit {
                payload: Payload::default(),
                jobname: None,
            })
            .await;
        let Some(ReplyData::JobId { jobid }) = reply.data else {
            panic!("expected a jobid");
        };

        let reply = daemon.handle_request(Request::JobSnapshot { jobid }).await;
        match reply.data {
            Some(ReplyData::Snapshot(info)) => {
                assert_eq!(info.rows_written, 0);
                assert_eq!(info.jobid, jobid);
            }
            other => panic!("unexpected reply data: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_reports_version_and_pipelines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut daemon = daemon(dir.path());
        daemon.handle_request(setup_request()).await;
        let reply = daemon.handle_request(Request::Status).await;
        match reply.data {
            Some(ReplyData::Daemon(status)) => {
                assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
                assert_eq!(status.pipelines.len(), 2);
            }
            other => panic!("unexpected reply data: {other:?}"),
        }
    }
}
