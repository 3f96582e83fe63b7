//! Job-to-pipeline matching and dispatch.
//!
//! The scheduler runs on a bounded tick, not on every event, so hardware
//! polling load stays bounded. Each tick scans ready, unoccupied pipelines
//! and assigns the first eligible queued job in strict submission order: a
//! pipeline never skips an earlier eligible job for a later one. Dispatch
//! pairs the queue transition (`queued → running`, conditional UPDATE) with
//! the registry occupancy inside the single daemon task, so no job is ever
//! claimed by two pipelines and no pipeline ever holds two jobs.

use crate::config::DeviceMap;
use crate::executor::{self, ExecutorHandle, JobOutcome, StopIntent, Target};
use crate::ops::DeviceOps;
use crate::queue::JobQueue;
use crate::registry::PipelineRegistry;
use crate::sink::DataSink;
use chrono::Utc;
use cycler_core::driver::DriverRegistry;
use cycler_core::error::{CyclerError, CyclerResult};
use cycler_core::job::JobRecord;
use cycler_core::pipeline::Pipeline;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct Scheduler {
    pub registry: PipelineRegistry,
    queue: Arc<JobQueue>,
    drivers: Arc<DriverRegistry>,
    devices: DeviceMap,
    sink: Arc<dyn DataSink>,
    poll_interval: Duration,
    running: HashMap<i64, ExecutorHandle>,
    outcome_tx: mpsc::Sender<JobOutcome>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        drivers: Arc<DriverRegistry>,
        sink: Arc<dyn DataSink>,
        poll_interval: Duration,
        outcome_tx: mpsc::Sender<JobOutcome>,
    ) -> Self {
        Self {
            registry: PipelineRegistry::default(),
            queue,
            drivers,
            devices: DeviceMap::new(),
            sink,
            poll_interval,
            running: HashMap::new(),
            outcome_tx,
        }
    }

    /// Swap in a reconciled configuration snapshot.
    pub fn apply_config(
        &mut self,
        devices: DeviceMap,
        pipelines: Vec<Pipeline>,
    ) -> Vec<Pipeline> {
        self.devices = devices;
        let reconciled = self.registry.reconcile(pipelines);

        // Jobs left running by a previous daemon process have no executor;
        // they stay queryable but are not restarted.
        match self.queue.running() {
            Ok(records) => {
                for record in records {
                    if !self.running.contains_key(&record.id) {
                        warn!(
                            jobid = record.id,
                            pipeline = record.pipeline.as_deref().unwrap_or(""),
                            "running job has no executor (previous daemon run?)"
                        );
                    }
                }
            }
            Err(err) => error!(error = %err, "could not inspect running jobs after reload"),
        }
        reconciled
    }

    /// One scheduling pass: dispatch queued jobs to eligible pipelines.
    pub fn tick(&mut self) {
        let queued = match self.queue.queued() {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = %err, "queue scan failed");
                return;
            }
        };
        if queued.is_empty() {
            return;
        }

        let mut claimed: HashSet<i64> = HashSet::new();
        for pipeline in self.registry.list() {
            if !pipeline.is_eligible() {
                continue;
            }
            // Strictly FIFO: first queued job this pipeline can satisfy.
            let candidate = queued.iter().find(|job| {
                !claimed.contains(&job.id)
                    && job.payload.matches(&pipeline.tags(), pipeline.capacity_mah)
            });
            let Some(job) = candidate else { continue };

            match self.dispatch(job.clone(), &pipeline) {
                Ok(()) => {
                    claimed.insert(job.id);
                }
                Err(err) => {
                    error!(jobid = job.id, pipeline = %pipeline.name, error = %err, "dispatch failed");
                }
            }
        }
    }

    /// Atomically pair one job with one pipeline and hand it to a worker.
    fn dispatch(&mut self, job: JobRecord, pipeline: &Pipeline) -> CyclerResult<()> {
        let targets = self.targets_for(pipeline)?;

        // Queue first: the conditional UPDATE is the at-most-once claim.
        self.queue.mark_running(job.id, &pipeline.name, Utc::now())?;
        if let Err(err) = self.registry.assign(&pipeline.name, job.id) {
            // Pairing must not half-apply; give the job back to the queue.
            error!(jobid = job.id, pipeline = %pipeline.name, error = %err, "assign failed after claim");
            if let Err(rollback) = self.queue.finish(
                job.id,
                cycler_core::job::JobStatus::Errored,
                "dispatch failed: pipeline assignment rejected",
            ) {
                error!(jobid = job.id, error = %rollback, "rollback failed");
            }
            return Err(err);
        }

        info!(jobid = job.id, pipeline = %pipeline.name, "job dispatched");
        let handle = executor::spawn(
            job.clone(),
            pipeline.name.clone(),
            targets,
            pipeline.capacity_mah,
            self.sink.clone(),
            self.poll_interval,
            self.outcome_tx.clone(),
        );
        self.running.insert(job.id, handle);
        Ok(())
    }

    fn targets_for(&self, pipeline: &Pipeline) -> CyclerResult<Vec<Target>> {
        pipeline
            .bindings
            .iter()
            .map(|binding| {
                let device = self.devices.get(&binding.device).ok_or_else(|| {
                    CyclerError::Config(format!(
                        "pipeline '{}' references unconfigured device '{}'",
                        pipeline.name, binding.device
                    ))
                })?;
                let driver = self.drivers.get(&device.driver)?;
                Ok(Target {
                    ops: DeviceOps::new(driver, device.clone()),
                    channel: binding.channel,
                })
            })
            .collect()
    }

    /// Record a terminal outcome: queue first, then pipeline occupancy.
    pub fn handle_outcome(&mut self, outcome: JobOutcome) {
        self.running.remove(&outcome.jobid);
        match self
            .queue
            .finish(outcome.jobid, outcome.status, &outcome.reason)
        {
            Ok(record) => {
                info!(
                    jobid = record.id,
                    status = %record.status,
                    pipeline = %outcome.pipeline,
                    "job terminated"
                );
            }
            Err(err) => {
                error!(jobid = outcome.jobid, error = %err, "could not record job outcome");
            }
        }
        self.registry.release(&outcome.pipeline, outcome.jobid);
    }

    /// Ask the executor of a running job to halt.
    pub fn stop_job(&self, jobid: i64, intent: StopIntent) -> CyclerResult<()> {
        let handle = self
            .running
            .get(&jobid)
            .ok_or_else(|| CyclerError::not_found(format!("running job {jobid}")))?;
        handle.request_stop(intent);
        Ok(())
    }

    /// Jobs with a live executor.
    pub fn running_jobs(&self) -> Vec<i64> {
        self.running.keys().copied().collect()
    }

    /// Request a stop on every running executor, for daemon shutdown.
    pub fn stop_all(&self) {
        for (jobid, handle) in &self.running {
            info!(jobid, "requesting stop for shutdown");
            handle.request_stop(StopIntent::Cancel);
        }
    }

    pub fn has_running_jobs(&self) -> bool {
        !self.running.is_empty()
    }
}
