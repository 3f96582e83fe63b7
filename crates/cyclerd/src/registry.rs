//! Authoritative in-memory map of pipelines and their live state.
//!
//! All mutation goes through the daemon loop, which owns the registry
//! exclusively; that single-writer discipline is what makes load/eject/ready
//! linearizable and dispatch atomic. Operator commands may flip `sampleid`
//! and `ready` at any time, but `jobid` is set and cleared only by the
//! scheduler.

use cycler_core::error::{CyclerError, CyclerResult};
use cycler_core::pipeline::Pipeline;
use std::collections::HashMap;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Pipeline>,
}

impl PipelineRegistry {
    pub fn new(pipelines: Vec<Pipeline>) -> Self {
        Self {
            pipelines: pipelines.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> CyclerResult<&Pipeline> {
        self.pipelines
            .get(name)
            .ok_or_else(|| CyclerError::not_found(format!("pipeline '{name}'")))
    }

    /// All pipelines, sorted by name for stable client output.
    pub fn list(&self) -> Vec<Pipeline> {
        let mut all: Vec<_> = self.pipelines.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Load a sample. The pipeline stays not-ready until the operator
    /// asserts readiness separately.
    pub fn load(
        &mut self,
        name: &str,
        sampleid: &str,
        capacity_mah: f64,
    ) -> CyclerResult<Pipeline> {
        let pip = self.get_mut(name)?;
        if let Some(existing) = &pip.sampleid {
            return Err(CyclerError::conflict(format!(
                "pipeline '{name}' is not empty (sample '{existing}' loaded)"
            )));
        }
        pip.sampleid = Some(sampleid.to_string());
        pip.capacity_mah = capacity_mah;
        pip.ready = false;
        info!(pipeline = %name, sampleid = %sampleid, "sample loaded");
        Ok(pip.clone())
    }

    /// Eject whatever is loaded. Succeeds idempotently on an empty
    /// pipeline, fails while a job occupies it.
    pub fn eject(&mut self, name: &str) -> CyclerResult<Pipeline> {
        let pip = self.get_mut(name)?;
        if let Some(jobid) = pip.jobid {
            return Err(CyclerError::conflict(format!(
                "cannot eject pipeline '{name}': job {jobid} is running"
            )));
        }
        if pip.sampleid.take().is_some() {
            info!(pipeline = %name, "sample ejected");
        }
        pip.ready = false;
        pip.capacity_mah = 0.0;
        Ok(pip.clone())
    }

    /// Set or clear the operator-asserted ready flag. Idempotent; fails
    /// while a job occupies the pipeline.
    pub fn mark_ready(&mut self, name: &str, ready: bool) -> CyclerResult<Pipeline> {
        let pip = self.get_mut(name)?;
        if let Some(jobid) = pip.jobid {
            return Err(CyclerError::conflict(format!(
                "cannot change readiness of pipeline '{name}': job {jobid} is running"
            )));
        }
        pip.ready = ready;
        Ok(pip.clone())
    }

    /// Scheduler-only: occupy an eligible pipeline with a job.
    pub fn assign(&mut self, name: &str, jobid: i64) -> CyclerResult<Pipeline> {
        let pip = self.get_mut(name)?;
        if let Some(existing) = pip.jobid {
            return Err(CyclerError::conflict(format!(
                "pipeline '{name}' already occupied by job {existing}"
            )));
        }
        if !pip.is_eligible() {
            return Err(CyclerError::conflict(format!(
                "pipeline '{name}' is not eligible for dispatch"
            )));
        }
        pip.jobid = Some(jobid);
        Ok(pip.clone())
    }

    /// Scheduler-only: release occupancy after job termination. The
    /// pipeline stays ready so it is immediately eligible for the next
    /// job. Releasing a pipeline that vanished in a reload is a no-op.
    pub fn release(&mut self, name: &str, jobid: i64) {
        match self.pipelines.get_mut(name) {
            Some(pip) if pip.jobid == Some(jobid) => {
                pip.jobid = None;
            }
            Some(pip) => {
                warn!(
                    pipeline = %name,
                    jobid,
                    current = ?pip.jobid,
                    "release for a job that does not occupy this pipeline"
                );
            }
            None => {
                warn!(pipeline = %name, jobid, "release for a pipeline no longer configured");
            }
        }
    }

    /// Atomically swap in a reloaded pipeline set.
    ///
    /// Pipelines whose name and bindings are unchanged keep their live
    /// state (sample, readiness, occupancy); everything else is recreated
    /// fresh. A busy pipeline that disappears from configuration is
    /// dropped from the registry, but its job keeps the pipeline name in
    /// its record and remains queryable.
    pub fn reconcile(&mut self, new_pipelines: Vec<Pipeline>) -> Vec<Pipeline> {
        let mut next: HashMap<String, Pipeline> = HashMap::with_capacity(new_pipelines.len());
        for mut pip in new_pipelines {
            if let Some(old) = self.pipelines.get(&pip.name) {
                if old.bindings == pip.bindings {
                    pip.sampleid = old.sampleid.clone();
                    pip.ready = old.ready;
                    pip.jobid = old.jobid;
                    pip.capacity_mah = old.capacity_mah;
                } else {
                    info!(pipeline = %pip.name, "bindings changed on reload, state reset");
                }
            }
            next.insert(pip.name.clone(), pip);
        }
        for (name, old) in &self.pipelines {
            if !next.contains_key(name) {
                if let Some(jobid) = old.jobid {
                    warn!(
                        pipeline = %name,
                        jobid,
                        "busy pipeline removed by reload; its job keeps the stale reference"
                    );
                }
            }
        }
        self.pipelines = next;
        self.list()
    }

    fn get_mut(&mut self, name: &str) -> CyclerResult<&mut Pipeline> {
        self.pipelines
            .get_mut(name)
            .ok_or_else(|| CyclerError::not_found(format!("pipeline '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycler_core::pipeline::Binding;

    fn pipeline(name: &str) -> Pipeline {
        Pipeline::new(
            name,
            vec![Binding {
                device: "cycler-1".into(),
                channel: 1,
                tag: Some("worker".into()),
            }],
        )
    }

    fn registry() -> PipelineRegistry {
        PipelineRegistry::new(vec![pipeline("cell-01"), pipeline("cell-02")])
    }

    #[test]
    fn load_rejects_occupied_pipeline() {
        let mut reg = registry();
        let pip = reg.load("cell-01", "LNO-01", 45.0).expect("first load");
        assert_eq!(pip.sampleid.as_deref(), Some("LNO-01"));
        assert!(!pip.ready);

        let err = reg.load("cell-01", "LNO-02", 0.0).expect_err("second load");
        assert!(matches!(err, CyclerError::Conflict(_)));
    }

    #[test]
    fn unknown_pipeline_is_not_found() {
        let mut reg = registry();
        assert!(matches!(
            reg.load("bogus", "s", 0.0),
            Err(CyclerError::NotFound(_))
        ));
        assert!(matches!(reg.eject("bogus"), Err(CyclerError::NotFound(_))));
        assert!(matches!(
            reg.mark_ready("bogus", true),
            Err(CyclerError::NotFound(_))
        ));
    }

    #[test]
    fn eject_is_idempotent_and_clears_ready() {
        let mut reg = registry();
        reg.load("cell-01", "LNO-01", 0.0).expect("load");
        reg.mark_ready("cell-01", true).expect("ready");

        let pip = reg.eject("cell-01").expect("eject");
        assert_eq!(pip.sampleid, None);
        assert!(!pip.ready);

        // Already empty: still succeeds.
        let pip = reg.eject("cell-01").expect("eject again");
        assert_eq!(pip.sampleid, None);
    }

    #[test]
    fn busy_pipeline_rejects_eject_and_ready_changes() {
        let mut reg = registry();
        reg.load("cell-01", "LNO-01", 0.0).expect("load");
        reg.mark_ready("cell-01", true).expect("ready");
        reg.assign("cell-01", 7).expect("assign");

        assert!(matches!(reg.eject("cell-01"), Err(CyclerError::Conflict(_))));
        assert!(matches!(
            reg.mark_ready("cell-01", false),
            Err(CyclerError::Conflict(_))
        ));
        // State unchanged by the rejected operations.
        let pip = reg.get("cell-01").expect("get");
        assert_eq!(pip.jobid, Some(7));
        assert!(pip.ready);
        assert!(pip.invariant_holds());
    }

    #[test]
    fn assign_requires_eligibility_and_rejects_double_occupancy() {
        let mut reg = registry();
        assert!(reg.assign("cell-01", 1).is_err());

        reg.load("cell-01", "LNO-01", 0.0).expect("load");
        assert!(reg.assign("cell-01", 1).is_err());

        reg.mark_ready("cell-01", true).expect("ready");
        reg.assign("cell-01", 1).expect("assign");
        assert!(matches!(
            reg.assign("cell-01", 2),
            Err(CyclerError::Conflict(_))
        ));
    }

    #[test]
    fn invariant_holds_across_operation_sequences() {
        let mut reg = registry();
        let ops: [&dyn Fn(&mut PipelineRegistry); 6] = [
            &|r| drop(r.load("cell-01", "A", 0.0)),
            &|r| drop(r.mark_ready("cell-01", true)),
            &|r| drop(r.eject("cell-01")),
            &|r| drop(r.mark_ready("cell-01", false)),
            &|r| drop(r.load("cell-01", "B", 1.0)),
            &|r| drop(r.eject("cell-01")),
        ];
        for op in ops {
            op(&mut reg);
            assert!(reg.get("cell-01").expect("get").invariant_holds());
        }
    }

    #[test]
    fn release_only_clears_matching_job() {
        let mut reg = registry();
        reg.load("cell-01", "A", 0.0).expect("load");
        reg.mark_ready("cell-01", true).expect("ready");
        reg.assign("cell-01", 3).expect("assign");

        reg.release("cell-01", 99);
        assert_eq!(reg.get("cell-01").expect("get").jobid, Some(3));

        reg.release("cell-01", 3);
        let pip = reg.get("cell-01").expect("get");
        assert_eq!(pip.jobid, None);
        assert!(pip.ready, "pipeline stays ready after release");
    }

    #[test]
    fn reconcile_preserves_unchanged_and_drops_removed() {
        let mut reg = registry();
        reg.load("cell-01", "A", 10.0).expect("load");
        reg.mark_ready("cell-01", true).expect("ready");
        reg.assign("cell-01", 5).expect("assign");

        // cell-01 unchanged, cell-02 removed, cell-03 added.
        let reloaded = reg.reconcile(vec![pipeline("cell-01"), pipeline("cell-03")]);
        let names: Vec<_> = reloaded.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["cell-01", "cell-03"]);

        let kept = reg.get("cell-01").expect("kept");
        assert_eq!(kept.jobid, Some(5));
        assert_eq!(kept.sampleid.as_deref(), Some("A"));
        assert!(reg.get("cell-02").is_err());
    }

    #[test]
    fn reconcile_resets_state_when_bindings_change() {
        let mut reg = registry();
        reg.load("cell-01", "A", 0.0).expect("load");

        let mut changed = pipeline("cell-01");
        changed.bindings[0].channel = 2;
        reg.reconcile(vec![changed]);

        let pip = reg.get("cell-01").expect("get");
        assert_eq!(pip.sampleid, None);
        assert_eq!(pip.bindings[0].channel, 2);
    }
}
