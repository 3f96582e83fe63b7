//! Devices and pipelines: the schedulable units of the fleet.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One configured hardware unit.
///
/// Immutable once loaded from configuration; the whole device list is
/// replaced wholesale on `setup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    /// Driver identifier, matched against the driver registry.
    pub driver: String,
    /// Network or bus address of the instrument.
    pub address: String,
    /// Ordered channel identifiers this device exposes.
    pub channels: Vec<u32>,
    /// Path to the vendor library, where the driver needs one.
    #[serde(default)]
    pub libpath: Option<PathBuf>,
    /// Lock-file path keying the cross-process mutual-exclusion scope.
    /// Defaults to a path derived from the address when absent.
    #[serde(default)]
    pub lockpath: Option<PathBuf>,
    /// Connect/disconnect retry budget.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Sleep between retry attempts, in seconds.
    #[serde(default = "default_retry_interval_s")]
    pub retry_interval_s: u64,
}

fn default_retries() -> u32 {
    10
}

fn default_retry_interval_s() -> u64 {
    10
}

impl Device {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_s)
    }

    /// The stable identifier keying this device's mutual-exclusion scope.
    pub fn lock_path(&self) -> PathBuf {
        match &self.lockpath {
            Some(p) => p.clone(),
            None => std::env::temp_dir().join(format!(
                "cycler-{}.lock",
                self.address.replace(['/', ':', '\\'], "_")
            )),
        }
    }
}

/// Binding of one device channel into a pipeline, with its tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub device: String,
    pub channel: u32,
    /// Role tag referenced by payload constraints (e.g. "worker").
    #[serde(default)]
    pub tag: Option<String>,
}

/// A named, addressable unit of schedulable capacity.
///
/// Invariant: `jobid.is_some()` implies `ready` and `sampleid.is_some()`.
/// A pipeline with `jobid` set is busy; only the scheduler sets or clears
/// `jobid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub bindings: Vec<Binding>,
    /// Identity of the loaded sample, or `None` when empty.
    pub sampleid: Option<String>,
    /// Operator-asserted flag: the loaded sample is prepared for execution.
    pub ready: bool,
    /// Job currently occupying this pipeline.
    pub jobid: Option<i64>,
    /// Capacity of the loaded cell in mAh, for constraint matching.
    #[serde(default)]
    pub capacity_mah: f64,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, bindings: Vec<Binding>) -> Self {
        Self {
            name: name.into(),
            bindings,
            sampleid: None,
            ready: false,
            jobid: None,
            capacity_mah: 0.0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.jobid.is_some()
    }

    /// Whether this pipeline can accept a queued job at all.
    /// Payload constraints are checked separately against [`Self::tags`].
    pub fn is_eligible(&self) -> bool {
        self.ready && self.jobid.is_none() && self.sampleid.is_some()
    }

    pub fn tags(&self) -> Vec<String> {
        self.bindings.iter().filter_map(|b| b.tag.clone()).collect()
    }

    /// Checks the occupancy invariant. Debug aid for tests; the registry
    /// upholds it structurally.
    pub fn invariant_holds(&self) -> bool {
        self.jobid.is_none() || (self.ready && self.sampleid.is_some())
    }
}
