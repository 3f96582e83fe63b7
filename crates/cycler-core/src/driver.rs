//! The instrument driver contract.
//!
//! Every instrument family implements [`CyclerDriver`] once; the daemon
//! selects the implementation by the `driver` field of the device
//! configuration through a [`DriverRegistry`]. New families are added by
//! implementing the trait, not by branching on type.
//!
//! Trait methods are single-attempt primitives. The daemon's operation
//! layer wraps them in the bounded retry policy and the cross-process
//! device lock; drivers themselves stay oblivious to both.

use crate::error::{CyclerError, CyclerResult};
use crate::payload::Payload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque handle to an open hardware session.
///
/// Returned by [`CyclerDriver::connect`] and threaded through every
/// operation until [`CyclerDriver::disconnect`]. The value is only
/// meaningful to the driver that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session(pub u64);

/// Identity information reported by the instrument at connect time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub model: String,
    pub channel_count: u32,
    #[serde(default)]
    pub firmware: Option<String>,
}

/// Raw channel state as reported by the hardware.
///
/// The daemon maps `Stopped` to ready and `Running` to not-ready; anything
/// else is a protocol error and must never be silently treated as ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Stopped,
    Running,
    /// A state the driver recognized on the wire but the daemon does not
    /// know how to schedule around.
    Other(String),
}

/// Channel status snapshot: raw state plus driver-specific metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub state: ChannelState,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One buffered slice of measurement rows pulled from the instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataBatch {
    /// Rows acquired since the previous pull; pulling must not disturb a
    /// running technique.
    pub rows: Vec<serde_json::Value>,
}

impl DataBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A technique translated into the instrument's native parameter format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeTechnique {
    pub name: String,
    pub parameters: serde_json::Value,
}

/// Contract each instrument backend implements.
///
/// Implementations must be `Send + Sync`: one driver instance serves every
/// channel of every device of its family, concurrently. Serialization of
/// access to the (usually non-reentrant) vendor API is the daemon's job,
/// via the per-device lock, not the driver's.
#[async_trait]
pub trait CyclerDriver: Send + Sync {
    /// Driver identifier matched against the device configuration.
    fn driver_type(&self) -> &'static str;

    /// Single connection attempt; the retry budget lives above this call.
    async fn connect(&self, address: &str) -> CyclerResult<(Session, DeviceInfo)>;

    /// Single disconnection attempt.
    async fn disconnect(&self, session: Session) -> CyclerResult<()>;

    /// Query the raw state of one channel.
    async fn channel_state(&self, session: Session, channel: u32) -> CyclerResult<ChannelInfo>;

    /// Pull buffered measurement rows since the last pull.
    async fn read_data(&self, session: Session, channel: u32) -> CyclerResult<DataBatch>;

    /// Load one technique onto a channel. Instruments may require the first
    /// and last techniques of a chain to be marked explicitly.
    async fn load_technique(
        &self,
        session: Session,
        channel: u32,
        technique: &NativeTechnique,
        first: bool,
        last: bool,
    ) -> CyclerResult<()>;

    /// Start executing the loaded technique chain.
    async fn start_channel(&self, session: Session, channel: u32) -> CyclerResult<()>;

    /// Halt whatever the channel is running.
    async fn stop_channel(&self, session: Session, channel: u32) -> CyclerResult<()>;

    /// Translate an abstract payload into native techniques, resolving
    /// capacity-relative current/voltage values with `capacity_mah`.
    fn translate(&self, payload: &Payload, capacity_mah: f64) -> CyclerResult<Vec<NativeTechnique>>;
}

impl std::fmt::Debug for dyn CyclerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclerDriver")
            .field("driver_type", &self.driver_type())
            .finish()
    }
}

/// Maps driver identifiers to implementations.
///
/// Populated once at startup at the composition root; lookups after that
/// are read-only.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn CyclerDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn CyclerDriver>) {
        self.drivers.insert(driver.driver_type().to_string(), driver);
    }

    pub fn get(&self, driver_type: &str) -> CyclerResult<Arc<dyn CyclerDriver>> {
        self.drivers
            .get(driver_type)
            .cloned()
            .ok_or_else(|| CyclerError::not_found(format!("driver '{driver_type}'")))
    }

    pub fn driver_types(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_unknown_driver_fails() {
        let registry = DriverRegistry::new();
        let err = registry.get("biologic").expect_err("must be unknown");
        assert!(err.to_string().contains("driver 'biologic'"));
    }

    #[test]
    fn channel_state_serde_labels() {
        let json = serde_json::to_string(&ChannelState::Stopped).expect("serialize");
        assert_eq!(json, "\"stopped\"");
    }
}
