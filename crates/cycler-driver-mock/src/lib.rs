//! Mock battery-cycler driver.
//!
//! Simulates an instrument family well enough to exercise the daemon end to
//! end: scripted connect failures, channels that report `Running` for a
//! configurable number of status polls after start, and synthetic
//! measurement rows. Attempt counters are exposed so tests can assert the
//! retry discipline precisely.

use async_trait::async_trait;
use cycler_core::driver::{
    ChannelInfo, ChannelState, CyclerDriver, DataBatch, DeviceInfo, NativeTechnique, Session,
};
use cycler_core::error::{CyclerError, CyclerResult};
use cycler_core::payload::Payload;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Configuration for the mock instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct MockCyclerConfig {
    /// Connect attempts that fail before one succeeds. `u32::MAX` means
    /// every attempt fails.
    #[serde(default)]
    pub connect_failures: u32,

    /// Disconnect attempts that fail before one succeeds.
    #[serde(default)]
    pub disconnect_failures: u32,

    /// Status polls a started channel reports `Running` before switching
    /// to `Stopped`.
    #[serde(default = "default_polls")]
    pub polls_until_stop: u32,

    /// Synthetic rows produced per data pull while running.
    #[serde(default = "default_rows")]
    pub rows_per_poll: u32,
}

fn default_polls() -> u32 {
    3
}

fn default_rows() -> u32 {
    4
}

impl Default for MockCyclerConfig {
    fn default() -> Self {
        Self {
            connect_failures: 0,
            disconnect_failures: 0,
            polls_until_stop: default_polls(),
            rows_per_poll: default_rows(),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelSim {
    running: bool,
    polls_since_start: u32,
    loaded: Vec<String>,
    chain_closed: bool,
    rows_emitted: u64,
    /// When set, reported verbatim as an unrecognized hardware state.
    forced_state: Option<String>,
}

/// Simulated multi-channel battery cycler.
pub struct MockCycler {
    config: MockCyclerConfig,
    next_session: AtomicU64,
    connect_attempts: AtomicU32,
    disconnect_attempts: AtomicU32,
    connect_failures_left: AtomicU32,
    disconnect_failures_left: AtomicU32,
    sessions: Mutex<HashMap<u64, String>>,
    channels: Mutex<HashMap<(String, u32), ChannelSim>>,
}

impl MockCycler {
    pub fn new() -> Self {
        Self::with_config(MockCyclerConfig::default())
    }

    pub fn with_config(config: MockCyclerConfig) -> Self {
        Self {
            connect_failures_left: AtomicU32::new(config.connect_failures),
            disconnect_failures_left: AtomicU32::new(config.disconnect_failures),
            config,
            next_session: AtomicU64::new(1),
            connect_attempts: AtomicU32::new(0),
            disconnect_attempts: AtomicU32::new(0),
            sessions: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Total connect attempts observed, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnect_attempts(&self) -> u32 {
        self.disconnect_attempts.load(Ordering::SeqCst)
    }

    /// Make the next status query of a channel report a state the daemon
    /// does not recognize.
    pub fn force_state(&self, address: &str, channel: u32, state: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry((address.to_string(), channel))
            .or_default()
            .forced_state = Some(state.to_string());
    }

    /// Techniques loaded on a channel, in load order.
    pub fn loaded_techniques(&self, address: &str, channel: u32) -> Vec<String> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(&(address.to_string(), channel))
            .map(|c| c.loaded.clone())
            .unwrap_or_default()
    }

    fn session_address(&self, session: Session) -> CyclerResult<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(&session.0)
            .cloned()
            .ok_or_else(|| CyclerError::Driver(format!("unknown session {}", session.0)))
    }
}

impl Default for MockCycler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CyclerDriver for MockCycler {
    fn driver_type(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self, address: &str) -> CyclerResult<(Session, DeviceInfo)> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.connect_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            if left != u32::MAX {
                self.connect_failures_left.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(CyclerError::Driver(format!(
                "simulated connect failure to '{address}'"
            )));
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, address.to_string());
        debug!(address = %address, session = id, "mock connect");
        Ok((
            Session(id),
            DeviceInfo {
                model: "MOCK-8".into(),
                channel_count: 8,
                firmware: Some("0.2.0".into()),
            },
        ))
    }

    async fn disconnect(&self, session: Session) -> CyclerResult<()> {
        self.disconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.disconnect_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            if left != u32::MAX {
                self.disconnect_failures_left.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(CyclerError::Driver("simulated disconnect failure".into()));
        }
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.0);
        Ok(())
    }

    async fn channel_state(&self, session: Session, channel: u32) -> CyclerResult<ChannelInfo> {
        let address = self.session_address(session)?;
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sim = channels.entry((address, channel)).or_default();

        if let Some(state) = sim.forced_state.take() {
            return Ok(ChannelInfo {
                state: ChannelState::Other(state),
                metadata: HashMap::new(),
            });
        }

        let state = if sim.running {
            sim.polls_since_start += 1;
            if sim.polls_since_start >= self.config.polls_until_stop {
                sim.running = false;
                ChannelState::Stopped
            } else {
                ChannelState::Running
            }
        } else {
            ChannelState::Stopped
        };

        let mut metadata = HashMap::new();
        metadata.insert("board".to_string(), serde_json::json!(channel));
        Ok(ChannelInfo { state, metadata })
    }

    async fn read_data(&self, session: Session, channel: u32) -> CyclerResult<DataBatch> {
        let address = self.session_address(session)?;
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sim = channels.entry((address, channel)).or_default();

        let count = if sim.running || sim.polls_since_start > 0 {
            self.config.rows_per_poll
        } else {
            0
        };
        let rows = (0..count)
            .map(|i| {
                let n = sim.rows_emitted + u64::from(i);
                serde_json::json!({
                    "index": n,
                    "time_s": n as f64 * 0.1,
                    "voltage_v": 3.7 + (n as f64 * 0.001),
                    "current_ma": 45.0,
                })
            })
            .collect::<Vec<_>>();
        sim.rows_emitted += u64::from(count);
        Ok(DataBatch { rows })
    }

    async fn load_technique(
        &self,
        session: Session,
        channel: u32,
        technique: &NativeTechnique,
        first: bool,
        last: bool,
    ) -> CyclerResult<()> {
        let address = self.session_address(session)?;
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sim = channels.entry((address, channel)).or_default();
        if first {
            sim.loaded.clear();
            sim.chain_closed = false;
        }
        if sim.chain_closed {
            return Err(CyclerError::Driver(
                "technique loaded after chain was closed".into(),
            ));
        }
        sim.loaded.push(technique.name.clone());
        if last {
            sim.chain_closed = true;
        }
        Ok(())
    }

    async fn start_channel(&self, session: Session, channel: u32) -> CyclerResult<()> {
        let address = self.session_address(session)?;
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sim = channels.entry((address, channel)).or_default();
        if sim.loaded.is_empty() {
            return Err(CyclerError::Driver("no techniques loaded".into()));
        }
        sim.running = true;
        sim.polls_since_start = 0;
        sim.rows_emitted = 0;
        Ok(())
    }

    async fn stop_channel(&self, session: Session, channel: u32) -> CyclerResult<()> {
        let address = self.session_address(session)?;
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sim = channels.entry((address, channel)).or_default();
        sim.running = false;
        Ok(())
    }

    fn translate(
        &self,
        payload: &Payload,
        capacity_mah: f64,
    ) -> CyclerResult<Vec<NativeTechnique>> {
        payload
            .techniques
            .iter()
            .map(|tech| {
                let mut params = tech.parameters.clone();
                // C-rates become absolute currents using the cell capacity.
                if let Some(rate) = params.get("rate_c").and_then(|v| v.as_f64()) {
                    if capacity_mah <= 0.0 {
                        return Err(CyclerError::Driver(format!(
                            "technique '{}' uses a C-rate but the sample has no capacity",
                            tech.name
                        )));
                    }
                    params.remove("rate_c");
                    params.insert("current_ma".to_string(), serde_json::json!(rate * capacity_mah));
                }
                Ok(NativeTechnique {
                    name: tech.name.clone(),
                    parameters: serde_json::to_value(params)
                        .map_err(|e| CyclerError::Driver(e.to_string()))?,
                })
            })
            .collect()
    }
}
