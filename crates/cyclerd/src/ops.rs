//! Driver operation layer: connect-with-retry, operate, disconnect.
//!
//! Every hardware operation is a full connect→operate→disconnect sequence
//! under the device's cross-process lock, because the vendor APIs are not
//! reentrant and workers for other channels of the same controller may run
//! in other processes. Connect and disconnect retries are transparent:
//! callers see only final success or a terminal `Connection` error, never
//! partial state. Disconnect is cleanup, not correctness — its failure is
//! logged and swallowed.

use chrono::{DateTime, Utc};
use cycler_core::devlock::DeviceLock;
use cycler_core::driver::{ChannelState, CyclerDriver, DataBatch, DeviceInfo, Session};
use cycler_core::error::{CyclerError, CyclerResult};
use cycler_core::payload::Payload;
use cycler_core::pipeline::Device;
use cycler_core::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot returned by a status query.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub timestamp: DateTime<Utc>,
    pub ready: bool,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Rows pulled by a data query.
#[derive(Debug, Clone)]
pub struct DataReport {
    pub timestamp: DateTime<Utc>,
    pub nrows: usize,
    pub batch: DataBatch,
}

/// One device bound to its driver, retry budget and lock scope.
#[derive(Clone)]
pub struct DeviceOps {
    driver: Arc<dyn CyclerDriver>,
    device: Device,
    policy: RetryPolicy,
    lock: DeviceLock,
}

impl DeviceOps {
    pub fn new(driver: Arc<dyn CyclerDriver>, device: Device) -> Self {
        let policy = RetryPolicy::new(device.retries, device.retry_interval());
        let lock = DeviceLock::new(device.lock_path());
        Self {
            driver,
            device,
            policy,
            lock,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Query one channel: ready, not ready, or a protocol error when the
    /// hardware reports a state the daemon does not understand. Unknown
    /// states are never treated as ready.
    pub async fn status(&self, channel: u32) -> CyclerResult<StatusReport> {
        let _guard = self.lock.acquire().await?;
        let (session, device_info) = self.connect_with_retry().await?;

        let result = self.driver.channel_state(session, channel).await;
        self.disconnect_best_effort(session).await;

        let info = result?;
        let ready = match info.state {
            ChannelState::Stopped => true,
            ChannelState::Running => false,
            ChannelState::Other(state) => {
                return Err(CyclerError::Protocol {
                    address: self.device.address.clone(),
                    message: format!("channel {channel} state '{state}' not understood"),
                });
            }
        };
        let mut metadata = info.metadata;
        metadata.insert(
            "device_model".to_string(),
            serde_json::json!(device_info.model),
        );
        metadata.insert(
            "device_channels".to_string(),
            serde_json::json!(device_info.channel_count),
        );
        Ok(StatusReport {
            timestamp: Utc::now(),
            ready,
            metadata,
        })
    }

    /// Pull buffered rows. Safe to call repeatedly against a running job.
    pub async fn data(&self, channel: u32) -> CyclerResult<DataReport> {
        let _guard = self.lock.acquire().await?;
        let (session, _) = self.connect_with_retry().await?;

        let result = self.driver.read_data(session, channel).await;
        self.disconnect_best_effort(session).await;

        let batch = result?;
        debug!(
            device = %self.device.name,
            channel,
            nrows = batch.len(),
            "data pulled"
        );
        Ok(DataReport {
            timestamp: Utc::now(),
            nrows: batch.len(),
            batch,
        })
    }

    /// Translate the payload, load techniques in order (first and last
    /// marked explicitly), start the channel, and return the start time.
    pub async fn start(
        &self,
        channel: u32,
        payload: &Payload,
        capacity_mah: f64,
    ) -> CyclerResult<DateTime<Utc>> {
        let techniques = self.driver.translate(payload, capacity_mah)?;
        if techniques.is_empty() {
            return Err(CyclerError::Driver("payload contains no techniques".into()));
        }

        let _guard = self.lock.acquire().await?;
        let (session, _) = self.connect_with_retry().await?;

        let result = async {
            let count = techniques.len();
            for (i, technique) in techniques.iter().enumerate() {
                info!(
                    device = %self.device.name,
                    channel,
                    technique = %technique.name,
                    position = i + 1,
                    count,
                    "loading technique"
                );
                self.driver
                    .load_technique(session, channel, technique, i == 0, i + 1 == count)
                    .await?;
            }
            self.driver.start_channel(session, channel).await
        }
        .await;
        self.disconnect_best_effort(session).await;
        result?;

        let started_at = Utc::now();
        info!(device = %self.device.name, channel, %started_at, "run started");
        Ok(started_at)
    }

    /// Halt whatever the channel runs. Disconnect is attempted even when
    /// the stop call fails so the lock scope is never leaked; the stop
    /// timestamp is taken only after the stop call returns.
    pub async fn stop(&self, channel: u32) -> CyclerResult<DateTime<Utc>> {
        let _guard = self.lock.acquire().await?;
        let (session, _) = self.connect_with_retry().await?;

        let result = self.driver.stop_channel(session, channel).await;
        self.disconnect_best_effort(session).await;
        result?;

        let stopped_at = Utc::now();
        info!(device = %self.device.name, channel, %stopped_at, "run stopped");
        Ok(stopped_at)
    }

    async fn connect_with_retry(&self) -> CyclerResult<(Session, DeviceInfo)> {
        self.policy
            .run(&self.device.address, "connect", || {
                self.driver.connect(&self.device.address)
            })
            .await
    }

    async fn disconnect_best_effort(&self, session: Session) {
        let outcome = self
            .policy
            .run(&self.device.address, "disconnect", || {
                self.driver.disconnect(session)
            })
            .await;
        if let Err(err) = outcome {
            warn!(
                device = %self.device.name,
                error = %err,
                "disconnect failed; continuing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cycler_core::payload::Technique;
    use cycler_driver_mock::{MockCycler, MockCyclerConfig};
    use std::path::Path;
    use std::time::Duration;

    fn device(dir: &Path, retries: u32) -> Device {
        Device {
            name: "cycler-1".into(),
            driver: "mock".into(),
            address: "sim:cycler-1".into(),
            channels: vec![1, 2],
            libpath: None,
            lockpath: Some(dir.join("cycler-1.lock")),
            retries,
            retry_interval_s: 0,
        }
    }

    fn payload() -> Payload {
        Payload {
            techniques: vec![
                Technique {
                    name: "ocv".into(),
                    parameters: HashMap::new(),
                },
                Technique {
                    name: "cc".into(),
                    parameters: HashMap::new(),
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_retry_succeeds_after_transient_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::with_config(MockCyclerConfig {
            connect_failures: 2,
            ..Default::default()
        }));
        let ops = DeviceOps::new(mock.clone(), device(dir.path(), 3));

        let report = ops.status(1).await.expect("status after retries");
        assert!(report.ready);
        assert_eq!(mock.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn connect_retry_exhausts_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::with_config(MockCyclerConfig {
            connect_failures: u32::MAX,
            ..Default::default()
        }));
        let ops = DeviceOps::new(mock.clone(), device(dir.path(), 3));

        let err = ops.status(1).await.expect_err("budget exhausted");
        assert_eq!(mock.connect_attempts(), 3);
        assert!(matches!(err, CyclerError::Connection { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn unknown_channel_state_is_a_protocol_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::new());
        mock.force_state("sim:cycler-1", 1, "PAUSE");
        let ops = DeviceOps::new(mock, device(dir.path(), 1));

        let err = ops.status(1).await.expect_err("protocol error");
        match err {
            CyclerError::Protocol { message, .. } => assert!(message.contains("PAUSE")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn start_loads_techniques_in_order_and_marks_ends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::new());
        let ops = DeviceOps::new(mock.clone(), device(dir.path(), 1));

        ops.start(1, &payload(), 0.0).await.expect("start");
        assert_eq!(mock.loaded_techniques("sim:cycler-1", 1), ["ocv", "cc"]);

        let report = ops.status(1).await.expect("status");
        assert!(!report.ready, "channel must be running after start");
    }

    #[tokio::test]
    async fn disconnect_failure_does_not_fail_the_operation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::with_config(MockCyclerConfig {
            disconnect_failures: u32::MAX,
            ..Default::default()
        }));
        let ops = DeviceOps::new(mock, device(dir.path(), 2));

        let report = ops.status(1).await.expect("status despite disconnect failure");
        assert!(report.ready);
    }

    #[tokio::test]
    async fn stop_halts_a_running_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::with_config(MockCyclerConfig {
            polls_until_stop: 100,
            ..Default::default()
        }));
        let ops = DeviceOps::new(mock, device(dir.path(), 1));

        ops.start(1, &payload(), 0.0).await.expect("start");
        ops.stop(1).await.expect("stop");
        let report = ops.status(1).await.expect("status");
        assert!(report.ready, "channel stopped");
    }

    #[tokio::test]
    async fn device_lock_serializes_operations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mock = Arc::new(MockCycler::new());
        let ops = DeviceOps::new(mock, device(dir.path(), 1));

        // Hold the lock externally; the status call must wait for it.
        let lock = DeviceLock::new(dir.path().join("cycler-1.lock"));
        let guard = lock.acquire().await.expect("external lock");
        let ops2 = ops.clone();
        let handle = tokio::spawn(async move { ops2.status(1).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "status blocked on the device lock");
        drop(guard);
        let report = handle.await.expect("join").expect("status");
        assert!(report.ready);
    }
}
