//! Command channel between clients and the daemon loop.
//!
//! Requests travel over a bounded mpsc channel and each carries a oneshot
//! for its single reply. The daemon loop pulls envelopes one at a time, so
//! command handling is serialized by construction: a reply always reflects
//! a state no concurrent command is mutating. The wire encoding (if any) is
//! the caller's concern; in-process clients just clone the `CommandClient`.

use cycler_core::error::{CyclerError, CyclerResult};
use cycler_core::request::{Reply, Request};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A request paired with the slot its reply goes into.
pub struct Envelope {
    pub request: Request,
    pub reply_tx: oneshot::Sender<Reply>,
}

/// Cloneable handle for submitting commands to a running daemon.
#[derive(Clone)]
pub struct CommandClient {
    tx: mpsc::Sender<Envelope>,
    timeout: Duration,
}

impl CommandClient {
    pub fn with_timeout(tx: mpsc::Sender<Envelope>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    /// Send one request and wait for its reply.
    ///
    /// A timeout means the outcome is unknown, not that the command failed:
    /// the daemon may still apply it after the client gives up.
    pub async fn call(&self, request: Request) -> CyclerResult<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply_tx })
            .await
            .map_err(|_| CyclerError::Internal("daemon command channel closed".into()))?;
        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CyclerError::Internal(
                "daemon dropped the reply channel".into(),
            )),
            Err(_) => Err(CyclerError::Internal(format!(
                "no reply within {:?}; command outcome unknown",
                self.timeout
            ))),
        }
    }
}

/// Create the command channel. The daemon owns the receiver.
pub fn channel(capacity: usize, timeout: Duration) -> (CommandClient, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandClient::with_timeout(tx, timeout), rx)
}
