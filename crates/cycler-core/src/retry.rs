//! Bounded retry policy for driver connect/disconnect calls.
//!
//! The policy makes exactly `max_attempts` attempts with a fixed sleep
//! between them and returns the final typed result; callers never observe
//! partial state from intermediate failures.

use crate::error::{CyclerError, CyclerResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Fixed-interval retry budget for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Run `op` until it succeeds or the budget is exhausted.
    ///
    /// On exhaustion the last failure is wrapped into
    /// [`CyclerError::Connection`] carrying the attempt count, so the
    /// caller sees only final success or a terminal connection error.
    pub async fn run<T, F, Fut>(&self, address: &str, what: &str, mut op: F) -> CyclerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CyclerResult<T>>,
    {
        let mut last_message = String::new();
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(
                        address = %address,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "{what} attempt failed"
                    );
                    last_message = err.to_string();
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.interval).await;
                    }
                }
            }
        }
        Err(CyclerError::Connection {
            address: address.to_string(),
            attempts: self.max_attempts,
            message: last_message,
        })
    }
}
