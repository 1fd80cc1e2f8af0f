//! Bounded retry with exponential backoff for remote store calls
//!
//! With a per-call limit set, each attempt runs on a dedicated blocking pool
//! and an attempt that outlives the limit counts as a transient failure.
//! The stuck call itself is abandoned, not cancelled.

use crate::error::{ExpertError, Result};
use log::warn;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

static IO_POOL: Lazy<std::result::Result<Runtime, String>> = Lazy::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("library-io")
        .build()
        .map_err(|e| e.to_string())
});

fn default_call_timeout() -> Option<u64> {
    Some(60_000)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Limit on a single store call; `None` waits indefinitely
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            call_timeout_ms: default_call_timeout(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Retries without sleeping; for tests and local stores
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            ..Self::default()
        }
    }

    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout_ms = limit.map(|d| d.as_millis() as u64);
        self
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Run `operation`, retrying only transient failures
    pub fn run<T>(&self, op: &str, mut operation: impl FnMut() -> Result<T>) -> Result<T> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation() {
                Ok(v) => return Ok(v),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= max_attempts => {
                    return Err(ExpertError::RetriesExhausted {
                        op: op.to_string(),
                        attempts: attempt,
                        last: err.to_string(),
                    })
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        op, attempt, max_attempts, err, delay
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
    }

    /// `run`, with every attempt bounded by the per-call limit
    pub fn run_bounded<T, F>(&self, op: &str, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let limit = match self.call_timeout() {
            Some(limit) => limit,
            None => return self.run(op, operation),
        };
        let operation = Arc::new(operation);
        self.run(op, || {
            let pool = IO_POOL
                .as_ref()
                .map_err(|e| ExpertError::state(format!("library I/O pool unavailable: {}", e)))?;
            let (tx, rx) = mpsc::sync_channel(1);
            let call = operation.clone();
            pool.spawn_blocking(move || {
                // The receiver is gone once the caller gave up on this attempt
                let _ = tx.send(call());
            });
            match rx.recv_timeout(limit) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => Err(ExpertError::TransientIo(format!(
                    "{} timed out after {:?}",
                    op, limit
                ))),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(ExpertError::TransientIo(format!(
                    "{} stopped without a result",
                    op
                ))),
            }
        })
    }
}
