//! Retry orchestration over the classifier and the circuit.
//!
//! [`RetryRunner::run`] is the single wrapper every transport-touching
//! operation goes through: each failure is classified and reported (so
//! observers see transient conditions even when a later attempt succeeds),
//! retryable failures wait out their suggested delay and try again while the
//! budget and the circuit permit, and only the final failure surfaces,
//! tagged with the attempt that produced it. Dropping the returned future
//! cancels the in-flight attempt and any pending delay.

use crate::backoff::Backoff;
use crate::circuit::ErrorMonitor;
use crate::config::RetryConfig;
use crate::error::{classify, ClientError, RawFailure};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;

/// Executes operations with retry, classification, and circuit consultation.
#[derive(Clone)]
pub struct RetryRunner {
    monitor: ErrorMonitor,
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryRunner {
    pub fn new(config: &RetryConfig, monitor: ErrorMonitor) -> Self {
        Self {
            monitor,
            max_retries: config.max_retries,
            backoff: config.backoff(),
            jitter: config.jitter_strategy(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Swap the sleeper; tests use this to skip or record delays.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// The monitor this runner reports into.
    pub fn monitor(&self) -> &ErrorMonitor {
        &self.monitor
    }

    /// Run `op`, retrying retryable failures.
    ///
    /// `op` receives the 1-indexed attempt number. At most
    /// `max_retries + 1` calls are made. A circuit rejection surfaces as
    /// [`ClientError::CircuitOpen`] without touching the operation.
    pub async fn run<T, Fut, Op>(&self, mut op: Op) -> Result<T, ClientError>
    where
        Fut: Future<Output = Result<T, RawFailure>> + Send,
        Op: FnMut(u32) -> Fut + Send,
    {
        let mut attempt: u32 = 1;
        loop {
            if !self.monitor.allow() {
                return Err(self.monitor.rejection());
            }
            match op(attempt).await {
                Ok(value) => {
                    self.monitor.record_success();
                    return Ok(value);
                }
                Err(raw) => {
                    let classified = classify(raw, attempt, &self.backoff, &self.jitter);
                    tracing::debug!(
                        kind = %classified.kind,
                        attempt,
                        retryable = classified.retryable,
                        "request failed"
                    );
                    self.monitor.report(classified.clone());

                    if !classified.retryable || attempt > self.max_retries {
                        return Err(ClientError::Request(classified));
                    }
                    if let Some(delay) = classified.delay {
                        self.sleeper.sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
