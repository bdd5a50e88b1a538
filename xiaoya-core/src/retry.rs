use std::future::Future;
use std::time::Duration;

use crate::error::{Failure, Op, RemoteError};

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const TRANSIENT_DELAY: Duration = Duration::from_secs(10);
pub const FAILURE_DELAY: Duration = Duration::from_secs(3);

/// Fixed-delay retry shared by every remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub transient_delay: Duration,
    pub failure_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            transient_delay: TRANSIENT_DELAY,
            failure_delay: FAILURE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget without sleeping between attempts.
    pub fn immediate() -> Self {
        Self {
            transient_delay: Duration::ZERO,
            failure_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn delay_for(&self, failure: &Failure) -> Duration {
        if failure.is_transient() {
            self.transient_delay
        } else {
            self.failure_delay
        }
    }

    pub async fn run<T, F, Fut>(&self, op: Op, path: &str, mut attempt_fn: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    if attempt >= attempts {
                        return Err(RemoteError::failed(op, path, failure));
                    }
                    let delay = self.delay_for(&failure);
                    tracing::warn!(
                        %op,
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "remote call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
