// synckairos: Exponential backoff retry helper, shared by the audit queue
// worker loop (spec §4.2: 5 attempts, 2s doubling to 32s) and documented
// for client-side switch-retry (spec §4.3: 3 attempts, 50/100/200ms).

use tokio::time::{sleep, Duration};

use crate::error::SyncKairosError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 2_000,
            max_delay_ms: 32_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// The 50/100/200ms, 3-attempt profile spec §4.3 prescribes for a
    /// client retrying `ConcurrentModification` on the switch-cycle hot
    /// path. Exposed so callers (or integration tests simulating a
    /// client) don't have to hand-roll the sequence.
    pub fn client_switch_retry() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            max_delay_ms: 200,
            multiplier: 2.0,
        }
    }
}

pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `f` until it succeeds, a non-retryable error is returned, or
    /// attempts are exhausted. `f` is re-invoked from scratch on each
    /// attempt — callers must not assume partial progress survives a
    /// retry.
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T, SyncKairosError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SyncKairosError>>,
    {
        let mut delay_ms = self.config.initial_delay_ms;
        let mut last_error = None;

        for attempt in 0..self.config.max_attempts {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.retryable() {
                        return Err(e);
                    }
                    last_error = Some(e);
                    if attempt + 1 >= self.config.max_attempts {
                        break;
                    }
                    sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = ((delay_ms as f64) * self.config.multiplier) as u64;
                    delay_ms = delay_ms.min(self.config.max_delay_ms);
                }
            }
        }

        Err(last_error.unwrap_or(SyncKairosError::Internal(
            "retry loop exited without an error".to_string(),
        )))
    }
}
