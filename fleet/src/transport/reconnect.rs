//! Exponential backoff for re-dialing peers.

use std::{future::Future, time::Duration};

use tracing::{error, info, warn};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before re-dialing after failed attempt `attempt` (1-based):
    /// `base_delay` doubled once per earlier failure, never above `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let Some(doublings) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        1u32.checked_shl(doublings)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `attempt_fn` until it succeeds or `max_retries` attempts fail.
    ///
    /// Zero retries still makes one attempt.
    pub async fn retry<F, Fut, T>(&self, target: &str, mut attempt_fn: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let attempts = self.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(val) => {
                    if attempt > 1 {
                        info!(peer = target, attempt, "Reconnected");
                    }
                    return Ok(val);
                }
                Err(e) if attempt >= attempts => {
                    error!(peer = target, attempt, error = %e, "Giving up reconnecting");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(peer = target, attempt, error = %e, ?delay, "Connect attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
