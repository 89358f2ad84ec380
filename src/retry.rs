//! Bounded retry around remote-model calls.
//!
//! Rate limits sleep for the wait the service suggests (or a default) before
//! the next attempt; transient server errors retry immediately; anything else
//! propagates on the spot. Once attempts run out the last error is returned
//! as-is.

use regex::Regex;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ModelError;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait used when a rate-limit reply carries no hint.
    pub rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            rate_limit_wait: Duration::from_secs(10),
        }
    }
}

/// Per-call bookkeeping; dropped when the call returns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RetryState {
    pub attempt: u32,
    pub remaining: u32,
    pub waited: Duration,
}

enum Verdict {
    Retry(Duration),
    Fail,
}

fn retry_hint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)try again in (\d+(?:\.\d+)?)\s*(ms|s|sec|secs|seconds?)\b")
            .expect("valid regex")
    })
}

/// Extracts the suggested wait from messages like
/// `"Please try again in 7s."` or `"try again in 350ms"`.
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let caps = retry_hint_regex().captures(message)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let millis = if unit == "ms" { amount } else { amount * 1000.0 };
    Some(Duration::from_millis(millis.round() as u64))
}

impl RetryPolicy {
    fn verdict(&self, err: &ModelError) -> Verdict {
        match err {
            ModelError::RateLimited {
                message,
                retry_after,
            } => Verdict::Retry(
                parse_retry_hint(message)
                    .or(*retry_after)
                    .unwrap_or(self.rate_limit_wait),
            ),
            ModelError::Server { .. } => Verdict::Retry(Duration::ZERO),
            ModelError::Other { .. } | ModelError::Protocol(_) => Verdict::Fail,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut state = RetryState {
            attempt: 0,
            remaining: self.max_attempts.max(1),
            waited: Duration::ZERO,
        };
        loop {
            state.attempt += 1;
            state.remaining -= 1;
            let err = match call().await {
                Ok(value) => {
                    if state.attempt > 1 {
                        debug!(operation, attempt = state.attempt, waited = ?state.waited, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let wait = match self.verdict(&err) {
                Verdict::Fail => return Err(err),
                Verdict::Retry(wait) => wait,
            };
            match &err {
                ModelError::RateLimited { .. } => {
                    warn!(operation, attempt = state.attempt, wait_secs = wait.as_secs_f64(), error = %err, "rate limit exceeded")
                }
                _ => warn!(operation, attempt = state.attempt, error = %err, "transient server error"),
            }
            if state.remaining == 0 {
                return Err(err);
            }
            if !wait.is_zero() {
                sleep(wait).await;
                state.waited += wait;
            }
        }
    }
}
