// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Util function to retry futures with exponential backoff.

use std::time::Duration;

use futures::Future;
use serde::{Deserialize, Serialize};

use crate::config::ReadableDuration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Sleep before the first retry.
    pub min_period: ReadableDuration,
    /// Upper bound for the doubling sleep.
    pub max_period: ReadableDuration,
    /// Number of retries after the initial attempt.
    pub max_retries: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_period: ReadableDuration::millis(100),
            max_period: ReadableDuration::secs(10),
            max_retries: 10,
        }
    }
}

impl BackoffConfig {
    fn period_for_attempt(&self, attempt: usize) -> Duration {
        let min = self.min_period.as_millis().max(1);
        let max = self.max_period.as_millis().max(min);
        let period = min.saturating_mul(1u64.checked_shl(attempt as u32).unwrap_or(u64::MAX));
        Duration::from_millis(period.min(max))
    }
}

/// Run `f` until it succeeds or `config.max_retries` retries are exhausted,
/// sleeping an exponentially growing period between attempts. The last error
/// is returned verbatim.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &BackoffConfig, f: F) -> Fut::Output
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    for attempt in 0..config.max_retries {
        let result = f().await;
        if result.is_ok() {
            return result;
        }
        tokio::time::sleep(config.period_for_attempt(attempt)).await;
    }

    f().await
}
