//! Bounded retry policy for container-runtime calls.

use std::future::Future;
use std::time::Duration;

use log::debug;

use crate::errors::BrokerError;

pub const RETRY_BASE: Duration = Duration::from_secs(1);
pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff for the given 1-based attempt number: base, 2x base, 4x base, ...
pub fn exponential_backoff(base: Duration, attempt: u32) -> Duration {
    let mut backoff = base;
    for _ in 1..attempt {
        backoff *= 2;
    }
    backoff
}

/// Run `operation` up to [`MAX_ATTEMPTS`] times, sleeping the exponential
/// backoff between attempts. Returns the last error when every attempt fails.
pub async fn with_retries<T, F, Fut>(mut operation: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                debug!("attempt {} failed, retrying: {}", attempt, err);
            }
        }
        tokio::time::sleep(exponential_backoff(RETRY_BASE, attempt)).await;
        attempt += 1;
    }
}
