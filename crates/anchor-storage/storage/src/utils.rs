use std::{
    future::Future,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use tracing::debug;

/// Bounded retry schedule with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts made after the first one.
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// A single attempt.
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

/// Runs `operation` until it succeeds, `retryable` rejects the error, or the
/// policy is exhausted. The last error is returned.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    name: &'static str,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && retryable(&err) => {
                attempt += 1;
                debug!(target: "retry", operation = name, attempt, error = %err, "Retrying");
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Races `future` against `duration`.
///
/// When the deadline wins, `future` is dropped before `on_timeout` builds the
/// error, which cancels any request it still had in flight.
pub async fn with_timeout<T, E>(
    duration: Duration,
    future: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_elapsed) => Err(on_timeout()),
    }
}

pub fn unix_timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
