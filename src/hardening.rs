use crate::types::{ColloquyError, ObservedError, Result};
use std::future::Future;
use std::time::Duration;

/// Decides whether a failed attempt is worth repeating.
pub type RetryPredicate = fn(&ObservedError) -> bool;

pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    retry_on: RetryPredicate,
}

impl RetryPolicy {
    /// Fixed delay between attempts; `max_attempts` counts the first try.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            retry_on: is_transient,
        }
    }

    pub fn retry_on(mut self, predicate: RetryPredicate) -> Self {
        self.retry_on = predicate;
        self
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && (self.retry_on)(&e) => {
                    tracing::warn!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                        attempts,
                        self.max_attempts,
                        e,
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Default predicate: connection trouble, 5xx and 429.
pub fn is_transient(err: &ObservedError) -> bool {
    match &err.inner {
        ColloquyError::Network(_) | ColloquyError::Io(_) => true,
        ColloquyError::Upstream(status, _) => {
            status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
        }
        _ => false,
    }
}

/// Only "not found yet" is worth waiting for.
pub fn is_not_found(err: &ObservedError) -> bool {
    matches!(&err.inner, ColloquyError::Upstream(status, _) if *status == reqwest::StatusCode::NOT_FOUND)
}
