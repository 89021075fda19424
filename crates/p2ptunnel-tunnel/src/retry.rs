//! Retry policy for opening channels to unreachable peers
//!
//! Only errors of [`ErrorKind::Unreachable`] are retried; the classification
//! comes from the peer network, never from error text.

use p2ptunnel_transport::{ErrorKind, NetworkError, NetworkResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Delay between attempts when a peer cannot be reached
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Fixed-delay retry, unbounded while the peer stays unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn is_retryable(&self, err: &NetworkError) -> bool {
        err.kind() == ErrorKind::Unreachable
    }

    /// Run `op` until it succeeds or fails with a non-retryable error
    pub async fn retry<T, F, Fut>(&self, mut op: F) -> NetworkResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = NetworkResult<T>>,
    {
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.is_retryable(&e) => {
                    debug!(error = %e, attempt, delay = ?self.delay, "Peer unreachable, retrying");
                    sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
