//! Timeout and Cancellation Helpers
//!
//! Wrap async operations so deadline expiry and pipeline cancellation surface
//! as typed errors (`CassandraError::Timeout` / `CassandraError::Cancelled`).
//!
//! ## Usage
//!
//! ```ignore
//! let text = with_timeout(Duration::from_secs(30), provider.generate(&req), "generate").await?;
//! let value = cancellable(&token, expensive(), "mine doc-2").await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::types::{CassandraError, Result};

/// Execute an async operation with a timeout
pub async fn with_timeout<T, F>(timeout: Duration, future: F, operation_name: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(CassandraError::timeout(operation_name, timeout)),
    }
}

/// Execute an async operation until it finishes or the token is cancelled
pub async fn cancellable<T, F>(
    token: &CancellationToken,
    future: F,
    operation_name: &str,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return Err(CassandraError::cancelled(operation_name));
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CassandraError::cancelled(operation_name)),
        result = future => result,
    }
}

/// Sleep for `delay` unless cancelled first; returns false when cancelled
pub async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
