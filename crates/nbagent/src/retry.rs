//! Bounded retry for operations that can lose their backend connection.
//!
//! One helper, used by every networked-mode operation. The predicate decides
//! which errors count as transient; everything else propagates on the first
//! attempt.

use std::future::Future;
use std::time::Duration;

use log::{error, warn};

use crate::error::ToolError;

/// Default attempt budget for document/session operations.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Run `op` up to `max_attempts` times, sleeping with a linearly increasing
/// backoff between attempts. Only errors for which `is_transient` returns true
/// are retried.
pub async fn with_retries<T, F, Fut>(
    op_name: &str,
    max_attempts: usize,
    is_transient: fn(&ToolError) -> bool,
    mut op: F,
) -> Result<T, ToolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ToolError>>,
{
    let max_attempts = max_attempts.max(1);
    for attempt in 0..max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt + 1 < max_attempts => {
                warn!(
                    "[retry] {op_name}: connection lost, retrying... (attempt {}/{max_attempts})",
                    attempt + 1
                );
                tokio::time::sleep(Duration::from_secs(1 + attempt as u64)).await;
            }
            Err(err) => {
                if is_transient(&err) {
                    error!("[retry] {op_name}: failed after {max_attempts} attempts: {err}");
                }
                return Err(err);
            }
        }
    }
    unreachable!("retry loop returns on last attempt")
}

/// Shorthand with the standard transience predicate.
pub async fn with_connection_retry<T, F, Fut>(
    op_name: &str,
    max_attempts: usize,
    op: F,
) -> Result<T, ToolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ToolError>>,
{
    with_retries(op_name, max_attempts, ToolError::is_transient, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = AtomicUsize::new(0);
        let result = with_connection_retry("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ToolError::BackendUnreachable("connection closed".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_the_budget() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_connection_retry("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ToolError::BackendUnreachable("connection closed".into())) }
        })
        .await;
        assert!(matches!(result, Err(ToolError::BackendUnreachable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_propagate_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_connection_retry("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ToolError::IndexOutOfRange {
                    index: 9,
                    cell_count: 1,
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ToolError::IndexOutOfRange { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
