//! Generic retry-with-backoff helper, grounded on `utils::backoff::retry` as
//! used at `pageserver/src/tenant.rs` (`backoff::retry(op, is_permanent,
//! warn_threshold, max_retries, description, cancel)`), shared by the
//! Remote Client's own retry loop and the Upload/Download Pipeline's task
//! retries (spec §4.2, §4.7).

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Base delay before the first retry. Spec §4.2: "larger (>=5s) for bodies
/// over a size threshold", otherwise shorter.
pub fn base_delay(is_large_body: bool) -> Duration {
    if is_large_body {
        Duration::from_secs(5)
    } else {
        Duration::from_millis(500)
    }
}

/// Exponential backoff delay for the given zero-based attempt number, capped
/// at 60s so a stuck retry loop never waits absurdly long between tries.
pub fn delay_for_attempt(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(8));
    let capped = base.saturating_mul(factor);
    capped.min(Duration::from_secs(60))
}

/// Retries `op` until it succeeds, `is_permanent` says the error cannot be
/// retried, `max_retries` attempts have been made, or `cancel` fires.
///
/// Returns `None` if cancelled before a result was obtained, matching the
/// teacher's `backoff::retry` contract so callers can distinguish
/// cancellation from a surfaced error with `.ok_or_else(...)`.
pub async fn retry<T, E, Fut, Op, Perm>(
    mut op: Op,
    is_permanent: Perm,
    max_retries: u32,
    base: Duration,
    description: &str,
    cancel: &CancellationToken,
) -> Option<Result<T, E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Perm: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let result = op().await;
        match result {
            Ok(value) => return Some(Ok(value)),
            Err(err) => {
                if is_permanent(&err) || attempt >= max_retries {
                    return Some(Err(err));
                }
                let delay = delay_for_attempt(base, attempt);
                warn!(
                    attempt,
                    max_retries, ?delay, description, "retrying after transient failure"
                );
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Option<Result<u32, &str>> = retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| false,
            5,
            Duration::from_millis(1),
            "test-op",
            &cancel,
        )
        .await;
        assert_eq!(result, Some(Ok(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Option<Result<u32, &str>> = retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err("fatal") }
            },
            |_| true,
            5,
            Duration::from_millis(1),
            "test-op",
            &cancel,
        )
        .await;
        assert_eq!(result, Some(Err("fatal")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_last_error() {
        let cancel = CancellationToken::new();
        let result: Option<Result<u32, &str>> = retry(
            || async { Err("still failing") },
            |_| false,
            3,
            Duration::from_millis(1),
            "test-op",
            &cancel,
        )
        .await;
        assert_eq!(result, Some(Err("still failing")));
    }

    #[tokio::test]
    async fn cancellation_returns_none() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<Result<u32, &str>> = retry(
            || async { Err("whatever") },
            |_| false,
            5,
            Duration::from_millis(1),
            "test-op",
            &cancel,
        )
        .await;
        assert_eq!(result, None);
    }
}
