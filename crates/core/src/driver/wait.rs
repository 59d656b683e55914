//! Polling helpers for remote state transitions.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::types::DriverError;

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DriverError::Cancelled),
        result = fut => result,
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), DriverError> {
    cancellable(cancel, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

/// Call `check` every `interval` until it yields a value.
///
/// Fails with `DriverError::Timeout` once `timeout` has elapsed (including
/// time spent inside `check`) and with `DriverError::Cancelled` when the
/// token fires. Errors from `check` abort the wait.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, DriverError>>,
{
    let polling = async {
        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            tokio::time::sleep(interval).await;
        }
    };

    match tokio::time::timeout(timeout, cancellable(cancel, polling)).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout {
            what: what.to_string(),
            after: timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_poll_until_succeeds_after_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = poll_until(
            "counter",
            Duration::from_secs(5),
            Duration::from_millis(1),
            &CancellationToken::new(),
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((n >= 3).then_some(n))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let err = poll_until(
            "storage to become online",
            Duration::from_millis(30),
            Duration::from_millis(5),
            &CancellationToken::new(),
            || async { Ok::<Option<()>, DriverError>(None) },
        )
        .await
        .unwrap_err();
        match err {
            DriverError::Timeout { what, after } => {
                assert_eq!(what, "storage to become online");
                assert_eq!(after, Duration::from_millis(30));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_poll_until_propagates_check_error() {
        let err = poll_until(
            "anything",
            Duration::from_secs(1),
            Duration::from_millis(1),
            &CancellationToken::new(),
            || async { Err::<Option<()>, _>(DriverError::rejected("BAD", "nope")) },
        )
        .await
        .unwrap_err();
        assert_eq!(err.error_code(), Some("BAD"));
    }

    #[tokio::test]
    async fn test_poll_until_observes_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = poll_until(
            "never",
            Duration::from_secs(30),
            Duration::from_millis(5),
            &cancel,
            || async { Ok::<Option<()>, DriverError>(None) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_cancellable_returns_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sleep_cancellable(Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled));
    }
}
