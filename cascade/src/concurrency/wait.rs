//! Polling waits used by administrative sequences and the copy worker.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::bail;
use crate::error::{CascadeResult, ErrorKind};

/// Polls `check` every `interval` until it returns `true` or `timeout` elapses.
///
/// Errors from `check` end the wait immediately.
pub async fn poll_until<F, Fut>(
    description: &'static str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> CascadeResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CascadeResult<bool>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if check().await? {
            return Ok(());
        }

        if Instant::now() >= deadline {
            bail!(
                ErrorKind::Timeout,
                "Timed out waiting for condition",
                format!("{description} did not happen within {timeout:?}")
            );
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_succeeds_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        poll_until("counter reaching 3", Duration::from_millis(10), Duration::from_secs(1), || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let err = poll_until(
            "never",
            Duration::from_millis(10),
            Duration::from_millis(50),
            || async { Ok(false) },
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
