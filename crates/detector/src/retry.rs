use std::future::Future;
use std::time::Duration;

use meridian_core::DetectorError;
use tracing::debug;

pub const RETRY_STEPS: usize = 5;
pub const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Run `op` until it succeeds or fails with something other than a conflict,
/// at most [`RETRY_STEPS`] times. `op` must re-read whatever it writes.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, DetectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DetectorError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < RETRY_STEPS => {
                debug!(attempt, error = %e, "conflict, retrying");
                attempt += 1;
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let res: Result<(), _> = retry_on_conflict(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DetectorError::Store(StoreError::Conflict("x".into())))
        })
        .await;
        assert!(res.unwrap_err().is_conflict());
        assert_eq!(counter.load(Ordering::SeqCst), RETRY_STEPS);
    }

    #[tokio::test]
    async fn other_errors_return_immediately() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let res: Result<(), _> = retry_on_conflict(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DetectorError::Selector("bad".into()))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
