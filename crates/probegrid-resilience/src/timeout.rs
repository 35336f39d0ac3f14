//! Deadline wrapper for async operations.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// The deadline elapsed before the operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out after {}ms", .0.as_millis())]
pub struct TimeoutExceeded(pub Duration);

/// Race `op` against a deadline.
///
/// On expiry the operation future is dropped, not cancelled cooperatively:
/// anything it owned (e.g. a pool lease) is released through its `Drop`.
pub async fn with_timeout<F, T>(duration: Duration, op: F) -> Result<T, TimeoutExceeded>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, op)
        .await
        .map_err(|_| TimeoutExceeded(duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn completes_within_deadline() {
        let r = with_timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(r, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_and_reports_duration() {
        let r = with_timeout(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            7
        })
        .await;
        assert_eq!(r, Err(TimeoutExceeded(Duration::from_millis(100))));
        assert_eq!(
            r.unwrap_err().to_string(),
            "operation timed out after 100ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_operation_is_dropped() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());
        let _ = with_timeout(Duration::from_millis(10), async move {
            let _held = guard;
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .await;
        assert!(dropped.load(Ordering::SeqCst));
    }
}
