//! Store-level retry policy
//!
//! Transient store errors (I/O, busy) are retried with a fixed backoff
//! ladder before surfacing as fatal; the engine then refuses to admit new
//! work and raises a circuit event for the store dependency.

use std::time::Duration;

use super::store::StoreError;

/// Retry a store operation on transient errors
///
/// Attempts the call once plus up to three retries at 100 ms, 400 ms, and
/// 1.6 s. Non-transient errors surface immediately; exhaustion surfaces the
/// last error, which callers treat as a fatal store failure.
pub async fn with_store_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    const DELAYS: [Duration; 3] = [
        Duration::from_millis(100),
        Duration::from_millis(400),
        Duration::from_millis(1600),
    ];

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < DELAYS.len() => {
                tracing::warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    "transient store error, retrying: {err}"
                );
                tokio::time::sleep(DELAYS[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tradeloop_contracts::TaskId;

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = with_store_retry("test", move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Database("busy".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_mask_non_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let id = TaskId::generate();

        let result: Result<(), _> = with_store_retry("test", move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::TaskNotFound(id))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::TaskNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<(), _> = with_store_retry("test", move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Database("disk gone".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Database(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
