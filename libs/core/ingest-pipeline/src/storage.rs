//! Durable object storage
//!
//! [`ObjectStore`] is the raw capability (one `put` call, no retries).
//! [`StorageWriter`] validates the key and wraps the capability in the
//! shared [`RetryPolicy`].

use crate::error::PipelineResult;
use crate::message::StorageKey;
use crate::metrics::PipelineMetrics;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Object storage capability.
///
/// Implementations must be idempotent: putting the same bytes under the
/// same key twice leaves exactly one object with those bytes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key`, overwriting any existing object.
    async fn put(&self, key: &StorageKey, body: Bytes) -> PipelineResult<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Writes message payloads under their deterministic key.
#[derive(Clone)]
pub struct StorageWriter {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    metrics: PipelineMetrics,
}

impl StorageWriter {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy, metrics: PipelineMetrics) -> Self {
        Self {
            store,
            retry,
            metrics,
        }
    }

    /// Store `payload` under `key`.
    ///
    /// Invalid keys fail with a permanent error before any I/O. Transient
    /// backend failures are retried per the policy.
    #[instrument(skip(self, payload), fields(storage_key = %key, backend = self.store.name()))]
    pub async fn write(&self, key: &StorageKey, payload: Bytes) -> PipelineResult<()> {
        key.validate()?;

        self.retry
            .run(
                "storage.put",
                || self.store.put(key, payload.clone()),
                |_, _| self.metrics.retried("storage.put"),
            )
            .await?;

        debug!(bytes = payload.len(), "Payload stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, PipelineError};
    use mockall::predicate::eq;
    use std::time::Duration;

    fn writer(store: MockObjectStore, attempts: u32) -> StorageWriter {
        StorageWriter::new(
            Arc::new(store),
            RetryPolicy::new(attempts, Duration::from_millis(10), Duration::from_millis(50)),
            PipelineMetrics::new("test"),
        )
    }

    fn mock_store() -> MockObjectStore {
        let mut store = MockObjectStore::new();
        store.expect_name().return_const("mock");
        store
    }

    #[tokio::test]
    async fn test_write_puts_payload_under_key() {
        let key = StorageKey::for_message("42");
        let mut store = mock_store();
        store
            .expect_put()
            .with(eq(key.clone()), eq(Bytes::from_static(b"hello")))
            .times(1)
            .returning(|_, _| Ok(()));

        let result = writer(store, 3).write(&key, Bytes::from_static(b"hello")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_key_fails_before_io() {
        let mut store = mock_store();
        store.expect_put().never();

        let err = writer(store, 3)
            .write(&StorageKey::from_raw(""), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried() {
        let mut store = mock_store();
        let mut seq = mockall::Sequence::new();
        store
            .expect_put()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(PipelineError::transient("503 SlowDown")));
        store
            .expect_put()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let result = writer(store, 3)
            .write(&StorageKey::for_message("1"), Bytes::from_static(b"x"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_exhausts_ceiling() {
        let mut store = mock_store();
        store
            .expect_put()
            .times(2)
            .returning(|_, _| Err(PipelineError::transient("timeout")));

        let err = writer(store, 2)
            .write(&StorageKey::for_message("1"), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_permanent_failure_surfaced_immediately() {
        let mut store = mock_store();
        store
            .expect_put()
            .times(1)
            .returning(|_, _| Err(PipelineError::permanent("AccessDenied")));

        let err = writer(store, 5)
            .write(&StorageKey::for_message("1"), Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
