//! Per-worker state store
//!
//! Maps one worker identity to its own key namespace and exposes blob-level
//! access to the persisted revoked set and clock. Callers never see raw keys.
//!
//! ```text
//! {prefix}{worker}:revoked  -> zlib(JSON snapshot)
//! {prefix}{worker}:clock    -> integer
//! ```
//!
//! One store instance per namespace. Two stores on the same namespace in one
//! process is a caller error; nothing here guards against it.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::error::{StateDbError, StoreError};
use crate::keystore::{KeyStoreBackend, KeyStoreClient, PipelineOp, RedisBackend, RedisSettings, RetryPolicy};
use crate::namespace::{DEFAULT_KEY_PREFIX, KeyNamespace, StateKey, WorkerIdentity};

/// Everything needed to open a store connection for one worker
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub redis: RedisSettings,
    pub key_prefix: String,
    pub retry: RetryPolicy,
}

impl StoreSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            redis: RedisSettings::new(url),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Isolated view of the store for one worker
pub struct WorkerStateStore<B = RedisBackend> {
    client: KeyStoreClient<B>,
    namespace: KeyNamespace,
    closed: AtomicBool,
}

impl WorkerStateStore<RedisBackend> {
    /// Connect to Redis; fails if the store can't be reached
    pub async fn connect(settings: &StoreSettings, identity: WorkerIdentity) -> Result<Self, StateDbError> {
        let backend = RedisBackend::connect(&settings.redis).await?;
        Ok(Self::with_backend(backend, identity, &settings.key_prefix, settings.retry))
    }
}

impl<B: KeyStoreBackend> WorkerStateStore<B> {
    pub fn with_backend(backend: B, identity: WorkerIdentity, key_prefix: &str, retry: RetryPolicy) -> Self {
        let namespace = KeyNamespace::new(key_prefix, identity);
        info!(
            worker = %namespace.identity(),
            prefix = namespace.prefix(),
            "Initialized worker state store"
        );
        Self {
            client: KeyStoreClient::new(backend, retry),
            namespace,
            closed: AtomicBool::new(false),
        }
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn identity(&self) -> &WorkerIdentity {
        self.namespace.identity()
    }

    /// Full key for one of this worker's entries
    ///
    /// For log context only; all reads and writes go through the methods below.
    pub fn key_for(&self, key: StateKey) -> String {
        self.namespace.key(key)
    }

    pub async fn get_revoked_blob(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let blob = self.client.get(&self.namespace.key(StateKey::Revoked)).await?;
        debug!(bytes = blob.as_ref().map(|b| b.len()), "WorkerStateStore::get_revoked_blob: done");
        Ok(blob)
    }

    /// Write the revoked blob and, if given, the clock in one atomic batch
    pub async fn set_blobs(&self, revoked: &[u8], clock: Option<u64>) -> Result<(), StoreError> {
        let mut ops = vec![PipelineOp::set(self.namespace.key(StateKey::Revoked), revoked)];
        if let Some(clock) = clock {
            ops.push(PipelineOp::set(self.namespace.key(StateKey::Clock), clock.to_string()));
        }
        self.client.pipeline(&ops).await?;
        debug!(bytes = revoked.len(), ?clock, "WorkerStateStore::set_blobs: written");
        Ok(())
    }

    /// The stored clock, `None` when it was never written
    pub async fn get_clock(&self) -> Result<Option<u64>, StoreError> {
        let key = self.namespace.key(StateKey::Clock);
        let Some(raw) = self.client.get(&key).await? else {
            return Ok(None);
        };

        let parsed = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| StoreError::InvalidValue {
                key,
                reason: format!("expected a non-negative integer ({} bytes)", raw.len()),
            })?;
        Ok(Some(parsed))
    }

    pub async fn set_clock(&self, value: u64) -> Result<(), StoreError> {
        self.client
            .set(&self.namespace.key(StateKey::Clock), value.to_string().as_bytes())
            .await?;
        debug!(value, "WorkerStateStore::set_clock: written");
        Ok(())
    }

    /// Remove everything this worker has persisted
    pub async fn clear(&self) -> Result<(), StoreError> {
        let ops: Vec<_> = StateKey::ALL
            .iter()
            .map(|key| PipelineOp::delete(self.namespace.key(*key)))
            .collect();
        self.client.pipeline(&ops).await?;
        info!(worker = %self.identity(), "Cleared persisted worker state");
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        self.client.ping().await
    }

    /// Release the connection; later calls do nothing
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("WorkerStateStore::close: already closed");
            return;
        }
        self.client.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryBackend;
    use std::time::Duration;

    fn store(backend: &MemoryBackend, worker: &str) -> WorkerStateStore<MemoryBackend> {
        WorkerStateStore::with_backend(
            backend.clone(),
            WorkerIdentity::new(worker).unwrap(),
            "test:",
            RetryPolicy::new(2, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_absent_keys() {
        let backend = MemoryBackend::new();
        let store = store(&backend, "w1");

        assert_eq!(store.get_revoked_blob().await.unwrap(), None);
        assert_eq!(store.get_clock().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_blobs_writes_both_keys() {
        let backend = MemoryBackend::new();
        let store = store(&backend, "w1");

        store.set_blobs(b"blob", Some(11)).await.unwrap();

        assert_eq!(store.get_revoked_blob().await.unwrap(), Some(b"blob".to_vec()));
        assert_eq!(store.get_clock().await.unwrap(), Some(11));
        assert_eq!(backend.keys(), vec!["test:w1:clock".to_string(), "test:w1:revoked".to_string()]);
    }

    #[tokio::test]
    async fn test_set_blobs_without_clock_leaves_clock() {
        let backend = MemoryBackend::new();
        let store = store(&backend, "w1");
        store.set_clock(5).await.unwrap();

        store.set_blobs(b"blob", None).await.unwrap();
        assert_eq!(store.get_clock().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_failed_set_blobs_keeps_old_pair() {
        let backend = MemoryBackend::new();
        let store = store(&backend, "w1");
        store.set_blobs(b"old", Some(1)).await.unwrap();

        // One initial attempt plus two retries
        backend.fail_next(3, true);
        assert!(store.set_blobs(b"new", Some(2)).await.is_err());

        assert_eq!(store.get_revoked_blob().await.unwrap(), Some(b"old".to_vec()));
        assert_eq!(store.get_clock().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_clock_stored_as_integer_text() {
        let backend = MemoryBackend::new();
        let store = store(&backend, "w1");
        store.set_clock(100).await.unwrap();

        assert_eq!(backend.value("test:w1:clock"), Some(b"100".to_vec()));
    }

    #[tokio::test]
    async fn test_invalid_clock_value() {
        let backend = MemoryBackend::new();
        backend.insert("test:w1:clock", b"not-a-number".to_vec());
        let store = store(&backend, "w1");

        let err = store.get_clock().await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn test_workers_are_isolated() {
        let backend = MemoryBackend::new();
        let a = store(&backend, "worker-a");
        let b = store(&backend, "worker-b");

        a.set_blobs(b"a-blob", Some(1)).await.unwrap();
        assert_eq!(b.get_revoked_blob().await.unwrap(), None);
        assert_eq!(b.get_clock().await.unwrap(), None);

        b.set_blobs(b"b-blob", Some(2)).await.unwrap();
        b.clear().await.unwrap();
        assert_eq!(a.get_revoked_blob().await.unwrap(), Some(b"a-blob".to_vec()));
        assert_eq!(a.get_clock().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_clear() {
        let backend = MemoryBackend::new();
        let store = store(&backend, "w1");
        store.set_blobs(b"blob", Some(3)).await.unwrap();

        store.clear().await.unwrap();
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let backend = MemoryBackend::new();
        let store = store(&backend, "w1");

        store.close().await;
        store.close().await;
        assert!(store.is_closed());
        assert!(backend.is_closed());
        assert!(matches!(store.get_clock().await, Err(StoreError::Closed)));
    }

    #[test]
    fn test_store_settings_defaults() {
        let settings = StoreSettings::new("redis://localhost:6379/0");
        assert_eq!(settings.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(settings.retry, RetryPolicy::default());
    }
}
