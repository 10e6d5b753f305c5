//! Key-value store client
//!
//! A thin layer over a remote key-value connection. Backends implement the raw
//! commands; [`KeyStoreClient`] wraps every command except `ping` in a
//! [`RetryPolicy`].

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;

mod memory;
mod redis_backend;
mod retry;

pub use memory::MemoryBackend;
pub use redis_backend::{RedisBackend, RedisSettings, STORE_SCHEMES, is_store_url};
pub use retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES, RetryPolicy};

/// One write inside an atomic pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl PipelineOp {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } => key,
            Self::Delete { key } => key,
        }
    }
}

/// Raw key-value commands
///
/// Implementations do not retry; that is the client's job.
#[async_trait]
pub trait KeyStoreBackend: Send + Sync {
    /// GET; `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// SET
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// DEL; returns whether the key existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Apply all ops as one atomic unit (MULTI/EXEC)
    async fn pipeline(&self, ops: &[PipelineOp]) -> Result<(), StoreError>;

    /// PING
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release the connection. Must be idempotent.
    async fn close(&self);
}

/// Retrying client over a backend
pub struct KeyStoreClient<B> {
    backend: B,
    retry: RetryPolicy,
}

impl<B: KeyStoreBackend> KeyStoreClient<B> {
    pub fn new(backend: B, retry: RetryPolicy) -> Self {
        debug!(?retry, "KeyStoreClient::new: called");
        Self { backend, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.retry.run("get", || self.backend.get(key)).await
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.retry.run("set", || self.backend.set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.retry.run("delete", || self.backend.delete(key)).await
    }

    pub async fn pipeline(&self, ops: &[PipelineOp]) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        self.retry.run("pipeline", || self.backend.pipeline(ops)).await
    }

    /// Single attempt, never retried
    pub async fn ping(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "KeyStoreClient::ping: store unreachable");
                false
            }
        }
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}
