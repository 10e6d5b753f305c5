//! In-memory backend
//!
//! Behaves like a single Redis database: one map, atomic pipelines. Clones share
//! the same data and the same connection, so a test can keep a handle for
//! inspection after handing one to a state store. [`MemoryBackend::reconnect`]
//! opens a fresh connection to the same data, the way a restarted worker would.
//! Faults can be injected to exercise retry and degradation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::{KeyStoreBackend, PipelineOp};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Faults {
    /// Remaining calls to fail
    remaining: usize,
    /// Whether injected failures are transient
    transient: bool,
}

#[derive(Debug, Default)]
struct Inner {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    faults: Mutex<Faults>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

/// Shared in-memory key-value backend
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
    closed: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new, open connection over the same data
    pub fn reconnect(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fail the next `count` calls; transient failures look like dropped connections
    pub fn fail_next(&self, count: usize, transient: bool) {
        debug!(count, transient, "MemoryBackend::fail_next: called");
        let mut faults = lock(&self.inner.faults);
        faults.remaining = count;
        faults.transient = transient;
    }

    /// Make every call fail with a connection error until cleared
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of backend calls made so far, failed ones included
    pub fn call_count(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// All keys currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner.data).keys().cloned().collect()
    }

    /// Read a value directly, bypassing faults and the closed flag
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.inner.data).get(key).cloned()
    }

    /// Write a value directly, bypassing faults and the closed flag
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        lock(&self.inner.data).insert(key.into(), value.into());
    }

    fn check(&self) -> Result<(), StoreError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);

        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".to_string()));
        }

        {
            let mut faults = lock(&self.inner.faults);
            if faults.remaining > 0 {
                faults.remaining -= 1;
                return Err(if faults.transient {
                    StoreError::Connection("connection reset by peer".to_string())
                } else {
                    StoreError::Command("ERR injected failure".to_string())
                });
            }
        }

        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(lock(&self.inner.data).get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.inner.data).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(lock(&self.inner.data).remove(key).is_some())
    }

    async fn pipeline(&self, ops: &[PipelineOp]) -> Result<(), StoreError> {
        self.check()?;
        // One guard for the whole batch: readers see all of it or none of it
        let mut data = lock(&self.inner.data);
        for op in ops {
            match op {
                PipelineOp::Set { key, value } => {
                    data.insert(key.clone(), value.clone());
                }
                PipelineOp::Delete { key } => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("MemoryBackend::close: closed");
        }
    }
}
