//! Redis backend

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{KeyStoreBackend, PipelineOp};
use crate::error::StoreError;

/// URL schemes this backend accepts
pub const STORE_SCHEMES: [&str; 2] = ["redis://", "rediss://"];

/// Check whether a connection target names a Redis store
pub fn is_store_url(target: &str) -> bool {
    STORE_SCHEMES.iter().any(|scheme| target.starts_with(scheme))
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// Backend over a single multiplexed Redis connection
///
/// The connection is owned by this backend alone; `close()` drops it.
pub struct RedisBackend {
    conn: Mutex<Option<MultiplexedConnection>>,
    url: String,
}

impl RedisBackend {
    /// Open a connection, failing fast if the store is unreachable
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StoreError> {
        debug!(url = %settings.url, "RedisBackend::connect: called");
        if !is_store_url(&settings.url) {
            return Err(StoreError::InvalidUrl {
                url: settings.url.clone(),
                reason: "expected redis:// or rediss://".to_string(),
            });
        }

        let client = redis::Client::open(settings.url.as_str()).map_err(|e| StoreError::InvalidUrl {
            url: settings.url.clone(),
            reason: e.to_string(),
        })?;

        let conn = client
            .get_multiplexed_async_connection_with_timeouts(settings.response_timeout, settings.connect_timeout)
            .await?;

        info!(url = %settings.url, "Connected to Redis");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            url: settings.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.conn.lock().await.clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl KeyStoreBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn().await?;
        let value = redis::cmd("GET").arg(key).query_async::<Option<Vec<u8>>>(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("SET").arg(key).arg(value).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let removed = redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn pipeline(&self, ops: &[PipelineOp]) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                PipelineOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value.as_slice()).ignore();
                }
                PipelineOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn).await?;
        debug!(ops = ops.len(), "RedisBackend::pipeline: committed");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let reply = redis::cmd("PING").query_async::<String>(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Command(format!("unexpected PING reply: {}", reply)))
        }
    }

    async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            info!(url = %self.url, "Closed Redis connection");
        }
    }
}
