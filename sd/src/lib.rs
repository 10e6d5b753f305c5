//! StateDb - store-backed worker state
//!
//! Keeps a task-queue worker's revoked-task set and Lamport clock in Redis so
//! they survive restarts without a local state file.
//!
//! # Architecture
//!
//! ```text
//! host worker ──► lifecycle::install ──► Reconciler ──► WorkerStateStore ──► KeyStoreClient ──► Redis
//!                    (startup/exit)      merge/sync       per-worker keys       retry/backoff
//!                                            │
//!                                          codec (zlib + JSON)
//! ```
//!
//! Keys, one pair per worker:
//!
//! ```text
//! {prefix}{worker}:revoked   compressed revoked set
//! {prefix}{worker}:clock     integer
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::{Arc, Mutex};
//! use statedb::{LamportClock, LogicalClock, RevokedTaskSet};
//! use statedb::lifecycle::{ExitHooks, WorkerSettings, install};
//!
//! let mut settings = WorkerSettings::new("celery@web-1");
//! settings.redis_statedb = Some("redis://localhost:6379/0".to_string());
//!
//! let revoked = Arc::new(Mutex::new(RevokedTaskSet::default()));
//! let mut hooks = ExitHooks::new();
//! let clock: Arc<dyn LogicalClock> = Arc::new(LamportClock::default());
//! install(&settings, revoked.clone(), Some(clock), &mut hooks).await?;
//! // ... run the worker ...
//! hooks.run_all().await;
//! ```

pub mod cli;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod keystore;
pub mod lifecycle;
pub mod migration;
pub mod namespace;
pub mod reconciler;
pub mod revoked;
pub mod state_store;

pub use clock::{LamportClock, LogicalClock};
pub use error::{ConfigError, DecodeError, MigrationError, StateDbError, StoreError};
pub use keystore::{KeyStoreBackend, KeyStoreClient, MemoryBackend, RedisBackend, RetryPolicy};
pub use migration::{MigrationReport, Migrator};
pub use namespace::{DEFAULT_KEY_PREFIX, KeyNamespace, StateKey, WorkerIdentity};
pub use reconciler::{MergeReport, Reconciler};
pub use revoked::{RevocationSet, RevokedTaskSet, Timestamp};
pub use state_store::{StoreSettings, WorkerStateStore};
