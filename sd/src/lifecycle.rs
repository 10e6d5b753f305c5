//! Worker lifecycle wiring
//!
//! Decides from worker settings whether persistence is active, and if so
//! connects, merges before the worker reports ready, and hands `save` to the
//! host's exit hooks.
//!
//! Connection failures here are returned to the caller. Once installed, the
//! engine only logs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, info};

use crate::clock::LogicalClock;
use crate::error::{MigrationError, StateDbError};
use crate::keystore::{KeyStoreBackend, RedisSettings, RetryPolicy, is_store_url};
use crate::migration::{MigrationReport, Migrator};
use crate::namespace::{DEFAULT_KEY_PREFIX, WorkerIdentity};
use crate::reconciler::Reconciler;
use crate::revoked::RevocationSet;
use crate::state_store::{StoreSettings, WorkerStateStore};

/// Environment variable that overrides the key prefix
pub const KEY_PREFIX_ENV: &str = "STATEDB_KEY_PREFIX";

/// Key prefix from `STATEDB_KEY_PREFIX`, then `configured`, then the default
pub fn resolve_key_prefix(configured: Option<&str>) -> String {
    if let Ok(value) = std::env::var(KEY_PREFIX_ENV) {
        if !value.is_empty() {
            debug!(prefix = %value, "resolve_key_prefix: from environment");
            return value;
        }
    }
    match configured {
        Some(prefix) if !prefix.is_empty() => prefix.to_string(),
        _ => DEFAULT_KEY_PREFIX.to_string(),
    }
}

/// The slice of worker configuration the adapter reads
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Generic state database target; may be a local path
    pub statedb: Option<String>,
    /// Dedicated store target; wins over `statedb` when set
    pub redis_statedb: Option<String>,
    /// Worker identity, normally the node name
    pub hostname: String,
    /// Key prefix from framework config; env still overrides it
    pub key_prefix: Option<String>,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    /// Legacy local state file to import before the first merge
    pub migrate_statedb: Option<PathBuf>,
}

impl WorkerSettings {
    pub fn new(hostname: impl Into<String>) -> Self {
        let redis = RedisSettings::new("");
        Self {
            statedb: None,
            redis_statedb: None,
            hostname: hostname.into(),
            key_prefix: None,
            retry: RetryPolicy::default(),
            connect_timeout: redis.connect_timeout,
            response_timeout: redis.response_timeout,
            migrate_statedb: None,
        }
    }

    /// The store target, if persistence should be enabled
    ///
    /// `redis_statedb` is picked over `statedb` before the scheme check, so a
    /// non-store override disables the engine even when `statedb` is a store URL.
    pub fn resolve_target(&self) -> Option<&str> {
        let target = self.redis_statedb.as_deref().or(self.statedb.as_deref())?;
        is_store_url(target).then_some(target)
    }

    pub fn is_enabled(&self) -> bool {
        self.resolve_target().is_some()
    }

    /// Connection settings for the resolved target
    pub fn store_settings(&self) -> Option<StoreSettings> {
        let target = self.resolve_target()?;
        Some(StoreSettings {
            redis: RedisSettings {
                url: target.to_string(),
                connect_timeout: self.connect_timeout,
                response_timeout: self.response_timeout,
            },
            key_prefix: resolve_key_prefix(self.key_prefix.as_deref()),
            retry: self.retry,
        })
    }
}

/// A callback run once when the process exits
pub type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Where the host collects exit callbacks
pub trait ShutdownHooks {
    fn register(&mut self, hook: ShutdownHook);
}

/// Plain exit-hook registry; runs hooks last-registered-first
#[derive(Default)]
pub struct ExitHooks {
    hooks: Vec<ShutdownHook>,
}

impl ExitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run and drop every registered hook
    pub async fn run_all(&mut self) {
        debug!(count = self.hooks.len(), "ExitHooks::run_all: called");
        while let Some(hook) = self.hooks.pop() {
            hook().await;
        }
    }
}

impl ShutdownHooks for ExitHooks {
    fn register(&mut self, hook: ShutdownHook) {
        self.hooks.push(hook);
    }
}

/// Enable persistence for a worker if its settings name a store
///
/// Returns `Ok(None)` when disabled. A bad identity or an unreachable store
/// is an error; the caller should treat it as fatal.
pub async fn install<S, H>(
    settings: &WorkerSettings,
    revoked: Arc<Mutex<S>>,
    clock: Option<Arc<dyn LogicalClock>>,
    hooks: &mut H,
) -> Result<Option<Arc<Reconciler<S>>>, StateDbError>
where
    S: RevocationSet + 'static,
    H: ShutdownHooks + ?Sized,
{
    let Some(store_settings) = settings.store_settings() else {
        info!(
            statedb = ?settings.statedb,
            redis_statedb = ?settings.redis_statedb,
            "Store-backed worker state disabled"
        );
        return Ok(None);
    };

    let identity = WorkerIdentity::new(settings.hostname.clone())?;
    let store = WorkerStateStore::connect(&store_settings, identity).await?;
    if let Some(path) = &settings.migrate_statedb {
        import_legacy_state(&store, path).await;
    }
    Ok(Some(install_with_store(store, revoked, clock, hooks).await))
}

/// Import a legacy state file ahead of the first merge
///
/// A missing file is the normal case once a previous start has migrated and
/// renamed it. Other failures are logged and leave the file in place for the
/// next start to retry.
pub async fn import_legacy_state<B: KeyStoreBackend>(store: &WorkerStateStore<B>, path: &Path) -> Option<MigrationReport> {
    match Migrator::new(path, store).run().await {
        Ok(report) => {
            info!(
                path = %path.display(),
                entries = report.entries,
                clock = ?report.clock,
                "Imported legacy state before startup"
            );
            Some(report)
        }
        Err(MigrationError::NotFound(_)) => {
            debug!(path = %path.display(), "import_legacy_state: no legacy file");
            None
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "Legacy state import failed; starting without it");
            None
        }
    }
}

/// Merge now and register `save` for exit, over an already-open store
pub async fn install_with_store<S, B, H>(
    store: WorkerStateStore<B>,
    revoked: Arc<Mutex<S>>,
    clock: Option<Arc<dyn LogicalClock>>,
    hooks: &mut H,
) -> Arc<Reconciler<S, B>>
where
    S: RevocationSet + 'static,
    B: KeyStoreBackend + 'static,
    H: ShutdownHooks + ?Sized,
{
    let reconciler = Arc::new(Reconciler::new(store, revoked, clock));
    let report = reconciler.merge().await;
    if report.degraded {
        info!("Worker starting with local state only");
    }

    let on_exit = Arc::clone(&reconciler);
    hooks.register(Box::new(move || async move { on_exit.save().await }.boxed()));
    reconciler
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LamportClock;
    use crate::codec;
    use crate::keystore::MemoryBackend;
    use crate::revoked::{RevokedTaskSet, now_ms};
    use serial_test::serial;

    fn settings(statedb: Option<&str>, redis_statedb: Option<&str>) -> WorkerSettings {
        let mut settings = WorkerSettings::new("celery@host");
        settings.statedb = statedb.map(String::from);
        settings.redis_statedb = redis_statedb.map(String::from);
        settings
    }

    #[test]
    fn test_local_path_is_disabled() {
        assert!(!settings(Some("/var/run/worker.db"), None).is_enabled());
        assert!(!settings(None, None).is_enabled());
    }

    #[test]
    fn test_store_schemes_enable() {
        assert_eq!(
            settings(Some("redis://localhost:6379/0"), None).resolve_target(),
            Some("redis://localhost:6379/0")
        );
        assert!(settings(Some("rediss://secure:6380/0"), None).is_enabled());
    }

    #[test]
    fn test_override_wins() {
        let s = settings(Some("redis://default:6379/0"), Some("redis://override:6379/1"));
        assert_eq!(s.resolve_target(), Some("redis://override:6379/1"));

        // A non-store override still wins, which leaves the engine off
        let s = settings(Some("redis://default:6379/0"), Some("/tmp/worker.db"));
        assert!(!s.is_enabled());
    }

    #[test]
    #[serial]
    fn test_key_prefix_precedence() {
        unsafe { std::env::remove_var(KEY_PREFIX_ENV) };
        assert_eq!(resolve_key_prefix(None), DEFAULT_KEY_PREFIX);
        assert_eq!(resolve_key_prefix(Some("conf:")), "conf:");

        unsafe { std::env::set_var(KEY_PREFIX_ENV, "env:") };
        assert_eq!(resolve_key_prefix(Some("conf:")), "env:");

        unsafe { std::env::set_var(KEY_PREFIX_ENV, "") };
        assert_eq!(resolve_key_prefix(Some("conf:")), "conf:");

        unsafe { std::env::remove_var(KEY_PREFIX_ENV) };
    }

    #[test]
    #[serial]
    fn test_store_settings_carry_tuning() {
        unsafe { std::env::remove_var(KEY_PREFIX_ENV) };
        let mut s = settings(Some("redis://localhost:6379/0"), None);
        s.key_prefix = Some("app:".to_string());
        s.retry = RetryPolicy::new(5, Duration::from_millis(20));
        s.connect_timeout = Duration::from_millis(250);

        let store = s.store_settings().unwrap();
        assert_eq!(store.redis.url, "redis://localhost:6379/0");
        assert_eq!(store.redis.connect_timeout, Duration::from_millis(250));
        assert_eq!(store.key_prefix, "app:");
        assert_eq!(store.retry.max_retries, 5);
    }

    #[tokio::test]
    async fn test_exit_hooks_run_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = ExitHooks::new();
        for n in 0..3 {
            let order = order.clone();
            hooks.register(Box::new(move || async move { order.lock().unwrap().push(n) }.boxed()));
        }
        assert_eq!(hooks.len(), 3);

        hooks.run_all().await;

        assert!(hooks.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_install_disabled() {
        let revoked = Arc::new(Mutex::new(RevokedTaskSet::default()));
        let mut hooks = ExitHooks::new();

        let installed = install(&settings(Some("/var/run/worker.db"), None), revoked, None, &mut hooks)
            .await
            .unwrap();

        assert!(installed.is_none());
        assert!(hooks.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_install_unreachable_store_fails() {
        let mut s = settings(Some("redis://127.0.0.1:1/0"), None);
        s.connect_timeout = Duration::from_millis(500);
        let revoked = Arc::new(Mutex::new(RevokedTaskSet::default()));
        let mut hooks = ExitHooks::new();

        let result = install(&s, revoked, None, &mut hooks).await;

        assert!(matches!(result, Err(StateDbError::Store(_))));
        assert!(hooks.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_install_rejects_blank_identity() {
        let mut s = settings(Some("redis://127.0.0.1:1/0"), None);
        s.hostname = " ".to_string();
        let revoked = Arc::new(Mutex::new(RevokedTaskSet::default()));

        let result = install(&s, revoked, None, &mut ExitHooks::new()).await;
        assert!(matches!(result, Err(StateDbError::Config(_))));
    }

    fn memory_store(backend: &MemoryBackend) -> WorkerStateStore<MemoryBackend> {
        WorkerStateStore::with_backend(
            backend.clone(),
            WorkerIdentity::new("w1").unwrap(),
            "p:",
            RetryPolicy::none(),
        )
    }

    #[tokio::test]
    async fn test_import_legacy_state_then_merge() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker.db");
        std::fs::write(&path, br#"{"revoked": ["t3", "t4"], "clock": 7}"#).unwrap();
        let backend = MemoryBackend::new();
        let store = memory_store(&backend);

        let report = import_legacy_state(&store, &path).await.unwrap();
        assert_eq!(report.entries, 2);
        assert!(!path.exists());

        let revoked = Arc::new(Mutex::new(RevokedTaskSet::default()));
        let clock = Arc::new(LamportClock::new(0));
        install_with_store(store, revoked.clone(), Some(clock.clone() as Arc<dyn LogicalClock>), &mut ExitHooks::new()).await;

        assert!(revoked.lock().unwrap().contains("t3"));
        assert!(revoked.lock().unwrap().contains("t4"));
        assert_eq!(clock.value(), 8);
    }

    #[tokio::test]
    async fn test_import_legacy_state_tolerates_missing_and_broken_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = MemoryBackend::new();
        let store = memory_store(&backend);

        assert!(import_legacy_state(&store, &dir.path().join("absent.db")).await.is_none());

        let broken = dir.path().join("broken.db");
        std::fs::write(&broken, b"not json").unwrap();
        assert!(import_legacy_state(&store, &broken).await.is_none());
        assert!(broken.exists());
        assert!(backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_install_with_store_merges_and_saves_on_exit() {
        let backend = MemoryBackend::new();
        let mut previous = RevokedTaskSet::default();
        previous.insert_at("t1", now_ms());
        backend.insert("p:w1:revoked", codec::encode(&previous).unwrap());
        backend.insert("p:w1:clock", b"41".to_vec());

        let store = WorkerStateStore::with_backend(
            backend.clone(),
            WorkerIdentity::new("w1").unwrap(),
            "p:",
            RetryPolicy::none(),
        );
        let revoked = Arc::new(Mutex::new(RevokedTaskSet::default()));
        let clock = Arc::new(LamportClock::new(0));
        let mut hooks = ExitHooks::new();

        let reconciler = install_with_store(store, revoked.clone(), Some(clock.clone() as Arc<dyn LogicalClock>), &mut hooks).await;

        // Merged before returning
        assert!(revoked.lock().unwrap().contains("t1"));
        assert_eq!(clock.value(), 42);
        assert_eq!(hooks.len(), 1);

        revoked.lock().unwrap().insert("t2");
        hooks.run_all().await;

        assert!(reconciler.is_saved());
        assert!(backend.is_closed());
        let stored = codec::decode(&backend.value("p:w1:revoked").unwrap()).unwrap();
        assert!(stored.contains("t1") && stored.contains("t2"));
        assert_eq!(backend.value("p:w1:clock"), Some(b"43".to_vec()));
    }
}
