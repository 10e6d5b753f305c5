//! Reconciliation engine
//!
//! Moves the host's revoked set and logical clock between memory and the
//! per-worker store. `merge` runs once before the worker accepts tasks;
//! `sync` runs at shutdown and optionally on a timer; `save` is the
//! exit-hook entry point.
//!
//! None of the three return errors. Store and decode failures are logged at
//! error level and the worker carries on with whatever it has in memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::LogicalClock;
use crate::codec;
use crate::error::StoreError;
use crate::keystore::{KeyStoreBackend, RedisBackend};
use crate::namespace::StateKey;
use crate::revoked::{RevocationSet, now_ms};
use crate::state_store::WorkerStateStore;

/// What a merge did, for the caller's startup log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Ids that came from the store and were not known locally
    pub restored: usize,
    /// Entries dropped by the post-merge purge
    pub purged: usize,
    /// Clock value after `adjust`, when a clock is attached
    pub clock: Option<u64>,
    /// The remote blob existed but could not be decoded
    pub discarded_blob: bool,
    /// The store could not be reached; nothing remote was applied
    pub degraded: bool,
}

/// Binds a host revoked set and clock to one worker's persisted state
///
/// The host keeps its own handle to `revoked` and keeps using it while the
/// reconciler runs. Running two reconcilers against the same namespace is a
/// caller error.
pub struct Reconciler<S, B = RedisBackend> {
    store: WorkerStateStore<B>,
    revoked: Arc<Mutex<S>>,
    clock: Option<Arc<dyn LogicalClock>>,
    saved: AtomicBool,
}

impl<S, B> Reconciler<S, B>
where
    S: RevocationSet,
    B: KeyStoreBackend,
{
    pub fn new(store: WorkerStateStore<B>, revoked: Arc<Mutex<S>>, clock: Option<Arc<dyn LogicalClock>>) -> Self {
        debug!(worker = %store.identity(), has_clock = clock.is_some(), "Reconciler::new: called");
        Self {
            store,
            revoked,
            clock,
            saved: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &WorkerStateStore<B> {
        &self.store
    }

    pub fn revoked(&self) -> &Arc<Mutex<S>> {
        &self.revoked
    }

    pub fn clock(&self) -> Option<&Arc<dyn LogicalClock>> {
        self.clock.as_ref()
    }

    /// True once `save` has run
    pub fn is_saved(&self) -> bool {
        self.saved.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, S> {
        self.revoked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pull persisted state into memory
    ///
    /// The adjusted clock is written back right away, so a crash before the
    /// first sync does not lose the advance.
    pub async fn merge(&self) -> MergeReport {
        debug!("Reconciler::merge: called");
        let mut report = MergeReport::default();

        let blob = match self.store.get_revoked_blob().await {
            Ok(blob) => blob,
            Err(e) => {
                error!(worker = %self.store.identity(), error = %e, "Failed to read persisted revokes; starting without them");
                report.degraded = true;
                return report;
            }
        };

        let remote = match blob {
            Some(bytes) => match codec::decode(&bytes) {
                Ok(set) => Some(set),
                Err(e) => {
                    error!(
                        key = %self.store.key_for(StateKey::Revoked),
                        bytes = bytes.len(),
                        error = %e,
                        "Discarding unreadable revoked state"
                    );
                    report.discarded_blob = true;
                    None
                }
            },
            None => {
                debug!("Reconciler::merge: no persisted revokes");
                None
            }
        };

        {
            let mut local = self.lock();
            if let Some(remote) = &remote {
                report.restored = local.union(remote);
            }
            report.purged = local.purge_at(now_ms());
        }

        if let Some(clock) = &self.clock {
            let remote_clock = match self.store.get_clock().await {
                Ok(value) => value.unwrap_or(0),
                Err(e @ StoreError::InvalidValue { .. }) => {
                    warn!(error = %e, "Ignoring unreadable persisted clock");
                    0
                }
                Err(e) => {
                    error!(worker = %self.store.identity(), error = %e, "Failed to read persisted clock");
                    report.degraded = true;
                    return report;
                }
            };

            let adjusted = clock.adjust(remote_clock);
            report.clock = Some(adjusted);
            if let Err(e) = self.store.set_clock(adjusted).await {
                error!(clock = adjusted, error = %e, "Failed to persist adjusted clock");
                report.degraded = true;
            }
        }

        info!(
            worker = %self.store.identity(),
            restored = report.restored,
            purged = report.purged,
            clock = ?report.clock,
            "Restored worker state"
        );
        report
    }

    /// Push in-memory state to the store; returns whether the write landed
    ///
    /// An empty set is still written, so stale remote entries get replaced.
    pub async fn sync(&self) -> bool {
        debug!("Reconciler::sync: called");

        let snapshot = {
            let mut local = self.lock();
            let purged = local.purge_at(now_ms());
            if purged > 0 {
                debug!(purged, "Reconciler::sync: purged expired revokes");
            }
            local.snapshot()
        };

        let blob = match codec::encode(&snapshot) {
            Ok(blob) => blob,
            Err(e) => {
                error!(entries = snapshot.len(), error = %e, "Failed to encode revoked set");
                return false;
            }
        };

        let clock = self.clock.as_ref().map(|clock| clock.forward());

        match self.store.set_blobs(&blob, clock).await {
            Ok(()) => {
                info!(
                    worker = %self.store.identity(),
                    entries = snapshot.len(),
                    bytes = blob.len(),
                    ?clock,
                    "Synced worker state"
                );
                true
            }
            Err(e) => {
                error!(worker = %self.store.identity(), error = %e, "Failed to sync worker state");
                false
            }
        }
    }

    /// Final sync, then release the connection; only the first call does anything
    pub async fn save(&self) {
        if self.saved.swap(true, Ordering::SeqCst) {
            debug!("Reconciler::save: already saved");
            return;
        }
        debug!("Reconciler::save: called");

        if !self.sync().await {
            warn!(worker = %self.store.identity(), "Final sync failed; closing anyway");
        }
        self.store.close().await;
    }
}

impl<S, B> Reconciler<S, B>
where
    S: RevocationSet + 'static,
    B: KeyStoreBackend + 'static,
{
    /// Sync every `interval` until `shutdown` flips to true or `save` has run
    ///
    /// The first sync happens one interval after the call, not immediately.
    /// A zero interval starts nothing and returns `None`.
    pub fn spawn_periodic_sync(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            warn!("Periodic sync interval is zero; periodic sync disabled");
            return None;
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            debug!(interval = ?interval, "spawn_periodic_sync: started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if this.is_saved() {
                            break;
                        }
                        this.sync().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("spawn_periodic_sync: shutdown signal received");
                            break;
                        }
                    }
                }
            }
            debug!("spawn_periodic_sync: stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LamportClock;
    use crate::keystore::{MemoryBackend, RetryPolicy};
    use crate::namespace::WorkerIdentity;
    use crate::revoked::RevokedTaskSet;

    const REVOKED_KEY: &str = "test:w1:revoked";
    const CLOCK_KEY: &str = "test:w1:clock";

    struct Fixture {
        backend: MemoryBackend,
        revoked: Arc<Mutex<RevokedTaskSet>>,
        clock: Arc<LamportClock>,
        reconciler: Reconciler<RevokedTaskSet, MemoryBackend>,
    }

    fn fixture(initial_clock: Option<u64>) -> Fixture {
        let backend = MemoryBackend::new();
        let store = WorkerStateStore::with_backend(
            backend.clone(),
            WorkerIdentity::new("w1").unwrap(),
            "test:",
            RetryPolicy::new(1, Duration::from_millis(1)),
        );
        let revoked = Arc::new(Mutex::new(RevokedTaskSet::default()));
        let clock = Arc::new(LamportClock::new(initial_clock.unwrap_or(0)));
        let attached: Option<Arc<dyn LogicalClock>> = initial_clock.map(|_| clock.clone() as Arc<dyn LogicalClock>);
        let reconciler = Reconciler::new(store, revoked.clone(), attached);
        Fixture {
            backend,
            revoked,
            clock,
            reconciler,
        }
    }

    fn ids(set: &RevokedTaskSet) -> Vec<String> {
        let mut ids: Vec<String> = set.iter().map(|(id, _)| id.to_string()).collect();
        ids.sort();
        ids
    }

    fn remote_set(fx: &Fixture) -> RevokedTaskSet {
        codec::decode(&fx.backend.value(REVOKED_KEY).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_merge_empty_store() {
        let fx = fixture(None);

        let report = fx.reconciler.merge().await;

        assert_eq!(report, MergeReport::default());
        assert!(fx.revoked.lock().unwrap().is_empty());
        assert!(fx.backend.keys().is_empty());
    }

    #[tokio::test]
    async fn test_merge_restores_revokes_and_adjusts_clock() {
        let fx = fixture(Some(5));
        let mut remote = RevokedTaskSet::default();
        let now = now_ms();
        remote.insert_at("t1", now);
        remote.insert_at("t2", now);
        fx.backend.insert(REVOKED_KEY, codec::encode(&remote).unwrap());
        fx.backend.insert(CLOCK_KEY, b"100".to_vec());

        let report = fx.reconciler.merge().await;

        assert_eq!(report.restored, 2);
        assert_eq!(report.clock, Some(101));
        assert!(!report.degraded);
        assert_eq!(ids(&fx.revoked.lock().unwrap()), vec!["t1", "t2"]);
        assert_eq!(fx.clock.value(), 101);
        // Adjusted value is already in the store
        assert_eq!(fx.backend.value(CLOCK_KEY), Some(b"101".to_vec()));
    }

    #[tokio::test]
    async fn test_merge_absent_clock_counts_as_zero() {
        let fx = fixture(Some(5));

        let report = fx.reconciler.merge().await;

        assert_eq!(report.clock, Some(6));
        assert_eq!(fx.backend.value(CLOCK_KEY), Some(b"6".to_vec()));
    }

    #[tokio::test]
    async fn test_merge_unreadable_clock_counts_as_zero() {
        let fx = fixture(Some(5));
        fx.backend.insert(CLOCK_KEY, b"garbage".to_vec());

        let report = fx.reconciler.merge().await;

        assert_eq!(report.clock, Some(6));
        assert!(!report.degraded);
    }

    #[tokio::test]
    async fn test_merge_twice_is_idempotent_for_the_set() {
        let fx = fixture(Some(0));
        let mut remote = RevokedTaskSet::default();
        remote.insert_at("t1", now_ms());
        fx.backend.insert(REVOKED_KEY, codec::encode(&remote).unwrap());
        fx.backend.insert(CLOCK_KEY, b"10".to_vec());

        fx.reconciler.merge().await;
        let once = fx.revoked.lock().unwrap().clone();
        let second = fx.reconciler.merge().await;

        assert_eq!(*fx.revoked.lock().unwrap(), once);
        assert_eq!(second.restored, 0);
        // max(11, 11) + 1
        assert_eq!(fx.clock.value(), 12);
    }

    #[tokio::test]
    async fn test_merge_purges_expired_remote_entries() {
        let fx = fixture(None);
        let mut remote = RevokedTaskSet::default();
        remote.insert_at("ancient", 0);
        remote.insert_at("fresh", now_ms());
        fx.backend.insert(REVOKED_KEY, codec::encode(&remote).unwrap());

        let report = fx.reconciler.merge().await;

        assert_eq!(report.restored, 2);
        assert_eq!(report.purged, 1);
        assert_eq!(ids(&fx.revoked.lock().unwrap()), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_merge_corrupt_blob_keeps_local_set() {
        let fx = fixture(None);
        fx.revoked.lock().unwrap().insert("local");
        fx.backend.insert(REVOKED_KEY, b"definitely not zlib".to_vec());

        let report = fx.reconciler.merge().await;

        assert!(report.discarded_blob);
        assert!(!report.degraded);
        assert_eq!(ids(&fx.revoked.lock().unwrap()), vec!["local"]);
    }

    #[tokio::test]
    async fn test_merge_unreachable_store_degrades() {
        let fx = fixture(Some(5));
        fx.revoked.lock().unwrap().insert("local");
        let before = fx.revoked.lock().unwrap().clone();
        fx.backend.set_unreachable(true);

        let report = fx.reconciler.merge().await;

        assert!(report.degraded);
        assert_eq!(*fx.revoked.lock().unwrap(), before);
        assert_eq!(fx.clock.value(), 5);
    }

    #[tokio::test]
    async fn test_sync_writes_blob_and_forwarded_clock() {
        let fx = fixture(Some(10));
        {
            let mut local = fx.revoked.lock().unwrap();
            local.insert("t1");
            local.insert("t2");
        }

        assert!(fx.reconciler.sync().await);

        assert_eq!(ids(&remote_set(&fx)), vec!["t1", "t2"]);
        assert_eq!(fx.backend.value(CLOCK_KEY), Some(b"11".to_vec()));
        assert_eq!(fx.clock.value(), 11);
    }

    #[tokio::test]
    async fn test_sync_empty_set_still_writes() {
        let fx = fixture(None);
        let mut stale = RevokedTaskSet::default();
        stale.insert("old");
        fx.backend.insert(REVOKED_KEY, codec::encode(&stale).unwrap());

        assert!(fx.reconciler.sync().await);

        assert!(remote_set(&fx).is_empty());
        assert_eq!(fx.backend.value(CLOCK_KEY), None);
    }

    #[tokio::test]
    async fn test_sync_unreachable_store_leaves_remote_untouched() {
        let fx = fixture(Some(1));
        fx.backend.insert(REVOKED_KEY, b"previous".to_vec());
        fx.revoked.lock().unwrap().insert("t1");
        fx.backend.set_unreachable(true);

        assert!(!fx.reconciler.sync().await);

        assert_eq!(fx.backend.value(REVOKED_KEY), Some(b"previous".to_vec()));
        assert_eq!(fx.backend.value(CLOCK_KEY), None);
    }

    #[tokio::test]
    async fn test_sync_then_merge_round_trip() {
        let fx = fixture(Some(3));
        fx.revoked.lock().unwrap().insert("t9");
        fx.reconciler.sync().await;

        fx.revoked.lock().unwrap().clear();
        let report = fx.reconciler.merge().await;

        assert_eq!(report.restored, 1);
        assert!(fx.revoked.lock().unwrap().contains("t9"));
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let fx = fixture(Some(0));
        fx.revoked.lock().unwrap().insert("t1");

        fx.reconciler.save().await;
        let calls = fx.backend.call_count();
        fx.reconciler.save().await;

        assert!(fx.reconciler.is_saved());
        assert!(fx.reconciler.store().is_closed());
        assert_eq!(fx.backend.call_count(), calls);
        assert_eq!(fx.clock.value(), 1);
    }

    #[tokio::test]
    async fn test_save_swallows_store_failure() {
        let fx = fixture(None);
        fx.backend.set_unreachable(true);

        fx.reconciler.save().await;

        assert!(fx.reconciler.store().is_closed());
    }

    #[tokio::test]
    async fn test_periodic_sync_runs_until_shutdown() {
        let fx = fixture(Some(0));
        let reconciler = Arc::new(fx.reconciler);
        let (tx, rx) = watch::channel(false);

        let handle = reconciler.spawn_periodic_sync(Duration::from_millis(20), rx).unwrap();
        tokio::time::sleep(Duration::from_millis(110)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let synced = fx.clock.value();
        assert!(synced >= 2, "expected at least two syncs, clock is {synced}");
        assert!(fx.backend.value(REVOKED_KEY).is_some());

        // Nothing runs after shutdown
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fx.clock.value(), synced);
    }

    #[tokio::test]
    async fn test_periodic_sync_zero_interval_is_refused() {
        let fx = fixture(Some(0));
        let reconciler = Arc::new(fx.reconciler);
        let (_tx, rx) = watch::channel(false);

        assert!(reconciler.spawn_periodic_sync(Duration::ZERO, rx).is_none());

        // The reconciler still works by hand
        assert!(reconciler.sync().await);
        assert_eq!(fx.clock.value(), 1);
    }

    #[tokio::test]
    async fn test_periodic_sync_stops_after_save() {
        let fx = fixture(Some(0));
        let reconciler = Arc::new(fx.reconciler);
        let (_tx, rx) = watch::channel(false);

        let handle = reconciler.spawn_periodic_sync(Duration::from_millis(10), rx).unwrap();
        reconciler.save().await;

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(fx.clock.value(), 1);
    }
}
