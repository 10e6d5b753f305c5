//! One-shot import of a legacy local state file into the store
//!
//! Steps, each of which aborts the run on failure:
//! 1. the file must exist
//! 2. copy it to `backup-{stem}.{timestamp}{ext}` next to the original
//! 3. decode it with the legacy codec path and write what it holds
//! 4. rename the original to `{name}.migrated.{timestamp}` so it is not imported twice

use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::codec::{self, LegacyFormat};
use crate::error::MigrationError;
use crate::keystore::{KeyStoreBackend, RedisBackend};
use crate::state_store::WorkerStateStore;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// What a migration run did
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub format: Option<LegacyFormat>,
    /// Revoked entries written; zero when the file held none
    pub entries: usize,
    pub clock: Option<u64>,
    pub backup: PathBuf,
    pub renamed: PathBuf,
}

impl MigrationReport {
    /// True when something was written to the store
    pub fn wrote_anything(&self) -> bool {
        self.format.is_some() || self.clock.is_some()
    }
}

pub struct Migrator<'a, B = RedisBackend> {
    path: PathBuf,
    store: &'a WorkerStateStore<B>,
}

impl<'a, B: KeyStoreBackend> Migrator<'a, B> {
    pub fn new(path: impl Into<PathBuf>, store: &'a WorkerStateStore<B>) -> Self {
        Self {
            path: path.into(),
            store,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        debug!(path = %self.path.display(), "Migrator::run: called");

        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(MigrationError::NotFound(self.path.clone()));
        }

        let stamp = utc_stamp();

        let backup = backup_path(&self.path, &stamp);
        tokio::fs::copy(&self.path, &backup)
            .await
            .map_err(|source| MigrationError::Backup {
                path: backup.clone(),
                source,
            })?;
        info!(backup = %backup.display(), "Backed up legacy state file");

        let bytes = tokio::fs::read(&self.path).await.map_err(|source| MigrationError::Read {
            path: self.path.clone(),
            source,
        })?;
        let import = codec::decode_legacy(&bytes)?;

        let entries = import.revoked.as_ref().map(|set| set.len()).unwrap_or(0);
        match (&import.revoked, import.clock) {
            (Some(revoked), clock) => {
                let blob = codec::encode(revoked).map_err(MigrationError::Encode)?;
                self.store.set_blobs(&blob, clock).await?;
            }
            (None, Some(clock)) => {
                self.store.set_clock(clock).await?;
            }
            (None, None) => {
                warn!(path = %self.path.display(), "Legacy state file holds no revokes and no clock");
            }
        }
        if let Some(format) = import.format {
            info!(%format, entries, clock = ?import.clock, "Imported legacy state");
        }

        let renamed = migrated_path(&self.path, &stamp);
        if let Err(source) = tokio::fs::rename(&self.path, &renamed).await {
            error!(
                path = %self.path.display(),
                error = %source,
                "State was migrated but the original could not be renamed; remove it before the next run"
            );
            return Err(MigrationError::Rename {
                path: self.path.clone(),
                source,
            });
        }
        info!(renamed = %renamed.display(), "Migration complete");

        Ok(MigrationReport {
            format: import.format,
            entries,
            clock: import.clock,
            backup,
            renamed,
        })
    }
}

fn utc_stamp() -> String {
    chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let suffix = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("backup-{stem}.{stamp}{suffix}"))
}

fn migrated_path(path: &Path, stamp: &str) -> PathBuf {
    let name = path.file_name().map(|s| s.to_string_lossy()).unwrap_or_default();
    path.with_file_name(format!("{name}.migrated.{stamp}"))
}
