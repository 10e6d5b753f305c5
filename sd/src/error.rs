//! Error types for the state database

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the key-value store layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Command error: {0}")]
    Command(String),

    #[error("Invalid store URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid value stored at {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Store connection is closed")]
    Closed,
}

impl StoreError {
    /// Check if this error is worth retrying
    ///
    /// Only connectivity and timeout failures are transient. Everything else
    /// (bad arguments, wrong types, a closed handle) fails the same way on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Connection(_) => true,
            StoreError::Timeout => true,
            StoreError::Command(_) => false,
            StoreError::InvalidUrl { .. } => false,
            StoreError::InvalidValue { .. } => false,
            StoreError::Closed => false,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Errors decoding a persisted revoked-set blob
///
/// Absent data is never a decode error; callers see `None` from the store for that.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Blob is empty")]
    Empty,

    #[error("Blob is not a valid compressed stream: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("Blob payload is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unsupported blob version {0}")]
    UnsupportedVersion(u32),

    #[error("No recognizable revoked-set layout in legacy state")]
    UnrecognizedLegacyFormat,
}

/// Configuration and construction errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    MissingField(&'static str),

    #[error("Invalid worker identity: {0}")]
    InvalidIdentity(String),

    #[error("Unsupported store URL scheme (expected redis:// or rediss://): {0}")]
    UnsupportedScheme(String),

    #[error("Invalid setting {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors from the one-shot legacy file migration
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("State file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to back up {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode legacy state: {0}")]
    Decode(#[from] DecodeError),

    #[error("Failed to encode migrated revokes: {0}")]
    Encode(#[source] std::io::Error),

    #[error("Failed to write migrated state: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to rename {path} after migration: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Umbrella error for callers that don't care which layer failed
#[derive(Debug, Error)]
pub enum StateDbError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}
