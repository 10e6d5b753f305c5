//! Worker identity and per-worker key namespaces

use std::fmt;

use crate::error::ConfigError;

/// Default base prefix for all keys
pub const DEFAULT_KEY_PREFIX: &str = "worker:state:";

/// Stable name of one worker process across restarts (usually its hostname)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    pub fn new(identity: impl Into<String>) -> Result<Self, ConfigError> {
        let identity = identity.into();
        if identity.trim().is_empty() {
            return Err(ConfigError::InvalidIdentity("worker identity must not be empty".to_string()));
        }
        Ok(Self(identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The identity as a single key segment
    ///
    /// `%` and `:` are percent-escaped so the segment never contains the key
    /// separator. The mapping is injective, so distinct identities always
    /// produce distinct, non-nesting namespaces.
    fn segment(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            match c {
                '%' => out.push_str("%25"),
                ':' => out.push_str("%3A"),
                c => out.push(c),
            }
        }
        out
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keys the state store knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    Revoked,
    Clock,
}

impl StateKey {
    pub const ALL: [StateKey; 2] = [StateKey::Revoked, StateKey::Clock];

    pub fn name(self) -> &'static str {
        match self {
            StateKey::Revoked => "revoked",
            StateKey::Clock => "clock",
        }
    }
}

/// `{base_prefix}{worker_identity}:`, fixed for the life of a state store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    identity: WorkerIdentity,
    prefix: String,
}

impl KeyNamespace {
    pub fn new(base_prefix: &str, identity: WorkerIdentity) -> Self {
        let prefix = format!("{}{}:", base_prefix, identity.segment());
        Self { identity, prefix }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn key(&self, key: StateKey) -> String {
        format!("{}{}", self.prefix, key.name())
    }
}
