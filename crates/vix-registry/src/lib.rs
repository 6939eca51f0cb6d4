#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod allocator;
#[cfg(feature = "etcd")]
pub mod etcd;
pub mod mem;
mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use retry::retry_do;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("invalid registry value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("compare-and-swap retries exhausted on {0}")]
    CasExhausted(String),
    #[error("unsupported registry root: {0}")]
    UnsupportedRoot(String),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// One stored key/value with the revision it was last written at.
///
/// `mod_revision` is the optimistic-concurrency token for
/// [`MetaKv::compare_and_swap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub mod_revision: i64,
}

/// Outcome of a compare-and-swap. A revision mismatch is a normal outcome,
/// not an error; `actual` is 0 when the key does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasResult {
    Ok { revision: i64 },
    Conflict { actual: i64 },
}

impl CasResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, CasResult::Ok { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, revision: i64 },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put(kv) => kv.mod_revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

pub type WatchStream = tokio::sync::mpsc::UnboundedReceiver<WatchEvent>;

/// One live service instance registered under a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub server_id: i64,
    pub address: String,
}

pub const SESSION_PREFIX: &str = "session";

pub fn session_key(role: &str, server_id: i64) -> String {
    format!("{SESSION_PREFIX}/{role}/{server_id}")
}

pub fn session_prefix(role: &str) -> String {
    format!("{SESSION_PREFIX}/{role}/")
}

/// Parse the server id out of a session key for the given role.
pub fn parse_session_key(role: &str, key: &str) -> Option<i64> {
    key.strip_prefix(&session_prefix(role))?.parse().ok()
}

/// Keeps one session alive; dropping it revokes the session (and, in the
/// registry, eventually fires a delete event for watchers).
pub trait SessionHandle: Send {}

pub type SessionGuard = Box<dyn SessionHandle>;

/// The registry contract: a strongly-consistent KV store with revisions,
/// prefix watch and lease-backed sessions.
///
/// Every write is linearized by the store; `compare_and_swap` against
/// `mod_revision` is the only cross-process synchronization primitive the
/// coordinator relies on.
#[async_trait]
pub trait MetaKv: Send + Sync + 'static {
    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError>;

    /// Unconditional write; returns the new revision.
    async fn put(&self, key: &str, value: &str) -> Result<i64, RegistryError>;

    /// Conditional write. `expected_revision == 0` means "create": the key
    /// must not exist.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<CasResult, RegistryError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, RegistryError>;

    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), RegistryError>;

    /// Watch every key under `prefix`. Events with
    /// `mod_revision <= start_revision` are not delivered; pass the revision
    /// returned by a prior snapshot to observe everything after it.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<WatchStream, RegistryError>;

    async fn register_session(
        &self,
        role: &str,
        session: &Session,
    ) -> Result<SessionGuard, RegistryError>;

    /// Returns the live sessions for a role plus the snapshot revision to
    /// start a session watch from.
    async fn list_sessions(&self, role: &str) -> Result<(Vec<Session>, i64), RegistryError>;

    async fn current_revision(&self) -> Result<i64, RegistryError>;
}

/// Opens a registry from a root URL.
///
/// - `mem://` — process-local, for tests and single-process runs.
/// - `etcd://host:port,host:port/root-path` — requires feature "etcd".
pub async fn open_from_root(root: &str) -> Result<Arc<dyn MetaKv>, RegistryError> {
    let trimmed = root.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::UnsupportedRoot(root.to_string()));
    }

    if trimmed.strip_prefix("mem://").is_some() {
        return Ok(Arc::new(mem::MemRegistry::new()));
    }

    if let Some(rest) = trimmed.strip_prefix("etcd://") {
        #[cfg(feature = "etcd")]
        {
            return Ok(Arc::new(etcd::EtcdRegistry::connect_from_url(rest).await?));
        }
        #[cfg(not(feature = "etcd"))]
        {
            let _ = rest;
            return Err(RegistryError::UnsupportedRoot(format!(
                "etcd://... requires feature 'etcd' (got {root:?})"
            )));
        }
    }

    Err(RegistryError::UnsupportedRoot(root.to_string()))
}
