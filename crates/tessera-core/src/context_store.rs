//! # Context Store
//!
//! Key/value memory shared with handlers through their invocation context.
//! The orchestrator never reads or writes it; handlers use it to carry
//! state across steps or plans.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Failures reported by a [`ContextStore`] backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextStoreError {
    #[error("failed to load key '{key}': {reason}")]
    LoadFailed { key: String, reason: String },

    #[error("failed to store key '{key}': {reason}")]
    StoreFailed { key: String, reason: String },

    #[error("context store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// External memory collaborator.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Load a value; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, ContextStoreError>;

    /// Store a value. `ttl = None` keeps it until overwritten.
    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), ContextStoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Transient in-process store with per-entry TTL.
///
/// Expired entries are dropped lazily on access and by [`purge_expired`].
///
/// ```rust
/// use tessera_core::context_store::{ContextStore, InMemoryContextStore};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryContextStore::new();
/// store.set("session", json!("abc123"), None).await.unwrap();
/// assert_eq!(store.get("session").await.unwrap(), Some(json!("abc123")));
/// # });
/// ```
///
/// [`purge_expired`]: InMemoryContextStore::purge_expired
#[derive(Debug, Clone, Default)]
pub struct InMemoryContextStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Entries hold plain values, so a writer that panicked cannot leave the
    // map half-updated; keep serving it.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.read().values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, ContextStoreError> {
        let now = Instant::now();
        match self.read().get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }

        let mut entries = self.write();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), ContextStoreError> {
        // A TTL past the clock's range never expires.
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.write()
            .insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }
}
