//! Eventually-consistent key/value state shared between agents.
//!
//! Each agent owns `status/<id>` and `metrics/<id>`; `leader/*` belongs to
//! whoever leads, so it changes hands on failover. Replicas keep the greatest
//! entry by `(term, version, writer)`. A higher leadership term always wins,
//! so a new leader's writes replace a deposed leader's even when both
//! produced the same version.
mod durable;
mod journal;
mod memory;
mod replicator;
mod wire;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{AppError, AppResult, StoreError};

pub use durable::DurableStore;
pub use journal::Journal;
pub use memory::MemoryStore;
pub use replicator::{Replicator, ReplicatorConfig};

/// Capacity of the change feed. Slow subscribers see `Lagged` and re-read.
pub(crate) const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub key: String,
    /// JSON document.
    pub value: String,
    pub version: u64,
    /// Leadership term the writer held; zero for agent-owned keys.
    #[serde(default)]
    pub term: u64,
    pub writer: String,
    pub written_at_ms: u64,
}

impl StoreEntry {
    /// Whether `self` replaces `other` for the same key.
    #[must_use]
    pub fn supersedes(&self, other: &StoreEntry) -> bool {
        (self.term, self.version, self.writer.as_str())
            > (other.term, other.version, other.writer.as_str())
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Id stamped on entries written through this handle.
    fn writer(&self) -> &str;

    /// Writes `value` under `key` with the next version for that key.
    ///
    /// # Errors
    ///
    /// Returns an error when the version counter overflows or the write cannot
    /// be made durable.
    async fn put(&self, key: &str, value: String) -> AppResult<StoreEntry> {
        self.put_in_term(key, value, 0).await
    }

    /// Like [`StateStore::put`], stamped with the writer's leadership term.
    ///
    /// # Errors
    ///
    /// Returns `StaleTerm` when the key already holds an entry from a newer
    /// term, plus the errors of [`StateStore::put`].
    async fn put_in_term(&self, key: &str, value: String, term: u64) -> AppResult<StoreEntry>;

    async fn get(&self, key: &str) -> Option<StoreEntry>;

    /// Latest known entry for every key starting with `prefix`, ordered by key.
    async fn get_all(&self, prefix: &str) -> Vec<StoreEntry>;

    /// Merges a replicated entry. Returns `true` when it superseded the local
    /// one.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry cannot be made durable.
    async fn apply(&self, entry: StoreEntry) -> AppResult<bool>;

    /// Change feed carrying every local write and every accepted replicated entry.
    fn subscribe(&self) -> broadcast::Receiver<StoreEntry>;
}

/// Serialises `value` and writes it under `key`.
///
/// # Errors
///
/// Returns an error when serialisation or the underlying write fails.
pub async fn put_json<T>(store: &dyn StateStore, key: &str, value: &T) -> AppResult<StoreEntry>
where
    T: Serialize + Sync,
{
    put_json_in_term(store, key, value, 0).await
}

/// [`put_json`] for leader-owned keys, stamped with `term`.
///
/// # Errors
///
/// Returns an error when serialisation fails, the key holds a newer term, or
/// the underlying write fails.
pub async fn put_json_in_term<T>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    term: u64,
) -> AppResult<StoreEntry>
where
    T: Serialize + Sync,
{
    let encoded = serde_json::to_string(value).map_err(|err| {
        AppError::store(StoreError::Serialize {
            context: "store value",
            source: err,
        })
    })?;
    store.put_in_term(key, encoded, term).await
}

/// Reads and decodes `key`. An undecodable entry is logged and treated as missing.
pub async fn get_json<T>(store: &dyn StateStore, key: &str) -> Option<(T, StoreEntry)>
where
    T: DeserializeOwned,
{
    let entry = store.get(key).await?;
    decode_entry(&entry).map(|value| (value, entry))
}

/// Reads and decodes every entry under `prefix`, skipping undecodable ones.
pub async fn get_all_json<T>(store: &dyn StateStore, prefix: &str) -> Vec<(T, StoreEntry)>
where
    T: DeserializeOwned,
{
    store
        .get_all(prefix)
        .await
        .into_iter()
        .filter_map(|entry| decode_entry(&entry).map(|value| (value, entry)))
        .collect()
}

pub(crate) fn decode_entry<T>(entry: &StoreEntry) -> Option<T>
where
    T: DeserializeOwned,
{
    match serde_json::from_str(&entry.value) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                "Skipping undecodable store entry '{}' v{} from {}: {}",
                entry.key, entry.version, entry.writer, err
            );
            None
        }
    }
}
