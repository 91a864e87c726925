use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::domain::now_ms;
use crate::error::{AppError, AppResult, StoreError};

use super::{CHANGE_FEED_CAPACITY, StateStore, StoreEntry};

struct Shared {
    entries: Mutex<BTreeMap<String, StoreEntry>>,
    changes: broadcast::Sender<StoreEntry>,
}

/// In-memory view of the store. Clones (and [`MemoryStore::handle_for`])
/// share the same map and change feed.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    writer: String,
}

impl MemoryStore {
    #[must_use]
    pub fn new(writer: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(BTreeMap::new()),
                changes,
            }),
            writer: writer.into(),
        }
    }

    /// Another handle on the same map writing as `writer`.
    #[must_use]
    pub fn handle_for(&self, writer: impl Into<String>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            writer: writer.into(),
        }
    }

    pub(crate) fn put_local(&self, key: &str, value: String, term: u64) -> AppResult<StoreEntry> {
        let entry = {
            let mut entries = self
                .shared
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let version = match entries.get(key) {
                Some(current) if current.term > term => {
                    return Err(AppError::store(StoreError::StaleTerm {
                        key: key.to_owned(),
                        term,
                        current: current.term,
                    }));
                }
                Some(current) => current.version.checked_add(1).ok_or_else(|| {
                    AppError::store(StoreError::VersionOverflow {
                        key: key.to_owned(),
                    })
                })?,
                None => 1,
            };
            let entry = StoreEntry {
                key: key.to_owned(),
                value,
                version,
                term,
                writer: self.writer.clone(),
                written_at_ms: now_ms(),
            };
            entries.insert(key.to_owned(), entry.clone());
            entry
        };
        drop(self.shared.changes.send(entry.clone()));
        Ok(entry)
    }

    pub(crate) fn apply_remote(&self, entry: StoreEntry) -> bool {
        {
            let mut entries = self
                .shared
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(current) = entries.get(&entry.key)
                && !entry.supersedes(current)
            {
                return false;
            }
            entries.insert(entry.key.clone(), entry.clone());
        }
        drop(self.shared.changes.send(entry));
        true
    }

    pub(crate) fn read(&self, key: &str) -> Option<StoreEntry> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub(crate) fn read_prefix(&self, prefix: &str) -> Vec<StoreEntry> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn writer(&self) -> &str {
        &self.writer
    }

    async fn put_in_term(&self, key: &str, value: String, term: u64) -> AppResult<StoreEntry> {
        self.put_local(key, value, term)
    }

    async fn get(&self, key: &str) -> Option<StoreEntry> {
        self.read(key)
    }

    async fn get_all(&self, prefix: &str) -> Vec<StoreEntry> {
        self.read_prefix(prefix)
    }

    async fn apply(&self, entry: StoreEntry) -> AppResult<bool> {
        Ok(self.apply_remote(entry))
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEntry> {
        self.shared.changes.subscribe()
    }
}
