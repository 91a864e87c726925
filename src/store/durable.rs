use std::path::Path;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::AppResult;

use super::{Journal, MemoryStore, StateStore, StoreEntry};

const JOURNAL_FILE: &str = "state.db";

/// Memory view backed by a SQLite journal under the agent data dir.
pub struct DurableStore {
    memory: MemoryStore,
    journal: Journal,
}

impl DurableStore {
    /// Opens the journal in `data_dir` and replays it into a fresh memory view.
    ///
    /// # Errors
    ///
    /// Returns an error when the journal cannot be opened or read.
    pub async fn open(data_dir: &Path, writer: &str) -> AppResult<Self> {
        let journal = Journal::open(&data_dir.join(JOURNAL_FILE)).await?;
        let memory = MemoryStore::new(writer);
        let entries = journal.load_all().await?;
        let replayed = entries.len();
        for entry in entries {
            memory.apply_remote(entry);
        }
        info!(
            "Replayed {} journal entries from {}",
            replayed,
            data_dir.display()
        );
        Ok(Self { memory, journal })
    }
}

#[async_trait]
impl StateStore for DurableStore {
    fn writer(&self) -> &str {
        self.memory.writer()
    }

    async fn put_in_term(&self, key: &str, value: String, term: u64) -> AppResult<StoreEntry> {
        let entry = self.memory.put_local(key, value, term)?;
        self.journal.upsert(&entry).await?;
        Ok(entry)
    }

    async fn get(&self, key: &str) -> Option<StoreEntry> {
        self.memory.read(key)
    }

    async fn get_all(&self, prefix: &str) -> Vec<StoreEntry> {
        self.memory.read_prefix(prefix)
    }

    async fn apply(&self, entry: StoreEntry) -> AppResult<bool> {
        let applied = self.memory.apply_remote(entry.clone());
        if applied {
            debug!(
                "Applied replicated entry '{}' v{} (term {}) from {}",
                entry.key, entry.version, entry.term, entry.writer
            );
            self.journal.upsert(&entry).await?;
        }
        Ok(applied)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEntry> {
        self.memory.subscribe()
    }
}
