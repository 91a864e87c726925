use std::path::Path;

use tokio_rusqlite::Connection;

use crate::error::{AppError, AppResult, StoreError};

use super::StoreEntry;

/// SQLite journal of every entry this agent has seen, replayed on start.
pub struct Journal {
    conn: Connection,
}

impl Journal {
    /// Opens (or creates) the journal database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the parent directory or the database cannot be
    /// created.
    pub async fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                AppError::store(StoreError::Io {
                    context: "create journal directory",
                    source: err,
                })
            })?;
        }
        let conn = Connection::open(path).await.map_err(|err| {
            AppError::store(StoreError::Journal {
                context: "open journal",
                source: err,
            })
        })?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS entries (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    term INTEGER NOT NULL DEFAULT 0,
                    writer TEXT NOT NULL,
                    written_at_ms INTEGER NOT NULL
                );",
            )?;
            Ok(())
        })
        .await
        .map_err(|err| {
            AppError::store(StoreError::Journal {
                context: "initialize journal",
                source: err,
            })
        })?;
        Ok(Self { conn })
    }

    /// Stores `entry` unless the journal already holds an entry that
    /// supersedes it.
    ///
    /// # Errors
    ///
    /// Returns an error when the write fails.
    pub async fn upsert(&self, entry: &StoreEntry) -> AppResult<()> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO entries (key, value, version, term, writer, written_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        version = excluded.version,
                        term = excluded.term,
                        writer = excluded.writer,
                        written_at_ms = excluded.written_at_ms
                     WHERE (excluded.term, excluded.version, excluded.writer)
                         > (entries.term, entries.version, entries.writer)",
                    rusqlite::params![
                        entry.key,
                        entry.value,
                        clamp_i64(entry.version),
                        clamp_i64(entry.term),
                        entry.writer,
                        clamp_i64(entry.written_at_ms)
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|err| {
                AppError::store(StoreError::Journal {
                    context: "write journal entry",
                    source: err,
                })
            })
    }

    /// Every journaled entry, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error when the journal cannot be read.
    pub async fn load_all(&self) -> AppResult<Vec<StoreEntry>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value, version, term, writer, written_at_ms
                     FROM entries ORDER BY key",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(StoreEntry {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        version: unclamp_u64(row.get(2)?),
                        term: unclamp_u64(row.get(3)?),
                        writer: row.get(4)?,
                        written_at_ms: unclamp_u64(row.get(5)?),
                    })
                })?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?);
                }
                Ok(entries)
            })
            .await
            .map_err(|err| {
                AppError::store(StoreError::Journal {
                    context: "replay journal",
                    source: err,
                })
            })
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn unclamp_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
