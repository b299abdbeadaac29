use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{instrument, warn};

pub const DEFAULT_DB_NAME: &str = "sentry-offline";
pub const DEFAULT_STORE_NAME: &str = "queue";

const MAX_NAME_LENGTH: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// Where and under what names the durable queue lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Database file stem; the file is `{db_name}.db` under `directory`.
    pub db_name: String,
    /// Table holding the queue.
    pub store_name: String,
    pub directory: PathBuf,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            db_name: DEFAULT_DB_NAME.to_string(),
            store_name: DEFAULT_STORE_NAME.to_string(),
            directory: PathBuf::from("."),
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    #[must_use]
    pub fn with_store_name(mut self, store_name: impl Into<String>) -> Self {
        self.store_name = store_name.into();
        self
    }

    #[must_use]
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.directory.join(format!("{}.db", self.db_name))
    }
}

/// Ordered, bounded persistence for serialized envelopes.
///
/// Entries enumerate strictly by ascending key from head to tail. Every
/// operation is atomic: partial writes are never observable, even across a
/// crash mid-operation.
#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// Stores `value` at the head when `to_start`, else at the tail.
    ///
    /// A head insert keys strictly below every present entry; a tail insert
    /// strictly above. Silently dropped when the store already holds
    /// `max_size` entries.
    async fn insert(&self, value: &[u8], max_size: usize, to_start: bool)
        -> Result<(), StoreError>;

    /// Removes and returns the entry `offset` positions from the head.
    ///
    /// Resolves `None` on an empty store or an offset past the tail. The
    /// delete is unconditional: reading without removing is not supported.
    async fn pop(&self, offset: usize) -> Result<Option<Vec<u8>>, StoreError>;

    async fn size(&self) -> Result<usize, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

/// SQLite-backed queue store.
///
/// One connection, one read-write transaction per operation. The queue has a
/// single logical writer, so a larger pool would only reorder operations.
#[derive(Debug)]
pub struct SqliteEnvelopeStore {
    pool: SqlitePool,
    table: String,
}

impl SqliteEnvelopeStore {
    /// Opens (creating if missing) the database file described by `options`.
    #[instrument]
    pub async fn open(options: &StoreOptions) -> Result<Self, StoreError> {
        validate_name(&options.db_name)?;
        let connect = SqliteConnectOptions::new()
            .filename(options.db_path())
            .create_if_missing(true);
        Self::connect(connect, &options.store_name).await
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect(SqliteConnectOptions::new().in_memory(true), DEFAULT_STORE_NAME).await
    }

    async fn connect(connect: SqliteConnectOptions, store_name: &str) -> Result<Self, StoreError> {
        validate_name(store_name)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await?;

        let table = format!("\"{store_name}\"");
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (key INTEGER PRIMARY KEY, value BLOB NOT NULL)"
        ))
        .execute(&pool)
        .await?;

        Ok(Self { pool, table })
    }
}

#[async_trait]
impl EnvelopeStore for SqliteEnvelopeStore {
    async fn insert(
        &self,
        value: &[u8],
        max_size: usize,
        to_start: bool,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT COUNT(key) AS count, MIN(key) AS head, MAX(key) AS tail FROM {}",
            self.table
        ))
        .fetch_one(&mut *tx)
        .await?;

        let count: i64 = row.get("count");
        if count as usize >= max_size {
            warn!(count, max_size, "queue full, dropping envelope");
            return Ok(());
        }

        let key: i64 = if to_start {
            row.get::<Option<i64>, _>("head").map_or(0, |head| head - 1)
        } else {
            row.get::<Option<i64>, _>("tail").map_or(1, |tail| tail + 1)
        };

        sqlx::query(&format!(
            "INSERT INTO {} (key, value) VALUES (?, ?)",
            self.table
        ))
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn pop(&self, offset: usize) -> Result<Option<Vec<u8>>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT key, value FROM {} ORDER BY key ASC LIMIT 1 OFFSET ?",
            self.table
        ))
        .bind(offset as i64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let key: i64 = row.get("key");
        let value: Vec<u8> = row.get("value");

        sqlx::query(&format!("DELETE FROM {} WHERE key = ?", self.table))
            .bind(key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(value))
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(key) AS count FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory store with the same ordering semantics.
///
/// For tests and consumers that want queueing without durability.
#[derive(Debug, Default)]
pub struct MemoryEnvelopeStore {
    entries: Mutex<BTreeMap<i64, Vec<u8>>>,
}

impl MemoryEnvelopeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<i64, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EnvelopeStore for MemoryEnvelopeStore {
    async fn insert(
        &self,
        value: &[u8],
        max_size: usize,
        to_start: bool,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries();
        if entries.len() >= max_size {
            warn!(count = entries.len(), max_size, "queue full, dropping envelope");
            return Ok(());
        }
        let key = if to_start {
            entries.keys().next().map_or(0, |head| head - 1)
        } else {
            entries.keys().next_back().map_or(1, |tail| tail + 1)
        };
        entries.insert(key, value.to_vec());
        Ok(())
    }

    async fn pop(&self, offset: usize) -> Result<Option<Vec<u8>>, StoreError> {
        let mut entries = self.entries();
        let Some(key) = entries.keys().nth(offset).copied() else {
            return Ok(None);
        };
        Ok(entries.remove(&key))
    }

    async fn size(&self) -> Result<usize, StoreError> {
        Ok(self.entries().len())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries().clear();
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidName {
            name: name.to_string(),
            reason: "name cannot be empty",
        });
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(StoreError::InvalidName {
            name: name.chars().take(MAX_NAME_LENGTH).collect(),
            reason: "name too long",
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(StoreError::InvalidName {
            name: name.to_string(),
            reason: "name contains invalid characters",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    async fn fill(store: &dyn EnvelopeStore, values: &[&[u8]]) {
        for value in values {
            store.insert(value, usize::MAX, false).await.unwrap();
        }
    }

    #[tokio::test]
    async fn tail_inserts_pop_in_fifo_order() {
        let store = SqliteEnvelopeStore::in_memory().await.unwrap();
        fill(&store, &[b"one" as &[u8], b"two", b"three"]).await;

        assert_eq!(store.pop(0).await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), Some(b"three".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn head_insert_pops_before_existing_entries() {
        let store = SqliteEnvelopeStore::in_memory().await.unwrap();
        fill(&store, &[b"old" as &[u8]]).await;
        store.insert(b"head", usize::MAX, true).await.unwrap();

        assert_eq!(store.pop(0).await.unwrap(), Some(b"head".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), Some(b"old".to_vec()));
    }

    #[tokio::test]
    async fn repeated_head_inserts_keep_strict_order() {
        let store = SqliteEnvelopeStore::in_memory().await.unwrap();
        fill(&store, &[b"tail" as &[u8]]).await;
        store.insert(b"first", usize::MAX, true).await.unwrap();
        store.insert(b"second", usize::MAX, true).await.unwrap();

        // Each head insert lands strictly before every present entry.
        assert_eq!(store.pop(0).await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), Some(b"tail".to_vec()));
    }

    #[tokio::test]
    async fn insert_into_full_store_is_dropped() {
        let store = SqliteEnvelopeStore::in_memory().await.unwrap();
        store.insert(b"one", 2, false).await.unwrap();
        store.insert(b"two", 2, false).await.unwrap();
        store.insert(b"three", 2, false).await.unwrap();
        store.insert(b"head", 2, true).await.unwrap();

        assert_eq!(store.size().await.unwrap(), 2);
        assert_eq!(store.pop(0).await.unwrap(), Some(b"one".to_vec()));
    }

    #[tokio::test]
    async fn pop_from_empty_store_resolves_none() {
        let store = SqliteEnvelopeStore::in_memory().await.unwrap();
        assert_eq!(store.pop(0).await.unwrap(), None);
        assert_eq!(store.pop(5).await.unwrap(), None);
        assert_eq!(store.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pop_at_offset_removes_only_that_entry() {
        let store = SqliteEnvelopeStore::in_memory().await.unwrap();
        fill(&store, &[b"one" as &[u8], b"two", b"three"]).await;

        assert_eq!(store.pop(1).await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.size().await.unwrap(), 2);
        assert_eq!(store.pop(0).await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), Some(b"three".to_vec()));
    }

    #[tokio::test]
    async fn pop_past_tail_resolves_none() {
        let store = SqliteEnvelopeStore::in_memory().await.unwrap();
        fill(&store, &[b"one" as &[u8]]).await;
        assert_eq!(store.pop(3).await.unwrap(), None);
        assert_eq!(store.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let store = SqliteEnvelopeStore::in_memory().await.unwrap();
        fill(&store, &[b"one" as &[u8], b"two"]).await;
        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
        assert_eq!(store.pop(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let options = StoreOptions::default().with_directory(dir.path());

        {
            let store = SqliteEnvelopeStore::open(&options).await.unwrap();
            fill(&store, &[b"kept" as &[u8]]).await;
        }

        let reopened = SqliteEnvelopeStore::open(&options).await.unwrap();
        assert_eq!(reopened.size().await.unwrap(), 1);
        assert_eq!(reopened.pop(0).await.unwrap(), Some(b"kept".to_vec()));
    }

    #[tokio::test]
    async fn invalid_store_name_rejected() {
        let dir = tempdir().unwrap();
        let options = StoreOptions::default()
            .with_directory(dir.path())
            .with_store_name("queue\"; DROP TABLE queue; --");

        let result = SqliteEnvelopeStore::open(&options).await;
        assert_matches!(result, Err(StoreError::InvalidName { .. }));

        let empty = StoreOptions::default()
            .with_directory(dir.path())
            .with_db_name("");
        assert_matches!(
            SqliteEnvelopeStore::open(&empty).await,
            Err(StoreError::InvalidName { .. })
        );
    }

    #[tokio::test]
    async fn memory_store_matches_queue_semantics() {
        let store = MemoryEnvelopeStore::new();
        fill(&store, &[b"one" as &[u8], b"two"]).await;
        store.insert(b"head", usize::MAX, true).await.unwrap();
        store.insert(b"dropped", 3, false).await.unwrap();

        assert_eq!(store.size().await.unwrap(), 3);
        assert_eq!(store.pop(0).await.unwrap(), Some(b"head".to_vec()));
        assert_eq!(store.pop(1).await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.pop(0).await.unwrap(), None);

        store.insert(b"again", 3, false).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }
}
