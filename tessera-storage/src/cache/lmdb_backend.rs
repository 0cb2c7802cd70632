//! LMDB-backed persistent store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that survives restarts. Each [`CacheDomain`] lives in
//! its own named database; rows are JSON-encoded [`StoredEntry`] values
//! keyed by the canonical cache key.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `read`, `entries` and key collection
//! - Write transactions for `write`, `remove`, `clear` and expiry purges
//! - Hit and miss statistics behind a lock

use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, MdbError};
use tessera_core::{PersistError, Timestamp};
use tracing::warn;

use super::traits::{CacheDomain, CacheStats, PersistentStore, RowPredicate, StoredEntry};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a named database within the environment.
    #[error("Failed to open database {table}: {reason}")]
    DbOpen { table: &'static str, reason: String },

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The memory map is full.
    #[error("Map size exhausted")]
    MapFull,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<heed::Error> for LmdbStoreError {
    fn from(e: heed::Error) -> Self {
        match e {
            heed::Error::Mdb(MdbError::MapFull) => Self::MapFull,
            other => Self::Transaction(other.to_string()),
        }
    }
}

/// Convert LmdbStoreError to PersistError.
impl From<LmdbStoreError> for PersistError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::MapFull => PersistError::QuotaExceeded,
            other => PersistError::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

fn heed_err(e: heed::Error) -> PersistError {
    LmdbStoreError::from(e).into()
}

#[derive(Clone, Copy)]
struct Tables {
    metadata: Database<Str, Bytes>,
    data: Database<Str, Bytes>,
    draft: Database<Str, Bytes>,
    entity_names: Database<Str, Bytes>,
}

impl Tables {
    fn get(&self, domain: CacheDomain) -> Database<Str, Bytes> {
        match domain {
            CacheDomain::Metadata => self.metadata,
            CacheDomain::Data => self.data,
            CacheDomain::Draft => self.draft,
            CacheDomain::EntityNames => self.entity_names,
        }
    }
}

/// LMDB-backed persistent store.
///
/// # Example
///
/// ```ignore
/// use tessera_storage::cache::{CacheDomain, LmdbPersistentStore, PersistentStore};
///
/// let store = LmdbPersistentStore::new("/tmp/tessera", 64)?;
/// store.write(CacheDomain::Metadata, "project/metadata", &row).await?;
/// let row = store.read(CacheDomain::Metadata, "project/metadata", Utc::now()).await?;
/// ```
pub struct LmdbPersistentStore {
    env: Env,
    tables: Tables,
    stats: Arc<RwLock<CacheStats>>,
}

impl LmdbPersistentStore {
    /// Open (or create) a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - One of the domain databases cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(CacheDomain::ALL.len() as u32)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn()?;
        let mut open = |domain: CacheDomain| -> Result<Database<Str, Bytes>, LmdbStoreError> {
            env.create_database(&mut wtxn, Some(domain.table_name()))
                .map_err(|e| LmdbStoreError::DbOpen {
                    table: domain.table_name(),
                    reason: e.to_string(),
                })
        };
        let tables = Tables {
            metadata: open(CacheDomain::Metadata)?,
            data: open(CacheDomain::Data)?,
            draft: open(CacheDomain::Draft)?,
            entity_names: open(CacheDomain::EntityNames)?,
        };
        wtxn.commit()?;

        Ok(Self {
            env,
            tables,
            stats: Arc::new(RwLock::new(CacheStats::default())),
        })
    }

    fn record_hit(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.hits += 1;
        }
    }

    fn record_miss(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.misses += 1;
        }
    }

    fn decode(domain: CacheDomain, key: &str, bytes: &[u8]) -> Result<StoredEntry, PersistError> {
        serde_json::from_slice(bytes).map_err(|e| PersistError::Corrupt {
            domain: domain.table_name().to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Collect keys of a domain accepted by `keep`.
    fn collect_keys<F>(&self, domain: CacheDomain, mut keep: F) -> Result<Vec<String>, PersistError>
    where
        F: FnMut(&str, &[u8]) -> bool,
    {
        let rtxn = self.env.read_txn().map_err(heed_err)?;
        let mut keys = Vec::new();
        for result in self.tables.get(domain).iter(&rtxn).map_err(heed_err)? {
            let (key, bytes) = result.map_err(heed_err)?;
            if keep(key, bytes) {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    fn delete_keys(&self, domain: CacheDomain, keys: &[String]) -> Result<u64, PersistError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let db = self.tables.get(domain);
        let mut wtxn = self.env.write_txn().map_err(heed_err)?;
        let mut deleted = 0u64;
        for key in keys {
            if db.delete(&mut wtxn, key).map_err(heed_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(heed_err)?;
        Ok(deleted)
    }
}

#[async_trait]
impl PersistentStore for LmdbPersistentStore {
    async fn read(
        &self,
        domain: CacheDomain,
        key: &str,
        now: Timestamp,
    ) -> Result<Option<StoredEntry>, PersistError> {
        let found = {
            let rtxn = self.env.read_txn().map_err(heed_err)?;
            match self.tables.get(domain).get(&rtxn, key).map_err(heed_err)? {
                Some(bytes) => Some(Self::decode(domain, key, bytes)?),
                None => None,
            }
        };

        match found {
            Some(entry) if entry.is_expired(now) => {
                self.delete_keys(domain, &[key.to_string()])?;
                self.record_miss();
                Ok(None)
            }
            Some(entry) => {
                self.record_hit();
                Ok(Some(entry))
            }
            None => {
                self.record_miss();
                Ok(None)
            }
        }
    }

    async fn write(
        &self,
        domain: CacheDomain,
        key: &str,
        entry: &StoredEntry,
    ) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec(entry).map_err(|e| PersistError::Serialization {
            reason: e.to_string(),
        })?;

        let mut wtxn = self.env.write_txn().map_err(heed_err)?;
        self.tables
            .get(domain)
            .put(&mut wtxn, key, &bytes)
            .map_err(heed_err)?;
        wtxn.commit().map_err(heed_err)?;
        Ok(())
    }

    async fn remove(&self, domain: CacheDomain, key: &str) -> Result<bool, PersistError> {
        Ok(self.delete_keys(domain, &[key.to_string()])? > 0)
    }

    async fn clear(
        &self,
        domain: CacheDomain,
        predicate: RowPredicate<'_>,
    ) -> Result<u64, PersistError> {
        let keys = self.collect_keys(domain, |key, _| predicate(key))?;
        self.delete_keys(domain, &keys)
    }

    /// Undecodable rows are dropped one by one; the rest of the domain
    /// still loads.
    async fn entries(&self, domain: CacheDomain) -> Result<Vec<(String, StoredEntry)>, PersistError> {
        let mut rows = Vec::new();
        let mut corrupt = Vec::new();
        {
            let rtxn = self.env.read_txn().map_err(heed_err)?;
            for result in self.tables.get(domain).iter(&rtxn).map_err(heed_err)? {
                let (key, bytes) = result.map_err(heed_err)?;
                match Self::decode(domain, key, bytes) {
                    Ok(entry) => rows.push((key.to_string(), entry)),
                    Err(e) => {
                        warn!(domain = domain.table_name(), key, error = %e, "dropping undecodable row");
                        corrupt.push(key.to_string());
                    }
                }
            }
        }
        self.delete_keys(domain, &corrupt)?;
        Ok(rows)
    }

    async fn purge_expired(&self, domain: CacheDomain, now: Timestamp) -> Result<u64, PersistError> {
        // Undecodable rows are purged along with expired ones.
        let keys = self.collect_keys(domain, |_, bytes| {
            serde_json::from_slice::<StoredEntry>(bytes)
                .map(|entry| entry.is_expired(now))
                .unwrap_or(true)
        })?;
        self.delete_keys(domain, &keys)
    }

    async fn stats(&self) -> Result<CacheStats, PersistError> {
        let mut stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        let rtxn = self.env.read_txn().map_err(heed_err)?;
        let mut count = 0u64;
        for domain in CacheDomain::ALL {
            count += self.tables.get(domain).len(&rtxn).map_err(heed_err)?;
        }
        stats.entry_count = count;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbPersistentStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store =
            LmdbPersistentStore::new(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    fn row(value: serde_json::Value, ttl_secs: i64) -> StoredEntry {
        let now = Utc::now();
        StoredEntry::new(value, now, now + Duration::seconds(ttl_secs))
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (store, _temp_dir) = create_test_store();
        let entry = row(json!({"fields": ["name"]}), 60);

        store
            .write(CacheDomain::Metadata, "project/metadata", &entry)
            .await
            .expect("write should succeed");

        let read = store
            .read(CacheDomain::Metadata, "project/metadata", Utc::now())
            .await
            .expect("read should succeed");
        assert_eq!(read, Some(entry));
    }

    #[tokio::test]
    async fn test_domains_are_isolated() {
        let (store, _temp_dir) = create_test_store();
        store
            .write(CacheDomain::Data, "project/detail?id=P1", &row(json!(1), 60))
            .await
            .expect("write should succeed");

        let other = store
            .read(CacheDomain::Draft, "project/detail?id=P1", Utc::now())
            .await
            .expect("read should succeed");
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_expired_row_is_miss_and_purged() {
        let (store, _temp_dir) = create_test_store();
        store
            .write(CacheDomain::Data, "k", &row(json!(1), 1))
            .await
            .expect("write should succeed");

        let later = Utc::now() + Duration::seconds(5);
        let read = store
            .read(CacheDomain::Data, "k", later)
            .await
            .expect("read should succeed");
        assert!(read.is_none());

        let rows = store
            .entries(CacheDomain::Data)
            .await
            .expect("entries should succeed");
        assert!(rows.is_empty(), "expired row should have been purged");
    }

    #[tokio::test]
    async fn test_clear_by_predicate() {
        let (store, _temp_dir) = create_test_store();
        for key in ["project/list?limit=20", "project/detail?id=P1", "task/list?limit=20"] {
            store
                .write(CacheDomain::Data, key, &row(json!(null), 60))
                .await
                .expect("write should succeed");
        }

        let removed = store
            .clear(CacheDomain::Data, &|key: &str| key.starts_with("project/"))
            .await
            .expect("clear should succeed");
        assert_eq!(removed, 2);

        let rows = store
            .entries(CacheDomain::Data)
            .await
            .expect("entries should succeed");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "task/list?limit=20");
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, _temp_dir) = create_test_store();
        store
            .write(CacheDomain::Draft, "old", &row(json!(1), 1))
            .await
            .expect("write should succeed");
        store
            .write(CacheDomain::Draft, "new", &row(json!(2), 3600))
            .await
            .expect("write should succeed");

        let purged = store
            .purge_expired(CacheDomain::Draft, Utc::now() + Duration::seconds(10))
            .await
            .expect("purge should succeed");
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_surfaces_error() {
        let (store, _temp_dir) = create_test_store();
        {
            let mut wtxn = store.env.write_txn().expect("txn");
            store
                .tables
                .get(CacheDomain::Data)
                .put(&mut wtxn, "bad", &b"not json"[..])
                .expect("put");
            wtxn.commit().expect("commit");
        }

        let err = store
            .read(CacheDomain::Data, "bad", Utc::now())
            .await
            .expect_err("corrupt row should not decode");
        assert!(matches!(err, PersistError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_entries_skip_and_drop_corrupt_row() {
        let (store, _temp_dir) = create_test_store();
        for key in ["project/detail?id=P1", "project/detail?id=P3"] {
            store
                .write(CacheDomain::Data, key, &row(json!({"id": key}), 60))
                .await
                .expect("write should succeed");
        }
        {
            let mut wtxn = store.env.write_txn().expect("txn");
            store
                .tables
                .get(CacheDomain::Data)
                .put(&mut wtxn, "project/detail?id=P2", &b"{truncated"[..])
                .expect("put");
            wtxn.commit().expect("commit");
        }

        let rows = store
            .entries(CacheDomain::Data)
            .await
            .expect("entries should succeed despite a corrupt row");
        let keys: Vec<&str> = rows.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["project/detail?id=P1", "project/detail?id=P3"]);

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.entry_count, 2, "corrupt row should have been deleted");
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, _temp_dir) = create_test_store();

        let _ = store.read(CacheDomain::Data, "k", Utc::now()).await;
        store
            .write(CacheDomain::Data, "k", &row(json!(1), 60))
            .await
            .expect("write should succeed");
        let _ = store.read(CacheDomain::Data, "k", Utc::now()).await;
        let _ = store.read(CacheDomain::Data, "k", Utc::now()).await;

        let stats = store.stats().await.expect("stats should succeed");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
    }
}
