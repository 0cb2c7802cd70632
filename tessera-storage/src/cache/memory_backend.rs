//! In-process persistent store.
//!
//! Used when no persistence path is configured, and by tests. Supports an
//! optional row quota and an injectable failure so degraded-storage paths
//! can be exercised without a broken disk.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tessera_core::{PersistError, Timestamp};

use super::traits::{CacheDomain, CacheStats, PersistentStore, RowPredicate, StoredEntry};

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<CacheDomain, BTreeMap<String, StoredEntry>>,
    stats: CacheStats,
    failure: Option<PersistError>,
}

impl Inner {
    fn check(&self) -> Result<(), PersistError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn row_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }
}

/// Persistent store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryPersistentStore {
    inner: RwLock<Inner>,
    max_rows: Option<usize>,
}

impl InMemoryPersistentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes of new rows once `max_rows` rows are stored.
    pub fn with_quota(max_rows: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_rows: Some(max_rows),
        }
    }

    /// Make every operation fail with `failure` until cleared with `None`.
    pub fn set_failure(&self, failure: Option<PersistError>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .failure = failure;
    }

    /// Number of stored rows across all domains.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .row_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistentStore for InMemoryPersistentStore {
    async fn read(
        &self,
        domain: CacheDomain,
        key: &str,
        now: Timestamp,
    ) -> Result<Option<StoredEntry>, PersistError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.check()?;

        let table = inner.tables.entry(domain).or_default();
        let expired = match table.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                let entry = entry.clone();
                inner.stats.hits += 1;
                return Ok(Some(entry));
            }
            None => false,
        };
        if expired {
            table.remove(key);
        }
        inner.stats.misses += 1;
        Ok(None)
    }

    async fn write(
        &self,
        domain: CacheDomain,
        key: &str,
        entry: &StoredEntry,
    ) -> Result<(), PersistError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.check()?;

        let exists = inner
            .tables
            .get(&domain)
            .is_some_and(|table| table.contains_key(key));
        if let Some(max_rows) = self.max_rows {
            if !exists && inner.row_count() >= max_rows {
                return Err(PersistError::QuotaExceeded);
            }
        }

        inner
            .tables
            .entry(domain)
            .or_default()
            .insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn remove(&self, domain: CacheDomain, key: &str) -> Result<bool, PersistError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.check()?;
        Ok(inner
            .tables
            .get_mut(&domain)
            .and_then(|table| table.remove(key))
            .is_some())
    }

    async fn clear(
        &self,
        domain: CacheDomain,
        predicate: RowPredicate<'_>,
    ) -> Result<u64, PersistError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.check()?;
        let Some(table) = inner.tables.get_mut(&domain) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|key, _| !predicate(key));
        Ok((before - table.len()) as u64)
    }

    async fn entries(&self, domain: CacheDomain) -> Result<Vec<(String, StoredEntry)>, PersistError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.check()?;
        Ok(inner
            .tables
            .get(&domain)
            .map(|table| {
                table
                    .iter()
                    .map(|(key, entry)| (key.clone(), entry.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_expired(&self, domain: CacheDomain, now: Timestamp) -> Result<u64, PersistError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.check()?;
        let Some(table) = inner.tables.get_mut(&domain) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|_, entry| !entry.is_expired(now));
        Ok((before - table.len()) as u64)
    }

    async fn stats(&self) -> Result<CacheStats, PersistError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.check()?;
        let mut stats = inner.stats.clone();
        stats.entry_count = inner.row_count() as u64;
        Ok(stats)
    }
}
