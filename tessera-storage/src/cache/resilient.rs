//! Degrading wrapper around a persistent store.
//!
//! Persistent-tier failures are never propagated to readers. Every error is
//! logged, counted and turned into a miss (reads) or a no-op (writes), so a
//! broken or full disk leaves the cache running network-only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_core::{PersistError, Timestamp};
use tracing::{debug, warn};

use super::traits::{CacheDomain, PersistentStore, RowPredicate, StoredEntry};

/// Persistent store that absorbs failures.
#[derive(Clone)]
pub struct ResilientStore {
    inner: Arc<dyn PersistentStore>,
    failures: Arc<AtomicU64>,
    degraded: Arc<AtomicBool>,
}

impl std::fmt::Debug for ResilientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientStore")
            .field("failures", &self.failure_count())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl ResilientStore {
    pub fn new(inner: Arc<dyn PersistentStore>) -> Self {
        Self {
            inner,
            failures: Arc::new(AtomicU64::new(0)),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the last operation against the store failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Total number of absorbed failures.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &Arc<dyn PersistentStore> {
        &self.inner
    }

    fn ok(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            debug!("persistent store recovered");
        }
    }

    fn degrade(&self, op: &'static str, domain: CacheDomain, error: &PersistError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.degraded.store(true, Ordering::Relaxed);
        warn!(
            op,
            domain = domain.table_name(),
            error = %error,
            "persistent store failure, continuing without it"
        );
    }

    /// Read a row; any failure is a miss. Corrupt rows are deleted.
    pub async fn read(&self, domain: CacheDomain, key: &str, now: Timestamp) -> Option<StoredEntry> {
        match self.inner.read(domain, key, now).await {
            Ok(found) => {
                self.ok();
                found
            }
            Err(error) => {
                self.degrade("read", domain, &error);
                if matches!(error, PersistError::Corrupt { .. }) {
                    let _ = self.inner.remove(domain, key).await;
                }
                None
            }
        }
    }

    /// Read and decode a row. Rows that no longer decode as `T` are
    /// deleted and reported as a miss.
    pub async fn read_as<T: DeserializeOwned>(
        &self,
        domain: CacheDomain,
        key: &str,
        now: Timestamp,
    ) -> Option<(T, StoredEntry)> {
        let entry = self.read(domain, key, now).await?;
        match serde_json::from_value::<T>(entry.value.clone()) {
            Ok(value) => Some((value, entry)),
            Err(e) => {
                let error = PersistError::Corrupt {
                    domain: domain.table_name().to_string(),
                    key: key.to_string(),
                    reason: e.to_string(),
                };
                self.degrade("decode", domain, &error);
                let _ = self.inner.remove(domain, key).await;
                None
            }
        }
    }

    /// Write a row. On quota exhaustion, expired rows are purged and the
    /// write retried once. Returns whether the row was stored.
    pub async fn write(&self, domain: CacheDomain, key: &str, entry: &StoredEntry) -> bool {
        match self.inner.write(domain, key, entry).await {
            Ok(()) => {
                self.ok();
                true
            }
            Err(PersistError::QuotaExceeded) => {
                let now = entry.fetched_at;
                for d in CacheDomain::ALL {
                    let _ = self.inner.purge_expired(d, now).await;
                }
                match self.inner.write(domain, key, entry).await {
                    Ok(()) => {
                        self.ok();
                        true
                    }
                    Err(error) => {
                        self.degrade("write", domain, &error);
                        false
                    }
                }
            }
            Err(error) => {
                self.degrade("write", domain, &error);
                false
            }
        }
    }

    /// Encode and write a value.
    pub async fn write_as<T: Serialize>(
        &self,
        domain: CacheDomain,
        key: &str,
        value: &T,
        fetched_at: Timestamp,
        expires_at: Timestamp,
    ) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => {
                let entry = StoredEntry::new(value, fetched_at, expires_at);
                self.write(domain, key, &entry).await
            }
            Err(e) => {
                let error = PersistError::Serialization {
                    reason: e.to_string(),
                };
                self.degrade("encode", domain, &error);
                false
            }
        }
    }

    pub async fn remove(&self, domain: CacheDomain, key: &str) -> bool {
        match self.inner.remove(domain, key).await {
            Ok(removed) => {
                self.ok();
                removed
            }
            Err(error) => {
                self.degrade("remove", domain, &error);
                false
            }
        }
    }

    pub async fn clear(&self, domain: CacheDomain, predicate: RowPredicate<'_>) -> u64 {
        match self.inner.clear(domain, predicate).await {
            Ok(count) => {
                self.ok();
                count
            }
            Err(error) => {
                self.degrade("clear", domain, &error);
                0
            }
        }
    }

    pub async fn entries(&self, domain: CacheDomain) -> Vec<(String, StoredEntry)> {
        match self.inner.entries(domain).await {
            Ok(rows) => {
                self.ok();
                rows
            }
            Err(error) => {
                self.degrade("entries", domain, &error);
                Vec::new()
            }
        }
    }

    pub async fn purge_expired(&self, domain: CacheDomain, now: Timestamp) -> u64 {
        match self.inner.purge_expired(domain, now).await {
            Ok(count) => {
                self.ok();
                count
            }
            Err(error) => {
                self.degrade("purge", domain, &error);
                0
            }
        }
    }
}
