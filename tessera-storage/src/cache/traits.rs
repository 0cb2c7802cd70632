//! Persistent store trait and shared cache statistics.
//!
//! The persistent tier is an overflow and rehydration layer: on start the
//! volatile tier is empty and the persistent tier supplies last-known-good
//! values so a page can render before the network responds. Writes flow
//! volatile -> persistent only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{PersistError, Timestamp};

/// One logical table per cache domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheDomain {
    Metadata,
    Data,
    Draft,
    EntityNames,
}

impl CacheDomain {
    pub const ALL: [CacheDomain; 4] = [
        CacheDomain::Metadata,
        CacheDomain::Data,
        CacheDomain::Draft,
        CacheDomain::EntityNames,
    ];

    /// Table name used by persistent backends.
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Data => "data",
            Self::Draft => "draft",
            Self::EntityNames => "entityNames",
        }
    }
}

/// A persisted row: `{ value, fetchedAt, expiresAt }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    pub value: Value,
    pub fetched_at: Timestamp,
    pub expires_at: Timestamp,
}

impl StoredEntry {
    pub fn new(value: Value, fetched_at: Timestamp, expires_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            expires_at,
        }
    }

    /// Expired rows are misses even when physically present.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }
}

/// Predicate over canonical row keys.
pub type RowPredicate<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Durable, origin-scoped key/value storage.
///
/// Implementations must tolerate another session writing the same key
/// concurrently; callers never assume read-after-write consistency across
/// sessions.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read a row. Rows expired at `now` are purged and reported as a miss.
    async fn read(
        &self,
        domain: CacheDomain,
        key: &str,
        now: Timestamp,
    ) -> Result<Option<StoredEntry>, PersistError>;

    /// Insert or overwrite a row.
    async fn write(
        &self,
        domain: CacheDomain,
        key: &str,
        entry: &StoredEntry,
    ) -> Result<(), PersistError>;

    /// Delete a single row. Returns whether it existed.
    async fn remove(&self, domain: CacheDomain, key: &str) -> Result<bool, PersistError>;

    /// Delete every row whose key matches the predicate.
    async fn clear(
        &self,
        domain: CacheDomain,
        predicate: RowPredicate<'_>,
    ) -> Result<u64, PersistError>;

    /// All rows of a domain, expired or not.
    async fn entries(&self, domain: CacheDomain) -> Result<Vec<(String, StoredEntry)>, PersistError>;

    /// Delete every row of the domain expired at `now`.
    async fn purge_expired(&self, domain: CacheDomain, now: Timestamp) -> Result<u64, PersistError>;

    /// Get store statistics.
    async fn stats(&self) -> Result<CacheStats, PersistError>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of fresh hits.
    pub hits: u64,
    /// Number of hits served stale (a refetch was scheduled).
    pub stale_hits: u64,
    /// Number of misses, evicted entries included.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of entries dropped for age.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Stale hits count as hits.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits + self.stale_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 60,
            stale_hits: 20,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_stored_entry_expiry_is_strict() {
        let now = Utc::now();
        let entry = StoredEntry::new(Value::Null, now, now);
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_stored_entry_wire_format() {
        let now = Utc::now();
        let json = serde_json::to_value(StoredEntry::new(Value::Bool(true), now, now)).unwrap();
        assert!(json.get("fetchedAt").is_some());
        assert!(json.get("expiresAt").is_some());
    }

    #[test]
    fn test_table_names_are_distinct() {
        let mut names: Vec<&str> = CacheDomain::ALL.iter().map(|d| d.table_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 4);
    }
}
