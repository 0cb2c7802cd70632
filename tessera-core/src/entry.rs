//! Cache entries and their time-to-live windows.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::identity::Timestamp;
use crate::key::CacheKey;

/// Staleness and eviction windows of a cache entry.
///
/// Invariant: `stale_after < evict_after`. The constructor is the only way
/// to build a policy, so every entry in the cache satisfies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    stale_after: Duration,
    evict_after: Duration,
}

impl TtlPolicy {
    pub fn new(stale_after: Duration, evict_after: Duration) -> Result<Self, ConfigError> {
        if stale_after >= evict_after {
            return Err(ConfigError::InvalidValue {
                field: "ttl".to_string(),
                value: format!("{stale_after:?}/{evict_after:?}"),
                reason: "stale_after must be shorter than evict_after".to_string(),
            });
        }
        Ok(Self {
            stale_after,
            evict_after,
        })
    }

    /// Long windows for field metadata: 30 minutes stale, 24 hours evicted.
    pub fn metadata_default() -> Self {
        Self {
            stale_after: Duration::from_secs(30 * 60),
            evict_after: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Short windows for record data: 2 minutes stale, 1 hour evicted.
    pub fn data_default() -> Self {
        Self {
            stale_after: Duration::from_secs(2 * 60),
            evict_after: Duration::from_secs(60 * 60),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn evict_after(&self) -> Duration {
        self.evict_after
    }
}

/// Freshness of an entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    /// Servable, but a background refetch is due.
    Stale,
    /// Not servable; equivalent to a miss.
    Evicted,
}

/// A value held in the cache with its timing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: CacheKey,
    pub value: T,
    pub fetched_at: Timestamp,
    pub stale_after: Duration,
    pub evict_after: Duration,
    /// Generation of the request that produced the value.
    pub generation: u64,
    /// Set by invalidation; forces the entry stale until it is refetched.
    pub invalidated: bool,
}

impl<T> CacheEntry<T> {
    pub fn new(key: CacheKey, value: T, fetched_at: Timestamp, policy: TtlPolicy) -> Self {
        Self {
            key,
            value,
            fetched_at,
            stale_after: policy.stale_after,
            evict_after: policy.evict_after,
            generation: 0,
            invalidated: false,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn stale_at(&self) -> Timestamp {
        add_saturating(self.fetched_at, self.stale_after)
    }

    pub fn evict_at(&self) -> Timestamp {
        add_saturating(self.fetched_at, self.evict_after)
    }

    pub fn state_at(&self, now: Timestamp) -> EntryState {
        if now >= self.evict_at() {
            EntryState::Evicted
        } else if self.invalidated || now >= self.stale_at() {
            EntryState::Stale
        } else {
            EntryState::Fresh
        }
    }

    pub fn map<U, F>(self, f: F) -> CacheEntry<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheEntry {
            key: self.key,
            value: f(self.value),
            fetched_at: self.fetched_at,
            stale_after: self.stale_after,
            evict_after: self.evict_after,
            generation: self.generation,
            invalidated: self.invalidated,
        }
    }
}

/// `at + duration`, clamped to the largest representable timestamp.
pub fn add_saturating(at: Timestamp, duration: Duration) -> Timestamp {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}
