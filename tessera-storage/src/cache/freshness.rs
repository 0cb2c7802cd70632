//! Freshness contracts for cache reads.
//!
//! Reads never hide their staleness: a volatile lookup says whether the hit
//! is fresh or stale, and a completed read carries where the value came
//! from, when it was fetched, and why a refresh failed if one did.

use chrono::Duration;
use tessera_core::{CacheEntry, CachedValue, FetchError, Timestamp};

/// Outcome of a volatile-tier lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Inside the staleness window.
    Fresh(CacheEntry<CachedValue>),
    /// Past the staleness window or invalidated, still inside the eviction
    /// window. A background refresh has been requested.
    Stale(CacheEntry<CachedValue>),
    /// Absent or evicted.
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        !matches!(self, Self::Miss)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    pub fn entry(&self) -> Option<&CacheEntry<CachedValue>> {
        match self {
            Self::Fresh(entry) | Self::Stale(entry) => Some(entry),
            Self::Miss => None,
        }
    }

    pub fn into_entry(self) -> Option<CacheEntry<CachedValue>> {
        match self {
            Self::Fresh(entry) | Self::Stale(entry) => Some(entry),
            Self::Miss => None,
        }
    }
}

/// Which tier answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Memory,
    Persistent,
    Network,
}

/// Result of a cache read, carrying staleness metadata.
///
/// A stale read whose refresh failed still returns the value, with the
/// failure in [`CacheRead::refresh_error`].
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    fetched_at: Timestamp,
    source: ReadSource,
    stale: bool,
    refresh_error: Option<FetchError>,
}

impl<T> CacheRead<T> {
    /// A read answered from the volatile tier.
    pub fn from_memory(value: T, fetched_at: Timestamp, stale: bool) -> Self {
        Self {
            value,
            fetched_at,
            source: ReadSource::Memory,
            stale,
            refresh_error: None,
        }
    }

    /// A read answered from persisted rows. Rehydrated values are treated
    /// as stale until the network confirms them.
    pub fn from_persistent(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            source: ReadSource::Persistent,
            stale: true,
            refresh_error: None,
        }
    }

    /// A read answered by a network fetch.
    pub fn from_network(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            source: ReadSource::Network,
            stale: false,
            refresh_error: None,
        }
    }

    /// Attach the error of a failed refresh.
    pub fn with_refresh_error(mut self, error: FetchError) -> Self {
        self.refresh_error = Some(error);
        self
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn fetched_at(&self) -> Timestamp {
        self.fetched_at
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn refresh_error(&self) -> Option<&FetchError> {
        self.refresh_error.as_ref()
    }

    /// How long ago the value was fetched.
    pub fn age_at(&self, now: Timestamp) -> Duration {
        if now > self.fetched_at {
            now - self.fetched_at
        } else {
            Duration::zero()
        }
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            fetched_at: self.fetched_at,
            source: self.source,
            stale: self.stale,
            refresh_error: self.refresh_error,
        }
    }

    /// Map the inner value, or fail without a read.
    pub fn try_map<U, E, F>(self, f: F) -> Result<CacheRead<U>, E>
    where
        F: FnOnce(T) -> Result<U, E>,
    {
        Ok(CacheRead {
            value: f(self.value)?,
            fetched_at: self.fetched_at,
            source: self.source,
            stale: self.stale,
            refresh_error: self.refresh_error,
        })
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tessera_core::{CacheKey, MetadataPayload, TtlPolicy};

    fn entry() -> CacheEntry<CachedValue> {
        CacheEntry::new(
            CacheKey::metadata("project"),
            CachedValue::Metadata(MetadataPayload::default()),
            Utc::now(),
            TtlPolicy::metadata_default(),
        )
    }

    #[test]
    fn test_lookup_accessors() {
        assert!(Lookup::Fresh(entry()).is_hit());
        assert!(!Lookup::Fresh(entry()).is_stale());
        assert!(Lookup::Stale(entry()).is_stale());
        assert!(!Lookup::Miss.is_hit());
        assert!(Lookup::Miss.into_entry().is_none());
    }

    #[test]
    fn test_persistent_reads_are_stale() {
        let read = CacheRead::from_persistent(1, Utc::now());
        assert!(read.is_stale());
        assert_eq!(read.source(), ReadSource::Persistent);
    }

    #[test]
    fn test_refresh_error_is_carried() {
        let read = CacheRead::from_memory("v", Utc::now(), true)
            .with_refresh_error(FetchError::network("offline"));
        assert!(read.is_stale());
        assert!(matches!(read.refresh_error(), Some(FetchError::Network { .. })));
        assert_eq!(read.into_value(), "v");
    }

    #[test]
    fn test_age_never_negative() {
        let now = Utc::now();
        let read = CacheRead::from_network("v", now + Duration::seconds(10));
        assert_eq!(read.age_at(now), Duration::zero());

        let read = CacheRead::from_network("v", now - Duration::seconds(5));
        assert_eq!(read.age_at(now), Duration::seconds(5));
    }

    #[test]
    fn test_map_keeps_metadata() {
        let read = CacheRead::from_memory(42i32, Utc::now(), true)
            .with_refresh_error(FetchError::network("x"));
        let mapped = read.map(|v| v.to_string());
        assert!(mapped.is_stale());
        assert!(mapped.refresh_error().is_some());
        assert_eq!(mapped.into_value(), "42");
    }

    #[test]
    fn test_try_map_propagates_failure() {
        let read = CacheRead::from_network(7u32, Utc::now());
        let ok: Result<CacheRead<u64>, String> = read.clone().try_map(|v| Ok(u64::from(v) * 2));
        assert_eq!(ok.unwrap().into_value(), 14);
        let err: Result<CacheRead<u64>, String> = read.try_map(|_| Err("wrong shape".to_string()));
        assert_eq!(err.unwrap_err(), "wrong shape");
    }
}
