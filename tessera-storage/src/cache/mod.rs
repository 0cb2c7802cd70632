//! Two-tier entity cache.
//!
//! The volatile tier ([`VolatileCache`]) answers every read synchronously
//! and carries staleness explicitly through [`Lookup`]. The persistent tier
//! ([`PersistentStore`]) is an overflow and rehydration layer; it is always
//! accessed through [`ResilientStore`] so its failures degrade the cache to
//! network-only instead of reaching readers.
//!
//! # Example
//!
//! ```ignore
//! let cache = VolatileCache::new(Arc::new(SystemClock));
//! let key = CacheKey::metadata("project");
//!
//! match cache.get(&key) {
//!     Lookup::Fresh(entry) => render(&entry.value),
//!     Lookup::Stale(entry) => render(&entry.value), // refetch already scheduled
//!     Lookup::Miss => fetch_and_set(&cache, key).await?,
//! }
//! ```

pub mod freshness;
pub mod generation;
pub mod lmdb_backend;
pub mod memory_backend;
pub mod resilient;
pub mod traits;
pub mod volatile;

pub use freshness::{CacheRead, Lookup, ReadSource};
pub use generation::{Generation, GenerationTracker};
pub use lmdb_backend::{LmdbPersistentStore, LmdbStoreError};
pub use memory_backend::InMemoryPersistentStore;
pub use resilient::ResilientStore;
pub use traits::{CacheDomain, CacheStats, PersistentStore, RowPredicate, StoredEntry};
pub use volatile::{
    CacheNotification, Committed, Observer, Revalidator, SubscriptionId, Transaction,
    VolatileCache,
};
