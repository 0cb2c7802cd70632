//! Tessera Storage - Cache Tiers
//!
//! Volatile and persistent storage for cached metadata, record data,
//! drafts and entity display names.

pub mod cache;

use std::sync::Arc;

use tessera_core::PersistenceConfig;
use tracing::{info, warn};

pub use cache::{
    CacheDomain, CacheNotification, CacheRead, CacheStats, Committed, Generation,
    GenerationTracker, InMemoryPersistentStore, LmdbPersistentStore, LmdbStoreError, Lookup,
    Observer, PersistentStore, ReadSource, ResilientStore, Revalidator, RowPredicate,
    StoredEntry, SubscriptionId, Transaction, VolatileCache,
};

/// Open the persistent tier described by `config`.
///
/// Without a path the store lives in memory. An LMDB store that fails to
/// open is logged and replaced by an in-memory one.
pub fn open_persistent_store(config: &PersistenceConfig) -> Arc<dyn PersistentStore> {
    let Some(path) = &config.path else {
        return Arc::new(InMemoryPersistentStore::new());
    };
    match LmdbPersistentStore::new(path, config.max_size_mb) {
        Ok(store) => {
            info!(path = %path.display(), max_size_mb = config.max_size_mb, "opened persistent cache");
            Arc::new(store)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "persistent cache unavailable, using memory");
            Arc::new(InMemoryPersistentStore::new())
        }
    }
}
