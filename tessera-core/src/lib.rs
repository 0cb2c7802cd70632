//! Tessera Core - Entity Cache Types
//!
//! Pure data structures shared by the cache tiers and the synchronization
//! engine: canonical keys, entries and their time-to-live windows, records
//! and field metadata, invalidation events, errors and configuration.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod event;
pub mod identity;
pub mod key;
pub mod record;

pub use clock::{Clock, SystemClock};
pub use config::{AuthConfig, PersistenceConfig, ReconnectConfig, TesseraConfig, TtlConfig};
pub use entry::{add_saturating, CacheEntry, EntryState, TtlPolicy};
pub use error::{
    ConfigError, DraftError, FetchError, PersistError, TesseraError, TesseraResult,
};
pub use event::{ChangeOperation, InvalidationEvent, KeyPredicate};
pub use identity::{new_mutation_id, EntityType, MutationId, RecordId, Timestamp};
pub use key::{CacheKey, KeyOperation, KeyParseError, ListParams};
pub use record::{
    CachedValue, DataPayload, FieldMetadata, Fields, LookupDescriptor, MetadataPayload, RawRecord,
    RefNames, SemanticType,
};
