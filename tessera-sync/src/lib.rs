//! Tessera Sync - Fetching, Mutation and Invalidation
//!
//! The synchronization engine on top of the cache tiers in
//! `tessera-storage`:
//!
//! - metadata and data fetchers with request coalescing and timeouts
//! - a pure formatter that turns raw records into display strings
//! - optimistic mutations with mutation-scoped rollback
//! - push invalidation over a WebSocket subscription
//! - a draft store with undo/redo for in-progress edits
//!
//! [`CacheManager`] ties them together; build one from a [`CacheContext`].

pub mod coalesce;
pub mod draft;
pub mod fetcher;
pub mod formatter;
pub mod http;
pub mod invalidation;
pub mod ledger;
pub mod manager;
pub mod mutation;
pub mod realtime;
pub mod telemetry;
pub mod transport;

pub use coalesce::Coalescer;
pub use draft::{Draft, DraftState, DraftStore, FieldChange};
pub use fetcher::{decode_data, decode_metadata, DataFetcher, MetadataFetcher};
pub use formatter::{
    format, format_page, format_record, EnumLabel, FormattedCell, FormattedRecord, LabelLookup,
};
pub use http::HttpTransport;
pub use invalidation::{Delivery, InvalidationChannel};
pub use ledger::PendingLedger;
pub use manager::{CacheContext, CacheManager, HydrateReport, ViewData};
pub use mutation::{MutationCoordinator, MutationOutcome, MutationState};
pub use realtime::{spawn_push_task, WsConnector};
pub use telemetry::init_tracing;
pub use transport::{
    ApiEnvelope, MutationRequest, PushConnection, PushConnector, PushMessage, SubscribePayload,
    Transport,
};
