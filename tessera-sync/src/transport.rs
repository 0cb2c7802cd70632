//! Transport seam between the cache and the backend.
//!
//! [`Transport`] carries fetches and mutations; [`PushConnector`] opens the
//! server-push subscription. The HTTP and WebSocket implementations live in
//! [`crate::http`] and [`crate::realtime`]; tests script both.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{
    CacheKey, EntityType, FetchError, FieldMetadata, Fields, InvalidationEvent, RawRecord,
    RecordId, RefNames,
};

/// Response body of every fetch:
/// `{ data, fields, metadata: { component: {...} }, ref_data, total }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, FieldMetadata>,
    #[serde(default)]
    pub ref_data: RefNames,
    #[serde(default)]
    pub total: Option<u64>,
}

impl ApiEnvelope {
    /// Envelope carrying a page of records.
    pub fn page(records: &[RawRecord], total: u64) -> Self {
        Self {
            data: serde_json::to_value(records).unwrap_or(Value::Null),
            total: Some(total),
            ..Default::default()
        }
    }

    /// Envelope carrying field metadata.
    pub fn metadata(fields: Vec<String>, metadata: BTreeMap<String, FieldMetadata>) -> Self {
        Self {
            fields,
            metadata,
            ..Default::default()
        }
    }

    pub fn with_ref_data(mut self, ref_data: RefNames) -> Self {
        self.ref_data = ref_data;
        self
    }
}

/// A write sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationRequest {
    /// `PATCH {base}/{entityType}/{id}` with a partial body.
    Update {
        entity_type: EntityType,
        id: RecordId,
        changes: Fields,
    },
    /// `POST {base}/{entityType}`.
    Create {
        entity_type: EntityType,
        fields: Fields,
    },
    /// `DELETE {base}/{entityType}/{id}`.
    Delete {
        entity_type: EntityType,
        id: RecordId,
    },
}

impl MutationRequest {
    pub fn entity_type(&self) -> &EntityType {
        match self {
            Self::Update { entity_type, .. }
            | Self::Create { entity_type, .. }
            | Self::Delete { entity_type, .. } => entity_type,
        }
    }

    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            Self::Update { id, .. } | Self::Delete { id, .. } => Some(id),
            Self::Create { .. } => None,
        }
    }
}

/// Fetch and mutation transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the resource addressed by `key`.
    async fn fetch(&self, key: &CacheKey) -> Result<ApiEnvelope, FetchError>;

    /// Send a mutation. Returns the authoritative record, or `None` when
    /// the backend answers without a body.
    async fn mutate(&self, request: &MutationRequest) -> Result<Option<RawRecord>, FetchError>;
}

/// `{ "entityType": ... }` payload of a SUBSCRIBE message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub entity_type: EntityType,
}

/// Messages exchanged over the push subscription:
/// `{ "type": "INVALIDATE" | "SUBSCRIBE", "payload": {...} }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushMessage {
    Invalidate(InvalidationEvent),
    Subscribe(SubscribePayload),
}

impl PushMessage {
    pub fn subscribe(entity_type: EntityType) -> Self {
        Self::Subscribe(SubscribePayload { entity_type })
    }
}

/// An open push subscription.
#[async_trait]
pub trait PushConnection: Send {
    async fn send(&mut self, message: &PushMessage) -> Result<(), FetchError>;

    /// Next text frame. `None` once the connection is closed.
    async fn next_text(&mut self) -> Option<Result<String, FetchError>>;
}

/// Opens push subscriptions.
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushConnection>, FetchError>;
}
