//! Metadata and data fetchers.
//!
//! Each fetch goes through the transport with a bounded timeout. Callers
//! that need concurrent fetches of one key to share a request coalesce
//! above this layer.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tessera_core::{
    CacheKey, CachedValue, DataPayload, EntityType, FetchError, KeyOperation, MetadataPayload,
    RawRecord,
};
use tracing::debug;

use crate::transport::{ApiEnvelope, Transport};

async fn fetch_with_timeout(
    transport: &dyn Transport,
    key: &CacheKey,
    timeout: Duration,
) -> Result<ApiEnvelope, FetchError> {
    debug!(key = %key, "fetching");
    match tokio::time::timeout(timeout, transport.fetch(key)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::network(format!(
            "request timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Fetches field metadata.
pub struct MetadataFetcher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl MetadataFetcher {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn fetch(&self, entity_type: &EntityType) -> Result<MetadataPayload, FetchError> {
        let key = CacheKey::metadata(entity_type.clone());
        let envelope = fetch_with_timeout(self.transport.as_ref(), &key, self.timeout).await?;
        Ok(decode_metadata(envelope))
    }
}

/// Fetches list, detail and children data.
pub struct DataFetcher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl DataFetcher {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn fetch(&self, key: &CacheKey) -> Result<CachedValue, FetchError> {
        if key.operation() == KeyOperation::Metadata {
            return Err(FetchError::Decode {
                reason: format!("{key} is not a data key"),
            });
        }
        let envelope = fetch_with_timeout(self.transport.as_ref(), key, self.timeout).await?;
        decode_data(key, envelope)
    }
}

/// Field order comes from `fields`; when the backend omits it, descriptor
/// names are used in their (sorted) map order.
pub fn decode_metadata(envelope: ApiEnvelope) -> MetadataPayload {
    let fields = if envelope.fields.is_empty() {
        envelope.metadata.keys().cloned().collect()
    } else {
        envelope.fields
    };
    MetadataPayload {
        fields,
        components: envelope.metadata,
    }
}

fn decode_records(data: Value) -> Result<Vec<RawRecord>, FetchError> {
    match data {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(data).map_err(|e| FetchError::Decode {
            reason: format!("invalid records: {e}"),
        }),
        Value::Object(_) => serde_json::from_value::<RawRecord>(data)
            .map(|record| vec![record])
            .map_err(|e| FetchError::Decode {
                reason: format!("invalid record: {e}"),
            }),
        other => Err(FetchError::Decode {
            reason: format!("expected records, got {other}"),
        }),
    }
}

/// Decode a data envelope into the shape held for `key`.
pub fn decode_data(key: &CacheKey, envelope: ApiEnvelope) -> Result<CachedValue, FetchError> {
    let mut records = decode_records(envelope.data)?;
    match key.operation() {
        KeyOperation::Detail => {
            let id = key.record_id();
            let position = match &id {
                Some(id) => records.iter().position(|r| &r.id == id),
                None => (!records.is_empty()).then_some(0),
            };
            match position {
                Some(index) => Ok(CachedValue::Record {
                    record: records.swap_remove(index),
                    ref_names: envelope.ref_data,
                }),
                None => Err(FetchError::NotFound {
                    entity_type: key.entity_type().clone(),
                    id,
                }),
            }
        }
        KeyOperation::List | KeyOperation::Children => {
            let total = envelope.total.unwrap_or(records.len() as u64);
            Ok(CachedValue::Page(DataPayload {
                records,
                ref_names: envelope.ref_data,
                total,
            }))
        }
        KeyOperation::Metadata => Err(FetchError::Decode {
            reason: format!("{key} is not a data key"),
        }),
    }
}
