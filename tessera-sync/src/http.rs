//! HTTP transport over reqwest.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use tessera_core::{
    AuthConfig, CacheKey, ConfigError, EntityType, FetchError, KeyOperation, RawRecord, RecordId,
    TesseraConfig,
};
use tracing::debug;

use crate::transport::{ApiEnvelope, MutationRequest, Transport};

const CONTENT_DATA: &str = "data";
const CONTENT_METADATA: &str = "metadata";

/// REST transport: `GET/POST/PATCH/DELETE {base}/{entityType}[/{id}]`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    auth_header: HeaderMap,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: &TesseraConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "request_timeout_ms".to_string(),
                value: config.request_timeout_ms.to_string(),
                reason: e.to_string(),
            })?;

        let base = config.api_base_url.trim_end_matches('/');
        let base_url = Url::parse(base).map_err(|e| ConfigError::InvalidValue {
            field: "api_base_url".to_string(),
            value: config.api_base_url.clone(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url".to_string(),
                value: config.api_base_url.clone(),
                reason: "not a base URL".to_string(),
            });
        }

        Ok(Self {
            client,
            base_url,
            auth_header: build_auth_headers(&config.auth)?,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// URL and query of a fetch.
    pub fn fetch_url(&self, key: &CacheKey) -> Url {
        let entity = key.entity_type().as_str();
        let mut query: Vec<(String, String)> = Vec::new();
        let mut url = match key.operation() {
            KeyOperation::Metadata => {
                query.push(("content".into(), CONTENT_METADATA.into()));
                self.url(&[entity])
            }
            KeyOperation::List => {
                if let Some(params) = key.list_params() {
                    query.push(("limit".into(), params.limit.to_string()));
                    query.push(("offset".into(), params.offset.to_string()));
                    if let Some(sort) = params.sort {
                        query.push(("sort".into(), sort));
                    }
                    query.extend(params.filters);
                }
                query.push(("content".into(), CONTENT_DATA.into()));
                self.url(&[entity])
            }
            KeyOperation::Detail => {
                query.push(("content".into(), CONTENT_DATA.into()));
                let id = key.record_id().unwrap_or_else(|| RecordId::new(""));
                self.url(&[entity, id.as_str()])
            }
            KeyOperation::Children => {
                let parent = key.parent_id().unwrap_or_else(|| RecordId::new(""));
                query.push(("codes".into(), key.child_codes().join(",")));
                query.push(("content".into(), CONTENT_DATA.into()));
                self.url(&[entity, parent.as_str(), "children"])
            }
        };
        url.query_pairs_mut().extend_pairs(query);
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        entity_type: &EntityType,
        id: Option<&RecordId>,
    ) -> Result<Option<Value>, FetchError> {
        debug!(%method, url = %url, "sending request");
        let mut request = self
            .client
            .request(method, url)
            .headers(self.auth_header.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status(status, &text, entity_type, id));
        }
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| FetchError::Decode {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, key: &CacheKey) -> Result<ApiEnvelope, FetchError> {
        let body = self
            .send(
                Method::GET,
                self.fetch_url(key),
                None,
                key.entity_type(),
                key.record_id().as_ref(),
            )
            .await?
            .unwrap_or(Value::Null);
        if body.is_null() {
            return Ok(ApiEnvelope::default());
        }
        serde_json::from_value(body).map_err(|e| FetchError::Decode {
            reason: e.to_string(),
        })
    }

    async fn mutate(&self, request: &MutationRequest) -> Result<Option<RawRecord>, FetchError> {
        let (method, url, body) = match request {
            MutationRequest::Update {
                entity_type,
                id,
                changes,
            } => (
                Method::PATCH,
                self.url(&[entity_type.as_str(), id.as_str()]),
                Some(Value::Object(changes.clone())),
            ),
            MutationRequest::Create {
                entity_type,
                fields,
            } => (
                Method::POST,
                self.url(&[entity_type.as_str()]),
                Some(Value::Object(fields.clone())),
            ),
            MutationRequest::Delete { entity_type, id } => (
                Method::DELETE,
                self.url(&[entity_type.as_str(), id.as_str()]),
                None,
            ),
        };

        let body = self
            .send(
                method,
                url,
                body.as_ref(),
                request.entity_type(),
                request.record_id(),
            )
            .await?;
        match body {
            None => Ok(None),
            Some(value) => decode_mutation_record(value),
        }
    }
}

/// A mutation answer is either the bare record or an envelope around it.
fn decode_mutation_record(value: Value) -> Result<Option<RawRecord>, FetchError> {
    let record = match value {
        Value::Object(mut map) if map.contains_key("data") && !map.contains_key("id") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    if record.is_null() {
        return Ok(None);
    }
    serde_json::from_value(record)
        .map(Some)
        .map_err(|e| FetchError::Decode {
            reason: e.to_string(),
        })
}

fn map_transport_error(e: reqwest::Error) -> FetchError {
    if e.is_decode() {
        FetchError::Decode {
            reason: e.to_string(),
        }
    } else {
        FetchError::network(e.to_string())
    }
}

/// Map a non-success status to a typed error.
pub fn map_status(
    status: StatusCode,
    body: &str,
    entity_type: &EntityType,
    id: Option<&RecordId>,
) -> FetchError {
    match status.as_u16() {
        401 | 403 => FetchError::Auth {
            status: status.as_u16(),
            reason: message_of(body).unwrap_or_else(|| status.to_string()),
        },
        404 => FetchError::NotFound {
            entity_type: entity_type.clone(),
            id: id.cloned(),
        },
        400 | 409 | 422 => {
            let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
            let mut field_errors = BTreeMap::new();
            if let Some(errors) = parsed.get("errors").and_then(Value::as_object) {
                for (field, message) in errors {
                    let message = match message {
                        Value::String(s) => s.clone(),
                        Value::Array(items) => items
                            .iter()
                            .map(|m| m.as_str().map(str::to_string).unwrap_or_else(|| m.to_string()))
                            .collect::<Vec<_>>()
                            .join("; "),
                        other => other.to_string(),
                    };
                    field_errors.insert(field.clone(), message);
                }
            }
            FetchError::Validation {
                message: message_of(body).unwrap_or_else(|| status.to_string()),
                field_errors,
            }
        }
        _ => FetchError::network(format!("HTTP {}: {}", status.as_u16(), body.trim())),
    }
}

fn message_of(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

/// `x-api-key` and `authorization: Bearer` headers from credentials.
pub fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, ConfigError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| ConfigError::InvalidValue {
                field: "auth.api_key".to_string(),
                value: "<redacted>".to_string(),
                reason: e.to_string(),
            })?,
        );
    }
    if let Some(jwt) = &auth.jwt {
        let value = format!("Bearer {}", jwt);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| ConfigError::InvalidValue {
                field: "auth.jwt".to_string(),
                value: "<redacted>".to_string(),
                reason: e.to_string(),
            })?,
        );
    }
    Ok(headers)
}
