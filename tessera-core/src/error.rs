//! Error types for Tessera operations

use std::collections::BTreeMap;

use thiserror::Error;

use crate::identity::{EntityType, RecordId};
use crate::key::KeyParseError;

/// Errors returned by fetchers and mutation requests.
///
/// `Clone` so a single coalesced response can be handed to every waiting
/// caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Transient transport failure or timeout. Retryable.
    #[error("Network error: {reason}")]
    Network { reason: String },

    /// Credentials rejected. Never retried silently.
    #[error("Authentication failed (status {status}): {reason}")]
    Auth { status: u16, reason: String },

    /// The backend rejected a mutation.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field_errors: BTreeMap<String, String>,
    },

    /// The entity no longer exists on the server.
    #[error("Not found: {entity_type} {id:?}")]
    NotFound {
        entity_type: EntityType,
        id: Option<RecordId>,
    },

    /// The response body did not match the expected envelope.
    #[error("Malformed response: {reason}")]
    Decode { reason: String },
}

impl FetchError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field_errors: BTreeMap::new(),
        }
    }

    /// Whether a background retry may be attempted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Errors of the persistent tier. Never propagated to readers: the cache
/// degrades to network-only operation instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistError {
    #[error("Persistent store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Persistent store quota exceeded")]
    QuotaExceeded,

    #[error("Corrupt row {key} in {domain}: {reason}")]
    Corrupt {
        domain: String,
        key: String,
        reason: String,
    },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or TESSERA_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Draft lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DraftError {
    #[error("No draft for {entity_type} {id}")]
    NoDraft { entity_type: EntityType, id: RecordId },

    #[error("Draft for {entity_type} {id} is being saved")]
    SaveInProgress { entity_type: EntityType, id: RecordId },

    #[error("Nothing to {action}")]
    HistoryExhausted { action: &'static str },
}

/// Master error type for all Tessera errors.
#[derive(Debug, Clone, Error)]
pub enum TesseraError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Draft error: {0}")]
    Draft(#[from] DraftError),

    #[error("Key error: {0}")]
    Key(#[from] KeyParseError),

    #[error("Cache manager has been torn down")]
    TornDown,
}

/// Result type alias for Tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;
