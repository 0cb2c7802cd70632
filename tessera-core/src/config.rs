//! Configuration loading.
//!
//! All fields are required unless explicitly marked optional. Use
//! [`TesseraConfig::local`] for a validated configuration with the standard
//! windows when a file is not wanted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::entry::TtlPolicy;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TesseraConfig {
    pub api_base_url: String,
    pub ws_endpoint: String,
    pub auth: AuthConfig,
    pub request_timeout_ms: u64,
    pub metadata_ttl: TtlConfig,
    pub data_ttl: TtlConfig,
    pub draft_retention_secs: u64,
    pub draft_history_limit: usize,
    pub persistence: PersistenceConfig,
    pub reconnect: ReconnectConfig,
    pub reconcile_after_mutation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub jwt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtlConfig {
    pub stale_after_secs: u64,
    pub evict_after_secs: u64,
}

impl TtlConfig {
    pub fn policy(&self) -> Result<TtlPolicy, ConfigError> {
        TtlPolicy::new(
            Duration::from_secs(self.stale_after_secs),
            Duration::from_secs(self.evict_after_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    /// LMDB directory. `None` keeps the persistent tier in memory.
    pub path: Option<PathBuf>,
    pub max_size_mb: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl TesseraConfig {
    /// Standard windows against the given endpoints, in-memory persistence,
    /// no credentials.
    pub fn local(api_base_url: impl Into<String>, ws_endpoint: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ws_endpoint: ws_endpoint.into(),
            auth: AuthConfig {
                api_key: None,
                jwt: None,
            },
            request_timeout_ms: 10_000,
            metadata_ttl: TtlConfig {
                stale_after_secs: 30 * 60,
                evict_after_secs: 24 * 60 * 60,
            },
            data_ttl: TtlConfig {
                stale_after_secs: 2 * 60,
                evict_after_secs: 60 * 60,
            },
            draft_retention_secs: 7 * 24 * 60 * 60,
            draft_history_limit: 100,
            persistence: PersistenceConfig {
                path: None,
                max_size_mb: 64,
            },
            reconnect: ReconnectConfig {
                initial_ms: 250,
                max_ms: 30_000,
                multiplier: 2.0,
                jitter_ms: 250,
            },
            reconcile_after_mutation: false,
        }
    }

    /// Load from `--config <path>` or `TESSERA_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn draft_retention(&self) -> Duration {
        Duration::from_secs(self.draft_retention_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(invalid("api_base_url", &self.api_base_url, "must not be empty"));
        }
        if self.ws_endpoint.trim().is_empty() {
            return Err(invalid("ws_endpoint", &self.ws_endpoint, "must not be empty"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "0", "must be > 0"));
        }
        self.metadata_ttl.policy().map_err(|_| {
            invalid(
                "metadata_ttl",
                &format!("{:?}", self.metadata_ttl),
                "stale_after_secs must be < evict_after_secs",
            )
        })?;
        self.data_ttl.policy().map_err(|_| {
            invalid(
                "data_ttl",
                &format!("{:?}", self.data_ttl),
                "stale_after_secs must be < evict_after_secs",
            )
        })?;
        if self.draft_retention_secs == 0 {
            return Err(invalid("draft_retention_secs", "0", "must be > 0"));
        }
        if self.draft_history_limit == 0 {
            return Err(invalid("draft_history_limit", "0", "must be > 0"));
        }
        if self.persistence.max_size_mb == 0 {
            return Err(invalid("persistence.max_size_mb", "0", "must be > 0"));
        }
        if let Some(path) = &self.persistence.path {
            if path.as_os_str().is_empty() {
                return Err(invalid("persistence.path", "", "must not be empty when set"));
            }
        }
        if self.reconnect.initial_ms == 0 {
            return Err(invalid("reconnect.initial_ms", "0", "must be > 0"));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(invalid(
                "reconnect.max_ms",
                &self.reconnect.max_ms.to_string(),
                "must be >= initial_ms",
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(invalid(
                "reconnect.multiplier",
                &self.reconnect.multiplier.to_string(),
                "must be >= 1.0",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("TESSERA_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config_is_valid() {
        let config = TesseraConfig::local("http://localhost:8080/api", "ws://localhost:8080/ws");
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_inverted_data_ttl() {
        let mut config = TesseraConfig::local("http://a", "ws://a");
        config.data_ttl = TtlConfig {
            stale_after_secs: 600,
            evict_after_secs: 60,
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "data_ttl"));
    }

    #[test]
    fn test_rejects_bad_reconnect() {
        let mut config = TesseraConfig::local("http://a", "ws://a");
        config.reconnect.max_ms = 1;
        assert!(config.validate().is_err());

        let mut config = TesseraConfig::local("http://a", "ws://a");
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = TesseraConfig::local("http://a", "ws://a");
        let text = toml::to_string(&config).unwrap();
        let parsed = TesseraConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let config = TesseraConfig::local("http://a", "ws://a");
        let mut text = toml::to_string(&config).unwrap();
        text = format!("surprise = true\n{text}");
        assert!(matches!(
            TesseraConfig::from_toml(&text),
            Err(ConfigError::Parse { .. })
        ));
    }
}
