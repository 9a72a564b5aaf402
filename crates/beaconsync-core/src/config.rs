//! Relay configuration management.
//!
//! Handles loading, saving, and validating the relay configuration:
//! - Bluetooth address of the beacon to capture
//! - Endpoint URL the payload is relayed to
//! - Application id / secret pair sent as request headers
//!
//! The configuration lives in the shared [`KvStore`] under flat keys. The
//! scheduler takes a snapshot at the start of every cycle, so a
//! reconfiguration only ever applies from the next cycle onward.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::storage::{KvStore, KvValue, StorageError};

/// Storage keys for the relay configuration.
pub mod keys {
    /// Target device address.
    pub const MAC_ADDRESS: &str = "MAC_ADDRESS";
    /// Application id header value.
    pub const APP_ID: &str = "APP_ID";
    /// Application secret header value.
    pub const APP_KEY: &str = "APP_KEY";
    /// Relay endpoint.
    pub const API_URL: &str = "API_URL";
}

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("MAC address regex is valid")
});

/// Errors raised while validating or persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field is empty.
    #[error("{field} is required")]
    Missing {
        /// Field name.
        field: &'static str,
    },

    /// A field has an invalid value.
    #[error("{field}: {message}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Settings could not be loaded.
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    /// Persisting the configuration failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Returns `true` if `address` is a colon-separated Bluetooth address.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

/// Returns `true` if `url` parses as an absolute `http`/`https` URL.
#[must_use]
pub fn is_valid_endpoint(url: &str) -> bool {
    reqwest::Url::parse(url).is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
}

/// Relay configuration: which beacon to capture and where to send it.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "target_address": "AA:BB:CC:DD:EE:FF",
    "api_url": "https://api.example.com/1.1/classes/Beacon",
    "app_id": "my-app-id",
    "app_key": "my-app-key"
}))]
pub struct RelayConfig {
    /// Bluetooth address of the beacon (XX:XX:XX:XX:XX:XX).
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub target_address: String,

    /// Endpoint the payload is POSTed to.
    #[schema(example = "https://api.example.com/1.1/classes/Beacon")]
    pub api_url: String,

    /// Application id, sent as the `X-LC-Id` header.
    #[schema(example = "my-app-id")]
    pub app_id: String,

    /// Application secret, sent as the `X-LC-Key` header.
    #[schema(example = "my-app-key")]
    pub app_key: String,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("target_address", &self.target_address)
            .field("api_url", &self.api_url)
            .field("app_id", &self.app_id)
            .field("app_key", &"<redacted>")
            .finish()
    }
}

impl RelayConfig {
    /// Check every field, returning the first problem found.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for empty fields and
    /// [`ConfigError::Invalid`] for malformed address or URL.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.target_address.is_empty() {
            return Err(ConfigError::Missing {
                field: "target_address",
            });
        }
        if !is_valid_mac_address(&self.target_address) {
            return Err(ConfigError::Invalid {
                field: "target_address",
                message: "must be in format XX:XX:XX:XX:XX:XX".to_string(),
            });
        }
        if self.api_url.is_empty() {
            return Err(ConfigError::Missing { field: "api_url" });
        }
        if !is_valid_endpoint(&self.api_url) {
            return Err(ConfigError::Invalid {
                field: "api_url",
                message: "must be an absolute http(s) URL".to_string(),
            });
        }
        if self.app_id.is_empty() {
            return Err(ConfigError::Missing { field: "app_id" });
        }
        if self.app_key.is_empty() {
            return Err(ConfigError::Missing { field: "app_key" });
        }
        Ok(())
    }

    /// Returns `true` if [`validate`](Self::validate) would succeed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }

    /// Overlay the non-empty fields of `patch` onto `self`.
    ///
    /// Used when a start command only carries some of the fields: whatever
    /// it leaves out keeps its stored value.
    #[must_use]
    pub fn merged_with(mut self, patch: &ConfigPatch) -> Self {
        if let Some(v) = patch.target_address.as_deref().filter(|v| !v.is_empty()) {
            self.target_address = v.to_uppercase();
        }
        if let Some(v) = patch.api_url.as_deref().filter(|v| !v.is_empty()) {
            self.api_url = v.to_string();
        }
        if let Some(v) = patch.app_id.as_deref().filter(|v| !v.is_empty()) {
            self.app_id = v.to_string();
        }
        if let Some(v) = patch.app_key.as_deref().filter(|v| !v.is_empty()) {
            self.app_key = v.to_string();
        }
        self
    }
}

/// Partial configuration; absent fields leave the stored value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ConfigPatch {
    /// Bluetooth address of the beacon.
    #[schema(example = "AA:BB:CC:DD:EE:FF")]
    pub target_address: Option<String>,

    /// Relay endpoint.
    pub api_url: Option<String>,

    /// Application id.
    pub app_id: Option<String>,

    /// Application secret.
    pub app_key: Option<String>,
}

/// Holds the current relay configuration and persists changes.
///
/// Shared read access is cheap; writes go through the scheduler only.
#[derive(Debug)]
pub struct ConfigStore {
    current: RwLock<RelayConfig>,
    kv: Arc<KvStore>,
}

impl ConfigStore {
    /// Load the configuration from `kv`. Missing keys load as empty strings.
    #[must_use]
    pub fn load(kv: Arc<KvStore>) -> Self {
        let current = RelayConfig {
            target_address: kv.get_str(keys::MAC_ADDRESS).unwrap_or_default(),
            api_url: kv.get_str(keys::API_URL).unwrap_or_default(),
            app_id: kv.get_str(keys::APP_ID).unwrap_or_default(),
            app_key: kv.get_str(keys::APP_KEY).unwrap_or_default(),
        };
        Self {
            current: RwLock::new(current),
            kv,
        }
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn snapshot(&self) -> RelayConfig {
        self.current.read().clone()
    }

    /// Validate, persist and install `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (nothing is written) or if the
    /// store cannot be committed (the new value is still installed in memory).
    pub fn update(&self, config: RelayConfig) -> ConfigResult<()> {
        config.validate()?;

        let result = self.kv.apply([
            (keys::MAC_ADDRESS, Some(KvValue::from(config.target_address.as_str()))),
            (keys::API_URL, Some(KvValue::from(config.api_url.as_str()))),
            (keys::APP_ID, Some(KvValue::from(config.app_id.as_str()))),
            (keys::APP_KEY, Some(KvValue::from(config.app_key.as_str()))),
        ]);

        tracing::info!(target_address = %config.target_address, api_url = %config.api_url, "Relay configuration updated");
        *self.current.write() = config;

        result.map_err(ConfigError::from)
    }
}
