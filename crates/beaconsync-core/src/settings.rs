//! Daemon settings.
//!
//! Settings are everything that is *not* relay configuration: where to keep
//! data, where to listen, and the cycle timing policy. They are read once at
//! startup from an optional TOML file overlaid with `BEACONSYNC__*`
//! environment variables (double underscore separates nested keys, e.g.
//! `BEACONSYNC__POLICY__SCAN_PERIOD_SECS=60`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigResult};

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "BEACONSYNC";

/// Which sleep-inhibition mechanism backs the wake lease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    /// `systemd-inhibit` child process.
    #[default]
    Systemd,
    /// Track the lease without touching the host.
    None,
}

/// Cycle timing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Delay between the end of one cycle and the next wake.
    pub scan_period_secs: u64,
    /// How long a single scan may run before reporting a timeout.
    pub scan_timeout_secs: u64,
    /// Upper bound on one relay request, connect to last body byte.
    pub send_timeout_secs: u64,
    /// Safety net after which the wake lease lapses on its own.
    pub wake_lease_max_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            scan_period_secs: 180,
            scan_timeout_secs: 60,
            send_timeout_secs: 30,
            wake_lease_max_secs: 120,
        }
    }
}

impl PolicyConfig {
    /// Period between cycles.
    #[must_use]
    pub const fn scan_period(&self) -> Duration {
        Duration::from_secs(self.scan_period_secs)
    }

    /// Scan timeout.
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Send timeout.
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Wake lease safety net.
    #[must_use]
    pub const fn wake_lease_max(&self) -> Duration {
        Duration::from_secs(self.wake_lease_max_secs)
    }

    /// Reject zero durations and a lease shorter than a full cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("policy.scan_period_secs", self.scan_period_secs),
            ("policy.scan_timeout_secs", self.scan_timeout_secs),
            ("policy.send_timeout_secs", self.send_timeout_secs),
            ("policy.wake_lease_max_secs", self.wake_lease_max_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if self.scan_timeout_secs + self.send_timeout_secs > self.wake_lease_max_secs {
            return Err(ConfigError::Invalid {
                field: "policy.wake_lease_max_secs",
                message: format!(
                    "must cover scan_timeout_secs + send_timeout_secs ({}s)",
                    self.scan_timeout_secs + self.send_timeout_secs
                ),
            });
        }

        Ok(())
    }
}

/// Top-level daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address of the local control API.
    pub listen_addr: SocketAddr,
    /// Directory holding the key-value store. Platform default when unset.
    pub data_dir: Option<PathBuf>,
    /// Production logging (JSON file + compact stdout).
    pub production: bool,
    /// Resume relaying on launch if the last persisted status was active.
    pub resume_on_start: bool,
    /// Wake lease backend.
    pub lease_backend: LeaseBackend,
    /// Cycle timing.
    pub policy: PolicyConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: None,
            production: false,
            resume_on_start: true,
            lease_backend: LeaseBackend::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (optional file) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or the result fails
    /// validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(default) = default_settings_path() {
                    builder = builder.add_source(config::File::from(default).required(false));
                }
            }
        }

        let settings: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        settings.policy.validate()?;
        Ok(settings)
    }

    /// Render these settings as TOML, for `--print-default-config`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Default settings file location, if the platform has a config directory.
#[must_use]
pub fn default_settings_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Some(PathBuf::from("/etc/beaconsync/beaconsync.toml"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beaconsync")
            .map(|dirs| dirs.config_dir().join("beaconsync.toml"))
    }
}
