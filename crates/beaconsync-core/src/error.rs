//! Unified error types for the beaconsync core library.
//!
//! This module provides a unified error type [`SyncError`] that covers every
//! fallible operation outside the scan/send cycle itself. Scan and send
//! failures are *outcomes*, not errors: they are recorded in the state store
//! and resolved by the next scheduled wake (see [`crate::state::OutcomeKind`]).
//!
//! Each module that needs richer detail has its own error type
//! ([`ConfigError`](crate::config::ConfigError),
//! [`StorageError`](crate::storage::StorageError)) which converts into
//! [`SyncError`] via `From`.
//!
//! # Example
//!
//! ```rust
//! use beaconsync_core::error::{Result, SyncError};
//!
//! fn require_target(target: &str) -> Result<()> {
//!     if target.is_empty() {
//!         return Err(SyncError::ConfigIncomplete("target_address".into()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// The unified error type for all beaconsync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // SCHEDULER ERRORS
    // =========================================================================
    /// `start` was issued while a relay loop is already active.
    #[error("Relay is already running. Stop it before starting again.")]
    AlreadyRunning,

    /// The scheduler task has exited and no longer accepts commands.
    #[error("Scheduler is not available; the relay task has shut down")]
    SchedulerUnavailable,

    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded."
    )]
    BluetoothAdapterNotFound,

    /// The Bluetooth stack could not be initialised.
    #[error("Bluetooth initialisation failed: {0}")]
    BluetoothInitFailed(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// A required configuration field has not been provided.
    #[error("Configuration is incomplete: '{0}' is not set")]
    ConfigIncomplete(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// The platform data directory could not be determined.
    #[error("Cannot determine data directory; set 'data_dir' explicitly")]
    DataDirUnavailable,

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for beaconsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Returns `true` if this error is related to Bluetooth.
    #[inline]
    #[must_use]
    pub const fn is_bluetooth_error(&self) -> bool {
        matches!(
            self,
            Self::BluetoothAdapterNotFound | Self::BluetoothInitFailed(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigIncomplete(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(
            self,
            Self::PersistenceError(_) | Self::DataDirUnavailable | Self::IoError(_)
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 409 Conflict - valid request, wrong lifecycle state
            Self::AlreadyRunning => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::ConfigIncomplete(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::DataDirUnavailable | Self::IoError(_) => 500,

            // 503 Service Unavailable - hardware or task gone
            Self::SchedulerUnavailable
            | Self::BluetoothAdapterNotFound
            | Self::BluetoothInitFailed(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::SchedulerUnavailable => "SCHEDULER_UNAVAILABLE",
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::BluetoothInitFailed(_) => "BLUETOOTH_INIT_FAILED",
            Self::ConfigIncomplete(_) => "CONFIG_INCOMPLETE",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::DataDirUnavailable => "DATA_DIR_UNAVAILABLE",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for SyncError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::Missing { field } => Self::ConfigIncomplete(field.to_string()),
            ConfigError::Invalid { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::Storage(e) => Self::from(e),
        }
    }
}

impl From<crate::storage::StorageError> for SyncError {
    fn from(err: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError;
        match err {
            StorageError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {}: {}", path.display(), source))
            }
            StorageError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {}: {}", path.display(), source))
            }
            StorageError::ParseError { path, source } => {
                Self::PersistenceError(format!("Failed to parse {}: {}", path.display(), source))
            }
            StorageError::SerializeError(e) => Self::PersistenceError(e.to_string()),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
