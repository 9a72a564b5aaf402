//! # beaconsync-core
//!
//! Core logic for the beaconsync beacon relay.
//!
//! On a fixed cadence the relay wakes, runs one bounded scan for a single
//! configured BLE beacon, POSTs whatever that beacon advertised to a remote
//! endpoint, records the outcome and arms the next wake. A wake lease keeps
//! the host from suspending while a cycle is in progress.
//!
//! ## Architecture
//!
//! - [`scheduler`] - the cycle state machine; one actor task serialising
//!   timer, scan, send and command events
//! - [`scanner`] - single-flight bounded scan over a [`Radio`] backend
//! - [`sender`] - single-flight relay request over a [`Transport`]
//! - [`lease`] - exclusive wake lease with a safety-net expiry
//! - [`timer`] - wake timer and monotonic-to-UTC mapping
//! - [`state`] - cycle record store with change subscriptions
//! - [`config`] - relay configuration validation and storage
//! - [`settings`] - daemon settings (listen address, data dir, timing policy)
//! - [`storage`] - flat durable key-value store
//! - [`bluetooth`] - BlueZ radio backend (feature `bluetooth`)
//! - [`mock`] - scripted radio for tests and hardware-less runs
//! - [`error`] - unified error type

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod lease;
pub mod mock;
pub mod scanner;
pub mod scheduler;
pub mod sender;
pub mod settings;
pub mod state;
pub mod storage;
pub mod timer;
pub mod types;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::BluerRadio;
pub use config::{
    is_valid_endpoint, is_valid_mac_address, ConfigError, ConfigPatch, ConfigResult, ConfigStore,
    RelayConfig,
};
pub use error::{Result, SyncError};
pub use lease::{NoopInhibitor, SleepInhibitor, SystemdInhibitor, WakeLease};
pub use mock::{SimEvent, SimulatedRadio};
pub use scanner::{Radio, RadioError, ScanFailure, ScanOutcome, Scanner};
pub use scheduler::{Phase, SchedulerDeps, SchedulerHandle, SchedulerSnapshot};
pub use sender::{decode_hex, encode_hex, HttpTransport, RelayRequest, SendOutcome, Transport};
pub use settings::{LeaseBackend, PolicyConfig, Settings};
pub use state::{
    CycleState, OutcomeKind, ServiceStatus, StateEvent, StateStore, StateUpdate, Subscription,
};
pub use storage::{default_data_dir, KvStore};
pub use timer::{system_clock, MonotonicClock, WakeClock};
pub use types::HealthResponse;
