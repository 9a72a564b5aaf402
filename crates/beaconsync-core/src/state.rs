//! Cycle state record and its single-writer store.
//!
//! The [`StateStore`] owns the latest [`CycleState`]. Every
//! [`update`](StateStore::update) is one unit: merge, persist, publish.
//! Subscribers get their own unbounded queue, so each one sees every event in
//! the order it was issued regardless of how slowly it drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use utoipa::ToSchema;

use crate::storage::{KvStore, KvValue};

/// Storage keys for the cycle state.
pub mod keys {
    /// Current status.
    pub const STATUS: &str = "serviceStatus";
    /// Last outcome kind.
    pub const LAST_OUTCOME: &str = "lastOutcome";
    /// Argument of the last outcome (HTTP code, radio error code, message).
    pub const LAST_OUTCOME_ARG: &str = "lastOutcomeArg";
    /// Next wake as epoch milliseconds, `0` when unset.
    pub const NEXT_WAKE: &str = "nextScanTimestamp";
}

/// What the relay is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Not running.
    #[default]
    Stopped,
    /// Started; first cycle is about to begin.
    Started,
    /// A scan is in flight.
    Scanning,
    /// A captured payload is being relayed.
    Sending,
    /// Idle until the next wake.
    Waiting,
}

impl ServiceStatus {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Started => "started",
            Self::Scanning => "scanning",
            Self::Sending => "sending",
            Self::Waiting => "waiting",
        }
    }

    /// Parse the storage form; unknown values read as `Stopped`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "started" => Self::Started,
            "scanning" => Self::Scanning,
            "sending" => Self::Sending,
            "waiting" => Self::Waiting,
            _ => Self::Stopped,
        }
    }

    /// Whether the relay loop is considered active.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Kind of the most recent cycle outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// No cycle has completed since the last start.
    #[default]
    None,
    /// Payload relayed; argument is the HTTP status code.
    Success,
    /// Endpoint answered with a non-2xx status; argument is the code.
    ServerError,
    /// The request never completed; argument is the transport message.
    NetworkError,
    /// Bluetooth was off, so no scan was attempted.
    RadioDisabled,
    /// No matching advertisement within the scan timeout.
    ScanTimeout,
    /// The radio stack reported a scan failure; argument is its code.
    ScanFailed,
    /// The beacon was seen but advertised no bytes.
    EmptyPayload,
}

impl OutcomeKind {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Success => "success",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
            Self::RadioDisabled => "radio_disabled",
            Self::ScanTimeout => "scan_timeout",
            Self::ScanFailed => "scan_failed",
            Self::EmptyPayload => "empty_payload",
        }
    }

    /// Parse the storage form; unknown values read as `None`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "success" => Self::Success,
            "server_error" => Self::ServerError,
            "network_error" => Self::NetworkError,
            "radio_disabled" => Self::RadioDisabled,
            "scan_timeout" => Self::ScanTimeout,
            "scan_failed" => Self::ScanFailed,
            "empty_payload" => Self::EmptyPayload,
            _ => Self::None,
        }
    }
}

/// A recorded outcome: kind plus optional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Outcome kind.
    pub kind: OutcomeKind,
    /// Optional argument (status code, error code or message).
    pub arg: Option<String>,
}

impl Outcome {
    /// Outcome without an argument.
    #[must_use]
    pub const fn bare(kind: OutcomeKind) -> Self {
        Self { kind, arg: None }
    }

    /// Outcome with an argument.
    #[must_use]
    pub fn with_arg(kind: OutcomeKind, arg: impl ToString) -> Self {
        Self {
            kind,
            arg: Some(arg.to_string()),
        }
    }
}

/// The persisted cycle record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "status": "waiting",
    "last_outcome": "success",
    "last_outcome_arg": "200",
    "next_wake_at_utc": "2025-01-15T03:33:00Z"
}))]
pub struct CycleState {
    /// Current status.
    pub status: ServiceStatus,

    /// Kind of the last outcome.
    pub last_outcome: OutcomeKind,

    /// Argument of the last outcome.
    #[schema(example = "200")]
    pub last_outcome_arg: Option<String>,

    /// When the next cycle is due, if one is armed.
    pub next_wake_at_utc: Option<DateTime<Utc>>,
}

impl CycleState {
    /// The record published on stop.
    #[must_use]
    pub fn stopped() -> Self {
        Self::default()
    }

    fn load(kv: &KvStore) -> Self {
        let next_wake_at_utc = kv
            .get_long(keys::NEXT_WAKE)
            .filter(|ms| *ms > 0)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Self {
            status: kv
                .get_str(keys::STATUS)
                .map_or(ServiceStatus::Stopped, |s| ServiceStatus::parse(&s)),
            last_outcome: kv
                .get_str(keys::LAST_OUTCOME)
                .map_or(OutcomeKind::None, |s| OutcomeKind::parse(&s)),
            last_outcome_arg: kv.get_str(keys::LAST_OUTCOME_ARG),
            next_wake_at_utc,
        }
    }

    fn persist(&self, kv: &KvStore) -> Result<(), crate::storage::StorageError> {
        kv.apply([
            (keys::STATUS, Some(KvValue::from(self.status.as_str()))),
            (keys::LAST_OUTCOME, Some(KvValue::from(self.last_outcome.as_str()))),
            (
                keys::LAST_OUTCOME_ARG,
                self.last_outcome_arg.clone().map(KvValue::from),
            ),
            (
                keys::NEXT_WAKE,
                Some(KvValue::from(
                    self.next_wake_at_utc.map_or(0, |t| t.timestamp_millis()),
                )),
            ),
        ])
    }
}

/// Partial update of the cycle record.
///
/// `None` fields are left unchanged. Because the outcome argument is itself
/// optional, clearing it needs the explicit [`clear_outcome_arg`] flag.
///
/// [`clear_outcome_arg`]: StateUpdate::clear_outcome_arg
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateUpdate {
    /// New status.
    pub status: Option<ServiceStatus>,
    /// New outcome kind.
    pub last_outcome: Option<OutcomeKind>,
    /// New outcome argument.
    pub last_outcome_arg: Option<String>,
    /// Drop the stored outcome argument (applied before `last_outcome_arg`).
    pub clear_outcome_arg: bool,
    /// New next-wake value; `Some(None)` unsets it.
    pub next_wake_at_utc: Option<Option<DateTime<Utc>>>,
}

impl StateUpdate {
    /// Update touching only the status.
    #[must_use]
    pub fn status(status: ServiceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Record `outcome`, replacing both kind and argument.
    #[must_use]
    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.last_outcome = Some(outcome.kind);
        self.clear_outcome_arg = true;
        self.last_outcome_arg = outcome.arg;
        self
    }

    /// Set (or unset) the next wake.
    #[must_use]
    pub fn next_wake(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_wake_at_utc = Some(at);
        self
    }

    /// The full reset published on stop.
    #[must_use]
    pub fn reset() -> Self {
        Self::status(ServiceStatus::Stopped)
            .outcome(Outcome::bare(OutcomeKind::None))
            .next_wake(None)
    }

    fn apply_to(self, state: &mut CycleState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(kind) = self.last_outcome {
            state.last_outcome = kind;
        }
        if self.clear_outcome_arg {
            state.last_outcome_arg = None;
        }
        if let Some(arg) = self.last_outcome_arg {
            state.last_outcome_arg = Some(arg);
        }
        if let Some(next) = self.next_wake_at_utc {
            state.next_wake_at_utc = next;
        }
    }
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// The cycle record changed; carries the full committed record.
    StatusChanged(CycleState),
    /// A payload was captured; informational.
    PayloadReceived {
        /// Lowercase hex of the captured bytes.
        hex: String,
    },
}

/// Identifies a subscription for [`StateStore::unsubscribe`].
pub type SubscriptionId = u64;

/// A live subscription to state events.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<StateEvent>,
}

impl Subscription {
    /// Subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event; `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<StateEvent> {
        self.rx.recv().await
    }

    /// Unwrap into the raw receiver (for stream adapters).
    #[must_use]
    pub fn into_receiver(self) -> mpsc::UnboundedReceiver<StateEvent> {
        self.rx
    }
}

/// Single-writer store for [`CycleState`].
#[derive(Debug)]
pub struct StateStore {
    record: Mutex<CycleState>,
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<StateEvent>)>>,
    next_id: AtomicU64,
    kv: Arc<KvStore>,
}

impl StateStore {
    /// Load the last persisted record from `kv`.
    #[must_use]
    pub fn load(kv: Arc<KvStore>) -> Self {
        let record = CycleState::load(&kv);
        tracing::debug!(status = record.status.as_str(), "Loaded persisted cycle state");
        Self {
            record: Mutex::new(record),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            kv,
        }
    }

    /// Latest committed record.
    #[must_use]
    pub fn current(&self) -> CycleState {
        self.record.lock().clone()
    }

    /// Merge `update`, persist, and publish. Returns the committed record.
    ///
    /// A failed disk commit is logged and does not stop publication; the
    /// in-memory record is authoritative for this process.
    pub fn update(&self, update: StateUpdate) -> CycleState {
        // The record lock is held across persist + publish so concurrent
        // readers never observe a record that subscribers have not been sent.
        let mut record = self.record.lock();
        update.apply_to(&mut record);
        let committed = record.clone();

        if let Err(e) = committed.persist(&self.kv) {
            tracing::warn!(error = %e, "Failed to persist cycle state");
        }

        self.publish(StateEvent::StatusChanged(committed.clone()));
        drop(record);
        committed
    }

    /// Publish a payload-received event.
    pub fn publish_payload(&self, hex: String) {
        self.publish(StateEvent::PayloadReceived { hex });
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((id, tx));
        Subscription { id, rx }
    }

    /// Remove a subscriber. Dropping the [`Subscription`] has the same
    /// effect at the next publish.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(sid, _)| *sid != id);
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn publish(&self, event: StateEvent) {
        self.subscribers
            .lock()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}
