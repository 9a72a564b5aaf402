//! The scan/relay scheduler.
//!
//! A single actor task owns the wake timer, the scanner, the sender and the
//! wake lease, and consumes one event channel fed by external commands, the
//! timer, scan completions and send completions. Events are handled strictly
//! one at a time, so cycle transitions never interleave.
//!
//! ```text
//! Stopped --start--> Waiting --wake--> Scanning --payload--> Sending
//!                       ^                 |                     |
//!                       |              failure               outcome
//!                       +---- reschedule -+---------------------+
//! ```
//!
//! Every wake, scan completion and send completion carries the generation
//! it was issued under. Starting, stopping and beginning a new cycle each
//! bump the generation, so a completion that arrives after a stop (or after
//! its cycle was otherwise superseded) no longer matches and is dropped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::{ConfigError, ConfigStore, RelayConfig};
use crate::error::{Result, SyncError};
use crate::lease::{SleepInhibitor, WakeLease};
use crate::scanner::{Radio, ScanFailure, ScanOutcome, Scanner, ALREADY_STARTED_CODE};
use crate::sender::{encode_hex, RelayRequest, SendOutcome, Sender, Transport};
use crate::settings::PolicyConfig;
use crate::state::{Outcome, OutcomeKind, ServiceStatus, StateStore, StateUpdate};
use crate::timer::{WakeClock, WakeTimer};

/// Logical phase of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not running.
    Stopped,
    /// Timer armed, no cycle in progress.
    Waiting,
    /// Scan outstanding.
    Scanning,
    /// Send outstanding.
    Sending,
}

/// Diagnostic view of the scheduler.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SchedulerSnapshot {
    /// Current phase.
    pub phase: Phase,
    /// Current generation token.
    pub generation: u64,
    /// Whether the wake lease is held.
    pub lease_held: bool,
    /// Whether the wake timer is armed.
    pub timer_armed: bool,
    /// Whether a scan task is running.
    pub scan_in_flight: bool,
    /// Whether a send task is running (possibly abandoned by a stop).
    pub send_in_flight: bool,
}

/// Collaborators handed to the scheduler.
pub struct SchedulerDeps {
    /// Radio used for scanning.
    pub radio: Arc<dyn Radio>,
    /// Transport used for relaying.
    pub transport: Arc<dyn Transport>,
    /// Host sleep inhibitor backing the wake lease.
    pub inhibitor: Box<dyn SleepInhibitor>,
    /// Clock the wake timer runs on.
    pub clock: Arc<dyn WakeClock>,
    /// Relay configuration.
    pub config: Arc<ConfigStore>,
    /// Cycle state.
    pub state: Arc<StateStore>,
    /// Timing policy.
    pub policy: PolicyConfig,
}

enum Command {
    Start {
        config: RelayConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Reconfigure {
        config: RelayConfig,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Event {
    Command(Command),
    Wake { generation: u64 },
    ScanDone { generation: u64, outcome: ScanOutcome },
    SendDone { generation: u64, outcome: SendOutcome },
}

/// Cloneable handle to a running scheduler.
///
/// The scheduler task ends when [`shutdown`](Self::shutdown) is called or
/// every handle is dropped.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Event>,
    config: Arc<ConfigStore>,
    state: Arc<StateStore>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(_) => f.write_str("Command"),
            Self::Wake { generation } => write!(f, "Wake({generation})"),
            Self::ScanDone { generation, .. } => write!(f, "ScanDone({generation})"),
            Self::SendDone { generation, .. } => write!(f, "SendDone({generation})"),
        }
    }
}

impl SchedulerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Command(make(reply)))
            .map_err(|_| SyncError::SchedulerUnavailable)?;
        rx.await.map_err(|_| SyncError::SchedulerUnavailable)
    }

    /// Persist `config` and start relaying; the first cycle begins at once.
    ///
    /// # Errors
    ///
    /// [`SyncError::AlreadyRunning`] unless stopped, a configuration error if
    /// `config` is incomplete or invalid.
    pub async fn start(&self, config: RelayConfig) -> Result<()> {
        self.request(|reply| Command::Start { config, reply }).await?
    }

    /// Start with the stored configuration if the persisted status says the
    /// relay was running when the previous process exited.
    ///
    /// Returns whether relaying was resumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler is gone or refuses to start.
    pub async fn resume(&self) -> Result<bool> {
        let previous = self.state.current().status;
        if !previous.is_active() {
            return Ok(false);
        }
        let config = self.config.snapshot();
        if !config.is_complete() {
            warn!(status = %previous.as_str(), "Not resuming: stored configuration is incomplete");
            return Ok(false);
        }
        info!(status = %previous.as_str(), "Resuming relay after restart");
        self.start(config).await?;
        Ok(true)
    }

    /// Stop relaying. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SchedulerUnavailable`] if the task has exited.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Replace the relay configuration; applies from the next cycle.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub async fn reconfigure(&self, config: RelayConfig) -> Result<()> {
        self.request(|reply| Command::Reconfigure { config, reply })
            .await?
    }

    /// Diagnostic snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SchedulerUnavailable`] if the task has exited.
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Stop the task for process exit. Persisted state is left as-is so the
    /// next process can resume.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SchedulerUnavailable`] if the task has exited.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Relay configuration store.
    #[must_use]
    pub const fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Cycle state store.
    #[must_use]
    pub const fn state(&self) -> &Arc<StateStore> {
        &self.state
    }
}

/// Spawn the scheduler on the current runtime.
#[must_use]
pub fn spawn(deps: SchedulerDeps) -> SchedulerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = SchedulerHandle {
        tx: tx.clone(),
        config: Arc::clone(&deps.config),
        state: Arc::clone(&deps.state),
    };

    let scheduler = Scheduler {
        scanner: Scanner::new(deps.radio, deps.policy.scan_timeout()),
        sender: Sender::new(deps.transport),
        lease: WakeLease::new(deps.inhibitor),
        timer: WakeTimer::new(Arc::clone(&deps.clock)),
        clock: deps.clock,
        config: deps.config,
        state: deps.state,
        policy: deps.policy,
        events: tx.downgrade(),
        phase: Phase::Stopped,
        generation: 0,
        cycle: None,
        deferred: None,
    };
    tokio::spawn(scheduler.run(rx));
    handle
}

struct Scheduler {
    scanner: Scanner,
    sender: Sender,
    lease: WakeLease,
    timer: WakeTimer,
    clock: Arc<dyn WakeClock>,
    config: Arc<ConfigStore>,
    state: Arc<StateStore>,
    policy: PolicyConfig,
    events: mpsc::WeakUnboundedSender<Event>,
    phase: Phase,
    generation: u64,
    /// Configuration snapshot of the cycle in progress.
    cycle: Option<RelayConfig>,
    /// Relay held back until an abandoned send finishes.
    deferred: Option<RelayRequest>,
}

impl Scheduler {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!(
            period_secs = self.policy.scan_period_secs,
            scan_timeout_secs = self.policy.scan_timeout_secs,
            "Scheduler running"
        );
        while let Some(event) = rx.recv().await {
            debug!(?event, phase = ?self.phase, generation = self.generation, "Event");
            match event {
                Event::Command(command) => {
                    if let Some(reply) = self.on_command(command) {
                        self.halt();
                        let _ = reply.send(());
                        break;
                    }
                }
                Event::Wake { generation } => self.on_wake(generation),
                Event::ScanDone { generation, outcome } => self.on_scan_done(generation, outcome),
                Event::SendDone { generation, outcome } => self.on_send_done(generation, outcome),
            }
        }
        self.halt();
        info!("Scheduler stopped");
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = self.events.upgrade() {
            let _ = tx.send(event);
        }
    }

    /// Handle a command. Returns the reply channel if it was a shutdown.
    fn on_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Start { config, reply } => {
                let _ = reply.send(self.start(config));
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Reconfigure { config, reply } => {
                let _ = reply.send(self.reconfigure(config));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => return Some(reply),
        }
        None
    }

    fn persist_config(&self, config: RelayConfig) -> Result<()> {
        match self.config.update(config) {
            Ok(()) => Ok(()),
            Err(ConfigError::Storage(e)) => {
                warn!(error = %e, "Configuration not persisted; using it for this run");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn start(&mut self, config: RelayConfig) -> Result<()> {
        if self.phase != Phase::Stopped {
            return Err(SyncError::AlreadyRunning);
        }
        self.persist_config(config)?;

        self.generation += 1;
        let now = self.clock.now();
        self.phase = Phase::Waiting;
        self.state.update(
            StateUpdate::status(ServiceStatus::Started)
                .outcome(Outcome::bare(OutcomeKind::None))
                .next_wake(Some(self.clock.to_utc(now))),
        );
        self.arm_wake(now);

        info!(generation = self.generation, "Relay started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.phase == Phase::Stopped {
            if self.state.current().status != ServiceStatus::Stopped {
                // Left over from a previous process that was not resumed.
                self.state.update(StateUpdate::reset());
            }
            debug!("Stop while already stopped");
            return;
        }

        self.generation += 1;
        self.halt();
        self.phase = Phase::Stopped;
        self.state.update(StateUpdate::reset());
        info!(generation = self.generation, "Relay stopped");
    }

    /// Cancel the timer and scan and release the lease, without touching
    /// the persisted state.
    fn halt(&mut self) {
        self.timer.cancel();
        self.scanner.stop_scan();
        if self.sender.is_sending() {
            info!("Leaving in-flight send to finish; its outcome will be discarded");
        }
        self.lease.release();
        self.cycle = None;
        self.deferred = None;
    }

    fn reconfigure(&self, config: RelayConfig) -> Result<()> {
        self.persist_config(config)?;
        if self.phase != Phase::Stopped {
            info!("New configuration applies from the next cycle");
        }
        Ok(())
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            phase: self.phase,
            generation: self.generation,
            lease_held: self.lease.is_held(),
            timer_armed: self.timer.is_armed(),
            scan_in_flight: self.scanner.is_scanning(),
            send_in_flight: self.sender.is_sending(),
        }
    }

    fn arm_wake(&mut self, at: Duration) {
        let generation = self.generation;
        let events = self.events.clone();
        self.timer.arm(at, move || {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Event::Wake { generation });
            }
        });
    }

    fn on_wake(&mut self, generation: u64) {
        if self.phase == Phase::Stopped {
            debug!(generation, "Wake while stopped; ignoring");
            return;
        }
        if generation != self.generation || self.phase != Phase::Waiting {
            warn!(generation, current = self.generation, phase = ?self.phase, "Stale wake; ignoring");
            return;
        }

        self.generation += 1;
        let config = self.config.snapshot();
        let target = config.target_address.clone();
        self.cycle = Some(config);

        self.lease.acquire(self.policy.wake_lease_max());
        self.phase = Phase::Scanning;
        self.state.update(StateUpdate::status(ServiceStatus::Scanning));
        info!(generation = self.generation, %target, "Cycle started");

        let generation = self.generation;
        let events = self.events.clone();
        let started = self.scanner.start_scan(target, move |outcome| {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Event::ScanDone { generation, outcome });
            }
        });
        if started.is_err() {
            self.emit(Event::ScanDone {
                generation,
                outcome: ScanOutcome::Failed(ScanFailure::Radio(ALREADY_STARTED_CODE)),
            });
        }
    }

    fn on_scan_done(&mut self, generation: u64, outcome: ScanOutcome) {
        if generation != self.generation || self.phase != Phase::Scanning {
            debug!(generation, current = self.generation, "Stale scan outcome; discarding");
            return;
        }

        let recorded = match outcome {
            ScanOutcome::Payload(payload) => {
                self.begin_send(payload);
                return;
            }
            ScanOutcome::Timeout => Outcome::bare(OutcomeKind::ScanTimeout),
            ScanOutcome::Failed(ScanFailure::RadioDisabled) => Outcome::bare(OutcomeKind::RadioDisabled),
            ScanOutcome::Failed(failure @ ScanFailure::EmptyPayload) => {
                Outcome::with_arg(OutcomeKind::EmptyPayload, failure.code())
            }
            ScanOutcome::Failed(ScanFailure::Radio(code)) => {
                Outcome::with_arg(OutcomeKind::ScanFailed, code)
            }
        };
        self.reschedule(recorded);
    }

    fn begin_send(&mut self, payload: Vec<u8>) {
        let Some(config) = self.cycle.as_ref() else {
            warn!("Payload without a cycle configuration; discarding");
            self.reschedule(Outcome::bare(OutcomeKind::None));
            return;
        };

        let request = RelayRequest::new(config, payload);
        let hex = encode_hex(&request.payload);
        info!(generation = self.generation, payload = %hex, "Beacon captured");

        self.phase = Phase::Sending;
        self.state.update(StateUpdate::status(ServiceStatus::Sending));
        self.state.publish_payload(hex);

        if self.sender.is_sending() {
            info!(generation = self.generation, "Waiting for the previous run's send to finish");
            self.deferred = Some(request);
            return;
        }
        self.issue_send(request);
    }

    fn issue_send(&mut self, request: RelayRequest) {
        let generation = self.generation;
        let events = self.events.clone();
        let issued = self.sender.send(request, move |outcome| {
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(Event::SendDone { generation, outcome });
            }
        });
        if let Err(e) = issued {
            self.emit(Event::SendDone {
                generation,
                outcome: SendOutcome::NetworkError(e.to_string()),
            });
        }
    }

    fn on_send_done(&mut self, generation: u64, outcome: SendOutcome) {
        if generation != self.generation || self.phase != Phase::Sending {
            debug!(generation, current = self.generation, ?outcome, "Stale send outcome; discarding");
            if let Some(request) = self.deferred.take() {
                self.issue_send(request);
            }
            return;
        }

        let recorded = match outcome {
            SendOutcome::Success(code) => Outcome::with_arg(OutcomeKind::Success, code),
            SendOutcome::ServerError(code) => Outcome::with_arg(OutcomeKind::ServerError, code),
            SendOutcome::NetworkError(message) => Outcome::with_arg(OutcomeKind::NetworkError, message),
        };
        self.reschedule(recorded);
    }

    fn reschedule(&mut self, outcome: Outcome) {
        let at = self.clock.now() + self.policy.scan_period();
        let at_utc = self.clock.to_utc(at);

        self.arm_wake(at);
        self.phase = Phase::Waiting;
        self.cycle = None;
        info!(
            generation = self.generation,
            outcome = outcome.kind.as_str(),
            arg = outcome.arg.as_deref().unwrap_or(""),
            next_wake = %at_utc,
            "Cycle finished"
        );
        self.state.update(
            StateUpdate::status(ServiceStatus::Waiting)
                .outcome(outcome)
                .next_wake(Some(at_utc)),
        );
        self.lease.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::tests::CountingInhibitor;
    use crate::mock::{SimEvent, SimulatedRadio};
    use crate::sender::RelayBody;
    use crate::state::{CycleState, StateEvent, Subscription};
    use crate::storage::KvStore;
    use crate::timer::MonotonicClock;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const PERIOD: Duration = Duration::from_secs(180);

    /// Transport that records requests and plays back scripted outcomes.
    #[derive(Default)]
    struct ScriptedTransport {
        delay: Duration,
        outcomes: Mutex<VecDeque<SendOutcome>>,
        requests: Mutex<Vec<(String, RelayBody)>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(delay: Duration, outcomes: Vec<SendOutcome>) -> Self {
            Self {
                delay,
                outcomes: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }

        fn requests(&self) -> Vec<(String, RelayBody)> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(&self, request: &RelayRequest) -> SendOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.requests
                .lock()
                .push((request.endpoint.clone(), request.body()));
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or(SendOutcome::Success(200))
        }
    }

    struct Harness {
        handle: SchedulerHandle,
        radio: Arc<SimulatedRadio>,
        transport: Arc<ScriptedTransport>,
        inhibitor: CountingInhibitor,
        sub: Subscription,
    }

    fn harness(radio: SimulatedRadio, transport: ScriptedTransport) -> Harness {
        let kv = Arc::new(KvStore::in_memory());
        let radio = Arc::new(radio);
        let transport = Arc::new(transport);
        let inhibitor = CountingInhibitor::default();
        let state = Arc::new(StateStore::load(kv.clone()));
        let sub = state.subscribe();

        let handle = spawn(SchedulerDeps {
            radio: radio.clone(),
            transport: transport.clone(),
            inhibitor: Box::new(inhibitor.clone()),
            clock: Arc::new(MonotonicClock::new()),
            config: Arc::new(ConfigStore::load(kv)),
            state,
            policy: PolicyConfig::default(),
        });

        Harness {
            handle,
            radio,
            transport,
            inhibitor,
            sub,
        }
    }

    fn config() -> RelayConfig {
        RelayConfig {
            target_address: "AA:BB:CC:DD:EE:FF".to_string(),
            api_url: "https://relay.example.com/beacon".to_string(),
            app_id: "id".to_string(),
            app_key: "key".to_string(),
        }
    }

    async fn next_status(sub: &mut Subscription, status: ServiceStatus) -> CycleState {
        loop {
            match sub.recv().await.expect("state store dropped") {
                StateEvent::StatusChanged(state) if state.status == status => return state,
                _ => {}
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_is_relayed_then_rescheduled() {
        let radio = SimulatedRadio::new();
        radio.push_scan(vec![SimEvent::matching(Duration::from_secs(1), vec![0x01, 0x02])]);
        let mut h = harness(radio, ScriptedTransport::new(Duration::ZERO, vec![SendOutcome::Success(200)]));

        h.handle.start(config()).await.unwrap();
        let started = next_status(&mut h.sub, ServiceStatus::Started).await;
        next_status(&mut h.sub, ServiceStatus::Scanning).await;
        next_status(&mut h.sub, ServiceStatus::Sending).await;
        match h.sub.recv().await.unwrap() {
            StateEvent::PayloadReceived { hex } => assert_eq!(hex, "0102"),
            other => panic!("expected payload event, got {other:?}"),
        }
        let waiting = next_status(&mut h.sub, ServiceStatus::Waiting).await;

        assert_eq!(waiting.last_outcome, OutcomeKind::Success);
        assert_eq!(waiting.last_outcome_arg.as_deref(), Some("200"));

        let requests = h.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.data, "0102");
        assert_eq!(requests[0].1.mac, "AA:BB:CC:DD:EE:FF");

        let gap = waiting.next_wake_at_utc.unwrap() - started.next_wake_at_utc.unwrap();
        assert!(gap >= TimeDelta::seconds(181) && gap <= TimeDelta::seconds(182), "gap was {gap}");

        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, Phase::Waiting);
        assert!(!snapshot.lease_held);
        assert!(snapshot.timer_armed);
        assert_eq!(h.inhibitor.engaged.load(Ordering::SeqCst), 1);
        assert_eq!(h.inhibitor.disengaged.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_disabled_reschedules_without_sending() {
        let radio = SimulatedRadio::new();
        radio.set_enabled(false);
        let mut h = harness(radio, ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        let started = next_status(&mut h.sub, ServiceStatus::Started).await;
        let waiting = next_status(&mut h.sub, ServiceStatus::Waiting).await;

        assert_eq!(waiting.last_outcome, OutcomeKind::RadioDisabled);
        assert_eq!(waiting.last_outcome_arg, None);
        let gap = waiting.next_wake_at_utc.unwrap() - started.next_wake_at_utc.unwrap();
        assert!(gap < TimeDelta::seconds(181), "gap was {gap}");
        assert!(h.transport.requests().is_empty());
        assert_eq!(h.radio.scans_started(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_reschedules() {
        let mut h = harness(SimulatedRadio::new(), ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        let started = next_status(&mut h.sub, ServiceStatus::Started).await;
        let waiting = next_status(&mut h.sub, ServiceStatus::Waiting).await;

        assert_eq!(waiting.last_outcome, OutcomeKind::ScanTimeout);
        let gap = waiting.next_wake_at_utc.unwrap() - started.next_wake_at_utc.unwrap();
        assert!(gap >= TimeDelta::seconds(240), "gap was {gap}");
        assert!(h.transport.requests().is_empty());
        assert!(!h.handle.snapshot().await.unwrap().lease_held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_still_reschedules() {
        let radio = SimulatedRadio::with_default(vec![SimEvent::matching(Duration::ZERO, vec![0xAB])]);
        let transport = ScriptedTransport::new(
            Duration::ZERO,
            vec![SendOutcome::NetworkError("connection refused".to_string())],
        );
        let mut h = harness(radio, transport);

        h.handle.start(config()).await.unwrap();
        let waiting = next_status(&mut h.sub, ServiceStatus::Waiting).await;
        assert_eq!(waiting.last_outcome, OutcomeKind::NetworkError);
        assert_eq!(waiting.last_outcome_arg.as_deref(), Some("connection refused"));

        // The next cycle still happens.
        next_status(&mut h.sub, ServiceStatus::Scanning).await;
        let second = next_status(&mut h.sub, ServiceStatus::Waiting).await;
        assert_eq!(second.last_outcome, OutcomeKind::Success);
        assert_eq!(h.transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failures_map_to_outcomes() {
        let radio = SimulatedRadio::new();
        radio.push_scan(vec![SimEvent::matching(Duration::ZERO, Vec::new())]);
        radio.push_scan(vec![SimEvent::error(Duration::ZERO, 2)]);
        let mut h = harness(radio, ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        let first = next_status(&mut h.sub, ServiceStatus::Waiting).await;
        assert_eq!(first.last_outcome, OutcomeKind::EmptyPayload);
        assert_eq!(first.last_outcome_arg.as_deref(), Some("3"));

        let second = next_status(&mut h.sub, ServiceStatus::Waiting).await;
        assert_eq!(second.last_outcome, OutcomeKind::ScanFailed);
        assert_eq!(second.last_outcome_arg.as_deref(), Some("2"));
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_is_recorded() {
        let radio = SimulatedRadio::with_default(vec![SimEvent::matching(Duration::ZERO, vec![1])]);
        let transport = ScriptedTransport::new(Duration::ZERO, vec![SendOutcome::ServerError(503)]);
        let mut h = harness(radio, transport);

        h.handle.start(config()).await.unwrap();
        let waiting = next_status(&mut h.sub, ServiceStatus::Waiting).await;
        assert_eq!(waiting.last_outcome, OutcomeKind::ServerError);
        assert_eq!(waiting.last_outcome_arg.as_deref(), Some("503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_wake_strictly_increases() {
        let radio = SimulatedRadio::with_default(vec![SimEvent::matching(Duration::from_millis(5), vec![1])]);
        let mut h = harness(radio, ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        let mut previous = next_status(&mut h.sub, ServiceStatus::Started)
            .await
            .next_wake_at_utc
            .unwrap();
        for _ in 0..4 {
            let next = next_status(&mut h.sub, ServiceStatus::Waiting)
                .await
                .next_wake_at_utc
                .unwrap();
            assert!(next > previous);
            previous = next;
        }

        h.handle.stop().await.unwrap();
        assert_eq!(h.handle.state().current().next_wake_at_utc, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_scanning_releases_everything() {
        let mut h = harness(SimulatedRadio::new(), ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        next_status(&mut h.sub, ServiceStatus::Scanning).await;
        assert!(h.handle.snapshot().await.unwrap().lease_held);

        h.handle.stop().await.unwrap();
        let snapshot = h.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, Phase::Stopped);
        assert!(!snapshot.lease_held);
        assert!(!snapshot.timer_armed);
        assert!(!snapshot.scan_in_flight);

        let state = h.handle.state().current();
        assert_eq!(state.status, ServiceStatus::Stopped);
        assert_eq!(state.last_outcome, OutcomeKind::None);
        assert_eq!(state.next_wake_at_utc, None);

        settle().await;
        assert_eq!(h.radio.active_scans(), 0);

        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(h.radio.scans_started(), 1);
        assert_eq!(h.handle.state().current().status, ServiceStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_sending_discards_late_outcome() {
        let radio = SimulatedRadio::with_default(vec![SimEvent::matching(Duration::ZERO, vec![1])]);
        let transport = ScriptedTransport::new(Duration::from_secs(10), vec![SendOutcome::Success(200)]);
        let mut h = harness(radio, transport);

        h.handle.start(config()).await.unwrap();
        next_status(&mut h.sub, ServiceStatus::Sending).await;

        h.handle.stop().await.unwrap();
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(!snapshot.lease_held);
        assert!(snapshot.send_in_flight);

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;

        let state = h.handle.state().current();
        assert_eq!(state.status, ServiceStatus::Stopped);
        assert_eq!(state.last_outcome, OutcomeKind::None);
        assert_eq!(state.next_wake_at_utc, None);
        assert!(!h.handle.snapshot().await.unwrap().send_in_flight);
        assert_eq!(h.transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_during_send_waits_for_abandoned_send() {
        let radio = SimulatedRadio::with_default(vec![SimEvent::matching(Duration::ZERO, vec![1])]);
        let transport = ScriptedTransport::new(Duration::from_secs(25), Vec::new());
        let mut h = harness(radio, transport);

        h.handle.start(config()).await.unwrap();
        next_status(&mut h.sub, ServiceStatus::Sending).await;
        let restarted = tokio::time::Instant::now();

        h.handle.stop().await.unwrap();
        h.handle.start(config()).await.unwrap();
        next_status(&mut h.sub, ServiceStatus::Sending).await;
        assert!(h.handle.snapshot().await.unwrap().send_in_flight);
        assert_eq!(h.transport.requests().len(), 1);

        let waiting = next_status(&mut h.sub, ServiceStatus::Waiting).await;
        assert_eq!(waiting.last_outcome, OutcomeKind::Success);
        assert_eq!(waiting.last_outcome_arg.as_deref(), Some("200"));
        assert!(restarted.elapsed() >= Duration::from_secs(50));
        assert_eq!(h.transport.requests().len(), 2);
        assert_eq!(h.transport.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let mut h = harness(SimulatedRadio::new(), ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        next_status(&mut h.sub, ServiceStatus::Scanning).await;

        h.handle.stop().await.unwrap();
        let once = h.handle.state().current();
        let generation = h.handle.snapshot().await.unwrap().generation;

        h.handle.stop().await.unwrap();
        assert_eq!(h.handle.state().current(), once);
        assert_eq!(h.handle.snapshot().await.unwrap().generation, generation);
        assert_eq!(h.inhibitor.disengaged.load(Ordering::SeqCst), 1);

        // Only one reset was published.
        let mut rx = h.sub.into_receiver();
        let mut resets = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, StateEvent::StatusChanged(ref s) if s.status == ServiceStatus::Stopped) {
                resets += 1;
            }
        }
        assert_eq!(resets, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_rejected_while_running() {
        let h = harness(SimulatedRadio::new(), ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        let err = h.handle.start(config()).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning));

        h.handle.stop().await.unwrap();
        assert!(h.handle.start(config()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_config_is_rejected() {
        let h = harness(SimulatedRadio::new(), ScriptedTransport::default());

        let err = h
            .handle
            .start(RelayConfig {
                app_key: String::new(),
                ..config()
            })
            .await
            .unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(h.handle.snapshot().await.unwrap().phase, Phase::Stopped);
        assert_eq!(h.handle.state().current().status, ServiceStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_stopped_wakes_are_ignored() {
        let mut h = harness(SimulatedRadio::new(), ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        next_status(&mut h.sub, ServiceStatus::Waiting).await;
        assert_eq!(h.radio.scans_started(), 1);

        h.handle.tx.send(Event::Wake { generation: 0 }).unwrap();
        settle().await;
        assert_eq!(h.handle.snapshot().await.unwrap().phase, Phase::Waiting);
        assert_eq!(h.radio.scans_started(), 1);

        h.handle.stop().await.unwrap();
        let generation = h.handle.snapshot().await.unwrap().generation;
        h.handle.tx.send(Event::Wake { generation }).unwrap();
        settle().await;
        assert_eq!(h.handle.snapshot().await.unwrap().phase, Phase::Stopped);
        assert_eq!(h.radio.scans_started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_churn_never_overlaps() {
        let radio = SimulatedRadio::with_default(vec![SimEvent::matching(Duration::from_secs(1), vec![1])]);
        let transport = ScriptedTransport::new(Duration::from_secs(10), Vec::new());
        let mut h = harness(radio, transport);

        for round in 0..6 {
            h.handle.start(config()).await.unwrap();
            let wait_for = if round % 2 == 0 {
                ServiceStatus::Scanning
            } else {
                ServiceStatus::Sending
            };
            next_status(&mut h.sub, wait_for).await;
            h.handle.stop().await.unwrap();
            assert!(!h.handle.snapshot().await.unwrap().lease_held);
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(h.radio.max_concurrent_scans(), 1);
        assert_eq!(h.transport.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(h.handle.state().current().status, ServiceStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_applies_from_next_cycle() {
        let radio = SimulatedRadio::with_default(vec![SimEvent::matching(Duration::from_secs(1), vec![1])]);
        let mut h = harness(radio, ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        next_status(&mut h.sub, ServiceStatus::Scanning).await;

        let updated = RelayConfig {
            api_url: "https://other.example.com/beacon".to_string(),
            ..config()
        };
        h.handle.reconfigure(updated).await.unwrap();

        next_status(&mut h.sub, ServiceStatus::Waiting).await;
        next_status(&mut h.sub, ServiceStatus::Waiting).await;

        let endpoints: Vec<String> = h.transport.requests().into_iter().map(|(e, _)| e).collect();
        assert_eq!(
            endpoints,
            vec![
                "https://relay.example.com/beacon".to_string(),
                "https://other.example.com/beacon".to_string(),
            ]
        );
        assert!(h.handle.reconfigure(RelayConfig::default()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_only_when_previously_active() {
        let h = harness(SimulatedRadio::new(), ScriptedTransport::default());
        assert!(!h.handle.resume().await.unwrap());

        h.handle.config().update(config()).unwrap();
        h.handle
            .state()
            .update(StateUpdate::status(ServiceStatus::Waiting));
        assert!(h.handle.resume().await.unwrap());
        assert_eq!(h.handle.snapshot().await.unwrap().phase, Phase::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_persisted_state() {
        let mut h = harness(SimulatedRadio::new(), ScriptedTransport::default());

        h.handle.start(config()).await.unwrap();
        next_status(&mut h.sub, ServiceStatus::Scanning).await;
        h.handle.shutdown().await.unwrap();

        assert_eq!(h.handle.state().current().status, ServiceStatus::Scanning);
        assert_eq!(h.inhibitor.disengaged.load(Ordering::SeqCst), 1);
        assert!(matches!(
            h.handle.snapshot().await,
            Err(SyncError::SchedulerUnavailable)
        ));
    }
}
