//! Simulated radio for tests and for running without Bluetooth hardware.
//!
//! Each scan plays a script of timed events. Scripts are consumed in order
//! from a queue; when the queue is empty the default script is used (silent
//! unless set). The radio counts concurrent scans so tests can assert that
//! at most one is ever open.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::scanner::{Advertisement, Radio, RadioError, RadioEvent, RadioStream};

/// One scripted event, delivered `after` the previous one.
#[derive(Debug, Clone)]
pub struct SimEvent {
    after: Duration,
    kind: SimEventKind,
}

#[derive(Debug, Clone)]
enum SimEventKind {
    Matching(Vec<u8>),
    Other { address: String, payload: Vec<u8> },
    Error(i32),
}

impl SimEvent {
    /// Advertisement from whatever address is being scanned for.
    #[must_use]
    pub const fn matching(after: Duration, payload: Vec<u8>) -> Self {
        Self {
            after,
            kind: SimEventKind::Matching(payload),
        }
    }

    /// Advertisement from a fixed address.
    #[must_use]
    pub fn other(after: Duration, address: &str, payload: Vec<u8>) -> Self {
        Self {
            after,
            kind: SimEventKind::Other {
                address: address.to_string(),
                payload,
            },
        }
    }

    /// Radio-stack failure with `code`.
    #[must_use]
    pub const fn error(after: Duration, code: i32) -> Self {
        Self {
            after,
            kind: SimEventKind::Error(code),
        }
    }

    fn resolve(self, target: &str) -> (Duration, RadioEvent) {
        let event = match self.kind {
            SimEventKind::Matching(payload) => RadioEvent::Advertisement(Advertisement {
                address: target.to_string(),
                payload,
            }),
            SimEventKind::Other { address, payload } => {
                RadioEvent::Advertisement(Advertisement { address, payload })
            }
            SimEventKind::Error(code) => RadioEvent::Failed(code),
        };
        (self.after, event)
    }
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct ScanGuard(Arc<Counters>);

impl ScanGuard {
    fn open(counters: &Arc<Counters>) -> Self {
        counters.started.fetch_add(1, Ordering::SeqCst);
        let now = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_active.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted [`Radio`].
#[derive(Debug)]
pub struct SimulatedRadio {
    enabled: AtomicBool,
    start_error: Mutex<Option<RadioError>>,
    scripts: Mutex<VecDeque<Vec<SimEvent>>>,
    default_script: Mutex<Vec<SimEvent>>,
    counters: Arc<Counters>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// Powered radio that hears nothing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            start_error: Mutex::new(None),
            scripts: Mutex::new(VecDeque::new()),
            default_script: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Powered radio where every scan plays `script`.
    #[must_use]
    pub fn with_default(script: Vec<SimEvent>) -> Self {
        let radio = Self::new();
        *radio.default_script.lock() = script;
        radio
    }

    /// Switch the radio on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make the next scan fail to start with `error`.
    pub fn fail_next_start(&self, error: RadioError) {
        *self.start_error.lock() = Some(error);
    }

    /// Queue `script` for the next scan that has no earlier script queued.
    pub fn push_scan(&self, script: Vec<SimEvent>) {
        self.scripts.lock().push_back(script);
    }

    /// Scans started so far.
    #[must_use]
    pub fn scans_started(&self) -> usize {
        self.counters.started.load(Ordering::SeqCst)
    }

    /// Scans currently open.
    #[must_use]
    pub fn active_scans(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of scans ever open at once.
    #[must_use]
    pub fn max_concurrent_scans(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Radio for SimulatedRadio {
    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, target: &str) -> Result<RadioStream, RadioError> {
        if let Some(error) = self.start_error.lock().take() {
            return Err(error);
        }

        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_script.lock().clone());
        let events: Vec<_> = script.into_iter().map(|e| e.resolve(target)).collect();
        let guard = ScanGuard::open(&self.counters);

        let timed = stream::iter(events).then(|(after, event)| async move {
            tokio::time::sleep(after).await;
            event
        });

        // The scan stays open after the script runs out, until dropped.
        Ok(timed
            .chain(stream::pending())
            .map(move |event| {
                let _open = &guard;
                event
            })
            .boxed())
    }
}
