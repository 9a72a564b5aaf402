//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use beaconsync_core::{
    default_data_dir, scheduler, system_clock, ConfigStore, HttpTransport, KvStore,
    SchedulerDeps, SchedulerHandle, Settings, StateStore,
};
use tracing::info;

use crate::backend::{self, RadioBackend};

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

#[derive(Debug)]
struct AppStateInner {
    scheduler: SchedulerHandle,
    radio: &'static str,
    started_at: Instant,
}

/// Alias used by the routers.
pub type SharedState = AppState;

impl AppState {
    /// Wrap an already running scheduler.
    #[must_use]
    pub fn new(scheduler: SchedulerHandle, radio: &'static str) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                scheduler,
                radio,
                started_at: Instant::now(),
            }),
        }
    }

    /// Open the store named by `settings`, build the collaborators and spawn
    /// the scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or the store cannot be opened,
    /// or the HTTP client cannot be built.
    pub fn launch(settings: &Settings, radio: RadioBackend) -> anyhow::Result<Self> {
        let data_dir = match &settings.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        let kv = Arc::new(KvStore::open_in(&data_dir)?);
        info!(store = ?kv.path(), radio = radio.name, "Opened relay store");

        let transport = HttpTransport::new(settings.policy.send_timeout())
            .context("failed to build HTTP client")?;
        let clock = system_clock();
        info!(wakes_host = clock.wakes_host(), "Wake clock ready");

        let handle = scheduler::spawn(SchedulerDeps {
            radio: radio.radio,
            transport: Arc::new(transport),
            inhibitor: backend::inhibitor(settings.lease_backend),
            clock,
            config: Arc::new(ConfigStore::load(Arc::clone(&kv))),
            state: Arc::new(StateStore::load(kv)),
            policy: settings.policy.clone(),
        });

        Ok(Self::new(handle, radio.name))
    }

    /// Scheduler handle.
    #[must_use]
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.inner.scheduler
    }

    /// Relay configuration store.
    #[must_use]
    pub fn config(&self) -> &ConfigStore {
        self.inner.scheduler.config()
    }

    /// Cycle state store.
    #[must_use]
    pub fn cycle_state(&self) -> &StateStore {
        self.inner.scheduler.state()
    }

    /// Name of the radio backend.
    #[must_use]
    pub fn radio_backend(&self) -> &'static str {
        self.inner.radio
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use beaconsync_core::{
        scheduler, ConfigStore, KvStore, MonotonicClock, NoopInhibitor, PolicyConfig,
        RelayRequest, SchedulerDeps, SendOutcome, SimulatedRadio, StateStore, Transport,
    };

    use super::AppState;

    /// Transport that accepts every request without network access.
    #[derive(Debug, Default)]
    pub struct AcceptAll;

    #[async_trait]
    impl Transport for AcceptAll {
        async fn post(&self, _request: &RelayRequest) -> SendOutcome {
            SendOutcome::Success(201)
        }
    }

    /// State over an in-memory store and a silent simulated radio.
    pub fn test_state() -> AppState {
        let kv = Arc::new(KvStore::in_memory());
        let handle = scheduler::spawn(SchedulerDeps {
            radio: Arc::new(SimulatedRadio::new()),
            transport: Arc::new(AcceptAll),
            inhibitor: Box::new(NoopInhibitor),
            clock: Arc::new(MonotonicClock::new()),
            config: Arc::new(ConfigStore::load(Arc::clone(&kv))),
            state: Arc::new(StateStore::load(kv)),
            policy: PolicyConfig::default(),
        });
        AppState::new(handle, "simulated")
    }

    #[tokio::test]
    async fn test_state_exposes_stores() {
        let state = test_state();
        assert_eq!(state.radio_backend(), "simulated");
        assert!(!state.config().snapshot().is_complete());
        assert!(!state.cycle_state().current().status.is_active());
    }

    #[tokio::test]
    async fn test_launch_opens_store_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = beaconsync_core::Settings {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let radio = crate::backend::RadioBackend::simulated();

        let state = AppState::launch(&settings, radio).unwrap();
        assert_eq!(state.radio_backend(), "simulated");
        state.scheduler().shutdown().await.unwrap();
    }
}
