//! Wake lease: keep the host awake for the duration of one cycle.
//!
//! The lease is a plain held/not-held flag, not a counter. Acquiring while
//! held does nothing; releasing while not held does nothing. Every acquire
//! carries a maximum duration after which the lease counts as released even
//! if [`WakeLease::release`] was never called, and the host-side inhibitor
//! is given the same bound so a lost release cannot keep the machine up.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Host mechanism that blocks idle/suspend while engaged.
pub trait SleepInhibitor: Send {
    /// Start blocking sleep for at most `max`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host mechanism cannot be engaged.
    fn engage(&mut self, max: Duration) -> std::io::Result<()>;

    /// Stop blocking sleep. Must be safe to call when not engaged.
    fn disengage(&mut self);
}

/// Inhibitor that only logs; for hosts without a sleep manager.
#[derive(Debug, Default)]
pub struct NoopInhibitor;

impl SleepInhibitor for NoopInhibitor {
    fn engage(&mut self, max: Duration) -> std::io::Result<()> {
        debug!(max_secs = max.as_secs(), "Sleep inhibitor engaged (noop)");
        Ok(())
    }

    fn disengage(&mut self) {
        debug!("Sleep inhibitor disengaged (noop)");
    }
}

/// Inhibitor backed by a `systemd-inhibit` child process.
///
/// The child runs `sleep <max>` under a `block` inhibitor lock, so logind
/// drops the lock on its own once the safety net expires. Disengaging kills
/// the child early.
#[derive(Debug, Default)]
pub struct SystemdInhibitor {
    child: Option<Child>,
}

impl SystemdInhibitor {
    /// Create an idle inhibitor.
    #[must_use]
    pub const fn new() -> Self {
        Self { child: None }
    }
}

impl SleepInhibitor for SystemdInhibitor {
    fn engage(&mut self, max: Duration) -> std::io::Result<()> {
        self.disengage();

        let child = Command::new("systemd-inhibit")
            .arg("--what=sleep:idle")
            .arg("--who=beaconsync")
            .arg("--why=Relaying beacon payload")
            .arg("--mode=block")
            .arg("sleep")
            .arg(max.as_secs().max(1).to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        debug!(pid = ?child.id(), max_secs = max.as_secs(), "systemd-inhibit started");
        self.child = Some(child);
        Ok(())
    }

    fn disengage(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                // Already exited after its own timeout.
                debug!(error = %e, "systemd-inhibit was not running");
            }
        }
    }
}

/// Exclusive, non-reentrant wake lease with a safety-net expiry.
pub struct WakeLease {
    inhibitor: Box<dyn SleepInhibitor>,
    expires_at: Option<Instant>,
}

impl std::fmt::Debug for WakeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeLease")
            .field("held", &self.is_held())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl WakeLease {
    /// Create a released lease over `inhibitor`.
    #[must_use]
    pub fn new(inhibitor: Box<dyn SleepInhibitor>) -> Self {
        Self {
            inhibitor,
            expires_at: None,
        }
    }

    /// Acquire the lease for at most `max`. No-op if already held.
    ///
    /// If the host inhibitor cannot be engaged the lease is still tracked as
    /// held: the cycle goes ahead, it just cannot keep the host awake.
    pub fn acquire(&mut self, max: Duration) {
        if self.is_held() {
            debug!("Wake lease already held");
            return;
        }
        if self.expires_at.is_some() {
            warn!("Wake lease lapsed without release; re-acquiring");
            self.inhibitor.disengage();
        }

        if let Err(e) = self.inhibitor.engage(max) {
            warn!(error = %e, "Failed to engage sleep inhibitor");
        }
        self.expires_at = Some(Instant::now() + max);
        info!(max_secs = max.as_secs(), "Wake lease acquired");
    }

    /// Release the lease. No-op if not held.
    pub fn release(&mut self) {
        if self.expires_at.take().is_some() {
            self.inhibitor.disengage();
            info!("Wake lease released");
        }
    }

    /// Whether the lease is currently held (and not past its safety net).
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() < at)
    }
}

impl Drop for WakeLease {
    fn drop(&mut self) {
        self.release();
    }
}
