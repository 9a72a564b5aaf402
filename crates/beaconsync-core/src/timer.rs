//! Wake timer and the clocks it runs on.
//!
//! Deadlines are offsets on a [`WakeClock`]. On Linux the system clock is
//! [`BootClock`]: `CLOCK_BOOTTIME` keeps counting while the host is
//! suspended, and the deadline is armed on a `CLOCK_BOOTTIME_ALARM` timerfd
//! when the process may program wake alarms, so a due cycle resumes the
//! host instead of waiting for something else to wake it.
//! Both clocks map readings onto UTC from a single anchor, so successive
//! deadlines get successive timestamps even if the system clock is stepped.
//! [`MonotonicClock`] runs on the tokio clock and is used elsewhere and in
//! tests, where time can be paused.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Clock the scheduler measures and sleeps on.
#[async_trait]
pub trait WakeClock: Send + Sync + fmt::Debug {
    /// Time elapsed since the clock's epoch.
    fn now(&self) -> Duration;

    /// Wall-clock time at which the clock will read `at`.
    fn to_utc(&self, at: Duration) -> DateTime<Utc>;

    /// Resolve once the clock reads `deadline` or later.
    async fn sleep_until(&self, deadline: Duration);

    /// Whether a pending deadline brings the host out of suspend.
    fn wakes_host(&self) -> bool {
        false
    }
}

fn offset_utc(base: DateTime<Utc>, from: Duration, to: Duration) -> DateTime<Utc> {
    let shifted = if to >= from {
        TimeDelta::from_std(to - from)
            .ok()
            .and_then(|delta| base.checked_add_signed(delta))
    } else {
        TimeDelta::from_std(from - to)
            .ok()
            .and_then(|delta| base.checked_sub_signed(delta))
    };
    shifted.unwrap_or(base)
}

/// Clock on the tokio timer, anchored to UTC once. Does not count time
/// spent suspended.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
    origin_utc: DateTime<Utc>,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Anchor at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self::anchored(Instant::now(), Utc::now())
    }

    /// Anchor `origin` to `origin_utc`.
    #[must_use]
    pub const fn anchored(origin: Instant, origin_utc: DateTime<Utc>) -> Self {
        Self { origin, origin_utc }
    }
}

#[async_trait]
impl WakeClock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn to_utc(&self, at: Duration) -> DateTime<Utc> {
        offset_utc(self.origin_utc, Duration::ZERO, at)
    }

    async fn sleep_until(&self, deadline: Duration) {
        tokio::time::sleep_until(self.origin + deadline).await;
    }
}

#[cfg(target_os = "linux")]
pub use boot::BootClock;

#[cfg(target_os = "linux")]
mod boot {
    use std::io;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use nix::sys::time::TimeSpec;
    use nix::sys::timerfd::{ClockId as TimerClock, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
    use nix::time::{clock_gettime, ClockId};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, warn};

    use super::{offset_utc, WakeClock};

    /// Longest single sleep when no timerfd is available.
    const POLL_SLICE: Duration = Duration::from_secs(5);

    /// `CLOCK_BOOTTIME` clock with timerfd deadlines, anchored to UTC once.
    #[derive(Debug, Clone, Copy)]
    pub struct BootClock {
        alarm: bool,
        origin: Duration,
        origin_utc: DateTime<Utc>,
    }

    impl Default for BootClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl BootClock {
        /// Check whether wake alarms can be armed (`CAP_WAKE_ALARM`).
        #[must_use]
        pub fn new() -> Self {
            let alarm = TimerFd::new(TimerClock::CLOCK_BOOTTIME_ALARM, Self::flags()).is_ok();
            if !alarm {
                warn!("Cannot arm CLOCK_BOOTTIME_ALARM; deadlines will not wake a suspended host");
            }
            Self {
                alarm,
                origin: boottime(),
                origin_utc: Utc::now(),
            }
        }

        fn flags() -> TimerFlags {
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC
        }

        fn arm(&self, deadline: Duration) -> nix::Result<TimerFd> {
            let clock = if self.alarm {
                TimerClock::CLOCK_BOOTTIME_ALARM
            } else {
                TimerClock::CLOCK_BOOTTIME
            };
            let fd = TimerFd::new(clock, Self::flags())?;
            fd.set(
                Expiration::OneShot(TimeSpec::from_duration(deadline)),
                TimerSetTimeFlags::TFD_TIMER_ABSTIME,
            )?;
            Ok(fd)
        }

        async fn poll_until(&self, deadline: Duration) {
            loop {
                let now = self.now();
                if now >= deadline {
                    return;
                }
                tokio::time::sleep((deadline - now).min(POLL_SLICE)).await;
            }
        }
    }

    fn boottime() -> Duration {
        match clock_gettime(ClockId::CLOCK_BOOTTIME) {
            Ok(ts) => {
                let secs = u64::try_from(ts.tv_sec()).unwrap_or(0);
                let nanos = u32::try_from(ts.tv_nsec()).unwrap_or(0);
                Duration::new(secs, nanos)
            }
            Err(e) => {
                warn!(error = %e, "CLOCK_BOOTTIME unreadable");
                Duration::ZERO
            }
        }
    }

    async fn expired(fd: TimerFd) -> io::Result<()> {
        let fd = AsyncFd::new(fd)?;
        loop {
            let mut guard = fd.readable().await?;
            if let Ok(result) = guard.try_io(|inner| inner.get_ref().wait().map_err(io::Error::from)) {
                return result;
            }
        }
    }

    #[async_trait]
    impl WakeClock for BootClock {
        fn now(&self) -> Duration {
            boottime()
        }

        fn to_utc(&self, at: Duration) -> DateTime<Utc> {
            offset_utc(self.origin_utc, self.origin, at)
        }

        async fn sleep_until(&self, deadline: Duration) {
            let waited = match self.arm(deadline) {
                Ok(fd) => expired(fd).await,
                Err(e) => Err(io::Error::from(e)),
            };
            if let Err(e) = waited {
                debug!(error = %e, "Timerfd unavailable; polling boot time");
                self.poll_until(deadline).await;
            }
        }

        fn wakes_host(&self) -> bool {
            self.alarm
        }
    }
}

/// Clock for the running host: [`BootClock`] on Linux.
#[cfg(target_os = "linux")]
#[must_use]
pub fn system_clock() -> Arc<dyn WakeClock> {
    Arc::new(BootClock::new())
}

/// Clock for the running host: the tokio clock off Linux.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn system_clock() -> Arc<dyn WakeClock> {
    Arc::new(MonotonicClock::new())
}

/// One-shot timer that fires a callback when its clock reaches a deadline.
///
/// Arming replaces any pending deadline. A cancelled timer never fires.
#[derive(Debug)]
pub struct WakeTimer {
    clock: Arc<dyn WakeClock>,
    pending: Option<JoinHandle<()>>,
}

impl WakeTimer {
    /// Create an unarmed timer on `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn WakeClock>) -> Self {
        Self {
            clock,
            pending: None,
        }
    }

    /// Fire `fire` when the clock reads `at` (immediately if it has passed).
    pub fn arm<F>(&mut self, at: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        debug!(
            in_ms = at.saturating_sub(self.clock.now()).as_millis(),
            wakes_host = self.clock.wakes_host(),
            "Wake timer armed"
        );
        let clock = Arc::clone(&self.clock);
        self.pending = Some(tokio::spawn(async move {
            clock.sleep_until(at).await;
            fire();
        }));
    }

    /// Disarm. Returns `true` if a deadline was pending.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                debug!("Wake timer cancelled");
                true
            }
            _ => false,
        }
    }

    /// Whether a deadline is pending.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WakeTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn timer() -> (WakeTimer, Arc<dyn WakeClock>) {
        let clock: Arc<dyn WakeClock> = Arc::new(MonotonicClock::new());
        (WakeTimer::new(Arc::clone(&clock)), clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (mut timer, clock) = timer();
        let counter = fired.clone();
        timer.arm(clock.now() + Duration::from_secs(180), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_secs(179)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (mut timer, clock) = timer();
        let counter = fired.clone();
        timer.arm(clock.now() + Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.cancel());
        assert!(!timer.cancel());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (mut timer, clock) = timer();
        for secs in [1, 10] {
            let counter = fired.clone();
            timer.arm(clock.now() + Duration::from_secs(secs), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_maps_onto_anchor() {
        let origin_utc = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = MonotonicClock::anchored(Instant::now(), origin_utc);

        assert_eq!(clock.to_utc(Duration::ZERO), origin_utc);
        assert_eq!(
            clock.to_utc(Duration::from_secs(180)),
            origin_utc + TimeDelta::seconds(180)
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.now(), Duration::from_secs(30));
        assert!(!clock.wakes_host());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_boot_clock_timer_fires_on_boot_time() {
        let clock: Arc<dyn WakeClock> = Arc::new(BootClock::new());
        let mut timer = WakeTimer::new(Arc::clone(&clock));
        let deadline = clock.now() + Duration::from_millis(50);

        let (tx, rx) = tokio::sync::oneshot::channel();
        timer.arm(deadline, move || {
            let _ = tx.send(());
        });

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("boot-time deadline never fired")
            .unwrap();
        assert!(clock.now() >= deadline);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_boot_clock_maps_to_current_wall_time() {
        let clock = BootClock::new();
        let now = clock.now();
        assert!(now > Duration::ZERO);

        let mapped = clock.to_utc(now + Duration::from_secs(180));
        let expected = Utc::now() + TimeDelta::seconds(180);
        assert!((mapped - expected).num_seconds().abs() <= 1);
    }
}
