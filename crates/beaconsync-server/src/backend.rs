//! Radio and sleep-inhibitor selection.
//!
//! With the `bluetooth` feature the daemon drives the default BlueZ adapter.
//! Without it, or with `mock-bluetooth`, a simulated radio stands in and
//! hears an iBeacon frame shortly after every scan starts.

use std::sync::Arc;
use std::time::Duration;

use beaconsync_core::{
    LeaseBackend, NoopInhibitor, Radio, SimEvent, SimulatedRadio, SleepInhibitor,
    SystemdInhibitor,
};
use tracing::info;

/// Delay before the simulated radio hears its beacon.
const SIMULATED_DELAY: Duration = Duration::from_secs(2);

/// Flags + Apple iBeacon manufacturer data, as a real beacon advertises it.
const SIMULATED_FRAME: [u8; 30] = [
    0x02, 0x01, 0x06, // flags
    0x1A, 0xFF, 0x4C, 0x00, 0x02, 0x15, // manufacturer data, iBeacon prefix
    0xE2, 0xC5, 0x6D, 0xB5, 0xDF, 0xFB, 0x48, 0xD2, // proximity UUID
    0xB0, 0x60, 0xD0, 0xF5, 0xA7, 0x10, 0x96, 0xE0, //
    0x00, 0x01, // major
    0x00, 0x02, // minor
    0xC5, // measured power
];

/// A radio plus the name it reports in health checks.
pub struct RadioBackend {
    /// The radio.
    pub radio: Arc<dyn Radio>,
    /// Short backend name.
    pub name: &'static str,
}

impl std::fmt::Debug for RadioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioBackend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RadioBackend {
    /// Simulated radio that hears [`SIMULATED_FRAME`] on every scan.
    #[must_use]
    pub fn simulated() -> Self {
        let radio = SimulatedRadio::with_default(vec![SimEvent::matching(
            SIMULATED_DELAY,
            SIMULATED_FRAME.to_vec(),
        )]);
        Self {
            radio: Arc::new(radio),
            name: "simulated",
        }
    }

    /// Open the radio selected by the enabled features.
    ///
    /// # Errors
    ///
    /// Returns an error if the BlueZ adapter cannot be opened.
    #[cfg(all(feature = "bluetooth", not(feature = "mock-bluetooth")))]
    pub async fn open() -> beaconsync_core::Result<Self> {
        let radio = beaconsync_core::BluerRadio::new().await?;
        Ok(Self {
            radio: Arc::new(radio),
            name: "bluez",
        })
    }

    /// Open the radio selected by the enabled features.
    ///
    /// # Errors
    ///
    /// Never fails for the simulated backend.
    #[cfg(any(not(feature = "bluetooth"), feature = "mock-bluetooth"))]
    #[allow(clippy::unused_async)]
    pub async fn open() -> beaconsync_core::Result<Self> {
        info!("Bluetooth support disabled; using the simulated radio");
        Ok(Self::simulated())
    }
}

/// Build the sleep inhibitor for `backend`.
#[must_use]
pub fn inhibitor(backend: LeaseBackend) -> Box<dyn SleepInhibitor> {
    match backend {
        LeaseBackend::Systemd => Box::new(SystemdInhibitor::new()),
        LeaseBackend::None => {
            info!("Wake lease is not backed by the host");
            Box::new(NoopInhibitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beaconsync_core::scanner::RadioEvent;
    use futures::StreamExt;

    #[test]
    fn test_simulated_frame_is_well_formed() {
        // Each AD structure's length byte covers exactly the rest of it.
        let mut offset = 0;
        while offset < SIMULATED_FRAME.len() {
            offset += usize::from(SIMULATED_FRAME[offset]) + 1;
        }
        assert_eq!(offset, SIMULATED_FRAME.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_backend_hears_beacon() {
        let backend = RadioBackend::simulated();
        assert_eq!(backend.name, "simulated");

        let mut events = backend.radio.start_scan("AA:BB:CC:DD:EE:FF").await.unwrap();
        match events.next().await {
            Some(RadioEvent::Advertisement(ad)) => {
                assert_eq!(ad.address, "AA:BB:CC:DD:EE:FF");
                assert_eq!(ad.payload, SIMULATED_FRAME);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_inhibitor_selection() {
        let mut noop = inhibitor(LeaseBackend::None);
        assert!(noop.engage(Duration::from_secs(1)).is_ok());
        noop.disengage();
    }
}
