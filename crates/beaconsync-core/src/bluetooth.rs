//! BlueZ radio backend.
//!
//! Scans through `bluer` with an LE-only discovery filter that reports
//! duplicate advertisements, so a beacon that is already known to BlueZ is
//! still seen on every scan. A cached, unpaired target is removed before
//! discovery starts so the reported device reflects a fresh advertisement.
//! BlueZ does not hand out the raw advertising packet; the payload is
//! rebuilt from the device's advertising, manufacturer and service data.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::scanner::{
    combine_advertisement, Advertisement, Radio, RadioError, RadioEvent, RadioStream,
    ALREADY_STARTED_CODE, INTERNAL_ERROR_CODE, UNSUPPORTED_CODE,
};

/// Radio backed by the default BlueZ adapter.
pub struct BluerRadio {
    adapter: Adapter,
    _session: Session,
}

impl std::fmt::Debug for BluerRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluerRadio")
            .field("adapter", &self.adapter.name())
            .finish_non_exhaustive()
    }
}

impl BluerRadio {
    /// Connect to BlueZ and take the default adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the D-Bus session cannot be opened or there is no
    /// adapter.
    pub async fn new() -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|e| SyncError::BluetoothInitFailed(e.to_string()))?;
        let adapter = session.default_adapter().await.map_err(|e| {
            warn!(error = %e, "No default Bluetooth adapter");
            SyncError::BluetoothAdapterNotFound
        })?;

        info!(adapter = %adapter.name(), "Using Bluetooth adapter");
        Ok(Self {
            adapter,
            _session: session,
        })
    }
}

fn radio_error(err: &bluer::Error) -> RadioError {
    let code = match err.kind {
        bluer::ErrorKind::NotReady => return RadioError::Disabled,
        bluer::ErrorKind::InProgress | bluer::ErrorKind::AlreadyExists => ALREADY_STARTED_CODE,
        bluer::ErrorKind::NotSupported => UNSUPPORTED_CODE,
        _ => INTERNAL_ERROR_CODE,
    };
    RadioError::Failed {
        code,
        message: err.message.clone(),
    }
}

async fn read_payload(adapter: &Adapter, address: Address) -> Vec<u8> {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            warn!(%address, error = %e, "Device vanished before it could be read");
            return Vec::new();
        }
    };

    let raw: BTreeMap<u8, Vec<u8>> = match device.advertising_data().await {
        Ok(Some(data)) => data.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    let manufacturer: BTreeMap<u16, Vec<u8>> = match device.manufacturer_data().await {
        Ok(Some(data)) => data.into_iter().collect(),
        _ => BTreeMap::new(),
    };
    let service: BTreeMap<u128, Vec<u8>> = match device.service_data().await {
        Ok(Some(data)) => data
            .into_iter()
            .map(|(uuid, bytes)| (uuid.as_u128(), bytes))
            .collect(),
        _ => BTreeMap::new(),
    };

    combine_advertisement(&raw, &manufacturer, &service)
}

/// Drop BlueZ's cached copy of `address` so discovery reports it afresh.
/// Paired devices are left alone.
async fn forget_cached(adapter: &Adapter, address: Address) {
    let known = match adapter.device_addresses().await {
        Ok(known) => known,
        Err(e) => {
            debug!(error = %e, "Could not list known devices");
            return;
        }
    };
    if !known.contains(&address) {
        return;
    }

    if let Ok(device) = adapter.device(address) {
        if device.is_paired().await.unwrap_or(true) {
            debug!(%address, "Target is paired; keeping cached device");
            return;
        }
    }

    match adapter.remove_device(address).await {
        Ok(()) => debug!(%address, "Removed cached target before scanning"),
        Err(e) => debug!(%address, error = %e, "Could not remove cached target"),
    }
}

#[async_trait]
impl Radio for BluerRadio {
    async fn is_enabled(&self) -> bool {
        match self.adapter.is_powered().await {
            Ok(powered) => powered,
            Err(e) => {
                warn!(error = %e, "Could not read adapter power state");
                false
            }
        }
    }

    async fn start_scan(&self, target: &str) -> std::result::Result<RadioStream, RadioError> {
        let wanted = Address::from_str(target).map_err(|e| RadioError::Failed {
            code: INTERNAL_ERROR_CODE,
            message: format!("invalid target address {target}: {e}"),
        })?;

        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..DiscoveryFilter::default()
            })
            .await
            .map_err(|e| radio_error(&e))?;

        forget_cached(&self.adapter, wanted).await;

        let events = self
            .adapter
            .discover_devices_with_changes()
            .await
            .map_err(|e| radio_error(&e))?;
        debug!(%wanted, "BlueZ discovery started");

        let adapter = self.adapter.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(address) if address == wanted => {
                        let payload = read_payload(&adapter, address).await;
                        Some(RadioEvent::Advertisement(Advertisement {
                            address: address.to_string(),
                            payload,
                        }))
                    }
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }
}
