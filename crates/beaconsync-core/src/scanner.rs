//! Bounded, filtered radio scan for one beacon.
//!
//! [`Scanner`] runs at most one scan at a time against a [`Radio`] backend
//! and reports exactly one [`ScanOutcome`] per accepted invocation, unless
//! the scan is stopped first, in which case it reports nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failure code reported when the radio is switched off. Negative so it can
/// never collide with a radio-stack code.
pub const RADIO_DISABLED_CODE: i32 = -1;

/// Radio-stack code for "scan already started".
pub const ALREADY_STARTED_CODE: i32 = 1;

/// Radio-stack internal error code; also used for a match with no payload.
pub const INTERNAL_ERROR_CODE: i32 = 3;

/// Radio-stack code for "feature unsupported".
pub const UNSUPPORTED_CODE: i32 = 4;

/// One advertisement seen by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertiser address, `XX:XX:XX:XX:XX:XX`.
    pub address: String,
    /// Raw advertised bytes.
    pub payload: Vec<u8>,
}

/// Event delivered by a running scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// An advertisement was received.
    Advertisement(Advertisement),
    /// The radio stack aborted the scan with a code.
    Failed(i32),
}

/// Stream of events for one scan. Dropping it stops the scan.
pub type RadioStream = BoxStream<'static, RadioEvent>;

/// Errors a radio backend can raise when starting a scan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadioError {
    /// The radio is powered off.
    #[error("radio is disabled")]
    Disabled,

    /// The radio stack refused to start the scan.
    #[error("scan failed to start (code {code}): {message}")]
    Failed {
        /// Radio-stack error code.
        code: i32,
        /// Backend message.
        message: String,
    },
}

impl RadioError {
    /// Error code to report upstream.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Disabled => RADIO_DISABLED_CODE,
            Self::Failed { code, .. } => *code,
        }
    }
}

/// A radio capable of filtered LE scanning.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Whether the radio is currently powered.
    async fn is_enabled(&self) -> bool;

    /// Start scanning for `target`.
    ///
    /// Backends should filter on the address where the stack allows it;
    /// the scanner matches again regardless.
    ///
    /// # Errors
    ///
    /// Returns a [`RadioError`] if the scan cannot be started.
    async fn start_scan(&self, target: &str) -> Result<RadioStream, RadioError>;
}

/// Why a scan produced no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    /// Radio was off when the scan was requested.
    RadioDisabled,
    /// The target matched but advertised no bytes.
    EmptyPayload,
    /// The radio stack reported an error code.
    Radio(i32),
}

impl ScanFailure {
    /// Numeric code for this failure.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::RadioDisabled => RADIO_DISABLED_CODE,
            Self::EmptyPayload => INTERNAL_ERROR_CODE,
            Self::Radio(code) => code,
        }
    }
}

impl From<RadioError> for ScanFailure {
    fn from(err: RadioError) -> Self {
        match err {
            RadioError::Disabled => Self::RadioDisabled,
            RadioError::Failed { code, .. } => Self::Radio(code),
        }
    }
}

/// Result of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The target advertised these bytes.
    Payload(Vec<u8>),
    /// The scan could not produce a payload.
    Failed(ScanFailure),
    /// Nothing matched before the timeout.
    Timeout,
}

/// Returned when a scan is requested while another is outstanding.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("a scan is already in progress")]
pub struct ScanInProgress;

struct ActiveScan {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Single-flight scanner with a fixed timeout.
pub struct Scanner {
    radio: Arc<dyn Radio>,
    timeout: Duration,
    active: Option<ActiveScan>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("timeout", &self.timeout)
            .field("in_flight", &self.is_scanning())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Create a scanner over `radio`.
    #[must_use]
    pub fn new(radio: Arc<dyn Radio>, timeout: Duration) -> Self {
        Self {
            radio,
            timeout,
            active: None,
        }
    }

    /// Whether a scan is outstanding.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|scan| !scan.handle.is_finished())
    }

    /// Start a scan for `target`; `deliver` receives the outcome exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`ScanInProgress`] if a scan is already outstanding; `deliver`
    /// is dropped without being called.
    pub fn start_scan<F>(&mut self, target: String, deliver: F) -> Result<(), ScanInProgress>
    where
        F: FnOnce(ScanOutcome) + Send + 'static,
    {
        if self.is_scanning() {
            warn!(%target, "Scan requested while one is in progress; ignoring");
            return Err(ScanInProgress);
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let radio = Arc::clone(&self.radio);
        let timeout = self.timeout;

        info!(%target, timeout_secs = timeout.as_secs(), "Starting scan");
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => return,
                outcome = run_scan(radio.as_ref(), &target, timeout) => outcome,
            };
            if token.is_cancelled() {
                return;
            }
            debug!(%target, ?outcome, "Scan finished");
            deliver(outcome);
        });

        self.active = Some(ActiveScan { cancel, handle });
        Ok(())
    }

    /// Cancel the outstanding scan, if any. Its outcome is never delivered.
    pub fn stop_scan(&mut self) {
        if let Some(scan) = self.active.take() {
            if !scan.handle.is_finished() {
                info!("Stopping in-flight scan");
            }
            scan.cancel.cancel();
            scan.handle.abort();
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.stop_scan();
    }
}

async fn run_scan(radio: &dyn Radio, target: &str, timeout: Duration) -> ScanOutcome {
    // The deadline covers the radio checks as well as the wait for a match.
    tokio::time::timeout(timeout, scan_until_match(radio, target))
        .await
        .unwrap_or_else(|_| {
            info!(%target, "Scan timed out");
            ScanOutcome::Timeout
        })
}

async fn scan_until_match(radio: &dyn Radio, target: &str) -> ScanOutcome {
    if !radio.is_enabled().await {
        warn!(%target, "Radio disabled; not scanning");
        return ScanOutcome::Failed(ScanFailure::RadioDisabled);
    }

    let mut events = match radio.start_scan(target).await {
        Ok(events) => events,
        Err(e) => {
            warn!(%target, error = %e, "Radio refused to scan");
            return ScanOutcome::Failed(e.into());
        }
    };

    while let Some(event) = events.next().await {
        match event {
            RadioEvent::Advertisement(ad) if ad.address.eq_ignore_ascii_case(target) => {
                if ad.payload.is_empty() {
                    warn!(%target, "Target advertised an empty payload");
                    return ScanOutcome::Failed(ScanFailure::EmptyPayload);
                }
                return ScanOutcome::Payload(ad.payload);
            }
            RadioEvent::Advertisement(ad) => {
                debug!(address = %ad.address, "Ignoring non-target advertisement");
            }
            RadioEvent::Failed(code) => {
                warn!(%target, code, "Radio aborted scan");
                return ScanOutcome::Failed(ScanFailure::Radio(code));
            }
        }
    }
    warn!(%target, "Radio ended scan without a result");
    ScanOutcome::Failed(ScanFailure::Radio(INTERNAL_ERROR_CODE))
}

/// Advertising data type codes used when rebuilding a payload.
pub mod ad_type {
    /// Service data, 16-bit UUID.
    pub const SERVICE_DATA_16: u8 = 0x16;
    /// Service data, 32-bit UUID.
    pub const SERVICE_DATA_32: u8 = 0x20;
    /// Service data, 128-bit UUID.
    pub const SERVICE_DATA_128: u8 = 0x21;
    /// Manufacturer specific data.
    pub const MANUFACTURER_DATA: u8 = 0xFF;
}

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;
const UUID32_MASK: u128 = 0xFFFF_FFFF_0000_0000_0000_0000_0000_0000;

/// Append one `len, type, data` structure. Data longer than a structure can
/// hold is skipped.
pub fn push_ad_structure(buf: &mut Vec<u8>, kind: u8, data: &[u8]) {
    let Ok(len) = u8::try_from(data.len() + 1) else {
        warn!(kind, len = data.len(), "AD structure too long; skipped");
        return;
    };
    buf.push(len);
    buf.push(kind);
    buf.extend_from_slice(data);
}

/// Encode a type-keyed advertising data map as raw AD structures, in type
/// order.
#[must_use]
pub fn encode_ad_structures(structures: &BTreeMap<u8, Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    for (kind, data) in structures {
        push_ad_structure(&mut buf, *kind, data);
    }
    buf
}

/// Append manufacturer data (company id little-endian, then data).
pub fn push_manufacturer_data(buf: &mut Vec<u8>, company_id: u16, data: &[u8]) {
    let mut body = company_id.to_le_bytes().to_vec();
    body.extend_from_slice(data);
    push_ad_structure(buf, ad_type::MANUFACTURER_DATA, &body);
}

/// Append service data, using the 16-bit form when `uuid` is a SIG UUID.
pub fn push_service_data(buf: &mut Vec<u8>, uuid: u128, data: &[u8]) {
    if uuid & !UUID32_MASK == BLUETOOTH_BASE_UUID && (uuid >> 96) <= u128::from(u16::MAX) {
        #[allow(clippy::cast_possible_truncation)]
        let short = (uuid >> 96) as u16;
        let mut body = short.to_le_bytes().to_vec();
        body.extend_from_slice(data);
        push_ad_structure(buf, ad_type::SERVICE_DATA_16, &body);
    } else {
        let mut body = uuid.to_le_bytes().to_vec();
        body.extend_from_slice(data);
        push_ad_structure(buf, ad_type::SERVICE_DATA_128, &body);
    }
}

/// Rebuild one advertisement from the separate views a radio stack keeps.
///
/// `raw` holds type-keyed AD structures. Manufacturer and service data are
/// appended from their dedicated maps; when a map is non-empty, the raw
/// structures of the same kind are dropped so nothing is emitted twice.
#[must_use]
pub fn combine_advertisement(
    raw: &BTreeMap<u8, Vec<u8>>,
    manufacturer: &BTreeMap<u16, Vec<u8>>,
    service: &BTreeMap<u128, Vec<u8>>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    for (kind, data) in raw {
        let covered = match *kind {
            ad_type::MANUFACTURER_DATA => !manufacturer.is_empty(),
            ad_type::SERVICE_DATA_16 | ad_type::SERVICE_DATA_32 | ad_type::SERVICE_DATA_128 => {
                !service.is_empty()
            }
            _ => false,
        };
        if !covered {
            push_ad_structure(&mut buf, *kind, data);
        }
    }
    for (company_id, data) in manufacturer {
        push_manufacturer_data(&mut buf, *company_id, data);
    }
    for (uuid, data) in service {
        push_service_data(&mut buf, *uuid, data);
    }
    buf
}
