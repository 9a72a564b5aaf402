//! Relay of a captured payload to the remote endpoint.
//!
//! One POST per cycle, no retry. The request carries the application id and
//! secret as headers and a JSON body `{"mac": ..., "data": ...}` where `data`
//! is the payload in lowercase hex. Any 2xx is a success; the response body
//! is read to the end and dropped before the outcome is reported so the
//! connection goes back to the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;

/// Header carrying the application id.
pub const APP_ID_HEADER: &str = "X-LC-Id";

/// Header carrying the application secret.
pub const APP_KEY_HEADER: &str = "X-LC-Key";

/// Encode bytes as lowercase hex.
#[must_use]
pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a hex string (either case).
///
/// # Errors
///
/// Returns an error on odd length or non-hex characters.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(text)
}

/// JSON body of a relay request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayBody {
    /// Beacon address.
    pub mac: String,
    /// Payload, lowercase hex.
    pub data: String,
}

/// Everything needed to relay one payload.
#[derive(Clone)]
pub struct RelayRequest {
    /// Endpoint URL.
    pub endpoint: String,
    /// Application id.
    pub app_id: String,
    /// Application secret.
    pub app_key: String,
    /// Beacon address.
    pub target_address: String,
    /// Captured payload.
    pub payload: Vec<u8>,
}

impl std::fmt::Debug for RelayRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRequest")
            .field("endpoint", &self.endpoint)
            .field("app_id", &self.app_id)
            .field("target_address", &self.target_address)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl RelayRequest {
    /// Build a request from a configuration snapshot and a payload.
    #[must_use]
    pub fn new(config: &RelayConfig, payload: Vec<u8>) -> Self {
        Self {
            endpoint: config.api_url.clone(),
            app_id: config.app_id.clone(),
            app_key: config.app_key.clone(),
            target_address: config.target_address.clone(),
            payload,
        }
    }

    /// JSON body for this request.
    #[must_use]
    pub fn body(&self) -> RelayBody {
        RelayBody {
            mac: self.target_address.clone(),
            data: encode_hex(&self.payload),
        }
    }
}

/// Result of one relay attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The endpoint answered 2xx.
    Success(u16),
    /// The endpoint answered with a non-2xx status.
    ServerError(u16),
    /// No HTTP exchange completed.
    NetworkError(String),
}

/// Something that can deliver a [`RelayRequest`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the request and classify the result.
    async fn post(&self, request: &RelayRequest) -> SendOutcome;
}

/// [`Transport`] over `reqwest`, bounded by a whole-request timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("beaconsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: &RelayRequest) -> SendOutcome {
        let response = self
            .client
            .post(&request.endpoint)
            .header(APP_ID_HEADER, &request.app_id)
            .header(APP_KEY_HEADER, &request.app_key)
            .json(&request.body())
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(endpoint = %request.endpoint, error = %e, "Relay request failed");
                return SendOutcome::NetworkError(e.to_string());
            }
        };

        let status = response.status();
        match response.bytes().await {
            Ok(body) => debug!(status = status.as_u16(), len = body.len(), "Drained response body"),
            Err(e) => debug!(status = status.as_u16(), error = %e, "Response body cut short"),
        }

        if status.is_success() {
            SendOutcome::Success(status.as_u16())
        } else {
            warn!(endpoint = %request.endpoint, status = status.as_u16(), "Endpoint rejected payload");
            SendOutcome::ServerError(status.as_u16())
        }
    }
}

/// Returned when a send is requested while another is outstanding.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("a send is already in progress")]
pub struct SendInProgress;

/// Single-flight sender.
///
/// Sends are never cancelled: a send abandoned by its cycle runs to
/// completion in the background and still blocks a new one until it ends.
/// The sender counts as idle from the moment an outcome is handed to its
/// callback.
pub struct Sender {
    transport: Arc<dyn Transport>,
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the send task lets go of it, including on
/// panic.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("in_flight", &self.is_sending())
            .finish_non_exhaustive()
    }
}

impl Sender {
    /// Create a sender over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a send is outstanding.
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Issue `request`; `deliver` receives the outcome exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`SendInProgress`] if a send is already outstanding.
    pub fn send<F>(&mut self, request: RelayRequest, deliver: F) -> Result<(), SendInProgress>
    where
        F: FnOnce(SendOutcome) + Send + 'static,
    {
        if self.is_sending() {
            warn!("Send requested while one is in progress; ignoring");
            return Err(SendInProgress);
        }

        let transport = Arc::clone(&self.transport);
        info!(
            endpoint = %request.endpoint,
            target = %request.target_address,
            bytes = request.payload.len(),
            "Relaying payload"
        );
        self.in_flight.store(true, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.in_flight));
        tokio::spawn(async move {
            let outcome = transport.post(&request).await;
            debug!(?outcome, "Send finished");
            drop(guard);
            deliver(outcome);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone)]
    struct Captured {
        app_id: Option<String>,
        app_key: Option<String>,
        content_type: Option<String>,
        body: RelayBody,
    }

    async fn spawn_endpoint(status: StatusCode) -> (String, Arc<Mutex<Vec<Captured>>>) {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let app = Router::new().route(
            "/beacon",
            post(move |headers: HeaderMap, Json(body): Json<RelayBody>| {
                let sink = sink.clone();
                async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    sink.lock().push(Captured {
                        app_id: header(APP_ID_HEADER),
                        app_key: header(APP_KEY_HEADER),
                        content_type: header("content-type"),
                        body,
                    });
                    (status, "{\"objectId\":\"abc\"}")
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/beacon"), captured)
    }

    fn request(endpoint: String, payload: Vec<u8>) -> RelayRequest {
        RelayRequest {
            endpoint,
            app_id: "app-id".to_string(),
            app_key: "app-key".to_string(),
            target_address: "AA:BB:CC:DD:EE:FF".to_string(),
            payload,
        }
    }

    #[test]
    fn test_hex_is_lowercase_and_reversible() {
        let bytes = [0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(encode_hex(&bytes), "deadbeef");
        assert_eq!(decode_hex("deadbeef").unwrap(), bytes);
        assert!(decode_hex("abc").is_err());
    }

    #[test]
    fn test_body_shape() {
        let body = request("http://x".to_string(), vec![0x01, 0x02]).body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"mac": "AA:BB:CC:DD:EE:FF", "data": "0102"})
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let rendered = format!("{:?}", request("http://x".to_string(), vec![1]));
        assert!(!rendered.contains("app-key"));
    }

    #[tokio::test]
    async fn test_success_carries_status_and_wire_contract() {
        let (endpoint, captured) = spawn_endpoint(StatusCode::CREATED).await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let outcome = transport.post(&request(endpoint, vec![0x01, 0x02])).await;
        assert_eq!(outcome, SendOutcome::Success(201));

        let seen = captured.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].app_id.as_deref(), Some("app-id"));
        assert_eq!(seen[0].app_key.as_deref(), Some("app-key"));
        assert_eq!(seen[0].content_type.as_deref(), Some("application/json"));
        assert_eq!(seen[0].body.data, "0102");
        assert_eq!(seen[0].body.mac, "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test]
    async fn test_non_2xx_is_server_error() {
        let (endpoint, _) = spawn_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let outcome = transport.post(&request(endpoint, vec![0xFF])).await;
        assert_eq!(outcome, SendOutcome::ServerError(500));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let outcome = transport
            .post(&request(format!("http://{addr}/beacon"), vec![0x01]))
            .await;
        assert!(matches!(outcome, SendOutcome::NetworkError(_)));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let app = Router::new().route(
            "/beacon",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                StatusCode::OK
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let outcome = transport
            .post(&request(format!("http://{addr}/beacon"), vec![0x01]))
            .await;
        assert!(matches!(outcome, SendOutcome::NetworkError(_)));
    }

    struct StallingTransport;

    #[async_trait]
    impl Transport for StallingTransport {
        async fn post(&self, _request: &RelayRequest) -> SendOutcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            SendOutcome::Success(200)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_is_single_flight() {
        let mut sender = Sender::new(Arc::new(StallingTransport));

        let (tx, rx) = oneshot::channel();
        sender
            .send(request("http://x".to_string(), vec![1]), move |o| {
                let _ = tx.send(o);
            })
            .unwrap();
        assert!(sender.is_sending());

        let second = sender.send(request("http://x".to_string(), vec![2]), |_| {});
        assert_eq!(second, Err(SendInProgress));

        assert_eq!(rx.await.unwrap(), SendOutcome::Success(200));
        tokio::task::yield_now().await;
        assert!(!sender.is_sending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_idle_once_outcome_delivered() {
        let mut sender = Sender::new(Arc::new(StallingTransport));
        let busy_at_delivery = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&sender.in_flight);
        let seen = Arc::clone(&busy_at_delivery);

        let (tx, rx) = oneshot::channel();
        sender
            .send(request("http://x".to_string(), vec![1]), move |o| {
                seen.store(flag.load(Ordering::SeqCst), Ordering::SeqCst);
                let _ = tx.send(o);
            })
            .unwrap();

        assert_eq!(rx.await.unwrap(), SendOutcome::Success(200));
        assert!(!busy_at_delivery.load(Ordering::SeqCst));
        // A follow-up send is accepted straight from the delivered outcome.
        assert!(sender
            .send(request("http://x".to_string(), vec![2]), |_| {})
            .is_ok());
    }
}
