//! Delivery of payloads to the collector.
//!
//! Delivery is fire-and-forget: one POST per payload, no retries, and the
//! response body is never read. Failures are logged and dropped.

use crate::error::TransportError;
use crate::payload::TelemetryPayload;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::seq::SliceRandom;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io::Write;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Collector endpoints used when no custom endpoint is configured.
pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "https://rocknrolla.treblle.com",
    "https://punisher.treblle.com",
    "https://sicario.treblle.com",
];

/// Header carrying the SDK token.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Default connect and read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Sends payloads somewhere.
///
/// Implementations must not panic or propagate failures: a send either
/// succeeds or is logged and forgotten.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one payload, at most once.
    async fn send(&self, payload: &TelemetryPayload);

    /// Release resources. Sends after close are skipped.
    async fn close(&self) {}
}

/// Settings for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Custom collector URL; a default endpoint is picked per send otherwise.
    pub endpoint: Option<String>,
    /// Value of the `x-api-key` header.
    pub sdk_token: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Time allowed for each read from the collector once connected.
    pub read_timeout: Duration,
    /// Gzip the JSON body.
    pub compress: bool,
    /// Log payload sizes and collector statuses.
    pub debug: bool,
}

impl TransportConfig {
    /// Settings with default timeouts and compression on.
    pub fn new(sdk_token: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            sdk_token: sdk_token.into(),
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            compress: true,
            debug: false,
        }
    }
}

/// `reqwest`-based collector client.
///
/// The client is built once and shared by every worker.
#[derive(Debug)]
pub struct HttpTransport {
    config: TransportConfig,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpTransport {
    /// Build the shared client.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;

        Ok(Self {
            config,
            client: RwLock::new(Some(client)),
        })
    }

    /// The URL the next payload goes to.
    pub fn endpoint(&self) -> String {
        match &self.config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => DEFAULT_ENDPOINTS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(DEFAULT_ENDPOINTS[0])
                .to_string(),
        }
    }

    /// Encode a payload for the wire. Returns the body and the JSON length.
    pub fn encode(&self, payload: &TelemetryPayload) -> Result<(Vec<u8>, usize), TransportError> {
        let json = serde_json::to_vec(payload)?;
        let original_len = json.len();

        if !self.config.compress {
            return Ok((json, original_len));
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(original_len / 2), Compression::default());
        encoder.write_all(&json)?;
        Ok((encoder.finish()?, original_len))
    }

    /// Perform one delivery attempt and report its outcome.
    pub async fn try_send(&self, payload: &TelemetryPayload) -> Result<StatusCode, TransportError> {
        let client = self
            .client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)?;

        let (body, original_len) = self.encode(payload)?;
        if self.config.debug {
            tracing::debug!(
                original_bytes = original_len,
                encoded_bytes = body.len(),
                compressed = self.config.compress,
                "Telemetry payload encoded"
            );
        }

        let mut request = client
            .post(self.endpoint())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT_ENCODING, "gzip, deflate")
            .header(API_KEY_HEADER, &self.config.sdk_token);
        if self.config.compress {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        // The collector's body carries nothing we act on.
        drop(response);

        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(status)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &TelemetryPayload) {
        match self.try_send(payload).await {
            Ok(status) => {
                if self.config.debug {
                    tracing::debug!(status = status.as_u16(), "Telemetry payload delivered");
                }
            }
            Err(TransportError::Closed) => {
                tracing::debug!("Transport closed, payload skipped");
            }
            Err(e) => {
                if self.config.debug {
                    tracing::error!(error = %e, "Failed to deliver telemetry payload");
                } else {
                    tracing::warn!(error = %e, "Failed to deliver telemetry payload");
                }
            }
        }
    }

    async fn close(&self) {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if client.is_some() {
            tracing::debug!("Telemetry HTTP client closed");
        }
    }
}
