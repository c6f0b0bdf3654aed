//! The telemetry service: one instance owns the whole pipeline.
//!
//! [`TelemetryService`] holds the exclusion matcher, the payload assembler,
//! the dispatch queue and, through it, the shared HTTP client. It has an
//! explicit lifecycle: [`start`](TelemetryService::start) inside a tokio
//! runtime, [`shutdown`](TelemetryService::shutdown) before the runtime goes
//! away. Nothing is global.
//!
//! Host adapters use it in two steps:
//!
//! 1. [`begin`](TelemetryService::begin) when a request arrives. Returns
//!    `None` for excluded paths, otherwise an [`ExchangeContext`] that
//!    travels with the exchange.
//! 2. [`ExchangeContext::complete`] once the response is done, which
//!    assembles and submits the payload.
//!
//! Adapters that capture bodies themselves can call
//! [`record`](TelemetryService::record) directly.

use crate::capture::{CaptureBuffer, SharedCapture};
use crate::config::TelemetryConfig;
use crate::dispatch::{DispatchQueue, DispatchStats, DispatchTask, Submission};
use crate::error::Result;
use crate::path_matcher::PathMatcher;
use crate::payload::{
    CapturedBodies, ErrorInfo, ExchangeTiming, PayloadAssembler, RequestFacts, RequestSnapshot,
    ResponseFacts, ResponseSnapshot,
};
use crate::transport::{HttpTransport, Transport};
use std::sync::Arc;

/// Owner of the telemetry pipeline.
#[derive(Debug)]
pub struct TelemetryService {
    config: TelemetryConfig,
    matcher: PathMatcher,
    assembler: PayloadAssembler,
    queue: DispatchQueue,
}

impl TelemetryService {
    /// Validate `config`, build the collector client and start the workers.
    ///
    /// Fails on invalid configuration or when called outside a tokio runtime.
    pub fn start(config: TelemetryConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(config.transport_config())?;
        Self::start_with_transport(config, Arc::new(transport))
    }

    /// Start with a custom [`Transport`].
    pub fn start_with_transport(
        config: TelemetryConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let matcher = config.path_matcher();
        let assembler = PayloadAssembler::new(
            config.api_key.clone(),
            config.sdk_token.clone(),
            config.sdk_name.clone(),
            config.field_masker(),
        );
        let queue = DispatchQueue::start(transport, config.dispatch_config())?;

        tracing::info!(
            sdk = %config.sdk_name,
            excluded_paths = matcher.patterns().len(),
            masked_rules = assembler.masker().rules().len(),
            "Telemetry service started"
        );

        Ok(Self {
            config,
            matcher,
            assembler,
            queue,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// The payload assembler.
    pub fn assembler(&self) -> &PayloadAssembler {
        &self.assembler
    }

    /// Returns `true` if requests to `path` are skipped.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.matcher.is_excluded(path)
    }

    /// Start observing a request. Returns `None` if its path is excluded.
    pub fn begin<B>(&self, request: &http::Request<B>) -> Option<ExchangeContext> {
        if self.is_excluded(request.uri().path()) {
            tracing::trace!(path = %request.uri().path(), "Path excluded from telemetry");
            return None;
        }

        Some(ExchangeContext {
            timing: ExchangeTiming::start_now(),
            request: RequestSnapshot::from_request(request),
            request_capture: SharedCapture::new(self.config.max_body_bytes),
            max_body_bytes: self.config.max_body_bytes,
        })
    }

    /// Assemble and submit a payload for a finished exchange.
    ///
    /// Returns `None` when the request path is excluded. Masking happens on
    /// the dispatch worker.
    pub async fn record<Req, Res>(
        &self,
        request: &Req,
        response: Option<&Res>,
        bodies: CapturedBodies,
        error: Option<ErrorInfo>,
        timing: &ExchangeTiming,
    ) -> Option<Submission>
    where
        Req: RequestFacts + ?Sized,
        Res: ResponseFacts + ?Sized,
    {
        if self.is_excluded(request.path()) {
            tracing::trace!(path = %request.path(), "Path excluded from telemetry");
            return None;
        }

        let task = self
            .assembler
            .assemble_task(request, response, bodies, error, timing);
        Some(self.queue.submit(task).await)
    }

    /// Submit a prepared task.
    pub async fn submit(&self, task: DispatchTask) -> Submission {
        self.queue.submit(task).await
    }

    /// Dispatch counters.
    pub fn stats(&self) -> DispatchStats {
        self.queue.stats()
    }

    /// Stop accepting payloads, drain within the grace period and close the
    /// collector client.
    pub async fn shutdown(&self) {
        tracing::debug!("Shutting down telemetry service");
        self.queue.shutdown().await;
    }
}

/// Per-exchange state carried from request arrival to response completion.
#[derive(Debug)]
pub struct ExchangeContext {
    timing: ExchangeTiming,
    request: RequestSnapshot,
    request_capture: SharedCapture,
    max_body_bytes: usize,
}

impl ExchangeContext {
    /// The request as it arrived.
    pub fn request(&self) -> &RequestSnapshot {
        &self.request
    }

    /// Capture handle for the request body tap.
    pub fn request_capture(&self) -> &SharedCapture {
        &self.request_capture
    }

    /// A fresh capture handle for the response body tap.
    pub fn response_capture(&self) -> SharedCapture {
        SharedCapture::new(self.max_body_bytes)
    }

    /// Timing so far.
    pub fn timing(&self) -> &ExchangeTiming {
        &self.timing
    }

    /// Close the exchange and submit its payload.
    ///
    /// `response` is `None` when the handler failed before producing one.
    pub async fn complete(
        mut self,
        service: &TelemetryService,
        response: Option<&ResponseSnapshot>,
        response_body: CaptureBuffer,
        error: Option<ErrorInfo>,
    ) -> Submission {
        self.timing.finish();
        let bodies = CapturedBodies::new(self.request_capture.take(), response_body);
        let task =
            service
                .assembler
                .assemble_task(&self.request, response, bodies, error, &self.timing);
        service.submit(task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, TelemetryError};
    use crate::payload::TelemetryPayload;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<TelemetryPayload>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, payload: &TelemetryPayload) {
            self.sent.lock().unwrap().push(payload.clone());
        }
    }

    fn config() -> TelemetryConfig {
        TelemetryConfig::new("key", "token")
            .excluded_path("/health")
            .masked_keyword("token")
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let result = TelemetryService::start_with_transport(
            config(),
            Arc::new(RecordingTransport::default()),
        );
        assert!(matches!(result, Err(TelemetryError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = TelemetryService::start(TelemetryConfig::new("", "token"));
        assert!(matches!(
            result,
            Err(TelemetryError::Config(ConfigError::MissingCredential("api_key")))
        ));
    }

    #[tokio::test]
    async fn test_begin_skips_excluded_paths() {
        let transport = Arc::new(RecordingTransport::default());
        let service = TelemetryService::start_with_transport(config(), transport).unwrap();

        let health = http::Request::builder().uri("/health").body(()).unwrap();
        assert!(service.begin(&health).is_none());

        let users = http::Request::builder().uri("/users").body(()).unwrap();
        assert!(service.begin(&users).is_some());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_exchange_context_submits_masked_payload() {
        let transport = Arc::new(RecordingTransport::default());
        let service =
            TelemetryService::start_with_transport(config(), transport.clone()).unwrap();

        let req = http::Request::builder()
            .method("POST")
            .uri("/login")
            .body(())
            .unwrap();
        let ctx = service.begin(&req).unwrap();
        ctx.request_capture()
            .record(br#"{"user":"bob","password":"hunter2"}"#);

        let response = ResponseSnapshot::new(200, Default::default());
        let body = CaptureBuffer::from_slice(br#"{"token":"abc"}"#, 1024);
        let outcome = ctx.complete(&service, Some(&response), body, None).await;
        assert_eq!(outcome, Submission::Queued);

        service.shutdown().await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].data.request.body,
            json!({"user": "bob", "password": "*****"})
        );
        assert_eq!(sent[0].data.response.body, json!({"token": "*****"}));
    }

    #[tokio::test]
    async fn test_record_ignores_excluded_paths() {
        let transport = Arc::new(RecordingTransport::default());
        let service =
            TelemetryService::start_with_transport(config(), transport.clone()).unwrap();

        let req = http::Request::builder().uri("/health/").body(()).unwrap();
        let outcome = service
            .record(
                &RequestSnapshot::from_request(&req),
                Some(&ResponseSnapshot::new(200, Default::default())),
                CapturedBodies::default(),
                None,
                &ExchangeTiming::start_now(),
            )
            .await;

        assert_eq!(outcome, None);
        service.shutdown().await;
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
