//! Tower middleware recording every exchange through a [`TelemetryService`].
//!
//! ```ignore
//! use rustapi_telemetry::{TelemetryConfig, TelemetryLayer, TelemetryService};
//! use std::sync::Arc;
//!
//! let telemetry = Arc::new(TelemetryService::start(
//!     TelemetryConfig::new(api_key, sdk_token).excluded_path("/health"),
//! )?);
//!
//! let app = tower::ServiceBuilder::new()
//!     .layer(TelemetryLayer::new(telemetry.clone()))
//!     .service(handler);
//!
//! // ... serve ...
//!
//! telemetry.shutdown().await;
//! ```
//!
//! Both bodies are wrapped in [`CaptureBody`]. The payload is assembled when
//! the response body has been fully sent, so `load_time` covers streaming
//! too. Excluded paths get pass-through bodies and produce nothing.
//!
//! When the inner service fails, a payload carrying the error is submitted
//! and the error is returned to the caller unchanged.

use crate::capture::{CaptureBuffer, CaptureBody, CompletionHook};
use crate::payload::{ErrorInfo, ResponseSnapshot};
use crate::service::TelemetryService;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body::Body;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Layer applying [`TelemetryMiddleware`].
#[derive(Clone)]
pub struct TelemetryLayer {
    telemetry: Arc<TelemetryService>,
}

impl TelemetryLayer {
    /// Record exchanges through `telemetry`.
    pub fn new(telemetry: Arc<TelemetryService>) -> Self {
        Self { telemetry }
    }

    /// The underlying service.
    pub fn telemetry(&self) -> &Arc<TelemetryService> {
        &self.telemetry
    }
}

impl fmt::Debug for TelemetryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for TelemetryLayer {
    type Service = TelemetryMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TelemetryMiddleware {
            inner,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Service recording each exchange it forwards to `S`.
#[derive(Clone)]
pub struct TelemetryMiddleware<S> {
    inner: S,
    telemetry: Arc<TelemetryService>,
}

impl<S: fmt::Debug> fmt::Debug for TelemetryMiddleware<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryMiddleware")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TelemetryMiddleware<S>
where
    S: Service<Request<CaptureBody<ReqBody>>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + fmt::Debug + Send + 'static,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ResBody: Body<Data = Bytes> + Send + 'static,
{
    type Response = Response<CaptureBody<ResBody>>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the one poll_ready was called on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let telemetry = self.telemetry.clone();

        let Some(ctx) = telemetry.begin(&req) else {
            let req = req.map(CaptureBody::passthrough);
            return Box::pin(async move {
                let res = inner.call(req).await?;
                Ok(res.map(CaptureBody::passthrough))
            });
        };

        let request_capture = ctx.request_capture().clone();
        let req = req.map(|body| CaptureBody::tap(body, request_capture));

        Box::pin(async move {
            match inner.call(req).await {
                Ok(res) => {
                    let snapshot = ResponseSnapshot::from_response(&res);
                    let response_capture = ctx.response_capture();
                    let hook: CompletionHook = Box::new(move |buffer: CaptureBuffer| {
                        Box::pin(async move {
                            ctx.complete(&telemetry, Some(&snapshot), buffer, None)
                                .await;
                        }) as BoxFuture<'static, ()>
                    });
                    Ok(res.map(|body| CaptureBody::tap_with_hook(body, response_capture, hook)))
                }
                Err(err) => {
                    let error = ErrorInfo::from_error(&err);
                    tracing::debug!(error = %err, "Inner service failed, recording error");
                    ctx.complete(&telemetry, None, CaptureBuffer::new(0), Some(error))
                        .await;
                    Err(err)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::payload::TelemetryPayload;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use futures_util::stream;
    use http_body::Frame;
    use http_body_util::{BodyExt, Full, StreamBody};
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::Mutex;
    use tower::{service_fn, ServiceExt};

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

    fn start(transport: Arc<RecordingTransport>) -> Arc<TelemetryService> {
        let config = TelemetryConfig::new("key", "token")
            .excluded_path("/health")
            .masked_keyword("api_key");
        Arc::new(TelemetryService::start_with_transport(config, transport).unwrap())
    }

    async fn echo(
        req: Request<CaptureBody<Full<Bytes>>>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let body = req.into_body().collect().await.unwrap().to_bytes();
        Ok(Response::builder()
            .status(201)
            .header("content-type", "application/json")
            .body(Full::new(body))
            .unwrap())
    }

    #[tokio::test]
    async fn test_response_passes_through_and_payload_recorded() {
        let transport = Arc::new(RecordingTransport::default());
        let telemetry = start(transport.clone());
        let svc = TelemetryLayer::new(telemetry.clone()).layer(service_fn(echo));

        let req = Request::builder()
            .method("POST")
            .uri("/keys")
            .body(Full::new(Bytes::from_static(br#"{"api_key":"abc","name":"n"}"#)))
            .unwrap();
        let res = svc.oneshot(req).await.unwrap();
        assert_eq!(res.status(), 201);

        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"api_key":"abc","name":"n"}"#);

        telemetry.shutdown().await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let data = &sent[0].data;
        assert_eq!(data.request.method, "POST");
        assert_eq!(data.request.body, json!({"api_key": "*****", "name": "n"}));
        assert_eq!(data.response.body, json!({"api_key": "*****", "name": "n"}));
        assert_eq!(data.response.code, 201);
        assert_eq!(data.response.size, 28);
    }

    #[tokio::test]
    async fn test_excluded_path_produces_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let telemetry = start(transport.clone());
        let svc = TelemetryLayer::new(telemetry.clone()).layer(service_fn(echo));

        let req = Request::builder()
            .uri("/health")
            .body(Full::new(Bytes::from_static(b"ok")))
            .unwrap();
        let res = svc.oneshot(req).await.unwrap();
        assert!(!res.body().is_capturing());
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        telemetry.shutdown().await;
        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(telemetry.stats().submitted, 0);
    }

    #[derive(Debug)]
    struct HandlerError;

    impl fmt::Display for HandlerError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("handler exploded")
        }
    }

    #[tokio::test]
    async fn test_inner_error_is_returned_and_recorded() {
        let transport = Arc::new(RecordingTransport::default());
        let telemetry = start(transport.clone());
        let failing = service_fn(|_req: Request<CaptureBody<Full<Bytes>>>| async {
            Err::<Response<Full<Bytes>>, _>(HandlerError)
        });
        let svc = TelemetryLayer::new(telemetry.clone()).layer(failing);

        let req = Request::builder()
            .uri("/boom")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = svc.oneshot(req).await.unwrap_err();
        assert_eq!(err.to_string(), "handler exploded");

        telemetry.shutdown().await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let data = &sent[0].data;
        assert_eq!(data.response.code, 500);
        assert_eq!(data.errors.len(), 1);
        assert_eq!(data.errors[0].error_type, "HandlerError");
        assert_eq!(data.errors[0].message, "handler exploded");
    }

    impl std::error::Error for HandlerError {}

    #[tokio::test]
    async fn test_response_body_error_records_partial_capture() {
        let transport = Arc::new(RecordingTransport::default());
        let telemetry = start(transport.clone());
        let broken = service_fn(|_req: Request<CaptureBody<Full<Bytes>>>| async {
            let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = vec![
                Ok(Frame::data(Bytes::from_static(b"partial"))),
                Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "upstream gone",
                )),
            ];
            Ok::<_, Infallible>(Response::new(StreamBody::new(stream::iter(frames))))
        });
        let svc = TelemetryLayer::new(telemetry.clone()).layer(broken);

        let req = Request::builder()
            .uri("/download")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let res = svc.oneshot(req).await.unwrap();
        let err = res.into_body().collect().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        // The hook was detached onto the runtime; let it submit.
        for _ in 0..100 {
            if telemetry.stats().submitted == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        telemetry.shutdown().await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.response.body, json!("partial"));
        assert_eq!(sent[0].data.response.size, 7);
    }

    #[tokio::test]
    async fn test_boxed_inner_error_reports_concrete_type() {
        type BoxError = Box<dyn std::error::Error + Send + Sync>;

        let transport = Arc::new(RecordingTransport::default());
        let telemetry = start(transport.clone());
        let failing = service_fn(|_req: Request<CaptureBody<Full<Bytes>>>| async {
            Err::<Response<Full<Bytes>>, BoxError>(Box::new(HandlerError))
        });
        let svc = TelemetryLayer::new(telemetry.clone()).layer(failing);

        let req = Request::builder()
            .uri("/boxed")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = svc.oneshot(req).await.unwrap_err();
        assert!(err.is::<HandlerError>());

        telemetry.shutdown().await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.errors[0].error_type, "HandlerError");
        assert_eq!(sent[0].data.errors[0].message, "handler exploded");
    }
}
