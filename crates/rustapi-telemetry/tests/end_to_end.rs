//! Full pipeline: tower middleware, capture, masking, dispatch and delivery
//! to a mock collector.

use bytes::Bytes;
use flate2::read::GzDecoder;
use http::{Request, Response};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use rustapi_telemetry::{
    CaptureBody, CaptureReader, CaptureWriter, CapturedBodies, ExchangeTiming,
    RequestSnapshot, ResponseSnapshot, Submission, TelemetryConfig, TelemetryLayer,
    TelemetryService,
};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::io::{Read, Write};
use std::sync::Arc;
use tower::{service_fn, Layer, ServiceExt};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn collector() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

fn config(server: &MockServer) -> TelemetryConfig {
    TelemetryConfig::new("api-key", "sdk-token")
        .endpoint(server.uri())
        .excluded_path("/health")
        .excluded_path("internal/*")
        .masked_keyword("api_key")
}

async fn delivered(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|req| {
            let mut json = String::new();
            GzDecoder::new(&req.body[..]).read_to_string(&mut json).unwrap();
            serde_json::from_str(&json).unwrap()
        })
        .collect()
}

async fn echo(req: Request<CaptureBody<Full<Bytes>>>) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = req.into_body().collect().await?.to_bytes();
    Ok(Response::builder()
        .header("content-type", "application/json")
        .body(Full::new(body))
        .unwrap())
}

#[tokio::test]
async fn test_excluded_paths_never_produce_payloads() {
    let server = collector().await;
    let telemetry = Arc::new(TelemetryService::start(config(&server)).unwrap());
    let layer = TelemetryLayer::new(telemetry.clone());

    for uri in ["/health", "/health/", "/internal/metrics"] {
        let svc = layer.layer(service_fn(echo));
        let req = Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        let res = svc.oneshot(req).await.unwrap();
        res.into_body().collect().await.unwrap();
    }

    telemetry.shutdown().await;
    assert!(delivered(&server).await.is_empty());
    assert_eq!(telemetry.stats().submitted, 0);
}

#[tokio::test]
async fn test_masked_request_produces_one_payload() {
    let server = collector().await;
    let telemetry = Arc::new(TelemetryService::start(config(&server)).unwrap());
    let svc = TelemetryLayer::new(telemetry.clone()).layer(service_fn(echo));

    let req = Request::builder()
        .method("PUT")
        .uri("/accounts/9?verbose=1")
        .header("host", "api.example.com")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Full::new(Bytes::from_static(
            br#"{"api_key":"live_123","profile":{"password":"pw","name":"Ada"}}"#,
        )))
        .unwrap();
    let res = svc.oneshot(req).await.unwrap();
    let echoed = res.into_body().collect().await.unwrap().to_bytes();

    // The client sees the original, unmasked bytes.
    assert_eq!(
        &echoed[..],
        br#"{"api_key":"live_123","profile":{"password":"pw","name":"Ada"}}"#
    );

    telemetry.shutdown().await;

    let payloads = delivered(&server).await;
    assert_eq!(payloads.len(), 1);
    let data = &payloads[0]["data"];
    let masked = json!({"api_key": "*****", "profile": {"password": "*****", "name": "Ada"}});
    assert_eq!(data["request"]["body"], masked);
    assert_eq!(data["response"]["body"], masked);
    assert_eq!(data["request"]["ip"], json!("203.0.113.9"));
    assert_eq!(data["request"]["query"], json!({"verbose": "1"}));
    assert!(data["response"]["load_time"].as_u64().is_some());
}

#[tokio::test]
async fn test_streamed_response_truncated_in_payload_only() {
    let server = collector().await;
    let telemetry =
        Arc::new(TelemetryService::start(config(&server).max_body_bytes(10)).unwrap());

    let streaming = service_fn(|_req: Request<CaptureBody<Full<Bytes>>>| async {
        let chunks: Vec<Result<Frame<Bytes>, Infallible>> = ["0123", "4567", "89ab", "cde"]
            .into_iter()
            .map(|c| Ok(Frame::data(Bytes::from_static(c.as_bytes()))))
            .collect();
        Ok::<_, Infallible>(Response::new(StreamBody::new(futures_util::stream::iter(chunks))))
    });
    let svc = TelemetryLayer::new(telemetry.clone()).layer(streaming);

    let req = Request::builder()
        .uri("/stream")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let res = svc.oneshot(req).await.unwrap();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"0123456789abcde");

    telemetry.shutdown().await;

    let payloads = delivered(&server).await;
    assert_eq!(payloads.len(), 1);
    let response = &payloads[0]["data"]["response"];
    assert_eq!(response["body"], json!("0123456789"));
    assert_eq!(response["size"], json!(15));
    assert_eq!(payloads[0]["data"]["request"]["body"], Value::Null);
}

#[tokio::test]
async fn test_blocking_adapter_with_sync_taps() {
    let server = collector().await;
    let telemetry = TelemetryService::start(config(&server)).unwrap();

    let http_req = Request::builder()
        .method("POST")
        .uri("/legacy")
        .body(())
        .unwrap();
    let mut timing = ExchangeTiming::start_now();

    let mut reader = CaptureReader::new(&br#"{"api_key":"k","n":1}"#[..], 1024);
    let mut consumed = Vec::new();
    reader.read_to_end(&mut consumed).unwrap();

    let mut writer = CaptureWriter::new(Vec::new(), 1024);
    writer.write_all(b"accepted").unwrap();

    let (_, request_body) = reader.into_parts();
    let (sent_to_client, response_body) = writer.into_parts();
    assert_eq!(sent_to_client, b"accepted");

    timing.finish();
    let outcome = telemetry
        .record(
            &RequestSnapshot::from_request(&http_req),
            Some(&ResponseSnapshot::new(200, Default::default())),
            CapturedBodies::new(request_body, response_body),
            None,
            &timing,
        )
        .await;
    assert_eq!(outcome, Some(Submission::Queued));

    telemetry.shutdown().await;

    let payloads = delivered(&server).await;
    assert_eq!(payloads.len(), 1);
    assert_eq!(
        payloads[0]["data"]["request"]["body"],
        json!({"api_key": "*****", "n": 1})
    );
    assert_eq!(payloads[0]["data"]["response"]["body"], json!("accepted"));
}

#[tokio::test]
async fn test_unreachable_collector_does_not_affect_responses() {
    let config = TelemetryConfig::new("api-key", "sdk-token")
        .endpoint("http://127.0.0.1:1")
        .connect_timeout(std::time::Duration::from_millis(200));
    let telemetry = Arc::new(TelemetryService::start(config).unwrap());
    let svc = TelemetryLayer::new(telemetry.clone()).layer(service_fn(echo));

    let req = Request::builder()
        .uri("/ping")
        .body(Full::new(Bytes::from_static(b"pong")))
        .unwrap();
    let res = svc.oneshot(req).await.unwrap();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"pong");

    telemetry.shutdown().await;
    assert_eq!(telemetry.stats().completed, 1);
}
