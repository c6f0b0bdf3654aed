//! Telemetry payload model and assembly.
//!
//! The collector expects a fixed JSON document (schema version 20). The
//! [`PayloadAssembler`] turns what the host knows about an exchange, exposed
//! through [`RequestFacts`] and [`ResponseFacts`], plus the captured bodies
//! into a [`TelemetryPayload`].

use crate::capture::CaptureBuffer;
use crate::dispatch::DispatchTask;
use crate::masking::FieldMasker;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Wire schema version understood by the collector.
pub const SCHEMA_VERSION: u32 = 20;

/// Placeholder address used when the client address is unknown.
pub const UNKNOWN_IP: &str = "bogon";

/// `source` value recorded for errors raised by the observed handler.
pub const ERROR_SOURCE: &str = "onException";

/// Status reported when the handler failed without producing a response.
pub const ERROR_STATUS: u16 = 500;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// Wire model
// ============================================================================

/// Top-level document sent to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Project API key.
    pub api_key: String,
    /// SDK token, also sent as the `x-api-key` header.
    pub sdk_token: String,
    /// SDK identifier, e.g. `rust-tower`.
    pub sdk: String,
    /// Schema version, always [`SCHEMA_VERSION`].
    pub version: u32,
    /// Exchange data.
    pub data: PayloadData,
}

/// Everything recorded about one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadData {
    /// Host description.
    pub server: ServerInfo,
    /// Runtime description.
    pub language: LanguageInfo,
    /// Request section.
    pub request: RequestInfo,
    /// Response section.
    pub response: ResponseInfo,
    /// Errors raised while handling the exchange.
    pub errors: Vec<ErrorInfo>,
}

/// Host machine description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Local address, or `bogon` when unknown.
    pub ip: String,
    /// UTC offset of the host clock.
    pub timezone: String,
    /// Server software, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,
    /// Protocol of the observed request.
    pub protocol: String,
    /// Operating system.
    pub os: OsInfo,
}

impl ServerInfo {
    /// Describe the current host. `ip` and `protocol` are filled per request.
    pub fn detect(software: Option<String>) -> Self {
        Self {
            ip: UNKNOWN_IP.to_string(),
            timezone: chrono::Local::now().offset().to_string(),
            software,
            protocol: String::new(),
            os: OsInfo::detect(),
        }
    }
}

/// Operating system description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    /// OS name, e.g. `linux`.
    pub name: String,
    /// Kernel or OS release.
    pub release: String,
    /// CPU architecture.
    pub architecture: String,
}

impl OsInfo {
    fn detect() -> Self {
        Self {
            name: std::env::consts::OS.to_string(),
            release: os_release(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

#[cfg(target_os = "linux")]
fn os_release() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(not(target_os = "linux"))]
fn os_release() -> String {
    "unknown".to_string()
}

/// Runtime language description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageInfo {
    /// Always `rust`.
    pub name: String,
    /// Minimum supported Rust version of this crate.
    pub version: String,
}

impl Default for LanguageInfo {
    fn default() -> Self {
        Self {
            name: "rust".to_string(),
            version: env!("CARGO_PKG_RUST_VERSION").to_string(),
        }
    }
}

/// Request section of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    /// UTC start time, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    /// Client address.
    pub ip: String,
    /// Full request URL.
    pub url: String,
    /// `User-Agent` header, empty when absent.
    pub user_agent: String,
    /// HTTP method.
    pub method: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Masked body: JSON value, text, or `null`.
    pub body: Value,
    /// Route template, or the raw path.
    pub route_path: String,
    /// Decoded query parameters.
    pub query: BTreeMap<String, String>,
    /// Protocol version.
    pub protocol: String,
}

/// Response section of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Status code.
    pub code: u16,
    /// Bytes sent to the client, including any not captured.
    pub size: u64,
    /// Exchange duration in milliseconds.
    pub load_time: u64,
    /// Masked body: JSON value, text, or `null`.
    pub body: Value,
}

/// An error raised while handling the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Where the error was observed.
    pub source: String,
    /// Error type name.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error message.
    pub message: String,
}

impl ErrorInfo {
    /// Record a handler error of the given type.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: ERROR_SOURCE.to_string(),
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Record an error value, using its type name as the error type.
    ///
    /// Trait objects such as tower's `BoxError` only name their wrapper, so
    /// for those the type is read from the leading identifier of the
    /// value's `Debug` output (`HandlerError`, `Custom { .. }`, ...).
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + ?Sized,
    {
        let type_name = std::any::type_name::<E>();
        let base = type_name.split('<').next().unwrap_or(type_name);
        let short = base.rsplit("::").next().unwrap_or(base);

        let erased = type_name.contains("dyn ") || ERASED_WRAPPERS.contains(&short);
        let error_type = if erased {
            debug_type_name(error).unwrap_or_else(|| FALLBACK_ERROR_TYPE.to_string())
        } else {
            short.to_string()
        };
        Self::new(error_type, error.to_string())
    }
}

const ERASED_WRAPPERS: &[&str] = &["Box", "Arc", "Rc"];

const FALLBACK_ERROR_TYPE: &str = "Error";

fn debug_type_name<E: std::fmt::Debug + ?Sized>(error: &E) -> Option<String> {
    let debug = format!("{:?}", error);
    let ident: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    ident
        .starts_with(|c: char| c.is_ascii_uppercase())
        .then_some(ident)
}

// ============================================================================
// Facts
// ============================================================================

/// Read-only view of an inbound request, as far as telemetry cares.
pub trait RequestFacts {
    /// HTTP method, e.g. `GET`.
    fn method(&self) -> &str;

    /// Full request URL.
    fn url(&self) -> &str;

    /// Request path without the query string.
    fn path(&self) -> &str;

    /// Raw query string, without the leading `?`.
    fn query(&self) -> Option<&str>;

    /// Request headers.
    fn headers(&self) -> &HeaderMap;

    /// Protocol version, e.g. `HTTP/1.1`.
    fn protocol(&self) -> &str;

    /// Matched route template, when the host router exposes one.
    fn route_pattern(&self) -> Option<&str> {
        None
    }

    /// Address of the connected peer.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Local address the request arrived on.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Read-only view of the outbound response status and headers.
pub trait ResponseFacts {
    /// Status code.
    fn status(&self) -> u16;

    /// Response headers.
    fn headers(&self) -> &HeaderMap;
}

/// Matched route template, set as a request extension by routers that know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern(pub String);

/// Peer address, set as a request extension by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Local listening address, set as a request extension by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAddr(pub SocketAddr);

/// Owned request facts, captured when the request arrives.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    method: String,
    url: String,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    protocol: String,
    route: Option<String>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl RequestSnapshot {
    /// Snapshot an `http` request.
    ///
    /// Route, peer and local addresses come from [`RoutePattern`],
    /// [`ClientAddr`] (or a bare `SocketAddr`) and [`ServerAddr`] extensions.
    pub fn from_request<B>(req: &http::Request<B>) -> Self {
        let uri = req.uri();
        let headers = req.headers().clone();

        let url = if uri.scheme().is_some() && uri.authority().is_some() {
            uri.to_string()
        } else {
            let scheme = header_str(&headers, "x-forwarded-proto").unwrap_or("http");
            let host = header_str(&headers, http::header::HOST.as_str()).unwrap_or("localhost");
            let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
            format!("{}://{}{}", scheme, host, path_and_query)
        };

        let extensions = req.extensions();
        let remote_addr = extensions
            .get::<ClientAddr>()
            .map(|addr| addr.0)
            .or_else(|| extensions.get::<SocketAddr>().copied());

        Self {
            method: req.method().as_str().to_string(),
            url,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
            protocol: format!("{:?}", req.version()),
            route: extensions.get::<RoutePattern>().map(|r| r.0.clone()),
            remote_addr,
            local_addr: extensions.get::<ServerAddr>().map(|addr| addr.0),
        }
    }
}

impl RequestFacts for RequestSnapshot {
    fn method(&self) -> &str {
        &self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn route_pattern(&self) -> Option<&str> {
        self.route.as_deref()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Owned response facts.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    status: u16,
    headers: HeaderMap,
}

impl ResponseSnapshot {
    /// Snapshot an `http` response.
    pub fn from_response<B>(res: &http::Response<B>) -> Self {
        Self {
            status: res.status().as_u16(),
            headers: res.headers().clone(),
        }
    }

    /// Build from a status and headers.
    pub fn new(status: u16, headers: HeaderMap) -> Self {
        Self { status, headers }
    }
}

impl ResponseFacts for ResponseSnapshot {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Start and end of one exchange.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeTiming {
    started_at: DateTime<Utc>,
    start: Option<Instant>,
    end: Option<Instant>,
}

impl ExchangeTiming {
    /// Start timing now.
    pub fn start_now() -> Self {
        Self {
            started_at: Utc::now(),
            start: Some(Instant::now()),
            end: None,
        }
    }

    /// Timing from explicit instants; either may be missing.
    pub fn new(started_at: DateTime<Utc>, start: Option<Instant>, end: Option<Instant>) -> Self {
        Self {
            started_at,
            start,
            end,
        }
    }

    /// Mark the end of the exchange, once.
    pub fn finish(&mut self) {
        if self.end.is_none() {
            self.end = Some(Instant::now());
        }
    }

    /// Wall-clock start.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Elapsed milliseconds; 0 when either end is missing.
    pub fn elapsed_millis(&self) -> u64 {
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                let millis = end.saturating_duration_since(start).as_millis();
                u64::try_from(millis).unwrap_or(u64::MAX)
            }
            _ => 0,
        }
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Request and response body captures for one exchange.
#[derive(Debug, Clone, Default)]
pub struct CapturedBodies {
    /// Request body capture.
    pub request: CaptureBuffer,
    /// Response body capture.
    pub response: CaptureBuffer,
}

impl CapturedBodies {
    /// Pair a request and response capture.
    pub fn new(request: CaptureBuffer, response: CaptureBuffer) -> Self {
        Self { request, response }
    }
}

/// Builds payloads from exchange facts.
///
/// Holds the credentials, SDK identity and masker; cheap to clone.
#[derive(Debug, Clone)]
pub struct PayloadAssembler {
    api_key: String,
    sdk_token: String,
    sdk: String,
    masker: Arc<FieldMasker>,
    server: ServerInfo,
    language: LanguageInfo,
}

impl PayloadAssembler {
    /// Create an assembler.
    pub fn new(
        api_key: impl Into<String>,
        sdk_token: impl Into<String>,
        sdk: impl Into<String>,
        masker: FieldMasker,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            sdk_token: sdk_token.into(),
            sdk: sdk.into(),
            masker: Arc::new(masker),
            server: ServerInfo::detect(None),
            language: LanguageInfo::default(),
        }
    }

    /// Report `software` as the server software.
    pub fn with_server_software(mut self, software: impl Into<String>) -> Self {
        self.server.software = Some(software.into());
        self
    }

    /// The masker applied to bodies.
    pub fn masker(&self) -> &Arc<FieldMasker> {
        &self.masker
    }

    /// Build a payload with masked bodies.
    pub fn assemble<Req, Res>(
        &self,
        request: &Req,
        response: Option<&Res>,
        bodies: &CapturedBodies,
        error: Option<ErrorInfo>,
        timing: &ExchangeTiming,
    ) -> TelemetryPayload
    where
        Req: RequestFacts + ?Sized,
        Res: ResponseFacts + ?Sized,
    {
        let mut payload = self.skeleton(request, response, bodies, error, timing);
        payload.data.request.body = embed_body(&self.masker, bodies.request.as_bytes());
        payload.data.response.body = embed_body(&self.masker, bodies.response.as_bytes());
        payload
    }

    /// Build a dispatch task whose bodies are masked by the worker.
    ///
    /// Keeps JSON parsing and masking off the request path.
    pub fn assemble_task<Req, Res>(
        &self,
        request: &Req,
        response: Option<&Res>,
        bodies: CapturedBodies,
        error: Option<ErrorInfo>,
        timing: &ExchangeTiming,
    ) -> DispatchTask
    where
        Req: RequestFacts + ?Sized,
        Res: ResponseFacts + ?Sized,
    {
        let payload = self.skeleton(request, response, &bodies, error, timing);
        DispatchTask::deferred(
            payload,
            self.masker.clone(),
            bodies.request.into_bytes(),
            bodies.response.into_bytes(),
        )
    }

    fn skeleton<Req, Res>(
        &self,
        request: &Req,
        response: Option<&Res>,
        bodies: &CapturedBodies,
        error: Option<ErrorInfo>,
        timing: &ExchangeTiming,
    ) -> TelemetryPayload
    where
        Req: RequestFacts + ?Sized,
        Res: ResponseFacts + ?Sized,
    {
        let mut server = self.server.clone();
        server.protocol = request.protocol().to_string();
        if let Some(addr) = request.local_addr() {
            server.ip = addr.ip().to_string();
        }

        let request_headers = request.headers();
        let request_info = RequestInfo {
            timestamp: timing.started_at().format(TIMESTAMP_FORMAT).to_string(),
            ip: client_ip(request),
            url: request.url().to_string(),
            user_agent: header_str(request_headers, http::header::USER_AGENT.as_str())
                .unwrap_or_default()
                .to_string(),
            method: request.method().to_string(),
            headers: flatten_headers(request_headers),
            body: Value::Null,
            route_path: request
                .route_pattern()
                .unwrap_or_else(|| request.path())
                .to_string(),
            query: parse_query(request.query().unwrap_or_default()),
            protocol: request.protocol().to_string(),
        };

        let response_info = ResponseInfo {
            headers: response
                .map(|r| flatten_headers(r.headers()))
                .unwrap_or_default(),
            code: response.map(|r| r.status()).unwrap_or(ERROR_STATUS),
            size: bodies.response.total_bytes(),
            load_time: timing.elapsed_millis(),
            body: Value::Null,
        };

        TelemetryPayload {
            api_key: self.api_key.clone(),
            sdk_token: self.sdk_token.clone(),
            sdk: self.sdk.clone(),
            version: SCHEMA_VERSION,
            data: PayloadData {
                server,
                language: self.language.clone(),
                request: request_info,
                response: response_info,
                errors: error.into_iter().collect(),
            },
        }
    }
}

/// Turn a captured body into its payload representation.
///
/// Empty bodies become `null`, JSON is masked and embedded as a value, and
/// anything else is embedded as a (lossy) UTF-8 string.
///
/// A JSON body cut at the capture limit does not parse and is therefore
/// embedded as text without masking. Keep `max_body_bytes` above the size of
/// bodies that carry sensitive fields.
pub fn embed_body(masker: &FieldMasker, body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }

    masker
        .mask_to_value(body)
        .unwrap_or_else(|| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Resolve the client address: first `x-forwarded-for` hop, then
/// `x-real-ip`, then the peer address.
pub fn client_ip<R: RequestFacts + ?Sized>(request: &R) -> String {
    let headers = request.headers();

    if let Some(first) = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip")
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return real_ip.to_string();
    }

    request
        .remote_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Flatten headers into a sorted map; repeated headers are joined with `, `.
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    flat
}

/// Decode a query string into a map; repeated keys are joined with `,`.
fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        let value = decode_component(value);
        params
            .entry(key)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    params
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
