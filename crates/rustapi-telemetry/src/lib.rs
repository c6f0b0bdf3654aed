//! # rustapi-telemetry
//!
//! HTTP traffic telemetry for RustAPI and any `tower`-based server.
//!
//! For every request/response pair the middleware builds a sanitized,
//! size-bounded snapshot and ships it to a remote collector in the
//! background. The observed exchange is never altered and only pays for the
//! body copy, unless the dispatch queue is saturated (see
//! [`OverloadPolicy`]).
//!
//! ## Pipeline
//!
//! 1. [`path_matcher`] decides whether a request is observed at all.
//! 2. [`capture`] taps request and response bodies up to a byte cap.
//! 3. [`payload`] assembles the collector document; [`masking`] redacts
//!    sensitive fields in the bodies.
//! 4. [`dispatch`] queues the payload for a small worker pool.
//! 5. [`transport`] POSTs it, gzipped, exactly once.
//!
//! ## Features
//!
//! - `layer` - `TelemetryLayer` tower middleware (default)
//! - `env-config` - load settings from `.env` and `TELEMETRY_*` variables (default)
//!
//! ## Example
//!
//! ```ignore
//! use rustapi_telemetry::{TelemetryConfig, TelemetryLayer, TelemetryService};
//! use std::sync::Arc;
//!
//! let config = TelemetryConfig::new("api-key", "sdk-token")
//!     .excluded_path("/health")
//!     .masked_keyword("api_key");
//! let telemetry = Arc::new(TelemetryService::start(config)?);
//!
//! let app = RustApi::new()
//!     .layer(TelemetryLayer::new(telemetry.clone()))
//!     .route("/users", post(create_user));
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod masking;
pub mod path_matcher;
pub mod payload;
pub mod service;
pub mod transport;

// Tower middleware adapter
#[cfg(feature = "layer")]
pub mod layer;

pub use capture::{CaptureBody, CaptureBuffer, CaptureReader, CaptureWriter, SharedCapture};
pub use config::TelemetryConfig;
pub use dispatch::{DispatchQueue, DispatchStats, DispatchTask, OverloadPolicy, Submission};
pub use error::{ConfigError, Result, TelemetryError, TransportError};
pub use masking::{FieldMasker, MaskRule, MASK_MARKER};
pub use path_matcher::{is_excluded, PathMatcher};
pub use payload::{
    CapturedBodies, ErrorInfo, ExchangeTiming, PayloadAssembler, RequestFacts, RequestSnapshot,
    ResponseFacts, ResponseSnapshot, RoutePattern, TelemetryPayload,
};
pub use service::{ExchangeContext, TelemetryService};
pub use transport::{HttpTransport, Transport};

#[cfg(feature = "env-config")]
pub use config::load_dotenv;

#[cfg(feature = "layer")]
pub use layer::{TelemetryLayer, TelemetryMiddleware};
