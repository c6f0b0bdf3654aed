//! Error types for the telemetry pipeline.
//!
//! Only configuration problems are fatal. Everything that can go wrong on the
//! request path (capture, masking, dispatch, transport) is recovered and
//! logged where it happens and never reaches the observed exchange.

use thiserror::Error;

/// Configuration error, raised while validating or loading a [`TelemetryConfig`].
///
/// [`TelemetryConfig`]: crate::config::TelemetryConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required credential is missing or blank.
    #[error("Missing required credential: {0}")]
    MissingCredential(&'static str),

    /// A setting has a value the pipeline cannot run with.
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Name of the offending setting.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// Environment variable deserialization failed.
    #[cfg(feature = "env-config")]
    #[error("Configuration error: {0}")]
    Env(#[from] envy::Error),
}

/// Error produced by a single delivery attempt.
///
/// Transports log these and drop the payload; they are never retried.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The payload could not be encoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Gzip compression of the encoded payload failed.
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// The HTTP request failed (connect, timeout, protocol).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The collector answered with a non-2xx status.
    #[error("Collector returned status {0}")]
    Status(u16),

    /// The transport was closed by a shutdown.
    #[error("Transport is closed")]
    Closed,
}

/// Error returned when starting the telemetry service.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The configuration is incomplete or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The service was started outside of a tokio runtime.
    #[error("Telemetry service requires a running tokio runtime")]
    NoRuntime,

    /// The shared HTTP client could not be built.
    #[error("Failed to build collector client: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for telemetry start-up operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;
