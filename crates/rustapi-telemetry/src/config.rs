//! Telemetry configuration.
//!
//! [`TelemetryConfig`] is built in code with a builder, or loaded from
//! `TELEMETRY_*` environment variables (feature `env-config`):
//!
//! ```ignore
//! use rustapi_telemetry::config::{load_dotenv, TelemetryConfig};
//!
//! load_dotenv();
//! let config = TelemetryConfig::from_env()?;
//! ```
//!
//! | Variable | Default |
//! |---|---|
//! | `TELEMETRY_API_KEY` | required |
//! | `TELEMETRY_SDK_TOKEN` | required |
//! | `TELEMETRY_ENDPOINT` | random default endpoint |
//! | `TELEMETRY_DEBUG` | `false` |
//! | `TELEMETRY_EXCLUDED_PATHS` | none (comma separated) |
//! | `TELEMETRY_MASKED_KEYWORDS` | none (comma separated) |
//! | `TELEMETRY_CONNECT_TIMEOUT_SECS` | `3` |
//! | `TELEMETRY_READ_TIMEOUT_SECS` | `3` |
//! | `TELEMETRY_MAX_BODY_BYTES` | `2097152` |
//! | `TELEMETRY_POOL_CORE_SIZE` | `1` |
//! | `TELEMETRY_POOL_MAX_SIZE` | `3` |
//! | `TELEMETRY_QUEUE_CAPACITY` | `100` |
//! | `TELEMETRY_COMPRESS` | `true` |
//!
//! Configuration is immutable once the service starts.

use crate::capture::DEFAULT_MAX_BODY_BYTES;
use crate::dispatch::{DispatchConfig, OverloadPolicy, DEFAULT_KEEP_ALIVE, DEFAULT_SHUTDOWN_GRACE};
use crate::error::ConfigError;
use crate::masking::{FieldMasker, DEFAULT_MASKED_KEYWORDS};
use crate::path_matcher::PathMatcher;
use crate::transport::{TransportConfig, DEFAULT_TIMEOUT};
use std::time::Duration;

/// Default SDK identifier reported in payloads.
pub const DEFAULT_SDK_NAME: &str = "rust-tower";

/// Prefix of the environment variables read by [`TelemetryConfig::from_env`].
pub const ENV_PREFIX: &str = "TELEMETRY_";

/// Settings for the telemetry pipeline.
///
/// ```
/// use rustapi_telemetry::config::TelemetryConfig;
/// use std::time::Duration;
///
/// let config = TelemetryConfig::new("api-key", "sdk-token")
///     .excluded_path("/health")
///     .excluded_path("admin/*")
///     .masked_keyword("api_key")
///     .max_body_bytes(64 * 1024)
///     .read_timeout(Duration::from_secs(5));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub(crate) api_key: String,
    pub(crate) sdk_token: String,
    pub(crate) endpoint: Option<String>,
    pub(crate) debug: bool,
    pub(crate) excluded_paths: Vec<String>,
    pub(crate) masked_keywords: Vec<String>,
    pub(crate) default_masking: bool,
    pub(crate) mask_case_insensitive: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) max_body_bytes: usize,
    pub(crate) core_workers: usize,
    pub(crate) max_workers: usize,
    pub(crate) queue_capacity: usize,
    pub(crate) shutdown_grace: Duration,
    pub(crate) overload_policy: OverloadPolicy,
    pub(crate) compress: bool,
    pub(crate) sdk_name: String,
}

impl TelemetryConfig {
    /// Create a configuration with the given credentials and default settings.
    ///
    /// Defaults:
    /// - 3 s connect and read timeouts
    /// - 2 MiB body capture cap
    /// - 1 core worker, 3 max workers, queue of 100
    /// - caller-runs overload policy, 5 s shutdown grace
    /// - gzip on, built-in masked keywords on
    pub fn new(api_key: impl Into<String>, sdk_token: impl Into<String>) -> Self {
        let dispatch = DispatchConfig::default();
        Self {
            api_key: api_key.into(),
            sdk_token: sdk_token.into(),
            endpoint: None,
            debug: false,
            excluded_paths: Vec::new(),
            masked_keywords: Vec::new(),
            default_masking: true,
            mask_case_insensitive: false,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            core_workers: dispatch.core_workers,
            max_workers: dispatch.max_workers,
            queue_capacity: dispatch.queue_capacity,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            overload_policy: dispatch.overload_policy,
            compress: true,
            sdk_name: DEFAULT_SDK_NAME.to_string(),
        }
    }

    /// Send payloads to `endpoint` instead of the default pool.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Enable debug logging of payload sizes and collector responses.
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Skip requests matching `pattern`.
    pub fn excluded_path(mut self, pattern: impl Into<String>) -> Self {
        self.excluded_paths.push(pattern.into());
        self
    }

    /// Skip requests matching any of `patterns`.
    pub fn excluded_paths(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.excluded_paths
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Mask values under `keyword`. Keywords with regex metacharacters are
    /// matched as anchored patterns.
    pub fn masked_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.masked_keywords.push(keyword.into());
        self
    }

    /// Mask values under any of `keywords`.
    pub fn masked_keywords(mut self, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.masked_keywords
            .extend(keywords.into_iter().map(Into::into));
        self
    }

    /// Include the built-in sensitive keywords (`password`, `ssn`, ...).
    pub fn default_masking(mut self, enabled: bool) -> Self {
        self.default_masking = enabled;
        self
    }

    /// Match masked keywords ignoring ASCII case.
    pub fn mask_case_insensitive(mut self, enabled: bool) -> Self {
        self.mask_case_insensitive = enabled;
        self
    }

    /// Collector connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Collector read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Maximum bytes captured per body.
    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Long-lived dispatch workers.
    pub fn core_workers(mut self, workers: usize) -> Self {
        self.core_workers = workers;
        self
    }

    /// Maximum dispatch workers, overflow included.
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Dispatch queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Time granted to in-flight sends on shutdown.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Behavior when the dispatch queue is saturated.
    pub fn overload_policy(mut self, policy: OverloadPolicy) -> Self {
        self.overload_policy = policy;
        self
    }

    /// Gzip payloads on the wire.
    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    /// SDK identifier reported in payloads.
    pub fn sdk_name(mut self, name: impl Into<String>) -> Self {
        self.sdk_name = name.into();
        self
    }

    /// Project API key.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// SDK token.
    pub fn sdk_token(&self) -> &str {
        &self.sdk_token
    }

    /// Configured exclusion patterns.
    pub fn excluded_path_patterns(&self) -> &[String] {
        &self.excluded_paths
    }

    /// Body capture cap.
    pub fn max_body_size(&self) -> usize {
        self.max_body_bytes
    }

    /// Returns `true` when debug logging is on.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Check that the pipeline can run with these settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential("api_key"));
        }
        if self.sdk_token.trim().is_empty() {
            return Err(ConfigError::MissingCredential("sdk_token"));
        }
        if self.max_body_bytes == 0 {
            return Err(invalid("max_body_bytes", "must be greater than zero"));
        }
        if self.core_workers == 0 {
            return Err(invalid("core_workers", "must be at least 1"));
        }
        if self.max_workers < self.core_workers {
            return Err(invalid(
                "max_workers",
                format!(
                    "{} is less than core_workers ({})",
                    self.max_workers, self.core_workers
                ),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be greater than zero"));
        }
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(invalid("endpoint", format!("'{}' is not an http(s) URL", endpoint)));
            }
        }
        Ok(())
    }

    pub(crate) fn path_matcher(&self) -> PathMatcher {
        PathMatcher::new(&self.excluded_paths)
    }

    pub(crate) fn field_masker(&self) -> FieldMasker {
        let defaults = self
            .default_masking
            .then_some(DEFAULT_MASKED_KEYWORDS)
            .unwrap_or_default();
        let keywords = defaults
            .iter()
            .copied()
            .chain(self.masked_keywords.iter().map(String::as_str));
        FieldMasker::from_keywords(keywords, self.mask_case_insensitive)
    }

    pub(crate) fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            core_workers: self.core_workers,
            max_workers: self.max_workers,
            queue_capacity: self.queue_capacity,
            keep_alive: DEFAULT_KEEP_ALIVE,
            shutdown_grace: self.shutdown_grace,
            overload_policy: self.overload_policy,
        }
    }

    pub(crate) fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            endpoint: self.endpoint.clone(),
            sdk_token: self.sdk_token.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            compress: self.compress,
            debug: self.debug,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(feature = "env-config")]
mod env {
    use super::*;
    use serde::Deserialize;

    /// Raw `TELEMETRY_*` values; anything absent keeps its default.
    #[derive(Debug, Deserialize)]
    struct EnvSettings {
        api_key: Option<String>,
        sdk_token: Option<String>,
        endpoint: Option<String>,
        debug: Option<bool>,
        #[serde(default)]
        excluded_paths: Vec<String>,
        #[serde(default)]
        masked_keywords: Vec<String>,
        connect_timeout_secs: Option<u64>,
        read_timeout_secs: Option<u64>,
        max_body_bytes: Option<usize>,
        pool_core_size: Option<usize>,
        pool_max_size: Option<usize>,
        queue_capacity: Option<usize>,
        compress: Option<bool>,
    }

    impl EnvSettings {
        fn into_config(self) -> Result<TelemetryConfig, ConfigError> {
            let api_key = self
                .api_key
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingCredential("TELEMETRY_API_KEY"))?;
            let sdk_token = self
                .sdk_token
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingCredential("TELEMETRY_SDK_TOKEN"))?;

            let mut config = TelemetryConfig::new(api_key, sdk_token)
                .excluded_paths(trimmed(self.excluded_paths))
                .masked_keywords(trimmed(self.masked_keywords));

            if let Some(endpoint) = self.endpoint.filter(|v| !v.trim().is_empty()) {
                config = config.endpoint(endpoint);
            }
            if let Some(debug) = self.debug {
                config = config.debug(debug);
            }
            if let Some(secs) = self.connect_timeout_secs {
                config = config.connect_timeout(Duration::from_secs(secs));
            }
            if let Some(secs) = self.read_timeout_secs {
                config = config.read_timeout(Duration::from_secs(secs));
            }
            if let Some(bytes) = self.max_body_bytes {
                config = config.max_body_bytes(bytes);
            }
            if let Some(core) = self.pool_core_size {
                config = config.core_workers(core);
            }
            if let Some(max) = self.pool_max_size {
                config = config.max_workers(max);
            }
            if let Some(capacity) = self.queue_capacity {
                config = config.queue_capacity(capacity);
            }
            if let Some(compress) = self.compress {
                config = config.compress(compress);
            }

            config.validate()?;
            Ok(config)
        }
    }

    fn trimmed(values: Vec<String>) -> impl Iterator<Item = String> {
        values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    impl TelemetryConfig {
        /// Load from `TELEMETRY_*` environment variables.
        pub fn from_env() -> Result<Self, ConfigError> {
            envy::prefixed(ENV_PREFIX)
                .from_env::<EnvSettings>()?
                .into_config()
        }

        /// Load from an explicit set of `TELEMETRY_*` key/value pairs.
        pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
        where
            I: IntoIterator<Item = (String, String)>,
        {
            envy::prefixed(ENV_PREFIX)
                .from_iter::<_, EnvSettings>(vars)?
                .into_config()
        }
    }

    /// Load a `.env` file from the current directory, if one exists.
    ///
    /// Variables already set in the process environment are not overwritten.
    pub fn load_dotenv() {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(error = %e, "Failed to load .env file"),
        }
    }
}

#[cfg(feature = "env-config")]
pub use env::load_dotenv;
