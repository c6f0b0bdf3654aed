//! Field masking for structured bodies.
//!
//! A [`FieldMasker`] walks a JSON document and replaces the value of every
//! sensitive key with [`MASK_MARKER`], at any depth and inside arrays. The
//! document shape is never altered:
//!
//! - strings, numbers and booleans under a sensitive key become `"*****"`
//! - `null` stays `null`
//! - objects and arrays under a sensitive key keep their structure, but every
//!   scalar inside them, at any depth, becomes `"*****"`
//!
//! Masking never fails. Bodies that are not JSON pass through unchanged, and
//! masking an already-masked document is a no-op.

use bytes::Bytes;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

/// Replacement for masked values.
pub const MASK_MARKER: &str = "*****";

/// Keys masked out of the box when default masking is enabled.
pub const DEFAULT_MASKED_KEYWORDS: &[&str] = &[
    "password",
    "pwd",
    "secret",
    "password_confirmation",
    "passwordConfirmation",
    "cc",
    "card_number",
    "cardNumber",
    "ccv",
    "ssn",
    "credit_score",
    "creditScore",
];

const REGEX_META: &[char] = &[
    '\\', '.', '+', '*', '?', '(', ')', '|', '[', ']', '{', '}', '^', '$',
];

/// A single key-matching rule.
#[derive(Debug, Clone)]
pub enum MaskRule {
    /// Exact key comparison.
    Literal {
        /// Key to match.
        key: String,
        /// Compare ignoring ASCII case.
        case_insensitive: bool,
    },
    /// Anchored regular expression; must match the whole key.
    Pattern(Regex),
}

impl MaskRule {
    /// Exact, case-sensitive match on `key`.
    pub fn literal(key: impl Into<String>) -> Self {
        Self::Literal {
            key: key.into(),
            case_insensitive: false,
        }
    }

    /// Compile `pattern` as an anchored regex.
    pub fn pattern(pattern: &str, case_insensitive: bool) -> Result<Self, regex::Error> {
        RegexBuilder::new(&format!("^(?:{})$", pattern))
            .case_insensitive(case_insensitive)
            .build()
            .map(Self::Pattern)
    }

    /// Build a rule from a configured keyword.
    ///
    /// Keywords containing regex metacharacters are compiled as patterns.
    /// A keyword that fails to compile is used as a literal instead.
    pub fn parse(keyword: &str, case_insensitive: bool) -> Self {
        if keyword.contains(REGEX_META) {
            match Self::pattern(keyword, case_insensitive) {
                Ok(rule) => return rule,
                Err(e) => {
                    tracing::warn!(
                        keyword = %keyword,
                        error = %e,
                        "Invalid masking pattern, matching it literally"
                    );
                }
            }
        }

        Self::Literal {
            key: keyword.to_string(),
            case_insensitive,
        }
    }

    /// Returns `true` if `key` is covered by this rule.
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Literal {
                key: expected,
                case_insensitive: false,
            } => expected == key,
            Self::Literal {
                key: expected,
                case_insensitive: true,
            } => expected.eq_ignore_ascii_case(key),
            Self::Pattern(regex) => regex.is_match(key),
        }
    }
}

/// Recursive JSON field masker.
///
/// Built once from configuration and shared read-only.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use rustapi_telemetry::masking::FieldMasker;
///
/// let masker = FieldMasker::from_keywords(["api_key", "token"], false);
/// let masked = masker.mask(Bytes::from_static(br#"{"api_key":"secret","nested":{"token":"x"}}"#));
///
/// assert_eq!(&masked[..], br#"{"api_key":"*****","nested":{"token":"*****"}}"#);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FieldMasker {
    rules: Vec<MaskRule>,
}

impl FieldMasker {
    /// Create a masker from explicit rules.
    pub fn new(rules: Vec<MaskRule>) -> Self {
        Self { rules }
    }

    /// Create a masker from keywords, see [`MaskRule::parse`].
    ///
    /// Duplicate and empty keywords are ignored.
    pub fn from_keywords(
        keywords: impl IntoIterator<Item = impl AsRef<str>>,
        case_insensitive: bool,
    ) -> Self {
        let mut seen: Vec<String> = Vec::new();
        for keyword in keywords {
            let keyword = keyword.as_ref().trim();
            if !keyword.is_empty() && !seen.iter().any(|k| k == keyword) {
                seen.push(keyword.to_string());
            }
        }

        let rules = seen
            .iter()
            .map(|keyword| MaskRule::parse(keyword, case_insensitive))
            .collect();
        Self { rules }
    }

    /// The active rules.
    pub fn rules(&self) -> &[MaskRule] {
        &self.rules
    }

    /// Returns `true` if no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns `true` if `key` matches any rule.
    pub fn is_sensitive(&self, key: &str) -> bool {
        self.rules.iter().any(|rule| rule.matches(key))
    }

    /// Mask a raw body.
    ///
    /// Returns the input untouched when it is not JSON or when nothing needed
    /// masking; otherwise the re-encoded document.
    pub fn mask(&self, body: Bytes) -> Bytes {
        if self.rules.is_empty() || body.is_empty() {
            return body;
        }

        let mut value: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) => {
                tracing::trace!(len = body.len(), "Body is not JSON, skipping masking");
                return body;
            }
        };

        if self.mask_value(&mut value) == 0 {
            return body;
        }

        match serde_json::to_vec(&value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                tracing::debug!(error = %e, "Failed to re-encode masked body");
                body
            }
        }
    }

    /// Parse `body` as JSON and mask it, for embedding into a payload.
    ///
    /// Returns `None` when the body is not JSON.
    pub fn mask_to_value(&self, body: &[u8]) -> Option<Value> {
        let mut value: Value = serde_json::from_slice(body).ok()?;
        self.mask_value(&mut value);
        Some(value)
    }

    /// Mask a parsed document in place. Returns the number of values replaced.
    pub fn mask_value(&self, value: &mut Value) -> usize {
        if self.rules.is_empty() {
            return 0;
        }
        self.walk(value)
    }

    fn walk(&self, value: &mut Value) -> usize {
        match value {
            Value::Object(map) => map
                .iter_mut()
                .map(|(key, child)| {
                    if self.is_sensitive(key) {
                        self.redact(child)
                    } else {
                        self.walk(child)
                    }
                })
                .sum(),
            Value::Array(items) => items.iter_mut().map(|item| self.walk(item)).sum(),
            _ => 0,
        }
    }

    /// Mask every non-null scalar in `value`, keeping containers in place.
    fn redact(&self, value: &mut Value) -> usize {
        match value {
            Value::Object(map) => map.values_mut().map(|child| self.redact(child)).sum(),
            Value::Array(items) => items.iter_mut().map(|item| self.redact(item)).sum(),
            Value::Null => 0,
            Value::String(s) if s == MASK_MARKER => 0,
            _ => {
                *value = Value::String(MASK_MARKER.to_string());
                1
            }
        }
    }
}
