//! Glob-style path exclusion.
//!
//! Requests whose path matches an exclusion pattern are skipped entirely: no
//! capture, no payload. Patterns use a single wildcard token `*` that matches
//! zero or more characters, path separators included.
//!
//! | Pattern          | Matches                                  |
//! |------------------|------------------------------------------|
//! | `/health`        | `/health` only                           |
//! | `admin/*`        | `/admin/users`, `/admin/settings/1`      |
//! | `*/internal`     | `/api/internal`, `/v1/internal`          |
//! | `/api/*/debug`   | `/api/v1/debug`, `/api/v1/v2/debug`      |
//! | `*`              | everything                               |
//!
//! Paths and patterns are normalized before comparison: a leading `/` is
//! added when missing and a trailing `/` is removed (except for the root).

use std::borrow::Cow;

const WILDCARD: char = '*';

/// Check whether `path` matches any of the exclusion `patterns`.
///
/// An empty pattern list or an empty path never excludes anything. Empty
/// pattern strings are ignored.
///
/// # Example
///
/// ```
/// use rustapi_telemetry::path_matcher::is_excluded;
///
/// assert!(is_excluded("/admin/users", &["admin/*"]));
/// assert!(!is_excluded("/healthcheck", &["/health"]));
/// ```
pub fn is_excluded<P: AsRef<str>>(path: &str, patterns: &[P]) -> bool {
    if patterns.is_empty() || path.is_empty() {
        return false;
    }

    let path = normalize(path);
    patterns
        .iter()
        .map(AsRef::as_ref)
        .filter(|pattern| !pattern.is_empty())
        .any(|pattern| matches_pattern(&path, &normalize(pattern)))
}

/// A pre-normalized, immutable set of exclusion patterns.
///
/// Built once from configuration and shared read-only by every request.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    patterns: Vec<String>,
}

impl PathMatcher {
    /// Normalize and store the given patterns. Empty entries are dropped.
    pub fn new(patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let patterns = patterns
            .into_iter()
            .filter(|p| !p.as_ref().is_empty())
            .map(|p| normalize(p.as_ref()).into_owned())
            .collect();
        Self { patterns }
    }

    /// Check whether `path` is excluded by any stored pattern.
    pub fn is_excluded(&self, path: &str) -> bool {
        if self.patterns.is_empty() || path.is_empty() {
            return false;
        }

        let path = normalize(path);
        self.patterns
            .iter()
            .any(|pattern| matches_pattern(&path, pattern))
    }

    /// The normalized patterns.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns `true` when no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Ensure a leading `/` and strip a trailing `/` (the root stays `/`).
fn normalize(path: &str) -> Cow<'_, str> {
    if path.is_empty() {
        return Cow::Borrowed("/");
    }

    let mut normalized = if path.starts_with('/') {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(format!("/{}", path))
    };

    if normalized.len() > 1 && normalized.ends_with('/') {
        let trimmed_len = normalized.len() - 1;
        match &mut normalized {
            Cow::Borrowed(s) => *s = &s[..trimmed_len],
            Cow::Owned(s) => s.truncate(trimmed_len),
        }
    }

    normalized
}

/// Match a normalized path against a single normalized pattern.
fn matches_pattern(path: &str, pattern: &str) -> bool {
    if !pattern.contains(WILDCARD) {
        return path == pattern;
    }

    // A lone wildcard normalizes to "/*"; both forms match everything.
    if pattern == "*" || pattern == "/*" {
        return true;
    }

    let segments: Vec<&str> = pattern.split(WILDCARD).collect();
    let (first, rest) = match segments.split_first() {
        Some(split) => split,
        None => return true,
    };
    let (last, middle) = match rest.split_last() {
        Some(split) => split,
        None => return path == *first,
    };

    let mut position = 0;

    if !first.is_empty() {
        if !path.starts_with(first) {
            return false;
        }
        position = first.len();
    }

    for segment in middle.iter().filter(|s| !s.is_empty()) {
        match path[position..].find(segment) {
            Some(offset) => position += offset + segment.len(),
            None => return false,
        }
    }

    if !last.is_empty() {
        if !path.ends_with(last) {
            return false;
        }
        // The suffix must not overlap anything matched before it.
        if path.len() - last.len() < position {
            return false;
        }
    }

    true
}
