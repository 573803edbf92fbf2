//! Convenience builder for HTTP query parameters and path segments.
//!
//! This module provides a lightweight helper for constructing URL query pairs
//! from optional values, plus escaping for resource names embedded in paths.

use std::fmt::Display;

/// Builder for assembling query parameter pairs.
#[derive(Debug, Default, Clone)]
pub struct QueryParams {
    pairs: Vec<(&'static str, String)>,
}

impl QueryParams {
    /// Create a new, empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Append a key/value pair when the value is present.
    pub fn push_opt<T>(&mut self, key: &'static str, value: Option<T>)
    where
        T: ToString,
    {
        if let Some(value) = value {
            self.pairs.push((key, value.to_string()));
        }
    }

    /// Append a flag as `true` only when it is set.
    pub fn push_flag(&mut self, key: &'static str, enabled: bool) {
        if enabled {
            self.pairs.push((key, "true".to_string()));
        }
    }

    /// Append a required key/value pair.
    pub fn push<T>(&mut self, key: &'static str, value: T)
    where
        T: Display,
    {
        self.pairs.push((key, value.to_string()));
    }

    /// Return the collected key/value pairs.
    #[must_use]
    pub fn into_pairs(self) -> Vec<(&'static str, String)> {
        self.pairs
    }

    /// Returns true if no parameters have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Percent-encode a single path segment.
///
/// Resource names such as image aliases may contain `/`, which must not be
/// read as a path separator.
#[must_use]
pub fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::{encode_segment, QueryParams};

    #[test]
    fn push_opt_skips_none() {
        let mut params = QueryParams::new();
        params.push_opt("project", Option::<String>::None);
        assert!(params.is_empty());
    }

    #[test]
    fn push_flag_only_when_set() {
        let mut params = QueryParams::new();
        params.push_flag("all-projects", false);
        assert!(params.is_empty());
        params.push_flag("all-projects", true);
        assert_eq!(
            params.into_pairs(),
            vec![("all-projects", "true".to_string())]
        );
    }

    #[test]
    fn encode_segment_escapes_separators() {
        assert_eq!(encode_segment("web01"), "web01");
        assert_eq!(encode_segment("ubuntu/22.04"), "ubuntu%2F22.04");
        assert_eq!(encode_segment("a b"), "a%20b");
    }
}
