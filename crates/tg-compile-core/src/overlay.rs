//! Backend flag overlays.
//!
//! Backend flags arrive as a single whitespace-separated string of
//! `KEY=VALUE` tokens (e.g. `"GPU=1 BEAM=2"`). They are parsed into an
//! [`EnvironmentOverlay`] that is layered on top of the base environment
//! when the compiler subprocess is spawned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Flags used for the last-resort retry: CPU execution, no image
/// optimization, conservative JIT.
pub const DEFAULT_FALLBACK_FLAGS: &str = "CPU=1 IMAGE=0 JIT=2";

/// A flag token that could not be parsed as `KEY=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagParseWarning {
    /// The offending token, verbatim.
    pub token: String,
}

impl fmt::Display for FlagParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not parse flag: {}", self.token)
    }
}

/// Mapping from environment variable name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentOverlay {
    vars: BTreeMap<String, String>,
}

impl EnvironmentOverlay {
    /// Create an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixed CPU-only fallback overlay (`CPU=1 IMAGE=0 JIT=2`).
    pub fn cpu_fallback() -> Self {
        [("CPU", "1"), ("IMAGE", "0"), ("JIT", "2")]
            .into_iter()
            .collect()
    }

    /// Parse a flag string, logging a warning for every dropped token.
    pub fn parse(flags: &str) -> Self {
        let (overlay, warnings) = Self::parse_with_warnings(flags);
        for warning in &warnings {
            warn!(token = %warning.token, "Could not parse backend flag, ignoring it");
        }
        overlay
    }

    /// Parse a flag string, returning the dropped tokens alongside the overlay.
    ///
    /// Tokens split at the first `=`, so values may contain `=`. A token
    /// without `=` or with an empty key is dropped; parsing continues with
    /// the next token. A pair of double quotes wrapping the whole string
    /// is stripped first.
    pub fn parse_with_warnings(flags: &str) -> (Self, Vec<FlagParseWarning>) {
        let mut overlay = Self::new();
        let mut warnings = Vec::new();

        for token in strip_quotes(flags.trim()).split_whitespace() {
            match token.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    overlay.insert(key, value);
                }
                _ => warnings.push(FlagParseWarning {
                    token: token.to_string(),
                }),
            }
        }

        (overlay, warnings)
    }

    /// Insert or replace a variable.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Variable names, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// `(name, value)` pairs, in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvironmentOverlay {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut overlay = Self::new();
        for (k, v) in iter {
            overlay.insert(k, v);
        }
        overlay
    }
}

impl fmt::Display for EnvironmentOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

/// Whether a flag value switches its feature on (non-empty and not `0`).
pub(crate) fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != "0"
}

fn strip_quotes(flags: &str) -> &str {
    flags
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drops_malformed_token() {
        let (overlay, warnings) = EnvironmentOverlay::parse_with_warnings("GPU=1 BEAM=2 bogus");

        let expected: EnvironmentOverlay = [("GPU", "1"), ("BEAM", "2")].into_iter().collect();
        assert_eq!(overlay, expected);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].token, "bogus");
    }

    #[test]
    fn test_parse_continues_after_malformed_token() {
        let (overlay, warnings) = EnvironmentOverlay::parse_with_warnings("bogus GPU=1 =2 JIT=2");
        assert_eq!(overlay.get("GPU"), Some("1"));
        assert_eq!(overlay.get("JIT"), Some("2"));
        assert_eq!(overlay.len(), 2);
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[1].token, "=2");
    }

    #[test]
    fn test_parse_value_may_contain_equals() {
        let overlay = EnvironmentOverlay::parse("OPTS=a=b");
        assert_eq!(overlay.get("OPTS"), Some("a=b"));
    }

    #[test]
    fn test_parse_empty_value_is_kept() {
        let overlay = EnvironmentOverlay::parse("DEBUG=");
        assert_eq!(overlay.get("DEBUG"), Some(""));
    }

    #[test]
    fn test_parse_strips_wrapping_quotes() {
        let overlay = EnvironmentOverlay::parse("\"QCOM=1 IMAGE=2\"");
        assert_eq!(overlay.get("QCOM"), Some("1"));
        assert_eq!(overlay.get("IMAGE"), Some("2"));
    }

    #[test]
    fn test_parse_empty_string() {
        let (overlay, warnings) = EnvironmentOverlay::parse_with_warnings("   ");
        assert!(overlay.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_later_duplicate_wins() {
        let overlay = EnvironmentOverlay::parse("BEAM=1 BEAM=3");
        assert_eq!(overlay.get("BEAM"), Some("3"));
    }

    #[test]
    fn test_cpu_fallback_matches_default_flags() {
        assert_eq!(
            EnvironmentOverlay::cpu_fallback(),
            EnvironmentOverlay::parse(DEFAULT_FALLBACK_FLAGS)
        );
    }

    #[test]
    fn test_display_renders_flag_string() {
        let overlay = EnvironmentOverlay::parse("JIT=2 CPU=1");
        assert_eq!(overlay.to_string(), "CPU=1 JIT=2");
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("2"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }
}
