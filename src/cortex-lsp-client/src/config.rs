//! Client configuration types.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::language::{BUILTIN_LANGUAGES, Language, LanguageConfig};
use crate::Result;

/// Default timeout for requests in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default timeout for reading a message body in seconds.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Maximum allowed content length to prevent memory exhaustion (10MB).
pub const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// Documents longer than this are never asked for semantic tokens.
pub const DEFAULT_SEMANTIC_TOKENS_MAX_LINES: usize = 10_000;

/// Configuration for connections and document sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for forward requests (default: 30 seconds).
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Timeout for reading a message body once its headers arrived (default: 60 seconds).
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    /// Maximum content length for inbound messages (default: 10MB).
    pub max_content_length: usize,
    /// How long `shutdown` waits for the backend to acknowledge.
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Trailing debounce for change notifications.
    #[serde(with = "duration_ms")]
    pub change_debounce: Duration,
    /// Trailing debounce for semantic token requests.
    #[serde(with = "duration_ms")]
    pub semantic_tokens_debounce: Duration,
    /// Trailing debounce for published diagnostics.
    #[serde(with = "duration_ms")]
    pub diagnostics_debounce: Duration,
    /// How long a fresh completion request may take before a cached result wins.
    #[serde(with = "duration_ms")]
    pub completion_grace: Duration,
    /// Line-count ceiling above which semantic tokens are skipped.
    pub semantic_tokens_max_lines: usize,
    /// Per-language overrides keyed by language id (e.g. `python`).
    pub languages: HashMap<String, LanguageOverride>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            max_content_length: MAX_CONTENT_LENGTH,
            shutdown_timeout: Duration::from_secs(5),
            change_debounce: Duration::from_millis(100),
            semantic_tokens_debounce: Duration::from_millis(200),
            diagnostics_debounce: Duration::from_millis(100),
            completion_grace: Duration::from_millis(5),
            semantic_tokens_max_lines: DEFAULT_SEMANTIC_TOKENS_MAX_LINES,
            languages: HashMap::new(),
        }
    }
}

/// Overrides applied on top of a builtin [`LanguageConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageOverride {
    pub cache_completions: Option<bool>,
    pub prefiltered_completions: Option<bool>,
    pub settings: Option<serde_json::Value>,
    pub downgrade_warning_sources: Option<Vec<String>>,
}

impl ClientConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_content_length(mut self, max_length: usize) -> Self {
        self.max_content_length = max_length;
        self
    }

    pub fn with_completion_grace(mut self, grace: Duration) -> Self {
        self.completion_grace = grace;
        self
    }

    pub fn with_semantic_tokens_max_lines(mut self, max_lines: usize) -> Self {
        self.semantic_tokens_max_lines = max_lines;
        self
    }

    pub fn with_language_override(mut self, language: Language, value: LanguageOverride) -> Self {
        self.languages.insert(language.id().to_string(), value);
        self
    }

    /// Builtin quirks for `language` with any configured overrides applied.
    pub fn language_config(&self, language: Language) -> LanguageConfig {
        let mut config = BUILTIN_LANGUAGES
            .iter()
            .find(|c| c.language == language)
            .cloned()
            .unwrap_or_else(|| LanguageConfig::new(language));

        if let Some(overrides) = self.languages.get(language.id()) {
            if let Some(cache) = overrides.cache_completions {
                config.cache_completions = cache;
            }
            if let Some(prefiltered) = overrides.prefiltered_completions {
                config.prefiltered_completions = prefiltered;
            }
            if let Some(settings) = &overrides.settings {
                config.settings = settings.clone();
            }
            if let Some(sources) = &overrides.downgrade_warning_sources {
                config.downgrade_warning_sources = sources.clone();
            }
        }

        config
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.change_debounce, Duration::from_millis(100));
        assert_eq!(config.semantic_tokens_debounce, Duration::from_millis(200));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_toml_with_override() {
        let config = ClientConfig::from_toml_str(
            r#"
            request_timeout = 1500
            completion_grace = 10

            [languages.python]
            cache_completions = true
            downgrade_warning_sources = ["ruff"]
            "#,
        )
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.completion_grace, Duration::from_millis(10));
        // untouched fields keep their defaults
        assert_eq!(config.change_debounce, Duration::from_millis(100));

        let python = config.language_config(Language::Python);
        assert!(python.cache_completions);
        assert_eq!(python.downgrade_warning_sources, vec!["ruff".to_string()]);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(ClientConfig::from_toml_str("request_timeout = \"soon\"").is_err());
    }
}
