//! Per-language quirks consulted by connections and sessions.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Languages with a known analysis backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    TypeScript,
    JavaScript,
    Rust,
    Python,
    Go,
    C,
    Cpp,
    Java,
    Lua,
    Yaml,
    Json,
    Html,
    Css,
    Shell,
    Zig,
    Markdown,
    Toml,
}

impl Language {
    /// Language identifier sent in `textDocument/didOpen`.
    pub fn id(&self) -> &'static str {
        match self {
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Rust => "rust",
            Language::Python => "python",
            Language::Go => "go",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Lua => "lua",
            Language::Yaml => "yaml",
            Language::Json => "json",
            Language::Html => "html",
            Language::Css => "css",
            Language::Shell => "shellscript",
            Language::Zig => "zig",
            Language::Markdown => "markdown",
            Language::Toml => "toml",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let language = match ext {
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "rs" => Language::Rust,
            "py" | "pyi" => Language::Python,
            "go" => Language::Go,
            "c" | "h" => Language::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hxx" => Language::Cpp,
            "java" => Language::Java,
            "lua" => Language::Lua,
            "yaml" | "yml" => Language::Yaml,
            "json" | "jsonc" => Language::Json,
            "html" | "htm" => Language::Html,
            "css" | "scss" | "less" => Language::Css,
            "sh" | "bash" | "zsh" => Language::Shell,
            "zig" => Language::Zig,
            "md" | "markdown" => Language::Markdown,
            "toml" => Language::Toml,
            _ => return None,
        };
        Some(language)
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Self::from_extension(ext)
    }
}

/// Quirks of one language backend.
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    pub language: Language,
    /// Whether in-flight completion lookups may be cached and reused.
    pub cache_completions: bool,
    /// The backend filters completions itself; the client must not regex-filter them.
    pub prefiltered_completions: bool,
    /// Blob answered to `workspace/configuration` and pushed after initialize.
    pub settings: Value,
    /// Diagnostic sources whose warnings are shown as info.
    pub downgrade_warning_sources: Vec<String>,
}

impl LanguageConfig {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            cache_completions: true,
            prefiltered_completions: false,
            settings: Value::Null,
            downgrade_warning_sources: Vec::new(),
        }
    }

    pub fn cache_completions(mut self, enabled: bool) -> Self {
        self.cache_completions = enabled;
        self
    }

    pub fn prefiltered_completions(mut self, enabled: bool) -> Self {
        self.prefiltered_completions = enabled;
        self
    }

    pub fn settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn downgrade_warning_sources(mut self, sources: Vec<&str>) -> Self {
        self.downgrade_warning_sources = sources.into_iter().map(String::from).collect();
        self
    }

    /// Look up a dotted `section` (e.g. `pylsp.plugins`) in the settings blob.
    pub fn settings_section(&self, section: Option<&str>) -> Value {
        let Some(section) = section.filter(|s| !s.is_empty()) else {
            return self.settings.clone();
        };
        section
            .split('.')
            .try_fold(&self.settings, |value, key| value.get(key))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn downgrades_source(&self, source: &str) -> bool {
        self.downgrade_warning_sources.iter().any(|s| s == source)
    }
}

lazy_static::lazy_static! {
    pub static ref BUILTIN_LANGUAGES: Vec<LanguageConfig> = vec![
        LanguageConfig::new(Language::TypeScript)
            .settings(json!({
                "typescript": { "format": { "semicolons": "insert" } },
                "javascript": { "format": { "semicolons": "insert" } }
            })),

        LanguageConfig::new(Language::JavaScript)
            .settings(json!({
                "javascript": { "format": { "semicolons": "insert" } }
            })),

        // rust-analyzer ranks and filters completions server side
        LanguageConfig::new(Language::Rust)
            .prefiltered_completions(true)
            .settings(json!({
                "rust-analyzer": { "checkOnSave": true }
            })),

        // pylsp completion lookups are never reused
        LanguageConfig::new(Language::Python)
            .cache_completions(false)
            .downgrade_warning_sources(vec!["pycodestyle"])
            .settings(json!({
                "pylsp": {
                    "plugins": {
                        "pycodestyle": { "enabled": true, "maxLineLength": 100 },
                        "pyflakes": { "enabled": true }
                    }
                }
            })),

        LanguageConfig::new(Language::Go)
            .settings(json!({ "gopls": { "staticcheck": true } })),

        LanguageConfig::new(Language::C),
        LanguageConfig::new(Language::Cpp),
        LanguageConfig::new(Language::Java),
        LanguageConfig::new(Language::Lua)
            .settings(json!({ "Lua": { "diagnostics": { "globals": ["vim"] } } })),
        LanguageConfig::new(Language::Yaml),
        LanguageConfig::new(Language::Json),
        LanguageConfig::new(Language::Html),
        LanguageConfig::new(Language::Css),
        LanguageConfig::new(Language::Shell),
        LanguageConfig::new(Language::Zig),
        LanguageConfig::new(Language::Markdown),
        LanguageConfig::new(Language::Toml),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path() {
        assert_eq!(Language::from_path(Path::new("src/main.rs")), Some(Language::Rust));
        assert_eq!(Language::from_path(Path::new("app.tsx")), Some(Language::TypeScript));
        assert_eq!(Language::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn test_every_language_has_builtin_entry() {
        for language in [Language::Rust, Language::Python, Language::Toml, Language::Shell] {
            assert!(BUILTIN_LANGUAGES.iter().any(|c| c.language == language));
        }
    }

    #[test]
    fn test_settings_section() {
        let python = BUILTIN_LANGUAGES
            .iter()
            .find(|c| c.language == Language::Python)
            .unwrap();

        assert_eq!(
            python.settings_section(Some("pylsp.plugins.pyflakes")),
            json!({ "enabled": true })
        );
        assert_eq!(python.settings_section(Some("pylsp.missing")), Value::Null);
        assert_eq!(python.settings_section(None), python.settings);
        assert!(python.downgrades_source("pycodestyle"));
    }
}
