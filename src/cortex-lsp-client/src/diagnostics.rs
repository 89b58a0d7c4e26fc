//! Diagnostic types and the merge of backend and external sources.

use serde::{Deserialize, Serialize};

use crate::code_actions::CodeAction;
use crate::document::TextSnapshot;
use crate::language::LanguageConfig;

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Info,
}

impl DiagnosticSeverity {
    /// Map a backend severity into the closed set. Hints become info; a
    /// missing severity is treated as an error.
    pub fn from_lsp(
        severity: Option<lsp_types::DiagnosticSeverity>,
        source: Option<&str>,
        language: &LanguageConfig,
    ) -> Self {
        let mapped = match severity {
            Some(lsp_types::DiagnosticSeverity::ERROR) | None => DiagnosticSeverity::Error,
            Some(lsp_types::DiagnosticSeverity::WARNING) => DiagnosticSeverity::Warning,
            Some(_) => DiagnosticSeverity::Info,
        };

        match (mapped, source) {
            (DiagnosticSeverity::Warning, Some(source)) if language.downgrades_source(source) => {
                DiagnosticSeverity::Info
            }
            _ => mapped,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DiagnosticSeverity::Error => "error",
            DiagnosticSeverity::Warning => "warning",
            DiagnosticSeverity::Info => "info",
        }
    }
}

/// Which producer a diagnostic came from. Each origin replaces only its own entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticOrigin {
    /// Published by the analysis backend.
    Backend,
    /// Maintained by another producer (e.g. a linter run by the editor).
    External,
}

/// A diagnostic in absolute document offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub from: usize,
    pub to: usize,
    /// Line number (1-based).
    pub line: u32,
    /// Column number (1-based, UTF-16 units).
    pub col: u32,
    pub severity: DiagnosticSeverity,
    pub message: String,
    /// Source (e.g., "rustc", "pycodestyle").
    pub source: Option<String>,
    pub code: Option<String>,
    pub origin: DiagnosticOrigin,
    pub actions: Vec<CodeAction>,
}

impl Diagnostic {
    pub fn new(from: usize, to: usize, message: impl Into<String>) -> Self {
        Self {
            from,
            to,
            line: 1,
            col: 1,
            severity: DiagnosticSeverity::Error,
            message: message.into(),
            source: None,
            code: None,
            origin: DiagnosticOrigin::Backend,
            actions: Vec::new(),
        }
    }

    pub fn with_severity(mut self, severity: DiagnosticSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_origin(mut self, origin: DiagnosticOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_location(mut self, line: u32, col: u32) -> Self {
        self.line = line;
        self.col = col;
        self
    }

    /// Convert a backend diagnostic against a snapshot of the document.
    pub fn from_lsp(
        diagnostic: &lsp_types::Diagnostic,
        snapshot: &TextSnapshot,
        language: &LanguageConfig,
    ) -> Self {
        let from = snapshot.position_to_offset(diagnostic.range.start);
        let to = snapshot.position_to_offset(diagnostic.range.end).max(from);
        let source = diagnostic.source.as_deref();

        let mut converted = Diagnostic::new(from, to, diagnostic.message.clone())
            .with_location(
                diagnostic.range.start.line + 1,
                diagnostic.range.start.character + 1,
            )
            .with_severity(DiagnosticSeverity::from_lsp(
                diagnostic.severity,
                source,
                language,
            ));

        if let Some(source) = source {
            converted = converted.with_source(source);
        }

        let code = match &diagnostic.code {
            Some(lsp_types::NumberOrString::Number(n)) => Some(n.to_string()),
            Some(lsp_types::NumberOrString::String(s)) => Some(s.clone()),
            None => None,
        };
        if let Some(code) = code {
            converted = converted.with_code(code);
        }

        converted
    }

    /// Format diagnostic for tool output.
    pub fn format_for_tool(&self) -> String {
        format!(
            "{}:{}: {}: {}",
            self.line,
            self.col,
            self.severity.label(),
            self.message
        )
    }
}

/// Replace the `origin` entries of `current` with `incoming`, keeping every
/// other origin untouched, and sort by start offset.
pub fn merge(
    current: &[Diagnostic],
    origin: DiagnosticOrigin,
    incoming: Vec<Diagnostic>,
) -> Vec<Diagnostic> {
    let mut merged: Vec<Diagnostic> = current
        .iter()
        .filter(|d| d.origin != origin)
        .cloned()
        .collect();
    merged.extend(incoming.into_iter().map(|d| d.with_origin(origin)));
    merged.sort_by_key(|d| d.from);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{Language, LanguageConfig};
    use lsp_types::{NumberOrString, Position, Range};
    use pretty_assertions::assert_eq;

    fn python() -> LanguageConfig {
        LanguageConfig::new(Language::Python).downgrade_warning_sources(vec!["pycodestyle"])
    }

    #[test]
    fn test_severity_mapping() {
        let lang = python();
        use lsp_types::DiagnosticSeverity as Lsp;

        assert_eq!(DiagnosticSeverity::from_lsp(None, None, &lang), DiagnosticSeverity::Error);
        assert_eq!(
            DiagnosticSeverity::from_lsp(Some(Lsp::WARNING), Some("pyflakes"), &lang),
            DiagnosticSeverity::Warning
        );
        assert_eq!(
            DiagnosticSeverity::from_lsp(Some(Lsp::WARNING), Some("pycodestyle"), &lang),
            DiagnosticSeverity::Info
        );
        // only warnings are downgraded
        assert_eq!(
            DiagnosticSeverity::from_lsp(Some(Lsp::ERROR), Some("pycodestyle"), &lang),
            DiagnosticSeverity::Error
        );
        assert_eq!(
            DiagnosticSeverity::from_lsp(Some(Lsp::HINT), None, &lang),
            DiagnosticSeverity::Info
        );
    }

    #[test]
    fn test_from_lsp() {
        let doc = TextSnapshot::new("import os\nx = 1\n");
        let raw = lsp_types::Diagnostic {
            range: Range::new(Position::new(1, 0), Position::new(1, 1)),
            severity: Some(lsp_types::DiagnosticSeverity::WARNING),
            code: Some(NumberOrString::String("E225".into())),
            source: Some("pycodestyle".into()),
            message: "missing whitespace".into(),
            ..Default::default()
        };

        let converted = Diagnostic::from_lsp(&raw, &doc, &python());
        assert_eq!(converted.from, 10);
        assert_eq!(converted.to, 11);
        assert_eq!((converted.line, converted.col), (2, 1));
        assert_eq!(converted.severity, DiagnosticSeverity::Info);
        assert_eq!(converted.code.as_deref(), Some("E225"));
        assert_eq!(converted.format_for_tool(), "2:1: info: missing whitespace");
    }

    #[test]
    fn test_merge_keeps_other_origin() {
        let current = vec![
            Diagnostic::new(5, 6, "old backend"),
            Diagnostic::new(1, 2, "lint").with_origin(DiagnosticOrigin::External),
            Diagnostic::new(30, 31, "lint 2").with_origin(DiagnosticOrigin::External),
        ];

        let merged = merge(
            &current,
            DiagnosticOrigin::Backend,
            vec![Diagnostic::new(20, 25, "new backend"), Diagnostic::new(0, 1, "first")],
        );

        let messages: Vec<&str> = merged.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "lint", "new backend", "lint 2"]);
        assert!(merged.windows(2).all(|w| w[0].from <= w[1].from));

        let replaced = merge(&merged, DiagnosticOrigin::External, Vec::new());
        let messages: Vec<&str> = replaced.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "new backend"]);
    }
}
