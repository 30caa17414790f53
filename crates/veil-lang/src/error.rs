//! Error types for parsing and compiling policy bodies.

use crate::span::{line_col, Span};
use thiserror::Error;

/// Render `header` followed by the offending source line with `span`
/// underlined.
fn render(header: &str, span: Span, source: &str, hint: Option<&str>) -> String {
    let (line, col) = line_col(source, span.start);
    let mut out = format!("{}\n  --> line {}:{}\n", header, line, col);

    if let Some(text) = source.lines().nth(line - 1) {
        let rest = text.chars().count().saturating_sub(col - 1);
        let width = source
            .get(span.range())
            .map_or(1, |s| s.chars().take_while(|c| *c != '\n').count())
            .clamp(1, rest.max(1));
        out.push_str(&format!(
            "   |\n{:3}| {}\n   | {}^{}\n",
            line,
            text,
            " ".repeat(col - 1),
            "~".repeat(width - 1)
        ));
    }

    if let Some(hint) = hint {
        out.push_str(&format!("   = hint: {}\n", hint));
    }
    out
}

/// Error during lexing or parsing.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ParseError {
    /// The error message.
    pub message: String,
    /// Source span where the error occurred.
    pub span: Span,
    /// Optional hint for fixing the error.
    pub hint: Option<String>,
}

impl ParseError {
    /// Create a new parse error.
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            hint: None,
        }
    }

    /// Add a hint to the error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Format the error with source context.
    pub fn format_with_source(&self, source: &str) -> String {
        render(
            &format!("error: {}", self.message),
            self.span,
            source,
            self.hint.as_deref(),
        )
    }
}

/// Kinds of compilation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Call to a function that does not exist.
    UnknownFunction,
    /// Identifier that is not a policy argument.
    UnknownArgument,
}

/// Error turning a parsed body into a policy expression.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CompileError {
    /// The error message.
    pub message: String,
    /// Source span where the error occurred.
    pub span: Span,
    /// Error kind for programmatic handling.
    pub kind: CompileErrorKind,
}

impl CompileError {
    /// Create a new compile error.
    pub fn new(message: impl Into<String>, span: Span, kind: CompileErrorKind) -> Self {
        Self {
            message: message.into(),
            span,
            kind,
        }
    }

    /// Unknown function name.
    pub fn unknown_function(name: &str, span: Span) -> Self {
        Self::new(
            format!("unknown function '{}'", name),
            span,
            CompileErrorKind::UnknownFunction,
        )
    }

    /// Identifier that names no argument.
    pub fn unknown_argument(name: &str, params: &[&str], span: Span) -> Self {
        let message = if params.is_empty() {
            format!("unknown identifier '{}': the policy takes no arguments", name)
        } else {
            format!(
                "unknown identifier '{}': expected one of {}",
                name,
                params.join(", ")
            )
        };
        Self::new(message, span, CompileErrorKind::UnknownArgument)
    }

    /// Format the error with source context.
    pub fn format_with_source(&self, source: &str) -> String {
        render(
            &format!("error[{:?}]: {}", self.kind, self.message),
            self.span,
            source,
            None,
        )
    }
}

/// Combined error for the public API.
#[derive(Debug, Error)]
pub enum LangError {
    /// Parse error.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    /// Compile error.
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
}

impl LangError {
    /// Format the error with source context.
    pub fn format_with_source(&self, source: &str) -> String {
        match self {
            LangError::Parse(e) => e.format_with_source(source),
            LangError::Compile(e) => e.format_with_source(source),
        }
    }

    /// Span of the error.
    pub fn span(&self) -> Span {
        match self {
            LangError::Parse(e) => e.span,
            LangError::Compile(e) => e.span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_formatting() {
        let source = "CASE WHEN val == 1 THEN val END";
        let err = ParseError::new("unexpected '='", Span::new(15, 16))
            .with_hint("use '=' for equality");

        let formatted = err.format_with_source(source);
        assert!(formatted.contains("line 1:16"));
        assert!(formatted.contains("error: unexpected '='"));
        assert!(formatted.contains("hint: use '=' for equality"));
    }

    #[test]
    fn test_compile_error_underlines_span() {
        let source = "upper(vall)";
        let err = CompileError::unknown_argument("vall", &["val"], Span::new(6, 10));
        let formatted = err.format_with_source(source);
        assert!(formatted.contains("error[UnknownArgument]"));
        assert!(formatted.contains("expected one of val"));
        assert!(formatted.contains("^~~~"));
    }

    #[test]
    fn test_span_on_later_line() {
        let source = "CASE\n  WHEN x THEN 1\nEND";
        let err = ParseError::new("boom", Span::new(12, 13));
        assert!(err.format_with_source(source).contains("line 2:8"));
    }
}
