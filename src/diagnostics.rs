use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::syntax::ast::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticKind {
    UnknownColumn,
    DuplicateColumn,
    ColumnTypeMismatch,
    SchemaError,
    ColumnNameShadowsMember,
    UntrackedDataframe,
}

impl DiagnosticKind {
    pub const ALL: [DiagnosticKind; 6] = [
        DiagnosticKind::UnknownColumn,
        DiagnosticKind::DuplicateColumn,
        DiagnosticKind::ColumnTypeMismatch,
        DiagnosticKind::SchemaError,
        DiagnosticKind::ColumnNameShadowsMember,
        DiagnosticKind::UntrackedDataframe,
    ];

    pub fn code(self) -> &'static str {
        match self {
            DiagnosticKind::UnknownColumn => "UNKNOWN_COLUMN",
            DiagnosticKind::DuplicateColumn => "DUPLICATE_COLUMN",
            DiagnosticKind::ColumnTypeMismatch => "COLUMN_TYPE_MISMATCH",
            DiagnosticKind::SchemaError => "SCHEMA_ERROR",
            DiagnosticKind::ColumnNameShadowsMember => "COLUMN_NAME_SHADOWS_MEMBER",
            DiagnosticKind::UntrackedDataframe => "UNTRACKED_DATAFRAME",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn severity(self) -> Severity {
        match self {
            DiagnosticKind::UnknownColumn
            | DiagnosticKind::DuplicateColumn
            | DiagnosticKind::ColumnTypeMismatch
            | DiagnosticKind::SchemaError => Severity::Error,
            DiagnosticKind::ColumnNameShadowsMember => Severity::Warning,
            DiagnosticKind::UntrackedDataframe => Severity::Info,
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A reported schema violation. Lines and columns are 1-based; columns count
/// characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: usize,
    pub column: usize,
    pub end_line: usize,
    pub end_column: usize,
    pub code: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
    #[serde(skip)]
    pub span: Span,
}

impl Diagnostic {
    pub fn new(
        kind: DiagnosticKind,
        span: Span,
        message: impl Into<String>,
        index: &LineIndex,
    ) -> Self {
        let (line, column) = index.location(span.start);
        let (end_line, end_column) = index.location(span.end);
        Self {
            line,
            column,
            end_line,
            end_column,
            code: kind,
            severity: kind.severity(),
            message: message.into(),
            span,
        }
    }
}

impl Ord for Diagnostic {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.span.start, self.span.end, self.code, &self.message).cmp(&(
            other.span.start,
            other.span.end,
            other.code,
            &other.message,
        ))
    }
}

impl PartialOrd for Diagnostic {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(
            f,
            "{}:{}: {} [{}] {}",
            self.line, self.column, severity, self.code, self.message
        )
    }
}

/// Byte offset to line/column conversion for one source text.
pub struct LineIndex<'s> {
    source: &'s str,
    line_starts: Vec<usize>,
}

impl<'s> LineIndex<'s> {
    pub fn new(source: &'s str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            source,
            line_starts,
        }
    }

    /// 1-based line and character column of a byte offset.
    pub fn location(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.source.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let start = self.line_starts[line];
        let column = self
            .source
            .get(start..offset)
            .map_or(offset - start, |text| text.chars().count());
        (line + 1, column + 1)
    }
}

const IGNORE_MARKER: &str = "// dataframe: ignore";

/// Return true if the source line at `line` (1-indexed) carries a
/// `// dataframe: ignore` or `// dataframe: ignore[CODE, ...]` comment
/// covering `code`.
pub fn is_line_ignored(source: &str, line: usize, code: DiagnosticKind) -> bool {
    let Some(line_text) = line.checked_sub(1).and_then(|i| source.lines().nth(i)) else {
        return false;
    };
    let Some(pos) = line_text.find(IGNORE_MARKER) else {
        return false;
    };
    let after = &line_text[pos + IGNORE_MARKER.len()..];
    // Bare ignore suppresses everything on this line
    if after.trim_start().is_empty() || after.starts_with(char::is_whitespace) {
        return true;
    }
    if let Some(codes) = after.strip_prefix('[').and_then(|rest| rest.split_once(']')) {
        return codes.0.split(',').map(str::trim).any(|c| c == code.code());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_offsets_to_lines_and_char_columns() {
        // arrange
        let index = LineIndex::new("ab\nçd\n\nx");

        // act + assert
        assert_eq!(index.location(0), (1, 1));
        assert_eq!(index.location(2), (1, 3));
        assert_eq!(index.location(3), (2, 1));
        // 'ç' is two bytes but one column
        assert_eq!(index.location(5), (2, 2));
        assert_eq!(index.location(8), (4, 1));
        assert_eq!(index.location(100), (4, 2));
    }

    #[test]
    fn test_should_roundtrip_codes() {
        for kind in DiagnosticKind::ALL {
            assert_eq!(DiagnosticKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(DiagnosticKind::from_code("NOPE"), None);
    }

    #[test]
    fn test_should_serialize_codes_and_skip_spans() {
        let index = LineIndex::new("df[\"x\"]");
        let diagnostic =
            Diagnostic::new(DiagnosticKind::UnknownColumn, Span::new(0, 7), "missing", &index);

        let json = serde_json::to_value(&diagnostic).unwrap();

        assert_eq!(json["code"], "UNKNOWN_COLUMN");
        assert_eq!(json["severity"], "error");
        assert_eq!(json["end_column"], 8);
        assert!(json.get("span").is_none());
    }

    #[test]
    fn test_should_order_by_position_then_code() {
        let index = LineIndex::new("0123456789");
        let a = Diagnostic::new(DiagnosticKind::SchemaError, Span::new(1, 4), "a", &index);
        let b = Diagnostic::new(DiagnosticKind::UnknownColumn, Span::new(1, 4), "b", &index);
        let c = Diagnostic::new(DiagnosticKind::UnknownColumn, Span::new(0, 9), "c", &index);
        let mut all = vec![a.clone(), b.clone(), c.clone()];
        all.sort();
        assert_eq!(all, vec![c, b, a]);
    }

    #[test]
    fn test_should_ignore_all_on_bare_ignore_comment() {
        let source = "val x = df[\"revenue\"] // dataframe: ignore\n";
        assert!(is_line_ignored(source, 1, DiagnosticKind::UnknownColumn));
        assert!(!is_line_ignored(source, 2, DiagnosticKind::UnknownColumn));
    }

    #[test]
    fn test_should_ignore_specific_codes() {
        // arrange
        let source = "a // dataframe: ignore[UNKNOWN_COLUMN, SCHEMA_ERROR]\n\
                      b // dataframe: ignore[DUPLICATE_COLUMN]\n";

        // act + assert
        assert!(is_line_ignored(source, 1, DiagnosticKind::UnknownColumn));
        assert!(is_line_ignored(source, 1, DiagnosticKind::SchemaError));
        assert!(!is_line_ignored(source, 2, DiagnosticKind::UnknownColumn));
    }
}
