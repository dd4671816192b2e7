//! Fixture-driven testing: `.kt` sources annotated with inline
//! `/*!CODE*/` or `/*!CODE: message substring*/` markers placed right after
//! the expression a diagnostic is expected on.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::checker::CheckerOptions;
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::error::{CoverageError, HarnessError};

const MARKER_OPEN: &str = "/*!";
const MARKER_CLOSE: &str = "*/";
/// Fixture directive enabling `UNTRACKED_DATAFRAME` reports.
const REPORT_UNTRACKED_DIRECTIVE: &str = "// REPORT_UNTRACKED";
const FIXTURE_EXTENSION: &str = "kt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    /// 1-based line of the marker.
    pub line: usize,
    /// Byte offset the expected diagnostic span must end at.
    pub anchor: usize,
    pub code: DiagnosticKind,
    pub message: Option<String>,
    /// Byte range of the marker comment itself.
    pub marker: Range<usize>,
}

impl Expectation {
    pub fn matches(&self, diagnostic: &Diagnostic) -> bool {
        diagnostic.span.end == self.anchor
            && diagnostic.code == self.code
            && self
                .message
                .as_deref()
                .is_none_or(|text| diagnostic.message.contains(text))
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "line {}: {}: {}", self.line, self.code, message),
            None => write!(f, "line {}: {}", self.line, self.code),
        }
    }
}

/// Offset right after the last non-blank character before `end`, skipping
/// over earlier markers annotating the same expression.
fn anchor_before(source: &str, end: usize) -> usize {
    let mut end = end;
    loop {
        let trimmed = source[..end].trim_end();
        if trimmed.ends_with(MARKER_CLOSE) {
            if let Some(open) = trimmed.rfind(MARKER_OPEN) {
                let inner = &trimmed[open + MARKER_OPEN.len()..trimmed.len() - MARKER_CLOSE.len()];
                if !inner.contains(MARKER_CLOSE) {
                    end = open;
                    continue;
                }
            }
        }
        return trimmed.len();
    }
}

pub fn parse_expectations(source: &str) -> Result<Vec<Expectation>, HarnessError> {
    let mut expectations = Vec::new();
    let mut search_from = 0;
    while let Some(found) = source[search_from..].find(MARKER_OPEN) {
        let start = search_from + found;
        let body_start = start + MARKER_OPEN.len();
        let line = source[..start].matches('\n').count() + 1;
        let Some(body_len) = source[body_start..].find(MARKER_CLOSE) else {
            return Err(HarnessError::MalformedMarker {
                line,
                text: source[start..].lines().next().unwrap_or_default().to_string(),
            });
        };
        let end = body_start + body_len + MARKER_CLOSE.len();
        let body = &source[body_start..body_start + body_len];
        let (code, message) = match body.split_once(':') {
            Some((code, message)) => (code.trim(), Some(message.trim().to_string())),
            None => (body.trim(), None),
        };
        let code = DiagnosticKind::from_code(code).ok_or_else(|| HarnessError::MalformedMarker {
            line,
            text: source[start..end].to_string(),
        })?;
        expectations.push(Expectation {
            line,
            anchor: anchor_before(source, start),
            code,
            message: message.filter(|m| !m.is_empty()),
            marker: start..end,
        });
        search_from = end;
    }
    Ok(expectations)
}

/// Checker options requested by directives in a fixture.
pub fn fixture_options(source: &str) -> CheckerOptions {
    CheckerOptions {
        report_untracked: source
            .lines()
            .any(|line| line.trim() == REPORT_UNTRACKED_DIRECTIVE),
        ..CheckerOptions::default()
    }
}

#[derive(Debug, Clone)]
pub struct FixtureReport {
    pub path: PathBuf,
    pub missing: Vec<Expectation>,
    pub unexpected: Vec<Diagnostic>,
    /// The fixture with its markers replaced by the diagnostics actually produced.
    pub actual: String,
}

impl FixtureReport {
    pub fn is_success(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

impl fmt::Display for FixtureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "{}: ok", self.path.display());
        }
        writeln!(f, "{}: diagnostics differ from expectations", self.path.display())?;
        for expectation in &self.missing {
            writeln!(f, "  missing    {expectation}")?;
        }
        for diagnostic in &self.unexpected {
            writeln!(f, "  unexpected {diagnostic}")?;
        }
        writeln!(f, "actual:")?;
        write!(f, "{}", self.actual)
    }
}

/// Removes the `markers` ranges from `source` and inserts a marker for each
/// diagnostic at the end of its span.
fn render_actual(source: &str, markers: &[Range<usize>], diagnostics: &[Diagnostic]) -> String {
    let mut inserts: Vec<(usize, String)> = diagnostics
        .iter()
        .map(|d| {
            (
                d.span.end.min(source.len()),
                format!("{MARKER_OPEN}{}: {}{MARKER_CLOSE}", d.code, d.message),
            )
        })
        .collect();
    inserts.sort_by_key(|(offset, _)| *offset);
    let mut inserts = inserts.into_iter().peekable();

    let mut out = String::with_capacity(source.len());
    let mut copy_until = |out: &mut String, from: usize, to: usize| {
        let mut pos = from;
        while let Some((offset, text)) = inserts.next_if(|(offset, _)| *offset <= to) {
            let offset = offset.max(pos);
            out.push_str(&source[pos..offset]);
            out.push_str(&text);
            pos = offset;
        }
        out.push_str(&source[pos..to]);
    };

    let mut cursor = 0;
    for marker in markers {
        copy_until(&mut out, cursor, marker.start);
        cursor = marker.end;
    }
    copy_until(&mut out, cursor, source.len());
    out
}

/// Pairs expectations with diagnostics; returns the unmatched of each side.
fn compare(
    expectations: Vec<Expectation>,
    diagnostics: &[Diagnostic],
) -> (Vec<Expectation>, Vec<Diagnostic>) {
    let mut matched = vec![false; diagnostics.len()];
    let mut missing = Vec::new();
    for expectation in expectations {
        let hit = diagnostics
            .iter()
            .enumerate()
            .find(|(i, d)| !matched[*i] && expectation.matches(d))
            .map(|(i, _)| i);
        match hit {
            Some(i) => matched[i] = true,
            None => missing.push(expectation),
        }
    }
    let unexpected = diagnostics
        .iter()
        .zip(&matched)
        .filter(|(_, hit)| !**hit)
        .map(|(d, _)| d.clone())
        .collect();
    (missing, unexpected)
}

pub fn run_source(path: &Path, source: &str) -> Result<FixtureReport, HarnessError> {
    let expectations = parse_expectations(source)?;
    let diagnostics = crate::analyze_source(source, &fixture_options(source)).map_err(|error| {
        HarnessError::Analysis {
            path: path.to_path_buf(),
            message: format!("{error:#}"),
        }
    })?;
    let markers: Vec<Range<usize>> = expectations.iter().map(|e| e.marker.clone()).collect();
    let actual = render_actual(source, &markers, &diagnostics);
    let (missing, unexpected) = compare(expectations, &diagnostics);
    debug!(
        path = %path.display(),
        missing = missing.len(),
        unexpected = unexpected.len(),
        "fixture compared"
    );
    Ok(FixtureReport {
        path: path.to_path_buf(),
        missing,
        unexpected,
        actual,
    })
}

pub fn run_fixture(path: &Path) -> Result<FixtureReport, HarnessError> {
    let source = fs::read_to_string(path).map_err(|source| HarnessError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    run_source(path, &source)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixture {
    pub name: String,
    pub path: PathBuf,
}

/// `nested/fooBar-baz.kt` -> `test_nested_foo_bar_baz`.
pub fn test_name_for(relative: &Path) -> String {
    let stem = relative.with_extension("");
    let mut name = String::from("test");
    for component in stem.components() {
        name.push('_');
        let mut previous_lower = false;
        for ch in component.as_os_str().to_string_lossy().chars() {
            if ch.is_ascii_alphanumeric() {
                if ch.is_ascii_uppercase() && previous_lower {
                    name.push('_');
                }
                name.push(ch.to_ascii_lowercase());
                previous_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
            } else {
                if !name.ends_with('_') {
                    name.push('_');
                }
                previous_lower = false;
            }
        }
    }
    name
}

/// Every fixture below `dir`, sorted by relative path.
pub fn discover_fixtures(dir: &Path) -> Vec<Fixture> {
    let mut fixtures: Vec<Fixture> = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(%error, "skipping unreadable fixture entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == FIXTURE_EXTENSION))
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(dir).ok()?.to_path_buf();
            Some(Fixture {
                name: test_name_for(&relative),
                path: entry.into_path(),
            })
        })
        .collect();
    fixtures.sort_by(|a, b| a.path.cmp(&b.path));
    fixtures
}

/// Runs every fixture below `dir`.
pub fn verify_directory(dir: &Path) -> Result<Vec<FixtureReport>, HarnessError> {
    discover_fixtures(dir)
        .iter()
        .map(|fixture| run_fixture(&fixture.path))
        .collect()
}

/// Fails when a fixture on disk has no registered test, or a registered test
/// names a fixture that does not exist.
pub fn assert_all_files_present(dir: &Path, registered: &[&str]) -> Result<(), CoverageError> {
    let on_disk: BTreeSet<String> = discover_fixtures(dir).into_iter().map(|f| f.name).collect();
    let registered: BTreeSet<String> = registered.iter().map(|name| name.to_string()).collect();
    let missing_tests: Vec<String> = on_disk.difference(&registered).cloned().collect();
    let missing_fixtures: Vec<String> = registered.difference(&on_disk).cloned().collect();
    if missing_tests.is_empty() && missing_fixtures.is_empty() {
        Ok(())
    } else {
        Err(CoverageError {
            missing_tests,
            missing_fixtures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERSON: &str = r#"@DataSchema
interface Person {
    val name: String
}

fun main() {
    val df: DataFrame<Person> = load()
"#;

    #[test]
    fn test_should_parse_markers_and_anchors() {
        // arrange
        let source = "df[\"x\"]/*!UNKNOWN_COLUMN: Column 'x'*/\nfoo()  /*!SCHEMA_ERROR*/";

        // act
        let expectations = parse_expectations(source).unwrap();

        // assert
        assert_eq!(expectations.len(), 2);
        assert_eq!(expectations[0].code, DiagnosticKind::UnknownColumn);
        assert_eq!(expectations[0].anchor, 7);
        assert_eq!(expectations[0].message.as_deref(), Some("Column 'x'"));
        assert_eq!(expectations[1].line, 2);
        assert_eq!(expectations[1].anchor, source.find("foo()").unwrap() + 5);
        assert_eq!(expectations[1].message, None);
    }

    #[test]
    fn test_should_anchor_consecutive_markers_to_same_expression() {
        let source = "df.x/*!UNKNOWN_COLUMN*/ /*!SCHEMA_ERROR*/";
        let expectations = parse_expectations(source).unwrap();
        assert_eq!(expectations[0].anchor, 4);
        assert_eq!(expectations[1].anchor, 4);
    }

    #[test]
    fn test_should_reject_malformed_markers() {
        assert!(matches!(
            parse_expectations("x /*!NOT_A_CODE*/"),
            Err(HarnessError::MalformedMarker { line: 1, .. })
        ));
        assert!(matches!(
            parse_expectations("\nx /*!UNKNOWN_COLUMN"),
            Err(HarnessError::MalformedMarker { line: 2, .. })
        ));
    }

    #[test]
    fn test_should_match_fixture_expectations() {
        let marker = "/*!UNKNOWN_COLUMN: did you mean 'name'*/";
        let source = format!("{PERSON}    df[\"naem\"]{marker}\n}}\n");
        let report = run_source(Path::new("inline.kt"), &source).unwrap();
        assert!(report.is_success(), "{report}");
        let rendered =
            "/*!UNKNOWN_COLUMN: Column 'naem' does not exist in Person (did you mean 'name'?)*/";
        assert_eq!(report.actual, source.replace(marker, rendered));
    }

    #[test]
    fn test_should_report_missing_and_unexpected_diagnostics() {
        // arrange
        let source = format!("{PERSON}    df[\"name\"]/*!UNKNOWN_COLUMN*/\n    df[\"nope\"]\n}}\n");

        // act
        let report = run_source(Path::new("inline.kt"), &source).unwrap();

        // assert
        assert!(!report.is_success());
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.unexpected.len(), 1);
        assert!(report.unexpected[0].message.contains("'nope'"));
        assert!(report.actual.contains("df[\"nope\"]/*!UNKNOWN_COLUMN: Column 'nope'"));
        assert!(!report.actual.contains("df[\"name\"]/*!"));
    }

    #[test]
    fn test_should_derive_test_names_from_paths() {
        assert_eq!(test_name_for(Path::new("nested/foo-bar.kt")), "test_nested_foo_bar");
        assert_eq!(test_name_for(Path::new("groupBy.kt")), "test_group_by");
        assert_eq!(test_name_for(Path::new("simple.kt")), "test_simple");
        assert_eq!(test_name_for(Path::new("joinOn/Orders.kt")), "test_join_on_orders");
    }

    #[test]
    fn test_should_detect_coverage_drift() {
        // arrange
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("simple.kt"), "").unwrap();
        fs::write(root.join("nested/foo-bar.kt"), "").unwrap();
        fs::write(root.join("notes.txt"), "").unwrap();

        // act
        let complete = assert_all_files_present(root, &["test_simple", "test_nested_foo_bar"]);
        let drift = assert_all_files_present(root, &["test_simple", "test_gone"]);

        // assert
        assert_eq!(complete, Ok(()));
        assert_eq!(
            drift,
            Err(CoverageError {
                missing_tests: vec!["test_nested_foo_bar".to_string()],
                missing_fixtures: vec!["test_gone".to_string()],
            })
        );
    }

    #[test]
    fn test_should_report_unreadable_fixtures() {
        let result = run_fixture(Path::new("/definitely/not/here.kt"));
        assert!(matches!(result, Err(HarnessError::Io { .. })));
    }
}
