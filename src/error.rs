use std::path::PathBuf;

use thiserror::Error;

/// Failure of a schema operation or of a transform rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("duplicate column '{name}'")]
    DuplicateColumn { name: String },

    /// `candidates` holds the column names of the schema the lookup ran against,
    /// in schema order, so callers can compute a suggestion.
    #[error("column '{name}' does not exist")]
    UnknownColumn {
        name: String,
        candidates: Vec<String>,
    },

    #[error("{0}")]
    Invalid(String),
}

impl SchemaError {
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateColumn { name: name.into() }
    }

    pub fn unknown<'a>(
        name: impl Into<String>,
        candidates: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self::UnknownColumn {
            name: name.into(),
            candidates: candidates.into_iter().map(str::to_string).collect(),
        }
    }
}

/// Why an expression's schema could not be determined. Never reported; the
/// engine turns every variant into the unknown schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("expression has no statically known schema")]
    Unresolved,

    #[error("call '{0}' is not a recognized dataframe operation")]
    Unrecognized(String),

    #[error("transform failed: {0}")]
    Transform(SchemaError),
}

/// Outcome of applying an operation rule that did not produce a schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Failure against an argument frame rather than the receiver.
    #[error("{subject}: {error}")]
    Operand { subject: String, error: SchemaError },

    /// The call matched by shape but its arguments are not statically known
    /// (non-literal column names, DSL lambdas, ...).
    #[error("arguments are not statically known")]
    NotApplicable,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to read fixture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to analyze fixture {path}: {message}")]
    Analysis { path: PathBuf, message: String },

    #[error("malformed expectation marker at line {line}: {text}")]
    MalformedMarker { line: usize, text: String },
}

/// Drift between the fixture corpus on disk and the registered test table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "fixture coverage mismatch: missing tests for {missing_tests:?}, \
     missing fixtures for {missing_fixtures:?}"
)]
pub struct CoverageError {
    pub missing_tests: Vec<String>,
    pub missing_fixtures: Vec<String>,
}
