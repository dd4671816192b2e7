//! Walks a source unit and validates every column reference against the
//! inferred schema of its receiver.

use tracing::debug;

use crate::diagnostics::{is_line_ignored, Diagnostic, DiagnosticKind, LineIndex, Severity};
use crate::error::SchemaError;
use crate::host::{HostContext, COLUMN_NAME_ANNOTATION, DATA_SCHEMA_ANNOTATION};
use crate::inference::{InferenceEngine, SchemaBinding, Shape};
use crate::registry::OperationRegistry;
use crate::schema::{ColumnSchema, TypeRef};
use crate::syntax::ast::*;

/// Member properties of frames and column groups; `df.size` never reads a column.
pub const FRAME_MEMBERS: &[&str] = &[
    "columnNames",
    "columns",
    "columnTypes",
    "columnsCount",
    "rowsCount",
    "indices",
    "nrow",
    "ncol",
    "size",
    "schema",
    "rows",
    "isEmpty",
    "isNotEmpty",
    "lastIndex",
];

/// Member properties of rows.
pub const ROW_MEMBERS: &[&str] = &["index", "df", "prev", "next", "values"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerOptions {
    /// Report warnings and infos, not only errors.
    pub warnings: bool,
    pub max_suggestion_distance: usize,
    pub report_untracked: bool,
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self {
            warnings: true,
            max_suggestion_distance: 2,
            report_untracked: false,
        }
    }
}

pub(crate) fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0; b_chars.len() + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        current[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = usize::from(a_char != b_char);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b_chars.len()]
}

/// Closest candidate within `max_distance`; ties go to the earlier candidate.
pub(crate) fn find_best_match<'a, S: AsRef<str>>(
    name: &str,
    candidates: &'a [S],
    max_distance: usize,
) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (c.as_ref(), levenshtein(name, c.as_ref())))
        .filter(|(_, dist)| *dist <= max_distance)
        .min_by_key(|(_, dist)| *dist)
        .map(|(c, _)| c)
}

fn is_member_property(shape: Shape, name: &str) -> bool {
    match shape {
        Shape::DataRow => ROW_MEMBERS.contains(&name),
        Shape::DataFrame | Shape::ColumnGroup => FRAME_MEMBERS.contains(&name),
        Shape::GroupBy => true,
    }
}

/// Frame-like host type that carries no usable schema marker.
fn is_untracked_frame(ty: &TypeRef) -> bool {
    match ty.simple_name() {
        "AnyFrame" => true,
        "DataFrame" => ty.args.iter().all(TypeRef::is_star),
        _ => false,
    }
}

pub struct Checker<'a> {
    host: &'a dyn HostContext,
    engine: InferenceEngine<'a>,
    options: CheckerOptions,
    found: Vec<(DiagnosticKind, Span, String)>,
}

impl<'a> Checker<'a> {
    pub fn new(
        host: &'a dyn HostContext,
        registry: &'a OperationRegistry,
        options: CheckerOptions,
    ) -> Self {
        Self {
            host,
            engine: InferenceEngine::new(host, registry),
            options,
            found: Vec::new(),
        }
    }

    /// Diagnostics for `unit`, ordered by position. `source` is the text the
    /// unit was parsed from.
    pub fn check(mut self, unit: &SourceUnit, source: &str) -> Vec<Diagnostic> {
        for item in &unit.items {
            match item {
                Item::Class(class) => self.visit_class(class),
                Item::Function(fun) => self.visit_function(fun),
                Item::Property(val) => self.visit_val(val),
            }
        }

        let max_distance = self.options.max_suggestion_distance;
        for failure in self.engine.failures() {
            let (kind, message) = failure_message(&failure.error, &failure.subject, max_distance);
            self.found.push((kind, failure.span, message));
        }

        let index = LineIndex::new(source);
        let mut diagnostics: Vec<Diagnostic> = self
            .found
            .into_iter()
            .map(|(kind, span, message)| Diagnostic::new(kind, span, message, &index))
            .filter(|d| self.options.warnings || d.severity == Severity::Error)
            .filter(|d| {
                !is_line_ignored(source, d.line, d.code)
                    && !is_line_ignored(source, d.end_line, d.code)
            })
            .collect();
        diagnostics.sort();
        diagnostics.dedup();
        debug!(count = diagnostics.len(), "checked unit");
        diagnostics
    }

    fn report(&mut self, kind: DiagnosticKind, span: Span, message: String) {
        self.found.push((kind, span, message));
    }

    fn visit_class(&mut self, class: &ClassDecl) {
        if class.has_annotation(DATA_SCHEMA_ANNOTATION) {
            self.engine.marker_schema(&class.name);
            for property in class.properties.iter().filter(|property| property.is_stored()) {
                let column = find_annotation(&property.annotations, COLUMN_NAME_ANNOTATION)
                    .and_then(|annotation| annotation.string_arg())
                    .unwrap_or(property.name.as_str());
                let shadowed = if FRAME_MEMBERS.contains(&column) {
                    Some("DataFrame")
                } else if ROW_MEMBERS.contains(&column) {
                    Some("DataRow")
                } else {
                    None
                };
                if let Some(owner) = shadowed {
                    self.report(
                        DiagnosticKind::ColumnNameShadowsMember,
                        property.name_span,
                        format!(
                            "Column name '{column}' in {} shadows the {owner} member '{column}'; \
                             access the column as [\"{column}\"]",
                            class.name
                        ),
                    );
                }
            }
        }
        for default in class.params.iter().filter_map(|param| param.default.as_ref()) {
            self.visit_expr(default);
        }
        for property in &class.properties {
            if let Some(init) = &property.init {
                self.visit_expr(init);
            }
            if let Some(getter) = &property.getter {
                self.visit_body(getter);
            }
        }
        for method in &class.methods {
            self.visit_function(method);
        }
    }

    fn visit_function(&mut self, fun: &FunDecl) {
        for default in fun.params.iter().filter_map(|param| param.default.as_ref()) {
            self.visit_expr(default);
        }
        if let Some(body) = &fun.body {
            self.visit_body(body);
        }
    }

    fn visit_body(&mut self, body: &FunBody) {
        match body {
            FunBody::Expr(expr) => self.visit_expr(expr),
            FunBody::Block(block) => self.visit_block(block),
        }
    }

    fn visit_val(&mut self, val: &ValDecl) {
        if let Some(init) = &val.init {
            self.visit_expr(init);
        }
        if let Some(getter) = &val.getter {
            self.visit_body(getter);
        }
    }

    fn visit_block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            match stmt {
                Stmt::Val(val) => self.visit_val(val),
                Stmt::Function(fun) => self.visit_function(fun),
                Stmt::Expr(expr) => self.visit_expr(expr),
                Stmt::Assign { target, value, .. } => {
                    self.visit_expr(target);
                    self.visit_expr(value);
                }
                Stmt::Return { value, .. } => {
                    if let Some(value) = value {
                        self.visit_expr(value);
                    }
                }
            }
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Call { callee, args, .. } => {
                self.engine.infer(expr);
                // The callee member names a function, not a column.
                match &callee.kind {
                    ExprKind::Member { receiver, .. } => self.visit_expr(receiver),
                    ExprKind::Name(_) => {}
                    _ => self.visit_expr(callee),
                }
                for arg in args {
                    self.visit_expr(&arg.value);
                }
            }
            ExprKind::Member { receiver, name, .. } => {
                self.visit_expr(receiver);
                self.check_column(expr, receiver, name, false);
            }
            ExprKind::Index { receiver, indices } => {
                self.visit_expr(receiver);
                for index in indices {
                    self.visit_expr(index);
                }
                if let [index] = indices.as_slice() {
                    if let Some(name) = index.string_literal() {
                        self.check_column(expr, receiver, name, true);
                    }
                }
            }
            ExprKind::Lambda(lambda) => self.visit_block(&lambda.body),
            ExprKind::Block(block) => self.visit_block(block),
            _ => expr.for_each_child(|child| self.visit_expr(child)),
        }
    }

    /// Validates `receiver.name` / `receiver["name"]` (the whole access is `access`).
    fn check_column(&mut self, access: &Expr, receiver: &Expr, name: &str, indexed: bool) {
        let binding = self.engine.infer(receiver);
        let SchemaBinding::Known { shape, schema, .. } = &binding else {
            if indexed && self.options.report_untracked {
                self.check_untracked(access, receiver, name);
            }
            return;
        };
        let member =
            is_member_property(*shape, name) || self.host.extension_property(name).is_some();
        if !indexed && member {
            return;
        }
        if *shape == Shape::GroupBy {
            return;
        }
        if schema.contains(name) {
            self.check_expected_type(access, name, schema);
            return;
        }
        let max_distance = self.options.max_suggestion_distance;
        let message = unknown_column_message(name, &binding.describe(), schema, max_distance);
        self.report(DiagnosticKind::UnknownColumn, access.span, message);
    }

    fn check_expected_type(&mut self, access: &Expr, name: &str, schema: &ColumnSchema) {
        let Some(expected) = self.host.declared_type(access) else {
            return;
        };
        let Some(actual) = self.engine.value_type(access) else {
            return;
        };
        if actual.is_assignable_to(&expected) {
            return;
        }
        let column_type = schema
            .lookup(name)
            .map(|column| column.display_type())
            .unwrap_or_else(|| actual.to_string());
        self.report(
            DiagnosticKind::ColumnTypeMismatch,
            access.span,
            format!(
                "Column '{name}' has type {column_type}, \
                 which is not compatible with the expected type {expected}"
            ),
        );
    }

    fn check_untracked(&mut self, access: &Expr, receiver: &Expr, name: &str) {
        let untracked = self
            .host
            .resolve_type(receiver)
            .is_some_and(|ty| is_untracked_frame(&ty));
        if untracked {
            self.report(
                DiagnosticKind::UntrackedDataframe,
                access.span,
                format!(
                    "Column '{name}' is read from a DataFrame without a schema marker; \
                     it cannot be checked"
                ),
            );
        }
    }
}

fn unknown_column_message(
    name: &str,
    subject: &str,
    schema: &ColumnSchema,
    max_distance: usize,
) -> String {
    let candidates: Vec<&str> = schema.names().collect();
    let suggestion = find_best_match(name, &candidates, max_distance)
        .map(|best| format!(" (did you mean '{best}'?)"))
        .unwrap_or_default();
    format!("Column '{name}' does not exist in {subject}{suggestion}")
}

fn failure_message(
    error: &SchemaError,
    subject: &str,
    max_distance: usize,
) -> (DiagnosticKind, String) {
    match error {
        SchemaError::UnknownColumn { name, candidates } => {
            let suggestion = find_best_match(name, candidates, max_distance)
                .map(|best| format!(" (did you mean '{best}'?)"))
                .unwrap_or_default();
            (
                DiagnosticKind::UnknownColumn,
                format!("Column '{name}' does not exist in {subject}{suggestion}"),
            )
        }
        SchemaError::DuplicateColumn { name } => (
            DiagnosticKind::DuplicateColumn,
            format!("Duplicate column '{name}' in {subject}"),
        ),
        SchemaError::Invalid(message) => (DiagnosticKind::SchemaError, message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::KotlinHost;
    use crate::syntax::parse_source;

    const PERSON: &str = r#"
@DataSchema
interface Person {
    val name: String
    val age: Int
}
"#;

    fn check_with(body: &str, options: CheckerOptions) -> Vec<Diagnostic> {
        let source = format!(
            "{PERSON}\nfun main() {{\n    val df: DataFrame<Person> = load()\n{body}\n}}\n"
        );
        let unit = parse_source(&source).unwrap();
        let host = KotlinHost::new(&unit);
        let registry = OperationRegistry::standard();
        Checker::new(&host, &registry, options).check(&unit, &source)
    }

    fn check(body: &str) -> Vec<Diagnostic> {
        check_with(body, CheckerOptions::default())
    }

    fn check_source(items: &str) -> Vec<Diagnostic> {
        let source = format!("{PERSON}\n{items}");
        let unit = parse_source(&source).unwrap();
        let host = KotlinHost::new(&unit);
        let registry = OperationRegistry::standard();
        Checker::new(&host, &registry, CheckerOptions::default()).check(&unit, &source)
    }

    #[test]
    fn test_should_compute_levenshtein_distance() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("flaw", "lawn"), 2);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("name", "name"), 0);
    }

    #[test]
    fn test_should_find_best_match_for_typo() {
        let candidates = ["name", "age", "nme"];
        assert_eq!(find_best_match("naem", &candidates, 2), Some("name"));
        assert_eq!(find_best_match("zzzzzz", &candidates, 2), None);
        // Ties resolve to the earlier candidate.
        assert_eq!(find_best_match("ame", &candidates, 2), Some("name"));
    }

    #[test]
    fn test_should_report_unknown_column_with_suggestion() {
        // act
        let diagnostics = check("    println(df[\"naem\"])");

        // assert
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        assert_eq!(diagnostics[0].code, DiagnosticKind::UnknownColumn);
        assert_eq!(
            diagnostics[0].message,
            "Column 'naem' does not exist in Person (did you mean 'name'?)"
        );
    }

    #[test]
    fn test_should_accept_known_columns_and_members() {
        let body = r#"
    df["name"]
    df.age
    df.rowsCount()
    df.size
    df.first().index
"#;
        let diagnostics = check(body);
        assert!(diagnostics.is_empty(), "unexpected errors: {diagnostics:?}");
    }

    #[test]
    fn test_no_false_positive_on_untracked_receivers() {
        let body = r#"
    val raw = DataFrame.readCSV("x.csv")
    raw["anything"]
    other.whatever
"#;
        let diagnostics = check(body);
        assert!(diagnostics.is_empty(), "unexpected errors: {diagnostics:?}");
    }

    #[test]
    fn test_should_report_type_mismatch_for_declared_targets() {
        // act
        let body = r#"
    val ages: DataColumn<String> = df["age"]
    val ok: DataColumn<Int> = df["age"]
"#;
        let diagnostics = check(body);

        // assert
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        assert_eq!(diagnostics[0].code, DiagnosticKind::ColumnTypeMismatch);
        assert!(diagnostics[0].message.contains("Column 'age' has type Int"));
    }

    #[test]
    fn test_should_report_transform_failures_at_call() {
        let diagnostics = check("    df.rename(\"age\", \"name\")");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticKind::DuplicateColumn);
        assert_eq!(diagnostics[0].message, "Duplicate column 'name' in Person");
    }

    #[test]
    fn test_should_drop_warnings_when_disabled() {
        // arrange
        let source = "@DataSchema\ninterface Stats {\n    val size: Int\n}\n";
        let unit = parse_source(source).unwrap();
        let host = KotlinHost::new(&unit);
        let registry = OperationRegistry::standard();
        let quiet = CheckerOptions {
            warnings: false,
            ..CheckerOptions::default()
        };

        // act
        let loud = Checker::new(&host, &registry, CheckerOptions::default()).check(&unit, source);
        let silent = Checker::new(&host, &registry, quiet).check(&unit, source);

        // assert
        assert_eq!(loud.len(), 1);
        assert_eq!(loud[0].code, DiagnosticKind::ColumnNameShadowsMember);
        assert_eq!(loud[0].severity, Severity::Warning);
        assert!(silent.is_empty());
    }

    #[test]
    fn test_should_report_untracked_frames_only_when_enabled() {
        let body = "    val raw: AnyFrame = load()\n    raw[\"x\"]";
        assert!(check(body).is_empty());

        let options = CheckerOptions {
            report_untracked: true,
            ..CheckerOptions::default()
        };
        let diagnostics = check_with(body, options);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code, DiagnosticKind::UntrackedDataframe);
        assert_eq!(diagnostics[0].severity, Severity::Info);
    }

    #[test]
    fn test_should_ignore_suppressed_lines() {
        let body = r#"
    df["naem"] // dataframe: ignore[UNKNOWN_COLUMN]
    df["agee"] // dataframe: ignore[SCHEMA_ERROR]
"#;
        let diagnostics = check(body);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("'agee'"));
    }

    #[test]
    fn test_should_check_class_property_initializers_and_defaults() {
        // arrange
        let items = r#"
class Report(val df: DataFrame<Person>, val label: String = df["nmae"].toString()) {
    val bad = df["naem"]
    val good = df["age"]
}
"#;

        // act
        let diagnostics = check_source(items);

        // assert
        let messages: Vec<&str> = diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(diagnostics.len(), 2, "{messages:?}");
        assert!(diagnostics.iter().all(|d| d.code == DiagnosticKind::UnknownColumn));
        assert!(messages[0].starts_with("Column 'nmae' does not exist in Person"));
        assert!(messages[1].starts_with("Column 'naem' does not exist in Person"));
    }

    #[test]
    fn test_should_not_read_extension_properties_as_columns() {
        let items = r#"
val DataFrame<Person>.adults: DataFrame<Person>
    get() = this.filter { it.agee > 17 }

fun main(df: DataFrame<Person>) {
    df.adults["name"]
    df.adults.nmae
}
"#;
        let diagnostics = check_source(items);

        let messages: Vec<&str> = diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Column 'agee' does not exist in Person (did you mean 'age'?)",
                "Column 'nmae' does not exist in Person (did you mean 'name'?)",
            ]
        );
    }

    #[test]
    fn test_should_check_inside_templates_and_when_branches() {
        let body = r#"
    val text = "${df["nmae"]} is ${df.age}"
    val picked = when (flag) {
        true -> df["agee"]
        else -> df["name"]
    }
"#;
        let diagnostics = check(body);

        let messages: Vec<&str> = diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(messages[0].contains("'nmae'"));
        assert!(messages[1].contains("'agee'"));
    }

    #[test]
    fn test_should_keep_checking_after_unsupported_statements() {
        let body = r#"
    try {
        df["skipped"]
    } catch (e: Exception) {
        println(e)
    }
    df["naem"]
"#;
        let diagnostics = check(body);
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        assert!(diagnostics[0].message.contains("'naem'"));
    }

    #[test]
    fn test_should_be_deterministic() {
        let body = "    df[\"b\"]\n    df.select(\"zz\")\n    df[\"a\"]";
        let first = serde_json::to_string(&check(body)).unwrap();
        let second = serde_json::to_string(&check(body)).unwrap();
        assert_eq!(first, second);
        assert_eq!(check(body).len(), 3);
    }
}
