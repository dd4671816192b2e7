//! Schema inference for dataframe-valued expressions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{InferenceError, SchemaError, TransformError};
use crate::host::{DeclarationKind, HostContext, COLUMN_NAME_ANNOTATION};
use crate::registry::{OperationArg, OperationCall, OperationRegistry, ReceiverKind, GROUP_COLUMN};
use crate::schema::{ColumnDescriptor, ColumnKind, ColumnSchema, TypeRef};
use crate::syntax::ast::{
    find_annotation, BinaryOp, Expr, ExprId, ExprKind, Lambda, Literal, Span, UnaryOp,
};

/// Operations whose lambda receives one row of the receiver frame.
const ROW_LAMBDA_OPERATIONS: &[&str] = &["filter", "add", "update", "first", "last"];

/// Wording used in messages for schemas that did not come from a marker.
pub const INFERRED_SCHEMA: &str = "inferred column set";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    DataFrame,
    GroupBy,
    ColumnGroup,
    DataRow,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shape::DataFrame => "DataFrame",
            Shape::GroupBy => "GroupBy",
            Shape::ColumnGroup => "ColumnGroup",
            Shape::DataRow => "DataRow",
        };
        f.write_str(name)
    }
}

/// Schema attached to an expression, or the unknown (bottom) binding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SchemaBinding {
    Known {
        shape: Shape,
        schema: Arc<ColumnSchema>,
        /// Marker type the schema was declared by.
        origin: Option<String>,
    },
    #[default]
    Unknown,
}

impl SchemaBinding {
    pub fn known(shape: Shape, schema: Arc<ColumnSchema>, origin: Option<String>) -> Self {
        Self::Known {
            shape,
            schema,
            origin,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known { .. })
    }

    pub fn shape(&self) -> Option<Shape> {
        match self {
            Self::Known { shape, .. } => Some(*shape),
            Self::Unknown => None,
        }
    }

    pub fn schema(&self) -> Option<&Arc<ColumnSchema>> {
        match self {
            Self::Known { schema, .. } => Some(schema),
            Self::Unknown => None,
        }
    }

    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Known { origin, .. } => origin.as_deref(),
            Self::Unknown => None,
        }
    }

    pub fn with_shape(self, shape: Shape) -> Self {
        match self {
            Self::Known { schema, origin, .. } => Self::Known {
                shape,
                schema,
                origin,
            },
            Self::Unknown => Self::Unknown,
        }
    }

    /// Marker name, or a description of an inferred schema.
    pub fn describe(&self) -> String {
        self.origin().unwrap_or(INFERRED_SCHEMA).to_string()
    }

    /// Same shape and same columns, regardless of where the schema came from.
    pub fn same_structure(&self, other: &SchemaBinding) -> bool {
        match (self, other) {
            (
                Self::Known {
                    shape: a, schema: x, ..
                },
                Self::Known {
                    shape: b, schema: y, ..
                },
            ) => a == b && (Arc::ptr_eq(x, y) || x == y),
            _ => false,
        }
    }
}

/// Schema error produced while inferring, reported at `span`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceFailure {
    pub span: Span,
    pub error: SchemaError,
    /// Marker name or schema description the error is about.
    pub subject: String,
}

/// Per-pass inference state. Results are memoized by expression id; a new
/// engine must be created for every analysis pass.
pub struct InferenceEngine<'a> {
    host: &'a dyn HostContext,
    registry: &'a OperationRegistry,
    cache: HashMap<ExprId, SchemaBinding>,
    in_progress: HashSet<ExprId>,
    markers: HashMap<String, Option<Arc<ColumnSchema>>>,
    marker_stack: Vec<String>,
    call_failures: BTreeMap<ExprId, InferenceFailure>,
    marker_failures: Vec<InferenceFailure>,
}

impl<'a> InferenceEngine<'a> {
    pub fn new(host: &'a dyn HostContext, registry: &'a OperationRegistry) -> Self {
        Self {
            host,
            registry,
            cache: HashMap::new(),
            in_progress: HashSet::new(),
            markers: HashMap::new(),
            marker_stack: Vec::new(),
            call_failures: BTreeMap::new(),
            marker_failures: Vec::new(),
        }
    }

    /// Schema failures recorded so far: marker conflicts, then failed calls
    /// in expression order. Each call appears at most once.
    pub fn failures(&self) -> impl Iterator<Item = &InferenceFailure> {
        self.marker_failures.iter().chain(self.call_failures.values())
    }

    pub fn infer(&mut self, expr: &Expr) -> SchemaBinding {
        if let Some(binding) = self.cache.get(&expr.id) {
            return binding.clone();
        }
        if !self.in_progress.insert(expr.id) {
            trace!(expr = expr.id.0, "recursive inference");
            return SchemaBinding::Unknown;
        }
        let binding = match self.try_infer(expr) {
            Ok(binding) => binding,
            Err(error) => {
                trace!(expr = expr.id.0, %error, "schema unknown");
                SchemaBinding::Unknown
            }
        };
        self.in_progress.remove(&expr.id);
        self.cache.insert(expr.id, binding.clone());
        binding
    }

    fn try_infer(&mut self, expr: &Expr) -> Result<SchemaBinding, InferenceError> {
        let host = self.host;
        if let Some(ty) = host.resolve_type(expr) {
            return self.binding_for_type(&ty).ok_or(InferenceError::Unresolved);
        }
        match &expr.kind {
            ExprKind::Name(_) => {
                let declaration = host.declaration(expr).ok_or(InferenceError::Unresolved)?;
                match declaration.kind {
                    DeclarationKind::LambdaParam { lambda, index } => {
                        self.infer_row_param(lambda, index)
                    }
                    _ if declaration.is_stable() => {
                        let init = declaration
                            .init
                            .and_then(|id| host.expr(id))
                            .ok_or(InferenceError::Unresolved)?;
                        Ok(self.infer(init))
                    }
                    _ => Err(InferenceError::Unresolved),
                }
            }
            ExprKind::NotNull(inner) => Ok(self.infer(inner)),
            ExprKind::Block(block) => {
                let tail = block.tail_expr().ok_or(InferenceError::Unresolved)?;
                Ok(self.infer(tail))
            }
            ExprKind::If {
                then_branch,
                else_branch: Some(else_branch),
                ..
            } => {
                let then_binding = self.infer(then_branch);
                let else_binding = self.infer(else_branch);
                if then_binding.same_structure(&else_binding) {
                    Ok(then_binding)
                } else {
                    Err(InferenceError::Unresolved)
                }
            }
            ExprKind::When { branches, .. } => {
                if !branches.iter().any(|branch| branch.is_else) {
                    return Err(InferenceError::Unresolved);
                }
                let mut bindings = branches.iter().map(|branch| self.infer(&branch.body));
                let first = bindings.next().ok_or(InferenceError::Unresolved)?;
                let rest: Vec<SchemaBinding> = bindings.collect();
                if rest.iter().all(|binding| first.same_structure(binding)) {
                    Ok(first)
                } else {
                    Err(InferenceError::Unresolved)
                }
            }
            ExprKind::Member { receiver, name, .. } => {
                let receiver = self.infer(receiver);
                navigate(&receiver, name)
            }
            ExprKind::Index { receiver, indices } => match indices.as_slice() {
                [index] => {
                    let name = index.string_literal().ok_or(InferenceError::Unresolved)?;
                    let receiver = self.infer(receiver);
                    navigate(&receiver, name)
                }
                _ => Err(InferenceError::Unresolved),
            },
            ExprKind::Call { args, .. } => self.infer_call(expr, args.iter().map(|arg| &arg.value)),
            _ => Err(InferenceError::Unresolved),
        }
    }

    fn infer_row_param(
        &mut self,
        lambda: ExprId,
        index: usize,
    ) -> Result<SchemaBinding, InferenceError> {
        let host = self.host;
        let callee = host
            .lambda_call(lambda)
            .and_then(|call| host.expr(call))
            .and_then(|call| host.resolve_call(call))
            .ok_or(InferenceError::Unresolved)?;
        if index != 0 || !ROW_LAMBDA_OPERATIONS.contains(&callee.name.as_str()) {
            return Err(InferenceError::Unresolved);
        }
        let receiver = callee
            .receiver
            .and_then(|id| host.expr(id))
            .ok_or(InferenceError::Unresolved)?;
        let receiver = self.infer(receiver);
        if receiver.shape() != Some(Shape::DataFrame) {
            return Err(InferenceError::Unresolved);
        }
        self.registry.lookup_call(ReceiverKind::DataFrame, &callee)?;
        Ok(receiver.with_shape(Shape::DataRow))
    }

    fn infer_call<'e>(
        &mut self,
        call: &Expr,
        args: impl Iterator<Item = &'e Expr>,
    ) -> Result<SchemaBinding, InferenceError> {
        let host = self.host;
        let registry = self.registry;
        let callee = host.resolve_call(call).ok_or(InferenceError::Unresolved)?;
        let (receiver, receiver_kind) = match callee.receiver {
            Some(id) => {
                let receiver = host.expr(id).ok_or(InferenceError::Unresolved)?;
                let binding = self.infer(receiver);
                let kind = match (&binding, ReceiverKind::of(&binding)) {
                    (_, Some(kind)) => kind,
                    // `raw.cast<M>()` only needs the type argument.
                    (SchemaBinding::Unknown, None) => ReceiverKind::DataFrame,
                    _ => return Err(InferenceError::Unresolved),
                };
                (binding, kind)
            }
            None => (SchemaBinding::Unknown, ReceiverKind::TopLevel),
        };
        let rule = registry.lookup_call(receiver_kind, &callee)?;

        let args = args.map(|arg| self.operation_arg(arg)).collect();
        let type_args = callee
            .type_args
            .iter()
            .map(|ty| {
                let origin = Some(ty.simple_name().to_string());
                self.marker_schema(ty.simple_name())
                    .map(|schema| SchemaBinding::known(Shape::DataFrame, schema, origin))
                    .unwrap_or_default()
            })
            .collect();
        let subject = receiver.describe();
        let operation = OperationCall {
            receiver,
            args,
            type_args,
        };

        match rule.apply(&operation) {
            // Keep the receiver's schema identity when nothing changed.
            Ok(binding)
                if binding.origin().is_none() && binding.same_structure(&operation.receiver) =>
            {
                Ok(operation.receiver)
            }
            Ok(binding) => {
                let schema = describe_schema(&binding);
                debug!(operation = %callee.name, %schema, "applied operation");
                Ok(binding)
            }
            Err(TransformError::NotApplicable) => Err(InferenceError::Unresolved),
            Err(TransformError::Schema(error)) => {
                Err(self.record_failure(call, &callee.name, subject, error))
            }
            // The argument frame is the subject, not the receiver.
            Err(TransformError::Operand { subject, error }) => {
                Err(self.record_failure(call, &callee.name, subject, error))
            }
        }
    }

    fn record_failure(
        &mut self,
        call: &Expr,
        operation: &str,
        subject: String,
        error: SchemaError,
    ) -> InferenceError {
        debug!(operation, %error, "operation failed");
        self.call_failures.entry(call.id).or_insert_with(|| InferenceFailure {
            span: call.span,
            error: error.clone(),
            subject,
        });
        InferenceError::Transform(error)
    }

    fn operation_arg(&mut self, expr: &Expr) -> OperationArg {
        if let Some(text) = expr.string_literal() {
            return OperationArg::Text(text.to_string());
        }
        if let Some(value) = expr.int_literal() {
            return OperationArg::Int(value);
        }
        match &expr.kind {
            ExprKind::Binary {
                op: BinaryOp::Infix,
                infix: Some(infix),
                left,
                right,
            } if infix == "to" => match left.string_literal() {
                Some(name) => OperationArg::Pair {
                    name: name.to_string(),
                    ty: self.element_type(right),
                },
                None => OperationArg::Value(None),
            },
            ExprKind::Lambda(lambda) => match lambda.body.column_froms() {
                Some(columns) => OperationArg::ColumnDsl(
                    columns
                        .into_iter()
                        .map(|(name, value)| (name.to_string(), self.value_type(value)))
                        .collect(),
                ),
                None => OperationArg::Value(self.lambda_result_type(lambda)),
            },
            _ => {
                let binding = self.infer(expr);
                if binding.shape() == Some(Shape::DataFrame) {
                    OperationArg::Frame(binding)
                } else {
                    OperationArg::Value(self.value_type(expr))
                }
            }
        }
    }

    /// Element type of `listOf(...)`-style collection literals.
    fn element_type(&mut self, expr: &Expr) -> Option<TypeRef> {
        let ExprKind::Call {
            callee,
            type_args,
            args,
        } = &expr.kind
        else {
            return None;
        };
        let ExprKind::Name(name) = &callee.kind else {
            return None;
        };
        if !matches!(name.as_str(), "listOf" | "arrayOf" | "columnOf" | "listOfNotNull") {
            return None;
        }
        if let Some(ty) = type_args.first() {
            return Some(ty.clone());
        }
        let mut element: Option<TypeRef> = None;
        let mut nullable = false;
        for arg in args {
            if matches!(arg.value.kind, ExprKind::Literal(Literal::Null)) {
                nullable = true;
                continue;
            }
            let ty = self.value_type(&arg.value)?;
            nullable |= ty.nullable;
            element = Some(match element {
                None => ty.non_null(),
                Some(current) if current == ty.non_null() => current,
                Some(current) => current.widen_numeric(&ty)?,
            });
        }
        element.map(|ty| ty.with_nullable(nullable))
    }

    fn lambda_result_type(&mut self, lambda: &Lambda) -> Option<TypeRef> {
        let tail = lambda.body.tail_expr()?;
        self.value_type(tail)
    }

    /// Type of a value expression, as far as it can be determined statically.
    pub fn value_type(&mut self, expr: &Expr) -> Option<TypeRef> {
        let host = self.host;
        match &expr.kind {
            ExprKind::Binary { op, left, right, .. } => match op {
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                    let left = self.value_type(left)?;
                    if *op == BinaryOp::Add && left.simple_name() == "String" {
                        return Some(TypeRef::simple("String"));
                    }
                    let right = self.value_type(right)?;
                    let widened = left.widen_numeric(&right)?;
                    Some(widened.with_nullable(left.nullable || right.nullable))
                }
                BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Less
                | BinaryOp::LessEq
                | BinaryOp::Greater
                | BinaryOp::GreaterEq
                | BinaryOp::And
                | BinaryOp::Or => Some(TypeRef::simple("Boolean")),
                BinaryOp::Elvis => {
                    let left = self.value_type(left)?;
                    let right = self.value_type(right);
                    Some(left.non_null().with_nullable(right.is_some_and(|r| r.nullable)))
                }
                BinaryOp::Range | BinaryOp::Infix => None,
            },
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Not => Some(TypeRef::simple("Boolean")),
                UnaryOp::Neg | UnaryOp::Plus => self.value_type(operand),
            },
            ExprKind::NotNull(inner) => self.value_type(inner).map(|ty| ty.non_null()),
            ExprKind::Member { receiver, name, .. } => self
                .column_value_type(receiver, name)
                .or_else(|| host.resolve_type(expr)),
            ExprKind::Index { receiver, indices } => {
                let name = match indices.as_slice() {
                    [index] => index.string_literal()?,
                    _ => return None,
                };
                self.column_value_type(receiver, name)
            }
            ExprKind::If {
                then_branch,
                else_branch: Some(else_branch),
                ..
            } => {
                let then_type = self.value_type(then_branch)?;
                let else_type = self.value_type(else_branch)?;
                if then_type.non_null() == else_type.non_null() {
                    let nullable = then_type.nullable || else_type.nullable;
                    Some(then_type.non_null().with_nullable(nullable))
                } else {
                    then_type.widen_numeric(&else_type)
                }
            }
            ExprKind::When { branches, .. } => {
                if !branches.iter().any(|branch| branch.is_else) {
                    return None;
                }
                let mut merged: Option<TypeRef> = None;
                for branch in branches {
                    let ty = self.value_type(&branch.body)?;
                    merged = Some(match merged {
                        None => ty,
                        Some(current) if current.non_null() == ty.non_null() => {
                            let nullable = current.nullable || ty.nullable;
                            current.with_nullable(nullable)
                        }
                        Some(current) => current.widen_numeric(&ty)?,
                    });
                }
                merged
            }
            ExprKind::Block(block) => {
                let tail = block.tail_expr()?;
                self.value_type(tail)
            }
            ExprKind::Lambda(lambda) => self.lambda_result_type(lambda),
            ExprKind::Name(_) => {
                if let Some(ty) = host.resolve_type(expr) {
                    return Some(ty);
                }
                let declaration = host.declaration(expr)?;
                if let DeclarationKind::LambdaParam { .. } = declaration.kind {
                    return frame_type(&self.infer(expr));
                }
                if !declaration.is_stable() {
                    return None;
                }
                let init = declaration.init.and_then(|id| host.expr(id))?;
                self.value_type(init)
            }
            _ => host.resolve_type(expr).or_else(|| frame_type(&self.infer(expr))),
        }
    }

    /// Type of `receiver.name` / `receiver["name"]` when it reads a column.
    fn column_value_type(&mut self, receiver: &Expr, name: &str) -> Option<TypeRef> {
        let binding = self.infer(receiver);
        let column = binding.schema()?.lookup(name)?;
        match binding.shape()? {
            Shape::DataRow => Some(column.value_type()),
            Shape::DataFrame | Shape::ColumnGroup => match column.kind {
                ColumnKind::Group => Some(TypeRef::generic("ColumnGroup", vec![column.ty.clone()])),
                _ => Some(TypeRef::generic("DataColumn", vec![column.value_type()])),
            },
            Shape::GroupBy => None,
        }
    }

    /// Binding for a declared host type: `DataFrame<M>`, `DataRow<M>`,
    /// `ColumnGroup<M>` or `GroupBy<K, G>` over `@DataSchema` markers.
    pub fn binding_for_type(&mut self, ty: &TypeRef) -> Option<SchemaBinding> {
        let shape = match ty.simple_name() {
            "DataFrame" => Shape::DataFrame,
            "DataRow" => Shape::DataRow,
            "ColumnGroup" => Shape::ColumnGroup,
            "GroupBy" => Shape::GroupBy,
            _ => return None,
        };
        let marker = ty.arg(0).filter(|arg| !arg.is_star())?;
        let schema = self.marker_schema(marker.simple_name())?;
        let origin = Some(marker.simple_name().to_string());
        if shape == Shape::GroupBy {
            let group_marker = ty.arg(1).cloned().unwrap_or_else(TypeRef::star);
            let group_schema = self.marker_schema(group_marker.simple_name());
            let group = ColumnDescriptor::frame(GROUP_COLUMN, group_marker, group_schema);
            let grouped = schema.with_column(group);
            return Some(SchemaBinding::known(shape, Arc::new(grouped), origin));
        }
        Some(SchemaBinding::known(shape, schema, origin))
    }

    /// Schema declared by the `@DataSchema` marker `name`, built once per pass.
    pub fn marker_schema(&mut self, name: &str) -> Option<Arc<ColumnSchema>> {
        if let Some(schema) = self.markers.get(name) {
            return schema.clone();
        }
        if self.marker_stack.iter().any(|open| open == name) {
            return None;
        }
        let host = self.host;
        let class = host.marker(name)?;
        self.marker_stack.push(name.to_string());

        let mut schema = ColumnSchema::empty();
        for supertype in &class.supertypes {
            if let Some(inherited) = self.marker_schema(supertype.simple_name()) {
                for column in inherited.columns() {
                    schema = self.add_marker_column(schema, column.clone(), name, class.name_span);
                }
            }
        }
        for property in class.properties.iter().filter(|property| property.is_stored()) {
            let Some(ty) = &property.ty else {
                continue;
            };
            let column_name = find_annotation(&property.annotations, COLUMN_NAME_ANNOTATION)
                .and_then(|annotation| annotation.string_arg())
                .unwrap_or(property.name.as_str());
            let column = self.marker_column(column_name, ty);
            schema = self.add_marker_column(schema, column, name, property.name_span);
        }

        self.marker_stack.pop();
        let schema = Arc::new(schema);
        debug!(marker = name, schema = %schema, "built marker schema");
        self.markers.insert(name.to_string(), Some(schema.clone()));
        Some(schema)
    }

    fn add_marker_column(
        &mut self,
        schema: ColumnSchema,
        column: ColumnDescriptor,
        marker: &str,
        span: Span,
    ) -> ColumnSchema {
        match schema.lookup(&column.name).map(|existing| *existing == column) {
            None => schema.with_column(column),
            // Overrides with an identical type are the same column.
            Some(true) => schema,
            Some(false) => {
                self.marker_failures.push(InferenceFailure {
                    span,
                    error: SchemaError::duplicate(&column.name),
                    subject: marker.to_string(),
                });
                schema
            }
        }
    }

    fn marker_column(&mut self, name: &str, ty: &TypeRef) -> ColumnDescriptor {
        let host = self.host;
        let (kind, marker) = match ty.simple_name() {
            "DataRow" | "ColumnGroup" => (ColumnKind::Group, ty.arg(0).cloned()),
            "DataFrame" | "List" => (ColumnKind::Frame, ty.arg(0).cloned()),
            "AnyFrame" => (ColumnKind::Frame, Some(TypeRef::star())),
            _ => (ColumnKind::Group, Some(ty.non_null())),
        };
        let Some(marker) = marker else {
            return ColumnDescriptor::value(name, ty.clone());
        };
        let column = if host.marker(marker.simple_name()).is_some() {
            match (kind, self.marker_schema(marker.simple_name())) {
                (ColumnKind::Group, Some(children)) => {
                    ColumnDescriptor::group(name, marker, children)
                }
                // A group that refers back to itself cannot be expanded.
                (_, children) => ColumnDescriptor::frame(name, marker, children),
            }
        } else if marker.is_star() && kind == ColumnKind::Frame && ty.simple_name() != "List" {
            ColumnDescriptor::frame(name, marker, None)
        } else {
            return ColumnDescriptor::value(name, ty.clone());
        };
        column.with_nullable(ty.nullable)
    }
}

fn frame_type(binding: &SchemaBinding) -> Option<TypeRef> {
    let marker = TypeRef::simple(binding.origin().unwrap_or("*"));
    Some(TypeRef::generic(binding.shape()?.to_string(), vec![marker]))
}

fn describe_schema(binding: &SchemaBinding) -> String {
    binding
        .schema()
        .map(|schema| schema.to_string())
        .unwrap_or_default()
}

/// Binding reached by reading column `name` of `receiver` as a nested
/// structure (group or frame column).
fn navigate(receiver: &SchemaBinding, name: &str) -> Result<SchemaBinding, InferenceError> {
    let shape = receiver.shape().ok_or(InferenceError::Unresolved)?;
    let column = receiver
        .schema()
        .and_then(|schema| schema.lookup(name))
        .ok_or(InferenceError::Unresolved)?;
    let children = column.children.clone().ok_or(InferenceError::Unresolved)?;
    let nested_shape = match (shape, column.kind) {
        (Shape::DataFrame | Shape::ColumnGroup, ColumnKind::Group) => Shape::ColumnGroup,
        (Shape::DataRow, ColumnKind::Group) => Shape::DataRow,
        (Shape::DataRow, ColumnKind::Frame) => Shape::DataFrame,
        _ => return Err(InferenceError::Unresolved),
    };
    let origin = (!column.ty.is_star()).then(|| column.ty.simple_name().to_string());
    Ok(SchemaBinding::known(nested_shape, children, origin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::KotlinHost;
    use crate::syntax::ast::{FunBody, Item, SourceUnit, Stmt};
    use crate::syntax::parse_source;

    const MARKERS: &str = r#"
@DataSchema
interface Address {
    val city: String
}

@DataSchema
interface Person {
    val name: String
    val age: Int
    val address: Address
}

@DataSchema
interface Employee : Person {
    @ColumnName("salary_usd")
    val salary: Double
}

@DataSchema
interface Order {
    val id: Int
    val total: Double
}
"#;

    /// Expression statements of `main`, with `val` initializers included.
    fn main_exprs(unit: &SourceUnit) -> Vec<&Expr> {
        let body = unit
            .items
            .iter()
            .find_map(|item| match item {
                Item::Function(fun) if fun.name == "main" => match &fun.body {
                    Some(FunBody::Block(block)) => Some(block),
                    _ => None,
                },
                _ => None,
            })
            .expect("main");
        body.stmts
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Expr(expr) => Some(expr),
                Stmt::Val(val) => val.init.as_ref(),
                _ => None,
            })
            .collect()
    }

    fn with_engine(body: &str, test: impl FnOnce(&mut InferenceEngine, Vec<&Expr>)) {
        let source = format!("{MARKERS}\nfun main() {{\n{body}\n}}\n");
        let unit = parse_source(&source).unwrap();
        let host = KotlinHost::new(&unit);
        let registry = OperationRegistry::standard();
        let mut engine = InferenceEngine::new(&host, &registry);
        test(&mut engine, main_exprs(&unit));
    }

    fn names(binding: &SchemaBinding) -> Vec<String> {
        binding
            .schema()
            .map(|schema| schema.names().map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_should_build_marker_with_inheritance_and_column_names() {
        with_engine("", |engine, _| {
            // act
            let schema = engine.marker_schema("Employee").unwrap();

            // assert
            assert_eq!(
                schema.names().collect::<Vec<_>>(),
                vec!["name", "age", "address", "salary_usd"]
            );
            let address = schema.lookup("address").unwrap();
            assert_eq!(address.kind, ColumnKind::Group);
            assert!(address.children.as_ref().unwrap().contains("city"));
            assert_eq!(engine.failures().count(), 0);
        });
    }

    #[test]
    fn test_should_memoize_bindings() {
        with_engine("val df: DataFrame<Person> = load()\ndf", |engine, exprs| {
            let first = engine.infer(exprs[1]);
            let second = engine.infer(exprs[1]);
            assert!(Arc::ptr_eq(first.schema().unwrap(), second.schema().unwrap()));
            assert_eq!(first.origin(), Some("Person"));
        });
    }

    #[test]
    fn test_should_follow_initializers_through_operation_chains() {
        let body = r#"
val df: DataFrame<Person> = load()
val small = df.select("name", "age").rename("age", "years")
small
"#;
        with_engine(body, |engine, exprs| {
            // act
            let binding = engine.infer(exprs[2]);

            // assert
            assert_eq!(names(&binding), vec!["name", "years"]);
            assert_eq!(binding.describe(), INFERRED_SCHEMA);
        });
    }

    #[test]
    fn test_should_reuse_receiver_binding_for_passthrough() {
        let body = "val df: DataFrame<Person> = load()\ndf\ndf.filter { it.age > 18 }";
        with_engine(body, |engine, exprs| {
            let receiver = engine.infer(exprs[1]);
            let filtered = engine.infer(exprs[2]);
            assert_eq!(filtered, receiver);
            assert_eq!(filtered.origin(), Some("Person"));
        });
    }

    #[test]
    fn test_should_drop_reassigned_variables_to_unknown() {
        let body = r#"
val base: DataFrame<Person> = load()
var df = base
df = base.head()
df
"#;
        with_engine(body, |engine, exprs| {
            assert!(engine.infer(exprs[1]).is_known());
            assert_eq!(engine.infer(exprs[2]), SchemaBinding::Unknown);
        });
    }

    #[test]
    fn test_should_require_if_arms_to_agree() {
        let body = r#"
val df: DataFrame<Person> = load()
if (flag) df else df.select("name")
if (flag) df.head() else df
"#;
        with_engine(body, |engine, exprs| {
            assert_eq!(engine.infer(exprs[1]), SchemaBinding::Unknown);
            assert_eq!(names(&engine.infer(exprs[2])), vec!["name", "age", "address"]);
        });
    }

    #[test]
    fn test_should_type_added_columns_from_row_lambdas() {
        let body = r#"
val df: DataFrame<Person> = load()
df.add("next") { it.age + 1L }
"#;
        with_engine(body, |engine, exprs| {
            let binding = engine.infer(exprs[1]);
            let next = binding.schema().unwrap().lookup("next").unwrap().clone();
            assert_eq!(next.ty, TypeRef::simple("Long"));
        });
    }

    #[test]
    fn test_should_add_columns_from_dsl_blocks() {
        let body = r#"
val df: DataFrame<Person> = load()
df.add {
    "next" from { it.age + 1L }
    "label" from "adult"
}
"#;
        with_engine(body, |engine, exprs| {
            // act
            let binding = engine.infer(exprs[1]);

            // assert
            assert_eq!(names(&binding), vec!["name", "age", "address", "next", "label"]);
            let schema = binding.schema().unwrap();
            assert_eq!(schema.lookup("next").unwrap().ty, TypeRef::simple("Long"));
            assert_eq!(schema.lookup("label").unwrap().ty, TypeRef::simple("String"));
        });
    }

    #[test]
    fn test_should_reject_dsl_columns_that_already_exist() {
        let body = r#"
val df: DataFrame<Person> = load()
df.add { "age" from { it.age * 2 } }
"#;
        with_engine(body, |engine, exprs| {
            // act
            let binding = engine.infer(exprs[1]);

            // assert
            assert_eq!(binding, SchemaBinding::Unknown);
            let failures: Vec<_> = engine.failures().collect();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].error, SchemaError::duplicate("age"));
            assert_eq!(failures[0].subject, "Person");
        });
    }

    #[test]
    fn test_should_name_the_joined_frame_when_its_key_is_missing() {
        let body = r#"
val people: DataFrame<Person> = load()
val orders: DataFrame<Order> = load()
people.join(orders, "name")
"#;
        with_engine(body, |engine, exprs| {
            // act
            let binding = engine.infer(exprs[2]);

            // assert
            assert_eq!(binding, SchemaBinding::Unknown);
            let failures: Vec<_> = engine.failures().collect();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].subject, "Order");
            assert!(matches!(
                &failures[0].error,
                SchemaError::UnknownColumn { name, candidates }
                    if name == "name" && candidates == &["id", "total"]
            ));
        });
    }

    #[test]
    fn test_should_infer_when_only_with_else_and_agreeing_branches() {
        let body = r#"
val df: DataFrame<Person> = load()
when { flag -> df.head(); else -> df }
when { flag -> df }
when (mode) { 1 -> df; else -> df.select("name") }
"#;
        with_engine(body, |engine, exprs| {
            assert_eq!(names(&engine.infer(exprs[1])), vec!["name", "age", "address"]);
            assert_eq!(engine.infer(exprs[2]), SchemaBinding::Unknown);
            assert_eq!(engine.infer(exprs[3]), SchemaBinding::Unknown);
        });
    }

    #[test]
    fn test_should_record_transform_failures_once() {
        let body = r#"
val df: DataFrame<Person> = load()
val bad = df.select("naem")
bad
bad
"#;
        with_engine(body, |engine, exprs| {
            // act
            for expr in &exprs {
                engine.infer(expr);
            }

            // assert
            let failures: Vec<_> = engine.failures().collect();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].span, exprs[1].span);
            assert!(matches!(
                &failures[0].error,
                SchemaError::UnknownColumn { name, .. } if name == "naem"
            ));
            assert_eq!(engine.infer(exprs[2]), SchemaBinding::Unknown);
        });
    }

    #[test]
    fn test_should_cast_frames_without_schema() {
        with_engine("val raw: AnyFrame = load()\nraw.cast<Person>()\nraw.head()", |engine, exprs| {
            let typed = engine.infer(exprs[1]);
            assert_eq!(typed.shape(), Some(Shape::DataFrame));
            assert_eq!(typed.origin(), Some("Person"));
            assert_eq!(engine.infer(exprs[2]), SchemaBinding::Unknown);
            assert_eq!(engine.failures().count(), 0);
        });
    }

    #[test]
    fn test_should_navigate_column_groups() {
        let body = "val df: DataFrame<Person> = load()\ndf.address\ndf[\"address\"]";
        with_engine(body, |engine, exprs| {
            let group = engine.infer(exprs[1]);
            assert_eq!(group.shape(), Some(Shape::ColumnGroup));
            assert_eq!(group.origin(), Some("Address"));
            assert_eq!(names(&group), vec!["city"]);
            assert!(engine.infer(exprs[2]).same_structure(&group));
        });
    }

    #[test]
    fn test_should_infer_literal_frames() {
        let body = "dataFrameOf(\"a\" to listOf(1, 2), \"b\" to listOf(\"x\", null))";
        with_engine(body, |engine, exprs| {
            let binding = engine.infer(exprs[0]);
            let schema = binding.schema().unwrap();
            assert_eq!(schema.lookup("a").unwrap().ty, TypeRef::simple("Int"));
            let b = schema.lookup("b").unwrap();
            assert_eq!(b.ty, TypeRef::simple("String"));
            assert!(b.nullable);
        });
    }

    #[test]
    fn test_should_report_conflicting_marker_overrides() {
        let source = r#"
@DataSchema
interface A {
    val x: Int
}

@DataSchema
interface B : A {
    val x: String
}
"#;
        let unit = parse_source(source).unwrap();
        let host = KotlinHost::new(&unit);
        let registry = OperationRegistry::standard();
        let mut engine = InferenceEngine::new(&host, &registry);

        let schema = engine.marker_schema("B").unwrap();

        assert_eq!(schema.lookup("x").unwrap().ty, TypeRef::simple("Int"));
        let failures: Vec<_> = engine.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error, SchemaError::duplicate("x"));
    }
}
