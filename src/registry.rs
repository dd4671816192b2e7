//! Catalog of recognized dataframe operations and their schema transforms.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::{InferenceError, SchemaError, TransformError};
use crate::host::CalleeDescriptor;
use crate::inference::{SchemaBinding, Shape};
use crate::schema::{ColumnDescriptor, ColumnKind, ColumnSchema, MergePolicy, TypeRef};

/// Name of the frame column holding each group's rows after `groupBy`.
pub const GROUP_COLUMN: &str = "group";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverKind {
    DataFrame,
    GroupBy,
    /// Call without a receiver: `dataFrameOf(...)`.
    TopLevel,
}

impl ReceiverKind {
    pub fn of(binding: &SchemaBinding) -> Option<Self> {
        match binding.shape()? {
            Shape::DataFrame => Some(Self::DataFrame),
            Shape::GroupBy => Some(Self::GroupBy),
            Shape::ColumnGroup | Shape::DataRow => None,
        }
    }
}

/// Accepted argument counts; a trailing lambda counts as an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Range(usize, usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Range(min, max) => (min..=max).contains(&count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSignature {
    pub receiver: ReceiverKind,
    pub name: &'static str,
    pub arity: Arity,
}

/// Closed set of schema transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Select,
    Distinct,
    Remove,
    Rename,
    Add,
    Update,
    Join,
    Concat,
    GroupBy,
    GroupCount,
    GroupToDataFrame,
    SortBy,
    DropNulls,
    /// Schema unchanged (`filter`, `head`, ...).
    Passthrough,
    /// Single row of the receiver (`first`, `last`).
    Row,
    Cast,
    EmptyDataFrame,
    DataFrameOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationRule {
    pub signature: OperationSignature,
    pub kind: OperationKind,
    pub output: Shape,
}

/// Statically evaluated call argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationArg {
    Text(String),
    Int(i64),
    /// `"name" to listOf(...)`, with the element type when known.
    Pair { name: String, ty: Option<TypeRef> },
    Frame(SchemaBinding),
    /// `add { "name" from value }` block: new column names with their value types.
    ColumnDsl(Vec<(String, Option<TypeRef>)>),
    /// Any other value; lambdas carry the type of their result.
    Value(Option<TypeRef>),
}

impl OperationArg {
    fn text(&self) -> Option<&str> {
        match self {
            OperationArg::Text(text) => Some(text),
            _ => None,
        }
    }

    fn value_type(&self) -> Option<TypeRef> {
        match self {
            OperationArg::Text(_) => Some(TypeRef::simple("String")),
            OperationArg::Int(_) => Some(TypeRef::simple("Int")),
            OperationArg::Value(ty) => ty.clone(),
            OperationArg::Pair { .. } | OperationArg::Frame(_) | OperationArg::ColumnDsl(_) => None,
        }
    }
}

/// Input of a transform: the receiver binding (unknown for top-level calls),
/// evaluated arguments and explicit type arguments resolved to markers.
#[derive(Debug, Clone)]
pub struct OperationCall {
    pub receiver: SchemaBinding,
    pub args: Vec<OperationArg>,
    pub type_args: Vec<SchemaBinding>,
}

impl OperationCall {
    fn receiver_schema(&self) -> Result<&Arc<ColumnSchema>, TransformError> {
        self.receiver.schema().ok_or(TransformError::NotApplicable)
    }

    /// All arguments as column names; declines on anything else.
    fn column_names(&self) -> Result<Vec<&str>, TransformError> {
        self.args
            .iter()
            .map(|arg| arg.text().ok_or(TransformError::NotApplicable))
            .collect()
    }

    fn marker_type_arg(&self) -> Result<SchemaBinding, TransformError> {
        match self.type_args.first() {
            Some(binding @ SchemaBinding::Known { .. }) => Ok(binding.clone()),
            _ => Err(TransformError::NotApplicable),
        }
    }
}

impl OperationRule {
    pub fn apply(&self, call: &OperationCall) -> Result<SchemaBinding, TransformError> {
        let schema = match self.kind {
            OperationKind::Select => {
                let names = call.column_names()?;
                call.receiver_schema()?.select(&names)?
            }
            OperationKind::Distinct => {
                let input = call.receiver_schema()?;
                if call.args.is_empty() {
                    input.as_ref().clone()
                } else {
                    input.select(&call.column_names()?)?
                }
            }
            OperationKind::Remove => {
                let names = call.column_names()?;
                let input = call.receiver_schema()?;
                let mut output = input.as_ref().clone();
                for name in names {
                    input.require(name)?;
                    output = output.without_column(name);
                }
                output
            }
            OperationKind::Rename => match call.args.as_slice() {
                [OperationArg::Text(old), OperationArg::Text(new)] => {
                    call.receiver_schema()?.rename(old, new)?
                }
                _ => return Err(TransformError::NotApplicable),
            },
            OperationKind::Add if matches!(call.args.as_slice(), [OperationArg::ColumnDsl(_)]) => {
                add_columns(call)?
            }
            OperationKind::Add => {
                let input = call.receiver_schema()?;
                let name = call
                    .args
                    .first()
                    .and_then(OperationArg::text)
                    .ok_or(TransformError::NotApplicable)?;
                if input.contains(name) {
                    return Err(SchemaError::duplicate(name).into());
                }
                let ty = call
                    .args
                    .get(1)
                    .and_then(OperationArg::value_type)
                    .unwrap_or_else(TypeRef::star);
                input.with_column(ColumnDescriptor::value(name, ty))
            }
            OperationKind::Update => {
                let input = call.receiver_schema()?;
                let name = call
                    .args
                    .first()
                    .and_then(OperationArg::text)
                    .ok_or(TransformError::NotApplicable)?;
                input.require(name)?;
                match call.args.get(1).and_then(OperationArg::value_type) {
                    Some(ty) => input.with_column(ColumnDescriptor::value(name, ty)),
                    None => input.as_ref().clone(),
                }
            }
            OperationKind::Join => join(call)?,
            OperationKind::Concat => concat(call)?,
            OperationKind::GroupBy => {
                let keys = call.column_names()?;
                let input = call.receiver_schema()?;
                let key_schema = input.select(&keys)?;
                let rest = keys
                    .iter()
                    .fold(input.as_ref().clone(), |rest, key| rest.without_column(key));
                let marker = call
                    .receiver
                    .origin()
                    .map(TypeRef::simple)
                    .unwrap_or_else(TypeRef::star);
                let group = ColumnDescriptor::frame(GROUP_COLUMN, marker, Some(Arc::new(rest)));
                let mut columns = key_schema.columns().to_vec();
                columns.push(group);
                ColumnSchema::new(columns)?
            }
            OperationKind::GroupCount => {
                let keys = call.receiver_schema()?.without_column(GROUP_COLUMN);
                if keys.contains("count") {
                    return Err(SchemaError::duplicate("count").into());
                }
                keys.with_column(ColumnDescriptor::value("count", TypeRef::simple("Int")))
            }
            OperationKind::GroupToDataFrame | OperationKind::Passthrough | OperationKind::Row => {
                call.receiver_schema()?.as_ref().clone()
            }
            OperationKind::SortBy => {
                let input = call.receiver_schema()?;
                // Selector lambdas are not validated; sorting never changes the schema.
                for name in call.args.iter().filter_map(OperationArg::text) {
                    input.require(name)?;
                }
                input.as_ref().clone()
            }
            OperationKind::DropNulls => {
                let names = call.column_names()?;
                let input = call.receiver_schema()?;
                for name in &names {
                    input.require(name)?;
                }
                input.map_columns(|column| {
                    if names.is_empty() || names.contains(&column.name.as_str()) {
                        column.clone().with_nullable(false)
                    } else {
                        column.clone()
                    }
                })
            }
            OperationKind::Cast | OperationKind::EmptyDataFrame => {
                return Ok(call.marker_type_arg()?.with_shape(self.output));
            }
            OperationKind::DataFrameOf => {
                let columns = call
                    .args
                    .iter()
                    .map(|arg| match arg {
                        OperationArg::Pair { name, ty } => Ok(ColumnDescriptor::value(
                            name,
                            ty.clone().unwrap_or_else(TypeRef::star),
                        )),
                        _ => Err(TransformError::NotApplicable),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                ColumnSchema::new(columns)?
            }
        };
        Ok(SchemaBinding::known(self.output, Arc::new(schema), None))
    }
}

/// Every `"name" from value` of the block becomes a column after the
/// receiver's columns; untyped values get the star type.
fn add_columns(call: &OperationCall) -> Result<ColumnSchema, TransformError> {
    let [OperationArg::ColumnDsl(columns)] = call.args.as_slice() else {
        return Err(TransformError::NotApplicable);
    };
    let mut output = call.receiver_schema()?.as_ref().clone();
    for (name, ty) in columns {
        if output.contains(name) {
            return Err(SchemaError::duplicate(name).into());
        }
        let ty = ty.clone().unwrap_or_else(TypeRef::star);
        output = output.with_column(ColumnDescriptor::value(name, ty));
    }
    Ok(output)
}

fn join(call: &OperationCall) -> Result<ColumnSchema, TransformError> {
    let left = call.receiver_schema()?;
    let (right_binding, right) = match call.args.first() {
        Some(OperationArg::Frame(binding)) => {
            (binding, binding.schema().ok_or(TransformError::NotApplicable)?)
        }
        _ => return Err(TransformError::NotApplicable),
    };
    let keys: Vec<&str> = if call.args.len() == 1 {
        let common: Vec<&str> = left.names().filter(|name| right.contains(name)).collect();
        if common.is_empty() {
            return Err(SchemaError::Invalid(format!(
                "Cannot join {} with {}: no columns in common",
                call.receiver.describe(),
                right_binding.describe(),
            ))
            .into());
        }
        common
    } else {
        call.args[1..]
            .iter()
            .map(|arg| arg.text().ok_or(TransformError::NotApplicable))
            .collect::<Result<_, _>>()?
    };
    for key in &keys {
        left.require(key)?;
        right
            .require(key)
            .map_err(|error| TransformError::Operand {
                subject: right_binding.describe(),
                error,
            })?;
    }
    let right_keys = right.select(&keys)?;
    let right_rest = keys
        .iter()
        .fold(right.as_ref().clone(), |rest, key| rest.without_column(key));
    Ok(left
        .merge(&right_keys, MergePolicy::Overwrite)?
        .merge(&right_rest, MergePolicy::Error)?)
}

fn concat(call: &OperationCall) -> Result<ColumnSchema, TransformError> {
    let left = call.receiver_schema()?;
    let right = match call.args.as_slice() {
        [OperationArg::Frame(binding)] => binding.schema().ok_or(TransformError::NotApplicable)?,
        _ => return Err(TransformError::NotApplicable),
    };
    for column in left.columns() {
        if let Some(other) = right.lookup(&column.name) {
            if column.kind != other.kind || column.ty != other.ty {
                return Err(SchemaError::Invalid(format!(
                    "Cannot concat column '{}': {} is incompatible with {}",
                    column.name,
                    column.display_type(),
                    other.display_type()
                ))
                .into());
            }
        }
    }
    let widened = left.map_columns(|column| {
        let nullable = match right.lookup(&column.name) {
            Some(other) => column.nullable || other.nullable,
            None => column.kind == ColumnKind::Value || column.nullable,
        };
        column.clone().with_nullable(nullable)
    });
    let extra = right.map_columns(|column| {
        let nullable = column.nullable || column.kind == ColumnKind::Value;
        column.clone().with_nullable(nullable)
    });
    Ok(widened.merge(&extra, MergePolicy::Keep)?)
}

/// Registered operation rules, indexed by receiver kind and name. Built once,
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    rules: Vec<OperationRule>,
    by_name: HashMap<ReceiverKind, HashMap<&'static str, Vec<usize>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in dataframe operation.
    pub fn standard() -> Self {
        use Arity::*;
        use OperationKind as K;
        use ReceiverKind::{DataFrame as Df, GroupBy as Gb, TopLevel as Top};

        let mut registry = Self::new();
        let frame = Shape::DataFrame;
        for (receiver, name, arity, kind, output) in [
            (Df, "select", AtLeast(1), K::Select, frame),
            (Df, "distinct", AtLeast(0), K::Distinct, frame),
            (Df, "remove", AtLeast(1), K::Remove, frame),
            (Df, "rename", Exact(2), K::Rename, frame),
            (Df, "add", Range(1, 2), K::Add, frame),
            (Df, "update", Range(1, 2), K::Update, frame),
            (Df, "join", AtLeast(1), K::Join, frame),
            (Df, "concat", Exact(1), K::Concat, frame),
            (Df, "groupBy", AtLeast(1), K::GroupBy, Shape::GroupBy),
            (Gb, "count", Exact(0), K::GroupCount, frame),
            (Gb, "toDataFrame", Exact(0), K::GroupToDataFrame, frame),
            (Df, "sortBy", AtLeast(1), K::SortBy, frame),
            (Df, "sortByDesc", AtLeast(1), K::SortBy, frame),
            (Df, "dropNulls", AtLeast(0), K::DropNulls, frame),
            (Df, "filter", Exact(1), K::Passthrough, frame),
            (Df, "head", Range(0, 1), K::Passthrough, frame),
            (Df, "tail", Range(0, 1), K::Passthrough, frame),
            (Df, "take", Exact(1), K::Passthrough, frame),
            (Df, "drop", Exact(1), K::Passthrough, frame),
            (Df, "shuffle", Exact(0), K::Passthrough, frame),
            (Df, "first", Range(0, 1), K::Row, Shape::DataRow),
            (Df, "last", Range(0, 1), K::Row, Shape::DataRow),
            (Df, "cast", Exact(0), K::Cast, frame),
            (Top, "emptyDataFrame", Exact(0), K::EmptyDataFrame, frame),
            (Top, "dataFrameOf", AtLeast(1), K::DataFrameOf, frame),
        ] {
            registry.register(
                OperationSignature {
                    receiver,
                    name,
                    arity,
                },
                kind,
                output,
            );
        }
        registry
    }

    pub fn register(&mut self, signature: OperationSignature, kind: OperationKind, output: Shape) {
        self.by_name
            .entry(signature.receiver)
            .or_default()
            .entry(signature.name)
            .or_default()
            .push(self.rules.len());
        self.rules.push(OperationRule {
            signature,
            kind,
            output,
        });
    }

    /// Rule for a call shape. One arity match wins; with none, a name that has
    /// a single rule still matches and its transform decides. Anything else is
    /// unrecognized.
    pub fn lookup(
        &self,
        receiver: ReceiverKind,
        name: &str,
        arg_count: usize,
    ) -> Result<&OperationRule, InferenceError> {
        let candidates = self
            .by_name
            .get(&receiver)
            .and_then(|rules| rules.get(name))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut accepting = candidates
            .iter()
            .map(|&index| &self.rules[index])
            .filter(|rule| rule.signature.arity.accepts(arg_count));
        let rule = match (accepting.next(), accepting.next()) {
            (Some(rule), None) => Some(rule),
            (None, _) if candidates.len() == 1 => Some(&self.rules[candidates[0]]),
            _ => None,
        };
        trace!(?receiver, name, arg_count, matched = ?rule.map(|r| r.kind), "operation lookup");
        rule.ok_or_else(|| InferenceError::Unrecognized(name.to_string()))
    }

    /// Lookup for a host-resolved callee; user-declared functions never match.
    pub fn lookup_call(
        &self,
        receiver: ReceiverKind,
        callee: &CalleeDescriptor,
    ) -> Result<&OperationRule, InferenceError> {
        if callee.user_defined {
            return Err(InferenceError::Unrecognized(callee.name.clone()));
        }
        self.lookup(receiver, &callee.name, callee.arg_count)
    }
}
