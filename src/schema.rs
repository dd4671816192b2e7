use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::SchemaError;

/// Simple names of the numeric types, ordered by widening.
const NUMERIC_TYPES: &[&str] = &["Byte", "Short", "Int", "Long", "Float", "Double"];

/// A host type as the checker sees it: a (possibly qualified) name, type
/// arguments and nullability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TypeRef {
    pub name: String,
    pub args: Vec<TypeRef>,
    pub nullable: bool,
}

impl TypeRef {
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            nullable: false,
        }
    }

    pub fn generic(name: impl Into<String>, args: Vec<TypeRef>) -> Self {
        Self {
            name: name.into(),
            args,
            nullable: false,
        }
    }

    /// Star projection; stands for a type that is not statically known.
    pub fn star() -> Self {
        Self::simple("*")
    }

    pub fn is_star(&self) -> bool {
        self.name == "*"
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn non_null(&self) -> Self {
        self.clone().with_nullable(false)
    }

    /// Last segment of a dotted name: `kotlin.String` -> `String`.
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn is_numeric(&self) -> bool {
        NUMERIC_TYPES.contains(&self.simple_name())
    }

    pub fn arg(&self, index: usize) -> Option<&TypeRef> {
        self.args.get(index)
    }

    /// Widest of two numeric types, `None` when either is not numeric.
    pub fn widen_numeric(&self, other: &TypeRef) -> Option<TypeRef> {
        let a = NUMERIC_TYPES.iter().position(|n| *n == self.simple_name())?;
        let b = NUMERIC_TYPES.iter().position(|n| *n == other.simple_name())?;
        // Kotlin arithmetic on Byte/Short yields Int.
        let widest = a.max(b).max(2);
        Some(TypeRef::simple(NUMERIC_TYPES[widest]))
    }

    /// Whether a value of type `self` may be stored where `expected` is required.
    /// Unknown (star) types on either side are always accepted.
    pub fn is_assignable_to(&self, expected: &TypeRef) -> bool {
        if self.is_star() || expected.is_star() {
            return true;
        }
        if self.nullable && !expected.nullable {
            return false;
        }
        let expected_name = expected.simple_name();
        match expected_name {
            "Any" => true,
            "Number" => self.is_numeric(),
            "Comparable" => self.is_numeric() || matches!(self.simple_name(), "String" | "Char"),
            _ => {
                expected_name == self.simple_name()
                    && (expected.args.is_empty()
                        || self.args.is_empty()
                        || expected.args.len() == self.args.len()
                            && self
                                .args
                                .iter()
                                .zip(&expected.args)
                                .all(|(a, e)| a.is_assignable_to(e)))
            }
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.simple_name())?;
        if !self.args.is_empty() {
            write!(f, "<")?;
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ">")?;
        }
        if self.nullable {
            write!(f, "?")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ColumnKind {
    Value,
    Group,
    Frame,
}

/// One column of a schema. `ty` is stored without nullability; for group and
/// frame columns it names the marker type of the nested rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDescriptor {
    pub name: String,
    pub kind: ColumnKind,
    pub ty: TypeRef,
    pub nullable: bool,
    pub children: Option<Arc<ColumnSchema>>,
}

impl ColumnDescriptor {
    pub fn value(name: impl Into<String>, ty: TypeRef) -> Self {
        let nullable = ty.nullable;
        Self {
            name: name.into(),
            kind: ColumnKind::Value,
            ty: ty.with_nullable(false),
            nullable,
            children: None,
        }
    }

    pub fn group(name: impl Into<String>, marker: TypeRef, children: Arc<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Group,
            ty: marker.with_nullable(false),
            nullable: false,
            children: Some(children),
        }
    }

    pub fn frame(
        name: impl Into<String>,
        marker: TypeRef,
        children: Option<Arc<ColumnSchema>>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Frame,
            ty: marker.with_nullable(false),
            nullable: false,
            children,
        }
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Type of a single cell of this column.
    pub fn value_type(&self) -> TypeRef {
        match self.kind {
            ColumnKind::Value => self.ty.clone().with_nullable(self.nullable),
            ColumnKind::Group => TypeRef::generic("DataRow", vec![self.ty.clone()]),
            ColumnKind::Frame => TypeRef::generic("DataFrame", vec![self.ty.clone()]),
        }
    }

    pub fn display_type(&self) -> String {
        match self.kind {
            ColumnKind::Value => self.value_type().to_string(),
            ColumnKind::Group => format!("ColumnGroup<{}>", self.ty),
            ColumnKind::Frame => format!("DataFrame<{}>", self.ty),
        }
    }
}

/// How `merge` resolves a column present on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    Keep,
    Overwrite,
    Error,
}

/// Ordered set of uniquely named columns. Every operation returns a new schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ColumnSchema {
    columns: Vec<ColumnDescriptor>,
}

impl ColumnSchema {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Result<Self, SchemaError> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(SchemaError::duplicate(&column.name));
            }
        }
        Ok(Self { columns })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn lookup(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn require(&self, name: &str) -> Result<&ColumnDescriptor, SchemaError> {
        self.lookup(name)
            .ok_or_else(|| SchemaError::unknown(name, self.names()))
    }

    /// Replaces a column of the same name in place, or appends.
    pub fn with_column(&self, added: ColumnDescriptor) -> Self {
        let mut columns = self.columns.clone();
        match columns.iter().position(|c| c.name == added.name) {
            Some(index) => columns[index] = added,
            None => columns.push(added),
        }
        Self { columns }
    }

    pub fn without_column(&self, name: &str) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .filter(|c| c.name != name)
                .cloned()
                .collect(),
        }
    }

    /// Keeps the named columns, in schema order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, SchemaError> {
        for name in names {
            self.require(name.as_ref())?;
        }
        Ok(Self {
            columns: self
                .columns
                .iter()
                .filter(|c| names.iter().any(|n| n.as_ref() == c.name))
                .cloned()
                .collect(),
        })
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<Self, SchemaError> {
        self.require(old)?;
        if old != new && self.contains(new) {
            return Err(SchemaError::duplicate(new));
        }
        Ok(Self {
            columns: self
                .columns
                .iter()
                .map(|c| if c.name == old { c.renamed(new) } else { c.clone() })
                .collect(),
        })
    }

    /// Appends `other`'s columns; shared names are resolved by `policy`.
    pub fn merge(&self, other: &ColumnSchema, policy: MergePolicy) -> Result<Self, SchemaError> {
        let mut columns = self.columns.clone();
        for column in &other.columns {
            match columns.iter().position(|c| c.name == column.name) {
                None => columns.push(column.clone()),
                Some(index) => match policy {
                    MergePolicy::Keep => {}
                    MergePolicy::Overwrite => columns[index] = column.clone(),
                    MergePolicy::Error => return Err(SchemaError::duplicate(&column.name)),
                },
            }
        }
        Ok(Self { columns })
    }

    pub fn map_columns(&self, f: impl Fn(&ColumnDescriptor) -> ColumnDescriptor) -> Self {
        Self {
            columns: self.columns.iter().map(f).collect(),
        }
    }
}

impl fmt::Display for ColumnSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", column.name, column.display_type())?;
        }
        write!(f, "}}")
    }
}
