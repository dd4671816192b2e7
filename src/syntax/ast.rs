use crate::schema::TypeRef;

/// Half-open byte range into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Identity of an expression node within one source unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// Identity of a declaration (local, parameter, lambda parameter, top-level
/// property or function) within one source unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclId(pub u32);

#[derive(Debug, Clone, Default)]
pub struct SourceUnit {
    pub items: Vec<Item>,
    /// Statements and declarations outside the supported subset, skipped
    /// while parsing.
    pub skipped: Vec<Span>,
}

#[derive(Debug, Clone)]
pub enum Item {
    Class(ClassDecl),
    Function(FunDecl),
    Property(ValDecl),
}

#[derive(Debug, Clone)]
pub struct Annotation {
    pub name: String,
    pub args: Vec<Expr>,
    pub span: Span,
}

impl Annotation {
    pub fn string_arg(&self) -> Option<&str> {
        match self.args.first().map(|a| &a.kind) {
            Some(ExprKind::Literal(Literal::String(s))) => Some(s),
            _ => None,
        }
    }
}

pub fn find_annotation<'a>(annotations: &'a [Annotation], name: &str) -> Option<&'a Annotation> {
    annotations.iter().find(|a| a.name == name)
}

#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub annotations: Vec<Annotation>,
    pub is_interface: bool,
    pub name: String,
    pub name_span: Span,
    pub supertypes: Vec<TypeRef>,
    /// Primary-constructor parameters that are not properties.
    pub params: Vec<Param>,
    pub properties: Vec<PropertyDecl>,
    pub methods: Vec<FunDecl>,
    pub span: Span,
}

impl ClassDecl {
    pub fn has_annotation(&self, name: &str) -> bool {
        find_annotation(&self.annotations, name).is_some()
    }
}

/// Property member of a class or interface, including primary-constructor
/// `val`/`var` parameters.
#[derive(Debug, Clone)]
pub struct PropertyDecl {
    pub decl: DeclId,
    pub annotations: Vec<Annotation>,
    pub mutable: bool,
    pub name: String,
    pub name_span: Span,
    pub ty: Option<TypeRef>,
    /// Initializer, or the default value of a constructor property.
    pub init: Option<Expr>,
    pub getter: Option<FunBody>,
    pub in_constructor: bool,
    pub span: Span,
}

impl PropertyDecl {
    /// Computed properties (with a getter) hold no column.
    pub fn is_stored(&self) -> bool {
        self.getter.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub decl: DeclId,
    pub name: String,
    pub ty: Option<TypeRef>,
    pub default: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunDecl {
    pub decl: DeclId,
    pub name: String,
    pub receiver: Option<TypeRef>,
    pub params: Vec<Param>,
    pub return_type: Option<TypeRef>,
    pub body: Option<FunBody>,
    /// Getter of an extension property (`val DataFrame<M>.name get() = ...`).
    pub is_property: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum FunBody {
    Expr(Expr),
    Block(Block),
}

#[derive(Debug, Clone)]
pub struct ValDecl {
    pub decl: DeclId,
    pub mutable: bool,
    /// Receiver type of an extension property.
    pub receiver: Option<TypeRef>,
    pub name: String,
    pub name_span: Span,
    pub ty: Option<TypeRef>,
    pub init: Option<Expr>,
    pub getter: Option<FunBody>,
    pub span: Span,
}

impl ValDecl {
    /// Extension property as a function of its receiver, with the getter as body.
    pub fn into_getter_function(self) -> FunDecl {
        FunDecl {
            decl: self.decl,
            name: self.name,
            receiver: self.receiver,
            params: Vec::new(),
            return_type: self.ty,
            body: self.getter,
            is_property: true,
            span: self.span,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

impl Block {
    /// `"name" from value` statements when the block holds nothing else.
    pub fn column_froms(&self) -> Option<Vec<(&str, &Expr)>> {
        if self.stmts.is_empty() {
            return None;
        }
        self.stmts
            .iter()
            .map(|stmt| match stmt {
                Stmt::Expr(expr) => expr.column_from(),
                _ => None,
            })
            .collect()
    }

    /// Value of the block when used as an expression: its trailing expression.
    pub fn tail_expr(&self) -> Option<&Expr> {
        match self.stmts.last() {
            Some(Stmt::Expr(expr)) => Some(expr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Val(ValDecl),
    Expr(Expr),
    Assign { target: Expr, value: Expr, span: Span },
    Return { value: Option<Expr>, span: Span },
    Function(FunDecl),
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub id: ExprId,
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Long(i64),
    Float(f64),
    Double(f64),
    String(String),
    Char(char),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
    Elvis,
    Range,
    /// Named infix call such as `to`, `and`, `or`, `in`.
    Infix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub struct LambdaParam {
    pub decl: DeclId,
    pub name: String,
    pub ty: Option<TypeRef>,
}

/// One `conditions -> body` arm of a `when`; `else` arms have no conditions.
#[derive(Debug, Clone)]
pub struct WhenBranch {
    pub conditions: Vec<Expr>,
    pub is_else: bool,
    pub body: Expr,
}

#[derive(Debug, Clone)]
pub struct Lambda {
    /// Explicit parameters; empty means the implicit `it` (see `implicit_it`).
    pub params: Vec<LambdaParam>,
    pub implicit_it: DeclId,
    pub body: Block,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Name(String),
    This,
    Member {
        receiver: Box<Expr>,
        name: String,
        name_span: Span,
        safe: bool,
    },
    Call {
        callee: Box<Expr>,
        type_args: Vec<TypeRef>,
        /// Positional and named arguments; a trailing lambda is the last entry.
        args: Vec<Argument>,
    },
    Index {
        receiver: Box<Expr>,
        indices: Vec<Expr>,
    },
    Binary {
        op: BinaryOp,
        /// Function name for `BinaryOp::Infix`.
        infix: Option<String>,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    NotNull(Box<Expr>),
    Cast {
        expr: Box<Expr>,
        ty: TypeRef,
        safe: bool,
    },
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Option<Box<Expr>>,
    },
    When {
        subject: Option<Box<Expr>>,
        branches: Vec<WhenBranch>,
    },
    /// String with `$name` / `${expr}` templates; holds the embedded expressions.
    Template(Vec<Expr>),
    Block(Block),
    Lambda(Lambda),
}

impl Expr {
    /// `"name" from value` inside an `add { ... }` block.
    pub fn column_from(&self) -> Option<(&str, &Expr)> {
        match &self.kind {
            ExprKind::Binary {
                op: BinaryOp::Infix,
                infix: Some(infix),
                left,
                right,
            } if infix == "from" => Some((left.string_literal()?, &**right)),
            _ => None,
        }
    }

    pub fn string_literal(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Literal(Literal::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int_literal(&self) -> Option<i64> {
        match &self.kind {
            ExprKind::Literal(Literal::Int(i)) | ExprKind::Literal(Literal::Long(i)) => Some(*i),
            _ => None,
        }
    }

    /// Calls `f` on every direct child expression, in source order.
    pub fn for_each_child<'a>(&'a self, mut f: impl FnMut(&'a Expr)) {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Name(_) | ExprKind::This => {}
            ExprKind::Member { receiver, .. } => f(receiver),
            ExprKind::Call { callee, args, .. } => {
                f(callee);
                for arg in args {
                    f(&arg.value);
                }
            }
            ExprKind::Index { receiver, indices } => {
                f(receiver);
                for index in indices {
                    f(index);
                }
            }
            ExprKind::Binary { left, right, .. } => {
                f(left);
                f(right);
            }
            ExprKind::Unary { operand, .. } => f(operand),
            ExprKind::NotNull(inner) => f(inner),
            ExprKind::Cast { expr, .. } => f(expr),
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                f(condition);
                f(then_branch);
                if let Some(else_branch) = else_branch {
                    f(else_branch);
                }
            }
            ExprKind::When { subject, branches } => {
                if let Some(subject) = subject {
                    f(subject);
                }
                for branch in branches {
                    for condition in &branch.conditions {
                        f(condition);
                    }
                    f(&branch.body);
                }
            }
            ExprKind::Template(parts) => {
                for part in parts {
                    f(part);
                }
            }
            ExprKind::Block(block) => block.for_each_expr(&mut f),
            ExprKind::Lambda(lambda) => lambda.body.for_each_expr(&mut f),
        }
    }
}

impl Block {
    /// Calls `f` on the top-level expressions of each statement, in order.
    pub fn for_each_expr<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        for stmt in &self.stmts {
            stmt.for_each_expr(f);
        }
    }
}

impl Stmt {
    pub fn for_each_expr<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        match self {
            Stmt::Val(val) => {
                if let Some(init) = &val.init {
                    f(init);
                }
                if let Some(getter) = &val.getter {
                    getter.for_each_expr(f);
                }
            }
            Stmt::Expr(expr) => f(expr),
            Stmt::Assign { target, value, .. } => {
                f(target);
                f(value);
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    f(value);
                }
            }
            Stmt::Function(fun) => fun.for_each_expr(f),
        }
    }
}

impl FunDecl {
    pub fn for_each_expr<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        for default in self.params.iter().filter_map(|param| param.default.as_ref()) {
            f(default);
        }
        if let Some(body) = &self.body {
            body.for_each_expr(f);
        }
    }
}

impl FunBody {
    pub fn for_each_expr<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        match self {
            FunBody::Expr(expr) => f(expr),
            FunBody::Block(block) => block.for_each_expr(f),
        }
    }
}
