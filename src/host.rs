//! Host interface consumed by the analyzer, and the built-in Kotlin host that
//! implements it on top of [`crate::syntax`].

use std::collections::HashMap;

use crate::schema::TypeRef;
use crate::syntax::ast::*;

/// Annotation that marks an interface or class as a column schema.
pub const DATA_SCHEMA_ANNOTATION: &str = "DataSchema";
/// Annotation that overrides the column name of a marker property.
pub const COLUMN_NAME_ANNOTATION: &str = "ColumnName";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclarationKind {
    Local,
    Param,
    /// Parameter `index` of the lambda expression `lambda` (implicit `it` is 0).
    LambdaParam { lambda: ExprId, index: usize },
    /// Class property, visible in initializers and methods of its class.
    Member,
    TopLevel,
}

#[derive(Debug, Clone)]
pub struct Declaration {
    pub id: DeclId,
    pub name: String,
    /// Explicitly written type, if any.
    pub ty: Option<TypeRef>,
    pub init: Option<ExprId>,
    pub mutable: bool,
    pub reassigned: bool,
    pub kind: DeclarationKind,
}

impl Declaration {
    /// Whether the value is fixed to its initializer for the whole scope.
    pub fn is_stable(&self) -> bool {
        !self.reassigned
    }
}

/// Resolved callee of a call expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CalleeDescriptor {
    pub name: String,
    /// Receiver expression for `recv.name(...)`; `None` for top-level calls.
    pub receiver: Option<ExprId>,
    /// Argument count, trailing lambda included.
    pub arg_count: usize,
    pub type_args: Vec<TypeRef>,
    /// The call targets a function declared in the analyzed source.
    pub user_defined: bool,
}

/// What the analyzer needs from a compiler front-end. The analyzer never
/// mutates the tree it is given.
pub trait HostContext {
    /// Statically known type of an expression, as the host sees it.
    fn resolve_type(&self, expr: &Expr) -> Option<TypeRef>;

    /// Type the context expects at `expr`, e.g. the declared type of the
    /// `val` it initializes.
    fn declared_type(&self, expr: &Expr) -> Option<TypeRef>;

    fn resolve_call(&self, expr: &Expr) -> Option<CalleeDescriptor>;

    /// Declaration a name expression refers to.
    fn declaration(&self, expr: &Expr) -> Option<&Declaration>;

    /// `@DataSchema` marker declaration by simple name.
    fn marker(&self, name: &str) -> Option<&ClassDecl>;

    /// Extension property declared in the analyzed source, as its getter.
    fn extension_property(&self, name: &str) -> Option<&FunDecl>;

    fn expr(&self, id: ExprId) -> Option<&Expr>;

    /// Call expression a lambda is passed to.
    fn lambda_call(&self, lambda: ExprId) -> Option<ExprId>;
}

/// Lexically scoped resolver over one parsed source unit.
pub struct KotlinHost<'u> {
    exprs: HashMap<ExprId, &'u Expr>,
    declarations: HashMap<DeclId, Declaration>,
    references: HashMap<ExprId, DeclId>,
    markers: HashMap<String, &'u ClassDecl>,
    functions: HashMap<String, &'u FunDecl>,
    extension_properties: HashMap<String, &'u FunDecl>,
    lambda_calls: HashMap<ExprId, ExprId>,
    expected_types: HashMap<ExprId, TypeRef>,
    this_types: HashMap<ExprId, TypeRef>,
    scopes: Vec<HashMap<String, DeclId>>,
    this_stack: Vec<Option<TypeRef>>,
}

impl<'u> KotlinHost<'u> {
    pub fn new(unit: &'u SourceUnit) -> Self {
        let mut host = Self {
            exprs: HashMap::new(),
            declarations: HashMap::new(),
            references: HashMap::new(),
            markers: HashMap::new(),
            functions: HashMap::new(),
            extension_properties: HashMap::new(),
            lambda_calls: HashMap::new(),
            expected_types: HashMap::new(),
            this_types: HashMap::new(),
            scopes: Vec::new(),
            this_stack: Vec::new(),
        };
        host.walk_unit(unit);
        host
    }

    // ── resolution pass ────────────────────────────────────────────────────

    fn walk_unit(&mut self, unit: &'u SourceUnit) {
        self.scopes.push(HashMap::new());
        for item in &unit.items {
            match item {
                Item::Class(class) => {
                    if class.has_annotation(DATA_SCHEMA_ANNOTATION) {
                        self.markers.entry(class.name.clone()).or_insert(class);
                    }
                    for getter in class.methods.iter().filter(|method| method.is_property) {
                        self.register_function(getter);
                    }
                }
                Item::Function(fun) => self.register_function(fun),
                Item::Property(val) => self.declare_val(val, DeclarationKind::TopLevel),
            }
        }
        for item in &unit.items {
            match item {
                Item::Class(class) => self.walk_class(class),
                Item::Function(fun) => self.walk_function(fun, fun.receiver.clone()),
                Item::Property(val) => self.walk_val_body(val),
            }
        }
        self.scopes.pop();
    }

    fn register_function(&mut self, fun: &'u FunDecl) {
        let table = if fun.is_property {
            &mut self.extension_properties
        } else {
            &mut self.functions
        };
        table.entry(fun.name.clone()).or_insert(fun);
    }

    /// Properties are in scope for the whole class body; plain constructor
    /// parameters only for initializers.
    fn walk_class(&mut self, class: &'u ClassDecl) {
        let this_type = TypeRef::simple(class.name.clone());
        self.scopes.push(HashMap::new());
        self.this_stack.push(Some(this_type.clone()));
        for property in &class.properties {
            self.declare(Declaration {
                id: property.decl,
                name: property.name.clone(),
                ty: property.ty.clone(),
                init: property
                    .init
                    .as_ref()
                    .filter(|_| !property.in_constructor)
                    .map(|init| init.id),
                mutable: property.mutable,
                reassigned: false,
                kind: DeclarationKind::Member,
            });
        }

        self.scopes.push(HashMap::new());
        for param in &class.params {
            self.walk_param(param);
        }
        for property in &class.properties {
            if let Some(init) = &property.init {
                self.walk_typed_expr(init, property.ty.as_ref());
            }
            if let Some(getter) = &property.getter {
                self.walk_body(getter, property.ty.as_ref());
            }
        }
        self.scopes.pop();

        for method in &class.methods {
            let this = method.receiver.clone().unwrap_or_else(|| this_type.clone());
            self.walk_function(method, Some(this));
        }
        self.this_stack.pop();
        self.scopes.pop();
    }

    /// Walks `expr`, recording `ty` as the type its context expects.
    fn walk_typed_expr(&mut self, expr: &'u Expr, ty: Option<&TypeRef>) {
        if let Some(ty) = ty {
            self.expected_types.insert(expr.id, ty.clone());
        }
        self.walk_expr(expr);
    }

    fn walk_body(&mut self, body: &'u FunBody, return_type: Option<&TypeRef>) {
        match body {
            FunBody::Expr(expr) => self.walk_typed_expr(expr, return_type),
            FunBody::Block(block) => self.walk_block(block),
        }
    }

    /// Initializer and getter of a property; the property itself is declared
    /// by the caller.
    fn walk_val_body(&mut self, val: &'u ValDecl) {
        if let Some(init) = &val.init {
            self.walk_typed_expr(init, val.ty.as_ref());
        }
        if let Some(getter) = &val.getter {
            self.walk_body(getter, val.ty.as_ref());
        }
    }

    /// Walks the default value, then declares the parameter.
    fn walk_param(&mut self, param: &'u Param) {
        if let Some(default) = &param.default {
            self.walk_typed_expr(default, param.ty.as_ref());
        }
        self.declare(Declaration {
            id: param.decl,
            name: param.name.clone(),
            ty: param.ty.clone(),
            init: None,
            mutable: false,
            reassigned: false,
            kind: DeclarationKind::Param,
        });
    }

    fn declare(&mut self, declaration: Declaration) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(declaration.name.clone(), declaration.id);
        }
        self.declarations.insert(declaration.id, declaration);
    }

    fn declare_val(&mut self, val: &'u ValDecl, kind: DeclarationKind) {
        self.declare(Declaration {
            id: val.decl,
            name: val.name.clone(),
            ty: val.ty.clone(),
            init: val.init.as_ref().map(|init| init.id),
            mutable: val.mutable,
            reassigned: false,
            kind,
        });
    }

    fn lookup(&self, name: &str) -> Option<DeclId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn walk_function(&mut self, fun: &'u FunDecl, this_type: Option<TypeRef>) {
        self.scopes.push(HashMap::new());
        self.this_stack.push(this_type);
        for param in &fun.params {
            self.walk_param(param);
        }
        if let Some(body) = &fun.body {
            self.walk_body(body, fun.return_type.as_ref());
        }
        self.this_stack.pop();
        self.scopes.pop();
    }

    fn walk_block(&mut self, block: &'u Block) {
        self.scopes.push(HashMap::new());
        for stmt in &block.stmts {
            self.walk_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn walk_stmt(&mut self, stmt: &'u Stmt) {
        match stmt {
            Stmt::Val(val) => {
                // The initializer sees the enclosing binding, not the new one.
                self.walk_val_body(val);
                self.declare_val(val, DeclarationKind::Local);
            }
            Stmt::Expr(expr) => self.walk_expr(expr),
            Stmt::Assign { target, value, .. } => {
                self.walk_expr(target);
                self.walk_expr(value);
                if let Some(decl) = self.references.get(&target.id).copied() {
                    if let Some(declaration) = self.declarations.get_mut(&decl) {
                        declaration.reassigned = true;
                    }
                }
            }
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.walk_expr(value);
                }
            }
            Stmt::Function(fun) => {
                self.register_function(fun);
                self.walk_function(fun, fun.receiver.clone());
            }
        }
    }

    fn walk_expr(&mut self, expr: &'u Expr) {
        self.exprs.insert(expr.id, expr);
        match &expr.kind {
            ExprKind::Name(name) => {
                if let Some(decl) = self.lookup(name) {
                    self.references.insert(expr.id, decl);
                }
            }
            ExprKind::This => {
                if let Some(Some(ty)) = self.this_stack.last() {
                    self.this_types.insert(expr.id, ty.clone());
                }
            }
            ExprKind::Call { callee, args, .. } => {
                match &callee.kind {
                    // Function names live in their own namespace.
                    ExprKind::Name(_) => {
                        self.exprs.insert(callee.id, callee);
                    }
                    _ => self.walk_expr(callee),
                }
                for arg in args {
                    if let ExprKind::Lambda(lambda) = &arg.value.kind {
                        self.lambda_calls.insert(arg.value.id, expr.id);
                        // Row lambdas of `"name" from { ... }` belong to the call.
                        for (_, value) in lambda.body.column_froms().unwrap_or_default() {
                            if matches!(value.kind, ExprKind::Lambda(_)) {
                                self.lambda_calls.insert(value.id, expr.id);
                            }
                        }
                    }
                    self.walk_expr(&arg.value);
                }
            }
            ExprKind::Lambda(lambda) => {
                self.scopes.push(HashMap::new());
                if lambda.params.is_empty() {
                    self.declare(Declaration {
                        id: lambda.implicit_it,
                        name: "it".to_string(),
                        ty: None,
                        init: None,
                        mutable: false,
                        reassigned: false,
                        kind: DeclarationKind::LambdaParam {
                            lambda: expr.id,
                            index: 0,
                        },
                    });
                }
                for (index, param) in lambda.params.iter().enumerate() {
                    self.declare(Declaration {
                        id: param.decl,
                        name: param.name.clone(),
                        ty: param.ty.clone(),
                        init: None,
                        mutable: false,
                        reassigned: false,
                        kind: DeclarationKind::LambdaParam {
                            lambda: expr.id,
                            index,
                        },
                    });
                }
                self.walk_block(&lambda.body);
                self.scopes.pop();
            }
            ExprKind::Block(block) => self.walk_block(block),
            _ => expr.for_each_child(|child| self.walk_expr(child)),
        }
    }
}

fn literal_type(literal: &Literal) -> TypeRef {
    match literal {
        Literal::Int(_) => TypeRef::simple("Int"),
        Literal::Long(_) => TypeRef::simple("Long"),
        Literal::Float(_) => TypeRef::simple("Float"),
        Literal::Double(_) => TypeRef::simple("Double"),
        Literal::String(_) => TypeRef::simple("String"),
        Literal::Char(_) => TypeRef::simple("Char"),
        Literal::Bool(_) => TypeRef::simple("Boolean"),
        Literal::Null => TypeRef::simple("Nothing").with_nullable(true),
    }
}

impl HostContext for KotlinHost<'_> {
    fn resolve_type(&self, expr: &Expr) -> Option<TypeRef> {
        match &expr.kind {
            ExprKind::Literal(literal) => Some(literal_type(literal)),
            ExprKind::Template(_) => Some(TypeRef::simple("String")),
            ExprKind::Name(_) => self.declaration(expr).and_then(|d| d.ty.clone()),
            ExprKind::Member { name, .. } => self
                .extension_properties
                .get(name)
                .and_then(|getter| getter.return_type.clone()),
            ExprKind::This => self.this_types.get(&expr.id).cloned(),
            ExprKind::Cast { ty, safe, .. } => Some(ty.clone().with_nullable(ty.nullable || *safe)),
            ExprKind::Call { callee, .. } => match &callee.kind {
                ExprKind::Name(name) => self
                    .functions
                    .get(name)
                    .filter(|fun| fun.receiver.is_none())
                    .and_then(|fun| fun.return_type.clone()),
                ExprKind::Member { name, .. } => self
                    .functions
                    .get(name)
                    .filter(|fun| fun.receiver.is_some())
                    .and_then(|fun| fun.return_type.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn declared_type(&self, expr: &Expr) -> Option<TypeRef> {
        self.expected_types.get(&expr.id).cloned()
    }

    fn resolve_call(&self, expr: &Expr) -> Option<CalleeDescriptor> {
        let ExprKind::Call {
            callee,
            type_args,
            args,
        } = &expr.kind
        else {
            return None;
        };
        let (name, receiver, user_defined) = match &callee.kind {
            ExprKind::Name(name) => (name, None, self.functions.contains_key(name)),
            ExprKind::Member { receiver, name, .. } => (
                name,
                Some(receiver.id),
                self.functions
                    .get(name)
                    .is_some_and(|fun| fun.receiver.is_some()),
            ),
            _ => return None,
        };
        Some(CalleeDescriptor {
            name: name.clone(),
            receiver,
            arg_count: args.len(),
            type_args: type_args.clone(),
            user_defined,
        })
    }

    fn declaration(&self, expr: &Expr) -> Option<&Declaration> {
        self.references
            .get(&expr.id)
            .and_then(|decl| self.declarations.get(decl))
    }

    fn marker(&self, name: &str) -> Option<&ClassDecl> {
        self.markers.get(name).copied()
    }

    fn extension_property(&self, name: &str) -> Option<&FunDecl> {
        self.extension_properties.get(name).copied()
    }

    fn expr(&self, id: ExprId) -> Option<&Expr> {
        self.exprs.get(&id).copied()
    }

    fn lambda_call(&self, lambda: ExprId) -> Option<ExprId> {
        self.lambda_calls.get(&lambda).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::parse_source;

    fn main_body(unit: &SourceUnit) -> &Block {
        unit.items
            .iter()
            .find_map(|item| match item {
                Item::Function(fun) if fun.name == "main" => match &fun.body {
                    Some(FunBody::Block(block)) => Some(block),
                    _ => None,
                },
                _ => None,
            })
            .expect("main function")
    }

    fn stmt_expr(block: &Block, index: usize) -> &Expr {
        match &block.stmts[index] {
            Stmt::Expr(expr) => expr,
            Stmt::Val(val) => val.init.as_ref().expect("initializer"),
            Stmt::Assign { value, .. } => value,
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn test_should_resolve_declared_types_and_markers() {
        // arrange
        let source = r#"
@DataSchema
interface Person {
    val name: String
}

fun load(): DataFrame<Person> = TODO()

fun main() {
    val df: DataFrame<Person> = load()
    df
    load()
}
"#;
        let unit = parse_source(source).unwrap();

        // act
        let host = KotlinHost::new(&unit);
        let body = main_body(&unit);

        // assert
        assert!(host.marker("Person").is_some());
        let expected = TypeRef::generic("DataFrame", vec![TypeRef::simple("Person")]);
        assert_eq!(host.resolve_type(stmt_expr(body, 1)), Some(expected.clone()));
        assert_eq!(host.resolve_type(stmt_expr(body, 2)), Some(expected.clone()));
        assert_eq!(host.declared_type(stmt_expr(body, 0)), Some(expected));
    }

    #[test]
    fn test_should_track_reassignment() {
        let source = "fun main() {\n    var df = a\n    df = b\n    df\n}\n";
        let unit = parse_source(source).unwrap();
        let host = KotlinHost::new(&unit);
        let body = main_body(&unit);

        let declaration = host.declaration(stmt_expr(body, 2)).expect("declaration");
        assert_eq!(declaration.name, "df");
        assert!(declaration.reassigned);
        assert!(!declaration.is_stable());
    }

    #[test]
    fn test_should_map_lambdas_to_calls_and_implicit_it() {
        // arrange
        let source = "fun main() {\n    df.filter { it.age > 1 }\n}\n";
        let unit = parse_source(source).unwrap();

        // act
        let host = KotlinHost::new(&unit);
        let call = stmt_expr(main_body(&unit), 0);

        // assert
        let callee = host.resolve_call(call).expect("callee");
        assert_eq!(callee.name, "filter");
        assert_eq!(callee.arg_count, 1);
        assert!(!callee.user_defined);
        let ExprKind::Call { args, .. } = &call.kind else {
            panic!("Expected call");
        };
        let lambda = &args[0].value;
        assert_eq!(host.lambda_call(lambda.id), Some(call.id));
        let ExprKind::Lambda(body) = &lambda.kind else {
            panic!("Expected lambda");
        };
        let Some(ExprKind::Binary { left, .. }) = body.body.tail_expr().map(|e| &e.kind) else {
            panic!("Expected comparison");
        };
        let ExprKind::Member { receiver, .. } = &left.kind else {
            panic!("Expected member");
        };
        let it = host.declaration(receiver).expect("it");
        assert_eq!(
            it.kind,
            DeclarationKind::LambdaParam {
                lambda: lambda.id,
                index: 0
            }
        );
    }

    #[test]
    fn test_should_resolve_class_properties_inside_initializers_and_methods() {
        // arrange
        let source = r#"
class Report(val people: DataFrame<Person>, limit: Int = 10) {
    val adults = people.filter { it.age > 17 }

    fun show() {
        adults
    }
}
"#;
        let unit = parse_source(source).unwrap();
        let Some(Item::Class(class)) = unit.items.first() else {
            panic!("Expected class");
        };

        // act
        let host = KotlinHost::new(&unit);

        // assert
        let init = class.properties[1].init.as_ref().expect("initializer");
        let ExprKind::Call { callee, .. } = &init.kind else {
            panic!("Expected call");
        };
        let ExprKind::Member { receiver, .. } = &callee.kind else {
            panic!("Expected member callee");
        };
        let people = host.declaration(receiver).expect("people");
        assert_eq!(people.kind, DeclarationKind::Member);
        assert_eq!(people.init, None);
        assert_eq!(
            host.resolve_type(receiver),
            Some(TypeRef::generic("DataFrame", vec![TypeRef::simple("Person")]))
        );
        let Some(FunBody::Block(body)) = &class.methods[0].body else {
            panic!("Expected method body");
        };
        let adults = host.declaration(stmt_expr(body, 0)).expect("adults");
        assert_eq!(adults.kind, DeclarationKind::Member);
        assert_eq!(adults.init, Some(init.id));
    }

    #[test]
    fn test_should_map_column_dsl_lambdas_to_the_add_call() {
        let source = "fun main() {\n    df.add { \"total\" from { it.price } }\n}\n";
        let unit = parse_source(source).unwrap();
        let host = KotlinHost::new(&unit);
        let call = stmt_expr(main_body(&unit), 0);

        let ExprKind::Call { args, .. } = &call.kind else {
            panic!("Expected call");
        };
        let ExprKind::Lambda(block) = &args[0].value.kind else {
            panic!("Expected lambda");
        };
        let froms = block.body.column_froms().expect("column dsl");
        assert_eq!(froms.len(), 1);
        assert_eq!(froms[0].0, "total");
        assert_eq!(host.lambda_call(froms[0].1.id), Some(call.id));
    }

    #[test]
    fn test_should_type_extension_property_access_by_its_getter() {
        let source = r#"
val DataFrame<Person>.adults: DataFrame<Person>
    get() = this

fun main() {
    df.adults
    df.other
}
"#;
        let unit = parse_source(source).unwrap();
        let host = KotlinHost::new(&unit);
        let body = main_body(&unit);

        assert!(host.extension_property("adults").is_some());
        assert_eq!(
            host.resolve_type(stmt_expr(body, 0)),
            Some(TypeRef::generic("DataFrame", vec![TypeRef::simple("Person")]))
        );
        assert_eq!(host.resolve_type(stmt_expr(body, 1)), None);
    }

    #[test]
    fn test_should_flag_user_defined_callees() {
        let source = "fun select(x: Int) = x\n\nfun main() {\n    select(1)\n}\n";
        let unit = parse_source(source).unwrap();
        let host = KotlinHost::new(&unit);
        let callee = host.resolve_call(stmt_expr(main_body(&unit), 0)).expect("callee");
        assert!(callee.user_defined);
    }
}
