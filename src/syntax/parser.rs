use anyhow::{bail, Error, Result};
use tracing::debug;

use super::ast::*;
use super::lexer::{Keyword, Token, TokenKind};
use crate::schema::TypeRef;

#[derive(Copy, Clone, PartialEq, PartialOrd)]
enum Precedence {
    Or = 1,
    And,
    Equality,
    Comparison,
    Elvis,
    Infix,
    Range,
    Term,
    Factor,
}

impl Precedence {
    fn next(self) -> u8 {
        self as u8 + 1
    }
}

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    next_expr_id: u32,
    next_decl_id: u32,
    skipped: Vec<Span>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            next_expr_id: 0,
            next_decl_id: 0,
            skipped: Vec::new(),
        }
    }

    /// Parses every declaration. Declarations and statements outside the
    /// supported subset are skipped and recorded in [`SourceUnit::skipped`].
    pub fn parse(mut self) -> Result<SourceUnit> {
        let mut items = Vec::new();
        loop {
            self.skip_separators();
            match self.peek_kind() {
                TokenKind::Eof => break,
                TokenKind::Keyword(Keyword::Package) | TokenKind::Keyword(Keyword::Import) => {
                    self.skip_line();
                }
                _ => {
                    let start = self.current;
                    match self.parse_item() {
                        Ok(item) => items.push(item),
                        Err(error) => {
                            let declared = self.unparsed_val(start);
                            self.skip_unparsed(start, &error);
                            items.extend(declared.map(Item::Property));
                        }
                    }
                }
            }
        }
        Ok(SourceUnit {
            items,
            skipped: self.skipped,
        })
    }

    // ── token helpers ──────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_nth_kind(&self, n: usize) -> &TokenKind {
        let index = (self.current + n).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    /// Index of the first token at or after the current one that is not a newline.
    fn index_past_newlines(&self) -> usize {
        let mut index = self.current;
        while index < self.tokens.len() - 1 && self.tokens[index].kind == TokenKind::Newline {
            index += 1;
        }
        index
    }

    fn peek_past_newlines(&self) -> &TokenKind {
        &self.tokens[self.index_past_newlines()].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        token
    }

    fn previous_span(&self) -> Span {
        self.tokens[self.current.saturating_sub(1)].span
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> Result<Token> {
        if self.check(kind) {
            return Ok(self.advance());
        }
        let token = self.peek();
        bail!(
            "Expected {:?} {} but found {:?} at offset {}",
            kind,
            context,
            token.kind,
            token.span.start
        )
    }

    fn expect_identifier(&mut self, context: &str) -> Result<(String, Span)> {
        let token = self.advance();
        match token.kind {
            TokenKind::Identifier(name) => Ok((name, token.span)),
            TokenKind::Keyword(keyword) if keyword.soft_lexeme().is_some() => {
                Ok((keyword.soft_lexeme().unwrap_or_default().to_string(), token.span))
            }
            other => bail!(
                "Expected identifier {} but found {:?} at offset {}",
                context,
                other,
                token.span.start
            ),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn skip_line(&mut self) {
        while !matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Eof) {
            self.advance();
        }
    }

    /// Rewinds to `start` and skips one statement or declaration: up to the
    /// next separator or closing brace outside brackets.
    fn skip_unparsed(&mut self, start: usize, error: &Error) {
        self.current = start;
        let first = self.peek().span;
        let mut depth = 0usize;
        loop {
            match self.peek_kind() {
                TokenKind::Eof => break,
                TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace if depth == 0 => {
                    break
                }
                TokenKind::LParen | TokenKind::LBrace | TokenKind::LBracket => depth += 1,
                TokenKind::RParen | TokenKind::RBrace | TokenKind::RBracket => {
                    depth = depth.saturating_sub(1);
                }
                _ => {}
            }
            self.advance();
        }
        if self.current == start {
            self.advance();
        }
        let span = if self.current == start {
            first
        } else {
            first.to(self.previous_span())
        };
        debug!(start = span.start, end = span.end, %error, "skipped unsupported syntax");
        self.skipped.push(span);
    }

    /// Declaration of a `val`/`var` statement at `start` that failed to parse,
    /// so later references still resolve to it rather than to an outer name.
    fn unparsed_val(&mut self, start: usize) -> Option<ValDecl> {
        let keyword = self.tokens.get(start)?.clone();
        let mutable = match keyword.kind {
            TokenKind::Keyword(Keyword::Val) => false,
            TokenKind::Keyword(Keyword::Var) => true,
            _ => return None,
        };
        let name_token = self.tokens.get(start + 1)?.clone();
        let TokenKind::Identifier(name) = name_token.kind else {
            return None;
        };
        let ty = match self.tokens.get(start + 2).map(|token| &token.kind) {
            Some(TokenKind::Dot | TokenKind::Less) => return None,
            Some(TokenKind::Colon) => {
                self.current = start + 3;
                self.parse_type().ok()
            }
            _ => None,
        };
        Some(ValDecl {
            decl: self.alloc_decl_id(),
            mutable,
            receiver: None,
            name,
            name_span: name_token.span,
            ty,
            init: None,
            getter: None,
            span: keyword.span.to(name_token.span),
        })
    }

    fn expect_statement_end(&mut self) -> Result<()> {
        match self.peek_kind() {
            TokenKind::Newline | TokenKind::Semicolon => {
                self.advance();
                Ok(())
            }
            TokenKind::RBrace | TokenKind::Eof => Ok(()),
            other => bail!(
                "Expected end of statement but found {:?} at offset {}",
                other,
                self.peek().span.start
            ),
        }
    }

    fn alloc_expr_id(&mut self) -> ExprId {
        let id = ExprId(self.next_expr_id);
        self.next_expr_id += 1;
        id
    }

    fn alloc_decl_id(&mut self) -> DeclId {
        let id = DeclId(self.next_decl_id);
        self.next_decl_id += 1;
        id
    }

    fn make_expr(&mut self, span: Span, kind: ExprKind) -> Expr {
        Expr {
            id: self.alloc_expr_id(),
            span,
            kind,
        }
    }

    // ── declarations ───────────────────────────────────────────────────────

    fn parse_annotations(&mut self) -> Result<Vec<Annotation>> {
        let mut annotations = Vec::new();
        while self.check(&TokenKind::At) {
            let start = self.advance().span;
            let (mut name, _) = self.expect_identifier("after '@'")?;
            // Use-site targets: @file:JvmName(...)
            if self.eat(&TokenKind::Colon) {
                name = self.expect_identifier("after annotation target")?.0;
            }
            while self.check(&TokenKind::Dot) {
                self.advance();
                name = self.expect_identifier("in annotation name")?.0;
            }
            let args = if self.check(&TokenKind::LParen) {
                self.parse_arguments()?
                    .into_iter()
                    .map(|arg| arg.value)
                    .collect()
            } else {
                Vec::new()
            };
            annotations.push(Annotation {
                name,
                args,
                span: start.to(self.previous_span()),
            });
            self.skip_newlines();
        }
        Ok(annotations)
    }

    fn skip_modifiers(&mut self) {
        loop {
            match self.peek_kind() {
                TokenKind::Keyword(
                    Keyword::Private
                    | Keyword::Public
                    | Keyword::Internal
                    | Keyword::Protected
                    | Keyword::Abstract
                    | Keyword::Open
                    | Keyword::Override,
                ) => {
                    self.advance();
                }
                TokenKind::Identifier(name)
                    if matches!(name.as_str(), "sealed" | "inline" | "const" | "lateinit")
                        && !matches!(
                            self.peek_nth_kind(1),
                            TokenKind::Newline | TokenKind::Colon
                        ) =>
                {
                    self.advance();
                }
                _ => break,
            }
        }
    }

    fn parse_item(&mut self) -> Result<Item> {
        let annotations = self.parse_annotations()?;
        self.skip_modifiers();
        match self.peek_kind() {
            TokenKind::Keyword(Keyword::Interface) => {
                Ok(Item::Class(self.parse_class(annotations, true)?))
            }
            TokenKind::Keyword(Keyword::Data) => {
                self.advance();
                Ok(Item::Class(self.parse_class(annotations, false)?))
            }
            TokenKind::Keyword(Keyword::Class) => {
                Ok(Item::Class(self.parse_class(annotations, false)?))
            }
            TokenKind::Keyword(Keyword::Fun) => {
                let fun = self.parse_fun()?;
                self.expect_statement_end()?;
                Ok(Item::Function(fun))
            }
            TokenKind::Keyword(Keyword::Val) | TokenKind::Keyword(Keyword::Var) => {
                let val = self.parse_val()?;
                self.expect_statement_end()?;
                if val.receiver.is_some() {
                    return Ok(Item::Function(val.into_getter_function()));
                }
                Ok(Item::Property(val))
            }
            other => bail!(
                "Expected declaration but found {:?} at offset {}",
                other,
                self.peek().span.start
            ),
        }
    }

    fn parse_class(
        &mut self,
        annotations: Vec<Annotation>,
        is_interface: bool,
    ) -> Result<ClassDecl> {
        let start = self.advance().span; // 'interface' or 'class'
        let (name, name_span) = self.expect_identifier("as class name")?;
        if self.check(&TokenKind::Less) {
            self.skip_type_parameters()?;
        }

        let mut params = Vec::new();
        let mut properties = Vec::new();
        if self.check(&TokenKind::LParen) {
            self.parse_constructor(&mut params, &mut properties)?;
        }

        let mut supertypes = Vec::new();
        if self.eat(&TokenKind::Colon) {
            loop {
                self.skip_newlines();
                supertypes.push(self.parse_type()?);
                if self.check(&TokenKind::LParen) {
                    // Superclass constructor call; arguments carry no schema.
                    self.parse_arguments()?;
                }
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        let mut methods = Vec::new();
        if self.check(&TokenKind::LBrace) {
            self.advance();
            loop {
                self.skip_separators();
                if self.eat(&TokenKind::RBrace) {
                    break;
                }
                if self.check(&TokenKind::Eof) {
                    bail!("Unterminated body of class {}", name);
                }
                let member_start = self.current;
                if let Err(error) = self.parse_class_member(&mut properties, &mut methods) {
                    self.skip_unparsed(member_start, &error);
                }
            }
        }

        Ok(ClassDecl {
            annotations,
            is_interface,
            name,
            name_span,
            supertypes,
            params,
            properties,
            methods,
            span: start.to(self.previous_span()),
        })
    }

    fn parse_class_member(
        &mut self,
        properties: &mut Vec<PropertyDecl>,
        methods: &mut Vec<FunDecl>,
    ) -> Result<()> {
        let annotations = self.parse_annotations()?;
        self.skip_modifiers();
        match self.peek_kind() {
            TokenKind::Keyword(Keyword::Val) | TokenKind::Keyword(Keyword::Var) => {
                let val = self.parse_val()?;
                self.expect_statement_end()?;
                if val.receiver.is_some() {
                    methods.push(val.into_getter_function());
                } else {
                    properties.push(PropertyDecl {
                        decl: val.decl,
                        annotations,
                        mutable: val.mutable,
                        name: val.name,
                        name_span: val.name_span,
                        ty: val.ty,
                        init: val.init,
                        getter: val.getter,
                        in_constructor: false,
                        span: val.span,
                    });
                }
            }
            TokenKind::Keyword(Keyword::Fun) => {
                let fun = self.parse_fun()?;
                self.expect_statement_end()?;
                methods.push(fun);
            }
            other => bail!(
                "Unsupported class member {:?} at offset {}",
                other,
                self.peek().span.start
            ),
        }
        Ok(())
    }

    fn parse_constructor(
        &mut self,
        params: &mut Vec<Param>,
        properties: &mut Vec<PropertyDecl>,
    ) -> Result<()> {
        self.expect(&TokenKind::LParen, "to open constructor")?;
        loop {
            self.skip_newlines();
            if self.eat(&TokenKind::RParen) {
                break;
            }
            let annotations = self.parse_annotations()?;
            self.skip_modifiers();
            let start = self.peek().span;
            let keyword = match self.peek_kind() {
                TokenKind::Keyword(keyword @ (Keyword::Val | Keyword::Var)) => Some(*keyword),
                _ => None,
            };
            if keyword.is_some() {
                self.advance();
            }
            let (name, name_span) = self.expect_identifier("as constructor parameter")?;
            self.expect(&TokenKind::Colon, "after constructor parameter")?;
            let ty = self.parse_type()?;
            let default = if self.eat(&TokenKind::Equal) {
                self.skip_newlines();
                Some(self.parse_expression()?)
            } else {
                None
            };
            let decl = self.alloc_decl_id();
            let span = start.to(self.previous_span());
            match keyword {
                Some(keyword) => properties.push(PropertyDecl {
                    decl,
                    annotations,
                    mutable: keyword == Keyword::Var,
                    name,
                    name_span,
                    ty: Some(ty),
                    init: default,
                    getter: None,
                    in_constructor: true,
                    span,
                }),
                None => params.push(Param {
                    decl,
                    name,
                    ty: Some(ty),
                    default,
                    span,
                }),
            }
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                self.skip_newlines();
                self.expect(&TokenKind::RParen, "to close constructor")?;
                break;
            }
        }
        Ok(())
    }

    fn skip_type_parameters(&mut self) -> Result<()> {
        self.expect(&TokenKind::Less, "to open type parameters")?;
        let mut depth = 1;
        while depth > 0 {
            match self.advance().kind {
                TokenKind::Less => depth += 1,
                TokenKind::Greater => depth -= 1,
                TokenKind::Eof => bail!("Unterminated type parameter list"),
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_fun(&mut self) -> Result<FunDecl> {
        let start = self.expect(&TokenKind::Keyword(Keyword::Fun), "")?.span;
        let decl = self.alloc_decl_id();
        if self.check(&TokenKind::Less) {
            self.skip_type_parameters()?;
        }

        // Either `name`, `Receiver.name` or `Receiver<Args>.name`.
        let head = self.parse_type()?;
        let (receiver, name) = if self.eat(&TokenKind::Dot) {
            (Some(head), self.expect_identifier("as function name")?.0)
        } else {
            match head.name.rsplit_once('.') {
                Some((receiver, name)) if head.args.is_empty() => {
                    (Some(TypeRef::simple(receiver)), name.to_string())
                }
                _ => (None, head.name),
            }
        };

        self.expect(&TokenKind::LParen, "to open parameter list")?;
        let mut params = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&TokenKind::RParen) {
                break;
            }
            self.parse_annotations()?;
            let (param_name, param_span) = self.expect_identifier("as parameter name")?;
            let ty = if self.eat(&TokenKind::Colon) {
                Some(self.parse_type()?)
            } else {
                None
            };
            let default = if self.eat(&TokenKind::Equal) {
                self.skip_newlines();
                Some(self.parse_expression()?)
            } else {
                None
            };
            params.push(Param {
                decl: self.alloc_decl_id(),
                name: param_name,
                ty,
                default,
                span: param_span.to(self.previous_span()),
            });
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                self.skip_newlines();
                self.expect(&TokenKind::RParen, "to close parameter list")?;
                break;
            }
        }

        let return_type = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = if self.eat(&TokenKind::Equal) {
            self.skip_newlines();
            Some(FunBody::Expr(self.parse_expression()?))
        } else if self.check(&TokenKind::LBrace) {
            Some(FunBody::Block(self.parse_block()?))
        } else {
            None
        };

        Ok(FunDecl {
            decl,
            name,
            receiver,
            params,
            return_type,
            body,
            is_property: false,
            span: start.to(self.previous_span()),
        })
    }

    fn parse_val(&mut self) -> Result<ValDecl> {
        let keyword = self.advance();
        let mutable = keyword.kind == TokenKind::Keyword(Keyword::Var);
        let (receiver, name, name_span) = self.parse_property_name()?;
        let ty = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let init = if self.eat(&TokenKind::Equal) {
            self.skip_newlines();
            Some(self.parse_expression()?)
        } else {
            None
        };
        let getter = self.parse_getter()?;
        Ok(ValDecl {
            decl: self.alloc_decl_id(),
            mutable,
            receiver,
            name,
            name_span,
            ty,
            init,
            getter,
            span: keyword.span.to(self.previous_span()),
        })
    }

    /// `name`, or `Receiver.name` / `Receiver<Args>.name` of an extension property.
    fn parse_property_name(&mut self) -> Result<(Option<TypeRef>, String, Span)> {
        if !matches!(self.peek_nth_kind(1), TokenKind::Dot | TokenKind::Less) {
            let (name, span) = self.expect_identifier("as property name")?;
            return Ok((None, name, span));
        }
        let head = self.parse_type()?;
        if self.eat(&TokenKind::Dot) {
            let (name, span) = self.expect_identifier("as property name")?;
            return Ok((Some(head), name, span));
        }
        match head.name.rsplit_once('.') {
            Some((receiver, name)) if head.args.is_empty() && !head.nullable => Ok((
                Some(TypeRef::simple(receiver)),
                name.to_string(),
                self.previous_span(),
            )),
            _ => bail!("Expected property name at offset {}", self.peek().span.start),
        }
    }

    /// `get() = expr` or `get() { ... }` following a property, possibly on
    /// the next line.
    fn parse_getter(&mut self) -> Result<Option<FunBody>> {
        let index = self.index_past_newlines();
        let kind_at = |offset: usize| self.tokens.get(index + offset).map(|token| &token.kind);
        let is_getter = matches!(kind_at(0), Some(TokenKind::Identifier(name)) if name == "get")
            && kind_at(1) == Some(&TokenKind::LParen)
            && kind_at(2) == Some(&TokenKind::RParen)
            && matches!(
                kind_at(3),
                Some(TokenKind::Equal | TokenKind::LBrace | TokenKind::Colon)
            );
        if !is_getter {
            return Ok(None);
        }
        self.current = index + 3;
        if self.eat(&TokenKind::Colon) {
            self.parse_type()?;
        }
        if self.eat(&TokenKind::Equal) {
            self.skip_newlines();
            return Ok(Some(FunBody::Expr(self.parse_expression()?)));
        }
        Ok(Some(FunBody::Block(self.parse_block()?)))
    }

    // ── types ──────────────────────────────────────────────────────────────

    pub(crate) fn parse_type(&mut self) -> Result<TypeRef> {
        if self.eat(&TokenKind::Star) {
            return Ok(TypeRef::star());
        }
        let (mut name, _) = self.expect_identifier("as type name")?;
        while self.check(&TokenKind::Dot)
            && matches!(self.peek_nth_kind(1), TokenKind::Identifier(_))
            && !matches!(self.peek_nth_kind(2), TokenKind::LParen)
        {
            self.advance();
            let (segment, _) = self.expect_identifier("in qualified type")?;
            name.push('.');
            name.push_str(&segment);
        }
        let mut args = Vec::new();
        if self.eat(&TokenKind::Less) {
            loop {
                // Variance modifiers carry no schema information.
                if let TokenKind::Identifier(variance) = self.peek_kind() {
                    if matches!(variance.as_str(), "out" | "in")
                        && matches!(self.peek_nth_kind(1), TokenKind::Identifier(_))
                    {
                        self.advance();
                    }
                }
                args.push(self.parse_type()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::Greater, "to close type arguments")?;
        }
        let nullable = self.eat(&TokenKind::Question);
        Ok(TypeRef {
            name,
            args,
            nullable,
        })
    }

    /// Explicit type arguments of a call (`cast<Person>()`); restores the
    /// position and returns `None` when the `<` starts a comparison instead.
    fn try_parse_call_type_args(&mut self) -> Option<Vec<TypeRef>> {
        let saved = self.current;
        self.advance(); // '<'
        let mut args = Vec::new();
        let parsed = loop {
            match self.parse_type() {
                Ok(ty) => args.push(ty),
                Err(_) => break false,
            }
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            break self.eat(&TokenKind::Greater)
                && matches!(self.peek_kind(), TokenKind::LParen | TokenKind::LBrace);
        };
        if parsed {
            Some(args)
        } else {
            self.current = saved;
            None
        }
    }

    // ── statements ─────────────────────────────────────────────────────────

    fn parse_block(&mut self) -> Result<Block> {
        let start = self.expect(&TokenKind::LBrace, "to open block")?.span;
        let stmts = self.parse_statements_until_rbrace()?;
        Ok(Block {
            stmts,
            span: start.to(self.previous_span()),
        })
    }

    fn parse_statements_until_rbrace(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(&TokenKind::RBrace) {
                return Ok(stmts);
            }
            if self.check(&TokenKind::Eof) {
                bail!("Unterminated block");
            }
            let start = self.current;
            let parsed = self.parse_statement();
            match parsed.and_then(|stmt| self.expect_statement_end().map(|()| stmt)) {
                Ok(stmt) => stmts.push(stmt),
                Err(error) => {
                    let declared = self.unparsed_val(start);
                    self.skip_unparsed(start, &error);
                    stmts.extend(declared.map(Stmt::Val));
                }
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        match self.peek_kind() {
            TokenKind::Keyword(Keyword::Val) | TokenKind::Keyword(Keyword::Var) => {
                let val = self.parse_val()?;
                if val.receiver.is_some() {
                    return Ok(Stmt::Function(val.into_getter_function()));
                }
                Ok(Stmt::Val(val))
            }
            TokenKind::Keyword(Keyword::Fun) => Ok(Stmt::Function(self.parse_fun()?)),
            TokenKind::Keyword(Keyword::Return) => {
                let start = self.advance().span;
                let value = if matches!(
                    self.peek_kind(),
                    TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                Ok(Stmt::Return {
                    value,
                    span: start.to(self.previous_span()),
                })
            }
            _ => {
                let expr = self.parse_expression()?;
                if self.eat(&TokenKind::Equal) {
                    self.skip_newlines();
                    let value = self.parse_expression()?;
                    let span = expr.span.to(value.span);
                    return Ok(Stmt::Assign {
                        target: expr,
                        value,
                        span,
                    });
                }
                Ok(Stmt::Expr(expr))
            }
        }
    }

    // ── expressions ────────────────────────────────────────────────────────

    pub(crate) fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_binary(0)
    }

    /// Binary operator at the current position. Operators that may start a
    /// continuation line are also found past newlines.
    fn peek_binary_op(&self) -> Option<(BinaryOp, Option<String>, Precedence)> {
        let kind = match self.peek_kind() {
            TokenKind::Newline => match self.peek_past_newlines() {
                kind @ (TokenKind::Elvis
                | TokenKind::AmpersandAmpersand
                | TokenKind::PipePipe) => kind,
                _ => return None,
            },
            kind => kind,
        };
        let op = match kind {
            TokenKind::PipePipe => (BinaryOp::Or, None, Precedence::Or),
            TokenKind::AmpersandAmpersand => (BinaryOp::And, None, Precedence::And),
            TokenKind::DoubleEqual => (BinaryOp::Eq, None, Precedence::Equality),
            TokenKind::BangEqual => (BinaryOp::NotEq, None, Precedence::Equality),
            TokenKind::Less => (BinaryOp::Less, None, Precedence::Comparison),
            TokenKind::LessEqual => (BinaryOp::LessEq, None, Precedence::Comparison),
            TokenKind::Greater => (BinaryOp::Greater, None, Precedence::Comparison),
            TokenKind::GreaterEqual => (BinaryOp::GreaterEq, None, Precedence::Comparison),
            TokenKind::Elvis => (BinaryOp::Elvis, None, Precedence::Elvis),
            TokenKind::Identifier(name) => (BinaryOp::Infix, Some(name.clone()), Precedence::Infix),
            TokenKind::DotDot => (BinaryOp::Range, None, Precedence::Range),
            TokenKind::Plus => (BinaryOp::Add, None, Precedence::Term),
            TokenKind::Minus => (BinaryOp::Sub, None, Precedence::Term),
            TokenKind::Star => (BinaryOp::Mul, None, Precedence::Factor),
            TokenKind::Slash => (BinaryOp::Div, None, Precedence::Factor),
            TokenKind::Percent => (BinaryOp::Rem, None, Precedence::Factor),
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut left = self.parse_as()?;
        while let Some((op, infix, precedence)) = self.peek_binary_op() {
            if (precedence as u8) < min_precedence {
                break;
            }
            self.skip_newlines();
            self.advance();
            self.skip_newlines();
            let right = self.parse_binary(precedence.next())?;
            let span = left.span.to(right.span);
            left = self.make_expr(
                span,
                ExprKind::Binary {
                    op,
                    infix,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            );
        }
        Ok(left)
    }

    fn parse_as(&mut self) -> Result<Expr> {
        let mut expr = self.parse_unary()?;
        while self.eat(&TokenKind::Keyword(Keyword::As)) {
            let safe = self.eat(&TokenKind::Question);
            let ty = self.parse_type()?;
            let span = expr.span.to(self.previous_span());
            expr = self.make_expr(
                span,
                ExprKind::Cast {
                    expr: Box::new(expr),
                    ty,
                    safe,
                },
            );
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Plus,
            _ => return self.parse_postfix(),
        };
        let start = self.advance().span;
        let operand = self.parse_unary()?;
        let span = start.to(operand.span);
        Ok(self.make_expr(
            span,
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let continues_chain = matches!(
                self.peek_kind(),
                TokenKind::Dot | TokenKind::SafeDot
            ) || (self.check(&TokenKind::Newline)
                && matches!(self.peek_past_newlines(), TokenKind::Dot | TokenKind::SafeDot));

            if continues_chain {
                self.skip_newlines();
                let safe = self.advance().kind == TokenKind::SafeDot;
                let (name, name_span) = self.expect_identifier("after '.'")?;
                let span = expr.span.to(name_span);
                expr = self.make_expr(
                    span,
                    ExprKind::Member {
                        receiver: Box::new(expr),
                        name,
                        name_span,
                        safe,
                    },
                );
                continue;
            }

            let callable = matches!(expr.kind, ExprKind::Name(_) | ExprKind::Member { .. });
            match self.peek_kind() {
                TokenKind::Less if callable => match self.try_parse_call_type_args() {
                    Some(type_args) => expr = self.parse_call(expr, type_args)?,
                    None => break,
                },
                TokenKind::LParen => expr = self.parse_call(expr, Vec::new())?,
                TokenKind::LBrace if callable => expr = self.parse_call(expr, Vec::new())?,
                TokenKind::LBracket => {
                    self.advance();
                    let mut indices = Vec::new();
                    loop {
                        self.skip_newlines();
                        indices.push(self.parse_expression()?);
                        self.skip_newlines();
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RBracket, "to close index")?;
                    let span = expr.span.to(self.previous_span());
                    expr = self.make_expr(
                        span,
                        ExprKind::Index {
                            receiver: Box::new(expr),
                            indices,
                        },
                    );
                }
                TokenKind::BangBang => {
                    self.advance();
                    let span = expr.span.to(self.previous_span());
                    expr = self.make_expr(span, ExprKind::NotNull(Box::new(expr)));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Parses `(args)` and/or a trailing lambda after `callee`.
    fn parse_call(&mut self, callee: Expr, type_args: Vec<TypeRef>) -> Result<Expr> {
        let mut args = if self.check(&TokenKind::LParen) {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        if self.check(&TokenKind::LBrace) {
            let lambda = self.parse_lambda()?;
            args.push(Argument {
                name: None,
                value: lambda,
            });
        }
        let span = callee.span.to(self.previous_span());
        Ok(self.make_expr(
            span,
            ExprKind::Call {
                callee: Box::new(callee),
                type_args,
                args,
            },
        ))
    }

    fn parse_arguments(&mut self) -> Result<Vec<Argument>> {
        self.expect(&TokenKind::LParen, "to open arguments")?;
        let mut args = Vec::new();
        loop {
            self.skip_newlines();
            if self.eat(&TokenKind::RParen) {
                break;
            }
            let name = match (self.peek_kind(), self.peek_nth_kind(1)) {
                (TokenKind::Identifier(name), TokenKind::Equal) => {
                    let name = name.clone();
                    self.advance();
                    self.advance();
                    self.skip_newlines();
                    Some(name)
                }
                _ => None,
            };
            // Spread operator; the array's elements are not statically known.
            self.eat(&TokenKind::Star);
            let value = self.parse_expression()?;
            args.push(Argument { name, value });
            self.skip_newlines();
            if !self.eat(&TokenKind::Comma) {
                self.skip_newlines();
                self.expect(&TokenKind::RParen, "to close arguments")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.peek().clone();
        let literal = match &token.kind {
            TokenKind::IntegerLiteral(value) => Some(Literal::Int(*value)),
            TokenKind::LongLiteral(value) => Some(Literal::Long(*value)),
            TokenKind::FloatLiteral(value) => Some(Literal::Double(*value)),
            TokenKind::SingleFloatLiteral(value) => Some(Literal::Float(*value)),
            TokenKind::StringLiteral(value) => Some(Literal::String(value.clone())),
            TokenKind::CharLiteral(value) => Some(Literal::Char(*value)),
            TokenKind::Keyword(Keyword::True) => Some(Literal::Bool(true)),
            TokenKind::Keyword(Keyword::False) => Some(Literal::Bool(false)),
            TokenKind::Keyword(Keyword::Null) => Some(Literal::Null),
            _ => None,
        };
        if let Some(literal) = literal {
            self.advance();
            return Ok(self.make_expr(token.span, ExprKind::Literal(literal)));
        }

        match token.kind {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(self.make_expr(token.span, ExprKind::Name(name)))
            }
            TokenKind::Keyword(Keyword::This) => {
                self.advance();
                Ok(self.make_expr(token.span, ExprKind::This))
            }
            TokenKind::Keyword(keyword) if keyword.soft_lexeme().is_some() => {
                self.advance();
                let name = keyword.soft_lexeme().unwrap_or_default().to_string();
                Ok(self.make_expr(token.span, ExprKind::Name(name)))
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                let inner = self.parse_expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::RParen, "to close parenthesized expression")?;
                Ok(inner)
            }
            TokenKind::StringTemplate(templates) => {
                self.advance();
                let mut parts = Vec::with_capacity(templates.len());
                for tokens in templates {
                    parts.push(self.parse_embedded(tokens)?);
                }
                Ok(self.make_expr(token.span, ExprKind::Template(parts)))
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::When) => self.parse_when(),
            TokenKind::LBrace => self.parse_lambda(),
            other => bail!(
                "Unexpected token {:?} in expression at offset {}",
                other,
                token.span.start
            ),
        }
    }

    fn parse_if(&mut self) -> Result<Expr> {
        let start = self.advance().span; // 'if'
        self.expect(&TokenKind::LParen, "after 'if'")?;
        self.skip_newlines();
        let condition = self.parse_expression()?;
        self.skip_newlines();
        self.expect(&TokenKind::RParen, "to close 'if' condition")?;
        let then_branch = self.parse_branch()?;
        let else_branch = if self.at_else_of_if() {
            self.skip_newlines();
            self.advance();
            Some(Box::new(self.parse_branch()?))
        } else {
            None
        };
        let span = start.to(self.previous_span());
        Ok(self.make_expr(
            span,
            ExprKind::If {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch,
            },
        ))
    }

    /// Expression of a string template, parsed from its own token list.
    fn parse_embedded(&mut self, tokens: Vec<Token>) -> Result<Expr> {
        let outer_tokens = std::mem::replace(&mut self.tokens, tokens);
        let outer_current = std::mem::replace(&mut self.current, 0);
        let result = self.parse_embedded_expression();
        self.tokens = outer_tokens;
        self.current = outer_current;
        result
    }

    fn parse_embedded_expression(&mut self) -> Result<Expr> {
        self.skip_newlines();
        let expr = self.parse_expression()?;
        self.skip_newlines();
        if !self.check(&TokenKind::Eof) {
            bail!(
                "Unexpected token {:?} in string template at offset {}",
                self.peek_kind(),
                self.peek().span.start
            );
        }
        Ok(expr)
    }

    fn parse_when(&mut self) -> Result<Expr> {
        let start = self.advance().span; // 'when'
        let subject = if self.eat(&TokenKind::LParen) {
            self.skip_newlines();
            // `when (val x = expr)`: the subject binding itself is not tracked.
            if self.eat(&TokenKind::Keyword(Keyword::Val)) {
                self.expect_identifier("as 'when' subject name")?;
                if self.eat(&TokenKind::Colon) {
                    self.parse_type()?;
                }
                self.expect(&TokenKind::Equal, "after 'when' subject name")?;
                self.skip_newlines();
            }
            let subject = self.parse_expression()?;
            self.skip_newlines();
            self.expect(&TokenKind::RParen, "to close 'when' subject")?;
            Some(Box::new(subject))
        } else {
            None
        };
        self.skip_newlines();
        self.expect(&TokenKind::LBrace, "to open 'when' branches")?;
        let mut branches = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(&TokenKind::RBrace) {
                break;
            }
            branches.push(self.parse_when_branch()?);
        }
        let span = start.to(self.previous_span());
        Ok(self.make_expr(span, ExprKind::When { subject, branches }))
    }

    fn parse_when_branch(&mut self) -> Result<WhenBranch> {
        let is_else = self.eat(&TokenKind::Keyword(Keyword::Else));
        let mut conditions = Vec::new();
        if !is_else {
            loop {
                self.skip_newlines();
                conditions.extend(self.parse_when_condition()?);
                self.skip_newlines();
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.skip_newlines();
        self.expect(&TokenKind::Arrow, "after 'when' condition")?;
        let body = self.parse_branch()?;
        Ok(WhenBranch {
            conditions,
            is_else,
            body,
        })
    }

    /// One branch condition; type checks (`is T`, `!is T`) carry no expression.
    fn parse_when_condition(&mut self) -> Result<Option<Expr>> {
        let is_keyword = |kind: &TokenKind, word: &str| {
            matches!(kind, TokenKind::Identifier(name) if name == word)
        };
        if self.check(&TokenKind::Bang)
            && (is_keyword(self.peek_nth_kind(1), "is") || is_keyword(self.peek_nth_kind(1), "in"))
        {
            self.advance();
        }
        if is_keyword(self.peek_kind(), "is") {
            self.advance();
            self.parse_type()?;
            return Ok(None);
        }
        if is_keyword(self.peek_kind(), "in") {
            self.advance();
        }
        Ok(Some(self.parse_expression()?))
    }

    /// `else` continuing an `if`, as opposed to the `else ->` arm of a `when`.
    fn at_else_of_if(&self) -> bool {
        let index = self.index_past_newlines();
        self.tokens[index].kind == TokenKind::Keyword(Keyword::Else)
            && self.tokens.get(index + 1).map(|token| &token.kind) != Some(&TokenKind::Arrow)
    }

    fn parse_branch(&mut self) -> Result<Expr> {
        self.skip_newlines();
        if self.check(&TokenKind::LBrace) {
            let block = self.parse_block()?;
            let span = block.span;
            return Ok(self.make_expr(span, ExprKind::Block(block)));
        }
        self.parse_expression()
    }

    fn parse_lambda(&mut self) -> Result<Expr> {
        let start = self.expect(&TokenKind::LBrace, "to open lambda")?.span;
        let params = self.try_parse_lambda_params()?;
        let implicit_it = self.alloc_decl_id();
        let stmts = self.parse_statements_until_rbrace()?;
        let span = start.to(self.previous_span());
        Ok(self.make_expr(
            span,
            ExprKind::Lambda(Lambda {
                params,
                implicit_it,
                body: Block { stmts, span },
            }),
        ))
    }

    /// `a, b: Type ->` at the start of a lambda; empty when absent.
    fn try_parse_lambda_params(&mut self) -> Result<Vec<LambdaParam>> {
        let saved = self.current;
        self.skip_newlines();
        let mut params = Vec::new();
        loop {
            let TokenKind::Identifier(name) = self.peek_kind().clone() else {
                self.current = saved;
                return Ok(Vec::new());
            };
            self.advance();
            let ty = if self.eat(&TokenKind::Colon) {
                match self.parse_type() {
                    Ok(ty) => Some(ty),
                    Err(_) => {
                        self.current = saved;
                        return Ok(Vec::new());
                    }
                }
            } else {
                None
            };
            params.push(LambdaParam {
                decl: self.alloc_decl_id(),
                name,
                ty,
            });
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            if self.eat(&TokenKind::Arrow) {
                return Ok(params);
            }
            self.current = saved;
            return Ok(Vec::new());
        }
    }
}
