use anyhow::{bail, Context, Result};

use super::ast::Span;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    IntegerLiteral(i64),
    LongLiteral(i64),
    FloatLiteral(f64),
    SingleFloatLiteral(f64),
    StringLiteral(String),
    /// String with templates: the tokens of each `$name` / `${expr}`, each
    /// list terminated by `Eof`.
    StringTemplate(Vec<Vec<Token>>),
    CharLiteral(char),
    Keyword(Keyword),
    At,
    Newline,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    SafeDot,  // ?.
    DotDot,
    Colon,
    DoubleColon,
    Semicolon,
    Equal,
    DoubleEqual,
    Bang,
    BangBang,
    BangEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PipePipe,
    AmpersandAmpersand,
    Arrow,    // ->
    Question,
    Elvis,    // ?:
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Package,
    Import,
    Interface,
    Class,
    Data,
    Fun,
    Val,
    Var,
    If,
    Else,
    When,
    Return,
    As,
    Null,
    True,
    False,
    This,
    Override,
    Private,
    Public,
    Internal,
    Protected,
    Abstract,
    Open,
}

impl Keyword {
    /// Modifier keywords that are ordinary identifiers elsewhere (`val data = ...`).
    pub fn soft_lexeme(self) -> Option<&'static str> {
        let lexeme = match self {
            Keyword::Data => "data",
            Keyword::Override => "override",
            Keyword::Private => "private",
            Keyword::Public => "public",
            Keyword::Internal => "internal",
            Keyword::Protected => "protected",
            Keyword::Abstract => "abstract",
            Keyword::Open => "open",
            _ => return None,
        };
        Some(lexeme)
    }
}

fn keyword_from_lexeme(lexeme: &str) -> Option<Keyword> {
    let keyword = match lexeme {
        "package" => Keyword::Package,
        "import" => Keyword::Import,
        "interface" => Keyword::Interface,
        "class" => Keyword::Class,
        "data" => Keyword::Data,
        "fun" => Keyword::Fun,
        "val" => Keyword::Val,
        "var" => Keyword::Var,
        "if" => Keyword::If,
        "else" => Keyword::Else,
        "when" => Keyword::When,
        "return" => Keyword::Return,
        "as" => Keyword::As,
        "null" => Keyword::Null,
        "true" => Keyword::True,
        "false" => Keyword::False,
        "this" => Keyword::This,
        "override" => Keyword::Override,
        "private" => Keyword::Private,
        "public" => Keyword::Public,
        "internal" => Keyword::Internal,
        "protected" => Keyword::Protected,
        "abstract" => Keyword::Abstract,
        "open" => Keyword::Open,
        _ => return None,
    };
    Some(keyword)
}

pub struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        self.lex_tokens(false)
    }

    /// Tokens up to the end of input, or up to the `}` that closes a `${`
    /// template when `in_template`. The list always ends with `Eof`.
    fn lex_tokens(&mut self, in_template: bool) -> Result<Vec<Token>> {
        let template_start = self.position;
        let mut tokens = Vec::new();
        let mut depth = 0usize;

        while let Some(ch) = self.peek_char() {
            let start = self.position;
            match ch {
                ' ' | '\t' | '\r' => {
                    self.advance_char();
                }
                '\n' => {
                    self.advance_char();
                    tokens.push(self.token(TokenKind::Newline, start));
                }
                '/' if self.peek_next_char() == Some('/') => self.skip_line_comment(),
                '/' if self.peek_next_char() == Some('*') => self.skip_block_comment()?,
                '"' => {
                    let token = self.lex_string()?;
                    tokens.push(token);
                }
                '\'' => {
                    let token = self.lex_char()?;
                    tokens.push(token);
                }
                '0'..='9' => {
                    let token = self.lex_number()?;
                    tokens.push(token);
                }
                '`' => {
                    let token = self.lex_backticked_identifier()?;
                    tokens.push(token);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let token = self.lex_identifier_or_keyword();
                    tokens.push(token);
                }
                '}' if in_template && depth == 0 => {
                    tokens.push(self.token(TokenKind::Eof, start));
                    self.advance_char();
                    return Ok(tokens);
                }
                _ => {
                    let kind = self.lex_punctuation()?;
                    match kind {
                        TokenKind::LBrace => depth += 1,
                        TokenKind::RBrace => depth = depth.saturating_sub(1),
                        _ => {}
                    }
                    tokens.push(self.token(kind, start));
                }
            }
        }

        if in_template {
            bail!("Unterminated string template starting at offset {}", template_start);
        }
        tokens.push(self.token(TokenKind::Eof, self.position));
        Ok(tokens)
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        Token {
            kind,
            span: Span::new(start, self.position),
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn peek_next_char(&self) -> Option<char> {
        let mut chars = self.input[self.position..].chars();
        chars.next();
        chars.next()
    }

    fn advance_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance_char();
            true
        } else {
            false
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch == '\n' {
                break;
            }
            self.advance_char();
        }
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        let start = self.position;
        self.position += 2;
        // Kotlin block comments nest.
        let mut depth = 1;
        while depth > 0 {
            let rest = &self.input[self.position..];
            if rest.is_empty() {
                bail!("Unterminated block comment starting at offset {}", start);
            }
            if rest.starts_with("/*") {
                depth += 1;
                self.position += 2;
            } else if rest.starts_with("*/") {
                depth -= 1;
                self.position += 2;
            } else {
                self.advance_char();
            }
        }
        Ok(())
    }

    fn lex_string(&mut self) -> Result<Token> {
        let start = self.position;
        let raw = self.input[start..].starts_with("\"\"\"");
        self.position += if raw { 3 } else { 1 };

        let mut value = String::new();
        let mut templates = Vec::new();
        loop {
            if raw && self.input[self.position..].starts_with("\"\"\"") {
                self.position += 3;
                break;
            }
            let ch = self.advance_char().with_context(|| {
                format!("Unterminated string literal starting at offset {start}")
            })?;
            match ch {
                '"' if !raw => break,
                '\\' if !raw => {
                    let escaped = self
                        .advance_char()
                        .context("Unterminated escape sequence in string literal")?;
                    value.push(unescape(escaped));
                }
                '\n' if !raw => bail!("Unterminated string literal starting at offset {}", start),
                '$' if self.peek_char() == Some('{') => {
                    self.advance_char();
                    templates.push(self.lex_tokens(true)?);
                }
                '$' if self.peek_char().is_some_and(|c| c.is_alphabetic() || c == '_') => {
                    let name = self.lex_identifier_or_keyword();
                    let end = self.token(TokenKind::Eof, self.position);
                    templates.push(vec![name, end]);
                }
                other => value.push(other),
            }
        }

        let kind = if templates.is_empty() {
            TokenKind::StringLiteral(value)
        } else {
            TokenKind::StringTemplate(templates)
        };
        Ok(self.token(kind, start))
    }

    fn lex_char(&mut self) -> Result<Token> {
        let start = self.position;
        self.advance_char(); // opening quote
        let ch = match self.advance_char() {
            Some('\\') => unescape(
                self.advance_char()
                    .context("Unterminated escape sequence in char literal")?,
            ),
            Some(ch) => ch,
            None => bail!("Unterminated char literal at offset {}", start),
        };
        if !self.eat('\'') {
            bail!("Unterminated char literal at offset {}", start);
        }
        Ok(self.token(TokenKind::CharLiteral(ch), start))
    }

    fn lex_number(&mut self) -> Result<Token> {
        let start = self.position;
        let mut is_float = false;
        while let Some(ch) = self.peek_char() {
            match ch {
                '0'..='9' | '_' => {
                    self.advance_char();
                }
                '.' if !is_float
                    && self.peek_next_char().is_some_and(|c| c.is_ascii_digit()) =>
                {
                    is_float = true;
                    self.advance_char();
                }
                _ => break,
            }
        }
        let digits = self.input[start..self.position].replace('_', "");

        if is_float || matches!(self.peek_char(), Some('f' | 'F')) {
            let value = digits
                .parse::<f64>()
                .with_context(|| format!("Failed to parse float literal '{digits}'"))?;
            if self.eat('f') || self.eat('F') {
                return Ok(self.token(TokenKind::SingleFloatLiteral(value), start));
            }
            return Ok(self.token(TokenKind::FloatLiteral(value), start));
        }

        let value = digits
            .parse::<i64>()
            .with_context(|| format!("Failed to parse integer literal '{digits}'"))?;
        if self.eat('L') {
            return Ok(self.token(TokenKind::LongLiteral(value), start));
        }
        Ok(self.token(TokenKind::IntegerLiteral(value), start))
    }

    fn lex_backticked_identifier(&mut self) -> Result<Token> {
        let start = self.position;
        self.advance_char();
        let Some(end) = self.input[self.position..].find('`') else {
            bail!("Unterminated backticked identifier at offset {}", start);
        };
        let name = self.input[self.position..self.position + end].to_string();
        self.position += end + 1;
        Ok(self.token(TokenKind::Identifier(name), start))
    }

    fn lex_identifier_or_keyword(&mut self) -> Token {
        let start = self.position;
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance_char();
            } else {
                break;
            }
        }
        let lexeme = &self.input[start..self.position];
        match keyword_from_lexeme(lexeme) {
            Some(keyword) => self.token(TokenKind::Keyword(keyword), start),
            None => self.token(TokenKind::Identifier(lexeme.to_string()), start),
        }
    }

    fn lex_punctuation(&mut self) -> Result<TokenKind> {
        let start = self.position;
        let Some(ch) = self.advance_char() else {
            bail!("Unexpected end of input at offset {}", start);
        };
        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '@' => TokenKind::At,
            '+' => TokenKind::Plus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '.' if self.eat('.') => TokenKind::DotDot,
            '.' => TokenKind::Dot,
            ':' if self.eat(':') => TokenKind::DoubleColon,
            ':' => TokenKind::Colon,
            '=' if self.eat('=') => TokenKind::DoubleEqual,
            '=' => TokenKind::Equal,
            '!' if self.eat('!') => TokenKind::BangBang,
            '!' if self.eat('=') => TokenKind::BangEqual,
            '!' => TokenKind::Bang,
            '>' if self.eat('=') => TokenKind::GreaterEqual,
            '>' => TokenKind::Greater,
            '<' if self.eat('=') => TokenKind::LessEqual,
            '<' => TokenKind::Less,
            '-' if self.eat('>') => TokenKind::Arrow,
            '-' => TokenKind::Minus,
            '?' if self.eat('.') => TokenKind::SafeDot,
            '?' if self.eat(':') => TokenKind::Elvis,
            '?' => TokenKind::Question,
            '|' if self.eat('|') => TokenKind::PipePipe,
            '&' if self.eat('&') => TokenKind::AmpersandAmpersand,
            other => bail!("Unexpected character '{}' at offset {}", other, start),
        };
        Ok(kind)
    }
}

fn unescape(escaped: char) -> char {
    match escaped {
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_should_lex_member_chain_with_comments() {
        // arrange
        let source = "df[\"naem\"] /*!UNKNOWN_COLUMN*/ // trailing";

        // act
        let tokens = kinds(source);

        // assert
        assert_eq!(
            tokens,
            vec![
                TokenKind::Identifier("df".into()),
                TokenKind::LBracket,
                TokenKind::StringLiteral("naem".into()),
                TokenKind::RBracket,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_should_lex_operators_and_literals() {
        let tokens = kinds("a?.b ?: 1L !! 2.5 'c' -> x!!");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::SafeDot,
                TokenKind::Identifier("b".into()),
                TokenKind::Elvis,
                TokenKind::LongLiteral(1),
                TokenKind::BangBang,
                TokenKind::FloatLiteral(2.5),
                TokenKind::CharLiteral('c'),
                TokenKind::Arrow,
                TokenKind::Identifier("x".into()),
                TokenKind::BangBang,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_should_track_byte_spans() {
        let tokens = Lexer::new("val x").tokenize().unwrap();
        assert_eq!(tokens[0].span, Span::new(0, 3));
        assert_eq!(tokens[1].span, Span::new(4, 5));
    }

    #[test]
    fn test_should_fail_on_unterminated_string() {
        assert!(Lexer::new("\"abc").tokenize().is_err());
        assert!(Lexer::new("\"${df[\"abc\"]").tokenize().is_err());
    }

    #[test]
    fn test_should_lex_string_templates() {
        // arrange
        let source = "\"n=$count, ${df[\"naem\"]} \\$x\"";

        // act
        let tokens = Lexer::new(source).tokenize().unwrap();

        // assert
        assert_eq!(tokens.len(), 2);
        let TokenKind::StringTemplate(templates) = &tokens[0].kind else {
            panic!("Expected template, got {:?}", tokens[0].kind);
        };
        let parts: Vec<Vec<TokenKind>> = templates
            .iter()
            .map(|tokens| tokens.iter().map(|t| t.kind.clone()).collect())
            .collect();
        assert_eq!(
            parts,
            vec![
                vec![TokenKind::Identifier("count".into()), TokenKind::Eof],
                vec![
                    TokenKind::Identifier("df".into()),
                    TokenKind::LBracket,
                    TokenKind::StringLiteral("naem".into()),
                    TokenKind::RBracket,
                    TokenKind::Eof,
                ],
            ]
        );
        assert_eq!(templates[1][0].span, Span::new(13, 15));
        assert_eq!(tokens[0].span, Span::new(0, source.len()));
    }

    #[test]
    fn test_should_keep_plain_and_raw_strings_literal() {
        assert_eq!(
            kinds("\"a \\$b\" \"\"\"x\\y\"\"\""),
            vec![
                TokenKind::StringLiteral("a $b".into()),
                TokenKind::StringLiteral("x\\y".into()),
                TokenKind::Eof,
            ]
        );
    }
}
