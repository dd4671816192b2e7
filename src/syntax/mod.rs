//! Front-end for the Kotlin subset used by dataframe code.

pub mod ast;
pub mod lexer;
pub mod parser;

use anyhow::{Context, Result};

use self::ast::SourceUnit;
use self::lexer::Lexer;
use self::parser::Parser;

pub fn parse_source(source: &str) -> Result<SourceUnit> {
    let tokens = Lexer::new(source).tokenize().context("Failed to tokenize source")?;
    Parser::new(tokens).parse().context("Failed to parse source")
}
