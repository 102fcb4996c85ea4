//! `lunar-parser` — builds an abstract syntax tree from source text.

pub mod ast;
mod expr;
pub mod parser;

pub use ast::*;
pub use parser::Parser;

use lunar_core::LuaError;

/// Parse a complete chunk.
pub fn parse(src: &str) -> Result<Block, LuaError> {
    Parser::new(src)?.parse()
}
