//! `lunar-lexer` — converts raw source text into a stream of [`Token`]s.

pub mod lexer;
pub mod token;

pub use lexer::{parse_numeral, Lexer};
pub use token::{Token, TokenKind};
