use thiserror::Error;

/// Errors detected before a chunk starts running.
///
/// Positions are 1-based. `near` is already formatted for display: a quoted
/// lexeme such as `'end'`, or `<eof>`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LuaError {
    /// Malformed token: unterminated string, bad escape, bad numeral, stray character.
    #[error("{line}:{column}: {message} near {near}")]
    Lex {
        line: u32,
        column: u32,
        near: String,
        message: String,
    },

    /// The token stream does not match the grammar.
    #[error("{line}:{column}: {message} near {near}")]
    Syntax {
        line: u32,
        column: u32,
        near: String,
        message: String,
    },

    /// The program is well formed but cannot be lowered (scoping, limits).
    #[error("{line}: {message}")]
    Compile { line: u32, message: String },
}

impl LuaError {
    /// Source line the error points at.
    pub fn line(&self) -> u32 {
        match self {
            LuaError::Lex { line, .. }
            | LuaError::Syntax { line, .. }
            | LuaError::Compile { line, .. } => *line,
        }
    }

    /// Short category name used by diagnostics and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            LuaError::Lex { .. } => "lex",
            LuaError::Syntax { .. } => "syntax",
            LuaError::Compile { .. } => "compile",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syntax_error_display_names_token() {
        let e = LuaError::Syntax {
            line: 3,
            column: 1,
            near: "<eof>".into(),
            message: "'end' expected".into(),
        };
        assert_eq!(e.to_string(), "3:1: 'end' expected near <eof>");
        assert_eq!(e.kind(), "syntax");
    }

    #[test]
    fn compile_error_display() {
        let e = LuaError::Compile {
            line: 7,
            message: "break outside a loop".into(),
        };
        assert_eq!(e.to_string(), "7: break outside a loop");
        assert_eq!(e.line(), 7);
    }
}
