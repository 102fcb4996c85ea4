use std::fmt;

/// A token together with where it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Source text of the token, empty at end of input.
    pub lexeme: String,
    pub line: u32,
    /// 1-based byte offset into the line.
    pub column: u32,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            kind,
            lexeme: lexeme.into(),
            line,
            column,
        }
    }

    /// The token as diagnostics quote it: `'lexeme'`, or `<eof>`.
    pub fn describe(&self) -> String {
        if self.kind == TokenKind::Eof {
            "<eof>".to_string()
        } else {
            format!("'{}'", self.lexeme)
        }
    }
}

/// Declares [`TokenKind`] from its fixed spellings, so the keyword lookup,
/// the symbol matcher and `Display` cannot drift apart.
macro_rules! token_kinds {
    (
        keywords { $($kw:ident => $kw_text:literal,)* }
        symbols { $($sym:ident => $sym_text:literal,)* }
    ) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum TokenKind {
            /// Every numeral, decimal or hexadecimal, is read as a float.
            Number(f64),
            Str(String),
            Name(String),
            Eof,
            $($kw,)*
            $($sym,)*
        }

        impl TokenKind {
            /// The keyword spelled `word`, if it is one.
            pub fn keyword(word: &str) -> Option<TokenKind> {
                match word {
                    $($kw_text => Some(TokenKind::$kw),)*
                    _ => None,
                }
            }

            /// Longest punctuation token at the start of `rest`, with its length.
            pub fn match_symbol(rest: &[u8]) -> Option<(TokenKind, usize)> {
                let mut best: Option<(TokenKind, usize)> = None;
                $(
                    if rest.starts_with($sym_text.as_bytes())
                        && best.as_ref().map_or(true, |(_, len)| *len < $sym_text.len())
                    {
                        best = Some((TokenKind::$sym, $sym_text.len()));
                    }
                )*
                best
            }

            /// Fixed spelling of keywords and punctuation.
            pub fn symbol(&self) -> Option<&'static str> {
                match self {
                    $(TokenKind::$kw => Some($kw_text),)*
                    $(TokenKind::$sym => Some($sym_text),)*
                    _ => None,
                }
            }
        }
    };
}

token_kinds! {
    keywords {
        And => "and",
        Break => "break",
        Do => "do",
        Else => "else",
        ElseIf => "elseif",
        End => "end",
        False => "false",
        For => "for",
        Function => "function",
        Goto => "goto",
        If => "if",
        In => "in",
        Local => "local",
        Nil => "nil",
        Not => "not",
        Or => "or",
        Repeat => "repeat",
        Return => "return",
        Then => "then",
        True => "true",
        Until => "until",
        While => "while",
    }
    symbols {
        Plus => "+",
        Minus => "-",
        Star => "*",
        Slash => "/",
        DoubleSlash => "//",
        Percent => "%",
        Caret => "^",
        Amp => "&",
        Tilde => "~",
        Pipe => "|",
        Shl => "<<",
        Shr => ">>",
        Hash => "#",
        EqEq => "==",
        NotEq => "~=",
        Lt => "<",
        Le => "<=",
        Gt => ">",
        Ge => ">=",
        Assign => "=",
        LParen => "(",
        RParen => ")",
        LBrace => "{",
        RBrace => "}",
        LBracket => "[",
        RBracket => "]",
        DoubleColon => "::",
        Semi => ";",
        Colon => ":",
        Comma => ",",
        Dot => ".",
        Concat => "..",
        Ellipsis => "...",
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(_) => f.write_str("<number>"),
            TokenKind::Str(_) => f.write_str("<string>"),
            TokenKind::Name(_) => f.write_str("<name>"),
            TokenKind::Eof => f.write_str("<eof>"),
            other => write!(f, "'{}'", other.symbol().unwrap_or("?")),
        }
    }
}
