use crate::token::{Token, TokenKind};
use lunar_core::LuaError;
use tracing::trace;

/// Where a token started: byte offset plus its line and column.
#[derive(Debug, Clone, Copy)]
struct Mark {
    offset: usize,
    line: u32,
    column: u32,
}

/// What a long bracket encloses; only changes the error wording.
#[derive(Debug, Clone, Copy)]
enum Long {
    Comment,
    String,
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0B | 0x0C)
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn hex_digit(b: Option<u8>) -> Option<u32> {
    b.and_then(|c| (c as char).to_digit(16))
}

/// On-demand tokenizer over one chunk of source.
///
/// [`Lexer::next_token`] skips whitespace and comments and reads one token;
/// at the end of input it keeps answering `Eof`.
pub struct Lexer<'src> {
    src: &'src [u8],
    pos: usize,
    line: u32,
    line_start: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        let mut lexer = Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            line_start: 0,
        };
        // A leading `#` line (`#!/usr/bin/env lunar`) is not source.
        if lexer.src.first() == Some(&b'#') {
            lexer.skip_line();
        }
        lexer
    }

    /// Read the whole chunk, ending with the `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LuaError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let last = token.kind == TokenKind::Eof;
            tokens.push(token);
            if last {
                trace!(target: "lunar::lexer", count = tokens.len(), "tokenized source");
                return Ok(tokens);
            }
        }
    }

    /// Read the next token.
    pub fn next_token(&mut self) -> Result<Token, LuaError> {
        self.skip_trivia()?;
        let mark = self.mark();
        let Some(first) = self.peek() else {
            return Ok(Token::new(TokenKind::Eof, "", mark.line, mark.column));
        };

        let kind = if first.is_ascii_digit() || (first == b'.' && self.peek_at(1).is_some_and(|c| c.is_ascii_digit())) {
            TokenKind::Number(self.numeral(mark)?)
        } else if first == b'_' || first.is_ascii_alphabetic() {
            self.bump_while(is_name_byte);
            let word = self.slice(mark.offset);
            TokenKind::keyword(&word).unwrap_or(TokenKind::Name(word))
        } else if first == b'"' || first == b'\'' {
            self.bump();
            let bytes = self.short_string(first, mark)?;
            TokenKind::Str(String::from_utf8_lossy(&bytes).into_owned())
        } else if let Some(level) = self.long_bracket(self.pos) {
            let bytes = self.long_body(level, Long::String, mark)?;
            TokenKind::Str(String::from_utf8_lossy(&bytes).into_owned())
        } else if let Some((kind, len)) = TokenKind::match_symbol(&self.src[self.pos..]) {
            for _ in 0..len {
                self.bump();
            }
            kind
        } else {
            return Err(self.stray_byte(mark));
        };

        Ok(Token::new(kind, self.slice(mark.offset), mark.line, mark.column))
    }

    // ── Cursor ────────────────────────────────────────────────────────────────

    fn peek(&self) -> Option<u8> {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(b)
    }

    fn bump_if(&mut self, b: u8) -> bool {
        let hit = self.peek() == Some(b);
        if hit {
            self.bump();
        }
        hit
    }

    fn bump_while(&mut self, pred: impl Fn(u8) -> bool) {
        while self.peek().is_some_and(&pred) {
            self.bump();
        }
    }

    fn skip_line(&mut self) {
        self.bump_while(|b| b != b'\n');
    }

    fn mark(&self) -> Mark {
        Mark {
            offset: self.pos,
            line: self.line,
            column: (self.pos - self.line_start + 1) as u32,
        }
    }

    fn slice(&self, from: usize) -> String {
        String::from_utf8_lossy(&self.src[from..self.pos]).into_owned()
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    fn fail(&self, at: Mark, near: String, message: impl Into<String>) -> LuaError {
        LuaError::Lex {
            line: at.line,
            column: at.column,
            near,
            message: message.into(),
        }
    }

    /// Error quoting everything read since `at`.
    fn fail_here(&self, at: Mark, message: &str) -> LuaError {
        self.fail(at, format!("'{}'", self.slice(at.offset)), message)
    }

    fn fail_eof(&self, at: Mark, message: impl Into<String>) -> LuaError {
        self.fail(at, "<eof>".to_string(), message)
    }

    fn stray_byte(&mut self, at: Mark) -> LuaError {
        let first = self.bump().unwrap_or(0);
        // Swallow UTF-8 continuation bytes so the error names one character.
        self.bump_while(|b| b & 0xC0 == 0x80);
        let near = if first.is_ascii_graphic() {
            format!("'{}'", first as char)
        } else {
            format!("'<\\{first}>'")
        };
        self.fail(at, near, "unexpected symbol")
    }

    // ── Whitespace and comments ───────────────────────────────────────────────

    fn skip_trivia(&mut self) -> Result<(), LuaError> {
        loop {
            self.bump_while(is_space);
            if self.peek() != Some(b'-') || self.peek_at(1) != Some(b'-') {
                return Ok(());
            }
            let mark = self.mark();
            self.pos += 2;
            match self.long_bracket(self.pos) {
                Some(level) => {
                    self.long_body(level, Long::Comment, mark)?;
                }
                None => self.skip_line(),
            }
        }
    }

    // ── Long brackets ─────────────────────────────────────────────────────────

    /// Level of a `[=*[` opener starting at `at`.
    fn long_bracket(&self, at: usize) -> Option<usize> {
        let rest = self.src.get(at..)?;
        if rest.first() != Some(&b'[') {
            return None;
        }
        let level = rest[1..].iter().take_while(|&&b| b == b'=').count();
        (rest.get(level + 1) == Some(&b'[')).then_some(level)
    }

    /// Consume a long bracket of `level` starting at the cursor and return
    /// its contents.
    fn long_body(&mut self, level: usize, what: Long, start: Mark) -> Result<Vec<u8>, LuaError> {
        for _ in 0..level + 2 {
            self.bump();
        }
        // One newline directly after the opener is dropped.
        match (self.peek(), self.peek_at(1)) {
            (Some(b'\r'), Some(b'\n')) | (Some(b'\n'), Some(b'\r')) => {
                self.bump();
                self.bump();
            }
            (Some(b'\r' | b'\n'), _) => {
                self.bump();
            }
            _ => {}
        }

        let mut body = Vec::new();
        loop {
            let Some(b) = self.bump() else {
                let what = match what {
                    Long::Comment => "comment",
                    Long::String => "string",
                };
                return Err(self.fail_eof(
                    start,
                    format!("unfinished long {what} (starting at line {})", start.line),
                ));
            };
            if b != b']' {
                body.push(b);
                continue;
            }
            let equals = self.src[self.pos..].iter().take_while(|&&b| b == b'=').count();
            if equals == level && self.peek_at(equals) == Some(b']') {
                for _ in 0..=equals {
                    self.bump();
                }
                return Ok(body);
            }
            body.push(b']');
        }
    }

    // ── Quoted strings ────────────────────────────────────────────────────────

    /// Body of a quoted string; the opening quote is already consumed.
    fn short_string(&mut self, quote: u8, start: Mark) -> Result<Vec<u8>, LuaError> {
        let mut buf = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.fail_eof(start, "unfinished string")),
                Some(b'\n' | b'\r') => return Err(self.fail_here(start, "unfinished string")),
                Some(b) if b == quote => {
                    self.bump();
                    return Ok(buf);
                }
                Some(b'\\') => {
                    self.bump();
                    self.escape(&mut buf, start)?;
                }
                Some(b) => {
                    self.bump();
                    buf.push(b);
                }
            }
        }
    }

    fn escape(&mut self, buf: &mut Vec<u8>, start: Mark) -> Result<(), LuaError> {
        let Some(b) = self.bump() else {
            return Err(self.fail_eof(start, "unfinished string"));
        };
        let simple = match b {
            b'a' => Some(0x07),
            b'b' => Some(0x08),
            b'f' => Some(0x0C),
            b'n' => Some(b'\n'),
            b'r' => Some(b'\r'),
            b't' => Some(b'\t'),
            b'v' => Some(0x0B),
            b'\\' | b'\'' | b'"' => Some(b),
            _ => None,
        };
        if let Some(byte) = simple {
            buf.push(byte);
            return Ok(());
        }
        match b {
            b'\n' | b'\r' => {
                // `\` before a line break keeps the break; `\r\n` counts once.
                let pair = if b == b'\n' { b'\r' } else { b'\n' };
                self.bump_if(pair);
                buf.push(b'\n');
            }
            b'x' => buf.push(self.hex_escape(start)?),
            b'u' => self.utf8_escape(buf, start)?,
            b'z' => self.bump_while(is_space),
            b'0'..=b'9' => buf.push(self.decimal_escape(b, start)?),
            _ => return Err(self.fail_here(start, "invalid escape sequence")),
        }
        Ok(())
    }

    /// `\xXX`: exactly two hex digits.
    fn hex_escape(&mut self, start: Mark) -> Result<u8, LuaError> {
        let mut value = 0u8;
        for _ in 0..2 {
            let digit = hex_digit(self.peek())
                .ok_or_else(|| self.fail_here(start, "hexadecimal digit expected"))?;
            self.bump();
            value = (value << 4) | digit as u8;
        }
        Ok(value)
    }

    /// `\u{XXX}`: a code point written in hex, stored as UTF-8.
    fn utf8_escape(&mut self, buf: &mut Vec<u8>, start: Mark) -> Result<(), LuaError> {
        if !self.bump_if(b'{') {
            return Err(self.fail_here(start, "missing '{' in \\u{xxxx}"));
        }
        let mut code = 0u32;
        let mut digits = 0;
        while let Some(d) = hex_digit(self.peek()) {
            self.bump();
            code = code.saturating_mul(16).saturating_add(d);
            digits += 1;
        }
        if digits == 0 || !self.bump_if(b'}') {
            return Err(self.fail_here(start, "missing '}' in \\u{xxxx}"));
        }
        let ch = char::from_u32(code).ok_or_else(|| self.fail_here(start, "UTF-8 value too large"))?;
        let mut utf8 = [0u8; 4];
        buf.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
        Ok(())
    }

    /// `\ddd`: up to three decimal digits, at most 255.
    fn decimal_escape(&mut self, first: u8, start: Mark) -> Result<u8, LuaError> {
        let mut value = u32::from(first - b'0');
        for _ in 0..2 {
            match self.peek() {
                Some(d) if d.is_ascii_digit() => {
                    self.bump();
                    value = value * 10 + u32::from(d - b'0');
                }
                _ => break,
            }
        }
        u8::try_from(value).map_err(|_| self.fail_here(start, "decimal escape too large"))
    }

    // ── Numerals ──────────────────────────────────────────────────────────────

    /// Read a numeral. Letters, digits and dots that follow are taken as part
    /// of it, so `3x` or `1..2` are reported as one malformed numeral.
    fn numeral(&mut self, start: Mark) -> Result<f64, LuaError> {
        let hex = self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X'));
        let exponent: &[u8] = if hex { b"pP" } else { b"eE" };
        if hex {
            self.pos += 2;
        }
        while let Some(b) = self.peek() {
            if exponent.contains(&b) {
                self.bump();
                if matches!(self.peek(), Some(b'+' | b'-')) {
                    self.bump();
                }
            } else if is_name_byte(b) || b == b'.' {
                self.bump();
            } else {
                break;
            }
        }
        parse_numeral(&self.slice(start.offset)).ok_or_else(|| self.fail_here(start, "malformed number"))
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, LuaError>;

    /// Tokens up to and including `Eof`, or up to the first error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.pos > self.src.len() {
            return None;
        }
        let item = self.next_token();
        if matches!(&item, Err(_) | Ok(Token { kind: TokenKind::Eof, .. })) {
            self.pos = self.src.len() + 1;
        }
        Some(item)
    }
}

/// Read a numeral written in source or passed to `tonumber`: decimal or
/// hexadecimal, with optional sign, fraction and exponent.
pub fn parse_numeral(text: &str) -> Option<f64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => parse_hex(hex)?,
        None => parse_decimal(digits)?,
    };
    Some(if negative { -value } else { value })
}

fn parse_decimal(digits: &str) -> Option<f64> {
    let leads = digits.bytes().next().is_some_and(|b| b.is_ascii_digit() || b == b'.');
    let allowed = digits
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'));
    if !leads || !allowed {
        return None;
    }
    digits.parse().ok()
}

fn parse_hex(text: &str) -> Option<f64> {
    let (mantissa, exponent) = match text.split_once(['p', 'P']) {
        Some((m, e)) => (m, Some(e.parse::<i32>().ok()?)),
        None => (text, None),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    let is_integer = exponent.is_none() && !mantissa.contains('.');
    if is_integer {
        // Hex integers wrap like 64-bit two's complement.
        let bits = whole.chars().try_fold(0u64, |acc, c| {
            Some(acc.wrapping_mul(16).wrapping_add(u64::from(c.to_digit(16)?)))
        })?;
        return Some(bits as i64 as f64);
    }
    let mut value = whole
        .chars()
        .try_fold(0f64, |acc, c| Some(acc * 16.0 + f64::from(c.to_digit(16)?)))?;
    let mut scale = 1.0 / 16.0;
    for c in fraction.chars() {
        value += f64::from(c.to_digit(16)?) * scale;
        scale /= 16.0;
    }
    Some(match exponent {
        Some(e) => value * 2f64.powi(e),
        None => value,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn lex_error(src: &str) -> (u32, u32, String, String) {
        match Lexer::new(src).tokenize().unwrap_err() {
            LuaError::Lex {
                line,
                column,
                near,
                message,
            } => (line, column, near, message),
            other => panic!("expected a lexical error, got {other:?}"),
        }
    }

    fn name(s: &str) -> TokenKind {
        TokenKind::Name(s.to_string())
    }

    #[test]
    fn end_of_input_repeats() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
        let mut lexer = Lexer::new("x");
        assert_eq!(lexer.next_token().unwrap().kind, name("x"));
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eof);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn iterator_ends_after_eof() {
        let all: Vec<_> = Lexer::new("a b").map(|t| t.unwrap().kind).collect();
        assert_eq!(all, vec![name("a"), name("b"), TokenKind::Eof]);
    }

    #[test]
    fn comments_and_shebang_are_skipped() {
        assert_eq!(kinds("-- line\n--[==[ long ]] still ]==] x"), vec![name("x"), TokenKind::Eof]);
        assert_eq!(kinds("#!/usr/bin/env lunar\nreturn"), vec![TokenKind::Return, TokenKind::Eof]);
    }

    #[test]
    fn unfinished_long_comment() {
        let (line, _, near, message) = lex_error("x\n--[[ open");
        assert_eq!(line, 2);
        assert_eq!(near, "<eof>");
        assert_eq!(message, "unfinished long comment (starting at line 2)");
    }

    #[test]
    fn numerals() {
        assert_eq!(
            kinds("42 3.5 1e3 .5 0xFF 0x1p4 0x.8"),
            vec![
                TokenKind::Number(42.0),
                TokenKind::Number(3.5),
                TokenKind::Number(1000.0),
                TokenKind::Number(0.5),
                TokenKind::Number(255.0),
                TokenKind::Number(16.0),
                TokenKind::Number(0.5),
                TokenKind::Eof,
            ]
        );
        assert_eq!(kinds("0xffffffffffffffff")[0], TokenKind::Number(-1.0));
    }

    #[test]
    fn malformed_numerals() {
        let (_, column, near, message) = lex_error("x = 3x");
        assert_eq!((column, near.as_str(), message.as_str()), (5, "'3x'", "malformed number"));
        assert_eq!(lex_error("1..2").2, "'1..2'");
        assert_eq!(kinds("1 .. 2")[1], TokenKind::Concat);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds("\"\\n\\t\\\\\\x41\\65\\u{48}\\z\n      end\" 'it''s'"),
            vec![
                TokenKind::Str("\n\t\\AAHend".into()),
                TokenKind::Str("it".into()),
                TokenKind::Str("s".into()),
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("'a\\\nb'")[0], TokenKind::Str("a\nb".into()));
    }

    #[test]
    fn bad_escapes() {
        assert_eq!(lex_error(r#""\q""#).3, "invalid escape sequence");
        assert_eq!(lex_error(r#""\xZZ""#).3, "hexadecimal digit expected");
        assert_eq!(lex_error(r#""\300""#).3, "decimal escape too large");
        assert_eq!(lex_error(r#""\u{41""#).3, "missing '}' in \\u{xxxx}");
    }

    #[test]
    fn long_strings() {
        assert_eq!(kinds("[==[\nhello]]x]==]")[0], TokenKind::Str("hello]]x".into()));
        assert_eq!(kinds("[[a]=]b]]")[0], TokenKind::Str("a]=]b".into()));
        assert_eq!(kinds("t[ [[k]] ]")[1], TokenKind::LBracket);
    }

    #[test]
    fn unfinished_string_points_at_the_quote() {
        let (line, column, _, message) = lex_error("x = \"no close\ny");
        assert_eq!((line, column), (1, 5));
        assert_eq!(message, "unfinished string");
    }

    #[test]
    fn stray_character() {
        let (line, column, near, message) = lex_error("local a\n  @");
        assert_eq!((line, column), (2, 3));
        assert_eq!(near, "'@'");
        assert_eq!(message, "unexpected symbol");
    }

    #[test]
    fn keywords_names_and_operators() {
        assert_eq!(
            kinds("if elseif goto_ // ~= << >= :: ... ~"),
            vec![
                TokenKind::If,
                TokenKind::ElseIf,
                name("goto_"),
                TokenKind::DoubleSlash,
                TokenKind::NotEq,
                TokenKind::Shl,
                TokenKind::Ge,
                TokenKind::DoubleColon,
                TokenKind::Ellipsis,
                TokenKind::Tilde,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn positions_and_lexemes() {
        let tokens = Lexer::new("a\n  bb c").tokenize().unwrap();
        let at: Vec<(u32, u32)> = tokens.iter().map(|t| (t.line, t.column)).collect();
        assert_eq!(at, vec![(1, 1), (2, 3), (2, 6), (2, 7)]);
        assert_eq!(tokens[1].lexeme, "bb");
        assert_eq!(tokens[3].describe(), "<eof>");
    }

    #[test]
    fn relexing_lexemes_is_stable() {
        let src = "local s = 'tab\\t\\\"q\\\" \\65\\u{48}\\z\n   end' -- trailing comment\n\
                   t[ [==[long ]] ]=]\nbody]==] ] = 0x1F + 0xA.8p1 * 3e-2 // 1.5E+3 --[[ block\ncomment ]]\n\
                   x = a..b ~= c >> 2 <= #t and not y or {...} :: done ::";
        let first = Lexer::new(src).tokenize().unwrap();
        let again = Lexer::new(src).tokenize().unwrap();
        assert_eq!(first, again);

        let joined = first.iter().map(|t| t.lexeme.as_str()).collect::<Vec<_>>().join(" ");
        let relexed = Lexer::new(&joined).tokenize().unwrap();
        let kinds_of = |tokens: &[Token]| tokens.iter().map(|t| t.kind.clone()).collect::<Vec<_>>();
        assert_eq!(kinds_of(&relexed), kinds_of(&first));
        assert!(first.iter().any(|t| t.kind == TokenKind::Str("long ]] ]=]\nbody".into())));
        assert!(first.iter().any(|t| t.kind == TokenKind::Number(21.0)));
    }

    #[test]
    fn parse_numeral_forms() {
        assert_eq!(parse_numeral(""), None);
        assert_eq!(parse_numeral("1e"), None);
        assert_eq!(parse_numeral("abc"), None);
        assert_eq!(parse_numeral("0x"), None);
        assert_eq!(parse_numeral("-0x10"), Some(-16.0));
        assert_eq!(parse_numeral("+5."), Some(5.0));
        assert_eq!(parse_numeral("0x1P-1"), Some(0.5));
    }
}
