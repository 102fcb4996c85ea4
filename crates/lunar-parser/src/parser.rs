use crate::ast::*;
use lunar_core::config::MAX_SYNTAX_DEPTH;
use lunar_core::LuaError;
use lunar_lexer::{Lexer, Token, TokenKind};
use tracing::debug;

/// Recursive-descent parser with one token of lookahead.
///
/// ```
/// use lunar_parser::Parser;
///
/// let block = Parser::new("local x = 1 + 2").unwrap().parse().unwrap();
/// assert_eq!(block.stmts.len(), 1);
/// ```
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    tok: Token,
    peeked: Option<Token>,
    /// Current nesting of blocks and expressions.
    depth: usize,
}

impl<'src> Parser<'src> {
    /// Start parsing `src`. Fails when the very first token is malformed.
    pub fn new(src: &'src str) -> Result<Self, LuaError> {
        let mut lexer = Lexer::new(src);
        let tok = lexer.next_token()?;
        Ok(Self {
            lexer,
            tok,
            peeked: None,
            depth: 0,
        })
    }

    /// Parse a whole chunk.
    pub fn parse(mut self) -> Result<Block, LuaError> {
        let block = self.block()?;
        if !self.at(&TokenKind::Eof) {
            return Err(self.error("'<eof>' expected"));
        }
        debug!(target: "lunar::parser", stmts = block.stmts.len(), "parsed chunk");
        Ok(block)
    }
}

// ── Token stream ──────────────────────────────────────────────────────────────

impl Parser<'_> {
    pub(crate) fn kind(&self) -> &TokenKind {
        &self.tok.kind
    }

    pub(crate) fn line(&self) -> Line {
        self.tok.line
    }

    pub(crate) fn at(&self, kind: &TokenKind) -> bool {
        self.kind() == kind
    }

    /// The token after the current one.
    pub(crate) fn lookahead(&mut self) -> Result<&TokenKind, LuaError> {
        let peeked = match self.peeked.take() {
            Some(tok) => tok,
            None => self.lexer.next_token()?,
        };
        Ok(&self.peeked.insert(peeked).kind)
    }

    /// Step past the current token and hand it back.
    pub(crate) fn bump(&mut self) -> Result<Token, LuaError> {
        let next = match self.peeked.take() {
            Some(tok) => tok,
            None => self.lexer.next_token()?,
        };
        Ok(std::mem::replace(&mut self.tok, next))
    }

    pub(crate) fn accept(&mut self, kind: &TokenKind) -> Result<bool, LuaError> {
        let hit = self.at(kind);
        if hit {
            self.bump()?;
        }
        Ok(hit)
    }

    pub(crate) fn expect(&mut self, kind: TokenKind) -> Result<(), LuaError> {
        if !self.accept(&kind)? {
            return Err(self.error(format!("{kind} expected")));
        }
        Ok(())
    }

    /// Expect `close`, naming `open` from `line` when they are on different
    /// lines.
    pub(crate) fn expect_match(&mut self, close: TokenKind, open: TokenKind, line: Line) -> Result<(), LuaError> {
        if self.accept(&close)? {
            return Ok(());
        }
        let message = if line == self.line() {
            format!("{close} expected")
        } else {
            format!("{close} expected (to close {open} at line {line})")
        };
        Err(self.error(message))
    }

    pub(crate) fn name(&mut self) -> Result<String, LuaError> {
        if !matches!(self.kind(), TokenKind::Name(_)) {
            return Err(self.error("<name> expected"));
        }
        match self.bump()?.kind {
            TokenKind::Name(name) => Ok(name),
            _ => Err(self.error("<name> expected")),
        }
    }

    /// Go one nesting level deeper. Callers restore `depth` when done.
    pub(crate) fn enter(&mut self) -> Result<(), LuaError> {
        self.depth += 1;
        if self.depth > MAX_SYNTAX_DEPTH {
            return Err(self.error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn restore_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Syntax error at the current token.
    pub(crate) fn error(&self, message: impl Into<String>) -> LuaError {
        LuaError::Syntax {
            line: self.tok.line,
            column: self.tok.column,
            near: self.tok.describe(),
            message: message.into(),
        }
    }
}

// ── Statements ────────────────────────────────────────────────────────────────

impl Parser<'_> {
    /// Tokens that close a block.
    fn block_follows(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::Eof | TokenKind::End | TokenKind::Else | TokenKind::ElseIf | TokenKind::Until
        )
    }

    pub(crate) fn block(&mut self) -> Result<Block, LuaError> {
        let outer = self.depth;
        self.enter()?;
        let mut stmts = Vec::new();
        let mut ret = None;
        while !self.block_follows() {
            if self.at(&TokenKind::Return) {
                ret = Some(self.return_statement()?);
                break;
            }
            if let Some(stmt) = self.statement()? {
                stmts.push(stmt);
            }
        }
        self.depth = outer;
        Ok(Block {
            stmts,
            ret,
            end_line: self.line(),
        })
    }

    fn return_statement(&mut self) -> Result<Return, LuaError> {
        let line = self.line();
        self.bump()?;
        let values = if self.block_follows() || self.at(&TokenKind::Semi) {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.accept(&TokenKind::Semi)?;
        if !self.block_follows() {
            return Err(self.error("'<eof>' expected"));
        }
        Ok(Return { values, line })
    }

    /// One statement; `None` for a lone `;`.
    fn statement(&mut self) -> Result<Option<Stmt>, LuaError> {
        let line = self.line();
        let kind = match self.kind() {
            TokenKind::Semi => {
                self.bump()?;
                return Ok(None);
            }
            TokenKind::If => self.if_statement(line)?,
            TokenKind::While => {
                self.bump()?;
                let cond = self.expr()?;
                self.expect(TokenKind::Do)?;
                let body = self.block()?;
                self.expect_match(TokenKind::End, TokenKind::While, line)?;
                StmtKind::While { cond, body }
            }
            TokenKind::Do => {
                self.bump()?;
                let body = self.block()?;
                self.expect_match(TokenKind::End, TokenKind::Do, line)?;
                StmtKind::Do(body)
            }
            TokenKind::For => self.for_statement(line)?,
            TokenKind::Repeat => {
                self.bump()?;
                let body = self.block()?;
                self.expect_match(TokenKind::Until, TokenKind::Repeat, line)?;
                let cond = self.expr()?;
                StmtKind::Repeat { body, cond }
            }
            TokenKind::Function => self.function_statement(line)?,
            TokenKind::Local => self.local_statement(line)?,
            TokenKind::DoubleColon => {
                self.bump()?;
                let name = self.name()?;
                self.expect(TokenKind::DoubleColon)?;
                StmtKind::Label(name)
            }
            TokenKind::Goto => {
                self.bump()?;
                StmtKind::Goto(self.name()?)
            }
            TokenKind::Break => {
                self.bump()?;
                StmtKind::Break
            }
            _ => self.expr_statement()?,
        };
        Ok(Some(Stmt { kind, line }))
    }

    fn if_statement(&mut self, line: Line) -> Result<StmtKind, LuaError> {
        let mut arms = Vec::new();
        // The first arm is opened by `if`, later ones by `elseif`.
        loop {
            self.bump()?;
            let cond = self.expr()?;
            self.expect(TokenKind::Then)?;
            arms.push((cond, self.block()?));
            if !self.at(&TokenKind::ElseIf) {
                break;
            }
        }
        let otherwise = if self.accept(&TokenKind::Else)? {
            Some(self.block()?)
        } else {
            None
        };
        self.expect_match(TokenKind::End, TokenKind::If, line)?;
        Ok(StmtKind::If { arms, otherwise })
    }

    fn for_statement(&mut self, line: Line) -> Result<StmtKind, LuaError> {
        self.bump()?;
        let first = self.name()?;
        let kind = match self.kind() {
            TokenKind::Assign => {
                self.bump()?;
                let start = self.expr()?;
                self.expect(TokenKind::Comma)?;
                let limit = self.expr()?;
                let step = if self.accept(&TokenKind::Comma)? {
                    Some(self.expr()?)
                } else {
                    None
                };
                self.expect(TokenKind::Do)?;
                let body = self.block()?;
                StmtKind::NumericFor {
                    var: first,
                    start,
                    limit,
                    step,
                    body,
                }
            }
            TokenKind::Comma | TokenKind::In => {
                let mut vars = vec![first];
                while self.accept(&TokenKind::Comma)? {
                    vars.push(self.name()?);
                }
                self.expect(TokenKind::In)?;
                let exprs = self.expr_list()?;
                self.expect(TokenKind::Do)?;
                let body = self.block()?;
                StmtKind::GenericFor { vars, exprs, body }
            }
            _ => return Err(self.error("'=' or 'in' expected")),
        };
        self.expect_match(TokenKind::End, TokenKind::For, line)?;
        Ok(kind)
    }

    /// `function a.b.c:m(...)`
    fn function_statement(&mut self, line: Line) -> Result<StmtKind, LuaError> {
        self.bump()?;
        let root = self.name()?;
        let mut fields = Vec::new();
        while self.accept(&TokenKind::Dot)? {
            fields.push(self.name()?);
        }
        let method = if self.accept(&TokenKind::Colon)? {
            Some(self.name()?)
        } else {
            None
        };
        let func = self.function_body(method.is_some(), line)?;
        Ok(StmtKind::Function {
            path: FuncPath {
                root,
                fields,
                method,
            },
            func: Box::new(func),
        })
    }

    fn local_statement(&mut self, line: Line) -> Result<StmtKind, LuaError> {
        self.bump()?;
        if self.accept(&TokenKind::Function)? {
            let name = self.name()?;
            let func = self.function_body(false, line)?;
            return Ok(StmtKind::LocalFunction {
                name,
                func: Box::new(func),
            });
        }
        let mut bindings = Vec::new();
        loop {
            let name = self.name()?;
            let attrib = if self.accept(&TokenKind::Lt)? {
                let attrib = self.name()?;
                self.expect(TokenKind::Gt)?;
                Some(attrib)
            } else {
                None
            };
            bindings.push(Binding { name, attrib });
            if !self.accept(&TokenKind::Comma)? {
                break;
            }
        }
        let values = if self.accept(&TokenKind::Assign)? {
            self.expr_list()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::Local { bindings, values })
    }

    /// A call, or the start of an assignment.
    fn expr_statement(&mut self) -> Result<StmtKind, LuaError> {
        let first = self.suffixed_expr()?;
        if !matches!(self.kind(), TokenKind::Assign | TokenKind::Comma) {
            if first.is_call() {
                return Ok(StmtKind::Call(first));
            }
            return Err(self.error("syntax error"));
        }
        let mut targets = vec![first];
        while self.accept(&TokenKind::Comma)? {
            targets.push(self.suffixed_expr()?);
        }
        self.expect(TokenKind::Assign)?;
        let values = self.expr_list()?;
        Ok(StmtKind::Assign { targets, values })
    }

    /// `(params) block end`; `line` is where the `function` keyword was.
    pub(crate) fn function_body(&mut self, method: bool, line: Line) -> Result<Function, LuaError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.at(&TokenKind::RParen) {
            loop {
                if self.accept(&TokenKind::Ellipsis)? {
                    is_vararg = true;
                    break;
                }
                params.push(self.name()?);
                if !self.accept(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.block()?;
        self.expect_match(TokenKind::End, TokenKind::Function, line)?;
        Ok(Function {
            params,
            is_vararg,
            body,
            line,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Block {
        Parser::new(src).unwrap().parse().unwrap()
    }

    fn kinds(src: &str) -> Vec<StmtKind> {
        parse(src).stmts.into_iter().map(|s| s.kind).collect()
    }

    /// `message near token` of a syntax error.
    fn syntax_error(src: &str) -> String {
        match Parser::new(src).unwrap().parse().unwrap_err() {
            LuaError::Syntax { message, near, .. } => format!("{message} near {near}"),
            other => panic!("expected a syntax error, got {other:?}"),
        }
    }

    #[test]
    fn empty_chunks() {
        let b = parse("");
        assert!(b.stmts.is_empty() && b.ret.is_none());
        let b = parse(";;return;");
        assert!(b.stmts.is_empty());
        assert!(b.ret.unwrap().values.is_empty());
    }

    #[test]
    fn statement_lines() {
        let b = parse("x = 1\n\nf()\nreturn x");
        let lines: Vec<Line> = b.stmts.iter().map(|s| s.line).collect();
        assert_eq!(lines, vec![1, 3]);
        assert_eq!(b.ret.unwrap().line, 4);
    }

    #[test]
    fn local_bindings_keep_attributes() {
        match &kinds("local x <const>, y <close>, z = 1")[0] {
            StmtKind::Local { bindings, values } => {
                let attribs: Vec<_> = bindings.iter().map(|b| b.attrib.as_deref()).collect();
                assert_eq!(attribs, vec![Some("const"), Some("close"), None]);
                assert_eq!(values.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn loops() {
        let k = kinds("while true do end for i = 1, 10, 2 do end for k, v in pairs(t) do end repeat until x");
        assert!(matches!(&k[0], StmtKind::While { .. }));
        assert!(matches!(&k[1], StmtKind::NumericFor { var, step: Some(_), .. } if var == "i"));
        assert!(matches!(&k[2], StmtKind::GenericFor { vars, exprs, .. } if vars.len() == 2 && exprs.len() == 1));
        assert!(matches!(&k[3], StmtKind::Repeat { .. }));
    }

    #[test]
    fn if_chain() {
        match &kinds("if a then elseif b then elseif c then else x() end")[0] {
            StmtKind::If { arms, otherwise } => {
                assert_eq!(arms.len(), 3);
                assert_eq!(otherwise.as_ref().map(|b| b.stmts.len()), Some(1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn method_definition_adds_self() {
        match &kinds("function a.b:c(x, ...) end")[0] {
            StmtKind::Function { path, func } => {
                assert_eq!(path.root, "a");
                assert_eq!(path.fields, vec!["b"]);
                assert_eq!(path.method.as_deref(), Some("c"));
                assert_eq!(func.params, vec!["self", "x"]);
                assert!(func.is_vararg);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn calls_and_assignments() {
        let k = kinds(r#"f() f"s" f{1} o:m(1) a, t.x, t[1] = 1, 2"#);
        assert_eq!(k.len(), 5);
        assert!(matches!(&k[3], StmtKind::Call(e) if matches!(e.kind, ExprKind::Method { .. })));
        assert!(matches!(&k[4], StmtKind::Assign { targets, values } if targets.len() == 3 && values.len() == 2));
    }

    #[test]
    fn labels_and_jumps_parse_anywhere() {
        // placement of break and goto is checked by the compiler
        let k = kinds("::top:: goto top break");
        assert_eq!(k, vec![StmtKind::Label("top".into()), StmtKind::Goto("top".into()), StmtKind::Break]);
    }

    #[test]
    fn unclosed_block_names_its_opener() {
        assert_eq!(
            syntax_error("while true do\n x = 1"),
            "'end' expected (to close 'while' at line 1) near <eof>"
        );
        assert_eq!(syntax_error("do x = 1"), "'end' expected near <eof>");
        assert_eq!(
            syntax_error("f(1,\n2"),
            "')' expected (to close '(' at line 1) near <eof>"
        );
    }

    #[test]
    fn misplaced_tokens() {
        assert_eq!(syntax_error("if true end"), "'then' expected near 'end'");
        assert_eq!(syntax_error("x = 1 else"), "'<eof>' expected near 'else'");
        assert_eq!(syntax_error("for i do end"), "'=' or 'in' expected near 'do'");
        assert_eq!(syntax_error("return 1 x = 2"), "'<eof>' expected near 'x'");
    }

    #[test]
    fn malformed_function_header() {
        assert_eq!(syntax_error("function f(a, 1) end"), "<name> expected near '1'");
        assert_eq!(syntax_error("function (a) end"), "<name> expected near '('");
    }

    #[test]
    fn expression_statement_must_be_call() {
        assert_eq!(syntax_error("x"), "syntax error near <eof>");
        assert_eq!(syntax_error("(f)"), "syntax error near <eof>");
        assert_eq!(syntax_error("1 + 1"), "unexpected symbol near '1'");
    }

    #[test]
    fn nesting_is_bounded() {
        let deep = format!("return {}1{}", "(".repeat(1000), ")".repeat(1000));
        assert_eq!(syntax_error(&deep), "chunk has too many syntax levels near '('");
        let tables = format!("return {}{}", "{".repeat(1000), "}".repeat(1000));
        assert!(syntax_error(&tables).starts_with("chunk has too many syntax levels"));
        let funcs = format!("return {}1{}", "function() return ".repeat(1000), " end".repeat(1000));
        assert!(syntax_error(&funcs).starts_with("chunk has too many syntax levels"));
        let blocks = format!("{}{}", "do ".repeat(1000), "end ".repeat(1000));
        assert!(syntax_error(&blocks).starts_with("chunk has too many syntax levels"));
    }

    #[test]
    fn long_chains_count_as_nesting() {
        let sum = format!("return 1{}", " + 1".repeat(300));
        assert!(syntax_error(&sum).starts_with("chunk has too many syntax levels"));
        let path = format!("return t{}", ".a".repeat(300));
        assert!(syntax_error(&path).starts_with("chunk has too many syntax levels"));
        let unary = format!("return {}1", "- ".repeat(300));
        assert!(syntax_error(&unary).starts_with("chunk has too many syntax levels"));
    }

    #[test]
    fn moderate_nesting_still_parses() {
        parse(&format!("return {}1{}", "(".repeat(50), ")".repeat(50)));
        parse(&format!("return 1{}", " + 1".repeat(50)));
        parse(&format!("{}{}", "do ".repeat(50), "end ".repeat(50)));
        parse(&format!("return t{}", ".a".repeat(50)));
    }

    #[test]
    fn syntax_error_position() {
        match Parser::new("local x =\n  = 2").unwrap().parse().unwrap_err() {
            LuaError::Syntax { line, column, .. } => assert_eq!((line, column), (2, 3)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
