//! Expression parsing: operator precedence, suffixes and constructors.

use crate::ast::*;
use crate::parser::Parser;
use lunar_core::{ArithOp, LuaError};
use lunar_lexer::TokenKind;

/// The binary operator a token spells, if any.
fn binary_op(kind: &TokenKind) -> Option<BinOp> {
    let op = match kind {
        TokenKind::Plus => BinOp::Arith(ArithOp::Add),
        TokenKind::Minus => BinOp::Arith(ArithOp::Sub),
        TokenKind::Star => BinOp::Arith(ArithOp::Mul),
        TokenKind::Slash => BinOp::Arith(ArithOp::Div),
        TokenKind::DoubleSlash => BinOp::Arith(ArithOp::IDiv),
        TokenKind::Percent => BinOp::Arith(ArithOp::Mod),
        TokenKind::Caret => BinOp::Arith(ArithOp::Pow),
        TokenKind::Amp => BinOp::Arith(ArithOp::BAnd),
        TokenKind::Pipe => BinOp::Arith(ArithOp::BOr),
        TokenKind::Tilde => BinOp::Arith(ArithOp::BXor),
        TokenKind::Shl => BinOp::Arith(ArithOp::Shl),
        TokenKind::Shr => BinOp::Arith(ArithOp::Shr),
        TokenKind::Concat => BinOp::Concat,
        TokenKind::EqEq => BinOp::Eq,
        TokenKind::NotEq => BinOp::Ne,
        TokenKind::Lt => BinOp::Lt,
        TokenKind::Le => BinOp::Le,
        TokenKind::Gt => BinOp::Gt,
        TokenKind::Ge => BinOp::Ge,
        TokenKind::And => BinOp::And,
        TokenKind::Or => BinOp::Or,
        _ => return None,
    };
    Some(op)
}

fn unary_op(kind: &TokenKind) -> Option<UnOp> {
    match kind {
        TokenKind::Minus => Some(UnOp::Neg),
        TokenKind::Not => Some(UnOp::Not),
        TokenKind::Hash => Some(UnOp::Len),
        TokenKind::Tilde => Some(UnOp::BNot),
        _ => None,
    }
}

impl Parser<'_> {
    pub(crate) fn expr(&mut self) -> Result<Expr, LuaError> {
        self.subexpr(0)
    }

    pub(crate) fn expr_list(&mut self) -> Result<Vec<Expr>, LuaError> {
        let mut list = vec![self.expr()?];
        while self.accept(&TokenKind::Comma)? {
            list.push(self.expr()?);
        }
        Ok(list)
    }

    /// Operators binding tighter than `limit`, by precedence climbing.
    /// Each operator applied to `lhs` nests the tree one level deeper, so it
    /// counts against the nesting limit like a parenthesis does.
    fn subexpr(&mut self, limit: u8) -> Result<Expr, LuaError> {
        let outer = self.depth();
        self.enter()?;
        let line = self.line();
        let mut lhs = match unary_op(self.kind()) {
            Some(op) => {
                self.bump()?;
                let operand = self.subexpr(UNARY_PRIORITY)?;
                Expr::new(
                    ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    line,
                )
            }
            None => self.simple_expr()?,
        };
        while let Some(op) = binary_op(self.kind()) {
            let (left, right) = op.priority();
            if left <= limit {
                break;
            }
            self.enter()?;
            let line = self.line();
            self.bump()?;
            let rhs = self.subexpr(right)?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
            );
        }
        self.restore_depth(outer);
        Ok(lhs)
    }

    fn simple_expr(&mut self) -> Result<Expr, LuaError> {
        let line = self.line();
        let kind = match self.kind() {
            TokenKind::Nil => ExprKind::Nil,
            TokenKind::True => ExprKind::True,
            TokenKind::False => ExprKind::False,
            TokenKind::Ellipsis => ExprKind::Vararg,
            TokenKind::Number(n) => ExprKind::Number(*n),
            TokenKind::Str(_) => match self.bump()?.kind {
                TokenKind::Str(s) => return Ok(Expr::new(ExprKind::Str(s), line)),
                _ => return Err(self.error("<string> expected")),
            },
            TokenKind::LBrace => return self.table_constructor(),
            TokenKind::Function => {
                self.bump()?;
                let func = self.function_body(false, line)?;
                return Ok(Expr::new(ExprKind::Function(Box::new(func)), line));
            }
            _ => return self.suffixed_expr(),
        };
        self.bump()?;
        Ok(Expr::new(kind, line))
    }

    fn primary_expr(&mut self) -> Result<Expr, LuaError> {
        let line = self.line();
        match self.kind() {
            TokenKind::Name(_) => {
                let name = self.name()?;
                Ok(Expr::new(ExprKind::Name(name), line))
            }
            TokenKind::LParen => {
                self.bump()?;
                let inner = self.expr()?;
                self.expect_match(TokenKind::RParen, TokenKind::LParen, line)?;
                Ok(Expr::new(ExprKind::Paren(Box::new(inner)), line))
            }
            _ => Err(self.error("unexpected symbol")),
        }
    }

    /// A primary expression followed by any run of `.k`, `[k]`, `:m(...)`
    /// and call suffixes.
    pub(crate) fn suffixed_expr(&mut self) -> Result<Expr, LuaError> {
        let outer = self.depth();
        let mut expr = self.primary_expr()?;
        loop {
            let line = self.line();
            let kind = match self.kind() {
                TokenKind::Dot => {
                    self.bump()?;
                    let key = Expr::new(ExprKind::Str(self.name()?), line);
                    ExprKind::Index {
                        table: Box::new(expr),
                        key: Box::new(key),
                    }
                }
                TokenKind::LBracket => {
                    self.bump()?;
                    let key = self.expr()?;
                    self.expect(TokenKind::RBracket)?;
                    ExprKind::Index {
                        table: Box::new(expr),
                        key: Box::new(key),
                    }
                }
                TokenKind::Colon => {
                    self.bump()?;
                    let name = self.name()?;
                    let args = self.call_args()?;
                    ExprKind::Method {
                        obj: Box::new(expr),
                        name,
                        args,
                    }
                }
                TokenKind::LParen | TokenKind::Str(_) | TokenKind::LBrace => ExprKind::Call {
                    func: Box::new(expr),
                    args: self.call_args()?,
                },
                _ => {
                    self.restore_depth(outer);
                    return Ok(expr);
                }
            };
            expr = Expr::new(kind, line);
            self.enter()?;
        }
    }

    /// `(a, b)`, `"s"` or `{...}`.
    fn call_args(&mut self) -> Result<Vec<Expr>, LuaError> {
        let line = self.line();
        match self.kind() {
            TokenKind::Str(_) | TokenKind::LBrace => Ok(vec![self.simple_expr()?]),
            TokenKind::LParen => {
                self.bump()?;
                let args = if self.at(&TokenKind::RParen) {
                    Vec::new()
                } else {
                    self.expr_list()?
                };
                self.expect_match(TokenKind::RParen, TokenKind::LParen, line)?;
                Ok(args)
            }
            _ => Err(self.error("function arguments expected")),
        }
    }

    fn table_constructor(&mut self) -> Result<Expr, LuaError> {
        let line = self.line();
        self.expect(TokenKind::LBrace)?;
        let mut items = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            items.push(self.table_item()?);
            if !self.accept(&TokenKind::Comma)? && !self.accept(&TokenKind::Semi)? {
                break;
            }
        }
        self.expect_match(TokenKind::RBrace, TokenKind::LBrace, line)?;
        Ok(Expr::new(ExprKind::Table(items), line))
    }

    fn table_item(&mut self) -> Result<TableItem, LuaError> {
        if self.accept(&TokenKind::LBracket)? {
            let key = self.expr()?;
            self.expect(TokenKind::RBracket)?;
            self.expect(TokenKind::Assign)?;
            return Ok(TableItem::Keyed(key, self.expr()?));
        }
        let named = matches!(self.kind(), TokenKind::Name(_)) && *self.lookahead()? == TokenKind::Assign;
        if named {
            let line = self.line();
            let key = Expr::new(ExprKind::Str(self.name()?), line);
            self.bump()?;
            return Ok(TableItem::Keyed(key, self.expr()?));
        }
        Ok(TableItem::Positional(self.expr()?))
    }
}
