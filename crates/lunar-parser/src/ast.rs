//! Syntax tree.
//!
//! Every statement and expression is a node carrying its kind and the line
//! it starts on. Sugar is removed while parsing: `t.k` is an index with a
//! string key, `f"s"` and `f{...}` are calls with one argument, and
//! `Name = v` in a constructor is a keyed item.

use lunar_core::ArithOp;

pub type Line = u32;

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    /// Trailing `return`; nothing may follow it in the block.
    pub ret: Option<Return>,
    /// Line of the token that ends the block.
    pub end_line: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Return {
    pub values: Vec<Expr>,
    pub line: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `a, b.c = x, y`; targets are names or index expressions.
    Assign { targets: Vec<Expr>, values: Vec<Expr> },
    Local { bindings: Vec<Binding>, values: Vec<Expr> },
    /// A call evaluated for its effects.
    Call(Expr),
    Do(Block),
    While { cond: Expr, body: Block },
    /// The condition is evaluated inside the body's scope.
    Repeat { body: Block, cond: Expr },
    /// `if`/`elseif` arms in order, then the `else` block.
    If { arms: Vec<(Expr, Block)>, otherwise: Option<Block> },
    NumericFor {
        var: String,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },
    GenericFor { vars: Vec<String>, exprs: Vec<Expr>, body: Block },
    /// `function a.b:c() ... end`
    Function { path: FuncPath, func: Box<Function> },
    LocalFunction { name: String, func: Box<Function> },
    Goto(String),
    Label(String),
    Break,
}

/// One name of a `local` statement with its `<attrib>`, unvalidated.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub attrib: Option<String>,
}

/// Name of a function statement: `root.fields[0]...:method`.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncPath {
    pub root: String,
    pub fields: Vec<String>,
    pub method: Option<String>,
}

/// Parameters and body of a function literal. Methods list `self` first.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub params: Vec<String>,
    pub is_vararg: bool,
    pub body: Block,
    pub line: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Nil,
    True,
    False,
    Number(f64),
    Str(String),
    Vararg,
    Name(String),
    Index { table: Box<Expr>, key: Box<Expr> },
    Call { func: Box<Expr>, args: Vec<Expr> },
    /// `obj:name(args)`; `obj` is evaluated once.
    Method { obj: Box<Expr>, name: String, args: Vec<Expr> },
    Function(Box<Function>),
    Table(Vec<TableItem>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Unary { op: UnOp, operand: Box<Expr> },
    /// Parentheses cut a call or `...` down to one value.
    Paren(Box<Expr>),
}

impl Expr {
    pub fn new(kind: ExprKind, line: Line) -> Self {
        Self { kind, line }
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, ExprKind::Call { .. } | ExprKind::Method { .. })
    }

    /// Calls and `...` produce a variable number of values.
    pub fn is_multi(&self) -> bool {
        self.is_call() || matches!(self.kind, ExprKind::Vararg)
    }

    /// The literal string, when this expression is one.
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableItem {
    /// Takes the next array index.
    Positional(Expr),
    Keyed(Expr, Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Arith(ArithOp),
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Left and right binding power; a lower right power makes the
    /// operator right associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::Arith(ArithOp::BOr) => (4, 4),
            BinOp::Arith(ArithOp::BXor) => (5, 5),
            BinOp::Arith(ArithOp::BAnd) => (6, 6),
            BinOp::Arith(ArithOp::Shl | ArithOp::Shr) => (7, 7),
            BinOp::Concat => (9, 8),
            BinOp::Arith(ArithOp::Add | ArithOp::Sub) => (10, 10),
            BinOp::Arith(ArithOp::Pow) => (14, 13),
            BinOp::Arith(ArithOp::Mul | ArithOp::Div | ArithOp::IDiv | ArithOp::Mod) => (11, 11),
        }
    }
}

/// Binding power of the unary operators: above every binary operator but `^`.
pub const UNARY_PRIORITY: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
    BNot,
}
