//! Function prototypes produced by the compiler.

use crate::opcode::OpCode;
use std::fmt;
use std::rc::Rc;

// ── Constants ─────────────────────────────────────────────────────────────────

/// A literal stored in a prototype's constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Number(f64),
    Str(Rc<str>),
}

impl Constant {
    /// Identity used for pool deduplication. Numbers compare by bit pattern
    /// so `0.0` and `-0.0` keep separate slots and NaN still deduplicates.
    pub fn same_as(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Nil, Constant::Nil) => true,
            (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Boolean(b) => write!(f, "{b}"),
            Constant::Number(n) => write!(f, "{n}"),
            Constant::Str(s) => write!(f, "{s:?}"),
        }
    }
}

// ── Upvalue descriptors ───────────────────────────────────────────────────────

/// Describes where to find an upvalue at closure instantiation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueDesc {
    /// Capture the local at register `reg` in the immediately enclosing frame.
    Stack(u8),
    /// Re-use upvalue `idx` of the enclosing closure.
    Upvalue(u8),
}

// ── Function prototype ────────────────────────────────────────────────────────

/// A compiled function, immutable after compilation.
///
/// Every function (the top-level chunk or a nested literal) compiles to a
/// `Proto`. Closures share it through `Rc`; upvalue cells are per closure.
#[derive(Debug)]
pub struct Proto {
    pub instructions: Vec<OpCode>,
    /// Source line of each instruction, parallel to `instructions`.
    pub lines: Vec<u32>,
    pub constants: Vec<Constant>,
    /// Global and field names referenced by `GetGlobal`, `GetField` and friends.
    pub names: Vec<Rc<str>>,
    /// Nested function prototypes referenced by `Closure`.
    pub protos: Vec<Rc<Proto>>,
    pub upvalue_descs: Vec<UpvalueDesc>,
    /// Debug names of the upvalues, parallel to `upvalue_descs`.
    pub upvalue_names: Vec<Rc<str>>,
    pub param_count: u8,
    pub is_vararg: bool,
    /// Registers the function needs, including temporaries.
    pub frame_size: u8,
    /// Chunk name used as the prefix of runtime error positions.
    pub source: Rc<str>,
    pub line_defined: u32,
}

impl Default for Proto {
    fn default() -> Self {
        Self {
            instructions: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            protos: Vec::new(),
            upvalue_descs: Vec::new(),
            upvalue_names: Vec::new(),
            param_count: 0,
            is_vararg: false,
            frame_size: 0,
            source: Rc::from("?"),
            line_defined: 0,
        }
    }
}

impl Proto {
    /// Source line of the instruction at `pc`, or `line_defined` when out of range.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(self.line_defined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_dedup_identity() {
        assert!(Constant::Number(f64::NAN).same_as(&Constant::Number(f64::NAN)));
        assert!(!Constant::Number(0.0).same_as(&Constant::Number(-0.0)));
        assert!(Constant::Str("a".into()).same_as(&Constant::Str("a".into())));
        assert!(!Constant::Nil.same_as(&Constant::Boolean(false)));
    }

    #[test]
    fn line_at_falls_back_to_definition() {
        let proto = Proto {
            lines: vec![4, 5],
            line_defined: 3,
            ..Proto::default()
        };
        assert_eq!(proto.line_at(1), 5);
        assert_eq!(proto.line_at(9), 3);
    }
}
