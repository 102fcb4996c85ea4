//! Bytecode instruction set for the lunar virtual machine.
//!
//! Register-based, loosely modelled on the PUC-Lua 5.4 opcode set. Operands
//! are typed fields rather than packed bit ranges; registers are relative to
//! the current frame's base.

/// Operand value meaning "as many as there are" for argument, result and
/// value counts. The actual extent is carried by the thread's `top` marker.
pub const MULTI: u8 = u8::MAX;

/// Binary arithmetic and bitwise operators sharing one opcode shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    /// Metamethod consulted when an operand is not a number.
    pub fn event(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::IDiv => "__idiv",
            ArithOp::BAnd => "__band",
            ArithOp::BOr => "__bor",
            ArithOp::BXor => "__bxor",
            ArithOp::Shl => "__shl",
            ArithOp::Shr => "__shr",
        }
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Load constant `const_idx` into `dst`.
    LoadConst { dst: u8, const_idx: u16 },
    /// Set `count` registers starting at `dst` to nil.
    LoadNil { dst: u8, count: u8 },
    LoadBool { dst: u8, value: bool },
    Move { dst: u8, src: u8 },

    // ── Arithmetic / bitwise ────────────────────────────────────────────────
    Arith { op: ArithOp, dst: u8, lhs: u8, rhs: u8 },
    /// Unary minus
    Unm { dst: u8, src: u8 },
    BNot { dst: u8, src: u8 },
    Not { dst: u8, src: u8 },
    Len { dst: u8, src: u8 },
    /// `dst = R[start] .. R[start+1] .. ... .. R[start+count-1]`
    Concat { dst: u8, start: u8, count: u8 },

    // ── Comparison (boolean result in `dst`) ────────────────────────────────
    Eq { dst: u8, lhs: u8, rhs: u8 },
    Lt { dst: u8, lhs: u8, rhs: u8 },
    Le { dst: u8, lhs: u8, rhs: u8 },

    // ── Control flow (offsets are relative to the next instruction) ─────────
    Jump { offset: i32 },
    JumpIfFalse { src: u8, offset: i32 },
    JumpIfTrue { src: u8, offset: i32 },

    // ── Globals, upvalues, closures ─────────────────────────────────────────
    GetGlobal { dst: u8, name_idx: u16 },
    SetGlobal { src: u8, name_idx: u16 },
    GetUpvalue { dst: u8, upval_idx: u8 },
    SetUpvalue { src: u8, upval_idx: u8 },
    /// Instantiate `protos[proto_idx]` of the current function.
    Closure { dst: u8, proto_idx: u16 },
    /// Close open upvalues and run pending `__close` handlers for registers >= `from`.
    Close { from: u8 },
    /// Mark `reg` as a to-be-closed variable.
    Tbc { reg: u8 },

    // ── Tables ──────────────────────────────────────────────────────────────
    NewTable { dst: u8 },
    /// `dst = table[key]`
    GetTable { dst: u8, table: u8, key: u8 },
    /// `table[key] = val`
    SetTable { table: u8, key: u8, val: u8 },
    /// `dst = table.<names[name_idx]>`
    GetField { dst: u8, table: u8, name_idx: u16 },
    SetField { table: u8, name_idx: u16, val: u8 },
    /// `table[offset + i] = R[src + i - 1]` for `i` in `1..=count` (`MULTI`: up to top).
    SetList { table: u8, src: u8, count: u8, offset: u32 },
    /// `R[dst+1] = R[obj]; R[dst] = R[obj].<names[name_idx]>`, used for method calls.
    Method { dst: u8, obj: u8, name_idx: u16 },

    // ── Calls ───────────────────────────────────────────────────────────────
    /// Call `R[func]` with `nargs` arguments (`MULTI`: up to top); results land
    /// at `R[func]..`, `nresults` of them (`MULTI`: all, top set after the last).
    Call { func: u8, nargs: u8, nresults: u8 },
    /// `return R[func](args...)` reusing the current frame. Always followed by
    /// `Return { src: func, count: MULTI }`, which runs when the callee is not
    /// a Lua function and the call had to be made normally.
    TailCall { func: u8, nargs: u8 },
    /// Return `count` values from `src` (`MULTI`: up to top).
    Return { src: u8, count: u8 },
    /// Copy `count` varargs into `dst..` (`MULTI`: all of them, top set).
    VarArg { dst: u8, count: u8 },

    // ── Loops ───────────────────────────────────────────────────────────────
    /// Numeric for prologue over `R[base]` index, `R[base+1]` limit, `R[base+2]` step.
    /// Jumps past the loop when it runs zero times, else seeds `R[base+3]`.
    ForPrep { base: u8, offset: i32 },
    /// Step the numeric loop; jumps back while the index is within the limit.
    ForLoop { base: u8, offset: i32 },
    /// `R[base+3..base+3+nvars] = R[base](R[base+1], R[base+2])`
    TForCall { base: u8, nvars: u8 },
    /// If `R[base+3]` is not nil, store it as the new control value and jump back.
    TForLoop { base: u8, offset: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_small_and_copy() {
        let op = OpCode::Call {
            func: 0,
            nargs: MULTI,
            nresults: 1,
        };
        let copy = op;
        assert_eq!(op, copy);
        assert!(std::mem::size_of::<OpCode>() <= 12);
    }

    #[test]
    fn arith_events() {
        assert_eq!(ArithOp::IDiv.event(), "__idiv");
        assert!(ArithOp::Shl.is_bitwise());
        assert!(!ArithOp::Pow.is_bitwise());
    }
}
