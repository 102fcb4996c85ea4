//! Per-function compile state: registers, block scopes, labels and upvalues.

use crate::builder::ProtoBuilder;
use lunar_core::config::{MAX_LOCALS, MAX_REGISTERS, MAX_UPVALUES};
use lunar_core::{LuaError, UpvalueDesc};
use std::rc::Rc;

/// Local variable attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attrib {
    None,
    Const,
    Close,
}

/// A declared local. Locals occupy registers `0..locals.len()` in order.
#[derive(Debug, Clone)]
pub struct LocalVar {
    pub name: String,
    pub attrib: Attrib,
    /// Captured by an inner function; the block must close it on exit.
    pub captured: bool,
}

/// An upvalue slot as seen by the compiler.
#[derive(Debug, Clone)]
pub struct UpvalEntry {
    pub name: String,
    pub desc: UpvalueDesc,
    pub is_const: bool,
}

/// Lexical block.
#[derive(Debug)]
pub struct BlockScope {
    /// Active locals when the block was entered.
    pub nactive: usize,
    pub is_loop: bool,
    /// Jumps emitted by `break`, patched to the loop exit.
    pub breaks: Vec<usize>,
    /// `labels.len()` and `gotos.len()` when the block was entered.
    pub first_label: usize,
    pub first_goto: usize,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub name: String,
    pub pc: usize,
    pub nactive: usize,
    pub line: u32,
}

/// A forward `goto` waiting for its label.
#[derive(Debug, Clone)]
pub struct PendingGoto {
    pub name: String,
    pub close_pc: usize,
    pub jump_pc: usize,
    /// Active locals at the goto, lowered as enclosing blocks are left.
    pub nactive: usize,
    /// Active locals at the goto itself, used to decide whether to close.
    pub orig_nactive: usize,
    pub line: u32,
}

/// Result of resolving a name in one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Local(u8),
    Upvalue(u8),
    Global,
}

/// Tracks registers and scopes for a single function body.
pub struct FuncState {
    pub proto: ProtoBuilder,
    pub locals: Vec<LocalVar>,
    pub blocks: Vec<BlockScope>,
    pub upvalues: Vec<UpvalEntry>,
    pub labels: Vec<Label>,
    pub gotos: Vec<PendingGoto>,
    /// Next free register.
    pub next_reg: usize,
    /// High-water mark of `next_reg`.
    pub max_reg: usize,
    /// Line attached to emitted instructions.
    pub line: u32,
}

impl FuncState {
    pub fn new(source: Rc<str>, line_defined: u32) -> Self {
        Self {
            proto: ProtoBuilder::new(source, line_defined),
            locals: Vec::new(),
            blocks: Vec::new(),
            upvalues: Vec::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
            next_reg: 0,
            max_reg: 0,
            line: line_defined,
        }
    }

    pub fn error(&self, message: impl Into<String>) -> LuaError {
        LuaError::Compile {
            line: self.line,
            message: message.into(),
        }
    }

    // ── registers ────────────────────────────────────────────────────────────

    pub fn alloc(&mut self) -> Result<u8, LuaError> {
        self.reserve(1)
    }

    /// Reserve `n` consecutive registers, returning the first.
    pub fn reserve(&mut self, n: usize) -> Result<u8, LuaError> {
        let first = self.next_reg;
        self.next_reg += n;
        self.bump_max(self.next_reg)?;
        Ok(first as u8)
    }

    /// Make sure the frame has room for registers below `top`.
    pub fn bump_max(&mut self, top: usize) -> Result<(), LuaError> {
        if top > MAX_REGISTERS {
            return Err(self.error("function or expression needs too many registers"));
        }
        self.max_reg = self.max_reg.max(top);
        Ok(())
    }

    /// Release temporaries down to `level`.
    pub fn free_to(&mut self, level: usize) {
        self.next_reg = level;
    }

    pub fn nactive(&self) -> usize {
        self.locals.len()
    }

    // ── locals ───────────────────────────────────────────────────────────────

    /// Bind the next register to a new local. The register must already hold
    /// the initial value (or be the next free one).
    pub fn declare_local(&mut self, name: &str, attrib: Attrib) -> Result<u8, LuaError> {
        if self.locals.len() >= MAX_LOCALS {
            return Err(self.error(format!(
                "too many local variables (limit is {MAX_LOCALS}) in function at line {}",
                self.proto.line_defined
            )));
        }
        let reg = self.locals.len();
        self.locals.push(LocalVar {
            name: name.to_owned(),
            attrib,
            captured: false,
        });
        if self.next_reg <= reg {
            self.next_reg = reg + 1;
            self.bump_max(self.next_reg)?;
        }
        Ok(reg as u8)
    }

    pub fn find_local(&self, name: &str) -> Option<u8> {
        self.locals
            .iter()
            .rposition(|l| l.name == name)
            .map(|i| i as u8)
    }

    pub fn find_upvalue(&self, name: &str) -> Option<u8> {
        self.upvalues
            .iter()
            .position(|u| u.name == name)
            .map(|i| i as u8)
    }

    pub fn add_upvalue(
        &mut self,
        name: &str,
        desc: UpvalueDesc,
        is_const: bool,
    ) -> Result<u8, LuaError> {
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(self.error(format!(
                "too many upvalues (limit is {MAX_UPVALUES}) in function at line {}",
                self.proto.line_defined
            )));
        }
        self.upvalues.push(UpvalEntry {
            name: name.to_owned(),
            desc,
            is_const,
        });
        Ok((self.upvalues.len() - 1) as u8)
    }

    // ── blocks ───────────────────────────────────────────────────────────────

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockScope {
            nactive: self.locals.len(),
            is_loop,
            breaks: Vec::new(),
            first_label: self.labels.len(),
            first_goto: self.gotos.len(),
        });
    }

    /// Locals declared in the innermost block that need closing on exit.
    pub fn block_needs_close(&self) -> bool {
        self.blocks.last().is_some_and(|b| {
            self.locals[b.nactive..]
                .iter()
                .any(|l| l.captured || l.attrib == Attrib::Close)
        })
    }

    /// Any local of this function at or above `level` is to-be-closed.
    pub fn has_tbc_from(&self, level: usize) -> bool {
        self.locals[level.min(self.locals.len())..]
            .iter()
            .any(|l| l.attrib == Attrib::Close)
    }
}
