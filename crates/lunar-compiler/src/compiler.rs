use crate::scope::{Attrib, FuncState, Label, PendingGoto, VarKind};
use lunar_core::{ArithOp, CompilerConfig, Constant, LuaError, OpCode, Proto, UpvalueDesc, MULTI};
use lunar_parser::ast::{
    BinOp, Binding, Block, Expr, ExprKind, FuncPath, Function, Line, Stmt, StmtKind, TableItem, UnOp,
};
use std::rc::Rc;
use tracing::debug;

/// Positional table items stored per `SetList`.
const FIELDS_PER_FLUSH: usize = 50;

/// Where an assignment stores its value.
#[derive(Debug, Clone, Copy)]
enum Target {
    Local(u8),
    Upvalue(u8),
    Global(u16),
    Index { table: u8, key: u8 },
    Field { table: u8, name_idx: u16 },
}

// ── Compiler ─────────────────────────────────────────────────────────────────

/// Compiles an AST into register-based bytecode.
///
/// One [`FuncState`] is pushed per function being compiled; name resolution
/// walks this stack outward to find locals of enclosing functions.
pub struct Compiler {
    funcs: Vec<FuncState>,
    source: Rc<str>,
    config: CompilerConfig,
}

impl Compiler {
    /// `source` is the chunk name used in error positions.
    pub fn new(source: impl Into<Rc<str>>) -> Self {
        Self {
            funcs: Vec::new(),
            source: source.into(),
            config: CompilerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Compile `block` as the main function of a chunk.
    pub fn compile(mut self, block: &Block) -> Result<Rc<Proto>, LuaError> {
        let mut main = FuncState::new(self.source.clone(), 0);
        main.proto.is_vararg = true;
        self.funcs.push(main);
        self.fs().enter_block(false);
        self.compile_statements(block)?;
        self.fs().line = block.end_line;
        self.emit(OpCode::Return { src: 0, count: 0 });
        let proto = self.close_function()?;
        debug!(
            target: "lunar::compiler",
            chunk = %self.source,
            instructions = proto.instructions.len(),
            protos = proto.protos.len(),
            "compiled chunk"
        );
        Ok(Rc::new(proto))
    }

    // ── Function state helpers ───────────────────────────────────────────────

    fn fs(&mut self) -> &mut FuncState {
        let idx = self.funcs.len() - 1;
        &mut self.funcs[idx]
    }

    fn emit(&mut self, op: OpCode) -> usize {
        let fs = self.fs();
        let line = fs.line;
        fs.proto.emit(op, line)
    }

    fn pc(&mut self) -> usize {
        self.fs().proto.pc()
    }

    fn error(&mut self, message: impl Into<String>) -> LuaError {
        self.fs().error(message)
    }

    fn emit_jump(&mut self) -> usize {
        self.emit(OpCode::Jump { offset: 0 })
    }

    /// Point the jump at `pc` to `target`.
    fn patch_jump(&mut self, pc: usize, target: usize) {
        let offset = target as i32 - (pc as i32 + 1);
        let op = &mut self.fs().proto.instructions[pc];
        match op {
            OpCode::Jump { offset: o }
            | OpCode::JumpIfFalse { offset: o, .. }
            | OpCode::JumpIfTrue { offset: o, .. }
            | OpCode::ForPrep { offset: o, .. }
            | OpCode::ForLoop { offset: o, .. }
            | OpCode::TForLoop { offset: o, .. } => *o = offset,
            _ => {}
        }
    }

    fn patch_to_here(&mut self, pc: usize) {
        let here = self.pc();
        self.patch_jump(pc, here);
    }

    fn name_idx(&mut self, name: &str) -> Result<u16, LuaError> {
        let fs = self.fs();
        let line = fs.line;
        fs.proto.add_name(name, line)
    }

    fn constant_idx(&mut self, value: Constant) -> Result<u16, LuaError> {
        let fs = self.fs();
        let line = fs.line;
        fs.proto.add_constant(value, line)
    }

    /// Pop the innermost function and turn it into a [`Proto`].
    fn close_function(&mut self) -> Result<Proto, LuaError> {
        let idx = self.funcs.len() - 1;
        if let Some(g) = self.funcs[idx].gotos.first() {
            return Err(LuaError::Compile {
                line: g.line,
                message: format!("no visible label '{}' for goto at line {}", g.name, g.line),
            });
        }
        let mut fs = self.funcs.remove(idx);
        fs.proto.upvalue_descs = fs.upvalues.iter().map(|u| u.desc).collect();
        fs.proto.upvalue_names = fs.upvalues.iter().map(|u| Rc::from(u.name.as_str())).collect();
        let frame_size = fs.max_reg.max(fs.proto.param_count as usize).max(1) as u8;
        Ok(fs.proto.finish(frame_size))
    }

    // ── Name resolution ──────────────────────────────────────────────────────

    fn resolve(&mut self, name: &str) -> Result<VarKind, LuaError> {
        let level = self.funcs.len() - 1;
        Self::resolve_at(&mut self.funcs, level, name)
    }

    /// Innermost local wins; otherwise capture from enclosing functions,
    /// chaining upvalue descriptors outward; otherwise global.
    fn resolve_at(funcs: &mut [FuncState], level: usize, name: &str) -> Result<VarKind, LuaError> {
        if let Some(reg) = funcs[level].find_local(name) {
            return Ok(VarKind::Local(reg));
        }
        if let Some(idx) = funcs[level].find_upvalue(name) {
            return Ok(VarKind::Upvalue(idx));
        }
        if level == 0 {
            return Ok(VarKind::Global);
        }
        let (desc, is_const) = match Self::resolve_at(funcs, level - 1, name)? {
            VarKind::Local(reg) => {
                let local = &mut funcs[level - 1].locals[reg as usize];
                local.captured = true;
                (UpvalueDesc::Stack(reg), local.attrib != Attrib::None)
            }
            VarKind::Upvalue(idx) => (
                UpvalueDesc::Upvalue(idx),
                funcs[level - 1].upvalues[idx as usize].is_const,
            ),
            VarKind::Global => return Ok(VarKind::Global),
        };
        Ok(VarKind::Upvalue(funcs[level].add_upvalue(name, desc, is_const)?))
    }

    // ── Blocks ───────────────────────────────────────────────────────────────

    fn compile_block(&mut self, block: &Block) -> Result<(), LuaError> {
        self.fs().enter_block(false);
        self.compile_statements(block)?;
        self.leave_block(true)?;
        Ok(())
    }

    /// Compile the statements of `block` in the current scope.
    fn compile_statements(&mut self, block: &Block) -> Result<(), LuaError> {
        for (i, stmt) in block.stmts.iter().enumerate() {
            // A label followed only by labels ends the block: locals declared
            // before it are out of scope there.
            let at_end = block.ret.is_none()
                && block.stmts[i + 1..]
                    .iter()
                    .all(|s| matches!(s.kind, StmtKind::Label(_)));
            self.fs().line = stmt.line;
            self.compile_stmt(stmt, at_end)?;
            let fs = self.fs();
            let level = fs.nactive();
            fs.free_to(level);
        }
        if let Some(ret) = &block.ret {
            self.fs().line = ret.line;
            self.compile_return(&ret.values)?;
        }
        Ok(())
    }

    /// Leave the innermost block, closing captured and to-be-closed locals
    /// when `emit_close` is set. Returns the loop's pending `break` jumps.
    fn leave_block(&mut self, emit_close: bool) -> Result<Vec<usize>, LuaError> {
        let needs_close = self.fs().block_needs_close();
        let fs = self.fs();
        let Some(block) = fs.blocks.pop() else {
            return Err(fs.error("block underflow"));
        };
        if emit_close && needs_close {
            self.emit(OpCode::Close {
                from: block.nactive as u8,
            });
        }
        let fs = self.fs();
        fs.locals.truncate(block.nactive);
        fs.free_to(block.nactive);
        fs.labels.truncate(block.first_label);
        for g in fs.gotos.iter_mut().skip(block.first_goto) {
            g.nactive = g.nactive.min(block.nactive);
        }
        Ok(block.breaks)
    }

    // ── Statements ────────────────────────────────────────────────────────────

    fn compile_stmt(&mut self, stmt: &Stmt, at_block_end: bool) -> Result<(), LuaError> {
        match &stmt.kind {
            StmtKind::Local { bindings, values } => self.compile_local(bindings, values),
            StmtKind::Assign { targets, values } => self.compile_assign(targets, values),
            StmtKind::Call(call) => {
                self.compile_call(call, 0, false)?;
                Ok(())
            }
            StmtKind::Do(block) => self.compile_block(block),
            StmtKind::While { cond, body } => self.compile_while(cond, body),
            StmtKind::Repeat { body, cond } => self.compile_repeat(body, cond),
            StmtKind::If { arms, otherwise } => self.compile_if(arms, otherwise.as_ref()),
            StmtKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            } => self.compile_numeric_for(var, start, limit, step.as_ref(), body),
            StmtKind::GenericFor { vars, exprs, body } => self.compile_generic_for(vars, exprs, body),
            StmtKind::Function { path, func } => self.compile_fn_def(path, func),
            StmtKind::LocalFunction { name, func } => {
                // Declared first so the body can call itself.
                let reg = self.fs().declare_local(name, Attrib::None)?;
                let proto_idx = self.compile_function(func)?;
                self.emit(OpCode::Closure {
                    dst: reg,
                    proto_idx,
                });
                Ok(())
            }
            StmtKind::Goto(label) => self.compile_goto(label, stmt.line),
            StmtKind::Label(name) => self.compile_label(name, stmt.line, at_block_end),
            StmtKind::Break => self.compile_break(stmt.line),
        }
    }

    /// Evaluate `cond` and emit a jump taken when it is false. Returns
    /// `None` for a literal `true`, which never jumps.
    fn compile_condition(&mut self, cond: &Expr) -> Result<Option<usize>, LuaError> {
        if cond.kind == ExprKind::True {
            return Ok(None);
        }
        let level = self.fs().next_reg;
        let r = self.expr_any_reg(cond)?;
        self.fs().free_to(level);
        Ok(Some(self.emit(OpCode::JumpIfFalse { src: r, offset: 0 })))
    }

    fn compile_while(&mut self, cond: &Expr, body: &Block) -> Result<(), LuaError> {
        let start = self.pc();
        let exit = self.compile_condition(cond)?;
        self.fs().enter_block(true);
        self.compile_statements(body)?;
        let breaks = self.leave_block(true)?;
        let back = self.emit_jump();
        self.patch_jump(back, start);
        for pc in exit.into_iter().chain(breaks) {
            self.patch_to_here(pc);
        }
        Ok(())
    }

    fn compile_repeat(&mut self, body: &Block, cond: &Expr) -> Result<(), LuaError> {
        let start = self.pc();
        self.fs().enter_block(true);
        self.compile_statements(body)?;
        let r = self.expr_any_reg(cond)?;
        // The condition sees the body's locals, so close them only after it
        // has been evaluated, on both paths.
        if self.fs().block_needs_close() {
            let from = self.fs().blocks.last().map_or(0, |b| b.nactive) as u8;
            self.emit(OpCode::Close { from });
        }
        let again = self.emit(OpCode::JumpIfFalse { src: r, offset: 0 });
        self.patch_jump(again, start);
        for pc in self.leave_block(false)? {
            self.patch_to_here(pc);
        }
        Ok(())
    }

    fn compile_if(&mut self, arms: &[(Expr, Block)], otherwise: Option<&Block>) -> Result<(), LuaError> {
        let mut exits = Vec::new();
        for (i, (cond, block)) in arms.iter().enumerate() {
            let skip = self.compile_condition(cond)?;
            self.compile_block(block)?;
            // The last arm falls through to the end on its own.
            if i + 1 < arms.len() || otherwise.is_some() {
                exits.push(self.emit_jump());
            }
            if let Some(skip) = skip {
                self.patch_to_here(skip);
            }
        }
        if let Some(block) = otherwise {
            self.compile_block(block)?;
        }
        for pc in exits {
            self.patch_to_here(pc);
        }
        Ok(())
    }

    fn compile_local(&mut self, bindings: &[Binding], values: &[Expr]) -> Result<(), LuaError> {
        let mut attribs = Vec::with_capacity(bindings.len());
        for b in bindings {
            attribs.push(match b.attrib.as_deref() {
                None => Attrib::None,
                Some("const") => Attrib::Const,
                Some("close") => Attrib::Close,
                Some(other) => return Err(self.error(format!("unknown attribute '{other}'"))),
            });
        }
        if attribs.iter().filter(|a| **a == Attrib::Close).count() > 1 {
            return Err(self.error("multiple to-be-closed variables in local list"));
        }
        let base = self.fs().next_reg;
        self.expr_list_exact(values, bindings.len())?;
        for (b, attrib) in bindings.iter().zip(&attribs) {
            self.fs().declare_local(&b.name, *attrib)?;
        }
        if let Some(i) = attribs.iter().position(|a| *a == Attrib::Close) {
            self.emit(OpCode::Tbc {
                reg: (base + i) as u8,
            });
        }
        Ok(())
    }

    fn compile_assign(&mut self, targets: &[Expr], values: &[Expr]) -> Result<(), LuaError> {
        if let ([target], [value]) = (targets, values) {
            let target = self.compile_target(target, false)?;
            let src = self.expr_any_reg(value)?;
            return self.store(target, src);
        }
        // Prefix expressions are copied so later stores cannot change them.
        let mut resolved = Vec::with_capacity(targets.len());
        for t in targets {
            resolved.push(self.compile_target(t, true)?);
        }
        let base = self.fs().next_reg;
        self.expr_list_exact(values, targets.len())?;
        for (i, t) in resolved.into_iter().enumerate() {
            self.store(t, (base + i) as u8)?;
        }
        Ok(())
    }

    /// Resolve an assignment target, evaluating its table and key.
    fn compile_target(&mut self, expr: &Expr, copy_prefix: bool) -> Result<Target, LuaError> {
        match &expr.kind {
            ExprKind::Name(name) => self.name_target(name),
            ExprKind::Index { table, key } => {
                let table = self.prefix_reg(table, copy_prefix)?;
                if let Some(s) = key.as_str() {
                    let name_idx = self.name_idx(s)?;
                    return Ok(Target::Field { table, name_idx });
                }
                let key = self.prefix_reg(key, copy_prefix)?;
                Ok(Target::Index { table, key })
            }
            _ => Err(self.error("syntax error: cannot assign to this expression")),
        }
    }

    fn prefix_reg(&mut self, e: &Expr, copy: bool) -> Result<u8, LuaError> {
        if copy {
            self.expr_next_reg(e)
        } else {
            self.expr_any_reg(e)
        }
    }

    fn name_target(&mut self, name: &str) -> Result<Target, LuaError> {
        let (target, is_const) = match self.resolve(name)? {
            VarKind::Local(reg) => (Target::Local(reg), self.fs().locals[reg as usize].attrib != Attrib::None),
            VarKind::Upvalue(idx) => (Target::Upvalue(idx), self.fs().upvalues[idx as usize].is_const),
            VarKind::Global => (Target::Global(self.name_idx(name)?), false),
        };
        if is_const {
            return Err(self.error(format!("attempt to assign to const variable '{name}'")));
        }
        Ok(target)
    }

    fn store(&mut self, target: Target, src: u8) -> Result<(), LuaError> {
        let op = match target {
            Target::Local(dst) if dst == src => return Ok(()),
            Target::Local(dst) => OpCode::Move { dst, src },
            Target::Upvalue(upval_idx) => OpCode::SetUpvalue { src, upval_idx },
            Target::Global(name_idx) => OpCode::SetGlobal { src, name_idx },
            Target::Index { table, key } => OpCode::SetTable {
                table,
                key,
                val: src,
            },
            Target::Field { table, name_idx } => OpCode::SetField {
                table,
                name_idx,
                val: src,
            },
        };
        self.emit(op);
        Ok(())
    }

    /// `function a.b.c:m() end` stores a closure into the last field of the
    /// path; a bare name is an ordinary assignment.
    fn compile_fn_def(&mut self, path: &FuncPath, func: &Function) -> Result<(), LuaError> {
        let last = match (&path.method, path.fields.last()) {
            (Some(method), _) => method.as_str(),
            (None, Some(field)) => field.as_str(),
            (None, None) => {
                let target = self.name_target(&path.root)?;
                let r = self.fs().alloc()?;
                let proto_idx = self.compile_function(func)?;
                self.emit(OpCode::Closure { dst: r, proto_idx });
                return self.store(target, r);
            }
        };
        let walk = if path.method.is_some() {
            &path.fields[..]
        } else {
            &path.fields[..path.fields.len() - 1]
        };
        let root = Expr::new(ExprKind::Name(path.root.clone()), func.line);
        let mut table = self.expr_any_reg(&root)?;
        for field in walk {
            let dst = self.fs().alloc()?;
            let name_idx = self.name_idx(field)?;
            self.emit(OpCode::GetField {
                dst,
                table,
                name_idx,
            });
            table = dst;
        }
        let val = self.fs().alloc()?;
        let proto_idx = self.compile_function(func)?;
        self.emit(OpCode::Closure { dst: val, proto_idx });
        let name_idx = self.name_idx(last)?;
        self.emit(OpCode::SetField {
            table,
            name_idx,
            val,
        });
        Ok(())
    }

    fn compile_return(&mut self, values: &[Expr]) -> Result<(), LuaError> {
        let fs = self.fs();
        let level = fs.nactive();
        let tbc_active = fs.has_tbc_from(0);
        match values {
            [] => {
                self.emit(OpCode::Return {
                    src: level as u8,
                    count: 0,
                });
            }
            [call] if call.is_call() && !tbc_active => {
                // Natives and protected calls cannot replace the frame; the VM
                // runs them as an ordinary call and falls through to this Return.
                let base = self.compile_call(call, MULTI, true)?;
                self.emit(OpCode::Return {
                    src: base,
                    count: MULTI,
                });
            }
            [single] if !single.is_multi() => {
                let src = self.expr_any_reg(single)?;
                self.emit(OpCode::Return { src, count: 1 });
            }
            _ => {
                let base = self.fs().next_reg as u8;
                let count = self.expr_list_open(values)?;
                self.emit(OpCode::Return { src: base, count });
            }
        }
        Ok(())
    }

    fn compile_break(&mut self, line: Line) -> Result<(), LuaError> {
        let fs = self.fs();
        let Some(idx) = fs.blocks.iter().rposition(|b| b.is_loop) else {
            return Err(LuaError::Compile {
                line,
                message: format!("break outside a loop at line {line}"),
            });
        };
        let level = fs.blocks[idx].nactive;
        if fs.nactive() > level {
            self.emit(OpCode::Close { from: level as u8 });
        }
        let jump = self.emit_jump();
        self.fs().blocks[idx].breaks.push(jump);
        Ok(())
    }

    fn compile_goto(&mut self, name: &str, line: Line) -> Result<(), LuaError> {
        let fs = self.fs();
        let nactive = fs.nactive();
        if let Some(label) = fs.labels.iter().rev().find(|l| l.name == name).cloned() {
            if nactive > label.nactive {
                self.emit(OpCode::Close {
                    from: label.nactive as u8,
                });
            }
            let jump = self.emit_jump();
            self.patch_jump(jump, label.pc);
            return Ok(());
        }
        // Forward jump: the close slot is fixed up when the label appears.
        let close_pc = self.emit_jump();
        let jump_pc = self.emit_jump();
        self.fs().gotos.push(PendingGoto {
            name: name.to_owned(),
            close_pc,
            jump_pc,
            nactive,
            orig_nactive: nactive,
            line,
        });
        Ok(())
    }

    fn compile_label(&mut self, name: &str, line: Line, at_block_end: bool) -> Result<(), LuaError> {
        let fs = self.fs();
        if let Some(prev) = fs.labels.iter().find(|l| l.name == name) {
            let prev_line = prev.line;
            return Err(self.error(format!(
                "label '{name}' already defined on line {prev_line}"
            )));
        }
        let (block_nactive, first_goto) = fs
            .blocks
            .last()
            .map_or((0, 0), |b| (b.nactive, b.first_goto));
        let nactive = if at_block_end {
            block_nactive
        } else {
            fs.nactive()
        };
        let pc = fs.proto.pc();
        fs.labels.push(Label {
            name: name.to_owned(),
            pc,
            nactive,
            line,
        });

        let mut i = first_goto;
        while i < self.fs().gotos.len() {
            if self.fs().gotos[i].name != name {
                i += 1;
                continue;
            }
            let g = self.fs().gotos.remove(i);
            if g.nactive < nactive {
                let local = self.fs().locals[g.nactive].name.clone();
                return Err(LuaError::Compile {
                    line: g.line,
                    message: format!(
                        "<goto {name}> at line {} jumps into the scope of local '{local}'",
                        g.line
                    ),
                });
            }
            if g.orig_nactive > nactive {
                self.fs().proto.instructions[g.close_pc] = OpCode::Close {
                    from: nactive as u8,
                };
            }
            self.patch_jump(g.jump_pc, pc);
        }
        Ok(())
    }

    fn compile_numeric_for(
        &mut self,
        var: &str,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
    ) -> Result<(), LuaError> {
        self.fs().enter_block(false);
        let base = self.fs().next_reg as u8;
        let r = self.fs().alloc()?;
        self.expr_to_reg(start, r)?;
        let r = self.fs().alloc()?;
        self.expr_to_reg(limit, r)?;
        let r = self.fs().alloc()?;
        match step {
            Some(step) => self.expr_to_reg(step, r)?,
            None => self.load_number(r, 1.0)?,
        }
        for hidden in ["(for index)", "(for limit)", "(for step)"] {
            self.fs().declare_local(hidden, Attrib::None)?;
        }
        let prep = self.emit(OpCode::ForPrep { base, offset: 0 });

        self.fs().enter_block(true);
        self.fs().declare_local(var, Attrib::None)?;
        self.compile_statements(body)?;
        let breaks = self.leave_block(true)?;

        let lp = self.emit(OpCode::ForLoop { base, offset: 0 });
        self.patch_jump(lp, prep + 1);
        self.patch_to_here(prep);
        self.leave_block(true)?;
        for b in breaks {
            self.patch_to_here(b);
        }
        Ok(())
    }

    fn compile_generic_for(&mut self, vars: &[String], exprs: &[Expr], body: &Block) -> Result<(), LuaError> {
        self.fs().enter_block(false);
        let base = self.fs().next_reg;
        self.expr_list_exact(exprs, 3)?;
        for hidden in ["(for generator)", "(for state)", "(for control)"] {
            self.fs().declare_local(hidden, Attrib::None)?;
        }
        // TForCall copies the three control values above the loop variables.
        let needed = base + 3 + vars.len().max(3);
        self.fs().bump_max(needed)?;
        let to_call = self.emit_jump();

        let body_start = self.pc();
        self.fs().enter_block(true);
        for v in vars {
            self.fs().declare_local(v, Attrib::None)?;
        }
        self.compile_statements(body)?;
        let breaks = self.leave_block(true)?;

        self.patch_to_here(to_call);
        self.emit(OpCode::TForCall {
            base: base as u8,
            nvars: vars.len() as u8,
        });
        let lp = self.emit(OpCode::TForLoop {
            base: base as u8,
            offset: 0,
        });
        self.patch_jump(lp, body_start);
        self.leave_block(true)?;
        for b in breaks {
            self.patch_to_here(b);
        }
        Ok(())
    }

    // ── Functions ─────────────────────────────────────────────────────────────

    /// Compile a nested function and register it with the current one.
    fn compile_function(&mut self, func: &Function) -> Result<u16, LuaError> {
        let mut fs = FuncState::new(self.source.clone(), func.line);
        fs.proto.is_vararg = func.is_vararg;
        self.funcs.push(fs);
        self.fs().enter_block(false);
        for p in &func.params {
            self.fs().declare_local(p, Attrib::None)?;
        }
        self.fs().proto.param_count = func.params.len() as u8;
        self.compile_statements(&func.body)?;
        self.fs().line = func.body.end_line;
        self.emit(OpCode::Return { src: 0, count: 0 });
        let proto = self.close_function()?;
        let fs = self.fs();
        let line = fs.line;
        fs.proto.add_proto(Rc::new(proto), line)
    }

    // ── Expressions ───────────────────────────────────────────────────────────

    /// Compile `e` into the already reserved register `dst`.
    fn expr_to_reg(&mut self, e: &Expr, dst: u8) -> Result<(), LuaError> {
        let outer_line = self.fs().line;
        let level = self.fs().next_reg;
        self.fs().line = e.line;
        let result = self.expr_to_reg_inner(e, dst);
        let fs = self.fs();
        fs.free_to(level);
        fs.line = outer_line;
        result
    }

    /// Register holding the value of `e`: a local's own register, or a new temporary.
    fn expr_any_reg(&mut self, e: &Expr) -> Result<u8, LuaError> {
        if let ExprKind::Name(name) = &e.kind {
            if let VarKind::Local(reg) = self.resolve(name)? {
                return Ok(reg);
            }
        }
        self.expr_next_reg(e)
    }

    /// Compile `e` into a freshly reserved register.
    fn expr_next_reg(&mut self, e: &Expr) -> Result<u8, LuaError> {
        let r = self.fs().alloc()?;
        self.expr_to_reg(e, r)?;
        Ok(r)
    }

    fn load_number(&mut self, dst: u8, n: f64) -> Result<(), LuaError> {
        let const_idx = self.constant_idx(Constant::Number(n))?;
        self.emit(OpCode::LoadConst { dst, const_idx });
        Ok(())
    }

    fn load_str(&mut self, dst: u8, s: &str) -> Result<(), LuaError> {
        let const_idx = self.constant_idx(Constant::Str(Rc::from(s)))?;
        self.emit(OpCode::LoadConst { dst, const_idx });
        Ok(())
    }

    fn check_vararg(&mut self) -> Result<(), LuaError> {
        if self.fs().proto.is_vararg {
            Ok(())
        } else {
            Err(self.error("cannot use '...' outside a vararg function"))
        }
    }

    fn expr_to_reg_inner(&mut self, e: &Expr, dst: u8) -> Result<(), LuaError> {
        if let Some(n) = self.folded(e) {
            return self.load_number(dst, n);
        }
        match &e.kind {
            ExprKind::Nil => {
                self.emit(OpCode::LoadNil { dst, count: 1 });
            }
            ExprKind::True => {
                self.emit(OpCode::LoadBool { dst, value: true });
            }
            ExprKind::False => {
                self.emit(OpCode::LoadBool { dst, value: false });
            }
            ExprKind::Number(n) => self.load_number(dst, *n)?,
            ExprKind::Str(s) => self.load_str(dst, s)?,
            ExprKind::Vararg => {
                self.check_vararg()?;
                self.emit(OpCode::VarArg { dst, count: 1 });
            }
            ExprKind::Name(name) => match self.resolve(name)? {
                VarKind::Local(src) => {
                    if src != dst {
                        self.emit(OpCode::Move { dst, src });
                    }
                }
                VarKind::Upvalue(upval_idx) => {
                    self.emit(OpCode::GetUpvalue { dst, upval_idx });
                }
                VarKind::Global => {
                    let name_idx = self.name_idx(name)?;
                    self.emit(OpCode::GetGlobal { dst, name_idx });
                }
            },
            ExprKind::Index { table, key } => {
                let table = self.expr_any_reg(table)?;
                if let Some(s) = key.as_str() {
                    let name_idx = self.name_idx(s)?;
                    self.emit(OpCode::GetField {
                        dst,
                        table,
                        name_idx,
                    });
                } else {
                    let key = self.expr_any_reg(key)?;
                    self.emit(OpCode::GetTable { dst, table, key });
                }
            }
            ExprKind::Call { .. } | ExprKind::Method { .. } => {
                let base = self.compile_call(e, 1, false)?;
                if base != dst {
                    self.emit(OpCode::Move { dst, src: base });
                }
            }
            ExprKind::Function(func) => {
                let proto_idx = self.compile_function(func)?;
                self.emit(OpCode::Closure { dst, proto_idx });
            }
            ExprKind::Table(items) => self.compile_table(items, dst)?,
            ExprKind::Paren(inner) => self.expr_to_reg(inner, dst)?,
            ExprKind::Binary { op, lhs, rhs } => self.compile_binop(*op, lhs, rhs, dst)?,
            ExprKind::Unary { op, operand } => {
                let src = self.expr_any_reg(operand)?;
                let op = match op {
                    UnOp::Neg => OpCode::Unm { dst, src },
                    UnOp::Not => OpCode::Not { dst, src },
                    UnOp::Len => OpCode::Len { dst, src },
                    UnOp::BNot => OpCode::BNot { dst, src },
                };
                self.emit(op);
            }
        }
        Ok(())
    }

    fn compile_binop(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, dst: u8) -> Result<(), LuaError> {
        let line = self.fs().line;
        match op {
            BinOp::And | BinOp::Or => {
                self.expr_to_reg(lhs, dst)?;
                let jump = if op == BinOp::And {
                    OpCode::JumpIfFalse { src: dst, offset: 0 }
                } else {
                    OpCode::JumpIfTrue { src: dst, offset: 0 }
                };
                let skip = self.emit(jump);
                self.expr_to_reg(rhs, dst)?;
                self.patch_to_here(skip);
            }
            BinOp::Concat => {
                let mut parts = Vec::new();
                flatten_concat(lhs, &mut parts);
                flatten_concat(rhs, &mut parts);
                let start = self.fs().next_reg as u8;
                for part in &parts {
                    self.expr_next_reg(part)?;
                }
                self.fs().line = line;
                self.emit(OpCode::Concat {
                    dst,
                    start,
                    count: parts.len() as u8,
                });
            }
            BinOp::Arith(op) => {
                let (l, r) = self.operand_regs(lhs, rhs, line)?;
                self.emit(OpCode::Arith {
                    op,
                    dst,
                    lhs: l,
                    rhs: r,
                });
            }
            cmp => {
                let (l, r) = self.operand_regs(lhs, rhs, line)?;
                // `a > b` is `b < a`; both operands are already evaluated in order.
                let (lhs, rhs) = if matches!(cmp, BinOp::Gt | BinOp::Ge) { (r, l) } else { (l, r) };
                let test = match cmp {
                    BinOp::Eq | BinOp::Ne => OpCode::Eq { dst, lhs, rhs },
                    BinOp::Lt | BinOp::Gt => OpCode::Lt { dst, lhs, rhs },
                    _ => OpCode::Le { dst, lhs, rhs },
                };
                self.emit(test);
                if cmp == BinOp::Ne {
                    self.emit(OpCode::Not { dst, src: dst });
                }
            }
        }
        Ok(())
    }

    /// Registers of both operands, evaluated left to right; later
    /// instructions are attributed to the operator's line.
    fn operand_regs(&mut self, lhs: &Expr, rhs: &Expr, line: Line) -> Result<(u8, u8), LuaError> {
        let l = self.expr_any_reg(lhs)?;
        let r = self.expr_any_reg(rhs)?;
        self.fs().line = line;
        Ok((l, r))
    }

    /// Value of an operator expression built only from numeric literals.
    fn folded(&self, e: &Expr) -> Option<f64> {
        if !self.config.fold_constants {
            return None;
        }
        match e.kind {
            ExprKind::Binary { .. } | ExprKind::Unary { .. } => const_number(e),
            _ => None,
        }
    }

    fn compile_table(&mut self, items: &[TableItem], dst: u8) -> Result<(), LuaError> {
        self.emit(OpCode::NewTable { dst });
        let base = self.fs().next_reg;
        let mut pending = 0usize;
        let mut offset = 0u32;
        for (i, item) in items.iter().enumerate() {
            let flush = match item {
                TableItem::Positional(e) if i + 1 == items.len() && e.is_multi() => {
                    self.expr_multi(e, MULTI)?;
                    Some(MULTI)
                }
                TableItem::Positional(e) => {
                    self.expr_next_reg(e)?;
                    pending += 1;
                    (pending == FIELDS_PER_FLUSH).then_some(pending as u8)
                }
                TableItem::Keyed(key, value) => {
                    let level = self.fs().next_reg;
                    let val = self.expr_any_reg(value)?;
                    let op = match key.as_str() {
                        Some(name) => OpCode::SetField {
                            table: dst,
                            name_idx: self.name_idx(name)?,
                            val,
                        },
                        None => OpCode::SetTable {
                            table: dst,
                            key: self.expr_any_reg(key)?,
                            val,
                        },
                    };
                    self.emit(op);
                    self.fs().free_to(level);
                    None
                }
            };
            if let Some(count) = flush {
                self.emit(OpCode::SetList {
                    table: dst,
                    src: base as u8,
                    count,
                    offset,
                });
                offset += pending as u32;
                pending = 0;
                self.fs().free_to(base);
            }
        }
        if pending > 0 {
            self.emit(OpCode::SetList {
                table: dst,
                src: base as u8,
                count: pending as u8,
                offset,
            });
        }
        self.fs().free_to(base);
        Ok(())
    }

    // ── Calls and multiple values ────────────────────────────────────────────

    /// Compile a call at the next free register, keeping `want` results
    /// (`MULTI` for all). With `tail` set a `TailCall` is emitted instead.
    /// Returns the register holding the first result.
    fn compile_call(&mut self, e: &Expr, want: u8, tail: bool) -> Result<u8, LuaError> {
        let outer_line = self.fs().line;
        self.fs().line = e.line;
        let (base, args, extra) = match &e.kind {
            ExprKind::Call { func, args } => (self.expr_next_reg(func)?, args, 0),
            ExprKind::Method { obj, name, args } => {
                let base = self.expr_next_reg(obj)?;
                self.fs().alloc()?;
                let name_idx = self.name_idx(name)?;
                self.emit(OpCode::Method {
                    dst: base,
                    obj: base,
                    name_idx,
                });
                (base, args, 1)
            }
            _ => return Err(self.error("call expected")),
        };
        let nargs = match self.expr_list_open(args)? {
            MULTI => MULTI,
            n => n + extra,
        };
        self.fs().line = e.line;
        if tail {
            self.emit(OpCode::TailCall { func: base, nargs });
        } else {
            self.emit(OpCode::Call {
                func: base,
                nargs,
                nresults: want,
            });
        }
        let fs = self.fs();
        let keep = if want == MULTI { 0 } else { want as usize };
        fs.free_to(base as usize + keep);
        fs.bump_max(base as usize + keep)?;
        fs.line = outer_line;
        Ok(base)
    }

    /// Compile a call or `...` at the next free register producing `want` values.
    fn expr_multi(&mut self, e: &Expr, want: u8) -> Result<(), LuaError> {
        if e.is_call() {
            self.compile_call(e, want, false)?;
        } else if e.kind == ExprKind::Vararg {
            self.check_vararg()?;
            let dst = self.fs().next_reg as u8;
            self.emit(OpCode::VarArg { dst, count: want });
            if want != MULTI {
                self.fs().reserve(want as usize)?;
            }
        } else {
            let r = self.expr_next_reg(e)?;
            if want != MULTI && want > 1 {
                self.emit(OpCode::LoadNil {
                    dst: r + 1,
                    count: want - 1,
                });
                self.fs().reserve(want as usize - 1)?;
            }
        }
        Ok(())
    }

    /// Push every expression into consecutive registers. A trailing call or
    /// `...` expands to all its values, in which case `MULTI` is returned.
    fn expr_list_open(&mut self, list: &[Expr]) -> Result<u8, LuaError> {
        for (i, e) in list.iter().enumerate() {
            if i + 1 == list.len() && e.is_multi() {
                self.expr_multi(e, MULTI)?;
                return Ok(MULTI);
            }
            self.expr_next_reg(e)?;
        }
        Ok(list.len() as u8)
    }

    /// Push exactly `n` values: extra expressions are evaluated and dropped,
    /// missing ones are nil unless a trailing call or `...` supplies them.
    fn expr_list_exact(&mut self, list: &[Expr], n: usize) -> Result<(), LuaError> {
        let base = self.fs().next_reg;
        let mut produced = 0;
        for (i, e) in list.iter().enumerate() {
            let last = i + 1 == list.len();
            if i < n {
                if last && e.is_multi() {
                    self.expr_multi(e, (n - i) as u8)?;
                    produced = n;
                } else {
                    self.expr_next_reg(e)?;
                    produced += 1;
                }
            } else {
                let level = self.fs().next_reg;
                if e.is_call() {
                    self.compile_call(e, 0, false)?;
                } else {
                    self.expr_next_reg(e)?;
                }
                self.fs().free_to(level);
            }
        }
        if produced < n {
            self.emit(OpCode::LoadNil {
                dst: (base + produced) as u8,
                count: (n - produced) as u8,
            });
        }
        let fs = self.fs();
        fs.free_to(base + n);
        fs.bump_max(base + n)?;
        Ok(())
    }
}

/// Numeric value of `e` when it is built only from numeric literals and
/// the operators that fold exactly.
fn const_number(e: &Expr) -> Option<f64> {
    match &e.kind {
        ExprKind::Number(n) => Some(*n),
        ExprKind::Paren(inner) => const_number(inner),
        ExprKind::Unary {
            op: UnOp::Neg,
            operand,
        } => const_number(operand).map(|n| -n),
        ExprKind::Binary {
            op: BinOp::Arith(op),
            lhs,
            rhs,
        } => {
            let (a, b) = (const_number(lhs)?, const_number(rhs)?);
            let v = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div if b != 0.0 => a / b,
                ArithOp::Pow => a.powf(b),
                _ => return None,
            };
            v.is_finite().then_some(v)
        }
        _ => None,
    }
}

/// Collect the operands of a right-nested `..` chain.
fn flatten_concat<'a>(e: &'a Expr, out: &mut Vec<&'a Expr>) {
    match &e.kind {
        ExprKind::Binary {
            op: BinOp::Concat,
            lhs,
            rhs,
        } => {
            flatten_concat(lhs, out);
            flatten_concat(rhs, out);
        }
        _ => out.push(e),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lunar_parser::Parser;

    fn compile(src: &str) -> Rc<Proto> {
        let block = Parser::new(src).unwrap().parse().unwrap();
        Compiler::new("test").compile(&block).unwrap()
    }

    fn compile_err(src: &str) -> String {
        let block = Parser::new(src).unwrap().parse().unwrap();
        match Compiler::new("test").compile(&block) {
            Err(LuaError::Compile { message, .. }) => message,
            other => panic!("expected a compile error, got {other:?}"),
        }
    }

    #[test]
    fn empty_chunk_returns() {
        let p = compile("");
        assert_eq!(p.instructions, vec![OpCode::Return { src: 0, count: 0 }]);
        assert!(p.is_vararg);
    }

    #[test]
    fn locals_use_consecutive_registers() {
        let p = compile("local a, b = 1, 2 local c = a");
        assert!(p.instructions.contains(&OpCode::Move { dst: 2, src: 0 }));
        assert!(p.frame_size >= 3);
    }

    #[test]
    fn globals_go_through_name_table() {
        let p = compile("x = y");
        assert!(p.names.iter().any(|n| &**n == "x"));
        assert!(matches!(p.instructions[0], OpCode::GetGlobal { .. }));
        assert!(matches!(p.instructions[1], OpCode::SetGlobal { .. }));
    }

    #[test]
    fn negative_literal_is_folded() {
        let p = compile("local x = -2 * 3");
        assert!(matches!(p.instructions[0], OpCode::LoadConst { .. }));
        assert!(matches!(p.constants[0], Constant::Number(n) if n == -6.0));
    }

    #[test]
    fn folding_can_be_disabled() {
        let block = Parser::new("local x = -2").unwrap().parse().unwrap();
        let p = Compiler::new("t")
            .with_config(CompilerConfig {
                fold_constants: false,
            })
            .compile(&block)
            .unwrap();
        assert!(p.instructions.iter().any(|op| matches!(op, OpCode::Unm { .. })));
    }

    #[test]
    fn upvalues_chain_through_enclosing_functions() {
        let p = compile("local x = 1 return function() return function() return x end end");
        let outer = &p.protos[0];
        let inner = &outer.protos[0];
        assert_eq!(outer.upvalue_descs, vec![UpvalueDesc::Stack(0)]);
        assert_eq!(inner.upvalue_descs, vec![UpvalueDesc::Upvalue(0)]);
        assert_eq!(&*inner.upvalue_names[0], "x");
    }

    #[test]
    fn captured_loop_local_is_closed_each_iteration() {
        let p = compile("local fs = {} for i = 1, 3 do local j = i fs[i] = function() return j end end");
        assert!(p.instructions.iter().any(|op| matches!(op, OpCode::Close { .. })));
    }

    #[test]
    fn multiple_results_are_open() {
        let p = compile("return f()");
        assert!(p
            .instructions
            .iter()
            .any(|op| matches!(op, OpCode::TailCall { nargs: 0, .. })));
        let p = compile("return 1, ...");
        assert!(p.instructions.contains(&OpCode::VarArg { dst: 1, count: MULTI }));
    }

    #[test]
    fn method_call_passes_self() {
        let p = compile("obj:m(1)");
        assert!(p.instructions.iter().any(|op| matches!(op, OpCode::Method { .. })));
        assert!(p
            .instructions
            .iter()
            .any(|op| matches!(op, OpCode::Call { nargs: 2, nresults: 0, .. })));
    }

    #[test]
    fn concat_chain_is_one_instruction() {
        let p = compile("local s = 'a' .. 'b' .. 'c' .. 'd'");
        let concats = p
            .instructions
            .iter()
            .filter(|op| matches!(op, OpCode::Concat { count: 4, .. }))
            .count();
        assert_eq!(concats, 1);
    }

    #[test]
    fn temporaries_are_released_after_each_statement() {
        let p = compile("local a = 1 x = a + a * (a - 1) y = {a, a, a} local b = 2 return b");
        assert!(p.instructions.contains(&OpCode::Return { src: 1, count: 1 }));
    }

    #[test]
    fn break_outside_loop() {
        assert_eq!(compile_err("break"), "break outside a loop at line 1");
        assert_eq!(compile_err("local function f() break end"), "break outside a loop at line 1");
    }

    #[test]
    fn goto_without_label() {
        assert_eq!(compile_err("goto nowhere"), "no visible label 'nowhere' for goto at line 1");
    }

    #[test]
    fn goto_into_local_scope() {
        assert_eq!(
            compile_err("goto skip local x = 1 ::skip:: print(x)"),
            "<goto skip> at line 1 jumps into the scope of local 'x'"
        );
    }

    #[test]
    fn goto_to_block_end_is_allowed() {
        compile("for i = 1, 3 do if i == 2 then goto continue end local x = i ::continue:: end");
    }

    #[test]
    fn goto_into_nested_block_is_invisible() {
        assert!(compile_err("goto inner do ::inner:: end").starts_with("no visible label"));
    }

    #[test]
    fn duplicate_label() {
        assert_eq!(
            compile_err("::a:: ::a::"),
            "label 'a' already defined on line 1"
        );
    }

    #[test]
    fn const_and_close_locals() {
        assert_eq!(
            compile_err("local x <const> = 1 x = 2"),
            "attempt to assign to const variable 'x'"
        );
        assert_eq!(
            compile_err("local x <const> = 1 function f() x = 2 end"),
            "attempt to assign to const variable 'x'"
        );
        assert_eq!(compile_err("local x <frozen> = 1"), "unknown attribute 'frozen'");
        let p = compile("local x <close> = nil");
        assert!(p.instructions.contains(&OpCode::Tbc { reg: 0 }));
    }

    #[test]
    fn non_assignable_target() {
        assert!(compile_err("f() = 1").contains("cannot assign"));
    }

    #[test]
    fn vararg_outside_vararg_function() {
        assert_eq!(
            compile_err("function f() return ... end"),
            "cannot use '...' outside a vararg function"
        );
    }

    #[test]
    fn too_many_locals() {
        let src: String = (0..201).map(|i| format!("local v{i} = {i}\n")).collect();
        assert!(compile_err(&src).starts_with("too many local variables"));
    }

    #[test]
    fn function_path_walks_fields() {
        let p = compile("function a.b.c:m() end");
        let gets = p.instructions.iter().filter(|op| matches!(op, OpCode::GetField { .. })).count();
        assert_eq!(gets, 2);
        assert!(matches!(p.instructions.last(), Some(OpCode::Return { .. })));
        assert!(p.protos[0].param_count == 1);
    }

    #[test]
    fn constructor_keys() {
        let p = compile("local t = {x = 1, ['y'] = 2, [3] = 4, 5}");
        let fields = p.instructions.iter().filter(|op| matches!(op, OpCode::SetField { .. })).count();
        assert_eq!(fields, 2);
        assert!(p.instructions.iter().any(|op| matches!(op, OpCode::SetTable { .. })));
        assert!(p.instructions.iter().any(|op| matches!(op, OpCode::SetList { count: 1, offset: 0, .. })));
    }

    #[test]
    fn long_constructor_flushes_in_batches() {
        let items: Vec<String> = (0..120).map(|i| i.to_string()).collect();
        let p = compile(&format!("local t = {{{}}}", items.join(", ")));
        let offsets: Vec<u32> = p
            .instructions
            .iter()
            .filter_map(|op| match op {
                OpCode::SetList { offset, .. } => Some(*offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 50, 100]);
    }

    #[test]
    fn comparison_swaps_for_greater() {
        let p = compile("local a, b = 1, 2 local c = a > b");
        assert!(p.instructions.contains(&OpCode::Lt { dst: 2, lhs: 1, rhs: 0 }));
    }

    #[test]
    fn lines_are_recorded() {
        let p = compile("local a = 1\n\nx = a");
        let set = p
            .instructions
            .iter()
            .position(|op| matches!(op, OpCode::SetGlobal { .. }))
            .unwrap();
        assert_eq!(p.line_at(set), 3);
    }
}
