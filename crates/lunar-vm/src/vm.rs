use crate::coroutine::{Coroutine, FrameKind, ThreadState};
use crate::error::Error;
use crate::heap::{Gc, Heap};
use crate::table::Table;
use crate::value::{Closure, Upval, Value};
use lunar_core::{CompilerConfig, Constant, OpCode, VmConfig, MULTI};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;
use std::rc::Rc;
use tracing::debug;

/// Result of starting a call.
pub(crate) enum Called {
    /// A Lua frame was pushed; the dispatch loop continues in it.
    Lua,
    /// A native ran to completion.
    Native(Vec<Value>),
}

// ── VM ────────────────────────────────────────────────────────────────────────

/// Register-based virtual machine and the state it runs against.
///
/// One `Vm` is one independent runtime: its own heap, globals, module paths
/// and threads. It is single threaded; nothing in it is `Send`.
pub struct Vm {
    pub(crate) heap: Heap,
    /// State of the running thread. Every other thread keeps its own state
    /// inside its [`Coroutine`] object.
    pub(crate) thread: ThreadState,
    pub(crate) main: Gc<Coroutine>,
    pub(crate) current: Gc<Coroutine>,
    /// Threads waiting on a `resume` further up, outermost first.
    pub(crate) resume_chain: Vec<Gc<Coroutine>>,
    pub(crate) globals: Gc<Table>,
    pub(crate) registry: Gc<Table>,
    pub(crate) loaded: Gc<Table>,
    pub(crate) string_meta: Option<Gc<Table>>,
    /// Registered module prefixes, in registration order.
    pub(crate) paths: Vec<String>,
    pub(crate) output: Box<dyn Write>,
    pub(crate) config: VmConfig,
    pub(crate) compiler_config: CompilerConfig,
    /// Rust frames between the outermost entry and the running code.
    pub(crate) native_depth: usize,
    /// Values a native keeps alive across a re-entry.
    pub(crate) scratch: Vec<Value>,
    /// Captured values of the natives currently executing, innermost last.
    pub(crate) native_upvalues: Vec<Rc<[Value]>>,
    pub(crate) rng: StdRng,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut heap = Heap::new(&config);
        let main = heap.alloc(Coroutine::main());
        let globals = heap.alloc(Table::new());
        let registry = heap.alloc(Table::new());
        let loaded = heap.alloc(Table::new());
        heap.get_mut(registry).set_str("_LOADED", Value::Table(loaded));

        let mut vm = Vm {
            heap,
            thread: ThreadState::default(),
            main,
            current: main,
            resume_chain: Vec::new(),
            globals,
            registry,
            loaded,
            string_meta: None,
            paths: Vec::new(),
            output: Box::new(std::io::stdout()),
            config,
            compiler_config: CompilerConfig::default(),
            native_depth: 0,
            scratch: Vec::new(),
            native_upvalues: Vec::new(),
            rng: StdRng::from_entropy(),
        };
        crate::stdlib::open_all(&mut vm);
        debug!(target: "lunar::state", objects = vm.heap.live(), "state created");
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn set_compiler_config(&mut self, config: CompilerConfig) {
        self.compiler_config = config;
    }

    pub fn globals(&self) -> Gc<Table> {
        self.globals
    }

    pub fn table(&self, t: Gc<Table>) -> &Table {
        self.heap.get(t)
    }

    pub fn table_mut(&mut self, t: Gc<Table>) -> &mut Table {
        self.heap.get_mut(t)
    }

    pub fn new_table(&mut self) -> Gc<Table> {
        self.heap.alloc(Table::new())
    }

    pub fn alloc_table(&mut self, table: Table) -> Gc<Table> {
        self.heap.alloc(table)
    }

    /// Objects currently allocated on the heap.
    pub fn live_objects(&self) -> usize {
        self.heap.live()
    }

    /// Captured value `i` of the native that is currently executing.
    pub fn native_upvalue(&self, i: usize) -> Value {
        self.native_upvalues
            .last()
            .and_then(|ups| ups.get(i))
            .cloned()
            .unwrap_or_default()
    }

    /// Runtime error carrying the `chunk:line:` position of the running Lua code.
    pub fn rt_error(&self, msg: impl Into<String>) -> Error {
        let msg = msg.into();
        match self.position(1) {
            Some(pos) => Error::runtime(format!("{pos} {msg}")),
            None => Error::runtime(msg),
        }
    }

    /// `chunk:line:` of the Lua frame `level` steps down from the top (1 = top).
    pub(crate) fn position(&self, level: usize) -> Option<String> {
        let frames = &self.thread.frames;
        let frame = frames.len().checked_sub(level).and_then(|i| frames.get(i))?;
        Some(format!("{}:{}:", frame.proto.source, frame.current_line()))
    }

    // ── Execution ─────────────────────────────────────────────────────────────

    /// Run frames above `stop` to completion, routing errors to protected
    /// frames. Returns the values of the frame at depth `stop`.
    pub(crate) fn execute(&mut self, stop: usize) -> Result<Vec<Value>, Error> {
        loop {
            match self.run_frames(stop) {
                Ok(values) => return Ok(values),
                Err(Error::Yield(values)) => return Err(Error::Yield(values)),
                Err(err) => {
                    if let Some(values) = self.unwind(err, stop)? {
                        return Ok(values);
                    }
                }
            }
        }
    }

    /// Pop frames down to the innermost protected frame above `stop`, closing
    /// their variables. `Ok(Some)` when that frame was the entry frame itself.
    fn unwind(&mut self, err: Error, stop: usize) -> Result<Option<Vec<Value>>, Error> {
        let frames = &self.thread.frames;
        let catcher = (stop..frames.len())
            .rev()
            .find(|&i| matches!(frames[i].kind, FrameKind::Protected { .. }));

        let Some(i) = catcher else {
            let traceback: Vec<String> = self.thread.frames[stop.min(frames.len())..]
                .iter()
                .rev()
                .map(|f| {
                    let what = if f.proto.line_defined == 0 {
                        "main chunk".to_string()
                    } else {
                        format!("function <{}:{}>", f.proto.source, f.proto.line_defined)
                    };
                    format!("{}:{}: in {}", f.proto.source, f.current_line(), what)
                })
                .collect();
            let level = self.thread.frames.get(stop).map(|f| f.base);
            let mut err = match level {
                Some(level) => self.close_with_error(level, err),
                None => err,
            };
            self.thread.frames.truncate(stop);
            if let Error::Runtime { traceback: tb, .. } = &mut err {
                tb.extend(traceback);
            }
            return Err(err);
        };

        let level = self.thread.frames[i].base;
        let err = self.close_with_error(level, err);
        self.thread.frames.truncate(i + 1);
        let Some(frame) = self.thread.frames.pop() else {
            return Err(err);
        };
        debug!(target: "lunar::vm", depth = i, error = %err, "error caught by protected call");

        let value = match frame.kind {
            FrameKind::Protected {
                handler: Some(handler),
            } => match self.call(handler, vec![err.into_value()]) {
                Ok(results) => results.into_iter().next().unwrap_or_default(),
                Err(e) => e.into_value(),
            },
            _ => err.into_value(),
        };
        let values = vec![Value::Boolean(false), value];
        if i == stop {
            return Ok(Some(values));
        }
        self.place_results(values, frame.ret_slot, frame.nresults)?;
        Ok(None)
    }

    // ── Core interpreter loop ─────────────────────────────────────────────────

    fn run_frames(&mut self, stop: usize) -> Result<Vec<Value>, Error> {
        'frames: loop {
            let Some(frame) = self.thread.frames.last() else {
                return Ok(Vec::new());
            };
            let proto = Rc::clone(&frame.proto);
            let closure = frame.closure;
            let base = frame.base;

            macro_rules! reg {
                ($r:expr) => {
                    self.thread.stack[base + ($r as usize)]
                };
            }

            loop {
                if self.heap.should_collect() {
                    self.collect_garbage();
                }

                let pc = match self.thread.frames.last_mut() {
                    Some(frame) => {
                        frame.pc += 1;
                        frame.pc - 1
                    }
                    None => return Ok(Vec::new()),
                };
                let op = proto.instructions[pc];

                match op {
                    OpCode::LoadConst { dst, const_idx } => {
                        reg!(dst) = constant_value(&proto.constants[const_idx as usize]);
                    }
                    OpCode::LoadNil { dst, count } => {
                        for i in 0..count as usize {
                            reg!(dst as usize + i) = Value::Nil;
                        }
                    }
                    OpCode::LoadBool { dst, value } => reg!(dst) = Value::Boolean(value),
                    OpCode::Move { dst, src } => reg!(dst) = reg!(src).clone(),

                    // ── Arithmetic ────────────────────────────────────────────
                    OpCode::Arith { op, dst, lhs, rhs } => {
                        let v = match (&reg!(lhs), &reg!(rhs)) {
                            (Value::Number(a), Value::Number(b)) if !op.is_bitwise() => {
                                Value::Number(crate::arith::apply(op, *a, *b).unwrap_or(f64::NAN))
                            }
                            (a, b) => {
                                let (a, b) = (a.clone(), b.clone());
                                self.arith(op, &a, &b)?
                            }
                        };
                        reg!(dst) = v;
                    }
                    OpCode::Unm { dst, src } => {
                        let v = match &reg!(src) {
                            Value::Number(n) => Value::Number(-n),
                            other => {
                                let other = other.clone();
                                self.unm(&other)?
                            }
                        };
                        reg!(dst) = v;
                    }
                    OpCode::BNot { dst, src } => {
                        let v = reg!(src).clone();
                        reg!(dst) = self.bnot(&v)?;
                    }
                    OpCode::Not { dst, src } => reg!(dst) = Value::Boolean(!reg!(src).is_truthy()),
                    OpCode::Len { dst, src } => {
                        let v = reg!(src).clone();
                        reg!(dst) = self.len(&v)?;
                    }
                    OpCode::Concat { dst, start, count } => {
                        let from = base + start as usize;
                        let values = self.thread.stack[from..from + count as usize].to_vec();
                        reg!(dst) = self.concat(values)?;
                    }

                    // ── Comparison ────────────────────────────────────────────
                    OpCode::Eq { dst, lhs, rhs } => {
                        let (a, b) = (reg!(lhs).clone(), reg!(rhs).clone());
                        reg!(dst) = Value::Boolean(self.equals(&a, &b)?);
                    }
                    OpCode::Lt { dst, lhs, rhs } => {
                        let v = match (&reg!(lhs), &reg!(rhs)) {
                            (Value::Number(a), Value::Number(b)) => a < b,
                            (a, b) => {
                                let (a, b) = (a.clone(), b.clone());
                                self.less_than(&a, &b)?
                            }
                        };
                        reg!(dst) = Value::Boolean(v);
                    }
                    OpCode::Le { dst, lhs, rhs } => {
                        let v = match (&reg!(lhs), &reg!(rhs)) {
                            (Value::Number(a), Value::Number(b)) => a <= b,
                            (a, b) => {
                                let (a, b) = (a.clone(), b.clone());
                                self.less_equal(&a, &b)?
                            }
                        };
                        reg!(dst) = Value::Boolean(v);
                    }

                    // ── Control flow ──────────────────────────────────────────
                    OpCode::Jump { offset } => self.jump(offset),
                    OpCode::JumpIfFalse { src, offset } => {
                        if !reg!(src).is_truthy() {
                            self.jump(offset);
                        }
                    }
                    OpCode::JumpIfTrue { src, offset } => {
                        if reg!(src).is_truthy() {
                            self.jump(offset);
                        }
                    }

                    // ── Globals ───────────────────────────────────────────────
                    OpCode::GetGlobal { dst, name_idx } => {
                        let name = &proto.names[name_idx as usize];
                        let globals = self.heap.get(self.globals);
                        let v = match globals.get_str(name) {
                            Value::Nil if globals.metatable.is_some() => self
                                .index(Value::Table(self.globals), Value::Str(Rc::clone(name)))?,
                            v => v,
                        };
                        reg!(dst) = v;
                    }
                    OpCode::SetGlobal { src, name_idx } => {
                        let name = Value::Str(Rc::clone(&proto.names[name_idx as usize]));
                        let v = reg!(src).clone();
                        if self.heap.get(self.globals).metatable.is_some() {
                            self.set_index(Value::Table(self.globals), name, v)?;
                        } else {
                            self.heap.get_mut(self.globals).set(name, v);
                        }
                    }

                    // ── Upvalues ──────────────────────────────────────────────
                    OpCode::GetUpvalue { dst, upval_idx } => {
                        let uv = self.heap.get(closure).upvalues[upval_idx as usize];
                        reg!(dst) = self.upval_get(uv);
                    }
                    OpCode::SetUpvalue { src, upval_idx } => {
                        let uv = self.heap.get(closure).upvalues[upval_idx as usize];
                        let v = reg!(src).clone();
                        self.upval_set(uv, v);
                    }

                    // ── Closures ──────────────────────────────────────────────
                    OpCode::Closure { dst, proto_idx } => {
                        let child = Rc::clone(&proto.protos[proto_idx as usize]);
                        let mut upvalues = Vec::with_capacity(child.upvalue_descs.len());
                        for desc in &child.upvalue_descs {
                            upvalues.push(match *desc {
                                lunar_core::UpvalueDesc::Stack(r) => self.find_upval(base + r as usize),
                                lunar_core::UpvalueDesc::Upvalue(i) => {
                                    self.heap.get(closure).upvalues[i as usize]
                                }
                            });
                        }
                        let f = self.heap.alloc(Closure {
                            proto: child,
                            upvalues,
                        });
                        reg!(dst) = Value::Function(f);
                    }
                    OpCode::Close { from } => self.close_slots(base + from as usize, None)?,
                    OpCode::Tbc { reg } => {
                        let v = reg!(reg).clone();
                        if v.is_truthy() && self.metamethod(&v, "__close").is_nil() {
                            return Err(self.rt_error("variable got a non-closable value"));
                        }
                        self.thread.tbc.push(base + reg as usize);
                    }

                    // ── Tables ────────────────────────────────────────────────
                    OpCode::NewTable { dst } => {
                        reg!(dst) = Value::Table(self.heap.alloc(Table::new()));
                    }
                    OpCode::GetTable { dst, table, key } => {
                        let (t, k) = (reg!(table).clone(), reg!(key).clone());
                        reg!(dst) = self.index(t, k)?;
                    }
                    OpCode::SetTable { table, key, val } => {
                        let (t, k, v) = (reg!(table).clone(), reg!(key).clone(), reg!(val).clone());
                        self.set_index(t, k, v)?;
                    }
                    OpCode::GetField {
                        dst,
                        table,
                        name_idx,
                    } => {
                        let name = &proto.names[name_idx as usize];
                        let raw = match &reg!(table) {
                            Value::Table(t) => self.heap.get(*t).get_str(name),
                            _ => Value::Nil,
                        };
                        let v = if raw.is_nil() {
                            let t = reg!(table).clone();
                            self.index(t, Value::Str(Rc::clone(name)))?
                        } else {
                            raw
                        };
                        reg!(dst) = v;
                    }
                    OpCode::SetField {
                        table,
                        name_idx,
                        val,
                    } => {
                        let name = Value::Str(Rc::clone(&proto.names[name_idx as usize]));
                        let (t, v) = (reg!(table).clone(), reg!(val).clone());
                        self.set_index(t, name, v)?;
                    }
                    OpCode::SetList {
                        table,
                        src,
                        count,
                        offset,
                    } => {
                        let from = base + src as usize;
                        let n = if count == MULTI {
                            self.thread.top.saturating_sub(from)
                        } else {
                            count as usize
                        };
                        if let Value::Table(t) = reg!(table) {
                            let values = self.thread.stack[from..from + n].to_vec();
                            let t = self.heap.get_mut(t);
                            for (i, v) in values.into_iter().enumerate() {
                                t.set_int(offset as usize + i + 1, v);
                            }
                        }
                    }
                    OpCode::Method { dst, obj, name_idx } => {
                        let name = Value::Str(Rc::clone(&proto.names[name_idx as usize]));
                        let o = reg!(obj).clone();
                        let f = self.index(o.clone(), name)?;
                        reg!(dst as usize + 1) = o;
                        reg!(dst) = f;
                    }

                    // ── Function calls ────────────────────────────────────────
                    OpCode::Call {
                        func,
                        nargs,
                        nresults,
                    } => {
                        let slot = base + func as usize;
                        let nargs = self.arg_count(slot, nargs);
                        match self.precall(slot, nargs, nresults)? {
                            Called::Lua => continue 'frames,
                            Called::Native(values) => self.place_results(values, slot, nresults)?,
                        }
                    }
                    OpCode::TailCall { func, nargs } => {
                        let slot = base + func as usize;
                        let nargs = self.arg_count(slot, nargs);
                        let Some(nargs) = self.tail_call(slot, nargs)? else {
                            continue 'frames;
                        };
                        // Not a Lua function: call normally; the Return that
                        // follows hands the results back.
                        match self.precall(slot, nargs, MULTI)? {
                            Called::Lua => continue 'frames,
                            Called::Native(values) => self.place_results(values, slot, MULTI)?,
                        }
                    }
                    OpCode::Return { src, count } => {
                        let from = base + src as usize;
                        let to = if count == MULTI {
                            self.thread.top.max(from)
                        } else {
                            from + count as usize
                        };
                        let values = self.thread.stack[from..to].to_vec();
                        match self.finish_frame(values, stop)? {
                            Some(values) => return Ok(values),
                            None => continue 'frames,
                        }
                    }
                    OpCode::VarArg { dst, count } => {
                        let varargs = match self.thread.frames.last() {
                            Some(frame) => frame.varargs.clone(),
                            None => Vec::new(),
                        };
                        self.place_results(varargs, base + dst as usize, count)?;
                    }

                    // ── Loops ─────────────────────────────────────────────────
                    OpCode::ForPrep { base: b, offset } => {
                        let init = match reg!(b).as_number() {
                            Some(n) => n,
                            None => return Err(self.rt_error("'for' initial value must be a number")),
                        };
                        let limit = match reg!(b as usize + 1).as_number() {
                            Some(n) => n,
                            None => return Err(self.rt_error("'for' limit must be a number")),
                        };
                        let step = match reg!(b as usize + 2).as_number() {
                            Some(n) => n,
                            None => return Err(self.rt_error("'for' step must be a number")),
                        };
                        if step == 0.0 {
                            return Err(self.rt_error("'for' step is zero"));
                        }
                        let runs = if step > 0.0 { init <= limit } else { init >= limit };
                        if runs {
                            reg!(b as usize + 3) = Value::Number(init);
                        } else {
                            self.jump(offset);
                        }
                    }
                    OpCode::ForLoop { base: b, offset } => {
                        let step = reg!(b as usize + 2).as_number().unwrap_or(0.0);
                        let limit = reg!(b as usize + 1).as_number().unwrap_or(0.0);
                        let next = reg!(b).as_number().unwrap_or(0.0) + step;
                        let more = if step > 0.0 { next <= limit } else { next >= limit };
                        if more {
                            reg!(b) = Value::Number(next);
                            reg!(b as usize + 3) = Value::Number(next);
                            self.jump(offset);
                        }
                    }
                    OpCode::TForCall { base: b, nvars } => {
                        let from = base + b as usize;
                        self.ensure_stack(from + 6)?;
                        for i in 0..3 {
                            self.thread.stack[from + 3 + i] = self.thread.stack[from + i].clone();
                        }
                        match self.precall(from + 3, 2, nvars)? {
                            Called::Lua => continue 'frames,
                            Called::Native(values) => self.place_results(values, from + 3, nvars)?,
                        }
                    }
                    OpCode::TForLoop { base: b, offset } => {
                        let control = reg!(b as usize + 3).clone();
                        if !control.is_nil() {
                            reg!(b as usize + 2) = control;
                            self.jump(offset);
                        }
                    }
                }
            }
        }
    }

    fn jump(&mut self, offset: i32) {
        if let Some(frame) = self.thread.frames.last_mut() {
            frame.pc = (frame.pc as i64 + offset as i64) as usize;
        }
    }

    /// Resolve a `MULTI` argument count against the open top.
    fn arg_count(&self, slot: usize, nargs: u8) -> usize {
        if nargs == MULTI {
            self.thread.top.saturating_sub(slot + 1)
        } else {
            nargs as usize
        }
    }
}

pub(crate) fn constant_value(c: &Constant) -> Value {
    match c {
        Constant::Nil => Value::Nil,
        Constant::Boolean(b) => Value::Boolean(*b),
        Constant::Number(n) => Value::Number(*n),
        Constant::Str(s) => Value::Str(Rc::clone(s)),
    }
}

/// Upvalue cells are read through the VM because open cells alias a stack.
impl Vm {
    pub(crate) fn upval_get(&self, uv: Gc<Upval>) -> Value {
        match self.heap.get(uv) {
            Upval::Closed(v) => v.clone(),
            Upval::Open { thread, slot } if *thread == self.current => {
                self.thread.stack[*slot].clone()
            }
            Upval::Open { thread, slot } => self
                .heap
                .get(*thread)
                .state
                .as_ref()
                .and_then(|s| s.stack.get(*slot))
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub(crate) fn upval_set(&mut self, uv: Gc<Upval>, value: Value) {
        match self.heap.get_mut(uv) {
            Upval::Closed(v) => *v = value,
            &mut Upval::Open { thread, slot } => {
                if thread == self.current {
                    self.thread.stack[slot] = value;
                } else if let Some(state) = self.heap.get_mut(thread).state.as_mut() {
                    if let Some(s) = state.stack.get_mut(slot) {
                        *s = value;
                    }
                }
            }
        }
    }

    /// Open cell for stack `slot`, shared with any closure that captured it already.
    pub(crate) fn find_upval(&mut self, slot: usize) -> Gc<Upval> {
        let open = &self.thread.open_upvals;
        match open.binary_search_by_key(&slot, |(s, _)| *s) {
            Ok(i) => open[i].1,
            Err(i) => {
                let uv = self.heap.alloc(Upval::Open {
                    thread: self.current,
                    slot,
                });
                self.thread.open_upvals.insert(i, (slot, uv));
                uv
            }
        }
    }

    /// Copy the values of open cells at or above `level` into the cells.
    pub(crate) fn close_upvalues(&mut self, level: usize) {
        while let Some(&(slot, uv)) = self.thread.open_upvals.last() {
            if slot < level {
                break;
            }
            self.thread.open_upvals.pop();
            let v = self.thread.stack.get(slot).cloned().unwrap_or_default();
            *self.heap.get_mut(uv) = Upval::Closed(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str) -> Vec<Value> {
        Vm::new().exec(src, "test").unwrap()
    }

    fn num(src: &str) -> f64 {
        run(src)[0].as_number().unwrap()
    }

    fn run_err(src: &str) -> String {
        Vm::new().exec(src, "test").unwrap_err().to_string()
    }

    // ── Literals and arithmetic ──────────────────────────────────────────────

    #[test]
    fn returns_literals() {
        let v = run("return 1, 'two', true, nil");
        assert_eq!(v.len(), 4);
        assert_eq!(v[0].as_number(), Some(1.0));
        assert_eq!(v[1].to_string(), "two");
        assert!(matches!(v[2], Value::Boolean(true)));
        assert!(v[3].is_nil());
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(num("return 2 + 3 * 4 ^ 2 / 8"), 8.0);
        assert_eq!(num("return 7 // 2"), 3.0);
        assert_eq!(num("return -7 % 3"), 2.0);
        assert_eq!(num("return 5.5 % -2"), -0.5);
        assert_eq!(num("local a = 2 return -a ^ 2"), -4.0);
    }

    #[test]
    fn string_coercion_in_arithmetic() {
        assert_eq!(num("return '10' + 5"), 15.0);
        assert_eq!(num("return '0x10' * 2"), 32.0);
    }

    #[test]
    fn bitwise_operators() {
        assert_eq!(num("return 6 & 3"), 2.0);
        assert_eq!(num("return 6 | 3"), 7.0);
        assert_eq!(num("return 6 ~ 3"), 5.0);
        assert_eq!(num("return 1 << 4"), 16.0);
        assert_eq!(num("return 256 >> 4"), 16.0);
        assert_eq!(num("return ~0"), -1.0);
        assert!(run_err("return 1.5 | 0").contains("number has no integer representation"));
    }

    #[test]
    fn arithmetic_on_bad_operand_errors_with_position() {
        assert_eq!(
            run_err("local t = {}\nreturn t + 1"),
            "test:2: attempt to perform arithmetic on a table value"
        );
        assert_eq!(
            run_err("return 1 < nil"),
            "test:1: attempt to compare number with nil"
        );
        assert_eq!(
            run_err("return {} < {}"),
            "test:1: attempt to compare two table values"
        );
    }

    // ── Control flow ─────────────────────────────────────────────────────────

    #[test]
    fn numeric_for_accumulates() {
        assert_eq!(num("local s = 0 for i = 1, 10 do s = s + i end return s"), 55.0);
        assert_eq!(num("local s = 0 for i = 10, 1, -2 do s = s + i end return s"), 30.0);
        assert_eq!(num("local n = 0 for i = 1, 0 do n = n + 1 end return n"), 0.0);
        assert!(run_err("for i = 1, 10, 0 do end").contains("'for' step is zero"));
    }

    #[test]
    fn generic_for_with_pairs_and_ipairs() {
        assert_eq!(
            num("local s = 0 for _, v in ipairs({1, 2, 3, nil, 5}) do s = s + v end return s"),
            6.0
        );
        assert_eq!(
            num("local s = 0 for k, v in pairs({a = 1, b = 2, 3}) do s = s + v end return s"),
            6.0
        );
    }

    #[test]
    fn while_repeat_break_goto() {
        assert_eq!(num("local i = 0 while true do i = i + 1 if i == 5 then break end end return i"), 5.0);
        assert_eq!(num("local i = 0 repeat local j = i i = i + 1 until j >= 3 return i"), 4.0);
        assert_eq!(
            num("local i = 1 ::top:: i = i * 2 if i < 100 then goto top end return i"),
            128.0
        );
    }

    // ── Functions and closures ───────────────────────────────────────────────

    #[test]
    fn closure_counter_shares_upvalue() {
        let v = run(
            "local function counter()
                local n = 0
                return function() n = n + 1 return n end
             end
             local c = counter()
             c()
             local a = c()
             local b = c()
             return a, b, c()",
        );
        let nums: Vec<f64> = v.iter().filter_map(Value::as_number).collect();
        assert_eq!(nums, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn loop_closures_capture_fresh_variables() {
        assert_eq!(
            num("local fs = {} for i = 1, 3 do fs[i] = function() return i end end
                 return fs[1]() + fs[2]() * 10 + fs[3]() * 100"),
            321.0
        );
    }

    #[test]
    fn varargs_and_multiple_results() {
        assert_eq!(num("local function f(...) return select('#', ...) end return f(1, nil, 3)"), 3.0);
        let v = run("local function f() return 1, 2, 3 end return f()");
        assert_eq!(v.len(), 3);
        let v = run("local function f() return 1, 2, 3 end return (f())");
        assert_eq!(v.len(), 1);
        let v = run("local function f() return 1, 2 end local t = {f(), f()} return #t");
        assert_eq!(v[0].as_number(), Some(3.0));
    }

    #[test]
    fn deep_tail_recursion_does_not_grow_the_stack() {
        assert_eq!(
            num("local function loop(n) if n == 0 then return 'done' end return loop(n - 1) end
                 return select('#', loop(100000))"),
            1.0
        );
    }

    #[test]
    fn unbounded_recursion_overflows() {
        assert!(run_err("local function f() return 1 + f() end return f()").contains("stack overflow"));
    }

    #[test]
    fn method_calls_pass_self() {
        assert_eq!(
            num("local obj = {v = 41} function obj:get(d) return self.v + d end return obj:get(1)"),
            42.0
        );
    }

    #[test]
    fn calling_nil_is_an_error() {
        assert_eq!(run_err("local x\nx()"), "test:2: attempt to call a nil value");
    }

    // ── Protected calls ──────────────────────────────────────────────────────

    #[test]
    fn pcall_catches_runtime_errors() {
        let v = run("return pcall(function() local t = nil; return t.x end)");
        assert!(matches!(v[0], Value::Boolean(false)));
        assert!(v[1].to_string().contains("attempt to index a nil value"));
    }

    #[test]
    fn pcall_passes_error_values_through() {
        let v = run("local ok, e = pcall(error, {code = 7}) return ok, e.code");
        assert!(matches!(v[0], Value::Boolean(false)));
        assert_eq!(v[1].as_number(), Some(7.0));
        let v = run("return pcall(function(a, b) return a + b end, 2, 3)");
        assert!(matches!(v[0], Value::Boolean(true)));
        assert_eq!(v[1].as_number(), Some(5.0));
    }

    #[test]
    fn xpcall_runs_handler() {
        let v = run("return xpcall(function() error('boom', 0) end, function(m) return 'handled: ' .. m end)");
        assert_eq!(v[1].to_string(), "handled: boom");
    }

    #[test]
    fn error_levels_and_positions() {
        assert_eq!(run_err("error('plain', 0)"), "plain");
        assert_eq!(run_err("\nerror('here')"), "test:2: here");
        assert_eq!(
            run_err("local function check(x) if not x then error('bad input', 2) end end\ncheck(false)"),
            "test:2: bad input"
        );
    }

    #[test]
    fn runtime_errors_carry_a_traceback() {
        let err = Vm::new()
            .exec("local function f() error('x') end\nf()", "tb")
            .unwrap_err();
        assert_eq!(err.kind(), "runtime");
        assert_eq!(err.traceback().len(), 2);
        assert!(err.traceback()[1].contains("main chunk"));
    }

    // ── To-be-closed variables ───────────────────────────────────────────────

    #[test]
    fn close_handlers_run_in_reverse_order() {
        let v = run(
            "local log = {}
             local function closer(name)
                 return setmetatable({}, {__close = function() log[#log + 1] = name end})
             end
             do
                 local a <close> = closer('a')
                 local b <close> = closer('b')
             end
             return table.concat(log, ',')",
        );
        assert_eq!(v[0].to_string(), "b,a");
    }

    #[test]
    fn close_handlers_see_the_error() {
        let v = run(
            "local seen
             local ok = pcall(function()
                 local x <close> = setmetatable({}, {__close = function(_, e) seen = e end})
                 error('oops', 0)
             end)
             return ok, seen",
        );
        assert!(matches!(v[0], Value::Boolean(false)));
        assert_eq!(v[1].to_string(), "oops");
    }

    #[test]
    fn non_closable_value_is_rejected() {
        assert!(run_err("local x <close> = 42").contains("non-closable"));
    }

    // ── Determinism ──────────────────────────────────────────────────────────

    #[test]
    fn same_program_same_config_same_results() {
        let src = "
            math.randomseed(42)
            local t = {}
            for i = 1, 50 do t['k' .. i] = i * i; t[i] = math.random(1, 1000) end
            local keys = {}
            for k, v in pairs(t) do keys[#keys + 1] = tostring(k) .. '=' .. tostring(v) end
            local co = coroutine.wrap(function(n)
                for i = 1, n do coroutine.yield(i * 0.5) end
            end)
            local acc = 0
            for _ = 1, 5 do acc = acc + co(5) end
            local ok, err = pcall(function() return nil .. 'x' end)
            table.sort(t, function(a, b) return a > b end)
            return table.concat(keys, ','), acc, ok, err, t[1], string.format('%.3f', 2 ^ 0.5)
        ";
        let config = VmConfig {
            gc_initial_threshold: 16,
            ..VmConfig::default()
        };
        let render = |values: Vec<Value>| values.iter().map(Value::to_string).collect::<Vec<_>>();
        let first = render(Vm::with_config(config.clone()).exec(src, "det").unwrap());
        let second = render(Vm::with_config(config.clone()).exec(src, "det").unwrap());
        assert_eq!(first, second);

        let mut vm = Vm::with_config(config);
        let rerun = render(vm.exec(src, "det").unwrap());
        assert_eq!(render(vm.exec(src, "det").unwrap()), rerun);
        assert_eq!(rerun, first);
        assert_eq!(first[1], "7.5");
        assert_eq!(first[2], "false");
    }
}
