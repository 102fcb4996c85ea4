//! Call, return and scope-exit protocol.

use crate::coroutine::{CallFrame, FrameKind, YieldDest};
use crate::error::Error;
use crate::heap::Gc;
use crate::value::{Closure, NativeFunction, NativeKind, Value};
use crate::vm::{Called, Vm};
use lunar_core::MULTI;
use std::rc::Rc;

impl Vm {
    /// Call `func` with `args` from Rust and collect every result.
    ///
    /// This is the entry point for hosts and the re-entry point for natives
    /// (metamethods, sort comparators, `require`). Each nesting level counts
    /// towards `VmConfig::max_native_depth`.
    pub fn call(&mut self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        if self.native_depth >= self.config.max_native_depth {
            return Err(self.rt_error("stack overflow"));
        }
        let slot = self.free_slot();
        let nargs = args.len();
        self.ensure_stack(slot + nargs + 1)?;
        self.thread.stack[slot] = func;
        for (i, arg) in args.into_iter().enumerate() {
            self.thread.stack[slot + 1 + i] = arg;
        }

        let saved_top = self.thread.top;
        let stop = self.thread.frames.len();
        self.native_depth += 1;
        self.thread.native_calls += 1;
        let result = match self.precall(slot, nargs, MULTI) {
            Ok(Called::Lua) => self.execute(stop),
            Ok(Called::Native(values)) => Ok(values),
            Err(err) => Err(err),
        };
        self.thread.native_calls -= 1;
        self.native_depth -= 1;
        self.thread.top = saved_top;
        result
    }

    /// First activation of a coroutine body on a fresh thread state.
    pub(crate) fn call_in_thread(&mut self, func: Value, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        let nargs = args.len();
        self.ensure_stack(nargs + 1)?;
        self.thread.stack[0] = func;
        for (i, arg) in args.into_iter().enumerate() {
            self.thread.stack[1 + i] = arg;
        }
        match self.precall(0, nargs, MULTI)? {
            Called::Lua => self.execute(0),
            Called::Native(values) => Ok(values),
        }
    }

    /// First stack slot not used by the running frame or an open value list.
    fn free_slot(&self) -> usize {
        let frame_end = self
            .thread
            .frames
            .last()
            .map_or(0, |f| f.base + f.proto.frame_size as usize);
        frame_end.max(self.thread.top)
    }

    pub(crate) fn ensure_stack(&mut self, needed: usize) -> Result<(), Error> {
        if needed > self.config.max_stack {
            return Err(self.rt_error("stack overflow"));
        }
        if self.thread.stack.len() < needed {
            self.thread.stack.resize(needed, Value::Nil);
        }
        Ok(())
    }

    /// Start calling `stack[slot]` with `nargs` arguments above it.
    pub(crate) fn precall(&mut self, slot: usize, nargs: usize, nresults: u8) -> Result<Called, Error> {
        let (callee, nargs) = self.resolve_callable(slot, nargs)?;
        match callee {
            Value::Function(f) => {
                self.push_frame(f, slot, nargs, slot, nresults, FrameKind::Lua)?;
                Ok(Called::Lua)
            }
            Value::Native(f) => self.call_native(f, slot, nargs, nresults),
            other => Err(self.rt_error(format!("attempt to call a {} value", other.type_name()))),
        }
    }

    /// Follow `__call` until a function sits at `slot`, shifting the
    /// arguments up by one for every hop.
    fn resolve_callable(&mut self, slot: usize, nargs: usize) -> Result<(Value, usize), Error> {
        let mut nargs = nargs;
        for _ in 0..=self.config.max_meta_chain {
            let callee = self.thread.stack[slot].clone();
            if matches!(callee, Value::Function(_) | Value::Native(_)) {
                return Ok((callee, nargs));
            }
            let handler = self.metamethod(&callee, "__call");
            if handler.is_nil() {
                return Err(self.rt_error(format!("attempt to call a {} value", callee.type_name())));
            }
            self.ensure_stack(slot + nargs + 2)?;
            for i in (slot..=slot + nargs).rev() {
                self.thread.stack[i + 1] = std::mem::take(&mut self.thread.stack[i]);
            }
            self.thread.stack[slot] = handler;
            nargs += 1;
        }
        Err(self.rt_error("'__call' chain too long; possible loop"))
    }

    fn push_frame(
        &mut self,
        closure: Gc<Closure>,
        func_slot: usize,
        nargs: usize,
        ret_slot: usize,
        nresults: u8,
        kind: FrameKind,
    ) -> Result<(), Error> {
        let proto = Rc::clone(&self.heap.get(closure).proto);
        let base = func_slot + 1;
        let nparams = proto.param_count as usize;
        let frame_size = proto.frame_size as usize;
        self.ensure_stack(base + frame_size.max(nargs) + 1)?;

        let varargs = if proto.is_vararg && nargs > nparams {
            self.thread.stack[base + nparams..base + nargs].to_vec()
        } else {
            Vec::new()
        };
        for slot in &mut self.thread.stack[base + nargs.min(nparams)..base + frame_size] {
            *slot = Value::Nil;
        }
        self.thread.frames.push(CallFrame {
            closure,
            proto,
            pc: 0,
            base,
            ret_slot,
            nresults,
            varargs,
            kind,
        });
        Ok(())
    }

    fn call_native(
        &mut self,
        f: NativeFunction,
        slot: usize,
        nargs: usize,
        nresults: u8,
    ) -> Result<Called, Error> {
        match f.kind {
            NativeKind::Plain => {
                let result = self.invoke_native(&f, slot, nargs);
                if let Err(Error::Yield(_)) = &result {
                    self.thread.yield_dest = Some(YieldDest {
                        slot,
                        nresults,
                        protected: false,
                    });
                }
                result.map(Called::Native)
            }
            NativeKind::Pcall => {
                if nargs == 0 {
                    return Err(self.rt_error("bad argument #1 to 'pcall' (value expected)"));
                }
                self.protected_call(slot, slot + 1, nargs - 1, nresults, None)
            }
            NativeKind::Xpcall => {
                if nargs < 2 {
                    return Err(self.rt_error("bad argument #2 to 'xpcall' (value expected)"));
                }
                let handler = std::mem::take(&mut self.thread.stack[slot + 2]);
                self.thread.stack[slot + 2] = std::mem::take(&mut self.thread.stack[slot + 1]);
                self.protected_call(slot, slot + 2, nargs - 2, nresults, Some(handler))
            }
        }
    }

    fn invoke_native(&mut self, f: &NativeFunction, slot: usize, nargs: usize) -> Result<Vec<Value>, Error> {
        let args = self.thread.stack[slot + 1..slot + 1 + nargs].to_vec();
        self.thread.top = slot + 1 + nargs;
        self.native_upvalues.push(Rc::clone(&f.upvalues));
        let result = (f.func)(self, args);
        self.native_upvalues.pop();
        result
    }

    /// Body of `pcall` / `xpcall`: the callee at `func_slot` runs in a
    /// protected frame whose results land at `ret_slot`.
    fn protected_call(
        &mut self,
        ret_slot: usize,
        func_slot: usize,
        nargs: usize,
        nresults: u8,
        handler: Option<Value>,
    ) -> Result<Called, Error> {
        let resolved = self.resolve_callable(func_slot, nargs);
        let outcome = match resolved {
            Ok((Value::Function(f), nargs)) => {
                let kind = FrameKind::Protected {
                    handler: handler.clone(),
                };
                match self.push_frame(f, func_slot, nargs, ret_slot, nresults, kind) {
                    Ok(()) => return Ok(Called::Lua),
                    Err(err) => Err(err),
                }
            }
            Ok((Value::Native(f), nargs)) if f.kind == NativeKind::Plain => {
                let result = self.invoke_native(&f, func_slot, nargs);
                if let Err(Error::Yield(_)) = &result {
                    self.thread.yield_dest = Some(YieldDest {
                        slot: ret_slot,
                        nresults,
                        protected: true,
                    });
                }
                result
            }
            Ok((callee, nargs)) => {
                let args = self.thread.stack[func_slot + 1..func_slot + 1 + nargs].to_vec();
                self.call(callee, args)
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(mut values) => {
                values.insert(0, Value::Boolean(true));
                Ok(Called::Native(values))
            }
            Err(Error::Yield(values)) => Err(Error::Yield(values)),
            Err(err) => {
                let value = match handler {
                    Some(handler) => match self.call(handler, vec![err.into_value()]) {
                        Ok(results) => results.into_iter().next().unwrap_or_default(),
                        Err(e) => e.into_value(),
                    },
                    None => err.into_value(),
                };
                Ok(Called::Native(vec![Value::Boolean(false), value]))
            }
        }
    }

    /// Replace the running frame with a call to the Lua function at `slot`.
    /// Any other callee is left in place and its argument count returned,
    /// for the caller to run as an ordinary call.
    pub(crate) fn tail_call(&mut self, slot: usize, nargs: usize) -> Result<Option<usize>, Error> {
        let (callee, nargs) = self.resolve_callable(slot, nargs)?;
        let Value::Function(f) = callee else {
            return Ok(Some(nargs));
        };
        let Some(frame) = self.thread.frames.pop() else {
            return Ok(Some(nargs));
        };
        self.close_upvalues(frame.base);
        let func_slot = frame.base - 1;
        for i in 0..=nargs {
            self.thread.stack[func_slot + i] = std::mem::take(&mut self.thread.stack[slot + i]);
        }
        self.push_frame(f, func_slot, nargs, frame.ret_slot, frame.nresults, frame.kind)?;
        Ok(None)
    }

    /// Pop the running frame after a `Return`. `Some` carries the values when
    /// the frame was the entry frame at depth `stop`.
    pub(crate) fn finish_frame(&mut self, values: Vec<Value>, stop: usize) -> Result<Option<Vec<Value>>, Error> {
        let Some(base) = self.thread.frames.last().map(|f| f.base) else {
            return Ok(Some(values));
        };
        if self.thread.tbc.last().is_some_and(|&slot| slot >= base) {
            let mark = self.scratch.len();
            self.scratch.extend(values.iter().cloned());
            let closed = self.close_slots(base, None);
            self.scratch.truncate(mark);
            closed?;
        } else {
            self.close_upvalues(base);
        }

        let Some(frame) = self.thread.frames.pop() else {
            return Ok(Some(values));
        };
        let mut values = values;
        if let FrameKind::Protected { .. } = frame.kind {
            values.insert(0, Value::Boolean(true));
        }
        if self.thread.frames.len() <= stop {
            return Ok(Some(values));
        }
        self.place_results(values, frame.ret_slot, frame.nresults)?;
        Ok(None)
    }

    /// Store call results at `slot`: all of them when `nresults` is `MULTI`
    /// (setting top), else exactly `nresults`, padding with nil.
    pub(crate) fn place_results(&mut self, values: Vec<Value>, slot: usize, nresults: u8) -> Result<(), Error> {
        if nresults == MULTI {
            let n = values.len();
            self.ensure_stack(slot + n)?;
            for (i, v) in values.into_iter().enumerate() {
                self.thread.stack[slot + i] = v;
            }
            self.thread.top = slot + n;
        } else {
            let n = nresults as usize;
            self.ensure_stack(slot + n)?;
            let mut values = values.into_iter();
            for i in 0..n {
                self.thread.stack[slot + i] = values.next().unwrap_or_default();
            }
        }
        Ok(())
    }

    /// Leave a scope: close upvalues and run `__close` for to-be-closed
    /// slots at or above `level`, most recent first.
    pub(crate) fn close_slots(&mut self, level: usize, err: Option<Value>) -> Result<(), Error> {
        self.close_upvalues(level);
        while let Some(&slot) = self.thread.tbc.last() {
            if slot < level {
                break;
            }
            self.thread.tbc.pop();
            let v = self.thread.stack.get(slot).cloned().unwrap_or_default();
            if !v.is_truthy() {
                continue;
            }
            let handler = self.metamethod(&v, "__close");
            self.call(handler, vec![v, err.clone().unwrap_or_default()])?;
        }
        Ok(())
    }

    /// [`Vm::close_slots`] on the error path: every handler runs, and an
    /// error raised by one replaces the error being propagated.
    pub(crate) fn close_with_error(&mut self, level: usize, err: Error) -> Error {
        self.close_upvalues(level);
        let mut err = err;
        while let Some(&slot) = self.thread.tbc.last() {
            if slot < level {
                break;
            }
            self.thread.tbc.pop();
            let v = self.thread.stack.get(slot).cloned().unwrap_or_default();
            if !v.is_truthy() {
                continue;
            }
            let handler = self.metamethod(&v, "__close");
            let value = err.to_value();
            self.scratch.push(value.clone());
            if let Err(e) = self.call(handler, vec![v, value]) {
                err = e;
            }
            self.scratch.pop();
        }
        err
    }
}
