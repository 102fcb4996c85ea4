//! Threads of execution and the coroutine scheduler.
//!
//! A coroutine owns a [`ThreadState`]: its value stack, frame stack, open
//! upvalues and pending to-be-closed slots. Only the running thread's state
//! lives in [`Vm::thread`]; every other thread keeps its state inside its
//! heap object. `resume` swaps the two, so a suspended coroutine is nothing
//! more than a parked frame stack.

use crate::error::Error;
use crate::heap::Gc;
use crate::value::{Closure, Upval, Value};
use crate::vm::Vm;
use lunar_core::Proto;
use std::rc::Rc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    Suspended,
    Running,
    /// Resumed another coroutine and is waiting for it.
    Normal,
    Dead,
}

impl CoStatus {
    pub fn name(self) -> &'static str {
        match self {
            CoStatus::Suspended => "suspended",
            CoStatus::Running => "running",
            CoStatus::Normal => "normal",
            CoStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum FrameKind {
    Lua,
    /// Body of `pcall` / `xpcall`. Errors stop here and become `false, err`.
    Protected { handler: Option<Value> },
}

#[derive(Debug)]
pub(crate) struct CallFrame {
    pub(crate) closure: Gc<Closure>,
    pub(crate) proto: Rc<Proto>,
    /// Next instruction to execute.
    pub(crate) pc: usize,
    /// Absolute slot of register 0.
    pub(crate) base: usize,
    /// Where the results go in the caller's frame.
    pub(crate) ret_slot: usize,
    pub(crate) nresults: u8,
    pub(crate) varargs: Vec<Value>,
    pub(crate) kind: FrameKind,
}

impl CallFrame {
    /// Source line of the instruction being executed.
    pub(crate) fn current_line(&self) -> u32 {
        self.proto.line_at(self.pc.saturating_sub(1))
    }
}

/// Where the values passed to the next `resume` land.
#[derive(Debug, Clone, Copy)]
pub(crate) struct YieldDest {
    pub(crate) slot: usize,
    pub(crate) nresults: u8,
    /// The yield went through a protected call, so a leading `true` is owed.
    pub(crate) protected: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalue cells, ordered by stack slot.
    pub(crate) open_upvals: Vec<(usize, Gc<Upval>)>,
    /// Slots of live `<close>` variables, in registration order.
    pub(crate) tbc: Vec<usize>,
    /// One past the last value of an open (`MULTI`) value list.
    pub(crate) top: usize,
    /// Rust re-entries on this thread; yielding is refused while non-zero.
    pub(crate) native_calls: usize,
    pub(crate) yield_dest: Option<YieldDest>,
}

/// Heap object behind a `thread` value.
#[derive(Debug)]
pub struct Coroutine {
    pub status: CoStatus,
    pub(crate) state: Option<ThreadState>,
    /// Body function, called on the first resume.
    pub(crate) func: Value,
    pub(crate) started: bool,
}

impl Coroutine {
    pub(crate) fn new(func: Value) -> Self {
        Self {
            status: CoStatus::Suspended,
            state: Some(ThreadState::default()),
            func,
            started: false,
        }
    }

    pub(crate) fn main() -> Self {
        Self {
            status: CoStatus::Running,
            state: None,
            func: Value::Nil,
            started: true,
        }
    }
}

impl Vm {
    pub fn create_coroutine(&mut self, func: Value) -> Gc<Coroutine> {
        self.heap.alloc(Coroutine::new(func))
    }

    pub fn coroutine_status(&self, co: Gc<Coroutine>) -> CoStatus {
        self.heap.get(co).status
    }

    /// Run `co` until it yields, returns or fails.
    ///
    /// `Ok` carries the yielded or returned values; `Err` is the error that
    /// killed the coroutine. Resuming a coroutine that is not suspended is an
    /// error that leaves it untouched.
    pub fn resume(&mut self, co: Gc<Coroutine>, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        match self.heap.get(co).status {
            CoStatus::Suspended => {}
            CoStatus::Dead => return Err(Error::runtime("cannot resume dead coroutine")),
            CoStatus::Running | CoStatus::Normal => {
                return Err(Error::runtime("cannot resume non-suspended coroutine"))
            }
        }
        if self.native_depth >= self.config.max_native_depth {
            return Err(self.rt_error("stack overflow"));
        }

        let prev = self.current;
        self.switch_to(co);
        self.heap.get_mut(prev).status = CoStatus::Normal;
        self.resume_chain.push(prev);
        self.native_depth += 1;
        trace!(target: "lunar::vm", thread = co.index(), "resume");

        let outcome = self.run_resumed(co, args);

        self.native_depth -= 1;
        self.resume_chain.pop();
        self.switch_to(prev);
        self.heap.get_mut(prev).status = CoStatus::Running;

        let thread = self.heap.get_mut(co);
        match outcome {
            Ok(values) => {
                thread.status = CoStatus::Dead;
                Ok(values)
            }
            Err(Error::Yield(values)) => {
                thread.status = CoStatus::Suspended;
                Ok(values)
            }
            Err(err) => {
                thread.status = CoStatus::Dead;
                Err(err)
            }
        }
    }

    fn run_resumed(&mut self, co: Gc<Coroutine>, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        let thread = self.heap.get_mut(co);
        thread.status = CoStatus::Running;
        if !thread.started {
            thread.started = true;
            let func = thread.func.clone();
            return self.call_in_thread(func, args);
        }

        let Some(dest) = self.thread.yield_dest.take() else {
            return Ok(args);
        };
        let mut values = args;
        if dest.protected {
            values.insert(0, Value::Boolean(true));
        }
        if self.thread.frames.is_empty() {
            // The body itself was a native that yielded.
            return Ok(values);
        }
        self.place_results(values, dest.slot, dest.nresults)?;
        self.execute(0)
    }

    /// Swap the running thread state for the one saved in `to`.
    fn switch_to(&mut self, to: Gc<Coroutine>) {
        if to == self.current {
            return;
        }
        let incoming = self.heap.get_mut(to).state.take().unwrap_or_default();
        let outgoing = std::mem::replace(&mut self.thread, incoming);
        let from = self.current;
        self.heap.get_mut(from).state = Some(outgoing);
        self.current = to;
    }

    /// Close a suspended or dead coroutine, running its pending `__close`
    /// handlers. Returns the error that stopped it, if any.
    pub fn close_coroutine(&mut self, co: Gc<Coroutine>) -> Result<(), Error> {
        match self.heap.get(co).status {
            CoStatus::Suspended | CoStatus::Dead => {}
            CoStatus::Running | CoStatus::Normal => {
                return Err(self.rt_error(format!(
                    "cannot close a {} coroutine",
                    self.heap.get(co).status.name()
                )))
            }
        }
        let prev = self.current;
        self.switch_to(co);
        self.heap.get_mut(prev).status = CoStatus::Normal;
        self.resume_chain.push(prev);
        self.heap.get_mut(co).status = CoStatus::Running;

        let result = self.close_slots(0, None);
        self.thread.frames.clear();
        self.thread.yield_dest = None;

        self.resume_chain.pop();
        self.switch_to(prev);
        self.heap.get_mut(prev).status = CoStatus::Running;
        self.heap.get_mut(co).status = CoStatus::Dead;
        result
    }

    /// Yielding is allowed from a coroutine with no Rust frames in between.
    pub fn is_yieldable(&self) -> bool {
        self.current != self.main && self.thread.native_calls == 0
    }

    /// Values resumed into a yield arrive as the yield's results.
    pub(crate) fn yield_values(&mut self, values: Vec<Value>) -> Result<Vec<Value>, Error> {
        if self.current == self.main {
            return Err(self.rt_error("attempt to yield from outside a coroutine"));
        }
        if self.thread.native_calls > 0 {
            return Err(self.rt_error("attempt to yield across a C-call boundary"));
        }
        Err(Error::Yield(values))
    }
}

