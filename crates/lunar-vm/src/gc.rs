//! Stop-the-world mark and sweep over the [`Heap`](crate::heap::Heap).
//!
//! Collection only happens at the top of the dispatch loop, where every live
//! value is reachable from the VM's roots: globals, registry, the running
//! thread's stack and frames, the threads on the resume chain, scratch roots
//! and the captured values of natives that are executing.

use crate::coroutine::{FrameKind, ThreadState};
use crate::heap::Object;
use crate::value::{Upval, Value};
use crate::vm::Vm;
use tracing::debug;

struct Marker {
    marked: Vec<bool>,
    gray: Vec<usize>,
}

impl Marker {
    fn object(&mut self, index: usize) {
        if let Some(seen) = self.marked.get_mut(index) {
            if !*seen {
                *seen = true;
                self.gray.push(index);
            }
        }
    }

    fn value(&mut self, v: &Value) {
        match v {
            Value::Table(t) => self.object(t.index()),
            Value::Function(f) => self.object(f.index()),
            Value::Thread(co) => self.object(co.index()),
            Value::Native(n) => {
                for up in n.upvalues.iter() {
                    self.value(up);
                }
            }
            Value::Nil | Value::Boolean(_) | Value::Number(_) | Value::Str(_) => {}
        }
    }

    /// Slots above the running frame and the open top are dead; they are
    /// overwritten before they are read again.
    fn thread(&mut self, state: &ThreadState) {
        let live = state
            .frames
            .last()
            .map_or(0, |f| f.base + f.proto.frame_size as usize)
            .max(state.top)
            .min(state.stack.len());
        for v in &state.stack[..live] {
            self.value(v);
        }
        for frame in &state.frames {
            self.object(frame.closure.index());
            for v in &frame.varargs {
                self.value(v);
            }
            if let FrameKind::Protected { handler: Some(h) } = &frame.kind {
                self.value(h);
            }
        }
        for (_, uv) in &state.open_upvals {
            self.object(uv.index());
        }
    }
}

impl Vm {
    /// Run a full collection cycle now.
    pub fn collect_garbage(&mut self) {
        let before = self.heap.live;
        let mut m = Marker {
            marked: vec![false; self.heap.slots.len()],
            gray: Vec::new(),
        };

        m.object(self.globals.index());
        m.object(self.registry.index());
        m.object(self.loaded.index());
        if let Some(mt) = self.string_meta {
            m.object(mt.index());
        }
        m.object(self.main.index());
        m.object(self.current.index());
        for co in &self.resume_chain {
            m.object(co.index());
        }
        m.thread(&self.thread);
        for v in &self.scratch {
            m.value(v);
        }
        for ups in &self.native_upvalues {
            for v in ups.iter() {
                m.value(v);
            }
        }

        while let Some(index) = m.gray.pop() {
            let Some(object) = self.heap.slots[index].object.as_ref() else {
                continue;
            };
            match object {
                Object::Table(t) => {
                    if let Some(mt) = t.metatable {
                        m.object(mt.index());
                    }
                    t.for_each_value(|v| m.value(v));
                }
                Object::Closure(c) => {
                    for uv in &c.upvalues {
                        m.object(uv.index());
                    }
                }
                Object::Upval(Upval::Open { thread, .. }) => m.object(thread.index()),
                Object::Upval(Upval::Closed(v)) => m.value(v),
                Object::Thread(co) => {
                    m.value(&co.func);
                    if let Some(state) = &co.state {
                        m.thread(state);
                    }
                }
            }
        }

        let heap = &mut self.heap;
        for (index, slot) in heap.slots.iter_mut().enumerate() {
            if slot.object.is_some() && !m.marked[index] {
                slot.object = None;
                heap.free.push(index as u32);
                heap.live -= 1;
            }
        }
        heap.allocated = 0;
        heap.requested = false;
        heap.threshold = (heap.live * heap.step_multiplier).max(self.config.gc_initial_threshold);
        debug!(
            target: "lunar::gc",
            before,
            after = heap.live,
            threshold = heap.threshold,
            "collection finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_cycles_are_reclaimed() {
        let mut vm = Vm::new();
        vm.collect_garbage();
        let baseline = vm.live_objects();
        vm.exec(
            "local a, b = {}, {}
             a.other, b.other = b, a
             a, b = nil, nil",
            "gc",
        )
        .unwrap();
        vm.collect_garbage();
        // The chunk's own closure is unreachable once it has returned.
        assert_eq!(vm.live_objects(), baseline);
    }

    #[test]
    fn globals_keep_objects_alive() {
        let mut vm = Vm::new();
        vm.exec("keep = {nested = {}}", "gc").unwrap();
        vm.collect_garbage();
        let v = vm.exec("return keep.nested ~= nil", "gc").unwrap();
        assert!(matches!(v[0], Value::Boolean(true)));
    }

    #[test]
    fn closures_keep_captured_values_alive() {
        let mut vm = Vm::new();
        vm.exec(
            "local t = {value = 7}
             get = function() return t.value end",
            "gc",
        )
        .unwrap();
        vm.collect_garbage();
        let v = vm.exec("collectgarbage() return get()", "gc").unwrap();
        assert_eq!(v[0].as_number(), Some(7.0));
    }

    #[test]
    fn collection_runs_during_allocation_heavy_loops() {
        let mut vm = Vm::with_config(lunar_core::VmConfig {
            gc_initial_threshold: 64,
            ..Default::default()
        });
        let v = vm
            .exec(
                "local keep = {}
                 for i = 1, 5000 do
                     local t = {i}
                     if i % 100 == 0 then keep[#keep + 1] = t end
                 end
                 local s = 0
                 for _, t in ipairs(keep) do s = s + t[1] end
                 return s",
                "gc",
            )
            .unwrap();
        assert_eq!(v[0].as_number(), Some(127500.0));
        assert!(vm.live_objects() < 1000);
    }
}
