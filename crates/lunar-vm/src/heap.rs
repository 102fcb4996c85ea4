//! Arena of collectable objects addressed by typed handles.
//!
//! Every table, closure, upvalue cell and coroutine lives in one slot of the
//! [`Heap`]. A [`Gc<T>`] is a plain index, so handles are `Copy` and cycles
//! between objects are ordinary. Slots are reclaimed by the collector in
//! [`crate::gc`]; a handle to a reclaimed slot is a bug in root tracking.

use crate::coroutine::Coroutine;
use crate::table::Table;
use crate::value::{Closure, Upval};
use lunar_core::VmConfig;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed handle to an object in the [`Heap`].
pub struct Gc<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Gc<T> {
    fn new(index: usize) -> Self {
        Self {
            index: index as u32,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Gc<T> {}

impl<T> Hash for Gc<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc#{}", self.index)
    }
}

pub(crate) enum Object {
    Table(Table),
    Closure(Closure),
    Upval(Upval),
    Thread(Coroutine),
}

/// Types that can be stored in the heap.
pub(crate) trait HeapObject: Sized {
    fn into_object(self) -> Object;
    fn from_object(object: &Object) -> Option<&Self>;
    fn from_object_mut(object: &mut Object) -> Option<&mut Self>;
}

macro_rules! heap_object {
    ($ty:ty, $variant:ident) => {
        impl HeapObject for $ty {
            fn into_object(self) -> Object {
                Object::$variant(self)
            }

            fn from_object(object: &Object) -> Option<&Self> {
                match object {
                    Object::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn from_object_mut(object: &mut Object) -> Option<&mut Self> {
                match object {
                    Object::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

heap_object!(Table, Table);
heap_object!(Closure, Closure);
heap_object!(Upval, Upval);
heap_object!(Coroutine, Thread);

pub(crate) struct Slot {
    pub(crate) object: Option<Object>,
}

pub struct Heap {
    pub(crate) slots: Vec<Slot>,
    pub(crate) free: Vec<u32>,
    pub(crate) live: usize,
    /// Allocations since the last cycle.
    pub(crate) allocated: usize,
    pub(crate) threshold: usize,
    pub(crate) step_multiplier: usize,
    /// Set by `collectgarbage("collect")`; honoured at the next safe point.
    pub(crate) requested: bool,
}

#[cold]
#[track_caller]
fn dangling(index: usize) -> ! {
    panic!("dangling heap handle #{index}")
}

impl Heap {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            allocated: 0,
            threshold: config.gc_initial_threshold.max(1),
            step_multiplier: config.gc_step_multiplier.max(1),
            requested: false,
        }
    }

    pub(crate) fn alloc<T: HeapObject>(&mut self, value: T) -> Gc<T> {
        self.live += 1;
        self.allocated += 1;
        let slot = Slot {
            object: Some(value.into_object()),
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                Gc::new(index as usize)
            }
            None => {
                self.slots.push(slot);
                Gc::new(self.slots.len() - 1)
            }
        }
    }

    #[track_caller]
    pub(crate) fn get<T: HeapObject>(&self, gc: Gc<T>) -> &T {
        match self
            .slots
            .get(gc.index())
            .and_then(|s| s.object.as_ref())
            .and_then(T::from_object)
        {
            Some(v) => v,
            None => dangling(gc.index()),
        }
    }

    #[track_caller]
    pub(crate) fn get_mut<T: HeapObject>(&mut self, gc: Gc<T>) -> &mut T {
        match self
            .slots
            .get_mut(gc.index())
            .and_then(|s| s.object.as_mut())
            .and_then(T::from_object_mut)
        {
            Some(v) => v,
            None => dangling(gc.index()),
        }
    }

    /// Objects currently allocated.
    pub fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn should_collect(&self) -> bool {
        self.requested || self.allocated >= self.threshold
    }

    pub fn request_collection(&mut self) {
        self.requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_reused_after_free() {
        let mut heap = Heap::new(&VmConfig::default());
        let a = heap.alloc(Table::new());
        let b = heap.alloc(Table::new());
        assert_ne!(a, b);
        assert_eq!(heap.live(), 2);
        heap.slots[a.index()].object = None;
        heap.free.push(a.index() as u32);
        heap.live -= 1;
        let c = heap.alloc(Table::new());
        assert_eq!(c.index(), a.index());
    }

    #[test]
    fn allocation_pressure_triggers_collection() {
        let mut heap = Heap::new(&VmConfig {
            gc_initial_threshold: 2,
            ..VmConfig::default()
        });
        heap.alloc(Table::new());
        assert!(!heap.should_collect());
        heap.alloc(Table::new());
        assert!(heap.should_collect());
    }
}
