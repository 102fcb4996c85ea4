//! `lunar-vm` — register virtual machine, garbage-collected heap, coroutines
//! and the standard library core.
//!
//! ```
//! use lunar_vm::Vm;
//!
//! let mut vm = Vm::new();
//! let results = vm.exec("local t = {} for i = 1, 4 do t[i] = i * i end return #t, t[4]", "doc").unwrap();
//! assert_eq!(results[0].as_number(), Some(4.0));
//! assert_eq!(results[1].as_number(), Some(16.0));
//! ```

mod arith;
mod call;
pub mod coroutine;
pub mod error;
mod gc;
mod heap;
mod meta;
mod state;
mod stdlib;
pub mod table;
pub mod value;
mod vm;

pub use coroutine::{CoStatus, Coroutine};
pub use error::Error;
pub use heap::Gc;
pub use table::Table;
pub use value::{fmt_number, NativeFn, NativeFunction, Value};
pub use vm::Vm;
