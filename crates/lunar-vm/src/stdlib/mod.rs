//! Standard library core installed into every [`Vm`].

mod base;
mod coroutine;
mod math;
mod package;
mod pattern;
mod string;
mod table;

use crate::error::Error;
use crate::heap::Gc;
use crate::table::Table;
use crate::value::{to_integer, NativeFn, NativeFunction, Value};
use crate::vm::Vm;
use std::rc::Rc;

pub(crate) fn open_all(vm: &mut Vm) {
    base::open(vm);
    string::open(vm);
    table::open(vm);
    math::open(vm);
    coroutine::open(vm);
    package::open(vm);
}

/// Build a library table from `funcs`, publish it as global `name` and in
/// `package.loaded`.
fn new_lib(vm: &mut Vm, name: &str, funcs: &[(&str, NativeFn)]) -> Gc<Table> {
    let mut table = Table::with_capacity(0, funcs.len());
    for &(fname, func) in funcs {
        table.set_str(fname, Value::Native(NativeFunction::new(fname, func)));
    }
    let lib = vm.heap.alloc(table);
    vm.set_global(name, Value::Table(lib));
    vm.heap.get_mut(vm.loaded).set_str(name, Value::Table(lib));
    lib
}

// ── Argument checking ─────────────────────────────────────────────────────────

pub(crate) fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or_default()
}

pub(crate) fn arg_error(vm: &Vm, i: usize, fname: &str, msg: &str) -> Error {
    vm.rt_error(format!("bad argument #{} to '{fname}' ({msg})", i + 1))
}

fn type_error(vm: &Vm, args: &[Value], i: usize, fname: &str, expected: &str) -> Error {
    let got = match args.get(i) {
        Some(v) => v.type_name(),
        None => "no value",
    };
    arg_error(vm, i, fname, &format!("{expected} expected, got {got}"))
}

pub(crate) fn check_any(vm: &Vm, args: &[Value], i: usize, fname: &str) -> Result<Value, Error> {
    args.get(i)
        .cloned()
        .ok_or_else(|| arg_error(vm, i, fname, "value expected"))
}

pub(crate) fn check_number(vm: &Vm, args: &[Value], i: usize, fname: &str) -> Result<f64, Error> {
    match args.get(i).and_then(Value::to_number) {
        Some(n) => Ok(n),
        None => Err(type_error(vm, args, i, fname, "number")),
    }
}

pub(crate) fn check_integer(vm: &Vm, args: &[Value], i: usize, fname: &str) -> Result<i64, Error> {
    let n = check_number(vm, args, i, fname)?;
    to_integer(n).ok_or_else(|| arg_error(vm, i, fname, "number has no integer representation"))
}

pub(crate) fn opt_integer(
    vm: &Vm,
    args: &[Value],
    i: usize,
    fname: &str,
    default: i64,
) -> Result<i64, Error> {
    match args.get(i) {
        None | Some(Value::Nil) => Ok(default),
        Some(_) => check_integer(vm, args, i, fname),
    }
}

/// String argument; numbers are converted.
pub(crate) fn check_string(vm: &Vm, args: &[Value], i: usize, fname: &str) -> Result<Rc<str>, Error> {
    match args.get(i) {
        Some(Value::Str(s)) => Ok(Rc::clone(s)),
        Some(Value::Number(n)) => Ok(Rc::from(crate::value::fmt_number(*n))),
        _ => Err(type_error(vm, args, i, fname, "string")),
    }
}

pub(crate) fn check_table(vm: &Vm, args: &[Value], i: usize, fname: &str) -> Result<Gc<Table>, Error> {
    match args.get(i) {
        Some(Value::Table(t)) => Ok(*t),
        _ => Err(type_error(vm, args, i, fname, "table")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_errors_name_the_function() {
        let err = Vm::new().exec("string.rep()", "args").unwrap_err();
        assert_eq!(
            err.to_string(),
            "args:1: bad argument #1 to 'rep' (string expected, got no value)"
        );
        let err = Vm::new().exec("table.insert(nil, 1)", "args").unwrap_err();
        assert_eq!(
            err.to_string(),
            "args:1: bad argument #1 to 'insert' (table expected, got nil)"
        );
    }

    #[test]
    fn libraries_are_registered_as_loaded() {
        let v = Vm::new()
            .exec("return package.loaded.string == string and require('math') == math", "libs")
            .unwrap();
        assert!(matches!(v[0], Value::Boolean(true)));
    }
}
