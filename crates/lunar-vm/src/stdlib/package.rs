//! `package` table: module search path and the loaded-module cache.

use super::{check_string, new_lib};
use crate::error::Error;
use crate::value::{NativeFn, Value};
use crate::vm::Vm;
use std::path::Path;

pub(super) fn open(vm: &mut Vm) {
    const FUNCS: &[(&str, NativeFn)] = &[("searchpath", searchpath)];
    let lib = new_lib(vm, "package", FUNCS);
    let path = vm.paths.join(";");
    let loaded = Value::Table(vm.loaded);
    let t = vm.heap.get_mut(lib);
    t.set_str("path", Value::from(path));
    t.set_str("loaded", loaded);
    t.set_str("config", Value::str("/\n;\n?\n"));
    let globals = Value::Table(vm.globals);
    vm.heap.get_mut(vm.loaded).set_str("_G", globals);
}

/// `package.searchpath(name, path)`: the first template in `path` naming an
/// existing file, or nil and the list of candidates.
fn searchpath(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let name = check_string(vm, &args, 0, "searchpath")?;
    let path = check_string(vm, &args, 1, "searchpath")?;
    let relative = name.replace('.', "/");
    let mut tried = String::new();
    for template in path.split(';').filter(|t| !t.is_empty()) {
        let candidate = template.replace('?', &relative);
        if Path::new(&candidate).is_file() {
            return Ok(vec![Value::from(candidate)]);
        }
        tried.push_str(&format!("\n\tno file '{candidate}'"));
    }
    Ok(vec![Value::Nil, Value::from(tried)])
}
