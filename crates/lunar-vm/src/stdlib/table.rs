//! `table` library. Element access is raw.

use super::{arg, arg_error, check_integer, check_table, new_lib, opt_integer};
use crate::error::Error;
use crate::heap::Gc;
use crate::table::Table;
use crate::value::{fmt_number, NativeFn, Value};
use crate::vm::Vm;

pub(super) fn open(vm: &mut Vm) {
    const FUNCS: &[(&str, NativeFn)] = &[
        ("insert", insert),
        ("remove", remove),
        ("concat", concat),
        ("sort", sort),
        ("unpack", unpack),
        ("pack", pack),
    ];
    new_lib(vm, "table", FUNCS);
}

fn length(vm: &Vm, t: Gc<Table>) -> i64 {
    vm.heap.get(t).len() as i64
}

fn get(vm: &Vm, t: Gc<Table>, i: i64) -> Value {
    vm.heap.get(t).get(&Value::Number(i as f64))
}

fn set(vm: &mut Vm, t: Gc<Table>, i: i64, v: Value) {
    vm.heap.get_mut(t).set(Value::Number(i as f64), v);
}

fn insert(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "insert")?;
    let end = length(vm, t) + 1;
    match args.len() {
        2 => set(vm, t, end, arg(&args, 1)),
        3 => {
            let pos = check_integer(vm, &args, 1, "insert")?;
            if pos < 1 || pos > end {
                return Err(arg_error(vm, 1, "insert", "position out of bounds"));
            }
            for i in (pos + 1..=end).rev() {
                let v = get(vm, t, i - 1);
                set(vm, t, i, v);
            }
            set(vm, t, pos, arg(&args, 2));
        }
        _ => return Err(vm.rt_error("wrong number of arguments to 'insert'")),
    }
    Ok(Vec::new())
}

fn remove(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "remove")?;
    let size = length(vm, t);
    let pos = opt_integer(vm, &args, 1, "remove", size)?;
    if pos != size && (pos < 1 || pos > size + 1) {
        return Err(arg_error(vm, 1, "remove", "position out of bounds"));
    }
    let removed = get(vm, t, pos);
    let mut i = pos;
    while i < size {
        let v = get(vm, t, i + 1);
        set(vm, t, i, v);
        i += 1;
    }
    set(vm, t, i, Value::Nil);
    Ok(vec![removed])
}

fn concat(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "concat")?;
    let sep = match arg(&args, 1) {
        Value::Nil => None,
        _ => Some(super::check_string(vm, &args, 1, "concat")?),
    };
    let i = opt_integer(vm, &args, 2, "concat", 1)?;
    let j = match arg(&args, 3) {
        Value::Nil => length(vm, t),
        _ => check_integer(vm, &args, 3, "concat")?,
    };
    let mut out = String::new();
    for k in i..=j {
        match get(vm, t, k) {
            Value::Str(s) => out.push_str(&s),
            Value::Number(n) => out.push_str(&fmt_number(n)),
            other => {
                return Err(vm.rt_error(format!(
                    "invalid value (at index {k}) in table for 'concat' (a {} value)",
                    other.type_name()
                )))
            }
        }
        if k < j {
            if let Some(sep) = &sep {
                out.push_str(sep);
            }
        }
    }
    Ok(vec![Value::from(out)])
}

/// Stable merge sort whose comparison can fail.
fn merge_sort<T: Clone, E>(
    items: &mut [T],
    less: &mut impl FnMut(&T, &T) -> Result<bool, E>,
) -> Result<(), E> {
    if items.len() <= 1 {
        return Ok(());
    }
    let mid = items.len() / 2;
    merge_sort(&mut items[..mid], less)?;
    merge_sort(&mut items[mid..], less)?;
    let mut merged = Vec::with_capacity(items.len());
    let (mut a, mut b) = (0, mid);
    while a < mid && b < items.len() {
        if less(&items[b], &items[a])? {
            merged.push(items[b].clone());
            b += 1;
        } else {
            merged.push(items[a].clone());
            a += 1;
        }
    }
    merged.extend_from_slice(&items[a..mid]);
    merged.extend_from_slice(&items[b..]);
    items.clone_from_slice(&merged);
    Ok(())
}

fn sort(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "sort")?;
    let comp = match arg(&args, 1) {
        Value::Nil => None,
        f @ (Value::Function(_) | Value::Native(_)) => Some(f),
        other => {
            return Err(arg_error(
                vm,
                1,
                "sort",
                &format!("function expected, got {}", other.type_name()),
            ))
        }
    };
    let n = length(vm, t);
    let mut items: Vec<Value> = (1..=n).map(|i| get(vm, t, i)).collect();
    merge_sort(&mut items, &mut |a: &Value, b: &Value| match &comp {
        Some(f) => Ok(vm
            .call(f.clone(), vec![a.clone(), b.clone()])?
            .first()
            .is_some_and(Value::is_truthy)),
        None => vm.less_than(a, b),
    })?;
    for (i, v) in items.into_iter().enumerate() {
        set(vm, t, i as i64 + 1, v);
    }
    Ok(Vec::new())
}

pub(super) fn unpack(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "unpack")?;
    let i = opt_integer(vm, &args, 1, "unpack", 1)?;
    let j = match arg(&args, 2) {
        Value::Nil => length(vm, t),
        _ => check_integer(vm, &args, 2, "unpack")?,
    };
    if i > j {
        return Ok(Vec::new());
    }
    if j.saturating_sub(i) >= vm.config.max_stack as i64 {
        return Err(vm.rt_error("too many results to unpack"));
    }
    Ok((i..=j).map(|k| get(vm, t, k)).collect())
}

fn pack(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let n = args.len();
    let mut table = Table::from_array(args);
    table.set_str("n", Value::Number(n as f64));
    Ok(vec![Value::Table(vm.heap.alloc(table))])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Vec<String> {
        Vm::new()
            .exec(src, "tbl")
            .unwrap()
            .iter()
            .map(Value::to_string)
            .collect()
    }

    #[test]
    fn insert_and_remove_shift_elements() {
        assert_eq!(
            eval(
                "local t = {1, 2, 3}
                 table.insert(t, 4)
                 table.insert(t, 1, 0)
                 local r = table.remove(t, 2)
                 local last = table.remove(t)
                 return table.concat(t, ','), r, last, #t"
            ),
            vec!["0,2,3", "1", "4", "3"]
        );
        assert_eq!(eval("local t = {} return table.remove(t), #t"), vec!["nil", "0"]);
    }

    #[test]
    fn insert_rejects_bad_positions() {
        let err = Vm::new().exec("table.insert({1}, 5, 0)", "tbl").unwrap_err();
        assert_eq!(err.to_string(), "tbl:1: bad argument #2 to 'insert' (position out of bounds)");
        let err = Vm::new().exec("table.insert({}, 1, 2, 3)", "tbl").unwrap_err();
        assert!(err.to_string().contains("wrong number of arguments to 'insert'"));
    }

    #[test]
    fn concat_ranges_and_errors() {
        assert_eq!(eval("return table.concat({1, 'a', 2.5}, '-', 2, 3)"), vec!["a-2.5"]);
        assert_eq!(eval("return table.concat({})"), vec![""]);
        let err = Vm::new().exec("table.concat({1, {}, 3})", "tbl").unwrap_err();
        assert!(err
            .to_string()
            .contains("invalid value (at index 2) in table for 'concat'"));
    }

    #[test]
    fn sort_default_and_custom_order() {
        assert_eq!(
            eval(
                "local t = {5, 2, 8, 1, 9, 3}
                 table.sort(t)
                 local s = {'pear', 'fig', 'apple'}
                 table.sort(s, function(a, b) return #a < #b end)
                 return table.concat(t, ' '), table.concat(s, ' ')"
            ),
            vec!["1 2 3 5 8 9", "fig pear apple"]
        );
        let err = Vm::new().exec("table.sort({1, 'x', 2})", "tbl").unwrap_err();
        assert!(err.to_string().contains("attempt to compare"));
    }

    #[test]
    fn sort_is_stable() {
        assert_eq!(
            eval(
                "local t = {{k = 1, v = 'a'}, {k = 0, v = 'b'}, {k = 1, v = 'c'}, {k = 0, v = 'd'}}
                 table.sort(t, function(x, y) return x.k < y.k end)
                 local out = {}
                 for i, e in ipairs(t) do out[i] = e.v end
                 return table.concat(out)"
            ),
            vec!["bdac"]
        );
    }

    #[test]
    fn pack_and_unpack() {
        assert_eq!(
            eval("local p = table.pack(1, nil, 3) return p.n, table.unpack({1, 2, 3}, 2)"),
            vec!["3", "2", "3"]
        );
        assert_eq!(eval("return unpack({1, 2, 3}, 2, 2)"), vec!["2"]);
    }
}
