//! Global functions.

use super::{arg, arg_error, check_any, check_integer, check_string, check_table, opt_integer};
use crate::error::Error;
use crate::table::InvalidKey;
use crate::value::{NativeFn, NativeFunction, NativeKind, Value};
use crate::vm::Vm;
use std::io::Write;
use std::rc::Rc;

pub(super) fn open(vm: &mut Vm) {
    const FUNCS: &[(&str, NativeFn)] = &[
        ("print", print),
        ("type", lua_type),
        ("tostring", tostring),
        ("tonumber", tonumber),
        ("ipairs", ipairs),
        ("pairs", pairs),
        ("next", next),
        ("select", select),
        ("rawget", rawget),
        ("rawset", rawset),
        ("rawequal", rawequal),
        ("rawlen", rawlen),
        ("setmetatable", setmetatable),
        ("getmetatable", getmetatable),
        ("assert", assert),
        ("error", error),
        ("unpack", super::table::unpack),
        ("load", load),
        ("collectgarbage", collectgarbage),
        ("require", require),
    ];
    for &(name, func) in FUNCS {
        vm.register(name, func);
    }
    vm.set_global(
        "pcall",
        Value::Native(NativeFunction::protected("pcall", pcall, NativeKind::Pcall)),
    );
    vm.set_global(
        "xpcall",
        Value::Native(NativeFunction::protected("xpcall", xpcall, NativeKind::Xpcall)),
    );
    vm.set_global("_G", Value::Table(vm.globals));
    vm.set_global("_VERSION", Value::str("Lua 5.4"));
}

fn print(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let mut line = String::new();
    for (i, v) in args.iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&vm.tostring(v)?);
    }
    line.push('\n');
    if let Err(e) = vm.output.write_all(line.as_bytes()) {
        return Err(vm.rt_error(format!("cannot write output: {e}")));
    }
    Ok(Vec::new())
}

fn lua_type(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let v = check_any(vm, &args, 0, "type")?;
    Ok(vec![Value::str(v.type_name())])
}

fn tostring(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let v = check_any(vm, &args, 0, "tostring")?;
    Ok(vec![Value::Str(vm.tostring(&v)?)])
}

fn tonumber(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    if matches!(args.get(1), None | Some(Value::Nil)) {
        let v = check_any(vm, &args, 0, "tonumber")?;
        return Ok(vec![v.to_number().map_or(Value::Nil, Value::Number)]);
    }
    let base = check_integer(vm, &args, 1, "tonumber")?;
    if !(2..=36).contains(&base) {
        return Err(arg_error(vm, 1, "tonumber", "base out of range"));
    }
    let s = check_string(vm, &args, 0, "tonumber")?;
    Ok(vec![parse_in_base(s.trim(), base as u32).map_or(Value::Nil, Value::Number)])
}

fn parse_in_base(s: &str, base: u32) -> Option<f64> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n: f64 = 0.0;
    for c in digits.chars() {
        n = n * base as f64 + c.to_digit(base)? as f64;
    }
    Some(if neg { -n } else { n })
}

fn ipairs(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_any(vm, &args, 0, "ipairs")?;
    Ok(vec![
        Value::Native(NativeFunction::new("ipairs_iter", ipairs_iter)),
        t,
        Value::Number(0.0),
    ])
}

fn ipairs_iter(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let i = arg(&args, 1).as_number().unwrap_or(0.0) + 1.0;
    let v = match arg(&args, 0) {
        Value::Table(t) if vm.heap.get(t).metatable.is_none() => vm.heap.get(t).get_int(i as usize),
        other => vm.index(other, Value::Number(i))?,
    };
    if v.is_nil() {
        return Ok(vec![Value::Nil]);
    }
    Ok(vec![Value::Number(i), v])
}

fn pairs(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_any(vm, &args, 0, "pairs")?;
    let handler = vm.metamethod(&t, "__pairs");
    if !handler.is_nil() {
        let mut results = vm.call(handler, vec![t])?;
        results.resize(3, Value::Nil);
        return Ok(results);
    }
    check_table(vm, &args, 0, "pairs")?;
    Ok(vec![
        Value::Native(NativeFunction::new("next", next)),
        t,
        Value::Nil,
    ])
}

fn next(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "next")?;
    match vm.heap.get(t).next(&arg(&args, 1)) {
        Ok(Some((k, v))) => Ok(vec![k, v]),
        Ok(None) => Ok(vec![Value::Nil]),
        Err(InvalidKey) => Err(vm.rt_error("invalid key to 'next'")),
    }
}

fn select(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let n = args.len().saturating_sub(1) as i64;
    if let Some(Value::Str(s)) = args.first() {
        if &**s == "#" {
            return Ok(vec![Value::Number(n as f64)]);
        }
    }
    let i = check_integer(vm, &args, 0, "select")?;
    let start = if i < 0 { n + i } else { i - 1 };
    if start < 0 || i == 0 {
        return Err(arg_error(vm, 0, "select", "index out of range"));
    }
    Ok(args.into_iter().skip(1 + start as usize).collect())
}

fn rawget(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "rawget")?;
    Ok(vec![vm.heap.get(t).get(&arg(&args, 1))])
}

fn rawset(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "rawset")?;
    vm.raw_set(t, arg(&args, 1), arg(&args, 2))?;
    Ok(vec![Value::Table(t)])
}

fn rawequal(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let a = check_any(vm, &args, 0, "rawequal")?;
    let b = check_any(vm, &args, 1, "rawequal")?;
    Ok(vec![Value::Boolean(a.raw_eq(&b))])
}

fn rawlen(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let n = match args.first() {
        Some(Value::Table(t)) => vm.heap.get(*t).len(),
        Some(Value::Str(s)) => s.len(),
        _ => return Err(arg_error(vm, 0, "rawlen", "table or string expected")),
    };
    Ok(vec![Value::Number(n as f64)])
}

fn setmetatable(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let t = check_table(vm, &args, 0, "setmetatable")?;
    let mt = match arg(&args, 1) {
        Value::Nil => None,
        Value::Table(mt) => Some(mt),
        _ => return Err(arg_error(vm, 1, "setmetatable", "nil or table expected")),
    };
    if let Some(old) = vm.heap.get(t).metatable {
        if !vm.heap.get(old).get_str("__metatable").is_nil() {
            return Err(vm.rt_error("cannot change a protected metatable"));
        }
    }
    vm.heap.get_mut(t).metatable = mt;
    Ok(vec![Value::Table(t)])
}

fn getmetatable(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let v = arg(&args, 0);
    let Some(mt) = vm.metatable_of(&v) else {
        return Ok(vec![Value::Nil]);
    };
    let protected = vm.heap.get(mt).get_str("__metatable");
    if !protected.is_nil() {
        return Ok(vec![protected]);
    }
    Ok(vec![Value::Table(mt)])
}

fn assert(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let v = check_any(vm, &args, 0, "assert")?;
    if v.is_truthy() {
        return Ok(args);
    }
    match args.into_iter().nth(1) {
        Some(msg) => Err(Error::runtime(msg)),
        None => Err(Error::runtime("assertion failed!")),
    }
}

fn error(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let level = opt_integer(vm, &args, 1, "error", 1)?;
    let value = arg(&args, 0);
    if let Value::Str(msg) = &value {
        if level > 0 {
            if let Some(pos) = vm.position(level as usize) {
                return Err(Error::runtime(format!("{pos} {msg}")));
            }
        }
    }
    Err(Error::runtime(value))
}

/// Reference semantics of `pcall`. Calls from Lua code and from
/// [`Vm::call`] never reach it: they run the body as a protected frame.
fn pcall(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let f = check_any(vm, &args, 0, "pcall")?;
    match vm.call(f, args.into_iter().skip(1).collect()) {
        Ok(mut values) => {
            values.insert(0, Value::Boolean(true));
            Ok(values)
        }
        Err(Error::Yield(values)) => Err(Error::Yield(values)),
        Err(err) => Ok(vec![Value::Boolean(false), err.into_value()]),
    }
}

/// Reference semantics of `xpcall`, see [`pcall`].
fn xpcall(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let f = check_any(vm, &args, 0, "xpcall")?;
    let handler = check_any(vm, &args, 1, "xpcall")?;
    match vm.call(f, args.into_iter().skip(2).collect()) {
        Ok(mut values) => {
            values.insert(0, Value::Boolean(true));
            Ok(values)
        }
        Err(Error::Yield(values)) => Err(Error::Yield(values)),
        Err(err) => {
            let handled = vm.call(handler, vec![err.into_value()])?;
            Ok(vec![
                Value::Boolean(false),
                handled.into_iter().next().unwrap_or_default(),
            ])
        }
    }
}

fn load(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let src: String = match arg(&args, 0) {
        Value::Str(s) => s.to_string(),
        f @ (Value::Function(_) | Value::Native(_)) => {
            let mut src = String::new();
            loop {
                let piece = vm.call(f.clone(), Vec::new())?.into_iter().next();
                match piece {
                    Some(Value::Str(s)) if !s.is_empty() => src.push_str(&s),
                    Some(Value::Nil) | None => break,
                    Some(Value::Str(_)) => break,
                    Some(_) => return Ok(vec![Value::Nil, Value::str("reader function must return a string")]),
                }
            }
            src
        }
        _ => return Err(arg_error(vm, 0, "load", "string expected")),
    };
    let name = match arg(&args, 1) {
        Value::Str(s) => s.to_string(),
        _ => chunk_label(&src),
    };
    match vm.load(&src, &name) {
        Ok(f) => Ok(vec![f]),
        Err(err) => Ok(vec![Value::Nil, Value::from(err.to_string())]),
    }
}

/// `[string "first line..."]`, the name given to chunks loaded from text.
fn chunk_label(src: &str) -> String {
    let first = src.lines().next().unwrap_or("");
    if first.len() < src.len() || first.chars().count() > 40 {
        let short: String = first.chars().take(40).collect();
        format!("[string \"{short}...\"]")
    } else {
        format!("[string \"{first}\"]")
    }
}

fn collectgarbage(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let opt = match arg(&args, 0) {
        Value::Nil => Rc::from("collect"),
        _ => check_string(vm, &args, 0, "collectgarbage")?,
    };
    match &*opt {
        "collect" | "step" => {
            vm.heap.request_collection();
            Ok(vec![Value::Number(0.0)])
        }
        "count" => Ok(vec![Value::Number(vm.heap.live() as f64)]),
        "isrunning" => Ok(vec![Value::Boolean(true)]),
        other => Err(arg_error(
            vm,
            0,
            "collectgarbage",
            &format!("invalid option '{other}'"),
        )),
    }
}

fn require(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let name = check_string(vm, &args, 0, "require")?;
    Ok(vec![vm.require(&name)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::fmt_number;

    fn eval(src: &str) -> Vec<Value> {
        Vm::new().exec(src, "base").unwrap()
    }

    #[test]
    fn tonumber_variants() {
        let v = eval("return tonumber('  12  '), tonumber('z'), tonumber('ff', 16), tonumber('777', 8), tonumber(nil)");
        assert_eq!(v[0].as_number(), Some(12.0));
        assert!(v[1].is_nil());
        assert_eq!(v[2].as_number(), Some(255.0));
        assert_eq!(v[3].as_number(), Some(511.0));
        assert!(v[4].is_nil());
    }

    #[test]
    fn tostring_of_numbers() {
        let v = eval("return tostring(10), tostring(2.5), tostring(1e100), tostring(-0.0)");
        let s: Vec<String> = v.iter().map(Value::to_string).collect();
        assert_eq!(s, vec!["10", "2.5", "1e+100", "-0"]);
        assert_eq!(fmt_number(1.0 / 0.0), "inf");
    }

    #[test]
    fn select_counts_and_slices() {
        let v = eval("return select('#', 1, nil, 3), select(2, 'a', 'b', 'c')");
        assert_eq!(v[0].as_number(), Some(3.0));
        assert_eq!(v.len(), 3);
        let v = eval("return select(-1, 'a', 'b', 'c')");
        assert_eq!(v[0].to_string(), "c");
    }

    #[test]
    fn next_walks_every_entry() {
        let v = eval(
            "local t = {10, 20, x = 1, y = 2}
             local n = 0
             local k, v = next(t)
             while k ~= nil do n = n + 1 k, v = next(t, k) end
             return n",
        );
        assert_eq!(v[0].as_number(), Some(4.0));
    }

    #[test]
    fn clearing_fields_during_pairs_is_allowed() {
        let v = eval(
            "local t = {a = 1, b = 2, c = 3, d = 4}
             for k in pairs(t) do t[k] = nil end
             return next(t)",
        );
        assert!(v[0].is_nil());
    }

    #[test]
    fn protected_metatables() {
        let v = eval(
            "local t = setmetatable({}, {__metatable = 'locked'})
             local ok, err = pcall(setmetatable, t, {})
             return getmetatable(t), ok, err",
        );
        assert_eq!(v[0].to_string(), "locked");
        assert!(matches!(v[1], Value::Boolean(false)));
        assert!(v[2].to_string().contains("cannot change a protected metatable"));
    }

    #[test]
    fn assert_returns_arguments_or_raises_message() {
        let v = eval("return assert(1, 'unused')");
        assert_eq!(v.len(), 2);
        let err = Vm::new().exec("assert(false, 'custom')", "base").unwrap_err();
        assert_eq!(err.to_string(), "custom");
        let err = Vm::new().exec("assert(nil)", "base").unwrap_err();
        assert_eq!(err.to_string(), "assertion failed!");
    }

    #[test]
    fn load_compiles_text_and_reports_errors() {
        let v = eval("local f = load('return 1 + ...') return f(41)");
        assert_eq!(v[0].as_number(), Some(42.0));
        let v = eval("return load('return +', 'chunk')");
        assert!(v[0].is_nil());
        assert!(v[1].to_string().starts_with("chunk:1:"));
        let v = eval(
            "local parts = {'return ', '7'}
             local i = 0
             return load(function() i = i + 1 return parts[i] end)()",
        );
        assert_eq!(v[0].as_number(), Some(7.0));
    }

    #[test]
    fn collectgarbage_options() {
        let v = eval("collectgarbage('collect') return collectgarbage('count') > 0");
        assert!(matches!(v[0], Value::Boolean(true)));
        assert!(Vm::new()
            .exec("collectgarbage('bogus')", "base")
            .unwrap_err()
            .to_string()
            .contains("invalid option 'bogus'"));
    }

    #[test]
    fn globals_table_is_self_referential() {
        let v = eval("x = 5 return _G.x, _G._G == _G, _VERSION");
        assert_eq!(v[0].as_number(), Some(5.0));
        assert!(matches!(v[1], Value::Boolean(true)));
        assert_eq!(v[2].to_string(), "Lua 5.4");
    }
}
