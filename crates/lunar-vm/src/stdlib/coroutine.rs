//! `coroutine` library.

use super::{arg_error, new_lib};
use crate::coroutine::{CoStatus, Coroutine};
use crate::error::Error;
use crate::heap::Gc;
use crate::value::{NativeFn, NativeFunction, Value};
use crate::vm::Vm;

pub(super) fn open(vm: &mut Vm) {
    const FUNCS: &[(&str, NativeFn)] = &[
        ("create", create),
        ("resume", resume),
        ("yield", yield_),
        ("status", status),
        ("running", running),
        ("isyieldable", isyieldable),
        ("wrap", wrap),
        ("close", close),
    ];
    new_lib(vm, "coroutine", FUNCS);
}

fn check_function(vm: &Vm, args: &[Value], fname: &str) -> Result<Value, Error> {
    match args.first() {
        Some(f @ (Value::Function(_) | Value::Native(_))) => Ok(f.clone()),
        _ => Err(arg_error(vm, 0, fname, "function expected")),
    }
}

fn check_thread(vm: &Vm, args: &[Value], fname: &str) -> Result<Gc<Coroutine>, Error> {
    match args.first() {
        Some(Value::Thread(co)) => Ok(*co),
        _ => Err(arg_error(vm, 0, fname, "coroutine expected")),
    }
}

fn create(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let f = check_function(vm, &args, "create")?;
    Ok(vec![Value::Thread(vm.create_coroutine(f))])
}

fn resume(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let co = check_thread(vm, &args, "resume")?;
    match vm.resume(co, args.into_iter().skip(1).collect()) {
        Ok(mut values) => {
            values.insert(0, Value::Boolean(true));
            Ok(values)
        }
        Err(err) => Ok(vec![Value::Boolean(false), err.into_value()]),
    }
}

fn yield_(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    vm.yield_values(args)
}

fn status(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let co = check_thread(vm, &args, "status")?;
    Ok(vec![Value::str(vm.coroutine_status(co).name())])
}

fn running(vm: &mut Vm, _args: Vec<Value>) -> Result<Vec<Value>, Error> {
    Ok(vec![
        Value::Thread(vm.current),
        Value::Boolean(vm.current == vm.main),
    ])
}

fn isyieldable(vm: &mut Vm, _args: Vec<Value>) -> Result<Vec<Value>, Error> {
    Ok(vec![Value::Boolean(vm.is_yieldable())])
}

fn wrap(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let f = check_function(vm, &args, "wrap")?;
    let co = vm.create_coroutine(f);
    Ok(vec![Value::Native(NativeFunction::with_upvalues(
        "wrap",
        wrapped,
        vec![Value::Thread(co)],
    ))])
}

/// Body of a `coroutine.wrap` function: resume, re-raising failures.
fn wrapped(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let Value::Thread(co) = vm.native_upvalue(0) else {
        return Err(vm.rt_error("wrapped coroutine lost its thread"));
    };
    vm.resume(co, args)
}

fn close(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let co = check_thread(vm, &args, "close")?;
    let status = vm.coroutine_status(co);
    if matches!(status, CoStatus::Running | CoStatus::Normal) {
        return Err(vm.rt_error(format!("cannot close a {} coroutine", status.name())));
    }
    match vm.close_coroutine(co) {
        Ok(()) => Ok(vec![Value::Boolean(true)]),
        Err(err) => Ok(vec![Value::Boolean(false), err.into_value()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Vec<String> {
        Vm::new()
            .exec(src, "co")
            .unwrap()
            .iter()
            .map(Value::to_string)
            .collect()
    }

    #[test]
    fn yields_pass_values_both_ways() {
        assert_eq!(
            eval(
                "local co = coroutine.create(function(a, b)
                     local c = coroutine.yield(a + b)
                     local d, e = coroutine.yield(c * 2)
                     return d + e
                 end)
                 local _, x = coroutine.resume(co, 1, 2)
                 local _, y = coroutine.resume(co, 10)
                 local _, z = coroutine.resume(co, 3, 4)
                 return x, y, z, coroutine.status(co)"
            ),
            vec!["3", "20", "7", "dead"]
        );
    }

    #[test]
    fn resuming_a_dead_coroutine_fails() {
        assert_eq!(
            eval(
                "local co = coroutine.create(function() end)
                 coroutine.resume(co)
                 return coroutine.resume(co)"
            ),
            vec!["false", "cannot resume dead coroutine"]
        );
    }

    #[test]
    fn errors_kill_the_coroutine() {
        assert_eq!(
            eval(
                "local co = coroutine.create(function() error('boom') end)
                 local ok, err = coroutine.resume(co)
                 return ok, err, coroutine.status(co)"
            ),
            vec!["false", "co:1: boom", "dead"]
        );
    }

    #[test]
    fn statuses_seen_from_inside() {
        assert_eq!(
            eval(
                "local outer
                 local inner = coroutine.create(function()
                     return coroutine.status(outer), coroutine.isyieldable()
                 end)
                 outer = coroutine.create(function()
                     local _, s, y = coroutine.resume(inner)
                     return s, y, coroutine.status(outer)
                 end)
                 local _, a, b, c = coroutine.resume(outer)
                 local _, main = coroutine.running()
                 return a, b, c, main, coroutine.isyieldable()"
            ),
            vec!["normal", "true", "running", "true", "false"]
        );
    }

    #[test]
    fn resuming_the_running_coroutine_fails() {
        assert_eq!(
            eval(
                "local co
                 co = coroutine.create(function() return coroutine.resume(co) end)
                 local _, ok, err = coroutine.resume(co)
                 return ok, err"
            ),
            vec!["false", "cannot resume non-suspended coroutine"]
        );
    }

    #[test]
    fn wrap_generates_values_and_reraises() {
        assert_eq!(
            eval(
                "local gen = coroutine.wrap(function()
                     for i = 1, 3 do coroutine.yield(i) end
                 end)
                 return gen() + gen() + gen()"
            ),
            vec!["6"]
        );
        let err = Vm::new()
            .exec("coroutine.wrap(function() error('bad', 0) end)()", "co")
            .unwrap_err();
        assert_eq!(err.to_string(), "bad");
    }

    #[test]
    fn yield_outside_a_coroutine_is_an_error() {
        let err = Vm::new().exec("coroutine.yield(1)", "co").unwrap_err();
        assert_eq!(err.to_string(), "co:1: attempt to yield from outside a coroutine");
    }

    #[test]
    fn yield_across_pcall_and_metamethods() {
        assert_eq!(
            eval(
                "local co = coroutine.create(function()
                     local ok, v = pcall(function() return coroutine.yield('in pcall') + 1 end)
                     return ok, v
                 end)
                 local _, first = coroutine.resume(co)
                 local _, ok, v = coroutine.resume(co, 41)
                 return first, ok, v"
            ),
            vec!["in pcall", "true", "42"]
        );
        assert_eq!(
            eval(
                "local t = setmetatable({}, {__index = function() return coroutine.yield() end})
                 local co = coroutine.create(function() return t.x end)
                 return coroutine.resume(co)"
            ),
            vec!["false", "co:1: attempt to yield across a C-call boundary"]
        );
    }

    #[test]
    fn close_runs_pending_handlers() {
        assert_eq!(
            eval(
                "local log = {}
                 local co = coroutine.create(function()
                     local h <close> = setmetatable({}, {__close = function() log[#log + 1] = 'closed' end})
                     coroutine.yield()
                 end)
                 coroutine.resume(co)
                 local ok = coroutine.close(co)
                 return ok, log[1], coroutine.status(co)"
            ),
            vec!["true", "closed", "dead"]
        );
    }

    #[test]
    fn closing_a_running_coroutine_fails() {
        let err = Vm::new()
            .exec(
                "local co
                 co = coroutine.wrap(function() coroutine.close(coroutine.running()) end)
                 co()",
                "co",
            )
            .unwrap_err();
        assert!(err.to_string().contains("cannot close a running coroutine"));
    }

    #[test]
    fn deep_generator_chain() {
        assert_eq!(
            eval(
                "local function range(n)
                     return coroutine.wrap(function() for i = 1, n do coroutine.yield(i) end end)
                 end
                 local function map(f, it)
                     return coroutine.wrap(function()
                         for v in it do coroutine.yield(f(v)) end
                     end)
                 end
                 local s = 0
                 for v in map(function(x) return x * x end, range(10)) do s = s + v end
                 return s"
            ),
            vec!["385"]
        );
    }
}
