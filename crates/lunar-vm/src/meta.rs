//! Metatable lookup and the operator semantics that consult it.

use crate::error::Error;
use crate::heap::Gc;
use crate::table::Table;
use crate::value::{fmt_number, to_integer, Value};
use crate::vm::Vm;
use lunar_core::ArithOp;
use std::rc::Rc;

fn is_callable(v: &Value) -> bool {
    matches!(v, Value::Function(_) | Value::Native(_))
}

impl Vm {
    pub fn metatable_of(&self, v: &Value) -> Option<Gc<Table>> {
        match v {
            Value::Table(t) => self.heap.get(*t).metatable,
            Value::Str(_) => self.string_meta,
            _ => None,
        }
    }

    /// Raw field `event` of `v`'s metatable, or nil.
    pub fn metamethod(&self, v: &Value, event: &str) -> Value {
        match self.metatable_of(v) {
            Some(mt) => self.heap.get(mt).get_str(event),
            None => Value::Nil,
        }
    }

    /// Call a metamethod and keep its first result.
    fn call_meta(&mut self, handler: Value, args: Vec<Value>) -> Result<Value, Error> {
        Ok(self.call(handler, args)?.into_iter().next().unwrap_or_default())
    }

    // ── Indexing ──────────────────────────────────────────────────────────────

    /// `obj[key]` with `__index`.
    pub fn index(&mut self, obj: Value, key: Value) -> Result<Value, Error> {
        let mut obj = obj;
        for _ in 0..self.config.max_meta_chain {
            let handler = match &obj {
                Value::Table(t) => {
                    let table = self.heap.get(*t);
                    let raw = table.get(&key);
                    if !raw.is_nil() {
                        return Ok(raw);
                    }
                    match table.metatable {
                        Some(mt) => self.heap.get(mt).get_str("__index"),
                        None => return Ok(Value::Nil),
                    }
                }
                other => {
                    let handler = self.metamethod(other, "__index");
                    if handler.is_nil() {
                        return Err(self.rt_error(format!(
                            "attempt to index a {} value",
                            other.type_name()
                        )));
                    }
                    handler
                }
            };
            if handler.is_nil() {
                return Ok(Value::Nil);
            }
            if is_callable(&handler) {
                return self.call_meta(handler, vec![obj, key]);
            }
            obj = handler;
        }
        Err(self.rt_error("'__index' chain too long; possible loop"))
    }

    /// `obj[key] = value` with `__newindex`.
    pub fn set_index(&mut self, obj: Value, key: Value, value: Value) -> Result<(), Error> {
        let mut obj = obj;
        for _ in 0..self.config.max_meta_chain {
            let handler = match &obj {
                Value::Table(t) => {
                    let t = *t;
                    let table = self.heap.get(t);
                    let handler = match table.metatable {
                        Some(mt) if table.get(&key).is_nil() => {
                            self.heap.get(mt).get_str("__newindex")
                        }
                        _ => Value::Nil,
                    };
                    if handler.is_nil() {
                        return self.raw_set(t, key, value);
                    }
                    handler
                }
                other => {
                    let handler = self.metamethod(other, "__newindex");
                    if handler.is_nil() {
                        return Err(self.rt_error(format!(
                            "attempt to index a {} value",
                            other.type_name()
                        )));
                    }
                    handler
                }
            };
            if is_callable(&handler) {
                self.call(handler, vec![obj, key, value])?;
                return Ok(());
            }
            obj = handler;
        }
        Err(self.rt_error("'__newindex' chain too long; possible loop"))
    }

    /// Assignment without metamethods; rejects nil and NaN keys.
    pub fn raw_set(&mut self, t: Gc<Table>, key: Value, value: Value) -> Result<(), Error> {
        match &key {
            Value::Nil => return Err(self.rt_error("table index is nil")),
            Value::Number(n) if n.is_nan() => return Err(self.rt_error("table index is NaN")),
            _ => {}
        }
        self.heap.get_mut(t).set(key, value);
        Ok(())
    }

    // ── Arithmetic ────────────────────────────────────────────────────────────

    pub(crate) fn arith(&mut self, op: ArithOp, a: &Value, b: &Value) -> Result<Value, Error> {
        if let (Some(x), Some(y)) = (a.to_number(), b.to_number()) {
            if let Some(v) = crate::arith::apply(op, x, y) {
                return Ok(Value::Number(v));
            }
        }
        let mut handler = self.metamethod(a, op.event());
        if handler.is_nil() {
            handler = self.metamethod(b, op.event());
        }
        if !handler.is_nil() {
            return self.call_meta(handler, vec![a.clone(), b.clone()]);
        }

        let culprit = if a.to_number().is_none() { a } else { b };
        if op.is_bitwise() {
            if culprit.to_number().is_some() {
                return Err(self.rt_error("number has no integer representation"));
            }
            return Err(self.rt_error(format!(
                "attempt to perform bitwise operation on a {} value",
                culprit.type_name()
            )));
        }
        Err(self.rt_error(format!(
            "attempt to perform arithmetic on a {} value",
            culprit.type_name()
        )))
    }

    pub(crate) fn unm(&mut self, a: &Value) -> Result<Value, Error> {
        if let Some(n) = a.to_number() {
            return Ok(Value::Number(-n));
        }
        let handler = self.metamethod(a, "__unm");
        if !handler.is_nil() {
            return self.call_meta(handler, vec![a.clone(), a.clone()]);
        }
        Err(self.rt_error(format!(
            "attempt to perform arithmetic on a {} value",
            a.type_name()
        )))
    }

    pub(crate) fn bnot(&mut self, a: &Value) -> Result<Value, Error> {
        if let Some(n) = a.to_number() {
            return match to_integer(n) {
                Some(i) => Ok(Value::Number(!i as f64)),
                None => Err(self.rt_error("number has no integer representation")),
            };
        }
        let handler = self.metamethod(a, "__bnot");
        if !handler.is_nil() {
            return self.call_meta(handler, vec![a.clone(), a.clone()]);
        }
        Err(self.rt_error(format!(
            "attempt to perform bitwise operation on a {} value",
            a.type_name()
        )))
    }

    /// `#v`
    pub(crate) fn len(&mut self, v: &Value) -> Result<Value, Error> {
        if let Value::Str(s) = v {
            return Ok(Value::Number(s.len() as f64));
        }
        let handler = self.metamethod(v, "__len");
        if !handler.is_nil() {
            return self.call_meta(handler, vec![v.clone()]);
        }
        match v {
            Value::Table(t) => Ok(Value::Number(self.heap.get(*t).len() as f64)),
            other => Err(self.rt_error(format!(
                "attempt to get length of a {} value",
                other.type_name()
            ))),
        }
    }

    // ── Concatenation ─────────────────────────────────────────────────────────

    /// `a .. b .. c`, right associative; strings and numbers join directly.
    pub(crate) fn concat(&mut self, values: Vec<Value>) -> Result<Value, Error> {
        if values.iter().all(|v| matches!(v, Value::Str(_) | Value::Number(_))) {
            let mut out = String::new();
            for v in &values {
                push_concat(&mut out, v);
            }
            return Ok(Value::from(out));
        }
        let mut values = values;
        let Some(mut acc) = values.pop() else {
            return Ok(Value::str(""));
        };
        while let Some(lhs) = values.pop() {
            acc = self.concat_pair(lhs, acc)?;
        }
        Ok(acc)
    }

    fn concat_pair(&mut self, a: Value, b: Value) -> Result<Value, Error> {
        let joinable = |v: &Value| matches!(v, Value::Str(_) | Value::Number(_));
        if joinable(&a) && joinable(&b) {
            let mut out = String::new();
            push_concat(&mut out, &a);
            push_concat(&mut out, &b);
            return Ok(Value::from(out));
        }
        let mut handler = self.metamethod(&a, "__concat");
        if handler.is_nil() {
            handler = self.metamethod(&b, "__concat");
        }
        if !handler.is_nil() {
            return self.call_meta(handler, vec![a, b]);
        }
        let culprit = if joinable(&a) { &b } else { &a };
        Err(self.rt_error(format!(
            "attempt to concatenate a {} value",
            culprit.type_name()
        )))
    }

    // ── Comparison ────────────────────────────────────────────────────────────

    /// `a == b`: raw equality, then `__eq` for two distinct tables.
    pub fn equals(&mut self, a: &Value, b: &Value) -> Result<bool, Error> {
        if a.raw_eq(b) {
            return Ok(true);
        }
        if !matches!((a, b), (Value::Table(_), Value::Table(_))) {
            return Ok(false);
        }
        let mut handler = self.metamethod(a, "__eq");
        if handler.is_nil() {
            handler = self.metamethod(b, "__eq");
        }
        if handler.is_nil() {
            return Ok(false);
        }
        Ok(self.call_meta(handler, vec![a.clone(), b.clone()])?.is_truthy())
    }

    pub fn less_than(&mut self, a: &Value, b: &Value) -> Result<bool, Error> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x < y),
            (Value::Str(x), Value::Str(y)) => Ok(x < y),
            _ => self.compare_meta(a, b, "__lt"),
        }
    }

    pub fn less_equal(&mut self, a: &Value, b: &Value) -> Result<bool, Error> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x <= y),
            (Value::Str(x), Value::Str(y)) => Ok(x <= y),
            _ => self.compare_meta(a, b, "__le"),
        }
    }

    fn compare_meta(&mut self, a: &Value, b: &Value, event: &str) -> Result<bool, Error> {
        let mut handler = self.metamethod(a, event);
        if handler.is_nil() {
            handler = self.metamethod(b, event);
        }
        if !handler.is_nil() {
            return Ok(self.call_meta(handler, vec![a.clone(), b.clone()])?.is_truthy());
        }
        let (ta, tb) = (a.type_name(), b.type_name());
        if ta == tb {
            Err(self.rt_error(format!("attempt to compare two {ta} values")))
        } else {
            Err(self.rt_error(format!("attempt to compare {ta} with {tb}")))
        }
    }

    // ── Conversion ────────────────────────────────────────────────────────────

    /// `tostring(v)`: `__tostring`, then `__name`, then the plain rendering.
    pub fn tostring(&mut self, v: &Value) -> Result<Rc<str>, Error> {
        let handler = self.metamethod(v, "__tostring");
        if !handler.is_nil() {
            return match self.call_meta(handler, vec![v.clone()])? {
                Value::Str(s) => Ok(s),
                Value::Number(n) => Ok(Rc::from(fmt_number(n))),
                _ => Err(self.rt_error("'__tostring' must return a string")),
            };
        }
        if let Value::Str(s) = v {
            return Ok(Rc::clone(s));
        }
        if let Value::Str(name) = self.metamethod(v, "__name") {
            if let Value::Table(t) = v {
                return Ok(Rc::from(format!("{name}: {:#010x}", t.index())));
            }
        }
        Ok(Rc::from(v.to_string()))
    }
}

fn push_concat(out: &mut String, v: &Value) {
    match v {
        Value::Str(s) => out.push_str(s),
        Value::Number(n) => out.push_str(&fmt_number(*n)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Value {
        Vm::new().exec(src, "meta").unwrap().into_iter().next().unwrap_or_default()
    }

    fn eval_err(src: &str) -> String {
        Vm::new().exec(src, "meta").unwrap_err().to_string()
    }

    #[test]
    fn index_falls_back_through_tables_and_functions() {
        let v = eval(
            "local base = {greet = 'hi'}
             local mid = setmetatable({}, {__index = base})
             local top = setmetatable({}, {__index = mid})
             return top.greet",
        );
        assert_eq!(v.to_string(), "hi");
        let v = eval("local t = setmetatable({}, {__index = function(_, k) return k .. '!' end}) return t.x");
        assert_eq!(v.to_string(), "x!");
    }

    #[test]
    fn index_chain_is_bounded() {
        let msg = eval_err(
            "local t = {}
             setmetatable(t, {__index = t})
             return t.missing",
        );
        assert!(msg.ends_with("'__index' chain too long; possible loop"), "{msg}");
    }

    #[test]
    fn newindex_intercepts_new_keys_only() {
        let v = eval(
            "local log = {}
             local t = setmetatable({present = 1}, {__newindex = function(t, k, v) log[#log + 1] = k end})
             t.present = 2
             t.fresh = 3
             return #log .. ':' .. tostring(rawget(t, 'fresh')) .. ':' .. t.present",
        );
        assert_eq!(v.to_string(), "1:nil:2");
    }

    #[test]
    fn arithmetic_and_comparison_metamethods() {
        let v = eval(
            "local V = {}
             V.__add = function(a, b) return setmetatable({x = a.x + b.x}, V) end
             V.__lt = function(a, b) return a.x < b.x end
             V.__le = function(a, b) return a.x <= b.x end
             V.__eq = function(a, b) return a.x == b.x end
             local a, b = setmetatable({x = 1}, V), setmetatable({x = 2}, V)
             local c = a + b
             return c.x, a < b, b <= a, a == setmetatable({x = 1}, V)",
        );
        assert_eq!(v.as_number(), Some(3.0));
        let all = Vm::new()
            .exec(
                "local V = {__lt = function(a, b) return a.x < b.x end}
                 local a, b = setmetatable({x = 1}, V), setmetatable({x = 2}, V)
                 return a < b, b < a",
                "meta",
            )
            .unwrap();
        assert!(matches!(all[0], Value::Boolean(true)));
        assert!(matches!(all[1], Value::Boolean(false)));
    }

    #[test]
    fn eq_is_not_consulted_for_mixed_types() {
        let v = eval(
            "local t = setmetatable({}, {__eq = function() return true end})
             return t == 1",
        );
        assert!(matches!(v, Value::Boolean(false)));
    }

    #[test]
    fn concat_numbers_and_metamethod() {
        assert_eq!(eval("return 1 .. '' .. 2.5").to_string(), "12.5");
        let v = eval(
            "local t = setmetatable({}, {__concat = function(a, b) return 'joined' end})
             return 'x' .. t",
        );
        assert_eq!(v.to_string(), "joined");
        assert!(eval_err("return 'x' .. {}").ends_with("attempt to concatenate a table value"));
    }

    #[test]
    fn len_and_call_metamethods() {
        assert_eq!(
            eval("return #setmetatable({}, {__len = function() return 42 end})").as_number(),
            Some(42.0)
        );
        assert_eq!(
            eval("local f = setmetatable({}, {__call = function(self, a) return a * 2 end}) return f(21)")
                .as_number(),
            Some(42.0)
        );
        assert!(eval_err("return #nil").ends_with("attempt to get length of a nil value"));
    }

    #[test]
    fn tostring_and_name() {
        let v = eval("return tostring(setmetatable({}, {__tostring = function() return 'obj' end}))");
        assert_eq!(v.to_string(), "obj");
        let v = eval("return tostring(setmetatable({}, {__name = 'Point'}))");
        assert!(v.to_string().starts_with("Point: 0x"));
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        assert!(eval_err("local t = {} t[nil] = 1").ends_with("table index is nil"));
        assert!(eval_err("local t = {} t[0/0] = 1").ends_with("table index is NaN"));
    }
}
