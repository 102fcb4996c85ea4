//! Runtime values.

use crate::coroutine::Coroutine;
use crate::error::Error;
use crate::heap::Gc;
use crate::table::Table;
use crate::vm::Vm;
use lunar_core::Proto;
use std::fmt;
use std::rc::Rc;

/// Signature of every native function.
pub type NativeFn = fn(&mut Vm, Vec<Value>) -> Result<Vec<Value>, Error>;

/// How the dispatch loop treats a native when Lua code calls it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeKind {
    Plain,
    /// `pcall` and `xpcall` become protected frames instead of Rust calls,
    /// so coroutines can yield through them.
    Pcall,
    Xpcall,
}

/// A function implemented in Rust, optionally carrying captured values.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Rc<str>,
    pub func: NativeFn,
    /// Values visible to the function through [`Vm::native_upvalue`].
    pub upvalues: Rc<[Value]>,
    pub(crate) kind: NativeKind,
}

impl NativeFunction {
    pub fn new(name: &str, func: NativeFn) -> Self {
        Self::with_upvalues(name, func, Vec::new())
    }

    pub fn with_upvalues(name: &str, func: NativeFn, upvalues: Vec<Value>) -> Self {
        Self {
            name: Rc::from(name),
            func,
            upvalues: upvalues.into(),
            kind: NativeKind::Plain,
        }
    }

    pub(crate) fn protected(name: &str, func: NativeFn, kind: NativeKind) -> Self {
        Self {
            kind,
            ..Self::new(name, func)
        }
    }

    /// Identity: the same Rust function with the same captured values.
    pub fn same_as(&self, other: &NativeFunction) -> bool {
        self.func as usize == other.func as usize && Rc::ptr_eq(&self.upvalues, &other.upvalues)
    }

    pub(crate) fn address(&self) -> usize {
        self.func as usize ^ (Rc::as_ptr(&self.upvalues) as *const () as usize)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// A Lua function: a prototype plus its captured upvalue cells.
pub struct Closure {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<Gc<Upval>>,
}

/// Captured variable cell.
#[derive(Debug)]
pub enum Upval {
    /// Aliases stack `slot` of `thread` while the declaring scope is live.
    Open { thread: Gc<Coroutine>, slot: usize },
    /// Owns the value after the scope has exited.
    Closed(Value),
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    Str(Rc<str>),
    Table(Gc<Table>),
    Function(Gc<Closure>),
    Native(NativeFunction),
    Thread(Gc<Coroutine>),
}

impl Value {
    pub fn str(s: &str) -> Value {
        Value::Str(Rc::from(s))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) | Value::Native(_) => "function",
            Value::Thread(_) => "thread",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Only `nil` and `false` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Number, or a string holding a numeral.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Str(s) => lunar_lexer::parse_numeral(s.trim()),
            _ => None,
        }
    }

    /// Raw equality: numbers by value, strings by content, everything else by identity.
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => a.same_as(b),
            (Value::Thread(a), Value::Thread(b)) => a == b,
            _ => false,
        }
    }

    /// Pseudo-address shown by `tostring` for reference types.
    pub(crate) fn address(&self) -> Option<usize> {
        match self {
            Value::Table(g) => Some(g.index()),
            Value::Function(g) => Some(g.index()),
            Value::Thread(g) => Some(g.index()),
            Value::Native(n) => Some(n.address()),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

/// Display without metamethods, as `tostring` does for plain values.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => f.write_str(&fmt_number(*n)),
            Value::Str(s) => f.write_str(s),
            other => write!(
                f,
                "{}: {:#010x}",
                other.type_name(),
                other.address().unwrap_or_default()
            ),
        }
    }
}

/// Format a number the way `%.14g` does; integral values print without a fraction.
pub fn fmt_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if n == n.trunc() && n.abs() < 1e15 {
        // `-0.0` prints as "-0", matching C.
        if n == 0.0 && n.is_sign_negative() {
            return "-0".to_string();
        }
        return format!("{}", n as i64);
    }
    fmt_general(n, 14, false)
}

/// C `%.<precision>g`. With `alternate` trailing zeros are kept (`%#g`).
pub(crate) fn fmt_general(n: f64, precision: usize, alternate: bool) -> String {
    if !n.is_finite() {
        return fmt_number(n);
    }
    let precision = precision.max(1);
    // Round first so the exponent reflects the rounded value.
    let sci = format!("{:.*e}", precision - 1, n);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if exp < -4 || exp >= precision as i32 {
        let mantissa = if alternate {
            mantissa.to_string()
        } else {
            trim_fraction(mantissa)
        };
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        let fixed = format!("{:.*}", decimals, n);
        if alternate {
            fixed
        } else {
            trim_fraction(&fixed)
        }
    }
}

fn trim_fraction(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

/// Integer view of `n` when it has an exact 64-bit integer representation.
pub fn to_integer(n: f64) -> Option<i64> {
    // 2^63 itself is out of range; -2^63 is in range.
    if n == n.trunc() && n >= -9_223_372_036_854_775_808.0 && n < 9_223_372_036_854_775_808.0 {
        Some(n as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_format_like_percent_g() {
        assert_eq!(fmt_number(3.0), "3");
        assert_eq!(fmt_number(-0.0), "-0");
        assert_eq!(fmt_number(0.1), "0.1");
        assert_eq!(fmt_number(1.0 / 3.0), "0.33333333333333");
        assert_eq!(fmt_number(1e15), "1e+15");
        assert_eq!(fmt_number(1e100), "1e+100");
        assert_eq!(fmt_number(2.5e-7), "2.5e-07");
        assert_eq!(fmt_number(123456.789), "123456.789");
        assert_eq!(fmt_number(f64::INFINITY), "inf");
        assert_eq!(fmt_number(-f64::INFINITY), "-inf");
    }

    #[test]
    fn general_format_precision() {
        assert_eq!(fmt_general(3.14159, 3, false), "3.14");
        assert_eq!(fmt_general(100.0, 6, true), "100.000");
        assert_eq!(fmt_general(0.0001, 6, false), "0.0001");
        assert_eq!(fmt_general(0.00001, 6, false), "1e-05");
    }

    #[test]
    fn truthiness_and_equality() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::str("").is_truthy());
        assert!(Value::str("a").raw_eq(&Value::str("a")));
        assert!(!Value::Number(1.0).raw_eq(&Value::str("1")));
        assert!(!Value::Number(f64::NAN).raw_eq(&Value::Number(f64::NAN)));
    }

    #[test]
    fn string_coercion() {
        assert_eq!(Value::str(" 0x10 ").to_number(), Some(16.0));
        assert_eq!(Value::str("1e2").to_number(), Some(100.0));
        assert_eq!(Value::str("abc").to_number(), None);
    }

    #[test]
    fn integer_representation() {
        assert_eq!(to_integer(3.0), Some(3));
        assert_eq!(to_integer(3.5), None);
        assert_eq!(to_integer(f64::INFINITY), None);
        assert_eq!(to_integer(-9_223_372_036_854_775_808.0), Some(i64::MIN));
    }
}
