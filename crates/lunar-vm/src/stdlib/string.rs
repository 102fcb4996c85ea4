//! `string` library. Strings are indexed by byte; slices that split a UTF-8
//! sequence are repaired with replacement characters.

use super::pattern::{self, Capture, Matcher};
use super::{arg, arg_error, check_any, check_integer, check_string, new_lib, opt_integer};
use crate::error::Error;
use crate::table::Table;
use crate::value::{fmt_general, fmt_number, to_integer, NativeFn, NativeFunction, Value};
use crate::vm::Vm;
use std::fmt::Write as _;

/// Longest string `rep` will build.
const MAX_STRING_LEN: usize = i32::MAX as usize;

pub(super) fn open(vm: &mut Vm) {
    const FUNCS: &[(&str, NativeFn)] = &[
        ("len", len),
        ("sub", sub),
        ("upper", upper),
        ("lower", lower),
        ("rep", rep),
        ("reverse", reverse),
        ("byte", byte),
        ("char", char),
        ("format", format),
        ("find", find),
        ("match", str_match),
        ("gmatch", gmatch),
        ("gsub", gsub),
    ];
    let lib = new_lib(vm, "string", FUNCS);
    let mut meta = Table::new();
    meta.set_str("__index", Value::Table(lib));
    vm.string_meta = Some(vm.heap.alloc(meta));
}

fn bytes_value(bytes: &[u8]) -> Value {
    Value::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Translate a relative start position to a 0-based byte offset.
fn start_index(i: i64, len: usize) -> usize {
    if i > 0 {
        i as usize - 1
    } else if i == 0 || i.unsigned_abs() as usize > len {
        0
    } else {
        len - i.unsigned_abs() as usize
    }
}

/// Translate a relative end position to an exclusive byte offset.
fn end_index(j: i64, len: usize) -> usize {
    if j >= 0 {
        (j as usize).min(len)
    } else if j.unsigned_abs() as usize > len {
        0
    } else {
        len + 1 - j.unsigned_abs() as usize
    }
}

fn len(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "len")?;
    Ok(vec![Value::Number(s.len() as f64)])
}

fn sub(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "sub")?;
    let i = opt_integer(vm, &args, 1, "sub", 1)?;
    let j = opt_integer(vm, &args, 2, "sub", -1)?;
    let bytes = s.as_bytes();
    let (start, end) = (start_index(i, bytes.len()), end_index(j, bytes.len()));
    if start >= end {
        return Ok(vec![Value::str("")]);
    }
    Ok(vec![bytes_value(&bytes[start..end])])
}

fn upper(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "upper")?;
    Ok(vec![Value::from(s.to_ascii_uppercase())])
}

fn lower(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "lower")?;
    Ok(vec![Value::from(s.to_ascii_lowercase())])
}

fn rep(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "rep")?;
    let n = check_integer(vm, &args, 1, "rep")?;
    let sep = match arg(&args, 2) {
        Value::Nil => None,
        _ => Some(check_string(vm, &args, 2, "rep")?),
    };
    if n <= 0 {
        return Ok(vec![Value::str("")]);
    }
    let unit = s.len() + sep.as_ref().map_or(0, |p| p.len());
    if unit.saturating_mul(n as usize) > MAX_STRING_LEN {
        return Err(vm.rt_error("resulting string too large"));
    }
    let parts = vec![&*s; n as usize];
    Ok(vec![Value::from(parts.join(sep.as_deref().unwrap_or("")))])
}

fn reverse(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "reverse")?;
    let mut bytes = s.as_bytes().to_vec();
    bytes.reverse();
    Ok(vec![bytes_value(&bytes)])
}

fn byte(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "byte")?;
    let i = opt_integer(vm, &args, 1, "byte", 1)?;
    let j = opt_integer(vm, &args, 2, "byte", i)?;
    let bytes = s.as_bytes();
    let (start, end) = (start_index(i, bytes.len()), end_index(j, bytes.len()));
    if start >= end {
        return Ok(Vec::new());
    }
    Ok(bytes[start..end]
        .iter()
        .map(|&b| Value::Number(b as f64))
        .collect())
}

fn char(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let mut bytes = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        let c = check_integer(vm, &args, i, "char")?;
        let b = u8::try_from(c).map_err(|_| arg_error(vm, i, "char", "value out of range"))?;
        bytes.push(b);
    }
    Ok(vec![bytes_value(&bytes)])
}

// ── format ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl Spec {
    /// Pad `body` to the field width; zero padding goes after the sign.
    fn pad(&self, body: String) -> String {
        let len = body.chars().count();
        if len >= self.width {
            return body;
        }
        let fill = self.width - len;
        if self.left {
            format!("{body}{}", " ".repeat(fill))
        } else if self.zero {
            let sign = body.starts_with(['-', '+', ' ']) as usize;
            let (head, tail) = body.split_at(sign);
            format!("{head}{}{tail}", "0".repeat(fill))
        } else {
            format!("{}{body}", " ".repeat(fill))
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }
}

/// C `%e` body for a finite, non-negative `n`.
fn fmt_exp(n: f64, precision: usize, upper: bool) -> String {
    let sci = format!("{:.*e}", precision, n);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if exp < 0 { '-' } else { '+' };
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{sign}{:02}", exp.abs())
}

fn format_float(spec: &Spec, conv: u8, n: f64) -> String {
    let upper = conv.is_ascii_uppercase();
    let body = if !n.is_finite() {
        let text = fmt_number(n.abs());
        if upper {
            text.to_ascii_uppercase()
        } else {
            text
        }
    } else {
        let precision = spec.precision.unwrap_or(6);
        let a = n.abs();
        match conv.to_ascii_lowercase() {
            b'f' => format!("{:.*}", precision, a),
            b'e' => fmt_exp(a, precision, upper),
            _ => {
                let g = fmt_general(a, precision, spec.alternate);
                if upper {
                    g.to_ascii_uppercase()
                } else {
                    g
                }
            }
        }
    };
    let negative = n.is_sign_negative() && !n.is_nan();
    let padded = Spec {
        zero: spec.zero && n.is_finite(),
        ..*spec
    };
    padded.pad(format!("{}{body}", spec.sign(negative)))
}

fn format_int(spec: &Spec, conv: u8, n: i64) -> String {
    let mut digits = match conv {
        b'x' => format!("{:x}", n),
        b'X' => format!("{:X}", n),
        b'o' => format!("{:o}", n),
        _ => n.unsigned_abs().to_string(),
    };
    if let Some(p) = spec.precision {
        if digits.len() < p {
            digits = format!("{}{digits}", "0".repeat(p - digits.len()));
        }
    }
    let prefix = match conv {
        b'x' if spec.alternate && n != 0 => "0x",
        b'X' if spec.alternate && n != 0 => "0X",
        b'd' | b'i' => spec.sign(n < 0),
        _ => "",
    };
    let padded = Spec {
        zero: spec.zero && spec.precision.is_none(),
        ..*spec
    };
    padded.pad(format!("{prefix}{digits}"))
}

fn quoted(v: &Value) -> Option<String> {
    match v {
        Value::Str(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            let mut chars = s.chars().peekable();
            while let Some(c) = chars.next() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\\n"),
                    '\r' => out.push_str("\\r"),
                    '\0' => {
                        let digit_follows = chars.peek().is_some_and(char::is_ascii_digit);
                        out.push_str(if digit_follows { "\\000" } else { "\\0" });
                    }
                    c if c.is_ascii_control() => {
                        let digit_follows = chars.peek().is_some_and(char::is_ascii_digit);
                        if digit_follows {
                            let _ = write!(out, "\\{:03}", c as u32);
                        } else {
                            let _ = write!(out, "\\{}", c as u32);
                        }
                    }
                    c => out.push(c),
                }
            }
            out.push('"');
            Some(out)
        }
        Value::Number(n) => Some(match to_integer(*n) {
            Some(i) if n.is_finite() => i.to_string(),
            _ if n.is_nan() => "(0/0)".to_string(),
            _ if n.is_infinite() => if *n > 0.0 { "1e9999" } else { "-1e9999" }.to_string(),
            _ => format!("{n:?}"),
        }),
        Value::Nil | Value::Boolean(_) => Some(v.to_string()),
        _ => None,
    }
}

fn format(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let fmt = check_string(vm, &args, 0, "format")?;
    let bytes = fmt.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut next_arg = 1;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c != b'%' {
            // Copy the literal run up to the next directive.
            let run_end = fmt[i..].find('%').map_or(bytes.len(), |k| i + k);
            out.push_str(&fmt[i..run_end]);
            i = run_end;
            continue;
        }
        i += 1;
        if bytes.get(i) == Some(&b'%') {
            out.push('%');
            i += 1;
            continue;
        }

        let mut spec = Spec::default();
        while let Some(&flag) = bytes.get(i) {
            match flag {
                b'-' => spec.left = true,
                b'+' => spec.plus = true,
                b' ' => spec.space = true,
                b'#' => spec.alternate = true,
                b'0' => spec.zero = true,
                _ => break,
            }
            i += 1;
        }
        let digits = |i: &mut usize| {
            let start = *i;
            while bytes.get(*i).is_some_and(u8::is_ascii_digit) && *i - start < 2 {
                *i += 1;
            }
            fmt[start..*i].parse::<usize>().unwrap_or(0)
        };
        spec.width = digits(&mut i);
        if bytes.get(i) == Some(&b'.') {
            i += 1;
            spec.precision = Some(digits(&mut i));
        }
        let Some(&conv) = bytes.get(i) else {
            return Err(vm.rt_error("invalid conversion '%' to 'format'"));
        };
        i += 1;

        let n = next_arg;
        next_arg += 1;
        let piece = match conv {
            b'd' | b'i' | b'u' => {
                let v = check_integer(vm, &args, n, "format")?;
                format_int(&spec, b'd', v)
            }
            b'x' | b'X' | b'o' => {
                let v = check_integer(vm, &args, n, "format")?;
                format_int(&spec, conv, v)
            }
            b'c' => {
                let v = check_integer(vm, &args, n, "format")?;
                let c = u8::try_from(v).map_or('\u{fffd}', char::from);
                spec.pad(c.to_string())
            }
            b'e' | b'E' | b'f' | b'F' | b'g' | b'G' => {
                let v = super::check_number(vm, &args, n, "format")?;
                format_float(&spec, conv, v)
            }
            b's' => {
                let v = check_any(vm, &args, n, "format")?;
                let s = vm.tostring(&v)?;
                match spec.precision {
                    Some(p) => spec.pad(s.chars().take(p).collect()),
                    None => spec.pad(s.to_string()),
                }
            }
            b'q' => {
                let v = check_any(vm, &args, n, "format")?;
                quoted(&v).ok_or_else(|| arg_error(vm, n, "format", "value has no literal form"))?
            }
            _ => {
                let directive = &fmt[fmt[..i].rfind('%').unwrap_or(0)..i];
                return Err(vm.rt_error(format!("invalid conversion '{directive}' to 'format'")));
            }
        };
        out.push_str(&piece);
    }
    Ok(vec![Value::from(out)])
}

// ── Pattern functions ─────────────────────────────────────────────────────────

fn capture_value(src: &[u8], c: &Capture) -> Value {
    match *c {
        Capture::Span(s, e) => bytes_value(&src[s..e]),
        Capture::Position(p) => Value::Number(p as f64),
    }
}

fn init_offset(vm: &Vm, args: &[Value], fname: &str, len: usize) -> Result<Option<usize>, Error> {
    let init = opt_integer(vm, args, 2, fname, 1)?;
    let start = start_index(init, len);
    Ok((start <= len).then_some(start))
}

fn find(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    find_aux(vm, args, true)
}

fn str_match(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    find_aux(vm, args, false)
}

fn find_aux(vm: &mut Vm, args: Vec<Value>, is_find: bool) -> Result<Vec<Value>, Error> {
    let fname = if is_find { "find" } else { "match" };
    let s = check_string(vm, &args, 0, fname)?;
    let p = check_string(vm, &args, 1, fname)?;
    let (src, pat) = (s.as_bytes(), p.as_bytes());
    let Some(init) = init_offset(vm, &args, fname, src.len())? else {
        return Ok(vec![Value::Nil]);
    };

    if is_find && (arg(&args, 3).is_truthy() || pattern::is_plain(pat)) {
        let found = if pat.is_empty() {
            Some(init)
        } else {
            src[init..]
                .windows(pat.len())
                .position(|w| w == pat)
                .map(|k| init + k)
        };
        return Ok(match found {
            Some(start) => vec![
                Value::Number((start + 1) as f64),
                Value::Number((start + pat.len()) as f64),
            ],
            None => vec![Value::Nil],
        });
    }

    let found = pattern::find(src, pat, init).map_err(|msg| vm.rt_error(msg))?;
    let Some((start, end, m)) = found else {
        return Ok(vec![Value::Nil]);
    };
    let caps = m
        .captures(start, end, !is_find)
        .map_err(|msg| vm.rt_error(msg))?;
    let mut out = Vec::with_capacity(caps.len() + 2);
    if is_find {
        out.push(Value::Number((start + 1) as f64));
        out.push(Value::Number(end as f64));
    }
    out.extend(caps.iter().map(|c| capture_value(src, c)));
    Ok(out)
}

fn gmatch(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "gmatch")?;
    let p = check_string(vm, &args, 1, "gmatch")?;
    let mut state = Table::new();
    state.set_str("pos", Value::Number(0.0));
    let state = vm.heap.alloc(state);
    Ok(vec![Value::Native(NativeFunction::with_upvalues(
        "gmatch_iter",
        gmatch_iter,
        vec![Value::Str(s), Value::Str(p), Value::Table(state)],
    ))])
}

fn gmatch_iter(vm: &mut Vm, _args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let (Value::Str(s), Value::Str(p), Value::Table(state)) =
        (vm.native_upvalue(0), vm.native_upvalue(1), vm.native_upvalue(2))
    else {
        return Err(vm.rt_error("gmatch iterator lost its state"));
    };
    let (src, pat) = (s.as_bytes(), p.as_bytes());
    let pos = vm.heap.get(state).get_str("pos").as_number().unwrap_or(0.0) as usize;
    let last = vm.heap.get(state).get_str("last").as_number().map(|n| n as usize);

    let mut m = Matcher::new(src, pat);
    for start in pos..=src.len() {
        let end = m.try_at(start, 0).map_err(|msg| vm.rt_error(msg))?;
        if let Some(end) = end.filter(|&e| Some(e) != last) {
            let caps = m.captures(start, end, true).map_err(|msg| vm.rt_error(msg))?;
            let t = vm.heap.get_mut(state);
            t.set_str("pos", Value::Number(end as f64));
            t.set_str("last", Value::Number(end as f64));
            return Ok(caps.iter().map(|c| capture_value(src, c)).collect());
        }
    }
    vm.heap
        .get_mut(state)
        .set_str("pos", Value::Number((src.len() + 1) as f64));
    Ok(vec![Value::Nil])
}

fn gsub(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let s = check_string(vm, &args, 0, "gsub")?;
    let p = check_string(vm, &args, 1, "gsub")?;
    let repl = arg(&args, 2);
    match repl {
        Value::Str(_) | Value::Number(_) | Value::Table(_) | Value::Function(_) | Value::Native(_) => {}
        ref other => {
            return Err(arg_error(
                vm,
                2,
                "gsub",
                &format!("string/function/table expected, got {}", other.type_name()),
            ))
        }
    }
    let max = match arg(&args, 3) {
        Value::Nil => None,
        _ => Some(check_integer(vm, &args, 3, "gsub")?),
    };

    let (src, pat) = (s.as_bytes(), p.as_bytes());
    let anchored = pat.first() == Some(&b'^');
    let p0 = usize::from(anchored);
    let mut out: Vec<u8> = Vec::with_capacity(src.len());
    let mut pos = 0;
    let mut last = None;
    let mut count: i64 = 0;
    while max.map_or(true, |max| count < max) {
        let mut m = Matcher::new(src, pat);
        let end = m.try_at(pos, p0).map_err(|msg| vm.rt_error(msg))?;
        match end.filter(|&e| Some(e) != last) {
            Some(end) => {
                count += 1;
                let caps = m.captures(pos, end, true).map_err(|msg| vm.rt_error(msg))?;
                let whole = &src[pos..end];
                replace(vm, &repl, src, whole, &caps, m.capture_count(), &mut out)?;
                pos = end;
                last = Some(end);
            }
            None if pos < src.len() => {
                out.push(src[pos]);
                pos += 1;
            }
            None => break,
        }
        if anchored {
            break;
        }
    }
    out.extend_from_slice(&src[pos.min(src.len())..]);
    Ok(vec![bytes_value(&out), Value::Number(count as f64)])
}

fn replace(
    vm: &mut Vm,
    repl: &Value,
    src: &[u8],
    whole: &[u8],
    caps: &[Capture],
    ncaps: usize,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let value = match repl {
        Value::Str(_) | Value::Number(_) => {
            let text = repl.to_string();
            let t = text.as_bytes();
            let mut i = 0;
            while i < t.len() {
                if t[i] != b'%' {
                    out.push(t[i]);
                    i += 1;
                    continue;
                }
                i += 1;
                match t.get(i) {
                    Some(b'%') => out.push(b'%'),
                    Some(b'0') => out.extend_from_slice(whole),
                    Some(d @ b'1'..=b'9') => {
                        let k = (d - b'1') as usize;
                        if k >= caps.len() || (ncaps == 0 && k > 0) {
                            return Err(vm.rt_error(format!("invalid capture index %{} in replacement string", k + 1)));
                        }
                        match capture_value(src, &caps[k]) {
                            Value::Str(s) => out.extend_from_slice(s.as_bytes()),
                            other => out.extend_from_slice(other.to_string().as_bytes()),
                        }
                    }
                    _ => return Err(vm.rt_error("invalid use of '%' in replacement string")),
                }
                i += 1;
            }
            return Ok(());
        }
        Value::Table(_) => {
            let key = caps.first().map_or(Value::Nil, |c| capture_value(src, c));
            vm.index(repl.clone(), key)?
        }
        _ => {
            let call_args = caps.iter().map(|c| capture_value(src, c)).collect();
            vm.call(repl.clone(), call_args)?
                .into_iter()
                .next()
                .unwrap_or_default()
        }
    };
    match value {
        Value::Nil | Value::Boolean(false) => out.extend_from_slice(whole),
        Value::Str(s) => out.extend_from_slice(s.as_bytes()),
        Value::Number(n) => out.extend_from_slice(fmt_number(n).as_bytes()),
        other => {
            return Err(vm.rt_error(format!(
                "invalid replacement value (a {})",
                other.type_name()
            )))
        }
    }
    Ok(())
}
