//! `math` library over float-only numbers.

use super::{arg, arg_error, check_any, check_integer, check_number, new_lib};
use crate::error::Error;
use crate::value::{to_integer, NativeFn, Value};
use crate::vm::Vm;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub(super) fn open(vm: &mut Vm) {
    const FUNCS: &[(&str, NativeFn)] = &[
        ("abs", abs),
        ("ceil", ceil),
        ("floor", floor),
        ("sqrt", sqrt),
        ("sin", sin),
        ("cos", cos),
        ("tan", tan),
        ("asin", asin),
        ("acos", acos),
        ("atan", atan),
        ("exp", exp),
        ("log", log),
        ("fmod", fmod),
        ("modf", modf),
        ("max", max),
        ("min", min),
        ("random", random),
        ("randomseed", randomseed),
        ("tointeger", tointeger),
        ("type", math_type),
        ("ult", ult),
    ];
    let lib = new_lib(vm, "math", FUNCS);
    let t = vm.heap.get_mut(lib);
    t.set_str("pi", Value::Number(std::f64::consts::PI));
    t.set_str("huge", Value::Number(f64::INFINITY));
    t.set_str("maxinteger", Value::Number(i64::MAX as f64));
    t.set_str("mininteger", Value::Number(i64::MIN as f64));
}

macro_rules! unary {
    ($($name:ident => $f:expr),* $(,)?) => {
        $(
            fn $name(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
                let x = check_number(vm, &args, 0, stringify!($name))?;
                let f: fn(f64) -> f64 = $f;
                Ok(vec![Value::Number(f(x))])
            }
        )*
    };
}

unary! {
    abs => f64::abs,
    ceil => f64::ceil,
    floor => f64::floor,
    sqrt => f64::sqrt,
    sin => f64::sin,
    cos => f64::cos,
    tan => f64::tan,
    asin => f64::asin,
    acos => f64::acos,
    exp => f64::exp,
}

fn atan(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let y = check_number(vm, &args, 0, "atan")?;
    let x = match arg(&args, 1) {
        Value::Nil => 1.0,
        _ => check_number(vm, &args, 1, "atan")?,
    };
    Ok(vec![Value::Number(y.atan2(x))])
}

fn log(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let x = check_number(vm, &args, 0, "log")?;
    let r = match arg(&args, 1) {
        Value::Nil => x.ln(),
        _ => match check_number(vm, &args, 1, "log")? {
            b if b == 2.0 => x.log2(),
            b if b == 10.0 => x.log10(),
            b => x.ln() / b.ln(),
        },
    };
    Ok(vec![Value::Number(r)])
}

fn fmod(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let a = check_number(vm, &args, 0, "fmod")?;
    let b = check_number(vm, &args, 1, "fmod")?;
    if b == 0.0 && to_integer(a).is_some() && to_integer(b).is_some() {
        return Err(arg_error(vm, 1, "fmod", "zero"));
    }
    Ok(vec![Value::Number(a % b)])
}

fn modf(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let x = check_number(vm, &args, 0, "modf")?;
    let int = x.trunc();
    let frac = if x.is_infinite() { 0.0 } else { x - int };
    Ok(vec![Value::Number(int), Value::Number(frac)])
}

fn max(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let mut best = check_number(vm, &args, 0, "max")?;
    for i in 1..args.len() {
        let x = check_number(vm, &args, i, "max")?;
        if x > best {
            best = x;
        }
    }
    Ok(vec![Value::Number(best)])
}

fn min(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let mut best = check_number(vm, &args, 0, "min")?;
    for i in 1..args.len() {
        let x = check_number(vm, &args, i, "min")?;
        if x < best {
            best = x;
        }
    }
    Ok(vec![Value::Number(best)])
}

fn random(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let (lo, hi) = match args.len() {
        0 => return Ok(vec![Value::Number(vm.rng.gen::<f64>())]),
        1 => (1, check_integer(vm, &args, 0, "random")?),
        2 => (
            check_integer(vm, &args, 0, "random")?,
            check_integer(vm, &args, 1, "random")?,
        ),
        _ => return Err(vm.rt_error("wrong number of arguments")),
    };
    if lo > hi {
        let which = if args.len() == 1 { 0 } else { 1 };
        return Err(arg_error(vm, which, "random", "interval is empty"));
    }
    Ok(vec![Value::Number(vm.rng.gen_range(lo..=hi) as f64)])
}

fn randomseed(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    vm.rng = match args.first() {
        None | Some(Value::Nil) => StdRng::from_entropy(),
        Some(_) => {
            let seed = check_number(vm, &args, 0, "randomseed")?;
            StdRng::seed_from_u64(seed.to_bits())
        }
    };
    Ok(Vec::new())
}

fn tointeger(_vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let r = match arg(&args, 0) {
        Value::Number(n) if to_integer(n).is_some() => Value::Number(n),
        _ => Value::Nil,
    };
    Ok(vec![r])
}

/// `"integer"` for numbers with an exact integer value, else `"float"`.
fn math_type(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let r = match check_any(vm, &args, 0, "type")? {
        Value::Number(n) if to_integer(n).is_some() => Value::str("integer"),
        Value::Number(_) => Value::str("float"),
        _ => Value::Nil,
    };
    Ok(vec![r])
}

fn ult(vm: &mut Vm, args: Vec<Value>) -> Result<Vec<Value>, Error> {
    let a = check_integer(vm, &args, 0, "ult")?;
    let b = check_integer(vm, &args, 1, "ult")?;
    Ok(vec![Value::Boolean((a as u64) < (b as u64))])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Vec<String> {
        Vm::new()
            .exec(src, "math")
            .unwrap()
            .iter()
            .map(Value::to_string)
            .collect()
    }

    #[test]
    fn rounding_and_extremes() {
        assert_eq!(
            eval("return math.floor(3.7), math.ceil(3.2), math.floor(-3.5), math.abs(-4), math.max(1, 9, 3), math.min(4, -2)"),
            vec!["3", "4", "-4", "4", "9", "-2"]
        );
        assert_eq!(eval("return math.huge, -math.huge, math.pi > 3.14"), vec!["inf", "-inf", "true"]);
    }

    #[test]
    fn modf_fmod_and_log() {
        assert_eq!(eval("return math.modf(3.75)"), vec!["3", "0.75"]);
        assert_eq!(eval("return math.modf(-math.huge)"), vec!["-inf", "0"]);
        assert_eq!(eval("return math.fmod(7, 3), math.fmod(-7, 3)"), vec!["1", "-1"]);
        assert_eq!(eval("return math.log(8, 2), math.log(100, 10), math.exp(0)"), vec!["3", "2", "1"]);
        let err = Vm::new().exec("math.fmod(1, 0)", "math").unwrap_err();
        assert_eq!(err.to_string(), "math:1: bad argument #2 to 'fmod' (zero)");
    }

    #[test]
    fn integer_views() {
        assert_eq!(
            eval("return math.tointeger(3.0), math.tointeger(3.5), math.type(1), math.type(1.5), math.type('1')"),
            vec!["3", "nil", "integer", "float", "nil"]
        );
        assert_eq!(eval("return math.ult(1, -1)"), vec!["true"]);
    }

    #[test]
    fn random_stays_in_range_and_reseeds() {
        let v = eval(
            "math.randomseed(42)
             local a = {}
             for i = 1, 5 do a[i] = math.random(1, 6) end
             math.randomseed(42)
             for i = 1, 5 do
                 local x = math.random(1, 6)
                 if x ~= a[i] or x < 1 or x > 6 or x % 1 ~= 0 then return false end
             end
             local f = math.random()
             return f >= 0 and f < 1 and math.random(3) <= 3",
        );
        assert_eq!(v, vec!["true"]);
        let err = Vm::new().exec("math.random(5, 1)", "math").unwrap_err();
        assert!(err.to_string().contains("interval is empty"));
    }
}
