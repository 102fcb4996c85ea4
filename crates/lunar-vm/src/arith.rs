//! Number semantics of the arithmetic and bitwise operators.
//!
//! All numbers are doubles. Bitwise operators work on the exact 64-bit
//! integer value of their operands and fail when there is none.

use crate::value::to_integer;
use lunar_core::ArithOp;

/// Apply `op` to two numbers. `None` when a bitwise operand is not integral.
pub fn apply(op: ArithOp, a: f64, b: f64) -> Option<f64> {
    let v = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => modulo(a, b),
        ArithOp::Pow => a.powf(b),
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::BAnd => (to_integer(a)? & to_integer(b)?) as f64,
        ArithOp::BOr => (to_integer(a)? | to_integer(b)?) as f64,
        ArithOp::BXor => (to_integer(a)? ^ to_integer(b)?) as f64,
        ArithOp::Shl => shift_left(to_integer(a)?, to_integer(b)?) as f64,
        ArithOp::Shr => shift_left(to_integer(a)?, to_integer(b)?.wrapping_neg()) as f64,
    };
    Some(v)
}

/// Floored modulo: the result takes the sign of the divisor.
pub fn modulo(a: f64, b: f64) -> f64 {
    let m = a % b;
    if (m > 0.0 && b < 0.0) || (m < 0.0 && b > 0.0) {
        m + b
    } else {
        m
    }
}

/// Logical shift; negative counts shift right, and 64 or more gives zero.
pub fn shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> (-n)) as i64
    }
}
