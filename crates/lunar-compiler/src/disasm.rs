use lunar_core::{Constant, OpCode, Proto, UpvalueDesc, MULTI};
use std::fmt::Write;

/// Render a [`Proto`] and its nested functions as a listing.
///
/// ```text
/// function <main:0> (3 instructions, 1 registers, vararg)
/// constants:
///   K0  1
/// code:
///      0  [1]  LoadConst     r0 K0 ; 1
/// ```
pub fn disassemble(proto: &Proto) -> String {
    let mut out = String::new();
    write_proto(proto, &mut out);
    out
}

fn write_proto(proto: &Proto, out: &mut String) {
    let _ = writeln!(
        out,
        "function <{}:{}> ({} instructions, {} registers, {} params{})",
        proto.source,
        proto.line_defined,
        proto.instructions.len(),
        proto.frame_size,
        proto.param_count,
        if proto.is_vararg { ", vararg" } else { "" },
    );

    if !proto.constants.is_empty() {
        out.push_str("constants:\n");
        for (i, c) in proto.constants.iter().enumerate() {
            let _ = writeln!(out, "  K{i}  {c}");
        }
    }
    if !proto.names.is_empty() {
        out.push_str("names:\n");
        for (i, n) in proto.names.iter().enumerate() {
            let _ = writeln!(out, "  N{i}  {n}");
        }
    }
    if !proto.upvalue_descs.is_empty() {
        out.push_str("upvalues:\n");
        for (i, desc) in proto.upvalue_descs.iter().enumerate() {
            let name = proto.upvalue_names.get(i).map_or("?", |n| &**n);
            let from = match desc {
                UpvalueDesc::Stack(reg) => format!("local r{reg}"),
                UpvalueDesc::Upvalue(idx) => format!("upvalue U{idx}"),
            };
            let _ = writeln!(out, "  U{i}  {name}  ({from})");
        }
    }

    out.push_str("code:\n");
    for (pc, op) in proto.instructions.iter().enumerate() {
        let _ = writeln!(
            out,
            "  {pc:>4}  [{}]  {}",
            proto.line_at(pc),
            instruction(pc, op, proto)
        );
    }

    for sub in &proto.protos {
        out.push('\n');
        write_proto(sub, out);
    }
}

fn count(n: u8) -> String {
    if n == MULTI {
        "*".to_string()
    } else {
        n.to_string()
    }
}

fn constant(proto: &Proto, idx: u16) -> String {
    proto
        .constants
        .get(idx as usize)
        .map_or_else(|| "?".to_string(), Constant::to_string)
}

fn name(proto: &Proto, idx: u16) -> &str {
    proto.names.get(idx as usize).map_or("?", |n| &**n)
}

/// Absolute target of a relative jump at `pc`.
fn target(pc: usize, offset: i32) -> i64 {
    pc as i64 + 1 + offset as i64
}

fn instruction(pc: usize, op: &OpCode, p: &Proto) -> String {
    match *op {
        OpCode::LoadConst { dst, const_idx } => {
            format!("LoadConst     r{dst} K{const_idx} ; {}", constant(p, const_idx))
        }
        OpCode::LoadNil { dst, count } => format!("LoadNil       r{dst} {count}"),
        OpCode::LoadBool { dst, value } => format!("LoadBool      r{dst} {value}"),
        OpCode::Move { dst, src } => format!("Move          r{dst} r{src}"),

        OpCode::Arith { op, dst, lhs, rhs } => {
            format!("{:<13} r{dst} r{lhs} r{rhs}", format!("{op:?}"))
        }
        OpCode::Unm { dst, src } => format!("Unm           r{dst} r{src}"),
        OpCode::BNot { dst, src } => format!("BNot          r{dst} r{src}"),
        OpCode::Not { dst, src } => format!("Not           r{dst} r{src}"),
        OpCode::Len { dst, src } => format!("Len           r{dst} r{src}"),
        OpCode::Concat { dst, start, count } => {
            format!("Concat        r{dst} r{start} {count}")
        }

        OpCode::Eq { dst, lhs, rhs } => format!("Eq            r{dst} r{lhs} r{rhs}"),
        OpCode::Lt { dst, lhs, rhs } => format!("Lt            r{dst} r{lhs} r{rhs}"),
        OpCode::Le { dst, lhs, rhs } => format!("Le            r{dst} r{lhs} r{rhs}"),

        OpCode::Jump { offset } => format!("Jump          -> {}", target(pc, offset)),
        OpCode::JumpIfFalse { src, offset } => {
            format!("JumpIfFalse   r{src} -> {}", target(pc, offset))
        }
        OpCode::JumpIfTrue { src, offset } => {
            format!("JumpIfTrue    r{src} -> {}", target(pc, offset))
        }

        OpCode::GetGlobal { dst, name_idx } => {
            format!("GetGlobal     r{dst} N{name_idx} ; {}", name(p, name_idx))
        }
        OpCode::SetGlobal { src, name_idx } => {
            format!("SetGlobal     r{src} N{name_idx} ; {}", name(p, name_idx))
        }
        OpCode::GetUpvalue { dst, upval_idx } => format!("GetUpvalue    r{dst} U{upval_idx}"),
        OpCode::SetUpvalue { src, upval_idx } => format!("SetUpvalue    r{src} U{upval_idx}"),
        OpCode::Closure { dst, proto_idx } => format!("Closure       r{dst} F{proto_idx}"),
        OpCode::Close { from } => format!("Close         r{from}"),
        OpCode::Tbc { reg } => format!("Tbc           r{reg}"),

        OpCode::NewTable { dst } => format!("NewTable      r{dst}"),
        OpCode::GetTable { dst, table, key } => format!("GetTable      r{dst} r{table} r{key}"),
        OpCode::SetTable { table, key, val } => format!("SetTable      r{table} r{key} r{val}"),
        OpCode::GetField {
            dst,
            table,
            name_idx,
        } => format!("GetField      r{dst} r{table} N{name_idx} ; {}", name(p, name_idx)),
        OpCode::SetField {
            table,
            name_idx,
            val,
        } => format!("SetField      r{table} N{name_idx} r{val} ; {}", name(p, name_idx)),
        OpCode::SetList {
            table,
            src,
            count: n,
            offset,
        } => format!("SetList       r{table} r{src} {} +{offset}", count(n)),
        OpCode::Method { dst, obj, name_idx } => {
            format!("Method        r{dst} r{obj} N{name_idx} ; {}", name(p, name_idx))
        }

        OpCode::Call {
            func,
            nargs,
            nresults,
        } => format!("Call          r{func} {} {}", count(nargs), count(nresults)),
        OpCode::TailCall { func, nargs } => format!("TailCall      r{func} {}", count(nargs)),
        OpCode::Return { src, count: n } => format!("Return        r{src} {}", count(n)),
        OpCode::VarArg { dst, count: n } => format!("VarArg        r{dst} {}", count(n)),

        OpCode::ForPrep { base, offset } => {
            format!("ForPrep       r{base} -> {}", target(pc, offset))
        }
        OpCode::ForLoop { base, offset } => {
            format!("ForLoop       r{base} -> {}", target(pc, offset))
        }
        OpCode::TForCall { base, nvars } => format!("TForCall      r{base} {nvars}"),
        OpCode::TForLoop { base, offset } => {
            format!("TForLoop      r{base} -> {}", target(pc, offset))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_source;

    #[test]
    fn listing_shows_nested_functions_and_jump_targets() {
        let proto = compile_source("local f = function(a) return a end\nwhile x do end", "demo").unwrap();
        let text = disassemble(&proto);
        assert!(text.starts_with("function <demo:0>"));
        assert!(text.contains("function <demo:1>"));
        assert!(text.contains("Closure       r0 F0"));
        assert!(text.contains("GetGlobal     r1 N0 ; x"));
        assert!(text.contains("Jump          -> "));
    }

    #[test]
    fn multi_counts_print_as_star() {
        let proto = compile_source("print(...)", "t").unwrap();
        assert!(disassemble(&proto).contains("Call          r0 * 0"));
    }
}
