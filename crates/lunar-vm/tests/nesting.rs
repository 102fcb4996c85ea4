//! Deeply nested sources are rejected up front instead of exhausting the stack.

use lunar_vm::Vm;

fn nested(open: &str, inner: &str, close: &str, levels: usize) -> String {
    format!("return {}{inner}{}", open.repeat(levels), close.repeat(levels))
}

#[test]
fn deep_parentheses_are_a_syntax_error() {
    let mut vm = Vm::new();
    let err = vm.exec(&nested("(", "1", ")", 1000), "deep").unwrap_err();
    assert_eq!(err.kind(), "syntax");
    assert!(err.to_string().contains("chunk has too many syntax levels"), "{err}");

    // The state is untouched and keeps working.
    let v = vm.exec("return 1 + 1", "after").unwrap();
    assert_eq!(v[0].as_number(), Some(2.0));
}

#[test]
fn deep_tables_and_functions_are_a_syntax_error() {
    let mut vm = Vm::new();
    let tables = vm.exec(&nested("{", "", "}", 1000), "tables").unwrap_err();
    assert_eq!(tables.kind(), "syntax");
    let funcs = vm
        .exec(&nested("function() return ", "1", " end", 1000), "funcs")
        .unwrap_err();
    assert_eq!(funcs.kind(), "syntax");
}

#[test]
fn load_reports_deep_nesting_as_a_value() {
    let mut vm = Vm::new();
    let v = vm
        .exec(
            "local f, err = load('return ' .. string.rep('(', 1000) .. '1' .. string.rep(')', 1000))
             return f, err",
            "main",
        )
        .unwrap();
    assert!(v[0].is_nil());
    assert!(v[1].to_string().contains("chunk has too many syntax levels"));
}

#[test]
fn nesting_below_the_limit_runs() {
    let mut vm = Vm::new();
    let v = vm.exec(&nested("(", "7", ")", 100), "parens").unwrap();
    assert_eq!(v[0].as_number(), Some(7.0));
    let v = vm.exec(&nested("{", "", "}", 40), "tables").unwrap();
    assert_eq!(v[0].type_name(), "table");
    let v = vm.exec(&nested("function() return ", "3", " end", 40), "funcs").unwrap();
    assert_eq!(v[0].type_name(), "function");
}
