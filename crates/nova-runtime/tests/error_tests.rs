//! Compile-time diagnostics, panic recovery, and runtime limits

mod common;

use common::{compile_errors, runtime_error};
use nova_runtime::{DiagnosticLevel, ErrorKind};
use pretty_assertions::assert_eq;
use rstest::rstest;

#[rstest]
#[case("return ((", "NV2001")]
#[case("var = 3", "NV2001")]
#[case("if x 1 end", "NV2001")]
#[case("while true print(1) end", "NV2001")]
#[case("function f( end", "NV2001")]
#[case("1 + 2 = 3", "NV2006")]
#[case("break", "NV2007")]
#[case("continue", "NV2007")]
fn syntax_errors_carry_codes(#[case] source: &str, #[case] code: &str) {
    let diagnostics = compile_errors(source);
    assert!(
        diagnostics.iter().any(|d| d.code == code),
        "expected {} in {:?}",
        code,
        diagnostics.iter().map(|d| &d.code).collect::<Vec<_>>()
    );
}

#[test]
fn diagnostics_carry_line_and_module() {
    let diagnostics = compile_errors("var a = 1\nvar b = \nvar c = 3");
    assert_eq!(diagnostics[0].module, "test");
    assert_eq!(diagnostics[0].level, DiagnosticLevel::Error);
    assert!(diagnostics[0].line >= 2);
    assert!(!diagnostics[0].snippet.is_empty());
}

#[test]
fn panic_mode_recovers_at_statement_boundaries() {
    // Two broken statements produce two diagnostics, not a cascade
    let diagnostics = compile_errors("var = 1; var = 2;");
    assert_eq!(diagnostics.len(), 2);
}

#[test]
fn lexical_errors_become_diagnostics() {
    let diagnostics = compile_errors("var s = \"unterminated");
    assert!(diagnostics.iter().any(|d| d.code == "NV1002"));

    let diagnostics = compile_errors("var x = 1 $ 2");
    assert!(diagnostics.iter().any(|d| d.code == "NV1001"));

    let diagnostics = compile_errors("var s = \"bad\\qescape\"");
    assert!(diagnostics.iter().any(|d| d.code == "NV1003"));

    let diagnostics = compile_errors("/* never closed\nvar x = 1");
    assert!(diagnostics.iter().any(|d| d.code == "NV1004"));
}

#[test]
fn too_many_locals_is_a_compile_error() {
    let mut source = String::from("function crowded()\n");
    for i in 0..260 {
        source.push_str(&format!("var l{} = {}\n", i, i));
    }
    source.push_str("end\n");
    let diagnostics = compile_errors(&source);
    assert!(diagnostics.iter().any(|d| d.code == "NV2002"));
}

#[test]
fn too_many_upvalues_is_a_compile_error() {
    // 300 distinct captures reach the innermost function: 200 chained
    // through the middle function's upvalues plus 100 of its locals
    let mut source = String::from("function outer()\n");
    for i in 0..200 {
        source.push_str(&format!("var a{} = {}\n", i, i));
    }
    source.push_str("function middle()\n");
    for i in 0..100 {
        source.push_str(&format!("var b{} = {}\n", i, i));
    }
    source.push_str("function inner()\nvar total = 0\n");
    for i in 0..200 {
        source.push_str(&format!("total = total + a{}\n", i));
    }
    for i in 0..100 {
        source.push_str(&format!("total = total + b{}\n", i));
    }
    source.push_str("return total\nend\nreturn inner\nend\nreturn middle\nend\n");
    let diagnostics = compile_errors(&source);
    assert!(diagnostics.iter().any(|d| d.code == "NV2003"));
}

#[test]
fn jumps_longer_than_u16_are_compile_errors() {
    // An if body too large for the forward jump's 16-bit distance
    let mut body = String::new();
    for i in 0..9000 {
        body.push_str(&format!("t = t + {}\n", i));
    }
    let source = format!("var t = 0\nif t == 0 then\n{}end\n", body);
    let diagnostics = compile_errors(&source);
    assert!(diagnostics.iter().any(|d| d.code == "NV2005"));
}

#[test]
fn too_many_constants_is_a_compile_error() {
    // Distinct number literals exhaust the 65 536-entry pool
    let mut source = String::with_capacity(800_000);
    for i in 0..66_000u32 {
        source.push_str(&format!("{}.5;", i));
    }
    let diagnostics = compile_errors(&source);
    assert!(diagnostics.iter().any(|d| d.code == "NV2004"));
}

#[test]
fn undefined_call_is_a_runtime_error() {
    let error = runtime_error("definitely_not_defined()");
    assert!(matches!(error.kind, ErrorKind::Type(_)));
    assert!(error.to_string().contains("call a nil value"));
}

#[test]
fn runtime_errors_locate_the_failing_line() {
    let error = runtime_error("var a = 1\n\n\nreturn a + nil");
    assert_eq!(error.line, 4);
    assert_eq!(error.module, "test");
}

#[test]
fn deep_recursion_overflows_the_call_stack() {
    let error = runtime_error("function f() return f() end f()");
    assert_eq!(error.kind, ErrorKind::CallDepth);
}

#[test]
fn native_arity_is_checked() {
    let error = runtime_error("type(1, 2)");
    assert!(matches!(error.kind, ErrorKind::Arity { expected: 1, got: 2 }));
}

#[test]
fn error_inside_nested_frames_unwinds_to_pcall() {
    let source = "
        function a() error(\"deep\") end
        function b() return a() end
        function c() return b() end
        var ok, err = pcall(c)
        if ok then error(\"should have failed\") end
        return err
    ";
    let (mut state, _) = common::new_state();
    state.compile_string(source, "test").unwrap();
    state.pcall(0, 1).unwrap();
    assert_eq!(state.get_string(0), Some("deep"));
    // The trap restored the stack: only the result remains
    assert_eq!(state.depth(), 1);
}

#[test]
fn unprotected_error_restores_the_embedder_stack() {
    let (mut state, _) = common::new_state();
    state.compile_string("error(\"top level\")", "test").unwrap();
    let error = state.pcall(0, 0).expect_err("expected failure");
    assert!(matches!(error.kind, ErrorKind::Thrown(_)));
    // pcall pushed exactly the error value
    assert_eq!(state.depth(), 1);
    assert_eq!(state.get_string(0), Some("top level"));
}
