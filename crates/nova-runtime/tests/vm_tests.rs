//! Core VM behavior: arithmetic, control flow, variables, increments

mod common;

use common::{eval_bool, eval_is_nil, eval_number, eval_str, run, runtime_error};
use nova_runtime::ErrorKind;
use pretty_assertions::assert_eq;
use rstest::rstest;

#[test]
fn arithmetic_prints_seven() {
    assert_eq!(run("print(1+2*3)"), "7\n");
}

#[rstest]
#[case("return 1 + 2", 3.0)]
#[case("return 10 - 4", 6.0)]
#[case("return 6 * 7", 42.0)]
#[case("return 9 / 2", 4.5)]
#[case("return 9 % 4", 1.0)]
#[case("return -(3 + 4)", -7.0)]
#[case("return 2 + 3 * 4 - 1", 13.0)]
#[case("return (2 + 3) * 4", 20.0)]
#[case("return 1.5e2", 150.0)]
fn arithmetic(#[case] source: &str, #[case] expected: f64) {
    assert_eq!(eval_number(source), expected);
}

#[test]
fn division_by_zero_follows_ieee() {
    assert_eq!(eval_number("return 1 / 0"), f64::INFINITY);
    assert_eq!(eval_number("return -1 / 0"), f64::NEG_INFINITY);
    assert!(eval_number("return 0 / 0").is_nan());
}

#[rstest]
#[case("return 1 < 2", true)]
#[case("return 2 <= 2", true)]
#[case("return 3 > 4", false)]
#[case("return 4 >= 5", false)]
#[case("return 1 == 1", true)]
#[case("return 1 != 1", false)]
#[case("return \"a\" == \"a\"", true)]
#[case("return \"a\" == \"b\"", false)]
#[case("return nil == nil", true)]
#[case("return nil == false", false)]
fn comparisons(#[case] source: &str, #[case] expected: bool) {
    assert_eq!(eval_bool(source), expected);
}

#[test]
fn truthiness_zero_is_truthy() {
    assert_eq!(eval_number("if 0 then return 1 else return 2 end"), 1.0);
    assert_eq!(eval_number("if nil then return 1 else return 2 end"), 2.0);
    assert_eq!(eval_number("if false then return 1 else return 2 end"), 2.0);
    assert_eq!(eval_number("if \"\" then return 1 else return 2 end"), 1.0);
}

#[test]
fn logical_operators_keep_operand_values() {
    assert_eq!(eval_number("return 1 and 2"), 2.0);
    assert_eq!(eval_bool("return false and 2"), false);
    assert_eq!(eval_number("return nil or 5"), 5.0);
    assert_eq!(eval_number("return 3 or 5"), 3.0);
    assert_eq!(eval_bool("return not 0"), false);
    assert_eq!(eval_bool("return not nil"), true);
}

#[test]
fn concat_converts_operands() {
    assert_eq!(eval_str("return \"a\" .. \"b\" .. \"c\""), "abc");
    assert_eq!(eval_str("return \"n=\" .. 42"), "n=42");
    assert_eq!(eval_str("return 1 .. 2 .. 3"), "123");
    assert_eq!(eval_str("return \"v:\" .. true .. nil"), "v:truenil");
}

#[test]
fn adding_strings_is_a_type_error() {
    let error = runtime_error("return \"a\" + \"b\"");
    assert!(matches!(error.kind, ErrorKind::Type(_)));
    assert!(error.to_string().contains("'..'"));
}

#[test]
fn globals_and_locals() {
    assert_eq!(
        eval_number("var x = 10 function f() return x + 1 end return f()"),
        11.0
    );
    assert_eq!(
        eval_number("var x = 1 do var x = 2 end return x"),
        1.0
    );
    // Assignment to an outer global from inside a function
    assert_eq!(
        eval_number("var x = 1 function f() x = 5 end f() return x"),
        5.0
    );
}

#[test]
fn undefined_global_reads_nil() {
    assert!(eval_is_nil("return no_such_global"));
}

#[test]
fn if_elseif_else_chain() {
    let source = "
        function classify(n)
          if n < 0 then return \"neg\"
          elseif n == 0 then return \"zero\"
          elseif n < 10 then return \"small\"
          else return \"big\"
          end
        end
        return classify(%N)
    ";
    assert_eq!(eval_str(&source.replace("%N", "-1")), "neg");
    assert_eq!(eval_str(&source.replace("%N", "0")), "zero");
    assert_eq!(eval_str(&source.replace("%N", "5")), "small");
    assert_eq!(eval_str(&source.replace("%N", "50")), "big");
}

#[test]
fn while_loop_with_break_and_continue() {
    let source = "
        var sum = 0
        var i = 0
        while true do
          i = i + 1
          if i > 10 then break end
          if i % 2 == 0 then continue end
          sum = sum + i
        end
        return sum
    ";
    // 1 + 3 + 5 + 7 + 9
    assert_eq!(eval_number(source), 25.0);
}

#[test]
fn c_style_for_loop() {
    assert_eq!(
        run("for (var i = 0; i < 5; i++) do print(i) end"),
        "0\n1\n2\n3\n4\n"
    );
}

#[test]
fn c_style_for_without_condition_breaks_out() {
    let source = "
        var n = 0
        for (;;) do
          n++
          if n == 3 then break end
        end
        return n
    ";
    assert_eq!(eval_number(source), 3.0);
}

#[test]
fn nested_loops_break_inner_only() {
    let source = "
        var hits = 0
        for (var i = 0; i < 3; i++) do
          for (var j = 0; j < 10; j++) do
            if j == 2 then break end
            hits++
          end
        end
        return hits
    ";
    assert_eq!(eval_number(source), 6.0);
}

#[test]
fn increment_forms_on_locals() {
    assert_eq!(eval_number("do var i = 5 return i++ end"), 5.0);
    assert_eq!(eval_number("do var i = 5 i++ return i end"), 6.0);
    assert_eq!(eval_number("do var i = 5 return ++i end"), 6.0);
    assert_eq!(eval_number("do var i = 5 return i-- end"), 5.0);
    assert_eq!(eval_number("do var i = 5 return --i end"), 4.0);
}

#[test]
fn increment_forms_on_globals() {
    assert_eq!(eval_number("var g = 7 g++ return g"), 8.0);
    assert_eq!(eval_number("var g = 7 var old = g-- return old * 10 + g"), 76.0);
}

#[test]
fn increment_forms_on_fields_and_indices() {
    assert_eq!(
        eval_number("var t = {count = 1} t.count++ ++t.count return t.count"),
        3.0
    );
    assert_eq!(
        eval_number("var t = {10, 20} t[0]++ return t[0] + t[1]"),
        31.0
    );
    assert_eq!(eval_number("var t = {5} return t[0]++"), 5.0);
}

#[test]
fn increment_non_number_errors() {
    let error = runtime_error("var s = \"x\" s++");
    assert!(matches!(error.kind, ErrorKind::Type(_)));
}

#[test]
fn count_operator() {
    assert_eq!(eval_number("return #\"hello\""), 5.0);
    assert_eq!(eval_number("return #{1, 2, 3}"), 3.0);
    assert_eq!(eval_number("var t = {} return #t"), 0.0);
}

#[test]
fn table_literals_and_indexing() {
    assert_eq!(eval_number("var t = {10, 20, 30} return t[1]"), 20.0);
    assert_eq!(eval_number("var t = {x = 1, y = 2} return t.x + t.y"), 3.0);
    assert_eq!(eval_number("var t = {[2 + 3] = 9} return t[5]"), 9.0);
    assert!(eval_is_nil("var t = {} return t.missing"));
    assert_eq!(
        eval_number("var t = {} t.a = 1 t[\"b\"] = 2 return t.a + t.b"),
        3.0
    );
}

#[test]
fn table_key_nil_errors() {
    let error = runtime_error("var t = {} t[nil] = 1");
    assert!(matches!(error.kind, ErrorKind::TableKey(_)));
}

#[test]
fn comparing_mixed_types_errors() {
    let error = runtime_error("return 1 < \"2\"");
    assert!(matches!(error.kind, ErrorKind::Type(_)));
}

#[test]
fn runtime_error_carries_module_and_line() {
    let error = runtime_error("var x = 1\nvar y = 2\nreturn x + \"s\"");
    assert_eq!(error.module, "test");
    assert_eq!(error.line, 3);
}

#[test]
fn do_block_scopes_locals() {
    let source = "
        var seen = 0
        do
          var hidden = 41
          seen = hidden + 1
        end
        return seen
    ";
    assert_eq!(eval_number(source), 42.0);
}

#[test]
fn semicolons_are_optional_separators() {
    assert_eq!(eval_number("var a = 1; var b = 2; return a + b;"), 3.0);
    assert_eq!(eval_number("var a = 1 var b = 2 return a + b"), 3.0);
}
