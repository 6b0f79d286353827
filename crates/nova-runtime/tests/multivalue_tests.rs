//! Multi-value calls, declarations, and the protected-call surface

mod common;

use common::{eval_bool, eval_is_nil, eval_number, eval_str, run};
use pretty_assertions::assert_eq;

#[test]
fn declaration_distributes_call_results() {
    let source = "
        function two() return 1, 2 end
        var a, b = two()
        return a * 10 + b
    ";
    assert_eq!(eval_number(source), 12.0);
}

#[test]
fn missing_values_pad_with_nil() {
    let source = "
        function one() return 5 end
        var a, b, c = one()
        return a == 5 and b == nil and c == nil
    ";
    assert_eq!(eval_bool(source), true);
}

#[test]
fn excess_values_are_popped() {
    let source = "
        function three() return 1, 2, 3 end
        var a = three()
        return a
    ";
    assert_eq!(eval_number(source), 1.0);
}

#[test]
fn non_final_calls_narrow_to_one_value() {
    let source = "
        function two() return 1, 2 end
        var a, b, c = two(), 9
        return a == 1 and b == 9 and c == nil
    ";
    assert_eq!(eval_bool(source), true);
}

#[test]
fn declaration_without_initializer_is_nil() {
    assert!(eval_is_nil("do var a, b return a end"));
    assert!(eval_is_nil("do var a, b return b end"));
}

#[test]
fn call_inside_expression_uses_one_result() {
    let source = "
        function two() return 3, 100 end
        return two() + 1
    ";
    assert_eq!(eval_number(source), 4.0);
}

#[test]
fn parenthesized_call_truncates_to_one() {
    let source = "
        function two() return 1, 2 end
        var a, b = (two())
        return a == 1 and b == nil
    ";
    assert_eq!(eval_bool(source), true);
}

#[test]
fn return_forwards_a_fixed_list() {
    let source = "
        function inner() return 1, 2, 3 end
        function outer() return inner(), 9 end
        var a, b, c = outer()
        return a == 1 and b == 9 and c == nil
    ";
    assert_eq!(eval_bool(source), true);
}

#[test]
fn variadic_parameter_collects_extras() {
    let source = "
        function gather(first, ...rest)
          return first, rest:len()
        end
        var head, count = gather(1, 2, 3, 4)
        return head * 10 + count
    ";
    assert_eq!(eval_number(source), 13.0);
}

#[test]
fn variadic_with_no_extras_gets_empty_table() {
    let source = "
        function gather(first, ...rest)
          return rest:len()
        end
        return gather(1)
    ";
    assert_eq!(eval_number(source), 0.0);
}

#[test]
fn variadic_extras_preserve_order() {
    let source = "
        function tail(...values)
          var out = \"\"
          for v in values do out = out .. v end
          return out
        end
        return tail(1, 2, 3)
    ";
    assert_eq!(eval_str(source), "123");
}

#[test]
fn missing_arguments_pad_with_nil() {
    let source = "
        function f(a, b) return b == nil end
        return f(1)
    ";
    assert_eq!(eval_bool(source), true);
}

#[test]
fn extra_arguments_are_dropped() {
    let source = "
        function f(a) return a end
        return f(7, 8, 9)
    ";
    assert_eq!(eval_number(source), 7.0);
}

#[test]
fn pcall_returns_true_and_results() {
    let source = "
        function two() return 1, 2 end
        var ok, a, b = pcall(two)
        return ok == true and a == 1 and b == 2
    ";
    assert_eq!(eval_bool(source), true);
}

#[test]
fn pcall_traps_errors_without_crashing() {
    let source = "
        var ok, err = pcall(function() error_undef() end)
        return ok == false and err != nil
    ";
    assert_eq!(eval_bool(source), true);
}

#[test]
fn pcall_passes_arguments_through() {
    let source = "
        function add(a, b) return a + b end
        var ok, sum = pcall(add, 20, 22)
        return ok and sum
    ";
    assert_eq!(eval_number(source), 42.0);
}

#[test]
fn error_value_round_trips_through_pcall() {
    let source = "
        var ok, err = pcall(function() error(\"boom\") end)
        return err
    ";
    assert_eq!(eval_str(source), "boom");
}

#[test]
fn error_can_carry_non_string_values() {
    let source = "
        var ok, err = pcall(function() error({code = 42}) end)
        return err.code
    ";
    assert_eq!(eval_number(source), 42.0);
}

#[test]
fn nested_pcall_boundaries() {
    let source = "
        var outer_ok, inner_result = pcall(function()
          var ok, err = pcall(function() error(\"inner\") end)
          return ok == false and err == \"inner\"
        end)
        return outer_ok and inner_result
    ";
    assert_eq!(eval_bool(source), true);
}

#[test]
fn execution_continues_after_trapped_error() {
    let source = "
        pcall(function() error(\"ignored\") end)
        print(\"still running\")
    ";
    assert_eq!(run(source), "still running\n");
}

#[test]
fn expression_statement_discards_all_results() {
    let source = "
        function two() return 1, 2 end
        two()
        two()
        return 99
    ";
    assert_eq!(eval_number(source), 99.0);
}

#[test]
fn assert_returns_its_argument() {
    assert_eq!(eval_number("return assert(41) + 1"), 42.0);
    let source = "
        var ok, err = pcall(function() assert(false, \"nope\") end)
        return err
    ";
    assert_eq!(eval_str(source), "nope");
}

#[test]
fn loadstring_compiles_and_runs() {
    let source = "
        var f = loadstring(\"return 6 * 7\")
        return f()
    ";
    assert_eq!(eval_number(source), 42.0);
}

#[test]
fn loadstring_reports_compile_errors() {
    let source = "
        var f, err = loadstring(\"return ((\")
        return f == nil and err != nil
    ";
    assert_eq!(eval_bool(source), true);
}
