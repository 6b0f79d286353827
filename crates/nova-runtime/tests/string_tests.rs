//! The String prototype and string semantics

mod common;

use common::{eval_bool, eval_is_nil, eval_number, eval_str, run, runtime_error};
use nova_runtime::ErrorKind;
use pretty_assertions::assert_eq;
use rstest::rstest;

#[test]
fn sub_drops_leading_characters() {
    assert_eq!(eval_str("return \"hello\":sub(1)"), "ello");
}

#[rstest]
#[case("return \"hello\":sub(0)", "hello")]
#[case("return \"hello\":sub(5)", "")]
#[case("return \"hello\":sub(1, 3)", "el")]
#[case("return \"hello\":sub(0, 0)", "")]
fn sub_ranges(#[case] source: &str, #[case] expected: &str) {
    assert_eq!(eval_str(source), expected);
}

#[test]
fn sub_out_of_range_is_a_runtime_error() {
    let error = runtime_error("\"hello\":sub(9)");
    assert!(matches!(error.kind, ErrorKind::StringIndex { .. }));
}

#[test]
fn sub_error_is_trapped_by_pcall() {
    let source = "
        var ok, err = pcall(function() return \"hello\":sub(9) end)
        if ok then return \"no error\" end
        return err
    ";
    let message = eval_str(source);
    assert!(message.contains("out of range"), "got: {}", message);
}

#[test]
fn find_returns_index_or_nil() {
    assert_eq!(eval_number("return \"hello world\":find(\"world\")"), 6.0);
    assert_eq!(eval_number("return \"aaa\":find(\"a\", 1)"), 1.0);
    assert!(eval_is_nil("return \"hello\":find(\"z\")"));
}

#[test]
fn split_builds_a_table_of_pieces() {
    assert_eq!(
        run("for piece in \"a,b,c\":split(\",\") do print(piece) end"),
        "a\nb\nc\n"
    );
    assert_eq!(eval_number("return \"a,,b\":split(\",\"):len()"), 3.0);
    assert_eq!(eval_str("return \"one two\":split(\" \")[1]"), "two");
}

#[test]
fn split_with_empty_separator_errors() {
    let error = runtime_error("\"abc\":split(\"\")");
    assert!(matches!(error.kind, ErrorKind::Type(_)));
}

#[test]
fn len_upper_lower() {
    assert_eq!(eval_number("return \"hello\":len()"), 5.0);
    assert_eq!(eval_str("return \"MiXeD\":upper()"), "MIXED");
    assert_eq!(eval_str("return \"MiXeD\":lower()"), "mixed");
}

#[test]
fn string_methods_resolve_through_field_access_too() {
    // `s.sub` reads the method off the String prototype; calling it then
    // requires passing the receiver explicitly
    assert_eq!(eval_str("var f = \"hello\".sub return f(\"world\", 1)"), "orld");
}

#[test]
fn string_character_indexing() {
    assert_eq!(eval_str("return \"abc\"[1]"), "b");
    let error = runtime_error("return \"abc\"[3]");
    assert!(matches!(error.kind, ErrorKind::StringIndex { .. }));
}

#[test]
fn interned_strings_compare_by_identity() {
    assert_eq!(eval_bool("return \"ab\" == \"a\" .. \"b\""), true);
    assert_eq!(eval_bool("var parts = \"x-y\":split(\"-\") return parts[0] == \"x\""), true);
}

#[test]
fn escapes_round_trip_through_print() {
    assert_eq!(run("print(\"a\\tb\\\\c\")"), "a\tb\\c\n");
}

#[test]
fn number_to_string_formatting_is_canonical() {
    assert_eq!(eval_str("return tostring(7)"), "7");
    assert_eq!(eval_str("return tostring(0.5)"), "0.5");
    assert_eq!(eval_str("return tostring(-3)"), "-3");
    assert_eq!(eval_str("return tostring(1 / 0)"), "inf");
}

#[test]
fn tonumber_parses_and_rejects() {
    assert_eq!(eval_number("return tonumber(\"42\")"), 42.0);
    assert_eq!(eval_number("return tonumber(\" 2.5 \")"), 2.5);
    assert_eq!(eval_number("return tonumber(7)"), 7.0);
    assert!(eval_is_nil("return tonumber(\"not a number\")"));
    assert!(eval_is_nil("return tonumber(true)"));
}
