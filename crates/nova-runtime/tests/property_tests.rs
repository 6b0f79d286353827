//! Property tests for the runtime's core invariants

mod common;

use nova_runtime::value::format_number;
use nova_runtime::{Heap, Lexer, State, TokenKind};
use proptest::prelude::*;

proptest! {
    /// Interned handles are equal exactly when the byte content is equal
    #[test]
    fn intern_identity_matches_content_equality(a in ".{0,40}", b in ".{0,40}") {
        let mut heap = Heap::new();
        let ra = heap.intern(&a);
        let rb = heap.intern(&b);
        prop_assert_eq!(ra == rb, a == b);
        prop_assert_eq!(heap.string(ra), a.as_str());
        prop_assert_eq!(heap.string(rb), b.as_str());
    }

    /// Interning is stable across repeated calls
    #[test]
    fn intern_is_idempotent(text in ".{0,60}") {
        let mut heap = Heap::new();
        let first = heap.intern(&text);
        let second = heap.intern(&text);
        let third = heap.intern(&text);
        prop_assert_eq!(first, second);
        prop_assert_eq!(second, third);
    }

    /// Canonical number formatting round-trips through parsing
    #[test]
    fn number_formatting_round_trips(n in proptest::num::f64::ANY) {
        prop_assume!(!n.is_nan());
        let text = format_number(n);
        let back: f64 = text.parse().expect("canonical form parses");
        prop_assert_eq!(back.to_bits(), n.to_bits());
    }

    /// The lexer terminates without panicking on arbitrary input
    #[test]
    fn lexer_always_terminates(source in ".{0,200}") {
        let mut lexer = Lexer::new(&source);
        let mut remaining = source.len() + 10;
        loop {
            let token = lexer.scan_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            remaining = remaining.checked_sub(1).expect("lexer made no progress");
        }
    }

    /// The compiler reports errors instead of panicking on token soup
    #[test]
    fn compiler_never_panics(source in "[ a-z0-9+*/(){}=<>,;.\"\\[\\]-]{0,120}") {
        let mut state = State::new();
        let _ = state.compile_string(&source, "fuzz");
    }

    /// Compiled straight-line arithmetic is exact
    #[test]
    fn compiled_addition_matches_rust(a in -1.0e12f64..1.0e12, b in -1.0e12f64..1.0e12) {
        let mut state = State::new();
        let source = format!("return {:?} + {:?}", a, b);
        state.compile_string(&source, "prop").expect("valid source");
        state.pcall(0, 1).expect("addition runs");
        prop_assert_eq!(state.get_number(0), Some(a + b));
    }
}

#[test]
fn tostring_tonumber_round_trip_in_script() {
    let samples = "
        var values = {0, 1, -1, 0.5, 1e100, -2.25e-3, 123456.789}
        for v in values do
          assert(tonumber(tostring(v)) == v, \"round trip failed\")
        end
        return true
    ";
    assert!(common::eval_bool(samples));
}
