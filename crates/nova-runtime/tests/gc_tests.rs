//! Garbage collector behavior through the embedding API

mod common;

use common::{eval_number, new_state};
use pretty_assertions::assert_eq;

#[test]
fn collection_reclaims_unreachable_objects() {
    let (mut state, _) = new_state();
    let baseline = state.live_objects();
    for i in 0..1000 {
        state.push_string(&format!("garbage-{}", i));
        state.pop(1);
    }
    state.collect_garbage();
    assert!(
        state.live_objects() < baseline + 50,
        "live objects after collection: {} (baseline {})",
        state.live_objects(),
        baseline
    );
}

#[test]
fn reachable_values_survive_collection() {
    let (mut state, _) = new_state();
    state.push_string("keep me");
    state.collect_garbage();
    assert_eq!(state.get_string(0), Some("keep me"));
}

#[test]
fn globals_are_roots() {
    let (mut state, _) = new_state();
    state.push_string("payload");
    state.set_global("kept");
    state.collect_garbage();
    state.get_global("kept");
    assert_eq!(state.get_string(0), Some("payload"));
}

#[test]
fn anchors_are_roots() {
    let (mut state, _) = new_state();
    state.push_string("anchored");
    let value = state.peek(0);
    state.anchor(value);
    state.pop(1);
    state.collect_garbage();
    state.push_value(value);
    assert_eq!(state.get_string(0), Some("anchored"));
    state.release_anchor();
}

#[test]
fn frozen_state_postpones_collection() {
    let (mut state, _) = new_state();
    state.freeze_gc();
    for i in 0..5000 {
        state.push_string(&format!("frozen-{}", i));
        state.pop(1);
    }
    let during = state.live_objects();
    assert!(during >= 5000, "collected while frozen: {}", during);
    state.unfreeze_gc();
    state.collect_garbage();
    assert!(state.live_objects() < during);
}

#[test]
fn collection_during_script_execution_is_safe() {
    // Enough table churn to cross the collection threshold many times over
    let source = "
        var kept = {}
        for (var i = 0; i < 3000; i++) do
          var t = {i, i + 1, i + 2}
          if i % 1000 == 0 then kept:insert(t[0]) end
        end
        return kept[0] + kept[1] + kept[2]
    ";
    assert_eq!(eval_number(source), 3000.0);
}

#[test]
fn closed_upvalues_survive_collection() {
    let source = "
        function capture()
          var secret = 777
          return (function() return secret end)
        end
        var f = capture()
        for (var i = 0; i < 3000; i++) do
          var waste = {i, i, i}
        end
        return f()
    ";
    assert_eq!(eval_number(source), 777.0);
}

#[test]
fn interned_strings_survive_while_reachable() {
    let source = "
        var words = \"alpha beta gamma\":split(\" \")
        for (var i = 0; i < 3000; i++) do
          var waste = {\"chaff\" .. i}
        end
        return words[2] == \"gamma\"
    ";
    let (mut state, _) = new_state();
    state.compile_string(source, "test").unwrap();
    state.pcall(0, 1).unwrap();
    assert_eq!(state.get_bool(0), Some(true));
}

#[test]
fn reference_cycles_do_not_hang_collection() {
    let source = "
        var a = {}
        var b = {peer = a}
        a.peer = b
        for (var i = 0; i < 3000; i++) do
          var waste = {i}
        end
        return a.peer.peer == a
    ";
    let (mut state, _) = new_state();
    state.compile_string(source, "test").unwrap();
    state.pcall(0, 1).unwrap();
    assert_eq!(state.get_bool(0), Some(true));
    state.pop(1);
    state.collect_garbage();
}
