//! Shared helpers for integration tests
#![allow(dead_code)]

use nova_runtime::diagnostic::Diagnostic;
use nova_runtime::{stdlib, RuntimeError, State};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Cloneable sink capturing `print` output
#[derive(Clone, Default)]
pub struct SharedOutput(pub Arc<Mutex<Vec<u8>>>);

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedOutput {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("output is utf-8")
    }
}

/// A state with the stdlib open and `print` captured
pub fn new_state() -> (State, SharedOutput) {
    let mut state = State::new();
    stdlib::open(&mut state).expect("stdlib registration");
    let output = SharedOutput::default();
    state.set_output(Box::new(output.clone()));
    (state, output)
}

/// Run a script and return everything it printed
pub fn run(source: &str) -> String {
    let (mut state, output) = new_state();
    if let Err(diagnostics) = state.compile_string(source, "test") {
        panic!(
            "compile failed:\n{}",
            diagnostics
                .iter()
                .map(|d| d.to_human_string())
                .collect::<String>()
        );
    }
    if let Err(error) = state.pcall(0, 0) {
        panic!("runtime error: {}", error);
    }
    assert_eq!(state.depth(), 0, "stack not neutral after execution");
    output.text()
}

fn eval_one(source: &str) -> (State, SharedOutput) {
    let (mut state, output) = new_state();
    if let Err(diagnostics) = state.compile_string(source, "test") {
        panic!(
            "compile failed:\n{}",
            diagnostics
                .iter()
                .map(|d| d.to_human_string())
                .collect::<String>()
        );
    }
    if let Err(error) = state.pcall(0, 1) {
        panic!("runtime error: {}", error);
    }
    (state, output)
}

/// Evaluate a script ending in `return <number>`
pub fn eval_number(source: &str) -> f64 {
    let (state, _) = eval_one(source);
    state
        .get_number(0)
        .unwrap_or_else(|| panic!("expected a number result"))
}

/// Evaluate a script ending in `return <bool>`
pub fn eval_bool(source: &str) -> bool {
    let (state, _) = eval_one(source);
    state
        .get_bool(0)
        .unwrap_or_else(|| panic!("expected a bool result"))
}

/// Evaluate a script ending in `return <string>`
pub fn eval_str(source: &str) -> String {
    let (state, _) = eval_one(source);
    state
        .get_string(0)
        .unwrap_or_else(|| panic!("expected a string result"))
        .to_string()
}

/// Whether a script's single result is nil
pub fn eval_is_nil(source: &str) -> bool {
    let (state, _) = eval_one(source);
    state.peek(0).is_nil()
}

/// Run a script that must fail at runtime; returns the error
pub fn runtime_error(source: &str) -> RuntimeError {
    let (mut state, _) = new_state();
    state
        .compile_string(source, "test")
        .unwrap_or_else(|d| panic!("compile failed: {:?}", d));
    match state.pcall(0, 0) {
        Ok(()) => panic!("expected a runtime error"),
        Err(error) => error,
    }
}

/// Compile a script that must fail; returns the diagnostics
pub fn compile_errors(source: &str) -> Vec<Diagnostic> {
    let (mut state, _) = new_state();
    match state.compile_string(source, "test") {
        Ok(()) => panic!("expected compile errors"),
        Err(diagnostics) => diagnostics,
    }
}
