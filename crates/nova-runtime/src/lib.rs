//! Nova runtime: core language implementation
//!
//! This library provides the complete Nova language runtime:
//! - Lexical analysis and single-pass bytecode compilation
//! - A stack-based virtual machine with closures, prototype objects and
//!   metamethods, and a mark-sweep garbage collector
//! - A stack-oriented embedding API and the built-in library
//!
//! ```
//! use nova_runtime::{stdlib, State};
//!
//! let mut state = State::new();
//! stdlib::open(&mut state).unwrap();
//! state.compile_string("print(1 + 2 * 3)", "example").unwrap();
//! state.pcall(0, 0).unwrap();
//! ```

/// Nova runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod api;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod heap;
pub mod lexer;
pub mod object;
pub mod span;
pub mod stdlib;
pub mod token;
pub mod value;
pub mod vm;

// Re-export commonly used types
pub use bytecode::{disassemble, Chunk, Opcode};
pub use diagnostic::{sort_diagnostics, Diagnostic, DiagnosticLevel};
pub use heap::Heap;
pub use lexer::Lexer;
pub use object::{NativeFn, ObjKind};
pub use span::Span;
pub use token::{Token, TokenKind};
pub use value::{ErrorKind, ObjRef, RuntimeError, Value};
pub use vm::State;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
        let mut state = State::new();
        stdlib::open(&mut state).unwrap();
        state.compile_string("return 40 + 2", "smoke").unwrap();
        state.pcall(0, 1).unwrap();
        assert_eq!(state.get_number(0), Some(42.0));
    }
}
