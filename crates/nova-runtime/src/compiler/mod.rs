//! Single-pass compiler
//!
//! Pratt-style: tokens are pulled from the lexer on demand and bytecode is
//! emitted directly, with no intermediate tree. Per-function state nests in
//! a stack so closures can capture variables from enclosing functions.
//!
//! The garbage collector is frozen for the duration of a compile: functions
//! and interned constants allocated mid-compile are not yet reachable from
//! any root.

mod expr;
mod stmt;

use crate::bytecode::{Chunk, Opcode};
use crate::diagnostic::{sort_diagnostics, Diagnostic};
use crate::heap::Heap;
use crate::lexer::Lexer;
use crate::object::{FunctionKind, Obj, ObjFunction};
use crate::token::{Token, TokenKind};
use crate::value::{ObjRef, Value};
use std::collections::HashMap;

/// Maximum local variables per function (including reserved slot 0)
pub const MAX_LOCALS: usize = 256;
/// Maximum captured variables per function
pub const MAX_UPVALUES: usize = 256;
/// Maximum arguments at a call site, parameters in a declaration, and
/// entries in a table constructor
pub const MAX_ARGS: usize = 255;

/// Compile Nova source into a function object
///
/// On success the returned function has no upvalues and can be wrapped in a
/// closure and called with zero arguments. On failure every diagnostic
/// found is returned, sorted by location, and no function is produced.
pub fn compile(source: &str, module: &str, heap: &mut Heap) -> Result<ObjRef, Vec<Diagnostic>> {
    heap.freeze();

    let mut compiler = Compiler {
        lexer: Lexer::new(source),
        heap,
        module: module.to_string(),
        previous: Token::synthetic(),
        current: Token::synthetic(),
        lookahead: None,
        had_error: false,
        panic_mode: false,
        diagnostics: Vec::new(),
        funcs: vec![FuncState::new(FunctionKind::Script, "<script>")],
        expected: 1,
        prefix_inc: None,
    };

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let result = compiler.finish();
    heap.unfreeze();
    result
}

/// A local variable slot
#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth the local was declared at (for shadowing and scope exit)
    depth: usize,
    /// Whether a closure captured this slot (scope exit emits Close, not Pop)
    captured: bool,
}

/// How an upvalue is sourced when the closure is built
///
/// `is_local` captures a slot of the immediately enclosing function;
/// otherwise the capture chains through the enclosing function's upvalues.
#[derive(Debug, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Loop context for break/continue
#[derive(Debug)]
struct LoopState {
    /// Scope depth at loop entry; break/continue pop locals down to it
    depth: usize,
    /// Bytecode offset of the loop top (continue target)
    start: usize,
    /// Unresolved forward jumps emitted by `break`
    break_jumps: Vec<usize>,
}

/// A call emitted with a multi-value result request that a later operator
/// may still narrow back to one result
struct PendingCall {
    /// Offset of the result-count operand byte
    operand_offset: usize,
    /// Result count currently encoded there
    results: usize,
}

/// Per-function compiler state
struct FuncState {
    chunk: Chunk,
    kind: FunctionKind,
    name: String,
    arity: u8,
    variadic: bool,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: usize,
    loops: Vec<LoopState>,
    /// Net number of values the emitted code leaves on the operand stack
    /// above the declared locals, at the current point
    pushed: isize,
    /// Most recent call whose result count is still adjustable
    last_call: Option<PendingCall>,
    number_constants: HashMap<u64, u16>,
    string_constants: HashMap<ObjRef, u16>,
}

impl FuncState {
    fn new(kind: FunctionKind, name: &str) -> Self {
        // Slot 0 of a script/function holds the running closure; naming it
        // after the function lets it call itself without a global lookup.
        // Methods instead bind their first declared parameter to slot 0.
        let locals = match kind {
            FunctionKind::Method => Vec::new(),
            _ => vec![Local {
                name: name.to_string(),
                depth: 0,
                captured: false,
            }],
        };
        Self {
            chunk: Chunk::new(),
            kind,
            name: name.to_string(),
            arity: 0,
            variadic: false,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            pushed: 0,
            last_call: None,
            number_constants: HashMap::new(),
            string_constants: HashMap::new(),
        }
    }
}

pub(crate) struct Compiler<'h> {
    lexer: Lexer,
    heap: &'h mut Heap,
    module: String,
    previous: Token,
    current: Token,
    /// Single token of lookahead, used only by the table constructor
    lookahead: Option<Token>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    /// Function states, innermost last
    funcs: Vec<FuncState>,
    /// Result-count hint for the next call emitted at expression top level
    expected: usize,
    /// Delta of a pending prefix `++`/`--`, consumed by the target lvalue
    prefix_inc: Option<i8>,
}

impl<'h> Compiler<'h> {
    // === Function state access ===

    fn fs(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("compiler: no function state")
    }

    fn fs_ref(&self) -> &FuncState {
        self.funcs.last().expect("compiler: no function state")
    }

    // === Token plumbing ===

    fn next_real_token(&mut self) -> Token {
        loop {
            let token = self.lexer.scan_token();
            if token.kind != TokenKind::Error {
                return token;
            }
            // The lexer already recorded the diagnostic for this token
            self.had_error = true;
            self.panic_mode = true;
        }
    }

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::synthetic());
        self.current = match self.lookahead.take() {
            Some(token) => token,
            None => self.next_real_token(),
        };
    }

    /// Peek one token past `current` (fills the lookahead buffer)
    fn peek_ahead(&mut self) -> &Token {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.next_real_token());
        }
        self.lookahead.as_ref().expect("lookahead just filled")
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.current.kind == *kind
    }

    fn check_ident(&self) -> bool {
        matches!(self.current.kind, TokenKind::Ident(_))
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(&kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(&kind) {
            self.advance();
        } else {
            self.error_at_current("NV2001", message);
        }
    }

    /// Consume an identifier and return its name ("" after an error)
    fn consume_ident(&mut self, message: &str) -> String {
        if let TokenKind::Ident(name) = &self.current.kind {
            let name = name.clone();
            self.advance();
            name
        } else {
            self.error_at_current("NV2001", message);
            String::new()
        }
    }

    // === Diagnostics ===

    fn error_at(&mut self, at_current: bool, code: &str, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let token = if at_current {
            &self.current
        } else {
            &self.previous
        };
        let label = match &token.kind {
            TokenKind::Eof => "at end of input".to_string(),
            _ => format!("near '{}'", token.lexeme),
        };
        let line = token.line;
        self.diagnostics.push(
            Diagnostic::error(code, message)
                .with_module(self.module.clone())
                .with_line(line)
                .with_snippet(self.lexer.line_snippet(line))
                .with_label(label),
        );
    }

    fn error_at_current(&mut self, code: &str, message: &str) {
        self.error_at(true, code, message);
    }

    fn error_at_previous(&mut self, code: &str, message: &str) {
        self.error_at(false, code, message);
    }

    /// Skip ahead to a statement boundary after a syntax error
    fn synchronize(&mut self) {
        self.panic_mode = false;
        self.fs().pushed = 0;
        self.fs().last_call = None;
        self.prefix_inc = None;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Function
                | TokenKind::Proto
                | TokenKind::Var
                | TokenKind::Local
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Do
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Emission ===

    fn emit_op(&mut self, opcode: Opcode) {
        let line = self.previous.line;
        self.fs().chunk.emit(opcode, line);
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.previous.line;
        self.fs().chunk.emit_u8(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.fs().chunk.emit_u16(value, line);
    }

    /// Emit a forward jump; returns the operand offset for patching
    fn emit_jump(&mut self, opcode: Opcode) -> usize {
        self.emit_op(opcode);
        let offset = self.fs_ref().chunk.current_offset();
        self.emit_u16(0xFFFF);
        offset
    }

    fn patch_jump(&mut self, operand_offset: usize) {
        if self.fs().chunk.patch_jump(operand_offset).is_err() {
            self.error_at_previous("NV2005", "too much code to jump over");
        }
    }

    /// Emit a backward jump to `target`
    fn emit_loop(&mut self, target: usize) {
        match self.fs_ref().chunk.back_jump_distance(target) {
            Ok(distance) => {
                self.emit_op(Opcode::JmpBack);
                self.emit_u16(distance);
            }
            Err(()) => {
                self.error_at_previous("NV2005", "loop body too large");
                self.emit_op(Opcode::JmpBack);
                self.emit_u16(0);
            }
        }
    }

    /// Add a constant, opportunistically de-duplicating numbers and strings
    fn make_constant(&mut self, value: Value) -> u16 {
        match value {
            Value::Number(n) => {
                if let Some(&index) = self.fs_ref().number_constants.get(&n.to_bits()) {
                    return index;
                }
            }
            Value::Obj(r) => {
                if matches!(self.heap.get(r), Obj::Str(_)) {
                    if let Some(&index) = self.fs_ref().string_constants.get(&r) {
                        return index;
                    }
                }
            }
            _ => {}
        }
        match self.fs().chunk.add_constant(value) {
            Some(index) => {
                match value {
                    Value::Number(n) => {
                        self.fs().number_constants.insert(n.to_bits(), index);
                    }
                    Value::Obj(r) => {
                        if matches!(self.heap.get(r), Obj::Str(_)) {
                            self.fs().string_constants.insert(r, index);
                        }
                    }
                    _ => {}
                }
                index
            }
            None => {
                self.error_at_previous("NV2004", "too many constants in one chunk");
                0
            }
        }
    }

    /// Intern an identifier and add it to the constant pool
    fn identifier_constant(&mut self, name: &str) -> u16 {
        let r = self.heap.intern(name);
        self.make_constant(Value::Obj(r))
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(Opcode::LoadConst);
        self.emit_u16(index);
        self.fs().pushed += 1;
    }

    // === Scopes and locals ===

    fn begin_scope(&mut self) {
        self.fs().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fs().scope_depth -= 1;
        let depth = self.fs_ref().scope_depth;
        let mut pending = 0usize;
        loop {
            let captured = match self.fs_ref().locals.last() {
                Some(local) if local.depth > depth => local.captured,
                _ => break,
            };
            self.fs().locals.pop();
            if captured {
                self.flush_pops(&mut pending);
                self.emit_op(Opcode::Close);
            } else {
                pending += 1;
            }
        }
        self.flush_pops(&mut pending);
    }

    /// Emit the pops/closes a jump out of nested scopes needs, without
    /// forgetting the locals (compilation continues in the same scope)
    fn discard_locals_above(&mut self, depth: usize) {
        let mut pending = 0usize;
        let mut index = self.fs_ref().locals.len();
        loop {
            let captured = match index.checked_sub(1).map(|i| &self.fs_ref().locals[i]) {
                Some(local) if local.depth > depth => local.captured,
                _ => break,
            };
            index -= 1;
            if captured {
                self.flush_pops(&mut pending);
                self.emit_op(Opcode::Close);
            } else {
                pending += 1;
            }
        }
        self.flush_pops(&mut pending);
    }

    fn flush_pops(&mut self, pending: &mut usize) {
        while *pending > 0 {
            let n = (*pending).min(255);
            self.emit_op(Opcode::Pop);
            self.emit_u8(n as u8);
            *pending -= n;
        }
    }

    /// Register the value on top of the stack as a named local
    fn bind_local(&mut self, name: &str) {
        if self.fs_ref().locals.len() >= MAX_LOCALS {
            self.error_at_previous("NV2002", "too many local variables in function");
        }
        let depth = self.fs_ref().scope_depth;
        self.fs().locals.push(Local {
            name: name.to_string(),
            depth,
            captured: false,
        });
        self.fs().pushed -= 1;
    }

    /// Register a local whose value arrives from the calling convention
    /// (parameters) rather than from emitted code
    fn bind_parameter(&mut self, name: &str) {
        if self.fs_ref().locals.len() >= MAX_LOCALS {
            self.error_at_previous("NV2002", "too many local variables in function");
        }
        let depth = self.fs_ref().scope_depth;
        self.fs().locals.push(Local {
            name: name.to_string(),
            depth,
            captured: false,
        });
    }

    /// Whether declarations here define globals rather than locals
    fn at_top_level(&self) -> bool {
        self.funcs.len() == 1 && self.fs_ref().scope_depth == 0
    }

    // === Name resolution ===

    fn resolve_local(&self, func: usize, name: &str) -> Option<u8> {
        self.funcs[func]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, _)| slot as u8)
    }

    fn resolve_upvalue(&mut self, func: usize, name: &str) -> Option<u8> {
        if func == 0 {
            return None;
        }
        if let Some(slot) = self.resolve_local(func - 1, name) {
            self.funcs[func - 1].locals[slot as usize].captured = true;
            return Some(self.add_upvalue(func, slot, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(func - 1, name) {
            return Some(self.add_upvalue(func, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, func: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.funcs[func].upvalues.iter().position(|u| *u == desc) {
            return existing as u8;
        }
        if self.funcs[func].upvalues.len() >= MAX_UPVALUES {
            self.error_at_previous("NV2003", "too many captured variables in function");
            return 0;
        }
        self.funcs[func].upvalues.push(desc);
        (self.funcs[func].upvalues.len() - 1) as u8
    }

    // === Statement balance ===

    /// Narrow a still-adjustable call back to one result; called when an
    /// operator consumes the call's value mid-expression
    fn settle_last_call(&mut self) {
        if let Some(pending) = self.fs().last_call.take() {
            if pending.results != 1 {
                let fs = self.fs();
                fs.chunk.code[pending.operand_offset] = 1;
                fs.pushed += 1 - pending.results as isize;
            }
        }
    }

    /// Restore the declared stack balance at a statement boundary
    fn align_stack(&mut self) {
        let excess = self.fs_ref().pushed;
        if excess > 0 {
            let mut pending = excess as usize;
            self.flush_pops(&mut pending);
        } else if excess < 0 {
            self.error_at_previous("NV2009", "internal error: expression stack imbalance");
        }
        self.fs().pushed = 0;
    }

    // === Finish ===

    /// Close the script function and hand back the result
    fn finish(&mut self) -> Result<ObjRef, Vec<Diagnostic>> {
        self.emit_op(Opcode::Return);
        self.emit_u8(0);

        let mut diagnostics = std::mem::take(&mut self.diagnostics);
        diagnostics.extend(self.lexer.take_diagnostics());
        for diag in diagnostics.iter_mut() {
            if diag.module == "<unknown>" {
                diag.module = self.module.clone();
            }
        }
        if self.had_error || !diagnostics.is_empty() {
            sort_diagnostics(&mut diagnostics);
            return Err(diagnostics);
        }

        let fs = self.funcs.pop().expect("compiler: no function state");
        Ok(self.heap.alloc(Obj::Function(ObjFunction {
            chunk: fs.chunk,
            arity: fs.arity,
            variadic: fs.variadic,
            upvalue_count: fs.upvalues.len() as u8,
            kind: fs.kind,
            name: fs.name,
            module: self.module.clone(),
        })))
    }
}
