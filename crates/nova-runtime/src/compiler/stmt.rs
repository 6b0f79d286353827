//! Statement compilation
//!
//! Statements are stack-neutral: whatever an expression pushes is consumed
//! by bindings or popped by `align_stack` before the next statement starts.

use super::{Compiler, FuncState, LoopState, MAX_ARGS};
use crate::bytecode::Opcode;
use crate::object::{FunctionKind, Obj, ObjFunction};
use crate::token::TokenKind;
use crate::value::Value;

impl<'h> Compiler<'h> {
    pub(super) fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) || self.match_token(TokenKind::Local) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Function) {
            self.function_declaration();
        } else if self.match_token(TokenKind::Proto) {
            self.proto_declaration();
        } else {
            self.statement();
        }
        self.match_token(TokenKind::Semicolon);

        if self.panic_mode {
            self.synchronize();
        }
        self.align_stack();
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Do) {
            self.begin_scope();
            self.block(&[TokenKind::End]);
            self.consume(TokenKind::End, "expected 'end' to close 'do' block");
            self.end_scope();
        } else if self.check(&TokenKind::Semicolon) {
            // Empty statement; the trailing match in declaration() eats it
        } else {
            self.expression_statement();
        }
    }

    /// Compile declarations until one of `enders` (or EOF) is next
    fn block(&mut self, enders: &[TokenKind]) {
        while !self.check(&TokenKind::Eof) && !enders.iter().any(|k| self.check(k)) {
            self.declaration();
        }
    }

    fn expression_statement(&mut self) {
        self.expression_expecting(0);
    }

    // === Declarations ===

    /// `var a, b = e1, e2`: the value list is distributed over the
    /// declared names, padding with nil and popping excess
    fn var_declaration(&mut self) {
        let mut names = Vec::new();
        loop {
            names.push(self.consume_ident("expected variable name"));
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }

        let mut provided = 0usize;
        if self.match_token(TokenKind::Equal) {
            loop {
                let remaining = names.len().saturating_sub(provided).max(1);
                let produced = self.expression_list_item(remaining);
                if self.match_token(TokenKind::Comma) {
                    // Not the last expression after all: one value only
                    self.settle_last_call();
                    provided += 1;
                } else {
                    self.fs().last_call = None;
                    provided += produced;
                    break;
                }
            }
        }

        if provided < names.len() {
            for _ in 0..names.len() - provided {
                self.emit_op(Opcode::Nil);
                self.fs().pushed += 1;
            }
        } else if provided > names.len() {
            let mut pending = provided - names.len();
            self.fs().pushed -= pending as isize;
            self.flush_pops(&mut pending);
        }

        if self.at_top_level() {
            // Top-of-stack pairs with the last name
            for name in names.iter().rev() {
                let name_index = self.identifier_constant(name);
                self.emit_op(Opcode::SetGlobal);
                self.emit_u16(name_index);
                self.emit_op(Opcode::Pop);
                self.emit_u8(1);
                self.fs().pushed -= 1;
            }
        } else {
            for name in &names {
                self.bind_local(name);
            }
        }
    }

    fn function_declaration(&mut self) {
        let name = self.consume_ident("expected function name");
        if self.at_top_level() {
            self.function_body(FunctionKind::Function, &name);
            let name_index = self.identifier_constant(&name);
            self.emit_op(Opcode::SetGlobal);
            self.emit_u16(name_index);
            self.emit_op(Opcode::Pop);
            self.emit_u8(1);
            self.fs().pushed -= 1;
        } else {
            // Bind the name first so the body can call itself through the
            // local slot the closure is about to land in
            self.bind_parameter(&name);
            self.function_body(FunctionKind::Function, &name);
            self.fs().pushed -= 1;
        }
    }

    /// `proto Name ... end`: nested function definitions populate an
    /// Object that becomes the prototype (and constructor, via `__init`)
    fn proto_declaration(&mut self) {
        let name = self.consume_ident("expected prototype name");
        let mut methods = 0usize;
        while !self.check(&TokenKind::End) && !self.check(&TokenKind::Eof) {
            if self.match_token(TokenKind::Function) {
                let method_name = self.consume_ident("expected method name");
                let name_index = self.identifier_constant(&method_name);
                self.emit_op(Opcode::LoadConst);
                self.emit_u16(name_index);
                self.fs().pushed += 1;
                self.function_body(FunctionKind::Method, &method_name);
                methods += 1;
            } else if self.match_token(TokenKind::Semicolon) {
                // Stray separators between methods are harmless
            } else {
                self.error_at_current("NV2001", "expected method definition in proto body");
                break;
            }
        }
        self.consume(TokenKind::End, "expected 'end' to close proto");
        self.emit_op(Opcode::NewObject);
        self.emit_u16(methods.min(u16::MAX as usize) as u16);
        self.fs().pushed -= 2 * methods as isize;
        self.fs().pushed += 1;

        if self.at_top_level() {
            let name_index = self.identifier_constant(&name);
            self.emit_op(Opcode::SetGlobal);
            self.emit_u16(name_index);
            self.emit_op(Opcode::Pop);
            self.emit_u8(1);
            self.fs().pushed -= 1;
        } else {
            self.bind_local(&name);
        }
    }

    /// Compile a function from the parameter list through `end`, then emit
    /// the Closure instruction (with capture directives) in the enclosing
    /// function
    pub(super) fn function_body(&mut self, kind: FunctionKind, name: &str) {
        let saved_expected = std::mem::replace(&mut self.expected, 1);
        let saved_prefix = self.prefix_inc.take();

        self.funcs.push(FuncState::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' before parameters");
        if !self.check(&TokenKind::RightParen) {
            loop {
                if self.match_token(TokenKind::Ellipsis) {
                    let param = self.consume_ident("expected parameter name after '...'");
                    self.bind_parameter(&param);
                    self.fs().variadic = true;
                    self.bump_arity();
                    if self.match_token(TokenKind::Comma) {
                        self.error_at_previous(
                            "NV2001",
                            "variadic parameter must be the last parameter",
                        );
                    }
                    break;
                }
                let param = self.consume_ident("expected parameter name");
                self.bind_parameter(&param);
                self.bump_arity();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");

        self.block(&[TokenKind::End]);
        self.consume(TokenKind::End, "expected 'end' to close function");
        self.emit_op(Opcode::Return);
        self.emit_u8(0);

        let fs = self.funcs.pop().expect("compiler: no function state");
        let function = self.heap.alloc(Obj::Function(ObjFunction {
            chunk: fs.chunk,
            arity: fs.arity,
            variadic: fs.variadic,
            upvalue_count: fs.upvalues.len() as u8,
            kind: fs.kind,
            name: fs.name,
            module: self.module.clone(),
        }));

        let index = self.make_constant(Value::Obj(function));
        self.emit_op(Opcode::Closure);
        self.emit_u16(index);
        for upvalue in &fs.upvalues {
            let tag = if upvalue.is_local {
                Opcode::GetLocal as u8
            } else {
                Opcode::GetUpval as u8
            };
            let slot = upvalue.index;
            self.emit_u8(tag);
            self.emit_u8(slot);
        }
        self.fs().pushed += 1;

        self.expected = saved_expected;
        self.prefix_inc = saved_prefix;
    }

    fn bump_arity(&mut self) {
        if self.fs_ref().arity as usize >= MAX_ARGS {
            self.error_at_previous("NV2008", "too many parameters");
        } else {
            self.fs().arity += 1;
        }
    }

    // === Control flow ===

    fn if_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Then, "expected 'then' after condition");
        let mut branch_jump = self.emit_jump(Opcode::PeJmp);
        self.fs().pushed -= 1;
        let mut end_jumps = Vec::new();

        self.begin_scope();
        self.block(&[TokenKind::Else, TokenKind::Elseif, TokenKind::End]);
        self.end_scope();

        while self.match_token(TokenKind::Elseif) {
            end_jumps.push(self.emit_jump(Opcode::Jmp));
            self.patch_jump(branch_jump);
            self.expression();
            self.consume(TokenKind::Then, "expected 'then' after condition");
            branch_jump = self.emit_jump(Opcode::PeJmp);
            self.fs().pushed -= 1;
            self.begin_scope();
            self.block(&[TokenKind::Else, TokenKind::Elseif, TokenKind::End]);
            self.end_scope();
        }

        if self.match_token(TokenKind::Else) {
            end_jumps.push(self.emit_jump(Opcode::Jmp));
            self.patch_jump(branch_jump);
            self.begin_scope();
            self.block(&[TokenKind::End]);
            self.end_scope();
        } else {
            self.patch_jump(branch_jump);
        }
        self.consume(TokenKind::End, "expected 'end' to close 'if'");

        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.fs_ref().chunk.current_offset();
        self.expression();
        self.consume(TokenKind::Do, "expected 'do' after condition");
        let exit_jump = self.emit_jump(Opcode::PeJmp);
        self.fs().pushed -= 1;

        let depth = self.fs_ref().scope_depth;
        self.fs().loops.push(LoopState {
            depth,
            start: loop_start,
            break_jumps: Vec::new(),
        });

        self.begin_scope();
        self.block(&[TokenKind::End]);
        self.consume(TokenKind::End, "expected 'end' to close 'while'");
        self.end_scope();

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.finish_loop();
    }

    fn for_statement(&mut self) {
        if self.check(&TokenKind::LeftParen) {
            self.c_style_for();
        } else {
            self.for_in();
        }
    }

    /// `for ( init ; cond ; step ) do body end`
    fn c_style_for(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");
        self.begin_scope();

        if self.match_token(TokenKind::Semicolon) {
            // No initializer
        } else if self.match_token(TokenKind::Var) || self.match_token(TokenKind::Local) {
            self.var_declaration();
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
        } else {
            self.expression_statement();
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
        }

        let mut loop_start = self.fs_ref().chunk.current_offset();
        let exit_jump = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            self.expression();
            let jump = self.emit_jump(Opcode::PeJmp);
            self.fs().pushed -= 1;
            Some(jump)
        };
        self.consume(TokenKind::Semicolon, "expected ';' after loop condition");

        if !self.check(&TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jmp);
            let step_start = self.fs_ref().chunk.current_offset();
            self.expression_statement();
            self.emit_loop(loop_start);
            self.patch_jump(body_jump);
            loop_start = step_start;
        }
        self.consume(TokenKind::RightParen, "expected ')' after loop clauses");
        self.consume(TokenKind::Do, "expected 'do' before loop body");

        let depth = self.fs_ref().scope_depth;
        self.fs().loops.push(LoopState {
            depth,
            start: loop_start,
            break_jumps: Vec::new(),
        });

        self.begin_scope();
        self.block(&[TokenKind::End]);
        self.consume(TokenKind::End, "expected 'end' to close 'for'");
        self.end_scope();

        self.emit_loop(loop_start);
        if let Some(jump) = exit_jump {
            self.patch_jump(jump);
        }
        self.finish_loop();
        self.end_scope();
    }

    /// `for v [, k ...] in e do body end`: iterator protocol
    fn for_in(&mut self) {
        let mut names = Vec::new();
        loop {
            names.push(self.consume_ident("expected loop variable name"));
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::In, "expected 'in' after loop variables");
        self.expression();
        self.consume(TokenKind::Do, "expected 'do' before loop body");
        self.emit_op(Opcode::Iter);

        self.begin_scope();
        // The iterator occupies a hidden slot for the whole loop; the
        // parenthesized name cannot collide with a source identifier
        self.bind_local("(iter)");

        let loop_start = self.fs_ref().chunk.current_offset();
        let depth = self.fs_ref().scope_depth;
        self.fs().loops.push(LoopState {
            depth,
            start: loop_start,
            break_jumps: Vec::new(),
        });

        self.emit_op(Opcode::Next);
        self.emit_u8(names.len().min(MAX_ARGS) as u8);
        let exit_operand = self.fs_ref().chunk.current_offset();
        self.emit_u16(0xFFFF);
        self.fs().pushed += names.len() as isize;

        self.begin_scope();
        for name in &names {
            self.bind_local(name);
        }
        self.block(&[TokenKind::End]);
        self.consume(TokenKind::End, "expected 'end' to close 'for'");
        self.end_scope();

        self.emit_loop(loop_start);
        self.patch_jump(exit_operand);
        self.finish_loop();
        self.end_scope();
    }

    /// Patch pending breaks and drop the loop state
    fn finish_loop(&mut self) {
        let loop_state = self.fs().loops.pop().expect("compiler: no loop state");
        for jump in loop_state.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        let Some(depth) = self.fs_ref().loops.last().map(|l| l.depth) else {
            self.error_at_previous("NV2007", "'break' outside of a loop");
            return;
        };
        self.discard_locals_above(depth);
        let jump = self.emit_jump(Opcode::Jmp);
        self.fs()
            .loops
            .last_mut()
            .expect("compiler: no loop state")
            .break_jumps
            .push(jump);
    }

    fn continue_statement(&mut self) {
        let Some((depth, start)) = self.fs_ref().loops.last().map(|l| (l.depth, l.start)) else {
            self.error_at_previous("NV2007", "'continue' outside of a loop");
            return;
        };
        self.discard_locals_above(depth);
        self.emit_loop(start);
    }

    fn return_statement(&mut self) {
        if self.check(&TokenKind::Semicolon)
            || self.check(&TokenKind::End)
            || self.check(&TokenKind::Else)
            || self.check(&TokenKind::Elseif)
            || self.check(&TokenKind::Eof)
        {
            self.emit_op(Opcode::Return);
            self.emit_u8(0);
            return;
        }

        let mut count = 0usize;
        loop {
            self.expression();
            count += 1;
            if count > MAX_ARGS {
                self.error_at_previous("NV2008", "too many return values");
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.emit_op(Opcode::Return);
        self.emit_u8(count.min(MAX_ARGS) as u8);
        self.fs().pushed -= count as isize;
    }
}
