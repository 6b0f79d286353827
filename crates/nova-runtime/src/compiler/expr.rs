//! Expression compilation (Pratt precedence climbing)
//!
//! Precedence, low to high: assignment, concat (`..`), or, and, equality,
//! comparison, term, factor, unary, call/index/dot, primary. Assignments
//! and the increment forms are handled inside the lvalue parselets
//! (identifier, `.field`, `[index]`), which see their target while it is
//! still addressable.

use super::{Compiler, PendingCall, MAX_ARGS};
use crate::bytecode::Opcode;
use crate::object::FunctionKind;
use crate::token::TokenKind;
use crate::value::Value;

/// Operator precedence, low to high
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum Prec {
    None,
    Assignment,
    Concat,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assignment,
            Prec::Assignment => Prec::Concat,
            Prec::Concat => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call => Prec::Call,
        }
    }
}

/// Infix precedence of a token, `Prec::None` when it cannot continue an
/// expression
fn infix_prec(kind: &TokenKind) -> Prec {
    match kind {
        TokenKind::DotDot => Prec::Concat,
        TokenKind::Or => Prec::Or,
        TokenKind::And => Prec::And,
        TokenKind::EqualEqual | TokenKind::BangEqual => Prec::Equality,
        TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
            Prec::Comparison
        }
        TokenKind::Plus | TokenKind::Minus => Prec::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Prec::Factor,
        TokenKind::LeftParen | TokenKind::Dot | TokenKind::Colon | TokenKind::LeftBracket => {
            Prec::Call
        }
        _ => Prec::None,
    }
}

/// Where a name resolves, and therefore which opcode family touches it
enum VarTarget {
    Local(u8),
    Upvalue(u8),
    Global(u16),
}

impl<'h> Compiler<'h> {
    /// Compile an expression producing exactly one value
    pub(super) fn expression(&mut self) {
        self.expression_expecting(1);
    }

    /// Compile an expression producing exactly `n` values
    ///
    /// A trailing call requests `n` results; anything else pushes one value
    /// and is padded with nils (or popped down, for `n == 0`).
    pub(super) fn expression_expecting(&mut self, n: usize) {
        let produced = self.expression_list_item(n);
        self.fs().last_call = None;
        self.adjust_to(produced, n);
    }

    /// Compile one expression of a value list with a result-count hint,
    /// without padding; returns how many values it left
    ///
    /// The trailing-call patch stays pending so that a caller that finds a
    /// comma can settle it back to one result.
    pub(super) fn expression_list_item(&mut self, hint: usize) -> usize {
        let saved = std::mem::replace(&mut self.expected, hint);
        let before = self.fs_ref().pushed;
        self.parse_precedence(Prec::Assignment);
        self.expected = saved;
        (self.fs_ref().pushed - before).max(0) as usize
    }

    /// Pad with nils or pop down so `produced` values become `target`
    fn adjust_to(&mut self, produced: usize, target: usize) {
        if produced < target {
            for _ in 0..target - produced {
                self.emit_op(Opcode::Nil);
                self.fs().pushed += 1;
            }
        } else if produced > target {
            let mut pending = produced - target;
            self.fs().pushed -= pending as isize;
            self.flush_pops(&mut pending);
        }
    }

    /// Compile an operand sub-expression: always a single value
    fn parse_operand(&mut self, prec: Prec) {
        let saved = std::mem::replace(&mut self.expected, 1);
        self.parse_precedence(prec);
        self.expected = saved;
    }

    pub(super) fn parse_precedence(&mut self, prec: Prec) {
        self.advance();
        let can_assign = prec <= Prec::Assignment;
        self.prefix_rule(can_assign);

        while prec <= infix_prec(&self.current.kind) {
            // The value on the stack is about to feed an operator: a call
            // that requested several results narrows back to one.
            self.settle_last_call();
            self.advance();
            self.infix_rule(can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error_at_previous("NV2006", "invalid assignment target");
        }
    }

    fn prefix_rule(&mut self, can_assign: bool) {
        match self.previous.kind.clone() {
            TokenKind::Number(n) => self.emit_constant(Value::Number(n)),
            TokenKind::String(text) => {
                let r = self.heap.intern(&text);
                self.emit_constant(Value::Obj(r));
            }
            TokenKind::Ident(name) => self.named_variable(&name, can_assign),
            TokenKind::True => {
                self.emit_op(Opcode::True);
                self.fs().pushed += 1;
            }
            TokenKind::False => {
                self.emit_op(Opcode::False);
                self.fs().pushed += 1;
            }
            TokenKind::Nil => {
                self.emit_op(Opcode::Nil);
                self.fs().pushed += 1;
            }
            TokenKind::LeftParen => {
                self.expression();
                self.consume(TokenKind::RightParen, "expected ')' after expression");
            }
            TokenKind::Minus => {
                self.parse_operand(Prec::Unary);
                self.emit_op(Opcode::Negate);
            }
            TokenKind::Bang | TokenKind::Not => {
                self.parse_operand(Prec::Unary);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Hash => {
                self.parse_operand(Prec::Unary);
                self.emit_op(Opcode::Count);
            }
            TokenKind::PlusPlus => self.prefix_increment(1),
            TokenKind::MinusMinus => self.prefix_increment(-1),
            TokenKind::Function => self.function_body(FunctionKind::Function, "<anonymous>"),
            TokenKind::LeftBrace => self.table_constructor(),
            _ => self.error_at_previous("NV2001", "expected expression"),
        }
    }

    fn infix_rule(&mut self, can_assign: bool) {
        match self.previous.kind.clone() {
            TokenKind::Plus => self.binary(Prec::Term, Opcode::Add),
            TokenKind::Minus => self.binary(Prec::Term, Opcode::Sub),
            TokenKind::Star => self.binary(Prec::Factor, Opcode::Mult),
            TokenKind::Slash => self.binary(Prec::Factor, Opcode::Div),
            TokenKind::Percent => self.binary(Prec::Factor, Opcode::Mod),
            TokenKind::EqualEqual => self.binary(Prec::Equality, Opcode::Equal),
            TokenKind::BangEqual => {
                self.binary(Prec::Equality, Opcode::Equal);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Greater => self.binary(Prec::Comparison, Opcode::Greater),
            TokenKind::GreaterEqual => self.binary(Prec::Comparison, Opcode::GreaterEqual),
            TokenKind::Less => self.binary(Prec::Comparison, Opcode::Less),
            TokenKind::LessEqual => self.binary(Prec::Comparison, Opcode::LessEqual),
            TokenKind::DotDot => self.concat(),
            TokenKind::And => self.and_operator(),
            TokenKind::Or => self.or_operator(),
            TokenKind::LeftParen => self.call_expression(),
            TokenKind::Dot => self.dot_expression(can_assign),
            TokenKind::Colon => self.invoke_expression(),
            TokenKind::LeftBracket => self.index_expression(can_assign),
            _ => self.error_at_previous("NV2001", "unexpected operator"),
        }
    }

    fn binary(&mut self, prec: Prec, opcode: Opcode) {
        self.parse_operand(prec.next());
        self.settle_last_call();
        self.emit_op(opcode);
        self.fs().pushed -= 1;
    }

    /// Gather a whole `a .. b .. c` chain into one Concat
    fn concat(&mut self) {
        let mut count: usize = 2;
        self.parse_operand(Prec::Concat.next());
        while self.match_token(TokenKind::DotDot) {
            self.settle_last_call();
            if count >= MAX_ARGS {
                self.error_at_previous("NV2008", "too many operands to '..'");
            }
            self.parse_operand(Prec::Concat.next());
            count += 1;
        }
        self.settle_last_call();
        self.emit_op(Opcode::Concat);
        self.emit_u8(count.min(MAX_ARGS) as u8);
        self.fs().pushed -= count as isize - 1;
    }

    /// Short-circuit `and`: keep the left value when falsy
    fn and_operator(&mut self) {
        let end = self.emit_jump(Opcode::EJmp);
        self.emit_op(Opcode::Pop);
        self.emit_u8(1);
        self.fs().pushed -= 1;
        self.parse_operand(Prec::And.next());
        self.settle_last_call();
        self.patch_jump(end);
    }

    /// Short-circuit `or`: keep the left value when truthy
    fn or_operator(&mut self) {
        let rhs = self.emit_jump(Opcode::EJmp);
        let end = self.emit_jump(Opcode::Jmp);
        self.patch_jump(rhs);
        self.emit_op(Opcode::Pop);
        self.emit_u8(1);
        self.fs().pushed -= 1;
        self.parse_operand(Prec::Or.next());
        self.settle_last_call();
        self.patch_jump(end);
    }

    // === Variables and lvalues ===

    fn resolve_variable(&mut self, name: &str) -> VarTarget {
        let top = self.funcs.len() - 1;
        if let Some(slot) = self.resolve_local(top, name) {
            VarTarget::Local(slot)
        } else if let Some(upvalue) = self.resolve_upvalue(top, name) {
            VarTarget::Upvalue(upvalue)
        } else {
            VarTarget::Global(self.identifier_constant(name))
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let target = self.resolve_variable(name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.settle_last_call();
            match target {
                VarTarget::Local(slot) => {
                    self.emit_op(Opcode::SetLocal);
                    self.emit_u8(slot);
                }
                VarTarget::Upvalue(upvalue) => {
                    self.emit_op(Opcode::SetUpval);
                    self.emit_u8(upvalue);
                }
                VarTarget::Global(name_index) => {
                    self.emit_op(Opcode::SetGlobal);
                    self.emit_u16(name_index);
                }
            }
        } else if let Some(delta) = self.increment_delta() {
            self.emit_variable_increment(&target, delta.0, delta.1);
        } else {
            match target {
                VarTarget::Local(slot) => {
                    self.emit_op(Opcode::GetLocal);
                    self.emit_u8(slot);
                }
                VarTarget::Upvalue(upvalue) => {
                    self.emit_op(Opcode::GetUpval);
                    self.emit_u8(upvalue);
                }
                VarTarget::Global(name_index) => {
                    self.emit_op(Opcode::GetGlobal);
                    self.emit_u16(name_index);
                }
            }
            self.fs().pushed += 1;
        }
    }

    /// Detect an increment applying to the lvalue just parsed
    ///
    /// Returns `(delta, is_postfix)`: a following `++`/`--` token is a
    /// postfix form; a pending prefix delta applies when no further
    /// call/index/dot can extend the target.
    fn increment_delta(&mut self) -> Option<(i8, bool)> {
        if self.match_token(TokenKind::PlusPlus) {
            return Some((1, true));
        }
        if self.match_token(TokenKind::MinusMinus) {
            return Some((-1, true));
        }
        if self.prefix_inc.is_some() && infix_prec(&self.current.kind) != Prec::Call {
            return self.prefix_inc.take().map(|delta| (delta, false));
        }
        None
    }

    fn emit_variable_increment(&mut self, target: &VarTarget, delta: i8, postfix: bool) {
        let biased = (128 + delta as i16) as u8;
        match target {
            VarTarget::Local(slot) => {
                self.emit_op(Opcode::IncLocal);
                self.emit_u8(biased);
                self.emit_u8(*slot);
            }
            VarTarget::Upvalue(upvalue) => {
                self.emit_op(Opcode::IncUpval);
                self.emit_u8(biased);
                self.emit_u8(*upvalue);
            }
            VarTarget::Global(name_index) => {
                let index = *name_index;
                self.emit_op(Opcode::IncGlobal);
                self.emit_u8(biased);
                self.emit_u16(index);
            }
        }
        self.fs().pushed += 1;
        if postfix {
            self.emit_undo_increment(delta);
        }
    }

    /// Recover the pre-increment value a postfix form produces
    fn emit_undo_increment(&mut self, delta: i8) {
        self.emit_constant(Value::Number(-delta as f64));
        self.emit_op(Opcode::Add);
        self.fs().pushed -= 1;
    }

    fn prefix_increment(&mut self, delta: i8) {
        self.prefix_inc = Some(delta);
        self.parse_operand(Prec::Call);
        if self.prefix_inc.take().is_some() {
            self.error_at_previous("NV2006", "invalid increment target");
        }
    }

    // === Calls ===

    fn argument_list(&mut self) -> usize {
        let mut argc = 0usize;
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression();
                argc += 1;
                if argc > MAX_ARGS {
                    self.error_at_previous("NV2008", "too many arguments");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        argc.min(MAX_ARGS)
    }

    fn call_expression(&mut self) {
        let argc = self.argument_list();
        let results = self.expected.min(MAX_ARGS);
        self.emit_op(Opcode::Call);
        self.emit_u8(argc as u8);
        let operand_offset = self.fs_ref().chunk.current_offset();
        self.emit_u8(results as u8);
        self.fs().pushed += results as isize - 1 - argc as isize;
        self.fs().last_call = Some(PendingCall {
            operand_offset,
            results,
        });
    }

    /// Method call `target:name(args)`: looks the name up on the receiver
    /// and calls with the receiver bound to slot 0
    fn invoke_expression(&mut self) {
        let name = self.consume_ident("expected method name after ':'");
        let name_index = self.identifier_constant(&name);
        self.emit_op(Opcode::LoadConst);
        self.emit_u16(name_index);
        self.fs().pushed += 1;
        self.consume(TokenKind::LeftParen, "expected '(' after method name");
        let argc = self.argument_list();
        let results = self.expected.min(MAX_ARGS);
        self.emit_op(Opcode::Invoke);
        self.emit_u8(argc as u8);
        let operand_offset = self.fs_ref().chunk.current_offset();
        self.emit_u8(results as u8);
        self.fs().pushed += results as isize - 2 - argc as isize;
        self.fs().last_call = Some(PendingCall {
            operand_offset,
            results,
        });
    }

    fn dot_expression(&mut self, can_assign: bool) {
        let name = self.consume_ident("expected field name after '.'");
        let name_index = self.identifier_constant(&name);
        if can_assign && self.match_token(TokenKind::Equal) {
            // SetObject takes the name from the stack, between target and value
            self.emit_op(Opcode::LoadConst);
            self.emit_u16(name_index);
            self.fs().pushed += 1;
            self.expression();
            self.settle_last_call();
            self.emit_op(Opcode::SetObject);
            self.fs().pushed -= 2;
        } else if let Some((delta, postfix)) = self.increment_delta() {
            let biased = (128 + delta as i16) as u8;
            self.emit_op(Opcode::IncObject);
            self.emit_u8(biased);
            self.emit_u16(name_index);
            if postfix {
                self.emit_undo_increment(delta);
            }
        } else {
            self.emit_op(Opcode::GetObject);
            self.emit_u16(name_index);
        }
    }

    fn index_expression(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "expected ']' after index");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.settle_last_call();
            self.emit_op(Opcode::NewIndex);
            self.fs().pushed -= 2;
        } else if let Some((delta, postfix)) = self.increment_delta() {
            let biased = (128 + delta as i16) as u8;
            self.emit_op(Opcode::IncIndex);
            self.emit_u8(biased);
            self.fs().pushed -= 1;
            if postfix {
                self.emit_undo_increment(delta);
            }
        } else {
            self.emit_op(Opcode::Index);
            self.fs().pushed -= 1;
        }
    }

    // === Table constructor ===

    /// `{ e, name = e, [e] = e, ... }`: positional entries take integer
    /// keys counting from 0
    fn table_constructor(&mut self) {
        let mut pairs = 0usize;
        let mut auto_index = 0.0f64;
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if self.match_token(TokenKind::LeftBracket) {
                self.expression();
                self.consume(TokenKind::RightBracket, "expected ']' after table key");
                self.consume(TokenKind::Equal, "expected '=' after table key");
                self.expression();
            } else if self.check_ident() && self.peek_ahead().kind == TokenKind::Equal {
                let name = self.consume_ident("expected field name");
                self.advance(); // =
                let r = self.heap.intern(&name);
                self.emit_constant(Value::Obj(r));
                self.expression();
            } else {
                self.emit_constant(Value::Number(auto_index));
                auto_index += 1.0;
                self.expression();
            }
            pairs += 1;
            if pairs > u16::MAX as usize {
                self.error_at_previous("NV2008", "too many entries in table constructor");
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after table entries");
        self.emit_op(Opcode::NewDict);
        self.emit_u16(pairs.min(u16::MAX as usize) as u16);
        self.fs().pushed -= 2 * pairs as isize;
        self.fs().pushed += 1;
    }
}
