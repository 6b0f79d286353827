//! Bytecode disassembler
//!
//! Converts a chunk back to a human-readable listing. Used by tests and by
//! `nova --disasm`.

use super::{Chunk, Opcode};
use crate::heap::Heap;
use crate::object::Obj;
use crate::value::{format_number, Value};
use std::fmt::Write;

/// Disassemble a chunk to a human-readable listing
///
/// # Format
/// ```text
/// === main ===
/// 0000    1  LoadConst 0        ; 42
/// 0003    |  Call 1 1
/// 0006    2  Return 0
/// ```
pub fn disassemble(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut output = String::new();
    writeln!(output, "=== {} ===", name).unwrap();

    let mut offset = 0;
    let mut last_line = 0;
    while offset < chunk.code.len() {
        let line = chunk.line_at(offset);
        let line_col = if line == last_line {
            "   |".to_string()
        } else {
            format!("{:>4}", line)
        };
        last_line = line;
        let text = disassemble_instruction(chunk, heap, &mut offset);
        writeln!(output, "{} {}", line_col, text).unwrap();
    }

    output
}

/// Disassemble one instruction, advancing `offset` past it
fn disassemble_instruction(chunk: &Chunk, heap: &Heap, offset: &mut usize) -> String {
    let start = *offset;
    let byte = chunk.code[*offset];
    *offset += 1;

    let opcode = match Opcode::try_from(byte) {
        Ok(op) => op,
        Err(_) => return format!("{:04}  <invalid opcode {:#04x}>", start, byte),
    };

    match opcode {
        // No operands
        Opcode::Nil
        | Opcode::True
        | Opcode::False
        | Opcode::Negate
        | Opcode::Not
        | Opcode::Count
        | Opcode::Add
        | Opcode::Sub
        | Opcode::Mult
        | Opcode::Div
        | Opcode::Mod
        | Opcode::Equal
        | Opcode::Greater
        | Opcode::Less
        | Opcode::GreaterEqual
        | Opcode::LessEqual
        | Opcode::SetObject
        | Opcode::Index
        | Opcode::NewIndex
        | Opcode::Close
        | Opcode::Iter => format!("{:04}  {:?}", start, opcode),

        // One u8 operand
        Opcode::Pop
        | Opcode::Concat
        | Opcode::GetLocal
        | Opcode::SetLocal
        | Opcode::GetUpval
        | Opcode::SetUpval
        | Opcode::Return => {
            let a = read_u8(chunk, offset);
            format!("{:04}  {:?} {}", start, opcode, a)
        }

        Opcode::IncIndex => {
            let delta = read_u8(chunk, offset) as i16 - 128;
            format!("{:04}  IncIndex {:+}", start, delta)
        }

        // Two u8 operands
        Opcode::Call | Opcode::Invoke => {
            let a = read_u8(chunk, offset);
            let b = read_u8(chunk, offset);
            format!("{:04}  {:?} {} {}", start, opcode, a, b)
        }

        // Biased delta + u8 slot
        Opcode::IncLocal | Opcode::IncUpval => {
            let delta = read_u8(chunk, offset) as i16 - 128;
            let slot = read_u8(chunk, offset);
            format!("{:04}  {:?} {:+} {}", start, opcode, delta, slot)
        }

        // One u16 constant operand
        Opcode::LoadConst
        | Opcode::GetGlobal
        | Opcode::SetGlobal
        | Opcode::GetObject => {
            let index = read_u16(chunk, offset);
            format!(
                "{:04}  {:?} {}        ; {}",
                start,
                opcode,
                index,
                constant_text(chunk, heap, index)
            )
        }

        // One u16 count or jump operand
        Opcode::NewDict | Opcode::NewObject | Opcode::Jmp | Opcode::JmpBack | Opcode::PeJmp
        | Opcode::EJmp => {
            let a = read_u16(chunk, offset);
            format!("{:04}  {:?} {}", start, opcode, a)
        }

        // u8 delta + u16 constant
        Opcode::IncGlobal | Opcode::IncObject => {
            let delta = read_u8(chunk, offset) as i16 - 128;
            let index = read_u16(chunk, offset);
            format!(
                "{:04}  {:?} {:+} {}        ; {}",
                start,
                opcode,
                delta,
                index,
                constant_text(chunk, heap, index)
            )
        }

        Opcode::Next => {
            let count = read_u8(chunk, offset);
            let exit = read_u16(chunk, offset);
            format!("{:04}  Next {} -> {:04}", start, count, *offset + exit as usize)
        }

        Opcode::Closure => {
            let index = read_u16(chunk, offset);
            let mut text = format!(
                "{:04}  Closure {}        ; {}",
                start,
                index,
                constant_text(chunk, heap, index)
            );
            // Inline upvalue directives follow the instruction
            let upvalue_count = match chunk.constants.get(index as usize) {
                Some(Value::Obj(r)) => match heap.get(*r) {
                    Obj::Function(f) => f.upvalue_count as usize,
                    _ => 0,
                },
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let tag = read_u8(chunk, offset);
                let slot = read_u8(chunk, offset);
                let source = if tag == Opcode::GetLocal as u8 {
                    "local"
                } else {
                    "upvalue"
                };
                write!(text, "\n   |       | capture {} {}", source, slot).unwrap();
            }
            text
        }
    }
}

fn read_u8(chunk: &Chunk, offset: &mut usize) -> u8 {
    let b = chunk.code[*offset];
    *offset += 1;
    b
}

fn read_u16(chunk: &Chunk, offset: &mut usize) -> u16 {
    let v = chunk.read_u16(*offset);
    *offset += 2;
    v
}

/// Printable form of a constant-pool entry
fn constant_text(chunk: &Chunk, heap: &Heap, index: u16) -> String {
    match chunk.constants.get(index as usize) {
        None => "<missing constant>".to_string(),
        Some(Value::Nil) => "nil".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => format_number(*n),
        Some(Value::Obj(r)) => match heap.get(*r) {
            Obj::Str(s) => format!("{:?}", &*s.text),
            Obj::Function(f) => format!("<fn {}>", f.name),
            other => format!("<{:?}>", other.kind()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_listing() {
        let mut heap = Heap::new();
        let mut chunk = Chunk::new();
        let s = heap.intern("greeting");
        let index = chunk.add_constant(Value::Obj(s)).unwrap();
        chunk.emit(Opcode::LoadConst, 1);
        chunk.emit_u16(index, 1);
        chunk.emit(Opcode::Return, 2);
        chunk.emit_u8(1, 2);

        let listing = disassemble(&chunk, &heap, "main");
        assert!(listing.contains("=== main ==="));
        assert!(listing.contains("LoadConst 0"));
        assert!(listing.contains("\"greeting\""));
        assert!(listing.contains("Return 1"));
    }
}
