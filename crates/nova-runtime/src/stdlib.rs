//! Built-in library
//!
//! Everything here is registered through the public embedding API: the
//! runtime itself has no privileged globals. [`open`] installs the core
//! functions, the String prototype (method calls on plain strings resolve
//! through it), and the Table prototype (which makes tables iterable).

use crate::object::{NativeFn, Obj, ObjKind};
use crate::value::{ErrorKind, Value};
use crate::vm::State;

/// Register the built-in library into a state
pub fn open(state: &mut State) -> Result<(), crate::value::RuntimeError> {
    const GLOBALS: &[(&str, Option<u8>, NativeFn)] = &[
        ("print", None, nv_print),
        ("type", Some(1), nv_type),
        ("tostring", Some(1), nv_tostring),
        ("tonumber", Some(1), nv_tonumber),
        ("assert", None, nv_assert),
        ("error", Some(1), nv_error),
        ("pcall", None, nv_pcall),
        ("loadstring", None, nv_loadstring),
        ("setproto", Some(2), nv_setproto),
        ("getproto", Some(1), nv_getproto),
    ];
    for (name, arity, func) in GLOBALS {
        state.push_string(name);
        state.push_native(name, *arity, *func);
    }
    state.register(GLOBALS.len());

    const STRING_METHODS: &[(&str, Option<u8>, NativeFn)] = &[
        ("sub", None, str_sub),
        ("find", None, str_find),
        ("split", Some(2), str_split),
        ("len", Some(1), str_len),
        ("upper", Some(1), str_upper),
        ("lower", Some(1), str_lower),
    ];
    for (name, arity, func) in STRING_METHODS {
        state.push_string(name);
        state.push_native(name, *arity, *func);
    }
    state.make_object(STRING_METHODS.len())?;
    state.register_proto_object(ObjKind::Str)?;

    const TABLE_METHODS: &[(&str, Option<u8>, NativeFn)] = &[
        ("__iter", Some(1), tbl_iter),
        ("len", Some(1), tbl_len),
        ("insert", Some(2), tbl_insert),
    ];
    for (name, arity, func) in TABLE_METHODS {
        state.push_string(name);
        state.push_native(name, *arity, *func);
    }
    state.make_object(TABLE_METHODS.len())?;
    state.register_proto_object(ObjKind::Table)?;

    Ok(())
}

type NativeResult = Result<usize, crate::value::RuntimeError>;

fn arg(state: &State, base: usize, index: usize) -> Value {
    state.stack[base + index]
}

fn string_arg(state: &State, base: usize, index: usize, what: &str) -> Result<String, crate::value::RuntimeError> {
    let value = arg(state, base, index);
    match state.heap.value_str(&value) {
        Some(text) => Ok(text.to_string()),
        None => Err(state.error(ErrorKind::Type(format!(
            "{} expects a string, got {}",
            what,
            state.heap.type_name(&value)
        )))),
    }
}

fn index_arg(state: &State, base: usize, index: usize, what: &str) -> Result<i64, crate::value::RuntimeError> {
    match arg(state, base, index) {
        Value::Number(n) if n.fract() == 0.0 => Ok(n as i64),
        other => Err(state.error(ErrorKind::Type(format!(
            "{} expects an integer index, got {}",
            what,
            state.heap.type_name(&other)
        )))),
    }
}

// === Core globals ===

/// `print(...)`: writes each argument's printable form, concatenated,
/// then a newline
fn nv_print(state: &mut State, argc: usize, base: usize) -> NativeResult {
    let mut text = String::new();
    for i in 0..argc {
        let value = arg(state, base, i);
        text.push_str(&state.display_value(value)?);
    }
    text.push('\n');
    let outcome = state.output.write_all(text.as_bytes());
    if let Err(error) = outcome {
        return Err(state.error(ErrorKind::Io(error.to_string())));
    }
    Ok(0)
}

/// `type(v)`: type name as a string
fn nv_type(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let value = arg(state, base, 0);
    let name = state.heap.type_name(&value);
    state.push_string(name);
    Ok(1)
}

/// `tostring(v)`: printable form, honoring `__tostring`
fn nv_tostring(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let value = arg(state, base, 0);
    let text = state.display_value(value)?;
    state.push_string(&text);
    Ok(1)
}

/// `tonumber(v)`: the number, a parsed string, or nil
fn nv_tonumber(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let value = arg(state, base, 0);
    let result = match value {
        Value::Number(_) => value,
        _ => match state.heap.value_str(&value) {
            Some(text) => match text.trim().parse::<f64>() {
                Ok(n) => Value::Number(n),
                Err(_) => Value::Nil,
            },
            None => Value::Nil,
        },
    };
    state.push_value(result);
    Ok(1)
}

/// `assert(v [, message])`: raise unless `v` is truthy; returns `v`
fn nv_assert(state: &mut State, argc: usize, base: usize) -> NativeResult {
    if argc == 0 {
        return Err(state.error(ErrorKind::Arity {
            expected: 1,
            got: 0,
        }));
    }
    let value = arg(state, base, 0);
    if value.is_truthy() {
        state.push_value(value);
        return Ok(1);
    }
    let message_value = if argc > 1 {
        arg(state, base, 1)
    } else {
        Value::Obj(state.intern("assertion failed!"))
    };
    let message = state.display_value(message_value)?;
    let mut error = state.error(ErrorKind::Thrown(message));
    error.value = Some(message_value);
    Err(error)
}

/// `error(v)`: raise `v` as a runtime error
fn nv_error(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let value = arg(state, base, 0);
    let message = state.display_value(value)?;
    let mut error = state.error(ErrorKind::Thrown(message));
    error.value = Some(value);
    Err(error)
}

/// `pcall(f, ...)`: protected call: `(true, results...)` on success,
/// `(false, error)` on failure
fn nv_pcall(state: &mut State, argc: usize, base: usize) -> NativeResult {
    if argc == 0 {
        return Err(state.error(ErrorKind::Type(
            "'pcall' expects a value to call".to_string(),
        )));
    }
    match state.protected_call_all(base, argc - 1) {
        Ok(count) => {
            state.stack.insert(base, Value::Bool(true));
            Ok(count + 1)
        }
        Err(error) => {
            let value = state.error_value(&error);
            state.push_value(Value::Bool(false));
            state.push_value(value);
            Ok(2)
        }
    }
}

/// `loadstring(source [, name])`: compile a chunk: the closure, or
/// `(nil, message)` on a compile error
fn nv_loadstring(state: &mut State, argc: usize, base: usize) -> NativeResult {
    if argc == 0 {
        return Err(state.error(ErrorKind::Type(
            "'loadstring' expects a source string".to_string(),
        )));
    }
    let source = string_arg(state, base, 0, "'loadstring'")?;
    let module = if argc > 1 {
        string_arg(state, base, 1, "'loadstring'")?
    } else {
        "loadstring".to_string()
    };
    match state.compile_string(&source, &module) {
        Ok(()) => Ok(1),
        Err(diagnostics) => {
            // compile_string already pushed nil
            let first = &diagnostics[0];
            let message = format!("{}:{}: {}", first.module, first.line, first.message);
            state.push_string(&message);
            Ok(2)
        }
    }
}

/// `setproto(obj, proto)`: set an object's prototype; cycles are refused
fn nv_setproto(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let target = arg(state, base, 0);
    let proto = arg(state, base, 1);
    let Some(target_ref) = target.as_obj().filter(|r| matches!(state.heap.get(*r), Obj::Object(_)))
    else {
        return Err(state.error(ErrorKind::Type(
            "'setproto' expects an object".to_string(),
        )));
    };
    match proto {
        Value::Nil => {
            state.heap.object_mut(target_ref).proto = None;
        }
        Value::Obj(proto_ref) if matches!(state.heap.get(proto_ref), Obj::Object(_)) => {
            if state.would_cycle(target_ref, proto_ref) {
                return Err(state.error(ErrorKind::ProtoCycle));
            }
            state.heap.object_mut(target_ref).proto = Some(proto_ref);
        }
        _ => {
            return Err(state.error(ErrorKind::Type(
                "prototype must be an object or nil".to_string(),
            )));
        }
    }
    state.push_value(target);
    Ok(1)
}

/// `getproto(obj)`: an object's prototype, or nil
fn nv_getproto(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let value = arg(state, base, 0);
    let result = match value.as_obj() {
        Some(r) => match state.heap.get(r) {
            Obj::Object(o) => o.proto.map(Value::Obj).unwrap_or(Value::Nil),
            _ => Value::Nil,
        },
        None => Value::Nil,
    };
    state.push_value(result);
    Ok(1)
}

// === String prototype ===

/// `s:sub(i [, j])`: characters `i..j` (0-based, `j` exclusive,
/// defaulting to the length); out-of-range indices are errors
fn str_sub(state: &mut State, argc: usize, base: usize) -> NativeResult {
    if !(2..=3).contains(&argc) {
        return Err(state.error(ErrorKind::Arity {
            expected: 2,
            got: argc,
        }));
    }
    let text = string_arg(state, base, 0, "'sub'")?;
    let len = text.chars().count();
    let start = index_arg(state, base, 1, "'sub'")?;
    let end = if argc == 3 {
        index_arg(state, base, 2, "'sub'")?
    } else {
        len as i64
    };
    if start < 0 || end < start || end > len as i64 {
        let bad = if start < 0 || start > len as i64 {
            start
        } else {
            end
        };
        return Err(state.error(ErrorKind::StringIndex { index: bad, len }));
    }
    let piece: String = text
        .chars()
        .skip(start as usize)
        .take((end - start) as usize)
        .collect();
    state.push_string(&piece);
    Ok(1)
}

/// `s:find(needle [, from])`: 0-based character index of the first
/// occurrence at or after `from`, or nil
fn str_find(state: &mut State, argc: usize, base: usize) -> NativeResult {
    if !(2..=3).contains(&argc) {
        return Err(state.error(ErrorKind::Arity {
            expected: 2,
            got: argc,
        }));
    }
    let haystack = string_arg(state, base, 0, "'find'")?;
    let needle = string_arg(state, base, 1, "'find'")?;
    let len = haystack.chars().count();
    let from = if argc == 3 {
        index_arg(state, base, 2, "'find'")?
    } else {
        0
    };
    if from < 0 || from > len as i64 {
        return Err(state.error(ErrorKind::StringIndex { index: from, len }));
    }
    let byte_start = haystack
        .char_indices()
        .nth(from as usize)
        .map(|(offset, _)| offset)
        .unwrap_or(haystack.len());
    let result = match haystack[byte_start..].find(&needle) {
        Some(byte_offset) => {
            let char_index = haystack[..byte_start + byte_offset].chars().count();
            Value::Number(char_index as f64)
        }
        None => Value::Nil,
    };
    state.push_value(result);
    Ok(1)
}

/// `s:split(sep)`: table of pieces, in order
fn str_split(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let text = string_arg(state, base, 0, "'split'")?;
    let separator = string_arg(state, base, 1, "'split'")?;
    if separator.is_empty() {
        return Err(state.error(ErrorKind::Type(
            "'split' separator must not be empty".to_string(),
        )));
    }
    // The pieces are interned while the table is still unreachable
    state.freeze_gc();
    let table = state.alloc(Obj::Table(Default::default()));
    for (i, piece) in text.split(&separator).enumerate() {
        let interned = state.intern(piece);
        state
            .heap
            .table_mut(table)
            .entries
            .insert(Value::Number(i as f64), Value::Obj(interned));
    }
    state.unfreeze_gc();
    state.push_value(Value::Obj(table));
    Ok(1)
}

/// `s:len()`: character count
fn str_len(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let text = string_arg(state, base, 0, "'len'")?;
    state.push_number(text.chars().count() as f64);
    Ok(1)
}

/// `s:upper()`
fn str_upper(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let text = string_arg(state, base, 0, "'upper'")?;
    state.push_string(&text.to_uppercase());
    Ok(1)
}

/// `s:lower()`
fn str_lower(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let text = string_arg(state, base, 0, "'lower'")?;
    state.push_string(&text.to_lowercase());
    Ok(1)
}

// === Table prototype ===

/// `__iter` for tables: an iterator object stepping entries in insertion
/// order, yielding `(value, key)` per step
///
/// A stored nil value ends iteration early, since the first result doubles
/// as the exhaustion signal.
fn tbl_iter(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let table = arg(state, base, 0);
    if table.as_obj().is_none_or(|r| !matches!(state.heap.get(r), Obj::Table(_))) {
        return Err(state.error(ErrorKind::Type(
            "'__iter' expects a table".to_string(),
        )));
    }
    state.push_string("src");
    state.push_value(table);
    state.push_string("i");
    state.push_number(0.0);
    state.push_string("__next");
    state.push_native("__next", Some(1), tbl_next);
    state.make_object(3)?;
    Ok(1)
}

/// `__next` for the table iterator object
fn tbl_next(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let iterator = arg(state, base, 0);
    let Some(iterator_ref) = iterator
        .as_obj()
        .filter(|r| matches!(state.heap.get(*r), Obj::Object(_)))
    else {
        return Err(state.error(ErrorKind::Type(
            "'__next' expects an iterator object".to_string(),
        )));
    };
    let src_key = Value::Obj(state.intern("src"));
    let pos_key = Value::Obj(state.intern("i"));
    let fields = &state.heap.object(iterator_ref).fields;
    let source = fields.get(&src_key).copied().unwrap_or(Value::Nil);
    let position = fields
        .get(&pos_key)
        .and_then(|v| v.as_number())
        .unwrap_or(0.0) as usize;

    let Some(source_ref) = source
        .as_obj()
        .filter(|r| matches!(state.heap.get(*r), Obj::Table(_)))
    else {
        state.push_nil();
        return Ok(1);
    };
    let entry = state
        .heap
        .table(source_ref)
        .entries
        .get_at(position)
        .map(|(k, v)| (*k, *v));
    match entry {
        None => {
            state.push_nil();
            Ok(1)
        }
        Some((key, value)) => {
            state
                .heap
                .object_mut(iterator_ref)
                .fields
                .insert(pos_key, Value::Number(position as f64 + 1.0));
            state.push_value(value);
            state.push_value(key);
            Ok(2)
        }
    }
}

/// `t:len()`: entry count
fn tbl_len(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let value = arg(state, base, 0);
    let Some(r) = value
        .as_obj()
        .filter(|r| matches!(state.heap.get(*r), Obj::Table(_)))
    else {
        return Err(state.error(ErrorKind::Type("'len' expects a table".to_string())));
    };
    state.push_number(state.heap.table(r).entries.len() as f64);
    Ok(1)
}

/// `t:insert(v)`: append at the next free integer index
fn tbl_insert(state: &mut State, _argc: usize, base: usize) -> NativeResult {
    let value = arg(state, base, 0);
    let item = arg(state, base, 1);
    let Some(r) = value
        .as_obj()
        .filter(|r| matches!(state.heap.get(*r), Obj::Table(_)))
    else {
        return Err(state.error(ErrorKind::Type(
            "'insert' expects a table".to_string(),
        )));
    };
    let next = state.heap.table(r).entries.array_len();
    state
        .heap
        .table_mut(r)
        .entries
        .insert(Value::Number(next as f64), item);
    Ok(0)
}
