//! Heap object kinds
//!
//! Every heap object is one of these payloads; the heap slot that owns it
//! carries the mark bit. Strings are interned per state, so string equality
//! reduces to handle identity.

use crate::bytecode::Chunk;
use crate::value::{ObjRef, Value};
use ordered_float::OrderedFloat;
use std::collections::HashMap;

/// Kind tag for heap objects, also the index into the prototype registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ObjKind {
    Str,
    Function,
    Closure,
    Upvalue,
    Table,
    Object,
    Native,
}

/// Number of object kinds (size of the prototype registry)
pub const KIND_COUNT: usize = 7;

/// A heap object payload
#[derive(Debug)]
pub enum Obj {
    Str(ObjStr),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Table(ObjTable),
    Object(ObjObject),
    Native(ObjNative),
}

impl Obj {
    /// The kind tag of this payload
    pub fn kind(&self) -> ObjKind {
        match self {
            Obj::Str(_) => ObjKind::Str,
            Obj::Function(_) => ObjKind::Function,
            Obj::Closure(_) => ObjKind::Closure,
            Obj::Upvalue(_) => ObjKind::Upvalue,
            Obj::Table(_) => ObjKind::Table,
            Obj::Object(_) => ObjKind::Object,
            Obj::Native(_) => ObjKind::Native,
        }
    }
}

/// Interned immutable string
#[derive(Debug)]
pub struct ObjStr {
    pub text: Box<str>,
}

/// How a function binds its first stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Top-level chunk; slot 0 is reserved for the running closure
    Script,
    /// Ordinary function; slot 0 is reserved for the running closure
    Function,
    /// Prototype method; slot 0 binds the receiver (the first declared
    /// parameter, `self` by convention)
    Method,
}

/// Compiled function prototype; immutable after compilation
#[derive(Debug)]
pub struct ObjFunction {
    pub chunk: Chunk,
    /// Number of declared parameters (for methods this includes the receiver)
    pub arity: u8,
    /// Whether the last parameter collects surplus arguments into a Table
    pub variadic: bool,
    pub upvalue_count: u8,
    pub kind: FunctionKind,
    /// Display name ("<script>" for top-level chunks)
    pub name: String,
    /// Module (chunk) name, used in error locations
    pub module: String,
}

/// A callable binding of a function and its captured upvalues
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable
///
/// Open upvalues point at a live operand-stack slot; when that slot leaves
/// the stack the upvalue closes over the value it last saw. The transition
/// is one-way.
#[derive(Debug)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

/// Plain mapping/array without metamethod dispatch
#[derive(Debug, Default)]
pub struct ObjTable {
    pub entries: Entries,
}

/// User-defined record with a prototype chain
#[derive(Debug, Default)]
pub struct ObjObject {
    pub fields: Entries,
    pub proto: Option<ObjRef>,
}

/// Embedder-implemented callable
///
/// Receives the state, the argument count, and the stack index of the first
/// argument; pushes its results and returns how many it pushed.
pub type NativeFn = fn(&mut crate::vm::State, usize, usize) -> Result<usize, crate::value::RuntimeError>;

/// Native function object
pub struct ObjNative {
    pub name: &'static str,
    /// `Some(n)` natives are arity-checked by the VM; `None` is variadic
    pub arity: Option<u8>,
    pub func: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Hashable form of a table key
///
/// `nil` and NaN are not valid keys; negative zero normalizes to zero so that
/// structurally-equal numbers land in the same bucket. Object keys hash by
/// identity, which for interned strings is also content equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TableKey {
    Bool(bool),
    Number(OrderedFloat<f64>),
    Obj(u32),
}

impl TableKey {
    fn of(value: &Value) -> Option<TableKey> {
        match value {
            Value::Nil => None,
            Value::Bool(b) => Some(TableKey::Bool(*b)),
            Value::Number(n) => {
                if n.is_nan() {
                    None
                } else {
                    let normalized = if *n == 0.0 { 0.0 } else { *n };
                    Some(TableKey::Number(OrderedFloat(normalized)))
                }
            }
            Value::Obj(r) => Some(TableKey::Obj(r.0)),
        }
    }
}

/// Insertion-ordered key/value mapping
///
/// Backs both tables and object field maps. Iteration order is insertion
/// order; overwriting a key keeps its original position. Integer keys
/// 0..n-1 give array behavior without a separate array part.
#[derive(Debug, Default)]
pub struct Entries {
    pairs: Vec<(Value, Value)>,
    index: HashMap<TableKey, usize>,
}

impl Entries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` can be used as a table key at all
    pub fn valid_key(key: &Value) -> bool {
        TableKey::of(key).is_some()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Look up a value; `None` for both missing and invalid keys
    pub fn get(&self, key: &Value) -> Option<&Value> {
        let slot = self.index.get(&TableKey::of(key)?)?;
        Some(&self.pairs[*slot].1)
    }

    /// Insert or overwrite; returns false when the key is invalid
    pub fn insert(&mut self, key: Value, value: Value) -> bool {
        let Some(hashed) = TableKey::of(&key) else {
            return false;
        };
        match self.index.get(&hashed) {
            Some(&slot) => self.pairs[slot].1 = value,
            None => {
                self.index.insert(hashed, self.pairs.len());
                self.pairs.push((key, value));
            }
        }
        true
    }

    /// Entry by insertion position
    pub fn get_at(&self, position: usize) -> Option<(&Value, &Value)> {
        self.pairs.get(position).map(|(k, v)| (k, v))
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.pairs.iter().map(|(k, v)| (k, v))
    }

    /// Length of the leading integer-keyed run 0..n-1 (the array part)
    pub fn array_len(&self) -> usize {
        let mut n = 0usize;
        while self.get(&Value::Number(n as f64)).is_some() {
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_insertion_order() {
        let mut entries = Entries::new();
        entries.insert(Value::Number(1.0), Value::Bool(true));
        entries.insert(Value::Number(0.0), Value::Bool(false));
        entries.insert(Value::Number(1.0), Value::Nil); // overwrite keeps position
        let keys: Vec<f64> = entries
            .iter()
            .map(|(k, _)| k.as_number().unwrap())
            .collect();
        assert_eq!(keys, vec![1.0, 0.0]);
        assert_eq!(entries.get(&Value::Number(1.0)), Some(&Value::Nil));
    }

    #[test]
    fn test_invalid_keys() {
        let mut entries = Entries::new();
        assert!(!entries.insert(Value::Nil, Value::Bool(true)));
        assert!(!entries.insert(Value::Number(f64::NAN), Value::Bool(true)));
        assert!(entries.is_empty());
    }

    #[test]
    fn test_negative_zero_key() {
        let mut entries = Entries::new();
        entries.insert(Value::Number(0.0), Value::Bool(true));
        assert_eq!(entries.get(&Value::Number(-0.0)), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_array_len() {
        let mut entries = Entries::new();
        for i in 0..4 {
            entries.insert(Value::Number(i as f64), Value::Number(i as f64 * 10.0));
        }
        entries.insert(Value::Bool(true), Value::Nil);
        assert_eq!(entries.array_len(), 4);
    }
}
