//! Embedding API
//!
//! The stack-oriented surface a host uses to drive a [`State`]: push
//! values, compile source, call (protected or not), register globals and
//! prototypes, and control the collector. The built-in library in
//! [`crate::stdlib`] is itself written against this surface.
//!
//! Stack indices count from the top: `peek(0)` is the most recently pushed
//! value.

use crate::bytecode;
use crate::diagnostic::Diagnostic;
use crate::object::{Entries, NativeFn, Obj, ObjClosure, ObjKind, ObjNative, ObjObject, ObjTable};
use crate::value::{ErrorKind, ObjRef, RuntimeError, Value};
use crate::vm::State;
use std::io::Write;

impl State {
    // === Value stack ===

    pub fn push_nil(&mut self) {
        self.push(Value::Nil);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push(Value::Bool(value));
    }

    pub fn push_number(&mut self, value: f64) {
        self.push(Value::Number(value));
    }

    /// Push an interned string
    pub fn push_string(&mut self, text: &str) {
        let r = self.intern(text);
        self.push(Value::Obj(r));
    }

    /// Push a native function; `arity` of `Some(n)` makes the VM reject
    /// calls with any other argument count
    pub fn push_native(&mut self, name: &'static str, arity: Option<u8>, func: NativeFn) {
        let r = self.alloc(Obj::Native(ObjNative { name, arity, func }));
        self.push(Value::Obj(r));
    }

    /// Push a value previously read off the stack
    pub fn push_value(&mut self, value: Value) {
        self.push(value);
    }

    /// Pop `n` values
    pub fn pop(&mut self, n: usize) {
        self.stack.truncate(self.stack.len().saturating_sub(n));
    }

    /// Read the value `distance` slots below the top
    pub fn peek(&self, distance: usize) -> Value {
        self.peek_at(distance)
    }

    /// Move the top value down so it sits `distance` slots below the top
    pub fn insert(&mut self, distance: usize) {
        let top = self.pop_value();
        let position = self.stack.len() - distance;
        self.stack.insert(position, top);
    }

    /// Current stack height
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    // === Typed reads ===

    pub fn get_number(&self, distance: usize) -> Option<f64> {
        self.peek_at(distance).as_number()
    }

    pub fn get_bool(&self, distance: usize) -> Option<bool> {
        match self.peek_at(distance) {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow the string at `distance`, if it is one
    pub fn get_string(&self, distance: usize) -> Option<&str> {
        let value = self.peek_at(distance);
        self.heap.value_str(&value)
    }

    pub fn get_object(&self, distance: usize) -> Option<ObjRef> {
        self.peek_at(distance).as_obj()
    }

    /// Read a value by absolute stack index; this is how native functions reach
    /// their arguments (`base`, `base + 1`, ...)
    pub fn value_at(&self, index: usize) -> Value {
        self.stack[index]
    }

    /// Borrow the text of a string value
    pub fn string_value(&self, value: &Value) -> Option<&str> {
        self.heap.value_str(value)
    }

    // === Compilation ===

    /// Compile `source` and push the resulting closure
    ///
    /// On failure, pushes nil instead and returns every diagnostic found.
    pub fn compile_string(
        &mut self,
        source: &str,
        module: &str,
    ) -> Result<(), Vec<Diagnostic>> {
        match crate::compiler::compile(source, module, &mut self.heap) {
            Ok(function) => {
                // Keep the unrooted function alive across the closure
                // allocation
                self.heap.freeze();
                let closure = self.heap.alloc(Obj::Closure(ObjClosure {
                    function,
                    upvalues: Vec::new(),
                }));
                self.heap.unfreeze();
                self.push(Value::Obj(closure));
                Ok(())
            }
            Err(diagnostics) => {
                self.push(Value::Nil);
                Err(diagnostics)
            }
        }
    }

    /// Disassemble the closure at `distance` (tests and `--disasm`)
    pub fn disassemble(&self, distance: usize) -> Option<String> {
        let r = self.peek_at(distance).as_obj()?;
        match self.heap.get(r) {
            Obj::Closure(c) => {
                let function = self.heap.function(c.function);
                Some(bytecode::disassemble(
                    &function.chunk,
                    &self.heap,
                    &function.name,
                ))
            }
            _ => None,
        }
    }

    // === Calls ===

    /// Call the value below `nargs` arguments, replacing callable and
    /// arguments with `nresults` results
    ///
    /// On error the stack is restored to its pre-call height and the error
    /// propagates to the embedder.
    pub fn call(&mut self, nargs: usize, nresults: usize) -> Result<(), RuntimeError> {
        let callee_idx = self.stack.len() - 1 - nargs;
        let saved_frames = self.frames.len();
        let saved_meta = self.meta_depth;
        match self.call_and_run(callee_idx, nargs, Some(nresults)) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.unwind(callee_idx, saved_frames, saved_meta);
                Err(error)
            }
        }
    }

    /// Protected call: like [`State::call`], but a runtime error leaves the
    /// error value on the stack instead of unwinding past the embedder
    pub fn pcall(&mut self, nargs: usize, nresults: usize) -> Result<(), RuntimeError> {
        let callee_idx = self.stack.len() - 1 - nargs;
        let saved_frames = self.frames.len();
        let saved_meta = self.meta_depth;
        match self.call_and_run(callee_idx, nargs, Some(nresults)) {
            Ok(()) => Ok(()),
            Err(error) => {
                self.unwind(callee_idx, saved_frames, saved_meta);
                let value = self.error_value(&error);
                self.push(value);
                Err(error)
            }
        }
    }

    /// Protected call leaving every result (used by the `pcall` built-in);
    /// returns the result count
    pub(crate) fn protected_call_all(
        &mut self,
        callee_idx: usize,
        nargs: usize,
    ) -> Result<usize, RuntimeError> {
        let saved_frames = self.frames.len();
        let saved_meta = self.meta_depth;
        match self.call_and_run(callee_idx, nargs, None) {
            Ok(()) => Ok(self.stack.len() - callee_idx),
            Err(error) => {
                self.unwind(callee_idx, saved_frames, saved_meta);
                Err(error)
            }
        }
    }

    /// The script-level value for an error: the thrown value if there was
    /// one, the rendered message otherwise
    pub(crate) fn error_value(&mut self, error: &RuntimeError) -> Value {
        match error.value {
            Some(value) => value,
            None => {
                let text = error.to_string();
                let r = self.intern(&text);
                Value::Obj(r)
            }
        }
    }

    fn unwind(&mut self, stack_to: usize, frames_to: usize, meta_to: usize) {
        self.close_upvalues(stack_to);
        self.frames.truncate(frames_to);
        self.stack.truncate(stack_to);
        self.meta_depth = meta_to;
    }

    // === Globals ===

    /// Pop `pairs` name/value pairs (name pushed first) into the globals
    /// table
    ///
    /// The collector is frozen across the writes, making the sequence
    /// atomic with respect to collection.
    pub fn register(&mut self, pairs: usize) {
        self.heap.freeze();
        for _ in 0..pairs {
            let value = self.pop_value();
            let name = self.pop_value();
            if Entries::valid_key(&name) {
                let globals = self.globals;
                self.heap.table_mut(globals).entries.insert(name, value);
            }
        }
        self.heap.unfreeze();
    }

    /// Pop the top value into the global `name`
    pub fn set_global(&mut self, name: &str) {
        let key = self.intern(name);
        let value = self.pop_value();
        let globals = self.globals;
        self.heap
            .table_mut(globals)
            .entries
            .insert(Value::Obj(key), value);
    }

    /// Push the value of the global `name` (nil when unset)
    pub fn get_global(&mut self, name: &str) {
        let key = self.intern(name);
        let value = self
            .heap
            .table(self.globals)
            .entries
            .get(&Value::Obj(key))
            .copied()
            .unwrap_or(Value::Nil);
        self.push(value);
    }

    // === Construction ===

    /// Build a Table from the top `pairs` key/value pairs (key pushed
    /// first within each pair)
    pub fn make_table(&mut self, pairs: usize) -> Result<(), RuntimeError> {
        let table = self.alloc(Obj::Table(ObjTable::default()));
        self.fill_from_stack(pairs, |heap_obj, key, value| match heap_obj {
            Obj::Table(t) => t.entries.insert(key, value),
            _ => false,
        }, table)
    }

    /// Build an Object from the top `pairs` key/value pairs
    pub fn make_object(&mut self, pairs: usize) -> Result<(), RuntimeError> {
        let object = self.alloc(Obj::Object(ObjObject::default()));
        self.fill_from_stack(pairs, |heap_obj, key, value| match heap_obj {
            Obj::Object(o) => o.fields.insert(key, value),
            _ => false,
        }, object)
    }

    fn fill_from_stack(
        &mut self,
        pairs: usize,
        insert: fn(&mut Obj, Value, Value) -> bool,
        target: ObjRef,
    ) -> Result<(), RuntimeError> {
        let start = self.stack.len() - 2 * pairs;
        for i in 0..pairs {
            let key = self.stack[start + 2 * i];
            let value = self.stack[start + 2 * i + 1];
            if !insert(self.heap.get_mut(target), key, value) {
                return Err(self.error(ErrorKind::TableKey(if key.is_nil() {
                    "nil"
                } else {
                    "NaN"
                })));
            }
        }
        self.stack.truncate(start);
        self.push(Value::Obj(target));
        Ok(())
    }

    /// Pop an Object and install it as the default prototype for `kind`
    ///
    /// This is how the String prototype is registered: method calls on
    /// plain strings resolve through it.
    pub fn register_proto_object(&mut self, kind: ObjKind) -> Result<(), RuntimeError> {
        let value = self.pop_value();
        match value.as_obj() {
            Some(r) if matches!(self.heap.get(r), Obj::Object(_)) => {
                self.protos[kind as usize] = Some(r);
                Ok(())
            }
            _ => Err(self.error(ErrorKind::Type(
                "prototype must be an object".to_string(),
            ))),
        }
    }

    /// The registered prototype for `kind`, if any
    pub fn proto_object(&self, kind: ObjKind) -> Option<ObjRef> {
        self.protos[kind as usize]
    }

    // === GC control ===

    /// Postpone collections; freezing is counted and recursive
    pub fn freeze_gc(&mut self) {
        self.heap.freeze();
    }

    pub fn unfreeze_gc(&mut self) {
        self.heap.unfreeze();
    }

    /// Number of live heap objects (tests and instrumentation)
    pub fn live_objects(&self) -> usize {
        self.heap.live_objects()
    }

    /// Declare a temporary GC root
    pub fn anchor(&mut self, value: Value) {
        self.anchors.push(value);
    }

    /// Release the most recent temporary root
    pub fn release_anchor(&mut self) {
        self.anchors.pop();
    }

    // === Output ===

    /// Redirect `print` output (defaults to stdout)
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }
}
