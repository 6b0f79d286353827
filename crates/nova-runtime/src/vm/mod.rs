//! Stack-based virtual machine
//!
//! Executes bytecode with a value stack and call frames. A [`State`] owns
//! everything: the heap, the operand stack, call frames, the globals table,
//! open upvalues, and the per-kind prototype registry. States share nothing
//! with each other and are single-threaded.
//!
//! Reentrant call sites (metamethods, iterator steps, protected calls) run
//! a nested dispatch loop until the frame depth returns to where it was;
//! plain calls just push a frame and let the main loop continue.

mod frame;

pub use frame::CallFrame;

use crate::bytecode::Opcode;
use crate::heap::Heap;
use crate::object::{
    Entries, FunctionKind, Obj, ObjClosure, ObjKind, ObjObject, ObjTable, ObjUpvalue, KIND_COUNT,
};
use crate::value::{format_number, ErrorKind, ObjRef, RuntimeError, Value};
use std::io::Write;

/// Maximum call-frame depth
pub const MAX_FRAMES: usize = 256;
/// Maximum operand-stack height
pub const STACK_LIMIT: usize = 65_536;
/// Maximum metamethod re-entry depth
pub const METAMETHOD_DEPTH: usize = 64;
/// Longest prototype chain followed before lookup errors out
pub const PROTO_CHAIN_LIMIT: usize = 100;

/// Pre-interned metamethod name handles
///
/// Interning these once makes metamethod lookup an identity-keyed map hit.
/// They are GC roots.
struct MetaNames {
    init: ObjRef,
    index: ObjRef,
    newindex: ObjRef,
    getter: ObjRef,
    setter: ObjRef,
    iter: ObjRef,
    next: ObjRef,
    tostring: ObjRef,
    equal: ObjRef,
}

impl MetaNames {
    fn intern(heap: &mut Heap) -> Self {
        Self {
            init: heap.intern("__init"),
            index: heap.intern("__index"),
            newindex: heap.intern("__newindex"),
            getter: heap.intern("__getter"),
            setter: heap.intern("__setter"),
            iter: heap.intern("__iter"),
            next: heap.intern("__next"),
            tostring: heap.intern("__tostring"),
            equal: heap.intern("__equal"),
        }
    }

    fn mark(&self, heap: &mut Heap) {
        for r in [
            self.init,
            self.index,
            self.newindex,
            self.getter,
            self.setter,
            self.iter,
            self.next,
            self.tostring,
            self.equal,
        ] {
            heap.mark_object(r);
        }
    }
}

/// A Nova interpreter state
///
/// Create one with [`State::new`], register the built-in library (or your
/// own), compile source with [`State::compile_string`], and run it through
/// [`State::call`] or [`State::pcall`]. Dropping the state frees every heap
/// object it owns.
pub struct State {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// The globals table (a heap object, replaceable by the embedder)
    pub(crate) globals: ObjRef,
    /// Open upvalues sorted by stack slot; at most one per slot
    pub(crate) open_upvalues: Vec<(usize, ObjRef)>,
    /// Default prototype per object kind (the String prototype lives here)
    pub(crate) protos: [Option<ObjRef>; KIND_COUNT],
    /// Embedder-declared temporary GC roots
    pub(crate) anchors: Vec<Value>,
    meta: MetaNames,
    pub(crate) meta_depth: usize,
    pub(crate) output: Box<dyn Write>,
}

impl State {
    /// Create a fresh state with an empty globals table
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let meta = MetaNames::intern(&mut heap);
        let globals = heap.alloc(Obj::Table(ObjTable::default()));
        Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals,
            open_upvalues: Vec::new(),
            protos: [None; KIND_COUNT],
            anchors: Vec::new(),
            meta,
            meta_depth: 0,
            output: Box::new(std::io::stdout()),
        }
    }

    // === Stack primitives ===

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop_value(&mut self) -> Value {
        self.stack.pop().expect("vm: operand stack underflow")
    }

    pub(crate) fn peek_at(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // === Allocation ===

    /// Allocate through the state so collection can run first
    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.maybe_collect();
        self.heap.alloc(obj)
    }

    /// Intern through the state so collection can run first
    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(text)
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Run a full mark-sweep collection now (unless frozen, this also
    /// happens automatically at allocation sites)
    pub fn collect_garbage(&mut self) {
        let Self {
            heap,
            stack,
            frames,
            globals,
            open_upvalues,
            protos,
            anchors,
            meta,
            ..
        } = self;

        for value in stack.iter() {
            heap.mark_value(value);
        }
        for frame in frames.iter() {
            heap.mark_object(frame.closure);
        }
        for (_, upvalue) in open_upvalues.iter() {
            heap.mark_object(*upvalue);
        }
        heap.mark_object(*globals);
        for proto in protos.iter().flatten() {
            heap.mark_object(*proto);
        }
        for value in anchors.iter() {
            heap.mark_value(value);
        }
        meta.mark(heap);

        heap.trace();
        heap.sweep();
    }

    // === Errors ===

    /// Attach the current module and line to an error kind
    pub(crate) fn error(&self, kind: ErrorKind) -> RuntimeError {
        match self.frames.last() {
            Some(frame) => {
                let function = self.heap.closure_function(frame.closure);
                RuntimeError {
                    kind,
                    module: function.module.clone(),
                    line: function.chunk.line_at(frame.pc.saturating_sub(1)),
                    value: None,
                }
            }
            None => RuntimeError::new(kind),
        }
    }

    fn type_error(&self, message: impl Into<String>) -> RuntimeError {
        self.error(ErrorKind::Type(message.into()))
    }

    // === Instruction fetch ===

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("vm: no call frame");
        let function = match self.heap.get(frame.closure) {
            Obj::Closure(c) => match self.heap.get(c.function) {
                Obj::Function(f) => f,
                _ => panic!("vm: closure does not wrap a function"),
            },
            _ => panic!("vm: frame closure is not a closure"),
        };
        let byte = function.chunk.code[frame.pc];
        frame.pc += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_byte();
        let hi = self.read_byte();
        u16::from_le_bytes([lo, hi])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        let frame = self.frames.last().expect("vm: no call frame");
        self.heap.closure_function(frame.closure).chunk.constants[index]
    }

    // === Upvalues ===

    /// Find or create the single open upvalue for a stack slot
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        match self.open_upvalues.binary_search_by_key(&slot, |(s, _)| *s) {
            Ok(position) => self.open_upvalues[position].1,
            Err(position) => {
                let upvalue = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
                self.open_upvalues.insert(position, (slot, upvalue));
                upvalue
            }
        }
    }

    /// Close every open upvalue at or above `from`
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        while let Some(&(slot, upvalue)) = self.open_upvalues.last() {
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
            self.open_upvalues.pop();
        }
    }

    fn upvalue_get(&self, index: usize) -> Value {
        let frame = self.frames.last().expect("vm: no call frame");
        let upvalue = self.heap.closure(frame.closure).upvalues[index];
        match self.heap.upvalue(upvalue) {
            ObjUpvalue::Open(slot) => self.stack[*slot],
            ObjUpvalue::Closed(value) => *value,
        }
    }

    fn upvalue_set(&mut self, index: usize, value: Value) {
        let frame = self.frames.last().expect("vm: no call frame");
        let upvalue = self.heap.closure(frame.closure).upvalues[index];
        match self.heap.upvalue(upvalue) {
            ObjUpvalue::Open(slot) => {
                let slot = *slot;
                self.stack[slot] = value;
            }
            ObjUpvalue::Closed(_) => {
                *self.heap.upvalue_mut(upvalue) = ObjUpvalue::Closed(value);
            }
        }
    }

    // === Field and metamethod resolution ===

    /// Raw lookup on an object and its prototype chain
    fn object_chain_get(&self, obj: ObjRef, key: &Value) -> Result<Option<Value>, RuntimeError> {
        let mut current = Some(obj);
        let mut depth = 0usize;
        while let Some(r) = current {
            if depth > PROTO_CHAIN_LIMIT {
                return Err(self.type_error("prototype chain too deep"));
            }
            let object = match self.heap.get(r) {
                Obj::Object(o) => o,
                _ => return Ok(None),
            };
            if let Some(value) = object.fields.get(key) {
                return Ok(Some(*value));
            }
            current = object.proto;
            depth += 1;
        }
        Ok(None)
    }

    /// Lookup through the registered prototype for a built-in kind
    fn kind_proto_get(&self, kind: ObjKind, key: &Value) -> Result<Option<Value>, RuntimeError> {
        match self.protos[kind as usize] {
            Some(proto) => self.object_chain_get(proto, key),
            None => Ok(None),
        }
    }

    /// Resolve a metamethod without consulting the per-kind registry:
    /// an object's own chain, or a table's own entries
    fn own_meta(&self, value: &Value, name: ObjRef) -> Result<Option<Value>, RuntimeError> {
        let key = Value::Obj(name);
        match value {
            Value::Obj(r) => match self.heap.get(*r) {
                Obj::Object(_) => self.object_chain_get(*r, &key),
                Obj::Table(t) => Ok(t.entries.get(&key).copied()),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Resolve a metamethod by pre-interned name for any value
    fn resolve_meta(&self, value: &Value, name: ObjRef) -> Result<Option<Value>, RuntimeError> {
        let key = Value::Obj(name);
        match value {
            Value::Obj(r) => match self.heap.get(*r) {
                Obj::Object(_) => self.object_chain_get(*r, &key),
                Obj::Table(t) => match t.entries.get(&key) {
                    Some(v) => Ok(Some(*v)),
                    None => self.kind_proto_get(ObjKind::Table, &key),
                },
                other => self.kind_proto_get(other.kind(), &key),
            },
            _ => Ok(None),
        }
    }

    /// Whether linking `proto` under `obj` would close a cycle
    pub(crate) fn would_cycle(&self, obj: ObjRef, proto: ObjRef) -> bool {
        let mut current = Some(proto);
        let mut depth = 0usize;
        while let Some(r) = current {
            if r == obj || depth > PROTO_CHAIN_LIMIT {
                return true;
            }
            current = match self.heap.get(r) {
                Obj::Object(o) => o.proto,
                _ => None,
            };
            depth += 1;
        }
        false
    }

    /// Full field-get protocol: own fields, prototype chain, `__getter.k`,
    /// then `__index`; nil when nothing matches
    ///
    /// The caller keeps `target` and `key` reachable (on the stack) while
    /// this runs, since getters may allocate.
    pub(crate) fn get_field_value(
        &mut self,
        target: Value,
        key: Value,
    ) -> Result<Value, RuntimeError> {
        let r = match target {
            Value::Obj(r) => r,
            _ => {
                return Err(self.type_error(format!(
                    "cannot index a {} value",
                    self.heap.type_name(&target)
                )))
            }
        };
        match self.heap.get(r) {
            Obj::Object(_) => {
                if let Some(value) = self.object_chain_get(r, &key)? {
                    return Ok(value);
                }
                if let Some(getters) = self.object_chain_get(r, &Value::Obj(self.meta.getter))? {
                    if let Some(getter) = self.raw_entry(&getters, &key) {
                        return Ok(self
                            .call_meta(getter, &[target], 1)?
                            .unwrap_or(Value::Nil));
                    }
                }
                if let Some(index) = self.object_chain_get(r, &Value::Obj(self.meta.index))? {
                    return Ok(self
                        .call_meta(index, &[target, key], 1)?
                        .unwrap_or(Value::Nil));
                }
                Ok(Value::Nil)
            }
            Obj::Table(t) => {
                if let Some(value) = t.entries.get(&key) {
                    return Ok(*value);
                }
                Ok(self.kind_proto_get(ObjKind::Table, &key)?.unwrap_or(Value::Nil))
            }
            Obj::Str(s) => {
                if let Value::Number(n) = key {
                    let len = s.text.chars().count();
                    if n.fract() != 0.0 || n < 0.0 || n as usize >= len {
                        return Err(self.error(ErrorKind::StringIndex {
                            index: n as i64,
                            len,
                        }));
                    }
                    let ch = s.text.chars().nth(n as usize).expect("index checked");
                    let interned = self.intern(&ch.to_string());
                    return Ok(Value::Obj(interned));
                }
                Ok(self.kind_proto_get(ObjKind::Str, &key)?.unwrap_or(Value::Nil))
            }
            other => {
                let kind = other.kind();
                match self.kind_proto_get(kind, &key)? {
                    Some(value) => Ok(value),
                    None => Err(self.type_error(format!(
                        "cannot index a {} value",
                        self.heap.type_name(&target)
                    ))),
                }
            }
        }
    }

    /// Full field-set protocol: `__setter.k`, then `__newindex`, then an
    /// own-field write
    pub(crate) fn set_field_value(
        &mut self,
        target: Value,
        key: Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let r = match target {
            Value::Obj(r) => r,
            _ => {
                return Err(self.type_error(format!(
                    "cannot assign into a {} value",
                    self.heap.type_name(&target)
                )))
            }
        };
        match self.heap.get(r) {
            Obj::Object(_) => {
                if let Some(setters) = self.object_chain_get(r, &Value::Obj(self.meta.setter))? {
                    if let Some(setter) = self.raw_entry(&setters, &key) {
                        self.call_meta(setter, &[target, value], 0)?;
                        return Ok(());
                    }
                }
                if let Some(newindex) =
                    self.object_chain_get(r, &Value::Obj(self.meta.newindex))?
                {
                    self.call_meta(newindex, &[target, key, value], 0)?;
                    return Ok(());
                }
                self.check_key(&key)?;
                self.heap.object_mut(r).fields.insert(key, value);
                Ok(())
            }
            Obj::Table(_) => {
                self.check_key(&key)?;
                self.heap.table_mut(r).entries.insert(key, value);
                Ok(())
            }
            _ => Err(self.type_error(format!(
                "cannot assign into a {} value",
                self.heap.type_name(&target)
            ))),
        }
    }

    /// Raw entry of a table or object field map, no dispatch
    fn raw_entry(&self, container: &Value, key: &Value) -> Option<Value> {
        match container {
            Value::Obj(r) => match self.heap.get(*r) {
                Obj::Table(t) => t.entries.get(key).copied(),
                Obj::Object(o) => o.fields.get(key).copied(),
                _ => None,
            },
            _ => None,
        }
    }

    fn check_key(&self, key: &Value) -> Result<(), RuntimeError> {
        if Entries::valid_key(key) {
            Ok(())
        } else if key.is_nil() {
            Err(self.error(ErrorKind::TableKey("nil")))
        } else {
            Err(self.error(ErrorKind::TableKey("NaN")))
        }
    }

    // === String conversion ===

    /// Printable form of a value, honoring `__tostring`
    pub(crate) fn display_value(&mut self, value: Value) -> Result<String, RuntimeError> {
        match value {
            Value::Nil => Ok("nil".to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Number(n) => Ok(format_number(n)),
            Value::Obj(r) => match self.heap.get(r) {
                Obj::Str(s) => Ok(s.text.to_string()),
                Obj::Table(_) => Ok(format!("<table: 0x{:08x}>", r.index())),
                Obj::Function(_) | Obj::Closure(_) | Obj::Native(_) => {
                    Ok(format!("<function: 0x{:08x}>", r.index()))
                }
                Obj::Upvalue(_) => Ok(format!("<upvalue: 0x{:08x}>", r.index())),
                Obj::Object(_) => {
                    if let Some(tostring) = self.resolve_meta(&value, self.meta.tostring)? {
                        let result = self
                            .call_meta(tostring, &[value], 1)?
                            .unwrap_or(Value::Nil);
                        match self.heap.value_str(&result) {
                            Some(text) => Ok(text.to_string()),
                            None => Err(self.type_error("'__tostring' must return a string")),
                        }
                    } else {
                        Ok(format!("<object: 0x{:08x}>", r.index()))
                    }
                }
            },
        }
    }

    // === Calls ===

    /// Set up a call to the value at `callee_idx`, with `argc` arguments
    /// above it. Returns true when a frame was pushed (a script closure);
    /// natives and constructors complete before returning.
    fn call_value(
        &mut self,
        callee_idx: usize,
        argc: usize,
        requested: Option<usize>,
    ) -> Result<bool, RuntimeError> {
        if self.stack.len() > STACK_LIMIT {
            return Err(self.error(ErrorKind::StackOverflow));
        }
        let callee = self.stack[callee_idx];
        let r = match callee {
            Value::Obj(r) => r,
            _ => {
                return Err(self.type_error(format!(
                    "attempt to call a {} value",
                    self.heap.type_name(&callee)
                )))
            }
        };
        match self.heap.get(r) {
            Obj::Closure(_) => {
                self.call_closure(r, callee_idx, argc, requested)?;
                Ok(true)
            }
            Obj::Native(native) => {
                if let Some(expected) = native.arity {
                    if argc != expected as usize {
                        return Err(self.error(ErrorKind::Arity {
                            expected: expected as usize,
                            got: argc,
                        }));
                    }
                }
                let func = native.func;
                let count = func(self, argc, callee_idx + 1)?;
                let results_start = self.stack.len() - count;
                self.stack.drain(callee_idx..results_start);
                self.adjust_results(callee_idx, requested);
                Ok(false)
            }
            Obj::Object(_) => {
                self.construct(r, callee_idx, argc, requested)?;
                Ok(false)
            }
            _ => Err(self.type_error(format!(
                "attempt to call a {} value",
                self.heap.type_name(&callee)
            ))),
        }
    }

    fn call_closure(
        &mut self,
        closure: ObjRef,
        callee_idx: usize,
        argc: usize,
        requested: Option<usize>,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.error(ErrorKind::CallDepth));
        }
        let function = self.heap.closure_function(closure);
        let arity = function.arity as usize;
        let variadic = function.variadic;
        let is_method = function.kind == FunctionKind::Method;

        // Arguments live just above the callee; pad or truncate them to the
        // declared parameter count (collecting extras for variadics)
        let params_start = callee_idx + 1;
        if variadic {
            let fixed = arity.saturating_sub(1);
            while self.stack.len() < params_start + fixed {
                self.push(Value::Nil);
            }
            let rest = self.alloc(Obj::Table(ObjTable::default()));
            let extras: Vec<Value> = self.stack.split_off(params_start + fixed);
            let entries = &mut self.heap.table_mut(rest).entries;
            for (i, value) in extras.into_iter().enumerate() {
                entries.insert(Value::Number(i as f64), value);
            }
            self.push(Value::Obj(rest));
        } else if argc > arity {
            self.stack.truncate(params_start + arity);
        } else {
            while self.stack.len() < params_start + arity {
                self.push(Value::Nil);
            }
        }

        // Methods bind the receiver (their first parameter) to slot 0; the
        // callee value itself sits one below and is reclaimed on return
        let base = if is_method { callee_idx + 1 } else { callee_idx };
        self.frames.push(CallFrame {
            closure,
            pc: 0,
            base,
            bottom: callee_idx,
            requested,
        });
        Ok(())
    }

    /// Call an Object like a function: allocate an instance with the callee
    /// as its prototype and run `__init` on it; the instance is the result
    fn construct(
        &mut self,
        proto: ObjRef,
        callee_idx: usize,
        argc: usize,
        requested: Option<usize>,
    ) -> Result<(), RuntimeError> {
        let init = self
            .object_chain_get(proto, &Value::Obj(self.meta.init))?
            .ok_or_else(|| self.type_error("object is not callable (no '__init')"))?;

        let instance = self.alloc(Obj::Object(ObjObject {
            fields: Entries::new(),
            proto: Some(proto),
        }));
        // [proto, args...] becomes [init, instance, args...]
        self.stack.insert(callee_idx + 1, Value::Obj(instance));
        self.stack[callee_idx] = init;
        self.call_and_run(callee_idx, argc + 1, Some(0))?;

        self.push(Value::Obj(instance));
        self.adjust_results(callee_idx, requested);
        Ok(())
    }

    /// Call and, if a frame was pushed, run it to completion
    pub(crate) fn call_and_run(
        &mut self,
        callee_idx: usize,
        argc: usize,
        requested: Option<usize>,
    ) -> Result<(), RuntimeError> {
        let depth = self.frames.len();
        if self.call_value(callee_idx, argc, requested)? {
            self.run(depth)?;
        }
        Ok(())
    }

    /// Invoke a metamethod with a re-entry depth guard
    ///
    /// `want` of 1 returns the single result; 0 discards results.
    fn call_meta(
        &mut self,
        callable: Value,
        args: &[Value],
        want: usize,
    ) -> Result<Option<Value>, RuntimeError> {
        if self.meta_depth >= METAMETHOD_DEPTH {
            return Err(self.error(ErrorKind::MetaDepth));
        }
        self.meta_depth += 1;
        self.push(callable);
        for &arg in args {
            self.push(arg);
        }
        let callee_idx = self.stack.len() - 1 - args.len();
        let outcome = self.call_and_run(callee_idx, args.len(), Some(want));
        self.meta_depth -= 1;
        outcome?;
        if want == 1 {
            Ok(Some(self.pop_value()))
        } else {
            Ok(None)
        }
    }

    /// Pad with nils or truncate so the results starting at `start` match
    /// the requested count
    fn adjust_results(&mut self, start: usize, requested: Option<usize>) {
        let Some(requested) = requested else {
            return;
        };
        while self.stack.len() > start + requested {
            self.stack.pop();
        }
        while self.stack.len() < start + requested {
            self.push(Value::Nil);
        }
    }

    // === Equality ===

    /// Structural/identity equality with `__equal` dispatch on objects
    fn values_equal(&mut self, a: Value, b: Value) -> Result<bool, RuntimeError> {
        if a == b {
            return Ok(true);
        }
        if let (Value::Obj(ra), Value::Obj(rb)) = (a, b) {
            let both_objects = matches!(self.heap.get(ra), Obj::Object(_))
                && matches!(self.heap.get(rb), Obj::Object(_));
            if both_objects {
                if let Some(equal) = self.resolve_meta(&a, self.meta.equal)? {
                    let result = self.call_meta(equal, &[a, b], 1)?.unwrap_or(Value::Nil);
                    return Ok(result.is_truthy());
                }
            }
        }
        Ok(false)
    }

    // === Dispatch ===

    /// Execute until the frame stack shrinks back to `target_depth`
    pub(crate) fn run(&mut self, target_depth: usize) -> Result<(), RuntimeError> {
        loop {
            if self.frames.len() <= target_depth {
                return Ok(());
            }
            let opcode = match Opcode::try_from(self.read_byte()) {
                Ok(op) => op,
                Err(byte) => {
                    return Err(self.type_error(format!("unknown opcode {:#04x}", byte)));
                }
            };

            match opcode {
                // ===== Constants and literals =====
                Opcode::LoadConst => {
                    let value = self.read_constant();
                    self.push(value);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    let n = self.read_byte() as usize;
                    self.stack.truncate(self.stack.len() - n);
                }

                // ===== Unary =====
                Opcode::Negate => {
                    let value = self.pop_value();
                    match value {
                        Value::Number(n) => self.push(Value::Number(-n)),
                        _ => {
                            return Err(self.type_error(format!(
                                "cannot negate a {} value",
                                self.heap.type_name(&value)
                            )))
                        }
                    }
                }
                Opcode::Not => {
                    let value = self.pop_value();
                    self.push(Value::Bool(!value.is_truthy()));
                }
                Opcode::Count => {
                    let value = self.pop_value();
                    let count = match value {
                        Value::Obj(r) => match self.heap.get(r) {
                            Obj::Str(s) => s.text.chars().count(),
                            Obj::Table(t) => t.entries.len(),
                            Obj::Object(o) => o.fields.len(),
                            _ => {
                                return Err(self.type_error(format!(
                                    "cannot take the length of a {} value",
                                    self.heap.type_name(&value)
                                )))
                            }
                        },
                        _ => {
                            return Err(self.type_error(format!(
                                "cannot take the length of a {} value",
                                self.heap.type_name(&value)
                            )))
                        }
                    };
                    self.push(Value::Number(count as f64));
                }

                // ===== Arithmetic =====
                //
                // Numbers only; `+` on strings is a type error (use `..`).
                // Division and modulo by zero follow IEEE-754.
                Opcode::Add => self.binary_numeric(|a, b| a + b)?,
                Opcode::Sub => self.binary_numeric(|a, b| a - b)?,
                Opcode::Mult => self.binary_numeric(|a, b| a * b)?,
                Opcode::Div => self.binary_numeric(|a, b| a / b)?,
                Opcode::Mod => self.binary_numeric(|a, b| a % b)?,

                // ===== Comparison =====
                Opcode::Equal => {
                    let b = self.pop_value();
                    let a = self.pop_value();
                    let eq = self.values_equal(a, b)?;
                    self.push(Value::Bool(eq));
                }
                Opcode::Greater => self.binary_compare(|a, b| a > b)?,
                Opcode::Less => self.binary_compare(|a, b| a < b)?,
                Opcode::GreaterEqual => self.binary_compare(|a, b| a >= b)?,
                Opcode::LessEqual => self.binary_compare(|a, b| a <= b)?,

                // ===== Strings =====
                Opcode::Concat => {
                    let n = self.read_byte() as usize;
                    let mut text = String::new();
                    for i in (0..n).rev() {
                        let piece = self.peek_at(i);
                        text.push_str(&self.display_value(piece)?);
                    }
                    self.stack.truncate(self.stack.len() - n);
                    let interned = self.intern(&text);
                    self.push(Value::Obj(interned));
                }

                // ===== Locals =====
                Opcode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("vm: no call frame").base;
                    self.push(self.stack[base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("vm: no call frame").base;
                    self.stack[base + slot] = self.peek_at(0);
                }
                Opcode::IncLocal => {
                    let delta = self.read_byte() as i16 - 128;
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("vm: no call frame").base;
                    let new = self.increment(self.stack[base + slot], delta)?;
                    self.stack[base + slot] = new;
                    self.push(new);
                }

                // ===== Upvalues =====
                Opcode::GetUpval => {
                    let index = self.read_byte() as usize;
                    self.push(self.upvalue_get(index));
                }
                Opcode::SetUpval => {
                    let index = self.read_byte() as usize;
                    let value = self.peek_at(0);
                    self.upvalue_set(index, value);
                }
                Opcode::IncUpval => {
                    let delta = self.read_byte() as i16 - 128;
                    let index = self.read_byte() as usize;
                    let new = self.increment(self.upvalue_get(index), delta)?;
                    self.upvalue_set(index, new);
                    self.push(new);
                }

                // ===== Globals =====
                Opcode::GetGlobal => {
                    let name = self.read_constant();
                    let value = self
                        .heap
                        .table(self.globals)
                        .entries
                        .get(&name)
                        .copied()
                        .unwrap_or(Value::Nil);
                    self.push(value);
                }
                Opcode::SetGlobal => {
                    let name = self.read_constant();
                    let value = self.peek_at(0);
                    let globals = self.globals;
                    self.heap.table_mut(globals).entries.insert(name, value);
                }
                Opcode::IncGlobal => {
                    let delta = self.read_byte() as i16 - 128;
                    let name = self.read_constant();
                    let current = self
                        .heap
                        .table(self.globals)
                        .entries
                        .get(&name)
                        .copied()
                        .unwrap_or(Value::Nil);
                    let new = self.increment(current, delta)?;
                    let globals = self.globals;
                    self.heap.table_mut(globals).entries.insert(name, new);
                    self.push(new);
                }

                // ===== Fields =====
                Opcode::GetObject => {
                    let name = self.read_constant();
                    let target = self.peek_at(0);
                    let value = self.get_field_value(target, name)?;
                    let top = self.stack.len() - 1;
                    self.stack[top] = value;
                }
                Opcode::SetObject => {
                    let value = self.peek_at(0);
                    let name = self.peek_at(1);
                    let target = self.peek_at(2);
                    self.set_field_value(target, name, value)?;
                    self.stack.truncate(self.stack.len() - 3);
                    self.push(value);
                }
                Opcode::IncObject => {
                    let delta = self.read_byte() as i16 - 128;
                    let name = self.read_constant();
                    let target = self.peek_at(0);
                    let current = self.get_field_value(target, name)?;
                    let new = self.increment(current, delta)?;
                    self.set_field_value(target, name, new)?;
                    let top = self.stack.len() - 1;
                    self.stack[top] = new;
                }
                Opcode::Index => {
                    let key = self.peek_at(0);
                    let target = self.peek_at(1);
                    let value = self.get_field_value(target, key)?;
                    self.stack.truncate(self.stack.len() - 2);
                    self.push(value);
                }
                Opcode::NewIndex => {
                    let value = self.peek_at(0);
                    let key = self.peek_at(1);
                    let target = self.peek_at(2);
                    self.set_field_value(target, key, value)?;
                    self.stack.truncate(self.stack.len() - 3);
                    self.push(value);
                }
                Opcode::IncIndex => {
                    let delta = self.read_byte() as i16 - 128;
                    let key = self.peek_at(0);
                    let target = self.peek_at(1);
                    let current = self.get_field_value(target, key)?;
                    let new = self.increment(current, delta)?;
                    self.set_field_value(target, key, new)?;
                    self.stack.truncate(self.stack.len() - 2);
                    self.push(new);
                }

                // ===== Constructors =====
                Opcode::NewDict => {
                    let pairs = self.read_u16() as usize;
                    let table = self.alloc(Obj::Table(ObjTable::default()));
                    let start = self.stack.len() - 2 * pairs;
                    for i in 0..pairs {
                        let key = self.stack[start + 2 * i];
                        let value = self.stack[start + 2 * i + 1];
                        self.check_key(&key)?;
                        self.heap.table_mut(table).entries.insert(key, value);
                    }
                    self.stack.truncate(start);
                    self.push(Value::Obj(table));
                }
                Opcode::NewObject => {
                    let pairs = self.read_u16() as usize;
                    let object = self.alloc(Obj::Object(ObjObject::default()));
                    let start = self.stack.len() - 2 * pairs;
                    for i in 0..pairs {
                        let key = self.stack[start + 2 * i];
                        let value = self.stack[start + 2 * i + 1];
                        self.check_key(&key)?;
                        self.heap.object_mut(object).fields.insert(key, value);
                    }
                    self.stack.truncate(start);
                    self.push(Value::Obj(object));
                }

                // ===== Closures =====
                Opcode::Closure => {
                    let function = self.read_constant();
                    let function_ref = function.as_obj().expect("closure constant");
                    let upvalue_count = self.heap.function(function_ref).upvalue_count as usize;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let tag = self.read_byte();
                        let index = self.read_byte() as usize;
                        if tag == Opcode::GetLocal as u8 {
                            let base = self.frames.last().expect("vm: no call frame").base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let frame = self.frames.last().expect("vm: no call frame");
                            upvalues.push(self.heap.closure(frame.closure).upvalues[index]);
                        }
                    }
                    let closure = self.alloc(Obj::Closure(ObjClosure {
                        function: function_ref,
                        upvalues,
                    }));
                    self.push(Value::Obj(closure));
                }
                Opcode::Close => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop_value();
                }

                // ===== Calls =====
                Opcode::Call => {
                    let argc = self.read_byte() as usize;
                    let results = self.read_byte() as usize;
                    let callee_idx = self.stack.len() - 1 - argc;
                    self.call_value(callee_idx, argc, Some(results))?;
                }
                Opcode::Invoke => {
                    let argc = self.read_byte() as usize;
                    let results = self.read_byte() as usize;
                    let name_idx = self.stack.len() - 1 - argc;
                    let self_idx = name_idx - 1;
                    let name = self.stack[name_idx];
                    let receiver = self.stack[self_idx];
                    let method = self.get_field_value(receiver, name)?;
                    if method.is_nil() {
                        let name_text = self
                            .heap
                            .value_str(&name)
                            .unwrap_or("?")
                            .to_string();
                        return Err(self.type_error(format!(
                            "method '{}' not found on {} value",
                            name_text,
                            self.heap.type_name(&receiver)
                        )));
                    }
                    // [self, name, args...] becomes [method, self, args...]
                    self.stack[name_idx] = receiver;
                    self.stack[self_idx] = method;
                    self.call_value(self_idx, argc + 1, Some(results))?;
                }
                Opcode::Return => {
                    let count = self.read_byte() as usize;
                    let results_start = self.stack.len() - count;
                    let frame = self.frames.pop().expect("vm: no call frame");
                    self.close_upvalues(frame.bottom);
                    self.stack.drain(frame.bottom..results_start);
                    self.adjust_results(frame.bottom, frame.requested);
                }

                // ===== Control flow =====
                Opcode::Jmp => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("vm: no call frame").pc += offset;
                }
                Opcode::JmpBack => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().expect("vm: no call frame").pc -= offset;
                }
                Opcode::PeJmp => {
                    let offset = self.read_u16() as usize;
                    let condition = self.pop_value();
                    if !condition.is_truthy() {
                        self.frames.last_mut().expect("vm: no call frame").pc += offset;
                    }
                }
                Opcode::EJmp => {
                    let offset = self.read_u16() as usize;
                    if !self.peek_at(0).is_truthy() {
                        self.frames.last_mut().expect("vm: no call frame").pc += offset;
                    }
                }

                // ===== Iteration =====
                Opcode::Iter => {
                    let value = self.peek_at(0);
                    // A value carrying its own __next is already an
                    // iterator; otherwise __iter (own first, then the
                    // kind's registered prototype) produces one.
                    let own_iter = self.own_meta(&value, self.meta.iter)?;
                    let own_next = self.own_meta(&value, self.meta.next)?;
                    let iter = match own_iter {
                        Some(iter) => Some(iter),
                        None if own_next.is_some() => None,
                        None => self.resolve_meta(&value, self.meta.iter)?,
                    };
                    if let Some(iter) = iter {
                        let iterator = self
                            .call_meta(iter, &[value], 1)?
                            .unwrap_or(Value::Nil);
                        let top = self.stack.len() - 1;
                        self.stack[top] = iterator;
                    } else if own_next.is_some()
                        || self.resolve_meta(&value, self.meta.next)?.is_some()
                    {
                        // The value is its own iterator
                    } else {
                        return Err(self.type_error(format!(
                            "a {} value is not iterable",
                            self.heap.type_name(&value)
                        )));
                    }
                }
                Opcode::Next => {
                    let count = self.read_byte() as usize;
                    let exit = self.read_u16() as usize;
                    let iterator = self.peek_at(0);
                    let next = self
                        .resolve_meta(&iterator, self.meta.next)?
                        .ok_or_else(|| {
                            self.type_error("iterator does not define '__next'")
                        })?;
                    if self.meta_depth >= METAMETHOD_DEPTH {
                        return Err(self.error(ErrorKind::MetaDepth));
                    }
                    self.meta_depth += 1;
                    self.push(next);
                    self.push(iterator);
                    let callee_idx = self.stack.len() - 2;
                    let outcome = self.call_and_run(callee_idx, 1, Some(count));
                    self.meta_depth -= 1;
                    outcome?;
                    if self.stack[self.stack.len() - count].is_nil() {
                        self.stack.truncate(self.stack.len() - count);
                        self.frames.last_mut().expect("vm: no call frame").pc += exit;
                    }
                }
            }
        }
    }

    // === Arithmetic helpers ===

    fn binary_numeric(&mut self, op: fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop_value();
        let a = self.pop_value();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => {
                let (ta, tb) = (self.heap.type_name(&a), self.heap.type_name(&b));
                if ta == "string" || tb == "string" {
                    Err(self.type_error(
                        "arithmetic on string values; use '..' to concatenate",
                    ))
                } else {
                    Err(self.type_error(format!("arithmetic on {} and {} values", ta, tb)))
                }
            }
        }
    }

    fn binary_compare(&mut self, op: fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop_value();
        let a = self.pop_value();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => Err(self.type_error(format!(
                "cannot compare {} and {} values",
                self.heap.type_name(&a),
                self.heap.type_name(&b)
            ))),
        }
    }

    fn increment(&self, value: Value, delta: i16) -> Result<Value, RuntimeError> {
        match value {
            Value::Number(n) => Ok(Value::Number(n + delta as f64)),
            _ => Err(self.type_error(format!(
                "cannot increment a {} value",
                self.heap.type_name(&value)
            ))),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
