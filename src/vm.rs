// File: src/vm.rs
//
// The Lume virtual machine: a stack machine interpreting chunk
// bytecode through call frames. Owns the heap, the globals, the open
// upvalue list, and the cached dunder names, and drives garbage
// collection from its allocation safepoints.

use std::io::Write;
use std::rc::Rc;

use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::chunk::{Chunk, OpCode};
use crate::compiler;
use crate::errors::{LumeError, RuntimeError, TraceFrame};
use crate::heap::Heap;
use crate::natives;
use crate::object::{
    Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjRef, ObjTable, ObjUpvalue,
};
use crate::value::{format_value, is_falsey, Value};

/// Native functions receive the VM (for allocation and re-entrant
/// calls) and the argument slice; a string error becomes a runtime
/// error with the usual stack trace.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: ObjRef,
    /// The closure's chunk, cached so dispatch avoids a heap walk per
    /// byte. Chunks are immutable once compiled.
    chunk: Rc<Chunk>,
    ip: usize,
    base: usize,
}

/// Interned names the VM looks up constantly: `init` and the operator
/// dunders. Kept alive as GC roots.
struct DunderNames {
    add: ObjRef,
    sub: ObjRef,
    mul: ObjRef,
    div: ObjRef,
    modulo: ObjRef,
    bit_and: ObjRef,
    bit_or: ObjRef,
    bit_xor: ObjRef,
    gt: ObjRef,
    lt: ObjRef,
    eq: ObjRef,
    not: ObjRef,
}

impl DunderNames {
    fn all(&self) -> [ObjRef; 12] {
        [
            self.add,
            self.sub,
            self.mul,
            self.div,
            self.modulo,
            self.bit_and,
            self.bit_or,
            self.bit_xor,
            self.gt,
            self.lt,
            self.eq,
            self.not,
        ]
    }
}

/// Discriminant-only view of a heap object, used where dispatch needs
/// the tag without holding a borrow on the object itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
    Table,
    Array,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: AHashMap<ObjRef, Value>,
    /// Open upvalues sorted by descending stack slot.
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    dunders: DunderNames,
    out: Box<dyn Write>,
    pub(crate) rng: StdRng,
    pub(crate) files: AHashMap<u32, std::fs::File>,
    pub(crate) next_file_handle: u32,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_output(Box::new(std::io::stdout()))
    }

    /// Build a VM that writes program output (`dump`, `print`, ...) to
    /// the given sink. Tests pass a shared buffer here.
    pub fn with_output(out: Box<dyn Write>) -> Vm {
        let mut heap = Heap::new();

        let init_string = heap.intern("init");
        let dunders = DunderNames {
            add: heap.intern("__add"),
            sub: heap.intern("__sub"),
            mul: heap.intern("__mul"),
            div: heap.intern("__div"),
            modulo: heap.intern("__mod"),
            bit_and: heap.intern("__and"),
            bit_or: heap.intern("__or"),
            bit_xor: heap.intern("__xor"),
            gt: heap.intern("__gt"),
            lt: heap.intern("__lt"),
            eq: heap.intern("__eq"),
            not: heap.intern("__not"),
        };

        let mut vm = Vm {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: AHashMap::new(),
            open_upvalues: Vec::new(),
            init_string,
            dunders,
            out,
            rng: StdRng::from_entropy(),
            files: AHashMap::new(),
            next_file_handle: 1,
        };
        natives::install_globals(&mut vm);
        vm
    }

    /// Compile and execute a source string. The VM keeps its globals,
    /// heap, and intern table across calls, so a REPL can feed lines
    /// one at a time.
    pub fn interpret(&mut self, source: &str) -> Result<(), LumeError> {
        let function = compiler::compile(source, &mut self.heap).map_err(LumeError::Compile)?;

        self.stack.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::new() }));
        self.stack.pop();
        self.stack.push(Value::Obj(closure));

        let outcome =
            self.call_closure(closure, 0).and_then(|()| self.run(0)).map(|_script_result| ());
        if outcome.is_err() {
            self.reset();
        }
        outcome.map_err(LumeError::Runtime)
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Install a native function as a global. The name and native are
    /// kept on the stack across the allocations so a collection in
    /// between cannot free them.
    pub(crate) fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let name_ref = self.intern(name);
        self.push(Value::Obj(name_ref));
        let native = self.alloc(Obj::Native(crate::object::ObjNative { name, function }));
        self.push(Value::Obj(native));
        self.globals.insert(name_ref, Value::Obj(native));
        self.pop();
        self.pop();
    }

    /// Look up a global by name. Mainly for tests and the REPL.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let name = self.heap.find_interned(name)?;
        self.globals.get(&name).copied()
    }

    /// Names of all defined globals, sorted. Used by the REPL.
    pub fn global_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.globals.keys().map(|&k| self.heap.string(k).to_string()).collect();
        names.sort();
        names
    }

    pub fn set_gc_stress(&mut self, stress: bool) {
        self.heap.set_stress(stress);
    }

    /// Depth of the value stack. Zero between top-level statements.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // Allocation safepoints. Every object allocation goes through one
    // of these so a collection can run while the roots are consistent;
    // values in flight must be on the stack before calling.

    pub(crate) fn alloc(&mut self, obj: Obj) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    pub(crate) fn take_string(&mut self, text: String) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.take_string(text)
    }

    fn collect_garbage(&mut self) {
        let Vm { heap, stack, frames, globals, open_upvalues, init_string, dunders, .. } = self;

        for &value in stack.iter() {
            heap.mark_value(value);
        }
        for frame in frames.iter() {
            heap.mark_object(frame.closure);
        }
        for (&name, &value) in globals.iter() {
            heap.mark_object(name);
            heap.mark_value(value);
        }
        for &upvalue in open_upvalues.iter() {
            heap.mark_object(upvalue);
        }
        heap.mark_object(*init_string);
        for name in dunders.all() {
            heap.mark_object(name);
        }

        heap.trace_references();
        heap.remove_unmarked_strings();
        heap.sweep();
    }

    // Stack primitives

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn tag(&self, r: ObjRef) -> Tag {
        match self.heap.get(r) {
            Obj::String(_) => Tag::String,
            Obj::Function(_) => Tag::Function,
            Obj::Native(_) => Tag::Native,
            Obj::Closure(_) => Tag::Closure,
            Obj::Upvalue(_) => Tag::Upvalue,
            Obj::Class(_) => Tag::Class,
            Obj::Instance(_) => Tag::Instance,
            Obj::BoundMethod(_) => Tag::BoundMethod,
            Obj::Table(_) => Tag::Table,
            Obj::Array(_) => Tag::Array,
        }
    }

    fn value_tag(&self, value: Value) -> Option<Tag> {
        value.as_obj().map(|r| self.tag(r))
    }

    // Bytecode reads; each advances the current frame's ip.

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active call frame");
        let short = frame.chunk.read_short(frame.ip);
        frame.ip += 2;
        short
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.frame().chunk.constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) => r,
            other => panic!("name constant is not a string: {:?}", other),
        }
    }

    /// Build a runtime error carrying the current call-stack trace,
    /// deepest frame first.
    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(self.heap.closure(frame.closure).function);
            let instruction = frame.ip.saturating_sub(1);
            let line = frame.chunk.lines.get(instruction).copied().unwrap_or(0);
            let name = function.name.map(|n| self.heap.string(n).to_string());
            trace.push(TraceFrame { line, function: name });
        }
        RuntimeError { message: message.into(), trace }
    }

    // Calls

    fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let function = self.heap.function(self.heap.closure(closure).function);
        let arity = function.arity;
        let chunk = Rc::clone(&function.chunk);

        if arg_count != arity {
            return Err(
                self.runtime_error(format!("Expected {} arguments but got {}.", arity, arg_count))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }

        let base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame { closure, chunk, ip: 0, base });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        enum Callee {
            Bound(Value, ObjRef),
            Class,
            Closure,
            Native(NativeFn),
            NotCallable,
        }

        let kind = match callee.as_obj() {
            Some(r) => match self.heap.get(r) {
                Obj::BoundMethod(b) => Callee::Bound(b.receiver, b.method),
                Obj::Class(_) => Callee::Class,
                Obj::Closure(_) => Callee::Closure,
                Obj::Native(n) => Callee::Native(n.function),
                _ => Callee::NotCallable,
            },
            None => Callee::NotCallable,
        };

        match kind {
            Callee::Bound(receiver, method) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::Class => {
                let class = callee.as_obj().expect("class callee is an object");
                // New instances start from the class's default fields.
                let fields = self.heap.class(class).fields.clone();
                let instance = self.alloc(Obj::Instance(ObjInstance { class, fields }));
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Obj(instance);

                let initializer = self.heap.class(class).methods.get(&self.init_string).copied();
                match initializer {
                    Some(Value::Obj(init)) => self.call_closure(init, arg_count),
                    Some(_) => Err(self.runtime_error("Class initializer is not callable.")),
                    None if arg_count != 0 => Err(self
                        .runtime_error(format!("Expected 0 arguments but got {}.", arg_count))),
                    None => Ok(()),
                }
            }
            Callee::Closure => {
                self.call_closure(callee.as_obj().expect("closure callee is an object"), arg_count)
            }
            Callee::Native(function) => {
                let start = self.stack.len() - arg_count;
                let args: Vec<Value> = self.stack[start..].to_vec();
                match function(self, &args) {
                    Ok(result) => {
                        self.stack.truncate(start - 1);
                        self.push(result);
                        Ok(())
                    }
                    Err(message) => Err(self.runtime_error(message)),
                }
            }
            Callee::NotCallable => {
                Err(self.runtime_error("Can only call functions and classes."))
            }
        }
    }

    /// Re-entrant call used by natives (array `map` and friends): run
    /// the callee to completion and hand back its result.
    pub(crate) fn call_function(
        &mut self,
        callee: Value,
        args: &[Value],
    ) -> Result<Value, String> {
        let depth = self.frames.len();
        self.push(callee);
        for &arg in args {
            self.push(arg);
        }

        self.call_value(callee, args.len()).map_err(|e| e.message)?;
        if self.frames.len() > depth {
            self.run(depth).map_err(|e| e.message)
        } else {
            // A native callee already collapsed its slots.
            Ok(self.pop())
        }
    }

    fn invoke(&mut self, name: ObjRef, arg_count: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(arg_count);
        let Some(r) = receiver.as_obj() else {
            return Err(self.runtime_error("Only instances have methods."));
        };

        match self.tag(r) {
            Tag::Instance => {
                // A field holding a callable shadows any method.
                let field = self.heap.instance(r).fields.get(&name).copied();
                if let Some(value) = field {
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = value;
                    return self.call_value(value, arg_count);
                }
                let class = self.heap.instance(r).class;
                self.invoke_from_class(class, name, arg_count)
            }
            // The fused property call must behave like GET_PROPERTY
            // followed by CALL, so tables invoke their entries.
            Tag::Table => {
                let entry = self.heap.table(r).entries.get(&Value::Obj(name)).copied();
                match entry {
                    Some(value) => {
                        let slot = self.stack.len() - arg_count - 1;
                        self.stack[slot] = value;
                        self.call_value(value, arg_count)
                    }
                    None => Err(self.runtime_error(format!(
                        "Undefined property '{}'.",
                        self.heap.string(name)
                    ))),
                }
            }
            _ => Err(self.runtime_error("Only instances have methods.")),
        }
    }

    fn invoke_from_class(
        &mut self,
        class: ObjRef,
        name: ObjRef,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let method = self.heap.class(class).methods.get(&name).copied();
        match method {
            Some(Value::Obj(closure)) => self.call_closure(closure, arg_count),
            _ => Err(
                self.runtime_error(format!("Undefined property '{}'.", self.heap.string(name)))
            ),
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), RuntimeError> {
        let method = self.heap.class(class).methods.get(&name).copied();
        let Some(Value::Obj(closure)) = method else {
            return Err(
                self.runtime_error(format!("Undefined property '{}'.", self.heap.string(name)))
            );
        };

        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method: closure }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // Upvalue lifecycle

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        // The list is sorted by descending slot; reuse an existing
        // open upvalue or splice a new one in place.
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            let open_slot =
                self.heap.upvalue(upvalue).open_slot().expect("open list holds open upvalues");
            if open_slot == slot {
                return upvalue;
            }
            if open_slot < slot {
                insert_at = i;
                break;
            }
        }

        let created = self.alloc(Obj::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Close every open upvalue pointing at `floor` or above: copy the
    /// stack slot into the upvalue and retarget it at itself.
    fn close_upvalues(&mut self, floor: usize) {
        while let Some(&first) = self.open_upvalues.first() {
            let slot = self.heap.upvalue(first).open_slot().expect("open list holds open upvalues");
            if slot < floor {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(first) = ObjUpvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    // Operator helpers

    fn both_instances(&self) -> bool {
        self.stack.len() >= 2
            && self.value_tag(self.peek(0)) == Some(Tag::Instance)
            && self.value_tag(self.peek(1)) == Some(Tag::Instance)
    }

    /// Rewrite a binary operator into an invocation of the matching
    /// dunder method. Both operands must be instances of one class.
    fn invoke_dunder(&mut self, name: ObjRef) -> Result<(), RuntimeError> {
        let lhs = self.peek(1).as_obj().expect("dunder lhs is an instance");
        let rhs = self.peek(0).as_obj().expect("dunder rhs is an instance");
        if self.heap.instance(lhs).class != self.heap.instance(rhs).class {
            return Err(self.runtime_error("Operands must be two instances of the same class."));
        }
        self.invoke(name, 1)
    }

    fn pop_number_operands(&mut self) -> Result<(f64, f64), RuntimeError> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        let b = self.pop().as_number().expect("checked above");
        let a = self.pop().as_number().expect("checked above");
        Ok((a, b))
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);

        match (self.value_tag(a), self.value_tag(b)) {
            (Some(Tag::String), Some(Tag::String)) => {
                let ar = a.as_obj().expect("string operand");
                let br = b.as_obj().expect("string operand");
                let joined = format!("{}{}", self.heap.string(ar), self.heap.string(br));
                let result = self.take_string(joined);
                self.pop();
                self.pop();
                self.push(Value::Obj(result));
                Ok(())
            }
            (Some(Tag::Table), Some(Tag::Table)) => {
                // Merge; the right operand's entries win on key clashes.
                let ar = a.as_obj().expect("table operand");
                let br = b.as_obj().expect("table operand");
                let mut entries = self.heap.table(ar).entries.clone();
                for (&k, &v) in self.heap.table(br).entries.iter() {
                    entries.insert(k, v);
                }
                let merged = self.alloc(Obj::Table(ObjTable { entries }));
                self.pop();
                self.pop();
                self.push(Value::Obj(merged));
                Ok(())
            }
            (Some(Tag::Array), Some(Tag::Array)) => {
                let ar = a.as_obj().expect("array operand");
                let br = b.as_obj().expect("array operand");
                let mut values = self.heap.array(ar).values.clone();
                values.extend_from_slice(&self.heap.array(br).values);
                let joined = self.alloc(Obj::Array(crate::object::ObjArray { values }));
                self.pop();
                self.pop();
                self.push(Value::Obj(joined));
                Ok(())
            }
            (Some(Tag::Instance), Some(Tag::Instance)) => self.invoke_dunder(self.dunders.add),
            _ => {
                if a.is_number() && b.is_number() {
                    let (a, b) = self.pop_number_operands()?;
                    self.push(Value::Number(a + b));
                    Ok(())
                } else {
                    Err(self.runtime_error("Operands must be two joinable types."))
                }
            }
        }
    }

    fn op_arith(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        if self.both_instances() {
            let name = match op {
                OpCode::Subtract => self.dunders.sub,
                OpCode::Multiply => self.dunders.mul,
                OpCode::Divide => self.dunders.div,
                OpCode::Modulo => self.dunders.modulo,
                OpCode::BitwiseAnd => self.dunders.bit_and,
                OpCode::BitwiseOr => self.dunders.bit_or,
                OpCode::BitwiseXor => self.dunders.bit_xor,
                _ => unreachable!("arith dispatch on non-arith opcode"),
            };
            return self.invoke_dunder(name);
        }

        let (a, b) = self.pop_number_operands()?;
        let result = match op {
            OpCode::Subtract => a - b,
            OpCode::Multiply => a * b,
            OpCode::Divide => a / b,
            OpCode::Modulo => {
                // Integer-truncated, like the bitwise family.
                let (ai, bi) = (a as i64, b as i64);
                if bi == 0 {
                    return Err(self.runtime_error("Modulo by zero."));
                }
                (ai % bi) as f64
            }
            OpCode::BitwiseAnd => ((a as i64) & (b as i64)) as f64,
            OpCode::BitwiseOr => ((a as i64) | (b as i64)) as f64,
            OpCode::BitwiseXor => ((a as i64) ^ (b as i64)) as f64,
            _ => unreachable!("arith dispatch on non-arith opcode"),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    fn op_shift(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_number_operands()?;
        let (ai, bi) = (a as i64, b as u32);
        let result = match op {
            OpCode::ShiftLeft => ai.wrapping_shl(bi),
            OpCode::ShiftRight => ai.wrapping_shr(bi),
            _ => unreachable!("shift dispatch on non-shift opcode"),
        };
        self.push(Value::Number(result as f64));
        Ok(())
    }

    fn op_compare(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        if self.both_instances() {
            let name = match op {
                OpCode::Greater => self.dunders.gt,
                OpCode::Less => self.dunders.lt,
                _ => unreachable!("compare dispatch on non-compare opcode"),
            };
            return self.invoke_dunder(name);
        }

        let (a, b) = self.pop_number_operands()?;
        let result = match op {
            OpCode::Greater => a > b,
            OpCode::Less => a < b,
            _ => unreachable!("compare dispatch on non-compare opcode"),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    fn op_equal(&mut self) -> Result<(), RuntimeError> {
        if self.both_instances() {
            return self.invoke_dunder(self.dunders.eq);
        }
        let b = self.pop();
        let a = self.pop();
        self.push(Value::Bool(a == b));
        Ok(())
    }

    fn op_get_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let target = self.peek(0);
        let Some(r) = target.as_obj() else {
            return Err(self.runtime_error("Only instances and tables have properties."));
        };

        match self.tag(r) {
            Tag::Instance => {
                // Fields shadow methods.
                if let Some(value) = self.heap.instance(r).fields.get(&name).copied() {
                    self.pop();
                    self.push(value);
                    return Ok(());
                }
                let class = self.heap.instance(r).class;
                self.bind_method(class, name)
            }
            Tag::Table => {
                let entry = self.heap.table(r).entries.get(&Value::Obj(name)).copied();
                match entry {
                    Some(value) => {
                        self.pop();
                        self.push(value);
                        Ok(())
                    }
                    None => Err(self.runtime_error(format!(
                        "Undefined property '{}'.",
                        self.heap.string(name)
                    ))),
                }
            }
            _ => Err(self.runtime_error("Only instances and tables have properties.")),
        }
    }

    fn op_set_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let target = self.peek(1);
        let Some(r) = target.as_obj() else {
            return Err(self.runtime_error("Only instances and tables have fields."));
        };

        match self.tag(r) {
            Tag::Instance => {
                let value = self.peek(0);
                self.heap.instance_mut(r).fields.insert(name, value);
            }
            Tag::Table => {
                let value = self.peek(0);
                self.heap.table_mut(r).entries.insert(Value::Obj(name), value);
            }
            _ => return Err(self.runtime_error("Only instances and tables have fields.")),
        }

        // Assignment evaluates to the assigned value.
        let value = self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn op_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.peek(0);
        let target = self.peek(1);
        let Some(r) = target.as_obj() else {
            return Err(self.runtime_error("Only strings, tables and arrays can be indexed."));
        };

        match self.tag(r) {
            Tag::String if index.is_number() => {
                let i = index.as_number().expect("checked above") as i64;
                let ch =
                    if i >= 0 { self.heap.string(r).chars().nth(i as usize) } else { None };
                let Some(ch) = ch else {
                    return Err(self.runtime_error("String index out of bounds."));
                };
                let result = self.take_string(ch.to_string());
                self.pop();
                self.pop();
                self.push(Value::Obj(result));
                Ok(())
            }
            Tag::Array if index.is_number() => {
                let i = index.as_number().expect("checked above") as i64;
                let values = &self.heap.array(r).values;
                if i < 0 || i as usize >= values.len() {
                    return Err(self.runtime_error("Array index out of bounds."));
                }
                let value = values[i as usize];
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            Tag::Table => {
                let entry = self.heap.table(r).entries.get(&index).copied();
                match entry {
                    Some(value) => {
                        self.pop();
                        self.pop();
                        self.push(value);
                        Ok(())
                    }
                    None => Err(self.runtime_error(format!(
                        "Undefined table property '{}'.",
                        format_value(&self.heap, index)
                    ))),
                }
            }
            _ => Err(self.runtime_error("Only strings, tables and arrays can be indexed.")),
        }
    }

    fn op_set_index(&mut self) -> Result<(), RuntimeError> {
        let target = self.peek(2);
        let Some(r) = target.as_obj() else {
            return Err(self.runtime_error("Only strings, tables and arrays have indexes."));
        };

        match self.tag(r) {
            Tag::Table => {
                let value = self.pop();
                let index = self.pop();
                let table = self.pop();
                self.heap.table_mut(r).entries.insert(index, value);
                self.push(table);
                Ok(())
            }
            Tag::Array => {
                let index = self.peek(1);
                let Some(i) = index.as_number() else {
                    return Err(self.runtime_error("Index must be a number."));
                };
                let i = i as i64;
                if i < 0 || i as usize >= self.heap.array(r).values.len() {
                    return Err(self.runtime_error("Index out of bounds."));
                }
                let value = self.pop();
                self.pop();
                let array = self.pop();
                self.heap.array_mut(r).values[i as usize] = value;
                self.push(array);
                Ok(())
            }
            // Interning makes in-place string mutation unsound, so it
            // is rejected outright.
            Tag::String => Err(self.runtime_error("Strings are immutable.")),
            _ => Err(self.runtime_error("Only strings, tables and arrays have indexes.")),
        }
    }

    fn op_closure(&mut self) -> Result<(), RuntimeError> {
        let Value::Obj(function) = self.read_constant() else {
            return Err(self.runtime_error("Closure constant is not a function."));
        };
        let upvalue_count = self.heap.function(function).upvalue_count;

        let closure = self.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::Obj(closure));

        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let slot = self.frame().base + index;
                self.capture_upvalue(slot)
            } else {
                self.heap.closure(self.frame().closure).upvalues[index]
            };
            match self.heap.get_mut(closure) {
                Obj::Closure(c) => c.upvalues.push(upvalue),
                _ => unreachable!("closure just allocated"),
            }
        }
        Ok(())
    }

    fn define_method(&mut self, name: ObjRef) {
        let method = self.peek(0);
        let class = self.peek(1).as_obj().expect("class under method on stack");
        self.heap.class_mut(class).methods.insert(name, method);
        self.pop();
    }

    fn define_property(&mut self, name: ObjRef) {
        let field = self.peek(0);
        let class = self.peek(1).as_obj().expect("class under field on stack");
        self.heap.class_mut(class).fields.insert(name, field);
        self.pop();
    }

    /// The dispatch loop. Runs until the frame stack shrinks back to
    /// `exit_depth`, then returns the returning function's result.
    fn run(&mut self, exit_depth: usize) -> Result<Value, RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(byte) => {
                    return Err(self.runtime_error(format!("Unknown opcode {}.", byte)));
                }
            };

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let top = self.peek(0);
                    self.push(top);
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let value = self.stack[self.frame().base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(&name).copied() {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.heap.string(name)
                            )));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    if !self.globals.contains_key(&name) {
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.heap.string(name)
                        )));
                    }
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue) {
                        ObjUpvalue::Open(stack_slot) => self.stack[*stack_slot],
                        ObjUpvalue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue_mut(upvalue) {
                        ObjUpvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.stack[stack_slot] = value;
                        }
                        ObjUpvalue::Closed(closed) => *closed = value,
                    }
                }
                OpCode::GetProperty => self.op_get_property()?,
                OpCode::SetProperty => self.op_set_property()?,
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj().expect("superclass on stack");
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => self.op_equal()?,
                OpCode::Greater | OpCode::Less => self.op_compare(op)?,
                OpCode::Add => self.op_add()?,
                OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Modulo
                | OpCode::BitwiseAnd
                | OpCode::BitwiseOr
                | OpCode::BitwiseXor => self.op_arith(op)?,
                OpCode::ShiftLeft | OpCode::ShiftRight => self.op_shift(op)?,
                OpCode::Not => {
                    // `__not` dispatches only when two instances are
                    // on top of the stack; everything else is the
                    // plain falsey test.
                    if self.both_instances() {
                        self.invoke_dunder(self.dunders.not)?;
                    } else {
                        let value = self.pop();
                        self.push(Value::Bool(is_falsey(value)));
                    }
                }
                OpCode::Negate => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Increment => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(n + 1.0));
                }
                OpCode::Decrement => {
                    let Some(n) = self.peek(0).as_number() else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(n - 1.0));
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("no active call frame").ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if is_falsey(self.peek(0)) {
                        self.frames.last_mut().expect("no active call frame").ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("no active call frame").ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop().as_obj().expect("superclass on stack");
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => self.op_closure()?,
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("no active call frame");
                    self.close_upvalues(frame.base);

                    self.stack.truncate(frame.base);
                    if self.frames.len() == exit_depth {
                        return Ok(result);
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.alloc(Obj::Class(ObjClass {
                        name,
                        methods: AHashMap::new(),
                        fields: AHashMap::new(),
                    }));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let valid = self.value_tag(superclass) == Some(Tag::Class);
                    if !valid {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    let sup = superclass.as_obj().expect("checked above");
                    let sub = self.peek(0).as_obj().expect("subclass on stack");
                    let methods = self.heap.class(sup).methods.clone();
                    let subclass = self.heap.class_mut(sub);
                    for (name, method) in methods {
                        subclass.methods.insert(name, method);
                    }
                    self.pop(); // Subclass.
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
                OpCode::Property => {
                    let name = self.read_string();
                    self.define_property(name);
                }
                OpCode::Index => self.op_index()?,
                OpCode::SetIndex => self.op_set_index()?,
                OpCode::SetTable => {
                    let count = self.read_byte() as usize;
                    let table = self.alloc(Obj::Table(ObjTable::default()));
                    for _ in 0..count {
                        let value = self.pop();
                        let key = self.pop();
                        self.heap.table_mut(table).entries.insert(key, value);
                    }
                    self.push(Value::Obj(table));
                }
                OpCode::SetArray => {
                    let count = self.read_byte() as usize;
                    let array = self.alloc(Obj::Array(crate::object::ObjArray::default()));
                    let start = self.stack.len() - count;
                    for i in 0..count {
                        let value = self.stack[start + i];
                        self.heap.array_mut(array).values.push(value);
                    }
                    self.stack.truncate(start);
                    self.push(Value::Obj(array));
                }
                OpCode::Dump => {
                    let value = self.pop();
                    let text = format_value(&self.heap, value);
                    let _ = writeln!(self.out, "{}", text);
                }
            }
        }
    }

    /// Write program output (used by the print natives).
    pub(crate) fn write_output(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}
