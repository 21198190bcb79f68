// File: src/object.rs
//
// Heap object variants. Objects live in the Heap arena and reference
// each other (and stack values) through ObjRef handles; the collector
// owns the heap and everything else holds tracing references.

use std::rc::Rc;

use ahash::AHashMap;

use crate::chunk::Chunk;
use crate::value::Value;
use crate::vm::NativeFn;

/// Handle to a heap object. Copyable; equality is identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

/// The tagged sum of every heap object variant. Operations dispatch on
/// the tag with a single match, never through trait objects.
#[derive(Debug)]
pub enum Obj {
    /// Interned UTF-8 string; the intern table shares this allocation.
    String(Rc<str>),
    Function(ObjFunction),
    Native(ObjNative),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Table(ObjTable),
    Array(ObjArray),
}

/// A compiled function: parameter count, upvalue count, bytecode, and
/// an optional name (None for the top-level script).
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Rc<Chunk>,
    pub name: Option<ObjRef>,
}

/// A function implemented in Rust and callable from Lume code.
pub struct ObjNative {
    pub name: &'static str,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative").field("name", &self.name).finish()
    }
}

/// A function plus its captured environment. The upvalue list length
/// always equals the function's upvalue count.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. Open while its stack slot is live, closed once
/// the value has been copied into the upvalue itself.
#[derive(Debug)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

impl ObjUpvalue {
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            ObjUpvalue::Open(slot) => Some(*slot),
            ObjUpvalue::Closed(_) => None,
        }
    }
}

/// A class: name, method table, and default-field table. Method and
/// field keys are interned name strings.
#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    pub methods: AHashMap<ObjRef, Value>,
    pub fields: AHashMap<ObjRef, Value>,
}

/// An instance: its class and a per-instance field table, seeded from
/// the class's default fields at construction.
#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: AHashMap<ObjRef, Value>,
}

/// A method closure bound to a receiver.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

/// A hash table mapping arbitrary values to values.
#[derive(Debug, Default)]
pub struct ObjTable {
    pub entries: AHashMap<Value, Value>,
}

/// A dense sequence of values.
#[derive(Debug, Default)]
pub struct ObjArray {
    pub values: Vec<Value>,
}
