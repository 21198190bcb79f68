// File: src/heap.rs
//
// The managed heap: an arena of objects addressed by ObjRef handles,
// the string intern table, and the mark-sweep collector. The VM decides
// *when* to collect (every allocation is a safepoint) and supplies the
// roots; the heap does the marking, tracing, and sweeping.

use std::rc::Rc;
use std::sync::OnceLock;

use ahash::AHashMap;

use crate::object::{Obj, ObjRef};
use crate::value::Value;

/// Collections start once this many bytes are live, then back off by
/// `HEAP_GROW_FACTOR` after each cycle.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

static GC_LOG: OnceLock<bool> = OnceLock::new();

fn gc_log_enabled() -> bool {
    *GC_LOG.get_or_init(|| std::env::var("LUME_GC_LOG").is_ok())
}

pub struct Heap {
    objects: Vec<Option<Obj>>,
    marked: Vec<bool>,
    free: Vec<u32>,
    gray: Vec<ObjRef>,
    strings: AHashMap<Rc<str>, ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: Vec::new(),
            marked: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            strings: AHashMap::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stress: std::env::var("LUME_GC_STRESS").is_ok(),
        }
    }

    /// Collect on every allocation. Used by the GC tests.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    /// True when the next allocation should run a collection first.
    /// The caller (the VM) owns the roots, so it drives the cycle.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects. Diagnostic only.
    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|slot| slot.is_some()).count()
    }

    /// Place an object in the arena. Never collects; the VM checks
    /// `should_collect` (with its roots on the stack) before calling.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += approximate_size(&obj);

        if let Some(index) = self.free.pop() {
            self.objects[index as usize] = Some(obj);
            self.marked[index as usize] = false;
            ObjRef(index)
        } else {
            self.objects.push(Some(obj));
            self.marked.push(false);
            ObjRef((self.objects.len() - 1) as u32)
        }
    }

    /// Intern a string, reusing the existing object when the same bytes
    /// are already on the heap. After this, string equality is handle
    /// equality.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        if let Some(&existing) = self.strings.get(text) {
            return existing;
        }
        let rc: Rc<str> = Rc::from(text);
        let r = self.alloc(Obj::String(rc.clone()));
        self.strings.insert(rc, r);
        r
    }

    /// Intern an owned string (the `take_string` path: reuses the
    /// buffer when the bytes are new).
    pub fn take_string(&mut self, text: String) -> ObjRef {
        if let Some(&existing) = self.strings.get(text.as_str()) {
            return existing;
        }
        let rc: Rc<str> = Rc::from(text);
        let r = self.alloc(Obj::String(rc.clone()));
        self.strings.insert(rc, r);
        r
    }

    /// Look up an already-interned string without allocating.
    pub fn find_interned(&self, text: &str) -> Option<ObjRef> {
        self.strings.get(text).copied()
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.objects[r.0 as usize].as_ref().expect("use of freed object")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.objects[r.0 as usize].as_mut().expect("use of freed object")
    }

    // Typed accessors. The bytecode is well-formed, so a tag mismatch
    // here is a VM bug, not a user error.

    pub fn string(&self, r: ObjRef) -> &str {
        match self.get(r) {
            Obj::String(s) => s,
            other => panic!("expected string, found {:?}", other),
        }
    }

    pub fn function(&self, r: ObjRef) -> &crate::object::ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {:?}", other),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::ObjClosure {
        match self.get(r) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {:?}", other),
        }
    }

    pub fn class(&self, r: ObjRef) -> &crate::object::ObjClass {
        match self.get(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjClass {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {:?}", other),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &crate::object::ObjInstance {
        match self.get(r) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjInstance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {:?}", other),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &crate::object::ObjUpvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjUpvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {:?}", other),
        }
    }

    pub fn table(&self, r: ObjRef) -> &crate::object::ObjTable {
        match self.get(r) {
            Obj::Table(t) => t,
            other => panic!("expected table, found {:?}", other),
        }
    }

    pub fn table_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjTable {
        match self.get_mut(r) {
            Obj::Table(t) => t,
            other => panic!("expected table, found {:?}", other),
        }
    }

    pub fn array(&self, r: ObjRef) -> &crate::object::ObjArray {
        match self.get(r) {
            Obj::Array(a) => a,
            other => panic!("expected array, found {:?}", other),
        }
    }

    pub fn array_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjArray {
        match self.get_mut(r) {
            Obj::Array(a) => a,
            other => panic!("expected array, found {:?}", other),
        }
    }

    // Mark phase. Roots are fed in by the VM through `mark_value` and
    // `mark_object`; `trace_references` drains the gray worklist.

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let index = r.0 as usize;
        if self.marked[index] || self.objects[index].is_none() {
            return;
        }
        self.marked[index] = true;
        self.gray.push(r);
    }

    /// Drain the gray worklist, blackening each object by marking
    /// everything it references.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        let Heap { objects, marked, gray, .. } = self;
        let obj = objects[r.0 as usize].as_ref().expect("tracing a freed object");

        match obj {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    mark_raw(objects, marked, gray, name);
                }
                for &constant in &f.chunk.constants {
                    mark_value_raw(objects, marked, gray, constant);
                }
            }
            Obj::Closure(c) => {
                mark_raw(objects, marked, gray, c.function);
                for &upvalue in &c.upvalues {
                    mark_raw(objects, marked, gray, upvalue);
                }
            }
            Obj::Upvalue(u) => {
                // An open upvalue's slot is reached through the stack
                // roots; only the closed copy needs tracing.
                if let crate::object::ObjUpvalue::Closed(v) = u {
                    mark_value_raw(objects, marked, gray, *v);
                }
            }
            Obj::Class(c) => {
                mark_raw(objects, marked, gray, c.name);
                for (&k, &v) in c.methods.iter().chain(c.fields.iter()) {
                    mark_raw(objects, marked, gray, k);
                    mark_value_raw(objects, marked, gray, v);
                }
            }
            Obj::Instance(i) => {
                mark_raw(objects, marked, gray, i.class);
                for (&k, &v) in &i.fields {
                    mark_raw(objects, marked, gray, k);
                    mark_value_raw(objects, marked, gray, v);
                }
            }
            Obj::BoundMethod(b) => {
                mark_value_raw(objects, marked, gray, b.receiver);
                mark_raw(objects, marked, gray, b.method);
            }
            Obj::Table(t) => {
                for (&k, &v) in &t.entries {
                    mark_value_raw(objects, marked, gray, k);
                    mark_value_raw(objects, marked, gray, v);
                }
            }
            Obj::Array(a) => {
                for &v in &a.values {
                    mark_value_raw(objects, marked, gray, v);
                }
            }
        }
    }

    /// Drop intern-table entries whose strings did not get marked, so
    /// the table never resurrects a dead string (weak semantics).
    pub fn remove_unmarked_strings(&mut self) {
        let marked = &self.marked;
        self.strings.retain(|_, r| marked[r.0 as usize]);
    }

    /// Free every unmarked object and clear the marks on survivors.
    /// Returns the number of bytes reclaimed.
    pub fn sweep(&mut self) -> usize {
        let before = self.bytes_allocated;

        for index in 0..self.objects.len() {
            if self.objects[index].is_none() {
                continue;
            }
            if self.marked[index] {
                self.marked[index] = false;
            } else {
                let freed = self.objects[index].take().expect("slot checked above");
                self.bytes_allocated =
                    self.bytes_allocated.saturating_sub(approximate_size(&freed));
                self.free.push(index as u32);
            }
        }

        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(FIRST_GC_THRESHOLD);

        let reclaimed = before - self.bytes_allocated;
        if gc_log_enabled() {
            eprintln!(
                "-- gc: collected {} bytes (from {} to {}), next at {}",
                reclaimed, before, self.bytes_allocated, self.next_gc
            );
        }
        reclaimed
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

fn mark_raw(objects: &[Option<Obj>], marked: &mut [bool], gray: &mut Vec<ObjRef>, r: ObjRef) {
    let index = r.0 as usize;
    if marked[index] || objects[index].is_none() {
        return;
    }
    marked[index] = true;
    gray.push(r);
}

fn mark_value_raw(
    objects: &[Option<Obj>],
    marked: &mut [bool],
    gray: &mut Vec<ObjRef>,
    value: Value,
) {
    if let Value::Obj(r) = value {
        mark_raw(objects, marked, gray, r);
    }
}

/// Coarse per-object size used for the collection trigger. Exact byte
/// accounting is not required, only monotone growth with real usage.
fn approximate_size(obj: &Obj) -> usize {
    use std::mem::size_of;

    let payload = match obj {
        Obj::String(s) => s.len(),
        Obj::Function(f) => {
            f.chunk.code.len()
                + f.chunk.lines.len() * size_of::<usize>()
                + f.chunk.constants.len() * size_of::<Value>()
        }
        Obj::Native(_) => 0,
        Obj::Closure(c) => c.upvalues.len() * size_of::<ObjRef>(),
        Obj::Upvalue(_) => 0,
        Obj::Class(c) => (c.methods.len() + c.fields.len()) * 2 * size_of::<Value>(),
        Obj::Instance(i) => i.fields.len() * 2 * size_of::<Value>(),
        Obj::BoundMethod(_) => 0,
        Obj::Table(t) => t.entries.len() * 2 * size_of::<Value>(),
        Obj::Array(a) => a.values.len() * size_of::<Value>(),
    };
    size_of::<Obj>() + payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjArray, ObjClosure, ObjFunction};
    use std::rc::Rc;

    #[test]
    fn interning_reuses_equal_strings() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string(a), "hello");
    }

    #[test]
    fn take_string_reuses_existing_interned_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern("abc");
        let b = heap.take_string(String::from("abc"));
        assert_eq!(a, b);
    }

    #[test]
    fn sweep_frees_unreachable_and_keeps_roots() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let _drop = heap.intern("drop");
        assert_eq!(heap.object_count(), 2);

        heap.mark_object(keep);
        heap.trace_references();
        heap.remove_unmarked_strings();
        heap.sweep();

        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.string(keep), "keep");
        // The dead string left the intern table, so re-interning the
        // same bytes allocates a fresh object in the freed slot.
        let again = heap.intern("drop");
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.string(again), "drop");
    }

    #[test]
    fn tracing_follows_closure_and_function_references() {
        let mut heap = Heap::new();
        let name = heap.intern("f");
        let constant = heap.intern("a constant");
        let mut chunk = crate::chunk::Chunk::new();
        chunk.add_constant(Value::Obj(constant));
        let function = heap.alloc(Obj::Function(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Rc::new(chunk),
            name: Some(name),
        }));
        let closure =
            heap.alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::new() }));

        heap.mark_object(closure);
        heap.trace_references();
        heap.remove_unmarked_strings();
        heap.sweep();

        // Everything is reachable from the closure.
        assert_eq!(heap.object_count(), 4);
        assert_eq!(heap.string(constant), "a constant");
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let dead = heap.alloc(Obj::Array(ObjArray::default()));
        heap.trace_references();
        heap.sweep();
        let recycled = heap.alloc(Obj::Array(ObjArray::default()));
        assert_eq!(dead.0, recycled.0);
    }
}
