// Garbage collector integration tests. Stress mode collects before
// every allocation, so these programs survive collections at every
// possible safepoint; the assertions check that nothing reachable was
// freed and that garbage actually goes away.

use std::io::Write;
use std::sync::{Arc, Mutex};

use lume::vm::Vm;

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn stressed_vm() -> (Vm, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(Box::new(buffer.clone()));
    vm.set_gc_stress(true);
    (vm, buffer)
}

#[test]
fn closures_survive_collection_at_every_safepoint() {
    let (mut vm, buffer) = stressed_vm();
    vm.interpret(
        "fun makeCounter() { let n = 0; fun inc() { n = n + 1; return n; } return inc; }
         let c = makeCounter();
         dump c();
         dump c();
         dump c();",
    )
    .expect("program should run under GC stress");
    assert_eq!(buffer.contents(), "1\n2\n3\n");
}

#[test]
fn classes_and_dunders_survive_collection() {
    let (mut vm, buffer) = stressed_vm();
    vm.interpret(
        "class V { init(a) { this.a = a; } __add(o) { return V(this.a + o.a); } }
         let total = V(0);
         for (let i = 1; i <= 5; i = i + 1) {
           total = total + V(i);
         }
         dump total.a;",
    )
    .expect("program should run under GC stress");
    assert_eq!(buffer.contents(), "15\n");
}

#[test]
fn string_churn_is_collected() {
    let (mut vm, buffer) = stressed_vm();
    vm.interpret(
        "let keep = \"\";
         for (let i = 0; i < 50; i = i + 1) {
           // Each iteration makes throwaway concatenations.
           let waste = \"aaaa\" + \"bbbb\" + \"cccc\";
           keep = keep + \"x\";
         }
         dump len(keep);",
    )
    .expect("program should run under GC stress");
    assert_eq!(buffer.contents(), "50\n");

    // The throwaway strings must not accumulate: well under one object
    // per loop iteration survives.
    assert!(vm.heap().object_count() < 200, "object count: {}", vm.heap().object_count());
}

#[test]
fn reachable_aggregates_keep_their_contents() {
    let (mut vm, buffer) = stressed_vm();
    vm.interpret(
        "let rows = [];
         let array = module(\"array\");
         for (let i = 0; i < 10; i = i + 1) {
           array.push(rows, { id: i, name: \"row\" + sprint(i) });
         }
         dump len(rows);
         dump rows[7].id;
         dump rows[7].name;",
    )
    .expect("program should run under GC stress");
    assert_eq!(buffer.contents(), "10\n7\nrow7\n");
}

#[test]
fn interned_strings_stay_stable_across_collections() {
    let (mut vm, buffer) = stressed_vm();
    vm.interpret("let a = \"stable\";").expect("first chunk should run");
    vm.interpret(
        "let b = \"sta\" + \"ble\";
         dump a == b;",
    )
    .expect("second chunk should run");
    assert_eq!(buffer.contents(), "true\n");
}

#[test]
fn dead_globals_are_reclaimed_when_overwritten() {
    let (mut vm, _buffer) = stressed_vm();
    vm.interpret(
        "let blob = [];
         let array = module(\"array\");
         for (let i = 0; i < 100; i = i + 1) { array.push(blob, [i, i, i]); }",
    )
    .expect("allocation should run");
    let with_blob = vm.heap().object_count();

    vm.interpret("blob = nil;").expect("release should run");
    // The next interpret allocates, which is a safepoint, so the
    // now-unreachable rows get swept.
    vm.interpret("let tiny = \"t\" + \"iny\";").expect("allocating chunk should run");
    let after_release = vm.heap().object_count();

    assert!(
        after_release < with_blob,
        "expected fewer objects after release: {} -> {}",
        with_blob,
        after_release
    );
}

#[test]
fn upvalues_closed_by_returns_survive_collection() {
    let (mut vm, buffer) = stressed_vm();
    vm.interpret(
        "fun pair() {
           let shared = 0;
           fun set(n) { shared = n; }
           fun get() { return shared; }
           return [set, get];
         }
         let p = pair();
         let set = p[0];
         let get = p[1];
         set(99);
         dump get();",
    )
    .expect("program should run under GC stress");
    assert_eq!(buffer.contents(), "99\n");
}
