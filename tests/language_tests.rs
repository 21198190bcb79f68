// Integration tests for the Lume language core.
//
// These run complete programs through the public VM interface and
// check the captured `dump`/`print` output, the VM's globals, or the
// error that came back. Covered here:
// - closures and upvalue capture
// - classes, inheritance, initializers, operator dunders
// - control flow (if, while, for, switch, break, continue)
// - tables, arrays, strings, and indexing
// - runtime error messages and stack traces

use std::io::Write;
use std::sync::{Arc, Mutex};

use lume::errors::LumeError;
use lume::value::Value;
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

fn capture_vm() -> (Vm, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let vm = Vm::with_output(Box::new(buffer.clone()));
    (vm, buffer)
}

fn run(source: &str) -> String {
    let (mut vm, buffer) = capture_vm();
    vm.interpret(source).expect("program should run");
    buffer.contents()
}

fn run_runtime_error(source: &str) -> lume::errors::RuntimeError {
    let (mut vm, _buffer) = capture_vm();
    match vm.interpret(source) {
        Err(LumeError::Runtime(error)) => error,
        Err(LumeError::Compile(diagnostics)) => {
            panic!("expected runtime error, got compile errors: {:?}", diagnostics)
        }
        Ok(()) => panic!("expected runtime error, program ran"),
    }
}

// Closures

#[test]
fn closures_capture_by_reference() {
    let output = run(
        "fun makeCounter() { let n = 0; fun inc() { n = n + 1; return n; } return inc; }
         let c = makeCounter();
         dump c();
         dump c();
         dump c();",
    );
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let output = run(
        "fun make() {
           let v = 0;
           fun set(n) { v = n; }
           fun get() { return v; }
           return [set, get];
         }
         let pair = make();
         let s = pair[0];
         let g = pair[1];
         s(42);
         dump g();",
    );
    assert_eq!(output, "42\n");
}

#[test]
fn upvalues_close_when_their_scope_ends() {
    let output = run(
        "let f = nil;
         {
           let a = \"captured\";
           fun g() { return a; }
           f = g;
         }
         dump f();",
    );
    assert_eq!(output, "captured\n");
}

// Classes

#[test]
fn inheritance_and_super_calls() {
    let output = run(
        "class A { greet() { return \"A\"; } }
         class B < A { greet() { return super.greet() + \"B\"; } }
         dump B().greet();",
    );
    assert_eq!(output, "AB\n");
}

#[test]
fn initializer_returns_the_receiver() {
    let output = run(
        "class P { init(x) { this.x = x; } }
         dump P(7).x;",
    );
    assert_eq!(output, "7\n");
}

#[test]
fn bare_return_in_initializer_yields_the_instance() {
    let output = run(
        "class P { init(x) { if (x > 10) { this.x = 10; return; } this.x = x; } }
         dump P(50).x;
         dump P(3).x;",
    );
    assert_eq!(output, "10\n3\n");
}

#[test]
fn methods_bind_their_receiver() {
    let output = run(
        "class Greeter { init(word) { this.word = word; } greet() { return this.word; } }
         let m = Greeter(\"hello\").greet;
         dump m();",
    );
    assert_eq!(output, "hello\n");
}

#[test]
fn fields_shadow_methods_on_invoke() {
    let output = run(
        "class A { m() { return \"method\"; } }
         fun shadow() { return \"field\"; }
         let a = A();
         a.m = shadow;
         dump a.m();",
    );
    assert_eq!(output, "field\n");
}

#[test]
fn inherited_methods_survive_override_in_subclass_only() {
    let output = run(
        "class A { who() { return \"A\"; } other() { return \"other\"; } }
         class B < A { who() { return \"B\"; } }
         dump A().who();
         dump B().who();
         dump B().other();",
    );
    assert_eq!(output, "A\nB\nother\n");
}

#[test]
fn super_without_call_binds_the_method() {
    let output = run(
        "class A { name() { return \"A\"; } }
         class B < A { name() { let m = super.name; return m(); } }
         dump B().name();",
    );
    assert_eq!(output, "A\n");
}

// Operator dunders

#[test]
fn add_dunder_overloads_plus() {
    let output = run(
        "class V { init(a) { this.a = a; } __add(o) { return V(this.a + o.a); } }
         dump (V(2) + V(3)).a;",
    );
    assert_eq!(output, "5\n");
}

#[test]
fn comparison_and_equality_dunders_dispatch() {
    let output = run(
        "class V {
           init(a) { this.a = a; }
           __lt(o) { return this.a < o.a; }
           __eq(o) { return this.a == o.a; }
         }
         dump V(1) < V(2);
         dump V(2) == V(2);
         dump V(1) == V(2);",
    );
    assert_eq!(output, "true\ntrue\nfalse\n");
}

#[test]
fn dunders_require_instances_of_the_same_class() {
    let error = run_runtime_error(
        "class A { init() { this.x = 1; } __add(o) { return 1; } }
         class B { init() { this.x = 1; } }
         dump A() + B();",
    );
    assert_eq!(error.message, "Operands must be two instances of the same class.");
}

// Control flow

#[test]
fn switch_selects_one_case_without_fallthrough() {
    let output = run(
        "let x = 2;
         switch (x) {
           case 1: dump \"a\";
           case 2: dump \"b\";
           default: dump \"c\";
         }",
    );
    assert_eq!(output, "b\n");
}

#[test]
fn switch_runs_default_when_nothing_matches() {
    let output = run(
        "switch (9) {
           case 1: dump \"a\";
           default: dump \"c\";
         }",
    );
    assert_eq!(output, "c\n");
}

#[test]
fn switch_with_no_match_and_no_default_is_balanced() {
    let output = run(
        "switch (9) { case 1: dump \"a\"; }
         dump \"after\";",
    );
    assert_eq!(output, "after\n");
}

#[test]
fn break_exits_a_for_loop() {
    let output = run("for (let i = 0; i < 10; i = i + 1) { if (i == 3) { break; } dump i; }");
    assert_eq!(output, "0\n1\n2\n");
}

#[test]
fn for_loop_runs_exactly_n_times() {
    assert_eq!(run("for (let i = 0; i < 0; i = i + 1) { dump i; }"), "");
    assert_eq!(run("for (let i = 0; i < 3; i = i + 1) { dump i; }"), "0\n1\n2\n");
}

#[test]
fn continue_jumps_to_the_loop_increment() {
    let output =
        run("for (let i = 0; i < 6; i = i + 1) { if (i % 2 == 1) { continue; } dump i; }");
    assert_eq!(output, "0\n2\n4\n");
}

#[test]
fn continue_targets_the_innermost_loop() {
    let output = run(
        "for (let i = 0; i < 2; i = i + 1) {
           for (let j = 0; j < 3; j = j + 1) {
             if (j == 1) { continue; }
             dump i * 10 + j;
           }
         }",
    );
    assert_eq!(output, "0\n2\n10\n12\n");
}

#[test]
fn while_loops_and_compound_assignment() {
    let output = run("let n = 1; while (n < 20) { n *= 2; } dump n;");
    assert_eq!(output, "32\n");
}

#[test]
fn logical_operators_short_circuit() {
    let output = run(
        "dump false and boom();
         dump 1 or boom();
         dump nil or \"fallback\";
         dump true and \"rhs\";",
    );
    assert_eq!(output, "false\n1\nfallback\nrhs\n");
}

// Expressions and literals

#[test]
fn radix_literals_evaluate_to_their_values() {
    let output = run("dump 0xff; dump 0b1010; dump 0o77; dump 3.5;");
    assert_eq!(output, "255\n10\n63\n3.5\n");
}

#[test]
fn arithmetic_and_bitwise_operators() {
    let output = run(
        "dump 7 % 3;
         dump 6 & 3;
         dump 6 | 3;
         dump 6 ^ 3;
         dump 1 + 2 * 3;
         dump -(4 - 9);",
    );
    assert_eq!(output, "1\n2\n7\n5\n7\n5\n");
}

#[test]
fn comparison_duals_behave() {
    let output = run("dump 2 <= 2; dump 2 >= 3; dump 1 != 2; dump !true;");
    assert_eq!(output, "true\nfalse\ntrue\nfalse\n");
}

#[test]
fn compound_assignment_applies_var_op_operand() {
    let output = run(
        "let x = 10; x -= 4; dump x;
         let y = 10; y /= 2; dump y;
         let z = 3; z += 2; dump z;",
    );
    assert_eq!(output, "6\n5\n5\n");
}

#[test]
fn string_concatenation_is_associative() {
    let output = run(
        "let a = \"x\"; let b = \"y\"; let c = \"z\";
         dump (a + b) + c == a + (b + c);",
    );
    assert_eq!(output, "true\n");
}

#[test]
fn interned_strings_compare_equal_by_identity() {
    let output = run("dump \"ab\" == \"a\" + \"b\";");
    assert_eq!(output, "true\n");
}

#[test]
fn let_binding_preserves_the_value() {
    let output = run("let x = 2 + 3 * 4; dump x; dump 2 + 3 * 4;");
    assert_eq!(output, "14\n14\n");
}

// Tables and arrays

#[test]
fn table_literals_and_property_access() {
    let output = run(
        "let t = { a: 1, \"b c\": 2, 3: \"x\" };
         dump t.a;
         dump t[\"b c\"];
         dump t[3];
         t.a = 5;
         dump t.a;
         t[\"k\"] = \"v\";
         dump t.k;
         dump len(t);",
    );
    assert_eq!(output, "1\n2\nx\n5\nv\n4\n");
}

#[test]
fn table_merge_is_right_biased() {
    let output = run(
        "let merged = { a: 1, b: 2 } + { a: 9 };
         dump merged.a;
         dump merged.b;
         dump len(merged);",
    );
    assert_eq!(output, "9\n2\n2\n");
}

#[test]
fn array_literals_index_and_concat() {
    let output = run(
        "let a = [1, 2, 3];
         dump a[0];
         a[1] = 9;
         dump a[1];
         dump len(a);
         let b = a + [4];
         dump len(b);
         dump b[3];",
    );
    assert_eq!(output, "1\n9\n3\n4\n4\n");
}

#[test]
fn aggregates_compare_by_reference() {
    let output = run(
        "let a = [1];
         let b = [1];
         let c = a;
         dump a == b;
         dump a == c;",
    );
    assert_eq!(output, "false\ntrue\n");
}

#[test]
fn string_indexing_returns_one_character_strings() {
    let output = run("let s = \"lume\"; dump s[0]; dump s[3];");
    assert_eq!(output, "l\ne\n");
}

#[test]
fn strings_reject_index_assignment() {
    let error = run_runtime_error("let s = \"abc\"; s[0] = \"x\";");
    assert_eq!(error.message, "Strings are immutable.");
}

// Runtime errors

#[test]
fn undefined_variable_reports_its_name() {
    let error = run_runtime_error("dump missing;");
    assert_eq!(error.message, "Undefined variable 'missing'.");
}

#[test]
fn assigning_an_undefined_global_is_an_error() {
    let error = run_runtime_error("missing = 1;");
    assert_eq!(error.message, "Undefined variable 'missing'.");
}

#[test]
fn arity_mismatch_reports_expected_and_got() {
    let error = run_runtime_error("fun f(a, b) { return a; } f(1);");
    assert_eq!(error.message, "Expected 2 arguments but got 1.");
}

#[test]
fn class_without_init_rejects_arguments() {
    let error = run_runtime_error("class A { } A(1);");
    assert_eq!(error.message, "Expected 0 arguments but got 1.");
}

#[test]
fn calling_a_non_callable_is_an_error() {
    let error = run_runtime_error("let x = 3; x();");
    assert_eq!(error.message, "Can only call functions and classes.");
}

#[test]
fn adding_mismatched_types_is_an_error() {
    let error = run_runtime_error("dump 1 + \"a\";");
    assert_eq!(error.message, "Operands must be two joinable types.");
}

#[test]
fn negating_a_non_number_is_an_error() {
    let error = run_runtime_error("dump -\"a\";");
    assert_eq!(error.message, "Operand must be a number.");
}

#[test]
fn modulo_by_zero_is_an_error() {
    let error = run_runtime_error("dump 1 % 0;");
    assert_eq!(error.message, "Modulo by zero.");
}

#[test]
fn array_index_out_of_bounds_is_an_error() {
    let error = run_runtime_error("let a = [1]; dump a[5];");
    assert_eq!(error.message, "Array index out of bounds.");
    let error = run_runtime_error("let s = \"ab\"; dump s[9];");
    assert_eq!(error.message, "String index out of bounds.");
}

#[test]
fn missing_table_key_is_an_error() {
    let error = run_runtime_error("let t = { a: 1 }; dump t.b;");
    assert_eq!(error.message, "Undefined property 'b'.");
}

#[test]
fn undefined_method_is_an_error() {
    let error = run_runtime_error("class A { } A().poke();");
    assert_eq!(error.message, "Undefined property 'poke'.");
}

#[test]
fn properties_require_instances_or_tables() {
    let error = run_runtime_error("dump (3).x;");
    assert_eq!(error.message, "Only instances and tables have properties.");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let error = run_runtime_error("fun f() { return f(); } f();");
    assert_eq!(error.message, "Stack overflow.");
}

#[test]
fn inheriting_from_a_non_class_is_an_error() {
    let error = run_runtime_error("let NotAClass = 3; class B < NotAClass { }");
    assert_eq!(error.message, "Superclass must be a class.");
}

#[test]
fn runtime_errors_carry_a_stack_trace() {
    let error = run_runtime_error(
        "fun inner() { return missing; }
         fun outer() { return inner(); }
         outer();",
    );
    assert_eq!(error.trace.len(), 3);
    assert_eq!(error.trace[0].function.as_deref(), Some("inner"));
    assert_eq!(error.trace[1].function.as_deref(), Some("outer"));
    assert_eq!(error.trace[2].function, None);
    assert_eq!(error.trace[0].line, 1);
}

// VM surface

#[test]
fn stack_is_balanced_after_every_statement() {
    let (mut vm, _buffer) = capture_vm();
    for source in [
        "let a = 1;",
        "dump a;",
        "a = a + 1;",
        "if (a > 0) { dump a; } else { dump 0; }",
        "for (let i = 0; i < 3; i = i + 1) { a += i; }",
        "fun f(x) { return x * 2; } dump f(a);",
        "switch (a) { case 1: dump 1; default: dump 2; }",
    ] {
        vm.interpret(source).expect("statement should run");
        assert_eq!(vm.stack_depth(), 0, "stack unbalanced after {:?}", source);
    }
}

#[test]
fn globals_persist_across_interpret_calls() {
    let (mut vm, buffer) = capture_vm();
    vm.interpret("let counter = 41;").expect("define should run");
    vm.interpret("counter = counter + 1;").expect("update should run");
    vm.interpret("dump counter;").expect("dump should run");
    assert_eq!(buffer.contents(), "42\n");
    assert_eq!(vm.get_global("counter"), Some(Value::Number(42.0)));
}

#[test]
fn top_level_this_and_return_are_compile_errors() {
    let (mut vm, _buffer) = capture_vm();
    for source in ["return 1;", "dump this;", "dump super.x;"] {
        match vm.interpret(source) {
            Err(LumeError::Compile(_)) => {}
            other => panic!("expected compile error for {:?}, got {:?}", source, other),
        }
    }
}
