// Integration tests for the native library: the always-present
// globals (print/sprint/println/len/module) and the system, math,
// file, and array modules. HTTP is exercised only as far as module
// construction; no test talks to the network.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lume::errors::LumeError;
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

fn run(source: &str) -> String {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(Box::new(buffer.clone()));
    vm.interpret(source).expect("program should run");
    buffer.contents()
}

fn run_runtime_error(source: &str) -> String {
    let mut vm = Vm::with_output(Box::new(SharedBuffer::default()));
    match vm.interpret(source) {
        Err(LumeError::Runtime(error)) => error.message,
        other => panic!("expected runtime error, got {:?}", other),
    }
}

fn unique_temp_path(prefix: &str) -> std::path::PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("lume_{}_{}_{}", prefix, std::process::id(), n))
}

// Globals

#[test]
fn print_and_println_write_to_the_output_sink() {
    let output = run("print(\"a\", 1); println(\"!\"); println(\"next\");");
    assert_eq!(output, "a 1!\nnext\n");
}

#[test]
fn sprint_formats_values_into_a_string() {
    let output = run("dump sprint(1, \"a\", true, nil);");
    assert_eq!(output, "1 a true nil\n");
}

#[test]
fn len_counts_characters_elements_and_entries() {
    let output = run("dump len(\"héllo\"); dump len([1, 2, 3]); dump len({ a: 1 });");
    assert_eq!(output, "5\n3\n1\n");
}

#[test]
fn len_rejects_numbers() {
    assert_eq!(run_runtime_error("len(3);"), "len() expects a string, array or table.");
}

#[test]
fn unknown_module_is_a_runtime_error() {
    assert_eq!(run_runtime_error("module(\"nope\");"), "Unknown module 'nope'.");
}

#[test]
fn native_errors_carry_a_stack_trace() {
    let mut vm = Vm::with_output(Box::new(SharedBuffer::default()));
    match vm.interpret("fun f() { return len(3); } f();") {
        Err(LumeError::Runtime(error)) => {
            assert_eq!(error.message, "len() expects a string, array or table.");
            assert_eq!(error.trace[0].function.as_deref(), Some("f"));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

// math

#[test]
fn math_module_functions_and_constants() {
    let output = run(
        "let math = module(\"math\");
         dump math.floor(2.9);
         dump math.ceil(2.1);
         dump math.abs(-4);
         dump math.sqrt(81);
         dump math.pow(2, 10);
         dump math.clamp(15, 0, 10);
         dump math.lerp(0, 10, 0.5);
         dump math.map(5, 0, 10, 0, 100);
         dump math.norm(5, 0, 10);
         dump math.PI > 3.14 and math.PI < 3.15;
         dump math.E > 2.71 and math.E < 2.72;",
    );
    assert_eq!(output, "2\n3\n4\n9\n1024\n10\n5\n50\n0.5\ntrue\ntrue\n");
}

#[test]
fn seeded_rand_is_reproducible() {
    let output = run(
        "let math = module(\"math\");
         math.seed(7);
         let a = math.rand(1000);
         math.seed(7);
         let b = math.rand(1000);
         dump a == b;
         dump a >= 0 and a < 1000;",
    );
    assert_eq!(output, "true\ntrue\n");
}

// system

#[test]
fn system_clock_and_time_return_numbers() {
    let output = run(
        "let system = module(\"system\");
         dump system.clock() >= 0;
         let t = system.time();
         dump t > 1000000000;
         dump system.mtime() >= t * 1000;",
    );
    assert_eq!(output, "true\ntrue\ntrue\n");
}

// file

#[test]
fn file_module_round_trips_through_a_temp_file() {
    let path = unique_temp_path("roundtrip");
    let path_str = path.to_string_lossy().to_string();

    let output = run(&format!(
        "let file = module(\"file\");
         let f = file.fopen(\"{path}\", \"w\");
         file.fwrite(f, \"line one\");
         file.fwrite(f, \"\nline two\n\");
         file.fclose(f);

         let r = file.fopen(\"{path}\", \"r\");
         dump file.fgets(r);
         dump file.fgets(r);
         dump file.fgets(r);
         file.fseek(r, 0, file.SEEK_SET);
         dump file.fread(r, 4);
         dump file.ftell(r);
         file.fclose(r);
         dump file.remove(\"{path}\");",
        path = path_str
    ));
    assert_eq!(output, "line one\nline two\nnil\nline\n4\ntrue\n");
}

#[test]
fn fgetc_and_fputc_work_one_character_at_a_time() {
    let path = unique_temp_path("chars");
    let path_str = path.to_string_lossy().to_string();

    let output = run(&format!(
        "let file = module(\"file\");
         let f = file.fopen(\"{path}\", \"w\");
         file.fputc(f, \"h\");
         file.fputc(f, \"é\");
         file.fputc(f, \"!\");
         file.fclose(f);

         let r = file.fopen(\"{path}\", \"r\");
         dump file.fgetc(r);
         dump file.fgetc(r);
         dump file.fgetc(r);
         dump file.fgetc(r);
         file.fclose(r);
         dump file.remove(\"{path}\");",
        path = path_str
    ));
    assert_eq!(output, "h\né\n!\nnil\ntrue\n");
}

#[test]
fn fputc_rejects_multi_character_strings() {
    let path = unique_temp_path("badchar");
    assert_eq!(
        run_runtime_error(&format!(
            "let file = module(\"file\");
             let f = file.fopen(\"{}\", \"w\");
             file.fputc(f, \"ab\");",
            path.to_string_lossy()
        )),
        "fputc() expects a single-character string."
    );
    let _ = std::fs::remove_file(path);
}

#[test]
fn tmpfile_round_trips_without_a_name() {
    let output = run(
        "let file = module(\"file\");
         let f = file.tmpfile();
         file.fwrite(f, \"scratch\");
         file.fseek(f, 0, file.SEEK_SET);
         dump file.fread(f, 7);
         file.fclose(f);",
    );
    assert_eq!(output, "scratch\n");
}

#[test]
fn mkstemps_creates_a_unique_named_file() {
    let template =
        std::env::temp_dir().join(format!("lume_stem_{}_XXXXXX.tmp", std::process::id()));
    let template_str = template.to_string_lossy().to_string();

    let output = run(&format!(
        "let file = module(\"file\");
         let t = file.mkstemps(\"{template}\", 4);
         file.fwrite(t.handle, \"named\");
         file.fclose(t.handle);

         let r = file.fopen(t.path, \"r\");
         dump file.fgets(r);
         file.fclose(r);
         dump file.remove(t.path);",
        template = template_str
    ));
    assert_eq!(output, "named\ntrue\n");
}

#[test]
fn mkstemps_requires_the_placeholder_run() {
    assert_eq!(
        run_runtime_error("module(\"file\").mkstemps(\"plain.tmp\", 4);"),
        "mkstemps() template needs 'XXXXXX' before the suffix."
    );
}

#[test]
fn fopen_missing_file_returns_nil() {
    let path = unique_temp_path("missing");
    let output = run(&format!(
        "let file = module(\"file\");
         dump file.fopen(\"{}\", \"r\");",
        path.to_string_lossy()
    ));
    assert_eq!(output, "nil\n");
}

// http (construction only)

#[test]
fn http_module_exposes_all_verbs() {
    let output = run("dump len(module(\"http\"));");
    assert_eq!(output, "7\n");
}

// array

#[test]
fn array_push_pop_insert_remove() {
    let output = run(
        "let array = module(\"array\");
         let a = [1, 2];
         array.push(a, 3);
         dump len(a);
         dump array.pop(a);
         array.insert(a, 0, 0);
         dump a[0];
         dump array.remove(a, 1);
         dump len(a);",
    );
    assert_eq!(output, "3\n3\n0\n1\n2\n");
}

#[test]
fn array_sort_reverse_find() {
    let output = run(
        "let array = module(\"array\");
         let a = [3, 1, 2];
         array.sort(a);
         dump a[0]; dump a[1]; dump a[2];
         array.reverse(a);
         dump a[0];
         dump array.find(a, 2);
         dump array.find(a, 99);
         dump array.findLast([1, 2, 1], 1);

         let s = [\"pear\", \"apple\"];
         array.sort(s);
         dump s[0];",
    );
    assert_eq!(output, "1\n2\n3\n3\n1\nnil\n2\napple\n");
}

#[test]
fn array_sort_rejects_mixed_elements() {
    assert_eq!(
        run_runtime_error("module(\"array\").sort([1, \"a\"]);"),
        "sort() requires all numbers or all strings."
    );
}

#[test]
fn array_map_filter_reduce_call_user_closures() {
    let output = run(
        "let array = module(\"array\");
         fun double(x) { return x * 2; }
         fun even(x) { return x % 2 == 0; }
         fun add(acc, x) { return acc + x; }

         let doubled = array.map([1, 2, 3], double);
         dump doubled[0]; dump doubled[2];

         let evens = array.filter([1, 2, 3, 4], even);
         dump len(evens); dump evens[1];

         dump array.reduce([1, 2, 3, 4], add, 0);",
    );
    assert_eq!(output, "2\n6\n2\n4\n10\n");
}

#[test]
fn array_flatten_lifts_one_level() {
    let output = run(
        "let array = module(\"array\");
         let flat = array.flatten([[1, 2], 3, [4]]);
         dump len(flat);
         dump flat[0]; dump flat[2]; dump flat[3];",
    );
    assert_eq!(output, "4\n1\n3\n4\n");
}

#[test]
fn callback_errors_propagate_out_of_map() {
    assert_eq!(
        run_runtime_error(
            "fun bad(x) { return missing; }
             module(\"array\").map([1], bad);"
        ),
        "Undefined variable 'missing'."
    );
}
