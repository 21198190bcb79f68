// File: src/natives/mod.rs
//
// The native function library. A handful of globals are installed at
// VM startup; everything else lives in named modules surfaced to user
// code through the `module` built-in, which returns a table of
// natives (plus any constants the module installs).

pub mod array;
pub mod file;
pub mod http;
pub mod math;
pub mod system;

use crate::object::{Obj, ObjNative, ObjRef, ObjTable};
use crate::value::{format_value, Value};
use crate::vm::{NativeFn, Vm};

/// A named module of native functions, with an optional hook that
/// installs constants into the module table after registration.
pub struct NativeModule {
    pub name: &'static str,
    pub fns: &'static [(&'static str, NativeFn)],
    pub constants: Option<fn(&mut Vm, ObjRef)>,
}

pub const MODULES: &[NativeModule] = &[
    NativeModule { name: "system", fns: system::FNS, constants: None },
    NativeModule { name: "math", fns: math::FNS, constants: Some(math::install_constants) },
    NativeModule { name: "file", fns: file::FNS, constants: Some(file::install_constants) },
    NativeModule { name: "http", fns: http::FNS, constants: None },
    NativeModule { name: "array", fns: array::FNS, constants: None },
];

/// Register the always-available globals.
pub fn install_globals(vm: &mut Vm) {
    vm.define_native("print", print);
    vm.define_native("sprint", sprint);
    vm.define_native("println", println);
    vm.define_native("len", len);
    vm.define_native("module", module);
}

/// Build the table for a named module. Every allocation is rooted on
/// the VM stack so a collection mid-build cannot free the pieces.
pub(crate) fn build_module(vm: &mut Vm, name: &str) -> Result<Value, String> {
    let module = MODULES
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| format!("Unknown module '{}'.", name))?;

    let table = vm.alloc(Obj::Table(ObjTable::default()));
    vm.push(Value::Obj(table));

    for &(fn_name, function) in module.fns {
        let name_ref = vm.intern(fn_name);
        vm.push(Value::Obj(name_ref));
        let native = vm.alloc(Obj::Native(ObjNative { name: fn_name, function }));
        vm.heap_mut().table_mut(table).entries.insert(Value::Obj(name_ref), Value::Obj(native));
        vm.pop();
    }

    if let Some(install) = module.constants {
        install(vm, table);
    }

    vm.pop();
    Ok(Value::Obj(table))
}

/// Insert `key: value` into a module table the caller has rooted.
pub(crate) fn set_table_entry(vm: &mut Vm, table: ObjRef, key: &str, value: Value) {
    vm.push(value);
    let name = vm.intern(key);
    vm.heap_mut().table_mut(table).entries.insert(Value::Obj(name), value);
    vm.pop();
}

pub(crate) fn check_arity(_name: &str, args: &[Value], expected: usize) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!("Expected {} arguments but got {}.", expected, args.len()));
    }
    Ok(())
}

pub(crate) fn number_arg(name: &str, args: &[Value], index: usize) -> Result<f64, String> {
    args.get(index)
        .and_then(Value::as_number)
        .ok_or_else(|| format!("{}() expects a number argument.", name))
}

pub(crate) fn string_arg(vm: &Vm, name: &str, args: &[Value], index: usize) -> Result<String, String> {
    match args.get(index) {
        Some(Value::Obj(r)) => match vm.heap().get(*r) {
            Obj::String(s) => Ok(s.to_string()),
            _ => Err(format!("{}() expects a string argument.", name)),
        },
        _ => Err(format!("{}() expects a string argument.", name)),
    }
}

fn joined(vm: &Vm, args: &[Value]) -> String {
    args.iter().map(|&v| format_value(vm.heap(), v)).collect::<Vec<_>>().join(" ")
}

fn print(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let text = joined(vm, args);
    vm.write_output(&text);
    Ok(Value::Nil)
}

fn println(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let mut text = joined(vm, args);
    text.push('\n');
    vm.write_output(&text);
    Ok(Value::Nil)
}

fn sprint(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let text = joined(vm, args);
    let r = vm.take_string(text);
    Ok(Value::Obj(r))
}

fn len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("len", args, 1)?;
    let length = match args[0] {
        Value::Obj(r) => match vm.heap().get(r) {
            Obj::String(s) => Some(s.chars().count()),
            Obj::Array(a) => Some(a.values.len()),
            Obj::Table(t) => Some(t.entries.len()),
            _ => None,
        },
        _ => None,
    };
    match length {
        Some(n) => Ok(Value::Number(n as f64)),
        None => Err("len() expects a string, array or table.".to_string()),
    }
}

fn module(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("module", args, 1)?;
    let name = string_arg(vm, "module", args, 0)?;
    build_module(vm, &name)
}
