// File: src/natives/array.rs
//
// Array natives. `map`, `filter`, and `reduce` re-enter the VM to run
// user closures; result arrays stay rooted on the VM stack while the
// callbacks execute.

use super::check_arity;
use crate::object::{Obj, ObjArray, ObjRef};
use crate::value::{is_falsey, Value};
use crate::vm::{NativeFn, Vm};

pub const FNS: &[(&str, NativeFn)] = &[
    ("push", push),
    ("pop", pop),
    ("insert", insert),
    ("remove", remove),
    ("sort", sort),
    ("reverse", reverse),
    ("find", find),
    ("findLast", find_last),
    ("map", map),
    ("filter", filter),
    ("reduce", reduce),
    ("flatten", flatten),
];

fn array_arg(vm: &Vm, name: &str, args: &[Value], index: usize) -> Result<ObjRef, String> {
    match args.get(index) {
        Some(Value::Obj(r)) if matches!(vm.heap().get(*r), Obj::Array(_)) => Ok(*r),
        _ => Err(format!("{}() expects an array argument.", name)),
    }
}

fn index_arg(name: &str, args: &[Value], index: usize, len: usize) -> Result<usize, String> {
    let n = match args.get(index) {
        Some(Value::Number(n)) => *n as i64,
        _ => return Err(format!("{}() expects a numeric index.", name)),
    };
    if n < 0 || n as usize >= len {
        return Err("Index out of bounds.".to_string());
    }
    Ok(n as usize)
}

fn push(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("push", args, 2)?;
    let array = array_arg(vm, "push", args, 0)?;
    vm.heap_mut().array_mut(array).values.push(args[1]);
    Ok(Value::Obj(array))
}

fn pop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("pop", args, 1)?;
    let array = array_arg(vm, "pop", args, 0)?;
    Ok(vm.heap_mut().array_mut(array).values.pop().unwrap_or(Value::Nil))
}

fn insert(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("insert", args, 3)?;
    let array = array_arg(vm, "insert", args, 0)?;
    let len = vm.heap().array(array).values.len();
    // Inserting at `len` appends.
    let at = match args.get(1) {
        Some(Value::Number(n)) if *n >= 0.0 && (*n as usize) <= len => *n as usize,
        Some(Value::Number(_)) => return Err("Index out of bounds.".to_string()),
        _ => return Err("insert() expects a numeric index.".to_string()),
    };
    vm.heap_mut().array_mut(array).values.insert(at, args[2]);
    Ok(Value::Obj(array))
}

fn remove(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("remove", args, 2)?;
    let array = array_arg(vm, "remove", args, 0)?;
    let len = vm.heap().array(array).values.len();
    let at = index_arg("remove", args, 1, len)?;
    Ok(vm.heap_mut().array_mut(array).values.remove(at))
}

/// Sort in place. All elements must be numbers, or all strings.
fn sort(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("sort", args, 1)?;
    let array = array_arg(vm, "sort", args, 0)?;

    let values = vm.heap().array(array).values.clone();
    if values.iter().all(|v| v.is_number()) {
        let mut numbers: Vec<f64> =
            values.iter().map(|v| v.as_number().expect("checked above")).collect();
        numbers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        vm.heap_mut().array_mut(array).values =
            numbers.into_iter().map(Value::Number).collect();
        return Ok(Value::Obj(array));
    }

    let all_strings = values
        .iter()
        .all(|v| matches!(v, Value::Obj(r) if matches!(vm.heap().get(*r), Obj::String(_))));
    if all_strings {
        let mut keyed: Vec<(String, Value)> = values
            .iter()
            .map(|&v| {
                let r = v.as_obj().expect("checked above");
                (vm.heap().string(r).to_string(), v)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        vm.heap_mut().array_mut(array).values = keyed.into_iter().map(|(_, v)| v).collect();
        return Ok(Value::Obj(array));
    }

    Err("sort() requires all numbers or all strings.".to_string())
}

fn reverse(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("reverse", args, 1)?;
    let array = array_arg(vm, "reverse", args, 0)?;
    vm.heap_mut().array_mut(array).values.reverse();
    Ok(Value::Obj(array))
}

/// Index of the first element equal to the needle, or nil.
fn find(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("find", args, 2)?;
    let array = array_arg(vm, "find", args, 0)?;
    let found = vm.heap().array(array).values.iter().position(|&v| v == args[1]);
    Ok(found.map_or(Value::Nil, |i| Value::Number(i as f64)))
}

fn find_last(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("findLast", args, 2)?;
    let array = array_arg(vm, "findLast", args, 0)?;
    let found = vm.heap().array(array).values.iter().rposition(|&v| v == args[1]);
    Ok(found.map_or(Value::Nil, |i| Value::Number(i as f64)))
}

fn map(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("map", args, 2)?;
    let array = array_arg(vm, "map", args, 0)?;
    let callback = args[1];

    let result = vm.alloc(Obj::Array(ObjArray::default()));
    vm.push(Value::Obj(result));

    let mut i = 0;
    while i < vm.heap().array(array).values.len() {
        let element = vm.heap().array(array).values[i];
        let mapped = vm.call_function(callback, &[element])?;
        vm.heap_mut().array_mut(result).values.push(mapped);
        i += 1;
    }

    vm.pop();
    Ok(Value::Obj(result))
}

fn filter(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("filter", args, 2)?;
    let array = array_arg(vm, "filter", args, 0)?;
    let callback = args[1];

    let result = vm.alloc(Obj::Array(ObjArray::default()));
    vm.push(Value::Obj(result));

    let mut i = 0;
    while i < vm.heap().array(array).values.len() {
        let element = vm.heap().array(array).values[i];
        let keep = vm.call_function(callback, &[element])?;
        if !is_falsey(keep) {
            vm.heap_mut().array_mut(result).values.push(element);
        }
        i += 1;
    }

    vm.pop();
    Ok(Value::Obj(result))
}

fn reduce(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("reduce", args, 3)?;
    let array = array_arg(vm, "reduce", args, 0)?;
    let callback = args[1];
    let mut accumulator = args[2];

    let mut i = 0;
    while i < vm.heap().array(array).values.len() {
        let element = vm.heap().array(array).values[i];
        accumulator = vm.call_function(callback, &[accumulator, element])?;
        i += 1;
    }

    Ok(accumulator)
}

/// Flatten nested arrays by one level.
fn flatten(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("flatten", args, 1)?;
    let array = array_arg(vm, "flatten", args, 0)?;

    let mut flat = Vec::new();
    for &value in &vm.heap().array(array).values {
        match value {
            Value::Obj(r) if matches!(vm.heap().get(r), Obj::Array(_)) => {
                flat.extend_from_slice(&vm.heap().array(r).values);
            }
            other => flat.push(other),
        }
    }

    let result = vm.alloc(Obj::Array(ObjArray { values: flat }));
    Ok(Value::Obj(result))
}
