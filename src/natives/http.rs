// File: src/natives/http.rs
//
// HTTP client natives over a shared blocking client. Each call
// returns a table with `status` and `body`.

use once_cell::sync::Lazy;
use reqwest::blocking::Client;
use reqwest::Method;

use super::{check_arity, string_arg};
use crate::object::{Obj, ObjTable};
use crate::value::Value;
use crate::vm::{NativeFn, Vm};

static CLIENT: Lazy<Client> = Lazy::new(Client::new);

pub const FNS: &[(&str, NativeFn)] = &[
    ("get", get),
    ("post", post),
    ("put", put),
    ("patch", patch),
    ("delete", delete),
    ("head", head),
    ("options", options),
];

fn request(
    vm: &mut Vm,
    method: Method,
    name: &str,
    args: &[Value],
    with_body: bool,
) -> Result<Value, String> {
    check_arity(name, args, if with_body { 2 } else { 1 })?;
    let url = string_arg(vm, name, args, 0)?;

    let mut builder = CLIENT.request(method, &url);
    if with_body {
        builder = builder.body(string_arg(vm, name, args, 1)?);
    }

    let response = builder.send().map_err(|e| format!("HTTP {} failed: {}", name, e))?;
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();

    response_table(vm, status, body)
}

fn response_table(vm: &mut Vm, status: u16, body: String) -> Result<Value, String> {
    let table = vm.alloc(Obj::Table(ObjTable::default()));
    vm.push(Value::Obj(table));

    let body_ref = vm.take_string(body);
    super::set_table_entry(vm, table, "body", Value::Obj(body_ref));
    super::set_table_entry(vm, table, "status", Value::Number(status as f64));

    vm.pop();
    Ok(Value::Obj(table))
}

fn get(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    request(vm, Method::GET, "get", args, false)
}

fn post(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    request(vm, Method::POST, "post", args, true)
}

fn put(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    request(vm, Method::PUT, "put", args, true)
}

fn patch(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    request(vm, Method::PATCH, "patch", args, true)
}

fn delete(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    request(vm, Method::DELETE, "delete", args, false)
}

fn head(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    request(vm, Method::HEAD, "head", args, false)
}

fn options(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    request(vm, Method::OPTIONS, "options", args, false)
}
