// File: src/natives/math.rs
//
// Math natives and the PI/E module constants. `seed`/`rand` use the
// VM's reseedable RNG so scripted runs can be reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{check_arity, number_arg, set_table_entry};
use crate::object::ObjRef;
use crate::value::Value;
use crate::vm::{NativeFn, Vm};

pub const FNS: &[(&str, NativeFn)] = &[
    ("ceil", ceil),
    ("floor", floor),
    ("abs", abs),
    ("exp", exp),
    ("sqrt", sqrt),
    ("sin", sin),
    ("cos", cos),
    ("tan", tan),
    ("atan", atan),
    ("pow", pow),
    ("atan2", atan2),
    ("deg", deg),
    ("rad", rad),
    ("clamp", clamp),
    ("lerp", lerp),
    ("map", map),
    ("norm", norm),
    ("seed", seed),
    ("rand", rand_fn),
];

pub fn install_constants(vm: &mut Vm, table: ObjRef) {
    set_table_entry(vm, table, "PI", Value::Number(std::f64::consts::PI));
    set_table_entry(vm, table, "E", Value::Number(std::f64::consts::E));
}

fn unary(name: &'static str, f: fn(f64) -> f64) -> impl Fn(&[Value]) -> Result<Value, String> {
    move |args| {
        check_arity(name, args, 1)?;
        Ok(Value::Number(f(number_arg(name, args, 0)?)))
    }
}

fn ceil(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("ceil", f64::ceil)(args)
}

fn floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("floor", f64::floor)(args)
}

fn abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("abs", f64::abs)(args)
}

fn exp(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("exp", f64::exp)(args)
}

fn sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("sqrt", f64::sqrt)(args)
}

fn sin(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("sin", f64::sin)(args)
}

fn cos(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("cos", f64::cos)(args)
}

fn tan(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("tan", f64::tan)(args)
}

fn atan(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("atan", f64::atan)(args)
}

fn deg(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("deg", f64::to_degrees)(args)
}

fn rad(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    unary("rad", f64::to_radians)(args)
}

fn pow(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("pow", args, 2)?;
    let base = number_arg("pow", args, 0)?;
    let exponent = number_arg("pow", args, 1)?;
    Ok(Value::Number(base.powf(exponent)))
}

fn atan2(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("atan2", args, 2)?;
    let y = number_arg("atan2", args, 0)?;
    let x = number_arg("atan2", args, 1)?;
    Ok(Value::Number(y.atan2(x)))
}

fn clamp(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("clamp", args, 3)?;
    let x = number_arg("clamp", args, 0)?;
    let low = number_arg("clamp", args, 1)?;
    let high = number_arg("clamp", args, 2)?;
    Ok(Value::Number(x.max(low).min(high)))
}

fn lerp(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("lerp", args, 3)?;
    let a = number_arg("lerp", args, 0)?;
    let b = number_arg("lerp", args, 1)?;
    let t = number_arg("lerp", args, 2)?;
    Ok(Value::Number(a + (b - a) * t))
}

/// Remap `x` from one range onto another.
fn map(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("map", args, 5)?;
    let x = number_arg("map", args, 0)?;
    let in_low = number_arg("map", args, 1)?;
    let in_high = number_arg("map", args, 2)?;
    let out_low = number_arg("map", args, 3)?;
    let out_high = number_arg("map", args, 4)?;
    let t = (x - in_low) / (in_high - in_low);
    Ok(Value::Number(out_low + (out_high - out_low) * t))
}

fn norm(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("norm", args, 3)?;
    let x = number_arg("norm", args, 0)?;
    let low = number_arg("norm", args, 1)?;
    let high = number_arg("norm", args, 2)?;
    Ok(Value::Number((x - low) / (high - low)))
}

fn seed(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("seed", args, 1)?;
    let seed = number_arg("seed", args, 0)?;
    vm.rng = StdRng::seed_from_u64(seed as u64);
    Ok(Value::Nil)
}

/// `rand()` draws a float in [0, 1); `rand(n)` an integer in [0, n).
fn rand_fn(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args.len() {
        0 => Ok(Value::Number(vm.rng.gen::<f64>())),
        1 => {
            let bound = number_arg("rand", args, 0)?;
            if bound < 1.0 {
                return Err("rand() bound must be at least 1.".to_string());
            }
            Ok(Value::Number(vm.rng.gen_range(0..bound as i64) as f64))
        }
        n => Err(format!("Expected 0 or 1 arguments but got {}.", n)),
    }
}
