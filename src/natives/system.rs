// File: src/natives/system.rs
//
// Process and clock natives.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use super::{check_arity, number_arg};
use crate::value::Value;
use crate::vm::{NativeFn, Vm};

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

pub const FNS: &[(&str, NativeFn)] = &[
    ("exit", exit),
    ("time", time),
    ("mtime", mtime),
    ("clock", clock),
    ("sleep", sleep),
    ("usleep", usleep),
];

fn exit(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let code = if args.is_empty() { 0.0 } else { number_arg("exit", args, 0)? };
    std::process::exit(code as i32);
}

/// Seconds since the Unix epoch.
fn time(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("time", args, 0)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("time() failed: {}", e))?;
    Ok(Value::Number(now.as_secs() as f64))
}

/// Milliseconds since the Unix epoch.
fn mtime(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("mtime", args, 0)?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("mtime() failed: {}", e))?;
    Ok(Value::Number(now.as_millis() as f64))
}

/// Seconds of wall time since the process started.
fn clock(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("clock", args, 0)?;
    Ok(Value::Number(PROCESS_START.elapsed().as_secs_f64()))
}

fn sleep(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("sleep", args, 1)?;
    let seconds = number_arg("sleep", args, 0)?;
    if seconds > 0.0 {
        std::thread::sleep(Duration::from_secs_f64(seconds));
    }
    Ok(Value::Nil)
}

fn usleep(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("usleep", args, 1)?;
    let micros = number_arg("usleep", args, 0)?;
    if micros > 0.0 {
        std::thread::sleep(Duration::from_micros(micros as u64));
    }
    Ok(Value::Nil)
}
