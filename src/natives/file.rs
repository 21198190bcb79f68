// File: src/natives/file.rs
//
// File I/O natives. Open files are opaque numeric handles owned by
// user code; the collector never touches them, and `fclose` is the
// only way a handle goes away.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use rand::distributions::Alphanumeric;
use rand::Rng;

use super::{check_arity, number_arg, set_table_entry, string_arg};
use crate::object::{Obj, ObjRef, ObjTable};
use crate::value::Value;
use crate::vm::{NativeFn, Vm};

pub const FNS: &[(&str, NativeFn)] = &[
    ("fopen", fopen),
    ("tmpfile", tmpfile),
    ("mkstemps", mkstemps),
    ("fclose", fclose),
    ("fwrite", fwrite),
    ("fread", fread),
    ("fseek", fseek),
    ("ftell", ftell),
    ("fflush", fflush),
    ("fgetc", fgetc),
    ("fgets", fgets),
    ("fputs", fputs),
    ("fputc", fputc),
    ("remove", remove),
    ("rename", rename),
];

pub fn install_constants(vm: &mut Vm, table: ObjRef) {
    set_table_entry(vm, table, "SEEK_SET", Value::Number(0.0));
    set_table_entry(vm, table, "SEEK_CUR", Value::Number(1.0));
    set_table_entry(vm, table, "SEEK_END", Value::Number(2.0));
}

fn handle_arg(vm: &Vm, name: &str, args: &[Value], index: usize) -> Result<u32, String> {
    let handle = number_arg(name, args, index)? as u32;
    if vm.files.contains_key(&handle) {
        Ok(handle)
    } else {
        Err(format!("{}() got an invalid file handle.", name))
    }
}

fn register_handle(vm: &mut Vm, file: std::fs::File) -> f64 {
    let handle = vm.next_file_handle;
    vm.next_file_handle += 1;
    vm.files.insert(handle, file);
    handle as f64
}

/// `fopen(path, mode)` with C-style modes; nil when the open fails.
fn fopen(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fopen", args, 2)?;
    let path = string_arg(vm, "fopen", args, 0)?;
    let mode = string_arg(vm, "fopen", args, 1)?;

    let mut options = OpenOptions::new();
    match mode.as_str() {
        "r" => options.read(true),
        "r+" => options.read(true).write(true),
        "w" => options.write(true).create(true).truncate(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "a+" => options.read(true).append(true).create(true),
        _ => return Err(format!("fopen() got an unknown mode '{}'.", mode)),
    };

    match options.open(&path) {
        Ok(file) => Ok(Value::Number(register_handle(vm, file))),
        Err(_) => Ok(Value::Nil),
    }
}

/// An anonymous read/write file. The backing name is unlinked right
/// away, so the data lives exactly as long as the handle.
fn tmpfile(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("tmpfile", args, 0)?;

    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("lume_tmp_{}_{}", std::process::id(), n));

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| format!("tmpfile() failed: {}", e))?;
    let _ = std::fs::remove_file(&path);

    Ok(Value::Number(register_handle(vm, file)))
}

/// `mkstemps(template, suffixlen)`: fill the template's `XXXXXX` run
/// before the suffix with random characters and create the file.
/// Returns a table with `handle` and `path`.
fn mkstemps(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("mkstemps", args, 2)?;
    let template = string_arg(vm, "mkstemps", args, 0)?;
    let suffix_len = number_arg("mkstemps", args, 1)? as usize;

    if suffix_len > template.len() {
        return Err("mkstemps() suffix is longer than the template.".to_string());
    }
    let (head, suffix) = template.split_at(template.len() - suffix_len);
    let Some(stem) = head.strip_suffix("XXXXXX") else {
        return Err("mkstemps() template needs 'XXXXXX' before the suffix.".to_string());
    };
    let stem = stem.to_string();
    let suffix = suffix.to_string();

    for _ in 0..32 {
        let fill: String = (0..6).map(|_| vm.rng.sample(Alphanumeric) as char).collect();
        let path = format!("{}{}{}", stem, fill, suffix);
        match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
            Ok(file) => {
                let handle = register_handle(vm, file);
                let table = vm.alloc(Obj::Table(ObjTable::default()));
                vm.push(Value::Obj(table));
                let path_ref = vm.take_string(path);
                set_table_entry(vm, table, "path", Value::Obj(path_ref));
                set_table_entry(vm, table, "handle", Value::Number(handle));
                vm.pop();
                return Ok(Value::Obj(table));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(format!("mkstemps() failed: {}", e)),
        }
    }
    Err("mkstemps() could not create a unique file.".to_string())
}

fn fclose(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fclose", args, 1)?;
    let handle = handle_arg(vm, "fclose", args, 0)?;
    vm.files.remove(&handle);
    Ok(Value::Bool(true))
}

fn fwrite(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fwrite", args, 2)?;
    let handle = handle_arg(vm, "fwrite", args, 0)?;
    let text = string_arg(vm, "fwrite", args, 1)?;
    let file = vm.files.get_mut(&handle).expect("handle validated above");
    file.write_all(text.as_bytes()).map_err(|e| format!("fwrite() failed: {}", e))?;
    Ok(Value::Number(text.len() as f64))
}

fn fputs(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    fwrite(vm, args)
}

/// Read up to `n` bytes as a string.
fn fread(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fread", args, 2)?;
    let handle = handle_arg(vm, "fread", args, 0)?;
    let count = number_arg("fread", args, 1)? as usize;

    let mut buffer = vec![0u8; count];
    let file = vm.files.get_mut(&handle).expect("handle validated above");
    let read = file.read(&mut buffer).map_err(|e| format!("fread() failed: {}", e))?;
    buffer.truncate(read);

    let text = String::from_utf8_lossy(&buffer).into_owned();
    let r = vm.take_string(text);
    Ok(Value::Obj(r))
}

/// Read one character; nil at end of file.
fn fgetc(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fgetc", args, 1)?;
    let handle = handle_arg(vm, "fgetc", args, 0)?;

    let file = vm.files.get_mut(&handle).expect("handle validated above");
    let mut lead = [0u8; 1];
    let read = file.read(&mut lead).map_err(|e| format!("fgetc() failed: {}", e))?;
    if read == 0 {
        return Ok(Value::Nil);
    }

    // UTF-8 sequence length from the leading byte.
    let extra = match lead[0] {
        b if b < 0x80 => 0,
        b if b >= 0xf0 => 3,
        b if b >= 0xe0 => 2,
        b if b >= 0xc0 => 1,
        _ => 0,
    };
    let mut bytes = vec![lead[0]];
    if extra > 0 {
        let mut rest = vec![0u8; extra];
        let read = file.read(&mut rest).map_err(|e| format!("fgetc() failed: {}", e))?;
        rest.truncate(read);
        bytes.extend_from_slice(&rest);
    }

    let text = String::from_utf8_lossy(&bytes).into_owned();
    let r = vm.take_string(text);
    Ok(Value::Obj(r))
}

/// Write a one-character string; returns the character.
fn fputc(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fputc", args, 2)?;
    let handle = handle_arg(vm, "fputc", args, 0)?;
    let text = string_arg(vm, "fputc", args, 1)?;
    if text.chars().count() != 1 {
        return Err("fputc() expects a single-character string.".to_string());
    }

    let file = vm.files.get_mut(&handle).expect("handle validated above");
    file.write_all(text.as_bytes()).map_err(|e| format!("fputc() failed: {}", e))?;
    Ok(args[1])
}

/// Read one line, without the trailing newline; nil at end of file.
fn fgets(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fgets", args, 1)?;
    let handle = handle_arg(vm, "fgets", args, 0)?;

    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let file = vm.files.get_mut(&handle).expect("handle validated above");
        let read = file.read(&mut byte).map_err(|e| format!("fgets() failed: {}", e))?;
        if read == 0 {
            if line.is_empty() {
                return Ok(Value::Nil);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&line).into_owned();
    let r = vm.take_string(text);
    Ok(Value::Obj(r))
}

fn fseek(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fseek", args, 3)?;
    let handle = handle_arg(vm, "fseek", args, 0)?;
    let offset = number_arg("fseek", args, 1)?;
    let whence = number_arg("fseek", args, 2)? as i64;

    let position = match whence {
        0 => SeekFrom::Start(offset as u64),
        1 => SeekFrom::Current(offset as i64),
        2 => SeekFrom::End(offset as i64),
        _ => return Err("fseek() whence must be SEEK_SET, SEEK_CUR or SEEK_END.".to_string()),
    };

    let file = vm.files.get_mut(&handle).expect("handle validated above");
    file.seek(position).map_err(|e| format!("fseek() failed: {}", e))?;
    Ok(Value::Number(0.0))
}

fn ftell(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("ftell", args, 1)?;
    let handle = handle_arg(vm, "ftell", args, 0)?;
    let file = vm.files.get_mut(&handle).expect("handle validated above");
    let position = file.stream_position().map_err(|e| format!("ftell() failed: {}", e))?;
    Ok(Value::Number(position as f64))
}

fn fflush(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("fflush", args, 1)?;
    let handle = handle_arg(vm, "fflush", args, 0)?;
    let file = vm.files.get_mut(&handle).expect("handle validated above");
    file.flush().map_err(|e| format!("fflush() failed: {}", e))?;
    Ok(Value::Nil)
}

fn remove(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("remove", args, 1)?;
    let path = string_arg(vm, "remove", args, 0)?;
    Ok(Value::Bool(std::fs::remove_file(path).is_ok()))
}

fn rename(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    check_arity("rename", args, 2)?;
    let from = string_arg(vm, "rename", args, 0)?;
    let to = string_arg(vm, "rename", args, 1)?;
    Ok(Value::Bool(std::fs::rename(from, to).is_ok()))
}
