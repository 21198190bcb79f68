// File: src/debug.rs
//
// Bytecode disassembler. Prints one instruction per line with its
// offset, source line, mnemonic, and operands. Used by `lume disasm`
// and the LUME_PRINT_CODE toggle.

use crate::chunk::{Chunk, OpCode};
use crate::heap::Heap;
use crate::object::Obj;
use crate::value::{format_value, Value};

pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) {
    println!("== {} ==", name);

    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset);
    }
}

/// Disassemble the chunk and, recursively, every function stored in
/// its constant pool.
pub fn disassemble_function(heap: &Heap, function: crate::object::ObjRef) {
    let f = heap.function(function);
    let name = match f.name {
        Some(name) => format!("fn {}", heap.string(name)),
        None => "<script>".to_string(),
    };
    disassemble_chunk(heap, &f.chunk, &name);

    for constant in &f.chunk.constants {
        if let Value::Obj(r) = constant {
            if matches!(heap.get(*r), Obj::Function(_)) {
                println!();
                disassemble_function(heap, *r);
            }
        }
    }
}

pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    print!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        print!("   | ");
    } else {
        print!("{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        println!("Unknown opcode {}", byte);
        return offset + 1;
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::GetSuper
        | OpCode::Class
        | OpCode::Method
        | OpCode::Property => constant_instruction(op_name(op), heap, chunk, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::SetTable
        | OpCode::SetArray => byte_instruction(op_name(op), chunk, offset),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(op_name(op), 1, chunk, offset),
        OpCode::Loop => jump_instruction(op_name(op), -1, chunk, offset),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(op_name(op), heap, chunk, offset),
        OpCode::Closure => closure_instruction(heap, chunk, offset),
        _ => simple_instruction(op_name(op), offset),
    }
}

fn simple_instruction(name: &str, offset: usize) -> usize {
    println!("{}", name);
    offset + 1
}

fn constant_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    println!(
        "{:<16} {:4} '{}'",
        name,
        constant,
        format_value(heap, chunk.constants[constant as usize])
    );
    offset + 2
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> usize {
    let slot = chunk.code[offset + 1];
    println!("{:<16} {:4}", name, slot);
    offset + 2
}

fn jump_instruction(name: &str, sign: i64, chunk: &Chunk, offset: usize) -> usize {
    let jump = chunk.read_short(offset + 1) as i64;
    let target = offset as i64 + 3 + sign * jump;
    println!("{:<16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn invoke_instruction(name: &str, heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    println!(
        "{:<16} ({} args) {:4} '{}'",
        name,
        arg_count,
        constant,
        format_value(heap, chunk.constants[constant as usize])
    );
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> usize {
    let constant = chunk.code[offset + 1];
    let function = chunk.constants[constant as usize];
    println!("{:<16} {:4} {}", "OP_CLOSURE", constant, format_value(heap, function));

    let mut offset = offset + 2;
    if let Value::Obj(r) = function {
        let upvalue_count = heap.function(r).upvalue_count;
        for _ in 0..upvalue_count {
            let is_local = chunk.code[offset];
            let index = chunk.code[offset + 1];
            println!(
                "{:04}      |                     {} {}",
                offset,
                if is_local != 0 { "local" } else { "upvalue" },
                index
            );
            offset += 2;
        }
    }
    offset
}

fn op_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Constant => "OP_CONSTANT",
        OpCode::Nil => "OP_NIL",
        OpCode::True => "OP_TRUE",
        OpCode::False => "OP_FALSE",
        OpCode::Pop => "OP_POP",
        OpCode::Dup => "OP_DUP",
        OpCode::GetLocal => "OP_GET_LOCAL",
        OpCode::SetLocal => "OP_SET_LOCAL",
        OpCode::GetGlobal => "OP_GET_GLOBAL",
        OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
        OpCode::SetGlobal => "OP_SET_GLOBAL",
        OpCode::GetUpvalue => "OP_GET_UPVALUE",
        OpCode::SetUpvalue => "OP_SET_UPVALUE",
        OpCode::GetProperty => "OP_GET_PROPERTY",
        OpCode::SetProperty => "OP_SET_PROPERTY",
        OpCode::GetSuper => "OP_GET_SUPER",
        OpCode::Equal => "OP_EQUAL",
        OpCode::Greater => "OP_GREATER",
        OpCode::Less => "OP_LESS",
        OpCode::Add => "OP_ADD",
        OpCode::Subtract => "OP_SUBTRACT",
        OpCode::Multiply => "OP_MULTIPLY",
        OpCode::Divide => "OP_DIVIDE",
        OpCode::Modulo => "OP_MODULO",
        OpCode::BitwiseAnd => "OP_BITWISE_AND",
        OpCode::BitwiseOr => "OP_BITWISE_OR",
        OpCode::BitwiseXor => "OP_BITWISE_XOR",
        OpCode::ShiftLeft => "OP_SHIFT_LEFT",
        OpCode::ShiftRight => "OP_SHIFT_RIGHT",
        OpCode::Not => "OP_NOT",
        OpCode::Negate => "OP_NEGATE",
        OpCode::Increment => "OP_INCREMENT",
        OpCode::Decrement => "OP_DECREMENT",
        OpCode::Jump => "OP_JUMP",
        OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
        OpCode::Loop => "OP_LOOP",
        OpCode::Call => "OP_CALL",
        OpCode::Invoke => "OP_INVOKE",
        OpCode::SuperInvoke => "OP_SUPER_INVOKE",
        OpCode::Closure => "OP_CLOSURE",
        OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
        OpCode::Return => "OP_RETURN",
        OpCode::Class => "OP_CLASS",
        OpCode::Inherit => "OP_INHERIT",
        OpCode::Method => "OP_METHOD",
        OpCode::Property => "OP_PROPERTY",
        OpCode::Index => "OP_INDEX",
        OpCode::SetIndex => "OP_SET_INDEX",
        OpCode::SetTable => "OP_SET_TABLE",
        OpCode::SetArray => "OP_SET_ARRAY",
        OpCode::Dump => "OP_DUMP",
    }
}
