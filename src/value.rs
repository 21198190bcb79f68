// File: src/value.rs
//
// Tagged runtime values. Everything larger than a number lives on the
// heap and is reached through an ObjRef; two values are equal when their
// tags and payloads are equal, which for objects means reference
// equality (strings are interned, so that is also value equality).

use std::hash::{Hash, Hasher};

use crate::heap::Heap;
use crate::object::{Obj, ObjRef, ObjUpvalue};

/// A Lume runtime value.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

impl Value {
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }
}

/// `nil` and `false` are falsey; every other value is truthy.
pub fn is_falsey(value: Value) -> bool {
    matches!(value, Value::Nil | Value::Bool(false))
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Nil => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Number(n) => {
                state.write_u8(2);
                // Normalize -0.0 so it hashes the same as 0.0, which it
                // compares equal to.
                let bits = if *n == 0.0 { 0 } else { n.to_bits() };
                state.write_u64(bits);
            }
            Value::Obj(r) => {
                state.write_u8(3);
                r.hash(state);
            }
        }
    }
}

/// Render a value the way `dump` and `print` show it. Strings print
/// their raw contents; aggregates print their elements recursively.
pub fn format_value(heap: &Heap, value: Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n),
        Value::Obj(r) => format_object(heap, r),
    }
}

/// Whole numbers print without a trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn format_object(heap: &Heap, r: ObjRef) -> String {
    match heap.get(r) {
        Obj::String(s) => s.to_string(),
        Obj::Function(f) => match f.name {
            Some(name) => format!("<fn {}>", heap.string(name)),
            None => "<script>".to_string(),
        },
        Obj::Native(_) => "<native fn>".to_string(),
        Obj::Closure(c) => format_object(heap, c.function),
        Obj::BoundMethod(b) => format_object(heap, b.method),
        Obj::Upvalue(u) => match u {
            ObjUpvalue::Open(_) => "upvalue".to_string(),
            ObjUpvalue::Closed(v) => format_value(heap, *v),
        },
        Obj::Class(c) => heap.string(c.name).to_string(),
        Obj::Instance(i) => {
            let class = heap.class(i.class);
            format!("{} instance", heap.string(class.name))
        }
        Obj::Table(t) => {
            let mut parts: Vec<String> = t
                .entries
                .iter()
                .map(|(k, v)| format!("{}: {}", format_value(heap, *k), format_value(heap, *v)))
                .collect();
            parts.sort();
            format!("{{{}}}", parts.join(", "))
        }
        Obj::Array(a) => {
            let parts: Vec<String> =
                a.values.iter().map(|v| format_value(heap, *v)).collect();
            format!("[{}]", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsiness_covers_nil_and_false_only() {
        assert!(is_falsey(Value::Nil));
        assert!(is_falsey(Value::Bool(false)));
        assert!(!is_falsey(Value::Bool(true)));
        assert!(!is_falsey(Value::Number(0.0)));
    }

    #[test]
    fn numbers_format_like_integers_when_whole() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(3.5), "3.5");
        assert_eq!(format_number(-0.0), "0");
    }

    #[test]
    fn negative_zero_equals_and_hashes_like_zero() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        assert_eq!(Value::Number(0.0), Value::Number(-0.0));

        let hash = |v: Value| {
            let mut h = DefaultHasher::new();
            v.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(Value::Number(0.0)), hash(Value::Number(-0.0)));
    }
}
