//! Runtime value representation.

use std::fmt;

/// Runtime value stored in registers, stack slots, and variable channels.
///
/// The string case exclusively owns its buffer. Payloads are copied out of
/// code memory verbatim, so a string may contain embedded zero bytes or
/// non-UTF-8 data; it is only decoded (lossily) when printed.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// 32-bit signed integer.
    Integer(i32),
    /// 32-bit IEEE 754 float.
    Float(f32),
    /// Owned byte string.
    Str(Vec<u8>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Integer(0)
    }
}

impl Value {
    /// Returns the type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Str(_) => "String",
        }
    }

    /// Returns the value's integer payload as raw storage.
    ///
    /// Integers give their value, floats give their bit pattern. The Z-flag
    /// rule, register compares, and the bitwise ops with a float operand
    /// all read this raw storage rather than the numeric value. Strings are
    /// never consulted through this path and give 0.
    pub fn raw_int(&self) -> i32 {
        match self {
            Value::Integer(i) => *i,
            Value::Float(f) => f.to_bits() as i32,
            Value::Str(_) => 0,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{:.6}", v),
            Value::Str(s) => write!(f, "{}", String::from_utf8_lossy(s)),
        }
    }
}
