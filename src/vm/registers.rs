//! The machine's register file.

use crate::vm::errors::VmError;
use crate::vm::value::Value;

/// Number of registers in the file.
///
/// Register operands are a single byte, so any value up to 256 works;
/// indices at or past this count are a bounds error.
pub const REGISTER_COUNT: usize = 64;

/// Register file holding the machine's working storage.
///
/// Every slot holds a single [`Value`] and starts as `Integer(0)`. A slot
/// that owns a string releases the buffer when it is overwritten.
pub(crate) struct Registers {
    regs: Vec<Value>,
}

impl Registers {
    /// Creates a new register file with all slots zeroed.
    pub(crate) fn new() -> Self {
        Self {
            regs: vec![Value::Integer(0); REGISTER_COUNT],
        }
    }

    /// Returns a reference to the value in register `idx`.
    ///
    /// Returns [`VmError::RegisterOutOfBounds`] if `idx` is out of bounds.
    pub(crate) fn get(&self, idx: u8) -> Result<&Value, VmError> {
        self.regs
            .get(idx as usize)
            .ok_or(VmError::RegisterOutOfBounds {
                index: idx,
                available: REGISTER_COUNT,
            })
    }

    /// Returns the integer value in register `idx`.
    ///
    /// Returns [`VmError::TypeMismatch`] if the value is not an integer.
    pub(crate) fn get_int(&self, idx: u8, instr: &'static str) -> Result<i32, VmError> {
        match self.get(idx)? {
            Value::Integer(v) => Ok(*v),
            other => Err(VmError::TypeMismatch {
                instruction: instr,
                register: idx,
                expected: "Integer",
                actual: other.type_name(),
            }),
        }
    }

    /// Returns the float value in register `idx`.
    ///
    /// Returns [`VmError::TypeMismatch`] if the value is not a float.
    pub(crate) fn get_float(&self, idx: u8, instr: &'static str) -> Result<f32, VmError> {
        match self.get(idx)? {
            Value::Float(v) => Ok(*v),
            other => Err(VmError::TypeMismatch {
                instruction: instr,
                register: idx,
                expected: "Float",
                actual: other.type_name(),
            }),
        }
    }

    /// Returns the string contents of register `idx`.
    ///
    /// Returns [`VmError::TypeMismatch`] if the value is not a string.
    pub(crate) fn get_str(&self, idx: u8, instr: &'static str) -> Result<&[u8], VmError> {
        match self.get(idx)? {
            Value::Str(v) => Ok(v),
            other => Err(VmError::TypeMismatch {
                instruction: instr,
                register: idx,
                expected: "String",
                actual: other.type_name(),
            }),
        }
    }

    /// Iterates over the register slots in index order.
    pub(crate) fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.regs.iter()
    }

    /// Stores a value into register `idx`, dropping whatever it held.
    ///
    /// Returns [`VmError::RegisterOutOfBounds`] if `idx` is out of bounds.
    pub(crate) fn set(&mut self, idx: u8, v: Value) -> Result<(), VmError> {
        let slot = self
            .regs
            .get_mut(idx as usize)
            .ok_or(VmError::RegisterOutOfBounds {
                index: idx,
                available: REGISTER_COUNT,
            })?;
        *slot = v;
        Ok(())
    }
}
