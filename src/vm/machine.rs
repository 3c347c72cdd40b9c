//! Core virtual machine implementation.
//!
//! The machine executes raw bytecode out of a 64 KiB byte-addressable memory
//! that also serves as data (PEEK/POKE/MEMCPY target the same region, so
//! self-modifying programs work). Handlers read their own operands through
//! the wrapping decoder and finish by stepping the instruction pointer to
//! the next opcode; branch handlers assign it directly.

use std::io::Write;
use std::process::Command;

use rand::Rng;

use crate::utils::log::{self, Logger};
use crate::vm::errors::VmError;
use crate::vm::io::{
    ANALOG_IN_COUNT, ANALOG_OUT_COUNT, BINARY_IN_COUNT, BINARY_OUT_COUNT, IoChannels,
    VARIABLE_COUNT,
};
use crate::vm::isa::Opcode;
use crate::vm::registers::Registers;
use crate::vm::value::Value;

/// Size of code memory in bytes.
pub const CODE_SIZE: usize = 0x10000;
/// Capacity of the data stack.
pub const STACK_DEPTH: usize = 1024;
/// Capacity of the call stack.
pub const CALL_STACK_DEPTH: usize = 256;

/// Construction options for a [`Vm`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    /// Trace every executed opcode through the crate logger. Enabling this
    /// also lowers the global log level to `Debug` so the trace is visible.
    pub debug: bool,
    /// Permit STRING_SYSTEM to hand strings to the host shell. When off
    /// (the default), executing the opcode is a fatal error.
    pub allow_system: bool,
}

/// Arithmetic and bitwise operations sharing one operand layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MathOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl MathOp {
    fn mnemonic(self) -> &'static str {
        match self {
            MathOp::Add => "ADD",
            MathOp::Sub => "SUB",
            MathOp::Mul => "MUL",
            MathOp::And => "AND",
            MathOp::Or => "OR",
            MathOp::Xor => "XOR",
        }
    }

    fn is_bitwise(self) -> bool {
        matches!(self, MathOp::And | MathOp::Or | MathOp::Xor)
    }
}

/// Reconstructs a float from its wire form: a 16-bit exponent and a 16-bit
/// mantissa encoding `ldexp(mant / 65535.0, exp)`.
///
/// The scale runs through f64 so the power of two cannot overflow before the
/// final rounding to f32; this keeps the reconstruction bit-identical to a
/// single `ldexpf` for every encodable input.
fn float_from_parts(mant: u16, exp: u16) -> f32 {
    let frac = f32::from(mant) / 65535.0;
    (f64::from(frac) * 2.0f64.powi(i32::from(exp))) as f32
}

/// Parses the longest leading decimal integer, C `atoi` style: optional
/// ASCII whitespace, optional sign, then digits. Returns 0 when no digits
/// are present and saturates at the i32 bounds.
fn parse_leading_int(s: &[u8]) -> i32 {
    let mut i = 0;
    while i < s.len() && s[i].is_ascii_whitespace() {
        i += 1;
    }
    let mut negative = false;
    if i < s.len() && (s[i] == b'+' || s[i] == b'-') {
        negative = s[i] == b'-';
        i += 1;
    }
    let mut value: i64 = 0;
    while i < s.len() && s[i].is_ascii_digit() {
        value = value * 10 + i64::from(s[i] - b'0');
        if value > i64::from(i32::MAX) + 1 {
            // Saturated; further digits cannot change the clamped result.
            value = i64::from(i32::MAX) + 1;
        }
        i += 1;
    }
    let value = if negative { -value } else { value };
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Bounds test for an I/O channel index.
fn channel_bounds(index: u8, limit: usize, channel: &'static str) -> Result<(), VmError> {
    if (index as usize) < limit {
        Ok(())
    } else {
        Err(VmError::ChannelOutOfBounds {
            channel,
            index,
            limit,
        })
    }
}

/// Bytecode virtual machine.
///
/// Executes a program copied into the machine's own 64 KiB memory until an
/// EXIT opcode or the first fatal error. I/O channels stay host-owned and
/// are handed to [`run`](Vm::run) by mutable reference; the machine itself
/// holds the register file, the two stacks, and the Z-flag.
pub struct Vm {
    /// Code memory; instructions, inline strings, and scratch data share it.
    code: Box<[u8]>,
    /// Instruction pointer. Being 16 bits wide it can never leave the
    /// address space.
    ip: u16,
    /// Register file.
    registers: Registers,
    /// Data stack of tagged values.
    stack: Vec<Value>,
    /// Call stack of return addresses.
    call_stack: Vec<u16>,
    /// Z-flag, set by compares, arithmetic, and the type predicates.
    zero_flag: bool,
    /// Cleared by EXIT; the run loop stops once false.
    running: bool,
    debug: bool,
    allow_system: bool,
    /// Sink for the print opcodes. Write failures are ignored.
    output: Box<dyn Write>,
    logger: Logger,
}

impl Vm {
    /// Creates a machine for the given program.
    ///
    /// Up to 64 KiB of `bytecode` is copied to address 0; the rest of code
    /// memory is zero-filled. All registers start as `Integer(0)`, both
    /// stacks empty, IP at 0, Z-flag clear.
    pub fn new(bytecode: &[u8], options: VmOptions) -> Self {
        if options.debug {
            log::init(log::Level::Debug);
        }
        let mut code = vec![0u8; CODE_SIZE].into_boxed_slice();
        let len = bytecode.len().min(CODE_SIZE);
        code[..len].copy_from_slice(&bytecode[..len]);
        Self {
            code,
            ip: 0,
            registers: Registers::new(),
            stack: Vec::new(),
            call_stack: Vec::new(),
            zero_flag: false,
            running: true,
            debug: options.debug,
            allow_system: options.allow_system,
            output: Box::new(std::io::stdout()),
            logger: Logger::new("vm"),
        }
    }

    /// Replaces the sink receiving INT_PRINT / FLOAT_PRINT / STRING_PRINT
    /// output. Defaults to stdout.
    pub fn set_output(&mut self, sink: Box<dyn Write>) {
        self.output = sink;
    }

    /// Returns the value held by register `idx`.
    pub fn register(&self, idx: u8) -> Result<&Value, VmError> {
        self.registers.get(idx)
    }

    /// Renders every register and the Z-flag, one line each.
    pub fn dump_registers(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::from("Register dump\n");
        for (i, value) in self.registers.iter().enumerate() {
            let _ = writeln!(out, "\tRegister {:02} - {}: {}", i, value.type_name(), value);
        }
        let _ = writeln!(out, "\tZ-FLAG:{}", self.zero_flag);
        out
    }

    /// Executes until EXIT or the first fatal error.
    ///
    /// The host must have written its inputs into `io` beforehand and reads
    /// outputs back once this returns. A program that neither exits nor
    /// faults does not return.
    pub fn run(&mut self, io: &mut IoChannels) -> Result<(), VmError> {
        while self.running {
            let byte = self.code[self.ip as usize];
            match Opcode::from_byte(byte) {
                Some(op) => self.exec(op, io)?,
                None => self.op_unknown(byte),
            }
        }
        Ok(())
    }

    /// Reads the next byte at the instruction pointer.
    ///
    /// Advances IP by one first, wrapping to 0 when it reaches 0xFFFF, and
    /// returns the byte now under IP. The very last byte of memory is never
    /// yielded as an operand.
    fn next_byte(&mut self) -> u8 {
        self.ip = self.ip.wrapping_add(1);
        if self.ip == 0xFFFF {
            self.ip = 0;
        }
        self.code[self.ip as usize]
    }

    /// Reads a little-endian 16-bit operand.
    fn read_address(&mut self) -> u16 {
        let low = u16::from(self.next_byte());
        let high = u16::from(self.next_byte());
        low + 256 * high
    }

    /// Reads an inline string operand: a 16-bit length, one reserved byte,
    /// then the payload.
    ///
    /// Payload bytes go through [`next_byte`](Self::next_byte) so a string
    /// crossing the top of memory wraps like any other operand, and IP ends
    /// on the last payload byte ready for the shared post-instruction step.
    /// Embedded zero bytes are preserved; a zero length yields an empty
    /// string.
    fn read_inline_string(&mut self) -> Vec<u8> {
        let len = self.read_address() as usize;
        self.ip = self.ip.wrapping_add(1);
        let mut payload = Vec::with_capacity(len);
        for _ in 0..len {
            payload.push(self.next_byte());
        }
        payload
    }

    /// Steps IP to the next instruction.
    fn advance(&mut self) {
        self.ip = self.ip.wrapping_add(1);
    }

    fn trace<F: FnOnce() -> String>(&self, message: F) {
        if self.debug {
            self.logger.debug(&message());
        }
    }

    /// Executes a single decoded opcode.
    fn exec(&mut self, op: Opcode, io: &mut IoChannels) -> Result<(), VmError> {
        match op {
            Opcode::Exit => self.op_exit(),
            Opcode::Nop => self.op_nop(),
            Opcode::IntStore => self.op_int_store(),
            Opcode::IntPrint => self.op_int_print(),
            Opcode::IntToString => self.op_int_tostring(),
            Opcode::IntRandom => self.op_int_random(),
            Opcode::FloatStore => self.op_float_store(),
            Opcode::FloatPrint => self.op_float_print(),
            Opcode::FloatToString => self.op_float_tostring(),
            Opcode::JumpTo => self.op_jump_to(),
            Opcode::JumpZ => self.op_jump_z(),
            Opcode::JumpNz => self.op_jump_nz(),
            Opcode::Add => self.op_math(MathOp::Add),
            Opcode::Sub => self.op_math(MathOp::Sub),
            Opcode::Mul => self.op_math(MathOp::Mul),
            Opcode::And => self.op_math(MathOp::And),
            Opcode::Or => self.op_math(MathOp::Or),
            Opcode::Xor => self.op_math(MathOp::Xor),
            Opcode::Div => self.op_divide(),
            Opcode::Inc => self.op_inc(),
            Opcode::Dec => self.op_dec(),
            Opcode::StringStore => self.op_string_store(),
            Opcode::StringPrint => self.op_string_print(),
            Opcode::StringConcat => self.op_string_concat(),
            Opcode::StringSystem => self.op_string_system(),
            Opcode::StringToInt => self.op_string_toint(),
            Opcode::CmpReg => self.op_cmp_reg(),
            Opcode::CmpImmediate => self.op_cmp_immediate(),
            Opcode::CmpString => self.op_cmp_string(),
            Opcode::IsString => self.op_is_string(),
            Opcode::IsInteger => self.op_is_integer(),
            Opcode::StoreReg => self.op_reg_store(),
            Opcode::Peek => self.op_peek(),
            Opcode::Poke => self.op_poke(),
            Opcode::Memcpy => self.op_memcpy(),
            Opcode::StackPush => self.op_stack_push(),
            Opcode::StackPop => self.op_stack_pop(),
            Opcode::StackRet => self.op_stack_ret(),
            Opcode::StackCall => self.op_stack_call(),
            Opcode::BinaryLoad => self.op_binary_load(io),
            Opcode::BinarySave => self.op_binary_save(io),
            Opcode::AnalogLoad => self.op_analog_load(io),
            Opcode::AnalogSave => self.op_analog_save(io),
            Opcode::VariableLoad => self.op_variable_load(io),
            Opcode::VariableSave => self.op_variable_save(io),
        }
    }

    /// Unassigned opcode byte: advance and keep walking. This keeps the code
    /// segment safe to execute through even where it holds inline string
    /// payloads or scratch data.
    fn op_unknown(&mut self, byte: u8) {
        self.trace(|| format!("{:04X} - unknown opcode {:02X}", self.ip, byte));
        self.advance();
    }

    /// Break out of the main interpreter loop.
    fn op_exit(&mut self) -> Result<(), VmError> {
        self.running = false;
        self.advance();
        Ok(())
    }

    fn op_nop(&mut self) -> Result<(), VmError> {
        self.trace(|| "NOP()".to_string());
        self.advance();
        Ok(())
    }

    /// Store an immediate integer in a register.
    fn op_int_store(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let value = i32::from(self.read_address());
        self.trace(|| format!("INT_STORE(r{:02} = {:04X})", reg, value));
        self.registers.set(reg, Value::Integer(value))?;
        self.advance();
        Ok(())
    }

    /// Emit the integer contents of a register.
    fn op_int_print(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let val = self.registers.get_int(reg, "INT_PRINT")?;
        self.trace(|| format!("INT_PRINT(r{:02} => {:04X})", reg, val));
        let _ = write!(self.output, "0x{:04X}", val);
        self.advance();
        Ok(())
    }

    /// Convert the integer contents of a register to its decimal string.
    fn op_int_tostring(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let cur = self.registers.get_int(reg, "INT_TOSTRING")?;
        self.registers
            .set(reg, Value::Str(cur.to_string().into_bytes()))?;
        self.advance();
        Ok(())
    }

    /// Store a random integer in the range 0..0xFFFF.
    fn op_int_random(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let value: i32 = rand::thread_rng().gen_range(0..0xFFFF);
        self.registers.set(reg, Value::Integer(value))?;
        self.advance();
        Ok(())
    }

    /// Store a float decoded from its exponent/mantissa wire form.
    fn op_float_store(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let exp = self.read_address();
        let mant = self.read_address();
        let value = float_from_parts(mant, exp);
        self.trace(|| format!("FLOAT_STORE(r{:02} = {})", reg, value));
        self.registers.set(reg, Value::Float(value))?;
        self.advance();
        Ok(())
    }

    /// Emit the float contents of a register.
    fn op_float_print(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let val = self.registers.get_float(reg, "FLOAT_PRINT")?;
        let _ = write!(self.output, "{:.6}", val);
        self.advance();
        Ok(())
    }

    /// Convert the float contents of a register to its decimal string.
    fn op_float_tostring(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let cur = self.registers.get_float(reg, "FLOAT_TOSTRING")?;
        self.registers
            .set(reg, Value::Str(format!("{:.6}", cur).into_bytes()))?;
        self.advance();
        Ok(())
    }

    /// Unconditional jump.
    fn op_jump_to(&mut self) -> Result<(), VmError> {
        let target = self.read_address();
        self.trace(|| format!("JUMP_TO({:04X})", target));
        self.ip = target;
        Ok(())
    }

    /// Jump when the Z-flag is set.
    fn op_jump_z(&mut self) -> Result<(), VmError> {
        let target = self.read_address();
        self.trace(|| format!("JUMP_Z({:04X})", target));
        if self.zero_flag {
            self.ip = target;
        } else {
            self.advance();
        }
        Ok(())
    }

    /// Jump when the Z-flag is clear.
    fn op_jump_nz(&mut self) -> Result<(), VmError> {
        let target = self.read_address();
        self.trace(|| format!("JUMP_NZ({:04X})", target));
        if !self.zero_flag {
            self.ip = target;
        } else {
            self.advance();
        }
        Ok(())
    }

    /// Shared body of ADD/SUB/MUL/AND/OR/XOR.
    ///
    /// With no float operand the result is an integer reduced to the
    /// machine's 16-bit value space. With a float operand ADD/SUB/MUL
    /// promote and compute in float arithmetic, while the bitwise ops work
    /// at the storage level: both operands are read as raw integer storage
    /// (a float contributes its bit pattern) and the integer result lands
    /// in the destination's float field by numeric conversion.
    fn op_math(&mut self, op: MathOp) -> Result<(), VmError> {
        let instr = op.mnemonic();
        let dst = self.next_byte();
        let lhs = self.next_byte();
        let rhs = self.next_byte();
        self.trace(|| format!("{}(r{:02} = r{:02}, r{:02})", instr, dst, lhs, rhs));

        let float_operands = matches!(self.registers.get(lhs)?, Value::Float(_))
            || matches!(self.registers.get(rhs)?, Value::Float(_));
        let result = if float_operands && op.is_bitwise() {
            let a = self.raw_operand(lhs, instr)?;
            let b = self.raw_operand(rhs, instr)?;
            let bits = match op {
                MathOp::And => a & b,
                MathOp::Or => a | b,
                MathOp::Xor => a ^ b,
                MathOp::Add | MathOp::Sub | MathOp::Mul => 0,
            };
            Value::Float(bits as f32)
        } else if float_operands {
            let a = self.number_operand(lhs, instr)?;
            let b = self.number_operand(rhs, instr)?;
            Value::Float(match op {
                MathOp::Add => a + b,
                MathOp::Sub => a - b,
                MathOp::Mul => a * b,
                MathOp::And | MathOp::Or | MathOp::Xor => 0.0,
            })
        } else {
            let a = self.registers.get_int(lhs, instr)?;
            let b = self.registers.get_int(rhs, instr)?;
            let raw = match op {
                MathOp::Add => a.wrapping_add(b),
                MathOp::Sub => a.wrapping_sub(b),
                MathOp::Mul => a.wrapping_mul(b),
                MathOp::And => a & b,
                MathOp::Or => a | b,
                MathOp::Xor => a ^ b,
            };
            Value::Integer(raw & 0xFFFF)
        };
        self.store_math_result(dst, result)
    }

    /// Integer division; the divisor must be nonzero.
    fn op_divide(&mut self) -> Result<(), VmError> {
        let dst = self.next_byte();
        let lhs = self.next_byte();
        let rhs = self.next_byte();
        self.trace(|| format!("DIV(r{:02} = r{:02}, r{:02})", dst, lhs, rhs));
        let a = self.registers.get_int(lhs, "DIV")?;
        let b = self.registers.get_int(rhs, "DIV")?;
        if b == 0 {
            return Err(VmError::DivisionByZero);
        }
        self.store_math_result(dst, Value::Integer(a.wrapping_div(b) & 0xFFFF))
    }

    /// Increment the given integer register.
    fn op_inc(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let cur = self.registers.get_int(reg, "INC")?;
        let next = cur.wrapping_add(1) & 0xFFFF;
        self.registers.set(reg, Value::Integer(next))?;
        self.zero_flag = next == 0;
        self.advance();
        Ok(())
    }

    /// Decrement the given integer register.
    fn op_dec(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let cur = self.registers.get_int(reg, "DEC")?;
        let next = cur.wrapping_sub(1) & 0xFFFF;
        self.registers.set(reg, Value::Integer(next))?;
        self.zero_flag = next == 0;
        self.advance();
        Ok(())
    }

    /// Reads a register as a number, promoting an integer to float.
    fn number_operand(&self, idx: u8, instr: &'static str) -> Result<f32, VmError> {
        match self.registers.get(idx)? {
            Value::Float(f) => Ok(*f),
            Value::Integer(i) => Ok(*i as f32),
            other => Err(VmError::TypeMismatch {
                instruction: instr,
                register: idx,
                expected: "Integer or Float",
                actual: other.type_name(),
            }),
        }
    }

    /// Reads a register's raw integer storage for the bitwise float path.
    fn raw_operand(&self, idx: u8, instr: &'static str) -> Result<i32, VmError> {
        match self.registers.get(idx)? {
            Value::Str(_) => Err(VmError::TypeMismatch {
                instruction: instr,
                register: idx,
                expected: "Integer or Float",
                actual: "String",
            }),
            other => Ok(other.raw_int()),
        }
    }

    /// Writes an arithmetic result and derives the Z-flag from its raw
    /// integer storage (for a float result that is its bit pattern, so only
    /// +0.0 sets the flag).
    fn store_math_result(&mut self, dst: u8, result: Value) -> Result<(), VmError> {
        self.zero_flag = result.raw_int() == 0;
        self.registers.set(dst, result)?;
        self.advance();
        Ok(())
    }

    /// Store an inline string literal in a register.
    fn op_string_store(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let payload = self.read_inline_string();
        self.trace(|| {
            format!(
                "STRING_STORE(r{:02} = '{}')",
                reg,
                String::from_utf8_lossy(&payload)
            )
        });
        self.registers.set(reg, Value::Str(payload))?;
        self.advance();
        Ok(())
    }

    /// Emit the string contents of a register.
    fn op_string_print(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let bytes = self.registers.get_str(reg, "STRING_PRINT")?;
        let _ = self.output.write_all(bytes);
        self.advance();
        Ok(())
    }

    /// Concatenate two string registers into a destination register.
    fn op_string_concat(&mut self) -> Result<(), VmError> {
        let dst = self.next_byte();
        let lhs = self.next_byte();
        let rhs = self.next_byte();
        self.trace(|| format!("STRING_CONCAT(r{:02} = r{:02} + r{:02})", dst, lhs, rhs));
        let mut joined = self.registers.get_str(lhs, "STRING_CONCAT")?.to_vec();
        joined.extend_from_slice(self.registers.get_str(rhs, "STRING_CONCAT")?);
        self.registers.set(dst, Value::Str(joined))?;
        self.advance();
        Ok(())
    }

    /// Hand a string register to the host shell.
    ///
    /// Fatal unless the machine was built with `allow_system`. The command's
    /// exit status is not inspected.
    fn op_string_system(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let cmd = self.registers.get_str(reg, "STRING_SYSTEM")?;
        if !self.allow_system {
            return Err(VmError::SystemDisabled);
        }
        let cmd = String::from_utf8_lossy(cmd).into_owned();
        self.trace(|| format!("STRING_SYSTEM('{}')", cmd));
        let _ = Command::new("sh").arg("-c").arg(&cmd).status();
        self.advance();
        Ok(())
    }

    /// Convert a string register to the integer its text begins with.
    fn op_string_toint(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let parsed = parse_leading_int(self.registers.get_str(reg, "STRING_TOINT")?);
        self.registers.set(reg, Value::Integer(parsed))?;
        self.advance();
        Ok(())
    }

    /// Compare two registers; the Z-flag records equality.
    ///
    /// Strings compare by contents. Integer and float pairs compare their
    /// raw integer storage, so two floats are equal only when their bit
    /// patterns match. Registers of different types are never equal.
    fn op_cmp_reg(&mut self) -> Result<(), VmError> {
        let r1 = self.next_byte();
        let r2 = self.next_byte();
        self.trace(|| format!("CMP_REG(r{:02} vs r{:02})", r1, r2));
        let a = self.registers.get(r1)?;
        let b = self.registers.get(r2)?;
        self.zero_flag = match (a, b) {
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Integer(_), Value::Integer(_)) | (Value::Float(_), Value::Float(_)) => {
                a.raw_int() == b.raw_int()
            }
            _ => false,
        };
        self.advance();
        Ok(())
    }

    /// Compare an integer register with an immediate.
    fn op_cmp_immediate(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let val = i32::from(self.read_address());
        self.trace(|| format!("CMP_IMMEDIATE(r{:02} vs {:04X})", reg, val));
        let cur = self.registers.get_int(reg, "CMP_IMMEDIATE")?;
        self.zero_flag = cur == val;
        self.advance();
        Ok(())
    }

    /// Compare a string register with an inline literal.
    fn op_cmp_string(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let literal = self.read_inline_string();
        let cur = self.registers.get_str(reg, "CMP_STRING")?;
        self.zero_flag = cur == literal.as_slice();
        self.advance();
        Ok(())
    }

    /// Does the register hold a string? Z-flag records the answer.
    fn op_is_string(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        self.zero_flag = matches!(self.registers.get(reg)?, Value::Str(_));
        self.advance();
        Ok(())
    }

    /// Does the register hold an integer? Z-flag records the answer.
    fn op_is_integer(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        self.zero_flag = matches!(self.registers.get(reg)?, Value::Integer(_));
        self.advance();
        Ok(())
    }

    /// Copy one register into another. Strings are deep-copied.
    fn op_reg_store(&mut self) -> Result<(), VmError> {
        let dst = self.next_byte();
        let src = self.next_byte();
        self.trace(|| format!("STORE_REG(r{:02} = r{:02})", dst, src));
        let value = self.registers.get(src)?.clone();
        self.registers.set(dst, value)?;
        self.advance();
        Ok(())
    }

    /// Read a byte of code memory into a register.
    fn op_peek(&mut self) -> Result<(), VmError> {
        let dst = self.next_byte();
        let addr_reg = self.next_byte();
        let addr = self.registers.get_int(addr_reg, "PEEK")?;
        if !(0..=0xFFFF).contains(&addr) {
            return Err(VmError::AddressOutOfBounds { address: addr });
        }
        self.trace(|| format!("PEEK(r{:02} = [{:04X}])", dst, addr));
        let value = i32::from(self.code[addr as usize]);
        self.registers.set(dst, Value::Integer(value))?;
        self.advance();
        Ok(())
    }

    /// Write a register's low byte into code memory.
    fn op_poke(&mut self) -> Result<(), VmError> {
        let val_reg = self.next_byte();
        let addr_reg = self.next_byte();
        let value = self.registers.get_int(val_reg, "POKE")?;
        let addr = self.registers.get_int(addr_reg, "POKE")?;
        if !(0..=0xFFFF).contains(&addr) {
            return Err(VmError::AddressOutOfBounds { address: addr });
        }
        self.trace(|| format!("POKE([{:04X}] = {:02X})", addr, value as u8));
        self.code[addr as usize] = value as u8;
        self.advance();
        Ok(())
    }

    /// Copy a chunk of code memory byte-at-a-time.
    ///
    /// Each source and destination address wraps modulo 0x10000, so a copy
    /// starting near the top of memory continues from address 0. Negative
    /// addresses are fatal; a non-positive size copies nothing.
    fn op_memcpy(&mut self) -> Result<(), VmError> {
        let dst_reg = self.next_byte();
        let src_reg = self.next_byte();
        let size_reg = self.next_byte();
        let src = self.registers.get_int(src_reg, "MEMCPY")?;
        let dst = self.registers.get_int(dst_reg, "MEMCPY")?;
        let size = self.registers.get_int(size_reg, "MEMCPY")?;
        if src < 0 {
            return Err(VmError::AddressOutOfBounds { address: src });
        }
        if dst < 0 {
            return Err(VmError::AddressOutOfBounds { address: dst });
        }
        self.trace(|| format!("MEMCPY({:04X} <- {:04X}, {} bytes)", dst, src, size));
        for i in 0..size.max(0) as u32 {
            let from = ((src as u32 + i) & 0xFFFF) as usize;
            let to = ((dst as u32 + i) & 0xFFFF) as usize;
            self.code[to] = self.code[from];
        }
        self.advance();
        Ok(())
    }

    /// Push a copy of a register onto the data stack.
    fn op_stack_push(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        if self.stack.len() >= STACK_DEPTH {
            return Err(VmError::StackOverflow { limit: STACK_DEPTH });
        }
        let value = self.registers.get(reg)?.clone();
        self.trace(|| format!("PUSH(r{:02} {})", reg, value.type_name()));
        self.stack.push(value);
        self.advance();
        Ok(())
    }

    /// Pop the top of the data stack into a register.
    fn op_stack_pop(&mut self) -> Result<(), VmError> {
        let reg = self.next_byte();
        let value = self.stack.pop().ok_or(VmError::StackUnderflow)?;
        self.trace(|| format!("POP(r{:02} {})", reg, value.type_name()));
        self.registers.set(reg, value)?;
        self.advance();
        Ok(())
    }

    /// Call a routine: push the return address, jump to the operand.
    fn op_stack_call(&mut self) -> Result<(), VmError> {
        let target = self.read_address();
        if self.call_stack.len() >= CALL_STACK_DEPTH {
            return Err(VmError::CallStackOverflow {
                limit: CALL_STACK_DEPTH,
            });
        }
        // IP sits on the last operand byte; the instruction after it is the
        // return address.
        self.call_stack.push(self.ip.wrapping_add(1));
        self.trace(|| format!("CALL({:04X})", target));
        self.ip = target;
        Ok(())
    }

    /// Return from a call: pop the call stack into IP.
    fn op_stack_ret(&mut self) -> Result<(), VmError> {
        let target = self.call_stack.pop().ok_or(VmError::CallStackUnderflow)?;
        self.trace(|| format!("RET() => {:04X}", target));
        self.ip = target;
        Ok(())
    }

    /// Load a binary input channel into a register as an integer.
    fn op_binary_load(&mut self, io: &IoChannels) -> Result<(), VmError> {
        let dst = self.next_byte();
        let chan = self.next_byte();
        channel_bounds(chan, BINARY_IN_COUNT, "binary input")?;
        self.trace(|| format!("BINARY_LOAD(r{:02} = B{:02})", dst, chan));
        self.registers
            .set(dst, Value::Integer(i32::from(io.binary_in[chan as usize])))?;
        self.advance();
        Ok(())
    }

    /// Store a register's low byte into a binary output channel.
    ///
    /// Only an Integer register writes; any other tag leaves the channel
    /// untouched.
    fn op_binary_save(&mut self, io: &mut IoChannels) -> Result<(), VmError> {
        let src = self.next_byte();
        let chan = self.next_byte();
        channel_bounds(chan, BINARY_OUT_COUNT, "binary output")?;
        self.trace(|| format!("BINARY_SAVE(B{:02} = r{:02})", chan, src));
        if let Value::Integer(v) = self.registers.get(src)? {
            io.binary_out[chan as usize] = *v as u8;
        }
        self.advance();
        Ok(())
    }

    /// Load an analog input channel into a register as a float.
    fn op_analog_load(&mut self, io: &IoChannels) -> Result<(), VmError> {
        let dst = self.next_byte();
        let chan = self.next_byte();
        channel_bounds(chan, ANALOG_IN_COUNT, "analog input")?;
        self.trace(|| format!("ANALOG_LOAD(r{:02} = A{:02})", dst, chan));
        self.registers
            .set(dst, Value::Float(io.analog_in[chan as usize]))?;
        self.advance();
        Ok(())
    }

    /// Store a register into an analog output channel.
    ///
    /// A Float register writes its value, an Integer register is cast to
    /// float; a string leaves the channel untouched.
    fn op_analog_save(&mut self, io: &mut IoChannels) -> Result<(), VmError> {
        let src = self.next_byte();
        let chan = self.next_byte();
        channel_bounds(chan, ANALOG_OUT_COUNT, "analog output")?;
        self.trace(|| format!("ANALOG_SAVE(A{:02} = r{:02})", chan, src));
        match self.registers.get(src)? {
            Value::Float(f) => io.analog_out[chan as usize] = *f,
            Value::Integer(i) => io.analog_out[chan as usize] = *i as f32,
            Value::Str(_) => {}
        }
        self.advance();
        Ok(())
    }

    /// Load a variable channel into a register. Strings are deep-copied so
    /// the channel and the register never share a buffer.
    fn op_variable_load(&mut self, io: &IoChannels) -> Result<(), VmError> {
        let dst = self.next_byte();
        let chan = self.next_byte();
        channel_bounds(chan, VARIABLE_COUNT, "variable")?;
        self.trace(|| format!("VARIABLE_LOAD(r{:02} = V{:02})", dst, chan));
        let value = io.variable_io[chan as usize].clone();
        self.registers.set(dst, value)?;
        self.advance();
        Ok(())
    }

    /// Store a register into a variable channel, deep-copying strings.
    fn op_variable_save(&mut self, io: &mut IoChannels) -> Result<(), VmError> {
        let src = self.next_byte();
        let chan = self.next_byte();
        channel_bounds(chan, VARIABLE_COUNT, "variable")?;
        self.trace(|| format!("VARIABLE_SAVE(V{:02} = r{:02})", chan, src));
        io.variable_io[chan as usize] = self.registers.get(src)?.clone();
        self.advance();
        Ok(())
    }
}
