//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_opcode!`](crate::for_each_opcode) macro holds the canonical
//! opcode list and invokes a callback macro for code generation, so multiple
//! places can generate opcode-related code without duplicating definitions.
//!
//! This module generates:
//! - The [`Opcode`] enum with byte mappings
//! - [`Opcode::from_byte`] for decoding (unknown bytes decode to `None` and
//!   execute as a no-op that advances the instruction pointer, so every one
//!   of the 256 byte values has defined behavior)
//! - [`Opcode::mnemonic`] for traces and error messages
//!
//! # Bytecode Format
//!
//! Programs are raw opcode streams with no header, magic number, or version
//! field. Operands use variable-length encoding:
//! - Opcode: 1 byte
//! - Register operand: 1 byte (bounds-checked at access time)
//! - Immediate / address: 2 bytes, little-endian, 0..0xFFFF
//! - Float: 4 bytes — imm16 exponent then imm16 mantissa; the value is
//!   `ldexp(mant / 65535.0, exp)`
//! - Inline string: imm16 length, one reserved byte, then the payload
//!   (embedded zero bytes permitted)

/// Invokes a callback macro with the complete opcode definition list.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            /// EXIT ; stop execution
            Exit = 0x00, "EXIT",
            /// INT_STORE reg, imm16 ; reg = imm16
            IntStore = 0x01, "INT_STORE",
            /// INT_PRINT reg ; emit the integer in reg
            IntPrint = 0x02, "INT_PRINT",
            /// INT_TOSTRING reg ; reg = decimal string of reg
            IntToString = 0x03, "INT_TOSTRING",
            /// INT_RANDOM reg ; reg = random integer 0..0xFFFF
            IntRandom = 0x04, "INT_RANDOM",
            /// FLOAT_STORE reg, exp16, mant16 ; reg = ldexp(mant / 65535, exp)
            FloatStore = 0x05, "FLOAT_STORE",
            /// FLOAT_PRINT reg ; emit the float in reg
            FloatPrint = 0x06, "FLOAT_PRINT",
            /// FLOAT_TOSTRING reg ; reg = decimal string of reg
            FloatToString = 0x07, "FLOAT_TOSTRING",
            /// JUMP_TO addr16 ; IP = addr
            JumpTo = 0x10, "JUMP_TO",
            /// JUMP_Z addr16 ; IP = addr if the Z-flag is set
            JumpZ = 0x11, "JUMP_Z",
            /// JUMP_NZ addr16 ; IP = addr if the Z-flag is clear
            JumpNz = 0x12, "JUMP_NZ",
            /// XOR dst, a, b ; dst = a ^ b
            Xor = 0x20, "XOR",
            /// ADD dst, a, b ; dst = a + b (float if either operand is float)
            Add = 0x21, "ADD",
            /// SUB dst, a, b ; dst = a - b (float if either operand is float)
            Sub = 0x22, "SUB",
            /// MUL dst, a, b ; dst = a * b (float if either operand is float)
            Mul = 0x23, "MUL",
            /// DIV dst, a, b ; dst = a / b (integer only, traps on zero)
            Div = 0x24, "DIV",
            /// INC reg ; reg += 1
            Inc = 0x25, "INC",
            /// DEC reg ; reg -= 1
            Dec = 0x26, "DEC",
            /// AND dst, a, b ; dst = a & b
            And = 0x27, "AND",
            /// OR dst, a, b ; dst = a | b
            Or = 0x28, "OR",
            /// STRING_STORE reg, str ; reg = inline string literal
            StringStore = 0x30, "STRING_STORE",
            /// STRING_PRINT reg ; emit the string in reg
            StringPrint = 0x31, "STRING_PRINT",
            /// STRING_CONCAT dst, a, b ; dst = a ++ b
            StringConcat = 0x32, "STRING_CONCAT",
            /// STRING_SYSTEM reg ; run the string as a host shell command
            StringSystem = 0x33, "STRING_SYSTEM",
            /// STRING_TOINT reg ; reg = parsed decimal, 0 on failure
            StringToInt = 0x34, "STRING_TOINT",
            /// CMP_REG a, b ; Z = (a == b)
            CmpReg = 0x40, "CMP_REG",
            /// CMP_IMMEDIATE reg, imm16 ; Z = (reg == imm16)
            CmpImmediate = 0x41, "CMP_IMMEDIATE",
            /// CMP_STRING reg, str ; Z = (reg == inline string)
            CmpString = 0x42, "CMP_STRING",
            /// IS_STRING reg ; Z = reg holds a string
            IsString = 0x43, "IS_STRING",
            /// IS_INTEGER reg ; Z = reg holds an integer
            IsInteger = 0x44, "IS_INTEGER",
            /// NOP ; no operation
            Nop = 0x50, "NOP",
            /// STORE_REG dst, src ; dst = copy of src
            StoreReg = 0x51, "STORE_REG",
            /// PEEK dst, addrReg ; dst = code[addrReg]
            Peek = 0x60, "PEEK",
            /// POKE valReg, addrReg ; code[addrReg] = low byte of valReg
            Poke = 0x61, "POKE",
            /// MEMCPY dstReg, srcReg, sizeReg ; copy size bytes within code memory
            Memcpy = 0x62, "MEMCPY",
            /// STACK_PUSH reg ; push reg onto the data stack
            StackPush = 0x70, "STACK_PUSH",
            /// STACK_POP reg ; pop the data stack into reg
            StackPop = 0x71, "STACK_POP",
            /// STACK_RET ; pop the call stack into IP
            StackRet = 0x72, "STACK_RET",
            /// STACK_CALL addr16 ; push the return address, IP = addr
            StackCall = 0x73, "STACK_CALL",
            /// BINARY_LOAD reg, chan ; reg = BINARY_IN[chan]
            BinaryLoad = 0x80, "BINARY_LOAD",
            /// BINARY_SAVE reg, chan ; BINARY_OUT[chan] = low byte of reg
            BinarySave = 0x81, "BINARY_SAVE",
            /// ANALOG_LOAD reg, chan ; reg = ANALOG_IN[chan]
            AnalogLoad = 0x82, "ANALOG_LOAD",
            /// ANALOG_SAVE reg, chan ; ANALOG_OUT[chan] = reg as float
            AnalogSave = 0x83, "ANALOG_SAVE",
            /// VARIABLE_LOAD reg, chan ; reg = copy of VARIABLE_IO[chan]
            VariableLoad = 0x84, "VARIABLE_LOAD",
            /// VARIABLE_SAVE reg, chan ; VARIABLE_IO[chan] = copy of reg
            VariableSave = 0x85, "VARIABLE_SAVE",
        }
    };
}

#[macro_export]
macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $byte:literal, $mnemonic:literal
        ),* $(,)?
    ) => {
        /// A decoded opcode byte.
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $byte,
            )*
        }

        impl Opcode {
            /// Decodes an opcode byte.
            ///
            /// Returns `None` for bytes with no assigned operation; the
            /// machine treats those as a silent advance, never a fault.
            pub const fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $byte => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_byte_round_trips() {
        assert_eq!(Opcode::from_byte(0x00), Some(Opcode::Exit));
        assert_eq!(Opcode::from_byte(0x21), Some(Opcode::Add));
        assert_eq!(Opcode::from_byte(0x30), Some(Opcode::StringStore));
        assert_eq!(Opcode::from_byte(0x73), Some(Opcode::StackCall));
        assert_eq!(Opcode::from_byte(0x85), Some(Opcode::VariableSave));
    }

    #[test]
    fn from_byte_unknown_is_none() {
        assert_eq!(Opcode::from_byte(0xFF), None);
        assert_eq!(Opcode::from_byte(0x0F), None);
        assert_eq!(Opcode::from_byte(0x90), None);
    }

    #[test]
    fn mnemonics() {
        assert_eq!(Opcode::Exit.mnemonic(), "EXIT");
        assert_eq!(Opcode::CmpImmediate.mnemonic(), "CMP_IMMEDIATE");
        assert_eq!(Opcode::BinaryLoad.mnemonic(), "BINARY_LOAD");
    }

    #[test]
    fn every_opcode_decodes_to_itself() {
        macro_rules! check_round_trip {
            ( $( $(#[$doc:meta])* $name:ident = $byte:literal, $mnemonic:literal ),* $(,)? ) => {
                $(
                    assert_eq!(Opcode::from_byte($byte), Some(Opcode::$name));
                    assert_eq!(Opcode::$name as u8, $byte);
                )*
            };
        }
        for_each_opcode!(check_round_trip);
    }
}
