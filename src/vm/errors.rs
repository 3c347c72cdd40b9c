use thiserror::Error;

/// Errors that can occur during VM execution.
///
/// Every variant is fatal: the handler that detects the condition returns
/// immediately and `run` reports it to the embedding, which decides whether
/// to abort or carry on with the machine discarded.
#[derive(Debug, Error)]
pub enum VmError {
    /// Register index exceeds the register file size.
    #[error("register index {index} out of bounds (register file holds {available})")]
    RegisterOutOfBounds { index: u8, available: usize },
    /// I/O channel index exceeds the channel array size.
    #[error("{channel} channel {index} out of bounds (limit {limit})")]
    ChannelOutOfBounds {
        channel: &'static str,
        index: u8,
        limit: usize,
    },
    /// Memory address outside the 64 KiB code segment.
    #[error("address {address} outside code memory")]
    AddressOutOfBounds { address: i32 },
    /// Operand register holds a value of the wrong type.
    #[error("instruction {instruction} expected register {register} to hold {expected} but found {actual}")]
    TypeMismatch {
        instruction: &'static str,
        register: u8,
        expected: &'static str,
        actual: &'static str,
    },
    /// DIV with a zero divisor.
    #[error("division by zero")]
    DivisionByZero,
    /// Push onto a full data stack.
    #[error("data stack overflow (depth {limit})")]
    StackOverflow { limit: usize },
    /// Pop from an empty data stack.
    #[error("data stack underflow")]
    StackUnderflow,
    /// Call with a full call stack.
    #[error("call stack overflow (depth {limit})")]
    CallStackOverflow { limit: usize },
    /// Return with an empty call stack.
    #[error("call stack underflow")]
    CallStackUnderflow,
    /// STRING_SYSTEM executed without `allow_system`.
    #[error("system command execution is disabled")]
    SystemDisabled,
}
