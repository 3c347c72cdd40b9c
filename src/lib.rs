//! Soft-PLC runtime library.
//!
//! Provides a register-based bytecode virtual machine that reads sensor-like
//! inputs (binary and analog channels), computes over them, and drives the
//! corresponding outputs.

pub mod utils;
pub mod vm;
