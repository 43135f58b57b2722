//! Kiln - a baseline JIT for a NaN-boxed accumulator bytecode
//!
//! This library provides the bytecode VM, its interpreter and the x86-64
//! baseline compiler that runs alongside it.

pub mod config;
pub mod error;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{ConfigError, JitMode, RuntimeConfig};
pub use error::VmError;
pub use jit::{JitError, NativeExecutable};
pub use vm::{Executable, ExecutableBuilder, Value, Vm};
