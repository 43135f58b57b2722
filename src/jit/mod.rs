//! Baseline JIT: translates an [`Executable`] into x86-64 machine code.
//!
//! - [`codebuf`]: byte buffer with labels and rel32 fixups
//! - [`x86_64`]: instruction encoder
//! - [`abi`]: register roles and the entry signature
//! - [`compiler`]: per-instruction fast and slow paths
//! - [`helpers`]: slow paths called from compiled code
//! - [`memory`]: W^X executable mappings
//! - [`native`]: the finished function, its offset map and perf-map output
//!
//! Code generation is architecture-independent Rust and always available;
//! only running the result requires an x86-64 Unix host.

pub mod abi;
pub mod codebuf;
pub mod compiler;
pub mod helpers;
pub mod memory;
pub mod native;
pub mod offset_map;
pub mod x86_64;

use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, trace};

pub use compiler::CompiledCode;
pub use memory::{ExecutableMemory, MemoryError};
pub use native::{NativeExecutable, PerfMap};
pub use offset_map::{Location, OffsetMap, OffsetMapEntry};

use crate::vm::{Executable, Vm};

/// Why a function could not be compiled. The caller falls back to the
/// interpreter for that function.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JitError {
    #[error("native code is only supported on x86-64 Unix hosts")]
    UnsupportedArchitecture,

    #[error("unsupported instruction: {0}")]
    UnsupportedInstruction(&'static str),

    #[error("label {0} was referenced but never bound")]
    UnlinkedLabel(u32),

    #[error("label {0} was bound twice")]
    LabelLinkedTwice(u32),

    #[error("branch displacement {0} does not fit in 32 bits")]
    BranchOutOfRange(i64),

    #[error("jump to unknown block {0}")]
    UnknownBlock(u32),

    #[error("register r{register} is outside the register file of {count}")]
    RegisterOutOfBounds { register: u32, count: u32 },

    #[error("local {index} is outside the {count} locals")]
    LocalOutOfBounds { index: u32, count: u32 },

    #[error("{kind} cache {index} does not exist")]
    MissingCache { kind: &'static str, index: u32 },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Compile `executable` and map it executable.
pub fn compile(vm: &Vm, executable: &Rc<Executable>) -> Result<NativeExecutable, JitError> {
    if !cfg!(all(target_arch = "x86_64", unix)) {
        return Err(JitError::UnsupportedArchitecture);
    }
    let compiled = compiler::compile(executable)?;
    debug!(
        function = %executable.name,
        blocks = executable.basic_blocks.len(),
        bytes = compiled.code.len(),
        "generated machine code"
    );
    if vm.config().trace_jit {
        for entry in compiled.offset_map.entries() {
            trace!(offset = entry.native_offset, location = ?entry.location, "offset map");
        }
    }
    NativeExecutable::new(&executable.name, compiled)
}
