//! Host-level errors. Language exceptions stay `Value`s until they escape
//! the outermost call.

use thiserror::Error;

use crate::config::ConfigError;
use crate::jit::JitError;
use crate::vm::bytecode::BytecodeError;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("uncaught exception: {0}")]
    Uncaught(String),

    #[error("invalid resume token")]
    InvalidResumeToken,

    #[error("invalid bytecode: {0}")]
    Bytecode(#[from] BytecodeError),

    #[error(transparent)]
    Jit(#[from] JitError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed program: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
