pub mod bytecode;
pub mod environment;
pub mod heap;
pub mod ic;
pub mod interpreter;
pub mod ops;
pub mod realm;
mod value;
#[allow(clippy::module_inception)]
mod vm;

pub use bytecode::{
    BasicBlock, BinaryOp, BytecodeError, Executable, ExecutableBuilder, ExecutableDef, FunctionKind,
    IdentifierIndex, Immediate, Instruction, Label, Register, StringIndex, UnaryOp,
};
pub use environment::Environment;
pub use heap::{Heap, IndexedKind, Object, ObjectClass, ObjectRef, Shape};
pub use ops::Completion;
pub use realm::{Builtin, Realm};
pub use value::*;
pub use vm::{Continuation, ExecutionContext, Frame, FrameState, ResumeToken, Vm};
