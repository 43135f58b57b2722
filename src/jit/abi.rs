//! Register roles and calling convention for compiled code (System V AMD64).
//!
//! Compiled functions are entered through a single trampoline signature:
//!
//! ```text
//! extern "C" fn(unused, registers, locals, resume_address, context)
//!                rdi     rsi        rdx     rcx             r8
//! ```
//!
//! The prologue moves the three pointers into callee-saved role registers so
//! they survive helper calls, and caches the accumulator in another.

use super::x86_64::{Mem, Reg, Xmm};
use crate::vm::{ExecutionContext, Register, Value};

/// Signature of a compiled function's entry point.
pub type EntryFn = unsafe extern "C" fn(
    *const u8,
    *mut Value,
    *mut Value,
    u64,
    *const ExecutionContext,
);

/// Cached copy of register 0. Flushed before helper calls and on exit.
pub const ACCUMULATOR: Reg = Reg::R13;
/// Base of the register file.
pub const REGISTERS: Reg = Reg::Rbx;
/// Base of the locals array.
pub const LOCALS: Reg = Reg::R14;
/// The `ExecutionContext`.
pub const CONTEXT: Reg = Reg::R15;

/// Free for any single operation; never live across a helper call.
pub const SCRATCH: [Reg; 3] = [Reg::Rax, Reg::R10, Reg::R11];
pub const FLOAT_SCRATCH: [Xmm; 2] = [Xmm::XMM0, Xmm::XMM1];

/// Integer argument registers, in order.
pub const ARGUMENTS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
pub const RETURN: Reg = Reg::Rax;

/// Pushed by the prologue after rbp, in this order.
pub const CALLEE_SAVED: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Padding after the pushes that brings rsp back to 16-byte alignment:
/// return address + rbp + five saved registers is 56 bytes.
pub const FRAME_PADDING: i32 = 8;

/// Where a VM register lives relative to [`REGISTERS`].
pub fn register_slot(register: Register) -> Mem {
    Mem::base(REGISTERS, register.0 as i32 * 8)
}

/// Where a local lives relative to [`LOCALS`].
pub fn local_slot(index: u32) -> Mem {
    Mem::base(LOCALS, index as i32 * 8)
}

/// A field of the `ExecutionContext`.
pub fn context_field(offset: usize) -> Mem {
    Mem::base(CONTEXT, offset as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLES: [Reg; 4] = [ACCUMULATOR, REGISTERS, LOCALS, CONTEXT];

    #[test]
    fn test_roles_survive_calls() {
        for role in ROLES {
            assert!(CALLEE_SAVED.contains(&role), "{:?} is caller-saved", role);
        }
    }

    #[test]
    fn test_roles_are_disjoint_from_arguments_and_scratch() {
        for role in ROLES {
            assert!(!ARGUMENTS.contains(&role));
            assert!(!SCRATCH.contains(&role));
        }
        for scratch in SCRATCH {
            assert!(!ARGUMENTS.contains(&scratch));
        }
    }

    #[test]
    fn test_frame_is_aligned() {
        let pushed = 8 + 8 + CALLEE_SAVED.len() as i32 * 8 + FRAME_PADDING;
        assert_eq!(pushed % 16, 0);
    }

    #[test]
    fn test_slots() {
        assert_eq!(register_slot(Register::EXCEPTION), Mem::base(Reg::Rbx, 8));
        assert_eq!(local_slot(3), Mem::base(Reg::R14, 24));
    }
}
