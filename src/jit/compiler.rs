//! Baseline compiler: one pass over the basic blocks, one machine-code
//! sequence per instruction.
//!
//! Generated code keeps the interpreter's frame layout: VM registers and
//! locals stay in memory and only the accumulator is cached in a machine
//! register. Each instruction gets an inline fast path for the common value
//! shapes and falls back to a helper in [`super::helpers`] for everything
//! else, so results always agree with the interpreter.
//!
//! After any helper that can throw, the exception register is tested and a
//! pending exception is routed by the current block's metadata: to its
//! handler, to its finalizer, or out of the function.

use tracing::trace;

use super::JitError;
use super::abi::{
    self, ACCUMULATOR, ARGUMENTS, CALLEE_SAVED, CONTEXT, FRAME_PADDING, LOCALS, REGISTERS,
};
use super::codebuf::Label as CodeLabel;
use super::helpers;
use super::offset_map::{Location, OffsetMap};
use super::x86_64::{Alu, Assembler, Cond, Mem, Reg, Shift, Xmm};
use crate::vm::heap::SlotStorage;
use crate::vm::ic::{EnvironmentCache, GlobalVariableCache, PropertyLookupCache};
use crate::vm::{
    ACCESSOR_TAG, BASE_TAG, BOOLEAN_TAG, BasicBlock, BinaryOp, Builtin, CANONICAL_NAN_BITS,
    Environment, ExecutionContext, Executable, INT32_TAG, IdentifierIndex, IndexedKind,
    Instruction, Label, NAN_SPACE_MASK, NULL_TAG, NULLISH_TAG_MASK, OBJECT_TAG, Object,
    ObjectClass, Register, SHIFTED_BOOLEAN_TAG, SHIFTED_EMPTY_TAG, SHIFTED_INT32_TAG,
    StringIndex, TAG_SHIFT, UNDEFINED_TAG, UnaryOp, Value,
};

/// Output of a successful compilation, before it is mapped executable.
#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub offset_map: OffsetMap,
    /// Offsets of the blocks a suspended frame may resume at, ascending.
    pub resume_offsets: Vec<u32>,
}

/// Source of one helper-call argument.
#[derive(Debug, Clone, Copy)]
enum Arg {
    Context,
    Accumulator,
    Register(Register),
    /// A machine register; must not be `rax` or an earlier argument register.
    Gpr(Reg),
    Imm(u64),
}

/// Compile `executable` to position-independent x86-64 code.
pub fn compile(executable: &Executable) -> Result<CompiledCode, JitError> {
    let mut compiler = Compiler::new(executable);
    compiler.compile_all()?;
    compiler.finish()
}

struct Compiler<'a> {
    executable: &'a Executable,
    asm: Assembler,
    blocks: Vec<CodeLabel>,
    exit: CodeLabel,
    offset_map: OffsetMap,
}

const SIGN_MASK_CLEAR: u64 = 0x7FFF_FFFF_FFFF_FFFF;

fn slot_ptr(storage: usize) -> i32 {
    (storage + SlotStorage::ptr_offset()) as i32
}

fn slot_len(storage: usize) -> i32 {
    (storage + SlotStorage::len_offset()) as i32
}

impl<'a> Compiler<'a> {
    fn new(executable: &'a Executable) -> Self {
        let mut asm = Assembler::new();
        let blocks = executable.basic_blocks.iter().map(|_| asm.new_label()).collect();
        let exit = asm.new_label();
        Self {
            executable,
            asm,
            blocks,
            exit,
            offset_map: OffsetMap::new(),
        }
    }

    fn compile_all(&mut self) -> Result<(), JitError> {
        let executable = self.executable;
        self.offset_map.record(self.asm.offset(), Location::Prologue);
        self.emit_prologue();
        for (block_index, block) in executable.basic_blocks.iter().enumerate() {
            self.asm.bind(self.blocks[block_index])?;
            for (index, instruction) in block.instructions.iter().enumerate() {
                let offset = self.asm.offset();
                trace!(block = block_index, index, op = instruction.name(), offset, "emit");
                self.offset_map.record(
                    offset,
                    Location::Instruction {
                        block: block_index as u32,
                        index: index as u32,
                    },
                );
                self.compile_instruction(block, instruction)?;
            }
        }
        self.offset_map.record(self.asm.offset(), Location::Epilogue);
        self.emit_epilogue()
    }

    fn finish(self) -> Result<CompiledCode, JitError> {
        let mut resume_offsets = self
            .executable
            .continuation_blocks()
            .into_iter()
            .map(|label| {
                let code_label = self.block_label(label)?;
                self.asm
                    .label_offset(code_label)
                    .map(|offset| offset as u32)
                    .ok_or(JitError::UnknownBlock(label.0))
            })
            .collect::<Result<Vec<_>, _>>()?;
        resume_offsets.sort_unstable();
        resume_offsets.dedup();
        Ok(CompiledCode {
            code: self.asm.finish()?,
            offset_map: self.offset_map,
            resume_offsets,
        })
    }

    // ----- frame -----

    fn emit_prologue(&mut self) {
        self.asm.push(Reg::Rbp);
        self.asm.mov_rr(Reg::Rbp, Reg::Rsp);
        for reg in CALLEE_SAVED {
            self.asm.push(reg);
        }
        self.asm.alu_ri(Alu::Sub, Reg::Rsp, FRAME_PADDING);
        self.asm.mov_rr(REGISTERS, ARGUMENTS[1]);
        self.asm.mov_rr(LOCALS, ARGUMENTS[2]);
        self.asm.mov_rr(CONTEXT, ARGUMENTS[4]);
        self.asm.load(ACCUMULATOR, abi::register_slot(Register::ACCUMULATOR));
        // A non-zero resume address continues a suspended frame.
        self.asm.test_rr(ARGUMENTS[3], ARGUMENTS[3]);
        if let Some(&first) = self.blocks.first() {
            self.asm.jcc(Cond::E, first);
        } else {
            self.asm.jcc(Cond::E, self.exit);
        }
        self.asm.jmp_r(ARGUMENTS[3]);
    }

    fn emit_epilogue(&mut self) -> Result<(), JitError> {
        self.asm.bind(self.exit)?;
        self.flush_accumulator();
        self.asm.alu_ri(Alu::Add, Reg::Rsp, FRAME_PADDING);
        for reg in CALLEE_SAVED.into_iter().rev() {
            self.asm.pop(reg);
        }
        self.asm.pop(Reg::Rbp);
        self.asm.ret();
        Ok(())
    }

    // ----- operands -----

    fn block_label(&self, label: Label) -> Result<CodeLabel, JitError> {
        self.blocks
            .get(label.index())
            .copied()
            .ok_or(JitError::UnknownBlock(label.0))
    }

    fn register(&self, register: Register) -> Result<Mem, JitError> {
        self.register_range(register, 1)?;
        Ok(abi::register_slot(register))
    }

    fn register_range(&self, first: Register, count: u32) -> Result<(), JitError> {
        let limit = self.executable.register_count;
        match first.0.checked_add(count) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(JitError::RegisterOutOfBounds {
                register: first.0.saturating_add(count.saturating_sub(1)),
                count: limit,
            }),
        }
    }

    fn local(&self, index: u32) -> Result<Mem, JitError> {
        let count = self.executable.local_count();
        if index >= count {
            return Err(JitError::LocalOutOfBounds { index, count });
        }
        Ok(abi::local_slot(index))
    }

    fn property_cache(&self, index: u32) -> Result<u64, JitError> {
        self.executable
            .caches()
            .property(index)
            .map(|cache| cache as *const PropertyLookupCache as u64)
            .ok_or(JitError::MissingCache { kind: "property", index })
    }

    fn global_cache(&self, index: u32) -> Result<u64, JitError> {
        self.executable
            .caches()
            .global(index)
            .map(|cache| cache as *const GlobalVariableCache as u64)
            .ok_or(JitError::MissingCache { kind: "global", index })
    }

    fn environment_cache(&self, index: u32) -> Result<u64, JitError> {
        self.executable
            .caches()
            .environment(index)
            .map(|cache| cache as *const EnvironmentCache as u64)
            .ok_or(JitError::MissingCache { kind: "environment", index })
    }

    // ----- shared sequences -----

    fn flush_accumulator(&mut self) {
        self.asm.store(abi::register_slot(Register::ACCUMULATOR), ACCUMULATOR);
    }

    fn reload_accumulator(&mut self) {
        self.asm.load(ACCUMULATOR, abi::register_slot(Register::ACCUMULATOR));
    }

    fn load_arg(&mut self, dst: Reg, arg: Arg) {
        match arg {
            Arg::Context => self.asm.mov_rr(dst, CONTEXT),
            Arg::Accumulator => self.asm.mov_rr(dst, ACCUMULATOR),
            Arg::Register(register) => self.asm.load(dst, abi::register_slot(register)),
            Arg::Gpr(src) if src == dst => {}
            Arg::Gpr(src) => self.asm.mov_rr(dst, src),
            Arg::Imm(value) => self.asm.mov_ri(dst, value),
        }
    }

    /// Call a helper. Arguments past the sixth go on the stack, padded to
    /// keep rsp 16-byte aligned at the call. Result in rax.
    fn call_helper(&mut self, helper: usize, args: &[Arg]) {
        self.flush_accumulator();
        let (in_registers, on_stack) = args.split_at(args.len().min(ARGUMENTS.len()));
        let padded = on_stack.len() % 2 == 1;
        if padded {
            self.asm.alu_ri(Alu::Sub, Reg::Rsp, 8);
        }
        for &arg in on_stack.iter().rev() {
            self.load_arg(Reg::Rax, arg);
            self.asm.push(Reg::Rax);
        }
        for (&arg, reg) in in_registers.iter().zip(ARGUMENTS) {
            self.load_arg(reg, arg);
        }
        self.asm.mov_ri(Reg::Rax, helper as u64);
        self.asm.call_r(Reg::Rax);
        let popped = (on_stack.len() + padded as usize) * 8;
        if popped > 0 {
            self.asm.alu_ri(Alu::Add, Reg::Rsp, popped as i32);
        }
        self.reload_accumulator();
    }

    /// Jump to `target` if the tag of `value` is not `tag`. Clobbers `scratch`.
    fn branch_unless_tag(&mut self, value: Reg, tag: u64, scratch: Reg, target: CodeLabel) {
        self.load_tag(scratch, value);
        self.asm.alu_ri32(Alu::Cmp, scratch, tag as i32);
        self.asm.jcc(Cond::Ne, target);
    }

    fn branch_if_tag(&mut self, value: Reg, tag: u64, scratch: Reg, target: CodeLabel) {
        self.load_tag(scratch, value);
        self.asm.alu_ri32(Alu::Cmp, scratch, tag as i32);
        self.asm.jcc(Cond::E, target);
    }

    fn load_tag(&mut self, dst: Reg, value: Reg) {
        if dst != value {
            self.asm.mov_rr(dst, value);
        }
        self.asm.shift_ri(Shift::Shr, dst, TAG_SHIFT as u8);
    }

    /// Jump to `target` unless `value` is a double (canonical NaN included).
    fn branch_unless_double(&mut self, value: Reg, scratch: Reg, target: CodeLabel) -> Result<(), JitError> {
        let is_double = self.asm.new_label();
        self.load_tag(scratch, value);
        self.asm.alu_ri32(Alu::Cmp, scratch, BASE_TAG as i32);
        self.asm.jcc(Cond::E, is_double);
        self.asm.alu_ri32(Alu::And, scratch, NAN_SPACE_MASK as i32);
        self.asm.alu_ri32(Alu::Cmp, scratch, NAN_SPACE_MASK as i32);
        self.asm.jcc(Cond::E, target);
        self.asm.bind(is_double)
    }

    /// Convert an int32 or double in `value` to a double in `dst`; anything
    /// else jumps to `fail`.
    fn to_double(&mut self, value: Reg, dst: Xmm, scratch: Reg, fail: CodeLabel) -> Result<(), JitError> {
        let not_int32 = self.asm.new_label();
        let done = self.asm.new_label();
        self.branch_unless_tag(value, INT32_TAG, scratch, not_int32);
        self.asm.movsxd(scratch, value);
        self.asm.cvtsi2sd(dst, scratch);
        self.asm.jmp(done);
        self.asm.bind(not_int32)?;
        self.branch_unless_double(value, scratch, fail)?;
        self.asm.movq_to_xmm(dst, value);
        self.asm.bind(done)
    }

    /// Pointer to the cell behind a boxed cell value.
    fn unbox_cell(&mut self, dst: Reg, value: Reg) {
        if dst != value {
            self.asm.mov_rr(dst, value);
        }
        self.asm.shift_ri(Shift::Shl, dst, 16);
        self.asm.shift_ri(Shift::Sar, dst, 16);
    }

    /// Box the low dword of `src` as an int32 into the accumulator.
    fn box_int32(&mut self, src: Reg) {
        self.asm.mov_rr32(ACCUMULATOR, src);
        self.asm.mov_ri(Reg::R11, SHIFTED_INT32_TAG);
        self.asm.alu_rr(Alu::Or, ACCUMULATOR, Reg::R11);
    }

    /// Box the low byte of `src` (0 or 1) as a boolean into the accumulator.
    fn box_boolean(&mut self, src: Reg) {
        self.asm.movzx8(ACCUMULATOR, src);
        self.asm.mov_ri(Reg::R11, SHIFTED_BOOLEAN_TAG);
        self.asm.alu_rr(Alu::Or, ACCUMULATOR, Reg::R11);
    }

    /// Move a double result into the accumulator, replacing any NaN with the
    /// canonical one.
    fn box_double(&mut self, src: Xmm) -> Result<(), JitError> {
        let ordered = self.asm.new_label();
        self.asm.movq_from_xmm(Reg::Rax, src);
        self.asm.ucomisd(src, src);
        self.asm.jcc(Cond::Np, ordered);
        self.asm.mov_ri(Reg::Rax, CANONICAL_NAN_BITS);
        self.asm.bind(ordered)?;
        self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
        Ok(())
    }

    fn load_empty(&mut self, dst: Reg) {
        self.asm.mov_ri(dst, SHIFTED_EMPTY_TAG);
    }

    fn both_int32(&mut self, target: CodeLabel) {
        self.branch_unless_tag(ARGUMENTS[1], INT32_TAG, Reg::Rax, target);
        self.branch_unless_tag(ARGUMENTS[2], INT32_TAG, Reg::Rax, target);
    }

    /// Test the exception register after a helper call. Preserves rax.
    fn check_exception(&mut self, block: &BasicBlock) -> Result<(), JitError> {
        let no_exception = self.asm.new_label();
        self.asm.load(Reg::R11, abi::register_slot(Register::EXCEPTION));
        self.load_empty(Reg::R10);
        self.asm.alu_rr(Alu::Cmp, Reg::R11, Reg::R10);
        self.asm.jcc(Cond::E, no_exception);
        self.dispatch_exception(block)?;
        self.asm.bind(no_exception)
    }

    /// Route the pending exception according to `block`'s metadata.
    fn dispatch_exception(&mut self, block: &BasicBlock) -> Result<(), JitError> {
        if let Some(handler) = block.handler {
            let handler = self.block_label(handler)?;
            self.call_helper(helpers::unwind_to_handler as usize, &[Arg::Context]);
            self.asm.load(ACCUMULATOR, abi::register_slot(Register::EXCEPTION));
            self.load_empty(Reg::R10);
            self.asm.store(abi::register_slot(Register::EXCEPTION), Reg::R10);
            self.asm.jmp(handler);
        } else if let Some(finalizer) = block.finalizer {
            let finalizer = self.block_label(finalizer)?;
            self.asm.load(Reg::R11, abi::register_slot(Register::EXCEPTION));
            self.asm.store(abi::register_slot(Register::SAVED_EXCEPTION), Reg::R11);
            self.load_empty(Reg::R10);
            self.asm.store(abi::register_slot(Register::EXCEPTION), Reg::R10);
            self.asm.store(abi::register_slot(Register::SAVED_RETURN_VALUE), Reg::R10);
            self.asm.jmp(finalizer);
        } else {
            self.asm.jmp(self.exit);
        }
        Ok(())
    }

    /// Call a helper that may throw and put its result in the accumulator.
    fn call_for_value(&mut self, block: &BasicBlock, helper: usize, args: &[Arg]) -> Result<(), JitError> {
        self.call_helper(helper, args);
        self.check_exception(block)?;
        self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
        Ok(())
    }

    /// Call a helper that may throw and discard its result.
    fn call_for_effect(&mut self, block: &BasicBlock, helper: usize, args: &[Arg]) -> Result<(), JitError> {
        self.call_helper(helper, args);
        self.check_exception(block)
    }

    // ----- instructions -----

    fn compile_instruction(&mut self, block: &BasicBlock, instruction: &Instruction) -> Result<(), JitError> {
        match *instruction {
            Instruction::Load { src } => {
                let src = self.register(src)?;
                self.asm.load(ACCUMULATOR, src);
            }
            Instruction::LoadImmediate { value } => {
                self.asm.mov_ri(ACCUMULATOR, value.to_value().raw());
            }
            Instruction::Store { dst } => {
                let dst = self.register(dst)?;
                self.asm.store(dst, ACCUMULATOR);
            }
            Instruction::GetLocal { index } => self.compile_get_local(block, index)?,
            Instruction::SetLocal { index } => {
                let slot = self.local(index)?;
                self.asm.store(slot, ACCUMULATOR);
            }
            Instruction::NewString { string } => {
                self.call_helper(helpers::new_string as usize, &[Arg::Context, Arg::Imm(string.0 as u64)]);
                self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
            }
            Instruction::NewBigInt { string } => {
                self.call_helper(helpers::new_bigint as usize, &[Arg::Context, Arg::Imm(string.0 as u64)]);
                self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
            }
            Instruction::NewObject => {
                self.call_helper(helpers::new_object as usize, &[Arg::Context]);
                self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
            }
            Instruction::NewArray { first_element, element_count } => {
                self.register_range(first_element, element_count)?;
                self.call_helper(
                    helpers::new_array as usize,
                    &[
                        Arg::Context,
                        Arg::Imm(first_element.0 as u64),
                        Arg::Imm(element_count as u64),
                    ],
                );
                self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
            }
            Instruction::NewFunction { function } => {
                self.call_helper(helpers::new_function as usize, &[Arg::Context, Arg::Imm(function as u64)]);
                self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
            }
            Instruction::ResolveThisBinding => self.compile_resolve_this()?,

            Instruction::GetById { property, cache } => self.compile_get_by_id(block, property, cache)?,
            Instruction::PutById { base, property, cache } => {
                self.compile_put_by_id(block, base, property, cache)?
            }
            Instruction::DeleteById { property } => {
                self.call_for_value(
                    block,
                    helpers::delete_by_id as usize,
                    &[Arg::Context, Arg::Accumulator, Arg::Imm(property.0 as u64)],
                )?;
            }
            Instruction::GetByValue { base } => self.compile_get_by_value(block, base)?,
            Instruction::PutByValue { base, property } => self.compile_put_by_value(block, base, property)?,
            Instruction::GetVariable { identifier, cache } => {
                self.compile_get_variable(block, identifier, cache)?
            }
            Instruction::SetVariable { identifier, initialize } => {
                self.call_for_effect(
                    block,
                    helpers::set_variable as usize,
                    &[
                        Arg::Context,
                        Arg::Imm(identifier.0 as u64),
                        Arg::Accumulator,
                        Arg::Imm(initialize as u64),
                    ],
                )?;
            }
            Instruction::CreateVariable { identifier, mutable } => {
                self.call_helper(
                    helpers::create_variable as usize,
                    &[Arg::Context, Arg::Imm(identifier.0 as u64), Arg::Imm(mutable as u64)],
                );
            }
            Instruction::GetGlobal { identifier, cache } => self.compile_get_global(block, identifier, cache)?,
            Instruction::CreateLexicalEnvironment => {
                self.call_helper(helpers::create_lexical_environment as usize, &[Arg::Context]);
            }
            Instruction::LeaveLexicalEnvironment => {
                self.call_helper(helpers::leave_lexical_environment as usize, &[Arg::Context]);
            }

            Instruction::Call {
                callee,
                this_value,
                first_argument,
                argument_count,
                builtin,
                expression_string,
            } => self.compile_call(
                block,
                callee,
                this_value,
                first_argument,
                argument_count,
                builtin,
                expression_string,
            )?,

            Instruction::Jump { target } => {
                let target = self.block_label(target)?;
                self.asm.jmp(target);
            }
            Instruction::JumpConditional { true_target, false_target } => {
                self.compile_jump_conditional(true_target, false_target)?
            }
            Instruction::JumpNullish { true_target, false_target } => {
                self.load_tag(Reg::Rax, ACCUMULATOR);
                self.asm.alu_ri32(Alu::And, Reg::Rax, NULLISH_TAG_MASK as i32);
                self.asm.alu_ri32(Alu::Cmp, Reg::Rax, (UNDEFINED_TAG & NULLISH_TAG_MASK) as i32);
                self.branch_two_way(Cond::E, true_target, false_target)?;
            }
            Instruction::JumpUndefined { true_target, false_target } => {
                self.load_tag(Reg::Rax, ACCUMULATOR);
                self.asm.alu_ri32(Alu::Cmp, Reg::Rax, UNDEFINED_TAG as i32);
                self.branch_two_way(Cond::E, true_target, false_target)?;
            }
            Instruction::EnterUnwindContext { entry } => {
                let entry = self.block_label(entry)?;
                self.call_helper(helpers::enter_unwind_context as usize, &[Arg::Context]);
                self.asm.jmp(entry);
            }
            Instruction::LeaveUnwindContext => {
                self.call_helper(helpers::leave_unwind_context as usize, &[Arg::Context]);
            }
            Instruction::ContinuePendingUnwind { resume_target } => {
                self.compile_continue_pending_unwind(block, resume_target)?
            }
            Instruction::ScheduleJump { .. } => {
                return Err(JitError::UnsupportedInstruction(instruction.name()));
            }
            Instruction::Throw => {
                self.asm.store(abi::register_slot(Register::EXCEPTION), ACCUMULATOR);
                self.dispatch_exception(block)?;
            }
            Instruction::ThrowIfNotObject => {
                let ok = self.asm.new_label();
                self.branch_if_tag(ACCUMULATOR, OBJECT_TAG, Reg::Rax, ok);
                self.call_for_effect(
                    block,
                    helpers::throw_if_not_object as usize,
                    &[Arg::Context, Arg::Accumulator],
                )?;
                self.asm.bind(ok)?;
            }
            Instruction::ThrowIfNullish => {
                let ok = self.asm.new_label();
                self.load_tag(Reg::Rax, ACCUMULATOR);
                self.asm.alu_ri32(Alu::And, Reg::Rax, NULLISH_TAG_MASK as i32);
                self.asm.alu_ri32(Alu::Cmp, Reg::Rax, (NULL_TAG & NULLISH_TAG_MASK) as i32);
                self.asm.jcc(Cond::Ne, ok);
                self.call_for_effect(
                    block,
                    helpers::throw_if_nullish as usize,
                    &[Arg::Context, Arg::Accumulator],
                )?;
                self.asm.bind(ok)?;
            }
            Instruction::Return => match block.finalizer {
                Some(finalizer) => {
                    let finalizer = self.block_label(finalizer)?;
                    self.asm.store(abi::register_slot(Register::SAVED_RETURN_VALUE), ACCUMULATOR);
                    self.asm.jmp(finalizer);
                }
                None => {
                    self.asm.store(abi::register_slot(Register::RETURN_VALUE), ACCUMULATOR);
                    self.asm.jmp(self.exit);
                }
            },
            Instruction::Yield { continuation } => self.compile_suspend(continuation, false)?,
            Instruction::Await { continuation } => self.compile_suspend(Some(continuation), true)?,

            _ => {
                if let Some((op, lhs)) = instruction.as_binary() {
                    self.compile_binary(block, op, lhs)?;
                } else if let Some(op) = instruction.as_unary() {
                    self.compile_unary(block, op)?;
                } else {
                    return Err(JitError::UnsupportedInstruction(instruction.name()));
                }
            }
        }
        Ok(())
    }

    fn branch_two_way(&mut self, cond: Cond, if_true: Label, if_false: Label) -> Result<(), JitError> {
        let if_true = self.block_label(if_true)?;
        let if_false = self.block_label(if_false)?;
        self.asm.jcc(cond, if_true);
        self.asm.jmp(if_false);
        Ok(())
    }

    fn compile_get_local(&mut self, block: &BasicBlock, index: u32) -> Result<(), JitError> {
        let slot = self.local(index)?;
        let initialized = self.asm.new_label();
        self.asm.load(Reg::Rax, slot);
        self.load_empty(Reg::R10);
        self.asm.alu_rr(Alu::Cmp, Reg::Rax, Reg::R10);
        self.asm.jcc(Cond::Ne, initialized);
        self.call_helper(
            helpers::throw_uninitialized_local as usize,
            &[Arg::Context, Arg::Imm(index as u64)],
        );
        self.check_exception(block)?;
        self.asm.bind(initialized)?;
        self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
        Ok(())
    }

    fn compile_resolve_this(&mut self) -> Result<(), JitError> {
        let bound = self.asm.new_label();
        self.asm.load(Reg::Rax, abi::register_slot(Register::THIS));
        self.load_empty(Reg::R10);
        self.asm.alu_rr(Alu::Cmp, Reg::Rax, Reg::R10);
        self.asm.jcc(Cond::Ne, bound);
        self.asm.mov_ri(Reg::Rax, Value::undefined().raw());
        self.asm.bind(bound)?;
        self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
        Ok(())
    }

    // ----- arithmetic -----

    fn compile_binary(&mut self, block: &BasicBlock, op: BinaryOp, lhs: Register) -> Result<(), JitError> {
        let lhs = self.register(lhs)?;
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let (lhs_reg, rhs_reg) = (ARGUMENTS[1], ARGUMENTS[2]);
        self.asm.load(lhs_reg, lhs);
        self.asm.mov_rr(rhs_reg, ACCUMULATOR);

        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => self.fast_arithmetic(op, slow, done)?,
            BinaryOp::Div => {
                self.to_double(lhs_reg, Xmm::XMM0, Reg::Rax, slow)?;
                self.to_double(rhs_reg, Xmm::XMM1, Reg::Rax, slow)?;
                self.asm.divsd(Xmm::XMM0, Xmm::XMM1);
                self.box_double(Xmm::XMM0)?;
                self.asm.jmp(done);
            }
            BinaryOp::Mod => {
                // Only non-negative dividends and positive divisors: other
                // signs can produce -0 or trap.
                self.both_int32(slow);
                self.asm.mov_rr32(Reg::Rax, lhs_reg);
                self.asm.test_rr32(Reg::Rax, Reg::Rax);
                self.asm.jcc(Cond::S, slow);
                self.asm.mov_rr32(Reg::R11, rhs_reg);
                self.asm.test_rr32(Reg::R11, Reg::R11);
                self.asm.jcc(Cond::Le, slow);
                self.asm.cdq();
                self.asm.idiv32(Reg::R11);
                self.box_int32(Reg::Rdx);
                self.asm.jmp(done);
            }
            BinaryOp::BitwiseAnd | BinaryOp::BitwiseOr | BinaryOp::BitwiseXor => {
                let alu = match op {
                    BinaryOp::BitwiseAnd => Alu::And,
                    BinaryOp::BitwiseOr => Alu::Or,
                    _ => Alu::Xor,
                };
                self.both_int32(slow);
                self.asm.mov_rr32(Reg::Rax, lhs_reg);
                self.asm.alu_rr32(alu, Reg::Rax, rhs_reg);
                self.box_int32(Reg::Rax);
                self.asm.jmp(done);
            }
            BinaryOp::LeftShift | BinaryOp::RightShift | BinaryOp::UnsignedRightShift => {
                let shift = match op {
                    BinaryOp::LeftShift => Shift::Shl,
                    BinaryOp::RightShift => Shift::Sar,
                    _ => Shift::Shr,
                };
                self.both_int32(slow);
                self.asm.mov_rr32(Reg::Rax, lhs_reg);
                self.asm.mov_rr32(Reg::Rcx, rhs_reg);
                self.asm.shift_cl32(shift, Reg::Rax);
                if shift == Shift::Shr {
                    // Results above i32::MAX need a double.
                    self.asm.test_rr32(Reg::Rax, Reg::Rax);
                    self.asm.jcc(Cond::S, slow);
                }
                self.box_int32(Reg::Rax);
                self.asm.jmp(done);
            }
            BinaryOp::LessThan | BinaryOp::LessThanEquals | BinaryOp::GreaterThan | BinaryOp::GreaterThanEquals => {
                self.fast_relational(op, slow, done)?
            }
            BinaryOp::LooselyEquals
            | BinaryOp::LooselyInequals
            | BinaryOp::StrictlyEquals
            | BinaryOp::StrictlyInequals => {
                let negate = matches!(op, BinaryOp::LooselyInequals | BinaryOp::StrictlyInequals);
                self.fast_equality(negate, slow, done)?
            }
            // Falls through to the helper call.
            BinaryOp::Exp => {}
        }

        self.asm.bind(slow)?;
        self.call_for_value(
            block,
            helpers::binary as usize,
            &[Arg::Context, Arg::Gpr(lhs_reg), Arg::Gpr(rhs_reg), Arg::Imm(op as u64)],
        )?;
        self.asm.bind(done)
    }

    fn fast_arithmetic(&mut self, op: BinaryOp, slow: CodeLabel, done: CodeLabel) -> Result<(), JitError> {
        let (lhs_reg, rhs_reg) = (ARGUMENTS[1], ARGUMENTS[2]);
        let not_int32 = self.asm.new_label();
        self.both_int32(not_int32);
        self.asm.mov_rr32(Reg::Rax, lhs_reg);
        match op {
            BinaryOp::Add => self.asm.alu_rr32(Alu::Add, Reg::Rax, rhs_reg),
            BinaryOp::Sub => self.asm.alu_rr32(Alu::Sub, Reg::Rax, rhs_reg),
            _ => self.asm.imul_rr32(Reg::Rax, rhs_reg),
        }
        self.asm.jcc(Cond::O, slow);
        if op == BinaryOp::Mul {
            // A zero product may need to be -0.
            self.asm.test_rr32(Reg::Rax, Reg::Rax);
            self.asm.jcc(Cond::E, slow);
        }
        self.box_int32(Reg::Rax);
        self.asm.jmp(done);

        self.asm.bind(not_int32)?;
        self.to_double(lhs_reg, Xmm::XMM0, Reg::Rax, slow)?;
        self.to_double(rhs_reg, Xmm::XMM1, Reg::Rax, slow)?;
        match op {
            BinaryOp::Add => self.asm.addsd(Xmm::XMM0, Xmm::XMM1),
            BinaryOp::Sub => self.asm.subsd(Xmm::XMM0, Xmm::XMM1),
            _ => self.asm.mulsd(Xmm::XMM0, Xmm::XMM1),
        }
        self.box_double(Xmm::XMM0)?;
        self.asm.jmp(done);
        Ok(())
    }

    fn fast_relational(&mut self, op: BinaryOp, slow: CodeLabel, done: CodeLabel) -> Result<(), JitError> {
        let (lhs_reg, rhs_reg) = (ARGUMENTS[1], ARGUMENTS[2]);
        let not_int32 = self.asm.new_label();
        self.both_int32(not_int32);
        self.asm.alu_rr32(Alu::Cmp, lhs_reg, rhs_reg);
        let cond = match op {
            BinaryOp::LessThan => Cond::L,
            BinaryOp::LessThanEquals => Cond::Le,
            BinaryOp::GreaterThan => Cond::G,
            _ => Cond::Ge,
        };
        self.asm.setcc(cond, Reg::Rax);
        self.box_boolean(Reg::Rax);
        self.asm.jmp(done);

        // Doubles: compare so that "above" means the relation holds; an
        // unordered result sets CF and reads as false.
        self.asm.bind(not_int32)?;
        self.to_double(lhs_reg, Xmm::XMM0, Reg::Rax, slow)?;
        self.to_double(rhs_reg, Xmm::XMM1, Reg::Rax, slow)?;
        let (a, b, cond) = match op {
            BinaryOp::LessThan => (Xmm::XMM1, Xmm::XMM0, Cond::A),
            BinaryOp::LessThanEquals => (Xmm::XMM1, Xmm::XMM0, Cond::Ae),
            BinaryOp::GreaterThan => (Xmm::XMM0, Xmm::XMM1, Cond::A),
            _ => (Xmm::XMM0, Xmm::XMM1, Cond::Ae),
        };
        self.asm.ucomisd(a, b);
        self.asm.setcc(cond, Reg::Rax);
        self.box_boolean(Reg::Rax);
        self.asm.jmp(done);
        Ok(())
    }

    /// Numbers compare numerically; identical tags among boolean, undefined,
    /// null and object compare by bits. Everything else goes slow.
    fn fast_equality(&mut self, negate: bool, slow: CodeLabel, done: CodeLabel) -> Result<(), JitError> {
        let (lhs_reg, rhs_reg) = (ARGUMENTS[1], ARGUMENTS[2]);
        let equal = if negate { Cond::Ne } else { Cond::E };
        let not_int32 = self.asm.new_label();
        let not_numbers = self.asm.new_label();
        let same_kind = self.asm.new_label();

        self.both_int32(not_int32);
        self.asm.alu_rr32(Alu::Cmp, lhs_reg, rhs_reg);
        self.asm.setcc(equal, Reg::Rax);
        self.box_boolean(Reg::Rax);
        self.asm.jmp(done);

        self.asm.bind(not_int32)?;
        self.to_double(lhs_reg, Xmm::XMM0, Reg::Rax, not_numbers)?;
        self.to_double(rhs_reg, Xmm::XMM1, Reg::Rax, not_numbers)?;
        self.asm.ucomisd(Xmm::XMM0, Xmm::XMM1);
        if negate {
            self.asm.setcc(Cond::Ne, Reg::Rax);
            self.asm.setcc(Cond::P, Reg::Rcx);
        } else {
            self.asm.setcc(Cond::E, Reg::Rax);
            self.asm.setcc(Cond::Np, Reg::Rcx);
        }
        self.asm.movzx8(Reg::Rax, Reg::Rax);
        self.asm.movzx8(Reg::Rcx, Reg::Rcx);
        self.asm.alu_rr32(if negate { Alu::Or } else { Alu::And }, Reg::Rax, Reg::Rcx);
        self.box_boolean(Reg::Rax);
        self.asm.jmp(done);

        self.asm.bind(not_numbers)?;
        self.load_tag(Reg::Rax, lhs_reg);
        self.load_tag(Reg::Rcx, rhs_reg);
        self.asm.alu_rr(Alu::Cmp, Reg::Rax, Reg::Rcx);
        self.asm.jcc(Cond::Ne, slow);
        for tag in [BOOLEAN_TAG, UNDEFINED_TAG, NULL_TAG, OBJECT_TAG] {
            self.asm.alu_ri32(Alu::Cmp, Reg::Rax, tag as i32);
            self.asm.jcc(Cond::E, same_kind);
        }
        self.asm.jmp(slow);

        self.asm.bind(same_kind)?;
        self.asm.alu_rr(Alu::Cmp, lhs_reg, rhs_reg);
        self.asm.setcc(equal, Reg::Rax);
        self.box_boolean(Reg::Rax);
        self.asm.jmp(done);
        Ok(())
    }

    fn compile_unary(&mut self, block: &BasicBlock, op: UnaryOp) -> Result<(), JitError> {
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        match op {
            UnaryOp::Not => {
                self.branch_unless_tag(ACCUMULATOR, BOOLEAN_TAG, Reg::Rax, slow);
                self.asm.alu_ri(Alu::Xor, ACCUMULATOR, 1);
                self.asm.jmp(done);
            }
            UnaryOp::UnaryMinus => {
                // 0 and i32::MIN negate to -0 and 2^31.
                self.branch_unless_tag(ACCUMULATOR, INT32_TAG, Reg::Rax, slow);
                self.asm.mov_rr32(Reg::Rax, ACCUMULATOR);
                self.asm.test_rr32(Reg::Rax, Reg::Rax);
                self.asm.jcc(Cond::E, slow);
                self.asm.alu_ri32(Alu::Cmp, Reg::Rax, i32::MIN);
                self.asm.jcc(Cond::E, slow);
                self.asm.neg32(Reg::Rax);
                self.box_int32(Reg::Rax);
                self.asm.jmp(done);
            }
            UnaryOp::BitwiseNot => {
                self.branch_unless_tag(ACCUMULATOR, INT32_TAG, Reg::Rax, slow);
                self.asm.mov_rr32(Reg::Rax, ACCUMULATOR);
                self.asm.not32(Reg::Rax);
                self.box_int32(Reg::Rax);
                self.asm.jmp(done);
            }
            UnaryOp::Increment | UnaryOp::Decrement => {
                let alu = if op == UnaryOp::Increment { Alu::Add } else { Alu::Sub };
                self.branch_unless_tag(ACCUMULATOR, INT32_TAG, Reg::Rax, slow);
                self.asm.mov_rr32(Reg::Rax, ACCUMULATOR);
                self.asm.alu_ri32(alu, Reg::Rax, 1);
                self.asm.jcc(Cond::O, slow);
                self.box_int32(Reg::Rax);
                self.asm.jmp(done);
            }
            UnaryOp::UnaryPlus | UnaryOp::ToNumeric => {
                // Numbers are already numeric.
                self.branch_if_tag(ACCUMULATOR, INT32_TAG, Reg::Rax, done);
                self.branch_unless_double(ACCUMULATOR, Reg::Rax, slow)?;
                self.asm.jmp(done);
            }
            // Falls through to the helper call.
            UnaryOp::Typeof => {}
        }
        self.asm.bind(slow)?;
        self.call_for_value(
            block,
            helpers::unary as usize,
            &[Arg::Context, Arg::Accumulator, Arg::Imm(op as u64)],
        )?;
        self.asm.bind(done)
    }

    // ----- control flow -----

    fn compile_jump_conditional(&mut self, if_true: Label, if_false: Label) -> Result<(), JitError> {
        let not_boolean = self.asm.new_label();
        let slow = self.asm.new_label();
        let if_true_label = self.block_label(if_true)?;
        let if_false_label = self.block_label(if_false)?;

        // Booleans and int32s are truthy iff the low dword is non-zero.
        self.load_tag(Reg::Rax, ACCUMULATOR);
        self.asm.alu_ri32(Alu::Cmp, Reg::Rax, BOOLEAN_TAG as i32);
        self.asm.jcc(Cond::Ne, not_boolean);
        self.asm.test_rr32(ACCUMULATOR, ACCUMULATOR);
        self.asm.jcc(Cond::Ne, if_true_label);
        self.asm.jmp(if_false_label);

        self.asm.bind(not_boolean)?;
        self.asm.alu_ri32(Alu::Cmp, Reg::Rax, INT32_TAG as i32);
        self.asm.jcc(Cond::Ne, slow);
        self.asm.test_rr32(ACCUMULATOR, ACCUMULATOR);
        self.asm.jcc(Cond::Ne, if_true_label);
        self.asm.jmp(if_false_label);

        self.asm.bind(slow)?;
        self.call_helper(helpers::to_boolean as usize, &[Arg::Accumulator]);
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        self.asm.jcc(Cond::Ne, if_true_label);
        self.asm.jmp(if_false_label);
        Ok(())
    }

    fn compile_continue_pending_unwind(&mut self, block: &BasicBlock, resume_target: Label) -> Result<(), JitError> {
        let resume_target = self.block_label(resume_target)?;
        self.asm.load(Reg::Rax, abi::register_slot(Register::SAVED_EXCEPTION));
        self.asm.store(abi::register_slot(Register::EXCEPTION), Reg::Rax);
        self.load_empty(Reg::R10);
        self.asm.store(abi::register_slot(Register::SAVED_EXCEPTION), Reg::R10);
        self.check_exception(block)?;

        self.asm.load(Reg::Rax, abi::register_slot(Register::SAVED_RETURN_VALUE));
        self.load_empty(Reg::R10);
        self.asm.alu_rr(Alu::Cmp, Reg::Rax, Reg::R10);
        self.asm.jcc(Cond::E, resume_target);
        self.asm.store(abi::register_slot(Register::RETURN_VALUE), Reg::Rax);
        self.asm.jmp(self.exit);
        Ok(())
    }

    /// `Yield`/`Await`: build the continuation record with the absolute
    /// address of the resume block and leave the function.
    fn compile_suspend(&mut self, continuation: Option<Label>, is_await: bool) -> Result<(), JitError> {
        let address = ARGUMENTS[2];
        match continuation {
            Some(label) => {
                let label = self.block_label(label)?;
                self.asm.lea_label(address, label);
            }
            None => self.asm.mov_ri(address, 0),
        }
        self.call_helper(
            helpers::create_continuation as usize,
            &[Arg::Context, Arg::Accumulator, Arg::Gpr(address), Arg::Imm(is_await as u64)],
        );
        self.asm.store(abi::register_slot(Register::RETURN_VALUE), Reg::Rax);
        self.asm.jmp(self.exit);
        Ok(())
    }

    // ----- properties -----

    fn compile_get_by_id(&mut self, block: &BasicBlock, property: IdentifierIndex, cache: u32) -> Result<(), JitError> {
        let cell = self.property_cache(cache)?;
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let is_length = &**self.executable.identifier(property) == "length";

        self.branch_unless_tag(ACCUMULATOR, OBJECT_TAG, Reg::Rax, slow);
        self.unbox_cell(Reg::Rax, ACCUMULATOR);

        if is_length {
            let not_array = self.asm.new_label();
            self.branch_unless_simple_array(Reg::Rax, Reg::R10, not_array);
            self.asm.load32(Reg::R10, Mem::base(Reg::Rax, slot_len(Object::elements_offset())));
            self.asm.test_rr32(Reg::R10, Reg::R10);
            self.asm.jcc(Cond::S, slow);
            self.box_int32(Reg::R10);
            self.asm.jmp(done);
            self.asm.bind(not_array)?;
        }

        self.asm.mov_ri(Reg::R10, cell);
        self.asm.load(Reg::R11, Mem::base(Reg::R10, PropertyLookupCache::shape_offset() as i32));
        self.asm.load(Reg::Rcx, Mem::base(Reg::Rax, Object::shape_offset() as i32));
        self.asm.alu_rr(Alu::Cmp, Reg::R11, Reg::Rcx);
        self.asm.jcc(Cond::Ne, slow);
        self.asm.load32(Reg::R11, Mem::base(Reg::R10, PropertyLookupCache::slot_offset() as i32));
        self.asm.load(Reg::Rax, Mem::base(Reg::Rax, slot_ptr(Object::named_offset())));
        self.asm.load(Reg::Rax, Mem::indexed(Reg::Rax, Reg::R11));
        self.branch_if_tag(Reg::Rax, ACCESSOR_TAG, Reg::Rcx, slow);
        self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
        self.asm.jmp(done);

        self.asm.bind(slow)?;
        self.call_for_value(
            block,
            helpers::get_by_id as usize,
            &[
                Arg::Context,
                Arg::Accumulator,
                Arg::Imm(property.0 as u64),
                Arg::Imm(cache as u64),
            ],
        )?;
        self.asm.bind(done)
    }

    fn compile_put_by_id(
        &mut self,
        block: &BasicBlock,
        base: Register,
        property: IdentifierIndex,
        cache: u32,
    ) -> Result<(), JitError> {
        let base = self.register(base)?;
        let cell = self.property_cache(cache)?;
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let base_reg = ARGUMENTS[1];

        self.asm.load(base_reg, base);
        self.branch_unless_tag(base_reg, OBJECT_TAG, Reg::Rax, slow);
        self.unbox_cell(Reg::Rax, base_reg);
        self.asm.mov_ri(Reg::R10, cell);
        self.asm.load(Reg::R11, Mem::base(Reg::R10, PropertyLookupCache::shape_offset() as i32));
        self.asm.load(Reg::Rcx, Mem::base(Reg::Rax, Object::shape_offset() as i32));
        self.asm.alu_rr(Alu::Cmp, Reg::R11, Reg::Rcx);
        self.asm.jcc(Cond::Ne, slow);
        self.asm.load32(Reg::R11, Mem::base(Reg::R10, PropertyLookupCache::slot_offset() as i32));
        self.asm.load(Reg::Rax, Mem::base(Reg::Rax, slot_ptr(Object::named_offset())));
        // Setters run through the slow path.
        self.asm.load(Reg::Rcx, Mem::indexed(Reg::Rax, Reg::R11));
        self.branch_if_tag(Reg::Rcx, ACCESSOR_TAG, Reg::Rcx, slow);
        self.asm.store(Mem::indexed(Reg::Rax, Reg::R11), ACCUMULATOR);
        self.asm.jmp(done);

        self.asm.bind(slow)?;
        self.call_for_effect(
            block,
            helpers::put_by_id as usize,
            &[
                Arg::Context,
                Arg::Gpr(base_reg),
                Arg::Accumulator,
                Arg::Imm(property.0 as u64),
                Arg::Imm(cache as u64),
            ],
        )?;
        self.asm.bind(done)
    }

    /// Jump to `target` unless the object at `object` is an array with
    /// simple indexed storage. Clobbers `scratch`.
    fn branch_unless_simple_array(&mut self, object: Reg, scratch: Reg, target: CodeLabel) {
        self.asm.load8(scratch, Mem::base(object, Object::class_offset() as i32));
        self.asm.alu_ri32(Alu::Cmp, scratch, ObjectClass::Array as i32);
        self.asm.jcc(Cond::Ne, target);
        self.asm.load8(scratch, Mem::base(object, Object::indexed_kind_offset() as i32));
        self.asm.alu_ri32(Alu::Cmp, scratch, IndexedKind::Simple as i32);
        self.asm.jcc(Cond::Ne, target);
    }

    /// Shared guard for indexed access: base object in `base_reg`, key in
    /// `key_reg`. Leaves the element pointer in rax and the index in r11.
    fn indexed_element(&mut self, base_reg: Reg, key_reg: Reg, slow: CodeLabel) {
        self.branch_unless_tag(base_reg, OBJECT_TAG, Reg::Rax, slow);
        self.branch_unless_tag(key_reg, INT32_TAG, Reg::Rax, slow);
        self.asm.mov_rr32(Reg::R11, key_reg);
        self.asm.test_rr32(Reg::R11, Reg::R11);
        self.asm.jcc(Cond::S, slow);
        self.unbox_cell(Reg::Rax, base_reg);
        self.branch_unless_simple_array(Reg::Rax, Reg::R10, slow);
        self.asm.load32(Reg::R10, Mem::base(Reg::Rax, slot_len(Object::elements_offset())));
        self.asm.alu_rr32(Alu::Cmp, Reg::R11, Reg::R10);
        self.asm.jcc(Cond::Ae, slow);
        self.asm.load(Reg::Rax, Mem::base(Reg::Rax, slot_ptr(Object::elements_offset())));
    }

    fn compile_get_by_value(&mut self, block: &BasicBlock, base: Register) -> Result<(), JitError> {
        let base = self.register(base)?;
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let (base_reg, key_reg) = (ARGUMENTS[1], ARGUMENTS[2]);
        self.asm.load(base_reg, base);
        self.asm.mov_rr(key_reg, ACCUMULATOR);

        self.indexed_element(base_reg, key_reg, slow);
        self.asm.load(Reg::Rax, Mem::indexed(Reg::Rax, Reg::R11));
        // Holes consult the prototype chain.
        self.load_empty(Reg::R10);
        self.asm.alu_rr(Alu::Cmp, Reg::Rax, Reg::R10);
        self.asm.jcc(Cond::E, slow);
        self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
        self.asm.jmp(done);

        self.asm.bind(slow)?;
        self.call_for_value(
            block,
            helpers::get_by_value as usize,
            &[Arg::Context, Arg::Gpr(base_reg), Arg::Gpr(key_reg)],
        )?;
        self.asm.bind(done)
    }

    fn compile_put_by_value(&mut self, block: &BasicBlock, base: Register, property: Register) -> Result<(), JitError> {
        let base = self.register(base)?;
        let property = self.register(property)?;
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let (base_reg, key_reg) = (ARGUMENTS[1], ARGUMENTS[2]);
        self.asm.load(base_reg, base);
        self.asm.load(key_reg, property);

        self.indexed_element(base_reg, key_reg, slow);
        self.asm.store(Mem::indexed(Reg::Rax, Reg::R11), ACCUMULATOR);
        self.asm.jmp(done);

        self.asm.bind(slow)?;
        self.call_for_effect(
            block,
            helpers::put_by_value as usize,
            &[Arg::Context, Arg::Gpr(base_reg), Arg::Gpr(key_reg), Arg::Accumulator],
        )?;
        self.asm.bind(done)
    }

    // ----- variables -----

    fn compile_get_variable(&mut self, block: &BasicBlock, identifier: IdentifierIndex, cache: u32) -> Result<(), JitError> {
        let cell = self.environment_cache(cache)?;
        let slow = self.asm.new_label();
        let done = self.asm.new_label();
        let walk = self.asm.new_label();
        let found = self.asm.new_label();

        self.asm.mov_ri(Reg::R10, cell);
        self.asm.load32(Reg::Rax, Mem::base(Reg::R10, EnvironmentCache::populated_offset() as i32));
        self.asm.test_rr32(Reg::Rax, Reg::Rax);
        self.asm.jcc(Cond::E, slow);

        // The entry only holds for the environment instance it was recorded in.
        self.asm.load(Reg::Rax, abi::context_field(ExecutionContext::lexical_environment_offset()));
        self.asm.load(Reg::R11, Mem::base(Reg::R10, EnvironmentCache::origin_offset() as i32));
        self.asm.load(Reg::Rcx, Mem::base(Reg::Rax, Environment::serial_offset() as i32));
        self.asm.alu_rr(Alu::Cmp, Reg::R11, Reg::Rcx);
        self.asm.jcc(Cond::Ne, slow);

        // Follow `hops` parent links from the current environment.
        self.asm.load32(Reg::Rcx, Mem::base(Reg::R10, EnvironmentCache::hops_offset() as i32));
        self.asm.bind(walk)?;
        self.asm.test_rr32(Reg::Rcx, Reg::Rcx);
        self.asm.jcc(Cond::E, found);
        self.asm.load(Reg::Rax, Mem::base(Reg::Rax, Environment::parent_offset() as i32));
        self.asm.test_rr(Reg::Rax, Reg::Rax);
        self.asm.jcc(Cond::E, slow);
        self.asm.alu_ri32(Alu::Sub, Reg::Rcx, 1);
        self.asm.jmp(walk);

        self.asm.bind(found)?;
        self.asm.load(Reg::R11, Mem::base(Reg::R10, EnvironmentCache::serial_offset() as i32));
        self.asm.load(Reg::Rcx, Mem::base(Reg::Rax, Environment::serial_offset() as i32));
        self.asm.alu_rr(Alu::Cmp, Reg::R11, Reg::Rcx);
        self.asm.jcc(Cond::Ne, slow);
        self.asm.load32(Reg::R11, Mem::base(Reg::R10, EnvironmentCache::index_offset() as i32));
        self.asm.load32(Reg::Rcx, Mem::base(Reg::Rax, slot_len(Environment::bindings_offset())));
        self.asm.alu_rr32(Alu::Cmp, Reg::R11, Reg::Rcx);
        self.asm.jcc(Cond::Ae, slow);
        self.asm.load(Reg::Rax, Mem::base(Reg::Rax, slot_ptr(Environment::bindings_offset())));
        self.asm.load(Reg::Rax, Mem::indexed(Reg::Rax, Reg::R11));
        // Uninitialized bindings throw from the slow path.
        self.load_empty(Reg::R10);
        self.asm.alu_rr(Alu::Cmp, Reg::Rax, Reg::R10);
        self.asm.jcc(Cond::E, slow);
        self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
        self.asm.jmp(done);

        self.asm.bind(slow)?;
        self.call_for_value(
            block,
            helpers::get_variable as usize,
            &[Arg::Context, Arg::Imm(identifier.0 as u64), Arg::Imm(cache as u64)],
        )?;
        self.asm.bind(done)
    }

    fn compile_get_global(&mut self, block: &BasicBlock, identifier: IdentifierIndex, cache: u32) -> Result<(), JitError> {
        let cell = self.global_cache(cache)?;
        let slow = self.asm.new_label();
        let done = self.asm.new_label();

        self.asm.mov_ri(Reg::R10, cell);
        self.asm.load(Reg::Rax, abi::context_field(ExecutionContext::global_object_offset()));
        self.asm.load(Reg::R11, Mem::base(Reg::R10, GlobalVariableCache::shape_offset() as i32));
        self.asm.load(Reg::Rcx, Mem::base(Reg::Rax, Object::shape_offset() as i32));
        self.asm.alu_rr(Alu::Cmp, Reg::R11, Reg::Rcx);
        self.asm.jcc(Cond::Ne, slow);
        // A new top-level lexical binding changes the serial and may shadow.
        self.asm.load(Reg::Rcx, abi::context_field(ExecutionContext::global_environment_offset()));
        self.asm.load(Reg::Rcx, Mem::base(Reg::Rcx, Environment::serial_offset() as i32));
        self.asm.load(Reg::R11, Mem::base(Reg::R10, GlobalVariableCache::environment_serial_offset() as i32));
        self.asm.alu_rr(Alu::Cmp, Reg::R11, Reg::Rcx);
        self.asm.jcc(Cond::Ne, slow);
        self.asm.load32(Reg::R11, Mem::base(Reg::R10, GlobalVariableCache::slot_offset() as i32));
        self.asm.load(Reg::Rax, Mem::base(Reg::Rax, slot_ptr(Object::named_offset())));
        self.asm.load(Reg::Rax, Mem::indexed(Reg::Rax, Reg::R11));
        self.branch_if_tag(Reg::Rax, ACCESSOR_TAG, Reg::Rcx, slow);
        self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
        self.asm.jmp(done);

        self.asm.bind(slow)?;
        self.call_for_value(
            block,
            helpers::get_global as usize,
            &[Arg::Context, Arg::Imm(identifier.0 as u64), Arg::Imm(cache as u64)],
        )?;
        self.asm.bind(done)
    }

    // ----- calls -----

    #[allow(clippy::too_many_arguments)]
    fn compile_call(
        &mut self,
        block: &BasicBlock,
        callee: Register,
        this_value: Register,
        first_argument: Register,
        argument_count: u32,
        builtin: Option<Builtin>,
        expression_string: Option<StringIndex>,
    ) -> Result<(), JitError> {
        self.register(callee)?;
        self.register(this_value)?;
        self.register_range(first_argument, argument_count)?;
        let general = self.asm.new_label();
        let done = self.asm.new_label();

        if let Some(builtin) = builtin.filter(|b| *b != Builtin::Print && argument_count == 1) {
            // The hint is only trusted once the callee is the realm's builtin.
            self.asm.load(Reg::Rax, abi::register_slot(callee));
            self.asm.load(Reg::R10, abi::context_field(ExecutionContext::builtins_offset()));
            self.asm.load(Reg::R10, Mem::base(Reg::R10, builtin.index() as i32 * 8));
            self.asm.alu_rr(Alu::Cmp, Reg::Rax, Reg::R10);
            self.asm.jcc(Cond::Ne, general);
            self.asm.load(Reg::Rax, abi::register_slot(first_argument));
            self.inline_builtin(builtin, general, done)?;
        }

        self.asm.bind(general)?;
        let expression = expression_string.map_or(helpers::NO_EXPRESSION, |s| s.0 as u64);
        self.call_for_value(
            block,
            helpers::call as usize,
            &[
                Arg::Context,
                Arg::Register(callee),
                Arg::Register(this_value),
                Arg::Gpr(REGISTERS),
                Arg::Imm(first_argument.0 as u64),
                Arg::Imm(argument_count as u64),
                Arg::Imm(expression),
            ],
        )?;
        self.asm.bind(done)
    }

    /// Inline body for a one-argument math builtin; the argument is in rax.
    fn inline_builtin(&mut self, builtin: Builtin, general: CodeLabel, done: CodeLabel) -> Result<(), JitError> {
        match builtin {
            Builtin::MathAbs => {
                let not_int32 = self.asm.new_label();
                let negative = self.asm.new_label();
                self.branch_unless_tag(Reg::Rax, INT32_TAG, Reg::Rcx, not_int32);
                self.asm.mov_rr32(Reg::Rcx, Reg::Rax);
                self.asm.test_rr32(Reg::Rcx, Reg::Rcx);
                self.asm.jcc(Cond::S, negative);
                self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
                self.asm.jmp(done);
                self.asm.bind(negative)?;
                self.asm.neg32(Reg::Rcx);
                self.asm.jcc(Cond::O, general);
                self.box_int32(Reg::Rcx);
                self.asm.jmp(done);
                self.asm.bind(not_int32)?;
                self.branch_unless_double(Reg::Rax, Reg::Rcx, general)?;
                self.asm.mov_ri(Reg::R10, SIGN_MASK_CLEAR);
                self.asm.alu_rr(Alu::And, Reg::Rax, Reg::R10);
                self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
                self.asm.jmp(done);
            }
            Builtin::MathFloor | Builtin::MathCeil | Builtin::MathRound => {
                // Integers are their own floor, ceiling and rounding.
                self.branch_unless_tag(Reg::Rax, INT32_TAG, Reg::Rcx, general);
                self.asm.mov_rr(ACCUMULATOR, Reg::Rax);
                self.asm.jmp(done);
            }
            Builtin::MathSqrt => {
                self.to_double(Reg::Rax, Xmm::XMM0, Reg::Rcx, general)?;
                self.asm.sqrtsd(Xmm::XMM0, Xmm::XMM0);
                self.box_double(Xmm::XMM0)?;
                self.asm.jmp(done);
            }
            Builtin::Print => self.asm.jmp(general),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ExecutableBuilder, Immediate};

    fn straight_line(instructions: Vec<Instruction>) -> std::rc::Rc<Executable> {
        let mut b = ExecutableBuilder::new("test");
        let entry = b.make_block("entry");
        for instruction in instructions {
            b.emit(entry, instruction);
        }
        b.build().unwrap()
    }

    #[test]
    fn test_offset_map_has_sentinels() {
        let exe = straight_line(vec![
            Instruction::LoadImmediate { value: Immediate::Int32(1) },
            Instruction::Return,
        ]);
        let compiled = compile(&exe).unwrap();
        let entries = compiled.offset_map.entries();
        assert_eq!(entries.first().map(|e| e.location), Some(Location::Prologue));
        assert_eq!(entries.last().map(|e| e.location), Some(Location::Epilogue));
        assert_eq!(entries.len(), 4);
        assert_eq!(
            compiled.offset_map.lookup(entries[1].native_offset as usize),
            Some(Location::Instruction { block: 0, index: 0 })
        );
    }

    #[test]
    fn test_schedule_jump_bails_out() {
        let mut b = ExecutableBuilder::new("finally");
        let entry = b.make_block("entry");
        let target = b.make_block("target");
        b.emit(entry, Instruction::ScheduleJump { target });
        b.emit(target, Instruction::Return);
        let exe = b.build().unwrap();
        assert_eq!(
            compile(&exe).unwrap_err(),
            JitError::UnsupportedInstruction("ScheduleJump")
        );
    }

    #[test]
    fn test_resume_offsets_point_at_continuation_blocks() {
        let mut b = ExecutableBuilder::new("gen");
        let entry = b.make_block("entry");
        let next = b.make_block("next");
        b.emit(entry, Instruction::Yield { continuation: Some(next) });
        b.emit(next, Instruction::Return);
        let exe = b.build().unwrap();
        let compiled = compile(&exe).unwrap();
        assert_eq!(compiled.resume_offsets.len(), 1);
        let entry_of_next = compiled
            .offset_map
            .entries()
            .iter()
            .find(|e| e.location == Location::Instruction { block: 1, index: 0 })
            .map(|e| e.native_offset);
        assert_eq!(entry_of_next, Some(compiled.resume_offsets[0]));
    }

    #[test]
    fn test_prologue_saves_and_epilogue_returns() {
        let exe = straight_line(vec![Instruction::Return]);
        let code = compile(&exe).unwrap().code;
        // push rbp; mov rbp, rsp
        assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(code.last(), Some(&0xC3));
    }
}
