//! Block-by-block bytecode interpreter.
//!
//! Runs any executable the compiler declines, and is the reference the
//! compiled code has to agree with: exceptions, finalizers and suspension go
//! through the same block metadata and the same register protocol.

use super::Value;
use super::bytecode::{BasicBlock, Executable, Instruction, Label, Register};
use super::ops::{self, Completion, ErrorType};
use super::vm::{ExecutionContext, Vm};

enum Step {
    Next,
    Jump(Label),
    Exit,
}

/// Execute from `entry` until the frame returns, suspends or an exception
/// escapes it. The outcome is left in the context's registers.
pub fn run(vm: &Vm, ctx: &ExecutionContext, entry: Label) {
    let executable = ctx.executable().clone();
    let mut label = entry;
    loop {
        let block = &executable.basic_blocks[label.index()];
        match run_block(vm, ctx, &executable, block) {
            Some(next) => label = next,
            None => return,
        }
    }
}

fn run_block(vm: &Vm, ctx: &ExecutionContext, executable: &Executable, block: &BasicBlock) -> Option<Label> {
    for instruction in &block.instructions {
        match step(vm, ctx, executable, block, instruction) {
            Ok(Step::Next) => {}
            Ok(Step::Jump(target)) => return Some(target),
            Ok(Step::Exit) => return None,
            Err(exception) => {
                ctx.set_register(Register::EXCEPTION, exception);
                return handle_exception(ctx, block);
            }
        }
    }
    None
}

/// Route a pending exception according to the block's handler/finalizer.
/// `None` means it leaves the frame.
pub(crate) fn handle_exception(ctx: &ExecutionContext, block: &BasicBlock) -> Option<Label> {
    if let Some(handler) = block.handler {
        ctx.unwind_to_handler();
        ctx.set_accumulator(ctx.register(Register::EXCEPTION));
        ctx.set_register(Register::EXCEPTION, Value::empty());
        return Some(handler);
    }
    if let Some(finalizer) = block.finalizer {
        ctx.set_register(Register::SAVED_EXCEPTION, ctx.register(Register::EXCEPTION));
        ctx.set_register(Register::EXCEPTION, Value::empty());
        ctx.set_register(Register::SAVED_RETURN_VALUE, Value::empty());
        return Some(finalizer);
    }
    None
}

fn suspend(vm: &Vm, ctx: &ExecutionContext, continuation: Option<Label>, is_await: bool) -> Step {
    let token = continuation.map_or(0, |label| label.0 as u64 + 1);
    let record = vm.create_continuation(ctx.accumulator(), token, is_await);
    if token != 0 {
        ctx.mark_suspended();
    }
    ctx.set_register(Register::RETURN_VALUE, record);
    Step::Exit
}

fn step(
    vm: &Vm,
    ctx: &ExecutionContext,
    executable: &Executable,
    block: &BasicBlock,
    instruction: &Instruction,
) -> Completion<Step> {
    let heap = vm.heap();
    let caches = executable.caches();
    let acc = ctx.accumulator();

    match *instruction {
        Instruction::Load { src } => ctx.set_accumulator(ctx.register(src)),
        Instruction::LoadImmediate { value } => ctx.set_accumulator(value.to_value()),
        Instruction::Store { dst } => ctx.set_register(dst, acc),
        Instruction::GetLocal { index } => {
            let value = ctx.local(index);
            if value.is_empty() {
                let name = &executable.local_names[index as usize];
                let message = format!("Cannot access '{}' before initialization", name);
                return ops::throw(vm, ErrorType::ReferenceError, &message);
            }
            ctx.set_accumulator(value);
        }
        Instruction::SetLocal { index } => ctx.set_local(index, acc),
        Instruction::NewString { string } => {
            ctx.set_accumulator(heap.alloc_string(executable.string(string)));
        }
        Instruction::NewBigInt { string } => {
            let literal = executable.bigint_literal(string).cloned().unwrap_or_default();
            ctx.set_accumulator(heap.alloc_bigint(literal));
        }
        Instruction::NewObject => {
            let object = heap.alloc_object(Some(vm.realm().object_prototype()));
            ctx.set_accumulator(Value::object(object));
        }
        Instruction::NewArray { first_element, element_count } => {
            let elements = (0..element_count)
                .map(|i| ctx.register(Register(first_element.0 + i)))
                .collect();
            let array = heap.alloc_array(Some(vm.realm().array_prototype()), elements);
            ctx.set_accumulator(Value::object(array));
        }
        Instruction::NewFunction { function } => {
            let function = executable.functions[function as usize].clone();
            ctx.set_accumulator(vm.new_function(function, ctx.lexical_environment_ptr()));
        }
        Instruction::ResolveThisBinding => {
            let this = ctx.register(Register::THIS);
            ctx.set_accumulator(if this.is_empty() { Value::undefined() } else { this });
        }

        Instruction::GetById { property, cache } => {
            let key = executable.identifier(property);
            let value = match caches.property(cache) {
                Some(cache) => ops::get_by_id(vm, acc, key, cache)?,
                None => ops::get_property(vm, acc, key)?,
            };
            ctx.set_accumulator(value);
        }
        Instruction::PutById { base, property, cache } => {
            let key = executable.identifier(property);
            match caches.property(cache) {
                Some(cache) => ops::put_by_id(vm, ctx.register(base), key, acc, cache)?,
                None => ops::put_property(vm, ctx.register(base), key, acc)?,
            }
        }
        Instruction::DeleteById { property } => {
            let deleted = ops::delete_by_id(vm, acc, executable.identifier(property))?;
            ctx.set_accumulator(Value::boolean(deleted));
        }
        Instruction::GetByValue { base } => {
            ctx.set_accumulator(ops::get_by_value(vm, ctx.register(base), acc)?);
        }
        Instruction::PutByValue { base, property } => {
            ops::put_by_value(vm, ctx.register(base), ctx.register(property), acc)?;
        }
        Instruction::GetVariable { identifier, cache } => {
            let name = executable.identifier(identifier);
            let environment = ctx.lexical_environment();
            let value = match caches.environment(cache) {
                Some(cache) => ops::get_variable(vm, environment, name, cache)?,
                None => ops::get_variable(vm, environment, name, &Default::default())?,
            };
            ctx.set_accumulator(value);
        }
        Instruction::SetVariable { identifier, initialize } => {
            let name = executable.identifier(identifier);
            ops::set_variable(vm, ctx.lexical_environment(), name, acc, initialize)?;
        }
        Instruction::CreateVariable { identifier, mutable } => {
            ops::create_variable(vm, ctx.lexical_environment(), executable.identifier(identifier), mutable);
        }
        Instruction::GetGlobal { identifier, cache } => {
            let name = executable.identifier(identifier);
            let value = match caches.global(cache) {
                Some(cache) => ops::get_global(vm, name, cache)?,
                None => ops::get_global(vm, name, &Default::default())?,
            };
            ctx.set_accumulator(value);
        }
        Instruction::CreateLexicalEnvironment => ctx.create_lexical_environment(),
        Instruction::LeaveLexicalEnvironment => ctx.leave_lexical_environment(),

        Instruction::Call { callee, this_value, first_argument, argument_count, expression_string, .. } => {
            let args: Vec<Value> = (0..argument_count)
                .map(|i| ctx.register(Register(first_argument.0 + i)))
                .collect();
            let expression = expression_string.map(|s| executable.string(s));
            let result = ops::call(vm, ctx.register(callee), ctx.register(this_value), &args, expression)?;
            ctx.set_accumulator(result);
        }

        Instruction::Jump { target } => return Ok(Step::Jump(target)),
        Instruction::JumpConditional { true_target, false_target } => {
            return Ok(Step::Jump(if ops::to_boolean(acc) { true_target } else { false_target }));
        }
        Instruction::JumpNullish { true_target, false_target } => {
            return Ok(Step::Jump(if acc.is_nullish() { true_target } else { false_target }));
        }
        Instruction::JumpUndefined { true_target, false_target } => {
            return Ok(Step::Jump(if acc.is_undefined() { true_target } else { false_target }));
        }
        Instruction::EnterUnwindContext { entry } => {
            ctx.enter_unwind_context();
            return Ok(Step::Jump(entry));
        }
        Instruction::LeaveUnwindContext => ctx.leave_unwind_context(),
        Instruction::ContinuePendingUnwind { resume_target } => {
            let exception = ctx.register(Register::SAVED_EXCEPTION);
            ctx.set_register(Register::SAVED_EXCEPTION, Value::empty());
            if !exception.is_empty() {
                return Err(exception);
            }
            let saved_return = ctx.register(Register::SAVED_RETURN_VALUE);
            if !saved_return.is_empty() {
                ctx.set_register(Register::RETURN_VALUE, saved_return);
                return Ok(Step::Exit);
            }
            return Ok(Step::Jump(ctx.take_scheduled_jump().unwrap_or(resume_target)));
        }
        Instruction::ScheduleJump { target } => {
            return Ok(Step::Jump(match block.finalizer {
                Some(finalizer) => {
                    ctx.schedule_jump(target);
                    finalizer
                }
                None => target,
            }));
        }
        Instruction::Throw => return Err(acc),
        Instruction::ThrowIfNotObject => {
            if !acc.is_object() {
                let message = format!("{} is not an object", ops::to_display_string(vm, acc));
                return ops::throw(vm, ErrorType::TypeError, &message);
            }
        }
        Instruction::ThrowIfNullish => {
            if acc.is_nullish() {
                let message = format!("{} is nullish", ops::to_display_string(vm, acc));
                return ops::throw(vm, ErrorType::TypeError, &message);
            }
        }
        Instruction::Return => {
            if let Some(finalizer) = block.finalizer {
                ctx.set_register(Register::SAVED_RETURN_VALUE, acc);
                return Ok(Step::Jump(finalizer));
            }
            ctx.set_register(Register::RETURN_VALUE, acc);
            return Ok(Step::Exit);
        }
        Instruction::Yield { continuation } => return Ok(suspend(vm, ctx, continuation, false)),
        Instruction::Await { continuation } => return Ok(suspend(vm, ctx, Some(continuation), true)),

        _ => {
            if let Some((op, lhs)) = instruction.as_binary() {
                ctx.set_accumulator(ops::binary(vm, op, ctx.register(lhs), acc)?);
            } else if let Some(op) = instruction.as_unary() {
                ctx.set_accumulator(ops::unary(vm, op, acc)?);
            }
        }
    }
    Ok(Step::Next)
}
