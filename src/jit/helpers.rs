//! Slow paths called from compiled code.
//!
//! Every helper takes the execution context first and works in terms of the
//! same abstract operations the interpreter uses. A thrown value is stored in
//! the exception register and the helper returns `undefined`; the caller
//! checks the register after the call and dispatches to the block's handler.
//!
//! Arguments arrive as raw 64-bit words: `Value` is a transparent `u64`, and
//! indices, flags and operator numbers are zero-extended.

use tracing::trace;

use crate::vm::ops::{self, Completion, ErrorType};
use crate::vm::{
    BinaryOp, ExecutionContext, IdentifierIndex, Register, StringIndex, UnaryOp, Value,
};

/// Sentinel for "no expression string" in [`call`].
pub const NO_EXPRESSION: u64 = u64::MAX;

fn complete(ctx: &ExecutionContext, completion: Completion<Value>) -> Value {
    match completion {
        Ok(value) => value,
        Err(exception) => {
            ctx.set_register(Register::EXCEPTION, exception);
            Value::undefined()
        }
    }
}

fn complete_unit(ctx: &ExecutionContext, completion: Completion<()>) -> Value {
    complete(ctx, completion.map(|()| Value::undefined()))
}

/// The operator comes last so the operands can stay in rsi/rdx.
pub extern "C" fn binary(ctx: &ExecutionContext, lhs: Value, rhs: Value, op: u64) -> Value {
    debug_assert!((op as usize) < BinaryOp::ALL.len(), "binary operator index {op} out of range");
    let Some(&op) = BinaryOp::ALL.get(op as usize) else {
        return Value::undefined();
    };
    complete(ctx, ops::binary(ctx.vm(), op, lhs, rhs))
}

pub extern "C" fn unary(ctx: &ExecutionContext, value: Value, op: u64) -> Value {
    debug_assert!((op as usize) < UnaryOp::ALL.len(), "unary operator index {op} out of range");
    let Some(&op) = UnaryOp::ALL.get(op as usize) else {
        return Value::undefined();
    };
    complete(ctx, ops::unary(ctx.vm(), op, value))
}

pub extern "C" fn to_boolean(value: Value) -> u64 {
    ops::to_boolean(value) as u64
}

pub extern "C" fn throw_uninitialized_local(ctx: &ExecutionContext, index: u64) -> Value {
    let name = ctx
        .executable()
        .local_names
        .get(index as usize)
        .map_or("<local>", String::as_str);
    let message = format!("Cannot access '{}' before initialization", name);
    complete(ctx, ops::throw(ctx.vm(), ErrorType::ReferenceError, &message))
}

pub extern "C" fn new_string(ctx: &ExecutionContext, index: u64) -> Value {
    let string = ctx.executable().string(StringIndex(index as u32));
    ctx.vm().heap().alloc_string(string)
}

pub extern "C" fn new_bigint(ctx: &ExecutionContext, index: u64) -> Value {
    let literal = ctx
        .executable()
        .bigint_literal(StringIndex(index as u32))
        .cloned()
        .unwrap_or_default();
    ctx.vm().heap().alloc_bigint(literal)
}

pub extern "C" fn new_object(ctx: &ExecutionContext) -> Value {
    let vm = ctx.vm();
    Value::object(vm.heap().alloc_object(Some(vm.realm().object_prototype())))
}

pub extern "C" fn new_array(ctx: &ExecutionContext, first_element: u64, element_count: u64) -> Value {
    let vm = ctx.vm();
    let elements = (0..element_count as u32)
        .map(|i| ctx.register(Register(first_element as u32 + i)))
        .collect();
    Value::object(vm.heap().alloc_array(Some(vm.realm().array_prototype()), elements))
}

pub extern "C" fn new_function(ctx: &ExecutionContext, index: u64) -> Value {
    match ctx.executable().functions.get(index as usize) {
        Some(function) => ctx.vm().new_function(function.clone(), ctx.lexical_environment_ptr()),
        None => Value::undefined(),
    }
}

pub extern "C" fn get_by_id(ctx: &ExecutionContext, base: Value, property: u64, cache: u64) -> Value {
    let executable = ctx.executable();
    let key = executable.identifier(IdentifierIndex(property as u32));
    let completion = match executable.caches().property(cache as u32) {
        Some(cache) => ops::get_by_id(ctx.vm(), base, key, cache),
        None => ops::get_property(ctx.vm(), base, key),
    };
    complete(ctx, completion)
}

pub extern "C" fn put_by_id(
    ctx: &ExecutionContext,
    base: Value,
    value: Value,
    property: u64,
    cache: u64,
) -> Value {
    let executable = ctx.executable();
    let key = executable.identifier(IdentifierIndex(property as u32));
    let completion = match executable.caches().property(cache as u32) {
        Some(cache) => ops::put_by_id(ctx.vm(), base, key, value, cache),
        None => ops::put_property(ctx.vm(), base, key, value),
    };
    complete_unit(ctx, completion)
}

pub extern "C" fn delete_by_id(ctx: &ExecutionContext, base: Value, property: u64) -> Value {
    let key = ctx.executable().identifier(IdentifierIndex(property as u32));
    complete(ctx, ops::delete_by_id(ctx.vm(), base, key).map(Value::boolean))
}

pub extern "C" fn get_by_value(ctx: &ExecutionContext, base: Value, key: Value) -> Value {
    complete(ctx, ops::get_by_value(ctx.vm(), base, key))
}

pub extern "C" fn put_by_value(ctx: &ExecutionContext, base: Value, key: Value, value: Value) -> Value {
    complete_unit(ctx, ops::put_by_value(ctx.vm(), base, key, value))
}

pub extern "C" fn get_variable(ctx: &ExecutionContext, identifier: u64, cache: u64) -> Value {
    let executable = ctx.executable();
    let name = executable.identifier(IdentifierIndex(identifier as u32));
    let environment = ctx.lexical_environment();
    let completion = match executable.caches().environment(cache as u32) {
        Some(cache) => ops::get_variable(ctx.vm(), environment, name, cache),
        None => ops::get_variable(ctx.vm(), environment, name, &Default::default()),
    };
    complete(ctx, completion)
}

pub extern "C" fn set_variable(
    ctx: &ExecutionContext,
    identifier: u64,
    value: Value,
    initialize: u64,
) -> Value {
    let name = ctx.executable().identifier(IdentifierIndex(identifier as u32));
    let completion = ops::set_variable(ctx.vm(), ctx.lexical_environment(), name, value, initialize != 0);
    complete_unit(ctx, completion)
}

pub extern "C" fn create_variable(ctx: &ExecutionContext, identifier: u64, mutable: u64) -> Value {
    let name = ctx.executable().identifier(IdentifierIndex(identifier as u32));
    ops::create_variable(ctx.vm(), ctx.lexical_environment(), name, mutable != 0);
    Value::undefined()
}

pub extern "C" fn get_global(ctx: &ExecutionContext, identifier: u64, cache: u64) -> Value {
    let executable = ctx.executable();
    let name = executable.identifier(IdentifierIndex(identifier as u32));
    let completion = match executable.caches().global(cache as u32) {
        Some(cache) => ops::get_global(ctx.vm(), name, cache),
        None => ops::get_global(ctx.vm(), name, &Default::default()),
    };
    complete(ctx, completion)
}

pub extern "C" fn create_lexical_environment(ctx: &ExecutionContext) -> Value {
    ctx.create_lexical_environment();
    Value::undefined()
}

pub extern "C" fn leave_lexical_environment(ctx: &ExecutionContext) -> Value {
    ctx.leave_lexical_environment();
    Value::undefined()
}

/// Seven words: the last one is passed on the stack.
pub extern "C" fn call(
    ctx: &ExecutionContext,
    callee: Value,
    this: Value,
    registers: *const Value,
    first_argument: u64,
    argument_count: u64,
    expression_string: u64,
) -> Value {
    let args: Vec<Value> = (0..argument_count as usize)
        // SAFETY: `registers` is this frame's register file and the argument
        // range was bounds-checked against it at compile time.
        .map(|i| unsafe { registers.add(first_argument as usize + i).read() })
        .collect();
    let executable = ctx.executable();
    let expression = (expression_string != NO_EXPRESSION)
        .then(|| executable.string(StringIndex(expression_string as u32)));
    trace!(function = %executable.name, argument_count, "native call");
    complete(ctx, ops::call(ctx.vm(), callee, this, &args, expression))
}

pub extern "C" fn enter_unwind_context(ctx: &ExecutionContext) -> Value {
    ctx.enter_unwind_context();
    Value::undefined()
}

pub extern "C" fn leave_unwind_context(ctx: &ExecutionContext) -> Value {
    ctx.leave_unwind_context();
    Value::undefined()
}

pub extern "C" fn unwind_to_handler(ctx: &ExecutionContext) -> Value {
    ctx.unwind_to_handler();
    Value::undefined()
}

pub extern "C" fn throw_if_not_object(ctx: &ExecutionContext, value: Value) -> Value {
    if value.is_object() {
        return Value::undefined();
    }
    let message = format!("{} is not an object", ops::to_display_string(ctx.vm(), value));
    complete(ctx, ops::throw(ctx.vm(), ErrorType::TypeError, &message))
}

pub extern "C" fn throw_if_nullish(ctx: &ExecutionContext, value: Value) -> Value {
    if !value.is_nullish() {
        return Value::undefined();
    }
    let message = format!("{} is nullish", ops::to_display_string(ctx.vm(), value));
    complete(ctx, ops::throw(ctx.vm(), ErrorType::TypeError, &message))
}

/// Build the continuation record for `Yield`/`Await`. `address` is the
/// absolute resume address, or 0 when the function is done.
pub extern "C" fn create_continuation(
    ctx: &ExecutionContext,
    result: Value,
    address: u64,
    is_await: u64,
) -> Value {
    if address != 0 {
        ctx.mark_suspended();
    }
    ctx.vm().create_continuation(result, address, is_await != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::vm::{ExecutableBuilder, Instruction, Vm};

    fn with_context(f: impl FnOnce(&ExecutionContext)) {
        let vm = Vm::new(RuntimeConfig::interpreter_only());
        let mut b = ExecutableBuilder::new("helpers");
        let entry = b.make_block("entry");
        b.emit(entry, Instruction::Return);
        let exe = b.build().unwrap();
        let frame = vm.prepare(&exe);
        f(frame.context());
    }

    #[test]
    fn test_binary_decodes_operator() {
        with_context(|ctx| {
            let sum = binary(ctx, Value::int32(2), Value::int32(3), BinaryOp::Add as u64);
            assert_eq!(sum, Value::int32(5));
            let lt = binary(ctx, Value::int32(2), Value::int32(3), BinaryOp::LessThan as u64);
            assert_eq!(lt, Value::boolean(true));
        });
    }

    #[test]
    fn test_operator_encoding_matches_decode_tables() {
        for (index, op) in BinaryOp::ALL.iter().enumerate() {
            assert_eq!(*op as usize, index);
        }
        for (index, op) in UnaryOp::ALL.iter().enumerate() {
            assert_eq!(*op as usize, index);
        }
    }

    #[test]
    fn test_unary_decodes_operator() {
        with_context(|ctx| {
            let next = unary(ctx, Value::int32(41), UnaryOp::Increment as u64);
            assert_eq!(next, Value::int32(42));
            assert!(ctx.register(Register::EXCEPTION).is_empty());
        });
    }

    #[test]
    fn test_thrown_value_lands_in_exception_register() {
        with_context(|ctx| {
            assert!(ctx.register(Register::EXCEPTION).is_empty());
            let result = throw_if_nullish(ctx, Value::null());
            assert_eq!(result, Value::undefined());
            assert!(ctx.register(Register::EXCEPTION).is_object());
        });
    }

    #[test]
    fn test_to_boolean_word() {
        assert_eq!(to_boolean(Value::int32(0)), 0);
        assert_eq!(to_boolean(Value::int32(7)), 1);
    }
}
