//! End-to-end tests for compiled code.
//!
//! Every program is run twice, once interpreted and once compiled, and the
//! results are compared. Tests that execute machine code only run on x86-64
//! Unix hosts.

#![cfg(all(target_arch = "x86_64", unix))]

use std::rc::Rc;

use kiln::config::RuntimeConfig;
use kiln::jit::{self, Location};
use kiln::vm::{
    Builtin, Executable, ExecutableBuilder, FrameState, Immediate, Instruction, Register,
    ResumeToken, Value, Vm, same_value,
};
use kiln::VmError;
use pretty_assertions::assert_eq;

/// Run a fresh copy of the program in both tiers and check they agree.
/// Returns the compiled tier's VM and result so callers can inspect them.
fn run_both(build: impl Fn() -> Rc<Executable>) -> (Vm, Result<Value, VmError>) {
    let interpreter = Vm::new(RuntimeConfig::interpreter_only());
    let expected = interpreter.run(&build());

    let vm = Vm::new(RuntimeConfig::jit_eager());
    let program = build();
    let actual = vm.run(&program);
    assert!(program.native().is_some(), "{} was not compiled", program.name);

    match (&expected, &actual) {
        (Ok(a), Ok(b)) => assert!(
            same_value(*a, *b),
            "{}: interpreter {:?}, compiled {:?}",
            program.name,
            a,
            b
        ),
        (Err(a), Err(b)) => assert_eq!(a.to_string(), b.to_string()),
        _ => panic!("{}: tiers disagree: {:?} vs {:?}", program.name, expected, actual),
    }
    (vm, actual)
}

fn int(n: i32) -> Instruction {
    Instruction::LoadImmediate { value: Immediate::Int32(n) }
}

fn number(f: f64) -> Instruction {
    Instruction::LoadImmediate { value: Immediate::Number(f) }
}

fn binary_program(lhs: Instruction, op: fn(Register) -> Instruction, rhs: Instruction) -> Rc<Executable> {
    let mut b = ExecutableBuilder::new("binary");
    let r = b.allocate_register();
    let entry = b.make_block("entry");
    b.emit(entry, lhs);
    b.emit(entry, Instruction::Store { dst: r });
    b.emit(entry, rhs);
    b.emit(entry, op(r));
    b.emit(entry, Instruction::Return);
    b.build().unwrap()
}

#[test]
fn test_one_plus_one_is_int32_two() {
    let (_vm, result) = run_both(|| binary_program(int(1), |lhs| Instruction::Add { lhs }, int(1)));
    let value = result.unwrap();
    assert!(value.is_int32());
    assert_eq!(value, Value::int32(2));
}

#[test]
fn test_int32_max_plus_one_promotes_to_double() {
    let (_vm, result) = run_both(|| binary_program(int(i32::MAX), |lhs| Instruction::Add { lhs }, int(1)));
    let value = result.unwrap();
    assert!(value.is_double());
    assert_eq!(value.as_f64(), 2147483648.0);
}

#[test]
fn test_overflow_boundaries_trap() {
    type Op = fn(Register) -> Instruction;
    let cases: [(i32, Op, i32, f64); 4] = [
        (i32::MAX, |lhs| Instruction::Add { lhs }, 1, 2147483648.0),
        (i32::MIN, |lhs| Instruction::Sub { lhs }, 1, -2147483649.0),
        (i32::MIN, |lhs| Instruction::Mul { lhs }, -1, 2147483648.0),
        (65536, |lhs| Instruction::Mul { lhs }, 65536, 4294967296.0),
    ];
    for (lhs, op, rhs, expected) in cases {
        let (_vm, result) = run_both(|| binary_program(int(lhs), op, int(rhs)));
        assert_eq!(result.unwrap().as_number(), expected);
    }
}

#[test]
fn test_negative_zero_product() {
    let (_vm, result) = run_both(|| binary_program(int(0), |lhs| Instruction::Mul { lhs }, int(-5)));
    let value = result.unwrap();
    assert!(value.as_number() == 0.0 && value.as_number().is_sign_negative());
}

#[test]
fn test_double_arithmetic_and_nan() {
    run_both(|| binary_program(number(1.5), |lhs| Instruction::Add { lhs }, int(2)));
    run_both(|| binary_program(int(1), |lhs| Instruction::Div { lhs }, int(0)));
    run_both(|| binary_program(int(0), |lhs| Instruction::Div { lhs }, int(0)));
    run_both(|| binary_program(number(f64::NAN), |lhs| Instruction::LessThan { lhs }, int(0)));
    run_both(|| binary_program(number(f64::NAN), |lhs| Instruction::StrictlyEquals { lhs }, number(f64::NAN)));
    run_both(|| binary_program(number(f64::NAN), |lhs| Instruction::StrictlyInequals { lhs }, number(f64::NAN)));
}

/// `{ x: 1 }`, then three times: read `x`, delete it, add `y`, store a new `x`.
/// Each round leaves the object with a shape the read site has not seen.
fn shape_churn() -> Rc<Executable> {
    let mut b = ExecutableBuilder::new("shape_churn");
    let obj = b.allocate_register();
    let i = b.allocate_register();
    let sum = b.allocate_register();
    let x = b.identifier("x");
    let y = b.identifier("y");
    let (init_x, read_x, put_y, put_x) = (
        b.property_cache(),
        b.property_cache(),
        b.property_cache(),
        b.property_cache(),
    );
    let entry = b.make_block("entry");
    let test = b.make_block("test");
    let body = b.make_block("body");
    let exit = b.make_block("exit");

    b.emit(entry, Instruction::NewObject);
    b.emit(entry, Instruction::Store { dst: obj });
    b.emit(entry, int(1));
    b.emit(entry, Instruction::PutById { base: obj, property: x, cache: init_x });
    b.emit(entry, int(0));
    b.emit(entry, Instruction::Store { dst: i });
    b.emit(entry, Instruction::Store { dst: sum });
    b.emit(entry, Instruction::Jump { target: test });

    b.emit(test, int(3));
    b.emit(test, Instruction::LessThan { lhs: i });
    b.emit(test, Instruction::JumpConditional { true_target: body, false_target: exit });

    b.emit(body, Instruction::Load { src: obj });
    b.emit(body, Instruction::GetById { property: x, cache: read_x });
    b.emit(body, Instruction::Add { lhs: sum });
    b.emit(body, Instruction::Store { dst: sum });
    b.emit(body, Instruction::Load { src: obj });
    b.emit(body, Instruction::DeleteById { property: x });
    b.emit(body, int(100));
    b.emit(body, Instruction::PutById { base: obj, property: y, cache: put_y });
    b.emit(body, Instruction::Load { src: i });
    b.emit(body, Instruction::Increment);
    b.emit(body, Instruction::Store { dst: i });
    b.emit(body, int(10));
    b.emit(body, Instruction::Mul { lhs: i });
    b.emit(body, Instruction::PutById { base: obj, property: x, cache: put_x });
    b.emit(body, Instruction::Jump { target: test });

    b.emit(exit, Instruction::Load { src: sum });
    b.emit(exit, Instruction::Return);
    b.build().unwrap()
}

#[test]
fn test_stale_shape_is_never_trusted() {
    let (_vm, result) = run_both(shape_churn);
    assert_eq!(result.unwrap(), Value::int32(1 + 10 + 20));
}

#[test]
fn test_array_elements_and_length() {
    let build = || {
        let mut b = ExecutableBuilder::new("array");
        let first = b.allocate_register();
        let second = b.allocate_register();
        let array = b.allocate_register();
        let index = b.allocate_register();
        let length = b.identifier("length");
        let cache = b.property_cache();
        let entry = b.make_block("entry");
        b.emit(entry, int(7));
        b.emit(entry, Instruction::Store { dst: first });
        b.emit(entry, int(8));
        b.emit(entry, Instruction::Store { dst: second });
        b.emit(entry, Instruction::NewArray { first_element: first, element_count: 2 });
        b.emit(entry, Instruction::Store { dst: array });
        // array[1] = 30; array[5] = 1 (out of bounds, slow path)
        b.emit(entry, int(1));
        b.emit(entry, Instruction::Store { dst: index });
        b.emit(entry, int(30));
        b.emit(entry, Instruction::PutByValue { base: array, property: index });
        b.emit(entry, int(5));
        b.emit(entry, Instruction::Store { dst: index });
        b.emit(entry, int(1));
        b.emit(entry, Instruction::PutByValue { base: array, property: index });
        // array.length + array[1]
        b.emit(entry, Instruction::Load { src: array });
        b.emit(entry, Instruction::GetById { property: length, cache });
        b.emit(entry, Instruction::Store { dst: first });
        b.emit(entry, int(1));
        b.emit(entry, Instruction::GetByValue { base: array });
        b.emit(entry, Instruction::Add { lhs: first });
        b.emit(entry, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert_eq!(result.unwrap(), Value::int32(6 + 30));
}

#[test]
fn test_caught_exception_reaches_handler() {
    let build = || {
        let mut b = ExecutableBuilder::new("try_catch");
        let missing = b.identifier("missing");
        let cache = b.global_cache();
        let entry = b.make_block("entry");
        let body = b.make_block("try");
        let handler = b.make_block("catch");
        let done = b.make_block("done");
        b.set_handler(body, handler);
        b.emit(entry, Instruction::EnterUnwindContext { entry: body });
        b.emit(body, Instruction::GetGlobal { identifier: missing, cache });
        b.emit(body, Instruction::Return);
        b.emit(handler, Instruction::JumpUndefined { true_target: body, false_target: done });
        b.emit(done, int(42));
        b.emit(done, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert_eq!(result.unwrap(), Value::int32(42));
}

#[test]
fn test_thrown_value_is_the_handler_accumulator() {
    let build = || {
        let mut b = ExecutableBuilder::new("throw");
        let entry = b.make_block("entry");
        let handler = b.make_block("catch");
        b.set_handler(entry, handler);
        b.emit(entry, int(7));
        b.emit(entry, Instruction::Throw);
        b.emit(handler, Instruction::Increment);
        b.emit(handler, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert_eq!(result.unwrap(), Value::int32(8));
}

#[test]
fn test_finally_rethrows_pending_exception() {
    let build = || {
        let mut b = ExecutableBuilder::new("finally_throw");
        let scratch = b.allocate_register();
        let entry = b.make_block("entry");
        let finalizer = b.make_block("finally");
        let after = b.make_block("after");
        b.set_finalizer(entry, finalizer);
        b.emit(entry, int(3));
        b.emit(entry, Instruction::Throw);
        b.emit(finalizer, int(9));
        b.emit(finalizer, Instruction::Store { dst: scratch });
        b.emit(finalizer, Instruction::ContinuePendingUnwind { resume_target: after });
        b.emit(after, int(0));
        b.emit(after, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert!(matches!(result, Err(VmError::Uncaught(ref m)) if m == "3"));
}

#[test]
fn test_return_through_finally() {
    let build = || {
        let mut b = ExecutableBuilder::new("finally_return");
        let entry = b.make_block("entry");
        let finalizer = b.make_block("finally");
        let after = b.make_block("after");
        b.set_finalizer(entry, finalizer);
        b.emit(entry, int(5));
        b.emit(entry, Instruction::Return);
        b.emit(finalizer, int(99));
        b.emit(finalizer, Instruction::ContinuePendingUnwind { resume_target: after });
        b.emit(after, int(0));
        b.emit(after, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert_eq!(result.unwrap(), Value::int32(5));
}

#[test]
fn test_finally_falls_through_without_pending_completion() {
    let build = || {
        let mut b = ExecutableBuilder::new("finally_normal");
        let entry = b.make_block("entry");
        let finalizer = b.make_block("finally");
        let after = b.make_block("after");
        b.set_finalizer(entry, finalizer);
        b.emit(entry, Instruction::Jump { target: finalizer });
        b.emit(finalizer, Instruction::ContinuePendingUnwind { resume_target: after });
        b.emit(after, int(11));
        b.emit(after, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert_eq!(result.unwrap(), Value::int32(11));
}

fn math_call(builtin: Builtin, argument: Instruction) -> Rc<Executable> {
    let mut b = ExecutableBuilder::new(builtin.name());
    let callee = b.allocate_register();
    let this = b.allocate_register();
    let arg = b.allocate_register();
    let math = b.identifier("Math");
    let name = b.identifier(builtin.name());
    let global = b.global_cache();
    let property = b.property_cache();
    let entry = b.make_block("entry");
    b.emit(entry, Instruction::GetGlobal { identifier: math, cache: global });
    b.emit(entry, Instruction::Store { dst: this });
    b.emit(entry, Instruction::GetById { property: name, cache: property });
    b.emit(entry, Instruction::Store { dst: callee });
    b.emit(entry, argument);
    b.emit(entry, Instruction::Store { dst: arg });
    b.emit(
        entry,
        Instruction::Call {
            callee,
            this_value: this,
            first_argument: arg,
            argument_count: 1,
            builtin: Some(builtin),
            expression_string: None,
        },
    );
    b.emit(entry, Instruction::Return);
    b.build().unwrap()
}

#[test]
fn test_math_builtins_match_interpreter() {
    let arguments = [
        int(-5),
        int(9),
        int(i32::MIN),
        number(-2.5),
        number(2.5),
        number(-0.0),
        number(f64::NAN),
    ];
    for builtin in [
        Builtin::MathAbs,
        Builtin::MathFloor,
        Builtin::MathCeil,
        Builtin::MathRound,
        Builtin::MathSqrt,
    ] {
        for argument in &arguments {
            run_both(|| math_call(builtin, argument.clone()));
        }
    }
}

#[test]
fn test_builtin_hint_is_checked_against_callee() {
    // The call site claims Math.abs but calls Math.sqrt.
    let build = || {
        let mut b = ExecutableBuilder::new("lying_hint");
        let callee = b.allocate_register();
        let this = b.allocate_register();
        let arg = b.allocate_register();
        let math = b.identifier("Math");
        let sqrt = b.identifier("sqrt");
        let global = b.global_cache();
        let property = b.property_cache();
        let entry = b.make_block("entry");
        b.emit(entry, Instruction::GetGlobal { identifier: math, cache: global });
        b.emit(entry, Instruction::Store { dst: this });
        b.emit(entry, Instruction::GetById { property: sqrt, cache: property });
        b.emit(entry, Instruction::Store { dst: callee });
        b.emit(entry, int(-16));
        b.emit(entry, Instruction::Store { dst: arg });
        b.emit(
            entry,
            Instruction::Call {
                callee,
                this_value: this,
                first_argument: arg,
                argument_count: 1,
                builtin: Some(Builtin::MathAbs),
                expression_string: None,
            },
        );
        b.emit(entry, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert!(result.unwrap().as_number().is_nan());
}

#[test]
fn test_calling_a_non_function_names_the_expression() {
    let build = || {
        let mut b = ExecutableBuilder::new("not_callable");
        let callee = b.allocate_register();
        let expression = b.string("obj.method");
        let entry = b.make_block("entry");
        b.emit(entry, int(1));
        b.emit(entry, Instruction::Store { dst: callee });
        b.emit(
            entry,
            Instruction::Call {
                callee,
                this_value: callee,
                first_argument: callee,
                argument_count: 0,
                builtin: None,
                expression_string: Some(expression),
            },
        );
        b.emit(entry, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert!(matches!(result, Err(VmError::Uncaught(ref m)) if m.contains("obj.method is not a function")));
}

#[test]
fn test_compiled_function_calls_compiled_function() {
    let build = || {
        let mut inner = ExecutableBuilder::new("double");
        let n = inner.add_parameter("n");
        let r = inner.allocate_register();
        let entry = inner.make_block("entry");
        inner.emit(entry, Instruction::GetLocal { index: n });
        inner.emit(entry, Instruction::Store { dst: r });
        inner.emit(entry, Instruction::Add { lhs: r });
        inner.emit(entry, Instruction::Return);
        let inner = inner.build().unwrap();

        let mut b = ExecutableBuilder::new("outer");
        let callee = b.allocate_register();
        let this = b.allocate_register();
        let arg = b.allocate_register();
        let function = b.add_function(inner);
        let entry = b.make_block("entry");
        b.emit(entry, Instruction::NewFunction { function });
        b.emit(entry, Instruction::Store { dst: callee });
        b.emit(entry, Instruction::LoadImmediate { value: Immediate::Undefined });
        b.emit(entry, Instruction::Store { dst: this });
        b.emit(entry, int(21));
        b.emit(entry, Instruction::Store { dst: arg });
        b.emit(
            entry,
            Instruction::Call {
                callee,
                this_value: this,
                first_argument: arg,
                argument_count: 1,
                builtin: None,
                expression_string: None,
            },
        );
        b.emit(entry, Instruction::Return);
        b.build().unwrap()
    };
    let (vm, result) = run_both(build);
    assert_eq!(result.unwrap(), Value::int32(42));
    assert_eq!(vm.jit_compile_count(), 2);
}

#[test]
fn test_uninitialized_local_throws() {
    let build = || {
        let mut b = ExecutableBuilder::new("tdz");
        let x = b.add_local("x");
        let entry = b.make_block("entry");
        b.emit(entry, Instruction::GetLocal { index: x });
        b.emit(entry, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert!(matches!(result, Err(VmError::Uncaught(ref m)) if m.contains("before initialization")));
}

#[test]
fn test_lexical_variables_through_environment_cache() {
    let build = || {
        let mut b = ExecutableBuilder::new("lexical");
        let i = b.allocate_register();
        let name = b.identifier("total");
        let cache = b.environment_cache();
        let entry = b.make_block("entry");
        let test = b.make_block("test");
        let body = b.make_block("body");
        let exit = b.make_block("exit");
        b.emit(entry, Instruction::CreateLexicalEnvironment);
        b.emit(entry, Instruction::CreateVariable { identifier: name, mutable: true });
        b.emit(entry, int(0));
        b.emit(entry, Instruction::SetVariable { identifier: name, initialize: true });
        b.emit(entry, Instruction::Store { dst: i });
        b.emit(entry, Instruction::Jump { target: test });
        b.emit(test, int(4));
        b.emit(test, Instruction::LessThan { lhs: i });
        b.emit(test, Instruction::JumpConditional { true_target: body, false_target: exit });
        b.emit(body, Instruction::GetVariable { identifier: name, cache });
        b.emit(body, Instruction::Add { lhs: i });
        b.emit(body, Instruction::SetVariable { identifier: name, initialize: false });
        b.emit(body, Instruction::Load { src: i });
        b.emit(body, Instruction::Increment);
        b.emit(body, Instruction::Store { dst: i });
        b.emit(body, Instruction::Jump { target: test });
        b.emit(exit, Instruction::GetVariable { identifier: name, cache });
        b.emit(exit, Instruction::LeaveLexicalEnvironment);
        b.emit(exit, Instruction::Return);
        b.build().unwrap()
    };
    let (_vm, result) = run_both(build);
    assert_eq!(result.unwrap(), Value::int32(6));
}

/// Two passes through the same `GetVariable` site, each in a fresh inner
/// scope. Only the second scope declares its own `x`.
fn shadowed_in_fresh_scope() -> Rc<Executable> {
    let mut b = ExecutableBuilder::new("fresh_scope_shadowing");
    let i = b.allocate_register();
    let sum = b.allocate_register();
    let x = b.identifier("x");
    let cache = b.environment_cache();
    let entry = b.make_block("entry");
    let test = b.make_block("test");
    let body = b.make_block("body");
    let declare = b.make_block("declare");
    let read = b.make_block("read");
    let exit = b.make_block("exit");

    b.emit(entry, Instruction::CreateLexicalEnvironment);
    b.emit(entry, Instruction::CreateVariable { identifier: x, mutable: true });
    b.emit(entry, int(1));
    b.emit(entry, Instruction::SetVariable { identifier: x, initialize: true });
    b.emit(entry, int(0));
    b.emit(entry, Instruction::Store { dst: i });
    b.emit(entry, Instruction::Store { dst: sum });
    b.emit(entry, Instruction::Jump { target: test });

    b.emit(test, int(2));
    b.emit(test, Instruction::LessThan { lhs: i });
    b.emit(test, Instruction::JumpConditional { true_target: body, false_target: exit });

    b.emit(body, Instruction::CreateLexicalEnvironment);
    b.emit(body, int(1));
    b.emit(body, Instruction::StrictlyEquals { lhs: i });
    b.emit(body, Instruction::JumpConditional { true_target: declare, false_target: read });

    b.emit(declare, Instruction::CreateVariable { identifier: x, mutable: true });
    b.emit(declare, int(2));
    b.emit(declare, Instruction::SetVariable { identifier: x, initialize: true });
    b.emit(declare, Instruction::Jump { target: read });

    b.emit(read, Instruction::GetVariable { identifier: x, cache });
    b.emit(read, Instruction::Add { lhs: sum });
    b.emit(read, Instruction::Store { dst: sum });
    b.emit(read, Instruction::LeaveLexicalEnvironment);
    b.emit(read, Instruction::Load { src: i });
    b.emit(read, Instruction::Increment);
    b.emit(read, Instruction::Store { dst: i });
    b.emit(read, Instruction::Jump { target: test });

    b.emit(exit, Instruction::Load { src: sum });
    b.emit(exit, Instruction::Return);
    b.build().unwrap()
}

#[test]
fn test_environment_cache_misses_in_fresh_shadowing_scope() {
    let (_vm, result) = run_both(shadowed_in_fresh_scope);
    assert_eq!(result.unwrap(), Value::int32(1 + 2));
}

fn generator() -> Rc<Executable> {
    let mut b = ExecutableBuilder::new("gen");
    let r = b.allocate_register();
    let entry = b.make_block("entry");
    let next = b.make_block("next");
    b.emit(entry, int(1));
    b.emit(entry, Instruction::Yield { continuation: Some(next) });
    b.emit(next, Instruction::Store { dst: r });
    b.emit(next, int(100));
    b.emit(next, Instruction::Add { lhs: r });
    b.emit(next, Instruction::Return);
    b.build().unwrap()
}

#[test]
fn test_yield_resumes_at_next_instruction() {
    let vm = Vm::new(RuntimeConfig::jit_eager());
    let program = generator();
    let mut frame = vm.prepare(&program);
    assert!(frame.is_compiled());

    let record = vm.execute(&mut frame).unwrap();
    assert_eq!(frame.state(), FrameState::Suspended);
    let continuation = vm.continuation(record).unwrap();
    assert_eq!(continuation.result, Value::int32(1));
    assert!(!continuation.is_await);
    let token = continuation.token.unwrap();

    let native = program.native().unwrap();
    assert_eq!(
        native.bytecode_location_for(token.0),
        Some(Location::Instruction { block: 1, index: 0 })
    );

    let done = vm.resume(&mut frame, token, Value::int32(5)).unwrap();
    assert_eq!(done, Value::int32(105));
    assert_eq!(frame.state(), FrameState::Completed);
}

#[test]
fn test_forged_resume_token_is_rejected() {
    let vm = Vm::new(RuntimeConfig::jit_eager());
    let program = generator();
    let mut frame = vm.prepare(&program);
    let record = vm.execute(&mut frame).unwrap();
    let token = vm.continuation(record).unwrap().token.unwrap();
    for forged in [ResumeToken(token.0 + 1), ResumeToken(2), ResumeToken(token.0 - 1)] {
        assert!(matches!(
            vm.resume(&mut frame, forged, Value::undefined()),
            Err(VmError::InvalidResumeToken)
        ));
    }
    assert_eq!(frame.state(), FrameState::Suspended);
}

#[test]
fn test_schedule_jump_falls_back_to_interpreter() {
    let build = || {
        let mut b = ExecutableBuilder::new("scheduled");
        let entry = b.make_block("entry");
        let target = b.make_block("target");
        b.emit(entry, Instruction::ScheduleJump { target });
        b.emit(target, int(3));
        b.emit(target, Instruction::Return);
        b.build().unwrap()
    };
    let vm = Vm::new(RuntimeConfig::jit_eager());
    let program = build();
    assert_eq!(vm.run(&program).unwrap(), Value::int32(3));
    assert!(program.native().is_none());
    assert_eq!(vm.jit_compile_count(), 0);
}

#[test]
fn test_compilation_is_deterministic() {
    let first = jit::compiler::compile(&shape_churn()).unwrap();
    let second = jit::compiler::compile(&shape_churn()).unwrap();
    // Cache addresses are baked in as immediates, so compare everything else.
    assert_eq!(first.code.len(), second.code.len());
    assert_eq!(first.offset_map.entries(), second.offset_map.entries());
    assert_eq!(first.resume_offsets, second.resume_offsets);

    let program = generator();
    let a = jit::compiler::compile(&program).unwrap();
    let b = jit::compiler::compile(&program).unwrap();
    assert_eq!(a.code, b.code);
}
