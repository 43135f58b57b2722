use std::cell::{Cell, RefCell};
use std::io::{self, Write};
use std::rc::Rc;

use tracing::{debug, warn};

use super::Value;
use super::bytecode::{Executable, Label, Register};
use super::environment::Environment;
use super::heap::{Callable, Heap, Object, ObjectRef};
use super::interpreter;
use super::ops::{self, Completion, ErrorType};
use super::realm::Realm;
use crate::config::{JitMode, RuntimeConfig};
use crate::error::VmError;
use crate::jit::{self, JitError, NativeExecutable, PerfMap};

/// Nesting limit for calls; native and interpreted frames both count.
const MAX_CALL_DEPTH: u32 = 256;

/// Per-invocation state shared by the interpreter and compiled code.
///
/// Compiled code receives a pointer to this struct and reads the fields it
/// needs at their `offset_of!` positions; the register and locals arrays are
/// passed separately as base pointers.
#[repr(C)]
pub struct ExecutionContext {
    vm: *const Vm,
    lexical_environment: Cell<*const Environment>,
    global_object: *const Object,
    global_environment: *const Environment,
    builtins: *const Value,
    registers: Box<[Cell<Value>]>,
    locals: Box<[Cell<Value>]>,
    executable: Rc<Executable>,
    saved_environments: RefCell<Vec<*const Environment>>,
    scheduled_jump: Cell<Option<Label>>,
    suspended: Cell<bool>,
}

impl ExecutionContext {
    pub const fn lexical_environment_offset() -> usize {
        std::mem::offset_of!(ExecutionContext, lexical_environment)
    }

    pub const fn global_object_offset() -> usize {
        std::mem::offset_of!(ExecutionContext, global_object)
    }

    pub const fn global_environment_offset() -> usize {
        std::mem::offset_of!(ExecutionContext, global_environment)
    }

    pub const fn builtins_offset() -> usize {
        std::mem::offset_of!(ExecutionContext, builtins)
    }

    pub fn vm(&self) -> &Vm {
        // SAFETY: a context never outlives the VM that created it.
        unsafe { &*self.vm }
    }

    pub fn executable(&self) -> &Rc<Executable> {
        &self.executable
    }

    pub fn register(&self, register: Register) -> Value {
        self.registers[register.index()].get()
    }

    pub fn set_register(&self, register: Register, value: Value) {
        self.registers[register.index()].set(value);
    }

    pub fn accumulator(&self) -> Value {
        self.register(Register::ACCUMULATOR)
    }

    pub fn set_accumulator(&self, value: Value) {
        self.set_register(Register::ACCUMULATOR, value);
    }

    pub fn local(&self, index: u32) -> Value {
        self.locals[index as usize].get()
    }

    pub fn set_local(&self, index: u32, value: Value) {
        self.locals[index as usize].set(value);
    }

    pub(crate) fn registers_ptr(&self) -> *mut Value {
        self.registers.as_ptr() as *mut Value
    }

    pub(crate) fn locals_ptr(&self) -> *mut Value {
        self.locals.as_ptr() as *mut Value
    }

    pub fn lexical_environment(&self) -> &Environment {
        // SAFETY: environments are owned by the heap.
        unsafe { &*self.lexical_environment.get() }
    }

    pub(crate) fn lexical_environment_ptr(&self) -> *const Environment {
        self.lexical_environment.get()
    }

    pub fn create_lexical_environment(&self) {
        let environment = self.vm().heap().alloc_environment(self.lexical_environment.get());
        self.lexical_environment.set(environment);
    }

    pub fn leave_lexical_environment(&self) {
        if let Some(parent) = self.lexical_environment().parent() {
            self.lexical_environment.set(parent as *const Environment);
        }
    }

    pub fn enter_unwind_context(&self) {
        self.saved_environments.borrow_mut().push(self.lexical_environment.get());
    }

    pub fn leave_unwind_context(&self) {
        self.saved_environments.borrow_mut().pop();
    }

    /// Restore the environment saved by the innermost unwind context and pop
    /// it, before control enters an exception handler.
    pub fn unwind_to_handler(&self) {
        if let Some(environment) = self.saved_environments.borrow_mut().pop() {
            self.lexical_environment.set(environment);
        }
    }

    pub fn schedule_jump(&self, target: Label) {
        self.scheduled_jump.set(Some(target));
    }

    pub fn take_scheduled_jump(&self) -> Option<Label> {
        self.scheduled_jump.take()
    }

    pub(crate) fn mark_suspended(&self) {
        self.suspended.set(true);
    }

    /// Outcome of a finished run: the pending exception, or the return
    /// value (falling back to a value parked by a finalizer).
    fn completion(&self) -> Completion<Value> {
        let exception = self.register(Register::EXCEPTION);
        if !exception.is_empty() {
            self.set_register(Register::EXCEPTION, Value::empty());
            return Err(exception);
        }
        let value = [Register::RETURN_VALUE, Register::SAVED_RETURN_VALUE]
            .into_iter()
            .map(|r| self.register(r))
            .find(|v| !v.is_empty())
            .unwrap_or(Value::undefined());
        Ok(value)
    }
}

/// Opaque resume point handed out in a continuation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResumeToken(pub u64);

/// Decoded continuation record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Continuation {
    pub result: Value,
    /// `None` once the function has completed.
    pub token: Option<ResumeToken>,
    pub is_await: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Fresh,
    Suspended,
    Completed,
}

enum Tier {
    Native(Rc<NativeExecutable>),
    Interpreted,
}

/// An activation of an executable that may be suspended and resumed.
pub struct Frame {
    context: Box<ExecutionContext>,
    tier: Tier,
    state: FrameState,
}

impl Frame {
    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.tier, Tier::Native(_))
    }
}

pub struct Vm {
    heap: Heap,
    realm: Realm,
    config: RuntimeConfig,
    executables: RefCell<Vec<Rc<Executable>>>,
    call_depth: Cell<u32>,
    jit_compile_count: Cell<usize>,
    perf_map: RefCell<Option<PerfMap>>,
    output: RefCell<Box<dyn Write>>,
}

impl Vm {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_output(config, Box::new(io::stdout()))
    }

    /// Create a VM whose `print` output goes to `output`.
    pub fn with_output(config: RuntimeConfig, output: Box<dyn Write>) -> Self {
        let heap = Heap::new();
        let realm = Realm::new(&heap);
        Self {
            heap,
            realm,
            config,
            executables: RefCell::new(Vec::new()),
            call_depth: Cell::new(0),
            jit_compile_count: Cell::new(0),
            perf_map: RefCell::new(None),
            output: RefCell::new(output),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn realm(&self) -> &Realm {
        &self.realm
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn jit_compile_count(&self) -> usize {
        self.jit_compile_count.get()
    }

    pub(crate) fn print(&self, line: String) {
        if let Err(e) = writeln!(self.output.borrow_mut(), "{}", line) {
            warn!(error = %e, "print failed");
        }
    }

    /// Register an executable (and its nested functions) with the VM.
    pub fn load(&self, executable: &Rc<Executable>) {
        let mut executables = self.executables.borrow_mut();
        if executables.iter().any(|e| Rc::ptr_eq(e, executable)) {
            return;
        }
        executables.push(executable.clone());
        drop(executables);
        for function in &executable.functions {
            self.load(function);
        }
    }

    /// Forget every cached binding location. Needed when a binding is
    /// declared in an environment that cached lookups already walked past.
    pub(crate) fn invalidate_environment_caches(&self) {
        debug!("invalidating environment caches");
        for executable in self.executables.borrow().iter() {
            executable.caches().reset_environment();
        }
    }

    // ----- tiering -----

    /// Compile `executable` now, regardless of mode and threshold.
    pub fn compile(&self, executable: &Rc<Executable>) -> Result<Rc<NativeExecutable>, JitError> {
        let native = Rc::new(jit::compile(self, executable)?);
        self.jit_compile_count.set(self.jit_compile_count.get() + 1);
        debug!(
            function = %executable.name,
            code_size = native.code_size(),
            "compiled"
        );
        if self.config.dump_machine_code {
            let dir = self.config.dump_dir.clone().unwrap_or_else(std::env::temp_dir);
            match native.dump(&dir) {
                Ok(path) => debug!(path = %path.display(), "dumped machine code"),
                Err(e) => warn!(error = %e, "failed to dump machine code"),
            }
        }
        if self.config.emit_perf_map {
            self.record_perf_map(&native);
        }
        Ok(native)
    }

    fn record_perf_map(&self, native: &NativeExecutable) {
        let mut perf_map = self.perf_map.borrow_mut();
        if perf_map.is_none() {
            match PerfMap::open() {
                Ok(map) => *perf_map = Some(map),
                Err(e) => {
                    warn!(error = %e, "failed to open perf map");
                    return;
                }
            }
        }
        if let Some(map) = perf_map.as_mut() {
            if let Err(e) = map.record(native) {
                warn!(error = %e, "failed to write perf map entry");
            }
        }
    }

    fn tier_for(&self, executable: &Rc<Executable>) -> Tier {
        if self.config.jit_mode == JitMode::Off || !cfg!(feature = "jit") {
            return Tier::Interpreted;
        }
        if executable.native_cell().get().is_none() && executable.record_call() < self.config.jit_threshold {
            return Tier::Interpreted;
        }
        let native = executable.native_cell().get_or_init(|| match self.compile(executable) {
            Ok(native) => Some(native),
            Err(e) => {
                if self.config.jit_mode == JitMode::On {
                    warn!(function = %executable.name, error = %e, "JIT bail-out, interpreting");
                } else {
                    debug!(function = %executable.name, error = %e, "JIT bail-out, interpreting");
                }
                None
            }
        });
        match native {
            Some(native) => Tier::Native(native.clone()),
            None => Tier::Interpreted,
        }
    }

    // ----- frames -----

    fn instantiate(
        &self,
        executable: &Rc<Executable>,
        environment: *const Environment,
        this: Value,
        args: &[Value],
    ) -> Frame {
        let registers: Box<[Cell<Value>]> = (0..executable.register_count)
            .map(|_| Cell::new(Value::empty()))
            .collect();
        registers[Register::ACCUMULATOR.index()].set(Value::undefined());
        registers[Register::THIS.index()].set(this);
        let locals: Box<[Cell<Value>]> = (0..executable.local_count())
            .map(|i| {
                if i < executable.parameter_count {
                    Cell::new(args.get(i as usize).copied().unwrap_or(Value::undefined()))
                } else {
                    Cell::new(Value::empty())
                }
            })
            .collect();
        let context = Box::new(ExecutionContext {
            vm: self as *const Vm,
            lexical_environment: Cell::new(environment),
            global_object: self.realm.global_object().as_ptr(),
            global_environment: self.realm.global_environment_ptr(),
            builtins: self.realm.builtins().as_ptr(),
            registers,
            locals,
            executable: executable.clone(),
            saved_environments: RefCell::new(Vec::new()),
            scheduled_jump: Cell::new(None),
            suspended: Cell::new(false),
        });
        Frame {
            context,
            tier: self.tier_for(executable),
            state: FrameState::Fresh,
        }
    }

    /// Set up a top-level activation of `executable` in the global scope.
    pub fn prepare(&self, executable: &Rc<Executable>) -> Frame {
        self.load(executable);
        self.instantiate(
            executable,
            self.realm.global_environment_ptr(),
            Value::empty(),
            &[],
        )
    }

    fn run_frame(&self, frame: &mut Frame, resume: Option<ResumeToken>) -> Completion<Value> {
        let depth = self.call_depth.get();
        if depth >= MAX_CALL_DEPTH {
            return ops::throw(self, ErrorType::RangeError, "Maximum call stack size exceeded");
        }
        self.call_depth.set(depth + 1);
        let context = &*frame.context;
        match &frame.tier {
            // SAFETY: the context and its arrays stay alive and unaliased for
            // the duration of the call; resume tokens were validated.
            Tier::Native(native) => unsafe { native.run(context, resume.map_or(0, |t| t.0)) },
            Tier::Interpreted => {
                let entry = resume.map_or(Label(0), |t| Label(t.0 as u32 - 1));
                interpreter::run(self, context, entry);
            }
        }
        self.call_depth.set(depth);

        let completion = context.completion();
        frame.state = if context.suspended.take() && completion.is_ok() {
            FrameState::Suspended
        } else {
            FrameState::Completed
        };
        completion
    }

    fn uncaught(&self, exception: Value) -> VmError {
        VmError::Uncaught(ops::to_display_string(self, exception))
    }

    /// Run a fresh frame from its first block.
    pub fn execute(&self, frame: &mut Frame) -> Result<Value, VmError> {
        if frame.state != FrameState::Fresh {
            return Err(VmError::InvalidResumeToken);
        }
        self.run_frame(frame, None).map_err(|e| self.uncaught(e))
    }

    /// Continue a suspended frame at `token`, with `input` as the value of the
    /// suspending expression.
    pub fn resume(&self, frame: &mut Frame, token: ResumeToken, input: Value) -> Result<Value, VmError> {
        if frame.state != FrameState::Suspended {
            return Err(VmError::InvalidResumeToken);
        }
        let valid = match &frame.tier {
            Tier::Native(native) => native.is_resume_address(token.0),
            Tier::Interpreted => token.0 >= 1
                && token.0 <= u32::MAX as u64
                && frame
                    .context
                    .executable
                    .continuation_blocks()
                    .contains(&Label(token.0 as u32 - 1)),
        };
        if !valid {
            return Err(VmError::InvalidResumeToken);
        }
        frame.context.set_register(Register::RETURN_VALUE, Value::empty());
        frame.context.set_accumulator(input);
        self.run_frame(frame, Some(token)).map_err(|e| self.uncaught(e))
    }

    /// Load and run a top-level executable.
    pub fn run(&self, executable: &Rc<Executable>) -> Result<Value, VmError> {
        let mut frame = self.prepare(executable);
        self.execute(&mut frame)
    }

    /// Call `function` from the host.
    pub fn call(&self, function: Value, this: Value, args: &[Value]) -> Result<Value, VmError> {
        ops::call(self, function, this, args, None).map_err(|e| self.uncaught(e))
    }

    pub(crate) fn call_function(&self, function: ObjectRef, this: Value, args: &[Value]) -> Completion<Value> {
        match function.callable() {
            Some(Callable::Builtin(builtin)) => builtin.call(self, args),
            Some(Callable::Bytecode { executable, environment }) => {
                let environment = self.heap.alloc_environment(*environment);
                let mut frame = self.instantiate(executable, environment, this, args);
                self.run_frame(&mut frame, None)
            }
            None => ops::throw(self, ErrorType::TypeError, "not a function"),
        }
    }

    pub(crate) fn new_function(&self, executable: Rc<Executable>, environment: *const Environment) -> Value {
        self.load(&executable);
        let function = self.heap.alloc_function(
            Some(self.realm.function_prototype()),
            Callable::Bytecode { executable, environment },
        );
        Value::object(function)
    }

    // ----- continuations -----

    /// Build the `{ result, continuation, isAwait }` record returned by a
    /// suspending function. A zero token means the function has finished.
    pub(crate) fn create_continuation(&self, result: Value, token: u64, is_await: bool) -> Value {
        let record = self.heap.alloc_object(Some(self.realm.object_prototype()));
        self.heap.put_own(record, "result", result);
        self.heap.put_own(record, "continuation", Value::from_f64(token as f64));
        self.heap.put_own(record, "isAwait", Value::boolean(is_await));
        Value::object(record)
    }

    /// Decode a continuation record.
    pub fn continuation(&self, value: Value) -> Option<Continuation> {
        let record = value.as_object()?;
        let result = record.get_own("result")?;
        let token = record.get_own("continuation").filter(|v| v.is_number())?.as_number();
        let is_await = record.get_own("isAwait").is_some_and(|v| v.is_boolean() && v.as_bool());
        Some(Continuation {
            result,
            token: (token != 0.0).then_some(ResumeToken(token as u64)),
            is_await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::{ExecutableBuilder, Immediate, Instruction};

    #[test]
    fn test_run_returns_accumulator() {
        let vm = Vm::new(RuntimeConfig::interpreter_only());
        let mut b = ExecutableBuilder::new("main");
        let entry = b.make_block("entry");
        b.emit(entry, Instruction::LoadImmediate { value: Immediate::Int32(41) });
        b.emit(entry, Instruction::Increment);
        b.emit(entry, Instruction::Return);
        let exe = b.build().unwrap();
        assert_eq!(vm.run(&exe).unwrap(), Value::int32(42));
    }

    #[test]
    fn test_uncaught_exception_is_reported() {
        let vm = Vm::new(RuntimeConfig::interpreter_only());
        let mut b = ExecutableBuilder::new("main");
        let entry = b.make_block("entry");
        let name = b.identifier("missing");
        let cache = b.global_cache();
        b.emit(entry, Instruction::GetGlobal { identifier: name, cache });
        b.emit(entry, Instruction::Return);
        let exe = b.build().unwrap();
        let err = vm.run(&exe).unwrap_err();
        assert!(matches!(err, VmError::Uncaught(ref m) if m.contains("not defined")));
    }

    #[test]
    fn test_resume_rejects_unknown_token() {
        let vm = Vm::new(RuntimeConfig::interpreter_only());
        let mut b = ExecutableBuilder::new("gen");
        let entry = b.make_block("entry");
        let next = b.make_block("next");
        b.emit(entry, Instruction::Yield { continuation: Some(next) });
        b.emit(next, Instruction::Return);
        let exe = b.build().unwrap();

        let mut frame = vm.prepare(&exe);
        let record = vm.execute(&mut frame).unwrap();
        assert_eq!(frame.state(), FrameState::Suspended);
        let token = vm.continuation(record).unwrap().token.unwrap();
        assert_eq!(token, ResumeToken(2));
        assert!(matches!(
            vm.resume(&mut frame, ResumeToken(1), Value::undefined()),
            Err(VmError::InvalidResumeToken)
        ));
        let done = vm.resume(&mut frame, token, Value::int32(5)).unwrap();
        assert_eq!(done, Value::int32(5));
        assert_eq!(frame.state(), FrameState::Completed);
    }
}
