use kiln::config::{JitMode, RuntimeConfig};
use kiln::vm::{ExecutableBuilder, Executable, Immediate, Instruction, Register, Vm};
use serde::Serialize;
use std::rc::Rc;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    kiln_jit_on_secs: f64,
    kiln_jit_off_secs: f64,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

const ITERATIONS: i32 = 1_000_000;

// Rust reference implementations

fn rust_sum_loop() {
    let mut sum: i64 = 0;
    for i in 0..ITERATIONS as i64 {
        sum += i;
    }
    eprintln!("{}", sum);
}

fn rust_float_loop() {
    let mut sum = 0.0_f64;
    for _ in 0..ITERATIONS {
        sum += 0.5;
    }
    eprintln!("{}", sum);
}

fn rust_array_fill() {
    let mut elements = Vec::new();
    for i in 0..ITERATIONS / 10 {
        elements.push(i);
    }
    let sum: i64 = elements.iter().map(|&n| n as i64).sum();
    eprintln!("{}", sum);
}

fn sum_loop(float: bool) -> Rc<Executable> {
    let mut b = ExecutableBuilder::new(if float { "float_loop" } else { "sum_loop" });
    let i = b.allocate_register();
    let sum = b.allocate_register();
    let entry = b.make_block("entry");
    let test = b.make_block("test");
    let body = b.make_block("body");
    let exit = b.make_block("exit");

    b.emit(entry, Instruction::LoadImmediate { value: Immediate::Int32(0) });
    b.emit(entry, Instruction::Store { dst: i });
    b.emit(entry, Instruction::Store { dst: sum });
    b.emit(entry, Instruction::Jump { target: test });

    b.emit(test, Instruction::LoadImmediate { value: Immediate::Int32(ITERATIONS) });
    b.emit(test, Instruction::LessThan { lhs: i });
    b.emit(test, Instruction::JumpConditional { true_target: body, false_target: exit });

    if float {
        b.emit(body, Instruction::LoadImmediate { value: Immediate::Number(0.5) });
    } else {
        b.emit(body, Instruction::Load { src: i });
    }
    b.emit(body, Instruction::Add { lhs: sum });
    b.emit(body, Instruction::Store { dst: sum });
    b.emit(body, Instruction::Load { src: i });
    b.emit(body, Instruction::Increment);
    b.emit(body, Instruction::Store { dst: i });
    b.emit(body, Instruction::Jump { target: test });

    b.emit(exit, Instruction::Load { src: sum });
    b.emit(exit, Instruction::Return);
    b.build().expect("valid program")
}

fn array_fill() -> Rc<Executable> {
    let mut b = ExecutableBuilder::new("array_fill");
    let array = b.allocate_register();
    let i = b.allocate_register();
    let sum = b.allocate_register();
    let entry = b.make_block("entry");
    let fill_test = b.make_block("fill_test");
    let fill = b.make_block("fill");
    let sum_init = b.make_block("sum_init");
    let sum_test = b.make_block("sum_test");
    let sum_body = b.make_block("sum_body");
    let exit = b.make_block("exit");
    let count = ITERATIONS / 10;

    b.emit(entry, Instruction::NewArray { first_element: array, element_count: 0 });
    b.emit(entry, Instruction::Store { dst: array });
    b.emit(entry, Instruction::LoadImmediate { value: Immediate::Int32(0) });
    b.emit(entry, Instruction::Store { dst: i });
    b.emit(entry, Instruction::Jump { target: fill_test });

    b.emit(fill_test, Instruction::LoadImmediate { value: Immediate::Int32(count) });
    b.emit(fill_test, Instruction::LessThan { lhs: i });
    b.emit(fill_test, Instruction::JumpConditional { true_target: fill, false_target: sum_init });

    b.emit(fill, Instruction::Load { src: i });
    b.emit(fill, Instruction::PutByValue { base: array, property: i });
    b.emit(fill, Instruction::Increment);
    b.emit(fill, Instruction::Store { dst: i });
    b.emit(fill, Instruction::Jump { target: fill_test });

    b.emit(sum_init, Instruction::LoadImmediate { value: Immediate::Int32(0) });
    b.emit(sum_init, Instruction::Store { dst: i });
    b.emit(sum_init, Instruction::Store { dst: sum });
    b.emit(sum_init, Instruction::Jump { target: sum_test });

    b.emit(sum_test, Instruction::LoadImmediate { value: Immediate::Int32(count) });
    b.emit(sum_test, Instruction::LessThan { lhs: i });
    b.emit(sum_test, Instruction::JumpConditional { true_target: sum_body, false_target: exit });

    b.emit(sum_body, Instruction::Load { src: i });
    b.emit(sum_body, Instruction::GetByValue { base: array });
    b.emit(sum_body, Instruction::Add { lhs: sum });
    b.emit(sum_body, Instruction::Store { dst: sum });
    b.emit(sum_body, Instruction::Load { src: i });
    b.emit(sum_body, Instruction::Increment);
    b.emit(sum_body, Instruction::Store { dst: i });
    b.emit(sum_body, Instruction::Jump { target: sum_test });

    b.emit(exit, Instruction::Load { src: sum });
    b.emit(exit, Instruction::Return);
    b.build().expect("valid program")
}

fn time_rust<F>(f: F) -> f64
where
    F: FnOnce(),
{
    let start = Instant::now();
    f();
    start.elapsed().as_secs_f64()
}

fn run_kiln_benchmark(program: &Rc<Executable>, jit_enabled: bool) -> f64 {
    let config = RuntimeConfig {
        jit_mode: if jit_enabled { JitMode::On } else { JitMode::Off },
        jit_threshold: 0,
        ..Default::default()
    };
    let vm = Vm::new(config);

    let start = Instant::now();
    let result = vm.run(program);
    let elapsed = start.elapsed().as_secs_f64();

    if let Err(e) = result {
        eprintln!("kiln benchmark {} (jit={}) failed: {}", program.name, jit_enabled, e);
    }

    elapsed
}

fn main() {
    let benchmarks: [(Rc<Executable>, fn()); 3] = [
        (sum_loop(false), rust_sum_loop),
        (sum_loop(true), rust_float_loop),
        (array_fill(), rust_array_fill),
    ];

    let mut results = Vec::new();
    for (program, reference) in benchmarks {
        let rust_time = time_rust(reference);
        let jit_on = run_kiln_benchmark(&program, true);
        let jit_off = run_kiln_benchmark(&program, false);
        results.push(BenchmarkResult {
            name: program.name.clone(),
            kiln_jit_on_secs: jit_on,
            kiln_jit_off_secs: jit_off,
            rust_time_secs: rust_time,
        });
    }

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
