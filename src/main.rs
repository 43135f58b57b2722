use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kiln::vm::ops;
use kiln::{Executable, JitMode, RuntimeConfig, Vm, VmError};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Run and compile kiln bytecode programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a serialized bytecode program and print its completion value
    Run {
        /// Program in JSON form
        program: PathBuf,

        /// JIT mode (overrides config file and KILN_JIT)
        #[arg(long, value_enum)]
        jit: Option<JitModeArg>,

        /// Calls before a function is compiled
        #[arg(long)]
        jit_threshold: Option<u32>,

        /// Write machine code and offset maps of compiled functions to DIR
        #[arg(long, value_name = "DIR")]
        dump_jit: Option<PathBuf>,

        /// Append compiled functions to /tmp/perf-<pid>.map
        #[arg(long)]
        perf_map: bool,

        /// Log JIT activity at debug level
        #[arg(long)]
        trace_jit: bool,

        /// TOML runtime configuration
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
    /// Compile every function of a program and write code plus offset maps
    Compile {
        /// Program in JSON form
        program: PathBuf,

        /// Output directory
        #[arg(long, default_value = "kiln-out")]
        out: PathBuf,
    },
}

fn init_tracing(trace_jit: bool) {
    let default = if trace_jit { "kiln=debug" } else { "kiln=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_program(path: &Path) -> Result<Rc<Executable>, VmError> {
    let json = std::fs::read_to_string(path)?;
    Executable::from_json(&json)
}

fn runtime_config(
    config: Option<&Path>,
    jit: Option<JitModeArg>,
    jit_threshold: Option<u32>,
    dump_jit: Option<PathBuf>,
    perf_map: bool,
    trace_jit: bool,
) -> Result<RuntimeConfig, VmError> {
    let mut runtime = match config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    runtime.apply_env()?;
    if let Some(jit) = jit {
        runtime.jit_mode = jit.into();
    }
    if let Some(threshold) = jit_threshold {
        runtime.jit_threshold = threshold;
    }
    if let Some(dir) = dump_jit {
        runtime.dump_machine_code = true;
        runtime.dump_dir = Some(dir);
    }
    runtime.emit_perf_map |= perf_map;
    runtime.trace_jit |= trace_jit;
    Ok(runtime)
}

fn run(program: &Path, config: RuntimeConfig) -> Result<(), VmError> {
    let executable = load_program(program)?;
    let vm = Vm::new(config);
    let value = vm.run(&executable)?;
    println!("{}", ops::to_display_string(&vm, value));
    Ok(())
}

fn compile(program: &Path, out: &Path) -> Result<(), VmError> {
    let executable = load_program(program)?;
    let vm = Vm::new(RuntimeConfig::jit_eager());
    let mut pending = vec![executable];
    while let Some(executable) = pending.pop() {
        pending.extend(executable.functions.iter().cloned());
        match vm.compile(&executable) {
            Ok(native) => {
                let path = native.dump(out)?;
                info!(function = %executable.name, path = %path.display(), "wrote");
                println!("{}: {} bytes -> {}", executable.name, native.code_size(), path.display());
            }
            Err(e) => {
                warn!(function = %executable.name, error = %e, "not compiled");
                println!("{}: not compiled ({})", executable.name, e);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            program,
            jit,
            jit_threshold,
            dump_jit,
            perf_map,
            trace_jit,
            config,
        } => {
            init_tracing(trace_jit);
            runtime_config(config.as_deref(), jit, jit_threshold, dump_jit, perf_map, trace_jit)
                .and_then(|config| run(&program, config))
        }
        Commands::Compile { program, out } => {
            init_tracing(false);
            compile(&program, &out)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
