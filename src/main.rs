use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

mod asm;
mod codegen;
mod config;
mod context;
mod core;
mod memory;
mod runtime;

use config::Options;
use runtime::{HeapObj, Insn, Value, Vm, QNIL, QTRUE};

/// Built-in demo programs, since the VM has no frontend
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum DemoArg {
    /// Constant fixnum arithmetic
    #[default]
    Arith,
    /// Branch on the self value, add on the truthy arm
    Branch,
    /// A two-pass loop over locals with a backward jump
    Loop,
    /// Branch on an embedded string object
    Strings,
}

#[derive(Parser)]
#[command(name = "blockjit")]
#[command(about = "A lazy block-versioning JIT for a small stack VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demo program until it goes hot and gets compiled
    Run {
        /// Which demo program to run
        #[arg(value_enum, default_value = "arith")]
        demo: DemoArg,

        /// How many times to enter the program
        #[arg(long, default_value = "50")]
        iterations: u64,

        /// Load options from a TOML file before applying flags
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Number of calls before a sequence is compiled
        #[arg(long)]
        call_threshold: Option<u64>,

        /// Maximum block versions per bytecode location
        #[arg(long)]
        max_versions: Option<usize>,

        /// Size of the executable memory region in MiB
        #[arg(long)]
        exec_mem_size: Option<usize>,

        /// Hold out for exact context matches while under the version cap
        #[arg(long)]
        greedy_versioning: bool,

        /// Disable type learning
        #[arg(long)]
        no_type_prop: bool,

        /// Trace compilation, stub-hit and invalidation events
        #[arg(long)]
        trace_jit: bool,

        /// Break the fixnum-add assumption halfway through, forcing
        /// invalidation and recompilation
        #[arg(long)]
        invalidate: bool,
    },
}

/// Define a demo program in the VM; returns the sequence id and the
/// self value to run it with.
fn build_demo(vm: &mut Vm, demo: DemoArg) -> (u32, Value) {
    match demo {
        DemoArg::Arith => {
            // (40 + 2) + -1
            let seq = vm.def_seq(
                vec![
                    Insn::PutObject(Value::fixnum(40)),
                    Insn::PutObject(Value::fixnum(2)),
                    Insn::Add,
                    Insn::PutObject(Value::fixnum(-1)),
                    Insn::Add,
                    Insn::Leave,
                ],
                0,
            );
            (seq, QNIL)
        }
        DemoArg::Branch => {
            // if self then self + 1 else 0
            let seq = vm.def_seq(
                vec![
                    Insn::PutSelf,
                    Insn::BranchUnless(6),
                    Insn::PutSelf,
                    Insn::PutObject(Value::fixnum(1)),
                    Insn::Add,
                    Insn::Leave,
                    Insn::PutObject(Value::fixnum(0)),
                    Insn::Leave,
                ],
                0,
            );
            (seq, Value::fixnum(10))
        }
        DemoArg::Loop => {
            // acc = 0; loop { acc += 1; break if flag; flag = true }; acc
            let seq = vm.def_seq(
                vec![
                    Insn::PutObject(Value::fixnum(0)),
                    Insn::SetLocal(0),
                    Insn::GetLocal(0),
                    Insn::PutObject(Value::fixnum(1)),
                    Insn::Add,
                    Insn::SetLocal(0),
                    Insn::GetLocal(1),
                    Insn::BranchUnless(9),
                    Insn::Jump(12),
                    Insn::PutObject(QTRUE),
                    Insn::SetLocal(1),
                    Insn::Jump(2),
                    Insn::GetLocal(0),
                    Insn::Leave,
                ],
                2,
            );
            (seq, QNIL)
        }
        DemoArg::Strings => {
            // if "jit" then 1 else nil
            let greeting = vm.alloc(HeapObj::Str("jit".to_owned()));
            let seq = vm.def_seq(
                vec![
                    Insn::PutObject(greeting),
                    Insn::BranchUnless(4),
                    Insn::PutObject(Value::fixnum(1)),
                    Insn::Leave,
                    Insn::PutNil,
                    Insn::Leave,
                ],
                0,
            );
            (seq, QNIL)
        }
    }
}

fn format_value(val: Value) -> String {
    if val.fixnum_p() {
        val.as_fixnum().to_string()
    } else if val == QNIL {
        "nil".to_owned()
    } else if val == QTRUE {
        "true".to_owned()
    } else if val == runtime::QFALSE {
        "false".to_owned()
    } else {
        match unsafe { &*val.as_heap_ptr() } {
            HeapObj::Str(s) => format!("{:?}", s),
            HeapObj::Array(items) => format!("<array of {}>", items.len()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_demo(
    demo: DemoArg,
    iterations: u64,
    config: Option<PathBuf>,
    call_threshold: Option<u64>,
    max_versions: Option<usize>,
    exec_mem_size: Option<usize>,
    greedy_versioning: bool,
    no_type_prop: bool,
    trace_jit: bool,
    invalidate: bool,
) -> ExitCode {
    let mut options = match config {
        Some(path) => match Options::from_file(&path) {
            Ok(options) => options,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Options::default(),
    };

    if let Some(v) = call_threshold {
        options.call_threshold = v;
    }
    if let Some(v) = max_versions {
        options.max_versions = v;
    }
    if let Some(v) = exec_mem_size {
        options.exec_mem_size = v;
    }
    options.greedy_versioning |= greedy_versioning;
    options.no_type_prop |= no_type_prop;
    options.trace_jit |= trace_jit;

    if let Err(e) = core::jit_init(options) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    let (seq, self_val) = {
        let mut jv = match core::global().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        build_demo(&mut jv.vm, demo)
    };

    let mut last = None;
    for i in 0..iterations {
        let result = match core::run_seq(seq, self_val) {
            Ok(val) => val,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        };

        // Compiled and interpreted entries must agree
        if let Some(last) = last {
            if last != result {
                eprintln!(
                    "result changed between iterations: {} then {}",
                    format_value(last),
                    format_value(result)
                );
                return ExitCode::FAILURE;
            }
        }
        last = Some(result);

        if invalidate && i == iterations / 2 {
            let mut jv = match core::global().lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            core::invalidate_assumption(&mut jv, "fixnum_plus");
        }
    }

    match last {
        Some(result) => {
            println!("{}", format_value(result));
            ExitCode::SUCCESS
        }
        None => {
            eprintln!("no iterations were run");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            demo,
            iterations,
            config,
            call_threshold,
            max_versions,
            exec_mem_size,
            greedy_versioning,
            no_type_prop,
            trace_jit,
            invalidate,
        } => run_demo(
            demo,
            iterations,
            config,
            call_threshold,
            max_versions,
            exec_mem_size,
            greedy_versioning,
            no_type_prop,
            trace_jit,
            invalidate,
        ),
    }
}
