//! blockjit - a lazy block-versioning JIT for a small stack VM
//!
//! This library provides an in-memory x86-64 assembler and a JIT that
//! compiles bytecode into type-specialized basic blocks, linked by
//! patchable branches and compiled lazily through stubs.

pub mod asm;
pub mod codegen;
pub mod config;
pub mod context;
pub mod core;
pub mod memory;
pub mod runtime;

// Re-export commonly used types
pub use config::Options;
pub use core::{invalidate_assumption, jit_init, run_seq, Jit, JitVm};
pub use runtime::{HeapObj, Insn, Value, Vm};
