//! Machine code generation for bytecode instructions.
//!
//! Register roles inside a compiled frame:
//!
//! - `r12` holds the execution state pointer
//! - `r13` holds the local variable base
//! - `rbx` holds the stack pointer as it was on entry; the compiled code
//!   addresses stack slots at fixed offsets from it and only reconciles
//!   the interpreter's sp field when control leaves compiled code
//! - `rax` and `rcx` are scratch
//!
//! An entry point is called as `extern "sysv64" fn(*mut ExecState) -> u64`
//! and returns either the frame's result or undef to request that the
//! interpreter resume from the pc/sp recorded in the execution state.

use crate::asm::x86_64::*;
use crate::asm::{CodeBlock, CodePtr};
use crate::context::{Context, InsnOpnd::*, Type};
use crate::core::{
    self, Block, BlockId, BlockRef, BranchGenFn, Jit, MAX_CHAIN_DEPTH,
};
use crate::runtime::{
    ExecState, Insn, Value, Vm, EC_LOCALS_OFFSET, EC_PC_OFFSET, EC_SELF_OFFSET, EC_SP_OFFSET,
    QNIL, QUNDEF,
};

/// Upper bound on the byte size of one outlined exit
const EXIT_CODE_SIZE: usize = 64;

/// Output of one instruction's code generator
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum CodegenStatus {
    KeepCompiling,
    EndBlock,
    CantCompile,
}

/// Compilation state for one block
struct JitState {
    /// The block being compiled
    blockref: BlockRef,

    /// Location of the block's first instruction
    blockid: BlockId,

    /// Index of the instruction currently being compiled
    insn_idx: u32,

    /// Execution context when compiling from a stub hit, so runtime
    /// values can be inspected
    ec: Option<*mut ExecState>,
}

impl JitState {
    /// Whether the running frame is stopped exactly at the instruction
    /// being compiled, making its operands inspectable
    fn at_current_insn(&self) -> bool {
        match self.ec {
            Some(ec) => unsafe {
                (*ec).pc == self.insn_idx as u64 && (*ec).seq == self.blockid.seq
            },
            None => false,
        }
    }

    /// Read the value `n` slots down from the stack top of the running
    /// frame. Only valid at the current instruction: there the sp field
    /// has been reconciled, so the top really is at `sp - 1`.
    fn peek_at_stack(&self, ctx: &Context, n: isize) -> Value {
        assert!(self.at_current_insn());
        assert!((n as usize) < ctx.stack_size as usize);

        let ec = self.ec.unwrap();
        unsafe { Value((*ec).sp.offset(-1 - n).read()) }
    }
}

/// Operand for the stack slot `idx` positions down from the top
fn stack_opnd(ctx: &Context, idx: i32) -> Opnd {
    mem_opnd(64, RBX, 8 * (ctx.sp_offset as i32 - 1 - idx))
}

/// Low byte of a stack slot, for tag tests
fn stack_opnd8(ctx: &Context, idx: i32) -> Opnd {
    mem_opnd(8, RBX, 8 * (ctx.sp_offset as i32 - 1 - idx))
}

/// Operand for a local variable slot
fn local_opnd(local_idx: u8) -> Opnd {
    mem_opnd(64, R13, 8 * local_idx as i32)
}

/// The compile-time type of an embedded constant
fn type_of_value(val: Value) -> Type {
    if val.fixnum_p() {
        Type::Fixnum
    } else if val == QNIL {
        Type::Nil
    } else if val == crate::runtime::QTRUE {
        Type::True
    } else if val == crate::runtime::QFALSE {
        Type::False
    } else {
        assert!(val.heap_object_p());
        match unsafe { &*val.as_heap_ptr() } {
            crate::runtime::HeapObj::Array(_) => Type::Array,
            crate::runtime::HeapObj::Str(_) => Type::Str,
        }
    }
}

/// Pop the callee-saved registers and return to the caller of the entry
/// point
fn gen_epilogue(cb: &mut CodeBlock) {
    pop(cb, R13);
    pop(cb, R12);
    pop(cb, RBX);
    pop(cb, RBP);
    ret(cb);
}

/// Emit an exit to the interpreter into the outlined block: reconcile the
/// sp field for `ctx`, store the pc, and return undef through the
/// epilogue. Returns `None` when the outlined block is out of space.
pub fn gen_outlined_exit(ocb: &mut CodeBlock, ctx: &Context, insn_idx: u32) -> Option<CodePtr> {
    if !ocb.has_capacity(EXIT_CODE_SIZE) {
        return None;
    }

    let exit_ptr = ocb.get_write_ptr();

    if ctx.sp_offset != 0 {
        lea(ocb, RAX, mem_opnd(64, RBX, 8 * ctx.sp_offset as i32));
        mov(ocb, mem_opnd(64, R12, EC_SP_OFFSET), RAX);
    } else {
        mov(ocb, mem_opnd(64, R12, EC_SP_OFFSET), RBX);
    }
    mov(ocb, mem_opnd(64, R12, EC_PC_OFFSET), imm_opnd(insn_idx as i64));

    mov(ocb, RAX, uimm_opnd(QUNDEF.0));
    gen_epilogue(ocb);

    Some(exit_ptr)
}

/// The generic bail-out behind failed stub hits. The stub hit has already
/// written the exact pc/sp to resume from, so this only returns undef.
pub fn gen_stub_exit(ocb: &mut CodeBlock) -> CodePtr {
    let ptr = ocb.get_write_ptr();
    mov(ocb, RAX, uimm_opnd(QUNDEF.0));
    gen_epilogue(ocb);
    ptr
}

/// Trampoline that branch stubs jump to. The stub has loaded the branch
/// id and target index into the first two argument registers; this adds
/// the execution state, calls into the runtime, and jumps wherever the
/// runtime says.
pub fn gen_branch_stub_hit_trampoline(ocb: &mut CodeBlock) -> CodePtr {
    let ptr = ocb.get_write_ptr();

    // The stub is reached from block code, where the return address has
    // left rsp misaligned for a call
    push(ocb, RCX);
    mov(ocb, RDX, R12);
    call_ptr(ocb, RAX, core::branch_stub_hit_c as *const u8);
    pop(ocb, RCX);
    jmp_rm(ocb, RAX);

    ptr
}

/// Callee-saved register setup for an entry point
fn gen_entry_prologue(cb: &mut CodeBlock) {
    push(cb, RBP);
    push(cb, RBX);
    push(cb, R12);
    push(cb, R13);

    mov(cb, R12, RDI);
    mov(cb, RBX, mem_opnd(64, R12, EC_SP_OFFSET));
    mov(cb, R13, mem_opnd(64, R12, EC_LOCALS_OFFSET));
}

/// Compile an entry point for a sequence: the prologue followed by the
/// block batch for instruction 0 under the empty context.
pub fn gen_entry_point(jit: &mut Jit, vm: &mut Vm, seq: u32) -> Option<CodePtr> {
    let saved_pos = jit.cb.get_write_pos();
    jit.cb.align_pos(8);
    let code_ptr = jit.cb.get_write_ptr();

    gen_entry_prologue(&mut jit.cb);

    let blockid = BlockId { seq, idx: 0 };
    match core::gen_block_version(jit, vm, blockid, &Context::default(), None) {
        Some(_) => {
            jit.cb.mark_all_executable();
            jit.ocb.unwrap().mark_all_executable();
            if jit.options.trace_jit {
                eprintln!("jit: entry seq={}", seq);
            }
            Some(code_ptr)
        }
        None => {
            jit.cb.set_pos(saved_pos);
            None
        }
    }
}

/// Compile one block for the given location and context at the current
/// write position. On failure the block and any branches it made are
/// freed; the caller restores write cursors and the version table.
pub fn gen_single_block(
    jit: &mut Jit,
    vm: &mut Vm,
    blockid: BlockId,
    start_ctx: &Context,
    ec: Option<*mut ExecState>,
) -> Result<BlockRef, ()> {
    let mut ctx = *start_ctx;

    // The block goes into the arena up front so branches out of it can
    // name it before compilation finishes
    let blockref = BlockRef(jit.blocks.alloc(Block {
        blockid,
        ctx,
        start_addr: jit.cb.get_write_ptr(),
        end_addr: None,
        outgoing: Vec::new(),
        incoming: Vec::new(),
        gc_obj_offsets: Vec::new(),
        entry_exit: None,
    }));

    // Every block records an exit matching its entry state, so
    // invalidation always has somewhere to redirect to
    let Some(entry_exit) = gen_outlined_exit(jit.ocb.unwrap(), start_ctx, blockid.idx) else {
        core::free_block(jit, blockref);
        return Err(());
    };
    jit.block_mut(blockref).entry_exit = Some(entry_exit);

    let insns_len = vm.seqs[blockid.seq as usize].insns.len() as u32;
    let mut insn_idx = blockid.idx;
    let mut status = CodegenStatus::KeepCompiling;

    while insn_idx < insns_len {
        let insn = vm.seqs[blockid.seq as usize].insns[insn_idx as usize];
        let state = JitState {
            blockref,
            blockid,
            insn_idx,
            ec,
        };

        status = gen_insn(jit, vm, &state, &mut ctx, insn);
        match status {
            CodegenStatus::KeepCompiling => insn_idx += 1,
            CodegenStatus::EndBlock | CodegenStatus::CantCompile => break,
        }
    }

    // Running off the end of the sequence means malformed bytecode
    let failed = status != CodegenStatus::EndBlock
        || jit.cb.has_dropped_bytes()
        || jit.ocb.unwrap().has_dropped_bytes();
    if failed {
        core::free_block(jit, blockref);
        return Err(());
    }

    let end_addr = jit.cb.get_write_ptr();
    jit.block_mut(blockref).end_addr = Some(end_addr);
    Ok(blockref)
}

fn gen_insn(
    jit: &mut Jit,
    vm: &Vm,
    state: &JitState,
    ctx: &mut Context,
    insn: Insn,
) -> CodegenStatus {
    let opts = jit.options.clone();
    let seq = state.blockid.seq;

    match insn {
        Insn::PutNil => {
            ctx.stack_push(&opts, Type::Nil);
            mov(&mut jit.cb, stack_opnd(ctx, 0), imm_opnd(QNIL.0 as i64));
            CodegenStatus::KeepCompiling
        }

        Insn::PutObject(val) => {
            ctx.stack_push(&opts, type_of_value(val));
            let dst = stack_opnd(ctx, 0);

            if val.heap_object_p() {
                // Object references are always written full width so the
                // collector can find (and patch) them at a fixed offset
                let imm_offset = jit.cb.get_write_pos() + 2;
                movabs(&mut jit.cb, RAX, val.0);
                jit.block_mut(state.blockref)
                    .gc_obj_offsets
                    .push(imm_offset as u32);
                mov(&mut jit.cb, dst, RAX);
            } else if imm_num_bits(val.0 as i64) <= 32 {
                mov(&mut jit.cb, dst, imm_opnd(val.0 as i64));
            } else {
                mov(&mut jit.cb, RAX, uimm_opnd(val.0));
                mov(&mut jit.cb, dst, RAX);
            }
            CodegenStatus::KeepCompiling
        }

        Insn::PutSelf => {
            ctx.stack_push_self(&opts);
            mov(&mut jit.cb, RAX, mem_opnd(64, R12, EC_SELF_OFFSET));
            mov(&mut jit.cb, stack_opnd(ctx, 0), RAX);
            CodegenStatus::KeepCompiling
        }

        Insn::GetLocal(local_idx) => {
            ctx.stack_push_local(&opts, local_idx as usize);
            mov(&mut jit.cb, RAX, local_opnd(local_idx));
            mov(&mut jit.cb, stack_opnd(ctx, 0), RAX);
            CodegenStatus::KeepCompiling
        }

        Insn::SetLocal(local_idx) => {
            let val_type = ctx.get_opnd_type(StackOpnd(0));
            mov(&mut jit.cb, RAX, stack_opnd(ctx, 0));
            mov(&mut jit.cb, local_opnd(local_idx), RAX);
            ctx.stack_pop(1);
            ctx.set_local_type(&opts, local_idx as usize, val_type);
            CodegenStatus::KeepCompiling
        }

        Insn::Pop => {
            ctx.stack_pop(1);
            CodegenStatus::KeepCompiling
        }

        Insn::Add => gen_add(jit, vm, state, ctx),

        Insn::Jump(target_idx) => {
            let target = BlockId {
                seq,
                idx: target_idx as u32,
            };
            core::gen_direct_jump(jit, vm, state.blockref, ctx, target);
            CodegenStatus::EndBlock
        }

        Insn::BranchUnless(target_idx) => {
            let target = BlockId {
                seq,
                idx: target_idx as u32,
            };
            let next = BlockId {
                seq,
                idx: state.insn_idx + 1,
            };
            let val_type = ctx.get_opnd_type(StackOpnd(0));

            // When the truthiness is static the branch folds away
            if let Some(truthy) = val_type.known_truthy() {
                ctx.stack_pop(1);
                let dst = if truthy { next } else { target };
                core::gen_direct_jump(jit, vm, state.blockref, ctx, dst);
                return CodegenStatus::EndBlock;
            }

            // Zero flag set iff the value is nil or false
            mov(&mut jit.cb, RAX, stack_opnd(ctx, 0));
            test(&mut jit.cb, RAX, imm_opnd(!(QNIL.0 as i64)));
            ctx.stack_pop(1);

            match core::gen_branch(
                jit,
                vm,
                state.blockref,
                target,
                ctx,
                next,
                ctx,
                BranchGenFn::BranchUnless,
            ) {
                Ok(()) => CodegenStatus::EndBlock,
                Err(()) => CodegenStatus::CantCompile,
            }
        }

        Insn::Leave => {
            mov(&mut jit.cb, RAX, stack_opnd(ctx, 0));
            ctx.stack_pop(1);
            gen_epilogue(&mut jit.cb);
            CodegenStatus::EndBlock
        }
    }
}

/// Fixnum addition with speculation. With unknown operand types the block
/// ends here and compilation resumes once runtime values are available;
/// the recompile either commits to fixnums behind tag guards or hands the
/// instruction to the interpreter.
fn gen_add(jit: &mut Jit, vm: &Vm, state: &JitState, ctx: &mut Context) -> CodegenStatus {
    let opts = jit.options.clone();
    let arg_type = ctx.get_opnd_type(StackOpnd(0));
    let recv_type = ctx.get_opnd_type(StackOpnd(1));
    let both_fixnum = arg_type == Type::Fixnum && recv_type == Type::Fixnum;

    if !both_fixnum && !state.at_current_insn() && ctx.chain_depth < MAX_CHAIN_DEPTH {
        // Wait for runtime operand values before committing to a shape
        let here = BlockId {
            seq: state.blockid.seq,
            idx: state.insn_idx,
        };
        return match core::defer_compilation(jit, vm, state.blockref, here, ctx) {
            Ok(()) => CodegenStatus::EndBlock,
            Err(()) => CodegenStatus::CantCompile,
        };
    }

    if !both_fixnum && state.at_current_insn() {
        let recv = state.peek_at_stack(ctx, 1);
        let arg = state.peek_at_stack(ctx, 0);
        if !recv.fixnum_p() || !arg.fixnum_p() {
            // Not a fixnum add; this path belongs to the interpreter
            let Some(exit) = gen_outlined_exit(jit.ocb.unwrap(), ctx, state.insn_idx) else {
                return CodegenStatus::CantCompile;
            };
            jmp_ptr(&mut jit.cb, exit);
            return CodegenStatus::EndBlock;
        }
    }

    // The exit keeps the operands on the stack, so the interpreter can
    // re-execute the instruction from scratch
    let Some(side_exit) = gen_outlined_exit(jit.ocb.unwrap(), ctx, state.insn_idx) else {
        return CodegenStatus::CantCompile;
    };

    if recv_type != Type::Fixnum {
        test(&mut jit.cb, stack_opnd8(ctx, 1), uimm_opnd(1));
        jz_ptr(&mut jit.cb, side_exit);
        ctx.upgrade_opnd_type(&opts, StackOpnd(1), Type::Fixnum);
    }
    if arg_type != Type::Fixnum {
        test(&mut jit.cb, stack_opnd8(ctx, 0), uimm_opnd(1));
        jz_ptr(&mut jit.cb, side_exit);
        ctx.upgrade_opnd_type(&opts, StackOpnd(0), Type::Fixnum);
    }

    // The speculation has committed; downstream blocks are ordinary
    ctx.chain_depth = 0;

    core::assume_stable(jit, state.blockref, "fixnum_plus");

    // Untag one operand so adding the other tagged operand yields the
    // tagged sum. Overflow exits with the operand slots untouched.
    mov(&mut jit.cb, RAX, stack_opnd(ctx, 1));
    mov(&mut jit.cb, RCX, stack_opnd(ctx, 0));
    sub(&mut jit.cb, RCX, imm_opnd(1));
    add(&mut jit.cb, RAX, RCX);
    jo_ptr(&mut jit.cb, side_exit);

    ctx.stack_pop(2);
    ctx.stack_push(&opts, Type::Fixnum);
    mov(&mut jit.cb, stack_opnd(ctx, 0), RAX);

    CodegenStatus::KeepCompiling
}
