//! Block versioning, branch patching and invalidation.
//!
//! This is the heart of the JIT: it maps (bytecode location, context)
//! pairs to compiled block versions, wires blocks together with patchable
//! branches, lazily compiles branch targets through stubs, and tears
//! compiled code down again when a runtime assumption breaks.
//!
//! Blocks and branches live in arenas and refer to each other by stable
//! ids, never by pointer, so invalidation cannot leave dangling references.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::asm::x86_64::*;
use crate::asm::{CodeBlock, CodePtr, OutlinedCb};
use crate::codegen;
use crate::config::Options;
use crate::context::{Context, TypeDiff};
use crate::memory::{ExecutableMemory, MemoryError};
use crate::runtime::{ExecState, Frame, RuntimeError, Value, Vm, QUNDEF};

/// Maximum depth of a speculation side chain at one bytecode location
pub const MAX_CHAIN_DEPTH: u8 = 5;

/// Worst-case byte size of a branch stub. Capacity is checked against
/// this before emission; the actual encoding is smaller.
pub const BRANCH_STUB_SIZE: usize = 32;

/// Cap on the number of blocks compiled in one contiguous batch
const MAX_PER_BATCH: usize = 1000;

/// Growable id-addressed storage. Freed slots are tombstoned, never
/// reused: ids may be baked into machine code (branch stubs), so a
/// recycled id could resolve to the wrong object.
pub struct Arena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena { slots: Vec::new() }
    }

    pub fn alloc(&mut self, item: T) -> u32 {
        self.slots.push(Some(item));
        (self.slots.len() - 1) as u32
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn free(&mut self, id: u32) -> Option<T> {
        self.slots.get_mut(id as usize).and_then(|s| s.take())
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Arena::new()
    }
}

/// Stable handle to a compiled block
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct BlockRef(pub u32);

/// Stable handle to a branch
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct BranchRef(pub u32);

/// A bytecode location: instruction sequence plus instruction index
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockId {
    pub seq: u32,
    pub idx: u32,
}

/// Positioning of a branch relative to its targets
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BranchShape {
    /// Target 0 is placed immediately after the branch
    Next0,
    /// Target 1 is placed immediately after the branch
    Next1,
    /// Neither target is adjacent, far form
    Default,
}

/// How to re-encode a branch for a given shape and target addresses.
/// Every emission of one branch goes through the same variant, so a
/// reshape can only shrink the code.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BranchGenFn {
    /// Jump to target 0 when the zero flag is set (the tested value was
    /// nil or false), otherwise to target 1
    BranchUnless,
    /// Unconditional jump to target 0
    JumpToTarget0,
}

impl BranchGenFn {
    pub fn call(
        &self,
        cb: &mut CodeBlock,
        shape: BranchShape,
        target0: Option<CodePtr>,
        target1: Option<CodePtr>,
    ) {
        match self {
            BranchGenFn::BranchUnless => match shape {
                BranchShape::Next0 => {
                    jnz_ptr(cb, target1.expect("branch target not resolved"));
                }
                BranchShape::Next1 => {
                    jz_ptr(cb, target0.expect("branch target not resolved"));
                }
                BranchShape::Default => {
                    jz_ptr(cb, target0.expect("branch target not resolved"));
                    jmp_ptr(cb, target1.expect("branch target not resolved"));
                }
            },
            BranchGenFn::JumpToTarget0 => match shape {
                BranchShape::Next0 => (),
                BranchShape::Next1 => {
                    unreachable!("jump would flow into target 1");
                }
                BranchShape::Default => {
                    jmp_ptr(cb, target0.expect("branch target not resolved"));
                }
            },
        }
    }
}

/// What a branch target currently points at
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BranchTargetKind {
    /// Resolved to a compiled block
    Block(BlockRef),
    /// Lazy stub. `None` means no code yet: the batch compiler has been
    /// asked to place the target immediately after the branch.
    Stub(Option<CodePtr>),
}

#[derive(Copy, Clone, Debug)]
pub struct BranchTarget {
    pub id: BlockId,
    pub ctx: Context,
    pub kind: BranchTargetKind,
}

impl BranchTarget {
    fn address(&self, jit: &Jit) -> Option<CodePtr> {
        match self.kind {
            BranchTargetKind::Block(blockref) => Some(jit.block(blockref).start_addr),
            BranchTargetKind::Stub(addr) => addr,
        }
    }
}

/// A control-flow edge out of a block. Owned by its source block.
pub struct Branch {
    /// The block this branch belongs to
    pub block: BlockRef,

    /// Code range implementing the branch in the inline block
    pub start_addr: Option<CodePtr>,
    pub end_addr: Option<CodePtr>,

    /// Up to two jump targets
    pub targets: [Option<BranchTarget>; 2],

    /// How to encode the branch
    pub gen_fn: BranchGenFn,

    /// Encoding currently in place
    pub shape: BranchShape,
}

/// One compiled version of a bytecode region under a specific context.
pub struct Block {
    pub blockid: BlockId,

    /// Context this block was compiled under
    pub ctx: Context,

    /// Code range in the inline block
    pub start_addr: CodePtr,
    pub end_addr: Option<CodePtr>,

    /// Branches out of this block, in emission order
    pub outgoing: Vec<BranchRef>,

    /// Branches targeting this block. Non-owning back references.
    pub incoming: Vec<BranchRef>,

    /// Offsets inside this block's code holding embedded object
    /// references, for the collector contract
    pub gc_obj_offsets: Vec<u32>,

    /// Exit taking the interpreter state at this block's entry.
    /// Invalidation patches the block start to jump here.
    pub entry_exit: Option<CodePtr>,
}

/// The JIT instance: both code blocks, the block and branch arenas, the
/// options, and the fixed trampolines.
pub struct Jit {
    pub cb: CodeBlock,
    pub ocb: OutlinedCb,

    pub blocks: Arena<Block>,
    pub branches: Arena<Branch>,

    pub options: Options,

    /// Generic "bail to the interpreter with the already-reconciled
    /// pc/sp" exit
    pub stub_exit: CodePtr,

    /// Trampoline that branch stubs jump to
    pub stub_hit_tramp: CodePtr,

    /// Blocks depending on named runtime assumptions
    assumptions: HashMap<String, Vec<BlockRef>>,

    /// Whether generated code can actually be executed on this host
    pub exec_enabled: bool,

    // Keeps the mapping alive for the life of the JIT
    #[allow(unused)]
    mem: Option<ExecutableMemory>,
}

impl Jit {
    /// Create a JIT instance backed by real executable memory, split in
    /// half between the inline and outlined code blocks.
    pub fn new(options: Options) -> Result<Jit, MemoryError> {
        let mem = ExecutableMemory::new(options.exec_mem_size * 1024 * 1024)?;
        let page_size = ExecutableMemory::page_size();
        let half = (mem.size() / 2 / page_size) * page_size;

        let cb = CodeBlock::new(mem.as_mut_ptr(), half, page_size);
        let ocb_ptr = unsafe { mem.as_mut_ptr().add(half) };
        let ocb = OutlinedCb::wrap(CodeBlock::new(ocb_ptr, mem.size() - half, page_size));

        let exec_enabled = cfg!(all(target_arch = "x86_64", unix));
        Ok(Jit::finish_init(cb, ocb, options, Some(mem), exec_enabled))
    }

    /// Create a JIT instance over plain heap memory for tests. The
    /// compilation and patching machinery all works; the code just can
    /// never run.
    pub fn new_dummy(options: Options) -> Jit {
        let cb = CodeBlock::new_dummy(1024 * 1024);
        let ocb = OutlinedCb::wrap(CodeBlock::new_dummy(1024 * 1024));
        Jit::finish_init(cb, ocb, options, None, false)
    }

    fn finish_init(
        cb: CodeBlock,
        mut ocb: OutlinedCb,
        options: Options,
        mem: Option<ExecutableMemory>,
        exec_enabled: bool,
    ) -> Jit {
        let stub_exit = codegen::gen_stub_exit(ocb.unwrap());
        let stub_hit_tramp = codegen::gen_branch_stub_hit_trampoline(ocb.unwrap());
        // The trampolines are shared by all future code and never patched
        ocb.unwrap().freeze_written();

        Jit {
            cb,
            ocb,
            blocks: Arena::new(),
            branches: Arena::new(),
            options,
            stub_exit,
            stub_hit_tramp,
            assumptions: HashMap::new(),
            exec_enabled,
            mem,
        }
    }

    pub fn block(&self, blockref: BlockRef) -> &Block {
        match self.blocks.get(blockref.0) {
            Some(block) => block,
            None => panic!("stale block reference {:?}", blockref),
        }
    }

    pub fn block_mut(&mut self, blockref: BlockRef) -> &mut Block {
        match self.blocks.get_mut(blockref.0) {
            Some(block) => block,
            None => panic!("stale block reference {:?}", blockref),
        }
    }

    pub fn branch(&self, branchref: BranchRef) -> &Branch {
        match self.branches.get(branchref.0) {
            Some(branch) => branch,
            None => panic!("stale branch reference {:?}", branchref),
        }
    }

    pub fn branch_mut(&mut self, branchref: BranchRef) -> &mut Branch {
        match self.branches.get_mut(branchref.0) {
            Some(branch) => branch,
            None => panic!("stale branch reference {:?}", branchref),
        }
    }

    /// First byte of the inline block that is still patchable
    fn frozen_ptr(&self) -> CodePtr {
        self.cb.get_ptr(self.cb.get_frozen_bytes())
    }
}

/// The JIT and the VM it compiles for, bundled so one lock covers both.
pub struct JitVm {
    pub jit: Jit,
    pub vm: Vm,
}

impl JitVm {
    pub fn new(options: Options) -> Result<JitVm, MemoryError> {
        Ok(JitVm {
            jit: Jit::new(options)?,
            vm: Vm::new(),
        })
    }

    pub fn new_dummy(options: Options) -> JitVm {
        JitVm {
            jit: Jit::new_dummy(options),
            vm: Vm::new(),
        }
    }
}

// The raw code pointers inside the JIT are only reachable through the
// global lock below, so moving the bundle between threads is safe.
unsafe impl Send for JitVm {}

// The process-wide instance used by executing machine code. Everything
// that mutates code or version tables goes through this one lock.
static JIT_VM: OnceLock<Mutex<JitVm>> = OnceLock::new();

/// Errors from bringing up the global JIT
#[derive(Debug)]
pub enum InitError {
    Memory(MemoryError),
    AlreadyInitialized,
}

impl std::fmt::Display for InitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitError::Memory(err) => write!(f, "could not map executable memory: {}", err),
            InitError::AlreadyInitialized => write!(f, "jit already initialized"),
        }
    }
}

impl std::error::Error for InitError {}

/// Initialize the process-wide JIT instance
pub fn jit_init(options: Options) -> Result<(), InitError> {
    let jv = JitVm::new(options).map_err(InitError::Memory)?;
    JIT_VM
        .set(Mutex::new(jv))
        .map_err(|_| InitError::AlreadyInitialized)
}

/// The global instance. Panics if [`jit_init`] has not run.
pub fn global() -> &'static Mutex<JitVm> {
    match JIT_VM.get() {
        Some(jv) => jv,
        None => panic!("jit not initialized"),
    }
}

/// Run an instruction sequence on the global instance, compiling it once
/// it gets hot. The lock is held while compiling and interpreting, but
/// never while generated code runs: stub hits re-acquire it.
pub fn run_seq(seq: u32, self_val: Value) -> Result<Value, RuntimeError> {
    let (entry, num_locals) = {
        let mut guard = lock_jit_vm();
        let jv = &mut *guard;

        let payload = &mut jv.vm.seqs[seq as usize].payload;
        payload.call_count += 1;
        let hot = payload.call_count >= jv.jit.options.call_threshold;

        if payload.jit_entry.is_none()
            && hot
            && jv.jit.exec_enabled
            && !jv.jit.cb.has_dropped_bytes()
        {
            if let Some(code_ptr) = codegen::gen_entry_point(&mut jv.jit, &mut jv.vm, seq) {
                jv.vm.seqs[seq as usize].payload.jit_entry = Some(code_ptr);
            }
        }

        let payload = &jv.vm.seqs[seq as usize].payload;
        (payload.jit_entry, jv.vm.seqs[seq as usize].num_locals)
    };

    let mut frame = Frame::new(seq, num_locals, self_val);

    if let Some(entry) = entry {
        let ret = unsafe {
            let entry_fn: extern "sysv64" fn(*mut ExecState) -> u64 =
                std::mem::transmute(entry.raw_ptr());
            entry_fn(&mut frame.state)
        };
        if Value(ret) != QUNDEF {
            return Ok(Value(ret));
        }
        // Side exit: the exec state describes exactly where to resume
    }

    let guard = lock_jit_vm();
    guard.vm.interp(&mut frame.state)
}

fn lock_jit_vm() -> std::sync::MutexGuard<'static, JitVm> {
    match global().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

//===========================================================================
// Block/version manager

fn version_list<'a>(vm: &'a Vm, blockid: BlockId) -> &'a Vec<BlockRef> {
    &vm.seqs[blockid.seq as usize].payload.version_map[blockid.idx as usize]
}

fn version_list_mut<'a>(vm: &'a mut Vm, blockid: BlockId) -> &'a mut Vec<BlockRef> {
    &mut vm.seqs[blockid.seq as usize].payload.version_map[blockid.idx as usize]
}

/// Find the existing block version best matching a context, if any.
/// Smallest finite diff wins; ties go to the oldest version, so guard
/// chains keep hitting the already-established general path first.
pub fn find_block_version(jit: &Jit, vm: &Vm, blockid: BlockId, ctx: &Context) -> Option<BlockRef> {
    let versions = version_list(vm, blockid);

    let mut best: Option<BlockRef> = None;
    let mut best_diff = usize::MAX;

    for &blockref in versions {
        let block = jit.block(blockref);
        match ctx.diff(&block.ctx) {
            TypeDiff::Compatible(diff) if diff < best_diff => {
                best = Some(blockref);
                best_diff = diff;
            }
            _ => {}
        }
    }

    // Under greedy versioning, an imperfect match is only accepted once
    // the version cap leaves no room to specialize further
    if jit.options.greedy_versioning
        && best_diff > 0
        && versions.len() + 1 < jit.options.max_versions
    {
        return None;
    }

    best
}

/// Produce the context to actually compile with. Once one more version
/// would reach the cap, all type information is erased so the new version
/// becomes a universal fallback. Contexts mid side chain are exempt:
/// chains bound their own retries.
pub fn limit_block_versions(jit: &Jit, vm: &Vm, blockid: BlockId, ctx: &Context) -> Context {
    if ctx.chain_depth > 0 {
        return *ctx;
    }

    let count = version_list(vm, blockid).len();
    if count + 1 >= jit.options.max_versions {
        let generic_ctx = Context::generic(ctx.stack_size, ctx.sp_offset);
        debug_assert!(
            ctx.diff(&generic_ctx) != TypeDiff::Incompatible,
            "generic context must accept everything the specialized one does"
        );
        return generic_ctx;
    }

    *ctx
}

/// Register a compiled block into its location's version table and
/// notify the collector of every object reference its code embeds.
pub fn add_block_version(jit: &mut Jit, vm: &mut Vm, blockref: BlockRef) {
    let (blockid, gc_obj_offsets) = {
        let block = jit.block(blockref);
        (block.blockid, block.gc_obj_offsets.clone())
    };

    version_list_mut(vm, blockid).push(blockref);

    for offset in gc_obj_offsets {
        let raw = jit.cb.read_u64_at(offset as usize);
        vm.gc.write_barrier(offset as usize, Value(raw));
    }

    if jit.options.trace_jit {
        let block = jit.block(blockref);
        eprintln!(
            "jit: block seq={} idx={} versions={} chain_depth={}",
            blockid.seq,
            blockid.idx,
            version_list(vm, blockid).len(),
            block.ctx.chain_depth,
        );
    }
}

fn remove_block_version(jit: &Jit, vm: &mut Vm, blockref: BlockRef) {
    let blockid = jit.block(blockref).blockid;
    version_list_mut(vm, blockid).retain(|&b| b != blockref);
}

/// Compile a batch of contiguously-chained blocks starting at `blockid`.
/// The batch is atomic: if any block fails, everything compiled in this
/// call is unregistered and freed and both code blocks rewind.
pub fn gen_block_version(
    jit: &mut Jit,
    vm: &mut Vm,
    blockid: BlockId,
    start_ctx: &Context,
    ec: Option<*mut ExecState>,
) -> Option<BlockRef> {
    let cb_pos = jit.cb.get_write_pos();
    let ocb_pos = jit.ocb.unwrap().get_write_pos();
    let mut batch: Vec<BlockRef> = Vec::new();

    let rollback = |jit: &mut Jit, vm: &mut Vm, batch: &[BlockRef]| {
        for &blockref in batch {
            remove_block_version(jit, vm, blockref);
            free_block(jit, blockref);
        }
        jit.cb.set_pos(cb_pos);
        jit.ocb.unwrap().set_pos(ocb_pos);
    };

    let ctx = limit_block_versions(jit, vm, blockid, start_ctx);
    let first = match codegen::gen_single_block(jit, vm, blockid, &ctx, ec) {
        Ok(blockref) => blockref,
        Err(()) => {
            rollback(jit, vm, &batch);
            return None;
        }
    };
    add_block_version(jit, vm, first);
    batch.push(first);

    let mut last = first;
    for _ in 0..MAX_PER_BATCH {
        // Did the last block end with a request to place its only
        // successor immediately after it?
        let Some(&branchref) = jit.block(last).outgoing.last() else {
            break;
        };
        let (next_id, next_ctx) = {
            let branch = jit.branch(branchref);
            match branch.targets[0] {
                Some(target) if target.kind == BranchTargetKind::Stub(None) => {
                    (target.id, target.ctx)
                }
                _ => break,
            }
        };

        let ctx = limit_block_versions(jit, vm, next_id, &next_ctx);
        match codegen::gen_single_block(jit, vm, next_id, &ctx, ec) {
            Ok(blockref) => {
                add_block_version(jit, vm, blockref);
                batch.push(blockref);

                // Resolve the fallthrough edge. The branch emitted no
                // code, so the new block sits directly after its source.
                let branch = jit.branch_mut(branchref);
                debug_assert_eq!(branch.shape, BranchShape::Next0);
                if let Some(target) = branch.targets[0].as_mut() {
                    target.kind = BranchTargetKind::Block(blockref);
                }
                jit.block_mut(blockref).incoming.push(branchref);

                last = blockref;
            }
            Err(()) => {
                rollback(jit, vm, &batch);
                return None;
            }
        }
    }

    Some(first)
}

//===========================================================================
// Branch/patch manager

/// Allocate a zero-initialized branch owned by `block`
fn make_branch_entry(jit: &mut Jit, block: BlockRef, gen_fn: BranchGenFn) -> BranchRef {
    let branchref = BranchRef(jit.branches.alloc(Branch {
        block,
        start_addr: None,
        end_addr: None,
        targets: [None, None],
        gen_fn,
        shape: BranchShape::Default,
    }));
    jit.block_mut(block).outgoing.push(branchref);
    branchref
}

/// Emit a stub for one branch target into the outlined block. The stub
/// passes its identity to the trampoline and jumps to whatever address
/// the stub hit resolves.
fn gen_branch_stub(jit: &mut Jit, branchref: BranchRef, target_idx: usize) -> Option<CodePtr> {
    let tramp = jit.stub_hit_tramp;
    let ocb = jit.ocb.unwrap();

    if !ocb.has_capacity(BRANCH_STUB_SIZE) {
        return None;
    }

    let stub_addr = ocb.get_write_ptr();
    movabs(ocb, RDI, branchref.0 as u64);
    mov(ocb, RSI, uimm_opnd(target_idx as u64));
    jmp_ptr(ocb, tramp);

    if ocb.has_dropped_bytes() {
        None
    } else {
        Some(stub_addr)
    }
}

/// Resolve one target of a branch: either an existing compatible version,
/// or a fresh stub in the outlined block. Returns the address the branch
/// should jump to, or `None` when stub space is exhausted.
fn get_branch_target(
    jit: &mut Jit,
    vm: &Vm,
    target: BlockId,
    ctx: &Context,
    branchref: BranchRef,
    target_idx: usize,
) -> Option<CodePtr> {
    if let Some(blockref) = find_block_version(jit, vm, target, ctx) {
        let addr = jit.block(blockref).start_addr;
        jit.block_mut(blockref).incoming.push(branchref);
        jit.branch_mut(branchref).targets[target_idx] = Some(BranchTarget {
            id: target,
            ctx: *ctx,
            kind: BranchTargetKind::Block(blockref),
        });
        return Some(addr);
    }

    let stub_addr = gen_branch_stub(jit, branchref, target_idx)?;
    jit.branch_mut(branchref).targets[target_idx] = Some(BranchTarget {
        id: target,
        ctx: *ctx,
        kind: BranchTargetKind::Stub(Some(stub_addr)),
    });
    Some(stub_addr)
}

/// Emit a two-target branch at the current write position. The condition
/// flags are expected to be set already; this only writes the jumps.
pub fn gen_branch(
    jit: &mut Jit,
    vm: &Vm,
    block: BlockRef,
    target0: BlockId,
    ctx0: &Context,
    target1: BlockId,
    ctx1: &Context,
    gen_fn: BranchGenFn,
) -> Result<(), ()> {
    let branchref = make_branch_entry(jit, block, gen_fn);

    let dst0 = get_branch_target(jit, vm, target0, ctx0, branchref, 0).ok_or(())?;
    let dst1 = get_branch_target(jit, vm, target1, ctx1, branchref, 1).ok_or(())?;

    let start = jit.cb.get_write_ptr();
    gen_fn.call(&mut jit.cb, BranchShape::Default, Some(dst0), Some(dst1));
    let end = jit.cb.get_write_ptr();

    let branch = jit.branch_mut(branchref);
    branch.start_addr = Some(start);
    branch.end_addr = Some(end);
    Ok(())
}

/// Emit an unconditional jump to a block version. When no compatible
/// version exists yet, emit nothing and ask the batch compiler to place
/// the target immediately after this block.
pub fn gen_direct_jump(jit: &mut Jit, vm: &Vm, block: BlockRef, ctx: &Context, target: BlockId) {
    let branchref = make_branch_entry(jit, block, BranchGenFn::JumpToTarget0);

    if let Some(blockref) = find_block_version(jit, vm, target, ctx) {
        let addr = jit.block(blockref).start_addr;
        jit.block_mut(blockref).incoming.push(branchref);

        let start = jit.cb.get_write_ptr();
        BranchGenFn::JumpToTarget0.call(&mut jit.cb, BranchShape::Default, Some(addr), None);
        let end = jit.cb.get_write_ptr();

        let branch = jit.branch_mut(branchref);
        branch.targets[0] = Some(BranchTarget {
            id: target,
            ctx: *ctx,
            kind: BranchTargetKind::Block(blockref),
        });
        branch.start_addr = Some(start);
        branch.end_addr = Some(end);
    } else {
        // Lazy fallthrough request, resolved by gen_block_version
        let here = jit.cb.get_write_ptr();
        let branch = jit.branch_mut(branchref);
        branch.targets[0] = Some(BranchTarget {
            id: target,
            ctx: *ctx,
            kind: BranchTargetKind::Stub(None),
        });
        branch.shape = BranchShape::Next0;
        branch.start_addr = Some(here);
        branch.end_addr = Some(here);
    }
}

/// End the current block with a jump to a deeper-chained version of the
/// same location, so compilation resumes there with runtime values in
/// hand. The chain depth bounds how often one location can retry.
pub fn defer_compilation(
    jit: &mut Jit,
    vm: &Vm,
    block: BlockRef,
    blockid: BlockId,
    cur_ctx: &Context,
) -> Result<(), ()> {
    assert!(cur_ctx.chain_depth < MAX_CHAIN_DEPTH, "chain depth exhausted");

    let mut next_ctx = *cur_ctx;
    next_ctx.chain_depth += 1;

    let branchref = make_branch_entry(jit, block, BranchGenFn::JumpToTarget0);
    let dst = get_branch_target(jit, vm, blockid, &next_ctx, branchref, 0).ok_or(())?;

    let start = jit.cb.get_write_ptr();
    BranchGenFn::JumpToTarget0.call(&mut jit.cb, BranchShape::Default, Some(dst), None);
    let end = jit.cb.get_write_ptr();

    let branch = jit.branch_mut(branchref);
    branch.start_addr = Some(start);
    branch.end_addr = Some(end);

    if jit.options.trace_jit {
        eprintln!(
            "jit: deferred seq={} idx={} depth={}",
            blockid.seq, blockid.idx, next_ctx.chain_depth
        );
    }
    Ok(())
}

/// Rewrite a branch's bytes in place for its current shape and target
/// addresses. Skipped silently when the branch lies in frozen code.
/// Cursor rule: the cursor is restored afterwards unless the branch sat
/// at the very end of written content, in which case the new (possibly
/// shrunk) end becomes the cursor.
fn write_branch(jit: &mut Jit, branchref: BranchRef) {
    let (gen_fn, shape, start, old_end, dst0, dst1) = {
        let branch = jit.branch(branchref);
        let Some(start) = branch.start_addr else {
            return;
        };
        let dst0 = branch.targets[0].as_ref().and_then(|t| t.address(jit));
        let dst1 = branch.targets[1].as_ref().and_then(|t| t.address(jit));
        (branch.gen_fn, branch.shape, start, branch.end_addr, dst0, dst1)
    };

    if start < jit.frozen_ptr() {
        return;
    }

    let old_pos = jit.cb.get_write_pos();
    let old_end_pos = old_end.map(|end| jit.cb.ptr_offset(end));

    jit.cb.set_write_ptr(start);
    gen_fn.call(&mut jit.cb, shape, dst0, dst1);
    let new_end = jit.cb.get_write_ptr();
    let new_end_pos = jit.cb.get_write_pos();

    jit.branch_mut(branchref).end_addr = Some(new_end);

    if old_end_pos != Some(old_pos) {
        jit.cb.set_pos(old_pos);
    } else {
        // Branch at the very end of written content: the shrunk end is
        // the new end of content, old trailing bytes are orphaned
        jit.cb.set_pos(new_end_pos);
    }
}

/// Re-emit a branch after target resolution or a shape change. After
/// initial placement a branch may only shrink or stay the same size.
pub fn regenerate_branch(jit: &mut Jit, branchref: BranchRef) {
    let old_end = jit.branch(branchref).end_addr;
    write_branch(jit, branchref);
    let new_end = jit.branch(branchref).end_addr;

    if let (Some(old_end), Some(new_end)) = (old_end, new_end) {
        assert!(new_end <= old_end, "regenerated branch must not grow");
    }
}

/// Runtime re-entry point behind branch stubs: compile (or look up) the
/// requested target, patch the branch, and return the address to jump to.
pub fn branch_stub_hit_body(
    jv: &mut JitVm,
    branchref: BranchRef,
    target_idx: usize,
    ec: *mut ExecState,
) -> *const u8 {
    let jit = &mut jv.jit;
    let vm = &mut jv.vm;
    let stub_exit = jit.stub_exit;

    // The branch may have been freed by an invalidation between the stub
    // being reached and the lock being acquired
    if jit.branches.get(branchref.0).is_none() {
        return stub_exit.raw_ptr();
    }

    let target = match jit.branch(branchref).targets[target_idx] {
        Some(target) => target,
        None => return stub_exit.raw_ptr(),
    };

    if jit.options.trace_jit {
        eprintln!(
            "jit: stub hit branch={} target={} seq={} idx={}",
            branchref.0, target_idx, target.id.seq, target.id.idx
        );
    }

    // Reconcile the interpreter state: generated code runs ahead of the
    // sp field, and compilation below may need accurate pc/sp
    let original_sp = unsafe { (*ec).sp };
    unsafe {
        (*ec).sp = original_sp.offset(target.ctx.sp_offset as isize);
        (*ec).pc = target.id.idx as u64;
    }

    // Already resolved by an earlier hit through the same stub
    if let BranchTargetKind::Block(blockref) = target.kind {
        let addr = jit.block(blockref).start_addr;
        unsafe { (*ec).sp = original_sp };
        return addr.raw_ptr();
    }

    let mut blockref = find_block_version(jit, vm, target.id, &target.ctx);

    // If the new version must be compiled and the branch sits at the end
    // of written code, shrink the branch to its fallthrough form first so
    // the new block lands contiguously in the stub jump's space
    let mut reshaped = false;
    let mut old_shape = BranchShape::Default;
    if blockref.is_none() {
        let adjacent = {
            let branch = jit.branch(branchref);
            branch.end_addr == Some(jit.cb.get_write_ptr())
                && branch.start_addr.is_some_and(|s| s >= jit.frozen_ptr())
        };
        if adjacent {
            old_shape = jit.branch(branchref).shape;
            jit.branch_mut(branchref).shape = if target_idx == 0 {
                BranchShape::Next0
            } else {
                BranchShape::Next1
            };
            // Leaves the cursor at the shrunk end, where the block goes
            write_branch(jit, branchref);
            reshaped = true;
        }

        blockref = gen_block_version(jit, vm, target.id, &target.ctx, Some(ec));

        if blockref.is_none() && reshaped {
            // Restore the previous shape and bytes before giving up
            jit.branch_mut(branchref).shape = old_shape;
            write_branch(jit, branchref);
        }
    }

    let dst = match blockref {
        Some(blockref) => {
            let addr = jit.block(blockref).start_addr;
            if let Some(target) = jit.branch_mut(branchref).targets[target_idx].as_mut() {
                target.kind = BranchTargetKind::Block(blockref);
            }
            jit.block_mut(blockref).incoming.push(branchref);
            regenerate_branch(jit, branchref);

            // Generated code expects the sp field untouched on return
            unsafe { (*ec).sp = original_sp };
            addr
        }
        // Compilation failed or was declined: bail to the interpreter at
        // the pc/sp reconciled above, which is exactly the stub exit's
        // contract
        None => stub_exit,
    };

    jit.cb.mark_all_executable();
    jit.ocb.unwrap().mark_all_executable();

    dst.raw_ptr()
}

/// C-callable stub hit entry, invoked from the trampoline with the
/// branch id, target index and execution context in the first three
/// argument registers.
pub extern "sysv64" fn branch_stub_hit_c(
    branch_id: u64,
    target_idx: u64,
    ec: *mut ExecState,
) -> *const u8 {
    let mut guard = lock_jit_vm();
    branch_stub_hit_body(
        &mut guard,
        BranchRef(branch_id as u32),
        target_idx as usize,
        ec,
    )
}

//===========================================================================
// Invalidation

/// Record that a block depends on a named runtime assumption
pub fn assume_stable(jit: &mut Jit, blockref: BlockRef, assumption: &str) {
    let deps = jit.assumptions.entry(assumption.to_owned()).or_default();
    if !deps.contains(&blockref) {
        deps.push(blockref);
    }
}

/// A named assumption became false: invalidate every dependent block
pub fn invalidate_assumption(jv: &mut JitVm, assumption: &str) {
    let deps = jv.jit.assumptions.remove(assumption).unwrap_or_default();
    for blockref in deps {
        // A block may already be gone via another assumption
        if jv.jit.blocks.get(blockref.0).is_some() {
            invalidate_block_version(&mut jv.jit, &mut jv.vm, blockref);
        }
    }
}

/// Tear down one compiled block: unregister it, redirect its entry to the
/// recorded exit, re-stub every incoming branch, and free it. Callers
/// hold the global lock structurally (`&mut JitVm` reaches here).
pub fn invalidate_block_version(jit: &mut Jit, vm: &mut Vm, blockref: BlockRef) {
    let (blockid, start_addr, end_addr, entry_exit, incoming) = {
        let block = jit.block(blockref);
        (
            block.blockid,
            block.start_addr,
            block.end_addr,
            block.entry_exit,
            block.incoming.clone(),
        )
    };

    if jit.options.trace_jit {
        eprintln!(
            "jit: invalidate seq={} idx={} incoming={}",
            blockid.seq,
            blockid.idx,
            incoming.len()
        );
    }

    remove_block_version(jit, vm, blockref);

    // Patch the block entry to jump to its exit, so anything that still
    // reaches the old code bails to the interpreter cleanly
    if let Some(entry_exit) = entry_exit {
        if start_addr >= jit.frozen_ptr() && start_addr != entry_exit {
            let cur_pos = jit.cb.get_write_pos();
            jit.cb.set_write_ptr(start_addr);
            jmp_ptr(&mut jit.cb, entry_exit);
            if let Some(end_addr) = end_addr {
                assert!(
                    jit.cb.get_write_ptr() <= end_addr,
                    "redirect jump ran past the end of the invalidated block"
                );
            }
            jit.cb.set_pos(cur_pos);
        }
    }

    // Every incoming branch gets its target slot unresolved and, where
    // patchable, a fresh stub
    for branchref in incoming {
        if jit.branches.get(branchref.0).is_none() {
            continue;
        }

        let Some(target_idx) = jit.branch(branchref).targets.iter().position(|t| {
            matches!(t, Some(target) if target.kind == BranchTargetKind::Block(blockref))
        }) else {
            continue;
        };

        // Point the slot back at the old block start: the redirect jump
        // written above makes that address safe to reach meanwhile
        if let Some(target) = jit.branch_mut(branchref).targets[target_idx].as_mut() {
            target.kind = BranchTargetKind::Stub(Some(start_addr));
        }

        // Frozen branches stay as they are; the redirect covers them
        let branch_start = jit.branch(branchref).start_addr;
        if branch_start.is_none_or(|s| s < jit.frozen_ptr()) {
            continue;
        }

        // Fresh stub so the next execution recompiles; if even stub
        // space is exhausted, fall back to the block's exit
        let new_addr = gen_branch_stub(jit, branchref, target_idx).or(entry_exit);
        if let Some(target) = jit.branch_mut(branchref).targets[target_idx].as_mut() {
            target.kind = BranchTargetKind::Stub(new_addr);
        }

        // If the branch assumed this block was adjacent, that no longer
        // holds. Re-encoding may grow into the dead block's space, which
        // is the one place a branch is allowed to grow.
        let assumed_next = (target_idx == 0 && jit.branch(branchref).shape == BranchShape::Next0)
            || (target_idx == 1 && jit.branch(branchref).shape == BranchShape::Next1);
        if assumed_next {
            jit.branch_mut(branchref).shape = BranchShape::Default;
        }
        write_branch(jit, branchref);
        if assumed_next {
            if let (Some(branch_end), Some(block_end)) =
                (jit.branch(branchref).end_addr, end_addr)
            {
                assert!(
                    branch_end <= block_end,
                    "rewritten branch ran past the end of the invalidated block"
                );
            }
        }
    }

    // Drop the fast entry so the interpreter resumes interpreting
    if blockid.idx == 0 {
        vm.seqs[blockid.seq as usize].payload.jit_entry = None;
    }

    // Remove the block from assumption dependency lists
    for deps in jit.assumptions.values_mut() {
        deps.retain(|&b| b != blockref);
    }

    free_block(jit, blockref);

    jit.cb.mark_all_executable();
    jit.ocb.unwrap().mark_all_executable();
}

/// Free a block and the branches it owns, unlinking it from the graph
pub(crate) fn free_block(jit: &mut Jit, blockref: BlockRef) {
    let Some(block) = jit.blocks.free(blockref.0) else {
        return;
    };

    for branchref in block.outgoing {
        let Some(branch) = jit.branches.free(branchref.0) else {
            continue;
        };
        // Detach the freed branch from its targets' incoming lists
        for target in branch.targets.into_iter().flatten() {
            if let BranchTargetKind::Block(target_block) = target.kind {
                if let Some(target_block) = jit.blocks.get_mut(target_block.0) {
                    target_block.incoming.retain(|&b| b != branchref);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Type;
    use crate::runtime::{Insn, Value, QNIL};

    fn dummy_jv(options: Options) -> JitVm {
        JitVm::new_dummy(options)
    }

    fn leave_seq(jv: &mut JitVm) -> u32 {
        jv.vm.def_seq(vec![Insn::Leave], 0)
    }

    fn ctx_with_top(ty: Type, opts: &Options) -> Context {
        let mut ctx = Context::default();
        ctx.stack_push(opts, ty);
        ctx
    }

    #[test]
    fn test_version_cap_enforced() {
        let opts = Options {
            max_versions: 3,
            ..Options::default()
        };
        let mut jv = dummy_jv(opts.clone());
        let seq = leave_seq(&mut jv);
        let blockid = BlockId { seq, idx: 0 };

        // Incompatible contexts force new versions
        for ty in [Type::Fixnum, Type::Str, Type::Nil] {
            let ctx = ctx_with_top(ty, &opts);
            let blockref = gen_block_version(&mut jv.jit, &mut jv.vm, blockid, &ctx, None);
            assert!(blockref.is_some());
        }

        let versions = version_list(&jv.vm, blockid);
        assert_eq!(versions.len(), 3);

        // The version that reached the cap is fully generalized, so any
        // further context finds a home instead of spawning more versions
        let last = *versions.last().unwrap();
        assert_eq!(jv.jit.block(last).ctx, Context::generic(1, 1));

        let unrelated = ctx_with_top(Type::True, &opts);
        assert_eq!(
            find_block_version(&jv.jit, &jv.vm, blockid, &unrelated),
            Some(last)
        );
    }

    #[test]
    fn test_find_block_version_asymmetry() {
        let opts = Options::default();
        let mut jv = dummy_jv(opts.clone());
        let seq = leave_seq(&mut jv);
        let blockid = BlockId { seq, idx: 0 };

        // Store a version compiled for an unknown-typed stack top
        let general = ctx_with_top(Type::Unknown, &opts);
        let stored =
            gen_block_version(&mut jv.jit, &mut jv.vm, blockid, &general, None).unwrap();

        // A fixnum-typed query can use it
        let fixnum = ctx_with_top(Type::Fixnum, &opts);
        assert_eq!(
            find_block_version(&jv.jit, &jv.vm, blockid, &fixnum),
            Some(stored)
        );

        // The reverse direction must not match
        let seq2 = leave_seq(&mut jv);
        let blockid2 = BlockId { seq: seq2, idx: 0 };
        gen_block_version(&mut jv.jit, &mut jv.vm, blockid2, &fixnum, None).unwrap();
        assert_eq!(find_block_version(&jv.jit, &jv.vm, blockid2, &general), None);
    }

    #[test]
    fn test_greedy_versioning_declines_imperfect_match() {
        let opts = Options {
            greedy_versioning: true,
            ..Options::default()
        };
        let mut jv = dummy_jv(opts.clone());
        let seq = leave_seq(&mut jv);
        let blockid = BlockId { seq, idx: 0 };

        let general = ctx_with_top(Type::Unknown, &opts);
        let stored =
            gen_block_version(&mut jv.jit, &mut jv.vm, blockid, &general, None).unwrap();

        // An imperfect match is declined while below the cap
        let fixnum = ctx_with_top(Type::Fixnum, &opts);
        assert_eq!(find_block_version(&jv.jit, &jv.vm, blockid, &fixnum), None);

        // An exact match is still accepted
        assert_eq!(
            find_block_version(&jv.jit, &jv.vm, blockid, &general),
            Some(stored)
        );
    }

    #[test]
    fn test_branch_encodings_never_grow_across_shapes() {
        for gen_fn in [BranchGenFn::BranchUnless, BranchGenFn::JumpToTarget0] {
            let mut cb = CodeBlock::new_dummy(4096);
            let t0 = cb.get_ptr(512);
            let t1 = cb.get_ptr(1024);

            gen_fn.call(&mut cb, BranchShape::Default, Some(t0), Some(t1));
            let default_len = cb.get_write_pos();

            let mut cb = CodeBlock::new_dummy(4096);
            let shape = match gen_fn {
                BranchGenFn::BranchUnless => BranchShape::Next1,
                BranchGenFn::JumpToTarget0 => BranchShape::Next0,
            };
            gen_fn.call(&mut cb, shape, Some(t0), Some(t1));
            assert!(cb.get_write_pos() <= default_len);
        }
    }

    #[test]
    fn test_stub_hit_compiles_and_is_idempotent() {
        let opts = Options::default();
        let mut jv = dummy_jv(opts);
        // The operand types are unknown at compile time, so the Add defers
        let seq = jv.vm.def_seq(
            vec![
                Insn::GetLocal(0),
                Insn::GetLocal(1),
                Insn::Add,
                Insn::Leave,
            ],
            2,
        );
        let blockid = BlockId { seq, idx: 0 };

        // The first block ends at the Add with a stubbed branch
        let first =
            gen_block_version(&mut jv.jit, &mut jv.vm, blockid, &Context::default(), None)
                .unwrap();
        let &branchref = jv.jit.block(first).outgoing.last().unwrap();
        assert!(matches!(
            jv.jit.branch(branchref).targets[0].unwrap().kind,
            BranchTargetKind::Stub(Some(_))
        ));

        // Fake the runtime state the stub would see: operands written by
        // generated code, sp field still at its entry value
        let mut frame = Frame::new(seq, 2, QNIL);
        unsafe {
            frame.state.locals.write(Value::fixnum(40).0);
            frame.state.locals.add(1).write(Value::fixnum(2).0);
            frame.state.sp.write(Value::fixnum(40).0);
            frame.state.sp.add(1).write(Value::fixnum(2).0);
        }

        let dst = branch_stub_hit_body(&mut jv, branchref, 0, &mut frame.state);
        assert!(dst != jv.jit.stub_exit.raw_ptr());

        // The branch resolved to a real block
        let resolved = match jv.jit.branch(branchref).targets[0].unwrap().kind {
            BranchTargetKind::Block(blockref) => blockref,
            other => panic!("expected resolved target, got {:?}", other),
        };
        assert_eq!(dst, jv.jit.block(resolved).start_addr.raw_ptr());

        // The sp field is back at its entry value
        assert_eq!(frame.stack_depth(), 0);

        // A second hit returns the same address without compiling again
        let blocks_before = jv.vm.seqs[seq as usize].payload.version_map[2].len();
        let dst2 = branch_stub_hit_body(&mut jv, branchref, 0, &mut frame.state);
        assert_eq!(dst, dst2);
        assert_eq!(
            jv.vm.seqs[seq as usize].payload.version_map[2].len(),
            blocks_before
        );
    }

    #[test]
    fn test_invalidation_safety() {
        let opts = Options::default();
        let mut jv = dummy_jv(opts);
        let seq = jv.vm.def_seq(
            vec![
                Insn::GetLocal(0),
                Insn::GetLocal(1),
                Insn::Add,
                Insn::Leave,
            ],
            2,
        );
        let blockid = BlockId { seq, idx: 0 };

        gen_block_version(&mut jv.jit, &mut jv.vm, blockid, &Context::default(), None).unwrap();
        let mut frame = Frame::new(seq, 2, QNIL);
        unsafe {
            frame.state.locals.write(Value::fixnum(1).0);
            frame.state.locals.add(1).write(Value::fixnum(2).0);
            frame.state.sp.write(Value::fixnum(1).0);
            frame.state.sp.add(1).write(Value::fixnum(2).0);
        }

        let first = version_list(&jv.vm, blockid)[0];
        let &branchref = jv.jit.block(first).outgoing.last().unwrap();
        branch_stub_hit_body(&mut jv, branchref, 0, &mut frame.state);

        let target = match jv.jit.branch(branchref).targets[0].unwrap().kind {
            BranchTargetKind::Block(blockref) => blockref,
            other => panic!("expected resolved target, got {:?}", other),
        };
        let target_id = jv.jit.block(target).blockid;
        let target_ctx = jv.jit.block(target).ctx;

        invalidate_block_version(&mut jv.jit, &mut jv.vm, target);

        // Gone from the version table and the arena
        assert!(!version_list(&jv.vm, target_id).contains(&target));
        assert!(jv.jit.blocks.get(target.0).is_none());

        // The incoming branch points at a stub or the old (redirecting)
        // start, never at freed storage
        match jv.jit.branch(branchref).targets[0].unwrap().kind {
            BranchTargetKind::Stub(Some(addr)) => {
                let cb_has = jv.jit.cb.contains_ptr(addr);
                let ocb_has = jv.jit.ocb.unwrap().contains_ptr(addr);
                assert!(cb_has || ocb_has);
            }
            other => panic!("expected stubbed target, got {:?}", other),
        }

        // The former (location, ctx) no longer resolves to the freed block
        assert_eq!(
            find_block_version(&jv.jit, &jv.vm, target_id, &target_ctx),
            None
        );

        // A fresh stub hit compiles a replacement
        let dst = branch_stub_hit_body(&mut jv, branchref, 0, &mut frame.state);
        assert!(dst != jv.jit.stub_exit.raw_ptr());
        assert!(matches!(
            jv.jit.branch(branchref).targets[0].unwrap().kind,
            BranchTargetKind::Block(_)
        ));
    }

    #[test]
    fn test_assumption_invalidation() {
        let opts = Options::default();
        let mut jv = dummy_jv(opts);
        let seq = jv.vm.def_seq(
            vec![
                Insn::PutObject(Value::fixnum(1)),
                Insn::PutObject(Value::fixnum(2)),
                Insn::Add,
                Insn::Leave,
            ],
            0,
        );
        let blockid = BlockId { seq, idx: 0 };

        // The operand types are known fixnums, so the add compiles without
        // deferring and registers its assumption directly
        gen_block_version(&mut jv.jit, &mut jv.vm, blockid, &Context::default(), None).unwrap();
        assert!(jv.jit.assumptions.contains_key("fixnum_plus"));

        invalidate_assumption(&mut jv, "fixnum_plus");
        assert!(!jv.jit.assumptions.contains_key("fixnum_plus"));
    }

    #[test]
    fn test_batch_rollback_on_capacity_exhaustion() {
        let opts = Options::default();
        let mut jv = dummy_jv(opts);
        let seq = jv.vm.def_seq(
            vec![
                Insn::PutObject(Value::fixnum(1)),
                Insn::PutObject(Value::fixnum(2)),
                Insn::Add,
                Insn::Leave,
            ],
            0,
        );
        let blockid = BlockId { seq, idx: 0 };

        // Exhaust the inline block so compilation must fail
        let size = jv.jit.cb.get_mem_size();
        jv.jit.cb.set_pos(size - 2);

        let cb_pos = jv.jit.cb.get_write_pos();
        let result =
            gen_block_version(&mut jv.jit, &mut jv.vm, blockid, &Context::default(), None);
        assert!(result.is_none());

        // Nothing registered, cursor restored
        assert!(version_list(&jv.vm, blockid).is_empty());
        assert_eq!(jv.jit.cb.get_write_pos(), cb_pos);
    }
}
