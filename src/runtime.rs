//! The interpreter the JIT collaborates with.
//!
//! This is a deliberately small stack VM: tagged 64-bit values, a handful
//! of instructions, and an execution state laid out for direct access from
//! generated machine code. Each instruction sequence carries a JIT payload
//! holding the per-instruction version tables and the fast entry point.

use std::mem::offset_of;

use crate::asm::CodePtr;
use crate::core::BlockRef;

/// A tagged 64-bit value.
///
/// Encoding:
/// - `0b...1`   fixnum, value in the upper 63 bits
/// - `0x00`     false
/// - `0x04`     nil
/// - `0x0C`     true
/// - `0x14`     undef, never visible to programs; generated code returns it
///   to request a side exit
/// - otherwise  8-byte-aligned pointer to a [`HeapObj`]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Value(pub u64);

pub const QFALSE: Value = Value(0x00);
pub const QNIL: Value = Value(0x04);
pub const QTRUE: Value = Value(0x0C);
pub const QUNDEF: Value = Value(0x14);

impl Value {
    pub fn fixnum(n: i64) -> Value {
        // The value must survive the tag shift
        assert!(n >= i64::MIN >> 1 && n <= i64::MAX >> 1);
        Value(((n << 1) as u64) | 1)
    }

    pub fn fixnum_p(&self) -> bool {
        self.0 & 1 == 1
    }

    pub fn as_fixnum(&self) -> i64 {
        assert!(self.fixnum_p());
        (self.0 as i64) >> 1
    }

    /// Whether this is an immediate (non-heap) value
    pub fn special_const_p(&self) -> bool {
        self.0 == 0 || self.0 & 0x7 != 0
    }

    pub fn heap_object_p(&self) -> bool {
        !self.special_const_p()
    }

    /// Everything is truthy except nil and false.
    /// Equivalent to `(v & !0x04) != 0`, which is what generated code tests.
    pub fn test(&self) -> bool {
        self.0 & !0x04u64 != 0
    }

    pub fn as_heap_ptr(&self) -> *const HeapObj {
        assert!(self.heap_object_p());
        self.0 as *const HeapObj
    }
}

/// A heap-allocated object. The VM owns all heap objects; their addresses
/// are stable for the life of the VM.
#[derive(Debug, PartialEq)]
pub enum HeapObj {
    Array(Vec<Value>),
    Str(String),
}

/// One bytecode instruction. Every instruction occupies exactly one slot,
/// so instruction indices and program counters coincide.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Insn {
    PutNil,
    PutObject(Value),
    PutSelf,
    GetLocal(u8),
    SetLocal(u8),
    Pop,
    Add,
    Jump(u16),
    BranchUnless(u16),
    Leave,
}

/// JIT-side state attached to an instruction sequence.
#[derive(Default)]
pub struct SeqPayload {
    /// Compiled block versions, indexed by instruction offset
    pub version_map: Vec<Vec<BlockRef>>,

    /// Fast entry point for calls into this sequence from the top.
    /// Set on first successful entry compile, cleared by invalidation.
    pub jit_entry: Option<CodePtr>,

    /// Number of times this sequence has been entered
    pub call_count: u64,
}

/// An instruction sequence plus its JIT payload.
pub struct InsnSeq {
    pub insns: Vec<Insn>,
    pub num_locals: usize,
    pub payload: SeqPayload,
}

impl InsnSeq {
    pub fn new(insns: Vec<Insn>, num_locals: usize) -> Self {
        let len = insns.len();
        InsnSeq {
            insns,
            num_locals,
            payload: SeqPayload {
                version_map: vec![Vec::new(); len],
                ..Default::default()
            },
        }
    }
}

/// Execution state shared between the interpreter and generated code.
///
/// The layout is part of the machine-code contract: generated code reads
/// and writes these fields by fixed offset. `sp` always points one past
/// the top of the value stack.
#[repr(C)]
pub struct ExecState {
    /// Current instruction index
    pub pc: u64,

    /// Interpreter's notion of the stack top. Generated code runs ahead of
    /// this field and reconciles it on every transition back.
    pub sp: *mut u64,

    /// Base of the local variable area
    pub locals: *mut u64,

    /// The `self` value of the running frame
    pub self_val: u64,

    /// One past the end of the value stack buffer. Only the interpreter
    /// checks it; generated code relies on the stack fitting, which the
    /// compiler bounds by refusing over-deep contexts.
    pub stack_end: *mut u64,

    /// Which instruction sequence is running
    pub seq: u32,
}

pub const EC_PC_OFFSET: i32 = offset_of!(ExecState, pc) as i32;
pub const EC_SP_OFFSET: i32 = offset_of!(ExecState, sp) as i32;
pub const EC_LOCALS_OFFSET: i32 = offset_of!(ExecState, locals) as i32;
pub const EC_SELF_OFFSET: i32 = offset_of!(ExecState, self_val) as i32;

/// Value stack capacity per frame. Programs this VM runs are tiny; the
/// interpreter checks for overflow, generated code relies on the check
/// having passed at compile time.
pub const STACK_CAPACITY: usize = 64;

/// A call frame: the buffers plus the [`ExecState`] pointing into them.
pub struct Frame {
    // Boxed so the addresses in `state` stay put if the frame moves
    stack: Box<[u64; STACK_CAPACITY]>,
    locals: Box<[u64]>,
    pub state: ExecState,
}

impl Frame {
    pub fn new(seq: u32, num_locals: usize, self_val: Value) -> Frame {
        let mut stack = Box::new([0u64; STACK_CAPACITY]);
        let mut locals = vec![QNIL.0; num_locals.max(1)].into_boxed_slice();

        let stack_base = stack.as_mut_ptr();
        let state = ExecState {
            pc: 0,
            sp: stack_base,
            locals: locals.as_mut_ptr(),
            self_val: self_val.0,
            stack_end: unsafe { stack_base.add(STACK_CAPACITY) },
            seq,
        };

        Frame {
            stack,
            locals,
            state,
        }
    }

    /// Number of values currently on the stack
    pub fn stack_depth(&self) -> usize {
        (self.state.sp as usize - self.stack.as_ptr() as usize) / 8
    }

    pub fn local(&self, idx: usize) -> Value {
        Value(self.locals[idx])
    }
}

/// Errors surfaced by the interpreter. A JIT-compiled path never produces
/// one of these directly: generated code side-exits first and the
/// interpreter rediscovers the condition.
#[derive(Debug, PartialEq)]
pub enum RuntimeError {
    /// An operand had the wrong type for an operation
    TypeError { insn_idx: usize },
    /// The value stack overflowed
    StackOverflow,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::TypeError { insn_idx } => {
                write!(f, "type error at instruction {}", insn_idx)
            }
            RuntimeError::StackOverflow => write!(f, "value stack overflow"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Write-barrier log standing in for a real collector.
///
/// Registering a compiled block notifies the collector of every object
/// reference the block's code embeds; this log records those notifications
/// so the contract can be observed and tested.
#[derive(Default)]
pub struct GcLog {
    barriers: Vec<(usize, u64)>,
}

impl GcLog {
    /// Record that generated code at `code_offset` embeds `value`
    pub fn write_barrier(&mut self, code_offset: usize, value: Value) {
        self.barriers.push((code_offset, value.0));
    }

    pub fn barrier_count(&self) -> usize {
        self.barriers.len()
    }

    /// All values currently reachable from generated code
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.barriers.iter().map(|&(_, raw)| Value(raw))
    }
}

/// The virtual machine: instruction sequences, heap objects, and the
/// write-barrier log.
#[derive(Default)]
pub struct Vm {
    pub seqs: Vec<InsnSeq>,
    pub gc: GcLog,
    heap: Vec<Box<HeapObj>>,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::default()
    }

    /// Register an instruction sequence, returning its id
    pub fn def_seq(&mut self, insns: Vec<Insn>, num_locals: usize) -> u32 {
        self.seqs.push(InsnSeq::new(insns, num_locals));
        (self.seqs.len() - 1) as u32
    }

    /// Allocate a heap object and return its tagged value.
    /// The address is stable for the life of the VM.
    pub fn alloc(&mut self, obj: HeapObj) -> Value {
        self.heap.push(Box::new(obj));
        let ptr = self.heap.last().unwrap().as_ref() as *const HeapObj;
        assert!(ptr as u64 & 0x7 == 0);
        Value(ptr as u64)
    }

    /// Run the interpreter from the current state of `ec` until the frame
    /// leaves. Resumable: side exits from generated code land here with
    /// `ec` describing the exact interpreter state to continue from.
    pub fn interp(&self, ec: &mut ExecState) -> Result<Value, RuntimeError> {
        let seq = &self.seqs[ec.seq as usize];

        loop {
            let insn_idx = ec.pc as usize;
            let insn = seq.insns[insn_idx];

            match insn {
                Insn::PutNil => {
                    push(ec, QNIL)?;
                    ec.pc += 1;
                }
                Insn::PutObject(val) => {
                    push(ec, val)?;
                    ec.pc += 1;
                }
                Insn::PutSelf => {
                    push(ec, Value(ec.self_val))?;
                    ec.pc += 1;
                }
                Insn::GetLocal(idx) => {
                    let val = unsafe { *ec.locals.add(idx as usize) };
                    push(ec, Value(val))?;
                    ec.pc += 1;
                }
                Insn::SetLocal(idx) => {
                    let val = pop(ec);
                    unsafe { *ec.locals.add(idx as usize) = val.0 };
                    ec.pc += 1;
                }
                Insn::Pop => {
                    pop(ec);
                    ec.pc += 1;
                }
                Insn::Add => {
                    let rhs = pop(ec);
                    let lhs = pop(ec);
                    if !lhs.fixnum_p() || !rhs.fixnum_p() {
                        // Restore the operands so the state stays consistent
                        push(ec, lhs)?;
                        push(ec, rhs)?;
                        return Err(RuntimeError::TypeError { insn_idx });
                    }
                    // Wrapping fixnum addition
                    let sum = lhs.as_fixnum().wrapping_add(rhs.as_fixnum());
                    push(ec, Value::fixnum(sum << 1 >> 1))?;
                    ec.pc += 1;
                }
                Insn::Jump(target) => {
                    ec.pc = target as u64;
                }
                Insn::BranchUnless(target) => {
                    let val = pop(ec);
                    if val.test() {
                        ec.pc += 1;
                    } else {
                        ec.pc = target as u64;
                    }
                }
                Insn::Leave => {
                    return Ok(pop(ec));
                }
            }
        }
    }
}

fn push(ec: &mut ExecState, val: Value) -> Result<(), RuntimeError> {
    if ec.sp == ec.stack_end {
        return Err(RuntimeError::StackOverflow);
    }
    // sp points into the Frame's buffer, so the arithmetic is sound
    unsafe {
        ec.sp.write(val.0);
        ec.sp = ec.sp.add(1);
    }
    Ok(())
}

fn pop(ec: &mut ExecState) -> Value {
    unsafe {
        ec.sp = ec.sp.sub(1);
        Value(ec.sp.read())
    }
}
