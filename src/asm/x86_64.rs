//! x86-64 instruction encoder.
//!
//! One function per mnemonic, writing directly into a [`CodeBlock`].
//! Operands carry their own bit width, and every prefix/ModRM/SIB decision
//! is derived from operand shape alone, so encoding is deterministic: the
//! same operands always produce the same bytes. Patching relies on this.

#![allow(dead_code)]

use crate::asm::*;

/// Signed immediate operand
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Imm {
    /// Size in bits
    pub num_bits: u8,

    /// The value of the immediate
    pub value: i64,
}

/// Unsigned immediate operand
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UImm {
    /// Size in bits
    pub num_bits: u8,

    /// The value of the immediate
    pub value: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegKind {
    Gp,
    Ip,
}

/// Register operand
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Reg {
    /// Size in bits
    pub num_bits: u8,

    /// Register kind
    pub reg_kind: RegKind,

    /// Register index number
    pub reg_no: u8,
}

/// Memory operand
#[derive(Clone, Copy, Debug)]
pub struct Mem {
    /// Size in bits
    pub num_bits: u8,

    /// Base register number
    pub base_reg_no: u8,

    /// Index register number
    pub idx_reg_no: Option<u8>,

    /// SIB scale exponent value (power of two, two bits)
    pub scale_exp: u8,

    /// Constant displacement from the base, not scaled
    pub disp: i32,
}

/// Instruction operand
#[derive(Clone, Copy, Debug)]
pub enum Opnd {
    /// Dummy operand
    None,

    /// Immediate value
    Imm(Imm),

    /// Unsigned immediate
    UImm(UImm),

    /// General-purpose register
    Reg(Reg),

    /// Memory location
    Mem(Mem),

    /// IP-relative memory location
    IPRel(i32),
}

impl Reg {
    pub fn with_num_bits(&self, num_bits: u8) -> Self {
        assert!(num_bits == 8 || num_bits == 16 || num_bits == 32 || num_bits == 64);
        Self {
            num_bits,
            reg_kind: self.reg_kind,
            reg_no: self.reg_no,
        }
    }
}

impl Opnd {
    fn rex_needed(&self) -> bool {
        match self {
            Opnd::None => false,
            Opnd::Imm(_) => false,
            Opnd::UImm(_) => false,
            // Byte access to SPL/BPL/SIL/DIL needs a REX prefix too
            Opnd::Reg(reg) => reg.reg_no > 7 || reg.num_bits == 8 && reg.reg_no >= 4,
            Opnd::Mem(mem) => mem.base_reg_no > 7 || (mem.idx_reg_no.unwrap_or(0) > 7),
            Opnd::IPRel(_) => false,
        }
    }

    // Check if an SIB byte is needed to encode this operand
    fn sib_needed(&self) -> bool {
        match self {
            Opnd::Mem(mem) => {
                mem.idx_reg_no.is_some()
                    || mem.base_reg_no == RSP_REG_NO
                    || mem.base_reg_no == R12_REG_NO
            }
            _ => false,
        }
    }

    fn disp_size(&self) -> u32 {
        match self {
            Opnd::IPRel(_) => 32,
            Opnd::Mem(mem) => {
                if mem.disp != 0 {
                    // Compute the required displacement size
                    let num_bits = imm_num_bits(mem.disp.into());
                    if num_bits > 32 {
                        panic!("displacement does not fit in 32 bits");
                    }

                    // x86 can only encode 8-bit and 32-bit displacements
                    if num_bits == 16 { 32 } else { 8 }
                } else if mem.base_reg_no == RBP_REG_NO || mem.base_reg_no == R13_REG_NO {
                    // RBP or R13 as the base always requires a displacement
                    8
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    pub fn num_bits(&self) -> u8 {
        match self {
            Opnd::Reg(reg) => reg.num_bits,
            Opnd::Imm(imm) => imm.num_bits,
            Opnd::UImm(uimm) => uimm.num_bits,
            Opnd::Mem(mem) => mem.num_bits,
            _ => unreachable!(),
        }
    }

    pub fn is_some(&self) -> bool {
        !matches!(self, Opnd::None)
    }
}

// Instruction pointer
pub const RIP: Opnd = Opnd::Reg(Reg { num_bits: 64, reg_kind: RegKind::Ip, reg_no: 5 });

// Register numbers with encoding quirks
const RAX_REG_NO: u8 = 0;
const RCX_REG_NO: u8 = 1;
const RSP_REG_NO: u8 = 4;
const RBP_REG_NO: u8 = 5;
const R12_REG_NO: u8 = 12;
const R13_REG_NO: u8 = 13;

const fn gp_reg(num_bits: u8, reg_no: u8) -> Reg {
    Reg { num_bits, reg_kind: RegKind::Gp, reg_no }
}

// 64-bit GP registers
pub const RAX_REG: Reg = gp_reg(64, RAX_REG_NO);
pub const RCX_REG: Reg = gp_reg(64, RCX_REG_NO);
pub const RDX_REG: Reg = gp_reg(64, 2);
pub const RBX_REG: Reg = gp_reg(64, 3);
pub const RSP_REG: Reg = gp_reg(64, RSP_REG_NO);
pub const RBP_REG: Reg = gp_reg(64, RBP_REG_NO);
pub const RSI_REG: Reg = gp_reg(64, 6);
pub const RDI_REG: Reg = gp_reg(64, 7);
pub const R8_REG: Reg = gp_reg(64, 8);
pub const R9_REG: Reg = gp_reg(64, 9);
pub const R10_REG: Reg = gp_reg(64, 10);
pub const R11_REG: Reg = gp_reg(64, 11);
pub const R12_REG: Reg = gp_reg(64, R12_REG_NO);
pub const R13_REG: Reg = gp_reg(64, R13_REG_NO);
pub const R14_REG: Reg = gp_reg(64, 14);
pub const R15_REG: Reg = gp_reg(64, 15);

pub const RAX: Opnd = Opnd::Reg(RAX_REG);
pub const RCX: Opnd = Opnd::Reg(RCX_REG);
pub const RDX: Opnd = Opnd::Reg(RDX_REG);
pub const RBX: Opnd = Opnd::Reg(RBX_REG);
pub const RSP: Opnd = Opnd::Reg(RSP_REG);
pub const RBP: Opnd = Opnd::Reg(RBP_REG);
pub const RSI: Opnd = Opnd::Reg(RSI_REG);
pub const RDI: Opnd = Opnd::Reg(RDI_REG);
pub const R8: Opnd = Opnd::Reg(R8_REG);
pub const R9: Opnd = Opnd::Reg(R9_REG);
pub const R10: Opnd = Opnd::Reg(R10_REG);
pub const R11: Opnd = Opnd::Reg(R11_REG);
pub const R12: Opnd = Opnd::Reg(R12_REG);
pub const R13: Opnd = Opnd::Reg(R13_REG);
pub const R14: Opnd = Opnd::Reg(R14_REG);
pub const R15: Opnd = Opnd::Reg(R15_REG);

// 32-bit GP registers
pub const EAX: Opnd = Opnd::Reg(gp_reg(32, 0));
pub const ECX: Opnd = Opnd::Reg(gp_reg(32, 1));
pub const EDX: Opnd = Opnd::Reg(gp_reg(32, 2));
pub const EBX: Opnd = Opnd::Reg(gp_reg(32, 3));
pub const ESP: Opnd = Opnd::Reg(gp_reg(32, 4));
pub const EBP: Opnd = Opnd::Reg(gp_reg(32, 5));
pub const ESI: Opnd = Opnd::Reg(gp_reg(32, 6));
pub const EDI: Opnd = Opnd::Reg(gp_reg(32, 7));
pub const R8D: Opnd = Opnd::Reg(gp_reg(32, 8));
pub const R9D: Opnd = Opnd::Reg(gp_reg(32, 9));
pub const R10D: Opnd = Opnd::Reg(gp_reg(32, 10));
pub const R11D: Opnd = Opnd::Reg(gp_reg(32, 11));
pub const R12D: Opnd = Opnd::Reg(gp_reg(32, 12));
pub const R13D: Opnd = Opnd::Reg(gp_reg(32, 13));
pub const R14D: Opnd = Opnd::Reg(gp_reg(32, 14));
pub const R15D: Opnd = Opnd::Reg(gp_reg(32, 15));

// 16-bit GP registers
pub const AX: Opnd = Opnd::Reg(gp_reg(16, 0));
pub const CX: Opnd = Opnd::Reg(gp_reg(16, 1));
pub const DX: Opnd = Opnd::Reg(gp_reg(16, 2));
pub const BX: Opnd = Opnd::Reg(gp_reg(16, 3));
pub const BP: Opnd = Opnd::Reg(gp_reg(16, 5));
pub const SI: Opnd = Opnd::Reg(gp_reg(16, 6));
pub const DI: Opnd = Opnd::Reg(gp_reg(16, 7));
pub const R8W: Opnd = Opnd::Reg(gp_reg(16, 8));
pub const R9W: Opnd = Opnd::Reg(gp_reg(16, 9));
pub const R10W: Opnd = Opnd::Reg(gp_reg(16, 10));
pub const R11W: Opnd = Opnd::Reg(gp_reg(16, 11));
pub const R12W: Opnd = Opnd::Reg(gp_reg(16, 12));
pub const R13W: Opnd = Opnd::Reg(gp_reg(16, 13));
pub const R14W: Opnd = Opnd::Reg(gp_reg(16, 14));
pub const R15W: Opnd = Opnd::Reg(gp_reg(16, 15));

// 8-bit GP registers
pub const AL: Opnd = Opnd::Reg(gp_reg(8, 0));
pub const CL: Opnd = Opnd::Reg(gp_reg(8, 1));
pub const DL: Opnd = Opnd::Reg(gp_reg(8, 2));
pub const BL: Opnd = Opnd::Reg(gp_reg(8, 3));
pub const SPL: Opnd = Opnd::Reg(gp_reg(8, 4));
pub const BPL: Opnd = Opnd::Reg(gp_reg(8, 5));
pub const SIL: Opnd = Opnd::Reg(gp_reg(8, 6));
pub const DIL: Opnd = Opnd::Reg(gp_reg(8, 7));
pub const R8B: Opnd = Opnd::Reg(gp_reg(8, 8));
pub const R9B: Opnd = Opnd::Reg(gp_reg(8, 9));
pub const R10B: Opnd = Opnd::Reg(gp_reg(8, 10));
pub const R11B: Opnd = Opnd::Reg(gp_reg(8, 11));
pub const R12B: Opnd = Opnd::Reg(gp_reg(8, 12));
pub const R13B: Opnd = Opnd::Reg(gp_reg(8, 13));
pub const R14B: Opnd = Opnd::Reg(gp_reg(8, 14));
pub const R15B: Opnd = Opnd::Reg(gp_reg(8, 15));

//===========================================================================

/// Compute the number of bits needed to encode a signed value
pub fn imm_num_bits(imm: i64) -> u8 {
    // Compute the smallest size this immediate fits in
    if imm >= i8::MIN.into() && imm <= i8::MAX.into() {
        return 8;
    }
    if imm >= i16::MIN.into() && imm <= i16::MAX.into() {
        return 16;
    }
    if imm >= i32::MIN.into() && imm <= i32::MAX.into() {
        return 32;
    }

    64
}

/// Compute the number of bits needed to encode an unsigned value
pub fn uimm_num_bits(uimm: u64) -> u8 {
    // Compute the smallest size this immediate fits in
    if uimm <= u8::MAX.into() {
        return 8;
    }
    if uimm <= u16::MAX.into() {
        return 16;
    }
    if uimm <= u32::MAX.into() {
        return 32;
    }

    64
}

/// Shorthand for a memory operand with a base register and displacement
pub fn mem_opnd(num_bits: u8, base_reg: Opnd, disp: i32) -> Opnd {
    let base_reg = match base_reg {
        Opnd::Reg(reg) => reg,
        _ => unreachable!(),
    };

    if base_reg.reg_kind == RegKind::Ip {
        Opnd::IPRel(disp)
    } else {
        Opnd::Mem(Mem {
            num_bits,
            base_reg_no: base_reg.reg_no,
            idx_reg_no: None,
            scale_exp: 0,
            disp,
        })
    }
}

/// Memory operand with SIB (Scale Index Base) indexing
pub fn mem_opnd_sib(num_bits: u8, base_opnd: Opnd, index_opnd: Opnd, scale: i32, disp: i32) -> Opnd {
    if let (Opnd::Reg(base_reg), Opnd::Reg(index_reg)) = (base_opnd, index_opnd) {
        let scale_exp: u8 = match scale {
            8 => 3,
            4 => 2,
            2 => 1,
            1 => 0,
            _ => unreachable!(),
        };

        Opnd::Mem(Mem {
            num_bits,
            base_reg_no: base_reg.reg_no,
            idx_reg_no: Some(index_reg.reg_no),
            scale_exp,
            disp,
        })
    } else {
        unreachable!()
    }
}

/// Signed immediate operand, sized to fit the value
pub fn imm_opnd(value: i64) -> Opnd {
    Opnd::Imm(Imm { num_bits: imm_num_bits(value), value })
}

/// Unsigned immediate operand, sized to fit the value
pub fn uimm_opnd(value: u64) -> Opnd {
    Opnd::UImm(UImm { num_bits: uimm_num_bits(value), value })
}

/// Pointer constant operand
pub fn const_ptr_opnd(ptr: *const u8) -> Opnd {
    uimm_opnd(ptr as u64)
}

/// Write the REX byte
fn write_rex(cb: &mut CodeBlock, w_flag: bool, reg_no: u8, idx_reg_no: u8, rm_reg_no: u8) {
    // 0 1 0 0 w r x b
    // w - 64-bit operand size flag
    // r - MODRM.reg extension
    // x - SIB.index extension
    // b - MODRM.rm or SIB.base extension
    let w: u8 = if w_flag { 1 } else { 0 };
    let r: u8 = if (reg_no & 8) > 0 { 1 } else { 0 };
    let x: u8 = if (idx_reg_no & 8) > 0 { 1 } else { 0 };
    let b: u8 = if (rm_reg_no & 8) > 0 { 1 } else { 0 };

    cb.write_byte(0x40 + (w << 3) + (r << 2) + (x << 1) + b);
}

/// Write an opcode byte with an embedded register operand
fn write_opcode(cb: &mut CodeBlock, opcode: u8, reg: Reg) {
    cb.write_byte(opcode | (reg.reg_no & 7));
}

/// Encode an RM instruction
fn write_rm(
    cb: &mut CodeBlock,
    sz_pref: bool,
    rex_w: bool,
    r_opnd: Opnd,
    rm_opnd: Opnd,
    op_ext: Option<u8>,
    bytes: &[u8],
) {
    let op_len = bytes.len();
    assert!(op_len > 0 && op_len <= 3);
    assert!(
        matches!(r_opnd, Opnd::Reg(_) | Opnd::None),
        "can only encode an RM instruction with a register or a none"
    );

    // Flag to indicate the REX prefix is needed
    let need_rex = rex_w || r_opnd.rex_needed() || rm_opnd.rex_needed();

    // Flag to indicate SIB byte is needed
    let need_sib = r_opnd.sib_needed() || rm_opnd.sib_needed();

    // Add the operand-size prefix, if needed
    if sz_pref {
        cb.write_byte(0x66);
    }

    // Add the REX prefix, if needed
    if need_rex {
        let w = if rex_w { 1 } else { 0 };
        let r = match r_opnd {
            Opnd::None => 0,
            Opnd::Reg(reg) => if (reg.reg_no & 8) > 0 { 1 } else { 0 },
            _ => unreachable!(),
        };

        let x = match (need_sib, rm_opnd) {
            (true, Opnd::Mem(mem)) => if (mem.idx_reg_no.unwrap_or(0) & 8) > 0 { 1 } else { 0 },
            _ => 0,
        };

        let b = match rm_opnd {
            Opnd::Reg(reg) => if (reg.reg_no & 8) > 0 { 1 } else { 0 },
            Opnd::Mem(mem) => if (mem.base_reg_no & 8) > 0 { 1 } else { 0 },
            _ => 0,
        };

        cb.write_byte(0x40 + (w << 3) + (r << 2) + (x << 1) + b);
    }

    // Write the opcode bytes to the code block
    for byte in bytes {
        cb.write_byte(*byte)
    }

    // MODRM.mod (2 bits)
    // MODRM.reg (3 bits)
    // MODRM.rm  (3 bits)

    assert!(
        !(op_ext.is_some() && r_opnd.is_some()),
        "opcode extension and register operand present"
    );

    // Encode the mod field
    let rm_mod = match rm_opnd {
        Opnd::Reg(_) => 3,
        Opnd::IPRel(_) => 0,
        Opnd::Mem(_) => match rm_opnd.disp_size() {
            0 => 0,
            8 => 1,
            32 => 2,
            _ => unreachable!(),
        },
        _ => unreachable!(),
    };

    // Encode the reg field
    let reg: u8 = if let Some(val) = op_ext {
        val
    } else {
        match r_opnd {
            Opnd::Reg(reg) => reg.reg_no & 7,
            _ => 0,
        }
    };

    // Encode the rm field
    let rm = match rm_opnd {
        Opnd::Reg(reg) => reg.reg_no & 7,
        Opnd::Mem(mem) => if need_sib { 4 } else { mem.base_reg_no & 7 },
        Opnd::IPRel(_) => 0b101,
        _ => unreachable!(),
    };

    // Encode and write the ModR/M byte
    cb.write_byte((rm_mod << 6) + (reg << 3) + rm);

    // Add the SIB byte, if needed
    if need_sib {
        // SIB.scale (2 bits)
        // SIB.index (3 bits)
        // SIB.base  (3 bits)

        match rm_opnd {
            Opnd::Mem(mem) => {
                let scale = mem.scale_exp;
                let index = mem.idx_reg_no.map(|no| no & 7).unwrap_or(4);
                let base = mem.base_reg_no & 7;

                cb.write_byte((scale << 6) + (index << 3) + base);
            }
            _ => panic!("expected mem operand"),
        }
    }

    // Add the displacement
    match rm_opnd {
        Opnd::Mem(mem) => {
            let disp_size = rm_opnd.disp_size();
            if disp_size > 0 {
                cb.write_int(mem.disp as u64, disp_size);
            }
        }
        Opnd::IPRel(rel) => {
            cb.write_int(rel as u64, 32);
        }
        _ => (),
    };
}

// Encode a mul-like single-operand RM instruction
fn write_rm_unary(cb: &mut CodeBlock, op_mem_reg_8: u8, op_mem_reg_pref: u8, op_ext: Option<u8>, opnd: Opnd) {
    assert!(matches!(opnd, Opnd::Reg(_) | Opnd::Mem(_)));

    let opnd_size = opnd.num_bits();
    assert!(opnd_size == 8 || opnd_size == 16 || opnd_size == 32 || opnd_size == 64);

    if opnd_size == 8 {
        write_rm(cb, false, false, Opnd::None, opnd, op_ext, &[op_mem_reg_8]);
    } else {
        let sz_pref = opnd_size == 16;
        let rex_w = opnd_size == 64;
        write_rm(cb, sz_pref, rex_w, Opnd::None, opnd, op_ext, &[op_mem_reg_pref]);
    }
}

/// Opcode table for an add-like RM instruction with multiple encodings
struct RmOpcodes {
    /// r/m8, r8
    mem_reg8: u8,
    /// r/m, r (with size prefix or REX.W as needed)
    mem_reg: u8,
    /// r8, r/m8
    reg_mem8: u8,
    /// r, r/m
    reg_mem: u8,
    /// r/m8, imm8
    mem_imm8: u8,
    /// r/m, imm8 (sign extended)
    mem_imm_sml: u8,
    /// r/m, imm32
    mem_imm_lrg: u8,
    /// ModRM.reg opcode extension for the immediate forms
    ext_imm: Option<u8>,
}

// Encode an add-like RM instruction, picking the encoding from the
// operand shapes
fn write_rm_multi(cb: &mut CodeBlock, ops: RmOpcodes, opnd0: Opnd, opnd1: Opnd) {
    assert!(matches!(opnd0, Opnd::Reg(_) | Opnd::Mem(_)));

    // Check the size of opnd0
    let opnd_size = opnd0.num_bits();
    assert!(opnd_size == 8 || opnd_size == 16 || opnd_size == 32 || opnd_size == 64);

    // Check the size of opnd1
    match opnd1 {
        Opnd::Reg(reg) => assert_eq!(reg.num_bits, opnd_size),
        Opnd::Mem(mem) => assert_eq!(mem.num_bits, opnd_size),
        Opnd::Imm(imm) => assert!(imm.num_bits <= opnd_size),
        Opnd::UImm(uimm) => assert!(uimm.num_bits <= opnd_size),
        _ => (),
    };

    let sz_pref = opnd_size == 16;
    let rex_w = opnd_size == 64;

    match (opnd0, opnd1) {
        // R/M + Reg
        (Opnd::Mem(_), Opnd::Reg(_)) | (Opnd::Reg(_), Opnd::Reg(_)) => {
            if opnd_size == 8 {
                write_rm(cb, false, false, opnd1, opnd0, None, &[ops.mem_reg8]);
            } else {
                write_rm(cb, sz_pref, rex_w, opnd1, opnd0, None, &[ops.mem_reg]);
            }
        }
        // Reg + R/M/IPRel
        (Opnd::Reg(_), Opnd::Mem(_) | Opnd::IPRel(_)) => {
            if opnd_size == 8 {
                write_rm(cb, false, false, opnd0, opnd1, None, &[ops.reg_mem8]);
            } else {
                write_rm(cb, sz_pref, rex_w, opnd0, opnd1, None, &[ops.reg_mem]);
            }
        }
        // R/M + Imm
        (_, Opnd::Imm(imm)) => {
            if imm.num_bits <= 8 {
                // 8-bit immediate

                if opnd_size == 8 {
                    write_rm(cb, false, false, Opnd::None, opnd0, ops.ext_imm, &[ops.mem_imm8]);
                } else {
                    write_rm(cb, sz_pref, rex_w, Opnd::None, opnd0, ops.ext_imm, &[ops.mem_imm_sml]);
                }

                cb.write_int(imm.value as u64, 8);
            } else if imm.num_bits <= 32 {
                // 32-bit immediate

                assert!(imm.num_bits <= opnd_size);
                write_rm(cb, sz_pref, rex_w, Opnd::None, opnd0, ops.ext_imm, &[ops.mem_imm_lrg]);
                cb.write_int(imm.value as u64, if opnd_size > 32 { 32 } else { opnd_size.into() });
            } else {
                panic!("immediate value too large");
            }
        }
        // R/M + UImm
        (_, Opnd::UImm(uimm)) => {
            // If the operand size equals the bits needed to represent the
            // immediate as-is, sign extension cannot change the value, so
            // the unsigned width is usable directly. Otherwise the value
            // must survive being treated as signed.
            let num_bits = if opnd0.num_bits() == uimm_num_bits(uimm.value) {
                uimm_num_bits(uimm.value)
            } else {
                imm_num_bits(uimm.value.try_into().unwrap())
            };

            if num_bits <= 8 {
                // 8-bit immediate

                if opnd_size == 8 {
                    write_rm(cb, false, false, Opnd::None, opnd0, ops.ext_imm, &[ops.mem_imm8]);
                } else {
                    write_rm(cb, sz_pref, rex_w, Opnd::None, opnd0, ops.ext_imm, &[ops.mem_imm_sml]);
                }

                cb.write_int(uimm.value, 8);
            } else if num_bits <= 32 {
                // 32-bit immediate

                assert!(num_bits <= opnd_size);
                write_rm(cb, sz_pref, rex_w, Opnd::None, opnd0, ops.ext_imm, &[ops.mem_imm_lrg]);
                cb.write_int(uimm.value, if opnd_size > 32 { 32 } else { opnd_size.into() });
            } else {
                panic!("immediate value too large (num_bits={}, num={uimm:?})", num_bits);
            }
        }
        _ => panic!("unknown encoding combo: {opnd0:?} {opnd1:?}"),
    };
}

// LOCK - lock prefix for atomic shared memory operations
pub fn write_lock_prefix(cb: &mut CodeBlock) {
    cb.write_byte(0xf0);
}

/// add - Integer addition
pub fn add(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_rm_multi(
        cb,
        RmOpcodes {
            mem_reg8: 0x00,
            mem_reg: 0x01,
            reg_mem8: 0x02,
            reg_mem: 0x03,
            mem_imm8: 0x80,
            mem_imm_sml: 0x83,
            mem_imm_lrg: 0x81,
            ext_imm: Some(0x00),
        },
        opnd0,
        opnd1,
    );
}

/// and - Bitwise AND
pub fn and(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_rm_multi(
        cb,
        RmOpcodes {
            mem_reg8: 0x20,
            mem_reg: 0x21,
            reg_mem8: 0x22,
            reg_mem: 0x23,
            mem_imm8: 0x80,
            mem_imm_sml: 0x83,
            mem_imm_lrg: 0x81,
            ext_imm: Some(0x04),
        },
        opnd0,
        opnd1,
    );
}

/// call - Call to a pointer with a 32-bit displacement offset
pub fn call_rel32(cb: &mut CodeBlock, rel32: i32) {
    // Write the opcode
    cb.write_byte(0xe8);

    // Write the relative 32-bit jump offset
    cb.write_bytes(&rel32.to_le_bytes());
}

/// call - Call a pointer, encode with a 32-bit offset if possible
pub fn call_ptr(cb: &mut CodeBlock, scratch_opnd: Opnd, dst_ptr: *const u8) {
    if let Opnd::Reg(_) = scratch_opnd {
        // Pointer to the end of this call instruction
        let end_ptr = cb.get_ptr(cb.write_pos + 5);

        // Compute the jump offset
        let rel64: i64 = dst_ptr as i64 - end_ptr.into_i64();

        // If the offset fits in 32-bit
        if rel64 >= i32::MIN.into() && rel64 <= i32::MAX.into() {
            call_rel32(cb, rel64.try_into().unwrap());
            return;
        }

        // Move the pointer into the scratch register and call
        mov(cb, scratch_opnd, const_ptr_opnd(dst_ptr));
        call(cb, scratch_opnd);
    } else {
        unreachable!();
    }
}

/// call - Call to label with 32-bit offset
pub fn call_label(cb: &mut CodeBlock, label_idx: usize) {
    cb.write_byte(0xE8);
    cb.label_ref(label_idx);
}

/// call - Indirect call with an R/M operand
pub fn call(cb: &mut CodeBlock, opnd: Opnd) {
    write_rm(cb, false, false, Opnd::None, opnd, Some(2), &[0xff]);
}

/// Encode a conditional move instruction
fn write_cmov(cb: &mut CodeBlock, opcode1: u8, dst: Opnd, src: Opnd) {
    if let Opnd::Reg(reg) = dst {
        match src {
            Opnd::Reg(_) => (),
            Opnd::Mem(_) => (),
            _ => unreachable!(),
        };

        assert!(reg.num_bits >= 16);
        let sz_pref = reg.num_bits == 16;
        let rex_w = reg.num_bits == 64;

        write_rm(cb, sz_pref, rex_w, dst, src, None, &[0x0f, opcode1]);
    } else {
        unreachable!()
    }
}

// cmovcc - Conditional move
pub fn cmova(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x47, dst, src); }
pub fn cmovae(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x43, dst, src); }
pub fn cmovb(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x42, dst, src); }
pub fn cmovbe(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x46, dst, src); }
pub fn cmove(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x44, dst, src); }
pub fn cmovg(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x4f, dst, src); }
pub fn cmovge(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x4d, dst, src); }
pub fn cmovl(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x4c, dst, src); }
pub fn cmovle(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x4e, dst, src); }
pub fn cmovne(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x45, dst, src); }
pub fn cmovno(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x41, dst, src); }
pub fn cmovnz(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x45, dst, src); }
pub fn cmovo(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x40, dst, src); }
pub fn cmovs(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x48, dst, src); }
pub fn cmovz(cb: &mut CodeBlock, dst: Opnd, src: Opnd) { write_cmov(cb, 0x44, dst, src); }

/// cmp - Compare and set flags
pub fn cmp(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_rm_multi(
        cb,
        RmOpcodes {
            mem_reg8: 0x38,
            mem_reg: 0x39,
            reg_mem8: 0x3A,
            reg_mem: 0x3B,
            mem_imm8: 0x80,
            mem_imm_sml: 0x83,
            mem_imm_lrg: 0x81,
            ext_imm: Some(0x07),
        },
        opnd0,
        opnd1,
    );
}

/// cdq - Convert doubleword to quadword
pub fn cdq(cb: &mut CodeBlock) {
    cb.write_byte(0x99);
}

/// cqo - Convert quadword to octaword
pub fn cqo(cb: &mut CodeBlock) {
    cb.write_bytes(&[0x48, 0x99]);
}

/// imul - Signed integer multiply
pub fn imul(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    assert!(opnd0.num_bits() == 64);
    assert!(opnd1.num_bits() == 64);
    assert!(matches!(opnd0, Opnd::Reg(_) | Opnd::Mem(_)));
    assert!(matches!(opnd1, Opnd::Reg(_) | Opnd::Mem(_)));

    match (opnd0, opnd1) {
        (Opnd::Reg(_), Opnd::Reg(_) | Opnd::Mem(_)) => {
            // REX.W + 0F AF /r: IMUL r64, r/m64
            write_rm(cb, false, true, opnd0, opnd1, None, &[0x0F, 0xAF]);
        }

        // Flip the operands: the memory form only encodes one direction
        (Opnd::Mem(_), Opnd::Reg(_)) => {
            write_rm(cb, false, true, opnd1, opnd0, None, &[0x0F, 0xAF]);
        }

        _ => unreachable!(),
    }
}

/// int3 - Trap to debugger
pub fn int3(cb: &mut CodeBlock) {
    cb.write_byte(0xcc);
}

// Encode a conditional relative jump to a label
// Note: this always encodes a 32-bit offset
fn write_jcc(cb: &mut CodeBlock, op1: u8, label_idx: usize) {
    cb.write_byte(0x0F);
    cb.write_byte(op1);
    cb.label_ref(label_idx);
}

/// jcc - relative jumps to a label
pub fn ja_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x87, label_idx); }
pub fn jae_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x83, label_idx); }
pub fn jb_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x82, label_idx); }
pub fn jbe_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x86, label_idx); }
pub fn je_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x84, label_idx); }
pub fn jg_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x8F, label_idx); }
pub fn jge_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x8D, label_idx); }
pub fn jl_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x8C, label_idx); }
pub fn jle_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x8E, label_idx); }
pub fn jne_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x85, label_idx); }
pub fn jno_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x81, label_idx); }
pub fn jnz_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x85, label_idx); }
pub fn jo_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x80, label_idx); }
pub fn js_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x88, label_idx); }
pub fn jz_label(cb: &mut CodeBlock, label_idx: usize) { write_jcc(cb, 0x84, label_idx); }

pub fn jmp_label(cb: &mut CodeBlock, label_idx: usize) {
    cb.write_byte(0xE9);
    cb.label_ref(label_idx);
}

/// Encode a relative jump to a pointer at a 32-bit offset (direct or conditional).
/// The displacement is always 32 bits wide so that retargeting the jump can
/// never change the instruction size.
fn write_jcc_ptr(cb: &mut CodeBlock, op0: u8, op1: u8, dst_ptr: CodePtr) {
    // Write the opcode
    if op0 != 0xFF {
        cb.write_byte(op0);
    }

    cb.write_byte(op1);

    // Pointer to the end of this jump instruction
    let end_ptr = cb.get_ptr(cb.write_pos + 4);

    // Compute the jump offset
    let rel64 = dst_ptr.into_i64() - end_ptr.into_i64();

    if rel64 >= i32::MIN.into() && rel64 <= i32::MAX.into() {
        // Write the relative 32-bit jump offset
        cb.write_int(rel64 as u64, 32);
    } else {
        // Offset doesn't fit in 4 bytes. Report error.
        cb.dropped_bytes = true;
    }
}

/// jcc - relative jumps to a pointer (32-bit offset)
pub fn ja_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x87, ptr); }
pub fn jae_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x83, ptr); }
pub fn jb_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x82, ptr); }
pub fn jbe_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x86, ptr); }
pub fn je_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x84, ptr); }
pub fn jg_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x8F, ptr); }
pub fn jge_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x8D, ptr); }
pub fn jl_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x8C, ptr); }
pub fn jle_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x8E, ptr); }
pub fn jne_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x85, ptr); }
pub fn jno_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x81, ptr); }
pub fn jnz_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x85, ptr); }
pub fn jo_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x80, ptr); }
pub fn js_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x88, ptr); }
pub fn jz_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0x0F, 0x84, ptr); }
pub fn jmp_ptr(cb: &mut CodeBlock, ptr: CodePtr) { write_jcc_ptr(cb, 0xFF, 0xE9, ptr); }

/// jmp - Indirect jump near to an R/M operand
pub fn jmp_rm(cb: &mut CodeBlock, opnd: Opnd) {
    write_rm(cb, false, false, Opnd::None, opnd, Some(4), &[0xff]);
}

// jmp - Jump with relative 32-bit offset
pub fn jmp32(cb: &mut CodeBlock, offset: i32) {
    cb.write_byte(0xE9);
    cb.write_int(offset as u64, 32);
}

/// lea - Load Effective Address
pub fn lea(cb: &mut CodeBlock, dst: Opnd, src: Opnd) {
    if let Opnd::Reg(reg) = dst {
        assert!(reg.num_bits == 64);
        assert!(matches!(src, Opnd::Mem(_) | Opnd::IPRel(_)));
        write_rm(cb, false, true, dst, src, None, &[0x8d]);
    } else {
        unreachable!();
    }
}

/// mov - Data move operation
pub fn mov(cb: &mut CodeBlock, dst: Opnd, src: Opnd) {
    match (dst, src) {
        // R + Imm
        (Opnd::Reg(reg), Opnd::Imm(imm)) => {
            assert!(imm.num_bits <= reg.num_bits);

            // If the source immediate zero extends to the full 64 bits,
            // the 32-bit operand form of the instruction gives the same
            // result in fewer bytes: mov(rax, 0x34) becomes mov(eax, 0x34).
            if (reg.num_bits == 64) && (imm.value > 0) && (imm.num_bits <= 32) {
                if dst.rex_needed() {
                    write_rex(cb, false, 0, 0, reg.reg_no);
                }
                write_opcode(cb, 0xB8, reg);
                cb.write_int(imm.value as u64, 32);
            } else {
                if reg.num_bits == 16 {
                    cb.write_byte(0x66);
                }

                if dst.rex_needed() || reg.num_bits == 64 {
                    write_rex(cb, reg.num_bits == 64, 0, 0, reg.reg_no);
                }

                write_opcode(cb, if reg.num_bits == 8 { 0xb0 } else { 0xb8 }, reg);
                cb.write_int(imm.value as u64, reg.num_bits.into());
            }
        }
        // R + UImm
        (Opnd::Reg(reg), Opnd::UImm(uimm)) => {
            assert!(uimm.num_bits <= reg.num_bits);

            // Same shrink optimization as the signed form above
            if (reg.num_bits == 64) && (uimm.value <= u32::MAX.into()) {
                if dst.rex_needed() {
                    write_rex(cb, false, 0, 0, reg.reg_no);
                }
                write_opcode(cb, 0xB8, reg);
                cb.write_int(uimm.value, 32);
            } else {
                if reg.num_bits == 16 {
                    cb.write_byte(0x66);
                }

                if dst.rex_needed() || reg.num_bits == 64 {
                    write_rex(cb, reg.num_bits == 64, 0, 0, reg.reg_no);
                }

                write_opcode(cb, if reg.num_bits == 8 { 0xb0 } else { 0xb8 }, reg);
                cb.write_int(uimm.value, reg.num_bits.into());
            }
        }
        // M + Imm
        (Opnd::Mem(mem), Opnd::Imm(imm)) => {
            assert!(imm.num_bits <= mem.num_bits);

            if mem.num_bits == 8 {
                write_rm(cb, false, false, Opnd::None, dst, None, &[0xc6]);
            } else {
                write_rm(cb, mem.num_bits == 16, mem.num_bits == 64, Opnd::None, dst, Some(0), &[0xc7]);
            }

            let output_num_bits: u32 = if mem.num_bits > 32 { 32 } else { mem.num_bits.into() };
            assert!(
                mem.num_bits < 64 || imm_num_bits(imm.value) <= (output_num_bits as u8),
                "immediate value should be small enough to survive sign extension"
            );
            cb.write_int(imm.value as u64, output_num_bits);
        }
        // M + UImm
        (Opnd::Mem(mem), Opnd::UImm(uimm)) => {
            assert!(uimm.num_bits <= mem.num_bits);

            if mem.num_bits == 8 {
                write_rm(cb, false, false, Opnd::None, dst, None, &[0xc6]);
            } else {
                write_rm(cb, mem.num_bits == 16, mem.num_bits == 64, Opnd::None, dst, Some(0), &[0xc7]);
            }

            let output_num_bits: u32 = if mem.num_bits > 32 { 32 } else { mem.num_bits.into() };
            assert!(
                mem.num_bits < 64 || imm_num_bits(uimm.value as i64) <= (output_num_bits as u8),
                "immediate value should be small enough to survive sign extension"
            );
            cb.write_int(uimm.value, output_num_bits);
        }
        // * + Imm/UImm
        (_, Opnd::Imm(_) | Opnd::UImm(_)) => unreachable!(),
        // * + *
        (_, _) => {
            write_rm_multi(
                cb,
                RmOpcodes {
                    mem_reg8: 0x88,
                    mem_reg: 0x89,
                    reg_mem8: 0x8A,
                    reg_mem: 0x8B,
                    mem_imm8: 0xC6,
                    mem_imm_sml: 0xFF, // no small imm form
                    mem_imm_lrg: 0xFF,
                    ext_imm: None,
                },
                dst,
                src,
            );
        }
    };
}

/// A variant of mov that always writes the immediate in 64 bits, so the
/// value can be patched in place later (embedded object references).
pub fn movabs(cb: &mut CodeBlock, dst: Opnd, value: u64) {
    match dst {
        Opnd::Reg(reg) => {
            assert_eq!(reg.num_bits, 64);
            write_rex(cb, true, 0, 0, reg.reg_no);

            write_opcode(cb, 0xb8, reg);
            cb.write_int(value, 64);
        }
        _ => unreachable!(),
    }
}

/// movsx - Move with sign extension (signed integers)
pub fn movsx(cb: &mut CodeBlock, dst: Opnd, src: Opnd) {
    if let Opnd::Reg(_) = dst {
        assert!(matches!(src, Opnd::Reg(_) | Opnd::Mem(_)));

        let src_num_bits = src.num_bits();
        let dst_num_bits = dst.num_bits();
        assert!(src_num_bits < dst_num_bits);

        match src_num_bits {
            8 => write_rm(cb, dst_num_bits == 16, dst_num_bits == 64, dst, src, None, &[0x0f, 0xbe]),
            16 => write_rm(cb, dst_num_bits == 16, dst_num_bits == 64, dst, src, None, &[0x0f, 0xbf]),
            32 => write_rm(cb, false, true, dst, src, None, &[0x63]),
            _ => unreachable!(),
        };
    } else {
        unreachable!();
    }
}

/// nop - Noop, one or multiple bytes long
pub fn nop(cb: &mut CodeBlock, length: u32) {
    match length {
        0 => {}
        1 => cb.write_byte(0x90),
        2 => cb.write_bytes(&[0x66, 0x90]),
        3 => cb.write_bytes(&[0x0f, 0x1f, 0x00]),
        4 => cb.write_bytes(&[0x0f, 0x1f, 0x40, 0x00]),
        5 => cb.write_bytes(&[0x0f, 0x1f, 0x44, 0x00, 0x00]),
        6 => cb.write_bytes(&[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00]),
        7 => cb.write_bytes(&[0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00]),
        8 => cb.write_bytes(&[0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]),
        9 => cb.write_bytes(&[0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]),
        _ => {
            let mut written: u32 = 0;
            while written + 9 <= length {
                nop(cb, 9);
                written += 9;
            }
            nop(cb, length - written);
        }
    };
}

/// not - Bitwise NOT
pub fn not(cb: &mut CodeBlock, opnd: Opnd) {
    write_rm_unary(cb, 0xf6, 0xf7, Some(0x02), opnd);
}

/// or - Bitwise OR
pub fn or(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_rm_multi(
        cb,
        RmOpcodes {
            mem_reg8: 0x08,
            mem_reg: 0x09,
            reg_mem8: 0x0A,
            reg_mem: 0x0B,
            mem_imm8: 0x80,
            mem_imm_sml: 0x83,
            mem_imm_lrg: 0x81,
            ext_imm: Some(0x01),
        },
        opnd0,
        opnd1,
    );
}

/// pop - Pop a register off the stack
pub fn pop(cb: &mut CodeBlock, opnd: Opnd) {
    match opnd {
        Opnd::Reg(reg) => {
            assert!(reg.num_bits == 64);

            if opnd.rex_needed() {
                write_rex(cb, false, 0, 0, reg.reg_no);
            }
            write_opcode(cb, 0x58, reg);
        }
        Opnd::Mem(mem) => {
            assert!(mem.num_bits == 64);

            write_rm(cb, false, false, Opnd::None, opnd, Some(0), &[0x8f]);
        }
        _ => unreachable!(),
    };
}

/// popfq - Pop the flags register (64-bit)
pub fn popfq(cb: &mut CodeBlock) {
    // REX.W + 0x9D
    cb.write_bytes(&[0x48, 0x9d]);
}

/// push - Push an operand on the stack
pub fn push(cb: &mut CodeBlock, opnd: Opnd) {
    match opnd {
        Opnd::Reg(reg) => {
            if opnd.rex_needed() {
                write_rex(cb, false, 0, 0, reg.reg_no);
            }
            write_opcode(cb, 0x50, reg);
        }
        Opnd::Mem(_) => {
            write_rm(cb, false, false, Opnd::None, opnd, Some(6), &[0xff]);
        }
        _ => unreachable!(),
    }
}

/// pushfq - Push the flags register (64-bit)
pub fn pushfq(cb: &mut CodeBlock) {
    cb.write_byte(0x9C);
}

/// ret - Return from call, popping only the return address
pub fn ret(cb: &mut CodeBlock) {
    cb.write_byte(0xC3);
}

// Encode a bitwise shift instruction
fn write_shift(
    cb: &mut CodeBlock,
    op_mem_one_pref: u8,
    op_mem_cl_pref: u8,
    op_mem_imm_pref: u8,
    op_ext: u8,
    opnd0: Opnd,
    opnd1: Opnd,
) {
    assert!(matches!(opnd0, Opnd::Reg(_) | Opnd::Mem(_)));

    // Check the size of opnd0
    let opnd_size = opnd0.num_bits();
    assert!(opnd_size == 16 || opnd_size == 32 || opnd_size == 64);

    let sz_pref = opnd_size == 16;
    let rex_w = opnd_size == 64;

    match opnd1 {
        Opnd::UImm(imm) => {
            if imm.value == 1 {
                write_rm(cb, sz_pref, rex_w, Opnd::None, opnd0, Some(op_ext), &[op_mem_one_pref]);
            } else {
                assert!(imm.num_bits <= 8);
                write_rm(cb, sz_pref, rex_w, Opnd::None, opnd0, Some(op_ext), &[op_mem_imm_pref]);
                cb.write_byte(imm.value as u8);
            }
        }

        Opnd::Reg(reg) => {
            // Only CL can be the variable shift amount
            assert!(reg.reg_no == RCX_REG_NO);
            write_rm(cb, sz_pref, rex_w, Opnd::None, opnd0, Some(op_ext), &[op_mem_cl_pref]);
        }

        _ => {
            unreachable!("unsupported operands: {:?}, {:?}", opnd0, opnd1);
        }
    }
}

/// sal - Shift arithmetic left
pub fn sal(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_shift(cb, 0xD1, 0xD3, 0xC1, 0x04, opnd0, opnd1);
}

/// sar - Shift arithmetic right (signed)
pub fn sar(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_shift(cb, 0xD1, 0xD3, 0xC1, 0x07, opnd0, opnd1);
}

/// shl - Shift logical left
pub fn shl(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_shift(cb, 0xD1, 0xD3, 0xC1, 0x04, opnd0, opnd1);
}

/// shr - Shift logical right (unsigned)
pub fn shr(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_shift(cb, 0xD1, 0xD3, 0xC1, 0x05, opnd0, opnd1);
}

/// sub - Integer subtraction
pub fn sub(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_rm_multi(
        cb,
        RmOpcodes {
            mem_reg8: 0x28,
            mem_reg: 0x29,
            reg_mem8: 0x2A,
            reg_mem: 0x2B,
            mem_imm8: 0x80,
            mem_imm_sml: 0x83,
            mem_imm_lrg: 0x81,
            ext_imm: Some(0x05),
        },
        opnd0,
        opnd1,
    );
}

fn resize_opnd(opnd: Opnd, num_bits: u8) -> Opnd {
    match opnd {
        Opnd::Reg(reg) => {
            let mut cloned = reg;
            cloned.num_bits = num_bits;
            Opnd::Reg(cloned)
        }
        Opnd::Mem(mem) => {
            let mut cloned = mem;
            cloned.num_bits = num_bits;
            Opnd::Mem(cloned)
        }
        _ => unreachable!(),
    }
}

/// test - Logical Compare
pub fn test(cb: &mut CodeBlock, rm_opnd: Opnd, test_opnd: Opnd) {
    assert!(matches!(rm_opnd, Opnd::Reg(_) | Opnd::Mem(_)));
    let rm_num_bits = rm_opnd.num_bits();

    match test_opnd {
        Opnd::UImm(uimm) => {
            assert!(uimm.num_bits <= 32);
            assert!(uimm.num_bits <= rm_num_bits);

            // Use the smallest operand size possible
            assert!(rm_num_bits % 8 == 0);
            let rm_resized = resize_opnd(rm_opnd, uimm.num_bits);

            if uimm.num_bits == 8 {
                write_rm(cb, false, false, Opnd::None, rm_resized, Some(0x00), &[0xf6]);
                cb.write_int(uimm.value, uimm.num_bits.into());
            } else {
                write_rm(cb, uimm.num_bits == 16, false, Opnd::None, rm_resized, Some(0x00), &[0xf7]);
                cb.write_int(uimm.value, uimm.num_bits.into());
            }
        }
        Opnd::Imm(imm) => {
            // This form only applies to 64-bit R/M operands with 32-bit
            // signed immediates
            assert!(imm.num_bits <= 32);
            assert!(rm_num_bits == 64);

            write_rm(cb, false, true, Opnd::None, rm_opnd, Some(0x00), &[0xf7]);
            cb.write_int(imm.value as u64, 32);
        }
        Opnd::Reg(reg) => {
            assert!(reg.num_bits == rm_num_bits);

            if rm_num_bits == 8 {
                write_rm(cb, false, false, test_opnd, rm_opnd, None, &[0x84]);
            } else {
                write_rm(cb, rm_num_bits == 16, rm_num_bits == 64, test_opnd, rm_opnd, None, &[0x85]);
            }
        }
        _ => unreachable!(),
    };
}

/// ud2 - Undefined opcode
pub fn ud2(cb: &mut CodeBlock) {
    cb.write_bytes(&[0x0f, 0x0b]);
}

/// xchg - Exchange Register/Memory with Register
pub fn xchg(cb: &mut CodeBlock, rm_opnd: Opnd, r_opnd: Opnd) {
    if let (Opnd::Reg(rm_reg), Opnd::Reg(r_reg)) = (rm_opnd, r_opnd) {
        assert!(rm_reg.num_bits == 64);
        assert!(r_reg.num_bits == 64);

        // Exchange with RAX has a short form
        if rm_reg.reg_no == RAX_REG_NO {
            write_rex(cb, true, 0, 0, r_reg.reg_no);
            cb.write_byte(0x90 + (r_reg.reg_no & 7));
        } else {
            write_rm(cb, false, true, r_opnd, rm_opnd, None, &[0x87]);
        }
    } else {
        unreachable!();
    }
}

/// xor - Exclusive bitwise OR
pub fn xor(cb: &mut CodeBlock, opnd0: Opnd, opnd1: Opnd) {
    write_rm_multi(
        cb,
        RmOpcodes {
            mem_reg8: 0x30,
            mem_reg: 0x31,
            reg_mem8: 0x32,
            reg_mem: 0x33,
            mem_imm8: 0x80,
            mem_imm_sml: 0x83,
            mem_imm_lrg: 0x81,
            ext_imm: Some(0x06),
        },
        opnd0,
        opnd1,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Check that the bytes for an instruction sequence match a hex string
    fn check_bytes<R>(bytes: &str, run: R)
    where
        R: FnOnce(&mut CodeBlock),
    {
        let mut cb = CodeBlock::new_dummy(4096);
        run(&mut cb);

        let mut hex = String::new();
        for pos in 0..cb.get_write_pos() {
            let byte = unsafe { cb.get_ptr(pos).raw_ptr().read() };
            hex.push_str(&format!("{:02x}", byte));
        }

        assert_eq!(hex, bytes);
    }

    #[test]
    fn test_add() {
        check_bytes("80c103", |cb| add(cb, CL, imm_opnd(3)));
        check_bytes("00d9", |cb| add(cb, CL, BL));
        check_bytes("4000e1", |cb| add(cb, CL, SPL));
        check_bytes("6601d9", |cb| add(cb, CX, BX));
        check_bytes("4801d8", |cb| add(cb, RAX, RBX));
        check_bytes("01d1", |cb| add(cb, ECX, EDX));
        check_bytes("4c01f2", |cb| add(cb, RDX, R14));
        check_bytes("480110", |cb| add(cb, mem_opnd(64, RAX, 0), RDX));
        check_bytes("480310", |cb| add(cb, RDX, mem_opnd(64, RAX, 0)));
        check_bytes("48035008", |cb| add(cb, RDX, mem_opnd(64, RAX, 8)));
        check_bytes("480390ff000000", |cb| add(cb, RDX, mem_opnd(64, RAX, 255)));
        check_bytes("4881407fff000000", |cb| add(cb, mem_opnd(64, RAX, 127), imm_opnd(255)));
        check_bytes("0110", |cb| add(cb, mem_opnd(32, RAX, 0), EDX));
        check_bytes("4883c408", |cb| add(cb, RSP, imm_opnd(8)));
        check_bytes("83c108", |cb| add(cb, ECX, imm_opnd(8)));
        check_bytes("81c1ff000000", |cb| add(cb, ECX, imm_opnd(255)));
    }

    #[test]
    fn test_add_unsigned() {
        // ADD r/m8, imm8
        check_bytes("4180c001", |cb| add(cb, R8B, uimm_opnd(1)));
        check_bytes("4180c07f", |cb| add(cb, R8B, imm_opnd(i8::MAX.into())));

        // ADD r/m16, imm16
        check_bytes("664183c001", |cb| add(cb, R8W, uimm_opnd(1)));
        check_bytes("664181c0ff7f", |cb| add(cb, R8W, uimm_opnd(i16::MAX.try_into().unwrap())));

        // ADD r/m32, imm32
        check_bytes("4183c001", |cb| add(cb, R8D, uimm_opnd(1)));
        check_bytes("4181c0ffffff7f", |cb| add(cb, R8D, uimm_opnd(i32::MAX.try_into().unwrap())));

        // ADD r/m64, imm32
        check_bytes("4983c001", |cb| add(cb, R8, uimm_opnd(1)));
        check_bytes("4981c0ffffff7f", |cb| add(cb, R8, uimm_opnd(i32::MAX.try_into().unwrap())));
    }

    #[test]
    fn test_and() {
        check_bytes("4421e5", |cb| and(cb, EBP, R12D));
        check_bytes("48832008", |cb| and(cb, mem_opnd(64, RAX, 0), imm_opnd(0x08)));
    }

    #[test]
    fn test_call_label() {
        check_bytes("e8fbffffff", |cb| {
            let label_idx = cb.new_label("fn".to_owned());
            call_label(cb, label_idx);
            cb.link_labels();
        });
    }

    #[test]
    fn test_call_ptr() {
        // Calling a lower address
        check_bytes("e8fbffffff", |cb| {
            let ptr = cb.get_write_ptr();
            call_ptr(cb, RAX, ptr.raw_ptr());
        });
    }

    #[test]
    fn test_call_reg() {
        check_bytes("ffd0", |cb| call(cb, RAX));
    }

    #[test]
    fn test_call_mem() {
        check_bytes("ff542408", |cb| call(cb, mem_opnd(64, RSP, 8)));
    }

    #[test]
    fn test_cmovcc() {
        check_bytes("0f4ff7", |cb| cmovg(cb, ESI, EDI));
        check_bytes("0f4f750c", |cb| cmovg(cb, ESI, mem_opnd(32, RBP, 12)));
        check_bytes("0f4cc1", |cb| cmovl(cb, EAX, ECX));
        check_bytes("480f4cdd", |cb| cmovl(cb, RBX, RBP));
        check_bytes("0f4e742404", |cb| cmovle(cb, ESI, mem_opnd(32, RSP, 4)));
    }

    #[test]
    fn test_cmp() {
        check_bytes("38d1", |cb| cmp(cb, CL, DL));
        check_bytes("39f9", |cb| cmp(cb, ECX, EDI));
        check_bytes("493b1424", |cb| cmp(cb, RDX, mem_opnd(64, R12, 0)));
        check_bytes("4883f802", |cb| cmp(cb, RAX, imm_opnd(2)));
    }

    #[test]
    fn test_cqo() {
        check_bytes("4899", |cb| cqo(cb));
    }

    #[test]
    fn test_imul() {
        check_bytes("480fafc3", |cb| imul(cb, RAX, RBX));
        check_bytes("480faf10", |cb| imul(cb, RDX, mem_opnd(64, RAX, 0)));

        // Operands flipped for encoding since multiplication is commutative
        check_bytes("480faf10", |cb| imul(cb, mem_opnd(64, RAX, 0), RDX));
    }

    #[test]
    fn test_jge_label() {
        check_bytes("0f8dfaffffff", |cb| {
            let label_idx = cb.new_label("loop".to_owned());
            jge_label(cb, label_idx);
            cb.link_labels();
        });
    }

    #[test]
    fn test_jmp_label() {
        // Forward jump
        check_bytes("e900000000", |cb| {
            let label_idx = cb.new_label("next".to_owned());
            jmp_label(cb, label_idx);
            cb.write_label(label_idx);
            cb.link_labels();
        });

        // Backwards jump
        check_bytes("e9fbffffff", |cb| {
            let label_idx = cb.new_label("loop".to_owned());
            cb.write_label(label_idx);
            jmp_label(cb, label_idx);
            cb.link_labels();
        });
    }

    #[test]
    fn test_jmp_rm() {
        check_bytes("41ffe4", |cb| jmp_rm(cb, R12));
    }

    #[test]
    fn test_jo_label() {
        check_bytes("0f80faffffff", |cb| {
            let label_idx = cb.new_label("loop".to_owned());
            jo_label(cb, label_idx);
            cb.link_labels();
        });
    }

    #[test]
    fn test_jmp_ptr_size_is_constant() {
        // Near and far targets encode to the same five bytes
        let mut cb = CodeBlock::new_dummy(4096);
        let target = cb.get_ptr(16);
        jmp_ptr(&mut cb, target);
        assert_eq!(cb.get_write_pos(), 5);

        let start = cb.get_write_pos();
        let far = cb.get_ptr(4000);
        jmp_ptr(&mut cb, far);
        assert_eq!(cb.get_write_pos() - start, 5);
    }

    #[test]
    fn test_lea() {
        check_bytes("488d5108", |cb| lea(cb, RDX, mem_opnd(64, RCX, 8)));
        check_bytes("488d0500000000", |cb| lea(cb, RAX, mem_opnd(8, RIP, 0)));
        check_bytes("488d0505000000", |cb| lea(cb, RAX, mem_opnd(8, RIP, 5)));
        check_bytes("488d3d05000000", |cb| lea(cb, RDI, mem_opnd(8, RIP, 5)));
    }

    #[test]
    fn test_mov() {
        check_bytes("b807000000", |cb| mov(cb, EAX, imm_opnd(7)));
        check_bytes("b8fdffffff", |cb| mov(cb, EAX, imm_opnd(-3)));
        check_bytes("41bf03000000", |cb| mov(cb, R15, imm_opnd(3)));
        check_bytes("89d8", |cb| mov(cb, EAX, EBX));
        check_bytes("89c8", |cb| mov(cb, EAX, ECX));
        check_bytes("8b9380000000", |cb| mov(cb, EDX, mem_opnd(32, RBX, 128)));
        check_bytes("488b442404", |cb| mov(cb, RAX, mem_opnd(64, RSP, 4)));

        // Shrink `mov rax, 3` into `mov eax, 3`
        check_bytes("41b834000000", |cb| mov(cb, R8, imm_opnd(0x34)));
        check_bytes("49b80000008000000000", |cb| mov(cb, R8, imm_opnd(0x80000000)));
        check_bytes("49b8ffffffffffffffff", |cb| mov(cb, R8, imm_opnd(-1)));

        check_bytes("b834000000", |cb| mov(cb, RAX, imm_opnd(0x34)));
        check_bytes("48b8020000000000c0ff", |cb| mov(cb, RAX, imm_opnd(-18014398509481982)));
        check_bytes("48b80000008000000000", |cb| mov(cb, RAX, imm_opnd(0x80000000)));
        // Negative values cannot shrink: sign extension would change them
        check_bytes("48b8ccffffffffffffff", |cb| mov(cb, RAX, imm_opnd(-52)));
        check_bytes("48b8ffffffffffffffff", |cb| mov(cb, RAX, imm_opnd(-1)));
        check_bytes("4488c9", |cb| mov(cb, CL, R9B));
        check_bytes("4889c3", |cb| mov(cb, RBX, RAX));
        check_bytes("4889df", |cb| mov(cb, RDI, RBX));
        check_bytes("40b60b", |cb| mov(cb, SIL, imm_opnd(11)));

        check_bytes("c60424fd", |cb| mov(cb, mem_opnd(8, RSP, 0), imm_opnd(-3)));
        check_bytes("48c7470801000000", |cb| mov(cb, mem_opnd(64, RDI, 8), imm_opnd(1)));
        check_bytes("c7400411000000", |cb| mov(cb, mem_opnd(32, RAX, 4), imm_opnd(17)));
        check_bytes("41895814", |cb| mov(cb, mem_opnd(32, R8, 20), EBX));
        check_bytes("4d8913", |cb| mov(cb, mem_opnd(64, R11, 0), R10));
        check_bytes("48c742f8f4ffffff", |cb| mov(cb, mem_opnd(64, RDX, -8), imm_opnd(-12)));
    }

    #[test]
    fn test_movabs() {
        check_bytes("49b83400000000000000", |cb| movabs(cb, R8, 0x34));
        check_bytes("49b80000008000000000", |cb| movabs(cb, R8, 0x80000000));
    }

    #[test]
    fn test_mov_unsigned() {
        // MOV AL, imm8
        check_bytes("b001", |cb| mov(cb, AL, uimm_opnd(1)));
        check_bytes("b0ff", |cb| mov(cb, AL, uimm_opnd(u8::MAX.into())));

        // MOV EAX, imm32
        check_bytes("b801000000", |cb| mov(cb, EAX, uimm_opnd(1)));
        check_bytes("b8ffffffff", |cb| mov(cb, EAX, uimm_opnd(u32::MAX.into())));
        check_bytes("41b800000000", |cb| mov(cb, R8, uimm_opnd(0)));
        check_bytes("41b8ffffffff", |cb| mov(cb, R8, uimm_opnd(0xFF_FF_FF_FF)));

        // MOV RAX, imm64: moves down into EAX since it fits in 32 bits
        check_bytes("b801000000", |cb| mov(cb, RAX, uimm_opnd(1)));
        check_bytes("b8ffffffff", |cb| mov(cb, RAX, uimm_opnd(u32::MAX.into())));

        // MOV RAX, imm64: does not fit in 32 bits
        check_bytes("48b80000000001000000", |cb| mov(cb, RAX, uimm_opnd(u32::MAX as u64 + 1)));
        check_bytes("48b8ffffffffffffffff", |cb| mov(cb, RAX, uimm_opnd(u64::MAX)));
        check_bytes("49b8ffffffffffffffff", |cb| mov(cb, R8, uimm_opnd(u64::MAX)));

        // MOV r32, imm32
        check_bytes("41b801000000", |cb| mov(cb, R8D, uimm_opnd(1)));
        check_bytes("41b8ffffffff", |cb| mov(cb, R8D, uimm_opnd(u32::MAX.into())));
        check_bytes("41b801000000", |cb| mov(cb, R8, uimm_opnd(1)));
    }

    #[test]
    fn test_mov_iprel() {
        check_bytes("8b0500000000", |cb| mov(cb, EAX, mem_opnd(32, RIP, 0)));
        check_bytes("8b0505000000", |cb| mov(cb, EAX, mem_opnd(32, RIP, 5)));

        check_bytes("488b0500000000", |cb| mov(cb, RAX, mem_opnd(64, RIP, 0)));
        check_bytes("488b0505000000", |cb| mov(cb, RAX, mem_opnd(64, RIP, 5)));
        check_bytes("488b3d05000000", |cb| mov(cb, RDI, mem_opnd(64, RIP, 5)));
    }

    #[test]
    fn test_movsx() {
        check_bytes("660fbec0", |cb| movsx(cb, AX, AL));
        check_bytes("0fbed0", |cb| movsx(cb, EDX, AL));
        check_bytes("480fbec3", |cb| movsx(cb, RAX, BL));
        check_bytes("0fbfc8", |cb| movsx(cb, ECX, AX));
        check_bytes("4c0fbed9", |cb| movsx(cb, R11, CL));
        check_bytes("4c6354240c", |cb| movsx(cb, R10, mem_opnd(32, RSP, 12)));
        check_bytes("480fbe0424", |cb| movsx(cb, RAX, mem_opnd(8, RSP, 0)));
        check_bytes("490fbf5504", |cb| movsx(cb, RDX, mem_opnd(16, R13, 4)));
    }

    #[test]
    fn test_nop() {
        check_bytes("90", |cb| nop(cb, 1));
        check_bytes("6690", |cb| nop(cb, 2));
        check_bytes("0f1f00", |cb| nop(cb, 3));
        check_bytes("0f1f4000", |cb| nop(cb, 4));
        check_bytes("0f1f440000", |cb| nop(cb, 5));
        check_bytes("660f1f440000", |cb| nop(cb, 6));
        check_bytes("0f1f8000000000", |cb| nop(cb, 7));
        check_bytes("0f1f840000000000", |cb| nop(cb, 8));
        check_bytes("660f1f840000000000", |cb| nop(cb, 9));
        check_bytes("660f1f84000000000090", |cb| nop(cb, 10));
        check_bytes("660f1f8400000000006690", |cb| nop(cb, 11));
        check_bytes("660f1f8400000000000f1f00", |cb| nop(cb, 12));
    }

    #[test]
    fn test_not() {
        check_bytes("66f7d0", |cb| not(cb, AX));
        check_bytes("f7d0", |cb| not(cb, EAX));
        check_bytes("49f71424", |cb| not(cb, mem_opnd(64, R12, 0)));
        check_bytes("f794242d010000", |cb| not(cb, mem_opnd(32, RSP, 301)));
        check_bytes("f71424", |cb| not(cb, mem_opnd(32, RSP, 0)));
        check_bytes("f7542403", |cb| not(cb, mem_opnd(32, RSP, 3)));
        check_bytes("f75500", |cb| not(cb, mem_opnd(32, RBP, 0)));
        check_bytes("f7550d", |cb| not(cb, mem_opnd(32, RBP, 13)));
        check_bytes("48f7d0", |cb| not(cb, RAX));
        check_bytes("49f7d3", |cb| not(cb, R11));
        check_bytes("f752c9", |cb| not(cb, mem_opnd(32, RDX, -55)));
        check_bytes("f792d5fdffff", |cb| not(cb, mem_opnd(32, RDX, -555)));
    }

    #[test]
    fn test_or() {
        check_bytes("09f2", |cb| or(cb, EDX, ESI));
    }

    #[test]
    fn test_pop() {
        check_bytes("58", |cb| pop(cb, RAX));
        check_bytes("5b", |cb| pop(cb, RBX));
        check_bytes("5c", |cb| pop(cb, RSP));
        check_bytes("5d", |cb| pop(cb, RBP));
        check_bytes("415c", |cb| pop(cb, R12));
        check_bytes("8f00", |cb| pop(cb, mem_opnd(64, RAX, 0)));
        check_bytes("418f00", |cb| pop(cb, mem_opnd(64, R8, 0)));
        check_bytes("418f4003", |cb| pop(cb, mem_opnd(64, R8, 3)));
        check_bytes("8f44c803", |cb| pop(cb, mem_opnd_sib(64, RAX, RCX, 8, 3)));
        check_bytes("418f44c803", |cb| pop(cb, mem_opnd_sib(64, R8, RCX, 8, 3)));
    }

    #[test]
    fn test_push() {
        check_bytes("50", |cb| push(cb, RAX));
        check_bytes("53", |cb| push(cb, RBX));
        check_bytes("4154", |cb| push(cb, R12));
        check_bytes("ff30", |cb| push(cb, mem_opnd(64, RAX, 0)));
        check_bytes("41ff30", |cb| push(cb, mem_opnd(64, R8, 0)));
        check_bytes("41ff7003", |cb| push(cb, mem_opnd(64, R8, 3)));
        check_bytes("ff74c803", |cb| push(cb, mem_opnd_sib(64, RAX, RCX, 8, 3)));
        check_bytes("41ff74c803", |cb| push(cb, mem_opnd_sib(64, R8, RCX, 8, 3)));
    }

    #[test]
    fn test_ret() {
        check_bytes("c3", |cb| ret(cb));
    }

    #[test]
    fn test_sal() {
        check_bytes("66d1e1", |cb| sal(cb, CX, uimm_opnd(1)));
        check_bytes("d1e1", |cb| sal(cb, ECX, uimm_opnd(1)));
        check_bytes("c1e505", |cb| sal(cb, EBP, uimm_opnd(5)));
        check_bytes("d1642444", |cb| sal(cb, mem_opnd(32, RSP, 68), uimm_opnd(1)));
        check_bytes("48d3e1", |cb| sal(cb, RCX, CL));
    }

    #[test]
    fn test_sar() {
        check_bytes("d1fa", |cb| sar(cb, EDX, uimm_opnd(1)));
    }

    #[test]
    fn test_shr() {
        check_bytes("49c1ee07", |cb| shr(cb, R14, uimm_opnd(7)));
    }

    #[test]
    fn test_sub() {
        check_bytes("83e801", |cb| sub(cb, EAX, imm_opnd(1)));
        check_bytes("4883e802", |cb| sub(cb, RAX, imm_opnd(2)));
    }

    #[test]
    #[should_panic]
    fn test_sub_uimm_too_large() {
        // This immediate becomes a different value after sign extension,
        // so it is not safe to encode
        check_bytes("ff", |cb| sub(cb, RCX, uimm_opnd(0x8000_0000)));
    }

    #[test]
    fn test_test() {
        check_bytes("84c0", |cb| test(cb, AL, AL));
        check_bytes("6685c0", |cb| test(cb, AX, AX));
        check_bytes("f6c108", |cb| test(cb, CL, uimm_opnd(8)));
        check_bytes("f6c207", |cb| test(cb, DL, uimm_opnd(7)));
        check_bytes("f6c108", |cb| test(cb, RCX, uimm_opnd(8)));
        check_bytes("f6420808", |cb| test(cb, mem_opnd(8, RDX, 8), uimm_opnd(8)));
        check_bytes("f64208ff", |cb| test(cb, mem_opnd(8, RDX, 8), uimm_opnd(255)));
        check_bytes("66f7c2ffff", |cb| test(cb, DX, uimm_opnd(0xffff)));
        check_bytes("66f74208ffff", |cb| test(cb, mem_opnd(16, RDX, 8), uimm_opnd(0xffff)));
        check_bytes("f60601", |cb| test(cb, mem_opnd(8, RSI, 0), uimm_opnd(1)));
        check_bytes("f6461001", |cb| test(cb, mem_opnd(8, RSI, 16), uimm_opnd(1)));
        check_bytes("f646f001", |cb| test(cb, mem_opnd(8, RSI, -16), uimm_opnd(1)));
        check_bytes("854640", |cb| test(cb, mem_opnd(32, RSI, 64), EAX));
        check_bytes("4885472a", |cb| test(cb, mem_opnd(64, RDI, 42), RAX));
        check_bytes("4885c0", |cb| test(cb, RAX, RAX));
        check_bytes("4885f0", |cb| test(cb, RAX, RSI));
        check_bytes("48f74640f7ffffff", |cb| test(cb, mem_opnd(64, RSI, 64), imm_opnd(!0x08)));
        check_bytes("48f7464008000000", |cb| test(cb, mem_opnd(64, RSI, 64), imm_opnd(0x08)));
        check_bytes("48f7c108000000", |cb| test(cb, RCX, imm_opnd(0x08)));
    }

    #[test]
    fn test_xchg() {
        check_bytes("4891", |cb| xchg(cb, RAX, RCX));
        check_bytes("4995", |cb| xchg(cb, RAX, R13));
        check_bytes("4887d9", |cb| xchg(cb, RCX, RBX));
        check_bytes("4d87f9", |cb| xchg(cb, R9, R15));
    }

    #[test]
    fn test_xor() {
        check_bytes("31c0", |cb| xor(cb, EAX, EAX));
    }
}
