//! Pure x86-64 instruction encoders.
//!
//! Every function here is stateless: it computes the REX prefix, opcode,
//! ModR/M, optional SIB and displacement for one instruction and returns the
//! bytes. Callers own all sequencing, patching and relocation concerns, so
//! the layers above can treat instruction emission as an algebra.
//!
//! Access widths are given in bits (8/16/32/64). A width the encoder does
//! not implement for an operation is a code-generator bug and asserts.

use super::rex::{emit_modrm_sib_disp, encode_modrm, RexFlags};
use super::{Gpr, Xmm};
use smallvec::SmallVec;

/// The bytes of a single encoded instruction.
///
/// The longest sequence produced here is `movabs` with a REX prefix and an
/// 8-byte immediate (10 bytes); 16 keeps everything inline.
pub type EncodedInst = SmallVec<[u8; 16]>;

/// ALU operations encoded in the "load" form (`op reg, r/m`), which keeps
/// the destination in the ModRM reg field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

impl AluOp {
    /// The `op reg, r/m` opcode byte.
    fn opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x03,
            AluOp::Sub => 0x2B,
            AluOp::And => 0x23,
            AluOp::Or => 0x0B,
            AluOp::Xor => 0x33,
            AluOp::Cmp => 0x3B,
        }
    }

    /// The ModRM reg-field selector for the `83 /n ib` immediate form.
    fn ext(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

/// Operations selected by the ModRM reg field rather than the opcode byte.
///
/// The shift group lives under opcode `D3` and the multiply/divide/negate
/// group under `F7`; both use the reg field as the instruction selector, so
/// a single helper owns that encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum GroupExt {
    Rol,
    Ror,
    Shl,
    Shr,
    Sar,
    Not,
    Neg,
    Mul,
    Imul,
    Div,
    Idiv,
}

impl GroupExt {
    /// The ModRM reg-field selector.
    pub fn ext(self) -> u8 {
        match self {
            GroupExt::Rol => 0,
            GroupExt::Ror => 1,
            GroupExt::Not => 2,
            GroupExt::Neg => 3,
            GroupExt::Shl | GroupExt::Mul => 4,
            GroupExt::Shr | GroupExt::Imul => 5,
            GroupExt::Div => 6,
            GroupExt::Sar | GroupExt::Idiv => 7,
        }
    }
}

/// Scalar SSE arithmetic selected by the trailing opcode byte.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum SseOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl SseOp {
    fn opcode(self) -> u8 {
        match self {
            SseOp::Add => 0x58,
            SseOp::Sub => 0x5C,
            SseOp::Mul => 0x59,
            SseOp::Div => 0x5E,
        }
    }
}

fn rex_for_bits(bits: u16) -> RexFlags {
    if bits == 64 {
        RexFlags::set_w()
    } else {
        RexFlags::clear_w()
    }
}

// ----------------------------------------------------------------------
// Frame (RBP-relative) loads and stores.

/// `mov [rbp + offset], src` at the given width.
pub fn store_frame(bits: u16, offset: i32, src: Gpr) -> EncodedInst {
    store_indirect(bits, Gpr::RBP, offset, src)
}

/// `mov dst, [rbp + offset]` at the given width.
pub fn load_frame(bits: u16, dst: Gpr, offset: i32) -> EncodedInst {
    load_indirect(bits, dst, Gpr::RBP, offset)
}

/// `lea dst, [rbp + offset]`.
pub fn lea_frame(dst: Gpr, offset: i32) -> EncodedInst {
    let mut sink = EncodedInst::new();
    RexFlags::set_w().emit_two_op(&mut sink, dst.enc(), Gpr::RBP.enc());
    sink.push(0x8D);
    emit_modrm_sib_disp(&mut sink, dst.enc(), Gpr::RBP.enc(), offset);
    sink
}

/// `movzx dst32, byte/word [rbp + offset]`.
pub fn movzx_load_frame(from_bits: u16, dst: Gpr, offset: i32) -> EncodedInst {
    movzx_load_indirect(from_bits, dst, Gpr::RBP, offset)
}

/// `movss`/`movsd` load of `[rbp + offset]` into an SSE register.
pub fn sse_load_frame(bits: u16, dst: Xmm, offset: i32) -> EncodedInst {
    sse_mov_frame(bits, dst.enc(), offset, 0x10)
}

/// `movss`/`movsd` store of an SSE register into `[rbp + offset]`.
pub fn sse_store_frame(bits: u16, offset: i32, src: Xmm) -> EncodedInst {
    sse_mov_frame(bits, src.enc(), offset, 0x11)
}

fn sse_mov_frame(bits: u16, enc_g: u8, offset: i32, opcode: u8) -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(match bits {
        32 => 0xF3,
        64 => 0xF2,
        _ => panic!("invalid SSE scalar width: {bits}"),
    });
    RexFlags::clear_w().emit_two_op(&mut sink, enc_g, Gpr::RBP.enc());
    sink.push(0x0F);
    sink.push(opcode);
    emit_modrm_sib_disp(&mut sink, enc_g, Gpr::RBP.enc(), offset);
    sink
}

// ----------------------------------------------------------------------
// Loads and stores through an arbitrary base register.

/// `mov dst, [base + disp]` at the given width.
pub fn load_indirect(bits: u16, dst: Gpr, base: Gpr, disp: i32) -> EncodedInst {
    let mut sink = EncodedInst::new();
    match bits {
        8 => {
            let rex = RexFlags::clear_w().always_emit_if_8bit_needed(dst.enc());
            rex.emit_two_op(&mut sink, dst.enc(), base.enc());
            sink.push(0x8A);
        }
        16 => {
            sink.push(0x66);
            RexFlags::clear_w().emit_two_op(&mut sink, dst.enc(), base.enc());
            sink.push(0x8B);
        }
        32 | 64 => {
            rex_for_bits(bits).emit_two_op(&mut sink, dst.enc(), base.enc());
            sink.push(0x8B);
        }
        _ => panic!("invalid load width: {bits}"),
    }
    emit_modrm_sib_disp(&mut sink, dst.enc(), base.enc(), disp);
    sink
}

/// `mov [base + disp], src` at the given width.
pub fn store_indirect(bits: u16, base: Gpr, disp: i32, src: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    match bits {
        8 => {
            let rex = RexFlags::clear_w().always_emit_if_8bit_needed(src.enc());
            rex.emit_two_op(&mut sink, src.enc(), base.enc());
            sink.push(0x88);
        }
        16 => {
            sink.push(0x66);
            RexFlags::clear_w().emit_two_op(&mut sink, src.enc(), base.enc());
            sink.push(0x89);
        }
        32 | 64 => {
            rex_for_bits(bits).emit_two_op(&mut sink, src.enc(), base.enc());
            sink.push(0x89);
        }
        _ => panic!("invalid store width: {bits}"),
    }
    emit_modrm_sib_disp(&mut sink, src.enc(), base.enc(), disp);
    sink
}

/// `movzx dst32, byte/word [base + disp]`.
pub fn movzx_load_indirect(from_bits: u16, dst: Gpr, base: Gpr, disp: i32) -> EncodedInst {
    let mut sink = EncodedInst::new();
    RexFlags::clear_w().emit_two_op(&mut sink, dst.enc(), base.enc());
    sink.push(0x0F);
    sink.push(match from_bits {
        8 => 0xB6,
        16 => 0xB7,
        _ => panic!("invalid movzx source width: {from_bits}"),
    });
    emit_modrm_sib_disp(&mut sink, dst.enc(), base.enc(), disp);
    sink
}

// ----------------------------------------------------------------------
// Register-to-register moves.

/// `mov dst, src` in the load form (`8B /r`, destination in the reg field).
pub fn mov_rr(bits: u16, dst: Gpr, src: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    match bits {
        8 => {
            let rex = RexFlags::clear_w()
                .always_emit_if_8bit_needed(dst.enc())
                .always_emit_if_8bit_needed(src.enc());
            rex.emit_two_op(&mut sink, dst.enc(), src.enc());
            sink.push(0x8A);
        }
        16 => {
            sink.push(0x66);
            RexFlags::clear_w().emit_two_op(&mut sink, dst.enc(), src.enc());
            sink.push(0x8B);
        }
        32 | 64 => {
            rex_for_bits(bits).emit_two_op(&mut sink, dst.enc(), src.enc());
            sink.push(0x8B);
        }
        _ => panic!("invalid move width: {bits}"),
    }
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink
}

/// `mov dst, src` in the store form (`89 /r`, source in the reg field).
pub fn mov_rr_store(bits: u16, dst: Gpr, src: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    match bits {
        32 | 64 => {
            rex_for_bits(bits).emit_two_op(&mut sink, src.enc(), dst.enc());
            sink.push(0x89);
        }
        _ => panic!("invalid move width: {bits}"),
    }
    sink.push(encode_modrm(0b11, src.enc() & 7, dst.enc() & 7));
    sink
}

/// `mov reg, imm`. A 64-bit width uses the full `movabs` form; 32 bits and
/// below use `B8+r id`, which zero-extends.
pub fn mov_imm(bits: u16, dst: Gpr, imm: u64) -> EncodedInst {
    let mut sink = EncodedInst::new();
    match bits {
        64 => {
            RexFlags::set_w().emit_one_op(&mut sink, dst.enc());
            sink.push(0xB8 | (dst.enc() & 7));
            sink.extend_from_slice(&imm.to_le_bytes());
        }
        8 | 16 | 32 => {
            RexFlags::clear_w().emit_one_op(&mut sink, dst.enc());
            sink.push(0xB8 | (dst.enc() & 7));
            sink.extend_from_slice(&(imm as u32).to_le_bytes());
        }
        _ => panic!("invalid immediate width: {bits}"),
    }
    sink
}

// ----------------------------------------------------------------------
// ALU operations.

/// `op dst, src` for the two-register ALU group.
pub fn alu_rr(op: AluOp, bits: u16, dst: Gpr, src: Gpr) -> EncodedInst {
    debug_assert!(bits == 32 || bits == 64, "invalid ALU width: {bits}");
    let mut sink = EncodedInst::new();
    rex_for_bits(bits).emit_two_op(&mut sink, dst.enc(), src.enc());
    sink.push(op.opcode());
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink
}

/// `op reg, imm8` via the sign-extending `83 /n ib` form.
pub fn alu_ri8(op: AluOp, bits: u16, reg: Gpr, imm: i8) -> EncodedInst {
    debug_assert!(bits == 32 || bits == 64, "invalid ALU width: {bits}");
    let mut sink = EncodedInst::new();
    rex_for_bits(bits).emit_one_op(&mut sink, reg.enc());
    sink.push(0x83);
    sink.push(encode_modrm(0b11, op.ext(), reg.enc() & 7));
    sink.push(imm as u8);
    sink
}

/// Two-operand `imul dst, src`.
pub fn imul_rr(bits: u16, dst: Gpr, src: Gpr) -> EncodedInst {
    debug_assert!(bits == 32 || bits == 64, "invalid imul width: {bits}");
    let mut sink = EncodedInst::new();
    rex_for_bits(bits).emit_two_op(&mut sink, dst.enc(), src.enc());
    sink.push(0x0F);
    sink.push(0xAF);
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink
}

/// Three-operand `imul dst, src, imm32`.
pub fn imul_rri(dst: Gpr, src: Gpr, imm: i32) -> EncodedInst {
    let mut sink = EncodedInst::new();
    RexFlags::set_w().emit_two_op(&mut sink, dst.enc(), src.enc());
    sink.push(0x69);
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink.extend_from_slice(&imm.to_le_bytes());
    sink
}

/// `test a, a` (or any pair), setting ZF from the bitwise AND.
pub fn test_rr(bits: u16, a: Gpr, b: Gpr) -> EncodedInst {
    debug_assert!(bits == 32 || bits == 64, "invalid test width: {bits}");
    let mut sink = EncodedInst::new();
    rex_for_bits(bits).emit_two_op(&mut sink, b.enc(), a.enc());
    sink.push(0x85);
    sink.push(encode_modrm(0b11, b.enc() & 7, a.enc() & 7));
    sink
}

/// `cqo`: sign-extend RAX into RDX:RAX ahead of `idiv`.
pub fn cqo() -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(0x48);
    sink.push(0x99);
    sink
}

/// The `D3 /n` shift group with the count in CL.
pub fn shift_cl(ext: GroupExt, bits: u16, reg: Gpr) -> EncodedInst {
    debug_assert!(
        matches!(
            ext,
            GroupExt::Rol | GroupExt::Ror | GroupExt::Shl | GroupExt::Shr | GroupExt::Sar
        ),
        "{ext:?} is not a shift"
    );
    debug_assert!(bits == 32 || bits == 64, "invalid shift width: {bits}");
    let mut sink = EncodedInst::new();
    rex_for_bits(bits).emit_one_op(&mut sink, reg.enc());
    sink.push(0xD3);
    sink.push(encode_modrm(0b11, ext.ext(), reg.enc() & 7));
    sink
}

/// The `C1 /n ib` shift group with an immediate count.
pub fn shift_imm(ext: GroupExt, bits: u16, reg: Gpr, count: u8) -> EncodedInst {
    debug_assert!(
        matches!(
            ext,
            GroupExt::Rol | GroupExt::Ror | GroupExt::Shl | GroupExt::Shr | GroupExt::Sar
        ),
        "{ext:?} is not a shift"
    );
    debug_assert!(bits == 32 || bits == 64, "invalid shift width: {bits}");
    debug_assert!(count < 64, "invalid shift count: {count}");
    let mut sink = EncodedInst::new();
    rex_for_bits(bits).emit_one_op(&mut sink, reg.enc());
    sink.push(0xC1);
    sink.push(encode_modrm(0b11, ext.ext(), reg.enc() & 7));
    sink.push(count);
    sink
}

/// The `F7 /n` group: NOT, NEG, MUL, IMUL, DIV, IDIV on one register.
pub fn int_group(ext: GroupExt, bits: u16, reg: Gpr) -> EncodedInst {
    debug_assert!(
        matches!(
            ext,
            GroupExt::Not | GroupExt::Neg | GroupExt::Mul | GroupExt::Imul | GroupExt::Div | GroupExt::Idiv
        ),
        "{ext:?} is not an F7-group operation"
    );
    debug_assert!(bits == 32 || bits == 64, "invalid width: {bits}");
    let mut sink = EncodedInst::new();
    rex_for_bits(bits).emit_one_op(&mut sink, reg.enc());
    sink.push(0xF7);
    sink.push(encode_modrm(0b11, ext.ext(), reg.enc() & 7));
    sink
}

/// `setcc reg8`.
///
/// The REX prefix is always emitted so that SPL/BPL/SIL/DIL are addressed
/// instead of AH/CH/DH/BH; there is deliberately no prefix-free path.
pub fn setcc(cc: u8, reg: Gpr) -> EncodedInst {
    debug_assert!(cc < 16, "invalid condition encoding: {cc}");
    let mut sink = EncodedInst::new();
    RexFlags::clear_w()
        .always_emit()
        .emit_one_op(&mut sink, reg.enc());
    sink.push(0x0F);
    sink.push(0x90 | cc);
    sink.push(encode_modrm(0b11, 0, reg.enc() & 7));
    sink
}

// ----------------------------------------------------------------------
// Width conversions.

/// `movzx dst32, src8/16`. Writing the 32-bit form zero-extends to 64.
pub fn movzx_rr(from_bits: u16, dst: Gpr, src: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    let rex = match from_bits {
        8 => RexFlags::clear_w().always_emit_if_8bit_needed(src.enc()),
        16 => RexFlags::clear_w(),
        _ => panic!("invalid movzx source width: {from_bits}"),
    };
    rex.emit_two_op(&mut sink, dst.enc(), src.enc());
    sink.push(0x0F);
    sink.push(if from_bits == 8 { 0xB6 } else { 0xB7 });
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink
}

/// `movsx dst, src8/16`, at a 32- or 64-bit destination width.
pub fn movsx_rr(from_bits: u16, to_bits: u16, dst: Gpr, src: Gpr) -> EncodedInst {
    debug_assert!(to_bits == 32 || to_bits == 64, "invalid movsx width: {to_bits}");
    let mut sink = EncodedInst::new();
    let rex = match from_bits {
        8 => rex_for_bits(to_bits).always_emit_if_8bit_needed(src.enc()),
        16 => rex_for_bits(to_bits),
        _ => panic!("invalid movsx source width: {from_bits}"),
    };
    rex.emit_two_op(&mut sink, dst.enc(), src.enc());
    sink.push(0x0F);
    sink.push(if from_bits == 8 { 0xBE } else { 0xBF });
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink
}

/// `movsxd dst64, src32`.
pub fn movsxd(dst: Gpr, src: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    RexFlags::set_w().emit_two_op(&mut sink, dst.enc(), src.enc());
    sink.push(0x63);
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink
}

// ----------------------------------------------------------------------
// SSE scalar operations.

/// Scalar SSE arithmetic: `addss`/`subss`/`mulss`/`divss` and the `sd`
/// forms.
pub fn sse_arith(op: SseOp, bits: u16, dst: Xmm, src: Xmm) -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(match bits {
        32 => 0xF3,
        64 => 0xF2,
        _ => panic!("invalid SSE scalar width: {bits}"),
    });
    RexFlags::clear_w().emit_two_op(&mut sink, dst.enc(), src.enc());
    sink.push(0x0F);
    sink.push(op.opcode());
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink
}

/// `comiss`/`comisd a, b`: ordered scalar compare setting EFLAGS.
pub fn comis(bits: u16, a: Xmm, b: Xmm) -> EncodedInst {
    let mut sink = EncodedInst::new();
    match bits {
        32 => {}
        64 => sink.push(0x66),
        _ => panic!("invalid SSE scalar width: {bits}"),
    }
    RexFlags::clear_w().emit_two_op(&mut sink, a.enc(), b.enc());
    sink.push(0x0F);
    sink.push(0x2F);
    sink.push(encode_modrm(0b11, a.enc() & 7, b.enc() & 7));
    sink
}

/// `movq xmm, r64`: a bit-move from a GPR into an SSE register.
pub fn movq_to_xmm(dst: Xmm, src: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(0x66);
    RexFlags::set_w().emit_two_op(&mut sink, dst.enc(), src.enc());
    sink.push(0x0F);
    sink.push(0x6E);
    sink.push(encode_modrm(0b11, dst.enc() & 7, src.enc() & 7));
    sink
}

/// `movq r64, xmm`: a bit-move from an SSE register into a GPR.
pub fn movq_from_xmm(dst: Gpr, src: Xmm) -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(0x66);
    RexFlags::set_w().emit_two_op(&mut sink, src.enc(), dst.enc());
    sink.push(0x0F);
    sink.push(0x7E);
    sink.push(encode_modrm(0b11, src.enc() & 7, dst.enc() & 7));
    sink
}

/// `movss`/`movsd` load of `[base + disp]` into an SSE register.
pub fn sse_load_indirect(bits: u16, dst: Xmm, base: Gpr, disp: i32) -> EncodedInst {
    sse_mov_indirect(bits, dst.enc(), base, disp, 0x10)
}

/// `movss`/`movsd` store of an SSE register into `[base + disp]`.
pub fn sse_store_indirect(bits: u16, base: Gpr, disp: i32, src: Xmm) -> EncodedInst {
    sse_mov_indirect(bits, src.enc(), base, disp, 0x11)
}

fn sse_mov_indirect(bits: u16, enc_g: u8, base: Gpr, disp: i32, opcode: u8) -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(match bits {
        32 => 0xF3,
        64 => 0xF2,
        _ => panic!("invalid SSE scalar width: {bits}"),
    });
    RexFlags::clear_w().emit_two_op(&mut sink, enc_g, base.enc());
    sink.push(0x0F);
    sink.push(opcode);
    emit_modrm_sib_disp(&mut sink, enc_g, base.enc(), disp);
    sink
}

// ----------------------------------------------------------------------
// RIP-relative accesses.

/// `mov dst, [rip + disp32]` with a zero displacement; the final four bytes
/// are patched by a relocation.
pub fn load_rip(bits: u16, dst: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    match bits {
        8 => {
            RexFlags::clear_w().emit_two_op(&mut sink, dst.enc(), 0);
            sink.push(0x8A);
        }
        16 => {
            sink.push(0x66);
            RexFlags::clear_w().emit_two_op(&mut sink, dst.enc(), 0);
            sink.push(0x8B);
        }
        32 | 64 => {
            rex_for_bits(bits).emit_two_op(&mut sink, dst.enc(), 0);
            sink.push(0x8B);
        }
        _ => panic!("invalid load width: {bits}"),
    }
    sink.push(encode_modrm(0b00, dst.enc() & 7, 0b101));
    sink.extend_from_slice(&[0; 4]);
    sink
}

/// `mov [rip + disp32], src` with a zero displacement for later patching.
pub fn store_rip(bits: u16, src: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    match bits {
        8 => {
            let rex = RexFlags::clear_w().always_emit_if_8bit_needed(src.enc());
            rex.emit_two_op(&mut sink, src.enc(), 0);
            sink.push(0x88);
        }
        16 => {
            sink.push(0x66);
            RexFlags::clear_w().emit_two_op(&mut sink, src.enc(), 0);
            sink.push(0x89);
        }
        32 | 64 => {
            rex_for_bits(bits).emit_two_op(&mut sink, src.enc(), 0);
            sink.push(0x89);
        }
        _ => panic!("invalid store width: {bits}"),
    }
    sink.push(encode_modrm(0b00, src.enc() & 7, 0b101));
    sink.extend_from_slice(&[0; 4]);
    sink
}

/// `lea dst, [rip + disp32]` with a zero displacement for later patching.
pub fn lea_rip(dst: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    RexFlags::set_w().emit_two_op(&mut sink, dst.enc(), 0);
    sink.push(0x8D);
    sink.push(encode_modrm(0b00, dst.enc() & 7, 0b101));
    sink.extend_from_slice(&[0; 4]);
    sink
}

// ----------------------------------------------------------------------
// Control flow.

/// `jmp rel32`.
pub fn jmp_rel32(rel: i32) -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(0xE9);
    sink.extend_from_slice(&rel.to_le_bytes());
    sink
}

/// `jcc rel32`.
pub fn jcc_rel32(cc: u8, rel: i32) -> EncodedInst {
    debug_assert!(cc < 16, "invalid condition encoding: {cc}");
    let mut sink = EncodedInst::new();
    sink.push(0x0F);
    sink.push(0x80 | cc);
    sink.extend_from_slice(&rel.to_le_bytes());
    sink
}

/// `call rel32`; the displacement is a relocation placeholder.
pub fn call_rel32() -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(0xE8);
    sink.extend_from_slice(&[0; 4]);
    sink
}

/// `call reg`.
pub fn call_reg(reg: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    RexFlags::clear_w().emit_one_op(&mut sink, reg.enc());
    sink.push(0xFF);
    sink.push(encode_modrm(0b11, 2, reg.enc() & 7));
    sink
}

/// `push reg`.
pub fn push_reg(reg: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    RexFlags::clear_w().emit_one_op(&mut sink, reg.enc());
    sink.push(0x50 | (reg.enc() & 7));
    sink
}

/// `pop reg`.
pub fn pop_reg(reg: Gpr) -> EncodedInst {
    let mut sink = EncodedInst::new();
    RexFlags::clear_w().emit_one_op(&mut sink, reg.enc());
    sink.push(0x58 | (reg.enc() & 7));
    sink
}

/// `ret`.
pub fn ret() -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(0xC3);
    sink
}

/// One-byte `nop`, used for function alignment padding.
pub fn nop() -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(0x90);
    sink
}

/// `sub rsp, imm32`: the frame allocation in a prologue.
pub fn sub_rsp_imm32(bytes: u32) -> EncodedInst {
    let mut sink = EncodedInst::new();
    sink.push(0x48);
    sink.push(0x81);
    sink.push(encode_modrm(0b11, 5, Gpr::RSP.enc()));
    sink.extend_from_slice(&bytes.to_le_bytes());
    sink
}
