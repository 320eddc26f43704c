//! Lowering of width conversions.

use crate::ir::{Inst, Opcode};
use crate::isa::x64::encode;
use crate::result::{CodegenError, CodegenResult};

use super::CodeGen;

impl<'a> CodeGen<'a> {
    /// Conversion shape: `result, ty, to_bits, value, from_bits`.
    pub(super) fn lower_conversion(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(5)?;
        let result = inst.operand(0)?.clone();
        let to_bits = inst.bits(2)?;
        let value = inst.operand(3)?.clone();
        let from_bits = inst.bits(4)?;

        let v = self.clobber_int_operand(from_bits, &value)?;
        match inst.opcode {
            Opcode::SignExtend => match (from_bits, to_bits) {
                (8, 32) | (8, 64) | (16, 32) | (16, 64) => {
                    self.buf
                        .emit(encode::movsx_rr(from_bits, to_bits, v.reg, v.reg));
                }
                (32, 64) => self.buf.emit(encode::movsxd(v.reg, v.reg)),
                (f, t) if f == t => {}
                (f, t) => {
                    self.regs.release(v.reg);
                    return Err(CodegenError::Unsupported(format!(
                        "sign extension from {f} to {t} bits"
                    )));
                }
            },
            Opcode::ZeroExtend => match (from_bits, to_bits) {
                (8, 32) | (8, 64) | (16, 32) | (16, 64) => {
                    self.buf.emit(encode::movzx_rr(from_bits, v.reg, v.reg));
                }
                // A 32-bit register write implicitly zero-extends to 64.
                (32, 64) => self.buf.emit(encode::mov_rr(32, v.reg, v.reg)),
                (f, t) if f == t => {}
                (f, t) => {
                    self.regs.release(v.reg);
                    return Err(CodegenError::Unsupported(format!(
                        "zero extension from {f} to {t} bits"
                    )));
                }
            },
            Opcode::Truncate => {
                // The result slot is only `to_bits` wide; the store at
                // flush time discards the upper bits. Narrow targets are
                // canonicalized in the register so later reads at wider
                // widths see a clean value.
                match to_bits {
                    8 | 16 => self.buf.emit(encode::movzx_rr(to_bits, v.reg, v.reg)),
                    32 => self.buf.emit(encode::mov_rr(32, v.reg, v.reg)),
                    64 => {}
                    t => {
                        self.regs.release(v.reg);
                        return Err(CodegenError::Unsupported(format!(
                            "truncation to {t} bits"
                        )));
                    }
                }
            }
            op => {
                return Err(CodegenError::InconsistentState(format!(
                    "{op} is not a conversion"
                )))
            }
        }
        self.bind_result(&result, v.reg)
    }
}
