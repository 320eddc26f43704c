//! Lowering of arithmetic, comparison, unary, compound-assignment and
//! increment/decrement instructions.

use super::{CodeGen, OpReg};
use crate::ir::condcodes::{FloatCC, IntCC};
use crate::ir::{Inst, Opcode, Operand, TypeTag};
use crate::isa::x64::encode::{self, AluOp, GroupExt, SseOp};
use crate::isa::x64::Gpr;
use crate::result::{CodegenError, CodegenResult};

/// ALU width for a declared operand width: 8- and 16-bit values are
/// widened on load, so their arithmetic happens at 32 bits.
fn alu_bits(bits: u16) -> u16 {
    if bits == 64 {
        64
    } else {
        32
    }
}

fn int_cc(opcode: Opcode) -> Option<IntCC> {
    use Opcode::*;
    Some(match opcode {
        Equal => IntCC::Equal,
        NotEqual => IntCC::NotEqual,
        LessThan => IntCC::SignedLessThan,
        LessEqual => IntCC::SignedLessThanOrEqual,
        GreaterThan => IntCC::SignedGreaterThan,
        GreaterEqual => IntCC::SignedGreaterThanOrEqual,
        Below => IntCC::UnsignedLessThan,
        BelowEqual => IntCC::UnsignedLessThanOrEqual,
        Above => IntCC::UnsignedGreaterThan,
        AboveEqual => IntCC::UnsignedGreaterThanOrEqual,
        _ => return None,
    })
}

fn float_cc(opcode: Opcode) -> Option<FloatCC> {
    use Opcode::*;
    Some(match opcode {
        FloatEqual => FloatCC::Equal,
        FloatNotEqual => FloatCC::NotEqual,
        FloatLessThan => FloatCC::LessThan,
        FloatLessEqual => FloatCC::LessThanOrEqual,
        FloatGreaterThan => FloatCC::GreaterThan,
        FloatGreaterEqual => FloatCC::GreaterThanOrEqual,
        _ => return None,
    })
}

fn simple_alu_op(opcode: Opcode) -> Option<AluOp> {
    use Opcode::*;
    Some(match opcode {
        Add => AluOp::Add,
        Sub => AluOp::Sub,
        BitwiseAnd => AluOp::And,
        BitwiseOr => AluOp::Or,
        BitwiseXor => AluOp::Xor,
        _ => return None,
    })
}

fn shift_ext(opcode: Opcode) -> Option<GroupExt> {
    use Opcode::*;
    Some(match opcode {
        ShiftLeft => GroupExt::Shl,
        ShiftRight => GroupExt::Sar,
        UnsignedShiftRight => GroupExt::Shr,
        _ => return None,
    })
}

fn sse_op(opcode: Opcode) -> Option<SseOp> {
    use Opcode::*;
    Some(match opcode {
        FloatAdd => SseOp::Add,
        FloatSub => SseOp::Sub,
        FloatMul => SseOp::Mul,
        FloatDiv => SseOp::Div,
        _ => return None,
    })
}

impl<'a> CodeGen<'a> {
    /// The seven-operand arithmetic/comparison shape:
    /// `result, lhs_ty, lhs_bits, lhs, rhs_ty, rhs_bits, rhs`.
    pub(super) fn lower_binary(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(7)?;
        let result = inst.operand(0)?.clone();
        let lhs_ty = inst.type_tag(1)?;
        let bits = inst.bits(2)?;
        let lhs = inst.operand(3)?.clone();
        let rhs_bits = inst.bits(5)?;
        let rhs = inst.operand(6)?.clone();

        use Opcode::*;
        match inst.opcode {
            FloatAdd | FloatSub | FloatMul | FloatDiv => {
                let op = sse_op(inst.opcode).unwrap();
                let l = self.clobber_float_operand(bits, &lhs)?;
                let r = self.read_float_operand(rhs_bits, &rhs)?;
                self.buf.emit(encode::sse_arith(op, bits, l.reg, r.reg));
                self.release_op_xmm(r);
                self.bind_result_xmm(&result, l.reg)
            }
            FloatEqual | FloatNotEqual | FloatLessThan | FloatLessEqual | FloatGreaterThan
            | FloatGreaterEqual => self.lower_float_compare(inst, &result, bits, &lhs, &rhs),
            Div | UnsignedDiv | Mod | UnsignedMod => {
                self.lower_divide(inst.opcode, &result, lhs_ty, bits, &lhs, &rhs)
            }
            ShiftLeft | ShiftRight | UnsignedShiftRight => {
                self.lower_shift(inst.opcode, &result, bits, &lhs, &rhs)
            }
            Mul => {
                let l = self.clobber_int_operand(bits, &lhs)?;
                let r = self.read_int_operand(rhs_bits, &rhs)?;
                self.buf.emit(encode::imul_rr(alu_bits(bits), l.reg, r.reg));
                self.release_op(r);
                self.bind_result(&result, l.reg)
            }
            op if int_cc(op).is_some() => self.lower_int_compare(inst, &result, bits, &lhs, &rhs),
            op => {
                let alu = simple_alu_op(op).ok_or_else(|| {
                    CodegenError::Unsupported(format!("binary opcode {op}"))
                })?;
                let l = self.clobber_int_operand(bits, &lhs)?;
                let r = self.read_int_operand(rhs_bits, &rhs)?;
                self.buf.emit(encode::alu_rr(alu, alu_bits(bits), l.reg, r.reg));
                self.release_op(r);
                self.bind_result(&result, l.reg)
            }
        }
    }

    fn lower_int_compare(
        &mut self,
        inst: &Inst,
        result: &Operand,
        bits: u16,
        lhs: &Operand,
        rhs: &Operand,
    ) -> CodegenResult<()> {
        let cc = int_cc(inst.opcode).unwrap();
        let l = self.clobber_int_operand(bits, lhs)?;
        let r = self.read_int_operand(inst.bits(5)?, rhs)?;
        self.buf
            .emit(encode::alu_rr(AluOp::Cmp, alu_bits(bits), l.reg, r.reg));
        self.release_op(r);
        // Materialize the flag: byte-wide SETcc, widened to the full
        // register.
        self.buf.emit(encode::setcc(cc.enc(), l.reg));
        self.buf.emit(encode::movzx_rr(8, l.reg, l.reg));
        self.bind_result(result, l.reg)
    }

    fn lower_float_compare(
        &mut self,
        inst: &Inst,
        result: &Operand,
        bits: u16,
        lhs: &Operand,
        rhs: &Operand,
    ) -> CodegenResult<()> {
        let cc = float_cc(inst.opcode).unwrap();
        let l = self.read_float_operand(bits, lhs)?;
        let r = self.read_float_operand(inst.bits(5)?, rhs)?;
        self.buf.emit(encode::comis(bits, l.reg, r.reg));
        self.release_op_xmm(r);
        self.release_op_xmm(l);
        let flag = self.regs.allocate_with_spill(&mut self.buf)?;
        self.buf.emit(encode::setcc(cc.enc(), flag));
        self.buf.emit(encode::movzx_rr(8, flag, flag));
        self.bind_result(result, flag)
    }

    /// Integer division and remainder through the fixed RAX/RDX pair.
    fn lower_divide(
        &mut self,
        opcode: Opcode,
        result: &Operand,
        ty: TypeTag,
        bits: u16,
        lhs: &Operand,
        rhs: &Operand,
    ) -> CodegenResult<()> {
        let signed = matches!(opcode, Opcode::Div | Opcode::Mod) && !ty.is_unsigned();

        // RDX is clobbered by the sign extension, so nothing cached may
        // survive in registers.
        self.regs.flush_dirty(&mut self.buf);
        self.regs.take(Gpr::RAX, &mut self.buf)?;
        self.regs.take(Gpr::RDX, &mut self.buf)?;

        self.load_operand_into(Gpr::RAX, bits, lhs)?;
        if signed {
            self.sign_extend_to_64(Gpr::RAX, bits);
        }
        let divisor = self.clobber_int_operand(bits, rhs)?;
        if signed {
            self.sign_extend_to_64(divisor.reg, bits);
            self.buf.emit(encode::cqo());
            self.buf.emit(encode::int_group(GroupExt::Idiv, 64, divisor.reg));
        } else {
            self.buf
                .emit(encode::alu_rr(AluOp::Xor, 32, Gpr::RDX, Gpr::RDX));
            self.buf.emit(encode::int_group(GroupExt::Div, 64, divisor.reg));
        }
        self.release_op(divisor);

        let out = match opcode {
            Opcode::Div | Opcode::UnsignedDiv => Gpr::RAX,
            _ => Gpr::RDX,
        };
        self.store_result(result, out, bits)?;
        self.regs.release(Gpr::RAX);
        self.regs.release(Gpr::RDX);
        Ok(())
    }

    /// Widen a signed value of `bits` width to the full register. Narrow
    /// values arrive zero-extended (loads and 32-bit immediates both
    /// zero-fill the upper bits), which would corrupt a 64-bit signed
    /// division.
    fn sign_extend_to_64(&mut self, reg: Gpr, bits: u16) {
        match bits {
            8 | 16 => self.buf.emit(encode::movsx_rr(bits, 64, reg, reg)),
            32 => self.buf.emit(encode::movsxd(reg, reg)),
            _ => {}
        }
    }

    /// Shifts take their count in CL.
    fn lower_shift(
        &mut self,
        opcode: Opcode,
        result: &Operand,
        bits: u16,
        lhs: &Operand,
        rhs: &Operand,
    ) -> CodegenResult<()> {
        let ext = shift_ext(opcode).unwrap();
        self.regs.take(Gpr::RCX, &mut self.buf)?;
        let l = self.clobber_int_operand(bits, lhs)?;
        self.load_operand_into(Gpr::RCX, bits, rhs)?;
        self.buf.emit(encode::shift_cl(ext, alu_bits(bits), l.reg));
        self.regs.release(Gpr::RCX);
        self.bind_result(result, l.reg)
    }

    /// Unary shape: `result, ty, bits, value`.
    pub(super) fn lower_unary(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(4)?;
        let result = inst.operand(0)?.clone();
        let ty = inst.type_tag(1)?;
        let bits = inst.bits(2)?;
        let value = inst.operand(3)?.clone();

        match inst.opcode {
            Opcode::LogicalNot => {
                let v = self.clobber_int_operand(bits, &value)?;
                self.buf
                    .emit(encode::alu_ri8(AluOp::Cmp, alu_bits(bits), v.reg, 0));
                self.buf.emit(encode::setcc(IntCC::Equal.enc(), v.reg));
                self.buf.emit(encode::movzx_rr(8, v.reg, v.reg));
                self.bind_result(&result, v.reg)
            }
            Opcode::BitwiseNot => {
                let v = self.clobber_int_operand(bits, &value)?;
                self.buf
                    .emit(encode::int_group(GroupExt::Not, alu_bits(bits), v.reg));
                self.bind_result(&result, v.reg)
            }
            Opcode::Negate if ty.is_float() => {
                // 0.0 - x; SSE has no scalar negate.
                let zero = self.load_float_imm(bits, 0.0)?;
                let v = self.read_float_operand(bits, &value)?;
                self.buf
                    .emit(encode::sse_arith(SseOp::Sub, bits, zero.reg, v.reg));
                self.release_op_xmm(v);
                self.bind_result_xmm(&result, zero.reg)
            }
            Opcode::Negate => {
                let v = self.clobber_int_operand(bits, &value)?;
                self.buf
                    .emit(encode::int_group(GroupExt::Neg, alu_bits(bits), v.reg));
                self.bind_result(&result, v.reg)
            }
            op => Err(CodegenError::Unsupported(format!("unary opcode {op}"))),
        }
    }

    /// Compound assignment shape: `dest, ty, bits, rhs`. The destination
    /// is loaded, combined and stored back in place.
    pub(super) fn lower_compound_assign(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(4)?;
        let dest = inst.slot(0)?;
        let ty = inst.type_tag(1)?;
        let bits = inst.bits(2)?;
        let rhs = inst.operand(3)?.clone();
        let (offset, _) = self.slot_of(&dest)?;
        let reference = self.scope()?.reference_at(offset);

        use Opcode::*;
        if ty.is_float() {
            let op = match inst.opcode {
                AddAssign => SseOp::Add,
                SubAssign => SseOp::Sub,
                MulAssign => SseOp::Mul,
                DivAssign => SseOp::Div,
                op => {
                    return Err(CodegenError::Unsupported(format!(
                        "{op} on a floating-point destination"
                    )))
                }
            };
            let r = self.read_float_operand(bits, &rhs)?;
            if let Some(info) = reference {
                let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
                self.buf.emit(encode::load_frame(64, ptr, offset));
                let acc = self.regs.allocate_xmm_with_spill(&mut self.buf)?;
                self.buf.emit(encode::sse_load_indirect(info.bits, acc, ptr, 0));
                self.buf.emit(encode::sse_arith(op, info.bits, acc, r.reg));
                self.buf
                    .emit(encode::sse_store_indirect(info.bits, ptr, 0, acc));
                self.regs.release_xmm(acc);
                self.regs.release(ptr);
            } else {
                self.regs.flush_offset(offset, &mut self.buf);
                let acc = self.regs.allocate_xmm_with_spill(&mut self.buf)?;
                self.buf.emit(encode::sse_load_frame(bits, acc, offset));
                self.buf.emit(encode::sse_arith(op, bits, acc, r.reg));
                self.buf.emit(encode::sse_store_frame(bits, offset, acc));
                self.regs.release_xmm(acc);
            }
            self.release_op_xmm(r);
            return Ok(());
        }

        // Integer destinations. Divide/modulo route through the fixed
        // register pair like their expression forms.
        match inst.opcode {
            DivAssign | ModAssign => {
                let dest_op = inst.operand(0)?.clone();
                self.regs.flush_dirty(&mut self.buf);
                self.regs.take(Gpr::RAX, &mut self.buf)?;
                self.regs.take(Gpr::RDX, &mut self.buf)?;
                self.load_operand_into(Gpr::RAX, bits, &dest_op)?;
                let signed = !ty.is_unsigned();
                if signed {
                    self.sign_extend_to_64(Gpr::RAX, bits);
                }
                let divisor = self.clobber_int_operand(bits, &rhs)?;
                if signed {
                    self.sign_extend_to_64(divisor.reg, bits);
                    self.buf.emit(encode::cqo());
                    self.buf
                        .emit(encode::int_group(GroupExt::Idiv, 64, divisor.reg));
                } else {
                    self.buf
                        .emit(encode::alu_rr(AluOp::Xor, 32, Gpr::RDX, Gpr::RDX));
                    self.buf
                        .emit(encode::int_group(GroupExt::Div, 64, divisor.reg));
                }
                self.release_op(divisor);
                let out = if inst.opcode == DivAssign {
                    Gpr::RAX
                } else {
                    Gpr::RDX
                };
                self.store_compound_dest(offset, bits, reference, out)?;
                self.regs.release(Gpr::RAX);
                self.regs.release(Gpr::RDX);
                return Ok(());
            }
            ShlAssign | ShrAssign => {
                let ext = if inst.opcode == ShlAssign {
                    GroupExt::Shl
                } else if ty.is_unsigned() {
                    GroupExt::Shr
                } else {
                    GroupExt::Sar
                };
                self.regs.take(Gpr::RCX, &mut self.buf)?;
                let acc = self.load_compound_dest(offset, bits, reference)?;
                self.load_operand_into(Gpr::RCX, bits, &rhs)?;
                self.buf.emit(encode::shift_cl(ext, alu_bits(bits), acc.reg));
                self.regs.release(Gpr::RCX);
                self.store_compound_dest(offset, bits, reference, acc.reg)?;
                self.release_op(acc);
                return Ok(());
            }
            _ => {}
        }

        let acc = self.load_compound_dest(offset, bits, reference)?;
        let r = self.read_int_operand(bits, &rhs)?;
        match inst.opcode {
            AddAssign => self
                .buf
                .emit(encode::alu_rr(AluOp::Add, alu_bits(bits), acc.reg, r.reg)),
            SubAssign => self
                .buf
                .emit(encode::alu_rr(AluOp::Sub, alu_bits(bits), acc.reg, r.reg)),
            AndAssign => self
                .buf
                .emit(encode::alu_rr(AluOp::And, alu_bits(bits), acc.reg, r.reg)),
            OrAssign => self
                .buf
                .emit(encode::alu_rr(AluOp::Or, alu_bits(bits), acc.reg, r.reg)),
            XorAssign => self
                .buf
                .emit(encode::alu_rr(AluOp::Xor, alu_bits(bits), acc.reg, r.reg)),
            MulAssign => self.buf.emit(encode::imul_rr(alu_bits(bits), acc.reg, r.reg)),
            op => return Err(CodegenError::Unsupported(format!("compound assign {op}"))),
        }
        self.release_op(r);
        self.store_compound_dest(offset, bits, reference, acc.reg)?;
        self.release_op(acc);
        Ok(())
    }

    /// Load a compound-assignment destination into a fresh register,
    /// dereferencing a reference slot.
    fn load_compound_dest(
        &mut self,
        offset: i32,
        bits: u16,
        reference: Option<crate::frame::ReferenceInfo>,
    ) -> CodegenResult<OpReg> {
        if reference.is_none() {
            self.regs.flush_offset(offset, &mut self.buf);
        }
        let reg = self.regs.allocate_with_spill(&mut self.buf)?;
        if let Some(info) = reference {
            self.buf.emit(encode::load_frame(64, reg, offset));
            self.emit_load_through(reg, reg, info.bits);
        } else {
            self.emit_slot_load(reg, offset, bits);
        }
        Ok(OpReg { reg, owned: true })
    }

    /// Store a compound-assignment result back to its destination.
    fn store_compound_dest(
        &mut self,
        offset: i32,
        bits: u16,
        reference: Option<crate::frame::ReferenceInfo>,
        src: Gpr,
    ) -> CodegenResult<()> {
        if let Some(info) = reference {
            let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
            self.buf.emit(encode::load_frame(64, ptr, offset));
            self.buf.emit(encode::store_indirect(info.bits, ptr, 0, src));
            self.regs.release(ptr);
        } else {
            self.regs.unbind_offset(offset);
            self.buf.emit(encode::store_frame(bits, offset, src));
        }
        Ok(())
    }

    /// Increment/decrement shape: `result, target, ty, bits`.
    ///
    /// The pre-modification value lands in RAX. Post-forms store RAX to
    /// the result slot before the modification, pre-forms after; the
    /// modified value always goes back to the target's home, which may be
    /// a stack slot, a reference slot or a global.
    pub(super) fn lower_incdec(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(4)?;
        let result = inst.operand(0)?.clone();
        let target = inst.name(1)?.to_string();
        let bits = inst.bits(3)?;
        let post = matches!(inst.opcode, Opcode::PostIncrement | Opcode::PostDecrement);
        let alu = if matches!(inst.opcode, Opcode::PreIncrement | Opcode::PostIncrement) {
            AluOp::Add
        } else {
            AluOp::Sub
        };

        self.regs.take(Gpr::RAX, &mut self.buf)?;

        let in_scope = self
            .scope
            .as_ref()
            .map(|s| s.offset_of(&target).is_ok())
            .unwrap_or(false);
        if in_scope {
            let (offset, _) = self.slot_of(&target)?;
            if let Some(info) = self.scope()?.reference_at(offset) {
                let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
                self.buf.emit(encode::load_frame(64, ptr, offset));
                self.emit_load_through(Gpr::RAX, ptr, info.bits);
                if post {
                    self.store_result(&result, Gpr::RAX, bits)?;
                }
                self.buf.emit(encode::alu_ri8(alu, alu_bits(bits), Gpr::RAX, 1));
                self.buf
                    .emit(encode::store_indirect(info.bits, ptr, 0, Gpr::RAX));
                self.regs.release(ptr);
            } else {
                self.regs.flush_offset(offset, &mut self.buf);
                self.emit_slot_load(Gpr::RAX, offset, bits);
                if post {
                    self.store_result(&result, Gpr::RAX, bits)?;
                }
                self.buf.emit(encode::alu_ri8(alu, alu_bits(bits), Gpr::RAX, 1));
                self.buf.emit(encode::store_frame(bits, offset, Gpr::RAX));
            }
        } else if self.globals.contains_key(&target) {
            let symbol = self.symbol_for(&target);
            self.buf.emit(encode::load_rip(bits, Gpr::RAX));
            self.record_global_reloc(&symbol);
            if post {
                self.store_result(&result, Gpr::RAX, bits)?;
            }
            self.buf.emit(encode::alu_ri8(alu, alu_bits(bits), Gpr::RAX, 1));
            self.buf.emit(encode::store_rip(bits, Gpr::RAX));
            self.record_global_reloc(&symbol);
        } else {
            self.regs.release(Gpr::RAX);
            return Err(CodegenError::UndefinedIdentifier(target));
        }

        if !post {
            self.store_result(&result, Gpr::RAX, bits)?;
        }
        self.regs.release(Gpr::RAX);
        Ok(())
    }
}
