//! Lowering of memory operations: assignment, aggregate access, address
//! arithmetic, globals and string literals.

use super::{CodeGen, GlobalInfo, OpReg};
use crate::ir::{Inst, Operand, TypeTag};
use crate::isa::x64::encode::{self, AluOp, GroupExt};
use crate::isa::x64::Gpr;
use crate::obj::Reloc;
use crate::result::{CodegenError, CodegenResult};

impl<'a> CodeGen<'a> {
    /// Slots were assigned during frame construction; the declaration only
    /// registers debug information here.
    pub(super) fn lower_variable_decl(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(6)?;
        let name = inst.name(0)?.to_string();
        let ty = inst.type_tag(1)?;
        let offset = self.scope()?.offset_of(&name)?;
        self.writer.add_local_variable(&name, ty, offset);
        Ok(())
    }

    /// Assignment shape: `dest, ty, bits, value`.
    pub(super) fn lower_assignment(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(4)?;
        let dest = inst.slot(0)?;
        let ty = inst.type_tag(1)?;
        let bits = inst.bits(2)?;
        let value = inst.operand(3)?.clone();
        let (offset, _) = self.slot_of(&dest)?;
        let reference = self.scope()?.reference_at(offset);

        if ty.is_float() {
            let v = self.read_float_operand(bits, &value)?;
            if let Some(info) = reference {
                let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
                self.buf.emit(encode::load_frame(64, ptr, offset));
                self.buf
                    .emit(encode::sse_store_indirect(info.bits, ptr, 0, v.reg));
                self.regs.release(ptr);
            } else {
                self.regs.unbind_offset(offset);
                self.buf.emit(encode::sse_store_frame(bits, offset, v.reg));
            }
            self.release_op_xmm(v);
            return Ok(());
        }

        // Structs move as one 64-bit word (small-struct convention), and
        // function pointers are plain 64-bit values.
        let store_bits = match ty {
            TypeTag::Struct | TypeTag::FunctionPointer | TypeTag::Pointer => 64,
            _ => bits,
        };
        let v = self.read_int_operand(store_bits, &value)?;
        if let Some(info) = reference {
            let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
            self.buf.emit(encode::load_frame(64, ptr, offset));
            self.buf
                .emit(encode::store_indirect(info.bits, ptr, 0, v.reg));
            self.regs.release(ptr);
        } else {
            self.regs.unbind_offset(offset);
            self.buf.emit(encode::store_frame(store_bits, offset, v.reg));
        }
        self.release_op(v);
        Ok(())
    }

    /// Compute the address of `base[index]` for elements of `elem_bits`.
    ///
    /// Returns a register holding the base-plus-scaled-index address and a
    /// constant displacement to fold into the access. Constant indices
    /// fold entirely into the displacement; variable indices are scaled in
    /// RCX (by a shift when the element size is a power of two, `imul`
    /// otherwise) and added to the base.
    fn element_address(
        &mut self,
        base: &str,
        elem_bits: u16,
        index: &Operand,
    ) -> CodegenResult<(OpReg, i32)> {
        let elem_size = i32::from(elem_bits / 8).max(1);
        let (base_offset, _) = self.slot_of(base)?;
        let through_pointer = self.scope()?.reference_at(base_offset).is_some()
            || self.scope()?.type_of(base) == Some(TypeTag::Pointer);

        let index_const = match index {
            Operand::Int(v) => Some(*v as i32),
            Operand::UInt(v) => Some(*v as i32),
            Operand::Char(c) => Some(i32::from(*c)),
            _ => None,
        };

        if let Some(idx) = index_const {
            let reg = self.regs.allocate_with_spill(&mut self.buf)?;
            if through_pointer {
                self.buf.emit(encode::load_frame(64, reg, base_offset));
                return Ok((OpReg { reg, owned: true }, idx * elem_size));
            }
            self.buf.emit(encode::lea_frame(reg, base_offset));
            return Ok((OpReg { reg, owned: true }, idx * elem_size));
        }

        // Variable index: scale it in RCX, then add the base address.
        self.regs.take(Gpr::RCX, &mut self.buf)?;
        let index_bits = match index {
            Operand::Name(_) | Operand::Temp(_) => {
                let name = index.slot_name().unwrap();
                self.scope()?.bits_of(&name)
            }
            _ => 64,
        };
        self.load_operand_into(Gpr::RCX, index_bits, index)?;
        if elem_size > 1 {
            if elem_size.count_ones() == 1 {
                let shift = elem_size.trailing_zeros() as u8;
                self.buf
                    .emit(encode::shift_imm(GroupExt::Shl, 64, Gpr::RCX, shift));
            } else {
                self.buf.emit(encode::imul_rri(Gpr::RCX, Gpr::RCX, elem_size));
            }
        }
        let base_reg = self.regs.allocate_with_spill(&mut self.buf)?;
        if through_pointer {
            self.buf.emit(encode::load_frame(64, base_reg, base_offset));
        } else {
            self.buf.emit(encode::lea_frame(base_reg, base_offset));
        }
        self.buf
            .emit(encode::alu_rr(AluOp::Add, 64, Gpr::RCX, base_reg));
        self.regs.release(base_reg);
        Ok((
            OpReg {
                reg: Gpr::RCX,
                owned: true,
            },
            0,
        ))
    }

    /// Array load shape: `result, base, elem_ty, elem_bits, index`.
    pub(super) fn lower_array_access(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(5)?;
        let result = inst.operand(0)?.clone();
        let base = inst.slot(1)?;
        let elem_ty = inst.type_tag(2)?;
        let bits = inst.bits(3)?;
        let index = inst.operand(4)?.clone();

        let (addr, disp) = self.element_address(&base, bits, &index)?;
        if elem_ty.is_float() {
            let dst = self.regs.allocate_xmm_with_spill(&mut self.buf)?;
            self.buf
                .emit(encode::sse_load_indirect(bits, dst, addr.reg, disp));
            self.release_op(addr);
            return self.bind_result_xmm(&result, dst);
        }
        match bits {
            8 | 16 => self
                .buf
                .emit(encode::movzx_load_indirect(bits, addr.reg, addr.reg, disp)),
            _ => self
                .buf
                .emit(encode::load_indirect(bits, addr.reg, addr.reg, disp)),
        }
        self.bind_result(&result, addr.reg)
    }

    /// Array store shape: `base, elem_ty, elem_bits, index, value`.
    pub(super) fn lower_array_store(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(5)?;
        let base = inst.slot(0)?;
        let elem_ty = inst.type_tag(1)?;
        let bits = inst.bits(2)?;
        let index = inst.operand(3)?.clone();
        let value = inst.operand(4)?.clone();

        let (addr, disp) = self.element_address(&base, bits, &index)?;
        if elem_ty.is_float() {
            let v = self.read_float_operand(bits, &value)?;
            self.buf
                .emit(encode::sse_store_indirect(bits, addr.reg, disp, v.reg));
            self.release_op_xmm(v);
        } else {
            let v = self.read_int_operand(bits, &value)?;
            self.buf
                .emit(encode::store_indirect(bits, addr.reg, disp, v.reg));
            self.release_op(v);
        }
        self.release_op(addr);
        Ok(())
    }

    /// Member load shape: `result, base, byte_offset, ty, bits`.
    ///
    /// A struct base addresses directly off the frame; a pointer or
    /// reference base loads the pointer first and addresses through it.
    pub(super) fn lower_member_access(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(5)?;
        let result = inst.operand(0)?.clone();
        let base = inst.slot(1)?;
        let member = inst.int(2)? as i32;
        let ty = inst.type_tag(3)?;
        let bits = inst.bits(4)?;

        let (base_offset, _) = self.slot_of(&base)?;
        let indirect = self.scope()?.reference_at(base_offset).is_some()
            || matches!(
                self.scope()?.type_of(&base),
                Some(TypeTag::Pointer) | Some(TypeTag::Reference) | Some(TypeTag::RvalueReference)
            );

        if ty.is_float() {
            let dst = self.regs.allocate_xmm_with_spill(&mut self.buf)?;
            if indirect {
                let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
                self.buf.emit(encode::load_frame(64, ptr, base_offset));
                self.buf.emit(encode::sse_load_indirect(bits, dst, ptr, member));
                self.regs.release(ptr);
            } else {
                self.buf
                    .emit(encode::sse_load_frame(bits, dst, base_offset + member));
            }
            return self.bind_result_xmm(&result, dst);
        }

        let dst = self.regs.allocate_with_spill(&mut self.buf)?;
        if indirect {
            self.buf.emit(encode::load_frame(64, dst, base_offset));
            match bits {
                8 | 16 => self
                    .buf
                    .emit(encode::movzx_load_indirect(bits, dst, dst, member)),
                _ => self.buf.emit(encode::load_indirect(bits, dst, dst, member)),
            }
        } else {
            self.emit_slot_load(dst, base_offset + member, bits);
        }
        self.bind_result(&result, dst)
    }

    /// Member store shape: `base, byte_offset, ty, bits, value`.
    pub(super) fn lower_member_store(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(5)?;
        let base = inst.slot(0)?;
        let member = inst.int(1)? as i32;
        let ty = inst.type_tag(2)?;
        let bits = inst.bits(3)?;
        let value = inst.operand(4)?.clone();

        let (base_offset, _) = self.slot_of(&base)?;
        let indirect = self.scope()?.reference_at(base_offset).is_some()
            || matches!(
                self.scope()?.type_of(&base),
                Some(TypeTag::Pointer) | Some(TypeTag::Reference) | Some(TypeTag::RvalueReference)
            );

        if ty.is_float() {
            let v = self.read_float_operand(bits, &value)?;
            if indirect {
                let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
                self.buf.emit(encode::load_frame(64, ptr, base_offset));
                self.buf
                    .emit(encode::sse_store_indirect(bits, ptr, member, v.reg));
                self.regs.release(ptr);
            } else {
                self.buf
                    .emit(encode::sse_store_frame(bits, base_offset + member, v.reg));
            }
            self.release_op_xmm(v);
            return Ok(());
        }

        let v = self.read_int_operand(bits, &value)?;
        if indirect {
            let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
            self.buf.emit(encode::load_frame(64, ptr, base_offset));
            self.buf.emit(encode::store_indirect(bits, ptr, member, v.reg));
            self.regs.release(ptr);
        } else {
            self.buf
                .emit(encode::store_frame(bits, base_offset + member, v.reg));
        }
        self.release_op(v);
        Ok(())
    }

    /// Address-of shape: `result, variable`.
    pub(super) fn lower_address_of(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(2)?;
        let result = inst.operand(0)?.clone();
        let var = inst.slot(1)?;
        let (offset, _) = self.slot_of(&var)?;

        let reg = self.regs.allocate_with_spill(&mut self.buf)?;
        if self.scope()?.reference_at(offset).is_some() {
            // The address of a reference's referent is the stored pointer.
            self.buf.emit(encode::load_frame(64, reg, offset));
        } else {
            self.buf.emit(encode::lea_frame(reg, offset));
        }
        self.bind_result(&result, reg)
    }

    /// Dereference shape: `result, ty, bits, pointer`.
    pub(super) fn lower_dereference(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(4)?;
        let result = inst.operand(0)?.clone();
        let ty = inst.type_tag(1)?;
        let bits = inst.bits(2)?;
        let pointer = inst.operand(3)?.clone();

        let ptr = self.clobber_int_operand(64, &pointer)?;
        if ty.is_float() {
            let dst = self.regs.allocate_xmm_with_spill(&mut self.buf)?;
            self.buf.emit(encode::sse_load_indirect(bits, dst, ptr.reg, 0));
            self.release_op(ptr);
            return self.bind_result_xmm(&result, dst);
        }
        self.emit_load_through(ptr.reg, ptr.reg, bits);
        self.bind_result(&result, ptr.reg)
    }

    /// Global declaration shape: `name, ty, bits, initialized, init_value`.
    pub(super) fn lower_global_decl(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(5)?;
        let name = inst.name(0)?.to_string();
        let ty = inst.type_tag(1)?;
        let bits = inst.bits(2)?;
        let initialized = inst.bool(3)?;
        let init = inst.int(4)? as u64;

        self.writer
            .add_global_variable(&name, u32::from(bits / 8).max(1), initialized, init);
        self.globals.insert(name, GlobalInfo { ty, bits });
        Ok(())
    }

    /// Global load shape: `result, global, ty, bits`.
    ///
    /// Globals are addressed RIP-relative; the displacement stays zero
    /// until the deferred relocation list is drained, after the writer has
    /// created every global's symbol.
    pub(super) fn lower_global_load(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(4)?;
        let result = inst.operand(0)?.clone();
        let global = inst.name(1)?.to_string();
        inst.bits(3)?;
        // The declaration is the authority on the global's width.
        let bits = self
            .globals
            .get(&global)
            .ok_or_else(|| CodegenError::UndefinedIdentifier(global.clone()))?
            .bits;

        let symbol = self.symbol_for(&global);
        let reg = self.regs.allocate_with_spill(&mut self.buf)?;
        self.buf.emit(encode::load_rip(bits, reg));
        self.record_global_reloc(&symbol);
        self.store_result(&result, reg, bits)?;
        self.regs.release(reg);
        Ok(())
    }

    /// Global store shape: `global, ty, bits, value`.
    pub(super) fn lower_global_store(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(4)?;
        let global = inst.name(0)?.to_string();
        inst.type_tag(1)?;
        inst.bits(2)?;
        let value = inst.operand(3)?.clone();
        let info = self
            .globals
            .get(&global)
            .ok_or_else(|| CodegenError::UndefinedIdentifier(global.clone()))?
            .clone();
        let bits = info.bits;

        // Float values travel as bit patterns through a GPR; the store
        // itself is an ordinary RIP-relative integer move.
        let v = match &value {
            Operand::Float(f) => {
                debug_assert!(info.ty.is_float());
                let pattern = match bits {
                    32 => u64::from((*f as f32).to_bits()),
                    _ => f.to_bits(),
                };
                self.load_imm_scratch(pattern)?
            }
            _ => self.read_int_operand(bits, &value)?,
        };
        let symbol = self.symbol_for(&global);
        self.buf.emit(encode::store_rip(bits, v.reg));
        self.record_global_reloc(&symbol);
        self.release_op(v);
        Ok(())
    }

    /// String literal shape: `result, contents`. The contents are interned
    /// in `.rdata` and the result holds the symbol's address.
    pub(super) fn lower_string_literal(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(2)?;
        let result = inst.operand(0)?.clone();
        let contents = inst.name(1)?.to_string();

        let symbol = self.writer.add_string_literal(&contents);
        let reg = self.regs.allocate_with_spill(&mut self.buf)?;
        self.buf.emit(encode::lea_rip(reg));
        let at = self.buf.offset() - 4;
        self.writer.add_relocation(at, &symbol, Reloc::Rel32);
        self.store_result(&result, reg, 64)?;
        self.regs.release(reg);
        Ok(())
    }
}
