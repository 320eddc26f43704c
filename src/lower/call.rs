//! Lowering of calls: direct, indirect, constructor/destructor/virtual
//! dispatch, heap management and the RTTI operations.

use super::CodeGen;
use crate::ir::{Inst, Operand, TypeTag};
use crate::isa::x64::abi::{self, ArgLoc};
use crate::isa::x64::encode;
use crate::isa::x64::{Gpr, Xmm};
use crate::isa::CallConv;
use crate::obj::Reloc;
use crate::result::{CodegenError, CodegenResult};

/// One call argument: its type, width and value operand.
struct CallArg {
    ty: TypeTag,
    bits: u16,
    value: Operand,
}

impl<'a> CodeGen<'a> {
    /// Parse `(ty, bits, value)` triples starting at operand `start`.
    fn parse_args(&self, inst: &Inst, start: usize) -> CodegenResult<Vec<CallArg>> {
        let rest = inst.operands.len().saturating_sub(start);
        if rest % 3 != 0 {
            return Err(CodegenError::malformed(
                inst.opcode,
                start,
                "argument operands must come in (type, bits, value) triples",
            ));
        }
        let mut args = Vec::with_capacity(rest / 3);
        for k in 0..rest / 3 {
            let at = start + k * 3;
            args.push(CallArg {
                ty: inst.type_tag(at)?,
                bits: inst.bits(at + 1)?,
                value: inst.operand(at + 2)?.clone(),
            });
        }
        Ok(args)
    }

    /// Load one argument into a specific integer register (already taken).
    /// Struct arguments pass their address.
    fn load_arg_into_gpr(&mut self, dst: Gpr, arg: &CallArg) -> CodegenResult<()> {
        if arg.ty == TypeTag::Struct {
            let name = arg.value.slot_name().ok_or_else(|| {
                CodegenError::Unsupported("struct argument that is not a variable".into())
            })?;
            let (offset, _) = self.slot_of(&name)?;
            // A pointer or reference receiver already holds the object's
            // address; a stack object passes the slot's address.
            if self.scope()?.reference_at(offset).is_some()
                || self.scope()?.type_of(&name) == Some(TypeTag::Pointer)
            {
                self.buf.emit(encode::load_frame(64, dst, offset));
            } else {
                self.buf.emit(encode::lea_frame(dst, offset));
            }
            return Ok(());
        }
        self.load_operand_into(dst, arg.bits, &arg.value)
    }

    /// Load one argument into a specific SSE register (already taken).
    fn load_arg_into_xmm(&mut self, dst: Xmm, arg: &CallArg) -> CodegenResult<()> {
        match &arg.value {
            Operand::Name(_) | Operand::Temp(_) => {
                let name = arg.value.slot_name().unwrap();
                let (offset, _) = self.slot_of(&name)?;
                if let Some(info) = self.scope()?.reference_at(offset) {
                    let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
                    self.buf.emit(encode::load_frame(64, ptr, offset));
                    self.buf
                        .emit(encode::sse_load_indirect(info.bits, dst, ptr, 0));
                    self.regs.release(ptr);
                } else {
                    self.buf.emit(encode::sse_load_frame(arg.bits, dst, offset));
                }
                Ok(())
            }
            Operand::Float(f) => {
                let pattern = match arg.bits {
                    32 => u64::from((*f as f32).to_bits()),
                    _ => f.to_bits(),
                };
                let gpr = self.regs.allocate_with_spill(&mut self.buf)?;
                self.buf.emit(encode::mov_imm(64, gpr, pattern));
                self.buf.emit(encode::movq_to_xmm(dst, gpr));
                self.regs.release(gpr);
                Ok(())
            }
            other => Err(CodegenError::Unsupported(format!(
                "operand {other} as a floating-point argument"
            ))),
        }
    }

    /// Evaluate and place every argument, returning the registers taken
    /// (to release after the call) and whether any stack pushes happened.
    ///
    /// Stack-bound arguments are pushed in reverse order first; register
    /// arguments load afterwards so no later evaluation can clobber them.
    /// On Windows, pushes displace the shadow space the prologue reserved,
    /// so a fresh 32 bytes are opened below the pushed arguments.
    fn emit_args(&mut self, args: &[CallArg]) -> CodegenResult<(Vec<Gpr>, Vec<Xmm>)> {
        let locs = abi::classify_args(self.call_conv, args.iter().map(|a| a.ty.is_float()));

        let mut pushed = 0u32;
        for (arg, loc) in args.iter().zip(&locs).rev() {
            if !matches!(loc, ArgLoc::Stack(_)) {
                continue;
            }
            let scratch = self.regs.allocate_with_spill(&mut self.buf)?;
            if arg.ty.is_float() {
                // Push the bit pattern; the callee reads it from memory.
                match &arg.value {
                    Operand::Float(f) => {
                        let pattern = match arg.bits {
                            32 => u64::from((*f as f32).to_bits()),
                            _ => f.to_bits(),
                        };
                        self.buf.emit(encode::mov_imm(64, scratch, pattern));
                    }
                    _ => self.load_operand_into(scratch, arg.bits, &arg.value)?,
                }
            } else {
                self.load_arg_into_gpr(scratch, arg)?;
            }
            self.buf.emit(encode::push_reg(scratch));
            self.regs.release(scratch);
            pushed += 1;
        }

        let mut taken_gprs = Vec::new();
        let mut taken_xmms = Vec::new();
        for (arg, loc) in args.iter().zip(&locs) {
            match loc {
                ArgLoc::Gpr(reg) => {
                    self.regs.take(*reg, &mut self.buf)?;
                    taken_gprs.push(*reg);
                    self.load_arg_into_gpr(*reg, arg)?;
                }
                ArgLoc::Xmm(reg) => {
                    self.regs.take_xmm(*reg, &mut self.buf)?;
                    taken_xmms.push(*reg);
                    self.load_arg_into_xmm(*reg, arg)?;
                }
                ArgLoc::Stack(_) => {}
            }
        }

        if pushed > 0 && self.call_conv == CallConv::WindowsFastcall {
            self.buf
                .emit(encode::sub_rsp_imm32(self.call_conv.shadow_space()));
        }
        Ok((taken_gprs, taken_xmms))
    }

    fn release_arg_regs(&mut self, gprs: Vec<Gpr>, xmms: Vec<Xmm>) {
        for reg in gprs {
            self.regs.release(reg);
        }
        for reg in xmms {
            self.regs.release_xmm(reg);
        }
    }

    /// Store a call's return value to the result slot: RAX for integers
    /// and pointers, XMM0 for floats.
    fn store_call_result(
        &mut self,
        result: &Operand,
        ret_ty: TypeTag,
        ret_bits: u16,
    ) -> CodegenResult<()> {
        if ret_ty == TypeTag::Void || ret_bits == 0 {
            return Ok(());
        }
        if ret_ty.is_float() {
            let name = result.slot_name().ok_or_else(|| {
                CodegenError::InconsistentState("call result operand is not a slot".into())
            })?;
            let (offset, _) = self.slot_of(&name)?;
            self.regs.unbind_offset(offset);
            self.buf
                .emit(encode::sse_store_frame(ret_bits, offset, Xmm::XMM0));
            return Ok(());
        }
        self.store_result(result, Gpr::RAX, ret_bits)
    }

    /// Direct call shape:
    /// `result, callee, ret_ty, ret_bits, (ty, bits, value)*`.
    pub(super) fn lower_function_call(&mut self, inst: &Inst) -> CodegenResult<()> {
        let result = inst.operand(0)?.clone();
        let callee = inst.name(1)?.to_string();
        let ret_ty = inst.type_tag(2)?;
        let ret_bits = inst.bits(3)?;
        let args = self.parse_args(inst, 4)?;

        self.regs.flush_dirty(&mut self.buf);
        let (gprs, xmms) = self.emit_args(&args)?;
        let symbol = self.symbol_for(&callee);
        self.emit_call_symbol(&symbol);
        self.release_arg_regs(gprs, xmms);
        self.store_call_result(&result, ret_ty, ret_bits)?;
        self.regs.invalidate_caller_saved(self.call_conv);
        Ok(())
    }

    /// The hidden `this` argument for member-function dispatch: the
    /// object's address for a stack object, or the stored pointer when the
    /// receiver is itself a pointer or reference.
    fn this_arg(&self, object: &str) -> CallArg {
        CallArg {
            ty: TypeTag::Struct,
            bits: 64,
            value: Operand::Name(object.to_string()),
        }
    }

    /// Constructor call shape: `ctor, object, (ty, bits, value)*`.
    pub(super) fn lower_constructor_call(&mut self, inst: &Inst) -> CodegenResult<()> {
        let ctor = inst.name(0)?.to_string();
        let object = inst.slot(1)?;
        let mut args = vec![self.this_arg(&object)];
        args.extend(self.parse_args(inst, 2)?);

        self.regs.flush_dirty(&mut self.buf);
        let (gprs, xmms) = self.emit_args(&args)?;
        let symbol = self.symbol_for(&ctor);
        self.emit_call_symbol(&symbol);
        self.release_arg_regs(gprs, xmms);
        self.regs.invalidate_caller_saved(self.call_conv);
        Ok(())
    }

    /// Destructor call shape: `dtor, object`.
    pub(super) fn lower_destructor_call(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(2)?;
        let dtor = inst.name(0)?.to_string();
        let object = inst.slot(1)?;
        let args = vec![self.this_arg(&object)];

        self.regs.flush_dirty(&mut self.buf);
        let (gprs, xmms) = self.emit_args(&args)?;
        let symbol = self.symbol_for(&dtor);
        self.emit_call_symbol(&symbol);
        self.release_arg_regs(gprs, xmms);
        self.regs.invalidate_caller_saved(self.call_conv);
        Ok(())
    }

    /// Virtual call shape:
    /// `result, object, vtable_index, ret_ty, ret_bits, (ty, bits, value)*`.
    ///
    /// The vtable pointer is the object's first word; the entry at
    /// `vtable_index * 8` is the function pointer, which rides in RAX
    /// through the argument setup.
    pub(super) fn lower_virtual_call(&mut self, inst: &Inst) -> CodegenResult<()> {
        let result = inst.operand(0)?.clone();
        let object = inst.slot(1)?;
        let vtable_index = inst.int(2)?;
        let ret_ty = inst.type_tag(3)?;
        let ret_bits = inst.bits(4)?;
        let mut args = vec![self.this_arg(&object)];
        args.extend(self.parse_args(inst, 5)?);

        self.regs.flush_dirty(&mut self.buf);
        self.regs.take(Gpr::RAX, &mut self.buf)?;
        let (offset, _) = self.slot_of(&object)?;
        let indirect = self.scope()?.reference_at(offset).is_some()
            || self.scope()?.type_of(&object) == Some(TypeTag::Pointer);
        if indirect {
            self.buf.emit(encode::load_frame(64, Gpr::RAX, offset));
            self.buf.emit(encode::load_indirect(64, Gpr::RAX, Gpr::RAX, 0));
        } else {
            self.buf.emit(encode::load_frame(64, Gpr::RAX, offset));
        }
        self.buf.emit(encode::load_indirect(
            64,
            Gpr::RAX,
            Gpr::RAX,
            (vtable_index * 8) as i32,
        ));

        let (gprs, xmms) = self.emit_args(&args)?;
        self.buf.emit(encode::call_reg(Gpr::RAX));
        self.regs.release(Gpr::RAX);
        self.release_arg_regs(gprs, xmms);
        self.store_call_result(&result, ret_ty, ret_bits)?;
        self.regs.invalidate_caller_saved(self.call_conv);
        Ok(())
    }

    /// Heap allocation shape: `result, size_bytes`; lowers to
    /// `malloc(size)`.
    pub(super) fn lower_heap_alloc(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(2)?;
        let result = inst.operand(0)?.clone();
        let size = inst.int(1)?;

        self.regs.flush_dirty(&mut self.buf);
        let arg = abi::int_arg_regs(self.call_conv)[0];
        self.regs.take(arg, &mut self.buf)?;
        self.buf.emit(encode::mov_imm(64, arg, size as u64));
        let symbol = self.symbol_for("malloc");
        self.emit_call_symbol(&symbol);
        self.regs.release(arg);
        self.store_result(&result, Gpr::RAX, 64)?;
        self.regs.invalidate_caller_saved(self.call_conv);
        Ok(())
    }

    /// Array heap allocation shape: `result, elem_size_bytes, count`; the
    /// byte count is `count * elem_size`, multiplied inline.
    pub(super) fn lower_heap_alloc_array(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(3)?;
        let result = inst.operand(0)?.clone();
        let elem_size = inst.int(1)?;
        let count = inst.operand(2)?.clone();

        self.regs.flush_dirty(&mut self.buf);
        let arg = abi::int_arg_regs(self.call_conv)[0];
        self.regs.take(arg, &mut self.buf)?;
        self.load_operand_into(arg, 64, &count)?;
        self.buf.emit(encode::imul_rri(arg, arg, elem_size as i32));
        let symbol = self.symbol_for("malloc");
        self.emit_call_symbol(&symbol);
        self.regs.release(arg);
        self.store_result(&result, Gpr::RAX, 64)?;
        self.regs.invalidate_caller_saved(self.call_conv);
        Ok(())
    }

    /// Heap free shape: `pointer`; lowers to `free(ptr)`.
    ///
    /// The array form takes the same path. TODO: run element destructors
    /// for non-POD element types before freeing an array.
    pub(super) fn lower_heap_free(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(1)?;
        let pointer = inst.operand(0)?.clone();

        self.regs.flush_dirty(&mut self.buf);
        let arg = abi::int_arg_regs(self.call_conv)[0];
        self.regs.take(arg, &mut self.buf)?;
        self.load_operand_into(arg, 64, &pointer)?;
        let symbol = self.symbol_for("free");
        self.emit_call_symbol(&symbol);
        self.regs.release(arg);
        self.regs.invalidate_caller_saved(self.call_conv);
        Ok(())
    }

    /// Placement new shape: `result, address`. No allocation happens; the
    /// result is the provided address.
    pub(super) fn lower_placement_new(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(2)?;
        let result = inst.operand(0)?.clone();
        let address = inst.operand(1)?.clone();
        let v = self.read_int_operand(64, &address)?;
        self.store_result(&result, v.reg, 64)?;
        self.release_op(v);
        Ok(())
    }

    /// Typeid shape: `result, ty`. The result points at an interned name
    /// of the type in `.rdata`.
    pub(super) fn lower_typeid(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(2)?;
        let result = inst.operand(0)?.clone();
        let ty = inst.type_tag(1)?;

        let symbol = self.writer.add_string_literal(&ty.to_string());
        let reg = self.regs.allocate_with_spill(&mut self.buf)?;
        self.buf.emit(encode::lea_rip(reg));
        let at = self.buf.offset() - 4;
        self.writer.add_relocation(at, &symbol, Reloc::Rel32);
        self.store_result(&result, reg, 64)?;
        self.regs.release(reg);
        Ok(())
    }

    /// Dynamic cast shape: `result, target_ty, value`.
    ///
    /// Lowers as an identity move of the pointer. TODO: call a runtime
    /// helper that consults RTTI and produces null on a failed downcast.
    pub(super) fn lower_dynamic_cast(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(3)?;
        let result = inst.operand(0)?.clone();
        let value = inst.operand(2)?.clone();
        let v = self.read_int_operand(64, &value)?;
        self.store_result(&result, v.reg, 64)?;
        self.release_op(v);
        Ok(())
    }

    /// Function address shape: `result, function`.
    pub(super) fn lower_function_address(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(2)?;
        let result = inst.operand(0)?.clone();
        let func = inst.name(1)?.to_string();

        let symbol = self.symbol_for(&func);
        let reg = self.regs.allocate_with_spill(&mut self.buf)?;
        self.buf.emit(encode::lea_rip(reg));
        let at = self.buf.offset() - 4;
        self.writer.add_relocation(at, &symbol, Reloc::Rel32);
        self.store_result(&result, reg, 64)?;
        self.regs.release(reg);
        Ok(())
    }

    /// Indirect call shape:
    /// `result, pointer, ret_ty, ret_bits, (ty, bits, value)*`. The
    /// function pointer rides in RAX through the argument setup.
    pub(super) fn lower_indirect_call(&mut self, inst: &Inst) -> CodegenResult<()> {
        let result = inst.operand(0)?.clone();
        let pointer = inst.operand(1)?.clone();
        let ret_ty = inst.type_tag(2)?;
        let ret_bits = inst.bits(3)?;
        let args = self.parse_args(inst, 4)?;

        self.regs.flush_dirty(&mut self.buf);
        self.regs.take(Gpr::RAX, &mut self.buf)?;
        self.load_operand_into(Gpr::RAX, 64, &pointer)?;
        let (gprs, xmms) = self.emit_args(&args)?;
        self.buf.emit(encode::call_reg(Gpr::RAX));
        self.regs.release(Gpr::RAX);
        self.release_arg_regs(gprs, xmms);
        self.store_call_result(&result, ret_ty, ret_bits)?;
        self.regs.invalidate_caller_saved(self.call_conv);
        Ok(())
    }
}
