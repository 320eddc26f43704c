//! Lowering of control flow and the function prologue/epilogue protocol.

use super::{CodeGen, LoopContext};
use crate::frame::VariableScope;
use crate::ir::condcodes::IntCC;
use crate::ir::{Inst, Operand};
use crate::isa::x64::abi::{self, ArgLoc};
use crate::isa::x64::encode;
use crate::isa::x64::{Gpr, Xmm};
use crate::obj::Linkage;
use crate::result::{CodegenError, CodegenResult};
use log::debug;

impl<'a> CodeGen<'a> {
    /// Open a new function: align, declare the symbol, emit the prologue
    /// and home the register-passed parameters.
    ///
    /// The caller must have finalized the previous function first; the
    /// alignment padding emitted here belongs to no function.
    pub fn begin_function(&mut self, decl: &Inst, scope: VariableScope) -> CodegenResult<()> {
        while self.buf.offset() % 16 != 0 {
            self.buf.emit(encode::nop());
        }
        self.fn_start = self.buf.offset();

        let signature = {
            let params: Vec<String> = scope.params.iter().map(|p| p.ty.to_string()).collect();
            format!("{}({})", decl.type_tag(1)?, params.join(","))
        };
        self.fn_symbol = self
            .writer
            .generate_mangled_name(&scope.function, &signature);
        self.writer.add_function_symbol(
            &self.fn_symbol,
            self.fn_start,
            scope.frame_size,
            Linkage::Export,
        );
        for p in &scope.params {
            self.writer.add_function_parameter(&p.name, p.ty, p.offset);
        }
        debug!(
            "function {} at {:#x}, frame {} bytes",
            scope.function, self.fn_start, scope.frame_size
        );

        self.buf.emit(encode::push_reg(Gpr::RBP));
        self.buf.emit(encode::mov_rr(64, Gpr::RBP, Gpr::RSP));
        if scope.frame_size > 0 {
            self.buf.emit(encode::sub_rsp_imm32(scope.frame_size));
        }

        self.regs.reset();
        self.branches.clear();
        self.loops.clear();
        self.home_parameters(&scope);
        self.scope = Some(scope);
        Ok(())
    }

    /// Spill register-passed parameters to their home slots, so the body
    /// can treat every parameter as a stack value.
    ///
    /// The classification is the one frame construction used to assign
    /// the homes; stack-passed parameters already sit in theirs, placed by
    /// the caller.
    fn home_parameters(&mut self, scope: &VariableScope) {
        let locs = abi::classify_args(self.call_conv, scope.params.iter().map(|p| p.ty.is_float()));
        for (param, loc) in scope.params.iter().zip(&locs) {
            match loc {
                ArgLoc::Gpr(reg) => {
                    self.buf.emit(encode::store_frame(64, param.offset, *reg));
                }
                ArgLoc::Xmm(reg) => {
                    self.buf
                        .emit(encode::sse_store_frame(param.bits, param.offset, *reg));
                }
                ArgLoc::Stack(_) => {}
            }
        }
    }

    /// Close the current function: resolve branches and report the final
    /// length and unwind range to the writer.
    pub fn finish_function(&mut self) -> CodegenResult<()> {
        if self.scope.is_none() {
            return Ok(());
        }
        self.branches.patch_all(&mut self.buf)?;
        self.branches.clear();
        let length = self.buf.offset() - self.fn_start;
        let symbol = self.fn_symbol.clone();
        self.writer.update_function_length(&symbol, length);
        self.writer
            .add_function_exception_info(&symbol, self.fn_start, length);
        self.scope = None;
        Ok(())
    }

    /// Label shape: `name`. A merge point: every predecessor must see the
    /// same machine state, so cached values are written back and all
    /// bindings dropped.
    pub(super) fn lower_label(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(1)?;
        let name = inst.name(0)?.to_string();
        self.regs.flush_dirty(&mut self.buf);
        self.regs.reset();
        self.branches.bind_label(&name, self.buf.offset());
        Ok(())
    }

    /// Unconditional branch shape: `target`.
    pub(super) fn lower_branch(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(1)?;
        let target = inst.name(0)?.to_string();
        self.regs.flush_dirty(&mut self.buf);
        self.buf.emit(encode::jmp_rel32(0));
        self.branches.use_label(&target, self.buf.offset() - 4);
        Ok(())
    }

    /// Conditional branch shape: `cond, true_target, false_target`.
    ///
    /// Only the false edge is a jump (`je`, since the condition is tested
    /// against zero); the true target must immediately follow.
    pub(super) fn lower_cond_branch(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(3)?;
        let cond = inst.operand(0)?.clone();
        let false_target = inst.name(2)?.to_string();

        let bits = match &cond {
            Operand::Name(_) | Operand::Temp(_) => {
                let name = cond.slot_name().unwrap();
                self.scope()?.bits_of(&name)
            }
            _ => 32,
        };
        let v = self.read_int_operand(bits, &cond)?;
        self.regs.flush_dirty(&mut self.buf);
        self.buf
            .emit(encode::test_rr(if bits == 64 { 64 } else { 32 }, v.reg, v.reg));
        self.buf.emit(encode::jcc_rel32(IntCC::Equal.enc(), 0));
        self.branches
            .use_label(&false_target, self.buf.offset() - 4);
        self.release_op(v);
        Ok(())
    }

    /// Loop begin shape: `end_label, increment_label`.
    pub(super) fn lower_loop_begin(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(2)?;
        self.loops.push(LoopContext {
            end_label: inst.name(0)?.to_string(),
            increment_label: inst.name(1)?.to_string(),
        });
        Ok(())
    }

    pub(super) fn lower_loop_end(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(0)?;
        self.loops.pop().ok_or_else(|| {
            CodegenError::InconsistentState("loop_end without a matching loop_begin".into())
        })?;
        Ok(())
    }

    pub(super) fn lower_break(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(0)?;
        let target = self
            .loops
            .last()
            .ok_or_else(|| CodegenError::InconsistentState("break outside any loop".into()))?
            .end_label
            .clone();
        self.regs.flush_dirty(&mut self.buf);
        self.buf.emit(encode::jmp_rel32(0));
        self.branches.use_label(&target, self.buf.offset() - 4);
        Ok(())
    }

    pub(super) fn lower_continue(&mut self, inst: &Inst) -> CodegenResult<()> {
        inst.expect_operands(0)?;
        let target = self
            .loops
            .last()
            .ok_or_else(|| CodegenError::InconsistentState("continue outside any loop".into()))?
            .increment_label
            .clone();
        self.regs.flush_dirty(&mut self.buf);
        self.buf.emit(encode::jmp_rel32(0));
        self.branches.use_label(&target, self.buf.offset() - 4);
        Ok(())
    }

    /// Return shape: empty, or `ty, bits, value`.
    ///
    /// The value lands in RAX (XMM0 for floats) and the epilogue follows.
    /// Return is not terminal: lowering continues with the next
    /// instruction, and only the next function declaration (or the end of
    /// the stream) finalizes the function.
    pub(super) fn lower_return(&mut self, inst: &Inst) -> CodegenResult<()> {
        if !inst.operands.is_empty() {
            inst.expect_operands(3)?;
            let ty = inst.type_tag(0)?;
            let bits = inst.bits(1)?;
            let value = inst.operand(2)?.clone();
            // No write-backs: every cached value except the returned one is
            // dead past the epilogue, and the returned one is read from its
            // register when resident.
            if ty.is_float() {
                self.load_return_float(bits, &value)?;
            } else {
                self.load_operand_into(Gpr::RAX, bits, &value)?;
            }
        }
        self.buf.emit(encode::mov_rr_store(64, Gpr::RSP, Gpr::RBP));
        self.buf.emit(encode::pop_reg(Gpr::RBP));
        self.buf.emit(encode::ret());
        // Any code following a return is reached through a label or not at
        // all; the register state cannot be trusted either way.
        self.regs.reset();
        Ok(())
    }

    fn load_return_float(&mut self, bits: u16, value: &Operand) -> CodegenResult<()> {
        match value {
            Operand::Name(_) | Operand::Temp(_) => {
                let name = value.slot_name().unwrap();
                let (offset, _) = self.slot_of(&name)?;
                if let Some(reg) = self.regs.xmm_for_offset(offset) {
                    if reg != Xmm::XMM0 {
                        // Route through memory; there is no binding to
                        // preserve past the epilogue.
                        self.regs.flush_offset(offset, &mut self.buf);
                        self.buf.emit(encode::sse_load_frame(bits, Xmm::XMM0, offset));
                    }
                } else {
                    self.buf.emit(encode::sse_load_frame(bits, Xmm::XMM0, offset));
                }
                Ok(())
            }
            Operand::Float(f) => {
                let pattern = match bits {
                    32 => u64::from((*f as f32).to_bits()),
                    _ => f.to_bits(),
                };
                let gpr = self.regs.allocate_with_spill(&mut self.buf)?;
                self.buf.emit(encode::mov_imm(64, gpr, pattern));
                self.buf.emit(encode::movq_to_xmm(Xmm::XMM0, gpr));
                self.regs.release(gpr);
                Ok(())
            }
            other => Err(CodegenError::Unsupported(format!(
                "operand {other} as a floating-point return value"
            ))),
        }
    }
}
