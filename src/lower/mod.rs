//! Lowering of IR instructions to machine code.
//!
//! One handler per opcode, spread over the submodules by subject area. All
//! handlers share the operand-setup and result-writeback helpers defined
//! here: operands are fetched into registers (adopting an existing binding
//! when one caches the slot), references are dereferenced on the way in,
//! and results either bind their register to the result slot (expression
//! results) or store directly (fixed-register and call results).

mod arith;
mod call;
mod control;
mod convert;
mod mem;

use crate::binemit::{BranchTable, CodeBuffer, CodeOffset};
use crate::frame::VariableScope;
use crate::ir::{Inst, Opcode, Operand, TypeTag};
use crate::isa::x64::encode;
use crate::isa::x64::{Gpr, Xmm};
use crate::isa::CallConv;
use crate::obj::{ObjectWriter, Reloc};
use crate::regalloc::RegisterAllocator;
use crate::result::{CodegenError, CodegenResult};
use log::trace;
use rustc_hash::FxHashMap;

/// The innermost enclosing loop's labels, consulted by break/continue.
#[derive(Clone, Debug)]
pub(crate) struct LoopContext {
    pub end_label: String,
    pub increment_label: String,
}

/// A declared global variable.
#[derive(Clone, Debug)]
pub(crate) struct GlobalInfo {
    pub ty: TypeTag,
    pub bits: u16,
}

/// A code site that needs a relocation against a global's symbol. Emitted
/// to the writer only after every global symbol exists.
#[derive(Clone, Debug)]
pub(crate) struct PendingGlobalReloc {
    pub offset: CodeOffset,
    pub symbol: String,
    pub kind: Reloc,
}

/// A general-purpose register holding an operand value.
///
/// `owned` marks scratch registers the handler must release after use;
/// adopted registers still belong to the allocator's binding table.
pub(crate) struct OpReg {
    pub reg: Gpr,
    pub owned: bool,
}

/// An SSE register holding an operand value.
pub(crate) struct OpXmm {
    pub reg: Xmm,
    pub owned: bool,
}

/// All state for lowering one IR stream into one text section.
pub(crate) struct CodeGen<'a> {
    pub buf: CodeBuffer,
    pub regs: RegisterAllocator,
    pub branches: BranchTable,
    pub scope: Option<VariableScope>,
    pub loops: Vec<LoopContext>,
    pub globals: FxHashMap<String, GlobalInfo>,
    pub pending_relocs: Vec<PendingGlobalReloc>,
    pub call_conv: CallConv,
    pub writer: &'a mut dyn ObjectWriter,
    /// Text offset of the current function's first byte.
    pub fn_start: CodeOffset,
    /// Mangled symbol of the current function.
    pub fn_symbol: String,
}

impl<'a> CodeGen<'a> {
    pub fn new(call_conv: CallConv, writer: &'a mut dyn ObjectWriter) -> Self {
        Self {
            buf: CodeBuffer::new(),
            regs: RegisterAllocator::new(),
            branches: BranchTable::new(),
            scope: None,
            loops: Vec::new(),
            globals: FxHashMap::default(),
            pending_relocs: Vec::new(),
            call_conv,
            writer,
            fn_start: 0,
            fn_symbol: String::new(),
        }
    }

    /// Lower one instruction. `FunctionDecl` is consumed by the driver and
    /// never reaches this dispatcher.
    pub fn lower_inst(&mut self, inst: &Inst) -> CodegenResult<()> {
        trace!("lowering {inst}");
        if inst.line != 0 && self.scope.is_some() {
            let offset = self.buf.offset() - self.fn_start;
            self.writer.add_line_mapping(offset, inst.line);
        }
        use Opcode::*;
        match inst.opcode {
            FunctionDecl => Err(CodegenError::InconsistentState(
                "function_decl reached the instruction dispatcher".into(),
            )),

            Add | Sub | Mul | Div | Mod | UnsignedDiv | UnsignedMod | FloatAdd | FloatSub
            | FloatMul | FloatDiv | BitwiseAnd | BitwiseOr | BitwiseXor | ShiftLeft
            | ShiftRight | UnsignedShiftRight | Equal | NotEqual | LessThan | LessEqual
            | GreaterThan | GreaterEqual | Below | BelowEqual | Above | AboveEqual
            | FloatEqual | FloatNotEqual | FloatLessThan | FloatLessEqual | FloatGreaterThan
            | FloatGreaterEqual => self.lower_binary(inst),
            LogicalNot | BitwiseNot | Negate => self.lower_unary(inst),
            AddAssign | SubAssign | MulAssign | DivAssign | ModAssign | AndAssign | OrAssign
            | XorAssign | ShlAssign | ShrAssign => self.lower_compound_assign(inst),
            PreIncrement | PostIncrement | PreDecrement | PostDecrement => self.lower_incdec(inst),

            SignExtend | ZeroExtend | Truncate => self.lower_conversion(inst),

            VariableDecl => self.lower_variable_decl(inst),
            Assignment => self.lower_assignment(inst),
            ArrayAccess => self.lower_array_access(inst),
            ArrayStore => self.lower_array_store(inst),
            MemberAccess => self.lower_member_access(inst),
            MemberStore => self.lower_member_store(inst),
            AddressOf => self.lower_address_of(inst),
            Dereference => self.lower_dereference(inst),
            GlobalVariableDecl => self.lower_global_decl(inst),
            GlobalLoad => self.lower_global_load(inst),
            GlobalStore => self.lower_global_store(inst),
            StringLiteral => self.lower_string_literal(inst),

            FunctionCall => self.lower_function_call(inst),
            ConstructorCall => self.lower_constructor_call(inst),
            DestructorCall => self.lower_destructor_call(inst),
            VirtualCall => self.lower_virtual_call(inst),
            HeapAlloc => self.lower_heap_alloc(inst),
            HeapAllocArray => self.lower_heap_alloc_array(inst),
            HeapFree | HeapFreeArray => self.lower_heap_free(inst),
            PlacementNew => self.lower_placement_new(inst),
            Typeid => self.lower_typeid(inst),
            DynamicCast => self.lower_dynamic_cast(inst),
            FunctionAddress => self.lower_function_address(inst),
            IndirectCall => self.lower_indirect_call(inst),

            Label => self.lower_label(inst),
            Branch => self.lower_branch(inst),
            ConditionalBranch => self.lower_cond_branch(inst),
            LoopBegin => self.lower_loop_begin(inst),
            LoopEnd => self.lower_loop_end(inst),
            Break => self.lower_break(inst),
            Continue => self.lower_continue(inst),
            Return => self.lower_return(inst),
            ScopeBegin | ScopeEnd => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Scope access.

    pub fn scope(&self) -> CodegenResult<&VariableScope> {
        self.scope.as_ref().ok_or_else(|| {
            CodegenError::InconsistentState("instruction outside any function".into())
        })
    }

    /// The slot offset and declared width of a named value.
    pub fn slot_of(&self, name: &str) -> CodegenResult<(i32, u16)> {
        let scope = self.scope()?;
        let offset = scope.offset_of(name)?;
        Ok((offset, scope.bits_of(name)))
    }

    // ------------------------------------------------------------------
    // Operand setup.

    /// Fetch an integer-class operand into a general-purpose register.
    ///
    /// Slots already cached in a register are adopted; other slots are
    /// loaded at `bits` width (zero-extended below 32 bits); reference
    /// slots load the pointer and then the referent; literals load as
    /// immediates. The returned register must not be clobbered unless
    /// `owned` is set; use [`clobber_int_operand`](Self::clobber_int_operand)
    /// for destructive operands.
    pub fn read_int_operand(&mut self, bits: u16, val: &Operand) -> CodegenResult<OpReg> {
        match val {
            Operand::Name(_) | Operand::Temp(_) => {
                let name = val.slot_name().unwrap();
                let (offset, _) = self.slot_of(&name)?;
                if let Some(info) = self.scope()?.reference_at(offset) {
                    let reg = self.regs.allocate_with_spill(&mut self.buf)?;
                    self.buf.emit(encode::load_frame(64, reg, offset));
                    self.emit_load_through(reg, reg, info.bits);
                    return Ok(OpReg { reg, owned: true });
                }
                if let Some(reg) = self.regs.register_for_offset(offset) {
                    return Ok(OpReg { reg, owned: false });
                }
                let reg = self.regs.allocate_with_spill(&mut self.buf)?;
                self.emit_slot_load(reg, offset, bits);
                // The register now mirrors the slot; keep the binding (as
                // clean cache) so further reads of the slot adopt it.
                self.regs.bind_clean(reg, offset, bits);
                Ok(OpReg { reg, owned: false })
            }
            Operand::Int(v) => self.load_imm_scratch(*v as u64),
            Operand::UInt(v) => self.load_imm_scratch(*v),
            Operand::Bool(b) => self.load_imm_scratch(u64::from(*b)),
            Operand::Char(c) => self.load_imm_scratch(u64::from(*c)),
            other => Err(CodegenError::Unsupported(format!(
                "operand {other} in an integer context"
            ))),
        }
    }

    fn load_imm_scratch(&mut self, value: u64) -> CodegenResult<OpReg> {
        let reg = self.regs.allocate_with_spill(&mut self.buf)?;
        self.buf.emit(encode::mov_imm(64, reg, value));
        Ok(OpReg { reg, owned: true })
    }

    /// Like [`read_int_operand`](Self::read_int_operand), but the returned
    /// register is exclusively owned and safe to clobber: an adopted
    /// binding is written back (if dirty) and stolen first.
    pub fn clobber_int_operand(&mut self, bits: u16, val: &Operand) -> CodegenResult<OpReg> {
        let op = self.read_int_operand(bits, val)?;
        if op.owned {
            return Ok(op);
        }
        self.regs.steal(op.reg, &mut self.buf);
        Ok(OpReg {
            reg: op.reg,
            owned: true,
        })
    }

    /// Load a slot value into `reg` at the given width, zero-extending
    /// narrow values.
    fn emit_slot_load(&mut self, reg: Gpr, offset: i32, bits: u16) {
        match bits {
            8 | 16 => self.buf.emit(encode::movzx_load_frame(bits, reg, offset)),
            _ => self.buf.emit(encode::load_frame(bits, reg, offset)),
        }
    }

    /// Load the value behind the pointer in `ptr` into `dst` (which may
    /// alias `ptr`) at the referent width.
    pub fn emit_load_through(&mut self, dst: Gpr, ptr: Gpr, bits: u16) {
        match bits {
            8 | 16 => self.buf.emit(encode::movzx_load_indirect(bits, dst, ptr, 0)),
            _ => self.buf.emit(encode::load_indirect(bits, dst, ptr, 0)),
        }
    }

    /// Load an operand into a specific, already-taken register.
    pub fn load_operand_into(&mut self, dst: Gpr, bits: u16, val: &Operand) -> CodegenResult<()> {
        match val {
            Operand::Name(_) | Operand::Temp(_) => {
                let name = val.slot_name().unwrap();
                let (offset, _) = self.slot_of(&name)?;
                if let Some(info) = self.scope()?.reference_at(offset) {
                    self.buf.emit(encode::load_frame(64, dst, offset));
                    self.emit_load_through(dst, dst, info.bits);
                } else if let Some(reg) = self.regs.register_for_offset(offset) {
                    if reg != dst {
                        self.buf.emit(encode::mov_rr(64, dst, reg));
                    }
                } else {
                    self.emit_slot_load(dst, offset, bits);
                }
                Ok(())
            }
            Operand::Int(v) => {
                self.buf.emit(encode::mov_imm(bits.max(32), dst, *v as u64));
                Ok(())
            }
            Operand::UInt(v) => {
                self.buf.emit(encode::mov_imm(bits.max(32), dst, *v));
                Ok(())
            }
            Operand::Bool(b) => {
                self.buf.emit(encode::mov_imm(32, dst, u64::from(*b)));
                Ok(())
            }
            Operand::Char(c) => {
                self.buf.emit(encode::mov_imm(32, dst, u64::from(*c)));
                Ok(())
            }
            other => Err(CodegenError::Unsupported(format!(
                "operand {other} in an integer context"
            ))),
        }
    }

    /// Fetch a float-class operand into an SSE register.
    pub fn read_float_operand(&mut self, bits: u16, val: &Operand) -> CodegenResult<OpXmm> {
        match val {
            Operand::Name(_) | Operand::Temp(_) => {
                let name = val.slot_name().unwrap();
                let (offset, _) = self.slot_of(&name)?;
                if let Some(info) = self.scope()?.reference_at(offset) {
                    let ptr = self.regs.allocate_with_spill(&mut self.buf)?;
                    self.buf.emit(encode::load_frame(64, ptr, offset));
                    let reg = self.regs.allocate_xmm_with_spill(&mut self.buf)?;
                    self.buf
                        .emit(encode::sse_load_indirect(info.bits, reg, ptr, 0));
                    self.regs.release(ptr);
                    return Ok(OpXmm { reg, owned: true });
                }
                if let Some(reg) = self.regs.xmm_for_offset(offset) {
                    return Ok(OpXmm { reg, owned: false });
                }
                let reg = self.regs.allocate_xmm_with_spill(&mut self.buf)?;
                self.buf.emit(encode::sse_load_frame(bits, reg, offset));
                self.regs.bind_xmm_clean(reg, offset, bits);
                Ok(OpXmm { reg, owned: false })
            }
            Operand::Float(f) => self.load_float_imm(bits, *f),
            Operand::Int(v) => self.load_float_imm(bits, *v as f64),
            Operand::UInt(v) => self.load_float_imm(bits, *v as f64),
            other => Err(CodegenError::Unsupported(format!(
                "operand {other} in a floating-point context"
            ))),
        }
    }

    /// Materialize a float literal: the bit pattern travels through a
    /// temporary GPR and crosses into the SSE file with `movq`.
    fn load_float_imm(&mut self, bits: u16, value: f64) -> CodegenResult<OpXmm> {
        let pattern = match bits {
            32 => u64::from((value as f32).to_bits()),
            64 => value.to_bits(),
            _ => {
                return Err(CodegenError::Unsupported(format!(
                    "{bits}-bit float literal"
                )))
            }
        };
        let gpr = self.regs.allocate_with_spill(&mut self.buf)?;
        self.buf.emit(encode::mov_imm(64, gpr, pattern));
        let reg = self.regs.allocate_xmm_with_spill(&mut self.buf)?;
        self.buf.emit(encode::movq_to_xmm(reg, gpr));
        self.regs.release(gpr);
        Ok(OpXmm { reg, owned: true })
    }

    /// Like [`read_float_operand`](Self::read_float_operand) but safe to
    /// clobber.
    pub fn clobber_float_operand(&mut self, bits: u16, val: &Operand) -> CodegenResult<OpXmm> {
        let op = self.read_float_operand(bits, val)?;
        if op.owned {
            return Ok(op);
        }
        self.regs.steal_xmm(op.reg, &mut self.buf);
        Ok(OpXmm {
            reg: op.reg,
            owned: true,
        })
    }

    // ------------------------------------------------------------------
    // Result writeback.

    /// Bind `reg` as the cached, dirty value of the result slot. The store
    /// to memory happens at the next flush; the binding makes the value
    /// visible to later operand setup.
    pub fn bind_result(&mut self, result: &Operand, reg: Gpr) -> CodegenResult<()> {
        let name = result.slot_name().ok_or_else(|| {
            CodegenError::InconsistentState("result operand is not a slot".into())
        })?;
        let (offset, bits) = self.slot_of(&name)?;
        self.regs.bind(reg, offset, bits);
        Ok(())
    }

    /// Bind an SSE register as the result slot's cached value.
    pub fn bind_result_xmm(&mut self, result: &Operand, reg: Xmm) -> CodegenResult<()> {
        let name = result.slot_name().ok_or_else(|| {
            CodegenError::InconsistentState("result operand is not a slot".into())
        })?;
        let (offset, bits) = self.slot_of(&name)?;
        self.regs.bind_xmm(reg, offset, bits);
        Ok(())
    }

    /// Store `reg` directly to the result slot, dropping any stale binding
    /// of that slot first. Used where the value lives in a fixed register
    /// (division results, call returns) that must not stay bound.
    pub fn store_result(&mut self, result: &Operand, reg: Gpr, bits: u16) -> CodegenResult<()> {
        let name = result.slot_name().ok_or_else(|| {
            CodegenError::InconsistentState("result operand is not a slot".into())
        })?;
        let (offset, _) = self.slot_of(&name)?;
        self.regs.unbind_offset(offset);
        self.buf.emit(encode::store_frame(bits, offset, reg));
        Ok(())
    }

    /// Release an operand register if the handler owns it.
    pub fn release_op(&mut self, op: OpReg) {
        if op.owned {
            self.regs.release(op.reg);
        }
    }

    /// Release an SSE operand register if the handler owns it.
    pub fn release_op_xmm(&mut self, op: OpXmm) {
        if op.owned {
            self.regs.release_xmm(op.reg);
        }
    }

    // ------------------------------------------------------------------
    // Relocation helpers.

    /// Emit `call rel32` against `symbol`, recording the relocation at the
    /// displacement field.
    pub fn emit_call_symbol(&mut self, symbol: &str) {
        self.buf.emit(encode::call_rel32());
        let at = self.buf.offset() - 4;
        self.writer.add_relocation(at, symbol, Reloc::Rel32);
    }

    /// The linker-level name of `name`: the writer's mangling if it has
    /// one, the plain name otherwise (extern "C" and runtime entry
    /// points).
    pub fn symbol_for(&self, name: &str) -> String {
        self.writer
            .mangled_name(name)
            .unwrap_or_else(|| name.to_string())
    }

    /// Record a pending relocation against a global variable's symbol at
    /// the last four bytes emitted.
    pub fn record_global_reloc(&mut self, symbol: &str) {
        self.pending_relocs.push(PendingGlobalReloc {
            offset: self.buf.offset() - 4,
            symbol: symbol.to_string(),
            kind: Reloc::Rel32,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::obj::Linkage;
    use crate::obj::SectionKind;

    struct NullWriter;

    impl ObjectWriter for NullWriter {
        fn add_function_symbol(&mut self, _: &str, _: CodeOffset, _: u32, _: Linkage) {}
        fn update_function_length(&mut self, _: &str, _: u32) {}
        fn add_function_exception_info(&mut self, _: &str, _: CodeOffset, _: u32) {}
        fn add_function_parameter(&mut self, _: &str, _: TypeTag, _: i32) {}
        fn add_local_variable(&mut self, _: &str, _: TypeTag, _: i32) {}
        fn add_line_mapping(&mut self, _: CodeOffset, _: u32) {}
        fn add_string_literal(&mut self, _: &str) -> String {
            "__string_0".to_string()
        }
        fn add_global_variable(&mut self, _: &str, _: u32, _: bool, _: u64) {}
        fn add_relocation(&mut self, _: CodeOffset, _: &str, _: crate::obj::Reloc) {}
        fn add_data(&mut self, _: &[u8], _: SectionKind) {}
        fn mangled_name(&self, _: &str) -> Option<String> {
            None
        }
        fn generate_mangled_name(&mut self, name: &str, _: &str) -> String {
            name.to_string()
        }
        fn write(&mut self, _: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn add_inst() -> Inst {
        Inst::new(
            Opcode::Add,
            vec![
                Operand::Temp(1),
                Operand::Type(TypeTag::I32),
                Operand::Size(32),
                Operand::Int(1),
                Operand::Type(TypeTag::I32),
                Operand::Size(32),
                Operand::Int(2),
            ],
        )
    }

    fn begin(cg: &mut CodeGen, body: &[Inst]) {
        let scope = FrameBuilder::new(CallConv::WindowsFastcall)
            .build(body)
            .unwrap();
        cg.begin_function(&body[0], scope).unwrap();
    }

    fn decl() -> Inst {
        Inst::new(
            Opcode::FunctionDecl,
            vec![
                Operand::Name("f".to_string()),
                Operand::Type(TypeTag::I32),
                Operand::Size(32),
                Operand::Int(0),
            ],
        )
    }

    #[test]
    fn merge_points_drop_all_bindings() {
        let mut writer = NullWriter;
        let mut cg = CodeGen::new(CallConv::WindowsFastcall, &mut writer);
        let body = [decl(), add_inst()];
        begin(&mut cg, &body);
        cg.lower_inst(&body[1]).unwrap();
        assert!(!cg.regs.no_bindings());

        cg.lower_inst(&Inst::new(
            Opcode::Label,
            vec![Operand::Name("merge".to_string())],
        ))
        .unwrap();
        assert!(cg.regs.no_bindings());
        assert!(cg.regs.no_dirty());
    }

    #[test]
    fn no_caller_saved_binding_survives_a_call() {
        let mut writer = NullWriter;
        let mut cg = CodeGen::new(CallConv::WindowsFastcall, &mut writer);
        let call = Inst::new(
            Opcode::FunctionCall,
            vec![
                Operand::Temp(2),
                Operand::Name("g".to_string()),
                Operand::Type(TypeTag::I32),
                Operand::Size(32),
            ],
        );
        let body = [decl(), add_inst(), call];
        begin(&mut cg, &body);
        cg.lower_inst(&body[1]).unwrap();
        cg.lower_inst(&body[2]).unwrap();
        // The pre-call flush plus caller-saved invalidation leave no
        // register claiming to cache a slot.
        assert!(cg.regs.no_bindings());
    }

    #[test]
    fn division_leaves_fixed_registers_free() {
        let mut writer = NullWriter;
        let mut cg = CodeGen::new(CallConv::WindowsFastcall, &mut writer);
        let div = Inst::new(
            Opcode::Div,
            vec![
                Operand::Temp(1),
                Operand::Type(TypeTag::I32),
                Operand::Size(32),
                Operand::Int(-10),
                Operand::Type(TypeTag::I32),
                Operand::Size(32),
                Operand::Int(3),
            ],
        );
        let body = [decl(), div];
        begin(&mut cg, &body);
        cg.lower_inst(&body[1]).unwrap();
        assert!(!cg.regs.is_bound(Gpr::RDX));
        assert!(!cg.regs.is_bound(Gpr::RAX));
        // Both fixed registers went back to the pool.
        assert_eq!(cg.regs.allocate(), Some(Gpr::RAX));
        assert_eq!(cg.regs.allocate(), Some(Gpr::RCX));
    }
}
