//! The conversion driver.
//!
//! [`Context`] owns nothing between calls; [`Context::convert`] walks one
//! IR stream in program order, building each function's frame before any
//! of its code is emitted, dispatching every instruction to its handler,
//! and handing the finished text section plus side tables to the writer.

use crate::frame::FrameBuilder;
use crate::ir::{Inst, Opcode};
use crate::isa::CallConv;
use crate::lower::CodeGen;
use crate::obj::{ObjectWriter, SectionKind};
use crate::result::CodegenResult;
use log::debug;
use target_lexicon::Triple;

/// An IR-to-object-code conversion context.
#[derive(Clone, Debug)]
pub struct Context {
    call_conv: CallConv,
}

impl Context {
    /// A context targeting the host.
    pub fn new() -> Self {
        Self::for_triple(&Triple::host())
    }

    /// A context targeting `triple`.
    pub fn for_triple(triple: &Triple) -> Self {
        Self {
            call_conv: CallConv::for_triple(triple),
        }
    }

    /// A context with an explicit calling convention.
    pub fn with_call_conv(call_conv: CallConv) -> Self {
        Self { call_conv }
    }

    /// The calling convention generated code will follow.
    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    /// Convert `ir` to machine code, hand everything to `writer`, and
    /// finalize the object file at `out_filename`.
    ///
    /// On error nothing is written; the stream is abandoned at the first
    /// failing instruction.
    pub fn convert(
        &self,
        ir: &[Inst],
        writer: &mut dyn ObjectWriter,
        out_filename: &str,
    ) -> CodegenResult<()> {
        let mut cg = CodeGen::new(self.call_conv, writer);
        self.emit(ir, &mut cg)?;

        // Global-variable relocations were deferred until every global
        // symbol exists.
        for reloc in std::mem::take(&mut cg.pending_relocs) {
            cg.writer.add_relocation(reloc.offset, &reloc.symbol, reloc.kind);
        }

        let data = std::mem::take(&mut cg.buf).into_data();
        debug!("emitting {} bytes of text", data.len());
        cg.writer.add_data(&data, SectionKind::Text);
        cg.writer.write(out_filename)?;
        Ok(())
    }

    /// Lower the whole stream: the pre-function preamble (global
    /// declarations), then each function in order.
    fn emit(&self, ir: &[Inst], cg: &mut CodeGen) -> CodegenResult<()> {
        let frames = FrameBuilder::new(self.call_conv);

        let first_fn = ir
            .iter()
            .position(|inst| inst.opcode == Opcode::FunctionDecl)
            .unwrap_or(ir.len());
        for inst in &ir[..first_fn] {
            cg.lower_inst(inst)?;
        }

        let mut at = first_fn;
        while at < ir.len() {
            let end = ir[at + 1..]
                .iter()
                .position(|inst| inst.opcode == Opcode::FunctionDecl)
                .map(|p| at + 1 + p)
                .unwrap_or(ir.len());
            let body = &ir[at..end];

            cg.finish_function()?;
            let scope = frames.build(body)?;
            cg.begin_function(&body[0], scope)?;
            for inst in &body[1..] {
                cg.lower_inst(inst)?;
            }
            at = end;
        }
        cg.finish_function()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
