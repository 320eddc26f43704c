//! The interface to the object-file writer.
//!
//! The writer is an external collaborator: it owns COFF/ELF layout, the
//! symbol table, relocation encoding, name mangling and debug-info
//! containers. The code generator only hands it structured data through
//! [`ObjectWriter`] and never constructs one itself.

use crate::binemit::CodeOffset;
use crate::ir::TypeTag;
use core::fmt;

/// Relocation kinds the code generator produces.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reloc {
    /// 4-byte PC-relative, measured from the end of the field.
    Rel32,
    /// 4-byte absolute (image-relative under COFF).
    Addr32,
    /// 8-byte absolute.
    Addr64,
}

impl fmt::Display for Reloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reloc::Rel32 => write!(f, "Rel32"),
            Reloc::Addr32 => write!(f, "Addr32"),
            Reloc::Addr64 => write!(f, "Addr64"),
        }
    }
}

/// Linkage of a function symbol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Linkage {
    /// Visible to the linker.
    Export,
    /// Local to the translation unit.
    Local,
}

/// Object-file section a data blob lands in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SectionKind {
    /// Executable code.
    Text,
    /// Initialized writable data.
    Data,
    /// Read-only data.
    RData,
    /// Zero-initialized data.
    Bss,
}

/// Capabilities the code generator consumes from the object-file writer.
///
/// Offsets are text-section offsets unless a method says otherwise. The
/// writer is held for the duration of one `convert` call and finalized with
/// [`write`](Self::write) on success only.
pub trait ObjectWriter {
    /// Begin a function symbol at `offset` with the given frame size.
    fn add_function_symbol(
        &mut self,
        mangled_name: &str,
        offset: CodeOffset,
        frame_size: u32,
        linkage: Linkage,
    );

    /// Record the final byte length of a previously added function.
    fn update_function_length(&mut self, mangled_name: &str, length: u32);

    /// Record x64 unwind data for a function's code range.
    fn add_function_exception_info(&mut self, mangled_name: &str, offset: CodeOffset, length: u32);

    /// Describe one parameter of the current function for debug info.
    fn add_function_parameter(&mut self, name: &str, ty: TypeTag, frame_offset: i32);

    /// Describe one local of the current function for debug info.
    fn add_local_variable(&mut self, name: &str, ty: TypeTag, frame_offset: i32);

    /// Map a function-relative code offset to a source line.
    fn add_line_mapping(&mut self, offset: CodeOffset, line: u32);

    /// Intern a string literal in `.rdata`, returning its symbol name.
    /// Identical contents share a symbol.
    fn add_string_literal(&mut self, contents: &str) -> String;

    /// Declare a global variable symbol.
    fn add_global_variable(&mut self, name: &str, size: u32, initialized: bool, init_value: u64);

    /// Record a relocation at `offset` against `symbol`.
    fn add_relocation(&mut self, offset: CodeOffset, symbol: &str, kind: Reloc);

    /// Append raw bytes to a section.
    fn add_data(&mut self, bytes: &[u8], section: SectionKind);

    /// The mangled form of a previously declared name, if any.
    fn mangled_name(&self, name: &str) -> Option<String>;

    /// Mangle `name` with the given signature string, declaring it.
    fn generate_mangled_name(&mut self, name: &str, signature: &str) -> String;

    /// Finalize the object file on disk.
    fn write(&mut self, filename: &str) -> std::io::Result<()>;
}
