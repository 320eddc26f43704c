//! Binary machine code emission: the text-section buffer and the
//! forward-branch patcher.

use crate::isa::x64::encode::EncodedInst;
use crate::result::{CodegenError, CodegenResult};
use log::trace;
use rustc_hash::FxHashMap;

/// Offset in bytes from the beginning of the text section.
///
/// The code generator can run as a cross compiler, so this is a fixed-width
/// type rather than `usize`.
pub type CodeOffset = u32;

/// The growing text-section byte buffer.
///
/// All emission appends; the only mutation of existing bytes is the rel32
/// write-back performed by [`BranchTable::patch_all`] and the displacement
/// patching done for resolved relocations.
#[derive(Default)]
pub struct CodeBuffer {
    data: Vec<u8>,
}

impl CodeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current emission offset.
    pub fn offset(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    /// Append one encoded instruction.
    pub fn emit(&mut self, inst: EncodedInst) {
        self.data.extend_from_slice(&inst);
    }

    /// Append one raw byte.
    pub fn put1(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Overwrite four bytes at `offset` with a little-endian value.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` is out of bounds; patch sites are always
    /// recorded inside already-emitted instructions.
    pub fn patch4(&mut self, offset: CodeOffset, value: u32) {
        let at = offset as usize;
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read back four bytes at `offset` as a little-endian value.
    pub fn read4(&self, offset: CodeOffset) -> u32 {
        let at = offset as usize;
        u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap())
    }

    /// The emitted bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer, yielding the emitted bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// A forward branch awaiting resolution: the rel32 at `patch_site` will be
/// rewritten once `target` is bound.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingBranch {
    /// The label the branch targets.
    pub target: String,
    /// Offset of the 4-byte rel32 field inside the buffer.
    pub patch_site: CodeOffset,
}

/// Per-function label table and pending-branch list.
///
/// Labels may be bound before or after they are used; every use is recorded
/// and resolved in one pass at function finalization. The table is cleared
/// between functions, so label names only need to be unique per function.
#[derive(Default)]
pub struct BranchTable {
    labels: FxHashMap<String, CodeOffset>,
    pending: Vec<PendingBranch>,
}

impl BranchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `label` as referring to `offset`.
    pub fn bind_label(&mut self, label: &str, offset: CodeOffset) {
        trace!("label {label} bound at {offset:#x}");
        self.labels.insert(label.to_string(), offset);
    }

    /// Record a rel32 use of `label` at `patch_site`.
    pub fn use_label(&mut self, label: &str, patch_site: CodeOffset) {
        self.pending.push(PendingBranch {
            target: label.to_string(),
            patch_site,
        });
    }

    /// Resolve every pending branch, writing rel32 displacements back into
    /// `buf`.
    ///
    /// The displacement is measured from the end of the rel32 field, which
    /// for both `E9` and `0F 8x` is the end of the instruction.
    pub fn patch_all(&mut self, buf: &mut CodeBuffer) -> CodegenResult<()> {
        for branch in self.pending.drain(..) {
            let target = *self
                .labels
                .get(&branch.target)
                .ok_or_else(|| CodegenError::UnresolvedLabel(branch.target.clone()))?;
            let rel = target as i64 - (branch.patch_site as i64 + 4);
            let rel = i32::try_from(rel).map_err(|_| {
                CodegenError::InconsistentState(format!(
                    "branch to `{}` spans more than 2GiB",
                    branch.target
                ))
            })?;
            trace!(
                "patching branch at {:#x} -> {} (rel32 {rel})",
                branch.patch_site,
                branch.target
            );
            buf.patch4(branch.patch_site, rel as u32);
        }
        Ok(())
    }

    /// Look up a bound label.
    pub fn label_offset(&self, label: &str) -> Option<CodeOffset> {
        self.labels.get(label).copied()
    }

    /// True when no branch is awaiting resolution.
    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop all labels and pending branches, ready for the next function.
    pub fn clear(&mut self) {
        self.labels.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::x64::encode;

    #[test]
    fn forward_branch_patching() {
        let mut buf = CodeBuffer::new();
        let mut branches = BranchTable::new();

        // jmp L; nop; nop; L:
        buf.emit(encode::jmp_rel32(0));
        branches.use_label("L", buf.offset() - 4);
        buf.emit(encode::nop());
        buf.emit(encode::nop());
        branches.bind_label("L", buf.offset());

        branches.patch_all(&mut buf).unwrap();
        assert!(branches.is_resolved());
        // Site is at offset 1; label is at offset 7: rel32 = 7 - (1 + 4).
        assert_eq!(buf.read4(1) as i32, 2);
    }

    #[test]
    fn backward_branch_patching() {
        let mut buf = CodeBuffer::new();
        let mut branches = BranchTable::new();

        branches.bind_label("top", buf.offset());
        buf.emit(encode::nop());
        buf.emit(encode::jmp_rel32(0));
        branches.use_label("top", buf.offset() - 4);

        branches.patch_all(&mut buf).unwrap();
        // Label at 0, site at 2: rel32 = 0 - (2 + 4).
        assert_eq!(buf.read4(2) as i32, -6);
    }

    #[test]
    fn unresolved_label_is_an_error() {
        let mut buf = CodeBuffer::new();
        let mut branches = BranchTable::new();
        buf.emit(encode::jmp_rel32(0));
        branches.use_label("nowhere", buf.offset() - 4);
        assert!(matches!(
            branches.patch_all(&mut buf),
            Err(crate::CodegenError::UnresolvedLabel(_))
        ));
    }
}
