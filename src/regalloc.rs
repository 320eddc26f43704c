//! The per-function register allocator.
//!
//! This is a local cache of the stack, not a global coloring: every named
//! value has a canonical stack home, and a register binding is always a
//! hint that may be dropped by writing the value back. Correctness then
//! reduces to one discipline: flush before any non-linear control flow.
//!
//! A register is in one of three states:
//!
//! - free: `allocated` clear, no binding;
//! - bound: `allocated` set, `offset` names the stack slot it caches
//!   (`dirty` when the register holds a newer value than the slot);
//! - scratch: `allocated` set, no binding. Scratch registers belong to the
//!   active handler and are never chosen as spill victims, since their
//!   contents cannot be recovered from memory.

use crate::binemit::CodeBuffer;
use crate::isa::x64::encode;
use crate::isa::x64::{Gpr, Xmm};
use crate::isa::CallConv;
use crate::result::{CodegenError, CodegenResult};
use log::trace;

/// Tracking state for one physical register.
#[derive(Clone, Copy, Default)]
struct AllocatedRegister {
    allocated: bool,
    dirty: bool,
    /// The stack slot this register caches, if any.
    offset: Option<i32>,
    /// Access width of the cached value, used for write-back.
    bits: u16,
}

impl AllocatedRegister {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// The 32-register file: 16 general-purpose and 16 SSE registers.
pub struct RegisterAllocator {
    gprs: [AllocatedRegister; 16],
    xmms: [AllocatedRegister; 16],
}

impl Default for RegisterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterAllocator {
    /// A fresh allocator with every register free.
    pub fn new() -> Self {
        Self {
            gprs: [AllocatedRegister::default(); 16],
            xmms: [AllocatedRegister::default(); 16],
        }
    }

    /// Allocate any free general-purpose register as scratch, or `None`
    /// when a spill would be required. RSP and RBP are never handed out.
    pub fn allocate(&mut self) -> Option<Gpr> {
        for enc in 0..16u8 {
            if enc == Gpr::RSP.enc() || enc == Gpr::RBP.enc() {
                continue;
            }
            if !self.gprs[enc as usize].allocated {
                self.gprs[enc as usize].allocated = true;
                return Some(Gpr::new(enc));
            }
        }
        None
    }

    /// Allocate a general-purpose register, spilling a bound register if
    /// none is free. Clean victims are preferred; a dirty victim is written
    /// back to its slot at its tracked width first. After return the caller
    /// owns the register exclusively, with no binding.
    pub fn allocate_with_spill(&mut self, buf: &mut CodeBuffer) -> CodegenResult<Gpr> {
        if let Some(reg) = self.allocate() {
            return Ok(reg);
        }
        let victim = self
            .pick_gpr_victim()
            .ok_or_else(|| CodegenError::ResourceExhausted("no spillable GP register".into()))?;
        self.spill_gpr(victim, buf);
        self.gprs[victim.enc() as usize].allocated = true;
        Ok(victim)
    }

    fn pick_gpr_victim(&self) -> Option<Gpr> {
        let bound = |st: &AllocatedRegister| st.allocated && st.offset.is_some();
        // Clean registers are cheaper to evict: memory is already current.
        for enc in 0..16u8 {
            let st = &self.gprs[enc as usize];
            if bound(st) && !st.dirty {
                return Some(Gpr::new(enc));
            }
        }
        for enc in 0..16u8 {
            let st = &self.gprs[enc as usize];
            if bound(st) {
                return Some(Gpr::new(enc));
            }
        }
        None
    }

    fn spill_gpr(&mut self, reg: Gpr, buf: &mut CodeBuffer) {
        let st = &mut self.gprs[reg.enc() as usize];
        if let Some(offset) = st.offset {
            if st.dirty {
                trace!("spilling {reg} to [rbp{offset:+}]");
                buf.emit(encode::store_frame(st.bits, offset, reg));
            }
        }
        st.clear();
    }

    /// Take a specific register for fixed use (e.g. RAX for division, RCX
    /// for a shift count), writing back and unbinding whatever it held.
    ///
    /// Attempting to take a register the active handler already owns as
    /// scratch is a code-generator bug.
    pub fn take(&mut self, reg: Gpr, buf: &mut CodeBuffer) -> CodegenResult<()> {
        let st = self.gprs[reg.enc() as usize];
        if st.allocated && st.offset.is_none() {
            return Err(CodegenError::InconsistentState(format!(
                "{reg} is already allocated as scratch"
            )));
        }
        self.spill_gpr(reg, buf);
        self.gprs[reg.enc() as usize].allocated = true;
        Ok(())
    }

    /// Convert a bound register into handler-owned scratch: write the value
    /// back if dirty, then drop the binding. Used before an instruction
    /// clobbers an adopted register, so the slot's only copy is never lost.
    pub fn steal(&mut self, reg: Gpr, buf: &mut CodeBuffer) {
        let st = &mut self.gprs[reg.enc() as usize];
        if let Some(offset) = st.offset {
            if st.dirty {
                trace!("write-back of {reg} to [rbp{offset:+}] before clobber");
                buf.emit(encode::store_frame(st.bits, offset, reg));
            }
        }
        st.dirty = false;
        st.offset = None;
        st.allocated = true;
    }

    /// Drop any binding that caches `offset`, in either register file,
    /// without writing back. Called before a direct store to the slot,
    /// which would otherwise leave a stale binding.
    pub fn unbind_offset(&mut self, offset: i32) {
        for st in self.gprs.iter_mut().chain(self.xmms.iter_mut()) {
            if st.offset == Some(offset) {
                st.clear();
            }
        }
    }

    /// Write back and release any register caching `offset`. Called before
    /// a slot is re-read from memory, so a dirty cached value is never
    /// bypassed.
    pub fn flush_offset(&mut self, offset: i32, buf: &mut CodeBuffer) {
        for enc in 0..16u8 {
            if self.gprs[enc as usize].offset == Some(offset) {
                self.spill_gpr(Gpr::new(enc), buf);
            }
            if self.xmms[enc as usize].offset == Some(offset) {
                self.spill_xmm(Xmm::new(enc), buf);
            }
        }
    }

    /// The register currently caching `offset`, if any.
    pub fn register_for_offset(&self, offset: i32) -> Option<Gpr> {
        (0..16u8)
            .find(|&enc| self.gprs[enc as usize].offset == Some(offset))
            .map(Gpr::new)
    }

    /// Bind `reg` to a stack slot, marking it dirty. Any other register
    /// previously bound to the same slot loses its binding: exactly one
    /// register may cache a slot.
    pub fn bind(&mut self, reg: Gpr, offset: i32, bits: u16) {
        if let Some(prev) = self.register_for_offset(offset) {
            if prev != reg {
                self.gprs[prev.enc() as usize].clear();
            }
        }
        let st = &mut self.gprs[reg.enc() as usize];
        st.allocated = true;
        st.dirty = true;
        st.offset = Some(offset);
        st.bits = bits;
    }

    /// Bind `reg` as a clean cache of a slot whose memory already holds
    /// the same value (a fresh load, or a just-spilled parameter). Reads
    /// may adopt the register; flushing drops the binding without a
    /// store.
    pub fn bind_clean(&mut self, reg: Gpr, offset: i32, bits: u16) {
        self.bind(reg, offset, bits);
        self.gprs[reg.enc() as usize].dirty = false;
    }

    /// Return `reg` to the free pool, discarding any binding.
    pub fn release(&mut self, reg: Gpr) {
        self.gprs[reg.enc() as usize].clear();
    }

    /// True when `reg` holds a stack-slot binding.
    pub fn is_bound(&self, reg: Gpr) -> bool {
        self.gprs[reg.enc() as usize].offset.is_some()
    }

    /// Write every dirty register back to its slot, then drop all bindings
    /// so subsequent code reloads from memory. Scratch registers are left
    /// alone.
    pub fn flush_dirty(&mut self, buf: &mut CodeBuffer) {
        for enc in 0..16u8 {
            if self.gprs[enc as usize].offset.is_some() {
                self.spill_gpr(Gpr::new(enc), buf);
            }
        }
        for enc in 0..16u8 {
            if self.xmms[enc as usize].offset.is_some() {
                self.spill_xmm(Xmm::new(enc), buf);
            }
        }
    }

    /// Drop the bindings of every caller-saved register; the callee is
    /// assumed to have clobbered their contents. Nothing is written back
    /// (callers flush before emitting the call) and scratch registers stay
    /// allocated: their owner is the active handler.
    pub fn invalidate_caller_saved(&mut self, call_conv: CallConv) {
        use crate::isa::x64::abi;
        for &reg in abi::caller_saved_gprs(call_conv) {
            let st = &mut self.gprs[reg.enc() as usize];
            if st.offset.is_some() {
                st.clear();
            }
        }
        for reg in abi::caller_saved_xmms() {
            let st = &mut self.xmms[reg.enc() as usize];
            if st.offset.is_some() {
                st.clear();
            }
        }
    }

    /// Full clear: used at function entry and at control-flow merge points,
    /// where register contents cannot be trusted.
    pub fn reset(&mut self) {
        for st in self.gprs.iter_mut().chain(self.xmms.iter_mut()) {
            st.clear();
        }
    }

    /// True when no register reports itself dirty.
    pub fn no_dirty(&self) -> bool {
        self.gprs
            .iter()
            .chain(self.xmms.iter())
            .all(|st| !st.dirty)
    }

    /// True when no register holds a stack-slot binding.
    pub fn no_bindings(&self) -> bool {
        self.gprs
            .iter()
            .chain(self.xmms.iter())
            .all(|st| st.offset.is_none())
    }

    // ------------------------------------------------------------------
    // The SSE half of the register file.

    /// Allocate any free SSE register as scratch.
    pub fn allocate_xmm(&mut self) -> Option<Xmm> {
        for enc in 0..16u8 {
            if !self.xmms[enc as usize].allocated {
                self.xmms[enc as usize].allocated = true;
                return Some(Xmm::new(enc));
            }
        }
        None
    }

    /// Allocate an SSE register, spilling a bound one if none is free.
    pub fn allocate_xmm_with_spill(&mut self, buf: &mut CodeBuffer) -> CodegenResult<Xmm> {
        if let Some(reg) = self.allocate_xmm() {
            return Ok(reg);
        }
        let victim = (0..16u8)
            .filter(|&enc| {
                let st = &self.xmms[enc as usize];
                st.allocated && st.offset.is_some()
            })
            .min_by_key(|&enc| self.xmms[enc as usize].dirty)
            .map(Xmm::new)
            .ok_or_else(|| CodegenError::ResourceExhausted("no spillable SSE register".into()))?;
        self.spill_xmm(victim, buf);
        self.xmms[victim.enc() as usize].allocated = true;
        Ok(victim)
    }

    fn spill_xmm(&mut self, reg: Xmm, buf: &mut CodeBuffer) {
        let st = &mut self.xmms[reg.enc() as usize];
        if let Some(offset) = st.offset {
            if st.dirty {
                trace!("spilling {reg} to [rbp{offset:+}]");
                buf.emit(encode::sse_store_frame(st.bits, offset, reg));
            }
        }
        st.clear();
    }

    /// Take a specific SSE register for fixed use (e.g. XMM0 for a return
    /// value), writing back and unbinding whatever it held.
    pub fn take_xmm(&mut self, reg: Xmm, buf: &mut CodeBuffer) -> CodegenResult<()> {
        let st = self.xmms[reg.enc() as usize];
        if st.allocated && st.offset.is_none() {
            return Err(CodegenError::InconsistentState(format!(
                "{reg} is already allocated as scratch"
            )));
        }
        self.spill_xmm(reg, buf);
        self.xmms[reg.enc() as usize].allocated = true;
        Ok(())
    }

    /// Convert a bound SSE register into handler-owned scratch, writing the
    /// value back first if dirty.
    pub fn steal_xmm(&mut self, reg: Xmm, buf: &mut CodeBuffer) {
        let st = &mut self.xmms[reg.enc() as usize];
        if let Some(offset) = st.offset {
            if st.dirty {
                trace!("write-back of {reg} to [rbp{offset:+}] before clobber");
                buf.emit(encode::sse_store_frame(st.bits, offset, reg));
            }
        }
        st.dirty = false;
        st.offset = None;
        st.allocated = true;
    }

    /// The SSE register currently caching `offset`, if any.
    pub fn xmm_for_offset(&self, offset: i32) -> Option<Xmm> {
        (0..16u8)
            .find(|&enc| self.xmms[enc as usize].offset == Some(offset))
            .map(Xmm::new)
    }

    /// Bind an SSE register as a clean cache of a slot; see
    /// [`bind_clean`](Self::bind_clean).
    pub fn bind_xmm_clean(&mut self, reg: Xmm, offset: i32, bits: u16) {
        self.bind_xmm(reg, offset, bits);
        self.xmms[reg.enc() as usize].dirty = false;
    }

    /// Bind an SSE register to a stack slot, marking it dirty.
    pub fn bind_xmm(&mut self, reg: Xmm, offset: i32, bits: u16) {
        if let Some(prev) = self.xmm_for_offset(offset) {
            if prev != reg {
                self.xmms[prev.enc() as usize].clear();
            }
        }
        let st = &mut self.xmms[reg.enc() as usize];
        st.allocated = true;
        st.dirty = true;
        st.offset = Some(offset);
        st.bits = bits;
    }

    /// Return an SSE register to the free pool.
    pub fn release_xmm(&mut self, reg: Xmm) {
        self.xmms[reg.enc() as usize].clear();
    }

    /// True when `reg` holds a stack-slot binding.
    pub fn is_xmm_bound(&self, reg: Xmm) -> bool {
        self.xmms[reg.enc() as usize].offset.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_skips_rsp_rbp() {
        let mut regs = RegisterAllocator::new();
        let mut seen = Vec::new();
        while let Some(reg) = regs.allocate() {
            seen.push(reg);
        }
        assert_eq!(seen.len(), 14);
        assert!(!seen.contains(&Gpr::RSP));
        assert!(!seen.contains(&Gpr::RBP));
    }

    #[test]
    fn one_register_per_slot() {
        let mut regs = RegisterAllocator::new();
        let a = regs.allocate().unwrap();
        let b = regs.allocate().unwrap();
        regs.bind(a, -8, 64);
        regs.bind(b, -8, 64);
        assert_eq!(regs.register_for_offset(-8), Some(b));
        assert!(!regs.is_bound(a));
    }

    #[test]
    fn flush_writes_back_and_unbinds() {
        let mut regs = RegisterAllocator::new();
        let mut buf = CodeBuffer::new();
        let a = regs.allocate().unwrap();
        regs.bind(a, -16, 32);
        regs.flush_dirty(&mut buf);
        assert!(regs.no_dirty());
        assert!(regs.no_bindings());
        // mov [rbp-16], eax
        assert_eq!(buf.data(), &[0x89, 0x45, 0xF0]);
    }

    #[test]
    fn spill_prefers_clean_victims() {
        let mut regs = RegisterAllocator::new();
        let mut buf = CodeBuffer::new();
        // Exhaust the file, binding every register.
        let mut offset = -8;
        let mut all = Vec::new();
        while let Some(reg) = regs.allocate() {
            regs.bind(reg, offset, 64);
            all.push((reg, offset));
            offset -= 8;
        }
        // Make one register clean by flushing through a store-free path:
        // simulate a load-adoption by clearing dirty directly via rebind.
        let (clean, clean_off) = all[3];
        regs.gprs[clean.enc() as usize].dirty = false;
        let got = regs.allocate_with_spill(&mut buf).unwrap();
        assert_eq!(got, clean);
        // A clean eviction emits nothing.
        assert!(buf.data().is_empty());
        assert_eq!(regs.register_for_offset(clean_off), None);
    }

    #[test]
    fn take_writes_back_dirty_contents() {
        let mut regs = RegisterAllocator::new();
        let mut buf = CodeBuffer::new();
        let a = regs.allocate().unwrap();
        assert_eq!(a, Gpr::RAX);
        regs.bind(a, -8, 64);
        regs.take(Gpr::RAX, &mut buf).unwrap();
        // mov [rbp-8], rax
        assert_eq!(buf.data(), &[0x48, 0x89, 0x45, 0xF8]);
        assert!(!regs.is_bound(Gpr::RAX));
    }

    #[test]
    fn invalidate_only_touches_caller_saved_bindings() {
        let mut regs = RegisterAllocator::new();
        let mut buf = CodeBuffer::new();
        regs.take(Gpr::RAX, &mut buf).unwrap();
        let rbx = Gpr::RBX;
        regs.take(rbx, &mut buf).unwrap();
        regs.bind(rbx, -8, 64);
        let r10 = Gpr::R10;
        regs.take(r10, &mut buf).unwrap();
        regs.bind(r10, -16, 64);
        regs.invalidate_caller_saved(CallConv::WindowsFastcall);
        // RBX is callee-saved: binding survives. R10 is caller-saved:
        // binding dropped. RAX was scratch: stays allocated.
        assert!(regs.is_bound(rbx));
        assert!(!regs.is_bound(r10));
        assert!(regs.allocate() != Some(Gpr::RAX));
    }
}
