//! x86-64 registers and instruction encoding.

pub mod abi;
pub mod encode;
pub(crate) mod rex;


use core::fmt;

/// A general purpose x64 register (e.g. `%rax`), identified by its 4-bit
/// hardware encoding.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Gpr(u8);

#[allow(missing_docs)]
impl Gpr {
    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R9: Gpr = Gpr(9);
    pub const R10: Gpr = Gpr(10);
    pub const R11: Gpr = Gpr(11);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R14: Gpr = Gpr(14);
    pub const R15: Gpr = Gpr(15);

    /// Create a register from its hardware encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not a valid x64 register encoding.
    pub fn new(enc: u8) -> Self {
        assert!(enc < 16, "invalid register: {enc}");
        Self(enc)
    }

    /// Return the register's hardware encoding; e.g. `0` for `%rax`.
    pub fn enc(self) -> u8 {
        self.0
    }

    /// Return the register name at the given access `size` in bytes.
    pub fn name(self, size: u8) -> &'static str {
        // Row-per-register tables: 8, 4, 2, 1 bytes.
        const NAMES: [[&str; 4]; 16] = [
            ["rax", "eax", "ax", "al"],
            ["rcx", "ecx", "cx", "cl"],
            ["rdx", "edx", "dx", "dl"],
            ["rbx", "ebx", "bx", "bl"],
            ["rsp", "esp", "sp", "spl"],
            ["rbp", "ebp", "bp", "bpl"],
            ["rsi", "esi", "si", "sil"],
            ["rdi", "edi", "di", "dil"],
            ["r8", "r8d", "r8w", "r8b"],
            ["r9", "r9d", "r9w", "r9b"],
            ["r10", "r10d", "r10w", "r10b"],
            ["r11", "r11d", "r11w", "r11b"],
            ["r12", "r12d", "r12w", "r12b"],
            ["r13", "r13d", "r13w", "r13b"],
            ["r14", "r14d", "r14w", "r14b"],
            ["r15", "r15d", "r15w", "r15b"],
        ];
        let col = match size {
            8 => 0,
            4 => 1,
            2 => 2,
            1 => 3,
            _ => panic!("invalid access size: {size}"),
        };
        NAMES[self.0 as usize][col]
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.name(8))
    }
}

/// An x64 SSE register (e.g. `%xmm0`).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct Xmm(u8);

#[allow(missing_docs)]
impl Xmm {
    pub const XMM0: Xmm = Xmm(0);
    pub const XMM1: Xmm = Xmm(1);
    pub const XMM2: Xmm = Xmm(2);
    pub const XMM3: Xmm = Xmm(3);
    pub const XMM4: Xmm = Xmm(4);
    pub const XMM5: Xmm = Xmm(5);
    pub const XMM6: Xmm = Xmm(6);
    pub const XMM7: Xmm = Xmm(7);

    /// Create a register from its hardware encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not a valid SSE register encoding.
    pub fn new(enc: u8) -> Self {
        assert!(enc < 16, "invalid register: {enc}");
        Self(enc)
    }

    /// Return the register's hardware encoding.
    pub fn enc(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%xmm{}", self.0)
    }
}
