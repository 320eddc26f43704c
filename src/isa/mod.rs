//! Target instruction set support.
//!
//! The only supported instruction set is x86-64; this module additionally
//! owns the calling-convention choice, which is derived from a target triple
//! at [`Context`](crate::Context) construction time.

pub mod x64;

use target_lexicon::{OperatingSystem, Triple};

/// The calling convention the generated code adheres to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallConv {
    /// Windows x64 "fastcall": RCX, RDX, R8, R9; 32-byte shadow space.
    WindowsFastcall,
    /// System V AMD64: RDI, RSI, RDX, RCX, R8, R9; no shadow space.
    SystemV,
}

impl CallConv {
    /// Derive the calling convention for `triple`.
    pub fn for_triple(triple: &Triple) -> Self {
        match triple.operating_system {
            OperatingSystem::Windows => Self::WindowsFastcall,
            _ => Self::SystemV,
        }
    }

    /// Bytes of shadow space a caller must reserve for the callee.
    pub fn shadow_space(self) -> u32 {
        match self {
            Self::WindowsFastcall => 32,
            Self::SystemV => 0,
        }
    }
}
