//! Calling-convention register assignments for the two supported ABIs.

use super::{Gpr, Xmm};
use crate::isa::CallConv;

/// Where one parameter or call argument travels.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArgLoc {
    /// In an integer register.
    Gpr(Gpr),
    /// In an SSE register.
    Xmm(Xmm),
    /// On the stack, at the given index among the stack-passed arguments
    /// (0 is the lowest-addressed one, directly above the shadow space if
    /// the convention has any).
    Stack(usize),
}

/// Classify every argument of a signature, given whether each is
/// floating-point.
///
/// Windows x64 assigns registers by argument position (an argument burns
/// its slot in both register files); System V keeps independent integer
/// and float counters. Both conventions place the overflow on the stack
/// in argument order. Frame construction, parameter homing and call-site
/// argument placement all use this one classification, so the callee's
/// recorded homes always match what a caller physically produces.
pub fn classify_args(
    call_conv: CallConv,
    is_float: impl IntoIterator<Item = bool>,
) -> Vec<ArgLoc> {
    let int_regs = int_arg_regs(call_conv);
    let float_regs = float_arg_regs(call_conv);
    match call_conv {
        CallConv::WindowsFastcall => is_float
            .into_iter()
            .enumerate()
            .map(|(pos, float)| {
                if pos >= int_regs.len() {
                    ArgLoc::Stack(pos - int_regs.len())
                } else if float {
                    ArgLoc::Xmm(float_regs[pos])
                } else {
                    ArgLoc::Gpr(int_regs[pos])
                }
            })
            .collect(),
        CallConv::SystemV => {
            let mut next_int = 0;
            let mut next_float = 0;
            let mut next_stack = 0;
            is_float
                .into_iter()
                .map(|float| {
                    if float {
                        if next_float < float_regs.len() {
                            next_float += 1;
                            ArgLoc::Xmm(float_regs[next_float - 1])
                        } else {
                            next_stack += 1;
                            ArgLoc::Stack(next_stack - 1)
                        }
                    } else if next_int < int_regs.len() {
                        next_int += 1;
                        ArgLoc::Gpr(int_regs[next_int - 1])
                    } else {
                        next_stack += 1;
                        ArgLoc::Stack(next_stack - 1)
                    }
                })
                .collect()
        }
    }
}

/// Integer argument registers, in parameter order.
pub fn int_arg_regs(call_conv: CallConv) -> &'static [Gpr] {
    match call_conv {
        CallConv::WindowsFastcall => &[Gpr::RCX, Gpr::RDX, Gpr::R8, Gpr::R9],
        CallConv::SystemV => &[Gpr::RDI, Gpr::RSI, Gpr::RDX, Gpr::RCX, Gpr::R8, Gpr::R9],
    }
}

/// Floating-point argument registers, in parameter order.
pub fn float_arg_regs(call_conv: CallConv) -> &'static [Xmm] {
    match call_conv {
        CallConv::WindowsFastcall => &[Xmm::XMM0, Xmm::XMM1, Xmm::XMM2, Xmm::XMM3],
        CallConv::SystemV => &[
            Xmm::XMM0,
            Xmm::XMM1,
            Xmm::XMM2,
            Xmm::XMM3,
            Xmm::XMM4,
            Xmm::XMM5,
            Xmm::XMM6,
            Xmm::XMM7,
        ],
    }
}

/// General-purpose registers a callee may clobber.
///
/// Both ABIs share this set; the callee-saved registers are RBX, RSP, RBP,
/// RSI/RDI (Windows only) and R12-R15, none of which this code generator
/// hands out as scratch across calls.
pub fn caller_saved_gprs(call_conv: CallConv) -> &'static [Gpr] {
    match call_conv {
        CallConv::WindowsFastcall => &[
            Gpr::RAX,
            Gpr::RCX,
            Gpr::RDX,
            Gpr::R8,
            Gpr::R9,
            Gpr::R10,
            Gpr::R11,
        ],
        CallConv::SystemV => &[
            Gpr::RAX,
            Gpr::RCX,
            Gpr::RDX,
            Gpr::RSI,
            Gpr::RDI,
            Gpr::R8,
            Gpr::R9,
            Gpr::R10,
            Gpr::R11,
        ],
    }
}

/// Every SSE register is caller-saved under both ABIs as far as this code
/// generator is concerned (Windows nominally preserves XMM6-15, but we
/// never keep values there across calls).
pub fn caller_saved_xmms() -> impl Iterator<Item = Xmm> {
    (0..16).map(Xmm::new)
}
