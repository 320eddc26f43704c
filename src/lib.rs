//! Kiln code generation library.
//!
//! This crate is the back end of the Kiln C++ compiler: it lowers the
//! front end's linear, typed IR into x86-64 machine code packaged for a
//! relocatable object file. It is a single-pass, locally-optimizing code
//! generator; there is no SSA, no liveness analysis and no peephole pass.
//! Correctness comes from a small set of disciplines enforced across the
//! crate:
//!
//! - every named value has a canonical stack home, and registers only ever
//!   cache it ([`regalloc`]);
//! - dirty registers are written back before any non-linear control flow,
//!   and no binding survives a merge point;
//! - forward control flow is emitted with zero displacements and patched
//!   once labels resolve ([`binemit`]).
//!
//! The object-file writer (COFF/ELF layout, symbol tables, debug-info
//! containers, name mangling) is an external collaborator behind the
//! [`obj::ObjectWriter`] trait; this crate only hands it structured data.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod binemit;
pub mod frame;
pub mod ir;
pub mod isa;
pub mod obj;
pub mod regalloc;

mod context;
mod lower;
mod result;

pub use crate::context::Context;
pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
