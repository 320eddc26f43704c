//! Result and error types representing the outcome of code generation.

use crate::ir::Opcode;

/// A compilation error.
///
/// Every error is fatal: the converter never produces a partial object file.
/// The payloads name the offending opcode or identifier so the driver can
/// render a diagnostic that points back at the IR producer.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The IR stream violates an operand-layout contract.
    #[error("malformed IR: {opcode} operand {index}: {reason}")]
    MalformedIr {
        /// The opcode whose operand list is malformed.
        opcode: Opcode,
        /// Index of the offending operand.
        index: usize,
        /// What the contract expected.
        reason: String,
    },

    /// An identifier was used before any declaration assigned it a stack slot.
    #[error("undefined identifier `{0}`")]
    UndefinedIdentifier(String),

    /// A label was branched to but never defined in the enclosing function.
    #[error("unresolved label `{0}`")]
    UnresolvedLabel(String),

    /// The back end does not implement the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No register could be found, even after attempting to spill.
    ///
    /// This indicates a front-end bug: too many simultaneously-live
    /// temporaries inside a single expression.
    #[error("register file exhausted: {0}")]
    ResourceExhausted(String),

    /// An internal precondition was violated; a bug in the code generator.
    #[error("inconsistent code generator state: {0}")]
    InconsistentState(String),

    /// The object-file writer failed to produce its output.
    #[error("object file write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl CodegenError {
    /// Shorthand for an operand-layout violation.
    pub fn malformed(opcode: Opcode, index: usize, reason: impl Into<String>) -> Self {
        Self::MalformedIr {
            opcode,
            index,
            reason: reason.into(),
        }
    }
}
