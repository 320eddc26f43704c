//! Intermediate representation consumed by the converter.
//!
//! The IR is a finite, ordered stream of [`Inst`] records produced by the
//! front end. Each record carries an [`Opcode`], a source line number and an
//! ordered operand list. Operand layouts are fixed per-opcode contracts,
//! documented on the accessors below; a layout violation surfaces as
//! [`CodegenError::MalformedIr`](crate::CodegenError) rather than a panic.

pub mod condcodes;

use crate::result::{CodegenError, CodegenResult};
use core::fmt;

/// The opcode of an IR instruction.
///
/// Operand layouts (`→` marks the result operand):
///
/// | group | layout |
/// |---|---|
/// | arithmetic, comparison | `→result, lhs_ty, lhs_bits, lhs, rhs_ty, rhs_bits, rhs` |
/// | unary | `→result, ty, bits, value` |
/// | conversion | `→result, ty, to_bits, value, from_bits` |
/// | compound assign | `dest, ty, bits, rhs` |
/// | inc/dec | `→result, target, ty, bits` |
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    /// Start of a function; finalizes the previous one. Layout:
    /// `name, ret_ty, ret_bits, param_count, (name, ty, bits, referent_ty)*`
    /// where `referent_ty` repeats `ty` for non-reference parameters and
    /// names the referred-to type for reference parameters (whose `bits`
    /// give the referent's width).
    FunctionDecl,
    /// Local variable declaration:
    /// `name, ty, bits, array_count, align, referent_ty`. `align` of 0
    /// means natural alignment; `referent_ty` follows the same convention
    /// as `FunctionDecl` parameters.
    VariableDecl,
    /// Return, optionally with `ty, bits, value`.
    Return,
    /// Direct call: `→result, callee, ret_ty, ret_bits, (ty, bits, value)*`.
    FunctionCall,

    // Integer arithmetic.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    UnsignedDiv,
    UnsignedMod,

    // Floating-point arithmetic.
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,

    // Bitwise and shifts.
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,

    // Signed comparisons.
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,

    // Unsigned comparisons.
    Below,
    BelowEqual,
    Above,
    AboveEqual,

    // Floating-point comparisons.
    FloatEqual,
    FloatNotEqual,
    FloatLessThan,
    FloatLessEqual,
    FloatGreaterThan,
    FloatGreaterEqual,

    // Unary operators.
    LogicalNot,
    BitwiseNot,
    Negate,

    // Width conversions.
    SignExtend,
    ZeroExtend,
    Truncate,

    /// Scalar/struct/function-pointer assignment: `dest, ty, bits, value`.
    Assignment,

    // Compound assignments.
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    ShlAssign,
    ShrAssign,

    // Control flow.
    /// Define a label: `name`. A merge point; register state is discarded.
    Label,
    /// Unconditional branch: `target`.
    Branch,
    /// Conditional branch: `cond, true_target, false_target`. The true path
    /// must immediately follow; only the false edge is emitted as a jump.
    ConditionalBranch,
    /// Push a loop context: `end_label, increment_label`.
    LoopBegin,
    /// Pop the innermost loop context.
    LoopEnd,
    /// Jump to the innermost loop's end label.
    Break,
    /// Jump to the innermost loop's increment label.
    Continue,

    // Aggregate access.
    /// `→result, base, elem_ty, elem_bits, index`.
    ArrayAccess,
    /// `base, elem_ty, elem_bits, index, value`.
    ArrayStore,
    /// `→result, base, byte_offset, ty, bits`.
    MemberAccess,
    /// `base, byte_offset, ty, bits, value`.
    MemberStore,
    /// `→result, variable`.
    AddressOf,
    /// `→result, ty, bits, pointer`.
    Dereference,

    // Object lifetime and dispatch.
    /// `ctor, object, (ty, bits, value)*`.
    ConstructorCall,
    /// `dtor, object`.
    DestructorCall,
    /// `→result, object, vtable_index, ret_ty, ret_bits, (ty, bits, value)*`.
    VirtualCall,

    // Heap management.
    /// `→result, size_bytes`.
    HeapAlloc,
    /// `→result, elem_size_bytes, count`.
    HeapAllocArray,
    /// `pointer`.
    HeapFree,
    /// `pointer`. Does not run element destructors.
    HeapFreeArray,
    /// `→result, address`.
    PlacementNew,

    // Run-time type information.
    /// `→result, ty`.
    Typeid,
    /// `→result, target_ty, value`. Lowers as an identity move.
    DynamicCast,

    // Globals.
    /// `name, ty, bits, initialized, init_value`.
    GlobalVariableDecl,
    /// `→result, global, ty, bits`.
    GlobalLoad,
    /// `global, ty, bits, value`.
    GlobalStore,

    // Function pointers.
    /// `→result, function`.
    FunctionAddress,
    /// `→result, pointer, ret_ty, ret_bits, (ty, bits, value)*`.
    IndirectCall,

    /// `→result, contents`. The contents land in `.rdata`, deduplicated.
    StringLiteral,

    // Increment / decrement.
    PreIncrement,
    PostIncrement,
    PreDecrement,
    PostDecrement,

    // Lexical scopes (debug info only; no code is emitted).
    ScopeBegin,
    ScopeEnd,
}

impl Opcode {
    /// The lowercase name used in diagnostics and trace output.
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            FunctionDecl => "function_decl",
            VariableDecl => "variable_decl",
            Return => "return",
            FunctionCall => "function_call",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            UnsignedDiv => "udiv",
            UnsignedMod => "umod",
            FloatAdd => "fadd",
            FloatSub => "fsub",
            FloatMul => "fmul",
            FloatDiv => "fdiv",
            BitwiseAnd => "band",
            BitwiseOr => "bor",
            BitwiseXor => "bxor",
            ShiftLeft => "shl",
            ShiftRight => "sshr",
            UnsignedShiftRight => "ushr",
            Equal => "eq",
            NotEqual => "ne",
            LessThan => "slt",
            LessEqual => "sle",
            GreaterThan => "sgt",
            GreaterEqual => "sge",
            Below => "ult",
            BelowEqual => "ule",
            Above => "ugt",
            AboveEqual => "uge",
            FloatEqual => "feq",
            FloatNotEqual => "fne",
            FloatLessThan => "flt",
            FloatLessEqual => "fle",
            FloatGreaterThan => "fgt",
            FloatGreaterEqual => "fge",
            LogicalNot => "lnot",
            BitwiseNot => "bnot",
            Negate => "neg",
            SignExtend => "sext",
            ZeroExtend => "zext",
            Truncate => "trunc",
            Assignment => "assign",
            AddAssign => "add_assign",
            SubAssign => "sub_assign",
            MulAssign => "mul_assign",
            DivAssign => "div_assign",
            ModAssign => "mod_assign",
            AndAssign => "and_assign",
            OrAssign => "or_assign",
            XorAssign => "xor_assign",
            ShlAssign => "shl_assign",
            ShrAssign => "shr_assign",
            Label => "label",
            Branch => "branch",
            ConditionalBranch => "cond_branch",
            LoopBegin => "loop_begin",
            LoopEnd => "loop_end",
            Break => "break",
            Continue => "continue",
            ArrayAccess => "array_access",
            ArrayStore => "array_store",
            MemberAccess => "member_access",
            MemberStore => "member_store",
            AddressOf => "address_of",
            Dereference => "deref",
            ConstructorCall => "ctor_call",
            DestructorCall => "dtor_call",
            VirtualCall => "virtual_call",
            HeapAlloc => "heap_alloc",
            HeapAllocArray => "heap_alloc_array",
            HeapFree => "heap_free",
            HeapFreeArray => "heap_free_array",
            PlacementNew => "placement_new",
            Typeid => "typeid",
            DynamicCast => "dynamic_cast",
            GlobalVariableDecl => "global_decl",
            GlobalLoad => "global_load",
            GlobalStore => "global_store",
            FunctionAddress => "function_address",
            IndirectCall => "indirect_call",
            StringLiteral => "string_literal",
            PreIncrement => "pre_inc",
            PostIncrement => "post_inc",
            PreDecrement => "pre_dec",
            PostDecrement => "post_dec",
            ScopeBegin => "scope_begin",
            ScopeEnd => "scope_end",
        }
    }

    /// True for the seven-operand arithmetic/comparison shape.
    pub fn is_binary(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Add | Sub
                | Mul
                | Div
                | Mod
                | UnsignedDiv
                | UnsignedMod
                | FloatAdd
                | FloatSub
                | FloatMul
                | FloatDiv
                | BitwiseAnd
                | BitwiseOr
                | BitwiseXor
                | ShiftLeft
                | ShiftRight
                | UnsignedShiftRight
        ) || self.is_comparison()
    }

    /// True for any comparison opcode, integer or floating-point.
    pub fn is_comparison(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Equal
                | NotEqual
                | LessThan
                | LessEqual
                | GreaterThan
                | GreaterEqual
                | Below
                | BelowEqual
                | Above
                | AboveEqual
                | FloatEqual
                | FloatNotEqual
                | FloatLessThan
                | FloatLessEqual
                | FloatGreaterThan
                | FloatGreaterEqual
        )
    }

    /// True if lowering this opcode emits a call instruction.
    pub fn is_call(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            FunctionCall
                | ConstructorCall
                | DestructorCall
                | VirtualCall
                | HeapAlloc
                | HeapAllocArray
                | HeapFree
                | HeapFreeArray
                | IndirectCall
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A scalar type tag attached to IR operands.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
#[allow(missing_docs)]
pub enum TypeTag {
    Void,
    Bool,
    Char,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// A raw or typed pointer; always 64 bits.
    Pointer,
    /// An lvalue reference; stored as a pointer, dereferenced on use.
    Reference,
    /// An rvalue reference; same storage as `Reference`.
    RvalueReference,
    /// A struct or class object.
    Struct,
    /// A pointer to a function; always 64 bits.
    FunctionPointer,
}

impl TypeTag {
    /// True for `F32`/`F64`.
    pub fn is_float(self) -> bool {
        matches!(self, TypeTag::F32 | TypeTag::F64)
    }

    /// True for the unsigned integer types, `Bool` and `Char`.
    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            TypeTag::U8 | TypeTag::U16 | TypeTag::U32 | TypeTag::U64 | TypeTag::Bool | TypeTag::Char
        )
    }

    /// True for either reference flavor.
    pub fn is_reference(self) -> bool {
        matches!(self, TypeTag::Reference | TypeTag::RvalueReference)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TypeTag::Void => "void",
            TypeTag::Bool => "bool",
            TypeTag::Char => "char",
            TypeTag::I8 => "i8",
            TypeTag::I16 => "i16",
            TypeTag::I32 => "i32",
            TypeTag::I64 => "i64",
            TypeTag::U8 => "u8",
            TypeTag::U16 => "u16",
            TypeTag::U32 => "u32",
            TypeTag::U64 => "u64",
            TypeTag::F32 => "f32",
            TypeTag::F64 => "f64",
            TypeTag::Pointer => "ptr",
            TypeTag::Reference => "ref",
            TypeTag::RvalueReference => "rvref",
            TypeTag::Struct => "struct",
            TypeTag::FunctionPointer => "fnptr",
        };
        f.write_str(s)
    }
}

/// A single IR operand.
///
/// Handlers match on this exhaustively; there is deliberately no generic
/// "probe for type T" accessor.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// A signed 64-bit integer literal.
    Int(i64),
    /// An unsigned 64-bit integer literal.
    UInt(u64),
    /// A floating-point literal, always carried at `f64` precision.
    Float(f64),
    /// A boolean literal.
    Bool(bool),
    /// A character literal.
    Char(u8),
    /// A named identifier: variable, function, label or string contents.
    Name(String),
    /// A temporary value by 1-based generation index; its canonical stack
    /// slot is `rbp - 8 * index` and its name is the decimal form of the
    /// index.
    Temp(u32),
    /// A type tag.
    Type(TypeTag),
    /// A width in bits.
    Size(u16),
}

impl Operand {
    /// The stack-slot name of a `Name` or `Temp` operand, if it is one.
    pub fn slot_name(&self) -> Option<String> {
        match self {
            Operand::Name(n) => Some(n.clone()),
            Operand::Temp(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// True for `Name`/`Temp` operands, which live in stack slots.
    pub fn is_slot(&self) -> bool {
        matches!(self, Operand::Name(_) | Operand::Temp(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Int(v) => write!(f, "{v}"),
            Operand::UInt(v) => write!(f, "{v}u"),
            Operand::Float(v) => write!(f, "{v}"),
            Operand::Bool(v) => write!(f, "{v}"),
            Operand::Char(c) => write!(f, "'{}'", *c as char),
            Operand::Name(n) => write!(f, "{n}"),
            Operand::Temp(n) => write!(f, "%{n}"),
            Operand::Type(t) => write!(f, "{t}"),
            Operand::Size(b) => write!(f, "{b}b"),
        }
    }
}

/// One IR instruction: an opcode, a source line (0 if unknown) and operands.
#[derive(Clone, Debug, PartialEq)]
pub struct Inst {
    /// The operation.
    pub opcode: Opcode,
    /// 1-based source line, or 0 when no location is known.
    pub line: u32,
    /// Operand list; the layout is an opcode-specific contract.
    pub operands: Vec<Operand>,
}

impl Inst {
    /// Create an instruction with no source location.
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Self {
            opcode,
            line: 0,
            operands,
        }
    }

    /// Create an instruction carrying a source line.
    pub fn with_line(opcode: Opcode, line: u32, operands: Vec<Operand>) -> Self {
        Self {
            opcode,
            line,
            operands,
        }
    }

    /// Fetch operand `index` or report a count mismatch.
    pub fn operand(&self, index: usize) -> CodegenResult<&Operand> {
        self.operands.get(index).ok_or_else(|| {
            CodegenError::malformed(
                self.opcode,
                index,
                format!("expected at least {} operands", index + 1),
            )
        })
    }

    /// Operand `index` as an identifier name.
    pub fn name(&self, index: usize) -> CodegenResult<&str> {
        match self.operand(index)? {
            Operand::Name(n) => Ok(n),
            other => Err(CodegenError::malformed(
                self.opcode,
                index,
                format!("expected a name, found {other}"),
            )),
        }
    }

    /// Operand `index` as a stack-slot name (`Name` or `Temp`).
    pub fn slot(&self, index: usize) -> CodegenResult<String> {
        self.operand(index)?.slot_name().ok_or_else(|| {
            CodegenError::malformed(self.opcode, index, "expected a variable or temporary")
        })
    }

    /// Operand `index` as a type tag.
    pub fn type_tag(&self, index: usize) -> CodegenResult<TypeTag> {
        match self.operand(index)? {
            Operand::Type(t) => Ok(*t),
            other => Err(CodegenError::malformed(
                self.opcode,
                index,
                format!("expected a type tag, found {other}"),
            )),
        }
    }

    /// Operand `index` as a width in bits.
    pub fn bits(&self, index: usize) -> CodegenResult<u16> {
        match self.operand(index)? {
            Operand::Size(b) => Ok(*b),
            other => Err(CodegenError::malformed(
                self.opcode,
                index,
                format!("expected a bit width, found {other}"),
            )),
        }
    }

    /// Operand `index` as a signed integer literal.
    pub fn int(&self, index: usize) -> CodegenResult<i64> {
        match self.operand(index)? {
            Operand::Int(v) => Ok(*v),
            Operand::UInt(v) => Ok(*v as i64),
            other => Err(CodegenError::malformed(
                self.opcode,
                index,
                format!("expected an integer literal, found {other}"),
            )),
        }
    }

    /// Operand `index` as a boolean literal.
    pub fn bool(&self, index: usize) -> CodegenResult<bool> {
        match self.operand(index)? {
            Operand::Bool(v) => Ok(*v),
            other => Err(CodegenError::malformed(
                self.opcode,
                index,
                format!("expected a boolean literal, found {other}"),
            )),
        }
    }

    /// Require exactly `count` operands.
    pub fn expect_operands(&self, count: usize) -> CodegenResult<()> {
        if self.operands.len() == count {
            Ok(())
        } else {
            Err(CodegenError::malformed(
                self.opcode,
                self.operands.len(),
                format!("expected {count} operands, found {}", self.operands.len()),
            ))
        }
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " ")?;
            } else {
                write!(f, ", ")?;
            }
            write!(f, "{op}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_accessors_enforce_layout() {
        let inst = Inst::new(
            Opcode::Add,
            vec![
                Operand::Temp(1),
                Operand::Type(TypeTag::I32),
                Operand::Size(32),
                Operand::Name("a".to_string()),
            ],
        );
        assert_eq!(inst.slot(0).unwrap(), "1");
        assert_eq!(inst.type_tag(1).unwrap(), TypeTag::I32);
        assert_eq!(inst.bits(2).unwrap(), 32);
        assert_eq!(inst.name(3).unwrap(), "a");
        assert!(inst.operand(4).is_err());
        assert!(inst.bits(0).is_err());
    }

    #[test]
    fn display_forms() {
        let inst = Inst::new(
            Opcode::Assignment,
            vec![
                Operand::Name("x".to_string()),
                Operand::Type(TypeTag::I32),
                Operand::Size(32),
                Operand::Int(7),
            ],
        );
        assert_eq!(inst.to_string(), "assign x, i32, 32b, 7");
    }
}
