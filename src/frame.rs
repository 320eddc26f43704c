//! Stack frame layout.
//!
//! Frames are computed in two phases before any code for the function is
//! emitted: a discovery walk over the function's IR collecting sizes, and a
//! downward slot-assignment pass. The layout contract is:
//!
//! ```text
//! [rbp + 16 + S + 8j]  j-th stack-passed argument (S = shadow space)
//! [rbp + 8]            return address
//! [rbp + 0]            saved caller rbp
//! [rbp - 8n]           n-th temporary (1-based)
//! [rbp - ...]          register-parameter homes (System V), then locals
//! ```
//!
//! Temporaries get the region directly below the saved frame pointer so
//! that the canonical `rbp - 8n` slot of temporary `n` holds regardless of
//! how declarations interleave with expression evaluation.
//!
//! Parameter homes follow [`abi::classify_args`], the same classification
//! the call-site lowering uses, so a callee's recorded slots always match
//! what its callers physically produce. On Windows every register
//! parameter's home is its shadow-space slot at `rbp + 16 + 8k`; System V
//! has no caller-provided slot for register parameters, so they are homed
//! below the temporaries like locals.

use crate::ir::{Inst, Opcode, Operand, TypeTag};
use crate::isa::x64::abi::{self, ArgLoc};
use crate::isa::CallConv;
use crate::result::{CodegenError, CodegenResult};
use log::debug;
use rustc_hash::FxHashMap;

/// Metadata for a stack slot that holds a reference.
///
/// A reference is stored as a pointer but every use reads or writes the
/// referent, so its type and width must survive past the declaration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReferenceInfo {
    /// The referred-to type.
    pub referent: TypeTag,
    /// Width of the referent in bits.
    pub bits: u16,
    /// True for rvalue references.
    pub rvalue: bool,
}

/// One parameter's slot record, in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSlot {
    /// Parameter name.
    pub name: String,
    /// Declared type (the reference flavor for reference parameters).
    pub ty: TypeTag,
    /// Value width in bits (the referent's width for references).
    pub bits: u16,
    /// Home slot offset from rbp.
    pub offset: i32,
}

/// One function's name-to-slot mapping and slot metadata.
pub struct VariableScope {
    /// The function this scope belongs to.
    pub function: String,
    offsets: FxHashMap<String, i32>,
    bits: FxHashMap<String, u16>,
    types: FxHashMap<String, TypeTag>,
    refs: FxHashMap<i32, ReferenceInfo>,
    /// The most negative offset handed out; total local usage is
    /// `-stack_space`.
    pub stack_space: i32,
    /// Total frame allocation emitted by the prologue, 16-byte aligned.
    pub frame_size: u32,
    /// Parameters in declaration order.
    pub params: Vec<ParamSlot>,
    /// True when the body contains any call; on Windows this adds shadow
    /// space to the frame.
    pub makes_calls: bool,
}

impl VariableScope {
    /// The stack offset of `name`.
    pub fn offset_of(&self, name: &str) -> CodegenResult<i32> {
        self.offsets
            .get(name)
            .copied()
            .ok_or_else(|| CodegenError::UndefinedIdentifier(name.to_string()))
    }

    /// The access width of `name`'s slot, in bits.
    pub fn bits_of(&self, name: &str) -> u16 {
        self.bits.get(name).copied().unwrap_or(64)
    }

    /// The declared type of `name`, if known.
    pub fn type_of(&self, name: &str) -> Option<TypeTag> {
        self.types.get(name).copied()
    }

    /// Reference metadata for the slot at `offset`, if the slot holds a
    /// reference.
    pub fn reference_at(&self, offset: i32) -> Option<ReferenceInfo> {
        self.refs.get(&offset).copied()
    }

    /// Iterate all (name, offset) pairs; used by debug-info registration.
    pub fn slots(&self) -> impl Iterator<Item = (&String, i32)> {
        self.offsets.iter().map(|(n, o)| (n, *o))
    }
}

/// Computes a [`VariableScope`] for one function.
pub struct FrameBuilder {
    call_conv: CallConv,
}

impl FrameBuilder {
    /// A builder for the given calling convention.
    pub fn new(call_conv: CallConv) -> Self {
        Self { call_conv }
    }

    /// Build the frame for `body`, which must start with the function's
    /// `FunctionDecl` and run to (but not include) the next one.
    pub fn build(&self, body: &[Inst]) -> CodegenResult<VariableScope> {
        let decl = body.first().ok_or_else(|| {
            CodegenError::InconsistentState("frame computation over an empty function".into())
        })?;
        if decl.opcode != Opcode::FunctionDecl {
            return Err(CodegenError::InconsistentState(format!(
                "function body starts with {}, not function_decl",
                decl.opcode
            )));
        }
        let function = decl.name(0)?.to_string();

        let mut scope = VariableScope {
            function,
            offsets: FxHashMap::default(),
            bits: FxHashMap::default(),
            types: FxHashMap::default(),
            refs: FxHashMap::default(),
            stack_space: 0,
            frame_size: 0,
            params: Vec::new(),
            makes_calls: false,
        };

        let params = parse_params(decl)?;

        // Phase A: discover temporaries (highest generation index and the
        // width each op gives its result) and whether any call happens.
        let mut max_temp = 0u32;
        let mut temp_bits: FxHashMap<u32, u16> = FxHashMap::default();
        for inst in body {
            if inst.opcode.is_call() {
                scope.makes_calls = true;
            }
            for op in &inst.operands {
                if let Operand::Temp(n) = op {
                    max_temp = max_temp.max(*n);
                }
            }
            if let Some(Operand::Temp(n)) = inst.operands.first() {
                if let Some(bits) = result_bits(inst) {
                    temp_bits.insert(*n, bits);
                }
            }
        }
        for n in 1..=max_temp {
            let offset = -8 * n as i32;
            scope.offsets.insert(n.to_string(), offset);
            scope.bits.insert(n.to_string(), temp_bits.get(&n).copied().unwrap_or(64));
        }

        // Phase B: parameter homes directly below the temporary region,
        // then locals in declaration order. Slots are rounded out to their
        // alignment (at least 8), so every offset is a multiple of 8 below
        // `-8 * max_temp`.
        let mut offset = -8 * max_temp as i32;
        self.assign_params(&params, &mut scope, &mut offset);
        for inst in body.iter().filter(|i| i.opcode == Opcode::VariableDecl) {
            inst.expect_operands(6)?;
            let name = inst.name(0)?.to_string();
            let ty = inst.type_tag(1)?;
            let bits = inst.bits(2)?;
            let count = inst.int(3)?.max(1) as u32;
            let explicit_align = inst.int(4)?.max(0) as u32;
            let referent = inst.type_tag(5)?;

            let size = if ty.is_reference() {
                8
            } else {
                (u32::from(bits) / 8).max(1) * count
            };
            let align = explicit_align.max(8);
            let slot = round_up(size, align);

            offset = round_down(offset, align as i32);
            offset -= slot as i32;
            scope.offsets.insert(name.clone(), offset);
            scope.bits.insert(name.clone(), bits);
            scope.types.insert(name.clone(), ty);
            if ty.is_reference() {
                scope.refs.insert(
                    offset,
                    ReferenceInfo {
                        referent,
                        bits,
                        rvalue: ty == TypeTag::RvalueReference,
                    },
                );
            }
        }
        scope.stack_space = offset;

        let mut frame = (-offset as u32).max(scope.params.len() as u32 * 8);
        if scope.makes_calls {
            frame += self.call_conv.shadow_space();
        }
        scope.frame_size = round_up(frame, 16);
        debug!(
            "frame for {}: {} bytes ({} locals span, {} params)",
            scope.function,
            scope.frame_size,
            -scope.stack_space,
            scope.params.len()
        );
        Ok(scope)
    }

    /// Assign each parameter's home slot, per the shared argument
    /// classification.
    ///
    /// A stack-passed argument already has a physical slot above the
    /// return address: `16 + shadow + 8j`, where `j` counts only the
    /// stack-passed arguments, exactly where the call-site lowering pushes
    /// it. A register-passed parameter's home is its shadow-space slot on
    /// Windows; on System V no caller-side slot exists, so it is homed in
    /// the frame at `*offset`, which the caller advances past the
    /// temporary region first.
    fn assign_params(&self, params: &[ParamDecl], scope: &mut VariableScope, offset: &mut i32) {
        let locs = abi::classify_args(self.call_conv, params.iter().map(|p| p.ty.is_float()));
        for (k, (param, loc)) in params.iter().zip(&locs).enumerate() {
            let home = match (self.call_conv, loc) {
                (_, ArgLoc::Stack(j)) => {
                    16 + self.call_conv.shadow_space() as i32 + 8 * *j as i32
                }
                (CallConv::WindowsFastcall, _) => 16 + 8 * k as i32,
                (CallConv::SystemV, _) => {
                    *offset -= 8;
                    *offset
                }
            };
            scope.offsets.insert(param.name.clone(), home);
            scope.bits.insert(param.name.clone(), param.bits);
            scope.types.insert(param.name.clone(), param.ty);
            scope.params.push(ParamSlot {
                name: param.name.clone(),
                ty: param.ty,
                bits: param.bits,
                offset: home,
            });
            if param.ty.is_reference() {
                scope.refs.insert(
                    home,
                    ReferenceInfo {
                        referent: param.referent,
                        bits: param.bits,
                        rvalue: param.ty == TypeTag::RvalueReference,
                    },
                );
            }
        }
    }
}

struct ParamDecl {
    name: String,
    ty: TypeTag,
    bits: u16,
    referent: TypeTag,
}

fn parse_params(decl: &Inst) -> CodegenResult<Vec<ParamDecl>> {
    let param_count = decl.int(3)? as usize;
    let mut params = Vec::with_capacity(param_count);
    for k in 0..param_count {
        let at = 4 + k * 4;
        params.push(ParamDecl {
            name: decl.name(at)?.to_string(),
            ty: decl.type_tag(at + 1)?,
            bits: decl.bits(at + 2)?,
            referent: decl.type_tag(at + 3)?,
        });
    }
    Ok(params)
}

fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round a (negative-going) offset down to a multiple of `align`.
fn round_down(offset: i32, align: i32) -> i32 {
    debug_assert!(align > 0 && (align as u32).is_power_of_two());
    offset & !(align - 1)
}

fn result_bits(inst: &Inst) -> Option<u16> {
    use Opcode::*;
    match inst.opcode {
        // Size lives in operand 2 for the value-producing expression ops.
        op if op.is_binary() => inst.bits(2).ok(),
        LogicalNot | BitwiseNot | Negate | SignExtend | ZeroExtend | Truncate | Dereference => {
            inst.bits(2).ok()
        }
        ArrayAccess | FunctionCall | IndirectCall => inst.bits(3).ok(),
        MemberAccess | VirtualCall => inst.bits(4).ok(),
        GlobalLoad => inst.bits(3).ok(),
        PreIncrement | PostIncrement | PreDecrement | PostDecrement => inst.bits(3).ok(),
        // Pointer-producing ops.
        AddressOf | HeapAlloc | HeapAllocArray | PlacementNew | Typeid | DynamicCast
        | FunctionAddress | StringLiteral => Some(64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Operand::*;

    fn decl_fn(name: &str, params: &[(&str, TypeTag, u16)]) -> Inst {
        let mut ops = vec![
            Name(name.to_string()),
            Type(TypeTag::I32),
            Size(32),
            Int(params.len() as i64),
        ];
        for (n, ty, bits) in params {
            ops.push(Name(n.to_string()));
            ops.push(Type(*ty));
            ops.push(Size(*bits));
            ops.push(Type(if ty.is_reference() { TypeTag::I32 } else { *ty }));
        }
        Inst::new(Opcode::FunctionDecl, ops)
    }

    fn decl_var(name: &str, ty: TypeTag, bits: u16, count: i64, align: i64) -> Inst {
        Inst::new(
            Opcode::VariableDecl,
            vec![
                Name(name.to_string()),
                Type(ty),
                Size(bits),
                Int(count),
                Int(align),
                Type(ty),
            ],
        )
    }

    #[test]
    fn locals_stack_downward() {
        let body = vec![
            decl_fn("f", &[]),
            decl_var("a", TypeTag::I32, 32, 1, 0),
            decl_var("b", TypeTag::I64, 64, 1, 0),
            decl_var("c", TypeTag::I8, 8, 1, 0),
        ];
        let scope = FrameBuilder::new(CallConv::SystemV).build(&body).unwrap();
        assert_eq!(scope.offset_of("a").unwrap(), -8);
        assert_eq!(scope.offset_of("b").unwrap(), -16);
        assert_eq!(scope.offset_of("c").unwrap(), -24);
        assert_eq!(scope.stack_space, -24);
        assert_eq!(scope.frame_size, 32);
    }

    #[test]
    fn alignas_rounds_slots() {
        let body = vec![
            decl_fn("f", &[]),
            decl_var("a", TypeTag::I32, 32, 1, 0),
            decl_var("v", TypeTag::I8, 8, 1, 32),
        ];
        let scope = FrameBuilder::new(CallConv::SystemV).build(&body).unwrap();
        assert_eq!(scope.offset_of("a").unwrap(), -8);
        // 32-byte alignment: slot rounds out to 32 bytes below an aligned
        // boundary.
        assert_eq!(scope.offset_of("v").unwrap(), -64);
        assert_eq!(scope.offset_of("v").unwrap() % 32, 0);
    }

    #[test]
    fn arrays_scale_by_count() {
        let body = vec![decl_fn("f", &[]), decl_var("buf", TypeTag::I32, 32, 10, 0)];
        let scope = FrameBuilder::new(CallConv::SystemV).build(&body).unwrap();
        assert_eq!(scope.offset_of("buf").unwrap(), -40);
    }

    #[test]
    fn temporaries_get_canonical_slots() {
        let body = vec![
            decl_fn("f", &[]),
            Inst::new(
                Opcode::Add,
                vec![
                    Temp(2),
                    Type(TypeTag::I32),
                    Size(32),
                    Temp(1),
                    Type(TypeTag::I32),
                    Size(32),
                    Int(5),
                ],
            ),
            decl_var("x", TypeTag::I32, 32, 1, 0),
        ];
        let scope = FrameBuilder::new(CallConv::SystemV).build(&body).unwrap();
        assert_eq!(scope.offset_of("1").unwrap(), -8);
        assert_eq!(scope.offset_of("2").unwrap(), -16);
        assert_eq!(scope.bits_of("2"), 32);
        // Locals land below the temporary region.
        assert_eq!(scope.offset_of("x").unwrap(), -24);
    }

    #[test]
    fn references_store_pointers() {
        let body = vec![
            decl_fn("f", &[("x", TypeTag::Reference, 32)]),
            decl_var("r", TypeTag::Reference, 32, 1, 0),
        ];
        // On Windows the register parameter homes in its shadow slot.
        let scope = FrameBuilder::new(CallConv::WindowsFastcall)
            .build(&body)
            .unwrap();
        assert_eq!(scope.offset_of("x").unwrap(), 16);
        let info = scope.reference_at(16).unwrap();
        assert_eq!(info.bits, 32);
        assert!(!info.rvalue);
        // A reference local occupies one pointer-sized slot.
        assert_eq!(scope.offset_of("r").unwrap(), -8);
        assert!(scope.reference_at(-8).is_some());

        // System V has no shadow space; the register parameter homes in
        // the frame, above the locals.
        let scope = FrameBuilder::new(CallConv::SystemV).build(&body).unwrap();
        assert_eq!(scope.offset_of("x").unwrap(), -8);
        assert!(scope.reference_at(-8).is_some());
        assert_eq!(scope.offset_of("r").unwrap(), -16);
        assert!(scope.reference_at(-16).is_some());
    }

    #[test]
    fn sysv_stack_passed_params_home_where_the_caller_pushes() {
        let params: Vec<(String, TypeTag, u16)> = (0..8)
            .map(|k| (format!("p{k}"), TypeTag::I64, 64))
            .collect();
        let named: Vec<(&str, TypeTag, u16)> = params
            .iter()
            .map(|(n, ty, bits)| (n.as_str(), *ty, *bits))
            .collect();
        let body = vec![decl_fn("f", &named), decl_var("a", TypeTag::I64, 64, 1, 0)];
        let scope = FrameBuilder::new(CallConv::SystemV).build(&body).unwrap();

        // Six register parameters home below the (empty) temporary region.
        for k in 0..6 {
            assert_eq!(scope.offset_of(&format!("p{k}")).unwrap(), -8 * (k + 1));
        }
        // The seventh and eighth are stack-passed: the caller pushes them
        // at [rbp+16] and [rbp+24] of the callee (no shadow space), and
        // their homes must say so regardless of their declaration index.
        assert_eq!(scope.offset_of("p6").unwrap(), 16);
        assert_eq!(scope.offset_of("p7").unwrap(), 24);
        // Locals continue below the register-parameter homes.
        assert_eq!(scope.offset_of("a").unwrap(), -56);
    }

    #[test]
    fn windows_fifth_param_homes_above_the_shadow_space() {
        let params: Vec<(String, TypeTag, u16)> = (0..5)
            .map(|k| (format!("p{k}"), TypeTag::I32, 32))
            .collect();
        let named: Vec<(&str, TypeTag, u16)> = params
            .iter()
            .map(|(n, ty, bits)| (n.as_str(), *ty, *bits))
            .collect();
        let body = vec![decl_fn("f", &named)];
        let scope = FrameBuilder::new(CallConv::WindowsFastcall)
            .build(&body)
            .unwrap();

        // Register parameters home in the four shadow slots; the fifth is
        // stack-passed directly above them, which is the same 16 + 8k.
        for k in 0..5 {
            assert_eq!(scope.offset_of(&format!("p{k}")).unwrap(), 16 + 8 * k);
        }
    }

    #[test]
    fn sysv_float_quota_is_independent_of_int_quota() {
        // One float and seven integers: the float takes XMM0, the first
        // six integers take the GPRs, and only the seventh integer goes to
        // the stack at index 0.
        let params: Vec<(String, TypeTag, u16)> = std::iter::once(("f0".to_string(), TypeTag::F64, 64))
            .chain((0..7).map(|k| (format!("p{k}"), TypeTag::I64, 64)))
            .collect();
        let named: Vec<(&str, TypeTag, u16)> = params
            .iter()
            .map(|(n, ty, bits)| (n.as_str(), *ty, *bits))
            .collect();
        let body = vec![decl_fn("f", &named)];
        let scope = FrameBuilder::new(CallConv::SystemV).build(&body).unwrap();

        assert_eq!(scope.offset_of("f0").unwrap(), -8);
        assert_eq!(scope.offset_of("p5").unwrap(), -56);
        assert_eq!(scope.offset_of("p6").unwrap(), 16);
    }

    #[test]
    fn shadow_space_only_when_calling() {
        let call = Inst::new(
            Opcode::FunctionCall,
            vec![Temp(1), Name("g".into()), Type(TypeTag::Void), Size(0)],
        );
        let leaf = vec![decl_fn("f", &[]), decl_var("a", TypeTag::I64, 64, 1, 0)];
        let caller = vec![
            decl_fn("f", &[]),
            decl_var("a", TypeTag::I64, 64, 1, 0),
            call,
        ];
        let win = FrameBuilder::new(CallConv::WindowsFastcall);
        assert_eq!(win.build(&leaf).unwrap().frame_size, 16);
        // 8 (local) + 8 (temp) + 32 (shadow) rounded to 16.
        assert_eq!(win.build(&caller).unwrap().frame_size, 48);
        let sysv = FrameBuilder::new(CallConv::SystemV);
        assert_eq!(sysv.build(&caller).unwrap().frame_size, 16);
    }

    #[test]
    fn offsets_stay_in_frame_bounds() {
        let body = vec![
            decl_fn("f", &[("p", TypeTag::I64, 64)]),
            decl_var("a", TypeTag::I32, 32, 1, 0),
            decl_var("b", TypeTag::I16, 16, 3, 0),
        ];
        let scope = FrameBuilder::new(CallConv::SystemV).build(&body).unwrap();
        for (_, offset) in scope.slots() {
            assert!(
                (scope.stack_space..=-8).contains(&offset) || offset >= 16,
                "offset {offset} escapes the frame"
            );
        }
    }
}
