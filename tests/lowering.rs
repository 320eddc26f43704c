//! End-to-end lowering scenarios: each builds a small IR stream, converts
//! it against a recording writer, and checks properties of the emitted
//! bytes and writer calls.

use kiln_codegen::ir::{Inst, Opcode, Operand, TypeTag};
use kiln_codegen::isa::CallConv;
use kiln_codegen::obj::{Linkage, ObjectWriter, Reloc, SectionKind};
use kiln_codegen::Context;

use Operand::{Int, Name, Size, Temp, Type};

/// An [`ObjectWriter`] that records every call and performs identity
/// mangling, so tests can assert against plain names.
#[derive(Default)]
struct RecordingWriter {
    functions: Vec<(String, u32, u32, Linkage)>,
    lengths: Vec<(String, u32)>,
    exception_info: Vec<(String, u32, u32)>,
    parameters: Vec<(String, TypeTag, i32)>,
    locals: Vec<(String, TypeTag, i32)>,
    line_mappings: Vec<(u32, u32)>,
    strings: Vec<String>,
    globals: Vec<(String, u32, bool, u64)>,
    relocations: Vec<(u32, String, Reloc)>,
    text: Vec<u8>,
    written: Option<String>,
}

impl ObjectWriter for RecordingWriter {
    fn add_function_symbol(&mut self, name: &str, offset: u32, frame_size: u32, linkage: Linkage) {
        self.functions
            .push((name.to_string(), offset, frame_size, linkage));
    }

    fn update_function_length(&mut self, name: &str, length: u32) {
        self.lengths.push((name.to_string(), length));
    }

    fn add_function_exception_info(&mut self, name: &str, offset: u32, length: u32) {
        self.exception_info.push((name.to_string(), offset, length));
    }

    fn add_function_parameter(&mut self, name: &str, ty: TypeTag, frame_offset: i32) {
        self.parameters.push((name.to_string(), ty, frame_offset));
    }

    fn add_local_variable(&mut self, name: &str, ty: TypeTag, frame_offset: i32) {
        self.locals.push((name.to_string(), ty, frame_offset));
    }

    fn add_line_mapping(&mut self, offset: u32, line: u32) {
        self.line_mappings.push((offset, line));
    }

    fn add_string_literal(&mut self, contents: &str) -> String {
        if !self.strings.iter().any(|s| s == contents) {
            self.strings.push(contents.to_string());
        }
        let index = self.strings.iter().position(|s| s == contents).unwrap();
        format!("__string_{index}")
    }

    fn add_global_variable(&mut self, name: &str, size: u32, initialized: bool, init_value: u64) {
        self.globals
            .push((name.to_string(), size, initialized, init_value));
    }

    fn add_relocation(&mut self, offset: u32, symbol: &str, kind: Reloc) {
        self.relocations.push((offset, symbol.to_string(), kind));
    }

    fn add_data(&mut self, bytes: &[u8], section: SectionKind) {
        assert_eq!(section, SectionKind::Text);
        self.text.extend_from_slice(bytes);
    }

    fn mangled_name(&self, _name: &str) -> Option<String> {
        None
    }

    fn generate_mangled_name(&mut self, name: &str, _signature: &str) -> String {
        name.to_string()
    }

    fn write(&mut self, filename: &str) -> std::io::Result<()> {
        self.written = Some(filename.to_string());
        Ok(())
    }
}

fn convert(ir: &[Inst]) -> RecordingWriter {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut writer = RecordingWriter::default();
    let ctx = Context::with_call_conv(CallConv::WindowsFastcall);
    ctx.convert(ir, &mut writer, "out.obj").unwrap();
    writer
}

fn function_decl(name: &str, ret: TypeTag, ret_bits: u16) -> Inst {
    function_decl_with_params(name, ret, ret_bits, &[])
}

fn function_decl_with_params(
    name: &str,
    ret: TypeTag,
    ret_bits: u16,
    params: &[(&str, TypeTag, u16)],
) -> Inst {
    let mut ops = vec![
        Name(name.to_string()),
        Type(ret),
        Size(ret_bits),
        Int(params.len() as i64),
    ];
    for (n, ty, bits) in params {
        ops.push(Name(n.to_string()));
        ops.push(Type(*ty));
        ops.push(Size(*bits));
        ops.push(Type(*ty));
    }
    Inst::new(Opcode::FunctionDecl, ops)
}

fn variable_decl(name: &str, ty: TypeTag, bits: u16) -> Inst {
    Inst::new(
        Opcode::VariableDecl,
        vec![
            Name(name.to_string()),
            Type(ty),
            Size(bits),
            Int(1),
            Int(0),
            Type(ty),
        ],
    )
}

fn assign(dest: Operand, ty: TypeTag, bits: u16, value: Operand) -> Inst {
    Inst::new(Opcode::Assignment, vec![dest, Type(ty), Size(bits), value])
}

/// Find the byte offset of `needle` inside `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .filter(|window| *window == needle)
        .count()
}

#[test]
fn return_a_literal() {
    let ir = [
        function_decl("main", TypeTag::I32, 32),
        Inst::new(
            Opcode::Return,
            vec![Type(TypeTag::I32), Size(32), Int(42)],
        ),
    ];
    let w = convert(&ir);

    // push rbp; mov rbp, rsp; mov eax, 42; mov rsp, rbp; pop rbp; ret.
    assert_eq!(
        w.text,
        [
            0x55, 0x48, 0x8B, 0xEC, //
            0xB8, 0x2A, 0x00, 0x00, 0x00, //
            0x48, 0x89, 0xEC, 0x5D, 0xC3,
        ]
    );
    assert_eq!(w.functions.len(), 1);
    let (name, offset, _, linkage) = &w.functions[0];
    assert_eq!(name, "main");
    assert_eq!(*offset, 0);
    assert_eq!(*linkage, Linkage::Export);
    assert_eq!(w.lengths, vec![("main".to_string(), 14)]);
    assert_eq!(w.exception_info, vec![("main".to_string(), 0, 14)]);
    assert_eq!(w.written.as_deref(), Some("out.obj"));
}

#[test]
fn add_two_locals() {
    let i32t = TypeTag::I32;
    let ir = [
        function_decl("f", i32t, 32),
        variable_decl("a", i32t, 32),
        variable_decl("b", i32t, 32),
        variable_decl("c", i32t, 32),
        assign(Name("a".into()), i32t, 32, Int(3)),
        assign(Name("b".into()), i32t, 32, Int(5)),
        Inst::new(
            Opcode::Add,
            vec![
                Temp(1),
                Type(i32t),
                Size(32),
                Name("a".into()),
                Type(i32t),
                Size(32),
                Name("b".into()),
            ],
        ),
        assign(Name("c".into()), i32t, 32, Temp(1)),
        Inst::new(
            Opcode::Return,
            vec![Type(i32t), Size(32), Name("c".into())],
        ),
    ];
    let w = convert(&ir);

    // Frame: temp at -8, a/b/c at -16/-24/-32, 16-byte aligned.
    assert_eq!(w.functions[0].2, 32);
    assert!(w.functions[0].2 >= 16);
    // Three 32-bit stores to [rbp+disp8]: a = 3, b = 5, c = a + b.
    assert_eq!(count(&w.text, &[0x89, 0x45]), 3);
    // Exactly one add reg, reg.
    assert_eq!(count(&w.text, &[0x03, 0xC1]), 1);
    // The function ends by reloading c: mov eax, [rbp-32], then the
    // epilogue.
    let tail = [0x8B, 0x45, 0xE0, 0x48, 0x89, 0xEC, 0x5D, 0xC3];
    assert_eq!(&w.text[w.text.len() - tail.len()..], &tail);
    // Debug info saw all three locals.
    assert_eq!(w.locals.len(), 3);
}

#[test]
fn forward_branch_patches_to_false_target() {
    let i32t = TypeTag::I32;
    let ir = [
        function_decl("f", i32t, 32),
        variable_decl("flag", i32t, 32),
        assign(Name("flag".into()), i32t, 32, Int(1)),
        Inst::new(Opcode::Label, vec![Name("L1".into())]),
        Inst::new(
            Opcode::ConditionalBranch,
            vec![Name("flag".into()), Name("L2".into()), Name("L3".into())],
        ),
        Inst::new(Opcode::Label, vec![Name("L2".into())]),
        assign(Name("flag".into()), i32t, 32, Int(2)),
        Inst::new(Opcode::Label, vec![Name("L3".into())]),
        Inst::new(Opcode::Return, vec![Type(i32t), Size(32), Int(0)]),
    ];
    let w = convert(&ir);

    // The conditional site: test eax, eax; je L3.
    let at = find(&w.text, &[0x85, 0xC0, 0x0F, 0x84]).expect("test + je");
    let site = at + 4;
    let rel = i32::from_le_bytes(w.text[site..site + 4].try_into().unwrap());
    // L2's body is mov rax, imm64 (10 bytes) plus a 3-byte store; L3 sits
    // immediately after, so the displacement from the end of the je is 13.
    assert_eq!(rel, 13);
}

#[test]
fn signed_divide_goes_through_cqo() {
    let i32t = TypeTag::I32;
    let ir = [
        function_decl("f", i32t, 32),
        variable_decl("q", i32t, 32),
        Inst::new(
            Opcode::Div,
            vec![
                Temp(1),
                Type(i32t),
                Size(32),
                Int(-10),
                Type(i32t),
                Size(32),
                Int(3),
            ],
        ),
        assign(Name("q".into()), i32t, 32, Temp(1)),
        Inst::new(Opcode::Return, vec![Type(i32t), Size(32), Name("q".into())]),
    ];
    let w = convert(&ir);

    // cqo immediately followed by idiv rcx.
    assert!(find(&w.text, &[0x48, 0x99, 0x48, 0xF7, 0xF9]).is_some());
    // The 32-bit dividend is sign-extended before the division: movsxd
    // rax, eax.
    let movsxd = find(&w.text, &[0x48, 0x63, 0xC0]).expect("movsxd rax, eax");
    let cqo = find(&w.text, &[0x48, 0x99]).unwrap();
    assert!(movsxd < cqo);
}

#[test]
fn virtual_call_sequence() {
    let ir = [
        function_decl("f", TypeTag::Void, 0),
        variable_decl("obj", TypeTag::Struct, 128),
        Inst::new(
            Opcode::VirtualCall,
            vec![
                Temp(1),
                Name("obj".into()),
                Int(2),
                Type(TypeTag::I32),
                Size(32),
            ],
        ),
        Inst::new(Opcode::Return, vec![]),
    ];
    let w = convert(&ir);

    // obj sits at [rbp-24] (16-byte object below the temp slot). The
    // dispatch sequence: load the vtable pointer from [obj], load entry 2
    // from [vtable+16], materialize `this` in rcx, call, store the result.
    let expected = [
        0x48, 0x8B, 0x45, 0xE8, // mov rax, [rbp-24]
        0x48, 0x8B, 0x40, 0x10, // mov rax, [rax+16]
        0x48, 0x8D, 0x4D, 0xE8, // lea rcx, [rbp-24]
        0xFF, 0xD0, // call rax
        0x89, 0x45, 0xF8, // mov [rbp-8], eax
    ];
    assert!(find(&w.text, &expected).is_some());
}

#[test]
fn reference_parameter_stores_through_pointer() {
    let ir = [
        Inst::new(
            Opcode::FunctionDecl,
            vec![
                Name("f".into()),
                Type(TypeTag::Void),
                Size(0),
                Int(1),
                Name("x".into()),
                Type(TypeTag::Reference),
                Size(32),
                Type(TypeTag::I32),
            ],
        ),
        assign(Name("x".into()), TypeTag::I32, 32, Int(7)),
        Inst::new(Opcode::Return, vec![]),
    ];
    let w = convert(&ir);

    // The prologue homes the parameter's pointer: mov [rbp+16], rcx.
    assert!(find(&w.text, &[0x48, 0x89, 0x4D, 0x10]).is_some());
    // The assignment loads the pointer back and stores through it rather
    // than writing the frame slot: mov rcx, [rbp+16]; mov [rcx], eax.
    assert!(find(&w.text, &[0x48, 0x8B, 0x4D, 0x10, 0x89, 0x01]).is_some());
    assert_eq!(w.parameters, vec![("x".to_string(), TypeTag::Reference, 16)]);
}

#[test]
fn windows_call_places_args_and_shadow_space() {
    let i32t = TypeTag::I32;
    let ir = [
        function_decl("caller", i32t, 32),
        Inst::new(
            Opcode::FunctionCall,
            vec![
                Temp(1),
                Name("callee".into()),
                Type(i32t),
                Size(32),
                Type(i32t),
                Size(32),
                Int(1),
                Type(i32t),
                Size(32),
                Int(2),
            ],
        ),
        Inst::new(Opcode::Return, vec![Type(i32t), Size(32), Temp(1)]),
    ];
    let w = convert(&ir);

    // Shadow space lives in the frame: 8 (temp) + 32, rounded to 48.
    assert_eq!(w.functions[0].2, 48);
    // Arguments land in ecx and edx: mov ecx, 1; mov edx, 2.
    assert!(find(&w.text, &[0xB9, 0x01, 0x00, 0x00, 0x00]).is_some());
    assert!(find(&w.text, &[0xBA, 0x02, 0x00, 0x00, 0x00]).is_some());
    // One call relocation against the callee at the rel32 field of e8.
    let call = find(&w.text, &[0xE8, 0x00, 0x00, 0x00, 0x00]).expect("call rel32");
    assert!(w
        .relocations
        .iter()
        .any(|(offset, symbol, kind)| *offset as usize == call + 1
            && symbol == "callee"
            && *kind == Reloc::Rel32));
    // The return value is stored from rax after the call.
    assert!(find(&w.text, &[0xFF, 0xD0]).is_none());
    let store = find(&w.text, &[0x89, 0x45, 0xF8]).expect("store of rax");
    assert!(store > call);
}

#[test]
fn global_load_defers_relocation() {
    let i32t = TypeTag::I32;
    let ir = [
        Inst::new(
            Opcode::GlobalVariableDecl,
            vec![
                Name("counter".into()),
                Type(i32t),
                Size(32),
                Operand::Bool(true),
                Int(7),
            ],
        ),
        function_decl("f", i32t, 32),
        variable_decl("x", i32t, 32),
        Inst::new(
            Opcode::GlobalLoad,
            vec![Temp(1), Name("counter".into()), Type(i32t), Size(32)],
        ),
        assign(Name("x".into()), i32t, 32, Temp(1)),
        Inst::new(Opcode::Return, vec![Type(i32t), Size(32), Name("x".into())]),
    ];
    let w = convert(&ir);

    assert_eq!(w.globals, vec![("counter".to_string(), 4, true, 7)]);
    // mov eax, [rip+0] with the displacement left for the relocation.
    let load = find(&w.text, &[0x8B, 0x05, 0x00, 0x00, 0x00, 0x00]).expect("rip-relative load");
    assert!(w
        .relocations
        .iter()
        .any(|(offset, symbol, kind)| *offset as usize == load + 2
            && symbol == "counter"
            && *kind == Reloc::Rel32));
}

#[test]
fn string_literals_intern_and_relocate() {
    let ir = [
        function_decl("f", TypeTag::I64, 64),
        variable_decl("s", TypeTag::Pointer, 64),
        Inst::new(
            Opcode::StringLiteral,
            vec![Temp(1), Name("hello".into())],
        ),
        assign(Name("s".into()), TypeTag::Pointer, 64, Temp(1)),
        Inst::new(
            Opcode::Return,
            vec![Type(TypeTag::I64), Size(64), Name("s".into())],
        ),
    ];
    let w = convert(&ir);

    assert_eq!(w.strings, vec!["hello".to_string()]);
    // lea rax, [rip+0] with a relocation against the interned symbol.
    let lea = find(&w.text, &[0x48, 0x8D, 0x05, 0x00, 0x00, 0x00, 0x00]).expect("lea rip");
    assert!(w
        .relocations
        .iter()
        .any(|(offset, symbol, _)| *offset as usize == lea + 3 && symbol == "__string_0"));
}

#[test]
fn break_and_continue_target_loop_labels() {
    let i32t = TypeTag::I32;
    let ir = [
        function_decl("f", i32t, 32),
        Inst::new(
            Opcode::LoopBegin,
            vec![Name("end".into()), Name("inc".into())],
        ),
        Inst::new(Opcode::Break, vec![]),
        Inst::new(Opcode::Label, vec![Name("inc".into())]),
        Inst::new(Opcode::Continue, vec![]),
        Inst::new(Opcode::Label, vec![Name("end".into())]),
        Inst::new(Opcode::LoopEnd, vec![]),
        Inst::new(Opcode::Return, vec![Type(i32t), Size(32), Int(0)]),
    ];
    let w = convert(&ir);

    // Layout after the 4-byte prologue: break jmp (5 bytes) at 4, the
    // `inc` label at 9, continue jmp at 9, the `end` label at 14.
    let first = find(&w.text, &[0xE9]).unwrap();
    let rel1 = i32::from_le_bytes(w.text[first + 1..first + 5].try_into().unwrap());
    // break: from end of first jmp (9) to `end` label (14).
    assert_eq!(rel1, 5);
    let second = first + 5;
    assert_eq!(w.text[second], 0xE9);
    let rel2 = i32::from_le_bytes(w.text[second + 1..second + 5].try_into().unwrap());
    // continue: from end of second jmp (14) back to `inc` (9).
    assert_eq!(rel2, -5);
}

#[test]
fn functions_align_to_sixteen_bytes() {
    let i32t = TypeTag::I32;
    let ir = [
        function_decl("a", i32t, 32),
        Inst::new(Opcode::Return, vec![Type(i32t), Size(32), Int(1)]),
        function_decl("b", i32t, 32),
        Inst::new(Opcode::Return, vec![Type(i32t), Size(32), Int(2)]),
    ];
    let w = convert(&ir);

    assert_eq!(w.functions.len(), 2);
    let first = w.functions[0].1;
    let second = w.functions[1].1;
    assert_eq!(first, 0);
    assert_eq!(second % 16, 0);
    // Function `a` is 14 bytes; the padding to 16 is nops, excluded from
    // its recorded length.
    assert_eq!(w.lengths[0], ("a".to_string(), 14));
    assert_eq!(second, 16);
    assert_eq!(w.text[14], 0x90);
    assert_eq!(w.text[15], 0x90);
}

#[test]
fn line_mappings_are_function_relative() {
    let i32t = TypeTag::I32;
    let ir = [
        function_decl("f", i32t, 32),
        Inst::with_line(
            Opcode::Return,
            7,
            vec![Type(i32t), Size(32), Int(0)],
        ),
    ];
    let w = convert(&ir);
    // The return lowers right after the 4-byte prologue.
    assert_eq!(w.line_mappings, vec![(4, 7)]);
}

#[test]
fn malformed_ir_aborts_without_output() {
    let ir = [
        function_decl("f", TypeTag::I32, 32),
        // Arithmetic with a missing operand.
        Inst::new(Opcode::Add, vec![Temp(1), Type(TypeTag::I32)]),
    ];
    let mut writer = RecordingWriter::default();
    let ctx = Context::with_call_conv(CallConv::WindowsFastcall);
    let err = ctx.convert(&ir, &mut writer, "out.obj").unwrap_err();
    assert!(err.to_string().contains("add"));
    assert!(writer.written.is_none());
    assert!(writer.text.is_empty());
}

#[test]
fn undefined_identifier_is_reported() {
    let ir = [
        function_decl("f", TypeTag::I32, 32),
        Inst::new(
            Opcode::Return,
            vec![Type(TypeTag::I32), Size(32), Name("ghost".into())],
        ),
    ];
    let mut writer = RecordingWriter::default();
    let ctx = Context::with_call_conv(CallConv::WindowsFastcall);
    let err = ctx.convert(&ir, &mut writer, "out.obj").unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn unresolved_branch_label_is_an_error() {
    let ir = [
        function_decl("f", TypeTag::I32, 32),
        Inst::new(Opcode::Branch, vec![Name("nowhere".into())]),
    ];
    let mut writer = RecordingWriter::default();
    let ctx = Context::with_call_conv(CallConv::WindowsFastcall);
    let err = ctx.convert(&ir, &mut writer, "out.obj").unwrap_err();
    assert!(err.to_string().contains("nowhere"));
}

#[test]
fn sysv_stack_passed_parameter_round_trip() {
    // A System V callee with seven integer parameters, called with seven
    // arguments. The first six travel in RDI/RSI/RDX/RCX/R8/R9; the
    // seventh is pushed by the caller, and after the call's return
    // address and the callee's saved rbp it sits exactly at [rbp+16] in
    // the callee, so that must be the home the frame records for it.
    let i64t = TypeTag::I64;
    let params: Vec<(String, TypeTag, u16)> =
        (0..7).map(|k| (format!("p{k}"), i64t, 64)).collect();
    let named: Vec<(&str, TypeTag, u16)> = params
        .iter()
        .map(|(n, ty, bits)| (n.as_str(), *ty, *bits))
        .collect();
    let mut call_ops = vec![Temp(1), Name("f7".into()), Type(i64t), Size(64)];
    for k in 0..7 {
        call_ops.push(Type(i64t));
        call_ops.push(Size(64));
        call_ops.push(Int(k + 1));
    }
    let ir = [
        function_decl_with_params("f7", i64t, 64, &named),
        Inst::new(Opcode::Return, vec![Type(i64t), Size(64), Name("p6".into())]),
        function_decl("caller", i64t, 64),
        Inst::new(Opcode::FunctionCall, call_ops),
        Inst::new(Opcode::Return, vec![Type(i64t), Size(64), Temp(1)]),
    ];
    let mut writer = RecordingWriter::default();
    let ctx = Context::with_call_conv(CallConv::SystemV);
    ctx.convert(&ir, &mut writer, "out.o").unwrap();

    // The callee homes its six register parameters in the frame and
    // records the stack-passed one at [rbp+16].
    assert_eq!(writer.parameters.len(), 7);
    assert_eq!(writer.parameters[0], ("p0".to_string(), i64t, -8));
    assert_eq!(writer.parameters[5], ("p5".to_string(), i64t, -48));
    assert_eq!(writer.parameters[6], ("p6".to_string(), i64t, 16));
    // The prologue spills rdi to the first home: mov [rbp-8], rdi.
    assert!(find(&writer.text, &[0x48, 0x89, 0x7D, 0xF8]).is_some());
    // Reading p6 loads from that home: mov rax, [rbp+16].
    assert!(find(&writer.text, &[0x48, 0x8B, 0x45, 0x10]).is_some());

    // The call site places arguments one and six in registers and pushes
    // only the seventh: movabs rax, 7; push rax.
    let imm = |reg: [u8; 2], v: u8| {
        let mut s = reg.to_vec();
        s.extend_from_slice(&[v, 0, 0, 0, 0, 0, 0, 0]);
        s
    };
    assert!(find(&writer.text, &imm([0x48, 0xBF], 1)).is_some(), "mov rdi, 1");
    assert!(find(&writer.text, &imm([0x49, 0xB9], 6)).is_some(), "mov r9, 6");
    let mut push_seq = imm([0x48, 0xB8], 7);
    push_seq.push(0x50);
    assert!(find(&writer.text, &push_seq).is_some(), "movabs rax, 7; push rax");
    // No shadow-space adjustment on System V.
    assert!(find(&writer.text, &[0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00]).is_none());
}

#[test]
fn windows_fifth_argument_uses_stack_and_shadow_space() {
    // Windows quota is four positional registers; a fifth argument is
    // pushed, and because the pushes displace the frame-reserved shadow
    // space, a fresh 32 bytes open below them before the call. In the
    // callee the fifth parameter's home is 16 + 8*4 = 48, directly above
    // the four shadow slots.
    let i64t = TypeTag::I64;
    let params: Vec<(String, TypeTag, u16)> =
        (0..5).map(|k| (format!("p{k}"), i64t, 64)).collect();
    let named: Vec<(&str, TypeTag, u16)> = params
        .iter()
        .map(|(n, ty, bits)| (n.as_str(), *ty, *bits))
        .collect();
    let mut call_ops = vec![Temp(1), Name("f5".into()), Type(i64t), Size(64)];
    for k in 0..5 {
        call_ops.push(Type(i64t));
        call_ops.push(Size(64));
        call_ops.push(Int(k + 1));
    }
    let ir = [
        function_decl_with_params("f5", i64t, 64, &named),
        Inst::new(Opcode::Return, vec![Type(i64t), Size(64), Name("p4".into())]),
        function_decl("caller", i64t, 64),
        Inst::new(Opcode::FunctionCall, call_ops),
        Inst::new(Opcode::Return, vec![Type(i64t), Size(64), Temp(1)]),
    ];
    let w = convert(&ir);

    assert_eq!(w.parameters.len(), 5);
    assert_eq!(w.parameters[0], ("p0".to_string(), i64t, 16));
    assert_eq!(w.parameters[4], ("p4".to_string(), i64t, 48));
    // The prologue homes rcx in its shadow slot: mov [rbp+16], rcx.
    assert!(find(&w.text, &[0x48, 0x89, 0x4D, 0x10]).is_some());
    // Reading p4 loads from above the shadow space: mov rax, [rbp+48].
    assert!(find(&w.text, &[0x48, 0x8B, 0x45, 0x30]).is_some());
    // The call site pushes the fifth argument and reopens the shadow
    // space: movabs rax, 5; push rax; ...; sub rsp, 32.
    assert!(find(
        &w.text,
        &[0x48, 0xB8, 0x05, 0, 0, 0, 0, 0, 0, 0, 0x50]
    )
    .is_some());
    assert!(find(&w.text, &[0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00]).is_some());
}

#[test]
fn sysv_uses_rdi_for_first_argument() {
    let i32t = TypeTag::I32;
    let ir = [
        function_decl("caller", i32t, 32),
        Inst::new(
            Opcode::FunctionCall,
            vec![
                Temp(1),
                Name("callee".into()),
                Type(i32t),
                Size(32),
                Type(i32t),
                Size(32),
                Int(9),
            ],
        ),
        Inst::new(Opcode::Return, vec![Type(i32t), Size(32), Temp(1)]),
    ];
    let mut writer = RecordingWriter::default();
    let ctx = Context::with_call_conv(CallConv::SystemV);
    ctx.convert(&ir, &mut writer, "out.o").unwrap();

    // mov edi, 9.
    assert!(find(&writer.text, &[0xBF, 0x09, 0x00, 0x00, 0x00]).is_some());
    // No shadow space on System V: frame is just the temp slot.
    assert_eq!(writer.functions[0].2, 16);
}
