//! End-to-end scenarios compiling source text straight through to
//! instructions and globals, plus a couple of CLI round-trips.

use omc::analyzer::Analyzer;
use omc::bytecode::{Opcode, Operand};
use omc::symbols::{FunctionTable, GlobalTable, Type};

fn compile(src: &str) -> (GlobalTable, FunctionTable) {
    Analyzer::new(src).analyze().expect("expected a well-formed program")
}

fn ops(functions: &FunctionTable, name: &str) -> Vec<Opcode> {
    functions.get(name).unwrap().instructions.iter().map(|i| i.op).collect()
}

#[test]
fn s1_minimal_void_main() {
    let (globals, functions) = compile("fn main() -> void {}");
    assert_eq!(functions.functions.len(), 2);
    assert_eq!(globals.len(), 2);

    let start = functions.get("_start").unwrap();
    assert_eq!(start.function_id, 0);
    assert_eq!(
        start.instructions.iter().map(|i| i.op).collect::<Vec<_>>(),
        vec![Opcode::StackAlloc, Opcode::Call, Opcode::Ret]
    );

    let main = functions.get("main").unwrap();
    assert_eq!(main.function_id, 1);
    assert_eq!(ops(&functions, "main"), vec![Opcode::Ret]);
}

#[test]
fn s2_int_main_with_return() {
    let (_globals, functions) = compile("fn main() -> int { return 0; }");
    assert_eq!(
        ops(&functions, "main"),
        vec![Opcode::Arga, Opcode::Push, Opcode::Store, Opcode::Ret]
    );

    let start = functions.get("_start").unwrap();
    assert_eq!(
        start.instructions.iter().map(|i| i.op).collect::<Vec<_>>(),
        vec![Opcode::StackAlloc, Opcode::Call, Opcode::Popn, Opcode::Ret]
    );
}

#[test]
fn s3_local_arithmetic_with_precedence() {
    let (_globals, functions) = compile(
        "fn main() -> int {\n\
             let x: int = 1 + 2 * 3;\n\
             return x;\n\
         }",
    );
    assert_eq!(
        ops(&functions, "main"),
        vec![
            Opcode::Loca,
            Opcode::Push,
            Opcode::Push,
            Opcode::Push,
            Opcode::Mul,
            Opcode::Add,
            Opcode::Store,
            Opcode::Arga,
            Opcode::Loca,
            Opcode::Load,
            Opcode::Store,
            Opcode::Ret,
        ]
    );
}

#[test]
fn s4_global_string_literal_and_library_call() {
    let (globals, functions) = compile(r#"fn main() -> void { putstr("hi"); }"#);
    // main's name, "hi"'s bytes, putstr's name, _start's name, in that order.
    assert_eq!(globals.len(), 4);
    assert!(globals.globals.iter().all(|g| g.is_constant));
    assert_eq!(globals.globals[1].value_bytes, b"hi".to_vec());
    assert_eq!(globals.globals[2].value_bytes, b"putstr".to_vec());

    assert_eq!(
        ops(&functions, "main"),
        vec![Opcode::StackAlloc, Opcode::Push, Opcode::CallName, Opcode::Ret]
    );
}

#[test]
fn s5_assign_to_const_is_reported() {
    let err = Analyzer::new("fn main() -> void { const x: int = 1; x = 2; }")
        .analyze()
        .unwrap_err();
    assert!(matches!(err, omc::CompileError::AssignToConstant(_)));
}

#[test]
fn s6_break_jumps_past_the_while_condition() {
    let (_globals, functions) =
        compile("fn main() -> void {\n    while 1 == 1 { break; }\n}");
    let main = functions.get("main").unwrap();
    let br_positions: Vec<(usize, i32)> = main
        .instructions
        .iter()
        .enumerate()
        .filter_map(|(i, instr)| match instr {
            omc::bytecode::Instruction { op: Opcode::Br, operand: Operand::I32(d) } => {
                Some((i, *d))
            }
            _ => None,
        })
        .collect();
    // The while's own exit br, the break's br, and the back-edge br.
    assert_eq!(br_positions.len(), 3);
    let exit_target = main.instructions.len() - 1;
    let (while_exit_idx, while_exit_disp) = br_positions[0];
    assert_eq!((while_exit_idx as i32 + while_exit_disp) as usize, exit_target);
    let (break_idx, break_disp) = br_positions[1];
    assert_eq!((break_idx as i32 + break_disp) as usize, exit_target);
    let (back_edge_idx, back_edge_disp) = br_positions[2];
    // Back edge targets the condition's start, index 0.
    assert_eq!(back_edge_idx as i32 + back_edge_disp, 0);
}

#[test]
fn undeclared_callee_is_reported() {
    let err = Analyzer::new("fn main() -> void { frobnicate(); }").analyze().unwrap_err();
    assert!(matches!(err, omc::CompileError::NotDeclared(_)));
}

#[test]
fn function_return_type_flows_through_a_call() {
    let (_globals, functions) = compile(
        "fn half(n: int) -> int { return n; }\n\
         fn main() -> int { return half(4); }",
    );
    assert!(functions.contains("half"));
    let half = functions.get("half").unwrap();
    assert_eq!(half.return_type, Type::Int);
}

#[test]
fn cli_compile_then_check_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("prog.omc");
    let out_path = dir.path().join("prog.img");
    std::fs::write(&src_path, "fn main() -> void {}").unwrap();

    let status = std::process::Command::new(env!("CARGO_BIN_EXE_omc"))
        .args(["compile", src_path.to_str().unwrap(), out_path.to_str().unwrap()])
        .status()
        .unwrap();
    assert!(status.success());
    assert!(out_path.exists());

    let bytes = std::fs::read(&out_path).unwrap();
    assert_eq!(&bytes[0..4], &0x72303b3e_u32.to_be_bytes());

    let status = std::process::Command::new(env!("CARGO_BIN_EXE_omc"))
        .args(["check", src_path.to_str().unwrap()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
fn cli_reports_compile_errors_on_stderr_and_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let src_path = dir.path().join("bad.omc");
    std::fs::write(&src_path, "fn main() -> void { return 1; }").unwrap();

    let output = std::process::Command::new(env!("CARGO_BIN_EXE_omc"))
        .args(["check", src_path.to_str().unwrap()])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("NotValidReturn"));
}
