use std::path::Path;
use std::process::Command;

use kiln::vm::{ExecutableBuilder, Immediate, Instruction};

fn write_program(dir: &Path) -> std::path::PathBuf {
    let mut b = ExecutableBuilder::new("main");
    let r = b.allocate_register();
    let entry = b.make_block("entry");
    b.emit(entry, Instruction::LoadImmediate { value: Immediate::Int32(40) });
    b.emit(entry, Instruction::Store { dst: r });
    b.emit(entry, Instruction::LoadImmediate { value: Immediate::Int32(2) });
    b.emit(entry, Instruction::Add { lhs: r });
    b.emit(entry, Instruction::Return);
    let program = b.build().unwrap();

    let path = dir.join("program.json");
    std::fs::write(&path, serde_json::to_string(&program.to_def()).unwrap()).unwrap();
    path
}

fn run_kiln(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(args)
        .env_remove("KILN_JIT")
        .env_remove("KILN_DUMP_JIT")
        .env_remove("KILN_PERF_MAP")
        .output()
        .expect("failed to execute kiln");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_run_prints_completion_value() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_program(dir.path());
    for mode in ["off", "on"] {
        let (stdout, stderr, success) = run_kiln(&["run", program.to_str().unwrap(), "--jit", mode]);
        assert!(success, "kiln run --jit {} failed:\n{}", mode, stderr);
        assert_eq!(stdout, "42\n");
    }
}

#[test]
fn test_run_rejects_malformed_program() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, r#"{"name": "broken", "register_count": 6, "basic_blocks": []}"#).unwrap();
    let (_, stderr, success) = run_kiln(&["run", path.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.starts_with("error:"), "stderr: {}", stderr);
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_compile_writes_code_and_offset_map() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_program(dir.path());
    let out = dir.path().join("out");
    let (stdout, stderr, success) =
        run_kiln(&["compile", program.to_str().unwrap(), "--out", out.to_str().unwrap()]);
    assert!(success, "kiln compile failed:\n{}", stderr);
    assert!(stdout.starts_with("main: "));

    let code = std::fs::read(out.join("main.bin")).unwrap();
    assert!(!code.is_empty());
    let metadata: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("main.json")).unwrap()).unwrap();
    assert_eq!(metadata["name"], "main");
    assert_eq!(metadata["code_size"].as_u64(), Some(code.len() as u64));
    assert!(!metadata["offset_map"]["entries"].as_array().unwrap().is_empty());
}
