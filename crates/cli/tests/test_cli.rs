//! End-to-end checks of the `spiral` binary.

use std::io::Write;
use std::process::Command;

fn spiral() -> Command {
    Command::new(env!("CARGO_BIN_EXE_spiral"))
}

fn write_doc(dir: &tempfile::TempDir, name: &str, doc: serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(doc.to_string().as_bytes()).unwrap();
    path
}

#[test]
fn test_run_prints_result() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_doc(
        &dir,
        "sum.json",
        serde_json::json!({
            "version": "1.0.0",
            "nodes": [
                { "id": "a", "expr": { "kind": "lit", "type": { "kind": "int" }, "value": 10 } },
                { "id": "b", "expr": { "kind": "lit", "type": { "kind": "int" }, "value": 20 } },
                { "id": "sum", "expr": { "kind": "call", "ns": "core", "name": "add",
                                         "args": ["a", "b"] } }
            ],
            "result": "sum"
        }),
    );
    let output = spiral().arg("run").arg(&path).output().unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "30");
}

#[test]
fn test_error_result_sets_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_doc(
        &dir,
        "boom.json",
        serde_json::json!({
            "version": "1.0.0",
            "nodes": [
                { "id": "r", "expr": { "kind": "call", "ns": "core", "name": "div",
                                       "args": [
                                           { "kind": "lit", "type": { "kind": "int" }, "value": 1 },
                                           { "kind": "lit", "type": { "kind": "int" }, "value": 0 }
                                       ] } }
            ],
            "result": "r"
        }),
    );
    let output = spiral().arg("run").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("DivideByZero"), "stdout: {}", stdout);
}

#[test]
fn test_check_reports_shape_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_doc(
        &dir,
        "bad.json",
        serde_json::json!({
            "version": "1.0.0",
            "nodes": [],
            "result": "missing"
        }),
    );
    let output = spiral().arg("check").arg(&path).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ValidationError"), "stderr: {}", stderr);
}

#[test]
fn test_ops_lists_builtins() {
    let output = spiral().arg("ops").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("core.add"));
    assert!(stdout.contains("core.isError"));
}
