//! End-to-end tests for the tg-compile binary.

use std::path::Path;
use std::process::{Command, Output};

fn tg_compile() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tg-compile"));
    cmd.env("TG_COMPILE_PYTHON", "sh")
        .env_remove("TG_COMPILE_TIMEOUT_SECS")
        .env_remove("RUST_LOG")
        .env_remove("GPU")
        .env_remove("FAIL_CPU");
    cmd
}

/// Compiler root whose entry point fails whenever GPU is set.
fn fake_tinygrad(dir: &Path) {
    let entry = dir.join("examples/openpilot/compile3.py");
    std::fs::create_dir_all(entry.parent().expect("parent")).expect("mkdir");
    std::fs::write(
        &entry,
        "if [ -n \"$GPU\" ]; then echo 'GPU backend unavailable' >&2; exit 3; fi\n\
         if [ \"$FAIL_CPU\" = 1 ]; then exit 4; fi\n\
         echo \"CPU=$CPU JIT=$JIT\" > \"$2\"\n",
    )
    .expect("write entry point");
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[cfg(unix)]
#[test]
fn test_form_a_falls_back_and_succeeds() {
    let dir = tempfile::tempdir().expect("tempdir");
    fake_tinygrad(dir.path());
    let out = dir.path().join("model.pkl");

    let output = tg_compile()
        .arg("\"GPU=1 bogus\"")
        .arg("model.onnx")
        .arg(&out)
        .arg(dir.path())
        .output()
        .expect("run tg-compile");

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(
        std::fs::read_to_string(&out).expect("output").trim(),
        "CPU=1 JIT=2"
    );
    let err = stderr(&output);
    assert!(err.contains("primary compile failed with flags 'GPU=1'"));
    assert!(err.contains("GPU backend unavailable"));
    assert!(err.contains("CPU fallback succeeded"));
    assert!(err.contains("bogus"), "parse warning expected: {}", err);
}

#[cfg(unix)]
#[test]
fn test_form_b_primary_success_uses_environment_flags() {
    let dir = tempfile::tempdir().expect("tempdir");
    fake_tinygrad(dir.path());
    let out = dir.path().join("model.pkl");

    let output = tg_compile()
        .env("CPU", "1")
        .env("JIT", "1")
        .arg(dir.path())
        .arg("model.onnx")
        .arg(&out)
        .output()
        .expect("run tg-compile");

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert_eq!(
        std::fs::read_to_string(&out).expect("output").trim(),
        "CPU=1 JIT=1"
    );
    assert!(!stderr(&output).contains("fallback"));
}

#[cfg(unix)]
#[test]
fn test_form_c_fallback_failure_propagates_exit_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    fake_tinygrad(dir.path());
    let report = dir.path().join("report.json");

    let output = tg_compile()
        .args(["--tinygrad-dir"])
        .arg(dir.path())
        .args(["--onnx", "model.onnx", "--out", "model.pkl"])
        .args(["--flags", "GPU=1", "--cpu-flags", "CPU=1 FAIL_CPU=1"])
        .arg("--report")
        .arg(&report)
        .output()
        .expect("run tg-compile");

    assert_eq!(output.status.code(), Some(4), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("CPU fallback also failed (rc=4)"));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).expect("report")).expect("json");
    assert_eq!(json["attempt"], "fallback");
    assert_eq!(json["exit_code"], 4);
    assert_eq!(json["attempts"].as_array().map(Vec::len), Some(2));
}

#[cfg(unix)]
#[test]
fn test_skip_fallback_when_cpu() {
    let dir = tempfile::tempdir().expect("tempdir");
    fake_tinygrad(dir.path());

    let output = tg_compile()
        .arg("--skip-fallback-when-cpu")
        .arg("CPU=1 FAIL_CPU=1")
        .arg("model.onnx")
        .arg("model.pkl")
        .arg(dir.path())
        .output()
        .expect("run tg-compile");

    assert_eq!(output.status.code(), Some(4));
    assert!(stderr(&output).contains("not retrying"));
}

#[test]
fn test_missing_entry_point_exits_127() {
    let dir = tempfile::tempdir().expect("tempdir");

    let output = tg_compile()
        .arg("GPU=1")
        .arg("model.onnx")
        .arg("model.pkl")
        .arg(dir.path())
        .output()
        .expect("run tg-compile");

    assert_eq!(output.status.code(), Some(127));
    assert!(stderr(&output).contains("could not launch"));
}

#[test]
fn test_usage_error_exits_2() {
    let output = tg_compile()
        .args(["only", "two"])
        .output()
        .expect("run tg-compile");
    assert_eq!(output.status.code(), Some(2));

    let output = tg_compile()
        .args(["--onnx", "model.onnx"])
        .output()
        .expect("run tg-compile");
    assert_eq!(output.status.code(), Some(2));
}
