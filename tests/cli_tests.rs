//! 命令行入口测试：hook 调用无论输入如何都以退出码 0 结束

use serde_json::{json, Value};
use std::io::Write;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

/// 以给定参数和 stdin 运行 claude-telemetry
fn run(tmp: &TempDir, args: &[&str], stdin: &str) -> Output {
    let mut child = Command::new(env!("CARGO_BIN_EXE_claude-telemetry"))
        .args(args)
        .env("CLAUDE_TELEMETRY_DB_URL", tmp.path().join("cli.db"))
        .env_remove("CLAUDE_TELEMETRY_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    // 参数错误时进程可能不读 stdin 就退出
    let _ = child.stdin.take().unwrap().write_all(stdin.as_bytes());
    child.wait_with_output().unwrap()
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_hook_pre_tool_use_allows() {
    let tmp = TempDir::new().unwrap();
    let payload = json!({
        "session_id": "sess-1",
        "cwd": "/work/app",
        "tool_name": "Read",
        "tool_use_id": "tu_1",
        "tool_input": {"file_path": "/work/app/main.rs"}
    });

    let output = run(&tmp, &["hook", "PreToolUse"], &payload.to_string());
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        stdout_json(&output)["hookSpecificOutput"]["permissionDecision"],
        "allow"
    );
    assert!(tmp.path().join("cli.db").exists());
}

#[test]
fn test_hook_missing_kind_exits_zero() {
    let tmp = TempDir::new().unwrap();
    let output = run(&tmp, &["hook"], "");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output), json!({}));
    assert!(!output.stderr.is_empty());
}

#[test]
fn test_hook_unknown_flag_still_allows() {
    let tmp = TempDir::new().unwrap();
    let output = run(&tmp, &["hook", "PreToolUse", "--bogus"], "{}");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        stdout_json(&output)["hookSpecificOutput"]["permissionDecision"],
        "allow"
    );
}

#[test]
fn test_hook_unknown_kind_is_empty() {
    let tmp = TempDir::new().unwrap();
    let output = run(&tmp, &["hook", "NoSuchEvent"], "{}");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output), json!({}));
}

#[test]
fn test_non_hook_argument_error_fails() {
    let tmp = TempDir::new().unwrap();
    let output = run(&tmp, &["stats", "--bogus"], "");
    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
}
