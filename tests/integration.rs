//! End-to-end CLI tests: run the `rrag` binary against a temporary
//! workspace with a real xlsx fixture. Commands that would need a live
//! model backend (embedding, generation) are exercised elsewhere with
//! stubs; here we cover init, dry-run ingestion, and failure modes.

mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn rrag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("rrag");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    fs::write(data_dir.join("dataset.xlsx"), common::sales_fixture()).unwrap();

    let config_content = format!(
        r#"[data]
spreadsheet = "{root}/data/dataset.xlsx"

[index]
dir = "{root}/data/index"
top_k = 3

[db]
path = "{root}/data/chats.sqlite"

[generation]
model = "llama3"

[server]
bind = "127.0.0.1:7431"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("rrag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rrag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rrag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rrag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_rrag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let db_path = config_path.parent().unwrap().parent().unwrap();
    assert!(db_path.join("data/chats.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_rrag(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_rrag(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_dry_run_counts_documents() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_rrag(&config_path, &["ingest", "--dry-run"]);
    assert!(
        success,
        "dry-run ingest failed: stdout={}, stderr={}",
        stdout, stderr
    );
    // 2 products + 2 customers + 3 sales rows
    assert!(stdout.contains("2 products"), "stdout: {}", stdout);
    assert!(stdout.contains("3 sales rows"), "stdout: {}", stdout);
    assert!(stdout.contains("Would index 7 documents."), "stdout: {}", stdout);
}

#[test]
fn test_ingest_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success) = run_rrag(&config_path, &["ingest", "--dry-run"]);
    assert!(success);

    let root = config_path.parent().unwrap().parent().unwrap();
    assert!(!root.join("data/index").exists());
}

#[test]
fn test_missing_spreadsheet_is_fatal() {
    let (tmp, config_path) = setup_test_env();
    fs::remove_file(tmp.path().join("data/dataset.xlsx")).unwrap();

    let (stdout, stderr, success) = run_rrag(&config_path, &["ingest", "--dry-run"]);
    assert!(!success, "ingest should fail without the spreadsheet");
    let combined = format!("{}{}", stdout, stderr);
    assert!(combined.contains("dataset.xlsx"), "output: {}", combined);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, config_path) = setup_test_env();
    let body = fs::read_to_string(&config_path).unwrap();
    fs::write(&config_path, body.replace("top_k = 3", "top_k = 0")).unwrap();
    let _ = tmp;

    let (_, stderr, success) = run_rrag(&config_path, &["ingest", "--dry-run"]);
    assert!(!success);
    assert!(stderr.contains("top_k"), "stderr: {}", stderr);
}
