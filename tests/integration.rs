use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Unroutable API address; no test here is allowed to reach the network
    let config_content = format!(
        r#"[db]
path = "{}/data/harvest.sqlite"

[api]
base_url = "http://127.0.0.1:9/"
rate_limit_ms = 10

[harvest]
relations = [{{ relation = "likes" }}, {{ relation = "posts", preview = "message" }}]
connection_relations = []
"#,
        root.display()
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("HARVEST_ACCESS_TOKEN")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/harvest.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_harvest(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_harvest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_status_on_empty_archive() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvest(&config_path, &["status"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("Records:      0"));
    assert!(stdout.contains("Last updated: never"));
    assert!(stdout.contains("not stored"));
}

#[test]
fn test_token_is_stored() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (stdout, _, success) = run_harvest(&config_path, &["token", "abc123"]);
    assert!(success);
    assert!(stdout.contains("access token stored"));

    let (stdout, _, _) = run_harvest(&config_path, &["status"]);
    assert!(stdout.contains("Token:        stored"), "got: {}", stdout);
}

#[test]
fn test_sync_without_token_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (_, stderr, success) = run_harvest(&config_path, &["sync", "--progress", "off"]);
    assert!(!success, "sync without a token must fail");
    assert!(stderr.contains("No access token"), "got: {}", stderr);
}

#[test]
fn test_search_empty_archive() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (stdout, stderr, success) = run_harvest(&config_path, &["search", "anything"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_get_unknown_record() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    let (_, stderr, success) = run_harvest(&config_path, &["get", "me:404"]);
    assert!(!success);
    assert!(stderr.contains("record not found"), "got: {}", stderr);
}

#[test]
fn test_reset_clears_token() {
    let (_tmp, config_path) = setup_test_env();

    run_harvest(&config_path, &["init"]);
    run_harvest(&config_path, &["token", "abc123"]);
    let (stdout, _, success) = run_harvest(&config_path, &["reset"]);
    assert!(success);
    assert!(stdout.contains("records removed: 0"));

    let (stdout, _, _) = run_harvest(&config_path, &["status"]);
    assert!(stdout.contains("not stored"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[db]\npath = \"x.sqlite\"\n[api]\nbatch_size = 0\n").unwrap();

    let (_, stderr, success) = run_harvest(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("batch_size"), "got: {}", stderr);
}
