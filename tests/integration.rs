use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn forge_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("forge");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("login.html"),
        "<form id=\"login\"><input id=\"username\"><input id=\"password\" type=\"password\"><button class=\"btn-primary\">Sign in</button></form>",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.",
    )
    .unwrap();
    fs::write(files_dir.join("image.png"), [0u8, 1, 2, 3]).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/forge.sqlite"

[chunking]
chunk_size = 400
chunk_overlap = 50

[embedding]
provider = "hash"
dims = 256

[generation]
provider = "disabled"
"#,
        root.display()
    );

    let config_path = config_dir.join("forge.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_forge(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = forge_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run forge binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn files_dir(config_path: &Path) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .to_string_lossy()
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_forge(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/forge.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_forge(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_forge(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_directory() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    run_forge(&config_path, &["init"]);
    let (stdout, stderr, success) = run_forge(&config_path, &["ingest", &files]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents: 3"), "got: {}", stdout);
    assert!(stdout.contains("ok"));
}

#[test]
fn test_reingest_inserts_nothing() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    let (stdout1, _, _) = run_forge(&config_path, &["ingest", &files]);
    assert!(!stdout1.contains("chunks inserted: 0"), "got: {}", stdout1);

    let (stdout2, _, success) = run_forge(&config_path, &["ingest", &files]);
    assert!(success);
    assert!(stdout2.contains("chunks inserted: 0"), "got: {}", stdout2);
    assert!(!stdout2.contains("chunks deduplicated: 0"), "got: {}", stdout2);
}

#[test]
fn test_ingest_missing_path_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_forge(&config_path, &["ingest", "/definitely/not/here"]);
    assert!(!success);
    assert!(stderr.contains("does not exist"), "got: {}", stderr);
}

#[test]
fn test_retrieve_ranks_relevant_source() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    run_forge(&config_path, &["ingest", &files]);
    let (stdout, stderr, success) = run_forge(&config_path, &["retrieve", "Rust programming cargo crates"]);
    assert!(success, "retrieve failed: {}", stderr);
    let first = stdout.lines().next().unwrap_or_default();
    assert!(first.contains("alpha.md"), "got: {}", stdout);
}

#[test]
fn test_retrieve_deterministic_and_bounded() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    run_forge(&config_path, &["ingest", &files]);
    let (stdout1, _, _) = run_forge(&config_path, &["retrieve", "deployment", "--k", "2"]);
    let (stdout2, _, _) = run_forge(&config_path, &["retrieve", "deployment", "--k", "2"]);
    assert_eq!(stdout1, stdout2);
    assert!(stdout1.contains("2. ["));
    assert!(!stdout1.contains("3. ["));
}

#[test]
fn test_retrieve_empty_index() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_forge(&config_path, &["retrieve", "anything"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_generate_with_disabled_provider_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_forge(
        &config_path,
        &["generate", "User logs in with valid credentials"],
    );
    assert!(!success);
    assert!(stderr.contains("provider unavailable"), "got: {}", stderr);
}

#[test]
fn test_generate_rejects_empty_requirement() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_forge(&config_path, &["generate", "   "]);
    assert!(!success);
    assert!(stderr.contains("invalid request"), "got: {}", stderr);
}

#[test]
fn test_collections_list_and_drop() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    let (stdout, _, _) = run_forge(&config_path, &["collections"]);
    assert!(stdout.contains("No collections."));

    run_forge(&config_path, &["ingest", &files]);
    let (stdout, _, success) = run_forge(&config_path, &["collections"]);
    assert!(success);
    assert!(stdout.contains("default*"), "got: {}", stdout);

    let (stdout, _, success) = run_forge(&config_path, &["collections", "drop", "default"]);
    assert!(success);
    assert!(stdout.contains("Dropped collection 'default'"));

    let (stdout, _, _) = run_forge(&config_path, &["collections"]);
    assert!(stdout.contains("No collections."));
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/data/forge.sqlite\"\n[chunking]\nchunk_size = 100\nchunk_overlap = 100\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_forge(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("chunk_overlap"), "got: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_forge(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "got: {}", stderr);
}
