use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn vsearch_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vsearch"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let vault = root.join("vault");
    fs::create_dir_all(vault.join("projects")).unwrap();
    fs::create_dir_all(vault.join(".obsidian")).unwrap();
    fs::write(
        vault.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha note about Rust programming.\n\nIt covers cargo and crates. #rust",
    )
    .unwrap();
    fs::write(
        vault.join("projects/beta.md"),
        "---\ntitle: Beta Plans\ntags: [ml, planning]\n---\n\nThis note discusses Python and machine learning.\n\nPyTorch training loops are covered.",
    )
    .unwrap();
    fs::write(
        vault.join("gamma.md"),
        "Gamma notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(vault.join(".obsidian/workspace.md"), "ignored").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/index.sqlite"

[source]
kind = "filesystem"
root = "{root}/vault"

[embedding]
provider = "hashing"
dims = 128

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("vsearch.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_vsearch(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = vsearch_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run vsearch binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vsearch(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_vsearch(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_index_then_reindex_skips_everything() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_vsearch(&config_path, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("total: 3"), "stdout={}", stdout);
    assert!(stdout.contains("processed: 3"));
    assert!(stdout.contains("failed: 0"));

    let (stdout, _, success) = run_vsearch(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("processed: 0"), "stdout={}", stdout);
    assert!(stdout.contains("skipped: 3"));
    assert!(stdout.contains("embedded: 0"));
}

#[test]
fn test_force_reindex_processes_everything() {
    let (_tmp, config_path) = setup_test_env();

    run_vsearch(&config_path, &["index"]);
    let (stdout, _, success) = run_vsearch(&config_path, &["index", "--force"]);
    assert!(success);
    assert!(stdout.contains("processed: 3"), "stdout={}", stdout);
}

#[test]
fn test_keyword_search_finds_note() {
    let (_tmp, config_path) = setup_test_env();
    run_vsearch(&config_path, &["index"]);

    let (stdout, stderr, success) =
        run_vsearch(&config_path, &["search", "kubernetes", "--mode", "keyword"]);
    assert!(success, "search failed: stderr={}", stderr);
    assert!(stdout.contains("gamma.md"), "stdout={}", stdout);
    assert!(!stdout.contains("alpha.md"));
}

#[test]
fn test_tag_search_uses_frontmatter_tags() {
    let (_tmp, config_path) = setup_test_env();
    run_vsearch(&config_path, &["index"]);

    let (stdout, _, success) = run_vsearch(&config_path, &["search", "#ml", "--mode", "tag"]);
    assert!(success);
    assert!(stdout.contains("projects/beta.md"), "stdout={}", stdout);
    assert!(stdout.contains("Beta Plans"));
}

#[test]
fn test_hybrid_search_with_explain() {
    let (_tmp, config_path) = setup_test_env();
    run_vsearch(&config_path, &["index"]);

    let (stdout, stderr, success) = run_vsearch(
        &config_path,
        &["search", "rust cargo crates", "--explain", "--limit", "2"],
    );
    assert!(success, "search failed: stderr={}", stderr);
    assert!(stdout.starts_with("1. "), "stdout={}", stdout);
    assert!(stdout.contains("alpha.md"));
    assert!(stdout.contains("explain: semantic="));
}

#[test]
fn test_unknown_mode_fails() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_vsearch(&config_path, &["search", "x", "--mode", "fuzzy"]);
    assert!(!success);
    assert!(stderr.contains("Unknown search mode"));
}

#[test]
fn test_search_empty_index() {
    let (_tmp, config_path) = setup_test_env();
    run_vsearch(&config_path, &["init"]);

    let (stdout, _, success) = run_vsearch(&config_path, &["search", "anything"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_deleted_note_disappears() {
    let (tmp, config_path) = setup_test_env();
    run_vsearch(&config_path, &["index"]);

    fs::remove_file(tmp.path().join("vault/gamma.md")).unwrap();
    let (stdout, _, success) = run_vsearch(&config_path, &["index"]);
    assert!(success);
    assert!(stdout.contains("deleted: 1"), "stdout={}", stdout);

    let (stdout, _, _) = run_vsearch(&config_path, &["search", "kubernetes docker"]);
    assert!(!stdout.contains("gamma.md"), "stdout={}", stdout);
}

#[test]
fn test_stats_after_index() {
    let (_tmp, config_path) = setup_test_env();
    run_vsearch(&config_path, &["index"]);

    let (stdout, _, success) = run_vsearch(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:   3"), "stdout={}", stdout);
    assert!(stdout.contains("128 dims"));
    assert!(stdout.contains("Metric:      cosine"));
}

#[test]
fn test_query_without_llm_reports_unavailable() {
    let (_tmp, config_path) = setup_test_env();
    run_vsearch(&config_path, &["index"]);

    let (_, stderr, success) = run_vsearch(&config_path, &["query", "what is cargo?"]);
    assert!(!success);
    assert!(stderr.contains("llm unavailable"), "stderr={}", stderr);
}
