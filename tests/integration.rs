use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn qmd_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_qmd"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let notes_dir = root.join("notes");
    fs::create_dir_all(notes_dir.join("ops")).unwrap();
    fs::write(
        notes_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        notes_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        notes_dir.join("ops/deploy.md"),
        "# Deploy Runbook\n\nNotes about deployment and infrastructure. Kubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(notes_dir.join("ignored.txt"), "plain text about kubernetes").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/qmd.sqlite"

[retrieval]
final_limit = 5

[expansion]
provider = "synonyms"

[[collections]]
name = "notes"
path = "{root}/notes"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("qmd.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_qmd(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = qmd_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run qmd binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn indexed_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (stdout, stderr, success) = run_qmd(&config_path, &["update"]);
    assert!(success, "update failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

fn json_paths(stdout: &str) -> Vec<String> {
    let value: serde_json::Value = serde_json::from_str(stdout).unwrap();
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["path"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_qmd(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_qmd(&config_path, &["init"]);
    assert!(success, "second init failed");
}

#[test]
fn test_update_counts() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_qmd(&config_path, &["update"]);
    assert!(success, "update failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("added: 3"), "stdout={}", stdout);

    let (stdout, _, success) = run_qmd(&config_path, &["update"]);
    assert!(success);
    assert!(stdout.contains("added: 0"));
    assert!(stdout.contains("unchanged: 3"));
}

#[test]
fn test_search_keyword() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, stderr, success) = run_qmd(&config_path, &["--json", "search", "kubernetes"]);
    assert!(success, "search failed: stderr={}", stderr);
    assert_eq!(json_paths(&stdout), vec!["ops/deploy.md"]);
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, _, success) = run_qmd(&config_path, &["search", "xylophone"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_special_characters_do_not_fail() {
    let (_tmp, config_path) = indexed_env();

    for query in ["\"rust", "rust AND (", "c++ -python", "NEAR(", "*"] {
        let (_, stderr, success) = run_qmd(&config_path, &["search", query]);
        assert!(success, "query {:?} failed: {}", query, stderr);
    }
}

#[test]
fn test_query_without_embeddings_is_lexical() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, stderr, success) = run_qmd(&config_path, &["--json", "query", "python learning"]);
    assert!(success, "query failed: stderr={}", stderr);
    let paths = json_paths(&stdout);
    assert_eq!(paths.first().map(String::as_str), Some("beta.md"));
}

#[test]
fn test_vsearch_without_provider_fails() {
    let (_tmp, config_path) = indexed_env();

    let (_, stderr, success) = run_qmd(&config_path, &["vsearch", "rust"]);
    assert!(!success);
    assert!(stderr.contains("embedding provider"), "stderr={}", stderr);
}

#[test]
fn test_unknown_collection_fails() {
    let (_tmp, config_path) = indexed_env();

    let (_, stderr, success) = run_qmd(&config_path, &["search", "rust", "--collection", "nope"]);
    assert!(!success);
    assert!(stderr.contains("unknown collection"));
}

#[test]
fn test_get_by_path_and_docid() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, stderr, success) = run_qmd(&config_path, &["--json", "get", "notes/alpha.md"]);
    assert!(success, "get failed: {}", stderr);
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["title"], "Alpha Document");
    let docid = doc["docid"].as_str().unwrap().to_string();
    assert_eq!(docid.len(), 6);

    let (stdout, _, success) = run_qmd(&config_path, &["get", &format!("#{docid}")]);
    assert!(success);
    assert!(stdout.contains("notes"));
    assert!(stdout.contains("alpha.md"));
}

#[test]
fn test_get_missing_document() {
    let (_tmp, config_path) = indexed_env();

    let (_, _, success) = run_qmd(&config_path, &["get", "notes/missing.md"]);
    assert!(!success);
}

#[test]
fn test_removed_file_disappears_and_cleanup_dry_run_repeats() {
    let (tmp, config_path) = indexed_env();
    fs::remove_file(tmp.path().join("notes/ops/deploy.md")).unwrap();

    let (stdout, _, success) = run_qmd(&config_path, &["update"]);
    assert!(success);
    assert!(stdout.contains("removed: 1"));

    let (stdout, _, success) = run_qmd(&config_path, &["--json", "search", "kubernetes"]);
    assert!(success);
    assert!(json_paths(&stdout).is_empty());

    let args = ["--json", "cleanup", "--dry-run", "--older-than", "0"];
    let (first, _, success) = run_qmd(&config_path, &args);
    assert!(success);
    let (second, _, _) = run_qmd(&config_path, &args);
    assert_eq!(first, second);
    let report: serde_json::Value = serde_json::from_str(&first).unwrap();
    assert_eq!(report["documents"], 1);

    let (stdout, _, success) = run_qmd(&config_path, &["--json", "cleanup", "--older-than", "0"]);
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["documents"], 1);
    assert_eq!(report["contents"], 1);
}

#[test]
fn test_status_and_collections() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, _, success) = run_qmd(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Documents:   3"));
    assert!(stdout.contains("notes"));

    let (stdout, _, success) = run_qmd(&config_path, &["collections"]);
    assert!(success);
    assert!(stdout.contains("notes"));
}

#[test]
fn test_embed_requires_provider() {
    let (_tmp, config_path) = indexed_env();

    let (_, stderr, success) = run_qmd(&config_path, &["embed"]);
    assert!(!success);
    assert!(stderr.contains("disabled"));
}

#[test]
fn test_ls_collections_and_prefix() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, stderr, success) = run_qmd(&config_path, &["ls"]);
    assert!(success, "ls failed: {}", stderr);
    assert!(stdout.contains("qmd://notes/  (3 files)"), "stdout={}", stdout);

    let (stdout, _, success) = run_qmd(&config_path, &["--json", "ls", "notes/ops"]);
    assert!(success);
    assert_eq!(json_paths(&stdout), vec!["ops/deploy.md"]);

    let (_, stderr, success) = run_qmd(&config_path, &["ls", "nope"]);
    assert!(!success);
    assert!(stderr.contains("unknown collection"));
}

#[test]
fn test_multi_get_glob_and_list() {
    let (_tmp, config_path) = indexed_env();

    let (stdout, stderr, success) = run_qmd(&config_path, &["--json", "multi-get", "notes/*.md"]);
    assert!(success, "multi-get failed: {}", stderr);
    assert_eq!(json_paths(&stdout), vec!["alpha.md", "beta.md"]);

    let (stdout, _, success) = run_qmd(
        &config_path,
        &["multi-get", "notes/alpha.md,notes/ops/deploy.md", "--lines", "1"],
    );
    assert!(success);
    assert!(stdout.contains("# Alpha Document"));
    assert!(stdout.contains("# Deploy Runbook"));
    assert!(!stdout.contains("Kubernetes"));
}

#[test]
fn test_context_shows_in_search_and_get() {
    let (_tmp, config_path) = indexed_env();

    let (_, stderr, success) = run_qmd(&config_path, &["context", "add", "notes/ops", "Runbooks for production"]);
    assert!(success, "context add failed: {}", stderr);

    let (stdout, _, success) = run_qmd(&config_path, &["search", "kubernetes"]);
    assert!(success);
    assert!(stdout.contains("context: Runbooks for production"), "stdout={}", stdout);

    let (stdout, _, success) = run_qmd(&config_path, &["--json", "get", "notes/alpha.md"]);
    assert!(success);
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(doc.get("context").is_none());

    let (stdout, _, success) = run_qmd(&config_path, &["context", "list"]);
    assert!(success);
    assert!(stdout.contains("qmd://notes/ops"));

    let (_, _, success) = run_qmd(&config_path, &["context", "rm", "notes/ops"]);
    assert!(success);
    let (_, _, success) = run_qmd(&config_path, &["context", "rm", "notes/ops"]);
    assert!(!success);
}

#[test]
fn test_collection_rename_keeps_index_and_remove_drops_it() {
    let (tmp, config_path) = indexed_env();

    let (_, stderr, success) = run_qmd(&config_path, &["collection", "rename", "notes", "journal"]);
    assert!(success, "rename failed: {}", stderr);

    let (stdout, _, success) = run_qmd(&config_path, &["--json", "get", "journal/alpha.md"]);
    assert!(success, "renamed document missing: {}", stdout);
    let (stdout, _, success) = run_qmd(&config_path, &["update"]);
    assert!(success);
    assert!(stdout.contains("added: 0"), "stdout={}", stdout);

    let extra = tmp.path().join("extra");
    fs::create_dir_all(&extra).unwrap();
    let (_, stderr, success) = run_qmd(&config_path, &["collection", "add", extra.to_str().unwrap()]);
    assert!(success, "add failed: {}", stderr);
    let (stdout, _, _) = run_qmd(&config_path, &["collections"]);
    assert!(stdout.contains("extra"));

    let (_, stderr, success) = run_qmd(&config_path, &["collection", "remove", "journal"]);
    assert!(success, "remove failed: {}", stderr);
    let (stdout, _, success) = run_qmd(&config_path, &["--json", "search", "kubernetes"]);
    assert!(success);
    assert!(json_paths(&stdout).is_empty());
}
