use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dsfold_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("dsfold");
    path
}

fn write(root: &Path, rel: &str, content: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, content).unwrap();
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let collection = root.join("lab");
    write(&collection, "ds001/README", "Resting state study.");
    write(&collection, "ds001/participants.tsv", "participant_id\tage\nsub-01\t22\n");
    write(&collection, "ds001/sub-01/func/events.tsv", "onset\tduration\n0\t2\n");
    write(&collection, "ds001/sub-02/func/events.tsv", "onset\tduration\n0\t2\n");
    write(&collection, "ds002/dataset_description.json", "{\"Name\": \"Second\"}");
    write(&collection, "ds002/sub-01/notes.txt", "collected twice");

    let config_content = r#"[thresholds]
text = 4096

[offload]
attachments = true

[pipeline]
workers = 2
"#;
    let config_path = root.join("dsfold.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_dsfold(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dsfold_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dsfold binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn paths(tmp: &TempDir) -> (String, String) {
    let collection = tmp.path().join("lab").to_string_lossy().into_owned();
    let out = tmp.path().join("out").to_string_lossy().into_owned();
    (collection, out)
}

#[test]
fn test_convert_writes_collection_document() {
    let (tmp, config_path) = setup_test_env();
    let (collection, out) = paths(&tmp);

    let (stdout, stderr, success) =
        run_dsfold(&config_path, &["convert", &collection, "--output", &out]);
    assert!(success, "convert failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("datasets: 2 (converted 2, skipped 0, failed 0)"), "{}", stdout);
    assert!(stdout.contains("deduplicated 1"), "{}", stdout);
    assert!(stdout.contains("ok"));

    let doc: serde_json::Value =
        serde_json::from_slice(&fs::read(tmp.path().join("out/lab.collection.json")).unwrap())
            .unwrap();
    assert_eq!(doc["ds001"]["README"], "Resting state study.");
    assert_eq!(
        doc["ds001"]["sub-02"]["func"]["events.tsv"]["_DataLink_"],
        "$.sub-01.func.events.tsv"
    );
    assert_eq!(doc["ds002"]["dataset_description.json"]["Name"], "Second");
}

#[test]
fn test_convert_twice_skips_unchanged() {
    let (tmp, config_path) = setup_test_env();
    let (collection, out) = paths(&tmp);

    let (_, _, success1) = run_dsfold(&config_path, &["convert", &collection, "--output", &out]);
    assert!(success1, "First convert failed");

    let (stdout2, _, success2) =
        run_dsfold(&config_path, &["convert", &collection, "--output", &out]);
    assert!(success2, "Second convert failed");
    assert!(stdout2.contains("skipped 2"), "{}", stdout2);
}

#[test]
fn test_convert_single_dataset_with_force() {
    let (tmp, config_path) = setup_test_env();
    let (collection, out) = paths(&tmp);

    run_dsfold(&config_path, &["convert", &collection, "--output", &out]);
    let (stdout, stderr, success) = run_dsfold(
        &config_path,
        &["convert", &collection, "--output", &out, "--dataset", "ds002", "--force"],
    );
    assert!(success, "convert failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("datasets: 1 (converted 1, skipped 0, failed 0)"), "{}", stdout);
}

#[test]
fn test_convert_unknown_dataset_fails() {
    let (tmp, config_path) = setup_test_env();
    let (collection, out) = paths(&tmp);

    let (_, stderr, success) = run_dsfold(
        &config_path,
        &["convert", &collection, "--output", &out, "--dataset", "ds404"],
    );
    assert!(!success);
    assert!(stderr.contains("ds404"), "{}", stderr);
}

#[test]
fn test_convert_reports_failed_dataset() {
    let (tmp, config_path) = setup_test_env();
    let (collection, out) = paths(&tmp);
    write(&tmp.path().join("lab"), "ds002/sub-01/scan.tsv", "a\n1\n");
    write(&tmp.path().join("lab"), "ds002/sub-01/scan.tsv.json", "{\"a\": [1]}");

    let (stdout, _, success) =
        run_dsfold(&config_path, &["convert", &collection, "--output", &out]);
    assert!(!success, "conflicting dataset should fail the run");
    assert!(stdout.contains("FAILED ds002"), "{}", stdout);
    assert!(tmp.path().join("out/ds001.doc.json").exists());
    assert!(!tmp.path().join("out/ds002.doc.json").exists());
}

#[test]
fn test_convert_json_report() {
    let (tmp, config_path) = setup_test_env();
    let (collection, out) = paths(&tmp);

    let (stdout, _, success) =
        run_dsfold(&config_path, &["convert", &collection, "--output", &out, "--json"]);
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["name"], "lab");
    assert_eq!(report["datasets"][0]["name"], "ds001");
    assert_eq!(report["datasets"][0]["state"], "done");
}

#[test]
fn test_reset_removes_dataset_artifacts() {
    let (tmp, config_path) = setup_test_env();
    let (collection, out) = paths(&tmp);

    run_dsfold(&config_path, &["convert", &collection, "--output", &out]);
    assert!(tmp.path().join("out/ds001.doc.json").exists());

    let (stdout, stderr, success) = run_dsfold(&config_path, &["reset", &out, "ds001"]);
    assert!(success, "reset failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("reset"));
    assert!(!tmp.path().join("out/ds001.doc.json").exists());
    assert!(!tmp.path().join("out/.hash/ds001").exists());
    assert!(tmp.path().join("out/ds002.doc.json").exists());
    assert!(tmp.path().join("lab/ds001/README").exists());
}

#[test]
fn test_classify_prints_category_and_decision() {
    let (tmp, config_path) = setup_test_env();
    let file = tmp.path().join("lab/ds001/participants.tsv");

    let (stdout, _, success) = run_dsfold(&config_path, &["classify", file.to_str().unwrap()]);
    assert!(success);
    assert!(stdout.contains("tabular"), "{}", stdout);
    assert!(stdout.contains("dedup-inline"), "{}", stdout);
}

#[test]
fn test_view_truncates_long_arrays() {
    let (tmp, config_path) = setup_test_env();
    let values: Vec<String> = (0..50).map(|i| i.to_string()).collect();
    let file = tmp.path().join("big.json");
    fs::write(&file, format!("{{\"data\": [{}]}}", values.join(","))).unwrap();

    let (stdout, _, success) = run_dsfold(
        &config_path,
        &["view", file.to_str().unwrap(), "--max-data", "10"],
    );
    assert!(success);
    assert!(stdout.starts_with("# File:"), "{}", stdout);
    assert!(stdout.contains("<array[50]: [0, 1, 2, 3, ...]>"), "{}", stdout);
}

#[test]
fn test_merge_fragment_directory() {
    let (tmp, config_path) = setup_test_env();
    let dir = tmp.path().join("frags/ds009");
    write(&dir, "sub-01/a.tsv.json", "{\"x\": [1]}");
    write(&dir, "README.json", "\"hello\"");
    let target = tmp.path().join("merged.json");

    let (stdout, stderr, success) = run_dsfold(
        &config_path,
        &["merge", dir.to_str().unwrap(), "--output", target.to_str().unwrap()],
    );
    assert!(success, "merge failed: stdout={}, stderr={}", stdout, stderr);
    let doc: serde_json::Value = serde_json::from_slice(&fs::read(&target).unwrap()).unwrap();
    assert_eq!(doc, serde_json::json!({"README": "hello", "sub-01": {"a.tsv": {"x": [1]}}}));
}
