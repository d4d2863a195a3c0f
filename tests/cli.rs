//! Integration tests running the `annodex` binary against the fixture corpus.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn corpus_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("corpus")
}

/// Run annodex with its indexes kept under `index_dir`
fn annodex(index_dir: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_annodex"))
        .args(args)
        .arg("--no-color")
        .env("ANNODEX_INDEX_DIR", index_dir.path())
        .env("ANNODEX_POLL_INTERVAL_MS", "10")
        .env("RUST_LOG", "off")
        .output()
        .expect("Failed to run annodex")
}

/// Copy the fixture corpus somewhere it can be edited
fn copy_corpus(to: &Path) {
    for entry in fs::read_dir(corpus_dir()).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_index_then_search() {
    let index_dir = TempDir::new().unwrap();
    let corpus = corpus_dir();
    let corpus = corpus.to_str().unwrap();

    let output = annodex(&index_dir, &["index", corpus]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("(2 documents)"));

    let output = annodex(&index_dir, &["search", "Galicia", "--path", corpus]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("galicia.txt"));
    assert!(text.contains("15-22:The capital of Galicia is Santiago de"));
    assert!(!text.contains("moon.txt"));
}

#[test]
fn test_structural_search_json() {
    let index_dir = TempDir::new().unwrap();
    let corpus = corpus_dir();
    let corpus = corpus.to_str().unwrap();

    let output = annodex(
        &index_dir,
        &["search", "<Named_entity.value=\"LOC\"/>", "--path", corpus, "--json"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let results: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let results = results.as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["offset_start"], 15);
    assert_eq!(results[0]["offset_end"], 22);
    assert_eq!(results[1]["offset_start"], 26);
    assert_eq!(results[1]["offset_end"], 48);
    assert_eq!(results[0]["text"], "");

    // Another annotator sees only the source text
    let output = annodex(
        &index_dir,
        &["search", "<Named_entity/>", "--path", corpus, "--user", "bob", "--json"],
    );
    let results: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert!(results.as_array().unwrap().is_empty());
}

#[test]
fn test_stats_json() {
    let index_dir = TempDir::new().unwrap();
    let corpus = corpus_dir();
    let corpus = corpus.to_str().unwrap();

    let output = annodex(&index_dir, &["stats", corpus, "--metrics", "n,min,max,mean", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stats: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let tokens = &stats["results"]["Token Count"];
    assert_eq!(tokens["Number of Documents"], 2.0);
    assert_eq!(tokens["min"], 6.0);
    assert_eq!(tokens["max"], 9.0);
    assert_eq!(tokens["mean"], 7.5);
    assert!(stats["results"]["Named entity.value"].is_object());
}

#[test]
fn test_bad_query_fails() {
    let index_dir = TempDir::new().unwrap();
    let corpus = corpus_dir();

    let output = annodex(&index_dir, &["search", "\"unterminated", "--path", corpus.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("query parse error"));
}

#[test]
fn test_status_and_remove() {
    let index_dir = TempDir::new().unwrap();
    let corpus = corpus_dir();
    let corpus = corpus.to_str().unwrap();

    let output = annodex(&index_dir, &["index", corpus]);
    assert!(output.status.success());

    let output = annodex(&index_dir, &["status", corpus]);
    let text = stdout(&output);
    assert!(text.contains("Segments:  3"), "{}", text);
    assert!(text.contains("Failed:    0"));

    let output = annodex(&index_dir, &["remove", corpus]);
    assert!(stdout(&output).contains("Removed index for:"));
    let output = annodex(&index_dir, &["remove", corpus]);
    assert!(stdout(&output).contains("No index for:"));
}

#[test]
fn test_index_picks_up_changed_annotations() {
    let index_dir = TempDir::new().unwrap();
    let corpus_copy = tempfile::Builder::new().prefix("corpus").tempdir().unwrap();
    copy_corpus(corpus_copy.path());
    let corpus = corpus_copy.path().to_str().unwrap();

    let output = annodex(&index_dir, &["index", corpus]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let ann = corpus_copy.path().join("galicia.admin.ann.json");
    let edited = fs::read_to_string(&ann).unwrap().replace("LOC", "ORG");
    fs::write(&ann, edited).unwrap();

    let output = annodex(&index_dir, &["index", corpus]);
    assert!(output.status.success());

    let output = annodex(
        &index_dir,
        &["search", "<Named_entity.value=\"ORG\"/>", "--path", corpus, "--json"],
    );
    let results: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(results.as_array().unwrap().len(), 2);

    let output = annodex(
        &index_dir,
        &["search", "<Named_entity.value=\"LOC\"/>", "--path", corpus, "--json"],
    );
    let results: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert!(results.as_array().unwrap().is_empty());
}
