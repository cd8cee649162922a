use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use serde_json::Value;
use streak_kernel_core::{CategoryClassifier, StreakRuleset, Window};
use streak_kernel_store_json::{HistoryStore, LiveEvaluator};
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn compile_schema() -> JSONSchema {
    let schema_path = repo_root().join("contracts/history/v1/streak-history.schema.json");
    let schema = read_json(&schema_path);
    JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()))
}

fn assert_valid(compiled: &JSONSchema, value: &Value) {
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!("schema validation failed:\n{}", errors.join("\n"));
    }
}

fn temp_history_path() -> PathBuf {
    std::env::temp_dir().join(format!("sk-integration-{}.json", Ulid::new()))
}

#[test]
fn written_history_matches_store_schema() {
    let path = temp_history_path();
    let mut evaluator = LiveEvaluator::new(StreakRuleset::v1(), &path)
        .unwrap_or_else(|err| panic!("failed to open evaluator: {err:#}"));

    // Two completed streaks, one per group, separated by a neutral zero.
    let report = evaluator.evaluate(&[0, 20, 19, 18, 17, 16, 0, 12, 11, 10, 9, 8, 7, 0]);
    assert_eq!(report.inserts.len(), 2);
    assert!(report.inserts.iter().all(|insert| insert.persisted));

    let written = read_json(&path);
    assert_eq!(written.as_array().map(Vec::len), Some(2));
    assert_valid(&compile_schema(), &written);

    let _ = fs::remove_file(&path);
}

#[test]
fn legacy_field_names_load_but_are_rewritten_in_current_shape() {
    let path = temp_history_path();
    let legacy = serde_json::json!([
        {"sequence": "1, 2, 3, 4, 5", "group": 1, "length": 5, "startNum": 1, "endNum": 5, "ts": 1000}
    ]);
    let compiled = compile_schema();
    assert!(!compiled.is_valid(&legacy));

    fs::write(&path, legacy.to_string())
        .unwrap_or_else(|err| panic!("failed to seed {}: {err}", path.display()));

    let store = HistoryStore::open(&path, 1000);
    assert_eq!(store.records().len(), 1);
    store
        .save()
        .unwrap_or_else(|err| panic!("failed to save: {err:#}"));
    assert_valid(&compiled, &read_json(&path));

    let _ = fs::remove_file(&path);
}

#[test]
fn schema_rejects_neutral_group_and_unspaced_sequence() {
    let compiled = compile_schema();
    let neutral = serde_json::json!([
        {"sequence": "1, 2, 3, 4, 5", "group": 0, "length": 5, "startValue": 1, "endValue": 5, "timestamp": 1}
    ]);
    let unspaced = serde_json::json!([
        {"sequence": "1,2,3,4,5", "group": 1, "length": 5, "startValue": 1, "endValue": 5, "timestamp": 1}
    ]);
    assert!(!compiled.is_valid(&neutral));
    assert!(!compiled.is_valid(&unspaced));

    // Every value the v1 ruleset classifies lands in a schema-valid group.
    let ruleset = StreakRuleset::v1();
    let classifier = CategoryClassifier::from_ruleset(&ruleset)
        .unwrap_or_else(|err| panic!("v1 ruleset must be valid: {err}"));
    let window = Window::from_newest_first(&[36, 35, 34], ruleset.window_size, &classifier);
    assert!(window
        .outcomes()
        .iter()
        .all(|outcome| !outcome.group.is_neutral()));
}
