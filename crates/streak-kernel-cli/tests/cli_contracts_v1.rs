#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde_json::Value;
use ulid::Ulid;

const FIRST_WINDOW: &str = "3,2,1,6,5,0,12,11,10,9,8,7";
const EXTENDED_WINDOW: &str = "4,3,2,1,6,5,0,12,11,10,9,8,7";

fn sk_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_sk") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/sk");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "streak-kernel-cli", "--bin", "sk"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build sk binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_history_path() -> PathBuf {
    std::env::temp_dir().join(format!("sk-cli-contract-{}.json", Ulid::new()))
}

fn sk_command(history: &Path, args: &[&str]) -> Command {
    let mut command = Command::new(sk_binary_path());
    command
        .env_remove("STREAK_TELEGRAM_BOT_TOKEN")
        .env_remove("STREAK_TELEGRAM_CHAT_ID")
        .env("RUST_LOG", "warn")
        .arg("--history")
        .arg(history);
    for arg in args {
        command.arg(arg);
    }
    command
}

fn sk_output(history: &Path, args: &[&str]) -> Output {
    match sk_command(history, args).output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sk command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn read_store(path: &Path) -> Value {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    };
    match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("store file is not JSON: {err}\n{body}"),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(sk_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["evaluate", "watch", "sweep", "history", "ruleset"] {
        assert!(
            stdout.contains(required),
            "missing subcommand {required} in help output:\n{stdout}"
        );
    }
}

#[test]
fn evaluate_contract_records_completed_streak_and_announces_active_run() {
    let history = temp_history_path();
    let output = sk_output(&history, &["evaluate", "--window", FIRST_WINDOW]);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report = stdout_json(&output);
    assert_eq!(report["window_len"], 12);
    assert_eq!(
        report["highlight_positions"],
        serde_json::json!([0, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11])
    );
    assert_eq!(report["active"]["positions"], serde_json::json!([0, 1, 2, 3, 4]));
    assert_eq!(report["active"]["length"], 5);
    assert_eq!(report["active"]["group"], 1);

    assert_eq!(report["inserts"][0]["outcome"]["outcome"], "inserted");
    assert_eq!(report["inserts"][0]["persisted"], true);
    assert_eq!(report["events"][0]["kind"], "start");
    assert_eq!(report["events"][0]["length"], 5);

    let stored = read_store(&history);
    let records = match stored.as_array() {
        Some(records) => records,
        None => panic!("store file must be an array: {stored}"),
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["sequence"], "7, 8, 9, 10, 11, 12");
    assert_eq!(records[0]["group"], 2);
    assert_eq!(records[0]["length"], 6);
    assert_eq!(records[0]["startValue"], 7);
    assert_eq!(records[0]["endValue"], 12);

    let again = sk_output(&history, &["evaluate", "--window", EXTENDED_WINDOW]);
    assert!(again.status.success());
    let report = stdout_json(&again);
    assert_eq!(
        report["inserts"][0]["outcome"]["outcome"],
        "rejected_duplicate"
    );
    assert_eq!(report["history"].as_array().map(Vec::len), Some(1));

    let _ = fs::remove_file(&history);
}

#[test]
fn evaluate_contract_rejects_malformed_window() {
    let history = temp_history_path();
    let output = sk_output(&history, &["evaluate", "--window", "3,x,4"]);
    assert!(!output.status.success());
    assert!(!history.exists());
}

#[test]
fn sweep_once_contract_consolidates_contained_records() {
    let history = temp_history_path();
    let seeded = serde_json::json!([
        {"sequence": "2, 3, 4, 5, 6", "group": 1, "length": 5, "startNum": 2, "endNum": 6, "ts": 300},
        {"sequence": "1, 2, 3, 4, 5, 6", "group": 1, "length": 6, "startValue": 1, "endValue": 6, "timestamp": 200},
        {"sequence": "7, 8, 9, 10, 11", "group": 2, "length": 5, "startValue": 7, "endValue": 11, "timestamp": 100},
        {"sequence": "not numbers", "group": 2, "length": 5, "startValue": 7, "endValue": 11, "timestamp": 50}
    ]);
    if let Err(err) = fs::write(&history, seeded.to_string()) {
        panic!("failed to seed history: {err}");
    }

    let output = sk_output(&history, &["sweep", "--once"]);
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report = stdout_json(&output);
    assert_eq!(report["status"], "loaded");
    assert_eq!(report["loaded"], 3);
    assert_eq!(report["dropped"], 1);
    assert_eq!(report["kept"], 2);
    assert_eq!(report["rewritten"], true);

    let stored = read_store(&history);
    assert_eq!(stored[0]["sequence"], "1, 2, 3, 4, 5, 6");
    assert_eq!(stored[1]["sequence"], "7, 8, 9, 10, 11");

    let quiet = stdout_json(&sk_output(&history, &["sweep", "--once"]));
    assert_eq!(quiet["rewritten"], false);

    let _ = fs::remove_file(&history);
}

#[test]
fn sweep_once_contract_ignores_missing_file() {
    let history = temp_history_path();
    let output = sk_output(&history, &["sweep", "--once"]);
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["status"], "missing");
    assert_eq!(report["rewritten"], false);
    assert!(!history.exists());
}

#[test]
fn history_list_and_clear_contract() {
    let history = temp_history_path();
    let seeded = serde_json::json!([
        {"sequence": "1, 2, 3, 4, 5", "group": 1, "length": 5, "startValue": 1, "endValue": 5, "timestamp": 300},
        {"sequence": "7, 8, 9, 10, 11, 12", "group": 2, "length": 6, "startValue": 7, "endValue": 12, "timestamp": 200}
    ]);
    if let Err(err) = fs::write(&history, seeded.to_string()) {
        panic!("failed to seed history: {err}");
    }

    let listed = stdout_json(&sk_output(
        &history,
        &["history", "list", "--length", "6", "--json"],
    ));
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    assert_eq!(listed[0]["sequence"], "7, 8, 9, 10, 11, 12");

    let table = sk_output(&history, &["history", "list"]);
    assert!(table.status.success());
    let stdout = String::from_utf8_lossy(&table.stdout);
    assert!(stdout.contains("recorded_at"));
    assert!(stdout.contains("1, 2, 3, 4, 5"));

    let cleared = stdout_json(&sk_output(&history, &["history", "clear"]));
    assert_eq!(cleared["removed"], true);
    assert!(!history.exists());

    let empty = stdout_json(&sk_output(&history, &["history", "list", "--json"]));
    assert_eq!(empty, serde_json::json!([]));
}

#[test]
fn ruleset_show_contract_prints_v1_defaults() {
    let history = temp_history_path();
    let ruleset = stdout_json(&sk_output(&history, &["ruleset", "show"]));
    assert_eq!(ruleset["ruleset_version"], 1);
    assert_eq!(ruleset["min_streak"], 5);
    assert_eq!(ruleset["window_size"], 200);
    assert_eq!(ruleset["max_history"], 1000);
    assert_eq!(ruleset["display_limit"], 200);
    assert_eq!(ruleset["groups"]["1"].as_array().map(Vec::len), Some(18));
    assert_eq!(ruleset["groups"]["2"].as_array().map(Vec::len), Some(18));
}

#[test]
fn watch_contract_emits_one_report_per_stdin_line() {
    let history = temp_history_path();
    let mut child = match sk_command(&history, &["watch", "--no-sweep"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => panic!("failed to spawn sk watch: {err}"),
    };

    {
        let Some(stdin) = child.stdin.as_mut() else {
            panic!("sk watch stdin not captured");
        };
        let lines = format!("{FIRST_WINDOW}\nnot a window\n{EXTENDED_WINDOW}\n");
        if let Err(err) = stdin.write_all(lines.as_bytes()) {
            panic!("failed to write windows: {err}");
        }
    }
    drop(child.stdin.take());

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(err) => panic!("failed to wait for sk watch: {err}"),
    };
    assert!(
        output.status.success(),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let reports: Vec<Value> = stdout
        .lines()
        .map(|line| match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => panic!("report line is not JSON: {err}\n{line}"),
        })
        .collect();
    assert_eq!(reports.len(), 2);

    assert_eq!(reports[0]["events"][0]["kind"], "start");
    assert_eq!(reports[0]["events"][0]["length"], 5);
    assert_eq!(reports[1]["events"][0]["kind"], "extension");
    assert_eq!(reports[1]["events"][0]["length"], 6);
    assert_eq!(
        reports[1]["inserts"][0]["outcome"]["outcome"],
        "rejected_duplicate"
    );

    let _ = fs::remove_file(&history);
}
