use std::fs::write;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

const PULL_REQUEST_POLICY: &str = r#"package pull_request

import future.keywords.contains
import future.keywords.if

# METADATA
# title: Pull request has a description
# custom:
#   tags: [documentation]
#   security-severity: 5.5
error_has_description if {
	not input.description
}

warn_large if {
	input.additions > 1000
}

skip contains ["large"] if {
	input.draft == true
}
"#;

fn policy_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path().join("pull_request.rego"), PULL_REQUEST_POLICY).unwrap();
    dir
}

fn repoaudit(policies: &Path) -> Command {
    let mut cmd = Command::cargo_bin("repoaudit").unwrap();
    for var in ["REPOAUDIT_FORMAT", "REPOAUDIT_NAMESPACE", "REPOAUDIT_MERGE", "RUST_LOG"] {
        cmd.env_remove(var);
    }
    cmd.env("REPOAUDIT_POLICY_PATHS", policies);
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

#[test]
fn sarif_reports_the_missing_description() {
    let dir = policy_dir();
    let doc = stdout_json(repoaudit(dir.path()).write_stdin(r#"{"base":"main","head":"feat"}"#));

    let run = &doc["runs"][0];
    let results = run["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["ruleId"], "pull_request/error/has_description");
    assert_eq!(results[0]["level"], "error");

    let rules = run["tool"]["driver"]["rules"].as_array().unwrap();
    assert_eq!(rules.len(), 2);
    let rule = &rules[results[0]["ruleIndex"].as_u64().unwrap() as usize];
    assert_eq!(rule["name"], "Pull request has a description");
    assert_eq!(rule["properties"]["security-severity"], "5.5");
    assert_eq!(rule["properties"]["tags"][0], "documentation");
}

#[test]
fn json_format_from_a_file() {
    let dir = policy_dir();
    let input = dir.path().join("pr.json");
    write(
        &input,
        r#"{"base":"main","head":"feat","description":"ok","additions":5000,"draft":true,"number":12}"#,
    )
    .unwrap();

    let doc = stdout_json(repoaudit(dir.path()).args(["-f", "json"]).arg(&input));

    assert_eq!(doc["ruleCount"], 2);
    assert_eq!(doc["properties"]["number"], 12);
    assert_eq!(doc["results"]["pull_request/warn/large"]["skipped"], true);
    assert_eq!(doc["results"]["pull_request/error/has_description"]["passed"], true);
}

#[test]
fn batches_merge_into_one_report() {
    let dir = policy_dir();
    let out = dir.path().join("report.json");
    repoaudit(dir.path())
        .args(["exec", "--format", "json", "--merge", "-o"])
        .arg(&out)
        .write_stdin(r#"[{"base":"a","head":"b"},{"base":"c","head":"d","description":"x"}]"#)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let doc: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert!(doc.is_object());
    assert_eq!(doc["ruleCount"], 2);
}

#[test]
fn unknown_records_fail_but_others_are_reported() {
    let dir = policy_dir();
    let doc = {
        let assert = repoaudit(dir.path())
            .args(["-f", "json"])
            .write_stdin(r#"[{"base":"a","head":"b"},{"nothing":"here"}]"#)
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("failed to detect namespace"));
        serde_json::from_slice::<Value>(&assert.get_output().stdout).unwrap()
    };
    assert_eq!(doc["ruleCount"], 2);
}

#[test]
fn forced_namespace_skips_detection() {
    let dir = policy_dir();
    let doc = stdout_json(
        repoaudit(dir.path())
            .arg("-p")
            .arg(dir.path().join("pull_request.rego"))
            .args(["-f", "json", "-n", "pull_request"])
            .write_stdin(r#"{"title":"no shape at all"}"#),
    );
    assert_eq!(doc["ruleCount"], 2);
}

#[test]
fn malformed_input_exits_with_failure() {
    let dir = policy_dir();
    repoaudit(dir.path())
        .write_stdin(r#"{"base": "#)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid input"));
}

#[test]
fn missing_policies_exit_with_failure() {
    let dir = tempfile::tempdir().unwrap();
    repoaudit(dir.path())
        .write_stdin("{}")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no policy .rego files"));
}

#[test]
fn concatenated_records_are_reported_in_order() {
    let dir = policy_dir();
    let doc = stdout_json(
        repoaudit(dir.path())
            .args(["-f", "json"])
            .write_stdin("{\"base\":\"a\",\"head\":\"b\",\"number\":1}\n[{\"base\":\"c\",\"head\":\"d\",\"number\":2}]\n{\"base\":\"e\",\"head\":\"f\",\"number\":3}\n"),
    );
    let numbers: Vec<_> = doc
        .as_array()
        .unwrap()
        .iter()
        .map(|report| report["properties"]["number"].clone())
        .collect();
    assert_eq!(numbers, vec![Value::from(1), Value::from(2), Value::from(3)]);
}

#[test]
fn malformed_tail_fails_the_whole_stream() {
    let dir = policy_dir();
    repoaudit(dir.path())
        .write_stdin("{\"base\":\"a\",\"head\":\"b\"}\n{\"base\": ")
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("invalid input"));
}
