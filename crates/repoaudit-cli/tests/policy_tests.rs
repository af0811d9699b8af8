use std::fs::write;

use assert_cmd::Command;
use predicates::prelude::*;

fn run_tests(policy: &str) -> assert_cmd::assert::Assert {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path().join("checks_test.rego"), policy).unwrap();
    Command::cargo_bin("repoaudit")
        .unwrap()
        .env_remove("RUST_LOG")
        .arg("test")
        .arg("-p")
        .arg(dir.path())
        .assert()
}

#[test]
fn passing_tests_exit_cleanly() {
    run_tests(
        r#"package checks

import future.keywords.if

error_missing_title if { not input.title }

test_counts_items if {
	count(["a", "b"]) == 2
}
"#,
    )
    .success()
    .stdout(predicate::str::contains("PASS  data.checks.test_counts_items"))
    .stdout(predicate::str::contains("1/1 test(s) passed"));
}

#[test]
fn failing_tests_exit_with_failure() {
    run_tests(
        r#"package checks

import future.keywords.if

error_missing_title if { not input.title }

test_bad_arithmetic if {
	1 + 1 == 3
}

test_trivially_true if { true }
"#,
    )
    .failure()
    .code(1)
    .stdout(predicate::str::contains("FAIL  data.checks.test_bad_arithmetic"))
    .stdout(predicate::str::contains("1/2 test(s) passed"));
}
