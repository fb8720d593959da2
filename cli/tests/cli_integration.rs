//! Binary-level smoke tests for the `editor-fleet` CLI.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("editor-fleet")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("dispatcher"))
        .stdout(predicate::str::contains("node"))
        .stdout(predicate::str::contains("submit"));
}

#[test]
fn version_flag_works() {
    Command::cargo_bin("editor-fleet")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("editor-fleet"));
}

#[test]
fn invalid_payload_json_exits_with_config_error() {
    Command::cargo_bin("editor-fleet")
        .unwrap()
        .args(["submit", "open_file", "--payload", "{not json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("payload"));
}

#[test]
fn unreachable_dispatcher_exits_with_code_2() {
    // Nothing listens on port 1.
    Command::cargo_bin("editor-fleet")
        .unwrap()
        .args(["status", "job-1", "--dispatcher", "http://127.0.0.1:1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unreachable"));
}

#[test]
fn completions_generate() {
    Command::cargo_bin("editor-fleet")
        .unwrap()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("editor-fleet"));
}
