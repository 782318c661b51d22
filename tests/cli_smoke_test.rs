//! CLI-level smoke tests: invoke the real `takt` binary end to end and
//! check its externally-visible behavior (stdout, exit code), not internal
//! state.

use assert_cmd::Command;
use predicates::prelude::*;

fn takt() -> Command {
    Command::cargo_bin("takt").expect("takt binary builds")
}

#[test]
fn task_add_then_list_round_trips_through_the_manifest_file() {
    let dir = tempfile::tempdir().unwrap();

    takt().current_dir(dir.path()).args(["task", "add", "fix-bug", "fix the thing"]).assert().success();

    takt()
        .current_dir(dir.path())
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fix-bug"));

    assert!(dir.path().join(".takt").join("tasks.yaml").is_file());
}

#[test]
fn task_add_rejects_a_duplicate_name() {
    let dir = tempfile::tempdir().unwrap();
    takt().current_dir(dir.path()).args(["task", "add", "ship-it", "ship the feature"]).assert().success();

    takt()
        .current_dir(dir.path())
        .args(["task", "add", "ship-it", "again"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn piece_validate_reports_a_missing_piece() {
    let dir = tempfile::tempdir().unwrap();
    takt()
        .current_dir(dir.path())
        .args(["piece", "validate", "does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
